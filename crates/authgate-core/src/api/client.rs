//! Calls to the authentication endpoints.
//!
//! These go straight to the transport and never through the request gate:
//! a rejected login or refresh is an answer, not a reason to renew.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::auth::{Credential, Identity};

use super::error::{server_message, AuthError, LOGIN_FAILED_MESSAGE};
use super::transport::{ApiRequest, ApiResponse, Transport};

// ============================================================================
// Endpoints
// ============================================================================

const LOGIN_PATH: &str = "/auth/login";
const REFRESH_PATH: &str = "/auth/refresh";
const REGISTER_PATH: &str = "/auth/register";
const FORGOT_PASSWORD_PATH: &str = "/auth/forgot-password";
const RESET_PASSWORD_PATH: &str = "/auth/reset-password";
const VERIFY_EMAIL_PATH: &str = "/auth/verify-email";
const RESEND_VERIFICATION_PATH: &str = "/auth/resend-verification";

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
    refresh_token: String,
    user: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    /// Servers that rotate refresh tokens send a new one
    #[serde(default)]
    refresh_token: Option<String>,
}

/// A successful login: the new credential and who it belongs to.
#[derive(Debug, Clone)]
pub struct LoginGrant {
    pub credential: Credential,
    pub identity: Identity,
}

/// Tokens returned by a successful refresh.
#[derive(Debug, Clone)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Sign-up payload. Extra fields are passed through untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Client for the `/auth/*` endpoints.
/// Clone is cheap - the transport is shared.
#[derive(Clone)]
pub struct AuthApi {
    transport: Arc<dyn Transport>,
}

impl AuthApi {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Exchange a username (or email) and password for a credential.
    ///
    /// The body is always JSON `{username, password}`.
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginGrant, AuthError> {
        let request = ApiRequest::post(
            LOGIN_PATH,
            json!({ "username": username, "password": password }),
        );
        let response = self.transport.send(request).await?;

        if !response.is_success() {
            let message = server_message(&response.text());
            debug!(status = response.status, "Login rejected");
            return Err(match response.status {
                403 => AuthError::Forbidden(
                    message.unwrap_or_else(|| LOGIN_FAILED_MESSAGE.to_string()),
                ),
                400..=499 => AuthError::InvalidCredentials(
                    message.unwrap_or_else(|| LOGIN_FAILED_MESSAGE.to_string()),
                ),
                status => AuthError::NetworkError(
                    message.unwrap_or_else(|| format!("Server returned status {}", status)),
                ),
            });
        }

        let body: LoginResponse = response.json().map_err(|e| {
            warn!(error = %e, "Failed to parse login response");
            AuthError::NetworkError("Unexpected response from server".to_string())
        })?;

        Ok(LoginGrant {
            credential: Credential::new(body.access_token, body.refresh_token),
            identity: Identity::from_user_payload(body.user),
        })
    }

    /// Exchange a refresh token for a new access token.
    ///
    /// Any non-success status means the refresh token is no longer valid.
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, AuthError> {
        let request = ApiRequest::post(REFRESH_PATH, json!({ "refresh_token": refresh_token }));
        let response = self.transport.send(request).await?;

        if !response.is_success() {
            debug!(status = response.status, "Refresh token rejected");
            return Err(AuthError::SessionExpired);
        }

        let body: RefreshResponse = response.json().map_err(|e| {
            warn!(error = %e, "Failed to parse refresh response");
            AuthError::SessionExpired
        })?;

        Ok(RefreshedTokens {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
        })
    }

    pub async fn register(&self, registration: &Registration) -> Result<String, AuthError> {
        let body = serde_json::to_value(registration)
            .map_err(|e| AuthError::Rejected(format!("Invalid registration: {}", e)))?;
        self.account_request(
            REGISTER_PATH,
            body,
            "Registration successful, please check your email to verify your account",
            "Registration failed",
        )
        .await
    }

    pub async fn forgot_password(&self, email: &str) -> Result<String, AuthError> {
        self.account_request(
            FORGOT_PASSWORD_PATH,
            json!({ "email": email }),
            "A reset link has been sent to your email",
            "Failed to send reset link",
        )
        .await
    }

    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<String, AuthError> {
        self.account_request(
            RESET_PASSWORD_PATH,
            json!({ "token": token, "new_password": new_password }),
            "Password reset successful",
            "Password reset failed",
        )
        .await
    }

    pub async fn verify_email(&self, token: &str) -> Result<String, AuthError> {
        self.account_request(
            VERIFY_EMAIL_PATH,
            json!({ "token": token }),
            "Email verified",
            "Verification failed",
        )
        .await
    }

    pub async fn resend_verification(&self, email: &str) -> Result<String, AuthError> {
        self.account_request(
            RESEND_VERIFICATION_PATH,
            json!({ "email": email }),
            "Verification email sent",
            "Failed to send verification email",
        )
        .await
    }

    /// Anonymous account flow returning the server's message on success.
    async fn account_request(
        &self,
        path: &str,
        body: Value,
        success: &str,
        failure: &str,
    ) -> Result<String, AuthError> {
        let response = self.transport.send(ApiRequest::post(path, body)).await?;
        Self::account_outcome(&response, success, failure)
    }

    fn account_outcome(
        response: &ApiResponse,
        success: &str,
        failure: &str,
    ) -> Result<String, AuthError> {
        let message = server_message(&response.text());
        match response.status {
            200..=299 => Ok(message.unwrap_or_else(|| success.to_string())),
            500..=599 => Err(AuthError::NetworkError(
                message.unwrap_or_else(|| failure.to_string()),
            )),
            _ => Err(AuthError::Rejected(message.unwrap_or_else(|| failure.to_string()))),
        }
    }
}
