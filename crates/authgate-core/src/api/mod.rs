//! REST plumbing for the session core.
//!
//! - `Transport`: the request/response capability (reqwest in production)
//! - `AuthApi`: calls to the `/auth/*` endpoints
//! - `RequestGate`: wraps every business call with credential attachment
//!   and transparent renewal
//!
//! Authenticated calls use `Authorization: Bearer <access_token>`.

pub mod client;
pub mod error;
pub mod gate;
pub mod transport;

pub use client::{AuthApi, LoginGrant, Registration};
pub use error::{ApiError, AuthError, TransportError};
pub use gate::RequestGate;
pub use transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport};
