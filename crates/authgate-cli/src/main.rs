//! authgate - command-line client for a token-authenticated REST service.
//!
//! Logs in, keeps the session between runs, and makes authenticated calls
//! that renew the access token transparently.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use authgate_core::{
    ApiError, ApiRequest, Config, LogNavigator, NavigationGuard, RequestGate, ReqwestTransport, RouteTable,
    SessionManager, StorageKind, Transport,
};

// ============================================================================
// Constants
// ============================================================================

/// Directory for daily log files; logs go to stderr when unset
const ENV_LOG_DIR: &str = "AUTHGATE_LOG_DIR";

/// Password for non-interactive login
const ENV_PASSWORD: &str = "AUTHGATE_PASSWORD";

const LOG_FILE_PREFIX: &str = "authgate.log";

const USAGE: &str = "\
Usage: authgate <command> [args]

Commands:
  login [username]   Log in and store the session
  logout             End the session and clear stored credentials
  status             Show the current session
  get <path> [k=v]   Authenticated GET with optional query parameters,
                     prints the JSON response
  route <path>       Show whether navigation to <path> is allowed

Environment:
  AUTHGATE_BASE_URL   Service base URL
  AUTHGATE_STORAGE    file | keyring | memory
  AUTHGATE_PASSWORD   Password for non-interactive login
  AUTHGATE_LOG_DIR    Write logs to daily files in this directory
  RUST_LOG            Log filter (default: warn)";

/// Initialize the tracing subscriber for logging.
///
/// The returned guard flushes the file writer and must live until exit.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match std::env::var(ENV_LOG_DIR).ok().filter(|dir| !dir.trim().is_empty()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

/// The wired session core.
struct App {
    config: Config,
    session: SessionManager,
    gate: RequestGate,
    guard: NavigationGuard,
}

impl App {
    fn new(config: Config) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(
            ReqwestTransport::new(&config.base_url, config.request_timeout())
                .context("Failed to create HTTP client")?,
        );
        let store = config
            .credential_store()
            .context("Failed to open credential storage")?;

        let session = SessionManager::new(
            transport.clone(),
            store,
            Arc::new(LogNavigator),
            config.session_settings(),
        );
        let gate = RequestGate::new(session.clone(), transport);
        let guard = NavigationGuard::new(session.clone(), RouteTable::standard(), config.landing_pages());

        Ok(Self {
            config,
            session,
            gate,
            guard,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        println!("{}", USAGE);
        return Ok(());
    };
    if matches!(command, "help" | "--help" | "-h") {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = Config::load()?;
    info!(base_url = %config.base_url, storage = %config.storage, "authgate starting");
    let mut app = App::new(config)?;

    match command {
        "login" => login(&mut app, args.get(1).map(String::as_str)).await,
        "logout" => {
            app.session.logout();
            println!("Logged out");
            Ok(())
        }
        "status" => {
            status(&app);
            Ok(())
        }
        "get" => {
            let path = args.get(1).context("Usage: authgate get <path> [key=value ...]")?;
            get(&app, path, &args[2..]).await
        }
        "route" => {
            let path = args.get(1).context("Usage: authgate route <path>")?;
            let route = app.guard.table().resolve(path);
            println!("{} -> {}", route.path, app.guard.decide(&route));
            Ok(())
        }
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }
}

async fn login(app: &mut App, username: Option<&str>) -> Result<()> {
    let username = match username.map(str::to_string).or_else(|| app.config.last_username.clone()) {
        Some(name) => name,
        None => prompt("Username: ")?,
    };
    let password = match std::env::var(ENV_PASSWORD) {
        Ok(password) => password,
        Err(_) => rpassword::prompt_password(format!("Password for {}: ", username))
            .context("Failed to read password")?,
    };

    let identity = app.session.login(&username, &password).await?;
    println!(
        "Logged in as {}{}",
        identity.subject,
        if identity.is_admin { " (admin)" } else { "" }
    );
    if app.config.storage == StorageKind::Memory {
        println!("Note: memory storage is configured, the session ends with this process");
    }

    app.config.last_username = Some(username);
    if let Err(e) = app.config.save() {
        tracing::warn!(error = %e, "Failed to save config");
    }
    Ok(())
}

fn status(app: &App) {
    let state = app.session.state();
    println!("Session:  {}", state);
    if let Some(identity) = state.identity() {
        println!("Role:     {}", if identity.is_admin { "admin" } else { "user" });
        if let Some(email) = identity.attribute_str("email") {
            println!("Email:    {}", email);
        }
    }
    if let Some(credential) = app.session.credential() {
        println!("Token:    issued {} min ago", credential.age_minutes());
    }
    println!("Server:   {}", app.config.base_url);
    println!("Storage:  {}", app.config.storage);
}

async fn get(app: &App, path: &str, params: &[String]) -> Result<()> {
    let mut request = ApiRequest::get(path);
    for param in params {
        let (key, value) = param
            .split_once('=')
            .with_context(|| format!("Query parameter '{}' must be key=value", param))?;
        request = request.with_query(key, value);
    }

    match app.gate.execute(request).await.and_then(|response| response.json::<Value>()) {
        Ok(body) => {
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        Err(ApiError::SessionExpired) => {
            bail!("Session expired, run `authgate login` to sign in again")
        }
        Err(e) => Err(e.into()),
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let value = line.trim().to_string();
    if value.is_empty() {
        bail!("No username given");
    }
    Ok(value)
}
