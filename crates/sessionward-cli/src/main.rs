//! sessionward - sign in, inspect and use a persisted API session from a terminal.
//!
//! Every invocation restores the stored session first, exactly as a UI client
//! would at startup, then runs one command against it.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use reqwest::Method;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sessionward_core::auth::{HttpIdentityExchange, ProviderCredential};
use sessionward_core::{install_global, Config, GateDecision, RouteNavigator, SessionManager};

const USAGE: &str = "\
Usage: sessionward <command>

Commands:
  status              Show the current session
  login [--dev]       Sign in with a Google ID token (or developer bypass)
  login --code <code> Sign in with an authorization code
  logout              Revoke and clear the session
  refresh             Rotate the session credentials now
  get <path>          GET a protected API path and print the response";

/// Log file name prefix inside the cache directory
const LOG_FILE_PREFIX: &str = "sessionward.log";

enum Command {
    Status,
    Login(LoginMethod),
    Logout,
    Refresh,
    Get(String),
}

enum LoginMethod {
    IdToken,
    Code(String),
    Dev,
}

fn parse_args(args: &[String]) -> Result<Command> {
    let rest: Vec<&str> = args.iter().skip(1).map(String::as_str).collect();
    match rest.as_slice() {
        [] | ["status"] => Ok(Command::Status),
        ["login"] => Ok(Command::Login(LoginMethod::IdToken)),
        ["login", "--dev"] => Ok(Command::Login(LoginMethod::Dev)),
        ["login", "--code", code] => Ok(Command::Login(LoginMethod::Code(code.to_string()))),
        ["logout"] => Ok(Command::Logout),
        ["refresh"] => Ok(Command::Refresh),
        ["get", path] => Ok(Command::Get(path.to_string())),
        _ => bail!("{}", USAGE),
    }
}

/// Initialize the tracing subscriber for logging
///
/// Stderr gets the `RUST_LOG` filter (default `warn`); when a cache directory
/// is available a daily rolling file receives the same events.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

/// Create the log directory; file logging is skipped when this fails.
fn prepare_log_dir(dir: PathBuf) -> Result<PathBuf> {
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Could not create log directory {}", dir.display()))?;
    Ok(dir)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().collect();
    let command = parse_args(&args)?;

    let config = Config::load().context("Failed to load configuration")?;
    let (log_dir, log_dir_error) = match config.cache_dir() {
        Ok(dir) => match prepare_log_dir(dir) {
            Ok(dir) => (Some(dir), None),
            Err(e) => (None, Some(e)),
        },
        Err(_) => (None, None),
    };
    let _guard = init_tracing(log_dir.as_deref());
    if let Some(error) = log_dir_error {
        warn!(error = %format!("{error:#}"), "File logging disabled");
    }
    info!(strategy = ?config.strategy, storage = ?config.storage, "sessionward starting");

    // Signing in happens on the sign-in surface, where restore is skipped.
    let navigator = Arc::new(RouteNavigator::new(config.sign_in_route.clone()));
    if matches!(command, Command::Login(_)) {
        navigator.navigate(config.sign_in_route.clone());
    }

    let manager = install_global(SessionManager::new(&config, navigator.clone())?);
    manager.bootstrap().await;

    match command {
        Command::Status => status(&manager),
        Command::Login(method) => login(&manager, &config, method).await?,
        Command::Logout => {
            manager.sign_out().await?;
            println!("Signed out.");
        }
        Command::Refresh => {
            manager
                .refresh()
                .await
                .context("Refresh failed; sign in again with `sessionward login`")?;
            println!("Session refreshed.");
        }
        Command::Get(path) => get(&manager, &path).await?,
    }

    Ok(())
}

fn status(manager: &SessionManager) {
    println!("Strategy: {:?}", manager.strategy_kind());
    println!("State:    {:?}", manager.state());
    match manager.principal() {
        Some(principal) => {
            println!("User:     {}", principal.display_name());
            if let Some(email) = principal.email.as_deref() {
                println!("Email:    {}", email);
            }
        }
        None => println!("User:     -"),
    }
    if let Some(at) = manager.session().authenticated_at {
        println!("Since:    {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if manager.gate() == GateDecision::RedirectToSignIn {
        println!("\nNot signed in. Run `sessionward login`.");
    }
}

async fn login(manager: &SessionManager, config: &Config, method: LoginMethod) -> Result<()> {
    let credential = match method {
        LoginMethod::Dev => ProviderCredential::DevBypass,
        LoginMethod::Code(code) => ProviderCredential::AuthorizationCode(code),
        LoginMethod::IdToken => {
            let token = rpassword::prompt_password("Google ID token: ")?;
            if token.trim().is_empty() {
                bail!("An ID token is required");
            }
            ProviderCredential::IdToken(token.trim().to_string())
        }
    };

    let exchange = HttpIdentityExchange::new(
        config.http_client()?,
        &config.api_base_url,
        config.allow_dev_bypass,
    );
    manager.sign_in_with(&exchange, credential).await?;

    let name = manager
        .principal()
        .map(|p| p.display_name().to_string())
        .unwrap_or_else(|| "user".to_string());
    println!("Signed in as {}.", name);
    Ok(())
}

async fn get(manager: &SessionManager, path: &str) -> Result<()> {
    let client = manager.client();
    let response = client
        .execute(client.request(Method::GET, path))
        .await
        .with_context(|| format!("GET {} failed", path))?;

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let rendered = serde_json::from_str::<serde_json::Value>(&body)
        .and_then(|json| serde_json::to_string_pretty(&json))
        .unwrap_or(body);

    println!("{}", status);
    println!("{}", rendered);
    if !status.is_success() {
        bail!("Request failed with status {}", status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("sessionward")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_args() {
        assert!(matches!(parse_args(&args(&[])).unwrap(), Command::Status));
        assert!(matches!(
            parse_args(&args(&["login", "--dev"])).unwrap(),
            Command::Login(LoginMethod::Dev)
        ));
        assert!(matches!(
            parse_args(&args(&["login", "--code", "abc"])).unwrap(),
            Command::Login(LoginMethod::Code(ref c)) if c == "abc"
        ));
        assert!(matches!(
            parse_args(&args(&["get", "/api/me"])).unwrap(),
            Command::Get(ref p) if p == "/api/me"
        ));
        assert!(parse_args(&args(&["get"])).is_err());
        assert!(parse_args(&args(&["frobnicate"])).is_err());
    }

    #[test]
    fn test_prepare_log_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("cache").join("sessionward");
        assert_eq!(prepare_log_dir(nested.clone()).unwrap(), nested);
        assert!(nested.is_dir());

        // A regular file where a parent directory should be
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        assert!(prepare_log_dir(blocker.join("logs")).is_err());
    }
}
