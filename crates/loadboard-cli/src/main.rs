//! Loadboard CLI - command-line access to the freight back-office API.
//!
//! Signs in, keeps the session in the OS keychain (or a session file) and
//! issues authenticated requests. Expired tokens are renewed transparently.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use loadboard_core::api::{ApiClient, RequestDescriptor, Response};
use loadboard_core::auth::{KeyValueStore, MemoryStore};
use loadboard_core::config::{Config, APP_NAME};
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Constants
// ============================================================================

/// Overrides the configured API base URL
const BASE_URL_ENV: &str = "LOADBOARD_BASE_URL";

/// Password used by `login` instead of prompting
const PASSWORD_ENV: &str = "LOADBOARD_PASSWORD";

/// Directory for a daily rolling log file
const LOG_DIR_ENV: &str = "LOADBOARD_LOG_DIR";

const USAGE: &str = "\
Usage: loadboard [--ephemeral] <command>

Commands:
  login [username]      Sign in and store the session
  logout                Forget the stored session
  status                Show whether a session is stored
  get <path>            GET a path and print the response
  post <path> <json>    POST a JSON body and print the response

Options:
  --ephemeral           Keep the session in memory for this run only";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(LOG_DIR_ENV) {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, format!("{}.log", APP_NAME));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[derive(Debug)]
enum Command {
    Login(Option<String>),
    Logout,
    Status,
    Get(String),
    Post(String, String),
}

struct Args {
    ephemeral: bool,
    command: Command,
}

fn parse_args(args: &[String]) -> Result<Args> {
    let mut ephemeral = false;
    let mut rest = Vec::new();
    for arg in args {
        if arg == "--ephemeral" {
            ephemeral = true;
        } else {
            rest.push(arg.as_str());
        }
    }

    let command = match rest.as_slice() {
        ["login"] => Command::Login(None),
        ["login", username] => Command::Login(Some(username.to_string())),
        ["logout"] => Command::Logout,
        ["status"] => Command::Status,
        ["get", path] => Command::Get(path.to_string()),
        ["post", path, body] => Command::Post(path.to_string(), body.to_string()),
        _ => bail!("{}", USAGE),
    };

    Ok(Args { ephemeral, command })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&argv)?;

    let mut config = Config::load().unwrap_or_else(|e| {
        debug!(error = %e, "Failed to load config, using defaults");
        Config::default()
    });
    if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
        config.base_url = base_url;
    }

    let backend: Arc<dyn KeyValueStore> = if args.ephemeral {
        Arc::new(MemoryStore::new())
    } else {
        config.open_backend()?
    };

    let client = ApiClient::from_config(&config, backend)?;
    client.on_session_invalidated(|reason| {
        eprintln!("Session expired ({}). Run `loadboard login` to sign in again.", reason.failure);
    });

    info!(command = ?args.command, base_url = %config.base_url, "loadboard starting");

    match args.command {
        Command::Login(username) => login(&client, &mut config, username).await,
        Command::Logout => {
            client.sign_out();
            println!("Signed out.");
            Ok(())
        }
        Command::Status => {
            if client.is_authenticated() {
                println!("Signed in to {}", config.base_url);
            } else {
                println!("Not signed in.");
            }
            Ok(())
        }
        Command::Get(path) => {
            let response = client.request(RequestDescriptor::get(path)).await?;
            print_response(&response)
        }
        Command::Post(path, body) => {
            let body: serde_json::Value =
                serde_json::from_str(&body).context("Request body is not valid JSON")?;
            let response = client.request(RequestDescriptor::post(path).json(&body)?).await?;
            print_response(&response)
        }
    }
}

async fn login(client: &ApiClient, config: &mut Config, username: Option<String>) -> Result<()> {
    let username = match username.or_else(|| config.last_username.clone()) {
        Some(username) => username,
        None => prompt_username()?,
    };
    if username.is_empty() {
        bail!("Username required");
    }

    let password = match std::env::var(PASSWORD_ENV) {
        Ok(password) => password,
        Err(_) => rpassword::prompt_password(format!("Password for {}: ", username))?,
    };

    eprintln!("Authenticating...");
    client
        .sign_in(&username, &password)
        .await
        .map_err(|e| match e.status() {
            Some(401) => anyhow::anyhow!("Invalid username or password"),
            _ if e.category() == loadboard_core::api::ErrorCategory::Transport => {
                anyhow::anyhow!("Unable to connect to server: {}", e)
            }
            _ => anyhow::anyhow!("Login failed: {}", e),
        })?;

    config.last_username = Some(username);
    if let Err(e) = config.save() {
        debug!(error = %e, "Failed to save config");
    }

    println!("Login successful!");
    Ok(())
}

fn prompt_username() -> Result<String> {
    print!("Username: ");
    io::stdout().flush()?;

    let mut username = String::new();
    io::stdin().read_line(&mut username)?;
    Ok(username.trim().to_string())
}

fn print_response(response: &Response) -> Result<()> {
    match response.json::<serde_json::Value>() {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{}", response.text()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_login_with_username() {
        let parsed = parse_args(&args(&["login", "dispatch"])).unwrap();
        assert!(!parsed.ephemeral);
        assert!(matches!(parsed.command, Command::Login(Some(ref u)) if u == "dispatch"));
    }

    #[test]
    fn test_parse_ephemeral_anywhere() {
        let parsed = parse_args(&args(&["get", "--ephemeral", "/loads"])).unwrap();
        assert!(parsed.ephemeral);
        assert!(matches!(parsed.command, Command::Get(ref p) if p == "/loads"));
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!(parse_args(&args(&["frobnicate"])).is_err());
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["post", "/loads"])).is_err());
    }
}
