//! SkyWings CLI - a command-line frontend for the SkyWings booking API.
//!
//! Signs in, keeps the session's tokens fresh, and issues raw authenticated
//! requests against the flight, booking and payment services.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use skywings_core::storage::{EncryptedFileStore, KeyValueStore, KeychainStore, NamespacedStore};
use skywings_core::{ApiClient, ApiError, CancellationToken, ClientConfig, RequestDescriptor};

// ============================================================================
// Constants
// ============================================================================

/// Environment variable holding the passphrase for the encrypted credential
/// file. Without it credentials go to the OS keychain.
const PASSPHRASE_ENV: &str = "SKYWINGS_STORE_PASSPHRASE";

/// Set to write a daily rolling log file next to the credential file.
const LOG_FILE_ENV: &str = "SKYWINGS_LOG_FILE";

const CREDENTIALS_FILE: &str = "credentials.json";

const USAGE: &str = "\
Usage: skywings <command> [args]

Commands:
  login <email>             Sign in (password is prompted)
  logout                    Forget the stored session
  status                    Show session state
  get <path>                GET a resource and print the JSON body
  delete <path>             DELETE a resource
  post <path> <json>        POST a JSON body
  put <path> <json>         PUT a JSON body
  patch <path> <json>       PATCH a JSON body
";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var_os(LOG_FILE_ENV)
        .and_then(|_| ClientConfig::data_dir().ok())
    {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "skywings.log");
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

fn open_store() -> Result<Arc<dyn KeyValueStore>> {
    let backend: Arc<dyn KeyValueStore> = match std::env::var(PASSPHRASE_ENV) {
        Ok(passphrase) if !passphrase.is_empty() => {
            let path = ClientConfig::data_dir()?.join(CREDENTIALS_FILE);
            debug!(path = %path.display(), "Using encrypted credential file");
            Arc::new(EncryptedFileStore::open(path, &passphrase)?)
        }
        _ => Arc::new(KeychainStore::new()),
    };
    Ok(Arc::new(NamespacedStore::new(backend)))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprint!("{}", USAGE);
        return Ok(());
    };

    let config = ClientConfig::load()?;
    info!(base_url = %config.base_url, "SkyWings CLI starting");
    let client = ApiClient::new(config, open_store()?)?;

    match run(&client, command, &args[1..]).await {
        Ok(()) => Ok(()),
        Err(e) => match e.downcast_ref::<ApiError>() {
            Some(api_err) => {
                eprintln!("Error: {}", api_err.user_message());
                debug!(code = api_err.code(), status = api_err.status(), "{}", api_err);
                std::process::exit(1);
            }
            None => Err(e),
        },
    }
}

async fn run(client: &ApiClient, command: &str, args: &[String]) -> Result<()> {
    match (command, args) {
        ("login", [email]) => login(client, email).await,
        ("logout", []) => {
            client.logout();
            println!("Signed out.");
            Ok(())
        }
        ("status", []) => status(client),
        ("get", [path]) => send(client, RequestDescriptor::get(path.as_str())).await,
        ("delete", [path]) => send(client, RequestDescriptor::delete(path.as_str())).await,
        ("post", [path, body]) => {
            send(client, RequestDescriptor::post(path.as_str()).body(parse_body(body)?)).await
        }
        ("put", [path, body]) => {
            send(client, RequestDescriptor::put(path.as_str()).body(parse_body(body)?)).await
        }
        ("patch", [path, body]) => {
            send(client, RequestDescriptor::patch(path.as_str()).body(parse_body(body)?)).await
        }
        _ => {
            eprint!("{}", USAGE);
            bail!("Unknown command or wrong arguments: {}", command)
        }
    }
}

async fn login(client: &ApiClient, email: &str) -> Result<()> {
    let password = rpassword::prompt_password(format!("Password for {}: ", email))
        .context("Failed to read password")?;
    let credential = client.login(email, &password).await?;
    println!(
        "Signed in as {} (token valid for {} minutes).",
        email,
        credential.seconds_until_expiry() / 60
    );
    Ok(())
}

fn status(client: &ApiClient) -> Result<()> {
    match client.tokens().credentials().load()? {
        Some(credential) => {
            let state = if client.is_authenticated() {
                "active"
            } else {
                "needs refresh"
            };
            println!("Session: {}", state);
            println!("Expires in: {}s", credential.seconds_until_expiry());
            if let Some(user) = credential.user {
                println!("User: {}", serde_json::to_string_pretty(&user)?);
            }
        }
        None => println!("Not signed in."),
    }
    Ok(())
}

/// Issue one request, cancelling it on Ctrl-C, and print the response body.
async fn send(client: &ApiClient, descriptor: RequestDescriptor) -> Result<()> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let body: Value = client.request_with_cancel(descriptor, &cancel).await?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", serde_json::to_string_pretty(&body)?)?;
    Ok(())
}

fn parse_body(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).context("Request body must be valid JSON")
}
