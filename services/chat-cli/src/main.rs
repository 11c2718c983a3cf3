//! Chat backend client
//!
//! Command-line front end over the authenticated request layer:
//! 1. Loads config and any persisted session
//! 2. Builds one `AuthSession` and hands it to the `ApiClient`
//! 3. Runs a single command, or with `keepalive` keeps the session fresh
//!    through the proactive refresh timer until SIGINT/SIGTERM

mod config;

use anyhow::{Context, Result, bail};
use chat_api::{ApiClient, ApiError, RequestOptions};
use chat_auth::{AuthSession, CredentialStore, RegisterRequest, credentials::now_millis};
use std::io::Write;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

const USAGE: &str = "usage: chat-client [--config PATH] <login | register [EMAIL] | me | get ENDPOINT | logout | status | keepalive>";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Login,
    Register { email: Option<String> },
    Me,
    Get { endpoint: String },
    Logout,
    Status,
    Keepalive,
}

/// Parsed command line: optional `--config` plus one command.
#[derive(Debug, PartialEq, Eq)]
struct Cli {
    config: Option<String>,
    command: Command,
}

fn parse_args(args: &[String]) -> Result<Cli> {
    let mut config = None;
    let mut rest = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let path = iter.next().context("--config requires a path")?;
            config = Some(path.clone());
        } else {
            rest.push(arg.as_str());
        }
    }

    let command = match rest.as_slice() {
        ["login"] => Command::Login,
        ["register"] => Command::Register { email: None },
        ["register", email] => Command::Register {
            email: Some((*email).to_string()),
        },
        ["me"] => Command::Me,
        ["get", endpoint] => Command::Get {
            endpoint: (*endpoint).to_string(),
        },
        ["logout"] => Command::Logout,
        ["status"] => Command::Status,
        ["keepalive"] => Command::Keepalive,
        _ => bail!("{USAGE}"),
    };
    Ok(Cli { config, command })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so command output on stdout stays parseable
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_args(&args)?;

    let config_path = Config::resolve_path(cli.config.as_deref());
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let client = build_client(&config)?;
    let store = CredentialStore::load(config.session.credentials_path.clone())
        .await
        .context("failed to load persisted session")?;
    let session = AuthSession::new(client, config.backend.base_url.clone(), store);
    session.restore().await;
    let api = ApiClient::new(session);

    let mut stdout = std::io::stdout();
    run(cli.command, &config, &api, &mut stdout).await
}

fn build_client(config: &Config) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.backend.timeout_secs))
        .build()
        .context("failed to build HTTP client")
}

/// Execute one command, writing its JSON result to `out`.
async fn run(command: Command, config: &Config, api: &ApiClient, out: &mut impl Write) -> Result<()> {
    let session = api.session();
    match command {
        Command::Login => {
            let (username, password) = account(config)?;
            let response = session
                .login(username, password)
                .await
                .context("login failed")?;
            if response.must_change_password {
                warn!("backend requires a password change for this account");
            }
            print_json(
                out,
                &serde_json::json!({
                    "user_id": response.user_id,
                    "must_change_password": response.must_change_password,
                }),
            )
        }
        Command::Register { email } => {
            let (username, password) = account(config)?;
            let request = RegisterRequest {
                username,
                password,
                email: email.as_deref(),
            };
            let response = session
                .register(&request)
                .await
                .context("registration failed")?;
            print_json(out, &serde_json::json!({ "user_id": response.user_id }))
        }
        Command::Me => {
            let profile = api.me().await.map_err(explain)?;
            print_json(out, &profile)
        }
        Command::Get { endpoint } => {
            let value = api
                .execute_json(&endpoint, RequestOptions::get())
                .await
                .map_err(explain)?;
            print_json(out, &value)
        }
        Command::Logout => {
            session.logout().await;
            print_json(out, &serde_json::json!({ "authenticated": false }))
        }
        Command::Status => {
            let now = now_millis();
            let status = match session.credentials().await {
                Some(credentials) => serde_json::json!({
                    "authenticated": true,
                    "user_id": credentials.user_id,
                    "expired": credentials.is_expired(now),
                    "expires_in_secs": credentials.remaining(now).as_secs(),
                    "refresh_scheduled": session.timer().is_scheduled(),
                }),
                None => serde_json::json!({ "authenticated": false }),
            };
            print_json(out, &status)
        }
        Command::Keepalive => {
            if !session.is_authenticated().await {
                bail!("no session to keep alive, run `chat-client login` first");
            }
            info!("keeping session alive until interrupted");
            shutdown_signal().await?;
            Ok(())
        }
    }
}

fn account(config: &Config) -> Result<(&str, &str)> {
    let username = config
        .account
        .username
        .as_deref()
        .context("account.username is not configured")?;
    let password = config
        .account
        .password
        .as_ref()
        .context("no password: set CHAT_PASSWORD or account.password_file")?;
    Ok((username, password.expose().as_str()))
}

fn explain(err: ApiError) -> anyhow::Error {
    if err.requires_login() {
        anyhow::Error::new(err).context("session expired, run `chat-client login`")
    } else {
        anyhow::Error::new(err)
    }
}

fn print_json(out: &mut impl Write, value: &impl serde::Serialize) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value).context("failed to encode output")?;
    writeln!(out).context("failed to write output")?;
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to install Ctrl+C handler")?;
                info!("received SIGINT, shutting down");
            }
            _ = terminate.recv() => info!("received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to install Ctrl+C handler")?;
        info!("received SIGINT, shutting down");
    }

    Ok(())
}
