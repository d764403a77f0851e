use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

mod config;
mod error;
mod logging;
mod twitch;
mod web;

use crate::config::{TwitchConfig, load_settings};
use crate::error::{AppError, ConfigError, Result as AppResult};
use crate::logging::Telemetry;
use crate::twitch::{
    ChatAggregator, CredentialStore, EnvFileStore, IngestionMode, LifecycleEvent,
    TwitchOAuthClient,
};
use crate::web::{DEFAULT_CALLBACK_PORT, run_authorize};

#[derive(Parser, Debug)]
#[command(
    name = "multichat",
    version,
    about = "Ingests Twitch chat into structured JSON logs"
)]
struct Cli {
    /// Settings file (toml, yaml or json). Defaults to ./config.* when present.
    #[arg(long, env = "MULTICHAT_CONFIG")]
    config: Option<PathBuf>,

    /// KEY=VALUE file holding the Twitch tokens; rewritten on refresh.
    #[arg(long, default_value = ".env", env = "MULTICHAT_CREDENTIALS_FILE")]
    credentials_file: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to chat and log every message (default).
    Run,
    /// Obtain a user token through the browser and save it.
    Authorize {
        #[arg(long, default_value_t = DEFAULT_CALLBACK_PORT)]
        port: u16,
    },
    /// Ask Twitch whether the stored token is still valid.
    CheckToken,
}

#[tokio::main]
async fn main() -> AppResult<()> {
    let cli = Cli::parse();

    // Loaded before settings so the legacy TWITCH_* overrides see it.
    if let Err(e) = dotenvy::from_path(&cli.credentials_file) {
        if !e.not_found() {
            eprintln!(
                "Could not load credentials file {}: {}",
                cli.credentials_file.display(),
                e
            );
        }
    }

    let settings = load_settings(cli.config.as_deref())?;
    let telemetry = Telemetry::init(&settings.logging)?;
    let store = Arc::new(EnvFileStore::new(cli.credentials_file));
    tracing::info!(
        log.path = %telemetry.log_path().display(),
        credentials.path = %store.path().display(),
        channel.name = settings.twitch.channel.as_deref(),
        "Configuration loaded"
    );

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_ingestion(settings.twitch, store).await,
        Command::Authorize { port } => run_authorize(&settings.twitch, store, port).await,
        Command::CheckToken => check_token(&settings.twitch, store.as_ref()).await,
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "multichat exited with an error");
    }
    result
}

async fn run_ingestion(twitch: TwitchConfig, store: Arc<EnvFileStore>) -> AppResult<()> {
    let restart_on_refresh = twitch.restart_on_refresh;
    let mut aggregator = ChatAggregator::new(twitch, store);
    let mut events = aggregator.subscribe();

    if aggregator.start().await? == IngestionMode::Idle {
        tracing::info!("Nothing to ingest. Waiting for shutdown signal");
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let outcome = loop {
        tokio::select! {
            _ = &mut shutdown => break Ok(()),
            event = events.recv() => match event {
                Ok(LifecycleEvent::CredentialsRefreshed { expires_at }) => {
                    if restart_on_refresh {
                        tracing::info!(
                            expires_at,
                            "Credentials refreshed. Exiting so the process manager restarts with fresh state"
                        );
                        break Ok(());
                    }
                    tracing::debug!(expires_at, "Credentials refreshed");
                }
                Ok(LifecycleEvent::IngestionStopped { attempts }) => {
                    break Err(AppError::IngestionStopped { attempts });
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Lifecycle listener fell behind");
                }
                Err(RecvError::Closed) => break Ok(()),
            },
        }
    };

    aggregator.stop().await;
    outcome
}

async fn check_token(twitch: &TwitchConfig, store: &dyn CredentialStore) -> AppResult<()> {
    let stored = store.read().await?;
    let token = twitch
        .token
        .clone()
        .filter(|t| !t.is_empty())
        .or(stored.access_token)
        .ok_or_else(|| ConfigError::Missing("TWITCH_IRC_TOKEN".to_string()))?;

    let validation = TwitchOAuthClient::new()?.validate(&token).await?;
    tracing::info!(
        login = validation.login.as_deref(),
        user_id = validation.user_id.as_deref(),
        client_id = %validation.client_id,
        scopes = ?validation.scopes,
        expires_in = validation.expires_in,
        "Token is valid"
    );
    println!(
        "Token valid for {} (user id {}), expires in {}s, scopes: {}",
        validation.login.as_deref().unwrap_or("<app token>"),
        validation.user_id.as_deref().unwrap_or("-"),
        validation.expires_in,
        validation.scopes.join(" ")
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not install SIGTERM handler");
                ctrl_c.await.ok();
                tracing::info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        tracing::info!("Received Ctrl+C, shutting down...");
    }
}
