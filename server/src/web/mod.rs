use axum::{Router, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;

use crate::config::TwitchConfig;
use crate::error::{ConfigError, Result as AppResult};
use crate::twitch::auth::{DEFAULT_SCOPES, DEFAULT_TOKEN_LIFETIME_SECS, TwitchOAuthClient, authorize_url};
use crate::twitch::token_store::CredentialStore;
use crate::twitch::TwitchError;

pub mod error;
pub mod handlers;

pub use self::error::WebError;
use self::handlers::{CallbackState, callback_handler};

pub const DEFAULT_CALLBACK_PORT: u16 = 8080;
const CALLBACK_PATH: &str = "/callback";

fn callback_router(state: CallbackState) -> Router {
    Router::new()
        .route(CALLBACK_PATH, get(callback_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Runs the authorization-code flow: serve the local redirect target, wait
/// for the browser to come back with a code, exchange it and persist the
/// token pair.
#[tracing::instrument(skip(twitch, store), fields(callback.port = port))]
pub async fn run_authorize(
    twitch: &TwitchConfig,
    store: Arc<dyn CredentialStore>,
    port: u16,
) -> AppResult<()> {
    let (client_id, client_secret) = twitch.app_credentials().ok_or_else(|| {
        ConfigError::Missing(
            "twitch.client_id and twitch.client_secret (TWITCH_CLIENT_ID / TWITCH_CLIENT_SECRET)"
                .to_string(),
        )
    })?;

    let redirect_uri = format!("http://localhost:{}{}", port, CALLBACK_PATH);
    let url = authorize_url(client_id, &redirect_uri, DEFAULT_SCOPES)?;

    let (state, outcome_rx) = CallbackState::new();
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(server.address = %addr, "OAuth callback listener started");
    println!("Open the following URL in your browser to authorize:\n\n{}\n", url);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, callback_router(state))
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .await
    });

    let outcome = outcome_rx.await;
    let _ = stop_tx.send(());
    match server.await {
        Ok(Ok(())) => tracing::debug!("OAuth callback listener stopped"),
        Ok(Err(e)) => tracing::warn!(error = %e, "OAuth callback listener failed"),
        Err(e) => tracing::warn!(error = %e, "OAuth callback listener task panicked"),
    }

    let code = match outcome {
        Ok(Ok(code)) => code,
        Ok(Err(reason)) => {
            return Err(WebError::AuthorizationDenied(reason).into());
        }
        Err(_) => {
            return Err(WebError::InternalServerError(
                "Callback listener stopped before an authorization code arrived".to_string(),
            )
            .into());
        }
    };

    let client = TwitchOAuthClient::new()?;
    let tokens = client
        .exchange_code(client_id, client_secret, &code, &redirect_uri)
        .await?;
    if tokens.refresh_token.is_none() {
        tracing::warn!("Token endpoint returned no refresh token. Automatic refresh will be unavailable");
    }
    let saved = store
        .write(
            &tokens.access_token,
            tokens.refresh_token.as_deref(),
            tokens.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS),
        )
        .await
        .map_err(|e| TwitchError::Store(format!("could not persist tokens: {}", e)))?;

    tracing::info!(
        expires_at = saved.expires_at,
        "Authorization complete. Tokens saved"
    );
    Ok(())
}
