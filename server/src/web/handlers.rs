use axum::{
    extract::{Query, State},
    response::Html,
};
use serde::Deserialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

use super::error::{Result as WebResult, WebError};

/// Outcome of the browser redirect: the authorization code, or the reason
/// the user or Twitch refused.
pub type CallbackOutcome = Result<String, String>;

#[derive(Clone)]
pub struct CallbackState {
    outcome_tx: Arc<Mutex<Option<oneshot::Sender<CallbackOutcome>>>>,
}

impl CallbackState {
    pub fn new() -> (Self, oneshot::Receiver<CallbackOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                outcome_tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Delivers the first outcome; later callbacks are ignored.
    fn deliver(&self, outcome: CallbackOutcome) -> bool {
        let sender = self
            .outcome_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

const SUCCESS_PAGE: &str =
    "<html><body><h2>Authorization received.</h2><p>You can close this window.</p></body></html>";

pub async fn callback_handler(
    State(state): State<CallbackState>,
    Query(params): Query<CallbackParams>,
) -> WebResult<Html<&'static str>> {
    tracing::info!(
        has_code = params.code.is_some(),
        error = params.error.as_deref(),
        "HTTP: Received OAuth callback"
    );

    if let Some(error) = params.error {
        let reason = match params.error_description {
            Some(description) => format!("{}: {}", error, description),
            None => error,
        };
        state.deliver(Err(reason.clone()));
        return Err(WebError::AuthorizationDenied(reason));
    }

    let Some(code) = params.code.filter(|c| !c.is_empty()) else {
        return Err(WebError::BadRequest(
            "Missing 'code' query parameter".to_string(),
        ));
    };

    if !state.deliver(Ok(code)) {
        tracing::warn!("OAuth callback arrived after a code was already captured");
        return Err(WebError::BadRequest(
            "Authorization already completed".to_string(),
        ));
    }
    Ok(Html(SUCCESS_PAGE))
}
