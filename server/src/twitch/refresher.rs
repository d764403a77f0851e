use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::sleep;

use super::auth::{DEFAULT_TOKEN_LIFETIME_SECS, TokenEndpoint};
use super::error::{Result as TwitchResult, TwitchError};
use super::signal::RefreshSignal;
use super::token_store::CredentialStore;
use super::types::{Credentials, LifecycleEvent};

const IDLE_RECHECK: Duration = Duration::from_secs(60);
const FAILURE_RETRY: Duration = Duration::from_secs(30);
const REFRESH_WINDOW_SECS: i64 = 60;
const MIN_WAIT_SECS: i64 = 10;
const POST_REFRESH_PAUSE: Duration = Duration::from_secs(MIN_WAIT_SECS as u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefresherState {
    Idle,
    Waiting { expires_at: i64 },
    Refreshing,
    FailedBackoff,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshPlan {
    /// Nothing to refresh with; look again later.
    Idle,
    Wait(Duration),
    RefreshNow { refresh_token: String },
}

/// Decides what to do with the stored credentials at unix time `now`.
pub fn plan_refresh(credentials: &Credentials, now: i64) -> RefreshPlan {
    let (Some(refresh_token), Some(expires_at)) =
        (credentials.refresh_token.as_ref(), credentials.expires_at)
    else {
        return RefreshPlan::Idle;
    };

    let remaining = expires_at - now;
    if remaining > REFRESH_WINDOW_SECS {
        let wait_secs = (remaining - REFRESH_WINDOW_SECS).max(MIN_WAIT_SECS);
        RefreshPlan::Wait(Duration::from_secs(wait_secs as u64))
    } else {
        RefreshPlan::RefreshNow {
            refresh_token: refresh_token.clone(),
        }
    }
}

/// Background task that keeps the stored access token fresh.
pub struct TokenRefresher {
    client_id: String,
    client_secret: String,
    store: Arc<dyn CredentialStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    signal: RefreshSignal,
    events: broadcast::Sender<LifecycleEvent>,
    state_tx: watch::Sender<RefresherState>,
    configured: Credentials,
}

impl TokenRefresher {
    pub fn new(
        client_id: String,
        client_secret: String,
        store: Arc<dyn CredentialStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        signal: RefreshSignal,
        events: broadcast::Sender<LifecycleEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(RefresherState::Idle);
        Self {
            client_id,
            client_secret,
            store,
            endpoint,
            signal,
            events,
            state_tx,
            configured: Credentials::default(),
        }
    }

    /// Refresh token and expiry from the settings, used while the store has
    /// none of its own.
    pub fn with_configured(mut self, refresh_token: Option<String>, expires_at: Option<i64>) -> Self {
        self.configured = Credentials {
            access_token: None,
            refresh_token: refresh_token.filter(|t| !t.is_empty()),
            expires_at,
        };
        self
    }

    fn fill_from_configured(&self, mut credentials: Credentials) -> Credentials {
        if credentials.refresh_token.as_deref().is_none_or(str::is_empty) {
            credentials.refresh_token = self.configured.refresh_token.clone();
        }
        if credentials.expires_at.is_none() {
            credentials.expires_at = self.configured.expires_at;
        }
        credentials
    }

    pub fn state(&self) -> watch::Receiver<RefresherState> {
        self.state_tx.subscribe()
    }

    pub async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) {
        tracing::info!("[TOKEN_REFRESHER] Token refresher started");
        loop {
            let delay = tokio::select! {
                biased;
                _ = &mut shutdown_rx => break,
                delay = self.cycle() => delay,
            };
            tokio::select! {
                biased;
                _ = &mut shutdown_rx => break,
                _ = sleep(delay) => {}
            }
        }
        tracing::info!("[TOKEN_REFRESHER] Shutdown signal received. Token refresher stopped");
    }

    /// One evaluation of the state machine. Returns how long to sleep before
    /// the next one.
    async fn cycle(&self) -> Duration {
        let credentials = match self.store.read().await {
            Ok(credentials) => self.fill_from_configured(credentials),
            Err(e) => {
                tracing::warn!(error = %e, "[TOKEN_REFRESHER] Could not read credential store");
                self.state_tx.send_replace(RefresherState::Idle);
                return IDLE_RECHECK;
            }
        };

        match plan_refresh(&credentials, chrono::Utc::now().timestamp()) {
            RefreshPlan::Idle => {
                tracing::debug!("[TOKEN_REFRESHER] No refresh token or expiry known. Checking again later");
                self.state_tx.send_replace(RefresherState::Idle);
                IDLE_RECHECK
            }
            RefreshPlan::Wait(delay) => {
                tracing::debug!(
                    sleep = ?delay,
                    expires_at = credentials.expires_at,
                    "[TOKEN_REFRESHER] Token still valid. Waiting for the refresh window"
                );
                self.state_tx.send_replace(RefresherState::Waiting {
                    expires_at: credentials.expires_at.unwrap_or_default(),
                });
                delay
            }
            RefreshPlan::RefreshNow { refresh_token } => {
                self.state_tx.send_replace(RefresherState::Refreshing);
                match self.refresh_once(&refresh_token).await {
                    Ok(updated) => {
                        let expires_at = updated.expires_at.unwrap_or_default();
                        tracing::info!(
                            expires_at,
                            "[TOKEN_REFRESHER] Token refreshed and saved. Signalling reconnect"
                        );
                        self.signal.set();
                        // No subscribers is fine: the host may not care.
                        let _ = self
                            .events
                            .send(LifecycleEvent::CredentialsRefreshed { expires_at });
                        // A short-lived token would otherwise be refreshed back to back.
                        POST_REFRESH_PAUSE
                    }
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            retry_in = ?FAILURE_RETRY,
                            "[TOKEN_REFRESHER] Token refresh failed"
                        );
                        self.state_tx.send_replace(RefresherState::FailedBackoff);
                        FAILURE_RETRY
                    }
                }
            }
        }
    }

    async fn refresh_once(&self, refresh_token: &str) -> TwitchResult<Credentials> {
        tracing::info!("[TOKEN_REFRESHER] Refreshing access token using refresh_token");
        let response = self
            .endpoint
            .refresh(&self.client_id, &self.client_secret, refresh_token)
            .await?;
        if response.access_token.is_empty() {
            return Err(TwitchError::MissingToken);
        }
        let next_refresh = response
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(refresh_token);
        self.store
            .write(
                &response.access_token,
                Some(next_refresh),
                response.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS),
            )
            .await
    }
}
