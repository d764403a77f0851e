use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;

use super::auth::{TokenEndpoint, TwitchOAuthClient};
use super::error::Result as TwitchResult;
use super::refresher::TokenRefresher;
use super::signal::RefreshSignal;
use super::sink::{ChatSink, TracingChatSink};
use super::supervisor::{ConnectionSupervisor, SupervisorExit, SupervisorSettings};
use super::token_store::CredentialStore;
use super::transport::{Connector, TlsChatConnector};
use super::types::{ConnectionStatus, LifecycleEvent};
use crate::config::TwitchConfig;

const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);
const LIFECYCLE_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionMode {
    /// Credentials or channel missing; nothing was started.
    Idle,
    Active,
}

struct ManagedTask {
    name: &'static str,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

/// Owns the connection supervisor and token refresher for one channel.
pub struct ChatAggregator {
    config: TwitchConfig,
    store: Arc<dyn CredentialStore>,
    connector: Arc<dyn Connector>,
    token_endpoint: Option<Arc<dyn TokenEndpoint>>,
    sink: Arc<dyn ChatSink>,
    refresh: RefreshSignal,
    events_tx: broadcast::Sender<LifecycleEvent>,
    status_rx: Option<watch::Receiver<ConnectionStatus>>,
    tasks: Vec<ManagedTask>,
}

impl ChatAggregator {
    pub fn new(config: TwitchConfig, store: Arc<dyn CredentialStore>) -> Self {
        let (events_tx, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
        Self {
            sink: Arc::new(TracingChatSink::new(config.echo_messages)),
            connector: Arc::new(TlsChatConnector::twitch()),
            token_endpoint: None,
            config,
            store,
            refresh: RefreshSignal::new(),
            events_tx,
            status_rx: None,
            tasks: Vec::new(),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_token_endpoint(mut self, endpoint: Arc<dyn TokenEndpoint>) -> Self {
        self.token_endpoint = Some(endpoint);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ChatSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events_tx.subscribe()
    }

    /// Supervisor state, available once ingestion is active.
    pub fn status(&self) -> Option<watch::Receiver<ConnectionStatus>> {
        self.status_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    pub async fn start(&mut self) -> TwitchResult<IngestionMode> {
        if self.is_running() {
            tracing::warn!("Chat aggregator already started");
            return Ok(IngestionMode::Active);
        }

        let channel = self
            .config
            .channel
            .as_deref()
            .map(|c| c.trim().trim_start_matches('#'))
            .filter(|c| !c.is_empty())
            .map(str::to_string);
        let nick = self.config.nick.trim().to_string();
        let token = self.initial_token().await;

        let (Some(channel), Some(token)) = (channel, token) else {
            tracing::warn!(
                "Twitch IRC token or channel not configured (TWITCH_IRC_TOKEN / TWITCH_STREAMER_LOGIN). Chat ingestion disabled"
            );
            return Ok(IngestionMode::Idle);
        };
        if nick.is_empty() {
            tracing::warn!("Twitch bot nick not configured. Chat ingestion disabled");
            return Ok(IngestionMode::Idle);
        }

        if self.config.resolve_bot_id {
            self.resolve_bot_id(&token, &nick).await;
        }

        let refresher_endpoint = self.refresher_endpoint().await?;

        self.refresh.clear();
        self.spawn_supervisor(channel.clone(), nick, token);
        match refresher_endpoint {
            Some((client_id, client_secret, endpoint)) => {
                self.spawn_refresher(client_id, client_secret, endpoint)
            }
            None => tracing::info!(
                "No refresh token or client credentials configured. Token refresher not started"
            ),
        }

        tracing::info!(
            channel.name = %channel,
            tasks = self.tasks.len(),
            "Chat aggregator started"
        );
        Ok(IngestionMode::Active)
    }

    /// Client credentials and token endpoint for the refresher, or `None` when
    /// there is nothing to refresh with. Resolved before any task is spawned.
    async fn refresher_endpoint(
        &self,
    ) -> TwitchResult<Option<(String, String, Arc<dyn TokenEndpoint>)>> {
        let Some((client_id, client_secret)) = self.config.app_credentials() else {
            return Ok(None);
        };
        let stored_refresh_token = self.store.read().await.ok().and_then(|c| c.refresh_token);
        let refresh_token_known = stored_refresh_token
            .filter(|t| !t.is_empty())
            .or_else(|| self.config.refresh_token.clone())
            .is_some_and(|t| !t.is_empty());
        if !refresh_token_known {
            return Ok(None);
        }
        let endpoint: Arc<dyn TokenEndpoint> = match &self.token_endpoint {
            Some(endpoint) => endpoint.clone(),
            None => Arc::new(TwitchOAuthClient::new()?),
        };
        Ok(Some((client_id.to_string(), client_secret.to_string(), endpoint)))
    }

    /// Configured token, falling back to whatever the credential store holds.
    async fn initial_token(&self) -> Option<String> {
        if let Some(token) = self.config.token.as_deref().filter(|t| !t.is_empty()) {
            return Some(token.to_string());
        }
        match self.store.read().await {
            Ok(credentials) => credentials.access_token.filter(|t| !t.is_empty()),
            Err(e) => {
                tracing::warn!(error = %e, "Could not read credential store");
                None
            }
        }
    }

    async fn resolve_bot_id(&self, token: &str, nick: &str) {
        let Some(client_id) = self.config.client_id.as_deref().filter(|c| !c.is_empty()) else {
            tracing::debug!("Bot id lookup skipped: no client id configured");
            return;
        };
        let lookup = match TwitchOAuthClient::new() {
            Ok(client) => client.lookup_user_id(client_id, token, nick).await,
            Err(e) => Err(e),
        };
        match lookup {
            Ok(Some(id)) => tracing::info!(bot.nick = %nick, bot.id = %id, "Resolved bot user id"),
            Ok(None) => tracing::warn!(bot.nick = %nick, "Helix returned no user for bot nick"),
            Err(e) => tracing::warn!(bot.nick = %nick, error = %e, "Bot user id lookup failed"),
        }
    }

    fn spawn_supervisor(&mut self, channel: String, nick: String, token: String) {
        let supervisor = ConnectionSupervisor::new(
            SupervisorSettings {
                channel,
                nick,
                retry: self.config.retry_policy(),
                request_tags: self.config.request_tags,
                reply_to_ping_command: self.config.reply_to_ping_command,
            },
            token,
            self.connector.clone(),
            self.store.clone(),
            self.sink.clone(),
            self.refresh.clone(),
        );
        self.status_rx = Some(supervisor.status());

        let events_tx = self.events_tx.clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            if let SupervisorExit::AttemptsExhausted { attempts } = supervisor.run(shutdown_rx).await
            {
                let _ = events_tx.send(LifecycleEvent::IngestionStopped { attempts });
            }
        });
        self.tasks.push(ManagedTask {
            name: "connection_supervisor",
            shutdown_tx: Some(shutdown_tx),
            handle,
        });
    }

    fn spawn_refresher(
        &mut self,
        client_id: String,
        client_secret: String,
        endpoint: Arc<dyn TokenEndpoint>,
    ) {
        let refresher = TokenRefresher::new(
            client_id,
            client_secret,
            self.store.clone(),
            endpoint,
            self.refresh.clone(),
            self.events_tx.clone(),
        )
        .with_configured(self.config.refresh_token.clone(), self.config.token_expires_at);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(refresher.run(shutdown_rx));
        self.tasks.push(ManagedTask {
            name: "token_refresher",
            shutdown_tx: Some(shutdown_tx),
            handle,
        });
    }

    /// Cancels every background task and waits for them, aborting any that
    /// outlive the grace period. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if self.tasks.is_empty() {
            tracing::debug!("Chat aggregator stop requested with no running tasks");
            return;
        }

        for task in &mut self.tasks {
            if let Some(tx) = task.shutdown_tx.take() {
                // Err means the task already finished.
                let _ = tx.send(());
            }
        }

        for mut task in self.tasks.drain(..) {
            match tokio::time::timeout(STOP_GRACE_PERIOD, &mut task.handle).await {
                Ok(Ok(())) => tracing::debug!(task = task.name, "Task stopped"),
                Ok(Err(e)) => {
                    tracing::warn!(task = task.name, error = %e, "Task ended abnormally")
                }
                Err(_) => {
                    tracing::warn!(
                        task = task.name,
                        grace = ?STOP_GRACE_PERIOD,
                        "Task did not stop in time. Aborting"
                    );
                    task.handle.abort();
                }
            }
        }
        self.refresh.clear();
        tracing::info!("Chat aggregator stopped");
    }
}
