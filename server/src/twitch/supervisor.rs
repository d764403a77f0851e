use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, WriteHalf};
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

use super::backoff::{ConnectionAttempt, RetryPolicy};
use super::irc_parser::{
    CMD_JOIN, CMD_NICK, CMD_PASS, CMD_PRIVMSG, IrcLine, PONG_REPLY, TWITCH_CAPABILITIES,
    is_auth_failure_notice,
};
use super::sanitize::sanitize_content;
use super::signal::RefreshSignal;
use super::sink::ChatSink;
use super::token_store::{CredentialStore, TOKEN_SCHEME_PREFIX, bearer_token};
use super::transport::{BoxedChatStream, Connector};
use super::types::{ChatEvent, ConnectionStatus};

const GRACEFUL_RECONNECT_PAUSE: Duration = Duration::from_secs(1);
const PING_COMMAND: &str = "!ping";
const PING_COMMAND_REPLY: &str = "pong";

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub channel: String,
    pub nick: String,
    pub retry: RetryPolicy,
    pub request_tags: bool,
    pub reply_to_ping_command: bool,
}

/// Why `ConnectionSupervisor::run` returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    Cancelled,
    AttemptsExhausted { attempts: u32 },
}

#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Refresh,
    RemoteClosed,
    Failed(String),
}

/// Owns the chat connection: login, read loop, keepalive and reconnects.
pub struct ConnectionSupervisor {
    settings: SupervisorSettings,
    token: String,
    attempts: ConnectionAttempt,
    connector: Arc<dyn Connector>,
    store: Arc<dyn CredentialStore>,
    sink: Arc<dyn ChatSink>,
    refresh: RefreshSignal,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl ConnectionSupervisor {
    pub fn new(
        mut settings: SupervisorSettings,
        token: String,
        connector: Arc<dyn Connector>,
        store: Arc<dyn CredentialStore>,
        sink: Arc<dyn ChatSink>,
        refresh: RefreshSignal,
    ) -> Self {
        settings.channel = settings.channel.trim_start_matches('#').to_lowercase();
        let (status_tx, _) = watch::channel(ConnectionStatus::Initializing);
        Self {
            attempts: ConnectionAttempt::new(settings.retry),
            settings,
            token,
            connector,
            store,
            sink,
            refresh,
            status_tx,
        }
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    fn publish(&self, status: ConnectionStatus) {
        self.status_tx.send_replace(status);
    }

    pub async fn run(mut self, mut shutdown_rx: oneshot::Receiver<()>) -> SupervisorExit {
        tracing::info!(
            channel.name = %self.settings.channel,
            server.address = %self.connector.endpoint(),
            "IRC connection supervisor started"
        );

        loop {
            let attempt = self.attempts.begin();
            self.publish(ConnectionStatus::Connecting { attempt });
            let session_id = Uuid::new_v4();

            match self.run_session(session_id, attempt, &mut shutdown_rx).await {
                SessionEnd::Shutdown => {
                    return self.cancelled();
                }
                SessionEnd::Refresh => {
                    self.apply_refresh().await;
                }
                SessionEnd::RemoteClosed => {
                    tracing::info!(
                        channel.name = %self.settings.channel,
                        session.id = %session_id,
                        pause = ?GRACEFUL_RECONNECT_PAUSE,
                        "Server closed the connection. Reconnecting after a short pause"
                    );
                    self.attempts.reset();
                    tokio::select! {
                        biased;
                        _ = &mut shutdown_rx => return self.cancelled(),
                        _ = tokio::time::sleep(GRACEFUL_RECONNECT_PAUSE) => {}
                    }
                }
                SessionEnd::Failed(reason) => {
                    let next = self.attempts.next_delay(&mut rand::thread_rng());
                    let Some(delay) = next else {
                        let attempts = self.attempts.attempt_count();
                        tracing::warn!(
                            channel.name = %self.settings.channel,
                            attempts,
                            reason = %reason,
                            "Reached max reconnect attempts. Giving up"
                        );
                        self.publish(ConnectionStatus::Stopped {
                            reason: format!("gave up after {} attempts: {}", attempts, reason),
                        });
                        return SupervisorExit::AttemptsExhausted { attempts };
                    };

                    tracing::warn!(
                        channel.name = %self.settings.channel,
                        session.id = %session_id,
                        attempt,
                        retry_in = ?delay,
                        reason = %reason,
                        "Connection failed. Backing off"
                    );
                    self.publish(ConnectionStatus::Reconnecting {
                        reason,
                        failed_attempt: attempt,
                        retry_in: delay,
                    });

                    tokio::select! {
                        biased;
                        _ = &mut shutdown_rx => return self.cancelled(),
                        _ = self.refresh.wait() => {
                            tracing::info!(
                                channel.name = %self.settings.channel,
                                "Credentials refreshed during backoff. Reconnecting now"
                            );
                            self.apply_refresh().await;
                        }
                        _ = tokio::time::sleep(delay) => {
                            tracing::debug!(
                                channel.name = %self.settings.channel,
                                delay = ?delay,
                                "Reconnect delay elapsed"
                            );
                        }
                    }
                }
            }
        }
    }

    fn cancelled(&self) -> SupervisorExit {
        tracing::info!(
            channel.name = %self.settings.channel,
            "Shutdown signal received. IRC connection supervisor stopped"
        );
        self.publish(ConnectionStatus::Stopped {
            reason: "shutdown requested".to_string(),
        });
        SupervisorExit::Cancelled
    }

    /// Clears the signal, picks up the stored token and starts over with a
    /// fresh attempt budget.
    async fn apply_refresh(&mut self) {
        self.refresh.clear();
        match self.store.read().await {
            Ok(credentials) => match credentials.access_token.filter(|t| !t.is_empty()) {
                Some(token) => {
                    self.token = token;
                    tracing::info!(
                        channel.name = %self.settings.channel,
                        "Swapped in refreshed access token"
                    );
                }
                None => tracing::warn!(
                    channel.name = %self.settings.channel,
                    "Refresh signalled but the credential store holds no access token. Keeping the current one"
                ),
            },
            Err(e) => tracing::warn!(
                channel.name = %self.settings.channel,
                error = %e,
                "Could not re-read credentials after refresh. Keeping the current token"
            ),
        }
        self.attempts.reset();
    }

    async fn run_session(
        &mut self,
        session_id: Uuid,
        attempt: u32,
        shutdown_rx: &mut oneshot::Receiver<()>,
    ) -> SessionEnd {
        tracing::info!(
            channel.name = %self.settings.channel,
            session.id = %session_id,
            attempt,
            server.address = %self.connector.endpoint(),
            "Connecting to Twitch IRC as {}...",
            self.settings.nick
        );

        let connected = tokio::select! {
            biased;
            _ = &mut *shutdown_rx => return SessionEnd::Shutdown,
            result = self.connector.connect() => result,
        };
        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => return SessionEnd::Failed(format!("connect failed: {}", e)),
        };

        let (reader, mut writer) = tokio::io::split(stream);
        let end = self
            .drive_session(session_id, reader, &mut writer, shutdown_rx)
            .await;

        if let Err(e) = writer.shutdown().await {
            tracing::warn!(
                channel.name = %self.settings.channel,
                session.id = %session_id,
                error = %e,
                "Failed to close IRC session cleanly"
            );
        }
        tracing::debug!(
            channel.name = %self.settings.channel,
            session.id = %session_id,
            outcome = ?end,
            "IRC session closed"
        );
        end
    }

    async fn drive_session(
        &mut self,
        session_id: Uuid,
        reader: tokio::io::ReadHalf<BoxedChatStream>,
        writer: &mut WriteHalf<BoxedChatStream>,
        shutdown_rx: &mut oneshot::Receiver<()>,
    ) -> SessionEnd {
        if let Err(e) = self.login(writer).await {
            return SessionEnd::Failed(format!("login failed: {}", e));
        }
        tracing::debug!(
            channel.name = %self.settings.channel,
            session.id = %session_id,
            "Login sent. Waiting for the server to accept it"
        );

        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(1024);
        // Twitch answers a bad token with a NOTICE and then closes, so the
        // session only counts once some other line has arrived.
        let mut established = false;
        loop {
            buf.clear();
            tokio::select! {
                biased;
                _ = &mut *shutdown_rx => return SessionEnd::Shutdown,
                _ = self.refresh.wait() => {
                    tracing::info!(
                        channel.name = %self.settings.channel,
                        session.id = %session_id,
                        "Refresh signal received. Reconnecting with new credentials"
                    );
                    return SessionEnd::Refresh;
                }
                read = reader.read_until(b'\n', &mut buf) => match read {
                    Ok(0) if established => return SessionEnd::RemoteClosed,
                    Ok(0) => {
                        return SessionEnd::Failed(
                            "connection closed before the login was accepted".to_string(),
                        );
                    }
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        if let Some(end) = self.handle_line(session_id, &line, writer).await {
                            return end;
                        }
                        if !established && !line.trim().is_empty() {
                            established = true;
                            self.mark_established(session_id);
                        }
                    }
                    Err(e) => return SessionEnd::Failed(format!("read error: {}", e)),
                },
            }
        }
    }

    fn mark_established(&mut self, session_id: Uuid) {
        self.attempts.reset();
        self.publish(ConnectionStatus::Connected);
        tracing::info!(
            channel.name = %self.settings.channel,
            session.id = %session_id,
            "Authenticated and joined channel"
        );
    }

    async fn login<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> std::io::Result<()> {
        if self.settings.request_tags {
            write_line(writer, TWITCH_CAPABILITIES).await?;
        }
        let pass = format!(
            "{} {}{}",
            CMD_PASS,
            TOKEN_SCHEME_PREFIX,
            bearer_token(&self.token)
        );
        write_line(writer, &pass).await?;
        write_line(writer, &format!("{} {}", CMD_NICK, self.settings.nick)).await?;
        write_line(writer, &format!("{} #{}", CMD_JOIN, self.settings.channel)).await?;
        writer.flush().await
    }

    async fn handle_line<W: AsyncWrite + Unpin>(
        &self,
        session_id: Uuid,
        raw: &str,
        writer: &mut W,
    ) -> Option<SessionEnd> {
        let line = raw.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return None;
        }
        if is_auth_failure_notice(line) {
            tracing::error!(
                channel.name = %self.settings.channel,
                session.id = %session_id,
                notice = %line,
                "Twitch rejected the login"
            );
            return Some(SessionEnd::Failed(
                "authentication rejected by server".to_string(),
            ));
        }

        match IrcLine::parse(line) {
            IrcLine::Ping => {
                tracing::trace!(session.id = %session_id, "PING received. Sending PONG");
                if let Err(e) = flush_line(writer, PONG_REPLY).await {
                    return Some(SessionEnd::Failed(format!("failed to send PONG: {}", e)));
                }
            }
            IrcLine::PrivMsg(msg) => {
                let event = ChatEvent {
                    channel: msg.channel.to_string(),
                    author: msg.user.to_string(),
                    author_id: msg.user_id().map(str::to_string),
                    content: sanitize_content(msg.message),
                    tags: msg.tag_map(),
                };
                self.sink.emit(&event);

                if self.settings.reply_to_ping_command && msg.message.trim() == PING_COMMAND {
                    let reply = format!(
                        "{} #{} :{}",
                        CMD_PRIVMSG, self.settings.channel, PING_COMMAND_REPLY
                    );
                    if let Err(e) = flush_line(writer, &reply).await {
                        return Some(SessionEnd::Failed(format!(
                            "failed to answer {}: {}",
                            PING_COMMAND, e
                        )));
                    }
                }
            }
            IrcLine::Other {
                diagnostic: Some(reason),
            } => {
                tracing::debug!(
                    session.id = %session_id,
                    reason,
                    line = %line,
                    "Skipping malformed PRIVMSG"
                );
            }
            IrcLine::Other { diagnostic: None } => {
                tracing::debug!(session.id = %session_id, line = %line, "Unhandled IRC line");
            }
        }
        None
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(format!("{}\r\n", line).as_bytes()).await
}

async fn flush_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    write_line(writer, line).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twitch::sink::collecting::channel_sink;
    use crate::twitch::token_store::memory::MemoryStore;
    use crate::twitch::transport::scripted::ScriptedConnector;
    use crate::twitch::types::Credentials;
    use tokio::io::{DuplexStream, Lines, ReadHalf};
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(600);

    struct FakeServer {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeServer {
        fn new(stream: DuplexStream) -> Self {
            let (reader, writer) = tokio::io::split(stream);
            Self {
                lines: BufReader::new(reader).lines(),
                writer,
            }
        }

        async fn next_line(&mut self) -> Option<String> {
            tokio::time::timeout(WAIT, self.lines.next_line())
                .await
                .expect("timed out waiting for client line")
                .expect("server read failed")
        }

        async fn read_login(&mut self) -> Vec<String> {
            let mut login = Vec::new();
            for _ in 0..3 {
                login.push(self.next_line().await.expect("client closed during login"));
            }
            login
        }

        async fn welcome(&mut self) {
            self.send(":tmi.twitch.tv 001 bot :Welcome, GLHF!").await;
        }

        async fn reject_login(&mut self) {
            self.read_login().await;
            self.send(":tmi.twitch.tv NOTICE * :Login authentication failed")
                .await;
        }

        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{}\r\n", line).as_bytes())
                .await
                .unwrap();
        }

        async fn remaining_lines(&mut self) -> Vec<String> {
            let mut rest = Vec::new();
            while let Some(line) = self.next_line().await {
                rest.push(line);
            }
            rest
        }
    }

    struct Harness {
        connector: Arc<ScriptedConnector>,
        store: Arc<MemoryStore>,
        events: mpsc::UnboundedReceiver<ChatEvent>,
        refresh: RefreshSignal,
        status: watch::Receiver<ConnectionStatus>,
        shutdown_tx: Option<oneshot::Sender<()>>,
        task: tokio::task::JoinHandle<SupervisorExit>,
    }

    fn settings(max_attempts: Option<u32>) -> SupervisorSettings {
        SupervisorSettings {
            channel: "#SomeChannel".to_string(),
            nick: "bot".to_string(),
            retry: RetryPolicy {
                base: Duration::from_secs(5),
                max: Duration::from_secs(300),
                max_attempts,
            },
            request_tags: false,
            reply_to_ping_command: true,
        }
    }

    fn start(settings: SupervisorSettings, connector: Arc<ScriptedConnector>) -> Harness {
        let store = Arc::new(MemoryStore::with(Credentials::default()));
        let (sink, events) = channel_sink();
        let refresh = RefreshSignal::new();
        let supervisor = ConnectionSupervisor::new(
            settings,
            "old-token".to_string(),
            connector.clone(),
            store.clone(),
            Arc::new(sink),
            refresh.clone(),
        );
        let status = supervisor.status();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(supervisor.run(shutdown_rx));
        Harness {
            connector,
            store,
            events,
            refresh,
            status,
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    impl Harness {
        async fn stop(&mut self) -> SupervisorExit {
            if let Some(tx) = self.shutdown_tx.take() {
                let _ = tx.send(());
            }
            tokio::time::timeout(WAIT, &mut self.task)
                .await
                .expect("supervisor did not stop")
                .unwrap()
        }

        async fn wait_status(&mut self, check: impl FnMut(&ConnectionStatus) -> bool) {
            tokio::time::timeout(WAIT, self.status.wait_for(check))
                .await
                .expect("status never reached")
                .unwrap();
        }
    }

    fn privmsg(user: &str, text: &str) -> String {
        format!(":{user}!{user}@{user}.tmi.twitch.tv PRIVMSG #somechannel :{text}")
    }

    #[tokio::test]
    async fn test_login_sequence() {
        let connector = Arc::new(ScriptedConnector::default());
        let mut server = FakeServer::new(connector.push_session());
        let mut harness = start(settings(None), connector);

        assert_eq!(
            server.read_login().await,
            ["PASS oauth:old-token", "NICK bot", "JOIN #somechannel"]
        );
        assert!(matches!(
            &*harness.status.borrow(),
            ConnectionStatus::Connecting { attempt: 1 }
        ));
        server.welcome().await;
        harness
            .wait_status(|s| *s == ConnectionStatus::Connected)
            .await;
        assert_eq!(harness.stop().await, SupervisorExit::Cancelled);
    }

    #[tokio::test]
    async fn test_requests_capabilities_before_login() {
        let connector = Arc::new(ScriptedConnector::default());
        let mut server = FakeServer::new(connector.push_session());
        let mut harness = start(
            SupervisorSettings {
                request_tags: true,
                ..settings(None)
            },
            connector,
        );

        assert_eq!(server.next_line().await.as_deref(), Some(TWITCH_CAPABILITIES));
        assert_eq!(server.read_login().await[0], "PASS oauth:old-token");
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_single_pong_and_ordered_events() {
        let connector = Arc::new(ScriptedConnector::default());
        let mut server = FakeServer::new(connector.push_session());
        let mut harness = start(settings(None), connector);
        server.read_login().await;

        for i in 0..10 {
            if i == 4 {
                server.send("PING :tmi.twitch.tv").await;
            } else {
                server.send(&privmsg("viewer", &format!("message {}", i))).await;
            }
        }

        let mut contents = Vec::new();
        for _ in 0..9 {
            let event = tokio::time::timeout(WAIT, harness.events.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.channel, "somechannel");
            assert_eq!(event.author, "viewer");
            assert_eq!(event.author_id, None);
            contents.push(event.content);
        }
        let expected: Vec<String> = (0..10)
            .filter(|i| *i != 4)
            .map(|i| format!("message {}", i))
            .collect();
        assert_eq!(contents, expected);

        assert_eq!(harness.stop().await, SupervisorExit::Cancelled);
        let sent = server.remaining_lines().await;
        assert_eq!(sent, [PONG_REPLY]);
    }

    #[tokio::test]
    async fn test_tagged_message_sanitized_with_author_id() {
        let connector = Arc::new(ScriptedConnector::default());
        let mut server = FakeServer::new(connector.push_session());
        let mut harness = start(settings(None), connector);
        server.read_login().await;

        server
            .send("@display-name=Ann;user-id=42 :ann!ann@ann.tmi.twitch.tv PRIVMSG #somechannel :look   https://spam.example/x   here")
            .await;
        let event = harness.events.recv().await.unwrap();
        assert_eq!(event.author, "ann");
        assert_eq!(event.author_id.as_deref(), Some("42"));
        assert_eq!(event.content, "look here");
        assert_eq!(event.tags.get("display-name").map(String::as_str), Some("Ann"));
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_ping_command_gets_reply() {
        let connector = Arc::new(ScriptedConnector::default());
        let mut server = FakeServer::new(connector.push_session());
        let mut harness = start(settings(None), connector);
        server.read_login().await;

        server.send(&privmsg("viewer", "!ping")).await;
        assert_eq!(
            server.next_line().await.as_deref(),
            Some("PRIVMSG #somechannel :pong")
        );
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_refresh_reconnects_with_stored_token() {
        let connector = Arc::new(ScriptedConnector::default());
        let mut first = FakeServer::new(connector.push_session());
        let mut second = FakeServer::new(connector.push_session());
        let mut harness = start(settings(None), connector);

        assert_eq!(first.read_login().await[0], "PASS oauth:old-token");
        first.welcome().await;
        harness
            .wait_status(|s| *s == ConnectionStatus::Connected)
            .await;

        harness.store.set(Credentials {
            access_token: Some("oauth:new-token".to_string()),
            refresh_token: Some("rt".to_string()),
            expires_at: Some(chrono::Utc::now().timestamp() + 3600),
        });
        harness.refresh.set();

        assert!(first.remaining_lines().await.is_empty());
        assert_eq!(second.read_login().await[0], "PASS oauth:new-token");
        assert!(!harness.refresh.is_set());
        assert_eq!(harness.connector.attempts(), 2);
        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_during_backoff_resets_attempt_budget() {
        let connector = Arc::new(ScriptedConnector::default());
        connector.push_failure();
        connector.push_failure();
        let mut server = FakeServer::new(connector.push_session());
        let mut harness = start(settings(Some(2)), connector);

        harness
            .wait_status(|s| matches!(s, ConnectionStatus::Reconnecting { failed_attempt: 1, .. }))
            .await;
        harness.store.set(Credentials {
            access_token: Some("oauth:new-token".to_string()),
            ..Credentials::default()
        });
        harness.refresh.set();

        // Without the reset the second failure would exhaust the budget of two.
        assert_eq!(server.read_login().await[0], "PASS oauth:new-token");
        assert_eq!(harness.connector.attempts(), 3);
        assert_eq!(harness.stop().await, SupervisorExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let connector = Arc::new(ScriptedConnector::default());
        let mut harness = start(settings(Some(3)), connector);

        let exit = tokio::time::timeout(WAIT, &mut harness.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, SupervisorExit::AttemptsExhausted { attempts: 3 });
        assert_eq!(harness.connector.attempts(), 3);
        assert!(matches!(
            &*harness.status.borrow(),
            ConnectionStatus::Stopped { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_close_reconnects_after_pause() {
        let connector = Arc::new(ScriptedConnector::default());
        let mut first = FakeServer::new(connector.push_session());
        let mut second = FakeServer::new(connector.push_session());
        let mut harness = start(settings(None), connector);

        first.read_login().await;
        first.welcome().await;
        harness
            .wait_status(|s| *s == ConnectionStatus::Connected)
            .await;
        let before = tokio::time::Instant::now();
        drop(first);

        second.read_login().await;
        let waited = before.elapsed();
        assert!(waited >= GRACEFUL_RECONNECT_PAUSE, "reconnected after {waited:?}");
        assert!(waited < Duration::from_secs(5), "took the backoff path: {waited:?}");
        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_notice_takes_backoff_path() {
        let connector = Arc::new(ScriptedConnector::default());
        let mut server = FakeServer::new(connector.push_session());
        let mut harness = start(settings(None), connector);

        server.read_login().await;
        server
            .send(":tmi.twitch.tv NOTICE * :Login authentication failed")
            .await;
        harness
            .wait_status(|s| {
                matches!(s, ConnectionStatus::Reconnecting { reason, .. } if reason.contains("authentication"))
            })
            .await;
        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_login_rejection_exhausts_attempts() {
        let connector = Arc::new(ScriptedConnector::default());
        let mut first = FakeServer::new(connector.push_session());
        let mut second = FakeServer::new(connector.push_session());
        let _spare = FakeServer::new(connector.push_session());
        let mut harness = start(settings(Some(2)), connector);

        first.reject_login().await;
        harness
            .wait_status(|s| matches!(s, ConnectionStatus::Reconnecting { failed_attempt: 1, retry_in, .. } if *retry_in >= Duration::from_secs(5)))
            .await;
        second.reject_login().await;

        let exit = tokio::time::timeout(WAIT, &mut harness.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, SupervisorExit::AttemptsExhausted { attempts: 2 });
        assert_eq!(harness.connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_before_welcome_counts_as_failure() {
        let connector = Arc::new(ScriptedConnector::default());
        let mut server = FakeServer::new(connector.push_session());
        let mut harness = start(settings(Some(1)), connector);

        server.read_login().await;
        drop(server);

        let exit = tokio::time::timeout(WAIT, &mut harness.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, SupervisorExit::AttemptsExhausted { attempts: 1 });
        assert_eq!(harness.connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_closes_session() {
        let connector = Arc::new(ScriptedConnector::default());
        let mut server = FakeServer::new(connector.push_session());
        let mut harness = start(settings(None), connector);
        server.read_login().await;

        assert_eq!(harness.stop().await, SupervisorExit::Cancelled);
        assert!(server.remaining_lines().await.is_empty());
        assert_eq!(harness.connector.attempts(), 1);
        assert!(matches!(
            &*harness.status.borrow(),
            ConnectionStatus::Stopped { .. }
        ));
    }
}
