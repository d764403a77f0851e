use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;

use super::error::{Result as TwitchResult, TwitchError};

pub const TWITCH_IRC_HOST: &str = "irc.chat.twitch.tv";
pub const TWITCH_IRC_TLS_PORT: u16 = 6697;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Byte stream carrying the IRC session.
pub trait ChatStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ChatStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedChatStream = Box<dyn ChatStream>;

/// Opens a fresh transport for every connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> TwitchResult<BoxedChatStream>;

    /// Human-readable endpoint for logs.
    fn endpoint(&self) -> String;
}

/// TLS over TCP to the chat network, verified against the webpki roots.
#[derive(Clone)]
pub struct TlsChatConnector {
    host: String,
    port: u16,
    tls: TlsConnector,
}

impl TlsChatConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        Self {
            host: host.into(),
            port,
            tls: TlsConnector::from(Arc::new(config)),
        }
    }

    pub fn twitch() -> Self {
        Self::new(TWITCH_IRC_HOST, TWITCH_IRC_TLS_PORT)
    }
}

#[async_trait]
impl Connector for TlsChatConnector {
    async fn connect(&self) -> TwitchResult<BoxedChatStream> {
        let addr = self.endpoint();
        let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| TwitchError::ConnectTimeout(addr.clone()))??;
        tracing::debug!(server.address = %addr, "TCP connected, starting TLS handshake");

        let server_name = rustls::pki_types::ServerName::try_from(self.host.clone())
            .map_err(|e| TwitchError::InvalidServerName(format!("{}: {}", self.host, e)))?;
        let stream = self
            .tls
            .connect(server_name, tcp)
            .await
            .map_err(|e| TwitchError::Tls {
                host: self.host.clone(),
                reason: e.to_string(),
            })?;
        tracing::debug!(server.address = %addr, "TLS handshake complete");
        Ok(Box::new(stream))
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::io::DuplexStream;

    /// Hands out pre-arranged in-memory streams, one per `connect`.
    /// Once the script is exhausted every attempt fails.
    #[derive(Default)]
    pub struct ScriptedConnector {
        script: Mutex<VecDeque<TwitchResult<DuplexStream>>>,
        pub attempts: Mutex<u32>,
    }

    impl ScriptedConnector {
        /// Queues a working connection and returns the server side of it.
        pub fn push_session(&self) -> DuplexStream {
            let (client, server) = tokio::io::duplex(64 * 1024);
            self.script.lock().unwrap().push_back(Ok(client));
            server
        }

        pub fn push_failure(&self) {
            self.script
                .lock()
                .unwrap()
                .push_back(Err(TwitchError::ConnectTimeout("scripted".to_string())));
        }

        pub fn attempts(&self) -> u32 {
            *self.attempts.lock().unwrap()
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self) -> TwitchResult<BoxedChatStream> {
            *self.attempts.lock().unwrap() += 1;
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Ok(stream)) => Ok(Box::new(stream)),
                Some(Err(e)) => Err(e),
                None => Err(TwitchError::ConnectTimeout("script exhausted".to_string())),
            }
        }

        fn endpoint(&self) -> String {
            "scripted:0".to_string()
        }
    }
}
