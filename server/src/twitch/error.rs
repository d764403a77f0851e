use thiserror::Error;

#[derive(Error, Debug)]
pub enum TwitchError {
    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS handshake with {host} failed: {reason}")]
    Tls { host: String, reason: String },
    #[error("Invalid TLS server name: {0}")]
    InvalidServerName(String),
    #[error("TCP connection to {0} timed out")]
    ConnectTimeout(String),
    #[error("Twitch IRC authentication/API error: {0}")]
    TwitchAuth(String),
    #[error("Token endpoint returned HTTP {status}: {body}")]
    TokenEndpoint { status: u16, body: String },
    #[error("Missing access token in API response")]
    MissingToken,
    #[error("Credential store error: {0}")]
    Store(String),
}

pub type Result<T, E = TwitchError> = std::result::Result<T, E>;
