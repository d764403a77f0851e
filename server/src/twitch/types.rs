use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// State machine published by the connection supervisor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ConnectionStatus {
    Initializing,
    Connecting {
        attempt: u32,
    },
    Connected,
    Reconnecting {
        reason: String,
        failed_attempt: u32,
        retry_in: Duration,
    },
    Stopped {
        reason: String,
    },
}

/// One normalized chat message, ready to be logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub channel: String,
    pub author: String,
    pub author_id: Option<String>,
    pub content: String,
    pub tags: BTreeMap<String, String>,
}

/// Token state as persisted in the credential file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
}

/// Notifications the core hands to the host process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    CredentialsRefreshed { expires_at: i64 },
    IngestionStopped { attempts: u32 },
}
