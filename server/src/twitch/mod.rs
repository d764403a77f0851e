pub mod aggregator;
pub mod auth;
pub mod backoff;
pub mod error;
pub mod irc_parser;
pub mod refresher;
pub mod sanitize;
pub mod signal;
pub mod sink;
pub mod supervisor;
pub mod token_store;
pub mod transport;
pub mod types;

pub use aggregator::{ChatAggregator, IngestionMode};
pub use auth::TwitchOAuthClient;
pub use error::TwitchError;
pub use token_store::{CredentialStore, EnvFileStore};
pub use types::LifecycleEvent;
