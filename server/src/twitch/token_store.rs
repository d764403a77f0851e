use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::error::{Result as TwitchResult, TwitchError};
use super::types::Credentials;

pub const ACCESS_TOKEN_KEY: &str = "TWITCH_IRC_TOKEN";
pub const REFRESH_TOKEN_KEY: &str = "TWITCH_REFRESH_TOKEN";
pub const EXPIRES_AT_KEY: &str = "TWITCH_TOKEN_EXPIRES_AT";
pub const TOKEN_SCHEME_PREFIX: &str = "oauth:";

/// Where the access/refresh token pair lives between runs.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Missing file or keys yield `None` fields, not an error.
    async fn read(&self) -> TwitchResult<Credentials>;

    /// Persists a fresh token pair. `expires_at` becomes `now + expires_in`.
    /// A `None` refresh token keeps whatever is stored.
    async fn write(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_in: u64,
    ) -> TwitchResult<Credentials>;
}

/// Strips the IRC `oauth:` scheme so the token can be sent as an HTTP bearer.
pub fn bearer_token(token: &str) -> &str {
    token.strip_prefix(TOKEN_SCHEME_PREFIX).unwrap_or(token)
}

/// Credential store backed by a dotenv-style `KEY=VALUE` file.
#[derive(Debug, Clone)]
pub struct EnvFileStore {
    path: PathBuf,
}

impl EnvFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load_raw(&self) -> TwitchResult<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(TwitchError::Io(e)),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| ".env".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CredentialStore for EnvFileStore {
    async fn read(&self) -> TwitchResult<Credentials> {
        let contents = self.load_raw().await?;
        Ok(credentials_from_pairs(&parse_env_lines(&contents)))
    }

    async fn write(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_in: u64,
    ) -> TwitchResult<Credentials> {
        let expires_at = chrono::Utc::now().timestamp() + expires_in as i64;
        let access_value = format!("{}{}", TOKEN_SCHEME_PREFIX, bearer_token(access_token));
        let expires_value = expires_at.to_string();

        let mut updates = vec![
            (ACCESS_TOKEN_KEY, access_value.as_str()),
            (EXPIRES_AT_KEY, expires_value.as_str()),
        ];
        if let Some(refresh) = refresh_token {
            updates.push((REFRESH_TOKEN_KEY, refresh));
        }

        let existing = self.load_raw().await?;
        let merged = merge_env_lines(&existing, &updates);

        // Whole-file replace so readers never observe a half-written file.
        let temp_path = self.temp_path();
        tokio::fs::write(&temp_path, merged.as_bytes()).await?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| {
                TwitchError::Store(format!(
                    "failed to replace {}: {}",
                    self.path.display(),
                    e
                ))
            })?;

        tracing::debug!(
            store.path = %self.path.display(),
            expires_at,
            "Credentials persisted"
        );

        Ok(credentials_from_pairs(&parse_env_lines(&merged)))
    }
}

fn parse_env_lines(contents: &str) -> Vec<(&str, &str)> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .collect()
}

fn credentials_from_pairs(pairs: &[(&str, &str)]) -> Credentials {
    // Later duplicates win, matching dotenv semantics.
    let lookup = |key: &str| {
        pairs
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
            .filter(|v| !v.is_empty())
    };
    Credentials {
        access_token: lookup(ACCESS_TOKEN_KEY).map(str::to_string),
        refresh_token: lookup(REFRESH_TOKEN_KEY).map(str::to_string),
        expires_at: lookup(EXPIRES_AT_KEY).and_then(|v| v.trim().parse().ok()),
    }
}

/// Rewrites values of `updates` in place and appends missing keys. Other
/// lines, comments included, are kept in order.
fn merge_env_lines(existing: &str, updates: &[(&str, &str)]) -> String {
    let mut written = vec![false; updates.len()];
    let mut out = String::with_capacity(existing.len() + 128);

    for line in existing.lines() {
        let key = line.split_once('=').map(|(k, _)| k.trim());
        match key.and_then(|k| updates.iter().position(|(uk, _)| *uk == k)) {
            Some(idx) if !written[idx] => {
                written[idx] = true;
                out.push_str(updates[idx].0);
                out.push('=');
                out.push_str(updates[idx].1);
            }
            Some(_) => continue,
            None => out.push_str(line),
        }
        out.push('\n');
    }

    for (idx, (key, value)) in updates.iter().enumerate() {
        if !written[idx] {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
    }
    out
}
