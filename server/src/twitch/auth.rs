use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::error::{Result as TwitchResult, TwitchError};
use super::token_store::bearer_token;

pub const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
pub const AUTHORIZE_URL: &str = "https://id.twitch.tv/oauth2/authorize";
pub const VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";
pub const HELIX_USERS_URL: &str = "https://api.twitch.tv/helix/users";
pub const DEFAULT_SCOPES: &[&str] = &["chat:read", "chat:edit", "channel:manage:broadcast"];
/// Lifetime assumed when the token endpoint omits `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const HELIX_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct TokenValidation {
    pub client_id: String,
    pub login: Option<String>,
    pub user_id: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub expires_in: u64,
}

#[derive(Deserialize, Debug)]
struct HelixUsers {
    data: Vec<HelixUser>,
}

#[derive(Deserialize, Debug)]
struct HelixUser {
    id: String,
}

/// The refresh half of the OAuth token endpoint, as the refresher sees it.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn refresh(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> TwitchResult<TokenResponse>;
}

#[derive(Debug, Clone)]
pub struct TwitchOAuthClient {
    http: reqwest::Client,
}

impl TwitchOAuthClient {
    pub fn new() -> TwitchResult<Self> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self { http })
    }

    /// Exchanges a one-shot authorization code for a token pair.
    pub async fn exchange_code(
        &self,
        client_id: &str,
        client_secret: &str,
        code: &str,
        redirect_uri: &str,
    ) -> TwitchResult<TokenResponse> {
        tracing::info!("[TWITCH_API] Exchanging authorization code for tokens...");
        self.post_token_form(&[
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri),
        ])
        .await
    }

    async fn post_token_form(&self, params: &[(&str, &str)]) -> TwitchResult<TokenResponse> {
        let response = self
            .http
            .post(TOKEN_URL)
            .form(params)
            .send()
            .await
            .map_err(TwitchError::Reqwest)?;

        if response.status().is_success() {
            let token_data = response
                .json::<TokenResponse>()
                .await
                .map_err(TwitchError::Reqwest)?;
            if token_data.access_token.is_empty() {
                return Err(TwitchError::MissingToken);
            }
            Ok(token_data)
        } else {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error body".to_string());
            tracing::error!(
                "[TWITCH_API] Token endpoint rejected request (HTTP {}): {}",
                status,
                error_body
            );
            Err(TwitchError::TokenEndpoint {
                status: status.as_u16(),
                body: error_body,
            })
        }
    }

    pub async fn validate(&self, access_token: &str) -> TwitchResult<TokenValidation> {
        let response = self
            .http
            .get(VALIDATE_URL)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("OAuth {}", bearer_token(access_token)),
            )
            .send()
            .await?;

        if response.status().is_success() {
            Ok(response.json::<TokenValidation>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(TwitchError::TwitchAuth(format!(
                "Token validation failed (HTTP {}): {}",
                status, body
            )))
        }
    }

    /// Resolves a login name to its numeric user id via Helix.
    pub async fn lookup_user_id(
        &self,
        client_id: &str,
        access_token: &str,
        login: &str,
    ) -> TwitchResult<Option<String>> {
        let response = self
            .http
            .get(HELIX_USERS_URL)
            .timeout(HELIX_TIMEOUT)
            .query(&[("login", login)])
            .header("Client-Id", client_id)
            .bearer_auth(bearer_token(access_token))
            .send()
            .await?;

        tracing::debug!(status = %response.status(), "Helix users lookup finished");
        if !response.status().is_success() {
            return Err(TwitchError::TwitchAuth(format!(
                "Helix users lookup failed (HTTP {})",
                response.status()
            )));
        }
        let users = response.json::<HelixUsers>().await?;
        Ok(users.data.into_iter().next().map(|user| user.id))
    }
}

#[async_trait]
impl TokenEndpoint for TwitchOAuthClient {
    async fn refresh(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> TwitchResult<TokenResponse> {
        tracing::info!("[TWITCH_API] Refreshing access token...");
        self.post_token_form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ])
        .await
    }
}

/// Builds the browser URL that starts the authorization-code flow.
pub fn authorize_url(client_id: &str, redirect_uri: &str, scopes: &[&str]) -> TwitchResult<String> {
    let scope = scopes.join(" ");
    let url = reqwest::Url::parse_with_params(
        AUTHORIZE_URL,
        &[
            ("client_id", client_id),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("scope", scope.as_str()),
        ],
    )
    .map_err(|e| TwitchError::TwitchAuth(format!("Invalid authorize URL: {}", e)))?;
    Ok(url.to_string())
}
