// Gisma Link: REST API Client
//
// Cookie-session auth plus chat history over the server's REST surface.
// The server sets `access_token` / `refresh_token` cookies on login; they live
// in a shared reqwest cookie jar and are forwarded on the WebSocket upgrade
// via `handshake()`.

use super::transport::Handshake;
use crate::atoms::constants::*;
use crate::atoms::error::{LinkError, LinkResult};
use crate::atoms::types::{ChatMetadata, LoginRequest, Message, StoredMessage, UserInfo};
use crate::config::ClientConfig;
use log::{debug, info, warn};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub struct ApiClient {
    base: Url,
    http: reqwest::Client,
    jar: Arc<Jar>,
}

impl ApiClient {
    pub fn new(server_url: &str) -> LinkResult<Self> {
        let base = Url::parse(server_url.trim())
            .map_err(|e| LinkError::Config(format!("Invalid server URL '{}': {}", server_url, e)))?;
        let jar = Arc::new(Jar::default());
        let http = reqwest::Client::builder()
            .cookie_provider(Arc::clone(&jar))
            .timeout(Duration::from_millis(API_TIMEOUT_MS))
            .user_agent(concat!("gisma-link/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(ApiClient { base, http, jar })
    }

    pub fn from_config(config: &ClientConfig) -> LinkResult<Self> {
        Self::new(&config.server_url)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base.as_str().trim_end_matches('/'), path)
    }

    /// `Cookie` header value the jar would send to the server, if any.
    pub fn cookie_header(&self) -> Option<String> {
        self.jar
            .cookies(&self.base)
            .and_then(|v| v.to_str().ok().map(str::to_string))
    }

    /// Credentials for the WebSocket upgrade.
    pub fn handshake(&self) -> Handshake {
        Handshake { cookie: self.cookie_header(), bearer_token: None }
    }

    /// Seed the jar, e.g. with cookies persisted by an earlier run.
    pub fn add_cookie(&self, cookie: &str) {
        self.jar.add_cookie_str(cookie, &self.base);
    }

    // ── Auth ───────────────────────────────────────────────────────────

    pub async fn login(&self, username: &str, password: &str) -> LinkResult<()> {
        let body = LoginRequest { username: username.to_string(), password: password.to_string() };
        let resp = self.http.post(self.endpoint(AUTH_LOGIN)).json(&body).send().await?;
        check(resp).await?;
        info!("[api] Logged in as {}", username);
        Ok(())
    }

    pub async fn me(&self) -> LinkResult<UserInfo> {
        self.get_json(AUTH_ME).await
    }

    pub async fn refresh(&self) -> LinkResult<()> {
        let resp = self.http.post(self.endpoint(AUTH_REFRESH)).send().await?;
        check(resp).await?;
        debug!("[api] Session refreshed");
        Ok(())
    }

    pub async fn logout(&self) -> LinkResult<()> {
        let resp = self.http.post(self.endpoint(AUTH_LOGOUT)).send().await?;
        check(resp).await?;
        info!("[api] Logged out");
        Ok(())
    }

    /// Current user, refreshing the session once if the access token expired.
    pub async fn ensure_session(&self) -> LinkResult<UserInfo> {
        match self.me().await {
            Err(LinkError::Api { status: 401, .. }) => {
                warn!("[api] Access token rejected, trying refresh");
                self.refresh().await?;
                self.me().await
            }
            other => other,
        }
    }

    // ── Chat memory ────────────────────────────────────────────────────

    pub async fn list_chats(&self) -> LinkResult<Vec<ChatMetadata>> {
        self.get_json(CHAT_MEMORY).await
    }

    pub async fn chat_messages(&self, chat_id: &str) -> LinkResult<Vec<Message>> {
        let path = format!("{}/{}", CHAT_MEMORY, urlencoding::encode(chat_id));
        let stored: Vec<StoredMessage> = self.get_json(&path).await?;
        Ok(stored.into_iter().map(Message::from).collect())
    }

    pub async fn delete_chat(&self, chat_id: &str) -> LinkResult<()> {
        let url = self.endpoint(&format!("{}/{}", CHAT_MEMORY, urlencoding::encode(chat_id)));
        let resp = self.http.delete(url).send().await?;
        check(resp).await?;
        info!("[api] Deleted chat {}", chat_id);
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> LinkResult<T> {
        let resp = self.http.get(self.endpoint(path)).send().await?;
        let resp = check(resp).await?;
        let text = resp.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| LinkError::protocol(format!("Unexpected response from {}: {}", path, e)))
    }
}

/// Pass successful responses through; turn the rest into `LinkError::Api`.
async fn check(resp: reqwest::Response) -> LinkResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = error_message(status, &body);
    warn!("[api] {} {}", status.as_u16(), message);
    Err(LinkError::api(status.as_u16(), message))
}

/// User-facing text for a failed call. A server-provided `message` wins.
pub fn error_message(status: StatusCode, body: &str) -> String {
    let server = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .filter(|m| !m.trim().is_empty());
    if let Some(message) = server {
        return message;
    }
    match status.as_u16() {
        401 => "Authentication failed".into(),
        403 => "Access denied".into(),
        404 => "Resource not found".into(),
        500 => "Server error".into(),
        _ => status.canonical_reason().unwrap_or("Request failed").to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_well_known_statuses() {
        assert_eq!(error_message(StatusCode::UNAUTHORIZED, ""), "Authentication failed");
        assert_eq!(error_message(StatusCode::FORBIDDEN, "<html>"), "Access denied");
        assert_eq!(error_message(StatusCode::NOT_FOUND, "{}"), "Resource not found");
        assert_eq!(error_message(StatusCode::INTERNAL_SERVER_ERROR, ""), "Server error");
        assert_eq!(error_message(StatusCode::BAD_GATEWAY, ""), "Bad Gateway");
    }

    #[test]
    fn server_message_wins() {
        let body = r#"{"message":"Invalid username or password"}"#;
        assert_eq!(error_message(StatusCode::UNAUTHORIZED, body), "Invalid username or password");
        assert_eq!(error_message(StatusCode::UNAUTHORIZED, r#"{"message":""}"#), "Authentication failed");
    }

    #[test]
    fn endpoints_join_without_double_slash() {
        let api = ApiClient::new("http://localhost:8080/").unwrap();
        assert_eq!(api.endpoint(AUTH_LOGIN), "http://localhost:8080/auth/login");
        let api = ApiClient::new("https://chat.example.com/api").unwrap();
        assert_eq!(api.endpoint(CHAT_MEMORY), "https://chat.example.com/api/chat-memory");
    }

    #[test]
    fn session_cookies_feed_the_handshake() {
        let api = ApiClient::new("http://localhost:8080").unwrap();
        assert!(api.handshake().is_anonymous());

        api.add_cookie("access_token=abc; Path=/; HttpOnly");
        let hs = api.handshake();
        assert_eq!(hs.cookie.as_deref(), Some("access_token=abc"));
        assert!(hs.bearer_token.is_none());
    }

    #[test]
    fn invalid_base_url_is_config_error() {
        assert!(matches!(ApiClient::new("::nope"), Err(LinkError::Config(_))));
    }
}
