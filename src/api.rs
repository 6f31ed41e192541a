use crate::config::DeviceInfo;
use crate::net::{HttpClient, HttpRequest, HttpResponse};
use crate::types::{Operation, Peer};
use crate::wire::InboundMessagePayload;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("no access token available for an authenticated request")]
    NoToken,

    #[error("request failed: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("server returned status {0}")]
    Status(u16),

    #[error("malformed response: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GrantAccessTokenRequest<'a> {
    token: &'a str,
    refresh_token: &'a str,
    device_info: &'a DeviceInfo,
}

#[derive(Debug, Deserialize)]
pub struct RefreshTokenResponse {
    pub token: String,
}

/// `refresh_token` is only present when the server decided to rotate it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantAccessTokenResponse {
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OperationsResponse {
    #[serde(default)]
    operations: Vec<Operation>,
}

#[derive(Debug, Serialize)]
struct DeleteBacklogRequest<'a> {
    #[serde(rename = "userID")]
    user_id: &'a str,
}

/// Typed wrapper over the server's HTTP API.
///
/// Holds the current access token for the `Authorization: JWT <token>`
/// header; the credential manager swaps it on every refresh.
pub struct ApiClient {
    http: Arc<dyn HttpClient>,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, http: Arc<dyn HttpClient>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            token: RwLock::new(None),
        }
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write().expect("poisoned") = Some(token.into());
    }

    pub fn clear_token(&self) {
        *self.token.write().expect("poisoned") = None;
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: HttpRequest) -> Result<HttpRequest> {
        let guard = self.token.read().expect("poisoned");
        match guard.as_deref() {
            Some(token) => Ok(request.with_header("Authorization", format!("JWT {token}"))),
            None => Err(ApiError::NoToken),
        }
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let response = self
            .http
            .execute(request)
            .await
            .map_err(ApiError::Transport)?;
        if !response.is_success() {
            return Err(ApiError::Status(response.status_code));
        }
        Ok(response)
    }

    fn decode<T: DeserializeOwned>(response: &HttpResponse) -> Result<T> {
        Ok(serde_json::from_slice(&response.body)?)
    }

    /// Exchanges the current access token for a fresh one. Requires a token
    /// the server still considers acceptable for refresh.
    pub async fn refresh_token(&self) -> Result<RefreshTokenResponse> {
        let request = self.authorize(HttpRequest::post(self.url("api/login/refresh_token")))?;
        let response = self.send(request).await?;
        Self::decode(&response)
    }

    /// Full re-authentication from the long-lived refresh token. Unlike the
    /// other calls this one carries its proof in the body, not the header.
    pub async fn grant_access_token(
        &self,
        token: &str,
        refresh_token: &str,
        device: &DeviceInfo,
    ) -> Result<GrantAccessTokenResponse> {
        let body = GrantAccessTokenRequest {
            token,
            refresh_token,
            device_info: device,
        };
        let request = HttpRequest::post(self.url("api/login/grant_access_token"))
            .with_json(&body)
            .map_err(ApiError::Transport)?;
        let response = self.send(request).await?;
        Self::decode(&response)
    }

    /// Fetches the operations the server buffered while we were offline.
    pub async fn get_socket_operations(&self) -> Result<Vec<Operation>> {
        let request =
            self.authorize(HttpRequest::get(self.url("api/users/get_socket_operations")))?;
        let response = self.send(request).await?;
        let decoded: OperationsResponse = Self::decode(&response)?;
        Ok(decoded.operations)
    }

    /// Acknowledges the whole buffered batch after a successful replay.
    pub async fn delete_operations(&self) -> Result<()> {
        let request = self.authorize(HttpRequest::post(self.url("api/users/delete_operations")))?;
        self.send(request).await?;
        Ok(())
    }

    /// The roster, as a bare array.
    pub async fn get_friends(&self) -> Result<Vec<Peer>> {
        let request = self.authorize(HttpRequest::get(self.url("api/friends")))?;
        let response = self.send(request).await?;
        Self::decode(&response)
    }

    /// Messages that arrived before this device ever connected.
    pub async fn get_initial_messages(&self) -> Result<Vec<InboundMessagePayload>> {
        let request = self.authorize(HttpRequest::get(self.url("api/messages/")))?;
        let response = self.send(request).await?;
        Self::decode(&response)
    }

    /// Deletes one sender's server-side backlog once it has been read.
    pub async fn delete_initial_messages(&self, peer_id: &str) -> Result<()> {
        let body = DeleteBacklogRequest { user_id: peer_id };
        let request = self
            .authorize(HttpRequest::post(self.url("api/messages/delete_messages/")))?
            .with_json(&body)
            .map_err(ApiError::Transport)?;
        self.send(request).await?;
        Ok(())
    }

    /// Cheap reachability check. Never fails; an unreachable server is `false`.
    pub async fn heartbeat(&self) -> bool {
        let request = HttpRequest::get(self.url("api/heartbeat"));
        match self.http.execute(request).await {
            Ok(response) => response.is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingHttpClient {
        requests: Mutex<Vec<HttpRequest>>,
        response_body: &'static str,
        status: u16,
    }

    impl RecordingHttpClient {
        fn new(status: u16, response_body: &'static str) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                response_body,
                status,
            })
        }

        fn last_request(&self) -> HttpRequest {
            self.requests.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl HttpClient for RecordingHttpClient {
        async fn execute(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
            self.requests.lock().unwrap().push(request);
            Ok(HttpResponse {
                status_code: self.status,
                body: self.response_body.as_bytes().to_vec(),
            })
        }
    }

    #[tokio::test]
    async fn refresh_carries_the_jwt_header() {
        let http = RecordingHttpClient::new(200, r#"{"token":"next"}"#);
        let api = ApiClient::new("http://host/", http.clone());
        api.set_token("current");

        let refreshed = api.refresh_token().await.unwrap();

        assert_eq!(refreshed.token, "next");
        let sent = http.last_request();
        assert_eq!(sent.url, "http://host/api/login/refresh_token");
        assert_eq!(sent.headers.get("Authorization").unwrap(), "JWT current");
    }

    #[tokio::test]
    async fn refresh_without_token_is_rejected_locally() {
        let http = RecordingHttpClient::new(200, "{}");
        let api = ApiClient::new("http://host/", http);
        assert!(matches!(api.refresh_token().await, Err(ApiError::NoToken)));
    }

    #[tokio::test]
    async fn grant_posts_device_info_without_auth_header() {
        let http = RecordingHttpClient::new(200, r#"{"token":"t2","refreshToken":"r2"}"#);
        let api = ApiClient::new("http://host/", http.clone());
        let device = DeviceInfo {
            uuid: "u-1".into(),
            serial: "s-1".into(),
            manufacturer: "m".into(),
        };

        let granted = api.grant_access_token("t1", "r1", &device).await.unwrap();

        assert_eq!(granted.token, "t2");
        assert_eq!(granted.refresh_token.as_deref(), Some("r2"));
        let sent = http.last_request();
        assert!(sent.headers.get("Authorization").is_none());
        let body: serde_json::Value =
            serde_json::from_slice(sent.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["refreshToken"], "r1");
        assert_eq!(body["deviceInfo"]["uuid"], "u-1");
    }

    #[tokio::test]
    async fn non_success_status_becomes_an_error() {
        let http = RecordingHttpClient::new(401, "{}");
        let api = ApiClient::new("http://host/", http);
        api.set_token("old");
        assert!(matches!(
            api.refresh_token().await,
            Err(ApiError::Status(401))
        ));
    }

    #[tokio::test]
    async fn operations_decode_from_the_wrapper_object() {
        let http = RecordingHttpClient::new(
            200,
            r#"{"operations":[{"name":"friend:login","payload":{"friendID":"p1"}}]}"#,
        );
        let api = ApiClient::new("http://host/", http);
        api.set_token("t");

        let ops = api.get_socket_operations().await.unwrap();

        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].name, "friend:login");
        assert_eq!(ops[0].payload["friendID"], "p1");
    }

    #[tokio::test]
    async fn friends_decode_from_a_bare_array() {
        let http = RecordingHttpClient::new(200, r#"[{"id":"p1","name":"Alice","online":true}]"#);
        let api = ApiClient::new("http://host/", http.clone());
        api.set_token("t");

        let friends = api.get_friends().await.unwrap();

        assert_eq!(friends.len(), 1);
        assert!(friends[0].online);
        assert_eq!(http.last_request().url, "http://host/api/friends");
    }

    #[tokio::test]
    async fn backlog_deletion_posts_the_sender_id() {
        let http = RecordingHttpClient::new(200, "{}");
        let api = ApiClient::new("http://host/", http.clone());
        api.set_token("t");

        api.delete_initial_messages("p7").await.unwrap();

        let sent = http.last_request();
        assert_eq!(sent.url, "http://host/api/messages/delete_messages/");
        let body: serde_json::Value =
            serde_json::from_slice(sent.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["userID"], "p7");
    }

    #[tokio::test]
    async fn heartbeat_swallows_transport_failures() {
        struct DeadHttpClient;

        #[async_trait]
        impl HttpClient for DeadHttpClient {
            async fn execute(&self, _request: HttpRequest) -> anyhow::Result<HttpResponse> {
                Err(anyhow::anyhow!("connection refused"))
            }
        }

        let api = ApiClient::new("http://host/", Arc::new(DeadHttpClient));
        assert!(!api.heartbeat().await);
    }
}
