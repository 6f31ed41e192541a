use crate::api::ApiClient;
use crate::config::{AuthConfig, DeviceInfo};
use crate::store::KeyValueStore;
use crate::store::traits::keys;
use crate::types::Credential;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("session expired: refresh and re-authentication both failed")]
    Expired,
}

/// Owns the credential lifecycle. A fresh credential is reused as-is; one in
/// the middle window gets a lightweight refresh; anything older goes through
/// full re-authentication.
///
/// All credential decisions happen under one lock, so concurrent callers
/// serialize: whoever waits re-reads the (now refreshed) credential age
/// instead of firing a second network call.
pub struct TokenManager {
    api: Arc<ApiClient>,
    storage: Arc<dyn KeyValueStore>,
    device: DeviceInfo,
    config: AuthConfig,
    credential: Mutex<Option<Credential>>,
    refresher_started: AtomicBool,
    shutdown: Notify,
}

impl TokenManager {
    pub fn new(
        api: Arc<ApiClient>,
        storage: Arc<dyn KeyValueStore>,
        device: DeviceInfo,
        config: AuthConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            storage,
            device,
            config,
            credential: Mutex::new(None),
            refresher_started: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    /// Loads persisted tokens into the in-memory slot. A credential restored
    /// this way has an unknown age and is treated as maximally stale, so the
    /// next [`Self::ensure_valid`] re-authenticates before using it.
    pub async fn bootstrap(&self) {
        let mut slot = self.credential.lock().await;
        if slot.is_some() {
            return;
        }
        let access = self.read_key(keys::TOKEN).await;
        let refresh = self.read_key(keys::REFRESH_TOKEN).await;
        if let (Some(access), Some(refresh)) = (access, refresh) {
            debug!(target: "Client/Auth", "Restored persisted credentials");
            self.api.set_token(&access);
            *slot = Some(Credential::restored(access, refresh));
        }
    }

    /// Installs a token pair obtained from an interactive login.
    pub async fn set_tokens(&self, access_token: &str, refresh_token: &str) {
        let cred = Credential::new(access_token, refresh_token);
        self.api.set_token(access_token);
        self.persist(&cred).await;
        *self.credential.lock().await = Some(cred);
    }

    /// Returns a credential usable right now.
    ///
    /// Age decides the path: under the fresh window the cached credential is
    /// returned as-is; under the stale window a refresh is attempted first;
    /// anything older (or a failed refresh) goes through the refresh-token
    /// grant. When that also fails the session is expired and the caller
    /// must send the user back to login.
    pub async fn ensure_valid(&self) -> Result<Credential, AuthError> {
        let mut slot = self.credential.lock().await;
        if let Some(cred) = slot.clone() {
            let age = cred.age();
            if age < self.config.fresh_window {
                return Ok(cred);
            }
            if age < self.config.stale_window {
                match self.refresh_locked(&mut slot).await {
                    Ok(cred) => return Ok(cred),
                    Err(e) => {
                        warn!(
                            target: "Client/Auth",
                            "Opportunistic refresh failed, falling back to re-authentication: {e}"
                        );
                    }
                }
            }
        }
        self.reauthenticate_locked(&mut slot).await
    }

    /// Starts the periodic background refresh. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.refresher_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            manager.refresh_loop().await;
        });
    }

    /// Cancels the background refresh and purges every stored credential.
    pub async fn stop(&self) {
        self.refresher_started.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        *self.credential.lock().await = None;
        self.api.clear_token();
        for key in [keys::TOKEN, keys::REFRESH_TOKEN, keys::SOCKET_TOKEN] {
            if let Err(e) = self.storage.remove(key).await {
                warn!(target: "Client/Auth", "Failed to remove credential key '{key}': {e}");
            }
        }
        info!(target: "Client/Auth", "Credentials purged");
    }

    async fn refresh_loop(self: Arc<Self>) {
        debug!(target: "Client/Auth", "Background refresh task started");
        while self.refresher_started.load(Ordering::SeqCst) {
            tokio::select! {
                _ = tokio::time::sleep(self.config.refresh_interval) => {
                    if !self.refresher_started.load(Ordering::SeqCst) {
                        break;
                    }
                    self.scheduled_refresh().await;
                }
                _ = self.shutdown.notified() => break,
            }
        }
        debug!(target: "Client/Auth", "Background refresh task stopped");
    }

    async fn scheduled_refresh(&self) {
        let mut slot = self.credential.lock().await;
        if slot.is_none() {
            return;
        }
        if let Err(e) = self.refresh_locked(&mut slot).await {
            warn!(target: "Client/Auth", "Scheduled refresh failed: {e}");
            if let Err(e) = self.reauthenticate_locked(&mut slot).await {
                warn!(target: "Client/Auth", "Scheduled re-authentication failed: {e}");
            }
        }
    }

    async fn refresh_locked(
        &self,
        slot: &mut Option<Credential>,
    ) -> Result<Credential, crate::api::ApiError> {
        let refreshed = self.api.refresh_token().await?;
        let refresh_token = slot
            .as_ref()
            .map(|c| c.refresh_token.clone())
            .unwrap_or_default();
        let cred = Credential::new(refreshed.token, refresh_token);
        self.api.set_token(&cred.access_token);
        self.persist(&cred).await;
        *slot = Some(cred.clone());
        debug!(target: "Client/Auth", "Access token refreshed");
        Ok(cred)
    }

    async fn reauthenticate_locked(
        &self,
        slot: &mut Option<Credential>,
    ) -> Result<Credential, AuthError> {
        let (access, refresh) = match slot.as_ref() {
            Some(cred) => (cred.access_token.clone(), cred.refresh_token.clone()),
            None => {
                let access = self.read_key(keys::TOKEN).await;
                let refresh = self.read_key(keys::REFRESH_TOKEN).await;
                match (access, refresh) {
                    (Some(access), Some(refresh)) => (access, refresh),
                    _ => {
                        info!(target: "Client/Auth", "No credentials to re-authenticate with");
                        return Err(AuthError::Expired);
                    }
                }
            }
        };

        match self
            .api
            .grant_access_token(&access, &refresh, &self.device)
            .await
        {
            Ok(granted) => {
                // The server rotates the refresh token at its discretion.
                let refresh_token = granted.refresh_token.unwrap_or(refresh);
                let cred = Credential::new(granted.token, refresh_token);
                self.api.set_token(&cred.access_token);
                self.persist(&cred).await;
                *slot = Some(cred.clone());
                info!(target: "Client/Auth", "Re-authenticated via refresh token grant");
                Ok(cred)
            }
            Err(e) => {
                warn!(target: "Client/Auth", "Re-authentication failed: {e}");
                Err(AuthError::Expired)
            }
        }
    }

    async fn persist(&self, cred: &Credential) {
        if let Err(e) = self.storage.set(keys::TOKEN, &cred.access_token).await {
            warn!(target: "Client/Auth", "Failed to persist access token: {e}");
        }
        if let Err(e) = self
            .storage
            .set(keys::REFRESH_TOKEN, &cred.refresh_token)
            .await
        {
            warn!(target: "Client/Auth", "Failed to persist refresh token: {e}");
        }
    }

    async fn read_key(&self, key: &str) -> Option<String> {
        match self.storage.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(target: "Client/Auth", "Failed to read '{key}' from storage: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{HttpClient, HttpRequest, HttpResponse};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Routes by URL suffix and counts calls per endpoint.
    struct RoutedHttpClient {
        refresh_status: u16,
        grant_status: u16,
        counts: StdMutex<HashMap<&'static str, usize>>,
    }

    impl RoutedHttpClient {
        fn new(refresh_status: u16, grant_status: u16) -> Arc<Self> {
            Arc::new(Self {
                refresh_status,
                grant_status,
                counts: StdMutex::new(HashMap::new()),
            })
        }

        fn count(&self, endpoint: &str) -> usize {
            *self.counts.lock().unwrap().get(endpoint).unwrap_or(&0)
        }
    }

    #[async_trait]
    impl HttpClient for RoutedHttpClient {
        async fn execute(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
            let (endpoint, status, body) = if request.url.ends_with("refresh_token") {
                (
                    "refresh",
                    self.refresh_status,
                    r#"{"token":"refreshed-access"}"#,
                )
            } else if request.url.ends_with("grant_access_token") {
                (
                    "grant",
                    self.grant_status,
                    r#"{"token":"granted-access","refreshToken":"granted-refresh"}"#,
                )
            } else {
                ("other", 200, "{}")
            };
            *self.counts.lock().unwrap().entry(endpoint).or_insert(0) += 1;
            Ok(HttpResponse {
                status_code: status,
                body: body.as_bytes().to_vec(),
            })
        }
    }

    fn manager_with(
        http: Arc<RoutedHttpClient>,
        storage: MemoryStore,
        config: AuthConfig,
    ) -> Arc<TokenManager> {
        let api = Arc::new(ApiClient::new("http://host/", http));
        TokenManager::new(
            api,
            Arc::new(storage),
            DeviceInfo {
                uuid: "test-device".into(),
                serial: "serial".into(),
                manufacturer: "test".into(),
            },
            config,
        )
    }

    #[tokio::test]
    async fn fresh_credential_is_reused_without_network() {
        let http = RoutedHttpClient::new(200, 200);
        let manager = manager_with(http.clone(), MemoryStore::new(), AuthConfig::default());
        manager.set_tokens("access", "refresh").await;

        let cred = manager.ensure_valid().await.unwrap();

        assert_eq!(cred.access_token, "access");
        assert_eq!(http.count("refresh"), 0);
        assert_eq!(http.count("grant"), 0);
    }

    #[tokio::test]
    async fn mid_window_credential_gets_refreshed() {
        let http = RoutedHttpClient::new(200, 200);
        let config = AuthConfig {
            fresh_window: Duration::ZERO,
            stale_window: Duration::from_secs(3600),
            ..AuthConfig::default()
        };
        let manager = manager_with(http.clone(), MemoryStore::new(), config);
        manager.set_tokens("access", "refresh").await;

        let cred = manager.ensure_valid().await.unwrap();

        assert_eq!(cred.access_token, "refreshed-access");
        assert_eq!(cred.refresh_token, "refresh");
        assert_eq!(http.count("refresh"), 1);
        assert_eq!(http.count("grant"), 0);
    }

    #[tokio::test]
    async fn stale_credential_goes_through_the_grant() {
        let http = RoutedHttpClient::new(200, 200);
        let config = AuthConfig {
            fresh_window: Duration::ZERO,
            stale_window: Duration::ZERO,
            ..AuthConfig::default()
        };
        let manager = manager_with(http.clone(), MemoryStore::new(), config);
        manager.set_tokens("access", "refresh").await;

        let cred = manager.ensure_valid().await.unwrap();

        assert_eq!(cred.access_token, "granted-access");
        assert_eq!(cred.refresh_token, "granted-refresh");
        assert_eq!(http.count("grant"), 1);
    }

    #[tokio::test]
    async fn failed_refresh_falls_back_to_the_grant() {
        let http = RoutedHttpClient::new(500, 200);
        let config = AuthConfig {
            fresh_window: Duration::ZERO,
            stale_window: Duration::from_secs(3600),
            ..AuthConfig::default()
        };
        let manager = manager_with(http.clone(), MemoryStore::new(), config);
        manager.set_tokens("access", "refresh").await;

        let cred = manager.ensure_valid().await.unwrap();

        assert_eq!(cred.access_token, "granted-access");
        assert_eq!(http.count("refresh"), 1);
        assert_eq!(http.count("grant"), 1);
    }

    #[tokio::test]
    async fn expired_when_both_paths_fail() {
        let http = RoutedHttpClient::new(500, 401);
        let config = AuthConfig {
            fresh_window: Duration::ZERO,
            stale_window: Duration::ZERO,
            ..AuthConfig::default()
        };
        let manager = manager_with(http.clone(), MemoryStore::new(), config);
        manager.set_tokens("access", "refresh").await;

        assert!(matches!(
            manager.ensure_valid().await,
            Err(AuthError::Expired)
        ));
    }

    #[tokio::test]
    async fn no_credentials_anywhere_is_expired() {
        let http = RoutedHttpClient::new(200, 200);
        let manager = manager_with(http, MemoryStore::new(), AuthConfig::default());
        assert!(matches!(
            manager.ensure_valid().await,
            Err(AuthError::Expired)
        ));
    }

    #[tokio::test]
    async fn restored_credentials_reauthenticate_before_use() {
        let http = RoutedHttpClient::new(200, 200);
        let storage = MemoryStore::new();
        storage.set(keys::TOKEN, "old-access").await.unwrap();
        storage.set(keys::REFRESH_TOKEN, "old-refresh").await.unwrap();
        let manager = manager_with(http.clone(), storage, AuthConfig::default());

        manager.bootstrap().await;
        let cred = manager.ensure_valid().await.unwrap();

        assert_eq!(cred.access_token, "granted-access");
        assert_eq!(http.count("grant"), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_network_round_trip() {
        let http = RoutedHttpClient::new(200, 200);
        let storage = MemoryStore::new();
        storage.set(keys::TOKEN, "old-access").await.unwrap();
        storage.set(keys::REFRESH_TOKEN, "old-refresh").await.unwrap();
        let manager = manager_with(http.clone(), storage, AuthConfig::default());
        manager.bootstrap().await;

        let (a, b) = tokio::join!(manager.ensure_valid(), manager.ensure_valid());

        assert_eq!(a.unwrap().access_token, "granted-access");
        assert_eq!(b.unwrap().access_token, "granted-access");
        assert_eq!(http.count("grant"), 1);
    }

    #[tokio::test]
    async fn stop_purges_memory_and_storage() {
        let http = RoutedHttpClient::new(200, 200);
        let storage = MemoryStore::new();
        let manager = manager_with(http, storage.clone(), AuthConfig::default());
        manager.set_tokens("access", "refresh").await;
        storage.set(keys::SOCKET_TOKEN, "rotated").await.unwrap();

        manager.stop().await;

        assert_eq!(storage.get(keys::TOKEN).await.unwrap(), None);
        assert_eq!(storage.get(keys::REFRESH_TOKEN).await.unwrap(), None);
        assert_eq!(storage.get(keys::SOCKET_TOKEN).await.unwrap(), None);
        assert!(matches!(
            manager.ensure_valid().await,
            Err(AuthError::Expired)
        ));
    }

    #[tokio::test]
    async fn background_task_refreshes_on_schedule_and_stops() {
        let http = RoutedHttpClient::new(200, 200);
        let config = AuthConfig {
            refresh_interval: Duration::from_millis(20),
            ..AuthConfig::default()
        };
        let manager = manager_with(http.clone(), MemoryStore::new(), config);
        manager.set_tokens("access", "refresh").await;

        manager.start();
        tokio::time::sleep(Duration::from_millis(120)).await;
        let refreshed = http.count("refresh");
        assert!(refreshed >= 2, "expected periodic refreshes, got {refreshed}");

        manager.stop().await;
        // Reinstall credentials so a still-running task would keep counting.
        manager.set_tokens("access2", "refresh2").await;
        let after_stop = http.count("refresh");
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(http.count("refresh"), after_stop);
    }
}
