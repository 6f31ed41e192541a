use crate::api::ApiClient;
use crate::auth::TokenManager;
use crate::cache::ConversationCache;
use crate::client::Client;
use crate::config::ClientConfig;
use crate::net::HttpClient;
use crate::roster::PeerRoster;
use crate::store::KeyValueStore;
use crate::transport::TransportFactory;
use crate::types::events::{Event, EventBus, EventHandler};
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// Composition root for one signed-in account.
///
/// Builds the HTTP API, credential manager, conversation cache, roster, and
/// realtime client exactly once, wiring them through constructor arguments.
/// Embedders hand in the platform pieces (storage, HTTP, transport) and drive
/// the lifecycle from the host application: start on launch, pause/resume
/// with the foreground state, and sign out on demand.
pub struct ChatSession {
    bus: EventBus,
    api: Arc<ApiClient>,
    token_manager: Arc<TokenManager>,
    cache: Arc<ConversationCache>,
    roster: Arc<PeerRoster>,
    client: Arc<Client>,
    run_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ChatSession {
    pub fn new(
        config: ClientConfig,
        storage: Arc<dyn KeyValueStore>,
        http: Arc<dyn HttpClient>,
        transport_factory: Arc<dyn TransportFactory>,
    ) -> Arc<Self> {
        let bus = EventBus::new();
        let api = Arc::new(ApiClient::new(config.api_url.clone(), http));
        let token_manager = TokenManager::new(
            api.clone(),
            storage.clone(),
            config.device.clone(),
            config.auth.clone(),
        );
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let cache = Arc::new(ConversationCache::new(
            storage.clone(),
            api.clone(),
            bus.clone(),
            outbound_tx,
        ));
        let roster = Arc::new(PeerRoster::new(api.clone()));
        let client = Client::new(
            config,
            token_manager.clone(),
            api.clone(),
            cache.clone(),
            roster.clone(),
            storage,
            bus.clone(),
            transport_factory,
            outbound_rx,
        );
        Arc::new(Self {
            bus,
            api,
            token_manager,
            cache,
            roster,
            client,
            run_handle: Mutex::new(None),
        })
    }

    /// Installs a freshly granted credential pair, e.g. after an interactive
    /// login, and persists it for later restores.
    pub async fn sign_in(&self, access_token: &str, refresh_token: &str) {
        self.token_manager
            .set_tokens(access_token, refresh_token)
            .await;
    }

    /// Restores persisted state and brings the realtime session up in the
    /// background. Returns immediately; progress surfaces as events.
    pub async fn start(self: &Arc<Self>) {
        let mut slot = self.run_handle.lock().await;
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            warn!(target: "Client", "Session already started");
            return;
        }

        self.token_manager.bootstrap().await;
        self.cache.restore().await;
        self.token_manager.start();

        let client = self.client.clone();
        *slot = Some(tokio::spawn(async move {
            client.run().await;
        }));
    }

    /// The host moved to the background. Flushes the conversation snapshot so
    /// a kill while suspended loses nothing.
    pub async fn pause(&self) {
        self.cache.persist().await;
    }

    /// The host returned to the foreground. Revalidates credentials early so
    /// the next request does not stall on a re-authentication round trip.
    pub async fn resume(&self) {
        if self.token_manager.ensure_valid().await.is_err() {
            warn!(target: "Client", "Credentials no longer valid after resume");
            self.bus.dispatch(&Event::SessionExpired);
        }
    }

    /// Tears the session down and wipes every locally stored artifact of the
    /// account. The realtime loop stops before storage is cleared so a
    /// reconnect cannot resurrect state mid-wipe.
    pub async fn sign_out(&self) {
        info!(target: "Client", "Signing out");
        self.client.disconnect().await;
        if let Some(handle) = self.run_handle.lock().await.take() {
            let _ = handle.await;
        }
        self.token_manager.stop().await;
        self.cache.clear_on_sign_out().await;
        self.roster.clear().await;
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.bus.add_handler(handler);
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.token_manager
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn cache(&self) -> &Arc<ConversationCache> {
        &self.cache
    }

    pub fn roster(&self) -> &Arc<PeerRoster> {
        &self.roster
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{HttpRequest, HttpResponse};
    use crate::store::MemoryStore;
    use crate::store::traits::keys;
    use crate::transport::mock::MockTransportFactory;
    use crate::wire::InboundMessagePayload;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;

    struct NullHttp;

    #[async_trait]
    impl HttpClient for NullHttp {
        async fn execute(&self, _request: HttpRequest) -> anyhow::Result<HttpResponse> {
            Ok(HttpResponse {
                status_code: 200,
                body: b"{}".to_vec(),
            })
        }
    }

    struct Recorder(StdMutex<Vec<Event>>);

    impl EventHandler for Recorder {
        fn handle_event(&self, event: &Event) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn session_over(storage: MemoryStore) -> Arc<ChatSession> {
        ChatSession::new(
            ClientConfig::default(),
            Arc::new(storage),
            Arc::new(NullHttp),
            Arc::new(MockTransportFactory::new()),
        )
    }

    #[tokio::test]
    async fn sign_out_wipes_credentials_and_conversations() {
        let storage = MemoryStore::new();
        let session = session_over(storage.clone());

        session.sign_in("access", "refresh").await;
        session
            .cache()
            .receive(
                InboundMessagePayload {
                    sender_id: "p1".to_string(),
                    sender_name: "Alice".to_string(),
                    body: "hi".to_string(),
                    correlation_id: "c1".to_string(),
                    sent_at: Utc::now(),
                },
                0,
            )
            .await;
        assert!(storage.get(keys::TOKEN).await.unwrap().is_some());
        assert!(storage.get(keys::UNREAD_MESSAGES).await.unwrap().is_some());

        session.sign_out().await;

        assert!(storage.get(keys::TOKEN).await.unwrap().is_none());
        assert!(storage.get(keys::REFRESH_TOKEN).await.unwrap().is_none());
        assert!(storage.get(keys::UNREAD_MESSAGES).await.unwrap().is_none());
        assert_eq!(session.cache().total_unread().await, 0);
    }

    #[tokio::test]
    async fn resume_without_credentials_reports_expiry() {
        let session = session_over(MemoryStore::new());
        let recorder = Arc::new(Recorder(StdMutex::new(Vec::new())));
        session.add_handler(recorder.clone());

        session.resume().await;

        let recorded = recorder.0.lock().unwrap();
        assert!(matches!(recorded.as_slice(), [Event::SessionExpired]));
    }

    #[tokio::test]
    async fn start_restores_the_persisted_unread_index() {
        let storage = MemoryStore::new();
        let unread = r#"{"p1":[{"peerId":"p1","direction":"received","body":"hi","sentAt":"2024-05-01T10:00:00Z","correlationId":"c1"}]}"#;
        storage.set(keys::UNREAD_MESSAGES, unread).await.unwrap();

        let session = session_over(storage);
        session.start().await;

        assert_eq!(session.cache().unread_count("p1").await, 1);
        session.sign_out().await;
    }
}
