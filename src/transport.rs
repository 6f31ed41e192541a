use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An event produced by the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport has successfully connected.
    Connected,
    /// A raw frame has been received from the server.
    FrameReceived(Bytes),
    /// The connection was lost.
    Disconnected,
}

/// Parameters the server authenticates a socket connection with. They ride
/// on the connection URL as query parameters.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub device_id: String,
    pub auth_token: String,
}

impl ConnectParams {
    pub fn query_string(&self) -> String {
        format!(
            "id={}&auth_token={}",
            urlencoding::encode(&self.device_id),
            urlencoding::encode(&self.auth_token)
        )
    }
}

/// Represents an active network connection.
/// The transport is a dumb pipe for frames with no knowledge of the envelope
/// format carried inside them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one raw frame to the server.
    async fn send(&self, frame: &[u8]) -> Result<(), anyhow::Error>;

    /// Closes the connection.
    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Opens a connection authenticated by `params` and returns it along
    /// with a stream of events.
    async fn create_transport(
        &self,
        params: ConnectParams,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}
