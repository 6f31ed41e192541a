use serde::Serialize;
use std::time::Duration;

/// Identity of the installation, sent along with re-authentication requests
/// so the server can tie a refresh-token grant to one physical device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub uuid: String,
    pub serial: String,
    pub manufacturer: String,
}

impl DeviceInfo {
    /// Generates a throwaway identity. Real deployments pass the platform's
    /// device identifiers instead.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut raw = [0u8; 16];
        rand::rng().fill_bytes(&mut raw);
        Self {
            uuid: hex::encode(raw),
            serial: "unknown".to_string(),
            manufacturer: "unknown".to_string(),
        }
    }
}

/// Credential staleness windows and the cadence of the background refresh.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// How often the background task refreshes the access token.
    pub refresh_interval: Duration,
    /// A credential younger than this is reused without any network call.
    pub fresh_window: Duration,
    /// A credential younger than this (but past the fresh window) gets an
    /// opportunistic refresh; older ones go straight to re-authentication.
    pub stale_window: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(10 * 60),
            fresh_window: Duration::from_secs(10 * 60),
            stale_window: Duration::from_secs(25 * 60),
        }
    }
}

/// Bounds on the automatic reconnect loop.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Consecutive credential rejections tolerated before the client gives up
    /// and reports a fault.
    pub max_auth_failures: u32,
    /// Fixed delay between reconnect attempts.
    pub backoff: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_auth_failures: 4,
            backoff: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the HTTP API, with a trailing slash.
    pub api_url: String,
    /// Base URL the realtime socket connects to.
    pub socket_url: String,
    pub device: DeviceInfo,
    pub auth: AuthConfig,
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:3000/".to_string(),
            socket_url: "ws://localhost:3000/socket".to_string(),
            device: DeviceInfo::generate(),
            auth: AuthConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}
