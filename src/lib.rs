pub mod api;
pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod net;
pub mod replay;
pub mod roster;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;
pub mod websocket;
pub mod wire;

// Most embedders only need the composition root and the client handle.
pub use client::Client;
pub use session::ChatSession;
