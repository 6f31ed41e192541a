pub mod credential;
pub mod events;
pub mod message;
pub mod operation;
pub mod peer;

pub use credential::Credential;
pub use message::{Direction, Message};
pub use operation::Operation;
pub use peer::Peer;
