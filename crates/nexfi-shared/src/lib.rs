//! Types shared by every NexFi crate: user ids, the JSON wire formats used on
//! the signaling channel, the direct data channel and the backend sync
//! endpoint, and protocol constants.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use types::UserId;
