//! Pipeline assembly: per-sender sessions and the receiver that routes
//! packets to them and mixes their output.

pub mod receiver;
pub mod session;

pub use receiver::{Receiver, ReceiverConfig};
pub use session::{FecConfig, ReceiverSession, SessionConfig, SessionMetrics};
