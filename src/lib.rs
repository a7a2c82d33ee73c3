//! Receive-side RTP+FEC audio pipeline.
//!
//! Takes datagrams from a lossy packet network and turns them into a
//! continuous, clock-aligned PCM stream for local playback:
//!
//! - packets are reordered in modular-sorted queues and losses repaired
//!   from FEC repair packets;
//! - playback is withheld until a target buffer has accumulated, then the
//!   depacketizer emits exactly-sized frames with zero-filled gaps;
//! - a latency monitor keeps the sender's clock locked to the playback
//!   clock by driving an adaptive resampler through a PI controller, and
//!   ends the session when latency leaves its bounds.
//!
//! Network and audio device I/O stay outside: feed datagrams in through
//! [`pipeline::Receiver::receive_source_datagram`], pull interleaved f32
//! frames out with the receiver's read, and report play-out times back via
//! `reclock`.
//!
//! Threading: one network thread feeding datagrams, one device thread
//! pulling frames. The two meet at per-session locked queues; background
//! diagnostics run over a lock-free SPSC ring.

pub mod audio;
pub mod core;
pub mod dbgio;
pub mod fec;
pub mod packet;
pub mod pipeline;
pub mod rtp;
pub mod status;

pub use audio::sample_spec::SampleSpec;
pub use audio::FrameReader;
pub use pipeline::{Receiver, ReceiverConfig, ReceiverSession, SessionConfig};
pub use status::{ConfigError, Status};
