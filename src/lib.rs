//! Real-time microphone streaming to a speech recognizer.
//!
//! Audio flows through a fixed pipeline:
//!
//! ```text
//! microphone (cpal callback)
//!        |  f32 mono samples
//!        v
//! BlockWriter ==[ double-buffer exchange ]== BlockReader
//!        |                                        |
//!   fills the active region              settled 16384-sample blocks
//!                                                 |
//!                                                 v
//!                                          BlockStreamer
//!                                     PCM16 encode + WebSocket send
//!                                                 |
//!                                                 v
//!                                          RecognizerLink ---> transcripts
//! ```
//!
//! The capture callback never waits on the network: regions are exchanged
//! through non-blocking channels, and when the consumer falls behind the
//! newest block is dropped and counted rather than stalling the device.
//! A [`session::Session`] ties the pieces together and enforces the
//! connect / record / stop lifecycle.

pub mod backend;
pub mod capture;
pub mod config;
pub mod exchange;
pub mod pcm;
pub mod session;
pub mod streamer;
pub mod transport;

pub use capture::Microphone;
pub use config::Settings;
pub use exchange::{block_exchange, BlockReader, BlockWriter, DEFAULT_BLOCK_SIZE};
pub use session::{RecordingSummary, Session, SessionState};
pub use transport::RecognizerLink;
