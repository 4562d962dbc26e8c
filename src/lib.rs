//! SendspinDroid receiver core: time synchronization, decode, and
//! sample-accurate scheduled playback over a WebSocket or WebRTC transport.

pub mod audio;
pub mod command;
pub mod config;
pub mod error;
pub mod facade;
pub mod playback;
pub mod signaling;
pub mod supervisor;
pub mod sync;
pub mod time_filter;
pub mod transport;
pub mod wire;

pub use config::ReceiverConfig;
pub use error::SendspinError;
pub use time_filter::TimeFilter;

pub type Result<T> = std::result::Result<T, SendspinError>;
