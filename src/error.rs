//! Crate-wide error taxonomy.
//!
//! Each subsystem defines its own error enum at its public boundary; this
//! module composes them into one top-level error via `#[from]`, typing a
//! pure-Rust boundary end to end instead of falling back to `String` the
//! way an FFI edge would.

use thiserror::Error;

use crate::command::CommandError;
use crate::playback::PlaybackError;
use crate::signaling::SignalingError;
use crate::supervisor::SupervisorError;
use crate::sync::SyncError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum SendspinError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Playback(#[from] PlaybackError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("configuration error: {0}")]
    Config(String),
}
