//! Thin external-facing view: observable connection/playback state plus a
//! narrow command surface that forwards to [`CommandTransport`]. Interfaces
//! only — wiring a concrete `MusicServerClient`/`MediaSessionFacade` is left
//! to the embedding application, the same way `AudioSink` keeps
//! platform-integration details out of the playback engine.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use crate::command::{CommandError, CommandTransport};
use crate::playback::{PlaybackState, PlaybackStatsSnapshot};
use crate::supervisor::{SupervisorPhase, SupervisorSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
    Failed,
}

impl From<SupervisorPhase> for ConnectionState {
    fn from(phase: SupervisorPhase) -> Self {
        match phase {
            SupervisorPhase::Idle => ConnectionState::Disconnected,
            SupervisorPhase::Connecting => ConnectionState::Connecting,
            SupervisorPhase::Connected => ConnectionState::Connected,
            SupervisorPhase::Reconnecting => ConnectionState::Reconnecting,
            SupervisorPhase::Error => ConnectionState::Error,
            SupervisorPhase::Failed => ConnectionState::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncStats {
    pub offset_us: f64,
    pub drift_ppm: f64,
    pub is_converged: bool,
}

#[derive(Debug, Clone)]
pub struct FacadeSnapshot {
    pub connection: ConnectionState,
    pub playback: PlaybackState,
    pub sync: SyncStats,
    pub playback_stats: PlaybackStatsSnapshot,
    pub last_error: Option<String>,
}

/// Implemented by the embedding app's media-session integration (e.g. lock
/// screen / notification controls); the engine only calls into it, never
/// depends on its concrete type.
pub trait MediaSessionFacade: Send + Sync {
    fn update_now_playing(&self, title: &str, artist: &str, artwork_url: Option<&str>);
    fn update_playback_state(&self, state: PlaybackState);
}

/// Implemented by whatever talks to the upstream music server's REST API
/// over the HTTP-proxy datachannel; kept as an interface so the engine
/// doesn't hardcode any particular server's command vocabulary.
pub trait MusicServerClient: Send + Sync {
    fn play(&self);
    fn pause(&self);
    fn next(&self);
    fn previous(&self);
    fn set_volume(&self, volume: f32);
}

pub struct ReceiverFacade {
    command: Arc<CommandTransport>,
    connection_state: Mutex<ConnectionState>,
    last_error: Mutex<Option<String>>,
}

impl ReceiverFacade {
    pub fn new(command: Arc<CommandTransport>) -> Self {
        ReceiverFacade {
            command,
            connection_state: Mutex::new(ConnectionState::Disconnected),
            last_error: Mutex::new(None),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection_state.lock()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        *self.connection_state.lock() = state;
    }

    pub fn set_last_error(&self, error: Option<String>) {
        *self.last_error.lock() = error;
    }

    pub fn apply_supervisor_snapshot(&self, snapshot: SupervisorSnapshot) {
        self.set_connection_state(snapshot.phase.into());
    }

    pub async fn play(&self) -> Result<(), CommandError> {
        self.command
            .send_command("play", None, Duration::from_secs(15))
            .await
            .map(|_| ())
    }

    pub async fn pause(&self) -> Result<(), CommandError> {
        self.command
            .send_command("pause", None, Duration::from_secs(15))
            .await
            .map(|_| ())
    }

    pub async fn next(&self) -> Result<(), CommandError> {
        self.command
            .send_command("next", None, Duration::from_secs(15))
            .await
            .map(|_| ())
    }

    pub async fn previous(&self) -> Result<(), CommandError> {
        self.command
            .send_command("previous", None, Duration::from_secs(15))
            .await
            .map(|_| ())
    }

    pub async fn set_volume(&self, volume: f32) -> Result<(), CommandError> {
        let args: Value = serde_json::json!({ "volume": volume });
        self.command
            .send_command("volume", Some(args), Duration::from_secs(15))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervisor_phase_maps_onto_connection_state() {
        assert_eq!(ConnectionState::from(SupervisorPhase::Connected), ConnectionState::Connected);
        assert_eq!(ConnectionState::from(SupervisorPhase::Idle), ConnectionState::Disconnected);
    }
}
