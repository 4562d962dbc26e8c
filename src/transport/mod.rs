//! Bidirectional, message-oriented transport with two interchangeable
//! backends (WebSocket, WebRTC data channel).
//!
//! State handling follows `bass-webrtc/src/peer/connection.rs`'s
//! `PEER_STATE_*` atomic-constant convention; the WebRTC backend's data
//! channel wiring is grounded on `bass-webrtc-ndi/src/signaling/ws_peer.rs`.

pub mod websocket;
pub mod webrtc;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bytes::Bytes;
use thiserror::Error;

pub const TRANSPORT_STATE_DISCONNECTED: u32 = 0;
pub const TRANSPORT_STATE_CONNECTING: u32 = 1;
pub const TRANSPORT_STATE_OPEN: u32 = 2;
pub const TRANSPORT_STATE_CLOSING: u32 = 3;
pub const TRANSPORT_STATE_CLOSED: u32 = 4;
pub const TRANSPORT_STATE_FAILED: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

impl From<u32> for TransportState {
    fn from(v: u32) -> Self {
        match v {
            TRANSPORT_STATE_DISCONNECTED => TransportState::Disconnected,
            TRANSPORT_STATE_CONNECTING => TransportState::Connecting,
            TRANSPORT_STATE_OPEN => TransportState::Open,
            TRANSPORT_STATE_CLOSING => TransportState::Closing,
            TRANSPORT_STATE_CLOSED => TransportState::Closed,
            _ => TransportState::Failed,
        }
    }
}

impl From<TransportState> for u32 {
    fn from(s: TransportState) -> Self {
        match s {
            TransportState::Disconnected => TRANSPORT_STATE_DISCONNECTED,
            TransportState::Connecting => TRANSPORT_STATE_CONNECTING,
            TransportState::Open => TRANSPORT_STATE_OPEN,
            TransportState::Closing => TRANSPORT_STATE_CLOSING,
            TransportState::Closed => TRANSPORT_STATE_CLOSED,
            TransportState::Failed => TRANSPORT_STATE_FAILED,
        }
    }
}

/// Atomic state cell shared between the transport and its background tasks.
#[derive(Debug, Default)]
pub struct TransportStateCell(AtomicU32);

impl TransportStateCell {
    pub fn new(initial: TransportState) -> Self {
        TransportStateCell(AtomicU32::new(initial.into()))
    }

    pub fn load(&self) -> TransportState {
        self.0.load(Ordering::SeqCst).into()
    }

    pub fn store(&self, state: TransportState) {
        self.0.store(state.into(), Ordering::SeqCst);
    }

    /// Atomically transitions from `from` to `to`, returning whether it
    /// succeeded. Used wherever a connect/close race needs a compare-and-swap
    /// rather than a read-then-write.
    pub fn compare_and_swap(&self, from: TransportState, to: TransportState) -> bool {
        self.0
            .compare_exchange(from.into(), to.into(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not open")]
    NotOpen,
    #[error("failed to enqueue message for sending")]
    SendFailed,
    #[error("transport is closed")]
    Closed,
    #[error("backend error: {0}")]
    BackendFailed(String),
}

#[derive(Debug, Clone)]
pub enum InboundMessage {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, Default)]
pub struct TransportStats {
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub reconnect_count: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStatsSnapshot {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reconnect_count: u64,
}

impl TransportStats {
    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
        }
    }

    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

pub type InboundListener = Box<dyn Fn(InboundMessage) + Send + Sync>;

/// Uniform contract implemented by both backends.
pub trait StreamTransport: Send + Sync {
    fn state(&self) -> TransportState;

    /// Enqueues a text frame; returns `true` only if the transport was Open
    /// at enqueue time.
    fn send_text(&self, text: &str) -> bool;

    /// Enqueues a binary frame; returns `true` only if the transport was
    /// Open at enqueue time.
    fn send_binary(&self, data: &[u8]) -> bool;

    /// Replaces the inbound listener. Implementations deliver subsequent
    /// messages to it; buffered pre-attach messages (WebRTC backend only)
    /// are not replayed here — see `drain_buffered_messages`.
    fn set_inbound_listener(&self, listener: InboundListener);

    /// Initiates a graceful close; does not release shared OS resources.
    /// Idempotent, safe before connect.
    fn close(&self, code: u16, reason: &str);

    /// Fully releases owned resources (sockets, peer connections, thread
    /// pools). Idempotent, safe before connect. The only call that does so.
    fn destroy(&self);

    fn stats(&self) -> TransportStatsSnapshot;

    /// Flushes any inbound text/binary messages buffered before an observer
    /// attached. A no-op for backends with no such window (WebSocket).
    fn drain_buffered_messages(&self) {}
}
