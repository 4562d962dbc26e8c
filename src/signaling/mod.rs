//! WebSocket client to the rendezvous server that bootstraps the WebRTC
//! backend of `StreamTransport`: exchanges the ICE-server list and SDP
//! offer/answer and relays trickle ICE candidates.
//!
//! The `Disconnected/Failed/Closed → Connecting` transition is a classic
//! TOCTOU pitfall under concurrent callers, so it is split into its own
//! compare-and-swap primitive (`try_begin_connect`) independent of
//! the actual socket dial, mirroring how `transport::TransportStateCell`
//! isolates state bookkeeping from I/O. Message shapes follow the
//! `SignalingMessage` tagged-enum convention in
//! `bass-webrtc-ndi/src/signaling/ws_peer.rs`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::transport::{TransportState, TransportStateCell};

const REMOTE_ID_LEN: usize = 26;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("remote id must be {REMOTE_ID_LEN} uppercase alphanumeric characters")]
    InvalidRemoteId,
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("signaling protocol error: {0}")]
    Protocol(String),
    #[error("signaling timed out")]
    Timeout,
    #[error("signaling client closed")]
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidateDescriptor {
    pub sdp: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerDescriptor {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "credential")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    ServerConnected { ice_servers: Vec<IceServerDescriptor> },
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidateDescriptor },
    Error { message: String },
}

#[derive(Debug, Clone)]
pub enum SignalingEvent {
    IceServers(Vec<IceServerDescriptor>),
    Offer(String),
    Answer(String),
    IceCandidate(IceCandidateDescriptor),
    PeerError(String),
}

fn validate_remote_id(remote_id: &str) -> Result<(), SignalingError> {
    let valid = remote_id.len() == REMOTE_ID_LEN
        && remote_id
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(SignalingError::InvalidRemoteId)
    }
}

pub struct SignalingClient {
    rendezvous_host: String,
    state: Arc<TransportStateCell>,
    socket_opens: Arc<AtomicU64>,
    outbound: Arc<parking_lot::Mutex<Option<mpsc::UnboundedSender<WsMessage>>>>,
}

impl SignalingClient {
    pub fn new(rendezvous_host: impl Into<String>) -> Self {
        SignalingClient {
            rendezvous_host: rendezvous_host.into(),
            state: Arc::new(TransportStateCell::new(TransportState::Disconnected)),
            socket_opens: Arc::new(AtomicU64::new(0)),
            outbound: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    pub fn state(&self) -> TransportState {
        self.state.load()
    }

    pub fn socket_opens(&self) -> u64 {
        self.socket_opens.load(Ordering::Relaxed)
    }

    /// The atomic guard collapsing N concurrent calls into exactly
    /// one winner. Separated from the socket dial so it can be exercised
    /// without network I/O.
    fn try_begin_connect(&self) -> bool {
        for from in [
            TransportState::Disconnected,
            TransportState::Failed,
            TransportState::Closed,
        ] {
            if self.state.compare_and_swap(from, TransportState::Connecting) {
                return true;
            }
        }
        false
    }

    /// Validates `remote_id`, then — if this call wins the CAS race — dials
    /// the rendezvous server and streams parsed events to the returned
    /// channel. Losing calls are no-ops returning `Ok(None)`.
    pub async fn connect(
        &self,
        remote_id: &str,
    ) -> Result<Option<mpsc::UnboundedReceiver<SignalingEvent>>, SignalingError> {
        validate_remote_id(remote_id)?;
        if !self.try_begin_connect() {
            return Ok(None);
        }

        let url = format!("wss://{}/{}", self.rendezvous_host, remote_id);
        let (socket, _response) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| {
                self.state.store(TransportState::Failed);
                SignalingError::ConnectFailed(e.to_string())
            })?;
        self.socket_opens.fetch_add(1, Ordering::Relaxed);
        self.state.compare_and_swap(TransportState::Connecting, TransportState::Open);

        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
        *self.outbound.lock() = Some(out_tx);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let state = self.state.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = out_rx.recv() => {
                        match outgoing {
                            Some(msg) => { if sink.send(msg).await.is_err() { break; } }
                            None => break,
                        }
                    }
                    incoming = stream.next() => {
                        match incoming {
                            Some(Ok(WsMessage::Text(text))) => {
                                match serde_json::from_str::<SignalingMessage>(&text) {
                                    Ok(SignalingMessage::ServerConnected { ice_servers }) => {
                                        let _ = event_tx.send(SignalingEvent::IceServers(ice_servers));
                                    }
                                    Ok(SignalingMessage::Offer { sdp }) => {
                                        let _ = event_tx.send(SignalingEvent::Offer(sdp));
                                    }
                                    Ok(SignalingMessage::Answer { sdp }) => {
                                        let _ = event_tx.send(SignalingEvent::Answer(sdp));
                                    }
                                    Ok(SignalingMessage::IceCandidate { candidate }) => {
                                        let _ = event_tx.send(SignalingEvent::IceCandidate(candidate));
                                    }
                                    Ok(SignalingMessage::Error { message }) => {
                                        let _ = event_tx.send(SignalingEvent::PeerError(message));
                                    }
                                    Err(err) => {
                                        log::warn!(target: "sendspin::signaling", "dropping malformed frame: {}", err);
                                    }
                                }
                            }
                            Some(Ok(WsMessage::Close(_))) | None => {
                                state.store(TransportState::Closed);
                                break;
                            }
                            Some(Err(err)) => {
                                log::warn!(target: "sendspin::signaling", "read error: {}", err);
                                state.store(TransportState::Failed);
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }
        });

        Ok(Some(event_rx))
    }

    pub fn send_offer(&self, sdp: String) -> Result<(), SignalingError> {
        self.send(SignalingMessage::Offer { sdp })
    }

    pub fn send_ice_candidate(&self, candidate: IceCandidateDescriptor) -> Result<(), SignalingError> {
        self.send(SignalingMessage::IceCandidate { candidate })
    }

    fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let guard = self.outbound.lock();
        let tx = guard.as_ref().ok_or(SignalingError::Closed)?;
        let text = serde_json::to_string(&message)
            .map_err(|e| SignalingError::Protocol(e.to_string()))?;
        tx.send(WsMessage::Text(text))
            .map_err(|_| SignalingError::Closed)
    }

    pub fn close(&self) {
        self.state.store(TransportState::Closed);
        *self.outbound.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn remote_id_validation_rejects_lowercase_and_wrong_length() {
        assert!(validate_remote_id("ABCDEFGHIJKLMNOPQRSTUVWXYZ").is_ok());
        assert!(validate_remote_id("short").is_err());
        assert!(validate_remote_id(&"a".repeat(26)).is_err());
        assert!(validate_remote_id("A1B2C3D4E5F6G7H8I9J0K1L2M3").is_ok());
    }

    #[tokio::test]
    async fn concurrent_connect_attempts_collapse_to_one_winner() {
        let client = Arc::new(SignalingClient::new("rendezvous.example.invalid"));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let client = client.clone();
            handles.push(tokio::spawn(async move { client.try_begin_connect() }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(client.state(), TransportState::Connecting);
    }
}
