//! WebRTC data-channel backend: two reliable-ordered channels, "control"
//! (text/JSON) and "audio" (binary), multiplexed behind one
//! [`StreamTransport`]. Grounded on `bass-webrtc-ndi/src/signaling/ws_peer.rs`:
//! the ICE-candidate queueing-until-remote-description pattern, the
//! `AtomicBool` callback guard against double-firing disconnect, and the
//! `create_peer_connection` media-engine/interceptor wiring come from there.
//! `bass-webrtc/src/peer/connection.rs` contributes the `PEER_STATE_*`
//! atomic-constant style reused here as [`TransportStateCell`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{
    InboundListener, InboundMessage, StreamTransport, TransportError, TransportState,
    TransportStateCell, TransportStats, TransportStatsSnapshot,
};

const CONTROL_LABEL: &str = "control";
const AUDIO_LABEL: &str = "audio";

async fn create_peer_connection(
    ice_servers: Vec<RTCIceServer>,
) -> Result<RTCPeerConnection, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| TransportError::BackendFailed(e.to_string()))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| TransportError::BackendFailed(e.to_string()))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };

    api.new_peer_connection(config)
        .await
        .map_err(|e| TransportError::BackendFailed(e.to_string()))
}

struct PendingIce {
    candidates: Mutex<VecDeque<RTCIceCandidateInit>>,
    remote_description_set: AtomicBool,
}

/// Local ICE candidates gathered by the peer connection, queued here for
/// the caller to relay over `SignalingClient::send_ice_candidate`.
struct LocalIce {
    candidates: Mutex<VecDeque<RTCIceCandidate>>,
}

/// Routes `send_text` to the control channel and `send_binary` to the audio
/// channel. Inbound messages from either channel are multiplexed into the
/// single listener in arrival order.
pub struct WebRtcTransport {
    peer: Arc<RTCPeerConnection>,
    control: Mutex<Option<Arc<RTCDataChannel>>>,
    audio: Mutex<Option<Arc<RTCDataChannel>>>,
    state: Arc<TransportStateCell>,
    stats: Arc<TransportStats>,
    listener: Arc<Mutex<Option<InboundListener>>>,
    buffered: Arc<Mutex<VecDeque<InboundMessage>>>,
    pending_ice: Arc<PendingIce>,
    local_ice: Arc<LocalIce>,
    disconnected_fired: Arc<AtomicBool>,
}

impl WebRtcTransport {
    /// Creates the peer connection and the two local data channels, but does
    /// not start ICE gathering — call [`create_offer`](Self::create_offer) or
    /// feed a remote offer via [`accept_offer`](Self::accept_offer) next.
    pub async fn new(ice_servers: Vec<RTCIceServer>) -> Result<Self, TransportError> {
        let peer = Arc::new(create_peer_connection(ice_servers).await?);
        let state = Arc::new(TransportStateCell::new(TransportState::Connecting));
        let stats = Arc::new(TransportStats::default());
        let listener: Arc<Mutex<Option<InboundListener>>> = Arc::new(Mutex::new(None));
        let buffered = Arc::new(Mutex::new(VecDeque::new()));
        let pending_ice = Arc::new(PendingIce {
            candidates: Mutex::new(VecDeque::new()),
            remote_description_set: AtomicBool::new(false),
        });
        let disconnected_fired = Arc::new(AtomicBool::new(false));
        let local_ice = Arc::new(LocalIce { candidates: Mutex::new(VecDeque::new()) });

        {
            let state = state.clone();
            let disconnected_fired = disconnected_fired.clone();
            peer.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state = state.clone();
                let disconnected_fired = disconnected_fired.clone();
                Box::pin(async move {
                    match s {
                        RTCPeerConnectionState::Connected => state.store(TransportState::Open),
                        RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Closed => {
                            if !disconnected_fired.swap(true, Ordering::SeqCst) {
                                state.store(if s == RTCPeerConnectionState::Failed {
                                    TransportState::Failed
                                } else {
                                    TransportState::Closed
                                });
                            }
                        }
                        _ => {}
                    }
                })
            }));
        }

        let dc_init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let control = peer
            .create_data_channel(CONTROL_LABEL, Some(dc_init.clone()))
            .await
            .map_err(|e| TransportError::BackendFailed(e.to_string()))?;
        let audio = peer
            .create_data_channel(AUDIO_LABEL, Some(dc_init))
            .await
            .map_err(|e| TransportError::BackendFailed(e.to_string()))?;

        wire_channel(&control, stats.clone(), listener.clone(), buffered.clone());
        wire_channel(&audio, stats.clone(), listener.clone(), buffered.clone());

        {
            let local_ice = local_ice.clone();
            peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let local_ice = local_ice.clone();
                Box::pin(async move {
                    if let Some(candidate) = candidate {
                        local_ice.candidates.lock().push_back(candidate);
                    }
                })
            }));
        }

        Ok(WebRtcTransport {
            peer,
            control: Mutex::new(Some(control)),
            audio: Mutex::new(Some(audio)),
            state,
            stats,
            listener,
            buffered,
            pending_ice,
            local_ice,
            disconnected_fired,
        })
    }

    /// Drains ICE candidates gathered since the last call, for the caller to
    /// relay to the peer over `SignalingClient`.
    pub fn drain_local_ice_candidates(&self) -> Vec<RTCIceCandidateInit> {
        self.local_ice
            .candidates
            .lock()
            .drain(..)
            .filter_map(|c| c.to_json().ok())
            .collect()
    }

    pub async fn create_offer(&self) -> Result<RTCSessionDescription, TransportError> {
        let offer = self
            .peer
            .create_offer(None)
            .await
            .map_err(|e| TransportError::BackendFailed(e.to_string()))?;
        self.peer
            .set_local_description(offer.clone())
            .await
            .map_err(|e| TransportError::BackendFailed(e.to_string()))?;
        Ok(offer)
    }

    pub async fn accept_answer(&self, answer: RTCSessionDescription) -> Result<(), TransportError> {
        self.peer
            .set_remote_description(answer)
            .await
            .map_err(|e| TransportError::BackendFailed(e.to_string()))?;
        self.pending_ice
            .remote_description_set
            .store(true, Ordering::SeqCst);
        self.flush_pending_ice().await
    }

    /// Queues `candidate` if the remote description has not yet been set,
    /// otherwise applies it immediately — mirrors the signaling client's
    /// `pending_ice_candidates` handling in `ws_peer.rs`.
    pub async fn add_remote_ice_candidate(
        &self,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), TransportError> {
        if self.pending_ice.remote_description_set.load(Ordering::SeqCst) {
            self.peer
                .add_ice_candidate(candidate)
                .await
                .map_err(|e| TransportError::BackendFailed(e.to_string()))?;
        } else {
            self.pending_ice.candidates.lock().push_back(candidate);
        }
        Ok(())
    }

    async fn flush_pending_ice(&self) -> Result<(), TransportError> {
        let queued: Vec<_> = self.pending_ice.candidates.lock().drain(..).collect();
        for candidate in queued {
            self.peer
                .add_ice_candidate(candidate)
                .await
                .map_err(|e| TransportError::BackendFailed(e.to_string()))?;
        }
        Ok(())
    }
}

fn wire_channel(
    channel: &Arc<RTCDataChannel>,
    stats: Arc<TransportStats>,
    listener: Arc<Mutex<Option<InboundListener>>>,
    buffered: Arc<Mutex<VecDeque<InboundMessage>>>,
) {
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let stats = stats.clone();
        let listener = listener.clone();
        let buffered = buffered.clone();
        Box::pin(async move {
            let inbound = if msg.is_string {
                stats.record_received(msg.data.len());
                InboundMessage::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                stats.record_received(msg.data.len());
                InboundMessage::Binary(msg.data)
            };
            let guard = listener.lock();
            match guard.as_ref() {
                Some(cb) => cb(inbound),
                None => buffered.lock().push_back(inbound),
            }
        })
    }));
}

impl StreamTransport for WebRtcTransport {
    fn state(&self) -> TransportState {
        self.state.load()
    }

    fn send_text(&self, text: &str) -> bool {
        if self.state.load() != TransportState::Open {
            return false;
        }
        let Some(channel) = self.control.lock().clone() else {
            return false;
        };
        let stats = self.stats.clone();
        let text = text.to_string();
        let len = text.len();
        tokio::spawn(async move {
            if channel.send_text(text).await.is_ok() {
                stats.record_sent(len);
            }
        });
        true
    }

    fn send_binary(&self, data: &[u8]) -> bool {
        if self.state.load() != TransportState::Open {
            return false;
        }
        let Some(channel) = self.audio.lock().clone() else {
            return false;
        };
        let stats = self.stats.clone();
        let payload = bytes::Bytes::copy_from_slice(data);
        let len = payload.len();
        tokio::spawn(async move {
            if channel.send(&payload).await.is_ok() {
                stats.record_sent(len);
            }
        });
        true
    }

    fn set_inbound_listener(&self, listener: InboundListener) {
        *self.listener.lock() = Some(listener);
    }

    fn close(&self, _code: u16, _reason: &str) {
        self.state.compare_and_swap(TransportState::Open, TransportState::Closing);
        self.state.compare_and_swap(TransportState::Connecting, TransportState::Closing);
    }

    fn destroy(&self) {
        self.close(1000, "destroy");
        *self.control.lock() = None;
        *self.audio.lock() = None;
        let peer = self.peer.clone();
        tokio::spawn(async move {
            let _ = peer.close().await;
        });
        self.state.store(TransportState::Closed);
    }

    fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }

    /// Replays, in order, any messages that arrived on either channel before
    /// a listener was attached — the server sends an initial `ServerInfo`
    /// message as soon as the control channel opens, which otherwise races
    /// the caller's `set_inbound_listener`.
    fn drain_buffered_messages(&self) {
        let drained: Vec<_> = self.buffered.lock().drain(..).collect();
        let guard = self.listener.lock();
        if let Some(cb) = guard.as_ref() {
            for msg in drained {
                cb(msg);
            }
        }
    }
}

impl std::fmt::Debug for WebRtcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcTransport")
            .field("state", &self.state.load())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_candidates_queue_until_remote_description_is_set() {
        let pending = PendingIce {
            candidates: Mutex::new(VecDeque::new()),
            remote_description_set: AtomicBool::new(false),
        };
        pending.candidates.lock().push_back(RTCIceCandidateInit::default());
        pending.candidates.lock().push_back(RTCIceCandidateInit::default());
        assert_eq!(pending.candidates.lock().len(), 2);
        pending.remote_description_set.store(true, Ordering::SeqCst);
        assert!(pending.remote_description_set.load(Ordering::SeqCst));
    }

    #[test]
    fn disconnect_guard_fires_only_once() {
        let fired = AtomicBool::new(false);
        assert!(!fired.swap(true, Ordering::SeqCst));
        assert!(fired.swap(true, Ordering::SeqCst));
    }
}
