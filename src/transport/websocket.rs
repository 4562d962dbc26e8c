//! WebSocket backend. Grounded on the connect/reader/writer task split in
//! `bass-webrtc-ndi/src/signaling/ws_peer.rs`, adapted from a signaling-only
//! client into a general bidirectional `StreamTransport`.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::{
    InboundListener, InboundMessage, StreamTransport, TransportError, TransportState,
    TransportStateCell, TransportStats, TransportStatsSnapshot,
};

const OUTBOUND_QUEUE_CAPACITY: usize = 256;

pub struct WebSocketTransport {
    state: Arc<TransportStateCell>,
    stats: Arc<TransportStats>,
    outbound: mpsc::Sender<WsMessage>,
    listener: Arc<Mutex<Option<InboundListener>>>,
}

impl WebSocketTransport {
    /// Spawns the connect/reader/writer tasks and returns immediately with a
    /// transport in the `Connecting` state; callers observe `state()` or the
    /// inbound listener to learn when the handshake completes.
    pub fn connect(url: String) -> Self {
        let state = Arc::new(TransportStateCell::new(TransportState::Connecting));
        let stats = Arc::new(TransportStats::default());
        let listener: Arc<Mutex<Option<InboundListener>>> = Arc::new(Mutex::new(None));
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

        tokio::spawn(run_connection(
            url,
            state.clone(),
            stats.clone(),
            listener.clone(),
            outbound_rx,
        ));

        WebSocketTransport {
            state,
            stats,
            outbound: outbound_tx,
            listener,
        }
    }
}

async fn run_connection(
    url: String,
    state: Arc<TransportStateCell>,
    stats: Arc<TransportStats>,
    listener: Arc<Mutex<Option<InboundListener>>>,
    mut outbound_rx: mpsc::Receiver<WsMessage>,
) {
    let socket = match tokio_tungstenite::connect_async(&url).await {
        Ok((socket, _response)) => socket,
        Err(err) => {
            log::warn!(target: "sendspin::transport::websocket", "connect to {} failed: {}", url, err);
            state.store(TransportState::Failed);
            return;
        }
    };

    if !state.compare_and_swap(TransportState::Connecting, TransportState::Open) {
        // close() raced us before the handshake finished.
        return;
    }

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(msg) => {
                        let len = msg.len();
                        if sink.send(msg).await.is_err() {
                            state.store(TransportState::Failed);
                            break;
                        }
                        stats.record_sent(len);
                    }
                    None => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        stats.record_received(text.len());
                        if let Some(cb) = listener.lock().as_ref() {
                            cb(InboundMessage::Text(text));
                        }
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        stats.record_received(data.len());
                        if let Some(cb) = listener.lock().as_ref() {
                            cb(InboundMessage::Binary(data.into()));
                        }
                    }
                    Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close(frame))) => {
                        let clean = frame.as_ref().map(|f| u16::from(f.code) == 1000).unwrap_or(true);
                        state.store(if clean { TransportState::Closed } else { TransportState::Failed });
                        break;
                    }
                    Some(Ok(WsMessage::Frame(_))) => {}
                    Some(Err(err)) => {
                        log::warn!(target: "sendspin::transport::websocket", "read error: {}", err);
                        state.store(TransportState::Failed);
                        break;
                    }
                    None => {
                        state.store(TransportState::Closed);
                        break;
                    }
                }
            }
        }
    }

    state.compare_and_swap(TransportState::Closing, TransportState::Closed);
}

impl StreamTransport for WebSocketTransport {
    fn state(&self) -> TransportState {
        self.state.load()
    }

    fn send_text(&self, text: &str) -> bool {
        if self.state.load() != TransportState::Open {
            return false;
        }
        self.outbound
            .try_send(WsMessage::Text(text.to_string()))
            .is_ok()
    }

    fn send_binary(&self, data: &[u8]) -> bool {
        if self.state.load() != TransportState::Open {
            return false;
        }
        self.outbound
            .try_send(WsMessage::Binary(data.to_vec()))
            .is_ok()
    }

    fn set_inbound_listener(&self, listener: InboundListener) {
        *self.listener.lock() = Some(listener);
    }

    fn close(&self, _code: u16, _reason: &str) {
        if self.state.compare_and_swap(TransportState::Open, TransportState::Closing)
            || self
                .state
                .compare_and_swap(TransportState::Connecting, TransportState::Closing)
        {
            let _ = self.outbound.try_send(WsMessage::Close(None));
        }
    }

    fn destroy(&self) {
        self.close(1000, "destroy");
        self.state.store(TransportState::Closed);
    }

    fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("state", &self.state.load())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closing_before_connect_is_a_noop_not_a_panic() {
        let state = Arc::new(TransportStateCell::new(TransportState::Disconnected));
        assert!(!state.compare_and_swap(TransportState::Open, TransportState::Closing));
        assert_eq!(state.load(), TransportState::Disconnected);
    }

    #[test]
    fn error_display_messages_are_stable() {
        assert_eq!(TransportError::NotOpen.to_string(), "transport is not open");
        assert_eq!(TransportError::Closed.to_string(), "transport is closed");
    }
}
