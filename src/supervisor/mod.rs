//! Owns the lifecycle of `StreamTransport`, `SyncController`, and
//! `PlaybackEngine`: route selection, reconnection backoff, and the
//! freeze/thaw dance around a reconnect that lets a fast resume preserve
//! sync state. The debounce/backoff bookkeeping follows the same
//! `Instant`-gated retry style used in `bass-webrtc/src/peer/connection.rs`'s
//! reconnection state machine.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

use crate::command::CommandTransport;
use crate::config::{ConnectionProfile, ReceiverConfig};
use crate::playback::{AudioSink, PlaybackEngine};
use crate::sync::SyncController;
use crate::time_filter::{now_client_us, TimeFilter};
use crate::transport::{InboundMessage, StreamTransport};

const BACKOFF_SCHEDULE_MS: [u64; 11] =
    [500, 1_000, 2_000, 4_000, 8_000, 15_000, 30_000, 60_000, 60_000, 60_000, 60_000];
const WAKE_DEBOUNCE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no route available: preferred route has no credentials configured")]
    NoRoute,
    #[error("reconnection attempts exhausted")]
    BackoffExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Local,
    Proxy,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutePreference {
    Auto,
    LocalOnly,
    RemoteOnly,
    ProxyOnly,
}

/// Which of the three routes the caller has credentials configured for.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteAvailability {
    pub local: bool,
    pub proxy: bool,
    pub remote: bool,
}

impl RouteAvailability {
    fn has(&self, route: Route) -> bool {
        match route {
            Route::Local => self.local,
            Route::Proxy => self.proxy,
            Route::Remote => self.remote,
        }
    }
}

/// Raw OS-reported transport bits; VPN is checked first regardless of what
/// else is set, since a VPN tunnel can sit on top of any of the others.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectedTransport {
    pub vpn: bool,
    pub wifi: bool,
    pub ethernet: bool,
    pub cellular: bool,
}

fn effective_profile(detected: DetectedTransport) -> ConnectionProfile {
    if detected.vpn {
        ConnectionProfile::Vpn
    } else if detected.wifi {
        ConnectionProfile::Wifi
    } else if detected.ethernet {
        ConnectionProfile::Ethernet
    } else if detected.cellular {
        ConnectionProfile::Cellular
    } else {
        ConnectionProfile::Unknown
    }
}

fn priority_order(profile: ConnectionProfile) -> &'static [Route] {
    match profile {
        ConnectionProfile::Wifi | ConnectionProfile::Ethernet => {
            &[Route::Local, Route::Proxy, Route::Remote]
        }
        ConnectionProfile::Cellular => &[Route::Proxy, Route::Remote],
        ConnectionProfile::Vpn | ConnectionProfile::Unknown => {
            &[Route::Proxy, Route::Remote, Route::Local]
        }
    }
}

/// Picks a route for `detected`, honoring `preference` overrides. Returns
/// `None` if the table (or a forced preference) names a route with no
/// configured credentials.
pub fn select_route(
    detected: DetectedTransport,
    preference: RoutePreference,
    availability: RouteAvailability,
) -> Option<Route> {
    let forced = match preference {
        RoutePreference::LocalOnly => Some(Route::Local),
        RoutePreference::RemoteOnly => Some(Route::Remote),
        RoutePreference::ProxyOnly => Some(Route::Proxy),
        RoutePreference::Auto => None,
    };

    if let Some(route) = forced {
        return availability.has(route).then_some(route);
    }

    let profile = effective_profile(detected);
    priority_order(profile)
        .iter()
        .copied()
        .find(|route| availability.has(*route))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorPhase {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Error,
    Failed,
}

const PHASE_IDLE: u32 = 0;
const PHASE_CONNECTING: u32 = 1;
const PHASE_CONNECTED: u32 = 2;
const PHASE_RECONNECTING: u32 = 3;
const PHASE_ERROR: u32 = 4;
const PHASE_FAILED: u32 = 5;

impl From<u32> for SupervisorPhase {
    fn from(v: u32) -> Self {
        match v {
            PHASE_CONNECTING => SupervisorPhase::Connecting,
            PHASE_CONNECTED => SupervisorPhase::Connected,
            PHASE_RECONNECTING => SupervisorPhase::Reconnecting,
            PHASE_ERROR => SupervisorPhase::Error,
            PHASE_FAILED => SupervisorPhase::Failed,
            _ => SupervisorPhase::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorSnapshot {
    pub phase: SupervisorPhase,
    pub attempt: u32,
    pub route: Option<Route>,
}

/// The three subsystems a live session owns, bundled so a reconnect or
/// shutdown can tear all of them down together. Dropping a `SessionHandle`
/// stops the sync driver and joins the playback sink thread.
pub struct SessionHandle {
    pub transport: Arc<dyn StreamTransport>,
    pub command: Arc<CommandTransport>,
    pub sync: Arc<SyncController>,
    pub playback: Arc<PlaybackEngine>,
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.sync.stop();
        self.playback.stop_sink_thread();
    }
}

pub struct ConnectionSupervisor {
    config: ReceiverConfig,
    filter: Arc<Mutex<TimeFilter>>,
    sink: Arc<dyn AudioSink>,
    phase: Arc<AtomicU32>,
    attempt: Arc<AtomicU32>,
    last_wake: Mutex<Option<Instant>>,
    route: Mutex<Option<Route>>,
    wake_count: AtomicU64,
    session: Mutex<Option<Arc<SessionHandle>>>,
}

impl ConnectionSupervisor {
    pub fn new(config: ReceiverConfig, filter: Arc<Mutex<TimeFilter>>, sink: Arc<dyn AudioSink>) -> Self {
        ConnectionSupervisor {
            config,
            filter,
            sink,
            phase: Arc::new(AtomicU32::new(PHASE_IDLE)),
            attempt: Arc::new(AtomicU32::new(0)),
            last_wake: Mutex::new(None),
            route: Mutex::new(None),
            wake_count: AtomicU64::new(0),
            session: Mutex::new(None),
        }
    }

    /// Builds the command/sync/playback stack for a freshly connected
    /// `transport`, installs the one combined inbound listener a transport's
    /// single listener slot allows, starts the playback sink thread, and
    /// replaces any previously attached session. The old session (if any) is
    /// dropped after the new one is stored, so its sync driver and sink
    /// thread stop cleanly without racing the new session's startup.
    ///
    /// `supports_http_proxy` should be `true` only for a WebRTC-backed
    /// transport.
    pub fn attach_session(
        self: &Arc<Self>,
        transport: Arc<dyn StreamTransport>,
        supports_http_proxy: bool,
    ) -> Arc<SessionHandle> {
        let command = CommandTransport::new(transport.clone(), supports_http_proxy);
        let sync = Arc::new(SyncController::new(self.filter.clone()));
        let playback = Arc::new(PlaybackEngine::new(
            self.config.clone(),
            self.filter.clone(),
            self.sink.clone(),
        ));
        playback.start_sink_thread();

        let listener_command = command.clone();
        let listener_sync = sync.clone();
        let listener_playback = playback.clone();
        transport.set_inbound_listener(Box::new(move |msg| match msg {
            InboundMessage::Text(_) => listener_command.handle_inbound(msg),
            InboundMessage::Binary(bytes) => {
                let client_received_us = now_client_us();
                if crate::wire::decode_timesync_response(&bytes).is_some() {
                    listener_sync.on_server_time_frame(&bytes, client_received_us);
                } else {
                    listener_playback.on_audio_chunk_frame(&bytes);
                }
            }
        }));
        transport.drain_buffered_messages();

        let send_timesync_transport = transport.clone();
        sync.start(Arc::new(move || {
            let frame = crate::wire::encode_timesync_request(now_client_us());
            send_timesync_transport.send_binary(&frame);
        }));

        let handle = Arc::new(SessionHandle { transport, command, sync, playback });
        *self.session.lock() = Some(handle.clone());
        handle
    }

    /// The currently attached session, if any.
    pub fn current_session(&self) -> Option<Arc<SessionHandle>> {
        self.session.lock().clone()
    }

    /// Detaches and drops the current session, if any, stopping its sync
    /// driver and sink thread.
    pub fn detach_session(&self) {
        self.session.lock().take();
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        SupervisorSnapshot {
            phase: self.phase.load(Ordering::SeqCst).into(),
            attempt: self.attempt.load(Ordering::SeqCst),
            route: *self.route.lock(),
        }
    }

    pub fn begin_connect(&self, route: Route) {
        *self.route.lock() = Some(route);
        self.phase.store(PHASE_CONNECTING, Ordering::SeqCst);
    }

    pub fn on_connected(&self) {
        self.phase.store(PHASE_CONNECTED, Ordering::SeqCst);
        self.attempt.store(0, Ordering::SeqCst);
    }

    /// Call before tearing down a Connected session for a reconnect attempt,
    /// so a fast resume preserves sync state.
    pub fn freeze_for_reconnect(&self) {
        self.filter.lock().freeze();
    }

    /// Call once the new connection has authenticated.
    pub fn thaw_after_reconnect(&self) {
        self.filter.lock().thaw();
    }

    /// The backoff delay for the next attempt, or `None` once the fixed
    /// backoff schedule is exhausted.
    pub fn next_backoff(&self) -> Option<Duration> {
        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst) as usize;
        BACKOFF_SCHEDULE_MS.get(attempt).map(|ms| Duration::from_millis(*ms))
    }

    pub fn on_failed(&self) {
        self.phase.store(PHASE_RECONNECTING, Ordering::SeqCst);
    }

    /// Reconnection exhausted its schedule; filter state is discarded since
    /// a fast resume is no longer plausible.
    pub fn give_up(&self) {
        self.filter.lock().reset();
        self.phase.store(PHASE_FAILED, Ordering::SeqCst);
    }

    pub fn start_reconnecting(&self) {
        *self.last_wake.lock() = None;
        self.phase.store(PHASE_RECONNECTING, Ordering::SeqCst);
    }

    pub fn cancel_reconnection(&self) {
        *self.last_wake.lock() = None;
        self.attempt.store(0, Ordering::SeqCst);
        self.phase.store(PHASE_IDLE, Ordering::SeqCst);
    }

    /// Returns `true` if this wake should trigger a reconnection attempt
    /// (i.e. it wasn't debounced against the previous one).
    pub fn on_network_available(&self) -> bool {
        let mut last_wake = self.last_wake.lock();
        let now = Instant::now();
        let fires = match *last_wake {
            Some(prev) if now.duration_since(prev) < WAKE_DEBOUNCE => false,
            _ => true,
        };
        if fires {
            self.wake_count.fetch_add(1, Ordering::Relaxed);
            *last_wake = Some(now);
        }
        fires
    }

    pub fn wake_count(&self) -> u64 {
        self.wake_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn avail_all() -> RouteAvailability {
        RouteAvailability { local: true, proxy: true, remote: true }
    }

    #[test]
    fn wifi_prefers_local_then_proxy_then_remote() {
        let detected = DetectedTransport { wifi: true, ..Default::default() };
        let route = select_route(detected, RoutePreference::Auto, avail_all());
        assert_eq!(route, Some(Route::Local));
    }

    #[test]
    fn cellular_excludes_local_entirely() {
        let detected = DetectedTransport { cellular: true, ..Default::default() };
        let route = select_route(detected, RoutePreference::Auto, avail_all());
        assert_eq!(route, Some(Route::Proxy));

        let only_local = RouteAvailability { local: true, proxy: false, remote: false };
        assert_eq!(select_route(detected, RoutePreference::Auto, only_local), None);
    }

    #[test]
    fn vpn_over_wifi_is_reported_as_vpn_not_wifi() {
        let detected = DetectedTransport { vpn: true, wifi: true, ..Default::default() };
        assert_eq!(effective_profile(detected), ConnectionProfile::Vpn);
        let route = select_route(detected, RoutePreference::Auto, avail_all());
        // VPN table is proxy -> remote -> local, distinct from WiFi's table.
        assert_eq!(route, Some(Route::Proxy));
    }

    #[test]
    fn preference_override_wins_over_table_but_still_requires_credentials() {
        let detected = DetectedTransport { wifi: true, ..Default::default() };
        let no_remote_creds = RouteAvailability { local: true, proxy: true, remote: false };
        assert_eq!(
            select_route(detected, RoutePreference::RemoteOnly, no_remote_creds),
            None
        );
    }

    struct FakeSink;

    impl AudioSink for FakeSink {
        fn sample_rate_hz(&self) -> u32 {
            48_000
        }
        fn frames_written(&self) -> u64 {
            0
        }
        fn headroom_frames(&self) -> usize {
            0
        }
        fn write(&self, frames: &[crate::audio::Frame]) -> Result<usize, crate::playback::PlaybackError> {
            Ok(frames.len())
        }
    }

    fn test_supervisor() -> ConnectionSupervisor {
        let filter = Arc::new(Mutex::new(TimeFilter::new()));
        ConnectionSupervisor::new(ReceiverConfig::default(), filter, Arc::new(FakeSink))
    }

    #[test]
    fn backoff_schedule_has_eleven_entries_and_then_gives_up() {
        let supervisor = test_supervisor();
        let mut delays = Vec::new();
        for _ in 0..12 {
            delays.push(supervisor.next_backoff());
        }
        assert_eq!(delays.iter().filter(|d| d.is_some()).count(), 11);
        assert_eq!(delays[11], None);
        assert_eq!(delays[0], Some(Duration::from_millis(500)));
        assert_eq!(delays[6], Some(Duration::from_millis(30_000)));
    }

    #[test]
    fn network_wakes_within_two_seconds_are_debounced() {
        let supervisor = test_supervisor();
        assert!(supervisor.on_network_available());
        assert!(!supervisor.on_network_available());
        assert_eq!(supervisor.wake_count(), 1);
    }

    struct FakeTransport {
        listener: Mutex<Option<crate::transport::InboundListener>>,
    }

    impl FakeTransport {
        fn new() -> Self {
            FakeTransport { listener: Mutex::new(None) }
        }

        fn deliver(&self, msg: InboundMessage) {
            if let Some(listener) = self.listener.lock().as_ref() {
                listener(msg);
            }
        }
    }

    impl StreamTransport for FakeTransport {
        fn state(&self) -> crate::transport::TransportState {
            crate::transport::TransportState::Open
        }
        fn send_text(&self, _text: &str) -> bool {
            true
        }
        fn send_binary(&self, _data: &[u8]) -> bool {
            true
        }
        fn set_inbound_listener(&self, listener: crate::transport::InboundListener) {
            *self.listener.lock() = Some(listener);
        }
        fn close(&self, _code: u16, _reason: &str) {}
        fn destroy(&self) {}
        fn stats(&self) -> crate::transport::TransportStatsSnapshot {
            crate::transport::TransportStatsSnapshot::default()
        }
    }

    #[tokio::test]
    async fn attached_session_routes_timesync_and_audio_frames_by_content() {
        let filter = Arc::new(Mutex::new(TimeFilter::new()));
        let sink = Arc::new(FakeSink);
        let supervisor =
            Arc::new(ConnectionSupervisor::new(ReceiverConfig::default(), filter.clone(), sink));
        let fake_transport = Arc::new(FakeTransport::new());
        let transport: Arc<dyn StreamTransport> = fake_transport.clone();
        let handle = supervisor.attach_session(transport, false);

        let mut timesync_frame = vec![crate::wire::TIMESYNC_RESPONSE_TAG];
        timesync_frame.extend_from_slice(&0u64.to_le_bytes());
        timesync_frame.extend_from_slice(&10_000u64.to_le_bytes());
        timesync_frame.extend_from_slice(&10_000u64.to_le_bytes());
        fake_transport.deliver(InboundMessage::Binary(bytes::Bytes::from(timesync_frame)));
        assert_eq!(filter.lock().state().measurement_count, 1);

        let header = crate::audio::CodecHeader {
            sample_rate_hz: 48_000,
            channels: 2,
            bit_depth: 16,
            kind: crate::audio::DecoderKind::Pcm,
            extra: None,
        };
        handle.playback.start_stream(&header).unwrap();
        let pcm_bytes: Vec<u8> =
            (0..480i16).flat_map(|i| [i, i]).flat_map(|s| s.to_le_bytes()).collect();
        let audio_frame = crate::wire::encode_audio_chunk_frame(5_000_000, &pcm_bytes);
        fake_transport.deliver(InboundMessage::Binary(bytes::Bytes::from(audio_frame)));
        handle.playback.pump();
        assert_eq!(handle.playback.state(), crate::playback::PlaybackState::Playing);

        supervisor.detach_session();
    }
}
