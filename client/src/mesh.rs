use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::media::CameraCapture;
use crate::protocol::Participant;

/// Cadence of the outbound-stats inspection loop.
pub const STATS_INTERVAL: Duration = Duration::from_secs(2);

const BITRATE_FLOOR_BPS: f64 = 40_000.0;
const BITRATE_CEILING_BPS: f64 = 120_000.0;
const BITRATE_DOWN: f64 = 0.8;
const BITRATE_UP: f64 = 1.1;
const LOSS_THRESHOLD: f64 = 0.02;
const RTT_THRESHOLD_MS: f64 = 350.0;
const DOWNSCALE_MAX: f64 = 4.0;
/// Encoder params are only re-applied when the bitrate moves by more than
/// this fraction, to avoid constant renegotiation.
const BITRATE_APPLY_DELTA: f64 = 0.05;

/// Signaling payload relayed opaquely through the server, addressed by
/// target peer id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: serde_json::Value },
}

/// A signal the coordinator wants relayed to `target`.
#[derive(Debug, Clone)]
pub struct OutgoingSignal {
    pub target: Uuid,
    pub payload: SignalPayload,
}

/// Per-peer-link negotiation state. The polite/impolite collision rule is
/// a pure function of (state, incoming message).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Stable,
    LocalOfferPending,
    RemoteOfferPending,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncoderParams {
    pub max_bitrate_bps: u32,
    /// Spatial downscale factor, 1.0 = full capped resolution.
    pub downscale: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OutboundStats {
    pub loss_ratio: f64,
    pub rtt_ms: f64,
}

/// Opaque handle to a remote participant's incoming track, surfaced to the
/// embedding UI for rendering.
pub type RemoteStream = Arc<dyn std::any::Any + Send + Sync>;

/// One direct low-bitrate connection to a remote peer. Offer/answer/ICE are
/// opaque to the coordinator; implementations wrap whatever transport the
/// embedder provides, configured with one send-only transceiver carrying
/// the capped camera capture and one receive-only transceiver for the
/// remote track.
pub trait PeerConnection: Send {
    fn create_offer(&mut self) -> Result<String>;
    /// Applies a remote offer and returns the local answer.
    fn accept_offer(&mut self, sdp: &str) -> Result<String>;
    fn accept_answer(&mut self, sdp: &str) -> Result<()>;
    fn add_ice_candidate(&mut self, candidate: &serde_json::Value) -> Result<()>;
    /// Discards the local pending offer (polite side of a collision).
    fn rollback(&mut self) -> Result<()>;
    fn set_encoder_params(&mut self, params: EncoderParams) -> Result<()>;
    fn outbound_stats(&self) -> OutboundStats;
    /// The remote participant's incoming track, once one has arrived.
    fn remote_stream(&self) -> Option<RemoteStream>;
    /// False once the connection is failed, closed or disconnected.
    fn is_alive(&self) -> bool;
    fn is_connected(&self) -> bool;
    fn close(&mut self);
}

pub trait PeerConnectionFactory: Send + Sync {
    fn create(&self, remote: Uuid) -> Box<dyn PeerConnection>;
}

struct PeerLink {
    conn: Box<dyn PeerConnection>,
    state: LinkState,
    /// Precomputed collision role: the lexicographically greater id is polite.
    polite: bool,
    bitrate: BitrateController,
}

/// Maintains the full mesh of reaction-camera links for one room.
///
/// Owned exclusively by the local session; all methods are synchronous and
/// return the signals to relay, so negotiation is deterministic and
/// testable without a transport.
pub struct PeerMeshCoordinator {
    local_id: Uuid,
    links: HashMap<Uuid, PeerLink>,
    factory: Box<dyn PeerConnectionFactory>,
    camera: Arc<dyn CameraCapture>,
    view_visible: bool,
    camera_enabled: bool,
}

impl PeerMeshCoordinator {
    pub fn new(
        local_id: Uuid,
        factory: Box<dyn PeerConnectionFactory>,
        camera: Arc<dyn CameraCapture>,
    ) -> Self {
        let mut coordinator = Self {
            local_id,
            links: HashMap::new(),
            factory,
            camera,
            view_visible: true,
            camera_enabled: true,
        };
        coordinator.refresh_camera_gate();
        coordinator
    }

    /// Full-roster discovery: a link is created for every previously
    /// unknown peer (skipping self); the impolite side opens with an offer.
    pub fn on_presence(&mut self, participants: &[Participant]) -> Vec<OutgoingSignal> {
        let mut out = Vec::new();
        for participant in participants {
            out.extend(self.ensure_link(participant.id));
        }
        out
    }

    pub fn on_peer_joined(&mut self, id: Uuid) -> Vec<OutgoingSignal> {
        self.ensure_link(id)
    }

    pub fn on_peer_left(&mut self, id: Uuid) {
        if let Some(mut link) = self.links.remove(&id) {
            link.conn.close();
            tracing::debug!(peer = %id, "peer link closed (peer left)");
        }
        self.refresh_camera_gate();
    }

    /// Applies an incoming relayed signal. Signals referencing a torn-down
    /// link are silently dropped.
    pub fn on_signal(&mut self, from: Uuid, payload: SignalPayload) -> Vec<OutgoingSignal> {
        let mut out = Vec::new();
        // An offer can legitimately race ahead of our presence update.
        if let SignalPayload::Offer { .. } = payload {
            out.extend(self.ensure_link(from));
        }
        // Torn-down links are removed from the map outright, so an absent
        // entry is the only "closed" state a signal can race against.
        let Some(link) = self.links.get_mut(&from) else {
            tracing::debug!(peer = %from, "dropping signal for unknown link");
            return out;
        };

        match payload {
            SignalPayload::Offer { sdp } => {
                if link.state == LinkState::LocalOfferPending {
                    if !link.polite {
                        // Impolite: ignore the colliding offer, ours stands.
                        tracing::debug!(peer = %from, "collision: keeping local offer");
                        return out;
                    }
                    // Polite: roll back our own offer and take theirs.
                    if let Err(e) = link.conn.rollback() {
                        tracing::warn!(peer = %from, "rollback failed: {e}");
                        return out;
                    }
                    link.state = LinkState::Stable;
                }
                link.state = LinkState::RemoteOfferPending;
                match link.conn.accept_offer(&sdp) {
                    Ok(answer) => {
                        link.state = LinkState::Stable;
                        out.push(OutgoingSignal {
                            target: from,
                            payload: SignalPayload::Answer { sdp: answer },
                        });
                    }
                    Err(e) => {
                        tracing::warn!(peer = %from, "offer rejected: {e}");
                        link.state = LinkState::Stable;
                    }
                }
            }
            SignalPayload::Answer { sdp } => {
                if link.state != LinkState::LocalOfferPending {
                    tracing::debug!(peer = %from, "dropping answer with no offer in flight");
                    return out;
                }
                match link.conn.accept_answer(&sdp) {
                    Ok(()) => link.state = LinkState::Stable,
                    Err(e) => {
                        tracing::warn!(peer = %from, "answer rejected: {e}");
                        link.state = LinkState::Stable;
                    }
                }
            }
            SignalPayload::IceCandidate { candidate } => {
                if let Err(e) = link.conn.add_ice_candidate(&candidate) {
                    tracing::debug!(peer = %from, "ice candidate dropped: {e}");
                }
            }
        }
        self.refresh_camera_gate();
        out
    }

    /// One pass of the 2s stats loop: prune dead links, adjust each
    /// sender's bitrate and downscale from its outbound stats.
    pub fn monitor_tick(&mut self) {
        let mut dead = Vec::new();
        for (peer, link) in self.links.iter_mut() {
            if !link.conn.is_alive() {
                dead.push(*peer);
                continue;
            }
            let stats = link.conn.outbound_stats();
            if let Some(params) = link.bitrate.adjust(&stats) {
                if let Err(e) = link.conn.set_encoder_params(params) {
                    tracing::debug!(peer = %peer, "encoder update failed: {e}");
                }
            }
        }
        for peer in dead {
            if let Some(mut link) = self.links.remove(&peer) {
                link.conn.close();
                tracing::debug!(peer = %peer, "peer link closed (connection dead)");
            }
        }
        self.refresh_camera_gate();
    }

    /// The surrounding UI reports whether the local view is visible; the
    /// camera track stays off while it is not.
    pub fn set_view_visible(&mut self, visible: bool) {
        self.view_visible = visible;
        self.refresh_camera_gate();
    }

    pub fn link_state(&self, peer: Uuid) -> Option<LinkState> {
        self.links.get(&peer).map(|link| link.state)
    }

    /// Incoming track for `peer`, for the embedding UI to render.
    pub fn remote_stream(&self, peer: Uuid) -> Option<RemoteStream> {
        self.links.get(&peer).and_then(|link| link.conn.remote_stream())
    }

    pub fn connected_peers(&self) -> usize {
        self.links
            .values()
            .filter(|link| link.conn.is_connected())
            .count()
    }

    /// Closes every link and releases the capture device. Called on every
    /// session exit path.
    pub fn shutdown(&mut self) {
        for (_, mut link) in self.links.drain() {
            link.conn.close();
        }
        self.camera.stop();
    }

    fn ensure_link(&mut self, peer: Uuid) -> Vec<OutgoingSignal> {
        if peer == self.local_id || self.links.contains_key(&peer) {
            return Vec::new();
        }

        let mut conn = self.factory.create(peer);
        let polite = self.local_id.to_string() > peer.to_string();
        let mut state = LinkState::Stable;
        let mut out = Vec::new();

        // Need-to-negotiate on link creation: the impolite side always
        // sends the opening offer; the polite side waits for it.
        if !polite {
            match conn.create_offer() {
                Ok(sdp) => {
                    state = LinkState::LocalOfferPending;
                    out.push(OutgoingSignal {
                        target: peer,
                        payload: SignalPayload::Offer { sdp },
                    });
                }
                Err(e) => tracing::warn!(peer = %peer, "offer creation failed: {e}"),
            }
        }

        self.links.insert(
            peer,
            PeerLink {
                conn,
                state,
                polite,
                bitrate: BitrateController::new(),
            },
        );
        self.refresh_camera_gate();
        out
    }

    /// Camera is live only while at least one peer is connected and the
    /// local view is visible.
    fn refresh_camera_gate(&mut self) {
        let want = self.connected_peers() > 0 && self.view_visible;
        if want != self.camera_enabled {
            self.camera_enabled = want;
            self.camera.set_enabled(want);
        }
    }
}

/// Multiplicative-increase / multiplicative-decrease bitrate control per
/// link, with a spatial downscale that tightens under congestion.
#[derive(Debug)]
struct BitrateController {
    bitrate_bps: f64,
    downscale: f64,
    applied: Option<EncoderParams>,
}

impl BitrateController {
    fn new() -> Self {
        Self {
            bitrate_bps: BITRATE_CEILING_BPS,
            downscale: 1.0,
            applied: None,
        }
    }

    fn adjust(&mut self, stats: &OutboundStats) -> Option<EncoderParams> {
        let congested = stats.loss_ratio > LOSS_THRESHOLD || stats.rtt_ms > RTT_THRESHOLD_MS;
        if congested {
            self.bitrate_bps = (self.bitrate_bps * BITRATE_DOWN).max(BITRATE_FLOOR_BPS);
            self.downscale = (self.downscale * 1.25).min(DOWNSCALE_MAX);
        } else {
            self.bitrate_bps = (self.bitrate_bps * BITRATE_UP).min(BITRATE_CEILING_BPS);
            self.downscale = (self.downscale * 0.8).max(1.0);
        }

        let params = EncoderParams {
            max_bitrate_bps: self.bitrate_bps.round() as u32,
            downscale: self.downscale,
        };
        match self.applied {
            Some(last) if !meaningful_change(last, params) => None,
            _ => {
                self.applied = Some(params);
                Some(params)
            }
        }
    }
}

fn meaningful_change(last: EncoderParams, next: EncoderParams) -> bool {
    let bitrate_delta = (next.max_bitrate_bps as f64 - last.max_bitrate_bps as f64).abs()
        / last.max_bitrate_bps as f64;
    bitrate_delta > BITRATE_APPLY_DELTA || (next.downscale - last.downscale).abs() > f64::EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Role;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeConnState {
        offers_created: u32,
        rolled_back: bool,
        accepted_offer: Option<String>,
        accepted_answer: Option<String>,
        ice: Vec<serde_json::Value>,
        encoder: Option<EncoderParams>,
        closed: bool,
        connected: bool,
        stats: OutboundStats,
    }

    struct FakeConn {
        label: &'static str,
        state: Arc<Mutex<FakeConnState>>,
    }

    impl PeerConnection for FakeConn {
        fn create_offer(&mut self) -> Result<String> {
            let mut state = self.state.lock();
            state.offers_created += 1;
            Ok(format!("offer-from-{}", self.label))
        }
        fn accept_offer(&mut self, sdp: &str) -> Result<String> {
            self.state.lock().accepted_offer = Some(sdp.to_string());
            Ok(format!("answer-from-{}", self.label))
        }
        fn accept_answer(&mut self, sdp: &str) -> Result<()> {
            self.state.lock().accepted_answer = Some(sdp.to_string());
            Ok(())
        }
        fn add_ice_candidate(&mut self, candidate: &serde_json::Value) -> Result<()> {
            self.state.lock().ice.push(candidate.clone());
            Ok(())
        }
        fn rollback(&mut self) -> Result<()> {
            self.state.lock().rolled_back = true;
            Ok(())
        }
        fn set_encoder_params(&mut self, params: EncoderParams) -> Result<()> {
            self.state.lock().encoder = Some(params);
            Ok(())
        }
        fn outbound_stats(&self) -> OutboundStats {
            self.state.lock().stats
        }
        fn remote_stream(&self) -> Option<RemoteStream> {
            None
        }
        fn is_alive(&self) -> bool {
            !self.state.lock().closed
        }
        fn is_connected(&self) -> bool {
            self.state.lock().connected
        }
        fn close(&mut self) {
            self.state.lock().closed = true;
        }
    }

    struct FakeFactory {
        label: &'static str,
        created: Arc<Mutex<Vec<(Uuid, Arc<Mutex<FakeConnState>>)>>>,
    }

    impl FakeFactory {
        fn new(label: &'static str) -> Self {
            Self {
                label,
                created: Arc::new(Mutex::new(Vec::new())),
            }
        }
        fn conn_state(&self, peer: Uuid) -> Arc<Mutex<FakeConnState>> {
            self.created
                .lock()
                .iter()
                .find(|(id, _)| *id == peer)
                .map(|(_, state)| Arc::clone(state))
                .expect("no connection created for peer")
        }
    }

    impl PeerConnectionFactory for FakeFactory {
        fn create(&self, remote: Uuid) -> Box<dyn PeerConnection> {
            let state = Arc::new(Mutex::new(FakeConnState::default()));
            self.created.lock().push((remote, Arc::clone(&state)));
            Box::new(FakeConn {
                label: self.label,
                state,
            })
        }
    }

    struct FakeCamera {
        enabled: Mutex<Vec<bool>>,
        stopped: Mutex<bool>,
    }

    impl FakeCamera {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                enabled: Mutex::new(Vec::new()),
                stopped: Mutex::new(false),
            })
        }
    }

    impl CameraCapture for FakeCamera {
        fn set_enabled(&self, enabled: bool) {
            self.enabled.lock().push(enabled);
        }
        fn stop(&self) {
            *self.stopped.lock() = true;
        }
    }

    fn participant(id: Uuid) -> Participant {
        Participant {
            id,
            display_name: "peer".to_string(),
            role: Role::Follower,
            ready: true,
        }
    }

    /// Two fixed ids with a known ordering: "b..." > "a...", so the b side
    /// is polite in the a/b pair.
    fn ordered_pair() -> (Uuid, Uuid) {
        let a = Uuid::parse_str("aaaaaaaa-0000-0000-0000-000000000000").unwrap();
        let b = Uuid::parse_str("bbbbbbbb-0000-0000-0000-000000000000").unwrap();
        (a, b)
    }

    fn coordinator(local: Uuid, label: &'static str) -> (PeerMeshCoordinator, FakeFactory) {
        let factory = FakeFactory::new(label);
        let tracking = FakeFactory {
            label,
            created: Arc::clone(&factory.created),
        };
        let mesh = PeerMeshCoordinator::new(local, Box::new(tracking), FakeCamera::new());
        (mesh, factory)
    }

    #[test]
    fn discovery_skips_self_and_known_peers() {
        let (a, b) = ordered_pair();
        let (mut mesh, _factory) = coordinator(a, "a");

        let signals = mesh.on_presence(&[participant(a), participant(b)]);
        // Impolite a opens with exactly one offer, toward b only.
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].target, b);
        assert!(matches!(signals[0].payload, SignalPayload::Offer { .. }));

        // Re-announcing the roster creates nothing new.
        assert!(mesh.on_presence(&[participant(a), participant(b)]).is_empty());
    }

    #[test]
    fn polite_side_waits_for_the_offer() {
        let (a, b) = ordered_pair();
        let (mut mesh, _factory) = coordinator(b, "b");

        let signals = mesh.on_peer_joined(a);
        assert!(signals.is_empty());
        assert_eq!(mesh.link_state(a), Some(LinkState::Stable));
    }

    #[test]
    fn simultaneous_offers_resolve_to_a_single_connection() {
        let (a, b) = ordered_pair();
        let (mut mesh_a, factory_a) = coordinator(a, "a");
        let (mut mesh_b, factory_b) = coordinator(b, "b");

        // Both sides decide to negotiate at once: a offers by role, and b
        // (polite) has somehow produced its own local offer too.
        let a_signals = mesh_a.on_peer_joined(b);
        mesh_b.on_peer_joined(a);
        // Force b's link into LocalOfferPending to model the race.
        mesh_b.links.get_mut(&a).unwrap().state = LinkState::LocalOfferPending;
        let b_offer = OutgoingSignal {
            target: a,
            payload: SignalPayload::Offer {
                sdp: "offer-from-b".to_string(),
            },
        };

        // Impolite a receives b's offer while its own is in flight: discard.
        let a_replies = mesh_a.on_signal(b, b_offer.payload.clone());
        assert!(a_replies.is_empty());
        assert_eq!(mesh_a.link_state(b), Some(LinkState::LocalOfferPending));
        assert!(factory_a.conn_state(b).lock().accepted_offer.is_none());

        // Polite b receives a's offer while its own is in flight: roll back
        // and answer.
        let SignalPayload::Offer { sdp } = &a_signals[0].payload else {
            panic!("a should have produced an offer");
        };
        let b_replies = mesh_b.on_signal(a, SignalPayload::Offer { sdp: sdp.clone() });
        assert_eq!(b_replies.len(), 1);
        assert!(matches!(b_replies[0].payload, SignalPayload::Answer { .. }));
        assert!(factory_b.conn_state(a).lock().rolled_back);
        assert_eq!(mesh_b.link_state(a), Some(LinkState::Stable));

        // a accepts the answer: one consistent connection, not two.
        let SignalPayload::Answer { sdp } = &b_replies[0].payload else {
            panic!("b should have answered");
        };
        mesh_a.on_signal(b, SignalPayload::Answer { sdp: sdp.clone() });
        assert_eq!(mesh_a.link_state(b), Some(LinkState::Stable));
        assert_eq!(
            factory_a.conn_state(b).lock().accepted_answer.as_deref(),
            Some(sdp.as_str())
        );
    }

    #[test]
    fn offer_races_ahead_of_presence() {
        let (a, b) = ordered_pair();
        let (mut mesh, _factory) = coordinator(b, "b");

        // No link exists yet; an incoming offer creates one and is answered.
        let replies = mesh.on_signal(
            a,
            SignalPayload::Offer {
                sdp: "early".to_string(),
            },
        );
        assert_eq!(replies.len(), 1);
        assert!(matches!(replies[0].payload, SignalPayload::Answer { .. }));
    }

    #[test]
    fn signals_for_torn_down_links_are_dropped() {
        let (a, b) = ordered_pair();
        let (mut mesh, _factory) = coordinator(a, "a");

        mesh.on_peer_joined(b);
        mesh.on_peer_left(b);
        let replies = mesh.on_signal(
            b,
            SignalPayload::IceCandidate {
                candidate: serde_json::json!({"candidate": "..."}),
            },
        );
        assert!(replies.is_empty());
        assert!(mesh.link_state(b).is_none());
    }

    #[test]
    fn bitrate_backs_off_under_loss_and_recovers() {
        let mut controller = BitrateController::new();

        let congested = OutboundStats {
            loss_ratio: 0.05,
            rtt_ms: 100.0,
        };
        let first = controller.adjust(&congested).unwrap();
        assert_eq!(first.max_bitrate_bps, 96_000);
        assert!(first.downscale > 1.0);

        // Repeated congestion floors out at 40kbps.
        for _ in 0..20 {
            controller.adjust(&congested);
        }
        assert_eq!(controller.bitrate_bps, BITRATE_FLOOR_BPS);
        assert_eq!(controller.downscale, DOWNSCALE_MAX);

        // Clean stats climb back toward the ceiling and relax downscale.
        let clean = OutboundStats {
            loss_ratio: 0.0,
            rtt_ms: 40.0,
        };
        for _ in 0..40 {
            controller.adjust(&clean);
        }
        assert_eq!(controller.bitrate_bps, BITRATE_CEILING_BPS);
        assert_eq!(controller.downscale, 1.0);
    }

    #[test]
    fn high_rtt_alone_triggers_backoff() {
        let mut controller = BitrateController::new();
        let slow = OutboundStats {
            loss_ratio: 0.0,
            rtt_ms: 400.0,
        };
        let params = controller.adjust(&slow).unwrap();
        assert!(f64::from(params.max_bitrate_bps) < BITRATE_CEILING_BPS);
    }

    #[test]
    fn small_bitrate_moves_are_not_reapplied() {
        let mut controller = BitrateController::new();
        let clean = OutboundStats::default();
        // Already at the ceiling: adjusting produces no meaningful change
        // after the first application.
        assert!(controller.adjust(&clean).is_some());
        assert!(controller.adjust(&clean).is_none());
    }

    #[test]
    fn monitor_prunes_dead_links() {
        let (a, b) = ordered_pair();
        let (mut mesh, factory) = coordinator(a, "a");

        mesh.on_peer_joined(b);
        factory.conn_state(b).lock().closed = true;
        mesh.monitor_tick();
        assert!(mesh.link_state(b).is_none());
    }

    #[test]
    fn camera_gates_on_connected_peers_and_visibility() {
        let (a, b) = ordered_pair();
        let camera = FakeCamera::new();
        let factory = FakeFactory::new("a");
        let tracking = FakeFactory {
            label: "a",
            created: Arc::clone(&factory.created),
        };
        let mut mesh =
            PeerMeshCoordinator::new(a, Box::new(tracking), Arc::clone(&camera) as Arc<dyn CameraCapture>);

        // No peers yet: the initial gate turns the track off.
        assert_eq!(camera.enabled.lock().last(), Some(&false));

        mesh.on_peer_joined(b);
        factory.conn_state(b).lock().connected = true;
        mesh.monitor_tick();
        assert_eq!(camera.enabled.lock().last(), Some(&true));

        mesh.set_view_visible(false);
        assert_eq!(camera.enabled.lock().last(), Some(&false));

        mesh.set_view_visible(true);
        assert_eq!(camera.enabled.lock().last(), Some(&true));
    }

    #[test]
    fn shutdown_closes_links_and_releases_capture() {
        let (a, b) = ordered_pair();
        let camera = FakeCamera::new();
        let factory = FakeFactory::new("a");
        let tracking = FakeFactory {
            label: "a",
            created: Arc::clone(&factory.created),
        };
        let mut mesh =
            PeerMeshCoordinator::new(a, Box::new(tracking), Arc::clone(&camera) as Arc<dyn CameraCapture>);

        mesh.on_peer_joined(b);
        mesh.shutdown();
        assert!(factory.conn_state(b).lock().closed);
        assert!(*camera.stopped.lock());
    }
}
