use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::clock::{local_now_ms, SkewEstimator, PROBE_INTERVAL};
use crate::drift::{DriftAction, DriftController, TickInput, TICK_INTERVAL};
use crate::link::ServerLink;
use crate::media::{CameraCapture, MediaHandle};
use crate::mesh::{
    OutgoingSignal, PeerConnectionFactory, PeerMeshCoordinator, SignalPayload, STATS_INTERVAL,
};
use crate::protocol::{ChatMessage, ClientMessage, Participant, Role, ServerMessage, TimelineState};

pub struct SessionConfig {
    pub server_url: String,
    pub room_id: String,
    pub display_name: Option<String>,
    pub as_authoritative: bool,
    pub initial_src: Option<String>,
}

/// Events surfaced to the embedding UI.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Joined { participant_id: Uuid },
    Timeline(TimelineState),
    Presence(Vec<Participant>),
    Chat(ChatMessage),
    Error(String),
}

type EventHandler = Box<dyn Fn(SessionEvent) + Send + Sync>;

/// One participant's client session.
///
/// Owns every timer-driven task (skew probe, drift tick, mesh monitor) and
/// guarantees they stop, peer links close and the capture device releases
/// on shutdown, whichever exit path triggers it.
pub struct ClientSession {
    link: Arc<ServerLink>,
    shared: Arc<SessionShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct SessionShared {
    link: Arc<ServerLink>,
    media: Arc<dyn MediaHandle>,
    local_id: Mutex<Option<Uuid>>,
    role: Mutex<Role>,
    timeline: Mutex<Option<TimelineState>>,
    skew: Mutex<SkewEstimator>,
    drift: Mutex<DriftController>,
    mesh: Mutex<Option<PeerMeshCoordinator>>,
    /// Factory + capture held until `Joined` supplies the local id.
    mesh_seed: Mutex<Option<(Box<dyn PeerConnectionFactory>, Arc<dyn CameraCapture>)>>,
    last_tick: Mutex<Option<Instant>>,
    on_event: Mutex<Option<EventHandler>>,
}

impl ClientSession {
    pub fn new(media: Arc<dyn MediaHandle>) -> Self {
        let link = Arc::new(ServerLink::new());
        Self {
            shared: Arc::new(SessionShared {
                link: Arc::clone(&link),
                media,
                local_id: Mutex::new(None),
                role: Mutex::new(Role::Follower),
                timeline: Mutex::new(None),
                skew: Mutex::new(SkewEstimator::new()),
                drift: Mutex::new(DriftController::new()),
                mesh: Mutex::new(None),
                mesh_seed: Mutex::new(None),
                last_tick: Mutex::new(None),
                on_event: Mutex::new(None),
            }),
            link,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Enables the reaction-camera mesh. Without this the session runs
    /// sync-only.
    pub fn enable_mesh(
        &self,
        factory: Box<dyn PeerConnectionFactory>,
        camera: Arc<dyn CameraCapture>,
    ) {
        *self.shared.mesh_seed.lock() = Some((factory, camera));
    }

    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(SessionEvent) + Send + Sync + 'static,
    {
        *self.shared.on_event.lock() = Some(Box::new(handler));
    }

    /// Connects, joins the room and starts the timer tasks. The returned
    /// receiver resolves when the socket closes.
    pub async fn connect(&self, config: &SessionConfig) -> Result<oneshot::Receiver<()>> {
        // Reconnects replace the previous timer tasks.
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let shared = Arc::clone(&self.shared);
        let disconnect_rx = self
            .link
            .connect(&config.server_url, move |msg| shared.handle_message(msg))
            .await?;

        self.link.send(&ClientMessage::Join {
            room_id: config.room_id.clone(),
            name: config.display_name.clone(),
            as_authoritative: Some(config.as_authoritative),
            initial_src: config.initial_src.clone(),
        })?;

        let mut tasks = self.tasks.lock();

        // Skew probe: first tick fires immediately, covering the
        // probe-on-connection requirement.
        let probe_link = Arc::clone(&self.link);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROBE_INTERVAL);
            loop {
                ticker.tick().await;
                if probe_link
                    .send(&ClientMessage::Ping { t0: local_now_ms() })
                    .is_err()
                {
                    break;
                }
            }
        }));

        // Drift tick: followers only; the check lives in tick_now.
        let drift_shared = Arc::clone(&self.shared);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            loop {
                ticker.tick().await;
                drift_shared.tick_now();
            }
        }));

        // Mesh monitor: bitrate adaptation and dead-link pruning.
        let mesh_shared = Arc::clone(&self.shared);
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_INTERVAL);
            loop {
                ticker.tick().await;
                if let Some(mesh) = mesh_shared.mesh.lock().as_mut() {
                    mesh.monitor_tick();
                }
            }
        }));

        Ok(disconnect_rx)
    }

    /// Runs one drift evaluation outside the timer, for hosts that gate
    /// ticks to media frame delivery.
    pub fn tick_now(&self) {
        self.shared.tick_now();
    }

    // Local transport controls, forwarded to the authoritative timeline.
    // Seek and rate ride the best-effort class.

    pub fn play(&self) -> Result<()> {
        self.shared.note_local_transition();
        self.shared.media.play()?;
        self.link.send(&ClientMessage::Play)
    }

    pub fn pause(&self) -> Result<()> {
        self.shared.note_local_transition();
        let position = self.shared.media.position();
        self.shared.media.pause()?;
        self.link.send(&ClientMessage::Pause {
            at_time: Some(position),
        })
    }

    pub fn seek(&self, to_media_time: f64) -> Result<()> {
        self.shared.note_local_transition();
        self.shared.media.seek(to_media_time)?;
        self.link.send_seek(to_media_time);
        Ok(())
    }

    pub fn set_rate(&self, playback_rate: f64) -> Result<()> {
        self.shared.media.set_rate(playback_rate)?;
        self.link.send_rate(playback_rate);
        Ok(())
    }

    pub fn set_ready(&self, ready: bool) -> Result<()> {
        self.link.send(&ClientMessage::Ready { ready })
    }

    pub fn send_chat(&self, text: String) -> Result<()> {
        self.link.send(&ClientMessage::Chat { text })
    }

    pub fn set_view_visible(&self, visible: bool) {
        if let Some(mesh) = self.shared.mesh.lock().as_mut() {
            mesh.set_view_visible(visible);
        }
    }

    pub fn timeline(&self) -> Option<TimelineState> {
        self.shared.timeline.lock().clone()
    }

    pub fn role(&self) -> Role {
        *self.shared.role.lock()
    }

    pub fn link(&self) -> &ServerLink {
        &self.link
    }

    /// Stops all timers, closes all peer links, releases the capture
    /// device and sends a leave notice.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(mesh) = self.shared.mesh.lock().as_mut() {
            mesh.shutdown();
        }
        let _ = self.link.send(&ClientMessage::Leave);
        self.link.close();
        tracing::info!("Session shut down");
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SessionShared {
    fn handle_message(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Joined {
                participant_id,
                timeline,
            } => {
                *self.local_id.lock() = Some(participant_id);
                *self.timeline.lock() = Some(timeline);
                if let Some((factory, camera)) = self.mesh_seed.lock().take() {
                    *self.mesh.lock() =
                        Some(PeerMeshCoordinator::new(participant_id, factory, camera));
                }
                self.emit(SessionEvent::Joined { participant_id });
            }

            ServerMessage::Timeline(state) => {
                *self.timeline.lock() = Some(state.clone());
                self.emit(SessionEvent::Timeline(state));
            }

            ServerMessage::Presence { participants } => {
                if let Some(local_id) = *self.local_id.lock() {
                    if let Some(me) = participants.iter().find(|p| p.id == local_id) {
                        *self.role.lock() = me.role;
                    }
                }
                if let Some(mesh) = self.mesh.lock().as_mut() {
                    let outgoing = mesh.on_presence(&participants);
                    self.relay(outgoing);
                }
                self.emit(SessionEvent::Presence(participants));
            }

            ServerMessage::Pong { t0, t1 } => {
                self.skew.lock().on_pong(t0, t1, local_now_ms());
            }

            ServerMessage::Signal { from, payload } => {
                let parsed: SignalPayload = match serde_json::from_value(payload) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!("Unrecognized signal payload from {from}: {e}");
                        return;
                    }
                };
                if let Some(mesh) = self.mesh.lock().as_mut() {
                    let outgoing = mesh.on_signal(from, parsed);
                    self.relay(outgoing);
                }
            }

            ServerMessage::PeerJoined { id } => {
                if let Some(mesh) = self.mesh.lock().as_mut() {
                    let outgoing = mesh.on_peer_joined(id);
                    self.relay(outgoing);
                }
            }

            ServerMessage::PeerLeft { id } => {
                if let Some(mesh) = self.mesh.lock().as_mut() {
                    mesh.on_peer_left(id);
                }
            }

            ServerMessage::Chat(chat) => self.emit(SessionEvent::Chat(chat)),

            ServerMessage::Error { message } => {
                tracing::warn!("Server error: {message}");
                self.emit(SessionEvent::Error(message));
            }
        }
    }

    /// One drift evaluation. Authoritative participants are ground truth
    /// and are never corrected.
    fn tick_now(&self) {
        if *self.role.lock() == Role::Authoritative {
            return;
        }
        let timeline = self.timeline.lock().clone();
        let Some(timeline) = timeline else {
            return;
        };

        let now = Instant::now();
        let dt_secs = self
            .last_tick
            .lock()
            .replace(now)
            .map(|prev| now.duration_since(prev).as_secs_f64())
            .unwrap_or(0.0);

        let (corrected_now_ms, rtt_ms) = {
            let skew = self.skew.lock();
            (skew.corrected(local_now_ms()), skew.last_rtt_ms())
        };

        let input = TickInput {
            timeline: &timeline,
            corrected_now_ms,
            local_position: self.media.position(),
            local_playing: self.media.is_playing(),
            media_ready: self.media.is_ready(),
            rtt_ms,
            dt_secs,
        };

        let actions = self.drift.lock().tick(&input);
        for action in actions {
            // Device errors degrade gracefully: log and retry next tick.
            let result = match action {
                DriftAction::HardSeek(position) => self.media.seek(position),
                DriftAction::SetRate(rate) => self.media.set_rate(rate),
                DriftAction::Play => self.media.play(),
                DriftAction::Pause => self.media.pause(),
            };
            if let Err(e) = result {
                tracing::warn!("Drift correction failed, retrying next tick: {e}");
            }
        }
    }

    fn note_local_transition(&self) {
        let skew = self.skew.lock();
        let corrected = skew.corrected(local_now_ms());
        let rtt = skew.last_rtt_ms();
        drop(skew);
        self.drift.lock().note_local_transition(corrected, rtt);
    }

    fn relay(&self, outgoing: Vec<OutgoingSignal>) {
        for signal in outgoing {
            let payload = match serde_json::to_value(&signal.payload) {
                Ok(value) => value,
                Err(e) => {
                    tracing::error!("Failed to serialize signal: {e}");
                    continue;
                }
            };
            if let Err(e) = self.link.send(&ClientMessage::Signal {
                target: signal.target,
                payload,
            }) {
                tracing::warn!("Failed to relay signal: {e}");
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(handler) = self.on_event.lock().as_ref() {
            handler(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SimulatedMedia;
    use crate::protocol::SubtitleTrack;

    fn timeline(is_playing: bool, base_media: f64, base_server: f64) -> TimelineState {
        TimelineState {
            is_playing,
            base_media_time: base_media,
            base_server_time: base_server,
            playback_rate: 1.0,
            src: None,
            subtitle_tracks: Vec::<SubtitleTrack>::new(),
        }
    }

    #[tokio::test]
    async fn follower_hard_aligns_to_a_fresh_timeline() {
        let media = Arc::new(SimulatedMedia::new());
        let session = ClientSession::new(Arc::clone(&media) as Arc<dyn MediaHandle>);

        let id = Uuid::new_v4();
        session.shared.handle_message(ServerMessage::Joined {
            participant_id: id,
            timeline: timeline(false, 0.0, local_now_ms()),
        });

        // Room is paused far from our position: one tick hard-jumps there.
        session
            .shared
            .handle_message(ServerMessage::Timeline(timeline(
                false,
                120.0,
                local_now_ms(),
            )));
        session.tick_now();
        assert!((media.position() - 120.0).abs() < 0.05);
    }

    #[tokio::test]
    async fn authoritative_participant_is_never_corrected() {
        let media = Arc::new(SimulatedMedia::new());
        let session = ClientSession::new(Arc::clone(&media) as Arc<dyn MediaHandle>);

        let id = Uuid::new_v4();
        session.shared.handle_message(ServerMessage::Joined {
            participant_id: id,
            timeline: timeline(false, 0.0, local_now_ms()),
        });
        session.shared.handle_message(ServerMessage::Presence {
            participants: vec![Participant {
                id,
                display_name: "host".to_string(),
                role: Role::Authoritative,
                ready: true,
            }],
        });
        session
            .shared
            .handle_message(ServerMessage::Timeline(timeline(
                false,
                120.0,
                local_now_ms(),
            )));

        session.tick_now();
        assert_eq!(media.position(), 0.0);
    }

    #[tokio::test]
    async fn pong_feeds_the_skew_estimator() {
        let media = Arc::new(SimulatedMedia::new());
        let session = ClientSession::new(media as Arc<dyn MediaHandle>);

        let t0 = local_now_ms();
        session.shared.handle_message(ServerMessage::Pong {
            t0,
            t1: t0 + 500.0,
        });
        assert!(session.shared.skew.lock().skew_ms() > 400.0);
    }
}
