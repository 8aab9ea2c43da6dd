use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

mod protocol;
mod state;

use protocol::{ChatMessage, ClientMessage, ServerMessage};
use state::{server_now_ms, RoomRegistry};

type ClientSender = mpsc::UnboundedSender<ServerMessage>;
type ClientSenders = Arc<RwLock<HashMap<Uuid, ClientSender>>>;

/// Interval of the per-room full-state timeline re-broadcast. Best-effort
/// seek/rate losses are healed within one of these.
const RESYNC_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone)]
struct AppState {
    registry: RoomRegistry,
    client_senders: ClientSenders,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lockstep_server=debug,info".into()),
        )
        .init();

    let port = env::var("PORT")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(3210);
    let prefix = env::var("LOCKSTEP_PATH_PREFIX").unwrap_or_default();
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let app_state = AppState {
        registry: RoomRegistry::new(),
        client_senders: Arc::new(RwLock::new(HashMap::new())),
    };

    let app = Router::new()
        .route("/healthz", get(health_check))
        .route(&format!("{prefix}/ws"), get(ws_endpoint))
        .with_state(app_state.clone());

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Lockstep server listening on {} (ws at {prefix}/ws)", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_endpoint(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn health_check() -> &'static str {
    "ok"
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let participant_id = Uuid::new_v4();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    state
        .client_senders
        .write()
        .await
        .insert(participant_id, tx.clone());

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(AxumWsMessage::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(AxumWsMessage::Text(text)) => {
                if let Err(e) = handle_message(&text, participant_id, &state).await {
                    tracing::error!("Error handling message from {}: {}", participant_id, e);
                    let _ = tx.send(ServerMessage::Error {
                        message: e.to_string(),
                    });
                }
            }
            Ok(AxumWsMessage::Close(_)) => {
                tracing::info!("Participant {} closing connection", participant_id);
                break;
            }
            Err(e) => {
                tracing::warn!("WebSocket error for {}: {}", participant_id, e);
                break;
            }
            _ => {}
        }
    }

    // Abrupt disconnects take the same leave path as an explicit Leave.
    handle_leave(participant_id, &state).await;
    state.client_senders.write().await.remove(&participant_id);
    send_task.abort();
}

async fn handle_message(
    text: &str,
    participant_id: Uuid,
    state: &AppState,
) -> anyhow::Result<()> {
    let msg: ClientMessage = serde_json::from_str(text)?;

    match msg {
        ClientMessage::Join {
            room_id,
            name,
            as_authoritative,
            initial_src,
        } => {
            if room_id.trim().is_empty() {
                // Bad request: signalled to this connection only, no state
                // mutation, no broadcast.
                send_to(state, participant_id, ServerMessage::Error {
                    message: "join requires a room id".to_string(),
                })
                .await;
                return Ok(());
            }

            let outcome = state.registry.join(
                &room_id,
                participant_id,
                name,
                as_authoritative.unwrap_or(false),
                initial_src,
            );

            // A join that moved the participant out of another room still
            // owes that room its departure broadcast.
            if let Some(previous) = outcome.previous_room {
                if !previous.room_deleted {
                    broadcast_presence(state, &previous.room_id, previous.participants).await;
                    broadcast_to_room(
                        state,
                        &previous.room_id,
                        ServerMessage::PeerLeft { id: participant_id },
                    )
                    .await;
                }
            }

            send_to(state, participant_id, ServerMessage::Joined {
                participant_id,
                timeline: outcome.timeline,
            })
            .await;

            if outcome.room_created {
                spawn_resync(state.clone(), room_id.clone());
            }

            broadcast_presence(state, &room_id, outcome.participants).await;
            broadcast_except(
                state,
                &room_id,
                participant_id,
                ServerMessage::PeerJoined { id: participant_id },
            )
            .await;
        }

        ClientMessage::Play => {
            timeline_command(state, participant_id, |timeline, now| timeline.play(now)).await;
        }

        ClientMessage::Pause { at_time } => {
            timeline_command(state, participant_id, move |timeline, now| {
                timeline.pause(now, at_time)
            })
            .await;
        }

        ClientMessage::Seek { to_media_time } => {
            timeline_command(state, participant_id, move |timeline, now| {
                timeline.seek(now, to_media_time)
            })
            .await;
        }

        ClientMessage::Rate { playback_rate } => {
            timeline_command(state, participant_id, move |timeline, now| {
                timeline.set_rate(now, playback_rate)
            })
            .await;
        }

        ClientMessage::Ready { ready } => {
            if let Some(participants) = state.registry.set_ready(participant_id, ready) {
                if let Some(room_id) = state.registry.room_of(participant_id) {
                    broadcast_presence(state, &room_id, participants).await;
                }
            }
        }

        ClientMessage::Ping { t0 } => {
            send_to(state, participant_id, ServerMessage::Pong {
                t0,
                t1: server_now_ms(),
            })
            .await;
        }

        ClientMessage::Chat { text } => {
            let Some(room_id) = state.registry.room_of(participant_id) else {
                return Ok(());
            };
            let sender_name = state
                .registry
                .display_name(participant_id)
                .unwrap_or_default();
            let chat = ChatMessage {
                id: Uuid::new_v4(),
                sender_id: participant_id,
                sender_name,
                timestamp_ms: server_now_ms(),
                text,
            };
            broadcast_to_room(state, &room_id, ServerMessage::Chat(chat)).await;
        }

        ClientMessage::Signal { target, payload } => {
            let Some(room_id) = state.registry.room_of(participant_id) else {
                return Ok(());
            };
            if !state.registry.members(&room_id).contains(&target) {
                tracing::debug!(
                    "Dropping signal from {} to non-member {}",
                    participant_id,
                    target
                );
                return Ok(());
            }
            send_to(state, target, ServerMessage::Signal {
                from: participant_id,
                payload,
            })
            .await;
        }

        ClientMessage::Leave => {
            handle_leave(participant_id, state).await;
        }
    }

    Ok(())
}

async fn timeline_command<F>(state: &AppState, participant_id: Uuid, op: F)
where
    F: FnOnce(&mut protocol::TimelineState, f64),
{
    if let Some(timeline) = state.registry.mutate_timeline(participant_id, op) {
        if let Some(room_id) = state.registry.room_of(participant_id) {
            broadcast_to_room(state, &room_id, ServerMessage::Timeline(timeline)).await;
        }
    }
}

async fn handle_leave(participant_id: Uuid, state: &AppState) {
    if let Some(outcome) = state.registry.leave(participant_id) {
        if !outcome.room_deleted {
            broadcast_presence(state, &outcome.room_id, outcome.participants).await;
            broadcast_to_room(
                state,
                &outcome.room_id,
                ServerMessage::PeerLeft { id: participant_id },
            )
            .await;
        }
    }
}

/// Periodic full-state timeline broadcast; heals dropped best-effort
/// seek/rate messages. Aborted by the registry when the room empties.
fn spawn_resync(state: AppState, room_id: String) {
    let task = tokio::spawn({
        let state = state.clone();
        let room_id = room_id.clone();
        async move {
            let mut ticker = tokio::time::interval(RESYNC_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(timeline) = state.registry.timeline(&room_id) else {
                    break;
                };
                broadcast_to_room(&state, &room_id, ServerMessage::Timeline(timeline)).await;
            }
        }
    });
    state.registry.attach_resync(&room_id, task);
}

async fn send_to(state: &AppState, participant_id: Uuid, msg: ServerMessage) {
    if let Some(tx) = state.client_senders.read().await.get(&participant_id) {
        let _ = tx.send(msg);
    }
}

async fn broadcast_presence(state: &AppState, room_id: &str, participants: Vec<protocol::Participant>) {
    broadcast_to_room(state, room_id, ServerMessage::Presence { participants }).await;
}

async fn broadcast_to_room(state: &AppState, room_id: &str, msg: ServerMessage) {
    let members = state.registry.members(room_id);
    let senders = state.client_senders.read().await;
    for member_id in members {
        if let Some(tx) = senders.get(&member_id) {
            let _ = tx.send(msg.clone());
        }
    }
}

async fn broadcast_except(state: &AppState, room_id: &str, skip: Uuid, msg: ServerMessage) {
    let members = state.registry.members(room_id);
    let senders = state.client_senders.read().await;
    for member_id in members {
        if member_id == skip {
            continue;
        }
        if let Some(tx) = senders.get(&member_id) {
            let _ = tx.send(msg.clone());
        }
    }
}
