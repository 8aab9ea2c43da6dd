use anyhow::Result;
use std::env;
use std::sync::Arc;
use tokio::time::Duration;

use lockstep_client::media::SimulatedMedia;
use lockstep_client::session::{ClientSession, SessionConfig, SessionEvent};

/// Headless sync client: joins a room with a simulated player and follows
/// the authoritative timeline. Useful for soak-testing a server and as a
/// reference embedding.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lockstep_client=debug,info".into()),
        )
        .init();

    let config = SessionConfig {
        server_url: env::var("LOCKSTEP_SERVER_URL")
            .unwrap_or_else(|_| "ws://localhost:3210/ws".to_string()),
        room_id: env::var("LOCKSTEP_ROOM").unwrap_or_else(|_| "lobby".to_string()),
        display_name: env::var("LOCKSTEP_NAME").ok(),
        as_authoritative: env::var("LOCKSTEP_AUTHORITATIVE").is_ok(),
        initial_src: env::var("LOCKSTEP_SRC").ok(),
    };

    let media = Arc::new(SimulatedMedia::new());
    let session = ClientSession::new(media);
    session.on_event(|event| match event {
        SessionEvent::Joined { participant_id } => {
            tracing::info!("Joined as {participant_id}");
        }
        SessionEvent::Presence(participants) => {
            tracing::info!("Presence: {} participant(s)", participants.len());
        }
        SessionEvent::Timeline(state) => {
            tracing::debug!(
                is_playing = state.is_playing,
                rate = state.playback_rate,
                "timeline update"
            );
        }
        SessionEvent::Chat(chat) => {
            tracing::info!("[{}] {}", chat.sender_name, chat.text);
        }
        SessionEvent::Error(message) => {
            tracing::warn!("Server error: {message}");
        }
    });

    // Reconnect with linear capped backoff: the skew estimator re-probes
    // immediately on each successful reconnection.
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match session.connect(&config).await {
            Ok(disconnect_rx) => {
                tracing::info!("Connected to {}", config.server_url);
                attempt = 0;
                let _ = disconnect_rx.await;
                session.link().mark_disconnected();
                tracing::warn!("Disconnected, reconnecting");
            }
            Err(e) => {
                tracing::warn!("Connection to {} failed: {e}", config.server_url);
            }
        }
        let delay = Duration::from_secs(5 * attempt.min(6) as u64);
        tokio::time::sleep(delay.max(Duration::from_secs(1))).await;
    }
}
