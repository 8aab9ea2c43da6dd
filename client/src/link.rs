use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc, oneshot},
    time::interval,
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::protocol::{ClientMessage, ServerMessage};

/// Flush window for the best-effort send class. Seek/rate are
/// latest-value-wins: only the newest pending value survives a window,
/// and a dropped one is healed by the server's periodic resync.
const BEST_EFFORT_FLUSH: Duration = Duration::from_millis(150);

/// WebSocket channel to the sync server.
///
/// Reliable messages go straight onto the socket queue; best-effort
/// seek/rate are coalesced through [`ServerLink::send_seek`] /
/// [`ServerLink::send_rate`].
pub struct ServerLink {
    inner: Arc<LinkState>,
}

struct LinkState {
    tx: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    /// Bumped on every connect; socket tasks and the flusher belong to one
    /// generation and stand down when a newer connection replaces them.
    generation: Mutex<u64>,
    pending_seek: Mutex<Option<f64>>,
    pending_rate: Mutex<Option<f64>>,
    stats: Mutex<LinkStats>,
}

#[derive(Default)]
struct LinkStats {
    bytes_out: u64,
    bytes_in: u64,
    messages_out: u64,
    messages_in: u64,
    last_message_at: Option<Instant>,
    reconnect_attempts: u32,
    connected_since: Option<Instant>,
}

pub struct LinkStatsSnapshot {
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub messages_out: u64,
    pub messages_in: u64,
    pub last_message_age: Option<f32>,
    pub connected_duration: Option<f32>,
    pub reconnect_attempts: u32,
}

impl ServerLink {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LinkState {
                tx: Mutex::new(None),
                generation: Mutex::new(0),
                pending_seek: Mutex::new(None),
                pending_rate: Mutex::new(None),
                stats: Mutex::new(LinkStats::default()),
            }),
        }
    }

    /// Connect to the sync server. Returns a receiver that resolves when
    /// the socket closes.
    pub async fn connect<F>(&self, server_url: &str, on_message: F) -> Result<oneshot::Receiver<()>>
    where
        F: Fn(ServerMessage) + Send + Sync + 'static,
    {
        let (ws_stream, _) = connect_async(server_url)
            .await
            .context("Failed to connect to server")?;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        let generation = {
            let mut current = self.inner.generation.lock();
            *current += 1;
            *current
        };
        *self.inner.tx.lock() = Some(tx.clone());
        self.inner.mark_connected();

        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        let disconnect_signal = Arc::new(Mutex::new(Some(disconnect_tx)));

        // Sender task
        let send_inner = Arc::clone(&self.inner);
        let send_signal = Arc::clone(&disconnect_signal);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
            send_inner.clear_transport(generation);
            if let Some(tx) = send_signal.lock().take() {
                let _ = tx.send(());
            }
        });

        // Receiver task
        let handler = Arc::new(on_message);
        let recv_inner = Arc::clone(&self.inner);
        let recv_signal = Arc::clone(&disconnect_signal);
        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        recv_inner.record_incoming(text.len() as u64);
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(parsed) => handler(parsed),
                            Err(e) => tracing::warn!("Unparseable server message: {e}"),
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Err(_) => break,
                    _ => {}
                }
            }
            recv_inner.clear_transport(generation);
            if let Some(tx) = recv_signal.lock().take() {
                let _ = tx.send(());
            }
        });

        // Best-effort flusher: latest pending seek/rate every window. Owned
        // by this generation so a quick reconnect cannot double it up.
        let flush_inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = interval(BEST_EFFORT_FLUSH);
            loop {
                ticker.tick().await;
                if *flush_inner.generation.lock() != generation
                    || flush_inner.tx.lock().is_none()
                {
                    break;
                }
                if let Some(to) = flush_inner.pending_seek.lock().take() {
                    let _ = flush_inner.send_now(&ClientMessage::Seek { to_media_time: to });
                }
                if let Some(rate) = flush_inner.pending_rate.lock().take() {
                    let _ = flush_inner.send_now(&ClientMessage::Rate {
                        playback_rate: rate,
                    });
                }
            }
        });

        Ok(disconnect_rx)
    }

    /// Reliable send: join, play, pause, ready, ping, chat, signaling, leave.
    pub fn send(&self, msg: &ClientMessage) -> Result<()> {
        self.inner.send_now(msg)
    }

    /// Best-effort seek: coalesced, latest value wins.
    pub fn send_seek(&self, to_media_time: f64) {
        *self.inner.pending_seek.lock() = Some(to_media_time);
    }

    /// Best-effort rate: coalesced, latest value wins.
    pub fn send_rate(&self, playback_rate: f64) {
        *self.inner.pending_rate.lock() = Some(playback_rate);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.tx.lock().is_some()
    }

    /// Closes the connection: queues a Close frame, drops the outbound
    /// sender so the socket tasks exit, and discards pending best-effort
    /// values.
    pub fn close(&self) {
        if let Some(tx) = self.inner.tx.lock().take() {
            let _ = tx.send(WsMessage::Close(None));
        }
        *self.inner.pending_seek.lock() = None;
        *self.inner.pending_rate.lock() = None;
    }

    pub fn mark_disconnected(&self) {
        self.inner.mark_disconnected();
    }

    pub fn stats_snapshot(&self) -> LinkStatsSnapshot {
        self.inner.snapshot()
    }
}

impl Default for ServerLink {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkState {
    fn send_now(&self, msg: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(msg).context("Failed to serialize message")?;
        self.record_outgoing(json.len() as u64);
        if let Some(tx) = self.tx.lock().clone() {
            tx.send(WsMessage::Text(json.into()))
                .context("Failed to queue message to socket")?;
        }
        Ok(())
    }

    fn record_outgoing(&self, bytes: u64) {
        let mut stats = self.stats.lock();
        stats.bytes_out += bytes;
        stats.messages_out += 1;
        stats.last_message_at = Some(Instant::now());
    }

    fn record_incoming(&self, bytes: u64) {
        let mut stats = self.stats.lock();
        stats.bytes_in += bytes;
        stats.messages_in += 1;
        stats.last_message_at = Some(Instant::now());
    }

    /// No-op for stale generations: a task outliving its connection must
    /// not clobber the transport of the one that replaced it.
    fn clear_transport(&self, generation: u64) {
        if *self.generation.lock() != generation {
            return;
        }
        *self.tx.lock() = None;
        *self.pending_seek.lock() = None;
        *self.pending_rate.lock() = None;
    }

    fn mark_connected(&self) {
        self.stats.lock().connected_since = Some(Instant::now());
    }

    fn mark_disconnected(&self) {
        let mut stats = self.stats.lock();
        stats.connected_since = None;
        stats.reconnect_attempts += 1;
    }

    #[cfg(test)]
    fn install_transport(&self, generation: u64, tx: mpsc::UnboundedSender<WsMessage>) {
        *self.generation.lock() = generation;
        *self.tx.lock() = Some(tx);
    }

    fn snapshot(&self) -> LinkStatsSnapshot {
        let stats = self.stats.lock();
        LinkStatsSnapshot {
            bytes_out: stats.bytes_out,
            bytes_in: stats.bytes_in,
            messages_out: stats.messages_out,
            messages_in: stats.messages_in,
            last_message_age: stats
                .last_message_at
                .map(|inst| inst.elapsed().as_secs_f32()),
            connected_duration: stats
                .connected_since
                .map(|inst| inst.elapsed().as_secs_f32()),
            reconnect_attempts: stats.reconnect_attempts,
        }
    }
}
