use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Playback rate bounds accepted on the authoritative timeline.
pub const RATE_MIN: f64 = 0.25;
pub const RATE_MAX: f64 = 4.0;

/// Messages sent between client and server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientMessage {
    Join {
        room_id: String,
        name: Option<String>,
        as_authoritative: Option<bool>,
        initial_src: Option<String>,
    },
    Play,
    Pause {
        at_time: Option<f64>,
    },
    Seek {
        to_media_time: f64,
    },
    Rate {
        playback_rate: f64,
    },
    Ready {
        ready: bool,
    },
    Ping {
        t0: f64,
    },
    Chat {
        text: String,
    },
    /// Peer-mesh offer/answer/ICE, relayed opaquely to `target`.
    Signal {
        target: Uuid,
        payload: serde_json::Value,
    },
    Leave,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerMessage {
    Joined {
        participant_id: Uuid,
        timeline: TimelineState,
    },
    Timeline(TimelineState),
    Presence {
        participants: Vec<Participant>,
    },
    Pong {
        t0: f64,
        t1: f64,
    },
    Chat(ChatMessage),
    Signal {
        from: Uuid,
        payload: serde_json::Value,
    },
    PeerJoined {
        id: Uuid,
    },
    PeerLeft {
        id: Uuid,
    },
    Error {
        message: String,
    },
}

/// Authoritative playback timeline for one room.
///
/// `(base_media_time, base_server_time)` is always a valid reference pair:
/// the correct position at server time `now` is `target(now)`. Every mutation
/// rebases both fields together so the pair never observably disagrees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineState {
    pub is_playing: bool,
    /// Media position in seconds at the moment of the last rebase.
    pub base_media_time: f64,
    /// Server clock (epoch milliseconds) at the moment of the last rebase.
    pub base_server_time: f64,
    pub playback_rate: f64,
    pub src: Option<String>,
    pub subtitle_tracks: Vec<SubtitleTrack>,
}

impl TimelineState {
    pub fn new(now_ms: f64) -> Self {
        Self {
            is_playing: false,
            base_media_time: 0.0,
            base_server_time: now_ms,
            playback_rate: 1.0,
            src: None,
            subtitle_tracks: Vec::new(),
        }
    }

    /// Correct playback position (seconds) at server time `now_ms`.
    pub fn target(&self, now_ms: f64) -> f64 {
        if self.is_playing {
            self.base_media_time + (now_ms - self.base_server_time) / 1000.0 * self.playback_rate
        } else {
            self.base_media_time
        }
    }

    pub fn play(&mut self, now_ms: f64) {
        let position = self.target(now_ms);
        self.is_playing = true;
        self.rebase(position, now_ms);
    }

    /// Pause at `at_time` when the caller supplies an exact position,
    /// otherwise at the recomputed target.
    pub fn pause(&mut self, now_ms: f64, at_time: Option<f64>) {
        let fallback = self.target(now_ms);
        self.is_playing = false;
        self.rebase(at_time.unwrap_or(fallback).max(0.0), now_ms);
    }

    pub fn seek(&mut self, now_ms: f64, to_media_time: f64) {
        self.rebase(to_media_time.max(0.0), now_ms);
    }

    /// Rebases before changing the rate so the position stays continuous
    /// across the rate change.
    pub fn set_rate(&mut self, now_ms: f64, rate: f64) {
        let position = self.target(now_ms);
        self.rebase(position, now_ms);
        self.playback_rate = rate.clamp(RATE_MIN, RATE_MAX);
    }

    fn rebase(&mut self, media_time: f64, now_ms: f64) {
        self.base_media_time = media_time;
        self.base_server_time = now_ms;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Authoritative,
    Follower,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub display_name: String,
    pub role: Role,
    pub ready: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtitleTrack {
    pub label: String,
    pub src: String,
    pub lang: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub timestamp_ms: f64,
    pub text: String,
}
