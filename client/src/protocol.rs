use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages sent between client and server (must match server protocol)
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

/// Authoritative playback timeline broadcast by the server. Each broadcast
/// fully replaces the previous state, so there is nothing to merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineState {
    pub is_playing: bool,
    pub base_media_time: f64,
    pub base_server_time: f64,
    pub playback_rate: f64,
    pub src: Option<String>,
    pub subtitle_tracks: Vec<SubtitleTrack>,
}

impl TimelineState {
    /// Correct playback position (seconds) at server time `now_ms`.
    pub fn target(&self, now_ms: f64) -> f64 {
        if self.is_playing {
            self.base_media_time + (now_ms - self.base_server_time) / 1000.0 * self.playback_rate
        } else {
            self.base_media_time
        }
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
