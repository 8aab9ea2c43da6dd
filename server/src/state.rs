use dashmap::DashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{Participant, Role, TimelineState};

const LOG_TAG: &str = "[Lockstep Server]";

/// Server clock, epoch milliseconds.
pub fn server_now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64() * 1000.0)
        .unwrap_or(0.0)
}

/// Authoritative owner of timeline + presence, one entry per room.
///
/// Every mutation locks exactly one room entry and is applied as a single
/// step, so rooms never observe a half-applied update.
#[derive(Clone)]
pub struct RoomRegistry {
    rooms: Arc<DashMap<String, Room>>,
    /// participant_id -> room_id, so post-join messages need no room field.
    sessions: Arc<DashMap<Uuid, String>>,
}

pub struct Room {
    pub timeline: TimelineState,
    /// Insertion-ordered; authoritative handoff picks the first remaining.
    pub participants: Vec<Participant>,
    resync: Option<JoinHandle<()>>,
}

pub struct JoinOutcome {
    pub timeline: TimelineState,
    pub participants: Vec<Participant>,
    pub role: Role,
    pub display_name: String,
    /// True when this join created the room and a resync task must start.
    pub room_created: bool,
    /// Set when the participant was implicitly removed from another room;
    /// that room still needs its presence/peer-left broadcast.
    pub previous_room: Option<LeaveOutcome>,
}

pub struct LeaveOutcome {
    pub room_id: String,
    pub participants: Vec<Participant>,
    pub room_deleted: bool,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn join(
        &self,
        room_id: &str,
        participant_id: Uuid,
        name: Option<String>,
        as_authoritative: bool,
        initial_src: Option<String>,
    ) -> JoinOutcome {
        // A repeated join from the same connection must not duplicate the
        // participant; a join for a different room implies leaving the old
        // one first.
        let mut previous_room = None;
        if let Some(current) = self.room_of(participant_id) {
            if current == room_id {
                if let Some(existing) = self.membership_snapshot(&current, participant_id) {
                    return existing;
                }
            } else {
                previous_room = self.leave(participant_id);
            }
        }

        let mut room_created = false;
        let mut entry = self.rooms.entry(room_id.to_string()).or_insert_with(|| {
            tracing::info!("{LOG_TAG} Room {} created", room_id);
            room_created = true;
            Room::new(server_now_ms())
        });
        let room = entry.value_mut();

        let has_authoritative = room
            .participants
            .iter()
            .any(|p| p.role == Role::Authoritative);
        let role = if as_authoritative || !has_authoritative {
            Role::Authoritative
        } else {
            Role::Follower
        };

        // Only one authoritative participant per room; an explicit takeover
        // demotes the current one.
        if role == Role::Authoritative {
            for p in room.participants.iter_mut() {
                p.role = Role::Follower;
            }
            if let Some(src) = initial_src {
                if room.timeline.src.is_none() {
                    room.timeline.src = Some(src);
                }
            }
        }

        let display_name = sanitize_display_name(name.as_deref())
            .unwrap_or_else(|| default_display_name(participant_id));

        room.participants.push(Participant {
            id: participant_id,
            display_name: display_name.clone(),
            role,
            ready: false,
        });
        self.sessions.insert(participant_id, room_id.to_string());

        tracing::info!(
            "{LOG_TAG} Participant {} joined room {} as {:?}",
            participant_id,
            room_id,
            role
        );

        JoinOutcome {
            timeline: room.timeline.clone(),
            participants: room.participants.clone(),
            role,
            display_name,
            room_created,
            previous_room,
        }
    }

    /// Current membership expressed as a join outcome, for idempotent
    /// rejoins of the same room.
    fn membership_snapshot(&self, room_id: &str, participant_id: Uuid) -> Option<JoinOutcome> {
        let entry = self.rooms.get(room_id)?;
        let room = entry.value();
        let me = room
            .participants
            .iter()
            .find(|p| p.id == participant_id)?;
        Some(JoinOutcome {
            timeline: room.timeline.clone(),
            participants: room.participants.clone(),
            role: me.role,
            display_name: me.display_name.clone(),
            room_created: false,
            previous_room: None,
        })
    }

    /// Mutates the timeline through `op` if `participant_id` holds the
    /// authoritative role, returning the rebased state for broadcast.
    /// Commands from followers are ignored. An unknown room is lazily
    /// created first, so the operation never errors.
    pub fn mutate_timeline<F>(&self, participant_id: Uuid, op: F) -> Option<TimelineState>
    where
        F: FnOnce(&mut TimelineState, f64),
    {
        let room_id = self.room_of(participant_id)?;
        let mut entry = self
            .rooms
            .entry(room_id.clone())
            .or_insert_with(|| Room::new(server_now_ms()));
        let room = entry.value_mut();

        let is_authoritative = room
            .participants
            .iter()
            .any(|p| p.id == participant_id && p.role == Role::Authoritative);
        if !is_authoritative {
            tracing::debug!(
                "{LOG_TAG} Ignoring timeline command from follower {} in room {}",
                participant_id,
                room_id
            );
            return None;
        }

        op(&mut room.timeline, server_now_ms());
        Some(room.timeline.clone())
    }

    pub fn set_ready(&self, participant_id: Uuid, ready: bool) -> Option<Vec<Participant>> {
        let room_id = self.room_of(participant_id)?;
        let mut entry = self.rooms.get_mut(&room_id)?;
        let room = entry.value_mut();
        let participant = room
            .participants
            .iter_mut()
            .find(|p| p.id == participant_id)?;
        participant.ready = ready;
        Some(room.participants.clone())
    }

    pub fn leave(&self, participant_id: Uuid) -> Option<LeaveOutcome> {
        let (_, room_id) = self.sessions.remove(&participant_id)?;
        let mut entry = self.rooms.get_mut(&room_id)?;
        let room = entry.value_mut();

        let was_authoritative = room
            .participants
            .iter()
            .any(|p| p.id == participant_id && p.role == Role::Authoritative);
        room.participants.retain(|p| p.id != participant_id);

        if room.participants.is_empty() {
            if let Some(task) = room.resync.take() {
                task.abort();
            }
            drop(entry);
            self.rooms.remove(&room_id);
            tracing::info!("{LOG_TAG} Room {} deleted (empty)", room_id);
            return Some(LeaveOutcome {
                room_id,
                participants: Vec::new(),
                room_deleted: true,
            });
        }

        // First remaining participant by join order inherits the role.
        if was_authoritative {
            let next = &mut room.participants[0];
            next.role = Role::Authoritative;
            tracing::info!(
                "{LOG_TAG} Room {}: authoritative role handed to {}",
                room_id,
                next.id
            );
        }

        let participants = room.participants.clone();
        tracing::info!(
            "{LOG_TAG} Participant {} left room {}",
            participant_id,
            room_id
        );
        Some(LeaveOutcome {
            room_id,
            participants,
            room_deleted: false,
        })
    }

    pub fn room_of(&self, participant_id: Uuid) -> Option<String> {
        self.sessions.get(&participant_id).map(|r| r.clone())
    }

    pub fn timeline(&self, room_id: &str) -> Option<TimelineState> {
        self.rooms.get(room_id).map(|room| room.timeline.clone())
    }

    pub fn members(&self, room_id: &str) -> Vec<Uuid> {
        self.rooms
            .get(room_id)
            .map(|room| room.participants.iter().map(|p| p.id).collect())
            .unwrap_or_default()
    }

    pub fn display_name(&self, participant_id: Uuid) -> Option<String> {
        let room_id = self.room_of(participant_id)?;
        let room = self.rooms.get(&room_id)?;
        room.participants
            .iter()
            .find(|p| p.id == participant_id)
            .map(|p| p.display_name.clone())
    }

    /// Stores the room's 2s resync task handle so teardown can abort it.
    pub fn attach_resync(&self, room_id: &str, task: JoinHandle<()>) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            if let Some(previous) = room.resync.replace(task) {
                previous.abort();
            }
        } else {
            task.abort();
        }
    }

    pub fn room_exists(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }
}

impl Room {
    fn new(now_ms: f64) -> Self {
        Self {
            timeline: TimelineState::new(now_ms),
            participants: Vec::new(),
            resync: None,
        }
    }
}

fn sanitize_display_name(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut cleaned = String::with_capacity(trimmed.len().min(32));
    for ch in trimmed.chars() {
        if ch.is_control() {
            continue;
        }
        if cleaned.len() >= 32 {
            break;
        }
        cleaned.push(ch);
    }
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

fn default_display_name(participant_id: Uuid) -> String {
    let short = &participant_id.to_string()[..8];
    format!("Guest {short}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(registry: &RoomRegistry, room: &str, name: &str, auth: bool) -> Uuid {
        let id = Uuid::new_v4();
        registry.join(room, id, Some(name.to_string()), auth, None);
        id
    }

    #[test]
    fn first_joiner_becomes_authoritative() {
        let registry = RoomRegistry::new();
        let a = join(&registry, "movie-night", "A", false);
        let outcome = registry.join("movie-night", Uuid::new_v4(), None, false, None);

        assert_eq!(outcome.role, Role::Follower);
        let first = &outcome.participants[0];
        assert_eq!(first.id, a);
        assert_eq!(first.role, Role::Authoritative);
    }

    #[test]
    fn authoritative_handoff_follows_join_order() {
        let registry = RoomRegistry::new();
        let a = join(&registry, "room", "A", true);
        let b = join(&registry, "room", "B", false);
        let c = join(&registry, "room", "C", false);

        let outcome = registry.leave(a).unwrap();
        assert!(!outcome.room_deleted);
        assert_eq!(outcome.participants[0].id, b);
        assert_eq!(outcome.participants[0].role, Role::Authoritative);
        assert_eq!(outcome.participants[1].role, Role::Follower);

        registry.leave(b).unwrap();
        let last = registry.leave(c).unwrap();
        assert!(last.room_deleted);
        assert!(!registry.room_exists("room"));
    }

    #[test]
    fn follower_timeline_commands_are_ignored() {
        let registry = RoomRegistry::new();
        let _host = join(&registry, "room", "A", true);
        let follower = join(&registry, "room", "B", false);

        let result = registry.mutate_timeline(follower, |timeline, now| timeline.play(now));
        assert!(result.is_none());
        assert!(!registry.timeline("room").unwrap().is_playing);
    }

    #[test]
    fn authoritative_play_rebases_and_returns_state() {
        let registry = RoomRegistry::new();
        let host = join(&registry, "room", "A", true);

        let state = registry
            .mutate_timeline(host, |timeline, now| {
                timeline.seek(now, 30.0);
                timeline.play(now);
            })
            .unwrap();
        assert!(state.is_playing);
        assert_eq!(state.base_media_time, 30.0);
    }

    #[test]
    fn initial_src_applies_on_first_authoritative_join() {
        let registry = RoomRegistry::new();
        let outcome = registry.join(
            "room",
            Uuid::new_v4(),
            None,
            true,
            Some("https://cdn.example/feature.mp4".to_string()),
        );
        assert_eq!(
            outcome.timeline.src.as_deref(),
            Some("https://cdn.example/feature.mp4")
        );

        // A later takeover does not clobber the source.
        let later = registry.join(
            "room",
            Uuid::new_v4(),
            None,
            true,
            Some("https://cdn.example/other.mp4".to_string()),
        );
        assert_eq!(
            later.timeline.src.as_deref(),
            Some("https://cdn.example/feature.mp4")
        );
    }

    #[test]
    fn repeated_join_of_the_same_room_is_idempotent() {
        let registry = RoomRegistry::new();
        let host = Uuid::new_v4();
        registry.join("room", host, Some("A".to_string()), true, None);

        let again = registry.join("room", host, Some("A".to_string()), true, None);
        assert_eq!(again.participants.len(), 1);
        assert_eq!(again.role, Role::Authoritative);
        assert!(!again.room_created);
        assert!(again.previous_room.is_none());
        assert_eq!(registry.members("room"), vec![host]);
    }

    #[test]
    fn joining_another_room_leaves_the_first() {
        let registry = RoomRegistry::new();
        let host = join(&registry, "first", "A", true);
        let follower = join(&registry, "first", "B", false);

        // The host moves rooms: the old room must not keep a ghost member,
        // and the remaining participant inherits the role.
        let outcome = registry.join("second", host, None, true, None);
        let previous = outcome.previous_room.expect("implicit leave expected");
        assert_eq!(previous.room_id, "first");
        assert_eq!(previous.participants[0].id, follower);
        assert_eq!(previous.participants[0].role, Role::Authoritative);
        assert_eq!(registry.members("first"), vec![follower]);
        assert_eq!(registry.room_of(host).as_deref(), Some("second"));

        // A sole member moving on deletes the room outright.
        let last = registry.join("third", follower, None, false, None);
        assert!(last.previous_room.expect("implicit leave expected").room_deleted);
        assert!(!registry.room_exists("first"));
    }

    #[test]
    fn ready_flag_updates_presence() {
        let registry = RoomRegistry::new();
        let a = join(&registry, "room", "A", true);
        let presence = registry.set_ready(a, true).unwrap();
        assert!(presence[0].ready);
    }

    #[test]
    fn display_names_are_sanitized_and_defaulted() {
        assert_eq!(
            sanitize_display_name(Some("  Ana\u{7} ")),
            Some("Ana".to_string())
        );
        assert_eq!(sanitize_display_name(Some("   ")), None);
        let long = "x".repeat(64);
        assert_eq!(sanitize_display_name(Some(&long)).unwrap().len(), 32);
        assert!(default_display_name(Uuid::new_v4()).starts_with("Guest "));
    }
}
