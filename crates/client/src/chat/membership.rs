// Room membership state machine.
//
// Idle → Joining → Joined → Leaving → Idle. The session is in at most one
// room at a time; switching rooms yields Leave(old) before Join(new), and
// asking for the room already joined (or being joined) yields nothing.
// Live ingestion is gated on `accepts`.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipState {
    Idle,
    Joining(String),
    Joined(String),
    Leaving(String),
}

/// Emission the caller must perform, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipAction {
    Leave(String),
    Join(String),
}

#[derive(Debug, Clone)]
pub struct RoomMembership {
    state: MembershipState,
    joined_at: Option<DateTime<Utc>>,
}

impl Default for RoomMembership {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomMembership {
    pub fn new() -> Self {
        Self { state: MembershipState::Idle, joined_at: None }
    }

    pub fn state(&self) -> &MembershipState {
        &self.state
    }

    pub fn joined_at(&self) -> Option<DateTime<Utc>> {
        self.joined_at
    }

    /// The room being joined or joined, if any.
    pub fn active_room(&self) -> Option<&str> {
        match &self.state {
            MembershipState::Joining(room) | MembershipState::Joined(room) => Some(room),
            MembershipState::Idle | MembershipState::Leaving(_) => None,
        }
    }

    /// Whether a live event for `room_id` belongs to this session.
    pub fn accepts(&self, room_id: &str) -> bool {
        self.active_room() == Some(room_id)
    }

    pub fn request_join(&mut self, room_id: &str) -> Vec<MembershipAction> {
        let mut actions = Vec::new();
        match &self.state {
            MembershipState::Joining(current) | MembershipState::Joined(current)
                if current == room_id =>
            {
                return actions;
            }
            MembershipState::Joining(current) | MembershipState::Joined(current) => {
                actions.push(MembershipAction::Leave(current.clone()));
            }
            MembershipState::Idle | MembershipState::Leaving(_) => {}
        }
        actions.push(MembershipAction::Join(room_id.to_string()));
        self.state = MembershipState::Joining(room_id.to_string());
        self.joined_at = None;
        actions
    }

    /// Mark the pending join as complete. Ignored if the session moved on.
    pub fn confirm_joined(&mut self, room_id: &str, now: DateTime<Utc>) -> bool {
        match &self.state {
            MembershipState::Joining(current) if current == room_id => {
                self.state = MembershipState::Joined(room_id.to_string());
                self.joined_at = Some(now);
                true
            }
            _ => false,
        }
    }

    pub fn request_leave(&mut self) -> Option<MembershipAction> {
        let room = self.active_room()?.to_string();
        self.state = MembershipState::Leaving(room.clone());
        self.joined_at = None;
        Some(MembershipAction::Leave(room))
    }

    pub fn confirm_left(&mut self) {
        if matches!(self.state, MembershipState::Leaving(_)) {
            self.state = MembershipState::Idle;
        }
    }

    /// Drop straight back to idle, e.g. after a failed join emit.
    pub fn reset(&mut self) {
        self.state = MembershipState::Idle;
        self.joined_at = None;
    }
}
