// Core domain types shared across all eventsync crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;

/// Prefix of client-generated ids (optimistic messages, local notices).
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Generate a client-side id that can never collide with a server id.
pub fn local_id() -> String {
    format!("{LOCAL_ID_PREFIX}{}", Uuid::new_v4())
}

// ── Chat ────────────────────────────────────────────────────────────

/// A chat message. `id` is the sole identity and deduplication key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub text: String,
    /// Attachment URLs, in upload order.
    #[serde(default)]
    pub attachments: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Set once, never cleared.
    #[serde(default)]
    pub seen_by_me: bool,
}

impl ChatMessage {
    /// Whether this message was created optimistically and still waits for
    /// its server-assigned id.
    pub fn is_local(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX)
    }
}

/// One page of room history, ordered oldest → newest.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub messages: Vec<ChatMessage>,
    /// Cursor for the next older page; `None` once the start is reached.
    #[serde(default)]
    pub next_cursor: Option<String>,
}

// ── Notices ─────────────────────────────────────────────────────────

/// Where a notice came from. Only server notices are acknowledged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NoticeSource {
    Server,
    Local,
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum NoticePriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// Optional call-to-action rendered with a notice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NoticeAction {
    pub label: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_tag: Option<String>,
}

/// A notice waiting for, or occupying, the published slot.
///
/// Server notices carry the server's stable id; local notices carry a
/// synthetic `local-*` id that only serves as in-process identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NoticeItem {
    pub source: NoticeSource,
    pub id: String,
    pub kind: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub priority: NoticePriority,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<NoticeAction>,
}

impl NoticeItem {
    /// Build a server notice. Fails if `id` is blank.
    pub fn server(
        id: impl Into<String>,
        kind: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, ProtocolError> {
        let item = Self {
            source: NoticeSource::Server,
            id: id.into(),
            kind: kind.into(),
            title: title.into(),
            body: body.into(),
            priority: NoticePriority::Normal,
            created_at,
            action: None,
        };
        item.validate()?;
        Ok(item)
    }

    /// Build a local notice with a fresh synthetic id.
    pub fn local(kind: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            source: NoticeSource::Local,
            id: local_id(),
            kind: kind.into(),
            title: title.into(),
            body: body.into(),
            priority: NoticePriority::Normal,
            created_at: Utc::now(),
            action: None,
        }
    }

    pub fn with_priority(mut self, priority: NoticePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_action(mut self, action: NoticeAction) -> Self {
        self.action = Some(action);
        self
    }

    /// The id to acknowledge once this notice leaves the slot, if any.
    pub fn ack_id(&self) -> Option<&str> {
        match self.source {
            NoticeSource::Server => Some(self.id.as_str()),
            NoticeSource::Local => None,
        }
    }

    /// Identity used to compare slot contents across ticks and processes.
    pub fn key(&self) -> (NoticeSource, &str) {
        (self.source, self.id.as_str())
    }

    /// Check the server-id invariant on items decoded from the wire.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.source == NoticeSource::Server && self.id.trim().is_empty() {
            return Err(ProtocolError::MissingNoticeId);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    #[test]
    fn chat_message_uses_camel_case_on_the_wire() {
        let msg = ChatMessage {
            id: "m1".into(),
            room_id: "r1".into(),
            sender_id: "u1".into(),
            text: "hi".into(),
            attachments: vec!["https://cdn.test/a.png".into()],
            created_at: t(10),
            seen_by_me: false,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["roomId"], "r1");
        assert_eq!(value["senderId"], "u1");
        assert_eq!(value["seenByMe"], false);
    }

    #[test]
    fn chat_message_defaults_missing_optional_fields() {
        let msg: ChatMessage = serde_json::from_str(
            r#"{"id":"m1","roomId":"r","senderId":"u","text":"x","createdAt":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(msg.attachments.is_empty());
        assert!(!msg.seen_by_me);
        assert!(!msg.is_local());
    }

    #[test]
    fn local_ids_are_prefixed_and_unique() {
        let a = local_id();
        let b = local_id();
        assert!(a.starts_with(LOCAL_ID_PREFIX));
        assert_ne!(a, b);
    }

    #[test]
    fn server_notice_requires_id() {
        let err = NoticeItem::server("  ", "event", "t", "b", t(0)).unwrap_err();
        assert_eq!(err, ProtocolError::MissingNoticeId);
    }

    #[test]
    fn only_server_notices_have_ack_ids() {
        let server = NoticeItem::server("n-1", "event", "t", "b", t(0)).unwrap();
        let local = NoticeItem::local("toast", "Saved", "");
        assert_eq!(server.ack_id(), Some("n-1"));
        assert_eq!(local.ack_id(), None);
        assert!(local.validate().is_ok());
    }

    #[test]
    fn priority_orders_low_to_urgent() {
        assert!(NoticePriority::Low < NoticePriority::Normal);
        assert!(NoticePriority::High < NoticePriority::Urgent);
        assert_eq!(NoticePriority::default(), NoticePriority::Normal);
    }

    #[test]
    fn notice_deserializes_without_priority() {
        let item: NoticeItem = serde_json::from_str(
            r#"{"source":"server","id":"n9","kind":"reminder","title":"Soon","createdAt":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(item.priority, NoticePriority::Normal);
        assert_eq!(item.body, "");
        assert!(item.action.is_none());
    }
}
