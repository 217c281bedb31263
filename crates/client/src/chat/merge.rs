// Per-room message buffer: paged history + live tail → one ordered view.
//
// `history` holds REST pages (oldest → newest) and `live` holds pushed
// messages in arrival order. The visible sequence is `merge(history, live)`:
// keyed by id, live overlaying history, stable-sorted by `created_at` so
// equal timestamps keep history-before-live insertion order.
//
// `seen_by_me` only ever goes false → true, whichever side carries it.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use eventsync_common::types::{ChatMessage, HistoryPage};

use crate::api::{ChatApi, LoadError};

/// Merge history and live tail into the visible, deduplicated sequence.
pub fn merge(history: &[ChatMessage], live: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut merged: Vec<ChatMessage> = Vec::with_capacity(history.len() + live.len());
    let mut slots: HashMap<&str, usize> = HashMap::with_capacity(history.len() + live.len());
    for message in history.iter().chain(live) {
        match slots.get(message.id.as_str()) {
            Some(&slot) => {
                let seen = merged[slot].seen_by_me || message.seen_by_me;
                merged[slot] = message.clone();
                merged[slot].seen_by_me = seen;
            }
            None => {
                slots.insert(message.id.as_str(), merged.len());
                merged.push(message.clone());
            }
        }
    }
    merged.sort_by_key(|message| message.created_at);
    merged
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Appended,
    /// Already known; only its seen flag was raised.
    Updated,
    Duplicate,
}

/// History loading state, as shown to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    Loading,
    /// The oldest page has been fetched.
    Exhausted,
    /// The last fetch failed; buffers are untouched and a retry is allowed.
    Failed { reason: String },
}

/// An in-flight history fetch started by [`MessageBuffer::begin_load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub room_id: String,
    pub before: Option<String>,
    pub limit: u32,
}

#[derive(Debug, Clone)]
pub struct MessageBuffer {
    room_id: String,
    history: Vec<ChatMessage>,
    live: Vec<ChatMessage>,
    next_cursor: Option<String>,
    /// Whether the newest page has been fetched at least once.
    synced: bool,
    load_state: LoadState,
}

impl MessageBuffer {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            history: Vec::new(),
            live: Vec::new(),
            next_cursor: None,
            synced: false,
            load_state: LoadState::Idle,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn live_tail(&self) -> &[ChatMessage] {
        &self.live
    }

    pub fn next_cursor(&self) -> Option<&str> {
        self.next_cursor.as_deref()
    }

    pub fn load_state(&self) -> &LoadState {
        &self.load_state
    }

    pub fn view(&self) -> Vec<ChatMessage> {
        merge(&self.history, &self.live)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.history.iter().chain(&self.live).any(|message| message.id == id)
    }

    // ── History ──────────────────────────────────────────────────────

    /// Start fetching the next older page. `None` when a fetch is already
    /// running or the start of history was reached.
    pub fn begin_load(&mut self, limit: u32) -> Option<HistoryRequest> {
        if self.load_state == LoadState::Loading {
            return None;
        }
        if self.synced && self.next_cursor.is_none() {
            self.load_state = LoadState::Exhausted;
            return None;
        }
        self.load_state = LoadState::Loading;
        Some(HistoryRequest {
            room_id: self.room_id.clone(),
            before: if self.synced { self.next_cursor.clone() } else { None },
            limit,
        })
    }

    /// Apply the result of a fetch started by `begin_load`.
    pub fn finish_load(
        &mut self,
        request: &HistoryRequest,
        result: Result<HistoryPage, LoadError>,
    ) -> Result<Vec<ChatMessage>, LoadError> {
        if request.room_id != self.room_id {
            debug!(room_id = %request.room_id, "dropping history page for another room");
            return Ok(self.view());
        }
        match result {
            Ok(page) => {
                let fetched = page.messages.len();
                self.prepend(page.messages);
                self.next_cursor = page.next_cursor;
                self.synced = true;
                self.load_state =
                    if self.next_cursor.is_some() { LoadState::Idle } else { LoadState::Exhausted };
                debug!(room_id = %self.room_id, fetched, exhausted = self.next_cursor.is_none(), "history page merged");
                Ok(self.view())
            }
            Err(error) => {
                self.load_state = LoadState::Failed { reason: error.to_string() };
                Err(error)
            }
        }
    }

    /// Fetch and prepend one older page. A no-op once history is exhausted.
    pub async fn load_older<A: ChatApi>(
        &mut self,
        api: &A,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, LoadError> {
        let Some(request) = self.begin_load(limit) else {
            return Ok(self.view());
        };
        let result = api.fetch_history(&request.room_id, request.before.as_deref(), request.limit).await;
        self.finish_load(&request, result)
    }

    /// Fold a freshly fetched newest page into history (reconnect re-sync).
    /// Known ids are updated in place; the older-page cursor is kept.
    pub fn apply_resync(&mut self, page: HistoryPage) {
        for message in page.messages {
            match self.history.iter_mut().find(|existing| existing.id == message.id) {
                Some(existing) => {
                    let seen = existing.seen_by_me || message.seen_by_me;
                    *existing = message;
                    existing.seen_by_me = seen;
                }
                None => self.history.push(message),
            }
        }
        self.history.sort_by_key(|message| message.created_at);
        if !self.synced {
            self.next_cursor = page.next_cursor;
            self.synced = true;
        }
    }

    fn prepend(&mut self, older: Vec<ChatMessage>) {
        let known: HashSet<&str> = self.history.iter().map(|message| message.id.as_str()).collect();
        let mut combined: Vec<ChatMessage> =
            older.into_iter().filter(|message| !known.contains(message.id.as_str())).collect();
        combined.append(&mut self.history);
        self.history = combined;
    }

    // ── Live ─────────────────────────────────────────────────────────

    pub fn ingest_live(&mut self, message: ChatMessage) -> IngestOutcome {
        if !self.contains(&message.id) {
            self.live.push(message);
            return IngestOutcome::Appended;
        }
        if message.seen_by_me && self.mark_seen(std::slice::from_ref(&message.id)) > 0 {
            IngestOutcome::Updated
        } else {
            IngestOutcome::Duplicate
        }
    }

    /// Remove a message from both buffers. Unknown ids are ignored.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.history.len() + self.live.len();
        self.history.retain(|message| message.id != id);
        self.live.retain(|message| message.id != id);
        before != self.history.len() + self.live.len()
    }

    /// Raise `seen_by_me` on every known copy of `ids`. Returns how many
    /// distinct ids changed.
    pub fn mark_seen(&mut self, ids: &[String]) -> usize {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut changed: HashSet<String> = HashSet::new();
        for message in self.history.iter_mut().chain(self.live.iter_mut()) {
            if !message.seen_by_me && wanted.contains(message.id.as_str()) {
                message.seen_by_me = true;
                changed.insert(message.id.clone());
            }
        }
        changed.len()
    }

    // ── Optimistic sends ─────────────────────────────────────────────

    /// Show an outgoing message before the server has assigned its id.
    pub fn stage_outgoing(&mut self, message: ChatMessage) {
        debug_assert!(message.is_local(), "staged messages carry a local id");
        self.live.push(message);
    }

    /// Replace a staged message with the server's copy. If the server echo
    /// already arrived over push, the staged copy is simply dropped.
    pub fn confirm_outgoing(&mut self, local_id: &str, confirmed: ChatMessage) -> bool {
        let staged = self.discard_outgoing(local_id);
        self.ingest_live(confirmed);
        staged
    }

    pub fn discard_outgoing(&mut self, local_id: &str) -> bool {
        let before = self.live.len();
        self.live.retain(|message| message.id != local_id);
        before != self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use eventsync_common::types::local_id;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().expect("valid timestamp")
    }

    fn msg(id: &str, secs: i64) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            room_id: "r1".into(),
            sender_id: "them".into(),
            text: format!("message {id}"),
            attachments: Vec::new(),
            created_at: at(secs),
            seen_by_me: false,
        }
    }

    fn ids(view: &[ChatMessage]) -> Vec<&str> {
        view.iter().map(|message| message.id.as_str()).collect()
    }

    #[derive(Default)]
    struct FakeHistory {
        pages: Mutex<VecDeque<Result<HistoryPage, LoadError>>>,
        cursors: Mutex<Vec<Option<String>>>,
    }

    impl FakeHistory {
        fn with(pages: Vec<Result<HistoryPage, LoadError>>) -> Self {
            Self { pages: Mutex::new(pages.into()), cursors: Mutex::default() }
        }
    }

    impl ChatApi for FakeHistory {
        async fn fetch_history(
            &self,
            _room_id: &str,
            before: Option<&str>,
            _limit: u32,
        ) -> Result<HistoryPage, LoadError> {
            self.cursors.lock().unwrap().push(before.map(str::to_string));
            self.pages.lock().unwrap().pop_front().unwrap_or_else(|| Ok(HistoryPage::default()))
        }

        async fn mark_seen(&self, _room_id: &str, _ids: &[String]) -> anyhow::Result<()> {
            Ok(())
        }

        async fn post_system(
            &self,
            _room_id: &str,
            _text: &str,
            _files: &[String],
        ) -> anyhow::Result<Option<ChatMessage>> {
            Ok(None)
        }
    }

    fn page(messages: Vec<ChatMessage>, cursor: Option<&str>) -> HistoryPage {
        HistoryPage { messages, next_cursor: cursor.map(str::to_string) }
    }

    #[test]
    fn live_update_raises_seen_flag_without_duplicating() {
        let mut buffer = MessageBuffer::new("r1");
        let request = buffer.begin_load(30).unwrap();
        buffer
            .finish_load(&request, Ok(page(vec![msg("1", 1), msg("2", 2), msg("3", 3)], None)))
            .unwrap();

        let mut update = msg("2", 2);
        update.seen_by_me = true;
        assert_eq!(buffer.ingest_live(update), IngestOutcome::Updated);

        let view = buffer.view();
        assert_eq!(ids(&view), vec!["1", "2", "3"]);
        assert!(view[1].seen_by_me);
    }

    #[test]
    fn live_entry_wins_over_history_on_merge() {
        let history = vec![msg("1", 1), msg("2", 2)];
        let mut live_copy = msg("2", 2);
        live_copy.text = "edited".into();
        let view = merge(&history, &[live_copy]);
        assert_eq!(view.len(), 2);
        assert_eq!(view[1].text, "edited");
    }

    #[test]
    fn merge_never_lowers_seen_flag() {
        let mut seen = msg("1", 1);
        seen.seen_by_me = true;
        let view = merge(&[seen], &[msg("1", 1)]);
        assert!(view[0].seen_by_me);
    }

    #[test]
    fn equal_timestamps_keep_history_before_live() {
        let view = merge(&[msg("h", 5)], &[msg("l", 5), msg("early", 1)]);
        assert_eq!(ids(&view), vec!["early", "h", "l"]);
    }

    #[test]
    fn duplicate_live_message_is_ignored() {
        let mut buffer = MessageBuffer::new("r1");
        assert_eq!(buffer.ingest_live(msg("a", 1)), IngestOutcome::Appended);
        assert_eq!(buffer.ingest_live(msg("a", 1)), IngestOutcome::Duplicate);
        assert_eq!(buffer.view().len(), 1);
    }

    #[test]
    fn live_message_later_seen_in_history_does_not_duplicate() {
        let mut buffer = MessageBuffer::new("r1");
        buffer.ingest_live(msg("9", 9));
        buffer.apply_resync(page(vec![msg("8", 8), msg("9", 9)], Some("c1")));
        assert_eq!(ids(&buffer.view()), vec!["8", "9"]);
        assert_eq!(buffer.next_cursor(), Some("c1"));
    }

    #[test]
    fn remove_drops_from_both_buffers_and_ignores_unknown() {
        let mut buffer = MessageBuffer::new("r1");
        let request = buffer.begin_load(30).unwrap();
        buffer.finish_load(&request, Ok(page(vec![msg("1", 1)], None))).unwrap();
        buffer.ingest_live(msg("2", 2));
        buffer.apply_resync(page(vec![msg("2", 2)], None));

        assert!(buffer.remove("2"));
        assert_eq!(ids(&buffer.view()), vec!["1"]);
        assert!(!buffer.remove("missing"));
    }

    #[tokio::test]
    async fn load_older_prepends_and_follows_cursor() {
        let api = FakeHistory::with(vec![
            Ok(page(vec![msg("3", 3), msg("4", 4)], Some("c3"))),
            Ok(page(vec![msg("1", 1), msg("2", 2), msg("3", 3)], None)),
        ]);
        let mut buffer = MessageBuffer::new("r1");

        buffer.load_older(&api, 2).await.unwrap();
        assert_eq!(buffer.load_state(), &LoadState::Idle);
        let view = buffer.load_older(&api, 2).await.unwrap();
        assert_eq!(ids(&view), vec!["1", "2", "3", "4"]);
        assert_eq!(buffer.load_state(), &LoadState::Exhausted);
        assert_eq!(*api.cursors.lock().unwrap(), vec![None, Some("c3".to_string())]);
    }

    #[tokio::test]
    async fn load_older_without_cursor_is_a_no_op() {
        let api = FakeHistory::with(vec![Ok(page(vec![msg("1", 1)], None))]);
        let mut buffer = MessageBuffer::new("r1");
        let first = buffer.load_older(&api, 30).await.unwrap();

        let again = buffer.load_older(&api, 30).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(api.cursors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_load_keeps_data_and_allows_retry() {
        let api = FakeHistory::with(vec![
            Ok(page(vec![msg("5", 5)], Some("c5"))),
            Err(LoadError::Status(503)),
            Ok(page(vec![msg("4", 4)], None)),
        ]);
        let mut buffer = MessageBuffer::new("r1");
        buffer.load_older(&api, 1).await.unwrap();

        let err = buffer.load_older(&api, 1).await.unwrap_err();
        assert_eq!(err, LoadError::Status(503));
        assert!(matches!(buffer.load_state(), LoadState::Failed { .. }));
        assert_eq!(ids(&buffer.view()), vec!["5"]);

        let view = buffer.load_older(&api, 1).await.unwrap();
        assert_eq!(ids(&view), vec!["4", "5"]);
        assert_eq!(api.cursors.lock().unwrap()[2].as_deref(), Some("c5"));
    }

    #[test]
    fn concurrent_load_is_refused() {
        let mut buffer = MessageBuffer::new("r1");
        assert!(buffer.begin_load(30).is_some());
        assert!(buffer.begin_load(30).is_none());
    }

    #[test]
    fn page_for_another_room_is_dropped() {
        let mut buffer = MessageBuffer::new("r1");
        let stale = HistoryRequest { room_id: "r0".into(), before: None, limit: 30 };
        buffer.finish_load(&stale, Ok(page(vec![msg("x", 1)], None))).unwrap();
        assert!(buffer.view().is_empty());
    }

    #[test]
    fn confirm_outgoing_rekeys_staged_message() {
        let mut buffer = MessageBuffer::new("r1");
        let local = local_id();
        buffer.stage_outgoing(ChatMessage { id: local.clone(), ..msg("ignored", 10) });
        assert_eq!(buffer.view().len(), 1);

        assert!(buffer.confirm_outgoing(&local, msg("srv-1", 10)));
        assert_eq!(ids(&buffer.view()), vec!["srv-1"]);
    }

    #[test]
    fn confirm_after_push_echo_does_not_duplicate() {
        let mut buffer = MessageBuffer::new("r1");
        let local = local_id();
        buffer.stage_outgoing(ChatMessage { id: local.clone(), ..msg("ignored", 10) });
        buffer.ingest_live(msg("srv-1", 10));

        buffer.confirm_outgoing(&local, msg("srv-1", 10));
        assert_eq!(ids(&buffer.view()), vec!["srv-1"]);
    }

    #[test]
    fn mark_seen_counts_distinct_changes() {
        let mut buffer = MessageBuffer::new("r1");
        buffer.ingest_live(msg("a", 1));
        buffer.ingest_live(msg("b", 2));
        assert_eq!(buffer.mark_seen(&["a".into(), "b".into(), "zzz".into()]), 2);
        assert_eq!(buffer.mark_seen(&["a".into()]), 0);
    }
}
