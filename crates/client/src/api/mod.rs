// REST collaborators used by the sync layer.
//
// History fetch, seen marking, the system-message fallback, notice
// polling/acknowledgment, attachment upload, and credential lookup are
// traits here so sessions and mailboxes can run against fakes. `http`
// implements all of them over reqwest.

pub mod http;

use std::future::Future;

use anyhow::Result;
use thiserror::Error;

use eventsync_common::types::{ChatMessage, HistoryPage, NoticeItem};

pub use http::HttpApi;

// ── Errors ──────────────────────────────────────────────────────────

/// Failure to load a page of data. Surfaced to callers as a retryable
/// "could not load" state rather than tearing anything down.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("request failed: {0}")]
    Network(String),
    #[error("server returned status {0}")]
    Status(u16),
    #[error("could not decode response: {0}")]
    Decode(String),
}

impl LoadError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Status(code) => *code == 429 || *code >= 500,
            Self::Decode(_) => false,
        }
    }
}

// ── Traits ──────────────────────────────────────────────────────────

pub trait ChatApi: Send + Sync {
    /// One page of room history, oldest → newest, ending just before `before`.
    fn fetch_history(
        &self,
        room_id: &str,
        before: Option<&str>,
        limit: u32,
    ) -> impl Future<Output = Result<HistoryPage, LoadError>> + Send;

    fn mark_seen(
        &self,
        room_id: &str,
        message_ids: &[String],
    ) -> impl Future<Output = Result<()>> + Send;

    /// REST path for a system message when the push channel did not
    /// acknowledge. Returns the stored message if the server echoes it.
    fn post_system(
        &self,
        room_id: &str,
        text: &str,
        files: &[String],
    ) -> impl Future<Output = Result<Option<ChatMessage>>> + Send;
}

pub trait NoticeApi: Send + Sync {
    fn list_notices(&self) -> impl Future<Output = Result<Vec<NoticeItem>, LoadError>> + Send;

    fn acknowledge(&self, notice_id: &str) -> impl Future<Output = Result<()>> + Send;
}

/// A file queued for upload before a system message is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

pub trait AttachmentUploader: Send + Sync {
    /// Upload one file and return its URL.
    fn upload(&self, attachment: &Attachment) -> impl Future<Output = Result<String>> + Send;
}

/// Supplies the bearer credential for REST calls and push connections.
pub trait CredentialProvider: Send + Sync {
    fn credential(&self) -> Option<String>;
}

/// A fixed credential (or none).
#[derive(Debug, Clone, Default)]
pub struct StaticCredential(pub Option<String>);

impl CredentialProvider for StaticCredential {
    fn credential(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Reads the credential from an environment variable on every call.
#[derive(Debug, Clone)]
pub struct EnvCredential {
    var: String,
}

impl EnvCredential {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl CredentialProvider for EnvCredential {
    fn credential(&self) -> Option<String> {
        std::env::var(&self.var).ok().map(|value| value.trim().to_string()).filter(|v| !v.is_empty())
    }
}
