// reqwest implementation of the REST collaborators.
//
// Routes (relative to `api.base_url`):
//   GET  chat/rooms/{room}/messages?limit=&before=
//   POST chat/rooms/{room}/seen       {"messageIds": [...]}
//   POST chat/rooms/{room}/system     {"text": ..., "files": [...]}
//   POST uploads?name=                raw bytes → {"url": ...}
//   GET  notices
//   POST notices/{id}/ack

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use reqwest::{RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use eventsync_common::types::{ChatMessage, HistoryPage, NoticeItem, NoticeSource};

use super::{Attachment, AttachmentUploader, ChatApi, CredentialProvider, LoadError, NoticeApi};
use crate::config::ApiConfig;

#[derive(Clone)]
pub struct HttpApi {
    base_url: Url,
    client: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
}

impl std::fmt::Debug for HttpApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpApi").field("base_url", &self.base_url.as_str()).finish()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SeenRequest<'a> {
    message_ids: &'a [String],
}

#[derive(Serialize)]
struct SystemRequest<'a> {
    text: &'a str,
    files: &'a [String],
}

#[derive(Deserialize)]
struct UploadResponse {
    url: String,
}

impl HttpApi {
    pub fn new(config: &ApiConfig, credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        let base = config.base_url.as_deref().ok_or_else(|| anyhow!("api.base_url is not configured"))?;
        let base_url = validate_base_url(base)?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("failed to build http client")?;
        Ok(Self { base_url, client, credentials })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow!("api base url `{}` cannot carry a path", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.credentials.credential() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn load(&self, builder: RequestBuilder) -> Result<Response, LoadError> {
        let response = self
            .authorized(builder)
            .send()
            .await
            .map_err(|error| LoadError::Network(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(LoadError::Status(status.as_u16()));
        }
        Ok(response)
    }

    async fn execute(&self, builder: RequestBuilder, what: &str) -> Result<Response> {
        let response = self.authorized(builder).send().await.with_context(|| format!("{what} request"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("{what} failed: status={status}"));
        }
        Ok(response)
    }
}

impl ChatApi for HttpApi {
    async fn fetch_history(
        &self,
        room_id: &str,
        before: Option<&str>,
        limit: u32,
    ) -> Result<HistoryPage, LoadError> {
        let mut url = self
            .endpoint(&["chat", "rooms", room_id, "messages"])
            .map_err(|error| LoadError::Network(format!("{error:#}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &limit.to_string());
            if let Some(cursor) = before {
                query.append_pair("before", cursor);
            }
        }
        debug!(room_id, before, limit, "fetching history page");
        let response = self.load(self.client.get(url)).await?;
        response.json::<HistoryPage>().await.map_err(|error| LoadError::Decode(error.to_string()))
    }

    async fn mark_seen(&self, room_id: &str, message_ids: &[String]) -> Result<()> {
        let url = self.endpoint(&["chat", "rooms", room_id, "seen"])?;
        let body = SeenRequest { message_ids };
        self.execute(self.client.post(url).json(&body), "mark seen").await?;
        Ok(())
    }

    async fn post_system(
        &self,
        room_id: &str,
        text: &str,
        files: &[String],
    ) -> Result<Option<ChatMessage>> {
        let url = self.endpoint(&["chat", "rooms", room_id, "system"])?;
        let body = SystemRequest { text, files };
        let response = self.execute(self.client.post(url).json(&body), "post system message").await?;
        let bytes = response.bytes().await.context("read system message response")?;
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(serde_json::from_slice::<ChatMessage>(&bytes).ok())
    }
}

impl NoticeApi for HttpApi {
    async fn list_notices(&self) -> Result<Vec<NoticeItem>, LoadError> {
        let url = self.endpoint(&["notices"]).map_err(|error| LoadError::Network(format!("{error:#}")))?;
        let response = self.load(self.client.get(url)).await?;
        let raw = response.json::<Vec<Value>>().await.map_err(|error| LoadError::Decode(error.to_string()))?;
        Ok(decode_notices(raw))
    }

    async fn acknowledge(&self, notice_id: &str) -> Result<()> {
        let url = self.endpoint(&["notices", notice_id, "ack"])?;
        self.execute(self.client.post(url), "acknowledge notice").await?;
        Ok(())
    }
}

impl AttachmentUploader for HttpApi {
    async fn upload(&self, attachment: &Attachment) -> Result<String> {
        let mut url = self.endpoint(&["uploads"])?;
        url.query_pairs_mut().append_pair("name", &attachment.name);
        let request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, attachment.content_type.as_str())
            .body(attachment.bytes.clone());
        let response = self.execute(request, "upload attachment").await?;
        let uploaded: UploadResponse = response.json().await.context("decode upload response")?;
        Ok(uploaded.url)
    }
}

/// Decode polled notices, forcing `source = server` and skipping entries
/// that fail to decode or carry no id.
pub fn decode_notices(raw: Vec<Value>) -> Vec<NoticeItem> {
    raw.into_iter()
        .filter_map(|mut value| {
            if let Value::Object(map) = &mut value {
                map.insert("source".to_string(), serde_json::json!("server"));
            }
            match serde_json::from_value::<NoticeItem>(value) {
                Ok(item) if item.source == NoticeSource::Server && item.validate().is_ok() => Some(item),
                Ok(item) => {
                    warn!(notice_id = %item.id, "dropping polled notice without a usable id");
                    None
                }
                Err(error) => {
                    warn!(error = %error, "dropping undecodable polled notice");
                    None
                }
            }
        })
        .collect()
}

fn validate_base_url(value: &str) -> Result<Url> {
    let parsed = Url::parse(value).map_err(|error| anyhow!("invalid api base_url `{value}`: {error}"))?;
    match parsed.scheme() {
        "https" => Ok(parsed),
        "http" if is_loopback_host(parsed.host_str()) => Ok(parsed),
        _ => Err(anyhow!("api base_url must use https (http is allowed only for localhost)")),
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.parse::<IpAddr>().is_ok_and(|addr| addr.is_loopback())
}
