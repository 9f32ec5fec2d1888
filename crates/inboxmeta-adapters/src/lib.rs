//! Mailbox provider contracts + Gmail and fixture-backed implementations.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use inboxmeta_core::{Credential, SenderLookup};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "inboxmeta-adapters";

pub const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

/// Gmail accepts at most this many ids per `batchModify` call.
pub const MAX_BATCH_MODIFY_IDS: usize = 1000;

pub const INBOX_LABEL: &str = "INBOX";
pub const TRASH_LABEL: &str = "TRASH";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from {endpoint}")]
    HttpStatus { status: u16, endpoint: String },
    #[error("malformed response from {endpoint}: {detail}")]
    Malformed { endpoint: String, detail: String },
    #[error("invalid api base url {0}")]
    InvalidBaseUrl(String),
    #[error("batch of {0} ids exceeds the per-call limit of {max}", max = MAX_BATCH_MODIFY_IDS)]
    BatchTooLarge(usize),
    #[error("{0}")]
    Message(String),
}

impl ProviderError {
    /// True when the provider rejected the credential itself.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Self::HttpStatus { status, .. }
                if *status == StatusCode::UNAUTHORIZED.as_u16()
                    || *status == StatusCode::FORBIDDEN.as_u16()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRequest {
    pub label_id: String,
    pub page_size: u32,
    pub page_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePage {
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchModifyRequest {
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add_label_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_label_ids: Vec<String>,
}

impl BatchModifyRequest {
    /// Moves the ids out of the inbox and into the trash.
    pub fn trash(ids: Vec<String>) -> Self {
        Self {
            ids,
            add_label_ids: vec![TRASH_LABEL.to_string()],
            remove_label_ids: vec![INBOX_LABEL.to_string()],
        }
    }

    pub fn validate(&self) -> Result<(), ProviderError> {
        if self.ids.len() > MAX_BATCH_MODIFY_IDS {
            return Err(ProviderError::BatchTooLarge(self.ids.len()));
        }
        Ok(())
    }
}

/// Remote mailbox operations used by the ingestion and purge pipelines.
///
/// `fetch_sender` is infallible by contract: every remote fault is reported as
/// [`SenderLookup::Absent`] so one bad message never aborts a bulk sync.
#[async_trait]
pub trait MailboxProvider: Send + Sync {
    fn provider_id(&self) -> &'static str;

    async fn list_message_ids(
        &self,
        credential: &Credential,
        request: &ListRequest,
    ) -> Result<MessagePage, ProviderError>;

    async fn fetch_sender(&self, credential: &Credential, message_id: &str) -> SenderLookup;

    async fn batch_modify(
        &self,
        credential: &Credential,
        request: &BatchModifyRequest,
    ) -> Result<(), ProviderError>;

    async fn profile_email(&self, credential: &Credential) -> Result<String, ProviderError>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    /// Per-request timeout. `None` leaves requests unbounded.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMessagesResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MessageMetadata {
    #[serde(default)]
    payload: Option<MetadataPayload>,
}

#[derive(Debug, Deserialize)]
struct MetadataPayload {
    #[serde(default)]
    headers: Vec<MetadataHeader>,
}

#[derive(Debug, Deserialize)]
struct MetadataHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    email_address: Option<String>,
}

fn sender_from_metadata(metadata: &MessageMetadata) -> SenderLookup {
    let value = metadata.payload.as_ref().and_then(|payload| {
        payload
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("from"))
            .map(|h| h.value.as_str())
    });
    SenderLookup::from_header(value)
}

/// Gmail REST v1 client. One instance is shared by all fetch workers; each
/// request carries its own bearer header built from the credential it is given.
#[derive(Debug, Clone)]
pub struct GmailProvider {
    client: reqwest::Client,
    base: Url,
}

impl GmailProvider {
    pub fn new(config: HttpClientConfig) -> Result<Self, ProviderError> {
        Self::with_base_url(GMAIL_API_BASE, config)
    }

    pub fn with_base_url(base_url: &str, config: HttpClientConfig) -> Result<Self, ProviderError> {
        let base = Url::parse(base_url)
            .map_err(|_| ProviderError::InvalidBaseUrl(base_url.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(ProviderError::InvalidBaseUrl(base_url.to_string()));
        }

        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            base,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        credential: &Credential,
        url: Url,
        query: &[(&str, &str)],
    ) -> Result<T, ProviderError> {
        let resp = self
            .client
            .get(url.clone())
            .bearer_auth(&credential.token)
            .query(query)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ProviderError::HttpStatus {
                status: status.as_u16(),
                endpoint: url.path().to_string(),
            });
        }

        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|err| ProviderError::Malformed {
            endpoint: url.path().to_string(),
            detail: err.to_string(),
        })
    }

    async fn try_fetch_sender(
        &self,
        credential: &Credential,
        message_id: &str,
    ) -> Result<SenderLookup, ProviderError> {
        let url = self.endpoint(&["users", "me", "messages", message_id]);
        let metadata: MessageMetadata = self
            .get_json(
                credential,
                url,
                &[("format", "metadata"), ("metadataHeaders", "From")],
            )
            .await?;
        Ok(sender_from_metadata(&metadata))
    }
}

#[async_trait]
impl MailboxProvider for GmailProvider {
    fn provider_id(&self) -> &'static str {
        "gmail"
    }

    async fn list_message_ids(
        &self,
        credential: &Credential,
        request: &ListRequest,
    ) -> Result<MessagePage, ProviderError> {
        let url = self.endpoint(&["users", "me", "messages"]);
        let page_size = request.page_size.to_string();
        let mut query = vec![
            ("labelIds", request.label_id.as_str()),
            ("maxResults", page_size.as_str()),
        ];
        if let Some(token) = &request.page_token {
            query.push(("pageToken", token.as_str()));
        }

        let resp: ListMessagesResponse = self.get_json(credential, url, &query).await?;
        Ok(MessagePage {
            ids: resp.messages.into_iter().map(|m| m.id).collect(),
            next_page_token: resp.next_page_token.filter(|t| !t.is_empty()),
        })
    }

    async fn fetch_sender(&self, credential: &Credential, message_id: &str) -> SenderLookup {
        match self.try_fetch_sender(credential, message_id).await {
            Ok(lookup) => {
                if lookup == SenderLookup::Absent {
                    debug!(message_id, "message has no From header");
                }
                lookup
            }
            Err(err) => {
                debug!(message_id, error = %err, "metadata fetch failed");
                SenderLookup::Absent
            }
        }
    }

    async fn batch_modify(
        &self,
        credential: &Credential,
        request: &BatchModifyRequest,
    ) -> Result<(), ProviderError> {
        request.validate()?;
        let url = self.endpoint(&["users", "me", "messages", "batchModify"]);
        let resp = self
            .client
            .post(url.clone())
            .bearer_auth(&credential.token)
            .json(request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ProviderError::HttpStatus {
                status: status.as_u16(),
                endpoint: url.path().to_string(),
            });
        }
        Ok(())
    }

    async fn profile_email(&self, credential: &Credential) -> Result<String, ProviderError> {
        let url = self.endpoint(&["users", "me", "profile"]);
        let endpoint = url.path().to_string();
        let profile: ProfileResponse = self.get_json(credential, url, &[]).await?;
        profile
            .email_address
            .filter(|e| !e.is_empty())
            .ok_or_else(|| ProviderError::Malformed {
                endpoint,
                detail: "missing emailAddress".to_string(),
            })
    }
}

/// On-disk fixture describing a mailbox for offline runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureMailboxFile {
    pub email: String,
    /// Caps the page size the fixture hands out, to exercise pagination.
    #[serde(default)]
    pub page_size: Option<u32>,
    pub messages: Vec<FixtureMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureMessage {
    pub id: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default = "default_fixture_labels")]
    pub labels: BTreeSet<String>,
}

fn default_fixture_labels() -> BTreeSet<String> {
    BTreeSet::from([INBOX_LABEL.to_string()])
}

impl FixtureMessage {
    pub fn inbox(id: impl Into<String>, from: Option<&str>) -> Self {
        Self {
            id: id.into(),
            from: from.map(ToString::to_string),
            labels: default_fixture_labels(),
        }
    }
}

pub fn load_fixture_mailbox(path: impl AsRef<Path>) -> anyhow::Result<FixtureMailbox> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let file: FixtureMailboxFile =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    Ok(FixtureMailbox::new(file))
}

/// In-memory mailbox that behaves like the remote API for listing, metadata
/// fetch and label changes. Page tokens are message offsets.
#[derive(Debug)]
pub struct FixtureMailbox {
    email: String,
    page_size: Option<u32>,
    messages: Mutex<Vec<FixtureMessage>>,
}

impl FixtureMailbox {
    pub fn new(file: FixtureMailboxFile) -> Self {
        Self {
            email: file.email,
            page_size: file.page_size,
            messages: Mutex::new(file.messages),
        }
    }

    pub fn from_messages(email: impl Into<String>, messages: Vec<FixtureMessage>) -> Self {
        Self::new(FixtureMailboxFile {
            email: email.into(),
            page_size: None,
            messages,
        })
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn labels_of(&self, id: &str) -> Option<BTreeSet<String>> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|m| m.id == id)
            .map(|m| m.labels.clone())
    }
}

#[async_trait]
impl MailboxProvider for FixtureMailbox {
    fn provider_id(&self) -> &'static str {
        "fixture"
    }

    async fn list_message_ids(
        &self,
        _credential: &Credential,
        request: &ListRequest,
    ) -> Result<MessagePage, ProviderError> {
        let offset = match &request.page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| ProviderError::Message(format!("invalid page token {token}")))?,
            None => 0,
        };
        let page_size = self
            .page_size
            .map_or(request.page_size, |cap| cap.min(request.page_size))
            .max(1) as usize;

        let messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        let matching = messages
            .iter()
            .filter(|m| m.labels.contains(&request.label_id))
            .collect::<Vec<_>>();
        let ids = matching
            .iter()
            .skip(offset)
            .take(page_size)
            .map(|m| m.id.clone())
            .collect::<Vec<_>>();
        let next = offset + ids.len();
        let next_page_token = (next < matching.len()).then(|| next.to_string());

        Ok(MessagePage {
            ids,
            next_page_token,
        })
    }

    async fn fetch_sender(&self, _credential: &Credential, message_id: &str) -> SenderLookup {
        let messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        let from = messages
            .iter()
            .find(|m| m.id == message_id)
            .and_then(|m| m.from.as_deref());
        SenderLookup::from_header(from)
    }

    async fn batch_modify(
        &self,
        _credential: &Credential,
        request: &BatchModifyRequest,
    ) -> Result<(), ProviderError> {
        request.validate()?;
        let mut messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        for message in messages.iter_mut().filter(|m| request.ids.contains(&m.id)) {
            for label in &request.remove_label_ids {
                message.labels.remove(label);
            }
            message.labels.extend(request.add_label_ids.iter().cloned());
        }
        Ok(())
    }

    async fn profile_email(&self, _credential: &Credential) -> Result<String, ProviderError> {
        Ok(self.email.clone())
    }
}
