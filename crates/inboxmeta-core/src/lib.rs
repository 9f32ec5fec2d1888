//! Core domain model shared by the inboxmeta crates.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "inboxmeta-core";

/// One ingested message: provider-assigned id plus the raw `From` header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub sender: String,
}

impl MessageRecord {
    pub fn new(id: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sender: sender.into(),
        }
    }
}

/// Per-sender message count, computed at query time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderAggregate {
    pub sender: String,
    pub count: u64,
}

/// Outcome of a single metadata fetch. Absence is a normal result, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderLookup {
    Found(String),
    Absent,
}

impl SenderLookup {
    /// Treats an empty header value the same as a missing one.
    pub fn from_header(value: Option<&str>) -> Self {
        match value {
            Some(v) if !v.is_empty() => Self::Found(v.to_string()),
            _ => Self::Absent,
        }
    }

    pub fn into_record(self, message_id: impl Into<String>) -> Option<MessageRecord> {
        match self {
            Self::Found(sender) => Some(MessageRecord::new(message_id, sender)),
            Self::Absent => None,
        }
    }
}

/// OAuth token bundle handed to providers. Never persisted by the core.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl Credential {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            refresh_token: None,
            token_uri: None,
            client_id: None,
            client_secret: None,
            scopes: Vec::new(),
        }
    }

    pub fn is_usable(&self) -> bool {
        !self.token.trim().is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("token_uri", &self.token_uri)
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Result of one ingestion run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Ids collected by the listing stage.
    pub processed: usize,
    /// Ids whose sender could be fetched.
    pub fetched: usize,
    /// Rows that were new to the store.
    pub inserted: u64,
    pub elapsed_s: f64,
}

/// Result of one delete-by-sender run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurgeSummary {
    pub sender: String,
    pub matched: usize,
    pub deleted: u64,
    pub chunks: usize,
}
