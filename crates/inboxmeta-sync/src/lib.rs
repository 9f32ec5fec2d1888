//! Ingestion and purge pipelines plus the layered runtime configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use inboxmeta_adapters::{
    load_fixture_mailbox, BatchModifyRequest, GmailProvider, HttpClientConfig, ListRequest,
    MailboxProvider, ProviderError, GMAIL_API_BASE, INBOX_LABEL, MAX_BATCH_MODIFY_IDS,
    TRASH_LABEL,
};
use inboxmeta_core::{Credential, MessageRecord, PurgeSummary, SenderAggregate, SyncSummary};
use inboxmeta_storage::{MetadataStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "inboxmeta-sync";

const DEFAULT_CONFIG_FILE: &str = "inboxmeta.yaml";
const PROGRESS_EVERY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub max_messages: usize,
    pub fetch_workers: usize,
    pub page_size: u32,
    pub label: String,
    pub mutation_chunk_size: usize,
    pub top_senders_limit: usize,
    pub credentials_path: PathBuf,
    pub api_base_url: String,
    pub http_timeout_secs: Option<u64>,
    pub user_agent: String,
    pub mailbox_fixture: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub web_port: u16,
    /// Browser origin allowed to call the HTTP surface with cookies. `None`
    /// disables cross-origin access.
    pub frontend_origin: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("emailmeta.db"),
            max_messages: 1000,
            fetch_workers: 10,
            page_size: 500,
            label: INBOX_LABEL.to_string(),
            mutation_chunk_size: MAX_BATCH_MODIFY_IDS,
            top_senders_limit: 10,
            credentials_path: PathBuf::from("credentials.json"),
            api_base_url: GMAIL_API_BASE.to_string(),
            http_timeout_secs: None,
            user_agent: "inboxmeta/0.1".to_string(),
            mailbox_fixture: None,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            web_port: 5000,
            frontend_origin: Some("http://localhost:5173".to_string()),
        }
    }
}

impl SyncConfig {
    /// Defaults, then the YAML file named by `INBOXMETA_CONFIG` (or
    /// `./inboxmeta.yaml` when present), then environment variables.
    pub fn from_env() -> Result<Self> {
        Self::load(|key| std::env::var(key).ok())
    }

    pub fn load(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match lookup("INBOXMETA_CONFIG") {
            Some(path) => Self::from_yaml_file(Path::new(&path))?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_yaml_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("EMAIL_DB") {
            self.database_path = PathBuf::from(v);
        }
        if let Some(v) = parse_var(lookup, "MAX_GMAIL_MESSAGES")? {
            self.max_messages = v;
        }
        if let Some(v) = parse_var(lookup, "MAX_GMAIL_THREADS")? {
            self.fetch_workers = v;
        }
        if let Some(v) = parse_var(lookup, "INBOXMETA_PAGE_SIZE")? {
            self.page_size = v;
        }
        if let Some(v) = lookup("INBOXMETA_LABEL") {
            self.label = v;
        }
        if let Some(v) = parse_var(lookup, "INBOXMETA_CHUNK_SIZE")? {
            self.mutation_chunk_size = v;
        }
        if let Some(v) = parse_var(lookup, "INBOXMETA_TOP_SENDERS")? {
            self.top_senders_limit = v;
        }
        if let Some(v) = lookup("INBOXMETA_CREDENTIALS") {
            self.credentials_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("INBOXMETA_API_BASE") {
            self.api_base_url = v;
        }
        if let Some(v) = parse_var(lookup, "INBOXMETA_HTTP_TIMEOUT_SECS")? {
            self.http_timeout_secs = Some(v);
        }
        if let Some(v) = lookup("INBOXMETA_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = lookup("INBOXMETA_FIXTURE") {
            self.mailbox_fixture = Some(PathBuf::from(v));
        }
        if let Some(v) = parse_flag(lookup, "INBOXMETA_SCHEDULER_ENABLED")? {
            self.scheduler_enabled = v;
        }
        if let Some(v) = lookup("INBOXMETA_SYNC_CRON") {
            self.sync_cron = v;
        }
        if let Some(v) = parse_var(lookup, "INBOXMETA_WEB_PORT")? {
            self.web_port = v;
        }
        if let Some(v) = lookup("FRONTEND_URL") {
            let v = v.trim().trim_end_matches('/');
            self.frontend_origin = (!v.is_empty()).then(|| v.to_string());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_messages == 0 {
            bail!("max_messages must be at least 1");
        }
        if self.fetch_workers == 0 {
            bail!("fetch_workers must be at least 1");
        }
        if self.page_size == 0 {
            bail!("page_size must be at least 1");
        }
        if self.mutation_chunk_size == 0 || self.mutation_chunk_size > MAX_BATCH_MODIFY_IDS {
            bail!(
                "mutation_chunk_size must be between 1 and {MAX_BATCH_MODIFY_IDS}, got {}",
                self.mutation_chunk_size
            );
        }
        if self.label.trim().is_empty() {
            bail!("label must not be empty");
        }
        if let Some(origin) = &self.frontend_origin {
            let scheme_ok = origin.starts_with("http://") || origin.starts_with("https://");
            if !scheme_ok || origin.chars().any(|c| c.is_whitespace() || c.is_control()) {
                bail!("frontend_origin must be an http(s) origin, got {origin:?}");
            }
        }
        Ok(())
    }

    pub fn ingest_options(&self) -> IngestOptions {
        IngestOptions {
            label: self.label.clone(),
            page_size: self.page_size,
            max_messages: self.max_messages,
            fetch_workers: self.fetch_workers,
        }
    }

    pub fn purge_options(&self) -> PurgeOptions {
        PurgeOptions {
            chunk_size: self.mutation_chunk_size,
            ..PurgeOptions::default()
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout_secs.map(Duration::from_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow!("invalid value {raw:?} for {key}: {err}")),
        None => Ok(None),
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => bail!("invalid value {raw:?} for {key}: expected true or false"),
    }
}

/// Reads a JSON token bundle written by the authorization collaborator.
pub fn load_credential(path: &Path) -> Result<Credential> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading credentials {}", path.display()))?;
    let credential: Credential = serde_json::from_str(&text)
        .with_context(|| format!("parsing credentials {}", path.display()))?;
    if !credential.is_usable() {
        bail!("credentials {} carry an empty token", path.display());
    }
    Ok(credential)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Listing,
    Fetching,
    Persisting,
    Done,
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Listing => "listing",
            Self::Fetching => "fetching",
            Self::Persisting => "persisting",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOptions {
    pub label: String,
    pub page_size: u32,
    pub max_messages: usize,
    /// Upper bound on concurrent metadata fetches.
    pub fetch_workers: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        SyncConfig::default().ingest_options()
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no usable credential")]
    MissingCredential,
    #[error("listing label {label} failed: {source}")]
    Listing {
        label: String,
        #[source]
        source: ProviderError,
    },
    #[error("persisting {records} records failed: {source}")]
    Persist {
        records: usize,
        #[source]
        source: StoreError,
    },
}

impl IngestError {
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Self::MissingCredential => true,
            Self::Listing { source, .. } => source.is_unauthorized(),
            Self::Persist { .. } => false,
        }
    }
}

/// Bounded fetch of sender metadata for a capped prefix of one label.
///
/// Listing failures abort the run before anything is written. Individual
/// fetch failures only drop that message. All fetched records are committed in
/// a single store transaction once every worker has finished.
pub struct IngestionPipeline {
    provider: Arc<dyn MailboxProvider>,
    store: MetadataStore,
    options: IngestOptions,
}

impl IngestionPipeline {
    pub fn new(
        provider: Arc<dyn MailboxProvider>,
        store: MetadataStore,
        options: IngestOptions,
    ) -> Self {
        Self {
            provider,
            store,
            options,
        }
    }

    pub async fn run(&self, credential: Arc<Credential>) -> Result<SyncSummary, IngestError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest", %run_id, provider = self.provider.provider_id());
        self.run_inner(run_id, credential).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        credential: Arc<Credential>,
    ) -> Result<SyncSummary, IngestError> {
        if !credential.is_usable() {
            return Err(IngestError::MissingCredential);
        }
        let started_at = Utc::now();
        let clock = Instant::now();

        info!(
            stage = %IngestStage::Listing,
            max_messages = self.options.max_messages,
            workers = self.options.fetch_workers,
            "sync started"
        );
        let ids = self
            .list_ids(&credential)
            .await
            .map_err(|source| IngestError::Listing {
                label: self.options.label.clone(),
                source,
            })?;
        info!(stage = %IngestStage::Fetching, ids = ids.len(), "collected message ids");

        let records = self.fetch_all(credential, &ids).await;
        info!(
            stage = %IngestStage::Persisting,
            fetched = records.len(),
            skipped = ids.len() - records.len(),
            "fetch complete"
        );

        let inserted = self
            .store
            .bulk_insert(&records)
            .await
            .map_err(|source| IngestError::Persist {
                records: records.len(),
                source,
            })?;

        let elapsed_s = clock.elapsed().as_secs_f64();
        info!(stage = %IngestStage::Done, inserted, elapsed_s, "sync finished");

        Ok(SyncSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            processed: ids.len(),
            fetched: records.len(),
            inserted,
            elapsed_s,
        })
    }

    async fn list_ids(&self, credential: &Credential) -> Result<Vec<String>, ProviderError> {
        let max = self.options.max_messages;
        let mut ids = Vec::new();
        let mut page_token = None;

        while ids.len() < max {
            let request = ListRequest {
                label_id: self.options.label.clone(),
                page_size: self.options.page_size,
                page_token: page_token.take(),
            };
            let page = self.provider.list_message_ids(credential, &request).await?;
            ids.extend(page.ids);
            debug!(collected = ids.len(), "listed page");

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        ids.truncate(max);
        Ok(ids)
    }

    async fn fetch_all(&self, credential: Arc<Credential>, ids: &[String]) -> Vec<MessageRecord> {
        let permits = Arc::new(Semaphore::new(self.options.fetch_workers.max(1)));
        let mut workers = JoinSet::new();

        for id in ids {
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .expect("fetch semaphore is never closed");
            let provider = Arc::clone(&self.provider);
            let credential = Arc::clone(&credential);
            let id = id.clone();
            workers.spawn(
                async move {
                    let lookup = provider.fetch_sender(&credential, &id).await;
                    drop(permit);
                    lookup.into_record(id)
                }
                .in_current_span(),
            );
        }

        let mut records = Vec::with_capacity(ids.len());
        let mut completed = 0usize;
        while let Some(joined) = workers.join_next().await {
            completed += 1;
            match joined {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "fetch worker failed; message skipped"),
            }
            if completed % PROGRESS_EVERY == 0 {
                debug!(completed, total = ids.len(), "fetch progress");
            }
        }
        records
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeOptions {
    pub chunk_size: usize,
    pub add_label_ids: Vec<String>,
    pub remove_label_ids: Vec<String>,
}

impl Default for PurgeOptions {
    fn default() -> Self {
        Self {
            chunk_size: MAX_BATCH_MODIFY_IDS,
            add_label_ids: vec![TRASH_LABEL.to_string()],
            remove_label_ids: vec![INBOX_LABEL.to_string()],
        }
    }
}

#[derive(Debug, Error)]
pub enum PurgeError {
    #[error("sender is required")]
    MissingSender,
    #[error("no usable credential")]
    MissingCredential,
    #[error("store lookup failed: {0}")]
    Lookup(#[source] StoreError),
    #[error("remote change for chunk {chunk} failed after {deleted} deletions: {source}")]
    Remote {
        chunk: usize,
        deleted: u64,
        #[source]
        source: ProviderError,
    },
    #[error("local delete for chunk {chunk} failed after {deleted} deletions: {source}")]
    Store {
        chunk: usize,
        deleted: u64,
        #[source]
        source: StoreError,
    },
}

impl PurgeError {
    /// Rows already removed before the failure.
    pub fn deleted(&self) -> u64 {
        match self {
            Self::Remote { deleted, .. } | Self::Store { deleted, .. } => *deleted,
            _ => 0,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        match self {
            Self::MissingCredential => true,
            Self::Remote { source, .. } => source.is_unauthorized(),
            _ => false,
        }
    }
}

/// Moves every stored message of one sender out of the inbox remotely, then
/// drops those rows locally.
///
/// A chunk's rows are deleted only after its remote call succeeded. The first
/// failing chunk stops the run; earlier chunks stay deleted.
pub struct SenderPurge {
    provider: Arc<dyn MailboxProvider>,
    store: MetadataStore,
    options: PurgeOptions,
}

impl SenderPurge {
    pub fn new(
        provider: Arc<dyn MailboxProvider>,
        store: MetadataStore,
        options: PurgeOptions,
    ) -> Self {
        Self {
            provider,
            store,
            options,
        }
    }

    pub async fn run(&self, credential: &Credential, sender: &str) -> Result<PurgeSummary, PurgeError> {
        if sender.trim().is_empty() {
            return Err(PurgeError::MissingSender);
        }
        if !credential.is_usable() {
            return Err(PurgeError::MissingCredential);
        }

        let ids = self
            .store
            .ids_for_sender(sender)
            .await
            .map_err(PurgeError::Lookup)?;
        if ids.is_empty() {
            info!(sender, "no stored messages for sender");
            return Ok(PurgeSummary {
                sender: sender.to_string(),
                matched: 0,
                deleted: 0,
                chunks: 0,
            });
        }

        let chunk_size = self.options.chunk_size.clamp(1, MAX_BATCH_MODIFY_IDS);
        info!(sender, matched = ids.len(), chunk_size, "purging sender");

        let mut deleted = 0u64;
        let mut chunks = 0usize;
        for (chunk, chunk_ids) in ids.chunks(chunk_size).enumerate() {
            let request = BatchModifyRequest {
                ids: chunk_ids.to_vec(),
                add_label_ids: self.options.add_label_ids.clone(),
                remove_label_ids: self.options.remove_label_ids.clone(),
            };
            if let Err(source) = self.provider.batch_modify(credential, &request).await {
                error!(sender, chunk, deleted, error = %source, "remote batch change failed; stopping");
                return Err(PurgeError::Remote {
                    chunk,
                    deleted,
                    source,
                });
            }

            let removed = self
                .store
                .delete_by_ids(chunk_ids)
                .await
                .map_err(|source| PurgeError::Store {
                    chunk,
                    deleted,
                    source,
                })?;
            deleted += removed;
            chunks += 1;
            debug!(sender, chunk, deleted, "chunk applied");
        }

        info!(sender, deleted, chunks, "purge finished");
        Ok(PurgeSummary {
            sender: sender.to_string(),
            matched: ids.len(),
            deleted,
            chunks,
        })
    }
}

/// Wires the configured provider and store together for the CLI and web layer.
#[derive(Clone)]
pub struct InboxSync {
    config: Arc<SyncConfig>,
    provider: Arc<dyn MailboxProvider>,
    store: MetadataStore,
}

impl InboxSync {
    pub fn new(config: SyncConfig, provider: Arc<dyn MailboxProvider>, store: MetadataStore) -> Self {
        Self {
            config: Arc::new(config),
            provider,
            store,
        }
    }

    /// Opens and initializes the store, then picks the fixture mailbox when one
    /// is configured and the Gmail client otherwise.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let provider: Arc<dyn MailboxProvider> = match &config.mailbox_fixture {
            Some(path) => Arc::new(load_fixture_mailbox(path)?),
            None => Arc::new(
                GmailProvider::with_base_url(&config.api_base_url, config.http_client_config())
                    .context("building gmail client")?,
            ),
        };
        let store = MetadataStore::open_initialized(config.database_path.clone())
            .await
            .context("opening metadata store")?;
        info!(
            provider = provider.provider_id(),
            db = %config.database_path.display(),
            "inbox sync ready"
        );
        Ok(Self::new(config, provider, store))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn provider(&self) -> Arc<dyn MailboxProvider> {
        Arc::clone(&self.provider)
    }

    pub fn ingestion(&self) -> IngestionPipeline {
        IngestionPipeline::new(self.provider(), self.store.clone(), self.config.ingest_options())
    }

    pub fn purge(&self) -> SenderPurge {
        SenderPurge::new(self.provider(), self.store.clone(), self.config.purge_options())
    }

    pub async fn run_sync(&self, credential: Arc<Credential>) -> Result<SyncSummary, IngestError> {
        self.ingestion().run(credential).await
    }

    pub async fn delete_sender(
        &self,
        credential: &Credential,
        sender: &str,
    ) -> Result<PurgeSummary, PurgeError> {
        self.purge().run(credential, sender).await
    }

    pub async fn top_senders(&self) -> Result<Vec<SenderAggregate>, StoreError> {
        self.store.top_senders(self.config.top_senders_limit).await
    }

    pub fn load_credential(&self) -> Result<Credential> {
        load_credential(&self.config.credentials_path)
    }

    /// Cron-driven fresh sync. Each trigger rereads the credentials file so an
    /// external refresher can rotate the token between runs.
    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let sync = self.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let sync = sync.clone();
            Box::pin(async move {
                let credential = match sync.load_credential() {
                    Ok(credential) => Arc::new(credential),
                    Err(err) => {
                        warn!(error = %err, "scheduled sync skipped: no credential");
                        return;
                    }
                };
                match sync.run_sync(credential).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        processed = summary.processed,
                        inserted = summary.inserted,
                        "scheduled sync complete"
                    ),
                    Err(err) => error!(error = %err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncSummary> {
    let config = SyncConfig::from_env()?;
    let sync = InboxSync::from_config(config).await?;
    let credential = Arc::new(sync.load_credential()?);
    Ok(sync.run_sync(credential).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use inboxmeta_adapters::{FixtureMailbox, FixtureMessage, MessagePage};
    use inboxmeta_core::SenderLookup;
    use tempfile::{tempdir, TempDir};

    /// Fixture mailbox with call accounting and failure injection.
    struct InstrumentedMailbox {
        inner: FixtureMailbox,
        fetch_delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        list_calls: AtomicUsize,
        batch_calls: AtomicUsize,
        fail_listing_on_call: Option<usize>,
        fail_batch_on_call: Option<usize>,
        /// Serve an empty first page that still carries a cursor.
        leading_empty_page: bool,
    }

    impl InstrumentedMailbox {
        fn new(messages: Vec<FixtureMessage>) -> Self {
            Self {
                inner: FixtureMailbox::from_messages("me@example.com", messages),
                fetch_delay: Duration::ZERO,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                list_calls: AtomicUsize::new(0),
                batch_calls: AtomicUsize::new(0),
                fail_listing_on_call: None,
                fail_batch_on_call: None,
                leading_empty_page: false,
            }
        }

        fn with_page_size(mut self, page_size: u32) -> Self {
            self.inner = self.inner.with_page_size(page_size);
            self
        }
    }

    #[async_trait]
    impl MailboxProvider for InstrumentedMailbox {
        fn provider_id(&self) -> &'static str {
            "instrumented"
        }

        async fn list_message_ids(
            &self,
            credential: &Credential,
            request: &ListRequest,
        ) -> Result<MessagePage, ProviderError> {
            let call = self.list_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_listing_on_call == Some(call) {
                return Err(ProviderError::HttpStatus {
                    status: 503,
                    endpoint: "/users/me/messages".into(),
                });
            }
            if self.leading_empty_page && request.page_token.is_none() {
                return Ok(MessagePage {
                    ids: Vec::new(),
                    next_page_token: Some("0".to_string()),
                });
            }
            self.inner.list_message_ids(credential, request).await
        }

        async fn fetch_sender(&self, credential: &Credential, message_id: &str) -> SenderLookup {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.fetch_delay.is_zero() {
                tokio::time::sleep(self.fetch_delay).await;
            }
            let lookup = self.inner.fetch_sender(credential, message_id).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            lookup
        }

        async fn batch_modify(
            &self,
            credential: &Credential,
            request: &BatchModifyRequest,
        ) -> Result<(), ProviderError> {
            let call = self.batch_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_batch_on_call == Some(call) {
                return Err(ProviderError::HttpStatus {
                    status: 500,
                    endpoint: "/users/me/messages/batchModify".into(),
                });
            }
            self.inner.batch_modify(credential, request).await
        }

        async fn profile_email(&self, credential: &Credential) -> Result<String, ProviderError> {
            self.inner.profile_email(credential).await
        }
    }

    fn cred() -> Arc<Credential> {
        Arc::new(Credential::bearer("test-token"))
    }

    fn msg(id: &str, from: &str) -> FixtureMessage {
        FixtureMessage::inbox(id, Some(from))
    }

    fn scenario_messages() -> Vec<FixtureMessage> {
        vec![msg("m1", "a@x"), msg("m2", "a@x"), msg("m3", "b@x")]
    }

    async fn store_in(dir: &TempDir) -> MetadataStore {
        MetadataStore::open_initialized(dir.path().join("meta.db"))
            .await
            .expect("open store")
    }

    fn options(max_messages: usize, fetch_workers: usize) -> IngestOptions {
        IngestOptions {
            max_messages,
            fetch_workers,
            ..IngestOptions::default()
        }
    }

    fn pairs(aggregates: Vec<SenderAggregate>) -> Vec<(String, u64)> {
        aggregates.into_iter().map(|a| (a.sender, a.count)).collect()
    }

    #[tokio::test]
    async fn ingest_then_query_top_senders() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(&dir).await;
        let provider = Arc::new(InstrumentedMailbox::new(scenario_messages()));
        let pipeline = IngestionPipeline::new(provider, store.clone(), options(1000, 10));

        let summary = pipeline.run(cred()).await.expect("sync");
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.inserted, 3);
        assert!(summary.elapsed_s >= 0.0);

        let top = store.top_senders(10).await.expect("top");
        assert_eq!(
            pairs(top),
            vec![("a@x".to_string(), 2), ("b@x".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn rerun_inserts_nothing_new() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(&dir).await;
        let provider = Arc::new(InstrumentedMailbox::new(scenario_messages()));
        let pipeline = IngestionPipeline::new(provider, store.clone(), options(1000, 10));

        pipeline.run(cred()).await.expect("first sync");
        let second = pipeline.run(cred()).await.expect("second sync");
        assert_eq!(second.processed, 3);
        assert_eq!(second.inserted, 0);
        assert_eq!(store.count().await.expect("count"), 3);
    }

    #[tokio::test]
    async fn listing_stops_at_max_and_truncates() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(&dir).await;
        let messages = (1..=7).map(|i| msg(&format!("m{i}"), "a@x")).collect();
        let provider = Arc::new(InstrumentedMailbox::new(messages).with_page_size(3));
        let pipeline = IngestionPipeline::new(provider.clone(), store.clone(), options(5, 2));

        let summary = pipeline.run(cred()).await.expect("sync");
        assert_eq!(summary.processed, 5);
        assert_eq!(provider.list_calls.load(Ordering::SeqCst), 2);
        assert!(store.contains("m5").await.expect("contains"));
        assert!(!store.contains("m6").await.expect("contains"));
    }

    #[tokio::test]
    async fn empty_page_with_cursor_keeps_listing() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(&dir).await;
        let mut mailbox = InstrumentedMailbox::new(vec![msg("m1", "a@x"), msg("m2", "b@x")]);
        mailbox.leading_empty_page = true;
        let provider = Arc::new(mailbox);
        let pipeline = IngestionPipeline::new(provider.clone(), store.clone(), options(1000, 2));

        let summary = pipeline.run(cred()).await.expect("sync");
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.inserted, 2);
        assert_eq!(provider.list_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn absent_senders_are_skipped_not_fatal() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(&dir).await;
        let provider = Arc::new(InstrumentedMailbox::new(vec![
            msg("m1", "a@x"),
            FixtureMessage::inbox("m2", None),
            msg("m3", ""),
            msg("m4", "b@x"),
        ]));
        let pipeline = IngestionPipeline::new(provider, store.clone(), options(1000, 3));

        let summary = pipeline.run(cred()).await.expect("sync");
        assert_eq!(summary.processed, 4);
        assert_eq!(summary.fetched, 2);
        assert_eq!(summary.inserted, 2);
        assert!(!store.contains("m2").await.expect("contains"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fetch_concurrency_never_exceeds_worker_budget() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(&dir).await;
        let messages = (0..40).map(|i| msg(&format!("m{i}"), "a@x")).collect();
        let mut mailbox = InstrumentedMailbox::new(messages);
        mailbox.fetch_delay = Duration::from_millis(20);
        let provider = Arc::new(mailbox);
        let pipeline = IngestionPipeline::new(provider.clone(), store.clone(), options(1000, 4));

        let summary = pipeline.run(cred()).await.expect("sync");
        assert_eq!(summary.inserted, 40);
        let peak = provider.max_in_flight.load(Ordering::SeqCst);
        assert!(peak <= 4, "peak in-flight fetches was {peak}");
        assert!(peak >= 2, "workers never overlapped (peak {peak})");
        assert_eq!(provider.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn listing_failure_fails_sync_without_writes() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(&dir).await;
        let mut mailbox = InstrumentedMailbox::new(scenario_messages()).with_page_size(1);
        mailbox.fail_listing_on_call = Some(2);
        let pipeline = IngestionPipeline::new(Arc::new(mailbox), store.clone(), options(1000, 2));

        let err = pipeline.run(cred()).await.expect_err("listing should fail");
        assert!(matches!(err, IngestError::Listing { .. }));
        assert_eq!(store.count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn blank_credential_is_rejected_before_listing() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(&dir).await;
        let provider = Arc::new(InstrumentedMailbox::new(scenario_messages()));
        let pipeline = IngestionPipeline::new(provider.clone(), store, options(1000, 2));

        let err = pipeline
            .run(Arc::new(Credential::bearer("")))
            .await
            .expect_err("no credential");
        assert!(err.is_unauthorized());
        assert_eq!(provider.list_calls.load(Ordering::SeqCst), 0);
    }

    async fn seeded(dir: &TempDir, records: &[(&str, &str)]) -> MetadataStore {
        let store = store_in(dir).await;
        let records = records
            .iter()
            .map(|(id, sender)| MessageRecord::new(*id, *sender))
            .collect::<Vec<_>>();
        store.bulk_insert(&records).await.expect("seed");
        store
    }

    fn purge_with(provider: Arc<InstrumentedMailbox>, store: MetadataStore, chunk_size: usize) -> SenderPurge {
        SenderPurge::new(
            provider,
            store,
            PurgeOptions {
                chunk_size,
                ..PurgeOptions::default()
            },
        )
    }

    #[tokio::test]
    async fn purge_removes_sender_after_remote_success() {
        let dir = tempdir().expect("tempdir");
        let store = seeded(&dir, &[("m1", "a@x"), ("m2", "a@x"), ("m3", "b@x")]).await;
        let provider = Arc::new(InstrumentedMailbox::new(scenario_messages()));
        let purge = purge_with(provider.clone(), store.clone(), 1000);

        let summary = purge.run(&cred(), "a@x").await.expect("purge");
        assert_eq!(summary.deleted, 2);
        assert_eq!(summary.chunks, 1);
        assert!(!store.contains("m1").await.expect("contains"));
        assert!(!store.contains("m2").await.expect("contains"));

        let top = pairs(store.top_senders(10).await.expect("top"));
        assert_eq!(top, vec![("b@x".to_string(), 1)]);

        let labels = provider.inner.labels_of("m1").expect("m1");
        assert!(labels.contains(TRASH_LABEL));
        assert!(!labels.contains(INBOX_LABEL));
    }

    #[tokio::test]
    async fn purge_keeps_rows_when_remote_fails() {
        let dir = tempdir().expect("tempdir");
        let store = seeded(&dir, &[("a", "s@x"), ("b", "s@x"), ("c", "s@x")]).await;
        let mut mailbox = InstrumentedMailbox::new(vec![msg("a", "s@x"), msg("b", "s@x"), msg("c", "s@x")]);
        mailbox.fail_batch_on_call = Some(1);
        let purge = purge_with(Arc::new(mailbox), store.clone(), 1000);

        let err = purge.run(&cred(), "s@x").await.expect_err("remote failure");
        assert!(matches!(err, PurgeError::Remote { chunk: 0, deleted: 0, .. }));
        assert_eq!(store.ids_for_sender("s@x").await.expect("ids"), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn purge_aborts_remaining_chunks_after_failure() {
        let dir = tempdir().expect("tempdir");
        let ids = ["m1", "m2", "m3", "m4", "m5"];
        let store = seeded(&dir, &ids.map(|id| (id, "s@x"))).await;
        let mut mailbox = InstrumentedMailbox::new(ids.iter().map(|id| msg(id, "s@x")).collect());
        mailbox.fail_batch_on_call = Some(2);
        let provider = Arc::new(mailbox);
        let purge = purge_with(provider.clone(), store.clone(), 2);

        let err = purge.run(&cred(), "s@x").await.expect_err("second chunk fails");
        assert_eq!(err.deleted(), 2);
        assert!(matches!(err, PurgeError::Remote { chunk: 1, .. }));
        assert_eq!(provider.batch_calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            store.ids_for_sender("s@x").await.expect("ids"),
            vec!["m3", "m4", "m5"]
        );
    }

    #[tokio::test]
    async fn purge_of_unknown_sender_makes_no_remote_call() {
        let dir = tempdir().expect("tempdir");
        let store = seeded(&dir, &[("m1", "a@x")]).await;
        let provider = Arc::new(InstrumentedMailbox::new(vec![msg("m1", "a@x")]));
        let purge = purge_with(provider.clone(), store.clone(), 1000);

        let summary = purge.run(&cred(), "A@X").await.expect("purge");
        assert_eq!(summary.deleted, 0);
        assert_eq!(summary.matched, 0);
        assert_eq!(provider.batch_calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn purge_rejects_blank_sender_before_any_access() {
        let dir = tempdir().expect("tempdir");
        let store = seeded(&dir, &[("m1", "a@x")]).await;
        let provider = Arc::new(InstrumentedMailbox::new(vec![msg("m1", "a@x")]));
        let purge = purge_with(provider.clone(), store, 1000);

        assert!(matches!(
            purge.run(&cred(), "   ").await,
            Err(PurgeError::MissingSender)
        ));
        assert_eq!(provider.batch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn purged_messages_are_not_listed_again() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(&dir).await;
        let provider = Arc::new(InstrumentedMailbox::new(scenario_messages()));
        let sync = InboxSync::new(SyncConfig::default(), provider, store.clone());

        sync.run_sync(cred()).await.expect("sync");
        sync.delete_sender(&cred(), "a@x").await.expect("purge");
        let again = sync.run_sync(cred()).await.expect("resync");

        assert_eq!(again.processed, 1);
        assert_eq!(again.inserted, 0);
        assert_eq!(
            pairs(sync.top_senders().await.expect("top")),
            vec![("b@x".to_string(), 1)]
        );
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_overrides_each_knob_independently() {
        let config = SyncConfig::load(env(&[
            ("MAX_GMAIL_MESSAGES", "250"),
            ("EMAIL_DB", "/tmp/other.db"),
        ]))
        .expect("config");
        assert_eq!(config.max_messages, 250);
        assert_eq!(config.database_path, PathBuf::from("/tmp/other.db"));
        assert_eq!(config.fetch_workers, SyncConfig::default().fetch_workers);
    }

    #[test]
    fn yaml_file_is_layered_under_env() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("inboxmeta.yaml");
        std::fs::write(&path, "fetch_workers: 3\nmax_messages: 50\nlabel: UPDATES\n").expect("write");

        let config = SyncConfig::load(env(&[
            ("INBOXMETA_CONFIG", path.to_str().expect("utf8 path")),
            ("MAX_GMAIL_MESSAGES", "75"),
        ]))
        .expect("config");
        assert_eq!(config.fetch_workers, 3);
        assert_eq!(config.max_messages, 75);
        assert_eq!(config.label, "UPDATES");
        assert_eq!(config.page_size, 500);
    }

    #[test]
    fn invalid_values_are_reported() {
        let err = SyncConfig::load(env(&[("MAX_GMAIL_THREADS", "many")])).expect_err("bad number");
        assert!(err.to_string().contains("MAX_GMAIL_THREADS"));

        assert!(SyncConfig::load(env(&[("MAX_GMAIL_THREADS", "0")])).is_err());
        assert!(SyncConfig::load(env(&[("INBOXMETA_CHUNK_SIZE", "1001")])).is_err());
        assert!(SyncConfig::from_yaml_str("unknown_knob: 1").is_err());
    }

    #[test]
    fn scheduler_flag_rejects_unknown_words() {
        for raw in ["true", "1", "Yes", "ON"] {
            let config = SyncConfig::load(env(&[("INBOXMETA_SCHEDULER_ENABLED", raw)])).expect("config");
            assert!(config.scheduler_enabled, "{raw}");
        }
        let config = SyncConfig::load(env(&[("INBOXMETA_SCHEDULER_ENABLED", "off")])).expect("config");
        assert!(!config.scheduler_enabled);

        let err = SyncConfig::load(env(&[("INBOXMETA_SCHEDULER_ENABLED", "enabeld")]))
            .expect_err("typo must not silently disable");
        assert!(err.to_string().contains("INBOXMETA_SCHEDULER_ENABLED"));
    }

    #[test]
    fn frontend_origin_comes_from_env() {
        assert_eq!(
            SyncConfig::default().frontend_origin.as_deref(),
            Some("http://localhost:5173")
        );
        let config = SyncConfig::load(env(&[("FRONTEND_URL", "https://app.example.com/")])).expect("config");
        assert_eq!(config.frontend_origin.as_deref(), Some("https://app.example.com"));

        let config = SyncConfig::load(env(&[("FRONTEND_URL", "")])).expect("config");
        assert_eq!(config.frontend_origin, None);

        assert!(SyncConfig::load(env(&[("FRONTEND_URL", "localhost:5173")])).is_err());
    }

    #[test]
    fn credential_file_must_carry_a_token() {
        let dir = tempdir().expect("tempdir");
        let good = dir.path().join("good.json");
        std::fs::write(&good, r#"{"token":"ya29.abc","scopes":["https://www.googleapis.com/auth/gmail.modify"]}"#)
            .expect("write");
        assert_eq!(load_credential(&good).expect("load").token, "ya29.abc");

        let empty = dir.path().join("empty.json");
        std::fs::write(&empty, r#"{"token":""}"#).expect("write");
        assert!(load_credential(&empty).is_err());
        assert!(load_credential(&dir.path().join("missing.json")).is_err());
    }

    #[tokio::test]
    async fn scheduler_is_off_by_default() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(&dir).await;
        let provider = Arc::new(InstrumentedMailbox::new(vec![]));
        let sync = InboxSync::new(SyncConfig::default(), provider, store);
        assert!(sync.maybe_build_scheduler().await.expect("scheduler").is_none());
    }
}
