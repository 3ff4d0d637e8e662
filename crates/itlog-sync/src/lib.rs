//! Sync orchestration: source registry, parallel fetch, sequential reconcile.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use itlog_adapters::{adapter_for_kind, NormalizedBatch, SourceKind};
use itlog_storage::{FixtureFetcher, HttpClientConfig, HttpFetcher, RecordFetcher, SqliteTicketStore, TicketStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod reconcile;

pub use reconcile::{clear_all, import_tickets, ImportReport, ReconcileOutcome, ReconcileTally, ReconciliationEngine};

pub const CRATE_NAME: &str = "itlog-sync";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Absolute endpoint; when omitted the source's default path under the
    /// upstream base URL is used.
    #[serde(default)]
    pub url: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl SourceConfig {
    pub fn for_kind(kind: SourceKind, base_url: &str) -> Self {
        Self {
            source_id: kind.source_id().to_string(),
            display_name: kind.display_name().to_string(),
            enabled: true,
            url: Some(join_url(base_url, kind.default_path())),
        }
    }

    pub fn kind(&self) -> Option<SourceKind> {
        SourceKind::from_source_id(&self.source_id)
    }
}

fn join_url(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

impl SourceRegistry {
    /// The three upstream collections under one base URL.
    pub fn defaults(base_url: &str) -> Self {
        Self {
            sources: SourceKind::ALL
                .into_iter()
                .map(|kind| SourceConfig::for_kind(kind, base_url))
                .collect(),
        }
    }

    pub fn from_yaml(text: &str, base_url: &str) -> Result<Self> {
        let mut registry: SourceRegistry = serde_yaml::from_str(text).context("parsing source registry")?;
        for source in &mut registry.sources {
            if source.url.is_none() {
                if let Some(kind) = source.kind() {
                    source.url = Some(join_url(base_url, kind.default_path()));
                }
            }
        }
        Ok(registry)
    }

    /// Reads `path`, falling back to [`SourceRegistry::defaults`] when it does not exist.
    pub async fn load(path: &Path, base_url: &str) -> Result<Self> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            info!(path = %path.display(), "no source registry file; using built-in sources");
            return Ok(Self::defaults(base_url));
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text, base_url).with_context(|| format!("loading {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub sources_file: PathBuf,
    pub upstream_base_url: String,
    pub fixtures_dir: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub source_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub web_port: u16,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://itlog.db?mode=rwc".to_string()),
            sources_file: std::env::var("ITLOG_SOURCES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sources.yaml")),
            upstream_base_url: std::env::var("ITLOG_UPSTREAM_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8092".to_string()),
            fixtures_dir: std::env::var("ITLOG_FIXTURES_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            http_timeout_secs: env_parse("ITLOG_HTTP_TIMEOUT_SECS", 20),
            source_timeout_secs: env_parse("ITLOG_SOURCE_TIMEOUT_SECS", 60),
            user_agent: std::env::var("ITLOG_USER_AGENT")
                .unwrap_or_else(|_| "itlog-sync/0.1".to_string()),
            scheduler_enabled: std::env::var("ITLOG_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("ITLOG_SYNC_CRON")
                .unwrap_or_else(|_| "0 */30 * * * *".to_string()),
            web_port: env_parse("ITLOG_WEB_PORT", 3000),
        }
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source_timeout_secs)
    }

    /// Fixture files when `fixtures_dir` is set, live HTTP otherwise.
    pub fn build_fetcher(&self) -> Result<Arc<dyn RecordFetcher>> {
        if let Some(dir) = &self.fixtures_dir {
            info!(dir = %dir.display(), "reading sources from fixtures");
            return Ok(Arc::new(FixtureFetcher::new(dir.clone())));
        }
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Arc::new(http))
    }

    pub async fn open_store(&self) -> Result<Arc<SqliteTicketStore>> {
        let store = SqliteTicketStore::connect(&self.database_url).await?;
        store.migrate().await.context("creating tickets schema")?;
        Ok(Arc::new(store))
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync run is already in progress")]
    AlreadyRunning,
    #[error("no adapter registered for source `{0}`")]
    UnknownSource(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Fetched,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source_id: String,
    pub status: SourceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Raw records received from upstream.
    pub records: usize,
    pub tally: ReconcileTally,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub trigger: SyncTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Tickets inserted or updated across all sources.
    pub total_records: usize,
    pub sources: Vec<SourceReport>,
}

impl SyncRunSummary {
    pub fn all_sources_fetched(&self) -> bool {
        self.sources.iter().all(|s| s.status == SourceStatus::Fetched)
    }

    pub fn tally(&self) -> ReconcileTally {
        let mut total = ReconcileTally::default();
        for source in &self.sources {
            total += source.tally;
        }
        total
    }
}

/// Body returned to sync triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SyncResponse {
    Completed {
        success: bool,
        total_records: usize,
        timestamp: DateTime<Utc>,
    },
    Failed {
        success: bool,
        message: String,
    },
}

impl SyncResponse {
    pub fn completed(summary: &SyncRunSummary) -> Self {
        SyncResponse::Completed {
            success: true,
            total_records: summary.total_records,
            timestamp: summary.finished_at,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        SyncResponse::Failed {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct PlannedSource {
    source_id: String,
    kind: SourceKind,
    url: String,
}

enum FetchOutcome {
    Fetched { records: usize, batch: NormalizedBatch },
    Failed(String),
    TimedOut,
}

pub struct SyncOrchestrator {
    sources: Vec<PlannedSource>,
    fetcher: Arc<dyn RecordFetcher>,
    engine: ReconciliationEngine,
    source_timeout: Duration,
    run_lock: Mutex<()>,
    /// Mirrors the run lock so status reads never contend for it.
    running: AtomicBool,
    last_synced_at: RwLock<Option<DateTime<Utc>>>,
}

/// Clears the running flag when a run ends, including when it is cancelled.
struct RunningFlag<'a>(&'a AtomicBool);

impl<'a> RunningFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncOrchestrator {
    pub fn new(
        registry: &SourceRegistry,
        fetcher: Arc<dyn RecordFetcher>,
        store: Arc<dyn TicketStore>,
        source_timeout: Duration,
    ) -> Result<Self, SyncError> {
        let sources = registry
            .enabled()
            .map(|source| -> Result<PlannedSource, SyncError> {
                let kind = source
                    .kind()
                    .ok_or_else(|| SyncError::UnknownSource(source.source_id.clone()))?;
                Ok(PlannedSource {
                    source_id: source.source_id.clone(),
                    kind,
                    url: source.url.clone().unwrap_or_default(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            sources,
            fetcher,
            engine: ReconciliationEngine::new(store),
            source_timeout,
            run_lock: Mutex::new(()),
            running: AtomicBool::new(false),
            last_synced_at: RwLock::new(None),
        })
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    pub fn source_ids(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.source_id.as_str()).collect()
    }

    pub async fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        *self.last_synced_at.read().await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// One full reconciliation run. Rejected with [`SyncError::AlreadyRunning`]
    /// when another run holds the lock.
    pub async fn run(&self, trigger: SyncTrigger) -> Result<SyncRunSummary, SyncError> {
        let _guard = self.run_lock.try_lock().map_err(|_| SyncError::AlreadyRunning)?;
        let _running = RunningFlag::raise(&self.running);

        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, ?trigger);
        async move {
            let started_at = Utc::now();
            info!(sources = self.sources.len(), "sync run started");

            let mut outcomes = self.fetch_all().await;
            let mut reports = Vec::with_capacity(self.sources.len());
            let mut total_records = 0usize;

            for (idx, source) in self.sources.iter().enumerate() {
                let outcome = outcomes[idx]
                    .take()
                    .unwrap_or_else(|| FetchOutcome::Failed("fetch task aborted".to_string()));
                let report = match outcome {
                    FetchOutcome::Fetched { records, batch } => {
                        let mut tally = self.engine.reconcile_all(batch.drafts).await;
                        tally.skipped += batch.skipped;
                        total_records += tally.changes();
                        info!(
                            source_id = %source.source_id,
                            records,
                            inserted = tally.inserted,
                            updated = tally.updated,
                            unchanged = tally.unchanged,
                            skipped = tally.skipped,
                            failed = tally.failed,
                            "source reconciled"
                        );
                        SourceReport {
                            source_id: source.source_id.clone(),
                            status: SourceStatus::Fetched,
                            error: None,
                            records,
                            tally,
                        }
                    }
                    FetchOutcome::Failed(error) => {
                        warn!(source_id = %source.source_id, %error, "source fetch failed; contributing zero records");
                        SourceReport {
                            source_id: source.source_id.clone(),
                            status: SourceStatus::Failed,
                            error: Some(error),
                            records: 0,
                            tally: ReconcileTally::default(),
                        }
                    }
                    FetchOutcome::TimedOut => {
                        warn!(
                            source_id = %source.source_id,
                            timeout_secs = self.source_timeout.as_secs_f64(),
                            "source fetch timed out; contributing zero records"
                        );
                        SourceReport {
                            source_id: source.source_id.clone(),
                            status: SourceStatus::TimedOut,
                            error: Some(format!("timed out after {:?}", self.source_timeout)),
                            records: 0,
                            tally: ReconcileTally::default(),
                        }
                    }
                };
                reports.push(report);
            }

            let finished_at = Utc::now();
            info!(total_records, "sync run finished");
            Ok(SyncRunSummary {
                run_id,
                trigger,
                started_at,
                finished_at,
                total_records,
                sources: reports,
            })
        }
        .instrument(span)
        .await
    }

    async fn fetch_all(&self) -> Vec<Option<FetchOutcome>> {
        let mut tasks = JoinSet::new();
        for (idx, source) in self.sources.iter().cloned().enumerate() {
            let fetcher = Arc::clone(&self.fetcher);
            let timeout = self.source_timeout;
            tasks.spawn(async move {
                let adapter = adapter_for_kind(source.kind);
                let fetch = adapter.fetch_drafts(fetcher.as_ref(), &source.url);
                let outcome = match tokio::time::timeout(timeout, fetch).await {
                    Ok(Ok(batch)) => FetchOutcome::Fetched {
                        records: batch.drafts.len() + batch.skipped,
                        batch,
                    },
                    Ok(Err(err)) => FetchOutcome::Failed(err.to_string()),
                    Err(_) => FetchOutcome::TimedOut,
                };
                (idx, outcome)
            });
        }

        let mut outcomes = (0..self.sources.len()).map(|_| None).collect::<Vec<_>>();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, outcome)) => outcomes[idx] = Some(outcome),
                Err(err) => warn!(error = %err, "source fetch task did not complete"),
            }
        }
        outcomes
    }

    /// Scheduled entry point: never errors, advances the last-synced marker
    /// only when every source was fetched.
    pub async fn run_scheduled(&self) -> bool {
        match self.run(SyncTrigger::Scheduled).await {
            Ok(summary) if summary.all_sources_fetched() => {
                *self.last_synced_at.write().await = Some(summary.finished_at);
                true
            }
            Ok(summary) => {
                warn!(run_id = %summary.run_id, "scheduled sync finished with failed sources");
                false
            }
            Err(err) => {
                warn!(error = %err, "scheduled sync skipped");
                false
            }
        }
    }
}

pub async fn build_orchestrator(config: &SyncConfig, store: Arc<dyn TicketStore>) -> Result<SyncOrchestrator> {
    let registry = SourceRegistry::load(&config.sources_file, &config.upstream_base_url).await?;
    let fetcher = config.build_fetcher()?;
    Ok(SyncOrchestrator::new(&registry, fetcher, store, config.source_timeout())?)
}

/// Scheduler running [`SyncOrchestrator::run_scheduled`] on `sync_cron`, or
/// `None` when scheduling is disabled. The caller starts it.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrator: Arc<SyncOrchestrator>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = &config.sync_cron;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = Arc::clone(&orchestrator);
        Box::pin(async move {
            orchestrator.run_scheduled().await;
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let store = config.open_store().await?;
    let orchestrator = build_orchestrator(&config, store).await?;
    Ok(orchestrator.run(SyncTrigger::Manual).await?)
}
