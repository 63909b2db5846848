//! Crawl-and-reconcile run orchestration: paginated worker pool, record assembly,
//! per-record reconciliation and the snapshot export.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use busharvest_adapters::{CatalogAdapter, SiteProfile};
use busharvest_core::{AssembledBus, TransformedSet};
use busharvest_storage::{
    HttpClientConfig, HttpFetcher, PageSource, RetryPolicy, S3SinkConfig, S3SnapshotSink,
    SnapshotSink,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgConnectOptions;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod assemble;
pub mod export;
pub mod store;

pub use assemble::RecordAssembler;
pub use export::{SnapshotExporter, SNAPSHOT_CONTENT_TYPE, SNAPSHOT_KEY};
pub use store::{
    MemoryReconciliationStore, PersistenceError, PgReconciliationStore, ReconciliationStore,
    UpsertOutcome,
};

pub const CRATE_NAME: &str = "busharvest-sync";

pub const DEFAULT_CONCURRENCY: usize = 5;
pub const DEFAULT_SYNC_CRON: &str = "0 0 6 * * *";
pub const SUCCESS_MESSAGE: &str = "ETL process completed successfully.";

const REQUIRED_VARS: &[&str] = &["S3_BUCKET", "DB_HOST", "DB_NAME", "DB_USER", "DB_PASSWORD"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<String>),
    #[error("invalid value `{value}` for {var}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Clone)]
pub struct SyncConfig {
    pub s3_bucket: String,
    pub aws_region: String,
    pub s3_endpoint: Option<String>,
    pub db_host: String,
    pub db_port: u16,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,
    /// Overrides the site profile's base URL when set.
    pub base_url: Option<String>,
    pub concurrency: usize,
    pub max_attempts: usize,
    pub http_timeout: Duration,
    pub site_profile_path: Option<PathBuf>,
    pub sync_cron: String,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("s3_bucket", &self.s3_bucket)
            .field("aws_region", &self.aws_region)
            .field("s3_endpoint", &self.s3_endpoint)
            .field("db_host", &self.db_host)
            .field("db_port", &self.db_port)
            .field("db_name", &self.db_name)
            .field("db_user", &self.db_user)
            .field("db_password", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("concurrency", &self.concurrency)
            .field("max_attempts", &self.max_attempts)
            .field("http_timeout", &self.http_timeout)
            .field("site_profile_path", &self.site_profile_path)
            .field("sync_cron", &self.sync_cron)
            .finish()
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        None => Ok(default),
    }
}

fn positive(var: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
        });
    }
    Ok(value)
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Empty values count as unset. Every missing required variable is reported at once.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let missing = REQUIRED_VARS
            .iter()
            .filter(|&&var| lookup(var).is_none())
            .map(|var| var.to_string())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        let required = |var: &str| lookup(var).unwrap_or_default();

        Ok(Self {
            s3_bucket: required("S3_BUCKET"),
            aws_region: lookup("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            s3_endpoint: lookup("S3_ENDPOINT"),
            db_host: required("DB_HOST"),
            db_port: parse_var(&lookup, "DB_PORT", 5432)?,
            db_name: required("DB_NAME"),
            db_user: required("DB_USER"),
            db_password: required("DB_PASSWORD"),
            base_url: lookup("BASE_URL"),
            concurrency: positive(
                "BUSHARVEST_CONCURRENCY",
                parse_var(&lookup, "BUSHARVEST_CONCURRENCY", DEFAULT_CONCURRENCY)?,
            )?,
            max_attempts: positive(
                "BUSHARVEST_MAX_ATTEMPTS",
                parse_var(&lookup, "BUSHARVEST_MAX_ATTEMPTS", 3)?,
            )?,
            http_timeout: Duration::from_secs(parse_var(
                &lookup,
                "BUSHARVEST_HTTP_TIMEOUT_SECS",
                10,
            )?),
            site_profile_path: lookup("BUSHARVEST_SITE_PROFILE").map(PathBuf::from),
            sync_cron: lookup("BUSHARVEST_SYNC_CRON").unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
        })
    }

    pub fn pg_connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.db_host)
            .port(self.db_port)
            .database(&self.db_name)
            .username(&self.db_user)
            .password(&self.db_password)
    }

    pub fn site_profile(&self) -> Result<SiteProfile> {
        let mut profile = match &self.site_profile_path {
            Some(path) => SiteProfile::load(path)?,
            None => SiteProfile::default(),
        };
        if let Some(base_url) = &self.base_url {
            profile.base_url = base_url.clone();
        }
        Ok(profile)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_total: u32,
    pub pages_skipped: u32,
    pub listings_seen: usize,
    pub listings_dropped: usize,
    pub records_inserted: usize,
    pub records_updated: usize,
    pub records_failed: usize,
    pub snapshot_key: String,
    pub snapshot_sha256: String,
}

/// What one page worker reports back to the collector.
#[derive(Debug)]
enum CrawlEvent {
    PageSkipped { page: u32 },
    PageParsed { page: u32, listings: usize },
    ListingDropped,
    Record(Box<AssembledBus>),
}

#[derive(Clone)]
struct PageWorker {
    adapter: Arc<CatalogAdapter>,
    pages: Arc<dyn PageSource>,
    assembler: RecordAssembler,
    events: mpsc::Sender<CrawlEvent>,
}

impl PageWorker {
    /// Returns `false` once the collector has gone away.
    async fn process(&self, page: u32) -> bool {
        let url = self.adapter.page_url(page);
        let html = match self.pages.fetch_text(&url).await {
            Ok(html) => html,
            Err(err) => {
                warn!(page, url = %url, error = %err, "skipping catalog page");
                return self.emit(CrawlEvent::PageSkipped { page }).await;
            }
        };

        let stubs = self.adapter.parse_listing(&html);
        if !self
            .emit(CrawlEvent::PageParsed {
                page,
                listings: stubs.len(),
            })
            .await
        {
            return false;
        }

        // Detail pages of one catalog page are fetched one after another.
        for stub in stubs {
            let event = match self.adapter.fetch_detail(self.pages.as_ref(), &stub.detail_url).await {
                Ok(Some(detail)) => match self.assembler.assemble(&stub, detail) {
                    Some(record) => CrawlEvent::Record(Box::new(record)),
                    None => CrawlEvent::ListingDropped,
                },
                Ok(None) => CrawlEvent::ListingDropped,
                Err(err) => {
                    warn!(url = %stub.detail_url, error = %err, "skipping listing with unavailable detail page");
                    CrawlEvent::ListingDropped
                }
            };
            if !self.emit(event).await {
                return false;
            }
        }
        true
    }

    async fn emit(&self, event: CrawlEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

#[derive(Debug, Default)]
struct RunTally {
    pages_skipped: u32,
    listings_seen: usize,
    listings_dropped: usize,
    records_inserted: usize,
    records_updated: usize,
    records_failed: usize,
}

impl RunTally {
    fn assembled(&self) -> usize {
        self.records_inserted + self.records_updated + self.records_failed
    }
}

pub struct SyncPipeline {
    adapter: Arc<CatalogAdapter>,
    pages: Arc<dyn PageSource>,
    store: Arc<dyn ReconciliationStore>,
    exporter: SnapshotExporter,
    assembler: RecordAssembler,
    concurrency: usize,
}

impl SyncPipeline {
    pub fn new(
        adapter: CatalogAdapter,
        pages: Arc<dyn PageSource>,
        store: Arc<dyn ReconciliationStore>,
        sink: Arc<dyn SnapshotSink>,
    ) -> Self {
        let assembler = RecordAssembler::new(adapter.source_name());
        Self {
            adapter: Arc::new(adapter),
            pages,
            store,
            exporter: SnapshotExporter::new(sink),
            assembler,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_snapshot_sink(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.exporter = SnapshotExporter::new(sink);
        self
    }

    /// Production wiring: HTTP fetcher, Postgres store, S3 sink.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let adapter = CatalogAdapter::new(config.site_profile()?)
            .context("compiling site profile selectors")?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout,
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
            },
            ..HttpClientConfig::default()
        })?;
        let store = PgReconciliationStore::connect(config.pg_connect_options())
            .await
            .context("connecting to database")?;
        let sink = S3SnapshotSink::new(S3SinkConfig {
            bucket: config.s3_bucket.clone(),
            region: config.aws_region.clone(),
            endpoint: config.s3_endpoint.clone(),
        })
        .await;

        Ok(Self::new(adapter, Arc::new(http), Arc::new(store), Arc::new(sink))
            .with_concurrency(config.concurrency))
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        self.run(run_id, started_at)
            .instrument(info_span!("sync_run", %run_id))
            .await
    }

    async fn run(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<SyncRunSummary> {
        info!(base_url = %self.adapter.profile().base_url, "starting sync run");

        let first_url = self.adapter.page_url(1);
        let (pages_total, first_page_failed) = match self.pages.fetch_text(&first_url).await {
            Ok(html) => (self.adapter.total_pages(&html), false),
            Err(err) => {
                warn!(url = %first_url, error = %err, "first catalog page unavailable");
                (1, true)
            }
        };
        info!(pages_total, "resolved catalog page count");

        let mut tally = RunTally::default();
        let mut set = TransformedSet::default();
        if first_page_failed {
            tally.pages_skipped = 1;
        } else {
            self.crawl_and_reconcile(pages_total, &mut tally, &mut set)
                .await?;
        }

        if tally.assembled() == 0 {
            bail!("no data extracted from source");
        }

        let stored = self
            .exporter
            .export(&set)
            .await
            .context("exporting snapshot")?;

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            pages_total,
            pages_skipped: tally.pages_skipped,
            listings_seen: tally.listings_seen,
            listings_dropped: tally.listings_dropped,
            records_inserted: tally.records_inserted,
            records_updated: tally.records_updated,
            records_failed: tally.records_failed,
            snapshot_key: stored.key,
            snapshot_sha256: stored.sha256,
        };
        info!(
            inserted = summary.records_inserted,
            updated = summary.records_updated,
            failed = summary.records_failed,
            dropped = summary.listings_dropped,
            pages_skipped = summary.pages_skipped,
            "sync run complete"
        );
        Ok(summary)
    }

    /// Page workers fan out over `1..=pages_total`; this task is the single writer to the store.
    async fn crawl_and_reconcile(
        &self,
        pages_total: u32,
        tally: &mut RunTally,
        set: &mut TransformedSet,
    ) -> Result<()> {
        let queue_len = usize::try_from(pages_total).unwrap_or(usize::MAX).max(1);
        let (page_tx, page_rx) = mpsc::channel::<u32>(queue_len);
        let (event_tx, mut event_rx) = mpsc::channel::<CrawlEvent>(64);
        let page_rx = Arc::new(Mutex::new(page_rx));

        let worker = PageWorker {
            adapter: self.adapter.clone(),
            pages: self.pages.clone(),
            assembler: self.assembler.clone(),
            events: event_tx,
        };

        let mut workers = JoinSet::new();
        for worker_id in 0..self.concurrency.min(queue_len) {
            let worker = worker.clone();
            let page_rx = page_rx.clone();
            workers.spawn(
                async move {
                    loop {
                        let page = {
                            let mut rx = page_rx.lock().await;
                            rx.recv().await
                        };
                        let Some(page) = page else { break };
                        if !worker.process(page).await {
                            break;
                        }
                    }
                }
                .instrument(info_span!("page_worker", worker_id)),
            );
        }
        drop(worker);

        for page in 1..=pages_total {
            if page_tx.send(page).await.is_err() {
                break;
            }
        }
        drop(page_tx);

        while let Some(event) = event_rx.recv().await {
            match event {
                CrawlEvent::PageSkipped { page } => {
                    debug!(page, "page skipped");
                    tally.pages_skipped += 1;
                }
                CrawlEvent::PageParsed { page, listings } => {
                    debug!(page, listings, "page parsed");
                    tally.listings_seen += listings;
                }
                CrawlEvent::ListingDropped => tally.listings_dropped += 1,
                CrawlEvent::Record(record) => self.reconcile(*record, tally, set).await,
            }
        }

        while let Some(joined) = workers.join_next().await {
            joined.context("page worker failed")?;
        }
        Ok(())
    }

    async fn reconcile(&self, record: AssembledBus, tally: &mut RunTally, set: &mut TransformedSet) {
        match self.store.reconcile(&record).await {
            Ok(outcome) => {
                if outcome.inserted {
                    tally.records_inserted += 1;
                } else {
                    tally.records_updated += 1;
                }
                debug!(id = outcome.id, url = %record.bus.source_url, inserted = outcome.inserted, "record reconciled");
                set.push(outcome.id, record);
            }
            Err(err) => {
                tally.records_failed += 1;
                error!(url = %record.bus.source_url, error = %err, "record rolled back");
            }
        }
    }
}

/// Result handed back to whatever invoked the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub status_code: u16,
    pub body: String,
}

impl RunOutcome {
    pub fn success() -> Self {
        Self {
            status_code: 200,
            body: serde_json::json!({ "message": SUCCESS_MESSAGE }).to_string(),
        }
    }

    pub fn failure(message: impl fmt::Display) -> Self {
        Self {
            status_code: 500,
            body: serde_json::json!({ "error": message.to_string() }).to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }
}

/// Runs the pipeline on its own task so that errors and panics both become a `500`.
pub async fn invoke_pipeline(pipeline: Arc<SyncPipeline>) -> RunOutcome {
    match tokio::spawn(async move { pipeline.run_once().await }).await {
        Ok(Ok(summary)) => {
            info!(run_id = %summary.run_id, "run succeeded");
            RunOutcome::success()
        }
        Ok(Err(err)) => {
            error!(error = %format!("{err:#}"), "run failed");
            RunOutcome::failure(format!("{err:#}"))
        }
        Err(join_err) => {
            error!(error = %join_err, "run task aborted");
            RunOutcome::failure(join_err)
        }
    }
}

pub async fn invoke(config: SyncConfig) -> RunOutcome {
    info!("run invoked");
    match SyncPipeline::from_config(&config).await {
        Ok(pipeline) => invoke_pipeline(Arc::new(pipeline)).await,
        Err(err) => {
            error!(error = %format!("{err:#}"), "pipeline setup failed");
            RunOutcome::failure(format!("{err:#}"))
        }
    }
}

pub async fn invoke_from_env() -> RunOutcome {
    match SyncConfig::from_env() {
        Ok(config) => invoke(config).await,
        Err(err) => {
            error!(error = %err, "configuration invalid");
            RunOutcome::failure(err)
        }
    }
}

pub async fn migrate(config: &SyncConfig) -> Result<()> {
    let store = PgReconciliationStore::connect(config.pg_connect_options())
        .await
        .context("connecting to database")?;
    sqlx::migrate!("../../migrations")
        .run(store.pool())
        .await
        .context("applying migrations")?;
    info!("migrations applied");
    Ok(())
}

/// Admits one run at a time; a second caller is turned away while a run holds the gate.
#[derive(Debug, Clone, Default)]
pub struct RunGate {
    busy: Arc<AtomicBool>,
}

pub struct RunPermit {
    busy: Arc<AtomicBool>,
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

impl RunGate {
    pub fn try_enter(&self) -> Option<RunPermit> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunPermit {
                busy: self.busy.clone(),
            })
    }
}

pub async fn build_scheduler(config: SyncConfig) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let gate = RunGate::default();
    let cron = config.sync_cron.clone();

    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let config = config.clone();
        let gate = gate.clone();
        Box::pin(async move {
            let Some(_permit) = gate.try_enter() else {
                warn!("previous run still in progress; skipping scheduled tick");
                return;
            };
            let outcome = invoke(config).await;
            info!(status = outcome.status_code, body = %outcome.body, "scheduled run finished");
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
