//! Scan pipeline orchestration: scrape, dedupe, merge against the latest
//! snapshot, persist, notify.

pub mod dedup;
pub mod merge;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use aptwatch_adapters::{ApartmentsComSource, FixtureListingSource, ListingSource, ScanContext};
use aptwatch_core::{
    format_capture_time, neighborhood_label, sort_newest_first, Listing, RunMetadata,
    SearchProfile,
};
use aptwatch_storage::{FileSnapshotStore, HttpFetcher, SnapshotStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use dedup::{dedupe, DedupStats};
pub use merge::{merge, MergeOutcome};

pub const CRATE_NAME: &str = "aptwatch-sync";

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub data_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub searches_path: PathBuf,
    pub fixtures_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_pages: usize,
    pub scheduler_enabled: bool,
    pub scan_cron: String,
}

impl ScanConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("APTWATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            reports_dir: std::env::var("APTWATCH_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            searches_path: std::env::var("APTWATCH_SEARCHES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./searches.yaml")),
            fixtures_dir: std::env::var("APTWATCH_FIXTURES_DIR").ok().map(PathBuf::from),
            user_agent: std::env::var("APTWATCH_USER_AGENT").unwrap_or_else(|_| {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36".to_string()
            }),
            http_timeout_secs: std::env::var("APTWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            max_pages: std::env::var("APTWATCH_MAX_PAGES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(aptwatch_adapters::DEFAULT_MAX_PAGES),
            scheduler_enabled: std::env::var("APTWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            scan_cron: std::env::var("APTWATCH_SCAN_CRON")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRegistry {
    pub searches: Vec<SearchProfile>,
}

impl SearchRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let registry: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        ensure!(
            !registry.searches.is_empty(),
            "{} defines no searches",
            path.display()
        );
        Ok(registry)
    }

    /// The first profile is the default search.
    pub fn default_search(&self) -> Option<&SearchProfile> {
        self.searches.first()
    }

    pub fn find(&self, name: &str) -> Option<&SearchProfile> {
        self.searches.iter().find(|s| s.name == name)
    }

    pub fn resolve(&self, name: Option<&str>) -> Result<&SearchProfile> {
        match name {
            Some(name) => self
                .find(name)
                .with_context(|| format!("no search named `{name}`")),
            None => self.default_search().context("no searches configured"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub search: String,
    pub scanned: usize,
    pub unique: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub cache_before: usize,
    pub cache_after: usize,
    pub new_listings: usize,
    pub saved_snapshot: Option<String>,
    pub notified: bool,
}

/// Result of one run. Both listing sequences are sorted newest capture first
/// for display; merge order is kept in the persisted snapshot.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub summary: RunSummary,
    pub metadata: RunMetadata,
    pub current_view: Vec<Listing>,
    pub newly_observed: Vec<Listing>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub run_id: Uuid,
    pub metadata: RunMetadata,
    pub listings: Vec<Listing>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

#[derive(Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _notification: &Notification) -> Result<()> {
        Ok(())
    }
}

/// Writes `new_listings.json` and `summary.md` under `<reports>/<run_id>/`.
pub struct ReportNotifier {
    reports_dir: PathBuf,
}

impl ReportNotifier {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            reports_dir: reports_dir.into(),
        }
    }
}

#[async_trait]
impl Notifier for ReportNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let run_dir = self.reports_dir.join(notification.run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let json = serde_json::to_vec_pretty(notification).context("serializing notification")?;
        fs::write(run_dir.join("new_listings.json"), json)
            .await
            .context("writing new_listings.json")?;
        fs::write(run_dir.join("summary.md"), notification_markdown(notification))
            .await
            .context("writing summary.md")?;

        info!(
            dir = %run_dir.display(),
            new_listings = notification.listings.len(),
            "wrote new listings report"
        );
        Ok(())
    }
}

pub fn notification_markdown(notification: &Notification) -> String {
    let meta = &notification.metadata;
    let mut lines = vec![
        format!("# New Apartment Listings - {} beds", meta.search.min_beds),
        String::new(),
        format!("- Run ID: `{}`", notification.run_id),
        format!(
            "- Search: {} ({})",
            meta.search.name,
            meta.search.keywords_joined()
        ),
        format!(
            "- Price: ${} to ${}",
            meta.search.min_price, meta.search.max_price
        ),
        format!("- Current listings: {}", meta.total_current_count),
        format!("- New listings: {}", meta.new_count),
        String::new(),
        "## Listings".to_string(),
    ];
    for listing in &notification.listings {
        lines.push(format!(
            "- **{}** {}, {}, {} ({}). First seen {}. {}",
            listing.address,
            listing.price,
            listing.beds,
            listing.availability,
            neighborhood_label(&listing.zip),
            format_capture_time(listing),
            listing.link
        ));
    }
    lines.push(String::new());
    lines.join("\n")
}

pub struct ScanPipeline {
    source: Box<dyn ListingSource>,
    store: Box<dyn SnapshotStore>,
    notifier: Box<dyn Notifier>,
    run_lock: Mutex<()>,
}

impl ScanPipeline {
    pub fn new(source: Box<dyn ListingSource>, store: Box<dyn SnapshotStore>) -> Self {
        Self {
            source,
            store,
            notifier: Box::<NoopNotifier>::default(),
            run_lock: Mutex::new(()),
        }
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn from_config(config: &ScanConfig) -> Result<Self> {
        let source: Box<dyn ListingSource> = match &config.fixtures_dir {
            Some(dir) => {
                info!(dir = %dir.display(), "replaying recorded search responses");
                Box::new(FixtureListingSource::new(dir))
            }
            None => {
                let http = HttpFetcher::new(ApartmentsComSource::http_config(
                    &config.user_agent,
                    Duration::from_secs(config.http_timeout_secs),
                ))?;
                Box::new(ApartmentsComSource::new(http).with_max_pages(config.max_pages))
            }
        };
        let store = FileSnapshotStore::new(config.data_dir.clone());
        Ok(Self::new(source, Box::new(store))
            .with_notifier(Box::new(ReportNotifier::new(config.reports_dir.clone()))))
    }

    pub fn store(&self) -> &dyn SnapshotStore {
        self.store.as_ref()
    }

    /// Runs one full cycle, waiting for any run already in progress.
    pub async fn run_once(&self, search: &SearchProfile) -> Result<ScanOutcome> {
        let _guard = self.run_lock.lock().await;
        self.run_locked(search).await
    }

    /// Like [`run_once`](Self::run_once) but returns `None` instead of
    /// waiting when another run holds the pipeline.
    pub async fn try_run_once(&self, search: &SearchProfile) -> Result<Option<ScanOutcome>> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            return Ok(None);
        };
        self.run_locked(search).await.map(Some)
    }

    async fn run_locked(&self, search: &SearchProfile) -> Result<ScanOutcome> {
        let ctx = ScanContext::new();
        let span = info_span!("scan_run", run_id = %ctx.run_id, search = %search.name);
        self.run_cycle(ctx, search).instrument(span).await
    }

    async fn run_cycle(&self, ctx: ScanContext, search: &SearchProfile) -> Result<ScanOutcome> {
        let mut scanned = Vec::new();
        let mut malformed = 0usize;
        for keyword in &search.keywords {
            let scan = self
                .source
                .scan_keyword(&ctx, search, keyword)
                .await
                .with_context(|| format!("scanning keyword `{keyword}`"))?;
            malformed += scan.malformed;
            scanned.extend(scan.listings);
        }
        info!(
            found = scanned.len(),
            keywords = %search.keywords_joined(),
            "scan complete"
        );

        let scanned_count = scanned.len();
        let unique = dedupe(scanned);
        let stats = DedupStats::new(scanned_count, unique.len());
        info!(
            unique = stats.unique,
            duplicates = stats.duplicates,
            "deduplicated scan"
        );

        let lease = self
            .store
            .acquire()
            .await
            .with_context(|| format!("locking snapshot store {}", self.store.describe()))?;
        let prior = self
            .store
            .load_latest()
            .await
            .context("loading latest snapshot")?;
        let cache_before = prior.len();
        info!(cache_size = cache_before, "loaded snapshot");

        let outcome = merge(prior, unique);
        ensure!(
            outcome.updated_snapshot.len() - cache_before == outcome.newly_observed.len(),
            "snapshot grew by {} but {} listings are new",
            outcome.updated_snapshot.len() - cache_before,
            outcome.newly_observed.len()
        );
        info!(
            new_listings = outcome.newly_observed.len(),
            cache_size = outcome.updated_snapshot.len(),
            "merged scan into snapshot"
        );

        let saved = if outcome.snapshot_changed() {
            Some(
                self.store
                    .save(&outcome.updated_snapshot)
                    .await
                    .context("saving updated snapshot")?,
            )
        } else {
            info!("no new listings; skipping snapshot save");
            None
        };
        drop(lease);

        let MergeOutcome {
            mut current_view,
            mut newly_observed,
            updated_snapshot,
            ..
        } = outcome;
        sort_newest_first(&mut current_view);
        sort_newest_first(&mut newly_observed);

        let metadata = RunMetadata {
            search: search.clone(),
            total_current_count: current_view.len(),
            new_count: newly_observed.len(),
        };

        let notified = if newly_observed.is_empty() {
            false
        } else {
            let notification = Notification {
                run_id: ctx.run_id,
                metadata: metadata.clone(),
                listings: newly_observed.clone(),
            };
            match self.notifier.notify(&notification).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(error = %err, "notification failed; snapshot is already saved");
                    false
                }
            }
        };

        let summary = RunSummary {
            run_id: ctx.run_id,
            started_at: ctx.started_at,
            finished_at: Utc::now(),
            search: search.name.clone(),
            scanned: stats.scanned,
            unique: stats.unique,
            duplicates: stats.duplicates,
            malformed,
            cache_before,
            cache_after: updated_snapshot.len(),
            new_listings: newly_observed.len(),
            saved_snapshot: saved.map(|s| s.location),
            notified,
        };
        info!(
            scanned = summary.scanned,
            unique = summary.unique,
            new_listings = summary.new_listings,
            cache_after = summary.cache_after,
            "scan run finished"
        );

        Ok(ScanOutcome {
            summary,
            metadata,
            current_view,
            newly_observed,
        })
    }
}

pub async fn run_scan_once_from_env(search_name: Option<&str>) -> Result<ScanOutcome> {
    let config = ScanConfig::from_env();
    let registry = SearchRegistry::load(&config.searches_path)?;
    let search = registry.resolve(search_name)?;
    let pipeline = ScanPipeline::from_config(&config)?;
    pipeline.run_once(search).await
}

/// Runs every search on each cron tick. A tick that finds a run still in
/// progress is skipped.
pub async fn build_scheduler(
    pipeline: Arc<ScanPipeline>,
    cron: &str,
    searches: Vec<SearchProfile>,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        let searches = searches.clone();
        Box::pin(async move {
            for search in &searches {
                match pipeline.try_run_once(search).await {
                    Ok(Some(outcome)) => info!(
                        search = %search.name,
                        new_listings = outcome.summary.new_listings,
                        "scheduled scan finished"
                    ),
                    Ok(None) => warn!(search = %search.name, "previous scan still running; skipping tick"),
                    Err(err) => error!(search = %search.name, error = %format!("{err:#}"), "scheduled scan failed"),
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn maybe_build_scheduler(
    config: &ScanConfig,
    pipeline: Arc<ScanPipeline>,
    searches: Vec<SearchProfile>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(pipeline, &config.scan_cron, searches)
        .await
        .map(Some)
}

/// Markdown digest of the most recent notification reports.
pub fn report_markdown(runs: usize, reports_dir: &Path) -> Result<String> {
    let mut dirs = match std::fs::read_dir(reports_dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
            .collect::<Vec<_>>(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(err) => {
            return Err(err).with_context(|| format!("reading {}", reports_dir.display()))
        }
    };
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# aptwatch Report".to_string(), String::new()];
    if dirs.is_empty() {
        lines.push("No notification reports yet.".to_string());
    }
    for dir in dirs.into_iter().take(runs.max(1)) {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let json_path = dir.path().join("new_listings.json");
        let value: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&json_path)
                .with_context(|| format!("reading {}", json_path.display()))?,
        )
        .with_context(|| format!("parsing {}", json_path.display()))?;
        let new_count = value
            .get("listings")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);
        let search = value
            .pointer("/metadata/search/name")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!("- search: {search}"));
        lines.push(format!("- new listings: {new_count}"));
        lines.push(format!("- details: `{}`", json_path.display()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
