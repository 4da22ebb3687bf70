//! Harvest pipeline orchestration: catalog fetch, nutrient harvest,
//! reconciliation against the persisted store, notifications, pruning, and
//! per-run reports.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use dnh_adapters::{load_snapshot, CatalogClient, CatalogFetcher, VenueListing};
use dnh_core::VenueSnapshot;
use dnh_storage::{ArtifactStore, MemoryObjectStore, ObjectStore, ParseObjectStore, QueryService, RpcClient};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod batch;
pub mod config;
pub mod export;
pub mod harvest;
pub mod index;
pub mod notify;
pub mod reconcile;

pub use batch::{BoundedBatch, ItemFailure};
pub use config::{parse_harvest_date, ConfigError, RunOptions, SyncConfig, VenueEntry, VenueRegistry};
pub use harvest::{HarvestReport, NutrientHarvester};
pub use index::{IndexedNotification, IndexedOffering, IndexedRecipe, PersistedIndex};
pub use notify::{collect_intents, expand, NotificationIntent, NotificationPoster, NotifyReport, PruneReport};
pub use reconcile::{EntityCounts, ReconcileReport, Reconciler};

pub const CRATE_NAME: &str = "dnh-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VenueStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueOutcome {
    pub venue_key: String,
    pub venue_name: String,
    pub date: NaiveDate,
    pub status: VenueStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub recipes: usize,
    #[serde(default)]
    pub offerings: usize,
    #[serde(default)]
    pub harvest: HarvestReport,
    #[serde(default)]
    pub reconcile: ReconcileReport,
    #[serde(default)]
    pub notify: NotifyReport,
    #[serde(default)]
    pub artifact: Option<String>,
}

impl VenueOutcome {
    fn failed(venue: &VenueListing, date: NaiveDate, error: String) -> Self {
        Self {
            venue_key: venue.key.clone(),
            venue_name: venue.name.clone(),
            date,
            status: VenueStatus::Failed,
            error: Some(error),
            recipes: 0,
            offerings: 0,
            harvest: HarvestReport::default(),
            reconcile: ReconcileReport::default(),
            notify: NotifyReport::default(),
            artifact: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub dates: Vec<NaiveDate>,
    pub venues: Vec<VenueOutcome>,
    pub harvest: HarvestReport,
    pub reconcile: ReconcileReport,
    pub notify: NotifyReport,
    pub prune: PruneReport,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

impl SyncRunSummary {
    pub fn failed_venues(&self) -> usize {
        self.venues.iter().filter(|v| v.status == VenueStatus::Failed).count()
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    fetcher: CatalogFetcher,
    store: Arc<dyn ObjectStore>,
    harvester: NutrientHarvester,
    reconciler: Reconciler,
    notifier: NotificationPoster,
    artifact_store: ArtifactStore,
    dry_run: bool,
}

impl SyncPipeline {
    /// Live collaborators from `config`. A dry run keeps every write in memory.
    pub fn new(config: SyncConfig, dry_run: bool) -> Result<Self> {
        config.validate()?;
        let http = config.http_client_config();
        let service: Arc<dyn QueryService> = Arc::new(RpcClient::new(config.rpc_url.clone(), http.clone())?);
        let store: Arc<dyn ObjectStore> = if dry_run {
            Arc::new(MemoryObjectStore::new())
        } else {
            Arc::new(ParseObjectStore::new(config.store_config(), http)?)
        };
        let mut pipeline = Self::with_collaborators(config, service, store);
        pipeline.dry_run = dry_run;
        Ok(pipeline)
    }

    pub fn with_collaborators(config: SyncConfig, service: Arc<dyn QueryService>, store: Arc<dyn ObjectStore>) -> Self {
        let client = CatalogClient::new(service);
        let item_timeout = config.item_timeout();
        let harvester = NutrientHarvester::new(
            client.clone(),
            BoundedBatch::new(config.harvest_concurrency).with_item_timeout(item_timeout),
        );
        let notifier = NotificationPoster::new(
            Arc::clone(&store),
            BoundedBatch::new(config.notify_concurrency).with_item_timeout(item_timeout),
        );
        Self {
            fetcher: CatalogFetcher::new(client),
            reconciler: Reconciler::new(Arc::clone(&store), config.attribution_user.clone()),
            artifact_store: ArtifactStore::new(config.artifacts_dir()),
            store,
            harvester,
            notifier,
            config,
            dry_run: false,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self, options: &RunOptions) -> Result<SyncRunSummary> {
        self.config.validate()?;
        options.validate()?;

        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, dry_run = self.dry_run, "sync run starting");

        let mut index = PersistedIndex::build(self.store.as_ref(), self.config.page_size)
            .await
            .context("building persisted index")?;
        let mut outcomes = Vec::new();
        let mut snapshots = Vec::new();

        let dates = if options.mock_snapshots.is_empty() {
            let dates = options.harvest_dates(&self.config);
            let venues = self.eligible_venues(options).await?;
            for date in &dates {
                for venue in &venues {
                    match self.fetcher.fetch_venue(&venue.key, &venue.name, *date).await {
                        Ok(mut snapshot) => {
                            outcomes.push(self.process_snapshot(&mut snapshot, &mut index).await);
                            snapshots.push(snapshot);
                        }
                        Err(err) => {
                            warn!(venue = %venue.key, %date, stage = %err.stage(), error = %err, "venue harvest aborted");
                            outcomes.push(VenueOutcome::failed(venue, *date, err.to_string()));
                        }
                    }
                }
            }
            dates
        } else {
            let mut dates = Vec::new();
            for path in &options.mock_snapshots {
                let mut snapshot = load_snapshot(path).with_context(|| format!("loading mock snapshot {}", path.display()))?;
                if !options.wants_venue(&snapshot.key) {
                    continue;
                }
                if !dates.contains(&snapshot.harvest_date) {
                    dates.push(snapshot.harvest_date);
                }
                outcomes.push(self.process_snapshot(&mut snapshot, &mut index).await);
                snapshots.push(snapshot);
            }
            dates
        };

        let prune = self.notifier.prune(&mut index, Utc::now()).await;

        let mut harvest = HarvestReport::default();
        let mut reconcile = ReconcileReport::default();
        let mut notify = NotifyReport::default();
        for outcome in &outcomes {
            harvest += outcome.harvest;
            reconcile += outcome.reconcile;
            notify += outcome.notify;
        }

        let reports_dir = self.config.reports_dir().join(run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;
        let manifest_path = export::export_parquet_snapshots(&reports_dir, &snapshots)?;

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run: self.dry_run,
            dates,
            venues: outcomes,
            harvest,
            reconcile,
            notify,
            prune,
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        };
        write_reports(&reports_dir, &summary).await?;

        info!(
            %run_id,
            venues = summary.venues.len(),
            failed_venues = summary.failed_venues(),
            recipes_created = summary.reconcile.recipes.created,
            offerings_created = summary.reconcile.offerings.created,
            notifications_posted = summary.notify.posted,
            notifications_pruned = summary.prune.deleted,
            "sync run finished"
        );
        Ok(summary)
    }

    /// Only the expiry pass, against a freshly built index.
    pub async fn prune_only(&self) -> Result<PruneReport> {
        let mut index = PersistedIndex::build(self.store.as_ref(), self.config.page_size)
            .await
            .context("building persisted index")?;
        Ok(self.notifier.prune(&mut index, Utc::now()).await)
    }

    pub async fn maybe_build_scheduler(self: Arc<Self>, options: RunOptions) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            let options = options.clone();
            Box::pin(async move {
                match pipeline.run_once(&options).await {
                    Ok(summary) => info!(run_id = %summary.run_id, reports = %summary.reports_dir, "scheduled sync finished"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    async fn eligible_venues(&self, options: &RunOptions) -> Result<Vec<VenueListing>> {
        let listing = self.fetcher.available_venues().await.context("listing venues")?;
        let listing = match VenueRegistry::load(&self.config.workdir).await? {
            Some(registry) => registry.select(listing),
            None => listing,
        };
        for wanted in &options.venues {
            if !listing.iter().any(|v| v.key.eq_ignore_ascii_case(wanted)) {
                warn!(venue = %wanted, "requested venue is not available");
            }
        }
        Ok(listing.into_iter().filter(|v| options.wants_venue(&v.key)).collect())
    }

    async fn process_snapshot(&self, snapshot: &mut VenueSnapshot, index: &mut PersistedIndex) -> VenueOutcome {
        let harvest = self.harvester.harvest(&mut snapshot.recipes, &snapshot.session).await;
        let reconcile = self.reconciler.reconcile(snapshot, index).await;
        let notify = self.notifier.notify(snapshot, index).await;

        let artifact = match self.store_artifact(snapshot).await {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(venue = %snapshot.key, error = %format!("{err:#}"), "snapshot artifact not written");
                None
            }
        };

        VenueOutcome {
            venue_key: snapshot.key.clone(),
            venue_name: snapshot.name.clone(),
            date: snapshot.harvest_date,
            status: VenueStatus::Completed,
            error: None,
            recipes: snapshot.recipes.len(),
            offerings: snapshot.offerings.len(),
            harvest,
            reconcile,
            notify,
            artifact,
        }
    }

    async fn store_artifact(&self, snapshot: &VenueSnapshot) -> Result<String> {
        let bytes = serde_json::to_vec_pretty(snapshot).context("serializing snapshot")?;
        let stored = self
            .artifact_store
            .store_snapshot(snapshot.harvest_date, &snapshot.key, &bytes)
            .await?;
        Ok(stored.absolute_path.display().to_string())
    }
}

pub async fn run_sync_once_from_env(options: &RunOptions) -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env(), options.dry_run)?;
    pipeline.run_once(options).await
}

async fn write_reports(reports_dir: &Path, summary: &SyncRunSummary) -> Result<()> {
    fs::write(reports_dir.join("run_brief.md"), run_brief_markdown(summary))
        .await
        .context("writing run_brief.md")?;
    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    Ok(())
}

pub fn run_brief_markdown(summary: &SyncRunSummary) -> String {
    let mut per_venue: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for outcome in &summary.venues {
        let entry = per_venue.entry(outcome.venue_key.as_str()).or_default();
        entry.0 += outcome.recipes;
        entry.1 += outcome.offerings;
    }
    let failures = summary
        .venues
        .iter()
        .filter_map(|v| v.error.as_ref().map(|e| format!("- {} {}: {}", v.venue_key, v.date, e)))
        .collect::<Vec<_>>();

    format!(
        "# DNH Run Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Dry run: {}\n- Dates: {}\n\n\
         ## Totals\n- Nutrient lookups: {} attempted, {} populated, {} failed\n\
         - Recipes: {} created, {} skipped, {} failed\n\
         - Offerings: {} created, {} skipped, {} failed\n\
         - Notifications: {} posted, {} duplicates, {} failed\n\
         - Pruned: {} of {} expired\n\n## Venues\n{}\n\n## Failures\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.dry_run,
        summary.dates.iter().map(NaiveDate::to_string).collect::<Vec<_>>().join(", "),
        summary.harvest.attempted,
        summary.harvest.populated,
        summary.harvest.failed,
        summary.reconcile.recipes.created,
        summary.reconcile.recipes.skipped,
        summary.reconcile.recipes.failed,
        summary.reconcile.offerings.created,
        summary.reconcile.offerings.skipped,
        summary.reconcile.offerings.failed,
        summary.notify.posted,
        summary.notify.duplicates,
        summary.notify.failed,
        summary.prune.deleted,
        summary.prune.expired,
        per_venue
            .iter()
            .map(|(k, (recipes, offerings))| format!("- {k}: {recipes} recipes, {offerings} offerings"))
            .collect::<Vec<_>>()
            .join("\n"),
        if failures.is_empty() { "- none".to_string() } else { failures.join("\n") },
    )
}

/// Markdown digest of the latest `runs` run directories under `{workdir}/reports`.
pub fn report_markdown(runs: usize, workdir: Option<PathBuf>) -> Result<String> {
    let root = workdir.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# DNH Recent Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let summary_path = dir.path().join("run_summary.json");
        let text = std::fs::read_to_string(&summary_path)
            .with_context(|| format!("reading {}", summary_path.display()))?;
        let summary: SyncRunSummary =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", summary_path.display()))?;

        lines.push(format!("## Run `{}` ({})", summary.run_id, summary.started_at));
        lines.push(format!(
            "- venues: {} ({} failed)",
            summary.venues.len(),
            summary.failed_venues()
        ));
        lines.push(format!(
            "- recipes created: {}, offerings created: {}",
            summary.reconcile.recipes.created, summary.reconcile.offerings.created
        ));
        lines.push(format!(
            "- notifications posted: {}, pruned: {}",
            summary.notify.posted, summary.prune.deleted
        ));
        lines.push(format!("- parquet manifest: `{}`", summary.parquet_manifest));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(run_id: Uuid, failed: bool) -> SyncRunSummary {
        let date = NaiveDate::from_ymd_opt(2015, 9, 26).expect("date");
        let venue = VenueListing { key: "CYC".into(), name: "Courtyard Cafe".into() };
        let mut outcome = VenueOutcome::failed(&venue, date, "session failed for venue CYC".into());
        if !failed {
            outcome.status = VenueStatus::Completed;
            outcome.error = None;
            outcome.recipes = 4;
            outcome.offerings = 3;
        }
        SyncRunSummary {
            run_id,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            dry_run: true,
            dates: vec![date],
            venues: vec![outcome],
            harvest: HarvestReport::default(),
            reconcile: ReconcileReport {
                recipes: EntityCounts { created: 4, skipped: 0, failed: 0 },
                offerings: EntityCounts { created: 3, skipped: 0, failed: 0 },
            },
            notify: NotifyReport::default(),
            prune: PruneReport::default(),
            reports_dir: String::new(),
            parquet_manifest: "reports/x/snapshots/manifest.json".into(),
        }
    }

    #[test]
    fn brief_lists_totals_and_failures() {
        let ok = run_brief_markdown(&summary(Uuid::new_v4(), false));
        assert!(ok.contains("- CYC: 4 recipes, 3 offerings"));
        assert!(ok.contains("Offerings: 3 created"));
        assert!(ok.contains("## Failures\n- none"));

        let failed = run_brief_markdown(&summary(Uuid::new_v4(), true));
        assert!(failed.contains("- CYC 2015-09-26: session failed for venue CYC"));
    }

    #[tokio::test]
    async fn report_reads_back_written_runs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let run_id = Uuid::new_v4();
        let run_dir = dir.path().join("reports").join(run_id.to_string());
        fs::create_dir_all(&run_dir).await.expect("mkdir");
        write_reports(&run_dir, &summary(run_id, true)).await.expect("write");
        assert!(run_dir.join("run_brief.md").exists());

        let report = report_markdown(5, Some(dir.path().to_path_buf())).expect("report");
        assert!(report.contains(&format!("## Run `{run_id}`")));
        assert!(report.contains("- venues: 1 (1 failed)"));
        assert!(report.contains("offerings created: 3"));
    }
}
