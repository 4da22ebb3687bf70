use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dnh_sync::{parse_harvest_date, report_markdown, RunOptions, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "dnh-cli")]
#[command(about = "Dining nutrition harvester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Harvest, reconcile, notify, and prune once.
    Sync(RunArgs),
    /// Delete expired notifications only.
    Prune {
        #[arg(long)]
        dry_run: bool,
    },
    /// Run `sync` on the configured cron schedule until interrupted.
    Schedule(RunArgs),
    /// Summarise the latest runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
        #[arg(long)]
        workdir: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Default, Args)]
struct RunArgs {
    /// First harvest date, YYYY-MM-DD. Defaults to today.
    #[arg(long)]
    date: Option<String>,
    /// Number of consecutive dates to harvest (1-7).
    #[arg(long)]
    days: Option<u32>,
    /// Restrict the run to these venue keys.
    #[arg(long = "venue")]
    venues: Vec<String>,
    /// Re-run saved snapshot artifacts instead of harvesting live.
    #[arg(long = "mock")]
    mocks: Vec<PathBuf>,
    /// Write to an in-memory store instead of the remote one.
    #[arg(long)]
    dry_run: bool,
}

impl RunArgs {
    fn into_options(self) -> Result<RunOptions> {
        let start_date = self.date.as_deref().map(parse_harvest_date).transpose()?;
        let options = RunOptions {
            start_date,
            days: self.days,
            venues: self.venues,
            mock_snapshots: self.mocks,
            dry_run: self.dry_run,
        };
        options.validate()?;
        Ok(options)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "dnh=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync(RunArgs::default())) {
        Commands::Sync(args) => {
            let options = args.into_options()?;
            let summary = dnh_sync::run_sync_once_from_env(&options).await?;
            println!(
                "sync complete: run_id={} venues={} failed={} recipes_created={} offerings_created={} notifications={} pruned={} reports={}",
                summary.run_id,
                summary.venues.len(),
                summary.failed_venues(),
                summary.reconcile.recipes.created,
                summary.reconcile.offerings.created,
                summary.notify.posted,
                summary.prune.deleted,
                summary.reports_dir
            );
        }
        Commands::Prune { dry_run } => {
            let pipeline = SyncPipeline::new(SyncConfig::from_env(), dry_run)?;
            let report = pipeline.prune_only().await?;
            println!(
                "prune complete: examined={} expired={} deleted={} failed={}",
                report.examined, report.expired, report.deleted, report.failed
            );
        }
        Commands::Schedule(args) => {
            let options = args.into_options()?;
            let mut config = SyncConfig::from_env();
            config.scheduler_enabled = true;
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(SyncPipeline::new(config, options.dry_run)?);
            let Some(mut scheduler) = pipeline.maybe_build_scheduler(options).await? else {
                return Ok(());
            };
            scheduler.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs, workdir } => {
            let workdir = workdir.or_else(|| Some(SyncConfig::from_env().workdir));
            println!("{}", report_markdown(runs, workdir)?);
        }
    }

    Ok(())
}
