//! CLI entry point for the vehicle-position trajectory collector.
//!
//! `collect` runs one polling loop per configured feed plus the daily
//! aggregation scheduler; `aggregate` runs aggregation once over the data
//! directory; `build-segment-index` caches a GTFS static segment index.

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::level_filters::LevelFilter;
use tracing::{Instrument, error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use vp_trajectories::{
    aggregator::{AggregateOptions, AggregateScope, TrajectoryAggregator},
    config::{AggregationConfig, AppConfig},
    fetch::HttpFeedSource,
    reconciler::FeedReconciler,
    schedule::{SegmentIndex, StaticScheduleIndex},
    service::{AggregationJob, load_segment_index, run_collector, run_scheduler, shutdown_channel},
    storage::{DataLayout, LocalTrajectoryStore, ObjectStore, S3Store},
};

#[derive(Parser)]
#[command(name = "vp_trajectories")]
#[command(about = "Collect GTFS-RT vehicle positions into daily trajectories", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll every configured feed and aggregate the previous day once a day
    Collect,
    /// Merge persisted trajectories into per-route daily collections
    Aggregate {
        /// Only this agency (default: every agency under the data directory)
        #[arg(long)]
        agency: Option<String>,

        /// Only this route
        #[arg(long)]
        route: Option<String>,

        #[arg(long)]
        year: Option<i32>,

        #[arg(long)]
        month: Option<u32>,

        #[arg(long)]
        day: Option<u32>,

        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,

        /// Upload artifacts to this S3 bucket
        #[arg(long)]
        s3_bucket: Option<String>,

        /// Delete local aggregated files after a successful upload
        #[arg(long)]
        delete_after_upload: bool,

        /// Delete raw trajectory files once their day is aggregated
        #[arg(long)]
        delete_raw_files: bool,

        /// Segment index JSON; enables segment matching
        #[arg(long)]
        segment_index: Option<PathBuf>,

        /// Extracted GTFS static directory; enables segment matching
        #[arg(long)]
        gtfs_static_path: Option<PathBuf>,
    },
    /// Build a segment index from an extracted GTFS static directory
    BuildSegmentIndex {
        #[arg(long)]
        gtfs_static_path: PathBuf,

        /// Where to write the JSON index
        #[arg(long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/vp_trajectories.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("vp_trajectories.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive(LevelFilter::INFO.into()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive(LevelFilter::DEBUG.into()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Collect => {
            let config = AppConfig::from_env()?;
            collect(config).await?;
        }
        Commands::Aggregate {
            agency,
            route,
            year,
            month,
            day,
            data_dir,
            s3_bucket,
            delete_after_upload,
            delete_raw_files,
            segment_index,
            gtfs_static_path,
        } => {
            let mut config = AggregationConfig::from_env()?;
            if segment_index.is_some() || gtfs_static_path.is_some() {
                config.segment_matching = true;
            }
            config.segment_index_path = segment_index.or(config.segment_index_path);
            config.gtfs_static_path = gtfs_static_path.or(config.gtfs_static_path);

            let layout = DataLayout::new(data_dir);
            let mut aggregator = TrajectoryAggregator::new(layout.clone());
            if config.segment_matching {
                if let Some(index) = index_for_cli(&config, &layout, agency.as_deref()) {
                    aggregator = aggregator.with_index(index);
                }
            }
            if let Some(bucket) = s3_bucket {
                let store: Arc<dyn ObjectStore> = Arc::new(S3Store::from_env().await);
                aggregator = aggregator.with_upload(store, bucket);
            }

            let scope = AggregateScope {
                agency,
                route_id: route,
                year,
                month,
                day,
            };
            let options = AggregateOptions {
                delete_after_upload,
                delete_raw_files,
            };
            let (succeeded, failed) = aggregator.aggregate_all(&scope, options).await?;
            info!(succeeded, failed, "Aggregation finished");
        }
        Commands::BuildSegmentIndex {
            gtfs_static_path,
            output,
        } => {
            let index = SegmentIndex::from_gtfs_dir(&gtfs_static_path)?;
            index.save(&output)?;
            info!(
                routes = index.route_count(),
                segments = index.segment_count(),
                output = %output.display(),
                "Segment index written"
            );
        }
    }

    Ok(())
}

/// Runs every feed loop and the scheduler until Ctrl-C or a fatal feed error.
async fn collect(config: AppConfig) -> Result<()> {
    let layout = DataLayout::new(&config.data_dir);
    let (shutdown_tx, shutdown) = shutdown_channel();

    let upload = match &config.s3_bucket {
        Some(bucket) => {
            let store: Arc<dyn ObjectStore> = Arc::new(S3Store::from_env().await);
            Some((store, bucket.clone()))
        }
        None => None,
    };

    let mut collectors = JoinSet::new();
    for feed in &config.feeds {
        let source = HttpFeedSource::from_config(feed, config.reconciler.request_timeout)
            .with_context(|| format!("failed to build client for {}", feed.provider))?;
        let sink = LocalTrajectoryStore::new(layout.clone(), feed.provider.clone());
        let reconciler = FeedReconciler::new(feed.provider.clone(), config.reconciler.clone(), sink);

        let span = tracing::info_span!("feed", provider = %feed.provider);
        collectors.spawn(run_collector(reconciler, source, shutdown.clone()).instrument(span));
        info!(provider = %feed.provider, url = %feed.url, "Feed collector spawned");
    }

    let job = AggregationJob {
        layout,
        config: config.aggregation.clone(),
        upload,
        agencies: config.feeds.iter().map(|f| f.provider.clone()).collect(),
    };
    let scheduler = tokio::spawn(run_scheduler(job, shutdown.clone()));

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("Shutdown requested");
            Ok(())
        }
        Some(joined) = collectors.join_next() => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow!(e).context("feed collector stopped")),
            Err(e) => Err(anyhow!(e).context("feed collector panicked")),
        },
    };

    // Receivers may already be gone; nothing to notify then.
    let _ = shutdown_tx.send(true);
    while let Some(joined) = collectors.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Feed collector stopped with an error"),
            Err(e) => error!(error = %e, "Feed collector panicked"),
        }
    }
    if let Err(e) = scheduler.await {
        error!(error = %e, "Aggregation scheduler panicked");
    }

    outcome
}

/// Segment index for a one-off run. Without an agency there is no default
/// cache location, so the index is built in memory from GTFS files.
fn index_for_cli(
    config: &AggregationConfig,
    layout: &DataLayout,
    agency: Option<&str>,
) -> Option<Arc<dyn StaticScheduleIndex>> {
    if let Some(agency) = agency {
        return load_segment_index(config, layout, agency);
    }
    if config.segment_index_path.is_some() {
        return load_segment_index(config, layout, "");
    }

    let Some(dir) = &config.gtfs_static_path else {
        warn!("Segment matching needs --agency, --segment-index or --gtfs-static-path");
        return None;
    };
    match SegmentIndex::from_gtfs_dir(dir) {
        Ok(index) => {
            let index: Arc<dyn StaticScheduleIndex> = Arc::new(index);
            Some(index)
        }
        Err(e) => {
            warn!(error = %e, "Failed to build segment index, segment matching disabled");
            None
        }
    }
}
