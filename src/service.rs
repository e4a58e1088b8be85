//! Long-running tasks behind `collect`: one collection loop per feed and the
//! daily aggregation scheduler, all stopped through a shared [`Shutdown`].

use chrono::{Local, NaiveDate, NaiveDateTime, Timelike};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::aggregator::{AggregateOptions, AggregateScope, TrajectoryAggregator};
use crate::config::AggregationConfig;
use crate::error::FetchError;
use crate::fetch::FeedSource;
use crate::reconciler::FeedReconciler;
use crate::schedule::{SegmentIndex, StaticScheduleIndex};
use crate::storage::{DataLayout, ObjectStore, TrajectorySink};

/// How often the scheduler checks whether aggregation is due.
pub const SCHEDULE_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Receiving half of the shutdown signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Creates the shutdown signal; send `true` to stop every loop.
pub fn shutdown_channel() -> (watch::Sender<bool>, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (tx, Shutdown { rx })
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleeps for `duration` unless shutdown arrives first. Returns `true`
    /// when woken by shutdown; a dropped sender counts as shutdown.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.rx.wait_for(|stop| *stop) => true,
        }
    }
}

/// Polls `source` until shutdown or a fatal fetch error.
#[tracing::instrument(skip_all, fields(provider = %reconciler.provider()))]
pub async fn run_collector<S, F>(
    mut reconciler: FeedReconciler<S>,
    source: F,
    mut shutdown: Shutdown,
) -> Result<(), FetchError>
where
    S: TrajectorySink,
    F: FeedSource,
{
    info!("Collector started");
    while !shutdown.is_triggered() {
        reconciler.poll(&source).await?;
        if shutdown.sleep(reconciler.poll_interval()).await {
            break;
        }
    }
    info!(active = reconciler.len(), "Collector stopped, dropping live entities");
    Ok(())
}

/// Once-a-day trigger at a fixed local hour.
#[derive(Debug, Clone)]
pub struct DailySchedule {
    hour: u32,
    last_run: Option<NaiveDate>,
}

impl DailySchedule {
    pub fn new(hour: u32) -> Self {
        Self {
            hour,
            last_run: None,
        }
    }

    /// Returns the date to aggregate (the day before `now`) the first time it
    /// is called during the configured hour of a given day.
    pub fn due(&mut self, now: NaiveDateTime) -> Option<NaiveDate> {
        let today = now.date();
        if now.hour() != self.hour || self.last_run == Some(today) {
            return None;
        }
        self.last_run = Some(today);
        today.pred_opt()
    }
}

/// Everything the scheduler needs to build an aggregator per agency.
pub struct AggregationJob {
    pub layout: DataLayout,
    pub config: AggregationConfig,
    pub upload: Option<(Arc<dyn ObjectStore>, String)>,
    pub agencies: Vec<String>,
}

impl AggregationJob {
    /// Aggregator for `agency`, with segment matching when enabled and an
    /// index can be loaded.
    pub fn aggregator(&self, agency: &str) -> TrajectoryAggregator {
        let mut aggregator = TrajectoryAggregator::new(self.layout.clone());
        if self.config.segment_matching {
            if let Some(index) = load_segment_index(&self.config, &self.layout, agency) {
                aggregator = aggregator.with_index(index);
            }
        }
        if let Some((store, bucket)) = &self.upload {
            aggregator = aggregator.with_upload(store.clone(), bucket.clone());
        }
        aggregator
    }

    pub fn options(&self) -> AggregateOptions {
        AggregateOptions {
            delete_after_upload: self.config.delete_after_upload,
            delete_raw_files: self.config.delete_raw_files,
        }
    }

    /// Aggregates `date` for every agency; failures are logged.
    pub async fn run_for(&self, date: NaiveDate) {
        for agency in &self.agencies {
            let scope = AggregateScope::day(agency.clone(), date.into());
            match self.aggregator(agency).aggregate_all(&scope, self.options()).await {
                Ok((succeeded, failed)) => {
                    info!(agency = %agency, %date, succeeded, failed, "Daily aggregation finished")
                }
                Err(e) => error!(agency = %agency, %date, error = %e, "Daily aggregation failed"),
            }
        }
    }
}

/// Loads the agency's segment index from its cache, building it from GTFS
/// static files when needed. Failures disable matching.
pub fn load_segment_index(
    config: &AggregationConfig,
    layout: &DataLayout,
    agency: &str,
) -> Option<Arc<dyn StaticScheduleIndex>> {
    let cache = config
        .segment_index_path
        .clone()
        .unwrap_or_else(|| layout.segment_index_path(agency));

    match SegmentIndex::load_or_build(&cache, config.gtfs_static_path.as_deref()) {
        Ok(Some(index)) => {
            let index: Arc<dyn StaticScheduleIndex> = Arc::new(index);
            Some(index)
        }
        Ok(None) => {
            warn!(agency, "No segment index available, segment matching disabled");
            None
        }
        Err(e) => {
            warn!(agency, error = %e, "Failed to load segment index, segment matching disabled");
            None
        }
    }
}

/// Runs `job` once a day for the previous day until shutdown.
#[tracing::instrument(skip_all, fields(hour = job.config.hour))]
pub async fn run_scheduler(job: AggregationJob, mut shutdown: Shutdown) {
    let mut schedule = DailySchedule::new(job.config.hour);
    info!(agencies = ?job.agencies, "Aggregation scheduler started");

    while !shutdown.is_triggered() {
        if let Some(date) = schedule.due(Local::now().naive_local()) {
            info!(%date, "Running daily aggregation");
            job.run_for(date).await;
        }
        if shutdown.sleep(SCHEDULE_CHECK_INTERVAL).await {
            break;
        }
    }
    info!("Aggregation scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconcilerConfig;
    use crate::entity::tests::record;
    use crate::record::VehicleUpdateRecord;
    use crate::storage::{LocalTrajectoryStore, PartitionDate};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(date: (i32, u32, u32), hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(date.0, date.1, date.2)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn test_schedule_fires_once_per_day_for_previous_day() {
        let mut schedule = DailySchedule::new(2);
        assert_eq!(schedule.due(at((2025, 3, 8), 1, 55)), None);
        assert_eq!(
            schedule.due(at((2025, 3, 8), 2, 0)),
            NaiveDate::from_ymd_opt(2025, 3, 7)
        );
        assert_eq!(schedule.due(at((2025, 3, 8), 2, 5)), None);
        assert_eq!(schedule.due(at((2025, 3, 8), 3, 0)), None);
        assert_eq!(
            schedule.due(at((2025, 3, 9), 2, 30)),
            NaiveDate::from_ymd_opt(2025, 3, 8)
        );
    }

    /// Returns one fresh position per call, then fails fatally.
    struct CountingFeed {
        calls: AtomicUsize,
        limit: usize,
    }

    #[async_trait]
    impl FeedSource for CountingFeed {
        async fn fetch_snapshot(&self) -> Result<Vec<VehicleUpdateRecord>, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n >= self.limit {
                return Err(FetchError::Unrecoverable("connection refused".into()));
            }
            Ok(vec![record("v1", 0, 1_000 + 30 * n as u64)])
        }
    }

    #[tokio::test]
    async fn test_collector_stops_on_fatal_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReconcilerConfig {
            poll_interval: Duration::from_millis(1),
            ..Default::default()
        };
        let sink = LocalTrajectoryStore::new(DataLayout::new(dir.path()), "MBTA");
        let reconciler = FeedReconciler::new("MBTA", config, sink);
        let feed = CountingFeed {
            calls: AtomicUsize::new(0),
            limit: 3,
        };
        let (_tx, shutdown) = shutdown_channel();

        let err = run_collector(reconciler, feed, shutdown).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_collector_exits_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LocalTrajectoryStore::new(DataLayout::new(dir.path()), "MBTA");
        let reconciler = FeedReconciler::new("MBTA", ReconcilerConfig::default(), sink);
        let feed = CountingFeed {
            calls: AtomicUsize::new(0),
            limit: usize::MAX,
        };
        let (tx, shutdown) = shutdown_channel();

        let handle = tokio::spawn(run_collector(reconciler, feed, shutdown));
        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_job_runs_previous_day_for_each_agency() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        let date = PartitionDate::new(2025, 3, 7);
        for agency in ["MBTA", "CTA"] {
            let store = LocalTrajectoryStore::new(layout.clone(), agency);
            let mut entity = crate::entity::PositionEntity::create(&record("v1", 0, 1_000));
            entity.append(&record("v1", 0, 1_030));
            store.save("57", date, &entity.serialize()).unwrap();
        }

        let job = AggregationJob {
            layout: layout.clone(),
            config: AggregationConfig::default(),
            upload: None,
            agencies: vec!["MBTA".to_string(), "CTA".to_string()],
        };
        job.run_for(NaiveDate::from_ymd_opt(2025, 3, 7).unwrap()).await;

        for agency in ["MBTA", "CTA"] {
            let merged = layout
                .day_dir(agency, crate::storage::Partition::Aggregated, "57", date)
                .join(crate::aggregator::AGGREGATED_FILE);
            assert!(merged.exists(), "{agency} not aggregated");
            let raw = layout.day_dir(agency, crate::storage::Partition::Raw, "57", date);
            assert_eq!(std::fs::read_dir(raw).unwrap().count(), 0);
        }
    }
}
