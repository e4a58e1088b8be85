//! Daily merge of persisted trajectories.
//!
//! Each route/day partition under `raw/` is folded into one
//! `aggregated.mfjson` (and, with a segment index, one `segment_stats.json`),
//! optionally shipped to object storage, after which the consumed raw files
//! may be removed.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::AggregationError;
use crate::matcher::{SegmentMatcher, SegmentStatistics};
use crate::schedule::StaticScheduleIndex;
use crate::storage::{
    DataLayout, ObjectStore, Partition, PartitionDate, TRAJECTORY_EXT, parse_partition_segment,
    write_json_file,
};
use crate::trajectory::{TrajectoryCollection, TrajectoryFeature};

pub const AGGREGATED_FILE: &str = "aggregated.mfjson";
pub const SEGMENT_STATS_FILE: &str = "segment_stats.json";
const CONTENT_TYPE: &str = "application/json";

/// Which partitions `aggregate_all` visits. `None` means no filter.
#[derive(Debug, Clone, Default)]
pub struct AggregateScope {
    pub agency: Option<String>,
    pub route_id: Option<String>,
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub day: Option<u32>,
}

impl AggregateScope {
    /// Scope covering exactly one agency and date, all routes.
    pub fn day(agency: impl Into<String>, date: PartitionDate) -> Self {
        Self {
            agency: Some(agency.into()),
            route_id: None,
            year: Some(date.year),
            month: Some(date.month),
            day: Some(date.day),
        }
    }

    fn includes(&self, date: &PartitionDate) -> bool {
        self.year.is_none_or(|y| y == date.year)
            && self.month.is_none_or(|m| m == date.month)
            && self.day.is_none_or(|d| d == date.day)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AggregateOptions {
    /// Remove the local merged file once it is uploaded.
    pub delete_after_upload: bool,
    /// Remove consumed raw files once the day is safely persisted.
    pub delete_raw_files: bool,
}

/// Result of merging one route/day partition.
#[derive(Debug)]
pub struct DayAggregate {
    pub collection: TrajectoryCollection,
    /// Raw files whose features went into `collection`.
    pub sources: Vec<PathBuf>,
    pub segment_stats: Option<SegmentStatistics>,
}

struct Upload {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

pub struct TrajectoryAggregator {
    layout: DataLayout,
    index: Option<Arc<dyn StaticScheduleIndex>>,
    upload: Option<Upload>,
}

impl TrajectoryAggregator {
    pub fn new(layout: DataLayout) -> Self {
        Self {
            layout,
            index: None,
            upload: None,
        }
    }

    /// Enables segment matching and statistics.
    pub fn with_index(mut self, index: Arc<dyn StaticScheduleIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Ships artifacts to `bucket` after they are written locally.
    pub fn with_upload(mut self, store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        self.upload = Some(Upload {
            store,
            bucket: bucket.into(),
        });
        self
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    /// Lists, per route, every partition date present under the agency's
    /// `raw` tree. Hidden entries and malformed partition names are skipped.
    pub fn find_date_ranges(
        &self,
        agency: &str,
        route_filter: Option<&str>,
    ) -> Result<BTreeMap<String, BTreeSet<PartitionDate>>> {
        let mut ranges: BTreeMap<String, BTreeSet<PartitionDate>> = BTreeMap::new();
        let raw = self.layout.partition_root(agency, Partition::Raw);
        if !raw.is_dir() {
            return Ok(ranges);
        }

        for route in visible_dirs(&raw)? {
            if route_filter.is_some_and(|r| r != route) {
                continue;
            }
            let route_dir = raw.join(&route);

            for year_name in visible_dirs(&route_dir)? {
                let Some(year) = parse_partition_segment(&year_name, "Year")
                    .and_then(|y| i32::try_from(y).ok())
                else {
                    continue;
                };
                let year_dir = route_dir.join(&year_name);

                for month_name in visible_dirs(&year_dir)? {
                    let Some(month) = parse_partition_segment(&month_name, "Month") else {
                        continue;
                    };
                    let month_dir = year_dir.join(&month_name);

                    for day_name in visible_dirs(&month_dir)? {
                        if let Some(day) = parse_partition_segment(&day_name, "Day") {
                            ranges
                                .entry(route.clone())
                                .or_default()
                                .insert(PartitionDate::new(year, month, day));
                        }
                    }
                }
            }
        }

        Ok(ranges)
    }

    /// Merges every trajectory file of one route/day. Returns `None` when the
    /// partition holds no valid features.
    #[tracing::instrument(skip(self, date), fields(%date))]
    pub fn aggregate_day(
        &self,
        agency: &str,
        route_id: &str,
        date: PartitionDate,
    ) -> Result<Option<DayAggregate>> {
        let dir = self.layout.day_dir(agency, Partition::Raw, route_id, date);
        if !dir.is_dir() {
            debug!(path = %dir.display(), "Partition not found");
            return Ok(None);
        }

        let mut files: Vec<PathBuf> = fs::read_dir(&dir)
            .with_context(|| format!("failed to list {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == TRAJECTORY_EXT))
            .collect();
        files.sort();

        let mut matcher = self.index.as_deref().map(|index| SegmentMatcher::new(index));
        let mut features: Vec<TrajectoryFeature> = Vec::new();
        let mut sources = Vec::with_capacity(files.len());

        for path in files {
            let collection = match load_collection(&path) {
                Ok(c) => c,
                Err(e) => {
                    error!(error = %e, "Skipping trajectory file");
                    continue;
                }
            };

            let mut batch = collection.features;
            if let Some(matcher) = matcher.as_mut() {
                for feature in &mut batch {
                    matcher.match_trajectory(feature);
                }
            }
            features.extend(batch);
            sources.push(path);
        }

        if features.is_empty() {
            debug!(path = %dir.display(), "No features to aggregate");
            return Ok(None);
        }

        info!(
            agency,
            route_id,
            trajectories = features.len(),
            files = sources.len(),
            "Aggregated trajectories"
        );

        let segment_stats = matcher.map(|m| {
            let coverage = m.coverage();
            info!(
                coverage_pct = coverage.coverage_pct,
                matched = coverage.matched,
                null = coverage.null,
                "Segment matching"
            );
            m.compute_segment_statistics(&features, &date.to_string(), agency)
        });

        Ok(Some(DayAggregate {
            collection: TrajectoryCollection::merged(features),
            sources,
            segment_stats,
        }))
    }

    /// Aggregates every partition in `scope`. Returns `(succeeded, failed)`
    /// day counts; days without data count as neither.
    #[tracing::instrument(skip_all)]
    pub async fn aggregate_all(
        &self,
        scope: &AggregateScope,
        options: AggregateOptions,
    ) -> Result<(usize, usize)> {
        info!(
            data_dir = %self.layout.root().display(),
            agency = scope.agency.as_deref(),
            route_id = scope.route_id.as_deref(),
            year = scope.year,
            month = scope.month,
            day = scope.day,
            bucket = self.upload.as_ref().map(|u| u.bucket.as_str()),
            segment_matching = self.index.is_some(),
            "Starting trajectory aggregation"
        );

        let agencies = match &scope.agency {
            Some(agency) => vec![agency.clone()],
            None if self.layout.root().is_dir() => visible_dirs(self.layout.root())?,
            None => Vec::new(),
        };
        if agencies.is_empty() {
            warn!("No agencies found");
            return Ok((0, 0));
        }

        let (mut succeeded, mut failed) = (0, 0);
        for agency in &agencies {
            let ranges = self.find_date_ranges(agency, scope.route_id.as_deref())?;
            if ranges.is_empty() {
                info!(agency = %agency, "No routes found");
                continue;
            }

            for (route_id, dates) in &ranges {
                for date in dates.iter().filter(|d| scope.includes(d)) {
                    let day = match self.aggregate_day(agency, route_id, *date) {
                        Ok(Some(day)) => day,
                        Ok(None) => continue,
                        Err(e) => {
                            error!(agency = %agency, route_id = %route_id, %date, error = %e, "Aggregation failed");
                            failed += 1;
                            continue;
                        }
                    };

                    if self.publish_day(agency, route_id, *date, day, options).await {
                        succeeded += 1;
                    } else {
                        failed += 1;
                    }
                }
            }
        }

        if failed > 0 {
            error!(succeeded, failed, "Aggregation complete with failures");
        } else {
            info!(succeeded, "Aggregation complete");
        }
        Ok((succeeded, failed))
    }

    /// Writes, uploads and cleans up one day. Returns whether the merged
    /// artifact is safely persisted.
    async fn publish_day(
        &self,
        agency: &str,
        route_id: &str,
        date: PartitionDate,
        day: DayAggregate,
        options: AggregateOptions,
    ) -> bool {
        if let Some(stats) = &day.segment_stats {
            let path = self
                .layout
                .day_dir(agency, Partition::SegmentStats, route_id, date)
                .join(SEGMENT_STATS_FILE);
            match write_json_file(&path, stats) {
                Ok(body) => {
                    debug!(path = %path.display(), "Saved segment statistics");
                    if let Err(e) = self.upload(&path, body).await {
                        error!(error = %e, "Failed to upload segment statistics");
                    }
                }
                Err(e) => error!(error = %e, "Failed to save segment statistics"),
            }
        }

        let path = self
            .layout
            .day_dir(agency, Partition::Aggregated, route_id, date)
            .join(AGGREGATED_FILE);
        let body = match write_json_file(&path, &day.collection) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Failed to save aggregated trajectories");
                return false;
            }
        };
        debug!(path = %path.display(), "Saved aggregated trajectories");

        match self.upload(&path, body).await {
            Ok(false) => {}
            Ok(true) => {
                if options.delete_after_upload {
                    if let Err(e) = fs::remove_file(&path) {
                        error!(path = %path.display(), error = %e, "Failed to delete uploaded file");
                        return false;
                    }
                    debug!(path = %path.display(), "Deleted local file after upload");
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to upload aggregated trajectories");
                return false;
            }
        }

        if options.delete_raw_files {
            info!(files = day.sources.len(), "Deleting raw files");
            for source in &day.sources {
                if let Err(e) = fs::remove_file(source) {
                    error!(path = %source.display(), error = %e, "Failed to delete raw file");
                }
            }
        }
        true
    }

    /// Uploads `body` under the key for `path`. `Ok(false)` when no bucket
    /// is configured.
    async fn upload(&self, path: &Path, body: Vec<u8>) -> Result<bool, crate::error::UploadError> {
        let Some(upload) = &self.upload else {
            return Ok(false);
        };
        let key = self.layout.object_key(path);
        upload
            .store
            .put_object(&upload.bucket, &key, body, CONTENT_TYPE)
            .await?;
        info!(bucket = %upload.bucket, key = %key, "Uploaded to S3");
        Ok(true)
    }
}

fn load_collection(path: &Path) -> Result<TrajectoryCollection, AggregationError> {
    let bytes = fs::read(path).map_err(|source| AggregationError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| AggregationError::InvalidFormat {
        path: path.to_path_buf(),
        source,
    })
}

/// Sorted names of non-hidden subdirectories of `dir`.
fn visible_dirs(dir: &Path) -> Result<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();
    Ok(names)
}
