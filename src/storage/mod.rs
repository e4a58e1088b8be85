//! Local persistence of trajectories and aggregate artifacts, plus the
//! object-storage seam used to ship them.

mod partition;
mod s3;

pub use partition::{DataLayout, Partition, PartitionDate, parse_partition_segment};
pub use s3::{ObjectStore, S3Store};

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::PersistenceError;
use crate::trajectory::TrajectoryCollection;

/// Extension used for every MF-JSON artifact.
pub const TRAJECTORY_EXT: &str = "mfjson";

/// Suffix of trajectory files still being written.
const STAGING_EXT: &str = "tmp";

/// Route directory used when a trajectory carries no route id.
pub const UNKNOWN_ROUTE: &str = "unknown";

/// Destination for finalized trajectories.
pub trait TrajectorySink: Send {
    /// Persists one finalized trajectory and returns where it was written.
    fn save(
        &self,
        route_id: &str,
        date: PartitionDate,
        record: &TrajectoryCollection,
    ) -> Result<PathBuf, PersistenceError>;
}

/// Writes each trajectory to its own uniquely named file under the agency's
/// `raw` partition.
#[derive(Debug, Clone)]
pub struct LocalTrajectoryStore {
    layout: DataLayout,
    agency: String,
}

impl LocalTrajectoryStore {
    pub fn new(layout: DataLayout, agency: impl Into<String>) -> Self {
        Self {
            layout,
            agency: agency.into(),
        }
    }
}

impl TrajectorySink for LocalTrajectoryStore {
    fn save(
        &self,
        route_id: &str,
        date: PartitionDate,
        record: &TrajectoryCollection,
    ) -> Result<PathBuf, PersistenceError> {
        let dir = self.layout.day_dir(&self.agency, Partition::Raw, route_id, date);
        fs::create_dir_all(&dir).map_err(|source| PersistenceError::Io {
            path: dir.clone(),
            source,
        })?;

        let path = dir.join(format!("{}.{}", uuid::Uuid::new_v4(), TRAJECTORY_EXT));
        let body = serde_json::to_vec_pretty(record).map_err(|source| {
            PersistenceError::Serialize {
                entity_id: record
                    .features
                    .first()
                    .map(|f| f.properties.entity_id.clone())
                    .unwrap_or_default(),
                source,
            }
        })?;
        // Published by rename so the aggregator never reads a partial file.
        let staging = path.with_extension(format!("{TRAJECTORY_EXT}.{STAGING_EXT}"));
        fs::write(&staging, body).map_err(|source| PersistenceError::Io {
            path: staging.clone(),
            source,
        })?;
        fs::rename(&staging, &path).map_err(|source| PersistenceError::Io {
            path: path.clone(),
            source,
        })?;

        debug!(path = %path.display(), route_id, %date, "Trajectory written");
        Ok(path)
    }
}

/// Serializes `value` as pretty JSON to `path`, creating parent directories.
/// Returns the bytes written.
pub fn write_json_file(path: &Path, value: &impl Serialize) -> Result<Vec<u8>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let body = serde_json::to_vec_pretty(value)?;
    fs::write(path, &body).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(body)
}
