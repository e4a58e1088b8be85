use chrono::{Datelike, NaiveDate};
use std::fmt;
use std::path::{Path, PathBuf};

/// `Year=/Month=/Day=` partition key. Kept as plain integers because
/// discovery must not reject directory names that are not real dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionDate {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl PartitionDate {
    pub fn new(year: i32, month: u32, day: u32) -> Self {
        Self { year, month, day }
    }

    /// Relative directory for this date, e.g. `Year=2025/Month=03/Day=07`.
    pub fn relative_dir(&self) -> PathBuf {
        PathBuf::from(format!("Year={}", self.year))
            .join(format!("Month={:02}", self.month))
            .join(format!("Day={:02}", self.day))
    }
}

impl From<NaiveDate> for PartitionDate {
    fn from(date: NaiveDate) -> Self {
        Self::new(date.year(), date.month(), date.day())
    }
}

impl fmt::Display for PartitionDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

/// Artifact families stored under each agency directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Raw,
    Aggregated,
    SegmentStats,
}

impl Partition {
    fn dir_name(self) -> &'static str {
        match self {
            Partition::Raw => "raw",
            Partition::Aggregated => "aggregated",
            Partition::SegmentStats => "segment_stats",
        }
    }
}

/// Directory layout rooted at the data directory:
/// `<root>/<agency>/<partition>/<route>/Year=YYYY/Month=MM/Day=DD/`.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn agency_dir(&self, agency: &str) -> PathBuf {
        self.root.join(agency)
    }

    pub fn partition_root(&self, agency: &str, partition: Partition) -> PathBuf {
        self.agency_dir(agency).join(partition.dir_name())
    }

    pub fn day_dir(
        &self,
        agency: &str,
        partition: Partition,
        route_id: &str,
        date: PartitionDate,
    ) -> PathBuf {
        self.partition_root(agency, partition)
            .join(route_id)
            .join(date.relative_dir())
    }

    /// Default location of the cached segment index for an agency.
    pub fn segment_index_path(&self, agency: &str) -> PathBuf {
        self.agency_dir(agency).join("gtfs_static").join("segments.json")
    }

    /// Object key for a file under the root: its relative path with `/` separators.
    pub fn object_key(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Parses a `Key=value` directory name with the expected key.
pub fn parse_partition_segment(name: &str, key: &str) -> Option<u32> {
    let (k, v) = name.split_once('=')?;
    if k != key {
        return None;
    }
    v.parse().ok()
}
