use serde::Serialize;
use std::collections::BTreeMap;

const OCCUPANCY_STATUS_NAMES: [&str; 7] = [
    "EMPTY",
    "MANY_SEATS_AVAILABLE",
    "FEW_SEATS_AVAILABLE",
    "STANDING_ROOM_ONLY",
    "CRUSHED_STANDING_ROOM_ONLY",
    "FULL",
    "NOT_ACCEPTING_PASSENGERS",
];

/// GTFS-RT occupancy status name, `UNKNOWN_<code>` outside the enum.
pub fn status_name(code: i64) -> String {
    usize::try_from(code)
        .ok()
        .and_then(|i| OCCUPANCY_STATUS_NAMES.get(i))
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("UNKNOWN_{code}"))
}

/// Segment statistics for one route/day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentStatistics {
    pub date: String,
    pub agency: String,
    pub route_id: Option<String>,
    pub direction_id: Option<u32>,
    pub segments: Vec<SegmentStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentStats {
    pub segment_id: String,
    pub route_id: Option<String>,
    pub direction_id: Option<u32>,
    pub from_stop_name: Option<String>,
    pub to_stop_name: Option<String>,
    pub observations: usize,
    pub trips: usize,
    pub occupancy_stats: OccupancyStats,
    pub temporal_patterns: BTreeMap<String, HourlyPattern>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OccupancyStats {
    #[serde(flatten)]
    pub percentage: Option<PercentageStats>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub distribution: BTreeMap<String, usize>,
}

/// Occupancy fraction summary, values in `0.0..=1.0`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PercentageStats {
    pub mode: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
}

impl PercentageStats {
    /// Summarizes raw percentages; values above 1 are taken as 0-100 and
    /// scaled down. `None` for an empty slice.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let mut sorted: Vec<f64> = values
            .iter()
            .map(|&v| if v > 1.0 { v / 100.0 } else { v })
            .collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(f64::total_cmp);

        let len = sorted.len();
        let max = sorted[len - 1];
        let p95 = if len > 20 {
            sorted[((len as f64) * 0.95) as usize]
        } else {
            max
        };

        Some(Self {
            mode: mode_sorted(&sorted),
            median: sorted[len / 2],
            min: sorted[0],
            max,
            p95,
        })
    }
}

/// Most frequent value of a sorted slice, ties going to the smallest.
fn mode_sorted(sorted: &[f64]) -> f64 {
    let mut best = (0usize, 0.0);
    let mut i = 0;
    while i < sorted.len() {
        let value = sorted[i];
        let run = sorted[i..].iter().take_while(|&&v| v == value).count();
        if run > best.0 {
            best = (run, value);
        }
        i += run;
    }
    best.1
}

/// Occupancy status summary for one hour of the day.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyPattern {
    pub mode_status: String,
    pub min_status: String,
    pub max_status: String,
    pub distribution: BTreeMap<String, usize>,
    pub observations: usize,
}

impl HourlyPattern {
    /// `None` for an empty bucket.
    pub fn from_statuses(statuses: &[i64]) -> Option<Self> {
        let mut counts: BTreeMap<i64, usize> = BTreeMap::new();
        for &s in statuses {
            *counts.entry(s).or_default() += 1;
        }

        let (&min, _) = counts.first_key_value()?;
        let (&max, _) = counts.last_key_value()?;
        // BTreeMap iterates ascending, so the first maximum is the smallest code
        let mut mode = (min, 0usize);
        for (&code, &n) in &counts {
            if n > mode.1 {
                mode = (code, n);
            }
        }

        Some(Self {
            mode_status: status_name(mode.0),
            min_status: status_name(min),
            max_status: status_name(max),
            distribution: status_distribution(statuses),
            observations: statuses.len(),
        })
    }
}

pub fn status_distribution(statuses: &[i64]) -> BTreeMap<String, usize> {
    let mut distribution = BTreeMap::new();
    for &s in statuses {
        *distribution.entry(status_name(s)).or_default() += 1;
    }
    distribution
}

pub fn hour_bucket(hour: u32) -> String {
    format!("{hour:02}:00-{:02}:00", hour + 1)
}
