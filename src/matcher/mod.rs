//! Assigns schedule segments to trajectory observations and summarizes
//! occupancy per segment.
//!
//! `current_stop_sequence` names the stop a vehicle is approaching, so an
//! observation with sequence `N` sits on the segment `N-1 -> N`.

mod stats;

pub use stats::{
    HourlyPattern, OccupancyStats, PercentageStats, SegmentStatistics, SegmentStats,
    hour_bucket, status_distribution, status_name,
};

use chrono::Timelike;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

use crate::reconciler::pct;
use crate::schedule::StaticScheduleIndex;
use crate::timestamp::parse_timestamp;
use crate::trajectory::{Measure, TrajectoryFeature};

/// Name of the measure attached by [`SegmentMatcher::match_trajectory`].
pub const SEGMENT_MEASURE: &str = "segment_id";

/// Running matched/unmatched observation counts.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct MatchCoverage {
    pub matched: usize,
    pub null: usize,
    pub total: usize,
    pub coverage_pct: f64,
}

pub struct SegmentMatcher<'a> {
    index: &'a dyn StaticScheduleIndex,
    matched: usize,
    null: usize,
}

struct SegmentObservation<'f> {
    timestamp: Option<&'f str>,
    occupancy_percentage: Option<f64>,
    occupancy_status: Option<i64>,
}

struct SegmentGroup<'f> {
    route_id: Option<String>,
    direction_id: Option<u32>,
    from_stop_name: Option<String>,
    to_stop_name: Option<String>,
    observations: Vec<SegmentObservation<'f>>,
    trips: HashSet<Option<&'f str>>,
}

impl<'a> SegmentMatcher<'a> {
    pub fn new(index: &'a dyn StaticScheduleIndex) -> Self {
        Self {
            index,
            matched: 0,
            null: 0,
        }
    }

    pub fn coverage(&self) -> MatchCoverage {
        let total = self.matched + self.null;
        MatchCoverage {
            matched: self.matched,
            null: self.null,
            total,
            coverage_pct: pct(self.matched, total),
        }
    }

    /// Attaches a `segment_id` measure parallel to the feature's other
    /// measures. Returns `false`, leaving the feature untouched, when it has no
    /// route, direction or stop-sequence measure.
    pub fn match_trajectory(&mut self, feature: &mut TrajectoryFeature) -> bool {
        let (Some(route_id), Some(direction_id)) = (
            feature.properties.route_id.clone(),
            feature.properties.direction_id,
        ) else {
            warn!(
                entity_id = %feature.properties.entity_id,
                "Feature missing route_id or direction_id"
            );
            return false;
        };

        let Some(temporal) = feature.temporal_mut() else {
            warn!("Feature has no temporalProperties");
            return false;
        };

        let segment_ids: Vec<Value> = match temporal.measures.get("current_stop_sequence") {
            Some(measure) if !measure.values.is_empty() => measure
                .values
                .iter()
                .map(|v| match stop_sequence(v) {
                    Some(seq) if seq > 0 => {
                        match self.index.find_segment(&route_id, direction_id, seq - 1, seq) {
                            Some(segment) => {
                                self.matched += 1;
                                Value::String(segment.segment_id.clone())
                            }
                            None => {
                                self.null += 1;
                                Value::Null
                            }
                        }
                    }
                    _ => {
                        self.null += 1;
                        Value::Null
                    }
                })
                .collect(),
            _ => {
                warn!(route_id = %route_id, "Feature has no stop sequence data");
                return false;
            }
        };

        temporal
            .measures
            .insert(SEGMENT_MEASURE.to_string(), Measure::discrete(segment_ids));
        true
    }

    /// Groups every matched observation of `features` by segment and
    /// summarizes each group.
    pub fn compute_segment_statistics(
        &self,
        features: &[TrajectoryFeature],
        date: &str,
        agency: &str,
    ) -> SegmentStatistics {
        let mut groups: BTreeMap<String, SegmentGroup<'_>> = BTreeMap::new();

        for feature in features {
            let Some(temporal) = feature.temporal() else {
                continue;
            };
            let Some(segments) = temporal.measures.get(SEGMENT_MEASURE) else {
                continue;
            };
            let properties = &feature.properties;
            let percentages = feature.measure("occupancy_percentage");
            let statuses = feature.measure("occupancy_status");

            for (i, segment_id) in segments.values.iter().enumerate() {
                let Some(segment_id) = segment_id.as_str() else {
                    continue;
                };

                let group = groups.entry(segment_id.to_string()).or_insert_with(|| {
                    self.new_group(segment_id, properties.route_id.as_deref(), properties.direction_id)
                });
                group.observations.push(SegmentObservation {
                    timestamp: temporal.datetimes.get(i).map(String::as_str),
                    occupancy_percentage: value_at(percentages, i).and_then(Value::as_f64),
                    occupancy_status: value_at(statuses, i).and_then(Value::as_i64),
                });
                group.trips.insert(properties.trip_id.as_deref());
            }
        }

        // BTreeMap keeps segments sorted by id
        let segments: Vec<SegmentStats> = groups
            .into_iter()
            .map(|(segment_id, group)| summarize(segment_id, group))
            .collect();

        let coverage = self.coverage();
        info!(
            segments = segments.len(),
            matched = coverage.matched,
            null = coverage.null,
            "Computed segment statistics"
        );

        SegmentStatistics {
            date: date.to_string(),
            agency: agency.to_string(),
            route_id: segments.first().and_then(|s| s.route_id.clone()),
            direction_id: segments.first().and_then(|s| s.direction_id),
            segments,
        }
    }

    fn new_group<'f>(
        &self,
        segment_id: &str,
        route_id: Option<&str>,
        direction_id: Option<u32>,
    ) -> SegmentGroup<'f> {
        let segment = match (route_id, direction_id, sequence_pair(segment_id)) {
            (Some(route), Some(direction), Some((from, to))) => {
                self.index.find_segment(route, direction, from, to)
            }
            _ => None,
        };
        if segment.is_none() {
            debug!(segment_id, "No index entry for segment");
        }

        SegmentGroup {
            route_id: route_id.map(str::to_string),
            direction_id,
            from_stop_name: segment.map(|s| s.from_stop_name.clone()),
            to_stop_name: segment.map(|s| s.to_stop_name.clone()),
            observations: Vec::new(),
            trips: HashSet::new(),
        }
    }
}

fn summarize(segment_id: String, group: SegmentGroup<'_>) -> SegmentStats {
    let percentages: Vec<f64> = group
        .observations
        .iter()
        .filter_map(|o| o.occupancy_percentage)
        .collect();
    let statuses: Vec<i64> = group
        .observations
        .iter()
        .filter_map(|o| o.occupancy_status)
        .collect();

    let mut hourly: BTreeMap<u32, Vec<i64>> = BTreeMap::new();
    for obs in &group.observations {
        let (Some(ts), Some(status)) = (obs.timestamp, obs.occupancy_status) else {
            continue;
        };
        match parse_timestamp(ts) {
            Some(dt) => hourly.entry(dt.hour()).or_default().push(status),
            None => debug!(timestamp = ts, "Unparseable timestamp"),
        }
    }

    SegmentStats {
        segment_id,
        route_id: group.route_id,
        direction_id: group.direction_id,
        from_stop_name: group.from_stop_name,
        to_stop_name: group.to_stop_name,
        observations: group.observations.len(),
        trips: group.trips.len(),
        occupancy_stats: OccupancyStats {
            percentage: PercentageStats::from_values(&percentages),
            distribution: status_distribution(&statuses),
        },
        temporal_patterns: hourly
            .into_iter()
            .filter_map(|(hour, statuses)| {
                HourlyPattern::from_statuses(&statuses).map(|p| (hour_bucket(hour), p))
            })
            .collect(),
    }
}

fn value_at(measure: Option<&Measure>, i: usize) -> Option<&Value> {
    measure.and_then(|m| m.values.get(i))
}

fn stop_sequence(value: &Value) -> Option<u32> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64))
        .and_then(|v| u32::try_from(v).ok())
}

/// Extracts `(from, to)` from a `<route>_<direction>_<from>-<to>` id.
fn sequence_pair(segment_id: &str) -> Option<(u32, u32)> {
    let (_, pair) = segment_id.rsplit_once('_')?;
    let (from, to) = pair.split_once('-')?;
    Some((from.parse().ok()?, to.parse().ok()?))
}
