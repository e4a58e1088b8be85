//! Static schedule lookups used by segment matching.
//!
//! A [`SegmentIndex`] holds, per route and direction, the consecutive stop
//! pairs of that pattern's canonical trip. It is built from an extracted GTFS
//! static directory or loaded from a JSON cache.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::storage::write_json_file;

/// One stop-to-stop leg of a route pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub segment_id: String,
    pub route_id: String,
    pub direction_id: u32,
    pub from_stop_id: String,
    pub to_stop_id: String,
    pub from_stop_sequence: u32,
    pub to_stop_sequence: u32,
    pub from_stop_name: String,
    pub to_stop_name: String,
    pub segment_order: usize,
}

impl Segment {
    pub fn make_id(route_id: &str, direction_id: u32, from: u32, to: u32) -> String {
        format!("{route_id}_{direction_id}_{from}-{to}")
    }
}

/// Read-only lookup from a stop-sequence pair to its segment.
pub trait StaticScheduleIndex: Send + Sync {
    fn find_segment(
        &self,
        route_id: &str,
        direction_id: u32,
        from_seq: u32,
        to_seq: u32,
    ) -> Option<&Segment>;
}

#[derive(Debug, Deserialize)]
struct TripRow {
    route_id: String,
    trip_id: String,
    #[serde(default)]
    direction_id: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct StopTimeRow {
    trip_id: String,
    stop_id: String,
    stop_sequence: u32,
}

#[derive(Debug, Deserialize)]
struct StopRow {
    stop_id: String,
    #[serde(default)]
    stop_name: Option<String>,
}

/// Segments keyed by route id, then direction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentIndex {
    routes: BTreeMap<String, BTreeMap<u32, Vec<Segment>>>,
}

impl SegmentIndex {
    pub fn from_segments(segments: impl IntoIterator<Item = Segment>) -> Self {
        let mut routes: BTreeMap<String, BTreeMap<u32, Vec<Segment>>> = BTreeMap::new();
        for segment in segments {
            routes
                .entry(segment.route_id.clone())
                .or_default()
                .entry(segment.direction_id)
                .or_default()
                .push(segment);
        }
        Self { routes }
    }

    /// Builds the index from `trips.txt`, `stop_times.txt` and `stops.txt`
    /// in `dir`.
    ///
    /// The canonical pattern of a route/direction is the trip with the most
    /// stop times, ties going to the smallest trip id. Trips without a
    /// direction are ignored.
    pub fn from_gtfs_dir(dir: &Path) -> Result<Self> {
        info!(path = %dir.display(), "Building segment index from GTFS static files");

        let trips: Vec<TripRow> = read_table(&dir.join("trips.txt"))?;
        let stop_times: Vec<StopTimeRow> = read_table(&dir.join("stop_times.txt"))?;
        let stops: Vec<StopRow> = read_table(&dir.join("stops.txt"))?;

        let names: HashMap<String, String> = stops
            .into_iter()
            .filter_map(|s| {
                let name = s.stop_name.filter(|n| !n.is_empty())?;
                Some((s.stop_id, name))
            })
            .collect();

        let trip_keys: HashMap<&str, (&str, u32)> = trips
            .iter()
            .filter_map(|t| Some((t.trip_id.as_str(), (t.route_id.as_str(), t.direction_id?))))
            .collect();

        let mut by_trip: HashMap<&str, Vec<&StopTimeRow>> = HashMap::new();
        for row in &stop_times {
            if trip_keys.contains_key(row.trip_id.as_str()) {
                by_trip.entry(row.trip_id.as_str()).or_default().push(row);
            }
        }

        // (route, direction) -> (stop count, trip id) of the current canonical trip
        let mut canonical: BTreeMap<(&str, u32), (usize, &str)> = BTreeMap::new();
        for (trip_id, rows) in &by_trip {
            let Some(&key) = trip_keys.get(trip_id) else {
                continue;
            };
            let candidate = (rows.len(), *trip_id);
            canonical
                .entry(key)
                .and_modify(|best| {
                    if candidate.0 > best.0 || (candidate.0 == best.0 && candidate.1 < best.1) {
                        *best = candidate;
                    }
                })
                .or_insert(candidate);
        }

        let stop_name = |id: &str| names.get(id).cloned().unwrap_or_else(|| id.to_string());
        let mut segments = Vec::new();
        for ((route_id, direction_id), (_, trip_id)) in canonical {
            let mut rows = by_trip.get(trip_id).cloned().unwrap_or_default();
            rows.sort_by_key(|r| r.stop_sequence);

            for (order, pair) in rows.windows(2).enumerate() {
                let (from, to) = (pair[0], pair[1]);
                segments.push(Segment {
                    segment_id: Segment::make_id(
                        route_id,
                        direction_id,
                        from.stop_sequence,
                        to.stop_sequence,
                    ),
                    route_id: route_id.to_string(),
                    direction_id,
                    from_stop_id: from.stop_id.clone(),
                    to_stop_id: to.stop_id.clone(),
                    from_stop_sequence: from.stop_sequence,
                    to_stop_sequence: to.stop_sequence,
                    from_stop_name: stop_name(&from.stop_id),
                    to_stop_name: stop_name(&to.stop_id),
                    segment_order: order,
                });
            }
        }

        let index = Self::from_segments(segments);
        info!(
            routes = index.route_count(),
            segments = index.segment_count(),
            "Built segment index"
        );
        Ok(index)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let index: Self = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("invalid segment index {}", path.display()))?;
        info!(
            path = %path.display(),
            routes = index.route_count(),
            segments = index.segment_count(),
            "Loaded segment index"
        );
        Ok(index)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_file(path, self)?;
        info!(path = %path.display(), "Saved segment index");
        Ok(())
    }

    /// Loads `cache` when it exists, otherwise builds from `gtfs_dir` and
    /// writes the cache. Returns `None` when neither source is available.
    pub fn load_or_build(cache: &Path, gtfs_dir: Option<&Path>) -> Result<Option<Self>> {
        if cache.exists() {
            return Self::load(cache).map(Some);
        }

        let Some(dir) = gtfs_dir else {
            warn!(cache = %cache.display(), "No segment index cache and no GTFS static path");
            return Ok(None);
        };

        let index = Self::from_gtfs_dir(dir)?;
        if let Err(e) = index.save(cache) {
            warn!(error = %e, "Failed to cache segment index");
        }
        Ok(Some(index))
    }

    pub fn segments(&self, route_id: &str, direction_id: u32) -> &[Segment] {
        self.routes
            .get(route_id)
            .and_then(|dirs| dirs.get(&direction_id))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn segment_count(&self) -> usize {
        self.routes
            .values()
            .flat_map(|dirs| dirs.values())
            .map(Vec::len)
            .sum()
    }
}

impl StaticScheduleIndex for SegmentIndex {
    fn find_segment(
        &self,
        route_id: &str,
        direction_id: u32,
        from_seq: u32,
        to_seq: u32,
    ) -> Option<&Segment> {
        self.segments(route_id, direction_id)
            .iter()
            .find(|s| s.from_stop_sequence == from_seq && s.to_stop_sequence == to_seq)
    }
}

fn read_table<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(file);

    let mut rows = Vec::new();
    for result in rdr.deserialize() {
        let row: T = result.with_context(|| format!("invalid row in {}", path.display()))?;
        rows.push(row);
    }
    debug!(path = %path.display(), rows = rows.len(), "Read GTFS table");
    Ok(rows)
}
