//! Moving-features JSON (MF-JSON) trajectory records.
//!
//! Every persisted file and every daily merge is a [`TrajectoryCollection`].
//! Deserializing into these types doubles as validation: a file whose `type`
//! is not `FeatureCollection`, or whose features lack the moving-point
//! layout, fails to parse.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionType {
    FeatureCollection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureType {
    Feature,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeometryType {
    MovingPoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasureType {
    Measure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interpolation {
    Linear,
    Discrete,
    Step,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryCollection {
    #[serde(rename = "type")]
    pub kind: CollectionType,
    pub features: Vec<TrajectoryFeature>,
}

impl TrajectoryCollection {
    pub fn new(features: Vec<TrajectoryFeature>) -> Self {
        Self {
            kind: CollectionType::FeatureCollection,
            features,
        }
    }

    /// Merges features into one collection, renumbering `trajectory_id`
    /// sequentially in input order.
    pub fn merged(mut features: Vec<TrajectoryFeature>) -> Self {
        for (idx, feature) in features.iter_mut().enumerate() {
            feature.properties.trajectory_id = idx;
        }
        Self::new(features)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrajectoryFeature {
    #[serde(rename = "type")]
    pub kind: FeatureType,
    pub temporal_geometry: MovingPoint,
    pub properties: TrajectoryProperties,
    #[serde(default)]
    pub temporal_properties: Vec<TemporalProperties>,
}

impl TrajectoryFeature {
    /// The first (and in practice only) temporal property block.
    pub fn temporal(&self) -> Option<&TemporalProperties> {
        self.temporal_properties.first()
    }

    pub fn temporal_mut(&mut self) -> Option<&mut TemporalProperties> {
        self.temporal_properties.first_mut()
    }

    pub fn measure(&self, name: &str) -> Option<&Measure> {
        self.temporal()?.measures.get(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovingPoint {
    #[serde(rename = "type")]
    pub kind: GeometryType,
    /// `[longitude, latitude]` pairs.
    pub coordinates: Vec<[f64; 2]>,
    pub datetimes: Vec<String>,
    pub interpolation: Interpolation,
}

/// Static identity of the vehicle-trip behind a trajectory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrajectoryProperties {
    pub trajectory_id: usize,
    pub entity_id: String,
    pub direction_id: Option<u32>,
    pub label: Option<String>,
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub schedule_relationship: Option<i32>,
    pub trip_start_date: Option<String>,
    pub trip_start_time: Option<String>,
    pub vehicle_id: Option<String>,
    pub vehicle_label: Option<String>,
    pub license_plate: Option<String>,
}

/// Parallel measure sequences sharing one `datetimes` axis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemporalProperties {
    pub datetimes: Vec<String>,
    #[serde(flatten)]
    pub measures: BTreeMap<String, Measure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    #[serde(rename = "type")]
    pub kind: MeasureType,
    pub values: Vec<Value>,
    pub interpolation: Interpolation,
}

impl Measure {
    pub fn new(values: Vec<Value>, interpolation: Interpolation) -> Self {
        Self {
            kind: MeasureType::Measure,
            values,
            interpolation,
        }
    }

    pub fn discrete<T: Into<Value>>(values: impl IntoIterator<Item = T>) -> Self {
        Self::new(values.into_iter().map(Into::into).collect(), Interpolation::Discrete)
    }

    pub fn linear<T: Into<Value>>(values: impl IntoIterator<Item = T>) -> Self {
        Self::new(values.into_iter().map(Into::into).collect(), Interpolation::Linear)
    }
}
