//! In-memory accumulator for one vehicle's trajectory.

use chrono::{DateTime, NaiveDate, Utc};

use crate::record::VehicleUpdateRecord;
use crate::timestamp::{format_timestamp, observation_date};
use crate::trajectory::{
    FeatureType, GeometryType, Interpolation, Measure, MovingPoint, TemporalProperties,
    TrajectoryCollection, TrajectoryFeature, TrajectoryProperties,
};

/// One accepted poll of a vehicle. Keeping the temporal attributes together
/// means every serialized sequence has the same length.
#[derive(Debug, Clone, PartialEq)]
struct Observation {
    bearing: Option<f32>,
    current_status: Option<i32>,
    odometer: Option<f64>,
    speed: Option<f32>,
    stop_id: Option<String>,
    updated_at: String,
    current_stop_sequence: Option<u32>,
    coordinates: [f64; 2],
    occupancy_status: Option<i32>,
    occupancy_percentage: Option<u32>,
    congestion_level: Option<i32>,
}

impl From<&VehicleUpdateRecord> for Observation {
    fn from(r: &VehicleUpdateRecord) -> Self {
        Self {
            bearing: r.bearing,
            current_status: r.current_status,
            odometer: r.odometer,
            speed: r.speed,
            stop_id: r.stop_id.clone(),
            updated_at: format_timestamp(r.timestamp),
            current_stop_sequence: r.current_stop_sequence,
            coordinates: [r.longitude, r.latitude],
            occupancy_status: r.occupancy_status,
            occupancy_percentage: r.occupancy_percentage,
            congestion_level: r.congestion_level,
        }
    }
}

/// Occupancy history of one carriage, recorded only on polls that report it.
#[derive(Debug, Clone, PartialEq)]
pub struct Carriage {
    pub label: String,
    pub sequence: u32,
    pub occupancy_status: Vec<Option<i32>>,
}

impl Carriage {
    fn measure_key(&self) -> String {
        format!("carriage_{}_{}", self.sequence, self.label)
    }
}

#[derive(Debug, Clone)]
pub struct PositionEntity {
    pub entity_id: String,
    pub direction_id: Option<u32>,
    pub route_id: Option<String>,
    pub trip_id: Option<String>,
    pub schedule_relationship: Option<i32>,
    pub start_date: Option<String>,
    pub start_time: Option<String>,
    pub vehicle_id: Option<String>,
    pub vehicle_label: Option<String>,
    pub license_plate: Option<String>,
    pub created: DateTime<Utc>,

    observations: Vec<Observation>,
    carriages: Vec<Carriage>,
}

impl PositionEntity {
    /// Creates an entity seeded with the record's observation.
    pub fn create(record: &VehicleUpdateRecord) -> Self {
        let mut entity = Self {
            entity_id: record.entity_id.clone(),
            direction_id: record.direction_id,
            route_id: record.route_id.clone(),
            trip_id: record.trip_id.clone(),
            schedule_relationship: record.schedule_relationship,
            start_date: record.start_date.clone(),
            start_time: record.start_time.clone(),
            vehicle_id: record.vehicle_id.clone(),
            vehicle_label: record.vehicle_label.clone(),
            license_plate: record.license_plate.clone(),
            created: Utc::now(),
            observations: Vec::new(),
            carriages: Vec::new(),
        };
        entity.append(record);
        entity
    }

    /// Appends the record's observation and any reported carriage occupancy.
    pub fn append(&mut self, record: &VehicleUpdateRecord) {
        self.observations.push(Observation::from(record));

        for reported in &record.carriages {
            match self.carriages.iter_mut().find(|c| c.label == reported.label) {
                Some(carriage) => carriage.occupancy_status.push(reported.occupancy_status),
                None => self.carriages.push(Carriage {
                    label: reported.label.clone(),
                    sequence: reported.sequence,
                    occupancy_status: vec![reported.occupancy_status],
                }),
            }
        }
    }

    pub fn observation_count(&self) -> usize {
        self.observations.len()
    }

    /// Timestamp of the most recent accepted observation.
    pub fn last_timestamp(&self) -> Option<&str> {
        self.observations.last().map(|o| o.updated_at.as_str())
    }

    /// Date of the first observation; the partition the trajectory is saved under.
    pub fn first_observation_date(&self) -> Option<NaiveDate> {
        self.observations
            .first()
            .and_then(|o| observation_date(&o.updated_at))
    }

    pub fn carriages(&self) -> &[Carriage] {
        &self.carriages
    }

    /// Serializes the trajectory as a single-feature MF-JSON collection.
    pub fn serialize(&self) -> TrajectoryCollection {
        let obs = &self.observations;
        let datetimes: Vec<String> = obs.iter().map(|o| o.updated_at.clone()).collect();

        let mut temporal = TemporalProperties {
            datetimes: datetimes.clone(),
            ..Default::default()
        };
        let measures = &mut temporal.measures;
        measures.insert("bearing".into(), Measure::linear(obs.iter().map(|o| o.bearing)));
        measures.insert(
            "current_status".into(),
            Measure::discrete(obs.iter().map(|o| o.current_status)),
        );
        measures.insert("odometer".into(), Measure::discrete(obs.iter().map(|o| o.odometer)));
        measures.insert("speed".into(), Measure::linear(obs.iter().map(|o| o.speed)));
        measures.insert(
            "stop_id".into(),
            Measure::discrete(obs.iter().map(|o| o.stop_id.clone())),
        );
        measures.insert(
            "current_stop_sequence".into(),
            Measure::discrete(obs.iter().map(|o| o.current_stop_sequence)),
        );
        measures.insert(
            "occupancy_status".into(),
            Measure::discrete(obs.iter().map(|o| o.occupancy_status)),
        );
        measures.insert(
            "occupancy_percentage".into(),
            Measure::discrete(obs.iter().map(|o| o.occupancy_percentage)),
        );
        measures.insert(
            "congestion_level".into(),
            Measure::discrete(obs.iter().map(|o| o.congestion_level)),
        );
        for carriage in &self.carriages {
            measures.insert(
                carriage.measure_key(),
                Measure::discrete(carriage.occupancy_status.iter().copied()),
            );
        }

        let feature = TrajectoryFeature {
            kind: FeatureType::Feature,
            temporal_geometry: MovingPoint {
                kind: GeometryType::MovingPoint,
                coordinates: obs.iter().map(|o| o.coordinates).collect(),
                datetimes,
                interpolation: Interpolation::Linear,
            },
            properties: TrajectoryProperties {
                trajectory_id: 0,
                entity_id: self.entity_id.clone(),
                direction_id: self.direction_id,
                label: self.vehicle_label.clone(),
                trip_id: self.trip_id.clone(),
                route_id: self.route_id.clone(),
                schedule_relationship: self.schedule_relationship,
                trip_start_date: self.start_date.clone(),
                trip_start_time: self.start_time.clone(),
                vehicle_id: self.vehicle_id.clone(),
                vehicle_label: self.vehicle_label.clone(),
                license_plate: self.license_plate.clone(),
            },
            temporal_properties: vec![temporal],
        };

        TrajectoryCollection::new(vec![feature])
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::record::CarriageRecord;

    pub(crate) fn record(id: &str, direction: u32, timestamp: u64) -> VehicleUpdateRecord {
        VehicleUpdateRecord {
            entity_id: id.to_string(),
            direction_id: Some(direction),
            route_id: Some("57".to_string()),
            trip_id: Some(format!("trip-{id}")),
            vehicle_id: Some(format!("veh-{id}")),
            vehicle_label: Some("1234".to_string()),
            longitude: -71.05,
            latitude: 42.35,
            bearing: Some(90.0),
            speed: Some(5.0),
            timestamp,
            current_stop_sequence: Some(3),
            occupancy_status: Some(1),
            occupancy_percentage: Some(20),
            ..Default::default()
        }
    }

    fn carriage(label: &str, sequence: u32, status: i32) -> CarriageRecord {
        CarriageRecord {
            label: label.to_string(),
            sequence,
            occupancy_status: Some(status),
            ..Default::default()
        }
    }

    fn sequence_lengths(collection: &TrajectoryCollection) -> Vec<usize> {
        let feature = &collection.features[0];
        let temporal = feature.temporal().unwrap();
        let mut lengths = vec![
            feature.temporal_geometry.coordinates.len(),
            feature.temporal_geometry.datetimes.len(),
            temporal.datetimes.len(),
        ];
        lengths.extend(
            temporal
                .measures
                .iter()
                .filter(|(k, _)| !k.starts_with("carriage_"))
                .map(|(_, m)| m.values.len()),
        );
        lengths
    }

    #[test]
    fn test_create_seeds_single_observation() {
        let entity = PositionEntity::create(&record("v1", 0, 1_700_000_000));
        assert_eq!(entity.entity_id, "v1");
        assert_eq!(entity.direction_id, Some(0));
        assert_eq!(entity.observation_count(), 1);
        assert_eq!(
            entity.last_timestamp(),
            Some(format_timestamp(1_700_000_000).as_str())
        );
    }

    #[test]
    fn test_temporal_sequences_stay_lock_stepped() {
        let mut entity = PositionEntity::create(&record("v1", 0, 100));
        for ts in [130, 160, 190] {
            entity.append(&record("v1", 0, ts));
            let lengths = sequence_lengths(&entity.serialize());
            assert!(lengths.iter().all(|&l| l == entity.observation_count()));
        }
        assert_eq!(entity.observation_count(), 4);
    }

    #[test]
    fn test_carriages_matched_by_label_and_may_lag() {
        let mut first = record("v1", 0, 100);
        first.carriages = vec![carriage("A", 1, 1)];
        let mut entity = PositionEntity::create(&first);

        let mut second = record("v1", 0, 130);
        second.carriages = vec![carriage("A", 1, 2), carriage("B", 2, 3)];
        entity.append(&second);

        entity.append(&record("v1", 0, 160));

        let carriages = entity.carriages();
        assert_eq!(carriages.len(), 2);
        assert_eq!(carriages[0].occupancy_status, vec![Some(1), Some(2)]);
        assert_eq!(carriages[1].occupancy_status, vec![Some(3)]);
        assert_eq!(entity.observation_count(), 3);
    }

    #[test]
    fn test_serialize_structure() {
        let mut first = record("v1", 1, 100);
        first.carriages = vec![carriage("A", 1, 4)];
        let mut entity = PositionEntity::create(&first);
        entity.append(&record("v1", 1, 130));

        let collection = entity.serialize();
        assert_eq!(collection.features.len(), 1);
        let feature = &collection.features[0];
        assert_eq!(feature.properties.trajectory_id, 0);
        assert_eq!(feature.properties.route_id.as_deref(), Some("57"));
        assert_eq!(feature.properties.direction_id, Some(1));
        assert_eq!(feature.temporal_geometry.coordinates[0], [-71.05, 42.35]);
        assert_eq!(
            feature.measure("bearing").unwrap().interpolation,
            Interpolation::Linear
        );
        assert_eq!(
            feature.measure("speed").unwrap().interpolation,
            Interpolation::Linear
        );
        assert_eq!(
            feature.measure("occupancy_status").unwrap().interpolation,
            Interpolation::Discrete
        );
        let carriage = feature.measure("carriage_1_A").unwrap();
        assert_eq!(carriage.values, vec![serde_json::json!(4)]);

        let json = serde_json::to_value(&collection).unwrap();
        assert_eq!(json["type"], "FeatureCollection");
        assert_eq!(json["features"][0]["temporalGeometry"]["type"], "MovingPoint");
        assert_eq!(
            json["features"][0]["temporalProperties"][0]["speed"]["type"],
            "Measure"
        );
    }

    #[test]
    fn test_absent_values_serialize_as_null() {
        let mut r = record("v1", 0, 100);
        r.odometer = None;
        let entity = PositionEntity::create(&r);
        let collection = entity.serialize();
        let odometer = collection.features[0].measure("odometer").unwrap();
        assert_eq!(odometer.values, vec![serde_json::Value::Null]);
    }
}
