//! Flat view of one vehicle entry in a feed snapshot.

use crate::gtfs_rt::{FeedEntity, VehiclePosition, vehicle_position::CarriageDetails};

/// Occupancy report for a single carriage of a multi-carriage vehicle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CarriageRecord {
    pub id: Option<String>,
    pub label: String,
    pub sequence: u32,
    pub occupancy_status: Option<i32>,
    pub occupancy_percentage: Option<i32>,
}

impl From<&CarriageDetails> for CarriageRecord {
    fn from(c: &CarriageDetails) -> Self {
        Self {
            id: c.id.clone(),
            label: c.label.clone().unwrap_or_default(),
            sequence: c.carriage_sequence.unwrap_or_default(),
            occupancy_status: c.occupancy_status,
            occupancy_percentage: c.occupancy_percentage,
        }
    }
}

/// One vehicle observation as reported by a single poll of the feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VehicleUpdateRecord {
    pub entity_id: String,

    // trip
    pub direction_id: Option<u32>,
    pub route_id: Option<String>,
    pub trip_id: Option<String>,
    pub schedule_relationship: Option<i32>,
    pub start_date: Option<String>,
    pub start_time: Option<String>,

    // vehicle descriptor
    pub vehicle_id: Option<String>,
    pub vehicle_label: Option<String>,
    pub license_plate: Option<String>,

    // position
    pub longitude: f64,
    pub latitude: f64,
    pub bearing: Option<f32>,
    pub speed: Option<f32>,
    pub odometer: Option<f64>,

    /// POSIX seconds of the observation.
    pub timestamp: u64,
    pub stop_id: Option<String>,
    pub current_stop_sequence: Option<u32>,
    pub current_status: Option<i32>,
    pub occupancy_status: Option<i32>,
    pub occupancy_percentage: Option<u32>,
    pub congestion_level: Option<i32>,

    pub carriages: Vec<CarriageRecord>,
}

impl VehicleUpdateRecord {
    /// Builds a record from a feed entity.
    ///
    /// Returns `None` when the entity carries no vehicle, no position, or no
    /// timestamp (neither on the vehicle nor as `fallback_timestamp`).
    pub fn from_entity(entity: &FeedEntity, fallback_timestamp: Option<u64>) -> Option<Self> {
        let vehicle: &VehiclePosition = entity.vehicle.as_ref()?;
        let position = vehicle.position.as_ref()?;
        let timestamp = vehicle.timestamp.or(fallback_timestamp)?;

        let trip = vehicle.trip.as_ref();
        let descriptor = vehicle.vehicle.as_ref();

        Some(Self {
            entity_id: entity.id.clone(),
            direction_id: trip.and_then(|t| t.direction_id),
            route_id: trip.and_then(|t| t.route_id.clone()),
            trip_id: trip.and_then(|t| t.trip_id.clone()),
            schedule_relationship: trip.and_then(|t| t.schedule_relationship),
            start_date: trip.and_then(|t| t.start_date.clone()),
            start_time: trip.and_then(|t| t.start_time.clone()),
            vehicle_id: descriptor.and_then(|d| d.id.clone()),
            vehicle_label: descriptor.and_then(|d| d.label.clone()),
            license_plate: descriptor.and_then(|d| d.license_plate.clone()),
            longitude: position.longitude as f64,
            latitude: position.latitude as f64,
            bearing: position.bearing,
            speed: position.speed,
            odometer: position.odometer,
            timestamp,
            stop_id: vehicle.stop_id.clone(),
            current_stop_sequence: vehicle.current_stop_sequence,
            current_status: vehicle.current_status,
            occupancy_status: vehicle.occupancy_status,
            occupancy_percentage: vehicle.occupancy_percentage,
            congestion_level: vehicle.congestion_level,
            carriages: vehicle
                .multi_carriage_details
                .iter()
                .map(CarriageRecord::from)
                .collect(),
        })
    }
}
