//! Protobuf parser for GTFS Realtime vehicle-position feeds.

use prost::Message;
use tracing::debug;

use crate::error::FetchError;
use crate::gtfs_rt::FeedMessage;
use crate::record::VehicleUpdateRecord;

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes.
///
/// # Errors
///
/// Returns [`FetchError::Decode`] if the bytes are not valid protobuf for a
/// `FeedMessage`.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage, FetchError> {
    Ok(FeedMessage::decode(bytes)?)
}

/// Extracts one [`VehicleUpdateRecord`] per usable vehicle entity.
///
/// Entities without a vehicle or a position are skipped. Vehicles without a
/// timestamp inherit the header timestamp.
pub fn vehicle_records(feed: &FeedMessage) -> Vec<VehicleUpdateRecord> {
    let fallback = feed.header.timestamp;
    let records: Vec<_> = feed
        .entity
        .iter()
        .filter(|e| !e.is_deleted.unwrap_or(false))
        .filter_map(|e| VehicleUpdateRecord::from_entity(e, fallback))
        .collect();

    let skipped = feed.entity.len() - records.len();
    if skipped > 0 {
        debug!(skipped, "Skipped entities without usable vehicle position");
    }
    records
}
