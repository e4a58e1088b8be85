pub mod aggregator;
pub mod config;
pub mod entity;
pub mod error;
pub mod fetch;
pub mod matcher;
pub mod parser;
pub mod reconciler;
pub mod record;
pub mod schedule;
pub mod service;
pub mod storage;
pub mod timestamp;
pub mod trajectory;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
