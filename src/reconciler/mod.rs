//! Turns a stream of independent feed snapshots into bounded per-vehicle
//! trajectories.
//!
//! One [`FeedReconciler`] owns the live registry for one feed. Each poll it
//! evicts the oldest entity if the registry is over its ceiling, fetches a
//! snapshot, and then creates, extends, splits or finalizes entities so that
//! every vehicle-trip in the feed maps to exactly one live trajectory.
//! Entities that leave the feed are finalized: persisted through the
//! [`TrajectorySink`] when they hold at least two observations, dropped
//! otherwise.

mod stats;

pub use stats::{CycleStats, pct};

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::ReconcilerConfig;
use crate::entity::PositionEntity;
use crate::error::{FetchError, PersistenceError};
use crate::fetch::FeedSource;
use crate::record::VehicleUpdateRecord;
use crate::storage::{TrajectorySink, UNKNOWN_ROUTE};
use crate::timestamp::format_timestamp;

/// Minimum number of observations worth persisting.
pub const MIN_OBSERVATIONS: usize = 2;

/// Result of one poll that did not hit a fatal error.
#[derive(Debug)]
pub enum CycleOutcome {
    /// The snapshot was applied to the registry.
    Reconciled(CycleStats),
    /// The feed answered with no vehicles; the registry was left untouched.
    Empty,
    /// A recoverable fetch failure; the registry was left untouched.
    Skipped(FetchError),
}

struct Slot {
    /// Insertion order, used to break ties between equal creation instants.
    order: u64,
    entity: PositionEntity,
}

pub struct FeedReconciler<S> {
    provider: String,
    config: ReconcilerConfig,
    sink: S,
    registry: HashMap<String, Slot>,
    next_order: u64,
    poll_interval: Duration,
}

impl<S: TrajectorySink> FeedReconciler<S> {
    pub fn new(provider: impl Into<String>, config: ReconcilerConfig, sink: S) -> Self {
        let poll_interval = config.poll_interval;
        Self {
            provider: provider.into(),
            config,
            sink,
            registry: HashMap::new(),
            next_order: 0,
            poll_interval,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn get(&self, entity_id: &str) -> Option<&PositionEntity> {
        self.registry.get(entity_id).map(|slot| &slot.entity)
    }

    /// Delay before the next poll; escalated after empty or failed fetches.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Runs one full poll cycle against `source`.
    ///
    /// # Errors
    ///
    /// Only a fatal [`FetchError`] is returned; every other failure is
    /// reported through [`CycleOutcome`].
    #[tracing::instrument(skip_all, fields(provider = %self.provider))]
    pub async fn poll<F>(&mut self, source: &F) -> Result<CycleOutcome, FetchError>
    where
        F: FeedSource + ?Sized,
    {
        let mut stats = CycleStats::default();
        self.enforce_ceiling(&mut stats);

        let records = match source.fetch_snapshot().await {
            Ok(records) => records,
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Feed fetch failed with an unrecoverable error");
                return Err(e);
            }
            Err(e) => {
                warn!(error = %e, kind = e.kind(), "Feed fetch failed, skipping cycle");
                if matches!(e, FetchError::Unknown(_)) {
                    self.poll_interval = self.config.error_interval;
                }
                return Ok(CycleOutcome::Skipped(e));
            }
        };

        if records.is_empty() {
            warn!("Empty feed, leaving registry untouched");
            self.poll_interval = self.config.error_interval;
            return Ok(CycleOutcome::Empty);
        }

        self.apply(records, &mut stats);
        self.poll_interval = self.config.poll_interval;

        info!(
            records = stats.records,
            created = stats.created,
            updated = stats.updated,
            duplicates = stats.duplicates,
            direction_changed = stats.direction_changed,
            saved = stats.saved,
            discarded = stats.discarded,
            save_failures = stats.save_failures,
            finalized = stats.finalized(),
            continuity_pct = stats.continuity_pct(),
            active = stats.active,
            "Feed processing complete"
        );
        Ok(CycleOutcome::Reconciled(stats))
    }

    /// Applies one non-empty snapshot to the registry (bootstrap, reconcile,
    /// sweep). The ceiling check is not part of this step.
    pub fn reconcile(&mut self, records: Vec<VehicleUpdateRecord>) -> CycleStats {
        let mut stats = CycleStats::default();
        self.apply(records, &mut stats);
        stats
    }

    fn apply(&mut self, records: Vec<VehicleUpdateRecord>, stats: &mut CycleStats) {
        stats.records = records.len();
        if self.registry.is_empty() {
            info!(count = records.len(), "No existing entities, creating all");
        }

        let mut seen: HashSet<String> = HashSet::with_capacity(records.len());

        for record in records {
            let incoming_at = format_timestamp(record.timestamp);
            let id = record.entity_id.clone();

            match self.registry.get_mut(&id) {
                None => {
                    self.insert(PositionEntity::create(&record));
                    stats.created += 1;
                }
                Some(slot) if slot.entity.last_timestamp() == Some(incoming_at.as_str()) => {
                    stats.duplicates += 1;
                }
                Some(slot) if slot.entity.direction_id == record.direction_id => {
                    slot.entity.append(&record);
                    stats.updated += 1;
                }
                Some(_) => {
                    stats.direction_changed += 1;
                    if let Some(old) = self.registry.remove(&id) {
                        debug!(entity_id = %id, "Direction changed, splitting trajectory");
                        self.finalize(old.entity, stats);
                    }
                    self.insert(PositionEntity::create(&record));
                    stats.created += 1;
                }
            }
            seen.insert(id);
        }

        let finished: Vec<String> = self
            .registry
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for id in finished {
            if let Some(slot) = self.registry.remove(&id) {
                stats.finished += 1;
                self.finalize(slot.entity, stats);
            }
        }

        stats.active = self.registry.len();
    }

    /// Evicts the single oldest entity when the registry is over its ceiling.
    fn enforce_ceiling(&mut self, stats: &mut CycleStats) {
        if self.registry.len() <= self.config.max_entities {
            return;
        }

        let oldest = self
            .registry
            .iter()
            .min_by_key(|(_, slot)| (slot.entity.created, slot.order))
            .map(|(id, _)| id.clone());

        if let Some(slot) = oldest.and_then(|id| self.registry.remove(&id)) {
            warn!(
                entity_id = %slot.entity.entity_id,
                max_entities = self.config.max_entities,
                remaining = self.registry.len(),
                "Entity limit exceeded, evicting oldest"
            );
            stats.evicted += 1;
            self.finalize(slot.entity, stats);
        }
    }

    fn insert(&mut self, entity: PositionEntity) {
        let order = self.next_order;
        self.next_order += 1;
        self.registry
            .insert(entity.entity_id.clone(), Slot { order, entity });
    }

    /// Persists `entity` if it carries enough observations. The entity is
    /// consumed either way; a failed write is logged, not retried.
    fn finalize(&self, entity: PositionEntity, stats: &mut CycleStats) {
        let observations = entity.observation_count();
        if observations < MIN_OBSERVATIONS {
            stats.discarded += 1;
            debug!(entity_id = %entity.entity_id, observations, "Discarded entity");
            return;
        }

        match self.persist(&entity) {
            Ok(path) => {
                stats.saved += 1;
                debug!(
                    entity_id = %entity.entity_id,
                    route_id = entity.route_id.as_deref().unwrap_or(UNKNOWN_ROUTE),
                    observations,
                    path = %path.display(),
                    "Saved entity"
                );
            }
            Err(e) => {
                stats.save_failures += 1;
                error!(entity_id = %entity.entity_id, error = %e, "Failed to save entity");
            }
        }
    }

    fn persist(&self, entity: &PositionEntity) -> Result<PathBuf, PersistenceError> {
        let date = entity
            .first_observation_date()
            .ok_or_else(|| PersistenceError::MissingDate(entity.entity_id.clone()))?;
        let route_id = entity
            .route_id
            .as_deref()
            .filter(|r| !r.is_empty())
            .unwrap_or(UNKNOWN_ROUTE);
        self.sink.save(route_id, date.into(), &entity.serialize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::tests::record;
    use crate::storage::PartitionDate;
    use crate::trajectory::TrajectoryCollection;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Sink that records what it was asked to save.
    #[derive(Default)]
    struct MemorySink {
        saved: Mutex<Vec<(String, PartitionDate, TrajectoryCollection)>>,
        fail: bool,
    }

    impl MemorySink {
        fn saved_ids(&self) -> Vec<String> {
            self.saved
                .lock()
                .unwrap()
                .iter()
                .map(|(_, _, c)| c.features[0].properties.entity_id.clone())
                .collect()
        }

        fn count(&self) -> usize {
            self.saved.lock().unwrap().len()
        }
    }

    impl TrajectorySink for MemorySink {
        fn save(
            &self,
            route_id: &str,
            date: PartitionDate,
            record: &TrajectoryCollection,
        ) -> Result<PathBuf, PersistenceError> {
            if self.fail {
                return Err(PersistenceError::Io {
                    path: PathBuf::from("/readonly"),
                    source: std::io::Error::other("disk full"),
                });
            }
            self.saved
                .lock()
                .unwrap()
                .push((route_id.to_string(), date, record.clone()));
            Ok(PathBuf::from(format!("/mem/{route_id}")))
        }
    }

    /// Feed source that replays a scripted sequence of responses.
    struct ScriptedFeed(Mutex<VecDeque<Result<Vec<VehicleUpdateRecord>, FetchError>>>);

    impl ScriptedFeed {
        fn new(responses: Vec<Result<Vec<VehicleUpdateRecord>, FetchError>>) -> Self {
            Self(Mutex::new(responses.into()))
        }
    }

    #[async_trait]
    impl FeedSource for ScriptedFeed {
        async fn fetch_snapshot(&self) -> Result<Vec<VehicleUpdateRecord>, FetchError> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn reconciler() -> FeedReconciler<MemorySink> {
        FeedReconciler::new("test", ReconcilerConfig::default(), MemorySink::default())
    }

    #[test]
    fn test_bootstrap_creates_one_entity_per_record() {
        let mut r = reconciler();
        let stats = r.reconcile(vec![record("v1", 0, 100), record("v2", 0, 100)]);
        assert_eq!(stats.created, 2);
        assert_eq!(r.len(), 2);
        assert_eq!(stats.active, 2);
    }

    #[test]
    fn test_unseen_id_grows_registry_by_one() {
        let mut r = reconciler();
        r.reconcile(vec![record("v1", 0, 100)]);
        let stats = r.reconcile(vec![record("v1", 0, 130), record("v2", 0, 130)]);
        assert_eq!(stats.created, 1);
        assert_eq!(stats.updated, 1);
        assert_eq!(r.len(), 2);
        assert_eq!(r.get("v2").unwrap().observation_count(), 1);
    }

    #[test]
    fn test_same_timestamp_is_a_duplicate() {
        let mut r = reconciler();
        r.reconcile(vec![record("v1", 0, 100)]);
        let stats = r.reconcile(vec![record("v1", 0, 100)]);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(r.get("v1").unwrap().observation_count(), 1);
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn test_direction_change_splits_trajectory() {
        let mut r = reconciler();
        r.reconcile(vec![record("v1", 0, 100)]);
        r.reconcile(vec![record("v1", 0, 130)]);
        let stats = r.reconcile(vec![record("v1", 1, 160)]);

        assert_eq!(stats.direction_changed, 1);
        assert_eq!(stats.created, 1);
        assert_eq!(stats.saved, 1);
        assert_eq!(r.sink.saved_ids(), vec!["v1".to_string()]);
        let fresh = r.get("v1").unwrap();
        assert_eq!(fresh.direction_id, Some(1));
        assert_eq!(fresh.observation_count(), 1);
    }

    #[test]
    fn test_direction_change_with_single_observation_discards() {
        let mut r = reconciler();
        r.reconcile(vec![record("v1", 0, 100)]);
        let stats = r.reconcile(vec![record("v1", 1, 130)]);

        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.saved, 0);
        assert_eq!(r.sink.count(), 0);
        let fresh = r.get("v1").unwrap();
        assert_eq!(fresh.direction_id, Some(1));
        assert_eq!(
            fresh.last_timestamp(),
            Some(format_timestamp(130).as_str())
        );
        assert_eq!(fresh.observation_count(), 1);
    }

    #[test]
    fn test_sweep_persists_only_multi_observation_entities() {
        let mut r = reconciler();
        r.reconcile(vec![record("v1", 0, 100), record("v2", 0, 100)]);
        r.reconcile(vec![record("v1", 0, 130), record("v3", 0, 130)]);
        // v2 left after one observation: discarded
        assert_eq!(r.sink.count(), 0);

        let stats = r.reconcile(vec![record("v3", 0, 160)]);
        assert_eq!(stats.finished, 1);
        assert_eq!(stats.saved, 1);
        assert_eq!(r.sink.saved_ids(), vec!["v1".to_string()]);
        assert_eq!(r.len(), 1);

        // persisted exactly once even if more cycles follow
        r.reconcile(vec![record("v3", 0, 190)]);
        assert_eq!(r.sink.count(), 1);
    }

    #[test]
    fn test_persisted_partition_uses_route_and_first_date() {
        let mut r = reconciler();
        r.reconcile(vec![record("v1", 0, 1_700_000_000)]);
        r.reconcile(vec![record("v1", 0, 1_700_000_030)]);
        r.reconcile(vec![record("v2", 0, 1_700_000_060)]);

        let saved = r.sink.saved.lock().unwrap();
        let (route, date, _) = &saved[0];
        assert_eq!(route, "57");
        let expected = crate::timestamp::observation_date(&format_timestamp(1_700_000_000)).unwrap();
        assert_eq!(*date, PartitionDate::from(expected));
    }

    #[test]
    fn test_save_failure_still_drops_entity() {
        let mut r = FeedReconciler::new(
            "test",
            ReconcilerConfig::default(),
            MemorySink {
                fail: true,
                ..Default::default()
            },
        );
        r.reconcile(vec![record("v1", 0, 100)]);
        r.reconcile(vec![record("v1", 0, 130)]);
        let stats = r.reconcile(vec![record("v2", 0, 160)]);
        assert_eq!(stats.save_failures, 1);
        assert!(r.get("v1").is_none());
    }

    #[tokio::test]
    async fn test_empty_poll_leaves_registry_untouched() {
        let mut r = reconciler();
        let feed = ScriptedFeed::new(vec![
            Ok(vec![record("v1", 0, 100), record("v2", 0, 100)]),
            Ok(vec![]),
        ]);

        r.poll(&feed).await.unwrap();
        assert_eq!(r.len(), 2);

        let outcome = r.poll(&feed).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Empty));
        assert_eq!(r.len(), 2);
        assert_eq!(r.poll_interval(), ReconcilerConfig::default().error_interval);
    }

    #[tokio::test]
    async fn test_recoverable_errors_skip_cycle() {
        let mut r = reconciler();
        let feed = ScriptedFeed::new(vec![
            Ok(vec![record("v1", 0, 100)]),
            Err(FetchError::Timeout("slow".into())),
            Err(FetchError::Unknown("boom".into())),
            Ok(vec![record("v1", 0, 130)]),
        ]);
        let defaults = ReconcilerConfig::default();

        r.poll(&feed).await.unwrap();
        let outcome = r.poll(&feed).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Skipped(FetchError::Timeout(_))));
        assert_eq!(r.poll_interval(), defaults.poll_interval);
        assert_eq!(r.len(), 1);

        r.poll(&feed).await.unwrap();
        assert_eq!(r.poll_interval(), defaults.error_interval);

        let outcome = r.poll(&feed).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Reconciled(_)));
        assert_eq!(r.poll_interval(), defaults.poll_interval);
        assert_eq!(r.get("v1").unwrap().observation_count(), 2);
    }

    #[tokio::test]
    async fn test_unrecoverable_error_is_returned() {
        let mut r = reconciler();
        let feed = ScriptedFeed::new(vec![Err(FetchError::Unrecoverable("refused".into()))]);
        let err = r.poll(&feed).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_ceiling_evicts_oldest_before_processing() {
        let config = ReconcilerConfig {
            max_entities: 2,
            ..Default::default()
        };
        let mut r = FeedReconciler::new("test", config, MemorySink::default());
        let feed = ScriptedFeed::new(vec![
            Ok(vec![record("v1", 0, 100)]),
            Ok(vec![record("v1", 0, 130), record("v2", 0, 130)]),
            Ok(vec![
                record("v1", 0, 160),
                record("v2", 0, 160),
                record("v3", 0, 160),
            ]),
            Ok(vec![]),
        ]);

        for _ in 0..3 {
            r.poll(&feed).await.unwrap();
        }
        assert_eq!(r.len(), 3);

        // over the ceiling: the next cycle evicts v1 before fetching
        let outcome = r.poll(&feed).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Empty));
        assert_eq!(r.len(), 2);
        assert!(r.get("v1").is_none());
        assert_eq!(r.sink.saved_ids(), vec!["v1".to_string()]);
    }

    #[tokio::test]
    async fn test_ceiling_eviction_of_single_observation_discards() {
        let config = ReconcilerConfig {
            max_entities: 1,
            ..Default::default()
        };
        let mut r = FeedReconciler::new("test", config, MemorySink::default());
        let feed = ScriptedFeed::new(vec![
            Ok(vec![record("v1", 0, 100), record("v2", 0, 100)]),
            Ok(vec![record("v2", 0, 130)]),
        ]);

        r.poll(&feed).await.unwrap();
        let outcome = r.poll(&feed).await.unwrap();
        match outcome {
            CycleOutcome::Reconciled(stats) => {
                assert_eq!(stats.evicted, 1);
                assert_eq!(stats.discarded, 1);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(r.sink.count(), 0);
        assert_eq!(r.len(), 1);
    }
}
