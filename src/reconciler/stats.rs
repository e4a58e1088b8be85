use serde::Serialize;

/// Counters for one reconciliation cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    pub records: usize,
    pub created: usize,
    pub updated: usize,
    pub duplicates: usize,
    pub direction_changed: usize,
    pub finished: usize,
    pub evicted: usize,

    // finalization results
    pub saved: usize,
    pub discarded: usize,
    pub save_failures: usize,

    /// Registry size after the cycle.
    pub active: usize,
}

impl CycleStats {
    pub fn finalized(&self) -> usize {
        self.saved + self.discarded + self.save_failures
    }

    /// Share of incoming records that matched an existing entity, in percent.
    pub fn continuity_pct(&self) -> f64 {
        pct(self.updated + self.duplicates, self.records)
    }
}

pub fn pct(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        (part as f64 / total as f64) * 100.0
    }
}
