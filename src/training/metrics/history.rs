//! Append-only per-epoch metric history

use serde::{Deserialize, Serialize};

use super::{EpochRecord, MetricField};

/// Ordered records, one per genuinely measured epoch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricHistory {
    records: Vec<EpochRecord>,
}

impl MetricHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record
    pub fn push(&mut self, record: EpochRecord) {
        self.records.push(record);
    }

    /// Most recent record
    pub fn last(&self) -> Option<&EpochRecord> {
        self.records.last()
    }

    /// Highest value of `field` over the history, 0.0 when it is empty
    pub fn best(&self, field: MetricField) -> f64 {
        self.records
            .iter()
            .map(|record| record.get(field))
            .reduce(f64::max)
            .unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[EpochRecord] {
        &self.records
    }
}
