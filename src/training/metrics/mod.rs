//! Metrics for classifier training
//!
//! This module provides the per-epoch metric record, the streaming
//! accumulator that produces it and the append-only histories the best-value
//! summary is computed from.

pub mod accumulator;
pub mod history;

pub use accumulator::{label_rank, MetricAccumulator};
pub use history::MetricHistory;

use serde::{Deserialize, Serialize};

/// Loss and accuracy for one pass
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct EpochRecord {
    /// Mean per-sample loss
    pub loss: f64,

    /// Top-1 accuracy in percent
    pub top1: f64,

    /// Top-5 accuracy in percent
    pub top5: f64,
}

/// Selects one field of an [`EpochRecord`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricField {
    Loss,
    Top1,
    Top5,
}

impl EpochRecord {
    /// Sentinel record reported before any evaluation has run
    pub fn zero() -> Self {
        Self::default()
    }

    /// Read one field
    pub fn get(&self, field: MetricField) -> f64 {
        match field {
            MetricField::Loss => self.loss,
            MetricField::Top1 => self.top1,
            MetricField::Top5 => self.top5,
        }
    }
}
