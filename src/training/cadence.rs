//! Evaluation cadence
//!
//! Decides on which epochs the validation pass runs and owns the train and
//! test histories. On epochs without a validation pass the most recent test
//! record is reported again, but it is not appended to the history a second
//! time.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::training::metrics::{EpochRecord, MetricField, MetricHistory};

/// Records reported for one finished epoch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    /// Zero-based epoch index
    pub epoch: usize,

    /// Training pass record
    pub train: EpochRecord,

    /// Effective test record: fresh, carried forward or the zero sentinel
    pub test: EpochRecord,

    /// Whether `test` was measured during this epoch
    pub evaluated: bool,
}

/// Epoch-level evaluation controller
#[derive(Debug, Clone)]
pub struct EvaluationCadence {
    interval: usize,
    train_history: MetricHistory,
    test_history: MetricHistory,
}

impl EvaluationCadence {
    /// Evaluate every `interval` epochs, starting at epoch 0
    pub fn new(interval: usize) -> Result<Self> {
        if interval == 0 {
            return Err(Error::config("Evaluation interval must be greater than 0"));
        }
        Ok(Self {
            interval,
            train_history: MetricHistory::new(),
            test_history: MetricHistory::new(),
        })
    }

    /// Epochs between validation passes
    pub fn interval(&self) -> usize {
        self.interval
    }

    /// Whether the validation pass runs on `epoch`
    pub fn should_evaluate(&self, epoch: usize) -> bool {
        epoch % self.interval == 0
    }

    /// Test record to report when no validation ran this epoch
    pub fn current_test(&self) -> EpochRecord {
        self.test_history.last().copied().unwrap_or_else(EpochRecord::zero)
    }

    /// Record the outcome of an epoch
    ///
    /// `test` is `Some` only on epochs where the validation pass ran.
    pub fn close_epoch(
        &mut self,
        epoch: usize,
        train: EpochRecord,
        test: Option<EpochRecord>,
    ) -> EpochReport {
        self.train_history.push(train);

        let evaluated = test.is_some();
        if let Some(record) = test {
            self.test_history.push(record);
        }

        EpochReport {
            epoch,
            train,
            test: self.current_test(),
            evaluated,
        }
    }

    pub fn train_history(&self) -> &MetricHistory {
        &self.train_history
    }

    pub fn test_history(&self) -> &MetricHistory {
        &self.test_history
    }

    /// Best training value of `field`, 0.0 before the first epoch
    pub fn best_train(&self, field: MetricField) -> f64 {
        self.train_history.best(field)
    }

    /// Best test value of `field`, 0.0 before the first evaluation
    pub fn best_test(&self, field: MetricField) -> f64 {
        self.test_history.best(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(value: f64) -> EpochRecord {
        EpochRecord {
            loss: 10.0 - value,
            top1: value,
            top5: value * 2.0,
        }
    }

    #[test]
    fn test_rejects_zero_interval() {
        assert!(EvaluationCadence::new(0).is_err());
    }

    #[test]
    fn test_interval_three_over_six_epochs() {
        let mut cadence = EvaluationCadence::new(3).unwrap();
        let mut evaluated_at = Vec::new();
        let mut reports = Vec::new();

        for epoch in 0..6 {
            let test = if cadence.should_evaluate(epoch) {
                evaluated_at.push(epoch);
                Some(record(epoch as f64 + 1.0))
            } else {
                None
            };
            reports.push(cadence.close_epoch(epoch, record(epoch as f64), test));
        }

        assert_eq!(evaluated_at, vec![0, 3]);
        assert_eq!(cadence.test_history().len(), 2);
        assert_eq!(cadence.train_history().len(), 6);

        for epoch in [1, 2] {
            assert!(!reports[epoch].evaluated);
            assert_eq!(reports[epoch].test, record(1.0));
        }
        for epoch in [4, 5] {
            assert!(!reports[epoch].evaluated);
            assert_eq!(reports[epoch].test, record(4.0));
        }
        assert!(reports[3].evaluated);
        assert_eq!(cadence.best_test(MetricField::Top1), 4.0);
        assert_eq!(cadence.best_train(MetricField::Top1), 5.0);
    }

    #[test]
    fn test_reports_zero_before_first_evaluation() {
        let mut cadence = EvaluationCadence::new(2).unwrap();
        let report = cadence.close_epoch(1, record(3.0), None);

        assert_eq!(report.test, EpochRecord::zero());
        assert!(cadence.test_history().is_empty());
        assert_eq!(cadence.best_test(MetricField::Top1), 0.0);
    }
}
