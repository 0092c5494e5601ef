//! Streaming loss and top-k accuracy accumulation
//!
//! One accumulator lives for exactly one pass (a training epoch or an
//! evaluation pass) and finalizes into a single [`EpochRecord`].

use std::cmp::Ordering;

use candle_core::{DType, Tensor};

use crate::error::{Error, Result};

use super::EpochRecord;

/// Rank of `label` within `scores`, 0 being the best-scored class
///
/// A class outranks the label when it scores strictly higher, or scores the
/// same and has a lower index. NaN scores order above every number.
pub fn label_rank(scores: &[f32], label: usize) -> usize {
    let label_score = scores[label];
    scores
        .iter()
        .enumerate()
        .filter(|(index, score)| match score.total_cmp(&label_score) {
            Ordering::Greater => true,
            Ordering::Equal => *index < label,
            Ordering::Less => false,
        })
        .count()
}

/// Running totals for one pass over a batch stream
#[derive(Debug, Clone)]
pub struct MetricAccumulator {
    /// Name of the pass, used in errors
    pass: String,
    loss_sum: f64,
    sample_count: usize,
    top1_correct: usize,
    top5_correct: usize,
}

impl MetricAccumulator {
    /// Start an empty pass
    pub fn new(pass: impl Into<String>) -> Self {
        Self {
            pass: pass.into(),
            loss_sum: 0.0,
            sample_count: 0,
            top1_correct: 0,
            top5_correct: 0,
        }
    }

    /// Accumulate one batch of device tensors
    ///
    /// `logits` is `(batch, classes)` and `labels` is `(batch,)`. Both are
    /// copied to the host here, which waits for the device to finish the
    /// batch before any count is read.
    pub fn update(&mut self, logits: &Tensor, labels: &Tensor, loss_value: f64) -> Result<()> {
        let scores = logits.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let labels = labels.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        self.update_scores(&scores, &labels, loss_value)
    }

    /// Accumulate one batch of host-side scores
    ///
    /// The loss is weighted by the actual number of rows, so a short final
    /// batch counts for what it holds.
    pub fn update_scores(&mut self, scores: &[Vec<f32>], labels: &[u32], loss_value: f64) -> Result<()> {
        if scores.len() != labels.len() {
            return Err(Error::invalid_input(format!(
                "{} score rows for {} labels",
                scores.len(),
                labels.len()
            )));
        }

        let mut top1 = 0;
        let mut top5 = 0;
        for (row, &label) in scores.iter().zip(labels) {
            let label = label as usize;
            if label >= row.len() {
                return Err(Error::invalid_input(format!(
                    "label {} out of range for {} classes",
                    label,
                    row.len()
                )));
            }
            let rank = label_rank(row, label);
            if rank == 0 {
                top1 += 1;
            }
            if rank < 5 {
                top5 += 1;
            }
        }

        let batch_size = labels.len();
        self.loss_sum += loss_value * batch_size as f64;
        self.sample_count += batch_size;
        self.top1_correct += top1;
        self.top5_correct += top5;
        Ok(())
    }

    /// Samples seen so far
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Produce the pass record
    ///
    /// Fails with [`Error::EmptyStream`] when no sample was accumulated.
    pub fn finalize(&self) -> Result<EpochRecord> {
        if self.sample_count == 0 {
            return Err(Error::empty_stream(self.pass.clone()));
        }

        let n = self.sample_count as f64;
        Ok(EpochRecord {
            loss: self.loss_sum / n,
            top1: 100.0 * self.top1_correct as f64 / n,
            top5: 100.0 * self.top5_correct as f64 / n,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;
    use proptest::prelude::*;

    fn one_hot_scores(labels: &[u32], classes: usize) -> Vec<Vec<f32>> {
        labels
            .iter()
            .map(|&label| {
                let mut row = vec![0.0; classes];
                row[label as usize] = 1.0;
                row
            })
            .collect()
    }

    #[test]
    fn test_perfect_predictions() {
        let labels = [0u32, 3, 7, 9];
        let mut acc = MetricAccumulator::new("train");
        acc.update_scores(&one_hot_scores(&labels, 10), &labels, 0.25).unwrap();

        let record = acc.finalize().unwrap();
        assert_relative_eq!(record.top1, 100.0);
        assert_relative_eq!(record.top5, 100.0);
        assert_relative_eq!(record.loss, 0.25);
    }

    #[test]
    fn test_label_ranked_sixth_or_lower() {
        // Label 0 always scores lowest among 10 classes
        let scores: Vec<Vec<f32>> = (0..8)
            .map(|_| (0..10).map(|c| c as f32).collect())
            .collect();
        let labels = vec![0u32; 8];

        let mut acc = MetricAccumulator::new("validation");
        acc.update_scores(&scores, &labels, 2.0).unwrap();

        let record = acc.finalize().unwrap();
        assert_relative_eq!(record.top1, 0.0);
        assert_relative_eq!(record.top5, 0.0);
    }

    #[test]
    fn test_partial_batch_weighting() {
        let mut acc = MetricAccumulator::new("train");
        let full = [1u32; 4];
        let partial = [1u32; 1];
        acc.update_scores(&one_hot_scores(&full, 3), &full, 1.0).unwrap();
        acc.update_scores(&one_hot_scores(&partial, 3), &partial, 6.0).unwrap();

        // (1.0 * 4 + 6.0 * 1) / 5
        let record = acc.finalize().unwrap();
        assert_relative_eq!(record.loss, 2.0);
        assert_eq!(acc.sample_count(), 5);
    }

    #[test]
    fn test_top5_counts_near_misses() {
        // Label 2 is ranked third
        let scores = vec![vec![5.0f32, 4.0, 3.0, 2.0, 1.0, 0.0]];
        let mut acc = MetricAccumulator::new("train");
        acc.update_scores(&scores, &[2], 1.0).unwrap();

        let record = acc.finalize().unwrap();
        assert_relative_eq!(record.top1, 0.0);
        assert_relative_eq!(record.top5, 100.0);
    }

    #[test]
    fn test_ties_favor_lower_index() {
        let scores = [1.0f32, 1.0, 1.0];
        assert_eq!(label_rank(&scores, 0), 0);
        assert_eq!(label_rank(&scores, 1), 1);
        assert_eq!(label_rank(&scores, 2), 2);
    }

    #[test]
    fn test_empty_stream_is_an_error() {
        let acc = MetricAccumulator::new("validation");
        match acc.finalize() {
            Err(Error::EmptyStream { pass }) => assert_eq!(pass, "validation"),
            other => panic!("expected empty stream error, got {:?}", other),
        }
    }

    #[test]
    fn test_out_of_range_label() {
        let mut acc = MetricAccumulator::new("train");
        assert!(acc.update_scores(&[vec![0.0, 1.0]], &[2], 1.0).is_err());
        assert!(acc.update_scores(&[vec![0.0, 1.0]], &[0, 1], 1.0).is_err());
    }

    #[test]
    fn test_update_from_tensors() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[0.1f32, 0.9], [0.8, 0.2]], &device).unwrap();
        let labels = Tensor::new(&[1u32, 1], &device).unwrap();

        let mut acc = MetricAccumulator::new("train");
        acc.update(&logits, &labels, 0.5).unwrap();

        let record = acc.finalize().unwrap();
        assert_relative_eq!(record.top1, 50.0);
        assert_relative_eq!(record.top5, 100.0);
    }

    proptest! {
        #[test]
        fn prop_rank_matches_stable_sort(scores in prop::collection::vec(-3i8..3, 1..20), pick in 0usize..20) {
            let scores: Vec<f32> = scores.into_iter().map(f32::from).collect();
            let label = pick % scores.len();

            let mut order: Vec<usize> = (0..scores.len()).collect();
            order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
            let expected = order.iter().position(|&c| c == label).unwrap();

            prop_assert_eq!(label_rank(&scores, label), expected);
        }

        #[test]
        fn prop_top1_never_exceeds_top5(rows in prop::collection::vec(prop::collection::vec(-10.0f32..10.0, 8), 1..16)) {
            let labels: Vec<u32> = (0..rows.len()).map(|i| (i % 8) as u32).collect();
            let mut acc = MetricAccumulator::new("train");
            acc.update_scores(&rows, &labels, 1.0).unwrap();
            let record = acc.finalize().unwrap();
            prop_assert!(record.top1 <= record.top5);
            prop_assert!(record.top5 <= 100.0);
        }
    }
}
