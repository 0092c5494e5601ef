//! Training session for image classifiers
//!
//! This module provides [`TrainingSession`], which owns one run: the model,
//! the step executor (schedule, loss scaler, optimizer, clipping), the
//! evaluation cadence with both metric histories, and the run state. A
//! session is constructed once per run; nothing is kept in process-wide
//! state.

use std::time::{Duration, Instant};

use candle_core::DType;
use candle_nn::loss::cross_entropy;
use candle_nn::{ModuleT, VarMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::training::cadence::{EpochReport, EvaluationCadence};
use crate::training::config::TrainingConfig;
use crate::training::data::{DataLoader, Dataset};
use crate::training::metrics::{EpochRecord, MetricAccumulator, MetricField};
use crate::training::step::StepExecutor;

/// Training state tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingState {
    /// Current epoch
    pub epoch: usize,

    /// Attempted optimization steps across all epochs
    pub global_step: usize,

    /// Training start time
    pub start_time: Option<DateTime<Utc>>,

    /// Training status
    pub status: TrainingStatus,

    /// Learning rate for the next step
    pub current_lr: f64,
}

/// Training status enumeration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TrainingStatus {
    NotStarted,
    Running,
    Completed,
    Failed { error: String },
}

/// Training events for monitoring
#[derive(Debug, Clone)]
pub enum TrainingEvent {
    EpochStarted { epoch: usize },
    StepCompleted { step: usize, loss: f64, lr: f64, applied: bool },
    EvaluationCompleted { epoch: usize, record: EpochRecord },
    EpochCompleted { summary: EpochSummary },
    TrainingCompleted { total_steps: usize },
    Error { error: String },
}

/// Everything reported for one epoch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochSummary {
    /// Train and effective test records
    #[serde(flatten)]
    pub report: EpochReport,

    /// Learning rate at the start of the epoch
    pub learning_rate: f64,

    /// Steps skipped for non-finite gradients during the epoch
    pub skipped_steps: usize,

    /// Samples behind the training record
    pub train_samples: usize,

    /// Loss scale at the end of the epoch
    pub loss_scale: f64,

    /// Wall time of the epoch in seconds
    pub duration_secs: f64,
}

/// Training result information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    /// Per-epoch summaries
    pub epochs: Vec<EpochSummary>,

    /// Best training top-1 accuracy
    pub best_train_top1: f64,

    /// Best test top-1 accuracy over genuine evaluations
    pub best_test_top1: f64,

    /// Training history, one record per epoch
    pub train_history: Vec<EpochRecord>,

    /// Test history, one record per evaluation
    pub test_history: Vec<EpochRecord>,

    /// Attempted optimization steps
    pub total_steps: usize,

    /// Optimizer updates applied
    pub applied_steps: usize,

    /// Steps skipped for non-finite gradients
    pub skipped_steps: usize,

    /// Final loss scale
    pub final_loss_scale: f64,

    /// Run start
    pub started_at: DateTime<Utc>,

    /// Run end
    pub finished_at: DateTime<Utc>,

    /// Training duration
    pub training_duration: Duration,
}

impl TrainingReport {
    /// Write the report as pretty JSON
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

impl TrainingState {
    fn new() -> Self {
        Self {
            epoch: 0,
            global_step: 0,
            start_time: None,
            status: TrainingStatus::NotStarted,
            current_lr: 0.0,
        }
    }
}

/// One training run of a classifier
pub struct TrainingSession<M: ModuleT> {
    /// Training configuration
    config: TrainingConfig,

    /// Model being trained
    model: M,

    /// Step executor
    executor: StepExecutor,

    /// Evaluation cadence and metric histories
    cadence: EvaluationCadence,

    /// Training batches per epoch the schedule was sized for
    steps_per_epoch: usize,

    /// Per-epoch summaries so far
    epochs: Vec<EpochSummary>,

    /// Training state
    state: TrainingState,

    /// Event channel for monitoring
    event_tx: Option<mpsc::UnboundedSender<TrainingEvent>>,
}

impl<M: ModuleT> TrainingSession<M> {
    /// Create a session for a model whose parameters live in `var_map`
    ///
    /// `steps_per_epoch` is the number of training batches per epoch and
    /// sizes the learning rate schedule.
    pub fn new(config: TrainingConfig, model: M, var_map: &VarMap, steps_per_epoch: usize) -> Result<Self> {
        config.validate()?;
        if steps_per_epoch == 0 {
            return Err(Error::empty_stream("train"));
        }

        let executor = StepExecutor::from_config(&config, var_map, steps_per_epoch)?;
        let cadence = EvaluationCadence::new(config.training.eval_interval)?;
        let mut state = TrainingState::new();
        state.current_lr = executor.current_lr();

        Ok(Self {
            config,
            model,
            executor,
            cadence,
            steps_per_epoch,
            epochs: Vec::new(),
            state,
            event_tx: None,
        })
    }

    /// Set up event monitoring
    pub fn with_event_monitoring(mut self, tx: mpsc::UnboundedSender<TrainingEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Run every configured epoch
    pub async fn run<T, V>(&mut self, train_loader: &DataLoader<T>, val_loader: &DataLoader<V>) -> Result<TrainingReport>
    where
        T: Dataset + 'static,
        V: Dataset + 'static,
    {
        let loader_batches = train_loader.num_batches();
        if loader_batches != self.steps_per_epoch {
            return Err(Error::config(format!(
                "Training loader yields {} batches per epoch but the schedule was sized for {}",
                loader_batches, self.steps_per_epoch
            )));
        }

        let started_at = Utc::now();
        let training_start = Instant::now();
        self.state.status = TrainingStatus::Running;
        self.state.start_time = Some(started_at);

        info!(
            "Starting training: {} epochs, {} steps/epoch, optimizer lr {}, {} parameters, {:?}",
            self.config.training.num_epochs,
            train_loader.num_batches(),
            self.config.optimizer.learning_rate,
            self.executor.parameter_count(),
            self.executor.compute_dtype()
        );

        for epoch in self.state.epoch..self.config.training.num_epochs {
            if let Err(e) = self.on_epoch(epoch, train_loader, val_loader).await {
                let error_msg = format!("Training failed in epoch {}: {}", epoch + 1, e);
                error!("{}", error_msg);
                self.state.status = TrainingStatus::Failed { error: error_msg.clone() };
                self.send_event(TrainingEvent::Error { error: error_msg });
                return Err(e);
            }
        }

        self.state.status = TrainingStatus::Completed;
        let best_train_top1 = self.cadence.best_train(MetricField::Top1);
        let best_test_top1 = self.cadence.best_test(MetricField::Top1);
        info!("Best train top1 accuracy: {:.2}", best_train_top1);
        info!("Best test top1 accuracy: {:.2}", best_test_top1);

        self.send_event(TrainingEvent::TrainingCompleted {
            total_steps: self.executor.global_step(),
        });

        Ok(TrainingReport {
            epochs: self.epochs.clone(),
            best_train_top1,
            best_test_top1,
            train_history: self.cadence.train_history().records().to_vec(),
            test_history: self.cadence.test_history().records().to_vec(),
            total_steps: self.executor.global_step(),
            applied_steps: self.executor.applied_steps(),
            skipped_steps: self.executor.skipped_steps(),
            final_loss_scale: self.executor.loss_scale(),
            started_at,
            finished_at: Utc::now(),
            training_duration: training_start.elapsed(),
        })
    }

    /// Train one epoch and evaluate it when the cadence says so
    pub async fn on_epoch<T, V>(
        &mut self,
        epoch: usize,
        train_loader: &DataLoader<T>,
        val_loader: &DataLoader<V>,
    ) -> Result<EpochSummary>
    where
        T: Dataset + 'static,
        V: Dataset + 'static,
    {
        let epoch_start = Instant::now();
        self.state.epoch = epoch;
        let learning_rate = self.executor.current_lr();
        let skipped_before = self.executor.skipped_steps();
        self.send_event(TrainingEvent::EpochStarted { epoch });

        let (train, train_samples) = self.train_epoch(epoch, train_loader).await?;

        let test = if self.cadence.should_evaluate(epoch) {
            let record = self.evaluate(val_loader).await?;
            self.send_event(TrainingEvent::EvaluationCompleted { epoch, record });
            Some(record)
        } else {
            None
        };

        let report = self.cadence.close_epoch(epoch, train, test);
        info!(
            "Epoch [{}/{}], LR: {:.6}, Train Loss: {:.4}, Test Loss: {:.4}, Train Top1: {:.2}%, Train Top5: {:.2}%, Test Top1: {:.2}%, Test Top5: {:.2}%",
            epoch + 1,
            self.config.training.num_epochs,
            learning_rate,
            report.train.loss,
            report.test.loss,
            report.train.top1,
            report.train.top5,
            report.test.top1,
            report.test.top5
        );

        let summary = EpochSummary {
            report,
            learning_rate,
            skipped_steps: self.executor.skipped_steps() - skipped_before,
            train_samples,
            loss_scale: self.executor.loss_scale(),
            duration_secs: epoch_start.elapsed().as_secs_f64(),
        };
        self.epochs.push(summary.clone());
        self.state.epoch = epoch + 1;
        self.state.current_lr = self.executor.current_lr();
        self.send_event(TrainingEvent::EpochCompleted {
            summary: summary.clone(),
        });

        Ok(summary)
    }

    /// Train for one epoch, returning the record and the samples it covers
    async fn train_epoch<T: Dataset + 'static>(
        &mut self,
        epoch: usize,
        loader: &DataLoader<T>,
    ) -> Result<(EpochRecord, usize)> {
        let include_skipped = self.config.training.metrics_include_skipped_steps;
        let mut applied_metrics = MetricAccumulator::new("train");
        let mut all_metrics = MetricAccumulator::new("train");

        let mut stream = loader.epoch_stream(epoch);
        while let Some(batch) = stream.next_batch().await? {
            let step_start = Instant::now();
            let outcome = self.executor.step(&self.model, &batch, epoch)?;

            all_metrics.update(&outcome.logits, &batch.labels, outcome.loss)?;
            if outcome.applied {
                applied_metrics.update(&outcome.logits, &batch.labels, outcome.loss)?;
            }

            let step = self.executor.global_step();
            self.state.global_step = step;
            if step % self.config.training.log_steps == 0 {
                debug!(
                    "Step {} - Loss: {:.4}, LR: {:.2e}, Scale: {}, Applied: {}, Time: {:?}",
                    step,
                    outcome.loss,
                    outcome.learning_rate,
                    outcome.scale,
                    outcome.applied,
                    step_start.elapsed()
                );
                self.send_event(TrainingEvent::StepCompleted {
                    step,
                    loss: outcome.loss,
                    lr: outcome.learning_rate,
                    applied: outcome.applied,
                });
            }
        }

        // An epoch in which every step was skipped still reports what it saw
        let metrics = if include_skipped || applied_metrics.sample_count() == 0 {
            &all_metrics
        } else {
            &applied_metrics
        };
        Ok((metrics.finalize()?, metrics.sample_count()))
    }

    /// Full pass over the validation stream in evaluation mode
    async fn evaluate<V: Dataset + 'static>(&self, loader: &DataLoader<V>) -> Result<EpochRecord> {
        let mut metrics = MetricAccumulator::new("validation");
        let mut stream = loader.epoch_stream(0);
        while let Some(batch) = stream.next_batch().await? {
            let logits = self
                .model
                .forward_t(&batch.images, false)?
                .to_dtype(DType::F32)?
                .detach();
            let loss = cross_entropy(&logits, &batch.labels)?.to_scalar::<f32>()? as f64;
            metrics.update(&logits, &batch.labels, loss)?;
        }

        metrics.finalize()
    }

    /// Send training event
    fn send_event(&self, event: TrainingEvent) {
        if let Some(tx) = &self.event_tx {
            if tx.send(event).is_err() {
                debug!("Training event receiver dropped");
            }
        }
    }

    /// Get training state
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Evaluation cadence and histories
    pub fn cadence(&self) -> &EvaluationCadence {
        &self.cadence
    }

    /// Step executor
    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    /// Model being trained
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Training batches per epoch the schedule was sized for
    pub fn steps_per_epoch(&self) -> usize {
        self.steps_per_epoch
    }

    /// Get training configuration
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }
}
