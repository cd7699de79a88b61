//! Periodic background retraining.
//!
//! `Idle → Building → Publishing → Idle`, once immediately and then every
//! interval. A build runs on the blocking pool and only touches the model
//! store at the very end, so a slow or failing build leaves the current
//! model in service.

use crate::announce::Announcer;
use crate::dataset::{load_dataset, DatasetError};
use crate::model::{ModelError, Trainer};
use crate::store::ModelStore;
use crate::types::ImageSize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Spoken when a rebuild starts.
pub const REMODEL_ANNOUNCEMENT: &str = "Remodeling faces";

#[derive(Error, Debug)]
pub enum RetrainError {
    #[error("dataset: {0}")]
    Dataset(#[from] DatasetError),
    #[error("training failed: {0}")]
    Train(#[from] ModelError),
    #[error("build task failed: {0}")]
    Task(String),
}

impl RetrainError {
    /// A missing dataset directory means no model can ever be built.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RetrainError::Dataset(DatasetError::NotFound(_)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrainState {
    Idle,
    Building,
    Publishing,
}

#[derive(Debug, Clone)]
pub struct RetrainerConfig {
    pub dataset_dir: PathBuf,
    pub image_size: ImageSize,
    pub interval: Duration,
    /// Where to persist each published model for warm start.
    pub model_path: Option<PathBuf>,
}

pub struct Retrainer<T: Trainer> {
    config: RetrainerConfig,
    trainer: T,
    store: ModelStore,
    announcer: Announcer,
    state: watch::Sender<RetrainState>,
}

impl<T: Trainer> Retrainer<T> {
    pub fn new(config: RetrainerConfig, trainer: T, store: ModelStore, announcer: Announcer) -> Self {
        let (state, _) = watch::channel(RetrainState::Idle);
        Self {
            config,
            trainer,
            store,
            announcer,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<RetrainState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: RetrainState) {
        tracing::debug!(state = ?next, "retrainer state");
        self.state.send_replace(next);
    }

    /// Build a model from the dataset and publish it. Blocking.
    ///
    /// Returns the published generation. On error nothing is published.
    pub fn rebuild(&self) -> Result<u64, RetrainError> {
        self.set_state(RetrainState::Building);
        let result = self.build_and_publish();
        self.set_state(RetrainState::Idle);
        result
    }

    fn build_and_publish(&self) -> Result<u64, RetrainError> {
        let started = std::time::Instant::now();
        let set = load_dataset(&self.config.dataset_dir, self.config.image_size)?;
        let model = Arc::new(self.trainer.train(&set)?);
        tracing::info!(
            subjects = set.subject_names.len(),
            images = set.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "model computed"
        );

        self.set_state(RetrainState::Publishing);
        let generation = self.store.publish(model.clone());

        if let Some(path) = &self.config.model_path {
            if let Err(e) = model.save(path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to persist model");
            }
        }
        Ok(generation)
    }

    /// Rebuild now and then every interval until `shutdown` flips to true.
    ///
    /// Returns an error only for fatal conditions; any other failed build is
    /// logged and retried on the next tick.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), RetrainError> {
        let this = Arc::new(self);
        tracing::info!(
            dataset = %this.config.dataset_dir.display(),
            interval_secs = this.config.interval.as_secs(),
            "retrainer started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            this.announcer.enqueue(REMODEL_ANNOUNCEMENT);
            let worker = this.clone();
            let outcome = tokio::task::spawn_blocking(move || worker.rebuild())
                .await
                .unwrap_or_else(|e| Err(RetrainError::Task(e.to_string())));

            match outcome {
                Ok(generation) => tracing::info!(generation, "retrain complete"),
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "retrainer cannot continue");
                    return Err(e);
                }
                Err(e) => tracing::warn!(error = %e, "retrain failed; keeping current model"),
            }

            tokio::select! {
                _ = tokio::time::sleep(this.config.interval) => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }

        tracing::info!("retrainer stopped");
        Ok(())
    }

    /// Run on the current tokio runtime.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<Result<(), RetrainError>> {
        tokio::spawn(self.run(shutdown))
    }
}
