//! Single-slot store for the active recognition model.
//!
//! Backed by a `tokio::sync::watch` channel: publishing swaps an
//! `Arc<Model>` into the slot under the channel's write lock, readers clone
//! the `Arc` out and keep using it for as long as they like. Every publish
//! bumps a generation counter so consumers can tell when the model changed
//! without polling a flag.

use crate::model::Model;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("model store closed")]
    Closed,
}

/// A published model together with its publish generation (1-based).
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub generation: u64,
    pub model: Arc<Model>,
}

/// Clone-safe handle to the active model slot.
#[derive(Clone)]
pub struct ModelStore {
    tx: Arc<watch::Sender<Option<Snapshot>>>,
}

impl Default for ModelStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Replace the active model. Returns the new generation.
    pub fn publish(&self, model: impl Into<Arc<Model>>) -> u64 {
        let model = model.into();
        let mut generation = 0;
        self.tx.send_modify(|slot| {
            generation = slot.as_ref().map_or(0, |s| s.generation) + 1;
            *slot = Some(Snapshot { generation, model });
        });
        tracing::info!(generation, "model published");
        generation
    }

    /// Current model, or `None` if nothing has been published yet.
    pub fn fetch(&self) -> Option<Snapshot> {
        self.tx.borrow().clone()
    }

    /// Generation of the active model (0 before the first publish).
    pub fn generation(&self) -> u64 {
        self.tx.borrow().as_ref().map_or(0, |s| s.generation)
    }

    /// Wait until a model is available and return it.
    pub async fn wait_ready(&self) -> Result<Snapshot, StoreError> {
        let mut rx = self.tx.subscribe();
        let slot = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| StoreError::Closed)?;
        slot.clone().ok_or(StoreError::Closed)
    }
}
