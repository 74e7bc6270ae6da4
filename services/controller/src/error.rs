//! Reconcile errors.

use thiserror::Error;

use crate::store::StoreError;

/// Errors returned from a reconcile pass. The runtime backs off and retries.
///
/// Optimistic-concurrency conflicts never surface here; passes swallow them.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to render configuration: {0}")]
    Render(#[from] ipruler_model::ModelError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

