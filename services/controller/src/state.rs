//! Application state shared across request handlers.

use std::sync::Arc;

use crate::locator::ActiveBaselineLocator;
use crate::store::Cluster;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    cluster: Cluster,
    locator: ActiveBaselineLocator,
}

impl AppState {
    pub fn new(cluster: Cluster, locator: ActiveBaselineLocator) -> Self {
        Self {
            inner: Arc::new(AppStateInner { cluster, locator }),
        }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.inner.cluster
    }

    pub fn locator(&self) -> &ActiveBaselineLocator {
        &self.inner.locator
    }
}
