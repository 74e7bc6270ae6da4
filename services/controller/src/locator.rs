//! Identity of the cluster baseline currently in force.

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::resources::ObjectKey;

/// Process-wide pointer to the active ClusterConfig.
///
/// Written by the cluster-config controller, read by anything that needs to
/// map a FullConfig change back to the baseline. Cloning shares the value.
/// Empty until the first baseline is observed; a restart starts empty again.
#[derive(Debug, Clone, Default)]
pub struct ActiveBaselineLocator {
    current: Arc<ArcSwapOption<ObjectKey>>,
}

impl ActiveBaselineLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `key` as the active baseline. Returns the previous one.
    pub fn publish(&self, key: ObjectKey) -> Option<ObjectKey> {
        self.current
            .swap(Some(Arc::new(key)))
            .map(|previous| (*previous).clone())
    }

    pub fn current(&self) -> Option<ObjectKey> {
        self.current.load_full().map(|key| (*key).clone())
    }
}
