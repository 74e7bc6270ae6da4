//! Startup seed: a YAML document of records applied to the store.
//!
//! ```yaml
//! clusterConfigs:
//!   - metadata: { namespace: default, name: baseline }
//!     spec:
//!       config:
//!         rules: [{ from: 10.0.0.0/8, table: 100 }]
//! nodeConfigs: []
//! nodes: []
//! pods: []
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::resources::{ClusterConfig, Node, NodeConfig, Pod, Resource};
use crate::store::{apply, Cluster, Stored};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub cluster_configs: Vec<ClusterConfig>,
    #[serde(default)]
    pub node_configs: Vec<NodeConfig>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub pods: Vec<Pod>,
}

impl Manifest {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).context("failed to parse manifest")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("invalid manifest {}", path.display()))
    }

    /// Apply every record. Returns how many were applied.
    pub async fn apply(self, cluster: &Cluster) -> Result<usize> {
        let mut applied = 0;
        applied += apply_all(cluster, self.nodes).await?;
        applied += apply_all(cluster, self.pods).await?;
        applied += apply_all(cluster, self.cluster_configs).await?;
        applied += apply_all(cluster, self.node_configs).await?;
        info!(applied, "Manifest applied");
        Ok(applied)
    }
}

async fn apply_all<K: Stored>(cluster: &Cluster, items: Vec<K>) -> Result<usize> {
    let count = items.len();
    for item in items {
        let key = item.key();
        apply(K::store(cluster).as_ref(), item)
            .await
            .with_context(|| format!("failed to apply {} {}", K::KIND, key))?;
    }
    Ok(count)
}
