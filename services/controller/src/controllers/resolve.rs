//! Mapping nodes to the FullConfig that governs them.

use ipruler_model::{select_winner, Labels};
use ipruler_reconcile::Action;
use tracing::{debug, info};

use super::Context;
use crate::error::ReconcileError;
use crate::resources::{FullConfig, Resource};

/// FullConfigs that can still win a node: everything not being deleted.
pub(crate) async fn live_full_configs(ctx: &Context) -> Result<Vec<FullConfig>, ReconcileError> {
    let mut all = ctx.cluster.full_configs.list(None).await?;
    all.retain(|full| !full.metadata.is_deleting());
    Ok(all)
}

/// The FullConfig governing a node with `labels`, if any.
pub(crate) fn winner_for<'a>(
    candidates: &'a [FullConfig],
    labels: &Labels,
) -> Option<&'a FullConfig> {
    select_winner(candidates, labels)
}

/// Stamp a fresh trigger token on the FullConfig governing `labels` so the
/// delivery coordinator runs for it.
pub(crate) async fn retrigger(
    ctx: &Context,
    labels: &Labels,
    reason: &'static str,
) -> Result<Action, ReconcileError> {
    let candidates = live_full_configs(ctx).await?;
    let Some(winner) = winner_for(&candidates, labels) else {
        debug!(reason, "No FullConfig matches, nothing to trigger");
        return Ok(Action::Done);
    };

    stamp(ctx, winner.clone(), reason).await?;
    Ok(Action::Done)
}

/// Write a fresh trigger token onto `full`. A lost race is logged and dropped.
pub(crate) async fn stamp(
    ctx: &Context,
    mut full: FullConfig,
    reason: &'static str,
) -> Result<(), ReconcileError> {
    let token = full.stamp_trigger();
    let key = full.key();
    let result = ctx.cluster.full_configs.update(full).await;
    if ctx.settle(&key, result).await?.is_some() {
        info!(
            namespace = %key.namespace,
            name = %key.name,
            reason,
            token = %token,
            "Triggered FullConfig delivery"
        );
    }
    Ok(())
}
