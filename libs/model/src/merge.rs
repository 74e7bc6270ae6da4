//! Configuration merge.
//!
//! The merge is a keyed union: every entry of the first input in order,
//! then every entry of the second input in order, skipping entries whose
//! dedup key was already emitted. The first occurrence of a key wins, so the
//! result never depends on anything but the two inputs.

use std::collections::HashSet;
use std::hash::Hash;

use crate::config::{ConfigModel, RouteModel, RuleModel, SettingsModel, VlanModel};

/// Merge `second` on top of `first`.
///
/// Total: empty inputs contribute nothing. Within each category the output
/// never holds two entries with the same dedup key.
pub fn merge_configs(first: &ConfigModel, second: &ConfigModel) -> ConfigModel {
    ConfigModel {
        rules: union_by_key(&first.rules, &second.rules, RuleModel::dedup_key),
        settings: SettingsModel {
            table_hard_sync: union_by_key(
                &first.settings.table_hard_sync,
                &second.settings.table_hard_sync,
                |table| *table,
            ),
        },
        routes: union_by_key(&first.routes, &second.routes, RouteModel::dedup_key),
        vlans: union_by_key(&first.vlans, &second.vlans, VlanModel::dedup_key),
    }
}

/// Remove duplicate entries from a single configuration.
pub fn dedup(config: &ConfigModel) -> ConfigModel {
    merge_configs(config, &ConfigModel::default())
}

fn union_by_key<'a, T, K, F>(first: &'a [T], second: &'a [T], key: F) -> Vec<T>
where
    T: Clone,
    K: Eq + Hash,
    F: Fn(&'a T) -> K,
{
    let mut seen = HashSet::with_capacity(first.len() + second.len());
    first
        .iter()
        .chain(second)
        .filter(|item| seen.insert(key(*item)))
        .cloned()
        .collect()
}
