//! Node selection.
//!
//! A selector is a conjunction of exact label equalities. An empty selector
//! matches every node; that is the catch-all group, not an error.
//!
//! When several groups select the same node exactly one of them governs it:
//!
//! 1. the selector with the most keys (most specific) wins;
//! 2. among equally specific selectors, the group whose `(namespace, name)`
//!    sorts first wins.
//!
//! The winner depends only on the candidate set, never on iteration order.

use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Required label values, keyed by label name.
pub type NodeSelector = BTreeMap<String, String>;

/// Labels carried by a node.
pub type Labels = BTreeMap<String, String>;

/// Returns true if every selector key is present in `labels` with an equal value.
pub fn matches(selector: &NodeSelector, labels: &Labels) -> bool {
    selector
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

/// Something that can govern a node through a selector.
pub trait SelectorCandidate {
    fn node_selector(&self) -> &NodeSelector;

    /// Stable identity used to break ties: `(namespace, name)`.
    fn identity(&self) -> (&str, &str);
}

/// Pick the single candidate that governs a node with `labels`.
pub fn select_winner<'a, T, I>(candidates: I, labels: &Labels) -> Option<&'a T>
where
    T: SelectorCandidate + 'a,
    I: IntoIterator<Item = &'a T>,
{
    candidates
        .into_iter()
        .filter(|candidate| matches(candidate.node_selector(), labels))
        .max_by(|a, b| precedence(*a, *b))
}

/// Greater means "wins".
fn precedence<T: SelectorCandidate>(a: &T, b: &T) -> Ordering {
    a.node_selector()
        .len()
        .cmp(&b.node_selector().len())
        .then_with(|| b.identity().cmp(&a.identity()))
}
