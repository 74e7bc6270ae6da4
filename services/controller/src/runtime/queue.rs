//! Deduplicating work queue with delayed entries.

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::time::Instant;

use crate::resources::ObjectKey;

/// Keys waiting to be reconciled.
///
/// A key sits in the queue at most once: either ready or delayed. Pushing a
/// ready key again is a no-op; pushing a delayed key makes it ready.
#[derive(Debug, Default)]
pub(crate) struct WorkQueue {
    ready: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    delayed: HashMap<ObjectKey, Instant>,
}

impl WorkQueue {
    pub(crate) fn push(&mut self, key: ObjectKey) {
        self.delayed.remove(&key);
        if self.queued.insert(key.clone()) {
            self.ready.push_back(key);
        }
    }

    /// Schedule `key` for `at`, keeping an earlier deadline if one exists.
    pub(crate) fn push_after(&mut self, key: ObjectKey, at: Instant) {
        if self.queued.contains(&key) {
            return;
        }
        self.delayed
            .entry(key)
            .and_modify(|deadline| *deadline = (*deadline).min(at))
            .or_insert(at);
    }

    pub(crate) fn pop(&mut self) -> Option<ObjectKey> {
        let key = self.ready.pop_front()?;
        self.queued.remove(&key);
        Some(key)
    }

    pub(crate) fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.delayed.values().min().copied()
    }

    /// Move every delayed key due at `now` to the ready queue.
    pub(crate) fn promote_due(&mut self, now: Instant) {
        let mut due: Vec<(ObjectKey, Instant)> = self
            .delayed
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, at)| (key.clone(), *at))
            .collect();
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        for (key, _) in due {
            self.push(key);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }
}
