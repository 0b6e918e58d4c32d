//! Correlation of outbound requests with their eventual replies.
//!
//! A [`CorrelationTable`] maps an opaque reference to whatever the initiator needs to finish the
//! exchange, usually the [`Trigger`] of a pending [`DeferredCompletion`]. Entries are inserted
//! before the request leaves the process and removed exactly once: by the matching reply, by a
//! timer orphaning the call, or by teardown through [`CorrelationTable::fail_all`].
//!
//! Every operation takes the table's single lock. Triggers are always resolved after that lock is
//! released, so observers are free to issue new calls against the same table.
//!
//! [`DeferredCompletion`]: crate::completion::DeferredCompletion

use crate::completion::{Failure, Outcome, Trigger};
use crate::identity::CallReference;
use crate::message::ReturnMessage;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Correlation table misuse or protocol violation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelationError {
    /// A live reference was inserted twice
    #[error("reference {0} already awaits a reply")]
    DuplicateReference(String),

    /// A reply arrived for a reference with no outstanding entry
    #[error("no outstanding request for reference {0}")]
    UnexpectedReference(String),

    /// A bounded insert found the table at its limit
    #[error("{limit} requests already outstanding")]
    Full {
        /// The limit that was reached
        limit: usize,
    },
}

/// Thread-safe table of outstanding requests keyed by reference.
pub struct CorrelationTable<K, V> {
    entries: Mutex<HashMap<K, V>>,
}

/// The table every component endpoint keeps for its calls, acquires and registrations.
pub type PendingCallTable = CorrelationTable<CallReference, Trigger<ReturnMessage>>;

impl<K, V> CorrelationTable<K, V>
where
    K: Eq + Hash + Display,
{
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, V>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the expectation of exactly one reply for `reference`
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::DuplicateReference`] if the reference is already outstanding.
    /// The rejected value is dropped.
    pub fn put(&self, reference: K, value: V) -> Result<(), CorrelationError> {
        match self.lock().entry(reference) {
            Entry::Occupied(entry) => {
                tracing::error!(reference = %entry.key(), "duplicate correlation reference");
                Err(CorrelationError::DuplicateReference(entry.key().to_string()))
            },
            Entry::Vacant(entry) => {
                entry.insert(value);
                Ok(())
            },
        }
    }

    /// Like [`CorrelationTable::put`], but refuse while `limit` entries are outstanding
    ///
    /// The size check and the insert happen under one lock, so concurrent callers never push the
    /// table past `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::Full`] at the limit, otherwise as [`CorrelationTable::put`].
    pub fn put_bounded(&self, reference: K, value: V, limit: usize) -> Result<(), CorrelationError> {
        let mut entries = self.lock();
        if entries.len() >= limit {
            return Err(CorrelationError::Full { limit });
        }
        match entries.entry(reference) {
            Entry::Occupied(entry) => {
                tracing::error!(reference = %entry.key(), "duplicate correlation reference");
                Err(CorrelationError::DuplicateReference(entry.key().to_string()))
            },
            Entry::Vacant(entry) => {
                entry.insert(value);
                Ok(())
            },
        }
    }

    /// Atomically take the entry for `reference`
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::UnexpectedReference`] if nothing is outstanding under it.
    pub fn remove(&self, reference: &K) -> Result<V, CorrelationError> {
        let removed = self.lock().remove(reference);
        removed.ok_or_else(|| CorrelationError::UnexpectedReference(reference.to_string()))
    }

    /// Whether `reference` is outstanding
    #[must_use]
    pub fn contains(&self, reference: &K) -> bool {
        self.lock().contains_key(reference)
    }

    /// Number of outstanding entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is outstanding
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove and return every outstanding entry
    #[must_use]
    pub fn drain(&self) -> Vec<(K, V)> {
        self.lock().drain().collect()
    }
}

impl<K, T> CorrelationTable<K, Trigger<T>>
where
    K: Eq + Hash + Display,
{
    /// Resolve the completion waiting on `reference` with `outcome`
    ///
    /// # Errors
    ///
    /// Returns [`CorrelationError::UnexpectedReference`] if nothing is outstanding under it; the
    /// outcome is dropped.
    pub fn complete(&self, reference: &K, outcome: Outcome<T>) -> Result<(), CorrelationError> {
        let trigger = self.remove(reference)?;
        let _ = trigger.resolve(outcome);
        Ok(())
    }

    /// Fail every outstanding entry with `cause`, leaving the table empty
    ///
    /// Returns how many entries were failed.
    pub fn fail_all(&self, cause: &Failure) -> usize {
        let drained = self.drain();
        let count = drained.len();
        for (reference, trigger) in drained {
            tracing::debug!(%reference, "failing outstanding request");
            let _ = trigger.fail(cause.clone());
        }
        count
    }
}

impl<K, V> Default for CorrelationTable<K, V>
where
    K: Eq + Hash + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> std::fmt::Debug for CorrelationTable<K, V>
where
    K: Eq + Hash + Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationTable")
            .field("outstanding", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::completion::{DeferredCompletion, FailureKind};
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_put_rejects_duplicate_live_reference() {
        let table = CorrelationTable::<CallReference, u32>::new();
        let reference = CallReference::mint();
        table.put(reference, 1).unwrap();

        let error = table.put(reference, 2).unwrap_err();
        assert!(matches!(error, CorrelationError::DuplicateReference(_)));
        assert_eq!(table.remove(&reference).unwrap(), 1);
    }

    #[test]
    fn test_bounded_put_never_exceeds_limit_under_contention() {
        let table = Arc::new(CorrelationTable::<CallReference, u32>::new());
        let accepted: usize = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|n| table.put_bounded(CallReference::mint(), *n, 10).is_ok())
                        .count()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .sum();

        assert_eq!(accepted, 10);
        assert_eq!(table.len(), 10);
        assert_eq!(
            table.put_bounded(CallReference::mint(), 0, 10),
            Err(CorrelationError::Full { limit: 10 })
        );
    }

    #[test]
    fn test_bounded_put_rejects_duplicate_below_limit() {
        let table = CorrelationTable::<CallReference, u32>::new();
        let reference = CallReference::mint();
        table.put_bounded(reference, 1, 2).unwrap();

        assert!(matches!(
            table.put_bounded(reference, 2, 2),
            Err(CorrelationError::DuplicateReference(_))
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_unknown_reference_is_unexpected() {
        let table = CorrelationTable::<CallReference, u32>::new();
        let error = table.remove(&CallReference::mint()).unwrap_err();
        assert!(matches!(error, CorrelationError::UnexpectedReference(_)));
    }

    #[test]
    fn test_entry_is_removed_exactly_once() {
        let table = CorrelationTable::<CallReference, Trigger<u32>>::new();
        let (completion, trigger) = DeferredCompletion::pending();
        let reference = CallReference::mint();
        table.put(reference, trigger).unwrap();

        table.complete(&reference, Ok(10)).unwrap();
        assert!(table.complete(&reference, Ok(11)).is_err());
        assert_eq!(completion.value().unwrap(), 10);
        assert!(table.is_empty());
    }

    #[test]
    fn test_fail_all_resolves_every_entry_and_empties_table() {
        let table = CorrelationTable::<CallReference, Trigger<u32>>::new();
        let completions: Vec<_> = (0..3)
            .map(|_| {
                let (completion, trigger) = DeferredCompletion::pending();
                table.put(CallReference::mint(), trigger).unwrap();
                completion
            })
            .collect();

        let failed = table.fail_all(&Failure::channel_closed("transport closed"));
        assert_eq!(failed, 3);
        assert!(table.is_empty());
        for completion in completions {
            assert!(completion.cause().unwrap().unwrap().is(FailureKind::ChannelClosed));
        }
    }

    #[test]
    fn test_observer_can_reenter_table_during_resolution() {
        let table = Arc::new(CorrelationTable::<CallReference, Trigger<u32>>::new());
        let (completion, trigger) = DeferredCompletion::pending();
        let first = CallReference::mint();
        table.put(first, trigger).unwrap();

        let reentrant = Arc::clone(&table);
        completion.observe(move |_| {
            let (_, follow_up) = DeferredCompletion::<u32>::pending();
            reentrant.put(CallReference::mint(), follow_up).unwrap();
        });

        table.complete(&first, Ok(1)).unwrap();
        assert_eq!(table.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_completion_order_never_crosses_entries(
            order in Just((0..16u32).collect::<Vec<_>>()).prop_shuffle()
        ) {
            let table = CorrelationTable::<CallReference, Trigger<u32>>::new();
            let entries: Vec<_> = (0..16u32)
                .map(|n| {
                    let (completion, trigger) = DeferredCompletion::pending();
                    let reference = CallReference::mint();
                    table.put(reference, trigger).unwrap();
                    (n, reference, completion)
                })
                .collect();

            for &index in &order {
                let (n, reference, _) = &entries[index as usize];
                table.complete(reference, Ok(*n)).unwrap();
            }

            prop_assert!(table.is_empty());
            for (n, _, completion) in entries {
                prop_assert_eq!(completion.value().unwrap(), n);
            }
        }
    }
}
