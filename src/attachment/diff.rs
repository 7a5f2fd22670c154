//! Key-based comparison of desired and observed attachment lists.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use thiserror::Error;

use super::{AttachmentDelta, NetworkAttachment, TopologyKeyed};

/// In-place update for an attachment present on both sides.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttachmentUpdate<A, D> {
    /// Desired attachment.
    pub desired: A,
    /// Observed attachment.
    pub observed: A,
    /// Only the sub-fields that differ.
    pub delta: D,
}

/// Partitioned classification of attachments between two lists.
///
/// Partitions are keyed by topology key, so the same inputs in any order
/// produce an identical change-set.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChangeSet<K, A, D> {
    /// Attachments present only in the desired list.
    pub create: BTreeMap<K, A>,
    /// Attachments present only in the observed list.
    pub delete: BTreeMap<K, A>,
    /// Attachments present on both sides with differing mutable fields.
    pub update: BTreeMap<K, AttachmentUpdate<A, D>>,
    /// Keys present on both sides with nothing to change.
    pub unchanged: BTreeSet<K>,
}

/// Change-set over [`NetworkAttachment`]s.
pub type AttachmentChangeSet = ChangeSet<String, NetworkAttachment, AttachmentDelta>;

impl<K, A, D> Default for ChangeSet<K, A, D> {
    fn default() -> Self {
        Self {
            create: BTreeMap::new(),
            delete: BTreeMap::new(),
            update: BTreeMap::new(),
            unchanged: BTreeSet::new(),
        }
    }
}

impl<K: Ord, A, D> ChangeSet<K, A, D> {
    /// Returns `true` when any attachment is created, deleted, or updated.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !(self.create.is_empty() && self.delete.is_empty() && self.update.is_empty())
    }

    /// Every key the change-set classifies.
    #[must_use]
    pub fn keys(&self) -> BTreeSet<&K> {
        self.create
            .keys()
            .chain(self.delete.keys())
            .chain(self.update.keys())
            .chain(self.unchanged.iter())
            .collect()
    }
}

/// Which input list an error refers to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ListSide {
    /// Caller-declared attachments.
    Desired,
    /// Last persisted attachments.
    Observed,
}

impl fmt::Display for ListSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Desired => f.write_str("desired"),
            Self::Observed => f.write_str("observed"),
        }
    }
}

/// Errors raised while diffing attachment lists.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DiffError {
    /// Raised when two attachments in one list share a topology key.
    #[error("topology key '{key}' appears more than once in the {side} attachment list")]
    DuplicateTopologyKey {
        /// Repeated key.
        key: String,
        /// List containing the repetition.
        side: ListSide,
    },
}

/// Compares desired against observed attachments by topology key.
///
/// # Errors
///
/// Returns [`DiffError::DuplicateTopologyKey`] when either list repeats a key.
pub fn diff<A>(desired: &[A], observed: &[A]) -> Result<ChangeSet<A::Key, A, A::Delta>, DiffError>
where
    A: TopologyKeyed + Clone,
{
    let wanted = index_by_key(desired, ListSide::Desired)?;
    let current = index_by_key(observed, ListSide::Observed)?;
    let mut changes = ChangeSet::default();

    for (key, desired_item) in &wanted {
        let Some(observed_item) = current.get(key) else {
            changes.create.insert(key.clone(), (*desired_item).clone());
            continue;
        };
        match desired_item.delta_from(observed_item) {
            Some(delta) => {
                changes.update.insert(
                    key.clone(),
                    AttachmentUpdate {
                        desired: (*desired_item).clone(),
                        observed: (*observed_item).clone(),
                        delta,
                    },
                );
            }
            None => {
                changes.unchanged.insert(key.clone());
            }
        }
    }

    for (key, observed_item) in current {
        if !wanted.contains_key(&key) {
            changes.delete.insert(key, observed_item.clone());
        }
    }

    Ok(changes)
}

fn index_by_key<A: TopologyKeyed>(
    items: &[A],
    side: ListSide,
) -> Result<BTreeMap<A::Key, &A>, DiffError> {
    let mut index = BTreeMap::new();
    for item in items {
        let key = item.topology_key();
        if index.contains_key(&key) {
            return Err(DiffError::DuplicateTopologyKey {
                key: key.to_string(),
                side,
            });
        }
        index.insert(key, item);
    }
    Ok(index)
}
