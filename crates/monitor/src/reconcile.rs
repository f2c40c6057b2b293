//! Change detection between two threshold snapshots.
//!
//! Pure functions over [`Snapshot`]s so the reconcile step can be exercised
//! without timers, a broker, or a filesystem.

use std::collections::BTreeSet;

use crate::thresholds::{threshold_key, Point, Snapshot};

/// Keys whose value differs between `old` and `new`. A key present on only
/// one side counts as changed.
pub fn diff(old: &Snapshot, new: &Snapshot) -> BTreeSet<String> {
    let mut changed = BTreeSet::new();
    for (key, value) in new {
        if old.get(key) != Some(value) {
            changed.insert(key.clone());
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            changed.insert(key.clone());
        }
    }
    changed
}

/// Names of the plants whose wet or dry point key changed, in input order.
pub fn changed_plants<'a>(
    names: impl IntoIterator<Item = &'a str>,
    old: &Snapshot,
    new: &Snapshot,
) -> Vec<&'a str> {
    let changed = diff(old, new);
    names
        .into_iter()
        .filter(|name| {
            Point::ALL
                .iter()
                .any(|&p| changed.contains(&threshold_key(name, p)))
        })
        .collect()
}
