//! In-place filtering of the dispatcher's collections. Entries that are dropped are handed to a
//!  removal action, so callers can dispose channels or resolve pending callers without
//!  interrupting the remaining entries.

use std::collections::{BTreeMap, VecDeque};
use std::hash::{BuildHasher, Hash};
use std::collections::HashMap;

pub fn filter_vec<T>(v: &mut Vec<T>, mut keep: impl FnMut(&T) -> bool, mut on_removed: impl FnMut(T)) {
    if v.iter().all(&mut keep) {
        return;
    }

    for element in std::mem::take(v) {
        if keep(&element) {
            v.push(element);
        }
        else {
            on_removed(element);
        }
    }
}

pub fn filter_deque<T>(queue: &mut VecDeque<T>, mut keep: impl FnMut(&T) -> bool, mut on_removed: impl FnMut(T)) {
    if queue.iter().all(&mut keep) {
        return;
    }

    for element in std::mem::take(queue) {
        if keep(&element) {
            queue.push_back(element);
        }
        else {
            on_removed(element);
        }
    }
}

/// Filters every queue in a map of queues, preserving order within each queue. Queues that end
///  up empty are removed from the map.
pub fn filter_queues<K: Ord + Clone, V>(queues: &mut BTreeMap<K, VecDeque<V>>, mut keep: impl FnMut(&V) -> bool, mut on_removed: impl FnMut(&K, V)) {
    let mut emptied = Vec::new();

    for (key, queue) in queues.iter_mut() {
        filter_deque(queue, &mut keep, |element| on_removed(key, element));
        if queue.is_empty() {
            emptied.push(key.clone());
        }
    }

    for key in emptied {
        queues.remove(&key);
    }
}

pub fn filter_map<K: Eq + Hash + Clone, V, S: BuildHasher>(map: &mut HashMap<K, V, S>, mut keep: impl FnMut(&V) -> bool, mut on_removed: impl FnMut(K, V)) {
    let to_remove = map.iter()
        .filter(|(_, v)| !keep(v))
        .map(|(k, _)| k.clone())
        .collect::<Vec<_>>();

    for key in to_remove {
        if let Some(value) = map.remove(&key) {
            on_removed(key, value);
        }
    }
}
