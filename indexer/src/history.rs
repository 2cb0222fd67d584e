//! Rename chains. Each path index maps to the set of path indexes it was
//! renamed from, capped so a path with a long rename history stays bounded.

use std::collections::{BTreeSet, HashSet, VecDeque};

use crate::codec::{decode_ints, encode_ints, int_key};
use crate::dictionary;
use crate::error::Result;
use crate::store::{StoreName, Txn};

fn previous_paths(txn: &Txn<'_>, index: i32) -> Result<Vec<i32>> {
    match txn.get(StoreName::HistoryPaths, &int_key(index))? {
        Some(bytes) => decode_ints("history_paths", &bytes),
        None => Ok(Vec::new()),
    }
}

/// Records that `new_path` was renamed from `old_path`. Returns false when the
/// entry was already present or the set is full.
pub fn record_rename(txn: &Txn<'_>, old_path: &str, new_path: &str, cap: usize) -> Result<bool> {
    if old_path == new_path {
        return Ok(false);
    }
    let old_index = dictionary::path_index(txn, old_path)?;
    let new_index = dictionary::path_index(txn, new_path)?;

    let mut previous = previous_paths(txn, new_index)?;
    if previous.len() >= cap || previous.contains(&old_index) {
        return Ok(false);
    }
    previous.push(old_index);
    txn.put(StoreName::HistoryPaths, &int_key(new_index), &encode_ints(&previous))?;
    Ok(true)
}

/// Paths `path` was known under before, following rename chains breadth first
/// and stopping at `cap` entries. The queried path itself is not included.
pub fn history_paths(txn: &Txn<'_>, path: &str, cap: usize) -> Result<BTreeSet<String>> {
    let Some(start) = dictionary::find_path(txn, path)? else {
        return Ok(BTreeSet::new());
    };

    let mut visited = HashSet::from([start]);
    let mut found = Vec::new();
    let mut queue = VecDeque::from([start]);
    'walk: while let Some(current) = queue.pop_front() {
        for previous in previous_paths(txn, current)? {
            if found.len() >= cap {
                break 'walk;
            }
            if visited.insert(previous) {
                found.push(previous);
                queue.push_back(previous);
            }
        }
    }

    let mut paths = BTreeSet::new();
    for index in found {
        if let Some(name) = dictionary::path_of(txn, index)? {
            paths.insert(name);
        }
    }
    Ok(paths)
}
