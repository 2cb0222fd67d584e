//! Reverse commit graph. Each commit record holds the ids of its children and,
//! once the commit itself has been processed, a one byte collected marker in
//! front of them. A record is collected iff its length is not a multiple of 20.

use std::collections::HashSet;

use commitinfo_types::{COMMIT_ID_LEN, CommitId};

use crate::codec::decode_commits;
use crate::error::Result;
use crate::store::{StoreName, Txn};

const COLLECTED_FLAG: u8 = 1;

fn is_collected_record(bytes: &[u8]) -> bool {
    bytes.len() % COMMIT_ID_LEN != 0
}

pub fn is_collected(txn: &Txn<'_>, id: &CommitId) -> Result<bool> {
    Ok(txn
        .get(StoreName::Commits, id.as_bytes())?
        .is_some_and(|bytes| is_collected_record(&bytes)))
}

/// Marks `id` as collected. Returns false when it already was.
pub fn mark_collected(txn: &Txn<'_>, id: &CommitId) -> Result<bool> {
    let existing = txn.get(StoreName::Commits, id.as_bytes())?;
    let record = match existing {
        Some(bytes) if is_collected_record(&bytes) => return Ok(false),
        Some(bytes) => {
            let mut record = Vec::with_capacity(bytes.len() + 1);
            record.push(COLLECTED_FLAG);
            record.extend_from_slice(&bytes);
            record
        }
        None => vec![COLLECTED_FLAG],
    };
    txn.put(StoreName::Commits, id.as_bytes(), &record)?;
    Ok(true)
}

/// Records `child` as a child of `parent`, creating the parent record if needed.
pub fn add_child(txn: &Txn<'_>, parent: &CommitId, child: &CommitId) -> Result<()> {
    let mut record = txn
        .get(StoreName::Commits, parent.as_bytes())?
        .unwrap_or_default();
    if decode_commits(&record).contains(child) {
        return Ok(());
    }
    record.extend_from_slice(child.as_bytes());
    txn.put(StoreName::Commits, parent.as_bytes(), &record)
}

pub fn children(txn: &Txn<'_>, id: &CommitId) -> Result<Vec<CommitId>> {
    Ok(txn
        .get(StoreName::Commits, id.as_bytes())?
        .map(|bytes| decode_commits(&bytes))
        .unwrap_or_default())
}

/// Every commit reachable from `ancestors` through child edges, including the
/// ancestors themselves.
pub fn descendants(txn: &Txn<'_>, ancestors: &[CommitId]) -> Result<HashSet<CommitId>> {
    let mut seen: HashSet<CommitId> = HashSet::new();
    let mut stack: Vec<CommitId> = ancestors.to_vec();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        for child in children(txn, &id)? {
            if !seen.contains(&child) {
                stack.push(child);
            }
        }
    }
    Ok(seen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Environment;

    fn id(byte: u8) -> CommitId {
        CommitId::new([byte; COMMIT_ID_LEN])
    }

    #[test]
    fn marking_preserves_existing_children() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = Environment::open(dir.path()).expect("open");
        let (parent, child) = (id(1), id(2));

        env.compute_in_transaction(|txn| {
            add_child(txn, &parent, &child)?;
            assert!(!is_collected(txn, &parent)?);
            assert!(mark_collected(txn, &parent)?);
            assert!(!mark_collected(txn, &parent)?);
            assert!(is_collected(txn, &parent)?);
            assert_eq!(children(txn, &parent)?, vec![child]);
            Ok(())
        })
        .expect("txn");
    }

    #[test]
    fn descendants_follow_child_edges() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = Environment::open(dir.path()).expect("open");
        let (root, a, b, c) = (id(1), id(2), id(3), id(4));

        env.compute_in_transaction(|txn| {
            add_child(txn, &root, &a)?;
            add_child(txn, &a, &b)?;
            add_child(txn, &root, &c)?;
            Ok(())
        })
        .expect("edges");

        let from_a = env
            .compute_in_readonly_transaction(|txn| descendants(txn, &[a]))
            .expect("query");
        assert_eq!(from_a, HashSet::from([a, b]));

        let from_root = env
            .compute_in_readonly_transaction(|txn| descendants(txn, &[root]))
            .expect("query");
        assert_eq!(from_root, HashSet::from([root, a, b, c]));
    }

    #[test]
    fn duplicate_edges_are_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = Environment::open(dir.path()).expect("open");
        let (parent, child) = (id(9), id(8));

        let kids = env
            .compute_in_transaction(|txn| {
                add_child(txn, &parent, &child)?;
                add_child(txn, &parent, &child)?;
                children(txn, &parent)
            })
            .expect("txn");
        assert_eq!(kids, vec![child]);
    }
}
