//! Byte layouts of keys and values shared by the stores.

use std::collections::BTreeMap;

use commitinfo_types::{COMMIT_ID_LEN, CommitId, Contribution};

use crate::error::{IndexError, Result};

pub fn int_key(value: i32) -> [u8; 4] {
    value.to_be_bytes()
}

pub fn long_key(value: u64) -> [u8; 8] {
    value.to_be_bytes()
}

pub fn decode_int(store: &'static str, bytes: &[u8]) -> Result<i32> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| IndexError::corrupt(store, format!("expected 4 bytes, got {}", bytes.len())))?;
    Ok(i32::from_be_bytes(raw))
}

pub fn decode_long(store: &'static str, bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| IndexError::corrupt(store, format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

/// Packs an email index and a path index into one commit-count key.
pub fn commit_count_key(email_index: i32, path_index: i32) -> u64 {
    ((email_index as u32 as u64) << 32) | (path_index as u32 as u64)
}

pub fn encode_commits(ids: &[CommitId]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(ids.len() * COMMIT_ID_LEN);
    for id in ids {
        bytes.extend_from_slice(id.as_bytes());
    }
    bytes
}

/// Decodes a run of 20-byte ids, skipping a leading flag prefix if present.
pub fn decode_commits(bytes: &[u8]) -> Vec<CommitId> {
    let prefix = bytes.len() % COMMIT_ID_LEN;
    bytes[prefix..]
        .chunks_exact(COMMIT_ID_LEN)
        .filter_map(CommitId::from_slice)
        .collect()
}

pub fn encode_ints(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_be_bytes()).collect()
}

pub fn decode_ints(store: &'static str, bytes: &[u8]) -> Result<Vec<i32>> {
    if bytes.len() % 4 != 0 {
        return Err(IndexError::corrupt(
            store,
            format!("int list of {} bytes", bytes.len()),
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Encodes `(key, commits, additions, deletions)` records, 16 bytes each.
pub fn encode_contributions(map: &BTreeMap<i32, Contribution>) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(map.len() * 16);
    for (key, contribution) in map {
        bytes.extend_from_slice(&key.to_be_bytes());
        bytes.extend_from_slice(&contribution.commits.to_be_bytes());
        bytes.extend_from_slice(&contribution.additions.to_be_bytes());
        bytes.extend_from_slice(&contribution.deletions.to_be_bytes());
    }
    bytes
}

pub fn decode_contributions(
    store: &'static str,
    bytes: &[u8],
) -> Result<BTreeMap<i32, Contribution>> {
    let ints = decode_ints(store, bytes)?;
    if ints.len() % 4 != 0 {
        return Err(IndexError::corrupt(
            store,
            format!("contribution record of {} bytes", bytes.len()),
        ));
    }
    Ok(ints
        .chunks_exact(4)
        .map(|record| (record[0], Contribution::new(record[1], record[2], record[3])))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_count_key_keeps_both_halves() {
        let key = commit_count_key(3, 7);
        assert_eq!(key >> 32, 3);
        assert_eq!(key & 0xffff_ffff, 7);
    }

    #[test]
    fn decode_commits_skips_flag_prefix() {
        let a = CommitId::new([1u8; 20]);
        let b = CommitId::new([2u8; 20]);
        let mut bytes = vec![0xff];
        bytes.extend(encode_commits(&[a, b]));
        assert_eq!(decode_commits(&bytes), vec![a, b]);
    }

    #[test]
    fn malformed_int_list_is_corrupt() {
        let err = decode_ints("history_paths", &[0, 1, 2]).expect_err("should fail");
        assert!(matches!(err, IndexError::Corrupt { .. }));
    }

    #[test]
    fn contributions_decode_in_key_order() {
        let mut map = BTreeMap::new();
        map.insert(5, Contribution::new(1, 10, 2));
        map.insert(-3, Contribution::new(2, 0, 4));
        let decoded = decode_contributions("daily", &encode_contributions(&map)).expect("decode");
        assert_eq!(decoded, map);
    }
}
