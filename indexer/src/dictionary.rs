//! Dense integer encoding for paths, user identities and emails.
//!
//! Indexes are allocated from a per-kind counter in the default store. The
//! incremented counter is written in the same transaction that hands out the
//! index, so two allocations never share a value. Entries are never deleted.

use commitinfo_types::NameAndEmail;

use crate::codec::{decode_int, int_key};
use crate::error::{IndexError, Result};
use crate::store::{StoreName, Txn, keys};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictionaryKind {
    Path,
    User,
    Email,
}

impl DictionaryKind {
    fn forward(self) -> StoreName {
        match self {
            DictionaryKind::Path => StoreName::PathToIndex,
            DictionaryKind::User => StoreName::UserToIndex,
            DictionaryKind::Email => StoreName::EmailToIndex,
        }
    }

    fn reverse(self) -> StoreName {
        match self {
            DictionaryKind::Path => StoreName::IndexToPath,
            DictionaryKind::User => StoreName::IndexToUser,
            DictionaryKind::Email => StoreName::IndexToEmail,
        }
    }

    fn counter(self) -> &'static [u8] {
        match self {
            DictionaryKind::Path => keys::NEXT_PATH_INDEX,
            DictionaryKind::User => keys::NEXT_USER_INDEX,
            DictionaryKind::Email => keys::NEXT_EMAIL_INDEX,
        }
    }

    fn store_label(self) -> &'static str {
        self.forward().table()
    }
}

pub fn find(txn: &Txn<'_>, kind: DictionaryKind, value: &[u8]) -> Result<Option<i32>> {
    txn.get(kind.forward(), value)?
        .map(|bytes| decode_int(kind.store_label(), &bytes))
        .transpose()
}

pub fn index_of(txn: &Txn<'_>, kind: DictionaryKind, value: &[u8]) -> Result<i32> {
    if let Some(index) = find(txn, kind, value)? {
        return Ok(index);
    }

    let next = match txn.get(StoreName::Default, kind.counter())? {
        Some(bytes) => decode_int("default_store", &bytes)?,
        None => 0,
    };
    txn.put(StoreName::Default, kind.counter(), &int_key(next + 1))?;
    txn.put(kind.forward(), value, &int_key(next))?;
    txn.put(kind.reverse(), &int_key(next), value)?;
    Ok(next)
}

pub fn value_of(txn: &Txn<'_>, kind: DictionaryKind, index: i32) -> Result<Option<Vec<u8>>> {
    txn.get(kind.reverse(), &int_key(index))
}

pub fn path_index(txn: &Txn<'_>, path: &str) -> Result<i32> {
    index_of(txn, DictionaryKind::Path, path.as_bytes())
}

pub fn find_path(txn: &Txn<'_>, path: &str) -> Result<Option<i32>> {
    find(txn, DictionaryKind::Path, path.as_bytes())
}

pub fn path_of(txn: &Txn<'_>, index: i32) -> Result<Option<String>> {
    value_of(txn, DictionaryKind::Path, index)?
        .map(|bytes| utf8("index_to_path", bytes))
        .transpose()
}

pub fn email_index(txn: &Txn<'_>, email: &str) -> Result<i32> {
    index_of(txn, DictionaryKind::Email, email.as_bytes())
}

pub fn find_email(txn: &Txn<'_>, email: &str) -> Result<Option<i32>> {
    find(txn, DictionaryKind::Email, email.as_bytes())
}

pub fn user_index(txn: &Txn<'_>, user: &NameAndEmail) -> Result<i32> {
    index_of(txn, DictionaryKind::User, &serde_json::to_vec(user)?)
}

pub fn user_of(txn: &Txn<'_>, index: i32) -> Result<Option<NameAndEmail>> {
    match value_of(txn, DictionaryKind::User, index)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn utf8(store: &'static str, bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|err| IndexError::corrupt(store, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Environment;

    #[test]
    fn allocates_dense_indexes_per_kind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = Environment::open(dir.path()).expect("open");

        let (a, b, a_again, email) = env
            .compute_in_transaction(|txn| {
                Ok((
                    path_index(txn, "src/a.rs")?,
                    path_index(txn, "src/b.rs")?,
                    path_index(txn, "src/a.rs")?,
                    email_index(txn, "dev@example.com")?,
                ))
            })
            .expect("allocate");

        assert_eq!((a, b, a_again), (0, 1, 0));
        assert_eq!(email, 0);

        let path = env
            .compute_in_readonly_transaction(|txn| path_of(txn, 1))
            .expect("lookup");
        assert_eq!(path.as_deref(), Some("src/b.rs"));
    }

    #[test]
    fn counter_survives_across_transactions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = Environment::open(dir.path()).expect("open");

        env.compute_in_transaction(|txn| path_index(txn, "one")).expect("first");
        let second = env
            .compute_in_transaction(|txn| path_index(txn, "two"))
            .expect("second");
        assert_eq!(second, 1);
    }

    #[test]
    fn users_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = Environment::open(dir.path()).expect("open");
        let user = NameAndEmail::new("Ada", "ada@example.com");

        let index = env
            .compute_in_transaction(|txn| user_index(txn, &user))
            .expect("allocate");
        let found = env
            .compute_in_readonly_transaction(|txn| user_of(txn, index))
            .expect("lookup");
        assert_eq!(found, Some(user));
    }
}
