use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, info, warn};

use crate::config::RepoId;
use crate::error::{IndexError, Result, poisoned};

/// Bumped whenever the layout of any store changes. Environments written with a
/// different version are discarded and rebuilt from git history.
pub const INFO_VERSION: u32 = 15;

const DB_FILE: &str = "info.db";
const VERSION_FILE: &str = "version";
const SNAPSHOT_ZSTD_LEVEL: i32 = 3;

/// Keys of the `Default` store.
pub mod keys {
    pub const NEXT_PATH_INDEX: &[u8] = b"nextPathIndex";
    pub const NEXT_USER_INDEX: &[u8] = b"nextUserIndex";
    pub const NEXT_EMAIL_INDEX: &[u8] = b"nextEmailIndex";
    pub const COMMIT_COUNT: &[u8] = b"commitCount";
    pub const LAST_COMMIT: &[u8] = b"lastCommit";
    pub const LAST_COMMIT_OF_LINE_STATS: &[u8] = b"lastCommitOfLineStats";
    pub const LAST_COMMIT_OF_CONTRIBS: &[u8] = b"lastCommitOfContribs";
    pub const LAST_COMMIT_OF_FILES: &[u8] = b"lastCommitOfFiles";
    pub const LINE_STATS: &[u8] = b"lineStats";
    pub const USERS: &[u8] = b"users";
    pub const FILES: &[u8] = b"files";
    pub const FILE_COUNT: &[u8] = b"fileCount";
    pub const OVERALL_CONTRIBUTIONS: &[u8] = b"overallContributions";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreName {
    Default,
    Commits,
    FixCommits,
    CommitCounts,
    HistoryPaths,
    PathToIndex,
    IndexToPath,
    UserToIndex,
    IndexToUser,
    EmailToIndex,
    IndexToEmail,
    DailyContributions,
}

impl StoreName {
    pub const ALL: [StoreName; 12] = [
        StoreName::Default,
        StoreName::Commits,
        StoreName::FixCommits,
        StoreName::CommitCounts,
        StoreName::HistoryPaths,
        StoreName::PathToIndex,
        StoreName::IndexToPath,
        StoreName::UserToIndex,
        StoreName::IndexToUser,
        StoreName::EmailToIndex,
        StoreName::IndexToEmail,
        StoreName::DailyContributions,
    ];

    pub fn table(self) -> &'static str {
        match self {
            StoreName::Default => "default_store",
            StoreName::Commits => "commits",
            StoreName::FixCommits => "fix_commits",
            StoreName::CommitCounts => "commit_counts",
            StoreName::HistoryPaths => "history_paths",
            StoreName::PathToIndex => "path_to_index",
            StoreName::IndexToPath => "index_to_path",
            StoreName::UserToIndex => "user_to_index",
            StoreName::IndexToUser => "index_to_user",
            StoreName::EmailToIndex => "email_to_index",
            StoreName::IndexToEmail => "index_to_email",
            StoreName::DailyContributions => "daily_contributions",
        }
    }
}

/// A view of one transaction. Writes are only possible on transactions handed
/// out by [`Environment::compute_in_transaction`]; the read-only connection
/// rejects them.
pub struct Txn<'a> {
    conn: &'a Connection,
}

impl Txn<'_> {
    pub fn get(&self, store: StoreName, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let sql = format!("SELECT value FROM {} WHERE key = ?1", store.table());
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let value = stmt
            .query_row(params![key], |row| row.get::<_, Vec<u8>>(0))
            .optional()?;
        Ok(value)
    }

    pub fn put(&self, store: StoreName, key: &[u8], value: &[u8]) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            store.table()
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        stmt.execute(params![key, value])?;
        Ok(())
    }

    pub fn delete(&self, store: StoreName, key: &[u8]) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE key = ?1", store.table());
        let mut stmt = self.conn.prepare_cached(&sql)?;
        stmt.execute(params![key])?;
        Ok(())
    }

    /// All records of a store in key order.
    pub fn scan(&self, store: StoreName) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let sql = format!("SELECT key, value FROM {} ORDER BY key", store.table());
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn clear(&self, store: StoreName) -> Result<()> {
        self.conn
            .execute(&format!("DELETE FROM {}", store.table()), [])?;
        Ok(())
    }
}

/// One repository's embedded key/value environment: a single SQLite file in WAL
/// mode with a writer connection and a separate reader connection, so readers
/// always observe the last committed transaction.
#[derive(Debug)]
pub struct Environment {
    dir: PathBuf,
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl Environment {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let db_path = dir.join(DB_FILE);

        let writer = Connection::open(&db_path)?;
        writer.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        for store in StoreName::ALL {
            writer.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (key BLOB PRIMARY KEY, value BLOB NOT NULL) WITHOUT ROWID;",
                store.table()
            ))?;
        }

        let reader = Connection::open_with_flags(
            &db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.execute_batch("PRAGMA busy_timeout = 5000;")?;

        debug!(dir = %dir.display(), "opened commit info environment");

        Ok(Self {
            dir: dir.to_path_buf(),
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Runs `f` in a write transaction. Commits when `f` succeeds and rolls back
    /// when it fails. Only one write transaction is active at a time.
    pub fn compute_in_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Txn<'_>) -> Result<T>,
    {
        let mut conn = self
            .writer
            .lock()
            .map_err(poisoned("writer connection mutex"))?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&Txn { conn: &tx })?;
        tx.commit()?;
        Ok(value)
    }

    /// Runs `f` against a consistent snapshot of the last committed state.
    pub fn compute_in_readonly_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Txn<'_>) -> Result<T>,
    {
        let conn = self
            .reader
            .lock()
            .map_err(poisoned("reader connection mutex"))?;
        let tx = conn.unchecked_transaction()?;
        let value = f(&Txn { conn: &tx });
        drop(tx);
        value
    }

    /// Writes a compacted copy of the database to `target`.
    fn vacuum_into(&self, target: &Path) -> Result<()> {
        let conn = self
            .writer
            .lock()
            .map_err(poisoned("writer connection mutex"))?;
        conn.execute("VACUUM INTO ?1", params![target.to_string_lossy()])?;
        Ok(())
    }
}

/// Owns every open environment, keyed by repository.
pub struct EnvironmentManager {
    root: PathBuf,
    envs: Mutex<HashMap<RepoId, Arc<Environment>>>,
}

impl EnvironmentManager {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            envs: Mutex::new(HashMap::new()),
        }
    }

    pub fn env_dir(&self, repo: RepoId) -> PathBuf {
        self.root.join(repo.to_string()).join("commit")
    }

    pub fn env(&self, repo: RepoId) -> Result<Arc<Environment>> {
        let mut envs = self.envs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(env) = envs.get(&repo) {
            return Ok(Arc::clone(env));
        }

        let dir = self.env_dir(repo);
        let fresh = !dir.join(DB_FILE).exists();
        let env = Arc::new(Environment::open(&dir)?);
        if fresh {
            write_version(&dir)?;
        }
        envs.insert(repo, Arc::clone(&env));
        Ok(env)
    }

    /// Deletes the environment when its stored format version differs from
    /// [`INFO_VERSION`]. Returns true when the environment was reset.
    pub fn check_version(&self, repo: RepoId) -> Result<bool> {
        let dir = self.env_dir(repo);
        if !dir.exists() {
            return Ok(false);
        }

        let stored = read_version(&dir);
        if stored == Some(INFO_VERSION) {
            return Ok(false);
        }

        warn!(
            stage = "store",
            event = "store.version.mismatch",
            repo,
            stored_version = ?stored,
            expected_version = INFO_VERSION,
            "commit info format changed; rebuilding environment"
        );
        self.close(repo);
        fs::remove_dir_all(&dir)?;
        Ok(true)
    }

    pub fn close(&self, repo: RepoId) {
        let mut envs = self.envs.lock().unwrap_or_else(PoisonError::into_inner);
        envs.remove(&repo);
    }

    pub fn remove(&self, repo: RepoId) -> Result<()> {
        self.close(repo);
        let dir = self.root.join(repo.to_string());
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        info!(stage = "store", event = "store.remove", repo, "removed commit info environment");
        Ok(())
    }

    /// Writes a zstd-compressed snapshot of the environment to `target`.
    pub fn export(&self, repo: RepoId, target: &Path) -> Result<()> {
        let start = Instant::now();
        let env = self.env(repo)?;
        let scratch = tempfile::tempdir()?;
        let snapshot = scratch.path().join(DB_FILE);
        env.vacuum_into(&snapshot)?;

        let mut input = BufReader::new(File::open(&snapshot)?);
        let output = BufWriter::new(File::create(target)?);
        let mut encoder = zstd::stream::Encoder::new(output, SNAPSHOT_ZSTD_LEVEL)?;
        encoder.write_all(&INFO_VERSION.to_be_bytes())?;
        std::io::copy(&mut input, &mut encoder)?;
        encoder.finish()?.flush()?;

        info!(
            stage = "store",
            event = "store.export.end",
            result = "ok",
            repo,
            target = %target.display(),
            duration_ms = start.elapsed().as_millis(),
            "exported commit info environment"
        );
        Ok(())
    }

    /// Replaces the environment with a snapshot produced by [`Self::export`].
    pub fn import(&self, repo: RepoId, source: &Path) -> Result<()> {
        let start = Instant::now();
        let mut decoder = zstd::stream::Decoder::new(BufReader::new(File::open(source)?))?;
        let mut header = [0u8; 4];
        decoder.read_exact(&mut header)?;
        let version = u32::from_be_bytes(header);
        if version != INFO_VERSION {
            return Err(IndexError::corrupt(
                "snapshot",
                format!("snapshot version {version} does not match {INFO_VERSION}"),
            ));
        }

        let dir = self.env_dir(repo);
        let parent = dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)?;
        let staging = tempfile::tempdir_in(&parent)?;
        {
            let mut db = BufWriter::new(File::create(staging.path().join(DB_FILE))?);
            std::io::copy(&mut decoder, &mut db)?;
            db.flush()?;
        }
        write_version(staging.path())?;

        self.close(repo);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::rename(staging.keep(), &dir)?;

        info!(
            stage = "store",
            event = "store.import.end",
            result = "ok",
            repo,
            source = %source.display(),
            duration_ms = start.elapsed().as_millis(),
            "imported commit info environment"
        );
        Ok(())
    }
}

fn read_version(dir: &Path) -> Option<u32> {
    fs::read_to_string(dir.join(VERSION_FILE))
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
}

fn write_version(dir: &Path) -> Result<()> {
    fs::write(dir.join(VERSION_FILE), INFO_VERSION.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete_in_transaction() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = Environment::open(dir.path()).expect("open");

        env.compute_in_transaction(|txn| txn.put(StoreName::Default, b"k", b"v"))
            .expect("put");
        let value = env
            .compute_in_readonly_transaction(|txn| txn.get(StoreName::Default, b"k"))
            .expect("get");
        assert_eq!(value.as_deref(), Some(&b"v"[..]));

        env.compute_in_transaction(|txn| txn.delete(StoreName::Default, b"k"))
            .expect("delete");
        let value = env
            .compute_in_readonly_transaction(|txn| txn.get(StoreName::Default, b"k"))
            .expect("get");
        assert!(value.is_none());
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = Environment::open(dir.path()).expect("open");

        let result: Result<()> = env.compute_in_transaction(|txn| {
            txn.put(StoreName::Commits, b"a", b"1")?;
            Err(IndexError::corrupt("commits", "boom"))
        });
        assert!(result.is_err());

        let value = env
            .compute_in_readonly_transaction(|txn| txn.get(StoreName::Commits, b"a"))
            .expect("get");
        assert!(value.is_none());
    }

    #[test]
    fn stores_are_independent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = Environment::open(dir.path()).expect("open");
        env.compute_in_transaction(|txn| {
            txn.put(StoreName::PathToIndex, b"x", b"1")?;
            txn.put(StoreName::IndexToPath, b"x", b"2")?;
            txn.clear(StoreName::PathToIndex)
        })
        .expect("write");

        let (a, b) = env
            .compute_in_readonly_transaction(|txn| {
                Ok((
                    txn.get(StoreName::PathToIndex, b"x")?,
                    txn.get(StoreName::IndexToPath, b"x")?,
                ))
            })
            .expect("read");
        assert!(a.is_none());
        assert_eq!(b.as_deref(), Some(&b"2"[..]));
    }

    #[test]
    fn version_mismatch_resets_only_that_repository() {
        let root = tempfile::tempdir().expect("tempdir");
        let manager = EnvironmentManager::new(root.path().to_path_buf());
        for repo in [1, 2] {
            manager
                .env(repo)
                .expect("env")
                .compute_in_transaction(|txn| txn.put(StoreName::Default, b"k", b"v"))
                .expect("put");
        }

        fs::write(manager.env_dir(1).join(VERSION_FILE), "1").expect("write version");
        assert!(manager.check_version(1).expect("check"));
        assert!(!manager.check_version(2).expect("check"));

        let repo1 = manager
            .env(1)
            .expect("env")
            .compute_in_readonly_transaction(|txn| txn.get(StoreName::Default, b"k"))
            .expect("get");
        let repo2 = manager
            .env(2)
            .expect("env")
            .compute_in_readonly_transaction(|txn| txn.get(StoreName::Default, b"k"))
            .expect("get");
        assert!(repo1.is_none());
        assert!(repo2.is_some());
    }

    #[test]
    fn export_then_import_into_another_repository() {
        let root = tempfile::tempdir().expect("tempdir");
        let manager = EnvironmentManager::new(root.path().to_path_buf());
        manager
            .env(1)
            .expect("env")
            .compute_in_transaction(|txn| txn.put(StoreName::FixCommits, b"issue", b"ids"))
            .expect("put");

        let archive = root.path().join("snapshot.zst");
        manager.export(1, &archive).expect("export");
        manager.import(7, &archive).expect("import");

        let value = manager
            .env(7)
            .expect("env")
            .compute_in_readonly_transaction(|txn| txn.get(StoreName::FixCommits, b"issue"))
            .expect("get");
        assert_eq!(value.as_deref(), Some(&b"ids"[..]));
        assert!(!manager.check_version(7).expect("check"));
    }
}
