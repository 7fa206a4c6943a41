//! SQLite-backed store with an exclusive advisory lock.
//!
//! Only one handle per location may be open at a time, across every process
//! on the machine. The lock is an `fs2` exclusive lock on `LOCK` inside the
//! location; the entries live in `data.sqlite` next to it.

use crate::config::RaveConfig;
use crate::error::{RaveError, Result};
use crate::store::ops::{BatchOp, Blob, Entry, KeyRange, Operation, Reply};
use crate::store::Dispatch;
use fs2::FileExt;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Exclusive handle to the store at one location.
pub struct LocalStore {
    location: PathBuf,
    shared: Shared,
}

struct OpenStore {
    conn: Connection,
    lock_file: File,
}

/// Connection slot shared with blocking dispatch tasks. `None` once closed.
#[derive(Clone)]
struct Shared(Arc<Mutex<Option<OpenStore>>>);

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("location", &self.location)
            .field("open", &self.is_open())
            .finish()
    }
}

impl LocalStore {
    /// Open the store at `location`, creating the directory if needed.
    pub fn open(location: &Path) -> Result<Self> {
        Self::open_with(location, true)
    }

    /// Open the store at `location`.
    ///
    /// Fails with [`RaveError::Locked`] when another handle holds the location.
    pub fn open_with(location: &Path, create_if_missing: bool) -> Result<Self> {
        if !location.is_dir() {
            if !create_if_missing {
                return Err(RaveError::Io {
                    message: format!("Store location does not exist: {}", location.display()),
                    path: Some(location.to_path_buf()),
                    source: Some(std::io::Error::from(std::io::ErrorKind::NotFound)),
                });
            }
            std::fs::create_dir_all(location)
                .map_err(|e| RaveError::io_with_path(e, location))?;
        }

        let lock_path = location.join(RaveConfig::LOCK_FILE_NAME);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| RaveError::io_with_path(e, &lock_path))?;

        if let Err(e) = lock_file.try_lock_exclusive() {
            if is_contended(&e) {
                return Err(RaveError::Locked {
                    location: location.to_path_buf(),
                });
            }
            return Err(RaveError::io_with_path(e, &lock_path));
        }

        let conn = match Self::open_connection(&location.join(RaveConfig::DATA_FILE_NAME)) {
            Ok(conn) => conn,
            Err(e) => {
                let _ = FileExt::unlock(&lock_file);
                return Err(e);
            }
        };

        debug!("Opened store at {}", location.display());

        Ok(Self {
            location: location.to_path_buf(),
            shared: Shared(Arc::new(Mutex::new(Some(OpenStore { conn, lock_file })))),
        })
    }

    fn open_connection(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;\n\
             PRAGMA busy_timeout={};\n\
             PRAGMA synchronous=NORMAL;\n\
             PRAGMA temp_store=MEMORY;",
            RaveConfig::BUSY_TIMEOUT_MS,
        ))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entries (
                key BLOB PRIMARY KEY,
                value BLOB NOT NULL
            ) WITHOUT ROWID;",
        )?;
        Ok(conn)
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn is_open(&self) -> bool {
        self.shared.0.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    /// Close the database and release the lock. Idempotent.
    ///
    /// A dispatch still running on the blocking pool finishes first; later
    /// ones fail with [`RaveError::NotOpen`].
    pub fn close(&self) -> Result<()> {
        let store = self.shared.lock()?.take();
        if let Some(OpenStore { conn, lock_file }) = store {
            let closed = conn.close().map_err(|(_, e)| RaveError::from(e));
            if let Err(e) = FileExt::unlock(&lock_file) {
                warn!("Failed to unlock {}: {}", self.location.display(), e);
            }
            closed?;
            debug!("Closed store at {}", self.location.display());
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.shared.get(key)
    }

    pub fn get_many(&self, keys: &[Blob]) -> Result<Vec<Option<Vec<u8>>>> {
        self.shared.get_many(keys)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.shared.put(key, value)
    }

    pub fn del(&self, key: &[u8]) -> Result<()> {
        self.shared.del(key)
    }

    /// Apply every op in order inside one transaction.
    pub fn batch(&self, ops: &[BatchOp]) -> Result<()> {
        self.shared.batch(ops)
    }

    pub fn iterate(&self, range: &KeyRange) -> Result<Vec<Entry>> {
        self.shared.iterate(range)
    }

    /// Delete every entry in `range`. Honors `limit` and `reverse`.
    pub fn clear(&self, range: &KeyRange) -> Result<()> {
        self.shared.clear(range)
    }

    /// Execute one operation against this store on the calling thread.
    pub fn apply(&self, op: Operation) -> Result<Reply> {
        self.shared.apply(op)
    }
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, Option<OpenStore>>> {
        self.0.lock().map_err(|_| RaveError::Database {
            message: "Failed to acquire store connection lock".to_string(),
            source: None,
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.lock()?;
        let store = guard.as_mut().ok_or(RaveError::NotOpen)?;
        f(&mut store.conn)
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM entries WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()?)
        })
    }

    fn get_many(&self, keys: &[Blob]) -> Result<Vec<Option<Vec<u8>>>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached("SELECT value FROM entries WHERE key = ?1")?;
            let mut values = Vec::with_capacity(keys.len());
            for key in keys {
                values.push(
                    stmt.query_row(params![key.as_slice()], |row| row.get::<_, Vec<u8>>(0))
                        .optional()?,
                );
            }
            Ok(values)
        })
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO entries (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            Ok(())
        })
    }

    fn del(&self, key: &[u8]) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM entries WHERE key = ?1", params![key])?;
            Ok(())
        })
    }

    fn batch(&self, ops: &[BatchOp]) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut put =
                    tx.prepare_cached("INSERT OR REPLACE INTO entries (key, value) VALUES (?1, ?2)")?;
                let mut del = tx.prepare_cached("DELETE FROM entries WHERE key = ?1")?;
                for op in ops {
                    match op {
                        BatchOp::Put { key, value } => {
                            put.execute(params![key.as_slice(), value.as_slice()])?;
                        }
                        BatchOp::Del { key } => {
                            del.execute(params![key.as_slice()])?;
                        }
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn iterate(&self, range: &KeyRange) -> Result<Vec<Entry>> {
        let (clause, mut args) = range_clause(range);
        args.push(limit_arg(range));
        let sql = format!(
            "SELECT key, value FROM entries{} ORDER BY key {} LIMIT ?",
            clause,
            direction(range)
        );
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
                Ok(Entry {
                    key: Blob(row.get(0)?),
                    value: Blob(row.get(1)?),
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    fn clear(&self, range: &KeyRange) -> Result<()> {
        let (clause, mut args) = range_clause(range);
        let sql = if range.limit.is_some() {
            args.push(limit_arg(range));
            format!(
                "DELETE FROM entries WHERE key IN \
                 (SELECT key FROM entries{} ORDER BY key {} LIMIT ?)",
                clause,
                direction(range)
            )
        } else {
            format!("DELETE FROM entries{}", clause)
        };
        self.with_conn(|conn| {
            conn.execute(&sql, params_from_iter(args.iter()))?;
            Ok(())
        })
    }

    fn apply(&self, op: Operation) -> Result<Reply> {
        match op {
            Operation::Get { key } => self.get(key.as_slice()).map(|v| Reply::Value(v.map(Blob))),
            Operation::GetMany { keys } => self
                .get_many(&keys)
                .map(|values| Reply::Values(values.into_iter().map(|v| v.map(Blob)).collect())),
            Operation::Put { key, value } => {
                self.put(key.as_slice(), value.as_slice()).map(|_| Reply::Done)
            }
            Operation::Del { key } => self.del(key.as_slice()).map(|_| Reply::Done),
            Operation::Batch { ops } => self.batch(&ops).map(|_| Reply::Done),
            Operation::Iterate { range } => self.iterate(&range).map(Reply::Entries),
            Operation::Clear { range } => self.clear(&range).map(|_| Reply::Done),
        }
    }
}

impl Drop for LocalStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close store at {}: {}", self.location.display(), e);
        }
    }
}

#[async_trait::async_trait]
impl Dispatch for LocalStore {
    /// Runs the operation on the blocking pool; SQLite may wait on its busy timeout.
    async fn dispatch(&self, op: Operation) -> Result<Reply> {
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || shared.apply(op))
            .await
            .map_err(|e| RaveError::Other(format!("Store task failed: {}", e)))?
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn direction(range: &KeyRange) -> &'static str {
    if range.reverse {
        "DESC"
    } else {
        "ASC"
    }
}

fn limit_arg(range: &KeyRange) -> SqlValue {
    // SQLite treats a negative LIMIT as unbounded.
    SqlValue::Integer(
        range
            .limit
            .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
            .unwrap_or(-1),
    )
}

fn range_clause(range: &KeyRange) -> (String, Vec<SqlValue>) {
    let mut clauses = Vec::new();
    let mut args = Vec::new();

    if let Some(gt) = &range.gt {
        clauses.push("key > ?");
        args.push(SqlValue::Blob(gt.0.clone()));
    } else if let Some(gte) = &range.gte {
        clauses.push("key >= ?");
        args.push(SqlValue::Blob(gte.0.clone()));
    }

    if let Some(lt) = &range.lt {
        clauses.push("key < ?");
        args.push(SqlValue::Blob(lt.0.clone()));
    } else if let Some(lte) = &range.lte {
        clauses.push("key <= ?");
        args.push(SqlValue::Blob(lte.0.clone()));
    }

    if clauses.is_empty() {
        (String::new(), args)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn keys(entries: &[Entry]) -> Vec<&[u8]> {
        entries.iter().map(|e| e.key.as_slice()).collect()
    }

    fn seeded(dir: &TempDir) -> LocalStore {
        let store = LocalStore::open(dir.path()).unwrap();
        for k in ["a", "b", "c", "d"] {
            store.put(k.as_bytes(), k.to_uppercase().as_bytes()).unwrap();
        }
        store
    }

    #[test]
    fn test_put_get_del() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();

        assert_eq!(store.get(b"a").unwrap(), None);
        store.put(b"a", b"1").unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        store.put(b"a", b"2").unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"2".to_vec()));
        store.del(b"a").unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = TempDir::new().unwrap();
        let _first = LocalStore::open(dir.path()).unwrap();

        let err = LocalStore::open(dir.path()).unwrap_err();
        assert!(err.is_lock_contention(), "expected Locked, got {:?}", err);
    }

    #[test]
    fn test_close_releases_lock() {
        let dir = TempDir::new().unwrap();
        let first = LocalStore::open(dir.path()).unwrap();
        first.put(b"k", b"v").unwrap();
        first.close().unwrap();
        first.close().unwrap();

        assert!(matches!(first.get(b"k"), Err(RaveError::NotOpen)));

        let second = LocalStore::open(dir.path()).unwrap();
        assert_eq!(second.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_missing_location_without_create() {
        let dir = TempDir::new().unwrap();
        let err = LocalStore::open_with(&dir.path().join("missing"), false).unwrap_err();
        assert_eq!(err.io_kind(), Some(std::io::ErrorKind::NotFound));
    }

    #[test]
    fn test_batch_applies_in_order() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();

        store
            .batch(&[
                BatchOp::put("a", "1"),
                BatchOp::put("b", "2"),
                BatchOp::del("a"),
                BatchOp::put("b", "3"),
            ])
            .unwrap();

        assert_eq!(store.get(b"a").unwrap(), None);
        assert_eq!(store.get(b"b").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn test_get_many() {
        let dir = TempDir::new().unwrap();
        let store = seeded(&dir);

        let values = store
            .get_many(&[Blob::from("a"), Blob::from("z"), Blob::from("c")])
            .unwrap();
        assert_eq!(values, vec![Some(b"A".to_vec()), None, Some(b"C".to_vec())]);
    }

    #[test]
    fn test_iterate_bounds_and_direction() {
        let dir = TempDir::new().unwrap();
        let store = seeded(&dir);

        let all = store.iterate(&KeyRange::all()).unwrap();
        assert_eq!(keys(&all), vec![b"a", b"b", b"c", b"d"]);

        let mid = store.iterate(&KeyRange::all().gt("a").lte("c")).unwrap();
        assert_eq!(keys(&mid), vec![b"b", b"c"]);

        let rev = store.iterate(&KeyRange::all().reverse(true).limit(2)).unwrap();
        assert_eq!(keys(&rev), vec![b"d", b"c"]);

        // gt wins over gte
        let both = store.iterate(&KeyRange::all().gte("b").gt("b")).unwrap();
        assert_eq!(keys(&both), vec![b"c", b"d"]);
    }

    #[test]
    fn test_clear_range_with_limit() {
        let dir = TempDir::new().unwrap();
        let store = seeded(&dir);

        store.clear(&KeyRange::all().reverse(true).limit(1)).unwrap();
        assert_eq!(store.get(b"d").unwrap(), None);
        assert_eq!(store.get(b"c").unwrap(), Some(b"C".to_vec()));

        store.clear(&KeyRange::all().lt("c")).unwrap();
        let rest = store.iterate(&KeyRange::all()).unwrap();
        assert_eq!(keys(&rest), vec![b"c"]);
    }

    #[test]
    fn test_byte_order_is_unsigned() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();
        store.put(&[0xff], b"hi").unwrap();
        store.put(&[0x01], b"lo").unwrap();
        store.put(&[0x01, 0x00], b"mid").unwrap();

        let all = store.iterate(&KeyRange::all()).unwrap();
        assert_eq!(keys(&all), vec![&[0x01][..], &[0x01, 0x00][..], &[0xff][..]]);
    }

    #[tokio::test]
    async fn test_dispatch_applies_operation() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path()).unwrap();

        let reply = store
            .dispatch(Operation::Put {
                key: "a".into(),
                value: "1".into(),
            })
            .await
            .unwrap();
        assert_eq!(reply, Reply::Done);

        let reply = store.dispatch(Operation::Get { key: "a".into() }).await.unwrap();
        assert_eq!(reply.into_value().unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_huge_limit_is_not_unbounded() {
        let range = KeyRange::all().limit(usize::MAX);
        assert_eq!(limit_arg(&range), SqlValue::Integer(i64::MAX));
        assert_eq!(limit_arg(&KeyRange::all()), SqlValue::Integer(-1));

        let dir = TempDir::new().unwrap();
        let store = seeded(&dir);
        let all = store.iterate(&range).unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn test_dispatch_does_not_block_the_runtime() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(LocalStore::open(dir.path()).unwrap());

        // Hold the connection so the dispatched operation has to wait for it.
        let guard = store.shared.0.lock().unwrap();
        let pending = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .dispatch(Operation::Put {
                        key: "a".into(),
                        value: "1".into(),
                    })
                    .await
            })
        };

        // On a current-thread runtime this only completes if the blocked
        // operation is off the runtime thread.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!pending.is_finished());
        drop(guard);

        assert_eq!(pending.await.unwrap().unwrap(), Reply::Done);
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
    }
}
