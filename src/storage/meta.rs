//! Metadata store
//!
//! Durable, SQLite-backed registry of everything the engine must know to
//! re-open a database: the series dictionary, per-series rescue points,
//! the volume catalog, and engine parameters (page size, shard count,
//! input-log path, reclamation watermark).
//!
//! The connection is guarded by a mutex: metadata traffic is low-rate
//! (dictionary flushes and rescue-point batches from the sync worker),
//! so a single writer is plenty.

use crate::series::ParamId;
use crate::storage::blockstore::LogicAddr;
use crate::storage::error::{StorageError, StorageResult};
use rusqlite::{params, Connection, OpenFlags};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct MetadataStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl MetadataStore {
    /// Create a fresh metadata database. Fails if the file exists.
    pub fn create(path: &Path) -> StorageResult<Self> {
        if path.exists() {
            return Err(StorageError::NotPermitted(format!(
                "metadata store already exists: {}",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an existing metadata database.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if !path.exists() {
            return Err(StorageError::NotFound(format!(
                "metadata store: {}",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Read-only open, used by report generation.
    pub fn open_read_only(path: &Path) -> StorageResult<Self> {
        if !path.exists() {
            return Err(StorageError::NotFound(format!(
                "metadata store: {}",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// In-memory store for tests and the empty construction mode.
    pub fn memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    fn init(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            CREATE TABLE IF NOT EXISTS series (
                id   INTEGER PRIMARY KEY,
                name TEXT UNIQUE NOT NULL
            );
            CREATE TABLE IF NOT EXISTS rescue_points (
                series_id INTEGER NOT NULL,
                ordinal   INTEGER NOT NULL,
                addr      INTEGER NOT NULL,
                PRIMARY KEY (series_id, ordinal)
            );
            CREATE TABLE IF NOT EXISTS volumes (
                id   INTEGER PRIMARY KEY,
                path TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS params (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StorageError::Internal(format!("metadata lock poisoned: {}", e)))
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ---- series dictionary ----

    pub fn upsert_series(&self, entries: &[(ParamId, String)]) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare_cached("INSERT OR IGNORE INTO series (id, name) VALUES (?, ?)")?;
            for (id, name) in entries {
                stmt.execute(params![*id as i64, name])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_series(&self) -> StorageResult<Vec<(ParamId, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, name FROM series ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)? as ParamId, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ---- rescue points ----

    pub fn set_rescue_points(&self, id: ParamId, addrs: &[LogicAddr]) -> StorageResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM rescue_points WHERE series_id = ?",
            params![id as i64],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO rescue_points (series_id, ordinal, addr) VALUES (?, ?, ?)",
            )?;
            for (ordinal, addr) in addrs.iter().enumerate() {
                stmt.execute(params![id as i64, ordinal as i64, *addr as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_rescue_points(&self) -> StorageResult<HashMap<ParamId, Vec<LogicAddr>>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT series_id, addr FROM rescue_points ORDER BY series_id, ordinal")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)? as ParamId,
                row.get::<_, i64>(1)? as LogicAddr,
            ))
        })?;
        let mut out: HashMap<ParamId, Vec<LogicAddr>> = HashMap::new();
        for row in rows {
            let (id, addr) = row?;
            out.entry(id).or_default().push(addr);
        }
        Ok(out)
    }

    // ---- volume catalog ----

    pub fn add_volumes(&self, paths: &[PathBuf]) -> StorageResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached("INSERT INTO volumes (id, path) VALUES (?, ?)")?;
            for (i, path) in paths.iter().enumerate() {
                stmt.execute(params![i as i64, path.display().to_string()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn volumes(&self) -> StorageResult<Vec<PathBuf>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT path FROM volumes ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(PathBuf::from(row?));
        }
        Ok(out)
    }

    // ---- engine parameters ----

    pub fn set_param(&self, key: &str, value: &str) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO params (key, value) VALUES (?, ?)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_param(&self, key: &str) -> StorageResult<Option<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached("SELECT value FROM params WHERE key = ?")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get::<_, String>(0)?)),
            None => Ok(None),
        }
    }

    pub fn get_param_u64(&self, key: &str) -> StorageResult<Option<u64>> {
        match self.get_param(key)? {
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|_| StorageError::Corruption(format!("parameter {} is not numeric", key))),
            None => Ok(None),
        }
    }

    /// Force the WAL out to the main database file.
    pub fn sync(&self) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    /// Snapshot of the whole store as a JSON tree; the body of
    /// `generate_report`.
    pub fn report(&self) -> StorageResult<serde_json::Value> {
        let series = self.load_series()?;
        let rescue = self.load_rescue_points()?;
        let volumes = self.volumes()?;

        let params: Vec<(String, String)> = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare("SELECT key, value FROM params ORDER BY key")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        Ok(serde_json::json!({
            "generated_at": chrono::Utc::now().to_rfc3339(),
            "series_count": series.len(),
            "series": series
                .iter()
                .map(|(id, name)| serde_json::json!({ "id": id, "name": name }))
                .collect::<Vec<_>>(),
            "rescue_points": rescue
                .iter()
                .map(|(id, addrs)| serde_json::json!({ "series_id": id, "addrs": addrs }))
                .collect::<Vec<_>>(),
            "volumes": volumes
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>(),
            "params": params
                .iter()
                .map(|(k, v)| serde_json::json!({ "key": k, "value": v }))
                .collect::<Vec<_>>(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_series_round_trip() {
        let meta = MetadataStore::memory().unwrap();
        meta.upsert_series(&[(1, "cpu host=a".into()), (2, "cpu host=b".into())])
            .unwrap();
        // Replays are idempotent.
        meta.upsert_series(&[(1, "cpu host=a".into())]).unwrap();

        let series = meta.load_series().unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0], (1, "cpu host=a".to_string()));
    }

    #[test]
    fn test_rescue_points_replace() {
        let meta = MetadataStore::memory().unwrap();
        meta.set_rescue_points(1, &[10, 20]).unwrap();
        meta.set_rescue_points(1, &[10, 20, 30]).unwrap();

        let rescue = meta.load_rescue_points().unwrap();
        assert_eq!(rescue[&1], vec![10, 20, 30]);
    }

    #[test]
    fn test_params_and_volumes() {
        let meta = MetadataStore::memory().unwrap();
        meta.set_param("page_size", "4096").unwrap();
        assert_eq!(meta.get_param_u64("page_size").unwrap(), Some(4096));
        assert_eq!(meta.get_param("missing").unwrap(), None);

        meta.add_volumes(&[PathBuf::from("/a.vol"), PathBuf::from("/b.vol")])
            .unwrap();
        assert_eq!(meta.volumes().unwrap().len(), 2);
    }

    #[test]
    fn test_persistence_across_opens() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.db");
        {
            let meta = MetadataStore::create(&path).unwrap();
            meta.upsert_series(&[(1, "cpu host=a".into())]).unwrap();
            meta.set_rescue_points(1, &[7]).unwrap();
            meta.sync().unwrap();
        }
        {
            let meta = MetadataStore::open(&path).unwrap();
            assert_eq!(meta.load_series().unwrap().len(), 1);
            assert_eq!(meta.load_rescue_points().unwrap()[&1], vec![7]);
        }
        assert!(MetadataStore::create(&path).is_err());
    }

    #[test]
    fn test_report_shape() {
        let meta = MetadataStore::memory().unwrap();
        meta.upsert_series(&[(1, "cpu host=a".into())]).unwrap();
        let report = meta.report().unwrap();
        assert_eq!(report["series_count"], 1);
        assert!(report["generated_at"].is_string());
    }
}
