//! SQLite persistence for digital twins.
//!
//! One database may hold several twins; every table is keyed by `twin_id`.
//!
//! ```sql
//! memories              (id PK, twin_id, content, memory_type, importance,
//!                        embedding BLOB, created_at, last_accessed_at,
//!                        access_count, metadata JSON)
//! memory_trait_affinity (memory_id, trait, weight, PK(memory_id, trait))
//! trait_history         (seq PK AUTOINCREMENT, twin_id, timestamp,
//!                        snapshot JSON, cause)       -- append-only
//! trait_current         (twin_id PK, vector JSON, updated_at)
//! ```
//!
//! Embeddings are bincode-encoded `Vec<f32>`; trait vectors and metadata
//! are JSON. Every write method runs in a single transaction, so the twin
//! can persist a plan first and only then commit it in memory.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags, Transaction, params};
use tracing::{debug, info, warn};

use crate::config::PersistenceConfig;
use crate::error::{Result, TwinError};
use crate::memory::{AffinityRow, InsertPlan, MemoryRecord};
use crate::personality::{TraitHistoryEntry, TraitVector};
use crate::types::{Embedding, MemoryId, MemoryType, Timestamp, TwinId};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS memories (
    id               TEXT PRIMARY KEY,
    twin_id          TEXT NOT NULL,
    content          TEXT NOT NULL,
    memory_type      TEXT NOT NULL,
    importance       REAL NOT NULL,
    embedding        BLOB NOT NULL,
    created_at       TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL,
    access_count     INTEGER NOT NULL DEFAULT 0,
    metadata         TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_memories_twin ON memories(twin_id, created_at);

CREATE TABLE IF NOT EXISTS memory_trait_affinity (
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    trait     TEXT NOT NULL,
    weight    REAL NOT NULL,
    PRIMARY KEY (memory_id, trait)
);

CREATE TABLE IF NOT EXISTS trait_history (
    seq       INTEGER PRIMARY KEY AUTOINCREMENT,
    twin_id   TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    snapshot  TEXT NOT NULL,
    cause     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_history_twin ON trait_history(twin_id, timestamp);

CREATE TABLE IF NOT EXISTS trait_current (
    twin_id    TEXT PRIMARY KEY,
    vector     TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

/// Everything needed to rebuild one twin.
#[derive(Debug, Clone)]
pub struct TwinSnapshot {
    /// Which twin.
    pub twin_id: TwinId,
    /// All memory records.
    pub records: Vec<MemoryRecord>,
    /// Trait-affinity rows.
    pub affinity: Vec<AffinityRow>,
    /// Current trait vector.
    pub current: TraitVector,
    /// Trait history, oldest first.
    pub history: Vec<TraitHistoryEntry>,
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

fn ts(t: &Timestamp) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> Result<Timestamp> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TwinError::Serialization(format!("bad timestamp '{s}': {e}")))
}

fn parse_uuid(s: &str) -> Result<uuid::Uuid> {
    uuid::Uuid::parse_str(s).map_err(|e| TwinError::Serialization(format!("bad id '{s}': {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| TwinError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_str(s).map_err(|e| TwinError::Serialization(e.to_string()))
}

/// Raw `memories` row before decoding.
struct MemoryRow {
    id: String,
    content: String,
    memory_type: String,
    importance: f64,
    embedding: Vec<u8>,
    created_at: String,
    last_accessed_at: String,
    access_count: i64,
    metadata: String,
}

impl MemoryRow {
    fn decode(self) -> Result<MemoryRecord> {
        let vector: Vec<f32> =
            bincode::deserialize(&self.embedding).map_err(|e| TwinError::Serialization(e.to_string()))?;
        #[allow(clippy::cast_possible_truncation)]
        let importance = self.importance as f32;
        Ok(MemoryRecord {
            id: MemoryId(parse_uuid(&self.id)?),
            content: self.content,
            embedding: Embedding(vector),
            memory_type: MemoryType::from_str(&self.memory_type).map_err(TwinError::Serialization)?,
            importance,
            created_at: parse_ts(&self.created_at)?,
            last_accessed_at: parse_ts(&self.last_accessed_at)?,
            access_count: u32::try_from(self.access_count).unwrap_or(0),
            metadata: from_json(&self.metadata)?,
        })
    }
}

// ---------------------------------------------------------------------------
// PersistenceEngine
// ---------------------------------------------------------------------------

/// Handle to an open SQLite database holding twin state.
///
/// # Usage
///
/// ```no_run
/// # use doppel_core::persistence::PersistenceEngine;
/// # use doppel_core::config::PersistenceConfig;
/// # use doppel_core::types::TwinId;
/// let engine = PersistenceEngine::open("twin.db", &PersistenceConfig::default())?;
/// let snapshot = engine.load_snapshot(&TwinId::new())?;
/// assert!(snapshot.is_none());
/// # Ok::<(), doppel_core::error::TwinError>(())
/// ```
pub struct PersistenceEngine {
    conn: Connection,
    config: PersistenceConfig,
    db_path: PathBuf,
}

impl std::fmt::Debug for PersistenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceEngine")
            .field("db_path", &self.db_path)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PersistenceEngine {
    /// Open (or create) a database at `path`. The schema is created if
    /// missing; WAL mode is enabled when `config.wal_mode` is set.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::Database`] on SQLite failures.
    pub fn open<P: AsRef<Path>>(path: P, config: &PersistenceConfig) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&db_path, flags)?;

        if config.wal_mode {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %db_path.display(), wal = config.wal_mode, "doppel persistence engine opened");
        Ok(Self {
            conn,
            config: config.clone(),
            db_path,
        })
    }

    /// Open an in-memory database (useful for tests).
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::Database`] on SQLite failures.
    pub fn open_in_memory(config: &PersistenceConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            config: config.clone(),
            db_path: PathBuf::from(":memory:"),
        })
    }

    // ------------------------------------------------------------------
    // Whole-twin operations
    // ------------------------------------------------------------------

    /// Replace everything stored for `snapshot.twin_id` in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::Database`] or [`TwinError::Serialization`].
    pub fn save_snapshot(&mut self, snapshot: &TwinSnapshot) -> Result<()> {
        let start = Instant::now();
        let twin = snapshot.twin_id.to_string();
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM memories WHERE twin_id = ?1", params![twin])?;
        tx.execute("DELETE FROM trait_history WHERE twin_id = ?1", params![twin])?;
        for record in &snapshot.records {
            insert_record(&tx, &twin, record)?;
        }
        upsert_affinity(&tx, &snapshot.affinity)?;
        for entry in &snapshot.history {
            insert_history(&tx, &twin, entry)?;
        }
        let updated = snapshot.history.last().map_or_else(Utc::now, |e| e.timestamp);
        upsert_current(&tx, &twin, &snapshot.current, &updated)?;
        tx.commit()?;

        debug!(
            twin = %snapshot.twin_id,
            memories = snapshot.records.len(),
            history = snapshot.history.len(),
            elapsed_us = start.elapsed().as_micros(),
            "saved twin snapshot"
        );
        Ok(())
    }

    /// Load a twin. `None` if it has never been saved.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::Database`] or [`TwinError::Serialization`].
    pub fn load_snapshot(&self, twin_id: &TwinId) -> Result<Option<TwinSnapshot>> {
        let start = Instant::now();
        let twin = twin_id.to_string();

        let current: Option<String> = self
            .conn
            .prepare_cached("SELECT vector FROM trait_current WHERE twin_id = ?1")?
            .query_row(params![twin], |row| row.get(0))
            .optional()?;
        let Some(current) = current else {
            return Ok(None);
        };
        let current: TraitVector = from_json(&current)?;

        let mut stmt = self.conn.prepare_cached(
            "SELECT id, content, memory_type, importance, embedding, created_at,
                    last_accessed_at, access_count, metadata
             FROM memories WHERE twin_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![twin], |row| {
            Ok(MemoryRow {
                id: row.get(0)?,
                content: row.get(1)?,
                memory_type: row.get(2)?,
                importance: row.get(3)?,
                embedding: row.get(4)?,
                created_at: row.get(5)?,
                last_accessed_at: row.get(6)?,
                access_count: row.get(7)?,
                metadata: row.get(8)?,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            match row?.decode() {
                Ok(record) => records.push(record),
                Err(e) => warn!(twin = %twin_id, error = %e, "skipping undecodable memory row"),
            }
        }

        let mut stmt = self.conn.prepare_cached(
            "SELECT a.memory_id, a.trait, a.weight FROM memory_trait_affinity a
             JOIN memories m ON m.id = a.memory_id WHERE m.twin_id = ?1",
        )?;
        let rows = stmt.query_map(params![twin], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?))
        })?;
        let mut affinity = Vec::new();
        for row in rows {
            let (id, trait_name, weight) = row?;
            #[allow(clippy::cast_possible_truncation)]
            let weight = weight as f32;
            affinity.push(AffinityRow {
                memory_id: MemoryId(parse_uuid(&id)?),
                trait_name,
                weight,
            });
        }

        let mut stmt = self.conn.prepare_cached(
            "SELECT timestamp, snapshot, cause FROM trait_history WHERE twin_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![twin], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;
        let mut history = Vec::new();
        for row in rows {
            let (timestamp, snapshot, cause) = row?;
            history.push(TraitHistoryEntry {
                timestamp: parse_ts(&timestamp)?,
                snapshot: from_json(&snapshot)?,
                cause,
            });
        }

        debug!(
            twin = %twin_id,
            memories = records.len(),
            history = history.len(),
            elapsed_us = start.elapsed().as_micros(),
            "loaded twin snapshot"
        );
        Ok(Some(TwinSnapshot {
            twin_id: *twin_id,
            records,
            affinity,
            current,
            history,
        }))
    }

    /// All twins with a stored trait vector.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::Database`] on SQLite failures.
    pub fn list_twins(&self) -> Result<Vec<TwinId>> {
        let mut stmt = self.conn.prepare_cached("SELECT twin_id FROM trait_current")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut twins = Vec::new();
        for row in rows {
            let id = row?;
            match uuid::Uuid::parse_str(&id) {
                Ok(uuid) => twins.push(TwinId(uuid)),
                Err(_) => warn!(id = %id, "skipping row with invalid UUID"),
            }
        }
        Ok(twins)
    }

    // ------------------------------------------------------------------
    // Incremental writes
    // ------------------------------------------------------------------

    /// Persist an insert plan: delete the evicted records, then store the
    /// new one.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::Database`] or [`TwinError::Serialization`].
    pub fn apply_insert(&mut self, twin_id: &TwinId, plan: &InsertPlan) -> Result<()> {
        let twin = twin_id.to_string();
        let tx = self.conn.transaction()?;
        for id in &plan.evict {
            let id = id.to_string();
            tx.execute("DELETE FROM memory_trait_affinity WHERE memory_id = ?1", params![id])?;
            tx.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
        }
        insert_record(&tx, &twin, &plan.record)?;
        tx.commit()?;
        Ok(())
    }

    /// Record that `ids` were retrieved at `at`.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::Database`] on SQLite failures.
    pub fn touch_memories(&mut self, ids: &[MemoryId], at: &Timestamp) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let at = ts(at);
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "UPDATE memories SET access_count = access_count + 1, last_accessed_at = ?2 WHERE id = ?1",
            )?;
            for id in ids {
                stmt.execute(params![id.to_string(), at])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Append one history entry and make its snapshot current.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::Database`] or [`TwinError::Serialization`].
    pub fn append_trait_update(&mut self, twin_id: &TwinId, entry: &TraitHistoryEntry) -> Result<()> {
        let twin = twin_id.to_string();
        let tx = self.conn.transaction()?;
        insert_history(&tx, &twin, entry)?;
        upsert_current(&tx, &twin, &entry.snapshot, &entry.timestamp)?;
        tx.commit()?;
        Ok(())
    }

    /// Write trait-affinity rows.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::Database`] on SQLite failures.
    pub fn write_affinity(&mut self, rows: &[AffinityRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        upsert_affinity(&tx, rows)?;
        tx.commit()?;
        Ok(())
    }

    /// Delete history entries older than `cutoff`, always keeping the most
    /// recent one. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::Database`] on SQLite failures.
    pub fn prune_history_before(&mut self, twin_id: &TwinId, cutoff: &Timestamp) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM trait_history
             WHERE twin_id = ?1 AND timestamp < ?2
               AND seq < (SELECT MAX(seq) FROM trait_history WHERE twin_id = ?1)",
            params![twin_id.to_string(), ts(cutoff)],
        )?;
        if removed > 0 {
            debug!(twin = %twin_id, removed, "pruned trait history");
        }
        Ok(removed)
    }

    /// Number of memories stored for a twin.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::Database`] on SQLite failures.
    pub fn memory_count(&self, twin_id: &TwinId) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE twin_id = ?1",
            params![twin_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Copy the database to `dest_path` with SQLite's online-backup API.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::Database`] on SQLite failures.
    pub fn backup<P: AsRef<Path>>(&self, dest_path: P) -> Result<()> {
        let start = Instant::now();
        let mut dest = Connection::open(dest_path.as_ref())?;
        let backup = rusqlite::backup::Backup::new(&self.conn, &mut dest)?;
        backup.run_to_completion(256, std::time::Duration::from_millis(50), None)?;
        info!(
            dest = %dest_path.as_ref().display(),
            elapsed_ms = start.elapsed().as_millis(),
            "database backup completed"
        );
        Ok(())
    }

    /// `Ok(true)` if `PRAGMA integrity_check` reports no corruption.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::Database`] if the check itself fails.
    pub fn integrity_check(&self) -> Result<bool> {
        let result: String = self.conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        Ok(result == "ok")
    }

    /// Database path (`:memory:` for in-memory databases).
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

fn insert_record(tx: &Transaction<'_>, twin: &str, record: &MemoryRecord) -> Result<()> {
    let blob = bincode::serialize(&record.embedding.0).map_err(|e| TwinError::Serialization(e.to_string()))?;
    tx.execute(
        "INSERT INTO memories (id, twin_id, content, memory_type, importance, embedding,
                               created_at, last_accessed_at, access_count, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            record.id.to_string(),
            twin,
            record.content,
            record.memory_type.as_str(),
            f64::from(record.importance),
            blob,
            ts(&record.created_at),
            ts(&record.last_accessed_at),
            i64::from(record.access_count),
            to_json(&record.metadata)?,
        ],
    )?;
    Ok(())
}

fn upsert_affinity(tx: &Transaction<'_>, rows: &[AffinityRow]) -> Result<()> {
    let mut stmt = tx.prepare_cached(
        "INSERT INTO memory_trait_affinity (memory_id, trait, weight) VALUES (?1, ?2, ?3)
         ON CONFLICT(memory_id, trait) DO UPDATE SET weight = excluded.weight",
    )?;
    for row in rows {
        stmt.execute(params![row.memory_id.to_string(), row.trait_name, f64::from(row.weight)])?;
    }
    Ok(())
}

fn insert_history(tx: &Transaction<'_>, twin: &str, entry: &TraitHistoryEntry) -> Result<()> {
    tx.execute(
        "INSERT INTO trait_history (twin_id, timestamp, snapshot, cause) VALUES (?1, ?2, ?3, ?4)",
        params![twin, ts(&entry.timestamp), to_json(&entry.snapshot)?, entry.cause],
    )?;
    Ok(())
}

fn upsert_current(tx: &Transaction<'_>, twin: &str, vector: &TraitVector, at: &Timestamp) -> Result<()> {
    tx.execute(
        "INSERT INTO trait_current (twin_id, vector, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(twin_id) DO UPDATE SET vector = excluded.vector, updated_at = excluded.updated_at",
        params![twin, to_json(vector)?, ts(at)],
    )?;
    Ok(())
}

/// Extension trait that adds an `.optional()` combinator to `rusqlite::Result`.
trait OptionalExt<T> {
    /// Convert `QueryReturnedNoRows` into `Ok(None)`.
    fn optional(self) -> std::result::Result<Option<T>, rusqlite::Error>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> std::result::Result<Option<T>, rusqlite::Error> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
