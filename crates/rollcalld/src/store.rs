//! SQLite-backed roster and attendance ledger.
//!
//! The `UNIQUE(identity_id, session_id)` constraint on attendance records is
//! the system's core correctness guarantee: `record` is an atomic
//! insert-or-conflict, so concurrent writers for the same pair produce
//! exactly one row no matter how the calls interleave.

use chrono::Utc;
use rollcall_core::session::{AttendanceGate, AttendanceRecord, GateError};
use rollcall_core::types::{Embedding, RosterEntry};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity '{0}' is already enrolled")]
    DuplicateIdentity(String),
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Identity metadata without the embedding payload, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
    pub identity_id: String,
    pub display_name: String,
    pub created_at: String,
}

pub struct Store {
    conn: Mutex<Connection>,
    /// Embedding dimension this deployment's embedder produces; enrollment
    /// and roster reads are validated against it.
    embedding_dim: usize,
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn open(db_path: &Path, embedding_dim: usize) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn, embedding_dim)
    }

    /// In-memory store for tests.
    pub fn open_in_memory(embedding_dim: usize) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, embedding_dim)
    }

    fn from_connection(conn: Connection, embedding_dim: usize) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS identities (
              identity_id TEXT PRIMARY KEY,
              display_name TEXT NOT NULL,
              embedding BLOB NOT NULL,
              model_version TEXT,
              created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS attendance_records (
              id TEXT PRIMARY KEY,
              identity_id TEXT NOT NULL REFERENCES identities(identity_id),
              session_id TEXT NOT NULL,
              recorded_by TEXT NOT NULL,
              recorded_at TEXT NOT NULL,
              UNIQUE (identity_id, session_id)
            );

            CREATE INDEX IF NOT EXISTS idx_attendance_session
              ON attendance_records(session_id);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            embedding_dim,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a panic mid-statement; propagating the
        // guard is still sound for SQLite, which rolls back on drop.
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Enroll a new identity. The reference embedding is immutable once
    /// written; enrolling an existing id is rejected, not upserted.
    pub fn enroll(
        &self,
        identity_id: &str,
        display_name: &str,
        embedding: &Embedding,
    ) -> Result<RosterEntry, StoreError> {
        if embedding.dim() != self.embedding_dim {
            return Err(StoreError::InvalidEmbedding(format!(
                "expected {} components, got {}",
                self.embedding_dim,
                embedding.dim()
            )));
        }
        if !embedding.is_finite() {
            return Err(StoreError::InvalidEmbedding(
                "embedding contains non-finite values".to_string(),
            ));
        }

        let created_at = Utc::now().to_rfc3339();
        let blob = embedding_to_blob(embedding);

        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT INTO identities (identity_id, display_name, embedding, model_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                identity_id,
                display_name,
                blob,
                embedding.model_version,
                created_at
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
            {
                return Err(StoreError::DuplicateIdentity(identity_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(identity_id, display_name, "identity enrolled");

        Ok(RosterEntry {
            identity_id: identity_id.to_string(),
            display_name: display_name.to_string(),
            embedding: embedding.clone(),
            created_at,
        })
    }

    /// Full roster snapshot in stable `(created_at, identity_id)` order.
    /// The matcher's first-wins tie-break keys on this ordering.
    pub fn all_references(&self) -> Result<Vec<RosterEntry>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT identity_id, display_name, embedding, model_version, created_at
             FROM identities ORDER BY created_at, identity_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut roster = Vec::new();
        for row in rows {
            let (identity_id, display_name, blob, model_version, created_at) = row?;
            let mut embedding = blob_to_embedding(&blob, self.embedding_dim, &identity_id)?;
            embedding.model_version = model_version;
            roster.push(RosterEntry {
                identity_id,
                display_name,
                embedding,
                created_at,
            });
        }
        Ok(roster)
    }

    pub fn list_identities(&self) -> Result<Vec<IdentitySummary>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT identity_id, display_name, created_at
             FROM identities ORDER BY created_at, identity_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(IdentitySummary {
                identity_id: row.get(0)?,
                display_name: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn identity_count(&self) -> Result<u64, StoreError> {
        let conn = self.lock();
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Attendance rows for one session, oldest first.
    pub fn attendance_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, identity_id, session_id, recorded_by, recorded_at
             FROM attendance_records WHERE session_id = ?1 ORDER BY recorded_at, id",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok(AttendanceRecord {
                id: row.get(0)?,
                identity_id: row.get(1)?,
                session_id: row.get(2)?,
                recorded_by: row.get(3)?,
                recorded_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

impl AttendanceGate for Store {
    fn has_recorded(&self, identity_id: &str, session_id: &str) -> Result<bool, GateError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT EXISTS(
               SELECT 1 FROM attendance_records WHERE identity_id = ?1 AND session_id = ?2
             )",
            params![identity_id, session_id],
            |row| row.get(0),
        )
        .map_err(|e| GateError::Storage(e.to_string()))
    }

    fn record(
        &self,
        identity_id: &str,
        session_id: &str,
        recorded_by: &str,
    ) -> Result<AttendanceRecord, GateError> {
        let record = AttendanceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            identity_id: identity_id.to_string(),
            session_id: session_id.to_string(),
            recorded_by: recorded_by.to_string(),
            recorded_at: Utc::now().to_rfc3339(),
        };

        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT INTO attendance_records (id, identity_id, session_id, recorded_by, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id,
                record.identity_id,
                record.session_id,
                record.recorded_by,
                record.recorded_at
            ],
        );
        match inserted {
            Ok(_) => Ok(record),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                Err(GateError::AlreadyRecorded {
                    identity_id: identity_id.to_string(),
                    session_id: session_id.to_string(),
                })
            }
            Err(e) => Err(GateError::Storage(e.to_string())),
        }
    }
}

fn embedding_to_blob(embedding: &Embedding) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.values.len() * 4);
    for value in &embedding.values {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Decode a stored embedding, surfacing corruption as `InvalidEmbedding` so a
/// broken roster row is distinguishable from a genuinely unknown face.
fn blob_to_embedding(
    blob: &[u8],
    expected_dim: usize,
    identity_id: &str,
) -> Result<Embedding, StoreError> {
    if blob.len() != expected_dim * 4 {
        return Err(StoreError::InvalidEmbedding(format!(
            "identity '{identity_id}': stored blob is {} bytes, expected {}",
            blob.len(),
            expected_dim * 4
        )));
    }
    let values: Vec<f32> = blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    let embedding = Embedding::new(values);
    if !embedding.is_finite() {
        return Err(StoreError::InvalidEmbedding(format!(
            "identity '{identity_id}': stored embedding contains non-finite values"
        )));
    }
    Ok(embedding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const DIM: usize = 4;

    fn embedding(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn store() -> Store {
        Store::open_in_memory(DIM).unwrap()
    }

    #[test]
    fn test_enroll_then_snapshot() {
        let store = store();
        store
            .enroll("s1", "Alice", &embedding(&[0.1, 0.2, 0.3, 0.4]))
            .unwrap();

        let roster = store.all_references().unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].identity_id, "s1");
        assert_eq!(roster[0].display_name, "Alice");
        assert_eq!(roster[0].embedding.values, vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_snapshot_order_is_enrollment_order() {
        let store = store();
        store.enroll("s2", "Bob", &embedding(&[0.0; 4])).unwrap();
        store.enroll("s1", "Alice", &embedding(&[1.0; 4])).unwrap();

        let ids: Vec<String> = store
            .all_references()
            .unwrap()
            .into_iter()
            .map(|e| e.identity_id)
            .collect();
        assert_eq!(ids, vec!["s2", "s1"]);
    }

    #[test]
    fn test_duplicate_enrollment_rejected() {
        let store = store();
        store.enroll("s1", "Alice", &embedding(&[0.0; 4])).unwrap();
        let err = store
            .enroll("s1", "Alice again", &embedding(&[1.0; 4]))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateIdentity(id) if id == "s1"));
        // The original embedding is untouched.
        let roster = store.all_references().unwrap();
        assert_eq!(roster[0].embedding.values, vec![0.0; 4]);
    }

    #[test]
    fn test_enroll_rejects_wrong_dimension() {
        let store = store();
        let err = store
            .enroll("s1", "Alice", &embedding(&[0.0; 3]))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidEmbedding(_)));
    }

    #[test]
    fn test_enroll_rejects_non_finite() {
        let store = store();
        let err = store
            .enroll("s1", "Alice", &embedding(&[0.0, f32::NAN, 0.0, 0.0]))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidEmbedding(_)));
    }

    #[test]
    fn test_embedding_blob_roundtrip() {
        let original = embedding(&[0.5, -1.25, 3.75, 0.0]);
        let blob = embedding_to_blob(&original);
        let decoded = blob_to_embedding(&blob, DIM, "s1").unwrap();
        assert_eq!(decoded.values, original.values);
    }

    #[test]
    fn test_truncated_blob_is_invalid_embedding() {
        let err = blob_to_embedding(&[0u8; 7], DIM, "s1").unwrap_err();
        assert!(matches!(err, StoreError::InvalidEmbedding(_)));
    }

    #[test]
    fn test_record_then_has_recorded() {
        let store = store();
        store.enroll("s1", "Alice", &embedding(&[0.0; 4])).unwrap();

        assert!(!store.has_recorded("s1", "period-1").unwrap());
        let record = store.record("s1", "period-1", "camera-1").unwrap();
        assert_eq!(record.identity_id, "s1");
        assert!(!record.recorded_at.is_empty());
        assert!(store.has_recorded("s1", "period-1").unwrap());
        // Different session is untouched.
        assert!(!store.has_recorded("s1", "period-2").unwrap());
    }

    #[test]
    fn test_double_record_is_already_recorded() {
        let store = store();
        store.enroll("s1", "Alice", &embedding(&[0.0; 4])).unwrap();

        store.record("s1", "period-1", "camera-1").unwrap();
        let err = store.record("s1", "period-1", "camera-2").unwrap_err();
        assert!(matches!(err, GateError::AlreadyRecorded { .. }));

        assert_eq!(store.attendance_for_session("period-1").unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_records_insert_exactly_one_row() {
        let store = Arc::new(store());
        store.enroll("s1", "Alice", &embedding(&[0.0; 4])).unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                store.record("s1", "period-1", &format!("camera-{i}")).is_ok()
            }));
        }

        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&ok| ok)
            .count();
        assert_eq!(successes, 1);
        assert_eq!(store.attendance_for_session("period-1").unwrap().len(), 1);
    }

    #[test]
    fn test_attendance_listing_scoped_to_session() {
        let store = store();
        store.enroll("s1", "Alice", &embedding(&[0.0; 4])).unwrap();
        store.enroll("s2", "Bob", &embedding(&[1.0; 4])).unwrap();

        store.record("s1", "period-1", "camera-1").unwrap();
        store.record("s2", "period-1", "camera-1").unwrap();
        store.record("s1", "period-2", "camera-1").unwrap();

        let rows = store.attendance_for_session("period-1").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.session_id == "period-1"));
    }

    #[test]
    fn test_open_creates_file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.db");
        let store = Store::open(&path, DIM).unwrap();
        store.enroll("s1", "Alice", &embedding(&[0.0; 4])).unwrap();
        drop(store);

        let reopened = Store::open(&path, DIM).unwrap();
        assert_eq!(reopened.identity_count().unwrap(), 1);
    }
}
