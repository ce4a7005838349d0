//! Durable staging queue for crash-safe ingest.
//!
//! Rows in excess of in-memory thresholds persist in `staging.db`, keyed by
//! subset. A writer claims an oldest-first prefix of queue records by token,
//! compacts the claimed rows into a part, and deletes them only after the
//! catalog transaction commits. Claims of crashed writers are reclaimed
//! after a staleness cutoff, so staged rows always outlive their writer.
//!
//! The payload is a self-describing framed blob: a five-byte magic plus
//! version, then the serialized `(subset_keys, fields, is_group)` record.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use tessera_core::batch::RowBatch;
use tessera_core::keys::KeyValue;

use crate::fsutil::now_epoch_us;
use crate::sqlutil::{apply_write_pragmas, immediate_txn, is_busy, TxnError};

/// Payload frame magic plus version.
pub const PAYLOAD_MAGIC: &[u8; 5] = b"TSST\x01";

/// Errors from the staging queue.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StagingError {
    /// Database error from `SQLite`.
    #[error("staging database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// Contention outlived the retry budget.
    #[error("staging queue busy beyond retry budget")]
    Busy,

    /// A payload frame failed to parse.
    #[error("bad staging payload: {detail}")]
    BadPayload {
        /// What failed.
        detail: String,
    },
}

/// The staged record behind the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedPayload {
    /// Raw subset keys of every row in the record.
    pub subset_keys: BTreeMap<String, KeyValue>,
    /// The row batch.
    pub batch: RowBatch,
    /// Whether the producer supplied per-row arrays (a group) or one row.
    pub is_group: bool,
}

impl StagedPayload {
    /// Serialize into the framed wire form.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError::BadPayload`] when encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>, StagingError> {
        let body = bincode::serialize(self).map_err(|e| StagingError::BadPayload {
            detail: format!("encode: {e}"),
        })?;
        let mut out = Vec::with_capacity(PAYLOAD_MAGIC.len() + body.len());
        out.extend_from_slice(PAYLOAD_MAGIC);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse the framed wire form.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError::BadPayload`] on a bad magic, version, or
    /// body.
    pub fn decode(frame: &[u8]) -> Result<Self, StagingError> {
        let body = frame
            .strip_prefix(PAYLOAD_MAGIC.as_slice())
            .ok_or_else(|| StagingError::BadPayload {
                detail: "bad magic or version".to_string(),
            })?;
        bincode::deserialize(body).map_err(|e| StagingError::BadPayload {
            detail: format!("decode: {e}"),
        })
    }
}

/// One claimed or listed queue record.
#[derive(Debug, Clone)]
pub struct StagedRow {
    /// Queue row ID (monotone arrival order).
    pub id: i64,
    /// Data rows carried by this record.
    pub n_rows: i64,
    /// Framed payload.
    pub payload: Vec<u8>,
}

/// The durable staging queue over `staging.db`.
#[derive(Debug)]
pub struct StagingQueue {
    conn: Connection,
    path: PathBuf,
    busy_retries: u32,
    busy_backoff_ms: u64,
}

impl StagingQueue {
    /// Open (creating if needed) the queue at `path`. `durable` selects
    /// `synchronous=FULL`, the crash-safe default.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError`] when the database cannot be initialized.
    pub fn open(path: impl Into<PathBuf>, durable: bool) -> Result<Self, StagingError> {
        let path = path.into();
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_write_pragmas(&conn, durable)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS staging_rows(
                 id               INTEGER PRIMARY KEY AUTOINCREMENT,
                 subset_uuid      TEXT NOT NULL,
                 n_rows           INTEGER NOT NULL,
                 created_at_epoch INTEGER NOT NULL,
                 payload          BLOB NOT NULL,
                 claimed_by       TEXT,
                 claimed_at       INTEGER
             );
             CREATE INDEX IF NOT EXISTS idx_staging_claimed_by ON staging_rows(claimed_by);
             CREATE INDEX IF NOT EXISTS idx_staging_claimed_at ON staging_rows(claimed_at);
             CREATE INDEX IF NOT EXISTS idx_staging_subset_id ON staging_rows(subset_uuid, id);",
        )?;
        Ok(Self {
            conn,
            path,
            busy_retries: 8,
            busy_backoff_ms: 30,
        })
    }

    /// Override the busy-retry budget.
    #[must_use]
    pub const fn with_retry(mut self, retries: u32, backoff_ms: u64) -> Self {
        self.busy_retries = retries;
        self.busy_backoff_ms = backoff_ms;
        self
    }

    fn txn<T>(
        &mut self,
        f: impl FnMut(&rusqlite::Transaction<'_>) -> Result<T, TxnError<StagingError>>,
    ) -> Result<T, StagingError> {
        match immediate_txn(&mut self.conn, self.busy_retries, self.busy_backoff_ms, f) {
            Ok(v) => Ok(v),
            Err(TxnError::Sql(e)) if is_busy(&e) => Err(StagingError::Busy),
            Err(TxnError::Sql(e)) => Err(StagingError::Db(e)),
            Err(TxnError::App(e)) => Err(e),
        }
    }

    /// Durably enqueue one framed payload for a subset.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError`] on database failure.
    pub fn enqueue(
        &mut self,
        subset_uuid: &Uuid,
        n_rows: i64,
        payload: &[u8],
    ) -> Result<(), StagingError> {
        self.txn(move |tx| {
            tx.execute(
                "INSERT INTO staging_rows(subset_uuid, n_rows, created_at_epoch, payload)
                 VALUES (?1, ?2, ?3, ?4)",
                params![subset_uuid.to_string(), n_rows, now_epoch_us(), payload],
            )?;
            Ok(())
        })
    }

    /// Claim the oldest unclaimed prefix for a subset whose cumulative row
    /// count just meets or exceeds `part_rows`. A single record larger than
    /// `part_rows` may stand alone. Records with non-positive row counts
    /// are purged. Returns the claimed records in arrival order (empty when
    /// nothing qualifies).
    ///
    /// # Errors
    ///
    /// Returns [`StagingError`] on database failure.
    pub fn select_and_claim_prefix(
        &mut self,
        subset_uuid: &Uuid,
        part_rows: i64,
        token: &str,
    ) -> Result<Vec<StagedRow>, StagingError> {
        let scan_limit = part_rows.saturating_mul(8).max(64);
        self.txn(move |tx| {
            let mut stmt = tx.prepare(
                "SELECT id, n_rows, payload FROM staging_rows
                 WHERE subset_uuid = ?1 AND claimed_by IS NULL
                 ORDER BY id LIMIT ?2",
            )?;
            let candidates = stmt
                .query_map(params![subset_uuid.to_string(), scan_limit], |r| {
                    Ok(StagedRow {
                        id: r.get(0)?,
                        n_rows: r.get(1)?,
                        payload: r.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            drop(stmt);
            if candidates.is_empty() {
                return Ok(Vec::new());
            }

            let mut picked: Vec<&StagedRow> = Vec::new();
            let mut total = 0i64;
            for row in &candidates {
                if row.n_rows <= 0 {
                    continue;
                }
                if !picked.is_empty() && total + row.n_rows > part_rows {
                    break;
                }
                if picked.is_empty() && row.n_rows > part_rows {
                    // Oversize path: the record stands alone.
                    picked.push(row);
                    break;
                }
                total += row.n_rows;
                picked.push(row);
            }
            if picked.is_empty() {
                let zero_ids: Vec<i64> = candidates
                    .iter()
                    .filter(|r| r.n_rows <= 0)
                    .map(|r| r.id)
                    .collect();
                for id in zero_ids {
                    tx.execute("DELETE FROM staging_rows WHERE id = ?1", params![id])?;
                }
                return Ok(Vec::new());
            }

            let now = now_epoch_us();
            for row in &picked {
                tx.execute(
                    "UPDATE staging_rows SET claimed_by = ?1, claimed_at = ?2
                     WHERE id = ?3 AND claimed_by IS NULL",
                    params![token, now, row.id],
                )?;
            }
            let mut stmt = tx.prepare(
                "SELECT id, n_rows, payload FROM staging_rows WHERE claimed_by = ?1 ORDER BY id",
            )?;
            let claimed = stmt
                .query_map(params![token], |r| {
                    Ok(StagedRow {
                        id: r.get(0)?,
                        n_rows: r.get(1)?,
                        payload: r.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(claimed)
        })
    }

    /// Release a claim so its records become eligible again.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError`] on database failure.
    pub fn unclaim(&mut self, token: &str) -> Result<(), StagingError> {
        self.txn(move |tx| {
            tx.execute(
                "UPDATE staging_rows SET claimed_by = NULL, claimed_at = NULL WHERE claimed_by = ?1",
                params![token],
            )?;
            Ok(())
        })
    }

    /// Release claims older than the cutoff so a crashed writer's work
    /// becomes eligible again. Returns records released.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError`] on database failure.
    pub fn reclaim_stale(&mut self, stale_after_seconds: u64) -> Result<usize, StagingError> {
        let stale_us = i64::try_from(stale_after_seconds)
            .unwrap_or(i64::MAX)
            .saturating_mul(1_000_000);
        let cutoff = now_epoch_us().saturating_sub(stale_us);
        self.txn(move |tx| {
            let released = tx.execute(
                "UPDATE staging_rows SET claimed_by = NULL, claimed_at = NULL
                 WHERE claimed_by IS NOT NULL AND claimed_at <= ?1",
                params![cutoff],
            )?;
            Ok(released)
        })
    }

    /// Drop a claim's records after a successful publish.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError`] on database failure.
    pub fn delete_claimed(&mut self, token: &str) -> Result<usize, StagingError> {
        let deleted = self.txn(move |tx| {
            Ok(tx.execute(
                "DELETE FROM staging_rows WHERE claimed_by = ?1",
                params![token],
            )?)
        })?;
        debug!(token, deleted, "dropped claimed staging records");
        Ok(deleted)
    }

    /// Subsets with unclaimed records, oldest first. Used to drain on
    /// shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError`] on database failure.
    pub fn hot_subsets(&self, limit: usize) -> Result<Vec<Uuid>, StagingError> {
        let mut stmt = self.conn.prepare(
            "SELECT subset_uuid, MIN(id) AS first_id FROM staging_rows
             WHERE claimed_by IS NULL
             GROUP BY subset_uuid ORDER BY first_id LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|t| {
                Uuid::parse_str(&t).map_err(|_| StagingError::BadPayload {
                    detail: format!("bad subset uuid {t:?}"),
                })
            })
            .collect()
    }

    /// Unclaimed data rows pending for a subset.
    ///
    /// # Errors
    ///
    /// Returns [`StagingError`] on database failure.
    pub fn pending_rows(&self, subset_uuid: &Uuid) -> Result<i64, StagingError> {
        Ok(self.conn.query_row(
            "SELECT COALESCE(SUM(n_rows), 0) FROM staging_rows
             WHERE subset_uuid = ?1 AND claimed_by IS NULL",
            params![subset_uuid.to_string()],
            |r| r.get(0),
        )?)
    }

    /// Truncate the WAL after a drain.
    pub fn checkpoint(&self) {
        let _ = self
            .conn
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
    }

    /// Queue database path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::batch::FieldBatch;

    fn queue() -> (tempfile::TempDir, StagingQueue) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let q = StagingQueue::open(tmp.path().join("staging.db"), true).expect("open");
        (tmp, q)
    }

    fn payload_of(n: i64) -> Vec<u8> {
        let batch = RowBatch::new(vec![(
            "v".to_string(),
            FieldBatch::from_i64((0..n).collect()),
        )])
        .expect("batch");
        StagedPayload {
            subset_keys: BTreeMap::from([("run".to_string(), KeyValue::Integer(1))]),
            batch,
            is_group: true,
        }
        .encode()
        .expect("encode")
    }

    #[test]
    fn test_payload_frame_round_trip() {
        let frame = payload_of(3);
        assert!(frame.starts_with(PAYLOAD_MAGIC));
        let decoded = StagedPayload::decode(&frame).expect("decode");
        assert_eq!(decoded.batch.n_rows(), 3);
        assert!(decoded.is_group);
        let err = StagedPayload::decode(b"XXXXX123").expect_err("bad magic");
        assert!(matches!(err, StagingError::BadPayload { .. }));
    }

    #[test]
    fn test_claim_prefix_meets_part_rows() {
        let (_tmp, mut q) = queue();
        let subset = Uuid::new_v4();
        for n in [3i64, 3, 3, 3] {
            q.enqueue(&subset, n, &payload_of(n)).expect("enqueue");
        }
        let claimed = q
            .select_and_claim_prefix(&subset, 6, "tok-1")
            .expect("claim");
        let total: i64 = claimed.iter().map(|r| r.n_rows).sum();
        assert_eq!(total, 6, "prefix stops once part_rows is met");
        assert_eq!(claimed.len(), 2);

        // Remaining records are claimable by another token.
        let rest = q
            .select_and_claim_prefix(&subset, 6, "tok-2")
            .expect("claim rest");
        assert_eq!(rest.iter().map(|r| r.n_rows).sum::<i64>(), 6);
        assert!(q
            .select_and_claim_prefix(&subset, 6, "tok-3")
            .expect("empty")
            .is_empty());
    }

    #[test]
    fn test_oversize_record_stands_alone() {
        let (_tmp, mut q) = queue();
        let subset = Uuid::new_v4();
        q.enqueue(&subset, 100, &payload_of(100)).expect("enqueue");
        q.enqueue(&subset, 1, &payload_of(1)).expect("enqueue");
        let claimed = q
            .select_and_claim_prefix(&subset, 10, "tok")
            .expect("claim");
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].n_rows, 100);
    }

    #[test]
    fn test_unclaim_and_delete() {
        let (_tmp, mut q) = queue();
        let subset = Uuid::new_v4();
        q.enqueue(&subset, 5, &payload_of(5)).expect("enqueue");
        let claimed = q
            .select_and_claim_prefix(&subset, 5, "tok")
            .expect("claim");
        assert_eq!(claimed.len(), 1);
        q.unclaim("tok").expect("unclaim");
        assert_eq!(q.pending_rows(&subset).expect("pending"), 5);

        let again = q
            .select_and_claim_prefix(&subset, 5, "tok2")
            .expect("claim");
        assert_eq!(again.len(), 1);
        assert_eq!(q.delete_claimed("tok2").expect("delete"), 1);
        assert_eq!(q.pending_rows(&subset).expect("pending"), 0);
    }

    #[test]
    fn test_reclaim_stale_releases_dead_claims() {
        let (_tmp, mut q) = queue();
        let subset = Uuid::new_v4();
        q.enqueue(&subset, 5, &payload_of(5)).expect("enqueue");
        let claimed = q
            .select_and_claim_prefix(&subset, 5, "dead-writer")
            .expect("claim");
        assert_eq!(claimed.len(), 1);
        // A zero-second cutoff treats every claim as stale.
        assert_eq!(q.reclaim_stale(0).expect("reclaim"), 1);
        let re = q
            .select_and_claim_prefix(&subset, 5, "live-writer")
            .expect("claim");
        assert_eq!(re.len(), 1);
    }

    #[test]
    fn test_hot_subsets_oldest_first() {
        let (_tmp, mut q) = queue();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        q.enqueue(&a, 1, &payload_of(1)).expect("enqueue");
        q.enqueue(&b, 1, &payload_of(1)).expect("enqueue");
        q.enqueue(&a, 1, &payload_of(1)).expect("enqueue");
        let hot = q.hot_subsets(10).expect("hot");
        assert_eq!(hot, vec![a, b]);
    }
}
