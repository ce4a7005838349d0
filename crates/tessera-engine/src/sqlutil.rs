//! Shared SQLite plumbing: pragma profiles and immediate transactions with
//! bounded retry on contention.

use std::time::Duration;

use rand::Rng;
use rusqlite::{Connection, Transaction, TransactionBehavior};

/// Pragma block for writable connections. The staging database overrides
/// the synchronous level to FULL for durable enqueue.
pub(crate) fn apply_write_pragmas(conn: &Connection, durable: bool) -> rusqlite::Result<()> {
    let synchronous = if durable { "FULL" } else { "NORMAL" };
    conn.execute_batch(&format!(
        "PRAGMA journal_mode=WAL;\n\
         PRAGMA synchronous={synchronous};\n\
         PRAGMA busy_timeout=5000;\n\
         PRAGMA foreign_keys=ON;\n\
         PRAGMA temp_store=MEMORY;\n\
         PRAGMA cache_size=-65536;"
    ))
}

/// Pragma block for read-only connections.
pub(crate) fn apply_read_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA busy_timeout=5000;\n\
         PRAGMA trusted_schema=OFF;\n\
         PRAGMA query_only=ON;",
    )
}

/// True when the error is SQLite contention worth retrying.
pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

/// Error from a transactional closure: either SQL, or an application error
/// that must not be retried.
#[derive(Debug)]
pub(crate) enum TxnError<E> {
    /// SQLite-level failure; retried when it is contention.
    Sql(rusqlite::Error),
    /// Application-level failure; surfaced as-is.
    App(E),
}

impl<E> From<rusqlite::Error> for TxnError<E> {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sql(e)
    }
}

/// Run `f` inside a `BEGIN IMMEDIATE` transaction, retrying contention with
/// bounded exponential backoff plus jitter. The final contention error is
/// returned for the caller to map to its `Busy` kind.
pub(crate) fn immediate_txn<T, E>(
    conn: &mut Connection,
    retries: u32,
    backoff_ms: u64,
    mut f: impl FnMut(&Transaction<'_>) -> Result<T, TxnError<E>>,
) -> Result<T, TxnError<E>> {
    let attempts = retries.max(1);
    for attempt in 0..attempts {
        let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
            Ok(tx) => tx,
            Err(e) if is_busy(&e) && attempt + 1 < attempts => {
                backoff_sleep(backoff_ms, attempt);
                continue;
            }
            Err(e) => return Err(TxnError::Sql(e)),
        };
        match f(&tx) {
            Ok(value) => match tx.commit() {
                Ok(()) => return Ok(value),
                Err(e) if is_busy(&e) && attempt + 1 < attempts => {
                    backoff_sleep(backoff_ms, attempt);
                }
                Err(e) => return Err(TxnError::Sql(e)),
            },
            Err(TxnError::Sql(e)) if is_busy(&e) && attempt + 1 < attempts => {
                drop(tx);
                backoff_sleep(backoff_ms, attempt);
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("retry loop returns on the last attempt")
}

fn backoff_sleep(backoff_ms: u64, attempt: u32) {
    let base = backoff_ms.saturating_mul(1u64 << attempt.min(8));
    let jitter = rand::thread_rng().gen_range(0..=backoff_ms.max(1) / 2);
    std::thread::sleep(Duration::from_millis(base + jitter));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_txn_commits() {
        let mut conn = Connection::open_in_memory().expect("conn");
        conn.execute_batch("CREATE TABLE t(x INTEGER)").expect("ddl");
        let n: i64 = immediate_txn::<_, std::convert::Infallible>(&mut conn, 3, 1, |tx| {
            tx.execute("INSERT INTO t(x) VALUES (1)", [])?;
            Ok(tx.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?)
        })
        .map_err(|_| "txn")
        .expect("txn");
        assert_eq!(n, 1);
    }

    #[test]
    fn test_app_errors_are_not_retried() {
        let mut conn = Connection::open_in_memory().expect("conn");
        let mut calls = 0u32;
        let result: Result<(), TxnError<&str>> = immediate_txn(&mut conn, 5, 1, |_tx| {
            calls += 1;
            Err(TxnError::App("boom"))
        });
        assert!(matches!(result, Err(TxnError::App("boom"))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_rollback_on_error() {
        let mut conn = Connection::open_in_memory().expect("conn");
        conn.execute_batch("CREATE TABLE t(x INTEGER)").expect("ddl");
        let result: Result<(), TxnError<&str>> = immediate_txn(&mut conn, 2, 1, |tx| {
            tx.execute("INSERT INTO t(x) VALUES (1)", [])?;
            Err(TxnError::App("abort"))
        });
        assert!(result.is_err());
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))
            .expect("count");
        assert_eq!(n, 0, "aborted transaction must leave no rows");
    }
}
