//! Outbound mirror of local rows to the hosted table store.
//!
//! Every workflow write calls [`enqueue_row`] inside its transaction, so the
//! queue always reflects committed state. A background tokio task drains
//! due entries in creation order, grouped per table, and applies
//! exponential backoff on failure.

use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::data_helpers::query_one_json;
use crate::db::{self, DbState};
use crate::remote::{RemoteClient, RemoteError, TableStore};
use crate::storage;

// ---------------------------------------------------------------------------
// Sync engine state
// ---------------------------------------------------------------------------

/// Shared state between the background loop and the bridge commands.
pub struct SyncState {
    pub is_running: Arc<AtomicBool>,
    pub last_sync: Arc<std::sync::Mutex<Option<String>>>,
    /// Serializes cycles so `force_sync` never overlaps the loop.
    cycle_lock: tokio::sync::Mutex<()>,
}

impl SyncState {
    pub fn new() -> Self {
        Self {
            is_running: Arc::new(AtomicBool::new(false)),
            last_sync: Arc::new(std::sync::Mutex::new(None)),
            cycle_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn mark_synced_now(&self) {
        if let Ok(mut guard) = self.last_sync.lock() {
            *guard = Some(crate::now_iso());
        }
    }
}

impl Default for SyncState {
    fn default() -> Self {
        Self::new()
    }
}

const DEFAULT_RETRY_DELAY_MS: i64 = 5_000;
const MAX_RETRY_DELAY_MS: i64 = 300_000;
const SYNC_BATCH_SIZE: i64 = 100;
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;

/// Tables mirrored to the hosted store.
pub const SYNCED_TABLES: &[&str] = &[
    "lojas",
    "customers",
    "suppliers",
    "products",
    "stock_levels",
    "stock_movements",
    "cash_sessions",
    "cash_movements",
    "sales",
    "sale_items",
    "payments",
    "credit_entries",
    "returns",
    "return_items",
    "service_orders",
    "service_order_parts",
    "rmas",
    "status_history",
];

#[derive(Debug, Clone)]
struct SyncItem {
    id: i64,
    table_name: String,
    row_id: String,
    operation: String,
    payload: Value,
    retry_count: i64,
    max_retries: i64,
    retry_delay_ms: i64,
}

// ---------------------------------------------------------------------------
// Enqueue
// ---------------------------------------------------------------------------

/// Queue a row for the hosted mirror. Call inside the writing transaction.
///
/// For `insert`/`update` the payload is the full current row; for `delete`
/// it is just the id.
pub fn enqueue_row(
    conn: &Connection,
    table: &str,
    row_id: &str,
    operation: &str,
) -> Result<(), String> {
    if !SYNCED_TABLES.contains(&table) {
        return Err(format!("table not synced: {table}"));
    }

    let payload = match operation {
        "insert" | "update" => {
            let sql = format!("SELECT * FROM {table} WHERE id = ?1");
            let row = query_one_json(conn, &sql, params![row_id])?;
            if row.is_null() {
                return Err(format!("enqueue {table}: row not found: {row_id}"));
            }
            row
        }
        "delete" => serde_json::json!({ "id": row_id }),
        other => return Err(format!("invalid sync operation: {other}")),
    };

    let now = crate::now_iso();
    conn.execute(
        "INSERT INTO sync_queue (table_name, row_id, operation, payload, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)",
        params![table, row_id, operation, payload.to_string(), now],
    )
    .map_err(|e| format!("enqueue sync: {e}"))?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Queue bookkeeping
// ---------------------------------------------------------------------------

/// Put entries stuck in `syncing` (process died mid-cycle) back to `pending`.
pub fn recover_in_flight(db: &DbState) -> Result<usize, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let n = conn
        .execute(
            "UPDATE sync_queue SET status = 'pending', updated_at = ?1 WHERE status = 'syncing'",
            params![crate::now_iso()],
        )
        .map_err(|e| format!("recover syncing: {e}"))?;
    if n > 0 {
        info!(count = n, "Requeued in-flight sync entries");
    }
    Ok(n)
}

/// Load due entries and flip them to `syncing`.
fn claim_due_items(db: &DbState, limit: i64) -> Result<Vec<SyncItem>, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare(
            "SELECT id, table_name, row_id, operation, payload, retry_count, max_retries, retry_delay_ms
             FROM sync_queue
             WHERE status = 'pending'
               AND (next_retry_at IS NULL OR julianday(next_retry_at) <= julianday('now'))
             ORDER BY id ASC
             LIMIT ?1",
        )
        .map_err(|e| e.to_string())?;

    let items: Vec<SyncItem> = stmt
        .query_map(params![limit], |row| {
            let raw: String = row.get(4)?;
            Ok(SyncItem {
                id: row.get(0)?,
                table_name: row.get(1)?,
                row_id: row.get(2)?,
                operation: row.get(3)?,
                payload: serde_json::from_str(&raw).unwrap_or(Value::Null),
                retry_count: row.get(5)?,
                max_retries: row.get(6)?,
                retry_delay_ms: row.get(7)?,
            })
        })
        .map_err(|e| e.to_string())?
        .filter_map(|r| r.ok())
        .collect();

    let now = crate::now_iso();
    for item in &items {
        conn.execute(
            "UPDATE sync_queue SET status = 'syncing', updated_at = ?1 WHERE id = ?2",
            params![now, item.id],
        )
        .map_err(|e| format!("claim sync item: {e}"))?;
    }

    Ok(items)
}

fn mark_synced(db: &DbState, ids: &[i64]) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let now = crate::now_iso();
    for id in ids {
        conn.execute(
            "UPDATE sync_queue
             SET status = 'synced', last_error = NULL, next_retry_at = NULL, updated_at = ?1
             WHERE id = ?2",
            params![now, id],
        )
        .map_err(|e| format!("mark synced: {e}"))?;
    }
    Ok(())
}

/// Return claimed entries to `pending` without counting an attempt.
fn release_items(db: &DbState, items: &[SyncItem]) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let now = crate::now_iso();
    for item in items {
        conn.execute(
            "UPDATE sync_queue SET status = 'pending', updated_at = ?1 WHERE id = ?2",
            params![now, item.id],
        )
        .map_err(|e| format!("release sync item: {e}"))?;
    }
    Ok(())
}

fn schedule_next_retry(delay_ms: i64) -> String {
    let bounded = delay_ms.clamp(1_000, MAX_RETRY_DELAY_MS);
    (Utc::now() + ChronoDuration::milliseconds(bounded)).to_rfc3339()
}

/// Count a failed attempt. Transient errors back off (doubling up to
/// five minutes); permanent errors and exhausted retries end in `failed`.
fn mark_batch_failed(db: &DbState, items: &[SyncItem], error: &RemoteError) -> Result<(), String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let message = error.to_string();
    let now = crate::now_iso();

    for item in items {
        let new_count = item.retry_count + 1;
        let exhausted = !error.is_transient() || new_count >= item.max_retries;
        let new_status = if exhausted { "failed" } else { "pending" };
        let delay = item.retry_delay_ms.max(DEFAULT_RETRY_DELAY_MS);
        let next_retry_at = if exhausted {
            None
        } else {
            Some(schedule_next_retry(delay))
        };
        let next_delay = (delay * 2).min(MAX_RETRY_DELAY_MS);
        conn.execute(
            "UPDATE sync_queue
             SET status = ?1,
                 retry_count = ?2,
                 next_retry_at = ?3,
                 retry_delay_ms = ?4,
                 last_error = ?5,
                 updated_at = ?6
             WHERE id = ?7",
            params![new_status, new_count, next_retry_at, next_delay, message, now, item.id],
        )
        .map_err(|e| format!("mark failed: {e}"))?;
    }

    warn!(
        count = items.len(),
        transient = error.is_transient(),
        error = %message,
        "Sync batch failed"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Cycle
// ---------------------------------------------------------------------------

/// Split items into per-table groups, keeping first-seen table order and
/// creation order within each table.
fn group_by_table(items: Vec<SyncItem>) -> Vec<(String, Vec<SyncItem>)> {
    let mut groups: Vec<(String, Vec<SyncItem>)> = Vec::new();
    for item in items {
        match groups.iter_mut().find(|(t, _)| *t == item.table_name) {
            Some((_, group)) => group.push(item),
            None => groups.push((item.table_name.clone(), vec![item])),
        }
    }
    groups
}

/// Push one table's entries. Consecutive inserts/updates go out as a single
/// upsert (last payload per row wins), deletes one by one. On the first
/// failure the remaining entries are released untouched so ordering holds.
async fn push_table_group<S: TableStore>(
    db: &DbState,
    store: &S,
    table: &str,
    items: Vec<SyncItem>,
) -> Result<usize, String> {
    let mut synced = 0usize;
    let mut idx = 0usize;

    while idx < items.len() {
        let batch_end = if items[idx].operation == "delete" {
            idx + 1
        } else {
            let mut end = idx;
            while end < items.len() && items[end].operation != "delete" {
                end += 1;
            }
            end
        };
        let batch = &items[idx..batch_end];

        let result = if batch[0].operation == "delete" {
            store.delete_row(table, &batch[0].row_id).await
        } else {
            let mut rows: Vec<(String, Value)> = Vec::new();
            for item in batch {
                match rows.iter_mut().find(|(id, _)| *id == item.row_id) {
                    Some((_, payload)) => *payload = item.payload.clone(),
                    None => rows.push((item.row_id.clone(), item.payload.clone())),
                }
            }
            let payloads: Vec<Value> = rows.into_iter().map(|(_, p)| p).collect();
            store.upsert_rows(table, &payloads).await
        };

        match result {
            Ok(()) => {
                let ids: Vec<i64> = batch.iter().map(|i| i.id).collect();
                mark_synced(db, &ids)?;
                synced += batch.len();
                idx = batch_end;
            }
            Err(e) => {
                mark_batch_failed(db, batch, &e)?;
                release_items(db, &items[batch_end..])?;
                return Ok(synced);
            }
        }
    }

    Ok(synced)
}

/// Drain one batch of due entries. Returns how many were synced.
pub async fn run_sync_cycle<S: TableStore>(db: &DbState, store: &S) -> Result<usize, String> {
    let items = claim_due_items(db, SYNC_BATCH_SIZE)?;
    if items.is_empty() {
        return Ok(0);
    }
    debug!(count = items.len(), "Sync cycle claimed entries");

    let mut synced = 0usize;
    for (table, group) in group_by_table(items) {
        synced += push_table_group(db, store, &table, group).await?;
    }
    Ok(synced)
}

// ---------------------------------------------------------------------------
// Background loop & manual triggers
// ---------------------------------------------------------------------------

/// Spawn the background loop on the current tokio runtime.
pub fn start_sync_loop(db: Arc<DbState>, sync_state: Arc<SyncState>, interval_secs: u64) {
    let is_running = sync_state.is_running.clone();
    is_running.store(true, Ordering::SeqCst);

    tokio::spawn(async move {
        info!("Sync loop started (interval: {interval_secs}s)");
        if let Err(e) = recover_in_flight(&db) {
            warn!("Sync recovery failed: {e}");
        }

        loop {
            tokio::time::sleep(Duration::from_secs(interval_secs)).await;

            if !is_running.load(Ordering::SeqCst) {
                info!("Sync loop stopped");
                break;
            }

            if !storage::is_configured() {
                continue;
            }

            let client = match RemoteClient::from_storage() {
                Ok(c) => c,
                Err(e) => {
                    warn!("Sync client unavailable: {e}");
                    continue;
                }
            };

            let _cycle = sync_state.cycle_lock.lock().await;
            match run_sync_cycle(&db, &client).await {
                Ok(synced) => {
                    if synced > 0 {
                        info!("Sync cycle complete: {synced} items synced");
                    }
                    sync_state.mark_synced_now();
                }
                Err(e) => warn!("Sync cycle failed: {e}"),
            }
        }
    });
}

/// Run one cycle now.
pub async fn force_sync(db: &DbState, sync_state: &SyncState) -> Result<Value, String> {
    if !storage::is_configured() {
        return Err("Remote store not configured".into());
    }
    let client = RemoteClient::from_storage()?;

    let _cycle = sync_state.cycle_lock.lock().await;
    let synced = run_sync_cycle(db, &client).await?;
    sync_state.mark_synced_now();
    info!("Force sync complete: {synced} items synced");

    Ok(serde_json::json!({ "success": true, "synced": synced }))
}

/// Queue counts per status, backlog per table and last sync time.
pub fn get_sync_status(db: &DbState, sync_state: &SyncState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let mut counts = serde_json::json!({
        "pending": 0, "syncing": 0, "synced": 0, "failed": 0,
    });
    {
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM sync_queue GROUP BY status")
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|e| e.to_string())?;
        for (status, count) in rows.flatten() {
            counts[status] = serde_json::json!(count);
        }
    }

    let backlog = pending_by_table(&conn)?;

    let oldest_next_retry_at: Option<String> = conn
        .query_row(
            "SELECT MIN(next_retry_at) FROM sync_queue
             WHERE status = 'pending' AND next_retry_at IS NOT NULL",
            [],
            |row| row.get(0),
        )
        .ok()
        .flatten();

    let last_error: Option<String> = conn
        .query_row(
            "SELECT last_error FROM sync_queue
             WHERE last_error IS NOT NULL ORDER BY updated_at DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .ok();

    let last_sync = sync_state.last_sync.lock().ok().and_then(|g| g.clone());

    Ok(serde_json::json!({
        "configured": storage::is_configured(),
        "running": sync_state.is_running.load(Ordering::SeqCst),
        "lastSync": last_sync,
        "counts": counts,
        "pendingByTable": backlog,
        "oldestNextRetryAt": oldest_next_retry_at,
        "lastError": last_error,
    }))
}

pub(crate) fn pending_by_table(conn: &Connection) -> Result<Value, String> {
    let mut result = serde_json::Map::new();
    let mut stmt = conn
        .prepare(
            "SELECT table_name, status, COUNT(*) FROM sync_queue
             WHERE status != 'synced'
             GROUP BY table_name, status",
        )
        .map_err(|e| e.to_string())?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })
        .map_err(|e| e.to_string())?;
    for (table, status, count) in rows.flatten() {
        let entry = result
            .entry(table)
            .or_insert_with(|| serde_json::json!({}));
        entry[status] = serde_json::json!(count);
    }
    Ok(Value::Object(result))
}

/// Move every `failed` entry back to `pending` with a fresh retry budget.
pub fn retry_failed(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let n = conn
        .execute(
            "UPDATE sync_queue
             SET status = 'pending', retry_count = 0, retry_delay_ms = ?1,
                 next_retry_at = NULL, updated_at = ?2
             WHERE status = 'failed'",
            params![DEFAULT_RETRY_DELAY_MS, crate::now_iso()],
        )
        .map_err(|e| format!("retry failed: {e}"))?;
    info!(count = n, "Requeued failed sync entries");
    Ok(serde_json::json!({ "success": true, "requeued": n }))
}

/// Interval for the background loop, from `local_settings` (sync/interval_secs).
pub fn configured_interval_secs(db: &DbState) -> u64 {
    db.conn
        .lock()
        .ok()
        .and_then(|conn| db::get_setting(&conn, "sync", "interval_secs"))
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|secs| *secs >= 5)
        .unwrap_or(DEFAULT_SYNC_INTERVAL_SECS)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        calls: Mutex<Vec<(String, String, Vec<String>)>>,
        fail_tables: Vec<(String, RemoteErrorKind)>,
    }

    #[derive(Clone, Copy)]
    enum RemoteErrorKind {
        Transient,
        Permanent,
    }

    impl FakeStore {
        fn failing(table: &str, kind: RemoteErrorKind) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_tables: vec![(table.to_string(), kind)],
            }
        }

        fn check(&self, table: &str) -> Result<(), RemoteError> {
            match self.fail_tables.iter().find(|(t, _)| t == table) {
                Some((_, RemoteErrorKind::Transient)) => Err(RemoteError::Http {
                    status: 503,
                    body: "unavailable".into(),
                }),
                Some((_, RemoteErrorKind::Permanent)) => Err(RemoteError::Http {
                    status: 400,
                    body: "column does not exist".into(),
                }),
                None => Ok(()),
            }
        }
    }

    impl TableStore for FakeStore {
        async fn upsert_rows(&self, table: &str, rows: &[Value]) -> Result<(), RemoteError> {
            self.calls.lock().unwrap().push((
                "upsert".into(),
                table.into(),
                rows.iter()
                    .map(|r| r["id"].as_str().unwrap_or_default().to_string())
                    .collect(),
            ));
            self.check(table)
        }

        async fn delete_row(&self, table: &str, id: &str) -> Result<(), RemoteError> {
            self.calls
                .lock()
                .unwrap()
                .push(("delete".into(), table.into(), vec![id.into()]));
            self.check(table)
        }
    }

    fn seed_product(db: &DbState, id: &str, sku: &str) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO products (id, sku, name, created_at, updated_at) VALUES (?1, ?2, 'Item', 'x', 'x')",
            params![id, sku],
        )
        .unwrap();
        enqueue_row(&conn, "products", id, "insert").unwrap();
    }

    fn status_of(db: &DbState, row_id: &str) -> Vec<String> {
        let conn = db.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT status FROM sync_queue WHERE row_id = ?1 ORDER BY id")
            .unwrap();
        stmt.query_map(params![row_id], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn enqueue_captures_full_row_payload() {
        let db = db::test_state();
        seed_product(&db, "p1", "SKU-1");
        let conn = db.conn.lock().unwrap();
        let payload: String = conn
            .query_row("SELECT payload FROM sync_queue WHERE row_id = 'p1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        let v: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(v["sku"], "SKU-1");
    }

    #[test]
    fn enqueue_rejects_unsynced_table_and_missing_row() {
        let db = db::test_state();
        let conn = db.conn.lock().unwrap();
        assert!(enqueue_row(&conn, "local_settings", "x", "insert").is_err());
        assert!(enqueue_row(&conn, "products", "missing", "update").is_err());
        assert!(enqueue_row(&conn, "products", "p1", "upsert").is_err());
    }

    #[tokio::test]
    async fn cycle_batches_upserts_and_marks_synced() {
        let db = db::test_state();
        seed_product(&db, "p1", "A");
        seed_product(&db, "p2", "B");
        {
            let conn = db.conn.lock().unwrap();
            enqueue_row(&conn, "products", "p1", "update").unwrap();
        }

        let store = FakeStore::default();
        let synced = run_sync_cycle(&db, &store).await.unwrap();
        assert_eq!(synced, 3);

        let calls = store.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "upsert");
        // Duplicate row ids collapse into one upsert row
        assert_eq!(calls[0].2, vec!["p1".to_string(), "p2".to_string()]);
        drop(calls);
        assert_eq!(status_of(&db, "p1"), vec!["synced", "synced"]);
    }

    #[tokio::test]
    async fn deletes_split_upsert_batches_in_order() {
        let db = db::test_state();
        seed_product(&db, "p1", "A");
        {
            let conn = db.conn.lock().unwrap();
            enqueue_row(&conn, "products", "p1", "delete").unwrap();
        }
        seed_product(&db, "p2", "B");

        let store = FakeStore::default();
        run_sync_cycle(&db, &store).await.unwrap();
        let calls = store.calls.lock().unwrap();
        let ops: Vec<&str> = calls.iter().map(|c| c.0.as_str()).collect();
        assert_eq!(ops, vec!["upsert", "delete", "upsert"]);
    }

    #[tokio::test]
    async fn transient_failure_backs_off_and_keeps_other_tables_moving() {
        let db = db::test_state();
        seed_product(&db, "p1", "A");
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO customers (id, name, created_at, updated_at) VALUES ('c1', 'Ana', 'x', 'x')",
                [],
            )
            .unwrap();
            enqueue_row(&conn, "customers", "c1", "insert").unwrap();
        }

        let store = FakeStore::failing("products", RemoteErrorKind::Transient);
        let synced = run_sync_cycle(&db, &store).await.unwrap();
        assert_eq!(synced, 1);
        assert_eq!(status_of(&db, "p1"), vec!["pending"]);
        assert_eq!(status_of(&db, "c1"), vec!["synced"]);

        let conn = db.conn.lock().unwrap();
        let (retry_count, next_retry_at, delay): (i64, Option<String>, i64) = conn
            .query_row(
                "SELECT retry_count, next_retry_at, retry_delay_ms FROM sync_queue WHERE row_id = 'p1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(retry_count, 1);
        assert!(next_retry_at.is_some());
        assert_eq!(delay, 10_000);
    }

    #[tokio::test]
    async fn backed_off_entries_are_not_due() {
        let db = db::test_state();
        seed_product(&db, "p1", "A");
        let store = FakeStore::failing("products", RemoteErrorKind::Transient);
        run_sync_cycle(&db, &store).await.unwrap();

        let healthy = FakeStore::default();
        let synced = run_sync_cycle(&db, &healthy).await.unwrap();
        assert_eq!(synced, 0);
        assert!(healthy.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn permanent_failure_marks_failed_and_releases_rest() {
        let db = db::test_state();
        seed_product(&db, "p1", "A");
        {
            let conn = db.conn.lock().unwrap();
            enqueue_row(&conn, "products", "p1", "delete").unwrap();
        }

        let store = FakeStore::failing("products", RemoteErrorKind::Permanent);
        run_sync_cycle(&db, &store).await.unwrap();
        // First batch failed permanently, the delete behind it is untouched
        assert_eq!(status_of(&db, "p1"), vec!["failed", "pending"]);

        let result = retry_failed(&db).unwrap();
        assert_eq!(result["requeued"], 1);
        assert_eq!(status_of(&db, "p1"), vec!["pending", "pending"]);
    }

    #[tokio::test]
    async fn exhausted_retries_end_failed() {
        let db = db::test_state();
        seed_product(&db, "p1", "A");
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "UPDATE sync_queue SET retry_count = 4, max_retries = 5 WHERE row_id = 'p1'",
                [],
            )
            .unwrap();
        }
        let store = FakeStore::failing("products", RemoteErrorKind::Transient);
        run_sync_cycle(&db, &store).await.unwrap();
        assert_eq!(status_of(&db, "p1"), vec!["failed"]);
    }

    #[test]
    fn recover_in_flight_requeues_syncing() {
        let db = db::test_state();
        seed_product(&db, "p1", "A");
        {
            let conn = db.conn.lock().unwrap();
            conn.execute("UPDATE sync_queue SET status = 'syncing'", []).unwrap();
        }
        assert_eq!(recover_in_flight(&db).unwrap(), 1);
        assert_eq!(status_of(&db, "p1"), vec!["pending"]);
    }

    #[test]
    fn sync_status_reports_counts_and_backlog() {
        let db = db::test_state();
        seed_product(&db, "p1", "A");
        let state = SyncState::new();
        let status = get_sync_status(&db, &state).unwrap();
        assert_eq!(status["counts"]["pending"], 1);
        assert_eq!(status["pendingByTable"]["products"]["pending"], 1);
        assert!(status["lastSync"].is_null());
    }

    #[test]
    fn interval_setting_falls_back_to_default() {
        let db = db::test_state();
        assert_eq!(configured_interval_secs(&db), DEFAULT_SYNC_INTERVAL_SECS);
        {
            let conn = db.conn.lock().unwrap();
            db::set_setting(&conn, "sync", "interval_secs", "60").unwrap();
        }
        assert_eq!(configured_interval_secs(&db), 60);
        {
            let conn = db.conn.lock().unwrap();
            db::set_setting(&conn, "sync", "interval_secs", "1").unwrap();
        }
        assert_eq!(configured_interval_secs(&db), DEFAULT_SYNC_INTERVAL_SECS);
    }
}
