//! Diagnostics for support:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **System health**: schema version, sync backlog, open caixas, DB size
//! - **Diagnostics export**: zip bundle of the above plus recent sync errors
//!   and log files, with sensitive keys redacted
//! - **Log rotation helpers** used by `run()` for the rolling log files

use crate::db::{self, DbState};
use crate::sync::pending_by_table;
use rusqlite::params;
use serde_json::{json, Value};
use std::fs;
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use tracing::{info, warn};

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Per-file cap when bundling logs (5 MB).
pub const MAX_LOG_SIZE: u64 = 5 * 1024 * 1024;

/// Prefix of the daily rolling log files (`backoffice.log.YYYY-MM-DD`).
pub const LOG_FILE_PREFIX: &str = "backoffice.log";

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

pub fn get_about_info() -> Value {
    let started = crate::APP_START_EPOCH.load(Ordering::Relaxed);
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "uptimeSecs": if started > 0 { now.saturating_sub(started) } else { 0 },
    })
}

// ---------------------------------------------------------------------------
// System health
// ---------------------------------------------------------------------------

pub fn get_system_health(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let schema_version = db::schema_version(&conn);
    let sync_backlog = pending_by_table(&conn)?;

    let open_sessions: Vec<Value> = {
        let mut stmt = conn
            .prepare(
                "SELECT cs.id, cs.loja_id, l.name, cs.opened_at
                 FROM cash_sessions cs JOIN lojas l ON l.id = cs.loja_id
                 WHERE cs.status = 'aberto' ORDER BY cs.opened_at",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map([], |row| {
                Ok(json!({
                    "sessionId": row.get::<_, String>(0)?,
                    "lojaId": row.get::<_, String>(1)?,
                    "lojaName": row.get::<_, String>(2)?,
                    "openedAt": row.get::<_, String>(3)?,
                }))
            })
            .map_err(|e| e.to_string())?;
        rows.flatten().collect()
    };

    let last_sync_error: Value = conn
        .query_row(
            "SELECT table_name, row_id, last_error, updated_at FROM sync_queue
             WHERE last_error IS NOT NULL AND last_error != ''
             ORDER BY updated_at DESC LIMIT 1",
            [],
            |row| {
                Ok(json!({
                    "table": row.get::<_, String>(0)?,
                    "rowId": row.get::<_, String>(1)?,
                    "error": row.get::<_, String>(2)?,
                    "at": row.get::<_, Option<String>>(3)?,
                }))
            },
        )
        .unwrap_or(Value::Null);

    let db_size = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);

    Ok(json!({
        "schemaVersion": schema_version,
        "syncBacklog": sync_backlog,
        "openCashSessions": open_sessions,
        "lastSyncError": last_sync_error,
        "remoteConfigured": crate::storage::is_configured(),
        "dbSizeBytes": db_size,
    }))
}

// ---------------------------------------------------------------------------
// Diagnostics export (zip bundle)
// ---------------------------------------------------------------------------

fn write_json_entry(
    zip: &mut zip::ZipWriter<fs::File>,
    name: &str,
    value: &Value,
    options: zip::write::SimpleFileOptions,
) -> Result<(), String> {
    let body = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    zip.start_file(name, options).map_err(|e| e.to_string())?;
    zip.write_all(body.as_bytes()).map_err(|e| e.to_string())
}

/// Write a diagnostics zip into `output_dir` and return its path.
pub fn export_diagnostics(db: &DbState, output_dir: &Path, log_dir: &Path) -> Result<String, String> {
    fs::create_dir_all(output_dir).map_err(|e| format!("create output dir: {e}"))?;

    let health = redact_sensitive_fields(get_system_health(db)?);
    let (errors, settings) = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        (
            redact_sensitive_fields(json!(get_recent_sync_errors(&conn, 20))),
            redact_sensitive_fields(db::get_all_settings(&conn)),
        )
    };

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let zip_path = output_dir.join(format!("loja-backoffice-diagnostics-{timestamp}.zip"));
    let file = fs::File::create(&zip_path)
        .map_err(|e| format!("Failed to create diagnostics zip: {e}"))?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    write_json_entry(&mut zip, "about.json", &get_about_info(), options)?;
    write_json_entry(&mut zip, "system_health.json", &health, options)?;
    write_json_entry(&mut zip, "sync_errors.json", &errors, options)?;
    write_json_entry(&mut zip, "settings.json", &settings, options)?;

    for path in log_files_newest_first(log_dir).into_iter().take(MAX_LOG_FILES) {
        let fname = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        if zip.start_file(format!("logs/{fname}"), options).is_ok() {
            if let Ok(f) = fs::File::open(&path) {
                let mut buf = Vec::new();
                let _ = f.take(MAX_LOG_SIZE).read_to_end(&mut buf);
                let _ = zip.write_all(&buf);
            }
        }
    }

    zip.finish().map_err(|e| e.to_string())?;
    let path = zip_path.to_string_lossy().to_string();
    info!(path = %path, "diagnostics exported");
    Ok(path)
}

fn redact_sensitive_fields(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    if should_redact_key(&key) {
                        (key, Value::String("[REDACTED]".to_string()))
                    } else {
                        (key, redact_sensitive_fields(value))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact_sensitive_fields).collect()),
        other => other,
    }
}

fn should_redact_key(key: &str) -> bool {
    let normalized = key.to_ascii_lowercase();
    [
        "api_key",
        "apikey",
        "secret",
        "password",
        "token",
        "authorization",
        "pin",
        "lockout",
        "document",
    ]
    .iter()
    .any(|marker| normalized.contains(marker))
}

fn get_recent_sync_errors(conn: &rusqlite::Connection, limit: i64) -> Vec<Value> {
    let Ok(mut stmt) = conn.prepare(
        "SELECT id, table_name, row_id, operation, status, last_error, retry_count, created_at, updated_at
         FROM sync_queue
         WHERE last_error IS NOT NULL AND last_error != ''
         ORDER BY updated_at DESC LIMIT ?1",
    ) else {
        return Vec::new();
    };
    let rows = stmt.query_map(params![limit], |row| {
        Ok(json!({
            "id": row.get::<_, i64>(0)?,
            "table": row.get::<_, String>(1)?,
            "rowId": row.get::<_, String>(2)?,
            "operation": row.get::<_, String>(3)?,
            "status": row.get::<_, String>(4)?,
            "lastError": row.get::<_, String>(5)?,
            "retryCount": row.get::<_, i64>(6)?,
            "createdAt": row.get::<_, Option<String>>(7)?,
            "updatedAt": row.get::<_, Option<String>>(8)?,
        }))
    });
    match rows {
        Ok(rows) => rows.flatten().collect(),
        Err(_) => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

pub fn get_log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

fn log_files_newest_first(log_dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX));
            if path.is_file() && is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                files.push((path, modified));
            }
        }
    }
    files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    files.into_iter().map(|(p, _)| p).collect()
}

/// Keep only the newest `MAX_LOG_FILES` log files.
pub fn prune_old_logs(log_dir: &Path) {
    for path in log_files_newest_first(log_dir).iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("{tag}_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn about_info_has_build_fields() {
        let info = get_about_info();
        assert!(info["version"].is_string());
        assert!(info.get("buildTimestamp").is_some());
        assert!(info.get("gitSha").is_some());
        assert!(info["platform"].is_string());
    }

    #[test]
    fn health_reports_open_caixas_and_backlog() {
        let db = db::test_state();
        crate::inventory::test_support::seed_loja(&db, "l1");
        crate::sales::test_support::open_caixa(&db, "l1");
        let health = get_system_health(&db).unwrap();
        assert_eq!(health["schemaVersion"], db::CURRENT_SCHEMA_VERSION);
        assert_eq!(health["openCashSessions"][0]["lojaId"], "l1");
        assert_eq!(health["syncBacklog"]["cash_sessions"]["pending"], 1);
        assert!(health["lastSyncError"].is_null());
    }

    #[test]
    fn export_creates_zip_with_logs() {
        let dir = temp_dir("diag_export");
        let log_dir = get_log_dir(&dir);
        fs::create_dir_all(&log_dir).unwrap();
        fs::write(log_dir.join(format!("{LOG_FILE_PREFIX}.2026-01-01")), "line").unwrap();
        fs::write(log_dir.join("other.txt"), "ignored").unwrap();

        let db = db::init(&dir).unwrap();
        let zip_path = export_diagnostics(&db, &dir.join("out"), &log_dir).unwrap();
        let file = fs::File::open(&zip_path).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        assert_eq!(archive.len(), 5);
        assert!(archive.by_name("logs/backoffice.log.2026-01-01").is_ok());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn redaction_recurses() {
        let redacted = redact_sensitive_fields(json!({
            "auth": { "lockout_until": "x", "pin_hash": "y" },
            "items": [{ "api_key": "k" }, { "name": "ok" }]
        }));
        assert_eq!(redacted["auth"]["lockout_until"], "[REDACTED]");
        assert_eq!(redacted["auth"]["pin_hash"], "[REDACTED]");
        assert_eq!(redacted["items"][0]["api_key"], "[REDACTED]");
        assert_eq!(redacted["items"][1]["name"], "ok");
        assert!(!should_redact_key("status"));
    }

    #[test]
    fn prune_keeps_newest_files() {
        let dir = temp_dir("diag_prune");
        for day in 1..=12 {
            fs::write(dir.join(format!("{LOG_FILE_PREFIX}.2026-01-{day:02}")), "x").unwrap();
        }
        prune_old_logs(&dir);
        let remaining = log_files_newest_first(&dir);
        assert_eq!(remaining.len(), MAX_LOG_FILES);
        let _ = fs::remove_dir_all(&dir);
    }
}
