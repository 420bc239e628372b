//! Loja Backoffice - offline-first back office for device repair/retail stores.
//!
//! The service keeps a local SQLite store (inventory, sales, returns,
//! service orders, RMA, caixa) and mirrors it to a hosted table store in the
//! background. Callers drive it over a JSON-lines bridge on stdin/stdout:
//! each request `{"id","command","payload"}` gets exactly one response
//! `{"id","ok","data"|"error"}`. Logs go to stderr and a rolling file.

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Process start time for uptime reporting (epoch seconds).
pub(crate) static APP_START_EPOCH: AtomicU64 = AtomicU64::new(0);

mod auth;
mod cash_register;
mod commands;
mod customers;
mod data_helpers;
mod db;
mod diagnostics;
mod inventory;
mod money;
mod payments;
mod remote;
mod reports;
mod returns;
mod rma;
mod sales;
mod service_orders;
mod storage;
mod sync;
mod table;

pub use commands::{dispatch, AppContext};

const DATA_DIR_ENV: &str = "LOJA_BACKOFFICE_DATA_DIR";
const APP_DIR_NAME: &str = "loja-backoffice";

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

pub(crate) fn value_f64(v: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_f64()) {
            return Some(n);
        }
    }
    None
}

pub(crate) fn value_i64(v: &serde_json::Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        match v.get(*key) {
            Some(x) if x.is_i64() => return x.as_i64(),
            Some(x) if x.is_f64() => {
                let f = x.as_f64().unwrap_or(f64::NAN);
                if f.fract() == 0.0 && f.is_finite() {
                    return Some(f as i64);
                }
            }
            _ => {}
        }
    }
    None
}

pub(crate) fn value_bool(v: &serde_json::Value, keys: &[&str]) -> Option<bool> {
    for key in keys {
        match v.get(*key) {
            Some(serde_json::Value::Bool(b)) => return Some(*b),
            Some(serde_json::Value::Number(n)) => return n.as_i64().map(|n| n != 0),
            Some(serde_json::Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => return Some(true),
                "false" | "0" | "no" => return Some(false),
                _ => {}
            },
            _ => {}
        }
    }
    None
}

/// UTC timestamp in RFC 3339 with millisecond precision.
pub(crate) fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// Data directory
// ---------------------------------------------------------------------------

/// `$LOJA_BACKOFFICE_DATA_DIR`, or the platform local-data dir.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    match dirs::data_local_dir() {
        Some(base) => base.join(APP_DIR_NAME),
        None => {
            warn!("no platform data dir, using ./{APP_DIR_NAME}");
            PathBuf::from(APP_DIR_NAME)
        }
    }
}

// ---------------------------------------------------------------------------
// JSON-lines bridge
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BridgeRequest {
    #[serde(default)]
    id: serde_json::Value,
    command: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Handle one request line and build its response line.
pub(crate) async fn handle_line(ctx: &AppContext, line: &str) -> serde_json::Value {
    let request: BridgeRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            warn!("bridge: malformed request: {e}");
            return serde_json::json!({
                "id": serde_json::Value::Null,
                "ok": false,
                "error": format!("Malformed request: {e}"),
            });
        }
    };

    debug!(command = %request.command, "bridge request");
    match dispatch(ctx, &request.command, request.payload).await {
        Ok(data) => serde_json::json!({ "id": request.id, "ok": true, "data": data }),
        Err(error) => {
            debug!(command = %request.command, error = %error, "bridge command failed");
            serde_json::json!({ "id": request.id, "ok": false, "error": error })
        }
    }
}

/// Serve requests until the reader hits EOF.
pub(crate) async fn serve_lines<R, W>(ctx: &AppContext, mut reader: R, mut writer: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await.context("read request line")? == 0 {
            break;
        }
        let response = match std::str::from_utf8(&buf) {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => handle_line(ctx, line.trim_end()).await,
            Err(e) => {
                warn!("bridge: request line is not UTF-8: {e}");
                serde_json::json!({
                    "id": serde_json::Value::Null,
                    "ok": false,
                    "error": format!("Malformed request: {e}"),
                })
            }
        };
        let mut out = serde_json::to_vec(&response).context("encode response")?;
        out.push(b'\n');
        writer.write_all(&out).await.context("write response")?;
        writer.flush().await.context("flush response")?;
    }
    Ok(())
}

// ============================================================================
// App entry point
// ============================================================================

pub fn run() -> anyhow::Result<()> {
    let epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    APP_START_EPOCH.store(epoch, Ordering::Relaxed);

    let data_dir = resolve_data_dir();

    // Structured logging: stderr console + daily rolling file
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,loja_backoffice_lib=debug"));

    let log_dir = diagnostics::get_log_dir(&data_dir);
    std::fs::create_dir_all(&log_dir).ok();
    diagnostics::prune_old_logs(&log_dir);

    let file_appender = tracing_appender::rolling::daily(&log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(
        data_dir = %data_dir.display(),
        "Starting Loja Backoffice v{}",
        env!("CARGO_PKG_VERSION")
    );

    let db_state = db::init(&data_dir)
        .map_err(anyhow::Error::msg)
        .context("initialize database")?;
    // The sync loop gets its own connection so it never waits on a bridge call
    let db_for_sync = db::init(&data_dir)
        .map_err(anyhow::Error::msg)
        .context("initialize sync database")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    runtime.block_on(async move {
        let ctx = AppContext::new(db_state, data_dir.clone());
        let interval = sync::configured_interval_secs(&ctx.db);
        sync::start_sync_loop(Arc::new(db_for_sync), ctx.sync_state.clone(), interval);

        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let stdout = tokio::io::stdout();
        serve_lines(&ctx, stdin, stdout).await?;

        ctx.sync_state.is_running.store(false, Ordering::SeqCst);
        info!("Bridge input closed, shutting down");
        Ok::<(), anyhow::Error>(())
    })?;

    drop(_guard);
    Ok(())
}
