use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::{authorize, require_login, AppContext};
use crate::remote::RemoteClient;
use crate::storage;
use crate::sync as sync_service;

const REMOTE_FETCH_DEFAULT_LIMIT: i64 = 100;
const REMOTE_FETCH_MAX_LIMIT: i64 = 1000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteFetchPayload {
    table: String,
    #[serde(default)]
    filters: serde_json::Map<String, Value>,
    #[serde(default, alias = "order_by")]
    order_by: Option<String>,
    #[serde(default)]
    ascending: Option<bool>,
    #[serde(default)]
    limit: Option<i64>,
}

fn parse_remote_fetch_payload(arg0: Value) -> Result<RemoteFetchPayload, String> {
    let payload = match arg0 {
        Value::String(table) => serde_json::json!({ "table": table }),
        other => other,
    };
    let mut parsed: RemoteFetchPayload =
        serde_json::from_value(payload).map_err(|e| format!("Invalid remote fetch payload: {e}"))?;
    parsed.table = parsed.table.trim().to_string();
    if !sync_service::SYNCED_TABLES.contains(&parsed.table.as_str()) {
        return Err(format!("Unknown table: {}", parsed.table));
    }
    if let Some(column) = parsed.order_by.as_deref() {
        if column.is_empty() || !column.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(format!("Invalid orderBy column: {column}"));
        }
    }
    parsed.limit = Some(
        parsed
            .limit
            .unwrap_or(REMOTE_FETCH_DEFAULT_LIMIT)
            .clamp(1, REMOTE_FETCH_MAX_LIMIT),
    );
    Ok(parsed)
}

// ---------------------------------------------------------------------------
// Sync queue
// ---------------------------------------------------------------------------

pub(super) fn sync_status(ctx: &AppContext) -> Result<Value, String> {
    require_login(ctx)?;
    sync_service::get_sync_status(&ctx.db, &ctx.sync_state)
}

pub(super) async fn sync_force(ctx: &AppContext) -> Result<Value, String> {
    authorize(ctx, Some("force_sync"))?;
    sync_service::force_sync(&ctx.db, &ctx.sync_state).await
}

pub(super) fn sync_retry_failed(ctx: &AppContext) -> Result<Value, String> {
    authorize(ctx, Some("force_sync"))?;
    sync_service::retry_failed(&ctx.db)
}

// ---------------------------------------------------------------------------
// Hosted store
// ---------------------------------------------------------------------------

pub(super) fn remote_config_get(ctx: &AppContext) -> Result<Value, String> {
    authorize(ctx, Some("manage_staff"))?;
    Ok(storage::get_full_config())
}

pub(super) fn remote_config_update(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let actor = authorize(ctx, Some("manage_staff"))?;
    let result = storage::update_remote_credentials(&payload)?;
    info!(staff_id = %actor.staff_id, "remote config updated from bridge");
    Ok(result)
}

pub(super) fn remote_factory_reset(ctx: &AppContext) -> Result<Value, String> {
    let actor = authorize(ctx, Some("manage_staff"))?;
    info!(staff_id = %actor.staff_id, "remote factory reset requested");
    storage::factory_reset()
}

/// Read rows straight from the hosted store.
pub(super) async fn remote_fetch(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    authorize(ctx, Some("view_reports"))?;
    let parsed = parse_remote_fetch_payload(payload)?;
    let client = RemoteClient::from_storage().map_err(|e| e.to_string())?;
    let filters: Vec<(String, Value)> = parsed.filters.into_iter().collect();
    let order = parsed
        .order_by
        .as_deref()
        .map(|column| (column, parsed.ascending.unwrap_or(true)));
    let rows = client
        .fetch_rows(&parsed.table, &filters, order, parsed.limit)
        .await
        .map_err(|e| e.to_string())?;
    Ok(serde_json::json!({ "table": parsed.table, "rows": rows }))
}
