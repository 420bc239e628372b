use serde_json::Value;
use tracing::info;

use super::{authorize, require_login, AppContext};
use crate::{db, diagnostics};

#[derive(Debug, PartialEq)]
struct SettingsSetPayload {
    category: String,
    key: String,
    value: String,
}

fn value_to_settings_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// `{category?, key, value}` or `"category.key"` with the value in `value`.
fn parse_settings_set_payload(arg0: Value) -> Result<SettingsSetPayload, String> {
    let obj = match arg0 {
        Value::Object(obj) => obj,
        _ => return Err("Invalid settings payload: expected object".into()),
    };
    let mut category = obj
        .get("category")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "general".to_string());
    let mut key = obj
        .get("key")
        .or_else(|| obj.get("settingKey"))
        .or_else(|| obj.get("setting_key"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or("Missing required field: key")?;

    if !obj.contains_key("category") {
        if let Some((cat, k)) = key.split_once('.').map(|(c, k)| (c.to_string(), k.to_string())) {
            category = cat;
            key = k;
        }
    }
    if category == "auth" {
        return Err("Settings category auth is managed by login".into());
    }

    let value = value_to_settings_string(obj.get("value").unwrap_or(&Value::Null));
    Ok(SettingsSetPayload { category, key, value })
}

// ---------------------------------------------------------------------------
// App info
// ---------------------------------------------------------------------------

pub(super) fn app_about() -> Result<Value, String> {
    Ok(diagnostics::get_about_info())
}

pub(super) fn app_health(ctx: &AppContext) -> Result<Value, String> {
    diagnostics::get_system_health(&ctx.db)
}

/// Zip diagnostics into `outputDir` (default `{data_dir}/diagnostics`).
pub(super) fn diagnostics_export(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    authorize(ctx, Some("view_reports"))?;
    let output_dir = crate::value_str(&payload, &["outputDir", "output_dir"])
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| ctx.data_dir.join("diagnostics"));
    let log_dir = diagnostics::get_log_dir(&ctx.data_dir);
    let path = diagnostics::export_diagnostics(&ctx.db, &output_dir, &log_dir)?;
    Ok(serde_json::json!({ "success": true, "path": path }))
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

pub(super) fn settings_get_all(ctx: &AppContext) -> Result<Value, String> {
    require_login(ctx)?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let mut all = db::get_all_settings(&conn);
    if let Value::Object(ref mut map) = all {
        map.remove("auth");
    }
    Ok(all)
}

pub(super) fn settings_set(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let actor = authorize(ctx, Some("manage_staff"))?;
    let parsed = parse_settings_set_payload(payload)?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    db::set_setting(&conn, &parsed.category, &parsed.key, &parsed.value)?;
    info!(
        staff_id = %actor.staff_id,
        category = %parsed.category,
        key = %parsed.key,
        "setting updated"
    );
    Ok(serde_json::json!({ "success": true }))
}

/// Drop every setting in one category (e.g. clear the report header).
pub(super) fn settings_reset(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let actor = authorize(ctx, Some("manage_staff"))?;
    let category = crate::value_str(&super::object_payload(payload, "category"), &["category"])
        .ok_or("Missing required field: category")?;
    if category == "auth" {
        return Err("Settings category auth is managed by login".into());
    }
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    db::delete_all_settings(&conn, &category)?;
    info!(staff_id = %actor.staff_id, category = %category, "settings category reset");
    Ok(serde_json::json!({ "success": true }))
}
