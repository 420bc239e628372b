use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::{authorize, AppContext};
use crate::auth as auth_service;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginPayload {
    pin: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StaffActivePayload {
    #[serde(alias = "staff_member_id", alias = "id")]
    staff_member_id: String,
    active: bool,
}

fn parse_login_payload(arg0: Value) -> Result<LoginPayload, String> {
    let payload = match arg0 {
        Value::String(pin) => serde_json::json!({ "pin": pin }),
        Value::Number(n) => serde_json::json!({ "pin": n.to_string() }),
        Value::Object(obj) => Value::Object(obj),
        _ => serde_json::json!({}),
    };
    let mut parsed: LoginPayload =
        serde_json::from_value(payload).map_err(|_| "PIN is required".to_string())?;
    parsed.pin = parsed.pin.trim().to_string();
    if parsed.pin.is_empty() {
        return Err("PIN is required".into());
    }
    if parsed.pin.len() < 4 || !parsed.pin.chars().all(|c| c.is_ascii_digit()) {
        return Err("PIN must be at least 4 digits".into());
    }
    Ok(parsed)
}

fn parse_staff_active_payload(arg0: Value) -> Result<StaffActivePayload, String> {
    let mut parsed: StaffActivePayload =
        serde_json::from_value(arg0).map_err(|e| format!("Invalid staff payload: {e}"))?;
    parsed.staff_member_id = parsed.staff_member_id.trim().to_string();
    if parsed.staff_member_id.is_empty() {
        return Err("Missing staff member id".into());
    }
    Ok(parsed)
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub(super) fn auth_login(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let parsed = parse_login_payload(payload)?;
    auth_service::login(&ctx.db, &ctx.auth, &serde_json::json!({ "pin": parsed.pin }))
}

pub(super) fn auth_logout(ctx: &AppContext) -> Value {
    auth_service::logout(&ctx.auth)
}

pub(super) fn auth_get_session(ctx: &AppContext) -> Value {
    auth_service::get_session_json(&ctx.auth)
}

pub(super) fn auth_session_stats(ctx: &AppContext) -> Value {
    auth_service::get_session_stats(&ctx.auth)
}

// ---------------------------------------------------------------------------
// Staff
// ---------------------------------------------------------------------------

/// Create a staff member. With no staff yet this is the open bootstrap path.
pub(super) fn staff_create(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    if auth_service::staff_count(&ctx.db)? == 0 {
        info!("bootstrapping first staff member");
    } else {
        authorize(ctx, Some("manage_staff"))?;
    }
    auth_service::create_staff(&ctx.db, &payload)
}

pub(super) fn staff_list(ctx: &AppContext) -> Result<Value, String> {
    authorize(ctx, Some("manage_staff"))?;
    auth_service::list_staff(&ctx.db)
}

pub(super) fn staff_set_active(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let actor = authorize(ctx, Some("manage_staff"))?;
    let parsed = parse_staff_active_payload(payload)?;
    if !parsed.active && parsed.staff_member_id == actor.staff_id {
        return Err("Cannot deactivate your own account".into());
    }
    auth_service::set_staff_active(
        &ctx.db,
        &serde_json::json!({ "id": parsed.staff_member_id, "active": parsed.active }),
    )
}
