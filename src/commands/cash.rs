use serde_json::Value;

use super::{authorize, guarded, object_payload, scoped_payload, AppContext};
use crate::{cash_register, reports, value_str};

/// Fill `sessionId` with the loja's open caixa when the caller left it out.
fn with_open_session(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let mut payload = payload;
    if value_str(&payload, &["sessionId", "session_id"]).is_some() {
        return Ok(payload);
    }
    let loja_id = value_str(&payload, &["lojaId", "loja_id"]).ok_or("Missing required field: sessionId")?;
    let session_id = {
        let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
        cash_register::require_open_session(&conn, &loja_id)?
    };
    payload["sessionId"] = Value::String(session_id);
    Ok(payload)
}

/// Authorize, scope, resolve the session and run a caixa operation.
fn session_command<F>(ctx: &AppContext, permission: Option<&str>, payload: Value, op: F) -> Result<Value, String>
where
    F: FnOnce(&crate::db::DbState, &Value) -> Result<Value, String>,
{
    let actor = authorize(ctx, permission)?;
    let payload = scoped_payload(ctx, &actor, object_payload(payload, "sessionId"));
    let payload = with_open_session(ctx, payload)?;
    op(&ctx.db, &payload)
}

// ---------------------------------------------------------------------------
// Caixa
// ---------------------------------------------------------------------------

pub(super) fn cash_open(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, Some("manage_cash"), payload, "lojaId", cash_register::open_cash_session)
}

pub(super) fn cash_movement(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    session_command(ctx, Some("manage_cash"), payload, cash_register::add_cash_movement)
}

pub(super) fn cash_active(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, None, payload, "lojaId", cash_register::get_active_session)
}

pub(super) fn cash_summary(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    session_command(ctx, None, payload, cash_register::get_session_summary)
}

pub(super) fn cash_close(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    session_command(ctx, Some("manage_cash"), payload, cash_register::close_cash_session)
}

pub(super) fn cash_list(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, None, payload, "lojaId", cash_register::list_sessions)
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

pub(super) fn reports_cash_closing(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    let data_dir = ctx.data_dir.clone();
    guarded(ctx, Some("view_reports"), payload, "sessionId", |db, payload| {
        reports::generate_cash_closing_report(db, payload, &data_dir)
    })
}

pub(super) fn reports_sales_summary(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, Some("view_reports"), payload, "lojaId", reports::sales_summary)
}
