//! Command bridge: snake_case command names routed to the service layer.
//!
//! Every command except the app info and login/bootstrap ones needs a live
//! staff session. Write commands also check a role permission. The acting
//! staff member is stamped into the payload as `staffId`, and `lojaId`
//! defaults to the staff member's loja (then the configured default loja).

mod auth;
mod cash;
mod catalog;
mod sync;
mod system;
mod workflows;

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use crate::auth::{Actor, AuthState};
use crate::db::{self, DbState};
use crate::sync::SyncState;

/// Settings key holding the loja used when neither the payload nor the
/// staff member names one.
const DEFAULT_LOJA_CATEGORY: &str = "general";
const DEFAULT_LOJA_KEY: &str = "default_loja_id";

pub struct AppContext {
    pub db: Arc<DbState>,
    pub auth: Arc<AuthState>,
    pub sync_state: Arc<SyncState>,
    pub data_dir: PathBuf,
}

impl AppContext {
    pub fn new(db_state: DbState, data_dir: PathBuf) -> Self {
        Self {
            db: Arc::new(db_state),
            auth: Arc::new(AuthState::new()),
            sync_state: Arc::new(SyncState::new()),
            data_dir,
        }
    }

    #[cfg(test)]
    pub fn for_test() -> Self {
        let dir = std::env::temp_dir().join(format!("loja-backoffice-test-{}", uuid::Uuid::new_v4()));
        Self::new(db::test_state(), dir)
    }
}

/// Route one bridge command.
pub async fn dispatch(ctx: &AppContext, command: &str, payload: Value) -> Result<Value, String> {
    match command {
        // App / diagnostics
        "app_about" => system::app_about(),
        "app_health" => system::app_health(ctx),
        "diagnostics_export" => system::diagnostics_export(ctx, payload),
        "settings_get_all" => system::settings_get_all(ctx),
        "settings_set" => system::settings_set(ctx, payload),
        "settings_reset" => system::settings_reset(ctx, payload),

        // Auth / staff
        "auth_login" => auth::auth_login(ctx, payload),
        "auth_logout" => Ok(auth::auth_logout(ctx)),
        "auth_get_session" => Ok(auth::auth_get_session(ctx)),
        "auth_session_stats" => Ok(auth::auth_session_stats(ctx)),
        "staff_create" => auth::staff_create(ctx, payload),
        "staff_list" => auth::staff_list(ctx),
        "staff_set_active" => auth::staff_set_active(ctx, payload),

        // Catalog / stock / customers
        "table_fetch" => catalog::table_fetch(ctx, payload),
        "table_insert" => catalog::table_insert(ctx, payload),
        "table_update" => catalog::table_update(ctx, payload),
        "table_delete" => catalog::table_delete(ctx, payload),
        "products_create" => catalog::products_create(ctx, payload),
        "stock_adjust" => catalog::stock_adjust(ctx, payload),
        "stock_transfer" => catalog::stock_transfer(ctx, payload),
        "stock_get" => catalog::stock_get(ctx, payload),
        "stock_low" => catalog::stock_low(ctx, payload),
        "stock_movements" => catalog::stock_movements(ctx, payload),
        "customers_create" => catalog::customers_create(ctx, payload),
        "customers_credit_balance" => catalog::customers_credit_balance(ctx, payload),
        "customers_credit_entries" => catalog::customers_credit_entries(ctx, payload),

        // Sales / returns
        "sales_create" => workflows::sales_create(ctx, payload),
        "sales_get" => workflows::sales_get(ctx, payload),
        "sales_list" => workflows::sales_list(ctx, payload),
        "sales_cancel" => workflows::sales_cancel(ctx, payload),
        "returns_preview" => workflows::returns_preview(ctx, payload),
        "returns_create" => workflows::returns_create(ctx, payload),
        "returns_complete" => workflows::returns_complete(ctx, payload),
        "returns_cancel" => workflows::returns_cancel(ctx, payload),
        "returns_get" => workflows::returns_get(ctx, payload),
        "returns_list" => workflows::returns_list(ctx, payload),

        // Service orders / RMA
        "service_orders_create" => workflows::service_orders_create(ctx, payload),
        "service_orders_update_status" => workflows::service_orders_update_status(ctx, payload),
        "service_orders_set_quote" => workflows::service_orders_set_quote(ctx, payload),
        "service_orders_add_part" => workflows::service_orders_add_part(ctx, payload),
        "service_orders_deliver" => workflows::service_orders_deliver(ctx, payload),
        "service_orders_get" => workflows::service_orders_get(ctx, payload),
        "service_orders_list" => workflows::service_orders_list(ctx, payload),
        "rma_create" => workflows::rma_create(ctx, payload),
        "rma_advance" => workflows::rma_advance(ctx, payload),
        "rma_get" => workflows::rma_get(ctx, payload),
        "rma_list" => workflows::rma_list(ctx, payload),
        "rma_progress" => workflows::rma_progress(ctx, payload),

        // Caixa / reports
        "cash_open" => cash::cash_open(ctx, payload),
        "cash_movement" => cash::cash_movement(ctx, payload),
        "cash_active" => cash::cash_active(ctx, payload),
        "cash_summary" => cash::cash_summary(ctx, payload),
        "cash_close" => cash::cash_close(ctx, payload),
        "cash_list" => cash::cash_list(ctx, payload),
        "reports_cash_closing" => cash::reports_cash_closing(ctx, payload),
        "reports_sales_summary" => cash::reports_sales_summary(ctx, payload),

        // Sync / hosted store
        "sync_status" => sync::sync_status(ctx),
        "sync_force" => sync::sync_force(ctx).await,
        "sync_retry_failed" => sync::sync_retry_failed(ctx),
        "remote_config_get" => sync::remote_config_get(ctx),
        "remote_config_update" => sync::remote_config_update(ctx, payload),
        "remote_factory_reset" => sync::remote_factory_reset(ctx),
        "remote_fetch" => sync::remote_fetch(ctx, payload).await,

        _ => Err(format!("Unknown command: {command}")),
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// The logged-in actor, or an error when nobody is.
fn require_login(ctx: &AppContext) -> Result<Actor, String> {
    crate::auth::current_actor(&ctx.auth).ok_or_else(|| "Not authenticated".to_string())
}

/// `permission` when given, else any logged-in actor.
fn authorize(ctx: &AppContext, permission: Option<&str>) -> Result<Actor, String> {
    match permission {
        Some(p) => crate::auth::require_permission(&ctx.auth, p),
        None => require_login(ctx),
    }
}

/// Accept a bare string as `{ key: string }`; null becomes `{}`.
fn object_payload(payload: Value, key: &str) -> Value {
    match payload {
        Value::String(s) => serde_json::json!({ key: s }),
        Value::Null => serde_json::json!({}),
        other => other,
    }
}

/// Stamp the acting staff member and fill in the default loja.
fn scoped_payload(ctx: &AppContext, actor: &Actor, payload: Value) -> Value {
    let mut payload = match payload {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    payload.remove("staff_id");
    payload.insert("staffId".into(), Value::String(actor.staff_id.clone()));

    let has_loja = ["lojaId", "loja_id"]
        .iter()
        .any(|k| payload.get(*k).is_some_and(|v| !v.is_null()));
    if !has_loja {
        if let Some(loja_id) = default_loja(ctx, actor) {
            payload.insert("lojaId".into(), Value::String(loja_id));
        }
    }
    Value::Object(payload)
}

fn default_loja(ctx: &AppContext, actor: &Actor) -> Option<String> {
    if let Some(loja_id) = actor.loja_id.clone() {
        return Some(loja_id);
    }
    let conn = ctx.db.conn.lock().ok()?;
    db::get_setting(&conn, DEFAULT_LOJA_CATEGORY, DEFAULT_LOJA_KEY).filter(|s| !s.trim().is_empty())
}

/// Authorize, scope the payload and run a service operation.
fn guarded<F>(
    ctx: &AppContext,
    permission: Option<&str>,
    payload: Value,
    id_key: &str,
    op: F,
) -> Result<Value, String>
where
    F: FnOnce(&DbState, &Value) -> Result<Value, String>,
{
    let actor = authorize(ctx, permission)?;
    let payload = scoped_payload(ctx, &actor, object_payload(payload, id_key));
    op(&ctx.db, &payload)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Create the bootstrap admin (PIN 1234, no loja) and log in.
    pub async fn login_admin(ctx: &AppContext) {
        dispatch(ctx, "staff_create", serde_json::json!({ "name": "Admin", "role": "admin", "pin": "1234" }))
            .await
            .unwrap();
        dispatch(ctx, "auth_login", Value::String("1234".into())).await.unwrap();
    }

    /// Create a staff member as the current admin.
    pub async fn add_staff(ctx: &AppContext, name: &str, role: &str, pin: &str, loja_id: Option<&str>) {
        dispatch(
            ctx,
            "staff_create",
            serde_json::json!({ "name": name, "role": role, "pin": pin, "lojaId": loja_id }),
        )
        .await
        .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn unknown_command_is_rejected() {
        let ctx = AppContext::for_test();
        let err = dispatch(&ctx, "sales_explode", json!({})).await.unwrap_err();
        assert_eq!(err, "Unknown command: sales_explode");
    }

    #[tokio::test]
    async fn reads_need_a_session() {
        let ctx = AppContext::for_test();
        let err = dispatch(&ctx, "sales_list", json!({})).await.unwrap_err();
        assert_eq!(err, "Not authenticated");
        assert!(dispatch(&ctx, "app_about", Value::Null).await.is_ok());
    }

    #[tokio::test]
    async fn scoped_payload_stamps_actor_and_default_loja() {
        let ctx = AppContext::for_test();
        let actor = Actor {
            staff_id: "s1".into(),
            role: "vendedor".into(),
            loja_id: Some("l1".into()),
        };
        let scoped = scoped_payload(&ctx, &actor, json!({ "staff_id": "spoofed" }));
        assert_eq!(scoped["staffId"], "s1");
        assert!(scoped.get("staff_id").is_none());
        assert_eq!(scoped["lojaId"], "l1");

        let explicit = scoped_payload(&ctx, &actor, json!({ "loja_id": "l2" }));
        assert_eq!(explicit["loja_id"], "l2");
        assert!(explicit.get("lojaId").is_none());
    }

    #[tokio::test]
    async fn default_loja_falls_back_to_settings() {
        let ctx = AppContext::for_test();
        {
            let conn = ctx.db.conn.lock().unwrap();
            db::set_setting(&conn, DEFAULT_LOJA_CATEGORY, DEFAULT_LOJA_KEY, "l9").unwrap();
        }
        let actor = Actor {
            staff_id: "s1".into(),
            role: "admin".into(),
            loja_id: None,
        };
        assert_eq!(scoped_payload(&ctx, &actor, Value::Null)["lojaId"], "l9");
    }

    #[test]
    fn object_payload_wraps_bare_ids() {
        assert_eq!(object_payload(json!("abc"), "saleId"), json!({ "saleId": "abc" }));
        assert_eq!(object_payload(Value::Null, "saleId"), json!({}));
        assert_eq!(object_payload(json!({ "id": 1 }), "saleId"), json!({ "id": 1 }));
    }

    #[tokio::test]
    async fn vendedor_cannot_touch_catalog() {
        let ctx = AppContext::for_test();
        login_admin(&ctx).await;
        add_staff(&ctx, "Vera", "vendedor", "5555", None).await;
        dispatch(&ctx, "auth_logout", Value::Null).await.unwrap();
        dispatch(&ctx, "auth_login", json!({ "pin": "5555" })).await.unwrap();

        let err = dispatch(&ctx, "products_create", json!({ "sku": "X", "name": "X" }))
            .await
            .unwrap_err();
        assert_eq!(err, "Permission denied: manage_catalog");
        assert!(dispatch(&ctx, "sales_list", json!({})).await.is_ok());
    }
}
