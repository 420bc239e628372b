use serde::Deserialize;
use serde_json::Value;

use super::{guarded, require_login, AppContext};
use crate::{returns, rma, sales, service_orders};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RmaProgressPayload {
    #[serde(default)]
    status: Option<String>,
    #[serde(default, alias = "rma_id", alias = "id")]
    rma_id: Option<String>,
}

fn parse_rma_progress_payload(arg0: Value) -> Result<RmaProgressPayload, String> {
    let payload = match arg0 {
        Value::String(status) => serde_json::json!({ "status": status }),
        Value::Object(obj) => Value::Object(obj),
        _ => serde_json::json!({}),
    };
    let parsed: RmaProgressPayload =
        serde_json::from_value(payload).map_err(|e| format!("Invalid RMA payload: {e}"))?;
    if parsed.status.is_none() && parsed.rma_id.is_none() {
        return Err("Missing required field: status or rmaId".into());
    }
    Ok(parsed)
}

// ---------------------------------------------------------------------------
// Sales
// ---------------------------------------------------------------------------

pub(super) fn sales_create(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, Some("sell"), payload, "lojaId", sales::create_sale)
}

pub(super) fn sales_get(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, None, payload, "saleId", sales::get_sale)
}

pub(super) fn sales_list(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, None, payload, "status", sales::list_sales)
}

/// Cancelling reverses money, so it sits with returns rather than selling.
pub(super) fn sales_cancel(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, Some("process_returns"), payload, "saleId", sales::cancel_sale)
}

// ---------------------------------------------------------------------------
// Returns
// ---------------------------------------------------------------------------

pub(super) fn returns_preview(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, None, payload, "saleId", returns::preview_return)
}

pub(super) fn returns_create(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, Some("process_returns"), payload, "saleId", returns::create_return)
}

pub(super) fn returns_complete(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, Some("process_returns"), payload, "returnId", returns::complete_return)
}

pub(super) fn returns_cancel(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, Some("process_returns"), payload, "returnId", returns::cancel_return)
}

pub(super) fn returns_get(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, None, payload, "returnId", returns::get_return)
}

pub(super) fn returns_list(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, None, payload, "status", returns::list_returns)
}

// ---------------------------------------------------------------------------
// Service orders
// ---------------------------------------------------------------------------

pub(super) fn service_orders_create(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(
        ctx,
        Some("manage_service_orders"),
        payload,
        "customerId",
        service_orders::create_service_order,
    )
}

pub(super) fn service_orders_update_status(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(
        ctx,
        Some("manage_service_orders"),
        payload,
        "serviceOrderId",
        service_orders::update_status,
    )
}

pub(super) fn service_orders_set_quote(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(
        ctx,
        Some("manage_service_orders"),
        payload,
        "serviceOrderId",
        service_orders::set_quote,
    )
}

pub(super) fn service_orders_add_part(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(
        ctx,
        Some("manage_service_orders"),
        payload,
        "serviceOrderId",
        service_orders::add_part,
    )
}

pub(super) fn service_orders_deliver(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(
        ctx,
        Some("manage_service_orders"),
        payload,
        "serviceOrderId",
        service_orders::deliver,
    )
}

pub(super) fn service_orders_get(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, None, payload, "serviceOrderId", service_orders::get_service_order)
}

pub(super) fn service_orders_list(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, None, payload, "status", service_orders::list_service_orders)
}

// ---------------------------------------------------------------------------
// RMA
// ---------------------------------------------------------------------------

pub(super) fn rma_create(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, Some("manage_rma"), payload, "productId", rma::create_rma)
}

pub(super) fn rma_advance(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, Some("manage_rma"), payload, "rmaId", rma::advance_rma)
}

pub(super) fn rma_get(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, None, payload, "rmaId", rma::get_rma)
}

pub(super) fn rma_list(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    guarded(ctx, None, payload, "status", rma::list_rmas)
}

/// Progress fraction for a status name, or for a stored RMA's current status.
pub(super) fn rma_progress(ctx: &AppContext, payload: Value) -> Result<Value, String> {
    require_login(ctx)?;
    let parsed = parse_rma_progress_payload(payload)?;
    let status = match (parsed.status, parsed.rma_id) {
        (Some(status), _) => status,
        (None, rma_id) => {
            let rma = rma::get_rma(&ctx.db, &serde_json::json!({ "rmaId": rma_id }))?;
            rma.get("status")
                .and_then(Value::as_str)
                .map(String::from)
                .ok_or("RMA has no status")?
        }
    };
    if !rma::STATUSES.contains(&status.as_str()) {
        return Err(format!("Unknown RMA status: {status}"));
    }
    Ok(serde_json::json!({ "status": status, "progress": rma::progress(&status) }))
}

#[cfg(test)]
mod tests {
    use super::super::dispatch;
    use super::super::test_support::*;
    use super::*;
    use serde_json::json;

    async fn store_with_seller(ctx: &AppContext) -> String {
        login_admin(ctx).await;
        dispatch(ctx, "table_insert", json!({ "table": "lojas", "row": { "id": "l1", "name": "Centro" } }))
            .await
            .unwrap();
        let product = dispatch(
            ctx,
            "products_create",
            json!({ "sku": "FONE", "name": "Fone", "salePrice": 50.0, "lojaId": "l1", "initialStock": 10 }),
        )
        .await
        .unwrap();
        add_staff(ctx, "Vera", "vendedor", "5555", Some("l1")).await;
        dispatch(ctx, "auth_login", json!("5555")).await.unwrap();
        product["id"].as_str().unwrap().to_string()
    }

    #[test]
    fn rma_progress_payload_accepts_status_or_id() {
        assert_eq!(parse_rma_progress_payload(json!("enviado")).unwrap().status.as_deref(), Some("enviado"));
        assert_eq!(parse_rma_progress_payload(json!({ "id": "r1" })).unwrap().rma_id.as_deref(), Some("r1"));
        assert!(parse_rma_progress_payload(json!({})).is_err());
    }

    #[tokio::test]
    async fn rma_progress_rejects_unknown_status() {
        let ctx = AppContext::for_test();
        login_admin(&ctx).await;
        let ok = dispatch(&ctx, "rma_progress", json!("aberto")).await.unwrap();
        assert_eq!(ok["progress"], rma::progress("aberto"));
        let err = dispatch(&ctx, "rma_progress", json!("perdido")).await.unwrap_err();
        assert_eq!(err, "Unknown RMA status: perdido");
    }

    #[tokio::test]
    async fn seller_sells_and_returns_in_own_loja() {
        let ctx = AppContext::for_test();
        let product_id = store_with_seller(&ctx).await;

        dispatch(&ctx, "cash_open", json!({ "openingAmount": 100.0 })).await.unwrap();
        let sale = dispatch(
            &ctx,
            "sales_create",
            json!({
                "items": [{ "productId": product_id, "quantity": 2 }],
                "payments": [{ "method": "cash", "amount": 120.0 }],
            }),
        )
        .await
        .unwrap();
        assert_eq!(sale["loja_id"], "l1");
        assert_eq!(sale["total"], 100.0);
        let sale_id = sale["id"].as_str().unwrap().to_string();
        let item_id = sale["items"][0]["id"].as_str().unwrap().to_string();

        let ret = dispatch(
            &ctx,
            "returns_create",
            json!({ "saleId": sale_id, "items": [{ "saleItemId": item_id, "quantity": 1 }], "reason": "defeito" }),
        )
        .await
        .unwrap();
        let return_id = ret["id"].as_str().unwrap().to_string();
        let done = dispatch(&ctx, "returns_complete", json!({ "returnId": return_id, "mode": "refund", "refundMethod": "cash" }))
            .await
            .unwrap();
        assert_eq!(done["status"], "concluida");

        let sale = dispatch(&ctx, "sales_get", json!(sale_id)).await.unwrap();
        assert_eq!(sale["status"], "devolvida_parcial");
    }

    #[tokio::test]
    async fn seller_cannot_open_service_orders() {
        let ctx = AppContext::for_test();
        store_with_seller(&ctx).await;
        let err = dispatch(&ctx, "service_orders_create", json!({ "customerId": "c1", "reportedDefect": "tela" }))
            .await
            .unwrap_err();
        assert_eq!(err, "Permission denied: manage_service_orders");
    }
}
