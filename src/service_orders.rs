//! Ordens de serviço: repair jobs for customer devices.
//!
//! Status pipeline:
//! `aberta → em_diagnostico → aguardando_aprovacao → aprovada → em_reparo →
//! pronta → entregue`, with `cancelada` reachable from every non-terminal
//! status and `pronta → em_reparo` for rework. `entregue` is only reached
//! through [`deliver`], which settles payment.

use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::info;

use crate::data_helpers::{
    load_status_history, next_number, query_all_json, query_one_json, record_status_change,
    require_row,
};
use crate::db::{self, DbState};
use crate::inventory::{apply_stock_movement, product_price_cents, StockChange};
use crate::money::{from_cents, line_cents, sum_cents, to_cents, MAX_QUANTITY};
use crate::payments::{list_payments, parse_payments, record_payments, resolve_session, settle, PaymentTarget};
use crate::sync::enqueue_row;
use crate::{now_iso, value_f64, value_i64, value_str};

pub const STATUSES: &[&str] = &[
    "aberta",
    "em_diagnostico",
    "aguardando_aprovacao",
    "aprovada",
    "em_reparo",
    "pronta",
    "entregue",
    "cancelada",
];

const QUOTE_STATUSES: &[&str] = &["aberta", "em_diagnostico", "aguardando_aprovacao"];
const PARTS_STATUSES: &[&str] = &["em_diagnostico", "aprovada", "em_reparo"];

/// Statuses reachable from `from` through a plain status update.
pub fn allowed_next(from: &str) -> &'static [&'static str] {
    match from {
        "aberta" => &["em_diagnostico", "cancelada"],
        "em_diagnostico" => &["aguardando_aprovacao", "cancelada"],
        "aguardando_aprovacao" => &["aprovada", "cancelada"],
        "aprovada" => &["em_reparo", "cancelada"],
        "em_reparo" => &["pronta", "cancelada"],
        "pronta" => &["em_reparo", "cancelada"],
        _ => &[],
    }
}

struct OrderRow {
    loja_id: String,
    customer_id: String,
    status: String,
    labor_cents: i64,
    parts_cents: i64,
}

fn load_order(conn: &Connection, id: &str) -> Result<OrderRow, String> {
    conn.query_row(
        "SELECT loja_id, customer_id, status, labor_amount, parts_amount
         FROM service_orders WHERE id = ?1",
        params![id],
        |row| {
            Ok(OrderRow {
                loja_id: row.get(0)?,
                customer_id: row.get(1)?,
                status: row.get(2)?,
                labor_cents: to_cents(row.get(3)?),
                parts_cents: to_cents(row.get(4)?),
            })
        },
    )
    .map_err(|_| format!("Service order not found: {id}"))
}

fn write_amounts(conn: &Connection, id: &str, labor_cents: i64, parts_cents: i64) -> Result<(), String> {
    let total_cents = sum_cents([labor_cents, parts_cents])?;
    conn.execute(
        "UPDATE service_orders SET labor_amount = ?1, parts_amount = ?2, total_amount = ?3,
                                   updated_at = ?4
         WHERE id = ?5",
        params![
            from_cents(labor_cents),
            from_cents(parts_cents),
            from_cents(total_cents),
            now_iso(),
            id
        ],
    )
    .map_err(|e| format!("update service order amounts: {e}"))?;
    Ok(())
}

fn order_id(payload: &Value) -> Result<String, String> {
    value_str(payload, &["serviceOrderId", "service_order_id", "id"])
        .ok_or_else(|| "Missing required field: serviceOrderId".to_string())
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

pub fn create_service_order(db: &DbState, payload: &Value) -> Result<Value, String> {
    let loja_id = value_str(payload, &["lojaId", "loja_id"]).ok_or("Missing required field: lojaId")?;
    let customer_id =
        value_str(payload, &["customerId", "customer_id"]).ok_or("Missing required field: customerId")?;
    let reported_defect = value_str(payload, &["reportedDefect", "reported_defect", "defect"])
        .ok_or("Missing required field: reportedDefect")?;
    let device_brand = value_str(payload, &["deviceBrand", "device_brand"]);
    let device_model = value_str(payload, &["deviceModel", "device_model"]);
    let serial_imei = value_str(payload, &["serialImei", "serial_imei", "imei"]);
    let staff_id = value_str(payload, &["staffId", "staff_id"]);

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let id = uuid::Uuid::new_v4().to_string();
    let order = db::in_transaction(&conn, |conn| {
        require_row(conn, "lojas", &loja_id)?;
        require_row(conn, "customers", &customer_id)?;
        let number = next_number(conn, "service_orders", &loja_id)?;
        let now = now_iso();
        conn.execute(
            "INSERT INTO service_orders (id, number, loja_id, customer_id, device_brand, device_model,
                                         serial_imei, reported_defect, status, staff_id,
                                         created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'aberta', ?9, ?10, ?10)",
            params![
                id,
                number,
                loja_id,
                customer_id,
                device_brand,
                device_model,
                serial_imei,
                reported_defect,
                staff_id,
                now
            ],
        )
        .map_err(|e| format!("insert service order: {e}"))?;
        record_status_change(conn, "service_order", &id, None, "aberta", None, staff_id.as_deref())?;
        enqueue_row(conn, "service_orders", &id, "insert")?;
        order_detail(conn, &id)
    })?;

    info!(service_order_id = %id, number = %order["number"], "service order opened");
    Ok(order)
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

fn restock_parts(conn: &Connection, id: &str, loja_id: &str, staff_id: Option<&str>) -> Result<(), String> {
    let parts: Vec<(String, i64)> = {
        let mut stmt = conn
            .prepare("SELECT product_id, quantity FROM service_order_parts WHERE service_order_id = ?1")
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| e.to_string())?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("read service order parts: {e}"))?
    };
    for (product_id, quantity) in &parts {
        apply_stock_movement(
            conn,
            &StockChange {
                loja_id,
                product_id,
                delta: *quantity,
                reason: "service_order_cancel",
                reference_type: Some("service_order"),
                reference_id: Some(id),
                note: None,
                staff_id,
            },
        )?;
    }
    Ok(())
}

pub fn update_status(db: &DbState, payload: &Value) -> Result<Value, String> {
    let id = order_id(payload)?;
    let status = value_str(payload, &["status"]).ok_or("Missing required field: status")?;
    let note = value_str(payload, &["note"]);
    let staff_id = value_str(payload, &["staffId", "staff_id"]);

    if !STATUSES.contains(&status.as_str()) {
        return Err(format!("Invalid service order status: {status}"));
    }
    if status == "entregue" {
        return Err("Use deliver to hand over a service order".into());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let order = db::in_transaction(&conn, |conn| {
        let current = load_order(conn, &id)?;
        if !allowed_next(&current.status).contains(&status.as_str()) {
            return Err(format!(
                "Invalid service order transition: {} -> {status}",
                current.status
            ));
        }
        if status == "cancelada" {
            restock_parts(conn, &id, &current.loja_id, staff_id.as_deref())?;
        }
        conn.execute(
            "UPDATE service_orders SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status, now_iso(), id],
        )
        .map_err(|e| format!("update service order status: {e}"))?;
        record_status_change(
            conn,
            "service_order",
            &id,
            Some(&current.status),
            &status,
            note.as_deref(),
            staff_id.as_deref(),
        )?;
        enqueue_row(conn, "service_orders", &id, "update")?;
        order_detail(conn, &id)
    })?;

    info!(service_order_id = %id, status = %status, "service order status changed");
    Ok(order)
}

// ---------------------------------------------------------------------------
// Quote / parts
// ---------------------------------------------------------------------------

pub fn set_quote(db: &DbState, payload: &Value) -> Result<Value, String> {
    let id = order_id(payload)?;
    let labor = value_f64(payload, &["laborAmount", "labor_amount"])
        .ok_or("Missing required field: laborAmount")?;
    let diagnosis = value_str(payload, &["diagnosis"]);
    if labor < 0.0 {
        return Err("Labor amount cannot be negative".into());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    db::in_transaction(&conn, |conn| {
        let current = load_order(conn, &id)?;
        if !QUOTE_STATUSES.contains(&current.status.as_str()) {
            return Err(format!("Quote cannot change in status {}", current.status));
        }
        write_amounts(conn, &id, to_cents(labor), current.parts_cents)?;
        if diagnosis.is_some() {
            conn.execute(
                "UPDATE service_orders SET diagnosis = ?1 WHERE id = ?2",
                params![diagnosis, id],
            )
            .map_err(|e| format!("update diagnosis: {e}"))?;
        }
        enqueue_row(conn, "service_orders", &id, "update")?;
        order_detail(conn, &id)
    })
}

pub fn add_part(db: &DbState, payload: &Value) -> Result<Value, String> {
    let id = order_id(payload)?;
    let product_id =
        value_str(payload, &["productId", "product_id"]).ok_or("Missing required field: productId")?;
    let quantity = value_i64(payload, &["quantity"]).unwrap_or(1);
    let unit_price = value_f64(payload, &["unitPrice", "unit_price"]);
    let staff_id = value_str(payload, &["staffId", "staff_id"]);

    if quantity < 1 {
        return Err("Part quantity must be at least 1".into());
    }
    if quantity > MAX_QUANTITY {
        return Err(format!("Part quantity cannot exceed {MAX_QUANTITY}"));
    }
    if unit_price.is_some_and(|p| p < 0.0) {
        return Err("unitPrice cannot be negative".into());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let order = db::in_transaction(&conn, |conn| {
        let current = load_order(conn, &id)?;
        if !PARTS_STATUSES.contains(&current.status.as_str()) {
            return Err(format!("Parts cannot be added in status {}", current.status));
        }
        let unit_cents = match unit_price {
            Some(p) => to_cents(p),
            None => product_price_cents(conn, &product_id)?,
        };
        let line_total = line_cents(unit_cents, quantity)?;

        apply_stock_movement(
            conn,
            &StockChange {
                loja_id: &current.loja_id,
                product_id: &product_id,
                delta: -quantity,
                reason: "service_order",
                reference_type: Some("service_order"),
                reference_id: Some(&id),
                note: None,
                staff_id: staff_id.as_deref(),
            },
        )?;

        let part_id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO service_order_parts (id, service_order_id, product_id, quantity, unit_price,
                                              total, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                part_id,
                id,
                product_id,
                quantity,
                from_cents(unit_cents),
                from_cents(line_total),
                now_iso()
            ],
        )
        .map_err(|e| format!("insert service order part: {e}"))?;
        enqueue_row(conn, "service_order_parts", &part_id, "insert")?;

        write_amounts(conn, &id, current.labor_cents, sum_cents([current.parts_cents, line_total])?)?;
        enqueue_row(conn, "service_orders", &id, "update")?;
        order_detail(conn, &id)
    })?;

    info!(service_order_id = %id, product_id = %product_id, quantity, "part added to service order");
    Ok(order)
}

// ---------------------------------------------------------------------------
// Deliver
// ---------------------------------------------------------------------------

/// Hand the device back and settle labor + parts.
pub fn deliver(db: &DbState, payload: &Value) -> Result<Value, String> {
    let id = order_id(payload)?;
    let staff_id = value_str(payload, &["staffId", "staff_id"]);
    let payment_lines = parse_payments(payload)?;

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let order = db::in_transaction(&conn, |conn| {
        let current = load_order(conn, &id)?;
        if current.status != "pronta" {
            return Err(format!(
                "Only pronta service orders can be delivered (status: {})",
                current.status
            ));
        }
        let total = sum_cents([current.labor_cents, current.parts_cents])?;
        let settlement = settle(total, &payment_lines)?;
        let session_id = resolve_session(conn, &current.loja_id, &settlement)?;

        record_payments(
            conn,
            &PaymentTarget {
                reference_type: "service_order",
                reference_id: &id,
                customer_id: Some(&current.customer_id),
                session_id: session_id.as_deref(),
                staff_id: staff_id.as_deref(),
            },
            &settlement,
        )?;

        let now = now_iso();
        conn.execute(
            "UPDATE service_orders SET status = 'entregue', total_amount = ?1, change_amount = ?2,
                                       cash_session_id = ?3, delivered_at = ?4, updated_at = ?4
             WHERE id = ?5",
            params![
                from_cents(total),
                from_cents(settlement.change_cents),
                session_id,
                now,
                id
            ],
        )
        .map_err(|e| format!("deliver service order: {e}"))?;
        record_status_change(conn, "service_order", &id, Some("pronta"), "entregue", None, staff_id.as_deref())?;
        enqueue_row(conn, "service_orders", &id, "update")?;
        order_detail(conn, &id)
    })?;

    info!(service_order_id = %id, total = %order["total_amount"], "service order delivered");
    Ok(order)
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

fn order_detail(conn: &Connection, id: &str) -> Result<Value, String> {
    let mut order = query_one_json(
        conn,
        "SELECT o.*, c.name AS customer_name
         FROM service_orders o JOIN customers c ON c.id = o.customer_id
         WHERE o.id = ?1",
        params![id],
    )?;
    if order.is_null() {
        return Err(format!("Service order not found: {id}"));
    }
    order["parts"] = Value::Array(query_all_json(
        conn,
        "SELECT sp.*, p.sku, p.name AS product_name
         FROM service_order_parts sp JOIN products p ON p.id = sp.product_id
         WHERE sp.service_order_id = ?1 ORDER BY sp.created_at, sp.rowid",
        params![id],
    )?);
    order["payments"] = Value::Array(list_payments(conn, "service_order", id)?);
    order["history"] = Value::Array(load_status_history(conn, "service_order", id)?);
    Ok(order)
}

pub fn get_service_order(db: &DbState, payload: &Value) -> Result<Value, String> {
    let id = order_id(payload)?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    order_detail(&conn, &id)
}

pub fn list_service_orders(db: &DbState, payload: &Value) -> Result<Value, String> {
    let loja_id = value_str(payload, &["lojaId", "loja_id"]);
    let status = value_str(payload, &["status"]);
    let customer_id = value_str(payload, &["customerId", "customer_id"]);
    let limit = value_i64(payload, &["limit"]).unwrap_or(100).clamp(1, 1000);
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let rows = query_all_json(
        &conn,
        "SELECT o.*, c.name AS customer_name
         FROM service_orders o JOIN customers c ON c.id = o.customer_id
         WHERE (?1 IS NULL OR o.loja_id = ?1)
           AND (?2 IS NULL OR o.status = ?2)
           AND (?3 IS NULL OR o.customer_id = ?3)
         ORDER BY o.created_at DESC, o.rowid DESC
         LIMIT ?4",
        params![loja_id, status, customer_id, limit],
    )?;
    Ok(Value::Array(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cash_register::expected_cents;
    use crate::inventory::stock_quantity;
    use crate::inventory::test_support::{seed_loja, seed_product};
    use crate::sales::test_support::{open_caixa, seed_customer};
    use serde_json::json;

    fn setup() -> (DbState, String) {
        let db = db::test_state();
        seed_loja(&db, "l1");
        seed_customer(&db, "c1");
        seed_product(&db, "l1", "tela", 120.0, 2);
        let os = create_service_order(
            &db,
            &json!({
                "lojaId": "l1",
                "customerId": "c1",
                "deviceBrand": "Samsung",
                "deviceModel": "A52",
                "reportedDefect": "tela quebrada"
            }),
        )
        .unwrap();
        (db, os["id"].as_str().unwrap().to_string())
    }

    fn advance(db: &DbState, id: &str, status: &str) -> Result<Value, String> {
        update_status(db, &json!({ "id": id, "status": status }))
    }

    #[test]
    fn numbering_and_transition_table() {
        let (db, id) = setup();
        let second = create_service_order(
            &db,
            &json!({ "lojaId": "l1", "customerId": "c1", "reportedDefect": "bateria" }),
        )
        .unwrap();
        assert_eq!(second["number"], 2);

        let err = advance(&db, &id, "em_reparo").unwrap_err();
        assert_eq!(err, "Invalid service order transition: aberta -> em_reparo");
        let err = advance(&db, &id, "entregue").unwrap_err();
        assert!(err.contains("deliver"));
        advance(&db, &id, "em_diagnostico").unwrap();
        let os = advance(&db, &id, "aguardando_aprovacao").unwrap();
        assert_eq!(os["history"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn full_repair_and_delivery_with_cash() {
        let (db, id) = setup();
        advance(&db, &id, "em_diagnostico").unwrap();
        set_quote(&db, &json!({ "id": id, "laborAmount": 80, "diagnosis": "display" })).unwrap();
        add_part(&db, &json!({ "id": id, "productId": "tela" })).unwrap();
        advance(&db, &id, "aguardando_aprovacao").unwrap();
        advance(&db, &id, "aprovada").unwrap();
        advance(&db, &id, "em_reparo").unwrap();

        let err = set_quote(&db, &json!({ "id": id, "laborAmount": 10 })).unwrap_err();
        assert_eq!(err, "Quote cannot change in status em_reparo");

        let err = deliver(&db, &json!({ "id": id, "payments": [] })).unwrap_err();
        assert!(err.starts_with("Only pronta"));
        advance(&db, &id, "pronta").unwrap();

        let session = open_caixa(&db, "l1");
        let err = deliver(&db, &json!({ "id": id, "payments": [{ "method": "card", "amount": 199 }] }))
            .unwrap_err();
        assert_eq!(err, "Insufficient payment: total 200.00, paid 199.00");

        let os = deliver(
            &db,
            &json!({ "id": id, "payments": [{ "method": "cash", "amount": 250 }] }),
        )
        .unwrap();
        assert_eq!(os["status"], "entregue");
        assert_eq!(os["total_amount"], 200.0);
        assert_eq!(os["change_amount"], 50.0);
        assert_eq!(os["cash_session_id"], session.as_str());
        assert!(os["delivered_at"].is_string());

        let conn = db.conn.lock().unwrap();
        assert_eq!(expected_cents(&conn, &session).unwrap(), 10_000 + 20_000);
        assert_eq!(stock_quantity(&conn, "l1", "tela"), 1);
        drop(conn);

        assert!(advance(&db, &id, "cancelada").is_err());
    }

    #[test]
    fn cancel_returns_parts_to_stock() {
        let (db, id) = setup();
        advance(&db, &id, "em_diagnostico").unwrap();
        add_part(&db, &json!({ "id": id, "productId": "tela", "quantity": 2, "unitPrice": 100 })).unwrap();
        let err = add_part(&db, &json!({ "id": id, "productId": "tela" })).unwrap_err();
        assert!(err.starts_with("Insufficient stock for tela"));

        let os = advance(&db, &id, "cancelada").unwrap();
        assert_eq!(os["status"], "cancelada");
        assert_eq!(os["parts_amount"], 200.0);
        let conn = db.conn.lock().unwrap();
        assert_eq!(stock_quantity(&conn, "l1", "tela"), 2);
        drop(conn);

        let listed = list_service_orders(&db, &json!({ "status": "cancelada" })).unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[test]
    fn unreadable_part_row_aborts_cancel() {
        let (db, id) = setup();
        advance(&db, &id, "em_diagnostico").unwrap();
        add_part(&db, &json!({ "id": id, "productId": "tela", "quantity": 2, "unitPrice": 100 })).unwrap();
        {
            let conn = db.conn.lock().unwrap();
            conn.execute("UPDATE service_order_parts SET quantity = 'duas'", []).unwrap();
        }

        let err = advance(&db, &id, "cancelada").unwrap_err();
        assert!(err.starts_with("read service order parts"));
        let conn = db.conn.lock().unwrap();
        assert_eq!(stock_quantity(&conn, "l1", "tela"), 0);
        let status: String = conn
            .query_row("SELECT status FROM service_orders WHERE id = ?1", params![id], |r| r.get(0))
            .unwrap();
        assert_eq!(status, "em_diagnostico");
    }

    #[test]
    fn parts_only_in_working_statuses() {
        let (db, id) = setup();
        let err = add_part(&db, &json!({ "id": id, "productId": "tela" })).unwrap_err();
        assert_eq!(err, "Parts cannot be added in status aberta");
    }

    #[test]
    fn oversized_parts_are_rejected() {
        let (db, id) = setup();
        advance(&db, &id, "em_diagnostico").unwrap();
        let err = add_part(&db, &json!({ "id": id, "productId": "tela", "quantity": 9_000_000_000_000_000i64 }))
            .unwrap_err();
        assert_eq!(err, "Part quantity cannot exceed 1000000");
        let err = add_part(&db, &json!({ "id": id, "productId": "tela", "quantity": 2, "unitPrice": 1e17 }))
            .unwrap_err();
        assert_eq!(err, "amount out of range");

        let os = add_part(&db, &json!({ "id": id, "productId": "tela", "quantity": 1, "unitPrice": 100 })).unwrap();
        assert_eq!(os["parts_amount"], 100.0);
    }
}
