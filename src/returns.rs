//! Customer returns (devoluções) and their refund / store-credit settlement.
//!
//! A return is created `pendente`, claiming units from sale lines, and later
//! completed either as a refund (`concluida`) or as store credit
//! (`concluida_com_credito`).
//!
//! **Rules:**
//! - A line can never be claimed beyond what was sold; pending returns count
//!   as claimed, so two open returns cannot take the same unit
//! - Refunds are prorated on the line net (after discount) with cumulative
//!   rounding: once every unit is back, the line has refunded exactly its net
//! - Completion is idempotent per mode; a second completion in another mode
//!   is rejected
//! - Cash refunds leave through the loja's open caixa

use std::collections::HashSet;

use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::{info, warn};

use crate::cash_register::{record_movement, require_open_session};
use crate::customers::issue_credit;
use crate::data_helpers::{load_status_history, query_all_json, query_one_json, record_status_change};
use crate::db::{self, DbState};
use crate::inventory::{apply_stock_movement, StockChange};
use crate::money::{from_cents, prorated_refund, to_cents};
use crate::sync::enqueue_row;
use crate::{now_iso, value_bool, value_i64, value_str};

const REFUND_METHODS: &[&str] = &["cash", "card", "pix"];

struct LineRequest {
    sale_item_id: String,
    quantity: i64,
    restock: bool,
}

/// One allocated return line.
struct ReturnLine {
    sale_item_id: String,
    product_id: String,
    quantity: i64,
    available: i64,
    restock: bool,
    refund_cents: i64,
}

struct SaleRef {
    loja_id: String,
    customer_id: Option<String>,
}

fn parse_lines(payload: &Value) -> Result<Vec<LineRequest>, String> {
    let arr = payload
        .get("items")
        .and_then(|v| v.as_array())
        .ok_or("Missing required field: items")?;
    if arr.is_empty() {
        return Err("A return needs at least one item".into());
    }
    let mut seen = HashSet::new();
    let mut lines = Vec::with_capacity(arr.len());
    for (idx, item) in arr.iter().enumerate() {
        let sale_item_id = value_str(item, &["saleItemId", "sale_item_id"])
            .ok_or_else(|| format!("items[{idx}]: missing saleItemId"))?;
        let quantity = value_i64(item, &["quantity"])
            .ok_or_else(|| format!("items[{idx}]: quantity must be an integer"))?;
        if quantity < 1 {
            return Err(format!("items[{idx}]: quantity must be at least 1"));
        }
        if !seen.insert(sale_item_id.clone()) {
            return Err(format!("Sale item listed twice: {sale_item_id}"));
        }
        lines.push(LineRequest {
            sale_item_id,
            quantity,
            restock: value_bool(item, &["restock"]).unwrap_or(true),
        });
    }
    Ok(lines)
}

/// Check the sale is returnable and compute each line's refund.
fn allocate(conn: &Connection, sale_id: &str, requests: &[LineRequest]) -> Result<(SaleRef, Vec<ReturnLine>), String> {
    let (loja_id, customer_id, status): (String, Option<String>, String) = conn
        .query_row(
            "SELECT loja_id, customer_id, status FROM sales WHERE id = ?1",
            params![sale_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map_err(|_| format!("Sale not found: {sale_id}"))?;
    if status != "concluida" && status != "devolvida_parcial" {
        return Err(format!("Sale cannot take returns (status: {status})"));
    }

    let mut lines = Vec::with_capacity(requests.len());
    for req in requests {
        let (product_id, sold, net): (String, i64, f64) = conn
            .query_row(
                "SELECT product_id, quantity, net_amount FROM sale_items WHERE id = ?1 AND sale_id = ?2",
                params![req.sale_item_id, sale_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(|_| format!("Sale item {} does not belong to sale {sale_id}", req.sale_item_id))?;

        let (claimed, claimed_refund): (i64, f64) = conn
            .query_row(
                "SELECT COALESCE(SUM(ri.quantity), 0), COALESCE(SUM(ri.refund_amount), 0)
                 FROM return_items ri
                 JOIN returns r ON r.id = ri.return_id
                 WHERE ri.sale_item_id = ?1 AND r.status != 'cancelada'",
                params![req.sale_item_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| format!("read claimed quantity: {e}"))?;

        let available = sold - claimed;
        if req.quantity > available {
            return Err(format!(
                "Return quantity exceeds available for item {}: available {available}, requested {}",
                req.sale_item_id, req.quantity
            ));
        }

        lines.push(ReturnLine {
            sale_item_id: req.sale_item_id.clone(),
            product_id,
            quantity: req.quantity,
            available,
            restock: req.restock,
            refund_cents: prorated_refund(
                to_cents(net),
                sold,
                claimed,
                req.quantity,
                to_cents(claimed_refund),
            ),
        });
    }
    Ok((SaleRef { loja_id, customer_id }, lines))
}

fn lines_json(lines: &[ReturnLine]) -> Value {
    Value::Array(
        lines
            .iter()
            .map(|l| {
                serde_json::json!({
                    "saleItemId": l.sale_item_id,
                    "productId": l.product_id,
                    "quantity": l.quantity,
                    "availableQuantity": l.available,
                    "restock": l.restock,
                    "refundAmount": from_cents(l.refund_cents),
                })
            })
            .collect(),
    )
}

// ---------------------------------------------------------------------------
// Preview / create
// ---------------------------------------------------------------------------

pub fn preview_return(db: &DbState, payload: &Value) -> Result<Value, String> {
    let sale_id = value_str(payload, &["saleId", "sale_id"]).ok_or("Missing required field: saleId")?;
    let requests = parse_lines(payload)?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let (_, lines) = allocate(&conn, &sale_id, &requests)?;
    let total: i64 = lines.iter().map(|l| l.refund_cents).sum();
    Ok(serde_json::json!({
        "saleId": sale_id,
        "items": lines_json(&lines),
        "refundTotal": from_cents(total),
    }))
}

pub fn create_return(db: &DbState, payload: &Value) -> Result<Value, String> {
    let sale_id = value_str(payload, &["saleId", "sale_id"]).ok_or("Missing required field: saleId")?;
    let reason = value_str(payload, &["reason"]);
    let staff_id = value_str(payload, &["staffId", "staff_id"]);
    let requests = parse_lines(payload)?;

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let return_id = uuid::Uuid::new_v4().to_string();
    let detail = db::in_transaction(&conn, |conn| {
        let (sale, lines) = allocate(conn, &sale_id, &requests)?;
        let total: i64 = lines.iter().map(|l| l.refund_cents).sum();
        let now = now_iso();

        conn.execute(
            "INSERT INTO returns (id, sale_id, loja_id, customer_id, status, reason, refund_total,
                                  staff_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pendente', ?5, ?6, ?7, ?8, ?8)",
            params![
                return_id,
                sale_id,
                sale.loja_id,
                sale.customer_id,
                reason,
                from_cents(total),
                staff_id,
                now
            ],
        )
        .map_err(|e| format!("insert return: {e}"))?;
        enqueue_row(conn, "returns", &return_id, "insert")?;

        for line in &lines {
            let item_id = uuid::Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO return_items (id, return_id, sale_item_id, product_id, quantity, restock,
                                           refund_amount, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    item_id,
                    return_id,
                    line.sale_item_id,
                    line.product_id,
                    line.quantity,
                    line.restock,
                    from_cents(line.refund_cents),
                    now
                ],
            )
            .map_err(|e| format!("insert return item: {e}"))?;
            enqueue_row(conn, "return_items", &item_id, "insert")?;
        }

        record_status_change(conn, "return", &return_id, None, "pendente", reason.as_deref(), staff_id.as_deref())?;
        return_detail(conn, &return_id)
    })?;

    info!(return_id = %return_id, sale_id = %sale_id, refund_total = %detail["refund_total"], "return created");
    Ok(detail)
}

// ---------------------------------------------------------------------------
// Complete
// ---------------------------------------------------------------------------

struct ReturnRow {
    sale_id: String,
    loja_id: String,
    customer_id: Option<String>,
    status: String,
    completion_mode: Option<String>,
    refund_total: f64,
}

fn load_return(conn: &Connection, return_id: &str) -> Result<ReturnRow, String> {
    conn.query_row(
        "SELECT sale_id, loja_id, customer_id, status, completion_mode, refund_total
         FROM returns WHERE id = ?1",
        params![return_id],
        |row| {
            Ok(ReturnRow {
                sale_id: row.get(0)?,
                loja_id: row.get(1)?,
                customer_id: row.get(2)?,
                status: row.get(3)?,
                completion_mode: row.get(4)?,
                refund_total: row.get(5)?,
            })
        },
    )
    .map_err(|_| format!("Return not found: {return_id}"))
}

/// Move the sale to `devolvida` once every sold unit is back in a completed
/// return, `devolvida_parcial` otherwise.
fn refresh_sale_status(conn: &Connection, sale_id: &str, staff_id: Option<&str>) -> Result<String, String> {
    let (sold, returned): (i64, i64) = conn
        .query_row(
            "SELECT COALESCE(SUM(si.quantity), 0),
                    COALESCE(SUM((SELECT COALESCE(SUM(ri.quantity), 0)
                                  FROM return_items ri JOIN returns r ON r.id = ri.return_id
                                  WHERE ri.sale_item_id = si.id
                                    AND r.status IN ('concluida', 'concluida_com_credito'))), 0)
             FROM sale_items si WHERE si.sale_id = ?1",
            params![sale_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|e| format!("read returned quantity: {e}"))?;

    let next = if returned >= sold { "devolvida" } else { "devolvida_parcial" };
    let current: String = conn
        .query_row("SELECT status FROM sales WHERE id = ?1", params![sale_id], |row| row.get(0))
        .map_err(|_| format!("Sale not found: {sale_id}"))?;
    if current != next {
        conn.execute(
            "UPDATE sales SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![next, now_iso(), sale_id],
        )
        .map_err(|e| format!("update sale status: {e}"))?;
        record_status_change(conn, "sale", sale_id, Some(&current), next, None, staff_id)?;
        enqueue_row(conn, "sales", sale_id, "update")?;
    }
    Ok(next.to_string())
}

/// Settle a pending return as a refund or as store credit.
pub fn complete_return(db: &DbState, payload: &Value) -> Result<Value, String> {
    let return_id =
        value_str(payload, &["returnId", "return_id", "id"]).ok_or("Missing required field: returnId")?;
    let mode = value_str(payload, &["mode"]).ok_or("Missing required field: mode")?;
    let refund_method = value_str(payload, &["refundMethod", "refund_method"]);
    let staff_id = value_str(payload, &["staffId", "staff_id"]);

    if mode != "refund" && mode != "credit" {
        return Err(format!("Invalid completion mode: {mode}. Must be refund or credit"));
    }
    let method = match (mode.as_str(), refund_method) {
        ("refund", m) => {
            let m = m.unwrap_or_else(|| "cash".into());
            if !REFUND_METHODS.contains(&m.as_str()) {
                return Err(format!("Invalid refund method: {m}. Must be cash, card or pix"));
            }
            Some(m)
        }
        _ => None,
    };

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let (mut detail, already) = db::in_transaction(&conn, |conn| {
        let ret = load_return(conn, &return_id)?;
        match ret.status.as_str() {
            "cancelada" => return Err("Return is cancelled".into()),
            "concluida" | "concluida_com_credito" => {
                let done_mode = ret.completion_mode.as_deref().unwrap_or("");
                if done_mode == mode {
                    return Ok((return_detail(conn, &return_id)?, true));
                }
                return Err(format!("Return already completed as {done_mode}"));
            }
            _ => {}
        }

        let refund_cents = to_cents(ret.refund_total);
        let mut credit_entry_id = None;
        let next_status = if mode == "refund" {
            if method.as_deref() == Some("cash") && refund_cents > 0 {
                let session_id = require_open_session(conn, &ret.loja_id)?;
                record_movement(
                    conn,
                    &session_id,
                    "refund",
                    refund_cents,
                    Some("return"),
                    Some(&return_id),
                    None,
                    staff_id.as_deref(),
                )?;
            }
            "concluida"
        } else {
            let customer_id = ret
                .customer_id
                .as_deref()
                .ok_or("Store credit requires a customer on the sale")?;
            if refund_cents > 0 {
                credit_entry_id = Some(issue_credit(conn, customer_id, refund_cents, "return", &return_id)?);
            }
            "concluida_com_credito"
        };

        let restock: Vec<(String, i64)> = {
            let mut stmt = conn
                .prepare("SELECT product_id, quantity FROM return_items WHERE return_id = ?1 AND restock = 1")
                .map_err(|e| e.to_string())?;
            let rows = stmt
                .query_map(params![return_id], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(|e| e.to_string())?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| format!("read return items: {e}"))?
        };
        for (product_id, quantity) in &restock {
            apply_stock_movement(
                conn,
                &StockChange {
                    loja_id: &ret.loja_id,
                    product_id,
                    delta: *quantity,
                    reason: "return",
                    reference_type: Some("return"),
                    reference_id: Some(&return_id),
                    note: None,
                    staff_id: staff_id.as_deref(),
                },
            )?;
        }

        let now = now_iso();
        conn.execute(
            "UPDATE returns SET status = ?1, completion_mode = ?2, refund_method = ?3,
                                credit_entry_id = ?4, completed_by = ?5, completed_at = ?6,
                                updated_at = ?6
             WHERE id = ?7",
            params![next_status, mode, method, credit_entry_id, staff_id, now, return_id],
        )
        .map_err(|e| format!("complete return: {e}"))?;
        record_status_change(conn, "return", &return_id, Some("pendente"), next_status, None, staff_id.as_deref())?;
        enqueue_row(conn, "returns", &return_id, "update")?;

        let sale_status = refresh_sale_status(conn, &ret.sale_id, staff_id.as_deref())?;
        info!(
            return_id = %return_id,
            mode = %mode,
            refund_total = ret.refund_total,
            sale_status = %sale_status,
            "return completed"
        );
        Ok((return_detail(conn, &return_id)?, false))
    })?;

    if already {
        warn!(return_id = %return_id, "return already completed, nothing changed");
    }
    detail["alreadyCompleted"] = Value::Bool(already);
    Ok(detail)
}

// ---------------------------------------------------------------------------
// Cancel / read
// ---------------------------------------------------------------------------

pub fn cancel_return(db: &DbState, payload: &Value) -> Result<Value, String> {
    let return_id =
        value_str(payload, &["returnId", "return_id", "id"]).ok_or("Missing required field: returnId")?;
    let reason = value_str(payload, &["reason"]);
    let staff_id = value_str(payload, &["staffId", "staff_id"]);

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let detail = db::in_transaction(&conn, |conn| {
        let ret = load_return(conn, &return_id)?;
        if ret.status != "pendente" {
            return Err(format!("Only pendente returns can be cancelled (status: {})", ret.status));
        }
        let now = now_iso();
        conn.execute(
            "UPDATE returns SET status = 'cancelada', cancel_reason = ?1, updated_at = ?2 WHERE id = ?3",
            params![reason, now, return_id],
        )
        .map_err(|e| format!("cancel return: {e}"))?;
        record_status_change(
            conn,
            "return",
            &return_id,
            Some("pendente"),
            "cancelada",
            reason.as_deref(),
            staff_id.as_deref(),
        )?;
        enqueue_row(conn, "returns", &return_id, "update")?;
        return_detail(conn, &return_id)
    })?;

    info!(return_id = %return_id, "return cancelled");
    Ok(detail)
}

pub(crate) fn return_detail(conn: &Connection, return_id: &str) -> Result<Value, String> {
    let mut ret = query_one_json(conn, "SELECT * FROM returns WHERE id = ?1", params![return_id])?;
    if ret.is_null() {
        return Err(format!("Return not found: {return_id}"));
    }
    ret["items"] = Value::Array(query_all_json(
        conn,
        "SELECT ri.*, p.sku, p.name AS product_name
         FROM return_items ri JOIN products p ON p.id = ri.product_id
         WHERE ri.return_id = ?1 ORDER BY ri.created_at, ri.rowid",
        params![return_id],
    )?);
    ret["history"] = Value::Array(load_status_history(conn, "return", return_id)?);
    Ok(ret)
}

pub fn get_return(db: &DbState, payload: &Value) -> Result<Value, String> {
    let return_id =
        value_str(payload, &["returnId", "return_id", "id"]).ok_or("Missing required field: returnId")?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    return_detail(&conn, &return_id)
}

pub fn list_returns(db: &DbState, payload: &Value) -> Result<Value, String> {
    let status = value_str(payload, &["status"]);
    let loja_id = value_str(payload, &["lojaId", "loja_id"]);
    let sale_id = value_str(payload, &["saleId", "sale_id"]);
    let limit = value_i64(payload, &["limit"]).unwrap_or(100).clamp(1, 1000);
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let rows = query_all_json(
        &conn,
        "SELECT r.*, s.number AS sale_number
         FROM returns r JOIN sales s ON s.id = r.sale_id
         WHERE (?1 IS NULL OR r.status = ?1)
           AND (?2 IS NULL OR r.loja_id = ?2)
           AND (?3 IS NULL OR r.sale_id = ?3)
         ORDER BY r.created_at DESC, r.rowid DESC
         LIMIT ?4",
        params![status, loja_id, sale_id, limit],
    )?;
    Ok(Value::Array(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cash_register::expected_cents;
    use crate::customers::credit_balance_cents;
    use crate::inventory::stock_quantity;
    use crate::inventory::test_support::{seed_loja, seed_product};
    use crate::sales::test_support::{open_caixa, seed_customer};
    use crate::sales::{cancel_sale, create_sale, get_sale};
    use serde_json::json;

    /// 3 x p1 @ 50.00 with 50.00 off: one line, net 100.00.
    fn sale_with_line(db: &DbState, customer: Option<&str>) -> (String, String) {
        let sale = create_sale(
            db,
            &json!({
                "lojaId": "l1",
                "customerId": customer,
                "items": [{ "productId": "p1", "quantity": 3 }],
                "discountAmount": 50,
                "payments": [{ "method": "card", "amount": 100 }]
            }),
        )
        .unwrap();
        let item = sale["items"][0]["id"].as_str().unwrap().to_string();
        (sale["id"].as_str().unwrap().to_string(), item)
    }

    fn setup() -> DbState {
        let db = db::test_state();
        seed_loja(&db, "l1");
        seed_product(&db, "l1", "p1", 50.0, 10);
        seed_customer(&db, "c1");
        db
    }

    fn new_return(db: &DbState, sale: &str, item: &str, qty: i64) -> Result<Value, String> {
        create_return(
            db,
            &json!({ "saleId": sale, "items": [{ "saleItemId": item, "quantity": qty }] }),
        )
    }

    fn id_of(v: &Value) -> String {
        v["id"].as_str().unwrap().to_string()
    }

    #[test]
    fn partial_returns_add_up_to_line_net() {
        let db = setup();
        let (sale, item) = sale_with_line(&db, None);
        let mut refunds = Vec::new();
        for _ in 0..3 {
            let r = new_return(&db, &sale, &item, 1).unwrap();
            refunds.push(to_cents(r["refund_total"].as_f64().unwrap()));
            complete_return(&db, &json!({ "returnId": id_of(&r), "mode": "refund", "refundMethod": "card" }))
                .unwrap();
        }
        assert_eq!(refunds, vec![3_333, 3_334, 3_333]);
        assert_eq!(refunds.iter().sum::<i64>(), 10_000);

        let sale = get_sale(&db, &json!({ "saleId": sale })).unwrap();
        assert_eq!(sale["status"], "devolvida");
        assert_eq!(sale["items"][0]["returned_quantity"], 3);
    }

    #[test]
    fn pending_returns_block_double_claims() {
        let db = setup();
        let (sale, item) = sale_with_line(&db, None);
        new_return(&db, &sale, &item, 2).unwrap();
        let err = new_return(&db, &sale, &item, 2).unwrap_err();
        assert_eq!(
            err,
            format!("Return quantity exceeds available for item {item}: available 1, requested 2")
        );

        let preview = preview_return(
            &db,
            &json!({ "saleId": sale, "items": [{ "saleItemId": item, "quantity": 1 }] }),
        )
        .unwrap();
        assert_eq!(preview["items"][0]["availableQuantity"], 1);
        assert_eq!(preview["refundTotal"], 33.33);

        let err = create_return(
            &db,
            &json!({ "saleId": sale, "items": [
                { "saleItemId": item, "quantity": 1 },
                { "saleItemId": item, "quantity": 1 }
            ] }),
        )
        .unwrap_err();
        assert!(err.starts_with("Sale item listed twice"));
    }

    #[test]
    fn cash_refund_goes_through_caixa_and_is_idempotent() {
        let db = setup();
        let (sale, item) = sale_with_line(&db, None);
        let r = new_return(&db, &sale, &item, 1).unwrap();
        let rid = id_of(&r);

        let err = complete_return(&db, &json!({ "returnId": rid, "mode": "refund" })).unwrap_err();
        assert_eq!(err, "No open caixa for loja l1");

        let session = open_caixa(&db, "l1");
        let done = complete_return(&db, &json!({ "returnId": rid, "mode": "refund" })).unwrap();
        assert_eq!(done["status"], "concluida");
        assert_eq!(done["refund_method"], "cash");
        assert_eq!(done["alreadyCompleted"], false);

        let again = complete_return(&db, &json!({ "returnId": rid, "mode": "refund" })).unwrap();
        assert_eq!(again["alreadyCompleted"], true);
        let err = complete_return(&db, &json!({ "returnId": rid, "mode": "credit" })).unwrap_err();
        assert_eq!(err, "Return already completed as refund");

        let conn = db.conn.lock().unwrap();
        assert_eq!(expected_cents(&conn, &session).unwrap(), 10_000 - 3_333);
        assert_eq!(stock_quantity(&conn, "l1", "p1"), 8);
        drop(conn);

        let sale = get_sale(&db, &json!({ "saleId": sale })).unwrap();
        assert_eq!(sale["status"], "devolvida_parcial");
    }

    #[test]
    fn credit_completion_needs_customer_and_issues_credit() {
        let db = setup();
        let (anon_sale, anon_item) = sale_with_line(&db, None);
        let r = new_return(&db, &anon_sale, &anon_item, 1).unwrap();
        let err = complete_return(&db, &json!({ "returnId": id_of(&r), "mode": "credit" })).unwrap_err();
        assert_eq!(err, "Store credit requires a customer on the sale");

        let (sale, item) = sale_with_line(&db, Some("c1"));
        let r = create_return(
            &db,
            &json!({ "saleId": sale, "items": [{ "saleItemId": item, "quantity": 3, "restock": false }] }),
        )
        .unwrap();
        let done = complete_return(&db, &json!({ "returnId": id_of(&r), "mode": "credit" })).unwrap();
        assert_eq!(done["status"], "concluida_com_credito");
        assert!(done["credit_entry_id"].is_string());

        let conn = db.conn.lock().unwrap();
        assert_eq!(credit_balance_cents(&conn, "c1").unwrap(), 10_000);
        // not restocked: 10 - 3 - 3
        assert_eq!(stock_quantity(&conn, "l1", "p1"), 4);
    }

    #[test]
    fn cancelled_return_frees_quantity() {
        let db = setup();
        let (sale, item) = sale_with_line(&db, None);
        let r = new_return(&db, &sale, &item, 3).unwrap();
        let rid = id_of(&r);

        let err = cancel_sale(&db, &json!({ "saleId": sale, "reason": "x" })).unwrap_err();
        assert_eq!(err, "Sale has returns and cannot be cancelled");

        let cancelled = cancel_return(&db, &json!({ "returnId": rid, "reason": "cliente desistiu" })).unwrap();
        assert_eq!(cancelled["status"], "cancelada");
        assert_eq!(cancelled["history"].as_array().unwrap().len(), 2);
        let err = complete_return(&db, &json!({ "returnId": rid, "mode": "refund" })).unwrap_err();
        assert_eq!(err, "Return is cancelled");
        assert!(cancel_return(&db, &json!({ "returnId": rid })).is_err());

        new_return(&db, &sale, &item, 3).unwrap();
        let listed = list_returns(&db, &json!({ "saleId": sale, "status": "pendente" })).unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[test]
    fn cancelled_sale_cannot_take_returns() {
        let db = setup();
        let (sale, item) = sale_with_line(&db, None);
        cancel_sale(&db, &json!({ "saleId": sale, "reason": "erro" })).unwrap();
        let err = new_return(&db, &sale, &item, 1).unwrap_err();
        assert_eq!(err, "Sale cannot take returns (status: cancelada)");
    }
}
