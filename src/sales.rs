//! Sales (vendas): checkout, lookup and cancellation.
//!
//! A sale is written in one transaction: header, line items with their share
//! of the sale-level discount, stock decrements, payments and the caixa
//! movement for the cash kept. Any failure leaves nothing behind.

use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::info;

use crate::cash_register::{record_movement, require_open_session};
use crate::customers::reverse_credit;
use crate::data_helpers::{
    load_status_history, next_number, query_all_json, query_one_json, record_status_change,
    require_row,
};
use crate::db::{self, DbState};
use crate::inventory::{apply_stock_movement, product_price_cents, StockChange};
use crate::money::{allocate_proportional, from_cents, line_cents, sum_cents, to_cents, MAX_QUANTITY};
use crate::payments::{
    list_payments, paid_by_method, parse_payments, record_payments, resolve_session, settle,
    PaymentMethod, PaymentTarget,
};
use crate::sync::enqueue_row;
use crate::{now_iso, value_f64, value_i64, value_str};

struct ItemInput {
    product_id: String,
    quantity: i64,
    unit_price: Option<f64>,
}

fn parse_items(payload: &Value) -> Result<Vec<ItemInput>, String> {
    let arr = payload
        .get("items")
        .and_then(|v| v.as_array())
        .ok_or("Missing required field: items")?;
    if arr.is_empty() {
        return Err("A sale needs at least one item".into());
    }
    let mut items = Vec::with_capacity(arr.len());
    for (idx, item) in arr.iter().enumerate() {
        let product_id = value_str(item, &["productId", "product_id"])
            .ok_or_else(|| format!("items[{idx}]: missing productId"))?;
        let quantity = value_i64(item, &["quantity"])
            .ok_or_else(|| format!("items[{idx}]: quantity must be an integer"))?;
        if quantity < 1 {
            return Err(format!("items[{idx}]: quantity must be at least 1"));
        }
        if quantity > MAX_QUANTITY {
            return Err(format!("items[{idx}]: quantity cannot exceed {MAX_QUANTITY}"));
        }
        let unit_price = value_f64(item, &["unitPrice", "unit_price"]);
        if unit_price.is_some_and(|p| p < 0.0) {
            return Err(format!("items[{idx}]: unitPrice cannot be negative"));
        }
        items.push(ItemInput {
            product_id,
            quantity,
            unit_price,
        });
    }
    Ok(items)
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

pub fn create_sale(db: &DbState, payload: &Value) -> Result<Value, String> {
    let loja_id = value_str(payload, &["lojaId", "loja_id"]).ok_or("Missing required field: lojaId")?;
    let customer_id = value_str(payload, &["customerId", "customer_id"]);
    let staff_id = value_str(payload, &["staffId", "staff_id"]);
    let discount = value_f64(payload, &["discountAmount", "discount_amount", "discount"]).unwrap_or(0.0);
    let items = parse_items(payload)?;
    let payment_lines = parse_payments(payload)?;

    let discount_cents = to_cents(discount);
    if discount_cents < 0 {
        return Err("Discount cannot be negative".into());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let sale_id = uuid::Uuid::new_v4().to_string();

    let sale = db::in_transaction(&conn, |conn| {
        require_row(conn, "lojas", &loja_id)?;
        if let Some(ref cid) = customer_id {
            require_row(conn, "customers", cid)?;
        }

        let mut unit_cents = Vec::with_capacity(items.len());
        for item in &items {
            let cents = match item.unit_price {
                Some(p) => to_cents(p),
                None => product_price_cents(conn, &item.product_id)?,
            };
            unit_cents.push(cents);
        }
        let gross = items
            .iter()
            .zip(&unit_cents)
            .map(|(item, unit)| line_cents(*unit, item.quantity))
            .collect::<Result<Vec<i64>, String>>()?;
        let subtotal = sum_cents(gross.iter().copied())?;
        if discount_cents > subtotal {
            return Err(format!(
                "Discount {:.2} exceeds subtotal {:.2}",
                from_cents(discount_cents),
                from_cents(subtotal)
            ));
        }
        let allocations = allocate_proportional(discount_cents, &gross);
        let total = subtotal - discount_cents;

        let settlement = settle(total, &payment_lines)?;
        if settlement.credit_cents > 0 && customer_id.is_none() {
            return Err("Store credit payment requires a customer".into());
        }
        let session_id = resolve_session(conn, &loja_id, &settlement)?;
        let number = next_number(conn, "sales", &loja_id)?;
        let now = now_iso();

        conn.execute(
            "INSERT INTO sales (id, number, loja_id, customer_id, staff_id, cash_session_id,
                                subtotal, discount_amount, total, change_amount, status,
                                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'concluida', ?11, ?11)",
            params![
                sale_id,
                number,
                loja_id,
                customer_id,
                staff_id,
                session_id,
                from_cents(subtotal),
                from_cents(discount_cents),
                from_cents(total),
                from_cents(settlement.change_cents),
                now
            ],
        )
        .map_err(|e| format!("insert sale: {e}"))?;
        enqueue_row(conn, "sales", &sale_id, "insert")?;

        for (idx, item) in items.iter().enumerate() {
            let item_id = uuid::Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO sale_items (id, sale_id, product_id, quantity, unit_price, gross_amount,
                                         discount_allocated, net_amount, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    item_id,
                    sale_id,
                    item.product_id,
                    item.quantity,
                    from_cents(unit_cents[idx]),
                    from_cents(gross[idx]),
                    from_cents(allocations[idx]),
                    from_cents(gross[idx] - allocations[idx]),
                    now
                ],
            )
            .map_err(|e| format!("insert sale item: {e}"))?;
            enqueue_row(conn, "sale_items", &item_id, "insert")?;

            apply_stock_movement(
                conn,
                &StockChange {
                    loja_id: &loja_id,
                    product_id: &item.product_id,
                    delta: -item.quantity,
                    reason: "sale",
                    reference_type: Some("sale"),
                    reference_id: Some(&sale_id),
                    note: None,
                    staff_id: staff_id.as_deref(),
                },
            )?;
        }

        record_payments(
            conn,
            &PaymentTarget {
                reference_type: "sale",
                reference_id: &sale_id,
                customer_id: customer_id.as_deref(),
                session_id: session_id.as_deref(),
                staff_id: staff_id.as_deref(),
            },
            &settlement,
        )?;
        record_status_change(conn, "sale", &sale_id, None, "concluida", None, staff_id.as_deref())?;

        info!(
            sale_id = %sale_id,
            loja_id = %loja_id,
            number,
            total = from_cents(total),
            "sale created"
        );
        sale_detail(conn, &sale_id)
    })?;

    Ok(sale)
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

/// Sale header with items (and their returned quantities), payments and returns.
pub(crate) fn sale_detail(conn: &Connection, sale_id: &str) -> Result<Value, String> {
    let mut sale = query_one_json(conn, "SELECT * FROM sales WHERE id = ?1", params![sale_id])?;
    if sale.is_null() {
        return Err(format!("Sale not found: {sale_id}"));
    }

    let items = query_all_json(
        conn,
        "SELECT si.*, p.sku, p.name AS product_name,
                COALESCE((SELECT SUM(ri.quantity) FROM return_items ri
                          JOIN returns r ON r.id = ri.return_id
                          WHERE ri.sale_item_id = si.id AND r.status != 'cancelada'), 0)
                    AS returned_quantity
         FROM sale_items si
         JOIN products p ON p.id = si.product_id
         WHERE si.sale_id = ?1
         ORDER BY si.created_at, si.rowid",
        params![sale_id],
    )?;
    let returns = query_all_json(
        conn,
        "SELECT id, status, refund_total, completion_mode, refund_method, created_at, completed_at
         FROM returns WHERE sale_id = ?1 ORDER BY created_at, rowid",
        params![sale_id],
    )?;

    sale["items"] = Value::Array(items);
    sale["payments"] = Value::Array(list_payments(conn, "sale", sale_id)?);
    sale["returns"] = Value::Array(returns);
    sale["history"] = Value::Array(load_status_history(conn, "sale", sale_id)?);
    Ok(sale)
}

pub fn get_sale(db: &DbState, payload: &Value) -> Result<Value, String> {
    let sale_id = value_str(payload, &["saleId", "sale_id", "id"]).ok_or("Missing required field: saleId")?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    sale_detail(&conn, &sale_id)
}

pub fn list_sales(db: &DbState, payload: &Value) -> Result<Value, String> {
    let loja_id = value_str(payload, &["lojaId", "loja_id"]);
    let from = value_str(payload, &["from", "dateFrom"]);
    let to = value_str(payload, &["to", "dateTo"]);
    let status = value_str(payload, &["status"]);
    let limit = value_i64(payload, &["limit"]).unwrap_or(100).clamp(1, 1000);

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let rows = query_all_json(
        &conn,
        "SELECT s.*, c.name AS customer_name
         FROM sales s
         LEFT JOIN customers c ON c.id = s.customer_id
         WHERE (?1 IS NULL OR s.loja_id = ?1)
           AND (?2 IS NULL OR s.created_at >= ?2)
           AND (?3 IS NULL OR s.created_at <= ?3)
           AND (?4 IS NULL OR s.status = ?4)
         ORDER BY s.created_at DESC, s.rowid DESC
         LIMIT ?5",
        params![loja_id, from, to, status, limit],
    )?;
    Ok(Value::Array(rows))
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

/// Void a completed sale that has no returns: restock, reverse store credit
/// and take the kept cash back out of the caixa.
pub fn cancel_sale(db: &DbState, payload: &Value) -> Result<Value, String> {
    let sale_id = value_str(payload, &["saleId", "sale_id", "id"]).ok_or("Missing required field: saleId")?;
    let reason = value_str(payload, &["reason"]).ok_or("Missing required field: reason")?;
    let staff_id = value_str(payload, &["staffId", "staff_id"]);

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let sale = db::in_transaction(&conn, |conn| {
        let (loja_id, customer_id, status): (String, Option<String>, String) = conn
            .query_row(
                "SELECT loja_id, customer_id, status FROM sales WHERE id = ?1",
                params![sale_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(|_| format!("Sale not found: {sale_id}"))?;
        if status != "concluida" {
            return Err(format!("Only concluida sales can be cancelled (status: {status})"));
        }
        let open_returns: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM returns WHERE sale_id = ?1 AND status != 'cancelada'",
                params![sale_id],
                |row| row.get(0),
            )
            .map_err(|e| e.to_string())?;
        if open_returns > 0 {
            return Err("Sale has returns and cannot be cancelled".into());
        }

        let lines: Vec<(String, i64)> = {
            let mut stmt = conn
                .prepare("SELECT product_id, quantity FROM sale_items WHERE sale_id = ?1")
                .map_err(|e| e.to_string())?;
            let rows = stmt
                .query_map(params![sale_id], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(|e| e.to_string())?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| format!("read sale items: {e}"))?
        };
        for (product_id, quantity) in &lines {
            apply_stock_movement(
                conn,
                &StockChange {
                    loja_id: &loja_id,
                    product_id,
                    delta: *quantity,
                    reason: "sale_cancel",
                    reference_type: Some("sale"),
                    reference_id: Some(&sale_id),
                    note: Some(&reason),
                    staff_id: staff_id.as_deref(),
                },
            )?;
        }

        for (method, cents) in paid_by_method(conn, "sale", &sale_id)? {
            match method {
                PaymentMethod::Credit => {
                    let cid = customer_id
                        .as_deref()
                        .ok_or("Credit payment without customer")?;
                    reverse_credit(conn, cid, cents, "sale", &sale_id, "sale cancelled")?;
                }
                PaymentMethod::Cash if cents > 0 => {
                    let session_id = require_open_session(conn, &loja_id)?;
                    record_movement(
                        conn,
                        &session_id,
                        "estorno",
                        cents,
                        Some("sale"),
                        Some(&sale_id),
                        Some(&reason),
                        staff_id.as_deref(),
                    )?;
                }
                _ => {}
            }
        }

        let now = now_iso();
        conn.execute(
            "UPDATE sales SET status = 'cancelada', cancel_reason = ?1, cancelled_at = ?2,
                              updated_at = ?2
             WHERE id = ?3",
            params![reason, now, sale_id],
        )
        .map_err(|e| format!("cancel sale: {e}"))?;
        record_status_change(
            conn,
            "sale",
            &sale_id,
            Some("concluida"),
            "cancelada",
            Some(&reason),
            staff_id.as_deref(),
        )?;
        enqueue_row(conn, "sales", &sale_id, "update")?;
        sale_detail(conn, &sale_id)
    })?;

    info!(sale_id = %sale_id, "sale cancelled");
    Ok(sale)
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::cash_register::expected_cents;
    use crate::customers::{credit_balance_cents, issue_credit};
    use crate::inventory::stock_quantity;
    use crate::inventory::test_support::{seed_loja, seed_product};
    use serde_json::json;

    fn setup() -> DbState {
        let db = db::test_state();
        seed_loja(&db, "l1");
        seed_product(&db, "l1", "p1", 33.33, 10);
        seed_product(&db, "l1", "p2", 10.0, 10);
        db
    }

    #[test]
    fn discount_is_allocated_exactly() {
        let db = setup();
        open_caixa(&db, "l1");
        let sale = create_sale(
            &db,
            &json!({
                "lojaId": "l1",
                "items": [
                    { "productId": "p1", "quantity": 3 },
                    { "productId": "p2", "quantity": 1 }
                ],
                "discountAmount": 10.0,
                "payments": [{ "method": "cash", "amount": 100 }]
            }),
        )
        .unwrap();

        assert_eq!(sale["subtotal"], 109.99);
        assert_eq!(sale["total"], 99.99);
        assert_eq!(sale["change_amount"], 0.01);
        assert_eq!(sale["number"], 1);
        let items = sale["items"].as_array().unwrap();
        let allocated: i64 = items
            .iter()
            .map(|i| to_cents(i["discount_allocated"].as_f64().unwrap()))
            .sum();
        assert_eq!(allocated, 1_000);
        // 99.99 of 109.99 gross -> 9.09 ; 10.00 -> 0.91
        assert_eq!(items[0]["discount_allocated"], 9.09);
        assert_eq!(items[0]["net_amount"], 90.9);
        assert_eq!(items[1]["discount_allocated"], 0.91);

        let conn = db.conn.lock().unwrap();
        assert_eq!(stock_quantity(&conn, "l1", "p1"), 7);
        let session = sale["cash_session_id"].as_str().unwrap();
        assert_eq!(expected_cents(&conn, session).unwrap(), 10_000 + 9_999);
    }

    #[test]
    fn insufficient_stock_rolls_back_everything() {
        let db = setup();
        open_caixa(&db, "l1");
        let err = create_sale(
            &db,
            &json!({
                "lojaId": "l1",
                "items": [
                    { "productId": "p2", "quantity": 1 },
                    { "productId": "p1", "quantity": 11 }
                ],
                "payments": [{ "method": "card", "amount": 500 }]
            }),
        )
        .unwrap_err();
        assert_eq!(err, "Insufficient stock for p1: available 10, requested 11");

        let conn = db.conn.lock().unwrap();
        assert_eq!(stock_quantity(&conn, "l1", "p2"), 10);
        let sales: i64 = conn.query_row("SELECT COUNT(*) FROM sales", [], |r| r.get(0)).unwrap();
        assert_eq!(sales, 0);
    }

    #[test]
    fn oversized_lines_fail_without_touching_the_store() {
        let db = setup();
        let err = create_sale(
            &db,
            &json!({
                "lojaId": "l1",
                "items": [{ "productId": "p2", "quantity": 9_000_000_000_000_000i64 }],
                "payments": [{ "method": "card", "amount": 1 }]
            }),
        )
        .unwrap_err();
        assert_eq!(err, "items[0]: quantity cannot exceed 1000000");

        let err = create_sale(
            &db,
            &json!({
                "lojaId": "l1",
                "items": [{ "productId": "p2", "quantity": 1000, "unitPrice": 1e17 }],
                "payments": [{ "method": "card", "amount": 1 }]
            }),
        )
        .unwrap_err();
        assert_eq!(err, "amount out of range");

        let sale = create_sale(
            &db,
            &json!({
                "lojaId": "l1",
                "items": [{ "productId": "p2", "quantity": 1 }],
                "payments": [{ "method": "card", "amount": 10 }]
            }),
        )
        .unwrap();
        assert_eq!(sale["total"], 10.0);
    }

    #[test]
    fn cash_requires_open_caixa_but_card_does_not() {
        let db = setup();
        let err = create_sale(
            &db,
            &json!({
                "lojaId": "l1",
                "items": [{ "productId": "p2", "quantity": 1 }],
                "payments": [{ "method": "cash", "amount": 10 }]
            }),
        )
        .unwrap_err();
        assert_eq!(err, "No open caixa for loja l1");

        let sale = create_sale(
            &db,
            &json!({
                "lojaId": "l1",
                "items": [{ "productId": "p2", "quantity": 1, "unitPrice": 8.5 }],
                "payments": [{ "method": "pix", "amount": 8.5 }]
            }),
        )
        .unwrap();
        assert!(sale["cash_session_id"].is_null());
        assert_eq!(sale["total"], 8.5);
    }

    #[test]
    fn discount_above_subtotal_is_rejected() {
        let db = setup();
        let err = create_sale(
            &db,
            &json!({
                "lojaId": "l1",
                "items": [{ "productId": "p2", "quantity": 1 }],
                "discountAmount": 10.01,
                "payments": []
            }),
        )
        .unwrap_err();
        assert!(err.starts_with("Discount 10.01 exceeds subtotal 10.00"));
    }

    #[test]
    fn credit_payment_redeems_balance() {
        let db = setup();
        seed_customer(&db, "c1");
        {
            let conn = db.conn.lock().unwrap();
            issue_credit(&conn, "c1", 1_500, "return", "r0").unwrap();
        }
        let err = create_sale(
            &db,
            &json!({
                "lojaId": "l1",
                "items": [{ "productId": "p2", "quantity": 2 }],
                "payments": [{ "method": "credit", "amount": 20 }]
            }),
        )
        .unwrap_err();
        assert_eq!(err, "Store credit payment requires a customer");

        let sale = create_sale(
            &db,
            &json!({
                "lojaId": "l1",
                "customerId": "c1",
                "items": [{ "productId": "p2", "quantity": 2 }],
                "payments": [
                    { "method": "credit", "amount": 15 },
                    { "method": "card", "amount": 5 }
                ]
            }),
        )
        .unwrap();
        assert_eq!(sale["payments"].as_array().unwrap().len(), 2);
        let conn = db.conn.lock().unwrap();
        assert_eq!(credit_balance_cents(&conn, "c1").unwrap(), 0);
    }

    #[test]
    fn cancel_restocks_reverses_credit_and_cash() {
        let db = setup();
        seed_customer(&db, "c1");
        let session = open_caixa(&db, "l1");
        {
            let conn = db.conn.lock().unwrap();
            issue_credit(&conn, "c1", 500, "return", "r0").unwrap();
        }
        let sale = create_sale(
            &db,
            &json!({
                "lojaId": "l1",
                "customerId": "c1",
                "items": [{ "productId": "p2", "quantity": 3 }],
                "payments": [
                    { "method": "credit", "amount": 5 },
                    { "method": "cash", "amount": 50 }
                ]
            }),
        )
        .unwrap();
        let sale_id = sale["id"].as_str().unwrap().to_string();
        {
            let conn = db.conn.lock().unwrap();
            assert_eq!(expected_cents(&conn, &session).unwrap(), 12_500);
        }

        assert!(cancel_sale(&db, &json!({ "saleId": sale_id })).is_err());
        let cancelled = cancel_sale(&db, &json!({ "saleId": sale_id, "reason": "erro de digitacao" }))
            .unwrap();
        assert_eq!(cancelled["status"], "cancelada");
        assert_eq!(cancelled["history"].as_array().unwrap().len(), 2);

        let conn = db.conn.lock().unwrap();
        assert_eq!(stock_quantity(&conn, "l1", "p2"), 10);
        assert_eq!(credit_balance_cents(&conn, "c1").unwrap(), 500);
        assert_eq!(expected_cents(&conn, &session).unwrap(), 10_000);
        drop(conn);

        let err = cancel_sale(&db, &json!({ "saleId": sale_id, "reason": "again" })).unwrap_err();
        assert!(err.starts_with("Only concluida sales can be cancelled"));
    }

    #[test]
    fn list_sales_filters_by_status() {
        let db = setup();
        for _ in 0..2 {
            create_sale(
                &db,
                &json!({
                    "lojaId": "l1",
                    "items": [{ "productId": "p2", "quantity": 1 }],
                    "payments": [{ "method": "card", "amount": 10 }]
                }),
            )
            .unwrap();
        }
        let all = list_sales(&db, &json!({ "lojaId": "l1" })).unwrap();
        assert_eq!(all.as_array().unwrap().len(), 2);
        assert_eq!(all[0]["number"], 2);
        let none = list_sales(&db, &json!({ "status": "cancelada" })).unwrap();
        assert!(none.as_array().unwrap().is_empty());
    }
}
