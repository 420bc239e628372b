//! Products and per-loja stock.
//!
//! `stock_levels` holds the current quantity per (loja, product);
//! `stock_movements` is the append-only ledger behind it. Every change goes
//! through [`apply_stock_movement`], which refuses to take a level below zero.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::info;

use crate::data_helpers::{query_all_json, query_one_json, require_row};
use crate::db::{self, DbState};
use crate::money::{round2, to_cents, MAX_QUANTITY};
use crate::sync::enqueue_row;
use crate::{now_iso, value_bool, value_f64, value_i64, value_str};

pub const MOVEMENT_REASONS: &[&str] = &[
    "purchase",
    "adjustment",
    "sale",
    "sale_cancel",
    "return",
    "transfer_in",
    "transfer_out",
    "service_order",
    "service_order_cancel",
    "rma_out",
    "rma_in",
];

/// Reasons a person may record by hand; the rest come from workflows.
const MANUAL_REASONS: &[&str] = &["purchase", "adjustment"];

/// A single ledger entry to apply.
pub(crate) struct StockChange<'a> {
    pub loja_id: &'a str,
    pub product_id: &'a str,
    pub delta: i64,
    pub reason: &'a str,
    pub reference_type: Option<&'a str>,
    pub reference_id: Option<&'a str>,
    pub note: Option<&'a str>,
    pub staff_id: Option<&'a str>,
}

/// Apply one stock change inside the caller's transaction.
/// Returns the quantity after the change.
pub(crate) fn apply_stock_movement(conn: &Connection, change: &StockChange) -> Result<i64, String> {
    if !MOVEMENT_REASONS.contains(&change.reason) {
        return Err(format!("Invalid stock movement reason: {}", change.reason));
    }
    if change.delta == 0 {
        return Err("Stock movement delta cannot be zero".into());
    }
    require_row(conn, "lojas", change.loja_id)?;

    let sku: String = conn
        .query_row(
            "SELECT sku FROM products WHERE id = ?1",
            params![change.product_id],
            |row| row.get(0),
        )
        .map_err(|_| format!("Product not found: {}", change.product_id))?;

    let existing: Option<(String, i64)> = conn
        .query_row(
            "SELECT id, quantity FROM stock_levels WHERE loja_id = ?1 AND product_id = ?2",
            params![change.loja_id, change.product_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| format!("read stock level: {e}"))?;

    let current = existing.as_ref().map(|(_, q)| *q).unwrap_or(0);
    let after = current
        .checked_add(change.delta)
        .ok_or_else(|| format!("Stock quantity out of range for {sku}"))?;
    if after < 0 {
        return Err(format!(
            "Insufficient stock for {sku}: available {current}, requested {}",
            -change.delta
        ));
    }

    let now = now_iso();
    let (level_id, op) = match existing {
        Some((id, _)) => {
            conn.execute(
                "UPDATE stock_levels SET quantity = ?1, updated_at = ?2 WHERE id = ?3",
                params![after, now, id],
            )
            .map_err(|e| format!("update stock level: {e}"))?;
            (id, "update")
        }
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO stock_levels (id, loja_id, product_id, quantity, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id, change.loja_id, change.product_id, after, now],
            )
            .map_err(|e| format!("insert stock level: {e}"))?;
            (id, "insert")
        }
    };
    enqueue_row(conn, "stock_levels", &level_id, op)?;

    let movement_id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO stock_movements (id, loja_id, product_id, delta, quantity_after, reason,
                                      reference_type, reference_id, note, staff_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            movement_id,
            change.loja_id,
            change.product_id,
            change.delta,
            after,
            change.reason,
            change.reference_type,
            change.reference_id,
            change.note,
            change.staff_id,
            now
        ],
    )
    .map_err(|e| format!("insert stock movement: {e}"))?;
    enqueue_row(conn, "stock_movements", &movement_id, "insert")?;

    Ok(after)
}

// ---------------------------------------------------------------------------
// Products
// ---------------------------------------------------------------------------

pub fn create_product(db: &DbState, payload: &Value) -> Result<Value, String> {
    let sku = value_str(payload, &["sku"]).ok_or("Missing required field: sku")?;
    let name = value_str(payload, &["name"]).ok_or("Missing required field: name")?;
    let category = value_str(payload, &["category"]);
    let brand = value_str(payload, &["brand"]);
    let model = value_str(payload, &["model"]);
    let cost_price = value_f64(payload, &["costPrice", "cost_price"]).unwrap_or(0.0);
    let sale_price = value_f64(payload, &["salePrice", "sale_price"]).unwrap_or(0.0);
    let min_stock = value_i64(payload, &["minStock", "min_stock"]).unwrap_or(0);
    let tracks_serial = value_bool(payload, &["tracksSerial", "tracks_serial"]).unwrap_or(false);
    let initial_stock = value_i64(payload, &["initialStock", "initial_stock"]).unwrap_or(0);
    let loja_id = value_str(payload, &["lojaId", "loja_id"]);
    let staff_id = value_str(payload, &["staffId", "staff_id"]);

    if cost_price < 0.0 || sale_price < 0.0 {
        return Err("Prices must be zero or positive".into());
    }
    if min_stock < 0 {
        return Err("minStock must be zero or positive".into());
    }
    if initial_stock < 0 {
        return Err("initialStock must be zero or positive".into());
    }
    if initial_stock > 0 && loja_id.is_none() {
        return Err("initialStock requires lojaId".into());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let id = uuid::Uuid::new_v4().to_string();

    let product = db::in_transaction(&conn, |conn| {
        let taken: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM products WHERE sku = ?1)",
                params![sku],
                |row| row.get(0),
            )
            .map_err(|e| e.to_string())?;
        if taken {
            return Err(format!("SKU already exists: {sku}"));
        }

        let now = now_iso();
        conn.execute(
            "INSERT INTO products (id, sku, name, category, brand, model, cost_price, sale_price,
                                   min_stock, tracks_serial, active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11, ?11)",
            params![
                id,
                sku,
                name,
                category,
                brand,
                model,
                round2(cost_price),
                round2(sale_price),
                min_stock,
                tracks_serial,
                now
            ],
        )
        .map_err(|e| format!("insert product: {e}"))?;
        enqueue_row(conn, "products", &id, "insert")?;

        if let (Some(loja), true) = (loja_id.as_deref(), initial_stock > 0) {
            apply_stock_movement(
                conn,
                &StockChange {
                    loja_id: loja,
                    product_id: &id,
                    delta: initial_stock,
                    reason: "purchase",
                    reference_type: None,
                    reference_id: None,
                    note: Some("initial stock"),
                    staff_id: staff_id.as_deref(),
                },
            )?;
        }

        query_one_json(conn, "SELECT * FROM products WHERE id = ?1", params![id])
    })?;

    info!(product_id = %id, sku = %sku, "product created");
    Ok(product)
}

/// Unit sale price in cents for an active product.
pub(crate) fn product_price_cents(conn: &Connection, product_id: &str) -> Result<i64, String> {
    let (price, active): (f64, bool) = conn
        .query_row(
            "SELECT sale_price, active FROM products WHERE id = ?1",
            params![product_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|_| format!("Product not found: {product_id}"))?;
    if !active {
        return Err(format!("Product is inactive: {product_id}"));
    }
    Ok(to_cents(price))
}

// ---------------------------------------------------------------------------
// Stock operations
// ---------------------------------------------------------------------------

/// Manual stock change (purchase receipt or count adjustment).
pub fn adjust_stock(db: &DbState, payload: &Value) -> Result<Value, String> {
    let loja_id = value_str(payload, &["lojaId", "loja_id"]).ok_or("Missing required field: lojaId")?;
    let product_id =
        value_str(payload, &["productId", "product_id"]).ok_or("Missing required field: productId")?;
    let delta = value_i64(payload, &["delta"]).ok_or("Missing required field: delta (integer)")?;
    let reason = value_str(payload, &["reason"]).unwrap_or_else(|| "adjustment".into());
    let note = value_str(payload, &["note"]);
    let staff_id = value_str(payload, &["staffId", "staff_id"]);

    if !MANUAL_REASONS.contains(&reason.as_str()) {
        return Err(format!("Reason {reason} is recorded by its workflow"));
    }
    if reason == "purchase" && delta < 0 {
        return Err("A purchase cannot reduce stock".into());
    }
    if delta.unsigned_abs() > MAX_QUANTITY as u64 {
        return Err(format!("Stock delta cannot exceed {MAX_QUANTITY} units"));
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let quantity = db::in_transaction(&conn, |conn| {
        apply_stock_movement(
            conn,
            &StockChange {
                loja_id: &loja_id,
                product_id: &product_id,
                delta,
                reason: &reason,
                reference_type: None,
                reference_id: None,
                note: note.as_deref(),
                staff_id: staff_id.as_deref(),
            },
        )
    })?;

    info!(loja_id = %loja_id, product_id = %product_id, delta, quantity, "stock adjusted");
    Ok(serde_json::json!({
        "success": true,
        "lojaId": loja_id,
        "productId": product_id,
        "quantity": quantity,
    }))
}

/// Move units between lojas as a paired transfer_out / transfer_in.
pub fn transfer_stock(db: &DbState, payload: &Value) -> Result<Value, String> {
    let from = value_str(payload, &["fromLojaId", "from_loja_id"])
        .ok_or("Missing required field: fromLojaId")?;
    let to =
        value_str(payload, &["toLojaId", "to_loja_id"]).ok_or("Missing required field: toLojaId")?;
    let product_id =
        value_str(payload, &["productId", "product_id"]).ok_or("Missing required field: productId")?;
    let quantity = value_i64(payload, &["quantity"]).ok_or("Missing required field: quantity")?;
    let note = value_str(payload, &["note"]);
    let staff_id = value_str(payload, &["staffId", "staff_id"]);

    if from == to {
        return Err("Source and destination loja must differ".into());
    }
    if quantity <= 0 {
        return Err("Transfer quantity must be positive".into());
    }
    if quantity > MAX_QUANTITY {
        return Err(format!("Transfer quantity cannot exceed {MAX_QUANTITY}"));
    }

    let transfer_id = uuid::Uuid::new_v4().to_string();
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let (from_qty, to_qty) = db::in_transaction(&conn, |conn| {
        let from_qty = apply_stock_movement(
            conn,
            &StockChange {
                loja_id: &from,
                product_id: &product_id,
                delta: -quantity,
                reason: "transfer_out",
                reference_type: Some("transfer"),
                reference_id: Some(&transfer_id),
                note: note.as_deref(),
                staff_id: staff_id.as_deref(),
            },
        )?;
        let to_qty = apply_stock_movement(
            conn,
            &StockChange {
                loja_id: &to,
                product_id: &product_id,
                delta: quantity,
                reason: "transfer_in",
                reference_type: Some("transfer"),
                reference_id: Some(&transfer_id),
                note: note.as_deref(),
                staff_id: staff_id.as_deref(),
            },
        )?;
        Ok((from_qty, to_qty))
    })?;

    info!(transfer_id = %transfer_id, from = %from, to = %to, quantity, "stock transferred");
    Ok(serde_json::json!({
        "success": true,
        "transferId": transfer_id,
        "fromQuantity": from_qty,
        "toQuantity": to_qty,
    }))
}

/// Stock for every active product in a loja (0 when never stocked).
pub fn get_stock(db: &DbState, payload: &Value) -> Result<Value, String> {
    let loja_id = value_str(payload, &["lojaId", "loja_id"]).ok_or("Missing required field: lojaId")?;
    let product_id = value_str(payload, &["productId", "product_id"]);
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let rows = query_all_json(
        &conn,
        "SELECT p.id AS product_id, p.sku, p.name, p.min_stock, p.sale_price,
                COALESCE(s.quantity, 0) AS quantity
         FROM products p
         LEFT JOIN stock_levels s ON s.product_id = p.id AND s.loja_id = ?1
         WHERE p.active = 1 AND (?2 IS NULL OR p.id = ?2)
         ORDER BY p.name",
        params![loja_id, product_id],
    )?;
    Ok(Value::Array(rows))
}

/// Products at or below their minimum stock in a loja.
pub fn list_low_stock(db: &DbState, payload: &Value) -> Result<Value, String> {
    let loja_id = value_str(payload, &["lojaId", "loja_id"]).ok_or("Missing required field: lojaId")?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let rows = query_all_json(
        &conn,
        "SELECT p.id AS product_id, p.sku, p.name, p.min_stock,
                COALESCE(s.quantity, 0) AS quantity
         FROM products p
         LEFT JOIN stock_levels s ON s.product_id = p.id AND s.loja_id = ?1
         WHERE p.active = 1 AND COALESCE(s.quantity, 0) <= p.min_stock
         ORDER BY (p.min_stock - COALESCE(s.quantity, 0)) DESC, p.name",
        params![loja_id],
    )?;
    Ok(Value::Array(rows))
}

pub fn list_movements(db: &DbState, payload: &Value) -> Result<Value, String> {
    let loja_id = value_str(payload, &["lojaId", "loja_id"]);
    let product_id = value_str(payload, &["productId", "product_id"]);
    let limit = value_i64(payload, &["limit"]).unwrap_or(100).clamp(1, 1000);
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let rows = query_all_json(
        &conn,
        "SELECT m.*, p.sku, p.name AS product_name
         FROM stock_movements m
         JOIN products p ON p.id = m.product_id
         WHERE (?1 IS NULL OR m.loja_id = ?1) AND (?2 IS NULL OR m.product_id = ?2)
         ORDER BY m.created_at DESC, m.rowid DESC
         LIMIT ?3",
        params![loja_id, product_id, limit],
    )?;
    Ok(Value::Array(rows))
}

pub(crate) fn stock_quantity(conn: &Connection, loja_id: &str, product_id: &str) -> i64 {
    conn.query_row(
        "SELECT quantity FROM stock_levels WHERE loja_id = ?1 AND product_id = ?2",
        params![loja_id, product_id],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn seed_loja(db: &DbState, id: &str) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO lojas (id, name, created_at, updated_at) VALUES (?1, ?1, 'x', 'x')",
            params![id],
        )
        .unwrap();
    }

    /// Product with `stock` units in `loja_id`.
    pub fn seed_product(db: &DbState, loja_id: &str, id: &str, price: f64, stock: i64) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO products (id, sku, name, sale_price, cost_price, created_at, updated_at)
             VALUES (?1, ?1, ?1, ?2, 0, 'x', 'x')",
            params![id, price],
        )
        .unwrap();
        if stock > 0 {
            apply_stock_movement(
                &conn,
                &StockChange {
                    loja_id,
                    product_id: id,
                    delta: stock,
                    reason: "purchase",
                    reference_type: None,
                    reference_id: None,
                    note: None,
                    staff_id: None,
                },
            )
            .unwrap();
        }
    }
}
