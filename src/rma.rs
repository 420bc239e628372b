//! Supplier RMAs: defective units sent back to the supplier.
//!
//! `aberto → enviado → em_analise → aprovado | recusado → concluido`, and
//! `aberto → cancelado`. Sending takes the units out of stock; an approved
//! RMA concludes with a replacement (units back in) or a supplier credit.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::info;

use crate::data_helpers::{load_status_history, query_all_json, query_one_json, record_status_change, require_row};
use crate::db::{self, DbState};
use crate::inventory::{apply_stock_movement, StockChange};
use crate::money::{from_cents, to_cents};
use crate::sync::enqueue_row;
use crate::{now_iso, value_f64, value_i64, value_str};

pub const STATUSES: &[&str] = &[
    "aberto",
    "enviado",
    "em_analise",
    "aprovado",
    "recusado",
    "concluido",
    "cancelado",
];

pub fn allowed_next(from: &str) -> &'static [&'static str] {
    match from {
        "aberto" => &["enviado", "cancelado"],
        "enviado" => &["em_analise"],
        "em_analise" => &["aprovado", "recusado"],
        "aprovado" | "recusado" => &["concluido"],
        _ => &[],
    }
}

/// Completed fraction of the pipeline, for progress bars.
pub fn progress(status: &str) -> f64 {
    let step = match status {
        "enviado" => 1.0,
        "em_analise" => 2.0,
        "aprovado" | "recusado" => 3.0,
        "concluido" => 4.0,
        _ => 0.0,
    };
    step / 4.0
}

struct RmaRow {
    loja_id: String,
    product_id: String,
    quantity: i64,
    status: String,
    source_return_id: Option<String>,
}

fn load_rma(conn: &Connection, id: &str) -> Result<RmaRow, String> {
    conn.query_row(
        "SELECT loja_id, product_id, quantity, status, source_return_id FROM rmas WHERE id = ?1",
        params![id],
        |row| {
            Ok(RmaRow {
                loja_id: row.get(0)?,
                product_id: row.get(1)?,
                quantity: row.get(2)?,
                status: row.get(3)?,
                source_return_id: row.get(4)?,
            })
        },
    )
    .map_err(|_| format!("RMA not found: {id}"))
}

/// Units that must leave stock when the RMA ships. Units from a customer
/// return that were never restocked are already off the shelf, unless an
/// earlier shipment from the same return used them up.
fn units_to_ship(conn: &Connection, id: &str, rma: &RmaRow) -> Result<i64, String> {
    let Some(ref return_id) = rma.source_return_id else {
        return Ok(rma.quantity);
    };
    let (held, shipped): (i64, i64) = conn
        .query_row(
            "SELECT
                (SELECT COALESCE(SUM(quantity), 0) FROM return_items
                 WHERE return_id = ?1 AND product_id = ?2 AND restock = 0),
                (SELECT COALESCE(SUM(quantity), 0) FROM rmas
                 WHERE source_return_id = ?1 AND product_id = ?2
                   AND id != ?3 AND sent_at IS NOT NULL)",
            params![return_id, rma.product_id, id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|e| format!("read held units: {e}"))?;
    let still_held = (held - shipped).max(0);
    Ok(rma.quantity - still_held.min(rma.quantity))
}

/// Units of `product_id` on a completed return not yet claimed by an RMA.
fn unclaimed_return_units(conn: &Connection, return_id: &str, product_id: &str) -> Result<i64, String> {
    let status: String = conn
        .query_row("SELECT status FROM returns WHERE id = ?1", params![return_id], |row| row.get(0))
        .optional()
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("Return not found: {return_id}"))?;
    if status != "concluida" && status != "concluida_com_credito" {
        return Err(format!("Return {return_id} is not completed (status: {status})"));
    }
    let (returned, claimed): (Option<i64>, i64) = conn
        .query_row(
            "SELECT
                (SELECT SUM(quantity) FROM return_items WHERE return_id = ?1 AND product_id = ?2),
                (SELECT COALESCE(SUM(quantity), 0) FROM rmas
                 WHERE source_return_id = ?1 AND product_id = ?2 AND status != 'cancelado')",
            params![return_id, product_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|e| format!("read returned units: {e}"))?;
    let returned = returned.ok_or_else(|| format!("Return {return_id} has no units of product {product_id}"))?;
    Ok(returned - claimed)
}

fn rma_id(payload: &Value) -> Result<String, String> {
    value_str(payload, &["rmaId", "rma_id", "id"]).ok_or_else(|| "Missing required field: rmaId".to_string())
}

pub fn create_rma(db: &DbState, payload: &Value) -> Result<Value, String> {
    let loja_id = value_str(payload, &["lojaId", "loja_id"]).ok_or("Missing required field: lojaId")?;
    let supplier_id =
        value_str(payload, &["supplierId", "supplier_id"]).ok_or("Missing required field: supplierId")?;
    let product_id =
        value_str(payload, &["productId", "product_id"]).ok_or("Missing required field: productId")?;
    let quantity = value_i64(payload, &["quantity"]).unwrap_or(1);
    let defect = value_str(payload, &["defect"]).ok_or("Missing required field: defect")?;
    let source_return_id = value_str(payload, &["sourceReturnId", "source_return_id"]);
    let staff_id = value_str(payload, &["staffId", "staff_id"]);

    if quantity < 1 {
        return Err("RMA quantity must be at least 1".into());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let id = uuid::Uuid::new_v4().to_string();
    let rma = db::in_transaction(&conn, |conn| {
        require_row(conn, "lojas", &loja_id)?;
        require_row(conn, "suppliers", &supplier_id)?;
        require_row(conn, "products", &product_id)?;
        if let Some(ref rid) = source_return_id {
            let available = unclaimed_return_units(conn, rid, &product_id)?;
            if available < quantity {
                return Err(format!(
                    "RMA quantity exceeds returned units: available {available}, requested {quantity}"
                ));
            }
        }

        let now = now_iso();
        conn.execute(
            "INSERT INTO rmas (id, loja_id, supplier_id, product_id, quantity, defect,
                               source_return_id, status, staff_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'aberto', ?8, ?9, ?9)",
            params![id, loja_id, supplier_id, product_id, quantity, defect, source_return_id, staff_id, now],
        )
        .map_err(|e| format!("insert rma: {e}"))?;
        record_status_change(conn, "rma", &id, None, "aberto", None, staff_id.as_deref())?;
        enqueue_row(conn, "rmas", &id, "insert")?;
        rma_detail(conn, &id)
    })?;

    info!(rma_id = %id, supplier_id = %supplier_id, quantity, "rma opened");
    Ok(rma)
}

/// Move an RMA one step along its pipeline.
pub fn advance_rma(db: &DbState, payload: &Value) -> Result<Value, String> {
    let id = rma_id(payload)?;
    let status = value_str(payload, &["status"]).ok_or("Missing required field: status")?;
    let note = value_str(payload, &["note"]);
    let resolution = value_str(payload, &["resolution"]);
    let credit_amount = value_f64(payload, &["creditAmount", "credit_amount"]);
    let staff_id = value_str(payload, &["staffId", "staff_id"]);

    if !STATUSES.contains(&status.as_str()) {
        return Err(format!("Invalid RMA status: {status}"));
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let rma = db::in_transaction(&conn, |conn| {
        let current = load_rma(conn, &id)?;
        if !allowed_next(&current.status).contains(&status.as_str()) {
            return Err(format!("Invalid RMA transition: {} -> {status}", current.status));
        }
        let now = now_iso();
        let stock = |delta: i64, reason: &str| -> Result<i64, String> {
            apply_stock_movement(
                conn,
                &StockChange {
                    loja_id: &current.loja_id,
                    product_id: &current.product_id,
                    delta,
                    reason,
                    reference_type: Some("rma"),
                    reference_id: Some(&id),
                    note: note.as_deref(),
                    staff_id: staff_id.as_deref(),
                },
            )
        };

        match status.as_str() {
            "enviado" => {
                let units = units_to_ship(conn, &id, &current)?;
                if units > 0 {
                    stock(-units, "rma_out")?;
                }
                conn.execute(
                    "UPDATE rmas SET sent_at = ?1 WHERE id = ?2",
                    params![now, id],
                )
                .map_err(|e| format!("update rma: {e}"))?;
            }
            "concluido" => {
                let resolution = if current.status == "recusado" {
                    match resolution.as_deref() {
                        None | Some("devolvido_sem_troca") => "devolvido_sem_troca",
                        Some(other) => {
                            return Err(format!("A refused RMA concludes as devolvido_sem_troca, not {other}"))
                        }
                    }
                } else {
                    match resolution.as_deref() {
                        Some("substituicao") => {
                            stock(current.quantity, "rma_in")?;
                            "substituicao"
                        }
                        Some("credito_fornecedor") => {
                            let cents = credit_amount.map(to_cents).unwrap_or(0);
                            if cents <= 0 {
                                return Err("credito_fornecedor requires a positive creditAmount".into());
                            }
                            conn.execute(
                                "UPDATE rmas SET credit_amount = ?1 WHERE id = ?2",
                                params![from_cents(cents), id],
                            )
                            .map_err(|e| format!("update rma: {e}"))?;
                            "credito_fornecedor"
                        }
                        _ => {
                            return Err(
                                "An approved RMA concludes as substituicao or credito_fornecedor".into()
                            )
                        }
                    }
                };
                conn.execute(
                    "UPDATE rmas SET resolution = ?1, concluded_at = ?2 WHERE id = ?3",
                    params![resolution, now, id],
                )
                .map_err(|e| format!("update rma: {e}"))?;
            }
            _ => {}
        }

        conn.execute(
            "UPDATE rmas SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status, now, id],
        )
        .map_err(|e| format!("update rma status: {e}"))?;
        record_status_change(conn, "rma", &id, Some(&current.status), &status, note.as_deref(), staff_id.as_deref())?;
        enqueue_row(conn, "rmas", &id, "update")?;
        rma_detail(conn, &id)
    })?;

    info!(rma_id = %id, status = %status, "rma advanced");
    Ok(rma)
}

fn rma_detail(conn: &Connection, id: &str) -> Result<Value, String> {
    let mut rma = query_one_json(
        conn,
        "SELECT r.*, s.name AS supplier_name, p.sku, p.name AS product_name
         FROM rmas r
         JOIN suppliers s ON s.id = r.supplier_id
         JOIN products p ON p.id = r.product_id
         WHERE r.id = ?1",
        params![id],
    )?;
    if rma.is_null() {
        return Err(format!("RMA not found: {id}"));
    }
    let status = rma["status"].as_str().unwrap_or_default().to_string();
    rma["progress"] = serde_json::json!(progress(&status));
    rma["history"] = Value::Array(load_status_history(conn, "rma", id)?);
    Ok(rma)
}

pub fn get_rma(db: &DbState, payload: &Value) -> Result<Value, String> {
    let id = rma_id(payload)?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    rma_detail(&conn, &id)
}

pub fn list_rmas(db: &DbState, payload: &Value) -> Result<Value, String> {
    let loja_id = value_str(payload, &["lojaId", "loja_id"]);
    let status = value_str(payload, &["status"]);
    let limit = value_i64(payload, &["limit"]).unwrap_or(100).clamp(1, 1000);
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut rows = query_all_json(
        &conn,
        "SELECT r.*, s.name AS supplier_name
         FROM rmas r JOIN suppliers s ON s.id = r.supplier_id
         WHERE (?1 IS NULL OR r.loja_id = ?1) AND (?2 IS NULL OR r.status = ?2)
         ORDER BY r.created_at DESC, r.rowid DESC
         LIMIT ?3",
        params![loja_id, status, limit],
    )?;
    for row in rows.iter_mut() {
        let status = row["status"].as_str().unwrap_or_default().to_string();
        row["progress"] = serde_json::json!(progress(&status));
    }
    Ok(Value::Array(rows))
}
