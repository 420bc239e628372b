//! Customers and the store-credit ledger.
//!
//! The balance is always `SUM(credit_entries.amount)`: issues are positive,
//! redemptions negative, reversals carry whichever sign undoes the original.

use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::info;

use crate::data_helpers::{normalize_phone, query_all_json, query_one_json, require_row};
use crate::db::{self, DbState};
use crate::money::{from_cents, to_cents};
use crate::sync::enqueue_row;
use crate::{now_iso, value_str};

pub fn create_customer(db: &DbState, payload: &Value) -> Result<Value, String> {
    let name = value_str(payload, &["name"]).ok_or("Missing required field: name")?;
    let phone = value_str(payload, &["phone"])
        .map(|p| normalize_phone(&p))
        .filter(|p| !p.is_empty());
    let email = value_str(payload, &["email"]).map(|e| e.to_ascii_lowercase());
    let document = value_str(payload, &["document", "cpf"]).map(|d| normalize_phone(&d));
    let notes = value_str(payload, &["notes"]);

    if let Some(ref e) = email {
        if !e.contains('@') {
            return Err(format!("Invalid email: {e}"));
        }
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let id = uuid::Uuid::new_v4().to_string();
    let customer = db::in_transaction(&conn, |conn| {
        let now = now_iso();
        conn.execute(
            "INSERT INTO customers (id, name, phone, email, document, notes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![id, name, phone, email, document, notes, now],
        )
        .map_err(|e| format!("insert customer: {e}"))?;
        enqueue_row(conn, "customers", &id, "insert")?;
        query_one_json(conn, "SELECT * FROM customers WHERE id = ?1", params![id])
    })?;

    info!(customer_id = %id, "customer created");
    Ok(customer)
}

// ---------------------------------------------------------------------------
// Credit ledger
// ---------------------------------------------------------------------------

pub(crate) fn credit_balance_cents(conn: &Connection, customer_id: &str) -> Result<i64, String> {
    let total: f64 = conn
        .query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM credit_entries WHERE customer_id = ?1",
            params![customer_id],
            |row| row.get(0),
        )
        .map_err(|e| format!("credit balance: {e}"))?;
    Ok(to_cents(total))
}

fn insert_entry(
    conn: &Connection,
    customer_id: &str,
    entry_type: &str,
    amount_cents: i64,
    reference_type: &str,
    reference_id: &str,
    note: Option<&str>,
) -> Result<String, String> {
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO credit_entries (id, customer_id, entry_type, amount, reference_type, reference_id, note, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id,
            customer_id,
            entry_type,
            from_cents(amount_cents),
            reference_type,
            reference_id,
            note,
            now_iso()
        ],
    )
    .map_err(|e| format!("insert credit entry: {e}"))?;
    enqueue_row(conn, "credit_entries", &id, "insert")?;
    Ok(id)
}

/// Grant store credit (e.g. a return completed as credit).
pub(crate) fn issue_credit(
    conn: &Connection,
    customer_id: &str,
    amount_cents: i64,
    reference_type: &str,
    reference_id: &str,
) -> Result<String, String> {
    if amount_cents <= 0 {
        return Err("Credit amount must be positive".into());
    }
    require_row(conn, "customers", customer_id)?;
    let id = insert_entry(
        conn,
        customer_id,
        "issue",
        amount_cents,
        reference_type,
        reference_id,
        None,
    )?;
    info!(customer_id = %customer_id, amount_cents, "store credit issued");
    Ok(id)
}

/// Spend store credit. Never takes the balance below zero.
pub(crate) fn redeem_credit(
    conn: &Connection,
    customer_id: &str,
    amount_cents: i64,
    reference_type: &str,
    reference_id: &str,
) -> Result<String, String> {
    if amount_cents <= 0 {
        return Err("Redeem amount must be positive".into());
    }
    let balance = credit_balance_cents(conn, customer_id)?;
    if amount_cents > balance {
        return Err(format!(
            "Insufficient store credit: available {:.2}, requested {:.2}",
            from_cents(balance),
            from_cents(amount_cents)
        ));
    }
    insert_entry(
        conn,
        customer_id,
        "redeem",
        -amount_cents,
        reference_type,
        reference_id,
        None,
    )
}

/// Undo an earlier entry with a signed counter-entry.
pub(crate) fn reverse_credit(
    conn: &Connection,
    customer_id: &str,
    amount_cents: i64,
    reference_type: &str,
    reference_id: &str,
    note: &str,
) -> Result<String, String> {
    if amount_cents == 0 {
        return Err("Reversal amount cannot be zero".into());
    }
    if amount_cents < 0 && credit_balance_cents(conn, customer_id)? + amount_cents < 0 {
        return Err("Reversal would make the store credit balance negative".into());
    }
    insert_entry(
        conn,
        customer_id,
        "reversal",
        amount_cents,
        reference_type,
        reference_id,
        Some(note),
    )
}

pub fn get_credit_balance(db: &DbState, payload: &Value) -> Result<Value, String> {
    let customer_id = value_str(payload, &["customerId", "customer_id"])
        .ok_or("Missing required field: customerId")?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    require_row(&conn, "customers", &customer_id)?;
    let balance = credit_balance_cents(&conn, &customer_id)?;
    Ok(serde_json::json!({
        "customerId": customer_id,
        "balance": from_cents(balance),
    }))
}

pub fn list_credit_entries(db: &DbState, payload: &Value) -> Result<Value, String> {
    let customer_id = value_str(payload, &["customerId", "customer_id"])
        .ok_or("Missing required field: customerId")?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let rows = query_all_json(
        &conn,
        "SELECT * FROM credit_entries WHERE customer_id = ?1 ORDER BY created_at, rowid",
        params![customer_id],
    )?;
    Ok(Value::Array(rows))
}
