//! Caixa (cash register session) lifecycle.
//!
//! One open session per loja, enforced by a partial unique index. Every
//! cash in/out is a row in `cash_movements`; the expected drawer amount is
//! always re-derived from that ledger, never kept as a running total.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{info, warn};

use crate::data_helpers::{query_all_json, query_one_json, record_status_change, require_row};
use crate::db::{self, DbState};
use crate::money::{from_cents, to_cents};
use crate::sync::enqueue_row;
use crate::{now_iso, value_f64, value_i64, value_str};

/// Movement types that add cash to the drawer.
const INFLOW_TYPES: &[&str] = &["sale", "service_order", "suprimento"];
/// Movement types that take cash out of the drawer.
const OUTFLOW_TYPES: &[&str] = &["sangria", "refund", "estorno"];

// ---------------------------------------------------------------------------
// Internal helpers (used by sales, returns and service orders)
// ---------------------------------------------------------------------------

pub(crate) fn open_session_id(conn: &Connection, loja_id: &str) -> Result<Option<String>, String> {
    conn.query_row(
        "SELECT id FROM cash_sessions WHERE loja_id = ?1 AND status = 'aberto'",
        params![loja_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| format!("read open caixa: {e}"))
}

pub(crate) fn require_open_session(conn: &Connection, loja_id: &str) -> Result<String, String> {
    open_session_id(conn, loja_id)?
        .ok_or_else(|| format!("No open caixa for loja {loja_id}"))
}

/// Expected cash in the drawer: opening + inflows - outflows.
pub(crate) fn expected_cents(conn: &Connection, session_id: &str) -> Result<i64, String> {
    let opening: f64 = conn
        .query_row(
            "SELECT opening_amount FROM cash_sessions WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .map_err(|_| format!("Cash session not found: {session_id}"))?;

    let mut stmt = conn
        .prepare(
            "SELECT movement_type, COALESCE(SUM(amount), 0)
             FROM cash_movements WHERE session_id = ?1 GROUP BY movement_type",
        )
        .map_err(|e| e.to_string())?;
    let rows = stmt
        .query_map(params![session_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })
        .map_err(|e| e.to_string())?;

    let totals = rows
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("read cash movements: {e}"))?;
    let mut expected = to_cents(opening);
    for (movement_type, sum) in totals {
        if INFLOW_TYPES.contains(&movement_type.as_str()) {
            expected += to_cents(sum);
        } else if OUTFLOW_TYPES.contains(&movement_type.as_str()) {
            expected -= to_cents(sum);
        }
    }
    Ok(expected)
}

/// Write a ledger row into an open session.
#[allow(clippy::too_many_arguments)]
pub(crate) fn record_movement(
    conn: &Connection,
    session_id: &str,
    movement_type: &str,
    amount_cents: i64,
    reference_type: Option<&str>,
    reference_id: Option<&str>,
    note: Option<&str>,
    staff_id: Option<&str>,
) -> Result<String, String> {
    if !INFLOW_TYPES.contains(&movement_type) && !OUTFLOW_TYPES.contains(&movement_type) {
        return Err(format!("Invalid cash movement type: {movement_type}"));
    }
    if amount_cents <= 0 {
        return Err("Cash movement amount must be positive".into());
    }
    let status: String = conn
        .query_row(
            "SELECT status FROM cash_sessions WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .map_err(|_| format!("Cash session not found: {session_id}"))?;
    if status != "aberto" {
        return Err("Cash session is closed".into());
    }
    if OUTFLOW_TYPES.contains(&movement_type) {
        let available = expected_cents(conn, session_id)?;
        if amount_cents > available {
            return Err(format!(
                "Not enough cash in drawer for {movement_type}: available {:.2}, requested {:.2}",
                from_cents(available),
                from_cents(amount_cents)
            ));
        }
    }

    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO cash_movements (id, session_id, movement_type, amount, reference_type,
                                     reference_id, note, staff_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id,
            session_id,
            movement_type,
            from_cents(amount_cents),
            reference_type,
            reference_id,
            note,
            staff_id,
            now_iso()
        ],
    )
    .map_err(|e| format!("insert cash movement: {e}"))?;
    enqueue_row(conn, "cash_movements", &id, "insert")?;
    Ok(id)
}

// ---------------------------------------------------------------------------
// Open
// ---------------------------------------------------------------------------

pub fn open_cash_session(db: &DbState, payload: &Value) -> Result<Value, String> {
    let loja_id = value_str(payload, &["lojaId", "loja_id"]).ok_or("Missing required field: lojaId")?;
    let opening = value_f64(payload, &["openingAmount", "opening_amount"]).unwrap_or(0.0);
    let staff_id = value_str(payload, &["staffId", "staff_id"]);
    let note = value_str(payload, &["note"]);

    if opening < 0.0 {
        return Err("Opening amount cannot be negative".into());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let id = uuid::Uuid::new_v4().to_string();
    let session = db::in_transaction(&conn, |conn| {
        require_row(conn, "lojas", &loja_id)?;
        if let Some(existing) = open_session_id(conn, &loja_id)? {
            return Err(format!("Loja already has an open caixa ({existing})"));
        }

        let now = now_iso();
        conn.execute(
            "INSERT INTO cash_sessions (id, loja_id, opened_by, opening_amount, status, note,
                                        opened_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'aberto', ?5, ?6, ?6, ?6)",
            params![id, loja_id, staff_id, from_cents(to_cents(opening)), note, now],
        )
        .map_err(|e| format!("insert cash session: {e}"))?;
        record_status_change(conn, "cash_session", &id, None, "aberto", note.as_deref(), staff_id.as_deref())?;
        enqueue_row(conn, "cash_sessions", &id, "insert")?;
        query_one_json(conn, "SELECT * FROM cash_sessions WHERE id = ?1", params![id])
    })?;

    info!(session_id = %id, loja_id = %loja_id, opening, "caixa opened");
    Ok(session)
}

// ---------------------------------------------------------------------------
// Sangria / suprimento
// ---------------------------------------------------------------------------

pub fn add_cash_movement(db: &DbState, payload: &Value) -> Result<Value, String> {
    let session_id =
        value_str(payload, &["sessionId", "session_id"]).ok_or("Missing required field: sessionId")?;
    let movement_type = value_str(payload, &["type", "movementType", "movement_type"])
        .ok_or("Missing required field: type")?;
    let amount = value_f64(payload, &["amount"]).ok_or("Missing required field: amount")?;
    let note = value_str(payload, &["note"]);
    let staff_id = value_str(payload, &["staffId", "staff_id"]);

    if movement_type != "sangria" && movement_type != "suprimento" {
        return Err(format!(
            "Movement type {movement_type} is recorded by its workflow"
        ));
    }
    let amount_cents = to_cents(amount);
    if amount_cents <= 0 {
        return Err("Amount must be positive".into());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let (movement_id, expected) = db::in_transaction(&conn, |conn| {
        if movement_type == "sangria" {
            let expected = expected_cents(conn, &session_id)?;
            if amount_cents > expected {
                return Err(format!(
                    "Sangria exceeds cash in drawer: available {:.2}, requested {:.2}",
                    from_cents(expected),
                    from_cents(amount_cents)
                ));
            }
        }
        let id = record_movement(
            conn,
            &session_id,
            &movement_type,
            amount_cents,
            None,
            None,
            note.as_deref(),
            staff_id.as_deref(),
        )?;
        Ok((id, expected_cents(conn, &session_id)?))
    })?;

    info!(session_id = %session_id, movement_type = %movement_type, amount, "cash movement recorded");
    Ok(serde_json::json!({
        "success": true,
        "movementId": movement_id,
        "expectedAmount": from_cents(expected),
    }))
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

pub fn get_active_session(db: &DbState, payload: &Value) -> Result<Value, String> {
    let loja_id = value_str(payload, &["lojaId", "loja_id"]).ok_or("Missing required field: lojaId")?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let Some(id) = open_session_id(&conn, &loja_id)? else {
        return Ok(Value::Null);
    };
    let mut session = query_one_json(&conn, "SELECT * FROM cash_sessions WHERE id = ?1", params![id])?;
    session["expected_amount"] = serde_json::json!(from_cents(expected_cents(&conn, &id)?));
    Ok(session)
}

pub(crate) fn session_summary(conn: &Connection, session_id: &str) -> Result<Value, String> {
    let session = query_one_json(
        conn,
        "SELECT * FROM cash_sessions WHERE id = ?1",
        params![session_id],
    )?;
    if session.is_null() {
        return Err(format!("Cash session not found: {session_id}"));
    }

    let mut by_type = serde_json::Map::new();
    for t in INFLOW_TYPES.iter().chain(OUTFLOW_TYPES.iter()) {
        by_type.insert((*t).to_string(), serde_json::json!(0.0));
    }
    {
        let mut stmt = conn
            .prepare(
                "SELECT movement_type, COALESCE(SUM(amount), 0), COUNT(*)
                 FROM cash_movements WHERE session_id = ?1 GROUP BY movement_type",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })
            .map_err(|e| e.to_string())?;
        for (t, sum) in rows.flatten() {
            by_type.insert(t, serde_json::json!(from_cents(to_cents(sum))));
        }
    }

    // Payments of sales / service orders settled while this caixa was open
    let mut by_method = serde_json::Map::new();
    {
        let mut stmt = conn
            .prepare(
                "SELECT p.method, COALESCE(SUM(p.amount), 0)
                 FROM payments p
                 LEFT JOIN sales s ON p.reference_type = 'sale' AND s.id = p.reference_id
                 LEFT JOIN service_orders o ON p.reference_type = 'service_order' AND o.id = p.reference_id
                 WHERE (s.cash_session_id = ?1 AND s.status != 'cancelada')
                    OR o.cash_session_id = ?1
                 GROUP BY p.method",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })
            .map_err(|e| e.to_string())?;
        for (method, sum) in rows.flatten() {
            by_method.insert(method, serde_json::json!(from_cents(to_cents(sum))));
        }
    }

    let sales_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sales WHERE cash_session_id = ?1 AND status != 'cancelada'",
            params![session_id],
            |row| row.get(0),
        )
        .unwrap_or(0);

    let movements = query_all_json(
        conn,
        "SELECT id, movement_type, amount, reference_type, reference_id, note, staff_id, created_at
         FROM cash_movements WHERE session_id = ?1 ORDER BY created_at, rowid",
        params![session_id],
    )?;

    Ok(serde_json::json!({
        "session": session,
        "totalsByType": Value::Object(by_type),
        "salesByMethod": Value::Object(by_method),
        "salesCount": sales_count,
        "expectedAmount": from_cents(expected_cents(conn, session_id)?),
        "movements": movements,
    }))
}

pub fn get_session_summary(db: &DbState, payload: &Value) -> Result<Value, String> {
    let session_id =
        value_str(payload, &["sessionId", "session_id"]).ok_or("Missing required field: sessionId")?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    session_summary(&conn, &session_id)
}

// ---------------------------------------------------------------------------
// Close
// ---------------------------------------------------------------------------

/// Reconcile and close. Variance is counted minus expected.
pub fn close_cash_session(db: &DbState, payload: &Value) -> Result<Value, String> {
    let session_id =
        value_str(payload, &["sessionId", "session_id"]).ok_or("Missing required field: sessionId")?;
    let counted = value_f64(payload, &["countedAmount", "counted_amount"])
        .ok_or("Missing required field: countedAmount")?;
    let note = value_str(payload, &["note"]);
    let staff_id = value_str(payload, &["staffId", "staff_id"]);

    if counted < 0.0 {
        return Err("Counted amount cannot be negative".into());
    }
    let counted_cents = to_cents(counted);

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let summary = db::in_transaction(&conn, |conn| {
        let status: String = conn
            .query_row(
                "SELECT status FROM cash_sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .map_err(|_| format!("Cash session not found: {session_id}"))?;
        if status != "aberto" {
            return Err("Cash session is already closed".into());
        }

        let expected = expected_cents(conn, &session_id)?;
        let variance = counted_cents - expected;
        let now = now_iso();
        conn.execute(
            "UPDATE cash_sessions
             SET status = 'fechado', closed_by = ?1, expected_amount = ?2, counted_amount = ?3,
                 variance = ?4, note = COALESCE(?5, note), closed_at = ?6, updated_at = ?6
             WHERE id = ?7",
            params![
                staff_id,
                from_cents(expected),
                from_cents(counted_cents),
                from_cents(variance),
                note,
                now,
                session_id
            ],
        )
        .map_err(|e| format!("close cash session: {e}"))?;
        record_status_change(
            conn,
            "cash_session",
            &session_id,
            Some("aberto"),
            "fechado",
            note.as_deref(),
            staff_id.as_deref(),
        )?;
        enqueue_row(conn, "cash_sessions", &session_id, "update")?;

        if variance != 0 {
            warn!(
                session_id = %session_id,
                expected = from_cents(expected),
                counted = from_cents(counted_cents),
                variance = from_cents(variance),
                "caixa closed with variance"
            );
        }
        session_summary(conn, &session_id)
    })?;

    info!(session_id = %session_id, "caixa closed");
    Ok(summary)
}

pub fn list_sessions(db: &DbState, payload: &Value) -> Result<Value, String> {
    let loja_id = value_str(payload, &["lojaId", "loja_id"]).ok_or("Missing required field: lojaId")?;
    let limit = value_i64(payload, &["limit"]).unwrap_or(30).clamp(1, 365);
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let rows = query_all_json(
        &conn,
        "SELECT * FROM cash_sessions WHERE loja_id = ?1 ORDER BY opened_at DESC LIMIT ?2",
        params![loja_id, limit],
    )?;
    Ok(Value::Array(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::test_support::seed_loja;
    use serde_json::json;

    fn open(db: &DbState, loja: &str, amount: f64) -> String {
        open_cash_session(db, &json!({ "lojaId": loja, "openingAmount": amount, "staffId": "st1" }))
            .unwrap()["id"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn only_one_open_caixa_per_loja() {
        let db = db::test_state();
        seed_loja(&db, "l1");
        seed_loja(&db, "l2");
        open(&db, "l1", 100.0);
        let err = open_cash_session(&db, &json!({ "lojaId": "l1" })).unwrap_err();
        assert!(err.starts_with("Loja already has an open caixa"));
        open(&db, "l2", 0.0);
    }

    #[test]
    fn sangria_cannot_exceed_expected() {
        let db = db::test_state();
        seed_loja(&db, "l1");
        let sid = open(&db, "l1", 100.0);
        add_cash_movement(&db, &json!({ "sessionId": sid, "type": "suprimento", "amount": 50 }))
            .unwrap();
        let err = add_cash_movement(
            &db,
            &json!({ "sessionId": sid, "type": "sangria", "amount": 150.01 }),
        )
        .unwrap_err();
        assert!(err.starts_with("Sangria exceeds cash in drawer"));

        let res = add_cash_movement(&db, &json!({ "sessionId": sid, "type": "sangria", "amount": 150 }))
            .unwrap();
        assert_eq!(res["expectedAmount"], 0.0);

        let err = add_cash_movement(&db, &json!({ "sessionId": sid, "type": "sale", "amount": 1 }))
            .unwrap_err();
        assert!(err.contains("recorded by its workflow"));
    }

    #[test]
    fn cash_outflows_cannot_exceed_drawer() {
        let db = db::test_state();
        seed_loja(&db, "l1");
        let sid = open(&db, "l1", 10.0);
        let conn = db.conn.lock().unwrap();
        let err = record_movement(&conn, &sid, "refund", 1_001, Some("return"), Some("r1"), None, None).unwrap_err();
        assert_eq!(err, "Not enough cash in drawer for refund: available 10.00, requested 10.01");
        record_movement(&conn, &sid, "estorno", 1_000, Some("sale"), Some("s1"), None, None).unwrap();
        assert_eq!(expected_cents(&conn, &sid).unwrap(), 0);
        assert!(record_movement(&conn, &sid, "estorno", 1, Some("sale"), Some("s2"), None, None).is_err());
    }

    #[test]
    fn close_reconciles_from_ledger() {
        let db = db::test_state();
        seed_loja(&db, "l1");
        let sid = open(&db, "l1", 100.0);
        {
            let conn = db.conn.lock().unwrap();
            record_movement(&conn, &sid, "sale", 8_990, Some("sale"), Some("s1"), None, None).unwrap();
            record_movement(&conn, &sid, "refund", 1_000, Some("return"), Some("r1"), None, None).unwrap();
            record_movement(&conn, &sid, "estorno", 500, Some("sale"), Some("s2"), None, None).unwrap();
        }
        add_cash_movement(&db, &json!({ "sessionId": sid, "type": "sangria", "amount": 20 })).unwrap();
        add_cash_movement(&db, &json!({ "sessionId": sid, "type": "suprimento", "amount": 5 })).unwrap();

        // 100 + 89.90 + 5 - 20 - 10 - 5 = 159.90
        let summary = close_cash_session(
            &db,
            &json!({ "sessionId": sid, "countedAmount": 158.90, "staffId": "st1" }),
        )
        .unwrap();
        assert_eq!(summary["expectedAmount"], 159.9);
        assert_eq!(summary["session"]["status"], "fechado");
        assert_eq!(summary["session"]["variance"], -1.0);
        assert_eq!(summary["totalsByType"]["sale"], 89.9);

        let err = close_cash_session(&db, &json!({ "sessionId": sid, "countedAmount": 1 })).unwrap_err();
        assert_eq!(err, "Cash session is already closed");
        let err = add_cash_movement(&db, &json!({ "sessionId": sid, "type": "suprimento", "amount": 1 }))
            .unwrap_err();
        assert_eq!(err, "Cash session is closed");
    }

    #[test]
    fn active_session_and_listing() {
        let db = db::test_state();
        seed_loja(&db, "l1");
        assert!(get_active_session(&db, &json!({ "lojaId": "l1" })).unwrap().is_null());
        let sid = open(&db, "l1", 42.5);
        let active = get_active_session(&db, &json!({ "lojaId": "l1" })).unwrap();
        assert_eq!(active["id"], sid.as_str());
        assert_eq!(active["expected_amount"], 42.5);
        let list = list_sessions(&db, &json!({ "lojaId": "l1" })).unwrap();
        assert_eq!(list.as_array().unwrap().len(), 1);
    }
}
