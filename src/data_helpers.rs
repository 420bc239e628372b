use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::warn;

use crate::now_iso;

/// Extract a column value from a row using SQLite's actual stored type.
/// Uses `get_ref` so REAL values like 100.0 stay floats in JSON.
pub(crate) fn row_value_at(row: &rusqlite::Row, idx: usize) -> Value {
    use rusqlite::types::ValueRef;
    match row.get_ref(idx) {
        Ok(ValueRef::Integer(v)) => Value::Number(serde_json::Number::from(v)),
        Ok(ValueRef::Real(v)) => serde_json::json!(v),
        Ok(ValueRef::Text(v)) => Value::String(String::from_utf8_lossy(v).into_owned()),
        Ok(ValueRef::Null) => Value::Null,
        Ok(ValueRef::Blob(_)) => Value::Null,
        Err(_) => Value::Null,
    }
}

fn column_names(stmt: &rusqlite::Statement) -> Vec<String> {
    (0..stmt.column_count())
        .map(|i| stmt.column_name(i).unwrap_or("?").to_string())
        .collect()
}

fn row_to_object(row: &rusqlite::Row, names: &[String]) -> Value {
    let mut obj = serde_json::Map::new();
    for (i, name) in names.iter().enumerate() {
        // Raw snake_case column names are kept as-is
        obj.insert(name.clone(), row_value_at(row, i));
    }
    Value::Object(obj)
}

/// Execute a query and return the first row as JSON, or null if not found.
pub(crate) fn query_one_json(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Value, String> {
    let mut stmt = conn.prepare(sql).map_err(|e| e.to_string())?;
    let names = column_names(&stmt);

    match stmt.query_row(params, |row| Ok(row_to_object(row, &names))) {
        Ok(v) => Ok(v),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(Value::Null),
        Err(e) => {
            warn!("row query error: {e}");
            Err(format!("row query: {e}"))
        }
    }
}

/// Execute a query and return every row as a JSON object.
pub(crate) fn query_all_json(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Value>, String> {
    let mut stmt = conn.prepare(sql).map_err(|e| e.to_string())?;
    let names = column_names(&stmt);

    let rows = stmt
        .query_map(params, |row| Ok(row_to_object(row, &names)))
        .map_err(|e| format!("rows query: {e}"))?;

    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Append a row to `status_history`.
pub(crate) fn record_status_change(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
    from_status: Option<&str>,
    to_status: &str,
    note: Option<&str>,
    staff_id: Option<&str>,
) -> Result<String, String> {
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO status_history (id, entity_type, entity_id, from_status, to_status, note, staff_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![id, entity_type, entity_id, from_status, to_status, note, staff_id, now_iso()],
    )
    .map_err(|e| format!("insert status_history: {e}"))?;
    Ok(id)
}

/// History rows for one entity, oldest first.
pub(crate) fn load_status_history(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Value>, String> {
    query_all_json(
        conn,
        "SELECT id, from_status, to_status, note, staff_id, created_at
         FROM status_history
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY created_at ASC, rowid ASC",
        params![entity_type, entity_id],
    )
}

/// Next per-loja sequence number for `sales` or `service_orders`.
pub(crate) fn next_number(conn: &Connection, table: &str, loja_id: &str) -> Result<i64, String> {
    let sql = match table {
        "sales" => "SELECT COALESCE(MAX(number), 0) + 1 FROM sales WHERE loja_id = ?1",
        "service_orders" => {
            "SELECT COALESCE(MAX(number), 0) + 1 FROM service_orders WHERE loja_id = ?1"
        }
        other => return Err(format!("no sequence for table {other}")),
    };
    conn.query_row(sql, params![loja_id], |row| row.get(0))
        .map_err(|e| format!("next number: {e}"))
}

pub(crate) fn require_row(conn: &Connection, table: &str, id: &str) -> Result<(), String> {
    let sql = format!("SELECT 1 FROM {table} WHERE id = ?1");
    conn.query_row(&sql, params![id], |_| Ok(()))
        .map_err(|_| format!("{} not found: {id}", table.trim_end_matches('s')))
}

pub(crate) fn normalize_phone(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        crate::db::run_migrations_for_test(&conn);
        conn
    }

    #[test]
    fn query_one_json_keeps_real_values_as_floats() {
        let conn = test_db();
        conn.execute(
            "INSERT INTO products (id, sku, name, sale_price, created_at, updated_at)
             VALUES ('p1', 'SKU1', 'Capa', 100.0, 'x', 'x')",
            [],
        )
        .unwrap();
        let row = query_one_json(&conn, "SELECT * FROM products WHERE id = ?1", params!["p1"])
            .unwrap();
        assert_eq!(row["sale_price"], serde_json::json!(100.0));
        assert!(row["sale_price"].is_f64());
        assert_eq!(row["min_stock"], serde_json::json!(0));
    }

    #[test]
    fn query_one_json_returns_null_when_missing() {
        let conn = test_db();
        let row = query_one_json(&conn, "SELECT * FROM products WHERE id = ?1", params!["nope"])
            .unwrap();
        assert!(row.is_null());
    }

    #[test]
    fn status_history_is_ordered() {
        let conn = test_db();
        record_status_change(&conn, "rma", "r1", None, "aberto", None, None).unwrap();
        record_status_change(&conn, "rma", "r1", Some("aberto"), "enviado", Some("correio"), None)
            .unwrap();
        let history = load_status_history(&conn, "rma", "r1").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["to_status"], "aberto");
        assert_eq!(history[1]["from_status"], "aberto");
        assert_eq!(history[1]["note"], "correio");
    }

    #[test]
    fn next_number_is_per_loja() {
        let conn = test_db();
        conn.execute_batch(
            "INSERT INTO lojas (id, name, created_at, updated_at) VALUES ('l1', 'A', 'x', 'x'), ('l2', 'B', 'x', 'x');
             INSERT INTO sales (id, number, loja_id, created_at, updated_at) VALUES ('s1', 1, 'l1', 'x', 'x'), ('s2', 2, 'l1', 'x', 'x');",
        )
        .unwrap();
        assert_eq!(next_number(&conn, "sales", "l1").unwrap(), 3);
        assert_eq!(next_number(&conn, "sales", "l2").unwrap(), 1);
        assert!(next_number(&conn, "products", "l1").is_err());
    }

    #[test]
    fn normalize_phone_strips_formatting() {
        assert_eq!(normalize_phone("(11) 98765-4321"), "11987654321");
    }
}
