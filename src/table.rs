//! Generic table access (`fetch_table` / `insert_table` / `update_table` /
//! `delete_table`).
//!
//! Reads are allowed on every mirrored table; writes only on catalog tables.
//! Workflow tables (sales, returns, caixa...) change only through their own
//! operations. Identifiers are never interpolated unless they match the
//! whitelist or `PRAGMA table_info`.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use serde_json::Value;
use tracing::info;

use crate::data_helpers::{query_all_json, query_one_json};
use crate::db::{self, DbState};
use crate::sync::{enqueue_row, SYNCED_TABLES};
use crate::{now_iso, value_bool, value_i64, value_str};

/// Tables writable through the generic helpers.
const CATALOG_TABLES: &[&str] = &["lojas", "customers", "suppliers", "products"];

/// Columns no caller may set directly.
const PROTECTED_COLUMNS: &[&str] = &["id", "created_at", "updated_at"];

const DEFAULT_FETCH_LIMIT: i64 = 100;
const MAX_FETCH_LIMIT: i64 = 1000;

fn readable_table(payload: &Value) -> Result<String, String> {
    let table = value_str(payload, &["table"]).ok_or("Missing required field: table")?;
    if !SYNCED_TABLES.contains(&table.as_str()) {
        return Err(format!("Unknown table: {table}"));
    }
    Ok(table)
}

fn writable_table(payload: &Value) -> Result<String, String> {
    let table = readable_table(payload)?;
    if !CATALOG_TABLES.contains(&table.as_str()) {
        return Err(format!(
            "Table {table} is managed by its workflow and cannot be written directly"
        ));
    }
    Ok(table)
}

pub(crate) fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, String> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(|e| e.to_string())?;
    let cols = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| e.to_string())?
        .filter_map(|r| r.ok())
        .collect();
    Ok(cols)
}

fn check_column(columns: &[String], table: &str, column: &str) -> Result<(), String> {
    if columns.iter().any(|c| c == column) {
        Ok(())
    } else {
        Err(format!("Unknown column {column} on {table}"))
    }
}

fn json_to_sql(column: &str, value: &Value) -> Result<SqlValue, String> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(SqlValue::Integer(i))
            } else {
                n.as_f64()
                    .map(SqlValue::Real)
                    .ok_or_else(|| format!("Invalid number for {column}"))
            }
        }
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        Value::Array(_) | Value::Object(_) => {
            Err(format!("Unsupported value for {column}: nested JSON"))
        }
    }
}

fn row_object(payload: &Value, keys: &[&str]) -> Result<serde_json::Map<String, Value>, String> {
    keys.iter()
        .find_map(|k| payload.get(*k).and_then(Value::as_object))
        .cloned()
        .ok_or_else(|| format!("Missing required field: {}", keys[0]))
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Rows of `table` matching equality `filters` (`null` means `IS NULL`).
pub fn fetch_table(db: &DbState, payload: &Value) -> Result<Value, String> {
    let table = readable_table(payload)?;
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let columns = table_columns(&conn, &table)?;

    let mut clauses: Vec<String> = Vec::new();
    let mut args: Vec<SqlValue> = Vec::new();
    if let Some(filters) = payload.get("filters").and_then(Value::as_object) {
        for (column, value) in filters {
            check_column(&columns, &table, column)?;
            if value.is_null() {
                clauses.push(format!("{column} IS NULL"));
            } else {
                args.push(json_to_sql(column, value)?);
                clauses.push(format!("{column} = ?{}", args.len()));
            }
        }
    }

    let mut sql = format!("SELECT * FROM {table}");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }

    if let Some(order_by) = value_str(payload, &["orderBy", "order_by"]) {
        check_column(&columns, &table, &order_by)?;
        let ascending = value_bool(payload, &["ascending"]).unwrap_or(true);
        sql.push_str(&format!(
            " ORDER BY {order_by} {}",
            if ascending { "ASC" } else { "DESC" }
        ));
    }

    let limit = value_i64(payload, &["limit"])
        .unwrap_or(DEFAULT_FETCH_LIMIT)
        .clamp(1, MAX_FETCH_LIMIT);
    let offset = value_i64(payload, &["offset"]).unwrap_or(0).max(0);
    sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));

    let rows = query_all_json(&conn, &sql, params_from_iter(args.iter()))?;
    Ok(Value::Array(rows))
}

/// Insert a catalog row. Generates `id` when missing and stamps timestamps.
pub fn insert_table(db: &DbState, payload: &Value) -> Result<Value, String> {
    let table = writable_table(payload)?;
    let row = row_object(payload, &["row", "data"])?;

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let columns = table_columns(&conn, &table)?;

    let id = row
        .get("id")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(String::from)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let now = now_iso();

    let mut names: Vec<String> = vec!["id".into()];
    let mut args: Vec<SqlValue> = vec![SqlValue::Text(id.clone())];
    for (column, value) in &row {
        if PROTECTED_COLUMNS.contains(&column.as_str()) {
            continue;
        }
        check_column(&columns, &table, column)?;
        names.push(column.clone());
        args.push(json_to_sql(column, value)?);
    }
    for stamp in ["created_at", "updated_at"] {
        if columns.iter().any(|c| c == stamp) {
            names.push(stamp.to_string());
            args.push(SqlValue::Text(now.clone()));
        }
    }

    let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        names.join(", "),
        placeholders.join(", ")
    );

    let stored = db::in_transaction(&conn, |conn| {
        conn.execute(&sql, params_from_iter(args.iter()))
            .map_err(|e| format!("insert {table}: {e}"))?;
        enqueue_row(conn, &table, &id, "insert")?;
        query_one_json(conn, &format!("SELECT * FROM {table} WHERE id = ?1"), params![id])
    })?;

    info!(table = %table, id = %id, "row inserted");
    Ok(stored)
}

/// Patch a catalog row and stamp `updated_at`.
pub fn update_table(db: &DbState, payload: &Value) -> Result<Value, String> {
    let table = writable_table(payload)?;
    let id = value_str(payload, &["id"]).ok_or("Missing required field: id")?;
    let patch = row_object(payload, &["patch", "data"])?;
    if patch.is_empty() {
        return Err("Nothing to update".into());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let columns = table_columns(&conn, &table)?;

    let mut sets: Vec<String> = Vec::new();
    let mut args: Vec<SqlValue> = Vec::new();
    for (column, value) in &patch {
        if PROTECTED_COLUMNS.contains(&column.as_str()) {
            return Err(format!("Column {column} cannot be updated"));
        }
        check_column(&columns, &table, column)?;
        args.push(json_to_sql(column, value)?);
        sets.push(format!("{column} = ?{}", args.len()));
    }
    if columns.iter().any(|c| c == "updated_at") {
        args.push(SqlValue::Text(now_iso()));
        sets.push(format!("updated_at = ?{}", args.len()));
    }
    args.push(SqlValue::Text(id.clone()));
    let sql = format!(
        "UPDATE {table} SET {} WHERE id = ?{}",
        sets.join(", "),
        args.len()
    );

    let stored = db::in_transaction(&conn, |conn| {
        let n = conn
            .execute(&sql, params_from_iter(args.iter()))
            .map_err(|e| format!("update {table}: {e}"))?;
        if n == 0 {
            return Err(format!("Row not found: {table}/{id}"));
        }
        enqueue_row(conn, &table, &id, "update")?;
        query_one_json(conn, &format!("SELECT * FROM {table} WHERE id = ?1"), params![id])
    })?;

    info!(table = %table, id = %id, "row updated");
    Ok(stored)
}

/// Delete a catalog row. Rows still referenced by workflow records fail
/// with the foreign-key error.
pub fn delete_table(db: &DbState, payload: &Value) -> Result<Value, String> {
    let table = writable_table(payload)?;
    let id = value_str(payload, &["id"]).ok_or("Missing required field: id")?;

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    db::in_transaction(&conn, |conn| {
        let n = conn
            .execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])
            .map_err(|e| format!("delete {table}: {e}"))?;
        if n == 0 {
            return Err(format!("Row not found: {table}/{id}"));
        }
        enqueue_row(conn, &table, &id, "delete")
    })?;

    info!(table = %table, id = %id, "row deleted");
    Ok(serde_json::json!({ "success": true, "id": id }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queued(db: &DbState, table: &str) -> Vec<String> {
        let conn = db.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT operation FROM sync_queue WHERE table_name = ?1 ORDER BY id")
            .unwrap();
        stmt.query_map(params![table], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn insert_generates_id_stamps_and_enqueues() {
        let db = db::test_state();
        let row = insert_table(
            &db,
            &json!({ "table": "suppliers", "row": { "name": "Distribuidora Sul", "phone": "1133334444" } }),
        )
        .unwrap();
        assert!(row["id"].as_str().is_some_and(|s| !s.is_empty()));
        assert!(row["created_at"].is_string());
        assert_eq!(row["name"], "Distribuidora Sul");
        assert_eq!(queued(&db, "suppliers"), vec!["insert"]);
    }

    #[test]
    fn insert_rejects_unknown_column_and_workflow_table() {
        let db = db::test_state();
        let err = insert_table(
            &db,
            &json!({ "table": "customers", "row": { "name": "Ana", "name; DROP TABLE sales": 1 } }),
        )
        .unwrap_err();
        assert!(err.starts_with("Unknown column"));

        let err = insert_table(&db, &json!({ "table": "sales", "row": { "number": 1 } })).unwrap_err();
        assert!(err.contains("managed by its workflow"));

        let err = fetch_table(&db, &json!({ "table": "staff" })).unwrap_err();
        assert_eq!(err, "Unknown table: staff");
    }

    #[test]
    fn fetch_filters_orders_and_limits() {
        let db = db::test_state();
        for (name, phone) in [("Bruno", Value::Null), ("Ana", json!("11")), ("Carla", json!("22"))] {
            insert_table(
                &db,
                &json!({ "table": "customers", "row": { "name": name, "phone": phone } }),
            )
            .unwrap();
        }

        let rows = fetch_table(
            &db,
            &json!({ "table": "customers", "orderBy": "name", "ascending": false, "limit": 2 }),
        )
        .unwrap();
        let names: Vec<&str> = rows
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["Carla", "Bruno"]);

        let rows = fetch_table(
            &db,
            &json!({ "table": "customers", "filters": { "phone": null } }),
        )
        .unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 1);
        assert_eq!(rows[0]["name"], "Bruno");

        let err = fetch_table(
            &db,
            &json!({ "table": "customers", "orderBy": "name desc; --" }),
        )
        .unwrap_err();
        assert!(err.starts_with("Unknown column"));
    }

    #[test]
    fn update_patches_and_protects_columns() {
        let db = db::test_state();
        let row = insert_table(
            &db,
            &json!({ "table": "lojas", "row": { "name": "Centro", "code": "CTR" } }),
        )
        .unwrap();
        let id = row["id"].as_str().unwrap().to_string();

        let updated = update_table(
            &db,
            &json!({ "table": "lojas", "id": id, "patch": { "phone": "1140028922" } }),
        )
        .unwrap();
        assert_eq!(updated["phone"], "1140028922");
        assert_eq!(updated["name"], "Centro");

        let err = update_table(
            &db,
            &json!({ "table": "lojas", "id": id, "patch": { "id": "other" } }),
        )
        .unwrap_err();
        assert_eq!(err, "Column id cannot be updated");

        let err = update_table(
            &db,
            &json!({ "table": "lojas", "id": "missing", "patch": { "name": "X" } }),
        )
        .unwrap_err();
        assert!(err.starts_with("Row not found"));
        assert_eq!(queued(&db, "lojas"), vec!["insert", "update"]);
    }

    #[test]
    fn delete_removes_row_and_enqueues() {
        let db = db::test_state();
        let row = insert_table(&db, &json!({ "table": "suppliers", "row": { "name": "X" } })).unwrap();
        let id = row["id"].as_str().unwrap();
        delete_table(&db, &json!({ "table": "suppliers", "id": id })).unwrap();
        assert_eq!(queued(&db, "suppliers"), vec!["insert", "delete"]);
        let rows = fetch_table(&db, &json!({ "table": "suppliers" })).unwrap();
        assert!(rows.as_array().unwrap().is_empty());
    }

    #[test]
    fn negative_price_violates_check() {
        let db = db::test_state();
        let err = insert_table(
            &db,
            &json!({ "table": "products", "row": { "sku": "X1", "name": "Cabo", "sale_price": -1.0 } }),
        )
        .unwrap_err();
        assert!(err.starts_with("insert products"));
    }
}
