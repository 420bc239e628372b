//! Local SQLite database layer for Loja Backoffice.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings helpers,
//! a transaction wrapper, and the shared state used by every service module.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
pub const CURRENT_SCHEMA_VERSION: i32 = 4;

const DB_FILE_NAME: &str = "backoffice.db";

/// Initialize the database at `{data_dir}/backoffice.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    // Integrity probe: a corrupt file usually fails here rather than at open.
    conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
        row.get::<_, i64>(0)
    })
    .map_err(|e| format!("sqlite probe: {e}"))?;

    Ok(conn)
}

/// Run `f` inside `BEGIN IMMEDIATE` / `COMMIT`, rolling back on error.
pub fn in_transaction<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<T, String>,
) -> Result<T, String> {
    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    match f(conn) {
        Ok(value) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current = schema_version(conn);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }
    if current < 4 {
        migrate_v4(conn)?;
    }

    Ok(())
}

/// Highest applied migration, 0 on a fresh database.
pub fn schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

/// Migration v1: settings, catalog, stock ledger, sync queue, status history.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- lojas (store locations)
        CREATE TABLE IF NOT EXISTS lojas (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT UNIQUE,
            address TEXT,
            phone TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- staff (PIN login)
        CREATE TABLE IF NOT EXISTS staff (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            role TEXT NOT NULL
                CHECK (role IN ('admin', 'gerente', 'vendedor', 'tecnico')),
            pin_hash TEXT NOT NULL,
            loja_id TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(loja_id) REFERENCES lojas(id) ON DELETE SET NULL
        );

        -- customers
        CREATE TABLE IF NOT EXISTS customers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            phone TEXT,
            email TEXT,
            document TEXT,
            notes TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- suppliers
        CREATE TABLE IF NOT EXISTS suppliers (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            contact_name TEXT,
            phone TEXT,
            email TEXT,
            document TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- products
        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            sku TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            category TEXT,
            brand TEXT,
            model TEXT,
            cost_price REAL NOT NULL DEFAULT 0 CHECK (cost_price >= 0),
            sale_price REAL NOT NULL DEFAULT 0 CHECK (sale_price >= 0),
            min_stock INTEGER NOT NULL DEFAULT 0,
            tracks_serial INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- stock_levels (one row per loja/product)
        CREATE TABLE IF NOT EXISTS stock_levels (
            id TEXT PRIMARY KEY,
            loja_id TEXT NOT NULL,
            product_id TEXT NOT NULL,
            quantity INTEGER NOT NULL DEFAULT 0 CHECK (quantity >= 0),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(loja_id, product_id),
            FOREIGN KEY(loja_id) REFERENCES lojas(id) ON DELETE CASCADE,
            FOREIGN KEY(product_id) REFERENCES products(id) ON DELETE CASCADE
        );

        -- stock_movements (append-only ledger)
        CREATE TABLE IF NOT EXISTS stock_movements (
            id TEXT PRIMARY KEY,
            loja_id TEXT NOT NULL,
            product_id TEXT NOT NULL,
            delta INTEGER NOT NULL CHECK (delta <> 0),
            quantity_after INTEGER NOT NULL,
            reason TEXT NOT NULL
                CHECK (reason IN ('purchase', 'adjustment', 'sale', 'sale_cancel', 'return',
                                  'transfer_in', 'transfer_out', 'service_order',
                                  'service_order_cancel', 'rma_out', 'rma_in')),
            reference_type TEXT,
            reference_id TEXT,
            note TEXT,
            staff_id TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(loja_id) REFERENCES lojas(id) ON DELETE CASCADE,
            FOREIGN KEY(product_id) REFERENCES products(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_stock_movements_product
            ON stock_movements(product_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_stock_movements_loja
            ON stock_movements(loja_id, created_at);

        -- status_history (transitions of every workflow entity)
        CREATE TABLE IF NOT EXISTS status_history (
            id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            from_status TEXT,
            to_status TEXT NOT NULL,
            note TEXT,
            staff_id TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_status_history_entity
            ON status_history(entity_type, entity_id);

        -- sync_queue (outbound mirror to the hosted table store)
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name TEXT NOT NULL,
            row_id TEXT NOT NULL,
            operation TEXT NOT NULL CHECK (operation IN ('insert', 'update', 'delete')),
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'syncing', 'synced', 'failed')),
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 5,
            retry_delay_ms INTEGER NOT NULL DEFAULT 5000,
            next_retry_at TEXT,
            last_error TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_sync_queue_status_next_retry
            ON sync_queue(status, next_retry_at);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        format!("migration v1: {e}")
    })?;

    info!("Applied migration v1 (catalog, stock ledger, sync queue)");
    Ok(())
}

/// Migration v2: caixa sessions, sales, payments, store credit.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- cash_sessions (caixa)
        CREATE TABLE IF NOT EXISTS cash_sessions (
            id TEXT PRIMARY KEY,
            loja_id TEXT NOT NULL,
            opened_by TEXT,
            closed_by TEXT,
            opening_amount REAL NOT NULL DEFAULT 0 CHECK (opening_amount >= 0),
            expected_amount REAL,
            counted_amount REAL,
            variance REAL,
            status TEXT NOT NULL DEFAULT 'aberto' CHECK (status IN ('aberto', 'fechado')),
            note TEXT,
            opened_at TEXT NOT NULL,
            closed_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(loja_id) REFERENCES lojas(id) ON DELETE CASCADE
        );

        -- At most one open caixa per loja
        CREATE UNIQUE INDEX IF NOT EXISTS idx_cash_sessions_one_open
            ON cash_sessions(loja_id) WHERE status = 'aberto';

        -- cash_movements (caixa ledger; sign comes from movement_type)
        CREATE TABLE IF NOT EXISTS cash_movements (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            movement_type TEXT NOT NULL
                CHECK (movement_type IN ('sale', 'service_order', 'suprimento',
                                         'sangria', 'refund', 'estorno')),
            amount REAL NOT NULL CHECK (amount > 0),
            reference_type TEXT,
            reference_id TEXT,
            note TEXT,
            staff_id TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(session_id) REFERENCES cash_sessions(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_cash_movements_session
            ON cash_movements(session_id);

        -- sales
        CREATE TABLE IF NOT EXISTS sales (
            id TEXT PRIMARY KEY,
            number INTEGER NOT NULL,
            loja_id TEXT NOT NULL,
            customer_id TEXT,
            staff_id TEXT,
            cash_session_id TEXT,
            subtotal REAL NOT NULL DEFAULT 0,
            discount_amount REAL NOT NULL DEFAULT 0,
            total REAL NOT NULL DEFAULT 0,
            change_amount REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'concluida'
                CHECK (status IN ('concluida', 'cancelada', 'devolvida_parcial', 'devolvida')),
            cancel_reason TEXT,
            cancelled_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(loja_id, number),
            FOREIGN KEY(loja_id) REFERENCES lojas(id),
            FOREIGN KEY(customer_id) REFERENCES customers(id) ON DELETE SET NULL,
            FOREIGN KEY(cash_session_id) REFERENCES cash_sessions(id) ON DELETE SET NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sales_loja_created
            ON sales(loja_id, created_at);

        -- sale_items
        CREATE TABLE IF NOT EXISTS sale_items (
            id TEXT PRIMARY KEY,
            sale_id TEXT NOT NULL,
            product_id TEXT NOT NULL,
            quantity INTEGER NOT NULL CHECK (quantity > 0),
            unit_price REAL NOT NULL CHECK (unit_price >= 0),
            gross_amount REAL NOT NULL,
            discount_allocated REAL NOT NULL DEFAULT 0,
            net_amount REAL NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(sale_id) REFERENCES sales(id) ON DELETE CASCADE,
            FOREIGN KEY(product_id) REFERENCES products(id)
        );

        CREATE INDEX IF NOT EXISTS idx_sale_items_sale ON sale_items(sale_id);

        -- payments (sales and service orders)
        CREATE TABLE IF NOT EXISTS payments (
            id TEXT PRIMARY KEY,
            reference_type TEXT NOT NULL CHECK (reference_type IN ('sale', 'service_order')),
            reference_id TEXT NOT NULL,
            method TEXT NOT NULL CHECK (method IN ('cash', 'card', 'pix', 'credit')),
            amount REAL NOT NULL CHECK (amount > 0),
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_payments_reference
            ON payments(reference_type, reference_id);

        -- credit_entries (store credit ledger; balance = SUM(amount))
        CREATE TABLE IF NOT EXISTS credit_entries (
            id TEXT PRIMARY KEY,
            customer_id TEXT NOT NULL,
            entry_type TEXT NOT NULL CHECK (entry_type IN ('issue', 'redeem', 'reversal')),
            amount REAL NOT NULL CHECK (amount <> 0),
            reference_type TEXT,
            reference_id TEXT,
            note TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(customer_id) REFERENCES customers(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_credit_entries_customer
            ON credit_entries(customer_id);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        format!("migration v2: {e}")
    })?;

    info!("Applied migration v2 (caixa, sales, payments, store credit)");
    Ok(())
}

/// Migration v3: returns (devolução) and return items.
fn migrate_v3(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS returns (
            id TEXT PRIMARY KEY,
            sale_id TEXT NOT NULL,
            loja_id TEXT NOT NULL,
            customer_id TEXT,
            status TEXT NOT NULL DEFAULT 'pendente'
                CHECK (status IN ('pendente', 'concluida', 'concluida_com_credito', 'cancelada')),
            reason TEXT,
            refund_total REAL NOT NULL DEFAULT 0,
            completion_mode TEXT CHECK (completion_mode IN ('refund', 'credit')),
            refund_method TEXT CHECK (refund_method IN ('cash', 'card', 'pix')),
            credit_entry_id TEXT,
            staff_id TEXT,
            completed_by TEXT,
            completed_at TEXT,
            cancel_reason TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(sale_id) REFERENCES sales(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_returns_sale ON returns(sale_id);
        CREATE INDEX IF NOT EXISTS idx_returns_status ON returns(status);

        CREATE TABLE IF NOT EXISTS return_items (
            id TEXT PRIMARY KEY,
            return_id TEXT NOT NULL,
            sale_item_id TEXT NOT NULL,
            product_id TEXT NOT NULL,
            quantity INTEGER NOT NULL CHECK (quantity > 0),
            restock INTEGER NOT NULL DEFAULT 1,
            refund_amount REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY(return_id) REFERENCES returns(id) ON DELETE CASCADE,
            FOREIGN KEY(sale_item_id) REFERENCES sale_items(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_return_items_sale_item
            ON return_items(sale_item_id);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        format!("migration v3: {e}")
    })?;

    info!("Applied migration v3 (returns)");
    Ok(())
}

/// Migration v4: service orders and supplier RMAs.
fn migrate_v4(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS service_orders (
            id TEXT PRIMARY KEY,
            number INTEGER NOT NULL,
            loja_id TEXT NOT NULL,
            customer_id TEXT NOT NULL,
            device_brand TEXT,
            device_model TEXT,
            serial_imei TEXT,
            reported_defect TEXT NOT NULL,
            diagnosis TEXT,
            labor_amount REAL NOT NULL DEFAULT 0 CHECK (labor_amount >= 0),
            parts_amount REAL NOT NULL DEFAULT 0,
            total_amount REAL NOT NULL DEFAULT 0,
            change_amount REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'aberta'
                CHECK (status IN ('aberta', 'em_diagnostico', 'aguardando_aprovacao', 'aprovada',
                                  'em_reparo', 'pronta', 'entregue', 'cancelada')),
            cash_session_id TEXT,
            staff_id TEXT,
            delivered_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(loja_id, number),
            FOREIGN KEY(loja_id) REFERENCES lojas(id),
            FOREIGN KEY(customer_id) REFERENCES customers(id)
        );

        CREATE INDEX IF NOT EXISTS idx_service_orders_status ON service_orders(status);

        CREATE TABLE IF NOT EXISTS service_order_parts (
            id TEXT PRIMARY KEY,
            service_order_id TEXT NOT NULL,
            product_id TEXT NOT NULL,
            quantity INTEGER NOT NULL CHECK (quantity > 0),
            unit_price REAL NOT NULL CHECK (unit_price >= 0),
            total REAL NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(service_order_id) REFERENCES service_orders(id) ON DELETE CASCADE,
            FOREIGN KEY(product_id) REFERENCES products(id)
        );

        CREATE TABLE IF NOT EXISTS rmas (
            id TEXT PRIMARY KEY,
            loja_id TEXT NOT NULL,
            supplier_id TEXT NOT NULL,
            product_id TEXT NOT NULL,
            quantity INTEGER NOT NULL CHECK (quantity > 0),
            defect TEXT NOT NULL,
            source_return_id TEXT,
            status TEXT NOT NULL DEFAULT 'aberto'
                CHECK (status IN ('aberto', 'enviado', 'em_analise', 'aprovado', 'recusado',
                                  'concluido', 'cancelado')),
            resolution TEXT
                CHECK (resolution IN ('substituicao', 'credito_fornecedor', 'devolvido_sem_troca')),
            credit_amount REAL,
            staff_id TEXT,
            sent_at TEXT,
            concluded_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(loja_id) REFERENCES lojas(id),
            FOREIGN KEY(supplier_id) REFERENCES suppliers(id),
            FOREIGN KEY(product_id) REFERENCES products(id),
            FOREIGN KEY(source_return_id) REFERENCES returns(id) ON DELETE SET NULL
        );

        CREATE INDEX IF NOT EXISTS idx_rmas_status ON rmas(status);

        INSERT INTO schema_version (version) VALUES (4);
        ",
    )
    .map_err(|e| {
        error!("Migration v4 failed: {e}");
        format!("migration v4: {e}")
    })?;

    info!("Applied migration v4 (service orders, RMA)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| format!("set_setting: {e}"))?;
    Ok(())
}

/// Every setting as `{category: {key: value}}`. Read errors yield `{}`.
pub fn get_all_settings(conn: &Connection) -> serde_json::Value {
    let grouped = (|| -> rusqlite::Result<serde_json::Map<String, serde_json::Value>> {
        let mut stmt = conn.prepare(
            "SELECT setting_category, setting_key, setting_value
             FROM local_settings ORDER BY setting_category, setting_key",
        )?;
        let mut grouped = serde_json::Map::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let category: String = row.get(0)?;
            let entry = grouped
                .entry(category)
                .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
            if let Some(map) = entry.as_object_mut() {
                map.insert(row.get(1)?, serde_json::Value::String(row.get(2)?));
            }
        }
        Ok(grouped)
    })();

    match grouped {
        Ok(map) => serde_json::Value::Object(map),
        Err(e) => {
            error!("read settings: {e}");
            serde_json::json!({})
        }
    }
}

/// Delete all settings in a category.
pub fn delete_all_settings(conn: &Connection, category: &str) -> Result<(), String> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1",
        params![category],
    )
    .map_err(|e| format!("delete_all_settings: {e}"))?;
    Ok(())
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

/// In-memory database with every migration applied (test helper).
#[cfg(test)]
pub fn test_state() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .expect("pragma setup");
    run_migrations_for_test(&conn);
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .expect("pragma setup");
        conn
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_v1_to_latest() {
        let conn = test_db();
        run_migrations(&conn).expect("run_migrations should succeed");

        let tables = table_names(&conn);
        for expected in [
            "local_settings",
            "lojas",
            "staff",
            "customers",
            "suppliers",
            "products",
            "stock_levels",
            "stock_movements",
            "status_history",
            "sync_queue",
            "cash_sessions",
            "cash_movements",
            "sales",
            "sale_items",
            "payments",
            "credit_entries",
            "returns",
            "return_items",
            "service_orders",
            "service_order_parts",
            "rmas",
        ] {
            assert!(
                tables.contains(&expected.to_string()),
                "missing table {expected}"
            );
        }
        assert_eq!(schema_version(&conn), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_db();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, CURRENT_SCHEMA_VERSION as i64);
    }

    #[test]
    fn test_one_open_cash_session_per_loja() {
        let conn = test_db();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO lojas (id, name, created_at, updated_at)
             VALUES ('l1', 'Centro', datetime('now'), datetime('now'))",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO cash_sessions (id, loja_id, opening_amount, status, opened_at, created_at, updated_at)
             VALUES ('c1', 'l1', 100, 'aberto', datetime('now'), datetime('now'), datetime('now'))",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO cash_sessions (id, loja_id, opening_amount, status, opened_at, created_at, updated_at)
             VALUES ('c2', 'l1', 50, 'aberto', datetime('now'), datetime('now'), datetime('now'))",
            [],
        );
        assert!(dup.is_err(), "second open caixa should be rejected");

        // A closed session does not count toward the open limit
        conn.execute("UPDATE cash_sessions SET status = 'fechado' WHERE id = 'c1'", [])
            .unwrap();
        conn.execute(
            "INSERT INTO cash_sessions (id, loja_id, opening_amount, status, opened_at, created_at, updated_at)
             VALUES ('c3', 'l1', 50, 'aberto', datetime('now'), datetime('now'), datetime('now'))",
            [],
        )
        .expect("new caixa after close");
    }

    #[test]
    fn test_stock_level_check_rejects_negative() {
        let conn = test_db();
        run_migrations(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO lojas (id, name, created_at, updated_at) VALUES ('l1', 'A', 'x', 'x');
             INSERT INTO products (id, sku, name, created_at, updated_at) VALUES ('p1', 'S1', 'Cabo', 'x', 'x');",
        )
        .unwrap();
        let bad = conn.execute(
            "INSERT INTO stock_levels (id, loja_id, product_id, quantity, created_at, updated_at)
             VALUES ('s1', 'l1', 'p1', -1, 'x', 'x')",
            [],
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_return_status_check_constraint() {
        let conn = test_db();
        run_migrations(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO lojas (id, name, created_at, updated_at) VALUES ('l1', 'A', 'x', 'x');
             INSERT INTO sales (id, number, loja_id, created_at, updated_at) VALUES ('s1', 1, 'l1', 'x', 'x');",
        )
        .unwrap();
        let bad = conn.execute(
            "INSERT INTO returns (id, sale_id, loja_id, status, created_at, updated_at)
             VALUES ('r1', 's1', 'l1', 'aprovada', 'x', 'x')",
            [],
        );
        assert!(bad.is_err(), "unknown return status should be rejected");
    }

    #[test]
    fn test_in_transaction_rolls_back_on_error() {
        let conn = test_db();
        run_migrations(&conn).unwrap();
        let result: Result<(), String> = in_transaction(&conn, |c| {
            c.execute(
                "INSERT INTO lojas (id, name, created_at, updated_at) VALUES ('l9', 'X', 'x', 'x')",
                [],
            )
            .map_err(|e| e.to_string())?;
            Err("boom".into())
        });
        assert!(result.is_err());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM lojas", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_settings_crud() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        set_setting(&conn, "report", "business_name", "Loja A").expect("set");
        assert_eq!(
            get_setting(&conn, "report", "business_name"),
            Some("Loja A".to_string())
        );

        set_setting(&conn, "report", "business_name", "Loja B").expect("update");
        assert_eq!(
            get_setting(&conn, "report", "business_name"),
            Some("Loja B".to_string())
        );

        let all = get_all_settings(&conn);
        assert_eq!(all["report"]["business_name"], "Loja B");

        delete_all_settings(&conn, "report").expect("delete");
        assert!(get_setting(&conn, "report", "business_name").is_none());
    }
}
