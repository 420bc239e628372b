//! PIN-based staff authentication with bcrypt.
//!
//! Staff members live in the `staff` table, each with a role and a bcrypt
//! PIN hash. Sessions are kept in memory; the lockout counter is persisted
//! in `local_settings` so it survives restarts.

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::{now_iso, value_bool, value_str};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const MAX_FAILED_ATTEMPTS: u32 = 5;
const LOCKOUT_MINUTES: i64 = 15;
const SESSION_INACTIVITY_MINUTES: i64 = 30;
const SESSION_MAX_DURATION_HOURS: i64 = 8;
const LOCKOUT_ATTEMPTS_KEY: &str = "lockout_attempts";
const LOCKOUT_LAST_ATTEMPT_KEY: &str = "lockout_last_attempt";

#[cfg(not(test))]
const PIN_HASH_COST: u32 = bcrypt::DEFAULT_COST;
#[cfg(test)]
const PIN_HASH_COST: u32 = 4;

pub const ROLES: &[&str] = &["admin", "gerente", "vendedor", "tecnico"];

const ADMIN_PERMISSIONS: &[&str] = &[
    "manage_catalog",
    "adjust_stock",
    "sell",
    "process_returns",
    "manage_cash",
    "manage_service_orders",
    "manage_rma",
    "view_reports",
    "manage_staff",
    "force_sync",
];

const GERENTE_PERMISSIONS: &[&str] = &[
    "manage_catalog",
    "adjust_stock",
    "sell",
    "process_returns",
    "manage_cash",
    "manage_service_orders",
    "manage_rma",
    "view_reports",
    "force_sync",
];

const VENDEDOR_PERMISSIONS: &[&str] = &["sell", "process_returns", "manage_cash"];

const TECNICO_PERMISSIONS: &[&str] = &["manage_service_orders", "adjust_stock", "manage_rma"];

pub fn permissions_for(role: &str) -> &'static [&'static str] {
    match role {
        "admin" => ADMIN_PERMISSIONS,
        "gerente" => GERENTE_PERMISSIONS,
        "vendedor" => VENDEDOR_PERMISSIONS,
        "tecnico" => TECNICO_PERMISSIONS,
        _ => &[],
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct StaffSession {
    session_id: String,
    staff_id: String,
    staff_name: String,
    role: String,
    loja_id: Option<String>,
    login_time: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl StaffSession {
    fn is_expired(&self) -> bool {
        let now = Utc::now();
        if now >= self.expires_at {
            return true;
        }
        now - self.last_activity > Duration::minutes(SESSION_INACTIVITY_MINUTES)
    }

    fn to_user_json(&self) -> Value {
        serde_json::json!({
            "staffId": self.staff_id,
            "staffName": self.staff_name,
            "role": {
                "name": self.role,
                "permissions": permissions_for(&self.role),
            },
            "lojaId": self.loja_id,
            "sessionId": self.session_id,
            "expiresAt": self.expires_at.to_rfc3339(),
        })
    }
}

/// Who is acting, as resolved from the current session.
#[derive(Debug, Clone)]
pub struct Actor {
    pub staff_id: String,
    pub role: String,
    pub loja_id: Option<String>,
}

struct LockoutEntry {
    attempts: u32,
    last_attempt: DateTime<Utc>,
}

pub struct AuthState {
    sessions: Mutex<HashMap<String, StaffSession>>,
    current_session_id: Mutex<Option<String>>,
}

impl AuthState {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            current_session_id: Mutex::new(None),
        }
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn validate_pin(pin: &str) -> Result<(), String> {
    if pin.len() < 4 {
        return Err("PIN must be at least 4 digits".into());
    }
    if !pin.chars().all(|c| c.is_ascii_digit()) {
        return Err("PIN must contain only digits".into());
    }
    Ok(())
}

fn check_lockout(lockout: &LockoutEntry) -> Result<(), String> {
    if lockout.attempts >= MAX_FAILED_ATTEMPTS {
        let elapsed = Utc::now() - lockout.last_attempt;
        if elapsed < Duration::minutes(LOCKOUT_MINUTES) {
            let remaining = LOCKOUT_MINUTES - elapsed.num_minutes();
            return Err(format!(
                "Too many failed attempts. Try again in {remaining} minute(s)."
            ));
        }
    }
    Ok(())
}

fn load_lockout(conn: &rusqlite::Connection) -> LockoutEntry {
    let attempts = db::get_setting(conn, "auth", LOCKOUT_ATTEMPTS_KEY)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0);
    let last_attempt = db::get_setting(conn, "auth", LOCKOUT_LAST_ATTEMPT_KEY)
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    LockoutEntry {
        attempts,
        last_attempt,
    }
}

fn persist_lockout(conn: &rusqlite::Connection, lockout: &LockoutEntry) {
    let _ = db::set_setting(
        conn,
        "auth",
        LOCKOUT_ATTEMPTS_KEY,
        &lockout.attempts.to_string(),
    );
    let _ = db::set_setting(
        conn,
        "auth",
        LOCKOUT_LAST_ATTEMPT_KEY,
        &lockout.last_attempt.to_rfc3339(),
    );
}

/// (id, name, role, loja_id, pin_hash) for every active staff member.
fn active_staff(
    conn: &rusqlite::Connection,
) -> Result<Vec<(String, String, String, Option<String>, String)>, String> {
    let mut stmt = conn
        .prepare("SELECT id, name, role, loja_id, pin_hash FROM staff WHERE active = 1")
        .map_err(|e| e.to_string())?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
            ))
        })
        .map_err(|e| e.to_string())?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

fn current_session(auth: &AuthState) -> Option<StaffSession> {
    let current_id = auth.current_session_id.lock().ok()?.clone()?;
    let sessions = auth.sessions.lock().ok()?;
    let session = sessions.get(&current_id)?.clone();
    if session.is_expired() {
        return None;
    }
    Some(session)
}

fn drop_current_session(auth: &AuthState) -> Option<String> {
    let sid = auth.current_session_id.lock().ok()?.take()?;
    if let Ok(mut sessions) = auth.sessions.lock() {
        sessions.remove(&sid);
    }
    Some(sid)
}

// ---------------------------------------------------------------------------
// Staff management
// ---------------------------------------------------------------------------

pub fn staff_count(db: &DbState) -> Result<i64, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.query_row("SELECT COUNT(*) FROM staff", [], |row| row.get(0))
        .map_err(|e| format!("count staff: {e}"))
}

/// Create a staff member. The very first one must be an admin.
pub fn create_staff(db: &DbState, payload: &Value) -> Result<Value, String> {
    let name = value_str(payload, &["name"]).ok_or("Missing required field: name")?;
    let role = value_str(payload, &["role"]).ok_or("Missing required field: role")?;
    let pin = value_str(payload, &["pin"]).ok_or("Missing required field: pin")?;
    let loja_id = value_str(payload, &["lojaId", "loja_id"]);

    if !ROLES.contains(&role.as_str()) {
        return Err(format!("Invalid role: {role}"));
    }
    validate_pin(&pin)?;

    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let existing: i64 = conn
        .query_row("SELECT COUNT(*) FROM staff", [], |row| row.get(0))
        .map_err(|e| e.to_string())?;
    if existing == 0 && role != "admin" {
        return Err("The first staff member must be an admin".into());
    }

    // PINs identify the user at login, so they must be unique
    for (_, other_name, _, _, hash) in active_staff(&conn)? {
        if bcrypt::verify(&pin, &hash).unwrap_or(false) {
            warn!(existing = %other_name, "rejected duplicate staff PIN");
            return Err("PIN already in use".into());
        }
    }

    if let Some(ref lid) = loja_id {
        crate::data_helpers::require_row(&conn, "lojas", lid)?;
    }

    let hash =
        bcrypt::hash(&pin, PIN_HASH_COST).map_err(|e| format!("Failed to hash PIN: {e}"))?;
    let id = Uuid::new_v4().to_string();
    let now = now_iso();
    conn.execute(
        "INSERT INTO staff (id, name, role, pin_hash, loja_id, active, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)",
        params![id, name, role, hash, loja_id, now],
    )
    .map_err(|e| format!("insert staff: {e}"))?;

    info!(staff_id = %id, role = %role, "staff member created");
    Ok(serde_json::json!({
        "success": true,
        "staff": { "id": id, "name": name, "role": role, "loja_id": loja_id, "active": true },
    }))
}

pub fn list_staff(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let rows = crate::data_helpers::query_all_json(
        &conn,
        "SELECT id, name, role, loja_id, active, created_at, updated_at
         FROM staff ORDER BY name",
        [],
    )?;
    Ok(Value::Array(rows))
}

/// Activate or deactivate a staff member. The last active admin stays.
pub fn set_staff_active(db: &DbState, payload: &Value) -> Result<Value, String> {
    let staff_id = value_str(payload, &["staffMemberId", "id"]).ok_or("Missing required field: id")?;
    let active = value_bool(payload, &["active"]).ok_or("Missing required field: active")?;

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let role: String = conn
        .query_row(
            "SELECT role FROM staff WHERE id = ?1",
            params![staff_id],
            |row| row.get(0),
        )
        .map_err(|_| format!("Staff member not found: {staff_id}"))?;

    if !active && role == "admin" {
        let other_admins: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM staff WHERE role = 'admin' AND active = 1 AND id != ?1",
                params![staff_id],
                |row| row.get(0),
            )
            .map_err(|e| e.to_string())?;
        if other_admins == 0 {
            return Err("Cannot deactivate the last active admin".into());
        }
    }

    conn.execute(
        "UPDATE staff SET active = ?1, updated_at = ?2 WHERE id = ?3",
        params![active, now_iso(), staff_id],
    )
    .map_err(|e| format!("update staff: {e}"))?;

    info!(staff_id = %staff_id, active, "staff active flag changed");
    Ok(serde_json::json!({ "success": true }))
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Verify a PIN against every active staff member and open a session.
pub fn login(db: &DbState, auth: &AuthState, payload: &Value) -> Result<Value, String> {
    let pin = payload
        .as_str()
        .map(|s| s.to_string())
        .or_else(|| value_str(payload, &["pin"]))
        .ok_or("PIN is required")?;

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let mut lockout = load_lockout(&conn);
    check_lockout(&lockout)?;

    let matched = active_staff(&conn)?
        .into_iter()
        .find(|(_, _, _, _, hash)| bcrypt::verify(&pin, hash).unwrap_or(false));

    let Some((staff_id, staff_name, role, loja_id, _)) = matched else {
        if lockout.attempts >= MAX_FAILED_ATTEMPTS {
            // Lockout window elapsed; start a fresh count
            lockout.attempts = 0;
        }
        lockout.attempts += 1;
        lockout.last_attempt = Utc::now();
        persist_lockout(&conn, &lockout);
        warn!(attempts = lockout.attempts, "failed login attempt");
        return Err("Invalid PIN".into());
    };

    lockout.attempts = 0;
    lockout.last_attempt = Utc::now();
    persist_lockout(&conn, &lockout);
    drop(conn);

    let now = Utc::now();
    let session = StaffSession {
        session_id: Uuid::new_v4().to_string(),
        staff_id: staff_id.clone(),
        staff_name,
        role: role.clone(),
        loja_id,
        login_time: now,
        last_activity: now,
        expires_at: now + Duration::hours(SESSION_MAX_DURATION_HOURS),
    };
    let user = session.to_user_json();
    let sid = session.session_id.clone();

    auth.sessions
        .lock()
        .map_err(|e| e.to_string())?
        .insert(sid.clone(), session);
    *auth.current_session_id.lock().map_err(|e| e.to_string())? = Some(sid);

    info!(staff_id = %staff_id, role = %role, "login successful");
    Ok(serde_json::json!({ "success": true, "user": user }))
}

pub fn logout(auth: &AuthState) -> Value {
    if let Some(sid) = drop_current_session(auth) {
        info!(session_id = %sid, "session logged out");
    }
    serde_json::json!({ "success": true })
}

/// The current user, or null when nobody is logged in (or the session expired).
pub fn get_session_json(auth: &AuthState) -> Value {
    match current_session(auth) {
        Some(s) => s.to_user_json(),
        None => {
            drop_current_session(auth);
            Value::Null
        }
    }
}

pub fn get_session_stats(auth: &AuthState) -> Value {
    match current_session(auth) {
        Some(s) => serde_json::json!({
            "sessionId": s.session_id,
            "role": s.role,
            "loginTime": s.login_time.to_rfc3339(),
            "lastActivity": s.last_activity.to_rfc3339(),
            "expiresAt": s.expires_at.to_rfc3339(),
        }),
        None => serde_json::json!({}),
    }
}

/// Check the current session holds `permission` and refresh its inactivity
/// timer.
pub fn require_permission(auth: &AuthState, permission: &str) -> Result<Actor, String> {
    let session = match current_session(auth) {
        Some(s) => s,
        None => {
            let had_session = drop_current_session(auth).is_some();
            return Err(if had_session {
                "Session expired".into()
            } else {
                "Not authenticated".into()
            });
        }
    };

    if !permissions_for(&session.role).contains(&permission) {
        warn!(staff_id = %session.staff_id, permission, "permission denied");
        return Err(format!("Permission denied: {permission}"));
    }

    if let Ok(mut sessions) = auth.sessions.lock() {
        if let Some(s) = sessions.get_mut(&session.session_id) {
            s.last_activity = Utc::now();
        }
    }

    Ok(Actor {
        staff_id: session.staff_id,
        role: session.role,
        loja_id: session.loja_id,
    })
}

/// Any logged-in actor, regardless of permission.
pub fn current_actor(auth: &AuthState) -> Option<Actor> {
    current_session(auth).map(|s| Actor {
        staff_id: s.staff_id,
        role: s.role,
        loja_id: s.loja_id,
    })
}

#[cfg(test)]
pub(crate) fn expire_current_session_for_test(auth: &AuthState) {
    let sid = auth.current_session_id.lock().unwrap().clone().unwrap();
    let mut sessions = auth.sessions.lock().unwrap();
    let s = sessions.get_mut(&sid).unwrap();
    s.last_activity = Utc::now() - Duration::minutes(SESSION_INACTIVITY_MINUTES + 1);
}
