//! Hosted-store credentials kept in the OS credential store.
//!
//! Windows Credential Manager, macOS Keychain and the Linux Secret Service
//! are reached through the `keyring` crate. Nothing secret is written to
//! the SQLite file.

use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};

const SERVICE_NAME: &str = "loja-backoffice";

// Credential keys
pub const KEY_REMOTE_URL: &str = "remote_url";
pub const KEY_REMOTE_API_KEY: &str = "remote_api_key";
pub const KEY_LOJA_ID: &str = "loja_id";

const ALL_KEYS: &[&str] = &[KEY_REMOTE_URL, KEY_REMOTE_API_KEY, KEY_LOJA_ID];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential. `None` when the entry does not exist.
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) if !pw.trim().is_empty() => Some(pw),
        Ok(_) => None,
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Delete a credential. Succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// The hosted mirror is enabled once both URL and API key are stored.
pub fn is_configured() -> bool {
    get_credential(KEY_REMOTE_URL).is_some() && get_credential(KEY_REMOTE_API_KEY).is_some()
}

/// Stored config with the API key masked.
pub fn get_full_config() -> Value {
    serde_json::json!({
        "remote_url": get_credential(KEY_REMOTE_URL),
        "remote_api_key": get_credential(KEY_REMOTE_API_KEY).map(|k| mask_secret(&k)),
        "loja_id": get_credential(KEY_LOJA_ID),
        "configured": is_configured(),
    })
}

/// Store hosted-store credentials.
///
/// Accepts `remoteUrl`/`remote_url`, `apiKey`/`remote_api_key` and an
/// optional `lojaId`/`loja_id`.
pub fn update_remote_credentials(payload: &Value) -> Result<Value, String> {
    let url = payload
        .get("remoteUrl")
        .or_else(|| payload.get("remote_url"))
        .and_then(Value::as_str)
        .map(|s| s.trim().trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .ok_or("Missing required field: remoteUrl")?;
    let api_key = payload
        .get("apiKey")
        .or_else(|| payload.get("remote_api_key"))
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or("Missing required field: apiKey")?;

    reqwest::Url::parse(&url).map_err(|e| format!("Invalid remoteUrl: {e}"))?;

    set_credential(KEY_REMOTE_URL, &url)?;
    set_credential(KEY_REMOTE_API_KEY, &api_key)?;

    if let Some(loja_id) = payload
        .get("lojaId")
        .or_else(|| payload.get("loja_id"))
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
    {
        set_credential(KEY_LOJA_ID, loja_id.trim())?;
    }

    info!(remote_url = %url, "remote credentials updated");
    Ok(serde_json::json!({ "success": true }))
}

/// Delete every stored credential.
pub fn factory_reset() -> Result<Value, String> {
    info!("performing factory reset, deleting all credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(serde_json::json!({ "success": true }))
}

fn mask_secret(value: &str) -> String {
    let visible: String = value.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    if value.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("****{visible}")
    }
}
