//! Client for the hosted table store (PostgREST-style REST protocol).
//!
//! Rows live under `{base}/rest/v1/{table}`. Filters are encoded as
//! `column=eq.value` query pairs, upserts use
//! `Prefer: resolution=merge-duplicates`.

use reqwest::Url;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::storage;

const REQUEST_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote store not configured: {0}")]
    NotConfigured(String),
    #[error("invalid remote url: {0}")]
    InvalidUrl(String),
    #[error("remote request failed: {0}")]
    Network(String),
    #[error("remote error ({status}): {body}")]
    Http { status: u16, body: String },
    #[error("remote response decode failed: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Whether a retry later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) => true,
            RemoteError::Http { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            RemoteError::NotConfigured(_) | RemoteError::InvalidUrl(_) | RemoteError::Decode(_) => {
                false
            }
        }
    }
}

impl From<RemoteError> for String {
    fn from(e: RemoteError) -> Self {
        e.to_string()
    }
}

/// Operations the sync engine needs from a table store.
pub trait TableStore {
    fn upsert_rows(
        &self,
        table: &str,
        rows: &[Value],
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;

    fn delete_row(&self, table: &str, id: &str)
        -> impl Future<Output = Result<(), RemoteError>> + Send;
}

#[derive(Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RemoteClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| RemoteError::Network(format!("HTTP client error: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// Build a client from the credentials in the OS keyring.
    pub fn from_storage() -> Result<Self, RemoteError> {
        let url = storage::get_credential(storage::KEY_REMOTE_URL)
            .ok_or_else(|| RemoteError::NotConfigured("missing URL".into()))?;
        let key = storage::get_credential(storage::KEY_REMOTE_API_KEY)
            .ok_or_else(|| RemoteError::NotConfigured("missing API key".into()))?;
        Self::new(&url, &key)
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
    }

    pub async fn fetch_rows(
        &self,
        table: &str,
        filters: &[(String, Value)],
        order: Option<(&str, bool)>,
        limit: Option<i64>,
    ) -> Result<Vec<Value>, RemoteError> {
        let url = build_table_url(&self.base_url, table, filters, order, limit)?;
        let resp = self.request(reqwest::Method::GET, url).send().await;
        let resp = check_status(resp).await?;
        let body = resp
            .json::<Value>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        match body {
            Value::Array(rows) => Ok(rows),
            other => Err(RemoteError::Decode(format!("expected array, got {other}"))),
        }
    }
}

impl TableStore for RemoteClient {
    async fn upsert_rows(&self, table: &str, rows: &[Value]) -> Result<(), RemoteError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut url = build_table_url(&self.base_url, table, &[], None, None)?;
        url.query_pairs_mut().append_pair("on_conflict", "id");
        let resp = self
            .request(reqwest::Method::POST, url)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows)
            .send()
            .await;
        check_status(resp).await.map(|_| ())
    }

    async fn delete_row(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        let url = build_table_url(
            &self.base_url,
            table,
            &[("id".to_string(), Value::String(id.to_string()))],
            None,
            None,
        )?;
        let resp = self.request(reqwest::Method::DELETE, url).send().await;
        check_status(resp).await.map(|_| ())
    }
}

async fn check_status(
    resp: Result<reqwest::Response, reqwest::Error>,
) -> Result<reqwest::Response, RemoteError> {
    let resp = resp.map_err(|e| RemoteError::Network(e.to_string()))?;
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    Err(RemoteError::Http { status, body })
}

/// Build `{base}/rest/v1/{table}` with filter, order and limit query pairs.
pub fn build_table_url(
    base: &str,
    table: &str,
    filters: &[(String, Value)],
    order: Option<(&str, bool)>,
    limit: Option<i64>,
) -> Result<Url, RemoteError> {
    let base = base.trim_end_matches('/');
    let mut url = Url::parse(&format!("{base}/rest/v1/{table}"))
        .map_err(|e| RemoteError::InvalidUrl(e.to_string()))?;
    {
        let mut qp = url.query_pairs_mut();
        for (column, value) in filters {
            qp.append_pair(column, &filter_expr(value));
        }
        if let Some((column, ascending)) = order {
            let dir = if ascending { "asc" } else { "desc" };
            qp.append_pair("order", &format!("{column}.{dir}"));
        }
        if let Some(limit) = limit {
            qp.append_pair("limit", &limit.to_string());
        }
    }
    Ok(url)
}

fn filter_expr(value: &Value) -> String {
    match value {
        Value::Null => "is.null".to_string(),
        Value::String(s) => format!("eq.{s}"),
        other => format!("eq.{other}"),
    }
}
