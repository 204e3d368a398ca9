//! Remote row-store abstraction and clients.
//!
//! The sync engine only ever needs three operations against a remote table:
//! paginated reads of `(UNIQUE_ID, date)` pairs, batched in-list deletes,
//! and batched upserts keyed on `UNIQUE_ID`. Anything satisfying
//! [`RowStore`] is substitutable; the production implementation talks to a
//! PostgREST-style HTTP API, and [`MemoryStore`] backs the tests.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "allgigs-store";

/// Minimal projection of a persisted row: everything reconciliation needs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoredKey {
    #[serde(rename = "UNIQUE_ID")]
    pub unique_id: String,
    pub date: NaiveDate,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {table}: {message}")]
    Decode { table: String, message: String },
}

/// Abstract remote row store. A single batch call either returns or raises;
/// no multi-row atomicity is assumed beyond that.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Read one page of `(UNIQUE_ID, date)` pairs. A page shorter than
    /// `limit` signals the end of the table.
    async fn select_page(
        &self,
        table: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StoredKey>, StoreError>;

    /// Delete every row whose `UNIQUE_ID` is in `ids`.
    async fn delete_by_ids(&self, table: &str, ids: &[String]) -> Result<(), StoreError>;

    /// Insert-or-replace rows, conflict key `UNIQUE_ID`.
    async fn upsert(&self, table: &str, rows: &[JsonValue]) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct RestStoreConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

/// PostgREST-flavoured HTTP row store. Rows live under
/// `{base_url}/rest/v1/{table}`; upserts merge duplicates on `UNIQUE_ID`.
#[derive(Debug)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    backoff: BackoffPolicy,
}

impl RestStore {
    pub fn new(config: RestStoreConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            backoff: config.backoff,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    /// `in.(...)` filter expression over quoted ids.
    fn in_list(ids: &[String]) -> String {
        let quoted: Vec<String> = ids.iter().map(|id| format!("\"{id}\"")).collect();
        format!("in.({})", quoted.join(","))
    }

    async fn send_with_retries(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, StoreError> {
        let mut attempt = 0usize;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    let url = resp.url().to_string();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, %url, attempt, "retryable store response");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(StoreError::HttpStatus {
                        status: status.as_u16(),
                        url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retryable store request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(StoreError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl RowStore for RestStore {
    async fn select_page(
        &self,
        table: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StoredKey>, StoreError> {
        let resp = self
            .send_with_retries(|| {
                self.authorize(self.client.get(self.table_url(table))).query(&[
                    ("select", "UNIQUE_ID,date".to_string()),
                    ("offset", offset.to_string()),
                    ("limit", limit.to_string()),
                ])
            })
            .await?;

        let keys: Vec<StoredKey> = resp.json().await.map_err(|e| StoreError::Decode {
            table: table.to_string(),
            message: e.to_string(),
        })?;
        debug!(table, offset, fetched = keys.len(), "fetched key page");
        Ok(keys)
    }

    async fn delete_by_ids(&self, table: &str, ids: &[String]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let filter = Self::in_list(ids);
        self.send_with_retries(|| {
            self.authorize(self.client.delete(self.table_url(table)))
                .query(&[("UNIQUE_ID", filter.as_str())])
        })
        .await?;
        Ok(())
    }

    async fn upsert(&self, table: &str, rows: &[JsonValue]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        self.send_with_retries(|| {
            self.authorize(self.client.post(self.table_url(table)))
                .query(&[("on_conflict", "UNIQUE_ID")])
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(rows)
        })
        .await?;
        Ok(())
    }
}

/// In-memory [`RowStore`] keyed by table name, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, BTreeMap<String, JsonValue>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a table with pre-existing rows.
    pub async fn seed(&self, table: &str, rows: Vec<JsonValue>) {
        let mut tables = self.tables.lock().await;
        let entry = tables.entry(table.to_string()).or_default();
        for row in rows {
            if let Some(id) = row.get("UNIQUE_ID").and_then(JsonValue::as_str) {
                entry.insert(id.to_string(), row);
            }
        }
    }

    pub async fn rows(&self, table: &str) -> Vec<JsonValue> {
        let tables = self.tables.lock().await;
        tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn row_count(&self, table: &str) -> usize {
        let tables = self.tables.lock().await;
        tables.get(table).map(BTreeMap::len).unwrap_or(0)
    }
}

#[async_trait]
impl RowStore for MemoryStore {
    async fn select_page(
        &self,
        table: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StoredKey>, StoreError> {
        let tables = self.tables.lock().await;
        let Some(rows) = tables.get(table) else {
            return Ok(Vec::new());
        };
        let page = rows
            .values()
            .skip(offset)
            .take(limit)
            .filter_map(|row| {
                let unique_id = row.get("UNIQUE_ID")?.as_str()?.to_string();
                let date = row
                    .get("date")?
                    .as_str()
                    .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())?;
                Some(StoredKey { unique_id, date })
            })
            .collect();
        Ok(page)
    }

    async fn delete_by_ids(&self, table: &str, ids: &[String]) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(rows) = tables.get_mut(table) {
            for id in ids {
                rows.remove(id);
            }
        }
        Ok(())
    }

    async fn upsert(&self, table: &str, rows: &[JsonValue]) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        let entry = tables.entry(table.to_string()).or_default();
        for row in rows {
            let Some(id) = row.get("UNIQUE_ID").and_then(JsonValue::as_str) else {
                return Err(StoreError::Decode {
                    table: table.to_string(),
                    message: "upsert row missing UNIQUE_ID".to_string(),
                });
            };
            entry.insert(id.to_string(), row.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn in_list_filter_quotes_ids() {
        let ids = vec!["a1".to_string(), "b2".to_string()];
        assert_eq!(RestStore::in_list(&ids), "in.(\"a1\",\"b2\")");
    }

    #[tokio::test]
    async fn memory_store_round_trip_and_pagination() {
        let store = MemoryStore::new();
        let rows: Vec<JsonValue> = (0..5)
            .map(|i| json!({"UNIQUE_ID": format!("id-{i}"), "date": "2026-01-01"}))
            .collect();
        store.upsert("live", &rows).await.expect("upsert");

        let first = store.select_page("live", 0, 3).await.expect("page 1");
        let second = store.select_page("live", 3, 3).await.expect("page 2");
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 2);

        store
            .delete_by_ids("live", &["id-0".to_string(), "id-4".to_string()])
            .await
            .expect("delete");
        assert_eq!(store.row_count("live").await, 3);
    }

    #[tokio::test]
    async fn memory_store_upsert_replaces_on_conflict() {
        let store = MemoryStore::new();
        store
            .upsert("live", &[json!({"UNIQUE_ID": "a", "date": "2026-01-01"})])
            .await
            .expect("first upsert");
        store
            .upsert("live", &[json!({"UNIQUE_ID": "a", "date": "2026-02-02"})])
            .await
            .expect("second upsert");

        let rows = store.rows("live").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["date"], "2026-02-02");
    }
}
