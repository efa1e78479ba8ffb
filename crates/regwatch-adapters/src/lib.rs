//! Upstream registry source: trait contract + SODA-style open-data client.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use regwatch_core::{normalize_registration, SourceRecord};
use reqwest::StatusCode;
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "regwatch-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// A registry upstream that can deliver one full snapshot per call.
#[async_trait]
pub trait RegistrySource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_snapshot(&self, run_id: Uuid) -> Result<Vec<SourceRecord>, SourceError>;
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
pub struct SourceConfig {
    pub source_id: String,
    pub base_url: String,
    /// Optional `$where` server-side filter, passed through verbatim.
    pub where_clause: Option<String>,
    /// `$limit` page cap; the upstream truncates past this.
    pub limit: usize,
    /// Name of the JSON field carrying the registration key.
    pub key_field: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            source_id: "rdw-open-data".to_string(),
            base_url: "https://opendata.rdw.nl/resource/m9d7-ebf2.json".to_string(),
            where_clause: None,
            limit: 15_000,
            key_field: "kenteken".to_string(),
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Socrata-style open-data client: one GET per snapshot, exponential retry
/// on transient failures, JSON rows mapped into [`SourceRecord`]s.
#[derive(Debug)]
pub struct OpenDataClient {
    client: reqwest::Client,
    config: SourceConfig,
}

impl OpenDataClient {
    pub fn new(config: SourceConfig) -> Result<Self, SourceError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build()?;
        Ok(Self { client, config })
    }

    fn query_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(clause) = &self.config.where_clause {
            params.push(("$where", clause.clone()));
        }
        params.push(("$limit", self.config.limit.to_string()));
        params
    }

    async fn get_rows(&self) -> Result<Vec<JsonMap<String, JsonValue>>, SourceError> {
        let backoff = self.config.backoff;
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=backoff.max_retries {
            let resp_result = self
                .client
                .get(&self.config.base_url)
                .query(&self.query_params())
                .send()
                .await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        return resp
                            .json::<Vec<JsonMap<String, JsonValue>>>()
                            .await
                            .map_err(SourceError::Request);
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < backoff.max_retries {
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(SourceError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < backoff.max_retries {
                        last_request_error = Some(err);
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(SourceError::Request(err));
                }
            }
        }

        Err(SourceError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[async_trait]
impl RegistrySource for OpenDataClient {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    async fn fetch_snapshot(&self, run_id: Uuid) -> Result<Vec<SourceRecord>, SourceError> {
        let span = info_span!(
            "registry_fetch",
            %run_id,
            source_id = %self.config.source_id,
            url = %self.config.base_url
        );

        async {
            let rows = self.get_rows().await?;
            let total = rows.len();

            let mut records = Vec::with_capacity(total);
            let mut skipped = 0usize;
            for row in &rows {
                match record_from_json(row, &self.config.key_field) {
                    Some(record) => records.push(record),
                    None => skipped += 1,
                }
            }

            if skipped > 0 {
                warn!(skipped, total, "dropped rows without a usable registration key");
            }
            info!(fetched = records.len(), "registry snapshot fetched");

            Ok(records)
        }
        .instrument(span)
        .await
    }
}

/// Maps one upstream JSON row onto a [`SourceRecord`]. Returns `None` when
/// the key field is absent or blank; such rows cannot be reconciled.
pub fn record_from_json(row: &JsonMap<String, JsonValue>, key_field: &str) -> Option<SourceRecord> {
    let key = row.get(key_field).and_then(scalar_to_string)?;
    let registration = normalize_registration(&key);
    if registration.is_empty() {
        return None;
    }

    let mut fields = BTreeMap::new();
    for (name, value) in row {
        if name == key_field {
            continue;
        }
        let Some(rendered) = scalar_to_string(value) else {
            continue;
        };
        fields.insert(snake_case_field(name), rendered);
    }

    Some(SourceRecord {
        registration,
        fields,
    })
}

fn scalar_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Null => None,
        // Nested payloads (axle/fuel sub-resource links) are kept as compact JSON text.
        other => serde_json::to_string(other).ok(),
    }
}

/// Upstream field names are normalized to snake_case before they are judged
/// against the storage identifier gate.
pub fn snake_case_field(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for ch in name.chars() {
        if ch.is_ascii_uppercase() {
            out.push('_');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
