//! InfluxDB backend.
//!
//! Uses the v1-compatible HTTP API, which InfluxDB 1.x serves natively and
//! InfluxDB 3.x keeps for InfluxQL clients:
//! - `GET /query?db=..&q=..&epoch=ns` for reads. Every select ends in
//!   `GROUP BY *` so the response separates tag sets from field columns.
//! - `POST /write?db=..&precision=ns` with a line-protocol body for writes.
//!
//! Raw streams are read from `store.database`; output streams (watermarks
//! and writes) live in `store.output_database`, which defaults to the same
//! database.
//!
//! ```toml
//! [store]
//! host = "influxdb"
//! port = 8181
//! database = "GarminStats"
//! output_database = "Enricher"
//! token = "apiv3_..."           # or username/password for 1.x
//! ```

use crate::config::{Credentials, StoreSettings};
use crate::error::StoreError;
use crate::record::{EnrichedRecord, FieldValue, RawRecord};
use crate::store::TimeSeriesStore;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// HTTP client for one InfluxDB endpoint.
#[derive(Clone)]
pub struct InfluxStore {
    client: Client,
    base_url: String,
    database: String,
    output_database: String,
    credentials: Option<Credentials>,
}

impl InfluxStore {
    pub fn new(settings: &StoreSettings) -> Result<Self, StoreError> {
        let client = Client::builder().timeout(settings.timeout()).build()?;
        Ok(Self {
            client,
            base_url: settings.base_url().trim_end_matches('/').to_string(),
            database: settings.database.clone(),
            output_database: settings.output_database().to_string(),
            credentials: settings.credentials(),
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some(Credentials::Token(token)) => {
                request.header("Authorization", format!("Token {}", token))
            }
            Some(Credentials::Basic { username, password }) => {
                request.query(&[("u", username.as_str()), ("p", password.as_str())])
            }
            None => request,
        }
    }

    async fn query(&self, database: &str, statement: &str) -> Result<Vec<RawRecord>, StoreError> {
        let request = self
            .client
            .get(format!("{}/query", self.base_url))
            .query(&[("db", database), ("q", statement), ("epoch", "ns")]);
        let response = check_status(self.authorize(request).send().await?).await?;
        let body = response.text().await?;
        parse_query_response(&body)
    }
}

async fn check_status(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl TimeSeriesStore for InfluxStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let request = self.client.get(format!("{}/ping", self.base_url));
        check_status(self.authorize(request).send().await?).await?;
        Ok(())
    }

    async fn query_since(
        &self,
        stream: &str,
        after: DateTime<Utc>,
    ) -> Result<Vec<RawRecord>, StoreError> {
        let statement = select_since(stream, after)?;
        self.query(&self.database, &statement).await
    }

    async fn query_before(
        &self,
        stream: &str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RawRecord>, StoreError> {
        let statement = select_before(stream, before, limit)?;
        let mut records = self.query(&self.database, &statement).await?;
        // LIMIT applies per tag set, so trim the merged result.
        let excess = records.len().saturating_sub(limit);
        records.drain(..excess);
        Ok(records)
    }

    async fn latest_timestamp(&self, stream: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let records = self.query(&self.output_database, &select_latest(stream)).await?;
        Ok(records.last().map(|r| r.timestamp))
    }

    async fn write(&self, records: &[EnrichedRecord]) -> Result<(), StoreError> {
        let body = encode_line_protocol(records)?;
        if body.is_empty() {
            return Ok(());
        }
        let request = self
            .client
            .post(format!("{}/write", self.base_url))
            .query(&[("db", self.output_database.as_str()), ("precision", "ns")])
            .body(body);
        check_status(self.authorize(request).send().await?).await?;
        Ok(())
    }

    async fn ensure_output_database(&self) -> Result<(), StoreError> {
        let statement = format!("CREATE DATABASE {}", quote_ident(&self.output_database));
        let request = self
            .client
            .post(format!("{}/query", self.base_url))
            .query(&[("q", statement.as_str())]);
        let response = check_status(self.authorize(request).send().await?).await?;
        parse_query_response(&response.text().await?)?;
        Ok(())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
}

fn epoch_nanos(ts: DateTime<Utc>) -> Result<i64, StoreError> {
    ts.timestamp_nanos_opt()
        .ok_or_else(|| StoreError::Timestamp(format!("{} is outside the nanosecond range", ts)))
}

pub(crate) fn select_since(stream: &str, after: DateTime<Utc>) -> Result<String, StoreError> {
    Ok(format!(
        "SELECT * FROM {} WHERE time > {} GROUP BY *",
        quote_ident(stream),
        epoch_nanos(after)?
    ))
}

pub(crate) fn select_before(
    stream: &str,
    before: DateTime<Utc>,
    limit: usize,
) -> Result<String, StoreError> {
    Ok(format!(
        "SELECT * FROM {} WHERE time < {} GROUP BY * ORDER BY time DESC LIMIT {}",
        quote_ident(stream),
        epoch_nanos(before)?,
        limit
    ))
}

pub(crate) fn select_latest(stream: &str) -> String {
    format!(
        "SELECT * FROM {} GROUP BY * ORDER BY time DESC LIMIT 1",
        quote_ident(stream)
    )
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<Series>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    tags: Option<BTreeMap<String, String>>,
    columns: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

fn parse_time(value: Option<&serde_json::Value>) -> Result<DateTime<Utc>, StoreError> {
    match value {
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .map(|ns| Utc.timestamp_nanos(ns))
            .ok_or_else(|| StoreError::Timestamp(n.to_string())),
        Some(serde_json::Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StoreError::Timestamp(format!("{}: {}", s, e))),
        other => Err(StoreError::Timestamp(format!("{:?}", other))),
    }
}

/// Flattens every series of an InfluxQL JSON response into records sorted by
/// time. Null cells are dropped; empty tag values mean "tag absent".
pub(crate) fn parse_query_response(body: &str) -> Result<Vec<RawRecord>, StoreError> {
    let response: QueryResponse =
        serde_json::from_str(body).map_err(|e| StoreError::Decode(e.to_string()))?;
    if let Some(error) = response.error {
        return Err(StoreError::Query(error));
    }

    let mut records = Vec::new();
    for result in response.results {
        if let Some(error) = result.error {
            return Err(StoreError::Query(error));
        }
        for series in result.series {
            let time_idx = series
                .columns
                .iter()
                .position(|c| c == "time")
                .ok_or_else(|| StoreError::Decode("series without a time column".into()))?;
            let tags: BTreeMap<String, String> = series
                .tags
                .unwrap_or_default()
                .into_iter()
                .filter(|(_, v)| !v.is_empty())
                .collect();

            for row in series.values {
                let mut record = RawRecord::new(parse_time(row.get(time_idx))?);
                record.tags = tags.clone();
                for (idx, (column, value)) in series.columns.iter().zip(row.iter()).enumerate() {
                    if idx == time_idx {
                        continue;
                    }
                    if let Some(value) = FieldValue::from_json(value) {
                        record.fields.insert(column.clone(), value);
                    }
                }
                records.push(record);
            }
        }
    }

    records.sort_by_key(|r| r.timestamp);
    Ok(records)
}

fn escape_measurement(name: &str) -> String {
    name.replace(',', "\\,").replace(' ', "\\ ")
}

fn escape_key(key: &str) -> String {
    key.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

fn encode_field(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Float(v) if v.is_finite() => Some(format!("{}", v)),
        FieldValue::Float(_) => None,
        FieldValue::Integer(v) => Some(format!("{}i", v)),
        FieldValue::Boolean(v) => Some(v.to_string()),
        FieldValue::Text(s) => Some(format!(
            "\"{}\"",
            s.replace('\\', "\\\\").replace('"', "\\\"")
        )),
    }
}

/// Encodes records as InfluxDB line protocol, one point per line.
///
/// Non-finite floats and empty tag values are skipped; a record left with no
/// fields produces no line.
pub fn encode_line_protocol(records: &[EnrichedRecord]) -> Result<String, StoreError> {
    let mut out = String::new();
    for record in records {
        let fields: Vec<String> = record
            .fields
            .iter()
            .filter_map(|(k, v)| encode_field(v).map(|v| format!("{}={}", escape_key(k), v)))
            .collect();
        if fields.is_empty() {
            continue;
        }

        out.push_str(&escape_measurement(&record.output_stream));
        for (key, value) in record.tags.iter().filter(|(_, v)| !v.is_empty()) {
            let _ = write!(out, ",{}={}", escape_key(key), escape_key(value));
        }
        let _ = writeln!(
            out,
            " {} {}",
            fields.join(","),
            epoch_nanos(record.timestamp)?
        );
    }
    Ok(out)
}
