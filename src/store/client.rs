//! Columnar Store Client (§4.1): a thin wrapper over the DBMS HTTP
//! surface. No retry logic lives here — that belongs to the Tier Writer.
//!
//! Resolves the source's "two different HTTP clients" open question in
//! favor of a single `reqwest`-based implementation, the donor's existing
//! HTTP client dependency.

use crate::config::StoreEndpoint;
use crate::error::StorageError;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertFormat {
    RowTuples,
    JsonEachRow,
}

/// One row to be inserted, as an ordered list of column values matching the
/// table's declared column order.
pub type Row = Vec<Value>;

#[derive(Clone)]
pub struct StoreClient {
    http: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
    database: String,
}

impl StoreClient {
    pub fn new(endpoint: &StoreEndpoint) -> Result<Self, StorageError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StorageError::Other(e.into()))?;

        Ok(Self {
            http,
            base_url: endpoint.base_url(),
            user: endpoint.user.clone(),
            password: endpoint.password.clone(),
            database: endpoint.database.clone(),
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Executes one statement with no expected result rows (DDL, `ALTER
    /// TABLE ... DROP PARTITION`, etc.).
    pub async fn execute(&self, sql: &str) -> Result<(), StorageError> {
        let response = self
            .http
            .post(format!("{}/", self.base_url))
            .basic_auth(&self.user, Some(&self.password))
            .query(&[("database", self.database.as_str())])
            .body(sql.to_string())
            .send()
            .await
            .map_err(Self::classify_transport_error)?;

        Self::classify_response(response).await?;
        Ok(())
    }

    /// Executes a query and returns rows, decoded as `JSONEachRow`.
    pub async fn query(&self, sql: &str) -> Result<Vec<Value>, StorageError> {
        let formatted = format!("{sql} FORMAT JSONEachRow");
        let response = self
            .http
            .post(format!("{}/", self.base_url))
            .basic_auth(&self.user, Some(&self.password))
            .query(&[("database", self.database.as_str())])
            .body(formatted)
            .send()
            .await
            .map_err(Self::classify_transport_error)?;

        let body = Self::classify_response(response).await?;
        body.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(|e| StorageError::Other(e.into())))
            .collect()
    }

    /// Bulk inserts `rows` into `table` using the declared `columns` order.
    pub async fn insert(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[Row],
        format: InsertFormat,
    ) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }

        let body = match format {
            InsertFormat::RowTuples => {
                let values: Vec<String> = rows
                    .iter()
                    .map(|row| {
                        let rendered: Vec<String> = row.iter().map(render_sql_value).collect();
                        format!("({})", rendered.join(", "))
                    })
                    .collect();
                format!(
                    "INSERT INTO {table} ({}) VALUES {}",
                    columns.join(", "),
                    values.join(", ")
                )
            }
            InsertFormat::JsonEachRow => {
                let mut buf = format!(
                    "INSERT INTO {table} ({}) FORMAT JSONEachRow\n",
                    columns.join(", ")
                );
                for row in rows {
                    let object: serde_json::Map<String, Value> = columns
                        .iter()
                        .zip(row.iter())
                        .map(|(c, v)| (c.to_string(), v.clone()))
                        .collect();
                    buf.push_str(&serde_json::to_string(&Value::Object(object)).unwrap());
                    buf.push('\n');
                }
                buf
            }
        };

        let response = self
            .http
            .post(format!("{}/", self.base_url))
            .basic_auth(&self.user, Some(&self.password))
            .query(&[("database", self.database.as_str())])
            .body(body)
            .send()
            .await
            .map_err(Self::classify_transport_error)?;

        Self::classify_response(response).await.map(|_| ())?;
        Ok(())
    }

    fn classify_transport_error(err: reqwest::Error) -> StorageError {
        if err.is_timeout() || err.is_connect() {
            StorageError::StoreTransient(err.to_string())
        } else {
            StorageError::StorePermanent(err.to_string())
        }
    }

    async fn classify_response(response: reqwest::Response) -> Result<String, StorageError> {
        let status = response.status();
        if status.is_success() {
            return response
                .text()
                .await
                .map_err(|e| StorageError::Other(e.into()));
        }

        let body = response.text().await.unwrap_or_default();

        if status.is_server_error() {
            return Err(StorageError::StoreTransient(format!(
                "{status}: {body}"
            )));
        }

        // 4xx: inspect the JSON error body (if any) for a retryable code.
        if let Ok(parsed) = serde_json::from_str::<Value>(&body) {
            if let Some(code) = parsed.get("code").and_then(Value::as_str) {
                if is_retryable_store_code(code) {
                    return Err(StorageError::StoreRateLimit(format!("{code}: {body}")));
                }
                if code == "SCHEMA_MISMATCH" || code == "TYPE_MISMATCH" {
                    return Err(StorageError::StoreSchemaMismatch {
                        table: parsed
                            .get("table")
                            .and_then(Value::as_str)
                            .unwrap_or("?")
                            .to_string(),
                        detail: body,
                    });
                }
                return Err(StorageError::StoreReject(format!("{code}: {body}")));
            }
        }

        Err(StorageError::StorePermanent(format!("{status}: {body}")))
    }
}

fn is_retryable_store_code(code: &str) -> bool {
    matches!(
        code,
        "RATE_LIMITED" | "TOO_MANY_SIMULTANEOUS_QUERIES" | "SERVER_OVERLOADED" | "MEMORY_LIMIT_EXCEEDED"
    )
}

fn render_sql_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "\\'")),
        other => format!("'{}'", other.to_string().replace('\'', "\\'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_string_values_with_escaping() {
        assert_eq!(render_sql_value(&Value::String("o'brien".into())), "'o\\'brien'");
    }

    #[test]
    fn retryable_codes_cover_rate_limit_and_overload() {
        assert!(is_retryable_store_code("RATE_LIMITED"));
        assert!(!is_retryable_store_code("SCHEMA_MISMATCH"));
    }
}
