//! Migration Engine (§4.7): moves aged partitions from hot to cold with
//! verified row-count parity.
//!
//! The per-task result shape and failure vocabulary follow
//! `original_source/core/storage/archive_manager.py`'s migration report;
//! the cursor-paged read-then-write shape is grounded on the donor's
//! `signals::db_storage` batch-insert idiom (drain a page, insert, advance
//! the cursor) applied here to read-from-hot/write-to-cold instead of
//! read-from-memory/write-to-db.

use crate::config::{MigrationConfig, RetrySettings};
use crate::error::StorageError;
use crate::metrics;
use crate::model::DataType;
use crate::store::StoreClient;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

/// One migratable partition discovered from the hot-tier catalog.
#[derive(Debug, Clone)]
pub struct PartitionTask {
    pub data_type: DataType,
    pub partition_id: String,
    pub record_count: u64,
    pub size_bytes: u64,
    pub priority: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TaskOutcome {
    Migrated { records_migrated: u64 },
    VerificationMismatch { hot: u64, cold: u64 },
    ReadFailed { detail: String },
    WriteFailed { detail: String },
    DropFailed { detail: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub data_type: DataType,
    pub partition_id: String,
    pub outcome: TaskOutcome,
}

impl TaskResult {
    fn succeeded(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Migrated { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub total_tasks: usize,
    pub successful: usize,
    pub failed: usize,
    pub records_migrated: u64,
    pub results: Vec<TaskResult>,
}

/// Table types given priority in descending order; anything not listed
/// falls to the back (priority 0), per §4.7's "table type + size bonus".
fn base_priority(data_type: DataType) -> i64 {
    match data_type {
        DataType::Trade => 300,
        DataType::Ticker => 200,
        DataType::Orderbook => 100,
        _ => 50,
    }
}

pub struct MigrationEngine {
    hot: StoreClient,
    cold: StoreClient,
    config: MigrationConfig,
    retry: RetrySettings,
}

impl MigrationEngine {
    pub fn new(hot: StoreClient, cold: StoreClient, config: MigrationConfig) -> Self {
        Self {
            hot,
            cold,
            config,
            retry: RetrySettings::default(),
        }
    }

    /// Overrides the page-write retry/backoff policy (default: `RetrySettings::default()`).
    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    /// True outside the configured window; a no-op tick, not an error.
    pub fn outside_window(&self, now_local_hour: u32) -> bool {
        match self.config.window {
            Some((start, end)) if start < end => !(now_local_hour >= start && now_local_hour < end),
            Some((start, end)) => now_local_hour >= end && now_local_hour < start,
            None => false,
        }
    }

    /// Discovers and sorts migratable partitions across all data types.
    async fn discover_tasks(&self) -> Vec<PartitionTask> {
        let mut tasks = Vec::new();
        for data_type in DataType::ALL {
            match self.discover_for_type(data_type).await {
                Ok(mut found) => tasks.append(&mut found),
                Err(e) => {
                    warn!(data_type = data_type.table_name(), error = %e, "partition discovery failed; skipping type this cycle");
                }
            }
        }
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.partition_id.cmp(&b.partition_id)));
        tasks
    }

    async fn discover_for_type(&self, data_type: DataType) -> Result<Vec<PartitionTask>, StorageError> {
        let table = format!("hot_{}", data_type.table_name());
        let sql = format!(
            "SELECT partition, max(max_time) AS max_time, sum(rows) AS rows, sum(bytes_on_disk) AS bytes \
             FROM system.parts_catalog \
             WHERE table = '{table}' AND active \
             GROUP BY partition \
             HAVING max_time < now() - INTERVAL {} HOUR",
            self.config.age_threshold_hours
        );
        let rows = self.hot.query(&sql).await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let partition_id = row.get("partition")?.as_str()?.to_string();
                let record_count = row.get("rows")?.as_u64().unwrap_or(0);
                let size_bytes = row.get("bytes")?.as_u64().unwrap_or(0);
                let mut priority = base_priority(data_type);
                if size_bytes > self.config.size_threshold_mb * 1024 * 1024 {
                    priority += 50;
                }
                Some(PartitionTask {
                    data_type,
                    partition_id,
                    record_count,
                    size_bytes,
                    priority,
                })
            })
            .collect())
    }

    /// Runs one full migration cycle: discover, execute sequentially (or
    /// bounded-parallel across distinct tables), report.
    pub async fn run_cycle(&self) -> CycleReport {
        let tasks = self.discover_tasks().await;
        info!(count = tasks.len(), "migration cycle starting");

        let mut results = Vec::with_capacity(tasks.len());
        if self.config.parallel_workers <= 1 {
            for task in &tasks {
                results.push(self.execute_task(task).await);
            }
        } else {
            for chunk in tasks.chunks(self.config.parallel_workers) {
                let mut handles = Vec::with_capacity(chunk.len());
                for task in chunk {
                    handles.push(self.execute_task(task));
                }
                results.extend(futures_util::future::join_all(handles).await);
            }
        }

        let successful = results.iter().filter(|r| r.succeeded()).count();
        let failed = results.len() - successful;
        let records_migrated = results
            .iter()
            .map(|r| match r.outcome {
                TaskOutcome::Migrated { records_migrated } => {
                    metrics::record_migration_records(r.data_type.table_name(), records_migrated);
                    records_migrated
                }
                _ => 0,
            })
            .sum();

        CycleReport {
            total_tasks: results.len(),
            successful,
            failed,
            records_migrated,
            results,
        }
    }

    /// Read/write/verify/drop pipeline for a single partition. Never drops
    /// the hot partition unless the copy (and, if enabled, verification)
    /// fully succeeded.
    async fn execute_task(&self, task: &PartitionTask) -> TaskResult {
        let hot_table = format!("hot_{}", task.data_type.table_name());
        let cold_table = format!("cold_{}", task.data_type.table_name());

        let copied = match self.copy_partition(&hot_table, &cold_table, &task.partition_id).await {
            Ok(n) => n,
            Err(e) => {
                error!(table = hot_table, partition = task.partition_id, error = %e, "read/write failed");
                let outcome = if e.is_retryable() {
                    TaskOutcome::ReadFailed { detail: e.to_string() }
                } else {
                    TaskOutcome::WriteFailed { detail: e.to_string() }
                };
                return TaskResult {
                    data_type: task.data_type,
                    partition_id: task.partition_id.clone(),
                    outcome,
                };
            }
        };

        if self.config.verification_enabled {
            match self.verify(&hot_table, &cold_table, &task.partition_id).await {
                Ok((hot_count, cold_count)) if hot_count == cold_count => {}
                Ok((hot_count, cold_count)) => {
                    warn!(table = hot_table, partition = task.partition_id, hot_count, cold_count, "verification mismatch; not dropping");
                    return TaskResult {
                        data_type: task.data_type,
                        partition_id: task.partition_id.clone(),
                        outcome: TaskOutcome::VerificationMismatch { hot: hot_count, cold: cold_count },
                    };
                }
                Err(e) => {
                    error!(table = hot_table, partition = task.partition_id, error = %e, "verification query failed; not dropping");
                    return TaskResult {
                        data_type: task.data_type,
                        partition_id: task.partition_id.clone(),
                        outcome: TaskOutcome::VerificationMismatch { hot: 0, cold: 0 },
                    };
                }
            }
        }

        if let Err(e) = self.drop_partition(&hot_table, &task.partition_id).await {
            error!(table = hot_table, partition = task.partition_id, error = %e, "drop failed; will retry next cycle");
            return TaskResult {
                data_type: task.data_type,
                partition_id: task.partition_id.clone(),
                outcome: TaskOutcome::DropFailed { detail: e.to_string() },
            };
        }

        info!(table = hot_table, partition = task.partition_id, copied, "partition migrated");
        TaskResult {
            data_type: task.data_type,
            partition_id: task.partition_id.clone(),
            outcome: TaskOutcome::Migrated { records_migrated: copied },
        }
    }

    /// Pages through the hot partition ordered by timestamp, re-inserting
    /// each page into the cold table. Idempotent: cold tables collapse
    /// duplicates via the same replacing-merge natural key as hot.
    async fn copy_partition(&self, hot_table: &str, cold_table: &str, partition_id: &str) -> Result<u64, StorageError> {
        let mut total = 0u64;
        let mut cursor: Option<String> = None;

        loop {
            let cursor_clause = match &cursor {
                Some(c) => format!("AND timestamp > '{c}'"),
                None => String::new(),
            };
            let sql = format!(
                "SELECT * FROM {hot_table} WHERE partition = '{partition_id}' {cursor_clause} \
                 ORDER BY timestamp LIMIT {}",
                self.config.batch_size
            );
            let page = self.hot.query(&sql).await?;
            if page.is_empty() {
                break;
            }

            let page_len = page.len() as u64;
            let columns = columns_of(&page[0]);
            let rows: Vec<Vec<Value>> = page
                .iter()
                .map(|row| columns.iter().map(|c| row.get(*c).cloned().unwrap_or(Value::Null)).collect())
                .collect();

            self.insert_page_with_retry(cold_table, &columns, &rows).await?;

            cursor = page
                .last()
                .and_then(|r| r.get("timestamp"))
                .and_then(Value::as_str)
                .map(str::to_string);
            total += page_len;

            if page_len < self.config.batch_size as u64 {
                break;
            }
        }

        Ok(total)
    }

    /// Writes one page to the cold table, retrying with backoff on
    /// transient store errors (§4.7 "write failure on a specific page").
    /// Exhausting retries propagates the error so the caller fails the task.
    async fn insert_page_with_retry(&self, cold_table: &str, columns: &[&str], rows: &[Vec<Value>]) -> Result<(), StorageError> {
        let mut attempt = 0u32;
        loop {
            match self
                .cold
                .insert(cold_table, columns, rows, crate::store::InsertFormat::JsonEachRow)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for_attempt_with_base(attempt, e.base_delay_secs());
                    warn!(table = cold_table, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying migration page write");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn verify(&self, hot_table: &str, cold_table: &str, partition_id: &str) -> Result<(u64, u64), StorageError> {
        let hot_sql = format!("SELECT count() AS c FROM {hot_table} WHERE partition = '{partition_id}'");
        let cold_sql = format!("SELECT count() AS c FROM {cold_table} WHERE partition = '{partition_id}'");
        let hot_rows = self.hot.query(&hot_sql).await?;
        let cold_rows = self.cold.query(&cold_sql).await?;
        let hot_count = hot_rows.first().and_then(|r| r.get("c")).and_then(Value::as_u64).unwrap_or(0);
        let cold_count = cold_rows.first().and_then(|r| r.get("c")).and_then(Value::as_u64).unwrap_or(0);
        Ok((hot_count, cold_count))
    }

    async fn drop_partition(&self, hot_table: &str, partition_id: &str) -> Result<(), StorageError> {
        let sql = format!("ALTER TABLE {hot_table} DROP PARTITION '{partition_id}'");
        self.hot.execute(&sql).await
    }
}

fn columns_of(row: &Value) -> Vec<&str> {
    row.as_object().map(|o| o.keys().map(String::as_str).collect()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_favors_trade_over_orderbook() {
        assert!(base_priority(DataType::Trade) > base_priority(DataType::Orderbook));
        assert!(base_priority(DataType::Ticker) > base_priority(DataType::Orderbook));
    }

    #[test]
    fn window_outside_simple_range() {
        let engine = MigrationEngine::new(
            dummy_client(),
            dummy_client(),
            MigrationConfig {
                window: Some((2, 4)),
                ..Default::default()
            },
        );
        assert!(engine.outside_window(1));
        assert!(!engine.outside_window(3));
        assert!(engine.outside_window(4));
    }

    fn dummy_client() -> StoreClient {
        use crate::config::StoreEndpoint;
        StoreClient::new(&StoreEndpoint {
            host: "localhost".into(),
            port: 8123,
            user: "default".into(),
            password: String::new(),
            database: "marketprism_hot".into(),
            use_https: false,
        })
        .unwrap()
    }
}
