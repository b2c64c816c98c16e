//! Cleanup Engine (§4.8): enforces tier-specific retention on top of the
//! DBMS's own TTL rule, for observability and operator control.
//!
//! Grounded on `original_source/core/storage/archive_manager.py`'s
//! age-driven partition-drop logic; `smart_cleanup`'s disk-threshold gate
//! is carried over unchanged since nothing in the corpus models disk
//! pressure directly.

use crate::config::CleanupConfig;
use crate::metrics;
use crate::store::StoreClient;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct TableCleanupReport {
    pub table: String,
    pub partitions_dropped: u64,
    pub dry_run: bool,
}

pub struct CleanupEngine {
    client: StoreClient,
    tables: Vec<String>,
    config: CleanupConfig,
}

impl CleanupEngine {
    pub fn new(client: StoreClient, tables: Vec<String>, config: CleanupConfig) -> Self {
        Self { client, tables, config }
    }

    /// Runs one cleanup cycle across every configured table, returning a
    /// per-table count of partitions dropped (or that would be dropped, in
    /// dry-run mode).
    pub async fn run_cycle(&self) -> Vec<TableCleanupReport> {
        if self.config.smart_cleanup {
            match self.disk_usage_ratio().await {
                Ok(ratio) if ratio < self.config.disk_threshold => {
                    info!(ratio, threshold = self.config.disk_threshold, "disk usage below threshold; skipping cleanup cycle");
                    return Vec::new();
                }
                Ok(ratio) => {
                    info!(ratio, threshold = self.config.disk_threshold, "disk usage above threshold; running cleanup");
                }
                Err(e) => {
                    warn!(error = %e, "disk usage query failed; falling back to age-only rule");
                }
            }
        }

        let mut reports = Vec::with_capacity(self.tables.len());
        for table in &self.tables {
            reports.push(self.clean_table(table).await);
        }
        reports
    }

    async fn clean_table(&self, table: &str) -> TableCleanupReport {
        let sql = format!(
            "SELECT partition FROM system.parts_catalog WHERE table = '{table}' AND active \
             GROUP BY partition HAVING max(insert_time) < now() - INTERVAL {} DAY",
            self.config.max_age_days
        );

        let partitions = match self.client.query(&sql).await {
            Ok(rows) => rows
                .into_iter()
                .filter_map(|r| r.get("partition").and_then(Value::as_str).map(str::to_string))
                .collect::<Vec<_>>(),
            Err(e) => {
                warn!(table, error = %e, "partition catalog query failed; skipping table this cycle");
                Vec::new()
            }
        };

        if self.config.dry_run {
            info!(table, count = partitions.len(), "dry run: would drop partitions");
            return TableCleanupReport {
                table: table.to_string(),
                partitions_dropped: partitions.len() as u64,
                dry_run: true,
            };
        }

        let mut dropped = 0u64;
        for partition in &partitions {
            let sql = format!("ALTER TABLE {table} DROP PARTITION '{partition}'");
            match self.client.execute(&sql).await {
                Ok(()) => dropped += 1,
                Err(e) => warn!(table, partition, error = %e, "partition drop failed"),
            }
        }
        info!(table, dropped, "cleanup cycle complete");
        if dropped > 0 {
            metrics::record_cleanup_partitions_dropped(table, dropped);
        }

        TableCleanupReport {
            table: table.to_string(),
            partitions_dropped: dropped,
            dry_run: false,
        }
    }

    async fn disk_usage_ratio(&self) -> Result<f64, crate::error::StorageError> {
        let rows = self
            .client
            .query("SELECT free_space, total_space FROM system.disks LIMIT 1")
            .await?;
        let row = rows.first().ok_or_else(|| {
            crate::error::StorageError::StorePermanent("no disk usage row returned".into())
        })?;
        let free = row.get("free_space").and_then(Value::as_f64).unwrap_or(0.0);
        let total = row.get("total_space").and_then(Value::as_f64).unwrap_or(1.0);
        Ok(1.0 - (free / total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreEndpoint;

    fn test_client() -> StoreClient {
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

    #[test]
    fn dry_run_flag_threads_through_report() {
        let engine = CleanupEngine::new(
            test_client(),
            vec!["hot_trade".into()],
            CleanupConfig {
                dry_run: true,
                ..Default::default()
            },
        );
        assert!(engine.config.dry_run);
    }
}
