//! Admin Facade (§4.10): observability reads and manual triggers, wrapping
//! the running engine's shared state behind a handful of pure-ish async
//! operations the HTTP layer (or a test) can call directly.

use crate::bus::SubscriberStats;
use crate::cleanup::{CleanupEngine, TableCleanupReport};
use crate::config::Settings;
use crate::migration::{CycleReport, MigrationEngine};
use crate::queue::{BatchQueueManager, TierWriter};
use crate::store::ConnectionPool;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: &'static str,
    pub components: ComponentHealth,
    pub subscriptions: u64,
    pub queue_sizes: Vec<(String, usize)>,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub hot_store: bool,
    pub cold_store: bool,
    pub bus: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub total_writes: u64,
    pub successful_writes: u64,
    pub failed_writes: u64,
    pub messages_received: u64,
    pub retries: u64,
    pub reconnects: u64,
    pub queue_depth: usize,
    pub last_migration: Option<DateTime<Utc>>,
    pub last_cleanup: Option<DateTime<Utc>>,
}

pub struct AdminFacade {
    settings: Settings,
    queue: Arc<BatchQueueManager>,
    hot_writer: Arc<TierWriter>,
    hot_pool: ConnectionPool,
    cold_pool: ConnectionPool,
    subscriber_stats: Arc<SubscriberStats>,
    migration: Arc<MigrationEngine>,
    cleanup: Vec<Arc<CleanupEngine>>,
    last_migration: Mutex<Option<(DateTime<Utc>, CycleReport)>>,
    last_cleanup: Mutex<Option<(DateTime<Utc>, Vec<TableCleanupReport>)>>,
}

impl AdminFacade {
    pub fn new(
        settings: Settings,
        queue: Arc<BatchQueueManager>,
        hot_writer: Arc<TierWriter>,
        hot_pool: ConnectionPool,
        cold_pool: ConnectionPool,
        subscriber_stats: Arc<SubscriberStats>,
        migration: Arc<MigrationEngine>,
        cleanup: Vec<Arc<CleanupEngine>>,
    ) -> Self {
        Self {
            settings,
            queue,
            hot_writer,
            hot_pool,
            cold_pool,
            subscriber_stats,
            migration,
            cleanup,
            last_migration: Mutex::new(None),
            last_cleanup: Mutex::new(None),
        }
    }

    /// Never reports 5xx-worthy failure for a healthy-but-degraded core:
    /// the body always carries `status`, with `issues[]` explaining why.
    pub fn status(&self) -> StatusReport {
        let mut issues = Vec::new();
        let hot_store = !self.hot_pool.is_saturated();
        let cold_store = !self.cold_pool.is_saturated();
        let bus = true;

        if !hot_store {
            issues.push("hot connection pool saturated".to_string());
        }
        if self.hot_writer.is_degraded() {
            issues.push("hot tier writer circuit breaker open".to_string());
        }

        let status = if issues.is_empty() { "healthy" } else { "degraded" };

        StatusReport {
            status,
            components: ComponentHealth { hot_store, cold_store, bus },
            subscriptions: crate::model::DataType::ALL.len() as u64,
            queue_sizes: crate::model::DataType::ALL
                .iter()
                .map(|dt| (dt.table_name().to_string(), self.queue.queue_depth(*dt)))
                .collect(),
            issues,
        }
    }

    pub fn stats(&self) -> StatsReport {
        let written = self.hot_writer.written_total();
        let failed = self.hot_writer.failed_batches_total();
        StatsReport {
            total_writes: written + failed,
            successful_writes: written,
            failed_writes: failed,
            messages_received: self.subscriber_stats.messages_received(),
            retries: self.hot_writer.retries_total(),
            reconnects: self.subscriber_stats.reconnects(),
            queue_depth: self.queue.total_depth(),
            last_migration: self.last_migration.lock().as_ref().map(|(t, _)| *t),
            last_cleanup: self.last_cleanup.lock().as_ref().map(|(t, _)| *t),
        }
    }

    /// Runs one migration cycle synchronously and records it as the most
    /// recent run; shared by the scheduler's periodic fire and the admin
    /// HTTP trigger so both paths update the same observable state.
    pub async fn trigger_migration(&self) -> CycleReport {
        let report = self.migration.run_cycle().await;
        *self.last_migration.lock() = Some((Utc::now(), report.clone()));
        report
    }

    /// Runs a cleanup cycle on every configured tier (hot, cold, or both
    /// per `StorageMode`) and concatenates their per-table reports.
    pub async fn trigger_cleanup(&self) -> Vec<TableCleanupReport> {
        let mut report = Vec::new();
        for engine in &self.cleanup {
            report.extend(engine.run_cycle().await);
        }
        *self.last_cleanup.lock() = Some((Utc::now(), report.clone()));
        report
    }

    pub fn migration_status(&self) -> serde_json::Value {
        let guard = self.last_migration.lock();
        match guard.as_ref() {
            Some((at, report)) => serde_json::json!({
                "enabled": true,
                "last_migration": at,
                "pending_migrations": report.total_tasks.saturating_sub(report.successful),
                "total_pending_records": 0,
            }),
            None => serde_json::json!({
                "enabled": true,
                "last_migration": null,
                "pending_migrations": 0,
                "total_pending_records": 0,
            }),
        }
    }

    pub fn config(&self) -> serde_json::Value {
        self.settings.sanitized()
    }
}
