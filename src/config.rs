//! Layered configuration: a YAML base file overlaid with environment
//! variable overrides, loaded once at startup. Reload is out of scope.
//!
//! Mirrors the donor's `DataSourceKillSwitch::new` pattern of "read an env
//! var, fall back to a default" but centralizes it behind the `config`
//! crate instead of scattering `env::var` calls through `main.rs`.

use crate::error::StorageError;
use serde::Deserialize;
use std::time::Duration;

/// Which tier(s) this process instance is active for, overridden by
/// `STORAGE_MODE`. Migration always needs both store clients constructed
/// to read hot/write cold, so `mode` only gates which of the Bus
/// Subscriber (ingestion) and the tier-specific Cleanup Engine run;
/// Schema Manager initializes both tiers regardless, since dropping a
/// table out of the schema would make `mode` un-toggleable without a
/// restart-and-reinit cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    Hot,
    Cold,
    Both,
}

impl Default for StorageMode {
    fn default() -> Self {
        StorageMode::Both
    }
}

impl StorageMode {
    pub fn ingests(&self) -> bool {
        matches!(self, StorageMode::Hot | StorageMode::Both)
    }

    pub fn runs_cold_cleanup(&self) -> bool {
        matches!(self, StorageMode::Cold | StorageMode::Both)
    }

    pub fn runs_hot_cleanup(&self) -> bool {
        matches!(self, StorageMode::Hot | StorageMode::Both)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    #[serde(default = "default_true")]
    pub use_https: bool,
}

impl StoreEndpoint {
    pub fn base_url(&self) -> String {
        let scheme = if self.use_https { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct TierConfig {
    pub store: StoreEndpoint,
    /// Retention ceiling for this tier's DBMS-side TTL, in days.
    pub ttl_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_max_size")]
    pub max_size: usize,
    #[serde(default = "default_pool_pre_warm")]
    pub pre_warm: usize,
    #[serde(default = "default_pool_wait_budget_ms")]
    pub wait_budget_ms: u64,
}

fn default_pool_max_size() -> usize {
    10
}
fn default_pool_pre_warm() -> usize {
    3
}
fn default_pool_wait_budget_ms() -> u64 {
    5_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_pool_max_size(),
            pre_warm: default_pool_pre_warm(),
            wait_budget_ms: default_pool_wait_budget_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_secs() -> u64 {
    1
}
fn default_multiplier() -> u32 {
    2
}
fn default_max_delay_secs() -> u64 {
    30
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay_secs(),
            multiplier: default_multiplier(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

impl RetrySettings {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_for_attempt_with_base(attempt, self.base_delay_secs)
    }

    /// Like `delay_for_attempt`, but floors the base delay at `min_base_secs`
    /// — used to give rate-limit errors a longer starting backoff than a
    /// plain transient error (§7).
    pub fn delay_for_attempt_with_base(&self, attempt: u32, min_base_secs: u64) -> Duration {
        let base = self.base_delay_secs.max(min_base_secs);
        let raw = base.saturating_mul(self.multiplier.pow(attempt) as u64);
        Duration::from_secs(raw.min(self.max_delay_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    pub urls: Vec<String>,
    #[serde(default = "default_durable_prefix")]
    pub durable_prefix: String,
    #[serde(default = "default_stream_name")]
    pub stream_name: String,
    #[serde(default = "default_max_unacked")]
    pub max_unacked: u32,
    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: u64,
    /// Per-type override: true selects ack-after-flush instead of the
    /// default ack-on-enqueue. Keyed by `DataType::table_name()`.
    #[serde(default)]
    pub ack_after_flush: Vec<String>,
}

fn default_durable_prefix() -> String {
    "storage-service".to_string()
}
fn default_stream_name() -> String {
    "MARKET_DATA".to_string()
}
fn default_max_unacked() -> u32 {
    2000
}
fn default_ack_wait_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    #[serde(default = "default_age_threshold_hours")]
    pub age_threshold_hours: u32,
    #[serde(default = "default_migration_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub verification_enabled: bool,
    #[serde(default = "default_parallel_workers")]
    pub parallel_workers: usize,
    #[serde(default = "default_size_threshold_mb")]
    pub size_threshold_mb: u64,
    /// Optional daily window `[start_hour, end_hour)` in local time.
    #[serde(default)]
    pub window: Option<(u32, u32)>,
    #[serde(default = "default_migration_cron")]
    pub schedule_cron: String,
}

fn default_age_threshold_hours() -> u32 {
    24
}
fn default_migration_batch_size() -> usize {
    10_000
}
fn default_parallel_workers() -> usize {
    4
}
fn default_size_threshold_mb() -> u64 {
    1024
}
fn default_migration_cron() -> String {
    "0 0 * * * *".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
    #[serde(default)]
    pub smart_cleanup: bool,
    #[serde(default = "default_disk_threshold")]
    pub disk_threshold: f64,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_cleanup_cron")]
    pub schedule_cron: String,
}

fn default_max_age_days() -> u32 {
    365
}
fn default_disk_threshold() -> f64 {
    0.85
}
fn default_cleanup_cron() -> String {
    "0 30 0 * * *".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_bind")]
    pub bind: String,
}

fn default_admin_bind() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub mode: StorageMode,
    pub hot: TierConfig,
    pub cold: TierConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetrySettings,
    pub bus: BusConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            age_threshold_hours: default_age_threshold_hours(),
            batch_size: default_migration_batch_size(),
            verification_enabled: true,
            parallel_workers: default_parallel_workers(),
            size_threshold_mb: default_size_threshold_mb(),
            window: None,
            schedule_cron: default_migration_cron(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
            smart_cleanup: false,
            disk_threshold: default_disk_threshold(),
            dry_run: false,
            schedule_cron: default_cleanup_cron(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind: default_admin_bind(),
        }
    }
}

impl Settings {
    /// Loads `path` (YAML) as the base layer, then overlays environment
    /// variables prefixed `STORAGE_`: a top-level field name overrides
    /// directly (`STORAGE_MODE` -> `mode`), a nested field overrides via a
    /// `__` path separator (`STORAGE__BUS__DURABLE_PREFIX` ->
    /// `bus.durable_prefix`, `STORAGE__HOT__STORE__HOST` -> `hot.store.host`).
    pub fn load(path: &str) -> Result<Self, StorageError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(path).required(true))
            .add_source(
                config::Environment::with_prefix("STORAGE")
                    .separator("__")
                    .try_parsing(true),
            );

        let raw = builder
            .build()
            .map_err(|e| StorageError::ConfigInvalid(e.to_string()))?;

        raw.try_deserialize()
            .map_err(|e| StorageError::ConfigInvalid(e.to_string()))
    }

    /// The subset of configuration safe to disclose via the admin `/config`
    /// endpoint: secrets (store passwords, bus credentials) redacted.
    pub fn sanitized(&self) -> serde_json::Value {
        serde_json::json!({
            "enabled": true,
            "schedule_cron": {
                "migration": self.migration.schedule_cron,
                "cleanup": self.cleanup.schedule_cron,
            },
            "retention_days": {
                "hot": self.hot.ttl_days,
                "cold": self.cold.ttl_days,
            },
            "batch_size": self.migration.batch_size,
            "parallel_workers": self.migration.parallel_workers,
            "verification_enabled": self.migration.verification_enabled,
        })
    }
}
