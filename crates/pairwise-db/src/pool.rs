//! Connection pool sizing and health for the queue and dedup stores.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use pairwise_core::{Error, Result};

/// Default maximum number of connections in the pool.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Connections needed besides one per executor: the reaper and the dedup
/// service calls made from handlers.
pub const RESERVED_CONNECTIONS: u32 = 2;

/// Default acquire timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default idle timeout in seconds.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default connection lifetime in seconds.
pub const DEFAULT_MAX_LIFETIME_SECS: u64 = 1800;

/// Pool configuration options.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_connections: 1,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            max_lifetime: Some(Duration::from_secs(DEFAULT_MAX_LIFETIME_SECS)),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DB_MAX_CONNECTIONS` | `10` | Pool ceiling |
    /// | `DB_MIN_CONNECTIONS` | `1` | Connections kept open |
    /// | `DB_CONNECT_TIMEOUT_SECS` | `30` | Acquire timeout |
    /// | `DB_IDLE_TIMEOUT_SECS` | `600` | Idle connection lifetime |
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());
        let mut config = Self::default();
        if let Some(n) = parse("DB_MAX_CONNECTIONS").and_then(|n| u32::try_from(n).ok()) {
            config.max_connections = n.max(1);
        }
        if let Some(n) = parse("DB_MIN_CONNECTIONS").and_then(|n| u32::try_from(n).ok()) {
            config.min_connections = n;
        }
        if let Some(secs) = parse("DB_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse("DB_IDLE_TIMEOUT_SECS") {
            config.idle_timeout = Duration::from_secs(secs);
        }
        config.min_connections = config.min_connections.min(config.max_connections);
        config
    }

    /// Raise the ceiling so `executors` concurrent leases never starve the
    /// reaper or handler-side writes.
    pub fn with_capacity_for(mut self, executors: usize) -> Self {
        let needed = u32::try_from(executors)
            .unwrap_or(u32::MAX)
            .saturating_add(RESERVED_CONNECTIONS);
        if self.max_connections < needed {
            warn!(
                subsystem = "db",
                component = "pool",
                configured = self.max_connections,
                needed,
                executors,
                "Pool too small for worker pool, raising max_connections"
            );
            self.max_connections = needed;
        }
        self
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }

    pub fn min_connections(mut self, n: u32) -> Self {
        self.min_connections = n;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn max_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_lifetime = lifetime;
        self
    }
}

/// Create a PostgreSQL connection pool with default configuration.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    create_pool_with_config(database_url, PoolConfig::default()).await
}

/// Create a PostgreSQL connection pool.
pub async fn create_pool_with_config(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let start = Instant::now();

    info!(
        subsystem = "db",
        component = "pool",
        op = "create",
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        connect_timeout_secs = config.connect_timeout.as_secs(),
        "Creating database connection pool"
    );

    let mut options = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connect_timeout)
        .idle_timeout(config.idle_timeout);
    if let Some(max_lifetime) = config.max_lifetime {
        options = options.max_lifetime(max_lifetime);
    }

    let pool = options
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    info!(
        subsystem = "db",
        component = "pool",
        op = "established",
        pool_size = pool.size(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Database connection pool established"
    );
    Ok(pool)
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolHealth {
    pub size: u32,
    pub idle: usize,
}

impl PoolHealth {
    /// Every open connection is checked out; the next lease will wait.
    pub fn saturated(&self) -> bool {
        self.size > 0 && self.idle == 0
    }
}

/// Log pool occupancy and return it. Warns when the pool is saturated.
pub fn log_pool_metrics(pool: &PgPool) -> PoolHealth {
    let health = PoolHealth {
        size: pool.size(),
        idle: pool.num_idle(),
    };

    debug!(
        subsystem = "db",
        component = "pool",
        op = "metrics",
        pool_size = health.size,
        pool_idle = health.idle,
        "Pool health check"
    );
    if health.saturated() {
        warn!(
            subsystem = "db",
            component = "pool",
            pool_size = health.size,
            "Connection pool has no idle connections"
        );
    }
    health
}
