use clap::Parser;
use std::time::Duration;

use crate::db::{PoolSettings, Target};
use crate::error::ConfigError;
use crate::executor::QueryLimits;

fn default_port() -> u16 {
    3306
}

/// Command line arguments. Every flag can also come from the environment.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Read-only MySQL access over line-delimited JSON-RPC on stdio", long_about = None)]
pub struct Args {
    /// MySQL host to connect to at startup
    #[arg(long, env = "MYSQL_HOST")]
    pub host: Option<String>,

    /// MySQL port
    #[arg(long, env = "MYSQL_PORT", default_value_t = default_port())]
    pub port: u16,

    /// MySQL username
    #[arg(long, env = "MYSQL_USER")]
    pub user: Option<String>,

    /// MySQL password
    #[arg(long, env = "MYSQL_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Default database (empty means none)
    #[arg(long, env = "MYSQL_DATABASE")]
    pub database: Option<String>,

    /// Maximum number of rows returned by a single query
    #[arg(long, env = "ROW_LIMIT", default_value_t = 1000)]
    pub row_limit: usize,

    /// Query timeout in milliseconds
    #[arg(long = "query-timeout", env = "QUERY_TIMEOUT", default_value_t = 10_000)]
    pub query_timeout_ms: u64,

    /// Number of pooled connections
    #[arg(long, env = "POOL_SIZE", default_value_t = 10)]
    pub pool_size: u32,

    /// Connection attempts made at startup before giving up
    #[arg(long, env = "CONNECT_RETRIES", default_value_t = 3)]
    pub connect_retries: u32,

    /// Seconds of inactivity before a `$/alive` notification is written
    #[arg(long, env = "KEEPALIVE_IDLE_SECS", default_value_t = 10)]
    pub keepalive_idle_secs: u64,

    /// How often the keep-alive task checks for inactivity, in milliseconds
    #[arg(long, env = "KEEPALIVE_INTERVAL_MS", default_value_t = 1000)]
    pub keepalive_interval_ms: u64,

    /// Upper bound on closing the pool during shutdown, in seconds
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 5)]
    pub shutdown_timeout_secs: u64,
}

impl Args {
    /// The target to connect to before serving requests, if any.
    ///
    /// Returns `Ok(None)` when no credentials were given at all; the server
    /// then waits for a `connect_db` call. Giving some but not all of host,
    /// user and password is an error.
    pub fn startup_target(&self) -> Result<Option<Target>, ConfigError> {
        if self.host.is_none() && self.user.is_none() && self.password.is_none() {
            return Ok(None);
        }
        let host = self
            .host
            .clone()
            .filter(|h| !h.trim().is_empty())
            .ok_or(ConfigError::MissingCredential("MYSQL_HOST"))?;
        let user = self
            .user
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or(ConfigError::MissingCredential("MYSQL_USER"))?;
        let password = self
            .password
            .clone()
            .ok_or(ConfigError::MissingCredential("MYSQL_PASSWORD"))?;

        Ok(Some(Target {
            host,
            port: self.port,
            user,
            password,
            database: self.database.clone().filter(|d| !d.is_empty()),
        }))
    }

    pub fn query_limits(&self) -> QueryLimits {
        QueryLimits {
            row_limit: self.row_limit,
            timeout: Duration::from_millis(self.query_timeout_ms),
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_connections: self.pool_size.max(1),
            query_timeout: Duration::from_millis(self.query_timeout_ms),
            close_timeout: Duration::from_secs(self.shutdown_timeout_secs),
        }
    }

    pub fn keepalive_idle(&self) -> Duration {
        Duration::from_secs(self.keepalive_idle_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms.max(1))
    }
}
