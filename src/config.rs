//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `WIKI_HTTP_PORT`: shared listening port for the front tier (default: 8080)
//! - `WIKI_HTTP_INSTANCES`: number of front-tier replicas (default: 2)
//! - `WIKI_DATABASE_URL`: sqlx SQLite URL (default: sqlite://wiki.db?mode=rwc)
//! - `WIKI_DB_MAX_CONNECTIONS`: connection pool size (default: 5)
//! - `WIKI_QUERIES_FILE`: query catalog file (default: built-in query set)
//! - `WIKI_REPLY_TIMEOUT_MS`: bus request reply timeout (default: 5000)

use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

/// Default externally visible HTTP port.
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default front-tier replica count.
pub const DEFAULT_HTTP_INSTANCES: usize = 2;

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Shared listening port for all front-tier instances
    pub http_port: u16,

    /// Number of identical front-tier instances behind the one port
    pub http_instances: usize,

    /// SQLite connection URL (owned by the persistence worker)
    pub database_url: String,

    /// Connection pool size for the persistence worker
    pub db_max_connections: u32,

    /// Query catalog file; None selects the built-in set
    pub queries_file: Option<PathBuf>,

    /// How long a front-tier request waits for a persistence reply
    pub reply_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let http_port = match env::var("WIKI_HTTP_PORT") {
            Ok(raw) => raw.parse().context("invalid WIKI_HTTP_PORT")?,
            Err(_) => DEFAULT_HTTP_PORT,
        };

        let http_instances = match env::var("WIKI_HTTP_INSTANCES") {
            Ok(raw) => {
                let count: usize = raw.parse().context("invalid WIKI_HTTP_INSTANCES")?;
                count.max(1)
            }
            Err(_) => DEFAULT_HTTP_INSTANCES,
        };

        let database_url = env::var("WIKI_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://wiki.db?mode=rwc".to_string());

        let db_max_connections = match env::var("WIKI_DB_MAX_CONNECTIONS") {
            Ok(raw) => raw.parse().context("invalid WIKI_DB_MAX_CONNECTIONS")?,
            Err(_) => 5,
        };

        let queries_file = env::var("WIKI_QUERIES_FILE").ok().map(PathBuf::from);

        let reply_timeout_ms = match env::var("WIKI_REPLY_TIMEOUT_MS") {
            Ok(raw) => raw.parse().context("invalid WIKI_REPLY_TIMEOUT_MS")?,
            Err(_) => 5000,
        };

        Ok(Self {
            http_port,
            http_instances,
            database_url,
            db_max_connections,
            queries_file,
            reply_timeout: Duration::from_millis(reply_timeout_ms),
        })
    }

    /// Address the acceptor binds: all interfaces on the configured port.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.http_port))
    }

    /// Create a test configuration against a scratch database. Port 0 lets
    /// the acceptor pick a free port.
    pub fn test_config(database_url: &str) -> Self {
        Self {
            http_port: 0,
            http_instances: 3,
            database_url: database_url.to_string(),
            db_max_connections: 5,
            queries_file: None,
            reply_timeout: Duration::from_secs(2),
        }
    }
}
