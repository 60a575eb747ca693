//! Connection pool management for pg-console.
//!
//! Keeps one database pool per credential set, bounded in number and closed
//! when idle.

pub mod manager;

pub use manager::{PoolManager, PoolStats};

use std::fmt;

/// The credential set a pool is created for.
#[derive(Clone, PartialEq, Eq)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub ssl: bool,
}

impl PoolKey {
    /// Cache identity: `host:port:database:user:ssl`.
    ///
    /// The password is a connection parameter only; it never appears in the
    /// cache key, logs or stats.
    pub fn cache_key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.host, self.port, self.database, self.user, self.ssl
        )
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_key())
    }
}

impl fmt::Debug for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolKey")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("ssl", &self.ssl)
            .finish()
    }
}
