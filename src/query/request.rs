//! Inbound execute requests and their validation.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

use crate::error::{ConsoleError, Result};
use crate::pool::PoolKey;

/// Connection credentials supplied with a request.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    #[serde(default)]
    pub host: Option<String>,
    /// Accepts a JSON number or a numeric string.
    #[serde(default, deserialize_with = "deserialize_port")]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    /// `"require"` enables SSL without certificate verification.
    #[serde(default)]
    pub ssl_mode: Option<String>,
}

impl Credentials {
    /// Resolves the pool key, failing if any required field is missing.
    ///
    /// A missing password is treated as empty.
    pub fn to_pool_key(&self) -> Result<PoolKey> {
        let host = present(&self.host);
        let user = present(&self.user);
        let database = present(&self.database);

        let mut missing = Vec::new();
        if host.is_none() {
            missing.push("host");
        }
        if self.port.is_none() {
            missing.push("port");
        }
        if user.is_none() {
            missing.push("user");
        }
        if database.is_none() {
            missing.push("database");
        }
        if !missing.is_empty() {
            return Err(ConsoleError::invalid_request(format!(
                "Missing required connection parameters: {}",
                missing.join(", ")
            )));
        }

        Ok(PoolKey {
            host: host.unwrap_or_default().to_string(),
            port: self.port.unwrap_or_default(),
            database: database.unwrap_or_default().to_string(),
            user: user.unwrap_or_default().to_string(),
            password: self.password.clone().unwrap_or_default(),
            ssl: self
                .ssl_mode
                .as_deref()
                .is_some_and(|mode| mode.trim().eq_ignore_ascii_case("require")),
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Returns the trimmed value if it is non-empty.
fn present(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn deserialize_port<'de, D>(deserializer: D) -> std::result::Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Option::<Port>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Port::Number(port)) => Ok(Some(port)),
        Some(Port::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(Port::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("invalid port '{text}'"))),
    }
}

/// Body of an execute request: credentials plus raw SQL text.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecuteRequest {
    #[serde(flatten)]
    pub credentials: Credentials,
    #[serde(default)]
    pub sql: Option<String>,
}

impl ExecuteRequest {
    pub fn new(credentials: Credentials, sql: impl Into<String>) -> Self {
        Self {
            credentials,
            sql: Some(sql.into()),
        }
    }

    /// Checks that credentials and SQL are present.
    ///
    /// Blank SQL passes here; it is rejected later as containing no statements.
    pub fn validate(&self) -> Result<(PoolKey, &str)> {
        let key = self.credentials.to_pool_key()?;
        let sql = self
            .sql
            .as_deref()
            .ok_or_else(|| ConsoleError::invalid_request("SQL query is required"))?;
        Ok((key, sql))
    }
}
