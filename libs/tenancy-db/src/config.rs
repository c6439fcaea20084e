//! Configuration for tenant pools and the driver pool behind them.
//!
//! Loaded through `figment`, so the same struct can come from YAML, env vars
//! or an in-memory `Serialized` provider:
//!
//! ```yaml
//! tenancy:
//!   dsn: "postgres://app:secret@db:5432/app"
//!   single_connection: false
//!   pool:
//!     max_conns: 20
//!     acquire_timeout: "5s"
//!     max_lifetime: "30m"
//! ```

use std::time::Duration;

use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::{PoolOptions, Result, TaggingProtocol, TenancyError};

/// Driver pool settings. Unset values keep the driver's defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolCfg {
    pub max_conns: Option<u32>,
    pub min_conns: Option<u32>,
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub max_lifetime: Option<Duration>,
    pub test_before_acquire: bool,
}

/// Tenant pool configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TenancyConfig {
    pub dsn: String,
    #[serde(default)]
    pub pool: PoolCfg,
    #[serde(default)]
    pub single_connection: bool,
    #[serde(default = "default_tag_statement")]
    pub tag_statement: String,
    #[serde(default = "default_untag_statement")]
    pub untag_statement: String,
}

fn default_tag_statement() -> String {
    crate::protocol::DEFAULT_TAG_STATEMENT.to_owned()
}

fn default_untag_statement() -> String {
    crate::protocol::DEFAULT_UNTAG_STATEMENT.to_owned()
}

impl TenancyConfig {
    #[must_use]
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            pool: PoolCfg::default(),
            single_connection: false,
            tag_statement: default_tag_statement(),
            untag_statement: default_untag_statement(),
        }
    }

    /// Extract and validate the section at `key` (e.g. `"tenancy"`).
    ///
    /// # Errors
    /// `Config` if the section is missing or malformed, `InvalidConfig` or
    /// `InvalidOption` if its values are unusable.
    pub fn from_figment(figment: &Figment, key: &str) -> Result<Self> {
        let cfg: Self = figment.extract_inner(key)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// # Errors
    /// `InvalidConfig` for an empty DSN or inverted pool limits,
    /// `InvalidOption` for an unusable tagging protocol.
    pub fn validate(&self) -> Result<()> {
        if self.dsn.trim().is_empty() {
            return Err(TenancyError::InvalidConfig("dsn must not be empty".to_owned()));
        }
        if let (Some(min), Some(max)) = (self.pool.min_conns, self.pool.max_conns)
            && min > max
        {
            return Err(TenancyError::InvalidConfig(format!(
                "pool.min_conns ({min}) exceeds pool.max_conns ({max})"
            )));
        }
        self.protocol().map(|_| ())
    }

    /// # Errors
    /// `InvalidOption` if the statements fail validation.
    pub fn protocol(&self) -> Result<TaggingProtocol> {
        TaggingProtocol::new(self.tag_statement.clone(), self.untag_statement.clone())
    }

    /// Tenant pool options described by this config.
    ///
    /// # Errors
    /// `InvalidOption` if the statements fail validation.
    pub fn pool_options(&self) -> Result<PoolOptions> {
        let opts = PoolOptions::new().with_protocol(self.protocol()?);
        Ok(if self.single_connection {
            opts.single_connection()
        } else {
            opts
        })
    }

    /// DSN with any password masked, for logs.
    #[must_use]
    pub fn redacted_dsn(&self) -> String {
        redact_credentials_in_dsn(Some(&self.dsn))
    }

    /// Connect the Postgres driver pool described by this config.
    ///
    /// # Errors
    /// `Acquire` if the database is unreachable.
    #[cfg(feature = "pg")]
    pub async fn connect(&self) -> Result<crate::PgSource> {
        tracing::info!(dsn = %self.redacted_dsn(), "connecting tenant driver pool");
        crate::PgSource::connect(&self.dsn, &self.pool).await
    }
}

/// Mask the password in a DSN. `None` renders as `"none"`.
#[must_use]
pub fn redact_credentials_in_dsn(dsn: Option<&str>) -> String {
    match dsn {
        Some(dsn) if dsn.contains('@') => match url::Url::parse(dsn) {
            Ok(mut parsed) => {
                if parsed.password().is_some() && parsed.set_password(Some("***")).is_err() {
                    return "***".to_owned();
                }
                parsed.to_string()
            }
            Err(_) => "***".to_owned(),
        },
        Some(dsn) => dsn.to_owned(),
        None => "none".to_owned(),
    }
}
