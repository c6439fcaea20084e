//! Transaction options for tenant-scoped transactions.
//!
//! These types keep driver types out of application signatures. They are
//! rendered into the `BEGIN` statement issued on the tagged connection.
//!
//! ```
//! use tenancy_db::{TxAccessMode, TxConfig, TxIsolationLevel};
//!
//! let cfg = TxConfig {
//!     isolation: Some(TxIsolationLevel::RepeatableRead),
//!     access_mode: Some(TxAccessMode::ReadOnly),
//! };
//! assert_eq!(
//!     cfg.begin_statement(),
//!     "BEGIN ISOLATION LEVEL REPEATABLE READ, READ ONLY"
//! );
//! ```

/// Transaction isolation level.
///
/// - `ReadUncommitted`: Lowest isolation. `PostgreSQL` treats it as `ReadCommitted`.
/// - `ReadCommitted`: Prevents dirty reads. Default for `PostgreSQL`.
/// - `RepeatableRead`: Snapshot isolation on `PostgreSQL`.
/// - `Serializable`: Transactions are fully serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxIsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl TxIsolationLevel {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            TxIsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            TxIsolationLevel::ReadCommitted => "READ COMMITTED",
            TxIsolationLevel::RepeatableRead => "REPEATABLE READ",
            TxIsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Transaction access mode.
///
/// `READ ONLY` transactions reject any write operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxAccessMode {
    ReadOnly,
    #[default]
    ReadWrite,
}

impl TxAccessMode {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            TxAccessMode::ReadOnly => "READ ONLY",
            TxAccessMode::ReadWrite => "READ WRITE",
        }
    }
}

/// Configuration for tenant-scoped transactions.
///
/// `None` fields fall back to the database session defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxConfig {
    pub isolation: Option<TxIsolationLevel>,
    pub access_mode: Option<TxAccessMode>,
}

impl TxConfig {
    #[must_use]
    pub fn read_only() -> Self {
        Self {
            isolation: None,
            access_mode: Some(TxAccessMode::ReadOnly),
        }
    }

    #[must_use]
    pub fn serializable() -> Self {
        Self {
            isolation: Some(TxIsolationLevel::Serializable),
            access_mode: None,
        }
    }

    /// Render the `BEGIN` statement for this configuration.
    #[must_use]
    pub fn begin_statement(&self) -> String {
        let modes: Vec<String> = self
            .isolation
            .map(|level| format!("ISOLATION LEVEL {}", level.as_sql()))
            .into_iter()
            .chain(self.access_mode.map(|mode| mode.as_sql().to_owned()))
            .collect();

        if modes.is_empty() {
            "BEGIN".to_owned()
        } else {
            format!("BEGIN {}", modes.join(", "))
        }
    }
}
