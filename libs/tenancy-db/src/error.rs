//! Error types for tenant-scoped database access.

use std::fmt;

use crate::TenantId;

/// Library-local result type.
pub type Result<T> = std::result::Result<T, TenancyError>;

/// Typed error for tenant pools, handles and configuration.
#[derive(Debug, thiserror::Error)]
pub enum TenancyError {
    /// A pool option could not be parsed or is inconsistent.
    #[error("invalid pool option: {0}")]
    InvalidOption(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("configuration error: {0}")]
    Config(Box<figment::Error>),

    #[error("tenant id must not be empty")]
    EmptyTenantId,

    /// The driver pool could not hand out a connection.
    #[error("failed to acquire a connection from the driver pool: {0}")]
    Acquire(#[source] sqlx::Error),

    /// The tag statement failed. The freshly acquired connection was closed;
    /// `close_error` holds the close failure, if that failed too.
    #[error(
        "failed to tag connection for tenant `{tenant_id}`: {source}{}",
        close_suffix(.close_error.as_ref())
    )]
    Tag {
        tenant_id: TenantId,
        #[source]
        source: Box<TenancyError>,
        close_error: Option<sqlx::Error>,
    },

    /// A statement issued by the caller (or by the tagging protocol) failed.
    #[error(transparent)]
    Statement(#[from] sqlx::Error),

    #[error("tenant pool for `{0}` is closed")]
    PoolClosed(TenantId),

    #[error("connection was released when its tenant pool closed")]
    ConnectionReleased,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Close(#[from] CloseError),
}

impl From<figment::Error> for TenancyError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

fn close_suffix(close_error: Option<&sqlx::Error>) -> String {
    close_error.map_or_else(String::new, |err| format!(" (closing the connection also failed: {err})"))
}

/// Step of the per-connection cleanup that failed during `TenantPool::close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStage {
    /// Rolling back a transaction that was dropped without commit/rollback.
    Rollback,
    /// Clearing the tenant tag.
    Untag,
    /// Closing the physical connection.
    Close,
}

impl fmt::Display for CleanupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CleanupStage::Rollback => "rollback",
            CleanupStage::Untag => "untag",
            CleanupStage::Close => "close",
        })
    }
}

/// One failed cleanup step for one tracked connection.
#[derive(Debug, thiserror::Error)]
#[error("connection #{connection} {stage} failed: {source}")]
pub struct CleanupFailure {
    pub connection: u64,
    pub stage: CleanupStage,
    pub source: TenancyError,
}

/// Every failure collected while closing a tenant pool.
///
/// Cleanup never short-circuits: each tracked connection gets its untag and
/// close attempts, and every failure is kept here for inspection.
#[derive(Debug)]
pub struct CloseError {
    tenant_id: TenantId,
    failures: Vec<CleanupFailure>,
}

impl CloseError {
    pub(crate) fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            failures: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, connection: u64, stage: CleanupStage, source: TenancyError) {
        self.failures.push(CleanupFailure {
            connection,
            stage,
            source,
        });
    }

    pub(crate) fn into_result(self) -> std::result::Result<(), Self> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }

    #[must_use]
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    #[must_use]
    pub fn failures(&self) -> &[CleanupFailure] {
        &self.failures
    }

    #[must_use]
    pub fn into_failures(self) -> Vec<CleanupFailure> {
        self.failures
    }

    /// Failures recorded for one connection, in the order they happened.
    pub fn for_connection(&self, connection: u64) -> impl Iterator<Item = &CleanupFailure> {
        self.failures
            .iter()
            .filter(move |failure| failure.connection == connection)
    }
}

impl fmt::Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "closing tenant pool for `{}` failed with {} error(s)",
            self.tenant_id,
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures
            .first()
            .map(|failure| failure as &(dyn std::error::Error + 'static))
    }
}
