//! Tagging protocol: mark and unmark a database session with a tenant.
//!
//! The tag statement sets a session-scoped "current tenant" that the
//! database's row-level-security policies read; the untag statement clears it
//! so the connection can be recycled. Both run on the raw connection under the
//! caller's [`Scope`] deadline.

use crate::driver::RawConnection;
use crate::{Result, Scope, TenancyError, TenantId};

/// Default statement applying a tenant tag. `$1` is bound to the tenant id.
pub const DEFAULT_TAG_STATEMENT: &str = "select set_tenant($1)";

/// Default statement clearing the tenant tag.
pub const DEFAULT_UNTAG_STATEMENT: &str = "select set_tenant('')";

/// The pair of statements used to tag and untag a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggingProtocol {
    tag_statement: String,
    untag_statement: String,
}

impl Default for TaggingProtocol {
    fn default() -> Self {
        Self {
            tag_statement: DEFAULT_TAG_STATEMENT.to_owned(),
            untag_statement: DEFAULT_UNTAG_STATEMENT.to_owned(),
        }
    }
}

impl TaggingProtocol {
    /// Build a protocol from custom statements.
    ///
    /// # Errors
    /// Returns `TenancyError::InvalidOption` if a statement is empty or the tag
    /// statement has no `$1` placeholder for the tenant id.
    pub fn new(tag_statement: impl Into<String>, untag_statement: impl Into<String>) -> Result<Self> {
        let protocol = Self {
            tag_statement: tag_statement.into(),
            untag_statement: untag_statement.into(),
        };
        protocol.validate()?;
        Ok(protocol)
    }

    /// Check that both statements are usable.
    ///
    /// # Errors
    /// Returns `TenancyError::InvalidOption` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.tag_statement.trim().is_empty() {
            return Err(TenancyError::InvalidOption(
                "tag statement must not be empty".to_owned(),
            ));
        }
        if !self.tag_statement.contains("$1") {
            return Err(TenancyError::InvalidOption(format!(
                "tag statement `{}` must bind the tenant id as $1",
                self.tag_statement
            )));
        }
        if self.untag_statement.trim().is_empty() {
            return Err(TenancyError::InvalidOption(
                "untag statement must not be empty".to_owned(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn tag_statement(&self) -> &str {
        &self.tag_statement
    }

    #[must_use]
    pub fn untag_statement(&self) -> &str {
        &self.untag_statement
    }

    /// Tag `conn` with `tenant_id`. Completes only once the database acked it.
    ///
    /// The caller owns recovery: on error the connection is in an unknown tag
    /// state and must be closed, never released.
    ///
    /// # Errors
    /// `EmptyTenantId` for an empty id, `Statement` if the database rejects
    /// the tag, `DeadlineExceeded`/`Cancelled` from the scope.
    pub async fn tag<C: RawConnection>(
        &self,
        conn: &mut C,
        tenant_id: &TenantId,
        scope: &Scope,
    ) -> Result<()> {
        if tenant_id.is_empty() {
            return Err(TenancyError::EmptyTenantId);
        }
        scope
            .run(async {
                conn.session_statement(&self.tag_statement, Some(tenant_id.as_str()))
                    .await
                    .map_err(TenancyError::from)
            })
            .await
    }

    /// Clear the tenant tag on `conn`.
    ///
    /// # Errors
    /// `Statement` if the database rejects the statement,
    /// `DeadlineExceeded`/`Cancelled` from the scope.
    pub async fn untag<C: RawConnection>(&self, conn: &mut C, scope: &Scope) -> Result<()> {
        scope
            .run(async {
                conn.session_statement(&self.untag_statement, None)
                    .await
                    .map_err(TenancyError::from)
            })
            .await
    }
}
