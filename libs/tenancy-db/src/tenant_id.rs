//! Tenant identity carried by pools, scopes and tags.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque tenant identifier.
///
/// The core never interprets the value. Emptiness is rejected when a
/// connection is tagged; everything else is left to the database.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TenantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<&String> for TenantId {
    fn from(value: &String) -> Self {
        Self(value.clone())
    }
}

impl From<sqlx::types::Uuid> for TenantId {
    fn from(value: sqlx::types::Uuid) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
