//! Identifiers and options for scheduled requests.

use crate::context::FetchContext;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a sendable request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a new random request ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::Serialization(format!("invalid request ID: {e}")))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the scheduler should treat the keys of a get request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetOptions {
    /// Never go to the network; keys missing locally fail.
    #[serde(default)]
    pub local_only: bool,
    /// Skip the local store check.
    #[serde(default)]
    pub ignore_store: bool,
    /// Do not promote hits in the local store.
    #[serde(default)]
    pub dont_cache: bool,
    /// Report failures as one aggregated event per batch.
    #[serde(default)]
    pub bulk_failure: bool,
}

impl GetOptions {
    pub fn from_context(ctx: &FetchContext) -> Self {
        Self {
            local_only: ctx.local_request_only(),
            ignore_store: ctx.ignore_store(),
            dont_cache: false,
            bulk_failure: false,
        }
    }

    pub fn with_bulk_failure(mut self) -> Self {
        self.bulk_failure = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_parse() {
        let id = RequestId::new();
        assert_eq!(RequestId::parse(&id.to_string()).unwrap(), id);
        assert!(RequestId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_get_options_follow_context() {
        let ctx = FetchContext::builder()
            .local_request_only(true)
            .build()
            .unwrap();
        let opts = GetOptions::from_context(&ctx);
        assert!(opts.local_only);
        assert!(!opts.bulk_failure);
        assert!(opts.with_bulk_failure().bulk_failure);
    }
}
