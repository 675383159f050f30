//! Typed errors for the indexing pipeline.
//!
//! Cache misses on never-deferred ids and whole-page multicall failures are
//! fatal for the batch; per-call failures and fee-growth inconsistencies are
//! handled locally by the callers.

use thiserror::Error;

use crate::model::EntityKind;

/// Violations of the entity cache contract.
///
/// A `NotDeferred` error means a fold step tried to read an id that was never
/// prefetched or added. That is a bug in the prefetch phase, and the batch
/// must stop instead of silently fetching (which would break the
/// one-round-trip-per-kind guarantee).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("{kind} `{id}` read before being deferred/loaded or added")]
    NotDeferred { kind: EntityKind, id: String },

    #[error("{kind} `{id}` required but absent from the cache")]
    Missing { kind: EntityKind, id: String },

    #[error("{kind} `{id}` holds a different entity variant")]
    WrongVariant { kind: EntityKind, id: String },
}

/// Failures of the batched on-chain read aggregator.
#[derive(Error, Debug)]
pub enum MulticallError {
    /// A call reverted inside a strict `aggregate`. Strict callers have no
    /// fallback for partial data, so the whole operation is aborted.
    #[error("call #{index} reverted in strict aggregate")]
    CallFailed { index: usize },

    #[error("failed to decode return data for call #{index}: {message}")]
    Decode { index: usize, message: String },

    /// The whole page failed (RPC unavailable, malformed response). Fatal for
    /// the batch; the driver retries at the batch level.
    #[error("multicall transport failed: {0}")]
    Transport(String),
}
