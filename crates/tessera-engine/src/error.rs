//! Unified engine error type.
//!
//! Components carry their own error enums; the coordinator surfaces them
//! through [`EngineError`]. `Busy` is retried inside the catalog up to a
//! bounded budget and only escapes when the budget is exhausted. On any
//! other kind the coordinator releases leases and staging claims, removes
//! in-flight temporaries, and propagates.

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::lease::LeaseError;
use crate::staging::StagingError;
use crate::store::StoreError;
use tessera_core::keys::KeyError;
use tessera_core::schema::SchemaError;

/// Top-level error surfaced to callers of the engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Key validation or identity failure.
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Dtype, jagged, or schema-document failure.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Catalog failure, including exhausted busy retries and identity
    /// conflicts.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Part file store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Staging queue failure.
    #[error(transparent)]
    Staging(#[from] StagingError),

    /// Advisory lease refused or failed.
    #[error(transparent)]
    Lease(#[from] LeaseError),

    /// A recomputed content hash disagreed with the catalog.
    #[error("content hash mismatch for part {part_uuid}: expected {expected}, computed {computed}")]
    ContentHashMismatch {
        /// The part whose bytes disagree.
        part_uuid: String,
        /// Hash recorded in the catalog or file attributes.
        expected: String,
        /// Hash recomputed from the bytes.
        computed: String,
    },

    /// Source and destination catalogs disagree on a merge invariant.
    #[error("merge invariant violated: {detail}")]
    MergeInvariantViolated {
        /// The disagreeing invariant.
        detail: String,
    },

    /// Filesystem or sync failure outside the part store.
    #[error("I/O fault: {context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The configuration refuses this operation.
    #[error("configuration rejected: {detail}")]
    Config {
        /// What was refused.
        detail: String,
    },
}

impl EngineError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
