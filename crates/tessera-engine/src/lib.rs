//! # tessera-engine
//!
//! The write-path and identity/catalog layer of the tessera dataset storage
//! engine: atomic part publication, the relational catalog with its change
//! feed, the crash-safe staging queue, writer coordination under advisory
//! leases, and idempotent catalog-to-catalog merge.
//!
//! A *dataset root* is a self-contained directory:
//!
//! ```text
//! <root>/
//!   catalog.db        relational catalog (WAL)
//!   staging.db        durable row queue (crash-safe mode)
//!   subsets/<subset_uuid>/parts/v<N>/…/<part_uuid>.h5
//!   locks/            advisory dataset and subset leases
//!   logs/audit.log    append-only audit trail, if enabled
//!   forks/<alias>/    nested dataset roots created by merge forks
//! ```
//!
//! The pure identity, schema, padding, and hashing layer lives in
//! [`tessera_core`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod audit;
pub mod catalog;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod gc;
pub mod ingest;
pub mod lease;
pub mod merge;
pub mod staging;
pub mod store;

mod sqlutil;

pub use catalog::Catalog;
pub use config::EngineConfig;
pub use error::EngineError;
pub use ingest::IngestCoordinator;
pub use merge::{merge_local, CopyMode, MergeOptions, MergeReport};
pub use store::{PartBackend, PartFileStore, StorageScheme};
