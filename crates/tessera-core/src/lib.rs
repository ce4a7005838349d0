//! # tessera-core
//!
//! Pure building blocks for the tessera dataset storage engine: deterministic
//! subset identity, the canonical dtype and jagged-padding contract, and the
//! byte-stable content hash over sealed row data.
//!
//! Nothing in this crate performs I/O. The engine crate layers the part file
//! store, the relational catalog, staging, and writer coordination on top of
//! these primitives.
//!
//! ## Layout
//!
//! - [`keys`] — key normalization, IEEE-754 specials codes, quantization, and
//!   deterministic subset UUIDs.
//! - [`schema`] — canonical dtype, jagged specs, the schema document and its
//!   fingerprint.
//! - [`batch`] — the row-batch data model (structured columns, per-row cells).
//! - [`jagged`] — padding plans, padded columns, and jagged meta arrays.
//! - [`hash`] — the content-hash contract over padded batches.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod batch;
pub mod digest;
pub mod hash;
pub mod jagged;
pub mod keys;
pub mod schema;

pub use batch::{CellValues, FieldBatch, RowBatch};
pub use hash::{content_hash, DEFAULT_MAX_CHUNK_BYTES};
pub use jagged::{PaddedBatch, PaddedColumn};
pub use keys::{KeyNormalizer, KeyType, KeyValue, SpecialsCode};
pub use schema::{BaseType, Dtype, FieldSpec, JaggedSpec, SchemaDocument};
