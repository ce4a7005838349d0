//! The relational catalog for one dataset root.
//!
//! `catalog.db` tracks the dataset record, subsets (with their dynamic raw
//! and `_s`/`_q` identity columns), immutable part rows, the change feed
//! (`batches`/`batch_parts`), the merge log, and the optional tamper chain.
//! All mutating operations run inside immediate transactions with bounded
//! retry on contention; a multi-part commit is one transaction, so partial
//! failures leave the catalog unchanged.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Transaction};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use tessera_core::digest::blake2b_128_hex;
use tessera_core::keys::{
    assert_safe_name, IdentityItem, KeyError, KeyNormalizer, KeyType, KeyValue, SpecialsCode,
};
use tessera_core::schema::{PartConfig, SchemaDocument, SchemaError};

use crate::fsutil::{makedirs_with_fsync, now_epoch_us};
use crate::sqlutil::{apply_read_pragmas, apply_write_pragmas, immediate_txn, is_busy, TxnError};
use crate::store::StorageScheme;

/// Schema DDL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("catalog_schema.sql");

/// Default quantization scale applied to a REAL key that declares none.
const DEFAULT_QUANTIZATION: f64 = 1e3;

/// Errors from catalog operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CatalogError {
    /// Database error from `SQLite`.
    #[error("catalog database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// Contention outlived the retry budget.
    #[error("catalog busy beyond retry budget")]
    Busy,

    /// Filesystem failure around the database file.
    #[error("catalog I/O error: {context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The dataset alias is unknown in this root.
    #[error("unknown dataset: {alias:?}")]
    UnknownDataset {
        /// The alias looked up.
        alias: String,
    },

    /// The root already hosts a primary dataset under a different alias.
    #[error("root already hosts dataset {existing:?}; a root owns one primary dataset")]
    AliasConflict {
        /// The alias of the primary dataset in place.
        existing: String,
        /// The alias requested.
        requested: String,
    },

    /// Supplied keys disagree with the declared key schema.
    #[error("invalid key set: {detail}")]
    InvalidKeys {
        /// Description of the disagreement.
        detail: String,
    },

    /// The same identity tuple resolved to a stored subset whose identity
    /// columns differ.
    #[error("identity conflict for subset {subset_uuid}: {detail}")]
    IdentityConflict {
        /// The colliding subset.
        subset_uuid: Uuid,
        /// Description of the disagreement.
        detail: String,
    },

    /// A stored document failed to parse.
    #[error("corrupt catalog row: {detail}")]
    Corrupt {
        /// What failed to parse.
        detail: String,
    },

    /// Schema-document failure.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Key validation failure.
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// One dataset record.
#[derive(Debug, Clone)]
pub struct DatasetRecord {
    /// Dataset identity.
    pub dataset_uuid: Uuid,
    /// Human alias, unique per root.
    pub alias: String,
    /// Creation time, microseconds.
    pub created_at_epoch: i64,
    /// The schema document.
    pub schema: SchemaDocument,
    /// Part-file fan-out scheme.
    pub scheme: StorageScheme,
    /// Subdirectory of the catalog root holding this dataset's files;
    /// empty for the primary dataset.
    pub root_rel: String,
}

/// One subsets row, without its dynamic key columns.
#[derive(Debug, Clone)]
pub struct SubsetRow {
    /// Subset identity.
    pub subset_uuid: Uuid,
    /// Creation time, microseconds.
    pub created_at_epoch: i64,
    /// Soft-delete flag.
    pub marked_for_deletion: bool,
    /// Live row total, reconciled at GC.
    pub total_rows: i64,
}

/// One parts row.
#[derive(Debug, Clone)]
pub struct PartRow {
    /// Part identity.
    pub part_uuid: Uuid,
    /// Owning subset.
    pub subset_uuid: Uuid,
    /// Seal time, microseconds.
    pub created_at_epoch: i64,
    /// Row count.
    pub n_rows: i64,
    /// Storage scheme version.
    pub scheme_version: u32,
    /// Path relative to the dataset root.
    pub file_relpath: String,
    /// Soft-delete flag.
    pub marked_for_deletion: bool,
    /// Content hash.
    pub content_hash: String,
    /// Producer that sealed the part, if recorded.
    pub producer_id: Option<String>,
    /// Batch the part committed in, if recorded.
    pub batch_id: Option<String>,
    /// Per-part statistics document.
    pub part_stats_json: Option<String>,
}

/// A sealed part ready for its catalog row.
#[derive(Debug, Clone)]
pub struct SealedPart {
    /// Part identity.
    pub part_uuid: Uuid,
    /// Owning subset.
    pub subset_uuid: Uuid,
    /// Seal time, microseconds.
    pub created_at_epoch: i64,
    /// Row count.
    pub n_rows: i64,
    /// Storage scheme version.
    pub scheme_version: u32,
    /// Path relative to the dataset root.
    pub file_relpath: String,
    /// Content hash.
    pub content_hash: String,
    /// Per-part statistics document.
    pub part_stats_json: Option<String>,
    /// Uncompressed payload size.
    pub plaintext_size: Option<i64>,
}

/// Result of offering one sealed part to the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The part row was inserted.
    Inserted {
        /// The new part.
        part_uuid: Uuid,
    },
    /// A live part with the same `(subset_uuid, content_hash)` already
    /// exists; not an error.
    AlreadyPresent {
        /// The existing part.
        part_uuid: Uuid,
        /// Its file path, relative to the dataset root.
        file_relpath: String,
    },
}

/// A committed batch.
#[derive(Debug, Clone)]
pub struct BatchCommit {
    /// Batch identity.
    pub bid: String,
    /// Per-part outcomes, in offer order.
    pub outcomes: Vec<PublishOutcome>,
}

/// One batches row of the change feed.
#[derive(Debug, Clone)]
pub struct BatchRow {
    /// Batch identity.
    pub bid: String,
    /// Producer that committed the batch.
    pub producer_id: String,
    /// Commit time, microseconds.
    pub created_at_epoch: i64,
    /// Schema fingerprint in force at commit.
    pub schema_fingerprint: String,
}

/// Equality or range filter over one key.
#[derive(Debug, Clone)]
pub enum KeyFilter {
    /// Identity equality: `_s`/`_q` columns for REAL keys, the raw column
    /// otherwise.
    Eq(KeyValue),
    /// Range over the raw REAL column. NaN bounds are refused; NaN-keyed
    /// subsets never match a range.
    RealRange(f64, f64),
    /// Range over a raw INTEGER column.
    IntRange(i64, i64),
}

/// A subset query.
#[derive(Debug, Clone, Default)]
pub struct SubsetQuery {
    /// Per-key filters.
    pub filters: BTreeMap<String, KeyFilter>,
    /// Lower bound on `created_at_epoch`, microseconds.
    pub created_after_us: Option<i64>,
    /// Upper bound on `created_at_epoch`, microseconds.
    pub created_before_us: Option<i64>,
    /// Include soft-deleted subsets.
    pub include_marked: bool,
}

fn kv_to_sql(value: &KeyValue) -> SqlValue {
    match value {
        KeyValue::Real(v) => SqlValue::Real(*v),
        KeyValue::Integer(v) => SqlValue::Integer(*v),
        KeyValue::Text(v) => SqlValue::Text(v.clone()),
        KeyValue::Boolean(v) => SqlValue::Integer(i64::from(*v)),
    }
}

fn item_to_sql(item: &IdentityItem) -> SqlValue {
    match item {
        IdentityItem::Int(v) => SqlValue::Integer(*v),
        IdentityItem::Bool(v) => SqlValue::Integer(i64::from(*v)),
        IdentityItem::Text(v) => SqlValue::Text(v.clone()),
    }
}

fn parse_uuid(text: &str) -> Result<Uuid, CatalogError> {
    Uuid::parse_str(text).map_err(|_| CatalogError::Corrupt {
        detail: format!("bad uuid {text:?}"),
    })
}

/// Render raw key values as attribute JSON. Non-finite REALs render as
/// strings so the document stays valid JSON.
#[must_use]
pub fn keys_to_json(keys: &BTreeMap<String, KeyValue>) -> String {
    let mut doc = serde_json::Map::new();
    for (name, value) in keys {
        let v = match value {
            KeyValue::Real(x) => serde_json::Number::from_f64(*x).map_or_else(
                || serde_json::Value::String(format!("{x}")),
                serde_json::Value::Number,
            ),
            KeyValue::Integer(x) => serde_json::Value::from(*x),
            KeyValue::Text(x) => serde_json::Value::from(x.clone()),
            KeyValue::Boolean(x) => serde_json::Value::from(*x),
        };
        doc.insert(name.clone(), v);
    }
    serde_json::Value::Object(doc).to_string()
}

/// The catalog over one dataset root.
#[derive(Debug)]
pub struct Catalog {
    conn: Connection,
    root: PathBuf,
    busy_retries: u32,
    busy_backoff_ms: u64,
    producer_id: String,
}

impl Catalog {
    /// Open (creating if needed) the catalog at `root/catalog.db`.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when the root cannot be created or the
    /// database cannot be initialized.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        Self::open_with_retry(root, 8, 30)
    }

    /// Open with an explicit busy-retry budget.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when the root cannot be created or the
    /// database cannot be initialized.
    pub fn open_with_retry(
        root: impl Into<PathBuf>,
        busy_retries: u32,
        busy_backoff_ms: u64,
    ) -> Result<Self, CatalogError> {
        let root = root.into();
        makedirs_with_fsync(&root).map_err(|source| CatalogError::Io {
            context: format!("creating dataset root {}", root.display()),
            source,
        })?;
        let conn = Connection::open_with_flags(
            root.join("catalog.db"),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_write_pragmas(&conn, false)?;
        conn.execute_batch(SCHEMA_SQL)?;

        let mut catalog = Self {
            conn,
            root,
            busy_retries,
            busy_backoff_ms,
            producer_id: String::new(),
        };
        catalog.init_meta()?;
        Ok(catalog)
    }

    /// Open a read-only view of an existing catalog (`query_only=ON`,
    /// `trusted_schema=OFF`).
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] when the database is absent or unreadable.
    pub fn open_readonly(root: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let root = root.into();
        let conn = Connection::open_with_flags(
            root.join("catalog.db"),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_read_pragmas(&conn)?;
        let producer_id: String = conn
            .query_row(
                "SELECT value FROM meta WHERE key='producer_id'",
                [],
                |r| r.get(0),
            )
            .optional()?
            .unwrap_or_default();
        Ok(Self {
            conn,
            root,
            busy_retries: 1,
            busy_backoff_ms: 0,
            producer_id,
        })
    }

    fn init_meta(&mut self) -> Result<(), CatalogError> {
        let producer = self.txn(|tx| {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT value FROM meta WHERE key='producer_id'",
                    [],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                return Ok(id);
            }
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO meta(key, value) VALUES ('producer_id', ?1)",
                params![id],
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO meta(key, value) VALUES ('created_at_epoch', ?1)",
                params![now_epoch_us().to_string()],
            )?;
            Ok(id)
        })?;
        self.producer_id = producer;
        Ok(())
    }

    /// Dataset root this catalog governs.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stable producer identity of this catalog, minted at initialization.
    #[must_use]
    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn txn<T>(
        &mut self,
        f: impl FnMut(&Transaction<'_>) -> Result<T, TxnError<CatalogError>>,
    ) -> Result<T, CatalogError> {
        match immediate_txn(&mut self.conn, self.busy_retries, self.busy_backoff_ms, f) {
            Ok(v) => Ok(v),
            Err(TxnError::Sql(e)) if is_busy(&e) => Err(CatalogError::Busy),
            Err(TxnError::Sql(e)) => Err(CatalogError::Db(e)),
            Err(TxnError::App(e)) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Datasets
    // ------------------------------------------------------------------

    /// Load an existing dataset by alias, or create it with the supplied
    /// scheme and seed schema document.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure or corrupt rows.
    pub fn ensure_dataset(
        &mut self,
        alias: &str,
        scheme: &StorageScheme,
        seed: &SchemaDocument,
    ) -> Result<DatasetRecord, CatalogError> {
        assert_safe_name(alias)?;
        if let Some(record) = self.dataset_by_alias(alias)? {
            return Ok(record);
        }
        if let Some(primary) = self
            .datasets()?
            .into_iter()
            .find(|d| d.root_rel.is_empty())
        {
            return Err(CatalogError::AliasConflict {
                existing: primary.alias,
                requested: alias.to_string(),
            });
        }
        let dataset_uuid = Uuid::new_v4();
        let schema_json = serde_json::to_string(seed).map_err(|e| CatalogError::Corrupt {
            detail: format!("schema serialize: {e}"),
        })?;
        let scheme_json = serde_json::to_string(scheme).map_err(|e| CatalogError::Corrupt {
            detail: format!("scheme serialize: {e}"),
        })?;
        self.txn(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO datasets(dataset_uuid, alias, created_at_epoch, schema_json, storage_scheme_json, root_rel)
                 VALUES (?1, ?2, ?3, ?4, ?5, '')",
                params![
                    dataset_uuid.to_string(),
                    alias,
                    now_epoch_us(),
                    schema_json,
                    scheme_json
                ],
            )?;
            Ok(())
        })?;
        info!(alias, dataset = %dataset_uuid, "ensured dataset");
        self.dataset_by_alias(alias)?
            .ok_or_else(|| CatalogError::UnknownDataset {
                alias: alias.to_string(),
            })
    }

    /// Register a fork dataset created by merge, rooted under `root_rel`.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure.
    pub fn register_fork(
        &mut self,
        alias: &str,
        dataset_uuid: &Uuid,
        root_rel: &str,
        schema_json: &str,
        scheme_json: &str,
    ) -> Result<(), CatalogError> {
        self.txn(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO datasets(dataset_uuid, alias, created_at_epoch, schema_json, storage_scheme_json, root_rel)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    dataset_uuid.to_string(),
                    alias,
                    now_epoch_us(),
                    schema_json,
                    scheme_json,
                    root_rel
                ],
            )?;
            Ok(())
        })
    }

    fn row_to_dataset(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, i64, String, String, String)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
        ))
    }

    fn parse_dataset(
        raw: (String, String, i64, String, String, String),
    ) -> Result<DatasetRecord, CatalogError> {
        let (uuid_text, alias, created_at_epoch, schema_json, scheme_json, root_rel) = raw;
        Ok(DatasetRecord {
            dataset_uuid: parse_uuid(&uuid_text)?,
            alias,
            created_at_epoch,
            schema: serde_json::from_str(&schema_json).map_err(|e| CatalogError::Corrupt {
                detail: format!("schema parse: {e}"),
            })?,
            scheme: serde_json::from_str(&scheme_json).map_err(|e| CatalogError::Corrupt {
                detail: format!("scheme parse: {e}"),
            })?,
            root_rel,
        })
    }

    /// Look up a dataset by alias.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure or corrupt rows.
    pub fn dataset_by_alias(&self, alias: &str) -> Result<Option<DatasetRecord>, CatalogError> {
        let raw = self
            .conn
            .query_row(
                "SELECT dataset_uuid, alias, created_at_epoch, schema_json, storage_scheme_json, root_rel
                 FROM datasets WHERE alias = ?1",
                params![alias],
                Self::row_to_dataset,
            )
            .optional()?;
        raw.map(Self::parse_dataset).transpose()
    }

    /// All dataset records in this root.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure or corrupt rows.
    pub fn datasets(&self) -> Result<Vec<DatasetRecord>, CatalogError> {
        let mut stmt = self.conn.prepare(
            "SELECT dataset_uuid, alias, created_at_epoch, schema_json, storage_scheme_json, root_rel
             FROM datasets ORDER BY alias",
        )?;
        let raws = stmt
            .query_map([], Self::row_to_dataset)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(Self::parse_dataset).collect()
    }

    /// Persist a schema document.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure.
    pub fn save_schema(
        &mut self,
        dataset_uuid: &Uuid,
        schema: &SchemaDocument,
    ) -> Result<(), CatalogError> {
        let schema_json = serde_json::to_string(schema).map_err(|e| CatalogError::Corrupt {
            detail: format!("schema serialize: {e}"),
        })?;
        self.txn(|tx| {
            tx.execute(
                "UPDATE datasets SET schema_json = ?1 WHERE dataset_uuid = ?2",
                params![schema_json, dataset_uuid.to_string()],
            )?;
            Ok(())
        })
    }

    /// Lock the part configuration on first use; an existing configuration
    /// wins and is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure.
    pub fn lock_part_config(
        &mut self,
        dataset_uuid: &Uuid,
        desired: &PartConfig,
    ) -> Result<PartConfig, CatalogError> {
        let desired = desired.clone();
        self.txn(move |tx| {
            let schema_json: String = tx.query_row(
                "SELECT schema_json FROM datasets WHERE dataset_uuid = ?1",
                params![dataset_uuid.to_string()],
                |r| r.get(0),
            )?;
            let mut schema: SchemaDocument =
                serde_json::from_str(&schema_json).map_err(|e| {
                    TxnError::App(CatalogError::Corrupt {
                        detail: format!("schema parse: {e}"),
                    })
                })?;
            if let Some(existing) = &schema.part_config {
                return Ok(existing.clone());
            }
            schema.part_config = Some(desired.clone());
            let updated = serde_json::to_string(&schema).map_err(|e| {
                TxnError::App(CatalogError::Corrupt {
                    detail: format!("schema serialize: {e}"),
                })
            })?;
            tx.execute(
                "UPDATE datasets SET schema_json = ?1 WHERE dataset_uuid = ?2",
                params![updated, dataset_uuid.to_string()],
            )?;
            Ok(desired.clone())
        })
    }

    // ------------------------------------------------------------------
    // Key columns and subsets
    // ------------------------------------------------------------------

    /// Idempotently add raw and `_s`/`_q` key columns, create the composite
    /// UNIQUE identity index, and return the normalizer for this dataset.
    ///
    /// On the first call the key schema is inferred from the supplied values
    /// (sorted name order) and persisted; afterwards the supplied keys must
    /// match the declared set and types exactly.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidKeys`] on a key-set disagreement.
    pub fn ensure_key_columns(
        &mut self,
        dataset: &DatasetRecord,
        keys: &BTreeMap<String, KeyValue>,
    ) -> Result<(KeyNormalizer, DatasetRecord), CatalogError> {
        let mut record = dataset.clone();
        if record.schema.key_schema.is_empty() {
            let mut key_schema = BTreeMap::new();
            for (name, value) in keys {
                assert_safe_name(name)?;
                key_schema.insert(name.clone(), value.key_type());
            }
            let key_order: Vec<String> = key_schema.keys().cloned().collect();
            for name in &key_order {
                if key_schema[name] == KeyType::Real {
                    record
                        .schema
                        .quantization
                        .entry(name.clone())
                        .or_insert(DEFAULT_QUANTIZATION);
                }
            }
            record.schema.key_schema = key_schema;
            record.schema.key_order = key_order;
            self.apply_key_columns(&record.schema)?;
            self.save_schema(&record.dataset_uuid, &record.schema)?;
            debug!(dataset = %record.dataset_uuid, "locked key schema");
        } else {
            let declared: HashSet<&String> = record.schema.key_schema.keys().collect();
            let incoming: HashSet<&String> = keys.keys().collect();
            if declared != incoming {
                return Err(CatalogError::InvalidKeys {
                    detail: format!(
                        "keys must be exactly {:?}",
                        record.schema.key_order
                    ),
                });
            }
            for (name, value) in keys {
                let declared_ty = record.schema.key_schema[name];
                let got = value.key_type();
                let coercible = matches!(
                    (declared_ty, got),
                    (KeyType::Real, KeyType::Integer) | (KeyType::Integer, KeyType::Boolean)
                );
                if declared_ty != got && !coercible {
                    return Err(CatalogError::InvalidKeys {
                        detail: format!(
                            "key {name:?} expected {declared_ty}, got {got}"
                        ),
                    });
                }
            }
            // Columns may be missing after a fork bootstrap; the ALTERs are
            // idempotent.
            self.apply_key_columns(&record.schema)?;
        }
        let normalizer = KeyNormalizer::new(
            &record.schema.key_schema,
            &record.schema.key_order,
            &record.schema.quantization,
        )?;
        Ok((normalizer, record))
    }

    /// Apply key-column ALTERs and identity indexes for a declared schema.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure.
    pub fn apply_key_columns(&mut self, schema: &SchemaDocument) -> Result<(), CatalogError> {
        let key_schema = schema.key_schema.clone();
        let key_order = schema.key_order.clone();
        let normalizer =
            KeyNormalizer::new(&key_schema, &key_order, &schema.quantization)?;
        let identity_cols = normalizer.identity_columns();
        self.txn(move |tx| {
            let existing: Vec<String> = tx
                .prepare("PRAGMA table_info(subsets)")?
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<Result<Vec<_>, _>>()?;
            let mut add = |col: &str, sql_type: &str| -> Result<(), TxnError<CatalogError>> {
                if !existing.iter().any(|c| c == col) {
                    tx.execute(
                        &format!("ALTER TABLE subsets ADD COLUMN \"{col}\" {sql_type}"),
                        [],
                    )?;
                }
                Ok(())
            };
            for name in &key_order {
                let ty = key_schema[name];
                add(name, ty.sql_type())?;
                if ty == KeyType::Real {
                    add(&format!("{name}_s"), "INTEGER")?;
                    add(&format!("{name}_q"), "INTEGER")?;
                }
            }
            let quoted: Vec<String> =
                identity_cols.iter().map(|c| format!("\"{c}\"")).collect();
            tx.execute(
                &format!(
                    "CREATE UNIQUE INDEX IF NOT EXISTS idx_subsets_identity ON subsets({})",
                    quoted.join(", ")
                ),
                [],
            )?;
            for name in &key_order {
                tx.execute(
                    &format!(
                        "CREATE INDEX IF NOT EXISTS idx_subsets_key_{name} ON subsets(\"{name}\") WHERE marked_for_deletion = 0"
                    ),
                    [],
                )?;
            }
            Ok(())
        })
    }

    /// Resolve (creating if absent) the subset for a key dict. The subset
    /// UUID is computed locally from the identity tuple; the insert is
    /// `INSERT OR IGNORE` followed by verification of the stored identity
    /// columns. A soft-deleted subset is revived.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::IdentityConflict`] when the stored identity
    /// columns disagree with the computed tuple.
    pub fn get_or_create_subset(
        &mut self,
        normalizer: &KeyNormalizer,
        keys: &BTreeMap<String, KeyValue>,
    ) -> Result<Uuid, CatalogError> {
        let subset_uuid = normalizer.subset_uuid(keys)?;
        let normalized = normalizer.normalize_keys(keys)?;
        let preds = normalizer.equality_predicates(keys)?;

        let mut columns = vec![
            "subset_uuid".to_string(),
            "created_at_epoch".to_string(),
        ];
        let mut values: Vec<SqlValue> = vec![
            SqlValue::Text(subset_uuid.to_string()),
            SqlValue::Integer(now_epoch_us()),
        ];
        for name in normalizer.key_order() {
            columns.push(format!("\"{name}\""));
            values.push(kv_to_sql(&normalized[name]));
        }
        for pred in &preds {
            if pred.column.ends_with("_s") || pred.column.ends_with("_q") {
                if normalizer.key_type(&pred.column).is_none() {
                    columns.push(format!("\"{}\"", pred.column));
                    values.push(item_to_sql(&pred.value));
                }
            }
        }
        let placeholders: Vec<String> =
            (1..=values.len()).map(|i| format!("?{i}")).collect();
        let insert_sql = format!(
            "INSERT OR IGNORE INTO subsets({}) VALUES({})",
            columns.join(", "),
            placeholders.join(", ")
        );
        let select_cols: Vec<String> = preds
            .iter()
            .map(|p| format!("\"{}\"", p.column))
            .collect();
        let select_sql = format!(
            "SELECT marked_for_deletion, {} FROM subsets WHERE subset_uuid = ?1",
            select_cols.join(", ")
        );

        self.txn(move |tx| {
            tx.execute(&insert_sql, params_from_iter(values.iter()))?;
            let (marked, stored): (bool, Vec<SqlValue>) =
                tx.query_row(&select_sql, params![subset_uuid.to_string()], |row| {
                    let marked: bool = row.get(0)?;
                    let mut stored = Vec::with_capacity(preds.len());
                    for i in 0..preds.len() {
                        stored.push(row.get::<_, SqlValue>(i + 1)?);
                    }
                    Ok((marked, stored))
                })?;
            for (pred, got) in preds.iter().zip(&stored) {
                let expected = item_to_sql(&pred.value);
                if !sql_values_equal(&expected, got) {
                    return Err(TxnError::App(CatalogError::IdentityConflict {
                        subset_uuid,
                        detail: format!(
                            "column {:?} stored {got:?}, computed {expected:?}",
                            pred.column
                        ),
                    }));
                }
            }
            if marked {
                tx.execute(
                    "UPDATE subsets SET marked_for_deletion = 0 WHERE subset_uuid = ?1",
                    params![subset_uuid.to_string()],
                )?;
            }
            Ok(subset_uuid)
        })
    }

    /// A subsets row by UUID.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure.
    pub fn subset_row(&self, subset_uuid: &Uuid) -> Result<Option<SubsetRow>, CatalogError> {
        let row = self
            .conn
            .query_row(
                "SELECT subset_uuid, created_at_epoch, marked_for_deletion, total_rows
                 FROM subsets WHERE subset_uuid = ?1",
                params![subset_uuid.to_string()],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, i64>(1)?,
                        r.get::<_, bool>(2)?,
                        r.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(uuid_text, created_at_epoch, marked_for_deletion, total_rows)| {
            Ok(SubsetRow {
                subset_uuid: parse_uuid(&uuid_text)?,
                created_at_epoch,
                marked_for_deletion,
                total_rows,
            })
        })
        .transpose()
    }

    /// Read a subset's raw key values back. NaN-keyed REALs are
    /// reconstructed from their specials code (the raw column stores NULL
    /// for NaN).
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure or an absent subset.
    pub fn subset_key_values(
        &self,
        normalizer: &KeyNormalizer,
        subset_uuid: &Uuid,
    ) -> Result<BTreeMap<String, KeyValue>, CatalogError> {
        let mut select_cols = Vec::new();
        for name in normalizer.key_order() {
            select_cols.push(format!("\"{name}\""));
            if normalizer.key_type(name) == Some(KeyType::Real) {
                select_cols.push(format!("\"{name}_s\""));
            }
        }
        let sql = format!(
            "SELECT {} FROM subsets WHERE subset_uuid = ?1",
            select_cols.join(", ")
        );
        let raw: Vec<SqlValue> =
            self.conn
                .query_row(&sql, params![subset_uuid.to_string()], |row| {
                    let mut out = Vec::with_capacity(select_cols.len());
                    for i in 0..select_cols.len() {
                        out.push(row.get::<_, SqlValue>(i)?);
                    }
                    Ok(out)
                })?;
        let mut out = BTreeMap::new();
        let mut cursor = raw.into_iter();
        for name in normalizer.key_order() {
            let ty = normalizer
                .key_type(name)
                .ok_or_else(|| CatalogError::Corrupt {
                    detail: format!("key {name:?} missing from normalizer"),
                })?;
            let value = cursor.next().ok_or_else(|| CatalogError::Corrupt {
                detail: "short subset row".to_string(),
            })?;
            let parsed = match ty {
                KeyType::Real => {
                    let s_code = cursor.next().ok_or_else(|| CatalogError::Corrupt {
                        detail: "missing specials column".to_string(),
                    })?;
                    match value {
                        SqlValue::Real(v) => KeyValue::Real(v),
                        SqlValue::Integer(v) => {
                            #[allow(clippy::cast_precision_loss)]
                            KeyValue::Real(v as f64)
                        }
                        SqlValue::Null => {
                            // NaN raw values persist as NULL; the specials
                            // code disambiguates.
                            match s_code {
                                SqlValue::Integer(s)
                                    if s == SpecialsCode::Nan.as_i64() =>
                                {
                                    KeyValue::Real(f64::NAN)
                                }
                                SqlValue::Integer(s)
                                    if s == SpecialsCode::PosInf.as_i64() =>
                                {
                                    KeyValue::Real(f64::INFINITY)
                                }
                                SqlValue::Integer(s)
                                    if s == SpecialsCode::NegInf.as_i64() =>
                                {
                                    KeyValue::Real(f64::NEG_INFINITY)
                                }
                                _ => {
                                    return Err(CatalogError::Corrupt {
                                        detail: format!(
                                            "NULL raw value for key {name:?} with normal specials code"
                                        ),
                                    })
                                }
                            }
                        }
                        other => {
                            return Err(CatalogError::Corrupt {
                                detail: format!("bad raw value {other:?} for REAL key {name:?}"),
                            })
                        }
                    }
                }
                KeyType::Integer => match value {
                    SqlValue::Integer(v) => KeyValue::Integer(v),
                    other => {
                        return Err(CatalogError::Corrupt {
                            detail: format!("bad raw value {other:?} for INTEGER key {name:?}"),
                        })
                    }
                },
                KeyType::Boolean => match value {
                    SqlValue::Integer(v) => KeyValue::Boolean(v != 0),
                    other => {
                        return Err(CatalogError::Corrupt {
                            detail: format!("bad raw value {other:?} for BOOLEAN key {name:?}"),
                        })
                    }
                },
                KeyType::Text => match value {
                    SqlValue::Text(v) => KeyValue::Text(v),
                    other => {
                        return Err(CatalogError::Corrupt {
                            detail: format!("bad raw value {other:?} for TEXT key {name:?}"),
                        })
                    }
                },
            };
            out.insert(name.clone(), parsed);
        }
        Ok(out)
    }

    /// Find subsets matching a query. Equality on REAL keys uses the
    /// `_s`/`_q` identity columns; ranges use the raw columns and exclude
    /// NaN.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidKeys`] on an unknown key or a NaN
    /// range bound.
    pub fn find_subsets(
        &self,
        normalizer: &KeyNormalizer,
        query: &SubsetQuery,
    ) -> Result<Vec<SubsetRow>, CatalogError> {
        let mut conds: Vec<String> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();
        for (name, filter) in &query.filters {
            let ty = normalizer
                .key_type(name)
                .ok_or_else(|| CatalogError::InvalidKeys {
                    detail: format!("key {name:?} not in schema"),
                })?;
            match filter {
                KeyFilter::Eq(value) => match (ty, value) {
                    (KeyType::Real, KeyValue::Real(_) | KeyValue::Integer(_)) => {
                        let coerced = match value {
                            KeyValue::Real(v) => *v,
                            #[allow(clippy::cast_precision_loss)]
                            KeyValue::Integer(v) => *v as f64,
                            _ => unreachable!(),
                        };
                        let code = tessera_core::keys::classify_specials(coerced);
                        conds.push(format!("\"{name}_s\" = ?"));
                        values.push(SqlValue::Integer(code.as_i64()));
                        let q = if code == SpecialsCode::Normal {
                            tessera_core::keys::quantize_value(
                                coerced,
                                normalizer.scale(name).unwrap_or(DEFAULT_QUANTIZATION),
                            )
                        } else {
                            0
                        };
                        conds.push(format!("\"{name}_q\" = ?"));
                        values.push(SqlValue::Integer(q));
                    }
                    (KeyType::Integer, KeyValue::Integer(_) | KeyValue::Boolean(_))
                    | (KeyType::Boolean, KeyValue::Boolean(_))
                    | (KeyType::Text, KeyValue::Text(_)) => {
                        let bound = match value {
                            KeyValue::Text(s) => {
                                KeyValue::Text(tessera_core::keys::normalize_text(s))
                            }
                            KeyValue::Boolean(b) if ty == KeyType::Integer => {
                                KeyValue::Integer(i64::from(*b))
                            }
                            other => other.clone(),
                        };
                        conds.push(format!("\"{name}\" = ?"));
                        values.push(kv_to_sql(&bound));
                    }
                    (declared, got) => {
                        return Err(CatalogError::InvalidKeys {
                            detail: format!(
                                "key {name:?} expected {declared}, got {}",
                                got.key_type()
                            ),
                        })
                    }
                },
                KeyFilter::RealRange(lo, hi) => {
                    if ty != KeyType::Real {
                        return Err(CatalogError::InvalidKeys {
                            detail: format!("range filter on non-REAL key {name:?}"),
                        });
                    }
                    if lo.is_nan() || hi.is_nan() {
                        return Err(CatalogError::InvalidKeys {
                            detail: format!("NaN range bound for key {name:?}"),
                        });
                    }
                    let (lo, hi) = if lo <= hi { (*lo, *hi) } else { (*hi, *lo) };
                    conds.push(format!("\"{name}\" BETWEEN ? AND ?"));
                    values.push(SqlValue::Real(lo));
                    values.push(SqlValue::Real(hi));
                }
                KeyFilter::IntRange(lo, hi) => {
                    if ty != KeyType::Integer {
                        return Err(CatalogError::InvalidKeys {
                            detail: format!("integer range filter on non-INTEGER key {name:?}"),
                        });
                    }
                    let (lo, hi) = if lo <= hi { (*lo, *hi) } else { (*hi, *lo) };
                    conds.push(format!("\"{name}\" BETWEEN ? AND ?"));
                    values.push(SqlValue::Integer(lo));
                    values.push(SqlValue::Integer(hi));
                }
            }
        }
        if let Some(after) = query.created_after_us {
            conds.push("created_at_epoch >= ?".to_string());
            values.push(SqlValue::Integer(after));
        }
        if let Some(before) = query.created_before_us {
            conds.push("created_at_epoch <= ?".to_string());
            values.push(SqlValue::Integer(before));
        }
        if !query.include_marked {
            conds.push("marked_for_deletion = 0".to_string());
        }
        let where_clause = if conds.is_empty() {
            "1=1".to_string()
        } else {
            conds.join(" AND ")
        };
        let sql = format!(
            "SELECT subset_uuid, created_at_epoch, marked_for_deletion, total_rows
             FROM subsets WHERE {where_clause}
             ORDER BY subset_uuid ASC, created_at_epoch ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, bool>(2)?,
                    r.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(uuid_text, created_at_epoch, marked_for_deletion, total_rows)| {
                Ok(SubsetRow {
                    subset_uuid: parse_uuid(&uuid_text)?,
                    created_at_epoch,
                    marked_for_deletion,
                    total_rows,
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Parts and the change feed
    // ------------------------------------------------------------------

    /// Is a live part with this content already published for the subset?
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure.
    pub fn find_live_part_by_content(
        &self,
        subset_uuid: &Uuid,
        content_hash: &str,
    ) -> Result<Option<(Uuid, String)>, CatalogError> {
        let row = self
            .conn
            .query_row(
                "SELECT part_uuid, file_relpath FROM parts
                 WHERE subset_uuid = ?1 AND content_hash = ?2 AND marked_for_deletion = 0
                 LIMIT 1",
                params![subset_uuid.to_string(), content_hash],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
            )
            .optional()?;
        row.map(|(uuid_text, relpath)| Ok((parse_uuid(&uuid_text)?, relpath)))
            .transpose()
    }

    /// Commit one batch: every offered part row, its `batch_parts`
    /// membership, the `total_rows` bumps, the `batches` row (with tamper
    /// chaining when enabled), and an optional schema update (text
    /// widening) — all in a single transaction.
    ///
    /// A part whose `(subset_uuid, content_hash)` already exists reports
    /// [`PublishOutcome::AlreadyPresent`] and joins neither the batch nor
    /// the totals.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure; on error the catalog
    /// is unchanged.
    pub fn record_batch(
        &mut self,
        dataset_uuid: &Uuid,
        bid: &str,
        schema_fingerprint: &str,
        parts: &[SealedPart],
        schema_update: Option<&SchemaDocument>,
    ) -> Result<BatchCommit, CatalogError> {
        let producer_id = self.producer_id.clone();
        let schema_update_json = schema_update
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| CatalogError::Corrupt {
                detail: format!("schema serialize: {e}"),
            })?;
        let commit = self.txn(move |tx| {
            if let Some(json) = &schema_update_json {
                tx.execute(
                    "UPDATE datasets SET schema_json = ?1 WHERE dataset_uuid = ?2",
                    params![json, dataset_uuid.to_string()],
                )?;
            }
            let mut outcomes = Vec::with_capacity(parts.len());
            let mut member_ids = Vec::with_capacity(parts.len());
            for part in parts {
                tx.execute(
                    "INSERT OR IGNORE INTO parts(part_uuid, subset_uuid, created_at_epoch, n_rows, scheme_version,
                                                 file_relpath, marked_for_deletion, content_hash, producer_id,
                                                 batch_id, part_stats_json, enc_version, plaintext_size)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?9, ?10, 0, ?11)",
                    params![
                        part.part_uuid.to_string(),
                        part.subset_uuid.to_string(),
                        part.created_at_epoch,
                        part.n_rows,
                        part.scheme_version,
                        part.file_relpath,
                        part.content_hash,
                        producer_id,
                        bid,
                        part.part_stats_json,
                        part.plaintext_size,
                    ],
                )?;
                if tx.changes() == 0 {
                    let (existing, relpath): (String, String) = tx.query_row(
                        "SELECT part_uuid, file_relpath FROM parts
                         WHERE subset_uuid = ?1 AND content_hash = ?2 LIMIT 1",
                        params![part.subset_uuid.to_string(), part.content_hash],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )?;
                    let existing =
                        Uuid::parse_str(&existing).map_err(|_| {
                            TxnError::App(CatalogError::Corrupt {
                                detail: format!("bad uuid {existing:?}"),
                            })
                        })?;
                    outcomes.push(PublishOutcome::AlreadyPresent {
                        part_uuid: existing,
                        file_relpath: relpath,
                    });
                    continue;
                }
                tx.execute(
                    "INSERT INTO batch_parts(bid, part_uuid) VALUES (?1, ?2)",
                    params![bid, part.part_uuid.to_string()],
                )?;
                tx.execute(
                    "UPDATE subsets SET total_rows = total_rows + ?1 WHERE subset_uuid = ?2",
                    params![part.n_rows, part.subset_uuid.to_string()],
                )?;
                member_ids.push((part.part_uuid.to_string(), part.content_hash.clone()));
                outcomes.push(PublishOutcome::Inserted {
                    part_uuid: part.part_uuid,
                });
            }

            let created_at = now_epoch_us();
            let chain: Option<(String, String)> = {
                let cfg: Option<(bool, String)> = tx
                    .query_row("SELECT enabled, salt FROM tamper_cfg WHERE id = 1", [], |r| {
                        Ok((r.get(0)?, r.get(1)?))
                    })
                    .optional()?;
                match cfg {
                    Some((true, salt)) => {
                        let prev: Option<String> = tx
                            .query_row(
                                "SELECT entry_hash FROM batches
                                 WHERE entry_hash IS NOT NULL
                                 ORDER BY created_at_epoch DESC, bid DESC LIMIT 1",
                                [],
                                |r| r.get(0),
                            )
                            .optional()?;
                        let prev = prev.unwrap_or_default();
                        let mut sorted: Vec<String> = member_ids
                            .iter()
                            .map(|(p, h)| format!("{p}{h}"))
                            .collect();
                        sorted.sort_unstable();
                        let mut payload = Vec::new();
                        payload.extend_from_slice(prev.as_bytes());
                        payload.extend_from_slice(bid.as_bytes());
                        for entry in &sorted {
                            payload.extend_from_slice(entry.as_bytes());
                        }
                        payload.extend_from_slice(created_at.to_string().as_bytes());
                        payload.extend_from_slice(salt.as_bytes());
                        Some((prev, blake2b_128_hex(&payload)))
                    }
                    _ => None,
                }
            };
            tx.execute(
                "INSERT INTO batches(bid, producer_id, created_at_epoch, schema_fingerprint, prev_hash, entry_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    bid,
                    producer_id,
                    created_at,
                    schema_fingerprint,
                    chain.as_ref().map(|(prev, _)| prev.clone()),
                    chain.as_ref().map(|(_, entry)| entry.clone()),
                ],
            )?;
            Ok(BatchCommit {
                bid: bid.to_string(),
                outcomes,
            })
        })?;
        debug!(bid = %commit.bid, parts = commit.outcomes.len(), "recorded batch");
        Ok(commit)
    }

    /// Enable the tamper chain with a salt. A no-op if already enabled.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure.
    pub fn enable_tamper_chain(&mut self, salt: &str) -> Result<(), CatalogError> {
        let salt = salt.to_string();
        self.txn(move |tx| {
            tx.execute(
                "INSERT OR IGNORE INTO tamper_cfg(id, enabled, salt) VALUES (1, 1, ?1)",
                params![salt],
            )?;
            tx.execute("UPDATE tamper_cfg SET enabled = 1 WHERE id = 1", [])?;
            Ok(())
        })
    }

    /// The current head of the tamper chain, for external anchoring.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure.
    pub fn chain_head(&self) -> Result<Option<String>, CatalogError> {
        Ok(self
            .conn
            .query_row(
                "SELECT entry_hash FROM batches WHERE entry_hash IS NOT NULL
                 ORDER BY created_at_epoch DESC, bid DESC LIMIT 1",
                [],
                |r| r.get(0),
            )
            .optional()?)
    }

    /// All batches in commit order.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure.
    pub fn batches(&self) -> Result<Vec<BatchRow>, CatalogError> {
        let mut stmt = self.conn.prepare(
            "SELECT bid, producer_id, created_at_epoch, schema_fingerprint
             FROM batches ORDER BY created_at_epoch ASC, bid ASC",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(BatchRow {
                    bid: r.get(0)?,
                    producer_id: r.get(1)?,
                    created_at_epoch: r.get(2)?,
                    schema_fingerprint: r.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn row_to_part(r: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, i64, i64, u32, String, bool, String, Option<String>, Option<String>, Option<String>)> {
        Ok((
            r.get(0)?,
            r.get(1)?,
            r.get(2)?,
            r.get(3)?,
            r.get(4)?,
            r.get(5)?,
            r.get(6)?,
            r.get(7)?,
            r.get(8)?,
            r.get(9)?,
            r.get(10)?,
        ))
    }

    #[allow(clippy::type_complexity)]
    fn parse_part(
        raw: (String, String, i64, i64, u32, String, bool, String, Option<String>, Option<String>, Option<String>),
    ) -> Result<PartRow, CatalogError> {
        Ok(PartRow {
            part_uuid: parse_uuid(&raw.0)?,
            subset_uuid: parse_uuid(&raw.1)?,
            created_at_epoch: raw.2,
            n_rows: raw.3,
            scheme_version: raw.4,
            file_relpath: raw.5,
            marked_for_deletion: raw.6,
            content_hash: raw.7,
            producer_id: raw.8,
            batch_id: raw.9,
            part_stats_json: raw.10,
        })
    }

    const PART_COLS: &'static str = "part_uuid, subset_uuid, created_at_epoch, n_rows, scheme_version, file_relpath, marked_for_deletion, content_hash, producer_id, batch_id, part_stats_json";

    /// Member parts of a batch, in `(created_at, part_uuid)` order.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure.
    pub fn parts_for_batch(&self, bid: &str) -> Result<Vec<PartRow>, CatalogError> {
        let sql = format!(
            "SELECT {} FROM parts WHERE part_uuid IN (SELECT part_uuid FROM batch_parts WHERE bid = ?1)
             ORDER BY created_at_epoch, part_uuid",
            Self::PART_COLS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let raws = stmt
            .query_map(params![bid], Self::row_to_part)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(Self::parse_part).collect()
    }

    /// Live parts of a subset, in publication order.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure.
    pub fn live_parts_for_subset(&self, subset_uuid: &Uuid) -> Result<Vec<PartRow>, CatalogError> {
        let sql = format!(
            "SELECT {} FROM parts WHERE subset_uuid = ?1 AND marked_for_deletion = 0
             ORDER BY created_at_epoch, part_uuid",
            Self::PART_COLS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let raws = stmt
            .query_map(params![subset_uuid.to_string()], Self::row_to_part)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(Self::parse_part).collect()
    }

    /// Every part row, live or marked.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure.
    pub fn all_parts(&self) -> Result<Vec<PartRow>, CatalogError> {
        let sql = format!(
            "SELECT {} FROM parts ORDER BY subset_uuid, created_at_epoch, part_uuid",
            Self::PART_COLS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let raws = stmt
            .query_map([], Self::row_to_part)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(Self::parse_part).collect()
    }

    /// Every known subset UUID.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure.
    pub fn all_subset_uuids(&self) -> Result<HashSet<Uuid>, CatalogError> {
        let mut stmt = self.conn.prepare("SELECT subset_uuid FROM subsets")?;
        let rows = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter().map(|t| parse_uuid(t)).collect()
    }

    // ------------------------------------------------------------------
    // Soft delete, GC, fsck support
    // ------------------------------------------------------------------

    /// Set or clear the soft-delete mark on subsets. Returns rows changed.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure.
    pub fn mark_subsets(&mut self, ids: &[Uuid], marked: bool) -> Result<usize, CatalogError> {
        self.txn(move |tx| {
            let mut changed = 0usize;
            for id in ids {
                changed += tx.execute(
                    "UPDATE subsets SET marked_for_deletion = ?1 WHERE subset_uuid = ?2",
                    params![i64::from(marked), id.to_string()],
                )?;
            }
            Ok(changed)
        })
    }

    /// Set or clear the soft-delete mark on parts. Returns rows changed.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure.
    pub fn mark_parts(&mut self, ids: &[Uuid], marked: bool) -> Result<usize, CatalogError> {
        self.txn(move |tx| {
            let mut changed = 0usize;
            for id in ids {
                changed += tx.execute(
                    "UPDATE parts SET marked_for_deletion = ?1 WHERE part_uuid = ?2",
                    params![i64::from(marked), id.to_string()],
                )?;
            }
            Ok(changed)
        })
    }

    /// Parts currently marked for deletion.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure.
    pub fn list_marked_parts(&self) -> Result<Vec<PartRow>, CatalogError> {
        let sql = format!(
            "SELECT {} FROM parts WHERE marked_for_deletion = 1",
            Self::PART_COLS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let raws = stmt
            .query_map([], Self::row_to_part)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(Self::parse_part).collect()
    }

    /// Commit a GC round: delete the given part rows, recompute
    /// `total_rows` for touched and marked subsets from live parts, and
    /// delete marked subsets that ended empty. Returns
    /// `(parts_deleted, subsets_deleted, deleted_subset_ids)`.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure.
    pub fn gc_commit(
        &mut self,
        part_ids: &[Uuid],
        touched_subsets: &[Uuid],
    ) -> Result<(usize, usize, Vec<Uuid>), CatalogError> {
        self.txn(move |tx| {
            let mut parts_deleted = 0usize;
            for id in part_ids {
                parts_deleted += tx.execute(
                    "DELETE FROM parts WHERE part_uuid = ?1",
                    params![id.to_string()],
                )?;
            }
            let mut to_check: HashSet<String> =
                touched_subsets.iter().map(ToString::to_string).collect();
            let marked: Vec<String> = tx
                .prepare("SELECT subset_uuid FROM subsets WHERE marked_for_deletion = 1")?
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            to_check.extend(marked);
            for subset in &to_check {
                let total: i64 = tx.query_row(
                    "SELECT COALESCE(SUM(n_rows), 0) FROM parts
                     WHERE subset_uuid = ?1 AND marked_for_deletion = 0",
                    params![subset],
                    |r| r.get(0),
                )?;
                tx.execute(
                    "UPDATE subsets SET total_rows = ?1 WHERE subset_uuid = ?2",
                    params![total, subset],
                )?;
            }
            let doomed: Vec<String> = tx
                .prepare(
                    "SELECT subset_uuid FROM subsets WHERE marked_for_deletion = 1 AND total_rows = 0",
                )?
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            let mut subsets_deleted = 0usize;
            for subset in &doomed {
                subsets_deleted +=
                    tx.execute("DELETE FROM subsets WHERE subset_uuid = ?1", params![subset])?;
            }
            let doomed_ids = doomed
                .iter()
                .map(|t| {
                    Uuid::parse_str(t).map_err(|_| {
                        TxnError::App(CatalogError::Corrupt {
                            detail: format!("bad uuid {t:?}"),
                        })
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok((parts_deleted, subsets_deleted, doomed_ids))
        })
    }

    /// Adopt an orphan part file discovered by fsck. Inserts the row if the
    /// `(subset_uuid, content_hash)` slot is free and bumps `total_rows`.
    /// Returns whether a row was inserted.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure.
    pub fn adopt_orphan_part(&mut self, part: &SealedPart) -> Result<bool, CatalogError> {
        self.txn(move |tx| {
            tx.execute(
                "INSERT OR IGNORE INTO parts(part_uuid, subset_uuid, created_at_epoch, n_rows, scheme_version,
                                             file_relpath, marked_for_deletion, content_hash, enc_version, plaintext_size)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, 0, ?8)",
                params![
                    part.part_uuid.to_string(),
                    part.subset_uuid.to_string(),
                    part.created_at_epoch,
                    part.n_rows,
                    part.scheme_version,
                    part.file_relpath,
                    part.content_hash,
                    part.plaintext_size,
                ],
            )?;
            if tx.changes() == 0 {
                return Ok(false);
            }
            tx.execute(
                "UPDATE subsets SET total_rows = total_rows + ?1 WHERE subset_uuid = ?2",
                params![part.n_rows, part.subset_uuid.to_string()],
            )?;
            Ok(true)
        })
    }

    /// Apply one replicated batch from another catalog: the part rows (with
    /// their original identities and timestamps), batch membership,
    /// `total_rows` bumps, the `batches` row under the source producer, and
    /// the `merge_log` entry — one transaction. Parts whose
    /// `(subset_uuid, content_hash)` already exist are skipped. Returns
    /// `(inserted, skipped)`.
    ///
    /// Replays of an applied batch insert zero rows: the `merge_log`
    /// primary key makes the whole operation a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure; on error the catalog
    /// is unchanged.
    pub fn apply_merged_batch(
        &mut self,
        batch: &BatchRow,
        parts: &[SealedPart],
    ) -> Result<(usize, usize), CatalogError> {
        self.txn(move |tx| {
            let already: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM merge_log WHERE producer_id = ?1 AND bid = ?2",
                    params![batch.producer_id, batch.bid],
                    |r| r.get(0),
                )
                .optional()?;
            if already.is_some() {
                return Ok((0, parts.len()));
            }
            let mut inserted = 0usize;
            let mut skipped = 0usize;
            for part in parts {
                tx.execute(
                    "INSERT OR IGNORE INTO parts(part_uuid, subset_uuid, created_at_epoch, n_rows, scheme_version,
                                                 file_relpath, marked_for_deletion, content_hash, producer_id,
                                                 batch_id, part_stats_json, enc_version, plaintext_size)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?9, ?10, 0, ?11)",
                    params![
                        part.part_uuid.to_string(),
                        part.subset_uuid.to_string(),
                        part.created_at_epoch,
                        part.n_rows,
                        part.scheme_version,
                        part.file_relpath,
                        part.content_hash,
                        batch.producer_id,
                        batch.bid,
                        part.part_stats_json,
                        part.plaintext_size,
                    ],
                )?;
                if tx.changes() == 0 {
                    skipped += 1;
                    continue;
                }
                tx.execute(
                    "INSERT OR IGNORE INTO batch_parts(bid, part_uuid) VALUES (?1, ?2)",
                    params![batch.bid, part.part_uuid.to_string()],
                )?;
                tx.execute(
                    "UPDATE subsets SET total_rows = total_rows + ?1 WHERE subset_uuid = ?2",
                    params![part.n_rows, part.subset_uuid.to_string()],
                )?;
                inserted += 1;
            }
            tx.execute(
                "INSERT OR IGNORE INTO batches(bid, producer_id, created_at_epoch, schema_fingerprint)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    batch.bid,
                    batch.producer_id,
                    batch.created_at_epoch,
                    batch.schema_fingerprint
                ],
            )?;
            tx.execute(
                "INSERT INTO merge_log(producer_id, bid, merged_at_epoch) VALUES (?1, ?2, ?3)",
                params![batch.producer_id, batch.bid, now_epoch_us()],
            )?;
            Ok((inserted, skipped))
        })
    }

    // ------------------------------------------------------------------
    // Merge log
    // ------------------------------------------------------------------

    /// Batch IDs already applied for a producer.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure.
    pub fn merged_bids(&self, producer_id: &str) -> Result<HashSet<String>, CatalogError> {
        let mut stmt = self
            .conn
            .prepare("SELECT bid FROM merge_log WHERE producer_id = ?1")?;
        let rows = stmt
            .query_map(params![producer_id], |r| r.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(rows)
    }

    /// All `(producer_id, bid)` pairs in the merge log.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError`] on database failure.
    pub fn merge_log(&self) -> Result<Vec<(String, String)>, CatalogError> {
        let mut stmt = self
            .conn
            .prepare("SELECT producer_id, bid FROM merge_log ORDER BY producer_id, bid")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn sql_values_equal(a: &SqlValue, b: &SqlValue) -> bool {
    match (a, b) {
        (SqlValue::Integer(x), SqlValue::Integer(y)) => x == y,
        (SqlValue::Text(x), SqlValue::Text(y)) => x == y,
        #[allow(clippy::float_cmp)]
        (SqlValue::Real(x), SqlValue::Real(y)) => x == y,
        (SqlValue::Null, SqlValue::Null) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_keys(lat: f64, site: &str) -> BTreeMap<String, KeyValue> {
        BTreeMap::from([
            ("lat".to_string(), KeyValue::Real(lat)),
            ("site".to_string(), KeyValue::Text(site.to_string())),
        ])
    }

    fn open_dataset(root: &Path) -> (Catalog, DatasetRecord) {
        let mut catalog = Catalog::open(root).expect("open");
        let mut seed = SchemaDocument::default();
        seed.quantization.insert("lat".to_string(), 1_000_000.0);
        let record = catalog
            .ensure_dataset("weather", &StorageScheme::default(), &seed)
            .expect("dataset");
        (catalog, record)
    }

    fn sealed(subset: Uuid, hash: &str, rows: i64) -> SealedPart {
        SealedPart {
            part_uuid: Uuid::new_v4(),
            subset_uuid: subset,
            created_at_epoch: now_epoch_us(),
            n_rows: rows,
            scheme_version: 1,
            file_relpath: format!("subsets/{subset}/parts/v1/{}.h5", Uuid::new_v4()),
            content_hash: hash.to_string(),
            part_stats_json: None,
            plaintext_size: Some(64),
        }
    }

    #[test]
    fn test_ensure_dataset_idempotent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (mut catalog, record) = open_dataset(tmp.path());
        let again = catalog
            .ensure_dataset("weather", &StorageScheme::default(), &SchemaDocument::default())
            .expect("again");
        assert_eq!(record.dataset_uuid, again.dataset_uuid);
        assert_eq!(
            again.schema.quantization.get("lat"),
            Some(&1_000_000.0),
            "existing schema wins over a new seed"
        );
    }

    #[test]
    fn test_key_columns_and_subset_identity() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (mut catalog, record) = open_dataset(tmp.path());
        let keys = sample_keys(37.774_929_6, "sfo");
        let (normalizer, _) = catalog.ensure_key_columns(&record, &keys).expect("columns");
        assert_eq!(normalizer.identity_columns(), vec!["lat_s", "lat_q", "site"]);

        let a = catalog.get_or_create_subset(&normalizer, &keys).expect("a");
        // A value that quantizes identically lands in the same subset.
        let b = catalog
            .get_or_create_subset(&normalizer, &sample_keys(37.774_930_4, "sfo"))
            .expect("b");
        assert_eq!(a, b);
        let c = catalog
            .get_or_create_subset(&normalizer, &sample_keys(37.774_929_6, "oak"))
            .expect("c");
        assert_ne!(a, c);
        assert_eq!(a, normalizer.subset_uuid(&keys).expect("uuid"));
    }

    #[test]
    fn test_key_set_mismatch_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (mut catalog, record) = open_dataset(tmp.path());
        let keys = sample_keys(1.0, "sfo");
        let (_, record) = catalog.ensure_key_columns(&record, &keys).expect("columns");
        let wrong = BTreeMap::from([("lat".to_string(), KeyValue::Real(1.0))]);
        let err = catalog
            .ensure_key_columns(&record, &wrong)
            .expect_err("missing key");
        assert!(matches!(err, CatalogError::InvalidKeys { .. }));
    }

    #[test]
    fn test_specials_and_round_trip_of_raw_keys() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (mut catalog, record) = open_dataset(tmp.path());
        let keys = sample_keys(f64::NAN, "sfo");
        let (normalizer, _) = catalog.ensure_key_columns(&record, &keys).expect("columns");
        let subset = catalog.get_or_create_subset(&normalizer, &keys).expect("subset");
        let values = catalog
            .subset_key_values(&normalizer, &subset)
            .expect("values");
        let KeyValue::Real(lat) = values["lat"] else {
            panic!("lat must be REAL");
        };
        assert!(lat.is_nan(), "NaN raw key must survive the round trip");
        assert_eq!(values["site"], KeyValue::Text("sfo".to_string()));
    }

    #[test]
    fn test_find_subsets_equality_and_ranges() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (mut catalog, record) = open_dataset(tmp.path());
        let (normalizer, _) = catalog
            .ensure_key_columns(&record, &sample_keys(1.0, "sfo"))
            .expect("columns");
        for (lat, site) in [(1.0, "sfo"), (2.0, "sfo"), (f64::NAN, "oak")] {
            catalog
                .get_or_create_subset(&normalizer, &sample_keys(lat, site))
                .expect("subset");
        }

        let eq = catalog
            .find_subsets(
                &normalizer,
                &SubsetQuery {
                    filters: BTreeMap::from([(
                        "lat".to_string(),
                        KeyFilter::Eq(KeyValue::Real(1.0)),
                    )]),
                    ..SubsetQuery::default()
                },
            )
            .expect("eq");
        assert_eq!(eq.len(), 1);

        let nan_eq = catalog
            .find_subsets(
                &normalizer,
                &SubsetQuery {
                    filters: BTreeMap::from([(
                        "lat".to_string(),
                        KeyFilter::Eq(KeyValue::Real(f64::NAN)),
                    )]),
                    ..SubsetQuery::default()
                },
            )
            .expect("nan eq");
        assert_eq!(nan_eq.len(), 1, "NaN equality routes through _s");

        let range = catalog
            .find_subsets(
                &normalizer,
                &SubsetQuery {
                    filters: BTreeMap::from([(
                        "lat".to_string(),
                        KeyFilter::RealRange(0.5, 3.0),
                    )]),
                    ..SubsetQuery::default()
                },
            )
            .expect("range");
        assert_eq!(range.len(), 2, "ranges exclude the NaN subset");

        let err = catalog
            .find_subsets(
                &normalizer,
                &SubsetQuery {
                    filters: BTreeMap::from([(
                        "lat".to_string(),
                        KeyFilter::RealRange(f64::NAN, 1.0),
                    )]),
                    ..SubsetQuery::default()
                },
            )
            .expect_err("NaN bound");
        assert!(matches!(err, CatalogError::InvalidKeys { .. }));
    }

    #[test]
    fn test_record_batch_dedup_and_totals() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (mut catalog, record) = open_dataset(tmp.path());
        let keys = sample_keys(1.0, "sfo");
        let (normalizer, record) = catalog.ensure_key_columns(&record, &keys).expect("columns");
        let subset = catalog.get_or_create_subset(&normalizer, &keys).expect("subset");
        let fingerprint = record.schema.fingerprint();

        let first = sealed(subset, "hash_a", 10);
        let commit = catalog
            .record_batch(&record.dataset_uuid, "bid-1", &fingerprint, &[first.clone()], None)
            .expect("commit 1");
        assert!(matches!(commit.outcomes[0], PublishOutcome::Inserted { .. }));

        let duplicate = sealed(subset, "hash_a", 10);
        let commit2 = catalog
            .record_batch(&record.dataset_uuid, "bid-2", &fingerprint, &[duplicate], None)
            .expect("commit 2");
        match &commit2.outcomes[0] {
            PublishOutcome::AlreadyPresent { part_uuid, .. } => {
                assert_eq!(*part_uuid, first.part_uuid);
            }
            other => panic!("expected AlreadyPresent, got {other:?}"),
        }

        let row = catalog.subset_row(&subset).expect("row").expect("present");
        assert_eq!(row.total_rows, 10, "duplicate must not double-count");
        assert_eq!(catalog.batches().expect("batches").len(), 2);
        assert_eq!(catalog.parts_for_batch("bid-2").expect("parts").len(), 0);
    }

    #[test]
    fn test_tamper_chain_links_batches() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (mut catalog, record) = open_dataset(tmp.path());
        catalog.enable_tamper_chain("pepper").expect("enable");
        let keys = sample_keys(1.0, "sfo");
        let (normalizer, record) = catalog.ensure_key_columns(&record, &keys).expect("columns");
        let subset = catalog.get_or_create_subset(&normalizer, &keys).expect("subset");
        let fp = record.schema.fingerprint();

        catalog
            .record_batch(&record.dataset_uuid, "bid-1", &fp, &[sealed(subset, "h1", 1)], None)
            .expect("b1");
        let head1 = catalog.chain_head().expect("head").expect("some");
        catalog
            .record_batch(&record.dataset_uuid, "bid-2", &fp, &[sealed(subset, "h2", 1)], None)
            .expect("b2");
        let head2 = catalog.chain_head().expect("head").expect("some");
        assert_ne!(head1, head2);
        assert_eq!(head1.len(), 32);
    }

    #[test]
    fn test_gc_commit_reconciles_totals_and_deletes_empty() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (mut catalog, record) = open_dataset(tmp.path());
        let keys = sample_keys(1.0, "sfo");
        let (normalizer, record) = catalog.ensure_key_columns(&record, &keys).expect("columns");
        let subset = catalog.get_or_create_subset(&normalizer, &keys).expect("subset");
        let fp = record.schema.fingerprint();
        let part = sealed(subset, "h1", 5);
        catalog
            .record_batch(&record.dataset_uuid, "bid-1", &fp, &[part.clone()], None)
            .expect("commit");

        catalog.mark_parts(&[part.part_uuid], true).expect("mark part");
        catalog.mark_subsets(&[subset], true).expect("mark subset");
        let (parts_deleted, subsets_deleted, doomed) = catalog
            .gc_commit(&[part.part_uuid], &[subset])
            .expect("gc");
        assert_eq!(parts_deleted, 1);
        assert_eq!(subsets_deleted, 1);
        assert_eq!(doomed, vec![subset]);
        assert!(catalog.subset_row(&subset).expect("row").is_none());
    }

    #[test]
    fn test_merge_log_round_trip() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (mut catalog, _) = open_dataset(tmp.path());
        catalog
            .txn(|tx| {
                tx.execute(
                    "INSERT INTO merge_log(producer_id, bid, merged_at_epoch) VALUES ('p1', 'b1', 1)",
                    [],
                )?;
                Ok(())
            })
            .expect("insert");
        let merged = catalog.merged_bids("p1").expect("merged");
        assert!(merged.contains("b1"));
        assert!(catalog.merged_bids("p2").expect("merged").is_empty());
    }
}
