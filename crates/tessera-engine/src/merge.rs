//! Idempotent catalog-to-catalog merge.
//!
//! `merge_local` replays a source catalog's unseen batches into a
//! destination catalog: it compares the schema fingerprint, storage scheme,
//! quantization map, and encryption policy; resolves destination subsets by
//! identity tuple; skips parts already present by `(subset_uuid,
//! content_hash)`; hard-links or copies part files; and records each batch
//! and its `merge_log` entry in one destination transaction. Re-running a
//! completed merge inserts zero rows. A committed batch is durable; an
//! uncommitted one leaves the destination unchanged, so the operation is
//! cancellable between batches.
//!
//! On an invariant mismatch with `allow_schema_mismatch` set, the source is
//! replayed into a *fork*: a fresh dataset root nested under
//! `forks/<alias>` in the destination, registered in the destination's
//! `datasets` table and initialized with the source schema.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tessera_core::hash::{content_hash, DEFAULT_MAX_CHUNK_BYTES};
use tessera_core::keys::KeyNormalizer;

use crate::audit::AuditLog;
use crate::catalog::{BatchRow, Catalog, CatalogError, DatasetRecord, SealedPart};
use crate::error::EngineError;
use crate::fsutil::{fsync_dir, makedirs_with_fsync};
use crate::lease::acquire_dataset_exclusive;
use crate::store::PartFileStore;

/// How part file bytes travel from source to destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyMode {
    /// Hard-link when the roots share a filesystem, byte-copy otherwise.
    #[default]
    Auto,
    /// Hard-link only; fail across filesystems.
    Hardlink,
    /// Always byte-copy.
    Copy,
}

/// Merge options.
#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    /// File transfer strategy.
    pub copy_mode: CopyMode,
    /// Recompute each transferred file's content hash and compare.
    pub verify_hash: bool,
    /// On an invariant mismatch, replay into a fork dataset instead of
    /// failing.
    pub allow_schema_mismatch: bool,
    /// Compute the plan without writing anything.
    pub dry_run: bool,
}

/// What a merge did (or, for a dry run, would do).
#[derive(Debug, Clone, Default)]
pub struct MergeReport {
    /// Batches applied to the destination.
    pub batches_applied: usize,
    /// Part files transferred and rows inserted.
    pub parts_transferred: usize,
    /// Parts skipped as already present.
    pub parts_skipped: usize,
    /// Alias of the fork dataset, when one was created.
    pub forked_alias: Option<String>,
    /// Batch IDs the plan covers, ascending by commit time.
    pub planned_bids: Vec<String>,
}

struct MergeSource {
    catalog: Catalog,
    record: DatasetRecord,
    normalizer: Option<KeyNormalizer>,
    root: PathBuf,
}

fn primary_dataset(catalog: &Catalog) -> Result<DatasetRecord, EngineError> {
    let mut primaries: Vec<DatasetRecord> = catalog
        .datasets()?
        .into_iter()
        .filter(|d| d.root_rel.is_empty())
        .collect();
    match primaries.len() {
        1 => Ok(primaries.remove(0)),
        0 => Err(EngineError::MergeInvariantViolated {
            detail: "catalog has no primary dataset".to_string(),
        }),
        _ => Err(EngineError::MergeInvariantViolated {
            detail: "catalog has more than one primary dataset".to_string(),
        }),
    }
}

fn normalizer_for(record: &DatasetRecord) -> Result<Option<KeyNormalizer>, EngineError> {
    if record.schema.key_schema.is_empty() {
        return Ok(None);
    }
    Ok(Some(KeyNormalizer::new(
        &record.schema.key_schema,
        &record.schema.key_order,
        &record.schema.quantization,
    )?))
}

fn invariant_mismatch(src: &DatasetRecord, dst: &DatasetRecord) -> Option<String> {
    if src.schema.fingerprint() != dst.schema.fingerprint() {
        return Some("schema fingerprint differs".to_string());
    }
    if src.scheme != dst.scheme {
        return Some("storage scheme differs".to_string());
    }
    if src.schema.quantization != dst.schema.quantization {
        return Some("quantization map differs".to_string());
    }
    if src.schema.encryption != dst.schema.encryption {
        return Some("encryption policy differs".to_string());
    }
    None
}

/// True when the destination dataset has never accepted a write and can
/// adopt the source schema wholesale.
fn is_virgin(catalog: &Catalog, record: &DatasetRecord) -> Result<bool, CatalogError> {
    Ok(record.schema.key_schema.is_empty()
        && !record.schema.has_canonical_dtype()
        && catalog.batches()?.is_empty())
}

/// Merge the source root's primary dataset into the destination root.
///
/// # Errors
///
/// Returns [`EngineError::MergeInvariantViolated`] on a schema, scheme,
/// quantization, or encryption disagreement (unless forking is allowed),
/// [`EngineError::ContentHashMismatch`] when verification fails, and other
/// [`EngineError`] kinds for lease, store, or catalog failures.
pub fn merge_local(
    src_root: &Path,
    dst_root: &Path,
    opts: &MergeOptions,
) -> Result<MergeReport, EngineError> {
    let src_catalog = Catalog::open_readonly(src_root)?;
    let src_record = primary_dataset(&src_catalog)?;
    let src_normalizer = normalizer_for(&src_record)?;
    let src = MergeSource {
        catalog: src_catalog,
        record: src_record,
        normalizer: src_normalizer,
        root: src_root.to_path_buf(),
    };

    let mut dst = Catalog::open(dst_root)?;
    let primary = dst.datasets()?.into_iter().find(|d| d.root_rel.is_empty());
    let (mut dst_record, alias_mismatch) = match primary {
        None => (
            dst.ensure_dataset(&src.record.alias, &src.record.scheme, &src.record.schema)?,
            None,
        ),
        Some(p) if p.alias == src.record.alias => (p, None),
        Some(p) => {
            let detail = format!(
                "destination primary dataset is {:?}, source is {:?}",
                p.alias, src.record.alias
            );
            (p, Some(detail))
        }
    };

    if alias_mismatch.is_none()
        && is_virgin(&dst, &dst_record)?
        && invariant_mismatch(&src.record, &dst_record).is_some()
    {
        // A destination that has never accepted a write adopts the source
        // schema wholesale.
        dst.save_schema(&dst_record.dataset_uuid, &src.record.schema)?;
        dst_record = dst
            .dataset_by_alias(&src.record.alias)?
            .ok_or_else(|| EngineError::MergeInvariantViolated {
                detail: "destination dataset vanished during adoption".to_string(),
            })?;
    }

    let mismatch = alias_mismatch.or_else(|| invariant_mismatch(&src.record, &dst_record));
    if let Some(detail) = mismatch {
        if !opts.allow_schema_mismatch {
            return Err(EngineError::MergeInvariantViolated { detail });
        }
        // Fork: a fresh dataset root nested in the destination, carrying
        // the source schema. The original destination dataset is untouched.
        let short = src.record.dataset_uuid.simple().to_string();
        let fork_alias = format!("{}_fork_{}", src.record.alias, &short[..8]);
        let fork_rel = format!("forks/{fork_alias}");
        let fork_root = dst_root.join(&fork_rel);
        if opts.dry_run {
            // A fresh fork has seen nothing, so the plan is every source
            // batch.
            return Ok(MergeReport {
                forked_alias: Some(fork_alias),
                planned_bids: src.catalog.batches()?.into_iter().map(|b| b.bid).collect(),
                ..MergeReport::default()
            });
        }
        info!(alias = %fork_alias, "schema mismatch, replaying into fork");
        let fork_opts = MergeOptions {
            allow_schema_mismatch: false,
            ..opts.clone()
        };
        let mut report = merge_local(&src.root, &fork_root, &fork_opts)?;
        let fork_catalog = Catalog::open(&fork_root)?;
        let fork_record = primary_dataset(&fork_catalog)?;
        dst.register_fork(
            &fork_alias,
            &fork_record.dataset_uuid,
            &fork_rel,
            &serde_json::to_string(&fork_record.schema).unwrap_or_default(),
            &serde_json::to_string(&fork_record.scheme).unwrap_or_default(),
        )?;
        report.forked_alias = Some(fork_alias);
        return Ok(report);
    }

    if opts.dry_run {
        return plan_only(&src, &dst);
    }

    let _maintenance = acquire_dataset_exclusive(&dst_root.join("locks"))?;
    apply_batches(&src, &mut dst, &dst_record, dst_root, opts)
}

fn plan_only(src: &MergeSource, dst: &Catalog) -> Result<MergeReport, EngineError> {
    let mut report = MergeReport::default();
    for batch in src.catalog.batches()? {
        if dst.merged_bids(&batch.producer_id)?.contains(&batch.bid) {
            continue;
        }
        report.planned_bids.push(batch.bid);
    }
    Ok(report)
}

fn apply_batches(
    src: &MergeSource,
    dst: &mut Catalog,
    dst_record: &DatasetRecord,
    dst_root: &Path,
    opts: &MergeOptions,
) -> Result<MergeReport, EngineError> {
    let audit = AuditLog::new(dst_root, dst_root.join("logs").join("audit.log").exists());
    let dst_normalizer = normalizer_for(dst_record)?;
    if dst_normalizer.is_some() {
        // Fork and adopted destinations need their key columns realized.
        dst.apply_key_columns(&dst_record.schema)?;
    }
    let dst_store = PartFileStore::new(dst_root, dst_record.scheme.clone())?;

    let mut report = MergeReport::default();
    let applied: std::collections::HashSet<(String, String)> =
        dst.merge_log()?.into_iter().collect();

    for batch in src.catalog.batches()? {
        if applied.contains(&(batch.producer_id.clone(), batch.bid.clone())) {
            continue;
        }
        let (inserted, skipped) = apply_one_batch(src, dst, &dst_normalizer, &dst_store, &batch, opts)?;
        report.batches_applied += 1;
        report.parts_transferred += inserted;
        report.parts_skipped += skipped;
        report.planned_bids.push(batch.bid.clone());
        audit.record(
            "merge_batch",
            json!({
                "bid": batch.bid,
                "producer": batch.producer_id,
                "inserted": inserted,
                "skipped": skipped,
            }),
        );
    }
    info!(
        batches = report.batches_applied,
        transferred = report.parts_transferred,
        skipped = report.parts_skipped,
        "merge complete"
    );
    Ok(report)
}

fn apply_one_batch(
    src: &MergeSource,
    dst: &mut Catalog,
    dst_normalizer: &Option<KeyNormalizer>,
    dst_store: &PartFileStore,
    batch: &BatchRow,
    opts: &MergeOptions,
) -> Result<(usize, usize), EngineError> {
    let src_parts = src.catalog.parts_for_batch(&batch.bid)?;
    let mut to_apply = Vec::with_capacity(src_parts.len());
    let mut transferred: Vec<PathBuf> = Vec::new();

    let outcome: Result<(), EngineError> = (|| {
        for part in &src_parts {
            // Resolve the destination subset by identity tuple.
            let (Some(src_norm), Some(dst_norm)) = (&src.normalizer, dst_normalizer) else {
                return Err(EngineError::MergeInvariantViolated {
                    detail: "source batches exist but no key schema is locked".to_string(),
                });
            };
            let keys = src
                .catalog
                .subset_key_values(src_norm, &part.subset_uuid)?;
            let dst_subset = dst.get_or_create_subset(dst_norm, &keys)?;

            if dst
                .find_live_part_by_content(&dst_subset, &part.content_hash)?
                .is_some()
            {
                debug!(part = %part.part_uuid, "already present, skipping");
                to_apply.push(None);
                continue;
            }

            let src_file = src.root.join(&part.file_relpath);
            let dst_file = dst_store.root().join(&part.file_relpath);
            if let Some(dir) = dst_file.parent() {
                makedirs_with_fsync(dir)
                    .map_err(|e| EngineError::io("creating merge target directory", e))?;
            }
            if !dst_file.exists() {
                transfer_file(&src_file, &dst_file, opts.copy_mode)?;
                transferred.push(dst_file.clone());
            }
            if opts.verify_hash {
                let (_, read_back) = dst_store.read(Path::new(&part.file_relpath))?;
                let computed = content_hash(&read_back, DEFAULT_MAX_CHUNK_BYTES);
                if computed != part.content_hash {
                    return Err(EngineError::ContentHashMismatch {
                        part_uuid: part.part_uuid.to_string(),
                        expected: part.content_hash.clone(),
                        computed,
                    });
                }
            }
            to_apply.push(Some(SealedPart {
                part_uuid: part.part_uuid,
                subset_uuid: dst_subset,
                created_at_epoch: part.created_at_epoch,
                n_rows: part.n_rows,
                scheme_version: part.scheme_version,
                file_relpath: part.file_relpath.clone(),
                content_hash: part.content_hash.clone(),
                part_stats_json: part.part_stats_json.clone(),
                plaintext_size: None,
            }));
        }
        Ok(())
    })();

    if let Err(e) = outcome {
        // The batch aborts whole; drop what it copied so a retry starts
        // clean. Hard links to still-live source files are just as safe to
        // unlink.
        for file in &transferred {
            if fs::remove_file(file).is_ok() {
                if let Some(dir) = file.parent() {
                    let _ = fsync_dir(dir);
                }
            } else {
                warn!(file = %file.display(), "failed to drop partial merge transfer");
            }
        }
        return Err(e);
    }

    let rows: Vec<SealedPart> = to_apply.into_iter().flatten().collect();
    let (inserted, mut skipped) = dst.apply_merged_batch(batch, &rows)?;
    skipped += src_parts.len() - rows.len();
    Ok((inserted, skipped))
}

fn transfer_file(src: &Path, dst: &Path, mode: CopyMode) -> Result<(), EngineError> {
    match mode {
        CopyMode::Hardlink => fs::hard_link(src, dst)
            .map_err(|e| EngineError::io("hard-linking part file", e)),
        CopyMode::Copy => copy_durable(src, dst),
        CopyMode::Auto => match fs::hard_link(src, dst) {
            Ok(()) => Ok(()),
            Err(_) => copy_durable(src, dst),
        },
    }
}

fn copy_durable(src: &Path, dst: &Path) -> Result<(), EngineError> {
    let tmp = dst.with_extension("h5.tmp");
    fs::copy(src, &tmp).map_err(|e| EngineError::io("copying part file", e))?;
    let file = fs::File::open(&tmp).map_err(|e| EngineError::io("opening copied part", e))?;
    file.sync_all()
        .map_err(|e| EngineError::io("syncing copied part", e))?;
    fs::rename(&tmp, dst).map_err(|e| EngineError::io("renaming copied part", e))?;
    if let Some(dir) = dst.parent() {
        let _ = fsync_dir(dir);
    }
    Ok(())
}

/// The distinct live `(subset_uuid, content_hash)` pairs of a root, the
/// set the union-correctness property is stated over.
///
/// # Errors
///
/// Returns [`EngineError`] when the catalog cannot be read.
pub fn distinct_content(root: &Path) -> Result<Vec<(Uuid, String)>, EngineError> {
    let catalog = Catalog::open_readonly(root)?;
    let mut out: Vec<(Uuid, String)> = catalog
        .all_parts()?
        .into_iter()
        .filter(|p| !p.marked_for_deletion)
        .map(|p| (p.subset_uuid, p.content_hash))
        .collect();
    out.sort();
    out.dedup();
    Ok(out)
}
