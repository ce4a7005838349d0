//! Garbage collection and consistency repair for a dataset root.
//!
//! Both operations take the dataset lease exclusively, so they never run
//! against live writers. `fsck` reconciles the filesystem with the catalog:
//! orphan part files whose embedded attributes match a known subset are
//! re-adopted as catalog rows, unknown orphans are deleted, stale
//! temporaries are swept, and catalog rows whose files are gone are
//! reported. GC unlinks soft-deleted parts (confined to the root), prunes
//! emptied fan-out directories, recomputes `total_rows` from live parts,
//! and physically removes subsets whose last live part is gone.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use tessera_core::hash::{content_hash, DEFAULT_MAX_CHUNK_BYTES};

use crate::audit::AuditLog;
use crate::catalog::{Catalog, SealedPart};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::fsutil::sweep_stale_tmps;
use crate::lease::{acquire_dataset_exclusive, Lease};
use crate::store::{FlatPartBackend, PartBackend, PartFileStore};

/// What an fsck pass found and did.
#[derive(Debug, Clone, Default)]
pub struct FsckReport {
    /// Part files present on disk.
    pub fs_files: usize,
    /// Part rows present in the catalog.
    pub db_files: usize,
    /// Files with no catalog row.
    pub orphans_found: usize,
    /// Orphans re-adopted as catalog rows.
    pub adopted: usize,
    /// Orphans deleted (unknown subset or unreadable).
    pub deleted: usize,
    /// Stale temporaries swept.
    pub tmp_swept: usize,
    /// Catalog rows whose file is missing.
    pub missing_files: Vec<String>,
}

/// What a GC pass removed.
#[derive(Debug, Clone, Default)]
pub struct GcReport {
    /// Part files unlinked.
    pub files_removed: usize,
    /// Part rows deleted.
    pub parts_deleted: usize,
    /// Subset rows deleted.
    pub subsets_deleted: usize,
}

fn maintenance_lease(config: &EngineConfig) -> Result<Lease, EngineError> {
    if config.advisory_locking {
        Ok(acquire_dataset_exclusive(&config.lock_root())?)
    } else {
        Ok(Lease::disabled())
    }
}

fn walk_part_files(root: &Path, out: &mut Vec<PathBuf>, swept: &mut usize, horizon: u64) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    *swept += sweep_stale_tmps(root, horizon);
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_part_files(&path, out, swept, horizon);
        } else if path.extension().and_then(|e| e.to_str()) == Some("h5") {
            out.push(path);
        }
    }
}

/// Repair filesystem/catalog drift under the exclusive dataset lease.
///
/// # Errors
///
/// Returns [`EngineError::Lease`] when writers are active, or other kinds
/// on catalog and store failures.
pub fn fsck_dataset(
    catalog: &mut Catalog,
    config: &EngineConfig,
    adopt_orphans: bool,
) -> Result<FsckReport, EngineError> {
    let _lease = maintenance_lease(config)?;
    fsck_locked(catalog, config, adopt_orphans)
}

fn fsck_locked(
    catalog: &mut Catalog,
    config: &EngineConfig,
    adopt_orphans: bool,
) -> Result<FsckReport, EngineError> {
    let root = catalog.root().to_path_buf();
    let audit = AuditLog::new(&root, config.audit_log_enabled);
    let backend = FlatPartBackend;
    let mut report = FsckReport::default();

    let known: HashSet<String> = catalog
        .all_parts()?
        .into_iter()
        .map(|p| p.file_relpath)
        .collect();
    let subsets = catalog.all_subset_uuids()?;
    report.db_files = known.len();

    let mut on_disk = Vec::new();
    walk_part_files(
        &root.join("subsets"),
        &mut on_disk,
        &mut report.tmp_swept,
        config.tmp_sweep_seconds,
    );
    report.fs_files = on_disk.len();

    let mut seen_on_disk: HashSet<String> = HashSet::with_capacity(on_disk.len());
    for abs in on_disk {
        let Ok(rel) = abs.strip_prefix(&root) else {
            continue;
        };
        let rel_text = rel.to_string_lossy().into_owned();
        seen_on_disk.insert(rel_text.clone());
        if known.contains(&rel_text) {
            continue;
        }
        report.orphans_found += 1;
        if !adopt_orphans {
            continue;
        }
        match backend.read_attributes(&abs) {
            Ok(attrs) if subsets.contains(&attrs.subset_uuid) => {
                let hash = if attrs.content_hash.is_empty() {
                    match backend.read(&abs) {
                        Ok((_, batch)) => content_hash(&batch, DEFAULT_MAX_CHUNK_BYTES),
                        Err(e) => {
                            warn!(file = %abs.display(), error = %e, "unreadable orphan");
                            report.deleted += delete_orphan(&root, rel);
                            continue;
                        }
                    }
                } else {
                    attrs.content_hash.clone()
                };
                let adopted = catalog.adopt_orphan_part(&SealedPart {
                    part_uuid: attrs.part_uuid,
                    subset_uuid: attrs.subset_uuid,
                    created_at_epoch: attrs.created_at_epoch,
                    n_rows: i64::try_from(attrs.n_rows).unwrap_or(0),
                    scheme_version: attrs.scheme_version,
                    file_relpath: rel_text.clone(),
                    content_hash: hash,
                    part_stats_json: None,
                    plaintext_size: None,
                })?;
                if adopted {
                    report.adopted += 1;
                    audit.record("fsck_adopt", json!({"file": rel_text}));
                } else {
                    // Content already catalogued elsewhere; the file is
                    // redundant.
                    report.deleted += delete_orphan(&root, rel);
                }
            }
            Ok(_) => {
                report.deleted += delete_orphan(&root, rel);
                audit.record("fsck_delete", json!({"file": rel_text}));
            }
            Err(e) => {
                warn!(file = %abs.display(), error = %e, "unreadable orphan");
                report.deleted += delete_orphan(&root, rel);
            }
        }
    }

    for rel in &known {
        if !seen_on_disk.contains(rel) {
            report.missing_files.push(rel.clone());
        }
    }
    if !report.missing_files.is_empty() {
        warn!(
            missing = report.missing_files.len(),
            "catalog rows without files"
        );
    }
    info!(
        fs_files = report.fs_files,
        orphans = report.orphans_found,
        adopted = report.adopted,
        "fsck complete"
    );
    Ok(report)
}

fn delete_orphan(root: &Path, rel: &Path) -> usize {
    match crate::fsutil::safe_unlink_inside(root, rel) {
        Ok(true) => 1,
        Ok(false) => 0,
        Err(e) => {
            warn!(file = %rel.display(), error = %e, "failed to delete orphan");
            0
        }
    }
}

/// Unlink marked parts, reconcile totals, and drop empty subsets, under
/// the exclusive dataset lease. Runs an adopting fsck first so orphans of
/// a crashed seal are either recovered or removed in the same pass.
///
/// # Errors
///
/// Returns [`EngineError::Lease`] when writers are active, or other kinds
/// on catalog and store failures.
pub fn collect_garbage(
    catalog: &mut Catalog,
    config: &EngineConfig,
) -> Result<GcReport, EngineError> {
    let _lease = maintenance_lease(config)?;
    let root = catalog.root().to_path_buf();
    let audit = AuditLog::new(&root, config.audit_log_enabled);

    if let Err(e) = fsck_locked(catalog, config, true) {
        warn!(error = %e, "pre-GC fsck failed, continuing with catalog state");
    }

    let record = catalog
        .datasets()?
        .into_iter()
        .find(|d| d.root_rel.is_empty());
    let scheme = record.map(|d| d.scheme).unwrap_or_default();
    let store = PartFileStore::new(&root, scheme)?;

    let marked = catalog.list_marked_parts()?;
    let mut report = GcReport::default();
    let mut part_ids: Vec<Uuid> = Vec::with_capacity(marked.len());
    let mut touched: HashSet<Uuid> = HashSet::new();
    for part in &marked {
        match store.remove(&part.subset_uuid, Path::new(&part.file_relpath)) {
            Ok(true) => report.files_removed += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(part = %part.part_uuid, error = %e, "failed to unlink marked part");
                continue;
            }
        }
        part_ids.push(part.part_uuid);
        touched.insert(part.subset_uuid);
    }

    let touched: Vec<Uuid> = touched.into_iter().collect();
    let (parts_deleted, subsets_deleted, doomed) = catalog.gc_commit(&part_ids, &touched)?;
    report.parts_deleted = parts_deleted;
    report.subsets_deleted = subsets_deleted;

    for subset in doomed {
        let dir = root.join("subsets").join(subset.to_string());
        if dir.is_dir() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                warn!(subset = %subset, error = %e, "failed to remove subset directory");
            }
        }
    }
    audit.record(
        "gc",
        json!({
            "files_removed": report.files_removed,
            "parts_deleted": report.parts_deleted,
            "subsets_deleted": report.subsets_deleted,
        }),
    );
    info!(
        files = report.files_removed,
        parts = report.parts_deleted,
        subsets = report.subsets_deleted,
        "gc complete"
    );
    Ok(report)
}
