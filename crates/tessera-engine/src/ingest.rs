//! The ingest coordinator: normalize → buffer → (spill to staging) → claim
//! → seal → publish → record.
//!
//! One coordinator serves one dataset root in one writer process. Accepted
//! rows are canonicalized and jagged-padded on entry and accumulate per
//! subset; a buffer reaching `part_rows` rows or `chunk_mb` bytes seals. A
//! seal takes the subset lease, hashes, writes the part file, and commits
//! the part and its batch membership in a single catalog transaction.
//!
//! In crash-safe mode rows first pass through the durable staging queue;
//! a claim token drives compaction, and claimed records are deleted only
//! after the catalog commit. Staged rows therefore survive a writer crash
//! and are reclaimed after the staleness cutoff.
//!
//! When several worker processes share a dataset, each row routes to
//! exactly one writer by hashing the subset UUID — computed locally from
//! the identity tuple, with no catalog lookup.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tessera_core::batch::{CellValues, RowBatch};
use tessera_core::hash::{content_hash, DEFAULT_MAX_CHUNK_BYTES};
use tessera_core::jagged::{pad_batch, reconcile_dtype, PaddedBatch, ReconcileOutcome};
use tessera_core::keys::{partition_for_subset, KeyNormalizer, KeyValue};
use tessera_core::schema::{EncryptionPolicy, PartConfig, SchemaDocument};

use crate::audit::AuditLog;
use crate::catalog::{keys_to_json, Catalog, DatasetRecord, PublishOutcome, SealedPart};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::lease::{acquire_dataset_shared, acquire_subset, Lease};
use crate::staging::{StagedPayload, StagingQueue};
use crate::store::{PartFileStore, StorageScheme};

#[derive(Debug)]
struct SubsetBuffer {
    keys: BTreeMap<String, KeyValue>,
    chunks: Vec<PaddedBatch>,
    rows: usize,
    bytes: usize,
}

/// Per-process writer for one dataset.
#[derive(Debug)]
pub struct IngestCoordinator {
    config: EngineConfig,
    catalog: Catalog,
    store: PartFileStore,
    audit: AuditLog,
    dataset: DatasetRecord,
    staging: Option<StagingQueue>,
    buffers: HashMap<Uuid, SubsetBuffer>,
    queued_rows: HashMap<Uuid, i64>,
    pending_schema: Option<SchemaDocument>,
    _writer_lease: Lease,
}

impl IngestCoordinator {
    /// Open a coordinator for `alias` under the configured root, creating
    /// the dataset on first use. `crash_safe` routes rows through the
    /// durable staging queue.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the root cannot be initialized, the
    /// writer lease is refused, or policy checks fail.
    pub fn open(
        config: EngineConfig,
        alias: &str,
        crash_safe: bool,
    ) -> Result<Self, EngineError> {
        if config.require_encryption && config.encryption_mode == "none" {
            return Err(EngineError::Config {
                detail: "require_encryption is set but encryption_mode is none".to_string(),
            });
        }
        let mut catalog = Catalog::open_with_retry(
            &config.db_root,
            config.busy_retries,
            config.busy_backoff_ms,
        )?;

        let mut seed = SchemaDocument::default();
        seed.quantization.clone_from(&config.quantization);
        seed.jagged = config.jagged.clone();
        seed.encryption = EncryptionPolicy {
            mode: config.encryption_mode.clone(),
            rotation_days: config.key_rotation_days,
            ..EncryptionPolicy::default()
        };
        let dataset = catalog.ensure_dataset(alias, &StorageScheme::default(), &seed)?;

        if config.tamper_chain_enabled {
            // The producer identity doubles as the chain salt; it is stable
            // for the catalog's lifetime and never leaves the root.
            let salt = catalog.producer_id().to_string();
            catalog.enable_tamper_chain(&salt)?;
        }

        let writer_lease = if config.advisory_locking {
            acquire_dataset_shared(&config.lock_root())?
        } else {
            Lease::disabled()
        };

        let store = PartFileStore::new(&config.db_root, dataset.scheme.clone())?
            .with_tmp_sweep_seconds(config.tmp_sweep_seconds)
            .with_posix_perms(config.enforce_posix_perms);
        let staging = if crash_safe {
            Some(StagingQueue::open(config.db_root.join("staging.db"), true)?
                .with_retry(config.busy_retries, config.busy_backoff_ms))
        } else {
            None
        };
        let audit = AuditLog::new(&config.db_root, config.audit_log_enabled);
        info!(alias, dataset = %dataset.dataset_uuid, crash_safe, "opened ingest coordinator");
        Ok(Self {
            config,
            catalog,
            store,
            audit,
            dataset,
            staging,
            buffers: HashMap::new(),
            queued_rows: HashMap::new(),
            pending_schema: None,
            _writer_lease: writer_lease,
        })
    }

    /// The dataset record as of the last catalog interaction.
    #[must_use]
    pub fn dataset(&self) -> &DatasetRecord {
        &self.dataset
    }

    /// Read access to the catalog, for queries.
    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// The key normalizer for the locked key schema.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] before the first insert locks keys.
    pub fn normalizer(&self) -> Result<KeyNormalizer, EngineError> {
        if self.dataset.schema.key_schema.is_empty() {
            return Err(EngineError::Config {
                detail: "key schema not locked yet; ingest a row first".to_string(),
            });
        }
        Ok(KeyNormalizer::new(
            &self.dataset.schema.key_schema,
            &self.dataset.schema.key_order,
            &self.dataset.schema.quantization,
        )?)
    }

    /// Route a row to one of `n_writers` by subset identity, computed
    /// locally. Stable but not load-aware.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the keys fail validation.
    pub fn writer_index(
        &self,
        keys: &BTreeMap<String, KeyValue>,
        n_writers: usize,
    ) -> Result<usize, EngineError> {
        let normalizer = self.normalizer()?;
        let subset = normalizer.subset_uuid(keys)?;
        Ok(partition_for_subset(&subset, n_writers))
    }

    /// Accept a batch of rows for the subset identified by `keys`. Returns
    /// the subset UUID.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] on validation, schema, lease, store, or
    /// catalog failure. On failure the in-flight temporary (if any) is
    /// already removed and leases are released.
    pub fn add(
        &mut self,
        keys: &BTreeMap<String, KeyValue>,
        batch: RowBatch,
    ) -> Result<Uuid, EngineError> {
        let (normalizer, record) = self.catalog.ensure_key_columns(&self.dataset, keys)?;
        self.dataset = record;
        let subset = self.catalog.get_or_create_subset(&normalizer, keys)?;

        if self.staging.is_some() {
            // Validate against the canonical dtype before the row becomes
            // durable; a poison record must not reach the queue.
            let schema = self.pending_schema.as_ref().unwrap_or(&self.dataset.schema);
            let canonical = if schema.has_canonical_dtype() {
                Some(schema.canonical_dtype()?)
            } else {
                None
            };
            reconcile_dtype(canonical.as_ref(), &batch, &schema.jagged)?;

            let n_rows = batch.n_rows() as i64;
            let frame = StagedPayload {
                subset_keys: keys.clone(),
                batch,
                is_group: true,
            }
            .encode()?;
            let Some(staging) = self.staging.as_mut() else {
                unreachable!("checked above");
            };
            staging.enqueue(&subset, n_rows, &frame)?;
            *self.queued_rows.entry(subset).or_insert(0) += n_rows;

            let part_rows = self.part_rows() as i64;
            while self.queued_rows.get(&subset).copied().unwrap_or(0) >= part_rows {
                let published = self.compact_subset(&subset, false)?;
                if published == 0 {
                    break;
                }
                let counter = self.queued_rows.entry(subset).or_insert(0);
                *counter = (*counter - published).max(0);
            }
            return Ok(subset);
        }

        self.direct_add(subset, keys, &batch, false)?;
        Ok(subset)
    }

    /// Seal every buffered row, including remainders smaller than
    /// `part_rows`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`]; buffers that failed to seal stay buffered.
    pub fn flush(&mut self) -> Result<(), EngineError> {
        let subsets: Vec<Uuid> = self.buffers.keys().copied().collect();
        for subset in subsets {
            self.flush_subset(&subset, true)?;
        }
        Ok(())
    }

    /// Drain for shutdown: flush buffers and, in crash-safe mode, compact
    /// remaining staged rows for hot subsets (remainders allowed) until the
    /// queue is empty or the time bound elapses.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] on the first failed drain step.
    pub fn shutdown(&mut self, time_bound: Option<Duration>) -> Result<(), EngineError> {
        let started = Instant::now();
        let expired = |started: Instant| {
            time_bound.is_some_and(|bound| started.elapsed() >= bound)
        };
        if self.staging.is_some() {
            if let Some(staging) = self.staging.as_mut() {
                staging.reclaim_stale(self.config.stale_claim_seconds)?;
            }
            loop {
                let hot = match self.staging.as_ref() {
                    Some(staging) => staging.hot_subsets(1024)?,
                    None => Vec::new(),
                };
                if hot.is_empty() || expired(started) {
                    break;
                }
                for subset in hot {
                    while self.compact_subset(&subset, true)? > 0 {
                        if expired(started) {
                            break;
                        }
                    }
                    if expired(started) {
                        break;
                    }
                }
            }
            if let Some(staging) = self.staging.as_ref() {
                staging.checkpoint();
            }
        }
        self.flush()?;
        info!("ingest coordinator drained");
        Ok(())
    }

    fn part_rows(&self) -> u64 {
        self.dataset
            .schema
            .part_config
            .as_ref()
            .map_or(self.config.part_rows, |pc| pc.part_rows)
            .max(1)
    }

    fn compression(&self) -> Option<(String, Option<i64>)> {
        let pc = self.dataset.schema.part_config.as_ref()?;
        pc.compression
            .clone()
            .map(|codec| (codec, pc.compression_opts))
    }

    fn lock_part_config_if_needed(&mut self, padded: &PaddedBatch) -> Result<(), EngineError> {
        if self.dataset.schema.part_config.is_some() {
            return Ok(());
        }
        let bytes_per_row = (padded.payload_bytes() / padded.n_rows.max(1)).max(1);
        let rows_by_mb = (self.config.chunk_bytes() / bytes_per_row).max(1) as u64;
        let desired = PartConfig {
            part_rows: self.config.part_rows.min(rows_by_mb).max(1),
            compression: self.config.compression.clone(),
            compression_opts: self.config.compression_opts,
        };
        let locked = self
            .catalog
            .lock_part_config(&self.dataset.dataset_uuid, &desired)?;
        self.dataset.schema.part_config = Some(locked);
        Ok(())
    }

    fn direct_add(
        &mut self,
        subset: Uuid,
        keys: &BTreeMap<String, KeyValue>,
        batch: &RowBatch,
        force_flush: bool,
    ) -> Result<(), EngineError> {
        let schema = self
            .pending_schema
            .as_ref()
            .unwrap_or(&self.dataset.schema);
        let canonical = if schema.has_canonical_dtype() {
            Some(schema.canonical_dtype()?)
        } else {
            None
        };
        let jagged = schema.jagged.clone();
        let outcome = reconcile_dtype(canonical.as_ref(), batch, &jagged)?;
        let padded = pad_batch(batch, outcome.dtype(), &jagged)?;
        match &outcome {
            ReconcileOutcome::Lock(dtype) => {
                let mut updated = schema.clone();
                updated.set_canonical_dtype(dtype);
                self.catalog
                    .save_schema(&self.dataset.dataset_uuid, &updated)?;
                self.dataset.schema = updated;
                self.pending_schema = None;
                debug!(dataset = %self.dataset.dataset_uuid, "locked canonical dtype");
            }
            ReconcileOutcome::Widen(dtype) => {
                // Widening persists atomically with the first part of this
                // batch; until then it rides along as the pending schema.
                let mut updated = schema.clone();
                updated.set_canonical_dtype(dtype);
                self.pending_schema = Some(updated);
                for buf in self.buffers.values_mut() {
                    for chunk in &mut buf.chunks {
                        chunk.adopt_dtype(dtype)?;
                    }
                }
                debug!(dataset = %self.dataset.dataset_uuid, "text widening pending");
            }
            ReconcileOutcome::Keep(_) => {}
        }
        self.lock_part_config_if_needed(&padded)?;
        let part_rows = self.part_rows();
        let chunk_bytes = self.config.chunk_bytes();

        let entry = self.buffers.entry(subset).or_insert_with(|| SubsetBuffer {
            keys: keys.clone(),
            chunks: Vec::new(),
            rows: 0,
            bytes: 0,
        });
        entry.rows += padded.n_rows;
        entry.bytes += padded.payload_bytes();
        entry.chunks.push(padded);

        let should_flush =
            force_flush || entry.rows as u64 >= part_rows || entry.bytes >= chunk_bytes;
        if should_flush {
            self.flush_subset(&subset, force_flush)?;
        }
        Ok(())
    }

    fn flush_subset(&mut self, subset: &Uuid, flush_all: bool) -> Result<(), EngineError> {
        let Some(buffer) = self.buffers.remove(subset) else {
            return Ok(());
        };
        if buffer.rows == 0 {
            return Ok(());
        }
        let merged = PaddedBatch::concat(&buffer.chunks)?;
        let part_rows = self.part_rows() as usize;

        let mut slices = Vec::new();
        let mut start = 0usize;
        while merged.n_rows - start >= part_rows {
            slices.push(merged.slice_rows(start..start + part_rows));
            start += part_rows;
        }
        let remainder = (start < merged.n_rows).then(|| merged.slice_rows(start..merged.n_rows));
        let remainder = match (remainder, flush_all) {
            (Some(rest), true) => {
                slices.push(rest);
                None
            }
            (rest, false) => rest,
            (None, _) => None,
        };

        if slices.is_empty() {
            // Nothing sealable yet; keep the compacted buffer.
            if let Some(rest) = remainder {
                self.restore_buffer(*subset, buffer.keys, rest);
            }
            return Ok(());
        }

        let lease = if self.config.advisory_locking {
            acquire_subset(&self.config.lock_root(), subset)?
        } else {
            Lease::disabled()
        };

        let result = self.seal_and_record(subset, &buffer.keys, &slices);
        drop(lease);
        match result {
            Ok(()) => {
                if let Some(rest) = remainder {
                    self.restore_buffer(*subset, buffer.keys, rest);
                }
                Ok(())
            }
            Err(e) => {
                // Leases released, temporaries already swept by the store;
                // the rows stay buffered for a retry.
                self.buffers.insert(
                    *subset,
                    SubsetBuffer {
                        keys: buffer.keys,
                        rows: merged.n_rows,
                        bytes: merged.payload_bytes(),
                        chunks: vec![merged],
                    },
                );
                self.audit.record(
                    "seal_failed",
                    json!({"subset": subset.to_string(), "error": e.to_string()}),
                );
                Err(e)
            }
        }
    }

    fn seal_and_record(
        &mut self,
        subset: &Uuid,
        keys: &BTreeMap<String, KeyValue>,
        slices: &[PaddedBatch],
    ) -> Result<(), EngineError> {
        let subset_keys_json = keys_to_json(keys);
        let compression = self.compression();
        let compression_ref = compression
            .as_ref()
            .map(|(codec, level)| (codec.as_str(), *level));

        let mut offered: Vec<SealedPart> = Vec::with_capacity(slices.len());
        let mut written: Vec<bool> = Vec::with_capacity(slices.len());
        for slice in slices {
            let hash = content_hash(slice, DEFAULT_MAX_CHUNK_BYTES);
            if let Some((existing, relpath)) = self
                .catalog
                .find_live_part_by_content(subset, &hash)?
            {
                offered.push(SealedPart {
                    part_uuid: existing,
                    subset_uuid: *subset,
                    created_at_epoch: crate::fsutil::now_epoch_us(),
                    n_rows: slice.n_rows as i64,
                    scheme_version: self.store.scheme().version,
                    file_relpath: relpath,
                    content_hash: hash,
                    part_stats_json: None,
                    plaintext_size: None,
                });
                written.push(false);
                continue;
            }
            let published = self.store.publish(
                &self.dataset.dataset_uuid,
                subset,
                slice,
                &hash,
                &subset_keys_json,
                compression_ref,
            )?;
            offered.push(SealedPart {
                part_uuid: published.part_uuid,
                subset_uuid: *subset,
                created_at_epoch: published.created_at_epoch,
                n_rows: slice.n_rows as i64,
                scheme_version: self.store.scheme().version,
                file_relpath: published.relpath.to_string_lossy().into_owned(),
                content_hash: hash,
                part_stats_json: Some(part_stats(slice)),
                plaintext_size: Some(published.plaintext_size as i64),
            });
            written.push(true);
        }

        let schema_after = self
            .pending_schema
            .clone()
            .unwrap_or_else(|| self.dataset.schema.clone());
        let fingerprint = schema_after.fingerprint();
        let bid = Uuid::new_v4().to_string();
        let commit = self.catalog.record_batch(
            &self.dataset.dataset_uuid,
            &bid,
            &fingerprint,
            &offered,
            self.pending_schema.as_ref(),
        )?;
        if self.pending_schema.take().is_some() {
            self.dataset.schema = schema_after;
        }

        for ((outcome, part), was_written) in
            commit.outcomes.iter().zip(&offered).zip(&written)
        {
            match outcome {
                PublishOutcome::Inserted { part_uuid } => {
                    self.audit.record(
                        "publish",
                        json!({
                            "bid": bid,
                            "part": part_uuid.to_string(),
                            "subset": subset.to_string(),
                            "rows": part.n_rows,
                        }),
                    );
                }
                PublishOutcome::AlreadyPresent { part_uuid, .. } => {
                    if *was_written {
                        // Lost a duplicate race after the file landed; the
                        // catalog row wins, the new file goes.
                        let rel = std::path::Path::new(&part.file_relpath);
                        if let Err(e) = self.store.remove(subset, rel) {
                            warn!(error = %e, "failed to drop duplicate part file");
                        }
                    }
                    self.audit.record(
                        "dedup",
                        json!({
                            "bid": bid,
                            "part": part_uuid.to_string(),
                            "subset": subset.to_string(),
                        }),
                    );
                }
            }
        }
        Ok(())
    }

    fn restore_buffer(&mut self, subset: Uuid, keys: BTreeMap<String, KeyValue>, rest: PaddedBatch) {
        self.buffers.insert(
            subset,
            SubsetBuffer {
                keys,
                rows: rest.n_rows,
                bytes: rest.payload_bytes(),
                chunks: vec![rest],
            },
        );
    }

    /// Claim a staged prefix for `subset` and publish it. Returns rows
    /// published, 0 when nothing qualified.
    fn compact_subset(
        &mut self,
        subset: &Uuid,
        allow_remainder: bool,
    ) -> Result<i64, EngineError> {
        let part_rows = self.part_rows() as i64;
        let stale = self.config.stale_claim_seconds;
        let Some(staging) = self.staging.as_mut() else {
            return Err(EngineError::Config {
                detail: "compaction requires crash-safe mode".to_string(),
            });
        };
        staging.reclaim_stale(stale)?;
        let token = Uuid::new_v4().to_string();
        let claimed = staging.select_and_claim_prefix(subset, part_rows, &token)?;
        if claimed.is_empty() {
            return Ok(0);
        }
        let rows_claimed: i64 = claimed.iter().map(|r| r.n_rows).sum();
        if rows_claimed < part_rows && !allow_remainder {
            staging.unclaim(&token)?;
            return Ok(0);
        }

        let compacted: Result<(), EngineError> = (|| {
            let mut batches = Vec::with_capacity(claimed.len());
            let mut merged_keys = None;
            for record in &claimed {
                let payload = StagedPayload::decode(&record.payload)?;
                merged_keys = Some(payload.subset_keys);
                batches.push(payload.batch);
            }
            let keys = merged_keys.ok_or_else(|| EngineError::Config {
                detail: "claimed records carried no payload".to_string(),
            })?;
            let merged = RowBatch::concat(&batches)?;
            let (_, record) = self.catalog.ensure_key_columns(&self.dataset, &keys)?;
            self.dataset = record;
            self.direct_add(*subset, &keys, &merged, true)?;
            Ok(())
        })();

        match compacted {
            Ok(()) => {
                if let Some(staging) = self.staging.as_mut() {
                    staging.delete_claimed(&token)?;
                }
                Ok(rows_claimed)
            }
            Err(e) => {
                if let Some(staging) = self.staging.as_mut() {
                    let _ = staging.unclaim(&token);
                }
                Err(e)
            }
        }
    }
}

/// Per-part statistics document: row count plus min/max for scalar numeric
/// fields.
fn part_stats(batch: &PaddedBatch) -> String {
    let mut fields = serde_json::Map::new();
    for col in &batch.columns {
        if !col.spec.shape.is_empty() {
            continue;
        }
        let stat = match &col.values {
            CellValues::Int(v) if !v.is_empty() => {
                let min = v.iter().min().copied().unwrap_or_default();
                let max = v.iter().max().copied().unwrap_or_default();
                Some(json!({"min": min, "max": max}))
            }
            CellValues::Real(v) if !v.is_empty() => {
                let finite = v.iter().copied().filter(|x| x.is_finite());
                let min = finite.clone().fold(f64::INFINITY, f64::min);
                let max = finite.fold(f64::NEG_INFINITY, f64::max);
                (min <= max).then(|| json!({"min": min, "max": max}))
            }
            _ => None,
        };
        if let Some(stat) = stat {
            fields.insert(col.spec.name.clone(), stat);
        }
    }
    json!({"rows": batch.n_rows, "fields": fields}).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::batch::FieldBatch;
    use tessera_core::schema::JaggedFieldSpec;

    fn config_for(root: &std::path::Path) -> EngineConfig {
        let mut config = EngineConfig::new(root);
        config.part_rows = 4;
        config
            .quantization
            .insert("lat".to_string(), 1_000_000.0);
        config
    }

    fn lat_keys(lat: f64) -> BTreeMap<String, KeyValue> {
        BTreeMap::from([("lat".to_string(), KeyValue::Real(lat))])
    }

    fn value_rows(values: &[f64]) -> RowBatch {
        RowBatch::new(vec![(
            "v".to_string(),
            FieldBatch::from_f64(values.to_vec()),
        )])
        .expect("batch")
    }

    #[test]
    fn test_quantization_collapse_one_subset_one_part() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut ingest =
            IngestCoordinator::open(config_for(tmp.path()), "weather", false).expect("open");
        for lat in [37.774_929_6, 37.774_930_4, 37.774_929_8] {
            ingest.add(&lat_keys(lat), value_rows(&[lat])).expect("add");
        }
        ingest.flush().expect("flush");

        let normalizer = ingest.normalizer().expect("normalizer");
        let subset = normalizer
            .subset_uuid(&lat_keys(37.774_929_6))
            .expect("uuid");
        let row = ingest
            .catalog()
            .subset_row(&subset)
            .expect("row")
            .expect("subset exists");
        assert_eq!(row.total_rows, 3);
        let parts = ingest
            .catalog()
            .live_parts_for_subset(&subset)
            .expect("parts");
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].n_rows, 3);
        assert!(tmp.path().join(&parts[0].file_relpath).exists());
    }

    #[test]
    fn test_specials_route_to_four_subsets() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut ingest =
            IngestCoordinator::open(config_for(tmp.path()), "weather", false).expect("open");
        for lat in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 0.0] {
            ingest.add(&lat_keys(lat), value_rows(&[1.0])).expect("add");
        }
        ingest.flush().expect("flush");
        let subsets = ingest.catalog().all_subset_uuids().expect("subsets");
        assert_eq!(subsets.len(), 4);
    }

    #[test]
    fn test_dedup_two_batches_one_part() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut ingest =
            IngestCoordinator::open(config_for(tmp.path()), "weather", false).expect("open");
        let keys = lat_keys(1.0);
        let rows = value_rows(&[1.0, 2.0, 3.0]);

        ingest.add(&keys, rows.clone()).expect("add");
        ingest.flush().expect("flush");
        ingest.add(&keys, rows).expect("add again");
        ingest.flush().expect("flush again");

        let normalizer = ingest.normalizer().expect("normalizer");
        let subset = normalizer.subset_uuid(&keys).expect("uuid");
        let parts = ingest
            .catalog()
            .live_parts_for_subset(&subset)
            .expect("parts");
        assert_eq!(parts.len(), 1, "identical content publishes once");
        assert_eq!(ingest.catalog().batches().expect("batches").len(), 2);
        let row = ingest
            .catalog()
            .subset_row(&subset)
            .expect("row")
            .expect("subset");
        assert_eq!(row.total_rows, 3, "duplicate rows are not double-counted");
    }

    #[test]
    fn test_jagged_padding_end_to_end() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut config = config_for(tmp.path());
        config.jagged.fields.insert(
            "seq".to_string(),
            JaggedFieldSpec { vary_dims: vec![0] },
        );
        let mut ingest = IngestCoordinator::open(config, "traces", false).expect("open");
        let keys = lat_keys(2.0);
        let batch = RowBatch::new(vec![(
            "seq".to_string(),
            FieldBatch::from_i64_rows(vec![vec![1, 2], vec![1, 2, 3, 4], vec![]]),
        )])
        .expect("batch");
        ingest.add(&keys, batch).expect("add");
        ingest.flush().expect("flush");

        let dtype = ingest
            .dataset()
            .schema
            .canonical_dtype()
            .expect("locked dtype");
        assert_eq!(dtype.fields()[0].shape, vec![4], "canonical shape locks to max");

        let normalizer = ingest.normalizer().expect("normalizer");
        let subset = normalizer.subset_uuid(&keys).expect("uuid");
        let parts = ingest
            .catalog()
            .live_parts_for_subset(&subset)
            .expect("parts");
        assert_eq!(parts.len(), 1);

        // A later batch exceeding the canon is refused.
        let too_big = RowBatch::new(vec![(
            "seq".to_string(),
            FieldBatch::from_i64_rows(vec![vec![1, 2, 3, 4, 5]]),
        )])
        .expect("batch");
        let err = ingest.add(&keys, too_big).expect_err("overflow");
        assert!(matches!(
            err,
            EngineError::Schema(tessera_core::schema::SchemaError::ExceedsCanon { .. })
        ));
    }

    #[test]
    fn test_part_rows_splits_buffer() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut ingest =
            IngestCoordinator::open(config_for(tmp.path()), "weather", false).expect("open");
        let keys = lat_keys(3.0);
        ingest
            .add(&keys, value_rows(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]))
            .expect("add");
        // part_rows = 4: two full parts seal eagerly, one row stays buffered.
        let normalizer = ingest.normalizer().expect("normalizer");
        let subset = normalizer.subset_uuid(&keys).expect("uuid");
        assert_eq!(
            ingest
                .catalog()
                .live_parts_for_subset(&subset)
                .expect("parts")
                .len(),
            2
        );
        ingest.flush().expect("flush");
        let parts = ingest
            .catalog()
            .live_parts_for_subset(&subset)
            .expect("parts");
        assert_eq!(parts.len(), 3);
        assert_eq!(parts.iter().map(|p| p.n_rows).sum::<i64>(), 9);
    }

    #[test]
    fn test_crash_safe_route_matches_direct_route() {
        let tmp_direct = tempfile::tempdir().expect("tempdir");
        let tmp_staged = tempfile::tempdir().expect("tempdir");
        let keys = lat_keys(5.0);
        let rows = value_rows(&[1.0, 2.0, 3.0, 4.0, 5.0]);

        let mut direct = IngestCoordinator::open(config_for(tmp_direct.path()), "d", false)
            .expect("open direct");
        direct.add(&keys, rows.clone()).expect("add");
        direct.flush().expect("flush");

        let mut staged = IngestCoordinator::open(config_for(tmp_staged.path()), "d", true)
            .expect("open staged");
        staged.add(&keys, rows).expect("add");
        staged.shutdown(None).expect("shutdown");

        let subset = direct
            .normalizer()
            .expect("normalizer")
            .subset_uuid(&keys)
            .expect("uuid");
        let mut direct_hashes: Vec<String> = direct
            .catalog()
            .live_parts_for_subset(&subset)
            .expect("parts")
            .into_iter()
            .map(|p| p.content_hash)
            .collect();
        let mut staged_hashes: Vec<String> = staged
            .catalog()
            .live_parts_for_subset(&subset)
            .expect("parts")
            .into_iter()
            .map(|p| p.content_hash)
            .collect();
        direct_hashes.sort_unstable();
        staged_hashes.sort_unstable();
        assert_eq!(
            direct_hashes, staged_hashes,
            "direct seal and staging compaction must agree byte for byte"
        );
    }

    #[test]
    fn test_text_widening_bumps_fingerprint() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut ingest =
            IngestCoordinator::open(config_for(tmp.path()), "labels", false).expect("open");
        let keys = lat_keys(1.0);
        let short = RowBatch::new(vec![(
            "label".to_string(),
            FieldBatch::from_text(vec!["ab".to_string()]),
        )])
        .expect("batch");
        ingest.add(&keys, short).expect("add");
        ingest.flush().expect("flush");
        let fp1 = ingest.dataset().schema.fingerprint();

        let long = RowBatch::new(vec![(
            "label".to_string(),
            FieldBatch::from_text(vec!["abcdefgh".to_string()]),
        )])
        .expect("batch");
        ingest.add(&keys, long).expect("add");
        ingest.flush().expect("flush");
        let fp2 = ingest.dataset().schema.fingerprint();
        assert_ne!(fp1, fp2, "widening is a fingerprint-bumping rewrite event");

        let batches = ingest.catalog().batches().expect("batches");
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].schema_fingerprint, fp1);
        assert_eq!(batches[1].schema_fingerprint, fp2);
    }

    #[test]
    fn test_writer_routing_is_stable() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut ingest =
            IngestCoordinator::open(config_for(tmp.path()), "weather", false).expect("open");
        ingest.add(&lat_keys(1.0), value_rows(&[1.0])).expect("add");
        let a = ingest.writer_index(&lat_keys(1.0), 4).expect("route");
        let b = ingest.writer_index(&lat_keys(1.0), 4).expect("route");
        assert_eq!(a, b);
        assert!(a < 4);
    }
}
