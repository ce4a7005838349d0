//! Immutable part files: layout scheme, embedded attributes, and atomic
//! publication.
//!
//! The store performs no catalog writes. It seals a padded batch into a
//! single immutable file and returns enough for the catalog transaction to
//! commit or abort: `tmp → flush → fsync → rename → fsync(dir)`, with the
//! temporary removed on any failure and stale temporaries swept on the next
//! publish into the same directory.
//!
//! The columnar container itself sits behind [`PartBackend`]. The built-in
//! [`FlatPartBackend`] writes a self-describing single file — magic and
//! version, a JSON attribute header, then raw little-endian column and meta
//! payloads (optionally gzip) — whose read path reproduces the content hash
//! bit for bit. Parts are plaintext today (`enc_version = 0`); the AAD for a
//! later AEAD wrap is committed at seal time by [`build_aad`].

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use tessera_core::batch::CellValues;
use tessera_core::digest::blake2b_128_hex;
use tessera_core::jagged::{MetaColumn, PaddedBatch, PaddedColumn};
use tessera_core::schema::{BaseType, Dtype, JaggedSpec, MetaWidth};

use crate::fsutil::{fsync_dir, join_inside, makedirs_with_fsync, prune_empty_dirs, sweep_stale_tmps};

const CONTAINER_MAGIC: &[u8; 5] = b"TSPF\x01";

/// Errors from the part file store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Filesystem failure during write, sync, rename, or read.
    #[error("part store I/O error: {context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// Underlying error.
        source: io::Error,
    },

    /// The file is not a readable part container.
    #[error("bad part container {path}: {detail}")]
    BadContainer {
        /// Offending file.
        path: PathBuf,
        /// What failed to parse.
        detail: String,
    },

    /// The storage scheme is invalid.
    #[error("unsupported storage scheme: {detail}")]
    UnsupportedScheme {
        /// Description of the violation.
        detail: String,
    },
}

impl StoreError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Part-file fan-out scheme, persisted as JSON in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageScheme {
    /// Layout version, embedded in every path (`parts/v<version>/`).
    pub version: u32,
    /// Digest used for fan-out segments.
    pub hash: String,
    /// Fan-out depth, 0 to 8. Zero stores parts flat per subset.
    pub depth: u8,
    /// Hex characters per fan-out segment, 1 to 4.
    pub seglen: u8,
}

impl Default for StorageScheme {
    fn default() -> Self {
        Self {
            version: 1,
            hash: "sha256".to_string(),
            depth: 0,
            seglen: 2,
        }
    }
}

impl StorageScheme {
    /// Validate the scheme bounds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnsupportedScheme`] on violation.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.hash != "sha256" {
            return Err(StoreError::UnsupportedScheme {
                detail: format!("unsupported fan-out hash {:?}", self.hash),
            });
        }
        if self.depth > 8 {
            return Err(StoreError::UnsupportedScheme {
                detail: format!("depth {} out of range 0..=8", self.depth),
            });
        }
        if self.depth > 0 && !(1..=4).contains(&self.seglen) {
            return Err(StoreError::UnsupportedScheme {
                detail: format!("seglen {} out of range 1..=4", self.seglen),
            });
        }
        if usize::from(self.depth) * usize::from(self.seglen) > 64 {
            return Err(StoreError::UnsupportedScheme {
                detail: "depth*seglen exceeds available hash hex length".to_string(),
            });
        }
        Ok(())
    }

    /// Relative path of a part file under the dataset root.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnsupportedScheme`] when the scheme is invalid.
    pub fn part_relpath(
        &self,
        subset_uuid: &Uuid,
        part_uuid: &Uuid,
        extension: &str,
    ) -> Result<PathBuf, StoreError> {
        self.validate()?;
        let mut path = PathBuf::from("subsets")
            .join(subset_uuid.to_string())
            .join("parts")
            .join(format!("v{}", self.version));
        if self.depth > 0 {
            let mut hasher = Sha256::new();
            hasher.update(subset_uuid.to_string().as_bytes());
            hasher.update(part_uuid.to_string().as_bytes());
            let hexs = hex::encode(hasher.finalize());
            let seglen = usize::from(self.seglen);
            for i in 0..usize::from(self.depth) {
                path = path.join(&hexs[i * seglen..(i + 1) * seglen]);
            }
        }
        Ok(path.join(format!("{part_uuid}.{extension}")))
    }
}

/// Attributes embedded in every part file, readable without the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartAttributes {
    /// Part identity.
    pub part_uuid: Uuid,
    /// Owning subset.
    pub subset_uuid: Uuid,
    /// Owning dataset.
    pub dataset_uuid: Uuid,
    /// Seal time, microseconds since the Unix epoch.
    pub created_at_epoch: i64,
    /// Row count.
    pub n_rows: u64,
    /// Storage scheme version the path was derived under.
    pub scheme_version: u32,
    /// Content hash of the payload.
    pub content_hash: String,
    /// The subset's raw key values, as JSON.
    pub subset_keys_json: String,
}

/// Additional-authenticated-data assembly for the future AEAD wrap. All
/// inputs are committed at seal, so enabling encryption later requires no
/// schema change.
#[must_use]
pub fn build_aad(
    dataset_uuid: &Uuid,
    subset_uuid: &Uuid,
    part_uuid: &Uuid,
    schema_fingerprint: &str,
    scheme_version: u32,
    quantization: &BTreeMap<String, f64>,
    content_hash: &str,
) -> Vec<u8> {
    let quant_json = serde_json::to_string(quantization).unwrap_or_default();
    let mut aad = Vec::with_capacity(160);
    aad.extend_from_slice(dataset_uuid.to_string().as_bytes());
    aad.extend_from_slice(subset_uuid.to_string().as_bytes());
    aad.extend_from_slice(part_uuid.to_string().as_bytes());
    aad.extend_from_slice(schema_fingerprint.as_bytes());
    aad.extend_from_slice(scheme_version.to_string().as_bytes());
    aad.extend_from_slice(blake2b_128_hex(quant_json.as_bytes()).as_bytes());
    aad.extend_from_slice(content_hash.as_bytes());
    aad
}

/// A pluggable columnar container with fsync control.
pub trait PartBackend: Send + Sync + std::fmt::Debug {
    /// File suffix for sealed parts.
    fn extension(&self) -> &'static str {
        "h5"
    }

    /// Write attributes and payload to `path`, flushed and fsynced before
    /// returning.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on any write or sync failure.
    fn write(
        &self,
        path: &Path,
        attrs: &PartAttributes,
        batch: &PaddedBatch,
        compression: Option<(&str, Option<i64>)>,
    ) -> Result<(), StoreError>;

    /// Read a sealed part back into attributes and a padded batch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on unreadable or malformed containers.
    fn read(&self, path: &Path) -> Result<(PartAttributes, PaddedBatch), StoreError>;

    /// Read only the embedded attributes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on unreadable or malformed containers.
    fn read_attributes(&self, path: &Path) -> Result<PartAttributes, StoreError>;
}

#[derive(Serialize, Deserialize)]
struct ContainerHeader {
    attrs: PartAttributes,
    dtype_descr: String,
    jagged: JaggedSpec,
    meta: Vec<MetaDescriptor>,
    #[serde(default)]
    compression: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct MetaDescriptor {
    name: String,
    field: String,
    width: MetaWidth,
    per_row: usize,
}

/// The built-in single-file columnar container.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlatPartBackend;

impl FlatPartBackend {
    fn encode_payload(batch: &PaddedBatch) -> Vec<u8> {
        let mut out = Vec::with_capacity(batch.payload_bytes());
        for col in &batch.columns {
            match &col.values {
                CellValues::Int(v) => {
                    for x in v {
                        out.extend_from_slice(&x.to_le_bytes());
                    }
                }
                CellValues::Real(v) => {
                    for x in v {
                        out.extend_from_slice(&x.to_le_bytes());
                    }
                }
                CellValues::Bool(v) => out.extend(v.iter().map(|&b| u8::from(b))),
                CellValues::Text(v) => {
                    for s in v {
                        #[allow(clippy::cast_possible_truncation)]
                        out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                        out.extend_from_slice(s.as_bytes());
                    }
                }
            }
        }
        for meta in &batch.meta {
            for &v in &meta.values {
                match meta.width {
                    #[allow(clippy::cast_possible_truncation)]
                    MetaWidth::U16 => out.extend_from_slice(&(v as u16).to_le_bytes()),
                    MetaWidth::U32 => out.extend_from_slice(&v.to_le_bytes()),
                    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                    MetaWidth::I16 => out.extend_from_slice(&(v as i16).to_le_bytes()),
                    #[allow(clippy::cast_possible_wrap)]
                    MetaWidth::I32 => out.extend_from_slice(&(v as i32).to_le_bytes()),
                }
            }
        }
        out
    }

    fn decode_payload(
        bytes: &[u8],
        dtype: &Dtype,
        jagged: &JaggedSpec,
        meta_descr: &[MetaDescriptor],
        n_rows: usize,
        path: &Path,
    ) -> Result<PaddedBatch, StoreError> {
        fn take<'a>(
            bytes: &'a [u8],
            cursor: &mut usize,
            n: usize,
            path: &Path,
        ) -> Result<&'a [u8], StoreError> {
            let end = cursor
                .checked_add(n)
                .filter(|&end| end <= bytes.len())
                .ok_or_else(|| StoreError::BadContainer {
                    path: path.to_path_buf(),
                    detail: "truncated payload".to_string(),
                })?;
            let slice = &bytes[*cursor..end];
            *cursor = end;
            Ok(slice)
        }
        let bad = |detail: &str| StoreError::BadContainer {
            path: path.to_path_buf(),
            detail: detail.to_string(),
        };
        let mut cursor = 0usize;

        let mut columns = Vec::with_capacity(dtype.fields().len());
        for spec in dtype.fields() {
            let elems = n_rows * spec.elems_per_row();
            let values = match spec.base {
                BaseType::Int64 => {
                    let raw = take(bytes, &mut cursor, elems * 8, path)?;
                    CellValues::Int(
                        raw.chunks_exact(8)
                            .map(|c| i64::from_le_bytes(c.try_into().expect("chunk of 8")))
                            .collect(),
                    )
                }
                BaseType::Float64 => {
                    let raw = take(bytes, &mut cursor, elems * 8, path)?;
                    CellValues::Real(
                        raw.chunks_exact(8)
                            .map(|c| f64::from_le_bytes(c.try_into().expect("chunk of 8")))
                            .collect(),
                    )
                }
                BaseType::Bool => {
                    let raw = take(bytes, &mut cursor, elems, path)?;
                    CellValues::Bool(raw.iter().map(|&b| b != 0).collect())
                }
                BaseType::Text { .. } => {
                    let mut items = Vec::with_capacity(elems);
                    for _ in 0..elems {
                        let len_bytes = take(bytes, &mut cursor, 4, path)?;
                        let len =
                            u32::from_le_bytes(len_bytes.try_into().expect("chunk of 4")) as usize;
                        let raw = take(bytes, &mut cursor, len, path)?;
                        let s = std::str::from_utf8(raw)
                            .map_err(|_| bad("text element is not UTF-8"))?;
                        items.push(s.to_string());
                    }
                    CellValues::Text(items)
                }
            };
            columns.push(PaddedColumn {
                spec: spec.clone(),
                values,
            });
        }

        let mut meta = Vec::with_capacity(meta_descr.len());
        for d in meta_descr {
            let count = n_rows * d.per_row;
            let values = match d.width {
                MetaWidth::U16 => take(bytes, &mut cursor, count * 2, path)?
                    .chunks_exact(2)
                    .map(|c| u32::from(u16::from_le_bytes(c.try_into().expect("chunk of 2"))))
                    .collect(),
                MetaWidth::U32 => take(bytes, &mut cursor, count * 4, path)?
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes(c.try_into().expect("chunk of 4")))
                    .collect(),
                #[allow(clippy::cast_sign_loss)]
                MetaWidth::I16 => take(bytes, &mut cursor, count * 2, path)?
                    .chunks_exact(2)
                    .map(|c| i16::from_le_bytes(c.try_into().expect("chunk of 2")) as u32)
                    .collect(),
                #[allow(clippy::cast_sign_loss)]
                MetaWidth::I32 => take(bytes, &mut cursor, count * 4, path)?
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes(c.try_into().expect("chunk of 4")) as u32)
                    .collect(),
            };
            meta.push(MetaColumn {
                name: d.name.clone(),
                field: d.field.clone(),
                width: d.width,
                per_row: d.per_row,
                values,
            });
        }
        if cursor != bytes.len() {
            return Err(bad("trailing bytes after payload"));
        }

        Ok(PaddedBatch {
            dtype: dtype.clone(),
            jagged: jagged.clone(),
            n_rows,
            columns,
            meta,
        })
    }

    fn read_header(path: &Path) -> Result<(ContainerHeader, File), StoreError> {
        let mut file =
            File::open(path).map_err(|e| StoreError::io(format!("opening {}", path.display()), e))?;
        let mut magic = [0u8; 5];
        file.read_exact(&mut magic)
            .map_err(|e| StoreError::io("reading container magic", e))?;
        if &magic != CONTAINER_MAGIC {
            return Err(StoreError::BadContainer {
                path: path.to_path_buf(),
                detail: "bad magic".to_string(),
            });
        }
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)
            .map_err(|e| StoreError::io("reading header length", e))?;
        let header_len = u32::from_le_bytes(len_bytes) as usize;
        let mut header_raw = vec![0u8; header_len];
        file.read_exact(&mut header_raw)
            .map_err(|e| StoreError::io("reading container header", e))?;
        let header: ContainerHeader =
            serde_json::from_slice(&header_raw).map_err(|e| StoreError::BadContainer {
                path: path.to_path_buf(),
                detail: format!("header parse: {e}"),
            })?;
        Ok((header, file))
    }
}

impl PartBackend for FlatPartBackend {
    fn write(
        &self,
        path: &Path,
        attrs: &PartAttributes,
        batch: &PaddedBatch,
        compression: Option<(&str, Option<i64>)>,
    ) -> Result<(), StoreError> {
        let header = ContainerHeader {
            attrs: attrs.clone(),
            dtype_descr: batch.dtype.to_canonical_json(),
            jagged: batch.jagged.clone(),
            meta: batch
                .meta
                .iter()
                .map(|m| MetaDescriptor {
                    name: m.name.clone(),
                    field: m.field.clone(),
                    width: m.width,
                    per_row: m.per_row,
                })
                .collect(),
            compression: compression.map(|(codec, _)| codec.to_string()),
        };
        if let Some((codec, _)) = compression {
            if codec != "gzip" {
                return Err(StoreError::UnsupportedScheme {
                    detail: format!("unsupported compression codec {codec:?}"),
                });
            }
        }
        let header_json = serde_json::to_vec(&header).map_err(|e| {
            StoreError::io("encoding container header", io::Error::other(e))
        })?;
        let payload = Self::encode_payload(batch);
        let payload = match compression {
            Some((_, level)) => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let level =
                    flate2::Compression::new(level.unwrap_or(6).clamp(0, 9) as u32);
                let mut enc = GzEncoder::new(Vec::new(), level);
                enc.write_all(&payload)
                    .map_err(|e| StoreError::io("compressing payload", e))?;
                enc.finish()
                    .map_err(|e| StoreError::io("compressing payload", e))?
            }
            None => payload,
        };

        #[allow(clippy::cast_possible_truncation)]
        let header_len = (header_json.len() as u32).to_le_bytes();
        let mut file = File::create(path)
            .map_err(|e| StoreError::io(format!("creating {}", path.display()), e))?;
        file.write_all(CONTAINER_MAGIC)
            .and_then(|()| file.write_all(&header_len))
            .and_then(|()| file.write_all(&header_json))
            .and_then(|()| file.write_all(&payload))
            .and_then(|()| file.flush())
            .map_err(|e| StoreError::io("writing part container", e))?;
        // Backend-level sync: the container owns its descriptor, so this is
        // the VFD sync the publish contract asks for.
        file.sync_all()
            .map_err(|e| StoreError::io("syncing part container", e))?;
        Ok(())
    }

    fn read(&self, path: &Path) -> Result<(PartAttributes, PaddedBatch), StoreError> {
        let (header, mut file) = Self::read_header(path)?;
        let mut payload = Vec::new();
        file.read_to_end(&mut payload)
            .map_err(|e| StoreError::io("reading part payload", e))?;
        let payload = match header.compression.as_deref() {
            Some("gzip") => {
                let mut out = Vec::new();
                GzDecoder::new(payload.as_slice())
                    .read_to_end(&mut out)
                    .map_err(|e| StoreError::io("decompressing payload", e))?;
                out
            }
            Some(other) => {
                return Err(StoreError::BadContainer {
                    path: path.to_path_buf(),
                    detail: format!("unsupported compression codec {other:?}"),
                })
            }
            None => payload,
        };
        let dtype = Dtype::from_canonical_json(&header.dtype_descr).map_err(|e| {
            StoreError::BadContainer {
                path: path.to_path_buf(),
                detail: format!("dtype parse: {e}"),
            }
        })?;
        let n_rows = usize::try_from(header.attrs.n_rows).unwrap_or(usize::MAX);
        let batch = Self::decode_payload(
            &payload,
            &dtype,
            &header.jagged,
            &header.meta,
            n_rows,
            path,
        )?;
        Ok((header.attrs, batch))
    }

    fn read_attributes(&self, path: &Path) -> Result<PartAttributes, StoreError> {
        Ok(Self::read_header(path)?.0.attrs)
    }
}

/// A sealed, renamed, durable part file.
#[derive(Debug, Clone)]
pub struct PublishedPart {
    /// Part identity.
    pub part_uuid: Uuid,
    /// Path relative to the dataset root.
    pub relpath: PathBuf,
    /// Seal time, microseconds since the Unix epoch.
    pub created_at_epoch: i64,
    /// Uncompressed payload size in bytes.
    pub plaintext_size: u64,
}

/// Writes immutable part files under a dataset root.
#[derive(Debug)]
pub struct PartFileStore {
    root: PathBuf,
    scheme: StorageScheme,
    backend: Arc<dyn PartBackend>,
    tmp_sweep_seconds: u64,
    enforce_posix_perms: bool,
}

impl PartFileStore {
    /// Store over `root` with the built-in container backend.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnsupportedScheme`] when the scheme is invalid.
    pub fn new(root: impl Into<PathBuf>, scheme: StorageScheme) -> Result<Self, StoreError> {
        Self::with_backend(root, scheme, Arc::new(FlatPartBackend))
    }

    /// Store over `root` with a caller-supplied container backend.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnsupportedScheme`] when the scheme is invalid.
    pub fn with_backend(
        root: impl Into<PathBuf>,
        scheme: StorageScheme,
        backend: Arc<dyn PartBackend>,
    ) -> Result<Self, StoreError> {
        scheme.validate()?;
        Ok(Self {
            root: root.into(),
            scheme,
            backend,
            tmp_sweep_seconds: 24 * 3600,
            enforce_posix_perms: false,
        })
    }

    /// Override the stale-temporary sweep horizon.
    #[must_use]
    pub const fn with_tmp_sweep_seconds(mut self, seconds: u64) -> Self {
        self.tmp_sweep_seconds = seconds;
        self
    }

    /// Restrict written files and directories to the owning user.
    #[must_use]
    pub const fn with_posix_perms(mut self, enforce: bool) -> Self {
        self.enforce_posix_perms = enforce;
        self
    }

    /// The storage scheme in force.
    #[must_use]
    pub const fn scheme(&self) -> &StorageScheme {
        &self.scheme
    }

    /// Dataset root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Seal a padded batch into a new immutable part file.
    ///
    /// The write is atomic: the payload lands in `<final>.tmp`, is flushed
    /// and fsynced, renamed over the final name, and the directory is
    /// fsynced. On any failure after temporary creation the temporary is
    /// removed before the error surfaces.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on scheme or I/O failure.
    pub fn publish(
        &self,
        dataset_uuid: &Uuid,
        subset_uuid: &Uuid,
        batch: &PaddedBatch,
        content_hash: &str,
        subset_keys_json: &str,
        compression: Option<(&str, Option<i64>)>,
    ) -> Result<PublishedPart, StoreError> {
        let part_uuid = Uuid::new_v4();
        let relpath = self
            .scheme
            .part_relpath(subset_uuid, &part_uuid, self.backend.extension())?;
        let abs_dst = self.root.join(&relpath);
        let abs_tmp = abs_dst.with_extension(format!("{}.tmp", self.backend.extension()));
        let dir = abs_dst
            .parent()
            .ok_or_else(|| StoreError::UnsupportedScheme {
                detail: "part path has no parent directory".to_string(),
            })?;
        makedirs_with_fsync(dir).map_err(|e| StoreError::io("creating part directory", e))?;
        if self.enforce_posix_perms {
            crate::fsutil::apply_owner_only_perms(dir);
        }
        sweep_stale_tmps(dir, self.tmp_sweep_seconds);

        let created_at_epoch = crate::fsutil::now_epoch_us();
        let attrs = PartAttributes {
            part_uuid,
            subset_uuid: *subset_uuid,
            dataset_uuid: *dataset_uuid,
            created_at_epoch,
            n_rows: batch.n_rows as u64,
            scheme_version: self.scheme.version,
            content_hash: content_hash.to_string(),
            subset_keys_json: subset_keys_json.to_string(),
        };

        let sealed = self
            .backend
            .write(&abs_tmp, &attrs, batch, compression)
            .and_then(|()| {
                fs::rename(&abs_tmp, &abs_dst)
                    .map_err(|e| StoreError::io("renaming part into place", e))
            })
            .and_then(|()| {
                fsync_dir(dir).map_err(|e| StoreError::io("syncing part directory", e))
            });
        if let Err(e) = sealed {
            let _ = fs::remove_file(&abs_tmp);
            let _ = fsync_dir(dir);
            return Err(e);
        }
        if self.enforce_posix_perms {
            crate::fsutil::apply_owner_only_perms(&abs_dst);
        }
        debug!(part = %part_uuid, subset = %subset_uuid, rows = batch.n_rows, "sealed part");
        Ok(PublishedPart {
            part_uuid,
            relpath,
            created_at_epoch,
            plaintext_size: batch.payload_bytes() as u64,
        })
    }

    /// Read a sealed part back.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on unreadable or escaped paths.
    pub fn read(&self, relpath: &Path) -> Result<(PartAttributes, PaddedBatch), StoreError> {
        let abs = join_inside(&self.root, relpath)
            .map_err(|e| StoreError::io("resolving part path", e))?;
        self.backend.read(&abs)
    }

    /// Read only a sealed part's embedded attributes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on unreadable or escaped paths.
    pub fn read_attributes(&self, relpath: &Path) -> Result<PartAttributes, StoreError> {
        let abs = join_inside(&self.root, relpath)
            .map_err(|e| StoreError::io("resolving part path", e))?;
        self.backend.read_attributes(&abs)
    }

    /// Unlink a part file and prune emptied fan-out directories up to its
    /// subset directory. Returns whether a file was removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on unsafe paths or failed removal.
    pub fn remove(&self, subset_uuid: &Uuid, relpath: &Path) -> Result<bool, StoreError> {
        let removed = crate::fsutil::safe_unlink_inside(&self.root, relpath)
            .map_err(|e| StoreError::io("removing part file", e))?;
        if removed {
            let abs = self.root.join(relpath);
            let subset_dir = self.root.join("subsets").join(subset_uuid.to_string());
            if let Some(parent) = abs.parent() {
                prune_empty_dirs(parent, &subset_dir);
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::batch::{FieldBatch, RowBatch};
    use tessera_core::hash::{content_hash, DEFAULT_MAX_CHUNK_BYTES};
    use tessera_core::jagged::{infer_dtype, pad_batch};
    use tessera_core::schema::{JaggedFieldSpec, JaggedSpec};

    fn sample_batch() -> PaddedBatch {
        let mut jagged = JaggedSpec::default();
        jagged
            .fields
            .insert("seq".to_string(), JaggedFieldSpec { vary_dims: vec![0] });
        let batch = RowBatch::new(vec![
            (
                "seq".to_string(),
                FieldBatch::from_i64_rows(vec![vec![1, 2], vec![3], vec![]]),
            ),
            (
                "label".to_string(),
                FieldBatch::from_text(vec!["a".into(), "bb".into(), "ccc".into()]),
            ),
            (
                "ok".to_string(),
                FieldBatch::from_bool(vec![true, false, true]),
            ),
        ])
        .expect("batch");
        let dtype = infer_dtype(&batch, &jagged).expect("infer");
        pad_batch(&batch, &dtype, &jagged).expect("pad")
    }

    fn store_at(root: &Path) -> PartFileStore {
        PartFileStore::new(root, StorageScheme::default()).expect("store")
    }

    #[test]
    fn test_relpath_flat_and_nested() {
        let subset = Uuid::new_v4();
        let part = Uuid::new_v4();
        let flat = StorageScheme::default()
            .part_relpath(&subset, &part, "h5")
            .expect("flat");
        assert_eq!(
            flat,
            PathBuf::from(format!("subsets/{subset}/parts/v1/{part}.h5"))
        );
        let nested = StorageScheme {
            depth: 2,
            ..StorageScheme::default()
        }
        .part_relpath(&subset, &part, "h5")
        .expect("nested");
        let segments: Vec<_> = nested.components().collect();
        assert_eq!(segments.len(), 7, "two fan-out segments expected");
    }

    #[test]
    fn test_scheme_bounds() {
        assert!(StorageScheme {
            hash: "md5".into(),
            ..StorageScheme::default()
        }
        .validate()
        .is_err());
        assert!(StorageScheme {
            depth: 9,
            ..StorageScheme::default()
        }
        .validate()
        .is_err());
        assert!(StorageScheme {
            depth: 2,
            seglen: 0,
            ..StorageScheme::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_publish_read_round_trip_preserves_hash() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store_at(tmp.path());
        let batch = sample_batch();
        let hash = content_hash(&batch, DEFAULT_MAX_CHUNK_BYTES);
        let dataset = Uuid::new_v4();
        let subset = Uuid::new_v4();
        let published = store
            .publish(&dataset, &subset, &batch, &hash, "{}", None)
            .expect("publish");

        let (attrs, read_back) = store.read(&published.relpath).expect("read");
        assert_eq!(attrs.part_uuid, published.part_uuid);
        assert_eq!(attrs.content_hash, hash);
        assert_eq!(attrs.n_rows, 3);
        assert_eq!(read_back, batch);
        assert_eq!(content_hash(&read_back, DEFAULT_MAX_CHUNK_BYTES), hash);

        let dir = tmp.path().join(published.relpath.parent().expect("dir"));
        let leftovers: Vec<_> = fs::read_dir(dir)
            .expect("dir")
            .flatten()
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("tmp"))
            .collect();
        assert!(leftovers.is_empty(), "no .tmp may survive a publish");
    }

    #[test]
    fn test_gzip_round_trip() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store_at(tmp.path());
        let batch = sample_batch();
        let hash = content_hash(&batch, DEFAULT_MAX_CHUNK_BYTES);
        let published = store
            .publish(
                &Uuid::new_v4(),
                &Uuid::new_v4(),
                &batch,
                &hash,
                "{}",
                Some(("gzip", Some(4))),
            )
            .expect("publish");
        let (_, read_back) = store.read(&published.relpath).expect("read");
        assert_eq!(content_hash(&read_back, DEFAULT_MAX_CHUNK_BYTES), hash);
    }

    #[test]
    fn test_attributes_readable_without_payload_decode() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = store_at(tmp.path());
        let batch = sample_batch();
        let published = store
            .publish(&Uuid::new_v4(), &Uuid::new_v4(), &batch, "deadbeef", "{\"k\":1}", None)
            .expect("publish");
        let attrs = store.read_attributes(&published.relpath).expect("attrs");
        assert_eq!(attrs.content_hash, "deadbeef");
        assert_eq!(attrs.subset_keys_json, "{\"k\":1}");
    }

    #[test]
    fn test_remove_prunes_empty_dirs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = PartFileStore::new(
            tmp.path(),
            StorageScheme {
                depth: 2,
                ..StorageScheme::default()
            },
        )
        .expect("store");
        let subset = Uuid::new_v4();
        let batch = sample_batch();
        let published = store
            .publish(&Uuid::new_v4(), &subset, &batch, "h", "{}", None)
            .expect("publish");
        assert!(store.remove(&subset, &published.relpath).expect("remove"));
        let subset_dir = tmp.path().join("subsets").join(subset.to_string());
        assert!(subset_dir.exists(), "subset directory survives");
        assert!(
            !subset_dir.join("parts").exists(),
            "fan-out directories pruned"
        );
    }

    #[test]
    fn test_bad_magic_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("junk.h5");
        fs::write(&path, b"NOTAPART").expect("write");
        let err = FlatPartBackend.read(&path).expect_err("bad magic");
        assert!(matches!(err, StoreError::BadContainer { .. }));
    }

    #[test]
    fn test_aad_binds_all_inputs() {
        let d = Uuid::new_v4();
        let s = Uuid::new_v4();
        let p = Uuid::new_v4();
        let quant = BTreeMap::from([("lat".to_string(), 1000.0)]);
        let base = build_aad(&d, &s, &p, "fp", 1, &quant, "hash");
        assert_ne!(base, build_aad(&d, &s, &p, "fp2", 1, &quant, "hash"));
        assert_ne!(base, build_aad(&d, &s, &p, "fp", 2, &quant, "hash"));
        assert_ne!(base, build_aad(&d, &s, &p, "fp", 1, &BTreeMap::new(), "hash"));
        assert_ne!(base, build_aad(&d, &s, &p, "fp", 1, &quant, "hash2"));
    }
}
