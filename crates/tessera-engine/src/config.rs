//! Engine configuration.
//!
//! A single record governs a writer process. No environment variable affects
//! correctness; everything operational flows through this struct.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use tessera_core::schema::JaggedSpec;

/// Configuration for a dataset root and its writers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Dataset root directory.
    pub db_root: PathBuf,

    /// Target rows per sealed part.
    #[serde(default = "default_part_rows")]
    pub part_rows: u64,

    /// In-memory buffer bound per subset, in MiB; exceeding it triggers a
    /// seal (or a spill to staging in crash-safe mode).
    #[serde(default = "default_chunk_mb")]
    pub chunk_mb: f64,

    /// Optional part compression codec (`"gzip"`).
    #[serde(default)]
    pub compression: Option<String>,

    /// Optional codec level.
    #[serde(default)]
    pub compression_opts: Option<i64>,

    /// REAL key name to positive quantization scale.
    #[serde(default)]
    pub quantization: BTreeMap<String, f64>,

    /// Jagged field configuration.
    #[serde(default)]
    pub jagged: JaggedSpec,

    /// `"none"` today; the metadata seam for AEAD is fixed regardless.
    #[serde(default = "default_encryption_mode")]
    pub encryption_mode: String,

    /// Refuse to open a dataset whose policy is plaintext.
    #[serde(default)]
    pub require_encryption: bool,

    /// Restrict the root and its files to the owning user (0700/0600).
    #[serde(default)]
    pub enforce_posix_perms: bool,

    /// Take advisory file leases around seals and maintenance.
    #[serde(default = "default_true")]
    pub advisory_locking: bool,

    /// Chain batch records with `prev_hash`/`entry_hash`.
    #[serde(default)]
    pub tamper_chain_enabled: bool,

    /// Append engine events to `logs/audit.log`.
    #[serde(default)]
    pub audit_log_enabled: bool,

    /// Intended owning user for hardened deployments (recorded, applied by
    /// deployment tooling).
    #[serde(default)]
    pub data_owner_user: Option<String>,

    /// Intended owning group.
    #[serde(default)]
    pub data_owner_group: Option<String>,

    /// Alternate directory for lock files; point this at memory-backed
    /// storage so stale locks cannot survive a host crash.
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,

    /// Key rotation interval recorded in the encryption policy.
    #[serde(default = "default_rotation_days")]
    pub key_rotation_days: u32,

    /// Staging claims older than this are released for other writers.
    #[serde(default = "default_stale_claim_seconds")]
    pub stale_claim_seconds: u64,

    /// `*.tmp` files older than this are swept on the next publish into the
    /// same directory.
    #[serde(default = "default_tmp_sweep_seconds")]
    pub tmp_sweep_seconds: u64,

    /// Attempts for immediate transactions hitting a busy catalog.
    #[serde(default = "default_busy_retries")]
    pub busy_retries: u32,

    /// Base backoff between busy retries, milliseconds (doubled per attempt,
    /// with jitter).
    #[serde(default = "default_busy_backoff_ms")]
    pub busy_backoff_ms: u64,
}

const fn default_part_rows() -> u64 {
    100_000
}

const fn default_chunk_mb() -> f64 {
    8.0
}

fn default_encryption_mode() -> String {
    "none".to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_rotation_days() -> u32 {
    180
}

const fn default_stale_claim_seconds() -> u64 {
    300
}

const fn default_tmp_sweep_seconds() -> u64 {
    24 * 3600
}

const fn default_busy_retries() -> u32 {
    8
}

const fn default_busy_backoff_ms() -> u64 {
    30
}

impl EngineConfig {
    /// Configuration with defaults for a root directory.
    #[must_use]
    pub fn new(db_root: impl Into<PathBuf>) -> Self {
        Self {
            db_root: db_root.into(),
            part_rows: default_part_rows(),
            chunk_mb: default_chunk_mb(),
            compression: None,
            compression_opts: None,
            quantization: BTreeMap::new(),
            jagged: JaggedSpec::default(),
            encryption_mode: default_encryption_mode(),
            require_encryption: false,
            enforce_posix_perms: false,
            advisory_locking: true,
            tamper_chain_enabled: false,
            audit_log_enabled: false,
            data_owner_user: None,
            data_owner_group: None,
            lock_dir: None,
            key_rotation_days: default_rotation_days(),
            stale_claim_seconds: default_stale_claim_seconds(),
            tmp_sweep_seconds: default_tmp_sweep_seconds(),
            busy_retries: default_busy_retries(),
            busy_backoff_ms: default_busy_backoff_ms(),
        }
    }

    /// Buffer bound in bytes derived from `chunk_mb`.
    #[must_use]
    pub fn chunk_bytes(&self) -> usize {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let bytes = (self.chunk_mb * 1024.0 * 1024.0) as usize;
        bytes.max(1)
    }

    /// Directory holding lock files for this root.
    #[must_use]
    pub fn lock_root(&self) -> PathBuf {
        self.lock_dir
            .clone()
            .unwrap_or_else(|| self.db_root.join("locks"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::new("/tmp/ds");
        assert_eq!(config.part_rows, 100_000);
        assert!((config.chunk_mb - 8.0).abs() < f64::EPSILON);
        assert_eq!(config.encryption_mode, "none");
        assert!(config.advisory_locking);
        assert_eq!(config.stale_claim_seconds, 300);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"db_root":"/data/ds1","part_rows":500}"#).expect("parse");
        assert_eq!(config.part_rows, 500);
        assert_eq!(config.busy_retries, 8);
        assert_eq!(config.lock_root(), PathBuf::from("/data/ds1/locks"));
    }

    #[test]
    fn test_lock_dir_override() {
        let mut config = EngineConfig::new("/data/ds1");
        config.lock_dir = Some(PathBuf::from("/dev/shm/tessera"));
        assert_eq!(config.lock_root(), PathBuf::from("/dev/shm/tessera"));
    }
}
