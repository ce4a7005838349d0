//! Append-only audit log with redaction.
//!
//! When enabled, engine events (seal, publish, dedup, merge, GC, fsck,
//! errors) append one JSON line each to `logs/audit.log`. Records carry
//! identifiers and counters only; raw key bytes, nonces, and tags are
//! redacted before anything reaches the file.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

/// Field names whose values never reach the audit log.
const SENSITIVE_FIELDS: [&str; 5] = ["nonce", "tag", "key", "key_bytes", "subset_keys"];

/// Replace sensitive fields with `"<redacted>"`, recursively.
#[must_use]
pub fn redact(mut value: Value) -> Value {
    fn walk(value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (name, v) in map.iter_mut() {
                    if SENSITIVE_FIELDS.contains(&name.as_str()) {
                        *v = Value::String("<redacted>".to_string());
                    } else {
                        walk(v);
                    }
                }
            }
            Value::Array(items) => {
                for v in items {
                    walk(v);
                }
            }
            _ => {}
        }
    }
    walk(&mut value);
    value
}

/// The append-only audit log for one dataset root.
#[derive(Debug)]
pub struct AuditLog {
    path: Option<PathBuf>,
    file: Mutex<Option<std::fs::File>>,
}

impl AuditLog {
    /// An enabled log under `root/logs/audit.log`, or a disabled no-op.
    #[must_use]
    pub fn new(root: &Path, enabled: bool) -> Self {
        Self {
            path: enabled.then(|| root.join("logs").join("audit.log")),
            file: Mutex::new(None),
        }
    }

    /// True when events reach a file.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.path.is_some()
    }

    /// Append one event. Best-effort: an audit failure warns but never
    /// fails the operation being audited.
    pub fn record(&self, event: &str, fields: Value) {
        let Some(path) = &self.path else {
            return;
        };
        let line = json!({
            "ts": Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            "event": event,
            "fields": redact(fields),
        });
        let mut guard = match self.file.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.is_none() {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match OpenOptions::new().append(true).create(true).open(path) {
                Ok(f) => *guard = Some(f),
                Err(e) => {
                    warn!(error = %e, "audit log unavailable");
                    return;
                }
            }
        }
        if let Some(file) = guard.as_mut() {
            if writeln!(file, "{line}").and_then(|()| file.flush()).is_err() {
                warn!(event, "failed to append audit record");
            }
        }
    }
}
