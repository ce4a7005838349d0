//! Canonical dtype, jagged specs, and the schema document.
//!
//! The canonical dtype is an ordered sequence of `(field_name, base, shape)`
//! entries; author order is authoritative and is never sorted. It locks on
//! the first write. The only permitted mutation afterwards is *widening* a
//! text field's maximum UTF-8 width; canonical jagged maxima lock with the
//! dtype and refuse later growth.
//!
//! The schema document is the JSON blob persisted per dataset; its
//! fingerprint (blake2b-128 over the canonical form) gates merge
//! compatibility.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::digest::blake2b_128_hex;
use crate::keys::KeyType;

/// Default maximum UTF-8 width (bytes) for text fields when none is given.
pub const DEFAULT_TEXT_WIDTH: u32 = 256;

/// Errors from schema validation, locking, and casting.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SchemaError {
    /// Incoming batch cannot be reconciled with the canonical dtype.
    #[error("schema mismatch: {detail}")]
    Mismatch {
        /// Human-readable description of the conflict.
        detail: String,
    },

    /// A jagged field exceeds the locked canonical shape.
    #[error("field {field:?} exceeds canonical shape: observed {observed:?}, canonical {canonical:?}")]
    ExceedsCanon {
        /// The offending field.
        field: String,
        /// Observed per-row shape.
        observed: Vec<u32>,
        /// Locked canonical shape.
        canonical: Vec<u32>,
    },

    /// An operation requires a locked canonical dtype.
    #[error("canonical dtype not locked for this dataset")]
    NotLocked,

    /// A base type outside the supported set was supplied.
    #[error("unsupported base type: {detail}")]
    UnsupportedBase {
        /// Description of the rejected type.
        detail: String,
    },

    /// The persisted dtype JSON could not be parsed.
    #[error("invalid canonical dtype document: {0}")]
    BadDocument(#[from] serde_json::Error),
}

/// Base element type of a field.
///
/// Object, complex, and timezone-carrying temporal types are rejected at the
/// batch boundary; everything stored is byte-representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseType {
    /// 64-bit signed integer, little-endian on the wire.
    Int64,
    /// IEEE-754 binary64, little-endian on the wire.
    Float64,
    /// Boolean, one byte on the wire.
    Bool,
    /// UTF-8 text with a maximum width in bytes per element.
    Text {
        /// Maximum UTF-8 byte length of one element.
        width: u32,
    },
}

impl BaseType {
    /// Tag used in the persisted dtype document (`<i8`, `<f8`, `|b1`,
    /// `<U{width}`).
    #[must_use]
    pub fn descr(&self) -> String {
        match self {
            Self::Int64 => "<i8".to_string(),
            Self::Float64 => "<f8".to_string(),
            Self::Bool => "|b1".to_string(),
            Self::Text { width } => format!("<U{width}"),
        }
    }

    /// Tag used in the content-hash schema signature. Text collapses to
    /// `"U"` so widening never changes content hashes.
    #[must_use]
    pub const fn signature_tag(&self) -> &'static str {
        match self {
            Self::Int64 => "<i8",
            Self::Float64 => "<f8",
            Self::Bool => "|b1",
            Self::Text { .. } => "U",
        }
    }

    /// Parse a persisted tag.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnsupportedBase`] for anything outside the
    /// supported set.
    pub fn from_descr(descr: &str) -> Result<Self, SchemaError> {
        match descr {
            "<i8" => Ok(Self::Int64),
            "<f8" => Ok(Self::Float64),
            "|b1" => Ok(Self::Bool),
            other => {
                if let Some(width) = other.strip_prefix("<U") {
                    let width: u32 = width.parse().map_err(|_| SchemaError::UnsupportedBase {
                        detail: other.to_string(),
                    })?;
                    return Ok(Self::Text { width });
                }
                Err(SchemaError::UnsupportedBase {
                    detail: other.to_string(),
                })
            }
        }
    }

    /// True for text bases.
    #[must_use]
    pub const fn is_text(&self) -> bool {
        matches!(self, Self::Text { .. })
    }

    /// Estimated bytes per element, used for chunking and buffer accounting.
    #[must_use]
    pub const fn elem_size_estimate(&self) -> usize {
        match self {
            Self::Int64 | Self::Float64 => 8,
            Self::Bool => 1,
            Self::Text { width } => *width as usize,
        }
    }
}

impl fmt::Display for BaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.descr())
    }
}

impl Serialize for BaseType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.descr())
    }
}

impl<'de> Deserialize<'de> for BaseType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_descr(&s).map_err(D::Error::custom)
    }
}

/// One field of the canonical dtype.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name (`[A-Za-z0-9_]+`).
    pub name: String,
    /// Base element type.
    pub base: BaseType,
    /// Fixed per-row shape; empty for scalar fields. For jagged fields this
    /// is the canonical (maximum) shape.
    #[serde(default)]
    pub shape: Vec<u32>,
}

impl FieldSpec {
    /// Elements per row (product of the shape; 1 for scalars).
    #[must_use]
    pub fn elems_per_row(&self) -> usize {
        self.shape.iter().map(|&d| d as usize).product()
    }

    /// Estimated bytes per row for this field.
    #[must_use]
    pub fn row_bytes_estimate(&self) -> usize {
        self.elems_per_row() * self.base.elem_size_estimate()
    }
}

/// Ordered canonical dtype. Author order is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Dtype {
    fields: Vec<FieldSpec>,
}

impl Dtype {
    /// Build from an ordered field list.
    #[must_use]
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    /// Ordered fields.
    #[must_use]
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Look up a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Estimated bytes per row across all fields.
    #[must_use]
    pub fn row_bytes_estimate(&self) -> usize {
        self.fields.iter().map(FieldSpec::row_bytes_estimate).sum()
    }

    /// Serialize to the canonical JSON form: an array of
    /// `{"name","base","shape"}` records in author order.
    #[must_use]
    pub fn to_canonical_json(&self) -> String {
        #[derive(Serialize)]
        struct Item<'a> {
            name: &'a str,
            base: String,
            shape: &'a [u32],
        }
        let items: Vec<Item<'_>> = self
            .fields
            .iter()
            .map(|f| Item {
                name: &f.name,
                base: f.base.descr(),
                shape: &f.shape,
            })
            .collect();
        serde_json::to_string(&items).unwrap_or_default()
    }

    /// Parse the canonical JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] on malformed documents or unsupported bases.
    pub fn from_canonical_json(js: &str) -> Result<Self, SchemaError> {
        #[derive(Deserialize)]
        struct Item {
            name: String,
            base: String,
            #[serde(default)]
            shape: Vec<u32>,
        }
        let items: Vec<Item> = serde_json::from_str(js)?;
        let mut fields = Vec::with_capacity(items.len());
        for it in items {
            fields.push(FieldSpec {
                name: it.name,
                base: BaseType::from_descr(&it.base)?,
                shape: it.shape,
            });
        }
        Ok(Self { fields })
    }

    /// Check that an incoming dtype can be safely cast to this one:
    /// identical field names and order, identical shapes, identical base
    /// kinds, and text widths not exceeding the canonical widths.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Mismatch`] describing the first conflict.
    pub fn check_cast_from(&self, incoming: &Self) -> Result<(), SchemaError> {
        if self.fields.len() != incoming.fields.len()
            || self
                .fields
                .iter()
                .zip(&incoming.fields)
                .any(|(a, b)| a.name != b.name)
        {
            return Err(SchemaError::Mismatch {
                detail: format!(
                    "field set differs: canonical [{}] vs incoming [{}]",
                    self.field_names().join(","),
                    incoming.field_names().join(","),
                ),
            });
        }
        for (canon, inc) in self.fields.iter().zip(&incoming.fields) {
            if canon.shape != inc.shape {
                return Err(SchemaError::Mismatch {
                    detail: format!(
                        "field {:?} shape differs: canonical {:?} vs incoming {:?}",
                        canon.name, canon.shape, inc.shape
                    ),
                });
            }
            match (canon.base, inc.base) {
                (BaseType::Int64, BaseType::Int64)
                | (BaseType::Float64, BaseType::Float64)
                | (BaseType::Bool, BaseType::Bool) => {}
                (BaseType::Text { width: cw }, BaseType::Text { width: iw }) => {
                    if iw > cw {
                        return Err(SchemaError::Mismatch {
                            detail: format!(
                                "field {:?} text width {iw} exceeds canonical {cw}",
                                canon.name
                            ),
                        });
                    }
                }
                (c, i) => {
                    return Err(SchemaError::Mismatch {
                        detail: format!(
                            "field {:?} base differs: canonical {c} vs incoming {i}",
                            canon.name
                        ),
                    })
                }
            }
        }
        Ok(())
    }

    /// Widen canonical text widths to cover an incoming dtype. Returns the
    /// widened dtype if any width grew, `None` if no widening is needed.
    ///
    /// The incoming dtype must already agree on names, order, shapes, and
    /// base kinds.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Mismatch`] on any structural disagreement.
    pub fn widen_text_from(&self, incoming: &Self) -> Result<Option<Self>, SchemaError> {
        if self.fields.len() != incoming.fields.len() {
            return Err(SchemaError::Mismatch {
                detail: "field count differs".to_string(),
            });
        }
        let mut changed = false;
        let mut out = Vec::with_capacity(self.fields.len());
        for (canon, inc) in self.fields.iter().zip(&incoming.fields) {
            if canon.name != inc.name || canon.shape != inc.shape {
                return Err(SchemaError::Mismatch {
                    detail: format!("field {:?} does not line up for widening", canon.name),
                });
            }
            let base = match (canon.base, inc.base) {
                (BaseType::Text { width: cw }, BaseType::Text { width: iw }) if iw > cw => {
                    changed = true;
                    BaseType::Text { width: iw }
                }
                _ => canon.base,
            };
            out.push(FieldSpec {
                name: canon.name.clone(),
                base,
                shape: canon.shape.clone(),
            });
        }
        Ok(changed.then(|| Self { fields: out }))
    }

    fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }
}

/// Jagged (variable-length) configuration: for each jagged field, the
/// ordered list of dimension indices that vary per row.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JaggedSpec {
    /// Field name to `vary_dims`.
    pub fields: BTreeMap<String, JaggedFieldSpec>,
}

/// Per-field jagged configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JaggedFieldSpec {
    /// Ordered dimension indices (into the field's shape) that vary per row.
    pub vary_dims: Vec<u32>,
}

/// Width of a jagged meta column, the smallest fitting the canonical max.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaWidth {
    /// `uint16` length column.
    U16,
    /// `uint32` length column.
    U32,
    /// `int16` shape column.
    I16,
    /// `int32` shape column.
    I32,
}

/// Kind of meta column a jagged field carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaKind {
    /// Single varying dim: `<field>_len`, one value per row.
    Len,
    /// Multiple varying dims: `<field>_shape`, `k` values per row.
    Shape {
        /// Number of varying dims.
        k: usize,
    },
}

impl JaggedSpec {
    /// True when no field is jagged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// `vary_dims` for a field, if jagged.
    #[must_use]
    pub fn vary_dims(&self, field: &str) -> Option<&[u32]> {
        self.fields.get(field).map(|f| f.vary_dims.as_slice())
    }

    /// Meta column name and kind for a field, if jagged:
    /// one varying dim yields `<field>_len`, more yield `<field>_shape`.
    #[must_use]
    pub fn meta_for(&self, field: &str) -> Option<(String, MetaKind)> {
        let dims = self.vary_dims(field)?;
        if dims.is_empty() {
            return None;
        }
        if dims.len() == 1 {
            Some((format!("{field}_len"), MetaKind::Len))
        } else {
            Some((format!("{field}_shape"), MetaKind::Shape { k: dims.len() }))
        }
    }

    /// Validate that every jagged field exists in the dtype and its
    /// `vary_dims` index into the field's shape.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Mismatch`] on a dangling field or dim index.
    pub fn validate_against(&self, dtype: &Dtype) -> Result<(), SchemaError> {
        for (name, spec) in &self.fields {
            let field = dtype.field(name).ok_or_else(|| SchemaError::Mismatch {
                detail: format!("jagged field {name:?} not in dtype"),
            })?;
            for &d in &spec.vary_dims {
                if d as usize >= field.shape.len() {
                    return Err(SchemaError::Mismatch {
                        detail: format!(
                            "jagged field {name:?} vary dim {d} out of range for shape {:?}",
                            field.shape
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Pick the smallest length-column width covering `max_len`.
#[must_use]
pub fn pick_len_width(max_len: u32) -> MetaWidth {
    if max_len <= u32::from(u16::MAX) {
        MetaWidth::U16
    } else {
        MetaWidth::U32
    }
}

/// Pick the smallest shape-column width covering `max_dim`.
#[must_use]
pub fn pick_shape_width(max_dim: u32) -> MetaWidth {
    if max_dim <= i16::MAX as u32 {
        MetaWidth::I16
    } else {
        MetaWidth::I32
    }
}

/// Part sizing and compression, locked with the first part of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartConfig {
    /// Target rows per sealed part.
    pub part_rows: u64,
    /// Optional compression codec name (`"gzip"`).
    #[serde(default)]
    pub compression: Option<String>,
    /// Optional codec level.
    #[serde(default)]
    pub compression_opts: Option<i64>,
}

/// Encryption policy block. `mode = "none"` means parts are plaintext; the
/// metadata seam and AAD contract are fixed regardless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionPolicy {
    /// `"none"` or a future AEAD mode.
    pub mode: String,
    /// AEAD algorithm name reserved for later activation.
    pub algorithm: String,
    /// Default key reference.
    #[serde(default)]
    pub key_ref: Option<String>,
    /// Key rotation interval in days.
    pub rotation_days: u32,
}

impl Default for EncryptionPolicy {
    fn default() -> Self {
        Self {
            mode: "none".to_string(),
            algorithm: "AES-256-GCM".to_string(),
            key_ref: None,
            rotation_days: 180,
        }
    }
}

/// The immutable schema document persisted per dataset.
///
/// The fingerprint of the canonical form gates merge compatibility; text
/// widening bumps the fingerprint and is a rewrite event, not a mutation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SchemaDocument {
    /// Ordered map of key name to logical type.
    #[serde(default)]
    pub key_schema: BTreeMap<String, KeyType>,
    /// Authoritative key order.
    #[serde(default)]
    pub key_order: Vec<String>,
    /// Canonical dtype in its JSON form; empty until locked.
    #[serde(default)]
    pub dtype_descr: String,
    /// Part sizing and compression; absent until locked.
    #[serde(default)]
    pub part_config: Option<PartConfig>,
    /// REAL key name to positive quantization scale.
    #[serde(default)]
    pub quantization: BTreeMap<String, f64>,
    /// Jagged field configuration.
    #[serde(default)]
    pub jagged: JaggedSpec,
    /// Encryption policy block.
    #[serde(default)]
    pub encryption: EncryptionPolicy,
}

impl SchemaDocument {
    /// True once the canonical dtype is locked.
    #[must_use]
    pub fn has_canonical_dtype(&self) -> bool {
        !self.dtype_descr.is_empty()
    }

    /// Parse the locked canonical dtype.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::NotLocked`] before the first write, or a parse
    /// error on a corrupt document.
    pub fn canonical_dtype(&self) -> Result<Dtype, SchemaError> {
        if self.dtype_descr.is_empty() {
            return Err(SchemaError::NotLocked);
        }
        Dtype::from_canonical_json(&self.dtype_descr)
    }

    /// Store a canonical dtype.
    pub fn set_canonical_dtype(&mut self, dtype: &Dtype) {
        self.dtype_descr = dtype.to_canonical_json();
    }

    /// blake2b-128 hex fingerprint over the canonical JSON form (sorted
    /// keys, no whitespace).
    #[must_use]
    pub fn fingerprint(&self) -> String {
        // serde_json maps serialize with sorted keys (BTreeMap), so
        // round-tripping through Value yields the canonical form.
        let value = serde_json::to_value(self).unwrap_or_default();
        let payload = serde_json::to_string(&value).unwrap_or_default();
        blake2b_128_hex(payload.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dtype() -> Dtype {
        Dtype::new(vec![
            FieldSpec {
                name: "t".to_string(),
                base: BaseType::Float64,
                shape: vec![],
            },
            FieldSpec {
                name: "seq".to_string(),
                base: BaseType::Int64,
                shape: vec![4],
            },
            FieldSpec {
                name: "label".to_string(),
                base: BaseType::Text { width: 16 },
                shape: vec![],
            },
        ])
    }

    #[test]
    fn test_dtype_json_round_trip_preserves_author_order() {
        let dt = sample_dtype();
        let js = dt.to_canonical_json();
        let back = Dtype::from_canonical_json(&js).expect("parse");
        assert_eq!(dt, back);
        // Author order, not sorted order.
        assert!(js.find("\"t\"").expect("t") < js.find("\"seq\"").expect("seq"));
        assert!(js.find("\"seq\"").expect("seq") < js.find("\"label\"").expect("label"));
    }

    #[test]
    fn test_unsupported_base_rejected() {
        assert!(BaseType::from_descr("<c16").is_err());
        assert!(BaseType::from_descr("|O").is_err());
        assert!(BaseType::from_descr("<M8[ns]").is_err());
        assert!(BaseType::from_descr("<U12").is_ok());
    }

    #[test]
    fn test_cast_check_accepts_narrower_text() {
        let canon = sample_dtype();
        let mut incoming = sample_dtype();
        incoming.fields[2].base = BaseType::Text { width: 8 };
        canon.check_cast_from(&incoming).expect("narrower text casts");
    }

    #[test]
    fn test_cast_check_rejects_shape_change() {
        let canon = sample_dtype();
        let mut incoming = sample_dtype();
        incoming.fields[1].shape = vec![5];
        assert!(matches!(
            canon.check_cast_from(&incoming),
            Err(SchemaError::Mismatch { .. })
        ));
    }

    #[test]
    fn test_widening_grows_text_only() {
        let canon = sample_dtype();
        let mut incoming = sample_dtype();
        incoming.fields[2].base = BaseType::Text { width: 64 };
        let widened = canon
            .widen_text_from(&incoming)
            .expect("structural match")
            .expect("width grew");
        assert_eq!(widened.fields()[2].base, BaseType::Text { width: 64 });
        assert_eq!(widened.fields()[0].base, BaseType::Float64);
        assert!(canon.widen_text_from(&canon).expect("no-op").is_none());
    }

    #[test]
    fn test_signature_tag_ignores_text_width() {
        assert_eq!(BaseType::Text { width: 8 }.signature_tag(), "U");
        assert_eq!(BaseType::Text { width: 512 }.signature_tag(), "U");
    }

    #[test]
    fn test_meta_naming_and_widths() {
        let mut jagged = JaggedSpec::default();
        jagged.fields.insert(
            "seq".to_string(),
            JaggedFieldSpec { vary_dims: vec![0] },
        );
        jagged.fields.insert(
            "patch".to_string(),
            JaggedFieldSpec {
                vary_dims: vec![0, 1],
            },
        );
        assert_eq!(
            jagged.meta_for("seq"),
            Some(("seq_len".to_string(), MetaKind::Len))
        );
        assert_eq!(
            jagged.meta_for("patch"),
            Some(("patch_shape".to_string(), MetaKind::Shape { k: 2 }))
        );
        assert_eq!(jagged.meta_for("t"), None);
        assert_eq!(pick_len_width(65_535), MetaWidth::U16);
        assert_eq!(pick_len_width(65_536), MetaWidth::U32);
        assert_eq!(pick_shape_width(32_767), MetaWidth::I16);
        assert_eq!(pick_shape_width(32_768), MetaWidth::I32);
    }

    #[test]
    fn test_jagged_validate_against_dtype() {
        let dt = sample_dtype();
        let mut jagged = JaggedSpec::default();
        jagged.fields.insert(
            "seq".to_string(),
            JaggedFieldSpec { vary_dims: vec![0] },
        );
        jagged.validate_against(&dt).expect("valid");
        jagged.fields.insert(
            "seq".to_string(),
            JaggedFieldSpec { vary_dims: vec![3] },
        );
        assert!(jagged.validate_against(&dt).is_err());
        jagged.fields.clear();
        jagged.fields.insert(
            "nope".to_string(),
            JaggedFieldSpec { vary_dims: vec![0] },
        );
        assert!(jagged.validate_against(&dt).is_err());
    }

    #[test]
    fn test_fingerprint_changes_on_widening() {
        let mut doc = SchemaDocument::default();
        doc.key_schema
            .insert("site".to_string(), KeyType::Text);
        doc.key_order.push("site".to_string());
        doc.set_canonical_dtype(&sample_dtype());
        let fp1 = doc.fingerprint();
        assert_eq!(fp1.len(), 32);
        assert_eq!(fp1, doc.fingerprint());

        let mut widened = sample_dtype();
        widened.fields[2].base = BaseType::Text { width: 64 };
        doc.set_canonical_dtype(&widened);
        assert_ne!(fp1, doc.fingerprint());
    }
}
