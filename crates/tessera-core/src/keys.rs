//! Key identity: specials codes, quantization, and deterministic subset UUIDs.
//!
//! A subset is identified by a tuple of user-supplied key values. The
//! [`KeyNormalizer`] maps a key dict to an ordered *identity tuple* and a
//! deterministic subset UUID, with no catalog lookup:
//!
//! - REAL keys contribute two items `(k_s, k_q)`: the IEEE-754 specials code
//!   and the quantized integer (`round(v * scale)`, ties to even) when the
//!   value is finite, `0` otherwise.
//! - INTEGER and BOOLEAN keys contribute their value.
//! - TEXT keys contribute NFC-normalized text. Commas are forbidden because
//!   the identity string joins items with `,`.
//!
//! `subset_uuid = Uuid(blake2b_128(utf8(",".join(items))))`. Equality over
//! REAL keys later uses the `k_s`/`k_q` catalog columns; range predicates use
//! the raw REAL columns.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

use crate::digest::{blake2b_128, blake2b_64_le};

/// Column names a key may not shadow.
pub const RESERVED_SUBSET_COLS: [&str; 4] = [
    "subset_uuid",
    "created_at_epoch",
    "marked_for_deletion",
    "total_rows",
];

/// Errors from key validation and identity computation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KeyError {
    /// A declared key is absent from the supplied dict.
    #[error("missing key: {name:?}")]
    MissingKey {
        /// The declared key name.
        name: String,
    },

    /// A key value does not match its declared logical type.
    #[error("invalid value for key {name:?}: expected {expected}, got {got}")]
    WrongType {
        /// The key name.
        name: String,
        /// The declared logical type.
        expected: KeyType,
        /// The supplied value's type.
        got: KeyType,
    },

    /// A TEXT key value contains a comma, which the identity string reserves.
    #[error("TEXT key {name:?} contains a comma")]
    CommaInText {
        /// The key name.
        name: String,
    },

    /// A REAL key has no quantization scale.
    #[error("quantization missing or invalid for REAL key {name:?}")]
    QuantizationMissing {
        /// The key name.
        name: String,
    },

    /// A key or field name falls outside `[A-Za-z0-9_]+` or is reserved.
    #[error("invalid name {name:?}: only A-Z, a-z, 0-9 and _ allowed, reserved names forbidden")]
    UnsafeName {
        /// The offending name.
        name: String,
    },

    /// `key_order` does not list exactly the keys in `key_schema`.
    #[error("key_order must list exactly the keys in key_schema")]
    KeyOrderMismatch,
}

/// Logical type of a subset key, mirroring the catalog column affinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyType {
    /// 64-bit float; contributes `(k_s, k_q)` to the identity tuple.
    Real,
    /// 64-bit integer.
    Integer,
    /// UTF-8 text, NFC-normalized on ingest.
    Text,
    /// Boolean, stored as 0/1.
    Boolean,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Real => write!(f, "REAL"),
            Self::Integer => write!(f, "INTEGER"),
            Self::Text => write!(f, "TEXT"),
            Self::Boolean => write!(f, "BOOLEAN"),
        }
    }
}

impl KeyType {
    /// SQL column type for the raw key column.
    #[must_use]
    pub const fn sql_type(self) -> &'static str {
        match self {
            Self::Real => "REAL",
            Self::Integer => "INTEGER",
            Self::Text => "TEXT",
            Self::Boolean => "BOOLEAN",
        }
    }
}

/// A user-supplied key value, resolved against the declared [`KeyType`]
/// before any identity or hash operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyValue {
    /// REAL value.
    Real(f64),
    /// INTEGER value.
    Integer(i64),
    /// TEXT value.
    Text(String),
    /// BOOLEAN value.
    Boolean(bool),
}

impl KeyValue {
    /// The logical type of this value.
    #[must_use]
    pub const fn key_type(&self) -> KeyType {
        match self {
            Self::Real(_) => KeyType::Real,
            Self::Integer(_) => KeyType::Integer,
            Self::Text(_) => KeyType::Text,
            Self::Boolean(_) => KeyType::Boolean,
        }
    }
}

/// IEEE-754 classification of a REAL key value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SpecialsCode {
    /// Finite value (including zero and subnormals).
    Normal = 0,
    /// Any NaN bit pattern.
    Nan = 1,
    /// Positive infinity.
    PosInf = 2,
    /// Negative infinity.
    NegInf = 3,
}

impl SpecialsCode {
    /// The integer stored in the `<k>_s` catalog column.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self as i64
    }
}

/// Classify a REAL value by its IEEE-754 bit pattern, not by comparison.
#[must_use]
pub fn classify_specials(v: f64) -> SpecialsCode {
    let bits = v.to_bits();
    let exponent = (bits >> 52) & 0x7ff;
    if exponent != 0x7ff {
        return SpecialsCode::Normal;
    }
    let mantissa = bits & 0x000f_ffff_ffff_ffff;
    if mantissa != 0 {
        SpecialsCode::Nan
    } else if bits >> 63 == 0 {
        SpecialsCode::PosInf
    } else {
        SpecialsCode::NegInf
    }
}

/// Quantize a finite REAL value: `round(v * scale)`, ties to even.
///
/// The caller must ensure the value classifies as [`SpecialsCode::Normal`].
#[must_use]
pub fn quantize_value(v: f64, scale: f64) -> i64 {
    #[allow(clippy::cast_possible_truncation)]
    let q = (v * scale).round_ties_even() as i64;
    q
}

/// One item of the ordered identity tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityItem {
    /// Specials code, quantized value, or an INTEGER key value.
    Int(i64),
    /// BOOLEAN key value, stringified as its SQL storage form `0`/`1`.
    Bool(bool),
    /// NFC-normalized TEXT key value.
    Text(String),
}

impl fmt::Display for IdentityItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{}", i64::from(*v)),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

/// Derive the deterministic subset UUID from an identity tuple.
#[must_use]
pub fn uuid_from_identity(items: &[IdentityItem]) -> Uuid {
    let joined = items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    Uuid::from_bytes(blake2b_128(joined.as_bytes()))
}

/// Route a subset to one of `n_partitions` writers, computed locally from
/// the subset UUID with no catalog lookup. Stable but not load-aware.
#[must_use]
pub fn partition_for_subset(subset_uuid: &Uuid, n_partitions: usize) -> usize {
    if n_partitions <= 1 {
        return 0;
    }
    let h = blake2b_64_le(
        subset_uuid
            .as_hyphenated()
            .to_string()
            .as_bytes(),
    );
    #[allow(clippy::cast_possible_truncation)]
    let idx = (h % n_partitions as u64) as usize;
    idx
}

/// NFC-normalize a text value the way TEXT keys are normalized on ingest.
#[must_use]
pub fn normalize_text(s: &str) -> String {
    s.nfc().collect()
}

/// Validate a key or field name: `[A-Za-z0-9_]+`, not reserved.
///
/// # Errors
///
/// Returns [`KeyError::UnsafeName`] on violation.
pub fn assert_safe_name(name: &str) -> Result<(), KeyError> {
    let ok = !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if !ok || RESERVED_SUBSET_COLS.contains(&name) {
        return Err(KeyError::UnsafeName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// A single equality predicate over an identity column.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityPredicate {
    /// Column name (`k`, `k_s`, or `k_q`).
    pub column: String,
    /// Bound value.
    pub value: IdentityItem,
}

/// Computes deterministic identity tuples and subset UUIDs from
/// `(key_schema, key_order, quantization)`.
///
/// The normalizer validates and transforms values only; it performs no I/O.
#[derive(Debug, Clone)]
pub struct KeyNormalizer {
    key_schema: BTreeMap<String, KeyType>,
    key_order: Vec<String>,
    quantization: BTreeMap<String, f64>,
}

impl KeyNormalizer {
    /// Build a normalizer, validating names, order, and quantization.
    ///
    /// Every REAL key must carry a positive quantization scale.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] when names are unsafe, `key_order` does not cover
    /// `key_schema` exactly, or a REAL key lacks a usable scale.
    pub fn new(
        key_schema: &BTreeMap<String, KeyType>,
        key_order: &[String],
        quantization: &BTreeMap<String, f64>,
    ) -> Result<Self, KeyError> {
        for name in key_schema.keys() {
            assert_safe_name(name)?;
        }
        if key_order.len() != key_schema.len()
            || !key_order.iter().all(|k| key_schema.contains_key(k))
        {
            return Err(KeyError::KeyOrderMismatch);
        }
        let mut scales = BTreeMap::new();
        for (name, ty) in key_schema {
            if *ty == KeyType::Real {
                let scale = quantization.get(name).copied().ok_or_else(|| {
                    KeyError::QuantizationMissing { name: name.clone() }
                })?;
                if !(scale.is_finite() && scale > 0.0) {
                    return Err(KeyError::QuantizationMissing { name: name.clone() });
                }
                scales.insert(name.clone(), scale);
            }
        }
        Ok(Self {
            key_schema: key_schema.clone(),
            key_order: key_order.to_vec(),
            quantization: scales,
        })
    }

    /// Declared key order.
    #[must_use]
    pub fn key_order(&self) -> &[String] {
        &self.key_order
    }

    /// Declared type of a key, if present.
    #[must_use]
    pub fn key_type(&self, name: &str) -> Option<KeyType> {
        self.key_schema.get(name).copied()
    }

    /// Quantization scale for a REAL key, if present.
    #[must_use]
    pub fn scale(&self, name: &str) -> Option<f64> {
        self.quantization.get(name).copied()
    }

    /// Expanded identity column names for the composite UNIQUE index:
    /// REAL keys contribute `k_s, k_q`; others their raw name, in key order.
    #[must_use]
    pub fn identity_columns(&self) -> Vec<String> {
        let mut cols = Vec::with_capacity(self.key_order.len() * 2);
        for k in &self.key_order {
            if self.key_schema[k] == KeyType::Real {
                cols.push(format!("{k}_s"));
                cols.push(format!("{k}_q"));
            } else {
                cols.push(k.clone());
            }
        }
        cols
    }

    /// Return a normalized copy of the key dict: types coerced against the
    /// declared schema, TEXT NFC-normalized and comma-checked.
    ///
    /// Integers are accepted for REAL keys and booleans for INTEGER keys,
    /// matching the catalog's storage affinity.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] on a missing key, a non-coercible type, or a
    /// comma in TEXT.
    pub fn normalize_keys(
        &self,
        keys: &BTreeMap<String, KeyValue>,
    ) -> Result<BTreeMap<String, KeyValue>, KeyError> {
        let mut out = BTreeMap::new();
        for name in &self.key_order {
            let value = keys.get(name).ok_or_else(|| KeyError::MissingKey {
                name: name.clone(),
            })?;
            let declared = self.key_schema[name];
            let normalized = match (declared, value) {
                (KeyType::Real, KeyValue::Real(v)) => KeyValue::Real(*v),
                #[allow(clippy::cast_precision_loss)]
                (KeyType::Real, KeyValue::Integer(v)) => KeyValue::Real(*v as f64),
                (KeyType::Integer, KeyValue::Integer(v)) => KeyValue::Integer(*v),
                (KeyType::Integer, KeyValue::Boolean(v)) => {
                    KeyValue::Integer(i64::from(*v))
                }
                (KeyType::Boolean, KeyValue::Boolean(v)) => KeyValue::Boolean(*v),
                (KeyType::Text, KeyValue::Text(v)) => {
                    let nfc: String = v.nfc().collect();
                    if nfc.contains(',') {
                        return Err(KeyError::CommaInText { name: name.clone() });
                    }
                    KeyValue::Text(nfc)
                }
                (expected, got) => {
                    return Err(KeyError::WrongType {
                        name: name.clone(),
                        expected,
                        got: got.key_type(),
                    })
                }
            };
            out.insert(name.clone(), normalized);
        }
        Ok(out)
    }

    /// Compute the ordered identity tuple for a key dict.
    ///
    /// # Errors
    ///
    /// Propagates validation errors from [`Self::normalize_keys`].
    pub fn identity_tuple(
        &self,
        keys: &BTreeMap<String, KeyValue>,
    ) -> Result<Vec<IdentityItem>, KeyError> {
        let normalized = self.normalize_keys(keys)?;
        let mut items = Vec::with_capacity(self.key_order.len() * 2);
        for name in &self.key_order {
            match &normalized[name] {
                KeyValue::Real(v) => {
                    let code = classify_specials(*v);
                    items.push(IdentityItem::Int(code.as_i64()));
                    let q = if code == SpecialsCode::Normal {
                        quantize_value(*v, self.quantization[name])
                    } else {
                        0
                    };
                    items.push(IdentityItem::Int(q));
                }
                KeyValue::Integer(v) => items.push(IdentityItem::Int(*v)),
                KeyValue::Boolean(v) => items.push(IdentityItem::Bool(*v)),
                KeyValue::Text(v) => items.push(IdentityItem::Text(v.clone())),
            }
        }
        Ok(items)
    }

    /// Deterministic subset UUID for a key dict.
    ///
    /// # Errors
    ///
    /// Propagates validation errors from [`Self::identity_tuple`].
    pub fn subset_uuid(&self, keys: &BTreeMap<String, KeyValue>) -> Result<Uuid, KeyError> {
        Ok(uuid_from_identity(&self.identity_tuple(keys)?))
    }

    /// Equality predicates over identity columns for SQL WHERE clauses, in
    /// key order. REAL keys expand to `k_s = s AND k_q = q`.
    ///
    /// # Errors
    ///
    /// Propagates validation errors from [`Self::normalize_keys`].
    pub fn equality_predicates(
        &self,
        keys: &BTreeMap<String, KeyValue>,
    ) -> Result<Vec<IdentityPredicate>, KeyError> {
        let normalized = self.normalize_keys(keys)?;
        let mut preds = Vec::with_capacity(self.key_order.len() * 2);
        for name in &self.key_order {
            match &normalized[name] {
                KeyValue::Real(v) => {
                    let code = classify_specials(*v);
                    preds.push(IdentityPredicate {
                        column: format!("{name}_s"),
                        value: IdentityItem::Int(code.as_i64()),
                    });
                    let q = if code == SpecialsCode::Normal {
                        quantize_value(*v, self.quantization[name])
                    } else {
                        0
                    };
                    preds.push(IdentityPredicate {
                        column: format!("{name}_q"),
                        value: IdentityItem::Int(q),
                    });
                }
                KeyValue::Integer(v) => preds.push(IdentityPredicate {
                    column: name.clone(),
                    value: IdentityItem::Int(*v),
                }),
                KeyValue::Boolean(v) => preds.push(IdentityPredicate {
                    column: name.clone(),
                    value: IdentityItem::Bool(*v),
                }),
                KeyValue::Text(v) => preds.push(IdentityPredicate {
                    column: name.clone(),
                    value: IdentityItem::Text(v.clone()),
                }),
            }
        }
        Ok(preds)
    }

    /// Human-readable, stable key string for logs. Floats are rounded to six
    /// decimals; keys sorted by name. Never used for identity.
    #[must_use]
    pub fn stable_key_string(keys: &BTreeMap<String, KeyValue>) -> String {
        let mut out = String::from("{");
        for (i, (name, value)) in keys.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            match value {
                KeyValue::Real(v) => {
                    let rounded = (v * 1e6).round() / 1e6;
                    out.push_str(&format!("\"{name}\":{rounded}"));
                }
                KeyValue::Integer(v) => out.push_str(&format!("\"{name}\":{v}")),
                KeyValue::Boolean(v) => out.push_str(&format!("\"{name}\":{v}")),
                KeyValue::Text(v) => {
                    out.push_str(&format!("\"{name}\":{}", serde_json::json!(v)));
                }
            }
        }
        out.push('}');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lat_normalizer(scale: f64) -> KeyNormalizer {
        let schema = BTreeMap::from([("lat".to_string(), KeyType::Real)]);
        let quant = BTreeMap::from([("lat".to_string(), scale)]);
        KeyNormalizer::new(&schema, &["lat".to_string()], &quant).expect("normalizer")
    }

    fn keys_of(pairs: &[(&str, KeyValue)]) -> BTreeMap<String, KeyValue> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_classify_specials_bit_patterns() {
        assert_eq!(classify_specials(0.0), SpecialsCode::Normal);
        assert_eq!(classify_specials(-0.0), SpecialsCode::Normal);
        assert_eq!(classify_specials(1e-310), SpecialsCode::Normal);
        assert_eq!(classify_specials(f64::NAN), SpecialsCode::Nan);
        assert_eq!(classify_specials(-f64::NAN), SpecialsCode::Nan);
        assert_eq!(classify_specials(f64::INFINITY), SpecialsCode::PosInf);
        assert_eq!(classify_specials(f64::NEG_INFINITY), SpecialsCode::NegInf);
    }

    #[test]
    fn test_quantize_ties_to_even() {
        assert_eq!(quantize_value(0.5, 1.0), 0);
        assert_eq!(quantize_value(1.5, 1.0), 2);
        assert_eq!(quantize_value(2.5, 1.0), 2);
        assert_eq!(quantize_value(-2.5, 1.0), -2);
        assert_eq!(quantize_value(3.5, 1.0), 4);
    }

    #[test]
    fn test_quantization_collapse_to_one_identity() {
        let n = lat_normalizer(1_000_000.0);
        let values = [37.774_929_6, 37.774_930_4, 37.774_929_8];
        let uuids: Vec<_> = values
            .iter()
            .map(|v| {
                n.subset_uuid(&keys_of(&[("lat", KeyValue::Real(*v))]))
                    .expect("uuid")
            })
            .collect();
        assert_eq!(uuids[0], uuids[1]);
        assert_eq!(uuids[0], uuids[2]);
        let tuple = n
            .identity_tuple(&keys_of(&[("lat", KeyValue::Real(values[0]))]))
            .expect("tuple");
        assert_eq!(tuple, vec![IdentityItem::Int(0), IdentityItem::Int(37_774_930)]);
    }

    #[test]
    fn test_specials_route_to_distinct_subsets() {
        let n = lat_normalizer(1_000_000.0);
        let inputs = [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 0.0];
        let expected_s = [1, 2, 3, 0];
        let mut uuids = Vec::new();
        for (v, s) in inputs.iter().zip(expected_s) {
            let tuple = n
                .identity_tuple(&keys_of(&[("lat", KeyValue::Real(*v))]))
                .expect("tuple");
            assert_eq!(tuple[0], IdentityItem::Int(s));
            assert_eq!(tuple[1], IdentityItem::Int(0));
            uuids.push(n.subset_uuid(&keys_of(&[("lat", KeyValue::Real(*v))])).expect("uuid"));
        }
        for i in 0..uuids.len() {
            for j in i + 1..uuids.len() {
                assert_ne!(uuids[i], uuids[j], "specials must not collide");
            }
        }
    }

    #[test]
    fn test_subset_uuid_is_deterministic() {
        let items = vec![
            IdentityItem::Int(0),
            IdentityItem::Int(1_234_567),
            IdentityItem::Text("site_A".to_string()),
            IdentityItem::Bool(true),
        ];
        assert_eq!(uuid_from_identity(&items), uuid_from_identity(&items));
    }

    #[test]
    fn test_text_nfc_applied_uniformly() {
        let schema = BTreeMap::from([("site".to_string(), KeyType::Text)]);
        let n = KeyNormalizer::new(&schema, &["site".to_string()], &BTreeMap::new())
            .expect("normalizer");
        // "é" composed vs decomposed must yield the same identity.
        let composed = keys_of(&[("site", KeyValue::Text("caf\u{e9}".to_string()))]);
        let decomposed = keys_of(&[("site", KeyValue::Text("cafe\u{301}".to_string()))]);
        assert_eq!(
            n.subset_uuid(&composed).expect("uuid"),
            n.subset_uuid(&decomposed).expect("uuid")
        );
    }

    #[test]
    fn test_comma_in_text_rejected() {
        let schema = BTreeMap::from([("site".to_string(), KeyType::Text)]);
        let n = KeyNormalizer::new(&schema, &["site".to_string()], &BTreeMap::new())
            .expect("normalizer");
        let err = n
            .subset_uuid(&keys_of(&[("site", KeyValue::Text("a,b".to_string()))]))
            .expect_err("comma must be rejected");
        assert!(matches!(err, KeyError::CommaInText { .. }));
    }

    #[test]
    fn test_missing_quantization_rejected() {
        let schema = BTreeMap::from([("lat".to_string(), KeyType::Real)]);
        let err = KeyNormalizer::new(&schema, &["lat".to_string()], &BTreeMap::new())
            .expect_err("missing scale");
        assert!(matches!(err, KeyError::QuantizationMissing { .. }));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let schema = BTreeMap::from([("run".to_string(), KeyType::Integer)]);
        let n = KeyNormalizer::new(&schema, &["run".to_string()], &BTreeMap::new())
            .expect("normalizer");
        let err = n
            .subset_uuid(&keys_of(&[("run", KeyValue::Text("7".to_string()))]))
            .expect_err("text for INTEGER");
        assert!(matches!(err, KeyError::WrongType { .. }));
    }

    #[test]
    fn test_identity_columns_expand_reals() {
        let schema = BTreeMap::from([
            ("lat".to_string(), KeyType::Real),
            ("site".to_string(), KeyType::Text),
        ]);
        let quant = BTreeMap::from([("lat".to_string(), 1000.0)]);
        let order = vec!["site".to_string(), "lat".to_string()];
        let n = KeyNormalizer::new(&schema, &order, &quant).expect("normalizer");
        assert_eq!(n.identity_columns(), vec!["site", "lat_s", "lat_q"]);
    }

    #[test]
    fn test_reserved_names_rejected() {
        assert!(assert_safe_name("subset_uuid").is_err());
        assert!(assert_safe_name("total_rows").is_err());
        assert!(assert_safe_name("lat-1").is_err());
        assert!(assert_safe_name("").is_err());
        assert!(assert_safe_name("lat_1").is_ok());
    }

    #[test]
    fn test_partition_is_stable_and_bounded() {
        let n = lat_normalizer(1000.0);
        let uuid = n
            .subset_uuid(&keys_of(&[("lat", KeyValue::Real(1.25))]))
            .expect("uuid");
        let a = partition_for_subset(&uuid, 4);
        let b = partition_for_subset(&uuid, 4);
        assert_eq!(a, b);
        assert!(a < 4);
        assert_eq!(partition_for_subset(&uuid, 1), 0);
    }
}
