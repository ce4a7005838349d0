//! The content-hash contract: a byte-stable blake2b-128 digest over padded
//! row data plus jagged meta arrays, seeded by a schema signature.
//!
//! The update order is fixed:
//!
//! 1. Schema signature: canonical JSON of `(field_name, base_tag, shape)`
//!    triples plus the jagged spec. Text bases collapse to `"U"` so widening
//!    never perturbs existing hashes.
//! 2. Row payload in chunks bounded by `max_chunk_bytes`: per chunk, per
//!    field in dtype order — text elements NFC-normalized, UTF-8 encoded,
//!    and prefixed with their byte length as little-endian u32; numeric and
//!    boolean elements as raw little-endian bytes of the padded field.
//! 3. Each jagged meta array in dtype field order, raw little-endian bytes.
//!
//! The same routine hashes an in-memory batch and a re-read sealed part; the
//! two digests must agree bit for bit.

use std::collections::BTreeMap;

use blake2::Digest;
use unicode_normalization::UnicodeNormalization;

use crate::batch::CellValues;
use crate::digest::Blake2b128;
use crate::jagged::{MetaColumn, PaddedBatch};
use crate::schema::{Dtype, JaggedSpec, MetaWidth};

/// Default chunk bound for hashing, 16 MiB.
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 16 * 1024 * 1024;

/// Canonical signature bytes for `(dtype, jagged)`.
#[must_use]
pub fn schema_signature(dtype: &Dtype, jagged: &JaggedSpec) -> Vec<u8> {
    #[derive(serde::Serialize)]
    struct Signature<'a> {
        dtype: Vec<(&'a str, &'static str, &'a [u32])>,
        jagged: BTreeMap<&'a str, &'a [u32]>,
    }
    let sig = Signature {
        dtype: dtype
            .fields()
            .iter()
            .map(|f| (f.name.as_str(), f.base.signature_tag(), f.shape.as_slice()))
            .collect(),
        jagged: jagged
            .fields
            .iter()
            .map(|(name, spec)| (name.as_str(), spec.vary_dims.as_slice()))
            .collect(),
    };
    serde_json::to_vec(&sig).unwrap_or_default()
}

fn update_text_elems(hasher: &mut Blake2b128, elems: &[String]) {
    for s in elems {
        let normalized: String = s.nfc().collect();
        let bytes = normalized.as_bytes();
        #[allow(clippy::cast_possible_truncation)]
        hasher.update((bytes.len() as u32).to_le_bytes());
        hasher.update(bytes);
    }
}

fn update_meta(hasher: &mut Blake2b128, meta: &MetaColumn) {
    match meta.width {
        MetaWidth::U16 => {
            for &v in &meta.values {
                #[allow(clippy::cast_possible_truncation)]
                hasher.update((v as u16).to_le_bytes());
            }
        }
        MetaWidth::U32 => {
            for &v in &meta.values {
                hasher.update(v.to_le_bytes());
            }
        }
        MetaWidth::I16 => {
            for &v in &meta.values {
                #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
                hasher.update((v as i16).to_le_bytes());
            }
        }
        MetaWidth::I32 => {
            for &v in &meta.values {
                #[allow(clippy::cast_possible_wrap)]
                hasher.update((v as i32).to_le_bytes());
            }
        }
    }
}

/// Compute the hex content hash of a padded batch.
#[must_use]
pub fn content_hash(batch: &PaddedBatch, max_chunk_bytes: usize) -> String {
    let mut hasher = Blake2b128::new();
    hasher.update(schema_signature(&batch.dtype, &batch.jagged));

    let row_bytes = batch.dtype.row_bytes_estimate().max(1);
    let chunk_rows = (max_chunk_bytes / row_bytes).max(1);

    let mut start = 0usize;
    while start < batch.n_rows {
        let end = (start + chunk_rows).min(batch.n_rows);
        for col in &batch.columns {
            let elems = col.spec.elems_per_row();
            let range = start * elems..end * elems;
            match &col.values {
                CellValues::Int(v) => {
                    for x in &v[range] {
                        hasher.update(x.to_le_bytes());
                    }
                }
                CellValues::Real(v) => {
                    for x in &v[range] {
                        hasher.update(x.to_le_bytes());
                    }
                }
                CellValues::Bool(v) => {
                    for x in &v[range] {
                        hasher.update([u8::from(*x)]);
                    }
                }
                CellValues::Text(v) => update_text_elems(&mut hasher, &v[range]),
            }
        }
        start = end;
    }

    for meta in &batch.meta {
        update_meta(&mut hasher, meta);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{FieldBatch, RowBatch};
    use crate::jagged::{infer_dtype, pad_batch};
    use crate::schema::{JaggedFieldSpec, JaggedSpec};

    fn padded(rows: Vec<Vec<i64>>, texts: Vec<&str>) -> PaddedBatch {
        let mut jagged = JaggedSpec::default();
        jagged.fields.insert(
            "seq".to_string(),
            JaggedFieldSpec { vary_dims: vec![0] },
        );
        let batch = RowBatch::new(vec![
            ("seq".to_string(), FieldBatch::from_i64_rows(rows)),
            (
                "label".to_string(),
                FieldBatch::from_text(texts.into_iter().map(String::from).collect()),
            ),
        ])
        .expect("batch");
        let dtype = infer_dtype(&batch, &jagged).expect("infer");
        pad_batch(&batch, &dtype, &jagged).expect("pad")
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = padded(vec![vec![1, 2], vec![3]], vec!["x", "y"]);
        let b = padded(vec![vec![1, 2], vec![3]], vec!["x", "y"]);
        let ha = content_hash(&a, DEFAULT_MAX_CHUNK_BYTES);
        assert_eq!(ha.len(), 32);
        assert_eq!(ha, content_hash(&b, DEFAULT_MAX_CHUNK_BYTES));
    }

    #[test]
    fn test_hash_covers_data_and_meta() {
        let base = padded(vec![vec![1, 2], vec![3]], vec!["x", "y"]);
        let h0 = content_hash(&base, DEFAULT_MAX_CHUNK_BYTES);

        let data_changed = padded(vec![vec![1, 9], vec![3]], vec!["x", "y"]);
        assert_ne!(h0, content_hash(&data_changed, DEFAULT_MAX_CHUNK_BYTES));

        let text_changed = padded(vec![vec![1, 2], vec![3]], vec!["x", "z"]);
        assert_ne!(h0, content_hash(&text_changed, DEFAULT_MAX_CHUNK_BYTES));

        // Same padded bytes ([3,0] vs [3,0]) but different true lengths must
        // differ through the meta array.
        let a = padded(vec![vec![3, 0], vec![1, 2]], vec!["x", "y"]);
        let b = padded(vec![vec![3], vec![1, 2]], vec!["x", "y"]);
        assert_ne!(
            content_hash(&a, DEFAULT_MAX_CHUNK_BYTES),
            content_hash(&b, DEFAULT_MAX_CHUNK_BYTES)
        );
    }

    #[test]
    fn test_hash_stable_across_rebatching() {
        let whole = padded(vec![vec![1, 2], vec![3], vec![4, 5]], vec!["a", "b", "c"]);
        let head = whole.slice_rows(0..2);
        let tail = whole.slice_rows(2..3);
        let rejoined = PaddedBatch::concat(&[head, tail]).expect("concat");
        assert_eq!(
            content_hash(&whole, DEFAULT_MAX_CHUNK_BYTES),
            content_hash(&rejoined, DEFAULT_MAX_CHUNK_BYTES)
        );
    }

    #[test]
    fn test_nfc_equivalent_text_hashes_equal() {
        let composed = padded(vec![vec![1]], vec!["caf\u{e9}"]);
        let decomposed = padded(vec![vec![1]], vec!["cafe\u{301}"]);
        assert_eq!(
            content_hash(&composed, DEFAULT_MAX_CHUNK_BYTES),
            content_hash(&decomposed, DEFAULT_MAX_CHUNK_BYTES)
        );
    }

    #[test]
    fn test_signature_independent_of_text_width() {
        let narrow = padded(vec![vec![1]], vec!["ab"]);
        let mut wide = narrow.clone();
        // Widened canonical text width must not perturb the signature.
        let mut fields: Vec<_> = wide.dtype.fields().to_vec();
        fields[1].base = crate::schema::BaseType::Text { width: 128 };
        wide.dtype = Dtype::new(fields);
        assert_eq!(
            schema_signature(&narrow.dtype, &narrow.jagged),
            schema_signature(&wide.dtype, &wide.jagged)
        );
    }

    #[test]
    fn test_small_chunk_bound_still_consumes_all_rows() {
        let batch = padded(
            (0..100).map(|i| vec![i, i + 1]).collect(),
            (0..100).map(|_| "t").collect::<Vec<_>>(),
        );
        let h = content_hash(&batch, 1);
        let changed = {
            let mut rows: Vec<Vec<i64>> = (0..100).map(|i| vec![i, i + 1]).collect();
            rows[99] = vec![0, 0];
            padded(rows, (0..100).map(|_| "t").collect::<Vec<_>>())
        };
        assert_ne!(h, content_hash(&changed, 1));
    }
}
