//! Jagged padding: canonical-shape reconciliation, padded columns, and meta
//! arrays.
//!
//! A jagged field declares `vary_dims`, the dimension indices allowed to
//! differ per row. Padding fills every row out to the canonical (maximum)
//! shape with type-defined values — numeric `0`, boolean `false`, text empty
//! — and records the true per-row extents in a meta column: `<field>_len`
//! for one varying dim, `<field>_shape` for several. The meta arrays are part
//! of the content-hash contract.

use unicode_normalization::UnicodeNormalization;

use crate::batch::{CellValues, RowBatch, ScalarKind};
use crate::schema::{
    pick_len_width, pick_shape_width, BaseType, Dtype, FieldSpec, JaggedSpec, MetaKind, MetaWidth,
    SchemaError,
};

/// A fully padded column in canonical layout: `n_rows * elems_per_row`
/// elements, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct PaddedColumn {
    /// The canonical field this column realizes.
    pub spec: FieldSpec,
    /// Flattened padded elements.
    pub values: CellValues,
}

/// A jagged meta column (`<field>_len` or `<field>_shape`).
#[derive(Debug, Clone, PartialEq)]
pub struct MetaColumn {
    /// Meta column name.
    pub name: String,
    /// The data field this column describes.
    pub field: String,
    /// Integer width on the wire.
    pub width: MetaWidth,
    /// Values per row: 1 for `_len`, `k` for `_shape`.
    pub per_row: usize,
    /// Row-major extents.
    pub values: Vec<u32>,
}

/// A canonicalized, padded batch: what the hasher and the part store consume.
#[derive(Debug, Clone, PartialEq)]
pub struct PaddedBatch {
    /// Canonical dtype the columns follow.
    pub dtype: Dtype,
    /// Jagged configuration in force.
    pub jagged: JaggedSpec,
    /// Row count.
    pub n_rows: usize,
    /// Padded data columns, in dtype order.
    pub columns: Vec<PaddedColumn>,
    /// Meta columns for jagged fields, in dtype field order.
    pub meta: Vec<MetaColumn>,
}

impl PaddedBatch {
    /// Approximate in-memory payload size, used for buffer backpressure.
    #[must_use]
    pub fn payload_bytes(&self) -> usize {
        let mut total = 0usize;
        for col in &self.columns {
            total += match &col.values {
                CellValues::Int(v) => v.len() * 8,
                CellValues::Real(v) => v.len() * 8,
                CellValues::Bool(v) => v.len(),
                CellValues::Text(v) => v.iter().map(|s| s.len() + 4).sum(),
            };
        }
        for m in &self.meta {
            total += m.values.len() * 4;
        }
        total
    }

    /// Concatenate batches sharing one canonical dtype, preserving row order.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Mismatch`] when dtypes or jagged specs differ.
    pub fn concat(batches: &[Self]) -> Result<Self, SchemaError> {
        let first = batches.first().ok_or_else(|| SchemaError::Mismatch {
            detail: "nothing to concatenate".to_string(),
        })?;
        let mut out = first.clone();
        for batch in &batches[1..] {
            if batch.dtype != out.dtype || batch.jagged != out.jagged {
                return Err(SchemaError::Mismatch {
                    detail: "padded batches disagree on canonical dtype".to_string(),
                });
            }
            out.n_rows += batch.n_rows;
            for (dst, src) in out.columns.iter_mut().zip(&batch.columns) {
                dst.values.extend_from(&src.values);
            }
            for (dst, src) in out.meta.iter_mut().zip(&batch.meta) {
                dst.values.extend_from_slice(&src.values);
            }
        }
        Ok(out)
    }

    /// Adopt a widened dtype. Only text widths may change; padded data is
    /// untouched because text elements are stored unpadded.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Mismatch`] when anything other than a text
    /// width differs.
    pub fn adopt_dtype(&mut self, dtype: &Dtype) -> Result<(), SchemaError> {
        dtype.check_cast_from(&self.dtype)?;
        for (col, spec) in self.columns.iter_mut().zip(dtype.fields()) {
            col.spec = spec.clone();
        }
        self.dtype = dtype.clone();
        Ok(())
    }

    /// Copy of the rows in `range`.
    ///
    /// # Panics
    ///
    /// Panics if the range exceeds the row count.
    #[must_use]
    pub fn slice_rows(&self, range: std::ops::Range<usize>) -> Self {
        assert!(range.end <= self.n_rows, "row range out of bounds");
        let columns = self
            .columns
            .iter()
            .map(|col| {
                let elems = col.spec.elems_per_row();
                PaddedColumn {
                    spec: col.spec.clone(),
                    values: col.values.slice(range.start * elems..range.end * elems),
                }
            })
            .collect();
        let meta = self
            .meta
            .iter()
            .map(|m| MetaColumn {
                name: m.name.clone(),
                field: m.field.clone(),
                width: m.width,
                per_row: m.per_row,
                values: m.values[range.start * m.per_row..range.end * m.per_row].to_vec(),
            })
            .collect();
        Self {
            dtype: self.dtype.clone(),
            jagged: self.jagged.clone(),
            n_rows: range.len(),
            columns,
            meta,
        }
    }
}

/// Outcome of reconciling a batch against the canonical dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// No canonical dtype yet: lock this one.
    Lock(Dtype),
    /// Batch fits the canonical dtype unchanged.
    Keep(Dtype),
    /// Batch requires widening one or more text fields; the widened dtype
    /// must be persisted atomically with the batch's first part.
    Widen(Dtype),
}

impl ReconcileOutcome {
    /// The dtype the batch should be padded against.
    #[must_use]
    pub fn dtype(&self) -> &Dtype {
        match self {
            Self::Lock(d) | Self::Keep(d) | Self::Widen(d) => d,
        }
    }
}

fn base_for(kind: ScalarKind, text_width: u32) -> BaseType {
    match kind {
        ScalarKind::Int => BaseType::Int64,
        ScalarKind::Real => BaseType::Float64,
        ScalarKind::Bool => BaseType::Bool,
        ScalarKind::Text => BaseType::Text {
            width: text_width.max(1),
        },
    }
}

fn nfc_width(s: &str) -> usize {
    s.nfc().collect::<String>().len()
}

/// Infer the dtype a batch presents: per-field base kind, maximum shape over
/// the varying dims, and maximum NFC UTF-8 width for text fields.
///
/// # Errors
///
/// Returns [`SchemaError::Mismatch`] when rows disagree on rank or on a
/// fixed (non-varying) dimension.
pub fn infer_dtype(batch: &RowBatch, jagged: &JaggedSpec) -> Result<Dtype, SchemaError> {
    let mut fields = Vec::with_capacity(batch.fields().len());
    for (name, field) in batch.fields() {
        let vary: &[u32] = jagged.vary_dims(name).unwrap_or(&[]);
        let rank = field.cells[0].shape.len();
        for &d in vary {
            if d as usize >= rank {
                return Err(SchemaError::Mismatch {
                    detail: format!("field {name:?}: vary dim {d} out of range for rank {rank}"),
                });
            }
        }
        let mut shape = field.cells[0].shape.clone();
        let mut text_width = 0usize;
        for (row, cell) in field.cells.iter().enumerate() {
            if cell.shape.len() != rank {
                return Err(SchemaError::Mismatch {
                    detail: format!("field {name:?} row {row} changes rank"),
                });
            }
            for (dim, (&observed, canon)) in
                cell.shape.iter().zip(shape.iter_mut()).enumerate()
            {
                #[allow(clippy::cast_possible_truncation)]
                if vary.contains(&(dim as u32)) {
                    *canon = (*canon).max(observed);
                } else if observed != *canon {
                    return Err(SchemaError::Mismatch {
                        detail: format!(
                            "field {name:?} row {row}: fixed dim {dim} is {observed}, expected {canon}"
                        ),
                    });
                }
            }
            if let CellValues::Text(items) = &cell.values {
                for s in items {
                    text_width = text_width.max(nfc_width(s));
                }
            }
        }
        #[allow(clippy::cast_possible_truncation)]
        let base = base_for(field.cells[0].values.kind(), text_width as u32);
        fields.push(FieldSpec {
            name: name.clone(),
            base,
            shape,
        });
    }
    Ok(Dtype::new(fields))
}

/// Reconcile a batch against the canonical dtype: lock it on first write,
/// keep it when the batch fits, or widen text fields.
///
/// Jagged fields may present smaller extents than canonical; larger extents
/// after lock are refused with [`SchemaError::ExceedsCanon`]. Fixed
/// dimensions and base kinds must agree exactly.
///
/// # Errors
///
/// Returns [`SchemaError`] on any structural conflict.
pub fn reconcile_dtype(
    canonical: Option<&Dtype>,
    batch: &RowBatch,
    jagged: &JaggedSpec,
) -> Result<ReconcileOutcome, SchemaError> {
    let incoming = infer_dtype(batch, jagged)?;
    let Some(canon) = canonical else {
        jagged.validate_against(&incoming)?;
        return Ok(ReconcileOutcome::Lock(incoming));
    };
    if canon.fields().len() != incoming.fields().len()
        || canon
            .fields()
            .iter()
            .zip(incoming.fields())
            .any(|(a, b)| a.name != b.name)
    {
        return Err(SchemaError::Mismatch {
            detail: "batch field set differs from canonical dtype".to_string(),
        });
    }
    let mut widened = Vec::with_capacity(canon.fields().len());
    let mut changed = false;
    for (c, i) in canon.fields().iter().zip(incoming.fields()) {
        if c.shape.len() != i.shape.len() {
            return Err(SchemaError::Mismatch {
                detail: format!("field {:?} rank differs from canonical", c.name),
            });
        }
        let vary: &[u32] = jagged.vary_dims(&c.name).unwrap_or(&[]);
        for (dim, (&cd, &id)) in c.shape.iter().zip(&i.shape).enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            if vary.contains(&(dim as u32)) {
                if id > cd {
                    return Err(SchemaError::ExceedsCanon {
                        field: c.name.clone(),
                        observed: i.shape.clone(),
                        canonical: c.shape.clone(),
                    });
                }
            } else if id != cd {
                return Err(SchemaError::Mismatch {
                    detail: format!(
                        "field {:?} fixed dim {dim} is {id}, canonical {cd}",
                        c.name
                    ),
                });
            }
        }
        let base = match (c.base, i.base) {
            (BaseType::Int64, BaseType::Int64)
            | (BaseType::Float64, BaseType::Float64)
            | (BaseType::Bool, BaseType::Bool) => c.base,
            (BaseType::Text { width: cw }, BaseType::Text { width: iw }) => {
                if iw > cw {
                    changed = true;
                    BaseType::Text { width: iw }
                } else {
                    c.base
                }
            }
            (cb, ib) => {
                return Err(SchemaError::Mismatch {
                    detail: format!("field {:?} base differs: canonical {cb}, batch {ib}", c.name),
                })
            }
        };
        widened.push(FieldSpec {
            name: c.name.clone(),
            base,
            shape: c.shape.clone(),
        });
    }
    if changed {
        Ok(ReconcileOutcome::Widen(Dtype::new(widened)))
    } else {
        Ok(ReconcileOutcome::Keep(canon.clone()))
    }
}

fn pad_cell<T: Clone>(src: &[T], s_shape: &[u32], c_shape: &[u32], pad: &T, dst: &mut Vec<T>) {
    fn rec<T: Clone>(
        src: &[T],
        s_shape: &[u32],
        c_shape: &[u32],
        dim: usize,
        src_off: usize,
        pad: &T,
        dst: &mut Vec<T>,
    ) {
        if dim == c_shape.len() {
            dst.push(src[src_off].clone());
            return;
        }
        let s_stride: usize = s_shape[dim + 1..].iter().map(|&d| d as usize).product();
        let tail_elems: usize = c_shape[dim + 1..].iter().map(|&d| d as usize).product();
        let sd = s_shape[dim] as usize;
        let cd = c_shape[dim] as usize;
        for i in 0..cd {
            if i < sd {
                rec(src, s_shape, c_shape, dim + 1, src_off + i * s_stride, pad, dst);
            } else {
                dst.extend(std::iter::repeat(pad.clone()).take(tail_elems));
            }
        }
    }
    rec(src, s_shape, c_shape, 0, 0, pad, dst);
}

/// Pad a validated batch to a canonical dtype, producing padded columns and
/// jagged meta arrays. Text elements are NFC-normalized here so every
/// downstream byte (hash, sealed file) sees one normal form.
///
/// # Errors
///
/// Returns [`SchemaError::ExceedsCanon`] when a row exceeds the canonical
/// shape on a varying dim, and [`SchemaError::Mismatch`] on any other
/// disagreement.
pub fn pad_batch(
    batch: &RowBatch,
    dtype: &Dtype,
    jagged: &JaggedSpec,
) -> Result<PaddedBatch, SchemaError> {
    let n_rows = batch.n_rows();
    let mut columns = Vec::with_capacity(dtype.fields().len());
    let mut meta = Vec::new();

    for spec in dtype.fields() {
        let field = batch.field(&spec.name).ok_or_else(|| SchemaError::Mismatch {
            detail: format!("batch is missing field {:?}", spec.name),
        })?;
        let vary: &[u32] = jagged.vary_dims(&spec.name).unwrap_or(&[]);
        let elems = spec.elems_per_row();

        for (row, cell) in field.cells.iter().enumerate() {
            if cell.shape.len() != spec.shape.len() {
                return Err(SchemaError::Mismatch {
                    detail: format!("field {:?} row {row} rank differs", spec.name),
                });
            }
            for (dim, (&observed, &canon)) in cell.shape.iter().zip(&spec.shape).enumerate() {
                #[allow(clippy::cast_possible_truncation)]
                let varies = vary.contains(&(dim as u32));
                if varies && observed > canon {
                    return Err(SchemaError::ExceedsCanon {
                        field: spec.name.clone(),
                        observed: cell.shape.clone(),
                        canonical: spec.shape.clone(),
                    });
                }
                if !varies && observed != canon {
                    return Err(SchemaError::Mismatch {
                        detail: format!(
                            "field {:?} row {row}: fixed dim {dim} is {observed}, canonical {canon}"
                        , spec.name),
                    });
                }
            }
        }

        let values = match spec.base {
            BaseType::Int64 => {
                let mut out = Vec::with_capacity(n_rows * elems);
                for cell in &field.cells {
                    let CellValues::Int(src) = &cell.values else {
                        return Err(kind_mismatch(spec));
                    };
                    pad_cell(src, &cell.shape, &spec.shape, &0i64, &mut out);
                }
                CellValues::Int(out)
            }
            BaseType::Float64 => {
                let mut out = Vec::with_capacity(n_rows * elems);
                for cell in &field.cells {
                    let CellValues::Real(src) = &cell.values else {
                        return Err(kind_mismatch(spec));
                    };
                    pad_cell(src, &cell.shape, &spec.shape, &0f64, &mut out);
                }
                CellValues::Real(out)
            }
            BaseType::Bool => {
                let mut out = Vec::with_capacity(n_rows * elems);
                for cell in &field.cells {
                    let CellValues::Bool(src) = &cell.values else {
                        return Err(kind_mismatch(spec));
                    };
                    pad_cell(src, &cell.shape, &spec.shape, &false, &mut out);
                }
                CellValues::Bool(out)
            }
            BaseType::Text { .. } => {
                let mut out = Vec::with_capacity(n_rows * elems);
                for cell in &field.cells {
                    let CellValues::Text(src) = &cell.values else {
                        return Err(kind_mismatch(spec));
                    };
                    let normalized: Vec<String> =
                        src.iter().map(|s| s.nfc().collect()).collect();
                    pad_cell(&normalized, &cell.shape, &spec.shape, &String::new(), &mut out);
                }
                CellValues::Text(out)
            }
        };
        columns.push(PaddedColumn {
            spec: spec.clone(),
            values,
        });

        if let Some((name, kind)) = jagged.meta_for(&spec.name) {
            let (width, per_row) = match kind {
                MetaKind::Len => {
                    let max = spec.shape[vary[0] as usize];
                    (pick_len_width(max), 1)
                }
                MetaKind::Shape { k } => {
                    let max = vary
                        .iter()
                        .map(|&d| spec.shape[d as usize])
                        .max()
                        .unwrap_or(0);
                    (pick_shape_width(max), k)
                }
            };
            let mut values = Vec::with_capacity(n_rows * per_row);
            for cell in &field.cells {
                for &d in vary {
                    values.push(cell.shape[d as usize]);
                }
            }
            meta.push(MetaColumn {
                name,
                field: spec.name.clone(),
                width,
                per_row,
                values,
            });
        }
    }

    Ok(PaddedBatch {
        dtype: dtype.clone(),
        jagged: jagged.clone(),
        n_rows,
        columns,
        meta,
    })
}

fn kind_mismatch(spec: &FieldSpec) -> SchemaError {
    SchemaError::Mismatch {
        detail: format!("field {:?} cell kind differs from canonical base", spec.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Cell, FieldBatch};
    use crate::schema::JaggedFieldSpec;

    fn seq_jagged() -> JaggedSpec {
        let mut spec = JaggedSpec::default();
        spec.fields.insert(
            "seq".to_string(),
            JaggedFieldSpec { vary_dims: vec![0] },
        );
        spec
    }

    fn seq_batch(rows: Vec<Vec<i64>>) -> RowBatch {
        RowBatch::new(vec![("seq".to_string(), FieldBatch::from_i64_rows(rows))])
            .expect("batch")
    }

    #[test]
    fn test_lock_infers_max_shape() {
        let jagged = seq_jagged();
        let batch = seq_batch(vec![vec![1, 2], vec![1, 2, 3, 4], vec![]]);
        let outcome = reconcile_dtype(None, &batch, &jagged).expect("reconcile");
        let ReconcileOutcome::Lock(dtype) = outcome else {
            panic!("expected lock");
        };
        assert_eq!(dtype.fields()[0].shape, vec![4]);
    }

    #[test]
    fn test_pad_fills_zeros_and_records_lengths() {
        let jagged = seq_jagged();
        let batch = seq_batch(vec![vec![1, 2], vec![1, 2, 3, 4], vec![]]);
        let dtype = infer_dtype(&batch, &jagged).expect("infer");
        let padded = pad_batch(&batch, &dtype, &jagged).expect("pad");
        assert_eq!(padded.n_rows, 3);
        assert_eq!(
            padded.columns[0].values,
            CellValues::Int(vec![1, 2, 0, 0, 1, 2, 3, 4, 0, 0, 0, 0])
        );
        assert_eq!(padded.meta.len(), 1);
        assert_eq!(padded.meta[0].name, "seq_len");
        assert_eq!(padded.meta[0].width, MetaWidth::U16);
        assert_eq!(padded.meta[0].values, vec![2, 4, 0]);
    }

    #[test]
    fn test_overflow_after_lock_refused() {
        let jagged = seq_jagged();
        let first = seq_batch(vec![vec![1, 2, 3]]);
        let dtype = infer_dtype(&first, &jagged).expect("infer");
        let bigger = seq_batch(vec![vec![1, 2, 3, 4, 5]]);
        let err = reconcile_dtype(Some(&dtype), &bigger, &jagged).expect_err("overflow");
        assert!(matches!(err, SchemaError::ExceedsCanon { .. }));
        let err = pad_batch(&bigger, &dtype, &jagged).expect_err("overflow");
        assert!(matches!(err, SchemaError::ExceedsCanon { .. }));
    }

    #[test]
    fn test_fixed_dim_mismatch_rejected() {
        let jagged = JaggedSpec::default();
        let batch = RowBatch::new(vec![(
            "vec3".to_string(),
            FieldBatch::from_cells(vec![
                Cell {
                    shape: vec![3],
                    values: CellValues::Real(vec![1.0, 2.0, 3.0]),
                },
                Cell {
                    shape: vec![2],
                    values: CellValues::Real(vec![1.0, 2.0]),
                },
            ]),
        )])
        .expect("batch");
        let err = infer_dtype(&batch, &jagged).expect_err("ragged without jagged spec");
        assert!(matches!(err, SchemaError::Mismatch { .. }));
    }

    #[test]
    fn test_two_dim_jagged_shape_meta() {
        let mut jagged = JaggedSpec::default();
        jagged.fields.insert(
            "patch".to_string(),
            JaggedFieldSpec {
                vary_dims: vec![0, 1],
            },
        );
        let batch = RowBatch::new(vec![(
            "patch".to_string(),
            FieldBatch::from_cells(vec![
                Cell {
                    shape: vec![2, 2],
                    values: CellValues::Int(vec![1, 2, 3, 4]),
                },
                Cell {
                    shape: vec![1, 3],
                    values: CellValues::Int(vec![5, 6, 7]),
                },
            ]),
        )])
        .expect("batch");
        let dtype = infer_dtype(&batch, &jagged).expect("infer");
        assert_eq!(dtype.fields()[0].shape, vec![2, 3]);
        let padded = pad_batch(&batch, &dtype, &jagged).expect("pad");
        // Row 0: [[1,2,0],[3,4,0]]; row 1: [[5,6,7],[0,0,0]].
        assert_eq!(
            padded.columns[0].values,
            CellValues::Int(vec![1, 2, 0, 3, 4, 0, 5, 6, 7, 0, 0, 0])
        );
        assert_eq!(padded.meta[0].name, "patch_shape");
        assert_eq!(padded.meta[0].per_row, 2);
        assert_eq!(padded.meta[0].values, vec![2, 2, 1, 3]);
    }

    #[test]
    fn test_widening_reported_for_wider_text() {
        let jagged = JaggedSpec::default();
        let first = RowBatch::new(vec![(
            "label".to_string(),
            FieldBatch::from_text(vec!["ab".to_string()]),
        )])
        .expect("batch");
        let dtype = infer_dtype(&first, &jagged).expect("infer");
        let wider = RowBatch::new(vec![(
            "label".to_string(),
            FieldBatch::from_text(vec!["abcdef".to_string()]),
        )])
        .expect("batch");
        let outcome = reconcile_dtype(Some(&dtype), &wider, &jagged).expect("reconcile");
        let ReconcileOutcome::Widen(widened) = outcome else {
            panic!("expected widen");
        };
        assert_eq!(widened.fields()[0].base, BaseType::Text { width: 6 });
    }

    #[test]
    fn test_slice_and_concat_round_trip() {
        let jagged = seq_jagged();
        let batch = seq_batch(vec![vec![1], vec![2, 3], vec![4, 5, 6]]);
        let dtype = infer_dtype(&batch, &jagged).expect("infer");
        let padded = pad_batch(&batch, &dtype, &jagged).expect("pad");
        let head = padded.slice_rows(0..1);
        let tail = padded.slice_rows(1..3);
        assert_eq!(head.n_rows, 1);
        assert_eq!(tail.meta[0].values, vec![2, 3]);
        let rejoined = PaddedBatch::concat(&[head, tail]).expect("concat");
        assert_eq!(rejoined, padded);
    }
}
