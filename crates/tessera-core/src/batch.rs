//! Row-batch data model: structured columns of per-row cells.
//!
//! A [`RowBatch`] is the unit handed to the ingest path: an ordered set of
//! named fields, each holding one cell per row. A cell carries its own shape
//! so jagged fields are representable before padding. The batch model is
//! serializable because staged payloads carry it through the durable queue.

use serde::{Deserialize, Serialize};

use crate::keys::assert_safe_name;
use crate::schema::{SchemaError, DEFAULT_TEXT_WIDTH};

/// Scalar kind of a field, before canonical normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarKind {
    /// Signed 64-bit integers.
    Int,
    /// IEEE-754 binary64.
    Real,
    /// Booleans.
    Bool,
    /// UTF-8 text.
    Text,
}

/// Flattened element storage for one cell or one padded column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellValues {
    /// Integer elements.
    Int(Vec<i64>),
    /// Float elements.
    Real(Vec<f64>),
    /// Boolean elements.
    Bool(Vec<bool>),
    /// Text elements.
    Text(Vec<String>),
}

impl CellValues {
    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Int(v) => v.len(),
            Self::Real(v) => v.len(),
            Self::Bool(v) => v.len(),
            Self::Text(v) => v.len(),
        }
    }

    /// True when no elements are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scalar kind of the storage.
    #[must_use]
    pub const fn kind(&self) -> ScalarKind {
        match self {
            Self::Int(_) => ScalarKind::Int,
            Self::Real(_) => ScalarKind::Real,
            Self::Bool(_) => ScalarKind::Bool,
            Self::Text(_) => ScalarKind::Text,
        }
    }

    /// Empty storage of the same kind with reserved capacity.
    #[must_use]
    pub fn empty_like(&self, capacity: usize) -> Self {
        match self {
            Self::Int(_) => Self::Int(Vec::with_capacity(capacity)),
            Self::Real(_) => Self::Real(Vec::with_capacity(capacity)),
            Self::Bool(_) => Self::Bool(Vec::with_capacity(capacity)),
            Self::Text(_) => Self::Text(Vec::with_capacity(capacity)),
        }
    }

    /// Append all elements of `other`, which must be the same kind.
    ///
    /// # Panics
    ///
    /// Panics if the kinds differ; callers uphold kind uniformity.
    pub fn extend_from(&mut self, other: &Self) {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.extend_from_slice(b),
            (Self::Real(a), Self::Real(b)) => a.extend_from_slice(b),
            (Self::Bool(a), Self::Bool(b)) => a.extend_from_slice(b),
            (Self::Text(a), Self::Text(b)) => a.extend_from_slice(b),
            _ => unreachable!("mixed cell kinds"),
        }
    }

    /// Copy of the elements in `range`.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    #[must_use]
    pub fn slice(&self, range: std::ops::Range<usize>) -> Self {
        match self {
            Self::Int(v) => Self::Int(v[range].to_vec()),
            Self::Real(v) => Self::Real(v[range].to_vec()),
            Self::Bool(v) => Self::Bool(v[range].to_vec()),
            Self::Text(v) => Self::Text(v[range].to_vec()),
        }
    }
}

/// One row's value for one field: flattened elements plus the row shape.
/// Scalars have an empty shape and exactly one element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    /// Row-local shape; empty for scalars.
    pub shape: Vec<u32>,
    /// Row-major flattened elements; length is the shape product.
    pub values: CellValues,
}

impl Cell {
    /// Elements this shape implies. The empty product is 1, so scalars have
    /// one element; a zero-length jagged row has none.
    #[must_use]
    pub fn expected_elems(&self) -> usize {
        self.shape.iter().map(|&d| d as usize).product()
    }
}

/// All rows of a single field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldBatch {
    /// One cell per row.
    pub cells: Vec<Cell>,
}

impl FieldBatch {
    /// Scalar f64 rows.
    #[must_use]
    pub fn from_f64(values: Vec<f64>) -> Self {
        Self {
            cells: values
                .into_iter()
                .map(|v| Cell {
                    shape: vec![],
                    values: CellValues::Real(vec![v]),
                })
                .collect(),
        }
    }

    /// Scalar i64 rows.
    #[must_use]
    pub fn from_i64(values: Vec<i64>) -> Self {
        Self {
            cells: values
                .into_iter()
                .map(|v| Cell {
                    shape: vec![],
                    values: CellValues::Int(vec![v]),
                })
                .collect(),
        }
    }

    /// Scalar bool rows.
    #[must_use]
    pub fn from_bool(values: Vec<bool>) -> Self {
        Self {
            cells: values
                .into_iter()
                .map(|v| Cell {
                    shape: vec![],
                    values: CellValues::Bool(vec![v]),
                })
                .collect(),
        }
    }

    /// Scalar text rows.
    #[must_use]
    pub fn from_text(values: Vec<String>) -> Self {
        Self {
            cells: values
                .into_iter()
                .map(|v| Cell {
                    shape: vec![],
                    values: CellValues::Text(vec![v]),
                })
                .collect(),
        }
    }

    /// One-dimensional (possibly jagged) i64 rows.
    #[must_use]
    pub fn from_i64_rows(rows: Vec<Vec<i64>>) -> Self {
        Self {
            cells: rows
                .into_iter()
                .map(|v| Cell {
                    #[allow(clippy::cast_possible_truncation)]
                    shape: vec![v.len() as u32],
                    values: CellValues::Int(v),
                })
                .collect(),
        }
    }

    /// One-dimensional (possibly jagged) f64 rows.
    #[must_use]
    pub fn from_f64_rows(rows: Vec<Vec<f64>>) -> Self {
        Self {
            cells: rows
                .into_iter()
                .map(|v| Cell {
                    #[allow(clippy::cast_possible_truncation)]
                    shape: vec![v.len() as u32],
                    values: CellValues::Real(v),
                })
                .collect(),
        }
    }

    /// Rows from explicit cells (for multi-dimensional fields).
    #[must_use]
    pub fn from_cells(cells: Vec<Cell>) -> Self {
        Self { cells }
    }

    /// Number of rows.
    #[must_use]
    pub fn n_rows(&self) -> usize {
        self.cells.len()
    }
}

/// An ordered set of named field batches with a uniform row count.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RowBatch {
    fields: Vec<(String, FieldBatch)>,
    n_rows: usize,
}

impl RowBatch {
    /// Build and validate a batch: safe names, at least one row, uniform row
    /// counts, per-field kind uniformity, cell element counts matching their
    /// shapes, and text elements within the width cap.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Mismatch`] describing the first violation.
    pub fn new(fields: Vec<(String, FieldBatch)>) -> Result<Self, SchemaError> {
        if fields.is_empty() {
            return Err(SchemaError::Mismatch {
                detail: "batch has no fields".to_string(),
            });
        }
        let n_rows = fields[0].1.n_rows();
        if n_rows == 0 {
            return Err(SchemaError::Mismatch {
                detail: "batch has zero rows".to_string(),
            });
        }
        for (name, batch) in &fields {
            assert_safe_name(name).map_err(|e| SchemaError::Mismatch {
                detail: e.to_string(),
            })?;
            if batch.n_rows() != n_rows {
                return Err(SchemaError::Mismatch {
                    detail: format!(
                        "field {name:?} has {} rows, expected {n_rows}",
                        batch.n_rows()
                    ),
                });
            }
            let kind = batch.cells[0].values.kind();
            for (row, cell) in batch.cells.iter().enumerate() {
                if cell.values.kind() != kind {
                    return Err(SchemaError::Mismatch {
                        detail: format!("field {name:?} row {row} changes kind"),
                    });
                }
                if cell.values.len() != cell.expected_elems() {
                    return Err(SchemaError::Mismatch {
                        detail: format!(
                            "field {name:?} row {row}: {} elements for shape {:?}",
                            cell.values.len(),
                            cell.shape
                        ),
                    });
                }
                if let CellValues::Text(items) = &cell.values {
                    for s in items {
                        if s.len() > DEFAULT_TEXT_WIDTH as usize {
                            return Err(SchemaError::Mismatch {
                                detail: format!(
                                    "field {name:?} text element exceeds {DEFAULT_TEXT_WIDTH} bytes"
                                ),
                            });
                        }
                    }
                }
            }
        }
        Ok(Self { fields, n_rows })
    }

    /// Number of rows.
    #[must_use]
    pub const fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Ordered fields.
    #[must_use]
    pub fn fields(&self) -> &[(String, FieldBatch)] {
        &self.fields
    }

    /// Look up a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldBatch> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, b)| b)
    }

    /// Concatenate batches with identical field sets, preserving row order.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Mismatch`] when the field sets differ.
    pub fn concat(batches: &[Self]) -> Result<Self, SchemaError> {
        let first = batches.first().ok_or_else(|| SchemaError::Mismatch {
            detail: "nothing to concatenate".to_string(),
        })?;
        let names: Vec<&String> = first.fields.iter().map(|(n, _)| n).collect();
        let mut merged: Vec<(String, FieldBatch)> = first
            .fields
            .iter()
            .map(|(n, b)| (n.clone(), b.clone()))
            .collect();
        for batch in &batches[1..] {
            let other: Vec<&String> = batch.fields.iter().map(|(n, _)| n).collect();
            if other != names {
                return Err(SchemaError::Mismatch {
                    detail: "field sets differ across staged chunks".to_string(),
                });
            }
            for (i, (_, b)) in batch.fields.iter().enumerate() {
                merged[i].1.cells.extend(b.cells.iter().cloned());
            }
        }
        Self::new(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_batch_valid() {
        let batch = RowBatch::new(vec![
            ("t".to_string(), FieldBatch::from_f64(vec![1.0, 2.0])),
            ("n".to_string(), FieldBatch::from_i64(vec![1, 2])),
        ])
        .expect("valid batch");
        assert_eq!(batch.n_rows(), 2);
    }

    #[test]
    fn test_row_count_mismatch_rejected() {
        let err = RowBatch::new(vec![
            ("t".to_string(), FieldBatch::from_f64(vec![1.0, 2.0])),
            ("n".to_string(), FieldBatch::from_i64(vec![1])),
        ])
        .expect_err("uneven rows");
        assert!(matches!(err, SchemaError::Mismatch { .. }));
    }

    #[test]
    fn test_empty_batch_rejected() {
        assert!(RowBatch::new(vec![]).is_err());
        assert!(RowBatch::new(vec![("t".to_string(), FieldBatch::from_f64(vec![]))]).is_err());
    }

    #[test]
    fn test_shape_element_agreement_enforced() {
        let bad = FieldBatch::from_cells(vec![Cell {
            shape: vec![3],
            values: CellValues::Int(vec![1, 2]),
        }]);
        let err = RowBatch::new(vec![("seq".to_string(), bad)]).expect_err("bad cell");
        assert!(matches!(err, SchemaError::Mismatch { .. }));
    }

    #[test]
    fn test_concat_preserves_order() {
        let a = RowBatch::new(vec![(
            "seq".to_string(),
            FieldBatch::from_i64_rows(vec![vec![1, 2]]),
        )])
        .expect("a");
        let b = RowBatch::new(vec![(
            "seq".to_string(),
            FieldBatch::from_i64_rows(vec![vec![3], vec![]]),
        )])
        .expect("b");
        let merged = RowBatch::concat(&[a, b]).expect("concat");
        assert_eq!(merged.n_rows(), 3);
        let cells = &merged.field("seq").expect("seq").cells;
        assert_eq!(cells[0].values, CellValues::Int(vec![1, 2]));
        assert_eq!(cells[2].values, CellValues::Int(vec![]));
    }
}
