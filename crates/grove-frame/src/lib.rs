#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use grove_columnar::{Column, ColumnError, FloatTarget};
use grove_types::{DType, Scalar};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("column '{column}' has {actual} rows but the table has {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },
    #[error("duplicate column '{0}'")]
    DuplicateColumn(String),
    #[error("column '{0}' not found")]
    ColumnNotFound(String),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

/// Options for [`DataFrame::shrink_dtypes`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShrinkOptions {
    pub float_target: FloatTarget,
}

/// A table: named, ordered columns of equal length.
///
/// Columns live in a map keyed by name; `column_order` carries the observable
/// order. The row count is stored so that zero-column tables keep their shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    row_count: usize,
    columns: BTreeMap<String, Column>,
    column_order: Vec<String>,
}

impl Default for DataFrame {
    fn default() -> Self {
        Self::empty()
    }
}

impl DataFrame {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            row_count: 0,
            columns: BTreeMap::new(),
            column_order: Vec::new(),
        }
    }

    /// Build a table from `(name, column)` pairs in the given order.
    pub fn from_columns(columns: Vec<(String, Column)>) -> Result<Self, FrameError> {
        let row_count = columns.first().map_or(0, |(_, column)| column.len());
        Self::from_columns_with_rows(row_count, columns)
    }

    /// Like [`DataFrame::from_columns`] with an explicit row count, needed
    /// when `columns` may be empty.
    pub fn from_columns_with_rows(
        row_count: usize,
        columns: Vec<(String, Column)>,
    ) -> Result<Self, FrameError> {
        let mut map = BTreeMap::new();
        let mut column_order = Vec::with_capacity(columns.len());
        for (name, column) in columns {
            if column.len() != row_count {
                return Err(FrameError::LengthMismatch {
                    column: name,
                    expected: row_count,
                    actual: column.len(),
                });
            }
            if map.contains_key(&name) {
                return Err(FrameError::DuplicateColumn(name));
            }
            column_order.push(name.clone());
            map.insert(name, column);
        }
        Ok(Self {
            row_count,
            columns: map,
            column_order,
        })
    }

    /// Construct a table from a list of column vectors, inferring dtypes.
    ///
    /// All vectors must have the same length.
    pub fn from_dict(data: Vec<(&str, Vec<Scalar>)>) -> Result<Self, FrameError> {
        let columns = data
            .into_iter()
            .map(|(name, values)| Ok((name.to_owned(), Column::from_values(values)?)))
            .collect::<Result<Vec<_>, FrameError>>()?;
        Self::from_columns(columns)
    }

    /// Return the number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.row_count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    #[must_use]
    pub fn num_columns(&self) -> usize {
        self.column_order.len()
    }

    /// `(rows, columns)`.
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.row_count, self.column_order.len())
    }

    #[must_use]
    pub fn columns(&self) -> &BTreeMap<String, Column> {
        &self.columns
    }

    /// Column names in observable table order.
    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.column_order
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Iterate `(name, column)` in table order.
    pub fn iter_columns(&self) -> impl Iterator<Item = (&str, &Column)> + '_ {
        self.column_order
            .iter()
            .filter_map(|name| self.columns.get(name).map(|column| (name.as_str(), column)))
    }

    #[must_use]
    pub fn dtypes(&self) -> Vec<(&str, DType)> {
        self.iter_columns()
            .map(|(name, column)| (name, column.dtype()))
            .collect()
    }

    #[must_use]
    pub fn null_counts(&self) -> Vec<(&str, usize)> {
        self.iter_columns()
            .map(|(name, column)| (name, column.null_count()))
            .collect()
    }

    /// Deep memory estimate of every column, in bytes.
    #[must_use]
    pub fn memory_usage_bytes(&self) -> usize {
        self.columns.values().map(Column::memory_usage_bytes).sum()
    }

    /// Values of one row in column order.
    #[must_use]
    pub fn row(&self, idx: usize) -> Option<Vec<&Scalar>> {
        if idx >= self.row_count {
            return None;
        }
        self.iter_columns()
            .map(|(_, column)| column.value(idx))
            .collect()
    }

    /// Gather rows by position, preserving column order and dtypes.
    pub fn take_rows(&self, positions: &[usize]) -> Result<Self, FrameError> {
        let columns = self
            .iter_columns()
            .map(|(name, column)| Ok((name.to_owned(), column.take(positions)?)))
            .collect::<Result<Vec<_>, FrameError>>()?;
        Self::from_columns_with_rows(positions.len(), columns)
    }

    /// Return the first `n` rows.
    pub fn head(&self, n: usize) -> Result<Self, FrameError> {
        let take = n.min(self.row_count);
        let positions = (0..take).collect::<Vec<_>>();
        self.take_rows(&positions)
    }

    /// Return a new table with only the specified columns, in order.
    pub fn select_columns(&self, names: &[&str]) -> Result<Self, FrameError> {
        let mut seen = BTreeSet::new();
        let mut columns = Vec::with_capacity(names.len());
        for &name in names {
            let column = self
                .columns
                .get(name)
                .ok_or_else(|| FrameError::ColumnNotFound(name.to_owned()))?;
            if !seen.insert(name) {
                return Err(FrameError::DuplicateColumn(name.to_owned()));
            }
            columns.push((name.to_owned(), column.clone()));
        }
        Self::from_columns_with_rows(self.row_count, columns)
    }

    /// Append or replace a column. A replaced column keeps its position.
    pub fn with_column(&self, name: impl Into<String>, column: Column) -> Result<Self, FrameError> {
        let name = name.into();
        if column.len() != self.row_count {
            return Err(FrameError::LengthMismatch {
                column: name,
                expected: self.row_count,
                actual: column.len(),
            });
        }
        let mut out = self.clone();
        if !out.columns.contains_key(&name) {
            out.column_order.push(name.clone());
        }
        out.columns.insert(name, column);
        Ok(out)
    }

    pub fn drop_column(&self, name: &str) -> Result<Self, FrameError> {
        if !self.columns.contains_key(name) {
            return Err(FrameError::ColumnNotFound(name.to_owned()));
        }
        let mut out = self.clone();
        out.columns.remove(name);
        out.column_order.retain(|column| column != name);
        Ok(out)
    }

    /// Rename columns using a mapping. Unknown sources are an error, and a
    /// rename may not produce duplicate names.
    pub fn rename_columns(&self, mapping: &[(&str, &str)]) -> Result<Self, FrameError> {
        let rename_map: BTreeMap<&str, &str> = mapping.iter().copied().collect();
        if let Some(missing) = rename_map.keys().find(|name| !self.columns.contains_key(**name)) {
            return Err(FrameError::ColumnNotFound((*missing).to_owned()));
        }
        let columns = self
            .iter_columns()
            .map(|(name, column)| {
                let new_name = rename_map.get(name).copied().unwrap_or(name);
                (new_name.to_owned(), column.clone())
            })
            .collect();
        Self::from_columns_with_rows(self.row_count, columns)
    }

    /// Cast one column to a target dtype.
    pub fn astype_column(&self, name: &str, dtype: DType) -> Result<Self, FrameError> {
        let column = self
            .columns
            .get(name)
            .ok_or_else(|| FrameError::ColumnNotFound(name.to_owned()))?;
        self.with_column(name, column.astype(dtype)?)
    }

    /// Narrow every numeric column to the smallest dtype that holds it.
    pub fn shrink_dtypes(&self, options: ShrinkOptions) -> Result<Self, FrameError> {
        let mut out = self.clone();
        out.shrink_dtypes_in_place(options)?;
        Ok(out)
    }

    /// In-place variant of [`DataFrame::shrink_dtypes`]. On error the table
    /// is left unchanged.
    pub fn shrink_dtypes_in_place(&mut self, options: ShrinkOptions) -> Result<(), FrameError> {
        let shrunk = self
            .columns
            .iter()
            .map(|(name, column)| Ok((name.clone(), column.shrink(options.float_target)?)))
            .collect::<Result<BTreeMap<_, _>, FrameError>>()?;
        self.columns = shrunk;
        Ok(())
    }

    /// Same column names in the same order and semantically equal values.
    /// Dtype widths are not compared.
    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        self.row_count == other.row_count
            && self.column_order == other.column_order
            && self.iter_columns().all(|(name, column)| {
                other
                    .column(name)
                    .is_some_and(|theirs| column.semantic_eq(theirs))
            })
    }

    /// Per-column summary: name, non-null count and dtype.
    #[must_use]
    pub fn info(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!(
            "Table: {} rows x {} columns",
            self.row_count,
            self.column_order.len()
        ));
        lines.push(String::new());
        lines.push(format!("{:<20} {:<10} {:<10}", "Column", "Non-Null", "Dtype"));
        lines.push(format!("{:<20} {:<10} {:<10}", "------", "--------", "-----"));
        for (name, column) in self.iter_columns() {
            lines.push(format!(
                "{:<20} {:<10} {}",
                name,
                column.non_null_count(),
                column.dtype()
            ));
        }
        lines.join("\n")
    }
}
