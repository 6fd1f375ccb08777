//! Typed view over a validated input batch.
//!
//! By the time a handler sees an [`ArgBatch`] the dispatcher has already
//! checked the batch against the function's input schema. The accessors here
//! still return errors rather than panicking, so a handler registered with a
//! schema that disagrees with its own code fails the call instead of the
//! worker.

use crate::{MangoroError, Result};
use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, StringArray,
};
use arrow::datatypes::{Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use std::sync::Arc;

/// Input batch handed to a handler.
#[derive(Debug, Clone)]
pub struct ArgBatch {
    batch: RecordBatch,
}

impl ArgBatch {
    pub fn new(batch: RecordBatch) -> Self {
        Self { batch }
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn num_columns(&self) -> usize {
        self.batch.num_columns()
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn record_batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn into_inner(self) -> RecordBatch {
        self.batch
    }

    /// Column by argument name.
    pub fn column(&self, name: &str) -> Result<&ArrayRef> {
        self.batch
            .column_by_name(name)
            .ok_or_else(|| MangoroError::SchemaMismatch {
                expected: format!("column {}", name),
                actual: "no such column".to_string(),
            })
    }

    pub fn float64(&self, name: &str) -> Result<&Float64Array> {
        downcast(self.column(name)?, name, "Float64")
    }

    pub fn int32(&self, name: &str) -> Result<&Int32Array> {
        downcast(self.column(name)?, name, "Int32")
    }

    pub fn int64(&self, name: &str) -> Result<&Int64Array> {
        downcast(self.column(name)?, name, "Int64")
    }

    pub fn string(&self, name: &str) -> Result<&StringArray> {
        downcast(self.column(name)?, name, "Utf8")
    }

    pub fn boolean(&self, name: &str) -> Result<&BooleanArray> {
        downcast(self.column(name)?, name, "Boolean")
    }

    /// Float64 column by position, for functions that take caller-defined
    /// columns.
    pub fn float64_at(&self, index: usize) -> Result<&Float64Array> {
        if index >= self.batch.num_columns() {
            return Err(MangoroError::SchemaMismatch {
                expected: format!("column {}", index),
                actual: format!("{} columns", self.batch.num_columns()),
            });
        }
        let name = self.batch.schema_ref().field(index).name().clone();
        downcast(self.batch.column(index), &name, "Float64")
    }

    /// First-row string value, or `None` when the column is empty or null.
    pub fn opt_str(&self, name: &str) -> Result<Option<String>> {
        let col = self.string(name)?;
        if col.is_empty() || col.is_null(0) {
            return Ok(None);
        }
        Ok(Some(col.value(0).to_string()))
    }

    /// First-row string value with a fallback.
    pub fn str_or(&self, name: &str, default: &str) -> Result<String> {
        Ok(self.opt_str(name)?.unwrap_or_else(|| default.to_string()))
    }

    /// First-row boolean value with a fallback.
    pub fn bool_or(&self, name: &str, default: bool) -> Result<bool> {
        let col = self.boolean(name)?;
        if col.is_empty() || col.is_null(0) {
            return Ok(default);
        }
        Ok(col.value(0))
    }
}

impl From<RecordBatch> for ArgBatch {
    fn from(batch: RecordBatch) -> Self {
        Self::new(batch)
    }
}

fn downcast<'a, T: Array + 'static>(col: &'a ArrayRef, name: &str, expected: &str) -> Result<&'a T> {
    col.as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| MangoroError::SchemaMismatch {
            expected: format!("{}: {}", name, expected),
            actual: format!("{}: {}", name, col.data_type()),
        })
}

/// Build a batch from named columns of equal length.
pub fn batch_from_columns(columns: Vec<(&str, ArrayRef)>) -> Result<RecordBatch> {
    let fields: Vec<Field> = columns
        .iter()
        .map(|(name, array)| Field::new(*name, array.data_type().clone(), true))
        .collect();
    let arrays: Vec<ArrayRef> = columns.into_iter().map(|(_, array)| array).collect();
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).map_err(|e| {
        MangoroError::EncodeFailed {
            message: e.to_string(),
        }
    })
}

/// Build the usual single-column result batch.
pub fn single_column(name: &str, array: ArrayRef) -> Result<RecordBatch> {
    batch_from_columns(vec![(name, array)])
}
