//! Example array functions.
//!
//! - `add(x, y)`: element-wise sum of two float vectors, nulls propagate.
//! - `echoString(s)`: returns its string vector unchanged.
//! - `transposeMatrix(...)`: takes any number of float columns and swaps
//!   rows and columns.

use anyhow::{bail, Context};
use arrow::array::{Array, ArrayRef, Float64Array, StringArray};
use arrow::record_batch::RecordBatch;
use mangoro_core::{
    batch_from_columns, single_column, ArgBatch, ArgSpec, FunctionSignature, Registry, StructDef,
    TypeSpec,
};
use std::sync::Arc;
use tracing::debug;

pub fn add(input: &ArgBatch) -> anyhow::Result<RecordBatch> {
    let x = input.float64("x")?;
    let y = input.float64("y")?;
    if x.len() != y.len() {
        bail!("length mismatch: {} vs {}", x.len(), y.len());
    }

    let sum: Float64Array = x
        .iter()
        .zip(y.iter())
        .map(|(a, b)| Some(a? + b?))
        .collect();
    Ok(single_column("result", Arc::new(sum))?)
}

pub fn add_signature() -> FunctionSignature {
    FunctionSignature::new(
        vec![
            ArgSpec::new("x", TypeSpec::float64().nullable()),
            ArgSpec::new("y", TypeSpec::float64().nullable()),
        ],
        TypeSpec::float64().nullable(),
    )
    .vectorized()
    .with_description("Add two numeric vectors")
}

pub fn echo_string(input: &ArgBatch) -> anyhow::Result<RecordBatch> {
    let s = input.string("s")?;
    let echoed: StringArray = s.iter().collect();
    Ok(single_column("result", Arc::new(echoed))?)
}

pub fn echo_string_signature() -> FunctionSignature {
    FunctionSignature::new(
        vec![ArgSpec::new("s", TypeSpec::string().nullable())],
        TypeSpec::string().nullable(),
    )
    .vectorized()
    .with_description("Echo back a string vector")
}

/// N float columns of M rows become M columns `V1..VM` of N rows.
pub fn transpose_matrix(input: &ArgBatch) -> anyhow::Result<RecordBatch> {
    let n_cols = input.num_columns();
    if n_cols == 0 {
        bail!("expected at least 1 column");
    }
    let n_rows = input.num_rows();
    if n_rows == 0 {
        bail!("expected at least 1 row");
    }

    let columns = (0..n_cols)
        .map(|i| {
            input
                .float64_at(i)
                .with_context(|| format!("column {} is not float64", i))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    debug!("Transposing {}x{} matrix", n_rows, n_cols);

    let names: Vec<String> = (1..=n_rows).map(|r| format!("V{}", r)).collect();
    let transposed: Vec<(&str, ArrayRef)> = names
        .iter()
        .enumerate()
        .map(|(row, name)| {
            let values: Float64Array = columns
                .iter()
                .map(|col| (!col.is_null(row)).then(|| col.value(row)))
                .collect();
            (name.as_str(), Arc::new(values) as ArrayRef)
        })
        .collect();

    Ok(batch_from_columns(transposed)?)
}

pub fn transpose_matrix_signature() -> FunctionSignature {
    // Columns are chosen by the caller on the way in and by the row count
    // on the way out.
    FunctionSignature::new(vec![], TypeSpec::structure(StructDef::default()))
        .variadic()
        .with_description("Transpose a matrix (columns <-> rows)")
}

/// Register `add`, `echoString` and `transposeMatrix`.
pub fn register_builtins(registry: &Registry) -> mangoro_core::Result<()> {
    registry.register("add", add, add_signature())?;
    registry.register("echoString", echo_string, echo_string_signature())?;
    registry.register("transposeMatrix", transpose_matrix, transpose_matrix_signature())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floats(values: Vec<Option<f64>>) -> ArrayRef {
        Arc::new(Float64Array::from(values))
    }

    fn result_floats(batch: &RecordBatch, index: usize) -> Vec<Option<f64>> {
        batch
            .column(index)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap()
            .iter()
            .collect()
    }

    #[test]
    fn test_add_propagates_nulls() {
        let input = batch_from_columns(vec![
            ("x", floats(vec![Some(1.0), None, Some(3.0)])),
            ("y", floats(vec![Some(10.0), Some(20.0), None])),
        ])
        .unwrap();
        let out = add(&input.into()).unwrap();
        assert_eq!(result_floats(&out, 0), vec![Some(11.0), None, None]);
    }

    #[test]
    fn test_add_requires_float_columns() {
        let input = batch_from_columns(vec![
            ("x", Arc::new(StringArray::from(vec!["a"])) as ArrayRef),
            ("y", floats(vec![Some(1.0)])),
        ])
        .unwrap();
        let err = add(&input.into()).unwrap_err();
        assert!(err.to_string().contains("schema mismatch"));
    }

    #[test]
    fn test_echo_string_keeps_nulls() {
        let input = batch_from_columns(vec![(
            "s",
            Arc::new(StringArray::from(vec![Some("a"), None, Some("c")])) as ArrayRef,
        )])
        .unwrap();
        let out = echo_string(&input.into()).unwrap();
        let col = out.column(0).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(col.iter().collect::<Vec<_>>(), vec![Some("a"), None, Some("c")]);
    }

    #[test]
    fn test_transpose_swaps_dimensions() {
        // 3 columns x 2 rows
        let input = batch_from_columns(vec![
            ("a", floats(vec![Some(1.0), Some(2.0)])),
            ("b", floats(vec![Some(3.0), None])),
            ("c", floats(vec![Some(5.0), Some(6.0)])),
        ])
        .unwrap();
        let out = transpose_matrix(&input.into()).unwrap();

        assert_eq!(out.num_columns(), 2);
        assert_eq!(out.num_rows(), 3);
        assert_eq!(out.schema().field(0).name(), "V1");
        assert_eq!(out.schema().field(1).name(), "V2");
        assert_eq!(result_floats(&out, 0), vec![Some(1.0), Some(3.0), Some(5.0)]);
        assert_eq!(result_floats(&out, 1), vec![Some(2.0), None, Some(6.0)]);
    }

    #[test]
    fn test_transpose_rejects_bad_input() {
        let empty = RecordBatch::new_empty(Arc::new(arrow::datatypes::Schema::empty()));
        assert!(transpose_matrix(&empty.into())
            .unwrap_err()
            .to_string()
            .contains("at least 1 column"));

        let no_rows = batch_from_columns(vec![("a", floats(vec![]))]).unwrap();
        assert!(transpose_matrix(&no_rows.into())
            .unwrap_err()
            .to_string()
            .contains("at least 1 row"));

        let strings = batch_from_columns(vec![
            ("a", floats(vec![Some(1.0)])),
            ("b", Arc::new(StringArray::from(vec!["x"])) as ArrayRef),
        ])
        .unwrap();
        assert_eq!(
            transpose_matrix(&strings.into()).unwrap_err().to_string(),
            "column 1 is not float64"
        );
    }

    #[test]
    fn test_register_builtins() {
        let registry = Registry::new();
        register_builtins(&registry).unwrap();
        assert_eq!(registry.len(), 3);
        let transpose = registry.get("transposeMatrix").unwrap();
        assert!(transpose.signature.variadic);
        assert!(transpose.output_schema.fields().is_empty());

        assert!(register_builtins(&registry).is_err());
    }
}
