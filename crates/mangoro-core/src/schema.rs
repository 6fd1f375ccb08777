//! Input and output schema derivation.
//!
//! One call is one logical record: every argument becomes an input column in
//! declaration order, and the return value becomes the output columns.

use crate::types::{resolve, ArgSpec, ScalarKind, TypeSpec};
use crate::{MangoroError, Result};
use arrow::datatypes::{Field, Schema, SchemaRef};
use std::collections::HashSet;
use std::sync::Arc;

/// Column name used when the return type is not a struct.
pub const RESULT_COLUMN: &str = "result";

/// Build the input schema from the declared arguments.
pub fn build_input_schema(args: &[ArgSpec]) -> Result<SchemaRef> {
    let mut seen = HashSet::with_capacity(args.len());
    let mut fields = Vec::with_capacity(args.len());

    for arg in args {
        if !seen.insert(arg.name.as_str()) {
            return Err(MangoroError::InvalidSchema {
                message: format!("duplicate argument name {}", arg.name),
            });
        }
        let data_type = resolve(&arg.type_spec).map_err(|e| MangoroError::InvalidSchema {
            message: format!("invalid type for arg {}: {}", arg.name, e),
        })?;
        fields.push(Field::new(
            &arg.name,
            data_type,
            arg.optional || arg.type_spec.nullable,
        ));
    }

    Ok(Arc::new(Schema::new(fields)))
}

/// Build the output schema from the return type.
///
/// Struct returns are flattened so each struct field is a top-level column. A
/// struct with no fields yields an empty schema, meaning the handler picks
/// its columns at runtime.
pub fn build_output_schema(return_type: &TypeSpec) -> Result<SchemaRef> {
    if return_type.kind == ScalarKind::Struct {
        let def = return_type
            .struct_def
            .as_ref()
            .ok_or_else(|| MangoroError::InvalidSchema {
                message: "struct return type requires a definition".to_string(),
            })?;
        let fields = def.to_fields().map_err(|e| MangoroError::InvalidSchema {
            message: format!("invalid return type: {}", e),
        })?;
        return Ok(Arc::new(Schema::new(fields)));
    }

    let data_type = resolve(return_type).map_err(|e| MangoroError::InvalidSchema {
        message: format!("invalid return type: {}", e),
    })?;
    Ok(Arc::new(Schema::new(vec![Field::new(
        RESULT_COLUMN,
        data_type,
        return_type.nullable,
    )])))
}

/// Whether an output schema leaves the columns up to the handler.
pub fn is_dynamic(schema: &Schema) -> bool {
    schema.fields().is_empty()
}
