//! Language-agnostic type specifications for function arguments and returns.
//!
//! A [`TypeSpec`] is what a function author writes down; [`resolve`] turns it
//! into the Arrow column type that actually travels on the wire. The serde
//! representation of these types is the manifest format clients parse, so the
//! field names are part of the protocol.

use crate::{MangoroError, Result};
use arrow::datatypes::{DataType, Field, Fields};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Concrete column type a [`TypeSpec`] resolves to.
pub type ColumnType = DataType;

/// Scalar and container kinds understood by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ScalarKind {
    Int32,
    Int64,
    Float64,
    String,
    Bool,
    List,
    Struct,
    /// A kind name this build does not understand. Kept so a manifest can be
    /// parsed; resolving it fails.
    Unknown(String),
}

impl ScalarKind {
    pub fn as_str(&self) -> &str {
        match self {
            ScalarKind::Int32 => "int32",
            ScalarKind::Int64 => "int64",
            ScalarKind::Float64 => "float64",
            ScalarKind::String => "string",
            ScalarKind::Bool => "bool",
            ScalarKind::List => "list",
            ScalarKind::Struct => "struct",
            ScalarKind::Unknown(name) => name,
        }
    }
}

impl From<String> for ScalarKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "int32" => ScalarKind::Int32,
            "int64" => ScalarKind::Int64,
            "float64" => ScalarKind::Float64,
            "string" => ScalarKind::String,
            "bool" => ScalarKind::Bool,
            "list" => ScalarKind::List,
            "struct" => ScalarKind::Struct,
            _ => ScalarKind::Unknown(s),
        }
    }
}

impl From<ScalarKind> for String {
    fn from(kind: ScalarKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of an argument, return value or struct field.
///
/// `Struct` carries its [`StructDef`] and `List` carries its element type;
/// a container kind without its nested definition does not resolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TypeSpec {
    #[serde(rename = "Type")]
    pub kind: ScalarKind,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub struct_def: Option<StructDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<Box<TypeSpec>>,
}

impl TypeSpec {
    fn scalar(kind: ScalarKind) -> Self {
        Self {
            kind,
            nullable: false,
            struct_def: None,
            element: None,
        }
    }

    pub fn int32() -> Self {
        Self::scalar(ScalarKind::Int32)
    }

    pub fn int64() -> Self {
        Self::scalar(ScalarKind::Int64)
    }

    pub fn float64() -> Self {
        Self::scalar(ScalarKind::Float64)
    }

    pub fn string() -> Self {
        Self::scalar(ScalarKind::String)
    }

    pub fn bool() -> Self {
        Self::scalar(ScalarKind::Bool)
    }

    pub fn list(element: TypeSpec) -> Self {
        Self {
            element: Some(Box::new(element)),
            ..Self::scalar(ScalarKind::List)
        }
    }

    pub fn structure(def: StructDef) -> Self {
        Self {
            struct_def: Some(def),
            ..Self::scalar(ScalarKind::Struct)
        }
    }

    /// Mark the type as accepting nulls.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Resolve to the concrete column type.
    pub fn resolve(&self) -> Result<ColumnType> {
        resolve(self)
    }
}

/// A named field inside a struct type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "Type")]
    pub type_spec: TypeSpec,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, type_spec: TypeSpec) -> Self {
        Self {
            name: name.into(),
            type_spec,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    fn to_field(&self) -> Result<Field> {
        let data_type = resolve(&self.type_spec).map_err(|e| MangoroError::InvalidType {
            message: format!("field {}: {}", self.name, e),
        })?;
        let mut field = Field::new(&self.name, data_type, self.type_spec.nullable);
        if !self.metadata.is_empty() {
            field = field.with_metadata(
                self.metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<HashMap<_, _>>(),
            );
        }
        Ok(field)
    }
}

/// Ordered field list of a struct type. Field names are unique.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StructDef {
    #[serde(default)]
    pub fields: Vec<FieldDef>,
}

impl StructDef {
    pub fn new(fields: Vec<FieldDef>) -> Self {
        Self { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Resolve every field, rejecting duplicate names.
    pub fn to_fields(&self) -> Result<Fields> {
        let mut seen = HashSet::with_capacity(self.fields.len());
        let mut fields = Vec::with_capacity(self.fields.len());
        for def in &self.fields {
            if !seen.insert(def.name.as_str()) {
                return Err(MangoroError::InvalidType {
                    message: format!("duplicate struct field {}", def.name),
                });
            }
            fields.push(def.to_field()?);
        }
        Ok(Fields::from(fields))
    }
}

/// Declaration of one function argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArgSpec {
    pub name: String,
    #[serde(rename = "Type")]
    pub type_spec: TypeSpec,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl ArgSpec {
    pub fn new(name: impl Into<String>, type_spec: TypeSpec) -> Self {
        Self {
            name: name.into(),
            type_spec,
            optional: false,
            default: None,
        }
    }

    /// Mark the argument optional, with the value a client should use when
    /// the caller leaves it out.
    pub fn optional(mut self, default: Option<serde_json::Value>) -> Self {
        self.optional = true;
        self.default = default;
        self
    }
}

/// Full signature of a registered function, as published in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FunctionSignature {
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    pub return_type: TypeSpec,
    #[serde(default)]
    pub vectorized: bool,
    /// Accepts whatever columns the caller sends instead of `args`.
    #[serde(default)]
    pub variadic: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl FunctionSignature {
    pub fn new(args: Vec<ArgSpec>, return_type: TypeSpec) -> Self {
        Self {
            args,
            return_type,
            vectorized: false,
            variadic: false,
            metadata: BTreeMap::new(),
        }
    }

    pub fn vectorized(mut self) -> Self {
        self.vectorized = true;
        self
    }

    pub fn variadic(mut self) -> Self {
        self.variadic = true;
        self
    }

    pub fn with_description(self, description: impl Into<String>) -> Self {
        self.with_metadata("description", description)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Resolve a [`TypeSpec`] into its Arrow column type.
pub fn resolve(spec: &TypeSpec) -> Result<ColumnType> {
    match &spec.kind {
        ScalarKind::Int32 => Ok(DataType::Int32),
        ScalarKind::Int64 => Ok(DataType::Int64),
        ScalarKind::Float64 => Ok(DataType::Float64),
        ScalarKind::String => Ok(DataType::Utf8),
        ScalarKind::Bool => Ok(DataType::Boolean),
        ScalarKind::List => {
            let element = spec
                .element
                .as_deref()
                .ok_or_else(|| MangoroError::InvalidType {
                    message: "list type requires an element type".to_string(),
                })?;
            let item = resolve(element)?;
            Ok(DataType::List(Arc::new(Field::new(
                "item",
                item,
                element.nullable,
            ))))
        }
        ScalarKind::Struct => {
            let def = spec
                .struct_def
                .as_ref()
                .ok_or_else(|| MangoroError::InvalidType {
                    message: "struct type requires a definition".to_string(),
                })?;
            Ok(DataType::Struct(def.to_fields()?))
        }
        ScalarKind::Unknown(name) => Err(MangoroError::InvalidType {
            message: format!("unknown type: {}", name),
        }),
    }
}
