//! Function registry.
//!
//! Maps names to handlers together with their signature and the input/output
//! schemas derived from it. Entries are only ever added, normally all of them
//! during startup before the dispatcher begins serving.
//!
//! # Thread Safety
//!
//! A single `RwLock` guards the map. `get`, `list` and `manifest` share it;
//! `register` takes it exclusively, so a manifest never shows a function
//! whose schemas are still being built.

use crate::handler::Handler;
use crate::schema::{build_input_schema, build_output_schema};
use crate::types::FunctionSignature;
use crate::{MangoroError, Result};
use arrow::datatypes::SchemaRef;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// A function as stored in the registry.
pub struct RegisteredFunction {
    pub name: String,
    pub handler: Arc<dyn Handler>,
    pub input_schema: SchemaRef,
    pub output_schema: SchemaRef,
    pub signature: FunctionSignature,
}

impl fmt::Debug for RegisteredFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredFunction")
            .field("name", &self.name)
            .field("input_schema", &self.input_schema)
            .field("output_schema", &self.output_schema)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// Thread-safe name → function store.
#[derive(Default)]
pub struct Registry {
    functions: RwLock<HashMap<String, Arc<RegisteredFunction>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`.
    ///
    /// Fails with `DuplicateName` if the name is taken (the existing entry is
    /// kept) and with `InvalidSchema` if the signature cannot be turned into
    /// schemas.
    pub fn register(
        &self,
        name: impl Into<String>,
        handler: impl Handler,
        signature: FunctionSignature,
    ) -> Result<()> {
        self.register_shared(name, Arc::new(handler), signature)
    }

    /// Register an already shared handler.
    pub fn register_shared(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn Handler>,
        signature: FunctionSignature,
    ) -> Result<()> {
        let name = name.into();
        let mut functions = self.write()?;

        if functions.contains_key(&name) {
            return Err(MangoroError::DuplicateName { name });
        }

        let input_schema = build_input_schema(&signature.args)?;
        let output_schema = build_output_schema(&signature.return_type)?;

        debug!(
            "Registering {} ({} input columns, {} output columns)",
            name,
            input_schema.fields().len(),
            output_schema.fields().len()
        );

        functions.insert(
            name.clone(),
            Arc::new(RegisteredFunction {
                name: name.clone(),
                handler,
                input_schema,
                output_schema,
                signature,
            }),
        );
        info!("Registered function {}", name);
        Ok(())
    }

    /// Look up a function.
    pub fn get(&self, name: &str) -> Result<Arc<RegisteredFunction>> {
        self.read()?
            .get(name)
            .cloned()
            .ok_or_else(|| MangoroError::UnknownFunction {
                name: name.to_string(),
            })
    }

    /// Names of all registered functions, in no particular order.
    pub fn list(&self) -> Result<Vec<String>> {
        Ok(self.read()?.keys().cloned().collect())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().map(|f| f.contains_key(name)).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.read().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialized catalog `{name: signature}` for client discovery.
    ///
    /// Taken under one read lock, so it is consistent with respect to
    /// concurrent registration. Keys are sorted.
    pub fn manifest(&self) -> Result<Bytes> {
        let functions = self.read()?;
        let manifest: BTreeMap<&str, &FunctionSignature> = functions
            .iter()
            .map(|(name, f)| (name.as_str(), &f.signature))
            .collect();
        Ok(Bytes::from(serde_json::to_vec(&manifest)?))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Arc<RegisteredFunction>>>> {
        self.functions
            .read()
            .map_err(|_| MangoroError::LockPoisoned {
                resource: "registry",
            })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Arc<RegisteredFunction>>>> {
        self.functions
            .write()
            .map_err(|_| MangoroError::LockPoisoned {
                resource: "registry",
            })
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = self.list().unwrap_or_default();
        names.sort();
        f.debug_struct("Registry").field("functions", &names).finish()
    }
}

/// Parse a manifest payload back into signatures.
pub fn parse_manifest(payload: &[u8]) -> Result<BTreeMap<String, FunctionSignature>> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{single_column, ArgBatch};
    use crate::types::{ArgSpec, StructDef, TypeSpec};
    use arrow::array::{Array, ArrayRef, Float64Array};
    use arrow::record_batch::RecordBatch;

    fn constant(value: f64) -> impl Fn(&ArgBatch) -> anyhow::Result<RecordBatch> {
        move |_input: &ArgBatch| {
            let array: ArrayRef = Arc::new(Float64Array::from(vec![value]));
            Ok(single_column("result", array)?)
        }
    }

    fn unary_sig() -> FunctionSignature {
        FunctionSignature::new(vec![ArgSpec::new("x", TypeSpec::float64())], TypeSpec::float64())
    }

    #[test]
    fn test_register_and_get() {
        let registry = Registry::new();
        registry.register("test_add", constant(1.0), unary_sig()).unwrap();

        let f = registry.get("test_add").unwrap();
        assert_eq!(f.name, "test_add");
        assert_eq!(f.input_schema.fields().len(), 1);
        assert_eq!(f.output_schema.field(0).name(), "result");
        assert_eq!(registry.list().unwrap(), vec!["test_add".to_string()]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_unknown_is_error() {
        let registry = Registry::new();
        assert!(matches!(
            registry.get("missing"),
            Err(MangoroError::UnknownFunction { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_registration_keeps_first() {
        let registry = Registry::new();
        registry.register("f", constant(1.0), unary_sig()).unwrap();

        let err = registry.register("f", constant(2.0), unary_sig()).unwrap_err();
        assert!(matches!(err, MangoroError::DuplicateName { ref name } if name == "f"));

        let f = registry.get("f").unwrap();
        let input = single_column("x", Arc::new(Float64Array::from(vec![0.0]))).unwrap();
        let out = f.handler.call(ArgBatch::new(input)).await.unwrap();
        let col = out.column(0).as_any().downcast_ref::<Float64Array>().unwrap();
        assert_eq!(col.value(0), 1.0);
    }

    #[test]
    fn test_invalid_signature_is_not_stored() {
        let registry = Registry::new();
        let sig = FunctionSignature::new(
            vec![
                ArgSpec::new("x", TypeSpec::float64()),
                ArgSpec::new("x", TypeSpec::float64()),
            ],
            TypeSpec::float64(),
        );
        let err = registry.register("bad", constant(0.0), sig).unwrap_err();
        assert!(matches!(err, MangoroError::InvalidSchema { .. }));
        assert!(!registry.contains("bad"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_manifest_lists_exactly_registered_functions() {
        let sig_a = unary_sig().vectorized();
        let sig_b = FunctionSignature::new(vec![], TypeSpec::string()).with_description("b");
        let sig_c = FunctionSignature::new(
            vec![ArgSpec::new("s", TypeSpec::string().nullable())],
            TypeSpec::structure(StructDef::default()),
        );

        for order in [["A", "B", "C"], ["C", "A", "B"]] {
            let registry = Registry::new();
            for name in order {
                let sig = match name {
                    "A" => sig_a.clone(),
                    "B" => sig_b.clone(),
                    _ => sig_c.clone(),
                };
                registry.register(name, constant(0.0), sig).unwrap();
            }

            let manifest = parse_manifest(&registry.manifest().unwrap()).unwrap();
            assert_eq!(manifest.len(), 3);
            assert_eq!(manifest["A"], sig_a);
            assert_eq!(manifest["B"], sig_b);
            assert_eq!(manifest["C"], sig_c);
        }
    }

    #[test]
    fn test_manifest_of_empty_registry() {
        let registry = Registry::new();
        assert_eq!(registry.manifest().unwrap().as_ref(), b"{}");
    }

    #[test]
    fn test_concurrent_readers_during_registration() {
        let registry = Arc::new(Registry::new());
        let writer = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    registry
                        .register(format!("f{i}"), constant(i as f64), unary_sig())
                        .unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let manifest = parse_manifest(&registry.manifest().unwrap()).unwrap();
                        for sig in manifest.values() {
                            assert_eq!(sig, &unary_sig());
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(registry.len(), 50);
    }
}
