//! Handler contract.

use crate::batch::ArgBatch;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;

/// Domain logic bound to one registered function name.
///
/// The input matches the function's input schema (arguments in declaration
/// order); the returned batch must match its output schema. Errors are
/// opaque to the dispatcher and reported to the caller as text.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, input: ArgBatch) -> anyhow::Result<RecordBatch>;
}

#[async_trait]
impl<F> Handler for F
where
    F: Fn(&ArgBatch) -> anyhow::Result<RecordBatch> + Send + Sync + 'static,
{
    async fn call(&self, input: ArgBatch) -> anyhow::Result<RecordBatch> {
        (self)(&input)
    }
}
