//! Columnar batch encoding.
//!
//! The dispatcher only needs "bytes in, batch out" and the reverse, so the
//! physical format sits behind [`Codec`]. [`ArrowIpcCodec`] speaks the Arrow
//! IPC stream format, one record batch per message.

use crate::{MangoroError, Result};
use arrow::datatypes::{Schema, SchemaRef};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use std::io::Cursor;
use std::sync::Arc;

/// Encode and decode columnar batches.
pub trait Codec: Send + Sync + 'static {
    /// Serialize a batch.
    fn encode(&self, batch: &RecordBatch) -> Result<Bytes>;

    /// Deserialize a batch without checking its columns.
    fn decode_any(&self, data: &[u8]) -> Result<RecordBatch>;

    /// Deserialize a batch and check it against `expected`.
    ///
    /// An empty payload is accepted only when `expected` has no columns, and
    /// decodes to an empty batch of that schema.
    fn decode(&self, data: &[u8], expected: &SchemaRef) -> Result<RecordBatch> {
        if data.is_empty() {
            if expected.fields().is_empty() {
                return Ok(RecordBatch::new_empty(expected.clone()));
            }
            return Err(MangoroError::DecodeFailed {
                message: "empty payload".to_string(),
            });
        }
        let batch = self.decode_any(data)?;
        check_columns(&batch, expected)?;
        Ok(batch)
    }
}

/// Arrow IPC stream codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArrowIpcCodec;

impl ArrowIpcCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for ArrowIpcCodec {
    fn encode(&self, batch: &RecordBatch) -> Result<Bytes> {
        let mut buf = Vec::new();
        {
            let mut writer = StreamWriter::try_new(&mut buf, &batch.schema()).map_err(|e| {
                MangoroError::EncodeFailed {
                    message: e.to_string(),
                }
            })?;
            writer.write(batch).map_err(|e| MangoroError::EncodeFailed {
                message: e.to_string(),
            })?;
            writer.finish().map_err(|e| MangoroError::EncodeFailed {
                message: e.to_string(),
            })?;
        }
        Ok(Bytes::from(buf))
    }

    fn decode_any(&self, data: &[u8]) -> Result<RecordBatch> {
        if data.is_empty() {
            return Ok(RecordBatch::new_empty(Arc::new(Schema::empty())));
        }
        let mut reader =
            StreamReader::try_new(Cursor::new(data), None).map_err(|e| MangoroError::DecodeFailed {
                message: format!("failed to open IPC stream: {}", e),
            })?;
        match reader.next() {
            Some(Ok(batch)) => Ok(batch),
            Some(Err(e)) => Err(MangoroError::DecodeFailed {
                message: format!("failed to read IPC batch: {}", e),
            }),
            None => Ok(RecordBatch::new_empty(reader.schema())),
        }
    }
}

/// Check that `batch` has exactly the columns of `expected`, by name and
/// type. Nullability is not compared.
pub fn check_columns(batch: &RecordBatch, expected: &Schema) -> Result<()> {
    let actual = batch.schema();
    let matches = actual.fields().len() == expected.fields().len()
        && actual
            .fields()
            .iter()
            .zip(expected.fields().iter())
            .all(|(a, e)| a.name() == e.name() && a.data_type().equals_datatype(e.data_type()));

    if matches {
        Ok(())
    } else {
        Err(MangoroError::SchemaMismatch {
            expected: describe(expected),
            actual: describe(&actual),
        })
    }
}

/// Output check: an empty expected schema means the handler chooses its own
/// columns.
pub fn ensure_schema(batch: &RecordBatch, expected: &Schema) -> Result<()> {
    if crate::schema::is_dynamic(expected) {
        return Ok(());
    }
    check_columns(batch, expected)
}

fn describe(schema: &Schema) -> String {
    let cols: Vec<String> = schema
        .fields()
        .iter()
        .map(|f| format!("{}: {}", f.name(), f.data_type()))
        .collect();
    format!("[{}]", cols.join(", "))
}
