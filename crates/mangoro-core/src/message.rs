//! RPC message framing.
//!
//! ```text
//! [kind: u8][name_len: u32 BE][name][err_len: u32 BE][err][payload: rest]
//! ```
//!
//! The transport already delimits messages, so the payload is simply whatever
//! follows the error string. There is no version byte or checksum.

use crate::{MangoroError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Fixed part of every message: kind byte plus the two length headers.
pub const HEADER_LEN: usize = 1 + 4 + 4;

/// Kind byte of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Client → worker: request the catalog. Worker → client: the catalog.
    Manifest,
    /// Client → worker: invoke a function.
    Call,
    /// Worker → client: encoded result batch.
    Result,
    /// Worker → client: failure description.
    Error,
    /// Any other kind byte. Framing accepts it; dispatch rejects it.
    Other(u8),
}

impl MessageKind {
    pub fn as_u8(self) -> u8 {
        match self {
            MessageKind::Manifest => 0,
            MessageKind::Call => 1,
            MessageKind::Result => 2,
            MessageKind::Error => 3,
            MessageKind::Other(b) => b,
        }
    }
}

impl From<u8> for MessageKind {
    fn from(b: u8) -> Self {
        match b {
            0 => MessageKind::Manifest,
            1 => MessageKind::Call,
            2 => MessageKind::Result,
            3 => MessageKind::Error,
            other => MessageKind::Other(other),
        }
    }
}

/// One framed RPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcMessage {
    pub kind: MessageKind,
    /// Function the message is about. Empty for manifest traffic and for
    /// errors raised before the name was known.
    pub func_name: String,
    /// Non-empty only for `Error` messages.
    pub error_message: String,
    /// Encoded columnar batch, or the manifest JSON for manifest replies.
    pub payload: Bytes,
}

impl RpcMessage {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            func_name: String::new(),
            error_message: String::new(),
            payload: Bytes::new(),
        }
    }

    pub fn manifest_request() -> Self {
        Self::new(MessageKind::Manifest)
    }

    pub fn manifest_reply(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::new(MessageKind::Manifest)
        }
    }

    pub fn call(func_name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            func_name: func_name.into(),
            payload: payload.into(),
            ..Self::new(MessageKind::Call)
        }
    }

    pub fn result(func_name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            func_name: func_name.into(),
            payload: payload.into(),
            ..Self::new(MessageKind::Result)
        }
    }

    pub fn error(func_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            func_name: func_name.into(),
            error_message: message.into(),
            ..Self::new(MessageKind::Error)
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == MessageKind::Error
    }

    /// Size of the marshaled message.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.func_name.len() + self.error_message.len() + self.payload.len()
    }

    /// Serialize to wire format.
    ///
    /// Fails with `FrameTooLarge` when the name or error text does not fit
    /// its `u32` length header.
    pub fn marshal(&self) -> Result<Bytes> {
        let name_len = header_len(self.func_name.len())?;
        let error_len = header_len(self.error_message.len())?;

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.kind.as_u8());
        buf.put_u32(name_len);
        buf.put_slice(self.func_name.as_bytes());
        buf.put_u32(error_len);
        buf.put_slice(self.error_message.as_bytes());
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parse wire format. The payload shares the input buffer.
    pub fn unmarshal(data: Bytes) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(MangoroError::Truncated {
                len: data.len(),
                min: HEADER_LEN,
            });
        }

        let kind = MessageKind::from(data[0]);
        let mut pos = 1;

        let (func_name, next) = read_string(&data, pos, "name")?;
        pos = next;
        let (error_message, next) = read_string(&data, pos, "error")?;
        pos = next;

        Ok(Self {
            kind,
            func_name,
            error_message,
            payload: data.slice(pos..),
        })
    }
}

fn header_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| MangoroError::FrameTooLarge {
        size: len,
        max: u32::MAX as usize,
    })
}

/// Read a `u32 BE` length header at `pos` and the string it announces.
/// Returns the string and the position after it.
fn read_string(data: &[u8], pos: usize, field: &'static str) -> Result<(String, usize)> {
    let remaining = data.len() - pos;
    if remaining < 4 {
        return Err(MangoroError::FieldOverrun {
            field,
            declared: 4,
            remaining,
        });
    }
    let declared = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
        as usize;
    let start = pos + 4;
    let remaining = data.len() - start;
    if declared > remaining {
        return Err(MangoroError::FieldOverrun {
            field,
            declared,
            remaining,
        });
    }
    let end = start + declared;
    let value = std::str::from_utf8(&data[start..end])
        .map_err(|_| MangoroError::InvalidUtf8 { field })?
        .to_string();
    Ok((value, end))
}
