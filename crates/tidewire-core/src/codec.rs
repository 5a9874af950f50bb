//! Payload codecs for the typed send and receive paths
//!
//! The transport itself carries opaque bytes. A [`PayloadCodec`] turns a
//! value into a byte stream and back; encoding writes into any
//! `std::io::Write` so large values can stream through a pipe without being
//! materialised first.

use std::io;

use serde::{de::DeserializeOwned, Serialize};

use crate::errors::CodecError;

/// Encode values to a byte stream and decode them back
pub trait PayloadCodec: Send + Sync + 'static {
    /// Short codec name used in logs
    fn name(&self) -> &'static str;

    /// Encode `value` into `writer`
    fn encode_into<T, W>(&self, value: &T, writer: W) -> Result<(), CodecError>
    where
        T: Serialize + ?Sized,
        W: io::Write;

    /// Decode a value from a complete payload
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;

    /// Encode `value` into a new buffer
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        self.encode_into(value, &mut out)?;
        Ok(out)
    }
}

/// Compact binary encoding via `bincode`
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl PayloadCodec for BincodeCodec {
    fn name(&self) -> &'static str {
        "bincode"
    }

    fn encode_into<T, W>(&self, value: &T, writer: W) -> Result<(), CodecError>
    where
        T: Serialize + ?Sized,
        W: io::Write,
    {
        bincode::serialize_into(writer, value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        bincode::deserialize(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Self-describing JSON encoding via `serde_json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_into<T, W>(&self, value: &T, writer: W) -> Result<(), CodecError>
    where
        T: Serialize + ?Sized,
        W: io::Write,
    {
        serde_json::to_writer(writer, value).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
