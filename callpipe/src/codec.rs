use bytes::BytesMut;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{Payload, Result};

/// Serialization format of request and response blobs.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum Encoding {
    Json,
    #[default]
    MessagePack,
}

/// Two-phase serialization target.
///
/// A codec writes into the growable buffer returned by [`writer`](Self::writer),
/// then [`complete`](Self::complete) moves the written bytes into the result.
/// [`complete_with`](Self::complete_with) accepts bytes that were serialized
/// elsewhere.
#[derive(Debug, Default)]
pub struct SerializationContext {
    buffer: BytesMut,
    result: Payload,
}

impl SerializationContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hint for the final payload size.
    pub fn set_payload_length(&mut self, len: usize) {
        self.buffer.reserve(len);
    }

    pub fn writer(&mut self) -> impl std::io::Write + '_ {
        #[repr(transparent)]
        struct Writer<'a>(&'a mut BytesMut);

        impl std::io::Write for Writer<'_> {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.write_all(buf)?;
                Ok(buf.len())
            }

            fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
                self.0.extend_from_slice(buf);
                Ok(())
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        Writer(&mut self.buffer)
    }

    pub fn complete(&mut self) {
        self.result = self.buffer.split().into();
    }

    pub fn complete_with(&mut self, payload: &[u8]) {
        self.buffer.extend_from_slice(payload);
        self.complete();
    }

    #[must_use]
    pub fn result(&self) -> &Payload {
        &self.result
    }

    #[must_use]
    pub fn into_payload(self) -> Payload {
        self.result
    }
}

impl Encoding {
    /// Serializes `value` into `ctx` and completes it.
    ///
    /// # Errors
    ///
    /// Returns a serialization error from the underlying format.
    pub fn serialize<T: Serialize>(self, value: &T, ctx: &mut SerializationContext) -> Result<()> {
        match self {
            Encoding::Json => serde_json::to_writer(ctx.writer(), value)?,
            Encoding::MessagePack => rmp_serde::encode::write_named(&mut ctx.writer(), value)?,
        }
        ctx.complete();
        Ok(())
    }

    /// # Errors
    ///
    /// Returns a serialization error from the underlying format.
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Payload> {
        let mut ctx = SerializationContext::new();
        self.serialize(value, &mut ctx)?;
        Ok(ctx.into_payload())
    }

    /// Deserializes a blob. An empty blob is treated as a null value.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error from the underlying format.
    pub fn decode<T: DeserializeOwned>(self, payload: &Payload) -> Result<T> {
        if payload.is_empty() {
            // an empty blob is a null value, which lets unit payloads travel without a body.
            Ok(serde_json::from_value(serde_json::Value::Null)?)
        } else {
            match self {
                Encoding::Json => Ok(serde_json::from_slice(payload)?),
                Encoding::MessagePack => Ok(rmp_serde::from_slice(payload)?),
            }
        }
    }
}
