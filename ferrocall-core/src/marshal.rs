//! # Marshalling
//!
//! The engine only moves bytes. Turning application messages into bytes and back is the job of a
//! [`Marshaller`], invoked synchronously by the client and server drivers.
//!
//! A marshalling failure never reaches the transport: the driver turns it into a local call
//! failure (status `Internal` on the client, an aborted call on the server).
mod json;

pub use json::JsonMarshaller;

use bytes::Bytes;
use std::marker::PhantomData;

#[derive(Debug, thiserror::Error)]
pub enum MarshalError {
    #[error("Failed to encode message: {0}")]
    Encode(String),
    #[error("Failed to decode message: {0}")]
    Decode(String),
}

/// Converts `T` to bytes and back.
pub trait Marshaller<T>: Send + Sync {
    fn serialize(&self, value: &T) -> Result<Bytes, MarshalError>;
    fn deserialize(&self, bytes: &[u8]) -> Result<T, MarshalError>;
}

/// Passes payloads through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesMarshaller;

impl Marshaller<Bytes> for BytesMarshaller {
    fn serialize(&self, value: &Bytes) -> Result<Bytes, MarshalError> {
        Ok(value.clone())
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Bytes, MarshalError> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

/// UTF-8 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringMarshaller;

impl Marshaller<String> for StringMarshaller {
    fn serialize(&self, value: &String) -> Result<Bytes, MarshalError> {
        Ok(Bytes::copy_from_slice(value.as_bytes()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<String, MarshalError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| MarshalError::Decode(e.to_string()))
    }
}

/// Statically typed protobuf messages generated by `prost`.
pub struct ProstMarshaller<M>(PhantomData<fn() -> M>);

impl<M> ProstMarshaller<M> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<M> Default for ProstMarshaller<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Marshaller<M> for ProstMarshaller<M>
where
    M: prost::Message + Default + 'static,
{
    fn serialize(&self, value: &M) -> Result<Bytes, MarshalError> {
        Ok(Bytes::from(value.encode_to_vec()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<M, MarshalError> {
        M::decode(bytes).map_err(|e| MarshalError::Decode(e.to_string()))
    }
}
