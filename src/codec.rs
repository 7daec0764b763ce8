//! Codec: the pluggable serialization boundary between typed Rust values and
//! the opaque [`Payload`] strings that cross the engine boundary

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::payload::Payload;

/// Errors a codec can report
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode value: {0}")]
    Encode(#[source] anyhow::Error),

    #[error("failed to decode value: {0}")]
    Decode(#[source] anyhow::Error),
}

/// Converts typed values to and from the opaque wire [`Payload`]
///
/// The engine never inspects payload contents; every encode/decode happens
/// at the edges (activity executor input/output, orchestration context
/// input/output). Implementations must be side-effect free and must treat
/// `None`/absent values as [`Payload::null`].
pub trait Codec: Send + Sync {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Payload, CodecError>;
    fn decode<T: DeserializeOwned>(&self, payload: &Payload) -> Result<T, CodecError>;
}

/// Async extension of [`Codec`], for hosts that externalize large payloads
/// (e.g. spilling to blob storage and encoding a pointer instead)
///
/// Default methods just delegate to the sync trait, so any `Codec` gets an
/// `AsyncCodec` impl for free; only a host with genuinely async encode/decode
/// needs to override these.
#[async_trait]
pub trait AsyncCodec: Codec {
    async fn encode_async<T: Serialize + Sync>(&self, value: &T) -> Result<Payload, CodecError> {
        self.encode(value)
    }

    async fn decode_async<T: DeserializeOwned>(&self, payload: &Payload) -> Result<T, CodecError> {
        self.decode(payload)
    }
}

impl<C: Codec + ?Sized> AsyncCodec for C {}

/// The default codec: JSON via `serde_json`, matching the teacher's wire
/// format for workflow/activity payloads
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Payload, CodecError> {
        let raw = serde_json::to_string(value).map_err(|e| CodecError::Encode(e.into()))?;
        Ok(Payload::from_raw(Some(raw)))
    }

    fn decode<T: DeserializeOwned>(&self, payload: &Payload) -> Result<T, CodecError> {
        match payload.as_raw() {
            Some(raw) => serde_json::from_str(raw).map_err(|e| CodecError::Decode(e.into())),
            None => serde_json::from_value(serde_json::Value::Null)
                .map_err(|e| CodecError::Decode(e.into())),
        }
    }
}

/// A type-erased handle to a codec, cloneable and shareable across threads
///
/// Most callers hold an `Arc<dyn Codec>` directly; this wrapper exists for
/// contexts (the registry, the context builder) that want a concrete,
/// `Clone`-able field without naming the trait object type everywhere.
#[derive(Clone)]
pub struct DynCodec(std::sync::Arc<dyn Codec>);

impl DynCodec {
    pub fn new(codec: impl Codec + 'static) -> Self {
        Self(std::sync::Arc::new(codec))
    }
}

impl Default for DynCodec {
    fn default() -> Self {
        Self::new(JsonCodec)
    }
}

impl std::ops::Deref for DynCodec {
    type Target = dyn Codec;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

/// A typed view over a [`Codec`], binding the `T` at the call site so encode
/// callers don't repeat turbofish noise
pub struct Typed<T> {
    _marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> Typed<T> {
    pub fn encode(codec: &dyn Codec, value: &T) -> Result<Payload, CodecError> {
        codec.encode(value)
    }

    pub fn decode(codec: &dyn Codec, payload: &Payload) -> Result<T, CodecError> {
        codec.decode(payload)
    }
}
