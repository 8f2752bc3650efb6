//! Body codec: schema-driven encode/decode of call and message payloads.
//!
//! The core treats bodies as opaque JSON values; the codec is where they
//! are validated against the service's schema and, in buffer mode, packed
//! to MessagePack. The schema compiler itself stays out of scope —
//! validation is an opaque callback table keyed by service and direction.

use bytes::Bytes;
use serde_json::Value;

use crate::error::RpcError;
use crate::service::ServiceDef;

/// Which schema of a service a body is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Req,
    Res,
    Msg,
}

impl BodyKind {
    fn suffix(self) -> &'static str {
        match self {
            BodyKind::Req => "req",
            BodyKind::Res => "res",
            BodyKind::Msg => "msg",
        }
    }
}

/// Body (de)serialization against a service schema.
///
/// All methods honor `validate`; the connection passes
/// `!skip_encode_validate` / `!skip_decode_validate` through.
pub trait Codec: Send + Sync {
    /// Validate and normalize an outbound text-mode body.
    fn encode_body(
        &self,
        service: &ServiceDef,
        kind: BodyKind,
        body: Value,
        validate: bool,
    ) -> Result<Value, RpcError>;

    /// Validate an inbound text-mode body.
    fn decode_body(
        &self,
        service: &ServiceDef,
        kind: BodyKind,
        body: Value,
        validate: bool,
    ) -> Result<Value, RpcError>;

    /// Validate and pack an outbound buffer-mode body.
    fn encode_body_buffer(
        &self,
        service: &ServiceDef,
        kind: BodyKind,
        body: &Value,
        validate: bool,
    ) -> Result<Bytes, RpcError>;

    /// Unpack and validate an inbound buffer-mode body.
    fn decode_body_buffer(
        &self,
        service: &ServiceDef,
        kind: BodyKind,
        body: &[u8],
        validate: bool,
    ) -> Result<Value, RpcError>;
}

/// Validation callback: `Err(reason)` rejects the body.
pub type Validator = std::sync::Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Default codec: JSON bodies, MessagePack in buffer mode, validation via a
/// registered callback table.
///
/// Validator keys are `"<Service>.req"`, `"<Service>.res"` and
/// `"<Service>.msg"`. A service without a registered validator passes.
#[derive(Default)]
pub struct JsonCodec {
    validators: std::sync::RwLock<std::collections::HashMap<String, Validator>>,
}

impl JsonCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validator_key(service: &ServiceDef, kind: BodyKind) -> String {
        format!("{}.{}", service.name, kind.suffix())
    }

    pub fn set_validator(&self, key: impl Into<String>, validator: Validator) {
        self.validators
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.into(), validator);
    }

    fn validate(
        &self,
        service: &ServiceDef,
        kind: BodyKind,
        body: &Value,
    ) -> Result<(), RpcError> {
        let key = Self::validator_key(service, kind);
        let validator = self
            .validators
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&key)
            .cloned();
        if let Some(validator) = validator {
            validator(body).map_err(|reason| {
                RpcError::local(format!("Invalid {} body for {}: {}", kind.suffix(), service.name, reason))
            })?;
        }
        Ok(())
    }
}

impl Codec for JsonCodec {
    fn encode_body(
        &self,
        service: &ServiceDef,
        kind: BodyKind,
        body: Value,
        validate: bool,
    ) -> Result<Value, RpcError> {
        if validate {
            self.validate(service, kind, &body)?;
        }
        Ok(body)
    }

    fn decode_body(
        &self,
        service: &ServiceDef,
        kind: BodyKind,
        body: Value,
        validate: bool,
    ) -> Result<Value, RpcError> {
        if validate {
            self.validate(service, kind, &body)?;
        }
        Ok(body)
    }

    fn encode_body_buffer(
        &self,
        service: &ServiceDef,
        kind: BodyKind,
        body: &Value,
        validate: bool,
    ) -> Result<Bytes, RpcError> {
        if validate {
            self.validate(service, kind, body)?;
        }
        let packed = rmp_serde::to_vec_named(body)
            .map_err(|e| RpcError::local(format!("Failed to pack {} body: {}", service.name, e)))?;
        Ok(Bytes::from(packed))
    }

    fn decode_body_buffer(
        &self,
        service: &ServiceDef,
        kind: BodyKind,
        body: &[u8],
        validate: bool,
    ) -> Result<Value, RpcError> {
        let value: Value = rmp_serde::from_slice(body).map_err(|e| {
            RpcError::local(format!("Failed to unpack {} body: {}", service.name, e))
        })?;
        if validate {
            self.validate(service, kind, &value)?;
        }
        Ok(value)
    }
}
