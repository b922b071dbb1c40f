//! Type-erased message envelopes and their serializable form.
//!
//! Executors exchange values of arbitrary types; routing and edge evaluation
//! operate on the message's runtime type. [`AnyMessage`] is the in-process
//! envelope: the value behind `Arc<dyn Any>` plus its captured `TypeId` and
//! type name, with explicit downcast-or-fail access. [`PortableMessage`] is
//! the serialized form used when messages cross the checkpoint boundary, and
//! [`MessageCodecs`] bridges the two for registered types.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;

/// A type-erased message flowing through the workflow graph.
///
/// Cloning is cheap (the payload is shared behind an `Arc`).
#[derive(Clone)]
pub struct AnyMessage {
    value: Arc<dyn Any + Send + Sync>,
    type_id: TypeId,
    type_name: &'static str,
}

impl AnyMessage {
    /// Wrap a value in an envelope, capturing its runtime type.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Wrap an already-shared value without copying it.
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self {
            value,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// The runtime type id of the wrapped value.
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// The type name captured at wrap time.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Check whether the wrapped value is of type `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// Downcast to a shared `T`, or `None` on type mismatch.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.value).downcast::<T>().ok()
    }

    /// Downcast to a shared `T`, failing with a [`WorkflowError::TypeMismatch`]
    /// naming both types.
    pub fn downcast_or_err<T: Any + Send + Sync>(&self) -> Result<Arc<T>, WorkflowError> {
        self.downcast::<T>().ok_or_else(|| {
            WorkflowError::type_mismatch(std::any::type_name::<T>(), self.type_name)
        })
    }
}

impl fmt::Debug for AnyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyMessage")
            .field("type", &self.type_name)
            .finish()
    }
}

/// The serialized form of a message, tagged with its type name.
///
/// Only messages whose types are registered in [`MessageCodecs`] can take
/// this form; rehydration goes back through the same registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortableMessage {
    pub type_name: String,
    pub data: serde_json::Value,
}

type EncodeFn = Arc<dyn Fn(&AnyMessage) -> Result<serde_json::Value, WorkflowError> + Send + Sync>;
type DecodeFn = Arc<dyn Fn(&serde_json::Value) -> Result<AnyMessage, WorkflowError> + Send + Sync>;

struct Codec {
    type_name: &'static str,
    encode: EncodeFn,
    decode: DecodeFn,
}

/// Registry of message types that may cross the checkpoint boundary.
///
/// Populated at graph-build time via
/// [`crate::workflow::WorkflowBuilder::register_message`]; immutable after
/// `build()`.
#[derive(Default)]
pub struct MessageCodecs {
    codecs: Vec<Codec>,
    by_type: HashMap<TypeId, usize>,
    by_name: HashMap<&'static str, usize>,
}

impl MessageCodecs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` for portable encoding. Re-registering is a no-op.
    pub fn register<T>(&mut self)
    where
        T: Any + Send + Sync + Serialize + DeserializeOwned,
    {
        let type_id = TypeId::of::<T>();
        if self.by_type.contains_key(&type_id) {
            return;
        }
        let type_name = std::any::type_name::<T>();
        let encode: EncodeFn = Arc::new(|message: &AnyMessage| {
            let value = message.downcast_or_err::<T>()?;
            serde_json::to_value(&*value)
                .map_err(|e| WorkflowError::checkpoint(format!("encode {}: {}", message.type_name(), e)))
        });
        let decode: DecodeFn = Arc::new(move |data: &serde_json::Value| {
            let value: T = serde_json::from_value(data.clone())
                .map_err(|e| WorkflowError::checkpoint(format!("decode {}: {}", type_name, e)))?;
            Ok(AnyMessage::new(value))
        });
        let index = self.codecs.len();
        self.codecs.push(Codec {
            type_name,
            encode,
            decode,
        });
        self.by_type.insert(type_id, index);
        self.by_name.insert(type_name, index);
    }

    /// Whether `T` has a registered codec.
    pub fn contains<T: Any>(&self) -> bool {
        self.by_type.contains_key(&TypeId::of::<T>())
    }

    /// Encode a message, failing if its type was never registered.
    pub fn encode(&self, message: &AnyMessage) -> Result<PortableMessage, WorkflowError> {
        let index = self
            .by_type
            .get(&message.type_id())
            .ok_or_else(|| WorkflowError::UnregisteredMessageType(message.type_name().to_string()))?;
        let codec = &self.codecs[*index];
        Ok(PortableMessage {
            type_name: codec.type_name.to_string(),
            data: (codec.encode)(message)?,
        })
    }

    /// Decode a portable message back into an envelope.
    pub fn decode(&self, portable: &PortableMessage) -> Result<AnyMessage, WorkflowError> {
        let index = self
            .by_name
            .get(portable.type_name.as_str())
            .ok_or_else(|| WorkflowError::UnregisteredMessageType(portable.type_name.clone()))?;
        (self.codecs[*index].decode)(&portable.data)
    }
}

impl fmt::Debug for MessageCodecs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageCodecs")
            .field("registered", &self.codecs.len())
            .finish()
    }
}
