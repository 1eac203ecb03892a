use crate::{
    codec::{Codec, JsonCodec},
    errors::BrokerError,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
    sync::Arc,
};

/// Identifies a publishable/subscribable destination: a logical queue name
/// plus the codec for its payload type.
///
/// Logical names are lowercased; the broker derives the physical queue name
/// from them together with its group configuration.
pub struct QueueDescriptor<T> {
    logical_name: String,
    codec: Arc<dyn Codec<T>>,
}

impl<T> Clone for QueueDescriptor<T> {
    fn clone(&self) -> Self {
        QueueDescriptor {
            logical_name: self.logical_name.clone(),
            codec: self.codec.clone(),
        }
    }
}

impl<T> QueueDescriptor<T> {
    pub fn with_codec<C>(logical_name: impl Into<String>, codec: C) -> Self
    where
        C: Codec<T> + 'static,
    {
        QueueDescriptor {
            logical_name: logical_name.into().to_lowercase(),
            codec: Arc::new(codec),
        }
    }

    pub fn logical_name(&self) -> &str {
        &self.logical_name
    }

    pub fn content_type(&self) -> &'static str {
        self.codec.content_type()
    }

    pub fn codec(&self) -> Arc<dyn Codec<T>> {
        self.codec.clone()
    }

    pub fn encode(&self, value: &T) -> Result<Vec<u8>, BrokerError> {
        self.codec.encode(value)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<T, BrokerError> {
        self.codec.decode(bytes)
    }
}

impl<T> QueueDescriptor<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(logical_name: impl Into<String>) -> Self {
        Self::with_codec(logical_name, JsonCodec)
    }
}

/// Codec-only descriptor for the reply side of a call. Replies travel over
/// the caller's private reply queue, so no logical name is involved.
pub struct ReplyDescriptor<R> {
    codec: Arc<dyn Codec<R>>,
}

impl<R> Clone for ReplyDescriptor<R> {
    fn clone(&self) -> Self {
        ReplyDescriptor {
            codec: self.codec.clone(),
        }
    }
}

impl<R> ReplyDescriptor<R> {
    pub fn with_codec<C>(codec: C) -> Self
    where
        C: Codec<R> + 'static,
    {
        ReplyDescriptor {
            codec: Arc::new(codec),
        }
    }

    pub fn content_type(&self) -> &'static str {
        self.codec.content_type()
    }

    pub fn codec(&self) -> Arc<dyn Codec<R>> {
        self.codec.clone()
    }

    pub fn encode(&self, value: &R) -> Result<Vec<u8>, BrokerError> {
        self.codec.encode(value)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<R, BrokerError> {
        self.codec.decode(bytes)
    }
}

impl<R> ReplyDescriptor<R>
where
    R: Serialize + DeserializeOwned,
{
    pub fn new() -> Self {
        Self::with_codec(JsonCodec)
    }
}

impl<R> Default for ReplyDescriptor<R>
where
    R: Serialize + DeserializeOwned,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Statically-constructed mapping from a message type to its descriptor.
///
/// Built once at initialization; lookups on unregistered types fail with
/// [`BrokerError::UnknownDescriptor`].
#[derive(Default)]
pub struct DescriptorRegistry {
    entries: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        DescriptorRegistry::default()
    }

    pub fn register<T: 'static>(&mut self, descriptor: QueueDescriptor<T>) -> &mut Self {
        self.entries.insert(TypeId::of::<T>(), Box::new(descriptor));
        self
    }

    pub fn descriptor<T: 'static>(&self) -> Result<QueueDescriptor<T>, BrokerError> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.downcast_ref::<QueueDescriptor<T>>())
            .cloned()
            .ok_or_else(|| BrokerError::UnknownDescriptor(type_name::<T>().to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct SomeEvent {
        id: u64,
    }

    #[derive(Serialize, Deserialize)]
    struct OtherEvent {
        id: u64,
    }

    #[test]
    fn should_lowercase_logical_name() {
        let descriptor = QueueDescriptor::<SomeEvent>::new("Some-Event");

        assert_eq!(descriptor.logical_name(), "some-event");
    }

    #[test]
    fn should_resolve_registered_descriptor() {
        let mut registry = DescriptorRegistry::new();
        registry.register(QueueDescriptor::<SomeEvent>::new("some-event"));

        let descriptor = registry.descriptor::<SomeEvent>().unwrap();

        assert_eq!(descriptor.logical_name(), "some-event");
    }

    #[test]
    fn should_fail_for_unregistered_descriptor() {
        let mut registry = DescriptorRegistry::new();
        registry.register(QueueDescriptor::<SomeEvent>::new("some-event"));

        let res = registry.descriptor::<OtherEvent>();

        assert!(matches!(res, Err(BrokerError::UnknownDescriptor(_))));
    }
}
