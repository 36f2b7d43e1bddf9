//! Ordered publish transport used by the transfer engine
//!
//! `NatsBus` publishes through JetStream. `MemoryBus` records every message
//! and backs tests and dev mode.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Mutex;

use super::client::NatsClient;
use crate::types::{RelayError, Result};

/// Publishes keyed messages in call order
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish one message; returns once the transport has accepted it
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<()>;
}

/// JetStream-backed bus
#[derive(Clone)]
pub struct NatsBus {
    client: NatsClient,
}

impl NatsBus {
    pub fn new(client: NatsClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<()> {
        self.client.publish_keyed(topic, key, payload).await
    }
}

/// A message captured by [`MemoryBus`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub key: String,
    pub payload: Bytes,
}

#[derive(Default)]
struct Recorded {
    messages: Vec<PublishedMessage>,
    /// Publishes left before every send fails
    remaining: Option<usize>,
}

/// In-process bus that records what was published
#[derive(Default)]
pub struct MemoryBus {
    recorded: Mutex<Recorded>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus that accepts `count` messages and fails every publish after that
    pub fn failing_after(count: usize) -> Self {
        Self {
            recorded: Mutex::new(Recorded {
                messages: Vec::new(),
                remaining: Some(count),
            }),
        }
    }

    /// Everything published so far, in order
    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.recorded
            .lock()
            .map(|r| r.messages.clone())
            .unwrap_or_default()
    }

    /// Messages published to one topic, in order
    pub fn on_topic(&self, topic: &str) -> Vec<PublishedMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }

    /// Keys published to one topic, in order
    pub fn keys_on(&self, topic: &str) -> Vec<String> {
        self.on_topic(topic).into_iter().map(|m| m.key).collect()
    }

    pub fn clear(&self) {
        if let Ok(mut recorded) = self.recorded.lock() {
            recorded.messages.clear();
        }
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<()> {
        let mut recorded = self
            .recorded
            .lock()
            .map_err(|_| RelayError::Internal("memory bus lock poisoned".into()))?;

        if let Some(remaining) = recorded.remaining.as_mut() {
            if *remaining == 0 {
                return Err(RelayError::Nats(format!("Publish to {} refused", topic)));
            }
            *remaining -= 1;
        }

        recorded.messages.push(PublishedMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            payload,
        });
        Ok(())
    }
}
