//! NATS JetStream client wrapper
//!
//! Connection management plus the single transfer stream that carries the
//! upload, acknowledgement and download subjects.

use async_nats::jetstream::{self, stream::Stream};
use async_nats::{Client, ConnectOptions, HeaderMap};
use bytes::Bytes;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::NatsArgs;
use crate::types::RelayError;

/// Header carrying the protocol message key (the variant tag)
pub const MESSAGE_KEY_HEADER: &str = "Message-Key";

/// Default ping interval for keep-alive
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

/// Retention for transfer messages
const STREAM_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

/// NATS client wrapper with JetStream support
#[derive(Clone)]
pub struct NatsClient {
    /// Underlying NATS client
    client: Client,
    /// JetStream context over the same connection
    jetstream: jetstream::Context,
    /// Client name for logging
    name: String,
}

impl NatsClient {
    /// Create a new NATS client
    pub async fn new(args: &NatsArgs, name: &str) -> Result<Self, RelayError> {
        info!("Connecting to NATS at {}", args.nats_url);

        // No retry_on_initial_connect: fail fast so dev mode can fall back
        let mut options = ConnectOptions::new()
            .name(name)
            .ping_interval(DEFAULT_PING_INTERVAL)
            .connection_timeout(Duration::from_secs(5));

        if let (Some(user), Some(pass)) = (&args.nats_user, &args.nats_password) {
            options = options.user_and_password(user.clone(), pass.clone());
        }

        let client = options
            .connect(&args.nats_url)
            .await
            .map_err(|e| RelayError::Nats(format!("Failed to connect: {}", e)))?;

        info!("Connected to NATS at {}", args.nats_url);

        let jetstream = jetstream::new(client.clone());

        Ok(Self {
            client,
            jetstream,
            name: name.to_string(),
        })
    }

    /// Get the JetStream context
    pub fn jetstream(&self) -> &jetstream::Context {
        &self.jetstream
    }

    /// Ensure the transfer stream exists with all protocol subjects
    pub async fn ensure_stream(&self, args: &NatsArgs) -> Result<Stream, RelayError> {
        let subjects = args.subjects();
        let stream = self
            .jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: args.stream_name.clone(),
                subjects: subjects.clone(),
                max_age: STREAM_MAX_AGE,
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| RelayError::Nats(format!("Failed to create stream: {e}")))?;

        info!(
            "Using stream {} with subjects {}",
            args.stream_name,
            subjects.join(", ")
        );
        Ok(stream)
    }

    /// Publish a keyed message and wait for the stream to persist it
    pub async fn publish_keyed(
        &self,
        subject: &str,
        key: &str,
        payload: Bytes,
    ) -> Result<(), RelayError> {
        let mut headers = HeaderMap::new();
        headers.insert(MESSAGE_KEY_HEADER, key);

        let ack = self
            .jetstream
            .publish_with_headers(subject.to_string(), headers, payload)
            .await
            .map_err(|e| RelayError::Nats(format!("Publish failed: {}", e)))?;

        let ack = ack
            .await
            .map_err(|e| RelayError::Nats(format!("Publish not acknowledged: {}", e)))?;

        debug!(subject, key, sequence = ack.sequence, "Published");
        Ok(())
    }

    /// Flush pending messages
    pub async fn flush(&self) -> Result<(), RelayError> {
        self.client
            .flush()
            .await
            .map_err(|e| RelayError::Nats(format!("Flush failed: {}", e)))
    }

    /// Get the client name
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Read the protocol key from message headers
pub fn message_key(headers: Option<&HeaderMap>) -> Option<String> {
    headers
        .and_then(|h| h.get(MESSAGE_KEY_HEADER))
        .map(|value| value.as_str().to_string())
        .filter(|key| !key.is_empty())
}
