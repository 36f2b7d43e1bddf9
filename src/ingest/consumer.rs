//! JetStream consumer for the upload stream
//!
//! Pulls upload messages with a durable consumer, hands them to the
//! dispatcher and acks each one only after its lane has handled it.
//! While a message waits in a busy lane it is kept alive with progress acks
//! every half `ack_wait`, so JetStream does not redeliver it underneath the
//! lane. Malformed messages are terminated so they are never redelivered.

use async_nats::jetstream::{self, consumer::PullConsumer, stream::Stream, AckKind};
use futures_util::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::dispatch::{Envelope, UploadDispatcher};
use crate::config::NatsArgs;
use crate::nats::{message_key, ChunkMessage, NatsClient};
use crate::types::{RelayError, Result};

/// Messages fetched per pull request
const FETCH_BATCH: usize = 64;

/// How long one pull request waits for messages
const FETCH_EXPIRY: Duration = Duration::from_secs(5);

/// Durable pull consumer feeding the upload dispatcher
pub struct UploadConsumer {
    client: NatsClient,
    args: NatsArgs,
    dispatcher: Arc<UploadDispatcher>,
    running: Arc<RwLock<bool>>,
}

impl UploadConsumer {
    pub fn new(client: NatsClient, args: NatsArgs, dispatcher: Arc<UploadDispatcher>) -> Self {
        Self {
            client,
            args,
            dispatcher,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Run the consume loop until stopped
    pub async fn run(&self) -> Result<()> {
        *self.running.write().await = true;

        let stream = self.client.ensure_stream(&self.args).await?;
        let consumer = self.ensure_consumer(&stream).await?;

        info!(
            "Consumer {} reading {} as {}",
            self.args.consumer_name,
            self.args.upload_subject,
            self.client.name()
        );

        while *self.running.read().await {
            match self.process_batch(&consumer).await {
                Ok(count) => {
                    if count > 0 {
                        debug!("Dispatched {} upload messages", count);
                    }
                }
                Err(e) => {
                    error!("Error processing batch: {}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!("Consumer {} stopped", self.args.consumer_name);
        Ok(())
    }

    /// Stop after the current batch
    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    async fn ensure_consumer(&self, stream: &Stream) -> Result<PullConsumer> {
        let name = self.args.consumer_name.clone();

        let consumer = stream
            .get_or_create_consumer(
                &name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(name.clone()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    filter_subject: self.args.upload_subject.clone(),
                    max_ack_pending: self.args.max_ack_pending,
                    ack_wait: self.args.ack_wait(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| RelayError::Nats(format!("Failed to create consumer: {e}")))?;

        info!("Using consumer {}", name);
        Ok(consumer)
    }

    async fn process_batch(&self, consumer: &PullConsumer) -> Result<usize> {
        let mut messages = consumer
            .fetch()
            .max_messages(FETCH_BATCH)
            .expires(FETCH_EXPIRY)
            .messages()
            .await
            .map_err(|e| RelayError::Nats(format!("Failed to fetch messages: {e}")))?;

        let mut count = 0;

        while let Some(msg_result) = messages.next().await {
            match msg_result {
                Ok(msg) => {
                    count += 1;
                    self.process_message(msg).await;
                }
                Err(e) => {
                    warn!("Error receiving message: {}", e);
                }
            }
        }

        Ok(count)
    }

    async fn process_message(&self, msg: jetstream::Message) {
        let decoded = message_key(msg.headers.as_ref())
            .ok_or_else(|| RelayError::InvalidMessage("Missing message key header".into()))
            .and_then(|key| ChunkMessage::decode(&key, &msg.payload));

        let message = match decoded {
            Ok(message) => message,
            Err(e) => {
                error!(subject = %msg.subject, "Dropping malformed upload message: {}", e);
                if let Err(e) = msg.ack_with(AckKind::Term).await {
                    warn!("Failed to terminate malformed message: {}", e);
                }
                return;
            }
        };

        let (envelope, done) = Envelope::tracked(message);
        self.dispatcher.dispatch(envelope).await;

        // Ack off the fetch loop so one slow archive does not stall the rest
        let every = self.args.ack_wait() / 2;
        tokio::spawn(async move {
            let pending = &msg;
            let handled = wait_handled(done, every, move || async move {
                if let Err(e) = pending.ack_with(AckKind::Progress).await {
                    warn!("Failed to extend ack deadline: {}", e);
                }
            })
            .await;

            let result = if handled {
                msg.ack().await
            } else {
                warn!("Upload lane dropped a message; requesting redelivery");
                msg.ack_with(AckKind::Nak(None)).await
            };
            if let Err(e) = result {
                warn!("Failed to ack upload message: {}", e);
            }
        });
    }
}

/// Wait for a lane to handle a message, calling `heartbeat` every `every`
/// until it does. Returns false if the lane dropped the message.
async fn wait_handled<F, Fut>(
    mut done: oneshot::Receiver<()>,
    every: Duration,
    mut heartbeat: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = &mut done => return result.is_ok(),
            _ = ticker.tick() => heartbeat().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (Arc<AtomicUsize>, impl FnMut() -> std::future::Ready<()>) {
        let beats = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&beats);
        let heartbeat = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        };
        (beats, heartbeat)
    }

    #[tokio::test]
    async fn test_heartbeats_while_lane_is_busy() {
        let (tx, rx) = oneshot::channel();
        let (beats, heartbeat) = counting();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            let _ = tx.send(());
        });

        assert!(wait_handled(rx, Duration::from_millis(40), heartbeat).await);
        assert!(beats.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_no_heartbeat_when_handled_quickly() {
        let (tx, rx) = oneshot::channel();
        let (beats, heartbeat) = counting();
        tx.send(()).unwrap();

        assert!(wait_handled(rx, Duration::from_secs(15), heartbeat).await);
        assert_eq!(beats.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropped_message_is_reported() {
        let (tx, rx) = oneshot::channel::<()>();
        let (_beats, heartbeat) = counting();
        drop(tx);

        assert!(!wait_handled(rx, Duration::from_secs(15), heartbeat).await);
    }
}
