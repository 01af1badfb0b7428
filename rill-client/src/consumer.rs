//! The public consumer handle.
//!
//! A [`Consumer`] is a cheap, cloneable handle over the session actor:
//! every method posts a command on the session queue and awaits its
//! reply channel. The actor task and its tickers are spawned by
//! [`Consumer::subscribe`], which resolves once the broker accepted the
//! subscription.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rill_core::{
    AckType, ConsumerError, ConsumerId, Message, MessageId, Messages, Result, Schema,
    SchemaProvider,
};
use rill_wire::{ConnectionProvider, SeekTarget};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::actor::{SessionActor, SessionCommand, SharedState};
use crate::config::ConsumerConfig;
use crate::dead_letter::DeadLetterSink;
use crate::interceptor::ConsumerInterceptor;
use crate::stats::ConsumerStats;

/// Consumer ids are unique across a process; the connection multiplexes
/// sessions by them.
static NEXT_CONSUMER_ID: AtomicU64 = AtomicU64::new(1);

/// Collaborators wired into a session at creation time.
pub struct ConsumerHooks<T> {
    /// Versioned schema lookup, consulted for messages that carry a
    /// schema version.
    pub schema_provider: Option<Arc<dyn SchemaProvider<T>>>,
    /// Interceptor chain, invoked at fixed hook points.
    pub interceptors: Vec<Arc<dyn ConsumerInterceptor<T>>>,
    /// Dead-letter producer seam; required for the dead-letter policy
    /// to take effect.
    pub dead_letter_sink: Option<Arc<dyn DeadLetterSink>>,
    /// Invoked once when the session terminates, letting the façade
    /// drop its reference.
    pub remove_self: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl<T> Default for ConsumerHooks<T> {
    fn default() -> Self {
        Self {
            schema_provider: None,
            interceptors: Vec::new(),
            dead_letter_sink: None,
            remove_self: None,
        }
    }
}

impl<T> fmt::Debug for ConsumerHooks<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerHooks")
            .field("schema_provider", &self.schema_provider.is_some())
            .field("interceptors", &self.interceptors.len())
            .field("dead_letter_sink", &self.dead_letter_sink.is_some())
            .field("remove_self", &self.remove_self.is_some())
            .finish()
    }
}

/// Handle to one consumer session.
pub struct Consumer<T> {
    cmd_tx: mpsc::UnboundedSender<SessionCommand<T>>,
    shared: Arc<SharedState>,
    consumer_id: ConsumerId,
    topic: Arc<str>,
    subscription: Arc<str>,
    name: Arc<str>,
}

impl<T> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            shared: Arc::clone(&self.shared),
            consumer_id: self.consumer_id,
            topic: Arc::clone(&self.topic),
            subscription: Arc::clone(&self.subscription),
            name: Arc::clone(&self.name),
        }
    }
}

impl<T> fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("consumer_id", &self.consumer_id)
            .field("topic", &self.topic)
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Consumer<T> {
    /// Creates a consumer session and awaits the broker's subscribe
    /// acknowledgement.
    ///
    /// # Errors
    /// Returns configuration errors immediately; connection and broker
    /// errors after the subscribe deadline passes.
    pub async fn subscribe(
        config: ConsumerConfig,
        provider: Arc<dyn ConnectionProvider>,
        schema: Arc<dyn Schema<T>>,
    ) -> Result<Self> {
        Self::subscribe_with(config, provider, schema, ConsumerHooks::default()).await
    }

    /// Creates a consumer session with explicit collaborator hooks.
    ///
    /// # Errors
    /// Returns configuration errors immediately; connection and broker
    /// errors after the subscribe deadline passes.
    pub async fn subscribe_with(
        config: ConsumerConfig,
        provider: Arc<dyn ConnectionProvider>,
        schema: Arc<dyn Schema<T>>,
        hooks: ConsumerHooks<T>,
    ) -> Result<Self> {
        config.validate()?;

        let consumer_id = ConsumerId::new(NEXT_CONSUMER_ID.fetch_add(1, Ordering::Relaxed));
        let shared = Arc::new(SharedState::new());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (subscribe_tx, subscribe_rx) = oneshot::channel();

        let handle = Self {
            cmd_tx: cmd_tx.clone(),
            shared: Arc::clone(&shared),
            consumer_id,
            topic: Arc::from(config.topic.as_str()),
            subscription: Arc::from(config.subscription.as_str()),
            name: Arc::from(config.consumer_name.as_str()),
        };

        spawn_tickers(&config, &cmd_tx);

        let actor = SessionActor::new(
            config,
            consumer_id,
            provider,
            schema,
            hooks,
            shared,
            cmd_tx,
            cmd_rx,
            subscribe_tx,
        );
        tokio::spawn(actor.run());

        subscribe_rx
            .await
            .map_err(|_| ConsumerError::AlreadyClosed)??;
        Ok(handle)
    }

    /// Receives the next message, waiting until one is available.
    ///
    /// # Errors
    /// Returns [`ConsumerError::AlreadyClosed`] once the consumer shuts
    /// down.
    pub async fn receive(&self) -> Result<Message<T>> {
        self.ensure_open()?;
        self.request(|reply| SessionCommand::Receive { reply }).await
    }

    /// Receives a bundle of messages, waiting at most the configured
    /// batch timeout.
    ///
    /// # Errors
    /// Returns [`ConsumerError::AlreadyClosed`] once the consumer shuts
    /// down.
    pub async fn batch_receive(&self) -> Result<Messages<T>> {
        self.ensure_open()?;
        self.request(|reply| SessionCommand::BatchReceive { reply })
            .await
    }

    /// Acknowledges one message.
    ///
    /// # Errors
    /// Returns [`ConsumerError::AlreadyClosed`] once the consumer shuts
    /// down.
    pub async fn acknowledge(&self, id: MessageId) -> Result<()> {
        self.ensure_open()?;
        self.request(|reply| SessionCommand::Acknowledge {
            id,
            ack_type: AckType::Individual,
            reply,
        })
        .await
    }

    /// Acknowledges every message in a bundle.
    ///
    /// # Errors
    /// Returns the first ack failure.
    pub async fn acknowledge_all(&self, messages: &Messages<T>) -> Result<()> {
        for message in messages {
            self.acknowledge(message.id).await?;
        }
        Ok(())
    }

    /// Acknowledges this message and everything before it.
    ///
    /// # Errors
    /// Returns [`ConsumerError::InvalidConfig`] on shared
    /// subscriptions, which have no single cursor.
    pub async fn acknowledge_cumulative(&self, id: MessageId) -> Result<()> {
        self.ensure_open()?;
        self.request(|reply| SessionCommand::Acknowledge {
            id,
            ack_type: AckType::Cumulative,
            reply,
        })
        .await
    }

    /// Requests redelivery of one message after the configured
    /// negative-ack delay.
    ///
    /// # Errors
    /// Returns [`ConsumerError::AlreadyClosed`] once the consumer shuts
    /// down.
    pub fn negative_acknowledge(&self, id: MessageId) -> Result<()> {
        self.ensure_open()?;
        self.cmd_tx
            .send(SessionCommand::NegativeAcknowledge { id })
            .map_err(|_| ConsumerError::AlreadyClosed)
    }

    /// Negatively acknowledges every message in a bundle.
    ///
    /// # Errors
    /// Returns [`ConsumerError::AlreadyClosed`] once the consumer shuts
    /// down.
    pub fn negative_acknowledge_all(&self, messages: &Messages<T>) -> Result<()> {
        for message in messages {
            self.negative_acknowledge(message.id)?;
        }
        Ok(())
    }

    /// Asks the broker to redeliver every unacknowledged message.
    ///
    /// # Errors
    /// Returns [`ConsumerError::AlreadyClosed`] once the consumer shuts
    /// down.
    pub async fn redeliver_unacknowledged(&self) -> Result<()> {
        self.ensure_open()?;
        self.request(|reply| SessionCommand::RedeliverAllUnacknowledged { reply })
            .await
    }

    /// Repositions the subscription to a message id.
    ///
    /// # Errors
    /// Returns [`ConsumerError::NotConnected`] while disconnected.
    pub async fn seek(&self, id: MessageId) -> Result<()> {
        self.ensure_open()?;
        self.request(|reply| SessionCommand::Seek {
            target: SeekTarget::MessageId(id),
            reply,
        })
        .await
    }

    /// Repositions the subscription to a publish timestamp
    /// (milliseconds since the Unix epoch).
    ///
    /// # Errors
    /// Returns [`ConsumerError::NotConnected`] while disconnected.
    pub async fn seek_timestamp(&self, timestamp_ms: u64) -> Result<()> {
        self.ensure_open()?;
        self.request(|reply| SessionCommand::Seek {
            target: SeekTarget::Timestamp(timestamp_ms),
            reply,
        })
        .await
    }

    /// Fetches the id of the last message in the partition.
    ///
    /// # Errors
    /// Returns [`ConsumerError::NotConnected`] while disconnected,
    /// broker errors otherwise.
    pub async fn get_last_message_id(&self) -> Result<MessageId> {
        self.ensure_open()?;
        self.request(|reply| SessionCommand::GetLastMessageId { reply })
            .await
    }

    /// Returns true when a `receive` would complete without waiting for
    /// a new broker delivery, consulting the broker as needed.
    ///
    /// # Errors
    /// Returns [`ConsumerError::NotConnected`] while disconnected.
    pub async fn has_message_available(&self) -> Result<bool> {
        self.ensure_open()?;
        self.request(|reply| SessionCommand::HasMessageAvailable { reply })
            .await
    }

    /// Returns true once the broker announced the end of a terminated
    /// topic.
    #[must_use]
    pub fn has_reached_end_of_topic(&self) -> bool {
        self.shared.has_reached_end_of_topic()
    }

    /// Lifetime counters for this session.
    ///
    /// # Errors
    /// Returns [`ConsumerError::AlreadyClosed`] once the consumer shuts
    /// down.
    pub async fn get_stats(&self) -> Result<ConsumerStats> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::GetStats { reply })
            .map_err(|_| ConsumerError::AlreadyClosed)?;
        rx.await.map_err(|_| ConsumerError::AlreadyClosed)
    }

    /// Deletes the subscription and shuts the session down.
    ///
    /// # Errors
    /// Surfaces the broker's error when the unsubscribe is rejected.
    pub async fn unsubscribe(&self) -> Result<()> {
        self.ensure_open()?;
        self.request(|reply| SessionCommand::Unsubscribe { reply })
            .await
    }

    /// Closes the consumer. Idempotent: closing a closed consumer
    /// returns `Ok`.
    ///
    /// # Errors
    /// Surfaces the broker's error when the close frame is rejected
    /// while connected.
    pub async fn close(&self) -> Result<()> {
        if self.shared.is_closed() {
            return Ok(());
        }
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SessionCommand::Close { reply })
            .is_err()
        {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    /// The session's consumer id.
    #[must_use]
    pub const fn consumer_id(&self) -> ConsumerId {
        self.consumer_id
    }

    /// The topic partition this session consumes.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The subscription name.
    #[must_use]
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// The consumer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The broker-side end position most recently observed by this
    /// session.
    #[must_use]
    pub fn last_message_id_in_broker(&self) -> MessageId {
        self.shared.last_message_id_in_broker()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.is_closed() {
            return Err(ConsumerError::AlreadyClosed);
        }
        Ok(())
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<R>>) -> SessionCommand<T>,
    ) -> Result<R> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply))
            .map_err(|_| ConsumerError::AlreadyClosed)?;
        rx.await.map_err(|_| ConsumerError::AlreadyClosed)?
    }
}

/// Spawns one ticker task per enabled periodic concern. Each posts its
/// tick command until the session drops the command receiver.
fn spawn_tickers<T: Send + 'static>(
    config: &ConsumerConfig,
    cmd_tx: &mpsc::UnboundedSender<SessionCommand<T>>,
) {
    if !config.ack_group_interval.is_zero() {
        spawn_ticker(config.ack_group_interval, cmd_tx.clone(), || {
            SessionCommand::AckGroupTick
        });
    }

    if !config.ack_timeout.is_zero() {
        let tick = if config.ack_timeout_tick.is_zero() {
            config.ack_timeout
        } else {
            config.ack_timeout_tick
        };
        spawn_ticker(tick, cmd_tx.clone(), || SessionCommand::UnackedTick);
    }

    if !config.negative_ack_redelivery_delay.is_zero() {
        let tick = (config.negative_ack_redelivery_delay / 3).max(Duration::from_millis(1));
        spawn_ticker(tick, cmd_tx.clone(), || SessionCommand::NegativeAckTick);
    }

    if !config.stat_interval.is_zero() {
        spawn_ticker(config.stat_interval, cmd_tx.clone(), || {
            SessionCommand::StatTick
        });
    }
}

fn spawn_ticker<T: Send + 'static>(
    period: Duration,
    cmd_tx: mpsc::UnboundedSender<SessionCommand<T>>,
    make: impl Fn() -> SessionCommand<T> + Send + 'static,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; skip it.
        interval.tick().await;
        loop {
            interval.tick().await;
            if cmd_tx.send(make()).is_err() {
                return;
            }
        }
    });
}
