//! The consumer session actor.
//!
//! One task owns all session state. Every input — application calls,
//! broker events, timer ticks — arrives as a [`SessionCommand`] on one
//! queue and is handled to completion before the next, so no locks guard
//! the incoming queue, waiters or trackers.
//!
//! # Suspension points
//!
//! The loop suspends only to receive the next command, send a wire
//! frame, await a broker reply, await a schema-provider lookup, or sleep
//! between reconnect attempts. While a broker reply is pending the loop
//! does not accept further commands; subscribe, seek and close replies
//! are therefore always processed before any late-arriving message
//! event.
//!
//! # Connection epochs
//!
//! Each (re)registration on a connection bumps an epoch that is baked
//! into the event sink. Events stamped with a stale epoch are dropped,
//! so an old connection's queued deliveries cannot leak into the new
//! subscription.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use rill_core::{
    AckType, ConsumerError, ConsumerId, Limits, Message, MessageId, Messages, RawMessage, Result,
    Schema, SchemaProvider,
};
use rill_wire::{
    decode_batch, decompress, Ack, BrokerConnection, CloseConsumer, ConnectionProvider,
    ConsumerEvent, DecompressError, EventSink, Flow, GetLastMessageId, Redeliver, Seek, SeekTarget,
    Subscribe, Unsubscribe, ValidationError,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::ack_grouping::{AckGroupingTracker, GroupedAcks};
use crate::backoff::{Backoff, BackoffConfig};
use crate::batch_ack::{BatchAcker, SharedBatchAcker};
use crate::config::ConsumerConfig;
use crate::consumer::ConsumerHooks;
use crate::dead_letter::{DeadLetterMessage, DeadLetterProcessor};
use crate::flow::FlowPermits;
use crate::interceptor::ConsumerInterceptor;
use crate::negative_ack::NegativeAckTracker;
use crate::queue::{BatchWaiter, IncomingQueue};
use crate::stats::{ConsumerStats, StatsRecorder};
use crate::unacked::UnackedTracker;

/// Commands accepted by the session actor.
pub(crate) enum SessionCommand<T> {
    Receive {
        reply: oneshot::Sender<Result<Message<T>>>,
    },
    BatchReceive {
        reply: oneshot::Sender<Result<Messages<T>>>,
    },
    SendBatchByTimeout,
    Acknowledge {
        id: MessageId,
        ack_type: AckType,
        reply: oneshot::Sender<Result<()>>,
    },
    NegativeAcknowledge {
        id: MessageId,
    },
    RedeliverUnacknowledged {
        ids: Vec<MessageId>,
        reply: oneshot::Sender<Result<()>>,
    },
    RedeliverAllUnacknowledged {
        reply: oneshot::Sender<Result<()>>,
    },
    Seek {
        target: SeekTarget,
        reply: oneshot::Sender<Result<()>>,
    },
    HasMessageAvailable {
        reply: oneshot::Sender<Result<bool>>,
    },
    GetLastMessageId {
        reply: oneshot::Sender<Result<MessageId>>,
    },
    MessageReceived {
        raw: RawMessage,
        epoch: u64,
    },
    ConnectionClosed {
        epoch: u64,
    },
    ActiveConsumerChanged(bool),
    ReachedEndOfTopic,
    AckGroupTick,
    UnackedTick,
    NegativeAckTick,
    StatTick,
    GetStats {
        reply: oneshot::Sender<ConsumerStats>,
    },
    Close {
        reply: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Session state visible outside the actor loop.
///
/// `closed` and `last_message_id_in_broker` are the only fields read
/// without going through the command queue; both use acquire/release
/// discipline.
pub(crate) struct SharedState {
    closed: AtomicBool,
    end_of_topic: AtomicBool,
    last_in_broker: RwLock<MessageId>,
}

impl SharedState {
    pub(crate) fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            end_of_topic: AtomicBool::new(false),
            last_in_broker: RwLock::new(MessageId::earliest()),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn has_reached_end_of_topic(&self) -> bool {
        self.end_of_topic.load(Ordering::Acquire)
    }

    pub(crate) fn last_message_id_in_broker(&self) -> MessageId {
        *self.last_in_broker.read().expect("lock poisoned")
    }

    fn set_last_in_broker(&self, id: MessageId) {
        *self.last_in_broker.write().expect("lock poisoned") = id;
    }
}

/// Connection state of the session.
enum ConnectionState {
    Connecting,
    Ready(Arc<dyn BrokerConnection>),
    Reconnecting,
    Closing,
    Closed,
    Failed,
}

/// Outcome of one connect-and-subscribe attempt.
enum ConnectOutcome {
    Subscribed,
    Retry,
    Terminal,
}

/// The single-writer session actor.
pub(crate) struct SessionActor<T> {
    config: ConsumerConfig,
    limits: Limits,
    consumer_id: ConsumerId,
    topic: Arc<str>,
    batch_topic: Arc<str>,

    cmd_tx: mpsc::UnboundedSender<SessionCommand<T>>,
    cmd_rx: mpsc::UnboundedReceiver<SessionCommand<T>>,
    provider: Arc<dyn ConnectionProvider>,
    schema: Arc<dyn Schema<T>>,
    schema_provider: Option<Arc<dyn SchemaProvider<T>>>,
    interceptors: Vec<Arc<dyn ConsumerInterceptor<T>>>,
    remove_self: Option<Box<dyn FnOnce() + Send + Sync>>,
    shared: Arc<SharedState>,

    state: ConnectionState,
    epoch: u64,
    subscribed: bool,
    stopped: bool,
    subscribe_tsc: Option<oneshot::Sender<Result<()>>>,
    subscribe_deadline: Instant,

    queue: IncomingQueue<T>,
    receive_waiters: VecDeque<oneshot::Sender<Result<Message<T>>>>,
    batch_waiters: VecDeque<BatchWaiter<T>>,

    flow: FlowPermits,
    ack_grouping: AckGroupingTracker,
    unacked: UnackedTracker,
    negative_acks: NegativeAckTracker,
    dead_letter: DeadLetterProcessor,
    batch_ackers: HashMap<MessageId, SharedBatchAcker>,
    backoff: Backoff,
    stats: StatsRecorder,

    start_message_id: Option<MessageId>,
    initial_start_message_id: Option<MessageId>,
    last_dequeued: MessageId,
    during_seek: Option<MessageId>,

    clock_base: Instant,
}

impl<T: Send + 'static> SessionActor<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: ConsumerConfig,
        consumer_id: ConsumerId,
        provider: Arc<dyn ConnectionProvider>,
        schema: Arc<dyn Schema<T>>,
        hooks: ConsumerHooks<T>,
        shared: Arc<SharedState>,
        cmd_tx: mpsc::UnboundedSender<SessionCommand<T>>,
        cmd_rx: mpsc::UnboundedReceiver<SessionCommand<T>>,
        subscribe_tsc: oneshot::Sender<Result<()>>,
    ) -> Self {
        let limits = Limits::new();

        let dead_letter = match (&config.dead_letter, hooks.dead_letter_sink) {
            (Some(policy), Some(sink)) => {
                let topic = config
                    .dead_letter_topic()
                    .expect("policy present implies topic");
                DeadLetterProcessor::new(policy.max_redelivery_count, topic, sink)
            }
            (Some(_), None) => {
                warn!(
                    topic = %config.topic,
                    "dead-letter policy configured without a sink, disabling"
                );
                DeadLetterProcessor::disabled()
            }
            _ => DeadLetterProcessor::disabled(),
        };

        #[allow(clippy::cast_possible_truncation)] // Configured durations are small.
        let unacked = UnackedTracker::new(
            config.ack_timeout.as_millis() as u64,
            config.ack_timeout_tick.as_millis() as u64,
        );
        #[allow(clippy::cast_possible_truncation)]
        let negative_acks =
            NegativeAckTracker::new(config.negative_ack_redelivery_delay.as_millis() as u64);

        let now = Instant::now();
        Self {
            topic: Arc::from(config.topic.as_str()),
            batch_topic: Arc::from(""),
            limits,
            consumer_id,
            cmd_tx,
            cmd_rx,
            provider,
            schema,
            schema_provider: hooks.schema_provider,
            interceptors: hooks.interceptors,
            remove_self: hooks.remove_self,
            shared,
            state: ConnectionState::Connecting,
            epoch: 0,
            subscribed: false,
            stopped: false,
            subscribe_tsc: Some(subscribe_tsc),
            subscribe_deadline: now + config.operation_timeout,
            queue: IncomingQueue::new(),
            receive_waiters: VecDeque::new(),
            batch_waiters: VecDeque::new(),
            flow: FlowPermits::new(config.receiver_queue_size),
            ack_grouping: AckGroupingTracker::new(
                !config.ack_group_interval.is_zero(),
                limits.max_acks_per_frame,
            ),
            unacked,
            negative_acks,
            dead_letter,
            batch_ackers: HashMap::new(),
            backoff: Backoff::new(BackoffConfig::default()),
            stats: StatsRecorder::new(),
            start_message_id: config.start_message_id,
            initial_start_message_id: config.start_message_id,
            last_dequeued: MessageId::earliest(),
            during_seek: None,
            clock_base: now,
            config,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            consumer = %self.consumer_id,
            topic = %self.config.topic,
            subscription = %self.config.subscription,
            "consumer session starting"
        );

        if self.grab_cnx().await {
            while !self.is_terminal() {
                let Some(cmd) = self.cmd_rx.recv().await else {
                    break;
                };
                self.handle(cmd).await;
            }
        }

        // Fail fast for anything queued behind the shutdown.
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            self.reject(cmd);
        }

        info!(consumer = %self.consumer_id, "consumer session stopped");
    }

    // -------------------------------------------------------------------------
    // Command dispatch
    // -------------------------------------------------------------------------

    async fn handle(&mut self, cmd: SessionCommand<T>) {
        if self.is_terminal() {
            self.reject(cmd);
            return;
        }

        match cmd {
            SessionCommand::Receive { reply } => self.handle_receive(reply).await,
            SessionCommand::BatchReceive { reply } => self.handle_batch_receive(reply).await,
            SessionCommand::SendBatchByTimeout => self.handle_batch_timeout().await,
            SessionCommand::Acknowledge {
                id,
                ack_type,
                reply,
            } => {
                let result = self.handle_ack(id, ack_type).await;
                let _ = reply.send(result);
            }
            SessionCommand::NegativeAcknowledge { id } => self.handle_negative_ack(id),
            SessionCommand::RedeliverUnacknowledged { ids, reply } => {
                let result = self.redeliver_ids(ids).await;
                if let Err(unread) = reply.send(result) {
                    // Tick-driven requests drop their receiver; surface
                    // failures here instead.
                    if let Err(err) = unread {
                        warn!(error = %err, "redelivery request failed");
                    }
                }
            }
            SessionCommand::RedeliverAllUnacknowledged { reply } => {
                let result = self.redeliver_all().await;
                let _ = reply.send(result);
            }
            SessionCommand::Seek { target, reply } => {
                let result = self.handle_seek(target).await;
                let _ = reply.send(result);
            }
            SessionCommand::HasMessageAvailable { reply } => {
                let result = self.handle_has_message_available().await;
                let _ = reply.send(result);
            }
            SessionCommand::GetLastMessageId { reply } => {
                let result = self.fetch_last_message_id().await;
                let _ = reply.send(result);
            }
            SessionCommand::MessageReceived { raw, epoch } => {
                self.handle_message(raw, epoch).await;
            }
            SessionCommand::ConnectionClosed { epoch } => self.handle_disconnect(epoch).await,
            SessionCommand::ActiveConsumerChanged(active) => {
                debug!(consumer = %self.consumer_id, active, "active consumer changed");
            }
            SessionCommand::ReachedEndOfTopic => {
                info!(topic = %self.config.topic, "reached end of topic");
                self.shared.end_of_topic.store(true, Ordering::Release);
            }
            SessionCommand::AckGroupTick => self.flush_grouped_acks().await,
            SessionCommand::UnackedTick => self.handle_unacked_tick().await,
            SessionCommand::NegativeAckTick => self.handle_negative_ack_tick().await,
            SessionCommand::StatTick => {
                self.stats
                    .tick(&self.config.topic, &self.config.subscription);
            }
            SessionCommand::GetStats { reply } => {
                let _ = reply.send(self.stats.snapshot());
            }
            SessionCommand::Close { reply } => self.handle_close(reply).await,
            SessionCommand::Unsubscribe { reply } => self.handle_unsubscribe(reply).await,
        }
    }

    /// Fails a command's reply channel after the session has stopped.
    fn reject(&self, cmd: SessionCommand<T>) {
        match cmd {
            SessionCommand::Receive { reply } => {
                let _ = reply.send(Err(ConsumerError::AlreadyClosed));
            }
            SessionCommand::BatchReceive { reply } => {
                let _ = reply.send(Err(ConsumerError::AlreadyClosed));
            }
            SessionCommand::Acknowledge { reply, .. }
            | SessionCommand::RedeliverUnacknowledged { reply, .. }
            | SessionCommand::RedeliverAllUnacknowledged { reply }
            | SessionCommand::Seek { reply, .. }
            | SessionCommand::Unsubscribe { reply } => {
                let _ = reply.send(Err(ConsumerError::AlreadyClosed));
            }
            SessionCommand::HasMessageAvailable { reply } => {
                let _ = reply.send(Err(ConsumerError::AlreadyClosed));
            }
            SessionCommand::GetLastMessageId { reply } => {
                let _ = reply.send(Err(ConsumerError::AlreadyClosed));
            }
            SessionCommand::GetStats { reply } => {
                let _ = reply.send(self.stats.snapshot());
            }
            // Close is idempotent: Ok once closed.
            SessionCommand::Close { reply } => {
                let _ = reply.send(Ok(()));
            }
            SessionCommand::SendBatchByTimeout
            | SessionCommand::NegativeAcknowledge { .. }
            | SessionCommand::MessageReceived { .. }
            | SessionCommand::ConnectionClosed { .. }
            | SessionCommand::ActiveConsumerChanged(_)
            | SessionCommand::ReachedEndOfTopic
            | SessionCommand::AckGroupTick
            | SessionCommand::UnackedTick
            | SessionCommand::NegativeAckTick
            | SessionCommand::StatTick => {}
        }
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    /// Connects and subscribes, retrying with backoff. Returns false
    /// once the session is terminal.
    async fn grab_cnx(&mut self) -> bool {
        loop {
            if self.is_terminal() {
                return false;
            }
            self.state = ConnectionState::Connecting;

            match self.provider.connect(&self.config.topic).await {
                Ok(cnx) => match self.on_connection_opened(cnx).await {
                    ConnectOutcome::Subscribed => return true,
                    ConnectOutcome::Retry => {}
                    ConnectOutcome::Terminal => return false,
                },
                Err(wire) => {
                    let err = ConsumerError::from(wire);
                    if !self.connection_failed(err).await {
                        return false;
                    }
                }
            }

            let delay = self.backoff.next_delay();
            debug!(
                consumer = %self.consumer_id,
                delay_ms = delay.as_millis() as u64,
                "reconnecting after backoff"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Decides whether a connect failure is retriable. Returns false
    /// when the session became terminal.
    async fn connection_failed(&mut self, err: ConsumerError) -> bool {
        if self.subscribed {
            warn!(consumer = %self.consumer_id, error = %err, "connection failed, will retry");
            return true;
        }
        if err.is_retriable() && Instant::now() < self.subscribe_deadline {
            warn!(consumer = %self.consumer_id, error = %err, "connection failed during subscribe, will retry");
            return true;
        }

        error!(consumer = %self.consumer_id, error = %err, "subscribe failed permanently");
        self.state = ConnectionState::Failed;
        self.resolve_subscribe(Err(err));
        self.stop_consumer(None).await;
        false
    }

    /// Registers on a fresh connection and drives the subscribe
    /// exchange.
    async fn on_connection_opened(&mut self, cnx: Arc<dyn BrokerConnection>) -> ConnectOutcome {
        self.epoch += 1;
        cnx.register_consumer(self.consumer_id, self.event_sink(self.epoch));

        let resume = self.clear_receiver_queue();
        self.start_message_id = resume;
        self.dead_letter.clear();
        self.batch_ackers.clear();

        let durable = self.config.subscription_mode.is_durable();
        let start_rollback = if resume == self.initial_start_message_id {
            self.config.start_rollback
        } else {
            None
        };

        let subscribe = Subscribe {
            topic: self.config.topic.clone(),
            subscription: self.config.subscription.clone(),
            consumer_id: self.consumer_id,
            request_id: cnx.next_request_id(),
            consumer_name: self.config.consumer_name.clone(),
            sub_type: self.config.subscription_type,
            initial_position: self.config.initial_position,
            read_compacted: self.config.read_compacted,
            durable,
            start_message_id: if durable { None } else { resume },
            start_rollback,
            create_topic_if_missing: self.config.create_topic_if_missing,
            key_shared_policy: self.config.key_shared_policy.clone(),
            schema: self.config.schema_info.clone(),
        };

        match cnx.subscribe(subscribe).await {
            Ok(()) => {
                self.backoff.reset();
                self.flow.reset();
                self.state = ConnectionState::Ready(Arc::clone(&cnx));
                self.subscribed = true;
                self.resolve_subscribe(Ok(()));

                if self.config.receiver_queue_size > 0 {
                    self.send_flow(self.config.receiver_queue_size).await;
                }

                info!(
                    consumer = %self.consumer_id,
                    topic = %self.config.topic,
                    epoch = self.epoch,
                    resume = ?resume,
                    "subscribed"
                );
                ConnectOutcome::Subscribed
            }
            Err(wire) => {
                cnx.remove_consumer(self.consumer_id);
                let err = ConsumerError::from(wire);

                let retriable = err.is_retriable()
                    && (self.subscribed || Instant::now() < self.subscribe_deadline);
                if retriable {
                    warn!(consumer = %self.consumer_id, error = %err, "subscribe failed, will retry");
                    ConnectOutcome::Retry
                } else {
                    error!(consumer = %self.consumer_id, error = %err, "subscribe failed permanently");
                    self.state = ConnectionState::Failed;
                    self.resolve_subscribe(Err(err));
                    self.stop_consumer(None).await;
                    ConnectOutcome::Terminal
                }
            }
        }
    }

    /// Computes the position to resume from on reconnect and empties
    /// the receive queue.
    fn clear_receiver_queue(&mut self) -> Option<MessageId> {
        let head = self.queue.pop();
        self.queue.clear();

        if let Some(seek_target) = self.during_seek.take() {
            return Some(seek_target);
        }
        if self.config.subscription_mode.is_durable() {
            // The broker owns the cursor.
            return self.start_message_id;
        }
        if let Some(head) = head {
            return Some(head.id.predecessor());
        }
        if !self.last_dequeued.is_earliest() {
            return Some(self.last_dequeued);
        }
        self.start_message_id
    }

    fn event_sink(&self, epoch: u64) -> EventSink {
        let tx = self.cmd_tx.clone();
        Arc::new(move |event| {
            let cmd = match event {
                ConsumerEvent::Message(raw) => SessionCommand::MessageReceived { raw, epoch },
                ConsumerEvent::ActiveConsumerChanged(active) => {
                    SessionCommand::ActiveConsumerChanged(active)
                }
                ConsumerEvent::ReachedEndOfTopic => SessionCommand::ReachedEndOfTopic,
                ConsumerEvent::Disconnected => SessionCommand::ConnectionClosed { epoch },
            };
            let _ = tx.send(cmd);
        })
    }

    async fn handle_disconnect(&mut self, epoch: u64) {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "stale disconnect, ignoring");
            return;
        }
        if !matches!(self.state, ConnectionState::Ready(_)) {
            return;
        }

        warn!(consumer = %self.consumer_id, topic = %self.config.topic, "connection lost, reconnecting");
        if let ConnectionState::Ready(cnx) =
            std::mem::replace(&mut self.state, ConnectionState::Reconnecting)
        {
            cnx.remove_consumer(self.consumer_id);
        }

        let delay = self.backoff.next_delay();
        tokio::time::sleep(delay).await;
        self.grab_cnx().await;
    }

    // -------------------------------------------------------------------------
    // Message ingestion
    // -------------------------------------------------------------------------

    async fn handle_message(&mut self, raw: RawMessage, epoch: u64) {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "stale message, ignoring");
            return;
        }
        if !matches!(self.state, ConnectionState::Ready(_)) {
            debug!(id = %raw.id, "message while not ready, ignoring");
            return;
        }

        let mut id = raw.id;
        id.partition = self.config.partition;

        // A message whose ack is already pending was consumed before;
        // drop the redelivery and give the permits back.
        if self.ack_grouping.is_duplicate(id) {
            debug!(%id, "duplicate of pending ack, discarding");
            self.credit_permits(raw.metadata.num_messages).await;
            return;
        }

        if !raw.checksum_ok {
            self.discard(id, ValidationError::ChecksumMismatch).await;
            return;
        }

        let payload = match decompress(
            raw.metadata.compression,
            &raw.payload,
            raw.metadata.uncompressed_size,
        ) {
            Ok(payload) => payload,
            Err(DecompressError::SizeMismatch { expected, actual }) => {
                warn!(%id, expected, actual, "uncompressed size mismatch");
                self.discard(id, ValidationError::UncompressedSizeCorruption)
                    .await;
                return;
            }
            Err(err @ DecompressError::Unsupported { .. }) => {
                warn!(%id, error = %err, "decompression failed");
                self.discard(id, ValidationError::DecompressionError).await;
                return;
            }
        };

        if raw.is_batched() {
            self.handle_batched_entry(id, &raw, &payload).await;
        } else {
            self.handle_single_entry(id, raw, payload).await;
        }
    }

    async fn handle_single_entry(
        &mut self,
        id: MessageId,
        raw: RawMessage,
        payload: bytes::Bytes,
    ) {
        if self.is_prior_to_start(id, id.batch_index) {
            // Tail prefix of the entry the resume position points into.
            debug!(%id, "prior to start position, dropping");
            self.credit_permits(1).await;
            return;
        }

        let schema = Self::resolve_schema(
            self.schema_provider.clone(),
            Arc::clone(&self.schema),
            raw.metadata.schema_version.as_ref(),
        )
        .await;
        let mut message = Message::new(id, payload, schema)
            .with_properties(raw.metadata.properties)
            .with_schema_version(raw.metadata.schema_version)
            .with_sequence_id(raw.metadata.sequence_id)
            .with_redelivery_count(raw.redelivery_count)
            .with_topic(Arc::clone(&self.topic));
        if let Some(key) = raw.metadata.key {
            message = message.with_key(key, raw.metadata.key_is_b64);
        }

        self.stats.record_received(message.size());

        if self.dead_letter.exceeds_redelivery_limit(raw.redelivery_count) {
            self.dead_letter.buffer(
                id.entry_key(),
                DeadLetterMessage {
                    id,
                    payload: message.payload.clone(),
                    key: message.key.clone(),
                    key_is_b64: message.key_is_b64,
                    properties: message.properties.clone(),
                },
            );
        }

        self.deliver_or_enqueue(message).await;
    }

    async fn handle_batched_entry(&mut self, entry_id: MessageId, raw: &RawMessage, payload: &bytes::Bytes) {
        if raw.metadata.num_messages > self.limits.max_messages_per_batch {
            warn!(
                id = %entry_id,
                num_messages = raw.metadata.num_messages,
                max = self.limits.max_messages_per_batch,
                "batch exceeds sub-message limit"
            );
            self.discard(entry_id, ValidationError::BatchDeserializeError)
                .await;
            return;
        }

        let subs = match decode_batch(payload, raw.metadata.num_messages) {
            Ok(subs) => subs,
            Err(err) => {
                warn!(id = %entry_id, error = %err, "batch envelope parse failed");
                self.discard(entry_id, ValidationError::BatchDeserializeError)
                    .await;
                return;
            }
        };

        let entry_key = entry_id.entry_key();
        let acker = BatchAcker::shared(raw.metadata.num_messages);
        let schema = Self::resolve_schema(
            self.schema_provider.clone(),
            Arc::clone(&self.schema),
            raw.metadata.schema_version.as_ref(),
        )
        .await;

        let mut skipped = 0u32;
        for (index, sub) in subs.into_iter().enumerate() {
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let batch_index = index as i32;
            #[allow(clippy::cast_possible_truncation)]
            let bit = index as u32;

            if sub.meta.compacted_out || self.is_prior_to_start(entry_id, batch_index) {
                acker.lock().expect("lock poisoned").ack_individual(bit);
                skipped += 1;
                continue;
            }

            let id = MessageId::new(
                entry_id.ledger_id,
                entry_id.entry_id,
                self.config.partition,
                batch_index,
            );
            let mut message = Message::new(id, sub.payload, Arc::clone(&schema))
                .with_properties(sub.meta.properties)
                .with_schema_version(raw.metadata.schema_version.clone())
                .with_sequence_id(raw.metadata.sequence_id)
                .with_redelivery_count(raw.redelivery_count)
                .with_topic(Arc::clone(&self.batch_topic));
            if let Some(key) = sub.meta.key {
                message = message.with_key(key, sub.meta.key_is_b64);
            }

            self.stats.record_received(message.size());

            if self.dead_letter.exceeds_redelivery_limit(raw.redelivery_count) {
                self.dead_letter.buffer(
                    entry_key,
                    DeadLetterMessage {
                        id,
                        payload: message.payload.clone(),
                        key: message.key.clone(),
                        key_is_b64: message.key_is_b64,
                        properties: message.properties.clone(),
                    },
                );
            }

            self.deliver_or_enqueue(message).await;
        }

        let outstanding = acker.lock().expect("lock poisoned").outstanding();
        if outstanding > 0 {
            self.batch_ackers.insert(entry_key, acker);
        }

        if skipped > 0 {
            self.credit_permits(skipped).await;
        }
    }

    /// Returns true if a position on the same entry as the resume point
    /// lies before it (bound inclusive unless `reset_include_head`).
    fn is_prior_to_start(&self, id: MessageId, batch_index: i32) -> bool {
        let Some(start) = self.start_message_id else {
            return false;
        };
        if !start.same_entry(&id) {
            return false;
        }
        if self.config.reset_include_head {
            batch_index < start.batch_index
        } else {
            batch_index <= start.batch_index
        }
    }

    async fn resolve_schema(
        provider: Option<Arc<dyn SchemaProvider<T>>>,
        fallback: Arc<dyn Schema<T>>,
        version: Option<&bytes::Bytes>,
    ) -> Arc<dyn Schema<T>> {
        if let (Some(version), Some(provider)) = (version, provider) {
            if let Some(schema) = provider.schema_for_version(version).await {
                return schema;
            }
            debug!("schema version unknown to provider, using base schema");
        }
        fallback
    }

    /// Sends an error ack for a corrupt entry so the broker may
    /// redeliver it, and counts the failure.
    async fn discard(&mut self, id: MessageId, reason: ValidationError) {
        warn!(%id, ?reason, "discarding entry");
        self.stats.record_receive_failed();

        if let Some(cnx) = self.ready_cnx() {
            let ack = Ack {
                consumer_id: self.consumer_id,
                ack_type: AckType::Individual,
                ids: vec![id],
                validation_error: Some(reason),
            };
            if let Err(err) = cnx.send_ack(ack).await {
                debug!(error = %err, "error ack dropped");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Delivery
    // -------------------------------------------------------------------------

    async fn deliver_or_enqueue(&mut self, mut message: Message<T>) {
        // Fast path: hand it straight to a waiting receive call.
        while let Some(waiter) = self.receive_waiters.pop_front() {
            if waiter.is_closed() {
                continue;
            }
            self.message_processed(message.id).await;
            for interceptor in &self.interceptors {
                interceptor.before_consume(&mut message);
            }
            let _ = waiter.send(Ok(message));
            return;
        }

        self.queue.push(message);

        if !self.batch_waiters.is_empty()
            && self
                .config
                .batch_receive
                .is_met(self.queue.len(), self.queue.bytes())
        {
            self.complete_oldest_batch_waiter().await;
        }
    }

    /// Bookkeeping for a message leaving the session toward the
    /// application: position, ack-timeout clock, permit credit.
    async fn message_processed(&mut self, id: MessageId) {
        self.last_dequeued = id;
        self.unacked.add(id.entry_key());
        self.credit_permits(1).await;
    }

    async fn credit_permits(&mut self, count: u32) {
        if let Some(permits) = self.flow.increase(count) {
            self.send_flow(permits).await;
        }
    }

    async fn send_flow(&mut self, permits: u32) {
        let Some(cnx) = self.ready_cnx() else {
            debug!(permits, "dropping flow grant, not connected");
            return;
        };
        let flow = Flow {
            consumer_id: self.consumer_id,
            permits,
        };
        if let Err(err) = cnx.send_flow(flow).await {
            warn!(error = %err, "flow grant failed");
        }
    }

    async fn handle_receive(&mut self, reply: oneshot::Sender<Result<Message<T>>>) {
        if let Some(mut message) = self.queue.pop() {
            self.message_processed(message.id).await;
            for interceptor in &self.interceptors {
                interceptor.before_consume(&mut message);
            }
            let _ = reply.send(Ok(message));
        } else {
            self.receive_waiters.push_back(reply);
        }
    }

    async fn handle_batch_receive(&mut self, reply: oneshot::Sender<Result<Messages<T>>>) {
        if self.batch_waiters.is_empty()
            && self
                .config
                .batch_receive
                .is_met(self.queue.len(), self.queue.bytes())
        {
            let bundle = self.drain_bundle().await;
            let _ = reply.send(Ok(bundle));
            return;
        }

        let timeout = self.config.batch_receive.timeout;
        let handle = if timeout.is_zero() {
            None
        } else {
            let tx = self.cmd_tx.clone();
            Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = tx.send(SessionCommand::SendBatchByTimeout);
            }))
        };

        self.batch_waiters.push_back(BatchWaiter {
            reply,
            timeout: handle,
        });
    }

    async fn handle_batch_timeout(&mut self) {
        let Some(mut waiter) = self.batch_waiters.pop_front() else {
            return;
        };
        waiter.cancel_timeout();
        if waiter.reply.is_closed() {
            return;
        }
        let bundle = self.drain_bundle().await;
        let _ = waiter.reply.send(Ok(bundle));
    }

    async fn complete_oldest_batch_waiter(&mut self) {
        while let Some(mut waiter) = self.batch_waiters.pop_front() {
            waiter.cancel_timeout();
            if waiter.reply.is_closed() {
                continue;
            }
            let bundle = self.drain_bundle().await;
            let _ = waiter.reply.send(Ok(bundle));
            return;
        }
    }

    async fn drain_bundle(&mut self) -> Messages<T> {
        let drained = self.queue.drain_batch(&self.config.batch_receive);
        let mut bundle = Messages::new();
        for mut message in drained {
            self.message_processed(message.id).await;
            for interceptor in &self.interceptors {
                interceptor.before_consume(&mut message);
            }
            bundle.push(message);
        }
        bundle
    }

    // -------------------------------------------------------------------------
    // Acknowledgement
    // -------------------------------------------------------------------------

    async fn handle_ack(&mut self, id: MessageId, ack_type: AckType) -> Result<()> {
        match ack_type {
            AckType::Individual => self.ack_individual(id).await,
            AckType::Cumulative => self.ack_cumulative(id).await,
        }
    }

    async fn ack_individual(&mut self, id: MessageId) -> Result<()> {
        let entry_key = id.entry_key();
        self.negative_acks.remove(entry_key);

        if id.batch_index >= 0 {
            #[allow(clippy::cast_sign_loss)] // Checked non-negative.
            let bit = id.batch_index as u32;
            if let Some(acker) = self.batch_ackers.get(&entry_key) {
                let complete = acker.lock().expect("lock poisoned").ack_individual(bit);
                if complete {
                    self.batch_ackers.remove(&entry_key);
                    self.unacked.remove(entry_key);
                    self.dead_letter.remove(entry_key);
                    self.send_acks(entry_key, AckType::Individual).await;
                }
            } else {
                // Batch state was dropped (reconnect); ack the entry.
                self.unacked.remove(entry_key);
                self.send_acks(entry_key, AckType::Individual).await;
            }
        } else {
            self.unacked.remove(entry_key);
            self.dead_letter.remove(entry_key);
            self.send_acks(id, AckType::Individual).await;
        }

        for interceptor in &self.interceptors {
            interceptor.on_acknowledge(id);
        }
        Ok(())
    }

    async fn ack_cumulative(&mut self, id: MessageId) -> Result<()> {
        if self
            .config
            .subscription_type
            .supports_individual_redelivery()
        {
            // Shared distributions have no single cursor to advance.
            return Err(ConsumerError::InvalidConfig {
                message: "cumulative ack requires an exclusive or failover subscription".into(),
            });
        }

        let entry_key = id.entry_key();

        if id.batch_index >= 0 {
            #[allow(clippy::cast_sign_loss)]
            let bit = id.batch_index as u32;
            if let Some(acker) = self.batch_ackers.get(&entry_key).cloned() {
                let complete = acker.lock().expect("lock poisoned").ack_group(bit);
                if complete {
                    self.batch_ackers.remove(&entry_key);
                    self.unacked.remove_until(entry_key);
                    self.send_acks(entry_key, AckType::Cumulative).await;
                } else {
                    let already_sent = acker
                        .lock()
                        .expect("lock poisoned")
                        .prev_batch_cumulatively_acked();
                    if !already_sent {
                        // Advance the cursor to the end of the previous
                        // entry; the rest of this batch is still owed.
                        let prev = id.prev_entry();
                        self.unacked.remove_until(prev);
                        self.send_acks(prev, AckType::Cumulative).await;
                        acker
                            .lock()
                            .expect("lock poisoned")
                            .set_prev_batch_cumulatively_acked();
                    }
                }
            } else {
                let prev = id.prev_entry();
                self.unacked.remove_until(prev);
                self.send_acks(prev, AckType::Cumulative).await;
            }
        } else {
            self.unacked.remove_until(id);
            self.send_acks(id, AckType::Cumulative).await;
        }

        for interceptor in &self.interceptors {
            interceptor.on_acknowledge_cumulative(id);
        }
        Ok(())
    }

    async fn send_acks(&mut self, id: MessageId, ack_type: AckType) {
        let frames = self.ack_grouping.add(id, ack_type);
        self.send_ack_frames(frames).await;
    }

    async fn send_ack_frames(&mut self, frames: Vec<GroupedAcks>) {
        for frame in frames {
            let Some(cnx) = self.ready_cnx() else {
                debug!("dropping ack frame, not connected");
                self.stats.record_ack_failed();
                continue;
            };
            let ack = Ack {
                consumer_id: self.consumer_id,
                ack_type: frame.ack_type,
                ids: frame.ids,
                validation_error: None,
            };
            match cnx.send_ack(ack).await {
                Ok(()) => self.stats.record_ack_sent(),
                Err(err) => {
                    warn!(error = %err, "ack frame failed");
                    self.stats.record_ack_failed();
                }
            }
        }
    }

    async fn flush_grouped_acks(&mut self) {
        let frames = self.ack_grouping.flush();
        self.send_ack_frames(frames).await;
    }

    fn handle_negative_ack(&mut self, id: MessageId) {
        let entry_key = id.entry_key();
        self.negative_acks.add(entry_key, self.now_ms());
        self.unacked.remove(entry_key);
    }

    // -------------------------------------------------------------------------
    // Redelivery
    // -------------------------------------------------------------------------

    async fn handle_unacked_tick(&mut self) {
        let expired = self.unacked.tick();
        if expired.is_empty() {
            return;
        }
        warn!(
            consumer = %self.consumer_id,
            count = expired.len(),
            "ack timeout expired, requesting redelivery"
        );
        for interceptor in &self.interceptors {
            interceptor.on_ack_timeout_send(&expired);
        }
        self.post_redeliver(expired);
    }

    async fn handle_negative_ack_tick(&mut self) {
        let due = self.negative_acks.drain_due(self.now_ms());
        if due.is_empty() {
            return;
        }
        for interceptor in &self.interceptors {
            interceptor.on_negative_acks_send(&due);
        }
        self.post_redeliver(due);
    }

    /// Enqueues a per-id redelivery request behind everything already
    /// on the command queue, the same serialized path application
    /// requests take. The reply receiver is dropped; failures are
    /// logged by the command handler.
    fn post_redeliver(&self, ids: Vec<MessageId>) {
        let (reply, _) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(SessionCommand::RedeliverUnacknowledged { ids, reply });
    }

    async fn redeliver_ids(&mut self, ids: Vec<MessageId>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        if !self
            .config
            .subscription_type
            .supports_individual_redelivery()
        {
            return self.redeliver_all().await;
        }

        // Messages still buffered locally need no broker round-trip.
        let set: HashSet<MessageId> = ids.iter().copied().collect();
        let removed = self.queue.purge_head_prefix(&set);
        if removed > 0 {
            self.credit_permits(removed).await;
        }

        let mut to_request = Vec::with_capacity(ids.len());
        for id in ids {
            let entry_key = id.entry_key();
            if self.dead_letter.process(entry_key).await {
                // Dead-lettered: take the original out of circulation.
                self.unacked.remove(entry_key);
                self.negative_acks.remove(entry_key);
                self.send_acks(entry_key, AckType::Individual).await;
            } else {
                to_request.push(id);
            }
        }

        if to_request.is_empty() {
            return Ok(());
        }
        self.stats.record_redelivered(to_request.len() as u64);

        let Some(cnx) = self.ready_cnx() else {
            warn!("skipping redelivery request, not connected");
            return Ok(());
        };
        for chunk in to_request.chunks(self.limits.max_redeliver_ids_per_request as usize) {
            let request = Redeliver {
                consumer_id: self.consumer_id,
                ids: Some(chunk.to_vec()),
            };
            cnx.redeliver(request).await.map_err(ConsumerError::from)?;
        }
        Ok(())
    }

    async fn redeliver_all(&mut self) -> Result<()> {
        let Some(cnx) = self.ready_cnx() else {
            warn!("skipping redeliver-all, not connected");
            return Ok(());
        };

        cnx.redeliver(Redeliver {
            consumer_id: self.consumer_id,
            ids: None,
        })
        .await
        .map_err(ConsumerError::from)?;

        let dropped = self.queue.clear();
        if dropped > 0 {
            #[allow(clippy::cast_possible_truncation)] // Bounded by receiver_queue_size.
            self.credit_permits(dropped as u32).await;
        }
        self.unacked.clear();
        self.stats.record_redelivered(dropped as u64);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Seek and position queries
    // -------------------------------------------------------------------------

    async fn handle_seek(&mut self, target: SeekTarget) -> Result<()> {
        let Some(cnx) = self.ready_cnx() else {
            return Err(ConsumerError::NotConnected);
        };

        let seek = Seek {
            consumer_id: self.consumer_id,
            request_id: cnx.next_request_id(),
            target,
        };
        cnx.seek(seek).await.map_err(ConsumerError::from)?;

        self.during_seek = Some(match target {
            SeekTarget::MessageId(id) => id,
            SeekTarget::Timestamp(_) => MessageId::earliest(),
        });
        self.last_dequeued = MessageId::earliest();

        let frames = self.ack_grouping.flush();
        self.send_ack_frames(frames).await;
        self.ack_grouping.clear();

        self.queue.clear();
        self.batch_ackers.clear();

        info!(consumer = %self.consumer_id, ?target, "seek complete");
        Ok(())
    }

    async fn handle_has_message_available(&mut self) -> Result<bool> {
        let start = self.start_message_id.unwrap_or(self.last_dequeued);

        if self.last_dequeued.is_earliest() {
            if start.is_latest() {
                // Pin the cursor at the current end so the answer stays
                // stable across reconnects.
                let last = self.fetch_last_message_id().await?;
                self.handle_seek(SeekTarget::MessageId(last)).await?;
                return Ok(self.config.reset_include_head);
            }
            if has_more(
                self.shared.last_message_id_in_broker(),
                start,
                self.config.reset_include_head,
            ) {
                return Ok(true);
            }
            let last = self.fetch_last_message_id().await?;
            Ok(has_more(last, start, self.config.reset_include_head))
        } else {
            if has_more(
                self.shared.last_message_id_in_broker(),
                self.last_dequeued,
                false,
            ) {
                return Ok(true);
            }
            let last = self.fetch_last_message_id().await?;
            Ok(has_more(last, self.last_dequeued, false))
        }
    }

    async fn fetch_last_message_id(&mut self) -> Result<MessageId> {
        let deadline = Instant::now() + self.config.operation_timeout * 2;
        let mut backoff = Backoff::new(BackoffConfig {
            initial: std::time::Duration::from_millis(100),
            max: self.config.operation_timeout,
            mandatory_stop: self.config.operation_timeout * 2,
        });

        loop {
            let Some(cnx) = self.ready_cnx() else {
                return Err(ConsumerError::NotConnected);
            };
            let request = GetLastMessageId {
                consumer_id: self.consumer_id,
                request_id: cnx.next_request_id(),
            };
            match cnx.get_last_message_id(request).await {
                Ok(id) => {
                    self.shared.set_last_in_broker(id);
                    return Ok(id);
                }
                Err(wire) => {
                    let err = ConsumerError::from(wire);
                    if err.is_retriable() && Instant::now() < deadline {
                        let delay = backoff.next_delay();
                        debug!(error = %err, delay_ms = delay.as_millis() as u64, "retrying get_last_message_id");
                        tokio::time::sleep(delay).await;
                    } else {
                        return Err(err);
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    async fn handle_close(&mut self, reply: oneshot::Sender<Result<()>>) {
        if self.is_terminal() {
            let _ = reply.send(Ok(()));
            return;
        }

        match self.ready_active_cnx() {
            Some(cnx) => {
                // Acks posted before this close must reach the broker.
                self.flush_grouped_acks().await;
                self.state = ConnectionState::Closing;
                let close = CloseConsumer {
                    consumer_id: self.consumer_id,
                    request_id: cnx.next_request_id(),
                };
                match cnx.close_consumer(close).await {
                    Ok(()) => {
                        self.stop_consumer(Some(cnx)).await;
                        self.state = ConnectionState::Closed;
                        let _ = reply.send(Ok(()));
                    }
                    Err(wire) => {
                        self.state = ConnectionState::Ready(cnx);
                        let _ = reply.send(Err(wire.into()));
                    }
                }
            }
            None => {
                self.stop_consumer(None).await;
                self.state = ConnectionState::Closed;
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn handle_unsubscribe(&mut self, reply: oneshot::Sender<Result<()>>) {
        match self.ready_active_cnx() {
            Some(cnx) => {
                self.flush_grouped_acks().await;
                self.state = ConnectionState::Closing;
                let unsubscribe = Unsubscribe {
                    consumer_id: self.consumer_id,
                    request_id: cnx.next_request_id(),
                };
                match cnx.unsubscribe(unsubscribe).await {
                    Ok(()) => {
                        self.stop_consumer(Some(cnx)).await;
                        self.state = ConnectionState::Closed;
                        let _ = reply.send(Ok(()));
                    }
                    Err(wire) => {
                        self.state = ConnectionState::Ready(cnx);
                        let _ = reply.send(Err(wire.into()));
                    }
                }
            }
            None => {
                self.stop_consumer(None).await;
                self.state = ConnectionState::Closed;
                let _ = reply.send(Ok(()));
            }
        }
    }

    /// Tears down trackers, waiters and callbacks. Idempotent.
    async fn stop_consumer(&mut self, cnx: Option<Arc<dyn BrokerConnection>>) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.shared.closed.store(true, Ordering::Release);

        // Flush pending acks before the tracker closes so acks posted
        // before a successful close reach the broker.
        let frames = self.ack_grouping.close();
        if let Some(cnx) = &cnx {
            if cnx.is_active() {
                for frame in frames {
                    let ack = Ack {
                        consumer_id: self.consumer_id,
                        ack_type: frame.ack_type,
                        ids: frame.ids,
                        validation_error: None,
                    };
                    if let Err(err) = cnx.send_ack(ack).await {
                        debug!(error = %err, "final ack flush failed");
                    } else {
                        self.stats.record_ack_sent();
                    }
                }
            }
            cnx.remove_consumer(self.consumer_id);
        }

        self.unacked.close();
        self.negative_acks.clear();
        self.dead_letter.clear();
        self.batch_ackers.clear();
        self.queue.clear();

        for interceptor in &self.interceptors {
            interceptor.close();
        }

        while let Some(waiter) = self.receive_waiters.pop_front() {
            let _ = waiter.send(Err(ConsumerError::AlreadyClosed));
        }
        while let Some(mut waiter) = self.batch_waiters.pop_front() {
            waiter.cancel_timeout();
            let _ = waiter.reply.send(Err(ConsumerError::AlreadyClosed));
        }

        if let Some(tsc) = self.subscribe_tsc.take() {
            let _ = tsc.send(Err(ConsumerError::AlreadyClosed));
        }
        if let Some(remove_self) = self.remove_self.take() {
            remove_self();
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Closed | ConnectionState::Failed
        )
    }

    fn ready_cnx(&self) -> Option<Arc<dyn BrokerConnection>> {
        match &self.state {
            ConnectionState::Ready(cnx) => Some(Arc::clone(cnx)),
            _ => None,
        }
    }

    fn ready_active_cnx(&self) -> Option<Arc<dyn BrokerConnection>> {
        self.ready_cnx().filter(|cnx| cnx.is_active())
    }

    fn resolve_subscribe(&mut self, result: Result<()>) {
        if let Some(tsc) = self.subscribe_tsc.take() {
            let _ = tsc.send(result);
        }
    }

    #[allow(clippy::cast_possible_truncation)] // Session lifetimes fit u64 ms.
    fn now_ms(&self) -> u64 {
        self.clock_base.elapsed().as_millis() as u64
    }
}

/// Whether the broker holds messages past `reference`.
///
/// An empty partition reports `entry_id == -1` and never has more.
fn has_more(broker: MessageId, reference: MessageId, inclusive: bool) -> bool {
    if broker.entry_id == -1 {
        return false;
    }
    if inclusive {
        broker >= reference
    } else {
        broker > reference
    }
}
