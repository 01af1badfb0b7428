//! Simulated connection for testing the session engine.
//!
//! [`SimulatedConnection`] records every command the session sends,
//! returns scripted results for request/response commands, and lets a
//! test inject broker events into registered consumers. It plays the
//! role the simulated transport and stores play in other parts of the
//! stack: a first-class implementation of the production trait that
//! tests drive deterministically.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rill_core::{ConsumerId, MessageId, RequestId};

use crate::commands::{
    Ack, CloseConsumer, ConsumerEvent, Flow, GetLastMessageId, Redeliver, Seek, Subscribe,
    Unsubscribe,
};
use crate::connection::{
    BrokerConnection, ConnectionProvider, EventSink, WireError, WireResult,
};

/// A command recorded by the simulated connection, in send order.
#[derive(Debug, Clone)]
pub enum SentCommand {
    /// A subscribe was sent.
    Subscribe(Subscribe),
    /// A flow grant was sent.
    Flow(Flow),
    /// An ack frame was sent.
    Ack(Ack),
    /// A redelivery request was sent.
    Redeliver(Redeliver),
    /// A seek was sent.
    Seek(Seek),
    /// A last-message-id fetch was sent.
    GetLastMessageId(GetLastMessageId),
    /// A close-consumer was sent.
    CloseConsumer(CloseConsumer),
    /// An unsubscribe was sent.
    Unsubscribe(Unsubscribe),
}

#[derive(Default)]
struct Inner {
    sinks: HashMap<ConsumerId, EventSink>,
    sent: Vec<SentCommand>,
    subscribe_results: VecDeque<WireResult<()>>,
    seek_results: VecDeque<WireResult<()>>,
    last_id_results: VecDeque<WireResult<MessageId>>,
    close_results: VecDeque<WireResult<()>>,
    unsubscribe_results: VecDeque<WireResult<()>>,
}

/// Scriptable in-memory [`BrokerConnection`].
pub struct SimulatedConnection {
    inner: Mutex<Inner>,
    active: AtomicBool,
    next_request_id: AtomicU64,
}

impl Default for SimulatedConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedConnection {
    /// Creates an active connection with no scripted results.
    /// Unscripted request/response commands succeed; unscripted
    /// last-message-id fetches return the earliest sentinel.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            active: AtomicBool::new(true),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Scripts the result of the next unseen subscribe.
    pub fn script_subscribe(&self, result: WireResult<()>) {
        self.lock().subscribe_results.push_back(result);
    }

    /// Scripts the result of the next unseen seek.
    pub fn script_seek(&self, result: WireResult<()>) {
        self.lock().seek_results.push_back(result);
    }

    /// Scripts the result of the next unseen last-message-id fetch.
    pub fn script_last_message_id(&self, result: WireResult<MessageId>) {
        self.lock().last_id_results.push_back(result);
    }

    /// Scripts the result of the next unseen close-consumer.
    pub fn script_close(&self, result: WireResult<()>) {
        self.lock().close_results.push_back(result);
    }

    /// Scripts the result of the next unseen unsubscribe.
    pub fn script_unsubscribe(&self, result: WireResult<()>) {
        self.lock().unsubscribe_results.push_back(result);
    }

    /// Flips connection liveness. While inactive, every command fails
    /// with [`WireError::Inactive`].
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Pushes an event to the sink registered for `id`.
    ///
    /// # Panics
    /// Panics if no consumer with that id is registered — a test driving
    /// events at an unregistered consumer is a bug in the test.
    pub fn emit(&self, id: ConsumerId, event: ConsumerEvent) {
        let sink = {
            let inner = self.lock();
            inner
                .sinks
                .get(&id)
                .cloned()
                .unwrap_or_else(|| panic!("no consumer registered with {id}"))
        };
        sink(event);
    }

    /// Returns true if a sink is registered for `id`.
    #[must_use]
    pub fn has_consumer(&self, id: ConsumerId) -> bool {
        self.lock().sinks.contains_key(&id)
    }

    /// Snapshot of every command sent so far, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<SentCommand> {
        self.lock().sent.clone()
    }

    /// Drains and returns the recorded commands.
    pub fn take_sent(&self) -> Vec<SentCommand> {
        std::mem::take(&mut self.lock().sent)
    }

    /// The flow grants sent so far, in order.
    #[must_use]
    pub fn flows(&self) -> Vec<Flow> {
        self.lock()
            .sent
            .iter()
            .filter_map(|cmd| match cmd {
                SentCommand::Flow(flow) => Some(*flow),
                _ => None,
            })
            .collect()
    }

    /// The redelivery requests sent so far, in order.
    #[must_use]
    pub fn redeliveries(&self) -> Vec<Redeliver> {
        self.lock()
            .sent
            .iter()
            .filter_map(|cmd| match cmd {
                SentCommand::Redeliver(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    /// The ack frames sent so far, in order.
    #[must_use]
    pub fn acks(&self) -> Vec<Ack> {
        self.lock()
            .sent
            .iter()
            .filter_map(|cmd| match cmd {
                SentCommand::Ack(a) => Some(a.clone()),
                _ => None,
            })
            .collect()
    }

    /// The subscribes sent so far, in order.
    #[must_use]
    pub fn subscribes(&self) -> Vec<Subscribe> {
        self.lock()
            .sent
            .iter()
            .filter_map(|cmd| match cmd {
                SentCommand::Subscribe(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("lock poisoned")
    }

    fn check_active(&self) -> WireResult<()> {
        if self.active.load(Ordering::Acquire) {
            Ok(())
        } else {
            tracing::trace!("command rejected, connection inactive");
            Err(WireError::Inactive)
        }
    }

    fn record(&self, cmd: SentCommand) {
        self.lock().sent.push(cmd);
    }
}

#[async_trait]
impl BrokerConnection for SimulatedConnection {
    fn next_request_id(&self) -> RequestId {
        RequestId::new(self.next_request_id.fetch_add(1, Ordering::Relaxed))
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn register_consumer(&self, id: ConsumerId, sink: EventSink) {
        self.lock().sinks.insert(id, sink);
    }

    fn remove_consumer(&self, id: ConsumerId) {
        self.lock().sinks.remove(&id);
    }

    async fn subscribe(&self, cmd: Subscribe) -> WireResult<()> {
        self.check_active()?;
        self.record(SentCommand::Subscribe(cmd));
        self.lock().subscribe_results.pop_front().unwrap_or(Ok(()))
    }

    async fn send_flow(&self, cmd: Flow) -> WireResult<()> {
        self.check_active()?;
        self.record(SentCommand::Flow(cmd));
        Ok(())
    }

    async fn send_ack(&self, cmd: Ack) -> WireResult<()> {
        self.check_active()?;
        self.record(SentCommand::Ack(cmd));
        Ok(())
    }

    async fn redeliver(&self, cmd: Redeliver) -> WireResult<()> {
        self.check_active()?;
        self.record(SentCommand::Redeliver(cmd));
        Ok(())
    }

    async fn seek(&self, cmd: Seek) -> WireResult<()> {
        self.check_active()?;
        self.record(SentCommand::Seek(cmd));
        self.lock().seek_results.pop_front().unwrap_or(Ok(()))
    }

    async fn get_last_message_id(&self, cmd: GetLastMessageId) -> WireResult<MessageId> {
        self.check_active()?;
        self.record(SentCommand::GetLastMessageId(cmd));
        self.lock()
            .last_id_results
            .pop_front()
            .unwrap_or(Ok(MessageId::earliest()))
    }

    async fn close_consumer(&self, cmd: CloseConsumer) -> WireResult<()> {
        self.check_active()?;
        self.record(SentCommand::CloseConsumer(cmd));
        self.lock().close_results.pop_front().unwrap_or(Ok(()))
    }

    async fn unsubscribe(&self, cmd: Unsubscribe) -> WireResult<()> {
        self.check_active()?;
        self.record(SentCommand::Unsubscribe(cmd));
        self.lock()
            .unsubscribe_results
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

#[derive(Default)]
struct ProviderInner {
    queued: VecDeque<Arc<SimulatedConnection>>,
    current: Option<Arc<SimulatedConnection>>,
    fail_next: u32,
    connects: u32,
}

/// Scriptable [`ConnectionProvider`] handing out simulated connections.
///
/// Queued connections are returned in order; once the queue is empty the
/// most recent connection is returned again (the pool's cached-connection
/// behavior). With nothing queued at all, a fresh default connection is
/// created on first use.
#[derive(Default)]
pub struct SimulatedProvider {
    inner: Mutex<ProviderInner>,
}

impl SimulatedProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider that hands out the given connection.
    #[must_use]
    pub fn with_connection(cnx: Arc<SimulatedConnection>) -> Self {
        let provider = Self::new();
        provider.push(cnx);
        provider
    }

    /// Queues a connection to be returned by a future `connect`.
    pub fn push(&self, cnx: Arc<SimulatedConnection>) {
        self.lock().queued.push_back(cnx);
    }

    /// Makes the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.lock().fail_next = n;
    }

    /// Number of connect attempts so far (including failed ones).
    #[must_use]
    pub fn connect_count(&self) -> u32 {
        self.lock().connects
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProviderInner> {
        self.inner.lock().expect("lock poisoned")
    }
}

#[async_trait]
impl ConnectionProvider for SimulatedProvider {
    async fn connect(&self, _topic: &str) -> WireResult<Arc<dyn BrokerConnection>> {
        let mut inner = self.lock();
        inner.connects += 1;

        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(WireError::SendFailed {
                message: "connect refused".into(),
            });
        }

        let cnx = if let Some(next) = inner.queued.pop_front() {
            inner.current = Some(Arc::clone(&next));
            next
        } else if let Some(current) = &inner.current {
            Arc::clone(current)
        } else {
            let fresh = Arc::new(SimulatedConnection::new());
            inner.current = Some(Arc::clone(&fresh));
            fresh
        };

        Ok(cnx)
    }
}
