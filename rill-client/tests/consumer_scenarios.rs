//! End-to-end session scenarios driven through the simulated connection.
//!
//! Every test runs on a paused clock: timer-driven behavior (ack
//! grouping, negative-ack delay, ack timeout, reconnect backoff) is
//! exercised by advancing time, never by real waiting.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rill_client::{
    Consumer, ConsumerConfig, ConsumerHooks, DeadLetterMessage, DeadLetterPolicy, DeadLetterSink,
};
use rill_core::{
    BrokerErrorCode, BytesSchema, ConsumerError, MessageId, RawMessage, Schema,
};
use rill_wire::{
    encode_batch, ConsumerEvent, SentCommand, SimulatedConnection, SimulatedProvider,
    SingleMessageMeta, SubMessage, SubscriptionMode, SubscriptionType, ValidationError, WireError,
};

fn schema() -> Arc<dyn Schema<Bytes>> {
    Arc::new(BytesSchema)
}

fn config(topic: &str) -> ConsumerConfig {
    let mut config = ConsumerConfig::new(topic, "test-sub");
    // Most tests assert frames directly; disable grouping by default
    // and re-enable it where the test is about grouping.
    config.ack_group_interval = Duration::ZERO;
    config.stat_interval = Duration::ZERO;
    config
}

fn raw(entry: i64, payload: &str) -> RawMessage {
    RawMessage::new(
        MessageId::new(1, entry, -1, -1),
        Bytes::from(payload.to_owned()),
    )
}

async fn connect(
    config: ConsumerConfig,
    cnx: &Arc<SimulatedConnection>,
) -> Consumer<Bytes> {
    let provider = Arc::new(SimulatedProvider::with_connection(Arc::clone(cnx)));
    Consumer::subscribe(config, provider, schema())
        .await
        .expect("subscribe")
}

fn emit(cnx: &SimulatedConnection, consumer: &Consumer<Bytes>, raw: RawMessage) {
    cnx.emit(consumer.consumer_id(), ConsumerEvent::Message(raw));
}

/// Lets the actor drain its queue and fire any timers due in `ms`.
async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

// -----------------------------------------------------------------------------
// Scenario 1: flow refill at half queue
// -----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn flow_refill_at_half_queue() {
    let cnx = Arc::new(SimulatedConnection::new());
    let mut cfg = config("events-0");
    cfg.receiver_queue_size = 10;
    let consumer = connect(cfg, &cnx).await;

    // Initial grant covers the whole queue.
    assert_eq!(cnx.flows().len(), 1);
    assert_eq!(cnx.flows()[0].permits, 10);

    for entry in 0..10 {
        emit(&cnx, &consumer, raw(entry, "payload"));
    }
    settle(1).await;

    for _ in 0..5 {
        consumer.receive().await.expect("receive");
    }
    settle(1).await;

    // Exactly one refill of 5 after the 5th consume, counter back at 0.
    let flows = cnx.flows();
    assert_eq!(flows.len(), 2);
    assert_eq!(flows[1].permits, 5);

    consumer.close().await.unwrap();
}

// -----------------------------------------------------------------------------
// Scenario 2: batch split with prior index
// -----------------------------------------------------------------------------

fn batch_entry(entry: i64, payloads: &[&str]) -> RawMessage {
    let subs: Vec<SubMessage> = payloads
        .iter()
        .map(|p| SubMessage {
            meta: SingleMessageMeta::default(),
            payload: Bytes::from((*p).to_owned()),
        })
        .collect();
    let mut raw = RawMessage::new(MessageId::new(1, entry, -1, -1), encode_batch(&subs));
    raw.metadata.num_messages = u32::try_from(payloads.len()).unwrap();
    raw
}

#[tokio::test(start_paused = true)]
async fn batch_split_skips_prior_indices() {
    let cnx = Arc::new(SimulatedConnection::new());
    let mut cfg = config("events-0");
    cfg.receiver_queue_size = 6;
    cfg.subscription_mode = SubscriptionMode::NonDurable;
    cfg.start_message_id = Some(MessageId::new(1, 7, -1, 2));
    cfg.reset_include_head = false;
    let consumer = connect(cfg, &cnx).await;

    emit(&cnx, &consumer, batch_entry(7, &["a", "b", "c", "d"]));
    settle(1).await;

    // Sub-indices 0..=2 are prior to the resume position: skipped and
    // credited back. With a queue of 6 the credit of 3 crosses the half
    // threshold immediately.
    let flows = cnx.flows();
    assert_eq!(flows.len(), 2);
    assert_eq!(flows[1].permits, 3);

    let message = consumer.receive().await.expect("receive");
    assert_eq!(message.id, MessageId::new(1, 7, -1, 3));
    assert_eq!(message.value().unwrap(), &Bytes::from_static(b"d"));

    consumer.close().await.unwrap();
}

// -----------------------------------------------------------------------------
// Scenario 3: negative ack delays redelivery
// -----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn negative_ack_delays_redelivery() {
    let cnx = Arc::new(SimulatedConnection::new());
    let mut cfg = config("events-0");
    cfg.subscription_type = SubscriptionType::Shared;
    cfg.negative_ack_redelivery_delay = Duration::from_millis(100);
    let consumer = connect(cfg, &cnx).await;

    emit(&cnx, &consumer, raw(1, "m1"));
    let m1 = consumer.receive().await.expect("receive");
    consumer.negative_acknowledge(m1.id).unwrap();

    settle(90).await;
    assert!(cnx.redeliveries().is_empty(), "redelivered before delay");

    settle(60).await;
    let redeliveries = cnx.redeliveries();
    assert_eq!(redeliveries.len(), 1);
    assert_eq!(redeliveries[0].ids.as_deref(), Some(&[m1.id][..]));

    consumer.close().await.unwrap();
}

// -----------------------------------------------------------------------------
// Scenario 4: reconnect resume, non-durable
// -----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn reconnect_resumes_after_last_dequeued() {
    let cnx = Arc::new(SimulatedConnection::new());
    let mut cfg = config("events-0");
    cfg.subscription_mode = SubscriptionMode::NonDurable;
    cfg.start_message_id = Some(MessageId::earliest());
    let consumer = connect(cfg, &cnx).await;

    for entry in 1..=3 {
        emit(&cnx, &consumer, raw(entry, "m"));
    }
    settle(1).await;
    let mut last = MessageId::earliest();
    for _ in 0..3 {
        last = consumer.receive().await.expect("receive").id;
    }

    cnx.emit(consumer.consumer_id(), ConsumerEvent::Disconnected);
    settle(2000).await;

    let subscribes = cnx.subscribes();
    assert_eq!(subscribes.len(), 2, "expected a resubscribe");
    assert!(!subscribes[1].durable);
    assert_eq!(subscribes[1].start_message_id, Some(last));
    assert_eq!(last, MessageId::new(1, 3, -1, -1));

    consumer.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn durable_reconnect_leaves_cursor_to_broker() {
    let cnx = Arc::new(SimulatedConnection::new());
    let consumer = connect(config("events-0"), &cnx).await;

    emit(&cnx, &consumer, raw(1, "m"));
    consumer.receive().await.expect("receive");

    cnx.emit(consumer.consumer_id(), ConsumerEvent::Disconnected);
    settle(2000).await;

    let subscribes = cnx.subscribes();
    assert_eq!(subscribes.len(), 2);
    assert!(subscribes[1].durable);
    assert_eq!(subscribes[1].start_message_id, None);

    consumer.close().await.unwrap();
}

// -----------------------------------------------------------------------------
// Scenario 5: seek target wins on reconnect
// -----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn seek_target_wins_on_reconnect() {
    let cnx = Arc::new(SimulatedConnection::new());
    let mut cfg = config("events-0");
    cfg.subscription_mode = SubscriptionMode::NonDurable;
    cfg.start_message_id = Some(MessageId::earliest());
    let consumer = connect(cfg, &cnx).await;

    let target = MessageId::new(4, 2, -1, -1);
    consumer.seek(target).await.expect("seek");

    cnx.emit(consumer.consumer_id(), ConsumerEvent::Disconnected);
    settle(2000).await;

    let subscribes = cnx.subscribes();
    assert_eq!(subscribes.len(), 2);
    assert_eq!(subscribes[1].start_message_id, Some(target));

    consumer.close().await.unwrap();
}

// -----------------------------------------------------------------------------
// Scenario 6: dead-letter path
// -----------------------------------------------------------------------------

#[derive(Default)]
struct RecordingSink {
    published: Mutex<Vec<(String, MessageId)>>,
}

#[async_trait]
impl DeadLetterSink for RecordingSink {
    async fn publish(
        &self,
        topic: &str,
        message: DeadLetterMessage,
    ) -> Result<(), ConsumerError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), message.id));
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn dead_letter_routes_after_max_redelivery() {
    let cnx = Arc::new(SimulatedConnection::new());
    let provider = Arc::new(SimulatedProvider::with_connection(Arc::clone(&cnx)));
    let sink = Arc::new(RecordingSink::default());

    let mut cfg = config("events-0");
    cfg.subscription_type = SubscriptionType::Shared;
    cfg.negative_ack_redelivery_delay = Duration::from_millis(100);
    // Grouping on: the pending ack also drives the duplicate filter.
    cfg.ack_group_interval = Duration::from_millis(50);
    cfg.dead_letter = Some(DeadLetterPolicy {
        max_redelivery_count: 2,
        dead_letter_topic: None,
    });

    let hooks = ConsumerHooks {
        dead_letter_sink: Some(Arc::clone(&sink) as Arc<dyn DeadLetterSink>),
        ..ConsumerHooks::default()
    };
    let consumer = Consumer::subscribe_with(cfg, provider, schema(), hooks)
        .await
        .expect("subscribe");

    // Delivery already at the redelivery limit: buffered for the DLQ.
    let mut first = raw(1, "poison");
    first.redelivery_count = 2;
    emit(&cnx, &consumer, first);

    let m1 = consumer.receive().await.expect("receive");
    consumer.negative_acknowledge(m1.id).unwrap();

    // The nack fires; instead of a redelivery request the message goes
    // to the DLQ and is individually acked.
    settle(200).await;
    {
        let published = sink.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "events-0-test-sub-DLQ");
        assert_eq!(published[0].1, m1.id);
    }
    assert!(cnx.redeliveries().is_empty());

    // A raced broker redelivery of the same id hits the duplicate
    // filter and is dropped, not re-buffered.
    let mut second = raw(1, "poison");
    second.redelivery_count = 3;
    emit(&cnx, &consumer, second);
    settle(1).await;

    let received = tokio::time::timeout(Duration::from_millis(200), consumer.receive()).await;
    assert!(received.is_err(), "dead-lettered message was redelivered");

    // Exactly one publish, and the original got an individual ack.
    settle(100).await;
    assert_eq!(sink.published.lock().unwrap().len(), 1);
    assert!(cnx
        .acks()
        .iter()
        .any(|ack| ack.validation_error.is_none() && ack.ids.contains(&m1.id)));

    consumer.close().await.unwrap();
}

// -----------------------------------------------------------------------------
// Subscribe failure handling
// -----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn subscribe_retries_retriable_errors() {
    let cnx = Arc::new(SimulatedConnection::new());
    cnx.script_subscribe(Err(WireError::Broker {
        code: BrokerErrorCode::ServiceNotReady,
        message: "loading".into(),
    }));

    let consumer = connect(config("events-0"), &cnx).await;
    assert_eq!(cnx.subscribes().len(), 2);
    consumer.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn fatal_subscribe_error_fails_permanently() {
    let cnx = Arc::new(SimulatedConnection::new());
    cnx.script_subscribe(Err(WireError::Broker {
        code: BrokerErrorCode::AuthorizationError,
        message: "denied".into(),
    }));
    let provider = Arc::new(SimulatedProvider::with_connection(Arc::clone(&cnx)));

    let result = Consumer::subscribe(config("events-0"), provider, schema()).await;
    match result {
        Err(ConsumerError::Broker { code, .. }) => {
            assert_eq!(code, BrokerErrorCode::AuthorizationError);
        }
        other => panic!("expected broker error, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn connect_failures_are_retried_with_backoff() {
    let cnx = Arc::new(SimulatedConnection::new());
    let provider = Arc::new(SimulatedProvider::new());
    provider.fail_next_connects(2);
    provider.push(Arc::clone(&cnx));

    let consumer = Consumer::subscribe(config("events-0"), Arc::clone(&provider) as _, schema())
        .await
        .expect("subscribe after retries");

    assert_eq!(provider.connect_count(), 3);
    consumer.close().await.unwrap();
}

// -----------------------------------------------------------------------------
// Delivery and waiter discipline
// -----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn pending_receive_is_served_on_arrival() {
    let cnx = Arc::new(SimulatedConnection::new());
    let consumer = connect(config("events-0"), &cnx).await;

    let waiting = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.receive().await })
    };
    settle(1).await;

    emit(&cnx, &consumer, raw(9, "direct"));
    let message = waiting.await.unwrap().expect("receive");
    assert_eq!(message.id.entry_id, 9);

    consumer.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn batch_receive_returns_buffered_on_timeout() {
    let cnx = Arc::new(SimulatedConnection::new());
    let mut cfg = config("events-0");
    cfg.batch_receive.max_num_messages = 10;
    cfg.batch_receive.timeout = Duration::from_millis(100);
    let consumer = connect(cfg, &cnx).await;

    emit(&cnx, &consumer, raw(1, "a"));
    emit(&cnx, &consumer, raw(2, "b"));
    settle(1).await;

    let bundle = consumer.batch_receive().await.expect("batch receive");
    assert_eq!(bundle.len(), 2);

    consumer.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn batch_receive_completes_early_at_threshold() {
    let cnx = Arc::new(SimulatedConnection::new());
    let mut cfg = config("events-0");
    cfg.batch_receive.max_num_messages = 2;
    cfg.batch_receive.timeout = Duration::from_secs(3600);
    let consumer = connect(cfg, &cnx).await;

    let waiting = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.batch_receive().await })
    };
    settle(1).await;

    emit(&cnx, &consumer, raw(1, "a"));
    emit(&cnx, &consumer, raw(2, "b"));

    let bundle = waiting.await.unwrap().expect("batch receive");
    assert_eq!(bundle.len(), 2);

    consumer.close().await.unwrap();
}

// -----------------------------------------------------------------------------
// Acknowledgement
// -----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn batch_entry_acked_once_all_sub_messages_acked() {
    let cnx = Arc::new(SimulatedConnection::new());
    let consumer = connect(config("events-0"), &cnx).await;

    emit(&cnx, &consumer, batch_entry(5, &["a", "b", "c"]));
    settle(1).await;

    for _ in 0..2 {
        let message = consumer.receive().await.unwrap();
        consumer.acknowledge(message.id).await.unwrap();
        assert!(cnx.acks().is_empty(), "partial batch must not ack");
    }

    let message = consumer.receive().await.unwrap();
    consumer.acknowledge(message.id).await.unwrap();

    let acks = cnx.acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].ids, vec![MessageId::new(1, 5, -1, -1)]);

    consumer.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn close_flushes_grouped_acks_before_close_frame() {
    let cnx = Arc::new(SimulatedConnection::new());
    let mut cfg = config("events-0");
    cfg.ack_group_interval = Duration::from_secs(3600);
    let consumer = connect(cfg, &cnx).await;

    emit(&cnx, &consumer, raw(1, "m"));
    let message = consumer.receive().await.unwrap();
    consumer.acknowledge(message.id).await.unwrap();
    assert!(cnx.acks().is_empty(), "grouped ack sent too early");

    consumer.close().await.unwrap();

    let sent = cnx.sent();
    let ack_pos = sent
        .iter()
        .position(|cmd| matches!(cmd, SentCommand::Ack(_)))
        .expect("flushed ack");
    let close_pos = sent
        .iter()
        .position(|cmd| matches!(cmd, SentCommand::CloseConsumer(_)))
        .expect("close frame");
    assert!(ack_pos < close_pos, "ack must be flushed before close");
}

#[tokio::test(start_paused = true)]
async fn cumulative_ack_rejected_on_shared_subscription() {
    let cnx = Arc::new(SimulatedConnection::new());
    let mut cfg = config("events-0");
    cfg.subscription_type = SubscriptionType::Shared;
    let consumer = connect(cfg, &cnx).await;

    let result = consumer
        .acknowledge_cumulative(MessageId::new(1, 1, -1, -1))
        .await;
    assert!(matches!(result, Err(ConsumerError::InvalidConfig { .. })));

    consumer.close().await.unwrap();
}

// -----------------------------------------------------------------------------
// Ack timeout
// -----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn unacked_messages_are_redelivered_after_timeout() {
    let cnx = Arc::new(SimulatedConnection::new());
    let mut cfg = config("events-0");
    cfg.subscription_type = SubscriptionType::Shared;
    cfg.ack_timeout = Duration::from_secs(2);
    cfg.ack_timeout_tick = Duration::from_secs(1);
    let consumer = connect(cfg, &cnx).await;

    emit(&cnx, &consumer, raw(1, "m"));
    let message = consumer.receive().await.unwrap();

    settle(1500).await;
    assert!(cnx.redeliveries().is_empty());

    settle(3000).await;
    let redeliveries = cnx.redeliveries();
    assert_eq!(redeliveries.len(), 1);
    assert_eq!(redeliveries[0].ids.as_deref(), Some(&[message.id][..]));

    consumer.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn acked_messages_never_time_out() {
    let cnx = Arc::new(SimulatedConnection::new());
    let mut cfg = config("events-0");
    cfg.subscription_type = SubscriptionType::Shared;
    cfg.ack_timeout = Duration::from_secs(2);
    cfg.ack_timeout_tick = Duration::from_secs(1);
    let consumer = connect(cfg, &cnx).await;

    emit(&cnx, &consumer, raw(1, "m"));
    let message = consumer.receive().await.unwrap();
    consumer.acknowledge(message.id).await.unwrap();

    settle(10_000).await;
    assert!(cnx.redeliveries().is_empty());

    consumer.close().await.unwrap();
}

// -----------------------------------------------------------------------------
// Corruption discards
// -----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn checksum_mismatch_is_discarded_with_error_ack() {
    let cnx = Arc::new(SimulatedConnection::new());
    let consumer = connect(config("events-0"), &cnx).await;

    let mut corrupt = raw(1, "m");
    corrupt.checksum_ok = false;
    emit(&cnx, &consumer, corrupt);
    settle(1).await;

    let acks = cnx.acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(
        acks[0].validation_error,
        Some(ValidationError::ChecksumMismatch)
    );

    let stats = consumer.get_stats().await.unwrap();
    assert_eq!(stats.num_receive_failed, 1);
    assert_eq!(stats.num_msgs_received, 0);

    consumer.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn uncompressed_size_mismatch_is_discarded() {
    let cnx = Arc::new(SimulatedConnection::new());
    let consumer = connect(config("events-0"), &cnx).await;

    let mut corrupt = raw(1, "abc");
    corrupt.metadata.uncompressed_size = 99;
    emit(&cnx, &consumer, corrupt);
    settle(1).await;

    let acks = cnx.acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(
        acks[0].validation_error,
        Some(ValidationError::UncompressedSizeCorruption)
    );

    consumer.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn undecodable_batch_is_discarded_whole() {
    let cnx = Arc::new(SimulatedConnection::new());
    let consumer = connect(config("events-0"), &cnx).await;

    let mut corrupt = RawMessage::new(MessageId::new(1, 1, -1, -1), Bytes::from_static(&[0x01]));
    corrupt.metadata.num_messages = 3;
    emit(&cnx, &consumer, corrupt);
    settle(1).await;

    let acks = cnx.acks();
    assert_eq!(acks.len(), 1);
    assert_eq!(
        acks[0].validation_error,
        Some(ValidationError::BatchDeserializeError)
    );

    consumer.close().await.unwrap();
}

// -----------------------------------------------------------------------------
// Position queries
// -----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn has_message_available_consults_broker() {
    let cnx = Arc::new(SimulatedConnection::new());
    let consumer = connect(config("events-0"), &cnx).await;

    cnx.script_last_message_id(Ok(MessageId::new(1, 5, -1, -1)));
    assert!(consumer.has_message_available().await.unwrap());

    emit(&cnx, &consumer, raw(6, "m"));
    consumer.receive().await.unwrap();

    // Dequeued up to 1:6; broker reports the same position.
    cnx.script_last_message_id(Ok(MessageId::new(1, 6, -1, -1)));
    assert!(!consumer.has_message_available().await.unwrap());

    consumer.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn has_message_available_from_latest_seeks_to_end() {
    let cnx = Arc::new(SimulatedConnection::new());
    let mut cfg = config("events-0");
    cfg.subscription_mode = SubscriptionMode::NonDurable;
    cfg.start_message_id = Some(MessageId::latest());
    let consumer = connect(cfg, &cnx).await;

    let end = MessageId::new(1, 9, -1, -1);
    cnx.script_last_message_id(Ok(end));

    assert!(!consumer.has_message_available().await.unwrap());
    assert_eq!(consumer.last_message_id_in_broker(), end);

    let seeks: Vec<_> = cnx
        .sent()
        .iter()
        .filter_map(|cmd| match cmd {
            SentCommand::Seek(seek) => Some(*seek),
            _ => None,
        })
        .collect();
    assert_eq!(seeks.len(), 1);

    consumer.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn get_last_message_id_retries_until_deadline() {
    let cnx = Arc::new(SimulatedConnection::new());
    let consumer = connect(config("events-0"), &cnx).await;

    cnx.script_last_message_id(Err(WireError::Broker {
        code: BrokerErrorCode::ServiceNotReady,
        message: "busy".into(),
    }));
    cnx.script_last_message_id(Ok(MessageId::new(2, 2, -1, -1)));

    let id = consumer.get_last_message_id().await.unwrap();
    assert_eq!(id, MessageId::new(2, 2, -1, -1));

    consumer.close().await.unwrap();
}

// -----------------------------------------------------------------------------
// Shutdown
// -----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn close_is_idempotent_and_drains_waiters() {
    let cnx = Arc::new(SimulatedConnection::new());
    let consumer = connect(config("events-0"), &cnx).await;

    let waiting = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.receive().await })
    };
    settle(1).await;

    consumer.close().await.unwrap();
    consumer.close().await.unwrap();

    let result = waiting.await.unwrap();
    assert!(matches!(result, Err(ConsumerError::AlreadyClosed)));

    assert!(matches!(
        consumer.receive().await,
        Err(ConsumerError::AlreadyClosed)
    ));
    assert!(!cnx.has_consumer(consumer.consumer_id()));
}

#[tokio::test(start_paused = true)]
async fn remove_self_fires_on_close() {
    let cnx = Arc::new(SimulatedConnection::new());
    let provider = Arc::new(SimulatedProvider::with_connection(Arc::clone(&cnx)));
    let removed = Arc::new(Mutex::new(false));

    let hooks = ConsumerHooks {
        remove_self: Some(Box::new({
            let removed = Arc::clone(&removed);
            move || *removed.lock().unwrap() = true
        })),
        ..ConsumerHooks::default()
    };
    let consumer = Consumer::subscribe_with(config("events-0"), provider, schema(), hooks)
        .await
        .unwrap();

    consumer.close().await.unwrap();
    assert!(*removed.lock().unwrap());
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_sends_frame_and_stops() {
    let cnx = Arc::new(SimulatedConnection::new());
    let consumer = connect(config("events-0"), &cnx).await;

    consumer.unsubscribe().await.unwrap();

    assert!(cnx
        .sent()
        .iter()
        .any(|cmd| matches!(cmd, SentCommand::Unsubscribe(_))));
    assert!(matches!(
        consumer.receive().await,
        Err(ConsumerError::AlreadyClosed)
    ));
}

// -----------------------------------------------------------------------------
// Redeliver all
// -----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn redeliver_all_clears_queue_and_credits_permits() {
    let cnx = Arc::new(SimulatedConnection::new());
    let mut cfg = config("events-0");
    cfg.receiver_queue_size = 4;
    let consumer = connect(cfg, &cnx).await;

    for entry in 1..=3 {
        emit(&cnx, &consumer, raw(entry, "m"));
    }
    settle(1).await;

    consumer.redeliver_unacknowledged().await.unwrap();

    let redeliveries = cnx.redeliveries();
    assert_eq!(redeliveries.len(), 1);
    assert!(redeliveries[0].ids.is_none());

    // The 3 dropped messages come back as permits (threshold 2).
    let flows = cnx.flows();
    assert_eq!(flows.last().unwrap().permits, 3);

    consumer.close().await.unwrap();
}
