use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use tokio::time::{sleep_until, Instant};

use minbar_core::errors::Result;
use minbar_core::pubsub::{Consumer, MessageStream, QueueMessage, QueueMetadata};

use crate::stream::{subject_matches, StreamState};

/// Upper bound on how long a waiting consumer goes without re-scanning
/// the stream, whatever the notify traffic looks like.
const RESCAN_INTERVAL: Duration = Duration::from_millis(500);

struct DeliveryRecord {
    deadline: Instant,
    deliveries: u64,
}

struct ConsumerInner {
    /// Sequences settled for good (acked or terminated).
    done: HashSet<u64>,
    /// Outstanding and previously-delivered sequences.
    records: HashMap<u64, DeliveryRecord>,
}

/// Durable per-consumer delivery bookkeeping, shared by every handle
/// created under the same durable name.
pub(crate) struct ConsumerState {
    filter: String,
    ack_wait: Duration,
    inner: Mutex<ConsumerInner>,
}

struct Claim {
    seq: u64,
    subject: String,
    data: Arc<Vec<u8>>,
    deliveries: u64,
}

impl ConsumerState {
    pub fn new(filter: String, ack_wait: Duration) -> Self {
        Self {
            filter,
            ack_wait,
            inner: Mutex::new(ConsumerInner {
                done: HashSet::new(),
                records: HashMap::new(),
            }),
        }
    }

    /// Claim the oldest deliverable message, marking it outstanding.
    /// Also reports the earliest outstanding deadline so the caller knows
    /// when a redelivery could become due.
    fn try_claim(&self, stream: &StreamState) -> (Option<Claim>, Option<Instant>) {
        let now = Instant::now();
        let stream_inner = stream.inner.lock();
        let mut inner = self.inner.lock();

        let mut next_deadline: Option<Instant> = None;
        for msg in stream_inner.messages.iter() {
            if !subject_matches(&self.filter, &msg.subject) || inner.done.contains(&msg.seq) {
                continue;
            }
            if let Some(record) = inner.records.get(&msg.seq) {
                if record.deadline > now {
                    next_deadline = Some(next_deadline.map_or(record.deadline, |d: Instant| {
                        d.min(record.deadline)
                    }));
                    continue;
                }
            }
            let record = inner.records.entry(msg.seq).or_insert(DeliveryRecord {
                deadline: now,
                deliveries: 0,
            });
            record.deliveries += 1;
            record.deadline = now + self.ack_wait;
            return (
                Some(Claim {
                    seq: msg.seq,
                    subject: msg.subject.clone(),
                    data: Arc::clone(&msg.data),
                    deliveries: record.deliveries,
                }),
                next_deadline,
            );
        }
        (None, next_deadline)
    }

    fn settle(&self, seq: u64) {
        let mut inner = self.inner.lock();
        inner.records.remove(&seq);
        inner.done.insert(seq);
    }

    fn release(&self, seq: u64) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.get_mut(&seq) {
            record.deadline = Instant::now();
        }
    }

    fn extend(&self, seq: u64) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.records.get_mut(&seq) {
            record.deadline = Instant::now() + self.ack_wait;
        }
    }
}

async fn next_delivery(stream: &Arc<StreamState>, state: &Arc<ConsumerState>) -> BusMessage {
    loop {
        let (claim, next_deadline) = state.try_claim(stream);
        if let Some(claim) = claim {
            return BusMessage {
                claim,
                stream: Arc::clone(stream),
                state: Arc::clone(state),
            };
        }
        let rescan = Instant::now() + RESCAN_INTERVAL;
        let wake_at = next_deadline.map_or(rescan, |d| d.min(rescan));
        tokio::select! {
            _ = stream.wakeup.notified() => {}
            _ = sleep_until(wake_at) => {}
        }
    }
}

/// A handle under one durable name. Dropping it loses nothing; the next
/// handle with the same name resumes from the shared bookkeeping.
pub(crate) struct DurableConsumer {
    stream: Arc<StreamState>,
    state: Arc<ConsumerState>,
}

impl DurableConsumer {
    pub fn new(stream: Arc<StreamState>, state: Arc<ConsumerState>) -> Self {
        Self { stream, state }
    }
}

#[async_trait]
impl Consumer for DurableConsumer {
    async fn messages(&self) -> Result<MessageStream> {
        let seed = (Arc::clone(&self.stream), Arc::clone(&self.state));
        let messages = stream::unfold(seed, |(stream, state)| async move {
            let msg = next_delivery(&stream, &state).await;
            Some((Box::new(msg) as Box<dyn QueueMessage>, (stream, state)))
        });
        Ok(Box::pin(messages))
    }
}

struct BusMessage {
    claim: Claim,
    stream: Arc<StreamState>,
    state: Arc<ConsumerState>,
}

#[async_trait]
impl QueueMessage for BusMessage {
    fn data(&self) -> &[u8] {
        &self.claim.data
    }

    fn subject(&self) -> &str {
        &self.claim.subject
    }

    fn metadata(&self) -> QueueMetadata {
        QueueMetadata {
            stream_sequence: self.claim.seq,
            delivery_count: self.claim.deliveries,
        }
    }

    async fn ack(&self) -> Result<()> {
        self.state.settle(self.claim.seq);
        self.stream.wakeup.notify_waiters();
        Ok(())
    }

    async fn nak(&self) -> Result<()> {
        self.state.release(self.claim.seq);
        self.stream.wakeup.notify_waiters();
        Ok(())
    }

    async fn term(&self) -> Result<()> {
        self.state.settle(self.claim.seq);
        self.stream.wakeup.notify_waiters();
        Ok(())
    }

    async fn in_progress(&self) -> Result<()> {
        self.state.extend(self.claim.seq);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minbar_core::pubsub::{ConsumerConfig, PubSub, Publisher, StreamConfig};
    use tokio_stream::StreamExt;

    use crate::InProcessBus;

    async fn setup(ack_wait: Duration) -> (InProcessBus, MessageStream) {
        let bus = InProcessBus::new();
        bus.create_stream(StreamConfig {
            name: "CONTEXT".into(),
            subjects: vec!["context.sync".into()],
            max_age: Duration::from_secs(24 * 60 * 60),
        })
        .await
        .unwrap();
        let consumer = bus
            .create_consumer(ConsumerConfig {
                stream: "CONTEXT".into(),
                durable_name: "syncer".into(),
                filter_subject: "context.sync".into(),
                ack_wait,
            })
            .await
            .unwrap();
        let messages = consumer.messages().await.unwrap();
        (bus, messages)
    }

    #[tokio::test(start_paused = true)]
    async fn acked_message_is_not_redelivered() {
        let (bus, mut messages) = setup(Duration::from_secs(2)).await;
        bus.durable_publish("context.sync", b"one".to_vec(), "id-1").await.unwrap();

        let msg = messages.next().await.unwrap();
        assert_eq!(msg.metadata().delivery_count, 1);
        msg.ack().await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        let next = tokio::time::timeout(Duration::from_secs(5), messages.next()).await;
        assert!(next.is_err(), "no redelivery expected after ack");
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_message_comes_back_after_deadline() {
        let (bus, mut messages) = setup(Duration::from_secs(2)).await;
        bus.durable_publish("context.sync", b"one".to_vec(), "id-1").await.unwrap();

        let first = messages.next().await.unwrap();
        assert_eq!(first.metadata().delivery_count, 1);
        drop(first);

        let second = messages.next().await.unwrap();
        assert_eq!(second.data(), b"one");
        assert_eq!(second.metadata().delivery_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn nak_requests_immediate_redelivery() {
        let (bus, mut messages) = setup(Duration::from_secs(600)).await;
        bus.durable_publish("context.sync", b"one".to_vec(), "id-1").await.unwrap();

        let msg = messages.next().await.unwrap();
        msg.nak().await.unwrap();

        let again = tokio::time::timeout(Duration::from_secs(5), messages.next())
            .await
            .expect("nak should make the message deliverable now")
            .unwrap();
        assert_eq!(again.metadata().delivery_count, 2);
        again.ack().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn terminated_message_is_dropped_for_good() {
        let (bus, mut messages) = setup(Duration::from_secs(2)).await;
        bus.durable_publish("context.sync", b"bad".to_vec(), "id-1").await.unwrap();
        bus.durable_publish("context.sync", b"good".to_vec(), "id-2").await.unwrap();

        let msg = messages.next().await.unwrap();
        assert_eq!(msg.data(), b"bad");
        msg.term().await.unwrap();

        let next = messages.next().await.unwrap();
        assert_eq!(next.data(), b"good");
        next.ack().await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        let redelivery = tokio::time::timeout(Duration::from_secs(5), messages.next()).await;
        assert!(redelivery.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn in_progress_extends_the_deadline() {
        let (bus, mut messages) = setup(Duration::from_secs(4)).await;
        bus.durable_publish("context.sync", b"slow".to_vec(), "id-1").await.unwrap();

        let msg = messages.next().await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        msg.in_progress().await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        // 6s elapsed but the deadline was pushed out at t=3s, so the
        // message is still outstanding.
        let redelivery = tokio::time::timeout(Duration::from_millis(900), messages.next()).await;
        assert!(redelivery.is_err());
        msg.ack().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn durable_consumers_are_independent() {
        let (bus, mut syncer_msgs) = setup(Duration::from_secs(60)).await;
        let other = bus
            .create_consumer(ConsumerConfig {
                stream: "CONTEXT".into(),
                durable_name: "auditor".into(),
                filter_subject: "context.sync".into(),
                ack_wait: Duration::from_secs(60),
            })
            .await
            .unwrap();
        let mut auditor_msgs = other.messages().await.unwrap();

        bus.durable_publish("context.sync", b"one".to_vec(), "id-1").await.unwrap();

        let a = syncer_msgs.next().await.unwrap();
        let b = auditor_msgs.next().await.unwrap();
        assert_eq!(a.data(), b.data());
        a.ack().await.unwrap();
        b.ack().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn same_durable_name_resumes_shared_state() {
        let (bus, mut messages) = setup(Duration::from_secs(60)).await;
        bus.durable_publish("context.sync", b"one".to_vec(), "id-1").await.unwrap();
        messages.next().await.unwrap().ack().await.unwrap();
        drop(messages);

        let again = bus
            .create_consumer(ConsumerConfig {
                stream: "CONTEXT".into(),
                durable_name: "syncer".into(),
                filter_subject: "context.sync".into(),
                ack_wait: Duration::from_secs(60),
            })
            .await
            .unwrap();
        let mut resumed = again.messages().await.unwrap();

        let next = tokio::time::timeout(Duration::from_secs(5), resumed.next()).await;
        assert!(next.is_err(), "acked message must not reappear for the same durable");
    }

    #[tokio::test(start_paused = true)]
    async fn deliveries_preserve_publish_order() {
        let (bus, mut messages) = setup(Duration::from_secs(60)).await;
        for i in 1..=3 {
            bus.durable_publish("context.sync", vec![i], &format!("id-{i}")).await.unwrap();
        }
        for i in 1..=3u8 {
            let msg = messages.next().await.unwrap();
            assert_eq!(msg.data(), &[i]);
            assert_eq!(msg.metadata().stream_sequence, i as u64);
            msg.ack().await.unwrap();
        }
    }
}
