use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use minbar_core::errors::{MinbarError, Result};
use minbar_core::pubsub::{Consumer, ConsumerConfig, PubAck, PubSub, Publisher, StreamConfig};

use crate::consumer::{ConsumerState, DurableConsumer};

pub(crate) struct StoredMessage {
    pub seq: u64,
    pub subject: String,
    pub data: Arc<Vec<u8>>,
    pub published_at: Instant,
    pub dedup_id: String,
}

pub(crate) struct StreamInner {
    next_seq: u64,
    pub messages: VecDeque<StoredMessage>,
    dedup: HashMap<String, u64>,
}

pub(crate) struct StreamState {
    pub name: String,
    subjects: Vec<String>,
    max_age: Duration,
    pub inner: Mutex<StreamInner>,
    consumers: Mutex<HashMap<String, Arc<ConsumerState>>>,
    /// Woken on publish and on every settle, so waiting consumers
    /// re-scan promptly.
    pub wakeup: Notify,
}

impl StreamState {
    fn accepts(&self, subject: &str) -> bool {
        self.subjects.iter().any(|s| subject_matches(s, subject))
    }

    fn prune_expired(&self, inner: &mut StreamInner, now: Instant) {
        while let Some(front) = inner.messages.front() {
            if now.duration_since(front.published_at) <= self.max_age {
                break;
            }
            let expired = inner
                .messages
                .pop_front()
                .map(|m| m.dedup_id)
                .unwrap_or_default();
            inner.dedup.remove(&expired);
        }
    }
}

/// Exact subject match, with a NATS-style `>` tail wildcard.
pub(crate) fn subject_matches(pattern: &str, subject: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('>') {
        subject.starts_with(prefix)
    } else {
        pattern == subject
    }
}

/// The whole bus: named streams, each with its own retention and durable
/// consumers. Everything lives in process memory; durability here means
/// redelivery-until-acked, not surviving a restart.
#[derive(Default)]
pub struct InProcessBus {
    streams: Mutex<Vec<Arc<StreamState>>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream_for_subject(&self, subject: &str) -> Option<Arc<StreamState>> {
        self.streams
            .lock()
            .iter()
            .find(|s| s.accepts(subject))
            .cloned()
    }

    fn stream_by_name(&self, name: &str) -> Option<Arc<StreamState>> {
        self.streams.lock().iter().find(|s| s.name == name).cloned()
    }
}

#[async_trait]
impl Publisher for InProcessBus {
    async fn durable_publish(
        &self,
        subject: &str,
        data: Vec<u8>,
        dedup_id: &str,
    ) -> Result<PubAck> {
        let stream = self.stream_for_subject(subject).ok_or_else(|| {
            MinbarError::NotFound(format!("no stream accepts subject {subject}"))
        })?;

        let ack = {
            let mut inner = stream.inner.lock();
            let now = Instant::now();
            stream.prune_expired(&mut inner, now);

            if let Some(&seq) = inner.dedup.get(dedup_id) {
                PubAck {
                    stream: stream.name.clone(),
                    sequence: seq,
                    duplicate: true,
                }
            } else {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.messages.push_back(StoredMessage {
                    seq,
                    subject: subject.to_string(),
                    data: Arc::new(data),
                    published_at: now,
                    dedup_id: dedup_id.to_string(),
                });
                inner.dedup.insert(dedup_id.to_string(), seq);
                PubAck {
                    stream: stream.name.clone(),
                    sequence: seq,
                    duplicate: false,
                }
            }
        };

        if !ack.duplicate {
            stream.wakeup.notify_waiters();
        }
        debug!(subject, dedup_id, sequence = ack.sequence, duplicate = ack.duplicate, "published");
        Ok(ack)
    }
}

#[async_trait]
impl PubSub for InProcessBus {
    async fn create_stream(&self, config: StreamConfig) -> Result<()> {
        let mut streams = self.streams.lock();
        if streams.iter().any(|s| s.name == config.name) {
            return Ok(());
        }
        streams.push(Arc::new(StreamState {
            name: config.name,
            subjects: config.subjects,
            max_age: config.max_age,
            inner: Mutex::new(StreamInner {
                next_seq: 1,
                messages: VecDeque::new(),
                dedup: HashMap::new(),
            }),
            consumers: Mutex::new(HashMap::new()),
            wakeup: Notify::new(),
        }));
        Ok(())
    }

    async fn create_consumer(&self, config: ConsumerConfig) -> Result<Box<dyn Consumer>> {
        let stream = self.stream_by_name(&config.stream).ok_or_else(|| {
            MinbarError::NotFound(format!("stream {}", config.stream))
        })?;

        let state = {
            let mut consumers = stream.consumers.lock();
            consumers
                .entry(config.durable_name.clone())
                .or_insert_with(|| {
                    Arc::new(ConsumerState::new(
                        config.filter_subject.clone(),
                        config.ack_wait,
                    ))
                })
                .clone()
        };
        Ok(Box::new(DurableConsumer::new(stream, state)))
    }
}
