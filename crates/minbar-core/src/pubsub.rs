use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::Result;
use crate::window::Interaction;

/// The one durable stream the context pipeline rides on.
pub const CONTEXT_STREAM: &str = "CONTEXT";
/// Interaction persistence messages.
pub const SUBJECT_SYNC: &str = "context.sync";
/// Post-commit trigger messages.
pub const SUBJECT_SYNC_COMMIT: &str = "context.sync.commit";
/// Messages older than this are dropped from the stream.
pub const STREAM_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
/// How long a delivered message may sit unacked before redelivery.
pub const ACK_WAIT: Duration = Duration::from_secs(2 * 60);

/// One Interaction awaiting persistence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub interaction: Interaction,
}

impl SyncPayload {
    /// Idempotency key: redelivery of the same turn is a no-op.
    pub fn dedup_id(&self) -> String {
        sync_dedup_id(self.user_id, self.session_id, self.interaction.turn)
    }
}

/// Emitted once per (user,session) after a successful flush commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncCommitPayload {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub max_turn: u64,
    /// Messages persisted for this session in the committed batch.
    pub message_count: u64,
}

impl SyncCommitPayload {
    pub fn dedup_id(&self) -> String {
        commit_dedup_id(self.user_id, self.session_id, self.max_turn)
    }
}

pub fn sync_dedup_id(user_id: Uuid, session_id: Uuid, turn: u64) -> String {
    format!("sync:{user_id}:{session_id}:{turn}")
}

pub fn commit_dedup_id(user_id: Uuid, session_id: Uuid, max_turn: u64) -> String {
    format!("commit:{user_id}:{session_id}:{max_turn}")
}

/// Cache key for a session's context window.
pub fn context_cache_key(user_id: Uuid, session_id: Uuid) -> String {
    format!("user:{user_id}:session:{session_id}:context")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PubAck {
    pub stream: String,
    pub sequence: u64,
    /// True when the dedup id was seen before and the publish was dropped.
    pub duplicate: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueMetadata {
    pub stream_sequence: u64,
    pub delivery_count: u64,
}

/// One delivered message. Consumers must settle every message exactly one
/// way: `ack` after durable handling, `nak` to request redelivery now,
/// `term` to drop it permanently, with `in_progress` extending the ack
/// deadline for slow handling.
#[async_trait]
pub trait QueueMessage: Send + Sync {
    fn data(&self) -> &[u8];
    fn subject(&self) -> &str;
    fn metadata(&self) -> QueueMetadata;
    async fn ack(&self) -> Result<()>;
    async fn nak(&self) -> Result<()>;
    async fn term(&self) -> Result<()>;
    async fn in_progress(&self) -> Result<()>;
}

pub type MessageStream = Pin<Box<dyn Stream<Item = Box<dyn QueueMessage>> + Send>>;

/// A durable, subject-filtered consumer. At-least-once: unacked messages
/// come back.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn messages(&self) -> Result<MessageStream>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish with a dedup id; a repeat id within the dedup window is
    /// acknowledged but not stored again.
    async fn durable_publish(&self, subject: &str, data: Vec<u8>, dedup_id: &str)
        -> Result<PubAck>;
}

#[derive(Clone, Debug)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub max_age: Duration,
}

#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    pub stream: String,
    pub durable_name: String,
    pub filter_subject: String,
    pub ack_wait: Duration,
}

#[async_trait]
pub trait PubSub: Publisher {
    async fn create_stream(&self, config: StreamConfig) -> Result<()>;
    async fn create_consumer(&self, config: ConsumerConfig) -> Result<Box<dyn Consumer>>;
}
