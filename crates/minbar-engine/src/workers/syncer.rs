use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use minbar_core::errors::Result;
use minbar_core::pubsub::{
    Consumer, Publisher, QueueMessage, SyncCommitPayload, SyncPayload, SUBJECT_SYNC_COMMIT,
};
use minbar_store::{Database, MessageRepo, SessionRepo, UserRepo};
use minbar_telemetry::MetricsRecorder;

use crate::probe::ProbeResponder;

/// Buffered payloads that force a flush.
pub const SYNC_BATCH_SIZE: usize = 5;
/// A partial batch flushes after this long without new messages.
pub const SYNC_IDLE_FLUSH: Duration = Duration::from_secs(2 * 60);

/// Write-behind persistence. Buffers sync payloads, flushes them in one
/// transaction, then publishes a commit event per touched session.
pub struct Syncer {
    db: Database,
    publisher: Arc<dyn Publisher>,
    consumer: Box<dyn Consumer>,
    probe: ProbeResponder,
    cancel: CancellationToken,
    metrics: Option<Arc<MetricsRecorder>>,
}

#[derive(Default)]
struct SessionBatch {
    max_turn: u64,
    rows_written: u64,
}

impl Syncer {
    pub fn new(
        db: Database,
        publisher: Arc<dyn Publisher>,
        consumer: Box<dyn Consumer>,
        probe: ProbeResponder,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            db,
            publisher,
            consumer,
            probe,
            cancel,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn run(mut self) -> Result<()> {
        let mut messages = self.consumer.messages().await?;
        let mut buffer: Vec<(Box<dyn QueueMessage>, SyncPayload)> = Vec::new();
        let idle = sleep(SYNC_IDLE_FLUSH);
        tokio::pin!(idle);

        info!("syncer running");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.flush(&mut buffer).await;
                    info!("syncer stopped");
                    return Ok(());
                }
                Some(msg) = messages.next() => {
                    match serde_json::from_slice::<SyncPayload>(msg.data()) {
                        Err(e) => {
                            warn!(error = %e, "terminating malformed sync payload");
                            let _ = msg.term().await;
                        }
                        Ok(payload) if payload.interaction.inferences.is_empty() => {
                            // Parses, but has nothing to persist; buffering
                            // it would poison the whole flush transaction.
                            warn!(session_id = %payload.session_id, turn = payload.interaction.turn,
                                "terminating sync payload with no inferences");
                            let _ = msg.term().await;
                        }
                        Ok(payload) => {
                            debug!(session_id = %payload.session_id, turn = payload.interaction.turn, "buffered");
                            buffer.push((msg, payload));
                            if buffer.len() >= SYNC_BATCH_SIZE {
                                self.flush(&mut buffer).await;
                            } else {
                                for (msg, _) in &buffer {
                                    let _ = msg.in_progress().await;
                                }
                            }
                            idle.as_mut().reset(Instant::now() + SYNC_IDLE_FLUSH);
                        }
                    }
                }
                _ = &mut idle => {
                    self.flush(&mut buffer).await;
                    idle.as_mut().reset(Instant::now() + SYNC_IDLE_FLUSH);
                }
                Some(reply) = self.probe.recv() => {
                    ProbeResponder::answer(reply);
                }
            }
        }
    }

    /// Persist the buffered batch in one transaction. On success every
    /// message is acked and one commit event fires per (user, session);
    /// on failure everything is nak'd for redelivery.
    async fn flush(&self, buffer: &mut Vec<(Box<dyn QueueMessage>, SyncPayload)>) {
        if buffer.is_empty() {
            return;
        }

        let payloads: Vec<SyncPayload> = buffer.iter().map(|(_, p)| p.clone()).collect();
        let result = self.db.transaction(|conn| {
            let mut batches: HashMap<(Uuid, Uuid), SessionBatch> = HashMap::new();
            for payload in &payloads {
                SessionRepo::ensure_in(conn, payload.session_id, payload.user_id)?;
                let written = MessageRepo::insert_interaction_in(
                    conn,
                    payload.user_id,
                    payload.session_id,
                    &payload.interaction,
                )?;
                let batch = batches
                    .entry((payload.user_id, payload.session_id))
                    .or_default();
                batch.max_turn = batch.max_turn.max(payload.interaction.turn);
                batch.rows_written += written;
            }

            let mut per_user: HashMap<Uuid, u64> = HashMap::new();
            for ((user_id, session_id), batch) in &batches {
                SessionRepo::record_flush_in(conn, *session_id, batch.max_turn)?;
                *per_user.entry(*user_id).or_default() += batch.rows_written;
            }
            for (user_id, rows) in per_user {
                UserRepo::add_messages_in(conn, user_id, rows)?;
            }
            Ok(batches)
        });

        let batches = match result {
            Ok(batches) => batches,
            Err(e) => {
                error!(error = %e, batch = buffer.len(), "flush failed, requesting redelivery");
                for (msg, _) in buffer.drain(..) {
                    let _ = msg.nak().await;
                }
                return;
            }
        };

        for (msg, _) in buffer.drain(..) {
            let _ = msg.ack().await;
        }
        info!(sessions = batches.len(), "flush committed");
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc("syncer_flush_total", &[], 1);
        }

        for ((user_id, session_id), batch) in batches {
            let commit = SyncCommitPayload {
                user_id,
                session_id,
                max_turn: batch.max_turn,
                message_count: batch.rows_written,
            };
            let data = match serde_json::to_vec(&commit) {
                Ok(data) => data,
                Err(e) => {
                    error!(error = %e, "commit payload did not serialize");
                    continue;
                }
            };
            if let Err(e) = self
                .publisher
                .durable_publish(SUBJECT_SYNC_COMMIT, data, &commit.dedup_id())
                .await
            {
                // The flush is durable either way; the Summarizer's idle
                // scan catches sessions whose commit event was lost.
                warn!(error = %e, session_id = %session_id, "commit publish failed");
            }
        }
    }
}
