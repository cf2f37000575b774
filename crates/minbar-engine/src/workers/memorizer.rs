use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, Instant};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use minbar_core::errors::Result;
use minbar_core::gateway::LlmGateway;
use minbar_core::pubsub::{Consumer, QueueMessage, SyncCommitPayload};
use minbar_core::window::Content;
use minbar_llm::{AgentName, AgentRegistry, MemorizerOutput, MEMORY_CONFIDENCE_FLOOR};
use minbar_store::{Database, MemoryRepo, MessageRepo, UserRepo};
use minbar_telemetry::MetricsRecorder;

use crate::probe::ProbeResponder;

/// A user memorizes once they accumulate more than this many messages
/// beyond the last extraction.
pub const MEMORIZE_MESSAGE_THRESHOLD: u64 = 50;
/// A user with any pending messages memorizes after this much quiet.
pub const MEMORIZE_IDLE: Duration = Duration::from_secs(30 * 60);
/// Idle-scan cadence.
const SCAN_INTERVAL: Duration = Duration::from_secs(60);

const MEMORY_CONTEXT_LIMIT: usize = 50;
const MESSAGE_CONTEXT_LIMIT: usize = 100;

struct TrackedUser {
    total_messages: u64,
    total_messages_memorized: u64,
    last_activity: Instant,
}

impl TrackedUser {
    fn pending_messages(&self) -> u64 {
        self.total_messages
            .saturating_sub(self.total_messages_memorized)
    }
}

/// Consumes commit events and distills durable per-user facts through
/// the structured-output Memorizer profile. Operates across sessions,
/// keyed by user.
pub struct Memorizer {
    users: UserRepo,
    messages: MessageRepo,
    memories: MemoryRepo,
    gateway: Arc<dyn LlmGateway>,
    agents: Arc<AgentRegistry>,
    consumer: Box<dyn Consumer>,
    probe: ProbeResponder,
    cancel: CancellationToken,
    metrics: Option<Arc<MetricsRecorder>>,
    tracked: HashMap<Uuid, TrackedUser>,
}

impl Memorizer {
    pub fn new(
        db: Database,
        gateway: Arc<dyn LlmGateway>,
        agents: Arc<AgentRegistry>,
        consumer: Box<dyn Consumer>,
        probe: ProbeResponder,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            users: UserRepo::new(db.clone()),
            messages: MessageRepo::new(db.clone()),
            memories: MemoryRepo::new(db),
            gateway,
            agents,
            consumer,
            probe,
            cancel,
            metrics: None,
            tracked: HashMap::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn run(mut self) -> Result<()> {
        let mut messages = self.consumer.messages().await?;
        let mut scan = interval(SCAN_INTERVAL);
        scan.tick().await; // immediate first tick

        info!("memorizer running");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("memorizer stopped");
                    return Ok(());
                }
                Some(msg) = messages.next() => {
                    self.handle_commit(msg.as_ref()).await;
                    let _ = msg.ack().await;
                }
                _ = scan.tick() => {
                    self.scan_idle().await;
                }
                Some(reply) = self.probe.recv() => {
                    ProbeResponder::answer(reply);
                }
            }
        }
    }

    async fn handle_commit(&mut self, msg: &dyn QueueMessage) {
        let payload = match serde_json::from_slice::<SyncCommitPayload>(msg.data()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "terminating malformed commit payload");
                let _ = msg.term().await;
                return;
            }
        };

        let user_id = payload.user_id;
        // The syncer has already committed this user's counters, so the
        // row is always fresher than the payload.
        match self.users.get(user_id) {
            Ok(row) => {
                let state = self.tracked.entry(user_id).or_insert(TrackedUser {
                    total_messages: row.total_messages,
                    total_messages_memorized: row.total_messages_memorized,
                    last_activity: Instant::now(),
                });
                state.total_messages = state.total_messages.max(row.total_messages);
                state.total_messages_memorized = row.total_messages_memorized;
                state.last_activity = Instant::now();
            }
            Err(e) => {
                warn!(error = %e, %user_id, "user row missing on commit");
                return;
            }
        }

        let pending = self.tracked[&user_id].pending_messages();
        if pending > MEMORIZE_MESSAGE_THRESHOLD {
            let _ = msg.in_progress().await;
            self.memorize(user_id).await;
        }
    }

    async fn scan_idle(&mut self) {
        let now = Instant::now();
        let due: Vec<Uuid> = self
            .tracked
            .iter()
            .filter(|(_, s)| {
                s.pending_messages() > 0 && now.duration_since(s.last_activity) >= MEMORIZE_IDLE
            })
            .map(|(id, _)| *id)
            .collect();
        for user_id in due {
            debug!(%user_id, "memorizing idle user");
            self.memorize(user_id).await;
        }
    }

    /// One extraction pass. Failures are logged and retried by the next
    /// threshold crossing or idle scan.
    async fn memorize(&mut self, user_id: Uuid) {
        if let Err(e) = self.try_memorize(user_id).await {
            warn!(error = %e, %user_id, "memorize failed");
        }
    }

    async fn try_memorize(&mut self, user_id: Uuid) -> Result<()> {
        let existing = self.memories.list_for_user(user_id, MEMORY_CONTEXT_LIMIT)?;
        let recent = self
            .messages
            .recent_user_texts(user_id, MESSAGE_CONTEXT_LIMIT)?;
        if recent.is_empty() {
            return Ok(());
        }

        let mut blocks = Vec::with_capacity(2);
        if !existing.is_empty() {
            let lines: Vec<String> = existing
                .iter()
                .map(|m| format!("- [{}] {}", m.key, m.content))
                .collect();
            blocks.push(Content::user_text(format!(
                "Existing memories:\n{}",
                lines.join("\n")
            )));
        }
        blocks.push(Content::user_text(format!(
            "Recent user messages:\n{}",
            recent
                .iter()
                .map(|t| format!("- {t}"))
                .collect::<Vec<_>>()
                .join("\n")
        )));

        let profile = self.agents.get(AgentName::Memorizer);
        let generation = self
            .gateway
            .generate(&profile.model, &blocks, &profile.config)
            .await?;
        let output: MemorizerOutput = serde_json::from_str(&generation.text)?;

        for key in &output.delete_keys {
            self.memories.delete(user_id, key)?;
        }
        let mut upserts = 0u64;
        for op in &output.memories {
            if op.confidence < MEMORY_CONFIDENCE_FLOOR {
                debug!(key = %op.unique_key, confidence = op.confidence, "dropping low-confidence memory");
                continue;
            }
            self.memories
                .upsert(user_id, &op.unique_key, &op.content, op.confidence)?;
            upserts += 1;
        }

        let total_messages = self.users.get(user_id)?.total_messages;
        self.users.set_memorized(user_id, total_messages)?;
        if let Some(state) = self.tracked.get_mut(&user_id) {
            state.total_messages = state.total_messages.max(total_messages);
            state.total_messages_memorized = total_messages;
        }
        info!(
            %user_id,
            upserts,
            deletes = output.delete_keys.len(),
            "memories extracted"
        );
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc("memorizer_runs_total", &[], 1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use minbar_bus::InProcessBus;
    use minbar_core::pubsub::{
        ConsumerConfig, PubSub, Publisher, StreamConfig, CONTEXT_STREAM, SUBJECT_SYNC,
        SUBJECT_SYNC_COMMIT,
    };
    use minbar_core::window::{
        FinishReason, Inference, InferenceInput, InferenceOutput, Interaction, TokenUsage,
    };
    use minbar_llm::{MockGateway, MockResponse};
    use minbar_store::SessionRepo;

    fn interaction(turn: u64) -> Interaction {
        Interaction {
            turn,
            inferences: vec![Inference {
                input: InferenceInput::Text { text: format!("q{turn}") },
                output: InferenceOutput::Text { text: format!("a{turn}") },
                usage: TokenUsage::default(),
                finish_reason: FinishReason::Stop,
            }],
            created_at: Utc::now(),
        }
    }

    async fn setup(
        gateway: MockGateway,
    ) -> (Arc<InProcessBus>, Database, CancellationToken, Uuid, Uuid) {
        let bus = Arc::new(InProcessBus::new());
        bus.create_stream(StreamConfig {
            name: CONTEXT_STREAM.into(),
            subjects: vec![SUBJECT_SYNC.into(), SUBJECT_SYNC_COMMIT.into()],
            max_age: Duration::from_secs(60 * 60),
        })
        .await
        .unwrap();

        let db = Database::in_memory().unwrap();
        let user = Uuid::new_v4();
        let session = Uuid::new_v4();
        SessionRepo::new(db.clone()).ensure(session, user).unwrap();

        let consumer = bus
            .create_consumer(ConsumerConfig {
                stream: CONTEXT_STREAM.into(),
                durable_name: "memorizer".into(),
                filter_subject: SUBJECT_SYNC_COMMIT.into(),
                ack_wait: MEMORIZE_IDLE + crate::workers::ACK_WAIT_OFFSET,
            })
            .await
            .unwrap();
        let (_probe, responder) = crate::probe::probe_pair("memorizer");
        let cancel = CancellationToken::new();
        let memorizer = Memorizer::new(
            db.clone(),
            Arc::new(gateway),
            Arc::new(AgentRegistry::new()),
            consumer,
            responder,
            cancel.clone(),
        );
        tokio::spawn(memorizer.run());
        (bus, db, cancel, user, session)
    }

    fn seed_turns(db: &Database, user: Uuid, session: Uuid, turns: u64) {
        db.transaction(|conn| {
            let mut rows = 0;
            for turn in 1..=turns {
                rows += MessageRepo::insert_interaction_in(conn, user, session, &interaction(turn))?;
            }
            SessionRepo::record_flush_in(conn, session, turns)?;
            UserRepo::add_messages_in(conn, user, rows)
        })
        .unwrap();
    }

    async fn publish_commit(bus: &InProcessBus, user: Uuid, session: Uuid, max_turn: u64) {
        let payload = SyncCommitPayload {
            user_id: user,
            session_id: session,
            max_turn,
            message_count: max_turn * 2,
        };
        bus.durable_publish(
            SUBJECT_SYNC_COMMIT,
            serde_json::to_vec(&payload).unwrap(),
            &payload.dedup_id(),
        )
        .await
        .unwrap();
    }

    async fn wait_for_memorized(db: &Database, user: Uuid) -> u64 {
        let users = UserRepo::new(db.clone());
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let row = users.get(user).unwrap();
            if row.total_messages_memorized > 0 {
                return row.total_messages_memorized;
            }
            assert!(std::time::Instant::now() < deadline, "extraction never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn crossing_the_message_threshold_extracts_memories() {
        let gateway = MockGateway::new(vec![MockResponse::json(serde_json::json!({
            "memories": [
                {
                    "unique_key": "studies-tafsir",
                    "content": "Regularly asks about Ibn Kathir's tafsir",
                    "confidence": 0.9,
                    "source_msg": "q1"
                },
                {
                    "unique_key": "maybe-student",
                    "content": "Might be a student",
                    "confidence": 0.4,
                    "source_msg": "q2"
                }
            ],
            "delete_keys": []
        }))]);
        let (bus, db, cancel, user, session) = setup(gateway).await;

        // 26 turns at 2 rows each crosses the 50-message threshold.
        seed_turns(&db, user, session, 26);
        publish_commit(&bus, user, session, 26).await;

        let memorized = wait_for_memorized(&db, user).await;
        assert_eq!(memorized, 52);

        let memories = MemoryRepo::new(db).list_for_user(user, 50).unwrap();
        assert_eq!(memories.len(), 1, "low-confidence op must be dropped");
        assert_eq!(memories[0].key, "studies-tafsir");
        cancel.cancel();
    }

    #[tokio::test]
    async fn delete_keys_remove_stale_memories() {
        let gateway = MockGateway::new(vec![MockResponse::json(serde_json::json!({
            "memories": [],
            "delete_keys": ["old-fact"]
        }))]);
        let (bus, db, cancel, user, session) = setup(gateway).await;
        MemoryRepo::new(db.clone())
            .upsert(user, "old-fact", "No longer true", 0.9)
            .unwrap();

        seed_turns(&db, user, session, 26);
        publish_commit(&bus, user, session, 26).await;

        wait_for_memorized(&db, user).await;
        assert!(MemoryRepo::new(db).list_for_user(user, 50).unwrap().is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn below_threshold_no_extraction_runs() {
        let gateway = MockGateway::new(vec![]);
        let (bus, db, cancel, user, session) = setup(gateway).await;

        seed_turns(&db, user, session, 10);
        publish_commit(&bus, user, session, 10).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let row = UserRepo::new(db).get(user).unwrap();
        assert_eq!(row.total_messages_memorized, 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn malformed_commit_is_terminated() {
        let gateway = MockGateway::new(vec![]);
        let (bus, db, cancel, user, _session) = setup(gateway).await;

        bus.durable_publish(SUBJECT_SYNC_COMMIT, b"not json".to_vec(), "bad-1")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(UserRepo::new(db).get(user).unwrap().total_messages, 0);
        cancel.cancel();
    }
}
