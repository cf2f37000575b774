use std::collections::hash_map::Entry;
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
use minbar_core::window::{Content, Role};
use minbar_llm::{AgentName, AgentRegistry, SummarizerOutput};
use minbar_store::{Database, MessageRepo, SessionRepo};
use minbar_telemetry::MetricsRecorder;

use crate::probe::ProbeResponder;

/// A session summarizes once it accumulates more than this many turns
/// beyond the last summary.
pub const SUMMARIZE_TURN_THRESHOLD: u64 = 10;
/// A session with any pending turns summarizes after this much quiet.
pub const SUMMARIZE_IDLE: Duration = Duration::from_secs(5 * 60);
/// Idle-scan cadence.
const SCAN_INTERVAL: Duration = Duration::from_secs(60);

struct TrackedSession {
    last_turn_seen: u64,
    last_turn_summarized: u64,
    last_activity: Instant,
}

impl TrackedSession {
    fn pending_turns(&self) -> u64 {
        self.last_turn_seen.saturating_sub(self.last_turn_summarized)
    }
}

/// Consumes commit events and maintains per-session summaries through
/// the structured-output Summarizer profile.
pub struct Summarizer {
    sessions: SessionRepo,
    messages: MessageRepo,
    gateway: Arc<dyn LlmGateway>,
    agents: Arc<AgentRegistry>,
    consumer: Box<dyn Consumer>,
    probe: ProbeResponder,
    cancel: CancellationToken,
    metrics: Option<Arc<MetricsRecorder>>,
    tracked: HashMap<Uuid, TrackedSession>,
}

impl Summarizer {
    pub fn new(
        db: Database,
        gateway: Arc<dyn LlmGateway>,
        agents: Arc<AgentRegistry>,
        consumer: Box<dyn Consumer>,
        probe: ProbeResponder,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            messages: MessageRepo::new(db),
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

        info!("summarizer running");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("summarizer stopped");
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

        let session_id = payload.session_id;
        let state = match self.tracked.entry(session_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let (seen, summarized) = match self.sessions.get(session_id) {
                    Ok(row) => (row.max_turn, row.summarized_turn),
                    Err(e) => {
                        warn!(error = %e, %session_id, "session row missing on commit");
                        (0, 0)
                    }
                };
                entry.insert(TrackedSession {
                    last_turn_seen: seen,
                    last_turn_summarized: summarized,
                    last_activity: Instant::now(),
                })
            }
        };
        state.last_turn_seen = state.last_turn_seen.max(payload.max_turn);
        state.last_activity = Instant::now();

        if state.pending_turns() > SUMMARIZE_TURN_THRESHOLD {
            let _ = msg.in_progress().await;
            self.summarize(session_id).await;
        }
    }

    async fn scan_idle(&mut self) {
        let now = Instant::now();
        let due: Vec<Uuid> = self
            .tracked
            .iter()
            .filter(|(_, s)| {
                s.pending_turns() > 0 && now.duration_since(s.last_activity) >= SUMMARIZE_IDLE
            })
            .map(|(id, _)| *id)
            .collect();
        for session_id in due {
            debug!(%session_id, "summarizing idle session");
            self.summarize(session_id).await;
        }
    }

    /// One summarization pass. Failures are logged and retried by the
    /// next threshold crossing or idle scan.
    async fn summarize(&mut self, session_id: Uuid) {
        if let Err(e) = self.try_summarize(session_id).await {
            warn!(error = %e, %session_id, "summarize failed");
        }
    }

    async fn try_summarize(&mut self, session_id: Uuid) -> Result<()> {
        let rows = self.messages.list_by_session(session_id)?;
        if rows.is_empty() {
            return Ok(());
        }
        let last_turn = rows.last().map_or(0, |r| r.turn);

        let contents: Vec<Content> = rows
            .iter()
            .filter_map(|row| match (row.role, row.content.as_deref()) {
                (Role::User, Some(text)) => Some(Content::user_text(text)),
                (Role::Model, Some(text)) => Some(Content::model_text(text)),
                _ => None,
            })
            .collect();

        let profile = self.agents.get(AgentName::Summarizer);
        let generation = self
            .gateway
            .generate(&profile.model, &contents, &profile.config)
            .await?;
        let output: SummarizerOutput = serde_json::from_str(&generation.text)?;

        self.sessions
            .set_summary(session_id, &output.summary, last_turn)?;
        if let Some(state) = self.tracked.get_mut(&session_id) {
            state.last_turn_summarized = last_turn;
            state.last_turn_seen = state.last_turn_seen.max(last_turn);
        }
        info!(%session_id, covered_turn = last_turn, "session summarized");
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc("summarizer_runs_total", &[], 1);
        }
        Ok(())
    }
}
