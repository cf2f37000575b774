use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use minbar_core::errors::{MinbarError, Result};
use minbar_core::ports::Cache;
use minbar_core::pubsub::{context_cache_key, Publisher, SyncPayload, SUBJECT_SYNC};
use minbar_core::window::{
    ContextWindow, FinishReason, FunctionCall, FunctionResponse, Inference, InferenceInput,
    InferenceOutput, Interaction, Role, TokenUsage,
};
use minbar_store::{Database, MemoryRepo, MessageRepo, MessageRow, SessionRepo};

/// Cached windows outlive most conversations but not a day.
pub const CONTEXT_TTL: Duration = Duration::from_secs(6 * 60 * 60);
pub const MEMORY_FETCH_LIMIT: usize = 50;
pub const SUMMARY_FETCH_LIMIT: usize = 5;

/// Cache-first access to per-(user,session) conversational state.
/// Reads fall back to reconstructing the window from the store; writes go
/// to the cache and hand persistence to the Syncer via the durable
/// stream.
pub struct ContextManager {
    cache: Arc<dyn Cache>,
    publisher: Arc<dyn Publisher>,
    memories: MemoryRepo,
    sessions: SessionRepo,
    messages: MessageRepo,
}

impl ContextManager {
    pub fn new(cache: Arc<dyn Cache>, publisher: Arc<dyn Publisher>, db: Database) -> Self {
        Self {
            cache,
            publisher,
            memories: MemoryRepo::new(db.clone()),
            sessions: SessionRepo::new(db.clone()),
            messages: MessageRepo::new(db),
        }
    }

    /// Load the window for a session. A cache hit returns it verbatim; a
    /// miss rebuilds it from the store without populating the cache (the
    /// next SetContext does that).
    #[instrument(skip(self), fields(%user_id, %session_id))]
    pub async fn get_context(&self, user_id: Uuid, session_id: Uuid) -> Result<ContextWindow> {
        let key = context_cache_key(user_id, session_id);
        if let Some(bytes) = self.cache.get(&key).await? {
            match serde_json::from_slice::<ContextWindow>(&bytes) {
                Ok(window) => return Ok(window),
                Err(e) => warn!(error = %e, "cached window is unreadable, rebuilding"),
            }
        }

        let memories = {
            let repo = self.memories.clone();
            run_query(move || repo.list_for_user(user_id, MEMORY_FETCH_LIMIT))
        };
        let summaries = {
            let repo = self.sessions.clone();
            run_query(move || repo.recent_summaries(user_id, session_id, SUMMARY_FETCH_LIMIT))
        };
        let rows = {
            let repo = self.messages.clone();
            run_query(move || repo.list_by_session(session_id))
        };
        let (memories, summaries, rows) = tokio::try_join!(memories, summaries, rows)?;

        let history = rows_to_interactions(rows)?;
        let turns = history.last().map_or(0, |i| i.turn);
        debug!(turns, memories = memories.len(), summaries = summaries.len(), "window rebuilt");
        Ok(ContextWindow {
            memories,
            summaries,
            history,
            turns,
        })
    }

    /// Append the newest interaction, refresh the cache, and enqueue the
    /// interaction for write-behind persistence. A publish failure is
    /// surfaced; the cache write is not rolled back.
    #[instrument(skip(self, window, interaction), fields(%user_id, %session_id, turn = interaction.turn))]
    pub async fn set_context(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        window: &mut ContextWindow,
        interaction: Interaction,
    ) -> Result<()> {
        window.append(interaction.clone());

        let key = context_cache_key(user_id, session_id);
        let bytes = serde_json::to_vec(window)?;
        self.cache.set(&key, bytes, CONTEXT_TTL).await?;

        let payload = SyncPayload {
            user_id,
            session_id,
            interaction,
        };
        let data = serde_json::to_vec(&payload)?;
        self.publisher
            .durable_publish(SUBJECT_SYNC, data, &payload.dedup_id())
            .await?;
        Ok(())
    }
}

async fn run_query<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> minbar_store::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MinbarError::internal(format!("store query panicked: {e}")))?
        .map_err(Into::into)
}

/// Rebuild Interactions from persisted rows: a user row opens a turn, a
/// function row marks it tool-augmented, a model row closes it. Rows from
/// a turn whose model row never landed are skipped.
fn rows_to_interactions(rows: Vec<MessageRow>) -> Result<Vec<Interaction>> {
    struct OpenTurn {
        turn: u64,
        prompt: String,
        tool: Option<(FunctionCall, FunctionResponse)>,
        created_at: DateTime<Utc>,
    }

    let mut history = Vec::new();
    let mut open: Option<OpenTurn> = None;

    for row in rows {
        match row.role {
            Role::User => {
                if let Some(dangling) = open.take() {
                    warn!(turn = dangling.turn, "discarding turn without a model row");
                }
                open = Some(OpenTurn {
                    turn: row.turn,
                    prompt: row.content.unwrap_or_default(),
                    tool: None,
                    created_at: row.created_at,
                });
            }
            Role::Function => {
                let Some(current) = open.as_mut() else {
                    warn!(turn = row.turn, "function row outside an open turn");
                    continue;
                };
                let call = row
                    .function_call
                    .map(serde_json::from_value::<FunctionCall>)
                    .transpose()?;
                let response = row
                    .function_response
                    .map(serde_json::from_value::<FunctionResponse>)
                    .transpose()?;
                if let (Some(call), Some(response)) = (call, response) {
                    current.tool = Some((call, response));
                }
            }
            Role::Model => {
                let Some(current) = open.take() else {
                    warn!(turn = row.turn, "model row outside an open turn");
                    continue;
                };
                let answer = row.content.unwrap_or_default();
                let usage = TokenUsage {
                    prompt_tokens: row.input_tokens,
                    completion_tokens: row.output_tokens,
                    total_tokens: row.input_tokens + row.output_tokens,
                };
                let inferences = match current.tool {
                    Some((call, response)) => vec![
                        Inference {
                            input: InferenceInput::Text {
                                text: current.prompt,
                            },
                            output: InferenceOutput::FunctionCall { call },
                            usage: TokenUsage::default(),
                            finish_reason: FinishReason::FunctionCall,
                        },
                        Inference {
                            input: InferenceInput::FunctionResponse { response },
                            output: InferenceOutput::Text { text: answer },
                            usage,
                            finish_reason: FinishReason::Stop,
                        },
                    ],
                    None => vec![Inference {
                        input: InferenceInput::Text {
                            text: current.prompt,
                        },
                        output: InferenceOutput::Text { text: answer },
                        usage,
                        finish_reason: FinishReason::Stop,
                    }],
                };
                history.push(Interaction {
                    turn: current.turn,
                    inferences,
                    created_at: current.created_at,
                });
            }
        }
    }
    Ok(history)
}
