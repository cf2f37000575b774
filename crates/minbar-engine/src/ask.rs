use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument};
use uuid::Uuid;

use minbar_core::errors::{MinbarError, Result};
use minbar_core::gateway::{GenerationConfig, LlmEvent, LlmGateway};
use minbar_core::window::{
    build_context_window, Content, FinishReason, FunctionCall, Inference, InferenceInput,
    InferenceOutput, Interaction, TokenUsage,
};
use minbar_llm::{AgentName, AgentRegistry};
use minbar_telemetry::MetricsRecorder;

use crate::context::ContextManager;
use crate::functions::FnRegistry;

/// One ask as it arrives at the API boundary.
#[derive(Clone, Debug)]
pub struct AskRequest {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub prompt: String,
}

/// Events streamed back to the consumer, in order: `Ready`, zero or more
/// `Token`s, at most one `Error`, then `Done`.
#[derive(Debug)]
pub enum AskEvent {
    Ready,
    Token(String),
    Error(MinbarError),
    Done,
}

/// Orchestrates one question/answer cycle: window assembly, the Caller
/// inference, optional tool dispatch plus the Generator inference, then
/// exactly one SetContext.
pub struct AskSvc {
    context: Arc<ContextManager>,
    gateway: Arc<dyn LlmGateway>,
    agents: Arc<AgentRegistry>,
    functions: Arc<FnRegistry>,
    metrics: Option<Arc<MetricsRecorder>>,
}

enum InferenceOutcome {
    Text {
        text: String,
        usage: TokenUsage,
        finish_reason: FinishReason,
    },
    Call {
        call: FunctionCall,
        usage: TokenUsage,
    },
}

impl AskSvc {
    pub fn new(
        context: Arc<ContextManager>,
        gateway: Arc<dyn LlmGateway>,
        agents: Arc<AgentRegistry>,
        functions: Arc<FnRegistry>,
    ) -> Self {
        Self {
            context,
            gateway,
            agents,
            functions,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run the ask in a background task and stream its events. The task
    /// owns the orchestration, so dropping the returned stream early
    /// cannot skip persistence.
    pub fn ask(
        self: &Arc<Self>,
        request: AskRequest,
        cancel: CancellationToken,
    ) -> ReceiverStream<AskEvent> {
        let (tx, rx) = mpsc::channel(64);
        let svc = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = svc.run(request, cancel, &tx).await {
                error!(error = %e, kind = e.kind(), "ask failed");
                let _ = tx.send(AskEvent::Error(e)).await;
            }
            let _ = tx.send(AskEvent::Done).await;
        });
        ReceiverStream::new(rx)
    }

    #[instrument(skip_all, fields(user_id = %request.user_id, session_id = %request.session_id))]
    async fn run(
        &self,
        request: AskRequest,
        cancel: CancellationToken,
        tx: &mpsc::Sender<AskEvent>,
    ) -> Result<()> {
        let started = Instant::now();
        let mut window = self
            .context
            .get_context(request.user_id, request.session_id)
            .await?;
        let turn = window.next_turn();
        let _ = tx.send(AskEvent::Ready).await;

        let caller = self.agents.get(AgentName::Caller);
        let mut contents = build_context_window(
            self.gateway.as_ref(),
            &caller.model,
            &caller.config,
            &window,
            Utc::now(),
        )
        .await?;
        contents.push(Content::user_text(&request.prompt));

        let mut first_token_at: Option<Instant> = None;
        let outcome = self
            .stream_inference(&caller.model, &caller.config, &contents, &cancel, tx, &mut first_token_at)
            .await?;

        let mut inferences = Vec::new();
        match outcome {
            InferenceOutcome::Text {
                text,
                usage,
                finish_reason,
            } => {
                inferences.push(Inference {
                    input: InferenceInput::Text {
                        text: request.prompt.clone(),
                    },
                    output: InferenceOutput::Text { text },
                    usage,
                    finish_reason,
                });
            }
            InferenceOutcome::Call { call, usage } => {
                inferences.push(Inference {
                    input: InferenceInput::Text {
                        text: request.prompt.clone(),
                    },
                    output: InferenceOutput::FunctionCall { call: call.clone() },
                    usage,
                    finish_reason: FinishReason::FunctionCall,
                });

                let response = tokio::select! {
                    _ = cancel.cancelled() => return Err(MinbarError::Cancelled),
                    response = self.functions.dispatch(&call) => response?,
                };
                contents.push(Content::model_call(call));
                contents.push(Content::user_response(response.clone()));

                let generator = self.agents.get(AgentName::Generator);
                let grounded = self
                    .stream_inference(
                        &generator.model,
                        &generator.config,
                        &contents,
                        &cancel,
                        tx,
                        &mut first_token_at,
                    )
                    .await?;
                let InferenceOutcome::Text {
                    text,
                    usage,
                    finish_reason,
                } = grounded
                else {
                    return Err(MinbarError::internal(
                        "generator produced a second function call",
                    ));
                };
                inferences.push(Inference {
                    input: InferenceInput::FunctionResponse { response },
                    output: InferenceOutput::Text { text },
                    usage,
                    finish_reason,
                });
            }
        }

        if let (Some(metrics), Some(at)) = (&self.metrics, first_token_at) {
            metrics.histogram_observe(
                "ask_first_token_ms",
                &[],
                at.duration_since(started).as_secs_f64() * 1000.0,
            );
        }

        let interaction = Interaction {
            turn,
            inferences,
            created_at: Utc::now(),
        };
        self.context
            .set_context(request.user_id, request.session_id, &mut window, interaction)
            .await
    }

    /// Drive one streaming inference, forwarding text deltas as events.
    async fn stream_inference(
        &self,
        model: &str,
        config: &GenerationConfig,
        contents: &[Content],
        cancel: &CancellationToken,
        tx: &mpsc::Sender<AskEvent>,
        first_token_at: &mut Option<Instant>,
    ) -> Result<InferenceOutcome> {
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Err(MinbarError::Cancelled),
            stream = self.gateway.stream(model, contents, config) => stream?,
        };
        let mut text = String::new();
        let mut call: Option<FunctionCall> = None;
        let mut usage = TokenUsage::default();
        let mut finish_reason = FinishReason::Stop;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(MinbarError::Cancelled),
                event = stream.next() => match event {
                    None => break,
                    Some(LlmEvent::TextDelta(delta)) => {
                        first_token_at.get_or_insert_with(Instant::now);
                        text.push_str(&delta);
                        let _ = tx.send(AskEvent::Token(delta)).await;
                    }
                    Some(LlmEvent::FunctionCall(c)) => call = Some(c),
                    Some(LlmEvent::Done { usage: u, finish_reason: f }) => {
                        usage = u;
                        finish_reason = f;
                    }
                    Some(LlmEvent::Error(e)) => return Err(e),
                },
            }
        }

        match call {
            Some(call) => Ok(InferenceOutcome::Call { call, usage }),
            None => Ok(InferenceOutcome::Text {
                text,
                usage,
                finish_reason,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use minbar_bus::InProcessBus;
    use minbar_core::domain::{Chunk, Rank};
    use minbar_core::ports::{Cache, Embedder, Reranker, Searcher};
    use minbar_core::pubsub::{
        PubSub, Publisher, StreamConfig, CONTEXT_STREAM, SUBJECT_SYNC, SUBJECT_SYNC_COMMIT,
    };
    use minbar_llm::{MockGateway, MockResponse};
    use minbar_store::{Database, MemoryCache, SessionRepo};

    use crate::functions::SearchFn;
    use crate::search::SearchSvc;

    struct StubEmbedder;
    #[async_trait]
    impl Embedder for StubEmbedder {
        async fn embed_queries(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(vec![vec![0.1; 4]; texts.len()])
        }
    }

    struct StubSearcher;
    #[async_trait]
    impl Searcher for StubSearcher {
        async fn semantic_search(&self, _e: &[f32], _l: &[i64], _k: usize) -> Result<Vec<Rank>> {
            Ok(vec![Rank { chunk_id: 1, score: 0.9 }])
        }
        async fn lexical_search(&self, _q: &str, _l: &[i64], _k: usize) -> Result<Vec<Rank>> {
            Ok(vec![Rank { chunk_id: 2, score: 0.8 }])
        }
        async fn fetch_chunks(&self, ids: &[u32]) -> Result<Vec<Chunk>> {
            Ok(ids
                .iter()
                .map(|id| Chunk {
                    id: *id,
                    doc_id: 1,
                    text: format!("tafsir passage {id}"),
                    source: "ibn_kathir".into(),
                    locator: None,
                })
                .collect())
        }
    }

    struct StubReranker;
    #[async_trait]
    impl Reranker for StubReranker {
        async fn rerank(&self, _q: &str, docs: &[String], top_k: usize) -> Result<Vec<(usize, f64)>> {
            Ok((0..docs.len().min(top_k)).map(|i| (i, 1.0 - i as f64 * 0.1)).collect())
        }
    }

    async fn setup(gateway: MockGateway) -> (Arc<AskSvc>, Arc<ContextManager>, Uuid, Uuid) {
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

        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let context = Arc::new(ContextManager::new(
            cache,
            bus as Arc<dyn Publisher>,
            db,
        ));

        let search = Arc::new(SearchSvc::new(
            Arc::new(StubEmbedder),
            Arc::new(StubSearcher),
            Arc::new(StubReranker),
        ));
        let functions = Arc::new(FnRegistry::new().register(Arc::new(SearchFn::new(search))));

        let svc = Arc::new(AskSvc::new(
            context.clone(),
            Arc::new(gateway),
            Arc::new(AgentRegistry::new()),
            functions,
        ));
        (svc, context, user, session)
    }

    fn request(user: Uuid, session: Uuid) -> AskRequest {
        AskRequest {
            user_id: user,
            session_id: session,
            prompt: "ما معنى آية الكرسي؟".into(),
        }
    }

    async fn collect(stream: ReceiverStream<AskEvent>) -> Vec<AskEvent> {
        stream.collect().await
    }

    #[tokio::test]
    async fn plain_ask_streams_and_persists_one_inference() {
        let gateway = MockGateway::new(vec![MockResponse::stream_text("الجواب الكامل")]);
        let (svc, context, user, session) = setup(gateway).await;

        let events = collect(svc.ask(request(user, session), CancellationToken::new())).await;
        assert!(matches!(events[0], AskEvent::Ready));
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                AskEvent::Token(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "الجواب الكامل");
        assert!(matches!(events.last(), Some(AskEvent::Done)));
        assert!(!events.iter().any(|e| matches!(e, AskEvent::Error(_))));

        let window = context.get_context(user, session).await.unwrap();
        assert_eq!(window.turns, 1);
        assert_eq!(window.history[0].inferences.len(), 1);
    }

    #[tokio::test]
    async fn tool_ask_runs_two_inferences() {
        let gateway = MockGateway::new(vec![
            MockResponse::function_call(
                "Search",
                serde_json::json!({
                    "full_prompt": "آية الكرسي",
                    "prompts_with_filters": [{"prompt": "آية الكرسي"}]
                }),
            ),
            MockResponse::stream_text("جواب مدعوم بالمصادر"),
        ]);
        let (svc, context, user, session) = setup(gateway).await;

        let events = collect(svc.ask(request(user, session), CancellationToken::new())).await;
        assert!(!events.iter().any(|e| matches!(e, AskEvent::Error(_))));

        let window = context.get_context(user, session).await.unwrap();
        assert_eq!(window.turns, 1);
        let turn = &window.history[0];
        assert!(turn.is_tool_augmented());
        assert_eq!(turn.inferences.len(), 2);
        assert_eq!(turn.answer(), Some("جواب مدعوم بالمصادر"));
    }

    #[tokio::test]
    async fn unknown_function_surfaces_error_then_done() {
        let gateway = MockGateway::new(vec![MockResponse::function_call(
            "Vanish",
            serde_json::json!({}),
        )]);
        let (svc, context, user, session) = setup(gateway).await;

        let events = collect(svc.ask(request(user, session), CancellationToken::new())).await;
        let error_pos = events.iter().position(|e| matches!(e, AskEvent::Error(_)));
        assert!(error_pos.is_some());
        assert!(matches!(events.last(), Some(AskEvent::Done)));

        // A failed ask persists nothing.
        let window = context.get_context(user, session).await.unwrap();
        assert_eq!(window.turns, 0);
    }

    #[tokio::test]
    async fn dropping_the_stream_does_not_skip_persistence() {
        let gateway = MockGateway::new(vec![MockResponse::stream_text("الجواب")]);
        let (svc, context, user, session) = setup(gateway).await;

        let stream = svc.ask(request(user, session), CancellationToken::new());
        drop(stream);

        // The spawned orchestration still runs SetContext exactly once.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let window = context.get_context(user, session).await.unwrap();
            if window.turns == 1 {
                break;
            }
            assert!(Instant::now() < deadline, "ask never persisted");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn cancellation_surfaces_cancelled() {
        let gateway = MockGateway::new(vec![MockResponse::delayed(
            Duration::from_secs(5),
            MockResponse::stream_text("late"),
        )]);
        let (svc, context, user, session) = setup(gateway).await;

        let cancel = CancellationToken::new();
        let stream = svc.ask(request(user, session), cancel.clone());
        cancel.cancel();

        let events = collect(stream).await;
        let cancelled = events.iter().any(|e| {
            matches!(e, AskEvent::Error(MinbarError::Cancelled))
        });
        assert!(cancelled, "expected a cancelled error event");

        let window = context.get_context(user, session).await.unwrap();
        assert_eq!(window.turns, 0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_stalled_function_dispatch() {
        use crate::functions::AgentFn;
        use minbar_core::window::FunctionResponse;

        struct StalledFn;
        #[async_trait]
        impl AgentFn for StalledFn {
            fn name(&self) -> &str {
                "Search"
            }
            async fn call(&self, _args: &serde_json::Value) -> Result<FunctionResponse> {
                std::future::pending().await
            }
        }

        let gateway = MockGateway::new(vec![MockResponse::function_call(
            "Search",
            serde_json::json!({
                "full_prompt": "آية الكرسي",
                "prompts_with_filters": [{"prompt": "آية الكرسي"}]
            }),
        )]);
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
        let context = Arc::new(ContextManager::new(
            Arc::new(MemoryCache::new()) as Arc<dyn Cache>,
            bus as Arc<dyn Publisher>,
            db,
        ));
        let svc = Arc::new(AskSvc::new(
            context.clone(),
            Arc::new(gateway),
            Arc::new(AgentRegistry::new()),
            Arc::new(FnRegistry::new().register(Arc::new(StalledFn))),
        ));

        let cancel = CancellationToken::new();
        let stream = svc.ask(request(user, session), cancel.clone());
        // Let the ask reach the dispatch before pulling the plug.
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let events = collect(stream).await;
        let cancelled = events
            .iter()
            .any(|e| matches!(e, AskEvent::Error(MinbarError::Cancelled)));
        assert!(cancelled, "expected a cancelled error event");
        assert!(matches!(events.last(), Some(AskEvent::Done)));

        let window = context.get_context(user, session).await.unwrap();
        assert_eq!(window.turns, 0);
    }

    #[tokio::test]
    async fn turn_numbers_increase_across_asks() {
        let gateway = MockGateway::new(vec![
            MockResponse::stream_text("أولا"),
            MockResponse::stream_text("ثانيا"),
        ]);
        let (svc, context, user, session) = setup(gateway).await;

        collect(svc.ask(request(user, session), CancellationToken::new())).await;
        collect(svc.ask(request(user, session), CancellationToken::new())).await;

        let window = context.get_context(user, session).await.unwrap();
        assert_eq!(window.turns, 2);
        assert_eq!(window.history[0].turn, 1);
        assert_eq!(window.history[1].turn, 2);
    }
}
