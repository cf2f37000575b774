//! The conversational engine: hybrid retrieval, cache-first context
//! windows, streaming ask orchestration, and the durable-queue workers
//! that persist and distill what the conversations produce.

pub mod ask;
pub mod context;
pub mod functions;
pub mod probe;
pub mod search;
pub mod text;
pub mod workers;

pub use ask::{AskEvent, AskRequest, AskSvc};
pub use context::ContextManager;
pub use functions::{AgentFn, FnRegistry, SearchFn};
pub use probe::{probe_pair, ProbeResponder, WorkerProbe};
pub use search::SearchSvc;
pub use workers::{
    Memorizer, Summarizer, Syncer, ACK_WAIT_OFFSET, MEMORIZE_IDLE, MEMORIZE_MESSAGE_THRESHOLD,
    SUMMARIZE_IDLE, SUMMARIZE_TURN_THRESHOLD, SYNC_BATCH_SIZE, SYNC_IDLE_FLUSH,
};
