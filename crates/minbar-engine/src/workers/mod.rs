//! Durable-queue workers: the Syncer persists interactions in batches,
//! the Summarizer compresses long or idle sessions, and the Memorizer
//! extracts durable user facts. All three loop over cancellation, their
//! consumer stream, a timer, and their readiness probe.

mod memorizer;
mod summarizer;
mod syncer;

pub use memorizer::{Memorizer, MEMORIZE_IDLE, MEMORIZE_MESSAGE_THRESHOLD};
pub use summarizer::{Summarizer, SUMMARIZE_IDLE, SUMMARIZE_TURN_THRESHOLD};
pub use syncer::{Syncer, SYNC_BATCH_SIZE, SYNC_IDLE_FLUSH};

use std::time::Duration;

/// Grace period added to a worker's idle time to form its consumer ack
/// wait, so a message never times out under a healthy worker.
pub const ACK_WAIT_OFFSET: Duration = Duration::from_secs(2 * 60);
