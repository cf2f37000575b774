//! In-process durable message stream with at-least-once delivery.
//!
//! Messages published to a stream are retained (up to a max age) and
//! delivered to durable, subject-filtered consumers. A consumer must
//! settle every delivery: `ack` removes it, `nak` makes it immediately
//! redeliverable, `term` drops it permanently, and `in_progress` extends
//! the ack deadline. Deliveries left unsettled past the ack deadline come
//! back with an incremented delivery count. Publishing is deduplicated by
//! message ID for as long as the original message is retained.

mod consumer;
mod stream;

pub use stream::InProcessBus;
