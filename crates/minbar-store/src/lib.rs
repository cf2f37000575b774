//! SQLite persistence for minbar: users, sessions, messages, memories,
//! plus the in-process context cache. The Syncer worker is the only writer
//! of message rows; reads reconstruct context windows on cache misses.

pub mod cache;
pub mod database;
pub mod error;
pub mod memories;
pub mod messages;
pub mod schema;
pub mod sessions;
pub mod users;

pub use cache::MemoryCache;
pub use database::Database;
pub use error::{Result, StoreError};
pub use memories::MemoryRepo;
pub use messages::{MessageRepo, MessageRow};
pub use sessions::{SessionRepo, SessionRow};
pub use users::{UserRepo, UserRow};
