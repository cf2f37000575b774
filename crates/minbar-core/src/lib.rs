pub mod domain;
pub mod errors;
pub mod fusion;
pub mod gateway;
pub mod ids;
pub mod ports;
pub mod pubsub;
pub mod window;

pub use errors::{MinbarError, Result};
