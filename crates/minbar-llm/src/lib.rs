pub mod mock;
pub mod profiles;
pub mod schema;

pub use mock::{MockGateway, MockResponse};
pub use profiles::{
    AgentName, AgentProfile, AgentRegistry, MemorizerOutput, MemoryOp, SummarizerOutput,
    FUNCTION_SEARCH, MEMORY_CONFIDENCE_FLOOR,
};
pub use schema::Schema;
