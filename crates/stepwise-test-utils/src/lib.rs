//! Mocks and fixtures shared by the Stepwise test suites.

mod fixtures;
mod mock_llm;
mod mock_tools;
mod sink;

pub use fixtures::*;
pub use mock_llm::MockLlmClient;
pub use mock_tools::MockToolProvider;
pub use sink::CollectingSink;
