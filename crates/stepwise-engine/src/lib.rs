//! Workflow graph execution for Stepwise.
//!
//! [`WorkflowGraph`] is the validated document, [`WorkflowEngine`] the
//! interpreter that walks it, and [`RunManager`] the owner of live and
//! suspended runs.

pub mod context;
pub mod executor;
pub mod graph;
pub mod inputs;
pub mod invoker;
pub mod manager;
pub mod resolver;
pub mod suspension;

pub use context::ExecutionContext;
pub use executor::{RunOutcome, WorkflowEngine};
pub use graph::{Decision, Node, NodeKind, WorkflowGraph};
pub use invoker::{AgentInvoker, AgentRequest, AgentResult, LlmInvoker};
pub use manager::{Cancellation, RunHandle, RunManager, RunStatus, RunSummary};
pub use resolver::{resolve, resolve_value, resolve_with_warnings};
pub use suspension::{
    MemorySuspensionStore, Parking, ResumeSignal, SqliteSuspensionStore, SuspendedRun,
    SuspensionStore,
};
