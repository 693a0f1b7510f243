use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::event::{EventBus, EventKind, ExecutionEvent, Tee};
use stepwise_core::traits::EventSink;
use stepwise_core::types::RunId;

use crate::executor::{RunOutcome, WorkflowEngine};
use crate::graph::WorkflowGraph;
use crate::suspension::{Parking, ResumeSignal, SuspendedRun, SuspensionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Failed,
    Suspended,
}

/// Final word on one leg of a run, as reported to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    /// Failing or suspended node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl RunSummary {
    fn failed(run_id: RunId, node_id: Option<String>, error: &StepwiseError) -> Self {
        Self {
            run_id,
            status: RunStatus::Failed,
            node_id,
            output: None,
            error: Some(error.to_payload()),
            prompt: None,
        }
    }
}

/// What [`RunManager::cancel`] did.
#[derive(Debug, Clone)]
pub enum Cancellation {
    /// The run is executing. Its terminal `error` event arrives on its own stream.
    Signalled,
    /// The run was suspended and has been dropped from the store. No task is
    /// left to report it, so this is its terminal event.
    Discarded(ExecutionEvent),
    NotFound,
}

impl Cancellation {
    pub fn found(&self) -> bool {
        !matches!(self, Self::NotFound)
    }
}

/// A run executing on its own task.
pub struct RunHandle {
    pub run_id: RunId,
    /// The run's events, in order. Closes when the run stops.
    pub events: mpsc::UnboundedReceiver<ExecutionEvent>,
    pub outcome: JoinHandle<RunSummary>,
}

/// Owns live runs and suspended ones.
///
/// Each run gets its own task, context and cancellation token. Suspended runs
/// go to the store; `resume` picks them up again on a fresh task.
pub struct RunManager {
    engine: Arc<WorkflowEngine>,
    store: Arc<dyn SuspensionStore>,
    live: Mutex<HashMap<RunId, CancellationToken>>,
    bus: Option<Arc<EventBus>>,
}

impl RunManager {
    pub fn new(engine: Arc<WorkflowEngine>, store: Arc<dyn SuspensionStore>) -> Self {
        Self {
            engine,
            store,
            live: Mutex::new(HashMap::new()),
            bus: None,
        }
    }

    /// Also publish every event of every run on `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// Validate `graph` and start running it in the background.
    pub fn submit(
        self: &Arc<Self>,
        graph: WorkflowGraph,
        inputs: Map<String, Value>,
    ) -> Result<RunHandle> {
        graph.validate()?;
        let run_id = RunId::new();
        let cancel = self.register(&run_id);
        let (tx, rx) = mpsc::unbounded_channel();

        let manager = Arc::clone(self);
        let task_run_id = run_id.clone();
        let outcome = tokio::spawn(async move {
            let tee;
            let sink: &dyn EventSink = match &manager.bus {
                Some(bus) => {
                    tee = Tee::new(&tx, bus.as_ref());
                    &tee
                }
                None => &tx,
            };
            let result = manager
                .engine
                .start_parked(&task_run_id, graph, inputs, sink, Some(manager.as_ref()), cancel)
                .await;
            manager.settle(task_run_id, result)
        });

        Ok(RunHandle {
            run_id,
            events: rx,
            outcome,
        })
    }

    /// Continue a suspended run. `RunNotFound` if it is not suspended.
    pub fn resume(self: &Arc<Self>, signal: ResumeSignal) -> Result<RunHandle> {
        let suspended = self.store.take(&signal.run_id)?;
        let run_id = suspended.run_id.clone();
        let cancel = self.register(&run_id);
        let (tx, rx) = mpsc::unbounded_channel();

        let manager = Arc::clone(self);
        let task_run_id = run_id.clone();
        let outcome = tokio::spawn(async move {
            let tee;
            let sink: &dyn EventSink = match &manager.bus {
                Some(bus) => {
                    tee = Tee::new(&tx, bus.as_ref());
                    &tee
                }
                None => &tx,
            };
            let result = manager
                .engine
                .resume_parked(suspended, signal, sink, Some(manager.as_ref()), cancel)
                .await;
            manager.settle(task_run_id, result)
        });

        Ok(RunHandle {
            run_id,
            events: rx,
            outcome,
        })
    }

    /// Cancel a live or suspended run.
    pub fn cancel(&self, run_id: &RunId) -> Result<Cancellation> {
        // Held until the store is checked, so a run being parked is seen in one place
        let live = self.live_runs();
        if let Some(token) = live.get(run_id) {
            info!(run_id = %run_id, "Cancelling run");
            token.cancel();
            return Ok(Cancellation::Signalled);
        }

        let suspended = match self.store.take(run_id) {
            Ok(suspended) => suspended,
            Err(StepwiseError::RunNotFound(_)) => return Ok(Cancellation::NotFound),
            Err(e) => return Err(e),
        };
        drop(live);
        info!(run_id = %run_id, node_id = %suspended.cursor, "Suspended run cancelled");
        let event = ExecutionEvent::new(
            run_id,
            suspended.cursor,
            EventKind::Error,
            StepwiseError::Cancelled.to_payload(),
        );
        if let Some(bus) = &self.bus {
            bus.emit(event.clone());
        }
        Ok(Cancellation::Discarded(event))
    }

    pub fn is_live(&self, run_id: &RunId) -> bool {
        self.live_runs().contains_key(run_id)
    }

    pub fn suspended_runs(&self) -> Result<Vec<SuspendedRun>> {
        self.store.list()
    }

    /// Resume every suspension whose approval deadline has passed, applying
    /// its configured timeout decision.
    pub fn sweep_expired(self: &Arc<Self>) -> Result<Vec<RunHandle>> {
        let expired = self.store.expired(Utc::now())?;
        let mut handles = Vec::with_capacity(expired.len());
        for run in expired {
            info!(
                run_id = %run.run_id,
                node_id = %run.cursor,
                decision = run.on_timeout.as_str(),
                "Approval timed out"
            );
            let signal = ResumeSignal {
                run_id: run.run_id.clone(),
                decision: run.on_timeout,
                note: Some("approval timed out".into()),
            };
            match self.resume(signal) {
                Ok(handle) => handles.push(handle),
                // Someone else resumed it between listing and taking
                Err(StepwiseError::RunNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(handles)
    }

    /// Sweep expired approvals every `interval` until `shutdown` fires.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "Approval sweeper started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => {
                    info!("Approval sweeper shutting down");
                    break;
                }
            }
            match self.sweep_expired() {
                Ok(handles) if !handles.is_empty() => {
                    info!(count = handles.len(), "Resumed expired approvals");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Approval sweep failed"),
            }
        }
    }

    fn live_runs(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, CancellationToken>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, run_id: &RunId) -> CancellationToken {
        let token = CancellationToken::new();
        self.live_runs().insert(run_id.clone(), token.clone());
        token
    }

    /// Record how a run leg ended and drop its token.
    fn settle(&self, run_id: RunId, result: Result<RunOutcome>) -> RunSummary {
        let parked = matches!(result, Ok(RunOutcome::Suspended(_)));
        let summary = self.summarize(run_id, result);
        // A parked run gave up its token in `park`; the id may belong to a resumed leg now
        if !parked {
            self.live_runs().remove(&summary.run_id);
        }
        summary
    }

    fn summarize(&self, run_id: RunId, result: Result<RunOutcome>) -> RunSummary {
        match result {
            Ok(RunOutcome::Completed { output }) => RunSummary {
                run_id,
                status: RunStatus::Completed,
                node_id: None,
                output: Some(output),
                error: None,
                prompt: None,
            },
            Ok(RunOutcome::Failed { node_id, error }) => {
                RunSummary::failed(run_id, Some(node_id), &error)
            }
            Ok(RunOutcome::Suspended(suspended)) => RunSummary {
                run_id,
                status: RunStatus::Suspended,
                node_id: Some(suspended.cursor),
                output: None,
                error: None,
                prompt: Some(suspended.prompt),
            },
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Run did not start");
                RunSummary::failed(run_id, None, &e)
            }
        }
    }
}

impl Parking for RunManager {
    /// Store the run unless it was cancelled on the way in. The live lock is
    /// held throughout, so `cancel` sees the run either live or stored.
    fn park(&self, run: &SuspendedRun) -> Result<()> {
        let mut live = self.live_runs();
        if live.get(&run.run_id).is_some_and(|token| token.is_cancelled()) {
            return Err(StepwiseError::Cancelled);
        }
        if let Err(e) = self.store.save(run) {
            error!(run_id = %run.run_id, error = %e, "Failed to store suspended run");
            return Err(e);
        }
        live.remove(&run.run_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_core::config::EngineConfig;
    use crate::invoker::LlmInvoker;
    use crate::suspension::{sample_run, MemorySuspensionStore};
    use stepwise_script::RhaiScriptRunner;
    use stepwise_test_utils::{test_model_config, MockLlmClient, MockToolProvider};

    fn manager(store: Arc<MemorySuspensionStore>) -> RunManager {
        let tools = Arc::new(MockToolProvider::new());
        let invoker =
            LlmInvoker::new(Arc::new(MockLlmClient::new()), tools.clone(), test_model_config());
        let engine = WorkflowEngine::new(
            EngineConfig::default(),
            Arc::new(RhaiScriptRunner::new()),
            Arc::new(invoker),
            tools,
        );
        RunManager::new(Arc::new(engine), store)
    }

    #[test]
    fn test_park_refuses_cancelled_run() {
        let store = Arc::new(MemorySuspensionStore::new());
        let manager = manager(store.clone());
        let run = sample_run("r1", None);
        manager.register(&run.run_id);

        assert!(matches!(manager.cancel(&run.run_id).unwrap(), Cancellation::Signalled));
        assert!(matches!(manager.park(&run), Err(StepwiseError::Cancelled)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_park_stores_and_releases_token() {
        let store = Arc::new(MemorySuspensionStore::new());
        let manager = manager(store.clone());
        let run = sample_run("r2", None);
        manager.register(&run.run_id);

        manager.park(&run).unwrap();
        assert_eq!(store.len(), 1);
        assert!(!manager.is_live(&run.run_id));
        assert!(matches!(manager.cancel(&run.run_id).unwrap(), Cancellation::Discarded(_)));
    }
}
