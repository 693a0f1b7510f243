use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stepwise_core::config::EngineConfig;
use stepwise_core::error::{InvokerErrorKind, Result, StepwiseError};
use stepwise_core::event::{EventKind, ExecutionEvent};
use stepwise_core::traits::{EventSink, ScriptRunner, ToolProvider};
use stepwise_core::types::RunId;

use crate::context::ExecutionContext;
use crate::graph::{
    AgentConfig, Branch, Decision, Edge, IfElseConfig, Node, NodeKind, ToolNodeConfig,
    TransformConfig, WhileConfig, WorkflowGraph,
};
use crate::inputs::bind_inputs;
use crate::invoker::{AgentInvoker, AgentRequest};
use crate::resolver::{resolve_value, resolve_with_warnings};
use crate::suspension::{Parking, ResumeSignal, SuspendedRun};

/// Terminal state of one `start` or `resume` call.
#[derive(Debug)]
pub enum RunOutcome {
    Completed { output: Value },
    Failed { node_id: String, error: StepwiseError },
    /// Parked on an approval node; hand this to a store and resume it later.
    Suspended(Box<SuspendedRun>),
}

impl RunOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Suspended(_) => "suspended",
        }
    }
}

/// What a node asks the interpreter to do next.
enum Step<'g> {
    Advance { output: Value, edge: &'g Edge },
    Finish { output: Value },
    Suspend { prompt: String, timeout_secs: Option<u64>, on_timeout: Decision },
}

/// The graph interpreter.
///
/// One call to [`WorkflowEngine::start`] or [`WorkflowEngine::resume`] drives a
/// run one node at a time until it completes, fails or suspends. The engine
/// holds no per-run state, so one instance serves any number of concurrent runs.
pub struct WorkflowEngine {
    config: EngineConfig,
    scripts: Arc<dyn ScriptRunner>,
    invoker: Arc<dyn AgentInvoker>,
    tools: Arc<dyn ToolProvider>,
}

struct Run<'a> {
    id: &'a RunId,
    sink: &'a dyn EventSink,
    park: Option<&'a dyn Parking>,
    cancel: &'a CancellationToken,
}

impl Run<'_> {
    fn emit(&self, node_id: &str, kind: EventKind, payload: Value) {
        self.sink
            .emit(ExecutionEvent::new(self.id, node_id, kind, payload));
    }
}

impl WorkflowEngine {
    pub fn new(
        config: EngineConfig,
        scripts: Arc<dyn ScriptRunner>,
        invoker: Arc<dyn AgentInvoker>,
        tools: Arc<dyn ToolProvider>,
    ) -> Self {
        Self {
            config,
            scripts,
            invoker,
            tools,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate `graph`, bind `inputs` and run from the start node.
    ///
    /// Only a graph that fails validation is an `Err`; node failures come back
    /// as [`RunOutcome::Failed`] after their `error` event.
    pub async fn start(
        &self,
        run_id: &RunId,
        graph: WorkflowGraph,
        inputs: Map<String, Value>,
        sink: &dyn EventSink,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        self.start_parked(run_id, graph, inputs, sink, None, cancel)
            .await
    }

    /// [`start`](Self::start), handing a suspending run to `park` before its
    /// `suspended` event goes out.
    pub async fn start_parked(
        &self,
        run_id: &RunId,
        graph: WorkflowGraph,
        inputs: Map<String, Value>,
        sink: &dyn EventSink,
        park: Option<&dyn Parking>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        graph.validate()?;
        let Some(start) = graph.start_node() else {
            return Err(StepwiseError::validation("graph has no start node", None));
        };
        let start_id = start.id.clone();
        let run = Run {
            id: run_id,
            sink,
            park,
            cancel: &cancel,
        };

        let bound = match &start.kind {
            NodeKind::Start(cfg) => bind_inputs(cfg, inputs),
            _ => Ok(inputs),
        };
        let inputs = match bound {
            Ok(inputs) => inputs,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Run rejected inputs");
                run.emit(&start_id, EventKind::Error, e.to_payload());
                return Ok(RunOutcome::Failed {
                    node_id: start_id,
                    error: e,
                });
            }
        };

        info!(run_id = %run_id, nodes = graph.nodes.len(), "Run started");
        let ctx = ExecutionContext::new(inputs);
        Ok(self.drive(&run, graph, ctx, start_id).await)
    }

    /// Continue a suspended run with an approver's decision.
    pub async fn resume(
        &self,
        suspended: SuspendedRun,
        signal: ResumeSignal,
        sink: &dyn EventSink,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        self.resume_parked(suspended, signal, sink, None, cancel)
            .await
    }

    /// [`resume`](Self::resume) with a [`Parking`] for the next suspension.
    pub async fn resume_parked(
        &self,
        suspended: SuspendedRun,
        signal: ResumeSignal,
        sink: &dyn EventSink,
        park: Option<&dyn Parking>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        if signal.run_id != suspended.run_id {
            return Err(StepwiseError::RunNotFound(signal.run_id.to_string()));
        }
        let SuspendedRun {
            run_id,
            graph,
            mut context,
            cursor,
            ..
        } = suspended;
        let run = Run {
            id: &run_id,
            sink,
            park,
            cancel: &cancel,
        };

        let decision = json!({
            "decision": signal.decision,
            "note": signal.note,
        });
        info!(run_id = %run_id, node_id = %cursor, decision = signal.decision.as_str(), "Run resumed");
        run.emit(&cursor, EventKind::Resumed, decision.clone());

        match signal.decision {
            Decision::Reject => {
                let error = StepwiseError::ApprovalRejected {
                    node_id: cursor.clone(),
                    note: signal.note,
                };
                run.emit(&cursor, EventKind::Error, error.to_payload());
                Ok(RunOutcome::Failed {
                    node_id: cursor,
                    error,
                })
            }
            Decision::Approve => {
                let edge = match next_edge(&graph, &cursor, None) {
                    Ok(edge) => edge.clone(),
                    Err(error) => {
                        run.emit(&cursor, EventKind::Error, error.to_payload());
                        return Ok(RunOutcome::Failed {
                            node_id: cursor,
                            error,
                        });
                    }
                };
                context.record_control(&cursor, decision.clone());
                run.emit(&cursor, EventKind::Output, decision);
                context.traverse(&edge);
                debug!(run_id = %run_id, edge_id = %edge.id, target = %edge.target, "Edge taken");
                Ok(self.drive(&run, graph, context, edge.target).await)
            }
        }
    }

    async fn drive(
        &self,
        run: &Run<'_>,
        graph: WorkflowGraph,
        mut ctx: ExecutionContext,
        mut current: String,
    ) -> RunOutcome {
        loop {
            let failed = |node_id: String, error: StepwiseError| {
                run.emit(&node_id, EventKind::Error, error.to_payload());
                RunOutcome::Failed { node_id, error }
            };

            if run.cancel.is_cancelled() {
                info!(run_id = %run.id, node_id = %current, "Run cancelled");
                return failed(current, StepwiseError::Cancelled);
            }

            ctx.steps += 1;
            if ctx.steps > self.config.max_steps {
                error!(run_id = %run.id, steps = ctx.steps, "Step budget exhausted");
                let iterations = u32::try_from(ctx.steps).unwrap_or(u32::MAX);
                return failed(
                    current.clone(),
                    StepwiseError::LoopSafety {
                        node_id: current,
                        iterations,
                    },
                );
            }

            let Some(node) = graph.node(&current) else {
                let error = StepwiseError::validation("edge leads to unknown node", Some(&current));
                return failed(current, error);
            };

            info!(run_id = %run.id, node_id = %node.id, kind = node.kind.name(), "Dispatching node");
            run.emit(&node.id, EventKind::Started, json!({ "kind": node.kind.name() }));

            let started = Instant::now();
            let step = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => Err(StepwiseError::Cancelled),
                step = self.dispatch(run, &graph, node, &mut ctx) => step,
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match step {
                Ok(Step::Advance { output, edge }) => {
                    debug!(
                        run_id = %run.id,
                        node_id = %node.id,
                        edge_id = %edge.id,
                        target = %edge.target,
                        elapsed_ms,
                        "Edge taken"
                    );
                    run.emit(&node.id, EventKind::Output, output);
                    ctx.traverse(edge);
                    current = edge.target.clone();
                }
                Ok(Step::Finish { output }) => {
                    run.emit(&node.id, EventKind::Output, output.clone());
                    info!(run_id = %run.id, steps = ctx.steps, "Run completed");
                    return RunOutcome::Completed { output };
                }
                Ok(Step::Suspend {
                    prompt,
                    timeout_secs,
                    on_timeout,
                }) => {
                    let suspended_at = Utc::now();
                    let expires_at = timeout_secs
                        .and_then(|secs| i64::try_from(secs).ok())
                        .and_then(chrono::Duration::try_seconds)
                        .and_then(|ttl| suspended_at.checked_add_signed(ttl));
                    let payload = json!({
                        "prompt": prompt,
                        "expiresAt": expires_at,
                        "onTimeout": on_timeout,
                    });
                    let node_id = node.id.clone();
                    let suspended = SuspendedRun {
                        run_id: run.id.clone(),
                        cursor: node_id.clone(),
                        graph,
                        context: ctx,
                        prompt,
                        suspended_at,
                        expires_at,
                        on_timeout,
                    };
                    if let Some(park) = run.park {
                        if let Err(e) = park.park(&suspended) {
                            warn!(run_id = %run.id, node_id = %node_id, error = %e, "Run could not be parked");
                            return failed(node_id, e);
                        }
                    }
                    run.emit(&node_id, EventKind::Suspended, payload);
                    info!(run_id = %run.id, node_id = %node_id, "Run awaiting approval");
                    return RunOutcome::Suspended(Box::new(suspended));
                }
                Err(e) => {
                    error!(run_id = %run.id, node_id = %node.id, error = %e, elapsed_ms, "Node failed");
                    return failed(node.id.clone(), e);
                }
            }
        }
    }

    async fn dispatch<'g>(
        &self,
        run: &Run<'_>,
        graph: &'g WorkflowGraph,
        node: &Node,
        ctx: &mut ExecutionContext,
    ) -> Result<Step<'g>> {
        let id = node.id.as_str();
        match &node.kind {
            NodeKind::Start(_) => {
                let output = Value::Object(ctx.inputs.clone());
                ctx.record_control(id, output.clone());
                Ok(Step::Advance {
                    output,
                    edge: next_edge(graph, id, None)?,
                })
            }
            NodeKind::End => {
                let output = ctx.last_output.clone().unwrap_or(Value::Null);
                ctx.record_control(id, output.clone());
                Ok(Step::Finish { output })
            }
            NodeKind::Agent(cfg) => {
                let output = self.run_agent(run, id, cfg, ctx).await?;
                ctx.record_output(id, output.clone());
                Ok(Step::Advance {
                    output,
                    edge: next_edge(graph, id, None)?,
                })
            }
            NodeKind::Transform(cfg) => {
                let output = self.run_transform(run, cfg, ctx).await?;
                ctx.record_output(id, output.clone());
                Ok(Step::Advance {
                    output,
                    edge: next_edge(graph, id, None)?,
                })
            }
            NodeKind::IfElse(cfg) => {
                let branch = self.run_if_else(run, cfg, ctx).await?;
                let output = json!({ "branch": branch.as_str() });
                ctx.record_control(id, output.clone());
                Ok(Step::Advance {
                    output,
                    edge: next_edge(graph, id, Some(branch))?,
                })
            }
            NodeKind::While(cfg) => {
                let (branch, iteration) = self.run_while(run, id, cfg, ctx).await?;
                let output = json!({ "branch": branch.as_str(), "iteration": iteration });
                ctx.record_control(id, output.clone());
                Ok(Step::Advance {
                    output,
                    edge: next_edge(graph, id, Some(branch))?,
                })
            }
            NodeKind::UserApproval(cfg) => Ok(Step::Suspend {
                prompt: self.resolve(run, id, &cfg.prompt, ctx),
                timeout_secs: cfg.timeout_secs,
                on_timeout: cfg.on_timeout,
            }),
            NodeKind::Tool(cfg) => {
                let output = self.run_tool(cfg, ctx).await?;
                ctx.record_output(id, output.clone());
                Ok(Step::Advance {
                    output,
                    edge: next_edge(graph, id, None)?,
                })
            }
        }
    }

    fn resolve(&self, run: &Run<'_>, node_id: &str, template: &str, ctx: &ExecutionContext) -> String {
        let resolved = resolve_with_warnings(template, ctx);
        for warning in &resolved.warnings {
            warn!(run_id = %run.id, node_id = %node_id, "{}", warning);
        }
        resolved.text
    }

    async fn run_agent(
        &self,
        run: &Run<'_>,
        node_id: &str,
        cfg: &AgentConfig,
        ctx: &ExecutionContext,
    ) -> Result<Value> {
        let request = AgentRequest {
            instructions: self.resolve(run, node_id, &cfg.instructions, ctx),
            model: cfg.model.clone(),
            tools: cfg.tools.clone(),
            output_format: cfg.output_format.clone(),
            max_tool_rounds: cfg.max_tool_rounds,
        };
        let result = self.invoker.invoke(request, run.cancel.clone()).await?;
        debug!(
            node_id = %node_id,
            tool_rounds = result.tool_rounds,
            input_tokens = result.input_tokens,
            output_tokens = result.output_tokens,
            "Agent answered"
        );
        Ok(result.output)
    }

    async fn run_transform(
        &self,
        run: &Run<'_>,
        cfg: &TransformConfig,
        ctx: &ExecutionContext,
    ) -> Result<Value> {
        let timeout = Duration::from_millis(cfg.timeout_ms.unwrap_or(self.config.script_timeout_ms));
        self.scripts
            .run(&cfg.script, ctx.bindings(), timeout, run.cancel.clone())
            .await
    }

    async fn run_if_else(
        &self,
        run: &Run<'_>,
        cfg: &IfElseConfig,
        ctx: &ExecutionContext,
    ) -> Result<Branch> {
        let timeout = Duration::from_millis(self.config.script_timeout_ms);
        let truth = self
            .scripts
            .run_condition(&cfg.condition, ctx.bindings(), timeout, run.cancel.clone())
            .await?;
        Ok(if truth { Branch::True } else { Branch::False })
    }

    /// Decide whether a loop enters its body again. The counter holds completed
    /// entries; it never passes the effective limit and resets on exit.
    async fn run_while(
        &self,
        run: &Run<'_>,
        node_id: &str,
        cfg: &WhileConfig,
        ctx: &mut ExecutionContext,
    ) -> Result<(Branch, u32)> {
        let ceiling = self.config.loop_ceiling;
        if cfg.max_iterations > ceiling {
            warn!(
                node_id = %node_id,
                max_iterations = cfg.max_iterations,
                ceiling,
                "maxIterations above engine ceiling, clamping"
            );
        }
        let limit = cfg.max_iterations.min(ceiling);
        let completed = ctx.iteration(node_id);

        let enter = if completed >= limit {
            debug!(node_id = %node_id, completed, limit, "Loop limit reached");
            false
        } else {
            let timeout = Duration::from_millis(self.config.script_timeout_ms);
            let bindings = ctx.bindings().with("iteration", json!(completed + 1));
            self.scripts
                .run_condition(&cfg.while_condition, bindings, timeout, run.cancel.clone())
                .await?
        };

        if enter {
            let iteration = completed + 1;
            ctx.iteration_counters.insert(node_id.to_string(), iteration);
            Ok((Branch::Body, iteration))
        } else {
            ctx.iteration_counters.remove(node_id);
            Ok((Branch::Exit, completed))
        }
    }

    async fn run_tool(&self, cfg: &ToolNodeConfig, ctx: &ExecutionContext) -> Result<Value> {
        let arguments = match resolve_value(&cfg.arguments, ctx) {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        let output = self
            .tools
            .call_on(&cfg.server, &cfg.tool, arguments)
            .await
            .map_err(|e| match e {
                StepwiseError::Cancelled => e,
                e => StepwiseError::invoker(InvokerErrorKind::ToolFailed, e.to_string()),
            })?;
        if output.is_error {
            return Err(StepwiseError::invoker(
                InvokerErrorKind::ToolFailed,
                format!("{}.{} returned an error: {}", cfg.server, cfg.tool, output.content),
            ));
        }
        Ok(output.to_value())
    }
}

/// The edge a node leaves by: the sole outgoing edge, or the one labeled `branch`.
fn next_edge<'g>(graph: &'g WorkflowGraph, node_id: &str, branch: Option<Branch>) -> Result<&'g Edge> {
    let edge = match branch {
        Some(branch) => graph.branch_edge(node_id, branch),
        None => graph.sole_edge(node_id),
    };
    edge.ok_or_else(|| {
        let what = branch.map_or("outgoing", |b| b.as_str());
        StepwiseError::validation(format!("node has no {} edge", what), Some(node_id))
    })
}
