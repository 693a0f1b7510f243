use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context};
use serde_json::{Map, Value};
use tracing::{info, warn};

use stepwise_engine::{
    Decision, ResumeSignal, RunHandle, RunManager, RunStatus, RunSummary, WorkflowGraph,
};

/// Parse repeated `--input key=value` flags. Values stay strings; the start
/// node's declared types coerce them.
pub fn parse_inputs(pairs: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut inputs = Map::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("input '{}' is not in key=value form", pair);
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("input '{}' has an empty name", pair);
        }
        inputs.insert(key.to_string(), Value::String(value.to_string()));
    }
    Ok(inputs)
}

pub fn load_graph(path: &std::path::Path) -> anyhow::Result<WorkflowGraph> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read graph file {}", path.display()))?;
    Ok(WorkflowGraph::from_json(&text)?)
}

/// Run `graph` to the end, answering every approval gate with `decision` or,
/// when none is given, by asking on the terminal.
pub async fn run_to_end(
    manager: &Arc<RunManager>,
    graph: WorkflowGraph,
    inputs: Map<String, Value>,
    decision: Option<Decision>,
) -> anyhow::Result<RunSummary> {
    let mut handle = manager.submit(graph, inputs)?;
    info!(run_id = %handle.run_id, "Run submitted");

    loop {
        let summary = print_events(manager, handle).await?;
        if summary.status != RunStatus::Suspended {
            return Ok(summary);
        }

        let prompt = summary.prompt.clone().unwrap_or_default();
        let decision = match decision {
            Some(decision) => decision,
            None => ask(prompt).await,
        };
        handle = manager.resume(ResumeSignal {
            run_id: summary.run_id,
            decision,
            note: None,
        })?;
    }
}

/// Print each event as one JSON line on stdout until the run leg ends.
/// Ctrl-C cancels the run; the cancellation still comes back as events.
async fn print_events(manager: &RunManager, mut handle: RunHandle) -> anyhow::Result<RunSummary> {
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = handle.events.recv() => {
                let Some(event) = event else { break };
                let line = serde_json::to_string(&event)?;
                let mut stdout = io::stdout().lock();
                writeln!(stdout, "{}", line)?;
                stdout.flush()?;
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                warn!(run_id = %handle.run_id, "Interrupted, cancelling run");
                manager.cancel(&handle.run_id)?;
            }
        }
    }
    Ok(handle.outcome.await?)
}

async fn ask(prompt: String) -> Decision {
    let answer = tokio::task::spawn_blocking(move || {
        dialoguer::Confirm::new()
            .with_prompt(format!("[approval] {}", prompt))
            .default(false)
            .interact()
            .unwrap_or(false)
    })
    .await
    .unwrap_or(false);
    if answer {
        Decision::Approve
    } else {
        Decision::Reject
    }
}
