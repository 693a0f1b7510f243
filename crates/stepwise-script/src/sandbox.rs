use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use rhai::{Dynamic, Engine, EvalAltResult, Scope};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::{ScriptBindings, ScriptRunner};

const TERMINATED_TIMEOUT: &str = "timeout";
const TERMINATED_CANCELLED: &str = "cancelled";

/// Resource ceilings applied to every evaluation. Zero disables a limit.
#[derive(Debug, Clone)]
pub struct ScriptLimits {
    pub max_operations: u64,
    pub max_call_levels: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
    pub max_expr_depth: usize,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            max_operations: 50_000_000,
            max_call_levels: 32,
            max_string_size: 1 << 20,
            max_array_size: 100_000,
            max_map_size: 100_000,
            max_expr_depth: 64,
        }
    }
}

/// [`ScriptRunner`] backed by a locked-down Rhai engine.
#[derive(Debug, Clone, Default)]
pub struct RhaiScriptRunner {
    limits: ScriptLimits,
}

impl RhaiScriptRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: ScriptLimits) -> Self {
        Self { limits }
    }
}

fn build_engine(limits: &ScriptLimits, deadline: Instant, cancel: CancellationToken) -> Engine {
    let mut engine = Engine::new();

    engine.set_max_operations(limits.max_operations);
    engine.set_max_call_levels(limits.max_call_levels);
    engine.set_max_string_size(limits.max_string_size);
    engine.set_max_array_size(limits.max_array_size);
    engine.set_max_map_size(limits.max_map_size);
    engine.set_max_expr_depths(limits.max_expr_depth, limits.max_expr_depth);
    engine.set_strict_variables(true);
    engine.disable_symbol("eval");

    // stdout belongs to the event stream
    engine.on_print(|text| debug!(target: "stepwise::script", "{}", text));
    engine.on_debug(|text, _, _| debug!(target: "stepwise::script", "{}", text));

    engine.on_progress(move |_ops| {
        if cancel.is_cancelled() {
            Some(Dynamic::from(TERMINATED_CANCELLED))
        } else if Instant::now() >= deadline {
            Some(Dynamic::from(TERMINATED_TIMEOUT))
        } else {
            None
        }
    });

    engine
}

fn build_scope(bindings: ScriptBindings) -> Result<Scope<'static>> {
    let mut scope = Scope::new();
    for (name, value) in bindings.iter() {
        let value = rhai::serde::to_dynamic(value).map_err(|e| StepwiseError::Script {
            message: format!("cannot bind '{}': {}", name, e),
        })?;
        scope.push_dynamic(name.clone(), value);
    }
    Ok(scope)
}

fn map_eval_error(err: Box<EvalAltResult>, timeout: Duration) -> StepwiseError {
    if let EvalAltResult::ErrorTerminated(token, _) = &*err {
        if token.clone().into_string().ok().as_deref() == Some(TERMINATED_CANCELLED) {
            return StepwiseError::Cancelled;
        }
        return StepwiseError::ScriptTimeout {
            timeout_ms: timeout.as_millis() as u64,
        };
    }
    StepwiseError::Script {
        message: err.to_string(),
    }
}

fn evaluate(
    script: &str,
    bindings: ScriptBindings,
    limits: &ScriptLimits,
    timeout: Duration,
    cancel: CancellationToken,
) -> Result<serde_json::Value> {
    let engine = build_engine(limits, Instant::now() + timeout, cancel);

    let mut scope = build_scope(bindings)?;
    let ast = engine
        .compile_with_scope(&scope, script)
        .map_err(|e| StepwiseError::Script {
            message: format!("syntax error: {}", e),
        })?;

    let value = engine
        .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
        .map_err(|e| map_eval_error(e, timeout))?;

    rhai::serde::from_dynamic::<serde_json::Value>(&value).map_err(|e| StepwiseError::Script {
        message: format!("result of type '{}' is not data: {}", value.type_name(), e),
    })
}

impl ScriptRunner for RhaiScriptRunner {
    fn run(
        &self,
        script: &str,
        bindings: ScriptBindings,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        let script = script.to_string();
        let limits = self.limits.clone();

        Box::pin(async move {
            let started = Instant::now();
            let handle = tokio::task::spawn_blocking(move || {
                evaluate(&script, bindings, &limits, timeout, cancel)
            });
            let result = handle.await.map_err(|e| StepwiseError::Script {
                message: format!("script task failed: {}", e),
            })?;
            debug!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                ok = result.is_ok(),
                "Script evaluated"
            );
            result
        })
    }
}
