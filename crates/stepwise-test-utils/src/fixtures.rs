use serde_json::{json, Value};

use stepwise_core::config::{AppConfig, ModelConfig};

/// Model config pointing nowhere; only mocks ever see it.
pub fn test_model_config() -> ModelConfig {
    toml::from_str(
        r#"
provider = "openai"
model_id = "test-model"
"#,
    )
    .unwrap()
}

/// Config with short timeouts suited to tests.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::parse(
        r#"
[model]
model_id = "test-model"

[engine]
script_timeout_ms = 1000
invoker_timeout_secs = 5
"#,
    )
    .unwrap();
    config.engine.max_tool_rounds = 3;
    config
}

pub fn node(id: &str, kind: &str, config: Value) -> Value {
    json!({"id": id, "kind": kind, "config": config})
}

pub fn edge(id: &str, source: &str, target: &str, label: Option<&str>) -> Value {
    json!({"id": id, "source": source, "target": target, "label": label})
}

pub fn graph(nodes: Vec<Value>, edges: Vec<Value>) -> Value {
    json!({"nodes": nodes, "edges": edges})
}

/// Start node declaring one required string input.
pub fn start_with(name: &str) -> Value {
    node(
        "start",
        "start",
        json!({"variables": [{"name": name, "type": "string", "required": true}]}),
    )
}

/// `start -> agent -> end`, instructions `Answer: {{input.question}}`.
pub fn agent_graph() -> Value {
    graph(
        vec![
            start_with("question"),
            node(
                "agent",
                "agent",
                json!({"instructions": "Answer: {{input.question}}"}),
            ),
            node("end", "end", json!({})),
        ],
        vec![
            edge("e1", "start", "agent", None),
            edge("e2", "agent", "end", None),
        ],
    )
}

/// `start -> if-else(condition) -> {yes, no} -> end`, both branches are transforms.
pub fn branch_graph(condition: &str) -> Value {
    graph(
        vec![
            node(
                "start",
                "start",
                json!({"variables": [{"name": "x", "type": "number", "required": true}]}),
            ),
            node("check", "if-else", json!({"condition": condition})),
            node("yes", "transform", json!({"script": "\"big\""})),
            node("no", "transform", json!({"script": "\"small\""})),
            node("end", "end", json!({})),
        ],
        vec![
            edge("e1", "start", "check", None),
            edge("e_true", "check", "yes", Some("true")),
            edge("e_false", "check", "no", Some("false")),
            edge("e3", "yes", "end", None),
            edge("e4", "no", "end", None),
        ],
    )
}

/// `start -> loop <-> body`, `loop -exit-> end`. The body counts its own runs.
pub fn loop_graph(condition: &str, max_iterations: u32) -> Value {
    graph(
        vec![
            node("start", "start", json!({})),
            node(
                "loop",
                "while",
                json!({"whileCondition": condition, "maxIterations": max_iterations}),
            ),
            node(
                "body",
                "transform",
                json!({"script": "if type_of(lastOutput) == \"i64\" { lastOutput + 1 } else { 1 }"}),
            ),
            node("end", "end", json!({})),
        ],
        vec![
            edge("e1", "start", "loop", None),
            edge("e_body", "loop", "body", Some("body")),
            edge("e_back", "body", "loop", None),
            edge("e_exit", "loop", "end", Some("exit")),
        ],
    )
}

/// `start -> transform -> approval -> transform -> end`.
pub fn approval_graph() -> Value {
    graph(
        vec![
            start_with("item"),
            node("draft", "transform", json!({"script": "\"draft of \" + input.item"})),
            node(
                "approve",
                "user-approval",
                json!({"prompt": "Publish {{lastOutput}}?"}),
            ),
            node("publish", "transform", json!({"script": "\"published \" + lastOutput"})),
            node("end", "end", json!({})),
        ],
        vec![
            edge("e1", "start", "draft", None),
            edge("e2", "draft", "approve", None),
            edge("e3", "approve", "publish", None),
            edge("e4", "publish", "end", None),
        ],
    )
}
