use std::io::Write;

use stepwise_core::config::{AppConfig, McpTransport};
use stepwise_core::error::StepwiseError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
script_timeout_ms = 2000
loop_ceiling = 20
max_steps = 500
max_tool_rounds = 4
invoker_timeout_secs = 30

[model]
provider = "anthropic"
model_id = "claude-sonnet-4-20250514"
api_key = "sk-test-key"
max_tokens = 4096
temperature = 0.5

[model.retry]
max_retries = 5

[[fallback_models]]
provider = "openai"
model_id = "gpt-4o-mini"

[gateway]
bind = "0.0.0.0:9999"

[store]
path = "/tmp/stepwise-runs.db"

[mcp.servers.web-search]
auto_connect = true

[mcp.servers.web-search.transport]
type = "stdio"
command = "npx"
args = ["-y", "web-search-mcp"]
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.script_timeout_ms, 2000);
    assert_eq!(config.engine.loop_ceiling, 20);
    assert_eq!(config.engine.max_steps, 500);
    assert_eq!(config.engine.max_tool_rounds, 4);
    assert_eq!(config.engine.invoker_timeout_secs, 30);
    assert_eq!(config.model.provider, "anthropic");
    assert_eq!(config.model.api_key, Some("sk-test-key".to_string()));

    let retry = config.model.retry.expect("retry present");
    assert_eq!(retry.max_retries, 5);
    assert_eq!(retry.initial_backoff_ms, 1000);

    assert_eq!(config.fallback_models.len(), 1);
    assert_eq!(config.fallback_models[0].model_id, "gpt-4o-mini");

    let gw = config.gateway.expect("gateway present");
    assert_eq!(gw.bind, "0.0.0.0:9999");

    let store = config.store.expect("store present");
    assert_eq!(
        store.resolved_path(),
        std::path::PathBuf::from("/tmp/stepwise-runs.db")
    );

    let mcp = config.mcp.expect("mcp present");
    match &mcp.servers["web-search"].transport {
        McpTransport::Stdio { command, args, .. } => {
            assert_eq!(command, "npx");
            assert_eq!(args.len(), 2);
        }
        other => panic!("unexpected transport {other:?}"),
    }
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("STEPWISE_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[model]
model_id = "test-model"
api_key = "${STEPWISE_TEST_API_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.model.api_key, Some("expanded-key-value".to_string()));

    std::env::remove_var("STEPWISE_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[model]
model_id = "llama3.2"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.script_timeout_ms, 5000);
    assert_eq!(config.engine.loop_ceiling, 100);
    assert_eq!(config.engine.event_buffer, 256);
    assert_eq!(config.model.max_tokens, 4096);
    assert!(config.fallback_models.is_empty());
    assert!(config.gateway.is_none());
    assert!(config.mcp.is_none());
    assert!(config.store.is_none());
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let err = AppConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, StepwiseError::ConfigNotFound(_)));
}

#[test]
fn test_model_section_is_required() {
    let err = AppConfig::parse("[engine]\nloop_ceiling = 5\n").unwrap_err();
    assert!(matches!(err, StepwiseError::Config(_)));
}
