use std::io::Write;

use weaver_core::config::EngineConfig;
use weaver_core::error::WeaverError;
use weaver_core::step::{FailurePolicy, VariableMerge};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
continue_on_error = true
run_timeout_ms = 60000
max_loop_iterations = 50

[handles]
default_timeout_ms = 120000
sweep_interval_ms = 250
retention_ms = 5000
poll_interval_ms = 20

[parallel]
failure_policy = "collect_all"
variable_merge = "exclusive"

[sampling]
model = "llama3.2"
temperature = 0.3
max_tokens = 1024

[sampling.retry]
max_retries = 4
initial_backoff_ms = 200
max_backoff_ms = 2000

[team]
max_rounds = 5
consensus_marker = "AGREED"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = EngineConfig::load(tmp.path()).expect("load config");

    assert!(config.engine.continue_on_error);
    assert_eq!(config.engine.run_timeout_ms, 60_000);
    assert_eq!(config.engine.max_loop_iterations, 50);

    assert_eq!(config.handles.default_timeout_ms, 120_000);
    assert_eq!(config.handles.sweep_interval_ms, 250);
    assert_eq!(config.handles.retention_ms, 5_000);
    assert_eq!(config.handles.poll_interval_ms, 20);

    assert_eq!(config.parallel.failure_policy, FailurePolicy::CollectAll);
    assert_eq!(config.parallel.variable_merge, VariableMerge::Exclusive);

    assert_eq!(config.sampling.model.as_deref(), Some("llama3.2"));
    assert_eq!(config.sampling.max_tokens, 1024);
    let retry = config.sampling.retry.expect("retry present");
    assert_eq!(retry.max_retries, 4);
    assert_eq!(retry.max_backoff_ms, 2000);

    assert_eq!(config.team.max_rounds, 5);
    assert_eq!(config.team.consensus_marker, "AGREED");
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("WEAVER_TEST_MODEL", "expanded-model");

    let toml_content = r#"
[sampling]
model = "${WEAVER_TEST_MODEL}"
"#;

    let tmp = weaver_test_utils::config_file(toml_content);
    let config = EngineConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.sampling.model.as_deref(), Some("expanded-model"));

    std::env::remove_var("WEAVER_TEST_MODEL");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[engine]
continue_on_error = false
"#;

    let tmp = weaver_test_utils::config_file(toml_content);
    let config = EngineConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.run_timeout_ms, 300_000);
    assert_eq!(config.engine.max_loop_iterations, 1_000);
    assert_eq!(config.handles.default_timeout_ms, 300_000);
    assert_eq!(config.handles.retention_ms, 600_000);
    assert_eq!(config.parallel.failure_policy, FailurePolicy::FailFast);
    assert_eq!(config.parallel.variable_merge, VariableMerge::LastWriterWins);
    assert!(config.sampling.model.is_none());
    assert!(config.sampling.retry.is_none());
    assert_eq!(config.team.max_rounds, 3);
}

#[test]
fn test_missing_file_is_config_not_found() {
    let err = EngineConfig::load(std::path::Path::new("/nonexistent/weaver.toml")).unwrap_err();
    assert!(matches!(err, WeaverError::ConfigNotFound(_)));
}

#[test]
fn test_bad_value_is_config_error() {
    let tmp = weaver_test_utils::config_file("[parallel]\nfailure_policy = \"whenever\"\n");
    let err = EngineConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, WeaverError::Config(_)), "{err}");
}
