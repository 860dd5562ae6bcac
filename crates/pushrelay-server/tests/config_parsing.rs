use std::{env, fs};

use pushrelay_notifications::queue::{FlushTimeout, FlushTimeoutSetting};
use pushrelay_server::config::loader::load_config;

#[test]
fn config_parsing_and_env_overrides_and_validation() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("pushrelay.toml");

    let toml_content = r#"
proxy = "http://proxy.internal:3128"

[server]
host = "127.0.0.1"
port = 8081
body_limit_bytes = 4096

[logging]
level = "debug"

[queue]
flush_timeout_ms = "random"
flush_timeout_min = 5
flush_timeout_max = 10
max_size = 1000

[apns]
enabled = true
mock = true
default_topic = "org.wikimedia.app"

[fcm]
enabled = true
project_id = "wikipedia-app"
access_token = "ya29.test"

[companion]
enabled = true
endpoint = "https://meta.wikimedia.org/w/api.php"
username = "SubscriptionManager"
password = "secret"
"#;
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses
    let cfg = load_config(path.to_str()).expect("should parse config");
    assert_eq!(cfg.server.port, 8081);
    assert_eq!(cfg.logging.level, "debug");
    assert_eq!(
        cfg.queue.flush_timeout_ms,
        Some(FlushTimeoutSetting::Keyword("random".into()))
    );
    let policy = cfg.queue_policy().expect("queue policy");
    assert_eq!(policy.flush_timeout, FlushTimeout::Random { min: 5, max: 10 });
    assert_eq!(policy.max_size, 1000);
    assert_eq!(policy.max_recipients, 500);
    assert!(cfg.apns.mock);
    assert_eq!(cfg.fcm.project_id.as_deref(), Some("wikipedia-app"));
    assert_eq!(cfg.companion.username.as_deref(), Some("SubscriptionManager"));
    assert_eq!(cfg.proxy.as_deref(), Some("http://proxy.internal:3128"));

    // 2) Env override should win over file
    unsafe {
        env::set_var("PUSHRELAY__SERVER__PORT", "9090");
    }
    let cfg_env = load_config(path.to_str()).expect("should parse config with env overrides");
    assert_eq!(cfg_env.server.port, 9090);
    unsafe {
        env::remove_var("PUSHRELAY__SERVER__PORT");
    }

    // 3) Random flush timeout without bounds is fatal
    let invalid_path = dir.path().join("invalid.toml");
    let invalid_toml = r#"
[queue]
flush_timeout_ms = "random"
flush_timeout_min = 5
"#;
    fs::write(&invalid_path, invalid_toml).expect("write invalid toml");
    let err = load_config(invalid_path.to_str()).expect_err("expected validation error");
    assert!(err.contains("flush_timeout_max"));
}

#[test]
fn queue_rejects_unknown_flush_keyword_and_negative_sizes() {
    let dir = tempfile::tempdir().expect("tmp dir");

    let keyword = dir.path().join("keyword.toml");
    fs::write(&keyword, "[queue]\nflush_timeout_ms = \"sometimes\"\n").expect("write toml");
    let err = load_config(keyword.to_str()).expect_err("expected validation error");
    assert!(err.contains("sometimes"));

    let negative = dir.path().join("negative.toml");
    fs::write(&negative, "[queue]\nmax_size = -1\n").expect("write toml");
    let err = load_config(negative.to_str()).expect_err("expected validation error");
    assert!(err.contains("max_size"));
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("absent.toml");

    let cfg = load_config(path.to_str()).expect("defaults are valid");
    assert_eq!(cfg.queue_policy().unwrap().max_recipients, 500);
    assert!(!cfg.companion.enabled);
}
