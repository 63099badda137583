//! Coverage for config parsing, validation and kernel config derivation.

use std::io::Write;
use std::time::Duration;

use warden::capabilities::CapabilityModule;
use warden::config::{
    config_dir, load_config, ConfigError, ModuleSpec, QuotaConfig, WardenConfig,
};
use warden::engine::MAX_CALL_DEPTH;

const FULL: &str = r#"
[kernel]
output_capacity = 128
call_timeout_ms = 2500
cancel_grace_ms = 300
max_call_depth = 16

[quota]
storage_bytes = 1048576
timer_slots = 4
rpc_slots = 2

[link]
request_timeout_ms = 750
buffer = 8

[database]
path = "/var/lib/warden/vms.db"

[[modules]]
kind = "console"

[[modules]]
kind = "timers"
max_sleep_ms = 250

[[modules]]
kind = "filesystem"
root = "/srv/guest"
quota_bytes = 4096
read_only = true

[[modules]]
kind = "host_rpc"
methods = ["status", "metrics"]
timeout_ms = 100

[[modules]]
kind = "crypto"
"#;

#[test]
fn default_quota_values() {
    let quota = QuotaConfig::default();
    assert_eq!(quota.storage_bytes, 67_108_864);
    assert_eq!(quota.timer_slots, 64);
    assert_eq!(quota.rpc_slots, 64);
}

#[test]
fn empty_file_is_a_valid_default() {
    let config: WardenConfig = toml::from_str("").expect("should parse");
    assert!(config.modules.is_empty());
    assert!(config.database.path.is_none());
    assert!(config.logging.dir.is_none());
    assert_eq!(config.link.request_timeout_ms, 10_000);
    assert!(config.validate().is_ok());
}

#[test]
fn full_file_parses_every_section() {
    let config: WardenConfig = toml::from_str(FULL).expect("should parse");
    assert!(config.validate().is_ok());
    assert_eq!(config.quota.timer_slots, 4);
    assert_eq!(config.link.buffer, 8);
    assert_eq!(config.link_timeout(), Duration::from_millis(750));

    let names: Vec<&str> = config.modules.iter().map(ModuleSpec::name).collect();
    assert_eq!(names, vec!["console", "timers", "filesystem", "host_rpc", "crypto"]);
    match &config.modules[2] {
        ModuleSpec::Filesystem(opts) => {
            assert!(opts.read_only);
            assert_eq!(opts.quota_bytes, 4096);
        }
        other => panic!("expected filesystem, got {other:?}"),
    }
}

#[test]
fn kernel_config_carries_limits_and_module_order() {
    let config: WardenConfig = toml::from_str(FULL).expect("should parse");
    let kernel = config.kernel_config();
    assert_eq!(kernel.output_capacity, 128);
    assert_eq!(kernel.call_timeout, Some(Duration::from_millis(2500)));
    assert_eq!(kernel.cancel_grace, Duration::from_millis(300));
    assert_eq!(kernel.max_call_depth, 16);

    let names: Vec<&str> = kernel.modules.iter().map(CapabilityModule::name).collect();
    assert_eq!(names, vec!["console", "timers", "filesystem", "host_rpc", "crypto"]);
}

#[test]
fn unknown_module_kind_is_a_parse_error() {
    let result: Result<WardenConfig, _> = toml::from_str(
        r#"
[[modules]]
kind = "network"
"#,
    );
    assert!(result.is_err());
}

#[test]
fn filesystem_quota_above_global_storage_is_rejected() {
    let config: WardenConfig = toml::from_str(
        r#"
[quota]
storage_bytes = 100

[[modules]]
kind = "filesystem"
root = "/srv/guest"
quota_bytes = 200
"#,
    )
    .expect("should parse");
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidModule {
            index: 0,
            module: "filesystem",
            ..
        })
    ));
}

#[test]
fn blank_rpc_method_is_rejected() {
    let config: WardenConfig = toml::from_str(
        r#"
[[modules]]
kind = "console"

[[modules]]
kind = "host_rpc"
methods = ["status", "  "]
"#,
    )
    .expect("should parse");
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidModule { index: 1, .. })
    ));
}

#[test]
fn zero_call_depth_is_rejected() {
    let mut config = WardenConfig::default();
    config.kernel.max_call_depth = 0;
    assert_eq!(config.validate(), Err(ConfigError::ZeroCallDepth));
}

#[test]
fn load_config_reads_and_validates_files() {
    let mut good = tempfile::NamedTempFile::new().expect("temp file");
    good.write_all(FULL.as_bytes()).expect("write");
    let config = load_config(good.path()).expect("valid file loads");
    assert_eq!(config.modules.len(), 5);

    let mut bad = tempfile::NamedTempFile::new().expect("temp file");
    bad.write_all(b"[kernel]\noutput_capacity = 0\n").expect("write");
    let err = load_config(bad.path()).expect_err("invalid file");
    assert!(err.to_string().contains("output_capacity"));

    assert!(load_config(std::path::Path::new("/nonexistent/warden.toml")).is_err());
}

#[test]
fn config_dir_resolves() {
    let path = config_dir().expect("home directory is known");
    assert!(path.ends_with(".warden"));
}

#[test]
fn call_depth_above_the_stack_limit_is_rejected() {
    let mut config = WardenConfig::default();
    config.kernel.max_call_depth = MAX_CALL_DEPTH;
    assert!(config.validate().is_ok());

    config.kernel.max_call_depth = 5_000;
    assert_eq!(
        config.validate(),
        Err(ConfigError::CallDepthTooLarge {
            depth: 5_000,
            limit: MAX_CALL_DEPTH,
        })
    );
}
