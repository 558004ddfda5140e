use std::sync::Mutex;
use std::time::Duration;

use secrecy::ExposeSecret;
use studio_relay::config::{Config, TierTable};

// Tests in this file mutate process environment; run them one at a time.
static ENV: Mutex<()> = Mutex::new(());

const VARS: &[&str] = &[
    "BROKER_URL",
    "RELAY_BIND_ADDR",
    "RELAY_HEARTBEAT_SECS",
    "RELAY_OUTBOUND_BUFFER",
    "RELAY_TIERS_FILE",
    "RELAY_TASK_RETENTION_SECS",
];

fn clear_env() {
    for var in VARS {
        unsafe { std::env::remove_var(var) };
    }
}

#[test]
fn config_from_env_loads_required_fields() {
    let _env = ENV.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    unsafe {
        std::env::set_var("BROKER_URL", "redis://:secret@localhost:6379/0");
        std::env::set_var("RELAY_HEARTBEAT_SECS", "15");
    }

    let config = Config::from_env().unwrap();
    assert_eq!(
        config.broker_url.expose_secret(),
        "redis://:secret@localhost:6379/0"
    );
    assert_eq!(config.bind_addr.to_string(), "127.0.0.1:8080");
    assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
    assert_eq!(config.outbound_buffer, 256);
    assert!(!config.log_level.is_empty());
    assert!(!format!("{config:?}").contains("secret@"));

    clear_env();
}

#[test]
fn config_from_env_fails_without_broker_url() {
    let _env = ENV.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    assert!(Config::from_env().is_err());
}

#[test]
fn config_rejects_malformed_values() {
    let _env = ENV.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();
    unsafe {
        std::env::set_var("BROKER_URL", "memory://");
        std::env::set_var("RELAY_OUTBOUND_BUFFER", "0");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::set_var("RELAY_OUTBOUND_BUFFER", "64");
        std::env::set_var("RELAY_BIND_ADDR", "not-an-address");
    }
    assert!(Config::from_env().is_err());

    clear_env();
}

#[test]
fn tier_file_is_loaded_through_config() {
    let _env = ENV.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let path = std::env::temp_dir().join(format!("tiers-{}.toml", uuid::Uuid::new_v4()));
    std::fs::write(
        &path,
        r#"
default = "draft"

[tiers.draft]
max_vram_gb = 4
timeout_secs = 30
steps = 4

[tiers.final]
max_vram_gb = 24
timeout_secs = 900
steps = 50
optimizations = ["hires_fix"]
"#,
    )
    .unwrap();

    unsafe {
        std::env::set_var("BROKER_URL", "memory://");
        std::env::set_var("RELAY_TIERS_FILE", &path);
    }
    let tiers = Config::from_env().unwrap().load_tiers().unwrap();
    assert_eq!(tiers.default_tier(), "draft");
    assert_eq!(tiers.resolve(Some("premium")).name, "draft");
    assert_eq!(tiers.get("FINAL").unwrap().steps, 50);

    std::fs::remove_file(&path).ok();
    clear_env();
}

#[test]
fn builtin_tiers_without_file() {
    let tiers = TierTable::builtin();
    let resolved = tiers.resolve(Some("High"));
    assert_eq!(resolved.name, "high");
    assert!(!resolved.fell_back);
    assert_eq!(resolved.profile.max_vram_gb, 16);
}
