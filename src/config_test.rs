use super::*;

const ALL_VARS: &[&str] = &[
    "DATABASE_URL",
    "PORT",
    "DB_MAX_CONNECTIONS",
    "REDIS_URL",
    "BACKBONE_TOPIC",
    "BACKBONE_CONNECT_TIMEOUT_MS",
    "HUB_COMMAND_CAPACITY",
    "BACKBONE_PUBLISH_CAPACITY",
    "BACKBONE_PUBLISH_TIMEOUT_MS",
    "WS_OUTBOUND_CAPACITY",
    "WS_PING_INTERVAL_SECS",
    "WS_PONG_WAIT_SECS",
    "WS_WRITE_TIMEOUT_SECS",
    "WS_MAX_MESSAGE_BYTES",
];

/// # Safety
/// Tests must run with `--test-threads=1` to avoid env races.
unsafe fn clear_env() {
    for var in ALL_VARS {
        unsafe { std::env::remove_var(var) };
    }
}

// All env-mutating assertions share one test so parallel runs never race.
#[test]
fn from_env_defaults_overrides_and_errors() {
    unsafe { clear_env() };
    let err = Config::from_env().unwrap_err();
    assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));

    unsafe { std::env::set_var("DATABASE_URL", "postgres://localhost/retro") };
    let cfg = Config::from_env().unwrap();
    assert_eq!(cfg.port, DEFAULT_PORT);
    assert_eq!(cfg.db_max_connections, DEFAULT_DB_MAX_CONNECTIONS);
    assert_eq!(cfg.backbone.url, None);
    assert_eq!(cfg.backbone.topic, DEFAULT_BACKBONE_TOPIC);
    assert_eq!(cfg.hub, HubConfig::default());
    assert_eq!(cfg.connection, ConnectionConfig::default());

    unsafe {
        std::env::set_var("PORT", "9001");
        std::env::set_var("REDIS_URL", "redis://127.0.0.1:6379");
        std::env::set_var("BACKBONE_TOPIC", "custom");
        std::env::set_var("BACKBONE_CONNECT_TIMEOUT_MS", "250");
        std::env::set_var("WS_OUTBOUND_CAPACITY", "4");
        std::env::set_var("WS_PONG_WAIT_SECS", "10");
        std::env::set_var("WS_PING_INTERVAL_SECS", "60");
        std::env::set_var("HUB_COMMAND_CAPACITY", "not-a-number");
        std::env::set_var("BACKBONE_PUBLISH_TIMEOUT_MS", "300");
    }
    let cfg = Config::from_env().unwrap();
    assert_eq!(cfg.port, 9001);
    assert_eq!(cfg.backbone.url.as_deref(), Some("redis://127.0.0.1:6379"));
    assert_eq!(cfg.backbone.topic, "custom");
    assert_eq!(cfg.backbone.connect_timeout, Duration::from_millis(250));
    assert_eq!(cfg.connection.outbound_capacity, 4);
    assert_eq!(cfg.connection.pong_wait, Duration::from_secs(10));
    assert_eq!(cfg.connection.ping_interval, Duration::from_secs(9));
    assert_eq!(cfg.hub.command_capacity, DEFAULT_HUB_COMMAND_CAPACITY);
    assert_eq!(cfg.hub.publish_timeout, Duration::from_millis(300));

    unsafe { std::env::set_var("REDIS_URL", "  ") };
    let cfg = Config::from_env().unwrap();
    assert_eq!(cfg.backbone.url, None);

    unsafe { clear_env() };
}

#[test]
fn normalized_keeps_valid_ping_interval() {
    let cfg = ConnectionConfig {
        ping_interval: Duration::from_secs(5),
        pong_wait: Duration::from_secs(30),
        ..ConnectionConfig::default()
    }
    .normalized();
    assert_eq!(cfg.ping_interval, Duration::from_secs(5));
}

#[test]
fn normalized_replaces_zero_ping_interval() {
    let cfg = ConnectionConfig {
        ping_interval: Duration::ZERO,
        pong_wait: Duration::from_secs(20),
        ..ConnectionConfig::default()
    }
    .normalized();
    assert_eq!(cfg.ping_interval, Duration::from_secs(18));
}

#[test]
fn default_ping_interval_is_inside_pong_wait() {
    let cfg = ConnectionConfig::default();
    assert!(cfg.ping_interval < cfg.pong_wait);
    assert_eq!(cfg.normalized(), cfg);
}
