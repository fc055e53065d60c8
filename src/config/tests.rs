use std::time::Duration;

use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("info".to_string());
    raw.cache.debounce_window_ms = Some(500);

    let overrides = GlobalOverrides {
        log_level: Some("debug".to_string()),
        cache_debounce_window_ms: Some(750),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.cache.debounce_window_ms, 750);
}

#[test]
fn cache_defaults_match_cache_config() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    assert_eq!(settings.cache_config(), CacheConfig::default());
}

#[test]
fn cache_settings_flow_into_cache_config() {
    let mut raw = RawSettings::default();
    raw.cache.namespace = Some("shop:".to_string());
    raw.cache.flush_backoff_secs = Some(vec![1, 2]);
    raw.cache.tagged_store = Some(false);

    let config = Settings::from_raw(raw).expect("valid settings").cache_config();

    assert_eq!(config.namespace, "shop:");
    assert!(!config.tagged_store);
    assert_eq!(
        config.flush_backoff(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
}

#[test]
fn zero_debounce_window_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.debounce_window_ms = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero window");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.debounce_window_ms",
            ..
        }
    ));
}

#[test]
fn empty_backoff_schedule_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.flush_backoff_secs = Some(Vec::new());

    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn database_pool_must_be_positive() {
    let mut raw = RawSettings::default();
    raw.database.max_connections = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero pool");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "database.max_connections",
            ..
        }
    ));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = GlobalOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn parse_warm_cache_arguments() {
    let args = CliArgs::parse_from([
        "canopy",
        "warm-cache",
        "--active-only",
        "--dry-run",
        "--database-url",
        "postgres://example",
    ]);

    assert_eq!(
        args.overrides.database_url.as_deref(),
        Some("postgres://example")
    );
    match args.command {
        Command::WarmCache(warm) => {
            assert!(warm.active_only);
            assert!(warm.dry_run);
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_breadcrumbs_arguments() {
    let args = CliArgs::parse_from(["canopy", "breadcrumbs", "42", "--cache-enabled", "false"]);

    assert_eq!(args.overrides.cache_enabled, Some(false));
    assert!(matches!(
        args.command,
        Command::Breadcrumbs(BreadcrumbsArgs { id: 42 })
    ));
}
