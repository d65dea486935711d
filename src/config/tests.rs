use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.simulate.observers = Some(4);
    raw.logging.level = Some("info".to_string());

    let overrides = SimulateOverrides {
        observers: Some(16),
        logging: LoggingOverrides {
            log_level: Some("debug".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };

    raw.apply_simulate_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.simulate.observers.get(), 16);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn defaults_are_applied() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(
        settings.cache.failure_backoff_base,
        Duration::from_millis(DEFAULT_FAILURE_BACKOFF_BASE_MS)
    );
    assert_eq!(
        settings.cache.failure_backoff_max,
        Duration::from_millis(DEFAULT_FAILURE_BACKOFF_MAX_MS)
    );
    assert_eq!(settings.simulate.keys, vec!["/a", "/b", "/c"]);
    assert!(settings.simulate.failure_every.is_none());
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn backoff_can_be_disabled_via_cli() {
    let mut raw = RawSettings::default();
    let overrides = SimulateOverrides {
        cache: CacheOverrides {
            failure_backoff_base_ms: Some(0),
            ..Default::default()
        },
        ..Default::default()
    };

    raw.apply_simulate_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.failure_backoff_base, Duration::ZERO);
}

#[test]
fn backoff_max_below_base_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.failure_backoff_base_ms = Some(5_000);
    raw.cache.failure_backoff_max_ms = Some(1_000);

    let err = Settings::from_raw(raw).expect_err("invalid backoff");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.failure_backoff_max_ms",
            ..
        }
    ));
}

#[test]
fn zero_observers_is_rejected() {
    let mut raw = RawSettings::default();
    raw.simulate.observers = Some(0);

    let err = Settings::from_raw(raw).expect_err("invalid observers");
    assert!(err.to_string().contains("simulate.observers"));
}

#[test]
fn blank_keys_are_rejected() {
    let mut raw = RawSettings::default();
    raw.simulate.keys = Some(vec!["  ".to_string()]);

    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn invalid_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("chatty".to_string());

    let err = Settings::from_raw(raw).expect_err("invalid level");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "logging.level",
            ..
        }
    ));
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = SimulateOverrides {
        logging: LoggingOverrides {
            log_json: Some(true),
            ..Default::default()
        },
        ..Default::default()
    };

    raw.apply_simulate_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn default_to_simulate_command() {
    let args = CliArgs::parse_from(["stampede"]);
    let command = args
        .command
        .unwrap_or(Command::Simulate(Box::<SimulateArgs>::default()));
    assert!(matches!(command, Command::Simulate(_)));
}

#[test]
fn parse_simulate_overrides() {
    let args = CliArgs::parse_from([
        "stampede",
        "simulate",
        "--observers",
        "32",
        "--key",
        "/x",
        "--key",
        "/y",
        "--failure-every",
        "3",
        "--failure-backoff-base-ms",
        "0",
        "--log-json",
        "true",
    ]);

    match args.command.expect("simulate command") {
        Command::Simulate(simulate) => {
            let overrides = simulate.overrides;
            assert_eq!(overrides.observers, Some(32));
            assert_eq!(overrides.keys, vec!["/x", "/y"]);
            assert_eq!(overrides.failure_every, Some(3));
            assert_eq!(overrides.cache.failure_backoff_base_ms, Some(0));
            assert_eq!(overrides.logging.log_json, Some(true));
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_capture_arguments() {
    let args = CliArgs::parse_from(["stampede", "capture", "--pretty", "/home", "/about"]);

    match args.command.expect("capture command") {
        Command::Capture(capture) => {
            assert!(capture.pretty);
            assert_eq!(capture.keys, vec!["/home", "/about"]);
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn capture_keys_override_configured_keys() {
    let mut raw = RawSettings::default();
    raw.simulate.keys = Some(vec!["/configured".to_string()]);

    raw.apply_capture_overrides(&CaptureArgs {
        keys: vec!["/cli".to_string()],
        ..Default::default()
    });
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.simulate.keys, vec!["/cli"]);
}

#[test]
#[serial_test::serial]
fn environment_overrides_config_files() {
    // SAFETY: serialized with every other test that touches the process environment.
    unsafe {
        std::env::set_var("STAMPEDE__CACHE__FAILURE_BACKOFF_BASE_MS", "250");
        std::env::set_var("STAMPEDE__SIMULATE__KEYS", "/x,/y");
    }

    let loaded = load(&CliArgs::default());

    unsafe {
        std::env::remove_var("STAMPEDE__CACHE__FAILURE_BACKOFF_BASE_MS");
        std::env::remove_var("STAMPEDE__SIMULATE__KEYS");
    }

    let settings = loaded.expect("environment settings load");
    assert_eq!(
        settings.cache.failure_backoff_base,
        Duration::from_millis(250)
    );
    assert_eq!(settings.simulate.keys, vec!["/x", "/y"]);
}

#[test]
#[serial_test::serial]
fn explicit_config_file_must_exist() {
    let cli = CliArgs {
        config_file: Some(std::path::PathBuf::from("does/not/exist.toml")),
        ..Default::default()
    };

    assert!(matches!(load(&cli), Err(LoadError::Build(_))));
}
