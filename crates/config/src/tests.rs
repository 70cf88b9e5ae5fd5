use super::*;
use execbandit_core_types::{GateStrictness, PolicyFamily, TipPercentile};
use std::ffi::OsString;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

static ENV_LOCK: Mutex<()> = Mutex::new(());
static TEMP_CONFIG_COUNTER: AtomicU64 = AtomicU64::new(0);

#[test]
fn bandit_defaults_are_applied() {
    let bandit = BanditConfig::default();
    assert_eq!(bandit.feature_dim, 7);
    assert!((bandit.epsilon_floor - 0.02).abs() <= f64::EPSILON);
    assert_eq!(bandit.arms.len(), 4);
    assert_eq!(bandit.arms[0].id, "aggressive-entry");
    assert_eq!(bandit.arms[2].bundle.gate, GateStrictness::Strict);
    assert_eq!(bandit.arms[3].bundle.tip_percentile, TipPercentile::P90);

    let pending = PendingConfig::default();
    assert_eq!(pending.expiry_ms, 1_800_000);
    assert_eq!(pending.instrument_match_jitter_ms, 5_000);
}

#[test]
fn empty_file_loads_valid_defaults() {
    with_temp_config_file("", |config_path| {
        with_clean_env(|| {
            let (cfg, loaded) = load_from_env_or_default(config_path).expect("load defaults");
            assert_eq!(loaded.as_path(), config_path);
            assert_eq!(cfg.reward.family, PolicyFamily::Fee);
            assert_eq!(cfg.ope.sample_min, 200);
            assert!(validate_app_config(&cfg).is_ok());
        });
    });
}

#[test]
fn toml_arm_catalog_is_parsed() {
    let contents = r#"
[bandit]
feature_dim = 3
epsilon_floor = 0.1

[[bandit.arms]]
id = "tight"
label = "Tight"
gate = "strict"
slippage_bps = 80
tip_percentile = "p25"
size_multiplier = 0.5

[[bandit.arms]]
id = "wide"
gate = "loose"
slippage_bps = 900
tip_percentile = "p90"
size_multiplier = 1.0

[reward]
family = "sizing"
"#;
    with_temp_config_file(contents, |config_path| {
        with_clean_env(|| {
            let (cfg, _) = load_from_env_or_default(config_path).expect("load toml arms");
            assert_eq!(cfg.bandit.feature_dim, 3);
            assert_eq!(cfg.bandit.arms.len(), 2);
            assert_eq!(cfg.bandit.arms[0].label, "Tight");
            assert_eq!(cfg.bandit.arms[1].label, "");
            assert_eq!(cfg.bandit.arms[1].bundle.slippage_bps, 900);
            assert_eq!(cfg.reward.family, PolicyFamily::Sizing);
        });
    });
}

#[test]
fn load_from_env_applies_bandit_and_ope_overrides() {
    with_temp_config_file("", |config_path| {
        with_clean_env(|| {
            with_env_var("EXECBANDIT_BANDIT_EPSILON_FLOOR", "0.1", || {
                with_env_var("EXECBANDIT_OPE_SAMPLE_MIN", "42", || {
                    with_env_var("EXECBANDIT_PENDING_INSTRUMENT_MATCH_JITTER_MS", "50000", || {
                        with_env_var("EXECBANDIT_REWARD_FAMILY", "SIZING", || {
                            let (cfg, _) = load_from_env_or_default(config_path)
                                .expect("load config with env overrides");
                            assert!((cfg.bandit.epsilon_floor - 0.1).abs() <= f64::EPSILON);
                            assert_eq!(cfg.ope.sample_min, 42);
                            assert_eq!(cfg.pending.instrument_match_jitter_ms, 50_000);
                            assert_eq!(cfg.reward.family, PolicyFamily::Sizing);
                        });
                    });
                });
            });
        });
    });
}

#[test]
fn load_from_env_parses_arm_catalog() {
    with_temp_config_file("", |config_path| {
        with_clean_env(|| {
            with_env_var(
                "EXECBANDIT_BANDIT_ARMS",
                "fast:loose:700:p75:0.7, Slow:STRICT:100:p25:0.5",
                || {
                    let (cfg, _) =
                        load_from_env_or_default(config_path).expect("load arms from env");
                    assert_eq!(cfg.bandit.arms.len(), 2);
                    assert_eq!(cfg.bandit.arms[1].id, "slow");
                    assert_eq!(cfg.bandit.arms[1].bundle.gate, GateStrictness::Strict);
                },
            );
        });
    });
}

#[test]
fn load_from_env_rejects_duplicate_normalized_arm_ids() {
    assert_env_rejected_contains(
        "EXECBANDIT_BANDIT_ARMS",
        "fast:loose:700:p75:0.7,FAST:strict:100:p25:0.5",
        "duplicate arm after normalization",
    );
}

#[test]
fn load_from_env_rejects_malformed_arm_token() {
    assert_env_rejected_contains(
        "EXECBANDIT_BANDIT_ARMS",
        "fast:loose:700",
        "malformed token",
    );
}

#[test]
fn load_from_env_rejects_invalid_arm_numeric_value() {
    assert_env_rejected_contains(
        "EXECBANDIT_BANDIT_ARMS",
        "fast:loose:wide:p75:0.7",
        "invalid numeric value",
    );
}

#[test]
fn load_from_env_rejects_unknown_reward_family() {
    assert_env_rejected_contains("EXECBANDIT_REWARD_FAMILY", "pnl", "must be fee or sizing");
}

#[test]
fn validation_rejects_zero_epsilon_floor() {
    let mut cfg = AppConfig::default();
    cfg.bandit.epsilon_floor = 0.0;
    let err = validate_app_config(&cfg)
        .expect_err("zero epsilon must fail")
        .to_string();
    assert!(err.contains("bandit.epsilon_floor"), "unexpected error: {err}");
}

#[test]
fn validation_rejects_duplicate_toml_arms() {
    let mut cfg = AppConfig::default();
    let duplicate = cfg.bandit.arms[0].clone();
    cfg.bandit.arms.push(duplicate);
    let err = validate_app_config(&cfg)
        .expect_err("duplicate arm must fail")
        .to_string();
    assert!(err.contains("duplicate arm"), "unexpected error: {err}");
}

#[test]
fn validation_rejects_out_of_range_quantile_and_zero_dim() {
    let mut cfg = AppConfig::default();
    cfg.segments.regime_quantile = 1.0;
    assert!(validate_app_config(&cfg).is_err());

    let mut cfg = AppConfig::default();
    cfg.bandit.feature_dim = 0;
    assert!(validate_app_config(&cfg).is_err());
}

#[test]
fn shipped_dev_config_is_valid_and_matches_default_catalog() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../configs/dev.toml");
    let cfg = load_from_path(&path).expect("dev config must parse");
    validate_app_config(&cfg).expect("dev config must validate");
    assert_eq!(cfg.bandit.arms, AppConfig::default().bandit.arms);
    assert_eq!(cfg.ope.schedule_seconds, 3_600);
}

#[test]
fn validation_bounds_time_windows() {
    let mut cfg = AppConfig::default();
    cfg.pending.expiry_ms = PENDING_WINDOW_MS_MAX + 1;
    let err = validate_app_config(&cfg)
        .expect_err("oversized expiry must fail")
        .to_string();
    assert!(err.contains("pending.expiry_ms"), "unexpected error: {err}");

    let mut cfg = AppConfig::default();
    cfg.ope.schedule_lookback_hours = 0;
    assert!(validate_app_config(&cfg).is_err());

    let mut cfg = AppConfig::default();
    cfg.segments.migration_match_tolerance_ms = u64::MAX;
    let err = validate_app_config(&cfg)
        .expect_err("oversized tolerance must fail")
        .to_string();
    assert!(
        err.contains("segments.migration_match_tolerance_ms"),
        "unexpected error: {err}"
    );
}

fn assert_env_rejected_contains(env_name: &'static str, env_value: &str, needle: &str) {
    with_temp_config_file("", |config_path| {
        with_clean_env(|| {
            with_env_var(env_name, env_value, || {
                let err = load_from_env_or_default(config_path)
                    .expect_err("invalid env override should fail")
                    .to_string();
                assert!(
                    err.contains(env_name),
                    "error should mention env var, got: {err}"
                );
                assert!(
                    err.contains(needle),
                    "error should contain '{needle}', got: {err}"
                );
            });
        });
    });
}

fn with_env_var<T>(key: &'static str, value: &str, run: impl FnOnce() -> T) -> T {
    let previous = std::env::var_os(key);
    std::env::set_var(key, value);
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(run));
    restore_env_var(key, previous);
    match outcome {
        Ok(value) => value,
        Err(payload) => std::panic::resume_unwind(payload),
    }
}

fn restore_env_var(key: &'static str, previous: Option<OsString>) {
    match previous {
        Some(value) => std::env::set_var(key, value),
        None => std::env::remove_var(key),
    }
}

fn with_clean_env<T>(run: impl FnOnce() -> T) -> T {
    // Serialize all EXECBANDIT_* env mutations in this test module.
    let _guard = ENV_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let saved: Vec<(OsString, OsString)> = std::env::vars_os()
        .filter(|(key, _)| key.to_string_lossy().starts_with(ENV_PREFIX))
        .collect();
    for (key, _) in &saved {
        std::env::remove_var(key);
    }
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(run));
    for (key, value) in saved {
        std::env::set_var(key, value);
    }
    match outcome {
        Ok(value) => value,
        Err(payload) => std::panic::resume_unwind(payload),
    }
}

fn with_temp_config_file<T>(contents: &str, run: impl FnOnce(&Path) -> T) -> T {
    let path = unique_temp_path();
    fs::write(&path, contents).expect("write temp config");
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run(&path)));
    let _ = fs::remove_file(&path);
    match outcome {
        Ok(value) => value,
        Err(payload) => std::panic::resume_unwind(payload),
    }
}

fn unique_temp_path() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_nanos();
    let seq = TEMP_CONFIG_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    std::env::temp_dir().join(format!("execbandit-config-test-{pid}-{nanos}-{seq}.toml"))
}
