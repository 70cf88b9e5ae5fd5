use anyhow::{Context, Result};
use execbandit_core_types::PolicyFamily;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use super::env_parsing::{parse_arm_catalog_env, parse_env_bool, validate_app_config};
use super::AppConfig;

pub fn load_from_path(path: impl AsRef<Path>) -> Result<AppConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let cfg: AppConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
    Ok(cfg)
}

pub fn load_from_env_or_default(default_path: &Path) -> Result<(AppConfig, PathBuf)> {
    let configured = env::var("EXECBANDIT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_path.to_path_buf());
    let mut config = load_from_path(&configured)?;

    if let Ok(path) = env::var("EXECBANDIT_SQLITE_PATH") {
        config.sqlite.path = path;
    }
    if let Ok(log_level) = env::var("EXECBANDIT_LOG_LEVEL") {
        config.system.log_level = log_level;
    }
    if let Some(log_json) = env::var("EXECBANDIT_LOG_JSON")
        .ok()
        .and_then(parse_env_bool)
    {
        config.system.log_json = log_json;
    }
    if let Some(epsilon_floor) = env::var("EXECBANDIT_BANDIT_EPSILON_FLOOR")
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
    {
        config.bandit.epsilon_floor = epsilon_floor;
    }
    if let Some(alpha) = env::var("EXECBANDIT_BANDIT_ALPHA")
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
    {
        config.bandit.alpha = alpha;
    }
    if let Some(seed) = env::var("EXECBANDIT_BANDIT_SEED")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.bandit.seed = seed;
    }
    if let Ok(arms_csv) = env::var("EXECBANDIT_BANDIT_ARMS") {
        let arms = parse_arm_catalog_env(&arms_csv, "EXECBANDIT_BANDIT_ARMS")?;
        if !arms.is_empty() {
            config.bandit.arms = arms;
        }
    }
    if let Some(expiry_ms) = env::var("EXECBANDIT_PENDING_EXPIRY_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.pending.expiry_ms = expiry_ms;
    }
    if let Some(jitter_ms) = env::var("EXECBANDIT_PENDING_INSTRUMENT_MATCH_JITTER_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.pending.instrument_match_jitter_ms = jitter_ms;
    }
    if let Ok(family) = env::var("EXECBANDIT_REWARD_FAMILY") {
        config.reward.family = PolicyFamily::parse(&family).with_context(|| {
            format!("EXECBANDIT_REWARD_FAMILY must be fee or sizing, got: {family}")
        })?;
    }
    if let Some(sample_min) = env::var("EXECBANDIT_OPE_SAMPLE_MIN")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.ope.sample_min = sample_min;
    }
    if let Some(min_ess) = env::var("EXECBANDIT_OPE_MIN_ESS")
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
    {
        config.ope.min_ess = min_ess;
    }
    if let Some(schedule_seconds) = env::var("EXECBANDIT_OPE_SCHEDULE_SECONDS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.ope.schedule_seconds = schedule_seconds;
    }
    if let Some(web_enabled) = env::var("EXECBANDIT_WEB_ENABLED")
        .ok()
        .and_then(parse_env_bool)
    {
        config.web.enabled = web_enabled;
    }
    if let Some(web_port) = env::var("EXECBANDIT_WEB_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        config.web.port = web_port;
    }

    validate_app_config(&config)?;

    Ok((config, configured))
}
