#[cfg(test)]
use std::fs;
#[cfg(test)]
use std::path::{Path, PathBuf};

mod env_parsing;
mod loader;
mod schema;

pub use self::env_parsing::validate_app_config;
pub use self::loader::{load_from_env_or_default, load_from_path};
pub use self::schema::{
    AppConfig, BanditConfig, OpeConfig, PendingConfig, RewardConfig, SegmentConfig, SqliteConfig,
    SystemConfig, WebConfig,
};

pub const BANDIT_FEATURE_DIM_MAX: usize = 64;
pub const BANDIT_ARM_COUNT_MAX: usize = 32;
pub const PENDING_WINDOW_MS_MAX: u64 = 7 * 24 * 60 * 60 * 1_000;
pub const OPE_LOOKBACK_HOURS_MAX: u64 = 366 * 24;
pub const ENV_PREFIX: &str = "EXECBANDIT_";
#[cfg(test)]
mod tests;
