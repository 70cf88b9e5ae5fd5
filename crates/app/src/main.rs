use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use execbandit_config::{load_from_env_or_default, AppConfig, OPE_LOOKBACK_HOURS_MAX};
use execbandit_ope::OfflineEvaluator;
use execbandit_policy::{attribution_fault_snapshot, DecisionEngine};
use execbandit_storage::{sqlite_contention_snapshot, SqliteStore};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{info, warn};

mod task_spawns;
mod telemetry;
mod web;

use crate::task_spawns::{spawn_prune_task, spawn_scheduled_ope_task};
use crate::telemetry::{format_error_chain, init_tracing};
use crate::web::WebRuntimeHandle;

const DEFAULT_CONFIG_PATH: &str = "configs/dev.toml";
const APP_COMPONENT: &str = "execbandit-app";

#[derive(Debug, Clone, PartialEq, Default)]
struct EvaluateArgs {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    policy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
struct CliArgs {
    config: Option<PathBuf>,
    evaluate: Option<EvaluateArgs>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_cli_args(env::args().skip(1))?;
    let default_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let (config, loaded_config_path) = load_from_env_or_default(&default_path)?;

    init_tracing(&config.system.log_level, config.system.log_json);
    info!(
        config_path = %loaded_config_path.display(),
        env = %config.system.env,
        "configuration loaded"
    );

    let mut store = SqliteStore::open(Path::new(&config.sqlite.path))
        .context("failed to initialize sqlite store")?;
    let migrations_dir = PathBuf::from(&config.system.migrations_dir);
    let applied = store
        .run_migrations(&migrations_dir)
        .with_context(|| format!("failed to apply migrations in {}", migrations_dir.display()))?;
    info!(applied, "sqlite migrations applied");

    if let Some(args) = cli.evaluate {
        return run_evaluate_once(&config, &store, args);
    }

    store
        .record_heartbeat(APP_COMPONENT, "startup")
        .context("failed to write startup heartbeat")?;

    let engine = Arc::new(
        DecisionEngine::bootstrap(&config, &store, Utc::now())
            .context("failed to bootstrap decision engine")?,
    );
    info!(
        arms = engine.selector().arms().len(),
        feature_dim = engine.selector().dim(),
        epsilon = engine.selector().epsilon(),
        reward_family = engine.reward_family().as_str(),
        "decision engine ready"
    );

    if config.web.enabled {
        let handle = WebRuntimeHandle::new(config.sqlite.path.clone(), engine.clone(), &config);
        let web_config = config.web.clone();
        tokio::spawn(async move {
            if let Err(error) = handle.run_server(web_config).await {
                warn!(error = %format_error_chain(&error), "web server stopped");
            }
        });
    }

    run_app_loop(store, engine, &config).await
}

fn run_evaluate_once(config: &AppConfig, store: &SqliteStore, args: EvaluateArgs) -> Result<()> {
    let to = args.to.unwrap_or_else(Utc::now);
    let lookback_hours = config.ope.schedule_lookback_hours.min(OPE_LOOKBACK_HOURS_MAX) as i64;
    let from = args
        .from
        .unwrap_or_else(|| to - chrono::Duration::hours(lookback_hours));
    let policy = args
        .policy
        .unwrap_or_else(|| config.reward.family.as_str().to_string());
    let report = OfflineEvaluator::new(config).evaluate(store, from, to, &policy)?;
    let rendered =
        serde_json::to_string_pretty(&report).context("failed to render evaluation report")?;
    println!("{rendered}");
    Ok(())
}

async fn run_app_loop(store: SqliteStore, engine: Arc<DecisionEngine>, config: &AppConfig) -> Result<()> {
    let sqlite_path = config.sqlite.path.clone();
    let evaluator = OfflineEvaluator::new(config);
    let scheduled_policy = config.reward.family.as_str().to_string();
    let ope_enabled = config.ope.schedule_seconds > 0;

    let mut heartbeat_interval =
        time::interval(Duration::from_secs(config.system.heartbeat_seconds.max(1)));
    let mut prune_interval =
        time::interval(Duration::from_millis(config.pending.prune_interval_ms.max(100)));
    let mut ope_interval = time::interval(Duration::from_secs(config.ope.schedule_seconds.max(1)));
    heartbeat_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    prune_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ope_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if let Err(error) = store.record_heartbeat(APP_COMPONENT, "alive") {
                    warn!(error = %format_error_chain(&error), "heartbeat write failed");
                }
                let contention = sqlite_contention_snapshot();
                info!(
                    pending = engine.pending_len(),
                    attribution_faults = attribution_fault_snapshot(),
                    sqlite_write_retries = contention.write_retry_total,
                    sqlite_busy_errors = contention.busy_error_total,
                    "runtime heartbeat"
                );
            }
            _ = prune_interval.tick() => {
                let task = spawn_prune_task(sqlite_path.clone(), engine.clone(), Utc::now());
                match tokio::task::spawn_blocking(task).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(error)) => {
                        warn!(error = %format_error_chain(&error), "pending prune failed");
                    }
                    Err(error) => {
                        warn!(error = %error, "pending prune task panicked");
                    }
                }
            }
            _ = ope_interval.tick(), if ope_enabled => {
                let task = spawn_scheduled_ope_task(
                    sqlite_path.clone(),
                    evaluator.clone(),
                    scheduled_policy.clone(),
                    config.ope.schedule_lookback_hours,
                    Utc::now(),
                );
                match tokio::task::spawn_blocking(task).await {
                    Ok(Ok(report)) => {
                        info!(
                            policy = %report.policy,
                            pass = report.pass,
                            n = report.overall.ips.n,
                            "scheduled ope run persisted"
                        );
                    }
                    Ok(Err(error)) => {
                        warn!(error = %format_error_chain(&error), "scheduled ope run failed");
                    }
                    Err(error) => {
                        warn!(error = %error, "scheduled ope task panicked");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    store
        .record_heartbeat(APP_COMPONENT, "shutdown")
        .context("failed to write shutdown heartbeat")?;
    Ok(())
}

fn parse_cli_args<I>(args: I) -> Result<CliArgs>
where
    I: IntoIterator<Item = String>,
{
    let mut cli = CliArgs::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg, None),
        };
        if flag == "--evaluate" {
            cli.evaluate.get_or_insert_with(EvaluateArgs::default);
            continue;
        }
        let value = match inline {
            Some(value) => Some(value),
            None => args.next(),
        };
        let value = value.with_context(|| format!("missing value for {flag}"))?;
        if flag == "--config" {
            cli.config = Some(PathBuf::from(value));
            continue;
        }
        let evaluate = cli.evaluate.get_or_insert_with(EvaluateArgs::default);
        match flag.as_str() {
            "--from" => evaluate.from = Some(parse_cli_timestamp(&flag, &value)?),
            "--to" => evaluate.to = Some(parse_cli_timestamp(&flag, &value)?),
            "--policy" => evaluate.policy = Some(value),
            other => return Err(anyhow!("unknown argument: {other}")),
        }
    }
    Ok(cli)
}

fn parse_cli_timestamp(flag: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("{flag} must be an RFC3339 timestamp, got: {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn config_flag_accepts_both_forms() -> Result<()> {
        let spaced = parse_cli_args(args(&["--config", "configs/prod.toml"]))?;
        assert_eq!(spaced.config, Some(PathBuf::from("configs/prod.toml")));
        assert!(spaced.evaluate.is_none());

        let inline = parse_cli_args(args(&["--config=configs/prod.toml"]))?;
        assert_eq!(inline, spaced);
        Ok(())
    }

    #[test]
    fn evaluate_mode_parses_window_and_policy() -> Result<()> {
        let cli = parse_cli_args(args(&[
            "--evaluate",
            "--from",
            "2026-03-01T00:00:00Z",
            "--to=2026-03-02T00:00:00Z",
            "--policy",
            "sizing",
        ]))?;
        let evaluate = cli.evaluate.context("evaluate mode")?;
        assert_eq!(evaluate.policy.as_deref(), Some("sizing"));
        let from = evaluate.from.context("from")?;
        let to = evaluate.to.context("to")?;
        assert_eq!((to - from).num_hours(), 24);
        Ok(())
    }

    #[test]
    fn malformed_arguments_are_rejected() {
        assert!(parse_cli_args(args(&["--from", "yesterday"])).is_err());
        assert!(parse_cli_args(args(&["--config"])).is_err());
        assert!(parse_cli_args(args(&["--verbose", "1"])).is_err());
    }
}
