#![warn(missing_docs)]

//! hookgate command line
//!
//! Validates configuration, prints the limits a plugin would run under, and
//! runs a self-check dispatch that exercises the sandbox and circuit breaker.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use hookgate_audit::{AuditSink, TracingAuditSink};
use hookgate_config::HookgateConfig;
use hookgate_hooks::{action_fn, callback_fn, HookManager, DEFAULT_PRIORITY};
use hookgate_sandbox::{InMemoryStore, ResourceSandbox};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
usage: hookgate <command>

commands:
  check [path]      validate a config file and print the effective settings
  limits <plugin>   print the limits a plugin runs under
  selftest          dispatch sample hooks through the sandbox and breaker
  --version, -V     print the version";

/// A parsed command line.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Version,
    Help,
    Check(Option<PathBuf>),
    Limits(String),
    SelfTest,
}

fn parse_command(args: &[String]) -> Result<Command> {
    if args.iter().any(|a| a == "--version" || a == "-V") {
        return Ok(Command::Version);
    }
    match args.first().map(String::as_str) {
        None | Some("help" | "--help" | "-h") => Ok(Command::Help),
        Some("check") => Ok(Command::Check(args.get(1).map(PathBuf::from))),
        Some("limits") => {
            let plugin = args
                .get(1)
                .context("`limits` needs a plugin slug, e.g. `hookgate limits acme`")?;
            Ok(Command::Limits(plugin.clone()))
        }
        Some("selftest") => Ok(Command::SelfTest),
        Some(other) => anyhow::bail!("unknown command '{}'\n\n{}", other, USAGE),
    }
}

/// Locate the config file.
///
/// Search order:
/// 1. `HOOKGATE_CONFIG` environment variable
/// 2. `./hookgate.toml` in the current directory
/// 3. None (built-in defaults apply)
fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("HOOKGATE_CONFIG") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    let cwd = PathBuf::from("hookgate.toml");
    if cwd.exists() {
        return Some(cwd);
    }

    None
}

fn load_config(explicit: Option<&Path>) -> Result<HookgateConfig> {
    let path = explicit.map(Path::to_path_buf).or_else(find_config_file);
    match path {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            HookgateConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))
        }
        None => {
            tracing::info!("no config file found, using built-in defaults");
            Ok(HookgateConfig::default())
        }
    }
}

fn effective_settings(config: &HookgateConfig) -> serde_json::Value {
    let sandbox = ResourceSandbox::from_config(&config.sandbox, Arc::new(InMemoryStore::new()));
    let mut plugins = serde_json::Map::new();
    let mut slugs: Vec<&String> = config.sandbox.plugins.keys().collect();
    slugs.sort();
    for slug in slugs {
        plugins.insert(slug.clone(), json!(sandbox.plugin_limits(slug)));
    }
    let cb = &config.circuit_breaker;
    let ab = &config.auto_block;
    json!({
        "sandbox": {
            "enabled": sandbox.is_enabled(),
            "enforce_timeout": sandbox.enforces_timeout(),
            "defaults": sandbox.default_limits(),
            "plugins": plugins,
        },
        "circuit_breaker": {
            "failure_threshold": cb.failure_threshold.unwrap_or(5),
            "success_threshold": cb.success_threshold.unwrap_or(2),
            "recovery_timeout_secs": cb.recovery_timeout_secs.unwrap_or(60),
        },
        "auto_block": {
            "enabled": ab.enabled.unwrap_or(true),
            "violation_threshold": ab.violation_threshold.unwrap_or(10),
            "window_secs": ab.window_secs.unwrap_or(300),
            "cooldown_secs": ab.cooldown_secs.unwrap_or(3600),
        },
    })
}

/// Dispatch sample hooks and report what the guard did.
///
/// A host callback and a healthy plugin filter must keep running while a
/// failing plugin callback trips its circuit. With the sandbox disabled the
/// failing callback runs on every dispatch instead.
async fn self_test(config: &HookgateConfig) -> Result<serde_json::Value> {
    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
    let manager = HookManager::from_config(config, Arc::new(InMemoryStore::new()), audit);
    let threshold = manager.circuit_breaker().config().failure_threshold as usize;

    let host_runs = Arc::new(AtomicUsize::new(0));
    let runs = host_runs.clone();
    manager.add_action(
        "selftest_init",
        action_fn(move |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
        DEFAULT_PRIORITY,
    );

    let broken_runs = Arc::new(AtomicUsize::new(0));
    let runs = broken_runs.clone();
    manager.scoped(Some("selftest-broken")).add_action(
        "selftest_init",
        action_fn(move |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("deliberate self-test failure")
        }),
        DEFAULT_PRIORITY,
    );

    manager.scoped(Some("selftest-healthy")).add_filter(
        "selftest_title",
        callback_fn(|args| Ok(json!(format!("{} ok", args[0].as_str().unwrap_or_default())))),
        DEFAULT_PRIORITY,
    );

    for _ in 0..=threshold {
        manager.do_action("selftest_init", &[]).await;
    }
    let title = manager
        .apply_filters("selftest_title", json!("hookgate"), &[])
        .await;
    let open_circuits = manager.circuit_breaker().get_open_circuits().await?;

    let host = host_runs.load(Ordering::SeqCst);
    let broken = broken_runs.load(Ordering::SeqCst);
    let guarded = manager.sandbox().is_enabled();
    let breaker_ok = if guarded {
        broken == threshold && open_circuits == ["selftest-broken:selftest_init"]
    } else {
        broken == threshold + 1 && open_circuits.is_empty()
    };
    let passed = host == threshold + 1 && breaker_ok && title == json!("hookgate ok");

    Ok(json!({
        "passed": passed,
        "sandbox_enabled": guarded,
        "dispatches": threshold + 1,
        "host_callback_runs": host,
        "failing_callback_runs": broken,
        "action_hooks": manager.action_hooks(),
        "filter_hooks": manager.filter_hooks(),
        "open_circuits": open_circuits,
        "filtered_title": title,
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_command(&args)?;
    match command {
        Command::Version => {
            println!("hookgate {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Command::Help => {
            println!("{USAGE}");
            return Ok(());
        }
        _ => {}
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match command {
        Command::Check(path) => {
            let config = load_config(path.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&effective_settings(&config))?);
        }
        Command::Limits(plugin) => {
            let config = load_config(None)?;
            let sandbox =
                ResourceSandbox::from_config(&config.sandbox, Arc::new(InMemoryStore::new()));
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "plugin": plugin,
                    "limits": sandbox.plugin_limits(&plugin),
                }))?
            );
        }
        Command::SelfTest => {
            let config = load_config(None)?;
            let report = self_test(&config).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report["passed"] != json!(true) {
                anyhow::bail!("self-test failed");
            }
            tracing::info!("self-test passed");
        }
        Command::Version | Command::Help => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command(&args(&[])).unwrap(), Command::Help);
        assert_eq!(parse_command(&args(&["-V"])).unwrap(), Command::Version);
        assert_eq!(
            parse_command(&args(&["check", "x.toml"])).unwrap(),
            Command::Check(Some(PathBuf::from("x.toml")))
        );
        assert_eq!(parse_command(&args(&["check"])).unwrap(), Command::Check(None));
        assert_eq!(
            parse_command(&args(&["limits", "acme"])).unwrap(),
            Command::Limits("acme".into())
        );
        assert_eq!(parse_command(&args(&["selftest"])).unwrap(), Command::SelfTest);
    }

    #[test]
    fn rejects_bad_commands() {
        assert!(parse_command(&args(&["limits"])).is_err());
        let err = parse_command(&args(&["frobnicate"])).unwrap_err();
        assert!(err.to_string().contains("unknown command"));
    }

    #[test]
    fn effective_settings_merge_plugin_overrides() {
        let config = HookgateConfig::from_toml(
            r#"
            [sandbox]
            memory_mb = 32

            [sandbox.plugins.acme]
            memory_mb = 128
            "#,
        )
        .unwrap();
        let settings = effective_settings(&config);
        assert_eq!(settings["sandbox"]["defaults"]["memory_mb"], 32);
        assert_eq!(settings["sandbox"]["plugins"]["acme"]["memory_mb"], 128);
        assert_eq!(
            settings["sandbox"]["plugins"]["acme"]["execution_time_seconds"],
            30
        );
        assert_eq!(settings["circuit_breaker"]["failure_threshold"], 5);
    }

    #[test]
    fn load_config_reports_missing_file() {
        let err = load_config(Some(Path::new("/nonexistent/hookgate.toml"))).unwrap_err();
        assert!(err.to_string().contains("failed to load config"));
    }

    #[tokio::test]
    async fn self_test_passes_with_defaults() {
        let report = self_test(&HookgateConfig::default()).await.unwrap();
        assert_eq!(report["passed"], true, "report: {report}");
        assert_eq!(report["failing_callback_runs"], 5);
        assert_eq!(report["action_hooks"], json!(["selftest_init"]));
    }

    #[tokio::test]
    async fn self_test_passes_with_sandbox_disabled() {
        let config = HookgateConfig::from_toml("[sandbox]\nenabled = false").unwrap();
        let report = self_test(&config).await.unwrap();
        assert_eq!(report["passed"], true, "report: {report}");
        assert_eq!(report["failing_callback_runs"], 6);
        assert_eq!(report["open_circuits"], json!([]));
    }
}
