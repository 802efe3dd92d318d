//! playrate CLI
//!
//! Thin wrapper over `playrate-core`: evaluate site rules against a URL,
//! validate speed payloads, print the effective configuration and run the
//! coordinator/agent protocol against the in-memory browser.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

use playrate_core::clock::MonotonicClock;
use playrate_core::config::{Config, LogFormat};
use playrate_core::logging::{LogConfig, init_logging};
use playrate_core::simulation::Scenario;
use playrate_core::speed::Speed;
use playrate_core::storage::SiteSettings;
use playrate_core::url_pattern::PatternCache;

#[derive(Parser, Debug)]
#[command(
    name = "playrate",
    version,
    about = "Per-site video playback speed rules and the injection/recovery protocol behind them"
)]
struct Cli {
    /// Config file (defaults to $XDG_CONFIG_HOME/playrate/playrate.toml)
    #[arg(long, global = true, env = "PLAYRATE_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level filter; RUST_LOG takes precedence
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log output format (pretty, json)
    #[arg(long, global = true, value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Find the site rule that applies to a URL
    Match {
        /// Site rules as a JSON object: {"pattern": {"speed": 1.5, "enabled": true}}
        #[arg(long, value_name = "JSON")]
        rules: String,

        url: String,
    },

    /// Validate a speed value the way message handlers do
    CheckSpeed {
        /// JSON value, e.g. 1.5 or "2.0"
        #[arg(value_name = "JSON")]
        value: String,
    },

    /// Print the effective configuration
    Config {
        /// Print as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },

    /// Run the injection and recovery protocol against an in-memory browser
    Simulate {
        #[arg(long, default_value = "https://example.com/watch")]
        url: String,

        /// Site rules as a JSON object
        #[arg(long, value_name = "JSON")]
        rules: Option<String>,

        /// Video elements on the page
        #[arg(long, default_value_t = 1)]
        videos: usize,

        /// One-shot messages to drop after the page loads
        #[arg(long, default_value_t = 0)]
        drops: u32,

        /// Channel connects to refuse after the page loads
        #[arg(long, default_value_t = 0)]
        fail_connects: u32,

        /// Times the channel is severed
        #[arg(long, default_value_t = 1)]
        closures: u32,

        /// Seconds to wait for each recovery
        #[arg(long, default_value_t = 60)]
        settle_secs: u64,

        /// Run on the wall clock instead of virtual time
        #[arg(long)]
        real_time: bool,
    },
}

#[derive(Serialize)]
struct MatchReport<'a> {
    url: &'a str,
    matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pattern: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f64>,
}

#[derive(Serialize)]
struct SpeedReport {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load().context("Failed to load config")?,
    };
    if let Some(level) = &cli.log_level {
        config.general.log_level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.general.log_format = format;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn parse_rules(raw: &str) -> anyhow::Result<SiteSettings> {
    let value: Value = serde_json::from_str(raw).context("--rules is not valid JSON")?;
    if !value.is_object() {
        bail!("--rules must be a JSON object mapping patterns to rules");
    }
    Ok(SiteSettings::from_value(Some(&value)))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_match(rules: &str, url: &str) -> anyhow::Result<ExitCode> {
    let rules = parse_rules(rules)?;
    let mut patterns = PatternCache::new();
    let found = patterns.first_match(&rules, url);
    print_json(&MatchReport {
        url,
        matched: found.is_some(),
        pattern: found.map(|m| m.pattern),
        speed: found.map(|m| m.speed.get()),
    })?;
    Ok(ExitCode::SUCCESS)
}

fn run_check_speed(raw: &str) -> anyhow::Result<ExitCode> {
    let value: Value = serde_json::from_str(raw).context("Speed is not valid JSON")?;
    let report = match Speed::from_json(&value) {
        Ok(speed) => SpeedReport {
            valid: true,
            speed: Some(speed.get()),
            error: None,
        },
        Err(e) => SpeedReport {
            valid: false,
            speed: None,
            error: Some(e.to_string()),
        },
    };
    print_json(&report)?;
    Ok(if report.valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn run_config(config: &Config, json: bool) -> anyhow::Result<ExitCode> {
    if json {
        print_json(config)?;
    } else {
        print!("{}", config.to_toml()?);
    }
    Ok(ExitCode::SUCCESS)
}

fn run_simulate(config: Config, scenario: Scenario, real_time: bool) -> anyhow::Result<ExitCode> {
    let mut builder = tokio::runtime::Builder::new_current_thread();
    builder.enable_all();
    if !real_time {
        builder.start_paused(true);
    }
    let runtime = builder.build().context("Failed to start tokio runtime")?;

    let closures = scenario.closures;
    let report = runtime.block_on(async move {
        scenario
            .run(config, Arc::new(MonotonicClock::new()))
            .await
    })?;
    print_json(&report)?;

    Ok(if report.connected_after_load && report.recovered == closures {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    if let Err(e) = init_logging(&LogConfig::from(&config.general)) {
        eprintln!("playrate: logging disabled: {e}");
    }
    tracing::debug!(command = ?cli.command, "playrate starting");

    match cli.command {
        Commands::Match { rules, url } => run_match(&rules, &url),
        Commands::CheckSpeed { value } => run_check_speed(&value),
        Commands::Config { json } => run_config(&config, json),
        Commands::Simulate {
            url,
            rules,
            videos,
            drops,
            fail_connects,
            closures,
            settle_secs,
            real_time,
        } => {
            let rules = match rules {
                Some(raw) => parse_rules(&raw)?,
                None => SiteSettings::default(),
            };
            let scenario = Scenario {
                url,
                rules,
                videos,
                drops,
                fail_connects,
                closures,
                settle_timeout: Duration::from_secs(settle_secs),
            };
            run_simulate(config, scenario, real_time)
        }
    }
}
