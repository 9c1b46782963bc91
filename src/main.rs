use clap::{value_parser, Arg, Command};
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use powerbi_refresh_agent::{
    config::Config,
    error::{Error, Result},
    refresh::{RefreshObjectRef, RefreshOutcome},
    RefreshCoordinator,
};

const EXIT_REFRESH_NOT_COMPLETED: i32 = 1;
const EXIT_INTERRUPTED: i32 = 130;
const LIB_LOG_TARGET: &str = "powerbi_refresh_agent";

#[derive(Debug)]
pub struct Args {
    config_path: Option<PathBuf>,
    log_level: String,
    dry_run: bool,
    poll_interval: Option<u64>,
    max_wait: Option<u64>,
    objects: Option<String>,
}

pub async fn load_config_from_args(args: &Args) -> Result<Config> {
    let mut config = if let Some(config_path) = &args.config_path {
        info!("Loading config from: {:?}", config_path);
        Config::load(config_path).await?
    } else {
        info!("Loading config from default locations");
        Config::load_from_default_locations().await?
    };

    apply_cli_overrides(&mut config, args)?;
    Ok(config)
}

/// Command-line values win over the file; the result is validated again
pub fn apply_cli_overrides(config: &mut Config, args: &Args) -> Result<()> {
    if let Some(interval) = args.poll_interval {
        config.polling.interval_seconds = interval;
    }
    if let Some(max_wait) = args.max_wait {
        config.polling.max_wait_seconds = Some(max_wait);
    }
    if let Some(raw) = &args.objects {
        config.objects = RefreshObjectRef::parse_list(raw)?;
    }
    config.validate()
}

pub async fn run_refresh(config: &Config) -> Result<RefreshOutcome> {
    let mut coordinator = RefreshCoordinator::from_config(config)?;
    coordinator
        .run(config.polling.interval(), config.polling.max_wait())
        .await
}

pub fn report_outcome(outcome: &RefreshOutcome) {
    info!("Refresh completed with status: {}", outcome.status);
    info!("Started at: {}", outcome.started_at);
    info!("Ended at: {}", outcome.ended_at);
    info!("Total duration: {:.2} seconds", outcome.duration_seconds);

    if !outcome.is_success() {
        warn!(
            "Refresh {} did not complete successfully",
            outcome.request_id.as_deref().unwrap_or("(unknown request)")
        );
        if let Some(details) = &outcome.service_exception_json {
            warn!("Service exception: {}", details);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    init_logging(&args.log_level)?;

    info!("Starting Power BI refresh agent v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_config_from_args(&args).await {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Err(e);
        }
    };

    if args.dry_run {
        info!("Configuration is valid. Dry run complete.");
        return Ok(());
    }

    let result = tokio::select! {
        result = run_refresh(&config) => result,
        interrupted = signal::ctrl_c() => {
            if let Err(err) = interrupted {
                error!("Unable to listen for shutdown signal: {}", err);
            }
            warn!("Interrupted; a triggered refresh keeps running on the service");
            std::process::exit(EXIT_INTERRUPTED);
        }
    };

    match result {
        Ok(outcome) => {
            report_outcome(&outcome);
            if !outcome.is_success() {
                std::process::exit(EXIT_REFRESH_NOT_COMPLETED);
            }
            Ok(())
        }
        Err(e) => {
            error!("Process failed: {}", e);
            Err(e)
        }
    }
}

fn parse_args() -> Args {
    let matches = Command::new("powerbi-refresh")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Triggers a Power BI dataset refresh and waits for it to finish")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .num_args(1),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)")
                .default_value("info")
                .num_args(1),
        )
        .arg(
            Arg::new("poll-interval")
                .long("poll-interval")
                .value_name("SECONDS")
                .help("Seconds between status checks")
                .value_parser(value_parser!(u64))
                .num_args(1),
        )
        .arg(
            Arg::new("max-wait")
                .long("max-wait")
                .value_name("SECONDS")
                .help("Give up after this many seconds of polling (default: wait forever)")
                .value_parser(value_parser!(u64))
                .num_args(1),
        )
        .arg(
            Arg::new("objects")
                .long("objects")
                .value_name("JSON")
                .help(r#"JSON list of objects to refresh, e.g. '[{"table":"DimDate"}]'"#)
                .num_args(1),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .help("Validate configuration and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    Args {
        config_path: matches.get_one::<String>("config").map(PathBuf::from),
        log_level: matches
            .get_one::<String>("log-level")
            .cloned()
            .unwrap_or_else(|| "info".to_string()),
        dry_run: matches.get_flag("dry-run"),
        poll_interval: matches.get_one::<u64>("poll-interval").copied(),
        max_wait: matches.get_one::<u64>("max-wait").copied(),
        objects: matches.get_one::<String>("objects").cloned(),
    }
}

fn parse_level(log_level: &str) -> Result<Level> {
    match log_level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(Error::Config(format!("Invalid log level: {}", log_level))),
    }
}

/// Applies `level` to both the library and this binary; the bin target name
/// differs from the library's, so each needs its own directive.
fn log_filter(level: Level, base: EnvFilter) -> Result<EnvFilter> {
    [LIB_LOG_TARGET, env!("CARGO_CRATE_NAME")]
        .into_iter()
        .try_fold(base, |filter, target| {
            let directive = format!("{}={}", target, level)
                .parse()
                .map_err(|e| Error::Config(format!("Invalid log directive: {}", e)))?;
            Ok(filter.add_directive(directive))
        })
}

fn init_logging(log_level: &str) -> Result<()> {
    let level = parse_level(log_level)?;
    let env_filter = log_filter(level, EnvFilter::from_default_env())?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(env_filter)
        .init();

    Ok(())
}
