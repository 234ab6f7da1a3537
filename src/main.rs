use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use swww_sync::config::split_names;
use swww_sync::{Config, Daemon, daemon, executor};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Keeps per-output wallpapers and the generated theme in sync with the
/// shell's session file.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/swww-sync/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Shortcut for --log-level debug
    #[arg(short, long)]
    verbose: bool,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Session file to watch
    #[arg(long)]
    session_file: Option<PathBuf>,

    /// Debounce window in milliseconds
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// Output to target when detection fails (repeatable, or comma separated)
    #[arg(short, long)]
    output: Vec<String>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

fn parse_level(s: &str) -> Level {
    match s.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn init_logging(level: Level) {
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    if let Some(level) = &args.log_level {
        config.general.log_level = level.clone();
    }
    if args.verbose {
        config.general.log_level = "debug".to_string();
    }
    if let Some(path) = &args.session_file {
        config.dms.session_file = swww_sync::config::expand_path(path);
    }
    if let Some(ms) = args.debounce_ms {
        config.general.debounce_ms = ms;
    }
    if !args.output.is_empty() {
        config.outputs.names = args.output.iter().flat_map(|o| split_names(o)).collect();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn shutdown_on_signal(token: CancellationToken) {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => Some(term),
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            None
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Cannot listen for Ctrl+C: {}", e);
                return;
            }
            info!("Received Ctrl+C");
        }
        Some(_) = async {
            match term.as_mut() {
                Some(term) => term.recv().await,
                None => std::future::pending().await,
            }
        } => info!("Received SIGTERM"),
    }
    token.cancel();
}

async fn run(args: Args) -> Result<bool> {
    // Logging is not up yet while the config loads, so errors go through
    // anyhow to stderr.
    let config = load_config(&args)?;
    init_logging(parse_level(&config.general.log_level));

    if args.print_config {
        print!("{}", config.to_toml().context("Failed to render configuration")?);
        return Ok(true);
    }

    info!("swww-sync v{} starting", env!("CARGO_PKG_VERSION"));

    let missing = executor::check_tools(&config);
    if !missing.is_empty() {
        warn!("Continuing without {:?}; those steps will fail until installed", missing);
    }

    if args.once {
        let mut daemon = Daemon::new(&config);
        let report = daemon.run_once().await;
        return Ok(report.is_success());
    }

    let token = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(token.clone()));

    daemon::serve(&config, token)
        .await
        .context("Watching the session file failed")?;

    info!("swww-sync shutting down");
    Ok(true)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match run(args).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}
