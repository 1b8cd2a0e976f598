mod cli;
mod commands;
mod error;

use std::path::Path;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use doorlock_config::{Config, LoggingSection};
use doorlock_core::Target;

use crate::cli::{Cli, Command, GlobalOpts};
use crate::error::BridgeError;

const LOG_FILE_PREFIX: &str = "doorlock.log";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

/// Stderr logging, plus a daily-rotated file when a log directory is
/// configured. The returned guard flushes the file writer on drop.
fn init_tracing(global: &GlobalOpts, logging: &LoggingSection) -> Option<WorkerGuard> {
    let level = match global.verbose {
        0 => logging.level.clone(),
        1 => "info".into(),
        2 => "debug".into(),
        _ => "trace".into(),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match global.log_dir.as_ref().or(logging.directory.as_ref()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .init();

    guard
}

fn load(path: Option<&Path>) -> Result<Config, BridgeError> {
    let shown = path.map_or_else(doorlock_config::config_path, Path::to_path_buf);
    doorlock_config::load_config(path).map_err(|e| BridgeError::config(e, &shown))
}

async fn run(cli: Cli) -> Result<(), BridgeError> {
    let config = load(cli.global.config.as_deref())?;

    // Config commands print to stdout and never touch the phone.
    if let Some(Command::Config(args)) = &cli.command {
        return commands::config_cmd::handle(args, &cli.global, &config);
    }

    let _guard = init_tracing(&cli.global, &config.logging);
    let shown = cli
        .global
        .config
        .clone()
        .unwrap_or_else(doorlock_config::config_path);
    let bridge = config
        .to_bridge_config()
        .map_err(|e| BridgeError::config(e, &shown))?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => commands::run::handle(bridge).await,
        Command::Status => commands::oneshot::status(&bridge).await,
        Command::Lock => commands::oneshot::drive(&bridge, Target::Locked).await,
        Command::Unlock => commands::oneshot::drive(&bridge, Target::Unlocked).await,
        Command::Config(_) => Ok(()),
    }
}
