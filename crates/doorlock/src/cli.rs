//! Clap derive structures for the `doorlock` binary.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// doorlock -- drive a door lock through its Android app over MQTT
#[derive(Debug, Parser)]
#[command(
    name = "doorlock",
    version,
    about = "Bridge a door lock's Android app to an MQTT broker",
    long_about = "Runs the door-lock bridge: listens for LOCK/UNLOCK commands on the broker,\n\
        taps the vendor app over adb, reads the result off the screen, and\n\
        publishes the lock state as a retained message.\n\n\
        Without a subcommand the bridge daemon is started.",
    propagate_version = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Option<Command>,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, short = 'c', env = "DOORLOCK_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Also write daily-rotated logs to this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the bridge daemon (default)
    Run,

    /// Read the lock state off the phone once and print it as JSON
    Status,

    /// Lock the door once, without the broker
    Lock,

    /// Unlock the door once, without the broker
    Unlock,

    /// Inspect the configuration
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print the effective configuration as TOML (password redacted)
    Show,

    /// Print the configuration file path
    Path,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_tree_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_subcommand_means_daemon() {
        let cli = Cli::try_parse_from(["doorlock", "-vv"]).expect("parses");
        assert!(cli.command.is_none());
        assert_eq!(cli.global.verbose, 2);
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["doorlock", "config", "show", "--config", "/tmp/x.toml"])
            .expect("parses");
        assert!(matches!(
            cli.command,
            Some(Command::Config(ConfigArgs {
                command: ConfigCommand::Show
            }))
        ));
        assert_eq!(cli.global.config, Some(PathBuf::from("/tmp/x.toml")));
    }
}
