//! Mount an object store container as a POSIX filesystem.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{debug, error};

mod app_config;
mod daemon;
mod trc;

use crate::app_config::Config;
use crate::trc::Trc;

#[derive(Parser)]
#[command(
    version,
    about = "A POSIX filesystem over an object store, backed by a local cache."
)]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a blob-fs config TOML."
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Spawn the filesystem as a daemon process.
    Run {
        /// Run the daemon in the background.
        #[arg(short, long, help = "Run the daemon in the background.")]
        daemonize: bool,
    },
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let config = Config::load_or_create(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });
    if let Err(error_messages) = config.validate() {
        eprintln!("Configuration is invalid.");
        for msg in &error_messages {
            eprintln!(" - {msg}");
        }
        std::process::exit(1);
    }

    let Command::Run { daemonize } = args.command.unwrap_or(Command::Run { daemonize: false });

    let trc = if daemonize {
        Trc::from_env().detached()
    } else {
        Trc::from_env()
    };
    if let Err(e) = trc.init() {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    }

    if daemonize {
        debug!(config = ?config, "Initializing daemon with configuration...");
        let Some(pid_file_parent) = config.daemon.pid_file.parent() else {
            error!("PID file has no parent directory.");
            std::process::exit(1);
        };
        if let Err(e) = std::fs::create_dir_all(pid_file_parent) {
            error!("Failed to create PID file directory: {e}");
            std::process::exit(1);
        }

        let daemonize = daemonize::Daemonize::new()
            .pid_file(&config.daemon.pid_file)
            .chown_pid_file(true)
            .user(config.uid)
            .group(config.gid);

        match daemonize.start() {
            Ok(()) => {
                if let Err(e) = daemon::spawn(config) {
                    error!("Daemon failed: {e}");
                    std::process::exit(1);
                }
            }
            Err(e) => {
                error!("Failed to spawn the daemon: {e}");
                std::process::exit(1);
            }
        }
    } else if let Err(e) = daemon::spawn(config) {
        error!("Daemon failed: {e}");
        std::process::exit(1);
    }
}
