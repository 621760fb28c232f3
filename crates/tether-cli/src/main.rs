//! tether: remote shells over SSH with optional mosh.
//!
//! Opens interactive shells (upgrading to mosh when asked and available),
//! runs one-off commands, and manages the trust-on-first-use host store.

mod commands;
mod config;
mod terminal;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tether_core::TransportMode;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::commands::ConnectOptions;
use crate::config::{expand_tilde, tether_dir, Config};

/// tether: remote shell client
#[derive(Parser)]
#[command(name = "tether", version, about = "Remote shells over SSH, with optional mosh")]
struct Cli {
    /// SSH port
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Private key file used for authentication
    #[arg(short = 'i', long = "identity", global = true)]
    identity: Option<PathBuf>,

    /// Start shells over mosh, falling back to ssh
    #[arg(long, global = true)]
    mosh: bool,

    /// Install mosh-server on the remote host if it is missing
    #[arg(long = "install-mosh", global = true)]
    install_mosh: bool,

    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,

    /// Positional arguments: [user@]host [command...]
    ///
    /// The first positional arg is the target; any remaining args form a
    /// remote command to execute instead of an interactive shell.
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect or edit trusted host keys
    KnownHosts {
        #[command(subcommand)]
        action: KnownHostsAction,
    },
}

#[derive(Subcommand)]
enum KnownHostsAction {
    /// List trusted hosts
    List,
    /// Forget a host's key
    Remove {
        host: String,
        #[arg(default_value_t = 22)]
        port: u16,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over the defaults.
    let default_filter = if cli.verbose {
        "tether=debug,tether_cli=debug,tether_client=debug,tether_core=debug,russh=info"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.verbose)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let cfg = match Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("tether: {e:#}");
            std::process::exit(2);
        }
    };
    let trust_path = tether_dir().join("known_hosts.json");

    let result = match cli.command {
        Some(Command::KnownHosts { action }) => match action {
            KnownHostsAction::List => commands::known_hosts::run_list(&trust_path),
            KnownHostsAction::Remove { host, port } => {
                commands::known_hosts::run_remove(&trust_path, &host, port)
            }
        },
        None => {
            if cli.args.is_empty() {
                eprintln!(
                    "Usage: tether [OPTIONS] [user@]host [command...]\n       tether known-hosts <list|remove>\n\nRun `tether --help` for full usage."
                );
                std::process::exit(1);
            }

            // CLI flags override the config file.
            let opts = ConnectOptions {
                port: cli.port.unwrap_or(cfg.default.port),
                default_user: cfg.default.user.clone(),
                identity: cli
                    .identity
                    .clone()
                    .or_else(|| cfg.default.identity.as_deref().map(expand_tilde)),
                transport: if cli.mosh {
                    TransportMode::Mosh
                } else {
                    cfg.default.transport
                },
                install_mosh: cli.install_mosh || cfg.default.install_mosh_server,
                keepalive: Duration::from_secs(cfg.default.keepalive_secs),
                trust_path,
            };

            let target = &cli.args[0];
            if cli.args.len() > 1 {
                let command = cli.args[1..].join(" ");
                commands::exec::run(target, &command, &opts).await
            } else {
                commands::connect::run(target, &opts).await
            }
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("tether: {e:#}");
        std::process::exit(1);
    }
}
