//! hostctl - host lifecycle control for platform test labs.
//!
//! Connects to the lab's active controller and runs one lifecycle
//! operation. The exit status is the operation's result code, so scripts
//! can tell a rejection (1) from a state timeout (2) or a failed post-check (3).

#![forbid(unsafe_code)]

mod commands;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use hostctl_common::{HarnessConfig, init_logging};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "hostctl")]
#[command(author, version, about = "Lock, unlock, reboot and swact lab hosts")]
struct Cli {
    /// Path to config file (default: ~/.config/hostctl/config.toml)
    #[arg(short, long, global = true, env = "HOSTCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List hosts and their states
    Hosts,

    /// Show one host
    Show { host: String },

    /// Lock a host, swacting away first if it is the active controller
    Lock {
        host: String,
        /// Force the lock; skips the swact and the online check
        #[arg(short, long)]
        force: bool,
        /// Do not swact away from an active controller
        #[arg(long)]
        no_swact: bool,
        /// Seconds to wait for the lock
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Unlock a host and wait until it is in service
    Unlock {
        host: String,
        /// Return once the command is accepted
        #[arg(long)]
        no_wait: bool,
        /// Seconds to wait (default depends on personality)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Reboot a host and wait for it to come back
    Reboot {
        host: String,
        #[arg(long)]
        no_wait: bool,
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Swap the active and standby controllers
    Swact {
        #[arg(long)]
        no_wait: bool,
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Wait until hosts reach a state
    Wait(WaitArgs),

    /// Configuration commands
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Describe an error code, or list them all
    Explain { code: Option<String> },
}

#[derive(Args)]
struct WaitArgs {
    #[arg(required = true)]
    hosts: Vec<String>,
    /// Accepted administrative states
    #[arg(long, value_delimiter = ',')]
    admin: Vec<String>,
    /// Accepted operational states
    #[arg(long, value_delimiter = ',')]
    oper: Vec<String>,
    /// Accepted availability states
    #[arg(long, value_delimiter = ',')]
    avail: Vec<String>,
    #[arg(long, default_value = "600")]
    timeout: u64,
    /// Seconds the states must hold
    #[arg(long, default_value = "0")]
    stable_for: u64,
    /// Exit 0 even if the states are not reached
    #[arg(long)]
    fail_ok: bool,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(commands::EXIT_ERROR)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = HarnessConfig::load(cli.config.as_deref())?;

    let mut logging = config.logging();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    let _guard = init_logging(&logging)?;

    let out = commands::Output { json: cli.json };
    match cli.command {
        Command::Config(ConfigCommand::Show) => commands::config_show(&config, &out),
        Command::Config(ConfigCommand::Validate) => commands::config_validate(&config, &out),
        Command::Explain { code } => commands::explain(code.as_deref(), &out),
        Command::Hosts => commands::hosts(&config, &out).await,
        Command::Show { host } => commands::show(&config, &host, &out).await,
        Command::Lock {
            host,
            force,
            no_swact,
            timeout,
        } => commands::lock(&config, &host, force, !no_swact, timeout, &out).await,
        Command::Unlock {
            host,
            no_wait,
            timeout,
        } => commands::unlock(&config, &host, !no_wait, timeout, &out).await,
        Command::Reboot {
            host,
            no_wait,
            timeout,
        } => commands::reboot(&config, &host, !no_wait, timeout, &out).await,
        Command::Swact { no_wait, timeout } => commands::swact(&config, !no_wait, timeout, &out).await,
        Command::Wait(args) => {
            let request = commands::WaitRequest {
                hosts: args.hosts,
                admin: args.admin,
                oper: args.oper,
                avail: args.avail,
                timeout: args.timeout,
                stable_for: args.stable_for,
                fail_ok: args.fail_ok,
            };
            commands::wait(&config, request, &out).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_wait_splits_comma_lists() {
        let cli = Cli::parse_from([
            "hostctl", "wait", "compute-0", "compute-1", "--avail", "available,degraded", "--admin", "unlocked",
        ]);
        match cli.command {
            Command::Wait(args) => {
                assert_eq!(args.hosts, ["compute-0", "compute-1"]);
                assert_eq!(args.avail, ["available", "degraded"]);
                assert_eq!(args.timeout, 600);
            }
            _ => panic!("expected wait"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["hostctl", "lock", "compute-0", "--force", "--json"]);
        assert!(cli.json);
        assert!(matches!(cli.command, Command::Lock { force: true, .. }));
    }
}
