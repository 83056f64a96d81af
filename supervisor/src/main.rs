//! Self-upgrade supervisor CLI.
//!
//! `supervisor run` watches the configured sources and upgrades the live
//! payload in place; the other commands are one-shot operator tools over the
//! same pipeline and version archive.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use supervisor::error::StartupError;
use supervisor::exit_codes;
use supervisor::host::{self, Host, RunOptions};
use supervisor::io::init::{InitOptions, init_state};
use supervisor::io::validator::SELF_TEST_FLAG;
use supervisor::logging;

#[derive(Parser)]
#[command(
    name = "supervisor",
    version,
    about = "Validate, commit and restart into new versions of a long-running agent"
)]
struct Cli {
    /// Config file (default: ./supervisor.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config and create the state directories.
    Init {
        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
    },
    /// Watch paste input, the hub directory and the chat export for upgrades.
    Run {
        /// Do not read paste captures from stdin.
        #[arg(long)]
        no_stdin: bool,
    },
    /// Run one upgrade attempt for a file (`-` reads stdin). Does not restart.
    Submit {
        file: PathBuf,
        /// Provenance recorded with the candidate.
        #[arg(long)]
        reason: Option<String>,
    },
    /// Self-test a file (`-` reads stdin) without committing it.
    Check { file: PathBuf },
    /// List archived versions, oldest first.
    Versions,
    /// Print an archived payload.
    Show { id: String },
    /// Make an archived version live again (validated like any candidate).
    Rollback { id: String },
}

fn main() {
    // The supervisor answers its own self-test before touching config or disk,
    // so a new build of it can be validated by an older one.
    if std::env::args_os().skip(1).any(|arg| arg == SELF_TEST_FLAG) {
        println!("ready");
        std::process::exit(exit_codes::OK);
    }

    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            if err.downcast_ref::<StartupError>().is_some() {
                exit_codes::ENVIRONMENT
            } else {
                exit_codes::INVALID
            }
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() {
                exit_codes::INVALID
            } else {
                exit_codes::OK
            };
            err.print()?;
            return Ok(code);
        }
    };
    let config_path = host::config_path(cli.config);
    match cli.command {
        Command::Init { force } => {
            let paths = init_state(&config_path, &InitOptions { force })?;
            println!("wrote {}", config_path.display());
            println!("state directory {}", paths.state_dir.display());
            Ok(exit_codes::OK)
        }
        Command::Run { no_stdin } => {
            let host = Host::load(&config_path)?;
            host::run(
                &host,
                RunOptions {
                    read_stdin: !no_stdin,
                },
            )
        }
        Command::Submit { file, reason } => {
            let host = Host::load(&config_path)?;
            let candidate = host::read_candidate(&file, reason.as_deref())?;
            host::submit_once(&host, candidate)
        }
        Command::Check { file } => {
            let host = Host::load(&config_path)?;
            let candidate = host::read_candidate(&file, Some("check"))?;
            host::check(&host, &candidate)
        }
        Command::Versions => {
            let host = Host::load(&config_path)?;
            for row in host::versions(&host)? {
                println!(
                    "{}  {}  {:>8} bytes  {}",
                    row.id, row.stored_at, row.bytes, row.digest
                );
            }
            Ok(exit_codes::OK)
        }
        Command::Show { id } => {
            let host = Host::load(&config_path)?;
            print!("{}", host::show(&host, &id)?);
            Ok(exit_codes::OK)
        }
        Command::Rollback { id } => {
            let host = Host::load(&config_path)?;
            host::rollback(&host, &id)
        }
    }
}
