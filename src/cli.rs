//! Command-line surface: `relayplane-proxy` runs the server; a `config`
//! subcommand inspects or resets the on-disk JSON config. Grounded on
//! main.rs's clap-derive `Cli`/`Commands` shape, cut down from the
//! ancestor's theme/feature/TOML-editing subcommands to what this JSON
//! config actually has.

use crate::config::Config;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "relayplane-proxy", version = crate::config::VERSION, about = "Local LLM routing proxy")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Override the bind address, e.g. 127.0.0.1:4100.
    #[arg(long)]
    pub bind: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Inspect or reset the on-disk config file.
    Config {
        #[arg(long)]
        show: bool,
        #[arg(long)]
        path: bool,
        #[arg(long)]
        reset: bool,
    },
}

/// Handles a CLI subcommand if one was given. Returns `true` if the
/// process should exit immediately (the subcommand fully handled the
/// invocation and the server should not start).
pub fn handle_cli(cli: &Cli) -> bool {
    let Some(Commands::Config { show, path, reset }) = &cli.command else {
        return false;
    };

    if *path {
        match Config::config_path() {
            Some(p) => println!("{}", p.display()),
            None => println!("(no home directory - using built-in defaults)"),
        }
    }

    if *reset {
        match Config::default().persist_template() {
            Ok(()) => println!("config reset to defaults"),
            Err(e) => eprintln!("failed to reset config: {e}"),
        }
    }

    if *show {
        match Config::load() {
            Ok(config) => println!("{}", config.to_json_template()),
            Err(e) => eprintln!("failed to load config: {e}"),
        }
    }

    true
}
