// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::io;
use std::path::PathBuf;

use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};

#[derive(Parser)]
#[command(
    name = "inventa",
    version,
    about = "Natural-language gateway for querying network inventory"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Explicit config file, merged over the discovered layers
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG wins when set
    #[arg(long, short = 'v', global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway (the default when no subcommand is given)
    Serve {
        /// Override the configured bind address, e.g. 0.0.0.0:8765
        #[arg(long)]
        bind: Option<String>,
    },

    /// Print the effective configuration with secrets redacted
    ShowConfig,

    /// List the models the gateway offers, with availability
    ListModels {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion script
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn print_completions(shell: Shell) {
    generate(shell, &mut Cli::command(), "inventa", &mut io::stdout());
}
