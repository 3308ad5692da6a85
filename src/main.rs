// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use inventa_agent::DirectTransportFactory;
use inventa_model::{default_entry, list_models};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Completions { shell }) => {
            cli::print_completions(*shell);
            Ok(())
        }
        Some(Commands::ShowConfig) => {
            let config = inventa_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config.redacted())?);
            Ok(())
        }
        Some(Commands::ListModels { json }) => {
            let config = inventa_config::load(cli.config.as_deref())?;
            init_logging(cli.verbose, &config.log.level);
            let models = list_models(&config).await;
            if *json {
                println!("{}", serde_json::to_string_pretty(&models)?);
            } else {
                println!("{:<16} {:<24} {:<12} {:>9}  available", "ID", "NAME", "PROVIDER", "CONTEXT");
                for m in models {
                    println!(
                        "{:<16} {:<24} {:<12} {:>9}  {}",
                        m.id,
                        m.name,
                        m.provider,
                        m.context_length,
                        if m.available { "yes" } else { "no" },
                    );
                }
            }
            Ok(())
        }
        Some(Commands::Serve { bind }) => run_serve(&cli, bind.clone()).await,
        None => run_serve(&cli, None).await,
    }
}

async fn run_serve(cli: &Cli, bind_override: Option<String>) -> anyhow::Result<()> {
    let mut config = inventa_config::load(cli.config.as_deref())?;
    if let Some(bind) = bind_override {
        config.server.bind = bind;
    }
    init_logging(cli.verbose, &config.log.level);

    // Fail fast, naming every missing key at once.
    config.validate()?;

    let config = Arc::new(config);
    let factory = Arc::new(DirectTransportFactory::new(config.clone()));

    info!(
        version = env!("CARGO_PKG_VERSION"),
        model = default_entry(&config).id,
        tool_server = config.tool_server.command.as_deref().unwrap_or(""),
        "starting inventa gateway",
    );

    inventa_gateway::serve(config, factory).await?;
    Ok(())
}

/// Filter precedence: `RUST_LOG` env, then `-v` flags, then the configured
/// `log.level`.
fn init_logging(verbosity: u8, config_level: &str) {
    let level = match verbosity {
        0 => config_level,
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}
