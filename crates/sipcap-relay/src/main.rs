// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! sipcap-relay - Relay captured SIP packets to a Redis work queue.
//!
//! Usage:
//!   sipcap-relay --group 10 --queue-host 127.0.0.1
//!   sipcap-relay --config relay.toml
//!   sipcap-relay gen-config --output relay.toml
//!   sipcap-relay validate --config relay.toml

use anyhow::Context;
use clap::{Parser, Subcommand};
use sipcap_relay::{capture, Dispatcher, QueueClient, RelayConfig, ShutdownToken};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sipcap-relay")]
#[command(about = "Relay NFLOG-captured SIP packets into a Redis work queue")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Queue service host
    #[arg(long)]
    queue_host: Option<String>,

    /// Queue service port
    #[arg(long)]
    queue_port: Option<u16>,

    /// List key records are pushed to
    #[arg(long)]
    queue_key: Option<String>,

    /// NFLOG group to capture from
    #[arg(short, long)]
    group: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "sipcap-relay.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    let result = match args.command {
        Some(Commands::GenConfig { ref output }) => {
            init_logging(args.log_level.as_deref().unwrap_or("info"));
            cmd_gen_config(output)
        }
        Some(Commands::Validate { ref config }) => {
            init_logging(args.log_level.as_deref().unwrap_or("info"));
            cmd_validate(config)
        }
        None => match build_config(&args) {
            Ok(config) => {
                init_logging(&config.log_level);
                run(config)
            }
            Err(e) => {
                eprintln!("Error: {:#}", e);
                return ExitCode::FAILURE;
            }
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn build_config(args: &Args) -> anyhow::Result<RelayConfig> {
    let mut config = match &args.config {
        Some(path) => RelayConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RelayConfig::default(),
    };

    if let Some(host) = &args.queue_host {
        config.queue_host = host.clone();
    }
    if let Some(port) = args.queue_port {
        config.queue_port = port;
    }
    if let Some(key) = &args.queue_key {
        config.queue_key = key.clone();
    }
    if let Some(group) = args.group {
        config.capture_group = group;
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

fn run(config: RelayConfig) -> anyhow::Result<()> {
    info!("sipcap-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Queue: {}:{} key {}",
        config.queue_host, config.queue_port, config.queue_key
    );

    let shutdown = ShutdownToken::new();
    let token = shutdown.clone();
    ctrlc::set_handler(move || {
        token.request();
    })
    .context("installing signal handler")?;

    let mut queue =
        QueueClient::new(config.transport(), config.queue_key.clone(), shutdown.clone());
    if queue.reconnect_until_healthy().is_err() {
        info!("Shutdown requested before capture started");
        return Ok(());
    }

    let mut source = capture::open_default(config.capture_group, config.copy_range)?;

    let mut dispatcher = Dispatcher::new(config.encoder(), config.classifier(), queue, shutdown)
        .with_stats_interval(config.stats_interval());

    info!("Capture started. Press Ctrl+C to stop.");
    let result = dispatcher.run(&mut source);

    info!("{}", dispatcher.counters());
    result?;
    Ok(())
}

fn cmd_gen_config(output: &Path) -> anyhow::Result<()> {
    let toml_str = toml::to_string_pretty(&RelayConfig::default())?;

    let content = format!(
        r#"# sipcap-relay configuration
# Generated by sipcap-relay gen-config

{}
"#,
        toml_str
    );

    std::fs::write(output, content)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: &Path) -> anyhow::Result<()> {
    let config = RelayConfig::from_file(config_path)
        .with_context(|| format!("Configuration invalid: {}", config_path.display()))?;

    println!("Configuration valid!");
    println!();
    println!(
        "Queue:    {}:{} ({})",
        config.queue_host, config.queue_port, config.queue_key
    );
    println!("Group:    {}", config.capture_group);
    println!("Excluded: {}", config.excluded_methods.join(", "));
    Ok(())
}
