//! Configuration loading: defaults, TOML file, environment, CLI flags.

use anyhow::{bail, Context, Result};
use clap::Parser;
use config::Config as ConfigLoader;
use std::path::Path;

use super::ServerConfig;

/// Command-line interface for the server.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "QUIC handshake-terminating UDP daemon", long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (TOML format)
    #[arg(long, short = 'c', default_value = "quend.toml")]
    pub config: String,

    /// Host address to bind to (overrides config file)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides config file)
    #[arg(long)]
    pub port: Option<u16>,

    /// Log level (overrides config file)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate: bool,

    /// Print default configuration and exit
    #[arg(long)]
    pub print_default_config: bool,
}

/// Load and parse server configuration with the precedence
/// defaults < file < environment (`QUEND_` prefix) < command line.
pub fn load_config() -> Result<ServerConfig> {
    let cli = CliArgs::parse();

    if cli.print_default_config {
        let rendered = toml::to_string_pretty(&ServerConfig::default())
            .context("rendering default configuration")?;
        println!("{}", rendered);
        std::process::exit(0);
    }

    let mut config = load_from_sources(&cli.config)?;
    apply_cli_overrides(&mut config, &cli);

    if let Err(errors) = config.validate() {
        bail!("invalid configuration:\n  {}", errors.join("\n  "));
    }

    if cli.validate {
        println!("configuration OK");
        std::process::exit(0);
    }

    Ok(config)
}

fn load_from_sources(path: &str) -> Result<ServerConfig> {
    let mut builder = ConfigLoader::builder();

    if Path::new(path).exists() {
        builder = builder.add_source(config::File::with_name(path));
    }
    builder = builder.add_source(
        config::Environment::with_prefix("QUEND")
            .separator("__")
            .try_parsing(true),
    );

    builder
        .build()
        .context("building configuration")?
        .try_deserialize::<ServerConfig>()
        .context("parsing configuration")
}

fn apply_cli_overrides(config: &mut ServerConfig, cli: &CliArgs) {
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(level) = &cli.log_level {
        config.telemetry.log_level = level.clone();
    }
}
