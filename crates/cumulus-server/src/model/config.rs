//! Configuration loading for the Cumulus server
//!
//! Sources, lowest precedence first: `conf/application.yml` (or the file given
//! with `--config`), environment variables such as `CUMULUS_LAN_PORT` for
//! `cumulus.lan.port`, then command line overrides.

use std::path::Path;

use clap::Parser;
use config::{Config, Environment};

use cumulus_core::Configuration;

const DEFAULT_CONFIG_FILE: &str = "conf/application.yml";

/// Command line arguments for the server
#[derive(Debug, Default, Parser)]
#[command(name = "cumulus-server", version, about = "Cumulus cluster member")]
pub struct Cli {
    /// Configuration file (default: conf/application.yml)
    #[arg(short = 'c', long = "config")]
    pub config: Option<String>,
    /// Node name
    #[arg(short = 'n', long = "name")]
    pub name: Option<String>,
    /// Address other members dial on the local network
    #[arg(long = "lan-address")]
    pub lan_address: Option<String>,
    /// Port of the LAN address
    #[arg(short = 'p', long = "lan-port")]
    pub lan_port: Option<u16>,
    /// Comma separated static members, `host:port[?wan=host:port&dc=name]`
    #[arg(short = 'm', long = "members", env = "CUMULUS_MEMBERS")]
    pub members: Option<String>,
}

/// Build the layered configuration for `cli`
pub fn load_configuration(cli: &Cli) -> anyhow::Result<Configuration> {
    let mut builder = Config::builder();

    match &cli.config {
        Some(file) => {
            if !Path::new(file).exists() {
                anyhow::bail!("configuration file '{}' does not exist", file);
            }
            builder = builder.add_source(config::File::with_name(file));
        }
        None => {
            builder =
                builder.add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false));
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("cumulus")
            .separator("_")
            .try_parsing(true)
            .keep_prefix(true),
    );

    if let Some(v) = &cli.name {
        builder = builder.set_override("cumulus.node.name", v.as_str())?;
    }
    if let Some(v) = &cli.lan_address {
        builder = builder.set_override("cumulus.lan.address", v.as_str())?;
    }
    if let Some(v) = cli.lan_port {
        builder = builder.set_override("cumulus.lan.port", i64::from(v))?;
    }
    if let Some(v) = &cli.members {
        builder = builder.set_override("cumulus.member.list", v.as_str())?;
    }

    let config = builder
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build configuration: {}", e))?;
    Ok(Configuration::from_config(config))
}
