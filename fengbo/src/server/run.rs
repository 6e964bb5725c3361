// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use clap::Parser;
use std::path::{Path, PathBuf};
use tokio::runtime::Runtime;

use super::ServerContext;
use crate::config::Config;
use crate::error::{Error, ErrorKind};
use crate::log::init_log;

pub const DEFAULT_CONFIG: &str = "/etc/fengbo/fengbo.toml";

#[derive(Debug, Parser)]
#[command(name = "fengbo", about = "MQTT 3.1 broker", version)]
struct Opts {
    /// Specify config file path.
    #[arg(short, long, value_name = "config_file")]
    config: Option<PathBuf>,

    /// Override the port of the default listener.
    #[arg(short, long)]
    port: Option<u16>,

    /// Test config file and exit.
    #[arg(short, long)]
    test: bool,

    /// Reload config of a running broker.
    #[arg(short, long)]
    reload: bool,

    /// Stop a running broker.
    #[arg(short, long)]
    stop: bool,
}

/// Entry point of the server.
///
/// # Errors
///
/// Returns error if config is invalid or the server fails to start.
pub fn run_server() -> Result<(), Error> {
    let opts = Opts::parse();

    let config_file = match &opts.config {
        Some(config_file) => Some(config_file.clone()),
        None => {
            if Path::new(DEFAULT_CONFIG).exists() {
                Some(PathBuf::from(DEFAULT_CONFIG))
            } else {
                None
            }
        }
    };

    let mut config = if let Some(config_file) = &config_file {
        let config_content = std::fs::read_to_string(config_file)?;
        let config: Config = toml::from_str(&config_content).map_err(|err| {
            Error::from_string(ErrorKind::ConfigError, format!("Invalid config: {err:?}"))
        })?;

        config.validate()?;

        if opts.test {
            println!("The configuration file {} syntax is Ok", config_file.display());
            return Ok(());
        }
        config
    } else {
        Config::default()
    };

    if let Some(port) = opts.port {
        config.set_default_listener_port(port);
    }

    init_log(config.log())?;

    let mut server = ServerContext::new(config);

    if opts.reload {
        return server.send_reload_signal();
    }

    if opts.stop {
        return server.send_stop_signal();
    }

    let runtime = Runtime::new()?;
    server.run_loop(&runtime)
}

/// Run server with predefined config.
///
/// Useful for integration tests.
///
/// # Errors
///
/// Returns error if the server fails to start.
pub fn run_server_with_config(config: Config) -> Result<(), Error> {
    init_log(config.log())?;
    let mut server = ServerContext::new(config);
    let runtime = Runtime::new()?;
    server.run_loop(&runtime)
}
