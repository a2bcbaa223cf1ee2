//! `mbtcp` command-line entry point.
//!
//! `serve` runs a Modbus TCP device until SIGTERM/SIGINT; `read` and
//! `write` perform one client transaction against a running device.

mod signals;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mbtcp_client::ModbusTcpClient;
use mbtcp_common::config::{ClientConfig, MbtcpConfig, RegisterLayout, ServerConfig};
use mbtcp_server::ModbusTcpServer;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::signals::{wait_for_shutdown, SignalHandler};

/// How often the serve loop logs a status line.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// mbtcp command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "mbtcp",
    about = "Modbus TCP register device and client",
    version,
    long_about = None
)]
struct Args {
    /// Path to a configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a Modbus TCP device until interrupted.
    Serve {
        /// Listen address (overrides config file).
        #[arg(long, short = 'b', value_name = "ADDR")]
        bind: Option<String>,

        /// Registers per bank (overrides config file).
        #[arg(long)]
        bank_size: Option<usize>,

        /// Back all four register types with one bank.
        #[arg(long)]
        aliased: bool,
    },

    /// Read holding registers from a device.
    Read {
        /// First register address.
        address: u16,

        /// Number of registers to read.
        #[arg(long, short = 'n', default_value = "1")]
        count: u16,

        /// Device address (overrides config file).
        #[arg(long, short = 's', value_name = "ADDR")]
        server: Option<String>,

        /// Unit identifier (overrides config file).
        #[arg(long, short = 'u')]
        unit: Option<u8>,
    },

    /// Write holding registers on a device.
    Write {
        /// First register address.
        address: u16,

        /// Values to write to consecutive registers.
        #[arg(required = true, num_args = 1..)]
        values: Vec<u16>,

        /// Device address (overrides config file).
        #[arg(long, short = 's', value_name = "ADDR")]
        server: Option<String>,

        /// Unit identifier (overrides config file).
        #[arg(long, short = 'u')]
        unit: Option<u8>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level);

    let config = load_config(&args)?;

    match args.command {
        Command::Serve {
            bind,
            bank_size,
            aliased,
        } => {
            let mut server_config = config.server;
            if let Some(bind) = bind {
                server_config.bind_address = bind;
            }
            if let Some(bank_size) = bank_size {
                server_config.bank_size = bank_size;
            }
            if aliased {
                server_config.layout = RegisterLayout::Aliased;
            }
            // Re-check values overridden on the command line
            MbtcpConfig {
                server: server_config.clone(),
                client: config.client,
            }
            .validate()?;

            let signal_handler =
                SignalHandler::install().context("Failed to set up signal handlers")?;
            serve(&server_config, &signal_handler)
        }
        Command::Read {
            address,
            count,
            server,
            unit,
        } => {
            let client_config = client_config(config.client, server, unit);
            let mut client = connect(&client_config)?;
            let values = client
                .read_registers(address, count)
                .with_context(|| format!("Failed to read {count} registers at {address}"))?;
            for (offset, value) in values.iter().enumerate() {
                println!("{}: {value}", usize::from(address) + offset);
            }
            Ok(())
        }
        Command::Write {
            address,
            values,
            server,
            unit,
        } => {
            let client_config = client_config(config.client, server, unit);
            let mut client = connect(&client_config)?;
            let written = match values.as_slice() {
                [value] => client.write_register(address, *value),
                values => client.write_registers(address, values),
            };
            written.with_context(|| {
                format!("Failed to write {} registers at {address}", values.len())
            })?;
            info!(address, count = values.len(), "Registers written");
            Ok(())
        }
    }
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!(
        "mbtcp={level},mbtcp_common={level},mbtcp_protocol={level},mbtcp_client={level},mbtcp_server={level}"
    );

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `MBTCP_CONFIG_PATH` environment variable
/// 3. `/etc/mbtcp/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<MbtcpConfig> {
    // 1. Command-line argument (highest priority)
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return MbtcpConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {config_path:?}"));
    }

    // 2. Environment variable
    if let Ok(env_path) = std::env::var("MBTCP_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from MBTCP_CONFIG_PATH");
            return MbtcpConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from MBTCP_CONFIG_PATH={env_path:?}")
            });
        }
        warn!(
            path = %env_path,
            "MBTCP_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    // 3. System path, then 4. local development path
    for path in ["/etc/mbtcp/config.toml", "config/default.toml"] {
        let config_path = PathBuf::from(path);
        if config_path.exists() {
            info!(?config_path, "Loading config");
            return MbtcpConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {config_path:?}"));
        }
    }

    // 5. Built-in defaults
    info!("No config file found, using built-in defaults");
    Ok(MbtcpConfig::default())
}

fn client_config(mut config: ClientConfig, server: Option<String>, unit: Option<u8>) -> ClientConfig {
    if let Some(server) = server {
        config.server_address = server;
    }
    if let Some(unit) = unit {
        config.unit_id = unit;
    }
    config
}

fn connect(config: &ClientConfig) -> Result<ModbusTcpClient> {
    ModbusTcpClient::connect(config)
        .with_context(|| format!("Failed to connect to {}", config.server_address))
}

/// Serve until a shutdown signal arrives.
fn serve(config: &ServerConfig, signal_handler: &SignalHandler) -> Result<()> {
    let server = ModbusTcpServer::bind(config)
        .with_context(|| format!("Failed to start server on {}", config.bind_address))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %server.local_addr(),
        "mbtcp device running"
    );

    let started = Instant::now();
    let mut last_status = Instant::now();

    while !wait_for_shutdown(signal_handler, config.poll_interval) {
        if signal_handler.take_reload_request() {
            warn!("Reload signal received; restart the device to apply configuration changes");
        }

        if last_status.elapsed() >= STATUS_INTERVAL {
            info!(
                sessions = server.active_sessions(),
                uptime_secs = started.elapsed().as_secs(),
                "Periodic status"
            );
            last_status = Instant::now();
        }
    }

    info!("Shutting down...");
    server.stop();

    info!(
        signals = signal_handler.state().signal_count(),
        last_signal = ?signal_handler.state().last_signal(),
        uptime_secs = started.elapsed().as_secs(),
        "Device shutdown complete"
    );
    Ok(())
}
