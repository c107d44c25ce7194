//! rcplink - remote control for networked audio devices
//!
//! Provides both a REPL and one-shot command execution.

mod commands;
mod repl;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use rcplink_client::{Client, SessionConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rcplink")]
#[command(about = "Remote control client for networked audio devices")]
#[command(version)]
struct Cli {
    /// Device host name or address
    #[arg(short = 'H', long, env = "RCPLINK_HOST")]
    host: Option<String>,

    /// Device port
    #[arg(short, long, env = "RCPLINK_PORT")]
    port: Option<u16>,

    /// Parameter catalog (YAML or JSON)
    #[arg(long, env = "RCPLINK_CATALOG")]
    catalog: Option<PathBuf>,

    /// Session config file (YAML)
    #[arg(long, env = "RCPLINK_CONFIG")]
    config: Option<PathBuf>,

    /// How long one-shot commands wait for the device, in milliseconds
    #[arg(long, default_value = "2000")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// A parameter coordinate.
#[derive(Args, Clone, Debug)]
pub struct Target {
    /// Parameter address, e.g. mixer:input:fader
    pub address: String,

    /// Row index
    #[arg(long, default_value_t = 0)]
    pub row: u32,

    /// Column index
    #[arg(long, default_value_t = 0)]
    pub column: u32,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start interactive REPL
    Repl,

    /// Read a parameter from the device
    Get {
        #[command(flatten)]
        target: Target,
    },

    /// Write a parameter (engineering units, e.g. -12.5 or on)
    Set {
        #[command(flatten)]
        target: Target,

        /// New value
        #[arg(allow_hyphen_values = true)]
        value: String,
    },

    /// Invert a boolean parameter
    Toggle {
        #[command(flatten)]
        target: Target,
    },

    /// Change a numeric parameter relative to its current value
    Adjust {
        #[command(flatten)]
        target: Target,

        /// Signed delta in engineering units, e.g. -3 or 0.5
        #[arg(allow_hyphen_values = true)]
        delta: String,
    },

    /// Print parameter changes until interrupted, reconnecting as needed
    Watch {
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,

        /// Parameters to poll on every connect (all rows and columns)
        addresses: Vec<String>,
    },

    /// Send one raw line and print what the device answers
    Raw {
        /// Line to send
        #[arg(allow_hyphen_values = true, num_args = 1..)]
        line: Vec<String>,

        /// How long to print inbound traffic, in milliseconds
        #[arg(long, default_value = "500")]
        window_ms: u64,
    },

    /// List the parameters in the catalog
    Params,
}

fn build_config(cli: &Cli) -> Result<SessionConfig, Box<dyn std::error::Error>> {
    let mut config = SessionConfig::load_from(cli.config.as_deref())?;
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(catalog) = &cli.catalog {
        config.catalog = Some(catalog.clone());
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Long-running commands report lifecycle at info level.
    let default_filter = match cli.command {
        Some(Commands::Watch { .. }) => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e);
        }
    };
    let addr = config.addr();
    let client = Client::from_config(config)?;
    let timeout = Duration::from_millis(cli.timeout_ms);

    match cli.command {
        Some(Commands::Repl) | None => {
            repl::run(client, &addr).await?;
        }
        Some(Commands::Params) => {
            println!("{}", commands::list_params(&client));
        }
        Some(Commands::Watch { json, addresses }) => {
            commands::watch(&client, json, &addresses).await?;
        }
        Some(cmd) => {
            // Connect for one-shot command
            client.connect().await.map_err(|e| {
                eprintln!("{}: {}", "Connection failed".red(), e);
                e
            })?;

            let result = commands::execute(&client, cmd, timeout).await;

            match result {
                Ok(output) => {
                    println!("{}", output);
                }
                Err(e) => {
                    eprintln!("{}: {}", "Error".red(), e);
                    let _ = client.close().await;
                    std::process::exit(1);
                }
            }

            client.close().await?;
        }
    }

    Ok(())
}
