//! gridnoded — the gridnode provisioning daemon.
//!
//! Runs next to the container, VM, network, storage, flist, zdb and
//! identity services of a node and turns reservations published by the
//! registry into workloads on them.
//!
//! # Usage
//!
//! ```text
//! gridnoded init --node-id node-1 --output /etc/gridnode/gridnode.toml
//! gridnoded run --config /etc/gridnode/gridnode.toml
//! ```

mod daemon;
mod rpc;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use gridnode_types::NodeConfig;

const DEFAULT_FILTER: &str = "info,gridnode=debug";

#[derive(Parser)]
#[command(name = "gridnoded", about = "gridnode provisioning daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon.
    Run {
        /// Path to gridnode.toml.
        #[arg(long, default_value = "/etc/gridnode/gridnode.toml")]
        config: PathBuf,
    },
    /// Write a starter config with every service on localhost.
    Init {
        #[arg(long)]
        node_id: String,

        #[arg(long, default_value = "/var/lib/gridnode")]
        data_dir: PathBuf,

        #[arg(long, default_value = "gridnode.toml")]
        output: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run { config } => {
            let config = NodeConfig::from_file(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            daemon::run(config).await
        }
        Command::Init {
            node_id,
            data_dir,
            output,
            force,
        } => write_scaffold(&node_id, &data_dir, &output, force),
    }
}

fn write_scaffold(node_id: &str, data_dir: &Path, output: &Path, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }
    let config = NodeConfig::scaffold(node_id, data_dir);
    std::fs::write(output, config.to_toml_string()?)?;
    info!(path = %output.display(), "config written");
    Ok(())
}
