use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::process::Command;
use tracing_subscriber::EnvFilter;

use hostbridge_lib::bridge::{with_timeout, CapabilityBridge};
use hostbridge_lib::capabilities::builtin_registry;
use hostbridge_lib::config::BridgeConfig;
use hostbridge_lib::host;
use hostbridge_lib::transport::HostProcess;

#[derive(Parser)]
#[command(name = "hostbridge", about = "Whitelisted capability bridge to the host machine")]
struct Cli {
    /// Config file (defaults to $HOSTBRIDGE_CONFIG or the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the built-in capabilities over stdin/stdout
    Host,
    /// Call one capability through a freshly spawned host
    Call {
        /// Capability name, e.g. get-power-information
        name: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// List the capabilities the host registers
    Capabilities,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => BridgeConfig::load(path),
        None => BridgeConfig::load_default(),
    }
    .context("Failed to load config")?;

    // stdout carries frames in host mode, so logs always go to stderr.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    match cli.command {
        Commands::Host => run_host(&config).await,
        Commands::Call { name, args } => {
            run_call(&config, cli.config.as_deref(), &name, &args).await
        }
        Commands::Capabilities => {
            let registry = builtin_registry(config.host_context())?;
            println!("{}", serde_json::to_string_pretty(&registry.descriptors())?);
            Ok(())
        }
    }
}

async fn run_host(config: &BridgeConfig) -> Result<()> {
    let registry = builtin_registry(config.host_context())?;
    tracing::info!(
        "hostbridge host {} serving {} capabilities",
        env!("CARGO_PKG_VERSION"),
        registry.descriptors().len()
    );
    host::serve_stdio(Arc::new(registry)).await?;
    Ok(())
}

async fn run_call(
    config: &BridgeConfig,
    config_path: Option<&Path>,
    name: &str,
    args: &str,
) -> Result<()> {
    let args: Value = serde_json::from_str(args).context("--args must be valid JSON")?;

    let bridge = CapabilityBridge::new(config.whitelist()?);
    if !bridge.whitelist().contains(name) {
        anyhow::bail!("'{}' is not a whitelisted capability", name);
    }

    let mut command = Command::new(std::env::current_exe()?);
    if let Some(path) = config_path {
        command.arg("--config").arg(path);
    }
    command.arg("host");

    let host = HostProcess::spawn(command)?;
    let surface = bridge.expose(host.transport());
    let handle = surface
        .get(name)
        .with_context(|| format!("'{}' is not on the surface", name))?;

    let pending = handle.call(args);
    let result = match config.call_timeout() {
        Some(timeout) => with_timeout(timeout, pending).await,
        None => pending.await,
    };
    host.shutdown().await?;

    let value = result?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
