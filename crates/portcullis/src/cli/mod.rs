//! CLI command definitions and handlers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use tokio::io::AsyncReadExt;

use portcullis_common::{ContainerId, PortcullisPaths};
use portcullis_network::host::{BridgeControlPlane, HostInterfaces, ShellRunner};
use portcullis_network::{
    Capabilities, CommandRunner, NetworkConfig, NetworkManager, PortPool, UpInputs,
};

/// portcullis - container network plumbing
#[derive(Parser)]
#[command(name = "portcullis")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory for portcullis state
    #[arg(
        long,
        global = true,
        env = "PORTCULLIS_ROOT",
        default_value = "/var/lib/portcullis"
    )]
    pub root: PathBuf,

    /// Host network configuration file (JSON)
    #[arg(long, global = true, env = "PORTCULLIS_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Network commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Provision networking for a container; reads the request on stdin
    Up {
        /// Container handle
        #[arg(long)]
        handle: String,
    },

    /// Tear down networking for a container
    Down {
        /// Container handle
        #[arg(long)]
        handle: String,
    },

    /// Create the shared NAT network
    CreateNetwork,

    /// Delete the shared NAT network
    DeleteNetwork,
}

impl Cli {
    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns the failing operation's error with its context.
    pub async fn execute(self) -> Result<()> {
        let config = match &self.config_file {
            Some(path) => NetworkConfig::load(path)?,
            None => NetworkConfig::default(),
        };

        let paths = PortcullisPaths::with_root(&self.root);
        paths
            .ensure()
            .wrap_err_with(|| format!("Failed to create {}", paths.root.display()))?;

        let manager = NetworkManager::new(config.clone(), capabilities(&config, &paths));

        match self.command {
            Commands::Up { handle } => {
                let container_id = ContainerId::new(handle)?;

                let mut input = String::new();
                tokio::io::stdin().read_to_string(&mut input).await?;
                let inputs: UpInputs = if input.trim().is_empty() {
                    UpInputs::default()
                } else {
                    serde_json::from_str(&input).wrap_err("Failed to parse up input")?
                };

                let outputs = manager.up(&container_id, &inputs).await?;
                println!("{}", serde_json::to_string(&outputs)?);
                Ok(())
            }

            Commands::Down { handle } => {
                let container_id = ContainerId::new(handle)?;
                manager.down(&container_id).await?;
                Ok(())
            }

            Commands::CreateNetwork => {
                let network = manager.create_host_nat_network().await?;
                tracing::info!(network = %network.name, id = %network.id, "NAT network ready");
                Ok(())
            }

            Commands::DeleteNetwork => {
                manager.delete_host_nat_network().await?;
                Ok(())
            }
        }
    }
}

/// Wire the Linux host backend.
#[must_use]
pub fn capabilities(config: &NetworkConfig, paths: &PortcullisPaths) -> Capabilities {
    let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner::new(
        paths,
        Duration::from_secs(config.command_timeout_secs),
    ));

    Capabilities {
        control_plane: Arc::new(BridgeControlPlane::new(runner.clone(), paths.clone())),
        ports: Arc::new(PortPool::new(
            paths.port_pool(),
            config.port_range_start,
            config.port_range_capacity,
        )),
        interfaces: Arc::new(HostInterfaces::new(runner.clone())),
        runner,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "portcullis",
            "up",
            "--handle",
            "web-1",
            "--root",
            "/tmp/pcl",
            "--debug",
        ])
        .unwrap();

        assert!(cli.debug);
        assert_eq!(cli.root, PathBuf::from("/tmp/pcl"));
        assert!(matches!(&cli.command, Commands::Up { handle } if handle == "web-1"));
    }

    #[test]
    fn handle_is_required() {
        assert!(Cli::try_parse_from(["portcullis", "down"]).is_err());
    }

    #[test]
    fn network_commands_are_kebab_case() {
        let cli = Cli::try_parse_from(["portcullis", "create-network"]).unwrap();
        assert!(matches!(cli.command, Commands::CreateNetwork));

        let cli = Cli::try_parse_from(["portcullis", "delete-network"]).unwrap();
        assert!(matches!(cli.command, Commands::DeleteNetwork));
    }
}
