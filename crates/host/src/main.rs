//! Portlink Host
//!
//! Operator tool for the host configuration and its persisted connections.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use host::config::{default_config_path, Config};
use host::store::{load_address_set, save_address_set, JsonFileStore, KeyValueStore, PersistedAddress};

/// Portlink Host - connection registry tooling.
#[derive(Parser, Debug)]
#[command(name = "portlink-host")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Inspect the persisted connections
    #[command(subcommand)]
    Connections(ConnectionsCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },

    /// Check the configuration for invalid values
    Validate,
}

/// Subcommands for the persisted connections.
#[derive(Subcommand, Debug, Clone)]
pub enum ConnectionsCommands {
    /// List the persisted connections
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Forget persisted connections
    Forget {
        /// Only forget connections with this logical name
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Initialize tracing
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.host.log_level.clone()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            init_config(&config_path, force)?;
            println!("Wrote default configuration to {}", config_path.display());
        }
        Commands::Config(ConfigCommands::Validate) => match config.validate() {
            Ok(()) => println!("Configuration is valid"),
            Err(e) => {
                eprintln!("Invalid configuration: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Connections(command) => {
            config.validate()?;
            let store = JsonFileStore::new(config.store_path());
            let key = &config.registry.storage_key;

            match command {
                ConnectionsCommands::List { json } => {
                    let connections = load_address_set(&store, key).await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&connections)?);
                    } else {
                        print_connections_table(&connections);
                    }
                }
                ConnectionsCommands::Forget { name } => {
                    let removed = forget_connections(&store, key, name.as_deref()).await?;
                    println!("Forgot {} connection(s)", removed);
                }
            }
        }
    }

    Ok(())
}

/// Write the default configuration, refusing to overwrite unless forced.
fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(path)
}

/// Drop persisted connections, all of them or those named `name`.
/// Returns how many were removed.
async fn forget_connections<S: KeyValueStore>(
    store: &S,
    key: &str,
    name: Option<&str>,
) -> anyhow::Result<usize> {
    let mut connections = load_address_set(store, key).await?;
    let before = connections.len();
    match name {
        Some(name) => connections.retain(|entry| entry.logical_name != name),
        None => connections.clear(),
    }
    save_address_set(store, key, &connections).await?;
    Ok(before - connections.len())
}

fn print_connections_table(connections: &[PersistedAddress]) {
    if connections.is_empty() {
        println!("No persisted connections");
        return;
    }

    println!("{:<32} {:>10}", "LOGICAL NAME", "SESSION");
    for entry in connections {
        println!("{:<32} {:>10}", entry.logical_name, entry.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use host::store::MemoryStore;
    use protocol::SessionId;
    use tempfile::TempDir;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_config_show() {
        let cli = Cli::try_parse_from(["portlink-host", "config", "show"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Show)));
    }

    #[test]
    fn test_config_init_force() {
        let cli = Cli::try_parse_from(["portlink-host", "config", "init", "--force"]).unwrap();
        match cli.command {
            Commands::Config(ConfigCommands::Init { force }) => assert!(force),
            _ => panic!("Expected Config Init command"),
        }
    }

    #[test]
    fn test_connections_list_json() {
        let cli = Cli::try_parse_from(["portlink-host", "connections", "list", "--json"]).unwrap();
        match cli.command {
            Commands::Connections(ConnectionsCommands::List { json }) => assert!(json),
            _ => panic!("Expected Connections List command"),
        }
    }

    #[test]
    fn test_connections_forget_name() {
        let cli =
            Cli::try_parse_from(["portlink-host", "connections", "forget", "content"]).unwrap();
        match cli.command {
            Commands::Connections(ConnectionsCommands::Forget { name }) => {
                assert_eq!(name.as_deref(), Some("content"))
            }
            _ => panic!("Expected Connections Forget command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from([
            "portlink-host",
            "connections",
            "list",
            "--verbose",
            "--config",
            "/tmp/portlink.toml",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/portlink.toml")));
    }

    #[test]
    fn test_missing_subcommand_is_an_error() {
        assert!(Cli::try_parse_from(["portlink-host"]).is_err());
        assert!(Cli::try_parse_from(["portlink-host", "connections"]).is_err());
    }

    #[test]
    fn test_init_config_refuses_to_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        init_config(&path, false).unwrap();
        assert!(init_config(&path, false).is_err());
        init_config(&path, true).unwrap();
        assert_eq!(Config::load(&path).unwrap(), Config::default());
    }

    #[tokio::test]
    async fn test_forget_connections() {
        let store = MemoryStore::new();
        save_address_set(
            &store,
            "k",
            &[
                PersistedAddress::new("content", SessionId(1)),
                PersistedAddress::new("panel", SessionId(1)),
                PersistedAddress::new("content", SessionId(2)),
            ],
        )
        .await
        .unwrap();

        assert_eq!(forget_connections(&store, "k", Some("content")).await.unwrap(), 2);
        assert_eq!(
            load_address_set(&store, "k").await.unwrap(),
            vec![PersistedAddress::new("panel", SessionId(1))]
        );

        assert_eq!(forget_connections(&store, "k", None).await.unwrap(), 1);
        assert!(load_address_set(&store, "k").await.unwrap().is_empty());
    }
}
