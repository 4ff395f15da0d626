use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "gatekeeper")]
#[command(version, about = "Run-state gatekeeper for workflow execution streams")]
pub struct Cli {
    /// Log at debug level (overridden by GATEKEEPER_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to gatekeeper.toml
    #[arg(long, global = true, default_value = gatekeeper::config::CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Consume the command and status streams and publish accepted messages
    Serve {
        /// Address for the command-stream ingress
        #[arg(long)]
        command_addr: Option<String>,

        /// Address for the status-stream ingress
        #[arg(long)]
        status_addr: Option<String>,

        /// Persist runs in SQLite at this path
        #[arg(long, env = "GATEKEEPER_STORE_PATH")]
        db_path: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Print the run-state transition table
    Transitions {
        /// Only show transitions out of this state
        #[arg(long)]
        from: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default gatekeeper.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve {
            command_addr,
            status_addr,
            db_path,
        } => {
            let overrides = cmd::ServeOverrides {
                command_addr: command_addr.clone(),
                status_addr: status_addr.clone(),
                db_path: db_path.clone(),
                verbose: cli.verbose,
            };
            cmd::cmd_serve(&cli.config, overrides).await?;
        }
        Commands::Config { command } => cmd::cmd_config(&cli.config, command.clone())?,
        Commands::Transitions { from } => cmd::cmd_transitions(from.as_deref())?,
    }

    Ok(())
}
