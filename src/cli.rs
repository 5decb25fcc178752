use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "runvisor")]
#[command(about = "Self-hosted runner for Firecracker microVM jobs")]
#[command(version)]
pub struct Cli {
    /// Emit JSON log lines
    #[arg(long, global = true)]
    pub json: bool,

    /// OTLP collector endpoint for traces
    #[arg(long, global = true, env = "RUNVISOR_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the runner daemon until ctrl-c
    Start {
        #[arg(short, long)]
        config: PathBuf,

        /// Overrides `server.token` from the config file
        #[arg(long, env = "RUNVISOR_SERVER_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },

    /// Put a job on the local queue
    Submit {
        #[arg(short, long)]
        config: PathBuf,

        #[arg(long)]
        run_id: String,

        /// Execution context as a JSON file (`-` for stdin)
        #[arg(long)]
        context: Option<PathBuf>,

        /// Runner group; defaults to the config's group
        #[arg(long)]
        group: Option<String>,

        /// Lease TTL in seconds; defaults to `lease.ttl_secs`
        #[arg(long)]
        ttl_secs: Option<u64>,
    },

    /// Purge expired leases once
    Sweep {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Inspect the VM registry
    Registry {
        #[command(subcommand)]
        action: RegistryAction,
    },

    /// Validate a config file and print the effective settings
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Follow a run's events on a remote runner
    Watch {
        /// Runner API base URL, e.g. http://runner:9090
        #[arg(long)]
        url: String,

        #[arg(long)]
        run_id: String,

        #[arg(long, env = "RUNVISOR_SERVER_TOKEN", hide_env_values = true)]
        token: Option<String>,

        #[arg(long, default_value_t = 500)]
        poll_interval_ms: u64,
    },
}

#[derive(Subcommand, Debug)]
pub enum RegistryAction {
    /// List registered VMs
    List {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start() {
        let cli = Cli::try_parse_from(["runvisor", "--json", "start", "-c", "/etc/runvisor.yaml", "--token", "t"]).unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Start { config, token } => {
                assert_eq!(config, PathBuf::from("/etc/runvisor.yaml"));
                assert_eq!(token.as_deref(), Some("t"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_registry_list() {
        let cli = Cli::try_parse_from(["runvisor", "registry", "list", "--config", "r.yaml"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Registry { action: RegistryAction::List { .. } }
        ));
    }

    #[test]
    fn test_submit_requires_run_id() {
        assert!(Cli::try_parse_from(["runvisor", "submit", "-c", "r.yaml"]).is_err());
    }
}
