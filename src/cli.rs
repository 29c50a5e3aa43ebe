//! Command line: the daemon itself plus thin clients over the control API.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::client::PeerClient;
use crate::config::{Config, ConfigOverrides};
use crate::loader::read_definition;

#[derive(Debug, Parser)]
#[command(name = "convoy", version, about = "Keeps containers in line with service definitions")]
pub struct Cli {
    #[command(flatten)]
    pub overrides: ConfigOverrides,

    /// Control API of the node to talk to (client commands)
    #[arg(long, global = true)]
    pub host: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run as a daemon
    Daemon,
    /// Push definition files to a node
    Push {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// List the services a node knows
    List,
    /// Show one service
    Get { name: String },
    /// Pull a service's image on one node
    Pull { name: String },
    /// Pull a service's image on every member of the cluster
    PullAll { name: String },
    /// Show the membership view of a node
    Members,
    /// Check that a node is up
    Health,
}

fn base_url(host: Option<&str>, config: &Config) -> String {
    match host {
        Some(h) if h.starts_with("http://") || h.starts_with("https://") => {
            h.trim_end_matches('/').to_string()
        }
        Some(h) => format!("http://{}", h.trim_end_matches('/')),
        None => format!("http://127.0.0.1:{}", config.http_port),
    }
}

/// Runs a client command against `host`.
pub async fn run_client(config: &Config, host: Option<&str>, command: Command) -> anyhow::Result<()> {
    let base = base_url(host, config);
    let client = PeerClient::new(config.peer_timeout(), config.api_key.clone())?;

    match command {
        Command::Daemon => anyhow::bail!("daemon mode is not a client command"),
        Command::Push { files } => {
            let specs = files
                .iter()
                .map(|path| read_definition(path))
                .collect::<Result<Vec<_>, _>>()?;
            let summary = client.put_services(&base, &specs).await?;
            for name in summary.accepted {
                println!("accepted {}", name);
            }
            for name in summary.rejected {
                println!("rejected {}", name);
            }
        }
        Command::List => {
            let specs = client.list_services(&base).await?;
            println!("{}", serde_json::to_string_pretty(&specs)?);
        }
        Command::Get { name } => match client.get_service(&base, &name).await? {
            Some(spec) => println!("{}", serde_json::to_string_pretty(&spec)?),
            None => anyhow::bail!("service {} not found on {}", name, base),
        },
        Command::Pull { name } => {
            client
                .pull(&base, &name)
                .await
                .with_context(|| format!("pull of {} failed", name))?;
            println!("pulled {}", name);
        }
        Command::PullAll { name } => {
            let fanout = client.propagate_and_pull(&base, &name).await?;
            println!("{} reached, {} failed", fanout.reached, fanout.failed);
        }
        Command::Members => {
            for member in client.members(&base).await? {
                println!("{}\t{}", member.id, member.base_url());
            }
        }
        Command::Health => {
            client.health(&base).await?;
            println!("ok");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "convoy", "daemon", "--dir", "/srv/defs", "--node", "api-box-1", "--join", "10.0.0.1:7946",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Daemon));
        assert_eq!(cli.overrides.dir, Some(PathBuf::from("/srv/defs")));
        assert_eq!(cli.overrides.node_name.as_deref(), Some("api-box-1"));
        assert_eq!(cli.overrides.join.as_deref(), Some("10.0.0.1:7946"));
    }

    #[test]
    fn push_requires_files() {
        assert!(Cli::try_parse_from(["convoy", "push"]).is_err());
        let cli = Cli::try_parse_from(["convoy", "--host", "node-b:7947", "push", "a.yml"]).unwrap();
        assert_eq!(cli.host.as_deref(), Some("node-b:7947"));
    }

    #[test]
    fn host_defaults_to_local_control_port() {
        let config = Config::default();
        assert_eq!(base_url(None, &config), "http://127.0.0.1:7947");
        assert_eq!(base_url(Some("node-b:9000/"), &config), "http://node-b:9000");
        assert_eq!(base_url(Some("https://n:1"), &config), "https://n:1");
    }
}
