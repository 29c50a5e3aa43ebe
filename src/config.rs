use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Args;
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Directory with one definition file per service.
    pub dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// Gossip address of a node to join, `host:port`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join: Option<String>,
    pub bind_ip: IpAddr,
    pub advertise_addr: String,
    pub gossip_port: u16,
    pub http_port: u16,
    pub interval_secs: u64,
    pub pull_every: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub peer_timeout_secs: u64,
    pub gossip_interval_ms: u64,
    pub failure_timeout_secs: u64,
    pub private_registry_pattern: String,
    pub private_pull_command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/etc/convoy"),
            node_name: None,
            join: None,
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            advertise_addr: "127.0.0.1".into(),
            gossip_port: 7946,
            http_port: 7947,
            interval_secs: 1,
            pull_every: 60,
            api_key: None,
            peer_timeout_secs: 5,
            gossip_interval_ms: 1000,
            failure_timeout_secs: 10,
            private_registry_pattern: r"^([a-z]+\.)?gcr\.io/".into(),
            private_pull_command: vec!["gcloud".into(), "docker".into(), "--".into(), "pull".into()],
        }
    }
}

/// Settings that can be overridden on the command line.
#[derive(Debug, Clone, Default, Args, Serialize)]
pub struct ConfigOverrides {
    /// Directory to load service definitions from
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,

    /// Name of this node; defaults to the host name
    #[arg(long = "node", global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Gossip address of a cluster member to join
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join: Option<String>,

    /// UDP port for membership gossip
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gossip_port: Option<u16>,

    /// TCP port of the control API
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,

    /// Seconds between reconciliation cycles
    #[arg(long = "interval", global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,

    /// Pull images every N cycles (0 disables)
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_every: Option<u64>,
}

impl Config {
    /// Defaults, then `convoy.toml`, `convoy.json`, `CONVOY_*` variables
    /// and finally command-line flags.
    pub fn load(overrides: &ConfigOverrides) -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("convoy.toml"))
            .merge(Json::file("convoy.json"))
            .merge(Env::prefixed("CONVOY_"))
            .merge(Serialized::defaults(overrides))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("CONVOY_API_KEY_FILE") {
            config.api_key = Some(
                std::fs::read_to_string(&secret_file)
                    .with_context(|| format!("cannot read {}", secret_file))?
                    .trim()
                    .to_string(),
            );
        }
        if config.api_key.as_deref() == Some("") {
            config.api_key = None;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval_secs == 0 {
            bail!("interval_secs must be greater than 0");
        }
        if self.gossip_interval_ms == 0 {
            bail!("gossip_interval_ms must be greater than 0");
        }
        if self.peer_timeout_secs == 0 {
            bail!("peer_timeout_secs must be greater than 0");
        }
        if self.http_port == 0 || self.gossip_port == 0 {
            bail!("http_port and gossip_port must be greater than 0");
        }
        if self.http_port == self.gossip_port {
            bail!("http_port and gossip_port must differ");
        }
        self.private_registry()?;
        Ok(())
    }

    /// The node name, falling back to the host name.
    pub fn resolve_node_name(&self) -> anyhow::Result<String> {
        if let Some(name) = self.node_name.as_ref().filter(|n| !n.is_empty()) {
            return Ok(name.clone());
        }
        if let Ok(name) = std::env::var("HOSTNAME") {
            if !name.is_empty() {
                return Ok(name);
            }
        }
        let name = std::fs::read_to_string("/etc/hostname")
            .context("no node name configured and /etc/hostname is unreadable")?;
        let name = name.trim();
        if name.is_empty() {
            bail!("no node name configured and the host name is empty");
        }
        Ok(name.to_string())
    }

    pub fn private_registry(&self) -> anyhow::Result<Option<Regex>> {
        if self.private_registry_pattern.is_empty() {
            return Ok(None);
        }
        Regex::new(&self.private_registry_pattern)
            .map(Some)
            .context("invalid private_registry_pattern")
    }

    pub fn gossip_bind(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.gossip_port)
    }

    pub fn http_bind(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.http_port)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }

    pub fn failure_timeout(&self) -> Duration {
        Duration::from_secs(self.failure_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        let re = config.private_registry().unwrap().unwrap();
        assert!(re.is_match("eu.gcr.io/project/service"));
        assert!(!re.is_match("docker.io/library/nginx"));
    }

    #[test]
    fn overrides_win_over_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("CONVOY_PULL_EVERY", "5");
            jail.set_env("CONVOY_HTTP_PORT", "9000");
            jail.create_file("convoy.toml", "interval_secs = 3\ndir = \"/srv/defs\"")?;
            let overrides = ConfigOverrides {
                http_port: Some(9100),
                ..Default::default()
            };
            let config = Config::load(&overrides).map_err(|e| e.to_string())?;
            assert_eq!(config.interval_secs, 3);
            assert_eq!(config.pull_every, 5);
            assert_eq!(config.http_port, 9100);
            assert_eq!(config.dir, PathBuf::from("/srv/defs"));
            Ok(())
        });
    }

    #[test]
    fn rejects_zero_interval_and_port_clash() {
        let config = Config {
            interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            http_port: 7946,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn explicit_node_name_wins() {
        let config = Config {
            node_name: Some("database-box-lvje".into()),
            ..Default::default()
        };
        assert_eq!(config.resolve_node_name().unwrap(), "database-box-lvje");
    }
}
