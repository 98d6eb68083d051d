use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clusterd_events::HookConfig;
use serde::{Deserialize, Serialize};

use crate::error::NodeError;

pub const DEFAULT_MAINTENANCE_GRACE_PERIOD_SECS: u64 = 60;
pub const DEFAULT_MIN_AVAIL_MEM: u64 = 2;
pub const DEFAULT_MIN_AVAIL_SWAP: u64 = 10;
pub const DEFAULT_ARBITRATOR_PORT: u16 = 1214;
const DEFAULT_ARBITRATOR_TIMEOUT_SECS: f64 = 5.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// The cluster wide settings consumed by the cluster state.
pub struct ClusterConfig {
    /// The configured cluster nodes, in preference order.
    pub nodes: Vec<String>,
    /// If quorum loss should trigger self-fencing.
    pub quorum: bool,
    /// External tie-breaking voters.
    pub arbitrators: Vec<ArbitratorConfig>,
    /// How long the data of a peer in maintenance is preserved after it stops beating.
    pub maintenance_grace_period_secs: u64,
    /// The minimum available memory percentage before a node is overloaded.
    pub min_avail_mem: u64,
    /// The minimum available swap percentage before a node is overloaded.
    pub min_avail_swap: u64,
    pub hooks: Vec<HookConfig>,
    /// Run before the process aborts when fencing.
    pub crash_command: Option<Vec<String>>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            quorum: false,
            arbitrators: Vec::new(),
            maintenance_grace_period_secs: DEFAULT_MAINTENANCE_GRACE_PERIOD_SECS,
            min_avail_mem: DEFAULT_MIN_AVAIL_MEM,
            min_avail_swap: DEFAULT_MIN_AVAIL_SWAP,
            hooks: Vec::new(),
            crash_command: None,
        }
    }
}

impl ClusterConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, NodeError> {
        Ok(toml::from_str(s)?)
    }

    #[inline]
    pub fn maintenance_grace_period(&self) -> Duration {
        Duration::from_secs(self.maintenance_grace_period_secs)
    }

    #[inline]
    /// The number of voters: configured nodes plus arbitrators.
    pub fn total_votes(&self) -> usize {
        self.nodes.len() + self.arbitrators.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitratorConfig {
    pub name: String,
    /// `host:port` to probe, defaults to the name on the daemon port.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "arbitrator_timeout_default")]
    pub timeout_secs: f64,
}

fn arbitrator_timeout_default() -> f64 {
    DEFAULT_ARBITRATOR_TIMEOUT_SECS
}

impl ArbitratorConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: Some(address.into()),
            secret: None,
            timeout_secs: DEFAULT_ARBITRATOR_TIMEOUT_SECS,
        }
    }

    /// A malformed arbitrator still counts as a voter but never votes.
    pub fn is_valid(&self) -> bool {
        let name_ok = !self.name.trim().is_empty();
        let secret_ok = self
            .secret
            .as_deref()
            .map(|s| !s.trim().is_empty())
            .unwrap_or(true);
        name_ok && secret_ok
    }

    pub fn probe_address(&self) -> String {
        match &self.address {
            Some(addr) => addr.clone(),
            None => format!("{}:{}", self.name, DEFAULT_ARBITRATOR_PORT),
        }
    }

    pub fn timeout(&self) -> Duration {
        if self.timeout_secs.is_finite() && self.timeout_secs > 0.0 {
            Duration::from_secs_f64(self.timeout_secs)
        } else {
            Duration::from_secs_f64(DEFAULT_ARBITRATOR_TIMEOUT_SECS)
        }
    }
}

/// Provides the cluster configuration.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> anyhow::Result<ClusterConfig>;
}

#[derive(Debug, Clone)]
/// An in-memory configuration.
pub struct StaticConfig(pub ClusterConfig);

impl ConfigSource for StaticConfig {
    fn load(&self) -> anyhow::Result<ClusterConfig> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone)]
/// Reads the configuration from a TOML file on every load.
pub struct TomlFileConfig {
    path: PathBuf,
}

impl TomlFileConfig {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ConfigSource for TomlFileConfig {
    fn load(&self) -> anyhow::Result<ClusterConfig> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        let cfg = ClusterConfig::from_toml_str(&content)?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toml() {
        let cfg = ClusterConfig::from_toml_str(
            r#"
            nodes = ["n1", "n2", "n3"]
            quorum = true
            maintenance_grace_period_secs = 30

            [[arbitrators]]
            name = "arb1"
            address = "10.0.0.9:1214"
            timeout_secs = 2.5

            [[hooks]]
            name = "audit"
            events = ["all"]
            command = ["/usr/local/bin/audit"]
            "#,
        )
        .expect("Parse config.");

        assert_eq!(cfg.nodes, vec!["n1", "n2", "n3"]);
        assert!(cfg.quorum);
        assert_eq!(cfg.maintenance_grace_period(), Duration::from_secs(30));
        assert_eq!(cfg.min_avail_mem, DEFAULT_MIN_AVAIL_MEM);
        assert_eq!(cfg.total_votes(), 4);
        assert_eq!(cfg.arbitrators[0].timeout(), Duration::from_millis(2500));
        assert_eq!(cfg.hooks[0].name, "audit");
    }

    #[test]
    fn test_missing_quorum_flag_is_disabled() {
        let cfg = ClusterConfig::from_toml_str("nodes = [\"n1\"]").expect("Parse config.");
        assert!(!cfg.quorum);
    }

    #[test]
    fn test_arbitrator_defaults_and_validity() {
        let mut arb = ArbitratorConfig {
            name: "arb1".to_string(),
            address: None,
            secret: None,
            timeout_secs: f64::NAN,
        };
        assert!(arb.is_valid());
        assert_eq!(arb.probe_address(), "arb1:1214");
        assert_eq!(arb.timeout(), Duration::from_secs(5));

        arb.secret = Some("  ".to_string());
        assert!(!arb.is_valid());

        arb.secret = None;
        arb.name = String::new();
        assert!(!arb.is_valid());
    }

    #[test]
    fn test_toml_file_source() {
        let path = std::env::temp_dir().join(format!(
            "clusterd-config-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "nodes = [\"a\", \"b\"]\nquorum = true\n").unwrap();

        let cfg = TomlFileConfig::new(&path).load().expect("Load config.");
        assert_eq!(cfg.nodes, vec!["a", "b"]);
        assert!(cfg.quorum);

        std::fs::remove_file(&path).unwrap();
        assert!(TomlFileConfig::new(&path).load().is_err());
    }
}
