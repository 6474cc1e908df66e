//! Node configuration.

use crate::Args;
use anyhow::{anyhow, Context, Result};
use dpos_chain::{Milestone, Milestones};
use dpos_network::discovery::{parse_seed_peers, DEFAULT_DNS_HOSTS, DEFAULT_NTP_HOSTS};
use dpos_network::message::Rpc;
use dpos_network::{CommunicatorConfig, ProcessorConfig, RateLimit, RateLimitConfig};
use dpos_sync::{DownloadConfig, MonitorConfig};
use semver::VersionReq;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Network name (mainnet, devnet, testnet).
    pub network: String,
    /// Data directory.
    pub data_dir: PathBuf,
    /// Genesis block header as JSON, relative to the data directory.
    #[serde(default = "default_genesis_file")]
    pub genesis_file: PathBuf,
    /// P2P configuration.
    #[serde(default)]
    pub p2p: P2pConfig,
    /// Consensus parameters.
    #[serde(default)]
    pub chain: ChainConfig,
}

fn default_genesis_file() -> PathBuf {
    PathBuf::from("genesis.json")
}

/// P2P configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    /// Port we accept peers on.
    pub port: u16,
    /// Protocol version we announce.
    pub version: String,
    /// Semver requirement peers must satisfy.
    pub minimum_version: String,
    /// Network identifier.
    pub nethash: String,
    /// Seed peers as `ip:port`.
    pub seeds: Vec<String>,
    pub own_ips: Vec<IpAddr>,
    pub blacklist: Vec<IpAddr>,
    pub whitelist: Vec<IpAddr>,
    pub dns_hosts: Vec<String>,
    pub ntp_hosts: Vec<String>,
    pub verify_timeout_secs: u64,
    pub get_blocks_timeout_secs: u64,
    pub max_sequential_errors: u32,
    pub minimum_network_reach: usize,
    pub ignore_minimum_network_reach: bool,
    pub max_same_subnet_peers: usize,
    pub max_parallel_downloads: usize,
    pub allow_private: bool,
    pub skip_discovery: bool,
    pub disable_discovery: bool,
    /// Genesis start: forge without waiting for peers.
    pub network_start: bool,
    /// Requests per second per peer ip.
    pub global_rate_limit: u32,
    /// Per-procedure overrides keyed by procedure name.
    pub rate_limits: BTreeMap<String, RateLimitSetting>,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            port: dpos_network::DEFAULT_PORT,
            version: "3.0.0".to_string(),
            minimum_version: ">=3.0.0".to_string(),
            nethash: String::new(),
            seeds: Vec::new(),
            own_ips: Vec::new(),
            blacklist: Vec::new(),
            whitelist: Vec::new(),
            dns_hosts: DEFAULT_DNS_HOSTS.iter().map(|h| h.to_string()).collect(),
            ntp_hosts: DEFAULT_NTP_HOSTS.iter().map(|h| h.to_string()).collect(),
            verify_timeout_secs: 60,
            get_blocks_timeout_secs: 10,
            max_sequential_errors: dpos_network::DEFAULT_MAX_SEQUENTIAL_ERRORS,
            minimum_network_reach: 20,
            ignore_minimum_network_reach: false,
            max_same_subnet_peers: 5,
            max_parallel_downloads: 10,
            allow_private: false,
            skip_discovery: false,
            disable_discovery: false,
            network_start: false,
            global_rate_limit: 100,
            rate_limits: BTreeMap::new(),
        }
    }
}

/// Rate limit for one procedure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitSetting {
    pub points: u32,
    pub window_ms: u64,
}

/// Consensus parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Unix time of slot zero.
    pub epoch: u64,
    /// Registered delegates, highest rank first.
    pub delegates: Vec<String>,
    /// Delegates forging on this node.
    pub local_delegates: Vec<String>,
    pub milestones: Vec<Milestone>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            epoch: 1_490_101_200,
            delegates: Vec::new(),
            local_delegates: Vec::new(),
            milestones: vec![Milestone {
                height: 1,
                active_delegates: 51,
                block_time: 8,
            }],
        }
    }
}

impl NodeConfig {
    /// Load configuration from file and CLI args.
    pub fn load(config_path: &Path, args: &Args) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")?
        } else {
            Self::default_for_network(&args.network)
        };

        if let Some(ref data_dir) = args.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(port) = args.port {
            config.p2p.port = port;
        }
        if !args.seeds.is_empty() {
            config.p2p.seeds = args.seeds.clone();
        }
        config.p2p.skip_discovery |= args.skip_discovery;
        config.p2p.disable_discovery |= args.disable_discovery;
        config.p2p.network_start |= args.network_start;

        Ok(config)
    }

    /// Create default config for a network.
    pub fn default_for_network(network: &str) -> Self {
        let (data_dir, port) = match network {
            "testnet" => (PathBuf::from(".dpos-testnet"), 4000),
            "devnet" => (PathBuf::from(".dpos-devnet"), 4002),
            _ => (PathBuf::from(".dpos"), 4001),
        };

        Self {
            network: network.to_string(),
            data_dir,
            genesis_file: default_genesis_file(),
            p2p: P2pConfig {
                port,
                ..Default::default()
            },
            chain: ChainConfig::default(),
        }
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn genesis_path(&self) -> PathBuf {
        self.data_dir.join(&self.genesis_file)
    }

    pub fn milestones(&self) -> Result<Milestones> {
        Milestones::new(self.chain.milestones.clone()).context("Invalid milestones")
    }

    pub fn communicator_config(&self) -> Result<CommunicatorConfig> {
        let minimum_version = VersionReq::parse(&self.p2p.minimum_version)
            .with_context(|| format!("Invalid minimum version {}", self.p2p.minimum_version))?;
        Ok(CommunicatorConfig {
            own_port: self.p2p.port,
            version: self.p2p.version.clone(),
            nethash: self.p2p.nethash.clone(),
            minimum_version,
            max_sequential_errors: self.p2p.max_sequential_errors,
            get_blocks_timeout: Duration::from_secs(self.p2p.get_blocks_timeout_secs),
            ..Default::default()
        })
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            own_ips: self.p2p.own_ips.clone(),
            blacklist: self.p2p.blacklist.clone(),
            whitelist: self.p2p.whitelist.clone(),
            max_same_subnet_peers: self.p2p.max_same_subnet_peers,
            allow_private: self.p2p.allow_private,
            verify_timeout: Duration::from_secs(self.p2p.verify_timeout_secs),
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            seed_peers: parse_seed_peers(&self.p2p.seeds),
            dns_hosts: self.p2p.dns_hosts.clone(),
            ntp_hosts: self.p2p.ntp_hosts.clone(),
            minimum_network_reach: self.p2p.minimum_network_reach,
            ignore_minimum_network_reach: self.p2p.ignore_minimum_network_reach,
            verify_timeout: Duration::from_secs(self.p2p.verify_timeout_secs),
            skip_discovery: self.p2p.skip_discovery,
            disable_discovery: self.p2p.disable_discovery,
            network_start: self.p2p.network_start,
            local_delegates: self.chain.local_delegates.clone(),
            download: DownloadConfig {
                max_parallel: self.p2p.max_parallel_downloads,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn rate_limit_config(&self) -> Result<RateLimitConfig> {
        let mut config = RateLimitConfig {
            global: RateLimit::per_second(self.p2p.global_rate_limit),
            ..Default::default()
        };
        for (name, setting) in &self.p2p.rate_limits {
            let rpc = Rpc::from_name(name).ok_or_else(|| anyhow!("Unknown procedure {}", name))?;
            config.rules.insert(
                rpc,
                RateLimit::new(setting.points, Duration::from_millis(setting.window_ms)),
            );
        }
        Ok(config)
    }
}
