//! Configuration: optional TOML file, overridden by CLI flags and env vars.
//!
//! ```toml
//! [agent]
//! account_id = "0.0.1"
//! inbound_topic = "0.0.100"
//! governance_topics = ["0.0.500"]
//! peers = ["0.0.200@0.0.2"]
//!
//! [poller]
//! poll_interval_secs = 10
//!
//! [ledger.balances]
//! BTC = 100
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use rust_decimal::Decimal;
use serde::Deserialize;

use agentmesh_coordinator::{ConnectionConfig, ExecutionConfig};
use agentmesh_core::types::{Balances, OperatorId, TopicId};
use agentmesh_poller::PollerConfig;
use agentmesh_poller::backoff::BackoffPolicy;

use crate::cli::{Cli, RunOpts};

const DEFAULT_STATE_DIR: &str = ".agentmesh/state";
const DEFAULT_LOG_DIR: &str = ".agentmesh/log";

// ─── File Schema ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub agent: AgentSection,
    pub poller: PollerSection,
    pub connections: ConnectionsSection,
    pub execution: ExecutionSection,
    pub storage: StorageSection,
    pub ledger: LedgerSection,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSection {
    pub account_id: Option<String>,
    pub inbound_topic: Option<String>,
    /// Extra topics carrying proposals and approvals. The inbound topic is
    /// always included.
    pub governance_topics: Vec<String>,
    /// Peers (`topic@account`) to request connections with at startup.
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollerSection {
    pub poll_interval_secs: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_secs: u64,
    /// Must be shorter than the poll interval; 0 disables the cache.
    pub cache_ttl_secs: u64,
    pub cache_sweep_secs: u64,
}

impl Default for PollerSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            base_backoff_ms: 1_000,
            max_backoff_secs: 60,
            cache_ttl_secs: 5,
            cache_sweep_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionsSection {
    pub pending_timeout_secs: u64,
    pub established_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for ConnectionsSection {
    fn default() -> Self {
        Self {
            pending_timeout_secs: 24 * 60 * 60,
            established_timeout_secs: 7 * 24 * 60 * 60,
            cleanup_interval_secs: 5 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionSection {
    pub ledger_timeout_secs: u64,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            ledger_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSection {
    pub state_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerSection {
    /// Opening balances of the in-memory ledger.
    pub balances: BTreeMap<String, Decimal>,
}

impl FileConfig {
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Read `path`, or use defaults when no file was given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}

// ─── Resolved ────────────────────────────────────────────────────────

/// Everything `run` needs, with every default applied.
#[derive(Debug, Clone)]
pub struct Settings {
    pub identity: OperatorId,
    pub governance_topics: Vec<TopicId>,
    pub peers: Vec<OperatorId>,
    pub poll_interval: Duration,
    pub poller: PollerConfig,
    pub cache_sweep: Duration,
    pub connections: ConnectionConfig,
    pub cleanup_interval: Duration,
    pub execution: ExecutionConfig,
    pub state_dir: PathBuf,
    pub log_dir: PathBuf,
    pub balances: Balances,
}

pub fn state_dir(file: &FileConfig, cli: &Cli) -> PathBuf {
    cli.state_dir
        .clone()
        .or_else(|| file.storage.state_dir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
}

pub fn log_dir(file: &FileConfig, cli: &Cli) -> PathBuf {
    cli.log_dir
        .clone()
        .or_else(|| file.storage.log_dir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl Settings {
    /// Merge file values with flag/env overrides. Missing agent identifiers
    /// are fatal.
    pub fn resolve(file: FileConfig, cli: &Cli, opts: &RunOpts) -> anyhow::Result<Self> {
        let state_dir = state_dir(&file, cli);
        let log_dir = log_dir(&file, cli);

        let Some(account_id) = non_empty(opts.account_id.clone()).or(non_empty(file.agent.account_id))
        else {
            bail!("missing account id (--account-id, AGENTMESH_ACCOUNT_ID or [agent].account_id)");
        };
        let Some(inbound) = non_empty(opts.inbound_topic.clone()).or(non_empty(file.agent.inbound_topic))
        else {
            bail!("missing inbound topic (--inbound-topic, AGENTMESH_INBOUND_TOPIC or [agent].inbound_topic)");
        };
        let identity = OperatorId::new(inbound, account_id);

        let mut governance_topics = vec![identity.topic_id.clone()];
        for topic in file.agent.governance_topics {
            let topic = TopicId::new(topic);
            if !governance_topics.contains(&topic) {
                governance_topics.push(topic);
            }
        }

        let peers = file
            .agent
            .peers
            .iter()
            .chain(&opts.connect)
            .map(|p| {
                p.parse::<OperatorId>()
                    .with_context(|| format!("invalid peer {p:?}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let p = &file.poller;
        let poll_interval =
            Duration::from_secs(opts.poll_interval_secs.unwrap_or(p.poll_interval_secs));
        if poll_interval.is_zero() {
            bail!("poll interval must be positive");
        }
        let base_delay = Duration::from_millis(p.base_backoff_ms);
        let max_delay = Duration::from_secs(p.max_backoff_secs);
        if base_delay.is_zero() || max_delay < base_delay {
            bail!("backoff bounds must satisfy 0 < base_backoff_ms <= max_backoff_secs");
        }
        let cache_ttl = Duration::from_secs(p.cache_ttl_secs);
        if !cache_ttl.is_zero() && cache_ttl >= poll_interval {
            bail!("cache_ttl_secs must be shorter than the poll interval");
        }
        if p.cache_sweep_secs == 0 || file.connections.cleanup_interval_secs == 0 {
            bail!("sweep and cleanup intervals must be positive");
        }

        Ok(Self {
            identity,
            governance_topics,
            peers,
            poll_interval,
            poller: PollerConfig {
                backoff: BackoffPolicy {
                    base_delay,
                    max_delay,
                },
                cache_ttl,
            },
            cache_sweep: Duration::from_secs(p.cache_sweep_secs),
            connections: ConnectionConfig {
                pending_timeout: Duration::from_secs(file.connections.pending_timeout_secs),
                established_timeout: Duration::from_secs(file.connections.established_timeout_secs),
            },
            cleanup_interval: Duration::from_secs(file.connections.cleanup_interval_secs),
            execution: ExecutionConfig {
                ledger_timeout: Duration::from_secs(file.execution.ledger_timeout_secs),
            },
            state_dir,
            log_dir,
            balances: file.ledger.balances,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use rust_decimal_macros::dec;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("parse args")
    }

    fn run_opts(cli: &Cli) -> &RunOpts {
        match &cli.command {
            crate::cli::Command::Run(opts) => opts,
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn defaults_apply_without_file() {
        let cli = cli(&["agentmesh", "run", "--account-id", "0.0.1", "--inbound-topic", "0.0.100"]);
        let s = Settings::resolve(FileConfig::default(), &cli, run_opts(&cli)).expect("resolve");

        assert_eq!(s.identity.to_string(), "0.0.100@0.0.1");
        assert_eq!(s.governance_topics, vec![TopicId::new("0.0.100")]);
        assert_eq!(s.poll_interval, Duration::from_secs(10));
        assert_eq!(s.poller.backoff.base_delay, Duration::from_secs(1));
        assert_eq!(s.poller.backoff.max_delay, Duration::from_secs(60));
        assert_eq!(s.poller.cache_ttl, Duration::from_secs(5));
        assert_eq!(s.cache_sweep, Duration::from_secs(30));
        assert_eq!(s.connections.pending_timeout, Duration::from_secs(86_400));
        assert_eq!(s.connections.established_timeout, Duration::from_secs(604_800));
        assert_eq!(s.cleanup_interval, Duration::from_secs(300));
        assert_eq!(s.execution.ledger_timeout, Duration::from_secs(30));
        assert_eq!(s.state_dir, PathBuf::from(DEFAULT_STATE_DIR));
    }

    #[test]
    fn file_values_and_flag_overrides() {
        let file = FileConfig::from_toml(
            r#"
            [agent]
            account_id = "0.0.1"
            inbound_topic = "0.0.100"
            governance_topics = ["0.0.500", "0.0.100"]
            peers = ["0.0.200@0.0.2"]

            [poller]
            poll_interval_secs = 3

            [storage]
            state_dir = "/var/lib/agentmesh"

            [ledger.balances]
            BTC = 100
            ETH = 2.5
            "#,
        )
        .expect("toml");
        let cli = cli(&[
            "agentmesh",
            "--state-dir",
            "/tmp/state",
            "run",
            "--poll-interval-secs",
            "7",
            "--connect",
            "0.0.300@0.0.3",
        ]);
        let s = Settings::resolve(file, &cli, run_opts(&cli)).expect("resolve");

        assert_eq!(
            s.governance_topics,
            vec![TopicId::new("0.0.100"), TopicId::new("0.0.500")]
        );
        assert_eq!(s.peers.len(), 2);
        assert_eq!(s.peers[1].to_string(), "0.0.300@0.0.3");
        assert_eq!(s.poll_interval, Duration::from_secs(7));
        assert_eq!(s.state_dir, PathBuf::from("/tmp/state"));
        assert_eq!(s.balances["BTC"], dec!(100));
        assert_eq!(s.balances["ETH"], dec!(2.5));
    }

    #[test]
    fn missing_identifiers_are_fatal() {
        let cli = cli(&["agentmesh", "run", "--inbound-topic", "0.0.100"]);
        let err = Settings::resolve(FileConfig::default(), &cli, run_opts(&cli))
            .expect_err("no account");
        assert!(err.to_string().contains("account id"));

        let cli = cli_with_account_only();
        let err = Settings::resolve(FileConfig::default(), &cli, run_opts(&cli))
            .expect_err("no topic");
        assert!(err.to_string().contains("inbound topic"));
    }

    fn cli_with_account_only() -> Cli {
        cli(&["agentmesh", "run", "--account-id", "0.0.1"])
    }

    #[test]
    fn malformed_peer_is_rejected() {
        let cli = cli(&[
            "agentmesh",
            "run",
            "--account-id",
            "0.0.1",
            "--inbound-topic",
            "0.0.100",
            "--connect",
            "0.0.200",
        ]);
        assert!(Settings::resolve(FileConfig::default(), &cli, run_opts(&cli)).is_err());
    }

    #[test]
    fn cache_ttl_must_undercut_poll_interval() {
        let cli = cli(&[
            "agentmesh",
            "run",
            "--account-id",
            "0.0.1",
            "--inbound-topic",
            "0.0.100",
            "--poll-interval-secs",
            "5",
        ]);
        let err = Settings::resolve(FileConfig::default(), &cli, run_opts(&cli))
            .expect_err("ttl equals interval");
        assert!(err.to_string().contains("cache_ttl_secs"));

        let file = FileConfig::from_toml("[poller]\ncache_ttl_secs = 0\n").expect("toml");
        let s = Settings::resolve(file, &cli, run_opts(&cli)).expect("cache disabled");
        assert!(s.poller.cache_ttl.is_zero());

        let file = FileConfig::from_toml("[poller]\ncache_ttl_secs = 4\n").expect("toml");
        let s = Settings::resolve(file, &cli, run_opts(&cli)).expect("shorter ttl");
        assert_eq!(s.poller.cache_ttl, Duration::from_secs(4));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(FileConfig::from_toml("[poller]\npoll_every = 3\n").is_err());
    }
}
