//! CLI definition using clap derive.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "agentmesh", about = "Agent coordination over a pull-only message log")]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, short = 'c', global = true, env = "AGENTMESH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for persisted connections, proposals and watermarks
    #[arg(long, global = true, env = "AGENTMESH_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Directory of the file-backed local log (one JSONL file per topic)
    #[arg(long, global = true, env = "AGENTMESH_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the agent until ctrl-c or SIGTERM
    Run(RunOpts),
    /// Print persisted state as JSON
    Status,
    /// Append a raw envelope to a topic of the local log
    Publish(PublishOpts),
}

#[derive(Args, Default)]
pub struct RunOpts {
    /// Account id of this agent
    #[arg(long, env = "AGENTMESH_ACCOUNT_ID")]
    pub account_id: Option<String>,

    /// Topic this agent receives connection requests on
    #[arg(long, env = "AGENTMESH_INBOUND_TOPIC")]
    pub inbound_topic: Option<String>,

    /// Poll interval in seconds
    #[arg(long)]
    pub poll_interval_secs: Option<u64>,

    /// Peer to connect to at startup, as `<inbound topic>@<account>` (repeatable)
    #[arg(long = "connect")]
    pub connect: Vec<String>,
}

#[derive(Args)]
pub struct PublishOpts {
    /// Target topic
    pub topic: String,

    /// Envelope JSON, e.g. '{"p":"hcs-10","op":"message","data":"..."}'
    pub payload: String,

    /// Create the topic if it does not exist yet
    #[arg(long)]
    pub create: bool,
}
