//! File-backed log for local runs: one `<topic>.jsonl` per topic, one
//! [`LogMessage`] per line.
//!
//! Several processes may share a directory (e.g. two agents talking to each
//! other); appends within one process are serialized by a mutex.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use agentmesh_core::types::{Envelope, LogMessage, TopicId};
use agentmesh_poller::{LogTransport, TransportError};

use crate::cli::PublishOpts;

/// First id tried by `create_topic`.
const FIRST_CREATED_TOPIC: u64 = 10_000;

pub struct FileLogTransport {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileLogTransport {
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path(&self, topic: &TopicId) -> PathBuf {
        self.dir.join(format!("{}.jsonl", topic.as_str()))
    }

    /// Create `topic`'s file if missing.
    pub fn ensure_topic(&self, topic: &TopicId) -> std::io::Result<()> {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(topic))?;
        Ok(())
    }

    /// Every parseable message on `topic`. Malformed lines are skipped.
    fn read_all(&self, topic: &TopicId) -> Result<Vec<LogMessage>, TransportError> {
        let file = match std::fs::File::open(self.path(topic)) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransportError::InvalidTopic(topic.clone()));
            }
            Err(e) => return Err(TransportError::Unavailable(e.to_string())),
        };

        let mut messages = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| TransportError::Unavailable(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogMessage>(&line) {
                Ok(m) => messages.push(m),
                Err(e) => warn!(%topic, line = idx + 1, error = %e, "skipping malformed log line"),
            }
        }
        Ok(messages)
    }
}

fn io_error(e: std::io::Error) -> TransportError {
    TransportError::Unavailable(e.to_string())
}

#[async_trait]
impl LogTransport for FileLogTransport {
    async fn publish(&self, topic: &TopicId, payload: String) -> Result<u64, TransportError> {
        let _guard = self.write_lock.lock().await;
        let existing = self.read_all(topic)?;
        let sequence_number = existing.last().map_or(1, |m| m.sequence_number + 1);
        let message = LogMessage {
            topic_id: topic.clone(),
            sequence_number,
            consensus_timestamp: Utc::now(),
            payload,
        };
        let mut line =
            serde_json::to_string(&message).map_err(|e| TransportError::Codec(e.to_string()))?;
        line.push('\n');

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(self.path(topic))
            .map_err(io_error)?;
        file.write_all(line.as_bytes()).map_err(io_error)?;
        debug!(%topic, sequence_number, "appended");
        Ok(sequence_number)
    }

    async fn poll(&self, topic: &TopicId, since: u64) -> Result<Vec<LogMessage>, TransportError> {
        let mut messages = self.read_all(topic)?;
        messages.retain(|m| m.sequence_number > since);
        Ok(messages)
    }

    async fn create_topic(&self, memo: &str) -> Result<TopicId, TransportError> {
        let _guard = self.write_lock.lock().await;
        let mut n = FIRST_CREATED_TOPIC;
        loop {
            let topic = TopicId::new(format!("0.0.{n}"));
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.path(&topic))
            {
                Ok(_) => {
                    debug!(%topic, memo, "topic created");
                    return Ok(topic);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
                Err(e) => return Err(io_error(e)),
            }
        }
    }
}

// ─── Publish Command ─────────────────────────────────────────────────

/// `agentmesh publish`: append one envelope, printing its sequence number.
pub async fn cmd_publish(dir: &Path, opts: &PublishOpts) -> anyhow::Result<()> {
    let envelope = Envelope::parse(&opts.payload)?;
    let log = FileLogTransport::open(dir)?;
    let topic = TopicId::new(opts.topic.as_str());
    if opts.create {
        log.ensure_topic(&topic)?;
    }
    let sequence = log.publish(&topic, envelope.to_json()?).await?;
    println!("{topic} #{sequence} {}", envelope.op);
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────
