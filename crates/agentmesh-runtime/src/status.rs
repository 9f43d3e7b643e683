//! `agentmesh status`: persisted state as one JSON document.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, bail};
use serde::Serialize;

use agentmesh_coordinator::FileStorage;
use agentmesh_coordinator::storage::{
    CONNECTIONS_KEY, EXECUTED_PROPOSALS_KEY, PENDING_PROPOSALS_KEY, SETTLED_PROPOSALS_KEY,
    WATERMARKS_KEY, load_json,
};
use agentmesh_core::types::{Connection, ExecutionRecord, Proposal, TopicId};
use agentmesh_poller::WatermarkBook;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub connections: Vec<Connection>,
    pub pending_proposals: Vec<Proposal>,
    pub settled_proposals: Vec<Proposal>,
    pub executions: Vec<ExecutionRecord>,
    pub watermarks: BTreeMap<TopicId, u64>,
}

impl StatusReport {
    pub fn load(state_dir: &Path) -> anyhow::Result<Self> {
        if !state_dir.is_dir() {
            bail!("no state at {} (has the agent run yet?)", state_dir.display());
        }
        let storage = FileStorage::open(state_dir)
            .with_context(|| format!("opening state dir {}", state_dir.display()))?;
        let book: WatermarkBook = load_json(&storage, WATERMARKS_KEY)?;
        Ok(Self {
            connections: load_json(&storage, CONNECTIONS_KEY)?,
            pending_proposals: load_json(&storage, PENDING_PROPOSALS_KEY)?,
            settled_proposals: load_json(&storage, SETTLED_PROPOSALS_KEY)?,
            executions: load_json(&storage, EXECUTED_PROPOSALS_KEY)?,
            watermarks: book.iter().map(|(t, seq)| (t.clone(), seq)).collect(),
        })
    }
}

pub fn cmd_status(state_dir: &Path) -> anyhow::Result<()> {
    let report = StatusReport::load(state_dir)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use agentmesh_coordinator::storage::save_json;
    use agentmesh_core::types::{ConnectionStatus, OperatorId};

    #[test]
    fn missing_state_dir_is_an_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = StatusReport::load(&tmp.path().join("nope")).expect_err("missing");
        assert!(err.to_string().contains("no state"));
    }

    #[test]
    fn reports_persisted_state() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let storage = FileStorage::open(tmp.path()).expect("storage");
        let conn = Connection::new(
            1,
            4,
            &OperatorId::new("0.0.200", "0.0.2"),
            ConnectionStatus::Requested,
            Utc::now(),
        );
        save_json(&storage, CONNECTIONS_KEY, &vec![conn]).expect("save");
        let mut book = WatermarkBook::default();
        book.commit(&TopicId::new("0.0.100"), 7).expect("commit");
        save_json(&storage, WATERMARKS_KEY, &book).expect("save");

        let report = StatusReport::load(tmp.path()).expect("load");
        assert_eq!(report.connections.len(), 1);
        assert!(report.pending_proposals.is_empty());
        assert_eq!(report.watermarks[&TopicId::new("0.0.100")], 7);

        let json = serde_json::to_value(&report).expect("json");
        assert!(json.get("pendingProposals").is_some());
    }
}
