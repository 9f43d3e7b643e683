use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Protocol identifier carried in the `p` field of every envelope.
pub const PROTOCOL_ID: &str = "hcs-10";

/// Asset symbol → target fraction of total holdings.
pub type Weights = BTreeMap<String, Decimal>;

/// Asset symbol → token amount.
pub type Balances = BTreeMap<String, Decimal>;

// ─── Topic ────────────────────────────────────────────────────────

/// Opaque identifier of an append-only log partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicId(String);

impl TopicId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TopicId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for TopicId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ─── Log Message ──────────────────────────────────────────────────

/// One entry read back from the log.
///
/// `sequence_number` strictly increases within a topic; the log assigns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub topic_id: TopicId,
    pub sequence_number: u64,
    pub consensus_timestamp: DateTime<Utc>,
    pub payload: String,
}

impl LogMessage {
    /// Decode the payload as a protocol envelope.
    pub fn envelope(&self) -> Result<Envelope, ValidationError> {
        Envelope::parse(&self.payload)
    }
}

// ─── Envelope ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    ConnectionRequest,
    ConnectionCreated,
    CloseConnection,
    Message,
    /// Any op this agent does not understand. Ignored by every consumer.
    #[serde(other)]
    Unknown,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionRequest => "connection_request",
            Self::ConnectionCreated => "connection_created",
            Self::CloseConnection => "close_connection",
            Self::Message => "message",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire envelope published on and read from the log.
///
/// ```text
/// { "p": "hcs-10", "op": "connection_request", "operator_id": "0.0.7@0.0.2", "data": "..." }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "p")]
    pub protocol: String,
    pub op: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_id: Option<String>,
    /// Stringified application payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_topic_id: Option<TopicId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<u64>,
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    pub memo: Option<String>,
}

impl Envelope {
    pub fn new(op: Operation) -> Self {
        Self {
            protocol: PROTOCOL_ID.to_owned(),
            op,
            operator_id: None,
            data: None,
            connection_topic_id: None,
            connection_id: None,
            memo: None,
        }
    }

    pub fn with_operator(mut self, operator: &OperatorId) -> Self {
        self.operator_id = Some(operator.to_string());
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn with_connection(mut self, topic: TopicId, connection_id: u64) -> Self {
        self.connection_topic_id = Some(topic);
        self.connection_id = Some(connection_id);
        self
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = Some(memo.into());
        self
    }

    /// Wrap a governance body as a generic `message` envelope.
    pub fn governance(
        operator: &OperatorId,
        body: &GovernanceMessage,
    ) -> Result<Self, serde_json::Error> {
        let data = serde_json::to_string(body)?;
        Ok(Self::new(Operation::Message)
            .with_operator(operator)
            .with_data(data))
    }

    pub fn parse(payload: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(payload).map_err(|e| ValidationError::Envelope(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse the `operator_id` field.
    pub fn operator(&self) -> Result<OperatorId, ValidationError> {
        self.operator_id
            .as_deref()
            .ok_or(ValidationError::MissingField("operator_id"))?
            .parse()
    }

    /// Decode `data` as a governance body.
    pub fn governance_body(&self) -> Result<GovernanceMessage, ValidationError> {
        let data = self
            .data
            .as_deref()
            .ok_or(ValidationError::MissingField("data"))?;
        serde_json::from_str(data).map_err(|e| ValidationError::Body(e.to_string()))
    }
}

// ─── Operator Id ──────────────────────────────────────────────────

/// `<topic>@<account>`: the inbound topic and account of the sending agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperatorId {
    pub topic_id: TopicId,
    pub account_id: String,
}

impl OperatorId {
    pub fn new(topic_id: impl Into<TopicId>, account_id: impl Into<String>) -> Self {
        Self {
            topic_id: topic_id.into(),
            account_id: account_id.into(),
        }
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.topic_id, self.account_id)
    }
}

impl FromStr for OperatorId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('@').collect();
        match parts.as_slice() {
            [topic, account] if !topic.is_empty() && !account.is_empty() => {
                Ok(Self::new(*topic, *account))
            }
            _ => Err(ValidationError::MalformedOperatorId(s.to_owned())),
        }
    }
}

// ─── Connection ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// We asked the peer; waiting for `connection_created`.
    Requested,
    /// Peer asked us; acknowledgment not yet delivered.
    NeedsConfirmation,
    Established,
    Closed,
}

impl ConnectionStatus {
    pub fn is_open(self) -> bool {
        !matches!(self, Self::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::NeedsConfirmation => "needs_confirmation",
            Self::Established => "established",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logical bidirectional channel to one peer agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    /// Local identifier, unique within one agent's connection table.
    pub id: u64,
    /// Sequence number of the `connection_request` on the receiving agent's
    /// inbound topic. Carried on the wire as `connection_id`.
    pub request_sequence: u64,
    /// The peer's inbound topic.
    pub peer_topic_id: TopicId,
    pub peer_account_id: String,
    pub status: ConnectionStatus,
    pub created_at: DateTime<Utc>,
    /// Dedicated topic carrying traffic for this connection, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_topic_id: Option<TopicId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,
}

impl Connection {
    pub fn new(
        id: u64,
        request_sequence: u64,
        peer: &OperatorId,
        status: ConnectionStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            request_sequence,
            peer_topic_id: peer.topic_id.clone(),
            peer_account_id: peer.account_id.clone(),
            status,
            created_at: now,
            connection_topic_id: None,
            closed_at: None,
            close_reason: None,
        }
    }

    pub fn close(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = ConnectionStatus::Closed;
        self.closed_at = Some(now);
        self.close_reason = Some(reason.into());
    }
}

// ─── Proposal ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Executed,
    Failed,
}

impl ProposalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A requested change to target weights.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    #[serde(rename = "proposalId")]
    pub id: String,
    pub new_weights: Weights,
    #[serde(rename = "receiveTime")]
    pub received_at: DateTime<Utc>,
    pub status: ProposalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Proposal {
    /// Build a pending proposal. Weights must be present and non-negative;
    /// whether they sum to one is the caller's concern.
    pub fn pending(
        id: impl Into<String>,
        new_weights: Weights,
        received_at: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ValidationError::MissingField("id"));
        }
        if new_weights.is_empty() {
            return Err(ValidationError::MissingField("newWeights"));
        }
        if let Some((asset, weight)) = new_weights.iter().find(|(_, w)| w.is_sign_negative()) {
            return Err(ValidationError::NegativeWeight {
                asset: asset.clone(),
                weight: weight.to_string(),
            });
        }
        Ok(Self {
            id,
            new_weights,
            received_at,
            status: ProposalStatus::Pending,
            error: None,
        })
    }
}

/// Append-only audit entry for an executed proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub proposal_id: String,
    pub pre_balances: Balances,
    pub post_balances: Balances,
    pub adjustments: BTreeMap<String, Decimal>,
    pub executed_at: DateTime<Utc>,
    /// Assets whose mint/burn failed, with the error text.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failures: BTreeMap<String, String>,
}

// ─── Governance Bodies ────────────────────────────────────────────

/// Typed body carried in the `data` field of a `message` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GovernanceMessage {
    RebalanceProposal {
        #[serde(alias = "proposalId")]
        id: String,
        #[serde(rename = "newWeights")]
        new_weights: Weights,
    },
    RebalanceApproved {
        #[serde(rename = "proposalId")]
        proposal_id: String,
    },
    RebalanceExecuted(ExecutionRecord),
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn operator_id_parses_topic_and_account() {
        let op: OperatorId = "0.0.1234@0.0.99".parse().expect("parse");
        assert_eq!(op.topic_id.as_str(), "0.0.1234");
        assert_eq!(op.account_id, "0.0.99");
        assert_eq!(op.to_string(), "0.0.1234@0.0.99");
    }

    #[test]
    fn operator_id_rejects_wrong_part_count() {
        for bad in ["0.0.1234", "a@b@c", "@0.0.9", "0.0.1@", ""] {
            let err = bad.parse::<OperatorId>().expect_err(bad);
            assert_eq!(err, ValidationError::MalformedOperatorId(bad.to_owned()));
        }
    }

    #[test]
    fn envelope_wire_shape() {
        let env = Envelope::new(Operation::ConnectionRequest)
            .with_operator(&OperatorId::new("0.0.5", "0.0.6"))
            .with_memo("hello");
        let json: serde_json::Value =
            serde_json::from_str(&env.to_json().expect("encode")).expect("decode");
        assert_eq!(json["p"], "hcs-10");
        assert_eq!(json["op"], "connection_request");
        assert_eq!(json["operator_id"], "0.0.5@0.0.6");
        assert_eq!(json["m"], "hello");
        assert!(json.get("data").is_none(), "absent fields are omitted");
    }

    #[test]
    fn envelope_unknown_op_is_tolerated() {
        let env = Envelope::parse(r#"{"p":"hcs-10","op":"register"}"#).expect("parse");
        assert_eq!(env.op, Operation::Unknown);
    }

    #[test]
    fn envelope_garbage_is_validation_error() {
        let err = Envelope::parse("not json").expect_err("garbage");
        assert!(matches!(err, ValidationError::Envelope(_)));
    }

    #[test]
    fn governance_proposal_accepts_numeric_weights() {
        let env = Envelope::new(Operation::Message).with_data(
            r#"{"type":"RebalanceProposal","id":"p1","newWeights":{"BTC":0.5,"ETH":0.5}}"#,
        );
        match env.governance_body().expect("body") {
            GovernanceMessage::RebalanceProposal { id, new_weights } => {
                assert_eq!(id, "p1");
                assert_eq!(new_weights["BTC"], dec!(0.5));
                assert_eq!(new_weights["ETH"], dec!(0.5));
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn governance_proposal_without_weights_is_rejected() {
        let env = Envelope::new(Operation::Message)
            .with_data(r#"{"type":"RebalanceProposal","id":"p1"}"#);
        assert!(matches!(
            env.governance_body(),
            Err(ValidationError::Body(_))
        ));
    }

    #[test]
    fn governance_approval_uses_proposal_id_key() {
        let op = OperatorId::new("0.0.1", "0.0.2");
        let body = GovernanceMessage::RebalanceApproved {
            proposal_id: "p9".to_owned(),
        };
        let env = Envelope::governance(&op, &body).expect("wrap");
        let raw: serde_json::Value =
            serde_json::from_str(env.data.as_deref().expect("data")).expect("json");
        assert_eq!(raw["type"], "RebalanceApproved");
        assert_eq!(raw["proposalId"], "p9");
        assert_eq!(env.governance_body().expect("decode"), body);
    }

    #[test]
    fn pending_proposal_rejects_negative_weight() {
        let weights = Weights::from([("A".to_owned(), dec!(0.7)), ("B".to_owned(), dec!(-0.1))]);
        let err = Proposal::pending("p1", weights, Utc::now()).expect_err("negative");
        assert!(matches!(err, ValidationError::NegativeWeight { ref asset, .. } if asset == "B"));
    }

    #[test]
    fn pending_proposal_rejects_empty_id_and_weights() {
        let weights = Weights::from([("A".to_owned(), dec!(1))]);
        assert_eq!(
            Proposal::pending(" ", weights, Utc::now()),
            Err(ValidationError::MissingField("id"))
        );
        assert_eq!(
            Proposal::pending("p1", Weights::new(), Utc::now()),
            Err(ValidationError::MissingField("newWeights"))
        );
    }

    #[test]
    fn proposal_persisted_field_names() {
        let weights = Weights::from([("A".to_owned(), dec!(1))]);
        let p = Proposal::pending("p1", weights, Utc::now()).expect("valid");
        let json = serde_json::to_value(&p).expect("encode");
        assert_eq!(json["proposalId"], "p1");
        assert_eq!(json["status"], "pending");
        assert!(json.get("receiveTime").is_some());
        assert!(json.get("newWeights").is_some());
    }

    #[test]
    fn connection_close_records_reason() {
        let now = Utc::now();
        let mut conn = Connection::new(
            1,
            7,
            &OperatorId::new("0.0.5", "0.0.6"),
            ConnectionStatus::Established,
            now,
        );
        assert!(conn.status.is_open());
        conn.close("stale", now);
        assert_eq!(conn.status, ConnectionStatus::Closed);
        assert_eq!(conn.close_reason.as_deref(), Some("stale"));
        assert!(!conn.status.is_open());
    }
}
