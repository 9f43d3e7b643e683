//! Validation errors for inbound wire data.

use thiserror::Error;

/// A single inbound message failed validation. The message is dropped; other
/// messages in the same batch are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("malformed operator id {0:?}: expected <topic>@<account>")]
    MalformedOperatorId(String),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("negative weight {weight} for asset {asset}")]
    NegativeWeight { asset: String, weight: String },

    #[error("invalid envelope: {0}")]
    Envelope(String),

    #[error("invalid message body: {0}")]
    Body(String),
}

/// Rebalance arithmetic left the range a `Decimal` can hold.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdjustError {
    #[error("sum of balances overflows")]
    TotalOverflow,

    #[error("adjustment for asset {0} overflows")]
    Overflow(String),
}
