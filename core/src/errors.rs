//! Error taxonomy for the escrow client.

use std::time::Duration;

use alloy::primitives::Address;
use thiserror::Error;

use escrow_transport::{TransportError, TxHash};
use escrow_types::{EscrowId, PartyName, TransitionError, UnknownStateCode};

use crate::ledger::NotFoundError;

/// Failure while bringing the client up. The only error class that aborts startup.
#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("configuration: {0}")]
    Config(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("identity '{name}' appears more than once in one registration")]
    DuplicateName { name: PartyName },
    #[error("failed to open session for '{name}': {source}")]
    Session {
        name: PartyName,
        #[source]
        source: TransportError,
    },
    #[error("failed to bind contract for '{name}': {source}")]
    Binding {
        name: PartyName,
        #[source]
        source: Box<EscrowError>,
    },
}

#[derive(Debug, Error)]
pub enum EscrowError {
    #[error(transparent)]
    Initialization(#[from] InitializationError),
    #[error("unknown identity '{name}'")]
    UnknownIdentity { name: String },
    #[error("no contract code at {address}")]
    ContractNotDeployed { address: Address },
    #[error("escrow {id}: local state is stale ({reason}); refresh and retry")]
    StaleLocalState { id: EscrowId, reason: TransitionError },
    #[error("{call} reverted: {reason}")]
    Reverted {
        call: String,
        tx_hash: Option<TxHash>,
        reason: String,
    },
    #[error("{call}: inclusion of {tx_hash} not observed within {elapsed:?}")]
    Timeout {
        call: String,
        tx_hash: TxHash,
        elapsed: Duration,
    },
    #[error(transparent)]
    NotFound(#[from] NotFoundError),
    #[error("invalid call {call}: {reason}")]
    InvalidCall { call: String, reason: String },
    #[error("{call}: {source}")]
    Transport {
        call: String,
        #[source]
        source: TransportError,
    },
    #[error("escrowStatus: {0}")]
    UnknownStateCode(#[from] UnknownStateCode),
}

impl EscrowError {
    /// Short stable label for reporting.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Initialization(_) => "initialization",
            Self::UnknownIdentity { .. } => "unknown-identity",
            Self::ContractNotDeployed { .. } => "contract-not-deployed",
            Self::StaleLocalState { .. } => "stale-local-state",
            Self::Reverted { .. } => "reverted",
            Self::Timeout { .. } => "timeout",
            Self::NotFound(_) => "not-found",
            Self::InvalidCall { .. } => "invalid-call",
            Self::Transport { .. } => "transport",
            Self::UnknownStateCode(_) => "unknown-state-code",
        }
    }

    pub(crate) fn from_transport(call: &str, source: TransportError) -> Self {
        match source {
            TransportError::Reverted { reason } => Self::Reverted {
                call: call.to_string(),
                tx_hash: None,
                reason,
            },
            source => Self::Transport {
                call: call.to_string(),
                source,
            },
        }
    }

    pub(crate) fn invalid_call(call: &str, reason: impl Into<String>) -> Self {
        Self::InvalidCall {
            call: call.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_reverts_become_reverted() {
        let err = EscrowError::from_transport(
            "confirmFulfillment",
            TransportError::Reverted {
                reason: "invalid state".into(),
            },
        );
        assert!(matches!(err, EscrowError::Reverted { tx_hash: None, .. }));
        assert_eq!(err.label(), "reverted");
        assert_eq!(err.to_string(), "confirmFulfillment reverted: invalid state");
    }

    #[test]
    fn other_transport_errors_keep_their_source() {
        let err = EscrowError::from_transport(
            "escrowStatus",
            TransportError::Http {
                status: 502,
                body: "bad gateway".into(),
            },
        );
        assert_eq!(err.label(), "transport");
        assert!(std::error::Error::source(&err).is_some());
    }
}
