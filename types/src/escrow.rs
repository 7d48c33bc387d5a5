//! Escrow lifecycle: states, events, the transition table, and the local record.
//!
//! The remote contract is the authority on every transition. The table here is the
//! client's copy of the same rules, used for optimistic pre-checks and for recording
//! confirmed outcomes.

use std::fmt;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ChainPosition, EscrowId, PartyName, Role};

pub const DEFAULT_FEE_PERCENT: u8 = 10;
pub const DEFAULT_TIMEOUT_DAYS: u64 = 30;

// ============================================================================
// States
// ============================================================================

/// Lifecycle state of one escrow. Wire codes are fixed: 0..=3 in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowState {
    Active,
    Fulfilled,
    Executed,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown escrow state code {0}")]
pub struct UnknownStateCode(pub u64);

impl EscrowState {
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            EscrowState::Active => 0,
            EscrowState::Fulfilled => 1,
            EscrowState::Executed => 2,
            EscrowState::Canceled => 3,
        }
    }

    pub fn from_code(code: u64) -> Result<Self, UnknownStateCode> {
        match code {
            0 => Ok(EscrowState::Active),
            1 => Ok(EscrowState::Fulfilled),
            2 => Ok(EscrowState::Executed),
            3 => Ok(EscrowState::Canceled),
            other => Err(UnknownStateCode(other)),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EscrowState::Active => "ACTIVE",
            EscrowState::Fulfilled => "FULFILLED",
            EscrowState::Executed => "EXECUTED",
            EscrowState::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for EscrowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Events & Transition Table
// ============================================================================

/// A state-changing call on the escrow contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EscrowEvent {
    Create,
    ConfirmFulfillment,
    ConfirmProductUsed,
    AdminCancel,
}

impl EscrowEvent {
    /// Remote function name, byte-for-byte.
    #[must_use]
    pub const fn call_name(self) -> &'static str {
        match self {
            EscrowEvent::Create => "createEscrow",
            EscrowEvent::ConfirmFulfillment => "confirmFulfillment",
            EscrowEvent::ConfirmProductUsed => "confirmProductUsed",
            EscrowEvent::AdminCancel => "adminCancelEscrow",
        }
    }

    /// Table entry for this event taken from `from` (`None` = no record yet).
    pub fn rule(self, from: Option<EscrowState>) -> Result<&'static TransitionRule, TransitionError> {
        if let Some(rule) = TRANSITIONS
            .iter()
            .find(|rule| rule.event == self && rule.from == from)
        {
            return Ok(rule);
        }
        Err(match from {
            None => TransitionError::Missing { event: self },
            Some(state) if self == EscrowEvent::Create => {
                TransitionError::AlreadyExists { state }
            }
            Some(state) => TransitionError::NotPermitted { from: state, event: self },
        })
    }

    /// State a confirmed occurrence of this event leaves the escrow in.
    #[must_use]
    pub const fn target(self) -> EscrowState {
        match self {
            EscrowEvent::Create => EscrowState::Active,
            EscrowEvent::ConfirmFulfillment => EscrowState::Fulfilled,
            EscrowEvent::ConfirmProductUsed => EscrowState::Executed,
            EscrowEvent::AdminCancel => EscrowState::Canceled,
        }
    }
}

impl fmt::Display for EscrowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.call_name())
    }
}

/// One row of the lifecycle table: `from` × `event` → `to`, guarded by `role`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRule {
    pub from: Option<EscrowState>,
    pub event: EscrowEvent,
    pub role: Role,
    pub to: EscrowState,
}

pub const TRANSITIONS: &[TransitionRule] = &[
    TransitionRule {
        from: None,
        event: EscrowEvent::Create,
        role: Role::Buyer,
        to: EscrowState::Active,
    },
    TransitionRule {
        from: Some(EscrowState::Active),
        event: EscrowEvent::ConfirmFulfillment,
        role: Role::Market,
        to: EscrowState::Fulfilled,
    },
    TransitionRule {
        from: Some(EscrowState::Fulfilled),
        event: EscrowEvent::ConfirmProductUsed,
        role: Role::Market,
        to: EscrowState::Executed,
    },
    TransitionRule {
        from: Some(EscrowState::Active),
        event: EscrowEvent::AdminCancel,
        role: Role::Admin,
        to: EscrowState::Canceled,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("{event} is not permitted from {from}")]
    NotPermitted { from: EscrowState, event: EscrowEvent },
    #[error("escrow already exists in state {state}")]
    AlreadyExists { state: EscrowState },
    #[error("{event} requires an existing escrow")]
    Missing { event: EscrowEvent },
}

// ============================================================================
// Terms
// ============================================================================

/// Market fee as a whole percentage, 0..=100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeePercent(u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("fee percent must be within 0..=100 (got {0})")]
pub struct FeePercentError(pub u32);

impl FeePercent {
    pub fn new(percent: u32) -> Result<Self, FeePercentError> {
        if percent > 100 {
            return Err(FeePercentError(percent));
        }
        Ok(Self(percent as u8))
    }

    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }
}

impl Default for FeePercent {
    fn default() -> Self {
        Self(DEFAULT_FEE_PERCENT)
    }
}

impl fmt::Display for FeePercent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// A registered party as referenced by an escrow: its name and on-chain account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Party {
    pub name: PartyName,
    pub address: Address,
}

/// Resolved arguments of a `createEscrow` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowTerms {
    pub buyer: Party,
    pub seller: Party,
    pub receiver: Party,
    pub market: Party,
    pub amount: U256,
    pub fee_percent: FeePercent,
    pub timeout_period: Duration,
}

// ============================================================================
// Record
// ============================================================================

/// Local mirror of one escrow. Never authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowRecord {
    id: EscrowId,
    terms: EscrowTerms,
    state: EscrowState,
    created_at: DateTime<Utc>,
    last_applied: Option<ChainPosition>,
}

impl EscrowRecord {
    /// Record for a freshly confirmed `createEscrow`.
    #[must_use]
    pub fn opened(
        id: EscrowId,
        terms: EscrowTerms,
        created_at: DateTime<Utc>,
        position: Option<ChainPosition>,
    ) -> Self {
        Self {
            id,
            terms,
            state: EscrowState::Active,
            created_at,
            last_applied: position,
        }
    }

    #[must_use]
    pub fn id(&self) -> &EscrowId {
        &self.id
    }

    #[must_use]
    pub fn terms(&self) -> &EscrowTerms {
        &self.terms
    }

    #[must_use]
    pub const fn state(&self) -> EscrowState {
        self.state
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub const fn last_applied(&self) -> Option<ChainPosition> {
        self.last_applied
    }

    /// Record a confirmed transition into `to` that landed at `position`.
    ///
    /// Ignored (returns `false`) when the record already reflects a newer remote change.
    pub fn apply_confirmed(&mut self, to: EscrowState, position: ChainPosition) -> bool {
        if self.last_applied.is_some_and(|applied| applied >= position) {
            return false;
        }
        self.state = to;
        self.last_applied = Some(position);
        true
    }

    /// Overwrite with an authoritative read taken at `position`.
    pub fn resync(&mut self, state: EscrowState, position: ChainPosition) -> bool {
        self.apply_confirmed(state, position)
    }
}
