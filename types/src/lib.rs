//! Core domain types for the escrow client.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the workspace.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

mod escrow;
mod ids;

pub use alloy_primitives::{Address, B256, Bytes, U256};
pub use escrow::{
    DEFAULT_FEE_PERCENT, DEFAULT_TIMEOUT_DAYS, EscrowEvent, EscrowRecord, EscrowState,
    EscrowTerms, FeePercent, FeePercentError, Party, TRANSITIONS, TransitionError, TransitionRule,
    UnknownStateCode,
};
pub use ids::{ChainPosition, EscrowId};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// Party Names
// ============================================================================

/// Registered name of a party. Guaranteed non-empty after trimming.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PartyName(String);

#[derive(Debug, Error)]
#[error("party name must not be empty")]
pub struct EmptyPartyNameError;

impl PartyName {
    pub fn new(value: impl Into<String>) -> Result<Self, EmptyPartyNameError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            Err(EmptyPartyNameError)
        } else {
            Ok(Self(trimmed.to_string()))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PartyName {
    type Error = EmptyPartyNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for PartyName {
    type Error = EmptyPartyNameError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PartyName> for String {
    fn from(value: PartyName) -> Self {
        value.0
    }
}

impl AsRef<str> for PartyName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for PartyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Roles
// ============================================================================

/// Fixed capability class of an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Buyer,
    Seller,
    Market,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Buyer => "buyer",
            Role::Seller => "seller",
            Role::Market => "market",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Credentials & Identities
// ============================================================================

/// Private signing credential of an identity (hex-encoded secret key).
///
/// Note: `Debug` is manually implemented to redact the key value, preventing accidental
/// credential disclosure in logs or error messages.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

#[derive(Debug, Error)]
#[error("credential must not be empty")]
pub struct EmptyCredentialError;

impl Credential {
    pub fn new(secret: impl Into<String>) -> Result<Self, EmptyCredentialError> {
        let secret = secret.into();
        let trimmed = secret.trim();
        if trimmed.is_empty() {
            return Err(EmptyCredentialError);
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// A party allowed to act on the escrow contract. Immutable after registration.
#[derive(Debug, Clone)]
pub struct Identity {
    name: PartyName,
    credential: Credential,
    role: Role,
}

impl Identity {
    #[must_use]
    pub fn new(name: PartyName, credential: Credential, role: Role) -> Self {
        Self {
            name,
            credential,
            role,
        }
    }

    #[must_use]
    pub fn name(&self) -> &PartyName {
        &self.name
    }

    #[must_use]
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }
}
