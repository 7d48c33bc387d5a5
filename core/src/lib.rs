//! Multi-identity escrow client.
//!
//! Several named parties (buyer, seller, market, admin) act on one escrow contract
//! through a single client. The contract is the authority; this crate keeps an
//! advisory mirror of what it has seen confirmed.
//!
//! # Layers
//!
//! - [`IdentitySessionManager`]: one transport session per registered party.
//! - [`ContractBindingFactory`]: per-party handles on the contract interface.
//! - [`EscrowLedger`]: the local mirror, one lock per record.
//! - [`EscrowStateMachine`]: optimistic pre-checks and recording of confirmed outcomes.
//! - [`TransactionCoordinator`]: submission, inclusion waiting, status queries.
//! - [`EscrowClient`]: the facade tying them together.

mod binding;
mod client;
mod coordinator;
mod errors;
mod ledger;
mod machine;
mod report;
mod sessions;

#[cfg(test)]
mod testing;

pub use binding::{ContractBinding, ContractBindingFactory};
pub use client::{ClientOptions, CreateEscrow, EscrowClient};
pub use coordinator::{
    PendingSubmission, SubmissionStatus, TransactionCoordinator, receipt_position,
};
pub use errors::{EscrowError, InitializationError};
pub use ledger::{EscrowLedger, NotFoundError};
pub use machine::{EscrowStateMachine, Precheck};
pub use sessions::{DisplacedSession, IdentitySessionManager, OpenedSession};
