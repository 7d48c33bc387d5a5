//! Lifecycle pre-checks and recording of confirmed transitions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use escrow_types::{
    ChainPosition, EscrowEvent, EscrowId, EscrowRecord, EscrowState, EscrowTerms, Identity,
};

use crate::errors::EscrowError;
use crate::ledger::{EscrowLedger, NotFoundError};

/// What the optimistic pre-check concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precheck {
    /// The mirror agrees the transition is possible.
    Consistent { from: Option<EscrowState> },
    /// No local record; only the remote side can judge.
    Untracked,
}

pub struct EscrowStateMachine {
    ledger: Arc<EscrowLedger>,
    /// Confirmed outcomes for escrows whose creation has not been recorded yet.
    held: Mutex<HashMap<EscrowId, Vec<(EscrowState, ChainPosition)>>>,
}

impl EscrowStateMachine {
    #[must_use]
    pub fn new(ledger: Arc<EscrowLedger>) -> Self {
        Self {
            ledger,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Optimistic check against the local mirror before submitting `event`.
    ///
    /// A failure means the mirror says the call would revert; nothing should be
    /// submitted. Success grants nothing. Role mismatches are logged, not enforced.
    pub async fn precheck(
        &self,
        id: &EscrowId,
        event: EscrowEvent,
        actor: &Identity,
    ) -> Result<Precheck, EscrowError> {
        let current = self.ledger.get(id).await.map(|record| record.state());
        if current.is_none() && event != EscrowEvent::Create {
            tracing::debug!(escrow_id = %id, call = event.call_name(), "No local record, deferring to remote");
            return Ok(Precheck::Untracked);
        }

        let rule = event
            .rule(current)
            .map_err(|reason| EscrowError::StaleLocalState {
                id: id.clone(),
                reason,
            })?;
        if actor.role() != rule.role {
            tracing::warn!(
                escrow_id = %id,
                call = event.call_name(),
                party = %actor.name(),
                role = %actor.role(),
                expected = %rule.role,
                "Role does not match transition table, remote will decide"
            );
        }
        Ok(Precheck::Consistent { from: current })
    }

    /// Record a confirmed `createEscrow`, folding in any outcome confirmed before it.
    ///
    /// A record already in the ledger with a newer chain position is kept.
    pub async fn record_created(
        &self,
        id: EscrowId,
        terms: EscrowTerms,
        position: ChainPosition,
    ) -> EscrowRecord {
        let mut held = self.held.lock().await;
        let mut record = EscrowRecord::opened(id, terms, Utc::now(), Some(position));
        for (to, at) in held.remove(record.id()).unwrap_or_default() {
            record.apply_confirmed(to, at);
        }
        let record = self.ledger.put(record).await;
        drop(held);
        tracing::info!(escrow_id = %record.id(), state = %record.state(), %position, "Escrow recorded");
        record
    }

    /// Record a confirmed transition. Outcomes older than what the record already
    /// reflects are ignored, so the mirror follows chain order.
    ///
    /// Returns `None` when the escrow is not tracked yet. The outcome is held and
    /// applied if its creation is recorded later.
    pub async fn record_confirmed(
        &self,
        id: &EscrowId,
        event: EscrowEvent,
        position: ChainPosition,
    ) -> Option<EscrowRecord> {
        let to = event.target();
        let mut applied = false;
        let mut held = self.held.lock().await;
        let Ok(record) = self
            .ledger
            .update(id, |record| applied = record.apply_confirmed(to, position))
            .await
        else {
            held.entry(id.clone()).or_default().push((to, position));
            tracing::info!(escrow_id = %id, call = event.call_name(), %position, "Confirmed before escrow was recorded, holding");
            return None;
        };
        drop(held);
        if applied {
            tracing::info!(escrow_id = %id, call = event.call_name(), state = %to, %position, "Transition recorded");
        } else {
            tracing::debug!(
                escrow_id = %id,
                call = event.call_name(),
                %position,
                current = %record.state(),
                "Confirmed outcome superseded by newer remote change"
            );
        }
        Some(record)
    }

    /// Overwrite the recorded state with an authoritative read taken at the end of `block`.
    pub async fn resync(
        &self,
        id: &EscrowId,
        state: EscrowState,
        block: u64,
    ) -> Result<EscrowRecord, NotFoundError> {
        let position = ChainPosition::end_of_block(block);
        let record = self
            .ledger
            .update(id, |record| {
                record.resync(state, position);
            })
            .await?;
        tracing::debug!(escrow_id = %id, state = %record.state(), block, "Ledger refreshed");
        Ok(record)
    }
}
