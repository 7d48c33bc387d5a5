//! Submission and inclusion tracking for state-changing calls.
//!
//! A write is broadcast once and handed back as a [`PendingSubmission`]. Waiting for
//! inclusion is a separate step. Nothing here ever re-broadcasts: a failed or
//! timed-out write is resolved with [`TransactionCoordinator::status`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::dyn_abi::DynSolValue;
use alloy::primitives::U256;

use escrow_transport::{BlockRef, Receipt, Session, TxHash};
use escrow_types::ChainPosition;

use crate::binding::ContractBinding;
use crate::errors::EscrowError;

const DEFAULT_INCLUSION_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// A broadcast write whose inclusion has not been observed yet.
#[derive(Debug, Clone)]
pub struct PendingSubmission {
    call: String,
    tx_hash: TxHash,
    session: Arc<dyn Session>,
    submitted_at: Instant,
}

impl PendingSubmission {
    #[must_use]
    pub fn call(&self) -> &str {
        &self.call
    }

    #[must_use]
    pub fn tx_hash(&self) -> TxHash {
        self.tx_hash
    }
}

/// Remote status of a submission, as far as the endpoint knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    Included(Receipt),
    Reverted(Receipt),
    /// Known to the endpoint but not yet included.
    Pending,
    /// The endpoint has no record of it.
    Unknown,
}

#[must_use]
pub fn receipt_position(receipt: &Receipt) -> ChainPosition {
    ChainPosition::new(receipt.block, receipt.index)
}

#[derive(Debug, Clone)]
pub struct TransactionCoordinator {
    inclusion_timeout: Duration,
    poll_interval: Duration,
}

impl Default for TransactionCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_INCLUSION_TIMEOUT, DEFAULT_POLL_INTERVAL)
    }
}

impl TransactionCoordinator {
    #[must_use]
    pub fn new(inclusion_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            inclusion_timeout,
            poll_interval,
        }
    }

    /// Encode, sign and broadcast `call`. Returns as soon as the endpoint accepts it.
    pub async fn submit(
        &self,
        binding: &ContractBinding,
        call: &str,
        args: &[DynSolValue],
        value: Option<U256>,
    ) -> Result<PendingSubmission, EscrowError> {
        let request = binding.encode_write(call, args, value.unwrap_or(U256::ZERO))?;
        let session = Arc::clone(binding.session());
        let tx_hash = session
            .submit(request)
            .await
            .map_err(|source| EscrowError::from_transport(call, source))?;
        tracing::info!(call, account = %session.account(), %tx_hash, "Submitted");
        Ok(PendingSubmission {
            call: call.to_string(),
            tx_hash,
            session,
            submitted_at: Instant::now(),
        })
    }

    /// View call through `binding`; no pending phase.
    pub async fn read(
        &self,
        binding: &ContractBinding,
        call: &str,
        args: &[DynSolValue],
        block: BlockRef,
    ) -> Result<Vec<DynSolValue>, EscrowError> {
        binding.read(call, args, block).await
    }

    /// Wait until `pending` is included, or `timeout` (default: configured) elapses.
    ///
    /// A timeout is terminal for this call; the submission may still land later.
    pub async fn await_inclusion(
        &self,
        pending: &PendingSubmission,
        timeout: Option<Duration>,
    ) -> Result<Receipt, EscrowError> {
        let limit = timeout.unwrap_or(self.inclusion_timeout);
        let receipt = tokio::time::timeout(limit, self.poll_receipt(pending))
            .await
            .map_err(|_| {
                tracing::warn!(call = %pending.call, tx_hash = %pending.tx_hash, ?limit, "Inclusion timed out");
                EscrowError::Timeout {
                    call: pending.call.clone(),
                    tx_hash: pending.tx_hash,
                    elapsed: limit,
                }
            })?;

        if !receipt.success {
            tracing::warn!(call = %pending.call, tx_hash = %pending.tx_hash, block = receipt.block, "Reverted");
            return Err(EscrowError::Reverted {
                call: pending.call.clone(),
                tx_hash: Some(pending.tx_hash),
                reason: format!("transaction failed in block {}", receipt.block),
            });
        }
        tracing::info!(
            call = %pending.call,
            tx_hash = %pending.tx_hash,
            block = receipt.block,
            index = receipt.index,
            gas_used = receipt.gas_used,
            waited_ms = pending.submitted_at.elapsed().as_millis(),
            "Included"
        );
        Ok(receipt)
    }

    /// Ask the endpoint what became of `pending`. Never re-broadcasts.
    pub async fn status(&self, pending: &PendingSubmission) -> Result<SubmissionStatus, EscrowError> {
        let call = pending.call.as_str();
        let receipt = pending
            .session
            .receipt(pending.tx_hash)
            .await
            .map_err(|source| EscrowError::from_transport(call, source))?;
        if let Some(receipt) = receipt {
            return Ok(if receipt.success {
                SubmissionStatus::Included(receipt)
            } else {
                SubmissionStatus::Reverted(receipt)
            });
        }
        let known = pending
            .session
            .transaction_known(pending.tx_hash)
            .await
            .map_err(|source| EscrowError::from_transport(call, source))?;
        Ok(if known {
            SubmissionStatus::Pending
        } else {
            SubmissionStatus::Unknown
        })
    }

    async fn poll_receipt(&self, pending: &PendingSubmission) -> Receipt {
        loop {
            match pending.session.receipt(pending.tx_hash).await {
                Ok(Some(receipt)) => return receipt,
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(call = %pending.call, tx_hash = %pending.tx_hash, error = %err, "Receipt poll failed");
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
