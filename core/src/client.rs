//! Escrow client facade: one call surface per registered party.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use alloy::dyn_abi::DynSolValue;
use alloy::json_abi::JsonAbi;
use alloy::primitives::{Address, U256};
use futures_util::future::try_join_all;
use tokio::sync::RwLock;

use escrow_transport::{BlockRef, Receipt, Transport};
use escrow_types::{
    DEFAULT_TIMEOUT_DAYS, EscrowEvent, EscrowId, EscrowRecord, EscrowState, EscrowTerms,
    FeePercent, Identity, Party, PartyName,
};

use crate::binding::{ContractBinding, ContractBindingFactory};
use crate::coordinator::{
    PendingSubmission, SubmissionStatus, TransactionCoordinator, receipt_position,
};
use crate::errors::{EscrowError, InitializationError};
use crate::ledger::EscrowLedger;
use crate::machine::EscrowStateMachine;
use crate::report;
use crate::sessions::{DisplacedSession, IdentitySessionManager};

const SECS_PER_DAY: u64 = 24 * 60 * 60;
const STATUS_CALL: &str = "escrowStatus";
const STORE_CALL: &str = "storeEncryptedData";

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Default wait for inclusion of a write.
    pub inclusion_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            inclusion_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// `createEscrow` arguments by party name. The buyer submits.
#[derive(Debug, Clone)]
pub struct CreateEscrow {
    id: Option<EscrowId>,
    buyer: String,
    seller: String,
    receiver: Option<String>,
    market: String,
    amount: U256,
    fee_percent: FeePercent,
    timeout_period: Duration,
}

impl CreateEscrow {
    /// Receiver defaults to the buyer, fee to 10%, timeout to 30 days.
    pub fn new(
        buyer: impl Into<String>,
        seller: impl Into<String>,
        market: impl Into<String>,
        amount: U256,
    ) -> Self {
        Self {
            id: None,
            buyer: buyer.into(),
            seller: seller.into(),
            receiver: None,
            market: market.into(),
            amount,
            fee_percent: FeePercent::default(),
            timeout_period: Duration::from_secs(DEFAULT_TIMEOUT_DAYS * SECS_PER_DAY),
        }
    }

    pub fn id(mut self, id: EscrowId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn receiver(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    pub fn fee_percent(mut self, fee_percent: FeePercent) -> Self {
        self.fee_percent = fee_percent;
        self
    }

    pub fn timeout_period(mut self, timeout_period: Duration) -> Self {
        self.timeout_period = timeout_period;
        self
    }
}

pub struct EscrowClient {
    contract: Address,
    sessions: IdentitySessionManager,
    factory: ContractBindingFactory,
    bindings: RwLock<HashMap<PartyName, ContractBinding>>,
    ledger: Arc<EscrowLedger>,
    machine: EscrowStateMachine,
    coordinator: TransactionCoordinator,
}

impl EscrowClient {
    /// Open sessions for every identity and bind each to `contract`.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        interface: JsonAbi,
        contract: Address,
        identities: Vec<Identity>,
        options: ClientOptions,
    ) -> Result<Self, InitializationError> {
        let ledger = Arc::new(EscrowLedger::new());
        let client = Self {
            contract,
            sessions: IdentitySessionManager::new(transport),
            factory: ContractBindingFactory::new(interface),
            bindings: RwLock::new(HashMap::new()),
            machine: EscrowStateMachine::new(Arc::clone(&ledger)),
            ledger,
            coordinator: TransactionCoordinator::new(
                options.inclusion_timeout,
                options.poll_interval,
            ),
        };
        client.register(identities).await?;
        let parties = client.sessions.names().await.len();
        tracing::info!(contract = %contract, parties, "Escrow client ready");
        Ok(client)
    }

    /// Register (or re-register) identities and bind their sessions.
    ///
    /// Sessions are opened and bound before anything is registered, so a failed batch
    /// leaves existing parties untouched. Displaced sessions are handed back to the caller.
    pub async fn register(
        &self,
        identities: Vec<Identity>,
    ) -> Result<Vec<DisplacedSession>, InitializationError> {
        let opened = self.sessions.open(identities).await?;
        let bound = try_join_all(opened.iter().map(|candidate| async move {
            let binding = self
                .factory
                .bind(candidate.session(), self.contract)
                .await
                .map_err(|source| InitializationError::Binding {
                    name: candidate.name().clone(),
                    source: Box::new(source),
                })?;
            Ok::<_, InitializationError>((candidate.name().clone(), binding))
        }))
        .await?;

        let mut bindings = self.bindings.write().await;
        let displaced = self.sessions.commit(opened).await;
        bindings.extend(bound);
        Ok(displaced)
    }

    /// Drop a party's session and binding, handing the session back.
    pub async fn release(&self, name: &str) -> Option<DisplacedSession> {
        let displaced = self.sessions.release(name).await?;
        self.bindings.write().await.remove(&displaced.name);
        Some(displaced)
    }

    #[must_use]
    pub fn contract(&self) -> Address {
        self.contract
    }

    pub async fn parties(&self) -> Vec<PartyName> {
        self.sessions.names().await
    }

    /// Registered party with its on-chain account.
    pub async fn party(&self, name: &str) -> Result<Party, EscrowError> {
        let identity = self.sessions.identity(name).await?;
        let session = self.sessions.lookup(name).await?;
        Ok(Party {
            name: identity.name().clone(),
            address: session.account(),
        })
    }

    async fn binding(&self, name: &str) -> Result<ContractBinding, EscrowError> {
        let key = PartyName::new(name).map_err(|_| EscrowError::UnknownIdentity {
            name: name.to_string(),
        })?;
        self.bindings
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| EscrowError::UnknownIdentity {
                name: name.to_string(),
            })
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Create an escrow as the buyer and wait for it to be included.
    pub async fn create_escrow(&self, request: CreateEscrow) -> Result<EscrowRecord, EscrowError> {
        let buyer = self.party(&request.buyer).await?;
        let seller = self.party(&request.seller).await?;
        let receiver = match &request.receiver {
            Some(name) => self.party(name).await?,
            None => buyer.clone(),
        };
        let market = self.party(&request.market).await?;
        let id = request.id.unwrap_or_else(EscrowId::generate);

        let actor = self.sessions.identity(buyer.name.as_str()).await?;
        self.machine
            .precheck(&id, EscrowEvent::Create, &actor)
            .await?;

        let terms = EscrowTerms {
            buyer,
            seller,
            receiver,
            market,
            amount: request.amount,
            fee_percent: request.fee_percent,
            timeout_period: request.timeout_period,
        };
        let binding = self.binding(terms.buyer.name.as_str()).await?;
        tracing::info!(
            escrow_id = %id,
            party = %terms.buyer.name,
            amount = %terms.amount,
            fee = %terms.fee_percent,
            "Creating escrow"
        );
        let pending = self
            .coordinator
            .submit(
                &binding,
                EscrowEvent::Create.call_name(),
                &create_args(&id, &terms),
                Some(terms.amount),
            )
            .await?;
        let receipt = self.coordinator.await_inclusion(&pending, None).await?;
        Ok(self
            .machine
            .record_created(id, terms, receipt_position(&receipt))
            .await)
    }

    pub async fn confirm_fulfillment(&self, party: &str, id: &EscrowId) -> Result<Receipt, EscrowError> {
        self.transition(party, id, EscrowEvent::ConfirmFulfillment)
            .await
    }

    pub async fn confirm_product_used(&self, party: &str, id: &EscrowId) -> Result<Receipt, EscrowError> {
        self.transition(party, id, EscrowEvent::ConfirmProductUsed)
            .await
    }

    pub async fn admin_cancel(&self, party: &str, id: &EscrowId) -> Result<Receipt, EscrowError> {
        self.transition(party, id, EscrowEvent::AdminCancel).await
    }

    /// Pre-check and broadcast a lifecycle call without waiting for inclusion.
    ///
    /// Pair with [`EscrowClient::settle`]. A call that depends on this one's effect
    /// must not be submitted until `settle` returns.
    pub async fn submit(
        &self,
        party: &str,
        id: &EscrowId,
        event: EscrowEvent,
    ) -> Result<PendingSubmission, EscrowError> {
        if event == EscrowEvent::Create {
            return Err(EscrowError::invalid_call(
                event.call_name(),
                "use create_escrow to open an escrow",
            ));
        }
        let actor = self.sessions.identity(party).await?;
        let binding = self.binding(party).await?;
        self.machine.precheck(id, event, &actor).await?;
        tracing::info!(escrow_id = %id, party, call = event.call_name(), "Submitting transition");
        self.coordinator
            .submit(&binding, event.call_name(), &[id_arg(id)], None)
            .await
    }

    /// Wait for `pending` and record the confirmed transition in the ledger.
    ///
    /// If the escrow's creation has not been recorded yet, the outcome is held until it is.
    pub async fn settle(
        &self,
        id: &EscrowId,
        event: EscrowEvent,
        pending: &PendingSubmission,
        timeout: Option<Duration>,
    ) -> Result<Receipt, EscrowError> {
        let receipt = self.coordinator.await_inclusion(pending, timeout).await?;
        self.machine
            .record_confirmed(id, event, receipt_position(&receipt))
            .await;
        Ok(receipt)
    }

    /// What became of an earlier submission. Never re-broadcasts.
    pub async fn submission_status(
        &self,
        pending: &PendingSubmission,
    ) -> Result<SubmissionStatus, EscrowError> {
        self.coordinator.status(pending).await
    }

    async fn transition(&self, party: &str, id: &EscrowId, event: EscrowEvent) -> Result<Receipt, EscrowError> {
        let pending = self.submit(party, id, event).await?;
        self.settle(id, event, &pending, None).await
    }

    /// Store a secret against an escrow. Does not touch the ledger.
    pub async fn store_encrypted_data(
        &self,
        party: &str,
        id: &EscrowId,
        secret: U256,
    ) -> Result<Receipt, EscrowError> {
        let binding = self.binding(party).await?;
        let pending = self
            .coordinator
            .submit(
                &binding,
                STORE_CALL,
                &[id_arg(id), DynSolValue::Uint(secret, 256)],
                None,
            )
            .await?;
        self.coordinator.await_inclusion(&pending, None).await
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Authoritative state from the contract.
    pub async fn escrow_status(&self, party: &str, id: &EscrowId) -> Result<EscrowState, EscrowError> {
        let binding = self.binding(party).await?;
        let state = self.read_status(&binding, id, BlockRef::Latest).await?;
        tracing::info!(escrow_id = %id, party, state = %state, "Escrow status");
        Ok(state)
    }

    /// Re-read the escrow's state at the current block and overwrite the mirror.
    pub async fn refresh(&self, party: &str, id: &EscrowId) -> Result<EscrowRecord, EscrowError> {
        let binding = self.binding(party).await?;
        let block = binding
            .session()
            .block_number()
            .await
            .map_err(|source| EscrowError::from_transport("eth_blockNumber", source))?;
        let state = self.read_status(&binding, id, BlockRef::Number(block)).await?;
        Ok(self.machine.resync(id, state, block).await?)
    }

    async fn read_status(
        &self,
        binding: &ContractBinding,
        id: &EscrowId,
        block: BlockRef,
    ) -> Result<EscrowState, EscrowError> {
        let outputs = self
            .coordinator
            .read(binding, STATUS_CALL, &[id_arg(id)], block)
            .await?;
        let (code, _) = outputs
            .first()
            .and_then(DynSolValue::as_uint)
            .ok_or_else(|| EscrowError::invalid_call(STATUS_CALL, "expected an integer state code"))?;
        let code = if code > U256::from(u64::MAX) {
            u64::MAX
        } else {
            code.to::<u64>()
        };
        Ok(EscrowState::from_code(code)?)
    }

    pub async fn escrow(&self, id: &EscrowId) -> Option<EscrowRecord> {
        self.ledger.get(id).await
    }

    /// Local mirror in creation order.
    pub async fn escrows(&self) -> Vec<(EscrowId, EscrowRecord)> {
        self.ledger.list().await
    }

    pub async fn report(&self) -> String {
        report::render(&self.escrows().await)
    }
}

fn id_arg(id: &EscrowId) -> DynSolValue {
    DynSolValue::String(id.as_str().to_string())
}

/// `createEscrow(id, buyer, seller, receiver, market, amount, feePercent, timeoutPeriod)`
fn create_args(id: &EscrowId, terms: &EscrowTerms) -> Vec<DynSolValue> {
    vec![
        id_arg(id),
        DynSolValue::Address(terms.buyer.address),
        DynSolValue::Address(terms.seller.address),
        DynSolValue::Address(terms.receiver.address),
        DynSolValue::Address(terms.market.address),
        DynSolValue::Uint(terms.amount, 256),
        DynSolValue::Uint(U256::from(terms.fee_percent.value()), 256),
        DynSolValue::Uint(U256::from(terms.timeout_period.as_secs()), 256),
    ]
}
