//! In-process chain for tests: one escrow contract, accounts derived from credentials.
//!
//! Submissions are queued in a mempool and executed when mined. Nothing is simulated
//! at submit time, so a call that will fail still gets a hash and later a failed
//! receipt. Reads that fail revert immediately.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::ready;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use alloy::dyn_abi::{DynSolValue, JsonAbiExt};
use alloy::json_abi::JsonAbi;
use alloy::primitives::{Address, Bytes, U256, address, keccak256};
use chrono::Utc;

use escrow_transport::{
    BlockRef, CallRequest, Receipt, Session, Transport, TransportError, TransportFut, TxHash,
    WriteRequest,
};
use escrow_types::{
    ChainPosition, Credential, EscrowId, EscrowRecord, EscrowState, EscrowTerms, FeePercent,
    Identity, Party, PartyName, Role,
};

const CHAIN_ID: u64 = 31_337;
const CONTRACT: Address = address!("5fbdb2315678afecb367f032d93f642f64180aa3");
const BASE_GAS: u64 = 21_000;

pub(crate) const ONE_ETH: u128 = 1_000_000_000_000_000_000;

// ============================================================================
// Fixtures
// ============================================================================

pub(crate) fn escrow_interface() -> JsonAbi {
    let artifact: serde_json::Value =
        serde_json::from_str(include_str!("../tests/fixtures/Escrow.json")).unwrap();
    serde_json::from_value(artifact["abi"].clone()).unwrap()
}

pub(crate) fn credential(name: &str) -> Credential {
    Credential::new(format!("0x{name}-key")).unwrap()
}

pub(crate) fn identity(name: &str, role: Role) -> Identity {
    Identity::new(PartyName::new(name).unwrap(), credential(name), role)
}

/// Buyer, seller, market and admin, as the contract expects them.
pub(crate) fn standard_identities() -> Vec<Identity> {
    vec![
        identity("buyer", Role::Buyer),
        identity("seller", Role::Seller),
        identity("market", Role::Market),
        identity("admin", Role::Admin),
    ]
}

/// Account a simulated session signs with.
pub(crate) fn account_for(credential: &Credential) -> Address {
    Address::from_word(keccak256(credential.expose().as_bytes()))
}

pub(crate) fn party(name: &str) -> Party {
    Party {
        name: PartyName::new(name).unwrap(),
        address: account_for(&credential(name)),
    }
}

/// Active record for `id` created at position 1:0, receiver = buyer.
pub(crate) fn sample_record(id: &str) -> EscrowRecord {
    let terms = EscrowTerms {
        buyer: party("buyer"),
        seller: party("seller"),
        receiver: party("buyer"),
        market: party("market"),
        amount: U256::from(ONE_ETH),
        fee_percent: FeePercent::default(),
        timeout_period: Duration::from_secs(30 * 86_400),
    };
    EscrowRecord::opened(
        EscrowId::new(id),
        terms,
        Utc::now(),
        Some(ChainPosition::new(1, 0)),
    )
}

// ============================================================================
// Chain
// ============================================================================

struct SimEscrow {
    buyer: Address,
    market: Address,
    state: EscrowState,
    /// `(block, state)` in the order changes landed.
    history: Vec<(u64, EscrowState)>,
    secret: Option<U256>,
}

impl SimEscrow {
    fn state_at(&self, block: BlockRef) -> Option<EscrowState> {
        match block {
            BlockRef::Latest => Some(self.state),
            BlockRef::Number(n) => self
                .history
                .iter()
                .rev()
                .find(|(landed, _)| *landed <= n)
                .map(|(_, state)| *state),
        }
    }
}

struct SimTx {
    hash: TxHash,
    from: Address,
    input: Bytes,
    value: U256,
}

struct ChainState {
    automine: bool,
    interface: JsonAbi,
    admin: Address,
    block: u64,
    escrows: HashMap<String, SimEscrow>,
    mempool: Vec<SimTx>,
    receipts: HashMap<TxHash, Receipt>,
    nonces: HashMap<Address, u64>,
    submitted: usize,
    rejected: HashSet<String>,
    fail_next_broadcast: bool,
    code_hidden: bool,
}

#[derive(Clone)]
pub(crate) struct SimulatedChain {
    state: Arc<Mutex<ChainState>>,
}

impl SimulatedChain {
    /// Every submission is mined immediately into its own block.
    pub(crate) fn new() -> Self {
        Self::with_automine(true)
    }

    /// Submissions wait in the mempool until [`SimulatedChain::mine`].
    pub(crate) fn manual() -> Self {
        Self::with_automine(false)
    }

    fn with_automine(automine: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChainState {
                automine,
                interface: escrow_interface(),
                admin: account_for(&credential("admin")),
                block: 1,
                escrows: HashMap::new(),
                mempool: Vec::new(),
                receipts: HashMap::new(),
                nonces: HashMap::new(),
                submitted: 0,
                rejected: HashSet::new(),
                fail_next_broadcast: false,
                code_hidden: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(SimTransport {
            chain: self.clone(),
        })
    }

    pub(crate) fn contract(&self) -> Address {
        CONTRACT
    }

    pub(crate) fn reject_credential(&self, secret: &str) {
        self.lock().rejected.insert(secret.to_string());
    }

    pub(crate) fn fail_next_broadcast(&self) {
        self.lock().fail_next_broadcast = true;
    }

    /// Report no code at the contract address from now on.
    pub(crate) fn hide_contract(&self) {
        self.lock().code_hidden = true;
    }

    pub(crate) fn set_automine(&self, automine: bool) {
        self.lock().automine = automine;
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.lock().mempool.len()
    }

    /// Transactions accepted by the endpoint so far.
    pub(crate) fn submitted_count(&self) -> usize {
        self.lock().submitted
    }

    pub(crate) fn block(&self) -> u64 {
        self.lock().block
    }

    pub(crate) fn drop_pending(&self) {
        self.lock().mempool.clear();
    }

    /// Mine the mempool into one block in arrival order.
    pub(crate) fn mine(&self) {
        self.lock().mine(None);
    }

    /// Mine the mempool into one block, `first`'s transactions ahead of the rest.
    pub(crate) fn mine_prioritizing(&self, first: Address) {
        self.lock().mine(Some(first));
    }

    /// Authoritative state, bypassing any session.
    pub(crate) fn escrow_state(&self, id: &str) -> Option<EscrowState> {
        self.lock().escrows.get(id).map(|escrow| escrow.state)
    }

    pub(crate) fn stored_secret(&self, id: &str) -> Option<U256> {
        self.lock().escrows.get(id).and_then(|escrow| escrow.secret)
    }
}

impl ChainState {
    fn mine(&mut self, first: Option<Address>) {
        if self.mempool.is_empty() {
            return;
        }
        let mut batch = std::mem::take(&mut self.mempool);
        if let Some(first) = first {
            batch.sort_by_key(|tx| tx.from != first);
        }
        self.block += 1;
        let block = self.block;
        for (index, tx) in batch.into_iter().enumerate() {
            let success = self.execute(&tx, block).is_ok();
            self.receipts.insert(
                tx.hash,
                Receipt {
                    hash: tx.hash,
                    success,
                    block,
                    index: index as u64,
                    gas_used: BASE_GAS + tx.input.len() as u64 * 16,
                },
            );
        }
    }

    fn decode(&self, input: &[u8]) -> Result<(String, Vec<DynSolValue>), String> {
        if input.len() < 4 {
            return Err("missing selector".to_string());
        }
        let function = self
            .interface
            .functions()
            .find(|function| function.selector().as_slice() == &input[..4])
            .ok_or("unknown selector")?;
        let args = function
            .abi_decode_input(&input[4..], true)
            .map_err(|err| err.to_string())?;
        Ok((function.name.clone(), args))
    }

    fn execute(&mut self, tx: &SimTx, block: u64) -> Result<(), String> {
        let (name, args) = self.decode(&tx.input)?;
        let id = args
            .first()
            .and_then(DynSolValue::as_str)
            .ok_or("escrow id must be a string")?
            .to_string();

        if name == "createEscrow" {
            let addr = |i: usize| args.get(i).and_then(DynSolValue::as_address).ok_or("bad address");
            let uint = |i: usize| args.get(i).and_then(DynSolValue::as_uint).map(|(v, _)| v).ok_or("bad uint");
            let buyer = addr(1)?;
            let market = addr(4)?;
            if self.escrows.contains_key(&id) {
                return Err("escrow exists".to_string());
            }
            if tx.from != buyer {
                return Err("only buyer".to_string());
            }
            if tx.value != uint(5)? {
                return Err("value must equal amount".to_string());
            }
            if uint(6)? > U256::from(100u64) {
                return Err("fee too high".to_string());
            }
            self.escrows.insert(
                id,
                SimEscrow {
                    buyer,
                    market,
                    state: EscrowState::Active,
                    history: vec![(block, EscrowState::Active)],
                    secret: None,
                },
            );
            return Ok(());
        }

        let admin = self.admin;
        let escrow = self.escrows.get_mut(&id).ok_or("escrow not found")?;
        let (caller, from, to) = match name.as_str() {
            "confirmFulfillment" => (escrow.market, EscrowState::Active, EscrowState::Fulfilled),
            "confirmProductUsed" => (escrow.market, EscrowState::Fulfilled, EscrowState::Executed),
            "adminCancelEscrow" => (admin, EscrowState::Active, EscrowState::Canceled),
            "storeEncryptedData" => {
                if tx.from != admin && tx.from != escrow.buyer {
                    return Err("not allowed".to_string());
                }
                escrow.secret = args.get(1).and_then(DynSolValue::as_uint).map(|(v, _)| v);
                return Ok(());
            }
            other => return Err(format!("{other} is not a write")),
        };
        if tx.from != caller {
            return Err("unauthorized".to_string());
        }
        if escrow.state != from {
            return Err(format!("invalid state {}", escrow.state));
        }
        escrow.state = to;
        escrow.history.push((block, to));
        Ok(())
    }

    fn call(&self, request: &CallRequest, block: BlockRef) -> Result<Bytes, TransportError> {
        let revert = |reason: &str| TransportError::Reverted {
            reason: reason.to_string(),
        };
        if request.to != CONTRACT {
            return Ok(Bytes::new());
        }
        let (name, args) = self.decode(&request.input).map_err(|e| revert(&e))?;
        if name != "escrowStatus" {
            return Err(revert("not a view"));
        }
        let id = args.first().and_then(DynSolValue::as_str).unwrap_or_default();
        let state = self
            .escrows
            .get(id)
            .and_then(|escrow| escrow.state_at(block))
            .ok_or_else(|| revert("escrow not found"))?;
        let word = U256::from(state.code()).to_be_bytes::<32>();
        Ok(Bytes::copy_from_slice(&word))
    }

    fn submit(&mut self, from: Address, request: WriteRequest) -> Result<TxHash, TransportError> {
        if std::mem::take(&mut self.fail_next_broadcast) {
            return Err(TransportError::Http {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        let nonce = self.nonces.entry(from).or_default();
        let mut preimage = from.to_vec();
        preimage.extend_from_slice(&nonce.to_be_bytes());
        *nonce += 1;
        let hash = keccak256(preimage);

        self.submitted += 1;
        self.mempool.push(SimTx {
            hash,
            from,
            input: request.input,
            value: request.value,
        });
        if self.automine {
            self.mine(None);
        }
        Ok(hash)
    }
}

// ============================================================================
// Transport
// ============================================================================

struct SimTransport {
    chain: SimulatedChain,
}

impl Transport for SimTransport {
    fn open_session<'a>(&'a self, credential: &'a Credential) -> TransportFut<'a, Arc<dyn Session>> {
        let result = if self.chain.lock().rejected.contains(credential.expose()) {
            Err(TransportError::InvalidCredential("rejected".to_string()))
        } else {
            Ok(Arc::new(SimSession {
                account: account_for(credential),
                chain: self.chain.clone(),
            }) as Arc<dyn Session>)
        };
        Box::pin(ready(result))
    }
}

struct SimSession {
    account: Address,
    chain: SimulatedChain,
}

impl fmt::Debug for SimSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimSession")
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

impl Session for SimSession {
    fn account(&self) -> Address {
        self.account
    }

    fn chain_id(&self) -> u64 {
        CHAIN_ID
    }

    fn code_at(&self, address: Address) -> TransportFut<'_, Bytes> {
        let code = if address == CONTRACT && !self.chain.lock().code_hidden {
            Bytes::from_static(&[0x60, 0x80, 0x60, 0x40])
        } else {
            Bytes::new()
        };
        Box::pin(ready(Ok::<_, TransportError>(code)))
    }

    fn block_number(&self) -> TransportFut<'_, u64> {
        Box::pin(ready(Ok::<_, TransportError>(self.chain.block())))
    }

    fn call(&self, request: CallRequest, block: BlockRef) -> TransportFut<'_, Bytes> {
        let result = self.chain.lock().call(&request, block);
        Box::pin(ready(result))
    }

    fn submit(&self, request: WriteRequest) -> TransportFut<'_, TxHash> {
        let result = self.chain.lock().submit(self.account, request);
        Box::pin(ready(result))
    }

    fn receipt(&self, hash: TxHash) -> TransportFut<'_, Option<Receipt>> {
        let receipt = self.chain.lock().receipts.get(&hash).copied();
        Box::pin(ready(Ok::<_, TransportError>(receipt)))
    }

    fn transaction_known(&self, hash: TxHash) -> TransportFut<'_, bool> {
        let known = {
            let state = self.chain.lock();
            state.receipts.contains_key(&hash) || state.mempool.iter().any(|tx| tx.hash == hash)
        };
        Box::pin(ready(Ok::<_, TransportError>(known)))
    }
}
