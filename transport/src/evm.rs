//! Ethereum JSON-RPC transport with local signing.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, B256, Bytes, U64, U256, hex};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use url::Url;

use escrow_types::Credential;

use crate::retry::RetryConfig;
use crate::rpc::RpcClient;
use crate::{
    BlockRef, CallRequest, Receipt, Session, Transport, TransportError, TransportFut, TxHash,
    WriteRequest,
};

#[derive(Debug, Clone)]
pub struct EvmOptions {
    /// Refuse endpoints that report a different chain.
    pub expected_chain_id: Option<u64>,
    /// Permit plain HTTP to non-loopback hosts.
    pub allow_insecure_http: bool,
    pub retry: RetryConfig,
    /// Gas limit as a percentage of the endpoint's estimate.
    pub gas_multiplier_percent: u32,
    pub request_timeout: Option<Duration>,
}

impl Default for EvmOptions {
    fn default() -> Self {
        Self {
            expected_chain_id: None,
            allow_insecure_http: false,
            retry: RetryConfig::default(),
            gas_multiplier_percent: 120,
            request_timeout: None,
        }
    }
}

/// JSON-RPC endpoint shared by every session opened from it.
#[derive(Debug)]
pub struct EvmTransport {
    rpc: Arc<RpcClient>,
    options: EvmOptions,
}

impl EvmTransport {
    pub fn new(url: Url, options: EvmOptions) -> Result<Self, TransportError> {
        let allow_http = match url.scheme() {
            "https" => false,
            "http" if options.allow_insecure_http || crate::is_loopback(&url) => true,
            "http" => {
                return Err(TransportError::InvalidEndpoint(format!(
                    "{url}: plain http is only allowed for loopback hosts"
                )));
            }
            other => {
                return Err(TransportError::InvalidEndpoint(format!(
                    "{url}: unsupported scheme '{other}'"
                )));
            }
        };
        let http = crate::http_client(allow_http, options.request_timeout)
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
        let rpc = Arc::new(RpcClient::new(http, url, options.retry.clone()));
        Ok(Self { rpc, options })
    }
}

impl Transport for EvmTransport {
    fn open_session<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> TransportFut<'a, Arc<dyn Session>> {
        Box::pin(async move {
            // The parse error is dropped so nothing derived from the key reaches logs.
            let signer: PrivateKeySigner = credential.expose().parse().map_err(|_| {
                TransportError::InvalidCredential("not a valid secp256k1 private key".to_string())
            })?;
            let account = signer.address();

            let chain: U64 = self.rpc.request("eth_chainId", json!([])).await?;
            let chain_id = chain.to::<u64>();
            if let Some(expected) = self.options.expected_chain_id
                && expected != chain_id
            {
                return Err(TransportError::ChainMismatch {
                    expected,
                    actual: chain_id,
                });
            }

            tracing::debug!(%account, chain_id, "Opened session");
            let session: Arc<dyn Session> = Arc::new(EvmSession {
                rpc: Arc::clone(&self.rpc),
                wallet: EthereumWallet::from(signer),
                account,
                chain_id,
                gas_multiplier_percent: self.options.gas_multiplier_percent.max(100),
                next_nonce: Mutex::new(None),
            });
            Ok(session)
        })
    }
}

struct EvmSession {
    rpc: Arc<RpcClient>,
    wallet: EthereumWallet,
    account: Address,
    chain_id: u64,
    gas_multiplier_percent: u32,
    /// Held across sign-and-broadcast so one account never races itself for a nonce.
    next_nonce: Mutex<Option<u64>>,
}

impl fmt::Debug for EvmSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvmSession")
            .field("account", &self.account)
            .field("chain_id", &self.chain_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: B256,
    block_number: Option<U64>,
    transaction_index: Option<U64>,
    status: Option<U64>,
    gas_used: U64,
}

impl RpcReceipt {
    fn into_receipt(self) -> Option<Receipt> {
        Some(Receipt {
            hash: self.transaction_hash,
            // Receipts without a status field predate EIP-658 and only exist for successes.
            success: self.status.is_none_or(|s| s == U64::from(1)),
            block: self.block_number?.to::<u64>(),
            index: self.transaction_index?.to::<u64>(),
            gas_used: self.gas_used.to::<u64>(),
        })
    }
}

impl EvmSession {
    async fn pending_nonce(&self) -> Result<u64, TransportError> {
        let nonce: U64 = self
            .rpc
            .request(
                "eth_getTransactionCount",
                json!([self.account, "pending"]),
            )
            .await?;
        Ok(nonce.to::<u64>())
    }

    async fn sign_and_broadcast(&self, request: WriteRequest) -> Result<TxHash, TransportError> {
        let mut next_nonce = self.next_nonce.lock().await;
        let nonce = match *next_nonce {
            Some(nonce) => nonce,
            None => self.pending_nonce().await?,
        };

        let gas_price: U256 = self.rpc.request("eth_gasPrice", json!([])).await?;
        if gas_price > U256::from(u128::MAX) {
            return Err(TransportError::Decode {
                method: "eth_gasPrice",
                message: format!("gas price {gas_price} out of range"),
            });
        }
        let gas_price = gas_price.to::<u128>();

        let estimate: U64 = self
            .rpc
            .request(
                "eth_estimateGas",
                json!([{
                    "from": self.account,
                    "to": request.to,
                    "data": request.input,
                    "value": request.value,
                }]),
            )
            .await?;
        let gas_limit =
            estimate.to::<u64>().saturating_mul(u64::from(self.gas_multiplier_percent)) / 100;

        let tx = TransactionRequest::default()
            .with_from(self.account)
            .with_to(request.to)
            .with_input(request.input)
            .with_value(request.value)
            .with_nonce(nonce)
            .with_chain_id(self.chain_id)
            .with_gas_limit(gas_limit)
            .with_gas_price(gas_price);
        let envelope = tx
            .build(&self.wallet)
            .await
            .map_err(|e| TransportError::Signing(e.to_string()))?;
        let raw = hex::encode_prefixed(envelope.encoded_2718());

        match self
            .rpc
            .request_once::<TxHash>("eth_sendRawTransaction", json!([raw]))
            .await
        {
            Ok(hash) => {
                *next_nonce = Some(nonce + 1);
                tracing::debug!(account = %self.account, nonce, tx_hash = %hash, "Broadcast transaction");
                Ok(hash)
            }
            Err(err) => {
                // Unknown whether the endpoint accepted it; re-read the nonce next time.
                *next_nonce = None;
                Err(err)
            }
        }
    }
}

impl Session for EvmSession {
    fn account(&self) -> Address {
        self.account
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn code_at(&self, address: Address) -> TransportFut<'_, Bytes> {
        Box::pin(async move {
            self.rpc
                .request("eth_getCode", json!([address, "latest"]))
                .await
        })
    }

    fn block_number(&self) -> TransportFut<'_, u64> {
        Box::pin(async move {
            let block: U64 = self.rpc.request("eth_blockNumber", json!([])).await?;
            Ok(block.to::<u64>())
        })
    }

    fn call(&self, request: CallRequest, block: BlockRef) -> TransportFut<'_, Bytes> {
        Box::pin(async move {
            self.rpc
                .request(
                    "eth_call",
                    json!([
                        {"from": self.account, "to": request.to, "data": request.input},
                        block.to_tag(),
                    ]),
                )
                .await
        })
    }

    fn submit(&self, request: WriteRequest) -> TransportFut<'_, TxHash> {
        Box::pin(self.sign_and_broadcast(request))
    }

    fn receipt(&self, hash: TxHash) -> TransportFut<'_, Option<Receipt>> {
        Box::pin(async move {
            let receipt: Option<RpcReceipt> = self
                .rpc
                .request("eth_getTransactionReceipt", json!([hash]))
                .await?;
            Ok(receipt.and_then(RpcReceipt::into_receipt))
        })
    }

    fn transaction_known(&self, hash: TxHash) -> TransportFut<'_, bool> {
        Box::pin(async move {
            let tx: Option<Value> = self
                .rpc
                .request("eth_getTransactionByHash", json!([hash]))
                .await?;
            Ok(tx.is_some())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // Well-known development key (anvil account 0).
    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const DEV_ACCOUNT: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
    const TX_HASH: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    fn options() -> EvmOptions {
        EvmOptions {
            retry: RetryConfig {
                max_retries: 1,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                jitter_factor: 0.0,
            },
            ..EvmOptions::default()
        }
    }

    fn result(value: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": value}))
    }

    async fn mount(server: &MockServer, rpc_method: &str, response: ResponseTemplate, times: u64) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": rpc_method})))
            .respond_with(response)
            .expect(times)
            .mount(server)
            .await;
    }

    async fn session(server: &MockServer) -> Arc<dyn Session> {
        let transport = EvmTransport::new(Url::parse(&server.uri()).unwrap(), options()).unwrap();
        let credential = Credential::new(DEV_KEY).unwrap();
        transport.open_session(&credential).await.unwrap()
    }

    fn write_request() -> WriteRequest {
        WriteRequest {
            to: Address::repeat_byte(0x42),
            input: Bytes::from_static(&[0xde, 0xad]),
            value: U256::from(1_000u64),
        }
    }

    #[tokio::test]
    async fn open_session_derives_account_and_chain() {
        let server = MockServer::start().await;
        mount(&server, "eth_chainId", result(json!("0x7a69")), 1).await;

        let session = session(&server).await;
        assert_eq!(session.account(), DEV_ACCOUNT.parse::<Address>().unwrap());
        assert_eq!(session.chain_id(), 31337);
    }

    #[tokio::test]
    async fn open_session_rejects_chain_mismatch() {
        let server = MockServer::start().await;
        mount(&server, "eth_chainId", result(json!("0x1")), 1).await;

        let transport = EvmTransport::new(
            Url::parse(&server.uri()).unwrap(),
            EvmOptions {
                expected_chain_id: Some(31337),
                ..options()
            },
        )
        .unwrap();
        let err = transport
            .open_session(&Credential::new(DEV_KEY).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::ChainMismatch {
                expected: 31337,
                actual: 1
            }
        ));
    }

    #[tokio::test]
    async fn open_session_rejects_malformed_key_without_echoing_it() {
        let server = MockServer::start().await;
        let transport = EvmTransport::new(Url::parse(&server.uri()).unwrap(), options()).unwrap();
        let err = transport
            .open_session(&Credential::new("0xnot-a-key-secret").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidCredential(_)));
        assert!(!err.to_string().contains("secret"));
    }

    #[test]
    fn remote_plain_http_requires_opt_in() {
        let url = Url::parse("http://node.example.com:8545").unwrap();
        assert!(matches!(
            EvmTransport::new(url.clone(), EvmOptions::default()),
            Err(TransportError::InvalidEndpoint(_))
        ));
        let opted_in = EvmOptions {
            allow_insecure_http: true,
            ..EvmOptions::default()
        };
        assert!(EvmTransport::new(url, opted_in).is_ok());
        assert!(
            EvmTransport::new(Url::parse("ws://localhost:8546").unwrap(), EvmOptions::default())
                .is_err()
        );
    }

    #[tokio::test]
    async fn submit_caches_nonce_between_broadcasts() {
        let server = MockServer::start().await;
        mount(&server, "eth_chainId", result(json!("0x7a69")), 1).await;
        mount(&server, "eth_getTransactionCount", result(json!("0x5")), 1).await;
        mount(&server, "eth_gasPrice", result(json!("0x3b9aca00")), 2).await;
        mount(&server, "eth_estimateGas", result(json!("0x5208")), 2).await;
        mount(&server, "eth_sendRawTransaction", result(json!(TX_HASH)), 2).await;

        let session = session(&server).await;
        let first = session.submit(write_request()).await.unwrap();
        let second = session.submit(write_request()).await.unwrap();
        assert_eq!(first, TX_HASH.parse::<TxHash>().unwrap());
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn failed_broadcast_is_not_retried_and_resets_nonce() {
        let server = MockServer::start().await;
        mount(&server, "eth_chainId", result(json!("0x7a69")), 1).await;
        mount(&server, "eth_getTransactionCount", result(json!("0x0")), 2).await;
        mount(&server, "eth_gasPrice", result(json!("0x1")), 2).await;
        mount(&server, "eth_estimateGas", result(json!("0x5208")), 2).await;
        mount(
            &server,
            "eth_sendRawTransaction",
            ResponseTemplate::new(503),
            2,
        )
        .await;

        let session = session(&server).await;
        for _ in 0..2 {
            let err = session.submit(write_request()).await.unwrap_err();
            assert!(matches!(err, TransportError::Http { status: 503, .. }));
        }
    }

    #[tokio::test]
    async fn revert_during_estimate_never_broadcasts() {
        let server = MockServer::start().await;
        mount(&server, "eth_chainId", result(json!("0x7a69")), 1).await;
        mount(&server, "eth_getTransactionCount", result(json!("0x0")), 1).await;
        mount(&server, "eth_gasPrice", result(json!("0x1")), 1).await;
        mount(
            &server,
            "eth_estimateGas",
            ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "error": {"code": 3, "message": "execution reverted: invalid state"}
            })),
            1,
        )
        .await;
        mount(&server, "eth_sendRawTransaction", result(json!(TX_HASH)), 0).await;

        let session = session(&server).await;
        let err = session.submit(write_request()).await.unwrap_err();
        assert!(matches!(err, TransportError::Reverted { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn receipt_decodes_inclusion_and_status() {
        let server = MockServer::start().await;
        mount(&server, "eth_chainId", result(json!("0x7a69")), 1).await;
        mount(
            &server,
            "eth_getTransactionReceipt",
            result(json!({
                "transactionHash": TX_HASH,
                "blockNumber": "0x10",
                "transactionIndex": "0x2",
                "status": "0x0",
                "gasUsed": "0x5208",
                "logs": []
            })),
            1,
        )
        .await;

        let session = session(&server).await;
        let receipt = session
            .receipt(TX_HASH.parse().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(!receipt.success);
        assert_eq!(receipt.block, 16);
        assert_eq!(receipt.index, 2);
        assert_eq!(receipt.gas_used, 21_000);
    }

    #[tokio::test]
    async fn unknown_transaction_has_no_receipt() {
        let server = MockServer::start().await;
        mount(&server, "eth_chainId", result(json!("0x7a69")), 1).await;
        mount(&server, "eth_getTransactionReceipt", result(Value::Null), 1).await;
        mount(&server, "eth_getTransactionByHash", result(Value::Null), 1).await;

        let session = session(&server).await;
        let hash: TxHash = TX_HASH.parse().unwrap();
        assert!(session.receipt(hash).await.unwrap().is_none());
        assert!(!session.transaction_known(hash).await.unwrap());
    }

    #[tokio::test]
    async fn call_reads_at_block() {
        let server = MockServer::start().await;
        mount(&server, "eth_chainId", result(json!("0x7a69")), 1).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "eth_call", "params": [{}, "0x9"]})))
            .respond_with(result(json!("0x0000000000000000000000000000000000000000000000000000000000000001")))
            .expect(1)
            .mount(&server)
            .await;

        let session = session(&server).await;
        let out = session
            .call(
                CallRequest {
                    to: Address::repeat_byte(0x42),
                    input: Bytes::new(),
                },
                BlockRef::Number(9),
            )
            .await
            .unwrap();
        assert_eq!(out.len(), 32);
        assert_eq!(out[31], 1);
    }
}
