//! Chain transport for the escrow client.
//!
//! # Architecture
//!
//! - [`Transport`] opens one [`Session`] per credential against a single endpoint.
//! - [`Session`] is bound to one signing account: read calls, signed submissions,
//!   receipt lookups.
//! - [`EvmTransport`] implements both over Ethereum JSON-RPC, signing locally.
//!
//! Read requests are retried per [`retry::RetryConfig`]. Broadcasting a signed
//! transaction is attempted exactly once; a lost response leaves the outcome
//! for the caller to resolve by hash.

pub mod retry;

mod evm;
mod rpc;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256, Bytes, U256};
use thiserror::Error;

use escrow_types::Credential;

pub use evm::{EvmOptions, EvmTransport};

pub type TxHash = B256;

/// Boxed future returned by transport operations.
pub type TransportFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

const CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const TCP_KEEPALIVE_SECS: u64 = 60;
const POOL_MAX_IDLE_PER_HOST: usize = 16;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;
const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("endpoint reports chain {actual}, expected {expected}")]
    ChainMismatch { expected: u64, actual: u64 },
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("connection failed after {attempts} attempt(s): {message}")]
    Connection { attempts: u32, message: String },
    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("execution reverted: {reason}")]
    Reverted { reason: String },
    #[error("malformed response to {method}: {message}")]
    Decode {
        method: &'static str,
        message: String,
    },
    #[error("failed to sign transaction: {0}")]
    Signing(String),
}

/// A read-only contract call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub to: Address,
    pub input: Bytes,
}

/// A state-changing contract call to be signed by the session's account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub to: Address,
    pub input: Bytes,
    pub value: U256,
}

/// Inclusion record of a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub hash: TxHash,
    pub success: bool,
    pub block: u64,
    pub index: u64,
    pub gas_used: u64,
}

/// Where to read state from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockRef {
    #[default]
    Latest,
    Number(u64),
}

impl BlockRef {
    #[must_use]
    pub fn to_tag(self) -> String {
        match self {
            BlockRef::Latest => "latest".to_string(),
            BlockRef::Number(n) => format!("{n:#x}"),
        }
    }
}

/// Opens sessions against one endpoint.
pub trait Transport: Send + Sync {
    fn open_session<'a>(&'a self, credential: &'a Credential) -> TransportFut<'a, Arc<dyn Session>>;
}

/// An authenticated connection bound to one signing account.
pub trait Session: Send + Sync + fmt::Debug {
    fn account(&self) -> Address;

    fn chain_id(&self) -> u64;

    /// Deployed code at `address`; empty when nothing is deployed.
    fn code_at(&self, address: Address) -> TransportFut<'_, Bytes>;

    fn block_number(&self) -> TransportFut<'_, u64>;

    fn call(&self, request: CallRequest, block: BlockRef) -> TransportFut<'_, Bytes>;

    /// Sign and broadcast. Never retried. Returns the transaction hash.
    fn submit(&self, request: WriteRequest) -> TransportFut<'_, TxHash>;

    /// `None` while the transaction is not yet included.
    fn receipt(&self, hash: TxHash) -> TransportFut<'_, Option<Receipt>>;

    /// Whether the endpoint knows the transaction at all (pending or included).
    fn transaction_known(&self, hash: TxHash) -> TransportFut<'_, bool>;
}

/// `localhost` or a loopback IP, where plain HTTP is acceptable.
#[must_use]
pub fn is_loopback(url: &url::Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

/// Hardened HTTP client for one endpoint.
///
/// `allow_http` permits plain-HTTP URLs; otherwise only HTTPS is accepted.
pub fn http_client(
    allow_http: bool,
    request_timeout: Option<Duration>,
) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .timeout(request_timeout.unwrap_or(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)))
        .redirect(reqwest::redirect::Policy::none())
        .https_only(!allow_http)
        .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
        .build()
}

pub async fn read_capped_error_body(response: reqwest::Response) -> String {
    use futures_util::StreamExt;
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}
