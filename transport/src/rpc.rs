//! Minimal Ethereum JSON-RPC client over HTTP.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::TransportError;
use crate::retry::{self, Delivery, RetryConfig};

/// JSON-RPC error code geth and anvil use for execution reverts.
const EXECUTION_REVERTED_CODE: i64 = 3;

#[derive(Debug, Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: &'a Value,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorObject>,
}

#[derive(Debug, Deserialize)]
struct ErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl ErrorObject {
    fn into_error(self) -> TransportError {
        if self.code == EXECUTION_REVERTED_CODE || self.message.to_ascii_lowercase().contains("revert") {
            let reason = match self.data {
                Some(Value::String(data)) if !data.is_empty() => format!("{} ({data})", self.message),
                _ => self.message,
            };
            TransportError::Reverted { reason }
        } else {
            TransportError::Rpc {
                code: self.code,
                message: self.message,
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct RpcClient {
    http: reqwest::Client,
    url: Url,
    retry: RetryConfig,
    next_id: AtomicU64,
}

impl RpcClient {
    pub(crate) fn new(http: reqwest::Client, url: Url, retry: RetryConfig) -> Self {
        Self {
            http,
            url,
            retry,
            next_id: AtomicU64::new(1),
        }
    }

    /// Idempotent request, retried per the client's policy.
    pub(crate) async fn request<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<T, TransportError> {
        self.request_with(method, &params, &self.retry).await
    }

    /// Single attempt. For requests with side effects.
    pub(crate) async fn request_once<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<T, TransportError> {
        self.request_with(method, &params, &RetryConfig::no_retry())
            .await
    }

    async fn request_with<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: &Value,
        policy: &RetryConfig,
    ) -> Result<T, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = Request {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };

        let delivery = retry::send(|| self.http.post(self.url.clone()).json(&body), policy).await;
        let response = match delivery {
            Delivery::Delivered(response) => response,
            Delivery::Rejected(response) => {
                let status = response.status().as_u16();
                let body = crate::read_capped_error_body(response).await;
                return Err(TransportError::Http { status, body });
            }
            Delivery::Unreachable { attempts, source } => {
                return Err(TransportError::Connection {
                    attempts,
                    message: source.to_string(),
                });
            }
        };

        let decode = |message: String| TransportError::Decode { method, message };
        let parsed: Response = response.json().await.map_err(|e| decode(e.to_string()))?;
        if let Some(error) = parsed.error {
            tracing::debug!(method, code = error.code, message = %error.message, "JSON-RPC error");
            return Err(error.into_error());
        }
        serde_json::from_value(parsed.result.unwrap_or(Value::Null)).map_err(|e| decode(e.to_string()))
    }
}
