//! Blocking JSON-RPC client for the remote node behind forks and network environments.
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::common::{
    parse_bytes, parse_quantity, to_quantity, Addr, Bytes, Hash, QuantityVisitor, Wei,
    U256,
};

/// JSON-RPC error code returned for unknown methods.
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_REQUEST: i64 = -32600;
const UNSUPPORTED_HINTS: [&str; 5] =
    ["not found", "not supported", "unsupported", "not available", "does not exist"];

#[derive(Debug, thiserror::Error)]
pub enum RpcClientError {
    /// The message could not be sent to (or read back from) the remote node.
    #[error("failed to reach {endpoint}: {message}")]
    FailedToSend { endpoint: String, message: String },

    /// The server returned an error code.
    #[error("{endpoint} returned HTTP status {status}")]
    HttpStatus { endpoint: String, status: u16 },

    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),

    /// The request cannot be serialized as JSON.
    #[error(transparent)]
    InvalidJsonRequest(serde_json::Error),

    /// The server returned an invalid JSON-RPC response.
    #[error("response '{response}' failed to parse as {expected_type}: {error}")]
    InvalidResponse {
        response: String,
        expected_type: &'static str,
        error: serde_json::Error,
    },

    /// The JSON-RPC returned an error.
    #[error("{method} failed with {code}: {message}")]
    JsonRpcError {
        method: String,
        code: i64,
        message: String,
        /// The `data` member, as sent by nodes for reverted `eth_call`s.
        data: Option<String>,
    },

    #[error("gave up on {method} after {attempts} attempts: {last}")]
    RetriesExhausted {
        method: String,
        attempts: u32,
        last: Box<RpcClientError>,
    },

    #[error("no HTTP transport compiled in (enable the `http` feature)")]
    NoTransport,
}

impl RpcClientError {
    /// Whether sending the same request again may succeed.
    fn is_transient(&self) -> bool {
        match self {
            RpcClientError::FailedToSend { .. } => true,
            RpcClientError::HttpStatus { status, .. } => {
                *status == 429 || *status >= 500
            }
            _ => false,
        }
    }

    /// Whether the node does not offer the method at all, as opposed to failing to run it.
    /// Nodes disagree on how to say so: besides the standard code, some answer an invalid
    /// request or a server error saying the method is unknown, and gateways reject it over HTTP.
    pub fn is_unsupported_method(&self) -> bool {
        match self {
            RpcClientError::JsonRpcError { code, message, .. } => match *code {
                METHOD_NOT_FOUND => true,
                INVALID_REQUEST | -32099..=-32000 => {
                    let m = message.to_lowercase();
                    UNSUPPORTED_HINTS.iter().any(|s| m.contains(s))
                }
                _ => false,
            },
            RpcClientError::HttpStatus { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
            RpcClientError::RetriesExhausted { last, .. } => last.is_unsupported_method(),
            _ => false,
        }
    }

    /// JSON-RPC error code, if the node answered with one.
    pub fn code(&self) -> Option<i64> {
        match self {
            RpcClientError::JsonRpcError { code, .. } => Some(*code),
            RpcClientError::RetriesExhausted { last, .. } => last.code(),
            _ => None,
        }
    }

    /// Revert bytes carried in the error's `data` member.
    pub fn revert_data(&self) -> Option<Bytes> {
        match self {
            RpcClientError::JsonRpcError { data: Some(d), .. } => parse_bytes(d),
            _ => None,
        }
    }
}

/// Only keep scheme, host and port: endpoints often embed API keys.
pub fn mask_url(url: &url::Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}://{}:{}", url.scheme(), host, port),
        (Some(host), None) => format!("{}://{}", url.scheme(), host),
        _ => format!("{}://<unknown-host>", url.scheme()),
    }
}

/// Carries one JSON-RPC payload (a request object or a batch array) to the node.
pub trait Transport: Send + Sync {
    fn send(&self, payload: &Value) -> Result<Value, RpcClientError>;

    /// Printable endpoint, with credentials and paths removed.
    fn endpoint(&self) -> String;
}

#[cfg(feature = "http")]
pub struct HttpTransport {
    url: url::Url,
    client: reqwest::blocking::Client,
}

#[cfg(feature = "http")]
impl HttpTransport {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, RpcClientError> {
        let url = url::Url::parse(url)?;
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcClientError::FailedToSend {
                endpoint: mask_url(&url),
                message: e.to_string(),
            })?;
        Ok(Self { url, client })
    }
}

#[cfg(feature = "http")]
impl Transport for HttpTransport {
    fn send(&self, payload: &Value) -> Result<Value, RpcClientError> {
        let failed = |e: reqwest::Error| RpcClientError::FailedToSend {
            endpoint: self.endpoint(),
            // the error may quote the full url
            message: e.without_url().to_string(),
        };
        let resp = self
            .client
            .post(self.url.clone())
            .json(payload)
            .send()
            .map_err(failed)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RpcClientError::HttpStatus {
                endpoint: self.endpoint(),
                status: status.as_u16(),
            })
        }
        let text = resp.text().map_err(failed)?;
        serde_json::from_str(&text).map_err(|error| {
            RpcClientError::InvalidResponse {
                response: text,
                expected_type: "JSON",
                error,
            }
        })
    }

    fn endpoint(&self) -> String {
        mask_url(&self.url)
    }
}

/// Exponential backoff policy for transient failures.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub exponent_base: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_interval_ms: 250,
            max_interval_ms: 4000,
            exponent_base: 2,
        }
    }
}

impl RetryConfig {
    /// Fail on the first error.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let factor = (self.exponent_base as u64)
            .saturating_pow(attempt)
            .max(1);
        Duration::from_millis(
            self.min_interval_ms
                .saturating_mul(factor)
                .min(self.max_interval_ms),
        )
    }
}

/// Block selector accepted by state queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockId {
    Number(u64),
    Earliest,
    Latest,
    Safe,
    Finalized,
    Pending,
}

impl BlockId {
    pub fn is_symbolic(&self) -> bool {
        !matches!(self, BlockId::Number(_))
    }

    pub fn to_param(&self) -> Value {
        Value::String(self.to_string())
    }
}

impl Default for BlockId {
    fn default() -> Self {
        BlockId::Latest
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockId::Number(n) => write!(f, "{:#x}", n),
            BlockId::Earliest => f.write_str("earliest"),
            BlockId::Latest => f.write_str("latest"),
            BlockId::Safe => f.write_str("safe"),
            BlockId::Finalized => f.write_str("finalized"),
            BlockId::Pending => f.write_str("pending"),
        }
    }
}

impl FromStr for BlockId {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        Ok(match s {
            "earliest" => BlockId::Earliest,
            "latest" => BlockId::Latest,
            "safe" => BlockId::Safe,
            "finalized" => BlockId::Finalized,
            "pending" => BlockId::Pending,
            n => BlockId::Number(
                parse_quantity(n)
                    .filter(|v| v.bits() <= 64)
                    .ok_or_else(|| format!("invalid block identifier: {}", n))?
                    .low_u64(),
            ),
        })
    }
}

impl<'de> Deserialize<'de> for BlockId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn de_quantity<'de, D: Deserializer<'de>>(d: D) -> Result<U256, D::Error> {
    d.deserialize_str(QuantityVisitor)
}

fn de_opt_quantity<'de, D: Deserializer<'de>>(
    d: D,
) -> Result<Option<U256>, D::Error> {
    Option::<String>::deserialize(d)?
        .map(|s| {
            parse_quantity(&s).ok_or_else(|| {
                serde::de::Error::custom(format!("invalid quantity: {}", s))
            })
        })
        .transpose()
}

/// The header fields needed to pin a fork.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    #[serde(deserialize_with = "de_quantity")]
    pub number: U256,
    pub hash: Option<Hash>,
    #[serde(deserialize_with = "de_quantity")]
    pub timestamp: U256,
    #[serde(default, deserialize_with = "de_opt_quantity")]
    pub base_fee_per_gas: Option<U256>,
    #[serde(default, deserialize_with = "de_opt_quantity")]
    pub gas_limit: Option<U256>,
    pub miner: Option<Addr>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: Hash,
    #[serde(default, deserialize_with = "de_opt_quantity")]
    pub status: Option<U256>,
    pub contract_address: Option<Addr>,
    #[serde(deserialize_with = "de_quantity")]
    pub gas_used: U256,
    #[serde(default, deserialize_with = "de_opt_quantity")]
    pub block_number: Option<U256>,
}

impl TransactionReceipt {
    /// Pre-Byzantium receipts carry no status and are taken as successful.
    pub fn succeeded(&self) -> bool {
        self.status.map(|s| !s.is_zero()).unwrap_or(true)
    }
}

/// `eth_call` parameters.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CallRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<Addr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Wei>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas: Option<String>,
    pub data: Bytes,
}

#[derive(Deserialize)]
struct ErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize)]
struct Response {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    result: Value,
    error: Option<ErrorObject>,
}

pub struct RpcClient {
    transport: Box<dyn Transport>,
    retry: RetryConfig,
    next_id: AtomicU64,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("endpoint", &self.transport.endpoint())
            .finish()
    }
}

impl RpcClient {
    pub fn new(transport: Box<dyn Transport>, retry: RetryConfig) -> Self {
        Self {
            transport,
            retry,
            next_id: AtomicU64::new(1),
        }
    }

    /// Client over HTTP(S).
    pub fn http(url: &str, retry: RetryConfig) -> Result<Self, RpcClientError> {
        #[cfg(feature = "http")]
        {
            let transport = HttpTransport::new(url, Duration::from_secs(30))?;
            Ok(Self::new(Box::new(transport), retry))
        }
        #[cfg(not(feature = "http"))]
        {
            let _ = (url, retry);
            Err(RpcClientError::NoTransport)
        }
    }

    pub fn endpoint(&self) -> String {
        self.transport.endpoint()
    }

    fn with_retry<T>(
        &self, method: &str,
        f: impl Fn() -> Result<T, RpcClientError>,
    ) -> Result<T, RpcClientError> {
        let mut attempt = 0;
        loop {
            match f() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() => {
                    if attempt >= self.retry.max_retries {
                        warn!(
                            "{} on {} failed after {} attempts",
                            method,
                            self.endpoint(),
                            attempt + 1
                        );
                        return Err(RpcClientError::RetriesExhausted {
                            method: method.to_string(),
                            attempts: attempt + 1,
                            last: Box::new(e),
                        })
                    }
                    let delay = self.retry.delay(attempt);
                    debug!("{} failed ({}), retrying in {:?}", method, e, delay);
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn unpack(method: &str, resp: Response) -> Result<Value, RpcClientError> {
        match resp.error {
            Some(e) => Err(RpcClientError::JsonRpcError {
                method: method.to_string(),
                code: e.code,
                message: e.message,
                data: e.data.and_then(|d| d.as_str().map(String::from)),
            }),
            None => Ok(resp.result),
        }
    }

    fn parse<T: DeserializeOwned>(
        value: Value, expected_type: &'static str,
    ) -> Result<T, RpcClientError> {
        serde_json::from_value(value.clone()).map_err(|error| {
            RpcClientError::InvalidResponse {
                response: value.to_string(),
                expected_type,
                error,
            }
        })
    }

    /// Perform one JSON-RPC call, retrying transient failures.
    pub fn request<T: DeserializeOwned>(
        &self, method: &str, params: Value,
    ) -> Result<T, RpcClientError> {
        let value = self.with_retry(method, || {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let payload = json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            });
            debug!("rpc {} -> {}", method, self.endpoint());
            let resp: Response =
                Self::parse(self.transport.send(&payload)?, "JSON-RPC response")?;
            Self::unpack(method, resp)
        })?;
        Self::parse(value, std::any::type_name::<T>())
    }

    /// Send several calls in one JSON-RPC batch. Results come back in the order of `calls`.
    pub fn batch(
        &self, calls: &[(&str, Value)],
    ) -> Result<Vec<Value>, RpcClientError> {
        if calls.is_empty() {
            return Ok(Vec::new())
        }
        let label = calls
            .iter()
            .map(|(m, _)| *m)
            .collect::<Vec<_>>()
            .join(",");
        self.with_retry(&label, || {
            let first = self
                .next_id
                .fetch_add(calls.len() as u64, Ordering::Relaxed);
            let payload = Value::Array(
                calls
                    .iter()
                    .enumerate()
                    .map(|(i, (method, params))| {
                        json!({
                            "jsonrpc": "2.0",
                            "id": first + i as u64,
                            "method": method,
                            "params": params,
                        })
                    })
                    .collect(),
            );
            debug!("rpc batch [{}] -> {}", label, self.endpoint());
            let resps: Vec<Response> =
                Self::parse(self.transport.send(&payload)?, "JSON-RPC batch")?;
            let mut out = vec![Value::Null; calls.len()];
            let mut seen = vec![false; calls.len()];
            for resp in resps {
                let idx = resp
                    .id
                    .as_u64()
                    .and_then(|id| id.checked_sub(first))
                    .map(|i| i as usize)
                    .filter(|i| *i < calls.len())
                    .ok_or_else(|| RpcClientError::InvalidResponse {
                        response: resp.id.to_string(),
                        expected_type: "batch response id",
                        error: serde::de::Error::custom("unknown id"),
                    })?;
                seen[idx] = true;
                out[idx] = Self::unpack(calls[idx].0, resp)?;
            }
            if let Some(i) = seen.iter().position(|s| !s) {
                return Err(RpcClientError::JsonRpcError {
                    method: calls[i].0.to_string(),
                    code: 0,
                    message: "missing from batch response".into(),
                    data: None,
                })
            }
            Ok(out)
        })
    }

    pub fn chain_id(&self) -> Result<U256, RpcClientError> {
        self.quantity("eth_chainId", json!([]))
    }

    pub fn block_number(&self) -> Result<u64, RpcClientError> {
        Ok(self.quantity("eth_blockNumber", json!([]))?.low_u64())
    }

    pub fn gas_price(&self) -> Result<Wei, RpcClientError> {
        Ok(self.quantity("eth_gasPrice", json!([]))?.into())
    }

    fn quantity(
        &self, method: &str, params: Value,
    ) -> Result<U256, RpcClientError> {
        let s: String = self.request(method, params)?;
        parse_quantity(&s).ok_or_else(|| RpcClientError::InvalidResponse {
            response: s,
            expected_type: "quantity",
            error: serde::de::Error::custom("not a quantity"),
        })
    }

    pub fn get_block(
        &self, block: BlockId,
    ) -> Result<Option<BlockHeader>, RpcClientError> {
        self.request("eth_getBlockByNumber", json!([block.to_param(), false]))
    }

    pub fn get_balance(
        &self, addr: &Addr, block: BlockId,
    ) -> Result<Wei, RpcClientError> {
        Ok(self
            .quantity("eth_getBalance", json!([addr, block.to_param()]))?
            .into())
    }

    pub fn get_transaction_count(
        &self, addr: &Addr, block: BlockId,
    ) -> Result<u64, RpcClientError> {
        Ok(self
            .quantity("eth_getTransactionCount", json!([addr, block.to_param()]))?
            .low_u64())
    }

    pub fn get_code(
        &self, addr: &Addr, block: BlockId,
    ) -> Result<Bytes, RpcClientError> {
        self.request("eth_getCode", json!([addr, block.to_param()]))
    }

    pub fn get_storage_at(
        &self, addr: &Addr, slot: &Hash, block: BlockId,
    ) -> Result<U256, RpcClientError> {
        self.quantity(
            "eth_getStorageAt",
            json!([addr, to_quantity(&slot.clone().into()), block.to_param()]),
        )
    }

    pub fn call(
        &self, req: &CallRequest, block: BlockId,
    ) -> Result<Bytes, RpcClientError> {
        let req = serde_json::to_value(req)
            .map_err(RpcClientError::InvalidJsonRequest)?;
        self.request("eth_call", json!([req, block.to_param()]))
    }

    pub fn estimate_gas(
        &self, req: &CallRequest,
    ) -> Result<u64, RpcClientError> {
        let req = serde_json::to_value(req)
            .map_err(RpcClientError::InvalidJsonRequest)?;
        Ok(self.quantity("eth_estimateGas", json!([req]))?.low_u64())
    }

    pub fn send_raw_transaction(
        &self, raw: &[u8],
    ) -> Result<Hash, RpcClientError> {
        self.request(
            "eth_sendRawTransaction",
            json!([Bytes::from(raw).to_hex()]),
        )
    }

    pub fn get_transaction_receipt(
        &self, tx_hash: &Hash,
    ) -> Result<Option<TransactionReceipt>, RpcClientError> {
        self.request("eth_getTransactionReceipt", json!([tx_hash]))
    }

    /// `evm_snapshot` extension (anvil, hardhat, ganache).
    pub fn evm_snapshot(&self) -> Result<U256, RpcClientError> {
        self.quantity("evm_snapshot", json!([]))
    }

    pub fn evm_revert(&self, id: &U256) -> Result<bool, RpcClientError> {
        self.request("evm_revert", json!([to_quantity(id)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Scripted {
        replies: Mutex<Vec<Result<Value, RpcClientError>>>,
        sent: Mutex<Vec<Value>>,
    }

    impl Transport for Scripted {
        fn send(&self, payload: &Value) -> Result<Value, RpcClientError> {
            self.sent.lock().push(payload.clone());
            let mut replies = self.replies.lock();
            if replies.is_empty() {
                return Err(RpcClientError::FailedToSend {
                    endpoint: self.endpoint(),
                    message: "no more replies".into(),
                })
            }
            let reply = replies.remove(0)?;
            // echo the request id back
            Ok(match (payload.get("id"), reply) {
                (Some(id), Value::Object(mut m)) => {
                    m.insert("id".into(), id.clone());
                    Value::Object(m)
                }
                (_, r) => r,
            })
        }

        fn endpoint(&self) -> String {
            "http://scripted".into()
        }
    }

    fn client(replies: Vec<Result<Value, RpcClientError>>) -> RpcClient {
        RpcClient::new(
            Box::new(Scripted {
                replies: Mutex::new(replies),
                sent: Mutex::new(Vec::new()),
            }),
            RetryConfig {
                max_retries: 2,
                min_interval_ms: 0,
                max_interval_ms: 0,
                exponent_base: 2,
            },
        )
    }

    fn down() -> Result<Value, RpcClientError> {
        Err(RpcClientError::FailedToSend {
            endpoint: "http://scripted".into(),
            message: "connection refused".into(),
        })
    }

    #[test]
    fn test_retry_then_success() {
        let c = client(vec![down(), Ok(json!({"result": "0x2a"}))]);
        assert_eq!(c.chain_id().unwrap(), U256::from(42));
    }

    #[test]
    fn test_retries_exhausted() {
        let c = client(vec![down(), down(), down(), Ok(json!({"result": "0x1"}))]);
        match c.chain_id() {
            Err(RpcClientError::RetriesExhausted { attempts, .. }) => {
                assert_eq!(attempts, 3)
            }
            r => panic!("unexpected {:?}", r),
        }
    }

    #[test]
    fn test_json_rpc_error_not_retried() {
        let c = client(vec![
            Ok(json!({"error": {"code": -32601, "message": "method not found"}})),
            Ok(json!({"result": "0x1"})),
        ]);
        let err = c.evm_snapshot().unwrap_err();
        assert_eq!(err.code(), Some(METHOD_NOT_FOUND));
    }

    #[test]
    fn test_unsupported_method() {
        let rejected = |code: i64, message: &str| RpcClientError::JsonRpcError {
            method: "evm_snapshot".into(),
            code,
            message: message.into(),
            data: None,
        };
        assert!(rejected(METHOD_NOT_FOUND, "whatever").is_unsupported_method());
        assert!(
            rejected(INVALID_REQUEST, "Unsupported method: evm_snapshot").is_unsupported_method()
        );
        assert!(rejected(-32000, "method evm_revert not supported").is_unsupported_method());
        assert!(!rejected(-32000, "execution reverted").is_unsupported_method());
        assert!(!rejected(-32602, "method not found").is_unsupported_method());

        let http = |status: u16| RpcClientError::HttpStatus {
            endpoint: "http://scripted".into(),
            status,
        };
        assert!(http(405).is_unsupported_method());
        assert!(http(403).is_unsupported_method());
        assert!(!http(429).is_unsupported_method());
        assert!(!http(502).is_unsupported_method());

        let c = client(vec![
            Ok(json!({"error": {"code": -32004, "message": "Method not supported"}})),
        ]);
        assert!(c.evm_snapshot().unwrap_err().is_unsupported_method());
    }

    #[test]
    fn test_block_id() {
        assert_eq!("latest".parse::<BlockId>().unwrap(), BlockId::Latest);
        assert_eq!("0x10".parse::<BlockId>().unwrap(), BlockId::Number(16));
        assert_eq!("17".parse::<BlockId>().unwrap(), BlockId::Number(17));
        assert!("soon".parse::<BlockId>().is_err());
        assert_eq!(BlockId::Number(255).to_string(), "0xff");
        assert!(BlockId::Safe.is_symbolic());
    }

    #[test]
    fn test_mask_url() {
        let url = url::Url::parse("https://user:pw@rpc.example.org:8545/v3/KEY").unwrap();
        assert_eq!(mask_url(&url), "https://rpc.example.org:8545");
    }

    #[test]
    fn test_retry_delay() {
        let r = RetryConfig::default();
        assert_eq!(r.delay(0), Duration::from_millis(250));
        assert_eq!(r.delay(2), Duration::from_millis(1000));
        assert_eq!(r.delay(10), Duration::from_millis(4000));
    }
}
