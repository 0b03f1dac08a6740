//! A JSON-RPC node living in memory, for exercising forks and network environments without one.
//!
//! [MockChain] executes on qenv's own [Engine] over an empty backend. Every block reports the
//! current state: the chain keeps no history. Transactions are mined one per block as they
//! arrive unless auto-mining is turned off, in which case they wait for [MockChain::mine].
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use qenv::common::{parse_quantity, to_quantity, Addr, Bytes, Hash, Wei, U256};
use qenv::core::{Engine, ExecEnv, Message, PlainCode};
use qenv::remote::SAFE_BLOCK_DEPTH;
use qenv::rpc::{RetryConfig, RpcClient, RpcClientError, Transport, METHOD_NOT_FOUND};
use qenv::state::{EmptyState, StateSnapshot};
use qenv::tx::TxLegacy;
use qenv::Error;

pub const GENESIS_TIMESTAMP: u64 = 1_600_000_000;
pub const BLOCK_TIME: u64 = 12;
const CALL_GAS: u64 = 30_000_000;

struct Fault {
    code: i64,
    message: String,
    data: Option<String>,
}

impl Fault {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self::new(-32602, message)
    }
}

impl From<Error> for Fault {
    fn from(e: Error) -> Self {
        match &e {
            Error::ExecutionRevert(f) => Self {
                code: 3,
                message: "execution reverted".into(),
                data: Some(f.revert_data.to_hex()),
            },
            _ => Self::new(-32000, e.to_string()),
        }
    }
}

struct Node {
    engine: Engine,
    head: u64,
    receipts: HashMap<Hash, Value>,
    pending: Vec<(Hash, TxLegacy, Addr)>,
    snapshots: Vec<(StateSnapshot, u64)>,
}

impl Node {
    fn set_block(&mut self, number: u64) {
        let block = &mut self.engine.env.block;
        block.number = number.into();
        block.timestamp = (GENESIS_TIMESTAMP + number * BLOCK_TIME).into();
    }

    fn header(&self, number: u64) -> Value {
        json!({
            "number": to_quantity(&number.into()),
            "hash": Hash::hash(&number.to_be_bytes()),
            "parentHash": Hash::hash(&number.saturating_sub(1).to_be_bytes()),
            "timestamp": to_quantity(&(GENESIS_TIMESTAMP + number * BLOCK_TIME).into()),
            "baseFeePerGas": "0x0",
            "gasLimit": to_quantity(&self.engine.env.block.gas_limit.into()),
            "miner": Addr::zero(),
        })
    }

    fn resolve_block(&self, tag: &str) -> Result<u64, Fault> {
        Ok(match tag {
            "latest" | "pending" => self.head,
            "safe" | "finalized" => self.head.saturating_sub(SAFE_BLOCK_DEPTH),
            "earliest" => 0,
            n => parse_quantity(n)
                .ok_or_else(|| Fault::invalid(format!("bad block {}", n)))?
                .low_u64(),
        })
    }

    /// Run `msg` and throw away every effect.
    fn simulate(&mut self, msg: Message) -> Result<qenv::core::Executed, Fault> {
        let saved = self.engine.state().snapshot();
        let res = self.engine.execute(msg);
        self.engine.state_mut().restore(saved);
        Ok(res?)
    }

    fn mine_one(&mut self, hash: Hash, tx: TxLegacy, from: Addr) {
        self.head += 1;
        let head = self.head;
        self.set_block(head);
        let res = self.engine.execute(Message {
            from: from.clone(),
            to: tx.to().cloned(),
            value: tx.value().clone(),
            gas: tx.gas(),
            data: tx.data().clone(),
            is_static: false,
            create_at: None,
        });
        let (status, gas_used, contract) = match res {
            Ok(r) => (1u64, r.gas_used, r.contract),
            Err(e) => {
                debug!("mock tx {} failed: {}", hash, e);
                (0, e.failure().map(|f| f.gas_used).unwrap_or(tx.gas()), None)
            }
        };
        self.engine.state_mut().finalize_tx();
        let receipt = json!({
            "transactionHash": hash,
            "status": to_quantity(&status.into()),
            "contractAddress": contract,
            "gasUsed": to_quantity(&gas_used.into()),
            "blockNumber": to_quantity(&head.into()),
            "from": from,
            "to": tx.to(),
        });
        self.receipts.insert(hash, receipt);
    }
}

/// A fake Ethereum node answering JSON-RPC in memory.
pub struct MockChain {
    node: Mutex<Node>,
    chain_id: U256,
    calls: Mutex<HashMap<String, u64>>,
    offline: AtomicBool,
    snapshot_fault: Mutex<Option<(i64, String)>>,
    auto_mine: AtomicBool,
}

impl MockChain {
    pub fn new(chain_id: u64) -> Arc<Self> {
        let env = ExecEnv {
            chain_id: chain_id.into(),
            ..Default::default()
        };
        let mut node = Node {
            engine: Engine::new(env, Arc::new(EmptyState)),
            head: 0,
            receipts: HashMap::new(),
            pending: Vec::new(),
            snapshots: Vec::new(),
        };
        node.set_block(0);
        Arc::new(Self {
            node: Mutex::new(node),
            chain_id: chain_id.into(),
            calls: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
            snapshot_fault: Mutex::new(None),
            auto_mine: AtomicBool::new(true),
        })
    }

    /// A client talking to this chain.
    pub fn client(self: &Arc<Self>, retry: RetryConfig) -> Arc<RpcClient> {
        Arc::new(RpcClient::new(Box::new(MockTransport(self.clone())), retry))
    }

    /// How many times `method` was served, batched requests included.
    pub fn calls(&self, method: &str) -> u64 {
        self.calls.lock().get(method).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u64 {
        self.calls.lock().values().sum()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().clear();
    }

    /// Refuse every request at the transport level.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Answer `evm_snapshot`/`evm_revert`, or reject them as unknown methods.
    pub fn set_snapshots_supported(&self, supported: bool) {
        let fault = (!supported).then(|| {
            (METHOD_NOT_FOUND, "the method does not exist/is not available".to_string())
        });
        *self.snapshot_fault.lock() = fault;
    }

    /// Answer `evm_snapshot`/`evm_revert` with the given JSON-RPC error.
    pub fn reject_snapshots(&self, code: i64, message: &str) {
        *self.snapshot_fault.lock() = Some((code, message.to_string()));
    }

    /// With auto-mining off, transactions are accepted but get no receipt until [Self::mine].
    pub fn set_auto_mine(&self, auto: bool) {
        self.auto_mine.store(auto, Ordering::SeqCst);
    }

    /// Mine every pending transaction, one block each.
    pub fn mine(&self) {
        let mut node = self.node.lock();
        for (hash, tx, from) in std::mem::take(&mut node.pending) {
            node.mine_one(hash, tx, from);
        }
    }

    pub fn set_balance(&self, addr: &Addr, balance: Wei) {
        self.node.lock().engine.state_mut().set_balance(addr, balance);
    }

    pub fn set_nonce(&self, addr: &Addr, nonce: u64) {
        self.node.lock().engine.state_mut().set_nonce(addr, nonce);
    }

    pub fn set_code(&self, addr: &Addr, code: &[u8]) {
        self.node
            .lock()
            .engine
            .state_mut()
            .set_code(addr, Arc::new(PlainCode::new(code.to_vec().into())));
    }

    pub fn set_storage(&self, addr: &Addr, slot: &U256, value: U256) {
        self.node
            .lock()
            .engine
            .state_mut()
            .set_storage(addr, &slot.clone().into(), value);
    }

    /// Move the head to `number`. Useful to make old blocks final.
    pub fn set_head(&self, number: u64) {
        let mut node = self.node.lock();
        node.head = number;
        node.set_block(number);
    }

    pub fn head(&self) -> u64 {
        self.node.lock().head
    }

    pub fn storage(&self, addr: &Addr, slot: &U256) -> U256 {
        self.node
            .lock()
            .engine
            .state()
            .storage(addr, &slot.clone().into())
            .unwrap_or_default()
    }

    pub fn balance(&self, addr: &Addr) -> Wei {
        self.node
            .lock()
            .engine
            .state()
            .balance(addr)
            .unwrap_or_default()
    }

    fn serve(&self, req: &Value) -> Value {
        let id = req.get("id").cloned().unwrap_or(Value::Null);
        let method = req.get("method").and_then(Value::as_str).unwrap_or("");
        let params = req.get("params").cloned().unwrap_or_else(|| json!([]));
        *self.calls.lock().entry(method.to_string()).or_insert(0) += 1;
        match self.dispatch(method, &params) {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err(f) => {
                let mut error = json!({"code": f.code, "message": f.message});
                if let Some(data) = f.data {
                    error["data"] = Value::String(data);
                }
                json!({"jsonrpc": "2.0", "id": id, "error": error})
            }
        }
    }

    fn dispatch(&self, method: &str, params: &Value) -> Result<Value, Fault> {
        if method.starts_with("evm_") {
            if let Some((code, message)) = self.snapshot_fault.lock().clone() {
                return Err(Fault::new(code, message))
            }
        }
        let mut node = self.node.lock();
        Ok(match method {
            "eth_chainId" => json!(to_quantity(&self.chain_id)),
            "eth_blockNumber" => json!(to_quantity(&node.head.into())),
            "eth_gasPrice" => json!("0x3b9aca00"),
            "eth_getBlockByNumber" => {
                let n = node.resolve_block(&param::<String>(params, 0)?)?;
                if n > node.head {
                    Value::Null
                } else {
                    node.header(n)
                }
            }
            "eth_getBalance" => {
                let addr = param::<Addr>(params, 0)?;
                json!(node.engine.state().balance(&addr).map_err(Error::from)?)
            }
            "eth_getTransactionCount" => {
                let addr = param::<Addr>(params, 0)?;
                let mut n = node.engine.state().nonce(&addr).map_err(Error::from)?;
                if params.get(1).and_then(Value::as_str) == Some("pending") {
                    n += node.pending.iter().filter(|p| p.2 == addr).count() as u64;
                }
                json!(to_quantity(&n.into()))
            }
            "eth_getCode" => {
                let addr = param::<Addr>(params, 0)?;
                let code = node.engine.state().code(&addr).map_err(Error::from)?;
                json!(Bytes::from(code.as_bytes()))
            }
            "eth_getStorageAt" => {
                let addr = param::<Addr>(params, 0)?;
                let slot = parse_quantity(&param::<String>(params, 1)?)
                    .ok_or_else(|| Fault::invalid("bad slot"))?;
                let v = node
                    .engine
                    .state()
                    .storage(&addr, &slot.into())
                    .map_err(Error::from)?;
                let mut word = [0u8; 32];
                v.to_big_endian(&mut word);
                json!(Bytes::from(&word[..]))
            }
            "eth_call" => {
                let msg = call_message(params)?;
                json!(node.simulate(msg)?.output)
            }
            "eth_estimateGas" => {
                let msg = call_message(params)?;
                let used = node.simulate(msg)?.gas_used;
                json!(to_quantity(&(used + used / 5).into()))
            }
            "eth_sendRawTransaction" => {
                let raw = param::<Bytes>(params, 0)?;
                let tx = TxLegacy::decode(&raw)
                    .ok_or_else(|| Fault::invalid("undecodable transaction"))?;
                let from = tx
                    .recover_sender(&self.chain_id)
                    .ok_or_else(|| Fault::invalid("invalid signature"))?;
                let queued = node.pending.iter().filter(|p| p.2 == from).count() as u64;
                let expected =
                    node.engine.state().nonce(&from).map_err(Error::from)? + queued;
                if tx.nonce() != expected {
                    return Err(Fault::new(
                        -32000,
                        format!("nonce {} (expected {})", tx.nonce(), expected),
                    ))
                }
                let hash = tx.hash();
                if self.auto_mine.load(Ordering::SeqCst) {
                    node.mine_one(hash.clone(), tx, from);
                } else {
                    node.pending.push((hash.clone(), tx, from));
                }
                json!(hash)
            }
            "eth_getTransactionReceipt" => {
                let hash = param::<Hash>(params, 0)?;
                node.receipts.get(&hash).cloned().unwrap_or(Value::Null)
            }
            "evm_snapshot" => {
                let snap = (node.engine.state().snapshot(), node.head);
                node.snapshots.push(snap);
                json!(to_quantity(&(node.snapshots.len() as u64 - 1).into()))
            }
            "evm_revert" => {
                let id = parse_quantity(&param::<String>(params, 0)?)
                    .ok_or_else(|| Fault::invalid("bad snapshot id"))?
                    .low_u64() as usize;
                if id >= node.snapshots.len() {
                    return Ok(json!(false))
                }
                node.snapshots.truncate(id + 1);
                let (snap, head) = match node.snapshots.pop() {
                    Some(s) => s,
                    None => return Ok(json!(false)),
                };
                node.engine.state_mut().restore(snap);
                node.head = head;
                node.set_block(head);
                json!(true)
            }
            _ => {
                return Err(Fault::new(
                    METHOD_NOT_FOUND,
                    format!("the method {} does not exist/is not available", method),
                ))
            }
        })
    }
}

fn param<T: DeserializeOwned>(params: &Value, i: usize) -> Result<T, Fault> {
    let v = params
        .get(i)
        .ok_or_else(|| Fault::invalid(format!("missing parameter {}", i)))?;
    serde_json::from_value(v.clone())
        .map_err(|e| Fault::invalid(format!("parameter {}: {}", i, e)))
}

fn call_message(params: &Value) -> Result<Message, Fault> {
    let req = params
        .get(0)
        .ok_or_else(|| Fault::invalid("missing call object"))?;
    let field = |name: &str| req.get(name).filter(|v| !v.is_null());
    let from = match field("from") {
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| Fault::invalid(e.to_string()))?,
        None => Addr::zero().clone(),
    };
    let to = match field("to") {
        Some(v) => Some(
            serde_json::from_value(v.clone())
                .map_err(|e| Fault::invalid(e.to_string()))?,
        ),
        None => None,
    };
    let quantity = |name: &str| -> Result<Option<U256>, Fault> {
        field(name)
            .map(|v| {
                v.as_str()
                    .and_then(parse_quantity)
                    .ok_or_else(|| Fault::invalid(format!("bad {}", name)))
            })
            .transpose()
    };
    let data = match field("data").or_else(|| field("input")) {
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| Fault::invalid(e.to_string()))?,
        None => Bytes::empty(),
    };
    Ok(Message {
        from,
        to,
        value: quantity("value")?.unwrap_or_default().into(),
        gas: quantity("gas")?.map(|g| g.low_u64()).unwrap_or(CALL_GAS),
        data,
        is_static: false,
        create_at: None,
    })
}

/// [Transport] delivering requests straight to a [MockChain].
pub struct MockTransport(pub Arc<MockChain>);

impl Transport for MockTransport {
    fn send(&self, payload: &Value) -> Result<Value, RpcClientError> {
        if self.0.offline.load(Ordering::SeqCst) {
            return Err(RpcClientError::FailedToSend {
                endpoint: self.endpoint(),
                message: "connection refused".into(),
            })
        }
        Ok(match payload {
            Value::Array(reqs) => {
                Value::Array(reqs.iter().map(|r| self.0.serve(r)).collect())
            }
            req => self.0.serve(req),
        })
    }

    fn endpoint(&self) -> String {
        "mock://chain".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_method() {
        let chain = MockChain::new(7);
        let client = chain.client(RetryConfig::none());
        let err = client.request::<Value>("debug_nothing", json!([])).unwrap_err();
        assert_eq!(err.code(), Some(METHOD_NOT_FOUND));
        assert_eq!(client.chain_id().unwrap(), 7.into());
        assert_eq!(chain.calls("debug_nothing"), 1);
    }

    #[test]
    fn test_blocks() {
        let chain = MockChain::new(1);
        chain.set_head(100);
        let client = chain.client(RetryConfig::none());
        let safe = client
            .get_block(qenv::rpc::BlockId::Safe)
            .unwrap()
            .unwrap();
        assert_eq!(safe.number, (100 - SAFE_BLOCK_DEPTH).into());
        assert!(client
            .get_block(qenv::rpc::BlockId::Number(101))
            .unwrap()
            .is_none());
    }
}
