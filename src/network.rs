//! Broadcasting to a real node instead of simulating locally.
//!
//! Modifying calls and deployments are dry-run with `eth_call` first: a revert is reported without
//! spending anything, otherwise a signed legacy transaction is sent and its receipt awaited.
//! Non-modifying calls are a plain `eth_call`.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Deserialize;

use crate::common::{Addr, Bytes, Gas, Hash, Wei, U256};
use crate::core::{CallOutput, Deployed, ExecError};
use crate::error::{CallStackEntry, Error, ExecutionFailure, Result};
use crate::rpc::{
    BlockId, CallRequest, RetryConfig, RpcClient, RpcClientError,
    TransactionReceipt,
};
use crate::tx::{sign_legacy, Signer, TxLegacy};

/// JSON-RPC error code of a reverted `eth_call`/`eth_estimateGas`.
const EXECUTION_REVERTED: i64 = 3;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub poll_interval_ms: u64,
    /// Give up waiting for a receipt after this long.
    pub receipt_timeout_ms: u64,
    /// Fixed gas price; `eth_gasPrice` is asked otherwise.
    pub gas_price: Option<Wei>,
    pub retry: RetryConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            receipt_timeout_ms: 240_000,
            gas_price: None,
            retry: RetryConfig::default(),
        }
    }
}

pub struct NetworkEnv {
    client: Arc<RpcClient>,
    config: NetworkConfig,
    chain_id: U256,
    accounts: HashMap<Addr, Signer>,
    /// Next nonce per sender, as far as this process knows.
    nonces: HashMap<Addr, u64>,
}

impl std::fmt::Debug for NetworkEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkEnv")
            .field("endpoint", &self.client.endpoint())
            .field("chain_id", &self.chain_id)
            .finish()
    }
}

fn reverted(
    to: Option<&Addr>, calldata: &[u8], revert_data: Bytes, gas_used: Gas,
) -> Error {
    Error::ExecutionRevert(Box::new(ExecutionFailure {
        kind: ExecError::Reverted,
        revert_data,
        call_stack: vec![CallStackEntry {
            address: to.cloned().unwrap_or_default(),
            calldata: calldata.into(),
            depth: 0,
        }],
        pc_trail: Vec::new(),
        gas_used,
    }))
}

impl NetworkEnv {
    pub fn connect(url: &str, config: NetworkConfig) -> Result<Self> {
        let client = RpcClient::http(url, config.retry.clone())?;
        Self::with_client(Arc::new(client), config)
    }

    pub fn with_client(
        client: Arc<RpcClient>, config: NetworkConfig,
    ) -> Result<Self> {
        let chain_id = client.chain_id()?;
        info!("network env on {} (chain {})", client.endpoint(), chain_id);
        Ok(Self {
            client,
            config,
            chain_id,
            accounts: HashMap::new(),
            nonces: HashMap::new(),
        })
    }

    pub fn client(&self) -> &Arc<RpcClient> {
        &self.client
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn chain_id(&self) -> &U256 {
        &self.chain_id
    }

    /// Make `signer` available as a sender.
    pub fn add_account(&mut self, signer: Signer) -> Addr {
        let addr = signer.address().clone();
        self.accounts.insert(addr.clone(), signer);
        addr
    }

    pub fn has_account(&self, addr: &Addr) -> bool {
        self.accounts.contains_key(addr)
    }

    /// Any address with a known key, in address order.
    pub fn first_account(&self) -> Option<&Addr> {
        self.accounts.keys().min()
    }

    pub fn get_balance(&self, addr: &Addr) -> Result<Wei> {
        Ok(self.client.get_balance(addr, BlockId::Latest)?)
    }

    pub fn get_nonce(&self, addr: &Addr) -> Result<u64> {
        Ok(self.client.get_transaction_count(addr, BlockId::Latest)?)
    }

    pub fn get_code(&self, addr: &Addr) -> Result<Bytes> {
        Ok(self.client.get_code(addr, BlockId::Latest)?)
    }

    pub fn get_storage(&self, addr: &Addr, slot: &Hash) -> Result<U256> {
        Ok(self.client.get_storage_at(addr, slot, BlockId::Latest)?)
    }

    pub fn block_number(&self) -> Result<u64> {
        Ok(self.client.block_number()?)
    }

    pub fn timestamp(&self) -> Result<u64> {
        let header = self.client.get_block(BlockId::Latest)?.ok_or_else(|| {
            Error::InvalidInput("node has no latest block".into())
        })?;
        Ok(header.timestamp.low_u64())
    }

    fn gas_price(&self) -> Result<Wei> {
        match &self.config.gas_price {
            Some(p) => Ok(p.clone()),
            None => Ok(self.client.gas_price()?),
        }
    }

    fn next_nonce(&self, from: &Addr) -> Result<u64> {
        let remote = self.client.get_transaction_count(from, BlockId::Pending)?;
        Ok(match self.nonces.get(from) {
            Some(n) if *n > remote => *n,
            _ => remote,
        })
    }

    /// Run `req` with `eth_call`, turning a node-side revert into [Error::ExecutionRevert].
    fn dry_run(&self, req: &CallRequest, block: BlockId) -> Result<Bytes> {
        self.client.call(req, block).map_err(|e| {
            Self::revert_or_rpc(e, req.to.as_ref(), &req.data)
        })
    }

    fn revert_or_rpc(e: RpcClientError, to: Option<&Addr>, data: &[u8]) -> Error {
        let is_revert = e.code() == Some(EXECUTION_REVERTED) ||
            matches!(&e, RpcClientError::JsonRpcError { message, .. }
                if message.contains("revert"));
        if is_revert {
            debug!("node reverted: {}", e);
            reverted(to, data, e.revert_data().unwrap_or_default(), 0)
        } else {
            e.into()
        }
    }

    /// Sign, broadcast and wait for a transaction from `from`.
    pub fn send_transaction(
        &mut self, from: &Addr, to: Option<&Addr>, data: &[u8], value: Wei,
        gas: Option<Gas>,
    ) -> Result<TransactionReceipt> {
        if !self.accounts.contains_key(from) {
            return Err(Error::InvalidInput(format!(
                "no private key for sender {}",
                from
            )))
        }
        let gas = match gas {
            Some(g) => g,
            None => {
                let req = CallRequest {
                    from: Some(from.clone()),
                    to: to.cloned(),
                    value: Some(value.clone()),
                    gas: None,
                    data: data.into(),
                };
                self.client
                    .estimate_gas(&req)
                    .map_err(|e| Self::revert_or_rpc(e, to, data))?
            }
        };
        let nonce = self.next_nonce(from)?;
        let tx = TxLegacy::new(
            nonce,
            self.gas_price()?,
            gas,
            to.cloned(),
            value,
            data.into(),
        );
        let signer = self.accounts.get(from).ok_or_else(|| {
            Error::InvalidInput(format!("no private key for sender {}", from))
        })?;
        let tx = sign_legacy(tx, signer, self.chain_id);
        let tx_hash = self.client.send_raw_transaction(&tx.encode())?;
        self.nonces.insert(from.clone(), nonce + 1);
        info!("tx {} broadcast (nonce {})", tx_hash, nonce);

        let receipt = self.wait_for_receipt(&tx_hash)?;
        if !receipt.succeeded() {
            warn!("tx {} failed on chain", tx_hash);
            return Err(reverted(
                to,
                data,
                Bytes::empty(),
                receipt.gas_used.low_u64(),
            ))
        }
        Ok(receipt)
    }

    /// Poll for the receipt of `tx_hash`. A timeout leaves the outcome unknown.
    pub fn wait_for_receipt(&self, tx_hash: &Hash) -> Result<TransactionReceipt> {
        let deadline =
            Instant::now() + Duration::from_millis(self.config.receipt_timeout_ms);
        loop {
            if let Some(r) = self.client.get_transaction_receipt(tx_hash)? {
                debug!("tx {} mined in block {:?}", tx_hash, r.block_number);
                return Ok(r)
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    tx_hash: tx_hash.clone(),
                })
            }
            std::thread::sleep(Duration::from_millis(self.config.poll_interval_ms));
        }
    }

    pub fn call(
        &mut self, from: &Addr, to: &Addr, data: &[u8], value: Wei,
        gas: Option<Gas>, is_modifying: bool,
    ) -> Result<CallOutput> {
        let req = CallRequest {
            from: Some(from.clone()),
            to: Some(to.clone()),
            value: if value.is_zero() { None } else { Some(value.clone()) },
            gas: gas.map(|g| format!("0x{:x}", g)),
            data: data.into(),
        };
        if !is_modifying {
            let output = self.dry_run(&req, BlockId::Latest)?;
            return Ok(CallOutput {
                output,
                gas_used: 0,
                logs: Vec::new(),
            })
        }
        let output = self.dry_run(&req, BlockId::Pending)?;
        let receipt = self.send_transaction(from, Some(to), data, value, gas)?;
        Ok(CallOutput {
            output,
            gas_used: receipt.gas_used.low_u64(),
            logs: Vec::new(),
        })
    }

    pub fn deploy(
        &mut self, from: &Addr, bytecode: &[u8], ctor_args: &[u8], value: Wei,
        gas: Option<Gas>,
    ) -> Result<Deployed> {
        let mut data = bytecode.to_vec();
        data.extend_from_slice(ctor_args);
        let req = CallRequest {
            from: Some(from.clone()),
            to: None,
            value: if value.is_zero() { None } else { Some(value.clone()) },
            gas: gas.map(|g| format!("0x{:x}", g)),
            data: data.clone().into(),
        };
        self.dry_run(&req, BlockId::Pending)?;
        let receipt = self.send_transaction(from, None, &data, value, gas)?;
        let address = receipt.contract_address.clone().ok_or_else(|| {
            Error::InvalidInput(format!(
                "receipt of {} has no contract address",
                receipt.transaction_hash
            ))
        })?;
        info!("contract deployed at {}", address);
        Ok(Deployed {
            output: self.get_code(&address)?,
            address,
            gas_used: receipt.gas_used.low_u64(),
            logs: Vec::new(),
        })
    }

    /// Take a node-side snapshot (`evm_snapshot`).
    pub fn snapshot(&self) -> Result<U256> {
        self.client.evm_snapshot().map_err(|e| {
            if e.is_unsupported_method() {
                Error::UnsupportedOperation(format!(
                    "{} does not support evm_snapshot: {}",
                    self.client.endpoint(),
                    e
                ))
            } else {
                e.into()
            }
        })
    }

    pub fn revert(&mut self, id: &U256) -> Result<()> {
        let ok = self.client.evm_revert(id).map_err(|e| {
            if e.is_unsupported_method() {
                Error::UnsupportedOperation(format!(
                    "{} does not support evm_revert: {}",
                    self.client.endpoint(),
                    e
                ))
            } else {
                e.into()
            }
        })?;
        if !ok {
            return Err(Error::SnapshotDiscipline(format!(
                "node refused to revert to snapshot {}",
                id
            )))
        }
        // reverted transactions give their nonces back
        self.nonces.clear();
        Ok(())
    }
}
