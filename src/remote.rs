use std::sync::Arc;

use log::{info, warn};
use serde_json::json;

use crate::common::{parse_quantity, Addr, Bytes, Hash, Wei, U256};
use crate::rpc::{BlockId, RpcClient, RpcClientError};

/// Blocks this far behind the head are treated as final.
pub const SAFE_BLOCK_DEPTH: u64 = 64;

/// A block identifier resolved to a concrete block at fork time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PinnedBlock {
    pub chain_id: U256,
    pub number: u64,
    pub hash: Option<Hash>,
    pub timestamp: U256,
    pub base_fee: Option<U256>,
    pub gas_limit: Option<u64>,
    pub coinbase: Option<Addr>,
    /// The block cannot be reorganized away, so its state may be cached forever.
    pub finalized: bool,
}

impl PinnedBlock {
    pub fn id(&self) -> BlockId {
        BlockId::Number(self.number)
    }
}

/// State queries against one remote node, pinned to a single block.
pub struct RemoteStateReader {
    client: Arc<RpcClient>,
    block: PinnedBlock,
}

impl RemoteStateReader {
    /// Resolve `block` (symbolic tags included) once and pin the reader to the result.
    pub fn pin(
        client: Arc<RpcClient>, block: BlockId,
    ) -> Result<Self, RpcClientError> {
        let chain_id = client.chain_id()?;
        let header = client.get_block(block)?.ok_or_else(|| {
            RpcClientError::JsonRpcError {
                method: "eth_getBlockByNumber".into(),
                code: 0,
                message: format!("block {} not found", block),
                data: None,
            }
        })?;
        let number = header.number.low_u64();
        let finalized = match block {
            BlockId::Earliest | BlockId::Safe | BlockId::Finalized => true,
            BlockId::Latest | BlockId::Pending => false,
            BlockId::Number(n) => {
                client.block_number()?.saturating_sub(n) >= SAFE_BLOCK_DEPTH
            }
        };
        if !finalized {
            warn!(
                "fork of {} pinned at non-finalized block {} ({})",
                client.endpoint(),
                number,
                block
            );
        }
        info!(
            "fork of {} (chain {}) pinned at block {}",
            client.endpoint(),
            chain_id,
            number
        );
        Ok(Self {
            block: PinnedBlock {
                chain_id,
                number,
                hash: header.hash,
                timestamp: header.timestamp,
                base_fee: header.base_fee_per_gas,
                gas_limit: header.gas_limit.map(|g| g.low_u64()),
                coinbase: header.miner,
                finalized,
            },
            client,
        })
    }

    pub fn block(&self) -> &PinnedBlock {
        &self.block
    }

    pub fn client(&self) -> &Arc<RpcClient> {
        &self.client
    }

    pub fn get_balance(&self, addr: &Addr) -> Result<Wei, RpcClientError> {
        self.client.get_balance(addr, self.block.id())
    }

    pub fn get_nonce(&self, addr: &Addr) -> Result<u64, RpcClientError> {
        self.client.get_transaction_count(addr, self.block.id())
    }

    pub fn get_code(&self, addr: &Addr) -> Result<Bytes, RpcClientError> {
        self.client.get_code(addr, self.block.id())
    }

    pub fn get_storage(
        &self, addr: &Addr, slot: &Hash,
    ) -> Result<U256, RpcClientError> {
        self.client.get_storage_at(addr, slot, self.block.id())
    }

    /// Balance, nonce and code in one round trip.
    pub fn get_account(
        &self, addr: &Addr,
    ) -> Result<(Wei, u64, Bytes), RpcClientError> {
        let block = self.block.id().to_param();
        let r = self.client.batch(&[
            ("eth_getBalance", json!([addr, block])),
            ("eth_getTransactionCount", json!([addr, block])),
            ("eth_getCode", json!([addr, block])),
        ])?;
        let quantity = |v: &serde_json::Value, what: &'static str| {
            v.as_str().and_then(parse_quantity).ok_or_else(|| {
                RpcClientError::InvalidResponse {
                    response: v.to_string(),
                    expected_type: what,
                    error: serde::de::Error::custom("not a quantity"),
                }
            })
        };
        let balance = quantity(&r[0], "balance")?;
        let nonce = quantity(&r[1], "nonce")?;
        let code: Bytes = serde_json::from_value(r[2].clone()).map_err(|error| {
            RpcClientError::InvalidResponse {
                response: r[2].to_string(),
                expected_type: "code",
                error,
            }
        })?;
        Ok((balance.into(), nonce.low_u64(), code))
    }

    /// Hash of an ancestor of the pinned block.
    pub fn get_block_hash(
        &self, number: u64,
    ) -> Result<Option<Hash>, RpcClientError> {
        Ok(self
            .client
            .get_block(BlockId::Number(number))?
            .and_then(|h| h.hash))
    }
}
