//! Read-through access to a remote chain pinned at one block.
//!
//! [ForkedBackend] answers the reads of a [MemState] overlay that were never written locally:
//! first from its in-process memo, then from the on-disk [StorageCache], and finally from the
//! remote node (writing the answer back into the cache). Local writes never reach it.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, warn};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::cache::{CacheKind, StorageCache};
use crate::common::{
    parse_bytes, parse_quantity, to_quantity, Addr, Hash, Wei, U256,
};
use crate::core::{Code, PlainCode};
use crate::error::StateError;
use crate::remote::{PinnedBlock, RemoteStateReader};
use crate::rpc::{BlockId, RetryConfig, RpcClient, RpcClientError};
use crate::state::{MemState, StateBackend};

/// Environment variable overriding the default cache directory.
pub const CACHE_DIR_ENV: &str = "QENV_CACHE_DIR";

/// The simulated state of a fork: a local overlay over a [ForkedBackend].
pub type ForkedAccountStore = MemState;

/// `$QENV_CACHE_DIR`, or the per-user cache directory.
pub fn default_cache_dir() -> Option<PathBuf> {
    match std::env::var_os(CACHE_DIR_ENV) {
        Some(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => dirs::cache_dir().map(|d| d.join("qenv").join("fork")),
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ForkConfig {
    /// Block to pin; symbolic tags are resolved once.
    pub block: BlockId,
    /// `None` disables the on-disk cache.
    pub cache_dir: Option<PathBuf>,
    /// Also cache state of blocks that may still be reorganized.
    pub cache_unfinalized: bool,
    /// Treat accounts the node cannot deliver as empty instead of failing.
    pub assume_nonexistent: bool,
    pub retry: RetryConfig,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            block: BlockId::Safe,
            cache_dir: default_cache_dir(),
            cache_unfinalized: false,
            assume_nonexistent: false,
            retry: RetryConfig::default(),
        }
    }
}

impl ForkConfig {
    pub fn at(block: BlockId) -> Self {
        Self {
            block,
            ..Default::default()
        }
    }

    pub fn without_cache(mut self) -> Self {
        self.cache_dir = None;
        self
    }
}

#[derive(Clone)]
struct RemoteAccount {
    balance: Wei,
    nonce: u64,
    code: Arc<dyn Code>,
}

pub struct ForkedBackend {
    reader: RemoteStateReader,
    cache: StorageCache,
    assume_nonexistent: bool,
    accounts: Mutex<HashMap<Addr, RemoteAccount>>,
    storage: Mutex<HashMap<(Addr, Hash), U256>>,
    block_hashes: Mutex<HashMap<u64, Hash>>,
}

impl ForkedBackend {
    pub fn new(reader: RemoteStateReader, config: &ForkConfig) -> Self {
        let block = reader.block();
        let cache = match &config.cache_dir {
            None => StorageCache::disabled(),
            Some(_) if !block.finalized && !config.cache_unfinalized => {
                debug!(
                    "not caching state of non-finalized block {}",
                    block.number
                );
                StorageCache::disabled()
            }
            Some(dir) => {
                if !block.finalized {
                    warn!(
                        "caching state of non-finalized block {}: entries may go stale after a reorg",
                        block.number
                    );
                }
                StorageCache::open(dir, &block.chain_id)
            }
        };
        Self {
            reader,
            cache,
            assume_nonexistent: config.assume_nonexistent,
            accounts: Mutex::new(HashMap::new()),
            storage: Mutex::new(HashMap::new()),
            block_hashes: Mutex::new(HashMap::new()),
        }
    }

    /// Pin `config.block` on the node behind `client`.
    pub fn connect(
        client: Arc<RpcClient>, config: &ForkConfig,
    ) -> Result<Self, RpcClientError> {
        let reader = RemoteStateReader::pin(client, config.block)?;
        Ok(Self::new(reader, config))
    }

    pub fn block(&self) -> &PinnedBlock {
        self.reader.block()
    }

    pub fn cache(&self) -> &StorageCache {
        &self.cache
    }

    pub fn reader(&self) -> &RemoteStateReader {
        &self.reader
    }

    fn cached<T>(
        &self, addr: &Addr, kind: CacheKind, sub: Option<&Hash>,
        parse: impl Fn(&str) -> Option<T>,
    ) -> Option<T> {
        let raw = self.cache.get(self.block().number, addr, kind, sub)?;
        let v = parse(&raw);
        if v.is_none() {
            error!("ignoring unparsable cached {:?} of {}: {}", kind, addr, raw);
        }
        v
    }

    fn account_from_cache(&self, addr: &Addr) -> Option<RemoteAccount> {
        let balance = self.cached(addr, CacheKind::Balance, None, parse_quantity)?;
        let nonce = self.cached(addr, CacheKind::Nonce, None, parse_quantity)?;
        let code = self.cached(addr, CacheKind::Code, None, parse_bytes)?;
        Some(RemoteAccount {
            balance: balance.into(),
            nonce: nonce.low_u64(),
            code: Arc::new(PlainCode::new(code.into_inner().into())),
        })
    }

    fn account(&self, addr: &Addr) -> Result<RemoteAccount, StateError> {
        if let Some(a) = self.accounts.lock().get(addr) {
            return Ok(a.clone())
        }
        let acc = match self.account_from_cache(addr) {
            Some(a) => a,
            None => {
                debug!("fetching account {} at block {}", addr, self.block().number);
                match self.reader.get_account(addr) {
                    Ok((balance, nonce, code)) => {
                        let n = self.block().number;
                        let b: U256 = balance.clone().into();
                        self.cache.put(n, addr, CacheKind::Balance, None, &to_quantity(&b));
                        self.cache.put(
                            n,
                            addr,
                            CacheKind::Nonce,
                            None,
                            &to_quantity(&nonce.into()),
                        );
                        self.cache.put(n, addr, CacheKind::Code, None, &code.to_hex());
                        RemoteAccount {
                            balance,
                            nonce,
                            code: Arc::new(PlainCode::new(code.into_inner().into())),
                        }
                    }
                    Err(e) if self.assume_nonexistent => {
                        warn!("assuming {} does not exist: {}", addr, e);
                        RemoteAccount {
                            balance: Wei::zero().clone(),
                            nonce: 0,
                            code: crate::state::empty_code(),
                        }
                    }
                    Err(source) => {
                        return Err(StateError::Unavailable {
                            address: addr.clone(),
                            source,
                        })
                    }
                }
            }
        };
        // keep the first answer: code read once stays identical for the session
        Ok(self
            .accounts
            .lock()
            .entry(addr.clone())
            .or_insert(acc)
            .clone())
    }
}

impl StateBackend for ForkedBackend {
    fn balance(&self, addr: &Addr) -> Result<Wei, StateError> {
        Ok(self.account(addr)?.balance)
    }

    fn nonce(&self, addr: &Addr) -> Result<u64, StateError> {
        Ok(self.account(addr)?.nonce)
    }

    fn code(&self, addr: &Addr) -> Result<Arc<dyn Code>, StateError> {
        Ok(self.account(addr)?.code)
    }

    fn storage(&self, addr: &Addr, key: &Hash) -> Result<U256, StateError> {
        let mkey = (addr.clone(), key.clone());
        if let Some(v) = self.storage.lock().get(&mkey) {
            return Ok(*v)
        }
        let v = match self.cached(addr, CacheKind::Storage, Some(key), parse_quantity)
        {
            Some(v) => v,
            None => match self.reader.get_storage(addr, key) {
                Ok(v) => {
                    self.cache.put(
                        self.block().number,
                        addr,
                        CacheKind::Storage,
                        Some(key),
                        &to_quantity(&v),
                    );
                    v
                }
                Err(e) if self.assume_nonexistent => {
                    warn!("assuming slot {} of {} is empty: {}", key, addr, e);
                    U256::zero()
                }
                Err(source) => {
                    return Err(StateError::Unavailable {
                        address: addr.clone(),
                        source,
                    })
                }
            },
        };
        Ok(*self.storage.lock().entry(mkey).or_insert(v))
    }

    fn block_hash(&self, number: u64) -> Result<Hash, StateError> {
        if number > self.block().number {
            // simulated blocks past the fork point
            return Ok(Hash::hash(&number.to_be_bytes()))
        }
        if let Some(h) = self.block_hashes.lock().get(&number) {
            return Ok(h.clone())
        }
        let h = self
            .reader
            .get_block_hash(number)
            .map_err(|source| StateError::BlockUnavailable { number, source })?
            .unwrap_or_default();
        self.block_hashes.lock().insert(number, h.clone());
        Ok(h)
    }
}
