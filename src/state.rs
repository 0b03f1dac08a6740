//! In-memory world state with versioned overlays.
//!
//! [MemState] keeps the mutable state as a stack of deltas on top of a read-only
//! [StateBackend]. The bottom delta (the *base*) holds everything that has been committed so far;
//! every call frame pushes another delta with [MemState::checkpoint] and either squashes it into
//! the one below ([MemState::consolidate]) or throws it away ([MemState::rollback]). A lookup walks
//! the deltas from the tip downwards and falls back to the backend on a miss, so a rollback costs
//! nothing and a snapshot only copies what has been touched.
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::common::{Addr, Hash, Wei, U256};
use crate::core::{Code, LogEntry, PlainCode};
use crate::error::StateError;

/// Read-only source of the state that has never been written locally.
pub trait StateBackend: Send + Sync {
    fn balance(&self, addr: &Addr) -> Result<Wei, StateError>;
    fn nonce(&self, addr: &Addr) -> Result<u64, StateError>;
    /// Code of the account. A missing account has empty code.
    fn code(&self, addr: &Addr) -> Result<Arc<dyn Code>, StateError>;
    fn storage(&self, addr: &Addr, key: &Hash) -> Result<U256, StateError>;
    /// Canonical hash of an ancestor block.
    fn block_hash(&self, number: u64) -> Result<Hash, StateError> {
        Ok(Hash::hash(&number.to_be_bytes()))
    }
}

/// A backend where no account exists.
pub struct EmptyState;

impl StateBackend for EmptyState {
    fn balance(&self, _addr: &Addr) -> Result<Wei, StateError> {
        Ok(Wei::zero().clone())
    }

    fn nonce(&self, _addr: &Addr) -> Result<u64, StateError> {
        Ok(0)
    }

    fn code(&self, _addr: &Addr) -> Result<Arc<dyn Code>, StateError> {
        Ok(empty_code())
    }

    fn storage(&self, _addr: &Addr, _key: &Hash) -> Result<U256, StateError> {
        Ok(U256::zero())
    }
}

pub fn empty_code() -> Arc<dyn Code> {
    static V: OnceCell<Arc<PlainCode>> = OnceCell::new();
    V.get_or_init(|| Arc::new(PlainCode::new(Vec::new().into())))
        .clone()
}

/// Local changes to one account.
#[derive(Clone, Default)]
pub struct AccountDelta {
    pub balance: Option<Wei>,
    pub nonce: Option<u64>,
    pub code: Option<Arc<dyn Code>>,
    pub storage: HashMap<Hash, U256>,
    /// The account was created or deleted here, so older deltas and the backend are hidden.
    pub reset: bool,
}

impl PartialEq for AccountDelta {
    fn eq(&self, other: &Self) -> bool {
        self.balance == other.balance &&
            self.nonce == other.nonce &&
            self.code.as_ref().map(|c| c.get_hash()) ==
                other.code.as_ref().map(|c| c.get_hash()) &&
            self.storage == other.storage &&
            self.reset == other.reset
    }
}

impl fmt::Debug for AccountDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountDelta")
            .field("balance", &self.balance)
            .field("nonce", &self.nonce)
            .field("code", &self.code.as_ref().map(|c| c.get_hash().clone()))
            .field("storage", &self.storage)
            .field("reset", &self.reset)
            .finish()
    }
}

#[derive(Clone, Default)]
struct StateDelta {
    accounts: HashMap<Addr, AccountDelta>,
    /// EIP-1153 transient storage, cleared at the end of every transaction.
    transient: HashMap<(Addr, Hash), U256>,
    logs: Vec<LogEntry>,
    destroyed: HashSet<Addr>,
    refund: i64,
}

impl StateDelta {
    fn absorb(&mut self, upper: StateDelta) {
        for (addr, ad) in upper.accounts {
            if ad.reset {
                self.accounts.insert(addr, ad);
                continue
            }
            let d = self.accounts.entry(addr).or_default();
            if ad.balance.is_some() {
                d.balance = ad.balance
            }
            if ad.nonce.is_some() {
                d.nonce = ad.nonce
            }
            if ad.code.is_some() {
                d.code = ad.code
            }
            d.storage.extend(ad.storage);
        }
        self.transient.extend(upper.transient);
        self.logs.extend(upper.logs);
        self.destroyed.extend(upper.destroyed);
        self.refund += upper.refund;
    }
}

/// Opaque copy of every locally touched account.
#[derive(Clone, Default, PartialEq, Debug)]
pub struct StateSnapshot {
    accounts: HashMap<Addr, AccountDelta>,
}

impl StateSnapshot {
    /// Number of accounts captured.
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn account(&self, addr: &Addr) -> Option<&AccountDelta> {
        self.accounts.get(addr)
    }
}

/// Side effects of a finished transaction that are not part of the account state.
#[derive(Default, Debug)]
pub struct TxEffects {
    pub logs: Vec<LogEntry>,
    pub destroyed: HashSet<Addr>,
    pub refund: i64,
}

pub struct MemState {
    base: StateDelta,
    revs: Vec<StateDelta>,
    backend: Arc<dyn StateBackend>,
}

impl MemState {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self {
            base: StateDelta::default(),
            revs: Vec::new(),
            backend,
        }
    }

    pub fn backend(&self) -> &Arc<dyn StateBackend> {
        &self.backend
    }

    #[inline(always)]
    fn top(&mut self) -> &mut StateDelta {
        match self.revs.last_mut() {
            Some(t) => t,
            None => &mut self.base,
        }
    }

    /// Deltas from the tip down to the base, restricted to the first `level` revisions.
    fn deltas(&self, level: usize) -> impl Iterator<Item = &StateDelta> {
        self.revs[..level.min(self.revs.len())]
            .iter()
            .rev()
            .chain(std::iter::once(&self.base))
    }

    /// `Some(Some(v))` on a hit, `Some(None)` when a reset hides older values, `None` on a miss.
    fn find<T>(
        &self, addr: &Addr, level: usize,
        f: impl Fn(&AccountDelta) -> Option<T>,
    ) -> Option<Option<T>> {
        for d in self.deltas(level) {
            if let Some(ad) = d.accounts.get(addr) {
                if let Some(v) = f(ad) {
                    return Some(Some(v))
                }
                if ad.reset {
                    return Some(None)
                }
            }
        }
        None
    }

    // versioning

    /// Start a new revision. Returns its id for the matching [rollback](Self::rollback) or
    /// [consolidate](Self::consolidate).
    pub fn checkpoint(&mut self) -> usize {
        self.revs.push(StateDelta::default());
        self.revs.len() - 1
    }

    /// Drop revision `id` and everything above it.
    pub fn rollback(&mut self, id: usize) {
        self.revs.truncate(id);
    }

    /// Squash revision `id` and everything above it into the revision below.
    pub fn consolidate(&mut self, id: usize) {
        while self.revs.len() > id {
            if let Some(upper) = self.revs.pop() {
                self.top().absorb(upper);
            }
        }
    }

    /// Number of open revisions above the base.
    pub fn depth(&self) -> usize {
        self.revs.len()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let mut flat = self.base.clone();
        for r in self.revs.iter() {
            flat.absorb(r.clone());
        }
        StateSnapshot {
            accounts: flat.accounts,
        }
    }

    pub fn restore(&mut self, snapshot: StateSnapshot) {
        self.revs.clear();
        self.base = StateDelta {
            accounts: snapshot.accounts,
            ..Default::default()
        };
    }

    /// Drain the per-transaction bookkeeping once everything is consolidated into the base.
    pub fn finalize_tx(&mut self) -> TxEffects {
        self.consolidate(0);
        self.base.transient.clear();
        TxEffects {
            logs: std::mem::take(&mut self.base.logs),
            destroyed: std::mem::take(&mut self.base.destroyed),
            refund: std::mem::take(&mut self.base.refund),
        }
    }

    // reads

    pub fn balance(&self, addr: &Addr) -> Result<Wei, StateError> {
        match self.find(addr, usize::MAX, |a| a.balance.clone()) {
            Some(v) => Ok(v.unwrap_or_default()),
            None => self.backend.balance(addr),
        }
    }

    pub fn nonce(&self, addr: &Addr) -> Result<u64, StateError> {
        match self.find(addr, usize::MAX, |a| a.nonce) {
            Some(v) => Ok(v.unwrap_or(0)),
            None => self.backend.nonce(addr),
        }
    }

    pub fn code(&self, addr: &Addr) -> Result<Arc<dyn Code>, StateError> {
        match self.find(addr, usize::MAX, |a| a.code.clone()) {
            Some(v) => Ok(v.unwrap_or_else(empty_code)),
            None => self.backend.code(addr),
        }
    }

    pub fn storage(&self, addr: &Addr, key: &Hash) -> Result<U256, StateError> {
        self.storage_below(addr, key, usize::MAX)
    }

    /// Storage value as seen by revisions below `id` (the value before revision `id` started).
    pub fn storage_below(
        &self, addr: &Addr, key: &Hash, id: usize,
    ) -> Result<U256, StateError> {
        match self.find(addr, id, |a| a.storage.get(key).copied()) {
            Some(v) => Ok(v.unwrap_or_default()),
            None => self.backend.storage(addr, key),
        }
    }

    /// EIP-161 emptiness: zero nonce, zero balance and no code.
    pub fn is_empty(&self, addr: &Addr) -> Result<bool, StateError> {
        Ok(self.nonce(addr)? == 0 &&
            self.balance(addr)?.is_zero() &&
            self.code(addr)?.as_bytes().is_empty())
    }

    pub fn transient(&self, addr: &Addr, key: &Hash) -> U256 {
        let k = (addr.clone(), key.clone());
        self.deltas(usize::MAX)
            .find_map(|d| d.transient.get(&k).copied())
            .unwrap_or_default()
    }

    pub fn block_hash(&self, number: u64) -> Result<Hash, StateError> {
        self.backend.block_hash(number)
    }

    // writes

    fn account_mut(&mut self, addr: &Addr) -> &mut AccountDelta {
        self.top().accounts.entry(addr.clone()).or_default()
    }

    pub fn set_balance(&mut self, addr: &Addr, balance: Wei) {
        self.account_mut(addr).balance = Some(balance);
    }

    pub fn set_nonce(&mut self, addr: &Addr, nonce: u64) {
        self.account_mut(addr).nonce = Some(nonce);
    }

    pub fn set_code(&mut self, addr: &Addr, code: Arc<dyn Code>) {
        self.account_mut(addr).code = Some(code);
    }

    pub fn set_storage(&mut self, addr: &Addr, key: &Hash, val: U256) {
        self.account_mut(addr).storage.insert(key.clone(), val);
    }

    pub fn set_transient(&mut self, addr: &Addr, key: &Hash, val: U256) {
        self.top().transient.insert((addr.clone(), key.clone()), val);
    }

    /// Wipe code, nonce and storage of `addr`, keeping (only) `balance`.
    pub fn reset_account(&mut self, addr: &Addr, balance: Wei) {
        self.top().accounts.insert(
            addr.clone(),
            AccountDelta {
                balance: Some(balance),
                reset: true,
                ..Default::default()
            },
        );
    }

    pub fn delete_account(&mut self, addr: &Addr) {
        self.reset_account(addr, Wei::zero().clone())
    }

    pub fn add_log(&mut self, log: LogEntry) {
        self.top().logs.push(log);
    }

    pub fn mark_destroyed(&mut self, addr: &Addr) {
        self.top().destroyed.insert(addr.clone());
    }

    pub fn add_refund(&mut self, gas: i64) {
        self.top().refund += gas;
    }

    pub fn add_balance(
        &mut self, addr: &Addr, val: &Wei,
    ) -> Result<Option<()>, StateError> {
        match self.balance(addr)?.checked_add(val) {
            Some(b) => {
                self.set_balance(addr, b);
                Ok(Some(()))
            }
            None => Ok(None),
        }
    }

    pub fn sub_balance(
        &mut self, addr: &Addr, val: &Wei,
    ) -> Result<Option<()>, StateError> {
        match self.balance(addr)?.checked_sub(val) {
            Some(b) => {
                self.set_balance(addr, b);
                Ok(Some(()))
            }
            None => Ok(None),
        }
    }

    /// Move `val` from `from` to `to`. `Ok(None)` if `from` cannot afford it.
    pub fn transfer(
        &mut self, from: &Addr, to: &Addr, val: &Wei,
    ) -> Result<Option<()>, StateError> {
        if val.is_zero() {
            return Ok(Some(()))
        }
        if self.sub_balance(from, val)?.is_none() {
            return Ok(None)
        }
        self.add_balance(to, val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem() -> MemState {
        MemState::new(Arc::new(EmptyState))
    }

    #[test]
    fn test_rollback_and_consolidate() {
        let mut s = mem();
        let a = Addr::from(1);
        let k = Hash::from(0);
        s.set_storage(&a, &k, 1.into());
        let r1 = s.checkpoint();
        s.set_storage(&a, &k, 2.into());
        let r2 = s.checkpoint();
        s.set_storage(&a, &k, 3.into());
        assert_eq!(s.storage(&a, &k).unwrap(), 3.into());
        assert_eq!(s.storage_below(&a, &k, r2).unwrap(), 2.into());
        assert_eq!(s.storage_below(&a, &k, r1).unwrap(), 1.into());
        s.rollback(r2);
        assert_eq!(s.storage(&a, &k).unwrap(), 2.into());
        s.consolidate(r1);
        assert_eq!(s.depth(), 0);
        assert_eq!(s.storage(&a, &k).unwrap(), 2.into());
    }

    #[test]
    fn test_reset_hides_older_values() {
        let mut s = mem();
        let a = Addr::from(7);
        s.set_storage(&a, &Hash::from(1), 9.into());
        s.set_nonce(&a, 3);
        let r = s.checkpoint();
        s.reset_account(&a, Wei::from(5));
        assert!(s.storage(&a, &Hash::from(1)).unwrap().is_zero());
        assert_eq!(s.nonce(&a).unwrap(), 0);
        assert_eq!(s.balance(&a).unwrap(), Wei::from(5));
        s.rollback(r);
        assert_eq!(s.nonce(&a).unwrap(), 3);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut s = mem();
        let a = Addr::from(2);
        s.set_balance(&a, Wei::from(10));
        let snap = s.snapshot();
        assert_eq!(snap.len(), 1);
        s.set_balance(&a, Wei::from(20));
        s.set_balance(&Addr::from(3), Wei::from(1));
        s.restore(snap.clone());
        assert_eq!(s.balance(&a).unwrap(), Wei::from(10));
        assert!(s.balance(&Addr::from(3)).unwrap().is_zero());
        assert_eq!(s.snapshot(), snap);
    }

    #[test]
    fn test_transfer() {
        let mut s = mem();
        let (a, b) = (Addr::from(1), Addr::from(2));
        s.set_balance(&a, Wei::from(10));
        assert!(s.transfer(&a, &b, &Wei::from(11)).unwrap().is_none());
        assert!(s.transfer(&a, &b, &Wei::from(4)).unwrap().is_some());
        assert_eq!(s.balance(&a).unwrap(), Wei::from(6));
        assert_eq!(s.balance(&b).unwrap(), Wei::from(4));
        assert!(!s.is_empty(&b).unwrap());
        assert!(s.is_empty(&Addr::from(3)).unwrap());
    }

    #[test]
    fn test_tx_effects() {
        let mut s = mem();
        let a = Addr::from(1);
        let r = s.checkpoint();
        s.set_transient(&a, &Hash::from(0), 1.into());
        s.add_refund(10);
        s.mark_destroyed(&a);
        let inner = s.checkpoint();
        s.add_refund(5);
        s.rollback(inner);
        s.consolidate(r);
        assert_eq!(s.transient(&a, &Hash::from(0)), 1.into());
        let fx = s.finalize_tx();
        assert_eq!(fx.refund, 10);
        assert!(fx.destroyed.contains(&a));
        assert!(s.transient(&a, &Hash::from(0)).is_zero());
    }
}
