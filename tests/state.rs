use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use qenv::common::*;
use qenv::core::Code;
use qenv::error::StateError;
use qenv::state::*;

/// A fixed backing store that counts how often it is asked.
#[derive(Default)]
struct Fixed {
    balances: HashMap<Addr, Wei>,
    storage: HashMap<(Addr, Hash), U256>,
    reads: AtomicUsize,
}

impl StateBackend for Fixed {
    fn balance(&self, addr: &Addr) -> Result<Wei, StateError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.balances.get(addr).cloned().unwrap_or_default())
    }

    fn nonce(&self, _addr: &Addr) -> Result<u64, StateError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(7)
    }

    fn code(&self, addr: &Addr) -> Result<Arc<dyn Code>, StateError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        EmptyState.code(addr)
    }

    fn storage(&self, addr: &Addr, key: &Hash) -> Result<U256, StateError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .storage
            .get(&(addr.clone(), key.clone()))
            .copied()
            .unwrap_or_default())
    }
}

#[test]
fn test_layers_over_backend() {
    let a: Addr = 1.into();
    let k0: Hash = 0.into();
    let k1: Hash = 1.into();
    let mut fixed = Fixed::default();
    fixed.balances.insert(a.clone(), 100.into());
    fixed.storage.insert((a.clone(), k0.clone()), 10.into());
    fixed.storage.insert((a.clone(), k1.clone()), 11.into());
    let fixed = Arc::new(fixed);
    let mut s = MemState::new(fixed.clone());

    // base <- r0: k0 = 1 <- r1: k0 = 2 <- r2: k1 = 3
    let r0 = s.checkpoint();
    s.set_storage(&a, &k0, 1.into());
    let r1 = s.checkpoint();
    s.set_storage(&a, &k0, 2.into());
    let r2 = s.checkpoint();
    s.set_storage(&a, &k1, 3.into());
    assert_eq!(s.depth(), 3);

    let before = fixed.reads.load(Ordering::SeqCst);
    assert_eq!(s.storage(&a, &k0).unwrap(), 2.into());
    assert_eq!(s.storage(&a, &k1).unwrap(), 3.into());
    assert_eq!(fixed.reads.load(Ordering::SeqCst), before);

    // values as seen before each revision started
    assert_eq!(s.storage_below(&a, &k0, r1).unwrap(), 1.into());
    assert_eq!(s.storage_below(&a, &k1, r2).unwrap(), 11.into());
    assert_eq!(s.storage_below(&a, &k0, r0).unwrap(), 10.into());

    // dropping the middle revision drops the one above as well
    s.rollback(r1);
    assert_eq!(s.depth(), 1);
    assert_eq!(s.storage(&a, &k0).unwrap(), 1.into());
    assert_eq!(s.storage(&a, &k1).unwrap(), 11.into());

    s.consolidate(r0);
    assert_eq!(s.depth(), 0);
    assert_eq!(s.storage(&a, &k0).unwrap(), 1.into());
    assert_eq!(s.nonce(&a).unwrap(), 7);
    assert_eq!(s.balance(&a).unwrap(), 100.into());
}

#[test]
fn test_reset_shadows_backend() {
    let a: Addr = 2.into();
    let k: Hash = 5.into();
    let mut fixed = Fixed::default();
    fixed.storage.insert((a.clone(), k.clone()), 9.into());
    let mut s = MemState::new(Arc::new(fixed));

    let r = s.checkpoint();
    s.delete_account(&a);
    assert_eq!(s.storage(&a, &k).unwrap(), U256::zero());
    assert_eq!(s.nonce(&a).unwrap(), 0);
    assert!(s.is_empty(&a).unwrap());

    s.rollback(r);
    assert_eq!(s.storage(&a, &k).unwrap(), 9.into());
    assert_eq!(s.nonce(&a).unwrap(), 7);
}

#[test]
fn test_snapshot_keeps_only_touched_accounts() {
    let mut s = MemState::new(Arc::new(Fixed::default()));
    let addrs: Vec<Addr> = (10..20u64).map(Addr::from).collect();
    for (i, a) in addrs.iter().enumerate() {
        s.set_balance(a, (i as u64).into());
    }
    let snap = s.snapshot();
    assert_eq!(snap.len(), addrs.len());
    assert_eq!(snap.account(&addrs[3]).unwrap().balance, Some(3.into()));

    s.checkpoint();
    s.set_balance(&addrs[0], 1000.into());
    s.set_storage(&addrs[1], &1.into(), 1.into());
    s.restore(snap.clone());
    assert_eq!(s.depth(), 0);
    assert_eq!(s.balance(&addrs[0]).unwrap(), 0.into());
    assert_eq!(s.storage(&addrs[1], &1.into()).unwrap(), 0.into());
    assert_eq!(s.snapshot(), snap);
}

#[test]
fn test_transient_storage_is_per_transaction() {
    let a: Addr = 3.into();
    let k: Hash = 1.into();
    let mut s = MemState::new(Arc::new(EmptyState));
    let r = s.checkpoint();
    s.set_transient(&a, &k, 5.into());
    assert_eq!(s.transient(&a, &k), 5.into());
    s.consolidate(r);
    assert_eq!(s.transient(&a, &k), 5.into());
    s.finalize_tx();
    assert_eq!(s.transient(&a, &k), U256::zero());
}
