//! Bookkeeping of deployed contracts and human-readable address names.
//!
//! The [Env](crate::env::Env) owns a [ContractRegistry] keyed by address and an [AliasTable].
//! A [ContractHandle] is only the address plus a weak back-reference to the environment, so
//! handles never keep an environment alive.
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::common::{Addr, Bytes, Hash, Wei};
use crate::core::CallOutput;
use crate::env::{Env, TxOpts};
use crate::error::{Error, Result};

/// Metadata of a contract known to the environment.
#[derive(Clone, Debug, PartialEq)]
pub struct RegisteredContract {
    pub address: Addr,
    pub name: String,
    /// Hash of the deployed (runtime) code.
    pub code_hash: Hash,
    /// ABI as delivered by the compiler, if any.
    pub abi: Option<serde_json::Value>,
}

/// A contract family keyed by the hash of its deployment bytecode.
#[derive(Clone, Debug, PartialEq)]
pub struct Blueprint {
    pub name: String,
    pub abi: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContractRegistry {
    contracts: HashMap<Addr, RegisteredContract>,
    blueprints: HashMap<Hash, Blueprint>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `contract`, replacing whatever was registered at its address.
    pub fn register(&mut self, contract: RegisteredContract) {
        self.contracts.insert(contract.address.clone(), contract);
    }

    pub fn register_blueprint(
        &mut self, bytecode: &[u8], name: &str, abi: Option<serde_json::Value>,
    ) -> Hash {
        let h = Hash::hash(bytecode);
        self.blueprints.insert(
            h.clone(),
            Blueprint {
                name: name.to_string(),
                abi,
            },
        );
        h
    }

    pub fn lookup(&self, addr: &Addr) -> Option<&RegisteredContract> {
        self.contracts.get(addr)
    }

    pub fn lookup_blueprint(&self, bytecode_hash: &Hash) -> Option<&Blueprint> {
        self.blueprints.get(bytecode_hash)
    }

    /// Every registered address whose runtime code hashes to `code_hash`.
    pub fn instances_of(&self, code_hash: &Hash) -> Vec<&Addr> {
        let mut v: Vec<_> = self
            .contracts
            .values()
            .filter(|c| &c.code_hash == code_hash)
            .map(|c| &c.address)
            .collect();
        v.sort();
        v
    }

    pub fn remove(&mut self, addr: &Addr) -> Option<RegisteredContract> {
        self.contracts.remove(addr)
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}

/// A bidirectional address <-> name mapping. Each address has at most one name and each name
/// denotes at most one address.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AliasTable {
    names: HashMap<Addr, String>,
    addrs: HashMap<String, Addr>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `addr`, dropping any previous binding of either side.
    pub fn set(&mut self, addr: &Addr, name: &str) {
        if let Some(old) = self.names.remove(addr) {
            self.addrs.remove(&old);
        }
        if let Some(old) = self.addrs.remove(name) {
            self.names.remove(&old);
        }
        self.names.insert(addr.clone(), name.to_string());
        self.addrs.insert(name.to_string(), addr.clone());
    }

    pub fn name_of(&self, addr: &Addr) -> Option<&str> {
        self.names.get(addr).map(String::as_str)
    }

    pub fn address_of(&self, name: &str) -> Option<&Addr> {
        self.addrs.get(name)
    }

    pub fn remove(&mut self, addr: &Addr) -> Option<String> {
        let name = self.names.remove(addr)?;
        self.addrs.remove(&name);
        Some(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// A deployed contract bound to the environment it lives in.
#[derive(Clone, Debug)]
pub struct ContractHandle {
    address: Addr,
    env: Weak<RefCell<Env>>,
}

impl ContractHandle {
    pub fn new(address: Addr, env: &Rc<RefCell<Env>>) -> Self {
        Self {
            address,
            env: Rc::downgrade(env),
        }
    }

    pub fn address(&self) -> &Addr {
        &self.address
    }

    /// The owning environment, unless it has been dropped.
    pub fn env(&self) -> Option<Rc<RefCell<Env>>> {
        self.env.upgrade()
    }

    fn with_env<T>(&self, f: impl FnOnce(&mut Env) -> Result<T>) -> Result<T> {
        let env = self.env().ok_or_else(|| {
            Error::InvalidInput(format!(
                "environment of contract {} is gone",
                self.address
            ))
        })?;
        let mut env = env.try_borrow_mut().map_err(|_| {
            Error::InvalidInput("environment is already borrowed".into())
        })?;
        f(&mut env)
    }

    pub fn metadata(&self) -> Option<RegisteredContract> {
        self.env()?
            .try_borrow()
            .ok()?
            .lookup_contract(&self.address)
            .cloned()
    }

    /// Modifying call from the environment's current sender.
    pub fn call(&self, calldata: &[u8]) -> Result<CallOutput> {
        self.with_env(|env| {
            env.call(&self.address, calldata, &TxOpts::default(), true)
        })
    }

    /// Non-modifying call; no state changes survive it.
    pub fn view(&self, calldata: &[u8]) -> Result<Bytes> {
        self.with_env(|env| {
            env.call(&self.address, calldata, &TxOpts::default(), false)
                .map(|r| r.output)
        })
    }

    pub fn balance(&self) -> Result<Wei> {
        self.with_env(|env| env.get_balance(&self.address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alias_table_is_bidirectional() {
        let mut t = AliasTable::new();
        let (a, b) = (Addr::from(1), Addr::from(2));
        t.set(&a, "alice");
        t.set(&b, "bob");
        assert_eq!(t.name_of(&a), Some("alice"));
        assert_eq!(t.address_of("bob"), Some(&b));
        // rebinding a name moves it
        t.set(&b, "alice");
        assert_eq!(t.name_of(&a), None);
        assert_eq!(t.address_of("alice"), Some(&b));
        assert_eq!(t.address_of("bob"), None);
        assert_eq!(t.len(), 1);
        assert_eq!(t.remove(&b).as_deref(), Some("alice"));
        assert!(t.is_empty());
    }

    #[test]
    fn test_registry() {
        let mut r = ContractRegistry::new();
        let code_hash = Hash::hash(&[0x60, 0x00]);
        for i in 1..=2u64 {
            r.register(RegisteredContract {
                address: Addr::from(i),
                name: "Counter".into(),
                code_hash: code_hash.clone(),
                abi: None,
            });
        }
        assert_eq!(r.len(), 2);
        assert_eq!(r.instances_of(&code_hash), vec![&Addr::from(1), &Addr::from(2)]);
        let bp = r.register_blueprint(&[1, 2, 3], "Counter", None);
        assert_eq!(r.lookup_blueprint(&bp).map(|b| b.name.as_str()), Some("Counter"));
        assert!(r.remove(&Addr::from(1)).is_some());
        assert!(r.lookup(&Addr::from(1)).is_none());
    }
}
