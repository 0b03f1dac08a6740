//! On-disk cache of remote chain state.
//!
//! There is one LMDB file per chain id, keyed by `(block, address, kind, key)`. Cached blocks are
//! final, so the first value written under a key stays; later writes of the same key are dropped.
//! LMDB serializes writers across processes and lets readers run next to them. All handles on
//! one file inside a process share a single environment, since LMDB forbids opening it twice.
//! A file LMDB refuses to open is moved aside and the cache starts over empty.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use lmdb::{
    Cursor, Database, Environment, EnvironmentFlags, Transaction, WriteFlags,
};
use log::{debug, error, warn};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::common::{Addr, Hash, U256};
use crate::error::{Error, Result};

const FILE_NAME: &str = "state.mdb";
/// Upper bound of the memory map. The file only grows with its entries.
const MAP_SIZE: usize = 1 << 31;

static ENVIRONMENTS: Lazy<Mutex<HashMap<PathBuf, Weak<Environment>>>> =
    Lazy::new(Default::default);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Balance,
    Nonce,
    Code,
    Storage,
}

impl CacheKind {
    fn tag(self) -> u8 {
        match self {
            CacheKind::Balance => 0,
            CacheKind::Nonce => 1,
            CacheKind::Code => 2,
            CacheKind::Storage => 3,
        }
    }
}

/// block (big endian) | address | kind | storage slot
fn encode_key(
    block: u64, address: &Addr, kind: CacheKind, sub: Option<&Hash>,
) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + 20 + 1 + 32);
    key.extend_from_slice(&block.to_be_bytes());
    key.extend_from_slice(address.as_bytes());
    key.push(kind.tag());
    if let Some(sub) = sub {
        key.extend_from_slice(sub.as_bytes());
    }
    key
}

fn is_damaged(e: &lmdb::Error) -> bool {
    matches!(
        e,
        lmdb::Error::Invalid |
            lmdb::Error::Corrupted |
            lmdb::Error::PageNotFound |
            lmdb::Error::VersionMismatch |
            lmdb::Error::Panic
    )
}

fn shared_environment(
    path: &Path,
) -> std::result::Result<Arc<Environment>, lmdb::Error> {
    let mut envs = ENVIRONMENTS.lock();
    if let Some(env) = envs.get(path).and_then(Weak::upgrade) {
        return Ok(env)
    }
    let env = Arc::new(
        Environment::new()
            .set_flags(EnvironmentFlags::NO_SUB_DIR | EnvironmentFlags::NO_TLS)
            .set_map_size(MAP_SIZE)
            .open(path)?,
    );
    envs.retain(|_, e| e.strong_count() > 0);
    envs.insert(path.to_path_buf(), Arc::downgrade(&env));
    Ok(env)
}

fn set_aside(path: &Path) {
    let mut aside = path.as_os_str().to_owned();
    aside.push(".corrupt");
    match std::fs::rename(path, &aside) {
        Ok(()) => warn!("moved damaged cache to {}", Path::new(&aside).display()),
        Err(e) => error!("cannot move damaged cache {}: {}", path.display(), e),
    }
}

struct Store {
    env: Arc<Environment>,
    db: Database,
}

/// Persistent cache for one chain. A disabled cache misses on every read and drops every write.
/// Read and write failures are logged and behave like a miss.
pub struct StorageCache {
    chain_id: U256,
    path: Option<PathBuf>,
    store: Option<Store>,
}

impl StorageCache {
    pub fn disabled() -> Self {
        Self {
            chain_id: U256::zero(),
            path: None,
            store: None,
        }
    }

    /// Open (or create) the cache of `chain_id` under `dir`. Failing to open the file is logged
    /// and leaves the cache disabled.
    pub fn open(dir: &Path, chain_id: &U256) -> Self {
        let path = Self::file_path(dir, chain_id);
        let parent = path.parent().unwrap_or(dir);
        let path = match std::fs::create_dir_all(parent)
            .and_then(|_| parent.canonicalize())
        {
            Ok(p) => p.join(FILE_NAME),
            Err(e) => {
                error!("cache {} unusable, running without it: {}", path.display(), e);
                return Self::disabled()
            }
        };
        let opened = match shared_environment(&path) {
            Err(e) if is_damaged(&e) => {
                error!("cache {} is damaged: {}", path.display(), e);
                set_aside(&path);
                shared_environment(&path)
            }
            r => r,
        };
        let store = opened.and_then(|env| {
            let db = env.open_db(None)?;
            Ok(Store { env, db })
        });
        match store {
            Ok(store) => {
                debug!("opened cache {}", path.display());
                Self {
                    chain_id: *chain_id,
                    path: Some(path),
                    store: Some(store),
                }
            }
            Err(e) => {
                error!("cache {} unusable, running without it: {}", path.display(), e);
                Self::disabled()
            }
        }
    }

    /// Location of the cache file of `chain_id` under `dir`.
    pub fn file_path(dir: &Path, chain_id: &U256) -> PathBuf {
        dir.join(chain_id.to_string()).join(FILE_NAME)
    }

    fn display(&self) -> std::path::Display<'_> {
        self.path.as_deref().unwrap_or_else(|| Path::new("")).display()
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn chain_id(&self) -> &U256 {
        &self.chain_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of entries. Walks the whole file.
    pub fn len(&self) -> usize {
        let store = match &self.store {
            Some(s) => s,
            None => return 0,
        };
        let counted = store.env.begin_ro_txn().and_then(|txn| {
            let mut n = 0;
            for row in txn.open_ro_cursor(store.db)?.iter() {
                row?;
                n += 1;
            }
            Ok::<_, lmdb::Error>(n)
        });
        counted.unwrap_or_else(|e| {
            error!("cannot count cache {}: {}", self.display(), e);
            0
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(
        &self, block: u64, address: &Addr, kind: CacheKind, sub: Option<&Hash>,
    ) -> Option<String> {
        let store = self.store.as_ref()?;
        let key = encode_key(block, address, kind, sub);
        let txn = match store.env.begin_ro_txn() {
            Ok(t) => t,
            Err(e) => {
                error!("cannot read cache {}: {}", self.display(), e);
                return None
            }
        };
        let value = match txn.get(store.db, &key) {
            Ok(raw) => match std::str::from_utf8(raw) {
                Ok(v) => Some(v.to_string()),
                Err(_) => {
                    error!("ignoring non-text entry in cache {}", self.display());
                    None
                }
            },
            Err(lmdb::Error::NotFound) => None,
            Err(e) => {
                error!("cannot read cache {}: {}", self.display(), e);
                None
            }
        };
        value
    }

    pub fn put(
        &self, block: u64, address: &Addr, kind: CacheKind, sub: Option<&Hash>,
        value: &str,
    ) {
        let store = match &self.store {
            Some(s) => s,
            None => return,
        };
        let key = encode_key(block, address, kind, sub);
        let written = store.env.begin_rw_txn().and_then(|mut txn| {
            match txn.put(store.db, &key, &value, WriteFlags::NO_OVERWRITE) {
                Ok(()) => txn.commit(),
                // first writer wins
                Err(lmdb::Error::KeyExist) => Ok(()),
                Err(e) => Err(e),
            }
        });
        if let Err(e) = written {
            error!("cannot write cache {}: {}", self.display(), e);
        }
    }

    /// Drop every entry, on disk as well.
    pub fn clear(&self) -> Result<()> {
        let store = match &self.store {
            Some(s) => s,
            None => return Ok(()),
        };
        let mut txn = store.env.begin_rw_txn().map_err(Error::Cache)?;
        txn.clear_db(store.db).map_err(Error::Cache)?;
        txn.commit().map_err(Error::Cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn addr() -> Addr {
        Addr::from(0xabcd)
    }

    #[test]
    fn test_disabled() {
        let c = StorageCache::disabled();
        c.put(1, &addr(), CacheKind::Balance, None, "0x1");
        assert_eq!(c.get(1, &addr(), CacheKind::Balance, None), None);
        assert!(!c.is_enabled());
        assert!(c.clear().is_ok());
    }

    #[test]
    fn test_persist_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let chain = U256::from(5);
        let slot = Hash::from(7);
        {
            let c = StorageCache::open(dir.path(), &chain);
            c.put(10, &addr(), CacheKind::Storage, Some(&slot), "0x2a");
            c.put(10, &addr(), CacheKind::Code, None, "0x6000");
            c.put(10, &addr(), CacheKind::Code, None, "0x6000");
            // the first value stays
            c.put(10, &addr(), CacheKind::Code, None, "0x6001");
        }
        let c = StorageCache::open(dir.path(), &chain);
        assert_eq!(c.len(), 2);
        assert_eq!(
            c.get(10, &addr(), CacheKind::Storage, Some(&slot)).as_deref(),
            Some("0x2a")
        );
        assert_eq!(
            c.get(10, &addr(), CacheKind::Code, None).as_deref(),
            Some("0x6000")
        );
        assert_eq!(c.get(11, &addr(), CacheKind::Storage, Some(&slot)), None);
        assert_eq!(c.get(10, &addr(), CacheKind::Storage, None), None);
        // other chains are kept apart
        let other = StorageCache::open(dir.path(), &U256::from(6));
        assert!(other.is_empty());
    }

    #[test]
    fn test_damaged_file_is_set_aside() {
        let dir = tempfile::tempdir().unwrap();
        let chain = U256::one();
        let path = StorageCache::file_path(dir.path(), &chain);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, vec![0xa5u8; 64 * 1024]).unwrap();
        {
            let c = StorageCache::open(dir.path(), &chain);
            assert!(c.is_enabled());
            assert_eq!(c.get(1, &addr(), CacheKind::Nonce, None), None);
            c.put(1, &addr(), CacheKind::Nonce, None, "0x3");
        }
        assert!(path.with_extension("mdb.corrupt").exists());
        let c = StorageCache::open(dir.path(), &chain);
        assert_eq!(
            c.get(1, &addr(), CacheKind::Nonce, None).as_deref(),
            Some("0x3")
        );
    }

    #[test]
    fn test_truncated_write_does_not_swallow_later_entries() {
        let dir = tempfile::tempdir().unwrap();
        let chain = U256::one();
        let path = StorageCache::file_path(dir.path(), &chain);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        // a writer died half way through its first record
        std::fs::write(&path, b"{\"block\":1,\"addr").unwrap();
        {
            let c = StorageCache::open(dir.path(), &chain);
            c.put(1, &addr(), CacheKind::Nonce, None, "0x3");
            c.put(2, &addr(), CacheKind::Nonce, None, "0x4");
        }
        let c = StorageCache::open(dir.path(), &chain);
        assert_eq!(
            c.get(1, &addr(), CacheKind::Nonce, None).as_deref(),
            Some("0x3")
        );
        assert_eq!(
            c.get(2, &addr(), CacheKind::Nonce, None).as_deref(),
            Some("0x4")
        );
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_handles_share_entries() {
        let dir = tempfile::tempdir().unwrap();
        let chain = U256::one();
        let a = StorageCache::open(dir.path(), &chain);
        let b = StorageCache::open(dir.path(), &chain);
        assert_eq!(b.get(3, &addr(), CacheKind::Balance, None), None);
        a.put(3, &addr(), CacheKind::Balance, None, "0x64");
        assert_eq!(
            b.get(3, &addr(), CacheKind::Balance, None).as_deref(),
            Some("0x64")
        );
        drop(a);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_concurrent_writers() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let chain = U256::from(10);
        let workers: Vec<_> = (0..8u64)
            .map(|t| {
                let dir = dir.path().to_path_buf();
                thread::spawn(move || {
                    let c = StorageCache::open(&dir, &chain);
                    assert!(c.is_enabled());
                    // every worker writes the same entries, starting at a different offset
                    for i in 0..300u64 {
                        let n = (i + t * 37) % 300;
                        let slot = Hash::from(n);
                        let value = format!("{:#x}", n);
                        c.put(n, &addr(), CacheKind::Storage, Some(&slot), &value);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        let c = StorageCache::open(dir.path(), &chain);
        assert_eq!(c.len(), 300);
        for n in 0..300u64 {
            let slot = Hash::from(n);
            assert_eq!(
                c.get(n, &addr(), CacheKind::Storage, Some(&slot)),
                Some(format!("{:#x}", n))
            );
        }
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let c = StorageCache::open(dir.path(), &U256::one());
        c.put(1, &addr(), CacheKind::Balance, None, "0x1");
        c.clear().unwrap();
        assert!(c.is_empty());
        assert_eq!(c.get(1, &addr(), CacheKind::Balance, None), None);
        let c = StorageCache::open(dir.path(), &U256::one());
        assert!(c.is_empty());
    }
}
