//! The per-thread current environment.
//!
//! Code that does not pass an [Env] around explicitly works on the environment at the top of a
//! thread-local stack. The `*_scoped` functions push a new environment and return an [EnvGuard]
//! that pops back to the previous one (the very same object) when dropped, unwinding included.
//! The other switching functions replace the top for good.
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use log::{debug, error, info};

use crate::env::{Env, SharedEnv};
use crate::error::Result;
use crate::fork::ForkConfig;
use crate::network::{NetworkConfig, NetworkEnv};
use crate::rpc::RpcClient;

thread_local! {
    static STACK: RefCell<Vec<SharedEnv>> =
        RefCell::new(vec![Env::default().into_shared()]);
}

/// The environment operations act on.
pub fn current_env() -> SharedEnv {
    STACK.with(|s| {
        let mut s = s.borrow_mut();
        if s.is_empty() {
            s.push(Env::default().into_shared());
        }
        s[s.len() - 1].clone()
    })
}

/// Run `f` on the current environment.
pub fn with_env<R>(f: impl FnOnce(&mut Env) -> R) -> R {
    let env = current_env();
    let mut env = env.borrow_mut();
    f(&mut env)
}

/// Make `env` current for good, returning the one it replaces.
pub fn swap_env(env: SharedEnv) -> SharedEnv {
    STACK.with(|s| {
        let mut s = s.borrow_mut();
        match s.last_mut() {
            Some(top) => std::mem::replace(top, env),
            None => {
                s.push(env);
                Env::default().into_shared()
            }
        }
    })
}

/// Make `env` current until the returned guard is dropped.
pub fn swap_env_scoped(env: SharedEnv) -> EnvGuard {
    let depth = push_env(env.clone());
    EnvGuard {
        env,
        depth,
        persist: false,
    }
}

/// Push `env` on top of the stack. Returns the new stack depth.
pub fn push_env(env: SharedEnv) -> usize {
    STACK.with(|s| {
        let mut s = s.borrow_mut();
        s.push(env);
        s.len()
    })
}

/// Pop the current environment. Popping the last one leaves a fresh local environment behind.
pub fn pop_env() -> SharedEnv {
    STACK.with(|s| {
        let mut s = s.borrow_mut();
        let top = s.pop();
        if s.is_empty() {
            s.push(Env::default().into_shared());
        }
        top.unwrap_or_else(|| Env::default().into_shared())
    })
}

/// Replace the current environment with a fresh local one.
pub fn reset_env() -> SharedEnv {
    let env = Env::default().into_shared();
    swap_env(env.clone());
    env
}

fn forked_env(client: Arc<RpcClient>, config: &ForkConfig) -> Result<SharedEnv> {
    let mut env = Env::default();
    env.fork_rpc(client, config)?;
    Ok(env.into_shared())
}

/// Make a fresh fork of the chain behind `url` current.
pub fn fork(url: &str, config: &ForkConfig) -> Result<SharedEnv> {
    let client = RpcClient::http(url, config.retry.clone())?;
    fork_rpc(Arc::new(client), config)
}

pub fn fork_scoped(url: &str, config: &ForkConfig) -> Result<EnvGuard> {
    let client = RpcClient::http(url, config.retry.clone())?;
    fork_rpc_scoped(Arc::new(client), config)
}

pub fn fork_rpc(client: Arc<RpcClient>, config: &ForkConfig) -> Result<SharedEnv> {
    let env = forked_env(client, config)?;
    swap_env(env.clone());
    Ok(env)
}

pub fn fork_rpc_scoped(
    client: Arc<RpcClient>, config: &ForkConfig,
) -> Result<EnvGuard> {
    Ok(swap_env_scoped(forked_env(client, config)?))
}

fn network_env(url: &str, config: NetworkConfig) -> Result<SharedEnv> {
    let env = Env::network(NetworkEnv::connect(url, config)?).into_shared();
    info!("switching to network env");
    Ok(env)
}

/// Make an environment broadcasting to the node behind `url` current.
pub fn set_network_env(url: &str, config: NetworkConfig) -> Result<SharedEnv> {
    let env = network_env(url, config)?;
    swap_env(env.clone());
    Ok(env)
}

pub fn set_network_env_scoped(
    url: &str, config: NetworkConfig,
) -> Result<EnvGuard> {
    Ok(swap_env_scoped(network_env(url, config)?))
}

/// Keeps an environment current; dropping it restores the previous one.
#[must_use = "dropping the guard immediately restores the previous environment"]
pub struct EnvGuard {
    env: SharedEnv,
    depth: usize,
    persist: bool,
}

impl EnvGuard {
    /// The environment installed by this guard.
    pub fn env(&self) -> &SharedEnv {
        &self.env
    }

    /// Keep the environment current after the guard is gone.
    pub fn persist(mut self) {
        self.persist = true;
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        if self.persist {
            return
        }
        let restored = STACK.try_with(|s| {
            let mut s = match s.try_borrow_mut() {
                Ok(s) => s,
                Err(_) => return false,
            };
            if s.len() != self.depth ||
                !s.last().map(|t| Rc::ptr_eq(t, &self.env)).unwrap_or(false)
            {
                debug!(
                    "environment stack at depth {} when leaving scope {}",
                    s.len(),
                    self.depth
                );
            }
            // inner scopes that never popped are discarded as well
            s.truncate(self.depth.saturating_sub(1).max(1));
            true
        });
        if !matches!(restored, Ok(true)) {
            error!("could not restore the previous environment");
        }
    }
}
