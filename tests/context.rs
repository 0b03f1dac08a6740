use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use qenv::common::*;
use qenv::context::*;
use qenv::env::{Env, EnvConfig, TxOpts};
use qenv::fork::ForkConfig;
use qenv::rpc::{BlockId, RetryConfig};
use qenv_tools::contracts;
use qenv_tools::mock::MockChain;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
    reset_env();
}

#[test]
fn test_scoped_swap_restores_same_env() {
    init();
    let outer = current_env();
    let counter = with_env(|env| {
        env.deploy(&contracts::counter(), &[], &TxOpts::default())
            .unwrap()
            .address
    });
    {
        let guard = swap_env_scoped(Env::default().into_shared());
        assert!(Rc::ptr_eq(&current_env(), guard.env()));
        assert!(with_env(|env| env.get_code(&counter).unwrap().is_empty()));
    }
    assert!(Rc::ptr_eq(&current_env(), &outer));
    assert!(!with_env(|env| env.get_code(&counter).unwrap().is_empty()));
}

#[test]
fn test_restored_after_panic() {
    init();
    let outer = current_env();
    let res = catch_unwind(AssertUnwindSafe(|| {
        let _guard = swap_env_scoped(Env::default().into_shared());
        let _inner = swap_env_scoped(Env::default().into_shared());
        panic!("boom");
    }));
    assert!(res.is_err());
    assert!(Rc::ptr_eq(&current_env(), &outer));
}

#[test]
fn test_inner_scope_left_open() {
    init();
    let outer = current_env();
    let guard = swap_env_scoped(Env::default().into_shared());
    let inner = swap_env_scoped(Env::default().into_shared());
    std::mem::forget(inner);
    drop(guard);
    assert!(Rc::ptr_eq(&current_env(), &outer));
}

#[test]
fn test_persist_and_swap() {
    init();
    let outer = current_env();
    let config = EnvConfig {
        chain_id: 10,
        ..Default::default()
    };
    swap_env_scoped(Env::new(config).into_shared()).persist();
    assert_eq!(with_env(|env| env.chain_id()), 10.into());
    pop_env();
    assert!(Rc::ptr_eq(&current_env(), &outer));

    let replaced = swap_env(Env::default().into_shared());
    assert!(Rc::ptr_eq(&replaced, &outer));
    assert!(!Rc::ptr_eq(&current_env(), &outer));
}

#[test]
fn test_push_and_pop() {
    init();
    let base = push_env(Env::default().into_shared());
    let top = current_env();
    assert_eq!(push_env(Env::default().into_shared()), base + 1);
    pop_env();
    assert!(Rc::ptr_eq(&current_env(), &top));
    pop_env();
    // popping everything leaves a usable environment
    for _ in 0..4 {
        pop_env();
    }
    assert!(with_env(|env| env.block_number().is_ok()));
}

#[test]
fn test_fork_scoped() {
    init();
    let chain = MockChain::new(5);
    chain.set_head(300);
    let alice = Addr::from_seed(b"alice");
    chain.set_balance(&alice, 99.into());
    let config = ForkConfig {
        block: BlockId::Number(100),
        retry: RetryConfig::none(),
        ..ForkConfig::default().without_cache()
    };
    let outer = current_env();
    {
        let _guard = fork_rpc_scoped(chain.client(RetryConfig::none()), &config).unwrap();
        assert_eq!(with_env(|env| env.chain_id()), 5.into());
        assert_eq!(with_env(|env| env.get_balance(&alice).unwrap()), 99.into());
        assert_eq!(with_env(|env| env.fork_info().map(|b| b.number)), Some(100));
    }
    assert!(Rc::ptr_eq(&current_env(), &outer));
    assert!(with_env(|env| env.fork_info().is_none()));

    fork_rpc(chain.client(RetryConfig::none()), &config).unwrap();
    assert_eq!(with_env(|env| env.chain_id()), 5.into());
}
