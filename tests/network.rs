use std::sync::Arc;

use qenv::common::*;
use qenv::env::{Env, ExecutionBackend, TxOpts};
use qenv::network::{NetworkConfig, NetworkEnv};
use qenv::rpc::RetryConfig;
use qenv::tx::Signer;
use qenv::Error;
use qenv_tools::abi::decode_u256;
use qenv_tools::contracts;
use qenv_tools::mock::MockChain;

const KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

fn setup() -> (Arc<MockChain>, Env) {
    let _ = env_logger::builder().is_test(true).try_init();
    let chain = MockChain::new(1337);
    let config = NetworkConfig {
        poll_interval_ms: 1,
        receipt_timeout_ms: 100,
        gas_price: Some(1.into()),
        retry: RetryConfig::none(),
    };
    let mut net =
        NetworkEnv::with_client(chain.client(RetryConfig::none()), config).unwrap();
    let signer = Signer::from_hex(KEY).unwrap();
    let addr = net.add_account(signer);
    chain.set_balance(&addr, Wei::ether(10));
    (chain, Env::network(net))
}

fn deploy_counter(env: &mut Env) -> Addr {
    env.deploy(&contracts::counter(), &[], &TxOpts::default())
        .unwrap()
        .address
}

#[test]
fn test_deploy_and_call() {
    let (chain, mut env) = setup();
    assert!(env.is_network());
    assert_eq!(env.chain_id(), 1337.into());
    let eoa = env.eoa().clone();
    let counter = deploy_counter(&mut env);
    assert_eq!(&env.get_code(&counter).unwrap()[..], &contracts::counter_runtime()[..]);

    let alice = Addr::from_seed(b"alice");
    for i in 1..=2u64 {
        let r = env
            .call(&counter, &contracts::increment(&alice), &TxOpts::default(), true)
            .unwrap();
        assert_eq!(decode_u256(&r.output), i.into());
        assert!(r.gas_used > 0);
        assert_eq!(env.last_gas_used(), r.gas_used);
    }
    let slot = contracts::counter_slot(&alice);
    assert_eq!(chain.storage(&counter, &slot), 2.into());
    assert_eq!(env.get_storage(&counter, &slot).unwrap(), 2.into());
    assert_eq!(env.get_nonce(&eoa).unwrap(), 3);

    let sent = chain.calls("eth_sendRawTransaction");
    let r = env
        .call(&counter, &contracts::get(&alice), &TxOpts::default(), false)
        .unwrap();
    assert_eq!(decode_u256(&r.output), 2.into());
    assert_eq!(chain.calls("eth_sendRawTransaction"), sent);
    assert_eq!(env.block_number().unwrap(), chain.head());
}

#[test]
fn test_revert_is_not_broadcast() {
    let (chain, mut env) = setup();
    let counter = deploy_counter(&mut env);
    let sent = chain.calls("eth_sendRawTransaction");
    let alice = Addr::from_seed(b"alice");
    let err = env
        .call(&counter, &contracts::bump_and_revert(&alice), &TxOpts::default(), true)
        .unwrap_err();
    assert!(err.is_revert(), "{}", err);
    assert_eq!(&err.revert_data().unwrap()[..], &contracts::COUNTER_REVERT_DATA);
    assert_eq!(chain.calls("eth_sendRawTransaction"), sent);
}

#[test]
fn test_failed_receipt_is_a_revert() {
    let (chain, mut env) = setup();
    let counter = deploy_counter(&mut env);
    let eoa = env.eoa().clone();
    let net = match env.backend_mut() {
        ExecutionBackend::Network(n) => n,
        _ => panic!("not a network env"),
    };
    // too little gas for the loop, and no dry run to catch it
    let err = net
        .send_transaction(
            &eoa,
            Some(&counter),
            &contracts::spin(10_000),
            Wei::zero().clone(),
            Some(30_000),
        )
        .unwrap_err();
    assert!(err.is_revert(), "{}", err);
    assert!(err.failure().unwrap().gas_used > 0);
    assert_eq!(chain.calls("eth_sendRawTransaction"), 2);
    assert_eq!(net.get_nonce(&eoa).unwrap(), 2);
}

#[test]
fn test_local_only_operations() {
    let (_chain, mut env) = setup();
    let who = env.eoa().clone();
    let unsupported = |r: Result<(), Error>| matches!(r, Err(Error::UnsupportedOperation(_)));
    assert!(unsupported(env.set_balance(&who, 1.into())));
    assert!(unsupported(env.set_nonce(&who, 1)));
    assert!(unsupported(env.set_code(&who, &[0])));
    assert!(unsupported(env.set_storage(&who, &0.into(), 1.into())));
    assert!(unsupported(env.time_travel(Some(1), None, 12)));
    assert!(matches!(
        env.deploy_at(&contracts::counter(), &[], &who, &TxOpts::default()),
        Err(Error::UnsupportedOperation(_))
    ));
    assert!(env.gas_profile().is_none());
}

#[test]
fn test_unknown_sender() {
    let (_chain, mut env) = setup();
    let stranger = Addr::from_seed(b"stranger");
    let opts = TxOpts::default().sender(&stranger).gas(100_000);
    assert!(matches!(
        env.deploy(&contracts::counter(), &[], &opts),
        Err(Error::InvalidInput(_))
    ));
}

#[test]
fn test_anchor_uses_node_snapshots() {
    let (chain, mut env) = setup();
    let counter = deploy_counter(&mut env);
    let alice = Addr::from_seed(b"alice");
    let slot = contracts::counter_slot(&alice);
    let eoa = env.eoa().clone();
    {
        let mut a = env.anchor().unwrap();
        a.call(&counter, &contracts::increment(&alice), &TxOpts::default(), true)
            .unwrap();
        assert_eq!(chain.storage(&counter, &slot), 1.into());
    }
    assert_eq!(chain.storage(&counter, &slot), 0.into());
    assert_eq!(env.get_nonce(&eoa).unwrap(), 1);

    // nonces given back by the revert are reused
    env.call(&counter, &contracts::increment(&alice), &TxOpts::default(), true)
        .unwrap();
    assert_eq!(chain.storage(&counter, &slot), 1.into());
}

#[test]
fn test_anchor_without_node_snapshots() {
    let (chain, mut env) = setup();
    chain.set_snapshots_supported(false);
    assert!(matches!(
        env.anchor_enter(),
        Err(Error::UnsupportedOperation(_))
    ));
    assert_eq!(env.anchor_depth(), 0);
}

#[test]
fn test_snapshot_rejections_are_unsupported() {
    let (chain, mut env) = setup();
    chain.reject_snapshots(-32000, "method evm_snapshot is not supported");
    assert!(matches!(
        env.anchor_enter(),
        Err(Error::UnsupportedOperation(_))
    ));
    chain.reject_snapshots(-32600, "Unsupported method: evm_snapshot");
    assert!(matches!(
        env.anchor_enter(),
        Err(Error::UnsupportedOperation(_))
    ));
    // a server error unrelated to the method is passed through
    chain.reject_snapshots(-32000, "out of memory");
    assert!(matches!(env.anchor_enter(), Err(Error::Rpc(_))));
    assert_eq!(env.anchor_depth(), 0);
}

#[test]
fn test_failed_node_revert_still_restores_bookkeeping() {
    let (chain, mut env) = setup();
    let counter = deploy_counter(&mut env);
    let alice = Addr::from_seed(b"alice");
    let handle = env.anchor_enter().unwrap();
    env.alias(&counter, "counter");
    env.call(&counter, &contracts::increment(&alice), &TxOpts::default(), true)
        .unwrap();
    let gas_before = env.gas_used();

    chain.reject_snapshots(-32603, "internal error");
    let err = env.anchor_exit(handle).unwrap_err();
    assert!(matches!(err, Error::Rpc(_)), "{}", err);
    assert_eq!(env.anchor_depth(), 0);
    assert_eq!(env.lookup_alias(&counter), None);
    assert!(env.gas_used() < gas_before);
}

#[test]
fn test_receipt_timeout() {
    let (chain, mut env) = setup();
    let counter = deploy_counter(&mut env);
    let alice = Addr::from_seed(b"alice");
    chain.set_auto_mine(false);
    let err = env
        .call(&counter, &contracts::increment(&alice), &TxOpts::default(), true)
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "{}", err);

    // the transaction may still land
    chain.mine();
    assert_eq!(chain.storage(&counter, &contracts::counter_slot(&alice)), 1.into());
    chain.set_auto_mine(true);
    env.call(&counter, &contracts::increment(&alice), &TxOpts::default(), true)
        .unwrap();
    assert_eq!(chain.storage(&counter, &contracts::counter_slot(&alice)), 2.into());
}
