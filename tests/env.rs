use std::sync::Arc;

use rand::{rngs::StdRng, Rng, SeedableRng};

use qenv::common::*;
use qenv::core::{HookFrame, HookOutcome, OpcodeHook};
use qenv::env::{Env, EnvConfig, TxOpts};
use qenv::registry::ContractHandle;
use qenv::Error;
use qenv_tools::abi::decode_u256;
use qenv_tools::contracts;

fn setup() -> (Env, Addr) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut env = Env::default();
    let counter = env
        .deploy(&contracts::counter(), &[], &TxOpts::default())
        .unwrap()
        .address;
    (env, counter)
}

fn increment(env: &mut Env, counter: &Addr, who: &Addr) -> U256 {
    let r = env
        .call(counter, &contracts::increment(who), &TxOpts::default(), true)
        .unwrap();
    decode_u256(&r.output)
}

fn get(env: &mut Env, counter: &Addr, who: &Addr) -> U256 {
    let r = env
        .call(counter, &contracts::get(who), &TxOpts::default(), false)
        .unwrap();
    decode_u256(&r.output)
}

#[test]
fn test_anchor_restores_state() {
    let (mut env, counter) = setup();
    let alice = env.generate_address(Some("alice"));
    for _ in 0..3 {
        increment(&mut env, &counter, &alice);
    }
    let nonce = env.get_nonce(env.eoa()).unwrap();
    {
        let mut a = env.anchor().unwrap();
        increment(&mut a, &counter, &alice);
        increment(&mut a, &counter, &alice);
        assert_eq!(get(&mut a, &counter, &alice), 5.into());
        a.set_balance(&alice, 77.into()).unwrap();
        a.alias(&counter, "counter");
    }
    assert_eq!(get(&mut env, &counter, &alice), 3.into());
    assert_eq!(env.get_nonce(env.eoa()).unwrap(), nonce);
    assert_eq!(env.get_balance(&alice).unwrap(), 0.into());
    assert_eq!(env.lookup_alias(&counter), None);
    assert_eq!(env.lookup_alias(&alice), Some("alice"));
    assert_eq!(env.anchor_depth(), 0);
}

#[test]
fn test_nested_anchors() {
    let (mut env, counter) = setup();
    let bob = env.generate_address(None);
    let outer = env.anchor_enter().unwrap();
    increment(&mut env, &counter, &bob);
    let inner = env.anchor_enter().unwrap();
    increment(&mut env, &counter, &bob);
    assert_eq!(env.anchor_depth(), 2);

    // outer before inner is refused and changes nothing
    assert!(matches!(
        env.anchor_exit(outer),
        Err(Error::SnapshotDiscipline(_))
    ));
    assert_eq!(get(&mut env, &counter, &bob), 2.into());

    env.anchor_exit(inner).unwrap();
    assert_eq!(get(&mut env, &counter, &bob), 1.into());
    env.anchor_exit(outer).unwrap();
    assert_eq!(get(&mut env, &counter, &bob), 0.into());
    assert!(matches!(
        env.anchor_exit(outer),
        Err(Error::SnapshotDiscipline(_))
    ));
}

#[test]
fn test_anchor_restores_clock_and_gas() {
    let (mut env, counter) = setup();
    let (n, t) = (env.block_number().unwrap(), env.timestamp().unwrap());
    let used = env.gas_used();
    {
        let mut a = env.anchor().unwrap();
        a.time_travel(None, Some(5), 12).unwrap();
        let who = a.eoa().clone();
        increment(&mut a, &counter, &who);
        assert!(a.gas_used() > used);
        a.release().unwrap();
    }
    assert_eq!(env.block_number().unwrap(), n);
    assert_eq!(env.timestamp().unwrap(), t);
    assert_eq!(env.gas_used(), used);
}

#[test]
fn test_revert_rolls_back_but_bumps_nonce() {
    let (mut env, counter) = setup();
    let alice = env.generate_address(None);
    increment(&mut env, &counter, &alice);
    let nonce = env.get_nonce(env.eoa()).unwrap();
    let err = env
        .call(&counter, &contracts::bump_and_revert(&alice), &TxOpts::default(), true)
        .unwrap_err();
    assert!(err.is_revert());
    assert_eq!(&err.revert_data().unwrap()[..], &contracts::COUNTER_REVERT_DATA);
    assert_eq!(get(&mut env, &counter, &alice), 1.into());
    assert_eq!(env.get_nonce(env.eoa()).unwrap(), nonce + 1);
    assert!(env.last_gas_used() > 0);
}

#[test]
fn test_metering_does_not_change_results() {
    let (mut env, counter) = setup();
    let alice = env.generate_address(None);
    let run = |env: &mut Env| {
        let mut a = env.anchor().unwrap();
        let out = increment(&mut a, &counter, &alice);
        let slot = a.get_storage(&counter, &contracts::counter_slot(&alice)).unwrap();
        (out, slot, a.last_gas_used())
    };
    let standard = run(&mut env);
    env.disable_gas_metering();
    let disabled = run(&mut env);
    env.enable_gas_profiling();
    let profiled = run(&mut env);
    env.reset_gas_metering_behavior();

    assert_eq!(standard.0, disabled.0);
    assert_eq!(standard.1, disabled.1);
    assert_eq!(standard, profiled);
    assert!(standard.2 > 0);
}

#[test]
fn test_disabled_metering_ignores_gas_limit() {
    let (mut env, counter) = setup();
    let opts = TxOpts::default().gas(30_000);
    assert!(env
        .call(&counter, &contracts::spin(5_000), &opts, false)
        .unwrap_err()
        .is_out_of_gas());
    env.disable_gas_metering();
    env.reset_gas_used();
    env.call(&counter, &contracts::spin(5_000), &opts, false).unwrap();
    assert_eq!(env.gas_used(), 0);
}

#[test]
fn test_gas_profile() {
    let (mut env, counter) = setup();
    assert!(env.gas_profile().is_none());
    env.enable_gas_profiling();
    env.call(&counter, &contracts::spin(10), &TxOpts::default(), false)
        .unwrap();
    let profile = env.gas_profile().unwrap();
    assert!(profile.contract_total(&counter) > 0);
    let jumps = profile
        .by_pc
        .iter()
        .filter(|((a, _), s)| a == &counter && s.opcode == 0x57)
        .map(|(_, s)| s.count)
        .sum::<u64>();
    // the loop test runs once per iteration plus the exit, the dispatcher has four of its own
    assert!(jumps >= 11);
}

#[test]
fn test_prank() {
    let (mut env, counter) = setup();
    let eoa = env.eoa().clone();
    let mallory = env.generate_address(Some("mallory"));
    {
        let mut p = env.prank(&mallory);
        assert_eq!(p.eoa(), &mallory);
        let who = mallory.clone();
        increment(&mut p, &counter, &who);
    }
    assert_eq!(env.eoa(), &eoa);
    assert_eq!(env.get_nonce(&mallory).unwrap(), 1);

    let opts = TxOpts::default().sender(&mallory);
    env.call(&counter, &contracts::increment(&mallory), &opts, true)
        .unwrap();
    assert_eq!(env.get_nonce(&mallory).unwrap(), 2);
    assert_eq!(env.lookup_address("mallory"), Some(&mallory));
}

#[test]
fn test_value_transfer() {
    let (mut env, _) = setup();
    let dst = env.generate_address(None);
    let before = env.get_balance(env.eoa()).unwrap();
    let opts = TxOpts::default().value(1000.into());
    env.call(&dst, &[], &opts, true).unwrap();
    assert_eq!(env.get_balance(&dst).unwrap(), 1000.into());
    assert_eq!(
        env.get_balance(env.eoa()).unwrap(),
        before.checked_sub(&1000.into()).unwrap()
    );

    let poor = env.generate_address(None);
    let opts = TxOpts::default().value(1.into()).sender(&poor);
    assert!(env.call(&dst, &[], &opts, true).is_err());
}

#[test]
fn test_raw_overrides() {
    let (mut env, counter) = setup();
    let alice = env.generate_address(None);
    let slot = contracts::counter_slot(&alice);
    env.set_storage(&counter, &slot, 41.into()).unwrap();
    assert_eq!(increment(&mut env, &counter, &alice), 42.into());

    let other = env
        .deploy_code(&contracts::constant_runtime(7.into()), None)
        .unwrap();
    let r = env.call(&other, &[], &TxOpts::default(), false).unwrap();
    assert_eq!(decode_u256(&r.output), 7.into());
    assert_eq!(&env.get_code(&other).unwrap()[..], &contracts::constant_runtime(7.into())[..]);

    env.set_nonce(&alice, 9).unwrap();
    assert_eq!(env.get_nonce(&alice).unwrap(), 9);
}

#[test]
fn test_deploy_at() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut env = Env::default();
    let at = env.generate_address(Some("fixed"));
    let d = env
        .deploy_at(&contracts::counter(), &[], &at, &TxOpts::default())
        .unwrap();
    assert_eq!(d.address, at);
    let who = at.clone();
    assert_eq!(increment(&mut env, &at, &who), 1.into());
}

#[test]
fn test_blueprints_register_deployments() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut env = Env::default();
    let code_hash = env.register_blueprint(&contracts::counter(), "Counter", None);
    assert_eq!(code_hash, Hash::hash(&contracts::counter()));
    let a = env.deploy(&contracts::counter(), &[], &TxOpts::default()).unwrap();
    let b = env.deploy(&contracts::counter(), &[], &TxOpts::default()).unwrap();
    let meta = env.lookup_contract(&a.address).unwrap();
    assert_eq!(meta.name, "Counter");
    assert_eq!(meta.code_hash, Hash::hash(&contracts::counter_runtime()));
    let runtime_hash = meta.code_hash.clone();
    let mut instances = env.registry().instances_of(&runtime_hash);
    instances.sort();
    let mut expected = vec![&a.address, &b.address];
    expected.sort();
    assert_eq!(instances, expected);

    let other = env.deploy(&contracts::caller(), &[], &TxOpts::default()).unwrap();
    assert!(env.lookup_contract(&other.address).is_none());
    env.register_contract(&other.address, "Caller", None).unwrap();
    assert_eq!(env.lookup_contract(&other.address).unwrap().name, "Caller");
}

#[test]
fn test_opcode_patch() {
    let (mut env, _) = setup();
    let clock = env
        .deploy_code(
            &qenv_tools::assemble("TIMESTAMP PUSH 0 MSTORE PUSH 32 PUSH 0 RETURN").unwrap(),
            None,
        )
        .unwrap();
    let hook: OpcodeHook = Arc::new(|f: &mut HookFrame<'_>| {
        f.push(1.into())?;
        Ok(HookOutcome::Handled)
    });
    env.patch_opcode(0x42, hook).unwrap();
    let r = env.call(&clock, &[], &TxOpts::default(), false).unwrap();
    assert_eq!(decode_u256(&r.output), 1.into());
    env.unpatch_opcode(0x42).unwrap();
    let r = env.call(&clock, &[], &TxOpts::default(), false).unwrap();
    assert_eq!(decode_u256(&r.output), env.timestamp().unwrap().into());
}

#[test]
fn test_precompile_registration() {
    let (mut env, _) = setup();
    let identity = Addr::from(4);
    assert!(env
        .register_precompile(&identity, Arc::new(qenv::core::precompile::Identity))
        .is_err());
    let at = Addr::from(0x200);
    env.register_precompile(&at, Arc::new(qenv::core::precompile::Identity))
        .unwrap();
    let r = env.call(&at, &[1, 2], &TxOpts::default(), false).unwrap();
    assert_eq!(&r.output[..], &[1, 2]);
    env.deregister_precompile(&at).unwrap();
    assert!(env.deregister_precompile(&at).is_err());
    let r = env.call(&at, &[1, 2], &TxOpts::default(), false).unwrap();
    assert!(r.output.is_empty());
}

#[test]
fn test_config() {
    let _ = env_logger::builder().is_test(true).try_init();
    let config: EnvConfig =
        serde_json::from_str(r#"{"chain_id": 5, "block_number": 100, "seed": 3}"#).unwrap();
    let env = Env::new(config);
    assert_eq!(env.chain_id(), 5.into());
    assert_eq!(env.block_number().unwrap(), 100);
    assert_eq!(env.lookup_alias(env.eoa()), Some("eoa"));
    assert_eq!(env.get_balance(env.eoa()).unwrap(), Wei::ether(1_000_000));
    assert!(env.fork_info().is_none());
    assert_eq!(env.backend().name(), "local");
}

#[test]
fn test_random_anchor_sequences() {
    let (mut env, counter) = setup();
    let users: Vec<Addr> = (0..4).map(|_| env.generate_address(None)).collect();
    let mut rng = StdRng::seed_from_u64(7);
    let mut model = vec![vec![0u64; users.len()]];
    let mut handles = Vec::new();
    for _ in 0..200 {
        match rng.gen_range(0..4) {
            0 if handles.len() < 5 => {
                handles.push(env.anchor_enter().unwrap());
                let top = model.last().unwrap().clone();
                model.push(top);
            }
            1 if !handles.is_empty() => {
                env.anchor_exit(handles.pop().unwrap()).unwrap();
                model.pop();
            }
            _ => {
                let i = rng.gen_range(0..users.len());
                let v = increment(&mut env, &counter, &users[i]);
                let counts = model.last_mut().unwrap();
                counts[i] += 1;
                assert_eq!(v, counts[i].into());
            }
        }
    }
    while let Some(h) = handles.pop() {
        env.anchor_exit(h).unwrap();
        model.pop();
    }
    for (i, who) in users.iter().enumerate() {
        assert_eq!(get(&mut env, &counter, who), model[0][i].into());
    }
}

#[test]
fn test_contract_handle() {
    let (env, counter) = setup();
    let shared = env.into_shared();
    shared
        .borrow_mut()
        .register_contract(&counter, "Counter", None)
        .unwrap();
    let handle = ContractHandle::new(counter.clone(), &shared);
    let alice = Addr::from_seed(b"alice");
    let r = handle.call(&contracts::increment(&alice)).unwrap();
    assert_eq!(decode_u256(&r.output), 1.into());
    assert_eq!(decode_u256(&handle.view(&contracts::get(&alice)).unwrap()), 1.into());
    assert_eq!(handle.metadata().unwrap().name, "Counter");
    assert_eq!(handle.balance().unwrap(), 0.into());

    // a borrowed environment is reported, not a panic
    {
        let _busy = shared.borrow_mut();
        assert!(matches!(handle.balance(), Err(Error::InvalidInput(_))));
    }
    // handles do not keep the environment alive
    drop(shared);
    assert!(handle.env().is_none());
    assert!(handle.metadata().is_none());
    assert!(matches!(handle.balance(), Err(Error::InvalidInput(_))));
}
