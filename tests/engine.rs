use std::sync::Arc;

use qenv::common::*;
use qenv::core::opcode::Opcode;
use qenv::core::*;
use qenv::state::EmptyState;
use qenv::Error;
use qenv_tools::abi::decode_u256;
use qenv_tools::{contracts, Asm};

const GAS: Gas = 10_000_000;

fn setup() -> (Engine, Addr) {
    let _ = env_logger::builder().is_test(true).try_init();
    let engine = Engine::new(ExecEnv::default(), Arc::new(EmptyState));
    (engine, Addr::from_seed(b"sender"))
}

fn deploy(engine: &mut Engine, sender: &Addr, init: &[u8]) -> Addr {
    engine
        .deploy(sender, init, &[], Wei::zero().clone(), GAS)
        .unwrap()
        .address
}

#[test]
fn test_counter() {
    let (mut engine, sender) = setup();
    let counter = deploy(&mut engine, &sender, &contracts::counter());
    assert_eq!(
        engine.state().code(&counter).unwrap().as_bytes(),
        &contracts::counter_runtime()[..]
    );
    let alice = Addr::from_seed(b"alice");
    for i in 1..=3u64 {
        let r = engine
            .call(&sender, &counter, &contracts::increment(&alice), Wei::zero().clone(), GAS, false)
            .unwrap();
        assert_eq!(decode_u256(&r.output), i.into());
        assert_eq!(r.logs.len(), 1);
        assert_eq!(r.logs[0].address, counter);
        assert_eq!(r.logs[0].topics[0], U256::from(alice.clone()).into());
    }
    let slot = contracts::counter_slot(&alice);
    assert_eq!(engine.state().storage(&counter, &slot.into()).unwrap(), 3.into());
    // deploy + 3 calls
    assert_eq!(engine.state().nonce(&sender).unwrap(), 4);

    let r = engine
        .call(&sender, &counter, &contracts::get(&alice), Wei::zero().clone(), GAS, true)
        .unwrap();
    assert_eq!(decode_u256(&r.output), 3.into());
    assert_eq!(engine.state().nonce(&sender).unwrap(), 4);
}

#[test]
fn test_revert_is_structured() {
    let (mut engine, sender) = setup();
    let counter = deploy(&mut engine, &sender, &contracts::counter());
    let alice = Addr::from_seed(b"alice");
    engine.state_mut().set_balance(&sender, Wei::ether(1));
    let data = contracts::bump_and_revert(&alice);
    let err = engine
        .call(&sender, &counter, &data, Wei::zero().clone(), GAS, false)
        .unwrap_err();
    assert!(err.is_revert());
    assert_eq!(&err.revert_data().unwrap()[..], &contracts::COUNTER_REVERT_DATA);
    let f = err.failure().unwrap();
    assert_eq!(f.kind, ExecError::Reverted);
    assert_eq!(f.call_stack[0].address, counter);
    assert_eq!(&f.call_stack[0].calldata[..], &data[..]);
    assert_eq!(f.pc_trail.last().unwrap().address, counter);
    assert!(f.gas_used > 0);

    let slot = contracts::counter_slot(&alice);
    assert_eq!(engine.state().storage(&counter, &slot.into()).unwrap(), U256::zero());
    // the failed call still consumed a nonce, but gas is free
    assert_eq!(engine.state().nonce(&sender).unwrap(), 2);
    assert_eq!(engine.state().balance(&sender).unwrap(), Wei::ether(1));
    assert_eq!(engine.state().depth(), 0);
}

#[test]
fn test_failed_subcall_keeps_caller_writes() {
    let (mut engine, sender) = setup();
    let counter = deploy(&mut engine, &sender, &contracts::counter());
    let caller = deploy(&mut engine, &sender, &contracts::caller());
    let alice = Addr::from_seed(b"alice");
    let slot = contracts::counter_slot(&alice);

    let data = contracts::forward(&counter, &contracts::bump_and_revert(&alice));
    engine
        .call(&sender, &caller, &data, Wei::zero().clone(), GAS, false)
        .unwrap();
    let state = engine.state();
    assert_eq!(state.storage(&caller, &0.into()).unwrap(), 1.into());
    assert_eq!(state.storage(&caller, &1.into()).unwrap(), 0.into());
    assert_eq!(state.storage(&counter, &slot.into()).unwrap(), 0.into());

    let data = contracts::forward(&counter, &contracts::increment(&alice));
    engine
        .call(&sender, &caller, &data, Wei::zero().clone(), GAS, false)
        .unwrap();
    let state = engine.state();
    assert_eq!(state.storage(&caller, &1.into()).unwrap(), 1.into());
    assert_eq!(state.storage(&counter, &slot.into()).unwrap(), 1.into());
}

#[test]
fn test_static_call_cannot_write() {
    let (mut engine, sender) = setup();
    let counter = deploy(&mut engine, &sender, &contracts::counter());
    let alice = Addr::from_seed(b"alice");
    let err = engine
        .call(&sender, &counter, &contracts::increment(&alice), Wei::zero().clone(), GAS, true)
        .unwrap_err();
    assert_eq!(err.failure().unwrap().kind, ExecError::WriteProtection);
    assert_eq!(engine.state().nonce(&sender).unwrap(), 1);
}

#[test]
fn test_gas_meters() {
    let (mut engine, sender) = setup();
    let counter = deploy(&mut engine, &sender, &contracts::counter());
    let data = contracts::spin(2_000);
    let zero = Wei::zero().clone();

    let err = engine
        .call(&sender, &counter, &data, zero.clone(), 40_000, true)
        .unwrap_err();
    assert!(err.is_out_of_gas());

    let full = engine
        .call(&sender, &counter, &data, zero.clone(), GAS, true)
        .unwrap();
    assert!(full.gas_used > 40_000);

    let prev = engine.set_gas_meter(Box::new(NoGasMeter));
    assert_eq!(prev.name(), "standard");
    let unmetered = engine
        .call(&sender, &counter, &data, zero.clone(), 40_000, true)
        .unwrap();
    assert_eq!(unmetered.output, full.output);

    // switching meters leaves the state alone
    let before = engine.state().snapshot();
    engine.set_gas_meter(Box::new(ProfilingGasMeter::new()));
    assert_eq!(engine.state().snapshot(), before);
    let profiled = engine
        .call(&sender, &counter, &data, zero, GAS, true)
        .unwrap();
    assert_eq!(profiled.gas_used, full.gas_used);
    let profile = engine.gas_meter().profile().unwrap();
    assert!(profile.contract_total(&counter) > 0);
    assert!(profile.contract_total(&counter) < full.gas_used);
}

#[test]
fn test_opcode_hook() {
    let (mut engine, sender) = setup();
    let code = Asm::new()
        .op(Opcode::Timestamp)
        .push(0u64)
        .op(Opcode::MStore)
        .push(32u64)
        .push(0u64)
        .op(Opcode::Return)
        .assemble()
        .unwrap();
    let target = Addr::from_seed(b"clock");
    engine
        .state_mut()
        .set_code(&target, Arc::new(PlainCode::new(code.into())));
    let zero = Wei::zero().clone();
    let hook: OpcodeHook = Arc::new(|f: &mut HookFrame<'_>| {
        f.push(12345.into())?;
        Ok(HookOutcome::Handled)
    });
    let hooks = engine.hooks().clone().with_opcode(Opcode::Timestamp as u8, hook);
    engine.set_hooks(hooks);
    let r = engine.call(&sender, &target, &[], zero.clone(), GAS, true).unwrap();
    assert_eq!(decode_u256(&r.output), 12345.into());

    let hooks = engine.hooks().clone().without_opcode(Opcode::Timestamp as u8);
    engine.set_hooks(hooks);
    let r = engine.call(&sender, &target, &[], zero, GAS, true).unwrap();
    assert_eq!(decode_u256(&r.output), engine.env.block.timestamp);
}

struct Reverse;

impl PrecompiledContract for Reverse {
    fn required_gas(&self, input: &[u8]) -> Gas {
        10 + input.len() as Gas
    }

    fn run(&self, input: &[u8]) -> (Bytes, Result<(), ExecError>) {
        let mut v = input.to_vec();
        v.reverse();
        (v.into(), Ok(()))
    }
}

#[test]
fn test_custom_precompile() {
    let (mut engine, sender) = setup();
    let addr = Addr::from(0x100);
    let hooks = engine.hooks().clone().with_precompile(addr.clone(), Arc::new(Reverse));
    engine.set_hooks(hooks);
    let r = engine
        .call(&sender, &addr, &[1, 2, 3], Wei::zero().clone(), GAS, true)
        .unwrap();
    assert_eq!(&r.output[..], &[3, 2, 1]);
    assert!(engine.hooks().has_precompile(&Addr::from(4)));
}

#[test]
fn test_deploy_at_chosen_address() {
    let (mut engine, sender) = setup();
    let at = Addr::from_seed(b"here");
    let r = engine
        .execute(Message {
            from: sender.clone(),
            to: None,
            value: Wei::zero().clone(),
            gas: GAS,
            data: contracts::counter().into(),
            is_static: false,
            create_at: Some(at.clone()),
        })
        .unwrap();
    assert_eq!(r.contract, Some(at.clone()));
    assert!(!engine.state().code(&at).unwrap().as_bytes().is_empty());
    assert!(matches!(
        engine.execute(Message {
            from: sender,
            to: None,
            value: Wei::zero().clone(),
            gas: GAS,
            data: Bytes::empty(),
            is_static: true,
            create_at: None,
        }),
        Err(Error::InvalidInput(_))
    ));
}

#[test]
fn test_nonce_overflow_leaves_no_revision() {
    let (mut engine, sender) = setup();
    let counter = deploy(&mut engine, &sender, &contracts::counter());
    engine.state_mut().set_nonce(&sender, u64::MAX);
    let alice = Addr::from_seed(b"alice");
    let err = engine
        .call(&sender, &counter, &contracts::increment(&alice), Wei::zero().clone(), GAS, false)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)), "{}", err);
    assert_eq!(engine.state().depth(), 0);
    assert_eq!(engine.state().nonce(&sender).unwrap(), u64::MAX);

    // static calls do not touch the nonce
    let r = engine
        .call(&sender, &counter, &contracts::get(&alice), Wei::zero().clone(), GAS, true)
        .unwrap();
    assert_eq!(decode_u256(&r.output), 0.into());
    assert_eq!(engine.state().depth(), 0);
}

/// Calls `inner`, then reads the balance of `target`.
fn call_then_balance(inner: &Addr, target: &Addr) -> Vec<u8> {
    Asm::new()
        .push(0u64)
        .push(0u64)
        .push(0u64)
        .push(0u64)
        .push(0u64)
        .push_addr(inner)
        .push(1_000_000u64)
        .op(Opcode::Call)
        .op(Opcode::Pop)
        .push_addr(target)
        .op(Opcode::Balance)
        .op(Opcode::Pop)
        .op(Opcode::Stop)
        .assemble()
        .unwrap()
}

/// Reads the balance of `target`, then ends with `end`.
fn balance_then(target: &Addr, end: Opcode) -> Vec<u8> {
    Asm::new()
        .push_addr(target)
        .op(Opcode::Balance)
        .op(Opcode::Pop)
        .push(0u64)
        .push(0u64)
        .op(end)
        .assemble()
        .unwrap()
}

#[test]
fn test_reverted_frame_cools_its_accesses() {
    let target = Addr::from_seed(b"target");
    let outer = Addr::from_seed(b"outer");
    let inner = Addr::from_seed(b"inner");
    let gas_with = |end: Opcode| {
        let (mut engine, sender) = setup();
        let outer_code = call_then_balance(&inner, &target);
        let inner_code = balance_then(&target, end);
        let state = engine.state_mut();
        state.set_code(&outer, Arc::new(PlainCode::new(outer_code.into())));
        state.set_code(&inner, Arc::new(PlainCode::new(inner_code.into())));
        engine
            .call(&sender, &outer, &[], Wei::zero().clone(), GAS, false)
            .unwrap()
            .gas_used
    };
    // the second read is warm only if the frame that made the first one returned
    assert_eq!(gas_with(Opcode::Revert) - gas_with(Opcode::Return), 2500);
}
