//! Hand-assembled contracts used throughout the tests.
use qenv::common::{Addr, Hash, U256};
use qenv::core::opcode::Opcode::*;

use crate::{abi, Asm};

/// Init code that deploys `runtime` unchanged.
pub fn deployer(runtime: &[u8]) -> Vec<u8> {
    let asm = Asm::new()
        .push_n(2, runtime.len() as u64)
        .push_label("runtime")
        .push(0u64)
        .op(CodeCopy)
        .push_n(2, runtime.len() as u64)
        .push(0u64)
        .op(Return)
        .mark("runtime")
        .raw(runtime);
    asm.assemble().unwrap_or_default()
}

/// Push `keccak(arg0 . 0)`, the slot of `balances[arg0]` for a mapping at slot 0.
fn mapping_slot(asm: Asm) -> Asm {
    asm.push(4u64)
        .op(CallDataLoad)
        .push(0u64)
        .op(MStore)
        .push(0u64)
        .push(32u64)
        .op(MStore)
        .push(64u64)
        .push(0u64)
        .op(Sha3)
}

fn dispatch(asm: Asm, signature: &str, label: &str) -> Asm {
    let sel = qenv::common::selector(signature);
    asm.op(Dup1)
        .push_n(4, U256::from_big_endian(&sel))
        .op(Eql)
        .jumpi_to(label)
}

fn return_word_at_0(asm: Asm) -> Asm {
    asm.push(32u64).push(0u64).op(Return)
}

/// Revert data of `Counter.bump_and_revert`.
pub const COUNTER_REVERT_DATA: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];

/// A counter per address, kept in a mapping at slot 0.
///
/// - `increment(address)`: add one, log the new value with the address as topic, return it.
/// - `get(address)`: the current value.
/// - `bump_and_revert(address)`: add one, then revert with [COUNTER_REVERT_DATA].
/// - `spin(uint256 n)`: loop `n` times.
pub fn counter_runtime() -> Vec<u8> {
    let mut asm = Asm::new().push(0u64).op(CallDataLoad).push(0xe0u64).op(Shr);
    asm = dispatch(asm, "increment(address)", "increment");
    asm = dispatch(asm, "get(address)", "get");
    asm = dispatch(asm, "bump_and_revert(address)", "bump_and_revert");
    asm = dispatch(asm, "spin(uint256)", "spin");
    asm = asm.push(0u64).op(Dup1).op(Revert);

    asm = mapping_slot(asm.label("increment"))
        .op(Dup1)
        .op(SLoad)
        .push(1u64)
        .op(Add)
        .op(Dup1)
        .push(0u64)
        .op(MStore)
        .op(Swap1)
        .op(SStore)
        .push(4u64)
        .op(CallDataLoad)
        .push(32u64)
        .push(0u64)
        .op(Log1);
    asm = return_word_at_0(asm);

    asm = mapping_slot(asm.label("get")).op(SLoad).push(0u64).op(MStore);
    asm = return_word_at_0(asm);

    asm = mapping_slot(asm.label("bump_and_revert"))
        .op(Dup1)
        .op(SLoad)
        .push(1u64)
        .op(Add)
        .op(Swap1)
        .op(SStore)
        .push_n(4, U256::from_big_endian(&COUNTER_REVERT_DATA))
        .push(0u64)
        .op(MStore)
        .push(4u64)
        .push(28u64)
        .op(Revert);

    asm = asm
        .label("spin")
        .push(4u64)
        .op(CallDataLoad)
        .label("spin_loop")
        .op(Dup1)
        .op(IsZero)
        .jumpi_to("spin_done")
        .push(1u64)
        .op(Swap1)
        .op(Sub)
        .jump_to("spin_loop")
        .label("spin_done")
        .op(Stop);
    asm.assemble().unwrap_or_default()
}

pub fn counter() -> Vec<u8> {
    deployer(&counter_runtime())
}

/// Storage slot holding the counter of `who`.
pub fn counter_slot(who: &Addr) -> U256 {
    let mut buf = abi::addr_word(who).to_vec();
    buf.extend_from_slice(&[0u8; 32]);
    Hash::hash(&buf).into()
}

pub fn increment(who: &Addr) -> Vec<u8> {
    abi::call("increment(address)", &[abi::addr_word(who)])
}

pub fn get(who: &Addr) -> Vec<u8> {
    abi::call("get(address)", &[abi::addr_word(who)])
}

pub fn bump_and_revert(who: &Addr) -> Vec<u8> {
    abi::call("bump_and_revert(address)", &[abi::addr_word(who)])
}

pub fn spin(n: u64) -> Vec<u8> {
    abi::call("spin(uint256)", &[abi::word(n.into())])
}

/// Writes 1 to slot 0, calls the address in the first calldata word with the rest of the
/// calldata, and stores the call's success flag in slot 1. A failing callee does not make it
/// fail.
pub fn caller_runtime() -> Vec<u8> {
    Asm::new()
        .push(1u64)
        .push(0u64)
        .op(SStore)
        .op(CallDataSize)
        .push(32u64)
        .op(Swap1)
        .op(Sub)
        .op(Dup1)
        .push(32u64)
        .push(0u64)
        .op(CallDataCopy)
        .push(0u64)
        .push(0u64)
        .op(Dup3)
        .push(0u64)
        .push(0u64)
        .push(0u64)
        .op(CallDataLoad)
        .op(Gas)
        .op(Call)
        .push(1u64)
        .op(SStore)
        .op(Stop)
        .assemble()
        .unwrap_or_default()
}

pub fn caller() -> Vec<u8> {
    deployer(&caller_runtime())
}

/// Calldata making the caller contract call `target` with `data`.
pub fn forward(target: &Addr, data: &[u8]) -> Vec<u8> {
    let mut v = abi::addr_word(target).to_vec();
    v.extend_from_slice(data);
    v
}

/// Runtime code returning the 32-byte word `v`.
pub fn constant_runtime(v: U256) -> Vec<u8> {
    return_word_at_0(Asm::new().push(v).push(0u64).op(MStore))
        .assemble()
        .unwrap_or_default()
}

#[test]
fn test_deployer_layout() {
    let runtime = constant_runtime(42u64.into());
    let init = deployer(&runtime);
    assert_eq!(&init[init.len() - runtime.len()..], &runtime[..]);
    assert_eq!(init.len() - runtime.len(), 13);
    assert_eq!(init[3..6], [0x61, 0x00, 0x0d]);
    assert!(!counter_runtime().is_empty());
    assert!(!caller_runtime().is_empty());
}
