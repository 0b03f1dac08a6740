use std::sync::Arc;

mod alu;
mod call;
mod exec;
pub mod gas;
pub mod hooks;
mod memory;
pub mod opcode;
pub mod params;
pub mod precompile;
mod stack;

use crate::common::{Addr, Bytes, Gas, Hash, U256};
pub use exec::{
    intrinsic_gas, CallOutput, Deployed, Engine, Executed, Message, PlainCode,
};
pub use gas::{
    CallSite, GasMeter, GasProfile, NoGasMeter, ProfilingGasMeter,
    StandardGasMeter,
};
pub use hooks::{HookFrame, HookOutcome, HookTable, OpcodeHook};
pub use params::Fork;

/// Contract code shared between the state layers, snapshots and running frames. Jump destination
/// checks and the hash are expected to be precomputed; see [PlainCode].
pub trait Code: Send + Sync {
    fn is_valid_jumpdest(&self, dest: &U256) -> bool;
    fn as_bytes(&self) -> &[u8];
    fn get_hash(&self) -> &Hash;
}

/// Pre-compiled smart contract.
pub trait PrecompiledContract: Send + Sync {
    /// Gas charged before [run](Self::run) is invoked.
    fn required_gas(&self, input: &[u8]) -> Gas;
    fn run(&self, input: &[u8]) -> (Bytes, Result<(), ExecError>);
}

/// A LOG0..LOG4 record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub address: Addr,
    pub topics: Vec<Hash>,
    pub data: Bytes,
}

#[derive(Clone, Debug)]
pub struct BlockInfo {
    pub coinbase: Addr,
    pub timestamp: U256,
    pub number: U256,
    pub difficulty: U256,
    pub gas_limit: u64,
    pub base_fee: U256,
    pub blob_base_fee: U256,
    pub fork: params::Fork,
}

impl Default for BlockInfo {
    fn default() -> Self {
        Self {
            coinbase: Addr::zero().clone(),
            timestamp: U256::zero(),
            number: U256::zero(),
            difficulty: U256::zero(),
            gas_limit: 30_000_000,
            base_fee: U256::zero(),
            blob_base_fee: U256::one(),
            fork: Fork::default(),
        }
    }
}

/// Execution environment for EVM. This captures the external information that is required to run
/// an EVM interpreter.
#[derive(Clone, Debug)]
pub struct ExecEnv {
    /// Chain ID.
    pub chain_id: U256,
    /// Block-related information.
    pub block: BlockInfo,
    /// Opcode overrides and precompiled contracts.
    pub hooks: Arc<HookTable>,
}

impl Default for ExecEnv {
    fn default() -> Self {
        Self {
            chain_id: U256::one(),
            block: BlockInfo::default(),
            hooks: Arc::new(HookTable::with_builtins()),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExecError {
    OutOfGas,
    CodeStoreOutOfGas,
    Depth,
    InsufficientBalance,
    ContractAddrCollision,
    Reverted,
    MaxCodeSizeExceeded,
    MaxInitCodeSizeExceeded,
    InvalidJump,
    WriteProtection,
    ReturnDataOutOfBounds,
    GasIntOverflow,
    InvalidCode,
    NonceIntOverflow,
    StackOverflow,
    StackUnderflow,
    OutOfMemory,
    InvalidOpcode,
    /// A state read could not be served; the transaction is aborted as a whole.
    StateUnavailable,
}

fn gas_checked_mul(x: Gas, y: Gas) -> Result<Gas, ExecError> {
    x.checked_mul(y).ok_or(ExecError::GasIntOverflow)
}

/// `src[off..off + len]`, right-padded with zeros.
fn get_data(src: &[u8], off: u64, len: u64) -> Vec<u8> {
    let start = off.min(src.len() as u64) as usize;
    let end = off.saturating_add(len).min(src.len() as u64) as usize;
    let mut data = src[start..end].to_vec();
    data.resize(len as usize, 0);
    data
}

#[test]
fn test_get_data() {
    assert_eq!(
        get_data(&hex::decode("00010203").unwrap(), 0, 4),
        hex::decode("00010203").unwrap()
    );
    assert_eq!(get_data(&[1, 2], 1, 3), vec![2, 0, 0]);
    assert_eq!(get_data(&[1, 2], u64::MAX, 2), vec![0, 0]);
}
