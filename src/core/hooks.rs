//! Interpreter extension points: opcode overrides and precompiled contracts.
//!
//! A [HookTable] is handed to the engine through [ExecEnv](super::ExecEnv) and is never mutated
//! afterwards; changing hooks means building a new table and installing it.
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::call::CallFrame;
use super::precompile;
use super::{ExecError, PrecompiledContract};
use crate::common::{Addr, Gas, U256};

/// What an opcode hook did with the instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookOutcome {
    /// The hook fully executed the instruction; the interpreter moves to the next one.
    Handled,
    /// Run the regular implementation of the instruction afterwards.
    Fallthrough,
}

pub type OpcodeHook =
    Arc<dyn Fn(&mut HookFrame<'_>) -> Result<HookOutcome, ExecError> + Send + Sync>;

/// Restricted view of the executing frame given to opcode hooks.
pub struct HookFrame<'a> {
    frame: &'a mut CallFrame,
    opcode: u8,
}

impl<'a> HookFrame<'a> {
    pub(super) fn new(frame: &'a mut CallFrame, opcode: u8) -> Self {
        Self { frame, opcode }
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn pc(&self) -> u64 {
        self.frame.pc
    }

    /// Address whose storage the frame operates on.
    pub fn address(&self) -> &Addr {
        &self.frame.callee
    }

    pub fn caller(&self) -> &Addr {
        &self.frame.caller
    }

    pub fn input(&self) -> &[u8] {
        self.frame.input()
    }

    pub fn stack_len(&self) -> usize {
        self.frame.stack.len()
    }

    pub fn peek(&self, n: usize) -> Result<U256, ExecError> {
        self.frame.stack.peek(n).copied()
    }

    pub fn pop(&mut self) -> Result<U256, ExecError> {
        self.frame.stack.consume1()
    }

    pub fn push(&mut self, val: U256) -> Result<(), ExecError> {
        self.frame.stack.push(val)
    }

    /// Memory bytes in `[off, off + len)` that are already allocated.
    pub fn memory(&self, off: usize, len: usize) -> &[u8] {
        self.frame.memory.peek(off, len)
    }

    pub fn use_gas(&mut self, gas: Gas) -> Result<(), ExecError> {
        self.frame.use_gas(gas)
    }
}

#[derive(Clone, Default)]
pub struct HookTable {
    opcodes: HashMap<u8, OpcodeHook>,
    precompiles: HashMap<Addr, Arc<dyn PrecompiledContract>>,
}

impl HookTable {
    /// No opcode overrides and no precompiles at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in precompiles (ecrecover, identity and the console.log sink).
    pub fn with_builtins() -> Self {
        let mut t = Self::empty();
        for (addr, c) in precompile::builtins() {
            t.precompiles.insert(addr, c);
        }
        t
    }

    pub fn with_opcode(mut self, opcode: u8, hook: OpcodeHook) -> Self {
        self.opcodes.insert(opcode, hook);
        self
    }

    pub fn without_opcode(mut self, opcode: u8) -> Self {
        self.opcodes.remove(&opcode);
        self
    }

    pub fn with_precompile(
        mut self, addr: Addr, contract: Arc<dyn PrecompiledContract>,
    ) -> Self {
        self.precompiles.insert(addr, contract);
        self
    }

    pub fn without_precompile(mut self, addr: &Addr) -> Self {
        self.precompiles.remove(addr);
        self
    }

    #[inline(always)]
    pub fn opcode(&self, opcode: u8) -> Option<&OpcodeHook> {
        if self.opcodes.is_empty() {
            return None
        }
        self.opcodes.get(&opcode)
    }

    #[inline(always)]
    pub fn precompile(
        &self, addr: &Addr,
    ) -> Option<&Arc<dyn PrecompiledContract>> {
        self.precompiles.get(addr)
    }

    pub fn precompile_addrs(&self) -> impl Iterator<Item = &Addr> {
        self.precompiles.keys()
    }

    pub fn has_precompile(&self, addr: &Addr) -> bool {
        self.precompiles.contains_key(addr)
    }
}

impl fmt::Debug for HookTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ops: Vec<_> = self.opcodes.keys().collect();
        ops.sort();
        let mut pre: Vec<_> = self.precompiles.keys().collect();
        pre.sort();
        f.debug_struct("HookTable")
            .field("opcodes", &ops)
            .field("precompiles", &pre)
            .finish()
    }
}
