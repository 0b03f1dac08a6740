use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;
use sha3::Digest;

use super::alu;
use super::exec::{CallType, FailureTrace};
use super::memory::Memory;
use super::params::*;
use super::stack::Stack;
use super::{gas_checked_mul, get_data, Code, ExecError};
use crate::common::{checked_as_u64, Addr, Bytes, Gas, Wei, U256};

/// How many program counters each frame remembers for failure reports.
pub const PC_TRAIL_LEN: usize = 32;

pub(super) struct CallFrame {
    pub pc: u64,
    pub memory: Memory,
    pub stack: Stack,
    pub code: Arc<dyn Code>,
    /// address of the executing contract
    pub callee: Addr,
    /// address of the caller
    pub caller: Addr,
    /// address the code was loaded from (differs from `callee` for DELEGATECALL/CALLCODE)
    pub code_addr: Addr,
    pub call_type: CallType,
    input: Box<[u8]>,
    pub value: Wei,
    pub last_returned: Bytes,
    pub unused_gas: Gas,
    pub gas_limit: Gas,
    pub read_only: bool,
    pub fork: Fork,
    /// false when the active gas meter does not enforce costs
    pub metered: bool,
    pub depth: usize,
    /// state revision opened for this frame
    pub rev: usize,
    pub recent: VecDeque<u64>,
    /// failure chain of the most recent sub-call, if it failed
    pub child_failure: Option<FailureTrace>,
}

macro_rules! make_unary_op {
    ($name: ident, $gas: expr) => {
        #[inline(always)]
        pub fn $name(&mut self) -> Result<(), ExecError> {
            self.use_gas($gas)?;
            let a = self.stack.consume1()?;
            self.stack.push(alu::$name(a))
        }
    };
}

macro_rules! make_binary_op {
    ($name: ident, $gas: expr) => {
        #[inline(always)]
        pub fn $name(&mut self) -> Result<(), ExecError> {
            self.use_gas($gas)?;
            let (a, b) = self.stack.consume2()?;
            self.stack.push(alu::$name(a, b))
        }
    };
    ($name: ident, $gas: expr, $fork: ident) => {
        #[inline(always)]
        pub fn $name(&mut self) -> Result<(), ExecError> {
            if self.fork < Fork::$fork {
                return Err(ExecError::InvalidOpcode)
            }
            self.use_gas($gas)?;
            let (a, b) = self.stack.consume2()?;
            self.stack.push(alu::$name(a, b))
        }
    };
}

macro_rules! make_ternary_op {
    ($name: ident, $gas: expr) => {
        #[inline(always)]
        pub fn $name(&mut self) -> Result<(), ExecError> {
            self.use_gas($gas)?;
            let (a, b, c) = self.stack.consume3()?;
            self.stack.push(alu::$name(a, b, c))
        }
    };
}

impl CallFrame {
    #[inline]
    pub fn new(
        code: Arc<dyn Code>, code_addr: Addr, input: Box<[u8]>, value: Wei,
        callee: Addr, caller: Addr, call_type: CallType, gas: Gas,
        read_only: bool, fork: Fork, metered: bool, depth: usize, rev: usize,
    ) -> Self {
        Self {
            pc: 0x0,
            memory: Memory::new(),
            stack: Stack::new(),
            code,
            callee,
            caller,
            code_addr,
            call_type,
            input,
            value,
            last_returned: Bytes::empty(),
            unused_gas: gas,
            gas_limit: gas,
            read_only,
            fork,
            metered,
            depth,
            rev,
            recent: VecDeque::with_capacity(PC_TRAIL_LEN),
            child_failure: None,
        }
    }

    pub fn input(&self) -> &[u8] {
        &self.input
    }

    #[inline(always)]
    pub fn record_pc(&mut self) {
        if self.recent.len() == PC_TRAIL_LEN {
            self.recent.pop_front();
        }
        self.recent.push_back(self.pc);
    }

    #[inline(always)]
    pub fn gas_used(&self) -> Gas {
        self.gas_limit.saturating_sub(self.unused_gas)
    }

    make_binary_op!(add, GAS_FASTEST);
    make_binary_op!(mul, GAS_FAST);
    make_binary_op!(sub, GAS_FASTEST);
    make_binary_op!(div, GAS_FAST);
    make_binary_op!(sdiv, GAS_FAST);
    make_binary_op!(rem, GAS_FAST);
    make_binary_op!(smod, GAS_FAST);
    make_ternary_op!(add_mod, GAS_MID);
    make_ternary_op!(mul_mod, GAS_MID);
    make_binary_op!(sign_extend, GAS_FAST);
    make_binary_op!(lt, GAS_FASTEST);
    make_binary_op!(gt, GAS_FASTEST);
    make_binary_op!(slt, GAS_FASTEST);
    make_binary_op!(sgt, GAS_FASTEST);
    make_binary_op!(eq, GAS_FASTEST);
    make_unary_op!(is_zero, GAS_FASTEST);
    make_binary_op!(and, GAS_FASTEST);
    make_binary_op!(or, GAS_FASTEST);
    make_binary_op!(xor, GAS_FASTEST);
    make_unary_op!(not, GAS_FASTEST);
    make_binary_op!(byte, GAS_FASTEST);
    make_binary_op!(shl, GAS_FASTEST, Constantinople);
    make_binary_op!(shr, GAS_FASTEST, Constantinople);
    make_binary_op!(sar, GAS_FASTEST, Constantinople);

    #[inline(always)]
    pub fn exp(&mut self) -> Result<(), ExecError> {
        let (a, b) = self.stack.consume2()?;
        let per_byte = if self.fork >= Fork::SpuriousDragon {
            GAS_EXP_BYTE_SPURIOUS_DRAGON
        } else {
            GAS_EXP_BYTE_FRONTIER
        };
        self.use_gas(GAS_SLOW)?;
        self.use_gas(gas_checked_mul(per_byte, (b.bits() as u64 + 7) >> 3)?)?;
        self.stack.push(alu::exp(a, b))
    }

    #[inline(always)]
    pub fn sha3(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_SHA3)?;
        let (off, len) = self.stack.consume2()?;
        let (data, mem_gas) = self.memory.get_slice(off, len)?;
        // EVM is big-endian
        let digest = U256::from_big_endian(&sha3::Keccak256::digest(data));
        self.use_gas(mem_gas)?;
        self.use_gas(gas_checked_mul(
            Memory::to_word_size(len.low_u64()),
            GAS_SHA3_WORD,
        )?)?;
        self.stack.push(digest)
    }

    #[inline(always)]
    pub fn addr(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_QUICK)?;
        self.stack.push(self.callee.clone().into())
    }

    #[inline(always)]
    pub fn caller(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_QUICK)?;
        self.stack.push(self.caller.clone().into())
    }

    #[inline(always)]
    pub fn call_value(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_QUICK)?;
        self.stack.push(self.value.clone().into())
    }

    #[inline(always)]
    pub fn call_data_load(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_FASTEST)?;
        let word = match checked_as_u64(&self.stack.consume1()?) {
            Some(off) => U256::from_big_endian(&get_data(&self.input, off, 32)),
            None => U256::zero(),
        };
        self.stack.push(word)
    }

    #[inline(always)]
    pub fn call_data_size(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_QUICK)?;
        self.stack.push(self.input.len().into())
    }

    #[inline(always)]
    pub fn code_size(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_QUICK)?;
        self.stack.push(self.code.as_bytes().len().into())
    }

    /// Shared body of CODECOPY/CALLDATACOPY: copy zero-padded `src[src_off..]` into memory.
    #[inline(always)]
    fn copy_to_memory(
        &mut self, src: &[u8], mem_off: U256, src_off: U256, len: U256,
    ) -> Result<(), ExecError> {
        let (mem, mem_gas) = self.memory.get_slice_mut(mem_off, len)?;
        let n = mem.len() as u64;
        let src_off = checked_as_u64(&src_off).unwrap_or(u64::MAX);
        mem.copy_from_slice(&get_data(src, src_off, n));
        self.use_gas(mem_gas)?;
        self.use_gas(gas_checked_mul(Memory::to_word_size(n), GAS_COPY_WORD)?)
    }

    #[inline(always)]
    pub fn code_copy(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_FASTEST)?;
        let (mem_off, code_off, len) = self.stack.consume3()?;
        let code = self.code.clone();
        self.copy_to_memory(code.as_bytes(), mem_off, code_off, len)
    }

    #[inline(always)]
    pub fn call_data_copy(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_FASTEST)?;
        let (mem_off, data_off, len) = self.stack.consume3()?;
        let input = std::mem::take(&mut self.input);
        let res = self.copy_to_memory(&input, mem_off, data_off, len);
        self.input = input;
        res
    }

    #[inline(always)]
    pub fn return_data_size(&mut self) -> Result<(), ExecError> {
        if self.fork < Fork::Byzantium {
            return Err(ExecError::InvalidOpcode)
        }
        self.use_gas(GAS_QUICK)?;
        self.stack.push(self.last_returned.len().into())
    }

    #[inline(always)]
    pub fn return_data_copy(&mut self) -> Result<(), ExecError> {
        if self.fork < Fork::Byzantium {
            return Err(ExecError::InvalidOpcode)
        }
        self.use_gas(GAS_FASTEST)?;
        let (mem_off, data_off, len) = self.stack.consume3()?;
        // unlike CALLDATACOPY, reading past the end fails instead of padding
        let (end, overflow) = data_off.overflowing_add(len);
        if overflow || end > U256::from(self.last_returned.len()) {
            return Err(ExecError::ReturnDataOutOfBounds)
        }
        let (start, end) = (data_off.as_usize(), end.as_usize());
        let (mem, mem_gas) = self.memory.get_slice_mut(mem_off, len)?;
        mem.copy_from_slice(&self.last_returned[start..end]);
        self.use_gas(mem_gas)?;
        self.use_gas(gas_checked_mul(
            Memory::to_word_size((end - start) as u64),
            GAS_COPY_WORD,
        )?)
    }

    #[inline(always)]
    pub fn pop(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_QUICK)?;
        self.stack.consume1().map(|_| ())
    }

    #[inline(always)]
    pub fn mload(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_FASTEST)?;
        let off = self.stack.consume1()?;
        let (mem, mem_gas) = self.memory.get_slice(off, 32.into())?;
        let word = U256::from_big_endian(mem);
        self.use_gas(mem_gas)?;
        self.stack.push(word)
    }

    #[inline(always)]
    pub fn mstore(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_FASTEST)?;
        let (off, val) = self.stack.consume2()?;
        let (mem, mem_gas) = self.memory.get_slice_mut(off, 32.into())?;
        val.to_big_endian(mem);
        self.use_gas(mem_gas)
    }

    #[inline(always)]
    pub fn mstore8(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_FASTEST)?;
        let (off, val) = self.stack.consume2()?;
        let (mem, mem_gas) = self.memory.get_slice_mut(off, U256::one())?;
        mem[0] = val.byte(0);
        self.use_gas(mem_gas)
    }

    #[inline(always)]
    pub fn mcopy(&mut self) -> Result<(), ExecError> {
        if self.fork < Fork::Cancun {
            return Err(ExecError::InvalidOpcode)
        }
        self.use_gas(GAS_FASTEST)?;
        let (dst, src, len) = self.stack.consume3()?;
        let mem_gas = self.memory.copy_within(dst, src, len)?;
        self.use_gas(mem_gas)?;
        self.use_gas(gas_checked_mul(
            Memory::to_word_size(len.low_u64()),
            GAS_COPY_WORD,
        )?)
    }

    #[inline(always)]
    pub fn pc(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_QUICK)?;
        self.stack.push(self.pc.into())
    }

    #[inline(always)]
    pub fn msize(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_QUICK)?;
        self.stack.push(self.memory.len().into())
    }

    #[inline(always)]
    pub fn gas(&mut self) -> Result<(), ExecError> {
        self.use_gas(GAS_QUICK)?;
        self.stack.push(self.unused_gas.into())
    }

    #[inline(always)]
    pub fn push0(&mut self) -> Result<(), ExecError> {
        if self.fork < Fork::Shanghai {
            return Err(ExecError::InvalidOpcode)
        }
        self.use_gas(GAS_QUICK)?;
        self.stack.push(U256::zero())
    }

    /// PUSH1..PUSH32; `data` may be cut short at the end of the code (implicitly zero-padded).
    #[inline(always)]
    pub fn push(&mut self, data: &[u8], width: usize) -> Result<(), ExecError> {
        self.use_gas(GAS_FASTEST)?;
        let mut word = U256::from_big_endian(data);
        if data.len() < width {
            word <<= 8 * (width - data.len());
        }
        self.stack.push(word)
    }

    #[inline(always)]
    pub fn dup(&mut self, pos: usize) -> Result<(), ExecError> {
        self.use_gas(GAS_FASTEST)?;
        self.stack.dup(pos)
    }

    #[inline(always)]
    pub fn swap(&mut self, pos: usize) -> Result<(), ExecError> {
        self.use_gas(GAS_FASTEST)?;
        self.stack.swap(pos)
    }

    #[inline(always)]
    pub fn use_gas(&mut self, gas: Gas) -> Result<(), ExecError> {
        if !self.metered {
            return Ok(())
        }
        if self.unused_gas < gas {
            debug!("Out of Gas: {} < {}", self.unused_gas, gas);
            return Err(ExecError::OutOfGas)
        }
        self.unused_gas -= gas;
        Ok(())
    }

    /// Give back gas that was reserved for a sub-call.
    #[inline(always)]
    pub fn return_gas(&mut self, gas: Gas) {
        if self.metered {
            self.unused_gas = self.unused_gas.saturating_add(gas)
        }
    }
}
