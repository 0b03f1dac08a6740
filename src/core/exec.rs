use std::collections::HashSet;
use std::sync::Arc;

use bitvec::vec::BitVec;
use log::{debug, warn};
use num_traits::FromPrimitive;

use super::call::CallFrame;
use super::gas::{CallSite, GasMeter, StandardGasMeter};
use super::hooks::{HookFrame, HookOutcome, HookTable};
use super::memory::Memory;
use super::opcode::Opcode;
use super::params::*;
use super::{gas_checked_mul, get_data, Code, ExecEnv, ExecError, LogEntry};
use crate::common::{
    checked_as_u64, create_addr, create_addr2, word_bytes, Addr, Bytes, Gas,
    Hash, Wei, U256,
};
use crate::error::{
    CallStackEntry, Error, ExecutionFailure, PcTrailEntry, StateError,
};
use crate::state::{MemState, StateBackend};

/// Simple code object implementation that can be constructed from raw byte code. PlainCode is
/// standalone and caches code hash and valid jumps for the code itself.
pub struct PlainCode {
    code: Box<[u8]>,
    bitmap: BitVec,
    hash: Hash,
}

impl PlainCode {
    pub fn new(code: Box<[u8]>) -> Self {
        let bitmap = crate::common::gen_code_bitmap(&code);
        let hash = Hash::hash(&code);
        Self { code, bitmap, hash }
    }
}

impl Code for PlainCode {
    fn is_valid_jumpdest(&self, dest: &U256) -> bool {
        match checked_as_u64(dest) {
            Some(d) => {
                let d = d as usize;
                self.bitmap.get(d).map(|b| *b).unwrap_or(false) &&
                    self.code[d] == Opcode::JumpDest as u8
            }
            None => false,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.code
    }

    fn get_hash(&self) -> &Hash {
        &self.hash
    }
}

/// The decoded instruction.
enum Inst<'a> {
    Op(Opcode),
    /// PUSH1..PUSH32: immediate bytes (possibly truncated by the end of code) and nominal width
    Push(&'a [u8], usize),
    Dup(usize),
    Swap(usize),
}

impl<'a> Inst<'a> {
    #[inline(always)]
    fn decode(code: &'a [u8], pc: usize) -> (u8, Self) {
        let raw = code.get(pc).copied().unwrap_or(Opcode::Stop as u8);
        let inst = match raw {
            c @ 0x60..=0x7f => {
                let width = (c - 0x5f) as usize;
                let start = (pc + 1).min(code.len());
                let end = (pc + 1 + width).min(code.len());
                Inst::Push(&code[start..end], width)
            }
            c @ 0x80..=0x8f => Inst::Dup((c - 0x7f) as usize),
            c @ 0x90..=0x9f => Inst::Swap((c - 0x8f) as usize),
            c => Inst::Op(Opcode::from_u8(c).unwrap_or(Opcode::Invalid)),
        };
        (raw, inst)
    }

    fn skip(&self) -> u64 {
        match self {
            Inst::Push(_, width) => *width as u64,
            _ => 0,
        }
    }
}

/// Chain of frames that failed, outermost first.
#[derive(Clone, Debug, Default)]
pub(super) struct FailureTrace {
    call_stack: Vec<CallStackEntry>,
    pc_trail: Vec<PcTrailEntry>,
}

impl FailureTrace {
    fn wrap(frame: &CallFrame, inner: Option<FailureTrace>) -> Self {
        let mut t = Self {
            call_stack: vec![CallStackEntry {
                address: frame.code_addr.clone(),
                calldata: frame.input().into(),
                depth: frame.depth,
            }],
            pc_trail: vec![PcTrailEntry {
                address: frame.code_addr.clone(),
                pc: frame.pc,
                recent: frame.recent.iter().copied().collect(),
            }],
        };
        if let Some(inner) = inner {
            t.call_stack.extend(inner.call_stack);
            t.pc_trail.extend(inner.pc_trail);
        }
        t
    }

    /// A callee that failed without running bytecode (precompile, aborted creation...).
    fn leaf(address: &Addr, calldata: &[u8], depth: usize) -> Self {
        Self {
            call_stack: vec![CallStackEntry {
                address: address.clone(),
                calldata: calldata.into(),
                depth,
            }],
            pc_trail: Vec::new(),
        }
    }
}

pub(super) enum TxAux {
    Sender,
    Contract(Addr),
}

pub(super) struct TxArgs {
    aux: TxAux,
}

pub(super) struct CallArgs {
    ret_off: U256,
    ret_len: U256,
    site: CallSite,
}

pub(super) struct CreateArgs {
    contract_addr: Addr,
    site: CallSite,
}

pub(super) enum CallType {
    Tx(TxArgs),
    Call(CallArgs),
    Create(CreateArgs),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CallKind {
    Call,
    CallCode,
    DelegateCall,
    StaticCall,
}

/// The result of a transaction execution.
enum TxExecResult {
    Succeeded {
        data: Bytes,
        unused_gas: Gas,
        contract: Option<Addr>,
    },
    Failed {
        data: Bytes,
        unused_gas: Gas,
        err: ExecError,
        trace: FailureTrace,
    },
}

enum TxExecStatus {
    Running,
    Finished(TxExecResult),
}

enum Warmed {
    Addr(Addr),
    Slot(Addr, Hash),
}

/// EIP-2929 warm sets. Every addition is journaled with the state depth it was made at, so a
/// frame that reverts cools down again whatever it warmed.
#[derive(Default)]
struct AccessList {
    addrs: HashSet<Addr>,
    slots: HashSet<(Addr, Hash)>,
    /// depths never decrease along the journal
    journal: Vec<(usize, Warmed)>,
}

impl AccessList {
    /// Returns true if the address was cold.
    fn add_addr(&mut self, addr: &Addr, depth: usize) -> bool {
        let cold = self.addrs.insert(addr.clone());
        if cold {
            self.journal.push((depth, Warmed::Addr(addr.clone())));
        }
        cold
    }

    /// Returns true if the slot was cold.
    fn add_slot(&mut self, addr: &Addr, slot: &Hash, depth: usize) -> bool {
        self.add_addr(addr, depth);
        let cold = self.slots.insert((addr.clone(), slot.clone()));
        if cold {
            self.journal
                .push((depth, Warmed::Slot(addr.clone(), slot.clone())));
        }
        cold
    }

    /// Forget what was warmed while revision `rev` or a later one was open.
    fn rollback(&mut self, rev: usize) {
        while self.journal.last().map_or(false, |(d, _)| *d > rev) {
            match self.journal.pop() {
                Some((_, Warmed::Addr(a))) => {
                    self.addrs.remove(&a);
                }
                Some((_, Warmed::Slot(a, s))) => {
                    self.slots.remove(&(a, s));
                }
                None => break,
            }
        }
    }

    /// Hand what revision `rev` and later ones warmed over to the revision below.
    fn consolidate(&mut self, rev: usize) {
        for (d, _) in self.journal.iter_mut().rev() {
            if *d <= rev {
                break
            }
            *d = rev;
        }
    }
}

/// Store a backing-store failure and abort the whole transaction.
macro_rules! read {
    ($fatal: expr, $e: expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => {
                $fatal = Some(e);
                return Err(ExecError::StateUnavailable)
            }
        }
    };
}

struct TxExecContext<'a> {
    call_stack: Vec<Box<CallFrame>>,
    /// Top of the contract call stack, not included in `call_stack`
    cur_call: Box<CallFrame>,
    state: &'a mut MemState,
    env: &'a ExecEnv,
    meter: &'a mut dyn GasMeter,
    /// Access list for warm/cold determination
    access_list: AccessList,
    /// Contracts created by this transaction (EIP-6780)
    created: HashSet<Addr>,
    /// revision opened for the transaction; storage below it holds the original values
    tx_rev: usize,
    fatal: Option<StateError>,
    /// gas handed to the frame (or precompile) that is about to report back
    reserved: Gas,
    jumped: bool,
    status: TxExecStatus,
    metered: bool,

    origin: Addr,
    gas_price: Wei,
}

impl<'a> TxExecContext<'a> {
    /// Keep or drop the state changes and warm accesses of revision `rev`.
    fn close_revision(&mut self, rev: usize, keep: bool) {
        if keep {
            self.state.consolidate(rev);
            self.access_list.consolidate(rev);
        } else {
            self.state.rollback(rev);
            self.access_list.rollback(rev);
        }
    }

    #[inline(always)]
    fn account_access_gas(
        &mut self, addr: &Addr, legacy: Gas,
    ) -> Result<(), ExecError> {
        let depth = self.state.depth();
        let call = &mut self.cur_call;
        if call.fork >= Fork::Berlin {
            call.use_gas(if self.access_list.add_addr(addr, depth) {
                GAS_COLD_ACCOUNT_ACCESS_COST_BERLIN
            } else {
                GAS_WARM_STORAGE_READ_COST_BERLIN
            })
        } else {
            call.use_gas(legacy)
        }
    }

    #[inline(always)]
    fn balance(&mut self) -> Result<(), ExecError> {
        let fork = self.cur_call.fork;
        let addr: Addr = self.cur_call.stack.consume1()?.into();
        self.account_access_gas(
            &addr,
            if fork >= Fork::Istanbul {
                GAS_BALANCE_ISTANBUL
            } else if fork >= Fork::TangerineWhistle {
                GAS_BALANCE_TANGERINE
            } else {
                GAS_BALANCE_FRONTIER
            },
        )?;
        let balance = read!(self.fatal, self.state.balance(&addr));
        self.cur_call.stack.push(balance.into())
    }

    #[inline(always)]
    fn origin(&mut self) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        call.use_gas(GAS_QUICK)?;
        call.stack.push(self.origin.clone().into())
    }

    #[inline(always)]
    fn ext_code_legacy_gas(&self) -> Gas {
        if self.cur_call.fork >= Fork::TangerineWhistle {
            GAS_EXT_CODE_SIZE_TANGERINE
        } else {
            GAS_EXT_CODE_SIZE_FRONTIER
        }
    }

    #[inline(always)]
    fn ext_code_size(&mut self) -> Result<(), ExecError> {
        let addr: Addr = self.cur_call.stack.consume1()?.into();
        self.account_access_gas(&addr, self.ext_code_legacy_gas())?;
        let code = read!(self.fatal, self.state.code(&addr));
        self.cur_call.stack.push(code.as_bytes().len().into())
    }

    #[inline(always)]
    fn ext_code_copy(&mut self) -> Result<(), ExecError> {
        let (addr, mem_off, code_off, len) = self.cur_call.stack.consume4()?;
        let addr: Addr = addr.into();
        self.account_access_gas(&addr, self.ext_code_legacy_gas())?;
        let code = read!(self.fatal, self.state.code(&addr));
        let call = &mut self.cur_call;
        let (mem, mem_gas) = call.memory.get_slice_mut(mem_off, len)?;
        let n = mem.len() as u64;
        let code_off = checked_as_u64(&code_off).unwrap_or(u64::MAX);
        mem.copy_from_slice(&get_data(code.as_bytes(), code_off, n));
        call.use_gas(mem_gas)?;
        call.use_gas(gas_checked_mul(Memory::to_word_size(n), GAS_COPY_WORD)?)
    }

    #[inline(always)]
    fn ext_code_hash(&mut self) -> Result<(), ExecError> {
        let fork = self.cur_call.fork;
        if fork < Fork::Constantinople {
            return Err(ExecError::InvalidOpcode)
        }
        let addr: Addr = self.cur_call.stack.consume1()?.into();
        self.account_access_gas(
            &addr,
            if fork >= Fork::Istanbul {
                GAS_EXT_CODE_HASH_ISTANBUL
            } else {
                GAS_EXT_CODE_HASH_CONSTANTINOPLE
            },
        )?;
        let h = if read!(self.fatal, self.state.is_empty(&addr)) {
            U256::zero()
        } else {
            read!(self.fatal, self.state.code(&addr)).get_hash().clone().into()
        };
        self.cur_call.stack.push(h)
    }

    #[inline(always)]
    fn block_hash(&mut self) -> Result<(), ExecError> {
        self.cur_call.use_gas(GAS_EXT)?;
        let number = self.cur_call.stack.consume1()?;
        let upper = self.env.block.number.low_u64();
        let lower = upper.saturating_sub(256);
        let h = match checked_as_u64(&number) {
            Some(n) if n >= lower && n < upper => {
                read!(self.fatal, self.state.block_hash(n)).into()
            }
            _ => U256::zero(),
        };
        self.cur_call.stack.push(h)
    }

    #[inline(always)]
    fn push_env_word(
        &mut self, val: U256, since: Fork,
    ) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        if call.fork < since {
            return Err(ExecError::InvalidOpcode)
        }
        call.use_gas(GAS_QUICK)?;
        call.stack.push(val)
    }

    #[inline(always)]
    fn self_balance(&mut self) -> Result<(), ExecError> {
        if self.cur_call.fork < Fork::Istanbul {
            return Err(ExecError::InvalidOpcode)
        }
        self.cur_call.use_gas(GAS_FAST)?;
        let balance = read!(self.fatal, self.state.balance(&self.cur_call.callee));
        self.cur_call.stack.push(balance.into())
    }

    #[inline(always)]
    fn blob_hash(&mut self) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        if call.fork < Fork::Cancun {
            return Err(ExecError::InvalidOpcode)
        }
        call.use_gas(GAS_BLOB_HASH)?;
        // no blob transactions here, every index is out of range
        call.stack.consume1()?;
        call.stack.push(U256::zero())
    }

    #[inline(always)]
    fn sload(&mut self) -> Result<(), ExecError> {
        let depth = self.state.depth();
        let call = &mut self.cur_call;
        let key: Hash = call.stack.consume1()?.into();
        call.use_gas(if call.fork >= Fork::Berlin {
            if self.access_list.add_slot(&call.callee, &key, depth) {
                GAS_COLD_SLOAD_COST_BERLIN
            } else {
                GAS_WARM_STORAGE_READ_COST_BERLIN
            }
        } else if call.fork >= Fork::Istanbul {
            GAS_SLOAD_ISTANBUL
        } else if call.fork >= Fork::TangerineWhistle {
            GAS_SLOAD_TANGERINE
        } else {
            GAS_SLOAD_FRONTIER
        })?;
        let val = read!(self.fatal, self.state.storage(&call.callee, &key));
        call.stack.push(val)
    }

    #[inline(always)]
    fn jump(&mut self) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        call.use_gas(GAS_MID)?;
        let dest = call.stack.consume1()?;
        if !call.code.is_valid_jumpdest(&dest) {
            return Err(ExecError::InvalidJump)
        }
        call.pc = dest.as_u64();
        self.jumped = true;
        Ok(())
    }

    #[inline(always)]
    fn jumpi(&mut self) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        call.use_gas(GAS_SLOW)?;
        let (dest, cond) = call.stack.consume2()?;
        if !cond.is_zero() {
            if !call.code.is_valid_jumpdest(&dest) {
                return Err(ExecError::InvalidJump)
            }
            call.pc = dest.as_u64();
            self.jumped = true;
        }
        Ok(())
    }

    fn add_refund(&mut self, gas: Gas) {
        self.state.add_refund(gas as i64)
    }

    fn sub_refund(&mut self, gas: Gas) {
        self.state.add_refund(-(gas as i64))
    }

    /// Current and original (transaction start) value of a slot of the running contract.
    #[inline(always)]
    fn slot_values(&mut self, key: &Hash) -> Result<(U256, U256), ExecError> {
        let addr = &self.cur_call.callee;
        let cur = read!(self.fatal, self.state.storage(addr, key));
        let orig = read!(
            self.fatal,
            self.state.storage_below(addr, key, self.tx_rev)
        );
        Ok((cur, orig))
    }

    // EIP-2200
    fn sstore_istanbul_gas(
        &mut self, key: &Hash, val: &U256,
    ) -> Result<(), ExecError> {
        if self.metered &&
            self.cur_call.unused_gas <= GAS_SSTORE_SENTRY_ISTANBUL
        {
            // not enough gas for re-entrancy sentry
            return Err(ExecError::OutOfGas)
        }
        let (cur, orig) = self.slot_values(key)?;
        if cur == *val {
            // noop (1)
            return self.cur_call.use_gas(GAS_SLOAD_ISTANBUL)
        }
        if orig == cur {
            if orig.is_zero() {
                // create slot (2.1.1)
                return self.cur_call.use_gas(GAS_SSTORE_SET_ISTANBUL)
            }
            if val.is_zero() {
                // delete slot (2.1.2b)
                self.add_refund(GAS_SSTORE_REFUND_ISTANBUL);
            }
            return self.cur_call.use_gas(GAS_SSTORE_RESET_ISTANBUL)
        }
        if !orig.is_zero() {
            if cur.is_zero() {
                // recreate slot (2.2.1.1)
                self.sub_refund(GAS_SSTORE_REFUND_ISTANBUL);
            } else if val.is_zero() {
                // delete slot (2.2.1.2)
                self.add_refund(GAS_SSTORE_REFUND_ISTANBUL);
            }
        }
        if orig == *val {
            self.add_refund(if orig.is_zero() {
                // reset to original inexistent slot (2.2.2.1)
                GAS_SSTORE_SET_ISTANBUL - GAS_SLOAD_ISTANBUL
            } else {
                // reset to original existing slot (2.2.2.2)
                GAS_SSTORE_RESET_ISTANBUL - GAS_SLOAD_ISTANBUL
            })
        }
        // dirty update (2.2)
        self.cur_call.use_gas(GAS_SLOAD_ISTANBUL)
    }

    // EIP-2929 and EIP-3529
    fn sstore_berlin_london_gas(
        &mut self, key: &Hash, val: &U256, clearing_refund: Gas,
    ) -> Result<(), ExecError> {
        if self.metered &&
            self.cur_call.unused_gas <= GAS_SSTORE_SENTRY_ISTANBUL
        {
            return Err(ExecError::OutOfGas)
        }
        let depth = self.state.depth();
        let cold = if self.access_list.add_slot(&self.cur_call.callee, key, depth) {
            GAS_COLD_SLOAD_COST_BERLIN
        } else {
            0
        };
        let (cur, orig) = self.slot_values(key)?;
        if cur == *val {
            return self
                .cur_call
                .use_gas(cold + GAS_WARM_STORAGE_READ_COST_BERLIN)
        }
        if orig == cur {
            if orig.is_zero() {
                return self.cur_call.use_gas(cold + GAS_SSTORE_SET_ISTANBUL)
            }
            if val.is_zero() {
                self.add_refund(clearing_refund)
            }
            return self.cur_call.use_gas(
                cold + (GAS_SSTORE_RESET_ISTANBUL - GAS_COLD_SLOAD_COST_BERLIN),
            )
        }
        if !orig.is_zero() {
            if cur.is_zero() {
                self.sub_refund(clearing_refund);
            } else if val.is_zero() {
                self.add_refund(clearing_refund);
            }
        }
        if orig == *val {
            self.add_refund(if orig.is_zero() {
                GAS_SSTORE_SET_ISTANBUL - GAS_WARM_STORAGE_READ_COST_BERLIN
            } else {
                GAS_SSTORE_RESET_ISTANBUL -
                    GAS_COLD_SLOAD_COST_BERLIN -
                    GAS_WARM_STORAGE_READ_COST_BERLIN
            });
        }
        self.cur_call
            .use_gas(cold + GAS_WARM_STORAGE_READ_COST_BERLIN)
    }

    #[inline(always)]
    fn sstore(&mut self) -> Result<(), ExecError> {
        if self.cur_call.read_only {
            return Err(ExecError::WriteProtection)
        }
        let (key, val) = self.cur_call.stack.consume2()?;
        let key: Hash = key.into();
        let fork = self.cur_call.fork;
        if fork >= Fork::Berlin {
            self.sstore_berlin_london_gas(
                &key,
                &val,
                if fork >= Fork::London {
                    GAS_SSTORE_REFUND_LONDON
                } else {
                    GAS_SSTORE_REFUND_ISTANBUL
                },
            )?;
        } else if fork >= Fork::Istanbul {
            self.sstore_istanbul_gas(&key, &val)?;
        } else {
            // EIP1283 is removed
            let (cur, _) = self.slot_values(&key)?;
            let gas = if cur.is_zero() && !val.is_zero() {
                GAS_SSTORE_SET
            } else if !cur.is_zero() && val.is_zero() {
                self.add_refund(GAS_SSTORE_REFUND);
                GAS_SSTORE_CLEAR
            } else {
                GAS_SSTORE_RESET
            };
            self.cur_call.use_gas(gas)?;
        }
        self.state.set_storage(&self.cur_call.callee, &key, val);
        Ok(())
    }

    #[inline(always)]
    fn tload(&mut self) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        if call.fork < Fork::Cancun {
            return Err(ExecError::InvalidOpcode)
        }
        call.use_gas(GAS_TRANSIENT)?;
        let key: Hash = call.stack.consume1()?.into();
        call.stack.push(self.state.transient(&call.callee, &key))
    }

    #[inline(always)]
    fn tstore(&mut self) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        if call.fork < Fork::Cancun {
            return Err(ExecError::InvalidOpcode)
        }
        if call.read_only {
            return Err(ExecError::WriteProtection)
        }
        call.use_gas(GAS_TRANSIENT)?;
        let (key, val) = call.stack.consume2()?;
        self.state.set_transient(&call.callee, &key.into(), val);
        Ok(())
    }

    #[inline(always)]
    fn log(&mut self, num: usize) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        if call.read_only {
            return Err(ExecError::WriteProtection)
        }
        call.use_gas(GAS_LOG)?;
        call.use_gas(gas_checked_mul(num as u64, GAS_LOG_TOPIC)?)?;
        let (off, length) = call.stack.consume2()?;
        call.use_gas(gas_checked_mul(
            checked_as_u64(&length).ok_or(ExecError::OutOfMemory)?,
            GAS_LOG_DATA,
        )?)?;
        let mut topics: Vec<Hash> = Vec::with_capacity(num);
        for _ in 0..num {
            topics.push(call.stack.consume1()?.into());
        }
        let (mem, mem_gas) = call.memory.get_slice(off, length)?;
        let data = Bytes::from(mem);
        call.use_gas(mem_gas)?;
        self.state.add_log(LogEntry {
            address: call.callee.clone(),
            topics,
            data,
        });
        Ok(())
    }

    /// Enter the init code of a new contract at `contract_addr`.
    fn create_(
        &mut self, contract_addr: Addr, caller: Addr, code: Box<[u8]>,
        value: Wei, gas: Gas, args: CallType,
    ) -> Result<(), ExecError> {
        self.reserved = gas;
        let top_level = matches!(args, CallType::Tx(_));
        if self.call_depth() > MAX_CALL_DEPTH {
            return self.abort_call(args, gas, ExecError::Depth, &contract_addr)
        }
        if read!(self.fatal, self.state.balance(&caller)) < value {
            return self.abort_call(
                args,
                gas,
                ExecError::InsufficientBalance,
                &contract_addr,
            )
        }
        if !top_level {
            // the creator's nonce stays bumped even if the creation fails
            let nonce = read!(self.fatal, self.state.nonce(&caller))
                .checked_add(1)
                .ok_or(ExecError::NonceIntOverflow)?;
            self.state.set_nonce(&caller, nonce);
        }
        if self.cur_call.fork >= Fork::Berlin {
            self.access_list.add_addr(&contract_addr, self.state.depth());
        }
        let rev = self.state.checkpoint();
        let cnonce = read!(self.fatal, self.state.nonce(&contract_addr));
        let ccode = read!(self.fatal, self.state.code(&contract_addr));
        if cnonce != 0 || !ccode.as_bytes().is_empty() {
            let trace = FailureTrace::leaf(&contract_addr, &[], self.call_depth());
            return self.end_frame(
                args,
                rev,
                Bytes::empty(),
                0,
                Err(ExecError::ContractAddrCollision),
                Some(trace),
            )
        }
        let balance = read!(self.fatal, self.state.balance(&contract_addr));
        self.state.reset_account(&contract_addr, balance);
        if self.cur_call.fork >= Fork::SpuriousDragon {
            // EIP158
            self.state.set_nonce(&contract_addr, 1);
        }
        // transfer into new contract account
        if read!(self.fatal, self.state.transfer(&caller, &contract_addr, &value))
            .is_none()
        {
            return self.end_frame(
                args,
                rev,
                Bytes::empty(),
                gas,
                Err(ExecError::InsufficientBalance),
                None,
            )
        }
        self.created.insert(contract_addr.clone());
        let code = Arc::new(PlainCode::new(code)) as Arc<dyn Code>;
        self.call_push(
            code,
            contract_addr.clone(),
            Vec::new().into(),
            value,
            contract_addr,
            caller,
            args,
            gas,
            false,
            rev,
        );
        Ok(())
    }

    #[inline(always)]
    fn create_begin(&mut self, salted: bool) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        if salted && call.fork < Fork::Constantinople {
            return Err(ExecError::InvalidOpcode)
        }
        if call.read_only {
            return Err(ExecError::WriteProtection)
        }
        call.use_gas(if salted { GAS_CREATE2 } else { GAS_CREATE })?;
        let (value, off, len) = call.stack.consume3()?;
        let salt = if salted {
            Some(call.stack.consume1()?)
        } else {
            None
        };
        if call.fork >= Fork::Shanghai && len > U256::from(MAX_INITCODE_SIZE) {
            return Err(ExecError::MaxInitCodeSizeExceeded)
        }
        let (input, mem_gas) = call.memory.get_slice(off, len)?;
        let code = input.to_vec().into_boxed_slice();
        call.use_gas(mem_gas)?;
        let words = Memory::to_word_size(code.len() as u64);
        if salted {
            call.use_gas(gas_checked_mul(words, GAS_SHA3_WORD)?)?;
        }
        if call.fork >= Fork::Shanghai {
            // EIP-3860
            call.use_gas(gas_checked_mul(words, GAS_INITCODE_WORD)?)?;
        }

        // EIP150
        let mut gas_quota = call.unused_gas;
        if call.fork >= Fork::TangerineWhistle {
            gas_quota -= gas_quota / 64;
        }
        // borrow the gas for the nested call, whose residual will be returned when the nested call
        // is finished
        call.use_gas(gas_quota)?;

        let caller = call.callee.clone();
        let contract_addr = match salt {
            Some(salt) => {
                create_addr2(&caller, &word_bytes(&salt), Hash::hash(&code).as_bytes())
            }
            None => {
                let nonce = read!(self.fatal, self.state.nonce(&caller));
                create_addr(&caller, nonce)
            }
        };
        let site = CallSite {
            caller: self.cur_call.code_addr.clone(),
            pc: self.cur_call.pc,
            callee: contract_addr.clone(),
        };
        let args = CallType::Create(CreateArgs {
            contract_addr: contract_addr.clone(),
            site,
        });
        self.create_(contract_addr, caller, code, value.into(), gas_quota, args)
    }

    /// Store the returned runtime code, charging the deposit from the creation's own gas.
    fn deposit_code(
        &mut self, contract_addr: &Addr, data: &Bytes, unused_gas: &mut Gas,
    ) -> Result<(), ExecError> {
        let fork = self.env.block.fork;
        if fork >= Fork::SpuriousDragon && data.len() > MAX_CODE_SIZE {
            // EIP158
            return Err(ExecError::MaxCodeSizeExceeded)
        }
        if fork >= Fork::London && data.first() == Some(&0xef) {
            // EIP3541
            return Err(ExecError::InvalidCode)
        }
        if self.metered {
            let cost = gas_checked_mul(data.len() as u64, GAS_CREATE_DATA)?;
            if *unused_gas < cost {
                return Err(ExecError::CodeStoreOutOfGas)
            }
            *unused_gas -= cost;
        }
        self.state.set_code(
            contract_addr,
            Arc::new(PlainCode::new(data.to_vec().into())),
        );
        Ok(())
    }

    fn create_end(
        &mut self, args: CreateArgs, rev: usize, data: Bytes,
        mut unused_gas: Gas, ret: Result<(), ExecError>,
        mut trace: Option<FailureTrace>,
    ) -> Result<(), ExecError> {
        let ret = match ret {
            Ok(()) => {
                let r = self.deposit_code(&args.contract_addr, &data, &mut unused_gas);
                if r.is_err() {
                    trace = Some(FailureTrace::leaf(
                        &args.contract_addr,
                        &[],
                        self.call_depth(),
                    ));
                }
                r
            }
            err => err,
        };
        self.close_revision(rev, ret.is_ok());
        let used = self.reserved_gas_used(unused_gas);
        self.meter.on_call_end(&args.site, used);
        let call = &mut self.cur_call;
        match ret {
            Ok(()) | Err(ExecError::Reverted) => call.return_gas(unused_gas),
            _ => (),
        }
        call.stack.push(match ret {
            Err(_) => U256::zero(),
            Ok(_) => args.contract_addr.clone().into(),
        })?;
        call.last_returned = if let Err(ExecError::Reverted) = ret {
            data
        } else {
            Bytes::empty()
        };
        call.child_failure = trace;
        Ok(())
    }

    #[inline(always)]
    fn gas_call_common(&mut self, call_cost: &U256) -> Result<Gas, ExecError> {
        let call = &mut self.cur_call;
        if call.fork >= Fork::TangerineWhistle {
            // EIP150
            let gas = call.unused_gas - call.unused_gas / 64;
            match checked_as_u64(call_cost) {
                Some(cost) if cost <= gas => return Ok(cost),
                _ => return Ok(gas),
            }
        }
        checked_as_u64(call_cost).ok_or(ExecError::GasIntOverflow)
    }

    #[inline(always)]
    fn call_begin(&mut self, kind: CallKind) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        match kind {
            CallKind::DelegateCall if call.fork < Fork::Homestead => {
                return Err(ExecError::InvalidOpcode)
            }
            CallKind::StaticCall if call.fork < Fork::Byzantium => {
                return Err(ExecError::InvalidOpcode)
            }
            _ => (),
        }
        if call.fork < Fork::Berlin {
            call.use_gas(if call.fork >= Fork::TangerineWhistle {
                GAS_CALL_TANGERINE
            } else {
                GAS_CALL_FRONTIER
            })?;
        }
        let (gas, addr) = call.stack.consume2()?;
        let val = match kind {
            CallKind::Call | CallKind::CallCode => call.stack.consume1()?,
            _ => U256::zero(),
        };
        let (in_off, in_len) = call.stack.consume2()?;
        let (ret_off, ret_len) = call.stack.consume2()?;
        if kind == CallKind::Call && call.read_only && !val.is_zero() {
            return Err(ExecError::WriteProtection)
        }
        let (input, in_gas) = call.memory.get_slice(in_off, in_len)?;
        let input: Box<[u8]> = input.to_vec().into();
        let (_, ret_gas) = call.memory.get_slice(ret_off, ret_len)?;
        let fork = call.fork;
        let addr: Addr = addr.into();

        if fork >= Fork::Berlin {
            self.account_access_gas(&addr, 0)?;
        }
        if !val.is_zero() {
            if kind == CallKind::Call &&
                read!(self.fatal, self.state.is_empty(&addr))
            {
                self.cur_call.use_gas(GAS_CALL_NEW_ACCOUNT)?;
            }
            self.cur_call.use_gas(GAS_CALL_VALUE_TRANS)?;
        }
        self.cur_call.use_gas(in_gas + ret_gas)?;
        let mut gas_quota = self.gas_call_common(&gas)?;
        self.cur_call.use_gas(gas_quota)?;
        if !val.is_zero() {
            gas_quota += GAS_CALL_STIPEND
        }

        let cur = &self.cur_call;
        let (callee, caller, value, transfer, read_only) = match kind {
            CallKind::Call => {
                (addr.clone(), cur.callee.clone(), val.into(), true, false)
            }
            CallKind::CallCode => {
                (cur.callee.clone(), cur.callee.clone(), val.into(), true, false)
            }
            CallKind::DelegateCall => (
                cur.callee.clone(),
                cur.caller.clone(),
                cur.value.clone(),
                false,
                false,
            ),
            CallKind::StaticCall => (
                addr.clone(),
                cur.callee.clone(),
                Wei::zero().clone(),
                false,
                true,
            ),
        };
        let args = CallType::Call(CallArgs {
            ret_off,
            ret_len,
            site: CallSite {
                caller: cur.code_addr.clone(),
                pc: cur.pc,
                callee: addr.clone(),
            },
        });
        self.call_(
            callee, caller, addr, input, gas_quota, value, transfer, args,
            read_only,
        )
    }

    /// Run `code_addr`'s code (or precompile) in the context of `callee`.
    fn call_(
        &mut self, callee: Addr, caller: Addr, code_addr: Addr,
        input: Box<[u8]>, gas: Gas, value: Wei, transfer: bool,
        args: CallType, read_only: bool,
    ) -> Result<(), ExecError> {
        self.reserved = gas;
        if self.call_depth() > MAX_CALL_DEPTH {
            return self.abort_call(args, gas, ExecError::Depth, &code_addr)
        }
        if transfer &&
            !value.is_zero() &&
            read!(self.fatal, self.state.balance(&caller)) < value
        {
            return self.abort_call(
                args,
                gas,
                ExecError::InsufficientBalance,
                &code_addr,
            )
        }
        let rev = self.state.checkpoint();
        if transfer {
            // balance checked above
            read!(self.fatal, self.state.transfer(&caller, &callee, &value));
        }

        let env = self.env;
        match env.hooks.precompile(&code_addr) {
            Some(contract) => {
                let cost = contract.required_gas(&input);
                let depth = self.call_depth();
                if self.metered && cost > gas {
                    let trace = FailureTrace::leaf(&code_addr, &input, depth);
                    return self.end_frame(
                        args,
                        rev,
                        Bytes::empty(),
                        0,
                        Err(ExecError::OutOfGas),
                        Some(trace),
                    )
                }
                let unused = if self.metered { gas - cost } else { gas };
                let (out, ret) = contract.run(&input);
                let trace = ret
                    .is_err()
                    .then(|| FailureTrace::leaf(&code_addr, &input, depth));
                self.end_frame(args, rev, out, unused, ret, trace)
            }
            None => {
                let code = read!(self.fatal, self.state.code(&code_addr));
                if code.as_bytes().is_empty() {
                    return self.end_frame(
                        args,
                        rev,
                        Bytes::empty(),
                        gas,
                        Ok(()),
                        None,
                    )
                }
                self.call_push(
                    code, code_addr, input, value, callee, caller, args, gas,
                    read_only, rev,
                );
                Ok(())
            }
        }
    }

    /// The call could not even start (depth limit, insufficient funds): the reserved gas goes
    /// back to the caller.
    fn abort_call(
        &mut self, args: CallType, gas: Gas, err: ExecError, target: &Addr,
    ) -> Result<(), ExecError> {
        debug!("call to {} aborted: {:?}", target, err);
        let rev = self.state.checkpoint();
        let trace = match args {
            CallType::Tx(_) => Some(FailureTrace::leaf(target, &[], 0)),
            _ => None,
        };
        self.end_frame(args, rev, Bytes::empty(), gas, Err(err), trace)
    }

    fn call_end(
        &mut self, args: CallArgs, rev: usize, data: Bytes, unused_gas: Gas,
        ret: Result<(), ExecError>, trace: Option<FailureTrace>,
    ) -> Result<(), ExecError> {
        self.close_revision(rev, ret.is_ok());
        if let Err(err) = ret {
            debug!("Last Error: {:?}", err);
        }
        let used = self.reserved_gas_used(unused_gas);
        self.meter.on_call_end(&args.site, used);
        let call = &mut self.cur_call;
        match ret {
            Ok(()) | Err(ExecError::Reverted) => {
                // the return area was paid for when the call started
                call.memory.set(args.ret_off, args.ret_len, &data)?;
                call.return_gas(unused_gas);
            }
            Err(ExecError::Depth) | Err(ExecError::InsufficientBalance) => {
                call.return_gas(unused_gas)
            }
            _ => (),
        }
        call.stack.push(if ret.is_ok() {
            U256::one()
        } else {
            U256::zero()
        })?;
        call.last_returned = data;
        call.child_failure = trace;
        Ok(())
    }

    fn tx_end(
        &mut self, args: TxArgs, rev: usize, data: Bytes, mut unused_gas: Gas,
        ret: Result<(), ExecError>, mut trace: Option<FailureTrace>,
    ) {
        let (ret, contract) = match args.aux {
            TxAux::Contract(addr) => {
                let ret = match ret {
                    Ok(()) => {
                        let r = self.deposit_code(&addr, &data, &mut unused_gas);
                        if r.is_err() {
                            trace = Some(FailureTrace::leaf(&addr, &[], 0));
                        }
                        r
                    }
                    err => err,
                };
                (ret, Some(addr))
            }
            TxAux::Sender => (ret, None),
        };
        self.close_revision(rev, ret.is_ok());
        if let TxExecStatus::Finished(_) = self.status {
            warn!("transaction finished twice");
            return
        }
        self.status = TxExecStatus::Finished(match ret {
            Ok(()) => TxExecResult::Succeeded {
                data,
                unused_gas,
                contract,
            },
            Err(err) => TxExecResult::Failed {
                data,
                unused_gas: match err {
                    ExecError::Reverted => unused_gas,
                    _ => 0,
                },
                err,
                trace: trace.unwrap_or_default(),
            },
        })
    }

    /// Deliver the outcome of a frame (or of a call that ran no bytecode) to whoever started it.
    fn end_frame(
        &mut self, call_type: CallType, rev: usize, data: Bytes,
        unused_gas: Gas, ret: Result<(), ExecError>,
        trace: Option<FailureTrace>,
    ) -> Result<(), ExecError> {
        match call_type {
            CallType::Tx(args) => {
                self.tx_end(args, rev, data, unused_gas, ret, trace);
                Ok(())
            }
            CallType::Call(args) => {
                self.call_end(args, rev, data, unused_gas, ret, trace)
            }
            CallType::Create(args) => {
                self.create_end(args, rev, data, unused_gas, ret, trace)
            }
        }
    }

    #[inline(always)]
    fn return_(&mut self, revert: bool) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        if revert && call.fork < Fork::Byzantium {
            return Err(ExecError::InvalidOpcode)
        }
        let (off, len) = call.stack.consume2()?;
        let (retval, mem_gas) = call.memory.get_slice(off, len)?;
        let retval = retval.to_vec().into();
        call.use_gas(mem_gas)?;
        self.finish_call(
            retval,
            if revert {
                Err(ExecError::Reverted)
            } else {
                Ok(())
            },
        )
    }

    #[inline(always)]
    fn self_destruct(&mut self) -> Result<(), ExecError> {
        let call = &mut self.cur_call;
        if call.read_only {
            return Err(ExecError::WriteProtection)
        }
        let fork = call.fork;
        let beneficiary: Addr = call.stack.consume1()?.into();
        let me = call.callee.clone();
        let depth = self.state.depth();
        if fork >= Fork::Berlin && self.access_list.add_addr(&beneficiary, depth) {
            self.cur_call.use_gas(GAS_COLD_ACCOUNT_ACCESS_COST_BERLIN)?;
        }
        let balance = read!(self.fatal, self.state.balance(&me));
        if fork >= Fork::TangerineWhistle {
            // EIP150
            self.cur_call.use_gas(GAS_SELF_DESTRUCT)?;
            // EIP158
            if !balance.is_zero() &&
                read!(self.fatal, self.state.is_empty(&beneficiary))
            {
                self.cur_call.use_gas(GAS_CREATE_BY_SELF_DESTRUCT)?;
            }
            if fork < Fork::London {
                self.add_refund(GAS_SELF_DESTRUCT_REFUND);
            }
        }
        if fork >= Fork::Cancun && !self.created.contains(&me) {
            // EIP-6780: only the funds move
            read!(self.fatal, self.state.transfer(&me, &beneficiary, &balance));
        } else {
            read!(self.fatal, self.state.add_balance(&beneficiary, &balance));
            self.state.set_balance(&me, Wei::zero().clone());
            self.state.mark_destroyed(&me);
        }
        self.finish_call(Bytes::empty(), Ok(()))
    }

    // end of instruction impl

    #[inline(always)]
    fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    fn reserved_gas_used(&self, unused_gas: Gas) -> Gas {
        self.reserved.saturating_sub(unused_gas)
    }

    #[inline(always)]
    fn call_push(
        &mut self, code: Arc<dyn Code>, code_addr: Addr, input: Box<[u8]>,
        value: Wei, callee: Addr, caller: Addr, call_type: CallType,
        gas: Gas, read_only: bool, rev: usize,
    ) {
        let mut old_call = Box::new(CallFrame::new(
            code,
            code_addr,
            input,
            value,
            callee,
            caller,
            call_type,
            gas,
            // all child calls become read-only if the parent is read-only
            self.cur_call.read_only || read_only,
            self.env.block.fork,
            self.metered,
            self.call_stack.len(),
            rev,
        ));
        std::mem::swap(&mut self.cur_call, &mut old_call);
        self.call_stack.push(old_call);
    }

    #[inline(always)]
    fn call_pop(&mut self) -> Option<Box<CallFrame>> {
        let mut frame = self.call_stack.pop()?;
        std::mem::swap(&mut self.cur_call, &mut frame);
        Some(frame)
    }

    fn finish_call(
        &mut self, data: Bytes, ret: Result<(), ExecError>,
    ) -> Result<(), ExecError> {
        let mut frame = match self.call_pop() {
            Some(f) => f,
            None => {
                warn!("finish_call without an active frame");
                return Ok(())
            }
        };
        let trace = match ret {
            Ok(()) => None,
            Err(_) => {
                let inner = frame.child_failure.take();
                Some(FailureTrace::wrap(&frame, inner))
            }
        };
        self.reserved = frame.gas_limit;
        let frame = *frame;
        self.end_frame(
            frame.call_type,
            frame.rev,
            data,
            frame.unused_gas,
            ret,
            trace,
        )
    }

    fn step(&mut self, inst: &Inst<'_>) -> Result<(), ExecError> {
        use Opcode::*;
        let call = &mut self.cur_call;
        let op = match inst {
            Inst::Push(data, width) => return call.push(data, *width),
            Inst::Dup(pos) => return call.dup(*pos),
            Inst::Swap(pos) => return call.swap(*pos),
            Inst::Op(op) => *op,
        };
        let env = self.env;
        let block = &env.block;
        match op {
            Stop => self.finish_call(Bytes::empty(), Ok(())),
            Add => call.add(),
            Mul => call.mul(),
            Sub => call.sub(),
            Div => call.div(),
            SDiv => call.sdiv(),
            Mod => call.rem(),
            SMod => call.smod(),
            AddMod => call.add_mod(),
            MulMod => call.mul_mod(),
            Exp => call.exp(),
            SignExtend => call.sign_extend(),
            Lt => call.lt(),
            Gt => call.gt(),
            Slt => call.slt(),
            Sgt => call.sgt(),
            Eql => call.eq(),
            IsZero => call.is_zero(),
            And => call.and(),
            Or => call.or(),
            Xor => call.xor(),
            Not => call.not(),
            Byte => call.byte(),
            Shl => call.shl(),
            Shr => call.shr(),
            Sar => call.sar(),
            Sha3 => call.sha3(),
            Addr => call.addr(),
            Balance => self.balance(),
            Origin => self.origin(),
            Caller => call.caller(),
            CallValue => call.call_value(),
            CallDataLoad => call.call_data_load(),
            CallDataSize => call.call_data_size(),
            CallDataCopy => call.call_data_copy(),
            CodeSize => call.code_size(),
            CodeCopy => call.code_copy(),
            GasPrice => {
                let p = self.gas_price.clone().into();
                self.push_env_word(p, Fork::Frontier)
            }
            ExtCodeSize => self.ext_code_size(),
            ExtCodeCopy => self.ext_code_copy(),
            ReturnDataSize => call.return_data_size(),
            ReturnDataCopy => call.return_data_copy(),
            ExtCodeHash => self.ext_code_hash(),
            BlockHash => self.block_hash(),
            Coinbase => {
                self.push_env_word(block.coinbase.clone().into(), Fork::Frontier)
            }
            Timestamp => self.push_env_word(block.timestamp, Fork::Frontier),
            Number => self.push_env_word(block.number, Fork::Frontier),
            Difficulty => self.push_env_word(block.difficulty, Fork::Frontier),
            GasLimit => {
                self.push_env_word(block.gas_limit.into(), Fork::Frontier)
            }
            ChainId => self.push_env_word(env.chain_id, Fork::Istanbul),
            SelfBalance => self.self_balance(),
            BaseFee => self.push_env_word(block.base_fee, Fork::London),
            BlobHash => self.blob_hash(),
            BlobBaseFee => self.push_env_word(block.blob_base_fee, Fork::Cancun),
            Pop => call.pop(),
            MLoad => call.mload(),
            MStore => call.mstore(),
            MStore8 => call.mstore8(),
            SLoad => self.sload(),
            SStore => self.sstore(),
            Jump => self.jump(),
            JumpI => self.jumpi(),
            PC => call.pc(),
            MSize => call.msize(),
            Gas => call.gas(),
            JumpDest => call.use_gas(GAS_JUMPDEST),
            TLoad => self.tload(),
            TStore => self.tstore(),
            MCopy => call.mcopy(),
            Push0 => call.push0(),
            Log0 => self.log(0),
            Log1 => self.log(1),
            Log2 => self.log(2),
            Log3 => self.log(3),
            Log4 => self.log(4),
            Create => self.create_begin(false),
            Create2 => self.create_begin(true),
            Call => self.call_begin(CallKind::Call),
            CallCode => self.call_begin(CallKind::CallCode),
            DelegateCall => self.call_begin(CallKind::DelegateCall),
            StaticCall => self.call_begin(CallKind::StaticCall),
            Return => self.return_(false),
            Revert => self.return_(true),
            SelfDestruct => self.self_destruct(),
            _ => Err(ExecError::InvalidOpcode),
        }
    }

    fn exec(&mut self) -> std::result::Result<TxExecResult, StateError> {
        let env = self.env;
        loop {
            if let TxExecStatus::Finished(_) = self.status {
                break
            }
            if self.call_stack.is_empty() {
                warn!("no frame left to run");
                self.status = TxExecStatus::Finished(TxExecResult::Failed {
                    data: Bytes::empty(),
                    unused_gas: 0,
                    err: ExecError::InvalidCode,
                    trace: FailureTrace::default(),
                });
                break
            }
            let code = self.cur_call.code.clone();
            let pc = self.cur_call.pc;
            let (raw, inst) = Inst::decode(code.as_bytes(), pc as usize);
            self.cur_call.record_pc();
            let depth_before = self.call_stack.len();
            let gas_before = self.cur_call.unused_gas;
            self.jumped = false;

            let handled = match env.hooks.opcode(raw) {
                Some(hook) => hook(&mut HookFrame::new(&mut self.cur_call, raw))
                    .map(|o| o == HookOutcome::Handled),
                None => Ok(false),
            };
            let mut succ = match handled {
                Ok(true) => Ok(()),
                Ok(false) => self.step(&inst),
                Err(e) => Err(e),
            };
            while let Err(err) = succ {
                if err == ExecError::StateUnavailable {
                    if let Some(e) = self.fatal.take() {
                        return Err(e)
                    }
                }
                succ = self.finish_call(Bytes::empty(), Err(err));
            }

            let depth_after = self.call_stack.len();
            if depth_after == depth_before {
                if !self.jumped {
                    self.cur_call.pc += 1 + inst.skip();
                }
                let cost = gas_before.saturating_sub(self.cur_call.unused_gas);
                self.meter
                    .on_instruction(&self.cur_call.code_addr, pc, raw, cost);
            } else if depth_after < depth_before {
                // back in the caller, which is still sitting on its CALL/CREATE
                self.cur_call.pc += 1;
            }
        }
        match std::mem::replace(&mut self.status, TxExecStatus::Running) {
            TxExecStatus::Finished(res) => Ok(res),
            TxExecStatus::Running => unreachable!(),
        }
    }
}

/// A message to execute at the top level.
#[derive(Clone, Debug)]
pub struct Message {
    pub from: Addr,
    /// `None` deploys `data` as init code.
    pub to: Option<Addr>,
    pub value: Wei,
    pub gas: Gas,
    pub data: Bytes,
    /// Run as a static call without bumping the sender's nonce.
    pub is_static: bool,
    /// Deploy to this address instead of the one derived from the sender's nonce.
    pub create_at: Option<Addr>,
}

/// Successful outcome of [Engine::execute].
#[derive(Clone, Debug)]
pub struct Executed {
    pub output: Bytes,
    pub gas_used: Gas,
    pub contract: Option<Addr>,
    pub logs: Vec<LogEntry>,
}

#[derive(Clone, Debug)]
pub struct CallOutput {
    pub output: Bytes,
    pub gas_used: Gas,
    pub logs: Vec<LogEntry>,
}

#[derive(Clone, Debug)]
pub struct Deployed {
    pub address: Addr,
    /// The runtime code returned by the constructor.
    pub output: Bytes,
    pub gas_used: Gas,
    pub logs: Vec<LogEntry>,
}

pub fn intrinsic_gas(data: &[u8], create: bool, fork: Fork) -> Gas {
    let zeros = data.iter().filter(|b| **b == 0).count() as u64;
    let nonzeros = data.len() as u64 - zeros;
    let mut gas = GAS_TX +
        zeros * GAS_TX_DATA_ZERO +
        nonzeros *
            if fork >= Fork::Istanbul {
                GAS_TX_DATA_NONZERO
            } else {
                GAS_TX_DATA_NONZERO_FRONTIER
            };
    if create {
        if fork >= Fork::Homestead {
            gas += GAS_TX_CREATE;
        }
        if fork >= Fork::Shanghai {
            gas += Memory::to_word_size(data.len() as u64) * GAS_INITCODE_WORD;
        }
    }
    gas
}

/// A synchronous EVM bound to one account state.
pub struct Engine {
    pub env: ExecEnv,
    state: MemState,
    meter: Box<dyn GasMeter>,
}

impl Engine {
    pub fn new(env: ExecEnv, backend: Arc<dyn StateBackend>) -> Self {
        Self {
            env,
            state: MemState::new(backend),
            meter: Box::new(StandardGasMeter),
        }
    }

    pub fn state(&self) -> &MemState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut MemState {
        &mut self.state
    }

    pub fn gas_meter(&self) -> &dyn GasMeter {
        &*self.meter
    }

    /// Install another gas meter, returning the previous one.
    pub fn set_gas_meter(
        &mut self, meter: Box<dyn GasMeter>,
    ) -> Box<dyn GasMeter> {
        debug!("gas meter: {} -> {}", self.meter.name(), meter.name());
        std::mem::replace(&mut self.meter, meter)
    }

    pub fn hooks(&self) -> &HookTable {
        &self.env.hooks
    }

    pub fn set_hooks(&mut self, hooks: HookTable) {
        self.env.hooks = Arc::new(hooks);
    }

    pub fn deploy(
        &mut self, sender: &Addr, bytecode: &[u8], ctor_args: &[u8],
        value: Wei, gas: Gas,
    ) -> crate::error::Result<Deployed> {
        let mut data = bytecode.to_vec();
        data.extend_from_slice(ctor_args);
        let r = self.execute(Message {
            from: sender.clone(),
            to: None,
            value,
            gas,
            data: data.into(),
            is_static: false,
            create_at: None,
        })?;
        Ok(Deployed {
            address: r.contract.unwrap_or_default(),
            output: r.output,
            gas_used: r.gas_used,
            logs: r.logs,
        })
    }

    pub fn call(
        &mut self, sender: &Addr, to: &Addr, calldata: &[u8], value: Wei,
        gas: Gas, is_static: bool,
    ) -> crate::error::Result<CallOutput> {
        let r = self.execute(Message {
            from: sender.clone(),
            to: Some(to.clone()),
            value,
            gas,
            data: calldata.into(),
            is_static,
            create_at: None,
        })?;
        Ok(CallOutput {
            output: r.output,
            gas_used: r.gas_used,
            logs: r.logs,
        })
    }

    /// Execute a top-level message. The sender's nonce is bumped before the execution starts, so
    /// it stays bumped when the execution fails. Any other error, such as a backing store failure
    /// or an overflowing nonce, aborts the execution without leaving any trace in the state.
    pub fn execute(&mut self, msg: Message) -> crate::error::Result<Executed> {
        if msg.is_static && (msg.to.is_none() || !msg.value.is_zero()) {
            return Err(Error::InvalidInput(
                "a static call needs a target and no value".into(),
            ))
        }
        let rev = self.state.checkpoint();
        let res = self.execute_(&msg, rev);
        if res.is_err() {
            // failed executions are already finalized, leaving nothing above `rev`
            self.state.rollback(rev);
        }
        res
    }

    fn failure(
        msg: &Message, kind: ExecError, gas_used: Gas,
    ) -> ExecutionFailure {
        ExecutionFailure {
            kind,
            revert_data: Bytes::empty(),
            call_stack: vec![CallStackEntry {
                address: msg.to.clone().unwrap_or_default(),
                calldata: msg.data.clone(),
                depth: 0,
            }],
            pc_trail: Vec::new(),
            gas_used,
        }
    }

    fn execute_(&mut self, msg: &Message, tx_rev: usize) -> crate::error::Result<Executed> {
        let fork = self.env.block.fork;
        let metered = self.meter.enforces();
        let create = msg.to.is_none();
        let intrinsic = intrinsic_gas(&msg.data, create, fork);
        if metered && msg.gas < intrinsic {
            self.state.finalize_tx();
            return Err(Error::from_exec(Self::failure(
                msg,
                ExecError::OutOfGas,
                msg.gas,
            )))
        }
        if create && fork >= Fork::Shanghai && msg.data.len() > MAX_INITCODE_SIZE
        {
            self.state.finalize_tx();
            return Err(Error::from_exec(Self::failure(
                msg,
                ExecError::MaxInitCodeSizeExceeded,
                msg.gas,
            )))
        }
        let gas = if metered { msg.gas - intrinsic } else { msg.gas };

        let nonce = self.state.nonce(&msg.from)?;
        if !msg.is_static {
            let next = nonce.checked_add(1).ok_or_else(|| {
                Error::InvalidInput(format!("nonce overflow for {}", msg.from))
            })?;
            self.state.set_nonce(&msg.from, next);
        }

        let depth = self.state.depth();
        let mut access_list = AccessList::default();
        access_list.add_addr(&msg.from, depth);
        if let Some(to) = &msg.to {
            access_list.add_addr(to, depth);
        }
        for addr in self.env.hooks.precompile_addrs() {
            access_list.add_addr(addr, depth);
        }
        if fork >= Fork::Shanghai {
            // EIP-3651
            access_list.add_addr(&self.env.block.coinbase, depth);
        }

        let dummy = Box::new(CallFrame::new(
            crate::state::empty_code(),
            Addr::zero().clone(),
            Vec::new().into(),
            Wei::zero().clone(),
            Addr::zero().clone(),
            Addr::zero().clone(),
            CallType::Tx(TxArgs { aux: TxAux::Sender }),
            gas,
            msg.is_static,
            fork,
            metered,
            0,
            tx_rev,
        ));
        let mut ctx = TxExecContext {
            call_stack: Vec::new(),
            cur_call: dummy,
            state: &mut self.state,
            env: &self.env,
            meter: &mut *self.meter,
            access_list,
            created: HashSet::new(),
            tx_rev,
            fatal: None,
            jumped: false,
            status: TxExecStatus::Running,
            metered,
            reserved: 0,
            origin: msg.from.clone(),
            gas_price: Wei::zero().clone(),
        };
        let input: Box<[u8]> = msg.data.to_vec().into();
        let started = match &msg.to {
            Some(to) => ctx.call_(
                to.clone(),
                msg.from.clone(),
                to.clone(),
                input,
                gas,
                msg.value.clone(),
                true,
                CallType::Tx(TxArgs { aux: TxAux::Sender }),
                msg.is_static,
            ),
            None => {
                let contract_addr = msg
                    .create_at
                    .clone()
                    .unwrap_or_else(|| create_addr(&msg.from, nonce));
                ctx.create_(
                    contract_addr.clone(),
                    msg.from.clone(),
                    input,
                    msg.value.clone(),
                    gas,
                    CallType::Tx(TxArgs {
                        aux: TxAux::Contract(contract_addr),
                    }),
                )
            }
        };
        if let Err(ExecError::StateUnavailable) = started {
            if let Some(e) = ctx.fatal.take() {
                return Err(e.into())
            }
        }
        // a top-level frame that ended before running any code reports through the status
        let res = ctx.exec()?;
        drop(ctx);

        let effects = self.state.finalize_tx();
        for addr in effects.destroyed.iter() {
            self.state.delete_account(addr);
        }
        let refund_quotient = if fork >= Fork::London {
            REFUND_QUOTIENT_LONDON
        } else {
            REFUND_QUOTIENT_FRONTIER
        };
        let gas_used = |unused: Gas| -> Gas {
            if !metered {
                return 0
            }
            let used = msg.gas - unused;
            let refund = (effects.refund.max(0) as Gas).min(used / refund_quotient);
            used - refund
        };
        match res {
            TxExecResult::Succeeded {
                data,
                unused_gas,
                contract,
            } => Ok(Executed {
                output: data,
                gas_used: gas_used(unused_gas),
                contract,
                logs: effects.logs,
            }),
            TxExecResult::Failed {
                data,
                unused_gas,
                err,
                trace,
            } => Err(Error::from_exec(ExecutionFailure {
                kind: err,
                revert_data: match err {
                    ExecError::Reverted => data,
                    _ => Bytes::empty(),
                },
                call_stack: trace.call_stack,
                pc_trail: trace.pc_trail,
                gas_used: if metered { msg.gas - unused_gas } else { 0 },
            })),
        }
    }
}
