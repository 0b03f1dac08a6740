//! Helpers for testing qenv: an EVM assembler and disassembler, canned contracts, ABI words and
//! [mock::MockChain], a JSON-RPC node living in memory.
use std::collections::HashMap;

use num_traits::FromPrimitive;
use qenv::common::U256;
use qenv::core::opcode::Opcode;

pub mod contracts;
pub mod mock;

/// Upper-case mnemonic of `opcode`, as found in the yellow paper.
pub fn opcode_to_str(opcode: u8) -> Option<&'static str> {
    use Opcode::*;
    const PUSH: [&str; 33] = [
        "PUSH0", "PUSH1", "PUSH2", "PUSH3", "PUSH4", "PUSH5", "PUSH6", "PUSH7",
        "PUSH8", "PUSH9", "PUSH10", "PUSH11", "PUSH12", "PUSH13", "PUSH14",
        "PUSH15", "PUSH16", "PUSH17", "PUSH18", "PUSH19", "PUSH20", "PUSH21",
        "PUSH22", "PUSH23", "PUSH24", "PUSH25", "PUSH26", "PUSH27", "PUSH28",
        "PUSH29", "PUSH30", "PUSH31", "PUSH32",
    ];
    const DUP: [&str; 16] = [
        "DUP1", "DUP2", "DUP3", "DUP4", "DUP5", "DUP6", "DUP7", "DUP8", "DUP9",
        "DUP10", "DUP11", "DUP12", "DUP13", "DUP14", "DUP15", "DUP16",
    ];
    const SWAP: [&str; 16] = [
        "SWAP1", "SWAP2", "SWAP3", "SWAP4", "SWAP5", "SWAP6", "SWAP7", "SWAP8",
        "SWAP9", "SWAP10", "SWAP11", "SWAP12", "SWAP13", "SWAP14", "SWAP15",
        "SWAP16",
    ];
    const LOG: [&str; 5] = ["LOG0", "LOG1", "LOG2", "LOG3", "LOG4"];
    let op: Opcode = FromPrimitive::from_u8(opcode)?;
    Some(match opcode {
        0x5f..=0x7f => PUSH[(opcode - 0x5f) as usize],
        0x80..=0x8f => DUP[(opcode - 0x80) as usize],
        0x90..=0x9f => SWAP[(opcode - 0x90) as usize],
        0xa0..=0xa4 => LOG[(opcode - 0xa0) as usize],
        _ => match op {
            Stop => "STOP",
            Add => "ADD",
            Mul => "MUL",
            Sub => "SUB",
            Div => "DIV",
            SDiv => "SDIV",
            Mod => "MOD",
            SMod => "SMOD",
            AddMod => "ADDMOD",
            MulMod => "MULMOD",
            Exp => "EXP",
            SignExtend => "SIGNEXTEND",
            Lt => "LT",
            Gt => "GT",
            Slt => "SLT",
            Sgt => "SGT",
            Eql => "EQ",
            IsZero => "ISZERO",
            And => "AND",
            Or => "OR",
            Xor => "XOR",
            Not => "NOT",
            Byte => "BYTE",
            Shl => "SHL",
            Shr => "SHR",
            Sar => "SAR",
            Sha3 => "KECCAK256",
            Addr => "ADDRESS",
            Balance => "BALANCE",
            Origin => "ORIGIN",
            Caller => "CALLER",
            CallValue => "CALLVALUE",
            CallDataLoad => "CALLDATALOAD",
            CallDataSize => "CALLDATASIZE",
            CallDataCopy => "CALLDATACOPY",
            CodeSize => "CODESIZE",
            CodeCopy => "CODECOPY",
            GasPrice => "GASPRICE",
            ExtCodeSize => "EXTCODESIZE",
            ExtCodeCopy => "EXTCODECOPY",
            ReturnDataSize => "RETURNDATASIZE",
            ReturnDataCopy => "RETURNDATACOPY",
            ExtCodeHash => "EXTCODEHASH",
            BlockHash => "BLOCKHASH",
            Coinbase => "COINBASE",
            Timestamp => "TIMESTAMP",
            Number => "NUMBER",
            Difficulty => "PREVRANDAO",
            GasLimit => "GASLIMIT",
            ChainId => "CHAINID",
            SelfBalance => "SELFBALANCE",
            BaseFee => "BASEFEE",
            BlobHash => "BLOBHASH",
            BlobBaseFee => "BLOBBASEFEE",
            Pop => "POP",
            MLoad => "MLOAD",
            MStore => "MSTORE",
            MStore8 => "MSTORE8",
            SLoad => "SLOAD",
            SStore => "SSTORE",
            Jump => "JUMP",
            JumpI => "JUMPI",
            PC => "PC",
            MSize => "MSIZE",
            Gas => "GAS",
            JumpDest => "JUMPDEST",
            TLoad => "TLOAD",
            TStore => "TSTORE",
            MCopy => "MCOPY",
            Create => "CREATE",
            Call => "CALL",
            CallCode => "CALLCODE",
            Return => "RETURN",
            DelegateCall => "DELEGATECALL",
            Create2 => "CREATE2",
            StaticCall => "STATICCALL",
            Revert => "REVERT",
            Invalid => "INVALID",
            SelfDestruct => "SELFDESTRUCT",
            _ => return None,
        },
    })
}

/// Opcode byte of a mnemonic (case-insensitive). `SHA3` is accepted for `KECCAK256`.
pub fn str_to_opcode(mnemonic: &str) -> Option<u8> {
    let m = mnemonic.to_ascii_uppercase();
    let m = if m == "SHA3" { "KECCAK256".to_string() } else { m };
    (0..=255u8).find(|b| opcode_to_str(*b) == Some(m.as_str()))
}

/// One instruction per line (`pc MNEMONIC 0ximmediate`) or everything on one line.
pub fn disasm(code: &[u8], line_breaks: bool) -> String {
    let mut out = Vec::new();
    let mut pc = 0;
    while pc < code.len() {
        let op = code[pc];
        let n = Opcode::immediate_len(op);
        let mut ins = match opcode_to_str(op) {
            Some(s) => s.to_string(),
            None => format!("0x{:02x}?", op),
        };
        if n > 0 {
            let end = (pc + 1 + n).min(code.len());
            ins.push_str(&format!(" 0x{}", hex::encode(&code[pc + 1..end])));
        }
        out.push(if line_breaks {
            format!("{:04x} {}", pc, ins)
        } else {
            ins
        });
        pc += 1 + n;
    }
    out.join(if line_breaks { "\n" } else { " " })
}

#[derive(Clone, Debug)]
enum Piece {
    Bytes(Vec<u8>),
    /// PUSH2 of a label's offset.
    LabelRef(String),
}

/// Bytecode builder with symbolic jump targets.
///
/// ```
/// use qenv::core::opcode::Opcode;
/// use qenv_tools::Asm;
///
/// let code = Asm::new()
///     .label("top")
///     .push_label("top")
///     .op(Opcode::Jump)
///     .assemble()
///     .unwrap();
/// assert_eq!(code, vec![0x5b, 0x61, 0x00, 0x00, 0x56]);
/// ```
#[derive(Clone, Debug, Default)]
pub struct Asm {
    pieces: Vec<Piece>,
    labels: HashMap<String, usize>,
    len: usize,
    dup_label: Option<String>,
}

impl Asm {
    pub fn new() -> Self {
        Self::default()
    }

    fn bytes(mut self, b: Vec<u8>) -> Self {
        self.len += b.len();
        self.pieces.push(Piece::Bytes(b));
        self
    }

    pub fn op(self, op: Opcode) -> Self {
        self.bytes(vec![op as u8])
    }

    /// Append raw bytes (data, or code assembled elsewhere).
    pub fn raw(self, bytes: &[u8]) -> Self {
        self.bytes(bytes.to_vec())
    }

    /// Push `v` with the narrowest PUSH (PUSH0 for zero).
    pub fn push<V: Into<U256>>(self, v: V) -> Self {
        let v: U256 = v.into();
        let width = (v.bits() + 7) / 8;
        let mut word = [0u8; 32];
        v.to_big_endian(&mut word);
        let mut b = vec![0x5f + width as u8];
        b.extend_from_slice(&word[32 - width..]);
        self.bytes(b)
    }

    /// Push exactly `n` bytes taken from the low end of `v`.
    pub fn push_n<V: Into<U256>>(self, n: usize, v: V) -> Self {
        let v: U256 = v.into();
        let mut word = [0u8; 32];
        v.to_big_endian(&mut word);
        let mut b = vec![0x5f + n as u8];
        b.extend_from_slice(&word[32 - n..]);
        self.bytes(b)
    }

    pub fn push_addr(self, addr: &qenv::common::Addr) -> Self {
        let mut b = vec![0x73];
        b.extend_from_slice(addr.as_bytes());
        self.bytes(b)
    }

    /// Name the current offset without emitting anything.
    pub fn mark(mut self, name: &str) -> Self {
        if self.labels.insert(name.to_string(), self.len).is_some() {
            self.dup_label.get_or_insert_with(|| name.to_string());
        }
        self
    }

    /// A jump target: names the offset and emits JUMPDEST.
    pub fn label(self, name: &str) -> Self {
        self.mark(name).op(Opcode::JumpDest)
    }

    pub fn push_label(mut self, name: &str) -> Self {
        self.len += 3;
        self.pieces.push(Piece::LabelRef(name.to_string()));
        self
    }

    /// Jump to `name` if the top of the stack is non-zero.
    pub fn jumpi_to(self, name: &str) -> Self {
        self.push_label(name).op(Opcode::JumpI)
    }

    pub fn jump_to(self, name: &str) -> Self {
        self.push_label(name).op(Opcode::Jump)
    }

    /// Current length of the code.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn assemble(&self) -> Result<Vec<u8>, String> {
        if let Some(name) = &self.dup_label {
            return Err(format!("label {} defined twice", name))
        }
        let mut out = Vec::with_capacity(self.len);
        for p in self.pieces.iter() {
            match p {
                Piece::Bytes(b) => out.extend_from_slice(b),
                Piece::LabelRef(name) => {
                    let off = *self
                        .labels
                        .get(name)
                        .ok_or_else(|| format!("undefined label {}", name))?;
                    if off > 0xffff {
                        return Err(format!("label {} out of PUSH2 range", name))
                    }
                    out.push(0x61);
                    out.extend_from_slice(&(off as u16).to_be_bytes());
                }
            }
        }
        Ok(out)
    }
}

/// Assemble text: mnemonics, `PUSH <literal>` (narrowest width) or `PUSHn <literal>`, `name:`
/// for jump targets and `@name` to push a target. `;` starts a comment.
pub fn assemble(src: &str) -> Result<Vec<u8>, String> {
    let mut asm = Asm::new();
    let mut tokens = src
        .lines()
        .map(|l| l.split(';').next().unwrap_or(""))
        .flat_map(|l| l.split_whitespace());
    while let Some(tok) = tokens.next() {
        if let Some(name) = tok.strip_suffix(':') {
            asm = asm.label(name);
        } else if let Some(name) = tok.strip_prefix('@') {
            asm = asm.push_label(name);
        } else if tok.eq_ignore_ascii_case("PUSH") {
            let lit = tokens.next().ok_or("PUSH without operand")?;
            asm = asm.push(parse_literal(lit)?);
        } else {
            let op = str_to_opcode(tok)
                .ok_or_else(|| format!("unknown mnemonic {}", tok))?;
            let n = Opcode::immediate_len(op);
            if n > 0 {
                let lit = tokens
                    .next()
                    .ok_or_else(|| format!("{} without operand", tok))?;
                asm = asm.push_n(n, parse_literal(lit)?);
            } else {
                asm = asm.bytes(vec![op]);
            }
        }
    }
    asm.assemble()
}

fn parse_literal(s: &str) -> Result<U256, String> {
    let v = match s.strip_prefix("0x") {
        Some(h) => U256::from_str_radix(h, 16).ok(),
        None => U256::from_dec_str(s).ok(),
    };
    v.ok_or_else(|| format!("bad literal {}", s))
}

/// ABI encoding of the few argument kinds the canned contracts take.
pub mod abi {
    use qenv::common::{selector, Addr, U256};

    pub fn word(v: U256) -> [u8; 32] {
        let mut w = [0u8; 32];
        v.to_big_endian(&mut w);
        w
    }

    pub fn addr_word(a: &Addr) -> [u8; 32] {
        let mut w = [0u8; 32];
        w[12..].copy_from_slice(a.as_bytes());
        w
    }

    /// Calldata of `signature` applied to already encoded words.
    pub fn call(signature: &str, args: &[[u8; 32]]) -> Vec<u8> {
        let mut data = selector(signature).to_vec();
        for a in args {
            data.extend_from_slice(a);
        }
        data
    }

    pub fn decode_u256(output: &[u8]) -> U256 {
        let mut w = [0u8; 32];
        let n = output.len().min(32);
        w[32 - n..].copy_from_slice(&output[..n]);
        U256::from_big_endian(&w)
    }
}

#[test]
fn test_mnemonics_round_trip() {
    for b in 0..=255u8 {
        if let Some(s) = opcode_to_str(b) {
            assert_eq!(str_to_opcode(s), Some(b), "{}", s);
        }
    }
    assert_eq!(str_to_opcode("sha3"), Some(0x20));
    assert_eq!(opcode_to_str(0x0c), None);
}

#[test]
fn test_assemble_text() {
    let code = assemble(
        "start: PUSH 0 CALLDATALOAD @start JUMPI ; loop while non-zero
         PUSH1 0x2a PUSH 0 MSTORE PUSH 32 PUSH 0 RETURN",
    )
    .unwrap();
    assert_eq!(
        hex::encode(&code),
        "5b5f3561000057602a5f5260205ff3"
    );
    assert_eq!(
        disasm(&code[..7], false),
        "JUMPDEST PUSH0 CALLDATALOAD PUSH2 0x0000 JUMPI"
    );
    assert!(assemble("@nowhere JUMP").is_err());
    assert!(assemble("a: a:").is_err());
    assert!(assemble("FOO").is_err());
}
