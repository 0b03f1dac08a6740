use bitvec::vec::BitVec;
use hex::{FromHex, ToHex};
use once_cell::sync::OnceCell;
pub use primitive_types::U256;
use primitive_types::{H160, H256};
use serde::{
    de::{self, Deserialize, Deserializer, Visitor},
    Serialize, Serializer,
};
use sha3::Digest;

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Default, Debug)]
pub struct Wei(U256);

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Addr(H160);

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash(H256);

#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Bytes(Vec<u8>);

pub type Gas = u64;

/// Fixed-width byte identifiers written as `0x`-prefixed hex everywhere: display, JSON and
/// parsing.
macro_rules! fixed_bytes_type {
    ($name:ident, $inner:ident, $len:expr) => {
        impl $name {
            #[inline]
            pub fn zero() -> &'static Self {
                static V: OnceCell<$name> = OnceCell::new();
                V.get_or_init(|| $name($inner::zero()))
            }

            #[inline(always)]
            pub fn as_bytes(&self) -> &[u8] {
                self.0.as_bytes()
            }

            /// Panics unless `s` is exactly as long as the type.
            #[inline(always)]
            pub fn from_slice(s: &[u8]) -> Self {
                Self($inner::from_slice(s))
            }

            pub fn to_hex(&self) -> String {
                format!("0x{}", self.as_bytes().encode_hex::<String>())
            }

            fn from_hex_str(s: &str) -> Option<Self> {
                let s = s.strip_prefix("0x").unwrap_or(s);
                match Vec::from_hex(s) {
                    Ok(b) if b.len() == $len => Some(Self::from_slice(&b)),
                    _ => None,
                }
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(b: [u8; $len]) -> Self {
                Self($inner(b))
            }
        }

        impl From<u64> for $name {
            fn from(u: u64) -> Self {
                U256::from(u).into()
            }
        }

        impl From<$name> for U256 {
            fn from(v: $name) -> Self {
                U256::from_big_endian(v.as_bytes())
            }
        }

        impl FromStr for $name {
            type Err = ();
            fn from_str(s: &str) -> Result<Self, ()> {
                Self::from_hex_str(s).ok_or(())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let bytes = d.deserialize_str(HexVisitor)?;
                if bytes.len() != $len {
                    return Err(de::Error::invalid_length(
                        bytes.len(),
                        &concat!("length of ", stringify!($len), " bytes"),
                    ))
                }
                Ok(Self::from_slice(&bytes))
            }
        }
    };
}

fixed_bytes_type!(Addr, H160, 20);
fixed_bytes_type!(Hash, H256, 32);

impl Wei {
    #[inline(always)]
    pub fn checked_add(&self, other: &Wei) -> Option<Wei> {
        self.0.checked_add(other.0).map(Wei)
    }

    #[inline(always)]
    pub fn checked_sub(&self, other: &Wei) -> Option<Wei> {
        self.0.checked_sub(other.0).map(Wei)
    }

    #[inline]
    pub fn zero() -> &'static Self {
        static V: OnceCell<Wei> = OnceCell::new();
        V.get_or_init(|| Wei(U256::zero()))
    }

    #[inline(always)]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// `n` ether (10^18 wei each).
    pub fn ether(n: u64) -> Self {
        Self(U256::from(n) * U256::exp10(18))
    }
}

impl From<U256> for Wei {
    fn from(u: U256) -> Self {
        Self(u)
    }
}

impl From<u64> for Wei {
    fn from(u: u64) -> Self {
        Self(u.into())
    }
}

impl From<Wei> for U256 {
    fn from(w: Wei) -> Self {
        w.0
    }
}

impl AsRef<U256> for Wei {
    fn as_ref(&self) -> &U256 {
        &self.0
    }
}

impl FromStr for Wei {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        parse_quantity(s).map(Self).ok_or(())
    }
}

impl fmt::Display for Wei {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Serialize for Wei {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&to_quantity(&self.0))
    }
}

impl<'de> Deserialize<'de> for Wei {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        d.deserialize_str(QuantityVisitor).map(Wei)
    }
}

impl Addr {
    /// Derive an address from an arbitrary seed (used for test accounts).
    pub fn from_seed(seed: &[u8]) -> Self {
        Self::from_slice(&sha3::Keccak256::digest(seed)[12..])
    }
}

/// The low 20 bytes of the word.
impl From<U256> for Addr {
    fn from(u: U256) -> Self {
        Self::from_slice(&word_bytes(&u)[12..])
    }
}

impl Hash {
    #[inline(always)]
    pub fn hash(slice: &[u8]) -> Self {
        Self::from_slice(&sha3::Keccak256::digest(slice))
    }
}

impl From<U256> for Hash {
    fn from(u: U256) -> Self {
        Self(H256(word_bytes(&u)))
    }
}

impl Bytes {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", self.0.encode_hex::<String>())
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl From<&[u8]> for Bytes {
    fn from(s: &[u8]) -> Self {
        Self(s.into())
    }
}

impl Deref for Bytes {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl rlp::Encodable for Bytes {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.encoder().encode_value(self)
    }
}

impl rlp::Decodable for Bytes {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        rlp.decoder().decode_value(|b| Ok(Self(b.to_vec())))
    }
}

impl Serialize for Bytes {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Bytes {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        d.deserialize_str(HexVisitor)
    }
}

/// Account address in the `to` field of a transaction: empty for contract creation.
#[derive(Debug, Clone)]
pub struct NullableAddr(pub Option<Addr>);

impl rlp::Decodable for NullableAddr {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        rlp.decoder().decode_value(|b| match b.len() {
            0 => Ok(NullableAddr(None)),
            20 => Ok(NullableAddr(Some(Addr::from_slice(b)))),
            n if n < 20 => Err(rlp::DecoderError::RlpIsTooShort),
            _ => Err(rlp::DecoderError::RlpIsTooBig),
        })
    }
}

impl rlp::Encodable for NullableAddr {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        let b: &[u8] = self.0.as_ref().map(Addr::as_bytes).unwrap_or_default();
        s.encoder().encode_value(b);
    }
}

struct HexVisitor;

impl<'de> Visitor<'de> for HexVisitor {
    type Value = Bytes;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a `0x`-prefixed hex string")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Bytes, E> {
        parse_bytes(v)
            .ok_or_else(|| de::Error::invalid_value(de::Unexpected::Str(v), &self))
    }
}

/// JSON-RPC quantity: `0x`-prefixed, no leading zeros (`0x0` for zero).
pub struct QuantityVisitor;

impl<'de> Visitor<'de> for QuantityVisitor {
    type Value = U256;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a hex quantity")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<U256, E> {
        parse_quantity(v)
            .ok_or_else(|| de::Error::invalid_value(de::Unexpected::Str(v), &self))
    }
}

fn strip_hex_prefix(s: &str) -> Option<&str> {
    s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))
}

/// Parse a `0x`-prefixed hex byte string. An odd number of digits is left-padded.
pub fn parse_bytes(value: &str) -> Option<Bytes> {
    let digits = strip_hex_prefix(value)?;
    let v = if digits.len() % 2 == 1 {
        Vec::from_hex(format!("0{}", digits))
    } else {
        Vec::from_hex(digits)
    };
    v.ok().map(Bytes)
}

/// Parse a JSON-RPC quantity. Decimal strings are accepted as well.
pub fn parse_quantity(value: &str) -> Option<U256> {
    match strip_hex_prefix(value) {
        Some("") => Some(U256::zero()),
        Some(digits) if digits.len() <= 64 => U256::from_str_radix(digits, 16).ok(),
        Some(_) => None,
        None => U256::from_dec_str(value).ok(),
    }
}

pub fn to_quantity(value: &U256) -> String {
    format!("{:#x}", value)
}

/// Big-endian 32-byte form of a word.
#[inline(always)]
pub fn word_bytes(u: &U256) -> [u8; 32] {
    let mut b = [0u8; 32];
    u.to_big_endian(&mut b);
    b
}

// NOTE: adapted from https://docs.rs/impl-rlp/latest/src/impl_rlp/lib.rs.html
macro_rules! impl_wrapped_uint_rlp {
    ($wrapper:ident) => {
        impl rlp::Encodable for $wrapper {
            fn rlp_append(&self, s: &mut rlp::RlpStream) {
                let b = word_bytes(&self.0);
                let skip = 32 - (self.0.bits() + 7) / 8;
                s.encoder().encode_value(&b[skip..]);
            }
        }

        impl rlp::Decodable for $wrapper {
            fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
                rlp.decoder().decode_value(|b| match b {
                    [0, ..] => Err(rlp::DecoderError::RlpInvalidIndirection),
                    _ if b.len() > 32 => Err(rlp::DecoderError::RlpIsTooBig),
                    _ => Ok($wrapper(U256::from_big_endian(b))),
                })
            }
        }
    };
}

impl_wrapped_uint_rlp!(Wei);

#[derive(Debug, Clone)]
pub struct U256RLP(pub U256);
impl_wrapped_uint_rlp!(U256RLP);

/// Address of a contract created by `addr` with CREATE at `nonce`.
pub fn create_addr(addr: &Addr, nonce: u64) -> Addr {
    let mut s = rlp::RlpStream::new_list(2);
    s.append(&addr.as_bytes()).append(&nonce);
    Addr::from_slice(&sha3::Keccak256::digest(s.out())[12..])
}

/// Address of a contract created with CREATE2.
pub fn create_addr2(addr: &Addr, salt: &[u8], init_hash: &[u8]) -> Addr {
    let digest = sha3::Keccak256::new()
        .chain_update([0xffu8])
        .chain_update(addr.as_bytes())
        .chain_update(salt)
        .chain_update(init_hash)
        .finalize();
    Addr::from_slice(&digest[12..])
}

/// Mark the bytes that are opcodes (as opposed to PUSH* immediates).
pub fn gen_code_bitmap(code: &[u8]) -> BitVec {
    let mut bitmap = BitVec::repeat(false, code.len());
    let mut i = 0;
    while i < code.len() {
        bitmap.set(i, true);
        i += match code[i] {
            op @ 0x60..=0x7f => (op - 0x5e) as usize,
            _ => 1,
        };
    }
    bitmap
}

#[inline(always)]
pub fn checked_as_u64(x: &U256) -> Option<u64> {
    (x.bits() <= 64).then(|| x.low_u64())
}

/// First four bytes of the keccak256 of a function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let d = sha3::Keccak256::digest(signature.as_bytes());
    [d[0], d[1], d[2], d[3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_addr() {
        let deployer: Addr = "0x6ac7ea33f8831ea9dcc53393aaa88b25a785dbf0".parse().unwrap();
        let expected = [
            "0xcd234a471b72ba2f1ccf0a70fcaba648a5eecd8d",
            "0x343c43a37d37dff08ae8c4a11544c718abb4fcf8",
        ];
        for (nonce, want) in expected.iter().enumerate() {
            assert_eq!(create_addr(&deployer, nonce as u64).to_string(), *want);
        }
        let init_hash = sha3::Keccak256::digest([0u8]);
        assert_eq!(
            create_addr2(Addr::zero(), &[0u8; 32], &init_hash),
            "0x4d1a2e2bb4f88f0250f26ffff098b0b30b26bf38".parse().unwrap()
        );
    }

    #[test]
    fn test_quantity() {
        assert_eq!(parse_quantity("0x0"), Some(U256::zero()));
        assert_eq!(parse_quantity("0x1f"), Some(31.into()));
        assert_eq!(parse_quantity("42"), Some(42.into()));
        assert_eq!(parse_quantity("0xzz"), None);
        assert_eq!(to_quantity(&U256::zero()), "0x0");
        assert_eq!(to_quantity(&255.into()), "0xff");
        assert_eq!(parse_bytes("0x").unwrap().len(), 0);
        assert_eq!(&parse_bytes("0x102").unwrap()[..], &[0x01, 0x02]);
        assert!(parse_bytes("1234").is_none());
    }

    #[test]
    fn test_hex_forms() {
        let addr = Addr::from(0xdeadu64);
        assert_eq!(addr.to_string(), "0x000000000000000000000000000000000000dead");
        assert_eq!(addr.to_string().parse::<Addr>(), Ok(addr.clone()));
        assert!("0xdead".parse::<Addr>().is_err());
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(serde_json::from_str::<Addr>(&json).unwrap(), addr);
        assert!(serde_json::from_str::<Hash>(&json).is_err());
        assert_eq!(serde_json::to_string(&Wei::from(16)).unwrap(), "\"0x10\"");
    }

    #[test]
    fn test_code_bitmap() {
        // PUSH2 0x5b5b JUMPDEST
        let bitmap = gen_code_bitmap(&[0x61, 0x5b, 0x5b, 0x5b]);
        assert!(bitmap[0] && !bitmap[1] && !bitmap[2] && bitmap[3]);
        assert_eq!(checked_as_u64(&U256::from(u64::MAX)), Some(u64::MAX));
        assert_eq!(checked_as_u64(&(U256::from(u64::MAX) + 1)), None);
    }
}
