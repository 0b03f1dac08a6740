use once_cell::sync::OnceCell;
use rlp_derive::{RlpDecodable, RlpEncodable};
use sha3::Digest;

use crate::common::{
    word_bytes, Addr, Bytes, Gas, Hash, NullableAddr, Wei, U256, U256RLP,
};
use crate::error::Error;

/// A pre-EIP-2718 transaction, signed with EIP-155 replay protection.
#[derive(RlpDecodable, RlpEncodable, Debug, Clone)]
pub struct TxLegacy {
    nonce: u64,
    gas_price: Wei,
    gas: Gas,
    to: NullableAddr,
    value: Wei,
    data: Bytes,
    v: U256RLP,
    r: U256RLP,
    s: U256RLP,
}

impl TxLegacy {
    /// An unsigned transaction; `to == None` creates a contract.
    pub fn new(
        nonce: u64, gas_price: Wei, gas: Gas, to: Option<Addr>, value: Wei,
        data: Bytes,
    ) -> Self {
        Self {
            nonce,
            gas_price,
            gas,
            to: NullableAddr(to),
            value,
            data,
            v: U256RLP(U256::zero()),
            r: U256RLP(U256::zero()),
            s: U256RLP(U256::zero()),
        }
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        rlp::decode(bytes).ok()
    }

    pub fn encode(&self) -> Vec<u8> {
        rlp::encode(self).to_vec()
    }

    /// Hash of the signed encoding, as reported by nodes.
    pub fn hash(&self) -> Hash {
        Hash::hash(&self.encode())
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn gas(&self) -> Gas {
        self.gas
    }

    pub fn to(&self) -> Option<&Addr> {
        self.to.0.as_ref()
    }

    pub fn value(&self) -> &Wei {
        &self.value
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn v(&self) -> &U256 {
        &self.v.0
    }

    /// Chain id encoded in `v`, zero for unprotected signatures.
    pub fn chain_id(&self) -> U256 {
        let v = &self.v.0;
        if v.bits() <= 64 {
            let v = v.low_u64();
            if v < 35 {
                return U256::zero()
            }
            return ((v - 35) / 2).into()
        }
        (v - 35) / 2
    }

    fn protected(&self) -> bool {
        let v = self.v();
        if v.bits() <= 8 {
            let v = v.low_u64();
            return v != 27 && v != 28 && v != 1 && v != 0
        }
        true
    }

    fn append_body(&self, stream: &mut rlp::RlpStream) {
        stream
            .append(&self.nonce)
            .append(&self.gas_price)
            .append(&self.gas)
            .append(&self.to)
            .append(&self.value)
            .append(&self.data);
    }

    /// EIP-155 signing hash.
    pub fn sig_hash(&self, chain_id: U256) -> Hash {
        let mut stream = rlp::RlpStream::new_list(9);
        self.append_body(&mut stream);
        stream.append(&U256RLP(chain_id)).append(&0u64).append(&0u64);
        Hash::hash(&stream.out())
    }

    /// Homestead signing hash.
    fn unprotected_sig_hash(&self) -> Hash {
        let mut stream = rlp::RlpStream::new_list(6);
        self.append_body(&mut stream);
        Hash::hash(&stream.out())
    }

    /// Recover the signer, requiring `chain_id` for protected signatures.
    pub fn recover_sender(&self, chain_id: &U256) -> Option<Addr> {
        let r = self.r.0;
        let s = self.s.0;
        if !self.protected() {
            let v = self.v.0.low_u64();
            let v = if v >= 27 { v - 27 } else { v };
            return recover_plain(&self.unprotected_sig_hash(), r, s, v, true)
        }
        if &self.chain_id() != chain_id {
            return None
        }
        let mut v = self.v.0;
        v -= *chain_id << 1;
        v -= 35u64.into();
        if v.bits() > 8 {
            return None
        }
        recover_plain(&self.sig_hash(*chain_id), r, s, v.low_u64(), true)
    }
}

/// A secp256k1 key able to sign transactions.
#[derive(Clone)]
pub struct Signer {
    key: libsecp256k1::SecretKey,
    address: Addr,
}

impl Signer {
    pub fn from_slice(secret: &[u8]) -> crate::error::Result<Self> {
        let key = libsecp256k1::SecretKey::parse_slice(secret)
            .map_err(|e| Error::InvalidInput(format!("private key: {:?}", e)))?;
        let pubkey = libsecp256k1::PublicKey::from_secret_key(&key);
        Ok(Self {
            address: pubkey_to_addr(&pubkey.serialize()),
            key,
        })
    }

    /// Parse a hex-encoded private key, with or without the `0x` prefix.
    pub fn from_hex(secret: &str) -> crate::error::Result<Self> {
        let bytes = hex::decode(secret.trim_start_matches("0x"))
            .map_err(|e| Error::InvalidInput(format!("private key: {}", e)))?;
        Self::from_slice(&bytes)
    }

    pub fn address(&self) -> &Addr {
        &self.address
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer").field("address", &self.address).finish()
    }
}

/// Sign `tx` for `chain_id` (EIP-155).
pub fn sign_legacy(
    mut tx: TxLegacy, signer: &Signer, chain_id: U256,
) -> TxLegacy {
    let hash = tx.sig_hash(chain_id);
    let msg = libsecp256k1::Message::parse(&hash_bytes(&hash));
    let (sig, rec) = libsecp256k1::sign(&msg, &signer.key);
    let sig = sig.serialize();
    tx.r = U256RLP(U256::from_big_endian(&sig[..32]));
    tx.s = U256RLP(U256::from_big_endian(&sig[32..]));
    tx.v = U256RLP((chain_id << 1) + U256::from(35 + rec.serialize() as u64));
    tx
}

/// Recover the signer of a raw transaction.
pub fn recover_sender(raw: &[u8], chain_id: &U256) -> Option<Addr> {
    TxLegacy::decode(raw)?.recover_sender(chain_id)
}

fn hash_bytes(hash: &Hash) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(hash.as_bytes());
    out
}

fn pubkey_to_addr(pubkey: &[u8; 65]) -> Addr {
    Addr::from_slice(&sha3::Keccak256::digest(&pubkey[1..]).as_slice()[12..])
}

#[inline]
fn secp256k1_n() -> &'static U256 {
    static V: OnceCell<U256> = OnceCell::new();
    V.get_or_init(|| {
        U256::from_big_endian(&[
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xfe, 0xba, 0xae, 0xdc, 0xe6, 0xaf, 0x48,
            0xa0, 0x3b, 0xbf, 0xd2, 0x5e, 0x8c, 0xd0, 0x36, 0x41, 0x41,
        ])
    })
}

#[inline]
fn secp256k1_half_n() -> &'static U256 {
    static V: OnceCell<U256> = OnceCell::new();
    V.get_or_init(|| secp256k1_n() / 2)
}

/// Recover the address that signed `hash`; `v` is the recovery id (0 or 1).
pub(crate) fn recover_plain(
    hash: &Hash, r: U256, s: U256, v: u64, homestead: bool,
) -> Option<Addr> {
    // `ValidateSignatureValues` in geth
    if r.is_zero() || s.is_zero() {
        return None
    }
    if homestead && &s > secp256k1_half_n() {
        return None
    }
    if &r >= secp256k1_n() || &s >= secp256k1_n() || (v != 0 && v != 1) {
        return None
    }
    let r = word_bytes(&r);
    let s = word_bytes(&s);
    let mut r1 = libsecp256k1::curve::Scalar([0; 8]);
    let mut s1 = libsecp256k1::curve::Scalar([0; 8]);
    drop(r1.set_b32(&r));
    drop(s1.set_b32(&s));
    let sig = libsecp256k1::Signature { r: r1, s: s1 };
    let msg = libsecp256k1::Message::parse_slice(hash.as_bytes()).ok()?;
    let recover_id = libsecp256k1::RecoveryId::parse(v as u8).ok()?;
    let pubkey = libsecp256k1::recover(&msg, &sig, &recover_id)
        .ok()?
        .serialize();
    Some(pubkey_to_addr(&pubkey))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> Signer {
        Signer::from_hex(
            "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318",
        )
        .unwrap()
    }

    #[test]
    fn test_sign_and_recover() {
        let signer = signer();
        let chain_id = U256::from(1337);
        let tx = TxLegacy::new(
            7,
            Wei::from(1_000_000_000),
            21000,
            Some(Addr::from(0x1234)),
            Wei::from(1),
            Bytes::empty(),
        );
        let signed = sign_legacy(tx, &signer, chain_id);
        assert_eq!(signed.chain_id(), chain_id);
        assert_eq!(
            signed.recover_sender(&chain_id).as_ref(),
            Some(signer.address())
        );
        // replaying on another chain does not recover
        assert!(signed.recover_sender(&U256::from(1)).is_none());

        let raw = signed.encode();
        let decoded = TxLegacy::decode(&raw).unwrap();
        assert_eq!(decoded.nonce(), 7);
        assert_eq!(decoded.hash(), signed.hash());
        assert_eq!(
            recover_sender(&raw, &chain_id).as_ref(),
            Some(signer.address())
        );
    }

    #[test]
    fn test_known_address() {
        assert_eq!(
            signer().address().to_hex(),
            "0x2c7536e3605d9c16a7a3d7b1898e529396a65c23"
        );
    }

    #[test]
    fn test_recover_rejects_bad_values() {
        let h = Hash::hash(b"x");
        assert!(recover_plain(&h, U256::zero(), U256::one(), 0, true).is_none());
        assert!(recover_plain(&h, U256::one(), U256::one(), 2, true).is_none());
    }
}
