//! Word arithmetic of the interpreter. All operations wrap modulo 2^256; signed variants treat
//! the word as two's complement.
use primitive_types::{U256, U512};

#[inline(always)]
fn flag(t: bool) -> U256 {
    if t {
        U256::one()
    } else {
        U256::zero()
    }
}

#[inline(always)]
fn is_neg(x: &U256) -> bool {
    x.bit(255)
}

/// Two's complement negation.
#[inline(always)]
pub fn neg(x: U256) -> U256 {
    (!x).overflowing_add(U256::one()).0
}

#[inline(always)]
fn abs(x: U256) -> U256 {
    if is_neg(&x) {
        neg(x)
    } else {
        x
    }
}

#[inline(always)]
fn narrow(x: U512) -> U256 {
    // callers only pass values already reduced below a 256-bit modulus
    U256::try_from(x).unwrap_or_default()
}

pub fn add(a: U256, b: U256) -> U256 {
    a.overflowing_add(b).0
}

pub fn sub(a: U256, b: U256) -> U256 {
    a.overflowing_sub(b).0
}

pub fn mul(a: U256, b: U256) -> U256 {
    a.overflowing_mul(b).0
}

pub fn div(a: U256, b: U256) -> U256 {
    a.checked_div(b).unwrap_or_default()
}

pub fn rem(a: U256, b: U256) -> U256 {
    a.checked_rem(b).unwrap_or_default()
}

pub fn sdiv(a: U256, b: U256) -> U256 {
    if b.is_zero() {
        return U256::zero()
    }
    let q = abs(a) / abs(b);
    if is_neg(&a) != is_neg(&b) {
        neg(q)
    } else {
        q
    }
}

/// Signed modulo: the result takes the sign of the dividend.
pub fn smod(a: U256, b: U256) -> U256 {
    if b.is_zero() {
        return U256::zero()
    }
    let r = abs(a) % abs(b);
    if is_neg(&a) {
        neg(r)
    } else {
        r
    }
}

pub fn add_mod(a: U256, b: U256, n: U256) -> U256 {
    if n.is_zero() {
        return U256::zero()
    }
    narrow((U512::from(a) + U512::from(b)) % U512::from(n))
}

pub fn mul_mod(a: U256, b: U256, n: U256) -> U256 {
    if n.is_zero() {
        return U256::zero()
    }
    narrow((U512::from(a) * U512::from(b)) % U512::from(n))
}

pub fn exp(a: U256, b: U256) -> U256 {
    a.overflowing_pow(b).0
}

/// Extend the sign bit of the lowest `k + 1` bytes of `x`.
pub fn sign_extend(k: U256, x: U256) -> U256 {
    if k >= U256::from(31) {
        return x
    }
    let bit = (k.as_usize() << 3) + 7;
    let low = (U256::one() << bit) - U256::one();
    if x.bit(bit) {
        x | !low
    } else {
        x & low
    }
}

pub fn lt(a: U256, b: U256) -> U256 {
    flag(a < b)
}

pub fn gt(a: U256, b: U256) -> U256 {
    flag(a > b)
}

#[inline(always)]
fn signed_lt(a: &U256, b: &U256) -> bool {
    match (is_neg(a), is_neg(b)) {
        (true, false) => true,
        (false, true) => false,
        // same sign: two's complement order matches the unsigned order
        _ => a < b,
    }
}

pub fn slt(a: U256, b: U256) -> U256 {
    flag(signed_lt(&a, &b))
}

pub fn sgt(a: U256, b: U256) -> U256 {
    flag(signed_lt(&b, &a))
}

pub fn eq(a: U256, b: U256) -> U256 {
    flag(a == b)
}

pub fn is_zero(a: U256) -> U256 {
    flag(a.is_zero())
}

pub fn and(a: U256, b: U256) -> U256 {
    a & b
}

pub fn or(a: U256, b: U256) -> U256 {
    a | b
}

pub fn xor(a: U256, b: U256) -> U256 {
    a ^ b
}

pub fn not(a: U256) -> U256 {
    !a
}

/// The `i`-th byte of `x`, counting from the most significant one.
pub fn byte(i: U256, x: U256) -> U256 {
    if i >= U256::from(32) {
        return U256::zero()
    }
    U256::from(x.byte(31 - i.as_usize()))
}

pub fn shl(s: U256, val: U256) -> U256 {
    if s >= U256::from(256) {
        U256::zero()
    } else {
        val << s.as_usize()
    }
}

pub fn shr(s: U256, val: U256) -> U256 {
    if s >= U256::from(256) {
        U256::zero()
    } else {
        val >> s.as_usize()
    }
}

pub fn sar(s: U256, val: U256) -> U256 {
    if !is_neg(&val) {
        return shr(s, val)
    }
    if s >= U256::from(255) {
        return U256::MAX
    }
    let s = s.as_usize();
    if s == 0 {
        return val
    }
    (val >> s) | (U256::MAX << (256 - s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(i: i64) -> U256 {
        if i < 0 {
            neg(U256::from(i.unsigned_abs()))
        } else {
            U256::from(i as u64)
        }
    }

    fn s(x: U256) -> i64 {
        if is_neg(&x) {
            -(neg(x).as_u64() as i64)
        } else {
            x.as_u64() as i64
        }
    }

    #[test]
    fn test_signed_division() {
        for i in -300..=300i64 {
            for j in -300..=300i64 {
                if j == 0 {
                    assert!(sdiv(w(i), w(j)).is_zero());
                    assert!(smod(w(i), w(j)).is_zero());
                    continue
                }
                assert_eq!(s(sdiv(w(i), w(j))), i / j, "{} / {}", i, j);
                assert_eq!(s(smod(w(i), w(j))), i % j, "{} % {}", i, j);
            }
        }
        // -2^255 / -1 overflows back to -2^255
        let min = U256::one() << 255;
        assert_eq!(sdiv(min, w(-1)), min);
    }

    #[test]
    fn test_signed_compare() {
        for i in -3..=3i64 {
            for j in -3..=3i64 {
                assert_eq!(slt(w(i), w(j)).as_u64() == 1, i < j);
                assert_eq!(sgt(w(i), w(j)).as_u64() == 1, i > j);
            }
        }
    }

    #[test]
    fn test_sign_extend() {
        assert_eq!(sign_extend(0.into(), 0xff.into()), w(-1));
        assert_eq!(sign_extend(0.into(), 0x7f.into()), 0x7f.into());
        assert_eq!(sign_extend(1.into(), 0x1_8000.into()), w(-0x8000));
        assert_eq!(sign_extend(31.into(), w(-5)), w(-5));
        assert_eq!(sign_extend(U256::MAX, 0xff.into()), 0xff.into());
        for x in [-128i64, -1, 0, 1, 127] {
            assert_eq!(s(sign_extend(0.into(), w(x) & 0xff.into())), x);
        }
    }

    #[test]
    fn test_shifts_and_byte() {
        assert_eq!(shl(1.into(), 1.into()), 2.into());
        assert!(shl(256.into(), 1.into()).is_zero());
        assert!(shr(U256::MAX, U256::MAX).is_zero());
        for x in 1..200i64 {
            for i in 0..40usize {
                assert_eq!(s(sar(i.into(), w(-x))), (-x) >> i);
            }
        }
        assert_eq!(sar(300.into(), w(-1)), U256::MAX);
        assert!(sar(300.into(), 7.into()).is_zero());
        assert_eq!(byte(31.into(), 0xab.into()), 0xab.into());
        assert!(byte(32.into(), U256::MAX).is_zero());
        assert_eq!(byte(0.into(), U256::MAX), 0xff.into());
    }

    #[test]
    fn test_modular() {
        assert_eq!(add_mod(U256::MAX, 2.into(), 10.into()), 7.into());
        assert_eq!(mul_mod(U256::MAX, U256::MAX, 12.into()), 9.into());
        assert!(add_mod(1.into(), 2.into(), 0.into()).is_zero());
        assert!(div(1.into(), 0.into()).is_zero());
        assert!(rem(1.into(), 0.into()).is_zero());
    }
}
