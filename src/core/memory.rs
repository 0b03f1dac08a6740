use super::params::*;
use super::ExecError;
use crate::common::{checked_as_u64, Gas, U256};

/// Byte-addressed frame memory. Every expansion reports the incremental gas (linear word cost
/// plus the quadratic term) relative to what has already been paid for.
pub struct Memory {
    space: Vec<u8>,
    paid: Gas,
}

impl Memory {
    #[inline(always)]
    pub fn to_word_size(size: u64) -> u64 {
        if size > u64::MAX - 31 {
            (u64::MAX >> 5) + 1
        } else {
            (size + 31) >> 5
        }
    }

    pub fn new() -> Self {
        Self {
            space: Vec::new(),
            paid: 0,
        }
    }

    /// Make sure `[off, off + len)` is addressable, returns the expansion fee.
    fn expand(&mut self, off: &U256, len: &U256) -> Result<(usize, usize, Gas), ExecError> {
        if len.is_zero() {
            return Ok((0, 0, 0))
        }
        let (end, overflow) = off.overflowing_add(*len);
        if overflow || end > U256::from(MAX_MEM_SIZE) {
            return Err(ExecError::OutOfMemory)
        }
        let end = checked_as_u64(&end).ok_or(ExecError::OutOfMemory)?;
        let start = end - len.as_u64();
        let mut fee = 0;
        if end > self.space.len() as u64 {
            let words = Self::to_word_size(end);
            self.space.resize((words << 5) as usize, 0);
            let total = words * GAS_MEM_RESIZE_WORD + words * words / QUAD_COEF_DIV;
            fee = total - self.paid;
            self.paid = total;
        }
        Ok((start as usize, end as usize, fee))
    }

    #[inline(always)]
    pub fn get_slice_mut(
        &mut self, off: U256, len: U256,
    ) -> Result<(&mut [u8], Gas), ExecError> {
        let (start, end, fee) = self.expand(&off, &len)?;
        Ok((&mut self.space[start..end], fee))
    }

    #[inline(always)]
    pub fn get_slice(
        &mut self, off: U256, len: U256,
    ) -> Result<(&[u8], Gas), ExecError> {
        self.get_slice_mut(off, len).map(|(s, fee)| (&*s, fee))
    }

    /// Read-only view that never expands memory; out-of-range bytes are absent.
    pub fn peek(&self, off: usize, len: usize) -> &[u8] {
        let start = off.min(self.space.len());
        let end = off.saturating_add(len).min(self.space.len());
        &self.space[start..end]
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.space.len()
    }

    /// Copy `data` into `[off, off + len)`, truncating whichever side is longer.
    #[inline(always)]
    pub fn set(
        &mut self, off: U256, len: U256, data: &[u8],
    ) -> Result<Gas, ExecError> {
        let (slice, fee) = self.get_slice_mut(off, len)?;
        let n = std::cmp::min(slice.len(), data.len());
        slice[..n].copy_from_slice(&data[..n]);
        Ok(fee)
    }

    /// MCOPY: overlapping ranges are allowed.
    pub fn copy_within(
        &mut self, dst: U256, src: U256, len: U256,
    ) -> Result<Gas, ExecError> {
        if len.is_zero() {
            return Ok(0)
        }
        let (s, _, fee_src) = self.expand(&src, &len)?;
        let (d, _, fee_dst) = self.expand(&dst, &len)?;
        let n = len.as_usize();
        self.space.copy_within(s..s + n, d);
        Ok(fee_src + fee_dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expansion_fee() {
        let mut m = Memory::new();
        let (_, fee) = m.get_slice(0.into(), 32.into()).unwrap();
        assert_eq!(fee, 3);
        // already paid for
        let (_, fee) = m.get_slice(0.into(), 1.into()).unwrap();
        assert_eq!(fee, 0);
        let (_, fee) = m.get_slice(32.into(), 32.into()).unwrap();
        assert_eq!(fee, 3);
        assert_eq!(m.len(), 64);
    }

    #[test]
    fn test_zero_length_never_expands() {
        let mut m = Memory::new();
        let (s, fee) = m.get_slice(U256::MAX, 0.into()).unwrap();
        assert!(s.is_empty());
        assert_eq!(fee, 0);
        assert_eq!(m.len(), 0);
        assert!(matches!(
            m.get_slice(U256::MAX, 1.into()),
            Err(ExecError::OutOfMemory)
        ));
    }

    #[test]
    fn test_copy_within() {
        let mut m = Memory::new();
        m.set(0.into(), 4.into(), &[1, 2, 3, 4]).unwrap();
        m.copy_within(1.into(), 0.into(), 3.into()).unwrap();
        assert_eq!(m.peek(0, 4), &[1, 1, 2, 3]);
    }
}
