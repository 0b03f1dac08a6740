use super::params::*;
use super::ExecError;
use crate::common::U256;

/// Operand stack of a call frame. Grows on demand up to [MAX_STACK_DEPTH] entries.
pub struct Stack {
    items: Vec<U256>,
}

impl Stack {
    pub fn new() -> Self {
        Self {
            items: Vec::with_capacity(32),
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline(always)]
    pub fn push(&mut self, val: U256) -> Result<(), ExecError> {
        if self.items.len() == MAX_STACK_DEPTH {
            return Err(ExecError::StackOverflow)
        }
        self.items.push(val);
        Ok(())
    }

    /// The `n`-th item from the top (0 is the top) without consuming it.
    #[inline(always)]
    pub fn peek(&self, n: usize) -> Result<&U256, ExecError> {
        let len = self.items.len();
        if n >= len {
            return Err(ExecError::StackUnderflow)
        }
        Ok(&self.items[len - 1 - n])
    }

    #[inline(always)]
    pub fn dup(&mut self, pos: usize) -> Result<(), ExecError> {
        let val = *self.peek(pos - 1)?;
        self.push(val)
    }

    #[inline(always)]
    pub fn swap(&mut self, pos: usize) -> Result<(), ExecError> {
        let len = self.items.len();
        if pos >= len {
            return Err(ExecError::StackUnderflow)
        }
        self.items.swap(len - 1, len - 1 - pos);
        Ok(())
    }

    #[inline(always)]
    fn take<const N: usize>(&mut self) -> Result<[U256; N], ExecError> {
        let len = self.items.len();
        if len < N {
            return Err(ExecError::StackUnderflow)
        }
        let mut out = [U256::zero(); N];
        // top of the stack comes first
        for (o, v) in out.iter_mut().zip(self.items.drain(len - N..).rev()) {
            *o = v;
        }
        Ok(out)
    }

    #[inline(always)]
    pub fn consume1(&mut self) -> Result<U256, ExecError> {
        self.items.pop().ok_or(ExecError::StackUnderflow)
    }

    #[inline(always)]
    pub fn consume2(&mut self) -> Result<(U256, U256), ExecError> {
        let [a, b] = self.take::<2>()?;
        Ok((a, b))
    }

    #[inline(always)]
    pub fn consume3(&mut self) -> Result<(U256, U256, U256), ExecError> {
        let [a, b, c] = self.take::<3>()?;
        Ok((a, b, c))
    }

    #[inline(always)]
    pub fn consume4(&mut self) -> Result<(U256, U256, U256, U256), ExecError> {
        let [a, b, c, d] = self.take::<4>()?;
        Ok((a, b, c, d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_order() {
        let mut s = Stack::new();
        for i in 1..=4u64 {
            s.push(i.into()).unwrap();
        }
        let (a, b) = s.consume2().unwrap();
        assert_eq!((a.as_u64(), b.as_u64()), (4, 3));
        assert_eq!(s.len(), 2);
        assert!(matches!(s.consume3(), Err(ExecError::StackUnderflow)));
        // a failed consume leaves the stack untouched
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn test_dup_swap() {
        let mut s = Stack::new();
        s.push(1.into()).unwrap();
        s.push(2.into()).unwrap();
        s.dup(2).unwrap();
        assert_eq!(s.peek(0).unwrap().as_u64(), 1);
        s.swap(2).unwrap();
        assert_eq!(s.peek(0).unwrap().as_u64(), 1);
        assert_eq!(s.peek(2).unwrap().as_u64(), 1);
        assert!(s.swap(3).is_err());
        assert!(s.dup(4).is_err());
    }

    #[test]
    fn test_overflow() {
        let mut s = Stack::new();
        for _ in 0..MAX_STACK_DEPTH {
            s.push(U256::zero()).unwrap();
        }
        assert!(matches!(
            s.push(U256::zero()),
            Err(ExecError::StackOverflow)
        ));
    }
}
