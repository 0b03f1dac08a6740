use crate::error::{Error, Result};

/// Identifies one open snapshot; only the innermost one may be exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotHandle {
    depth: usize,
    serial: u64,
}

impl SnapshotHandle {
    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// A LIFO stack of saved states.
pub struct SnapshotManager<T> {
    stack: Vec<(u64, T)>,
    next_serial: u64,
}

impl<T> Default for SnapshotManager<T> {
    fn default() -> Self {
        Self {
            stack: Vec::new(),
            next_serial: 0,
        }
    }
}

impl<T> SnapshotManager<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&mut self, saved: T) -> SnapshotHandle {
        let serial = self.next_serial;
        self.next_serial += 1;
        self.stack.push((serial, saved));
        SnapshotHandle {
            depth: self.stack.len() - 1,
            serial,
        }
    }

    /// Take back the state saved by `handle`, which must be the innermost open snapshot.
    pub fn exit(&mut self, handle: SnapshotHandle) -> Result<T> {
        match self.stack.last() {
            Some((serial, _))
                if *serial == handle.serial &&
                    handle.depth == self.stack.len() - 1 =>
            {
                self.stack.pop().map(|(_, t)| t).ok_or_else(|| {
                    Error::SnapshotDiscipline("snapshot stack is empty".into())
                })
            }
            Some(_) if self.stack.iter().any(|(s, _)| *s == handle.serial) => {
                Err(Error::SnapshotDiscipline(format!(
                    "exiting snapshot at depth {} while {} inner snapshot(s) are open",
                    handle.depth,
                    self.stack.len() - 1 - handle.depth
                )))
            }
            _ => Err(Error::SnapshotDiscipline(format!(
                "snapshot at depth {} is not open",
                handle.depth
            ))),
        }
    }

    /// Number of open snapshots.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn is_open(&self, handle: &SnapshotHandle) -> bool {
        self.stack.iter().any(|(s, _)| *s == handle.serial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifo() {
        let mut m = SnapshotManager::new();
        let a = m.enter("a");
        let b = m.enter("b");
        assert_eq!(m.depth(), 2);
        assert!(matches!(m.exit(a), Err(Error::SnapshotDiscipline(_))));
        // a failed exit leaves the stack untouched
        assert_eq!(m.depth(), 2);
        assert_eq!(m.exit(b).unwrap(), "b");
        assert_eq!(m.exit(a).unwrap(), "a");
        assert!(matches!(m.exit(a), Err(Error::SnapshotDiscipline(_))));
    }

    #[test]
    fn test_stale_handle() {
        let mut m = SnapshotManager::new();
        let a = m.enter(1);
        m.exit(a).unwrap();
        // same depth, different snapshot
        let _b = m.enter(2);
        assert!(m.exit(a).is_err());
        assert!(!m.is_open(&a));
    }
}
