use crate::common::{Addr, Bytes, Gas, Hash};
use crate::core::ExecError;
use crate::rpc::RpcClientError;

/// One active frame of the call stack at the moment an execution failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallStackEntry {
    pub address: Addr,
    pub calldata: Bytes,
    pub depth: usize,
}

/// Position of one frame when the execution failed. `recent` holds the last executed program
/// counters of that frame, oldest first, ending at `pc`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PcTrailEntry {
    pub address: Addr,
    pub pc: u64,
    pub recent: Vec<u64>,
}

/// Structured data of a failed deploy/call, preserved for the traceback layer.
#[derive(Clone, Debug)]
pub struct ExecutionFailure {
    /// Why the outermost frame stopped.
    pub kind: ExecError,
    /// Bytes passed to REVERT (empty for other failures).
    pub revert_data: Bytes,
    /// Outermost frame first.
    pub call_stack: Vec<CallStackEntry>,
    /// Outermost frame first.
    pub pc_trail: Vec<PcTrailEntry>,
    pub gas_used: Gas,
}

impl ExecutionFailure {
    /// Address of the frame that raised the failure.
    pub fn failing_address(&self) -> Option<&Addr> {
        self.call_stack.last().map(|e| &e.address)
    }
}

impl std::fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(addr) = self.failing_address() {
            write!(f, " at {}", addr)?;
        }
        if let Some(e) = self.pc_trail.last() {
            write!(f, " (pc 0x{:x})", e.pc)?;
        }
        if !self.revert_data.is_empty() {
            write!(f, ": {}", self.revert_data)?;
        }
        Ok(())
    }
}

/// Failure of a backing store read (the forked remote state).
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("remote state for {address} unavailable: {source}")]
    Unavailable {
        address: Addr,
        #[source]
        source: RpcClientError,
    },
    #[error("remote hash of block {number} unavailable: {source}")]
    BlockUnavailable {
        number: u64,
        #[source]
        source: RpcClientError,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The contract reverted (or failed with any non-gas error). Recoverable.
    #[error("execution reverted: {0}")]
    ExecutionRevert(Box<ExecutionFailure>),

    /// The gas meter ran out. Recoverable.
    #[error("out of gas: {0}")]
    OutOfGas(Box<ExecutionFailure>),

    /// The remote node could not be reached after retries and no cached value exists.
    #[error(transparent)]
    RemoteUnavailable(#[from] StateError),

    /// The operation is not supported by the current backend.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Anchors were not released in LIFO order, or similar misuse.
    #[error("snapshot discipline violated: {0}")]
    SnapshotDiscipline(String),

    /// A network transaction was not mined in time. The outcome is unknown: it may still be
    /// included later.
    #[error("timed out waiting for receipt of {tx_hash}")]
    Timeout { tx_hash: Hash },

    #[error(transparent)]
    Rpc(#[from] RpcClientError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Explicit cache administration failed (never raised by reads).
    #[error("cache: {0}")]
    Cache(#[source] lmdb::Error),
}

impl Error {
    pub(crate) fn from_exec(failure: ExecutionFailure) -> Self {
        match failure.kind {
            ExecError::OutOfGas | ExecError::CodeStoreOutOfGas => {
                Error::OutOfGas(Box::new(failure))
            }
            _ => Error::ExecutionRevert(Box::new(failure)),
        }
    }

    /// Failure data of an [Error::ExecutionRevert] or [Error::OutOfGas].
    pub fn failure(&self) -> Option<&ExecutionFailure> {
        match self {
            Error::ExecutionRevert(f) | Error::OutOfGas(f) => Some(f),
            _ => None,
        }
    }

    /// Revert bytes, if this is a revert.
    pub fn revert_data(&self) -> Option<&Bytes> {
        match self {
            Error::ExecutionRevert(f) => Some(&f.revert_data),
            _ => None,
        }
    }

    pub fn is_revert(&self) -> bool {
        matches!(self, Error::ExecutionRevert(_))
    }

    pub fn is_out_of_gas(&self) -> bool {
        matches!(self, Error::OutOfGas(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
