//! # qenv: a scriptable EVM environment for contract testing
//!
//! - qenv runs contract deployments and calls either on an in-process EVM, on an in-process EVM
//!   whose missing state is fetched lazily from a real chain ("forking"), or on a real node by
//!   signing and broadcasting transactions. The same façade ([env::Env]) drives all three.
//!
//! - Everything a test suite wants from such an environment is here: snapshots that roll the
//!   whole world back ("anchors"), temporarily acting as another sender ("prank"), moving the
//!   clock, raw overrides of balances, nonces, code and storage, pluggable gas metering with
//!   profiling, and structured failures that keep the revert data and the call stack.
//!
//! # Overview
//! The crate is organized leaf-first:
//!
//! - [common]: basic types ([common::Addr], [common::Wei], [common::Hash], [common::Bytes]) and
//!   hex/quantity helpers.
//! - [core]: a non-recursive interpreter ([core::Engine]) with pluggable gas meters
//!   ([core::GasMeter]) and a hook table for opcode overrides and precompiles ([core::HookTable]).
//! - [state]: [state::MemState], the layered in-memory state the interpreter works on, over any
//!   read-only [state::StateBackend].
//! - [rpc], [remote], [cache], [fork]: the JSON-RPC client, block-pinned remote reads, the
//!   on-disk cache shared by processes, and the [fork::ForkedBackend] composing them.
//! - [snapshot], [registry], [env], [network]: the façade and its bookkeeping.
//! - [context]: the per-thread "current environment" for call sites that do not pass one around.
//! - [tx]: legacy transaction encoding and signing for network mode.
//!
//! A deployment and a call take a few lines:
//!
//! ```no_run
//! use qenv::env::{Env, TxOpts};
//!
//! let mut env = Env::default();
//! let init_code = hex::decode("600a600c600039600a6000f3602a60005260206000f3").unwrap();
//! let d = env.deploy(&init_code, &[], &TxOpts::default()).unwrap();
//! let out = env.call(&d.address, &[], &TxOpts::default(), false).unwrap();
//! assert_eq!(out.output[31], 42);
//! ```
//!
//! # On the Data Flow
//! Reads go down the layers until one of them knows the answer; writes never leave the top:
//!
//! ```notrust
//!              [ Env ] -- deploy/call --> [ Engine ]
//!                 |                          |  ^
//!          anchor/restore               write|  |read
//!                 |                          v  |
//!                 '------------------> [ MemState ]   (base delta + one delta per frame)
//!                                            |  ^
//!                                        miss|  |
//!                                            v  |
//!                                    [ ForkedBackend ]  memo -> StorageCache -> remote node
//! ```
//!
//! A frame's writes live in its own delta and are squashed into the caller's when it returns, or
//! dropped when it fails, so a revert costs nothing. An anchor copies the flattened deltas, which
//! are only what has been touched: in a fork the remote chain can be huge, the copy stays small.
//!
//! State fetched from a fork is pinned to one block. Blocks deep enough to be final are cached
//! on disk, one file per chain, and shared by concurrent test processes; anything else is only
//! cached when asked for explicitly.

#[macro_use] extern crate num_derive;

#[macro_use]
pub mod common;
pub mod cache;
pub mod context;
pub mod core;
pub mod env;
pub mod error;
pub mod fork;
pub mod network;
pub mod registry;
pub mod remote;
pub mod rpc;
pub mod snapshot;
pub mod state;
pub mod tx;

pub use env::{Env, EnvConfig, TxOpts};
pub use error::{Error, Result};
