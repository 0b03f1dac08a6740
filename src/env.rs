//! The environment façade.
//!
//! An [Env] runs deployments and calls on one of three backends: a purely local simulation, a
//! simulation over a fork of a remote chain, or a real node reached over JSON-RPC. All three take
//! the same operations; whatever a backend cannot do fails with
//! [Error::UnsupportedOperation](crate::error::Error::UnsupportedOperation).
//!
//! Anchors capture the touched state plus the environment's own bookkeeping (registered
//! contracts, aliases, block number and timestamp, gas counters) and restore it when released.
//! They nest, and the borrow held by an [AnchorGuard] makes releasing them out of order
//! impossible; the handle-based [Env::anchor_enter]/[Env::anchor_exit] pair checks the order at
//! run time instead.
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Deserialize;

use crate::common::{Addr, Bytes, Gas, Hash, Wei, U256};
use crate::core::{
    BlockInfo, CallOutput, Deployed, Engine, ExecEnv, Fork, GasMeter,
    GasProfile, HookTable, Message, NoGasMeter, OpcodeHook, PlainCode,
    PrecompiledContract, ProfilingGasMeter, StandardGasMeter,
};
use crate::error::{Error, Result};
use crate::fork::{ForkConfig, ForkedBackend};
use crate::network::NetworkEnv;
use crate::registry::{AliasTable, ContractRegistry, RegisteredContract};
use crate::remote::PinnedBlock;
use crate::rpc::RpcClient;
use crate::snapshot::{SnapshotHandle, SnapshotManager};
use crate::state::{EmptyState, StateSnapshot};

/// Seconds per block assumed by [Env::time_travel].
pub const DEFAULT_BLOCK_DELTA: u64 = 12;

/// An environment shared by the handles that point into it.
pub type SharedEnv = Rc<RefCell<Env>>;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub chain_id: u64,
    pub fork: Fork,
    pub block_gas_limit: Gas,
    /// Gas given to deployments and calls that do not specify any.
    pub default_gas: Gas,
    pub block_number: u64,
    pub timestamp: u64,
    pub base_fee: u64,
    pub coinbase: Addr,
    /// Balance of the default sender in local and forked simulations.
    pub eoa_balance: Wei,
    /// Seed of [Env::generate_address].
    pub seed: u64,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            fork: Fork::default(),
            block_gas_limit: 30_000_000,
            default_gas: 30_000_000,
            block_number: 1,
            timestamp: 1_700_000_000,
            base_fee: 0,
            coinbase: Addr::zero().clone(),
            eoa_balance: Wei::ether(1_000_000),
            seed: 0,
        }
    }
}

/// Sender, value and gas of a deployment or call; unset fields take the environment's defaults.
#[derive(Clone, Debug, Default)]
pub struct TxOpts {
    pub sender: Option<Addr>,
    pub value: Wei,
    pub gas: Option<Gas>,
}

impl TxOpts {
    pub fn sender(mut self, sender: &Addr) -> Self {
        self.sender = Some(sender.clone());
        self
    }

    pub fn value(mut self, value: Wei) -> Self {
        self.value = value;
        self
    }

    pub fn gas(mut self, gas: Gas) -> Self {
        self.gas = Some(gas);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MeterMode {
    Standard,
    Disabled,
    Profiling,
}

impl MeterMode {
    fn meter(self) -> Box<dyn GasMeter> {
        match self {
            MeterMode::Standard => Box::new(StandardGasMeter),
            MeterMode::Disabled => Box::new(NoGasMeter),
            MeterMode::Profiling => Box::new(ProfilingGasMeter::new()),
        }
    }
}

pub enum ExecutionBackend {
    /// Simulation over an empty chain.
    Local(Engine),
    /// Simulation over a remote chain pinned at one block.
    Forked(Engine, Arc<ForkedBackend>),
    /// Signed transactions broadcast to a node.
    Network(NetworkEnv),
}

impl ExecutionBackend {
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionBackend::Local(_) => "local",
            ExecutionBackend::Forked(..) => "forked",
            ExecutionBackend::Network(_) => "network",
        }
    }

    pub fn engine(&self) -> Option<&Engine> {
        match self {
            ExecutionBackend::Local(e) | ExecutionBackend::Forked(e, _) => Some(e),
            ExecutionBackend::Network(_) => None,
        }
    }

    fn engine_mut(&mut self) -> Option<&mut Engine> {
        match self {
            ExecutionBackend::Local(e) | ExecutionBackend::Forked(e, _) => Some(e),
            ExecutionBackend::Network(_) => None,
        }
    }
}

/// Everything an anchor restores.
struct Saved {
    state: Option<StateSnapshot>,
    node_snapshot: Option<U256>,
    block: Option<(U256, U256)>,
    registry: ContractRegistry,
    aliases: AliasTable,
    gas_used: Gas,
    last_gas_used: Gas,
}

pub struct Env {
    config: EnvConfig,
    backend: ExecutionBackend,
    meter_mode: MeterMode,
    anchors: SnapshotManager<Saved>,
    registry: ContractRegistry,
    aliases: AliasTable,
    eoa: Addr,
    next_address: u64,
    gas_used: Gas,
    last_gas_used: Gas,
}

impl Default for Env {
    fn default() -> Self {
        Self::new(EnvConfig::default())
    }
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env")
            .field("backend", &self.backend.name())
            .field("eoa", &self.eoa)
            .field("anchors", &self.anchors.depth())
            .finish()
    }
}

impl Env {
    /// A local simulation.
    pub fn new(config: EnvConfig) -> Self {
        let exec_env = ExecEnv {
            chain_id: config.chain_id.into(),
            block: BlockInfo {
                coinbase: config.coinbase.clone(),
                timestamp: config.timestamp.into(),
                number: config.block_number.into(),
                gas_limit: config.block_gas_limit,
                base_fee: config.base_fee.into(),
                fork: config.fork,
                ..Default::default()
            },
            hooks: Arc::new(HookTable::with_builtins()),
        };
        let engine = Engine::new(exec_env, Arc::new(EmptyState));
        let mut env = Self::with_backend(config, ExecutionBackend::Local(engine));
        env.eoa = env.generate_address(Some("eoa"));
        env.fund_eoa();
        env
    }

    /// An environment broadcasting through `network`. The default sender is the first account
    /// with a known key.
    pub fn network(network: NetworkEnv) -> Self {
        let eoa = network.first_account().cloned().unwrap_or_default();
        let mut env = Self::with_backend(
            EnvConfig::default(),
            ExecutionBackend::Network(network),
        );
        env.eoa = eoa;
        env
    }

    fn with_backend(config: EnvConfig, backend: ExecutionBackend) -> Self {
        Self {
            config,
            backend,
            meter_mode: MeterMode::Standard,
            anchors: SnapshotManager::new(),
            registry: ContractRegistry::new(),
            aliases: AliasTable::new(),
            eoa: Addr::zero().clone(),
            next_address: 0,
            gas_used: 0,
            last_gas_used: 0,
        }
    }

    pub fn into_shared(self) -> SharedEnv {
        Rc::new(RefCell::new(self))
    }

    fn fund_eoa(&mut self) {
        let (eoa, balance) = (self.eoa.clone(), self.config.eoa_balance.clone());
        if let Some(e) = self.backend.engine_mut() {
            e.state_mut().set_balance(&eoa, balance);
        }
    }

    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    pub fn backend(&self) -> &ExecutionBackend {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut ExecutionBackend {
        &mut self.backend
    }

    pub fn is_network(&self) -> bool {
        matches!(self.backend, ExecutionBackend::Network(_))
    }

    fn engine_mut(&mut self, op: &str) -> Result<&mut Engine> {
        let name = self.backend.name();
        self.backend.engine_mut().ok_or_else(|| {
            Error::UnsupportedOperation(format!("{} in {} mode", op, name))
        })
    }

    // forking

    /// Fork the chain behind `url`. Local writes made so far are dropped.
    pub fn fork(&mut self, url: &str, config: &ForkConfig) -> Result<()> {
        let client = RpcClient::http(url, config.retry.clone())?;
        self.fork_rpc(Arc::new(client), config)
    }

    pub fn fork_rpc(
        &mut self, client: Arc<RpcClient>, config: &ForkConfig,
    ) -> Result<()> {
        if self.anchors.depth() > 0 {
            return Err(Error::SnapshotDiscipline(format!(
                "cannot fork with {} anchor(s) open",
                self.anchors.depth()
            )))
        }
        let backend = Arc::new(ForkedBackend::connect(client, config)?);
        let pinned = backend.block().clone();
        let hooks = match self.backend.engine() {
            Some(e) => e.env.hooks.clone(),
            None => Arc::new(HookTable::with_builtins()),
        };
        let exec_env = ExecEnv {
            chain_id: pinned.chain_id,
            block: BlockInfo {
                coinbase: pinned
                    .coinbase
                    .clone()
                    .unwrap_or_else(|| self.config.coinbase.clone()),
                timestamp: pinned.timestamp,
                number: pinned.number.into(),
                gas_limit: pinned.gas_limit.unwrap_or(self.config.block_gas_limit),
                base_fee: pinned.base_fee.unwrap_or_default(),
                fork: self.config.fork,
                ..Default::default()
            },
            hooks,
        };
        let mut engine = Engine::new(exec_env, backend.clone());
        engine.set_gas_meter(self.meter_mode.meter());
        self.backend = ExecutionBackend::Forked(engine, backend);
        self.fund_eoa();
        info!("env forked at block {} of chain {}", pinned.number, pinned.chain_id);
        Ok(())
    }

    /// The pinned block, when forked.
    pub fn fork_info(&self) -> Option<&PinnedBlock> {
        match &self.backend {
            ExecutionBackend::Forked(_, b) => Some(b.block()),
            _ => None,
        }
    }

    // chain metadata

    pub fn chain_id(&self) -> U256 {
        match &self.backend {
            ExecutionBackend::Local(e) | ExecutionBackend::Forked(e, _) => {
                e.env.chain_id
            }
            ExecutionBackend::Network(n) => *n.chain_id(),
        }
    }

    pub fn block_number(&self) -> Result<u64> {
        match &self.backend {
            ExecutionBackend::Local(e) | ExecutionBackend::Forked(e, _) => {
                Ok(e.env.block.number.low_u64())
            }
            ExecutionBackend::Network(n) => n.block_number(),
        }
    }

    pub fn timestamp(&self) -> Result<u64> {
        match &self.backend {
            ExecutionBackend::Local(e) | ExecutionBackend::Forked(e, _) => {
                Ok(e.env.block.timestamp.low_u64())
            }
            ExecutionBackend::Network(n) => n.timestamp(),
        }
    }

    /// Move the simulated clock forward by exactly one of `seconds` or `blocks`; the other one
    /// follows from `block_delta` seconds per block.
    pub fn time_travel(
        &mut self, seconds: Option<u64>, blocks: Option<u64>, block_delta: u64,
    ) -> Result<()> {
        if block_delta == 0 {
            return Err(Error::InvalidInput("block_delta must be positive".into()))
        }
        let (seconds, blocks) = match (seconds, blocks) {
            (Some(s), None) => (s, s / block_delta),
            (None, Some(b)) => (
                b.checked_mul(block_delta).ok_or_else(|| {
                    Error::InvalidInput("time travel overflows".into())
                })?,
                b,
            ),
            _ => {
                return Err(Error::InvalidInput(
                    "exactly one of seconds and blocks must be given".into(),
                ))
            }
        };
        let e = self.engine_mut("time_travel")?;
        e.env.block.timestamp = e.env.block.timestamp.saturating_add(seconds.into());
        e.env.block.number = e.env.block.number.saturating_add(blocks.into());
        debug!(
            "time travel to block {} at {}",
            e.env.block.number, e.env.block.timestamp
        );
        Ok(())
    }

    // senders and addresses

    /// The default sender.
    pub fn eoa(&self) -> &Addr {
        &self.eoa
    }

    pub fn set_eoa(&mut self, addr: &Addr) {
        self.eoa = addr.clone();
    }

    /// Use `addr` as the default sender until the guard is dropped.
    pub fn prank(&mut self, addr: &Addr) -> PrankGuard<'_> {
        let prev = std::mem::replace(&mut self.eoa, addr.clone());
        PrankGuard { env: self, prev }
    }

    /// A fresh address, deterministic for a given seed and call order.
    pub fn generate_address(&mut self, alias: Option<&str>) -> Addr {
        let seed = format!("qenv:{}:{}", self.config.seed, self.next_address);
        self.next_address += 1;
        let addr = Addr::from_seed(seed.as_bytes());
        if let Some(name) = alias {
            self.aliases.set(&addr, name);
        }
        addr
    }

    // execution

    fn record_gas<T>(&mut self, res: &Result<T>, gas_used: impl Fn(&T) -> Gas) {
        let used = match res {
            Ok(v) => gas_used(v),
            Err(e) => match e.failure() {
                Some(f) => f.gas_used,
                None => return,
            },
        };
        self.last_gas_used = used;
        if self.meter_mode != MeterMode::Disabled {
            self.gas_used = self.gas_used.saturating_add(used);
        }
    }

    /// Deploy `bytecode` with `ctor_args` appended. Deployments of registered blueprints are
    /// registered as contracts.
    pub fn deploy(
        &mut self, bytecode: &[u8], ctor_args: &[u8], opts: &TxOpts,
    ) -> Result<Deployed> {
        self.deploy_(bytecode, ctor_args, None, opts)
    }

    /// Like [deploy](Self::deploy), but the constructor runs at (and the code is placed at)
    /// `address`.
    pub fn deploy_at(
        &mut self, bytecode: &[u8], ctor_args: &[u8], address: &Addr,
        opts: &TxOpts,
    ) -> Result<Deployed> {
        self.deploy_(bytecode, ctor_args, Some(address.clone()), opts)
    }

    fn deploy_(
        &mut self, bytecode: &[u8], ctor_args: &[u8], create_at: Option<Addr>,
        opts: &TxOpts,
    ) -> Result<Deployed> {
        let sender = opts.sender.clone().unwrap_or_else(|| self.eoa.clone());
        let res = match &mut self.backend {
            ExecutionBackend::Network(n) => {
                if create_at.is_some() {
                    return Err(Error::UnsupportedOperation(
                        "deploying at a chosen address in network mode".into(),
                    ))
                }
                n.deploy(&sender, bytecode, ctor_args, opts.value.clone(), opts.gas)
            }
            ExecutionBackend::Local(e) | ExecutionBackend::Forked(e, _) => {
                let mut data = bytecode.to_vec();
                data.extend_from_slice(ctor_args);
                e.execute(Message {
                    from: sender,
                    to: None,
                    value: opts.value.clone(),
                    gas: opts.gas.unwrap_or(self.config.default_gas),
                    data: data.into(),
                    is_static: false,
                    create_at,
                })
                .and_then(|r| {
                    Ok(Deployed {
                        address: r.contract.ok_or_else(|| {
                            Error::InvalidInput("deployment created nothing".into())
                        })?,
                        output: r.output,
                        gas_used: r.gas_used,
                        logs: r.logs,
                    })
                })
            }
        };
        self.record_gas(&res, |d| d.gas_used);
        let deployed = res?;
        if let Some(bp) = self.registry.lookup_blueprint(&Hash::hash(bytecode)) {
            let contract = RegisteredContract {
                address: deployed.address.clone(),
                name: bp.name.clone(),
                code_hash: Hash::hash(&deployed.output),
                abi: bp.abi.clone(),
            };
            self.registry.register(contract);
        }
        debug!("deployed {} ({} gas)", deployed.address, deployed.gas_used);
        Ok(deployed)
    }

    /// Place runtime `code` at `address` (a fresh one if `None`) without running a constructor.
    pub fn deploy_code(
        &mut self, code: &[u8], address: Option<&Addr>,
    ) -> Result<Addr> {
        self.engine_mut("deploy_code")?;
        let address = match address {
            Some(a) => a.clone(),
            None => self.generate_address(None),
        };
        self.set_code(&address, code)?;
        Ok(address)
    }

    /// Call `to`. A non-modifying call runs as a static call: the sender's nonce is untouched and
    /// nothing can be written.
    pub fn call(
        &mut self, to: &Addr, calldata: &[u8], opts: &TxOpts,
        is_modifying: bool,
    ) -> Result<CallOutput> {
        let sender = opts.sender.clone().unwrap_or_else(|| self.eoa.clone());
        let gas = opts.gas.unwrap_or(self.config.default_gas);
        let res = match &mut self.backend {
            ExecutionBackend::Network(n) => n.call(
                &sender,
                to,
                calldata,
                opts.value.clone(),
                opts.gas,
                is_modifying,
            ),
            ExecutionBackend::Local(e) | ExecutionBackend::Forked(e, _) => e.call(
                &sender,
                to,
                calldata,
                opts.value.clone(),
                gas,
                !is_modifying,
            ),
        };
        self.record_gas(&res, |r| r.gas_used);
        res
    }

    // raw state access

    pub fn get_balance(&self, addr: &Addr) -> Result<Wei> {
        match &self.backend {
            ExecutionBackend::Local(e) | ExecutionBackend::Forked(e, _) => {
                Ok(e.state().balance(addr)?)
            }
            ExecutionBackend::Network(n) => n.get_balance(addr),
        }
    }

    pub fn set_balance(&mut self, addr: &Addr, balance: Wei) -> Result<()> {
        self.engine_mut("set_balance")?
            .state_mut()
            .set_balance(addr, balance);
        Ok(())
    }

    pub fn get_nonce(&self, addr: &Addr) -> Result<u64> {
        match &self.backend {
            ExecutionBackend::Local(e) | ExecutionBackend::Forked(e, _) => {
                Ok(e.state().nonce(addr)?)
            }
            ExecutionBackend::Network(n) => n.get_nonce(addr),
        }
    }

    pub fn set_nonce(&mut self, addr: &Addr, nonce: u64) -> Result<()> {
        self.engine_mut("set_nonce")?.state_mut().set_nonce(addr, nonce);
        Ok(())
    }

    pub fn get_code(&self, addr: &Addr) -> Result<Bytes> {
        match &self.backend {
            ExecutionBackend::Local(e) | ExecutionBackend::Forked(e, _) => {
                Ok(e.state().code(addr)?.as_bytes().into())
            }
            ExecutionBackend::Network(n) => n.get_code(addr),
        }
    }

    pub fn set_code(&mut self, addr: &Addr, code: &[u8]) -> Result<()> {
        self.engine_mut("set_code")?
            .state_mut()
            .set_code(addr, Arc::new(PlainCode::new(code.into())));
        Ok(())
    }

    pub fn get_storage(&self, addr: &Addr, slot: &U256) -> Result<U256> {
        let key = Hash::from(*slot);
        match &self.backend {
            ExecutionBackend::Local(e) | ExecutionBackend::Forked(e, _) => {
                Ok(e.state().storage(addr, &key)?)
            }
            ExecutionBackend::Network(n) => n.get_storage(addr, &key),
        }
    }

    pub fn set_storage(
        &mut self, addr: &Addr, slot: &U256, value: U256,
    ) -> Result<()> {
        self.engine_mut("set_storage")?.state_mut().set_storage(
            addr,
            &Hash::from(*slot),
            value,
        );
        Ok(())
    }

    // gas

    fn set_meter(&mut self, mode: MeterMode) {
        self.meter_mode = mode;
        if let Some(e) = self.backend.engine_mut() {
            e.set_gas_meter(mode.meter());
        }
    }

    /// Meter gas normally and collect per-instruction statistics.
    pub fn enable_gas_profiling(&mut self) {
        self.set_meter(MeterMode::Profiling)
    }

    /// Stop enforcing gas limits; reported gas usage becomes zero.
    pub fn disable_gas_metering(&mut self) {
        self.set_meter(MeterMode::Disabled)
    }

    pub fn reset_gas_metering_behavior(&mut self) {
        self.set_meter(MeterMode::Standard)
    }

    /// Statistics collected since profiling was enabled.
    pub fn gas_profile(&self) -> Option<GasProfile> {
        self.backend.engine()?.gas_meter().profile().cloned()
    }

    /// Gas used by the latest deployment or call, failed ones included.
    pub fn last_gas_used(&self) -> Gas {
        self.last_gas_used
    }

    /// Gas used by every metered deployment and call since the last reset.
    pub fn gas_used(&self) -> Gas {
        self.gas_used
    }

    pub fn reset_gas_used(&mut self) {
        self.gas_used = 0;
        self.last_gas_used = 0;
    }

    // hooks

    fn update_hooks(
        &mut self, op: &str, f: impl FnOnce(&HookTable) -> Result<HookTable>,
    ) -> Result<()> {
        let e = self.engine_mut(op)?;
        let hooks = f(e.hooks())?;
        e.set_hooks(hooks);
        Ok(())
    }

    pub fn register_precompile(
        &mut self, addr: &Addr, contract: Arc<dyn PrecompiledContract>,
    ) -> Result<()> {
        self.update_hooks("register_precompile", |h| {
            if h.has_precompile(addr) {
                return Err(Error::InvalidInput(format!(
                    "precompile already registered at {}",
                    addr
                )))
            }
            Ok(h.clone().with_precompile(addr.clone(), contract))
        })
    }

    pub fn deregister_precompile(&mut self, addr: &Addr) -> Result<()> {
        self.update_hooks("deregister_precompile", |h| {
            if !h.has_precompile(addr) {
                return Err(Error::InvalidInput(format!(
                    "no precompile registered at {}",
                    addr
                )))
            }
            Ok(h.clone().without_precompile(addr))
        })
    }

    /// Run `hook` before (or instead of) every execution of `opcode`.
    pub fn patch_opcode(&mut self, opcode: u8, hook: OpcodeHook) -> Result<()> {
        self.update_hooks("patch_opcode", |h| {
            Ok(h.clone().with_opcode(opcode, hook))
        })
    }

    pub fn unpatch_opcode(&mut self, opcode: u8) -> Result<()> {
        self.update_hooks("unpatch_opcode", |h| Ok(h.clone().without_opcode(opcode)))
    }

    // registry

    pub fn register_contract(
        &mut self, address: &Addr, name: &str, abi: Option<serde_json::Value>,
    ) -> Result<()> {
        let code = self.get_code(address)?;
        self.registry.register(RegisteredContract {
            address: address.clone(),
            name: name.to_string(),
            code_hash: Hash::hash(&code),
            abi,
        });
        Ok(())
    }

    /// Declare the contract type deployed by `bytecode`.
    pub fn register_blueprint(
        &mut self, bytecode: &[u8], name: &str, abi: Option<serde_json::Value>,
    ) -> Hash {
        self.registry.register_blueprint(bytecode, name, abi)
    }

    pub fn lookup_contract(&self, addr: &Addr) -> Option<&RegisteredContract> {
        self.registry.lookup(addr)
    }

    pub fn registry(&self) -> &ContractRegistry {
        &self.registry
    }

    pub fn alias(&mut self, addr: &Addr, name: &str) {
        self.aliases.set(addr, name)
    }

    pub fn lookup_alias(&self, addr: &Addr) -> Option<&str> {
        self.aliases.name_of(addr)
    }

    pub fn lookup_address(&self, name: &str) -> Option<&Addr> {
        self.aliases.address_of(name)
    }

    // anchors

    /// Open an anchor; [anchor_exit](Self::anchor_exit) must be called with the returned handle
    /// before any outer anchor is exited.
    pub fn anchor_enter(&mut self) -> Result<SnapshotHandle> {
        let (state, node_snapshot, block) = match &mut self.backend {
            ExecutionBackend::Local(e) | ExecutionBackend::Forked(e, _) => (
                Some(e.state().snapshot()),
                None,
                Some((e.env.block.number, e.env.block.timestamp)),
            ),
            ExecutionBackend::Network(n) => (None, Some(n.snapshot()?), None),
        };
        let handle = self.anchors.enter(Saved {
            state,
            node_snapshot,
            block,
            registry: self.registry.clone(),
            aliases: self.aliases.clone(),
            gas_used: self.gas_used,
            last_gas_used: self.last_gas_used,
        });
        debug!("anchor {} entered", handle.depth());
        Ok(handle)
    }

    /// Restore what was captured by `handle`, which must be the innermost open anchor.
    pub fn anchor_exit(&mut self, handle: SnapshotHandle) -> Result<()> {
        let saved = self.anchors.exit(handle)?;
        let reverted = match &mut self.backend {
            ExecutionBackend::Local(e) | ExecutionBackend::Forked(e, _) => {
                if let Some(s) = saved.state {
                    e.state_mut().restore(s);
                }
                if let Some((number, timestamp)) = saved.block {
                    e.env.block.number = number;
                    e.env.block.timestamp = timestamp;
                }
                Ok(())
            }
            ExecutionBackend::Network(n) => match saved.node_snapshot {
                Some(id) => n.revert(&id),
                None => Ok(()),
            },
        };
        // local bookkeeping is restored even when the node refused to revert
        self.registry = saved.registry;
        self.aliases = saved.aliases;
        self.gas_used = saved.gas_used;
        self.last_gas_used = saved.last_gas_used;
        match reverted {
            Ok(()) => {
                debug!("anchor {} exited", handle.depth());
                Ok(())
            }
            Err(e) => {
                warn!("anchor {} exited without reverting the node: {}", handle.depth(), e);
                Err(e)
            }
        }
    }

    /// Open an anchor that is released when the guard is dropped.
    pub fn anchor(&mut self) -> Result<AnchorGuard<'_>> {
        let handle = self.anchor_enter()?;
        Ok(AnchorGuard {
            env: self,
            handle,
            released: false,
        })
    }

    /// Number of open anchors.
    pub fn anchor_depth(&self) -> usize {
        self.anchors.depth()
    }
}

/// Restores the environment captured by [Env::anchor] when dropped.
pub struct AnchorGuard<'a> {
    env: &'a mut Env,
    handle: SnapshotHandle,
    released: bool,
}

impl<'a> AnchorGuard<'a> {
    pub fn handle(&self) -> SnapshotHandle {
        self.handle
    }

    /// Release now, reporting failures that dropping would only log.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.env.anchor_exit(self.handle)
    }
}

impl<'a> Deref for AnchorGuard<'a> {
    type Target = Env;

    fn deref(&self) -> &Env {
        self.env
    }
}

impl<'a> DerefMut for AnchorGuard<'a> {
    fn deref_mut(&mut self) -> &mut Env {
        self.env
    }
}

impl<'a> Drop for AnchorGuard<'a> {
    fn drop(&mut self) {
        if self.released {
            return
        }
        if let Err(e) = self.env.anchor_exit(self.handle) {
            error!("failed to release anchor {}: {}", self.handle.depth(), e);
        }
    }
}

/// Restores the default sender replaced by [Env::prank] when dropped.
pub struct PrankGuard<'a> {
    env: &'a mut Env,
    prev: Addr,
}

impl<'a> Deref for PrankGuard<'a> {
    type Target = Env;

    fn deref(&self) -> &Env {
        self.env
    }
}

impl<'a> DerefMut for PrankGuard<'a> {
    fn deref_mut(&mut self) -> &mut Env {
        self.env
    }
}

impl<'a> Drop for PrankGuard<'a> {
    fn drop(&mut self) {
        self.env.eoa = self.prev.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_travel() {
        let mut env = Env::default();
        let (n, t) = (env.block_number().unwrap(), env.timestamp().unwrap());
        env.time_travel(Some(120), None, DEFAULT_BLOCK_DELTA).unwrap();
        assert_eq!(env.block_number().unwrap(), n + 10);
        assert_eq!(env.timestamp().unwrap(), t + 120);
        env.time_travel(None, Some(2), 5).unwrap();
        assert_eq!(env.block_number().unwrap(), n + 12);
        assert_eq!(env.timestamp().unwrap(), t + 130);
        assert!(env.time_travel(Some(1), Some(1), 12).is_err());
        assert!(env.time_travel(None, None, 12).is_err());
        assert!(env.time_travel(Some(1), None, 0).is_err());
    }

    #[test]
    fn test_generate_address() {
        let mut a = Env::default();
        let mut b = Env::default();
        let x = a.generate_address(Some("x"));
        assert_eq!(x, b.generate_address(None));
        assert_ne!(x, a.generate_address(None));
        assert_eq!(a.lookup_alias(&x), Some("x"));
        assert_eq!(a.lookup_address("eoa"), Some(a.eoa()));
        let other = Env::new(EnvConfig {
            seed: 7,
            ..Default::default()
        });
        assert_ne!(other.eoa(), a.eoa());
    }

    #[test]
    fn test_prank_restores_sender() {
        let mut env = Env::default();
        let eoa = env.eoa().clone();
        let other = Addr::from(0x1234);
        {
            let g = env.prank(&other);
            assert_eq!(g.eoa(), &other);
        }
        assert_eq!(env.eoa(), &eoa);
    }

    #[test]
    fn test_anchor_restores_metadata() {
        let mut env = Env::default();
        let a = Addr::from(5);
        {
            let mut g = env.anchor().unwrap();
            g.alias(&a, "five");
            g.time_travel(None, Some(3), 12).unwrap();
            g.set_balance(&a, Wei::from(9)).unwrap();
            assert_eq!(g.anchor_depth(), 1);
        }
        assert_eq!(env.anchor_depth(), 0);
        assert_eq!(env.lookup_alias(&a), None);
        assert_eq!(env.block_number().unwrap(), 1);
        assert!(env.get_balance(&a).unwrap().is_zero());
    }
}
