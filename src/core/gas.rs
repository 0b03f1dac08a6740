//! Pluggable gas accounting strategies.
//!
//! The interpreter always computes instruction costs; a [GasMeter] decides whether those costs
//! are enforced (deducted from the frame budget, failing with out-of-gas) and may observe them.
//! Meters can be swapped between executions without touching the account state.
use std::collections::BTreeMap;

use crate::common::{Addr, Gas};

/// Location of a CALL-family instruction.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallSite {
    pub caller: Addr,
    pub pc: u64,
    pub callee: Addr,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PcStats {
    pub opcode: u8,
    pub count: u64,
    pub gas: Gas,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallStats {
    pub count: u64,
    pub total_gas: Gas,
    pub min_gas: Gas,
    pub max_gas: Gas,
}

impl CallStats {
    fn record(&mut self, gas: Gas) {
        self.count += 1;
        self.total_gas = self.total_gas.saturating_add(gas);
        self.min_gas = self.min_gas.min(gas);
        self.max_gas = self.max_gas.max(gas);
    }
}

/// Statistics accumulated by [ProfilingGasMeter].
#[derive(Clone, Debug, Default)]
pub struct GasProfile {
    /// Keyed by (contract address, program counter).
    pub by_pc: BTreeMap<(Addr, u64), PcStats>,
    pub by_call_site: BTreeMap<CallSite, CallStats>,
}

impl GasProfile {
    /// Total gas attributed to the instructions of one contract.
    pub fn contract_total(&self, addr: &Addr) -> Gas {
        self.by_pc
            .iter()
            .filter(|((a, _), _)| a == addr)
            .map(|(_, s)| s.gas)
            .sum()
    }
}

pub trait GasMeter: Send {
    /// Whether instruction costs are deducted from (and bounded by) the gas limit.
    fn enforces(&self) -> bool {
        true
    }

    /// Called after each instruction that completed within its own frame.
    fn on_instruction(
        &mut self, _addr: &Addr, _pc: u64, _opcode: u8, _cost: Gas,
    ) {
    }

    /// Called when a sub-call returns to `site`, with the gas consumed by the callee.
    fn on_call_end(&mut self, _site: &CallSite, _gas_used: Gas) {}

    fn profile(&self) -> Option<&GasProfile> {
        None
    }

    fn name(&self) -> &'static str;
}

/// Ordinary EVM metering.
#[derive(Default)]
pub struct StandardGasMeter;

impl GasMeter for StandardGasMeter {
    fn name(&self) -> &'static str {
        "standard"
    }
}

/// Never runs out of gas; reported gas usage is zero.
#[derive(Default)]
pub struct NoGasMeter;

impl GasMeter for NoGasMeter {
    fn enforces(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

/// Standard metering plus per-pc and per-call-site statistics.
#[derive(Default)]
pub struct ProfilingGasMeter {
    profile: GasProfile,
}

impl ProfilingGasMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_profile(self) -> GasProfile {
        self.profile
    }
}

impl GasMeter for ProfilingGasMeter {
    fn on_instruction(&mut self, addr: &Addr, pc: u64, opcode: u8, cost: Gas) {
        let stats = self
            .profile
            .by_pc
            .entry((addr.clone(), pc))
            .or_insert_with(|| PcStats {
                opcode,
                ..Default::default()
            });
        stats.count += 1;
        stats.gas = stats.gas.saturating_add(cost);
    }

    fn on_call_end(&mut self, site: &CallSite, gas_used: Gas) {
        self.profile
            .by_call_site
            .entry(site.clone())
            .or_insert(CallStats {
                count: 0,
                total_gas: 0,
                min_gas: Gas::MAX,
                max_gas: 0,
            })
            .record(gas_used);
    }

    fn profile(&self) -> Option<&GasProfile> {
        Some(&self.profile)
    }

    fn name(&self) -> &'static str {
        "profiling"
    }
}

#[test]
fn test_profiling_meter() {
    let mut m = ProfilingGasMeter::new();
    let a = Addr::from(1);
    m.on_instruction(&a, 0, 0x60, 3);
    m.on_instruction(&a, 0, 0x60, 3);
    m.on_instruction(&a, 2, 0x01, 3);
    let site = CallSite {
        caller: a.clone(),
        pc: 7,
        callee: Addr::from(2),
    };
    m.on_call_end(&site, 100);
    m.on_call_end(&site, 40);
    let p = m.profile().unwrap();
    assert_eq!(p.by_pc[&(a.clone(), 0)].count, 2);
    assert_eq!(p.contract_total(&a), 9);
    let s = &p.by_call_site[&site];
    assert_eq!((s.count, s.total_gas, s.min_gas, s.max_gas), (2, 140, 40, 100));
    assert!(StandardGasMeter.enforces());
    assert!(!NoGasMeter.enforces());
}
