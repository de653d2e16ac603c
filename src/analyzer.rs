//! Static bytecode analyzer — selector catalogue, dangerous opcodes,
//! ownership probing. Produces the base security report that every later
//! stage enriches.
//!
//! The selector table below is part of the external contract: labels,
//! selectors, and weights are stable and must not be renamed.

use crate::errors::OracleError;
use crate::harness::{self, NullObserver, RunConfig};
use crate::oracle::ChainOracle;
use crate::proxy::proxy_flag;
use crate::types::{canonical_address, OwnershipStatus, ProxyInfo, SecurityReport};
use alloy_primitives::{Address, Bytes, U256};
use lazy_static::lazy_static;
use std::collections::HashMap;
use tracing::debug;

/// `owner()` selector.
pub const OWNER_SELECTOR: [u8; 4] = [0x8d, 0xa5, 0xcb, 0x5b];

#[derive(Debug, Clone, Copy)]
pub struct SelectorRule {
    pub label: &'static str,
    pub selector: &'static str,
    pub weight: u32,
}

lazy_static! {
    /// Known-dangerous function selectors with fixed risk weights.
    pub static ref SELECTOR_TABLE: Vec<SelectorRule> = vec![
        SelectorRule { label: "blacklist(address)", selector: "f9f92be4", weight: 50 },
        SelectorRule { label: "pause()", selector: "8456cb59", weight: 30 },
        SelectorRule { label: "_pause()", selector: "2f2b3887", weight: 30 },
        SelectorRule { label: "enableTrading()", selector: "8a8c523c", weight: 20 },
        SelectorRule { label: "openTrading()", selector: "c9044b7d", weight: 20 },
        SelectorRule { label: "setFee(uint256)", selector: "69fe0e2d", weight: 25 },
        SelectorRule { label: "setTaxFeePercent(uint256)", selector: "061c82d0", weight: 25 },
        SelectorRule { label: "setMarketingFee(uint256)", selector: "2323cc66", weight: 20 },
        SelectorRule { label: "updateFees(uint256,uint256)", selector: "37b8d80f", weight: 20 },
        SelectorRule { label: "mint(address,uint256)", selector: "40c10f19", weight: 60 },
        SelectorRule { label: "_mint(address,uint256)", selector: "9c0f929c", weight: 60 },
        SelectorRule { label: "removeLiquidity", selector: "78265506", weight: 90 },
        SelectorRule { label: "removeLiquidityETH", selector: "af2979eb", weight: 90 },
        SelectorRule { label: "drain()", selector: "d040220a", weight: 100 },
        SelectorRule { label: "withdrawETH()", selector: "474cf53d", weight: 50 },
        SelectorRule { label: "_transfer", selector: "30e0789e", weight: 40 },
        SelectorRule { label: "_beforeTokenTransfer", selector: "38d52e0f", weight: 30 },
        SelectorRule { label: "setMaxTxAmount", selector: "83151877", weight: 20 },
    ];
}

/// Dangerous opcodes scanned for in the raw code body.
const DANGEROUS_OPCODES: &[(u8, &str, u32)] = &[
    (0xFF, "Dangerous Opcode: SELFDESTRUCT", 40),
    (0xF4, "Dangerous Opcode: DELEGATECALL", 15),
    (0xF2, "Dangerous Opcode: CALLCODE", 15),
];

/// Scan deployed code and the proxy classification into a base report.
/// Ownership and simulation results are applied separately.
pub fn analyze(code: &[u8], proxy_info: &ProxyInfo) -> SecurityReport {
    let mut report = SecurityReport::new(proxy_info.clone());

    if let Some((flag, weight)) = proxy_flag(proxy_info.proxy_kind) {
        report.add_flag(flag, weight);
    }

    let code_hex = hex::encode(code);
    for rule in SELECTOR_TABLE.iter() {
        if code_hex.contains(rule.selector) {
            report.add_flag(format!("Suspicious Function: {}", rule.label), rule.weight);
            // Deliberately aggressive default; the verdict assembler may
            // still soften the final call downstream.
            report.is_honeypot = true;
        }
    }

    for (opcode, flag, weight) in DANGEROUS_OPCODES {
        if code.contains(opcode) {
            report.add_flag(*flag, *weight);
        }
    }

    report
}

/// Record the baseline simulation outcome on the report.
pub fn apply_baseline_revert(report: &mut SecurityReport) {
    report.add_flag("Transaction Reverted in Simulation", 20);
}

// ── Ownership ───────────────────────────────────────────────────

/// Interpret an `owner()` return: take the last 20 bytes of a ≥20-byte
/// return, `None` for anything shorter.
fn interpret_owner_return(ret: &[u8]) -> Option<Address> {
    if ret.len() < 20 {
        return None;
    }
    Some(Address::from_slice(&ret[ret.len() - 20..]))
}

/// Call `owner()` inside the forked EVM against the preloaded state.
pub fn owner_via_harness(
    chain_id: u64,
    to: Address,
    code: &Bytes,
    preloaded_storage: &HashMap<U256, U256>,
    extra_accounts: &[(Address, Bytes)],
    timestamp: u64,
) -> Option<Address> {
    let probe_sender = Address::from_slice(&[0x51u8; 20]);
    let mut cfg = RunConfig::new(to, code.clone(), probe_sender, Bytes::from(OWNER_SELECTOR.to_vec()));
    cfg.chain_id = chain_id;
    cfg.preloaded_storage = preloaded_storage.clone();
    cfg.extra_accounts = extra_accounts.to_vec();
    cfg.block.timestamp = timestamp;

    let outcome = harness::run(&cfg, &mut NullObserver).ok()?;
    if !outcome.is_success() {
        return None;
    }
    interpret_owner_return(outcome.return_value.as_ref())
}

/// Resolve ownership: forked-EVM `owner()` first, then a direct chain
/// `static_call` when the fork answered empty or zero.
pub async fn resolve_ownership(
    oracle: &dyn ChainOracle,
    chain_id: u64,
    to: Address,
    harness_owner: Option<Address>,
) -> (OwnershipStatus, Option<Address>) {
    let mut owner = harness_owner;

    if owner.map_or(true, |a| a == Address::ZERO) {
        match oracle.static_call(chain_id, to, Bytes::from(OWNER_SELECTOR.to_vec())).await {
            Ok(ret) if !ret.is_empty() => {
                if let Some(addr) = interpret_owner_return(ret.as_ref()) {
                    owner = Some(addr);
                }
            }
            Ok(_) => {}
            Err(e) => {
                if !matches!(e, OracleError::NotReachable) {
                    debug!(error = %e, "on-chain owner() probe degraded");
                }
            }
        }
    }

    match owner {
        Some(addr) if addr == Address::ZERO => (OwnershipStatus::Renounced, Some(addr)),
        Some(addr) => (OwnershipStatus::Centralized, Some(addr)),
        None => (OwnershipStatus::Unknown, None),
    }
}

/// Apply resolved ownership to the report: Renounced ⇔ owner is the zero
/// address, Centralized ⇔ a non-zero owner resolved.
pub fn apply_ownership(report: &mut SecurityReport, status: OwnershipStatus, owner: Option<Address>) {
    report.ownership_status = status;
    match status {
        OwnershipStatus::Renounced => {
            report.owner = Some(canonical_address(&Address::ZERO));
            report.add_flag("Ownership Renounced (Safe)", 0);
        }
        OwnershipStatus::Centralized => {
            if let Some(addr) = owner {
                let addr_hex = canonical_address(&addr);
                report.owner = Some(addr_hex.clone());
                report.add_flag(format!("Contract has an Owner: {addr_hex}"), 10);
            }
        }
        OwnershipStatus::Unknown => {
            report.owner = None;
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────
