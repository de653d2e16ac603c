//! Multi-scenario simulation battery.
//!
//! Two independent families share one prefetched bytecode: time-travel
//! (same sender, shifted block timestamps) and counterfactual (same
//! timestamp, different senders). Every sub-run gets its own freshly
//! built EVM, so the whole fan-out is free to execute concurrently.
//!
//! Divergences between outcomes — not the outcomes themselves — are the
//! scam signals.

use crate::errors::EvmError;
use crate::harness::{self, NullObserver, RunConfig};
use crate::types::{
    ActorRole, ActorRun, BatteryResult, CounterfactualResult, DiffSeverity, Outcome, PrivilegeDiff,
    TimeTravelResult, TimeTravelRun, canonical_address,
};
use alloy_primitives::{keccak256, Address, Bytes, U256};
use futures::future;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Canonical timestamp offsets probed by the time-travel family.
pub const TIME_OFFSETS: [(i64, &str); 5] = [
    (3_600, "+1 Hour"),
    (86_400, "+1 Day"),
    (604_800, "+7 Days"),
    (2_592_000, "+30 Days"),
    (-86_400, "-1 Day"),
];

/// Token amount written across the balance probe slots for each actor.
fn actor_token_grant() -> U256 {
    U256::from(10u64).pow(U256::from(24u64))
}

/// Shared, read-only input for every sub-run of one battery.
#[derive(Debug, Clone)]
pub struct BatteryInput {
    pub chain_id: u64,
    /// Code installed at the target (implementation code when re-homed).
    pub code: Bytes,
    pub extra_accounts: Vec<(Address, Bytes)>,
    pub preloaded_storage: HashMap<U256, U256>,
    pub sender: Address,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub owner: Option<Address>,
    /// Caller-supplied allowlisted addresses; the core discovers none itself.
    pub whitelisted: Vec<Address>,
    /// Pinned wall-clock seconds — every offset is relative to this.
    pub now: u64,
    pub gas_limit: u64,
}

/// The counterfactual "random user" is derived deterministically from the
/// request so that repeated scans stay bit-identical.
pub fn derive_random_actor(input: &BatteryInput) -> Address {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(input.sender.as_slice());
    seed.extend_from_slice(input.to.as_slice());
    seed.extend_from_slice(&input.chain_id.to_be_bytes());
    seed.extend_from_slice(b"counterfactual-actor");
    Address::from_slice(&keccak256(seed).0[12..32])
}

fn run_config_for(input: &BatteryInput, actor: Address, impersonate_owner: bool, timestamp: u64) -> RunConfig {
    let mut cfg = RunConfig::new(input.to, input.code.clone(), actor, input.data.clone());
    cfg.chain_id = input.chain_id;
    cfg.preloaded_storage = input.preloaded_storage.clone();
    cfg.extra_accounts = input.extra_accounts.clone();
    cfg.value = input.value;
    cfg.gas_limit = input.gas_limit;
    cfg.block.timestamp = timestamp;
    cfg.balance_injections.insert(actor, actor_token_grant());
    if impersonate_owner {
        cfg.owner_injection = Some(actor);
    }
    cfg
}

fn shifted_timestamp(now: u64, offset: i64) -> u64 {
    if offset >= 0 {
        now.saturating_add(offset as u64)
    } else {
        now.saturating_sub(offset.unsigned_abs())
    }
}

/// Run the full battery. Only a harness invariant break (or a panic in a
/// sub-run) is fatal; any other sub-run failure shrinks the result set.
pub async fn run(input: Arc<BatteryInput>) -> Result<BatteryResult, EvmError> {
    let (time_travel, counterfactual) =
        tokio::join!(run_time_travel(input.clone()), run_counterfactual(input.clone()));
    let time_travel = time_travel?;
    let counterfactual = counterfactual?;

    let mut overall = counterfactual.risk as u32;
    if time_travel.is_time_sensitive {
        overall += 25;
    }
    if time_travel.flags.iter().any(|f| f.contains("TIME-BOMB")) {
        overall += 25;
    }
    let overall_risk_score = overall.min(100) as u8;

    let is_scam = counterfactual.is_honeypot
        || counterfactual.has_whitelist_mechanism
        || time_travel.flags.iter().any(|f| f.contains("TIME-BOMB") || f.contains("CRITICAL"));

    let overall_summary = summarize(&time_travel, &counterfactual);

    Ok(BatteryResult { time_travel, counterfactual, overall_risk_score, overall_summary, is_scam })
}

fn summarize(tt: &TimeTravelResult, cf: &CounterfactualResult) -> String {
    if cf.is_honeypot {
        "Owner can execute while every simulated user reverts — honeypot behavior".into()
    } else if cf.has_whitelist_mechanism {
        "Only whitelisted actors can execute this transaction".into()
    } else if tt.flags.iter().any(|f| f.contains("TIME-BOMB")) {
        "Transaction stops working at a future timestamp".into()
    } else if tt.is_time_sensitive {
        "Execution outcome depends on the block timestamp".into()
    } else {
        let total = tt.runs.len() + cf.runs.len() + 1;
        format!("No behavioral divergence across {total} simulations")
    }
}

// ── Time-travel family ──────────────────────────────────────────

async fn run_time_travel(input: Arc<BatteryInput>) -> Result<TimeTravelResult, EvmError> {
    let mut handles = Vec::with_capacity(TIME_OFFSETS.len() + 1);
    for (offset, description) in std::iter::once((0i64, "now")).chain(TIME_OFFSETS) {
        let input = input.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let ts = shifted_timestamp(input.now, offset);
            let cfg = run_config_for(&input, input.sender, false, ts);
            (offset, description, harness::run(&cfg, &mut NullObserver))
        }));
    }

    let mut baseline: Option<Outcome> = None;
    let mut completed: Vec<(i64, &str, Outcome)> = Vec::new();
    for joined in future::join_all(handles).await {
        let (offset, description, result) =
            joined.map_err(|e| EvmError::InvariantBroken(format!("time-travel sub-run panicked: {e}")))?;
        match result {
            Ok(outcome) if offset == 0 => baseline = Some(outcome),
            Ok(outcome) => completed.push((offset, description, outcome)),
            Err(e) => return Err(e),
        }
    }

    let baseline = baseline.ok_or_else(|| EvmError::InvariantBroken("baseline time-travel run missing".into()))?;
    Ok(classify_time_travel(baseline, completed))
}

fn classify_time_travel(baseline: Outcome, completed: Vec<(i64, &str, Outcome)>) -> TimeTravelResult {
    let mut flags = Vec::new();
    let mut runs = Vec::new();

    for (offset, description, outcome) in completed {
        let diverges = outcome.status != baseline.status;
        if diverges {
            if offset > 0 {
                if baseline.is_success() && !outcome.is_success() {
                    flags.push(format!("TIME-BOMB: Transaction fails at {description}"));
                    if offset <= 604_800 {
                        flags.push(format!("CRITICAL: Fails within 7 days — honeypot timer suspected ({description})"));
                    }
                } else if !baseline.is_success() && outcome.is_success() {
                    flags.push(format!("DELAYED TRADING: Trading opens at {description}"));
                    if offset > 86_400 {
                        flags.push(format!("WARNING: Extended trading delay — locked until {description}"));
                    }
                }
            } else if outcome.is_success() && !baseline.is_success() {
                flags.push("TRADING CLOSED: Transaction worked before but fails now".to_string());
            }
        }
        runs.push(TimeTravelRun {
            offset_seconds: offset,
            description: description.to_string(),
            outcome,
            diverges,
        });
    }

    let is_time_sensitive = runs.iter().any(|r| r.diverges);
    TimeTravelResult { current_outcome: baseline, runs, flags, is_time_sensitive }
}

// ── Counterfactual family ───────────────────────────────────────

async fn run_counterfactual(input: Arc<BatteryInput>) -> Result<CounterfactualResult, EvmError> {
    let mut actors: Vec<(ActorRole, Address)> = vec![
        (ActorRole::CurrentUser, input.sender),
        (ActorRole::RandomUser, derive_random_actor(&input)),
    ];
    if let Some(owner) = input.owner.filter(|a| *a != Address::ZERO) {
        actors.push((ActorRole::Owner, owner));
    }
    for addr in &input.whitelisted {
        actors.push((ActorRole::Whitelisted, *addr));
    }

    let mut handles = Vec::with_capacity(actors.len());
    for (role, actor) in actors {
        let input = input.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let cfg = run_config_for(&input, actor, role == ActorRole::Owner, input.now);
            (role, actor, harness::run(&cfg, &mut NullObserver))
        }));
    }

    let mut runs: Vec<(ActorRole, Address, Outcome)> = Vec::new();
    for joined in future::join_all(handles).await {
        let (role, actor, result) =
            joined.map_err(|e| EvmError::InvariantBroken(format!("counterfactual sub-run panicked: {e}")))?;
        match result {
            Ok(outcome) => runs.push((role, actor, outcome)),
            Err(e) => return Err(e),
        }
    }

    Ok(classify_counterfactual(runs))
}

fn classify_counterfactual(runs: Vec<(ActorRole, Address, Outcome)>) -> CounterfactualResult {
    let mut flags = Vec::new();
    let mut privilege_diffs = Vec::new();
    let mut risk: u32 = 0;
    let mut is_honeypot = false;
    let mut has_owner_privileges = false;
    let mut has_whitelist_mechanism = false;

    let owner_succeeded = runs.iter().any(|(r, _, o)| *r == ActorRole::Owner && o.is_success());
    let owner_present = runs.iter().any(|(r, _, _)| *r == ActorRole::Owner);
    let owner_all_reverted =
        owner_present && runs.iter().filter(|(r, _, _)| *r == ActorRole::Owner).all(|(_, _, o)| !o.is_success());
    let non_owner: Vec<&Outcome> =
        runs.iter().filter(|(r, _, _)| *r != ActorRole::Owner).map(|(_, _, o)| o).collect();
    let random_present = runs.iter().any(|(r, _, _)| *r == ActorRole::RandomUser);
    let random_all_reverted = random_present
        && runs.iter().filter(|(r, _, _)| *r == ActorRole::RandomUser).all(|(_, _, o)| !o.is_success());
    let random_any_succeeded =
        runs.iter().any(|(r, _, o)| *r == ActorRole::RandomUser && o.is_success());
    let whitelisted_succeeded =
        runs.iter().any(|(r, _, o)| *r == ActorRole::Whitelisted && o.is_success());

    if owner_succeeded && !non_owner.is_empty() && non_owner.iter().all(|o| !o.is_success()) {
        is_honeypot = true;
        has_owner_privileges = true;
        risk = 100;
        flags.push("CRITICAL HONEYPOT: Owner can execute, but users CANNOT".to_string());
        privilege_diffs.push(PrivilegeDiff {
            description: "Owner-only execution: every non-owner actor reverted while the owner succeeded".into(),
            severity: DiffSeverity::Critical,
        });
    }

    if whitelisted_succeeded && random_all_reverted {
        has_whitelist_mechanism = true;
        risk = risk.max(80);
        flags.push("WHITELIST DETECTED: Only whitelisted addresses can execute".to_string());
        privilege_diffs.push(PrivilegeDiff {
            description: "Whitelisted actors execute while random users revert".into(),
            severity: DiffSeverity::High,
        });
    }

    if random_any_succeeded && owner_all_reverted {
        flags.push("UNUSUAL: Users execute but owner cannot — possible renounce or misconfiguration".to_string());
        privilege_diffs.push(PrivilegeDiff {
            description: "Owner reverts where ordinary users succeed".into(),
            severity: DiffSeverity::Medium,
        });
    }

    let user_gas = runs
        .iter()
        .find(|(r, _, o)| *r == ActorRole::RandomUser && o.is_success())
        .map(|(_, _, o)| o.gas_used.to::<u64>());
    let owner_gas = runs
        .iter()
        .find(|(r, _, o)| *r == ActorRole::Owner && o.is_success())
        .map(|(_, _, o)| o.gas_used.to::<u64>());
    if let (Some(gas_user), Some(gas_owner)) = (user_gas, owner_gas) {
        let avg = (gas_user + gas_owner) as f64 / 2.0;
        if avg > 0.0 && ((gas_user as f64 - gas_owner as f64).abs() / avg) > 0.5 {
            flags.push("GAS ANOMALY: Owner and user gas costs diverge sharply".to_string());
            risk = (risk + 15).min(100);
            privilege_diffs.push(PrivilegeDiff {
                description: format!("Gas divergence: user {gas_user} vs owner {gas_owner}"),
                severity: DiffSeverity::Low,
            });
        }
    }

    if !flags.is_empty() {
        debug!(flags = ?flags, "counterfactual divergences detected");
    }

    CounterfactualResult {
        runs: runs
            .into_iter()
            .map(|(role, address, outcome)| ActorRun { role, address: canonical_address(&address), outcome })
            .collect(),
        is_honeypot,
        has_owner_privileges,
        has_whitelist_mechanism,
        privilege_diffs,
        flags,
        risk: risk.min(100) as u8,
    }
}

// ── Tests ───────────────────────────────────────────────────────
