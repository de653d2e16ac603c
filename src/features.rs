//! Projection of every analysis result into the fixed 15-dimensional
//! feature vector consumed by the classifier oracle.
//!
//! Field names, order, and semantics are part of the external contract
//! with the trained model — change nothing here without retraining.
//! Every field lands in [0,1]; NaN and infinities are clamped away.

use crate::tracer::TraceResult;
use crate::types::{BatteryResult, SecurityReport};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector {
    pub sim_success_rate: f32,
    pub owner_privilege_ratio: f32,
    pub time_variance_score: f32,
    pub gated_branch_ratio: f32,
    pub mint_transfer_ratio: f32,
    pub suspicious_opcode_density: f32,
    pub proxy_depth_normalized: f32,
    pub sload_density: f32,
    pub bytecode_entropy: f32,
    pub counterfactual_risk: f32,
    pub time_bomb_risk: f32,
    pub gas_anomaly_score: f32,
    pub security_report_risk: f32,
    pub flag_density: f32,
    pub revert_rate: f32,
}

impl FeatureVector {
    pub fn as_array(&self) -> [f32; 15] {
        [
            self.sim_success_rate,
            self.owner_privilege_ratio,
            self.time_variance_score,
            self.gated_branch_ratio,
            self.mint_transfer_ratio,
            self.suspicious_opcode_density,
            self.proxy_depth_normalized,
            self.sload_density,
            self.bytecode_entropy,
            self.counterfactual_risk,
            self.time_bomb_risk,
            self.gas_anomaly_score,
            self.security_report_risk,
            self.flag_density,
            self.revert_rate,
        ]
    }
}

fn clamp01(x: f64) -> f32 {
    if x.is_finite() {
        x.clamp(0.0, 1.0) as f32
    } else {
        0.0
    }
}

fn indicator(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// How many of `patterns` appear (case-insensitively) across the flags,
/// at 0.25 each, capped at 1.
fn pattern_ratio(flags_lower: &[String], patterns: &[&str]) -> f64 {
    let hits = patterns.iter().filter(|p| flags_lower.iter().any(|f| f.contains(*p))).count();
    (hits as f64 * 0.25).min(1.0)
}

/// Shannon entropy of the byte histogram, normalized against log2(256).
pub fn bytecode_entropy(code: &[u8]) -> f64 {
    if code.is_empty() {
        return 0.0;
    }
    let mut histogram = [0u64; 256];
    for b in code {
        histogram[*b as usize] += 1;
    }
    let total = code.len() as f64;
    let mut entropy = 0.0;
    for count in histogram.iter().filter(|c| **c > 0) {
        let p = *count as f64 / total;
        entropy -= p * p.log2();
    }
    entropy / 8.0
}

/// Deterministic projection of one scan's results.
pub fn extract(
    report: &SecurityReport,
    battery: &BatteryResult,
    trace: &TraceResult,
    code: &[u8],
) -> FeatureVector {
    let cf = &battery.counterfactual;
    let tt = &battery.time_travel;
    let baseline_reverted = !tt.current_outcome.is_success();

    // Full flag universe: report flags plus both battery families.
    let flags_lower: Vec<String> = report
        .flags
        .iter()
        .chain(battery.all_flags())
        .map(|f| f.to_lowercase())
        .collect();

    let actor_total = cf.runs.len();
    let actor_successes = cf.runs.iter().filter(|r| r.outcome.is_success()).count();

    let sim_success_rate = if actor_total == 0 {
        if baseline_reverted {
            0.2
        } else {
            0.8
        }
    } else {
        actor_successes as f64 / actor_total as f64
    };

    let revert_rate = if actor_total == 0 {
        if baseline_reverted {
            0.8
        } else {
            0.2
        }
    } else {
        (actor_total - actor_successes) as f64 / actor_total as f64
    };

    let owner_privilege_ratio = 0.4 * indicator(cf.has_owner_privileges)
        + 0.3 * indicator(cf.is_honeypot)
        + (0.1 * cf.privilege_diffs.len() as f64).min(0.3);

    let diverging_offsets = tt.runs.iter().filter(|r| r.diverges).count();
    let time_variance_score = 0.5 * indicator(tt.is_time_sensitive)
        + (0.1 * diverging_offsets as f64).min(0.5)
        + (0.1 * tt.flags.len() as f64).min(0.3);

    let weighted_opcode_hits = 2.0 * trace.selfdestruct_count as f64
        + trace.delegatecall_count as f64
        + trace.callcode_count as f64;
    let density_floor = (trace.steps as f64 / 10.0).max(10.0);
    let suspicious_opcode_density = weighted_opcode_hits / density_floor;

    let sload_density = if trace.steps == 0 {
        0.0
    } else {
        (trace.sload_count as f64 / trace.steps as f64) * 10.0
    };

    let counterfactual_risk = 0.5 * indicator(cf.is_honeypot)
        + 0.3 * indicator(cf.has_owner_privileges)
        + 0.2 * indicator(cf.has_whitelist_mechanism);

    let time_risk_flags = tt
        .flags
        .iter()
        .filter(|f| f.contains("TIME-BOMB") || f.contains("CRITICAL"))
        .count();
    let time_bomb_risk = (0.2 * time_risk_flags as f64).min(1.0);

    let success_gas: Vec<u64> = cf
        .runs
        .iter()
        .filter(|r| r.outcome.is_success())
        .map(|r| r.outcome.gas_used.to::<u64>())
        .collect();
    let mut gas_anomaly_score = match (success_gas.iter().max(), success_gas.iter().min()) {
        (Some(&max), Some(&min)) if success_gas.len() >= 2 && max > 0 => (max - min) as f64 / max as f64,
        _ => 0.0,
    };
    if flags_lower.iter().any(|f| f.starts_with("gas anomaly")) {
        gas_anomaly_score = gas_anomaly_score.max(0.7);
    }

    FeatureVector {
        sim_success_rate: clamp01(sim_success_rate),
        owner_privilege_ratio: clamp01(owner_privilege_ratio),
        time_variance_score: clamp01(time_variance_score),
        gated_branch_ratio: clamp01(pattern_ratio(&flags_lower, &["blacklist", "whitelist", "owner", "blocked"])),
        mint_transfer_ratio: clamp01(pattern_ratio(&flags_lower, &["mint", "drain", "pause", "selfdestruct"])),
        suspicious_opcode_density: clamp01(suspicious_opcode_density),
        proxy_depth_normalized: clamp01(report.proxy_info.depth as f64 / 3.0),
        sload_density: clamp01(sload_density),
        bytecode_entropy: clamp01(bytecode_entropy(code)),
        counterfactual_risk: clamp01(counterfactual_risk),
        time_bomb_risk: clamp01(time_bomb_risk),
        gas_anomaly_score: clamp01(gas_anomaly_score),
        security_report_risk: clamp01(report.risk_score as f64 / 100.0),
        flag_density: clamp01(flags_lower.len() as f64 / 10.0),
        revert_rate: clamp01(revert_rate),
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        ActorRole, ActorRun, BatteryResult, CounterfactualResult, Outcome, ProxyInfo, SecurityReport,
        TimeTravelResult,
    };
    use alloy_primitives::Bytes;

    fn empty_battery(baseline_reverted: bool) -> BatteryResult {
        let baseline = if baseline_reverted {
            Outcome::reverted("unknown", 21_000, Bytes::new())
        } else {
            Outcome::success(21_000, Bytes::new())
        };
        BatteryResult {
            time_travel: TimeTravelResult {
                current_outcome: baseline,
                runs: Vec::new(),
                flags: Vec::new(),
                is_time_sensitive: false,
            },
            counterfactual: CounterfactualResult {
                runs: Vec::new(),
                is_honeypot: false,
                has_owner_privileges: false,
                has_whitelist_mechanism: false,
                privilege_diffs: Vec::new(),
                flags: Vec::new(),
                risk: 0,
            },
            overall_risk_score: 0,
            overall_summary: String::new(),
            is_scam: false,
        }
    }

    fn actor(role: ActorRole, success: bool, gas: u64) -> ActorRun {
        let outcome = if success {
            Outcome::success(gas, Bytes::new())
        } else {
            Outcome::reverted("unknown", gas, Bytes::new())
        };
        ActorRun { role, address: "0x00".into(), outcome }
    }

    #[test]
    fn test_every_field_in_unit_range_for_hostile_inputs() {
        let mut report = SecurityReport::new(ProxyInfo::none());
        for i in 0..30 {
            report.add_flag(format!("Suspicious Function: mint-{i}"), 90);
        }
        report.proxy_info.depth = 9;
        let mut battery = empty_battery(false);
        battery.counterfactual.is_honeypot = true;
        battery.counterfactual.has_owner_privileges = true;
        battery.counterfactual.has_whitelist_mechanism = true;
        battery.time_travel.is_time_sensitive = true;
        for _ in 0..12 {
            battery.time_travel.flags.push("TIME-BOMB: Transaction fails at +1 Hour".into());
        }
        let mut trace = TraceResult::default();
        trace.steps = 1;
        trace.selfdestruct_count = 500;
        trace.sload_count = 400;

        let vector = extract(&report, &battery, &trace, &[0xFF; 64]);
        for (i, value) in vector.as_array().iter().enumerate() {
            assert!(value.is_finite(), "field {i} must be finite");
            assert!((0.0..=1.0).contains(value), "field {i} out of range: {value}");
        }
    }

    #[test]
    fn test_success_rate_fallbacks_without_actors() {
        let report = SecurityReport::new(ProxyInfo::none());
        let trace = TraceResult::default();

        let v = extract(&report, &empty_battery(true), &trace, &[]);
        assert!((v.sim_success_rate - 0.2).abs() < f32::EPSILON);
        assert!((v.revert_rate - 0.8).abs() < f32::EPSILON);

        let v = extract(&report, &empty_battery(false), &trace, &[]);
        assert!((v.sim_success_rate - 0.8).abs() < f32::EPSILON);
        assert!((v.revert_rate - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_success_and_revert_rates_from_actor_matrix() {
        let report = SecurityReport::new(ProxyInfo::none());
        let mut battery = empty_battery(false);
        battery.counterfactual.runs = vec![
            actor(ActorRole::CurrentUser, true, 30_000),
            actor(ActorRole::RandomUser, false, 25_000),
            actor(ActorRole::Owner, true, 28_000),
            actor(ActorRole::RandomUser, false, 25_000),
        ];
        let v = extract(&report, &battery, &TraceResult::default(), &[]);
        assert!((v.sim_success_rate - 0.5).abs() < f32::EPSILON);
        assert!((v.revert_rate - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_gated_and_mint_patterns() {
        let mut report = SecurityReport::new(ProxyInfo::none());
        report.add_flag("Suspicious Function: blacklist(address)", 0);
        report.add_flag("Contract has an Owner: 0xabc", 0);
        report.add_flag("Suspicious Function: mint(address,uint256)", 0);
        report.add_flag("Dangerous Opcode: SELFDESTRUCT", 0);
        let v = extract(&report, &empty_battery(false), &TraceResult::default(), &[]);
        assert!((v.gated_branch_ratio - 0.5).abs() < f32::EPSILON, "blacklist + owner");
        assert!((v.mint_transfer_ratio - 0.5).abs() < f32::EPSILON, "mint + selfdestruct");
    }

    #[test]
    fn test_entropy_bounds() {
        assert_eq!(bytecode_entropy(&[]), 0.0);
        assert_eq!(bytecode_entropy(&[0x42; 128]), 0.0, "uniform bytes carry no entropy");
        let full: Vec<u8> = (0..=255u8).collect();
        assert!((bytecode_entropy(&full) - 1.0).abs() < 1e-9, "flat histogram maxes out");
    }

    #[test]
    fn test_gas_anomaly_floor_with_flag() {
        let report = SecurityReport::new(ProxyInfo::none());
        let mut battery = empty_battery(false);
        battery.counterfactual.runs = vec![
            actor(ActorRole::RandomUser, true, 30_000),
            actor(ActorRole::Owner, true, 29_000),
        ];
        battery.counterfactual.flags.push("GAS ANOMALY: Owner and user gas costs diverge sharply".into());
        let v = extract(&report, &battery, &TraceResult::default(), &[]);
        assert!(v.gas_anomaly_score >= 0.7, "flag forces the floor even when spread is small");
    }

    #[test]
    fn test_gas_anomaly_spread_without_flag() {
        let report = SecurityReport::new(ProxyInfo::none());
        let mut battery = empty_battery(false);
        battery.counterfactual.runs = vec![
            actor(ActorRole::RandomUser, true, 100_000),
            actor(ActorRole::Owner, true, 25_000),
        ];
        let v = extract(&report, &battery, &TraceResult::default(), &[]);
        assert!((v.gas_anomaly_score - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_suspicious_opcode_density_floor() {
        let report = SecurityReport::new(ProxyInfo::none());
        let mut trace = TraceResult::default();
        trace.steps = 40; // floor stays at 10 until 100 steps
        trace.delegatecall_count = 5;
        let v = extract(&report, &empty_battery(false), &trace, &[]);
        assert!((v.suspicious_opcode_density - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_serialized_field_order_is_the_contract() {
        let v = extract(
            &SecurityReport::new(ProxyInfo::none()),
            &empty_battery(false),
            &TraceResult::default(),
            &[],
        );
        let json = serde_json::to_string(&v).unwrap();
        let names = [
            "sim_success_rate",
            "owner_privilege_ratio",
            "time_variance_score",
            "gated_branch_ratio",
            "mint_transfer_ratio",
            "suspicious_opcode_density",
            "proxy_depth_normalized",
            "sload_density",
            "bytecode_entropy",
            "counterfactual_risk",
            "time_bomb_risk",
            "gas_anomaly_score",
            "security_report_risk",
            "flag_density",
            "revert_rate",
        ];
        let mut last = 0;
        for name in names {
            let pos = json.find(name).unwrap_or_else(|| panic!("missing field {name}"));
            assert!(pos > last || last == 0, "field {name} out of order");
            last = pos;
        }
    }
}
