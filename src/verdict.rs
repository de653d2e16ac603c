//! Final verdict assembly — a deterministic decision table over the
//! rule-based signals, the aggregate risk score, and the calibrated
//! classifier opinion. First match wins, top to bottom; the classifier is
//! consulted only when no rule fired.

use crate::types::{
    BatteryResult, MechanismStory, MlVerdict, SecurityReport, Severity, Verdict, VerdictKind, VerdictSource,
};
use tracing::debug;

/// Replace a "Safe" tracer story when the simulation battery saw a scam
/// the opcode patterns missed. Runs before the decision table, for
/// explanation only — it never changes the verdict itself.
pub fn reconcile_story(report: &mut SecurityReport, battery: &BatteryResult) {
    if !battery.is_scam || report.mechanism_story.severity != Severity::Safe {
        return;
    }

    let cf = &battery.counterfactual;
    let story = if cf.has_owner_privileges || cf.is_honeypot {
        MechanismStory {
            title: "Hidden Owner Privileges".into(),
            story: "The bytecode looks unremarkable, but simulation shows the owner executing \
                    successfully while every other caller reverts. The gate does not announce \
                    itself in the opcode stream — it only shows up when you try to trade."
                .into(),
            severity: Severity::High,
        }
    } else if battery
        .time_travel
        .flags
        .iter()
        .any(|f| f.contains("TIME-BOMB") || f.contains("CRITICAL"))
    {
        MechanismStory {
            title: "Hidden Time Lock".into(),
            story: "Execution succeeds today and fails at a future timestamp. The time gate is \
                    invisible statically; only the time-travel battery exposes the flip."
                .into(),
            severity: Severity::High,
        }
    } else {
        MechanismStory {
            title: "Hidden Revert Trap".into(),
            story: "Simulated variants of this transaction revert under conditions the static \
                    trace rates as safe. Treat the simulated divergence as the ground truth."
                .into(),
            severity: Severity::High,
        }
    };

    debug!(title = %story.title, "mechanism story reconciled against battery evidence");
    report.mechanism_story = story;
}

/// The decision table. `friendly_explanation` is the already-built
/// human-readable summary of the security report.
pub fn assemble(
    report: &SecurityReport,
    battery: &BatteryResult,
    ml: Option<&MlVerdict>,
    friendly_explanation: &str,
) -> Verdict {
    let cf = &battery.counterfactual;

    // 1. Hard rule: any honeypot/scam signal blocks, classifier opinion
    //    notwithstanding.
    if report.is_honeypot || battery.is_scam || cf.is_honeypot || cf.has_owner_privileges {
        let reason = if !friendly_explanation.is_empty() {
            friendly_explanation.to_string()
        } else if !battery.overall_summary.is_empty() {
            battery.overall_summary.clone()
        } else {
            "Honeypot or scam patterns detected".to_string()
        };
        return Verdict {
            verdict: VerdictKind::Block,
            reason,
            confidence: 100,
            source: VerdictSource::RuleBased,
            uncertainty: None,
            confidence_interval: None,
        };
    }

    // 2. Aggregate risk gate.
    let risk = report.risk_score.max(battery.overall_risk_score);
    if risk >= 50 {
        return Verdict {
            verdict: VerdictKind::Warn,
            reason: format!("Risk score {risk}/100 — Proceed with caution"),
            confidence: 80,
            source: VerdictSource::RiskScore,
            uncertainty: None,
            confidence_interval: None,
        };
    }

    // 3–5. Calibrated model, when reachable.
    if let Some(ml) = ml {
        let p = ml.scam_probability;
        let (verdict, confidence) = if p > 0.7 {
            (VerdictKind::Block, (p * 100.0).round() as u8)
        } else if p > 0.4 {
            (VerdictKind::Warn, (p * 100.0).round() as u8)
        } else {
            (VerdictKind::Safe, ((1.0 - p) * 100.0).round() as u8)
        };
        return Verdict {
            verdict,
            reason: ml.reason.clone(),
            confidence,
            source: VerdictSource::MLCalibrated,
            uncertainty: Some(ml.uncertainty),
            confidence_interval: Some(ml.confidence_interval),
        };
    }

    // 6. Nothing fired, nothing scored.
    Verdict {
        verdict: VerdictKind::Safe,
        reason: "No dangerous patterns detected".into(),
        confidence: 50,
        source: VerdictSource::Default,
        uncertainty: None,
        confidence_interval: None,
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        BatteryResult, CounterfactualResult, Outcome, ProxyInfo, TimeTravelResult,
    };
    use alloy_primitives::Bytes;

    fn battery() -> BatteryResult {
        BatteryResult {
            time_travel: TimeTravelResult {
                current_outcome: Outcome::success(21_000, Bytes::new()),
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
            overall_summary: "No behavioral divergence across 11 simulations".into(),
            is_scam: false,
        }
    }

    fn ml(p: f32) -> MlVerdict {
        MlVerdict {
            scam_probability: p,
            uncertainty: 0.05,
            confidence_interval: (p - 0.05, p + 0.05),
            verdict: "WARN".into(),
            reason: "model opinion".into(),
            model_version: "gbm-2024-11".into(),
            risk_band: "MEDIUM".into(),
        }
    }

    #[test]
    fn test_honeypot_blocks_regardless_of_classifier() {
        let mut report = SecurityReport::new(ProxyInfo::none());
        report.is_honeypot = true;
        let low_p = ml(0.01);
        let verdict = assemble(&report, &battery(), Some(&low_p), "honeypot detected");
        assert_eq!(verdict.verdict, VerdictKind::Block);
        assert_eq!(verdict.source, VerdictSource::RuleBased);
        assert_eq!(verdict.confidence, 100);
        assert_eq!(verdict.reason, "honeypot detected");
    }

    #[test]
    fn test_battery_scam_blocks_with_summary_fallback() {
        let report = SecurityReport::new(ProxyInfo::none());
        let mut b = battery();
        b.is_scam = true;
        b.overall_summary = "Transaction stops working at a future timestamp".into();
        let verdict = assemble(&report, &b, None, "");
        assert_eq!(verdict.verdict, VerdictKind::Block);
        assert_eq!(verdict.reason, "Transaction stops working at a future timestamp");
    }

    #[test]
    fn test_risk_score_warns_at_fifty() {
        let mut report = SecurityReport::new(ProxyInfo::none());
        report.risk_score = 55;
        let verdict = assemble(&report, &battery(), None, "");
        assert_eq!(verdict.verdict, VerdictKind::Warn);
        assert_eq!(verdict.source, VerdictSource::RiskScore);
        assert_eq!(verdict.confidence, 80);
        assert!(verdict.reason.contains("55/100"));
    }

    #[test]
    fn test_battery_risk_feeds_the_risk_gate() {
        let report = SecurityReport::new(ProxyInfo::none());
        let mut b = battery();
        b.overall_risk_score = 60;
        let verdict = assemble(&report, &b, None, "");
        assert_eq!(verdict.verdict, VerdictKind::Warn);
    }

    #[test]
    fn test_classifier_tiers() {
        let report = SecurityReport::new(ProxyInfo::none());
        let b = battery();

        let high = ml(0.8);
        let verdict = assemble(&report, &b, Some(&high), "");
        assert_eq!(verdict.verdict, VerdictKind::Block);
        assert_eq!(verdict.source, VerdictSource::MLCalibrated);
        assert_eq!(verdict.confidence, 80);
        assert!(verdict.uncertainty.is_some());

        let mid = ml(0.5);
        assert_eq!(assemble(&report, &b, Some(&mid), "").verdict, VerdictKind::Warn);

        let low = ml(0.2);
        let verdict = assemble(&report, &b, Some(&low), "");
        assert_eq!(verdict.verdict, VerdictKind::Safe);
        assert_eq!(verdict.confidence, 80, "confidence is 100·(1−p)");
    }

    #[test]
    fn test_default_safe_without_classifier() {
        let report = SecurityReport::new(ProxyInfo::none());
        let verdict = assemble(&report, &battery(), None, "");
        assert_eq!(verdict.verdict, VerdictKind::Safe);
        assert_eq!(verdict.source, VerdictSource::Default);
        assert_eq!(verdict.confidence, 50);
    }

    #[test]
    fn test_reconcile_replaces_safe_story_for_owner_scam() {
        let mut report = SecurityReport::new(ProxyInfo::none());
        let mut b = battery();
        b.is_scam = true;
        b.counterfactual.is_honeypot = true;
        b.counterfactual.has_owner_privileges = true;
        reconcile_story(&mut report, &b);
        assert_eq!(report.mechanism_story.title, "Hidden Owner Privileges");
        assert_eq!(report.mechanism_story.severity, Severity::High);
    }

    #[test]
    fn test_reconcile_time_lock_family() {
        let mut report = SecurityReport::new(ProxyInfo::none());
        let mut b = battery();
        b.is_scam = true;
        b.time_travel.flags.push("TIME-BOMB: Transaction fails at +7 Days".into());
        reconcile_story(&mut report, &b);
        assert_eq!(report.mechanism_story.title, "Hidden Time Lock");
    }

    #[test]
    fn test_reconcile_keeps_non_safe_story() {
        let mut report = SecurityReport::new(ProxyInfo::none());
        report.mechanism_story = MechanismStory {
            title: "Caller Identity Check".into(),
            story: "seen in trace".into(),
            severity: Severity::Medium,
        };
        let mut b = battery();
        b.is_scam = true;
        b.counterfactual.is_honeypot = true;
        reconcile_story(&mut report, &b);
        assert_eq!(report.mechanism_story.title, "Caller Identity Check");
    }
}
