//! Scan orchestration — one request in, one verdict envelope out.
//!
//! Pipeline: prefetch → proxy walk → traced baseline ∥ owner probe →
//! static analysis → simulation battery → features → classifier → drift →
//! verdict. The whole scan runs under a wall-clock deadline; on deadline
//! or fatal error the caller still gets an envelope (source `Default`,
//! confidence capped at 50, flag `Analysis incomplete`).

use crate::analyzer;
use crate::battery::{self, BatteryInput};
use crate::classifier::Classifier;
use crate::config::Config;
use crate::drift;
use crate::errors::{EvmError, ScanError};
use crate::features;
use crate::harness::{self, RunConfig};
use crate::history::HistoryStore;
use crate::oracle::ChainOracle;
use crate::proxy;
use crate::tracer::{self, OpcodeTracer, TraceResult};
use crate::types::{
    AdvancedAnalysis, AnalyzeResponse, BatteryResult, CounterfactualResult, MechanismStory, Outcome,
    ProxyInfo, SecurityReport, SecurityReportBody, Severity, SimStatus, TimeTravelResult, TxRequest,
    Verdict, VerdictKind, VerdictSource, canonical_address,
};
use crate::verdict;
use alloy_primitives::{Address, Bytes, U256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

/// Scan counters surfaced by the `/health` endpoint.
#[derive(Debug, Default)]
pub struct ScanStats {
    pub scans_total: AtomicU64,
    pub blocked: AtomicU64,
    pub warned: AtomicU64,
    pub incomplete: AtomicU64,
}

/// Everything one scan needs, shared across all concurrent scans.
pub struct ScanContext {
    pub config: Arc<Config>,
    pub oracle: Arc<dyn ChainOracle>,
    pub classifier: Arc<dyn Classifier>,
    pub history: Arc<dyn HistoryStore>,
    pub stats: ScanStats,
}

/// Run one scan to completion. Always produces an envelope; fatal errors
/// and deadline overruns degrade to the incomplete envelope rather than
/// surfacing raw errors to the caller.
pub async fn scan(ctx: &ScanContext, req: TxRequest) -> AnalyzeResponse {
    ctx.stats.scans_total.fetch_add(1, Ordering::Relaxed);
    let deadline = Duration::from_millis(ctx.config.scan_deadline_ms);
    let now_ms = chrono::Utc::now().timestamp_millis() as u64;

    let response = match timeout(deadline, scan_inner(ctx, &req, now_ms)).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            warn!(to = %canonical_address(&req.to), error = %e, "scan aborted");
            ctx.stats.incomplete.fetch_add(1, Ordering::Relaxed);
            incomplete_response(&e.to_string())
        }
        Err(_) => {
            warn!(to = %canonical_address(&req.to), "scan deadline exceeded");
            ctx.stats.incomplete.fetch_add(1, Ordering::Relaxed);
            incomplete_response(&ScanError::Deadline.to_string())
        }
    };

    match response.final_verdict.verdict {
        VerdictKind::Block => {
            ctx.stats.blocked.fetch_add(1, Ordering::Relaxed);
        }
        VerdictKind::Warn => {
            ctx.stats.warned.fetch_add(1, Ordering::Relaxed);
        }
        VerdictKind::Safe => {}
    }
    info!(
        to = %canonical_address(&req.to),
        verdict = ?response.final_verdict.verdict,
        risk = response.security_report.risk_score,
        "scan complete"
    );
    response
}

async fn scan_inner(ctx: &ScanContext, req: &TxRequest, now_ms: u64) -> Result<AnalyzeResponse, ScanError> {
    let now_secs = now_ms / 1000;
    let chain_id = req.chain_id;

    // 1. Prefetch. Code is the one thing the scan cannot live without.
    let bundle = ctx
        .oracle
        .prefetch(chain_id, req.to, ctx.config.prefetch_slots())
        .await?;

    // 2. Proxy walk; code-level analysis re-homes to the implementation
    //    while the storage context stays on the proxy address.
    let resolved = proxy::resolve(ctx.oracle.as_ref(), chain_id, req.to, &bundle.code).await;
    let exec_code = if resolved.info.is_proxy && !resolved.target_code.is_empty() {
        resolved.target_code.clone()
    } else {
        bundle.code.clone()
    };

    let mut preloaded = bundle.storage.clone();
    preloaded.extend(resolved.extra_storage.iter());

    // 3. Traced baseline run and owner probe, concurrently.
    let baseline_cfg = {
        let mut cfg = RunConfig::new(req.to, exec_code.clone(), req.from, req.data.clone());
        cfg.chain_id = chain_id;
        cfg.preloaded_storage = preloaded.clone();
        cfg.extra_accounts = resolved.extra_accounts.clone();
        cfg.value = req.value;
        cfg.gas_limit = ctx.config.gas_limit;
        cfg.block.timestamp = now_secs;
        cfg.balance_injections.insert(req.from, U256::from(10u64).pow(U256::from(24u64)));
        cfg
    };
    let baseline_task = tokio::task::spawn_blocking(move || {
        let mut opcode_tracer = OpcodeTracer::new();
        let outcome = harness::run(&baseline_cfg, &mut opcode_tracer)?;
        Ok::<(Outcome, TraceResult), EvmError>((outcome, opcode_tracer.into_result()))
    });

    let owner_probe = {
        let code = exec_code.clone();
        let storage = preloaded.clone();
        let extra = resolved.extra_accounts.clone();
        let to = req.to;
        tokio::task::spawn_blocking(move || {
            analyzer::owner_via_harness(chain_id, to, &code, &storage, &extra, now_secs)
        })
    };

    let (baseline_joined, owner_joined) = tokio::join!(baseline_task, owner_probe);
    let (baseline_outcome, trace) = baseline_joined
        .map_err(|e| ScanError::Evm(EvmError::InvariantBroken(format!("baseline run panicked: {e}"))))??;
    let harness_owner = owner_joined
        .map_err(|e| ScanError::Evm(EvmError::InvariantBroken(format!("owner probe panicked: {e}"))))?;

    let (ownership, owner) =
        analyzer::resolve_ownership(ctx.oracle.as_ref(), chain_id, req.to, harness_owner).await;

    // 4. Static analysis over the code-level target.
    let mut report = analyzer::analyze(exec_code.as_ref(), &resolved.info);
    analyzer::apply_ownership(&mut report, ownership, owner);
    if !baseline_outcome.is_success() {
        analyzer::apply_baseline_revert(&mut report);
    }
    report.mechanism_story = tracer::build_story(&trace);

    // 5. Simulation battery.
    let battery_input = Arc::new(BatteryInput {
        chain_id,
        code: exec_code.clone(),
        extra_accounts: resolved.extra_accounts.clone(),
        preloaded_storage: preloaded,
        sender: req.from,
        to: req.to,
        data: req.data.clone(),
        value: req.value,
        owner: owner.filter(|a| *a != Address::ZERO),
        whitelisted: Vec::new(),
        now: now_secs,
        gas_limit: ctx.config.gas_limit,
    });
    let battery_result = battery::run(battery_input).await?;

    // Battery flags join the report's flag set (weight already carried by
    // the battery's own risk aggregate).
    for flag in battery_result.all_flags().cloned().collect::<Vec<_>>() {
        report.add_flag(flag, 0);
    }
    verdict::reconcile_story(&mut report, &battery_result);

    // 6. Feature projection and classifier opinion.
    let feature_vector = features::extract(&report, &battery_result, &trace, exec_code.as_ref());
    let ml = match ctx.classifier.score(&feature_vector).await {
        Ok(verdict) => Some(verdict),
        Err(e) => {
            warn!(error = %e, "proceeding without classifier opinion");
            None
        }
    };

    // 7. Drift against stored history; omitted when the store is down.
    let address_key = canonical_address(&req.to);
    let drift_analysis = match drift::analyze_and_record(
        ctx.history.as_ref(),
        &mut report,
        chain_id,
        &address_key,
        now_ms,
        ctx.config.history_ttl_days,
        ctx.config.history_cap,
    )
    .await
    {
        Ok(analysis) => Some(analysis),
        Err(e) => {
            warn!(error = %e, "history store unavailable, drift analysis omitted");
            None
        }
    };

    // 8. Verdict and envelope.
    let friendly = friendly_explanation(&report, &battery_result);
    let final_verdict = verdict::assemble(&report, &battery_result, ml.as_ref(), &friendly);

    Ok(AnalyzeResponse {
        status: baseline_outcome.status,
        instruction_count: trace.steps,
        sstore_count: trace.sstore_count,
        call_count: trace.total_calls(),
        security_report: SecurityReportBody {
            is_honeypot: report.is_honeypot,
            ownership_status: report.ownership_status,
            risk_score: report.risk_score,
            flags: report.flags.clone(),
            owner_address: report.owner.clone(),
            friendly_explanation: friendly,
            mechanism_story: report.mechanism_story.clone(),
            tracing_events: trace.event_lines(),
        },
        proxy_info: report.proxy_info.clone(),
        drift_analysis,
        advanced_analysis: AdvancedAnalysis {
            time_travel: battery_result.time_travel,
            counterfactual: battery_result.counterfactual,
            overall_risk_score: battery_result.overall_risk_score,
            overall_summary: battery_result.overall_summary,
            is_scam: battery_result.is_scam,
        },
        ml_analysis: ml,
        final_verdict,
    })
}

/// Human-readable summary of the strongest signal, strongest first.
fn friendly_explanation(report: &SecurityReport, battery: &BatteryResult) -> String {
    let cf = &battery.counterfactual;
    if cf.is_honeypot {
        return "Simulation shows the owner can execute this transaction while ordinary users cannot. \
                This is the signature of a honeypot."
            .into();
    }
    if cf.has_whitelist_mechanism {
        return "Only whitelisted addresses can execute this transaction; random users revert.".into();
    }
    if battery.time_travel.flags.iter().any(|f| f.contains("TIME-BOMB")) {
        return "This transaction works now but stops working at a future timestamp — a time-locked trap."
            .into();
    }
    if report.is_honeypot {
        let suspicious: Vec<&str> = report
            .flags
            .iter()
            .filter(|f| f.starts_with("Suspicious Function:"))
            .map(|f| f.as_str())
            .take(3)
            .collect();
        return format!(
            "The contract exposes high-risk functions ({}). The owner can change the rules after you buy.",
            suspicious.join(", ")
        );
    }
    if battery.time_travel.is_time_sensitive {
        return "Execution outcome changes with the block timestamp.".into();
    }
    if report.risk_score >= 50 {
        return format!("Multiple risk signals add up to {}/100.", report.risk_score);
    }
    "No dangerous patterns detected in simulation.".into()
}

/// Envelope for scans that never finished: degraded but well-formed.
fn incomplete_response(reason: &str) -> AnalyzeResponse {
    let flags = vec!["Analysis incomplete".to_string()];
    AnalyzeResponse {
        status: SimStatus::Reverted,
        instruction_count: 0,
        sstore_count: 0,
        call_count: 0,
        security_report: SecurityReportBody {
            is_honeypot: false,
            ownership_status: crate::types::OwnershipStatus::Unknown,
            risk_score: 0,
            flags: flags.clone(),
            owner_address: None,
            friendly_explanation: format!("Analysis incomplete: {reason}"),
            mechanism_story: MechanismStory {
                title: "Analysis Incomplete".into(),
                story: "The scan could not finish; no claim is made either way.".into(),
                severity: Severity::Low,
            },
            tracing_events: Vec::new(),
        },
        proxy_info: ProxyInfo::none(),
        drift_analysis: None,
        advanced_analysis: AdvancedAnalysis {
            time_travel: TimeTravelResult {
                current_outcome: Outcome::reverted("analysis incomplete", 0, Bytes::new()),
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
                flags,
                risk: 0,
            },
            overall_risk_score: 0,
            overall_summary: "Analysis incomplete".into(),
            is_scam: false,
        },
        ml_analysis: None,
        final_verdict: Verdict {
            verdict: VerdictKind::Safe,
            reason: format!("Analysis incomplete: {reason}"),
            confidence: 50,
            source: VerdictSource::Default,
            uncertainty: None,
            confidence_interval: None,
        },
    }
}

// ── Tests ───────────────────────────────────────────────────────
