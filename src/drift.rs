//! Behavioral drift detection across successive scans of one address.
//!
//! Drift is a change of the *capability hash* — a compact identity for a
//! scan's flag set — not of the risk number alone. Flag strings are the
//! identity, which is why labels are never renamed.

use crate::errors::HistoryError;
use crate::history::HistoryStore;
use crate::types::{DriftAnalysis, ScanRecord, SecurityReport};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{info, warn};

/// sha256 of the sorted, pipe-joined flag set, truncated to 16 hex chars.
/// Order-independent: shuffled flags hash identically.
pub fn capability_hash(flags: &[String]) -> String {
    let mut sorted: Vec<&str> = flags.iter().map(|s| s.as_str()).collect();
    sorted.sort_unstable();
    sorted.dedup();
    let digest = Sha256::digest(sorted.join("|").as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Advisory severity tier for a risk increase.
pub fn drift_tier(risk_delta: i16) -> Option<&'static str> {
    match risk_delta {
        d if d >= 60 => Some("critical"),
        d if d >= 40 => Some("high"),
        d if d >= 20 => Some("moderate"),
        _ => None,
    }
}

fn proxy_kind_str(report: &SecurityReport) -> Option<String> {
    if !report.proxy_info.is_proxy {
        return None;
    }
    serde_json::to_value(report.proxy_info.proxy_kind)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
}

/// Compare against the most recent stored scan, append the auto-flag on a
/// ≥ +20 risk jump, then write the new record (newest-first list, capped,
/// with a per-record TTL key alongside).
pub async fn analyze_and_record(
    store: &dyn HistoryStore,
    report: &mut SecurityReport,
    chain_id: u64,
    address: &str,
    timestamp_ms: u64,
    ttl_days: u64,
    cap: usize,
) -> Result<DriftAnalysis, HistoryError> {
    let key = format!("history:{address}");
    let ttl_ms = ttl_days * 24 * 3600 * 1000;

    // Newest-first; skip records past their TTL.
    let prior: Option<ScanRecord> = store
        .list_range(&key, 0, 4)
        .await?
        .iter()
        .filter_map(|raw| serde_json::from_str::<ScanRecord>(raw).ok())
        .find(|record| record.timestamp_ms.saturating_add(ttl_ms) > timestamp_ms);

    let current_hash = capability_hash(&report.flags);

    let analysis = match &prior {
        Some(previous) => {
            let risk_delta = report.risk_score as i16 - previous.risk_score as i16;
            let new_flags: Vec<String> = report
                .flags
                .iter()
                .filter(|f| !previous.flags.contains(f))
                .cloned()
                .collect();
            let removed_flags: Vec<String> = previous
                .flags
                .iter()
                .filter(|f| !report.flags.contains(f))
                .cloned()
                .collect();
            let has_drift = previous.capability_hash != current_hash;

            if risk_delta >= 20 {
                if let Some(tier) = drift_tier(risk_delta) {
                    warn!(address, risk_delta, tier, "risk increased since last scan");
                }
                report.add_flag(format!("Risk Increased (+{risk_delta} since last scan)"), 0);
            }
            if has_drift {
                info!(address, new = new_flags.len(), removed = removed_flags.len(), "capability drift detected");
            }

            DriftAnalysis {
                has_drift,
                risk_delta,
                new_flags,
                removed_flags,
                previous_scan_timestamp: Some(previous.timestamp_ms),
            }
        }
        None => DriftAnalysis {
            has_drift: false,
            risk_delta: 0,
            new_flags: Vec::new(),
            removed_flags: Vec::new(),
            previous_scan_timestamp: None,
        },
    };

    // The stored record covers the final flag set, auto-flag included, so
    // its capability_hash is recomputed to keep the record self-consistent.
    let record = ScanRecord {
        timestamp_ms,
        chain_id,
        address: address.to_string(),
        risk_score: report.risk_score,
        flags: report.flags.clone(),
        capability_hash: capability_hash(&report.flags),
        is_honeypot: report.is_honeypot,
        ownership_status: format!("{:?}", report.ownership_status),
        proxy_kind: proxy_kind_str(report),
    };
    let raw = serde_json::to_string(&record).map_err(|_| HistoryError::Unavailable)?;

    store.list_push_front(&key, raw.clone()).await?;
    store.list_trim(&key, 0, cap.saturating_sub(1)).await?;
    store
        .set_with_ttl(
            &format!("scan:{address}:{timestamp_ms}"),
            raw,
            Duration::from_secs(ttl_days * 24 * 3600),
        )
        .await?;

    Ok(analysis)
}

// ── Tests ───────────────────────────────────────────────────────
