//! Wire types and the shared data model of the analysis pipeline.
//!
//! Flag strings are a *set with stable identity* — drift detection hashes
//! them, so labels must never be renamed once shipped. Addresses are
//! canonicalized to lowercase hex everywhere they cross a serialization
//! boundary.

use alloy_primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};

/// Canonical lowercase hex rendering of an address (`0x` + 40 nibbles).
pub fn canonical_address(addr: &Address) -> String {
    format!("0x{}", hex::encode(addr.as_slice()))
}

/// Parse a 20-byte hex address, with or without the `0x` prefix.
pub fn parse_address(s: &str) -> Option<Address> {
    let raw = s.trim().trim_start_matches("0x").trim_start_matches("0X");
    let bytes = hex::decode(raw).ok()?;
    if bytes.len() != 20 {
        return None;
    }
    Some(Address::from_slice(&bytes))
}

// ── Inbound request ─────────────────────────────────────────────

/// Raw analyze request as received on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzeRequest {
    pub from: String,
    pub to: String,
    /// Hex call data, `0x`-prefixed or bare. Empty means a plain transfer.
    #[serde(default)]
    pub data: String,
    /// Decimal or hex integer string (also accepts a bare JSON number).
    #[serde(default)]
    pub value: Option<ValueField>,
    /// Integer chain id, or a string of the form `eip155:<n>`.
    pub chain: ChainField,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ValueField {
    Number(u64),
    Text(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ChainField {
    Id(u64),
    Tag(String),
}

/// Validated, immutable transaction request — the unit of one scan.
#[derive(Debug, Clone)]
pub struct TxRequest {
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub chain_id: u64,
}

impl TxRequest {
    /// Validate and canonicalize a wire request.
    pub fn from_wire(req: &AnalyzeRequest) -> Result<Self, String> {
        let from = parse_address(&req.from).ok_or_else(|| format!("invalid from address: {}", req.from))?;
        let to = parse_address(&req.to).ok_or_else(|| format!("invalid to address: {}", req.to))?;

        let raw = req.data.trim().trim_start_matches("0x");
        let data = if raw.is_empty() {
            Bytes::new()
        } else {
            Bytes::from(hex::decode(raw).map_err(|e| format!("invalid call data hex: {e}"))?)
        };

        let value = match &req.value {
            None => U256::ZERO,
            Some(ValueField::Number(n)) => U256::from(*n),
            Some(ValueField::Text(s)) => parse_value(s).ok_or_else(|| format!("invalid value: {s}"))?,
        };

        let chain_id = match &req.chain {
            ChainField::Id(n) => *n,
            ChainField::Tag(s) => parse_chain_tag(s).ok_or_else(|| format!("invalid chain: {s}"))?,
        };

        Ok(TxRequest { from, to, data, value, chain_id })
    }
}

/// Parse a decimal or `0x`-hex integer string into a 256-bit value.
pub fn parse_value(s: &str) -> Option<U256> {
    let s = s.trim();
    if let Some(hexpart) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        U256::from_str_radix(hexpart, 16).ok()
    } else {
        U256::from_str_radix(s, 10).ok()
    }
}

/// Parse `eip155:<n>` (or a bare decimal string) into a chain id.
pub fn parse_chain_tag(s: &str) -> Option<u64> {
    let s = s.trim();
    let num = s.strip_prefix("eip155:").unwrap_or(s);
    num.parse().ok()
}

// ── Simulation outcomes ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SimStatus {
    Success,
    Reverted,
}

/// Terminal result of one EVM run.
///
/// Invariant: a `Reverted` outcome always carries a reason string
/// (possibly `"unknown"`). Construct through the helpers to keep it.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub status: SimStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revert_reason: Option<String>,
    pub gas_used: U256,
    pub return_value: Bytes,
}

impl Outcome {
    pub fn success(gas_used: u64, return_value: Bytes) -> Self {
        Outcome {
            status: SimStatus::Success,
            revert_reason: None,
            gas_used: U256::from(gas_used),
            return_value,
        }
    }

    pub fn reverted(reason: impl Into<String>, gas_used: u64, return_value: Bytes) -> Self {
        let reason = reason.into();
        let reason = if reason.is_empty() { "unknown".to_string() } else { reason };
        Outcome {
            status: SimStatus::Reverted,
            revert_reason: Some(reason),
            gas_used: U256::from(gas_used),
            return_value,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SimStatus::Success
    }
}

// ── Proxy classification ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    Eip1967Transparent,
    Eip1822Uups,
    Eip897Legacy,
    Eip1167Minimal,
    Custom,
    None,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyInfo {
    pub is_proxy: bool,
    pub proxy_kind: ProxyKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implementation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beacon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin: Option<String>,
    /// Number of proxy→implementation hops walked (0 for a non-proxy).
    pub depth: u8,
}

impl ProxyInfo {
    pub fn none() -> Self {
        ProxyInfo {
            is_proxy: false,
            proxy_kind: ProxyKind::None,
            implementation: None,
            beacon: None,
            admin: None,
            depth: 0,
        }
    }
}

// ── Security report ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OwnershipStatus {
    Renounced,
    Centralized,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Safe,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct MechanismStory {
    pub title: String,
    pub story: String,
    pub severity: Severity,
}

impl MechanismStory {
    pub fn safe() -> Self {
        MechanismStory {
            title: "No Hidden Mechanisms".into(),
            story: "Execution followed a plain path with no caller-gated or time-gated branches observed.".into(),
            severity: Severity::Safe,
        }
    }
}

/// Base security report produced by the static analyzer and enriched by
/// every later stage. `flags` keeps insertion order but has set identity.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityReport {
    pub risk_score: u8,
    pub is_honeypot: bool,
    pub ownership_status: OwnershipStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub flags: Vec<String>,
    pub mechanism_story: MechanismStory,
    pub proxy_info: ProxyInfo,
}

impl SecurityReport {
    pub fn new(proxy_info: ProxyInfo) -> Self {
        SecurityReport {
            risk_score: 0,
            is_honeypot: false,
            ownership_status: OwnershipStatus::Unknown,
            owner: None,
            flags: Vec::new(),
            mechanism_story: MechanismStory::safe(),
            proxy_info,
        }
    }

    /// Add a flag (idempotent) and its risk weight, saturating at 100.
    pub fn add_flag(&mut self, flag: impl Into<String>, weight: u32) {
        let flag = flag.into();
        if !self.flags.iter().any(|f| *f == flag) {
            self.flags.push(flag);
        }
        self.risk_score = (self.risk_score as u32 + weight).min(100) as u8;
    }

    pub fn has_flag_containing(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.flags.iter().any(|f| f.to_lowercase().contains(&needle))
    }
}

// ── Simulation battery results ──────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct TimeTravelRun {
    pub offset_seconds: i64,
    pub description: String,
    pub outcome: Outcome,
    pub diverges: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeTravelResult {
    pub current_outcome: Outcome,
    pub runs: Vec<TimeTravelRun>,
    pub flags: Vec<String>,
    pub is_time_sensitive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActorRole {
    CurrentUser,
    RandomUser,
    Owner,
    Deployer,
    Whitelisted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActorRun {
    pub role: ActorRole,
    pub address: String,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiffSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrivilegeDiff {
    pub description: String,
    pub severity: DiffSeverity,
}

#[derive(Debug, Clone, Serialize)]
pub struct CounterfactualResult {
    pub runs: Vec<ActorRun>,
    pub is_honeypot: bool,
    pub has_owner_privileges: bool,
    pub has_whitelist_mechanism: bool,
    pub privilege_diffs: Vec<PrivilegeDiff>,
    pub flags: Vec<String>,
    pub risk: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatteryResult {
    pub time_travel: TimeTravelResult,
    pub counterfactual: CounterfactualResult,
    pub overall_risk_score: u8,
    pub overall_summary: String,
    pub is_scam: bool,
}

impl BatteryResult {
    /// All behavioral flags from both scenario families, in emission order.
    pub fn all_flags(&self) -> impl Iterator<Item = &String> {
        self.time_travel.flags.iter().chain(self.counterfactual.flags.iter())
    }
}

// ── ML verdict ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlVerdict {
    pub scam_probability: f32,
    pub uncertainty: f32,
    pub confidence_interval: (f32, f32),
    pub verdict: String,
    pub reason: String,
    pub model_version: String,
    pub risk_band: String,
}

// ── Scan history / drift ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecord {
    pub timestamp_ms: u64,
    pub chain_id: u64,
    pub address: String,
    pub risk_score: u8,
    pub flags: Vec<String>,
    /// sha256 of the sorted, pipe-joined flag set, truncated to 16 hex chars.
    pub capability_hash: String,
    pub is_honeypot: bool,
    pub ownership_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_kind: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftAnalysis {
    pub has_drift: bool,
    pub risk_delta: i16,
    pub new_flags: Vec<String>,
    pub removed_flags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_scan_timestamp: Option<u64>,
}

// ── Final verdict ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VerdictKind {
    #[serde(rename = "BLOCK")]
    Block,
    #[serde(rename = "WARN")]
    Warn,
    #[serde(rename = "SAFE")]
    Safe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VerdictSource {
    RuleBased,
    RiskScore,
    MLCalibrated,
    Default,
}

#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub verdict: VerdictKind,
    pub reason: String,
    pub confidence: u8,
    pub source: VerdictSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uncertainty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_interval: Option<(f32, f32)>,
}

// ── Response envelope ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SecurityReportBody {
    pub is_honeypot: bool,
    pub ownership_status: OwnershipStatus,
    pub risk_score: u8,
    pub flags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_address: Option<String>,
    pub friendly_explanation: String,
    pub mechanism_story: MechanismStory,
    pub tracing_events: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdvancedAnalysis {
    pub time_travel: TimeTravelResult,
    pub counterfactual: CounterfactualResult,
    pub overall_risk_score: u8,
    pub overall_summary: String,
    pub is_scam: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeResponse {
    pub status: SimStatus,
    pub instruction_count: u64,
    pub sstore_count: u64,
    pub call_count: u64,
    pub security_report: SecurityReportBody,
    pub proxy_info: ProxyInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift_analysis: Option<DriftAnalysis>,
    pub advanced_analysis: AdvancedAnalysis,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ml_analysis: Option<MlVerdict>,
    pub final_verdict: Verdict,
}

// ── Tests ───────────────────────────────────────────────────────
