//! Typed error kinds for the analysis pipeline.
//!
//! Sub-run failures never fail a scan unless they are
//! [`EvmError::InvariantBroken`]; everything else degrades (the failing
//! sub-run contributes "outcome unknown" and is excluded from ratios).

use thiserror::Error;

/// Failures talking to a remote EVM node.
///
/// A single endpoint failure never surfaces here — only exhaustion of the
/// whole endpoint list for a chain does.
#[derive(Debug, Clone, Error)]
pub enum OracleError {
    #[error("oracle request timed out on every endpoint")]
    Timeout,

    #[error("no oracle endpoint reachable")]
    NotReachable,

    #[error("oracle returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("all oracle endpoints are circuit-open")]
    CircuitOpen,
}

/// Internal EVM harness failures. Always a bug, always fatal for the
/// enclosing scan — but never allowed to taint other concurrent scans.
#[derive(Debug, Clone, Error)]
pub enum EvmError {
    #[error("EVM harness invariant broken: {0}")]
    InvariantBroken(String),
}

/// Proxy-walk failures. Non-fatal: the resolver stops walking and analysis
/// continues against the last address reached.
#[derive(Debug, Clone, Error)]
pub enum ResolverError {
    #[error("proxy resolution cycle detected")]
    CycleDetected,

    #[error("proxy resolution exceeded maximum depth")]
    DepthExceeded,
}

/// Classifier oracle failures. Non-fatal: the verdict assembler proceeds
/// without an ML opinion.
#[derive(Debug, Clone, Error)]
pub enum ClassifierError {
    #[error("classifier oracle unavailable")]
    Unavailable,

    #[error("classifier returned a malformed response: {0}")]
    Malformed(String),
}

/// History store failures. Non-fatal: drift analysis is omitted.
#[derive(Debug, Clone, Error)]
pub enum HistoryError {
    #[error("history store unavailable")]
    Unavailable,
}

/// Scan-level failures that abort the pipeline. The RPC surface still
/// produces an envelope for these (source `Default`, confidence capped at
/// 50, flag `Analysis incomplete`).
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scan deadline exceeded")]
    Deadline,

    #[error("target contract code unavailable: {0}")]
    CodeUnavailable(#[from] OracleError),

    #[error(transparent)]
    Evm(#[from] EvmError),
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_error_wraps_oracle_exhaustion() {
        let err = ScanError::from(OracleError::Timeout);
        assert!(err.to_string().contains("code unavailable"));
    }

    #[test]
    fn test_evm_error_message_carries_detail() {
        let err = EvmError::InvariantBroken("stack underflow in handler".into());
        assert!(err.to_string().contains("stack underflow"));
    }
}
