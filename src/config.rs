//! Configuration for the Palisade firewall.

use anyhow::{Context, Result};
use std::collections::HashMap;

/// Chains the firewall recognizes out of the box, each with its public
/// fallback endpoints in failover order.
pub const RECOGNIZED_CHAINS: &[(u64, &[&str])] = &[
    (1, &["https://eth.llamarpc.com", "https://rpc.ankr.com/eth", "https://ethereum-rpc.publicnode.com"]),
    (10, &["https://mainnet.optimism.io", "https://optimism-rpc.publicnode.com"]),
    (56, &["https://bsc-dataseed.binance.org", "https://rpc.ankr.com/bsc"]),
    (137, &["https://polygon-rpc.com", "https://rpc.ankr.com/polygon"]),
    (8453, &["https://mainnet.base.org", "https://base-rpc.publicnode.com"]),
    (42161, &["https://arb1.arbitrum.io/rpc", "https://arbitrum-one-rpc.publicnode.com"]),
    (11155111, &["https://rpc.sepolia.org", "https://ethereum-sepolia-rpc.publicnode.com"]),
    (31337, &["http://127.0.0.1:8545"]),
];

#[derive(Debug, Clone)]
pub struct Config {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Chain id → ordered endpoint list (premium endpoint first when configured).
    pub chains: HashMap<u64, Vec<String>>,

    /// Per-endpoint oracle timeout in milliseconds (default: 5000).
    pub oracle_timeout_ms: u64,

    /// Classifier oracle URL. Empty/unset disables ML scoring.
    pub classifier_url: Option<String>,

    /// Classifier timeout in milliseconds (default: 2000).
    pub classifier_timeout_ms: u64,

    /// Overall wall-clock deadline per scan in milliseconds (default: 15000).
    pub scan_deadline_ms: u64,

    /// Gas ceiling per simulated run (default: 5M).
    pub gas_limit: u64,

    /// Deep scans preload storage slots 0..99 instead of 0..19.
    pub deep_scan: bool,

    /// Consecutive endpoint failures before the circuit opens (default: 3).
    pub breaker_threshold: u32,

    /// Seconds a tripped endpoint stays rotated out (default: 60).
    pub breaker_cooldown_secs: u64,

    /// Code cache TTL in seconds (default: 3600).
    pub code_cache_ttl_secs: u64,

    /// Scan history list cap per address (default: 100).
    pub history_cap: usize,

    /// Scan record TTL in days (default: 30).
    pub history_ttl_days: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let premium = premium_endpoints_from_env();
        Ok(Config {
            host: std::env::var("PALISADE_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("PALISADE_PORT")
                .unwrap_or_else(|_| "8765".into())
                .parse()
                .context("Invalid PALISADE_PORT")?,
            chains: endpoint_table(&premium),
            oracle_timeout_ms: std::env::var("PALISADE_ORACLE_TIMEOUT_MS")
                .unwrap_or_else(|_| "5000".into())
                .parse()
                .unwrap_or(5000),
            classifier_url: std::env::var("PALISADE_CLASSIFIER_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            classifier_timeout_ms: std::env::var("PALISADE_CLASSIFIER_TIMEOUT_MS")
                .unwrap_or_else(|_| "2000".into())
                .parse()
                .unwrap_or(2000),
            scan_deadline_ms: std::env::var("PALISADE_SCAN_DEADLINE_MS")
                .unwrap_or_else(|_| "15000".into())
                .parse()
                .unwrap_or(15000),
            gas_limit: std::env::var("PALISADE_SIM_GAS_CEILING")
                .unwrap_or_else(|_| "5000000".into())
                .parse()
                .unwrap_or(5_000_000),
            deep_scan: std::env::var("PALISADE_DEEP_SCAN")
                .unwrap_or_else(|_| "false".into())
                .parse()
                .unwrap_or(false),
            breaker_threshold: std::env::var("PALISADE_BREAKER_THRESHOLD")
                .unwrap_or_else(|_| "3".into())
                .parse()
                .unwrap_or(3),
            breaker_cooldown_secs: std::env::var("PALISADE_BREAKER_COOLDOWN")
                .unwrap_or_else(|_| "60".into())
                .parse()
                .unwrap_or(60),
            code_cache_ttl_secs: std::env::var("PALISADE_CODE_CACHE_TTL")
                .unwrap_or_else(|_| "3600".into())
                .parse()
                .unwrap_or(3600),
            history_cap: std::env::var("PALISADE_HISTORY_CAP")
                .unwrap_or_else(|_| "100".into())
                .parse()
                .unwrap_or(100),
            history_ttl_days: std::env::var("PALISADE_HISTORY_TTL_DAYS")
                .unwrap_or_else(|_| "30".into())
                .parse()
                .unwrap_or(30),
        })
    }

    /// Number of storage slots to prefetch for the target contract.
    pub fn prefetch_slots(&self) -> u64 {
        if self.deep_scan {
            100
        } else {
            20
        }
    }
}

/// Operator-supplied premium endpoints, `PALISADE_RPC_<chain_id>`.
fn premium_endpoints_from_env() -> HashMap<u64, String> {
    RECOGNIZED_CHAINS
        .iter()
        .filter_map(|(id, _)| {
            std::env::var(format!("PALISADE_RPC_{id}"))
                .ok()
                .filter(|s| !s.is_empty())
                .map(|url| (*id, url))
        })
        .collect()
}

/// Build the chain → endpoint table: premium endpoint (when configured)
/// ahead of the built-in public fallbacks.
pub fn endpoint_table(premium: &HashMap<u64, String>) -> HashMap<u64, Vec<String>> {
    RECOGNIZED_CHAINS
        .iter()
        .map(|(id, fallbacks)| {
            let mut list = Vec::with_capacity(fallbacks.len() + 1);
            if let Some(url) = premium.get(id) {
                list.push(url.clone());
            }
            list.extend(fallbacks.iter().map(|s| s.to_string()));
            (*id, list)
        })
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_table_has_all_recognized_chains() {
        let table = endpoint_table(&HashMap::new());
        for (id, _) in RECOGNIZED_CHAINS {
            assert!(table.get(id).map_or(false, |l| !l.is_empty()), "chain {id} missing");
        }
    }

    #[test]
    fn test_premium_endpoint_goes_first() {
        let mut premium = HashMap::new();
        premium.insert(1u64, "https://premium.example/eth".to_string());
        let table = endpoint_table(&premium);
        assert_eq!(table[&1][0], "https://premium.example/eth");
        assert!(table[&1].len() > 1, "fallbacks must remain after the premium endpoint");
        // Other chains are untouched.
        assert!(table[&8453][0].contains("base"));
    }
}
