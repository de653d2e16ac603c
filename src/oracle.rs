//! Chain oracle client — code, storage, and eth_call against remote nodes.
//!
//! One client instance is shared by every concurrent scan for the life of
//! the process. Its circuit-breaker map and code cache are the only
//! process-wide mutable state in the core, both behind plain mutexes that
//! are never held across an await.

use crate::errors::OracleError;
use crate::types::canonical_address;
use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Code plus a prefix of storage slots, fetched in one logical operation
/// so the simulation battery never re-fetches mid-scan.
#[derive(Debug, Clone, Default)]
pub struct PrefetchBundle {
    pub code: Bytes,
    pub storage: HashMap<U256, U256>,
}

/// Port to any service that can answer code/storage/call queries for a
/// chain at its head block.
#[async_trait]
pub trait ChainOracle: Send + Sync {
    async fn get_code(&self, chain_id: u64, address: Address) -> Result<Bytes, OracleError>;

    async fn get_storage(&self, chain_id: u64, address: Address, slot: U256) -> Result<B256, OracleError>;

    async fn static_call(&self, chain_id: u64, to: Address, data: Bytes) -> Result<Bytes, OracleError>;

    /// Fetch code and slots `0..slots` in one pass. Individual slot
    /// failures degrade to zero (correct EVM semantics for cold storage);
    /// only a code failure fails the bundle.
    async fn prefetch(&self, chain_id: u64, address: Address, slots: u64) -> Result<PrefetchBundle, OracleError> {
        let code = self.get_code(chain_id, address).await?;
        let mut storage = HashMap::new();
        for slot in 0..slots {
            let slot = U256::from(slot);
            match self.get_storage(chain_id, address, slot).await {
                Ok(word) => {
                    let value = U256::from_be_bytes(word.0);
                    if value != U256::ZERO {
                        storage.insert(slot, value);
                    }
                }
                Err(e) => {
                    debug!(slot = %slot, error = %e, "storage prefetch slot degraded to zero");
                }
            }
        }
        Ok(PrefetchBundle { code, storage })
    }
}

// ── JSON-RPC implementation ─────────────────────────────────────

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// JSON-RPC oracle with per-chain endpoint failover, a consecutive-failure
/// circuit breaker, and a 1-hour code cache.
pub struct RpcOracle {
    client: reqwest::Client,
    chains: HashMap<u64, Vec<String>>,
    endpoint_timeout: Duration,
    breaker_threshold: u32,
    breaker_cooldown: Duration,
    code_cache_ttl: Duration,
    breaker: Mutex<HashMap<String, BreakerState>>,
    code_cache: Mutex<HashMap<(u64, Address), (Bytes, Instant)>>,
}

impl RpcOracle {
    pub fn new(
        chains: HashMap<u64, Vec<String>>,
        endpoint_timeout: Duration,
        breaker_threshold: u32,
        breaker_cooldown: Duration,
        code_cache_ttl: Duration,
    ) -> Self {
        RpcOracle {
            client: reqwest::Client::new(),
            chains,
            endpoint_timeout,
            breaker_threshold,
            breaker_cooldown,
            code_cache_ttl,
            breaker: Mutex::new(HashMap::new()),
            code_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(
            config.chains.clone(),
            Duration::from_millis(config.oracle_timeout_ms),
            config.breaker_threshold,
            Duration::from_secs(config.breaker_cooldown_secs),
            Duration::from_secs(config.code_cache_ttl_secs),
        )
    }

    fn endpoints(&self, chain_id: u64) -> Result<&[String], OracleError> {
        self.chains
            .get(&chain_id)
            .map(|v| v.as_slice())
            .filter(|v| !v.is_empty())
            .ok_or(OracleError::NotReachable)
    }

    fn breaker_open(&self, endpoint: &str) -> bool {
        let map = self.breaker.lock().unwrap();
        map.get(endpoint)
            .and_then(|s| s.open_until)
            .map_or(false, |until| Instant::now() < until)
    }

    fn record_success(&self, endpoint: &str) {
        let mut map = self.breaker.lock().unwrap();
        map.remove(endpoint);
    }

    fn record_failure(&self, endpoint: &str) {
        let mut map = self.breaker.lock().unwrap();
        let state = map.entry(endpoint.to_string()).or_default();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.breaker_threshold {
            state.open_until = Some(Instant::now() + self.breaker_cooldown);
            state.consecutive_failures = 0;
            warn!(endpoint, cooldown_secs = self.breaker_cooldown.as_secs(), "endpoint circuit opened");
        }
    }

    /// Try every endpoint for the chain in order. A single endpoint
    /// failure never fails the call — only exhausting the list does.
    async fn rpc_call(&self, chain_id: u64, method: &str, params: Value) -> Result<Value, OracleError> {
        let endpoints = self.endpoints(chain_id)?;
        let mut last_error = OracleError::NotReachable;
        let mut all_open = true;

        for endpoint in endpoints {
            if self.breaker_open(endpoint) {
                debug!(endpoint, "skipping circuit-open endpoint");
                continue;
            }
            all_open = false;

            let body = json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": 1,
            });

            let sent = self
                .client
                .post(endpoint)
                .timeout(self.endpoint_timeout)
                .json(&body)
                .send()
                .await;

            let response = match sent {
                Ok(r) => r,
                Err(e) => {
                    last_error = if e.is_timeout() { OracleError::Timeout } else { OracleError::NotReachable };
                    self.record_failure(endpoint);
                    continue;
                }
            };

            let parsed: Value = match response.json().await {
                Ok(v) => v,
                Err(e) => {
                    last_error = OracleError::InvalidResponse(e.to_string());
                    self.record_failure(endpoint);
                    continue;
                }
            };

            if let Some(err) = parsed.get("error").filter(|e| !e.is_null()) {
                last_error = OracleError::InvalidResponse(err.to_string());
                self.record_failure(endpoint);
                continue;
            }

            match parsed.get("result") {
                Some(result) => {
                    self.record_success(endpoint);
                    return Ok(result.clone());
                }
                None => {
                    last_error = OracleError::InvalidResponse("missing result field".into());
                    self.record_failure(endpoint);
                }
            }
        }

        if all_open {
            return Err(OracleError::CircuitOpen);
        }
        Err(last_error)
    }
}

fn hex_bytes(result: &Value) -> Result<Bytes, OracleError> {
    let s = result
        .as_str()
        .ok_or_else(|| OracleError::InvalidResponse("expected hex string".into()))?;
    let raw = s.trim_start_matches("0x");
    if raw.is_empty() {
        return Ok(Bytes::new());
    }
    hex::decode(raw)
        .map(Bytes::from)
        .map_err(|e| OracleError::InvalidResponse(format!("bad hex: {e}")))
}

#[async_trait]
impl ChainOracle for RpcOracle {
    async fn get_code(&self, chain_id: u64, address: Address) -> Result<Bytes, OracleError> {
        {
            let cache = self.code_cache.lock().unwrap();
            if let Some((code, fetched_at)) = cache.get(&(chain_id, address)) {
                if fetched_at.elapsed() < self.code_cache_ttl {
                    return Ok(code.clone());
                }
            }
        }

        let result = self
            .rpc_call(chain_id, "eth_getCode", json!([canonical_address(&address), "latest"]))
            .await?;
        let code = hex_bytes(&result)?;

        self.code_cache
            .lock()
            .unwrap()
            .insert((chain_id, address), (code.clone(), Instant::now()));
        Ok(code)
    }

    async fn get_storage(&self, chain_id: u64, address: Address, slot: U256) -> Result<B256, OracleError> {
        let result = self
            .rpc_call(
                chain_id,
                "eth_getStorageAt",
                json!([canonical_address(&address), format!("0x{slot:x}"), "latest"]),
            )
            .await?;
        let bytes = hex_bytes(&result)?;
        let mut word = [0u8; 32];
        let len = bytes.len().min(32);
        word[32 - len..].copy_from_slice(&bytes[bytes.len() - len..]);
        Ok(B256::from(word))
    }

    async fn static_call(&self, chain_id: u64, to: Address, data: Bytes) -> Result<Bytes, OracleError> {
        let result = self
            .rpc_call(
                chain_id,
                "eth_call",
                json!([{ "to": canonical_address(&to), "data": format!("0x{}", hex::encode(&data)) }, "latest"]),
            )
            .await?;
        hex_bytes(&result)
    }
}

// ── Tests ───────────────────────────────────────────────────────
