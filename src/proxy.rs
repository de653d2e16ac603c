//! Proxy detection and implementation resolution.
//!
//! Recognizes EIP-1167 minimal proxies, EIP-1967 transparent proxies,
//! EIP-1822 UUPS, EIP-897 legacy proxies, and a generic escape hatch for
//! tiny custom delegators. Implementations are walked to a bounded depth
//! with mandatory cycle detection; the final non-proxy address becomes the
//! code-level analysis target while the proxy keeps the storage context.

use crate::errors::ResolverError;
use crate::oracle::ChainOracle;
use crate::types::{canonical_address, ProxyInfo, ProxyKind};
use alloy_primitives::{b256, Address, Bytes, B256, U256};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Maximum proxy→implementation hops before the walk stops.
pub const MAX_PROXY_DEPTH: u8 = 5;

/// `keccak256("eip1967.proxy.implementation") - 1`
pub const EIP1967_IMPL_SLOT: B256 = b256!("360894a13ba1a3210667c828492db98dca3e2076cc3735a920a3ca505d382bbc");

/// `keccak256("eip1967.proxy.beacon") - 1`
pub const EIP1967_BEACON_SLOT: B256 = b256!("a3f0ad74e5423aebfd80d3ef4346578335a9a72aeaee59ff6cb3582b35133d50");

/// `keccak256("eip1967.proxy.admin") - 1`
pub const EIP1967_ADMIN_SLOT: B256 = b256!("b53127684a568b3173ae13b9f8a6016e243e63b6e8ee1178d6a717850b5d6103");

/// `keccak256("PROXIABLE")` (EIP-1822 UUPS)
pub const EIP1822_SLOT: B256 = b256!("c5f16f0fcc639fa48a6947836d9850f504798523bf8c9a3a87d5876cf622bcf7");

/// `implementation()` selector for EIP-897 legacy proxies.
pub const EIP897_SELECTOR: [u8; 4] = [0x5c, 0x60, 0xda, 0x1b];

const EIP1167_PREFIX: &[u8] = &[0x36, 0x3d, 0x3d, 0x37, 0x3d, 0x3d, 0x3d, 0x36, 0x3d, 0x73];
const EIP1167_SUFFIX: &[u8] = &[0x5a, 0xf4, 0x3d, 0x82, 0x80, 0x3e, 0x90, 0x3d, 0x91, 0x60, 0x2b, 0x57, 0xfd, 0x5b, 0xf3];

/// Code smaller than this containing DELEGATECALL with no standard slot is
/// classified as a custom proxy.
const CUSTOM_PROXY_MAX_CODE: usize = 200;

/// Stable flag label for a detected proxy kind.
pub fn proxy_flag(kind: ProxyKind) -> Option<(&'static str, u32)> {
    match kind {
        ProxyKind::Eip1967Transparent => Some(("Proxy Contract (EIP-1967)", 5)),
        ProxyKind::Eip1822Uups => Some(("Proxy Contract (EIP-1822 UUPS)", 5)),
        ProxyKind::Eip897Legacy => Some(("Proxy Contract (EIP-897)", 5)),
        ProxyKind::Eip1167Minimal => Some(("Minimal Proxy (EIP-1167)", 5)),
        ProxyKind::Custom => Some(("Custom Proxy (DELEGATECALL)", 10)),
        ProxyKind::None => None,
    }
}

/// Everything the scan needs after walking a proxy chain.
#[derive(Debug, Clone)]
pub struct ResolvedProxy {
    pub info: ProxyInfo,
    /// Final address reachable from a non-proxy — the code-level target.
    pub target: Address,
    pub target_code: Bytes,
    /// Implementation code to inject at its own address so in-EVM
    /// delegatecalls resolve (proxy re-homing).
    pub extra_accounts: Vec<(Address, Bytes)>,
    /// Standard proxy slots of the original address, preloaded into the
    /// harness so the proxy's dispatch path finds its implementation.
    pub extra_storage: HashMap<U256, U256>,
}

#[derive(Debug, Clone)]
struct Detection {
    kind: ProxyKind,
    implementation: Option<Address>,
    beacon: Option<Address>,
    admin: Option<Address>,
}

fn word_to_address(word: &B256) -> Option<Address> {
    let addr = Address::from_slice(&word.0[12..32]);
    if addr == Address::ZERO {
        None
    } else {
        Some(addr)
    }
}

/// EIP-1167: fixed 10-byte prefix, fixed 15-byte suffix, implementation in
/// the 20 bytes between.
fn detect_minimal(code: &[u8]) -> Option<Address> {
    if code.len() != EIP1167_PREFIX.len() + 20 + EIP1167_SUFFIX.len() {
        return None;
    }
    if !code.starts_with(EIP1167_PREFIX) || !code.ends_with(EIP1167_SUFFIX) {
        return None;
    }
    let addr = Address::from_slice(&code[EIP1167_PREFIX.len()..EIP1167_PREFIX.len() + 20]);
    (addr != Address::ZERO).then_some(addr)
}

async fn read_slot_address(
    oracle: &dyn ChainOracle,
    chain_id: u64,
    address: Address,
    slot: B256,
) -> Option<Address> {
    match oracle.get_storage(chain_id, address, U256::from_be_bytes(slot.0)).await {
        Ok(word) => word_to_address(&word),
        Err(e) => {
            debug!(address = %canonical_address(&address), error = %e, "proxy slot read degraded");
            None
        }
    }
}

async fn detect(
    oracle: &dyn ChainOracle,
    chain_id: u64,
    address: Address,
    code: &[u8],
) -> Option<Detection> {
    if let Some(implementation) = detect_minimal(code) {
        return Some(Detection {
            kind: ProxyKind::Eip1167Minimal,
            implementation: Some(implementation),
            beacon: None,
            admin: None,
        });
    }

    if let Some(implementation) = read_slot_address(oracle, chain_id, address, EIP1967_IMPL_SLOT).await {
        let beacon = read_slot_address(oracle, chain_id, address, EIP1967_BEACON_SLOT).await;
        let admin = read_slot_address(oracle, chain_id, address, EIP1967_ADMIN_SLOT).await;
        return Some(Detection {
            kind: ProxyKind::Eip1967Transparent,
            implementation: Some(implementation),
            beacon,
            admin,
        });
    }

    if let Some(implementation) = read_slot_address(oracle, chain_id, address, EIP1822_SLOT).await {
        return Some(Detection {
            kind: ProxyKind::Eip1822Uups,
            implementation: Some(implementation),
            beacon: None,
            admin: None,
        });
    }

    if let Ok(ret) = oracle.static_call(chain_id, address, Bytes::from(EIP897_SELECTOR.to_vec())).await {
        if ret.len() >= 32 {
            let addr = Address::from_slice(&ret[ret.len() - 20..]);
            if addr != Address::ZERO {
                return Some(Detection {
                    kind: ProxyKind::Eip897Legacy,
                    implementation: Some(addr),
                    beacon: None,
                    admin: None,
                });
            }
        }
    }

    if code.len() < CUSTOM_PROXY_MAX_CODE && code.contains(&0xF4) && !code.is_empty() {
        return Some(Detection { kind: ProxyKind::Custom, implementation: None, beacon: None, admin: None });
    }

    None
}

/// Walk the proxy chain starting at `address` (whose deployed code is
/// already fetched). Never fails: resolver errors stop the walk and the
/// last address reached becomes the target.
pub async fn resolve(
    oracle: &dyn ChainOracle,
    chain_id: u64,
    address: Address,
    code: &Bytes,
) -> ResolvedProxy {
    let mut visited: HashSet<Address> = HashSet::from([address]);
    let mut current_addr = address;
    let mut current_code = code.clone();
    let mut first_hop: Option<Detection> = None;
    let mut depth: u8 = 0;
    let mut extra_accounts: Vec<(Address, Bytes)> = Vec::new();
    let mut extra_storage: HashMap<U256, U256> = HashMap::new();

    loop {
        if depth >= MAX_PROXY_DEPTH {
            warn!(address = %canonical_address(&address), "{}", ResolverError::DepthExceeded);
            break;
        }

        let Some(detection) = detect(oracle, chain_id, current_addr, &current_code).await else {
            break;
        };

        if first_hop.is_none() {
            // Preload the original proxy's dispatch slots so its in-EVM
            // delegatecall path resolves against the retained storage context.
            if detection.kind == ProxyKind::Eip1967Transparent {
                if let Some(implementation) = detection.implementation {
                    extra_storage.insert(
                        U256::from_be_bytes(EIP1967_IMPL_SLOT.0),
                        U256::from_be_slice(implementation.as_slice()),
                    );
                }
            }
            if detection.kind == ProxyKind::Eip1822Uups {
                if let Some(implementation) = detection.implementation {
                    extra_storage.insert(
                        U256::from_be_bytes(EIP1822_SLOT.0),
                        U256::from_be_slice(implementation.as_slice()),
                    );
                }
            }
            first_hop = Some(detection.clone());
        }

        let Some(implementation) = detection.implementation else {
            // Custom proxies expose no resolvable implementation.
            depth += 1;
            break;
        };

        if !visited.insert(implementation) {
            warn!(address = %canonical_address(&implementation), "{}", ResolverError::CycleDetected);
            break;
        }

        let impl_code = match oracle.get_code(chain_id, implementation).await {
            Ok(code) if !code.is_empty() => code,
            Ok(_) => {
                debug!(implementation = %canonical_address(&implementation), "implementation has no code");
                break;
            }
            Err(e) => {
                debug!(implementation = %canonical_address(&implementation), error = %e, "implementation fetch degraded");
                break;
            }
        };

        extra_accounts.push((implementation, impl_code.clone()));
        current_addr = implementation;
        current_code = impl_code;
        depth += 1;
    }

    let info = match &first_hop {
        Some(detection) => ProxyInfo {
            is_proxy: true,
            proxy_kind: detection.kind,
            implementation: detection.implementation.map(|a| canonical_address(&a)),
            beacon: detection.beacon.map(|a| canonical_address(&a)),
            admin: detection.admin.map(|a| canonical_address(&a)),
            depth,
        },
        None => ProxyInfo::none(),
    };

    ResolvedProxy { info, target: current_addr, target_code: current_code, extra_accounts, extra_storage }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::OracleError;
    use async_trait::async_trait;

    #[derive(Default)]
    struct FakeOracle {
        codes: HashMap<Address, Bytes>,
        storage: HashMap<(Address, U256), U256>,
        calls: HashMap<Address, Bytes>,
    }

    #[async_trait]
    impl ChainOracle for FakeOracle {
        async fn get_code(&self, _chain_id: u64, address: Address) -> Result<Bytes, OracleError> {
            self.codes.get(&address).cloned().ok_or(OracleError::NotReachable)
        }

        async fn get_storage(&self, _chain_id: u64, address: Address, slot: U256) -> Result<B256, OracleError> {
            let value = self.storage.get(&(address, slot)).copied().unwrap_or(U256::ZERO);
            Ok(B256::from(value.to_be_bytes::<32>()))
        }

        async fn static_call(&self, _chain_id: u64, to: Address, _data: Bytes) -> Result<Bytes, OracleError> {
            self.calls.get(&to).cloned().ok_or(OracleError::NotReachable)
        }
    }

    fn addr(n: u8) -> Address {
        Address::from_slice(&[n; 20])
    }

    fn minimal_proxy_code(implementation: Address) -> Bytes {
        let mut code = Vec::with_capacity(45);
        code.extend_from_slice(EIP1167_PREFIX);
        code.extend_from_slice(implementation.as_slice());
        code.extend_from_slice(EIP1167_SUFFIX);
        Bytes::from(code)
    }

    fn set_impl_slot(oracle: &mut FakeOracle, proxy: Address, implementation: Address) {
        oracle.storage.insert(
            (proxy, U256::from_be_bytes(EIP1967_IMPL_SLOT.0)),
            U256::from_be_slice(implementation.as_slice()),
        );
    }

    #[tokio::test]
    async fn test_plain_contract_is_not_a_proxy() {
        let oracle = FakeOracle::default();
        let resolved = resolve(&oracle, 1, addr(1), &Bytes::from(vec![0x60, 0x00, 0x00])).await;
        assert!(!resolved.info.is_proxy);
        assert_eq!(resolved.info.proxy_kind, ProxyKind::None);
        assert_eq!(resolved.target, addr(1));
    }

    #[tokio::test]
    async fn test_minimal_proxy_resolves_embedded_implementation() {
        let implementation = addr(9);
        let mut oracle = FakeOracle::default();
        oracle.codes.insert(implementation, Bytes::from(vec![0x60, 0x01, 0x00]));
        let resolved = resolve(&oracle, 1, addr(1), &minimal_proxy_code(implementation)).await;
        assert_eq!(resolved.info.proxy_kind, ProxyKind::Eip1167Minimal);
        assert_eq!(resolved.target, implementation);
        assert_eq!(resolved.info.depth, 1);
        assert_eq!(resolved.extra_accounts.len(), 1);
    }

    #[tokio::test]
    async fn test_eip1967_slot_resolves_and_preloads_storage() {
        let proxy = addr(1);
        let implementation = addr(9);
        let mut oracle = FakeOracle::default();
        set_impl_slot(&mut oracle, proxy, implementation);
        oracle.codes.insert(implementation, Bytes::from(vec![0x60, 0x01, 0x00]));

        let resolved = resolve(&oracle, 1, proxy, &Bytes::from(vec![0x36, 0xf4, 0x00])).await;
        assert_eq!(resolved.info.proxy_kind, ProxyKind::Eip1967Transparent);
        assert_eq!(resolved.info.implementation.as_deref(), Some(canonical_address(&implementation).as_str()));
        assert_eq!(
            resolved.extra_storage.get(&U256::from_be_bytes(EIP1967_IMPL_SLOT.0)),
            Some(&U256::from_be_slice(implementation.as_slice()))
        );
        assert_eq!(resolved.target, implementation);
    }

    #[tokio::test]
    async fn test_cycle_terminates_within_depth_bound() {
        let a = addr(1);
        let b = addr(2);
        let mut oracle = FakeOracle::default();
        set_impl_slot(&mut oracle, a, b);
        set_impl_slot(&mut oracle, b, a);
        oracle.codes.insert(a, Bytes::from(vec![0x36, 0xf4, 0x00]));
        oracle.codes.insert(b, Bytes::from(vec![0x36, 0xf4, 0x00]));

        let resolved = resolve(&oracle, 1, a, &Bytes::from(vec![0x36, 0xf4, 0x00])).await;
        assert!(resolved.info.is_proxy);
        assert!(resolved.info.depth <= MAX_PROXY_DEPTH);
        // The walk stops at b when it sees a again.
        assert_eq!(resolved.target, b);
    }

    #[tokio::test]
    async fn test_custom_proxy_detected_without_implementation() {
        let oracle = FakeOracle::default();
        let tiny_delegator = Bytes::from(vec![0x36, 0x3d, 0xf4, 0x00]);
        let resolved = resolve(&oracle, 1, addr(1), &tiny_delegator).await;
        assert_eq!(resolved.info.proxy_kind, ProxyKind::Custom);
        assert!(resolved.info.implementation.is_none());
        assert_eq!(resolved.target, addr(1), "analysis stays on the proxy itself");
    }

    #[tokio::test]
    async fn test_eip897_call_resolves_low_20_bytes() {
        let proxy = addr(1);
        let implementation = addr(7);
        let mut oracle = FakeOracle::default();
        let mut word = vec![0u8; 32];
        word[12..].copy_from_slice(implementation.as_slice());
        oracle.calls.insert(proxy, Bytes::from(word));
        oracle.codes.insert(implementation, Bytes::from(vec![0x60, 0x01, 0x00]));

        // Large code so the custom-proxy heuristic cannot preempt the call probe.
        let big_code = Bytes::from(vec![0x5b; 300]);
        let resolved = resolve(&oracle, 1, proxy, &big_code).await;
        assert_eq!(resolved.info.proxy_kind, ProxyKind::Eip897Legacy);
        assert_eq!(resolved.target, implementation);
    }

    #[test]
    fn test_proxy_flag_labels_are_stable() {
        assert_eq!(proxy_flag(ProxyKind::Eip1967Transparent).unwrap().0, "Proxy Contract (EIP-1967)");
        assert!(proxy_flag(ProxyKind::None).is_none());
    }
}
