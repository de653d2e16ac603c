//! Forked-EVM execution harness.
//!
//! Builds an isolated revm instance from prefetched chain state, runs a
//! single call against it, and streams every opcode to a registered
//! [`StepObserver`] before returning. The harness owns its state database
//! and is consumed by exactly one call; it holds no process-wide mutable
//! state, so concurrent scans may build as many instances as they like.
//!
//! A revert is a normal [`Outcome`]. An internal EVM error under a
//! fully-controlled config is a bug and surfaces as
//! [`EvmError::InvariantBroken`], fatal for the enclosing scan only.

use crate::errors::EvmError;
use crate::types::Outcome;
use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_sol_types::{Panic, Revert, SolError};
use revm::db::{CacheDB, EmptyDB};
use revm::interpreter::{opcode::OpCode, Interpreter};
use revm::primitives::{AccountInfo, Bytecode, ExecutionResult, SpecId, TxKind, KECCAK_EMPTY};
use revm::{inspector_handle_register, Database, Evm, EvmContext, Inspector};
use std::collections::HashMap;

/// Base slots probed for ERC-20 balance mappings. Storage layouts vary per
/// compiler and inheritance order; at most one probe lands on the true
/// balance slot, the rest are inert writes.
pub const BALANCE_PROBE_SLOTS: [u64; 8] = [0, 1, 2, 3, 4, 5, 6, 51];

/// Slots probed when impersonating the owner in counterfactual runs.
pub const OWNER_PROBE_SLOTS: [u64; 3] = [0, 5, 51];

/// How many stack words each step snapshot keeps.
pub const STACK_SNAPSHOT_DEPTH: usize = 5;

/// Every simulated sender is funded with 100 ETH so ordinary value
/// transfers never revert on balance alone.
pub fn sender_funding() -> U256 {
    U256::from(100u64) * U256::from(10u64).pow(U256::from(18u64))
}

/// Canonical Solidity mapping slot: `keccak256(pad32(holder) ∥ pad32(base))`.
pub fn mapping_slot(holder: Address, base_slot: u64) -> U256 {
    let mut buf = [0u8; 64];
    buf[12..32].copy_from_slice(holder.as_slice());
    buf[32..64].copy_from_slice(&U256::from(base_slot).to_be_bytes::<32>());
    U256::from_be_bytes(keccak256(buf).0)
}

// ── Opcode stream ───────────────────────────────────────────────

/// One observed opcode, delivered synchronously before it executes.
#[derive(Debug, Clone)]
pub struct OpcodeStep {
    pub pc: u32,
    pub opcode: u8,
    pub opcode_name: &'static str,
    pub depth: u16,
    /// Top of the stack as hex strings, deepest last, at most
    /// [`STACK_SNAPSHOT_DEPTH`] entries.
    pub stack_top: Vec<String>,
}

/// Capability interface for consuming the opcode stream. The harness
/// pushes each step synchronously; observers never alter execution.
pub trait StepObserver {
    fn on_step(&mut self, step: &OpcodeStep);
}

/// Observer for runs where only the terminal outcome matters.
pub struct NullObserver;

impl StepObserver for NullObserver {
    fn on_step(&mut self, _step: &OpcodeStep) {}
}

fn opcode_name(op: u8) -> &'static str {
    OpCode::new(op).map(|o| o.as_str()).unwrap_or("UNKNOWN")
}

/// Bridges the revm inspector callbacks onto a [`StepObserver`].
struct StepInspector<'a> {
    observer: &'a mut dyn StepObserver,
}

impl<DB: Database> Inspector<DB> for StepInspector<'_> {
    fn step(&mut self, interp: &mut Interpreter, context: &mut EvmContext<DB>) {
        let op = interp.current_opcode();
        let mut stack_top = Vec::with_capacity(STACK_SNAPSHOT_DEPTH);
        let available = interp.stack.len().min(STACK_SNAPSHOT_DEPTH);
        for i in 0..available {
            if let Ok(word) = interp.stack.peek(i) {
                stack_top.push(format!("{word:#x}"));
            }
        }
        let step = OpcodeStep {
            pc: interp.program_counter() as u32,
            opcode: op,
            opcode_name: opcode_name(op),
            depth: context.journaled_state.depth as u16,
            stack_top,
        };
        self.observer.on_step(&step);
    }
}

// ── Run configuration ───────────────────────────────────────────

/// Block context for one run. The timestamp is an explicit input — never
/// "now" — which is what makes time-travel scenarios possible at all.
#[derive(Debug, Clone)]
pub struct BlockParams {
    pub timestamp: u64,
    pub number: u64,
    pub base_fee: u64,
    pub coinbase: Address,
    pub difficulty: U256,
    pub gas_limit: u64,
}

impl Default for BlockParams {
    fn default() -> Self {
        BlockParams {
            timestamp: 0,
            number: 19_000_000,
            base_fee: 0,
            coinbase: Address::ZERO,
            difficulty: U256::ZERO,
            gas_limit: 30_000_000,
        }
    }
}

/// Full configuration of one harness run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub chain_id: u64,
    /// Deployed code installed at `to`.
    pub code: Bytes,
    /// Storage prefix preloaded at `to`. Slots missing here read as zero,
    /// which is the correct EVM semantics for untouched storage.
    pub preloaded_storage: HashMap<U256, U256>,
    /// Holder → token amount, written across the balance probe slots.
    pub balance_injections: HashMap<Address, U256>,
    /// Impersonated owner, written across the owner probe slots.
    pub owner_injection: Option<Address>,
    /// Additional code-bearing accounts (re-homed proxy implementations).
    pub extra_accounts: Vec<(Address, Bytes)>,
    pub sender: Address,
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    pub gas_limit: u64,
    pub block: BlockParams,
}

impl RunConfig {
    pub fn new(to: Address, code: Bytes, sender: Address, data: Bytes) -> Self {
        RunConfig {
            chain_id: 1,
            code,
            preloaded_storage: HashMap::new(),
            balance_injections: HashMap::new(),
            owner_injection: None,
            extra_accounts: Vec::new(),
            sender,
            to,
            data,
            value: U256::ZERO,
            gas_limit: 5_000_000,
            block: BlockParams::default(),
        }
    }
}

// ── Execution ───────────────────────────────────────────────────

/// Run one call against a freshly built EVM. Deterministic: identical
/// configs produce byte-identical outcomes and opcode streams.
pub fn run(cfg: &RunConfig, observer: &mut dyn StepObserver) -> Result<Outcome, EvmError> {
    let mut db = CacheDB::new(EmptyDB::default());

    install_contract(&mut db, cfg.to, &cfg.code);
    for (addr, code) in &cfg.extra_accounts {
        install_contract(&mut db, *addr, code);
    }

    for (slot, value) in &cfg.preloaded_storage {
        let _ = db.insert_account_storage(cfg.to, *slot, *value);
    }

    if let Some(owner) = cfg.owner_injection {
        let word = U256::from_be_slice(owner.as_slice());
        for slot in OWNER_PROBE_SLOTS {
            let _ = db.insert_account_storage(cfg.to, U256::from(slot), word);
        }
    }

    for (holder, amount) in &cfg.balance_injections {
        for base in BALANCE_PROBE_SLOTS {
            let _ = db.insert_account_storage(cfg.to, mapping_slot(*holder, base), *amount);
        }
    }

    db.insert_account_info(
        cfg.sender,
        AccountInfo { balance: sender_funding(), nonce: 0, code_hash: KECCAK_EMPTY, code: None },
    );

    let mut evm = Evm::builder()
        .with_db(db)
        .with_external_context(StepInspector { observer })
        .with_spec_id(SpecId::CANCUN)
        .append_handler_register(inspector_handle_register)
        .modify_cfg_env(|c| {
            c.chain_id = cfg.chain_id;
        })
        .modify_block_env(|block| {
            block.number = U256::from(cfg.block.number);
            block.timestamp = U256::from(cfg.block.timestamp);
            block.basefee = U256::from(cfg.block.base_fee);
            block.coinbase = cfg.block.coinbase;
            block.difficulty = cfg.block.difficulty;
            block.gas_limit = U256::from(cfg.block.gas_limit);
            block.prevrandao = Some(B256::ZERO);
        })
        .modify_tx_env(|tx| {
            tx.caller = cfg.sender;
            tx.transact_to = TxKind::Call(cfg.to);
            tx.data = cfg.data.clone();
            tx.value = cfg.value;
            tx.gas_limit = cfg.gas_limit;
            tx.gas_price = U256::from(cfg.block.base_fee);
            tx.nonce = None;
            tx.chain_id = None;
        })
        .build();

    let result = evm
        .transact()
        .map_err(|e| EvmError::InvariantBroken(format!("transact failed under controlled config: {e:?}")))?;

    Ok(outcome_from(result.result))
}

fn install_contract(db: &mut CacheDB<EmptyDB>, address: Address, code: &Bytes) {
    let bytecode = Bytecode::new_raw(code.clone());
    let code_hash = bytecode.hash_slow();
    db.insert_account_info(
        address,
        AccountInfo { balance: U256::ZERO, nonce: 1, code_hash, code: Some(bytecode) },
    );
}

fn outcome_from(result: ExecutionResult) -> Outcome {
    match result {
        ExecutionResult::Success { gas_used, output, .. } => Outcome::success(gas_used, output.into_data()),
        ExecutionResult::Revert { gas_used, output } => {
            let reason = decode_revert_reason(&output);
            Outcome::reverted(reason, gas_used, output)
        }
        ExecutionResult::Halt { reason, gas_used } => {
            Outcome::reverted(format!("halted: {reason:?}"), gas_used, Bytes::new())
        }
    }
}

/// Decode a Solidity revert payload: `Error(string)`, `Panic(uint256)`,
/// or `"unknown"` when the payload is empty or nonstandard.
pub fn decode_revert_reason(output: &[u8]) -> String {
    if output.is_empty() {
        return "unknown".into();
    }
    if let Ok(err) = Revert::abi_decode(output, true) {
        return err.reason;
    }
    if let Ok(panic) = Panic::abi_decode(output, true) {
        return format!("panic: code {:#x}", panic.code);
    }
    "unknown".into()
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SimStatus;

    fn addr(n: u8) -> Address {
        Address::from_slice(&[n; 20])
    }

    fn code(hex_str: &str) -> Bytes {
        Bytes::from(hex::decode(hex_str).unwrap())
    }

    /// Collects (pc, opcode, depth) triples for determinism checks.
    struct Collector {
        steps: Vec<(u32, u8, u16)>,
    }

    impl StepObserver for Collector {
        fn on_step(&mut self, step: &OpcodeStep) {
            self.steps.push((step.pc, step.opcode, step.depth));
        }
    }

    #[test]
    fn test_stop_contract_succeeds() {
        let cfg = RunConfig::new(addr(2), code("00"), addr(1), Bytes::new());
        let out = run(&cfg, &mut NullObserver).unwrap();
        assert_eq!(out.status, SimStatus::Success);
    }

    #[test]
    fn test_plain_revert_reports_unknown_reason() {
        // PUSH1 0, PUSH1 0, REVERT
        let cfg = RunConfig::new(addr(2), code("60006000fd"), addr(1), Bytes::new());
        let out = run(&cfg, &mut NullObserver).unwrap();
        assert_eq!(out.status, SimStatus::Reverted);
        assert_eq!(out.revert_reason.as_deref(), Some("unknown"));
    }

    #[test]
    fn test_value_transfer_funded_by_default() {
        let mut cfg = RunConfig::new(addr(2), code("00"), addr(1), Bytes::new());
        cfg.value = U256::from(10u64).pow(U256::from(18u64)); // 1 ETH
        let out = run(&cfg, &mut NullObserver).unwrap();
        assert_eq!(out.status, SimStatus::Success, "sender funding must cover plain transfers");
    }

    #[test]
    fn test_timestamp_is_an_input_not_now() {
        // TIMESTAMP, PUSH1 0, MSTORE, PUSH1 32, PUSH1 0, RETURN
        let mut cfg = RunConfig::new(addr(2), code("4260005260206000f3"), addr(1), Bytes::new());
        cfg.block.timestamp = 1_700_000_000;
        let out = run(&cfg, &mut NullObserver).unwrap();
        assert_eq!(out.status, SimStatus::Success);
        let word = U256::from_be_slice(out.return_value.as_ref());
        assert_eq!(word, U256::from(1_700_000_000u64));
    }

    #[test]
    fn test_balance_injection_lands_on_canonical_mapping_slot() {
        // Computes keccak256(caller ∥ slot0) in-EVM and returns the stored word:
        // CALLER, PUSH1 0, MSTORE, PUSH1 0, PUSH1 32, MSTORE,
        // PUSH1 64, PUSH1 0, KECCAK256, SLOAD,
        // PUSH1 0, MSTORE, PUSH1 32, PUSH1 0, RETURN
        let balance_reader = "33600052600060205260406000205460005260206000f3";
        let sender = addr(0xAA);
        let mut cfg = RunConfig::new(addr(2), code(balance_reader), sender, Bytes::new());
        cfg.balance_injections.insert(sender, U256::from(777u64));
        let out = run(&cfg, &mut NullObserver).unwrap();
        assert_eq!(out.status, SimStatus::Success);
        assert_eq!(U256::from_be_slice(out.return_value.as_ref()), U256::from(777u64));
    }

    #[test]
    fn test_owner_injection_fills_slot_zero() {
        // PUSH1 0, SLOAD, PUSH1 0, MSTORE, PUSH1 32, PUSH1 0, RETURN
        let slot0_reader = "60005460005260206000f3";
        let owner = addr(0xBB);
        let mut cfg = RunConfig::new(addr(2), code(slot0_reader), addr(1), Bytes::new());
        cfg.owner_injection = Some(owner);
        let out = run(&cfg, &mut NullObserver).unwrap();
        let word = out.return_value.as_ref();
        assert_eq!(&word[12..32], owner.as_slice(), "owner sits in the low 20 bytes of the word");
    }

    #[test]
    fn test_missing_slots_read_zero() {
        let slot0_reader = "60005460005260206000f3";
        let cfg = RunConfig::new(addr(2), code(slot0_reader), addr(1), Bytes::new());
        let out = run(&cfg, &mut NullObserver).unwrap();
        assert_eq!(U256::from_be_slice(out.return_value.as_ref()), U256::ZERO);
    }

    #[test]
    fn test_identical_configs_yield_identical_streams() {
        let balance_reader = "33600052600060205260406000205460005260206000f3";
        let mut cfg = RunConfig::new(addr(2), code(balance_reader), addr(1), Bytes::new());
        cfg.block.timestamp = 1_700_000_000;

        let mut first = Collector { steps: Vec::new() };
        let out_a = run(&cfg, &mut first).unwrap();
        let mut second = Collector { steps: Vec::new() };
        let out_b = run(&cfg, &mut second).unwrap();

        assert_eq!(first.steps, second.steps);
        assert_eq!(out_a.gas_used, out_b.gas_used);
        assert_eq!(out_a.return_value, out_b.return_value);
    }

    #[test]
    fn test_decode_solidity_error_string() {
        let payload = Revert { reason: "Trading not open".into() }.abi_encode();
        assert_eq!(decode_revert_reason(&payload), "Trading not open");
    }

    #[test]
    fn test_steps_observed_before_run_returns() {
        let mut collector = Collector { steps: Vec::new() };
        let cfg = RunConfig::new(addr(2), code("6000600101"), addr(1), Bytes::new());
        run(&cfg, &mut collector).unwrap();
        assert!(!collector.steps.is_empty());
        // First step is the PUSH1 at pc 0.
        assert_eq!(collector.steps[0].0, 0);
    }
}
