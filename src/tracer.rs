//! Opcode-level pattern tracer.
//!
//! Consumes the harness opcode stream and mines semantic events with a
//! tiny one-shot state machine. This is lossy static taint tracking —
//! enough for flag-grade signals, not a dataflow analysis. Sender taint
//! that survives a PUSH/DUP-heavy stack shuffle is missed on purpose.

use crate::harness::{OpcodeStep, StepObserver};
use crate::types::{MechanismStory, Severity};
use std::collections::BTreeSet;
use std::fmt;

// Opcode bytes the state machine cares about.
const ORIGIN: u8 = 0x32;
const CALLER: u8 = 0x33;
const TIMESTAMP: u8 = 0x42;
const SLOAD: u8 = 0x54;
const SSTORE: u8 = 0x55;
const LT: u8 = 0x10;
const GT: u8 = 0x11;
const SLT: u8 = 0x12;
const SGT: u8 = 0x13;
const EQ: u8 = 0x14;
const CALL: u8 = 0xF1;
const CALLCODE: u8 = 0xF2;
const DELEGATECALL: u8 = 0xF4;
const STATICCALL: u8 = 0xFA;
const SELFDESTRUCT: u8 = 0xFF;

fn is_push_or_dup(op: u8) -> bool {
    // PUSH0..PUSH32 and DUP1..DUP16
    (0x5F..=0x7F).contains(&op) || (0x80..=0x8F).contains(&op)
}

fn is_comparison(op: u8) -> bool {
    matches!(op, EQ | LT | GT | SLT | SGT)
}

/// Semantic events mined from the opcode stream, emitted monotonically by
/// `pc` within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemanticEvent {
    SenderLoaded,
    OriginLoaded,
    TimestampLoaded,
    StorageReadAfterSender,
    ComparisonAfterSender,
    ComparisonAfterTimestamp,
}

impl fmt::Display for SemanticEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SemanticEvent::SenderLoaded => "sender_loaded",
            SemanticEvent::OriginLoaded => "origin_loaded",
            SemanticEvent::TimestampLoaded => "timestamp_loaded",
            SemanticEvent::StorageReadAfterSender => "storage_read_after_sender",
            SemanticEvent::ComparisonAfterSender => "comparison_after_sender",
            SemanticEvent::ComparisonAfterTimestamp => "comparison_after_timestamp",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub pc: u32,
    pub event: SemanticEvent,
}

/// Everything the tracer mined from one call-frame root. Created per run,
/// dropped once the feature extractor has consumed it.
#[derive(Debug, Clone, Default)]
pub struct TraceResult {
    pub events: Vec<TraceEvent>,
    pub touched_slots: BTreeSet<String>,
    pub sender_loaded: bool,
    pub origin_loaded: bool,
    pub timestamp_loaded: bool,
    pub storage_read_after_sender: bool,
    pub comparison_after_sender: bool,
    pub comparison_after_timestamp: bool,
    pub steps: u64,
    pub sload_count: u64,
    pub sstore_count: u64,
    pub call_count: u64,
    pub callcode_count: u64,
    pub delegatecall_count: u64,
    pub staticcall_count: u64,
    pub selfdestruct_count: u64,
}

impl TraceResult {
    /// CALL-family opcodes observed, all variants combined.
    pub fn total_calls(&self) -> u64 {
        self.call_count + self.callcode_count + self.delegatecall_count + self.staticcall_count
    }

    /// Events rendered for the response envelope.
    pub fn event_lines(&self) -> Vec<String> {
        self.events.iter().map(|e| format!("{} @ pc {}", e.event, e.pc)).collect()
    }
}

/// The tracer itself. Constant memory per step: it keeps only the one-shot
/// flags and the accumulated result.
#[derive(Debug, Default)]
pub struct OpcodeTracer {
    result: TraceResult,
    /// Armed by CALLER/ORIGIN, survives PUSH*/DUP*, cleared by the next
    /// other opcode.
    sender_in_play: bool,
    /// Same one-shot, armed by TIMESTAMP.
    timestamp_in_play: bool,
}

impl OpcodeTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_result(self) -> TraceResult {
        self.result
    }

    fn emit(&mut self, pc: u32, event: SemanticEvent) {
        self.result.events.push(TraceEvent { pc, event });
    }
}

impl StepObserver for OpcodeTracer {
    fn on_step(&mut self, step: &OpcodeStep) {
        let op = step.opcode;
        self.result.steps += 1;

        // Resolve armed one-shots first so CALLER→SLOAD and
        // TIMESTAMP→GT chains are seen before re-arming.
        if !is_push_or_dup(op) {
            if self.sender_in_play {
                if op == SLOAD {
                    self.result.storage_read_after_sender = true;
                    self.emit(step.pc, SemanticEvent::StorageReadAfterSender);
                } else if is_comparison(op) {
                    self.result.comparison_after_sender = true;
                    self.emit(step.pc, SemanticEvent::ComparisonAfterSender);
                }
                self.sender_in_play = false;
            }
            if self.timestamp_in_play {
                if matches!(op, EQ | LT | GT) {
                    self.result.comparison_after_timestamp = true;
                    self.emit(step.pc, SemanticEvent::ComparisonAfterTimestamp);
                }
                self.timestamp_in_play = false;
            }
        }

        match op {
            CALLER => {
                self.result.sender_loaded = true;
                self.sender_in_play = true;
                self.emit(step.pc, SemanticEvent::SenderLoaded);
            }
            ORIGIN => {
                self.result.origin_loaded = true;
                self.sender_in_play = true;
                self.emit(step.pc, SemanticEvent::OriginLoaded);
            }
            TIMESTAMP => {
                self.result.timestamp_loaded = true;
                self.timestamp_in_play = true;
                self.emit(step.pc, SemanticEvent::TimestampLoaded);
            }
            SLOAD => {
                self.result.sload_count += 1;
                if let Some(slot) = step.stack_top.first() {
                    self.result.touched_slots.insert(slot.clone());
                }
            }
            SSTORE => self.result.sstore_count += 1,
            CALL => self.result.call_count += 1,
            CALLCODE => self.result.callcode_count += 1,
            DELEGATECALL => self.result.delegatecall_count += 1,
            STATICCALL => self.result.staticcall_count += 1,
            SELFDESTRUCT => self.result.selfdestruct_count += 1,
            _ => {}
        }
    }
}

// ── Mechanism story ─────────────────────────────────────────────

/// Narrate what the trace shows. Severity here reflects only what the
/// opcode patterns themselves justify; the verdict assembler may replace
/// the story when the simulation battery saw worse.
pub fn build_story(trace: &TraceResult) -> MechanismStory {
    let caller_gate = trace.comparison_after_sender || trace.storage_read_after_sender;
    let time_gate = trace.comparison_after_timestamp;

    if caller_gate && time_gate {
        return MechanismStory {
            title: "Caller and Clock Gated Execution".into(),
            story: "The contract inspects the caller identity and the block timestamp and branches on both. \
                    Whether a transaction succeeds depends on who sends it and when."
                .into(),
            severity: Severity::High,
        };
    }
    if trace.storage_read_after_sender {
        return MechanismStory {
            title: "Caller Looked Up in Storage".into(),
            story: "The caller address feeds a storage read — the classic shape of an allowlist, \
                    blocklist, or per-address balance gate."
                .into(),
            severity: Severity::Medium,
        };
    }
    if trace.comparison_after_sender {
        return MechanismStory {
            title: "Caller Identity Check".into(),
            story: "The caller address is compared against a stored value before execution proceeds. \
                    Only specific senders may pass this branch."
                .into(),
            severity: Severity::Medium,
        };
    }
    if time_gate {
        return MechanismStory {
            title: "Time-Dependent Branch".into(),
            story: "The block timestamp is compared against a stored deadline. \
                    The same transaction can behave differently at a later time."
                .into(),
            severity: Severity::Medium,
        };
    }
    if trace.origin_loaded {
        return MechanismStory {
            title: "Transaction Origin Inspection".into(),
            story: "The contract reads tx.origin, a pattern often used to discriminate contracts from EOAs.".into(),
            severity: Severity::Low,
        };
    }
    MechanismStory::safe()
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn step(pc: u32, opcode: u8, stack_top: Vec<&str>) -> OpcodeStep {
        OpcodeStep {
            pc,
            opcode,
            opcode_name: "TEST",
            depth: 1,
            stack_top: stack_top.into_iter().map(String::from).collect(),
        }
    }

    fn feed(tracer: &mut OpcodeTracer, ops: &[(u32, u8)]) {
        for (pc, op) in ops {
            tracer.on_step(&step(*pc, *op, vec![]));
        }
    }

    #[test]
    fn test_caller_then_sload_flags_storage_read() {
        let mut tracer = OpcodeTracer::new();
        // CALLER, PUSH1, SLOAD — the PUSH must not clear the one-shot.
        feed(&mut tracer, &[(0, CALLER), (1, 0x60), (3, SLOAD)]);
        let trace = tracer.into_result();
        assert!(trace.sender_loaded);
        assert!(trace.storage_read_after_sender);
        assert!(!trace.comparison_after_sender);
    }

    #[test]
    fn test_caller_then_eq_flags_comparison() {
        let mut tracer = OpcodeTracer::new();
        feed(&mut tracer, &[(0, CALLER), (1, 0x80), (2, EQ)]);
        let trace = tracer.into_result();
        assert!(trace.comparison_after_sender);
    }

    #[test]
    fn test_one_shot_cleared_by_unrelated_opcode() {
        let mut tracer = OpcodeTracer::new();
        // CALLER, ADD (0x01) clears the one-shot, then SLOAD is not attributed.
        feed(&mut tracer, &[(0, CALLER), (1, 0x01), (2, SLOAD)]);
        let trace = tracer.into_result();
        assert!(trace.sender_loaded);
        assert!(!trace.storage_read_after_sender);
    }

    #[test]
    fn test_timestamp_comparison_detected() {
        let mut tracer = OpcodeTracer::new();
        feed(&mut tracer, &[(0, 0x63), (5, TIMESTAMP), (6, GT)]);
        let trace = tracer.into_result();
        assert!(trace.timestamp_loaded);
        assert!(trace.comparison_after_timestamp);
    }

    #[test]
    fn test_origin_arms_sender_taint() {
        let mut tracer = OpcodeTracer::new();
        feed(&mut tracer, &[(0, ORIGIN), (1, EQ)]);
        let trace = tracer.into_result();
        assert!(trace.origin_loaded);
        assert!(trace.comparison_after_sender);
    }

    #[test]
    fn test_sload_records_touched_slot() {
        let mut tracer = OpcodeTracer::new();
        tracer.on_step(&step(0, SLOAD, vec!["0x4"]));
        tracer.on_step(&step(5, SLOAD, vec!["0x4"]));
        tracer.on_step(&step(9, SLOAD, vec!["0x33"]));
        let trace = tracer.into_result();
        assert_eq!(trace.sload_count, 3);
        assert_eq!(trace.touched_slots.len(), 2);
        assert!(trace.touched_slots.contains("0x4"));
    }

    #[test]
    fn test_call_family_counters() {
        let mut tracer = OpcodeTracer::new();
        feed(
            &mut tracer,
            &[(0, CALL), (1, DELEGATECALL), (2, STATICCALL), (3, CALLCODE), (4, SSTORE), (5, SELFDESTRUCT)],
        );
        let trace = tracer.into_result();
        assert_eq!(trace.total_calls(), 4);
        assert_eq!(trace.sstore_count, 1);
        assert_eq!(trace.selfdestruct_count, 1);
    }

    #[test]
    fn test_events_are_ordered_by_emission() {
        let mut tracer = OpcodeTracer::new();
        feed(&mut tracer, &[(0, CALLER), (1, SLOAD), (7, TIMESTAMP), (8, LT)]);
        let trace = tracer.into_result();
        let pcs: Vec<u32> = trace.events.iter().map(|e| e.pc).collect();
        let mut sorted = pcs.clone();
        sorted.sort_unstable();
        assert_eq!(pcs, sorted);
    }

    #[test]
    fn test_story_for_caller_gated_storage() {
        let mut tracer = OpcodeTracer::new();
        feed(&mut tracer, &[(0, CALLER), (1, SLOAD)]);
        let story = build_story(&tracer.into_result());
        assert_eq!(story.severity, Severity::Medium);
        assert!(story.title.contains("Storage"));
    }

    #[test]
    fn test_story_safe_for_plain_execution() {
        let tracer = OpcodeTracer::new();
        let story = build_story(&tracer.into_result());
        assert_eq!(story.severity, Severity::Safe);
    }
}
