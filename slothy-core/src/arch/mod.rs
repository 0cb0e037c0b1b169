//! Target Model Interfaces
//!
//! This module defines the contract between the optimizer core and a target:
//! the [`Arch`] trait describes the instruction set (register classes and
//! pools, the instruction variant table, loop forms) and the [`MicroArch`]
//! trait describes one concrete core (issue width, execution units,
//! latencies, throughputs).
//!
//! The optimizer core consumes both read-only and never depends on a
//! concrete target directly; the bundled AArch64/Neon model lives in
//! [`aarch64`] and a dual-issue in-order core model in [`cortex_a55`].

pub mod aarch64;
pub mod cortex_a55;

use crate::asm::instruction::Instruction;
use crate::asm::pattern::Variant;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};

/// Register classes known to the optimizer.
///
/// Stack pseudo-classes model spill slots as first-class resources so the
/// scheduler can rename them without modeling memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterClass {
    /// General-purpose registers.
    Gpr,
    /// SIMD/vector registers.
    Vector,
    /// GPR-sized stack spill slots.
    StackGpr,
    /// Vector-sized stack spill slots.
    StackVector,
    /// Untyped stack spill slots shared between classes.
    StackAny,
    /// The flags register. A distinguished class with a single name.
    Flags,
}

impl RegisterClass {
    /// All classes, in a stable order.
    pub const ALL: [RegisterClass; 6] = [
        RegisterClass::Gpr,
        RegisterClass::Vector,
        RegisterClass::StackGpr,
        RegisterClass::StackVector,
        RegisterClass::StackAny,
        RegisterClass::Flags,
    ];

    /// Stable lowercase name, used as key in configuration maps.
    pub fn name(&self) -> &'static str {
        match self {
            RegisterClass::Gpr => "gpr",
            RegisterClass::Vector => "vector",
            RegisterClass::StackGpr => "stack_gpr",
            RegisterClass::StackVector => "stack_vector",
            RegisterClass::StackAny => "stack_any",
            RegisterClass::Flags => "flags",
        }
    }

    /// Parse a class name as used in configuration maps.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "gpr" => Some(RegisterClass::Gpr),
            "vector" | "neon" => Some(RegisterClass::Vector),
            "stack_gpr" | "stack" => Some(RegisterClass::StackGpr),
            "stack_vector" | "qstack" => Some(RegisterClass::StackVector),
            "stack_any" | "stackany" => Some(RegisterClass::StackAny),
            "flags" => Some(RegisterClass::Flags),
            _ => None,
        }
    }
}

impl std::fmt::Display for RegisterClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Execution unit identifier within a [`MicroArch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExecUnit(pub u16);

/// One required issue resource, expressed as alternatives: the instruction
/// occupies any single unit out of the inner list.
pub type UnitAlternatives = SmallVec<[ExecUnit; 4]>;

/// Operand role on the consumer side of a dataflow edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandRole {
    /// Plain input operand at the given position.
    Input(usize),
    /// Read-modify-write operand at the given position.
    InOut(usize),
}

/// Coarse classification tags consumed by hazard rules and heuristics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstructionTags {
    pub is_load: bool,
    pub is_store: bool,
    pub is_mul: bool,
    pub is_stack_op: bool,
    pub is_branch: bool,
}

/// Loop terminator recognized at the end of a loop body: the countdown and
/// the conditional branch back to the loop label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopTerminator {
    /// Destination register of the countdown (`subs <reg>, ...`).
    pub counter: String,
    /// Source register of the countdown.
    pub counter_src: String,
    /// Decrement immediate, verbatim (e.g. `#1`).
    pub decrement: String,
}

/// Instruction-set model.
///
/// Implementations are stateless; the variant table is built once at startup
/// and read-only thereafter.
pub trait Arch: Sync {
    /// Target name for logging.
    fn name(&self) -> &'static str;

    /// All concrete registers of a class. `with_extras` additionally lists
    /// registers that exist but are not allocated by default.
    fn list_registers(&self, class: RegisterClass, with_extras: bool) -> Vec<String>;

    /// Registers reserved by default (never used as rename targets unless
    /// the configuration overrides the reserved set).
    fn default_reserved(&self) -> BTreeSet<String>;

    /// Alias map (alias name -> canonical name).
    fn default_aliases(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// The instruction variant table, in match-priority order.
    fn variants(&self) -> &'static [Variant];

    /// Canonicalize a concrete register name, if it belongs to any class
    /// pool. Written variants map to their canonical form (`w3` -> `x3`,
    /// `q5` -> `v5`).
    fn canonicalize(&self, name: &str) -> Option<(String, RegisterClass)>;

    /// Classify a concrete register name, if it belongs to any class pool.
    fn classify_register(&self, name: &str) -> Option<RegisterClass> {
        self.canonicalize(name).map(|(_, class)| class)
    }

    /// Register class implied by a pattern placeholder letter.
    fn placeholder_class(&self, letter: char) -> Option<RegisterClass>;

    /// Register-token sub-regex for a placeholder letter. The token must
    /// also admit the symbolic forms `x<name>` / `<name>`.
    fn placeholder_token(&self, letter: char) -> Option<&'static str>;

    /// Match the two-line loop terminator (`subs` + `cbnz`-to-label form or
    /// an architecturally equivalent pair).
    fn match_loop_terminator(
        &self,
        countdown_line: &str,
        branch_line: &str,
        label: &str,
    ) -> Option<LoopTerminator>;

    /// Emit the loop header lines for the given label, including the
    /// counter adjustment for unrolling and for iterations peeled into
    /// preamble/postamble.
    fn render_loop_start(
        &self,
        label: &str,
        indentation: usize,
        counter: &str,
        fixup: usize,
        unroll: usize,
    ) -> Vec<String>;

    /// Emit the loop terminator lines branching back to `label`.
    fn render_loop_end(
        &self,
        term: &LoopTerminator,
        label: &str,
        indentation: usize,
    ) -> Vec<String>;
}

/// Micro-architecture model of one concrete core.
pub trait MicroArch: Sync {
    /// Core name for logging.
    fn name(&self) -> &'static str;

    /// Issue slots per cycle.
    fn issue_width(&self) -> usize;

    /// Issue resources required by an instruction. Each element is a set of
    /// alternative units; the instruction occupies one unit per element.
    fn get_units(&self, inst: &Instruction) -> SmallVec<[UnitAlternatives; 2]>;

    /// Result latency of `producer` as observed by `consumer` at the given
    /// operand role, in cycles.
    fn get_latency(&self, producer: &Instruction, consumer: &Instruction, role: OperandRole)
        -> u32;

    /// Inverse throughput: cycles between successive issues on the same
    /// pipe.
    fn get_throughput(&self, inst: &Instruction) -> u32;

    /// Classification tags used by hazard rules.
    fn classify(&self, inst: &Instruction) -> InstructionTags;

    /// Display name of an execution unit.
    fn unit_name(&self, unit: ExecUnit) -> &'static str;

    /// Indentation column for unit-visualization listings.
    fn unit_indentation(&self, unit: ExecUnit) -> usize {
        4 * unit.0 as usize
    }
}
