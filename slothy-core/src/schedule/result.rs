//! Scheduling Results
//!
//! The record a solver invocation produces and the heuristic driver
//! consumes read-only.

use std::collections::{BTreeMap, BTreeSet};

/// Result of one successful solver invocation.
#[derive(Debug, Clone, Default)]
pub struct ScheduleResult {
    /// Optimized code (the kernel, for periodic runs), renamed and
    /// reordered, one instruction per line.
    pub code: Vec<String>,
    /// Preamble instructions (periodic runs only).
    pub preamble: Vec<String>,
    /// Postamble instructions (periodic runs only).
    pub postamble: Vec<String>,

    /// Achieved number of stalls (empty issue slots).
    pub stalls: usize,
    /// Slot indices left empty in the schedule.
    pub stall_positions: Vec<usize>,

    /// Permutation: original index -> position in `code`.
    pub reordering: Vec<usize>,
    /// Inverse permutation: position in `code` -> original index.
    pub reordering_inv: Vec<usize>,
    /// Original index -> issue slot (bubbles included).
    pub reordering_with_bubbles: Vec<usize>,

    /// Live-in renamings: original register -> register in `code`.
    pub input_renamings: BTreeMap<String, String>,
    /// Live-out renamings: original register -> register in `code`.
    pub output_renamings: BTreeMap<String, String>,

    /// Original live-in set.
    pub orig_inputs: BTreeSet<String>,
    /// Original live-out set.
    pub orig_outputs: BTreeSet<String>,

    /// Registers carried between kernel iterations (periodic runs): the
    /// preamble must produce them, the postamble consumes them.
    pub kernel_input_output: BTreeSet<String>,
    /// Number of loop iterations executed outside the kernel
    /// (preamble/postamble).
    pub num_exceptional_iterations: usize,

    /// Secondary-objective value, when one was optimized (for software
    /// pipelining: the number of instructions outside the core stage).
    pub objective_value: Option<usize>,

    /// Stage shift per original instruction (`+1` early, `0` core, `-1`
    /// late); all-zero for linear runs.
    pub stages: Vec<i8>,
}

impl ScheduleResult {
    /// Identity result for a body that was not transformed.
    pub fn identity(code: Vec<String>) -> Self {
        let n = code.len();
        Self {
            reordering: (0..n).collect(),
            reordering_inv: (0..n).collect(),
            reordering_with_bubbles: (0..n).collect(),
            stages: vec![0; n],
            code,
            ..Self::default()
        }
    }
}
