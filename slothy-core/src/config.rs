//! Optimizer Configuration
//!
//! Structured configuration for the optimizer. Options are grouped into the
//! sub-sections the heuristic driver mutates independently (`sw_pipelining`,
//! `constraints`, `split_heuristic`); the driver deep-copies the whole record
//! before mutating and restores it afterward, so a `Config` handed to a solver
//! call is never shared.
//!
//! Validation happens eagerly through [`Config::validate`] so incompatible
//! flag combinations surface as [`SlothyError::ConfigError`] before any
//! solver work is done.

use crate::arch::RegisterClass;
use crate::error::{Result, SlothyError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Renaming policy for live-in/live-out registers of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenamePolicy {
    /// Keep the original register name.
    Static,
    /// Any register of the class is acceptable.
    Any,
    /// Any register of the class *except* the original name.
    Other,
}

/// Software-pipelining options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwPipelining {
    /// Enable stage variables (early/core/late) in the solver model.
    pub enabled: bool,
    /// Body duplication factor applied before optimization. Must be >= 1.
    pub unroll: usize,
    /// Secondary objective: minimize the number of instructions assigned to
    /// a non-core stage.
    pub minimize_overlapping: bool,
    /// Permit instructions to move to the early stage.
    pub allow_pre: bool,
    /// Permit instructions to move to the late stage.
    pub allow_post: bool,
    /// Run a linear optimization pass over the generated preamble.
    pub optimize_preamble: bool,
    /// Run a linear optimization pass over the generated postamble.
    pub optimize_postamble: bool,
    /// Replace full software pipelining by the halving heuristic.
    pub halving_heuristic: bool,
    /// In the halving heuristic, re-optimize the rotated kernel in periodic
    /// mode (considering the iteration seam) instead of as a linear block.
    pub halving_heuristic_periodic: bool,
}

impl Default for SwPipelining {
    fn default() -> Self {
        Self {
            enabled: false,
            unroll: 1,
            minimize_overlapping: true,
            allow_pre: true,
            allow_post: false,
            optimize_preamble: true,
            optimize_postamble: true,
            halving_heuristic: false,
            halving_heuristic_periodic: false,
        }
    }
}

/// Constraint-core options, including the stall search parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraints {
    /// Stall budget for a single solver invocation.
    pub stalls_allowed: usize,
    /// Lower bound for the binary search (exclusive start).
    pub stalls_minimum_attempt: usize,
    /// First stall budget the search probes.
    pub stalls_first_attempt: usize,
    /// Upper bound; exceeding it raises `SearchExhausted`.
    pub stalls_maximum_attempt: usize,
    /// Stop bisecting once the bracket is at most this wide.
    pub stalls_precision: usize,
    /// Optional reduced timeout (seconds) once the bracket is below the
    /// precision, to cheaply probe for small improvements.
    pub stalls_timeout_below_precision: Option<u64>,
    /// Feed each successful schedule back as the source of the next
    /// binary-search probe.
    pub bsearch_remember_successes: bool,
    /// Model store->load hazards: a load may not issue within the hazard
    /// window of a store unless base and offset provably differ.
    pub st_ld_hazard: bool,
    /// When false, instruction order is frozen (visualization passes).
    pub allow_reordering: bool,
    /// When false, register names are frozen (visualization passes).
    pub allow_renaming: bool,
    /// Model write-after-write ordering edges between writes with no
    /// intervening read.
    pub waw_edges: bool,
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            stalls_allowed: 0,
            stalls_minimum_attempt: 0,
            stalls_first_attempt: 0,
            stalls_maximum_attempt: 512,
            stalls_precision: 1,
            stalls_timeout_below_precision: None,
            bsearch_remember_successes: false,
            st_ld_hazard: true,
            allow_reordering: true,
            allow_renaming: true,
            waw_edges: false,
        }
    }
}

/// Split-heuristic options for long straight-line blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitHeuristic {
    /// Enable the split heuristic.
    pub enabled: bool,
    /// Window size is `1/factor` of the block. Must be > 1.
    pub factor: f64,
    /// Window step as a fraction of the block; defaults to `1/(2*factor)`.
    pub stepsize: Option<f64>,
    /// Number of optimization passes over the window sequence.
    pub repeat: usize,
    /// Sub-region of the block to optimize, as `[start, end]` fractions.
    pub region: [f64; 2],
    /// Pick one random window per pass instead of sliding deterministically.
    pub random: bool,
    /// Explicit window list as `(start, end)` fractions; overrides sliding.
    pub chunks: Option<Vec<(f64, f64)>>,
    /// Process windows bottom-to-top.
    pub bottom_to_top: bool,
    /// Extend each window by up to this many instructions of surrounding
    /// context so the seams between windows are re-optimized too.
    pub optimize_seam: usize,
    /// Abort the remaining windows of a pass once a single window exceeded
    /// this stall count.
    pub abort_cycle_at: Option<usize>,
    /// Greedy depth-ordered interleaving pre-pass to warm-start the solver.
    pub preprocess_naive_interleaving: bool,
    /// Strategy for the naive interleaving pre-pass.
    pub naive_interleaving_strategy: NaiveInterleavingStrategy,
    /// Annotate remaining stalls in the final listing.
    pub visualize_stalls: bool,
    /// Indent the final listing by execution unit.
    pub visualize_units: bool,
}

impl Default for SplitHeuristic {
    fn default() -> Self {
        Self {
            enabled: false,
            factor: 2.0,
            stepsize: None,
            repeat: 1,
            region: [0.0, 1.0],
            random: false,
            chunks: None,
            bottom_to_top: false,
            optimize_seam: 0,
            abort_cycle_at: None,
            preprocess_naive_interleaving: false,
            naive_interleaving_strategy: NaiveInterleavingStrategy::MinimalDepth,
            visualize_stalls: false,
            visualize_units: false,
        }
    }
}

/// Candidate-selection strategy for the naive interleaving pre-pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NaiveInterleavingStrategy {
    /// Always pick the ready instruction with the smallest dependency depth.
    MinimalDepth,
    /// Prefer ready instructions whose execution units differ from the
    /// previously picked instruction's.
    AlternateUnits,
}

/// Top-level optimizer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Software-pipelining options.
    pub sw_pipelining: SwPipelining,
    /// Constraint-core options.
    pub constraints: Constraints,
    /// Split-heuristic options.
    pub split_heuristic: SplitHeuristic,

    /// Force every live-in to also be a live-out under its original name,
    /// so no loop iteration overwrites the inputs of the next.
    pub inputs_are_outputs: bool,
    /// Explicit live-out register set.
    pub outputs: BTreeSet<String>,
    /// Registers excluded from renaming targets (on top of the
    /// architecture's default reserved set).
    pub reserved_regs: Option<BTreeSet<String>>,
    /// Registers that are never chosen as rename targets and not counted as
    /// available. Stronger than `reserved_regs`.
    pub locked_registers: BTreeSet<String>,
    /// Renaming policy for live-ins, keyed by register-class name with an
    /// `"other"` fallback entry.
    pub rename_inputs: BTreeMap<String, RenamePolicy>,
    /// Renaming policy for live-outs, keyed like `rename_inputs`.
    pub rename_outputs: BTreeMap<String, RenamePolicy>,
    /// Register-class overrides for symbolic operands.
    pub typing_hints: BTreeMap<String, RegisterClass>,

    /// Solver timeout in seconds. `None` disables the cutoff.
    pub timeout: Option<u64>,
    /// Whether a secondary objective exists for this configuration.
    pub has_objective: bool,
    /// Ignore the secondary objective even if one exists (the stall search
    /// sets this for its feasibility probes).
    pub ignore_objective: bool,
    /// Let the solver minimize stalls directly over a variable-size
    /// schedule instead of the external binary search.
    pub variable_size: bool,
    /// Annotate the output with the original instruction positions.
    pub visualize_reordering: bool,
    /// Re-parse the optimized output and verify that its dataflow graph is
    /// isomorphic to the input's.
    pub selfcheck: bool,
    /// Seed for all randomized choices (solver tie-breaking, random split
    /// windows), making runs reproducible.
    pub solver_seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sw_pipelining: SwPipelining::default(),
            constraints: Constraints::default(),
            split_heuristic: SplitHeuristic::default(),
            inputs_are_outputs: false,
            outputs: BTreeSet::new(),
            reserved_regs: None,
            locked_registers: BTreeSet::new(),
            rename_inputs: BTreeMap::new(),
            rename_outputs: BTreeMap::new(),
            typing_hints: BTreeMap::new(),
            timeout: None,
            has_objective: true,
            ignore_objective: false,
            variable_size: false,
            visualize_reordering: true,
            selfcheck: true,
            solver_seed: 42,
        }
    }
}

impl Config {
    /// Check the configuration for incompatible option combinations.
    ///
    /// # Errors
    /// Returns [`SlothyError::ConfigError`] naming the first offending
    /// option.
    pub fn validate(&self) -> Result<()> {
        if self.sw_pipelining.unroll == 0 {
            return Err(SlothyError::ConfigError(
                "sw_pipelining.unroll must be at least 1".into(),
            ));
        }
        if self.sw_pipelining.halving_heuristic && !self.sw_pipelining.enabled {
            return Err(SlothyError::ConfigError(
                "halving_heuristic requires sw_pipelining.enabled".into(),
            ));
        }
        if self.sw_pipelining.enabled
            && !self.sw_pipelining.allow_pre
            && !self.sw_pipelining.allow_post
            && !self.sw_pipelining.halving_heuristic_periodic
        {
            log::warn!(
                "sw_pipelining enabled but neither allow_pre nor allow_post is set; \
                 only the iteration seam will be considered"
            );
        }
        if self.split_heuristic.enabled {
            if self.split_heuristic.factor <= 1.0 {
                return Err(SlothyError::ConfigError(
                    "split_heuristic.factor must be greater than 1".into(),
                ));
            }
            if let Some(step) = self.split_heuristic.stepsize {
                if !(0.0..=1.0).contains(&step) || step == 0.0 {
                    return Err(SlothyError::ConfigError(
                        "split_heuristic.stepsize must lie in (0, 1]".into(),
                    ));
                }
            }
            let [lo, hi] = self.split_heuristic.region;
            if !(0.0..=1.0).contains(&lo) || !(0.0..=1.0).contains(&hi) || lo >= hi {
                return Err(SlothyError::ConfigError(format!(
                    "split_heuristic.region [{lo}, {hi}] is not a sub-range of [0, 1]"
                )));
            }
        }
        if self.constraints.stalls_minimum_attempt > self.constraints.stalls_maximum_attempt {
            return Err(SlothyError::ConfigError(
                "stalls_minimum_attempt exceeds stalls_maximum_attempt".into(),
            ));
        }
        if self.constraints.stalls_precision == 0 {
            return Err(SlothyError::ConfigError(
                "stalls_precision must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Effective renaming policy for a live-in of the given class.
    pub fn rename_input_policy(&self, class: RegisterClass) -> RenamePolicy {
        Self::lookup_policy(&self.rename_inputs, class)
    }

    /// Effective renaming policy for a live-out of the given class.
    pub fn rename_output_policy(&self, class: RegisterClass) -> RenamePolicy {
        Self::lookup_policy(&self.rename_outputs, class)
    }

    fn lookup_policy(
        map: &BTreeMap<String, RenamePolicy>,
        class: RegisterClass,
    ) -> RenamePolicy {
        map.get(class.name())
            .or_else(|| map.get("other"))
            .copied()
            .unwrap_or(RenamePolicy::Static)
    }

    /// Log the full configuration through the given sink, one line each.
    ///
    /// Used for the diagnostics dump on search exhaustion.
    pub fn log_lines(&self, mut sink: impl FnMut(&str)) {
        match serde_json::to_string_pretty(self) {
            Ok(rendered) => {
                for line in rendered.lines() {
                    sink(line);
                }
            }
            Err(err) => sink(&format!("<config serialization failed: {err}>")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_unroll_rejected() {
        let mut cfg = Config::default();
        cfg.sw_pipelining.unroll = 0;
        assert!(matches!(
            cfg.validate(),
            Err(SlothyError::ConfigError(_))
        ));
    }

    #[test]
    fn halving_without_pipelining_rejected() {
        let mut cfg = Config::default();
        cfg.sw_pipelining.halving_heuristic = true;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn split_region_checked() {
        let mut cfg = Config::default();
        cfg.split_heuristic.enabled = true;
        cfg.split_heuristic.region = [0.7, 0.3];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rename_policy_falls_back_to_other() {
        let mut cfg = Config::default();
        cfg.rename_inputs
            .insert("other".to_string(), RenamePolicy::Any);
        cfg.rename_inputs
            .insert("gpr".to_string(), RenamePolicy::Static);
        assert_eq!(
            cfg.rename_input_policy(RegisterClass::Gpr),
            RenamePolicy::Static
        );
        assert_eq!(
            cfg.rename_input_policy(RegisterClass::Vector),
            RenamePolicy::Any
        );
    }
}
