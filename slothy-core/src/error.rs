//! Error Handling
//!
//! This module provides the error types for the optimizer using `thiserror`.
//!
//! # Error Categories
//! - **Parsing errors**: a source line matches no instruction variant
//! - **Configuration errors**: incompatible option combinations
//! - **Solver errors**: infeasibility and timeouts (recoverable by the driver)
//! - **Search errors**: the stall search exhausted its budget
//! - **Check errors**: structural self-check mismatch, loop recognition failure

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SlothyError>;

/// Optimizer error types.
///
/// Solver infeasibility and timeouts are recoverable: the heuristic driver
/// treats both as "no schedule at this stall budget" and widens the budget.
/// All other variants are fatal to the current optimization call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlothyError {
    /// A source line matched no instruction variant.
    ///
    /// Carries the offending line and a per-variant reason trace.
    #[error("failed to parse `{line}`: no matching instruction variant\n{trace}")]
    ParseError { line: String, trace: String },

    /// Incompatible configuration options.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// The current stall budget admits no schedule.
    #[error("no schedule within {stalls_allowed} stalls")]
    SolverInfeasible { stalls_allowed: usize },

    /// The solver hit its timeout before proving anything.
    ///
    /// Treated as infeasible for the purposes of the stall search.
    #[error("solver timeout after {timeout_secs}s (stall budget {stalls_allowed})")]
    SolverTimeout {
        stalls_allowed: usize,
        timeout_secs: u64,
    },

    /// The binary search hit `stalls_maximum_attempt` without success.
    #[error("exceeded stall limit {limit} without finding a working solution")]
    SearchExhausted { limit: usize },

    /// The output dataflow graph is not isomorphic to the input's.
    ///
    /// Indicates a modeling bug; never masked.
    #[error("selfcheck failed: {0}")]
    SelfCheckFailed(String),

    /// The requested loop label is absent or its terminator is missing.
    #[error("couldn't identify loop `{0}`")]
    LoopNotFound(String),
}

impl SlothyError {
    /// Whether the heuristic driver may recover by raising the stall bound.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SlothyError::SolverInfeasible { .. } | SlothyError::SolverTimeout { .. }
        )
    }
}
