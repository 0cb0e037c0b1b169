//! Micro-Architecture-Aware Assembly Superoptimization
//!
//! This crate reorders, renames and software-pipelines straight-line
//! assembly and loop kernels against a model of the target core, minimizing
//! the expected stall count while preserving the dataflow of the input.
//!
//! # Pipeline Stages
//! 1. **Parsing**: source lines are matched against the target's
//!    instruction variant table ([`asm`])
//! 2. **Dataflow analysis**: an SSA-style dependency graph with
//!    cross-iteration edges for loops ([`dfg`])
//! 3. **Constraint solving**: issue slots, instruction permutation,
//!    register renaming and pipeline stages ([`schedule`])
//! 4. **Heuristics**: stall binary search, software pipelining, halving
//!    and split heuristics ([`heuristics`])
//! 5. **Self-check**: structural equivalence of input and output graphs
//!
//! # Example
//! ```rust,no_run
//! use slothy_core::arch::{aarch64::AARCH64, cortex_a55::CORTEX_A55};
//! use slothy_core::Slothy;
//!
//! let mut slothy = Slothy::new(&AARCH64, &CORTEX_A55);
//! slothy.load_source("start:\n  mul v0.4s, v1.4s, v2.4s\nend:\n");
//! slothy.config.constraints.stalls_first_attempt = 2;
//! slothy.optimize(Some("start"), Some("end"))?;
//! println!("{}", slothy.source_text());
//! # Ok::<(), slothy_core::SlothyError>(())
//! ```

pub mod arch;
pub mod asm;
pub mod config;
pub mod dfg;
pub mod error;
pub mod heuristics;
pub mod schedule;

pub use crate::config::Config;
pub use crate::error::{Result, SlothyError};
pub use crate::schedule::result::ScheduleResult;

use crate::arch::{Arch, MicroArch};
use crate::asm::{classify_line, loops, LineKind};

/// One optimization session: a source buffer plus the target models and the
/// configuration, with region- and loop-level entry points.
pub struct Slothy<'a> {
    arch: &'static dyn Arch,
    uarch: &'a dyn MicroArch,
    /// Mutable configuration; adjust between calls.
    pub config: Config,
    source: Vec<String>,
}

impl<'a> Slothy<'a> {
    pub fn new(arch: &'static dyn Arch, uarch: &'a dyn MicroArch) -> Self {
        Self {
            arch,
            uarch,
            config: Config::default(),
            source: Vec::new(),
        }
    }

    /// Load source text, replacing the current buffer.
    pub fn load_source(&mut self, text: &str) {
        self.source = asm::split_source(text);
    }

    /// Current source lines.
    pub fn source(&self) -> &[String] {
        &self.source
    }

    /// Current source as text.
    pub fn source_text(&self) -> String {
        let mut text = self.source.join("\n");
        text.push('\n');
        text
    }

    /// Optimize the straight-line region between two labels (or the whole
    /// buffer when no labels are given). Labels, directives and comments
    /// outside the region are preserved verbatim.
    ///
    /// # Errors
    /// [`SlothyError::ConfigError`] when software pipelining is enabled
    /// (use [`Slothy::optimize_loop`]); [`SlothyError::LoopNotFound`] when
    /// a named label is absent; parse/solver errors from the core.
    pub fn optimize(&mut self, start: Option<&str>, end: Option<&str>) -> Result<()> {
        if self.config.sw_pipelining.enabled {
            return Err(SlothyError::ConfigError(
                "optimize() cannot software-pipeline a straight-line region; \
                 use optimize_loop()"
                    .into(),
            ));
        }

        let start_idx = match start {
            None => 0,
            Some(label) => self.find_label(label)? + 1,
        };
        let end_idx = match end {
            None => self.source.len(),
            Some(label) => self.find_label(label)?,
        };
        if start_idx > end_idx {
            return Err(SlothyError::ConfigError(format!(
                "region [{start:?}, {end:?}] is empty or reversed"
            )));
        }

        let body: Vec<String> = self.source[start_idx..end_idx].to_vec();
        let optimized = heuristics::linear(&body, self.arch, self.uarch, &self.config)?;

        let mut new_source: Vec<String> = self.source[..start_idx].to_vec();
        new_source.extend(optimized);
        new_source.extend(self.source[end_idx..].iter().cloned());
        self.source = new_source;
        Ok(())
    }

    /// Optimize the loop starting at `label`: recognize the body, optimize
    /// it (with software pipelining when enabled), and re-emit the loop
    /// with the counter fixed up for the exceptional iterations.
    pub fn optimize_loop(&mut self, label: &str) -> Result<()> {
        let extracted = loops::extract(&self.source, label, self.arch)?;
        log::info!(
            "Optimizing loop `{label}` ({} instructions)...",
            extracted.body.len()
        );

        let outcome =
            heuristics::periodic(&extracted.body, self.arch, self.uarch, &self.config)?;

        let mut new_source = extracted.pre.clone();
        new_source.extend(outcome.preamble.iter().cloned());
        new_source.extend(loops::render(
            self.arch,
            &extracted.info,
            &outcome.kernel,
            8,
            outcome.num_exceptional_iterations,
            self.config.sw_pipelining.unroll,
        ));
        new_source.extend(outcome.postamble.iter().cloned());
        new_source.extend(extracted.post.iter().cloned());
        self.source = new_source;
        Ok(())
    }

    fn find_label(&self, label: &str) -> Result<usize> {
        self.source
            .iter()
            .position(|line| classify_line(line) == LineKind::Label(label.to_string()))
            .ok_or_else(|| SlothyError::LoopNotFound(label.to_string()))
    }
}
