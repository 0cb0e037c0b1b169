//! Constraint Core
//!
//! One combinatorial problem per invocation: given a dataflow graph, a
//! micro-architecture model and a configuration, decide issue slots, an
//! instruction permutation, a register renaming and (optionally) software
//! pipelining stages, minimizing stalls first and a secondary objective
//! second.
//!
//! [`SchedulerCore`] binds the pieces: it parses the body, builds the
//! graph and the flat model, drives the search engine with the renaming
//! allocator as solution validator, extracts the [`ScheduleResult`] and
//! runs the structural self-check.

pub mod model;
pub mod rename;
pub mod result;
pub mod selfcheck;
pub mod solver;

use crate::arch::{Arch, MicroArch};
use crate::asm;
use crate::asm::pattern::AsmParser;
use crate::config::Config;
use crate::dfg::{Dfg, DfgConfig};
use crate::error::{Result, SlothyError};
use crate::schedule::model::SchedModel;
use crate::schedule::rename::RenameOutcome;
use crate::schedule::result::ScheduleResult;
use crate::schedule::solver::{Assignment, SolveFailure};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// Column where trailing annotations start.
const ANNOTATION_COLUMN: usize = 50;
/// Indentation of emitted instructions.
const CODE_INDENT: usize = 8;

/// The solver binding. One instance per solver invocation family: the
/// configuration is fixed at construction, `optimize` runs the search, and
/// `retry` re-solves the same body at the achieved stall count with the
/// secondary objective enabled.
pub struct SchedulerCore<'a> {
    arch: &'static dyn Arch,
    uarch: &'a dyn MicroArch,
    pub config: Config,
    last: Option<LastSolve>,
}

struct LastSolve {
    body: Vec<String>,
    stalls: usize,
}

impl<'a> SchedulerCore<'a> {
    pub fn new(
        arch: &'static dyn Arch,
        uarch: &'a dyn MicroArch,
        config: Config,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            arch,
            uarch,
            config,
            last: None,
        })
    }

    /// Optimize a body of instruction lines.
    ///
    /// With `sw_pipelining.enabled` the graph is periodic and stage
    /// variables are active. The stall budget is
    /// `constraints.stalls_allowed`; with `variable_size` the solver
    /// searches the smallest feasible stall count itself.
    pub fn optimize(&mut self, body: &[String]) -> Result<ScheduleResult> {
        let lines = asm::reduce_source(body);
        let result = self.solve_body(&lines)?;
        self.last = Some(LastSolve {
            body: lines,
            stalls: result.stalls,
        });
        Ok(result)
    }

    /// Re-solve the previous body at its achieved stall count, optimizing
    /// the secondary objective.
    pub fn retry(&mut self) -> Result<ScheduleResult> {
        let last = self
            .last
            .take()
            .ok_or_else(|| SlothyError::ConfigError("retry without prior optimize".into()))?;
        let mut config = self.config.clone();
        config.ignore_objective = false;
        config.variable_size = false;
        config.constraints.stalls_allowed = last.stalls;
        let saved = std::mem::replace(&mut self.config, config);
        let outcome = self.solve_body(&last.body);
        self.config = saved;
        self.last = Some(last);
        outcome
    }

    fn deadline(&self) -> Option<Instant> {
        self.config
            .timeout
            .map(|secs| Instant::now() + Duration::from_secs(secs))
    }

    fn solve_body(&self, lines: &[String]) -> Result<ScheduleResult> {
        let periodic = self.config.sw_pipelining.enabled;
        let parser = AsmParser::new(self.arch);
        let insts = parser.parse_body(lines, &self.config.typing_hints)?;
        let n = insts.len();
        if n == 0 {
            return Ok(ScheduleResult::identity(Vec::new()));
        }

        let mut dfg_cfg = DfgConfig::from_config(&self.config);
        if periodic {
            dfg_cfg = dfg_cfg.periodic();
        }
        let dfg = Dfg::build(insts, &dfg_cfg);
        dfg.log_dump("input dataflow graph");

        let sched_model = SchedModel::build(&dfg, self.uarch, &self.config, periodic);
        let deadline = self.deadline();

        let use_objective = self.config.has_objective
            && !self.config.ignore_objective
            && periodic
            && self.config.sw_pipelining.minimize_overlapping;

        let budget = self.config.constraints.stalls_allowed;
        let stall_counts: Vec<usize> = if self.config.variable_size {
            (0..=budget).collect()
        } else {
            vec![budget]
        };

        let mut solved: Option<(Assignment, RenameOutcome, usize, Option<usize>)> = None;
        'stalls: for stalls in stall_counts {
            let slots = n + stalls;
            // Lexicographic objective: stalls first, overlap second.
            let overlap_bounds: Vec<Option<usize>> = if use_objective {
                (0..=n).map(Some).collect()
            } else {
                vec![None]
            };
            for bound in overlap_bounds {
                let mut best: Option<(Assignment, RenameOutcome)> = None;
                let outcome = solver::solve(&sched_model, slots, bound, deadline, &mut |a| {
                    match rename::allocate(&dfg, a, self.arch, &self.config) {
                        Some(renamed) => {
                            best = Some((a.clone(), renamed));
                            true
                        }
                        None => false,
                    }
                });
                match outcome {
                    Ok(_) => {
                        let (assignment, renamed) =
                            best.expect("accepted solution without allocation");
                        let objective = bound.map(|_| assignment.overlap());
                        solved = Some((assignment, renamed, stalls, objective));
                        break 'stalls;
                    }
                    Err(SolveFailure::Infeasible) => continue,
                    Err(SolveFailure::Timeout) => {
                        return Err(SlothyError::SolverTimeout {
                            stalls_allowed: budget,
                            timeout_secs: self.config.timeout.unwrap_or(0),
                        })
                    }
                }
            }
        }

        let Some((assignment, renamed, stalls, objective)) = solved else {
            return Err(SlothyError::SolverInfeasible {
                stalls_allowed: budget,
            });
        };

        log::info!(
            "found schedule with {stalls} stalls{}",
            objective
                .map(|o| format!(", overlap {o}"))
                .unwrap_or_default()
        );

        let result = self.extract(&dfg, &assignment, &renamed, stalls, objective)?;

        if self.config.selfcheck {
            self.run_selfcheck(&dfg, &result)?;
        }
        Ok(result)
    }

    /// Build the [`ScheduleResult`] from a solved assignment.
    fn extract(
        &self,
        dfg: &Dfg,
        assignment: &Assignment,
        renamed: &RenameOutcome,
        stalls: usize,
        objective: Option<usize>,
    ) -> Result<ScheduleResult> {
        let n = dfg.len();
        let periodic = self.config.sw_pipelining.enabled;

        // Slot order.
        let mut by_slot: Vec<usize> = (0..n).collect();
        by_slot.sort_by_key(|&i| assignment.pos[i]);

        let mut reordering_with_bubbles = vec![0usize; n];
        let mut reordering = vec![0usize; n];
        let mut reordering_inv = vec![0usize; n];
        for (rank, &i) in by_slot.iter().enumerate() {
            reordering_with_bubbles[i] = assignment.pos[i];
            reordering[i] = rank;
            reordering_inv[rank] = i;
        }

        let stall_positions = assignment.stall_slots();
        let indent = " ".repeat(CODE_INDENT);

        let mut code: Vec<String> = Vec::with_capacity(n);
        for (rank, &i) in by_slot.iter().enumerate() {
            let mut line = format!("{indent}{}", renamed.insts[i].render());
            let mut notes: Vec<String> = Vec::new();
            if self.config.visualize_reordering {
                notes.push(format!("was instruction {i}"));
            }
            // Empty issue slots between this instruction and the next.
            let next_pos = by_slot
                .get(rank + 1)
                .map(|&j| assignment.pos[j])
                .unwrap_or(assignment.slots);
            let gaps = next_pos - assignment.pos[i] - 1;
            if gaps > 0 {
                notes.push(format!("{gaps} gap(s) to follow"));
            }
            if !notes.is_empty() {
                line = format!(
                    "{line:<width$} // {}",
                    notes.join("; "),
                    width = ANNOTATION_COLUMN
                );
            }
            code.push(line);
        }

        // Stage split for software pipelining.
        let mut preamble: Vec<String> = Vec::new();
        let mut postamble: Vec<String> = Vec::new();
        let mut num_exceptional_iterations = 0;
        if periodic {
            let has_early = (0..n).any(|i| assignment.shift[i] > 0);
            let has_late = (0..n).any(|i| assignment.shift[i] < 0);
            num_exceptional_iterations = usize::from(has_early) + usize::from(has_late);
            if has_early {
                for &i in &by_slot {
                    if assignment.shift[i] > 0 {
                        preamble.push(format!("{indent}{}", renamed.insts[i].render()));
                    }
                }
                if has_late {
                    for &i in &by_slot {
                        if assignment.shift[i] >= 0 {
                            preamble.push(format!("{indent}{}", renamed.insts[i].render()));
                        }
                    }
                }
            } else if has_late {
                for &i in &by_slot {
                    if assignment.shift[i] == 0 {
                        preamble.push(format!("{indent}{}", renamed.insts[i].render()));
                    }
                }
            }
            if has_late {
                if has_early {
                    for &i in &by_slot {
                        if assignment.shift[i] <= 0 {
                            postamble.push(format!("{indent}{}", renamed.insts[i].render()));
                        }
                    }
                }
                for &i in &by_slot {
                    if assignment.shift[i] < 0 {
                        postamble.push(format!("{indent}{}", renamed.insts[i].render()));
                    }
                }
            } else if has_early {
                for &i in &by_slot {
                    if assignment.shift[i] == 0 {
                        postamble.push(format!("{indent}{}", renamed.insts[i].render()));
                    }
                }
            }
        }

        // Registers carried across the kernel boundary, under their kernel
        // names: values consumed in a later kernel iteration than they are
        // produced (cross-iteration edges, adjusted by the stage shifts),
        // plus live-outs the body rewrites.
        let mut kernel_input_output: BTreeSet<String> = BTreeSet::new();
        if periodic {
            for (v, node) in dfg.nodes.iter().enumerate() {
                for (kind, pos, origin) in node.reads() {
                    let crate::dfg::Origin::Node {
                        producer,
                        cross_iter,
                    } = origin
                    else {
                        continue;
                    };
                    let delta = i64::from(cross_iter)
                        + i64::from(assignment.shift[producer.node])
                        - i64::from(assignment.shift[v]);
                    if delta >= 1 {
                        kernel_input_output
                            .insert(renamed.insts[v].operand(kind, pos).name.clone());
                    }
                }
            }
            for reg in &dfg.outputs {
                if dfg.last_writer(reg).is_some() {
                    let name = renamed
                        .output_renamings
                        .get(reg)
                        .cloned()
                        .unwrap_or_else(|| reg.clone());
                    kernel_input_output.insert(name);
                }
            }
        }

        Ok(ScheduleResult {
            code,
            preamble,
            postamble,
            stalls,
            stall_positions,
            reordering,
            reordering_inv,
            reordering_with_bubbles,
            input_renamings: renamed.input_renamings.clone(),
            output_renamings: renamed.output_renamings.clone(),
            orig_inputs: dfg.inputs.clone(),
            orig_outputs: dfg.outputs.clone(),
            kernel_input_output,
            num_exceptional_iterations,
            objective_value: objective,
            stages: assignment.shift.clone(),
        })
    }

    /// Re-parse the emitted kernel and verify structural equivalence.
    fn run_selfcheck(&self, input: &Dfg, result: &ScheduleResult) -> Result<()> {
        let parser = AsmParser::new(self.arch);
        let lines = asm::reduce_source(&result.code);
        let insts = parser.parse_body(&lines, &self.config.typing_hints)?;

        let mut dfg_cfg = DfgConfig {
            outputs: result
                .orig_outputs
                .iter()
                .map(|reg| {
                    result
                        .output_renamings
                        .get(reg)
                        .cloned()
                        .unwrap_or_else(|| reg.clone())
                })
                .collect(),
            inputs_are_outputs: false,
            waw_edges: self.config.constraints.waw_edges,
            periodic: false,
        };
        if self.config.sw_pipelining.enabled {
            dfg_cfg = dfg_cfg.periodic();
        }
        let output_dfg = Dfg::build(insts, &dfg_cfg);
        selfcheck::check(input, &output_dfg, &result.reordering, &result.stages)?;
        log::debug!("selfcheck passed");
        Ok(())
    }
}
