//! Heuristic Driver
//!
//! Wraps the constraint core with the search strategies that make it usable
//! on real kernels:
//!
//! - **Stall search**: binary search over the allowed-stall budget
//!   (external doubling + bisection, or the solver's own variable-size
//!   minimization), with a secondary-objective re-run at the minimum.
//! - **Periodic path**: software pipelining with unrolling and separate
//!   preamble/postamble optimization.
//! - **Halving heuristic**: rotate the optimized kernel by half and
//!   re-optimize the rotation instead of running the full pipelining model.
//! - **Split heuristic**: optimize long straight-line blocks through a
//!   sliding window with boundary names frozen.
//! - **Naive interleaving**: greedy depth-ordered pre-pass used to
//!   warm-start the solver on very large inputs.
//!
//! All entry points deep-copy the configuration before mutating it; solver
//! calls are strictly sequential.

use crate::arch::{Arch, MicroArch};
use crate::asm;
use crate::asm::pattern::AsmParser;
use crate::config::{Config, NaiveInterleavingStrategy, RenamePolicy};
use crate::dfg::{Dfg, DfgConfig};
use crate::error::{Result, SlothyError};
use crate::schedule::result::ScheduleResult;
use crate::schedule::SchedulerCore;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::io::Write;

/// Outcome of the periodic (loop) path.
#[derive(Debug, Clone)]
pub struct PeriodicOutcome {
    pub preamble: Vec<String>,
    pub kernel: Vec<String>,
    pub postamble: Vec<String>,
    pub num_exceptional_iterations: usize,
}

/// Dump a listing through the logger.
fn dump(name: &str, lines: &[String], err: bool) {
    let sink = |l: &str| {
        if err {
            log::error!("{l}");
        } else {
            log::debug!("{l}");
        }
    };
    sink(&format!("Dump: {name}"));
    for line in lines {
        sink(&format!("> {line}"));
    }
}

/// Parse a body and build its dataflow graph.
fn body_dfg(
    lines: &[String],
    arch: &'static dyn Arch,
    cfg: &Config,
    periodic: bool,
) -> Result<Dfg> {
    let parser = AsmParser::new(arch);
    let reduced = asm::reduce_source(lines);
    let insts = parser.parse_body(&reduced, &cfg.typing_hints)?;
    let mut dfg_cfg = DfgConfig::from_config(cfg);
    if periodic {
        dfg_cfg = dfg_cfg.periodic();
    }
    Ok(Dfg::build(insts, &dfg_cfg))
}

/// Write the failure dump file and log the diagnostics.
fn dump_exhausted(body: &[String], cfg: &Config) {
    log::error!("Exceeded stall limit without finding a working solution");
    log::error!("Here's what you asked me to optimize:");
    dump("Original source code", body, true);
    log::error!("Configuration:");
    cfg.log_lines(|l| log::error!("// {l}"));

    let path = std::env::temp_dir().join("slothy_error.s");
    let write_dump = || -> std::io::Result<()> {
        let mut file = std::fs::File::create(&path)?;
        cfg.log_lines(|l| {
            let _ = writeln!(file, "// {l}");
        });
        for line in body {
            writeln!(file, "{line}")?;
        }
        Ok(())
    };
    match write_dump() {
        Ok(()) => log::error!("Stored this information in {}", path.display()),
        Err(err) => log::error!("Couldn't store the failure dump: {err}"),
    }
}

/// Binary search for the minimal stall budget, then optimize the secondary
/// objective at that budget.
pub fn optimize_binsearch(
    body: &[String],
    arch: &'static dyn Arch,
    uarch: &dyn MicroArch,
    cfg: &Config,
) -> Result<ScheduleResult> {
    if cfg.variable_size {
        optimize_binsearch_internal(body, arch, uarch, cfg)
    } else {
        optimize_binsearch_external(body, arch, uarch, cfg)
    }
}

/// External search: find the minimum number of stalls without the
/// objective, then optimize the objective at that fixed number.
fn optimize_binsearch_external(
    body: &[String],
    arch: &'static dyn Arch,
    uarch: &dyn MicroArch,
    cfg: &Config,
) -> Result<ScheduleResult> {
    log::info!("Perform binary search for minimal number of stalls...");

    let mut probe_cfg = cfg.clone();
    probe_cfg.ignore_objective = true;

    let mut last_successful: Option<Vec<String>> = None;
    let mut best: Option<(usize, ScheduleResult)> = None;

    let mut try_with_stalls =
        |stalls: usize, timeout: Option<u64>| -> Result<ScheduleResult> {
            log::info!("Attempt optimization with max {stalls} stalls...");
            let mut c = probe_cfg.clone();
            c.constraints.stalls_allowed = stalls;
            if let Some(t) = timeout {
                c.timeout = Some(t);
            }
            let source = last_successful.as_deref().unwrap_or(body);
            let mut core = SchedulerCore::new(arch, uarch, c)?;
            let result = core.optimize(source)?;
            if cfg.constraints.bsearch_remember_successes {
                last_successful = Some(result.code.clone());
            }
            Ok(result)
        };

    // Doubling phase: find a feasible budget.
    let threshold = cfg.constraints.stalls_maximum_attempt;
    let precision = cfg.constraints.stalls_precision.max(1);
    let mut lo = cfg.constraints.stalls_minimum_attempt; // infeasible below
    let mut cur = cfg
        .constraints
        .stalls_first_attempt
        .max(cfg.constraints.stalls_minimum_attempt);
    loop {
        match try_with_stalls(cur, None) {
            Ok(result) => {
                best = Some((cur, result));
                break;
            }
            Err(e) if e.is_recoverable() => {
                lo = cur + 1;
                let next = (cur.max(1)) * 2;
                if next > threshold {
                    dump_exhausted(body, cfg);
                    return Err(SlothyError::SearchExhausted { limit: threshold });
                }
                cur = next;
            }
            Err(e) => return Err(e),
        }
    }

    // Bisection phase down to the requested precision.
    let (mut hi, mut hi_result) = best.expect("feasible budget recorded");
    while hi > lo && hi - lo >= precision {
        let mid = lo + (hi - lo) / 2;
        match try_with_stalls(mid, None) {
            Ok(result) => {
                hi = mid;
                hi_result = result;
            }
            Err(e) if e.is_recoverable() => lo = mid + 1,
            Err(e) => return Err(e),
        }
    }

    // Optional cheap probes below the precision with a reduced timeout.
    if let Some(short_timeout) = cfg.constraints.stalls_timeout_below_precision {
        while hi > lo {
            let mid = lo + (hi - lo) / 2;
            match try_with_stalls(mid, Some(short_timeout)) {
                Ok(result) => {
                    hi = mid;
                    hi_result = result;
                }
                Err(e) if e.is_recoverable() => lo = mid + 1,
                Err(e) => return Err(e),
            }
        }
    }

    let min_stalls = hi;
    if !cfg.has_objective {
        return Ok(hi_result);
    }

    log::info!(
        "Optimize again with minimal number of {min_stalls} stalls, with objective..."
    );
    let mut c = cfg.clone();
    c.ignore_objective = false;
    c.constraints.stalls_allowed = min_stalls;
    let mut core = SchedulerCore::new(arch, uarch, c)?;
    let source = last_successful.as_deref().unwrap_or(body);
    match core.optimize(source) {
        Ok(result) => Ok(result),
        Err(e) if e.is_recoverable() => {
            log::warn!(
                "Re-optimization with objective at minimum number of stalls failed -- \
                 should not happen? Will just pick previous result..."
            );
            Ok(hi_result)
        }
        Err(e) => Err(e),
    }
}

/// Internal search: the solver minimizes stalls itself over a
/// variable-size schedule; the driver only doubles the budget on
/// infeasibility.
fn optimize_binsearch_internal(
    body: &[String],
    arch: &'static dyn Arch,
    uarch: &dyn MicroArch,
    cfg: &Config,
) -> Result<ScheduleResult> {
    log::info!("Perform binary search for minimal number of stalls...");

    let mut cur_attempt = cfg.constraints.stalls_first_attempt.max(1);
    let (min_stalls, first_result) = loop {
        let mut c = cfg.clone();
        c.variable_size = true;
        c.ignore_objective = true;
        c.constraints.stalls_allowed = cur_attempt;

        log::info!("Attempt optimization with max {cur_attempt} stalls...");
        let mut core = SchedulerCore::new(arch, uarch, c)?;
        match core.optimize(body) {
            Ok(result) => break (result.stalls, result),
            Err(e) if e.is_recoverable() => {
                cur_attempt = (cur_attempt.max(1)) * 2;
                if cur_attempt > cfg.constraints.stalls_maximum_attempt {
                    dump_exhausted(body, cfg);
                    return Err(SlothyError::SearchExhausted {
                        limit: cfg.constraints.stalls_maximum_attempt,
                    });
                }
            }
            Err(e) => return Err(e),
        }
    };

    log::info!("Minimum number of stalls: {min_stalls}");
    if !cfg.has_objective {
        return Ok(first_result);
    }

    log::info!(
        "Optimize again with minimal number of {min_stalls} stalls, with objective..."
    );
    let mut c = cfg.clone();
    c.variable_size = false;
    c.ignore_objective = false;
    c.constraints.stalls_allowed = min_stalls;
    let mut core = SchedulerCore::new(arch, uarch, c)?;
    match core.optimize(body) {
        Ok(result) => Ok(result),
        Err(e) if e.is_recoverable() => {
            log::warn!(
                "Re-optimization with objective at minimum number of stalls failed -- \
                 should not happen? Will just pick previous result..."
            );
            Ok(first_result)
        }
        Err(e) => Err(e),
    }
}

/// Heuristics for the optimization of loop bodies.
///
/// May also be called with software pipelining disabled, in which case it
/// forwards to the linear heuristic.
pub fn periodic(
    body: &[String],
    arch: &'static dyn Arch,
    uarch: &dyn MicroArch,
    cfg: &Config,
) -> Result<PeriodicOutcome> {
    if cfg.sw_pipelining.enabled && !cfg.inputs_are_outputs {
        log::warn!(
            "You are using SW pipelining without setting inputs_are_outputs. The last \
             iteration of the loop may overwrite inputs to the loop (such as address \
             registers) unless they are marked as reserved registers."
        );
    }

    let mut cfg = cfg.clone();
    let body: Vec<String> = if cfg.sw_pipelining.enabled {
        asm::loops::unroll_body(body, cfg.sw_pipelining.unroll)
    } else {
        body.to_vec()
    };

    if cfg.inputs_are_outputs {
        let dfg = body_dfg(&body, arch, &cfg, false)?;
        cfg.outputs = dfg.outputs.clone();
        cfg.inputs_are_outputs = false;
    }

    // Without software pipelining, just forward to the linear heuristics.
    if !cfg.sw_pipelining.enabled {
        let kernel = linear(&body, arch, uarch, &cfg)?;
        return Ok(PeriodicOutcome {
            preamble: Vec::new(),
            kernel,
            postamble: Vec::new(),
            num_exceptional_iterations: 0,
        });
    }

    if cfg.sw_pipelining.halving_heuristic {
        return periodic_halving(&body, arch, uarch, &cfg);
    }

    // 'Normal' software pipelining: optimize the kernel periodically, then
    // run separate linear passes over preamble and postamble.
    log::info!("Optimize loop kernel...");
    let mut c = cfg.clone();
    c.inputs_are_outputs = true;
    let result = optimize_binsearch(&body, arch, uarch, &c)?;

    let num_exceptional_iterations = result.num_exceptional_iterations;
    let kernel = result.code.clone();

    let mut preamble = result.preamble.clone();
    if cfg.sw_pipelining.optimize_preamble && !preamble.is_empty() {
        log::debug!("Optimize preamble...");
        dump("Preamble", &preamble, false);
        log::debug!(
            "Dependencies within kernel: {:?}",
            result.kernel_input_output
        );
        let mut c = cfg.clone();
        c.outputs = result.kernel_input_output.clone();
        c.sw_pipelining.enabled = false;
        preamble = linear(&preamble, arch, uarch, &c)?;
    }

    let mut postamble = result.postamble.clone();
    if cfg.sw_pipelining.optimize_postamble && !postamble.is_empty() {
        log::debug!("Optimize postamble...");
        dump("Postamble", &postamble, false);
        let mut c = cfg.clone();
        c.sw_pipelining.enabled = false;
        postamble = linear(&postamble, arch, uarch, &c)?;
    }

    Ok(PeriodicOutcome {
        preamble,
        kernel,
        postamble,
        num_exceptional_iterations,
    })
}

/// Heuristic for the optimization of large linear chunks.
///
/// Must only be called with software pipelining disabled.
pub fn linear(
    body: &[String],
    arch: &'static dyn Arch,
    uarch: &dyn MicroArch,
    cfg: &Config,
) -> Result<Vec<String>> {
    if cfg.sw_pipelining.enabled {
        return Err(SlothyError::ConfigError(
            "linear heuristic called with software pipelining enabled".into(),
        ));
    }
    dump("Starting linear optimization...", body, false);

    if !cfg.split_heuristic.enabled {
        return Ok(optimize_binsearch(body, arch, uarch, cfg)?.code);
    }
    split(body, arch, uarch, cfg)
}

/// Greedy depth-ordered interleaving, used as a warm-start pre-pass.
///
/// At every position, pick among the instructions whose inputs and outputs
/// don't conflict with any skipped instruction, either the one of minimal
/// dependency depth or one on a different execution unit than the previous
/// pick.
pub fn naive_reordering(
    body: &[String],
    arch: &'static dyn Arch,
    uarch: &dyn MicroArch,
    cfg: &Config,
) -> Result<Vec<String>> {
    log::info!("Perform naive interleaving by depth...");
    let old = body.to_vec();
    let mut body = asm::reduce_source(body);
    let l = body.len();

    let dfg = body_dfg(&body, arch, cfg, false)?;
    let mut depths: Vec<usize> = dfg.nodes.iter().map(|n| n.depth).collect();
    let mut insts: Vec<_> = dfg.nodes.iter().map(|n| n.inst.clone()).collect();

    let mut rng = StdRng::seed_from_u64(cfg.solver_seed);
    let mut last_units: Option<Vec<crate::arch::ExecUnit>> = None;

    for i in 0..l {
        let reads = |k: usize| -> BTreeSet<String> {
            insts[k].read_registers().map(|op| op.name.clone()).collect()
        };
        let writes = |k: usize| -> BTreeSet<String> {
            insts[k]
                .written_registers()
                .map(|op| op.name.clone())
                .collect()
        };

        // Joint inputs/outputs of everything an instruction would jump
        // over.
        let mut joint_prev_reads: Vec<BTreeSet<String>> = Vec::with_capacity(l - i);
        let mut joint_prev_writes: Vec<BTreeSet<String>> = Vec::with_capacity(l - i);
        let mut acc_reads: BTreeSet<String> = BTreeSet::new();
        let mut acc_writes: BTreeSet<String> = BTreeSet::new();
        for j in i..l {
            joint_prev_reads.push(acc_reads.clone());
            joint_prev_writes.push(acc_writes.clone());
            acc_reads.extend(reads(j));
            acc_writes.extend(writes(j));
        }

        let candidates: Vec<usize> = (i..l)
            .filter(|&j| {
                let w = writes(j);
                let r = reads(j);
                w.is_disjoint(&joint_prev_reads[j - i]) && r.is_disjoint(&joint_prev_writes[j - i])
            })
            .collect();
        log::debug!("Potential next candidates: {candidates:?}");

        let flatten = |units: &[crate::arch::UnitAlternatives]| -> Vec<crate::arch::ExecUnit> {
            units.iter().flat_map(|alts| alts.iter().copied()).collect()
        };

        let choice = match cfg.split_heuristic.naive_interleaving_strategy {
            NaiveInterleavingStrategy::MinimalDepth => *candidates
                .iter()
                .min_by_key(|&&j| depths[j])
                .expect("position itself is always a candidate"),
            NaiveInterleavingStrategy::AlternateUnits => {
                let disjoint: Vec<usize> = candidates
                    .iter()
                    .copied()
                    .filter(|&j| {
                        last_units.as_ref().map_or(true, |last| {
                            flatten(&uarch.get_units(&insts[j]))
                                .iter()
                                .all(|u| !last.contains(u))
                        })
                    })
                    .collect();
                let different: Vec<usize> = candidates
                    .iter()
                    .copied()
                    .filter(|&j| {
                        last_units.as_ref()
                            != Some(&flatten(&uarch.get_units(&insts[j])))
                    })
                    .collect();
                let pick_from = if !disjoint.is_empty() {
                    &disjoint
                } else if !different.is_empty() {
                    &different
                } else {
                    &candidates
                };
                let j = pick_from[rng.gen_range(0..pick_from.len())];
                last_units = Some(flatten(&uarch.get_units(&insts[j])));
                j
            }
        };

        // Move the pick up to position i.
        let line = body.remove(choice);
        body.insert(i, line);
        let inst = insts.remove(choice);
        insts.insert(i, inst);
        let depth = depths.remove(choice);
        depths.insert(i, depth);

        body[i] = format!("    {:<100} // depth {}", body[i].trim(), depths[i]);
    }

    dump("Before naive interleaving", &old, false);
    dump("After naive interleaving", &body, false);
    Ok(body)
}

fn idxs_from_fractions(fractions: &[f64], body_len: usize) -> Vec<usize> {
    fractions
        .iter()
        .map(|f| (f * body_len as f64).round() as usize)
        .collect()
}

/// Split heuristic entry: optionally narrow to a sub-region first.
fn split(
    body: &[String],
    arch: &'static dyn Arch,
    uarch: &dyn MicroArch,
    cfg: &Config,
) -> Result<Vec<String>> {
    let body = asm::reduce_source(body);
    let region = cfg.split_heuristic.region;
    if region == [0.0, 1.0] {
        return split_inner(&body, arch, uarch, cfg);
    }

    let idxs = idxs_from_fractions(&region, body.len());
    let (start_idx, end_idx) = (idxs[0], idxs[1].min(body.len()));
    let pre = &body[..start_idx];
    let cur = &body[start_idx..end_idx];
    let post = &body[end_idx..];

    // The rest of the body determines the live-outs of the region.
    let mut c = cfg.clone();
    let mut dfg_cfg_probe = c.clone();
    dfg_cfg_probe.outputs = c.outputs.clone();
    c.outputs = body_dfg(post, arch, &dfg_cfg_probe, false)?.inputs;
    c.inputs_are_outputs = false;

    let mut out = pre.to_vec();
    out.extend(split_inner(cur, arch, uarch, &c)?);
    out.extend(post.iter().cloned());
    Ok(out)
}

/// Consecutive window list over `[0, 1)` with the given width and step.
fn window_list(factor: f64, increment: f64, body_len: usize) -> Vec<(usize, usize)> {
    let chunk_len = 1.0 / factor;
    let mut start_pos: Vec<f64> = Vec::new();
    let mut end_pos: Vec<f64> = Vec::new();
    let mut cur_start = 0.0f64;
    let mut cur_end = 0.0f64;
    while cur_end < 1.0 {
        cur_end = (cur_start + chunk_len).min(1.0);
        start_pos.push(cur_start);
        end_pos.push(cur_end);
        cur_start += increment;
    }
    let starts = idxs_from_fractions(&start_pos, body_len);
    let ends = idxs_from_fractions(&end_pos, body_len);
    starts
        .into_iter()
        .zip(ends)
        .filter(|(s, e)| s != e)
        .collect()
}

/// Log a coarse histogram of the current stall map.
fn log_stall_histogram(stalls: &BTreeSet<usize>, len: usize, factor: f64) {
    if len == 0 {
        return;
    }
    let chunk_len = ((len as f64) / factor) as usize;
    let window = chunk_len.max(2);
    let buckets = 50usize.min(len);
    let mut max_avg = 10usize;
    let mut rows: Vec<(usize, usize, usize)> = Vec::new();
    for b in 0..buckets {
        let s = len * b / buckets;
        let e = (len * (b + 1) / buckets).max(s + 1);
        let count = (s..e)
            .map(|i| {
                let lo = i.saturating_sub(window / 2);
                let hi = (i + window.div_ceil(2)).min(len);
                stalls.range(lo..hi).count()
            })
            .sum::<usize>()
            / (e - s);
        max_avg = max_avg.max(count);
        rows.push((s, e, count));
    }
    for (s, e, avg) in rows {
        log::info!(
            "[{s:3}-{e:3}]: {}{} ({avg})",
            "*".repeat(avg),
            ".".repeat(max_avg - avg)
        );
    }
}

/// One window: optimize `body[start..end]` with boundary names frozen.
///
/// Returns the new body, the updated stall map, and the window's own stall
/// count.
#[allow(clippy::too_many_arguments)]
fn optimize_chunk(
    start_idx: usize,
    end_idx: usize,
    body: Vec<String>,
    stalls: BTreeSet<usize>,
    arch: &'static dyn Arch,
    uarch: &dyn MicroArch,
    cfg: &Config,
    show_stalls: bool,
) -> Result<(Vec<String>, BTreeSet<usize>, usize)> {
    let seam = cfg.split_heuristic.optimize_seam;
    let prefix_len = seam.min(start_idx);
    let suffix_len = seam.min(body.len() - end_idx);
    let lo = start_idx - prefix_len;
    let hi = end_idx + suffix_len;

    let cur_pre: Vec<String> = body[..lo].to_vec();
    let cur_body: Vec<String> = body[lo..hi].to_vec();
    let cur_post: Vec<String> = body[hi..].to_vec();

    dump(
        &format!("Optimizing chunk [{start_idx}-{prefix_len}:{end_idx}+{suffix_len}]"),
        &cur_body,
        false,
    );

    // Live-outs of the chunk are whatever the rest of the body reads, plus
    // the block outputs.
    let mut probe = cfg.clone();
    probe.outputs = cfg.outputs.clone();
    let cur_outputs = body_dfg(&cur_post, arch, &probe, false)?.inputs;

    let mut c = cfg.clone();
    c.split_heuristic.enabled = false;
    c.rename_inputs.clear();
    c.rename_inputs
        .insert("other".to_string(), RenamePolicy::Static);
    c.rename_outputs.clear();
    c.rename_outputs
        .insert("other".to_string(), RenamePolicy::Static);
    c.inputs_are_outputs = false;
    c.outputs = cur_outputs;

    let result = optimize_binsearch(&cur_body, arch, uarch, &c)?;
    dump(
        &format!("New chunk [{start_idx}:{end_idx}]"),
        &result.code,
        false,
    );

    let mut new_body = cur_pre;
    new_body.extend(asm::reduce_source(&result.code));
    new_body.extend(cur_post);

    let mut new_stalls: BTreeSet<usize> =
        stalls.into_iter().filter(|&i| i < lo || i >= hi).collect();
    for &p in &result.stall_positions {
        new_stalls.insert(lo + p);
    }

    if show_stalls {
        log_stall_histogram(&new_stalls, new_body.len(), cfg.split_heuristic.factor);
    }
    let chunk_stalls = result.stall_positions.len();
    Ok((new_body, new_stalls, chunk_stalls))
}

#[allow(clippy::too_many_arguments)]
fn optimize_chunks_many(
    windows: &[(usize, usize)],
    mut body: Vec<String>,
    mut stalls: BTreeSet<usize>,
    arch: &'static dyn Arch,
    uarch: &dyn MicroArch,
    cfg: &Config,
    abort_stall_threshold: Option<usize>,
    show_stalls: bool,
) -> Result<(Vec<String>, BTreeSet<usize>)> {
    for &(start_idx, end_idx) in windows {
        let (new_body, new_stalls, chunk_stalls) = optimize_chunk(
            start_idx,
            end_idx,
            body,
            stalls,
            arch,
            uarch,
            cfg,
            show_stalls,
        )?;
        body = new_body;
        stalls = new_stalls;
        if let Some(threshold) = abort_stall_threshold {
            if chunk_stalls > threshold {
                log::info!(
                    "Chunk [{start_idx}:{end_idx}] exceeded {threshold} stalls; \
                     aborting this pass"
                );
                break;
            }
        }
    }
    Ok((body, stalls))
}

fn split_inner(
    body: &[String],
    arch: &'static dyn Arch,
    uarch: &dyn MicroArch,
    cfg: &Config,
) -> Result<Vec<String>> {
    let l = body.len();
    if l == 0 {
        return Ok(Vec::new());
    }
    let factor = cfg.split_heuristic.factor;

    let mut cur_body = body.to_vec();
    if cfg.split_heuristic.preprocess_naive_interleaving {
        cur_body = naive_reordering(&cur_body, arch, uarch, cfg)?;
    }

    let mut stalls: BTreeSet<usize> = BTreeSet::new();

    // Dry pass with reordering and renaming frozen, solely to obtain the
    // initial stall map.
    if cfg.split_heuristic.repeat > 0 {
        let mut dry = cfg.clone();
        dry.constraints.allow_reordering = false;
        dry.constraints.allow_renaming = false;
        let windows = window_list(factor, 1.0 / factor, cur_body.len());
        let (b, s) = optimize_chunks_many(
            &windows, cur_body, stalls, arch, uarch, &dry, None, false,
        )?;
        cur_body = b;
        stalls = s;
        log::info!("Initial stalls");
        log_stall_histogram(&stalls, cur_body.len(), factor);
    }

    let increment = cfg
        .split_heuristic
        .stepsize
        .unwrap_or(1.0 / (2.0 * factor));
    let mut rng = StdRng::seed_from_u64(cfg.solver_seed);

    for _ in 0..cfg.split_heuristic.repeat {
        cur_body = asm::reduce_source(&cur_body);

        let windows: Vec<(usize, usize)> = if let Some(chunks) = &cfg.split_heuristic.chunks {
            let starts: Vec<f64> = chunks.iter().map(|c| c.0).collect();
            let ends: Vec<f64> = chunks.iter().map(|c| c.1).collect();
            idxs_from_fractions(&starts, cur_body.len())
                .into_iter()
                .zip(idxs_from_fractions(&ends, cur_body.len()))
                .filter(|(s, e)| s != e)
                .collect()
        } else if cfg.split_heuristic.random {
            let len_total = cur_body.len();
            let len_chunk = ((len_total as f64) / factor).round() as usize;
            if len_chunk + 1 >= len_total {
                vec![(0, len_total)]
            } else {
                let start_idx = rng.gen_range(0..len_total - len_chunk - 1);
                vec![(start_idx, start_idx + len_chunk)]
            }
        } else {
            let mut w = window_list(factor, increment, cur_body.len());
            if cfg.split_heuristic.bottom_to_top {
                w.reverse();
            }
            w
        };

        let (b, s) = optimize_chunks_many(
            &windows,
            cur_body,
            stalls,
            arch,
            uarch,
            cfg,
            cfg.split_heuristic.abort_cycle_at,
            true,
        )?;
        cur_body = b;
        stalls = s;
    }

    // Annotate remaining stalls.
    let maxlen = cur_body.iter().map(|s| s.len()).max().unwrap_or(0);
    for &i in &stalls {
        if i >= cur_body.len() {
            log::error!(
                "Something is wrong: stall index {i}, body length {}",
                cur_body.len()
            );
            dump("Body", &cur_body, true);
            continue;
        }
        cur_body[i] = format!(
            "{:<width$} // gap(s) to follow",
            cur_body[i],
            width = maxlen + 8
        );
    }

    // Visualize remaining model violations with order and names frozen.
    if cfg.split_heuristic.visualize_stalls {
        let reduced = asm::reduce_source(&cur_body);
        let mut c = cfg.clone();
        c.split_heuristic.enabled = false;
        c.constraints.allow_reordering = false;
        c.constraints.allow_renaming = false;
        c.visualize_reordering = false;
        cur_body = optimize_binsearch(&reduced, arch, uarch, &c)?.code;
        cur_body.insert(0, "// Start split region".to_string());
        cur_body.push("// End split region".to_string());
    }

    // Indent by functional unit.
    if cfg.split_heuristic.visualize_units {
        let reduced = asm::reduce_source(&cur_body);
        let dfg = body_dfg(&reduced, arch, cfg, false)?;
        cur_body = dfg
            .nodes
            .iter()
            .zip(reduced.iter())
            .map(|(node, line)| {
                let unit = uarch
                    .get_units(&node.inst)
                    .first()
                    .and_then(|alts| alts.first().copied());
                let indentation = unit.map_or(0, |u| uarch.unit_indentation(u));
                format!("{}{}", " ".repeat(indentation), line.trim())
            })
            .collect();
    }

    Ok(cur_body)
}

/// Halving heuristic: optimize linearly, rotate the kernel by half, then
/// re-optimize the rotation so consecutive iterations interleave without
/// the full software-pipelining model.
fn periodic_halving(
    body: &[String],
    arch: &'static dyn Arch,
    uarch: &dyn MicroArch,
    cfg: &Config,
) -> Result<PeriodicOutcome> {
    assert!(cfg.sw_pipelining.enabled);
    assert!(cfg.sw_pipelining.halving_heuristic);

    // Loop-carried dependencies must survive the linear pass.
    let kernel_deps = body_dfg(body, arch, cfg, false)?.inputs;

    // First step: optimize the kernel without software pipelining.
    let mut c = cfg.clone();
    c.sw_pipelining.enabled = false;
    c.sw_pipelining.halving_heuristic = false;
    c.sw_pipelining.halving_heuristic_periodic = false;
    c.inputs_are_outputs = true;
    c.outputs.extend(kernel_deps.iter().cloned());
    let kernel = linear(body, arch, uarch, &c)?;

    // Second step: if the optimized body is [A;B], optimize [B;A], the
    // late half of one iteration followed by the early half of the next.
    let kernel = asm::reduce_source(&kernel);
    let kernel_len = kernel.len();
    let half = kernel_len / 2;
    let kernel_low: Vec<String> = kernel[..half].to_vec();
    let kernel_high: Vec<String> = kernel[half..].to_vec();
    let mut rotated: Vec<String> = kernel_high.clone();
    rotated.extend(kernel_low.iter().cloned());

    let preamble = kernel_low;
    let postamble = kernel_high;

    let mut dfg_probe = cfg.clone();
    dfg_probe.inputs_are_outputs = true;
    let rotation_deps = body_dfg(&rotated, arch, &dfg_probe, false)?.inputs;

    log::info!(
        "Apply halving heuristic to optimize two halves of consecutive loop kernels..."
    );

    let kernel = if cfg.sw_pipelining.halving_heuristic_periodic {
        // Consider the seam between iterations, but keep every
        // instruction in its own iteration.
        let mut c = cfg.clone();
        c.inputs_are_outputs = true;
        c.sw_pipelining.minimize_overlapping = false;
        c.sw_pipelining.enabled = true;
        c.sw_pipelining.allow_pre = false;
        c.sw_pipelining.allow_post = false;
        optimize_binsearch(&rotated, arch, uarch, &c)?.code
    } else {
        let mut c = cfg.clone();
        c.outputs = rotation_deps;
        c.sw_pipelining.enabled = false;
        c.sw_pipelining.halving_heuristic = false;
        c.sw_pipelining.halving_heuristic_periodic = false;
        linear(&rotated, arch, uarch, &c)?
    };

    Ok(PeriodicOutcome {
        preamble,
        kernel,
        postamble,
        num_exceptional_iterations: 1,
    })
}
