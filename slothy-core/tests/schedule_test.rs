//! Unit tests for the constraint core: scheduling, renaming, self-check

use slothy_core::arch::aarch64::AARCH64;
use slothy_core::arch::cortex_a55::CORTEX_A55;
use slothy_core::arch::{
    ExecUnit, InstructionTags, MicroArch, OperandRole, UnitAlternatives,
};
use slothy_core::asm::instruction::Instruction;
use slothy_core::asm::pattern::AsmParser;
use slothy_core::config::{Config, RenamePolicy};
use slothy_core::dfg::{Dfg, DfgConfig};
use slothy_core::heuristics;
use slothy_core::schedule::{selfcheck, SchedulerCore};
use slothy_core::SlothyError;
use smallvec::{smallvec, SmallVec};
use std::collections::BTreeMap;

fn body(lines: &[&str]) -> Vec<String> {
    lines.iter().map(|s| s.to_string()).collect()
}

/// Single-issue core with one universal pipe: loads take 3 cycles,
/// multiplies 4, everything else 1.
struct TestCore {
    mul_throughput: u32,
}

impl MicroArch for TestCore {
    fn name(&self) -> &'static str {
        "test-core"
    }

    fn issue_width(&self) -> usize {
        1
    }

    fn get_units(&self, _inst: &Instruction) -> SmallVec<[UnitAlternatives; 2]> {
        smallvec![smallvec![ExecUnit(0)]]
    }

    fn get_latency(
        &self,
        producer: &Instruction,
        _consumer: &Instruction,
        _role: OperandRole,
    ) -> u32 {
        let tags = producer.variant.tags;
        if tags.is_load {
            3
        } else if tags.is_mul {
            4
        } else {
            1
        }
    }

    fn get_throughput(&self, inst: &Instruction) -> u32 {
        if inst.variant.tags.is_mul {
            self.mul_throughput
        } else {
            1
        }
    }

    fn classify(&self, inst: &Instruction) -> InstructionTags {
        inst.variant.tags
    }

    fn unit_name(&self, _unit: ExecUnit) -> &'static str {
        "u0"
    }
}

/// Dual-issue core with two load pipes, for independent-load scenarios.
struct DualLoadCore;

impl MicroArch for DualLoadCore {
    fn name(&self) -> &'static str {
        "dual-load"
    }

    fn issue_width(&self) -> usize {
        2
    }

    fn get_units(&self, inst: &Instruction) -> SmallVec<[UnitAlternatives; 2]> {
        if inst.variant.tags.is_load {
            smallvec![smallvec![ExecUnit(0), ExecUnit(1)]]
        } else {
            smallvec![smallvec![ExecUnit(2), ExecUnit(3)]]
        }
    }

    fn get_latency(
        &self,
        producer: &Instruction,
        _consumer: &Instruction,
        _role: OperandRole,
    ) -> u32 {
        if producer.variant.tags.is_load {
            3
        } else {
            1
        }
    }

    fn get_throughput(&self, _inst: &Instruction) -> u32 {
        1
    }

    fn classify(&self, inst: &Instruction) -> InstructionTags {
        inst.variant.tags
    }

    fn unit_name(&self, _unit: ExecUnit) -> &'static str {
        "u"
    }
}

/// A dependent chain at issue width 2 occupies one cycle per link; the
/// second slot of every cycle stays empty.
#[test]
fn test_dependent_chain_schedules_one_per_cycle() {
    let chain = body(&[
        "add x1, x0, x0",
        "add x2, x1, x1",
        "add x3, x2, x2",
        "add x4, x3, x3",
    ]);
    let mut cfg = Config::default();
    cfg.outputs.insert("x4".to_string());

    let result = heuristics::optimize_binsearch(&chain, &AARCH64, &CORTEX_A55, &cfg)
        .expect("schedule");

    // 4 dependent unit-latency instructions at width 2: 4 cycles, so 3
    // empty slots beyond the dense packing.
    assert_eq!(result.stalls, 3);
    let cycles: Vec<usize> = (0..4)
        .map(|i| result.reordering_with_bubbles[i] / 2)
        .collect();
    assert_eq!(cycles, vec![0, 1, 2, 3]);
    // The chain admits no reordering.
    assert_eq!(result.reordering, vec![0, 1, 2, 3]);
}

/// Independent loads dual-issue in the same cycle.
#[test]
fn test_independent_loads_issue_together() {
    let loads = body(&["ldr q0, [x0, #0]", "ldr q1, [x1, #0]"]);
    let mut cfg = Config::default();
    cfg.outputs.insert("v0".to_string());
    cfg.outputs.insert("v1".to_string());

    let result = heuristics::optimize_binsearch(&loads, &AARCH64, &DualLoadCore, &cfg)
        .expect("schedule");

    assert_eq!(result.stalls, 0);
    assert_eq!(result.reordering_with_bubbles[0] / 2, 0);
    assert_eq!(result.reordering_with_bubbles[1] / 2, 0);
}

/// Renaming scenario: moving the second multiply ahead of the consumer of
/// the first requires renaming its output to preserve the dataflow.
#[test]
fn test_reordering_forces_renaming() {
    let lines = body(&[
        "mul w0, w2, w3",
        "add x4, x0, x1",
        "mul w0, w5, w6",
    ]);
    let mut cfg = Config::default();
    cfg.outputs.insert("x0".to_string());
    cfg.outputs.insert("x4".to_string());
    cfg.rename_outputs
        .insert("gpr".to_string(), RenamePolicy::Any);

    let core = TestCore { mul_throughput: 1 };
    let result =
        heuristics::optimize_binsearch(&lines, &AARCH64, &core, &cfg).expect("schedule");

    // Hiding the 4-cycle multiply latency means issuing the second
    // multiply during the wait, which clobbers x0 unless it is renamed.
    assert_eq!(result.stalls, 2);
    assert_eq!(result.reordering, vec![0, 2, 1]);
    let renamed = result.output_renamings.get("x0").expect("renaming");
    assert_ne!(renamed, "x0");
    // The consumer of the first multiply still reads x0 (renaming
    // faithfulness), and the second multiply writes the renamed register.
    let text = result.code.join("\n");
    assert!(text.contains("add x4, x0, x1"));
    assert!(text.contains(&format!(
        "mul w{}, w5, w6",
        renamed.trim_start_matches('x')
    )));
}

/// Locked registers are never chosen as rename targets.
#[test]
fn test_locked_registers_not_rename_targets() {
    let lines = body(&[
        "mul w0, w2, w3",
        "add x4, x0, x1",
        "mul w0, w5, w6",
    ]);
    let mut cfg = Config::default();
    cfg.outputs.insert("x0".to_string());
    cfg.outputs.insert("x4".to_string());
    cfg.rename_outputs
        .insert("gpr".to_string(), RenamePolicy::Any);
    cfg.locked_registers.insert("x2".to_string());

    let core = TestCore { mul_throughput: 1 };
    let result =
        heuristics::optimize_binsearch(&lines, &AARCH64, &core, &cfg).expect("schedule");
    let renamed = result.output_renamings.get("x0").expect("renaming");
    assert_ne!(renamed, "x0");
    assert_ne!(renamed, "x2");
}

/// Two instructions competing for a single pipe cannot share a cycle.
#[test]
fn test_unit_contention() {
    let muls = body(&["mul w1, w2, w3", "mul w4, w5, w6"]);
    let mut cfg = Config::default();
    cfg.outputs.insert("x1".to_string());
    cfg.outputs.insert("x4".to_string());

    let result = heuristics::optimize_binsearch(&muls, &AARCH64, &CORTEX_A55, &cfg)
        .expect("schedule");
    // Width 2, but a single multiply pipe: one cycle each.
    assert_eq!(result.stalls, 1);
}

/// Pipe throughput separates back-to-back issues on the same unit.
#[test]
fn test_throughput_blocks_pipe() {
    let muls = body(&["mul w1, w2, w3", "mul w4, w5, w6"]);
    let mut cfg = Config::default();
    cfg.outputs.insert("x1".to_string());
    cfg.outputs.insert("x4".to_string());

    let fast = TestCore { mul_throughput: 1 };
    let result =
        heuristics::optimize_binsearch(&muls, &AARCH64, &fast, &cfg).expect("schedule");
    assert_eq!(result.stalls, 0);

    let slow = TestCore { mul_throughput: 2 };
    let result =
        heuristics::optimize_binsearch(&muls, &AARCH64, &slow, &cfg).expect("schedule");
    assert_eq!(result.stalls, 1);
}

/// The reordering is a bijection on the instruction indices.
#[test]
fn test_reordering_is_permutation() {
    let lines = body(&[
        "mul w0, w2, w3",
        "add x4, x0, x1",
        "mul w7, w5, w6",
        "add x8, x7, x1",
    ]);
    let mut cfg = Config::default();
    cfg.outputs.insert("x4".to_string());
    cfg.outputs.insert("x8".to_string());

    let core = TestCore { mul_throughput: 1 };
    let result =
        heuristics::optimize_binsearch(&lines, &AARCH64, &core, &cfg).expect("schedule");

    let mut sorted = result.reordering.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![0, 1, 2, 3]);
    for (rank, &orig) in result.reordering_inv.iter().enumerate() {
        assert_eq!(result.reordering[orig], rank);
    }
}

/// Fixed seed and configuration give a reproducible schedule.
#[test]
fn test_determinism() {
    let lines = body(&[
        "mul w0, w2, w3",
        "add x4, x0, x1",
        "mul w7, w5, w6",
        "add x8, x7, x1",
    ]);
    let mut cfg = Config::default();
    cfg.outputs.insert("x4".to_string());
    cfg.outputs.insert("x8".to_string());

    let core = TestCore { mul_throughput: 1 };
    let a = heuristics::optimize_binsearch(&lines, &AARCH64, &core, &cfg).expect("first");
    let b = heuristics::optimize_binsearch(&lines, &AARCH64, &core, &cfg).expect("second");
    assert_eq!(a.code, b.code);
    assert_eq!(a.stalls, b.stalls);
    assert_eq!(a.reordering, b.reordering);
}

/// Raising the allowed stalls keeps the problem feasible.
#[test]
fn test_stall_monotonicity() {
    let chain = body(&["mul w1, w0, w0", "add x2, x1, x0"]);
    let mut cfg = Config::default();
    cfg.outputs.insert("x2".to_string());
    let core = TestCore { mul_throughput: 1 };

    let min = heuristics::optimize_binsearch(&chain, &AARCH64, &core, &cfg)
        .expect("schedule")
        .stalls;

    for extra in 0..3 {
        let mut c = cfg.clone();
        c.constraints.stalls_allowed = min + extra;
        let mut scheduler = SchedulerCore::new(&AARCH64, &core, c).expect("core");
        assert!(scheduler.optimize(&chain).is_ok());
    }
}

/// With reordering frozen, only timing is optimized.
#[test]
fn test_frozen_order() {
    let lines = body(&[
        "mul w0, w2, w3",
        "add x4, x0, x1",
        "mul w7, w5, w6",
    ]);
    let mut cfg = Config::default();
    cfg.outputs.insert("x4".to_string());
    cfg.outputs.insert("x7".to_string());
    cfg.constraints.allow_reordering = false;

    let core = TestCore { mul_throughput: 1 };
    let result =
        heuristics::optimize_binsearch(&lines, &AARCH64, &core, &cfg).expect("schedule");
    assert_eq!(result.reordering, vec![0, 1, 2]);
    // The multiply latency now sits exposed in front of the add.
    assert_eq!(result.stalls, 3);
}

/// The structural self-check rejects swapped dependencies.
#[test]
fn test_selfcheck_detects_corruption() {
    let parser = AsmParser::new(&AARCH64);
    let hints = BTreeMap::new();
    let parse = |lines: &[&str]| -> Vec<Instruction> {
        lines
            .iter()
            .map(|l| parser.parse_line(l, &hints).expect("parse"))
            .collect()
    };

    let input = Dfg::build(
        parse(&["mul v0.4s, v1.4s, v2.4s", "add v3.4s, v0.4s, v4.4s"]),
        &DfgConfig::default(),
    );
    let good = Dfg::build(
        parse(&["mul v9.4s, v1.4s, v2.4s", "add v3.4s, v9.4s, v4.4s"]),
        &DfgConfig::default(),
    );
    let corrupted = Dfg::build(
        parse(&["mul v9.4s, v1.4s, v2.4s", "add v3.4s, v8.4s, v4.4s"]),
        &DfgConfig::default(),
    );

    assert!(selfcheck::check(&input, &good, &[0, 1], &[0, 0]).is_ok());
    let err = selfcheck::check(&input, &corrupted, &[0, 1], &[0, 0]).expect_err("must fail");
    assert!(matches!(err, SlothyError::SelfCheckFailed(_)));
}

/// Exhausting the stall budget is a dedicated error.
#[test]
fn test_search_exhausted() {
    let chain = body(&["mul w1, w0, w0", "mul w2, w1, w1"]);
    let mut cfg = Config::default();
    cfg.outputs.insert("x2".to_string());
    cfg.constraints.stalls_maximum_attempt = 1;

    let core = TestCore { mul_throughput: 1 };
    let err =
        heuristics::optimize_binsearch(&chain, &AARCH64, &core, &cfg).expect_err("must fail");
    assert!(matches!(err, SlothyError::SearchExhausted { limit: 1 }));
}
