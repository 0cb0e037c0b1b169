//! Unit tests for the heuristic driver: software pipelining, halving and
//! split heuristics, end-to-end source optimization

use slothy_core::arch::aarch64::AARCH64;
use slothy_core::arch::cortex_a55::CORTEX_A55;
use slothy_core::arch::{
    ExecUnit, InstructionTags, MicroArch, OperandRole, UnitAlternatives,
};
use slothy_core::asm::instruction::Instruction;
use slothy_core::asm::reduce_source;
use slothy_core::config::Config;
use slothy_core::heuristics;
use slothy_core::{Slothy, SlothyError};
use smallvec::{smallvec, SmallVec};

fn body(lines: &[&str]) -> Vec<String> {
    lines.iter().map(|s| s.to_string()).collect()
}

/// Single-issue core with one universal pipe: loads take 3 cycles,
/// multiplies 4, everything else 1.
struct TestCore;

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

    fn get_throughput(&self, _inst: &Instruction) -> u32 {
        1
    }

    fn classify(&self, inst: &Instruction) -> InstructionTags {
        inst.variant.tags
    }

    fn unit_name(&self, _unit: ExecUnit) -> &'static str {
        "u0"
    }
}

/// Software pipelining hoists the load of the next iteration into the
/// latency shadow of the current one.
#[test]
fn test_software_pipelining_hoists_load() {
    let kernel = body(&[
        "ldr q0, [x0], #16",
        "mul v1.4s, v0.4s, v8.4s",
        "str q1, [x1], #16",
    ]);
    let mut cfg = Config::default();
    cfg.sw_pipelining.enabled = true;
    cfg.inputs_are_outputs = true;
    cfg.constraints.st_ld_hazard = false;

    let result =
        heuristics::optimize_binsearch(&kernel, &AARCH64, &TestCore, &cfg).expect("schedule");

    // Linear scheduling leaves the full load+multiply latency exposed (5
    // stalls); overlapping iterations hides the load.
    assert_eq!(result.stalls, 2);
    assert_eq!(result.num_exceptional_iterations, 1);
    // Minimal overlap: only the load moves to the early stage.
    assert_eq!(result.objective_value, Some(1));
    assert_eq!(result.preamble.len(), 1);
    assert!(result.preamble[0].contains("ldr"));
    assert_eq!(result.postamble.len(), 2);
    // The carried load target is announced to the preamble optimization.
    assert!(!result.kernel_input_output.is_empty());
}

#[test]
fn test_linear_beats_nothing_without_pipelining() {
    let kernel = body(&[
        "ldr q0, [x0], #16",
        "mul v1.4s, v0.4s, v8.4s",
        "str q1, [x1], #16",
    ]);
    let mut cfg = Config::default();
    cfg.inputs_are_outputs = true;
    cfg.constraints.st_ld_hazard = false;

    // Same kernel without pipelining: the latencies stay exposed.
    let outcome = heuristics::periodic(&kernel, &AARCH64, &TestCore, &cfg).expect("linear");
    assert!(outcome.preamble.is_empty());
    assert!(outcome.postamble.is_empty());
    assert_eq!(outcome.num_exceptional_iterations, 0);
    assert_eq!(reduce_source(&outcome.kernel).len(), 3);
}

/// Halving heuristic: the rotated kernel `[B;A]` interleaves consecutive
/// iterations and removes the stalls of the linear schedule.
#[test]
fn test_halving_heuristic() {
    let kernel = body(&[
        "mul v0.4s, v8.4s, v9.4s",
        "add v1.4s, v0.4s, v10.4s",
    ]);
    let mut cfg = Config::default();
    cfg.sw_pipelining.enabled = true;
    cfg.sw_pipelining.halving_heuristic = true;

    let outcome =
        heuristics::periodic(&kernel, &AARCH64, &TestCore, &cfg).expect("halving");

    assert_eq!(outcome.num_exceptional_iterations, 1);
    // Preamble and postamble are the two halves of the linear schedule.
    assert_eq!(reduce_source(&outcome.preamble).len(), 1);
    assert!(outcome.preamble[0].contains("mul"));
    assert_eq!(reduce_source(&outcome.postamble).len(), 1);
    assert!(outcome.postamble[0].contains("add"));
    // The rotated kernel starts with the late half.
    let kernel_lines = reduce_source(&outcome.kernel);
    assert_eq!(kernel_lines.len(), 2);
    assert!(kernel_lines[0].contains("add"));
    assert!(kernel_lines[1].contains("mul"));
}

#[test]
fn test_halving_heuristic_periodic_seam() {
    let kernel = body(&[
        "mul v0.4s, v8.4s, v9.4s",
        "add v1.4s, v0.4s, v10.4s",
    ]);
    let mut cfg = Config::default();
    cfg.sw_pipelining.enabled = true;
    cfg.sw_pipelining.halving_heuristic = true;
    cfg.sw_pipelining.halving_heuristic_periodic = true;

    let outcome =
        heuristics::periodic(&kernel, &AARCH64, &TestCore, &cfg).expect("halving");
    assert_eq!(outcome.num_exceptional_iterations, 1);
    assert_eq!(reduce_source(&outcome.kernel).len(), 2);
}

/// Split heuristic on a long independent block: windows are optimized in
/// place with boundary names frozen, and no instruction is lost.
#[test]
fn test_split_heuristic_preserves_instructions() {
    let block = body(&[
        "add x10, x0, x0",
        "add x11, x1, x1",
        "add x12, x2, x2",
        "add x13, x3, x3",
        "add x14, x4, x4",
        "add x15, x5, x5",
        "add x16, x6, x6",
        "add x17, x7, x7",
    ]);
    let mut cfg = Config::default();
    for i in 10..18 {
        cfg.outputs.insert(format!("x{i}"));
    }
    cfg.split_heuristic.enabled = true;
    cfg.split_heuristic.factor = 2.0;
    cfg.split_heuristic.repeat = 1;

    let result = heuristics::linear(&block, &AARCH64, &CORTEX_A55, &cfg).expect("split");
    let lines = reduce_source(&result);
    assert_eq!(lines.len(), 8);
    for i in 10..18 {
        assert!(
            lines.iter().any(|l| l.contains(&format!("x{i}"))),
            "lost the write to x{i}"
        );
    }
}

/// Naive interleaving keeps every instruction and annotates depths.
#[test]
fn test_naive_reordering() {
    let block = body(&[
        "mul w1, w0, w0",
        "add x2, x1, x1",
        "add x3, x0, x0",
        "add x4, x0, x0",
    ]);
    let cfg = Config::default();
    let result =
        heuristics::naive_reordering(&block, &AARCH64, &TestCore, &cfg).expect("reorder");
    assert_eq!(result.len(), 4);
    assert!(result.iter().all(|l| l.contains("// depth")));
    // The depth-1 add cannot come before the multiply it depends on.
    let mul_pos = result.iter().position(|l| l.contains("mul")).unwrap();
    let dep_pos = result.iter().position(|l| l.contains("x2")).unwrap();
    assert!(mul_pos < dep_pos);
}

/// The linear heuristic refuses a pipelining configuration.
#[test]
fn test_linear_rejects_pipelining() {
    let mut cfg = Config::default();
    cfg.sw_pipelining.enabled = true;
    let err = heuristics::linear(&body(&["nop"]), &AARCH64, &TestCore, &cfg)
        .expect_err("must fail");
    assert!(matches!(err, SlothyError::ConfigError(_)));
}

/// End-to-end: optimize a labeled region, preserving the surrounding text.
#[test]
fn test_session_optimize_region() {
    let source = "\
// polynomial kernel
start:
        mul w0, w2, w3
        add x4, x0, x1
        mul w7, w5, w6
end:
// trailer
";
    let core = TestCore;
    let mut slothy = Slothy::new(&AARCH64, &core);
    slothy.load_source(source);
    slothy.config.outputs.insert("x4".to_string());
    slothy.config.outputs.insert("x7".to_string());
    slothy.optimize(Some("start"), Some("end")).expect("optimize");

    let text = slothy.source_text();
    assert!(text.contains("// polynomial kernel"));
    assert!(text.contains("start:"));
    assert!(text.contains("end:"));
    assert!(text.contains("// trailer"));
    // The independent multiply fills the latency shadow of the first.
    let lines: Vec<&str> = text.lines().collect();
    let first_mul = lines.iter().position(|l| l.contains("mul")).unwrap();
    let second_mul = lines.iter().rposition(|l| l.contains("mul")).unwrap();
    let add = lines.iter().position(|l| l.contains("add x4")).unwrap();
    assert!(first_mul < second_mul);
    assert!(second_mul < add);
}

#[test]
fn test_session_optimize_rejects_pipelining() {
    let core = TestCore;
    let mut slothy = Slothy::new(&AARCH64, &core);
    slothy.load_source("start:\nend:\n");
    slothy.config.sw_pipelining.enabled = true;
    let err = slothy.optimize(Some("start"), Some("end")).expect_err("must fail");
    assert!(matches!(err, SlothyError::ConfigError(_)));
}

/// End-to-end: optimize a loop with software pipelining; the loop is
/// re-emitted with the counter fixed up for the peeled iteration.
#[test]
fn test_session_optimize_loop() {
    let source = "\
        mov x3, #100
polyloop:
        ldr q0, [x0], #16
        mul v1.4s, v0.4s, v8.4s
        str q1, [x1], #16
        subs x3, x3, #1
        cbnz x3, polyloop
// done
";
    let core = TestCore;
    let mut slothy = Slothy::new(&AARCH64, &core);
    slothy.load_source(source);
    slothy.config.sw_pipelining.enabled = true;
    slothy.config.inputs_are_outputs = true;
    slothy.config.constraints.st_ld_hazard = false;
    slothy.optimize_loop("polyloop").expect("optimize loop");

    let text = slothy.source_text();
    assert!(text.contains("mov x3, #100"));
    // One exceptional iteration: the counter is reduced before the loop.
    assert!(text.contains("sub x3, x3, #1"));
    assert!(text.contains(".p2align 2"));
    assert!(text.contains("polyloop:"));
    assert!(text.contains("subs x3, x3, #1"));
    assert!(text.contains("cbnz x3, polyloop"));
    assert!(text.contains("// done"));

    // The preamble load appears before the loop label.
    let lines: Vec<&str> = text.lines().collect();
    let label = lines.iter().position(|l| l.starts_with("polyloop:")).unwrap();
    let first_ldr = lines.iter().position(|l| l.contains("ldr")).unwrap();
    assert!(first_ldr < label);
}

/// Idempotence: re-optimizing an optimal schedule yields no improvement.
#[test]
fn test_idempotence_at_optimum() {
    let lines = body(&[
        "mul w0, w2, w3",
        "add x4, x0, x1",
        "mul w7, w5, w6",
    ]);
    let mut cfg = Config::default();
    cfg.outputs.insert("x4".to_string());
    cfg.outputs.insert("x7".to_string());

    let first =
        heuristics::optimize_binsearch(&lines, &AARCH64, &TestCore, &cfg).expect("first");
    let optimized = reduce_source(&first.code);
    let second = heuristics::optimize_binsearch(&optimized, &AARCH64, &TestCore, &cfg)
        .expect("second");
    assert_eq!(second.stalls, first.stalls);
}
