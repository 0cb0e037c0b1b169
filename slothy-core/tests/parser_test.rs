//! Unit tests for the instruction parser and emitter

use slothy_core::arch::aarch64::AARCH64;
use slothy_core::arch::RegisterClass;
use slothy_core::asm::instruction::OperandKind;
use slothy_core::asm::pattern::AsmParser;
use slothy_core::asm::{loops, simplify};
use slothy_core::SlothyError;
use std::collections::BTreeMap;

fn parser() -> AsmParser {
    AsmParser::new(&AARCH64)
}

fn no_hints() -> BTreeMap<String, RegisterClass> {
    BTreeMap::new()
}

#[test]
fn test_parse_vector_mla() {
    let inst = parser()
        .parse_line("mla v0.4s, v1.4s, v2.4s", &no_hints())
        .expect("parse");
    assert_eq!(inst.variant.name, "vmla");
    assert_eq!(inst.args_in_out.len(), 1);
    assert_eq!(inst.args_in_out[0].name, "v0");
    assert_eq!(inst.args_in.len(), 2);
    assert_eq!(inst.args_in[0].name, "v1");
    assert_eq!(inst.args_in[1].name, "v2");
    assert_eq!(inst.datatypes.as_slice(), ["4s", "4s", "4s"]);
}

#[test]
fn test_parse_scalar_vs_vector_disambiguation() {
    let scalar = parser()
        .parse_line("add x0, x1, x2", &no_hints())
        .expect("parse");
    assert_eq!(scalar.variant.name, "add");

    let vector = parser()
        .parse_line("add v0.4s, v1.4s, v2.4s", &no_hints())
        .expect("parse");
    assert_eq!(vector.variant.name, "vadd");
}

#[test]
fn test_written_forms_canonicalize_and_render_back() {
    let inst = parser()
        .parse_line("mul w3, w4, w5", &no_hints())
        .expect("parse");
    assert_eq!(inst.variant.name, "mul_wform");
    // Canonical storage is the x-form; the emitter restores the w-form.
    assert_eq!(inst.args_out[0].name, "x3");
    assert_eq!(inst.render(), "mul w3, w4, w5");

    let inst = parser()
        .parse_line("ldr q7, [x2, #32]", &no_hints())
        .expect("parse");
    assert_eq!(inst.args_out[0].name, "v7");
    assert_eq!(inst.render(), "ldr q7, [x2, #32]");
}

#[test]
fn test_parse_symbolic_operand() {
    let inst = parser()
        .parse_line("add x<sum>, x1, x2", &no_hints())
        .expect("parse");
    assert!(inst.args_out[0].symbolic);
    assert_eq!(inst.args_out[0].name, "sum");
    assert_eq!(inst.args_out[0].class, RegisterClass::Gpr);
    assert_eq!(inst.render(), "add x<sum>, x1, x2");
}

#[test]
fn test_typing_hints_override_symbolic_class() {
    let mut hints = BTreeMap::new();
    hints.insert("acc".to_string(), RegisterClass::Gpr);
    let inst = parser()
        .parse_line("add x<acc>, x1, x2", &hints)
        .expect("parse");
    assert_eq!(inst.args_out[0].class, RegisterClass::Gpr);
}

#[test]
fn test_address_modes() {
    let pre = parser()
        .parse_line("ldr q0, [x1, #16]", &no_hints())
        .expect("parse");
    let addr = pre.addressing.as_ref().expect("addressing");
    assert_eq!(addr.base, "x1");
    assert_eq!(addr.pre_index.as_deref(), Some("#16"));
    assert_eq!(addr.post_index, None);

    let post = parser()
        .parse_line("ldr q0, [x1], #32", &no_hints())
        .expect("parse");
    let addr = post.addressing.as_ref().expect("addressing");
    assert_eq!(addr.pre_index, None);
    assert_eq!(addr.post_index.as_deref(), Some("#32"));
}

#[test]
fn test_address_offset_folding() {
    let inst = parser()
        .parse_line("ldr q0, [x1, #16*3+8]", &no_hints())
        .expect("parse");
    let addr = inst.addressing.as_ref().expect("addressing");
    assert_eq!(addr.pre_index.as_deref(), Some("#56"));
    assert_eq!(inst.render(), "ldr q0, [x1, #56]");
}

#[test]
fn test_simplify_keeps_symbolic_expressions() {
    assert_eq!(simplify::simplify("#out_offset+8"), "#out_offset+8");
    assert_eq!(simplify::simplify("#(4*10)>>1"), "#20");
}

#[test]
fn test_grouped_ld4_combinations() {
    let inst = parser()
        .parse_line("ld4 {v0.4s, v1.4s, v2.4s, v3.4s}, [x5], #64", &no_hints())
        .expect("parse");
    assert_eq!(inst.variant.name, "ld4");
    assert_eq!(inst.args_out.len(), 4);
    assert_eq!(inst.args_in_out[0].name, "x5");
    assert_eq!(inst.combinations.len(), 1);
    let combo = &inst.combinations[0];
    assert_eq!(combo.kind, OperandKind::Out);
    assert_eq!(combo.positions, vec![0, 1, 2, 3]);
    assert_eq!(combo.allowed.len(), 28);
    assert_eq!(combo.allowed[0], vec!["v0", "v1", "v2", "v3"]);
    assert_eq!(combo.allowed[27], vec!["v27", "v28", "v29", "v30"]);
}

#[test]
fn test_lane_mul_restriction_for_halfword() {
    let inst = parser()
        .parse_line("sqrdmulh v0.8h, v1.8h, v2.8h[3]", &no_hints())
        .expect("parse");
    assert_eq!(inst.variant.name, "vqrdmulh_lane");
    assert_eq!(inst.lane.as_deref(), Some("3"));
    let restriction = inst
        .read_restriction(OperandKind::In, 1)
        .expect("restriction");
    assert_eq!(restriction.len(), 16);
    assert!(restriction.contains(&"v15".to_string()));
    assert!(!restriction.contains(&"v16".to_string()));
}

#[test]
fn test_flags_modeled_as_output() {
    let inst = parser()
        .parse_line("subs x2, x2, #1", &no_hints())
        .expect("parse");
    assert_eq!(inst.variant.name, "subs");
    let flags = inst.args_out.last().expect("flags output");
    assert_eq!(flags.name, "flags");
    assert_eq!(flags.class, RegisterClass::Flags);
}

#[test]
fn test_parse_failure_carries_trace() {
    let err = parser()
        .parse_line("fictional x0, x1", &no_hints())
        .expect_err("must fail");
    match err {
        SlothyError::ParseError { line, trace } => {
            assert_eq!(line, "fictional x0, x1");
            assert!(trace.contains("does not match pattern"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn test_comments_ignored() {
    let inst = parser()
        .parse_line("  add x0, x1, x2   // accumulate", &no_hints())
        .expect("parse");
    assert_eq!(inst.variant.name, "add");
}

#[test]
fn test_round_trip_preserves_structure() {
    let p = parser();
    for line in [
        "mla v0.4s, v1.4s, v2.4s",
        "umull x5, w1, w2",
        "str q3, [x0], #16",
        "vins v4, x7, 1",
        "sub x9, x10, x11",
    ] {
        let inst = p.parse_line(line, &no_hints()).expect("parse");
        let rendered = inst.render();
        let again = p.parse_line(&rendered, &no_hints()).expect("reparse");
        assert_eq!(inst, again, "round trip changed `{line}` -> `{rendered}`");
    }
}

#[test]
fn test_loop_extraction() {
    let source: Vec<String> = [
        "// kernel",
        "        mov x3, #16",
        "polyloop:",
        "        mul v0.4s, v1.4s, v2.4s",
        "        add v3.4s, v0.4s, v4.4s",
        "        subs x3, x3, #1",
        "        cbnz x3, polyloop",
        "        str q3, [x1], #16",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let extracted = loops::extract(&source, "polyloop", &AARCH64).expect("loop");
    assert_eq!(extracted.pre.len(), 2);
    assert_eq!(extracted.body.len(), 2);
    assert_eq!(extracted.post.len(), 1);
    assert_eq!(extracted.info.terminator.counter, "x3");
    assert_eq!(extracted.info.terminator.decrement, "#1");
}

#[test]
fn test_loop_not_found() {
    let source = vec!["add x0, x1, x2".to_string()];
    let err = loops::extract(&source, "missing", &AARCH64).expect_err("must fail");
    assert!(matches!(err, SlothyError::LoopNotFound(label) if label == "missing"));
}

#[test]
fn test_loop_render_with_fixup_and_unroll() {
    let source: Vec<String> = [
        "start:",
        "        mul v0.4s, v1.4s, v2.4s",
        "        subs x3, x3, #1",
        "        cbnz x3, start",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let extracted = loops::extract(&source, "start", &AARCH64).expect("loop");

    let kernel = vec!["        mul v0.4s, v1.4s, v2.4s".to_string()];
    let out = loops::render(&AARCH64, &extracted.info, &kernel, 8, 1, 2);
    let text = out.join("\n");
    assert!(text.contains("lsr x3, x3, #1"));
    assert!(text.contains("sub x3, x3, #1"));
    assert!(text.contains(".p2align 2"));
    assert!(text.contains("start:"));
    assert!(text.contains("subs x3, x3, #1"));
    assert!(text.contains("cbnz x3, start"));
}
