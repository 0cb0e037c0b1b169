//! Unit tests for dataflow-graph construction

use slothy_core::arch::aarch64::AARCH64;
use slothy_core::asm::instruction::{Instruction, OperandKind};
use slothy_core::asm::pattern::AsmParser;
use slothy_core::dfg::{Dfg, DfgConfig, Origin};
use std::collections::BTreeMap;

fn parse(lines: &[&str]) -> Vec<Instruction> {
    let parser = AsmParser::new(&AARCH64);
    lines
        .iter()
        .map(|l| parser.parse_line(l, &BTreeMap::new()).expect("parse"))
        .collect()
}

fn build(lines: &[&str], cfg: &DfgConfig) -> Dfg {
    Dfg::build(parse(lines), cfg)
}

#[test]
fn test_ssa_chain() {
    let dfg = build(
        &[
            "mul v0.4s, v1.4s, v2.4s",
            "add v3.4s, v0.4s, v0.4s",
            "add v4.4s, v3.4s, v1.4s",
        ],
        &DfgConfig::default(),
    );

    // v0 feeds both reads of instruction 1.
    assert_eq!(dfg.nodes[0].dst_out[0].len(), 2);
    let producer = dfg.nodes[1].src_in[0].producer().expect("producer");
    assert_eq!(producer.node, 0);

    // Depths follow the longest chain to a live-in.
    assert_eq!(dfg.nodes[0].depth, 0);
    assert_eq!(dfg.nodes[1].depth, 1);
    assert_eq!(dfg.nodes[2].depth, 2);

    // v1 and v2 are live-in; nothing is a live-out without configuration.
    assert!(dfg.inputs.contains("v1"));
    assert!(dfg.inputs.contains("v2"));
    assert!(dfg.outputs.is_empty());
}

#[test]
fn test_most_recent_write_wins() {
    let dfg = build(
        &[
            "mov x0, #1",
            "mov x0, #2",
            "add x1, x0, x0",
        ],
        &DfgConfig::default(),
    );
    let producer = dfg.nodes[2].src_in[0].producer().expect("producer");
    assert_eq!(producer.node, 1);
    // The overwritten value has no consumers.
    assert!(dfg.nodes[0].dst_out[0].is_empty());
}

#[test]
fn test_waw_edges_toggle() {
    let lines = ["mov x0, #1", "mov x0, #2"];

    let without = build(&lines, &DfgConfig::default());
    assert!(without.waw.is_empty());

    let cfg = DfgConfig {
        waw_edges: true,
        ..DfgConfig::default()
    };
    let with = build(&lines, &cfg);
    assert_eq!(with.waw, vec![(0, 1)]);
}

#[test]
fn test_waw_not_recorded_after_intervening_read() {
    let cfg = DfgConfig {
        waw_edges: true,
        ..DfgConfig::default()
    };
    // The read between the writes makes the second write an ordinary
    // overwrite of a consumed value.
    let dfg = build(
        &["mov x0, #1", "add x1, x0, x0", "mov x0, #2"],
        &cfg,
    );
    assert!(dfg.waw.is_empty());
}

#[test]
fn test_in_out_consumes_and_replaces() {
    let dfg = build(
        &[
            "mul v0.4s, v1.4s, v2.4s",
            "mla v0.4s, v3.4s, v4.4s",
            "add v5.4s, v0.4s, v0.4s",
        ],
        &DfgConfig::default(),
    );
    // The mla reads the mul's value...
    let src = dfg.nodes[1].src_in_out[0].producer().expect("producer");
    assert_eq!(src.node, 0);
    // ...and the final add reads the mla's value.
    let src = dfg.nodes[2].src_in[0].producer().expect("producer");
    assert_eq!(src.node, 1);
    assert_eq!(src.kind, OperandKind::InOut);
}

#[test]
fn test_periodic_cross_iteration_edges() {
    let cfg = DfgConfig::default().periodic();
    // v0 is read before it is written: the read consumes the previous
    // iteration's write.
    let dfg = build(
        &[
            "add v1.4s, v0.4s, v2.4s",
            "mul v0.4s, v3.4s, v4.4s",
        ],
        &cfg,
    );

    match dfg.nodes[0].src_in[0] {
        Origin::Node {
            producer,
            cross_iter,
        } => {
            assert_eq!(producer.node, 1);
            assert!(cross_iter);
        }
        Origin::External => panic!("expected cross-iteration producer"),
    }
    // Still a live-in for the first iteration, and carried between
    // iterations.
    assert!(dfg.inputs.contains("v0"));
    assert!(dfg.cross_iteration_registers().contains("v0"));
    // Cycles appear only across the iteration boundary: depths ignore the
    // cross-iteration edge.
    assert_eq!(dfg.nodes[0].depth, 0);
    assert_eq!(dfg.nodes[1].depth, 0);
}

#[test]
fn test_inputs_are_outputs() {
    let cfg = DfgConfig {
        inputs_are_outputs: true,
        ..DfgConfig::default()
    };
    let dfg = build(&["add x1, x0, x2"], &cfg);
    assert!(dfg.outputs.contains("x0"));
    assert!(dfg.outputs.contains("x2"));
    assert!(!dfg.outputs.contains("x1"));
}

#[test]
fn test_unwritten_outputs_become_inputs() {
    let mut cfg = DfgConfig::default();
    cfg.outputs.insert("v9".to_string());
    let dfg = build(&["add x1, x0, x2"], &cfg);
    // The region must receive v9 live to deliver it at exit.
    assert!(dfg.inputs.contains("v9"));
}

#[test]
fn test_vins_pair_rewrite() {
    // A pair of vins writing both 64-bit lanes overwrites the full
    // register: the first of the pair loses its dependence on the prior
    // value.
    let dfg = build(
        &[
            "mul v0.4s, v1.4s, v2.4s",
            "vins v0, x1, 0",
            "vins v0, x2, 1",
            "add v3.4s, v0.4s, v0.4s",
        ],
        &DfgConfig::default(),
    );

    // The first vins is now a pure output and no longer consumes the mul.
    assert!(dfg.nodes[1].inst.args_in_out.is_empty());
    assert_eq!(dfg.nodes[1].inst.args_out.len(), 1);
    assert!(dfg.nodes[0].dst_out[0].is_empty());

    // The second vins still reads the first, and the add reads the second.
    let src = dfg.nodes[2].src_in_out[0].producer().expect("producer");
    assert_eq!(src.node, 1);
    let src = dfg.nodes[3].src_in[0].producer().expect("producer");
    assert_eq!(src.node, 2);
}

#[test]
fn test_vins_pair_requires_both_lanes() {
    // Two writes to the same lane don't form a pair.
    let dfg = build(
        &["vins v0, x1, 0", "vins v0, x2, 0"],
        &DfgConfig::default(),
    );
    assert_eq!(dfg.nodes[0].inst.args_in_out.len(), 1);
    assert_eq!(dfg.nodes[1].inst.args_in_out.len(), 1);
}
