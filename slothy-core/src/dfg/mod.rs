//! Dataflow Graph
//!
//! SSA-style dependency graph over a parsed instruction sequence. One node
//! per instruction; every read operand records its unique producer (another
//! node, or "external" for live-ins) and every written operand records its
//! downstream consumers. For loop bodies the graph can be built *periodic*:
//! reads with no in-iteration producer connect to the previous iteration's
//! last write through edges flagged `cross_iter`, so cycles appear only
//! across the iteration boundary.
//!
//! Construction is a single linear pass over a producer map keyed by
//! register name, followed by a rewrite fixpoint: variants may inspect their
//! neighborhood and rewrite their node (pair fusion), and the graph is
//! rebuilt while any rewrite reports a change.

use crate::asm::instruction::{Instruction, OperandKind};
use crate::config::Config;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// Reference to a value: the producing node and the written operand slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueRef {
    pub node: usize,
    pub kind: OperandKind,
    pub pos: usize,
}

/// Consumer edge hanging off a produced value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// Consuming node index.
    pub consumer: usize,
    /// Operand list of the consuming operand.
    pub kind: OperandKind,
    /// Position within that list.
    pub pos: usize,
    /// The consumer reads the value produced one iteration earlier.
    pub cross_iter: bool,
}

/// Producer of a read operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Live-in: no producer inside the graph.
    External,
    /// Produced by another node.
    Node {
        producer: ValueRef,
        cross_iter: bool,
    },
}

impl Origin {
    pub fn producer(&self) -> Option<ValueRef> {
        match self {
            Origin::External => None,
            Origin::Node { producer, .. } => Some(*producer),
        }
    }
}

/// One graph node.
#[derive(Debug, Clone)]
pub struct DfgNode {
    /// The instruction.
    pub inst: Instruction,
    /// Consumers per output position.
    pub dst_out: SmallVec<[Vec<Edge>; 2]>,
    /// Consumers per in-out position (of the value written there).
    pub dst_in_out: SmallVec<[Vec<Edge>; 2]>,
    /// Producer per input position.
    pub src_in: SmallVec<[Origin; 4]>,
    /// Producer per in-out position (of the value read there).
    pub src_in_out: SmallVec<[Origin; 2]>,
    /// Longest producer chain from a live-in, in instructions.
    pub depth: usize,
}

impl DfgNode {
    fn new(inst: Instruction) -> Self {
        let n_out = inst.args_out.len();
        let n_in = inst.args_in.len();
        let n_io = inst.args_in_out.len();
        Self {
            inst,
            dst_out: (0..n_out).map(|_| Vec::new()).collect(),
            dst_in_out: (0..n_io).map(|_| Vec::new()).collect(),
            src_in: (0..n_in).map(|_| Origin::External).collect(),
            src_in_out: (0..n_io).map(|_| Origin::External).collect(),
            depth: 0,
        }
    }

    /// All read operands with their origins: `(kind, pos, origin)`.
    pub fn reads(&self) -> impl Iterator<Item = (OperandKind, usize, Origin)> + '_ {
        let ins = self
            .src_in
            .iter()
            .enumerate()
            .map(|(p, o)| (OperandKind::In, p, *o));
        let ios = self
            .src_in_out
            .iter()
            .enumerate()
            .map(|(p, o)| (OperandKind::InOut, p, *o));
        ins.chain(ios)
    }

    /// All written operand slots: `(kind, pos)`.
    pub fn writes(&self) -> impl Iterator<Item = (OperandKind, usize)> + '_ {
        let outs = (0..self.inst.args_out.len()).map(|p| (OperandKind::Out, p));
        let ios = (0..self.inst.args_in_out.len()).map(|p| (OperandKind::InOut, p));
        outs.chain(ios)
    }

    /// Consumers of the value written at `(kind, pos)`.
    pub fn consumers(&self, kind: OperandKind, pos: usize) -> &[Edge] {
        match kind {
            OperandKind::Out => &self.dst_out[pos],
            OperandKind::InOut => &self.dst_in_out[pos],
            OperandKind::In => &[],
        }
    }
}

/// Graph-construction configuration, extracted from the optimizer [`Config`].
#[derive(Debug, Clone, Default)]
pub struct DfgConfig {
    /// Explicit live-out registers.
    pub outputs: BTreeSet<String>,
    /// Treat every live-in as a live-out (loop-invariant inputs).
    pub inputs_are_outputs: bool,
    /// Record write-after-write ordering edges.
    pub waw_edges: bool,
    /// Build a periodic (loop) graph.
    pub periodic: bool,
}

impl DfgConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            outputs: cfg.outputs.clone(),
            inputs_are_outputs: cfg.inputs_are_outputs,
            waw_edges: cfg.constraints.waw_edges,
            periodic: false,
        }
    }

    pub fn periodic(mut self) -> Self {
        self.periodic = true;
        self
    }
}

/// The dataflow graph.
#[derive(Debug, Clone)]
pub struct Dfg {
    pub nodes: Vec<DfgNode>,
    /// Live-in registers (read before any in-graph write).
    pub inputs: BTreeSet<String>,
    /// Live-out registers (explicit outputs, plus the live-ins when
    /// `inputs_are_outputs` is set).
    pub outputs: BTreeSet<String>,
    /// Ordering-only write-after-write edges `(earlier, later)`.
    pub waw: Vec<(usize, usize)>,
    /// Whether cross-iteration edges were built.
    pub periodic: bool,
    /// Final producer of each register at the end of one iteration.
    last_writer: BTreeMap<String, ValueRef>,
}

impl Dfg {
    /// Build the graph and run the variant rewrite callbacks to fixpoint.
    pub fn build(insts: Vec<Instruction>, cfg: &DfgConfig) -> Dfg {
        let mut dfg = Self::build_once(insts, cfg);
        // Pair-fusion fixpoint: rebuild while any callback reports change.
        loop {
            let mut changed = false;
            let mut insts: Vec<Instruction> =
                dfg.nodes.iter().map(|n| n.inst.clone()).collect();
            for i in 0..insts.len() {
                if let Some(rewrite) = insts[i].variant.rewrite {
                    if let Some(new_inst) = rewrite(&dfg, i) {
                        log::debug!(
                            "rewrite: {} -> {}",
                            insts[i].render(),
                            new_inst.render()
                        );
                        insts[i] = new_inst;
                        changed = true;
                    }
                }
            }
            if !changed {
                return dfg;
            }
            dfg = Self::build_once(insts, cfg);
        }
    }

    /// Single construction pass without rewrites.
    fn build_once(insts: Vec<Instruction>, cfg: &DfgConfig) -> Dfg {
        let mut nodes: Vec<DfgNode> = insts.into_iter().map(DfgNode::new).collect();
        let mut inputs: BTreeSet<String> = BTreeSet::new();
        let mut waw: Vec<(usize, usize)> = Vec::new();

        // Producer state per register: the live value and whether it has
        // been read since it was written.
        struct Producer {
            value: ValueRef,
            read_since_write: bool,
        }
        let mut producers: BTreeMap<String, Producer> = BTreeMap::new();
        // External reads per register, for periodic back-patching.
        let mut external_reads: BTreeMap<String, Vec<(usize, OperandKind, usize)>> =
            BTreeMap::new();

        for i in 0..nodes.len() {
            // Reads first: inputs, then the read half of in-outs.
            let read_slots: Vec<(OperandKind, usize, String)> = {
                let inst = &nodes[i].inst;
                inst.args_in
                    .iter()
                    .enumerate()
                    .map(|(p, op)| (OperandKind::In, p, op.name.clone()))
                    .chain(
                        inst.args_in_out
                            .iter()
                            .enumerate()
                            .map(|(p, op)| (OperandKind::InOut, p, op.name.clone())),
                    )
                    .collect()
            };
            for (kind, pos, reg) in read_slots {
                match producers.get_mut(&reg) {
                    Some(producer) => {
                        producer.read_since_write = true;
                        let value = producer.value;
                        let edge = Edge {
                            consumer: i,
                            kind,
                            pos,
                            cross_iter: false,
                        };
                        match value.kind {
                            OperandKind::Out => nodes[value.node].dst_out[value.pos].push(edge),
                            OperandKind::InOut => {
                                nodes[value.node].dst_in_out[value.pos].push(edge)
                            }
                            OperandKind::In => unreachable!("producer cannot be an input"),
                        }
                        let origin = Origin::Node {
                            producer: value,
                            cross_iter: false,
                        };
                        match kind {
                            OperandKind::In => nodes[i].src_in[pos] = origin,
                            OperandKind::InOut => nodes[i].src_in_out[pos] = origin,
                            OperandKind::Out => unreachable!(),
                        }
                    }
                    None => {
                        inputs.insert(reg.clone());
                        external_reads.entry(reg).or_default().push((i, kind, pos));
                    }
                }
            }

            // Writes: outputs and the write half of in-outs replace the
            // producer.
            let write_slots: Vec<(OperandKind, usize, String)> = {
                let inst = &nodes[i].inst;
                inst.args_out
                    .iter()
                    .enumerate()
                    .map(|(p, op)| (OperandKind::Out, p, op.name.clone()))
                    .chain(
                        inst.args_in_out
                            .iter()
                            .enumerate()
                            .map(|(p, op)| (OperandKind::InOut, p, op.name.clone())),
                    )
                    .collect()
            };
            for (kind, pos, reg) in write_slots {
                if let Some(prev) = producers.get(&reg) {
                    // Writes don't depend on writes unless WAW ordering is
                    // requested.
                    if cfg.waw_edges && !prev.read_since_write {
                        waw.push((prev.value.node, i));
                    }
                }
                producers.insert(
                    reg,
                    Producer {
                        value: ValueRef { node: i, kind, pos },
                        read_since_write: false,
                    },
                );
            }
        }

        let last_writer: BTreeMap<String, ValueRef> = producers
            .into_iter()
            .map(|(reg, p)| (reg, p.value))
            .collect();

        // Periodic graphs: a live-in that the body also writes is loop
        // carried; its external reads become cross-iteration consumers of
        // the final write.
        if cfg.periodic {
            for (reg, reads) in &external_reads {
                let Some(value) = last_writer.get(reg).copied() else {
                    continue;
                };
                for &(consumer, kind, pos) in reads {
                    let edge = Edge {
                        consumer,
                        kind,
                        pos,
                        cross_iter: true,
                    };
                    match value.kind {
                        OperandKind::Out => nodes[value.node].dst_out[value.pos].push(edge),
                        OperandKind::InOut => nodes[value.node].dst_in_out[value.pos].push(edge),
                        OperandKind::In => unreachable!(),
                    }
                    let origin = Origin::Node {
                        producer: value,
                        cross_iter: true,
                    };
                    match kind {
                        OperandKind::In => nodes[consumer].src_in[pos] = origin,
                        OperandKind::InOut => nodes[consumer].src_in_out[pos] = origin,
                        OperandKind::Out => unreachable!(),
                    }
                }
            }
        }

        // Depths: same-iteration edges only point forward, so one pass in
        // program order suffices.
        for i in 0..nodes.len() {
            let depth = nodes[i]
                .reads()
                .filter_map(|(_, _, origin)| match origin {
                    Origin::Node {
                        producer,
                        cross_iter: false,
                    } => Some(nodes[producer.node].depth + 1),
                    _ => None,
                })
                .max()
                .unwrap_or(0);
            nodes[i].depth = depth;
        }

        let mut outputs = cfg.outputs.clone();
        if cfg.inputs_are_outputs {
            outputs.extend(inputs.iter().cloned());
        }
        // An output the region never writes must be live on entry.
        for reg in &outputs {
            if !last_writer.contains_key(reg) {
                inputs.insert(reg.clone());
            }
        }

        Dfg {
            nodes,
            inputs,
            outputs,
            waw,
            periodic: cfg.periodic,
            last_writer,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: usize) -> &DfgNode {
        &self.nodes[idx]
    }

    /// Consumers of the value a node writes at in-out position `pos`.
    pub fn in_out_consumers(&self, node: usize, pos: usize) -> &[Edge] {
        &self.nodes[node].dst_in_out[pos]
    }

    /// Final producer of a register at the end of the region, if any.
    pub fn last_writer(&self, reg: &str) -> Option<ValueRef> {
        self.last_writer.get(reg).copied()
    }

    /// Registers written inside the graph.
    pub fn written_registers(&self) -> impl Iterator<Item = (&String, ValueRef)> {
        self.last_writer.iter().map(|(reg, value)| (reg, *value))
    }

    /// Registers carried from one iteration to the next (periodic graphs):
    /// consumed via a cross-iteration edge, or live-outs that the body
    /// rewrites.
    pub fn cross_iteration_registers(&self) -> BTreeSet<String> {
        let mut carried = BTreeSet::new();
        for node in &self.nodes {
            for (kind, pos, origin) in node.reads() {
                if let Origin::Node {
                    cross_iter: true, ..
                } = origin
                {
                    carried.insert(node.inst.operand(kind, pos).name.clone());
                }
            }
        }
        for reg in &self.outputs {
            if self.last_writer.contains_key(reg) {
                carried.insert(reg.clone());
            }
        }
        carried
    }

    /// Dump the graph at debug level, one node per line with depth and
    /// producer summary.
    pub fn log_dump(&self, header: &str) {
        log::debug!("{header}:");
        for (i, node) in self.nodes.iter().enumerate() {
            let origins: Vec<String> = node
                .reads()
                .map(|(_, _, origin)| match origin {
                    Origin::External => "ext".to_string(),
                    Origin::Node {
                        producer,
                        cross_iter,
                    } => {
                        if cross_iter {
                            format!("{}'", producer.node)
                        } else {
                            format!("{}", producer.node)
                        }
                    }
                })
                .collect();
            log::debug!(
                "  [{i:3}] depth {:2} <- ({}) {}",
                node.depth,
                origins.join(","),
                node.inst.render()
            );
        }
    }
}
