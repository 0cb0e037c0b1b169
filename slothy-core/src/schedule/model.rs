//! Scheduling Model
//!
//! Translates a dataflow graph plus a micro-architecture model and a
//! configuration into the flat constraint model the search engine consumes:
//! items with unit requirements and stage domains, value edges with
//! latencies, ordering-only edges, and hazard metadata.

use crate::arch::{MicroArch, OperandRole, UnitAlternatives};
use crate::asm::instruction::OperandKind;
use crate::asm::simplify;
use crate::config::Config;
use crate::dfg::{Dfg, Origin};
use smallvec::SmallVec;

/// Hazard-relevant address of a memory operation: base register plus folded
/// constant offset (`None` when the offset is symbolic).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemAddress {
    pub base: String,
    pub offset: Option<i64>,
}

impl MemAddress {
    /// Whether two addresses are provably distinct: same base register and
    /// distinct constant offsets.
    pub fn provably_disjoint(&self, other: &MemAddress) -> bool {
        if self.base != other.base {
            return false;
        }
        match (self.offset, other.offset) {
            (Some(a), Some(b)) => a != b,
            _ => false,
        }
    }
}

/// One schedulable instruction.
#[derive(Debug, Clone)]
pub struct SchedItem {
    /// Issue resources (alternatives per required unit).
    pub units: SmallVec<[UnitAlternatives; 2]>,
    /// Inverse throughput on the occupied pipe.
    pub throughput: u32,
    /// Dependency depth (scheduling priority).
    pub depth: usize,
    /// Longest downstream latency chain, for critical-path ordering.
    pub tail: u32,
    /// Admissible stage shifts: `+1` = early, `0` = core, `-1` = late.
    pub shifts: SmallVec<[i8; 3]>,
    pub is_load: bool,
    pub is_store: bool,
    /// Address for store->load hazard checks.
    pub address: Option<MemAddress>,
}

/// A value edge with its latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedEdge {
    pub src: usize,
    pub dst: usize,
    pub latency: u32,
    pub cross_iter: bool,
}

/// The flat model handed to the search engine.
#[derive(Debug, Clone)]
pub struct SchedModel {
    pub items: Vec<SchedItem>,
    pub edges: Vec<SchedEdge>,
    /// Ordering-only edges (write-after-write).
    pub order_edges: Vec<(usize, usize)>,
    pub issue_width: usize,
    pub periodic: bool,
    pub allow_reordering: bool,
    pub st_ld_hazard: bool,
    /// Minimum cycle distance between a store and a possibly-aliasing load.
    pub hazard_window: u32,
}

/// Default store->load hazard window, in cycles.
const ST_LD_HAZARD_WINDOW: u32 = 3;

impl SchedModel {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Build the model from a graph.
    ///
    /// `periodic` enables the stage dimension; the admissible stage set is
    /// derived from `sw_pipelining.allow_pre`/`allow_post`.
    pub fn build(dfg: &Dfg, uarch: &dyn MicroArch, cfg: &Config, periodic: bool) -> Self {
        let n = dfg.len();
        let mut edges: Vec<SchedEdge> = Vec::new();

        for (v, node) in dfg.nodes.iter().enumerate() {
            for (kind, pos, origin) in node.reads() {
                let Origin::Node {
                    producer,
                    cross_iter,
                } = origin
                else {
                    continue;
                };
                let role = match kind {
                    OperandKind::In => OperandRole::Input(pos),
                    OperandKind::InOut => OperandRole::InOut(pos),
                    OperandKind::Out => unreachable!("reads are never outputs"),
                };
                let latency =
                    uarch.get_latency(&dfg.nodes[producer.node].inst, &node.inst, role);
                edges.push(SchedEdge {
                    src: producer.node,
                    dst: v,
                    latency,
                    cross_iter,
                });
            }
        }

        let mut shifts: SmallVec<[i8; 3]> = SmallVec::new();
        shifts.push(0);
        if periodic {
            if cfg.sw_pipelining.allow_pre {
                shifts.push(1);
            }
            if cfg.sw_pipelining.allow_post {
                shifts.push(-1);
            }
        }

        let mut items: Vec<SchedItem> = dfg
            .nodes
            .iter()
            .map(|node| {
                let tags = uarch.classify(&node.inst);
                let address = node.inst.addressing.as_ref().map(|addr| {
                    // Post-indexed accesses touch offset 0; pre-indexed
                    // offsets fold to a constant when they are one.
                    let offset = match addr.pre_index.as_deref() {
                        Some(expr) => simplify::fold(expr.trim_start_matches('#')),
                        None => Some(0),
                    };
                    MemAddress {
                        base: addr.base.clone(),
                        offset,
                    }
                });
                SchedItem {
                    units: uarch.get_units(&node.inst),
                    throughput: uarch.get_throughput(&node.inst),
                    depth: node.depth,
                    tail: 0,
                    shifts: shifts.clone(),
                    is_load: tags.is_load,
                    is_store: tags.is_store,
                    address,
                }
            })
            .collect();

        // Longest downstream latency chain per item. Same-iteration edges
        // only point forward, so a reverse pass suffices.
        for v in (0..n).rev() {
            let mut tail = 0u32;
            for e in edges.iter().filter(|e| e.src == v && !e.cross_iter) {
                tail = tail.max(e.latency + items[e.dst].tail);
            }
            items[v].tail = tail;
        }

        SchedModel {
            items,
            edges,
            order_edges: dfg.waw.clone(),
            issue_width: uarch.issue_width().max(1),
            periodic,
            allow_reordering: cfg.constraints.allow_reordering,
            st_ld_hazard: cfg.constraints.st_ld_hazard,
            hazard_window: ST_LD_HAZARD_WINDOW,
        }
    }
}
