//! Register Renaming Allocation
//!
//! Given a complete slot/stage assignment, assign a concrete register to
//! every produced value. Values connected through in-out operands (and
//! live-in/live-out identification) share one register; distinct values may
//! share a register only when their live ranges are disjoint in scheduled
//! time (circularly, for periodic schedules). Per-position restriction sets,
//! operand-combination restrictions, reserved and locked registers, and the
//! boundary renaming policies are honored.
//!
//! Allocation failure is not fatal: the scheduler treats it as a rejected
//! schedule and keeps searching.

use crate::arch::{Arch, RegisterClass};
use crate::asm::instruction::{Instruction, OperandKind};
use crate::config::{Config, RenamePolicy};
use crate::dfg::{Dfg, Origin, ValueRef};
use crate::schedule::solver::Assignment;
use bitvec::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// Result of a successful allocation.
#[derive(Debug, Clone)]
pub struct RenameOutcome {
    /// Renamed instructions, in original program order.
    pub insts: Vec<Instruction>,
    /// Live-in register -> kernel register.
    pub input_renamings: BTreeMap<String, String>,
    /// Live-out register -> kernel register.
    pub output_renamings: BTreeMap<String, String>,
}

/// A live range in virtual time, half-open `(start, end]`.
#[derive(Debug, Clone, Copy)]
struct Range {
    start: i64,
    end: i64,
}

impl Range {
    fn overlaps(&self, other: &Range, period: Option<i64>) -> bool {
        let direct =
            |a: &Range, b: &Range, k: i64| a.start < b.end + k && b.start + k < a.end;
        match period {
            None => direct(self, other, 0),
            Some(t) => (-1..=1).any(|k| direct(self, other, k * t)),
        }
    }
}

#[derive(Debug, Clone)]
struct Value {
    class: RegisterClass,
    /// Original register name (`None` for symbolic operands).
    original: Option<String>,
    ranges: Vec<Range>,
    /// Intersection of producer/consumer restriction sets, if any.
    restriction: Option<BTreeSet<String>>,
}

struct Allocator<'a> {
    dfg: &'a Dfg,
    assignment: &'a Assignment,
    arch: &'a dyn Arch,
    cfg: &'a Config,
    values: Vec<Value>,
    parent: Vec<usize>,
    /// Value id per written slot, keyed by `(node, is_in_out, pos)`.
    written: BTreeMap<(usize, bool, usize), usize>,
    /// Value id per live-in register.
    external: BTreeMap<String, usize>,
    /// Fixed register per group root.
    fixed: BTreeMap<usize, String>,
    /// Excluded registers per group root (`other` policy).
    excluded: BTreeMap<usize, BTreeSet<String>>,
}

/// Run the allocation. `None` means no valid renaming exists for this
/// schedule.
pub fn allocate(
    dfg: &Dfg,
    assignment: &Assignment,
    arch: &dyn Arch,
    cfg: &Config,
) -> Option<RenameOutcome> {
    let mut alloc = Allocator {
        dfg,
        assignment,
        arch,
        cfg,
        values: Vec::new(),
        parent: Vec::new(),
        written: BTreeMap::new(),
        external: BTreeMap::new(),
        fixed: BTreeMap::new(),
        excluded: BTreeMap::new(),
    };
    alloc.run()
}

impl<'a> Allocator<'a> {
    fn run(&mut self) -> Option<RenameOutcome> {
        self.collect_values();
        // In a kernel, a value held longer than one iteration would be
        // overwritten by its own next-iteration instance.
        if self.dfg.periodic {
            let t = self.assignment.slots as i64;
            for value in &self.values {
                for range in &value.ranges {
                    if range.start > -2 * t && range.end - range.start > t {
                        return None;
                    }
                }
            }
        }
        self.unify();
        self.apply_policies()?;
        self.collect_restrictions()?;
        let registers = self.assign()?;
        Some(self.emit(&registers))
    }

    fn find(&mut self, v: usize) -> usize {
        if self.parent[v] != v {
            let root = self.find(self.parent[v]);
            self.parent[v] = root;
        }
        self.parent[v]
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[rb] = ra;
        }
    }

    fn new_value(&mut self, class: RegisterClass, original: Option<String>) -> usize {
        let id = self.values.len();
        self.values.push(Value {
            class,
            original,
            ranges: Vec::new(),
            restriction: None,
        });
        self.parent.push(id);
        id
    }

    fn written_value(&self, value: ValueRef) -> usize {
        self.written[&(value.node, value.kind == OperandKind::InOut, value.pos)]
    }

    fn period(&self) -> Option<i64> {
        self.dfg
            .periodic
            .then_some(self.assignment.slots as i64)
    }

    /// Enumerate the values: one per written operand slot, one per live-in
    /// register still read externally, and compute every value's live
    /// range.
    fn collect_values(&mut self) {
        let t = self.assignment.slots as i64;

        for (i, node) in self.dfg.nodes.iter().enumerate() {
            for (kind, pos) in node.writes() {
                let op = node.inst.operand(kind, pos);
                let original = (!op.symbolic).then(|| op.name.clone());
                let id = self.new_value(op.class, original);
                self.written
                    .insert((i, kind == OperandKind::InOut, pos), id);
            }
        }
        for (i, node) in self.dfg.nodes.iter().enumerate() {
            for (kind, pos, origin) in node.reads() {
                if origin == Origin::External {
                    let op = node.inst.operand(kind, pos);
                    if !self.external.contains_key(&op.name) {
                        let original = (!op.symbolic).then(|| op.name.clone());
                        let id = self.new_value(op.class, original);
                        self.external.insert(op.name.clone(), id);
                    }
                }
            }
        }
        // Pass-through outputs: never written, possibly never read, but
        // their register must survive the whole region.
        for reg in &self.dfg.outputs {
            if self.dfg.last_writer(reg).is_none() && !self.external.contains_key(reg) {
                if let Some(class) = self.arch.classify_register(reg) {
                    let id = self.new_value(class, Some(reg.clone()));
                    self.external.insert(reg.clone(), id);
                }
            }
        }

        // Live ranges. A written value lives from its definition to its
        // last consumer (one period later for cross-iteration consumers);
        // a dead write still occupies its register at the write point.
        for (i, node) in self.dfg.nodes.iter().enumerate() {
            let def = self.assignment.vtime(i);
            for (kind, pos) in node.writes() {
                let id = self.written[&(i, kind == OperandKind::InOut, pos)];
                let mut end = def + 1;
                for edge in node.consumers(kind, pos) {
                    let use_time = self.assignment.vtime(edge.consumer)
                        + if edge.cross_iter { t } else { 0 };
                    end = end.max(use_time);
                }
                let op_name = &node.inst.operand(kind, pos).name;
                if self.dfg.outputs.contains(op_name)
                    && self.dfg.last_writer(op_name) == Some(ValueRef { node: i, kind, pos })
                {
                    // Live-outs survive to the end of the region; in a
                    // kernel, until the next iteration's definition.
                    end = end.max(if self.dfg.periodic { def + t } else { t });
                }
                self.values[id].ranges.push(Range { start: def, end });
            }
        }
        for (reg, &id) in &self.external {
            let mut end = -2 * t - 1;
            for (i, node) in self.dfg.nodes.iter().enumerate() {
                for (kind, pos, origin) in node.reads() {
                    if origin == Origin::External && &node.inst.operand(kind, pos).name == reg
                    {
                        end = end.max(self.assignment.vtime(i));
                    }
                }
            }
            if self.dfg.outputs.contains(reg) && self.dfg.last_writer(reg).is_none() {
                end = end.max(if self.dfg.periodic { t } else { t });
            }
            self.values[id].ranges.push(Range {
                start: -2 * t - 1,
                end,
            });
        }
    }

    /// Values connected through in-out operands share a register, as do
    /// live-ins identified with live-outs.
    fn unify(&mut self) {
        for (i, node) in self.dfg.nodes.iter().enumerate() {
            for pos in 0..node.inst.args_in_out.len() {
                let written = self.written[&(i, true, pos)];
                let source = match node.src_in_out[pos] {
                    Origin::External => {
                        let name = &node.inst.args_in_out[pos].name;
                        self.external[name]
                    }
                    Origin::Node { producer, .. } => self.written_value(producer),
                };
                self.union(written, source);
            }
        }
        if self.cfg.inputs_are_outputs {
            let pairs: Vec<(usize, usize)> = self
                .dfg
                .inputs
                .iter()
                .filter_map(|reg| {
                    let ext = *self.external.get(reg)?;
                    let last = self.dfg.last_writer(reg)?;
                    Some((ext, self.written_value(last)))
                })
                .collect();
            for (a, b) in pairs {
                self.union(a, b);
            }
        }
    }

    fn fix(&mut self, value: usize, reg: &str) -> Option<()> {
        let root = self.find(value);
        match self.fixed.get(&root) {
            Some(existing) if existing != reg => None,
            _ => {
                self.fixed.insert(root, reg.to_string());
                Some(())
            }
        }
    }

    fn exclude(&mut self, value: usize, reg: &str) {
        let root = self.find(value);
        self.excluded
            .entry(root)
            .or_default()
            .insert(reg.to_string());
    }

    /// Boundary policies, reserved-register pinning, and the renaming
    /// freeze.
    fn apply_policies(&mut self) -> Option<()> {
        let reserved = self.reserved_set();

        if !self.cfg.constraints.allow_renaming {
            for id in 0..self.values.len() {
                let original = self.values[id].original.clone()?;
                self.fix(id, &original)?;
            }
            return Some(());
        }

        // Values originally held in reserved or locked registers keep
        // them; the flags register pool has a single name anyway.
        for id in 0..self.values.len() {
            if let Some(original) = self.values[id].original.clone() {
                if reserved.contains(&original) || self.cfg.locked_registers.contains(&original)
                {
                    self.fix(id, &original)?;
                }
            }
        }

        let inputs: Vec<(String, usize)> = self
            .external
            .iter()
            .map(|(reg, &id)| (reg.clone(), id))
            .collect();
        for (reg, id) in inputs {
            // Symbolic operands are always renamed to a concrete register.
            if self.values[id].original.is_none() {
                continue;
            }
            let class = self.values[id].class;
            match self.cfg.rename_input_policy(class) {
                RenamePolicy::Static => self.fix(id, &reg)?,
                RenamePolicy::Other => self.exclude(id, &reg),
                RenamePolicy::Any => {}
            }
        }

        let outputs: Vec<(String, usize)> = self
            .dfg
            .outputs
            .iter()
            .filter_map(|reg| {
                let last = self.dfg.last_writer(reg)?;
                Some((reg.clone(), self.written_value(last)))
            })
            .collect();
        for (reg, id) in outputs {
            if self.values[id].original.is_none() {
                continue;
            }
            let class = self.values[id].class;
            match self.cfg.rename_output_policy(class) {
                RenamePolicy::Static => self.fix(id, &reg)?,
                RenamePolicy::Other => self.exclude(id, &reg),
                RenamePolicy::Any => {}
            }
        }
        Some(())
    }

    /// Intersect the per-position restriction sets along every edge into
    /// the produced value.
    fn collect_restrictions(&mut self) -> Option<()> {
        let mut updates: Vec<(usize, BTreeSet<String>)> = Vec::new();
        for (i, node) in self.dfg.nodes.iter().enumerate() {
            for (kind, pos) in node.writes() {
                let id = self.written[&(i, kind == OperandKind::InOut, pos)];
                if let Some(allowed) = node.inst.write_restriction(kind, pos) {
                    updates.push((id, allowed.iter().cloned().collect()));
                }
                for edge in node.consumers(kind, pos) {
                    let consumer = &self.dfg.nodes[edge.consumer].inst;
                    if let Some(allowed) = consumer.read_restriction(edge.kind, edge.pos) {
                        updates.push((id, allowed.iter().cloned().collect()));
                    }
                }
            }
        }
        // External values can also be restricted by their consumers.
        for node in &self.dfg.nodes {
            for (kind, pos, origin) in node.reads() {
                if origin == Origin::External {
                    if let Some(allowed) = node.inst.read_restriction(kind, pos) {
                        let id = self.external[&node.inst.operand(kind, pos).name];
                        updates.push((id, allowed.iter().cloned().collect()));
                    }
                }
            }
        }
        for (id, set) in updates {
            let value = &mut self.values[id];
            value.restriction = Some(match value.restriction.take() {
                None => set,
                Some(existing) => existing.intersection(&set).cloned().collect(),
            });
        }
        Some(())
    }

    fn reserved_set(&self) -> BTreeSet<String> {
        let mut reserved = match &self.cfg.reserved_regs {
            Some(set) => set.clone(),
            None => self.arch.default_reserved(),
        };
        reserved.extend(self.cfg.locked_registers.iter().cloned());
        reserved
    }

    /// Candidate registers for a group, preferred original names first.
    fn candidates(&mut self, root: usize, members: &[usize]) -> Vec<String> {
        if let Some(fixed) = self.fixed.get(&root) {
            return vec![fixed.clone()];
        }
        let class = self.values[members[0]].class;
        let reserved = self.reserved_set();
        let excluded = self.excluded.get(&root).cloned().unwrap_or_default();

        let mut restriction: Option<BTreeSet<String>> = None;
        let mut originals: Vec<String> = Vec::new();
        for &m in members {
            if let Some(orig) = &self.values[m].original {
                if !originals.contains(orig) {
                    originals.push(orig.clone());
                }
            }
            if let Some(r) = &self.values[m].restriction {
                restriction = Some(match restriction.take() {
                    None => r.clone(),
                    Some(acc) => acc.intersection(r).cloned().collect(),
                });
            }
        }

        // Admissibility mask over the class pool, one bit per register:
        // reserved, locked, policy-excluded and out-of-restriction
        // registers are knocked out.
        let pool = self.arch.list_registers(class, false);
        let mut admissible: BitVec<u32> = bitvec![u32, Lsb0; 1; pool.len()];
        for (idx, reg) in pool.iter().enumerate() {
            if reserved.contains(reg)
                || excluded.contains(reg)
                || restriction.as_ref().map_or(false, |r| !r.contains(reg))
            {
                admissible.set(idx, false);
            }
        }

        let mut out: Vec<String> = originals
            .into_iter()
            .filter(|reg| {
                pool.iter()
                    .position(|p| p == reg)
                    .map_or(false, |idx| admissible[idx])
            })
            .collect();
        for idx in admissible.iter_ones() {
            if !out.contains(&pool[idx]) {
                out.push(pool[idx].clone());
            }
        }
        out
    }

    /// Backtracking register assignment over the value groups.
    fn assign(&mut self) -> Option<BTreeMap<usize, String>> {
        let n = self.values.len();
        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for id in 0..n {
            let root = self.find(id);
            groups.entry(root).or_default().push(id);
        }

        // Mixed-class groups cannot be allocated.
        for members in groups.values() {
            let class = self.values[members[0]].class;
            if members.iter().any(|&m| self.values[m].class != class) {
                return None;
            }
        }

        let mut order: Vec<usize> = groups.keys().copied().collect();
        // Fixed groups first, then most-constrained.
        let mut keyed: Vec<(usize, usize)> = order
            .iter()
            .map(|&root| {
                let k = if self.fixed.contains_key(&root) {
                    0
                } else {
                    self.candidates(root, &groups[&root]).len() + 1
                };
                (k, root)
            })
            .collect();
        keyed.sort();
        order = keyed.into_iter().map(|(_, root)| root).collect();

        let combos = self.combo_constraints();
        let mut chosen: BTreeMap<usize, String> = BTreeMap::new();
        if self.assign_rec(&order, 0, &groups, &combos, &mut chosen) {
            Some(chosen)
        } else {
            None
        }
    }

    /// Combination constraints, as group-id tuples with their allowed
    /// register tuples.
    fn combo_constraints(&mut self) -> Vec<(Vec<usize>, Vec<Vec<String>>)> {
        let mut out = Vec::new();
        for (i, node) in self.dfg.nodes.iter().enumerate() {
            for combo in &node.inst.combinations {
                let ids: Option<Vec<usize>> = combo
                    .positions
                    .iter()
                    .map(|&pos| match combo.kind {
                        OperandKind::Out => {
                            self.written.get(&(i, false, pos)).copied()
                        }
                        OperandKind::InOut => {
                            self.written.get(&(i, true, pos)).copied()
                        }
                        OperandKind::In => {
                            // Input combinations constrain the producers.
                            match node.src_in.get(pos)? {
                                Origin::External => {
                                    let name = &node.inst.args_in[pos].name;
                                    self.external.get(name).copied()
                                }
                                Origin::Node { producer, .. } => {
                                    Some(self.written_value(*producer))
                                }
                            }
                        }
                    })
                    .collect();
                if let Some(ids) = ids {
                    let roots: Vec<usize> = ids.iter().map(|&id| self.find(id)).collect();
                    out.push((roots, combo.allowed.clone()));
                }
            }
        }
        out
    }

    fn combos_ok(
        &self,
        combos: &[(Vec<usize>, Vec<Vec<String>>)],
        chosen: &BTreeMap<usize, String>,
    ) -> bool {
        combos.iter().all(|(roots, allowed)| {
            allowed.iter().any(|tuple| {
                roots.iter().zip(tuple.iter()).all(|(root, reg)| {
                    chosen.get(root).map_or(true, |assigned| assigned == reg)
                })
            })
        })
    }

    fn assign_rec(
        &mut self,
        order: &[usize],
        depth: usize,
        groups: &BTreeMap<usize, Vec<usize>>,
        combos: &[(Vec<usize>, Vec<Vec<String>>)],
        chosen: &mut BTreeMap<usize, String>,
    ) -> bool {
        if depth == order.len() {
            return true;
        }
        let root = order[depth];
        let members = &groups[&root];
        let period = self.period();
        for reg in self.candidates(root, members) {
            // Range disjointness against groups already holding this
            // register.
            let clash = chosen.iter().any(|(other, other_reg)| {
                if *other_reg != reg {
                    return false;
                }
                let other_members = &groups[other];
                members.iter().any(|&a| {
                    other_members.iter().any(|&b| {
                        self.values[a].ranges.iter().any(|ra| {
                            self.values[b]
                                .ranges
                                .iter()
                                .any(|rb| ra.overlaps(rb, period))
                        })
                    })
                })
            });
            if clash {
                continue;
            }
            chosen.insert(root, reg);
            if self.combos_ok(combos, chosen)
                && self.assign_rec(order, depth + 1, groups, combos, chosen)
            {
                return true;
            }
            chosen.remove(&root);
        }
        false
    }

    /// Rewrite the instructions with the assigned registers.
    fn emit(&mut self, registers: &BTreeMap<usize, String>) -> RenameOutcome {
        let reg_of = |alloc: &mut Self, id: usize| -> String {
            let root = alloc.find(id);
            registers[&root].clone()
        };

        let mut insts: Vec<Instruction> = Vec::with_capacity(self.dfg.len());
        for i in 0..self.dfg.len() {
            // Resolve against the original operand names before mutating.
            let mut inst = self.dfg.nodes[i].inst.clone();
            let old_base = inst.addressing.as_ref().map(|a| a.base.clone());
            let mut new_base: Option<String> = None;

            let writes: Vec<(OperandKind, usize)> = self.dfg.nodes[i].writes().collect();
            let reads: Vec<(OperandKind, usize, Origin)> =
                self.dfg.nodes[i].reads().collect();
            let mut renames: Vec<(OperandKind, usize, String)> = Vec::new();

            for (kind, pos) in writes {
                let id = self.written[&(i, kind == OperandKind::InOut, pos)];
                renames.push((kind, pos, reg_of(self, id)));
            }
            for (kind, pos, origin) in reads {
                let id = match origin {
                    Origin::External => {
                        self.external[&self.dfg.nodes[i].inst.operand(kind, pos).name]
                    }
                    Origin::Node { producer, .. } => self.written_value(producer),
                };
                renames.push((kind, pos, reg_of(self, id)));
            }

            for (kind, pos, reg) in renames {
                let op = inst.operand_mut(kind, pos);
                if old_base.as_deref() == Some(op.name.as_str()) {
                    new_base = Some(reg.clone());
                }
                op.name = reg;
                op.symbolic = false;
            }
            if let (Some(addr), Some(base)) = (&mut inst.addressing, new_base) {
                addr.base = base;
            }
            insts.push(inst);
        }

        let mut input_renamings = BTreeMap::new();
        for reg in &self.dfg.inputs {
            let id = match self.external.get(reg) {
                Some(&id) => id,
                None => match self.dfg.last_writer(reg) {
                    Some(last) => self.written_value(last),
                    None => continue,
                },
            };
            input_renamings.insert(reg.clone(), reg_of(self, id));
        }
        let mut output_renamings = BTreeMap::new();
        for reg in &self.dfg.outputs {
            let id = match self.dfg.last_writer(reg) {
                Some(last) => self.written_value(last),
                None => match self.external.get(reg) {
                    Some(&id) => id,
                    None => continue,
                },
            };
            output_renamings.insert(reg.clone(), reg_of(self, id));
        }

        RenameOutcome {
            insts,
            input_renamings,
            output_renamings,
        }
    }
}
