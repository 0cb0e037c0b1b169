//! Schedule Search Engine
//!
//! Deterministic branch-and-bound over slot assignments. Slots are filled
//! in increasing order; at every slot the engine either places an admissible
//! instruction (critical-path-first candidate order) or spends one of the
//! stall bubbles. Placement checks dataflow ordering and latency against
//! every already-placed neighbor, per-cycle execution-unit matching with
//! pipe throughput, stage-offset feasibility for periodic models, and the
//! optional store->load hazard window. A complete assignment is handed to
//! the caller's `accept` callback (the renaming allocator); rejection
//! resumes the search.
//!
//! The search is fully deterministic: candidate order depends only on the
//! model, so equal inputs give equal schedules.

use crate::arch::ExecUnit;
use crate::schedule::model::{SchedItem, SchedModel};
use bitvec::prelude::*;
use smallvec::SmallVec;
use std::time::Instant;

/// Terminal search outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveFailure {
    /// The slot budget admits no schedule.
    Infeasible,
    /// The deadline expired before the search finished.
    Timeout,
}

/// A complete slot/stage assignment.
#[derive(Debug, Clone)]
pub struct Assignment {
    /// Issue slot per instruction.
    pub pos: Vec<usize>,
    /// Stage shift per instruction (`+1` early, `0` core, `-1` late).
    pub shift: Vec<i8>,
    /// Total slot count (instructions + bubbles).
    pub slots: usize,
    /// Issue width the slots were laid out with.
    pub issue_width: usize,
}

impl Assignment {
    /// Cycle of an instruction's slot.
    pub fn cycle(&self, item: usize) -> usize {
        self.pos[item] / self.issue_width
    }

    /// Total cycle count of the schedule.
    pub fn cycles(&self) -> usize {
        self.slots.div_ceil(self.issue_width)
    }

    /// Virtual time: slot position normalized by the stage shift, so that
    /// same-work-iteration producers always precede their consumers.
    pub fn vtime(&self, item: usize) -> i64 {
        self.pos[item] as i64 - self.shift[item] as i64 * self.slots as i64
    }

    /// Slot indices not occupied by any instruction.
    pub fn stall_slots(&self) -> Vec<usize> {
        let mut used: BitVec<u32> = bitvec![u32, Lsb0; 0; self.slots];
        for &p in &self.pos {
            used.set(p, true);
        }
        used.iter_zeros().collect()
    }

    /// Number of instructions outside the core stage.
    pub fn overlap(&self) -> usize {
        self.shift.iter().filter(|&&s| s != 0).count()
    }
}

/// Solve the model within `slots` issue slots.
///
/// `max_overlap` bounds the number of non-core-stage instructions (the
/// secondary objective under software pipelining). `accept` validates
/// complete assignments; returning `false` resumes the search.
pub fn solve(
    model: &SchedModel,
    slots: usize,
    max_overlap: Option<usize>,
    deadline: Option<Instant>,
    accept: &mut dyn FnMut(&Assignment) -> bool,
) -> Result<Assignment, SolveFailure> {
    let n = model.len();
    if slots < n {
        return Err(SolveFailure::Infeasible);
    }
    if n == 0 {
        return Ok(Assignment {
            pos: Vec::new(),
            shift: Vec::new(),
            slots,
            issue_width: model.issue_width,
        });
    }

    let mut search = Search {
        model,
        slots,
        cycles: slots.div_ceil(model.issue_width),
        pos: vec![None; n],
        shift: vec![0; n],
        scheduled: 0,
        bubbles: 0,
        overlap: 0,
        max_overlap,
        unit_block: Vec::new(),
        cycle_commits: Vec::new(),
        deadline,
        ticks: 0,
        timed_out: false,
        in_edges: vec![Vec::new(); n],
        out_edges: vec![Vec::new(); n],
        order_in: vec![Vec::new(); n],
        order_out: vec![Vec::new(); n],
    };

    let max_unit = model
        .items
        .iter()
        .flat_map(|item| item.units.iter())
        .flat_map(|alts| alts.iter())
        .map(|u| u.0 as usize + 1)
        .max()
        .unwrap_or(1);
    search.unit_block = vec![0u32; max_unit];

    for (e, edge) in model.edges.iter().enumerate() {
        search.in_edges[edge.dst].push(e);
        search.out_edges[edge.src].push(e);
    }
    for &(a, b) in &model.order_edges {
        search.order_out[a].push(b);
        search.order_in[b].push(a);
    }

    let mut result: Option<Assignment> = None;
    search.place_slot(0, accept, &mut result);
    if search.timed_out {
        return Err(SolveFailure::Timeout);
    }
    result.ok_or(SolveFailure::Infeasible)
}

struct Search<'a> {
    model: &'a SchedModel,
    slots: usize,
    cycles: usize,
    pos: Vec<Option<usize>>,
    shift: Vec<i8>,
    scheduled: usize,
    bubbles: usize,
    overlap: usize,
    max_overlap: Option<usize>,
    /// Per unit: first cycle the pipe is free again (from closed cycles).
    unit_block: Vec<u32>,
    /// Undo log of `unit_block` updates per closed cycle.
    cycle_commits: Vec<Vec<(usize, u32)>>,
    deadline: Option<Instant>,
    ticks: u32,
    timed_out: bool,
    in_edges: Vec<Vec<usize>>,
    out_edges: Vec<Vec<usize>>,
    order_in: Vec<Vec<usize>>,
    order_out: Vec<Vec<usize>>,
}

impl<'a> Search<'a> {
    fn width(&self) -> usize {
        self.model.issue_width
    }

    fn cycle_of(&self, slot: usize) -> usize {
        slot / self.width()
    }

    fn check_deadline(&mut self) -> bool {
        self.ticks = self.ticks.wrapping_add(1);
        if self.ticks % 1024 == 0 {
            if let Some(deadline) = self.deadline {
                if Instant::now() >= deadline {
                    self.timed_out = true;
                }
            }
        }
        self.timed_out
    }

    fn place_slot(
        &mut self,
        slot: usize,
        accept: &mut dyn FnMut(&Assignment) -> bool,
        result: &mut Option<Assignment>,
    ) -> bool {
        if self.check_deadline() {
            return false;
        }
        let n = self.model.len();
        if slot == self.slots {
            if self.scheduled != n {
                return false;
            }
            let assignment = Assignment {
                pos: self.pos.iter().map(|p| p.unwrap()).collect(),
                shift: self.shift.clone(),
                slots: self.slots,
                issue_width: self.width(),
            };
            if accept(&assignment) {
                *result = Some(assignment);
                return true;
            }
            return false;
        }

        // Not enough slots left for the remaining instructions.
        if n - self.scheduled > self.slots - slot {
            return false;
        }

        let cycle = self.cycle_of(slot);
        let closing = slot % self.width() == 0 && slot > 0;
        if closing {
            self.commit_cycle(cycle - 1);
        }

        let mut done = false;
        for (item, item_shift) in self.candidates(slot) {
            self.pos[item] = Some(slot);
            self.shift[item] = item_shift;
            self.scheduled += 1;
            if item_shift != 0 {
                self.overlap += 1;
            }
            done = self.place_slot(slot + 1, accept, result);
            self.pos[item] = None;
            self.shift[item] = 0;
            self.scheduled -= 1;
            if item_shift != 0 {
                self.overlap -= 1;
            }
            if done || self.timed_out {
                break;
            }
        }

        // Spend a bubble.
        if !done && !self.timed_out && self.bubbles < self.slots - n {
            self.bubbles += 1;
            done = self.place_slot(slot + 1, accept, result);
            self.bubbles -= 1;
        }

        if closing {
            self.uncommit_cycle();
        }
        done
    }

    /// Admissible `(item, shift)` pairs for a slot, critical path first.
    fn candidates(&self, slot: usize) -> Vec<(usize, i8)> {
        let n = self.model.len();
        let mut order: Vec<usize> = (0..n).filter(|&i| self.pos[i].is_none()).collect();
        if !self.model.allow_reordering {
            // Frozen order: only the next instruction in program order.
            order.truncate(1);
        } else {
            order.sort_by(|&a, &b| {
                let ka = (&self.model.items[a].tail, self.model.items[a].depth);
                let kb = (&self.model.items[b].tail, self.model.items[b].depth);
                kb.cmp(&ka).then(a.cmp(&b))
            });
        }

        let mut out: Vec<(usize, i8)> = Vec::new();
        for item in order {
            for &item_shift in &self.model.items[item].shifts {
                if item_shift != 0 {
                    if let Some(max) = self.max_overlap {
                        if self.overlap + 1 > max {
                            continue;
                        }
                    }
                }
                if self.admissible(item, item_shift, slot) {
                    out.push((item, item_shift));
                }
            }
        }
        out
    }

    fn admissible(&self, item: usize, item_shift: i8, slot: usize) -> bool {
        let cycle = self.cycle_of(slot) as i64;
        let t = self.slots as i64;
        let c_total = self.cycles as i64;

        // Dataflow edges against placed neighbors; stage feasibility
        // against unplaced ones.
        for &e in &self.in_edges[item] {
            let edge = self.model.edges[e];
            let cross = edge.cross_iter as i64;
            match self.pos[edge.src] {
                Some(p) => {
                    let delta = self.shift[edge.src] as i64 - item_shift as i64 + cross;
                    let dpos = slot as i64 - p as i64 + t * delta;
                    if dpos <= 0 {
                        return false;
                    }
                    let dcyc = cycle - self.cycle_of(p) as i64 + c_total * delta;
                    if dcyc < edge.latency as i64 {
                        return false;
                    }
                }
                None if edge.src == item => {
                    // Self edge (loop-carried accumulator): legal only
                    // across the iteration boundary, and the kernel must be
                    // long enough to cover the latency.
                    if cross == 0 || c_total * cross < edge.latency as i64 {
                        return false;
                    }
                }
                None => {
                    // The producer must be able to wrap around.
                    let feasible = self.model.items[edge.src]
                        .shifts
                        .iter()
                        .any(|&s| s as i64 - item_shift as i64 + cross >= 1);
                    if !feasible {
                        return false;
                    }
                }
            }
        }
        for &e in &self.out_edges[item] {
            let edge = self.model.edges[e];
            let cross = edge.cross_iter as i64;
            match self.pos[edge.dst] {
                Some(p) => {
                    let delta = item_shift as i64 - self.shift[edge.dst] as i64 + cross;
                    let dpos = p as i64 - slot as i64 + t * delta;
                    if dpos <= 0 {
                        return false;
                    }
                    let dcyc = self.cycle_of(p) as i64 - cycle + c_total * delta;
                    if dcyc < edge.latency as i64 {
                        return false;
                    }
                }
                None if edge.dst == item => {
                    if cross == 0 || c_total * cross < edge.latency as i64 {
                        return false;
                    }
                }
                None => {
                    // Some placement of the consumer must satisfy both the
                    // ordering and the latency.
                    let feasible = self.model.items[edge.dst].shifts.iter().any(|&s| {
                        let delta = item_shift as i64 - s as i64 + cross;
                        if delta < 0 {
                            return false;
                        }
                        let max_dcyc = (c_total - 1) - cycle + c_total * delta;
                        max_dcyc >= edge.latency as i64
                    });
                    if !feasible {
                        return false;
                    }
                }
            }
        }

        // Write-after-write ordering (position only, same stage space).
        for &earlier in &self.order_in[item] {
            if let Some(p) = self.pos[earlier] {
                let delta = self.shift[earlier] as i64 - item_shift as i64;
                if slot as i64 - p as i64 + t * delta <= 0 {
                    return false;
                }
            }
        }
        for &later in &self.order_out[item] {
            if let Some(p) = self.pos[later] {
                let delta = item_shift as i64 - self.shift[later] as i64;
                if p as i64 - slot as i64 + t * delta <= 0 {
                    return false;
                }
            }
        }

        if !self.units_fit(item, self.cycle_of(slot)) {
            return false;
        }

        if self.model.st_ld_hazard && !self.hazard_ok(item, self.cycle_of(slot)) {
            return false;
        }

        true
    }

    /// Store->load hazard: a load must not issue within the hazard window
    /// after a store whose address it cannot be proven distinct from.
    fn hazard_ok(&self, item: usize, cycle: usize) -> bool {
        let it = &self.model.items[item];
        if !(it.is_load || it.is_store) || it.address.is_none() {
            return true;
        }
        let addr = it.address.as_ref().unwrap();
        for (other, other_item) in self.model.items.iter().enumerate() {
            let Some(p) = self.pos[other] else { continue };
            let clash = (it.is_load && other_item.is_store)
                || (it.is_store && other_item.is_load);
            if !clash {
                continue;
            }
            let Some(other_addr) = other_item.address.as_ref() else {
                continue;
            };
            if addr.provably_disjoint(other_addr) {
                continue;
            }
            let (store_cycle, load_cycle) = if it.is_load {
                (self.cycle_of(p) as i64, cycle as i64)
            } else {
                (cycle as i64, self.cycle_of(p) as i64)
            };
            let mut gap = load_cycle - store_cycle;
            if self.model.periodic {
                // In a kernel the pair recurs every iteration.
                let c_total = self.cycles as i64;
                gap = gap.rem_euclid(c_total);
            }
            if (0..self.model.hazard_window as i64).contains(&gap) {
                return false;
            }
        }
        true
    }

    /// Execution-unit matching for one cycle including the new item.
    fn units_fit(&self, item: usize, cycle: usize) -> bool {
        let mut members: Vec<&SchedItem> = self
            .model
            .items
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                self.pos[*i].map(|p| self.cycle_of(p)) == Some(cycle) && *i != item
            })
            .map(|(_, it)| it)
            .collect();
        members.push(&self.model.items[item]);
        self.match_units(&members, cycle).is_some()
    }

    /// Find a unit assignment for a cycle's members, or `None`.
    fn match_units(
        &self,
        members: &[&SchedItem],
        cycle: usize,
    ) -> Option<Vec<SmallVec<[ExecUnit; 2]>>> {
        // Flatten the required unit-slots; most-constrained first.
        let mut requirements: Vec<(usize, &[ExecUnit])> = Vec::new();
        for (m, item) in members.iter().enumerate() {
            for alts in &item.units {
                requirements.push((m, alts.as_slice()));
            }
        }
        let mut order: Vec<usize> = (0..requirements.len()).collect();
        order.sort_by_key(|&r| requirements[r].1.len());

        // Unit occupancy within the cycle, one bit per unit.
        let mut used: BitVec<u32> = bitvec![u32, Lsb0; 0; self.unit_block.len()];
        let mut chosen: Vec<(usize, ExecUnit)> = Vec::new();
        if !self.match_rec(&requirements, &order, 0, cycle, &mut used, &mut chosen) {
            return None;
        }
        let mut result: Vec<SmallVec<[ExecUnit; 2]>> =
            members.iter().map(|_| SmallVec::new()).collect();
        for (m, unit) in chosen {
            result[m].push(unit);
        }
        Some(result)
    }

    fn match_rec(
        &self,
        requirements: &[(usize, &[ExecUnit])],
        order: &[usize],
        depth: usize,
        cycle: usize,
        used: &mut BitVec<u32>,
        chosen: &mut Vec<(usize, ExecUnit)>,
    ) -> bool {
        if depth == order.len() {
            return true;
        }
        let (member, alts) = requirements[order[depth]];
        for &unit in alts {
            if used[unit.0 as usize] {
                continue;
            }
            // The pipe may still be blocked by an earlier issue.
            if (self.unit_block[unit.0 as usize] as usize) > cycle {
                continue;
            }
            used.set(unit.0 as usize, true);
            chosen.push((member, unit));
            if self.match_rec(requirements, order, depth + 1, cycle, used, chosen) {
                return true;
            }
            used.set(unit.0 as usize, false);
            chosen.pop();
        }
        false
    }

    /// Freeze the unit matching of a completed cycle and apply pipe
    /// throughput blocking.
    fn commit_cycle(&mut self, cycle: usize) {
        let member_idx: Vec<usize> = (0..self.model.len())
            .filter(|&i| self.pos[i].map(|p| self.cycle_of(p)) == Some(cycle))
            .collect();
        let members: Vec<&SchedItem> =
            member_idx.iter().map(|&i| &self.model.items[i]).collect();
        let mut undo: Vec<(usize, u32)> = Vec::new();
        if let Some(assignments) = self.match_units(&members, cycle) {
            for (m, units) in assignments.iter().enumerate() {
                let throughput = self.model.items[member_idx[m]].throughput;
                for unit in units {
                    let slot = unit.0 as usize;
                    undo.push((slot, self.unit_block[slot]));
                    self.unit_block[slot] =
                        self.unit_block[slot].max(cycle as u32 + throughput);
                }
            }
        }
        self.cycle_commits.push(undo);
    }

    fn uncommit_cycle(&mut self) {
        if let Some(undo) = self.cycle_commits.pop() {
            for (slot, value) in undo.into_iter().rev() {
                self.unit_block[slot] = value;
            }
        }
    }
}
