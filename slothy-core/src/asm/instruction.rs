//! Instruction Records
//!
//! A parsed instruction carries explicit input / output / in-out operand
//! lists (disjoint by position), the register class of every position, any
//! per-position register restrictions, operand-combination restrictions for
//! grouped multi-register loads/stores, and addressing metadata for memory
//! operations.
//!
//! Instructions are immutable after parsing except through the variant
//! rewrite callbacks applied during dataflow-graph construction.

use crate::arch::RegisterClass;
use crate::asm::pattern::Variant;
use crate::asm::simplify;
use smallvec::SmallVec;

/// Which of the three operand lists a position belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    /// Read-only operand.
    In,
    /// Write-only operand.
    Out,
    /// Read-modify-write operand.
    InOut,
}

/// A register operand.
///
/// `symbolic` operands name a value rather than a concrete register; the
/// renaming stage must assign them a concrete register of `class`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operand {
    pub name: String,
    pub class: RegisterClass,
    pub symbolic: bool,
}

impl Operand {
    pub fn new(name: impl Into<String>, class: RegisterClass, symbolic: bool) -> Self {
        Self {
            name: name.into(),
            class,
            symbolic,
        }
    }
}

/// Combination restriction over a tuple of operand positions: the chosen
/// concrete registers at `positions` (within the list given by `kind`) must
/// form one of the `allowed` tuples.
///
/// Used for grouped loads/stores that require consecutive register numbers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperandCombination {
    pub kind: OperandKind,
    pub positions: Vec<usize>,
    pub allowed: Vec<Vec<String>>,
}

/// Addressing metadata of a load/store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Addressing {
    /// Base register name.
    pub base: String,
    /// Immediate offset applied before the access (`[base, #off]`).
    pub pre_index: Option<String>,
    /// Immediate increment applied after the access (`[base], #inc`).
    pub post_index: Option<String>,
    /// Whether the base register is written back.
    pub writeback: bool,
}

impl Addressing {
    /// Fold constant arithmetic in the offset expressions.
    pub fn simplify(&mut self) {
        if let Some(pre) = &self.pre_index {
            self.pre_index = Some(simplify::simplify(pre));
        }
        if let Some(post) = &self.post_index {
            self.post_index = Some(simplify::simplify(post));
        }
    }
}

/// A parsed instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// The variant this instruction was parsed as.
    pub variant: &'static Variant,

    /// Read-only operands.
    pub args_in: SmallVec<[Operand; 4]>,
    /// Write-only operands.
    pub args_out: SmallVec<[Operand; 2]>,
    /// Read-modify-write operands.
    pub args_in_out: SmallVec<[Operand; 2]>,

    /// Per-position allowed-register restrictions for outputs.
    pub restrictions_out: SmallVec<[Option<Vec<String>>; 2]>,
    /// Per-position allowed-register restrictions for in-outs.
    pub restrictions_in_out: SmallVec<[Option<Vec<String>>; 2]>,
    /// Per-position allowed-register restrictions for inputs. These
    /// constrain the producing instruction's register choice.
    pub restrictions_in: SmallVec<[Option<Vec<String>>; 4]>,
    /// Operand-combination restrictions.
    pub combinations: Vec<OperandCombination>,

    /// Addressing metadata, for loads/stores.
    pub addressing: Option<Addressing>,
    /// Datatype suffixes (one per `<dtN>` placeholder).
    pub datatypes: SmallVec<[String; 1]>,
    /// Lane index, for lane-addressed vector operations.
    pub lane: Option<String>,
    /// Immediate operand, verbatim.
    pub immediate: Option<String>,

    /// Current slot of each in-out operand the variant declares. Rewrites
    /// may move a declared in-out into the output list; the emitter follows
    /// this map.
    pub in_out_slots: SmallVec<[(OperandKind, usize); 2]>,
}

impl Instruction {
    /// Build an empty record for `variant`; the parser fills the operand
    /// lists.
    pub fn new(variant: &'static Variant) -> Self {
        Self {
            variant,
            args_in: SmallVec::new(),
            args_out: SmallVec::new(),
            args_in_out: SmallVec::new(),
            restrictions_out: SmallVec::new(),
            restrictions_in_out: SmallVec::new(),
            restrictions_in: SmallVec::new(),
            combinations: Vec::new(),
            addressing: None,
            datatypes: SmallVec::new(),
            lane: None,
            immediate: None,
            in_out_slots: SmallVec::new(),
        }
    }

    /// Variant name (the "mnemonic" from the optimizer's point of view).
    pub fn mnemonic(&self) -> &'static str {
        self.variant.name
    }

    /// All registers read by this instruction (inputs and in-outs).
    pub fn read_registers(&self) -> impl Iterator<Item = &Operand> {
        self.args_in.iter().chain(self.args_in_out.iter())
    }

    /// All registers written by this instruction (outputs and in-outs).
    pub fn written_registers(&self) -> impl Iterator<Item = &Operand> {
        self.args_out.iter().chain(self.args_in_out.iter())
    }

    /// Operand at `(kind, position)`.
    pub fn operand(&self, kind: OperandKind, pos: usize) -> &Operand {
        match kind {
            OperandKind::In => &self.args_in[pos],
            OperandKind::Out => &self.args_out[pos],
            OperandKind::InOut => &self.args_in_out[pos],
        }
    }

    /// Mutable operand at `(kind, position)`.
    pub fn operand_mut(&mut self, kind: OperandKind, pos: usize) -> &mut Operand {
        match kind {
            OperandKind::In => &mut self.args_in[pos],
            OperandKind::Out => &mut self.args_out[pos],
            OperandKind::InOut => &mut self.args_in_out[pos],
        }
    }

    /// Allowed-register restriction for a written operand, if any.
    pub fn write_restriction(&self, kind: OperandKind, pos: usize) -> Option<&[String]> {
        let slot = match kind {
            OperandKind::Out => self.restrictions_out.get(pos),
            OperandKind::InOut => self.restrictions_in_out.get(pos),
            OperandKind::In => None,
        };
        slot.and_then(|r| r.as_deref())
    }

    /// Allowed-register restriction for a read operand, if any.
    pub fn read_restriction(&self, kind: OperandKind, pos: usize) -> Option<&[String]> {
        let slot = match kind {
            OperandKind::In => self.restrictions_in.get(pos),
            OperandKind::InOut => self.restrictions_in_out.get(pos),
            OperandKind::Out => None,
        };
        slot.and_then(|r| r.as_deref())
    }

    /// Fold constant arithmetic in address offsets and the immediate.
    pub fn simplify_immediates(&mut self) {
        if let Some(addr) = &mut self.addressing {
            addr.simplify();
        }
        if let Some(imm) = &self.immediate {
            self.immediate = Some(simplify::simplify(imm));
        }
    }

    /// Demote the in-out operand at `pos` to a pure output.
    ///
    /// Used by pair-fusion rewrites once a later instruction is known to
    /// complete the overwrite of the full register, which severs this
    /// instruction's dependence on the register's prior value.
    pub fn promote_in_out_to_out(&mut self, pos: usize) {
        let op = self.args_in_out.remove(pos);
        let restriction = if pos < self.restrictions_in_out.len() {
            self.restrictions_in_out.remove(pos)
        } else {
            None
        };
        self.args_out.push(op);
        self.restrictions_out.push(restriction);

        // Keep the emitter's placeholder map in sync with the move.
        let new_slot = (OperandKind::Out, self.args_out.len() - 1);
        for slot in &mut self.in_out_slots {
            match *slot {
                (OperandKind::InOut, p) if p == pos => *slot = new_slot,
                (OperandKind::InOut, p) if p > pos => *slot = (OperandKind::InOut, p - 1),
                _ => {}
            }
        }
    }

    /// Current slot of the variant's declared in-out operand `declared`,
    /// following any rewrites.
    pub fn in_out_slot(&self, declared: usize) -> (OperandKind, usize) {
        self.in_out_slots
            .get(declared)
            .copied()
            .unwrap_or((OperandKind::InOut, declared))
    }

    /// Render this instruction back to assembly text.
    pub fn render(&self) -> String {
        crate::asm::pattern::render(self)
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}
