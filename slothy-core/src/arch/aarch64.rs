//! AArch64/Neon Instruction-Set Model
//!
//! Register pools, the instruction variant table, loop forms and the
//! pair-fusion rewrites for an AArch64 subset centered on Neon kernels
//! (polynomial arithmetic, structure loads/stores, stack pseudo-ops).
//!
//! Stack pseudo-instructions (`qsave`, `save`, ...) model spill slots as
//! first-class registers so the scheduler can move and rename spills without
//! modeling memory.

use crate::arch::{Arch, LoopTerminator, RegisterClass};
use crate::asm::instruction::{Instruction, OperandKind};
use crate::asm::pattern::{AddrSpec, ComboSpec, Variant};
use crate::dfg::Dfg;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// The AArch64 instruction-set model.
pub struct AArch64;

/// Shared instance; the model is stateless.
pub static AARCH64: AArch64 = AArch64;

const NUM_GPRS: usize = 31;
const NUM_VREGS: usize = 32;
const NUM_STACK_SLOTS: usize = 8;

/// Named untyped stack locations shared between GPR and vector spills.
const STACK_ANY_LOCATIONS: &[&str] = &[
    "STACK_MASK1",
    "STACK_MASK2",
    "STACK_A_0",
    "STACK_A_8",
    "STACK_A_16",
    "STACK_A_24",
    "STACK_A_32",
    "STACK_B_0",
    "STACK_B_8",
    "STACK_B_16",
    "STACK_B_24",
    "STACK_B_32",
    "STACK_CTR",
    "STACK_LASTBIT",
    "STACK_SCALAR",
    "STACK_X_0",
    "STACK_X_8",
    "STACK_X_16",
    "STACK_X_24",
    "STACK_X_32",
];

impl Arch for AArch64 {
    fn name(&self) -> &'static str {
        "aarch64"
    }

    fn list_registers(&self, class: RegisterClass, _with_extras: bool) -> Vec<String> {
        match class {
            RegisterClass::Gpr => {
                let mut regs: Vec<String> = (0..NUM_GPRS).map(|i| format!("x{i}")).collect();
                regs.push("sp".to_string());
                regs
            }
            RegisterClass::Vector => (0..NUM_VREGS).map(|i| format!("v{i}")).collect(),
            RegisterClass::StackGpr => {
                (0..NUM_STACK_SLOTS).map(|i| format!("STACK{i}")).collect()
            }
            RegisterClass::StackVector => {
                (0..NUM_STACK_SLOTS).map(|i| format!("QSTACK{i}")).collect()
            }
            RegisterClass::StackAny => {
                STACK_ANY_LOCATIONS.iter().map(|s| s.to_string()).collect()
            }
            RegisterClass::Flags => vec!["flags".to_string()],
        }
    }

    fn default_reserved(&self) -> BTreeSet<String> {
        let mut reserved: BTreeSet<String> =
            ["flags", "sp"].iter().map(|s| s.to_string()).collect();
        reserved.extend(STACK_ANY_LOCATIONS.iter().map(|s| s.to_string()));
        reserved
    }

    fn default_aliases(&self) -> BTreeMap<String, String> {
        let mut aliases = BTreeMap::new();
        aliases.insert("lr".to_string(), "x30".to_string());
        aliases
    }

    fn variants(&self) -> &'static [Variant] {
        VARIANTS
    }

    fn canonicalize(&self, name: &str) -> Option<(String, RegisterClass)> {
        if name == "sp" {
            return Some(("sp".to_string(), RegisterClass::Gpr));
        }
        if name == "flags" {
            return Some(("flags".to_string(), RegisterClass::Flags));
        }
        if let Some(num) = parse_numbered(name, 'x', NUM_GPRS) {
            return Some((format!("x{num}"), RegisterClass::Gpr));
        }
        if let Some(num) = parse_numbered(name, 'w', NUM_GPRS) {
            return Some((format!("x{num}"), RegisterClass::Gpr));
        }
        if let Some(num) = parse_numbered(name, 'v', NUM_VREGS) {
            return Some((format!("v{num}"), RegisterClass::Vector));
        }
        if let Some(num) = parse_numbered(name, 'q', NUM_VREGS) {
            return Some((format!("v{num}"), RegisterClass::Vector));
        }
        if let Some(num) = parse_numbered(name, 'd', NUM_VREGS) {
            return Some((format!("v{num}"), RegisterClass::Vector));
        }
        if let Some(rest) = name.strip_prefix("QSTACK") {
            if rest.parse::<usize>().map_or(false, |n| n < NUM_STACK_SLOTS) {
                return Some((name.to_string(), RegisterClass::StackVector));
            }
        }
        if STACK_ANY_LOCATIONS.contains(&name) {
            return Some((name.to_string(), RegisterClass::StackAny));
        }
        if let Some(rest) = name.strip_prefix("STACK") {
            if rest.parse::<usize>().map_or(false, |n| n < NUM_STACK_SLOTS) {
                return Some((name.to_string(), RegisterClass::StackGpr));
            }
        }
        None
    }

    fn placeholder_class(&self, letter: char) -> Option<RegisterClass> {
        match letter.to_ascii_uppercase() {
            'X' | 'W' => Some(RegisterClass::Gpr),
            'V' | 'Q' | 'D' => Some(RegisterClass::Vector),
            'G' => Some(RegisterClass::StackGpr),
            'T' => Some(RegisterClass::StackVector),
            'A' => Some(RegisterClass::StackAny),
            _ => None,
        }
    }

    fn placeholder_token(&self, letter: char) -> Option<&'static str> {
        match letter.to_ascii_uppercase() {
            'X' => Some(r"x[0-9]{1,2}|sp|[xX]<\w+>|<\w+>"),
            'W' => Some(r"w[0-9]{1,2}|[wW]<\w+>|<\w+>"),
            'V' => Some(r"v[0-9]{1,2}|[vV]<\w+>|<\w+>"),
            'Q' => Some(r"q[0-9]{1,2}|[qQ]<\w+>|<\w+>"),
            'D' => Some(r"d[0-9]{1,2}|[dD]<\w+>|<\w+>"),
            'G' => Some(r"STACK[0-9]+|<\w+>"),
            'T' => Some(r"QSTACK[0-9]+|<\w+>"),
            'A' => Some(r"STACK_[A-Z0-9_]+|<\w+>"),
            _ => None,
        }
    }

    fn match_loop_terminator(
        &self,
        countdown_line: &str,
        branch_line: &str,
        label: &str,
    ) -> Option<LoopTerminator> {
        static SUBS: OnceLock<Regex> = OnceLock::new();
        static BRANCH: OnceLock<Regex> = OnceLock::new();
        let subs = SUBS.get_or_init(|| {
            Regex::new(r"^\s*subs\s+(?P<reg0>\w+)\s*,\s*(?P<reg1>\w+)\s*,\s*(?P<imm>#?\w+)\s*$")
                .unwrap()
        });
        let branch = BRANCH.get_or_init(|| {
            Regex::new(r"^\s*(?:cbnz|bnz)\s+(?P<reg>\w+)\s*,\s*(?P<label>\w+)\s*$").unwrap()
        });

        let c = subs.captures(countdown_line)?;
        let b = branch.captures(branch_line)?;
        let target = b.name("label")?.as_str();
        if target != label && target.strip_suffix('b') != Some(label) {
            return None;
        }
        Some(LoopTerminator {
            counter: c.name("reg0")?.as_str().to_string(),
            counter_src: c.name("reg1")?.as_str().to_string(),
            decrement: c.name("imm")?.as_str().to_string(),
        })
    }

    fn render_loop_start(
        &self,
        label: &str,
        indentation: usize,
        counter: &str,
        fixup: usize,
        unroll: usize,
    ) -> Vec<String> {
        let indent = " ".repeat(indentation);
        let mut out = Vec::new();
        if unroll > 1 {
            assert!(unroll.is_power_of_two(), "unsupported unroll factor {unroll}");
            out.push(format!(
                "{indent}lsr {counter}, {counter}, #{}",
                unroll.trailing_zeros()
            ));
        }
        if fixup != 0 {
            out.push(format!("{indent}sub {counter}, {counter}, #{fixup}"));
        }
        out.push(".p2align 2".to_string());
        out.push(format!("{label}:"));
        out
    }

    fn render_loop_end(
        &self,
        term: &LoopTerminator,
        label: &str,
        indentation: usize,
    ) -> Vec<String> {
        let indent = " ".repeat(indentation);
        let mut branch_label = label.to_string();
        if branch_label.chars().all(|c| c.is_ascii_digit()) {
            branch_label.push('b');
        }
        vec![
            format!(
                "{indent}subs {}, {}, {}",
                term.counter, term.counter_src, term.decrement
            ),
            format!("{indent}cbnz {}, {branch_label}", term.counter),
        ]
    }
}

fn parse_numbered(name: &str, prefix: char, limit: usize) -> Option<usize> {
    let rest = name.strip_prefix(prefix)?;
    let num = rest.parse::<usize>().ok()?;
    if rest.len() > 2 || (rest.len() == 2 && rest.starts_with('0')) {
        return None;
    }
    (num < limit).then_some(num)
}

// Datatype-dependent restriction of lane-indexed multiplies: for 16-bit
// lanes only v0-v15 can supply the lane operand.
fn lane_mul_restriction(inst: &mut Instruction) {
    let halfword = inst
        .datatypes
        .first()
        .map(|dt| dt == "8h" || dt == "4h")
        .unwrap_or(false);
    if halfword {
        let pool: Vec<String> = (0..16).map(|i| format!("v{i}")).collect();
        if let Some(slot) = inst.restrictions_in.get_mut(1) {
            *slot = Some(pool);
        }
    }
}

/// Pair fusion for `vins`: when two `vins` together write both 64-bit lanes
/// of a vector, the first of the pair no longer depends on the register's
/// prior value and its in-out operand demotes to a pure output.
fn vins_rewrite(dfg: &Dfg, node: usize) -> Option<Instruction> {
    let this = dfg.node(node);
    if this.inst.args_in_out.is_empty() {
        return None;
    }
    let consumers = dfg.in_out_consumers(node, 0);
    if consumers.len() != 1 {
        return None;
    }
    let succ = dfg.node(consumers[0].consumer);
    if succ.inst.variant.name != "vins" || succ.inst.args_in_out.is_empty() {
        return None;
    }
    if succ.inst.args_in_out[0].name != this.inst.args_in_out[0].name {
        return None;
    }
    let lanes = (this.inst.lane.as_deref()?, succ.inst.lane.as_deref()?);
    if lanes != ("0", "1") && lanes != ("1", "0") {
        return None;
    }
    let mut inst = this.inst.clone();
    inst.promote_in_out_to_out(0);
    Some(inst)
}

/// Pair fusion for `stack_vld2_lane`: a pair of complementary lane loads
/// overwrites both target vectors completely, so the first of the pair
/// demotes its two vector in-outs to outputs.
fn stack_vld2_lane_rewrite(dfg: &Dfg, node: usize) -> Option<Instruction> {
    let this = dfg.node(node);
    if this.inst.args_in_out.len() != 3 {
        return None;
    }
    let consumers = dfg.in_out_consumers(node, 0);
    if consumers.len() != 1 {
        return None;
    }
    let succ = dfg.node(consumers[0].consumer);
    if succ.inst.variant.name != "stack_vld2_lane" || succ.inst.args_in_out.len() != 3 {
        return None;
    }
    let same_targets = succ.inst.args_in_out[0].name == this.inst.args_in_out[0].name
        && succ.inst.args_in_out[1].name == this.inst.args_in_out[1].name;
    if !same_targets {
        return None;
    }
    let lanes = (this.inst.lane.as_deref()?, succ.inst.lane.as_deref()?);
    if lanes != ("0", "1") && lanes != ("1", "0") {
        return None;
    }
    let mut inst = this.inst.clone();
    inst.promote_in_out_to_out(0);
    inst.promote_in_out_to_out(0);
    // The combination restriction moves with the demoted operands.
    for combo in &mut inst.combinations {
        if combo.kind == OperandKind::InOut {
            combo.kind = OperandKind::Out;
            combo.positions = vec![inst.args_out.len() - 2, inst.args_out.len() - 1];
        }
    }
    Some(inst)
}

const LD4_COMBO: &[ComboSpec] = &[ComboSpec {
    kind: OperandKind::Out,
    positions: &[0, 1, 2, 3],
    prefix: "v",
    starts: 28,
}];

const ST4_COMBO: &[ComboSpec] = &[ComboSpec {
    kind: OperandKind::In,
    positions: &[1, 2, 3, 4],
    prefix: "v",
    starts: 28,
}];

const LD2_COMBO: &[ComboSpec] = &[ComboSpec {
    kind: OperandKind::Out,
    positions: &[0, 1],
    prefix: "v",
    starts: 30,
}];

const VLD2_LANE_COMBO: &[ComboSpec] = &[ComboSpec {
    kind: OperandKind::InOut,
    positions: &[0, 1],
    prefix: "v",
    starts: 30,
}];

/// The variant table, in match-priority order.
static VARIANTS: &[Variant] = &[
    // Scalar arithmetic.
    Variant::new("add", "add <Xd>, <Xa>, <Xb>", &["Xd"], &["Xa", "Xb"], &[]),
    Variant::new("add_imm", "add <Xd>, <Xa>, <imm>", &["Xd"], &["Xa"], &[]),
    Variant::new(
        "add_shifted",
        "add <Xd>, <Xa>, <Xb>, <imm>",
        &["Xd"],
        &["Xa", "Xb"],
        &[],
    ),
    Variant::new("sub", "sub <Xd>, <Xa>, <Xb>", &["Xd"], &["Xa", "Xb"], &[]),
    Variant::new("sub_imm", "sub <Xd>, <Xa>, <imm>", &["Xd"], &["Xa"], &[]),
    Variant::new("subs", "subs <Xd>, <Xa>, <imm>", &["Xd"], &["Xa"], &[]).modifies_flags(),
    Variant::new("subs_wform", "subs <Wd>, <Wa>, <imm>", &["Wd"], &["Wa"], &[]),
    Variant::new("mov", "mov <Xd>, <Xa>", &["Xd"], &["Xa"], &[]),
    Variant::new("mov_wform", "mov <Wd>, <Wa>", &["Wd"], &["Wa"], &[]),
    Variant::new("mov_imm", "mov <Xd>, <imm>", &["Xd"], &[], &[]),
    Variant::new("movk_imm", "movk <Xd>, <imm>", &[], &[], &["Xd"]),
    Variant::new("lsr", "lsr <Xd>, <Xa>, <imm>", &["Xd"], &["Xa"], &[]),
    Variant::new("lsl", "lsl <Xd>, <Xa>, <imm>", &["Xd"], &["Xa"], &[]),
    Variant::new("lsr_wform", "lsr <Wd>, <Wa>, <Wb>", &["Wd"], &["Wa", "Wb"], &[]),
    Variant::new("asr_wform", "asr <Wd>, <Wa>, <imm>", &["Wd"], &["Wa"], &[]),
    Variant::new("eor_wform", "eor <Wd>, <Wa>, <Wb>", &["Wd"], &["Wa", "Wb"], &[]),
    Variant::new("andi", "and <Xd>, <Xa>, <imm>", &["Xd"], &["Xa"], &[]),
    Variant::new("andi_wform", "and <Wd>, <Wa>, <imm>", &["Wd"], &["Wa"], &[]),
    Variant::new("bic", "bic <Xd>, <Xa>, <imm>", &["Xd"], &["Xa"], &[]),
    Variant::new("bfi", "bfi <Xd>, <Xa>, <imm>", &[], &["Xa"], &["Xd"]),
    Variant::new("tst_wform", "tst <Wa>, <imm>", &[], &["Wa"], &[]).modifies_flags(),
    Variant::new(
        "mul_wform",
        "mul <Wd>, <Wa>, <Wb>",
        &["Wd"],
        &["Wa", "Wb"],
        &[],
    )
    .mul(),
    Variant::new(
        "umull_wform",
        "umull <Xd>, <Wa>, <Wb>",
        &["Xd"],
        &["Wa", "Wb"],
        &[],
    )
    .mul(),
    Variant::new(
        "umaddl_wform",
        "umaddl <Xn>, <Wa>, <Wb>, <Xacc>",
        &["Xn"],
        &["Wa", "Wb", "Xacc"],
        &[],
    )
    .mul(),
    Variant::new("cbnz", "cbnz <Xa>, <imm>", &[], &["Xa"], &[]).branch(),
    Variant::new("nop", "nop", &[], &[], &[]),

    // Vector arithmetic.
    Variant::new(
        "vadd",
        "add <Vd>.<dt0>, <Va>.<dt1>, <Vb>.<dt2>",
        &["Vd"],
        &["Va", "Vb"],
        &[],
    ),
    Variant::new(
        "vsub",
        "sub <Vd>.<dt0>, <Va>.<dt1>, <Vb>.<dt2>",
        &["Vd"],
        &["Va", "Vb"],
        &[],
    ),
    Variant::new(
        "vand",
        "and <Vd>.<dt0>, <Va>.<dt1>, <Vb>.<dt2>",
        &["Vd"],
        &["Va", "Vb"],
        &[],
    ),
    Variant::new(
        "vbic",
        "bic <Vd>.<dt0>, <Va>.<dt1>, <Vb>.<dt2>",
        &["Vd"],
        &["Va", "Vb"],
        &[],
    ),
    Variant::new(
        "vzip1",
        "zip1 <Vd>.<dt0>, <Va>.<dt1>, <Vb>.<dt2>",
        &["Vd"],
        &["Va", "Vb"],
        &[],
    ),
    Variant::new(
        "vzip2",
        "zip2 <Vd>.<dt0>, <Va>.<dt1>, <Vb>.<dt2>",
        &["Vd"],
        &["Va", "Vb"],
        &[],
    ),
    Variant::new(
        "vuzp1",
        "uzp1 <Vd>.<dt0>, <Va>.<dt1>, <Vb>.<dt2>",
        &["Vd"],
        &["Va", "Vb"],
        &[],
    ),
    Variant::new(
        "vuzp2",
        "uzp2 <Vd>.<dt0>, <Va>.<dt1>, <Vb>.<dt2>",
        &["Vd"],
        &["Va", "Vb"],
        &[],
    ),
    Variant::new(
        "trn1",
        "trn1 <Vd>.<dt0>, <Va>.<dt1>, <Vb>.<dt2>",
        &["Vd"],
        &["Va", "Vb"],
        &[],
    ),
    Variant::new(
        "trn2",
        "trn2 <Vd>.<dt0>, <Va>.<dt1>, <Vb>.<dt2>",
        &["Vd"],
        &["Va", "Vb"],
        &[],
    ),
    Variant::new(
        "vmul",
        "mul <Vd>.<dt0>, <Va>.<dt1>, <Vb>.<dt2>",
        &["Vd"],
        &["Va", "Vb"],
        &[],
    )
    .mul(),
    Variant::new(
        "vmul_lane",
        "mul <Vd>.<dt0>, <Va>.<dt1>, <Vb>.<dt2>[<index>]",
        &["Vd"],
        &["Va", "Vb"],
        &[],
    )
    .mul()
    .on_parse(lane_mul_restriction),
    Variant::new(
        "vmla",
        "mla <Vd>.<dt0>, <Va>.<dt1>, <Vb>.<dt2>",
        &[],
        &["Va", "Vb"],
        &["Vd"],
    )
    .mul(),
    Variant::new(
        "vmla_lane",
        "mla <Vd>.<dt0>, <Va>.<dt1>, <Vb>.<dt2>[<index>]",
        &[],
        &["Va", "Vb"],
        &["Vd"],
    )
    .mul()
    .on_parse(lane_mul_restriction),
    Variant::new(
        "vmls",
        "mls <Vd>.<dt0>, <Va>.<dt1>, <Vb>.<dt2>",
        &[],
        &["Va", "Vb"],
        &["Vd"],
    )
    .mul(),
    Variant::new(
        "vmls_lane",
        "mls <Vd>.<dt0>, <Va>.<dt1>, <Vb>.<dt2>[<index>]",
        &[],
        &["Va", "Vb"],
        &["Vd"],
    )
    .mul()
    .on_parse(lane_mul_restriction),
    Variant::new(
        "vqrdmulh",
        "sqrdmulh <Vd>.<dt0>, <Va>.<dt1>, <Vb>.<dt2>",
        &["Vd"],
        &["Va", "Vb"],
        &[],
    )
    .mul(),
    Variant::new(
        "vqrdmulh_lane",
        "sqrdmulh <Vd>.<dt0>, <Va>.<dt1>, <Vb>.<dt2>[<index>]",
        &["Vd"],
        &["Va", "Vb"],
        &[],
    )
    .mul()
    .on_parse(lane_mul_restriction),
    Variant::new(
        "vqdmulh_lane",
        "sqdmulh <Vd>.<dt0>, <Va>.<dt1>, <Vb>.<dt2>[<index>]",
        &["Vd"],
        &["Va", "Vb"],
        &[],
    )
    .mul()
    .on_parse(lane_mul_restriction),
    Variant::new(
        "vmull",
        "umull <Vd>.<dt0>, <Va>.<dt1>, <Vb>.<dt2>",
        &["Vd"],
        &["Va", "Vb"],
        &[],
    )
    .mul(),
    Variant::new(
        "vmlal",
        "umlal <Vd>.<dt0>, <Va>.<dt1>, <Vb>.<dt2>",
        &[],
        &["Va", "Vb"],
        &["Vd"],
    )
    .mul(),
    Variant::new(
        "vshl",
        "shl <Vd>.<dt0>, <Va>.<dt1>, <imm>",
        &["Vd"],
        &["Va"],
        &[],
    ),
    Variant::new(
        "vushr",
        "ushr <Vd>.<dt0>, <Va>.<dt1>, <imm>",
        &["Vd"],
        &["Va"],
        &[],
    ),
    Variant::new(
        "vsrshr",
        "srshr <Vd>.<dt0>, <Va>.<dt1>, <imm>",
        &["Vd"],
        &["Va"],
        &[],
    ),
    Variant::new(
        "vusra",
        "usra <Vd>.<dt0>, <Va>.<dt1>, <imm>",
        &[],
        &["Va"],
        &["Vd"],
    ),
    Variant::new("mov_d01", "mov_d01 <Vd>, <Va>", &[], &["Va"], &["Vd"]),
    Variant::new("vins", "vins <Vd>, <Xa>, <index>", &[], &["Xa"], &["Vd"])
        .on_rewrite(vins_rewrite),

    // Vector loads/stores.
    Variant::new("ldr_vo", "ldr <Qd>, [<Xa>, <imm>]", &["Qd"], &["Xa"], &[]).load(AddrSpec {
        base: "Xa",
        post_index: false,
        writeback: false,
    }),
    Variant::new("ldr_vi", "ldr <Qd>, [<Xa>], <imm>", &["Qd"], &["Xa"], &[]).load(AddrSpec {
        base: "Xa",
        post_index: true,
        writeback: false,
    }),
    Variant::new("str_vo", "str <Qa>, [<Xb>, <imm>]", &[], &["Qa", "Xb"], &[]).store(AddrSpec {
        base: "Xb",
        post_index: false,
        writeback: false,
    }),
    Variant::new("str_vi", "str <Qa>, [<Xb>], <imm>", &[], &["Qa", "Xb"], &[]).store(AddrSpec {
        base: "Xb",
        post_index: true,
        writeback: false,
    }),
    Variant::new(
        "ld4",
        "ld4 {<Va>.<dt0>, <Vb>.<dt1>, <Vc>.<dt2>, <Vd>.<dt3>}, [<Xa>], <imm>",
        &["Va", "Vb", "Vc", "Vd"],
        &[],
        &["Xa"],
    )
    .load(AddrSpec {
        base: "Xa",
        post_index: true,
        writeback: true,
    })
    .combine(LD4_COMBO),
    Variant::new(
        "st4",
        "st4 {<Va>.<dt0>, <Vb>.<dt1>, <Vc>.<dt2>, <Vd>.<dt3>}, [<Xe>], <imm>",
        &[],
        &["Xe", "Va", "Vb", "Vc", "Vd"],
        &[],
    )
    .store(AddrSpec {
        base: "Xe",
        post_index: true,
        writeback: false,
    })
    .combine(ST4_COMBO),
    Variant::new(
        "ld2",
        "ld2 {<Va>.<dt0>, <Vb>.<dt1>}, [<Xa>], <imm>",
        &["Va", "Vb"],
        &["Xa"],
        &[],
    )
    .load(AddrSpec {
        base: "Xa",
        post_index: true,
        writeback: false,
    })
    .combine(LD2_COMBO),

    // Scalar loads/stores.
    Variant::new("x_ldr", "ldr <Xd>, [<Xa>, <imm>]", &["Xd"], &["Xa"], &[]).load(AddrSpec {
        base: "Xa",
        post_index: false,
        writeback: false,
    }),
    Variant::new("x_ldr_noimm", "ldr <Xd>, [<Xa>]", &["Xd"], &["Xa"], &[]).load(AddrSpec {
        base: "Xa",
        post_index: false,
        writeback: false,
    }),
    Variant::new("x_str", "str <Xd>, [<Xa>, <imm>]", &[], &["Xd", "Xa"], &[]).store(AddrSpec {
        base: "Xa",
        post_index: false,
        writeback: false,
    }),
    Variant::new("x_str_noimm", "str <Xd>, [<Xa>]", &[], &["Xd", "Xa"], &[]).store(AddrSpec {
        base: "Xa",
        post_index: false,
        writeback: false,
    }),
    Variant::new("ldr_const", "ldr <Xd>, =<imm>", &["Xd"], &[], &[]).load_literal(),

    // Stack pseudo-instructions: spill slots as first-class registers.
    Variant::new("qsave", "qsave <Td>, <Va>", &["Td"], &["Va"], &[]).stack_op(),
    Variant::new("qrestore", "qrestore <Vd>, <Ta>", &["Vd"], &["Ta"], &[]).stack_op(),
    Variant::new("save", "save <Gd>, <Xa>", &["Gd"], &["Xa"], &[]).stack_op(),
    Variant::new("restore", "restore <Xd>, <Ga>", &["Xd"], &["Ga"], &[]).stack_op(),
    Variant::new("stack_str", "stack_str <Ad>, <Xa>", &["Ad"], &["Xa"], &[]).stack_op(),
    Variant::new("stack_ldr", "stack_ldr <Xd>, <Aa>", &["Xd"], &["Aa"], &[]).stack_op(),
    Variant::new(
        "stack_vld2_lane",
        "stack_vld2_lane <Va>, <Vb>, <Xc>, <Ad>, <index>, <imm>",
        &[],
        &["Ad"],
        &["Va", "Vb", "Xc"],
    )
    .stack_op()
    .combine(VLD2_LANE_COMBO)
    .on_rewrite(stack_vld2_lane_rewrite),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_written_forms() {
        assert_eq!(
            AARCH64.canonicalize("w7"),
            Some(("x7".to_string(), RegisterClass::Gpr))
        );
        assert_eq!(
            AARCH64.canonicalize("q12"),
            Some(("v12".to_string(), RegisterClass::Vector))
        );
        assert_eq!(
            AARCH64.canonicalize("sp"),
            Some(("sp".to_string(), RegisterClass::Gpr))
        );
        assert_eq!(AARCH64.canonicalize("x31"), None);
        assert_eq!(AARCH64.canonicalize("tmp"), None);
    }

    #[test]
    fn recognizes_loop_terminator() {
        let term = AARCH64
            .match_loop_terminator("subs x2, x2, #1", "cbnz x2, polyloop", "polyloop")
            .expect("terminator");
        assert_eq!(term.counter, "x2");
        assert_eq!(term.decrement, "#1");
    }

    #[test]
    fn reserved_contains_flags_and_sp() {
        let reserved = AARCH64.default_reserved();
        assert!(reserved.contains("flags"));
        assert!(reserved.contains("sp"));
    }
}
