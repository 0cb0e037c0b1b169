//! Instruction Variant Patterns
//!
//! Every instruction kind the optimizer understands is one [`Variant`]: a
//! static pattern with operand placeholders, the placeholder lists telling
//! the optimizer which operands are read/written, and optional addressing,
//! combination-restriction and rewrite metadata. Parsing tries the variants
//! whose mnemonic matches the first token of a line, first success wins; the
//! emitter is the inverse of the pattern.
//!
//! # Placeholder language
//! - `<Xa>` / `<Wa>` — GPR operand (64/32-bit written form)
//! - `<Va>` / `<Qa>` / `<Da>` — vector operand (written form)
//! - `<Ga>` / `<Ta>` / `<Aa>` — GPR / vector / untyped stack slot
//! - `<dt>` / `<dtN>` — datatype suffix
//! - `<index>` — lane index
//! - `<imm>` — immediate expression (verbatim, `#` included)
//!
//! Whitespace, commas, dots and brackets in patterns match elastically;
//! trailing `//` comments are ignored. Compiled regexes are cached globally,
//! keyed by the pattern string; the cache only grows and all access after
//! startup is read-only.

use crate::arch::{Arch, InstructionTags, RegisterClass};
use crate::asm::instruction::{
    Addressing, Instruction, Operand, OperandCombination, OperandKind,
};
use crate::error::{Result, SlothyError};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, OnceLock};

/// Rewrite callback applied after dataflow-graph construction.
///
/// Returns the rewritten instruction for the node, or `None` if nothing
/// changes. The graph is rebuilt while any callback reports a change.
pub type RewriteFn = fn(&crate::dfg::Dfg, usize) -> Option<Instruction>;

/// Datatype-dependent post-parse hook (e.g. lane-operand restrictions).
pub type PostParseFn = fn(&mut Instruction);

/// Addressing shape of a load/store variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrSpec {
    /// Placeholder name of the base register.
    pub base: &'static str,
    /// The `<imm>` capture is a post-increment (`[base], #imm`) rather than
    /// a pre-indexed offset (`[base, #imm]`).
    pub post_index: bool,
    /// The base register is written back.
    pub writeback: bool,
}

/// Consecutive-register combination restriction of a grouped load/store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComboSpec {
    pub kind: OperandKind,
    /// Operand positions (within the `kind` list) forming the tuple.
    pub positions: &'static [usize],
    /// Register-name prefix of the pool (`"v"`).
    pub prefix: &'static str,
    /// Number of admissible start indices: tuples are
    /// `[prefix{i}, ..., prefix{i+len-1}]` for `i in 0..starts`.
    pub starts: usize,
}

/// One instruction variant.
#[derive(Debug)]
pub struct Variant {
    /// Unique variant name; micro-architecture tables key on this.
    pub name: &'static str,
    /// Parse/emit pattern.
    pub pattern: &'static str,
    /// Placeholder names of write-only operands, in pattern order.
    pub outputs: &'static [&'static str],
    /// Placeholder names of read-only operands.
    pub inputs: &'static [&'static str],
    /// Placeholder names of read-modify-write operands.
    pub in_outs: &'static [&'static str],
    /// Instruction writes the flags (adds an implicit `flags` output).
    pub modifies_flags: bool,
    /// Instruction reads the flags (adds an implicit `flags` input).
    pub reads_flags: bool,
    /// Addressing metadata for loads/stores.
    pub addressing: Option<AddrSpec>,
    /// Combination restrictions.
    pub combinations: &'static [ComboSpec],
    /// Classification tags.
    pub tags: InstructionTags,
    /// Datatype-dependent post-parse hook.
    pub post_parse: Option<PostParseFn>,
    /// Pair-fusion rewrite callback.
    pub rewrite: Option<RewriteFn>,
}

impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Variant {
    pub const fn new(
        name: &'static str,
        pattern: &'static str,
        outputs: &'static [&'static str],
        inputs: &'static [&'static str],
        in_outs: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            pattern,
            outputs,
            inputs,
            in_outs,
            modifies_flags: false,
            reads_flags: false,
            addressing: None,
            combinations: &[],
            tags: InstructionTags {
                is_load: false,
                is_store: false,
                is_mul: false,
                is_stack_op: false,
                is_branch: false,
            },
            post_parse: None,
            rewrite: None,
        }
    }

    pub const fn modifies_flags(mut self) -> Self {
        self.modifies_flags = true;
        self
    }

    pub const fn reads_flags(mut self) -> Self {
        self.reads_flags = true;
        self
    }

    pub const fn load(mut self, spec: AddrSpec) -> Self {
        self.addressing = Some(spec);
        self.tags.is_load = true;
        self
    }

    /// A load without a modeled memory address (literal-pool loads).
    pub const fn load_literal(mut self) -> Self {
        self.tags.is_load = true;
        self
    }

    pub const fn store(mut self, spec: AddrSpec) -> Self {
        self.addressing = Some(spec);
        self.tags.is_store = true;
        self
    }

    pub const fn mul(mut self) -> Self {
        self.tags.is_mul = true;
        self
    }

    pub const fn stack_op(mut self) -> Self {
        self.tags.is_stack_op = true;
        self
    }

    pub const fn branch(mut self) -> Self {
        self.tags.is_branch = true;
        self
    }

    pub const fn combine(mut self, combos: &'static [ComboSpec]) -> Self {
        self.combinations = combos;
        self
    }

    pub const fn on_parse(mut self, hook: PostParseFn) -> Self {
        self.post_parse = Some(hook);
        self
    }

    pub const fn on_rewrite(mut self, hook: RewriteFn) -> Self {
        self.rewrite = Some(hook);
        self
    }

    /// First whitespace-delimited token of the pattern (the mnemonic).
    pub fn mnemonic_token(&self) -> &'static str {
        self.pattern
            .split_whitespace()
            .next()
            .unwrap_or(self.pattern)
    }

    fn placeholder_kind(&self, name: &str) -> Option<(OperandKind, usize)> {
        if let Some(i) = self.outputs.iter().position(|p| *p == name) {
            return Some((OperandKind::Out, i));
        }
        if let Some(i) = self.inputs.iter().position(|p| *p == name) {
            return Some((OperandKind::In, i));
        }
        if let Some(i) = self.in_outs.iter().position(|p| *p == name) {
            return Some((OperandKind::InOut, i));
        }
        None
    }
}

/// Token of a scanned pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternPiece {
    Literal(char),
    Register { name: String, letter: char },
    Datatype(usize),
    Immediate,
    LaneIndex,
}

fn scan_pattern(pattern: &str) -> Vec<PatternPiece> {
    let mut pieces = Vec::new();
    let mut dt_seq = 0usize;
    let mut rest = pattern;
    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix('<') {
            let end = stripped.find('>').expect("unterminated placeholder");
            let name = &stripped[..end];
            rest = &stripped[end + 1..];
            if name == "imm" {
                pieces.push(PatternPiece::Immediate);
            } else if name == "index" {
                pieces.push(PatternPiece::LaneIndex);
            } else if let Some(num) = name.strip_prefix("dt") {
                let idx = if num.is_empty() {
                    let i = dt_seq;
                    dt_seq += 1;
                    i
                } else {
                    num.parse::<usize>().expect("bad datatype index")
                };
                pieces.push(PatternPiece::Datatype(idx));
            } else {
                let letter = name.chars().next().expect("empty placeholder");
                pieces.push(PatternPiece::Register {
                    name: name.to_string(),
                    letter,
                });
            }
        } else {
            let c = rest.chars().next().unwrap();
            pieces.push(PatternPiece::Literal(c));
            rest = &rest[c.len_utf8()..];
        }
    }
    pieces
}

fn build_regex_text(pieces: &[PatternPiece], arch: &dyn Arch) -> String {
    let mut out = String::from(r"^\s*");
    for piece in pieces {
        match piece {
            PatternPiece::Literal(c) => match c {
                ' ' => out.push_str(r"\s+"),
                ',' => out.push_str(r"\s*,\s*"),
                '.' => out.push_str(r"\s*\.\s*"),
                '[' => out.push_str(r"\s*\[\s*"),
                ']' => out.push_str(r"\s*\]\s*"),
                '{' => out.push_str(r"\s*\{\s*"),
                '}' => out.push_str(r"\s*\}\s*"),
                '!' => out.push_str(r"\s*!"),
                c if matches!(
                    c,
                    '\\' | '^' | '$' | '.' | '|' | '?' | '*' | '+' | '(' | ')'
                ) =>
                {
                    out.push('\\');
                    out.push(*c);
                }
                c => out.push(*c),
            },
            PatternPiece::Register { name, letter } => {
                let token = arch
                    .placeholder_token(*letter)
                    .unwrap_or(r"[A-Za-z_][A-Za-z0-9_]*|<[A-Za-z_][A-Za-z0-9_]*>");
                out.push_str(&format!("(?P<{name}>{token})"));
            }
            PatternPiece::Datatype(idx) => {
                out.push_str(&format!(
                    "(?P<dt{idx}>(?:[0-9]{{1,2}})?[a-zA-Z](?:[0-9]{{1,2}})?"
                ));
                out.push(')');
            }
            PatternPiece::Immediate => {
                out.push_str(r"(?P<imm>[\w\s#=,+\-*()]+?)");
            }
            PatternPiece::LaneIndex => {
                out.push_str(r"(?P<index>[0-9]+)");
            }
        }
    }
    out.push_str(r"\s*(?://.*)?$");
    out
}

fn regex_cache() -> &'static Mutex<HashMap<String, Regex>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Regex>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn compile_cached(key: &str, build: impl FnOnce() -> String) -> Regex {
    let mut cache = regex_cache().lock().unwrap_or_else(|p| p.into_inner());
    if let Some(re) = cache.get(key) {
        return re.clone();
    }
    let text = build();
    let re = Regex::new(&text)
        .unwrap_or_else(|err| panic!("invalid variant pattern `{key}`: {err}"));
    cache.insert(key.to_string(), re.clone());
    re
}

/// One variant with its compiled pattern.
struct CompiledVariant {
    def: &'static Variant,
    regex: Regex,
    pieces: Vec<PatternPiece>,
}

/// Parser over a variant table.
///
/// Construction compiles every pattern once (through the global cache);
/// afterwards the parser is read-only.
pub struct AsmParser {
    arch: &'static dyn Arch,
    variants: Vec<CompiledVariant>,
    buckets: HashMap<&'static str, Vec<usize>>,
}

impl AsmParser {
    pub fn new(arch: &'static dyn Arch) -> Self {
        let mut variants = Vec::new();
        let mut buckets: HashMap<&'static str, Vec<usize>> = HashMap::new();
        for def in arch.variants() {
            let pieces = scan_pattern(def.pattern);
            let regex = compile_cached(def.pattern, || build_regex_text(&pieces, arch));
            buckets
                .entry(def.mnemonic_token())
                .or_default()
                .push(variants.len());
            variants.push(CompiledVariant { def, regex, pieces });
        }
        Self {
            arch,
            variants,
            buckets,
        }
    }

    /// Parse one instruction line.
    ///
    /// Tries the variants bucketed under the line's mnemonic first, then the
    /// remaining variants; the first successful match wins.
    ///
    /// # Errors
    /// [`SlothyError::ParseError`] with a per-variant reason trace when no
    /// variant matches.
    pub fn parse_line(
        &self,
        line: &str,
        hints: &BTreeMap<String, RegisterClass>,
    ) -> Result<Instruction> {
        let mnemonic = line.trim().split_whitespace().next().unwrap_or("");
        let mut trace: Vec<(&'static str, String)> = Vec::new();

        let bucket = self.buckets.get(mnemonic).cloned().unwrap_or_default();
        let fallback: Vec<usize> =
            (0..self.variants.len()).filter(|i| !bucket.contains(i)).collect();

        for idx in bucket.into_iter().chain(fallback) {
            let cv = &self.variants[idx];
            match self.try_variant(cv, line, hints) {
                Ok(inst) => {
                    log::debug!("parsed `{}` as {}", line.trim(), cv.def.name);
                    return Ok(inst);
                }
                Err(reason) => trace.push((cv.def.name, reason)),
            }
        }

        let trace_text = trace
            .iter()
            .map(|(name, reason)| format!("  * {name:<20} {reason}"))
            .collect::<Vec<_>>()
            .join("\n");
        Err(SlothyError::ParseError {
            line: line.trim().to_string(),
            trace: trace_text,
        })
    }

    fn try_variant(
        &self,
        cv: &CompiledVariant,
        line: &str,
        hints: &BTreeMap<String, RegisterClass>,
    ) -> std::result::Result<Instruction, String> {
        let caps = cv
            .regex
            .captures(line)
            .ok_or_else(|| "does not match pattern".to_string())?;

        let mut inst = Instruction::new(cv.def);

        // Collect datatypes and lane/immediate from the named groups.
        let mut dts: Vec<(usize, String)> = Vec::new();
        for piece in &cv.pieces {
            if let PatternPiece::Datatype(idx) = piece {
                if let Some(m) = caps.name(&format!("dt{idx}")) {
                    if !dts.iter().any(|(i, _)| i == idx) {
                        dts.push((*idx, m.as_str().to_lowercase()));
                    }
                }
            }
        }
        dts.sort_by_key(|(i, _)| *i);
        inst.datatypes = dts.into_iter().map(|(_, dt)| dt).collect();
        inst.lane = caps.name("index").map(|m| m.as_str().to_string());
        inst.immediate = caps.name("imm").map(|m| m.as_str().trim().to_string());

        // Resolve the register placeholders list by list, preserving order.
        for name in cv.def.outputs {
            let op = self.resolve_register(&caps, name, hints)?;
            inst.args_out.push(op);
            inst.restrictions_out.push(None);
        }
        for (i, name) in cv.def.in_outs.iter().enumerate() {
            let op = self.resolve_register(&caps, name, hints)?;
            inst.args_in_out.push(op);
            inst.restrictions_in_out.push(None);
            inst.in_out_slots.push((OperandKind::InOut, i));
        }
        for name in cv.def.inputs {
            let op = self.resolve_register(&caps, name, hints)?;
            inst.args_in.push(op);
            inst.restrictions_in.push(None);
        }
        if cv.def.modifies_flags {
            inst.args_out
                .push(Operand::new("flags", RegisterClass::Flags, false));
            inst.restrictions_out.push(None);
        }
        if cv.def.reads_flags {
            inst.args_in
                .push(Operand::new("flags", RegisterClass::Flags, false));
            inst.restrictions_in.push(None);
        }

        // Addressing metadata.
        if let Some(spec) = cv.def.addressing {
            let (kind, pos) = cv
                .def
                .placeholder_kind(spec.base)
                .ok_or_else(|| format!("addressing base <{}> not an operand", spec.base))?;
            let base = inst.operand(kind, pos).name.clone();
            let mut addr = Addressing {
                base,
                pre_index: None,
                post_index: None,
                writeback: spec.writeback,
            };
            if spec.post_index {
                addr.post_index = inst.immediate.clone();
            } else {
                addr.pre_index = inst.immediate.clone();
            }
            inst.addressing = Some(addr);
            inst.simplify_immediates();
        }

        // Combination restrictions.
        for combo in cv.def.combinations {
            let width = combo.positions.len();
            let allowed: Vec<Vec<String>> = (0..combo.starts)
                .map(|start| {
                    (0..width)
                        .map(|k| format!("{}{}", combo.prefix, start + k))
                        .collect()
                })
                .collect();
            inst.combinations.push(OperandCombination {
                kind: combo.kind,
                positions: combo.positions.to_vec(),
                allowed,
            });
        }

        if let Some(hook) = cv.def.post_parse {
            hook(&mut inst);
        }
        Ok(inst)
    }

    fn resolve_register(
        &self,
        caps: &regex::Captures<'_>,
        placeholder: &str,
        hints: &BTreeMap<String, RegisterClass>,
    ) -> std::result::Result<Operand, String> {
        let text = caps
            .name(placeholder)
            .ok_or_else(|| format!("placeholder <{placeholder}> not captured"))?
            .as_str();
        let letter = placeholder.chars().next().unwrap_or('X');
        let class = self
            .arch
            .placeholder_class(letter)
            .ok_or_else(|| format!("unknown placeholder letter `{letter}`"))?;

        // Symbolic form: `x<name>` or `<name>`.
        if let Some(open) = text.find('<') {
            let inner = text[open + 1..].trim_end_matches('>');
            let class = hints.get(inner).copied().unwrap_or(class);
            return Ok(Operand::new(inner, class, true));
        }

        match self.arch.canonicalize(text) {
            Some((canonical, found)) if found == class => {
                Ok(Operand::new(canonical, class, false))
            }
            Some((_, found)) => Err(format!(
                "`{text}` is a {found} register, expected {class}"
            )),
            // Bare symbol: class from hints, else from the placeholder.
            None => {
                let class = hints.get(text).copied().unwrap_or(class);
                Ok(Operand::new(text, class, true))
            }
        }
    }

    /// Parse a whole body of instruction lines.
    pub fn parse_body(
        &self,
        lines: &[String],
        hints: &BTreeMap<String, RegisterClass>,
    ) -> Result<Vec<Instruction>> {
        lines
            .iter()
            .map(|line| self.parse_line(line, hints))
            .collect()
    }
}

/// Render an instruction back to assembly text (the pattern inverse).
pub fn render(inst: &Instruction) -> String {
    let pieces = scan_pattern(inst.variant.pattern);
    let mut out = String::new();
    for piece in &pieces {
        match piece {
            PatternPiece::Literal(c) => out.push(*c),
            PatternPiece::Datatype(idx) => {
                if let Some(dt) = inst.datatypes.get(*idx) {
                    out.push_str(&dt.to_uppercase());
                }
            }
            PatternPiece::Immediate => {
                if let Some(imm) = &inst.immediate {
                    out.push_str(imm);
                }
            }
            PatternPiece::LaneIndex => {
                if let Some(lane) = &inst.lane {
                    out.push_str(lane);
                }
            }
            PatternPiece::Register { name, letter } => {
                let (kind, pos) = inst
                    .variant
                    .placeholder_kind(name)
                    .expect("pattern placeholder without operand list entry");
                // Rewrites may have moved a declared in-out elsewhere.
                let (kind, pos) = match kind {
                    OperandKind::InOut => inst.in_out_slot(pos),
                    other => (other, pos),
                };
                let op = inst.operand(kind, pos);
                out.push_str(&render_operand(op, *letter));
            }
        }
    }
    out
}

fn render_operand(op: &Operand, letter: char) -> String {
    if op.symbolic {
        return match op.class {
            RegisterClass::Gpr | RegisterClass::Vector => {
                format!("{}<{}>", letter.to_ascii_lowercase(), op.name)
            }
            _ => format!("<{}>", op.name),
        };
    }
    let lower = letter.to_ascii_lowercase();
    match op.class {
        RegisterClass::Gpr if lower == 'w' => match op.name.strip_prefix('x') {
            Some(digits) => format!("w{digits}"),
            None => op.name.clone(),
        },
        RegisterClass::Vector if lower == 'q' || lower == 'd' => {
            match op.name.strip_prefix('v') {
                Some(digits) => format!("{lower}{digits}"),
                None => op.name.clone(),
            }
        }
        _ => op.name.clone(),
    }
}
