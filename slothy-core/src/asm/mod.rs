//! Assembly IR
//!
//! Parsing and emission of assembly text: typed instruction records
//! ([`instruction`]), the variant pattern machinery ([`pattern`]), immediate
//! folding ([`simplify`]) and loop recognition ([`loops`]), plus the
//! line-level helpers shared by the heuristic driver.
//!
//! Lines the parser classifies as non-instructions (labels, directives,
//! comments, blanks) are preserved verbatim through optimization.

pub mod instruction;
pub mod loops;
pub mod pattern;
pub mod simplify;

/// Classification of one source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    /// Blank line.
    Empty,
    /// Pure comment line.
    Comment,
    /// `name:` label; the label name is captured.
    Label(String),
    /// Assembler directive (leading `.`).
    Directive,
    /// Anything else: a candidate instruction.
    Instruction,
}

/// Classify a source line without parsing it.
pub fn classify_line(line: &str) -> LineKind {
    let stripped = strip_comment(line).trim();
    if stripped.is_empty() {
        return if line.trim().is_empty() {
            LineKind::Empty
        } else {
            LineKind::Comment
        };
    }
    if stripped.starts_with('.') {
        return LineKind::Directive;
    }
    if let Some(colon) = stripped.find(':') {
        let (head, tail) = stripped.split_at(colon);
        let head = head.trim();
        if tail[1..].trim().is_empty()
            && !head.is_empty()
            && head.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return LineKind::Label(head.to_string());
        }
    }
    LineKind::Instruction
}

/// Strip a trailing `//` comment.
pub fn strip_comment(line: &str) -> &str {
    match line.find("//") {
        Some(pos) => &line[..pos],
        None => line,
    }
}

/// Split source text into lines.
pub fn split_source(text: &str) -> Vec<String> {
    text.lines().map(|l| l.to_string()).collect()
}

/// Strip comments and drop blank lines, keeping everything else verbatim.
pub fn reduce_source(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .map(|l| strip_comment(l).trim_end().to_string())
        .filter(|l| !l.trim().is_empty())
        .collect()
}

/// Keep only instruction lines (drops labels, directives and comments too).
pub fn instruction_lines(lines: &[String]) -> Vec<String> {
    reduce_source(lines)
        .into_iter()
        .filter(|l| classify_line(l) == LineKind::Instruction)
        .collect()
}

/// Re-indent lines by `width` spaces.
pub fn indent(lines: &[String], width: usize) -> Vec<String> {
    let pad = " ".repeat(width);
    lines
        .iter()
        .map(|l| {
            if l.trim().is_empty() {
                l.clone()
            } else {
                format!("{pad}{}", l.trim_start())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_lines() {
        assert_eq!(classify_line("   "), LineKind::Empty);
        assert_eq!(classify_line("// setup"), LineKind::Comment);
        assert_eq!(classify_line(".p2align 2"), LineKind::Directive);
        assert_eq!(
            classify_line("loop_start:"),
            LineKind::Label("loop_start".to_string())
        );
        assert_eq!(classify_line("add x0, x1, x2"), LineKind::Instruction);
        assert_eq!(
            classify_line("ldr q0, [x1] // comment"),
            LineKind::Instruction
        );
    }

    #[test]
    fn reduce_drops_blanks_and_comments() {
        let lines = vec![
            "  add x0, x1, x2 // acc".to_string(),
            "".to_string(),
            "// only a comment".to_string(),
            "  sub x3, x0, x2".to_string(),
        ];
        let reduced = reduce_source(&lines);
        assert_eq!(reduced, vec!["  add x0, x1, x2", "  sub x3, x0, x2"]);
    }
}
