//! Loop Recognition
//!
//! A loop is the instruction range between `<label>:` and the first
//! recognized countdown/branch pair (`subs <reg>, <reg>, #<imm>` followed by
//! `cbnz <reg>, <label>` on AArch64; other targets supply architecturally
//! equivalent matchers through [`Arch`]).

use crate::arch::{Arch, LoopTerminator};
use crate::asm::{classify_line, strip_comment, LineKind};
use crate::error::{Result, SlothyError};

/// A recognized loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopInfo {
    /// Loop start label.
    pub label: String,
    /// Label the terminating branch jumps to (start label, possibly with a
    /// local-label suffix).
    pub end_label: String,
    /// Countdown terminator (counter register, decrement immediate).
    pub terminator: LoopTerminator,
    /// Unroll factor requested for the body.
    pub unroll: usize,
}

/// Source split around a recognized loop.
#[derive(Debug, Clone)]
pub struct ExtractedLoop {
    pub pre: Vec<String>,
    pub body: Vec<String>,
    pub post: Vec<String>,
    pub info: LoopInfo,
}

/// Extract the loop starting at `label` from `lines`.
///
/// # Errors
/// [`SlothyError::LoopNotFound`] when the label is absent or no terminator
/// pair follows it.
pub fn extract(lines: &[String], label: &str, arch: &dyn Arch) -> Result<ExtractedLoop> {
    let mut pre: Vec<String> = Vec::new();
    let mut body: Vec<String> = Vec::new();
    let mut post: Vec<String> = Vec::new();

    // 0: before the label, 1: inside the body, 2: after the loop.
    let mut state = 0usize;
    let mut terminator: Option<LoopTerminator> = None;

    let mut i = 0usize;
    while i < lines.len() {
        let line = &lines[i];
        match state {
            0 => {
                if classify_line(line) == LineKind::Label(label.to_string()) {
                    state = 1;
                } else {
                    pre.push(line.clone());
                }
                i += 1;
            }
            1 => {
                // A body line may be the start of the two-line terminator.
                if i + 1 < lines.len() {
                    let a = strip_comment(line).trim();
                    let b = strip_comment(&lines[i + 1]).trim();
                    if let Some(term) = arch.match_loop_terminator(a, b, label) {
                        terminator = Some(term);
                        state = 2;
                        i += 2;
                        continue;
                    }
                }
                body.push(line.clone());
                i += 1;
            }
            _ => {
                post.push(line.clone());
                i += 1;
            }
        }
    }

    let terminator = match (state, terminator) {
        (2, Some(t)) => t,
        _ => return Err(SlothyError::LoopNotFound(label.to_string())),
    };

    log::debug!(
        "loop `{label}`: {} body lines, counter {}",
        body.len(),
        terminator.counter
    );

    Ok(ExtractedLoop {
        pre,
        body,
        post,
        info: LoopInfo {
            label: label.to_string(),
            end_label: label.to_string(),
            terminator,
            unroll: 1,
        },
    })
}

/// Re-emit a loop around an optimized kernel.
///
/// `fixup` is the number of exceptional (preamble/postamble) iterations to
/// subtract from the counter before entering the loop; `unroll` divides the
/// trip count when the body was duplicated.
pub fn render(
    arch: &dyn Arch,
    info: &LoopInfo,
    kernel: &[String],
    indentation: usize,
    fixup: usize,
    unroll: usize,
) -> Vec<String> {
    let mut out = arch.render_loop_start(
        &info.label,
        indentation,
        &info.terminator.counter_src,
        fixup,
        unroll,
    );
    out.extend(kernel.iter().cloned());
    out.extend(arch.render_loop_end(&info.terminator, &info.end_label, indentation));
    out
}

/// Duplicate a loop body `unroll` times.
pub fn unroll_body(body: &[String], unroll: usize) -> Vec<String> {
    let mut out = Vec::with_capacity(body.len() * unroll);
    for _ in 0..unroll {
        out.extend(body.iter().cloned());
    }
    out
}
