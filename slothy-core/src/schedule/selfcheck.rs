//! Structural Self-Check
//!
//! After solving, the emitted code is re-parsed and its dataflow graph is
//! compared against the input's: the known permutation must map nodes onto
//! nodes of the same variant with identical edge structure (origins, operand
//! positions, cross-iteration flags). The check is structural, not semantic,
//! and a failure indicates a modeling bug: it is never masked.

use crate::dfg::{Dfg, Origin};
use crate::error::{Result, SlothyError};
use bitvec::prelude::*;

/// Verify that `output` is `input` modulo renaming, under the permutation
/// `perm` (input index -> output index).
///
/// `stages` are the stage shifts chosen for the input instructions; under
/// software pipelining an edge's cross-iteration flag in the kernel is the
/// original flag adjusted by the stage difference of its endpoints.
pub fn check(input: &Dfg, output: &Dfg, perm: &[usize], stages: &[i8]) -> Result<()> {
    if input.len() != output.len() || perm.len() != input.len() {
        return Err(SlothyError::SelfCheckFailed(format!(
            "node count mismatch: {} in, {} out, {} mapped",
            input.len(),
            output.len(),
            perm.len()
        )));
    }

    // The permutation must be a bijection.
    let mut seen: BitVec<u32> = bitvec![u32, Lsb0; 0; perm.len()];
    for &p in perm {
        if p >= perm.len() || seen[p] {
            return Err(SlothyError::SelfCheckFailed(
                "reordering is not a permutation".to_string(),
            ));
        }
        seen.set(p, true);
    }

    for (i, node) in input.nodes.iter().enumerate() {
        let image = &output.nodes[perm[i]];
        if node.inst.variant != image.inst.variant {
            return Err(SlothyError::SelfCheckFailed(format!(
                "instruction {} changed variant: {} -> {}",
                i,
                node.inst.variant.name,
                image.inst.variant.name
            )));
        }
        for (kind, pos, origin) in node.reads() {
            let mapped = match origin {
                Origin::External => Origin::External,
                Origin::Node {
                    producer,
                    cross_iter,
                } => {
                    let adjusted = i64::from(cross_iter)
                        + i64::from(stages[producer.node])
                        - i64::from(stages[i]);
                    let cross = match adjusted {
                        0 => false,
                        1 => true,
                        _ => {
                            return Err(SlothyError::SelfCheckFailed(format!(
                                "edge {} -> {} crosses {} iteration boundaries",
                                producer.node, i, adjusted
                            )))
                        }
                    };
                    Origin::Node {
                        producer: crate::dfg::ValueRef {
                            node: perm[producer.node],
                            kind: producer.kind,
                            pos: producer.pos,
                        },
                        cross_iter: cross,
                    }
                }
            };
            let image_origin = match kind {
                crate::asm::instruction::OperandKind::In => image.src_in[pos],
                crate::asm::instruction::OperandKind::InOut => image.src_in_out[pos],
                crate::asm::instruction::OperandKind::Out => unreachable!(),
            };
            if image_origin != mapped {
                return Err(SlothyError::SelfCheckFailed(format!(
                    "dependency mismatch at instruction {i} operand {kind:?}[{pos}]: \
                     expected {mapped:?}, found {image_origin:?}"
                )));
            }
        }
    }
    Ok(())
}
