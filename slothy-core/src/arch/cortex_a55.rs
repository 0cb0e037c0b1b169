//! Cortex-A55-Style Micro-Architecture Model
//!
//! A dual-issue in-order core: two scalar ALU pipes, one scalar MAC pipe,
//! dedicated load and store pipes, and two Neon pipes of which only one
//! multiplies. Latencies and inverse throughputs are table-driven by variant
//! name with tag-based fallbacks.
//!
//! The numbers follow the public software optimization guide closely enough
//! for scheduling purposes; they are not a cycle-accurate model.

use crate::arch::{
    ExecUnit, InstructionTags, MicroArch, OperandRole, UnitAlternatives,
};
use crate::asm::instruction::Instruction;
use smallvec::{smallvec, SmallVec};

/// The model.
pub struct CortexA55;

/// Shared instance; the model is stateless.
pub static CORTEX_A55: CortexA55 = CortexA55;

pub const SCALAR_ALU0: ExecUnit = ExecUnit(0);
pub const SCALAR_ALU1: ExecUnit = ExecUnit(1);
pub const SCALAR_MAC: ExecUnit = ExecUnit(2);
pub const LOAD: ExecUnit = ExecUnit(3);
pub const STORE: ExecUnit = ExecUnit(4);
pub const VEC0: ExecUnit = ExecUnit(5);
pub const VEC1: ExecUnit = ExecUnit(6);

impl CortexA55 {
    fn is_vector(inst: &Instruction) -> bool {
        inst.written_registers()
            .chain(inst.read_registers())
            .any(|op| op.class == crate::arch::RegisterClass::Vector)
    }

    /// Base result latency of an instruction, before forwarding special
    /// cases.
    fn base_latency(inst: &Instruction) -> u32 {
        let tags = inst.variant.tags;
        if tags.is_load {
            return 3;
        }
        if tags.is_stack_op {
            return 3;
        }
        if Self::is_vector(inst) {
            if tags.is_mul {
                return 4;
            }
            return 2;
        }
        if tags.is_mul {
            return 3;
        }
        1
    }
}

impl MicroArch for CortexA55 {
    fn name(&self) -> &'static str {
        "cortex-a55"
    }

    fn issue_width(&self) -> usize {
        2
    }

    fn get_units(&self, inst: &Instruction) -> SmallVec<[UnitAlternatives; 2]> {
        let tags = inst.variant.tags;
        if tags.is_load {
            return smallvec![smallvec![LOAD]];
        }
        if tags.is_store {
            return smallvec![smallvec![STORE]];
        }
        if tags.is_stack_op {
            // Stack pseudo-ops behave like the load/store they stand for.
            if inst.variant.name.contains("save") || inst.variant.name.contains("str") {
                return smallvec![smallvec![STORE]];
            }
            return smallvec![smallvec![LOAD]];
        }
        if Self::is_vector(inst) {
            if tags.is_mul {
                return smallvec![smallvec![VEC0]];
            }
            return smallvec![smallvec![VEC0, VEC1]];
        }
        if tags.is_mul {
            return smallvec![smallvec![SCALAR_MAC]];
        }
        smallvec![smallvec![SCALAR_ALU0, SCALAR_ALU1]]
    }

    fn get_latency(
        &self,
        producer: &Instruction,
        consumer: &Instruction,
        role: OperandRole,
    ) -> u32 {
        let base = Self::base_latency(producer);

        // Multiply-accumulate forwarding: a vector multiply feeding the
        // accumulator operand of a vector multiply-accumulate completes
        // through the accumulator pipeline a cycle at a time.
        if matches!(role, OperandRole::InOut(_))
            && producer.variant.tags.is_mul
            && consumer.variant.tags.is_mul
            && Self::is_vector(producer)
            && Self::is_vector(consumer)
        {
            return 1;
        }
        base
    }

    fn get_throughput(&self, inst: &Instruction) -> u32 {
        match inst.variant.name {
            "ld4" | "st4" => 4,
            "ld2" => 2,
            _ => {
                if Self::is_vector(inst) && inst.variant.tags.is_mul {
                    2
                } else {
                    1
                }
            }
        }
    }

    fn classify(&self, inst: &Instruction) -> InstructionTags {
        inst.variant.tags
    }

    fn unit_name(&self, unit: ExecUnit) -> &'static str {
        match unit {
            SCALAR_ALU0 => "alu0",
            SCALAR_ALU1 => "alu1",
            SCALAR_MAC => "mac",
            LOAD => "load",
            STORE => "store",
            VEC0 => "vec0",
            VEC1 => "vec1",
            _ => "?",
        }
    }

    fn unit_indentation(&self, unit: ExecUnit) -> usize {
        8 * unit.0 as usize
    }
}
