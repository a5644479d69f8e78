//! Approximate 8086 clock-cycle estimates.
//!
//! Diagnostic only: nothing here touches CPU state. An estimate is the base
//! cost for the (operation, operand pairing), the effective-address surcharge
//! when memory is involved, and a 4-cycle penalty per word transfer at an odd
//! address.

use crate::instruction::{EffectiveAddressCalculation, Instruction, InstructionType, Operand};
use serde::Serialize;
use std::fmt;

const ODD_TRANSFER_PENALTY: u32 = 4;
const SEGMENT_OVERRIDE_CYCLES: u32 = 2;

/// Breakdown of one instruction's estimated cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CycleEstimate {
    pub base: u32,
    pub ea: u32,
    pub penalty: u32,
}

impl CycleEstimate {
    pub fn total(&self) -> u32 {
        self.base + self.ea + self.penalty
    }
}

impl fmt::Display for CycleEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.total())?;
        if self.ea != 0 || self.penalty != 0 {
            write!(f, " ({}", self.base)?;
            if self.ea != 0 {
                write!(f, " + {}ea", self.ea)?;
            }
            if self.penalty != 0 {
                write!(f, " + {}p", self.penalty)?;
            }
            f.write_str(")")?;
        }
        Ok(())
    }
}

/// Operand shapes that select a row of the timing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pairing {
    RegReg,
    RegMem,
    MemReg,
    RegImm,
    MemImm,
    /// MOV between the accumulator and a direct address (A0-A3 form).
    AccMem,
    Reg,
    Mem,
}

fn pairing(instruction: &Instruction) -> Option<Pairing> {
    let pairing = match instruction.operands {
        [Operand::Register(_), Operand::Memory(_)] | [Operand::Memory(_), Operand::Register(_)]
            if instruction.kind == InstructionType::Mov && instruction.flags.accumulator =>
        {
            Pairing::AccMem
        }
        [Operand::Register(_), Operand::Register(_)] => Pairing::RegReg,
        [Operand::Register(_), Operand::Memory(_)] => Pairing::RegMem,
        [Operand::Memory(_), Operand::Register(_)] => Pairing::MemReg,
        [Operand::Register(_), Operand::Immediate(_)] => Pairing::RegImm,
        [Operand::Memory(_), Operand::Immediate(_)] => Pairing::MemImm,
        [Operand::Register(_), Operand::None] => Pairing::Reg,
        [Operand::Memory(_), Operand::None] => Pairing::Mem,
        _ => return None,
    };
    Some(pairing)
}

/// Base cycles and number of memory word transfers.
fn base_cost(instruction: &Instruction, pairing: Pairing) -> Option<(u32, u32)> {
    use InstructionType::*;
    use Pairing::*;
    let cost = match (instruction.kind, pairing) {
        (Mov, RegReg) => (2, 0),
        (Mov, RegMem) => (8, 1),
        (Mov, MemReg) => (9, 1),
        (Mov, RegImm) => (4, 0),
        (Mov, MemImm) => (10, 1),
        (Mov, AccMem) => (10, 1),

        (Add | Adc | Sub | Sbb | And | Or | Xor, RegReg) => (3, 0),
        (Add | Adc | Sub | Sbb | And | Or | Xor, RegMem) => (9, 1),
        (Add | Adc | Sub | Sbb | And | Or | Xor, MemReg) => (16, 2),
        (Add | Adc | Sub | Sbb | And | Or | Xor, RegImm) => (4, 0),
        (Add | Adc | Sub | Sbb | And | Or | Xor, MemImm) => (17, 2),

        (Cmp, RegReg) => (3, 0),
        (Cmp, RegMem | MemReg) => (9, 1),
        (Cmp, RegImm) => (4, 0),
        (Cmp, MemImm) => (10, 1),

        (Test, RegReg) => (3, 0),
        (Test, RegMem | MemReg) => (9, 1),
        (Test, RegImm) if instruction.flags.accumulator => (4, 0),
        (Test, RegImm) => (5, 0),
        (Test, MemImm) => (11, 1),

        (Xchg, RegReg) if instruction.flags.accumulator => (3, 0),
        (Xchg, RegReg) => (4, 0),
        (Xchg, RegMem | MemReg) => (17, 2),

        (Inc | Dec, Reg) if instruction.flags.wide => (2, 0),
        (Inc | Dec, Reg) => (3, 0),
        (Inc | Dec, Mem) => (15, 2),
        (Neg | Not, Reg) => (3, 0),
        (Neg | Not, Mem) => (16, 2),

        (Push, Reg) => {
            if is_segment(instruction.operands[0]) {
                (10, 1)
            } else {
                (11, 1)
            }
        }
        (Push, Mem) => (16, 2),
        (Pop, Reg) => (8, 1),
        (Pop, Mem) => (17, 2),

        (Lea, RegMem) => (2, 0),
        _ => return None,
    };
    Some(cost)
}

fn is_segment(operand: Operand) -> bool {
    matches!(operand, Operand::Register(r) if r.is_segment())
}

/// Effective-address surcharge for a memory operand's formula.
pub fn effective_address_cycles(eac: EffectiveAddressCalculation, displacement: i16) -> u32 {
    use EffectiveAddressCalculation::*;
    let with_displacement = if displacement != 0 { 4 } else { 0 };
    match eac {
        DirectAccess => 6,
        Bx | Bp | Si | Di => 5 + with_displacement,
        BpDi | BxSi => 7 + with_displacement,
        BpSi | BxDi => 8 + with_displacement,
    }
}

/// Estimate the cost of `instruction`.
///
/// `memory_address` is the resolved address of its memory operand, if any;
/// it only feeds the odd-address penalty. Returns `None` for operations the
/// timing table does not cover.
pub fn estimate(instruction: &Instruction, memory_address: Option<u16>) -> Option<CycleEstimate> {
    let pairing = pairing(instruction)?;
    let (base, transfers) = base_cost(instruction, pairing)?;

    let memory = instruction.memory_operand();
    let ea = match memory {
        // A0-A3 carry the address inline, no ModRM calculation
        Some(_) if pairing == Pairing::AccMem => 0,
        Some(m) => {
            let overridden = if instruction.segment_override.is_some() {
                SEGMENT_OVERRIDE_CYCLES
            } else {
                0
            };
            effective_address_cycles(m.eac, m.displacement) + overridden
        }
        None => 0,
    };

    let odd_word_access = instruction.flags.wide
        && memory.is_some()
        && memory_address.is_some_and(|address| address & 1 == 1);
    let penalty = if odd_word_access {
        ODD_TRANSFER_PENALTY * transfers
    } else {
        0
    };

    Some(CycleEstimate { base, ea, penalty })
}
