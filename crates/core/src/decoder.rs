//! 8086 machine-code decoder
//!
//! `decode(buffer, offset)` turns the bytes at `offset` into one
//! [`Instruction`]. Opcode recognition walks [`OPCODE_RULES`], an ordered
//! table of `(mask, pattern)` entries; the first entry with
//! `opcode & mask == pattern` owns the opcode. Several patterns overlap, so
//! table order is significant.
//!
//! Every byte is read through a bounds-checked cursor: a buffer that ends
//! mid-instruction yields [`DecodeError::Truncated`] naming the field that
//! was missing.

use crate::instruction::{
    EffectiveAddressCalculation, Instruction, InstructionType, MemoryOperand, Operand, Register,
};
use std::fmt;
use thiserror::Error;

/// Field being read when the buffer ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStage {
    Opcode,
    ModRm,
    Displacement,
    Data,
    FarPointer,
}

impl fmt::Display for DecodeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DecodeStage::Opcode => "opcode",
            DecodeStage::ModRm => "ModRM",
            DecodeStage::Displacement => "displacement",
            DecodeStage::Data => "immediate data",
            DecodeStage::FarPointer => "far pointer",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("instruction at {offset:#06x} is truncated: missing {stage} byte")]
    Truncated { offset: u32, stage: DecodeStage },
    #[error("unknown opcode {opcode:#04x} at {offset:#06x}")]
    UnknownOpcode { offset: u32, opcode: u8 },
    #[error("opcode {opcode:#04x} at {offset:#06x} has no operation for sub-opcode {sub:#x}")]
    InvalidSubOpcode { offset: u32, opcode: u8, sub: u8 },
}

impl DecodeError {
    /// Offset of the instruction that failed to decode.
    pub fn offset(&self) -> u32 {
        match *self {
            DecodeError::Truncated { offset, .. }
            | DecodeError::UnknownOpcode { offset, .. }
            | DecodeError::InvalidSubOpcode { offset, .. } => offset,
        }
    }
}

// Sub-opcode lookup tables, indexed by a 3-, 4- or 2-bit field.

const ARITHMETIC: [InstructionType; 8] = [
    InstructionType::Add,
    InstructionType::Or,
    InstructionType::Adc,
    InstructionType::Sbb,
    InstructionType::And,
    InstructionType::Sub,
    InstructionType::Xor,
    InstructionType::Cmp,
];

const GROUP_F6: [Option<InstructionType>; 8] = [
    Some(InstructionType::Test),
    None,
    Some(InstructionType::Not),
    Some(InstructionType::Neg),
    Some(InstructionType::Mul),
    Some(InstructionType::Imul),
    Some(InstructionType::Div),
    Some(InstructionType::Idiv),
];

const GROUP_FF: [Option<InstructionType>; 8] = [
    Some(InstructionType::Inc),
    Some(InstructionType::Dec),
    Some(InstructionType::Call),
    Some(InstructionType::Call),
    Some(InstructionType::Jmp),
    Some(InstructionType::Jmp),
    Some(InstructionType::Push),
    None,
];

const SHIFTS: [Option<InstructionType>; 8] = [
    Some(InstructionType::Rol),
    Some(InstructionType::Ror),
    Some(InstructionType::Rcl),
    Some(InstructionType::Rcr),
    Some(InstructionType::Shl),
    Some(InstructionType::Shr),
    None,
    Some(InstructionType::Sar),
];

const STRINGS: [Option<InstructionType>; 8] = [
    None,
    None,
    Some(InstructionType::Movs),
    Some(InstructionType::Cmps),
    None,
    Some(InstructionType::Stos),
    Some(InstructionType::Lods),
    Some(InstructionType::Scas),
];

const JUMPS: [InstructionType; 16] = [
    InstructionType::Jo,
    InstructionType::Jno,
    InstructionType::Jb,
    InstructionType::Jnb,
    InstructionType::Je,
    InstructionType::Jnz,
    InstructionType::Jbe,
    InstructionType::Ja,
    InstructionType::Js,
    InstructionType::Jns,
    InstructionType::Jp,
    InstructionType::Jnp,
    InstructionType::Jl,
    InstructionType::Jnl,
    InstructionType::Jle,
    InstructionType::Jg,
];

const LOOPS: [InstructionType; 4] = [
    InstructionType::Loopnz,
    InstructionType::Loopz,
    InstructionType::Loop,
    InstructionType::Jcxz,
];

const PROCESSOR_CONTROL: [Option<InstructionType>; 8] = [
    Some(InstructionType::Clc),
    Some(InstructionType::Stc),
    Some(InstructionType::Cli),
    Some(InstructionType::Sti),
    Some(InstructionType::Cld),
    Some(InstructionType::Std),
    None,
    None,
];

const SINGLE_BYTE: [(u8, InstructionType); 16] = [
    (0xD7, InstructionType::Xlat),
    (0x9F, InstructionType::Lahf),
    (0x9E, InstructionType::Sahf),
    (0x9C, InstructionType::Pushf),
    (0x9D, InstructionType::Popf),
    (0x37, InstructionType::Aaa),
    (0x27, InstructionType::Daa),
    (0x3F, InstructionType::Aas),
    (0x2F, InstructionType::Das),
    (0x98, InstructionType::Cbw),
    (0x99, InstructionType::Cwd),
    (0xCE, InstructionType::Into),
    (0xCF, InstructionType::Iret),
    (0xF5, InstructionType::Cmc),
    (0xF4, InstructionType::Hlt),
    (0x9B, InstructionType::Wait),
];

/// Bounds-checked cursor over the input buffer.
struct ByteReader<'a> {
    buffer: &'a [u8],
    start: usize,
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buffer: &'a [u8], offset: u32) -> Self {
        let start = offset as usize;
        Self {
            buffer,
            start,
            pos: start,
        }
    }

    fn offset(&self) -> u32 {
        self.start as u32
    }

    fn consumed(&self) -> u32 {
        (self.pos - self.start) as u32
    }

    fn next(&mut self, stage: DecodeStage) -> Result<u8, DecodeError> {
        let byte = *self.buffer.get(self.pos).ok_or(DecodeError::Truncated {
            offset: self.offset(),
            stage,
        })?;
        self.pos += 1;
        Ok(byte)
    }

    fn next_u16(&mut self, stage: DecodeStage) -> Result<u16, DecodeError> {
        let low = self.next(stage)?;
        let high = self.next(stage)?;
        Ok(u16::from_le_bytes([low, high]))
    }

    /// One byte, or two when `wide`.
    fn data(&mut self, wide: bool) -> Result<u16, DecodeError> {
        if wide {
            self.next_u16(DecodeStage::Data)
        } else {
            self.next(DecodeStage::Data).map(u16::from)
        }
    }

    /// One byte sign-extended to 16 bits.
    fn data_i8(&mut self) -> Result<i16, DecodeError> {
        self.next(DecodeStage::Data).map(|b| b as i8 as i16)
    }

    fn invalid_sub(&self, opcode: u8, sub: u8) -> DecodeError {
        DecodeError::InvalidSubOpcode {
            offset: self.offset(),
            opcode,
            sub,
        }
    }

    fn unknown(&self, opcode: u8) -> DecodeError {
        DecodeError::UnknownOpcode {
            offset: self.offset(),
            opcode,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ModRm {
    mode: u8,
    reg: u8,
    rm: u8,
}

impl ModRm {
    fn read(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let byte = reader.next(DecodeStage::ModRm)?;
        Ok(Self {
            mode: byte >> 6,
            reg: (byte >> 3) & 0b111,
            rm: byte & 0b111,
        })
    }

    /// The register/memory operand selected by `mode` and `rm`, consuming
    /// any displacement bytes.
    fn operand(&self, reader: &mut ByteReader<'_>, wide: bool) -> Result<Operand, DecodeError> {
        let memory = match self.mode {
            0b11 => return Ok(Operand::Register(Register::from_reg_field(wide, self.rm))),
            0b00 if self.rm == 0b110 => {
                MemoryOperand::direct(reader.next_u16(DecodeStage::Displacement)?)
            }
            0b00 => MemoryOperand::new(EffectiveAddressCalculation::from_rm(self.rm), 0),
            0b01 => {
                let displacement = reader.next(DecodeStage::Displacement)? as i8 as i16;
                MemoryOperand::new(EffectiveAddressCalculation::from_rm(self.rm), displacement)
            }
            _ => {
                let displacement = reader.next_u16(DecodeStage::Displacement)? as i16;
                MemoryOperand::new(EffectiveAddressCalculation::from_rm(self.rm), displacement)
            }
        };
        Ok(Operand::Memory(memory))
    }

    fn register(&self, wide: bool) -> Operand {
        Operand::Register(Register::from_reg_field(wide, self.reg))
    }
}

type DecodeFn = fn(&mut ByteReader<'_>, u8) -> Result<Instruction, DecodeError>;

/// One entry of the opcode dispatch table.
pub struct OpcodeRule {
    pub mask: u8,
    pub pattern: u8,
    /// Short description of the encoding family, for listings and tests.
    pub family: &'static str,
    decode: DecodeFn,
}

impl OpcodeRule {
    const fn new(mask: u8, pattern: u8, family: &'static str, decode: DecodeFn) -> Self {
        Self {
            mask,
            pattern,
            family,
            decode,
        }
    }

    #[inline]
    pub fn matches(&self, opcode: u8) -> bool {
        opcode & self.mask == self.pattern
    }
}

impl fmt::Debug for OpcodeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpcodeRule")
            .field("mask", &format_args!("{:#04x}", self.mask))
            .field("pattern", &format_args!("{:#04x}", self.pattern))
            .field("family", &self.family)
            .finish()
    }
}

/// Opcode dispatch table, highest priority first.
pub static OPCODE_RULES: &[OpcodeRule] = &[
    OpcodeRule::new(0xFC, 0x88, "mov r/m, reg", decode_mov_rm_reg),
    OpcodeRule::new(0xFD, 0x8C, "mov r/m, sreg", decode_mov_segment),
    OpcodeRule::new(0xFE, 0xC6, "mov r/m, imm", decode_mov_imm_rm),
    OpcodeRule::new(0xF0, 0xB0, "mov reg, imm", decode_mov_imm_reg),
    OpcodeRule::new(0xFE, 0xA0, "mov acc, [addr]", decode_mov_acc),
    OpcodeRule::new(0xFE, 0xA2, "mov [addr], acc", decode_mov_acc),
    OpcodeRule::new(0xC4, 0x00, "arith r/m, reg", decode_arith_rm_reg),
    OpcodeRule::new(0xFC, 0x80, "arith r/m, imm", decode_arith_imm_rm),
    OpcodeRule::new(0xC6, 0x04, "arith acc, imm", decode_arith_imm_acc),
    OpcodeRule::new(0xF0, 0x70, "jcc", decode_jcc),
    OpcodeRule::new(0xFC, 0xE0, "loop", decode_loop),
    OpcodeRule::new(0xFE, 0xFE, "group fe/ff", decode_group_ff),
    OpcodeRule::new(0xF8, 0x50, "push reg", decode_push_pop_reg),
    OpcodeRule::new(0xE7, 0x06, "push sreg", decode_push_pop_segment),
    OpcodeRule::new(0xFF, 0x8F, "pop r/m", decode_pop_rm),
    OpcodeRule::new(0xF8, 0x58, "pop reg", decode_push_pop_reg),
    OpcodeRule::new(0xE7, 0x07, "pop sreg", decode_push_pop_segment),
    OpcodeRule::new(0xFE, 0x86, "xchg r/m, reg", decode_xchg_rm_reg),
    OpcodeRule::new(0xF8, 0x90, "xchg ax, reg", decode_xchg_acc),
    OpcodeRule::new(0xF6, 0xE4, "in", decode_in_out),
    OpcodeRule::new(0xF6, 0xE6, "out", decode_in_out),
    OpcodeRule::new(0xFF, 0xD7, "xlat", decode_single),
    OpcodeRule::new(0xFF, 0x8D, "lea", decode_load_pointer),
    OpcodeRule::new(0xFF, 0xC5, "lds", decode_load_pointer),
    OpcodeRule::new(0xFF, 0xC4, "les", decode_load_pointer),
    OpcodeRule::new(0xFF, 0x9F, "lahf", decode_single),
    OpcodeRule::new(0xFF, 0x9E, "sahf", decode_single),
    OpcodeRule::new(0xFF, 0x9C, "pushf", decode_single),
    OpcodeRule::new(0xFF, 0x9D, "popf", decode_single),
    OpcodeRule::new(0xF0, 0x40, "inc/dec reg", decode_inc_dec_reg),
    OpcodeRule::new(0xFF, 0x37, "aaa", decode_single),
    OpcodeRule::new(0xFF, 0x27, "daa", decode_single),
    OpcodeRule::new(0xFE, 0xF6, "group f6/f7", decode_group_f6),
    OpcodeRule::new(0xFF, 0x3F, "aas", decode_single),
    OpcodeRule::new(0xFF, 0x2F, "das", decode_single),
    OpcodeRule::new(0xFE, 0xD4, "aam/aad", decode_ascii_adjust),
    OpcodeRule::new(0xFF, 0x98, "cbw", decode_single),
    OpcodeRule::new(0xFF, 0x99, "cwd", decode_single),
    OpcodeRule::new(0xFC, 0xD0, "shift/rotate", decode_shift),
    OpcodeRule::new(0xFE, 0x84, "test r/m, reg", decode_test_rm_reg),
    OpcodeRule::new(0xFE, 0xA8, "test acc, imm", decode_test_imm_acc),
    OpcodeRule::new(0xF0, 0xA0, "string", decode_string),
    OpcodeRule::new(0xF6, 0xC2, "ret", decode_ret),
    OpcodeRule::new(0xFE, 0xCC, "int", decode_int),
    OpcodeRule::new(0xFF, 0xCE, "into", decode_single),
    OpcodeRule::new(0xFF, 0xCF, "iret", decode_single),
    OpcodeRule::new(0xFE, 0xE8, "call/jmp near", decode_near_branch),
    OpcodeRule::new(0xFF, 0xEB, "jmp short", decode_near_branch),
    OpcodeRule::new(0xFF, 0x9A, "call far", decode_far_branch),
    OpcodeRule::new(0xFF, 0xEA, "jmp far", decode_far_branch),
    OpcodeRule::new(0xF8, 0xF8, "processor control", decode_processor_control),
    OpcodeRule::new(0xFF, 0xF5, "cmc", decode_single),
    OpcodeRule::new(0xFF, 0xF4, "hlt", decode_single),
    OpcodeRule::new(0xFF, 0x9B, "wait", decode_single),
    OpcodeRule::new(0xF8, 0xD8, "esc", decode_esc),
];

/// First rule in priority order that claims `opcode`.
pub fn find_rule(opcode: u8) -> Option<&'static OpcodeRule> {
    OPCODE_RULES.iter().find(|rule| rule.matches(opcode))
}

#[derive(Debug, Default)]
struct Prefixes {
    segment: Option<Register>,
    lock: bool,
    rep: bool,
    rep_nz: bool,
}

/// Decode the instruction starting at `offset`.
pub fn decode(buffer: &[u8], offset: u32) -> Result<Instruction, DecodeError> {
    let mut reader = ByteReader::new(buffer, offset);
    let mut prefixes = Prefixes::default();

    let opcode = loop {
        let byte = reader.next(DecodeStage::Opcode)?;
        match byte {
            0x26 | 0x2E | 0x36 | 0x3E => prefixes.segment = Some(Register::segment(byte >> 3)),
            0xF0 => prefixes.lock = true,
            0xF2 | 0xF3 => {
                prefixes.rep = true;
                prefixes.rep_nz = byte == 0xF2;
            }
            _ => break byte,
        }
    };

    let rule = find_rule(opcode).ok_or_else(|| reader.unknown(opcode))?;
    let mut instruction = (rule.decode)(&mut reader, opcode)?;

    instruction.address = offset;
    instruction.size = reader.consumed();
    instruction.segment_override = prefixes.segment;
    instruction.flags.lock = prefixes.lock;
    instruction.flags.rep = prefixes.rep;
    instruction.flags.rep_nz = prefixes.rep_nz;
    Ok(instruction)
}

/// Decode every instruction in `buffer`, front to back.
pub fn disassemble(buffer: &[u8]) -> Result<Vec<Instruction>, DecodeError> {
    let mut instructions = Vec::new();
    let mut offset = 0u32;
    while (offset as usize) < buffer.len() {
        let instruction = decode(buffer, offset)?;
        offset = instruction.next_address();
        instructions.push(instruction);
    }
    Ok(instructions)
}

fn is_wide(opcode: u8) -> bool {
    opcode & 0b1 != 0
}

/// Shared shape of the `d w | mod reg r/m` encodings.
fn decode_rm_reg(
    reader: &mut ByteReader<'_>,
    kind: InstructionType,
    direction: bool,
    wide: bool,
) -> Result<Instruction, DecodeError> {
    let modrm = ModRm::read(reader)?;
    let rm = modrm.operand(reader, wide)?;
    let reg = modrm.register(wide);
    let operands = if direction { [reg, rm] } else { [rm, reg] };
    Ok(Instruction::with_operands(kind, wide, operands))
}

fn decode_mov_rm_reg(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    decode_rm_reg(reader, InstructionType::Mov, opcode & 0b10 != 0, is_wide(opcode))
}

fn decode_arith_rm_reg(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    let kind = ARITHMETIC[((opcode >> 3) & 0b111) as usize];
    decode_rm_reg(reader, kind, opcode & 0b10 != 0, is_wide(opcode))
}

fn decode_xchg_rm_reg(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    decode_rm_reg(reader, InstructionType::Xchg, false, is_wide(opcode))
}

fn decode_test_rm_reg(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    decode_rm_reg(reader, InstructionType::Test, false, is_wide(opcode))
}

fn decode_load_pointer(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    let kind = match opcode {
        0x8D => InstructionType::Lea,
        0xC5 => InstructionType::Lds,
        _ => InstructionType::Les,
    };
    decode_rm_reg(reader, kind, true, true)
}

fn decode_mov_segment(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    let modrm = ModRm::read(reader)?;
    if modrm.reg & 0b100 != 0 {
        return Err(reader.invalid_sub(opcode, modrm.reg));
    }
    let rm = modrm.operand(reader, true)?;
    let segment = Operand::Register(Register::segment(modrm.reg));
    let operands = if opcode & 0b10 != 0 {
        [segment, rm]
    } else {
        [rm, segment]
    };
    Ok(Instruction::with_operands(InstructionType::Mov, true, operands))
}

fn decode_mov_imm_rm(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    let wide = is_wide(opcode);
    let modrm = ModRm::read(reader)?;
    if modrm.reg != 0 {
        return Err(reader.invalid_sub(opcode, modrm.reg));
    }
    let rm = modrm.operand(reader, wide)?;
    let data = reader.data(wide)?;
    Ok(Instruction::with_operands(
        InstructionType::Mov,
        wide,
        [rm, Operand::Immediate(data)],
    ))
}

fn decode_mov_imm_reg(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    let wide = opcode & 0b1000 != 0;
    let reg = Register::from_reg_field(wide, opcode);
    let data = reader.data(wide)?;
    Ok(Instruction::with_operands(
        InstructionType::Mov,
        wide,
        [Operand::Register(reg), Operand::Immediate(data)],
    ))
}

/// A0-A3: the address is always two bytes, whatever the width.
fn decode_mov_acc(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    let wide = is_wide(opcode);
    let address = reader.next_u16(DecodeStage::Displacement)?;
    let memory = Operand::Memory(MemoryOperand::direct(address));
    let acc = Operand::Register(Register::from_reg_field(wide, 0));
    let operands = if opcode & 0b10 == 0 {
        [acc, memory]
    } else {
        [memory, acc]
    };
    let mut instruction = Instruction::with_operands(InstructionType::Mov, wide, operands);
    instruction.flags.accumulator = true;
    Ok(instruction)
}

/// 80-83. The S bit sign-extends a one-byte immediate for arithmetic
/// operations; AND, OR and XOR ignore it and read data by W alone.
fn decode_arith_imm_rm(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    let sign_extend = opcode & 0b10 != 0;
    let wide = is_wide(opcode);
    let modrm = ModRm::read(reader)?;
    let kind = ARITHMETIC[modrm.reg as usize];
    let rm = modrm.operand(reader, wide)?;

    let logical = matches!(
        kind,
        InstructionType::And | InstructionType::Or | InstructionType::Xor
    );
    let data = if !logical && sign_extend && wide {
        reader.data_i8()? as u16
    } else if !logical && sign_extend {
        reader.data(false)?
    } else {
        reader.data(wide)?
    };
    Ok(Instruction::with_operands(
        kind,
        wide,
        [rm, Operand::Immediate(data)],
    ))
}

fn decode_arith_imm_acc(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    let kind = ARITHMETIC[((opcode >> 3) & 0b111) as usize];
    decode_imm_acc(reader, opcode, kind)
}

fn decode_test_imm_acc(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    decode_imm_acc(reader, opcode, InstructionType::Test)
}

fn decode_imm_acc(
    reader: &mut ByteReader<'_>,
    opcode: u8,
    kind: InstructionType,
) -> Result<Instruction, DecodeError> {
    let wide = is_wide(opcode);
    let data = reader.data(wide)?;
    let mut instruction = Instruction::with_operands(
        kind,
        wide,
        [
            Operand::Register(Register::from_reg_field(wide, 0)),
            Operand::Immediate(data),
        ],
    );
    instruction.flags.accumulator = true;
    Ok(instruction)
}

fn relative(kind: InstructionType, increment: i16) -> Instruction {
    let mut instruction =
        Instruction::with_operands(kind, false, [Operand::IpInc(increment), Operand::None]);
    instruction.flags.ip_relative = true;
    instruction
}

fn decode_jcc(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    let increment = reader.data_i8()?;
    Ok(relative(JUMPS[(opcode & 0x0F) as usize], increment))
}

fn decode_loop(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    let increment = reader.data_i8()?;
    Ok(relative(LOOPS[(opcode & 0b11) as usize], increment))
}

/// E8/E9 carry a 16-bit displacement, EB an 8-bit one.
fn decode_near_branch(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    let (kind, increment) = match opcode {
        0xE8 => (InstructionType::Call, reader.next_u16(DecodeStage::Data)? as i16),
        0xE9 => (InstructionType::Jmp, reader.next_u16(DecodeStage::Data)? as i16),
        _ => (InstructionType::Jmp, reader.data_i8()?),
    };
    let mut instruction = relative(kind, increment);
    instruction.flags.wide = true;
    instruction.flags.short = opcode == 0xEB;
    Ok(instruction)
}

/// 9A/EA: offset word, then segment word. Stored as `[segment, offset]`.
fn decode_far_branch(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    let kind = if opcode == 0x9A {
        InstructionType::Call
    } else {
        InstructionType::Jmp
    };
    let offset = reader.next_u16(DecodeStage::FarPointer)?;
    let segment = reader.next_u16(DecodeStage::FarPointer)?;
    let mut instruction = Instruction::with_operands(
        kind,
        true,
        [Operand::Immediate(segment), Operand::Immediate(offset)],
    );
    instruction.flags.intersegment = true;
    Ok(instruction)
}

/// FE /0-1 (byte inc/dec) and FF /0-6.
fn decode_group_ff(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    let wide = is_wide(opcode);
    let modrm = ModRm::read(reader)?;
    let kind = if wide || modrm.reg < 2 {
        GROUP_FF[modrm.reg as usize]
    } else {
        None
    }
    .ok_or_else(|| reader.invalid_sub(opcode, modrm.reg))?;
    let rm = modrm.operand(reader, wide)?;
    let mut instruction = Instruction::with_operands(kind, wide, [rm, Operand::None]);
    instruction.flags.intersegment = modrm.reg == 3 || modrm.reg == 5;
    Ok(instruction)
}

fn decode_group_f6(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    let wide = is_wide(opcode);
    let modrm = ModRm::read(reader)?;
    let kind = GROUP_F6[modrm.reg as usize].ok_or_else(|| reader.invalid_sub(opcode, modrm.reg))?;
    let rm = modrm.operand(reader, wide)?;
    let source = if kind == InstructionType::Test {
        Operand::Immediate(reader.data(wide)?)
    } else {
        Operand::None
    };
    Ok(Instruction::with_operands(kind, wide, [rm, source]))
}

fn decode_push_pop_reg(_reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    let kind = if opcode & 0b1000 != 0 {
        InstructionType::Pop
    } else {
        InstructionType::Push
    };
    let reg = Register::from_reg_field(true, opcode);
    Ok(Instruction::with_operands(
        kind,
        true,
        [Operand::Register(reg), Operand::None],
    ))
}

fn decode_push_pop_segment(
    _reader: &mut ByteReader<'_>,
    opcode: u8,
) -> Result<Instruction, DecodeError> {
    let kind = if opcode & 0b1 != 0 {
        InstructionType::Pop
    } else {
        InstructionType::Push
    };
    let segment = Register::segment(opcode >> 3);
    Ok(Instruction::with_operands(
        kind,
        true,
        [Operand::Register(segment), Operand::None],
    ))
}

fn decode_pop_rm(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    let modrm = ModRm::read(reader)?;
    if modrm.reg != 0 {
        return Err(reader.invalid_sub(opcode, modrm.reg));
    }
    let rm = modrm.operand(reader, true)?;
    Ok(Instruction::with_operands(
        InstructionType::Pop,
        true,
        [rm, Operand::None],
    ))
}

fn decode_xchg_acc(_reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    let mut instruction = Instruction::with_operands(
        InstructionType::Xchg,
        true,
        [
            Operand::Register(Register::Ax),
            Operand::Register(Register::from_reg_field(true, opcode)),
        ],
    );
    instruction.flags.accumulator = true;
    Ok(instruction)
}

/// E4-E7 take an 8-bit port number, EC-EF use DX.
fn decode_in_out(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    let wide = is_wide(opcode);
    let port = if opcode & 0b1000 == 0 {
        Operand::Immediate(reader.data(false)?)
    } else {
        Operand::Register(Register::Dx)
    };
    let acc = Operand::Register(Register::from_reg_field(wide, 0));
    let instruction = if opcode & 0b10 == 0 {
        Instruction::with_operands(InstructionType::In, wide, [acc, port])
    } else {
        Instruction::with_operands(InstructionType::Out, wide, [port, acc])
    };
    Ok(instruction)
}

fn decode_inc_dec_reg(_reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    let kind = if opcode & 0b1000 != 0 {
        InstructionType::Dec
    } else {
        InstructionType::Inc
    };
    Ok(Instruction::with_operands(
        kind,
        true,
        [
            Operand::Register(Register::from_reg_field(true, opcode)),
            Operand::None,
        ],
    ))
}

/// D4/D5 are followed by a fixed 0x0A base byte.
fn decode_ascii_adjust(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    let base = reader.next(DecodeStage::Data)?;
    if base != 0x0A {
        return Err(reader.invalid_sub(opcode, base));
    }
    let kind = if is_wide(opcode) {
        InstructionType::Aad
    } else {
        InstructionType::Aam
    };
    Ok(Instruction::new(kind))
}

/// D0-D3. The V bit selects CL as the count instead of 1.
fn decode_shift(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    let wide = is_wide(opcode);
    let modrm = ModRm::read(reader)?;
    let kind = SHIFTS[modrm.reg as usize].ok_or_else(|| reader.invalid_sub(opcode, modrm.reg))?;
    let rm = modrm.operand(reader, wide)?;
    let count = if opcode & 0b10 != 0 {
        Operand::Register(Register::Cl)
    } else {
        Operand::Immediate(1)
    };
    Ok(Instruction::with_operands(kind, wide, [rm, count]))
}

fn decode_string(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    let kind = STRINGS[((opcode >> 1) & 0b111) as usize].ok_or_else(|| reader.unknown(opcode))?;
    let mut instruction = Instruction::new(kind);
    instruction.flags.wide = is_wide(opcode);
    Ok(instruction)
}

/// C2/C3 near, CA/CB far; the even opcodes carry a stack adjustment.
fn decode_ret(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    let mut instruction = Instruction::new(InstructionType::Ret);
    instruction.flags.intersegment = opcode & 0b1000 != 0;
    if opcode & 0b1 == 0 {
        instruction.operands[0] = Operand::Immediate(reader.data(true)?);
    }
    Ok(instruction)
}

fn decode_int(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    if opcode == 0xCC {
        return Ok(Instruction::new(InstructionType::Int3));
    }
    let vector = reader.data(false)?;
    Ok(Instruction::with_operands(
        InstructionType::Int,
        false,
        [Operand::Immediate(vector), Operand::None],
    ))
}

fn decode_processor_control(
    reader: &mut ByteReader<'_>,
    opcode: u8,
) -> Result<Instruction, DecodeError> {
    PROCESSOR_CONTROL[(opcode & 0b111) as usize]
        .map(Instruction::new)
        .ok_or_else(|| reader.unknown(opcode))
}

fn decode_single(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    SINGLE_BYTE
        .iter()
        .find(|(byte, _)| *byte == opcode)
        .map(|(_, kind)| Instruction::new(*kind))
        .ok_or_else(|| reader.unknown(opcode))
}

/// D8-DF. The six-bit escape code is `reg` (high) and the opcode's low bits.
fn decode_esc(reader: &mut ByteReader<'_>, opcode: u8) -> Result<Instruction, DecodeError> {
    let modrm = ModRm::read(reader)?;
    let code = (modrm.reg << 3) | (opcode & 0b111);
    let rm = modrm.operand(reader, true)?;
    Ok(Instruction::with_operands(
        InstructionType::Esc,
        true,
        [Operand::Immediate(code as u16), rm],
    ))
}
