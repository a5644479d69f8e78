//! Decoded 8086 instruction model
//!
//! Plain value types produced by the decoder and consumed by the engine, the
//! cycle estimator and the disassembly printer. Nothing here owns resources.
//!
//! `Display` on [`Instruction`] renders NASM-compatible assembly, so a
//! listing printed from these values reassembles to the original bytes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Register identities: eight 16-bit general registers, their 8-bit halves
/// and the four segment registers.
///
/// Declaration order matches the 3-bit `reg` encoding (word registers, then
/// low bytes, then high bytes, then segments).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Register {
    Ax,
    Cx,
    Dx,
    Bx,
    Sp,
    Bp,
    Si,
    Di,
    Al,
    Cl,
    Dl,
    Bl,
    Ah,
    Ch,
    Dh,
    Bh,
    Es,
    Cs,
    Ss,
    Ds,
}

/// Where a register lives in the engine's storage.
///
/// The index is into the 8-entry general bank (`Word`, `Low`, `High`) or the
/// 4-entry segment bank (`Segment`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterSlot {
    Word(usize),
    Low(usize),
    High(usize),
    Segment(usize),
}

impl Register {
    /// Word registers in `reg`-field order.
    pub const GENERAL: [Register; 8] = [
        Register::Ax,
        Register::Cx,
        Register::Dx,
        Register::Bx,
        Register::Sp,
        Register::Bp,
        Register::Si,
        Register::Di,
    ];

    /// Byte registers in `reg`-field order (AL, CL, DL, BL, AH, CH, DH, BH).
    pub const BYTE: [Register; 8] = [
        Register::Al,
        Register::Cl,
        Register::Dl,
        Register::Bl,
        Register::Ah,
        Register::Ch,
        Register::Dh,
        Register::Bh,
    ];

    /// Segment registers in `sreg`-field order.
    pub const SEGMENTS: [Register; 4] = [Register::Es, Register::Cs, Register::Ss, Register::Ds];

    /// Map a 3-bit `reg`/`rm` field to a register, honouring the W bit.
    #[inline]
    pub fn from_reg_field(wide: bool, reg: u8) -> Register {
        let index = (reg & 0b111) as usize;
        if wide {
            Self::GENERAL[index]
        } else {
            Self::BYTE[index]
        }
    }

    /// Map a 2-bit `sreg` field to a segment register.
    #[inline]
    pub fn segment(sreg: u8) -> Register {
        Self::SEGMENTS[(sreg & 0b11) as usize]
    }

    /// Storage location backing this register.
    pub fn slot(self) -> RegisterSlot {
        use Register::*;
        match self {
            Ax => RegisterSlot::Word(0),
            Cx => RegisterSlot::Word(1),
            Dx => RegisterSlot::Word(2),
            Bx => RegisterSlot::Word(3),
            Sp => RegisterSlot::Word(4),
            Bp => RegisterSlot::Word(5),
            Si => RegisterSlot::Word(6),
            Di => RegisterSlot::Word(7),
            Al => RegisterSlot::Low(0),
            Cl => RegisterSlot::Low(1),
            Dl => RegisterSlot::Low(2),
            Bl => RegisterSlot::Low(3),
            Ah => RegisterSlot::High(0),
            Ch => RegisterSlot::High(1),
            Dh => RegisterSlot::High(2),
            Bh => RegisterSlot::High(3),
            Es => RegisterSlot::Segment(0),
            Cs => RegisterSlot::Segment(1),
            Ss => RegisterSlot::Segment(2),
            Ds => RegisterSlot::Segment(3),
        }
    }

    /// True for the 8-bit low/high aliases.
    pub fn is_byte(self) -> bool {
        matches!(self.slot(), RegisterSlot::Low(_) | RegisterSlot::High(_))
    }

    /// True for ES, CS, SS and DS.
    pub fn is_segment(self) -> bool {
        matches!(self.slot(), RegisterSlot::Segment(_))
    }

    /// Assembly name (`"ax"`, `"bh"`, `"ds"`, ...).
    pub fn name(self) -> &'static str {
        use Register::*;
        match self {
            Ax => "ax",
            Cx => "cx",
            Dx => "dx",
            Bx => "bx",
            Sp => "sp",
            Bp => "bp",
            Si => "si",
            Di => "di",
            Al => "al",
            Cl => "cl",
            Dl => "dl",
            Bl => "bl",
            Ah => "ah",
            Ch => "ch",
            Dh => "dh",
            Bh => "bh",
            Es => "es",
            Cs => "cs",
            Ss => "ss",
            Ds => "ds",
        }
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The eight ModRM addressing formulas plus a literal 16-bit address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectiveAddressCalculation {
    BxSi,
    BxDi,
    BpSi,
    BpDi,
    Si,
    Di,
    Bp,
    Bx,
    DirectAccess,
}

impl EffectiveAddressCalculation {
    const FROM_RM: [EffectiveAddressCalculation; 8] = [
        EffectiveAddressCalculation::BxSi,
        EffectiveAddressCalculation::BxDi,
        EffectiveAddressCalculation::BpSi,
        EffectiveAddressCalculation::BpDi,
        EffectiveAddressCalculation::Si,
        EffectiveAddressCalculation::Di,
        EffectiveAddressCalculation::Bp,
        EffectiveAddressCalculation::Bx,
    ];

    /// Formula selected by a 3-bit `rm` field in modes 0-2.
    ///
    /// Mode 0 with `rm == 0b110` is the direct-address form; the decoder
    /// handles that before calling this.
    #[inline]
    pub fn from_rm(rm: u8) -> Self {
        Self::FROM_RM[(rm & 0b111) as usize]
    }

    /// Base and index registers summed by this formula.
    pub fn registers(self) -> (Option<Register>, Option<Register>) {
        use EffectiveAddressCalculation::*;
        match self {
            BxSi => (Some(Register::Bx), Some(Register::Si)),
            BxDi => (Some(Register::Bx), Some(Register::Di)),
            BpSi => (Some(Register::Bp), Some(Register::Si)),
            BpDi => (Some(Register::Bp), Some(Register::Di)),
            Si => (None, Some(Register::Si)),
            Di => (None, Some(Register::Di)),
            Bp => (Some(Register::Bp), None),
            Bx => (Some(Register::Bx), None),
            DirectAccess => (None, None),
        }
    }

    fn text(self) -> &'static str {
        use EffectiveAddressCalculation::*;
        match self {
            BxSi => "bx + si",
            BxDi => "bx + di",
            BpSi => "bp + si",
            BpDi => "bp + di",
            Si => "si",
            Di => "di",
            Bp => "bp",
            Bx => "bx",
            DirectAccess => "",
        }
    }
}

/// Memory operand: addressing formula plus signed displacement.
///
/// Under [`EffectiveAddressCalculation::DirectAccess`] the displacement is
/// the address itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryOperand {
    pub eac: EffectiveAddressCalculation,
    pub displacement: i16,
}

impl MemoryOperand {
    pub fn new(eac: EffectiveAddressCalculation, displacement: i16) -> Self {
        Self { eac, displacement }
    }

    /// Literal 16-bit address with no register contribution.
    pub fn direct(address: u16) -> Self {
        Self {
            eac: EffectiveAddressCalculation::DirectAccess,
            displacement: address as i16,
        }
    }

    pub fn is_direct(&self) -> bool {
        self.eac == EffectiveAddressCalculation::DirectAccess
    }
}

/// One instruction operand slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Operand {
    #[default]
    None,
    Register(Register),
    Memory(MemoryOperand),
    Immediate(u16),
    /// Signed branch offset relative to the address after the instruction.
    IpInc(i16),
}

impl Operand {
    pub fn is_none(&self) -> bool {
        matches!(self, Operand::None)
    }
}

/// Operation performed by an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstructionType {
    // Data transfer
    Mov,
    Push,
    Pop,
    Xchg,
    In,
    Out,
    Xlat,
    Lea,
    Lds,
    Les,
    Lahf,
    Sahf,
    Pushf,
    Popf,

    // Arithmetic
    Add,
    Adc,
    Inc,
    Aaa,
    Daa,
    Sub,
    Sbb,
    Dec,
    Neg,
    Cmp,
    Aas,
    Das,
    Mul,
    Imul,
    Aam,
    Div,
    Idiv,
    Aad,
    Cbw,
    Cwd,

    // Logic, shift and rotate
    Not,
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
    Rcl,
    Rcr,
    And,
    Test,
    Or,
    Xor,

    // String manipulation
    Movs,
    Cmps,
    Scas,
    Lods,
    Stos,

    // Control transfer
    Call,
    Jmp,
    Ret,
    Jo,
    Jno,
    Jb,
    Jnb,
    Je,
    Jnz,
    Jbe,
    Ja,
    Js,
    Jns,
    Jp,
    Jnp,
    Jl,
    Jnl,
    Jle,
    Jg,
    Loopnz,
    Loopz,
    Loop,
    Jcxz,
    Int,
    Int3,
    Into,
    Iret,

    // Processor control
    Clc,
    Cmc,
    Stc,
    Cld,
    Std,
    Cli,
    Sti,
    Hlt,
    Wait,
    Esc,
}

impl InstructionType {
    /// Assembly mnemonic without width suffix or prefixes.
    pub fn name(self) -> &'static str {
        use InstructionType::*;
        match self {
            Mov => "mov",
            Push => "push",
            Pop => "pop",
            Xchg => "xchg",
            In => "in",
            Out => "out",
            Xlat => "xlat",
            Lea => "lea",
            Lds => "lds",
            Les => "les",
            Lahf => "lahf",
            Sahf => "sahf",
            Pushf => "pushf",
            Popf => "popf",
            Add => "add",
            Adc => "adc",
            Inc => "inc",
            Aaa => "aaa",
            Daa => "daa",
            Sub => "sub",
            Sbb => "sbb",
            Dec => "dec",
            Neg => "neg",
            Cmp => "cmp",
            Aas => "aas",
            Das => "das",
            Mul => "mul",
            Imul => "imul",
            Aam => "aam",
            Div => "div",
            Idiv => "idiv",
            Aad => "aad",
            Cbw => "cbw",
            Cwd => "cwd",
            Not => "not",
            Shl => "shl",
            Shr => "shr",
            Sar => "sar",
            Rol => "rol",
            Ror => "ror",
            Rcl => "rcl",
            Rcr => "rcr",
            And => "and",
            Test => "test",
            Or => "or",
            Xor => "xor",
            Movs => "movs",
            Cmps => "cmps",
            Scas => "scas",
            Lods => "lods",
            Stos => "stos",
            Call => "call",
            Jmp => "jmp",
            Ret => "ret",
            Jo => "jo",
            Jno => "jno",
            Jb => "jb",
            Jnb => "jnb",
            Je => "je",
            Jnz => "jnz",
            Jbe => "jbe",
            Ja => "ja",
            Js => "js",
            Jns => "jns",
            Jp => "jp",
            Jnp => "jnp",
            Jl => "jl",
            Jnl => "jnl",
            Jle => "jle",
            Jg => "jg",
            Loopnz => "loopnz",
            Loopz => "loopz",
            Loop => "loop",
            Jcxz => "jcxz",
            Int => "int",
            Int3 => "int3",
            Into => "into",
            Iret => "iret",
            Clc => "clc",
            Cmc => "cmc",
            Stc => "stc",
            Cld => "cld",
            Std => "std",
            Cli => "cli",
            Sti => "sti",
            Hlt => "hlt",
            Wait => "wait",
            Esc => "esc",
        }
    }

    /// 4-bit condition code (0=O ... F=NLE) for the conditional jumps.
    pub fn condition_code(self) -> Option<u8> {
        use InstructionType::*;
        let code = match self {
            Jo => 0x0,
            Jno => 0x1,
            Jb => 0x2,
            Jnb => 0x3,
            Je => 0x4,
            Jnz => 0x5,
            Jbe => 0x6,
            Ja => 0x7,
            Js => 0x8,
            Jns => 0x9,
            Jp => 0xA,
            Jnp => 0xB,
            Jl => 0xC,
            Jnl => 0xD,
            Jle => 0xE,
            Jg => 0xF,
            _ => return None,
        };
        Some(code)
    }

    pub fn is_string(self) -> bool {
        use InstructionType::*;
        matches!(self, Movs | Cmps | Scas | Lods | Stos)
    }

    pub fn is_shift(self) -> bool {
        use InstructionType::*;
        matches!(self, Shl | Shr | Sar | Rol | Ror | Rcl | Rcr)
    }
}

impl fmt::Display for InstructionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-instruction modifier bits gathered from the opcode and its prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct InstructionFlags {
    /// 16-bit operand width (W bit).
    pub wide: bool,
    /// Operand 0 is a relative branch offset.
    pub ip_relative: bool,
    /// REP / REPE prefix seen.
    pub rep: bool,
    /// The repeat prefix was REPNE/REPNZ (0xF2).
    pub rep_nz: bool,
    /// Far call/jump/return.
    pub intersegment: bool,
    /// LOCK prefix seen.
    pub lock: bool,
    /// Short (8-bit displacement) unconditional jump.
    pub short: bool,
    /// Short accumulator encoding (A0-A3, A8/A9, the `op al/ax, imm`
    /// column, 91-97) rather than the general ModRM form.
    pub accumulator: bool,
}

/// A single decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instruction {
    /// Offset of the first byte (including prefixes) in the decoded buffer.
    pub address: u32,
    /// Number of bytes consumed, prefixes included.
    pub size: u32,
    pub kind: InstructionType,
    pub flags: InstructionFlags,
    pub segment_override: Option<Register>,
    pub operands: [Operand; 2],
}

impl Instruction {
    /// Bare instruction of the given type; address and size are filled in by
    /// the decoder once all bytes are consumed.
    pub fn new(kind: InstructionType) -> Self {
        Self {
            address: 0,
            size: 0,
            kind,
            flags: InstructionFlags::default(),
            segment_override: None,
            operands: [Operand::None; 2],
        }
    }

    pub fn with_operands(kind: InstructionType, wide: bool, operands: [Operand; 2]) -> Self {
        let mut instruction = Self::new(kind);
        instruction.flags.wide = wide;
        instruction.operands = operands;
        instruction
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn operand_count(&self) -> usize {
        self.operands.iter().filter(|o| !o.is_none()).count()
    }

    /// First memory operand, if any.
    pub fn memory_operand(&self) -> Option<MemoryOperand> {
        self.operands.iter().find_map(|o| match o {
            Operand::Memory(m) => Some(*m),
            _ => None,
        })
    }

    /// Address of the byte following this instruction.
    pub fn next_address(&self) -> u32 {
        self.address + self.size
    }

    fn write_operand(&self, f: &mut fmt::Formatter<'_>, index: usize) -> fmt::Result {
        let other = self.operands[1 - index];
        match self.operands[index] {
            Operand::None => Ok(()),
            Operand::Register(reg) => f.write_str(reg.name()),
            Operand::Memory(memory) => {
                if self.flags.intersegment {
                    f.write_str("far ")?;
                } else if index == 0
                    && (matches!(other, Operand::None | Operand::Immediate(_))
                        || self.kind.is_shift())
                {
                    f.write_str(if self.flags.wide { "word " } else { "byte " })?;
                }
                if let Some(segment) = self.segment_override {
                    write!(f, "{}:", segment)?;
                }
                if memory.is_direct() {
                    return write!(f, "[{}]", memory.displacement as u16);
                }
                write!(f, "[{}", memory.eac.text())?;
                if memory.displacement != 0 {
                    let sign = if memory.displacement < 0 { '-' } else { '+' };
                    write!(f, " {} {}", sign, memory.displacement.unsigned_abs())?;
                }
                f.write_str("]")
            }
            Operand::Immediate(value) => write!(f, "{}", value),
            // NASM's `$` is the start of the current instruction
            Operand::IpInc(increment) => write!(f, "${:+}", increment as i32 + self.size as i32),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.flags.lock {
            f.write_str("lock ")?;
        }
        if self.flags.rep {
            f.write_str(if self.flags.rep_nz { "repnz " } else { "rep " })?;
        }
        // With no memory operand to carry it, the override prints as a prefix
        if let Some(segment) = self.segment_override {
            if self.memory_operand().is_none() {
                write!(f, "{} ", segment)?;
            }
        }

        f.write_str(self.name())?;
        if self.kind == InstructionType::Ret && self.flags.intersegment {
            f.write_str("f")?;
        }
        if self.kind.is_string() {
            f.write_str(if self.flags.wide { "w" } else { "b" })?;
        }

        // Direct far pointer: segment in slot 0, offset in slot 1
        if self.flags.intersegment {
            if let [Operand::Immediate(segment), Operand::Immediate(offset)] = self.operands {
                return write!(f, " {}:{}", segment, offset);
            }
        }

        if self.operands[0].is_none() {
            return Ok(());
        }
        f.write_str(" ")?;
        if self.kind == InstructionType::Jmp && self.flags.ip_relative {
            f.write_str(if self.flags.short { "short " } else { "near " })?;
        }
        self.write_operand(f, 0)?;
        if !self.operands[1].is_none() {
            f.write_str(", ")?;
            self.write_operand(f, 1)?;
        }
        Ok(())
    }
}
