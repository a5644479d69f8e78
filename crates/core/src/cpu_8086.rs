//! Intel 8086 execution engine
//!
//! Real-mode 8086 over a flat 64 KiB address space. Segment registers are
//! stored, moved, pushed and popped, but addresses are not segmented: every
//! memory operand resolves to a 16-bit offset into the one memory image.
//!
//! A program is copied to `EngineConfig::load_address` and the halt sentinel
//! is written right after it, so falling off the end stops `run()` cleanly.
//! Each step decodes at IP, advances IP past the instruction, then applies
//! its semantics. Instructions that decode but have no semantics here stop
//! the run with [`EngineError::Unimplemented`].

use crate::config::EngineConfig;
use crate::cycles::{self, CycleEstimate};
use crate::decoder::{decode, DecodeError};
use crate::instruction::{
    Instruction, InstructionType, MemoryOperand, Operand, Register, RegisterSlot,
};
use crate::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Size of the emulated address space.
pub const MEMORY_SIZE: usize = 1 << 16;

/// Byte written after the loaded program. 0x0F is POP CS, which no 8086
/// assembler emits for real code.
pub const HALT_SENTINEL: u8 = 0x0F;

// Flag bit positions in FLAGS register
pub const FLAG_CF: u16 = 0x0001; // Carry Flag
pub const FLAG_PF: u16 = 0x0004; // Parity Flag
pub const FLAG_AF: u16 = 0x0010; // Auxiliary Carry Flag
pub const FLAG_ZF: u16 = 0x0040; // Zero Flag
pub const FLAG_SF: u16 = 0x0080; // Sign Flag
pub const FLAG_TF: u16 = 0x0100; // Trap Flag
pub const FLAG_IF: u16 = 0x0200; // Interrupt Enable Flag
pub const FLAG_DF: u16 = 0x0400; // Direction Flag
pub const FLAG_OF: u16 = 0x0800; // Overflow Flag

const FLAGS_MASK: u16 = FLAG_CF
    | FLAG_PF
    | FLAG_AF
    | FLAG_ZF
    | FLAG_SF
    | FLAG_TF
    | FLAG_IF
    | FLAG_DF
    | FLAG_OF;

/// Flags LAHF/SAHF move between AH and FLAGS (SF ZF AF PF CF).
const LAHF_MASK: u16 = FLAG_SF | FLAG_ZF | FLAG_AF | FLAG_PF | FLAG_CF;

const FLAG_LETTERS: [(u16, char); 9] = [
    (FLAG_CF, 'C'),
    (FLAG_PF, 'P'),
    (FLAG_AF, 'A'),
    (FLAG_ZF, 'Z'),
    (FLAG_SF, 'S'),
    (FLAG_OF, 'O'),
    (FLAG_IF, 'I'),
    (FLAG_DF, 'D'),
    (FLAG_TF, 'T'),
];

/// Set flags as letters, in the order C P A Z S O I D T.
pub fn flags_string(flags: u16) -> String {
    FLAG_LETTERS
        .iter()
        .filter(|(mask, _)| flags & mask != 0)
        .map(|(_, letter)| *letter)
        .collect()
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("decode failed at {address:#06x}")]
    Decode {
        address: u16,
        #[source]
        source: DecodeError,
    },
    #[error("{mnemonic} at {address:#06x} is not emulated")]
    Unimplemented {
        address: u16,
        mnemonic: &'static str,
    },
    #[error("{mnemonic} at {address:#06x} has a read-only destination")]
    InvalidDestination {
        address: u16,
        mnemonic: &'static str,
    },
    #[error("step limit of {0} instructions reached")]
    StepLimit(u64),
}

/// Result of executing one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Halt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    Byte,
    Word,
}

impl Width {
    fn of(wide: bool) -> Self {
        if wide {
            Width::Word
        } else {
            Width::Byte
        }
    }

    fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xFF,
            Width::Word => 0xFFFF,
        }
    }

    fn sign_bit(self) -> u16 {
        match self {
            Width::Byte => 0x80,
            Width::Word => 0x8000,
        }
    }

    fn bytes(self) -> u16 {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
        }
    }

    fn accumulator(self) -> Register {
        match self {
            Width::Byte => Register::Al,
            Width::Word => Register::Ax,
        }
    }
}

/// Flat byte-addressable memory covering the whole 16-bit address space.
pub struct FlatMemory {
    data: Vec<u8>,
}

impl FlatMemory {
    pub fn new() -> Self {
        Self {
            data: vec![0; MEMORY_SIZE],
        }
    }

    /// Copy `program` to `addr`, clipped at the end of memory.
    /// Returns the number of bytes copied.
    pub fn load_program(&mut self, addr: u16, program: &[u8]) -> usize {
        let start = addr as usize;
        let len = program.len().min(MEMORY_SIZE - start);
        self.data[start..start + len].copy_from_slice(&program[..len]);
        len
    }

    #[inline]
    pub fn read(&self, addr: u16) -> u8 {
        self.data[addr as usize]
    }

    #[inline]
    pub fn write(&mut self, addr: u16, val: u8) {
        self.data[addr as usize] = val;
    }

    /// Read a 16-bit word (little-endian); the high byte wraps to 0 at the top.
    pub fn read_u16(&self, addr: u16) -> u16 {
        let low = self.read(addr);
        let high = self.read(addr.wrapping_add(1));
        u16::from_le_bytes([low, high])
    }

    /// Write a 16-bit word (little-endian)
    pub fn write_u16(&mut self, addr: u16, val: u16) {
        let [low, high] = val.to_le_bytes();
        self.write(addr, low);
        self.write(addr.wrapping_add(1), high);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Default for FlatMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FlatMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlatMemory")
            .field("len", &self.data.len())
            .finish()
    }
}

/// Register file and flags as stored in a save state. Memory is not included.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CpuSnapshot {
    ax: u16,
    cx: u16,
    dx: u16,
    bx: u16,
    sp: u16,
    bp: u16,
    si: u16,
    di: u16,
    es: u16,
    cs: u16,
    ss: u16,
    ds: u16,
    ip: u16,
    flags: u16,
    cycles: u64,
}

/// Intel 8086 CPU state and execution engine
#[derive(Debug)]
pub struct Cpu8086 {
    /// AX, CX, DX, BX, SP, BP, SI, DI; the byte registers alias the first four
    registers: [u16; 8],
    /// ES, CS, SS, DS
    segments: [u16; 4],

    /// IP register (instruction pointer)
    pub ip: u16,
    /// FLAGS register (status flags)
    pub flags: u16,
    /// Total estimated cycles (only advances with `estimate_cycles`)
    pub cycles: u64,

    pub memory: FlatMemory,

    config: EngineConfig,
    steps: u64,
    last_estimate: Option<CycleEstimate>,
}

impl Cpu8086 {
    /// Create a CPU with the default configuration and `program` loaded.
    pub fn new(program: &[u8]) -> Self {
        Self::with_config(program, EngineConfig::default())
    }

    pub fn with_config(program: &[u8], config: EngineConfig) -> Self {
        let mut cpu = Self {
            registers: [0; 8],
            segments: [0; 4],
            ip: 0,
            flags: 0,
            cycles: 0,
            memory: FlatMemory::new(),
            config,
            steps: 0,
            last_estimate: None,
        };
        cpu.load_program(program);
        cpu
    }

    /// Copy `program` into memory at the load address, append the halt
    /// sentinel and reset registers.
    pub fn load_program(&mut self, program: &[u8]) {
        let start = self.config.load_address;
        let loaded = self.memory.load_program(start, program);
        if loaded < program.len() {
            log(LogCategory::Cpu, LogLevel::Warn, || {
                format!(
                    "program of {} bytes clipped to {} bytes at {:04x}",
                    program.len(),
                    loaded,
                    start
                )
            });
        }
        let end = start as usize + loaded;
        if end < MEMORY_SIZE {
            self.memory.write(end as u16, HALT_SENTINEL);
        }
        self.reset();
    }

    /// Reset registers, flags and counters. Memory is left untouched.
    pub fn reset(&mut self) {
        self.registers = [0; 8];
        self.segments = [0; 4];
        self.set(Register::Sp, self.config.initial_sp);
        self.ip = self.config.load_address;
        self.flags = 0;
        self.cycles = 0;
        self.steps = 0;
        self.last_estimate = None;
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of instructions executed since the last reset.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Estimate for the most recent instruction, when estimation is enabled.
    pub fn last_cycle_estimate(&self) -> Option<CycleEstimate> {
        self.last_estimate
    }

    /// The full memory image.
    pub fn memory_image(&self) -> &[u8] {
        self.memory.as_slice()
    }

    /// Read a register. Byte registers return their byte zero-extended.
    pub fn get(&self, reg: Register) -> u16 {
        match reg.slot() {
            RegisterSlot::Word(i) => self.registers[i],
            RegisterSlot::Low(i) => self.registers[i] & 0x00FF,
            RegisterSlot::High(i) => self.registers[i] >> 8,
            RegisterSlot::Segment(i) => self.segments[i],
        }
    }

    /// Read a register as a signed value of its own width.
    pub fn get_signed(&self, reg: Register) -> i16 {
        if reg.is_byte() {
            self.get(reg) as u8 as i8 as i16
        } else {
            self.get(reg) as i16
        }
    }

    /// Write a register. Byte registers take the low byte of `value` and
    /// leave the other half of their word untouched.
    pub fn set(&mut self, reg: Register, value: u16) {
        match reg.slot() {
            RegisterSlot::Word(i) => self.registers[i] = value,
            RegisterSlot::Low(i) => self.registers[i] = (self.registers[i] & 0xFF00) | (value & 0x00FF),
            RegisterSlot::High(i) => {
                self.registers[i] = (self.registers[i] & 0x00FF) | ((value & 0x00FF) << 8)
            }
            RegisterSlot::Segment(i) => self.segments[i] = value,
        }
    }

    #[inline]
    pub fn get_flag(&self, flag: u16) -> bool {
        (self.flags & flag) != 0
    }

    #[inline]
    fn set_flag(&mut self, flag: u16, value: bool) {
        if value {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    /// Sum of the formula's registers and the displacement, modulo 64 KiB.
    pub fn effective_address(&self, memory: &MemoryOperand) -> u16 {
        let (base, index) = memory.eac.registers();
        [base, index]
            .into_iter()
            .flatten()
            .fold(memory.displacement as u16, |address, reg| {
                address.wrapping_add(self.get(reg))
            })
    }

    fn read_memory(&self, address: u16, width: Width) -> u16 {
        match width {
            Width::Byte => self.memory.read(address) as u16,
            Width::Word => self.memory.read_u16(address),
        }
    }

    fn write_memory(&mut self, address: u16, width: Width, value: u16) {
        match width {
            Width::Byte => self.memory.write(address, value as u8),
            Width::Word => self.memory.write_u16(address, value),
        }
    }

    fn read_operand(&self, operand: Operand, width: Width) -> u16 {
        match operand {
            Operand::Register(reg) => self.get(reg),
            Operand::Memory(memory) => self.read_memory(self.effective_address(&memory), width),
            Operand::Immediate(value) => value & width.mask() as u16,
            Operand::IpInc(increment) => increment as u16,
            Operand::None => 0,
        }
    }

    fn write_operand(
        &mut self,
        instruction: &Instruction,
        operand: Operand,
        value: u16,
    ) -> Result<(), EngineError> {
        match operand {
            Operand::Register(reg) => self.set(reg, value),
            Operand::Memory(memory) => {
                let address = self.effective_address(&memory);
                self.write_memory(address, Width::of(instruction.flags.wide), value);
            }
            _ => {
                return Err(EngineError::InvalidDestination {
                    address: instruction.address as u16,
                    mnemonic: instruction.name(),
                })
            }
        }
        Ok(())
    }

    /// Push a word onto the stack
    #[inline]
    fn push(&mut self, val: u16) {
        let sp = self.get(Register::Sp).wrapping_sub(2);
        self.set(Register::Sp, sp);
        self.memory.write_u16(sp, val);
    }

    /// Pop a word from the stack
    #[inline]
    fn pop(&mut self) -> u16 {
        let sp = self.get(Register::Sp);
        let val = self.memory.read_u16(sp);
        self.set(Register::Sp, sp.wrapping_add(2));
        val
    }

    /// Check condition code for conditional jumps
    /// Condition codes: 0=O, 1=NO, 2=B/C, 3=NB/NC, 4=E/Z, 5=NE/NZ, 6=BE, 7=NBE,
    ///                  8=S, 9=NS, A=P, B=NP, C=L, D=NL, E=LE, F=NLE
    fn check_condition(&self, condition: u8) -> bool {
        match condition {
            0x0 => self.get_flag(FLAG_OF),
            0x1 => !self.get_flag(FLAG_OF),
            0x2 => self.get_flag(FLAG_CF),
            0x3 => !self.get_flag(FLAG_CF),
            0x4 => self.get_flag(FLAG_ZF),
            0x5 => !self.get_flag(FLAG_ZF),
            0x6 => self.get_flag(FLAG_CF) || self.get_flag(FLAG_ZF),
            0x7 => !self.get_flag(FLAG_CF) && !self.get_flag(FLAG_ZF),
            0x8 => self.get_flag(FLAG_SF),
            0x9 => !self.get_flag(FLAG_SF),
            0xA => self.get_flag(FLAG_PF),
            0xB => !self.get_flag(FLAG_PF),
            0xC => self.get_flag(FLAG_SF) != self.get_flag(FLAG_OF),
            0xD => self.get_flag(FLAG_SF) == self.get_flag(FLAG_OF),
            0xE => self.get_flag(FLAG_ZF) || (self.get_flag(FLAG_SF) != self.get_flag(FLAG_OF)),
            0xF => !self.get_flag(FLAG_ZF) && (self.get_flag(FLAG_SF) == self.get_flag(FLAG_OF)),
            _ => false,
        }
    }

    /// Calculate parity (true if even number of 1 bits in low byte)
    #[inline]
    fn calc_parity(val: u8) -> bool {
        val.count_ones().is_multiple_of(2)
    }

    /// ZF, SF and PF for a result of the given width
    fn update_flags(&mut self, result: u16, width: Width) {
        self.set_flag(FLAG_ZF, result == 0);
        self.set_flag(FLAG_SF, (result & width.sign_bit()) != 0);
        self.set_flag(FLAG_PF, Self::calc_parity(result as u8));
    }

    /// Flags after a full add or subtract. `wide_result` is the untruncated
    /// 32-bit result; returns it truncated to `width`.
    fn set_arith_flags(
        &mut self,
        a: u16,
        b: u16,
        carry_in: u32,
        wide_result: u32,
        is_sub: bool,
        width: Width,
    ) -> u16 {
        let result = (wide_result & width.mask()) as u16;
        let sign = width.sign_bit();
        let a_negative = (a & sign) != 0;
        // Subtraction adds the negated subtrahend
        let b_negative = ((b & sign) != 0) != is_sub;
        let result_negative = (result & sign) != 0;
        let (a_low, b_low) = ((a & 0xF) as u32, (b & 0xF) as u32);
        let auxiliary = if is_sub {
            a_low < b_low + carry_in
        } else {
            a_low + b_low + carry_in > 0xF
        };

        self.set_flag(FLAG_CF, wide_result > width.mask());
        self.set_flag(FLAG_AF, auxiliary);
        self.set_flag(
            FLAG_OF,
            a_negative == b_negative && result_negative != a_negative,
        );
        self.update_flags(result, width);
        result
    }

    fn arithmetic(&mut self, kind: InstructionType, a: u16, b: u16, width: Width) -> u16 {
        let is_sub = matches!(
            kind,
            InstructionType::Sub | InstructionType::Sbb | InstructionType::Cmp
        );
        let carry_in = u32::from(
            matches!(kind, InstructionType::Adc | InstructionType::Sbb) && self.get_flag(FLAG_CF),
        );
        let a32 = a as u32 & width.mask();
        let b32 = b as u32 & width.mask();
        let wide_result = if is_sub {
            a32.wrapping_sub(b32).wrapping_sub(carry_in)
        } else {
            a32 + b32 + carry_in
        };
        self.set_arith_flags(a32 as u16, b32 as u16, carry_in, wide_result, is_sub, width)
    }

    /// AND, OR, XOR and TEST clear CF, OF and AF
    fn set_logic_flags(&mut self, result: u16, width: Width) {
        self.set_flag(FLAG_CF, false);
        self.set_flag(FLAG_OF, false);
        self.set_flag(FLAG_AF, false);
        self.update_flags(result, width);
    }

    /// Shift/rotate `val` by `count`. OF is only defined for a count of 1.
    fn shift_rotate(&mut self, kind: InstructionType, val: u16, count: u8, width: Width) -> u16 {
        if count == 0 {
            return val;
        }

        let msb = width.sign_bit();
        let mask = width.mask() as u16;
        let mut result = val & mask;

        match kind {
            InstructionType::Rol => {
                for _ in 0..count {
                    let carry_out = (result & msb) != 0;
                    result = ((result << 1) | carry_out as u16) & mask;
                    self.set_flag(FLAG_CF, carry_out);
                }
                if count == 1 {
                    self.set_flag(FLAG_OF, ((result & msb) != 0) != self.get_flag(FLAG_CF));
                }
            }
            InstructionType::Ror => {
                for _ in 0..count {
                    let carry_out = (result & 1) != 0;
                    result = (result >> 1) | if carry_out { msb } else { 0 };
                    self.set_flag(FLAG_CF, carry_out);
                }
                if count == 1 {
                    let top = (result & msb) != 0;
                    let next = (result & (msb >> 1)) != 0;
                    self.set_flag(FLAG_OF, top != next);
                }
            }
            InstructionType::Rcl => {
                for _ in 0..count {
                    let old_cf = self.get_flag(FLAG_CF) as u16;
                    let carry_out = (result & msb) != 0;
                    result = ((result << 1) | old_cf) & mask;
                    self.set_flag(FLAG_CF, carry_out);
                }
                if count == 1 {
                    self.set_flag(FLAG_OF, ((result & msb) != 0) != self.get_flag(FLAG_CF));
                }
            }
            InstructionType::Rcr => {
                for _ in 0..count {
                    let old_cf = if self.get_flag(FLAG_CF) { msb } else { 0 };
                    let carry_out = (result & 1) != 0;
                    result = (result >> 1) | old_cf;
                    self.set_flag(FLAG_CF, carry_out);
                }
                if count == 1 {
                    let top = (result & msb) != 0;
                    let next = (result & (msb >> 1)) != 0;
                    self.set_flag(FLAG_OF, top != next);
                }
            }
            InstructionType::Shl => {
                for _ in 0..count {
                    let carry_out = (result & msb) != 0;
                    result = (result << 1) & mask;
                    self.set_flag(FLAG_CF, carry_out);
                }
                self.update_flags(result, width);
                if count == 1 {
                    self.set_flag(FLAG_OF, ((result & msb) != 0) != self.get_flag(FLAG_CF));
                }
            }
            InstructionType::Shr => {
                if count == 1 {
                    self.set_flag(FLAG_OF, (val & msb) != 0);
                }
                for _ in 0..count {
                    let carry_out = (result & 1) != 0;
                    result >>= 1;
                    self.set_flag(FLAG_CF, carry_out);
                }
                self.update_flags(result, width);
            }
            InstructionType::Sar => {
                let sign_bit = val & msb;
                if count == 1 {
                    self.set_flag(FLAG_OF, false);
                }
                for _ in 0..count {
                    let carry_out = (result & 1) != 0;
                    result = (result >> 1) | sign_bit;
                    self.set_flag(FLAG_CF, carry_out);
                }
                self.update_flags(result, width);
            }
            _ => {}
        }

        result
    }

    fn advance_index(&mut self, reg: Register, width: Width) {
        let value = self.get(reg);
        let next = if self.get_flag(FLAG_DF) {
            value.wrapping_sub(width.bytes())
        } else {
            value.wrapping_add(width.bytes())
        };
        self.set(reg, next);
    }

    /// MOVS, STOS, LODS, CMPS and SCAS, repeated CX times under REP.
    /// REP on CMPS/SCAS also stops when ZF disagrees with the prefix.
    fn string_instruction(&mut self, instruction: &Instruction, width: Width) {
        let repeat = instruction.flags.rep;
        if repeat && self.get(Register::Cx) == 0 {
            return;
        }
        let compares = matches!(
            instruction.kind,
            InstructionType::Cmps | InstructionType::Scas
        );

        loop {
            match instruction.kind {
                InstructionType::Movs => {
                    let value = self.read_memory(self.get(Register::Si), width);
                    self.write_memory(self.get(Register::Di), width, value);
                    self.advance_index(Register::Si, width);
                    self.advance_index(Register::Di, width);
                }
                InstructionType::Stos => {
                    let value = self.get(width.accumulator());
                    self.write_memory(self.get(Register::Di), width, value);
                    self.advance_index(Register::Di, width);
                }
                InstructionType::Lods => {
                    let value = self.read_memory(self.get(Register::Si), width);
                    self.set(width.accumulator(), value);
                    self.advance_index(Register::Si, width);
                }
                InstructionType::Cmps => {
                    let a = self.read_memory(self.get(Register::Si), width);
                    let b = self.read_memory(self.get(Register::Di), width);
                    self.arithmetic(InstructionType::Cmp, a, b, width);
                    self.advance_index(Register::Si, width);
                    self.advance_index(Register::Di, width);
                }
                InstructionType::Scas => {
                    let a = self.get(width.accumulator());
                    let b = self.read_memory(self.get(Register::Di), width);
                    self.arithmetic(InstructionType::Cmp, a, b, width);
                    self.advance_index(Register::Di, width);
                }
                _ => {}
            }

            if !repeat {
                break;
            }
            let cx = self.get(Register::Cx).wrapping_sub(1);
            self.set(Register::Cx, cx);
            if cx == 0 || (compares && self.get_flag(FLAG_ZF) == instruction.flags.rep_nz) {
                break;
            }
        }
    }

    /// Target of a JMP/CALL as (new CS, new IP). IP-relative targets use the
    /// already advanced IP.
    fn branch_target(&self, instruction: &Instruction) -> Result<(Option<u16>, u16), EngineError> {
        let intersegment = instruction.flags.intersegment;
        match instruction.operands {
            [Operand::Immediate(segment), Operand::Immediate(offset)] if intersegment => {
                Ok((Some(segment), offset))
            }
            [Operand::IpInc(increment), _] => Ok((None, self.ip.wrapping_add(increment as u16))),
            [Operand::Memory(memory), _] if intersegment => {
                let address = self.effective_address(&memory);
                let offset = self.memory.read_u16(address);
                let segment = self.memory.read_u16(address.wrapping_add(2));
                Ok((Some(segment), offset))
            }
            [operand @ (Operand::Register(_) | Operand::Memory(_)), _] if !intersegment => {
                Ok((None, self.read_operand(operand, Width::Word)))
            }
            _ => Err(self.unimplemented(instruction)),
        }
    }

    fn jump_relative(&mut self, increment: Operand) {
        if let Operand::IpInc(increment) = increment {
            self.ip = self.ip.wrapping_add(increment as u16);
        }
    }

    fn unimplemented(&self, instruction: &Instruction) -> EngineError {
        log(LogCategory::Stubs, LogLevel::Warn, || {
            format!(
                "unimplemented instruction at {:04x}: {}",
                instruction.address, instruction
            )
        });
        EngineError::Unimplemented {
            address: instruction.address as u16,
            mnemonic: instruction.name(),
        }
    }

    /// Apply one decoded instruction.
    ///
    /// IP is advanced past the instruction first; jumps, calls and returns
    /// then overwrite it.
    pub fn execute(&mut self, instruction: &Instruction) -> Result<StepOutcome, EngineError> {
        use InstructionType::*;

        self.ip = self.ip.wrapping_add(instruction.size as u16);
        let width = Width::of(instruction.flags.wide);
        let [dst, src] = instruction.operands;

        match instruction.kind {
            Mov => {
                let value = self.read_operand(src, width);
                self.write_operand(instruction, dst, value)?;
            }
            Add | Adc | Sub | Sbb | Cmp => {
                let a = self.read_operand(dst, width);
                let b = self.read_operand(src, width);
                let result = self.arithmetic(instruction.kind, a, b, width);
                if instruction.kind != Cmp {
                    self.write_operand(instruction, dst, result)?;
                }
            }
            And | Or | Xor | Test => {
                let a = self.read_operand(dst, width);
                let b = self.read_operand(src, width);
                let result = match instruction.kind {
                    Or => a | b,
                    Xor => a ^ b,
                    _ => a & b,
                };
                self.set_logic_flags(result, width);
                if instruction.kind != Test {
                    self.write_operand(instruction, dst, result)?;
                }
            }
            Inc | Dec => {
                let a = self.read_operand(dst, width);
                let carry = self.get_flag(FLAG_CF);
                let op = if instruction.kind == Inc { Add } else { Sub };
                let result = self.arithmetic(op, a, 1, width);
                self.set_flag(FLAG_CF, carry);
                self.write_operand(instruction, dst, result)?;
            }
            Neg => {
                let a = self.read_operand(dst, width);
                let result = self.arithmetic(Sub, 0, a, width);
                self.write_operand(instruction, dst, result)?;
            }
            Not => {
                let a = self.read_operand(dst, width);
                self.write_operand(instruction, dst, !a & width.mask() as u16)?;
            }
            Xchg => {
                let a = self.read_operand(dst, width);
                let b = self.read_operand(src, width);
                self.write_operand(instruction, dst, b)?;
                self.write_operand(instruction, src, a)?;
            }
            Lea => match src {
                Operand::Memory(memory) => {
                    let address = self.effective_address(&memory);
                    self.write_operand(instruction, dst, address)?;
                }
                _ => return Err(self.unimplemented(instruction)),
            },
            Xlat => {
                let address = self.get(Register::Bx).wrapping_add(self.get(Register::Al));
                let value = self.memory.read(address);
                self.set(Register::Al, value as u16);
            }
            // The 8086 stores SP after the decrement
            Push if dst == Operand::Register(Register::Sp) => {
                let sp = self.get(Register::Sp).wrapping_sub(2);
                self.push(sp);
            }
            Push => {
                let value = self.read_operand(dst, Width::Word);
                self.push(value);
            }
            Pop => {
                let value = self.pop();
                self.write_operand(instruction, dst, value)?;
            }
            Pushf => self.push(self.flags),
            Popf => self.flags = self.pop() & FLAGS_MASK,
            Lahf => self.set(Register::Ah, (self.flags & LAHF_MASK) | 0x02),
            Sahf => {
                let ah = self.get(Register::Ah);
                self.flags = (self.flags & !LAHF_MASK) | (ah & LAHF_MASK);
            }
            Cbw => {
                let al = self.get_signed(Register::Al);
                self.set(Register::Ax, al as u16);
            }
            Cwd => {
                let high = if self.get(Register::Ax) & 0x8000 != 0 { 0xFFFF } else { 0 };
                self.set(Register::Dx, high);
            }
            Clc => self.set_flag(FLAG_CF, false),
            Stc => self.set_flag(FLAG_CF, true),
            Cmc => self.set_flag(FLAG_CF, !self.get_flag(FLAG_CF)),
            Cld => self.set_flag(FLAG_DF, false),
            Std => self.set_flag(FLAG_DF, true),
            Cli => self.set_flag(FLAG_IF, false),
            Sti => self.set_flag(FLAG_IF, true),
            Jo | Jno | Jb | Jnb | Je | Jnz | Jbe | Ja | Js | Jns | Jp | Jnp | Jl | Jnl | Jle
            | Jg => {
                let taken = instruction
                    .kind
                    .condition_code()
                    .is_some_and(|code| self.check_condition(code));
                if taken {
                    self.jump_relative(dst);
                }
            }
            Loop | Loopz | Loopnz => {
                let cx = self.get(Register::Cx).wrapping_sub(1);
                self.set(Register::Cx, cx);
                let zf = self.get_flag(FLAG_ZF);
                let taken = cx != 0
                    && match instruction.kind {
                        Loopz => zf,
                        Loopnz => !zf,
                        _ => true,
                    };
                if taken {
                    self.jump_relative(dst);
                }
            }
            Jcxz => {
                if self.get(Register::Cx) == 0 {
                    self.jump_relative(dst);
                }
            }
            Jmp => {
                let (segment, offset) = self.branch_target(instruction)?;
                if let Some(segment) = segment {
                    self.set(Register::Cs, segment);
                }
                self.ip = offset;
            }
            Call => {
                let (segment, offset) = self.branch_target(instruction)?;
                if let Some(segment) = segment {
                    self.push(self.get(Register::Cs));
                    self.set(Register::Cs, segment);
                }
                self.push(self.ip);
                self.ip = offset;
            }
            Ret => {
                let offset = self.pop();
                if instruction.flags.intersegment {
                    let segment = self.pop();
                    self.set(Register::Cs, segment);
                }
                if let Operand::Immediate(adjust) = dst {
                    let sp = self.get(Register::Sp).wrapping_add(adjust);
                    self.set(Register::Sp, sp);
                }
                self.ip = offset;
            }
            Shl | Shr | Sar | Rol | Ror | Rcl | Rcr => {
                let value = self.read_operand(dst, width);
                let count = self.read_operand(src, Width::Byte) as u8;
                let result = self.shift_rotate(instruction.kind, value, count, width);
                self.write_operand(instruction, dst, result)?;
            }
            Movs | Cmps | Scas | Lods | Stos => self.string_instruction(instruction, width),
            Hlt => return Ok(StepOutcome::Halt),
            _ => return Err(self.unimplemented(instruction)),
        }

        Ok(StepOutcome::Continue)
    }

    fn account_cycles(&mut self, instruction: &Instruction) {
        let address = instruction
            .memory_operand()
            .map(|memory| self.effective_address(&memory));
        self.last_estimate = cycles::estimate(instruction, address);
        if let Some(estimate) = self.last_estimate {
            self.cycles += u64::from(estimate.total());
            let total = self.cycles;
            log(LogCategory::Cycles, LogLevel::Debug, || {
                format!("{} ; Clocks: +{} = {}", instruction, estimate, total)
            });
        }
    }

    /// Decode and execute the instruction at IP.
    ///
    /// Reaching the halt sentinel returns `Halt` without executing anything.
    pub fn step(&mut self) -> Result<StepOutcome, EngineError> {
        let address = self.ip;
        if self.memory.read(address) == HALT_SENTINEL {
            log(LogCategory::Cpu, LogLevel::Debug, || {
                format!("halt sentinel reached at {:04x}", address)
            });
            return Ok(StepOutcome::Halt);
        }

        let instruction = decode(self.memory.as_slice(), address as u32).map_err(|source| {
            log(LogCategory::Decode, LogLevel::Error, || {
                format!("decode failed at {:04x}: {}", address, source)
            });
            EngineError::Decode { address, source }
        })?;

        log(LogCategory::Cpu, LogLevel::Trace, || {
            format!("{:04x}: {}", address, instruction)
        });

        if self.config.estimate_cycles {
            self.account_cycles(&instruction);
        }

        let outcome = self.execute(&instruction)?;
        self.steps += 1;
        Ok(outcome)
    }

    /// Run until HLT or the halt sentinel.
    pub fn run(&mut self) -> Result<(), EngineError> {
        loop {
            if self.step()? == StepOutcome::Halt {
                log(LogCategory::Cpu, LogLevel::Info, || {
                    format!("halted at {:04x} after {} instructions", self.ip, self.steps)
                });
                return Ok(());
            }
            if let Some(limit) = self.config.step_limit {
                if self.steps >= limit {
                    return Err(EngineError::StepLimit(limit));
                }
            }
        }
    }

    /// Registers, IP, flags and cycle count as JSON. Memory is not included.
    pub fn save_state(&self) -> Value {
        let snapshot = CpuSnapshot {
            ax: self.get(Register::Ax),
            cx: self.get(Register::Cx),
            dx: self.get(Register::Dx),
            bx: self.get(Register::Bx),
            sp: self.get(Register::Sp),
            bp: self.get(Register::Bp),
            si: self.get(Register::Si),
            di: self.get(Register::Di),
            es: self.get(Register::Es),
            cs: self.get(Register::Cs),
            ss: self.get(Register::Ss),
            ds: self.get(Register::Ds),
            ip: self.ip,
            flags: self.flags,
            cycles: self.cycles,
        };
        serde_json::to_value(snapshot).unwrap_or_default()
    }

    /// Restore a state produced by [`Cpu8086::save_state`].
    pub fn load_state(&mut self, v: &Value) -> Result<(), serde_json::Error> {
        let snapshot: CpuSnapshot = serde_json::from_value(v.clone())?;
        self.registers = [
            snapshot.ax,
            snapshot.cx,
            snapshot.dx,
            snapshot.bx,
            snapshot.sp,
            snapshot.bp,
            snapshot.si,
            snapshot.di,
        ];
        self.segments = [snapshot.es, snapshot.cs, snapshot.ss, snapshot.ds];
        self.ip = snapshot.ip;
        self.flags = snapshot.flags & FLAGS_MASK;
        self.cycles = snapshot.cycles;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
