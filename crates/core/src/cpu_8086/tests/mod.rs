//! Engine tests
//!
//! Lifecycle, loading, register access, error reporting and cycle
//! accounting live here; instruction semantics are split by concern into the
//! sibling files.

mod tests_jumps;

use super::*;
use crate::decoder::DecodeError;
use crate::instruction::EffectiveAddressCalculation;
use serde_json::json;

/// Load `program`, let `setup` adjust state, then run to completion.
fn run_with(program: &[u8], setup: impl FnOnce(&mut Cpu8086)) -> Cpu8086 {
    let mut cpu = Cpu8086::new(program);
    setup(&mut cpu);
    if let Err(e) = cpu.run() {
        panic!("program {:02X?} failed: {}", program, e);
    }
    cpu
}

fn run_program(program: &[u8]) -> Cpu8086 {
    run_with(program, |_| {})
}

#[test]
fn test_cpu_initialization() {
    let cpu = Cpu8086::new(&[]);

    for reg in Register::GENERAL {
        let expected = if reg == Register::Sp { 0xFFFF } else { 0 };
        assert_eq!(cpu.get(reg), expected, "{} after init", reg);
    }
    for reg in Register::SEGMENTS {
        assert_eq!(cpu.get(reg), 0);
    }
    assert_eq!(cpu.ip, 0);
    assert_eq!(cpu.flags, 0);
    assert_eq!(cpu.memory.read(0), HALT_SENTINEL);
    assert_eq!(cpu.memory_image().len(), MEMORY_SIZE);
}

#[test]
fn test_mov_immediate_to_accumulator() {
    let mut cpu = Cpu8086::new(&[0xB8, 0x05, 0x00]);

    assert_eq!(cpu.step().unwrap(), StepOutcome::Continue);
    assert_eq!(cpu.get(Register::Ax), 5);
    assert_eq!(cpu.ip, 3);
    assert_eq!(cpu.flags, 0, "MOV must not touch flags");

    // Next byte is the sentinel
    assert_eq!(cpu.step().unwrap(), StepOutcome::Halt);
    assert_eq!(cpu.ip, 3);
}

#[test]
fn test_run_stops_at_sentinel() {
    // mov ax, 5 ; mov bx, ax
    let cpu = run_program(&[0xB8, 0x05, 0x00, 0x89, 0xC3]);
    assert_eq!(cpu.get(Register::Bx), 5);
    assert_eq!(cpu.ip, 5);
    assert_eq!(cpu.steps(), 2);
}

#[test]
fn test_hlt_stops_before_remaining_code() {
    // hlt ; mov ax, 5
    let cpu = run_program(&[0xF4, 0xB8, 0x05, 0x00]);
    assert_eq!(cpu.get(Register::Ax), 0);
    assert_eq!(cpu.ip, 1);
}

#[test]
fn test_register_aliasing() {
    let mut cpu = Cpu8086::new(&[]);

    cpu.set(Register::Ax, 0x1234);
    assert_eq!(cpu.get(Register::Al), 0x34);
    assert_eq!(cpu.get(Register::Ah), 0x12);

    cpu.set(Register::Al, 0xFF);
    assert_eq!(cpu.get(Register::Ax), 0x12FF);
    cpu.set(Register::Ah, 0xAB);
    assert_eq!(cpu.get(Register::Ax), 0xABFF);

    // Only the low byte of the value lands in a byte register
    cpu.set(Register::Bh, 0x1C7);
    assert_eq!(cpu.get(Register::Bx), 0xC700);

    cpu.set(Register::Ds, 0x5555);
    assert_eq!(cpu.get(Register::Dx), 0);
    assert_eq!(cpu.get(Register::Ds), 0x5555);
}

#[test]
fn test_get_signed() {
    let mut cpu = Cpu8086::new(&[]);
    cpu.set(Register::Cx, 0xFF80);
    assert_eq!(cpu.get_signed(Register::Cl), -128);
    assert_eq!(cpu.get_signed(Register::Ch), -1);
    assert_eq!(cpu.get_signed(Register::Cx), -128);
}

#[test]
fn test_byte_write_keeps_sibling_byte() {
    // mov al, 0x7F ; mov dh, al
    let cpu = run_with(&[0xB0, 0x7F, 0x88, 0xC6], |cpu| {
        cpu.set(Register::Ax, 0x1234);
        cpu.set(Register::Dx, 0x00AA);
    });
    assert_eq!(cpu.get(Register::Ax), 0x127F);
    assert_eq!(cpu.get(Register::Dx), 0x7FAA);
}

#[test]
fn test_effective_address() {
    let mut cpu = Cpu8086::new(&[]);
    cpu.set(Register::Bx, 0x1000);
    cpu.set(Register::Si, 0x0020);
    cpu.set(Register::Bp, 0xFFFF);
    cpu.set(Register::Di, 0x0002);

    let bx_si = MemoryOperand::new(EffectiveAddressCalculation::BxSi, -0x10);
    assert_eq!(cpu.effective_address(&bx_si), 0x1010);

    let direct = MemoryOperand::direct(0x4321);
    assert_eq!(cpu.effective_address(&direct), 0x4321);

    // Wraps at 64 KiB
    let bp_di = MemoryOperand::new(EffectiveAddressCalculation::BpDi, 0);
    assert_eq!(cpu.effective_address(&bp_di), 0x0001);
}

#[test]
fn test_memory_store_and_load() {
    // mov [bx + 2], ax ; mov cx, [bx + 2]
    let cpu = run_with(&[0x89, 0x47, 0x02, 0x8B, 0x4F, 0x02], |cpu| {
        cpu.set(Register::Bx, 0x100);
        cpu.set(Register::Ax, 0xBEEF);
    });
    assert_eq!(cpu.memory.read(0x102), 0xEF, "little-endian low byte");
    assert_eq!(cpu.memory.read(0x103), 0xBE);
    assert_eq!(cpu.get(Register::Cx), 0xBEEF);
}

#[test]
fn test_decode_failure_stops_run() {
    // mov ax, 1 ; <0x60>
    let mut cpu = Cpu8086::new(&[0xB8, 0x01, 0x00, 0x60]);
    let err = cpu.run().unwrap_err();
    match err {
        EngineError::Decode { address, source } => {
            assert_eq!(address, 3);
            assert_eq!(
                source,
                DecodeError::UnknownOpcode {
                    offset: 3,
                    opcode: 0x60
                }
            );
        }
        other => panic!("expected decode error, got {:?}", other),
    }
    assert_eq!(cpu.get(Register::Ax), 1);
    assert_eq!(cpu.ip, 3, "IP stays on the undecodable byte");
}

#[test]
fn test_unimplemented_instruction_reports_mnemonic() {
    // mul bl
    let mut cpu = Cpu8086::new(&[0xF6, 0xE3]);
    cpu.set(Register::Ax, 3);
    let err = cpu.run().unwrap_err();
    assert!(matches!(
        err,
        EngineError::Unimplemented {
            address: 0,
            mnemonic: "mul"
        }
    ));
    assert_eq!(cpu.get(Register::Ax), 3, "no semantics applied");
    assert_eq!(cpu.ip, 2);
    assert_eq!(err.to_string(), "mul at 0x0000 is not emulated");
}

#[test]
fn test_step_limit() {
    // jmp short $
    let config = EngineConfig {
        step_limit: Some(100),
        ..EngineConfig::default()
    };
    let mut cpu = Cpu8086::with_config(&[0xEB, 0xFE], config);
    assert!(matches!(cpu.run(), Err(EngineError::StepLimit(100))));
    assert_eq!(cpu.steps(), 100);
}

#[test]
fn test_load_address_and_initial_sp() {
    let config = EngineConfig {
        load_address: 0x100,
        initial_sp: 0x8000,
        ..EngineConfig::default()
    };
    let mut cpu = Cpu8086::with_config(&[0xB8, 0x05, 0x00], config);
    assert_eq!(cpu.ip, 0x100);
    assert_eq!(cpu.get(Register::Sp), 0x8000);
    assert_eq!(cpu.memory.read(0x100), 0xB8);
    assert_eq!(cpu.memory.read(0x103), HALT_SENTINEL);

    cpu.run().unwrap();
    assert_eq!(cpu.get(Register::Ax), 5);
    assert_eq!(cpu.ip, 0x103);
}

#[test]
fn test_program_clipped_at_end_of_memory() {
    let config = EngineConfig {
        load_address: 0xFFFE,
        ..EngineConfig::default()
    };
    let cpu = Cpu8086::with_config(&[0x90, 0x91, 0x92, 0x93], config);
    assert_eq!(cpu.memory.read(0xFFFE), 0x90);
    assert_eq!(cpu.memory.read(0xFFFF), 0x91);
    assert_eq!(cpu.memory.read(0x0000), 0, "no wrap-around on load");
}

#[test]
fn test_cycle_accounting() {
    let config = EngineConfig {
        estimate_cycles: true,
        ..EngineConfig::default()
    };
    // mov bx, 1000 ; mov ax, [bx] ; add [bx + 1], ax
    let program = [0xBB, 0xE8, 0x03, 0x8B, 0x07, 0x01, 0x47, 0x01];
    let mut cpu = Cpu8086::with_config(&program, config);
    cpu.run().unwrap();

    // 4 + (8 + 5) + (16 + 9 + 8)
    assert_eq!(cpu.cycles, 50);
    assert_eq!(
        cpu.last_cycle_estimate(),
        Some(CycleEstimate {
            base: 16,
            ea: 9,
            penalty: 8
        })
    );
}

#[test]
fn test_cycles_off_by_default() {
    let cpu = run_program(&[0xBB, 0xE8, 0x03, 0x8B, 0x07]);
    assert_eq!(cpu.cycles, 0);
    assert_eq!(cpu.last_cycle_estimate(), None);
}

#[test]
fn test_save_and_load_state() {
    // mov ax, 0x1234 ; mov ds, ax ; stc
    let cpu = run_program(&[0xB8, 0x34, 0x12, 0x8E, 0xD8, 0xF9]);
    let state = cpu.save_state();
    assert_eq!(state["ax"], json!(0x1234));
    assert_eq!(state["ds"], json!(0x1234));
    assert_eq!(state["ip"], json!(6));

    let mut restored = Cpu8086::new(&[]);
    restored.load_state(&state).unwrap();
    assert_eq!(restored.get(Register::Ax), 0x1234);
    assert_eq!(restored.get(Register::Ds), 0x1234);
    assert_eq!(restored.get(Register::Sp), 0xFFFF);
    assert_eq!(restored.ip, 6);
    assert!(restored.get_flag(FLAG_CF));
}

#[test]
fn test_load_state_rejects_bad_input() {
    let mut cpu = Cpu8086::new(&[]);
    assert!(cpu.load_state(&json!({ "ax": "nope" })).is_err());
    assert!(cpu.load_state(&json!([1, 2, 3])).is_err());
}

#[test]
fn test_reset_keeps_memory() {
    let mut cpu = run_program(&[0xB8, 0x05, 0x00]);
    cpu.reset();
    assert_eq!(cpu.get(Register::Ax), 0);
    assert_eq!(cpu.ip, 0);
    assert_eq!(cpu.memory.read(0), 0xB8);

    cpu.run().unwrap();
    assert_eq!(cpu.get(Register::Ax), 5);
}

#[test]
fn test_flags_string() {
    assert_eq!(flags_string(0), "");
    assert_eq!(flags_string(FLAG_CF | FLAG_ZF | FLAG_SF), "CZS");
    assert_eq!(
        flags_string(
            FLAG_TF | FLAG_DF | FLAG_IF | FLAG_OF | FLAG_SF | FLAG_ZF | FLAG_AF | FLAG_PF | FLAG_CF
        ),
        "CPAZSOIDT"
    );
}

#[test]
fn test_execute_rejects_immediate_destination() {
    let mut cpu = Cpu8086::new(&[]);
    let instruction = Instruction::with_operands(
        InstructionType::Mov,
        true,
        [Operand::Immediate(1), Operand::Immediate(2)],
    );
    assert!(matches!(
        cpu.execute(&instruction),
        Err(EngineError::InvalidDestination { mnemonic: "mov", .. })
    ));
}
