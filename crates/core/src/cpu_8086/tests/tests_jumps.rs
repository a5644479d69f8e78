//! Conditional jumps, loops, calls and returns

use super::{run_program, run_with};
use crate::cpu_8086::{Cpu8086, FLAG_CF, FLAG_OF, FLAG_PF, FLAG_SF, FLAG_ZF};
use crate::instruction::Register;

#[test]
fn test_loop_falls_through_when_cx_reaches_zero() {
    // loop $
    let cpu = run_with(&[0xE2, 0xFE], |cpu| cpu.set(Register::Cx, 1));
    assert_eq!(cpu.get(Register::Cx), 0);
    assert_eq!(cpu.ip, 2);
}

#[test]
fn test_loop_sums() {
    // mov cx, 3 ; mov ax, 0 ; top: add ax, 2 ; loop top
    let cpu = run_program(&[
        0xB9, 0x03, 0x00, 0xB8, 0x00, 0x00, 0x05, 0x02, 0x00, 0xE2, 0xFB,
    ]);
    assert_eq!(cpu.get(Register::Ax), 6);
    assert_eq!(cpu.get(Register::Cx), 0);
    assert_eq!(cpu.ip, 11);
}

#[test]
fn test_jnz_countdown() {
    // mov cx, 5 ; top: dec cx ; jnz top
    let cpu = run_program(&[0xB9, 0x05, 0x00, 0x49, 0x75, 0xFD]);
    assert_eq!(cpu.get(Register::Cx), 0);
    assert!(cpu.get_flag(FLAG_ZF));
    assert_eq!(cpu.steps(), 1 + 5 * 2);
}

#[test]
fn test_conditions() {
    // (flags, condition code, expected)
    let cases = [
        (FLAG_OF, 0x0, true),
        (0, 0x1, true),
        (FLAG_CF, 0x2, true),
        (FLAG_CF, 0x3, false),
        (FLAG_ZF, 0x4, true),
        (FLAG_ZF, 0x5, false),
        (FLAG_ZF, 0x6, true),
        (0, 0x7, true),
        (FLAG_SF, 0x8, true),
        (FLAG_SF, 0x9, false),
        (FLAG_PF, 0xA, true),
        (FLAG_PF, 0xB, false),
        (FLAG_SF, 0xC, true),
        (FLAG_SF | FLAG_OF, 0xC, false),
        (FLAG_SF | FLAG_OF, 0xD, true),
        (FLAG_ZF, 0xE, true),
        (FLAG_OF, 0xE, true),
        (0, 0xF, true),
        (FLAG_SF, 0xF, false),
    ];
    let mut cpu = Cpu8086::new(&[]);
    for (flags, code, expected) in cases {
        cpu.flags = flags;
        assert_eq!(
            cpu.check_condition(code),
            expected,
            "condition {:#x} with flags {:#06x}",
            code,
            flags
        );
    }
}

#[test]
fn test_jcc_not_taken_falls_through() {
    // clc ; jb +3 ; mov ax, 1
    let cpu = run_program(&[0xF8, 0x72, 0x03, 0xB8, 0x01, 0x00]);
    assert_eq!(cpu.get(Register::Ax), 1);

    // stc ; jb +3 ; mov ax, 1
    let cpu = run_program(&[0xF9, 0x72, 0x03, 0xB8, 0x01, 0x00]);
    assert_eq!(cpu.get(Register::Ax), 0);
    assert_eq!(cpu.ip, 6);
}

#[test]
fn test_signed_and_unsigned_compare() {
    // cmp ax, bx ; jl +3 ; mov cx, 1
    let program = [0x39, 0xD8, 0x7C, 0x03, 0xB9, 0x01, 0x00];
    let setup = |cpu: &mut Cpu8086| {
        cpu.set(Register::Ax, 0xFFFF);
        cpu.set(Register::Bx, 1);
    };
    // -1 < 1 signed: jump taken, cx stays 0
    let cpu = run_with(&program, setup);
    assert_eq!(cpu.get(Register::Cx), 0);

    // 0xffff > 1 unsigned: jb not taken
    let mut unsigned = program;
    unsigned[2] = 0x72;
    let cpu = run_with(&unsigned, setup);
    assert_eq!(cpu.get(Register::Cx), 1);
}

#[test]
fn test_loopz_and_loopnz() {
    // loopz $ : ZF set keeps looping until cx runs out
    let cpu = run_with(&[0xE1, 0xFE], |cpu| {
        cpu.set(Register::Cx, 4);
        cpu.flags = FLAG_ZF;
    });
    assert_eq!(cpu.get(Register::Cx), 0);
    assert_eq!(cpu.steps(), 4);

    // loopz $ : ZF clear exits after one iteration
    let cpu = run_with(&[0xE1, 0xFE], |cpu| cpu.set(Register::Cx, 4));
    assert_eq!(cpu.get(Register::Cx), 3);
    assert_eq!(cpu.steps(), 1);

    // loopnz $ : ZF set exits after one iteration
    let cpu = run_with(&[0xE0, 0xFE], |cpu| {
        cpu.set(Register::Cx, 4);
        cpu.flags = FLAG_ZF;
    });
    assert_eq!(cpu.get(Register::Cx), 3);
}

#[test]
fn test_jcxz() {
    // jcxz +3 ; mov ax, 1
    let cpu = run_program(&[0xE3, 0x03, 0xB8, 0x01, 0x00]);
    assert_eq!(cpu.get(Register::Ax), 0);

    let cpu = run_with(&[0xE3, 0x03, 0xB8, 0x01, 0x00], |cpu| {
        cpu.set(Register::Cx, 2)
    });
    assert_eq!(cpu.get(Register::Ax), 1);
    assert_eq!(cpu.get(Register::Cx), 2, "jcxz does not decrement");
}

#[test]
fn test_loop_with_cx_zero_wraps() {
    // loop +0 with cx = 0 decrements to 0xffff and jumps
    let cpu = run_program(&[0xE2, 0x00]);
    assert_eq!(cpu.get(Register::Cx), 0xFFFF);
    assert_eq!(cpu.ip, 2);
}

#[test]
fn test_call_and_ret() {
    //   call sub ; mov bx, 1 ; hlt
    // sub: mov ax, 7 ; ret
    let cpu = run_program(&[
        0xE8, 0x04, 0x00, 0xBB, 0x01, 0x00, 0xF4, 0xB8, 0x07, 0x00, 0xC3,
    ]);
    assert_eq!(cpu.get(Register::Ax), 7);
    assert_eq!(cpu.get(Register::Bx), 1);
    assert_eq!(cpu.get(Register::Sp), 0xFFFF);
    assert_eq!(cpu.ip, 7);
}

#[test]
fn test_call_pushes_return_address() {
    let mut cpu = Cpu8086::new(&[0xE8, 0x04, 0x00]);
    cpu.step().unwrap();
    assert_eq!(cpu.ip, 7);
    assert_eq!(cpu.get(Register::Sp), 0xFFFD);
    assert_eq!(cpu.memory.read_u16(0xFFFD), 3);
}

#[test]
fn test_ret_with_stack_adjustment() {
    // call sub ; hlt ; sub: ret 4
    let cpu = run_program(&[0xE8, 0x01, 0x00, 0xF4, 0xC2, 0x04, 0x00]);
    assert_eq!(cpu.ip, 4);
    // 0xffff - 2 + 2 + 4, wrapping
    assert_eq!(cpu.get(Register::Sp), 0x0003);
}

#[test]
fn test_jmp_short_skips_code() {
    // jmp short +3 ; mov ax, 1 ; mov bx, 2
    let cpu = run_program(&[0xEB, 0x03, 0xB8, 0x01, 0x00, 0xBB, 0x02, 0x00]);
    assert_eq!(cpu.get(Register::Ax), 0);
    assert_eq!(cpu.get(Register::Bx), 2);
}

#[test]
fn test_jmp_near_backwards() {
    // mov cx, 2 ; top: dec cx ; jz out ; jmp near top ; out:
    let cpu = run_program(&[0xB9, 0x02, 0x00, 0x49, 0x74, 0x03, 0xE9, 0xFA, 0xFF]);
    assert_eq!(cpu.get(Register::Cx), 0);
    assert_eq!(cpu.ip, 9);
}

#[test]
fn test_jmp_far_loads_cs() {
    let mut cpu = Cpu8086::new(&[0xEA, 0x05, 0x00, 0x34, 0x12]);
    cpu.step().unwrap();
    assert_eq!(cpu.get(Register::Cs), 0x1234);
    assert_eq!(cpu.ip, 5);
}

#[test]
fn test_jmp_indirect_through_register() {
    // mov ax, 8 ; jmp ax ; mov cx, 1 ; hlt
    let cpu = run_program(&[0xB8, 0x08, 0x00, 0xFF, 0xE0, 0xB9, 0x01, 0x00, 0xF4]);
    assert_eq!(cpu.get(Register::Cx), 0);
    assert_eq!(cpu.ip, 9);
}

#[test]
fn test_jmp_indirect_through_memory() {
    // jmp [bx] ; mov cx, 1 ; hlt
    let cpu = run_with(&[0xFF, 0x27, 0xB9, 0x01, 0x00, 0xF4], |cpu| {
        cpu.set(Register::Bx, 0x400);
        cpu.memory.write_u16(0x400, 5);
    });
    assert_eq!(cpu.get(Register::Cx), 0);
    assert_eq!(cpu.ip, 6);
}

#[test]
fn test_call_far_and_retf() {
    // call 0:6 ; hlt ; <pad> ; retf
    let cpu = run_program(&[0x9A, 0x06, 0x00, 0x00, 0x00, 0xF4, 0xCB]);
    assert_eq!(cpu.ip, 6);
    assert_eq!(cpu.get(Register::Cs), 0);
    assert_eq!(cpu.get(Register::Sp), 0xFFFF);
}

#[test]
fn test_call_far_stack_layout() {
    let mut cpu = Cpu8086::new(&[0x9A, 0x00, 0x01, 0x00, 0x20]);
    cpu.set(Register::Cs, 0x0700);
    cpu.step().unwrap();
    assert_eq!(cpu.get(Register::Cs), 0x2000);
    assert_eq!(cpu.ip, 0x0100);
    assert_eq!(cpu.get(Register::Sp), 0xFFFB);
    assert_eq!(cpu.memory.read_u16(0xFFFB), 5, "return IP on top");
    assert_eq!(cpu.memory.read_u16(0xFFFD), 0x0700, "caller CS below it");
}

#[test]
fn test_call_indirect_far_through_memory() {
    // call far [bx]
    let mut cpu = Cpu8086::new(&[0xFF, 0x1F]);
    cpu.set(Register::Bx, 0x500);
    cpu.memory.write_u16(0x500, 0x0030);
    cpu.memory.write_u16(0x502, 0x4000);
    cpu.step().unwrap();
    assert_eq!(cpu.ip, 0x0030);
    assert_eq!(cpu.get(Register::Cs), 0x4000);
    assert_eq!(cpu.memory.read_u16(0xFFFB), 2);
}
