//! Instruction lengths checked against iced-x86's 16-bit decoder.
//!
//! Only encodings both decoders accept with the same meaning are compared:
//! 186+ opcodes, the x87 escapes, prefixes and the documented 8086-only
//! quirks are left out.

use iced_x86::{Decoder, DecoderOptions};
use sim86_core::decoder::decode;

const TAIL: [u8; 6] = [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC];

fn iced_length(bytes: &[u8]) -> Option<usize> {
    let mut decoder = Decoder::with_ip(16, bytes, 0, DecoderOptions::NONE);
    let instruction = decoder.decode();
    if instruction.is_invalid() {
        None
    } else {
        Some(instruction.len())
    }
}

fn has_modrm(opcode: u8) -> bool {
    matches!(opcode,
        0x00..=0x03 | 0x08..=0x0B | 0x10..=0x13 | 0x18..=0x1B
        | 0x20..=0x23 | 0x28..=0x2B | 0x30..=0x33 | 0x38..=0x3B
        | 0x80 | 0x81 | 0x83..=0x8F
        | 0xC4..=0xC7 | 0xD0..=0xD3 | 0xF6 | 0xF7 | 0xFE | 0xFF)
}

/// Whether `opcode` followed by `second` means the same thing to both decoders.
fn comparable(opcode: u8, second: u8) -> bool {
    let mode = second >> 6;
    let reg = (second >> 3) & 0b111;
    match opcode {
        // segment/lock/rep prefixes, 0F escape, 186+ and x87
        0x0F | 0x26 | 0x2E | 0x36 | 0x3E | 0x60..=0x6F | 0x82 | 0xC0 | 0xC1 | 0xC8
        | 0xC9 | 0xD6 | 0xD8..=0xDF | 0xF0..=0xF3 | 0x9B => false,
        // 83 /1, /4, /6 read a data byte per W here
        0x83 => !matches!(reg, 1 | 4 | 6),
        0x8C => reg < 4,
        0x8E => reg < 4 && reg != 1,
        0x8D | 0xC4 | 0xC5 => mode != 0b11,
        0x8F | 0xC6 | 0xC7 => reg == 0,
        0xD0..=0xD3 => reg != 6,
        0xD4 | 0xD5 => second == 0x0A,
        0xF6 | 0xF7 => reg != 1,
        0xFE => reg < 2,
        0xFF => match reg {
            3 | 5 => mode != 0b11,
            7 => false,
            _ => true,
        },
        _ => true,
    }
}

fn check(bytes: &[u8]) {
    let ours = decode(bytes, 0).unwrap_or_else(|e| panic!("{:02X?}: {}", bytes, e));
    let theirs = iced_length(bytes).unwrap_or_else(|| panic!("iced rejected {:02X?}", bytes));
    assert_eq!(
        ours.size as usize, theirs,
        "length of {:02X?} ({})",
        bytes, ours
    );
}

#[test]
fn lengths_match_for_every_modrm_form() {
    for opcode in (0u8..=0xFF).filter(|&op| has_modrm(op)) {
        for modrm in 0u8..=0xFF {
            if !comparable(opcode, modrm) {
                continue;
            }
            let mut bytes = vec![opcode, modrm];
            bytes.extend_from_slice(&TAIL);
            check(&bytes);
        }
    }
}

#[test]
fn lengths_match_for_fixed_forms() {
    for opcode in (0u8..=0xFF).filter(|&op| !has_modrm(op)) {
        let second = if matches!(opcode, 0xD4 | 0xD5) { 0x0A } else { TAIL[0] };
        if !comparable(opcode, second) || find_unknown(opcode) {
            continue;
        }
        let mut bytes = vec![opcode, second];
        bytes.extend_from_slice(&TAIL[1..]);
        check(&bytes);
    }
}

/// Opcodes this decoder has no rule for at all.
fn find_unknown(opcode: u8) -> bool {
    sim86_core::decoder::find_rule(opcode).is_none()
}

#[test]
fn lengths_match_with_prefixes() {
    let cases: &[&[u8]] = &[
        &[0x26, 0x8B, 0x07],
        &[0x2E, 0xA1, 0x34, 0x12],
        &[0x3E, 0xC7, 0x86, 0x10, 0x00, 0x01, 0x02],
        &[0xF3, 0xA4],
        &[0xF2, 0xAE],
        &[0xF3, 0x26, 0xA5],
    ];
    for bytes in cases {
        check(bytes);
    }
}
