//! 8086 real-mode decoder, execution engine and cycle estimator.
//!
//! Decoding turns raw machine code into [`Instruction`] values that print as
//! NASM-compatible text. [`Cpu8086`] executes them over a flat 64 KiB memory
//! image, and [`cycles`] estimates what each one would cost on real hardware.

pub mod config;
pub mod cpu_8086;
pub mod cycles;
pub mod decoder;
pub mod instruction;
pub mod logging;

pub use config::{ConfigError, EngineConfig};
pub use cpu_8086::{flags_string, Cpu8086, EngineError, StepOutcome};
pub use cycles::CycleEstimate;
pub use decoder::{decode, disassemble, DecodeError};
pub use instruction::{Instruction, InstructionType, Operand, Register};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disassembly_runs_as_listed() {
        // mov cx, 3 ; add ax, cx ; loop -4
        let program = [0xB9, 0x03, 0x00, 0x01, 0xC8, 0xE2, 0xFC];
        let listing: Vec<String> = disassemble(&program)
            .unwrap()
            .iter()
            .map(|instruction| instruction.to_string())
            .collect();
        assert_eq!(listing, ["mov cx, 3", "add ax, cx", "loop $-2"]);

        let mut cpu = Cpu8086::new(&program);
        cpu.run().unwrap();
        assert_eq!(cpu.get(Register::Ax), 6);
    }

    #[test]
    fn save_state_round_trips_through_text() {
        let mut cpu = Cpu8086::new(&[0xB8, 0x01, 0x00, 0xF9]);
        cpu.run().unwrap();

        let text = serde_json::to_string(&cpu.save_state()).expect("serialize");
        let value: serde_json::Value = serde_json::from_str(&text).expect("deserialize");
        let mut restored = Cpu8086::new(&[]);
        assert!(restored.load_state(&value).is_ok());
        assert_eq!(restored.save_state(), cpu.save_state());
    }
}
