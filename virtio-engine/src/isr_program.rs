//! The interrupt classification program installed by the standard PCI
//! transport when ISR offload is available.
//!
//! The program runs in the interrupt path with three bound values:
//! slot 0 is the memory view holding the ISR register, slot 1 the register's
//! byte offset in that view and slot 2 the bitset event to raise. It reads
//! the ISR byte, keeps the queue and configuration bits and, if any is set,
//! raises them on the event and acknowledges the interrupt. Otherwise the
//! interrupt is not ours and gets nacked.

use crate::irq::BindType;
use crate::spec::IsrStatus;

/// Value returned by the program when it handled the interrupt.
pub const VERDICT_ACK: u64 = 1;
/// Value returned by the program when the interrupt was not for this device.
pub const VERDICT_NACK: u64 = 2;

const MAX_STEPS: usize = 256;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Push the value bound to a slot.
    Binding(u8),
    Literal(u64),
    Add,
    And,
    Dup,
    /// Pop an offset and a memory view, push the byte at that offset.
    MmioRead8,
    /// Pop a value; continue at the given instruction index if it is zero.
    JumpIfZero(u16),
    /// Pop an event and a bit mask, raise the bits on the event.
    TriggerBitset,
    /// Pop the verdict and stop.
    Return,
}

impl Instruction {
    fn opcode(&self) -> u8 {
        match self {
            Instruction::Binding(_) => 0x01,
            Instruction::Literal(_) => 0x02,
            Instruction::Add => 0x10,
            Instruction::And => 0x11,
            Instruction::Dup => 0x12,
            Instruction::MmioRead8 => 0x20,
            Instruction::JumpIfZero(_) => 0x30,
            Instruction::TriggerBitset => 0x40,
            Instruction::Return => 0x50,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProgramError {
    #[error("stack underflow at instruction {0}")]
    StackUnderflow(usize),
    #[error("unbound slot {0}")]
    UnboundSlot(u8),
    #[error("jump to {0} is out of range")]
    BadJump(u16),
    #[error("program did not return within {MAX_STEPS} steps")]
    Runaway,
}

/// Decision of the program for one interrupt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IsrVerdict {
    Acknowledge,
    Nack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsrProgram {
    instructions: Vec<Instruction>,
}

impl IsrProgram {
    /// Slot kinds the program expects, in binding order.
    pub const BINDINGS: [BindType; 3] = [BindType::MemoryView, BindType::Offset, BindType::BitsetEvent];

    /// Builds the classification program for an ISR register located
    /// `register_offset` bytes past the bound offset.
    pub fn virtio_isr(register_offset: u64) -> Self {
        use Instruction::*;

        let interesting = (IsrStatus::QUEUE | IsrStatus::CONFIG_CHANGE).bits() as u64;
        let instructions = vec![
            // Load the ISR byte and mask the bits we care about.
            Binding(0),
            Binding(1),
            Literal(register_offset),
            Add,
            MmioRead8,
            Literal(interesting),
            And,
            Dup,
            JumpIfZero(13),
            // Ours: raise the bits and ack.
            Binding(2),
            TriggerBitset,
            Literal(VERDICT_ACK),
            Return,
            // Not ours.
            Literal(VERDICT_NACK),
            Return,
        ];

        Self { instructions }
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Serializes the program: one opcode byte per instruction followed by
    /// its little-endian operand, if any.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.instructions.len() * 3);

        for instruction in &self.instructions {
            out.push(instruction.opcode());
            match *instruction {
                Instruction::Binding(slot) => out.push(slot),
                Instruction::Literal(value) => out.extend_from_slice(&value.to_le_bytes()),
                Instruction::JumpIfZero(target) => out.extend_from_slice(&target.to_le_bytes()),
                _ => {}
            }
        }

        out
    }

    /// Runs the program the way the interrupt path would.
    ///
    /// `read8(view, offset)` performs the MMIO load and
    /// `trigger(event, bits)` raises bits on a bitset event.
    pub fn evaluate(
        &self,
        bindings: &[u64],
        mut read8: impl FnMut(u64, u64) -> u8,
        mut trigger: impl FnMut(u64, u64),
    ) -> Result<IsrVerdict, ProgramError> {
        let mut stack: Vec<u64> = Vec::new();
        let mut pc = 0usize;

        for _ in 0..MAX_STEPS {
            let instruction = *self
                .instructions
                .get(pc)
                .ok_or(ProgramError::BadJump(pc as u16))?;
            let mut pop = || stack.pop().ok_or(ProgramError::StackUnderflow(pc));

            match instruction {
                Instruction::Binding(slot) => {
                    let value = *bindings
                        .get(slot as usize)
                        .ok_or(ProgramError::UnboundSlot(slot))?;
                    stack.push(value);
                }
                Instruction::Literal(value) => stack.push(value),
                Instruction::Add => {
                    let (b, a) = (pop()?, pop()?);
                    stack.push(a.wrapping_add(b));
                }
                Instruction::And => {
                    let (b, a) = (pop()?, pop()?);
                    stack.push(a & b);
                }
                Instruction::Dup => {
                    let value = pop()?;
                    stack.extend([value, value]);
                }
                Instruction::MmioRead8 => {
                    let (offset, view) = (pop()?, pop()?);
                    stack.push(u64::from(read8(view, offset)));
                }
                Instruction::JumpIfZero(target) => {
                    if pop()? == 0 {
                        if usize::from(target) >= self.instructions.len() {
                            return Err(ProgramError::BadJump(target));
                        }
                        pc = usize::from(target);
                        continue;
                    }
                }
                Instruction::TriggerBitset => {
                    let (event, bits) = (pop()?, pop()?);
                    trigger(event, bits);
                }
                Instruction::Return => {
                    return Ok(if pop()? == VERDICT_ACK {
                        IsrVerdict::Acknowledge
                    } else {
                        IsrVerdict::Nack
                    });
                }
            }

            pc += 1;
        }

        Err(ProgramError::Runaway)
    }
}
