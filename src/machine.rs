//! x86-64 instruction selection for the matcher.
//!
//! Register assignment, fixed for the whole generated function:
//!
//! - `rdi`: the cursor, a pointer to the byte being matched.
//! - `rsi`: the start of the line. Never written.
//! - `rbp`: frame pointer. Frame slots live just below it.
//! - `rsp`: top of the backtrack stack.
//! - `rax`: scratch, and the return value.
//!
//! A choice point is two words on the native stack: a resume address with the
//! saved cursor on top of it. Backtracking is `pop rdi; ret`.

use std::fmt;

use crate::code_buffer::{CodeBuffer, Label};

/// One step of a generated matcher. Most variants are a single machine
/// instruction; a few are short fixed sequences.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Op {
    /// Not an instruction: binds the label to the current offset.
    Label(Label),
    /// Function prologue reserving `slots` frame slots.
    Enter { slots: u32 },
    /// Tear down the frame, discarding every choice point, and return.
    Leave { matched: bool },
    /// Push a choice point resuming at the label with the current cursor.
    PushChoice(Label),
    /// The fail sequence: pop a cursor and jump to the resume address under it.
    Backtrack,
    /// Compare the byte under the cursor with an immediate.
    CmpByte(u8),
    /// Compare the cursor with the line start.
    CmpLineStart,
    /// Move the cursor forward one byte.
    Advance,
    Jump(Label),
    JumpIfEq(Label),
    JumpIfNe(Label),
    /// Push a frame slot onto the backtrack stack.
    SaveSlot(u32),
    /// Pop the top of the backtrack stack into a frame slot.
    RestoreSlot(u32),
    /// Store the cursor into a frame slot.
    StoreCursor(u32),
    /// Compare the cursor with a frame slot.
    CmpCursorSlot(u32),
}

// Every frame slot is addressed as [rbp + disp32].
fn slot_disp(slot: u32) -> i32 {
    let slot = i32::try_from(slot).expect("frame slot index out of range");
    -8 * (slot + 1)
}

impl Op {
    /// Appends this op's machine code to `buf`.
    pub fn encode(&self, buf: &mut CodeBuffer) {
        match *self {
            Op::Label(label) => buf.define_label(label),
            Op::Enter { slots } => {
                buf.emit(&[
                    0x55, // push rbp
                    0x48, 0x89, 0xe5, // mov rbp, rsp
                ]);
                if slots > 0 {
                    // sub rsp, imm32
                    buf.emit(&[0x48, 0x81, 0xec]);
                    buf.emit_i32(-slot_disp(slots - 1));
                }
            }
            Op::Leave { matched } => {
                if matched {
                    // mov eax, 1
                    buf.emit(&[0xb8, 0x01, 0x00, 0x00, 0x00]);
                } else {
                    // xor eax, eax
                    buf.emit(&[0x31, 0xc0]);
                }
                buf.emit(&[
                    0x48, 0x89, 0xec, // mov rsp, rbp
                    0x5d, // pop rbp
                    0xc3, // ret
                ]);
            }
            Op::PushChoice(label) => {
                // lea rax, [rip + label]
                buf.emit(&[0x48, 0x8d, 0x05]);
                buf.emit_label_ref(label);
                buf.emit(&[
                    0x50, // push rax
                    0x57, // push rdi
                ]);
            }
            Op::Backtrack => buf.emit(&[
                0x5f, // pop rdi
                0xc3, // ret
            ]),
            // cmp byte ptr [rdi], imm8
            Op::CmpByte(imm) => buf.emit(&[0x80, 0x3f, imm]),
            // cmp rdi, rsi
            Op::CmpLineStart => buf.emit(&[0x48, 0x39, 0xf7]),
            // inc rdi
            Op::Advance => buf.emit(&[0x48, 0xff, 0xc7]),
            Op::Jump(label) => {
                buf.emit(&[0xe9]);
                buf.emit_label_ref(label);
            }
            Op::JumpIfEq(label) => {
                buf.emit(&[0x0f, 0x84]);
                buf.emit_label_ref(label);
            }
            Op::JumpIfNe(label) => {
                buf.emit(&[0x0f, 0x85]);
                buf.emit_label_ref(label);
            }
            Op::SaveSlot(slot) => {
                // push qword ptr [rbp + disp32]
                buf.emit(&[0xff, 0xb5]);
                buf.emit_i32(slot_disp(slot));
            }
            Op::RestoreSlot(slot) => {
                // pop qword ptr [rbp + disp32]
                buf.emit(&[0x8f, 0x85]);
                buf.emit_i32(slot_disp(slot));
            }
            Op::StoreCursor(slot) => {
                // mov qword ptr [rbp + disp32], rdi
                buf.emit(&[0x48, 0x89, 0xbd]);
                buf.emit_i32(slot_disp(slot));
            }
            Op::CmpCursorSlot(slot) => {
                // cmp rdi, qword ptr [rbp + disp32]
                buf.emit(&[0x48, 0x3b, 0xbd]);
                buf.emit_i32(slot_disp(slot));
            }
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Op::Label(label) => write!(f, "{}:", label),
            Op::Enter { slots: 0 } => f.write_str("    push rbp; mov rbp, rsp"),
            Op::Enter { slots } => write!(
                f,
                "    push rbp; mov rbp, rsp; sub rsp, {}",
                -slot_disp(slots - 1)
            ),
            Op::Leave { matched } => write!(
                f,
                "    {}; mov rsp, rbp; pop rbp; ret",
                if matched { "mov eax, 1" } else { "xor eax, eax" }
            ),
            Op::PushChoice(label) => write!(f, "    lea rax, [rip + {}]; push rax; push rdi", label),
            Op::Backtrack => f.write_str("    pop rdi; ret"),
            Op::CmpByte(imm) => write!(f, "    cmp byte ptr [rdi], {:#04x}", imm),
            Op::CmpLineStart => f.write_str("    cmp rdi, rsi"),
            Op::Advance => f.write_str("    inc rdi"),
            Op::Jump(label) => write!(f, "    jmp {}", label),
            Op::JumpIfEq(label) => write!(f, "    je {}", label),
            Op::JumpIfNe(label) => write!(f, "    jne {}", label),
            Op::SaveSlot(slot) => write!(f, "    push qword ptr [rbp - {}]", -slot_disp(slot)),
            Op::RestoreSlot(slot) => write!(f, "    pop qword ptr [rbp - {}]", -slot_disp(slot)),
            Op::StoreCursor(slot) => write!(f, "    mov qword ptr [rbp - {}], rdi", -slot_disp(slot)),
            Op::CmpCursorSlot(slot) => {
                write!(f, "    cmp rdi, qword ptr [rbp - {}]", -slot_disp(slot))
            }
        }
    }
}

/// Encodes `ops` into `buf`, which must be the buffer their labels were
/// allocated from, and returns the finished machine code.
pub fn assemble(mut buf: CodeBuffer, ops: &[Op]) -> Vec<u8> {
    for op in ops {
        op.encode(&mut buf);
    }
    buf.finish()
}
