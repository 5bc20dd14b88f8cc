//! x86-64 sequences for link slots, block prologues, the entry/exit routines and state moves.
//!
//! Sequences are assembled with `dynasm!` at the host address they will occupy. Decoding
//! reads patched slots back and is done by hand.

use dynasmrt::x64::X64Relocation;
use dynasmrt::{dynasm, DynasmApi, DynasmLabelApi, VecAssembler};

use crate::backend::jit_state::PpcState;

pub const INT3: u8 = 0xCC;

const JMP_REL32: u8 = 0xE9;
pub const CALL_REL32: u8 = 0xE8;

/// Length of `jmp rel32` / `call rel32`.
pub const REL32_LEN: usize = 5;
/// Length of `mov rax, imm64; jmp rax`.
pub const INDIRECT_JUMP_LEN: usize = 12;
/// Upper bound of `cmp dword [rbp + disp], 0; jg rel32`.
pub const MAX_BUDGET_CHECK_LEN: usize = 16;

/// Padding below the six saved registers that realigns rsp to 16 bytes.
const ENTRY_FRAME_SIZE: i32 = 8;

/// Displacement from the end of a 5-byte rel32 instruction at `at` to `target`.
pub fn rel32(at: usize, target: usize) -> Option<i32> {
    let diff = target as i64 - (at as i64 + REL32_LEN as i64);
    i32::try_from(diff).ok()
}

fn state_disp(offset: usize) -> i32 {
    match i32::try_from(offset) {
        Ok(disp) => disp,
        Err(_) => panic!("state offset {offset:#x} out of range"),
    }
}

/// Assembler for one sequence placed at a fixed host address.
pub struct Asm {
    ops: VecAssembler<X64Relocation>,
    base: usize,
}

impl Asm {
    pub fn new(base: usize) -> Self {
        Self { ops: VecAssembler::new(base), base }
    }

    pub fn len(&self) -> usize {
        self.ops.offset().0
    }

    pub fn address(&self) -> usize {
        self.base + self.len()
    }

    pub fn pad_to(&mut self, len: usize) {
        while self.len() < len {
            self.ops.push(INT3);
        }
    }

    pub fn finish(self) -> Vec<u8> {
        let Asm { ops, base } = self;
        match ops.finalize() {
            Ok(bytes) => bytes,
            Err(e) => panic!("x64 sequence at {base:#x} failed to assemble: {e:?}"),
        }
    }

    /// Shortest jump to `target`: `jmp rel32` when reachable, else through rax.
    pub fn jump(&mut self, target: usize) {
        if rel32(self.address(), target).is_some() {
            dynasm!(self.ops
                ; .arch x64
                ; jmp extern target
            );
        } else {
            self.indirect_jump(target);
        }
    }

    pub fn indirect_jump(&mut self, target: usize) {
        dynasm!(self.ops
            ; .arch x64
            ; mov rax, QWORD target as i64
            ; jmp rax
        );
    }

    /// `mov esi, pc`: hands the guest pc to the dispatcher.
    pub fn mov_dispatcher_pc(&mut self, pc: u32) {
        dynasm!(self.ops
            ; .arch x64
            ; mov esi, pc as i32
        );
    }

    /// `cmp dword [rbp + downcount], 0; jg >budget_ok`. The caller defines `budget_ok`.
    fn budget_check(&mut self) {
        let dc = state_disp(PpcState::offset_of_downcount());
        dynasm!(self.ops
            ; .arch x64
            ; cmp DWORD [rbp + dc], 0
            ; jg >budget_ok
        );
    }

    /// Budget check, then a call to `normal` placed at `call_offset`. An exhausted budget
    /// jumps to `checked` instead, which exits through the dispatcher.
    pub fn budgeted_call(&mut self, checked: usize, normal: usize, call_offset: usize) {
        self.budget_check();
        self.jump(checked);
        assert!(self.len() <= call_offset, "budgeted call overruns its slot");
        self.pad_to(call_offset);
        dynasm!(self.ops
            ; .arch x64
            ; budget_ok:
            ; call extern normal
        );
    }

    /// Block prologue: leave through the dispatcher with `guest_pc` once the downcount is
    /// exhausted, otherwise fall through.
    pub fn checked_entry(&mut self, guest_pc: u32, dispatcher: usize) {
        self.budget_check();
        self.mov_dispatcher_pc(guest_pc);
        self.jump(dispatcher);
        dynasm!(self.ops
            ; .arch x64
            ; budget_ok:
        );
    }

    pub fn sub_downcount(&mut self, cycles: u32) {
        let dc = state_disp(PpcState::offset_of_downcount());
        dynasm!(self.ops
            ; .arch x64
            ; sub DWORD [rbp + dc], cycles as i32
        );
    }

    pub fn load_gpr(&mut self, reg: u8, offset: usize) {
        let disp = state_disp(offset);
        dynasm!(self.ops ; .arch x64 ; mov Rd(reg), DWORD [rbp + disp]);
    }

    pub fn store_gpr(&mut self, reg: u8, offset: usize) {
        let disp = state_disp(offset);
        dynasm!(self.ops ; .arch x64 ; mov DWORD [rbp + disp], Rd(reg));
    }

    pub fn load_xmm(&mut self, xmm: u8, offset: usize) {
        let disp = state_disp(offset);
        dynasm!(self.ops ; .arch x64 ; movaps Rx(xmm), [rbp + disp]);
    }

    pub fn store_xmm(&mut self, xmm: u8, offset: usize) {
        let disp = state_disp(offset);
        dynasm!(self.ops ; .arch x64 ; movaps [rbp + disp], Rx(xmm));
    }

    /// `extern "sysv64" fn(state: *mut PpcState, entry: usize) -> u32`.
    ///
    /// Saves the callee-saved registers, records the stack pointer in the state and jumps to
    /// `entry` with rbp pointing at the state.
    pub fn enter_routine(&mut self) {
        let host_sp = state_disp(PpcState::offset_of_host_sp());
        dynasm!(self.ops
            ; .arch x64
            ; push rbx
            ; push rbp
            ; push r12
            ; push r13
            ; push r14
            ; push r15
            ; sub rsp, ENTRY_FRAME_SIZE
            ; mov rbp, rdi
            ; mov QWORD [rbp + host_sp], rsp
            ; jmp rsi
        );
    }

    /// Reached by a jump with the guest pc in esi, at any call depth. Drops every frame
    /// pushed by budgeted calls, stores the pc and returns it from the entry routine.
    pub fn dispatcher_routine(&mut self) {
        let host_sp = state_disp(PpcState::offset_of_host_sp());
        let pc = state_disp(PpcState::offset_of_pc());
        dynasm!(self.ops
            ; .arch x64
            ; mov rsp, QWORD [rbp + host_sp]
            ; mov DWORD [rbp + pc], esi
            ; mov eax, esi
            ; add rsp, ENTRY_FRAME_SIZE
            ; pop r15
            ; pop r14
            ; pop r13
            ; pop r12
            ; pop rbp
            ; pop rbx
            ; ret
        );
    }
}

/// Length of the `mov esi, imm32` that precedes a dispatcher jump.
pub fn mov_dispatcher_pc_len() -> usize {
    let mut asm = Asm::new(0);
    asm.mov_dispatcher_pc(0);
    asm.len()
}

/// Offset of the checked-entry jump inside a budgeted call slot.
pub fn budget_check_len() -> usize {
    let mut asm = Asm::new(0);
    asm.budget_check();
    let len = asm.len();
    dynasm!(asm.ops ; .arch x64 ; budget_ok:);
    len
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

pub fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let b = bytes.get(at..at + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(bytes: &[u8], at: usize) -> Option<u64> {
    let b = bytes.get(at..at + 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(b);
    Some(u64::from_le_bytes(raw))
}

fn rel32_target(at: usize, bytes: &[u8]) -> Option<usize> {
    let rel = read_u32(bytes, 1)? as i32;
    Some((at as i64 + REL32_LEN as i64 + rel as i64) as usize)
}

/// Decode a jump written by [`Asm::jump`] at host address `at`. Returns `(target, indirect)`.
pub fn decode_jump(at: usize, bytes: &[u8]) -> Option<(usize, bool)> {
    if bytes.first() == Some(&JMP_REL32) {
        return Some((rel32_target(at, bytes)?, false));
    }
    // The imm64 of `mov rax, imm64` ends two bytes before the `jmp rax`.
    let target = read_u64(bytes, INDIRECT_JUMP_LEN - 2 - 8)? as usize;
    let mut expected = Asm::new(at);
    expected.indirect_jump(target);
    bytes.starts_with(&expected.finish()).then_some((target, true))
}

pub fn decode_call(at: usize, bytes: &[u8]) -> Option<usize> {
    match bytes.first() {
        Some(&CALL_REL32) => rel32_target(at, bytes),
        _ => None,
    }
}

/// Guest pc of a `mov esi, imm32` at the start of `bytes`.
pub fn decode_mov_dispatcher_pc(bytes: &[u8]) -> Option<u32> {
    let len = mov_dispatcher_pc_len();
    let pc = read_u32(bytes, len - 4)?;
    let mut expected = Asm::new(0);
    expected.mov_dispatcher_pc(pc);
    bytes.starts_with(&expected.finish()).then_some(pc)
}
