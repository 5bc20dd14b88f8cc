//! AArch64 sequences for link slots, block prologues, the entry/exit routines and state moves.
//!
//! Sequences are assembled with `dynasm!` at the host address they will occupy. Decoding
//! inspects patched slots word by word.

use dynasmrt::aarch64::Aarch64Relocation;
use dynasmrt::{dynasm, DynasmApi, DynasmLabelApi, VecAssembler};

use crate::backend::arm64::abi::{DISPATCHER_PC, IP0};
use crate::backend::jit_state::PpcState;

/// `brk #0x123`, the poison word for destroyed code.
pub const BRK_TRAP: u32 = 0xD420_0000 | (0x123 << 5);
pub const RET: u32 = 0xD65F_03C0;

const B: u32 = 0x1400_0000;
const BL: u32 = 0x9400_0000;
const BRANCH_MASK: u32 = 0xFC00_0000;
const IMM26_MASK: u32 = 0x03FF_FFFF;

/// `ldr x16, #8; br x16; .quad target`
pub const INDIRECT_JUMP_LEN: usize = 16;
pub const INSN_LEN: usize = 4;
/// `ldr w17, [x29, #downcount]; cmp w17, #0; b.gt`
pub const BUDGET_CHECK_LEN: usize = 3 * INSN_LEN;

/// Word offset for a B/BL at `at` targeting `target`, if within ±128 MB.
pub fn branch_imm26(at: usize, target: usize) -> Option<u32> {
    let diff = target as i64 - at as i64;
    if diff % 4 != 0 {
        return None;
    }
    let words = diff / 4;
    ((-(1i64 << 25))..(1i64 << 25))
        .contains(&words)
        .then_some(words as u32 & IMM26_MASK)
}

fn sign_extend_imm26(word: u32) -> i64 {
    (((word & IMM26_MASK) << 6) as i32 >> 6) as i64
}

/// Scaled unsigned offset of a state field, checked against the 12-bit immediate.
fn state_offset(offset: usize, scale: usize) -> u32 {
    assert!(
        offset % scale == 0 && offset / scale < 4096,
        "state offset {offset:#x} out of range"
    );
    offset as u32
}

/// Assembler for one sequence placed at a fixed host address.
pub struct Asm {
    ops: VecAssembler<Aarch64Relocation>,
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
            dynasm!(self.ops ; .arch aarch64 ; brk 0x123);
        }
    }

    pub fn finish(self) -> Vec<u8> {
        let Asm { ops, base } = self;
        match ops.finalize() {
            Ok(bytes) => bytes,
            Err(e) => panic!("aarch64 sequence at {base:#x} failed to assemble: {e:?}"),
        }
    }

    /// `b` when `target` is within ±128 MB, else a literal-pool jump through x16.
    pub fn jump(&mut self, target: usize) {
        if branch_imm26(self.address(), target).is_some() {
            dynasm!(self.ops
                ; .arch aarch64
                ; b extern target
            );
        } else {
            dynasm!(self.ops
                ; .arch aarch64
                ; ldr x16, >literal
                ; br x16
                ; literal:
            );
            for byte in (target as u64).to_le_bytes() {
                self.ops.push(byte);
            }
        }
    }

    /// `movz w25, #lo; movk w25, #hi, lsl #16`
    pub fn mov_dispatcher_pc(&mut self, pc: u32) {
        dynasm!(self.ops
            ; .arch aarch64
            ; movz w25, pc & 0xFFFF
            ; movk w25, pc >> 16, lsl #16
        );
    }

    /// Branches to `budget_ok` while the downcount is positive. The caller defines the label.
    fn budget_check(&mut self) {
        let dc = state_offset(PpcState::offset_of_downcount(), 4);
        dynasm!(self.ops
            ; .arch aarch64
            ; ldr w17, [x29, dc]
            ; cmp w17, 0
            ; b.gt >budget_ok
        );
    }

    /// The budget check of a budgeted call slot, with `b.gt` landing at `call_offset`.
    pub fn budget_check_bytes(mut self, call_offset: usize) -> Vec<u8> {
        self.budget_check();
        self.pad_to(call_offset);
        dynasm!(self.ops
            ; .arch aarch64
            ; budget_ok:
        );
        let mut bytes = self.finish();
        bytes.truncate(BUDGET_CHECK_LEN);
        bytes
    }

    /// Budget check, then `bl normal` at `call_offset`. An exhausted budget branches to
    /// `checked` instead, which exits through the dispatcher.
    pub fn budgeted_call(&mut self, checked: usize, normal: usize, call_offset: usize) {
        self.budget_check();
        self.jump(checked);
        assert!(self.len() <= call_offset, "budgeted call overruns its slot");
        self.pad_to(call_offset);
        dynasm!(self.ops
            ; .arch aarch64
            ; budget_ok:
            ; bl extern normal
        );
    }

    pub fn checked_entry(&mut self, guest_pc: u32, dispatcher: usize) {
        self.budget_check();
        self.mov_dispatcher_pc(guest_pc);
        self.jump(dispatcher);
        dynasm!(self.ops
            ; .arch aarch64
            ; budget_ok:
        );
    }

    pub fn sub_downcount(&mut self, cycles: u32) {
        assert!(cycles < 4096, "cycle count {cycles} does not fit an immediate");
        let dc = state_offset(PpcState::offset_of_downcount(), 4);
        dynasm!(self.ops
            ; .arch aarch64
            ; ldr w17, [x29, dc]
            ; sub w17, w17, cycles
            ; str w17, [x29, dc]
        );
    }

    pub fn load_w(&mut self, reg: u8, offset: usize) {
        let offset = state_offset(offset, 4);
        dynasm!(self.ops ; .arch aarch64 ; ldr W(reg as u32), [x29, offset]);
    }

    pub fn store_w(&mut self, reg: u8, offset: usize) {
        let offset = state_offset(offset, 4);
        dynasm!(self.ops ; .arch aarch64 ; str W(reg as u32), [x29, offset]);
    }

    pub fn load_q(&mut self, reg: u8, offset: usize) {
        let offset = state_offset(offset, 16);
        dynasm!(self.ops ; .arch aarch64 ; ldr Q(reg as u32), [x29, offset]);
    }

    pub fn store_q(&mut self, reg: u8, offset: usize) {
        let offset = state_offset(offset, 16);
        dynasm!(self.ops ; .arch aarch64 ; str Q(reg as u32), [x29, offset]);
    }

    /// `extern "C" fn(state: *mut PpcState, entry: usize) -> u32`.
    ///
    /// Saves x19..x28, d8..d15 and the frame record in a 160-byte frame, records sp in the
    /// state and branches to `entry` with x29 pointing at the state.
    pub fn enter_routine(&mut self) {
        let host_sp = state_offset(PpcState::offset_of_host_sp(), 8);
        dynasm!(self.ops
            ; .arch aarch64
            ; stp x29, x30, [sp, #-160]!
            ; stp x19, x20, [sp, #16]
            ; stp x21, x22, [sp, #32]
            ; stp x23, x24, [sp, #48]
            ; stp x25, x26, [sp, #64]
            ; stp x27, x28, [sp, #80]
            ; stp d8, d9, [sp, #96]
            ; stp d10, d11, [sp, #112]
            ; stp d12, d13, [sp, #128]
            ; stp d14, d15, [sp, #144]
            ; mov x29, x0
            ; mov x16, sp
            ; str x16, [x29, host_sp]
            ; br x1
        );
    }

    /// Reached by a branch with the guest pc in w25, at any call depth. Resets sp to the
    /// saved value, stores the pc and returns it from the entry routine.
    pub fn dispatcher_routine(&mut self) {
        let host_sp = state_offset(PpcState::offset_of_host_sp(), 8);
        let pc = state_offset(PpcState::offset_of_pc(), 4);
        dynasm!(self.ops
            ; .arch aarch64
            ; ldr x16, [x29, host_sp]
            ; mov sp, x16
            ; str w25, [x29, pc]
            ; mov w0, w25
            ; ldp d14, d15, [sp, #144]
            ; ldp d12, d13, [sp, #128]
            ; ldp d10, d11, [sp, #112]
            ; ldp d8, d9, [sp, #96]
            ; ldp x27, x28, [sp, #80]
            ; ldp x25, x26, [sp, #64]
            ; ldp x23, x24, [sp, #48]
            ; ldp x21, x22, [sp, #32]
            ; ldp x19, x20, [sp, #16]
            ; ldp x29, x30, [sp], #160
            ; ret
        );
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// `movz w<rd>, #imm16, lsl #(hw * 16)`
fn movz_w(rd: u8, imm16: u16, hw: u32) -> u32 {
    0x5280_0000 | (hw << 21) | ((imm16 as u32) << 5) | rd as u32
}

/// `movk w<rd>, #imm16, lsl #(hw * 16)`
fn movk_w(rd: u8, imm16: u16, hw: u32) -> u32 {
    0x7280_0000 | (hw << 21) | ((imm16 as u32) << 5) | rd as u32
}

/// `ldr x16, #8`
const LDR_IP0_LITERAL: u32 = 0x5800_0000 | (2 << 5) | IP0 as u32;
/// `br x16`
const BR_IP0: u32 = 0xD61F_0000 | ((IP0 as u32) << 5);

pub fn word_at(bytes: &[u8], offset: usize) -> Option<u32> {
    let b = bytes.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Decode a jump written by [`Asm::jump`] at host address `at`. Returns `(target, indirect)`.
pub fn decode_jump(at: usize, bytes: &[u8]) -> Option<(usize, bool)> {
    let first = word_at(bytes, 0)?;
    if first & BRANCH_MASK == B {
        return Some(((at as i64 + sign_extend_imm26(first) * 4) as usize, false));
    }
    if first == LDR_IP0_LITERAL && word_at(bytes, 4)? == BR_IP0 {
        let lo = word_at(bytes, 8)? as u64;
        let hi = word_at(bytes, 12)? as u64;
        return Some(((hi << 32 | lo) as usize, true));
    }
    None
}

pub fn decode_bl(at: usize, bytes: &[u8]) -> Option<usize> {
    let word = word_at(bytes, 0)?;
    (word & BRANCH_MASK == BL).then(|| (at as i64 + sign_extend_imm26(word) * 4) as usize)
}

pub fn decode_mov_dispatcher_pc(bytes: &[u8]) -> Option<u32> {
    let lo = word_at(bytes, 0)?;
    let hi = word_at(bytes, 4)?;
    let movz_mask = 0xFFE0_001F;
    if lo & movz_mask != movz_w(DISPATCHER_PC, 0, 0)
        || hi & movz_mask != movk_w(DISPATCHER_PC, 0, 1)
    {
        return None;
    }
    Some(((hi >> 5) & 0xFFFF) << 16 | ((lo >> 5) & 0xFFFF))
}
