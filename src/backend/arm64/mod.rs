pub mod abi;
pub mod emit;

use crate::backend::code_writer::CodeWriter;
use crate::backend::hostloc::{HostReg, SlotWidth, StateSlot};
use crate::backend::patch_info::{LinkDestination, LinkKind, LinkSite, LinkTarget};
use crate::backend::{DispatcherRoutines, HostArch, HostBackend};

use self::emit::*;

/// Every link slot is this long so any form can replace any other in place.
///
/// Longest form is the budgeted call: `ldr`/`cmp`/`b.gt` (12) + indirect jump (16) + `bl` (4).
pub const LINK_SIZE: usize = BUDGET_CHECK_LEN + INDIRECT_JUMP_LEN + INSN_LEN;
/// Offset of the `bl` inside a budgeted call slot. The return address is the end of the slot.
pub const CALL_OFFSET: usize = LINK_SIZE - INSN_LEN;

#[derive(Debug, Default, Clone, Copy)]
pub struct Arm64Backend;

impl Arm64Backend {
    pub fn new() -> Self {
        Self
    }

    fn assemble(code: &mut CodeWriter<'_>, f: impl FnOnce(&mut Asm)) {
        let mut asm = Asm::new(code.address());
        f(&mut asm);
        code.put(&asm.finish());
    }
}

impl HostBackend for Arm64Backend {
    fn arch(&self) -> HostArch {
        HostArch::Arm64
    }

    fn link_size(&self) -> usize {
        LINK_SIZE
    }

    fn encode_link(
        &self,
        site: &LinkSite,
        destination: Option<&LinkDestination>,
        dispatcher: usize,
    ) -> Vec<u8> {
        let mut asm = Asm::new(site.address);
        match destination {
            None => {
                asm.mov_dispatcher_pc(site.exit_address);
                asm.jump(dispatcher);
            }
            Some(dest) => {
                let call_reaches = site.kind == LinkKind::Call
                    && branch_imm26(site.address + CALL_OFFSET, dest.normal_entry).is_some();
                if call_reaches {
                    asm.budgeted_call(dest.checked_entry, dest.normal_entry, CALL_OFFSET);
                } else {
                    // A call whose normal entry is out of reach degrades to a plain jump.
                    asm.jump(dest.checked_entry);
                }
            }
        }
        asm.pad_to(LINK_SIZE);
        let bytes = asm.finish();
        debug_assert_eq!(bytes.len(), LINK_SIZE);
        bytes
    }

    fn decode_link(&self, site_address: usize, bytes: &[u8]) -> Option<LinkTarget> {
        let bytes = bytes.get(..LINK_SIZE)?;
        if self.is_trap(bytes) {
            return Some(LinkTarget::Trap);
        }
        if let Some(guest_pc) = decode_mov_dispatcher_pc(bytes) {
            let (dispatcher, _) = decode_jump(site_address + 8, &bytes[8..])?;
            return Some(LinkTarget::Dispatcher { guest_pc, dispatcher });
        }
        if let Some(normal) = decode_bl(site_address + CALL_OFFSET, &bytes[CALL_OFFSET..]) {
            let check = Asm::new(site_address).budget_check_bytes(CALL_OFFSET);
            if bytes[..BUDGET_CHECK_LEN] != check[..] {
                return None;
            }
            let (checked, _) =
                decode_jump(site_address + BUDGET_CHECK_LEN, &bytes[BUDGET_CHECK_LEN..])?;
            return Some(LinkTarget::BudgetedCall { checked, normal });
        }
        let (host, indirect) = decode_jump(site_address, bytes)?;
        Some(LinkTarget::Jump { host, indirect })
    }

    fn fill_trap(&self, bytes: &mut [u8]) {
        let trap = BRK_TRAP.to_le_bytes();
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = trap[i % INSN_LEN];
        }
    }

    fn is_trap(&self, bytes: &[u8]) -> bool {
        !bytes.is_empty()
            && bytes.len() % INSN_LEN == 0
            && bytes.chunks_exact(INSN_LEN).all(|w| w == BRK_TRAP.to_le_bytes())
    }

    fn emit_dispatcher_routines(&self, code: &mut CodeWriter<'_>) -> DispatcherRoutines {
        let trap = BRK_TRAP.to_le_bytes();
        code.align(16, &trap);
        let enter = code.address();
        Self::assemble(code, Asm::enter_routine);

        code.align(16, &trap);
        let dispatcher = code.address();
        Self::assemble(code, Asm::dispatcher_routine);
        code.align(16, &trap);
        DispatcherRoutines { enter, dispatcher }
    }

    fn emit_checked_entry(&self, code: &mut CodeWriter<'_>, guest_pc: u32, dispatcher: usize) {
        Self::assemble(code, |asm| asm.checked_entry(guest_pc, dispatcher));
    }

    fn emit_downcount_sub(&self, code: &mut CodeWriter<'_>, cycles: u32) {
        Self::assemble(code, |asm| asm.sub_downcount(cycles));
    }

    fn emit_load(&self, code: &mut CodeWriter<'_>, reg: HostReg, slot: StateSlot) {
        Self::assemble(code, |asm| match (reg, slot.width) {
            (HostReg::Gpr(r), SlotWidth::Word) => asm.load_w(r, slot.offset as usize),
            (HostReg::Fpr(q), SlotWidth::Quad) => asm.load_q(q, slot.offset as usize),
            _ => panic!("Cannot load {:?} slot into {:?}", slot.width, reg),
        });
    }

    fn emit_store(&self, code: &mut CodeWriter<'_>, reg: HostReg, slot: StateSlot) {
        Self::assemble(code, |asm| match (reg, slot.width) {
            (HostReg::Gpr(r), SlotWidth::Word) => asm.store_w(r, slot.offset as usize),
            (HostReg::Fpr(q), SlotWidth::Quad) => asm.store_q(q, slot.offset as usize),
            _ => panic!("Cannot store {:?} into {:?} slot", reg, slot.width),
        });
    }

    fn gpr_allocation_order(&self) -> &'static [HostReg] {
        abi::GPR_ALLOCATION_ORDER
    }

    fn fpr_allocation_order(&self) -> &'static [HostReg] {
        abi::FPR_ALLOCATION_ORDER
    }

    fn flush_icache(&self, code: &[u8]) {
        if !code.is_empty() {
            flush_range(code);
        }
    }
}

#[cfg(target_arch = "aarch64")]
fn flush_range(code: &[u8]) {
    // SAFETY: cache maintenance by virtual address over memory we own. Contents are unchanged.
    unsafe { clear_cache(code.as_ptr() as usize, code.len()) }
}

/// Cross-built AArch64 code is never executed on this host.
#[cfg(not(target_arch = "aarch64"))]
fn flush_range(_code: &[u8]) {}

/// Clean the data cache and invalidate the instruction cache over `[start, start + len)`.
#[cfg(target_arch = "aarch64")]
unsafe fn clear_cache(start: usize, len: usize) {
    use core::arch::asm;

    let ctr: u64;
    asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack, preserves_flags));
    let dline = 4usize << ((ctr >> 16) & 0xF);
    let iline = 4usize << (ctr & 0xF);
    let end = start + len;

    let mut addr = start & !(dline - 1);
    while addr < end {
        asm!("dc civac, {}", in(reg) addr, options(nostack, preserves_flags));
        addr += dline;
    }
    asm!("dsb ish", options(nostack, preserves_flags));

    addr = start & !(iline - 1);
    while addr < end {
        asm!("ic ivau, {}", in(reg) addr, options(nostack, preserves_flags));
        addr += iline;
    }
    asm!("dsb ish", "isb", options(nostack, preserves_flags));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::jit_state::PpcState;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const SITE: usize = 0x1000_0000;
    const DISPATCHER: usize = 0x0FFF_F000;

    fn site(kind: LinkKind) -> LinkSite {
        LinkSite { address: SITE, exit_address: 0x8000_3100, kind }
    }

    fn dest(checked: usize) -> LinkDestination {
        LinkDestination { checked_entry: checked, normal_entry: checked + 20 }
    }

    /// `ldr w<rt>, [x29, #offset]`
    fn ldr_w_state(rt: u32, offset: usize) -> u32 {
        0xB940_0000 | ((offset as u32 / 4) << 10) | (29 << 5) | rt
    }

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect()
    }

    #[test]
    fn test_link_size() {
        assert_eq!(LINK_SIZE, 32);
        assert_eq!(CALL_OFFSET, 28);
    }

    #[test]
    fn test_unknown_destination_goes_to_dispatcher() {
        let backend = Arm64Backend::new();
        let bytes = backend.encode_link(&site(LinkKind::Jump), None, DISPATCHER);
        let w = words(&bytes);
        // movz w25, #0x3100 ; movk w25, #0x8000, lsl #16
        assert_eq!(w[0], 0x5286_2019);
        assert_eq!(w[1], 0x72B0_0019);
        assert_eq!(w[2] & 0xFC00_0000, 0x1400_0000);
        assert!(w[3..].iter().all(|&x| x == BRK_TRAP));
        assert_eq!(
            backend.decode_link(SITE, &bytes),
            Some(LinkTarget::Dispatcher { guest_pc: 0x8000_3100, dispatcher: DISPATCHER })
        );
    }

    #[rstest]
    #[case(SITE + 0x4000, false)]
    #[case(SITE - 0x4000, false)]
    #[case(SITE + (1usize << 30), true)]
    fn test_plain_branch(#[case] target: usize, #[case] indirect: bool) {
        let backend = Arm64Backend::new();
        let bytes = backend.encode_link(&site(LinkKind::Jump), Some(&dest(target)), DISPATCHER);
        assert_eq!(
            backend.decode_link(SITE, &bytes),
            Some(LinkTarget::Jump { host: target, indirect })
        );
    }

    #[test]
    fn test_call_layout() {
        let backend = Arm64Backend::new();
        let d = dest(SITE + 0x800);
        let bytes = backend.encode_link(&site(LinkKind::Call), Some(&d), DISPATCHER);
        let w = words(&bytes);
        assert_eq!(w[0], ldr_w_state(17, PpcState::offset_of_downcount()));
        assert_eq!(w[1], 0x7100_023F);
        // b.gt lands exactly on the bl.
        assert_eq!(w[2], 0x5400_00AC);
        assert_eq!(8 + 5 * 4, CALL_OFFSET);
        assert_eq!(w[7] & 0xFC00_0000, 0x9400_0000);
        assert_eq!(
            backend.decode_link(SITE, &bytes),
            Some(LinkTarget::BudgetedCall { checked: d.checked_entry, normal: d.normal_entry })
        );
    }

    #[test]
    fn test_call_with_far_checked_entry() {
        let backend = Arm64Backend::new();
        let d = LinkDestination { checked_entry: SITE + (1usize << 30), normal_entry: SITE + 0x40 };
        let bytes = backend.encode_link(&site(LinkKind::Call), Some(&d), DISPATCHER);
        assert_eq!(words(&bytes)[3], 0x5800_0050);
        assert_eq!(
            backend.decode_link(SITE, &bytes),
            Some(LinkTarget::BudgetedCall { checked: d.checked_entry, normal: d.normal_entry })
        );
    }

    #[test]
    fn test_call_out_of_range_degrades_to_jump() {
        let backend = Arm64Backend::new();
        let d = dest(SITE + (1usize << 30));
        let bytes = backend.encode_link(&site(LinkKind::Call), Some(&d), DISPATCHER);
        assert_eq!(
            backend.decode_link(SITE, &bytes),
            Some(LinkTarget::Jump { host: d.checked_entry, indirect: true })
        );
    }

    #[test]
    fn test_trap_fill() {
        let backend = Arm64Backend::new();
        let mut bytes = backend.encode_link(&site(LinkKind::Jump), None, DISPATCHER);
        backend.fill_trap(&mut bytes);
        assert!(backend.is_trap(&bytes));
        assert_eq!(words(&bytes), vec![0xD420_2460; 8]);
        assert_eq!(backend.decode_link(SITE, &bytes), Some(LinkTarget::Trap));
    }

    #[test]
    fn test_checked_entry_falls_through_to_normal_entry() {
        let backend = Arm64Backend::new();
        let mut buf = vec![0u8; 64];
        let base = 0x2000_0000;
        let mut code = CodeWriter::new(&mut buf, base);
        backend.emit_checked_entry(&mut code, 0x8000_0100, base - 0x100);
        let normal = code.address();
        let bytes = code.written().to_vec();
        let w = words(&bytes);

        assert_eq!(normal - base, 24);
        // b.gt at +8 skips itself and the three-word exit.
        assert_eq!(w[2], 0x5400_008C);
        assert_eq!(decode_mov_dispatcher_pc(&bytes[12..]), Some(0x8000_0100));
        assert_eq!(decode_jump(base + 20, &bytes[20..]), Some((base - 0x100, false)));
    }

    #[test]
    fn test_dispatcher_routines_restore_the_frame() {
        let backend = Arm64Backend::new();
        let mut buf = vec![0u8; 256];
        let base = 0x3000_0004;
        let mut code = CodeWriter::new(&mut buf, base);
        let routines = backend.emit_dispatcher_routines(&mut code);
        assert!(!code.has_write_failed());
        assert_eq!(routines.enter, 0x3000_0010);
        assert_eq!(routines.dispatcher % 16, 0);
        let bytes = code.written();
        assert!(backend.is_trap(&bytes[..routines.enter - base]));

        let enter = words(&bytes[routines.enter - base..routines.dispatcher - base]);
        // stp x29, x30, [sp, #-160]!
        assert_eq!(enter[0], 0xA9B6_7BFD);
        // br x1
        assert!(enter.contains(&0xD61F_0020));

        let dispatcher = words(&bytes[routines.dispatcher - base..]);
        // ldr x16, [x29, #host_sp]; mov sp, x16
        let host_sp = PpcState::offset_of_host_sp() as u32;
        assert_eq!(dispatcher[0], 0xF940_0000 | ((host_sp / 8) << 10) | (29 << 5) | 16);
        assert_eq!(dispatcher[1], 0x9100_021F);
        // ldp x29, x30, [sp], #160 ; ret
        let ret = dispatcher.iter().position(|&w| w == RET);
        assert_eq!(ret.map(|i| dispatcher[i - 1]), Some(0xA8CA_7BFD));
    }

    #[test]
    fn test_downcount_sub() {
        let backend = Arm64Backend::new();
        let mut buf = vec![0u8; 16];
        let mut code = CodeWriter::new(&mut buf, 0);
        backend.emit_downcount_sub(&mut code, 3);
        let w = words(code.written());
        let dc = PpcState::offset_of_downcount();
        assert_eq!(w[0], ldr_w_state(17, dc));
        // sub w17, w17, #3
        assert_eq!(w[1], 0x5100_0E31);
        assert_eq!(w[2], ldr_w_state(17, dc) & !0x0040_0000);
    }

    #[test]
    fn test_load_store_emission() {
        let backend = Arm64Backend::new();
        let mut buf = vec![0u8; 16];
        let mut code = CodeWriter::new(&mut buf, 0);
        backend.emit_load(&mut code, HostReg::Gpr(19), PpcState::gpr_slot(1));
        backend.emit_store(&mut code, HostReg::Fpr(8), PpcState::fpr_slot(2));
        let w = words(code.written());
        assert_eq!(w[0], ldr_w_state(19, PpcState::offset_of_gpr(1)));
        assert_eq!(w[1], 0x3D80_0000 | (2 << 10) | (29 << 5) | 8);
    }

    #[test]
    #[should_panic(expected = "Cannot store")]
    fn test_mismatched_slot_panics() {
        let backend = Arm64Backend::new();
        let mut buf = vec![0u8; 16];
        let mut code = CodeWriter::new(&mut buf, 0);
        backend.emit_store(&mut code, HostReg::Gpr(19), PpcState::fpr_slot(0));
    }

    #[test]
    fn test_flush_icache_accepts_any_buffer() {
        let backend = Arm64Backend::new();
        backend.flush_icache(&[]);
        backend.flush_icache(&[0u8; 64]);
    }
}
