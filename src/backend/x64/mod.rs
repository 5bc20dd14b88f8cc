pub mod abi;
pub mod emit;

use crate::backend::code_writer::CodeWriter;
use crate::backend::hostloc::{HostReg, SlotWidth, StateSlot};
use crate::backend::patch_info::{LinkDestination, LinkKind, LinkSite, LinkTarget};
use crate::backend::{DispatcherRoutines, HostArch, HostBackend};

use self::emit::*;

/// Every link slot is this long so any form can replace any other in place.
///
/// Longest form is the budgeted call: budget check (at most 16) + indirect jump (12) + `call` (5).
pub const LINK_SIZE: usize = CALL_OFFSET + REL32_LEN;
/// The `call` of a budgeted call always sits at the end of the slot, so the return address
/// is the first byte after it.
pub const CALL_OFFSET: usize = MAX_BUDGET_CHECK_LEN + INDIRECT_JUMP_LEN;

#[derive(Debug, Default, Clone, Copy)]
pub struct X64Backend;

impl X64Backend {
    pub fn new() -> Self {
        Self
    }

    /// Pull the targets out of slot bytes without checking the rest of the slot.
    fn read_link(site_address: usize, bytes: &[u8]) -> Option<LinkTarget> {
        if bytes.get(CALL_OFFSET) == Some(&CALL_REL32) {
            let check = budget_check_len();
            let (checked, _) = decode_jump(site_address + check, &bytes[check..])?;
            let normal = decode_call(site_address + CALL_OFFSET, &bytes[CALL_OFFSET..])?;
            return Some(LinkTarget::BudgetedCall { checked, normal });
        }
        if let Some((host, indirect)) = decode_jump(site_address, bytes) {
            return Some(LinkTarget::Jump { host, indirect });
        }
        let guest_pc = decode_mov_dispatcher_pc(bytes)?;
        let mov_len = mov_dispatcher_pc_len();
        let (dispatcher, _) = decode_jump(site_address + mov_len, &bytes[mov_len..])?;
        Some(LinkTarget::Dispatcher { guest_pc, dispatcher })
    }
}

impl HostBackend for X64Backend {
    fn arch(&self) -> HostArch {
        HostArch::X64
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
                    && rel32(site.address + CALL_OFFSET, dest.normal_entry).is_some();
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
        let target = Self::read_link(site_address, bytes)?;
        let (kind, exit_address, destination, dispatcher) = match target {
            LinkTarget::Dispatcher { guest_pc, dispatcher } => {
                (LinkKind::Jump, guest_pc, None, dispatcher)
            }
            LinkTarget::BudgetedCall { checked, normal } => {
                let dest = LinkDestination { checked_entry: checked, normal_entry: normal };
                (LinkKind::Call, 0, Some(dest), 0)
            }
            LinkTarget::Jump { host, .. } => {
                let dest = LinkDestination { checked_entry: host, normal_entry: host };
                (LinkKind::Jump, 0, Some(dest), 0)
            }
            LinkTarget::Trap => return Some(target),
        };
        // Anything but the exact bytes this backend writes is not a slot.
        let site = LinkSite { address: site_address, exit_address, kind };
        (self.encode_link(&site, destination.as_ref(), dispatcher) == bytes).then_some(target)
    }

    fn fill_trap(&self, bytes: &mut [u8]) {
        bytes.fill(INT3);
    }

    fn is_trap(&self, bytes: &[u8]) -> bool {
        !bytes.is_empty() && bytes.iter().all(|&b| b == INT3)
    }

    fn emit_dispatcher_routines(&self, code: &mut CodeWriter<'_>) -> DispatcherRoutines {
        code.align(16, &[INT3]);
        let enter = code.address();
        let mut asm = Asm::new(enter);
        asm.enter_routine();
        code.put(&asm.finish());

        code.align(16, &[INT3]);
        let dispatcher = code.address();
        let mut asm = Asm::new(dispatcher);
        asm.dispatcher_routine();
        code.put(&asm.finish());
        code.align(16, &[INT3]);
        DispatcherRoutines { enter, dispatcher }
    }

    fn emit_checked_entry(&self, code: &mut CodeWriter<'_>, guest_pc: u32, dispatcher: usize) {
        let mut asm = Asm::new(code.address());
        asm.checked_entry(guest_pc, dispatcher);
        code.put(&asm.finish());
    }

    fn emit_downcount_sub(&self, code: &mut CodeWriter<'_>, cycles: u32) {
        let mut asm = Asm::new(code.address());
        asm.sub_downcount(cycles);
        code.put(&asm.finish());
    }

    fn emit_load(&self, code: &mut CodeWriter<'_>, reg: HostReg, slot: StateSlot) {
        let mut asm = Asm::new(code.address());
        match (reg, slot.width) {
            (HostReg::Gpr(r), SlotWidth::Word) => asm.load_gpr(r, slot.offset as usize),
            (HostReg::Fpr(x), SlotWidth::Quad) => asm.load_xmm(x, slot.offset as usize),
            _ => panic!("Cannot load {:?} slot into {:?}", slot.width, reg),
        }
        code.put(&asm.finish());
    }

    fn emit_store(&self, code: &mut CodeWriter<'_>, reg: HostReg, slot: StateSlot) {
        let mut asm = Asm::new(code.address());
        match (reg, slot.width) {
            (HostReg::Gpr(r), SlotWidth::Word) => asm.store_gpr(r, slot.offset as usize),
            (HostReg::Fpr(x), SlotWidth::Quad) => asm.store_xmm(x, slot.offset as usize),
            _ => panic!("Cannot store {:?} into {:?} slot", reg, slot.width),
        }
        code.put(&asm.finish());
    }

    fn gpr_allocation_order(&self) -> &'static [HostReg] {
        abi::GPR_ALLOCATION_ORDER
    }

    fn fpr_allocation_order(&self) -> &'static [HostReg] {
        abi::FPR_ALLOCATION_ORDER
    }

    /// x86-64 keeps instruction fetch coherent with stores.
    fn flush_icache(&self, _code: &[u8]) {}
}
