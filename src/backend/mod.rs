pub mod arm64;
pub mod block_cache;
pub mod block_of_code;
pub mod code_writer;
pub mod hostloc;
pub mod jit_state;
pub mod patch_info;
pub mod reg_alloc;
pub mod x64;

use self::code_writer::CodeWriter;
use self::hostloc::{HostReg, StateSlot};
use self::patch_info::{LinkDestination, LinkSite, LinkTarget};
use self::reg_alloc::RegEmitter;

/// Host instruction set generated code targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum HostArch {
    X64,
    Arm64,
}

impl HostArch {
    /// Architecture of the machine this crate was built for. Anything other than AArch64
    /// falls back to x86-64 encodings.
    pub const fn native() -> Self {
        if cfg!(target_arch = "aarch64") {
            HostArch::Arm64
        } else {
            HostArch::X64
        }
    }

    /// Largest arena in which any two addresses are reachable with a direct branch.
    pub const fn direct_branch_reach(self) -> usize {
        match self {
            HostArch::X64 => i32::MAX as usize,
            HostArch::Arm64 => 128 * 1024 * 1024,
        }
    }
}

/// Host addresses of the shared routines emitted once at the start of the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherRoutines {
    /// Host-to-guest transition: `fn(state: *mut PpcState, entry: usize) -> u32` in the host C
    /// calling convention. Records the host stack pointer in the state before jumping to
    /// `entry`.
    pub enter: usize,
    /// Entered with the guest pc in the dispatcher register whenever a block exits to an
    /// address that has no linked code. Resets the stack to the one saved by `enter`, stores
    /// the pc and returns it to the caller of `enter`.
    pub dispatcher: usize,
}

/// Everything the block cache and register allocator need from a host instruction set.
///
/// Implementations are stateless encoders: they never own code memory, they only produce
/// or inspect bytes at given host addresses.
pub trait HostBackend: Send + Sync {
    fn arch(&self) -> HostArch;

    /// Size of every link slot. Any link form fits, so slots are rewritten in place.
    fn link_size(&self) -> usize;

    /// Bytes for the slot at `site`. `None` routes the exit through the dispatcher.
    fn encode_link(
        &self,
        site: &LinkSite,
        destination: Option<&LinkDestination>,
        dispatcher: usize,
    ) -> Vec<u8>;

    /// Inverse of [`encode_link`](Self::encode_link) for slot bytes located at `site_address`.
    fn decode_link(&self, site_address: usize, bytes: &[u8]) -> Option<LinkTarget>;

    /// Poison `bytes` so that executing any instruction-aligned offset faults.
    fn fill_trap(&self, bytes: &mut [u8]);

    fn is_trap(&self, bytes: &[u8]) -> bool;

    fn emit_dispatcher_routines(&self, code: &mut CodeWriter<'_>) -> DispatcherRoutines;

    /// Budget check at the start of a block: exits to the dispatcher with `guest_pc` once the
    /// downcount is exhausted, otherwise falls through to the normal entry.
    fn emit_checked_entry(&self, code: &mut CodeWriter<'_>, guest_pc: u32, dispatcher: usize);

    /// Subtract `cycles` from the downcount.
    fn emit_downcount_sub(&self, code: &mut CodeWriter<'_>, cycles: u32);

    fn emit_load(&self, code: &mut CodeWriter<'_>, reg: HostReg, slot: StateSlot);

    fn emit_store(&self, code: &mut CodeWriter<'_>, reg: HostReg, slot: StateSlot);

    fn gpr_allocation_order(&self) -> &'static [HostReg];

    fn fpr_allocation_order(&self) -> &'static [HostReg];

    /// Make freshly written bytes visible to instruction fetch.
    fn flush_icache(&self, code: &[u8]);
}

pub fn create_backend(arch: HostArch) -> Box<dyn HostBackend> {
    match arch {
        HostArch::X64 => Box::new(x64::X64Backend::new()),
        HostArch::Arm64 => Box::new(arm64::Arm64Backend::new()),
    }
}

/// Routes register-allocator loads and stores into a code writer through a backend.
pub struct BackendEmitter<'e, 'c> {
    pub backend: &'e dyn HostBackend,
    pub code: &'e mut CodeWriter<'c>,
}

impl<'e, 'c> BackendEmitter<'e, 'c> {
    pub fn new(backend: &'e dyn HostBackend, code: &'e mut CodeWriter<'c>) -> Self {
        Self { backend, code }
    }
}

impl RegEmitter for BackendEmitter<'_, '_> {
    fn emit_load(&mut self, reg: HostReg, slot: StateSlot) {
        self.backend.emit_load(self.code, reg, slot);
    }

    fn emit_store(&mut self, reg: HostReg, slot: StateSlot) {
        self.backend.emit_store(self.code, reg, slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::jit_state::PpcState;
    use rstest::rstest;

    #[rstest]
    #[case(HostArch::X64, 33)]
    #[case(HostArch::Arm64, 32)]
    fn test_create_backend(#[case] arch: HostArch, #[case] link_size: usize) {
        let backend = create_backend(arch);
        assert_eq!(backend.arch(), arch);
        assert_eq!(backend.link_size(), link_size);
    }

    #[test]
    fn test_branch_reach() {
        assert!(HostArch::X64.direct_branch_reach() > HostArch::Arm64.direct_branch_reach());
        assert_eq!(HostArch::Arm64.direct_branch_reach(), 1 << 27);
    }

    #[test]
    fn test_backend_emitter_writes_through() {
        let backend = create_backend(HostArch::Arm64);
        let mut buf = [0u8; 8];
        let mut code = CodeWriter::new(&mut buf, 0);
        {
            let mut emitter = BackendEmitter::new(backend.as_ref(), &mut code);
            emitter.emit_load(HostReg::Gpr(19), PpcState::gpr_slot(0));
            emitter.emit_store(HostReg::Gpr(19), PpcState::gpr_slot(0));
        }
        assert_eq!(code.offset(), 8);
        assert!(!code.has_write_failed());
    }
}
