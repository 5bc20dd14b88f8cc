use crate::backend::hostloc::HostReg;

// Hardware numbers of the x86-64 GPRs.
pub const RAX: u8 = 0;
pub const RCX: u8 = 1;
pub const RDX: u8 = 2;
pub const RBX: u8 = 3;
pub const RSP: u8 = 4;
pub const RBP: u8 = 5;
pub const RSI: u8 = 6;
pub const RDI: u8 = 7;
pub const R8: u8 = 8;
pub const R9: u8 = 9;
pub const R10: u8 = 10;
pub const R11: u8 = 11;
pub const R12: u8 = 12;
pub const R13: u8 = 13;
pub const R14: u8 = 14;
pub const R15: u8 = 15;

/// Points at `PpcState` while guest code runs.
pub const STATE_REG: u8 = RBP;
/// Guest pc handed to the dispatcher.
pub const DISPATCHER_PC: u8 = RSI;
/// Clobbered by indirect jumps in link slots.
pub const SCRATCH1: u8 = RAX;
pub const SCRATCH2: u8 = RDX;

/// Guest GPRs are bound to these in order. Callee-saved registers come first so host
/// calls from generated code spill less.
pub const GPR_ALLOCATION_ORDER: &[HostReg] = &[
    HostReg::Gpr(RBX),
    HostReg::Gpr(RDI),
    HostReg::Gpr(R12),
    HostReg::Gpr(R13),
    HostReg::Gpr(R14),
    HostReg::Gpr(R15),
    HostReg::Gpr(R8),
    HostReg::Gpr(R9),
    HostReg::Gpr(R10),
    HostReg::Gpr(R11),
    HostReg::Gpr(RCX),
];

/// XMM0 and XMM1 are scratch.
pub const FPR_ALLOCATION_ORDER: &[HostReg] = &[
    HostReg::Fpr(6),
    HostReg::Fpr(7),
    HostReg::Fpr(8),
    HostReg::Fpr(9),
    HostReg::Fpr(10),
    HostReg::Fpr(11),
    HostReg::Fpr(12),
    HostReg::Fpr(13),
    HostReg::Fpr(14),
    HostReg::Fpr(15),
    HostReg::Fpr(2),
    HostReg::Fpr(3),
    HostReg::Fpr(4),
    HostReg::Fpr(5),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_registers_not_allocatable() {
        for reserved in [RSP, STATE_REG, DISPATCHER_PC, SCRATCH1, SCRATCH2] {
            assert!(
                !GPR_ALLOCATION_ORDER.contains(&HostReg::Gpr(reserved)),
                "Register {} is reserved",
                reserved
            );
        }
        assert!(!FPR_ALLOCATION_ORDER.contains(&HostReg::Fpr(0)));
        assert!(!FPR_ALLOCATION_ORDER.contains(&HostReg::Fpr(1)));
    }

    #[test]
    fn test_allocation_orders_have_no_duplicates() {
        for order in [GPR_ALLOCATION_ORDER, FPR_ALLOCATION_ORDER] {
            let mut sorted = order.to_vec();
            sorted.sort();
            sorted.dedup();
            assert_eq!(sorted.len(), order.len());
        }
    }
}
