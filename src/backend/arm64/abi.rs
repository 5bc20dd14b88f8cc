use crate::backend::hostloc::HostReg;

/// Points at `PpcState` while guest code runs.
pub const STATE_REG: u8 = 29;
/// Guest pc handed to the dispatcher.
pub const DISPATCHER_PC: u8 = 25;
/// Intra-procedure-call scratch registers. Link slots clobber both.
pub const IP0: u8 = 16;
pub const IP1: u8 = 17;
pub const LINK_REG: u8 = 30;
/// Zero register / stack pointer encoding.
pub const ZR: u8 = 31;

/// Callee-saved registers first, then caller-saved ones.
pub const GPR_ALLOCATION_ORDER: &[HostReg] = &[
    HostReg::Gpr(19),
    HostReg::Gpr(20),
    HostReg::Gpr(21),
    HostReg::Gpr(22),
    HostReg::Gpr(23),
    HostReg::Gpr(24),
    HostReg::Gpr(26),
    HostReg::Gpr(27),
    HostReg::Gpr(28),
    HostReg::Gpr(1),
    HostReg::Gpr(2),
    HostReg::Gpr(3),
    HostReg::Gpr(4),
    HostReg::Gpr(5),
    HostReg::Gpr(6),
    HostReg::Gpr(7),
    HostReg::Gpr(8),
    HostReg::Gpr(9),
    HostReg::Gpr(10),
    HostReg::Gpr(11),
    HostReg::Gpr(12),
    HostReg::Gpr(13),
    HostReg::Gpr(14),
    HostReg::Gpr(15),
];

/// Q0 and Q1 are scratch.
pub const FPR_ALLOCATION_ORDER: &[HostReg] = &[
    HostReg::Fpr(8),
    HostReg::Fpr(9),
    HostReg::Fpr(10),
    HostReg::Fpr(11),
    HostReg::Fpr(12),
    HostReg::Fpr(13),
    HostReg::Fpr(14),
    HostReg::Fpr(15),
    HostReg::Fpr(16),
    HostReg::Fpr(17),
    HostReg::Fpr(18),
    HostReg::Fpr(19),
    HostReg::Fpr(20),
    HostReg::Fpr(21),
    HostReg::Fpr(22),
    HostReg::Fpr(23),
    HostReg::Fpr(24),
    HostReg::Fpr(25),
    HostReg::Fpr(26),
    HostReg::Fpr(27),
    HostReg::Fpr(28),
    HostReg::Fpr(29),
    HostReg::Fpr(30),
    HostReg::Fpr(31),
    HostReg::Fpr(2),
    HostReg::Fpr(3),
    HostReg::Fpr(4),
    HostReg::Fpr(5),
    HostReg::Fpr(6),
    HostReg::Fpr(7),
];
