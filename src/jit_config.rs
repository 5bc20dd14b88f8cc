use bitflags::bitflags;

use crate::backend::HostArch;
use crate::error::{JitError, Result};

bitflags! {
    /// Runtime features of the block cache that can be switched off for debugging.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct JitOptimizations: u32 {
        /// Patch exits of compiled blocks to jump straight into their destination.
        const BLOCK_LINKING     = 1 << 0;
        /// Consult the direct-mapped lookup table before the block map.
        const FAST_BLOCK_LOOKUP = 1 << 1;
        /// Allow call-type exits to enter the normal entry behind a budget check.
        const CALL_LINKING      = 1 << 2;
    }
}

impl Default for JitOptimizations {
    fn default() -> Self {
        Self::all()
    }
}

/// Configuration for creating a [`Jit`](crate::Jit) instance.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JitConfig {
    /// Host instruction set the generated code targets.
    pub host_arch: HostArch,
    /// Size of the hot-path code region in bytes.
    pub near_code_size: usize,
    /// Size of the cold-path code region in bytes.
    pub far_code_size: usize,
    /// Bytes reserved ahead of the regions for dispatcher routines.
    pub routines_size: usize,
    /// How many upcoming instructions the register allocator inspects when picking a spill victim.
    pub regalloc_lookahead: usize,
    /// Model the guest L1 instruction cache. When false every fetch reads memory directly.
    pub enable_icache: bool,
    pub optimizations: JitOptimizations,
}

impl JitConfig {
    /// Default near code size: 32 MB.
    pub const DEFAULT_NEAR_CODE_SIZE: usize = 32 * 1024 * 1024;
    /// Default far code size: 16 MB.
    pub const DEFAULT_FAR_CODE_SIZE: usize = 16 * 1024 * 1024;
    pub const DEFAULT_ROUTINES_SIZE: usize = 4096;
    pub const DEFAULT_REGALLOC_LOOKAHEAD: usize = 64;

    /// Smallest region that can hold a block prologue plus one exit.
    pub const MIN_REGION_SIZE: usize = 256;

    pub fn has_optimization(&self, flag: JitOptimizations) -> bool {
        self.optimizations.contains(flag)
    }

    /// Total arena size: routines, then near code, then far code.
    pub fn arena_size(&self) -> usize {
        self.routines_size + self.near_code_size + self.far_code_size
    }

    /// Reject layouts the selected backend cannot address with its direct branches.
    pub fn validate(&self) -> Result<()> {
        if self.near_code_size < Self::MIN_REGION_SIZE
            || self.far_code_size < Self::MIN_REGION_SIZE
        {
            return Err(JitError::InvalidConfig(format!(
                "code regions must be at least {} bytes (near={}, far={})",
                Self::MIN_REGION_SIZE,
                self.near_code_size,
                self.far_code_size
            )));
        }
        if self.routines_size < Self::MIN_REGION_SIZE {
            return Err(JitError::InvalidConfig(format!(
                "routines area too small: {} bytes",
                self.routines_size
            )));
        }
        let reach = self.host_arch.direct_branch_reach();
        if self.arena_size() > reach {
            return Err(JitError::InvalidConfig(format!(
                "{:?} arena of {} bytes exceeds direct branch reach of {} bytes",
                self.host_arch,
                self.arena_size(),
                reach
            )));
        }
        Ok(())
    }
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            host_arch: HostArch::native(),
            near_code_size: Self::DEFAULT_NEAR_CODE_SIZE,
            far_code_size: Self::DEFAULT_FAR_CODE_SIZE,
            routines_size: Self::DEFAULT_ROUTINES_SIZE,
            regalloc_lookahead: Self::DEFAULT_REGALLOC_LOOKAHEAD,
            enable_icache: true,
            optimizations: JitOptimizations::default(),
        }
    }
}
