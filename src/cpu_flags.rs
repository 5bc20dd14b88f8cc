use bitflags::bitflags;

bitflags! {
    /// Hardware implementation register 0 bits that control the instruction cache.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Hid0: u32 {
        /// Instruction cache enable.
        const ICE   = 1 << 15;
        /// Instruction cache lock: misses bypass the cache without filling it.
        const ILOCK = 1 << 13;
        /// Instruction cache flash invalidate. Self-clearing.
        const ICFI  = 1 << 11;

        const _ = !0;
    }
}

bitflags! {
    /// Machine state register bits that change how a block must be compiled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct Msr: u32 {
        const PMM = 1 << 2;
        const DR  = 1 << 4;
        const IR  = 1 << 5;
        const FP  = 1 << 13;
        const EE  = 1 << 15;

        const _ = !0;
    }
}

bitflags! {
    /// Part of a block's identity besides its address. Blocks compiled under different
    /// feature flags never link to each other.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct FeatureFlags: u8 {
        const DATA_TRANSLATION        = 1 << 0;
        const INSTRUCTION_TRANSLATION = 1 << 1;
        const PERFMON                 = 1 << 2;
    }
}

impl Default for Hid0 {
    /// Reset value as left by the boot ROM: icache on, unlocked.
    fn default() -> Self {
        Self::ICE
    }
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl FeatureFlags {
    pub fn from_msr(msr: Msr) -> Self {
        let mut flags = Self::empty();
        flags.set(Self::DATA_TRANSLATION, msr.contains(Msr::DR));
        flags.set(Self::INSTRUCTION_TRANSLATION, msr.contains(Msr::IR));
        flags.set(Self::PERFMON, msr.contains(Msr::PMM));
        flags
    }
}
