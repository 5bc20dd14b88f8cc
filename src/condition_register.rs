//! Lazily-encoded guest condition register.
//!
//! Each of the eight 4-bit fields is kept as a 64-bit value from which the flags are derived:
//!
//! * SO is bit 59.
//! * LT is bit 62.
//! * EQ holds iff the low 32 bits are zero.
//! * GT holds iff the value, read as `i64`, is greater than zero.
//!
//! A sign-extended subtract result already satisfies LT/EQ/GT, and generated code branches on a
//! field with a single compare or bit test.

use std::fmt;

pub const CR_SO: u32 = 0x1;
pub const CR_EQ: u32 = 0x2;
pub const CR_GT: u32 = 0x4;
pub const CR_LT: u32 = 0x8;

/// Bit position of SO inside a field value.
pub const CR_EMU_SO_BIT: u32 = 59;
/// Bit position of LT inside a field value.
pub const CR_EMU_LT_BIT: u32 = 62;

const fn ppc_cr_to_internal(nibble: u32) -> u64 {
    let mut value = 0x1_0000_0000u64;
    value |= ((nibble & CR_SO != 0) as u64) << CR_EMU_SO_BIT;
    value |= (nibble & CR_EQ == 0) as u64;
    value |= ((nibble & CR_GT == 0) as u64) << 63;
    value |= ((nibble & CR_LT != 0) as u64) << CR_EMU_LT_BIT;
    value
}

const fn build_canonical() -> [u64; 16] {
    let mut table = [0u64; 16];
    let mut i = 0;
    while i < 16 {
        table[i] = ppc_cr_to_internal(i as u32);
        i += 1;
    }
    table
}

/// Canonical field value for every guest nibble.
pub static CR_CANONICAL: [u64; 16] = build_canonical();

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(C)]
pub struct ConditionRegister {
    fields: [u64; 8],
}

impl ConditionRegister {
    pub const fn new() -> Self {
        Self { fields: [ppc_cr_to_internal(0); 8] }
    }

    /// Byte offset of field `i`, for generated code addressing the register in place.
    pub const fn offset_of_field(i: usize) -> usize {
        core::mem::offset_of!(ConditionRegister, fields) + i * core::mem::size_of::<u64>()
    }

    #[inline]
    pub fn set_field(&mut self, i: usize, nibble: u32) {
        self.fields[i] = CR_CANONICAL[(nibble & 0xF) as usize];
    }

    #[inline]
    pub fn get_field(&self, i: usize) -> u32 {
        let value = self.fields[i];
        let mut nibble = ((value >> CR_EMU_SO_BIT) & 1) as u32;
        nibble |= ((value as u32 == 0) as u32) << 1;
        nibble |= ((value as i64 > 0) as u32) << 2;
        nibble |= (((value >> CR_EMU_LT_BIT) & 1) as u32) << 3;
        nibble
    }

    /// Raw encoded value of field `i` as generated code stores it.
    #[inline]
    pub fn field_raw(&self, i: usize) -> u64 {
        self.fields[i]
    }

    #[inline]
    pub fn set_field_raw(&mut self, i: usize, value: u64) {
        self.fields[i] = value;
    }

    /// `bit` counts from the most significant bit of the packed register (0 = CR0[LT]).
    pub fn get_bit(&self, bit: u32) -> u32 {
        (self.get_field((bit >> 2) as usize) >> (3 - (bit & 3))) & 1
    }

    pub fn set_bit(&mut self, bit: u32, value: u32) {
        let field = (bit >> 2) as usize;
        let mask = 0x8 >> (bit & 3);
        let nibble = self.get_field(field);
        if value & 1 != 0 {
            self.set_field(field, nibble | mask);
        } else {
            self.set_field(field, nibble & !mask);
        }
    }

    /// Pack all fields into the 32-bit architectural form. Slow; not for generated code.
    pub fn get(&self) -> u32 {
        (0..8).fold(0, |cr, i| cr | (self.get_field(i) << (28 - i * 4)))
    }

    /// Unpack the 32-bit architectural form. Slow; not for generated code.
    pub fn set(&mut self, cr: u32) {
        for i in 0..8 {
            self.set_field(i, (cr >> (28 - i * 4)) & 0xF);
        }
    }
}

impl Default for ConditionRegister {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConditionRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConditionRegister({:#010x})", self.get())
    }
}

impl fmt::Display for ConditionRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.get())
    }
}
