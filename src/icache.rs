//! Model of the 32 KB, 8-way set associative L1 instruction cache.
//!
//! Titles depend on stale instruction fetches after writing code without `icbi`, so the model
//! keeps real line data. Hits are resolved through flat per-address-space lookup tables instead
//! of tag comparison.

use tracing::{info, trace};

use crate::cpu_flags::Hid0;
use crate::memory::GuestMemory;

pub const ICACHE_SETS: usize = 128;
pub const ICACHE_WAYS: usize = 8;
/// Line size in bytes.
pub const ICACHE_LINE_SIZE: usize = 32;

pub const ICACHE_EXRAM_BIT: u32 = 0x1000_0000;
pub const ICACHE_VMEM_BIT: u32 = 0x2000_0000;

/// Lookup table value for a line that is not resident.
const NOT_RESIDENT: u8 = 0xff;

const LOOKUP_SIZE: usize = 1 << 20;
const LOOKUP_EX_SIZE: usize = 1 << 21;
const LOOKUP_MASK: u32 = 0xfffff;
const LOOKUP_EX_MASK: u32 = 0x1fffff;

const PLRU_MASK: [u32; ICACHE_WAYS] = [11, 11, 19, 19, 37, 37, 69, 69];
const PLRU_VALUE: [u32; ICACHE_WAYS] = [11, 3, 17, 1, 36, 4, 64, 0];

type Line = [u8; ICACHE_LINE_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddressSpace {
    Normal,
    Extended,
    Virtual,
}

impl AddressSpace {
    /// Classifies by the address bits; a tag carries the same bits shifted down by 12.
    fn of_address(address: u32) -> Self {
        if address & ICACHE_VMEM_BIT != 0 {
            Self::Virtual
        } else if address & ICACHE_EXRAM_BIT != 0 {
            Self::Extended
        } else {
            Self::Normal
        }
    }

    fn of_tag(tag: u32) -> Self {
        Self::of_address(tag << 12)
    }
}

/// Victim selection tables, computed once per cache.
struct WayTables {
    from_valid: [u8; 255],
    from_plru: [u8; 128],
}

impl WayTables {
    fn new() -> Self {
        let mut from_valid = [0u8; 255];
        for (m, way) in from_valid.iter_mut().enumerate() {
            *way = (!m as u32).trailing_zeros() as u8;
        }

        let mut from_plru = [0u8; 128];
        for (m, way) in from_plru.iter_mut().enumerate() {
            let b = |k: usize| (m >> k) & 1 != 0;
            let pick = |bit: usize, hi: u8, lo: u8| if b(bit) { hi } else { lo };
            *way = match (b(0), b(1), b(2)) {
                (true, _, true) => pick(6, 7, 6),
                (true, _, false) => pick(5, 5, 4),
                (false, true, _) => pick(4, 3, 2),
                (false, false, _) => pick(3, 1, 0),
            };
        }

        Self { from_valid, from_plru }
    }
}

/// Tag, valid, PLRU and line data in the order they are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IcacheSnapshot {
    pub data: Vec<[Line; ICACHE_WAYS]>,
    pub tags: Vec<[u32; ICACHE_WAYS]>,
    pub plru: Vec<u32>,
    pub valid: Vec<u32>,
}

pub struct InstructionCache {
    data: Box<[[Line; ICACHE_WAYS]; ICACHE_SETS]>,
    tags: [[u32; ICACHE_WAYS]; ICACHE_SETS],
    plru: [u32; ICACHE_SETS],
    valid: [u32; ICACHE_SETS],
    lookup: Box<[u8]>,
    lookup_ex: Box<[u8]>,
    lookup_vmem: Box<[u8]>,
    ways: WayTables,
    enabled: bool,
}

impl InstructionCache {
    pub fn new(enabled: bool) -> Self {
        let mut cache = Self {
            data: Box::new([[[0; ICACHE_LINE_SIZE]; ICACHE_WAYS]; ICACHE_SETS]),
            tags: [[0; ICACHE_WAYS]; ICACHE_SETS],
            plru: [0; ICACHE_SETS],
            valid: [0; ICACHE_SETS],
            lookup: vec![NOT_RESIDENT; LOOKUP_SIZE].into_boxed_slice(),
            lookup_ex: vec![NOT_RESIDENT; LOOKUP_EX_SIZE].into_boxed_slice(),
            lookup_vmem: vec![NOT_RESIDENT; LOOKUP_SIZE].into_boxed_slice(),
            ways: WayTables::new(),
            enabled,
        };
        cache.reset();
        cache
    }

    /// Drop every resident line. Line data is left as is; it is unreachable without a valid bit.
    pub fn reset(&mut self) {
        self.valid.fill(0);
        self.plru.fill(0);
        self.lookup.fill(NOT_RESIDENT);
        self.lookup_ex.fill(NOT_RESIDENT);
        self.lookup_vmem.fill(NOT_RESIDENT);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Host-side switch. Turning the model off or on starts from an empty cache.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            self.enabled = enabled;
            self.reset();
        }
    }

    #[inline]
    fn is_active(&self, hid0: Hid0) -> bool {
        self.enabled && hid0.contains(Hid0::ICE)
    }

    #[inline]
    fn set_of(address: u32) -> usize {
        ((address >> 5) & 0x7f) as usize
    }

    fn lookup_slot(&mut self, space: AddressSpace, line_index: u32) -> &mut u8 {
        match space {
            AddressSpace::Virtual => &mut self.lookup_vmem[(line_index & LOOKUP_MASK) as usize],
            AddressSpace::Extended => &mut self.lookup_ex[(line_index & LOOKUP_EX_MASK) as usize],
            AddressSpace::Normal => &mut self.lookup[(line_index & LOOKUP_MASK) as usize],
        }
    }

    fn forget_way(&mut self, set: usize, way: usize) {
        let tag = self.tags[set][way];
        *self.lookup_slot(AddressSpace::of_tag(tag), (tag << 7) | set as u32) = NOT_RESIDENT;
    }

    /// Fetch the instruction word at `address` (word aligned) through the cache.
    pub fn read_instruction<M: GuestMemory + ?Sized>(
        &mut self,
        memory: &M,
        hid0: Hid0,
        address: u32,
    ) -> u32 {
        if !self.is_active(hid0) {
            return memory.read_u32(address);
        }

        let set = Self::set_of(address);
        let tag = address >> 12;
        let space = AddressSpace::of_address(address);
        let mut way = *self.lookup_slot(space, address >> 5);

        if way == NOT_RESIDENT {
            if hid0.contains(Hid0::ILOCK) {
                return memory.read_u32(address);
            }

            way = if self.valid[set] != 0xff {
                self.ways.from_valid[self.valid[set] as usize]
            } else {
                self.ways.from_plru[self.plru[set] as usize]
            };
            let w = way as usize;

            if self.valid[set] & (1 << w) != 0 {
                self.forget_way(set, w);
            }
            memory.copy_from_guest(address & !0x1f, &mut self.data[set][w]);
            *self.lookup_slot(space, address >> 5) = way;
            self.tags[set][w] = tag;
            self.valid[set] |= 1 << w;
            trace!(set, way, "icache fill at {address:#010x}");
        } else {
            assert!(
                self.valid[set] & (1 << way) != 0,
                "icache lookup for {address:#010x} points at invalid way {way} of set {set}"
            );
        }

        let w = way as usize;
        self.plru[set] = (self.plru[set] & !PLRU_MASK[w]) | PLRU_VALUE[w];

        let offset = (address as usize) & 0x1c;
        let line = &self.data[set][w];
        let cached = u32::from_be_bytes([
            line[offset],
            line[offset + 1],
            line[offset + 2],
            line[offset + 3],
        ]);
        let in_memory = memory.read_u32(address);
        if cached != in_memory {
            info!(
                "ICache read at {:08x} returned stale data: CACHED: {:08x} vs. RAM: {:08x}",
                address, cached, in_memory
            );
        }
        cached
    }

    /// Invalidate the whole set holding `address`, as `icbi` does on hardware.
    ///
    /// Only touches the cache model; the caller is responsible for invalidating compiled code.
    pub fn invalidate(&mut self, hid0: Hid0, address: u32) {
        if !self.is_active(hid0) {
            return;
        }

        let set = Self::set_of(address);
        for way in 0..ICACHE_WAYS {
            if self.valid[set] & (1 << way) != 0 {
                self.forget_way(set, way);
            }
        }
        self.valid[set] = 0;
        trace!(set, "icache set invalidated by {address:#010x}");
    }

    /// Way currently holding `address`, if resident.
    pub fn resident_way(&self, address: u32) -> Option<usize> {
        let index = address >> 5;
        let way = match AddressSpace::of_address(address) {
            AddressSpace::Virtual => self.lookup_vmem[(index & LOOKUP_MASK) as usize],
            AddressSpace::Extended => self.lookup_ex[(index & LOOKUP_EX_MASK) as usize],
            AddressSpace::Normal => self.lookup[(index & LOOKUP_MASK) as usize],
        };
        (way != NOT_RESIDENT).then_some(way as usize)
    }

    /// Way that the next miss in the set holding `address` would replace.
    pub fn next_victim(&self, address: u32) -> usize {
        let set = Self::set_of(address);
        if self.valid[set] != 0xff {
            self.ways.from_valid[self.valid[set] as usize] as usize
        } else {
            self.ways.from_plru[self.plru[set] as usize] as usize
        }
    }

    pub fn snapshot(&self) -> IcacheSnapshot {
        IcacheSnapshot {
            data: self.data.to_vec(),
            tags: self.tags.to_vec(),
            plru: self.plru.to_vec(),
            valid: self.valid.to_vec(),
        }
    }

    /// Restore persisted state and rebuild the lookup tables from the valid tags.
    ///
    /// Valid masks are cut to one bit per way and PLRU state to its seven tree bits.
    ///
    /// # Panics
    ///
    /// If any array in `snapshot` does not have one entry per set.
    pub fn restore(&mut self, snapshot: &IcacheSnapshot) {
        assert!(
            snapshot.data.len() == ICACHE_SETS
                && snapshot.tags.len() == ICACHE_SETS
                && snapshot.plru.len() == ICACHE_SETS
                && snapshot.valid.len() == ICACHE_SETS,
            "icache snapshot must hold {ICACHE_SETS} sets"
        );
        self.data.copy_from_slice(&snapshot.data);
        self.tags.copy_from_slice(&snapshot.tags);
        for (plru, &saved) in self.plru.iter_mut().zip(&snapshot.plru) {
            *plru = saved & 0x7f;
        }
        for (valid, &saved) in self.valid.iter_mut().zip(&snapshot.valid) {
            *valid = saved & 0xff;
        }

        self.lookup.fill(NOT_RESIDENT);
        self.lookup_ex.fill(NOT_RESIDENT);
        self.lookup_vmem.fill(NOT_RESIDENT);
        for set in 0..ICACHE_SETS {
            for way in 0..ICACHE_WAYS {
                if self.valid[set] & (1 << way) != 0 {
                    let tag = self.tags[set][way];
                    let slot = (tag << 7) | set as u32;
                    *self.lookup_slot(AddressSpace::of_tag(tag), slot) = way as u8;
                }
            }
        }
    }
}

impl Default for InstructionCache {
    fn default() -> Self {
        Self::new(true)
    }
}
