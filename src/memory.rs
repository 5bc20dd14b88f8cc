/// Guest physical memory as seen by instruction fetch and the block cache.
///
/// Reads are big-endian, matching the guest bus. Implementations must tolerate any 32-bit
/// address; unmapped ranges read as zero.
pub trait GuestMemory {
    fn read_u8(&self, address: u32) -> u8;

    fn write_u8(&mut self, address: u32, value: u8);

    fn read_u32(&self, address: u32) -> u32 {
        u32::from_be_bytes([
            self.read_u8(address),
            self.read_u8(address.wrapping_add(1)),
            self.read_u8(address.wrapping_add(2)),
            self.read_u8(address.wrapping_add(3)),
        ])
    }

    fn write_u32(&mut self, address: u32, value: u32) {
        for (i, byte) in value.to_be_bytes().into_iter().enumerate() {
            self.write_u8(address.wrapping_add(i as u32), byte);
        }
    }

    /// Copy `dst.len()` bytes starting at `address`. Used for 32-byte icache line fills.
    fn copy_from_guest(&self, address: u32, dst: &mut [u8]) {
        for (i, byte) in dst.iter_mut().enumerate() {
            *byte = self.read_u8(address.wrapping_add(i as u32));
        }
    }

    /// Translate an instruction effective address to the physical address used to key
    /// invalidation. `None` means the address does not map to RAM.
    fn translate_code_address(&self, address: u32) -> Option<u32> {
        Some(address)
    }
}

/// Contiguous RAM mirrored across the whole address space.
///
/// Address bits above the RAM size are ignored, so `0x8000_1000`, `0xC000_1000` and
/// `0x0000_1000` alias the same byte.
#[derive(Debug, Clone)]
pub struct FlatMemory {
    data: Vec<u8>,
    mask: u32,
}

impl FlatMemory {
    /// Main RAM size of the console: 24 MB, rounded up to a power of two for mirroring.
    pub const MAIN_RAM_SIZE: usize = 32 * 1024 * 1024;

    /// `size` is rounded up to the next power of two.
    pub fn new(size: usize) -> Self {
        let size = size.max(4).next_power_of_two();
        Self {
            data: vec![0; size],
            mask: (size - 1) as u32,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Copy big-endian words into memory starting at `address`.
    pub fn load_words(&mut self, address: u32, words: &[u32]) {
        for (i, &word) in words.iter().enumerate() {
            self.write_u32(address.wrapping_add(4 * i as u32), word);
        }
    }

    #[inline]
    fn index(&self, address: u32) -> usize {
        (address & self.mask) as usize
    }
}

impl Default for FlatMemory {
    fn default() -> Self {
        Self::new(Self::MAIN_RAM_SIZE)
    }
}

impl GuestMemory for FlatMemory {
    fn read_u8(&self, address: u32) -> u8 {
        self.data[self.index(address)]
    }

    fn write_u8(&mut self, address: u32, value: u8) {
        let index = self.index(address);
        self.data[index] = value;
    }

    fn copy_from_guest(&self, address: u32, dst: &mut [u8]) {
        let start = self.index(address);
        if start + dst.len() <= self.data.len() {
            dst.copy_from_slice(&self.data[start..start + dst.len()]);
        } else {
            for (i, byte) in dst.iter_mut().enumerate() {
                *byte = self.read_u8(address.wrapping_add(i as u32));
            }
        }
    }
}
