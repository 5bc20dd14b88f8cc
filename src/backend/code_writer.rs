/// Sequential emitter over a window of writable code memory.
///
/// Running past the end of the window does not panic: the write is dropped and the writer
/// remembers the failure, so a whole block can be emitted before the caller decides to
/// flush the code cache and retry.
pub struct CodeWriter<'a> {
    buf: &'a mut [u8],
    base: usize,
    pos: usize,
    write_failed: bool,
}

impl<'a> CodeWriter<'a> {
    /// `base` is the host address of `buf[0]`.
    pub fn new(buf: &'a mut [u8], base: usize) -> Self {
        Self { buf, base, pos: 0, write_failed: false }
    }

    /// Host address of the next byte to be written.
    #[inline]
    pub fn address(&self) -> usize {
        self.base + self.pos
    }

    pub fn start_address(&self) -> usize {
        self.base
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn has_write_failed(&self) -> bool {
        self.write_failed
    }

    pub fn put(&mut self, bytes: &[u8]) {
        if self.write_failed || bytes.len() > self.remaining() {
            self.write_failed = true;
            return;
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    pub fn put_u8(&mut self, value: u8) {
        self.put(&[value]);
    }

    pub fn put_u32_le(&mut self, value: u32) {
        self.put(&value.to_le_bytes());
    }

    pub fn put_u64_le(&mut self, value: u64) {
        self.put(&value.to_le_bytes());
    }

    /// Pad with `fill` until the address is a multiple of `alignment` (a power of two).
    pub fn align(&mut self, alignment: usize, fill: &[u8]) {
        debug_assert!(alignment.is_power_of_two());
        while self.address() & (alignment - 1) != 0 && !self.write_failed {
            let gap = alignment - (self.address() & (alignment - 1));
            let chunk = &fill[..fill.len().min(gap)];
            self.put(chunk);
        }
    }

    /// Bytes written so far.
    pub fn written(&self) -> &[u8] {
        &self.buf[..self.pos]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_advances() {
        let mut buf = [0u8; 16];
        let mut w = CodeWriter::new(&mut buf, 0x4000);
        w.put_u8(0xC3);
        w.put_u32_le(0xDEAD_BEEF);
        assert_eq!(w.address(), 0x4005);
        assert_eq!(w.written(), &[0xC3, 0xEF, 0xBE, 0xAD, 0xDE]);
        assert!(!w.has_write_failed());
    }

    #[test]
    fn test_overflow_sets_flag_and_stops() {
        let mut buf = [0u8; 4];
        let mut w = CodeWriter::new(&mut buf, 0);
        w.put(&[1, 2, 3]);
        w.put(&[4, 5]);
        assert!(w.has_write_failed());
        w.put_u8(6);
        assert_eq!(w.offset(), 3);
        assert_eq!(buf, [1, 2, 3, 0]);
    }

    #[test]
    fn test_align() {
        let mut buf = [0u8; 16];
        let mut w = CodeWriter::new(&mut buf, 0x1001);
        w.align(4, &[0xCC]);
        assert_eq!(w.address(), 0x1004);
        assert_eq!(w.written(), &[0xCC, 0xCC, 0xCC]);

        let mut buf = [0u8; 16];
        let mut w = CodeWriter::new(&mut buf, 0x2000);
        w.align(16, &[0xCC]);
        assert_eq!(w.offset(), 0);
    }
}
