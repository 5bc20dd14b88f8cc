//! Executable memory arena shared by every compiled block.
//!
//! The arena is one mapping laid out as `[routines | near code | far code]`. Pages are
//! writable or executable, never both: every write goes through [`CodeArena::patch`], which
//! flips protection, runs the caller, flips it back and flushes the host icache for whatever
//! the caller touched.

use std::collections::BTreeMap;
use std::io;
use std::ops::Range;

use dynasmrt::mmap::{ExecutableBuffer, MutableBuffer};
use tracing::{debug, trace};

use crate::backend::code_writer::CodeWriter;
use crate::backend::HostBackend;
use crate::error::{JitError, Result};
use crate::jit_config::JitConfig;

/// Which of the two block regions an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeRegion {
    /// Hot path: block entries, straight-line code, link sites.
    Near,
    /// Cold path: slow paths branched to from near code.
    Far,
}

/// Set of free host address ranges, kept coalesced.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FreeRanges {
    ranges: BTreeMap<usize, usize>,
}

impl FreeRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total free bytes.
    pub fn total(&self) -> usize {
        self.ranges.iter().map(|(s, e)| e - s).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.ranges.iter().map(|(&s, &e)| s..e)
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Add `range`, merging it with any range it overlaps or touches.
    pub fn insert(&mut self, range: Range<usize>) {
        if range.is_empty() {
            return;
        }
        let (mut start, mut end) = (range.start, range.end);
        if let Some((&s, &e)) = self.ranges.range(..=start).next_back() {
            if e >= start {
                start = s;
                end = end.max(e);
                self.ranges.remove(&s);
            }
        }
        while let Some((&s, &e)) = self.ranges.range(start..).next() {
            if s > end {
                break;
            }
            end = end.max(e);
            self.ranges.remove(&s);
        }
        self.ranges.insert(start, end);
    }

    /// Remove `range`, splitting any free range it cuts through.
    pub fn erase(&mut self, range: Range<usize>) {
        if range.is_empty() {
            return;
        }
        let overlapping: Vec<(usize, usize)> = self
            .ranges
            .range(..range.end)
            .filter(|&(_, &e)| e > range.start)
            .map(|(&s, &e)| (s, e))
            .collect();
        for (s, e) in overlapping {
            self.ranges.remove(&s);
            if s < range.start {
                self.ranges.insert(s, range.start);
            }
            if e > range.end {
                self.ranges.insert(range.end, e);
            }
        }
    }

    /// Largest free range. Ties go to the lowest address.
    pub fn largest(&self) -> Option<Range<usize>> {
        let mut best: Option<Range<usize>> = None;
        for r in self.iter() {
            if best.as_ref().map_or(true, |b| r.len() > b.len()) {
                best = Some(r);
            }
        }
        best
    }
}

enum Mapping {
    Writable(MutableBuffer),
    Executable(ExecutableBuffer),
    /// A protection change failed and the buffer was lost with it.
    Lost,
}

impl Mapping {
    fn bytes(&self) -> &[u8] {
        match self {
            Mapping::Writable(buf) => &buf[..],
            Mapping::Executable(buf) => &buf[..],
            Mapping::Lost => &[],
        }
    }
}

fn arena_lost() -> JitError {
    JitError::CodeMemory(io::Error::other("code arena lost after a failed protection change"))
}

/// Writable view of the whole arena for the duration of one [`CodeArena::patch`] call.
pub struct WritableCode<'a> {
    bytes: &'a mut [u8],
    base: usize,
    touched: Vec<Range<usize>>,
}

impl<'a> WritableCode<'a> {
    pub fn base(&self) -> usize {
        self.base
    }

    fn offsets(&self, range: &Range<usize>) -> Range<usize> {
        assert!(
            range.start >= self.base
                && range.end <= self.base + self.bytes.len()
                && range.start <= range.end,
            "host range {:#x}..{:#x} outside code arena",
            range.start,
            range.end
        );
        range.start - self.base..range.end - self.base
    }

    pub fn read(&self, address: usize, len: usize) -> &[u8] {
        let offsets = self.offsets(&(address..address + len));
        &self.bytes[offsets]
    }

    pub fn write(&mut self, address: usize, data: &[u8]) {
        let range = address..address + data.len();
        let offsets = self.offsets(&range);
        self.bytes[offsets].copy_from_slice(data);
        self.touched.push(range);
    }

    /// Poison `range` with the backend's trap instruction.
    pub fn fill_trap(&mut self, backend: &dyn HostBackend, range: Range<usize>) {
        let offsets = self.offsets(&range);
        backend.fill_trap(&mut self.bytes[offsets]);
        self.touched.push(range);
    }

    /// Sequential writer over a single range.
    pub fn writer(&mut self, range: Range<usize>) -> CodeWriter<'_> {
        let offsets = self.offsets(&range);
        self.touched.push(range.clone());
        CodeWriter::new(&mut self.bytes[offsets], range.start)
    }

    /// Writers over two disjoint ranges, `first` below `second`.
    pub fn writer_pair(
        &mut self,
        first: Range<usize>,
        second: Range<usize>,
    ) -> (CodeWriter<'_>, CodeWriter<'_>) {
        assert!(first.end <= second.start, "writer ranges overlap or are out of order");
        let a = self.offsets(&first);
        let b = self.offsets(&second);
        self.touched.push(first.clone());
        self.touched.push(second.clone());
        let (lo, hi) = self.bytes.split_at_mut(b.start);
        (
            CodeWriter::new(&mut lo[a], first.start),
            CodeWriter::new(&mut hi[..b.end - b.start], second.start),
        )
    }
}

/// The mapped arena plus free-space bookkeeping for its two block regions.
pub struct CodeArena {
    mapping: Mapping,
    base: usize,
    routines: Range<usize>,
    near: Range<usize>,
    far: Range<usize>,
    near_free: FreeRanges,
    far_free: FreeRanges,
    near_pending: Vec<Range<usize>>,
    far_pending: Vec<Range<usize>>,
}

impl CodeArena {
    /// Map the arena. It starts writable; the first [`patch`](Self::patch) leaves it executable.
    pub fn new(config: &JitConfig) -> Result<Self> {
        let size = config.arena_size();
        let mut buffer = MutableBuffer::new(size)?;
        buffer.set_len(size);
        let base = buffer.as_ptr() as usize;

        let routines = base..base + config.routines_size;
        let near = routines.end..routines.end + config.near_code_size;
        let far = near.end..near.end + config.far_code_size;
        debug!(
            "mapped {size} byte code arena at {base:#x} (near {:#x}, far {:#x})",
            near.start,
            far.start
        );

        let mut arena = Self {
            mapping: Mapping::Writable(buffer),
            base,
            routines,
            near,
            far,
            near_free: FreeRanges::new(),
            far_free: FreeRanges::new(),
            near_pending: Vec::new(),
            far_pending: Vec::new(),
        };
        arena.reset_free_ranges();
        Ok(arena)
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn routines_range(&self) -> Range<usize> {
        self.routines.clone()
    }

    pub fn region_range(&self, region: CodeRegion) -> Range<usize> {
        match region {
            CodeRegion::Near => self.near.clone(),
            CodeRegion::Far => self.far.clone(),
        }
    }

    pub fn region_of(&self, address: usize) -> Option<CodeRegion> {
        if self.near.contains(&address) {
            Some(CodeRegion::Near)
        } else if self.far.contains(&address) {
            Some(CodeRegion::Far)
        } else {
            None
        }
    }

    pub fn is_executable(&self) -> bool {
        matches!(self.mapping, Mapping::Executable(_))
    }

    /// Current contents of the whole arena.
    pub fn bytes(&self) -> &[u8] {
        self.mapping.bytes()
    }

    /// `len` bytes at host address `address`, if they lie inside the arena.
    pub fn read(&self, address: usize, len: usize) -> Option<&[u8]> {
        let start = address.checked_sub(self.base)?;
        self.bytes().get(start..start.checked_add(len)?)
    }

    /// Make the arena writable, run `f`, then make it executable again and flush the host
    /// instruction cache over every range `f` touched.
    pub fn patch<R>(
        &mut self,
        backend: &dyn HostBackend,
        f: impl FnOnce(&mut WritableCode<'_>) -> R,
    ) -> Result<R> {
        let mut buffer = match std::mem::replace(&mut self.mapping, Mapping::Lost) {
            Mapping::Writable(buf) => buf,
            Mapping::Executable(buf) => buf.make_mut()?,
            Mapping::Lost => return Err(arena_lost()),
        };

        let (result, touched) = {
            let mut code =
                WritableCode { bytes: &mut buffer[..], base: self.base, touched: Vec::new() };
            let result = f(&mut code);
            (result, code.touched)
        };

        let exec = buffer.make_exec()?;
        for range in touched.iter() {
            let start = range.start - self.base;
            backend.flush_icache(&exec[start..start + range.len()]);
        }
        trace!(ranges = touched.len(), "code patched");
        self.mapping = Mapping::Executable(exec);
        Ok(result)
    }

    fn free_mut(&mut self, region: CodeRegion) -> &mut FreeRanges {
        match region {
            CodeRegion::Near => &mut self.near_free,
            CodeRegion::Far => &mut self.far_free,
        }
    }

    pub fn free_ranges(&self, region: CodeRegion) -> &FreeRanges {
        match region {
            CodeRegion::Near => &self.near_free,
            CodeRegion::Far => &self.far_free,
        }
    }

    /// Where the next block in `region` should be emitted.
    pub fn largest_free(&self, region: CodeRegion) -> Option<Range<usize>> {
        self.free_ranges(region).largest()
    }

    /// Take `range` out of the free set after a block has been emitted into it.
    pub fn mark_used(&mut self, region: CodeRegion, range: Range<usize>) {
        self.free_mut(region).erase(range);
    }

    /// Queue `range` for reuse once the next compilation starts.
    pub fn defer_free(&mut self, region: CodeRegion, range: Range<usize>) {
        if range.is_empty() {
            return;
        }
        match region {
            CodeRegion::Near => self.near_pending.push(range),
            CodeRegion::Far => self.far_pending.push(range),
        }
    }

    pub fn pending_free_count(&self) -> usize {
        self.near_pending.len() + self.far_pending.len()
    }

    /// Return every deferred range to its free set.
    pub fn consume_pending_frees(&mut self) {
        for range in std::mem::take(&mut self.near_pending) {
            self.near_free.insert(range);
        }
        for range in std::mem::take(&mut self.far_pending) {
            self.far_free.insert(range);
        }
    }

    /// Mark both block regions entirely free and drop pending ranges.
    pub fn reset_free_ranges(&mut self) {
        self.near_pending.clear();
        self.far_pending.clear();
        self.near_free.clear();
        self.near_free.insert(self.near.clone());
        self.far_free.clear();
        self.far_free.insert(self.far.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{create_backend, HostArch};
    use pretty_assertions::assert_eq;

    fn small_config() -> JitConfig {
        JitConfig {
            routines_size: 256,
            near_code_size: 4096,
            far_code_size: 1024,
            ..JitConfig::default()
        }
    }

    fn ranges(free: &FreeRanges) -> Vec<Range<usize>> {
        free.iter().collect()
    }

    #[test]
    fn test_free_ranges_coalesce() {
        let mut free = FreeRanges::new();
        free.insert(0x100..0x200);
        free.insert(0x300..0x400);
        assert_eq!(ranges(&free), vec![0x100..0x200, 0x300..0x400]);
        free.insert(0x200..0x300);
        assert_eq!(ranges(&free), vec![0x100..0x400]);
        free.insert(0x50..0x120);
        assert_eq!(ranges(&free), vec![0x50..0x400]);
        assert_eq!(free.total(), 0x3b0);
    }

    #[test]
    fn test_free_ranges_erase_splits() {
        let mut free = FreeRanges::new();
        free.insert(0x1000..0x2000);
        free.erase(0x1400..0x1800);
        assert_eq!(ranges(&free), vec![0x1000..0x1400, 0x1800..0x2000]);
        free.erase(0x0..0x1100);
        assert_eq!(ranges(&free), vec![0x1100..0x1400, 0x1800..0x2000]);
        free.erase(0x1300..0x1900);
        assert_eq!(ranges(&free), vec![0x1100..0x1300, 0x1900..0x2000]);
    }

    #[test]
    fn test_largest_prefers_lowest_on_tie() {
        let mut free = FreeRanges::new();
        assert_eq!(free.largest(), None);
        free.insert(0x400..0x500);
        free.insert(0x100..0x200);
        assert_eq!(free.largest(), Some(0x100..0x200));
        free.insert(0x800..0x1000);
        assert_eq!(free.largest(), Some(0x800..0x1000));
    }

    #[test]
    fn test_arena_layout() {
        let arena = CodeArena::new(&small_config()).unwrap();
        let base = arena.base();
        assert_eq!(arena.routines_range(), base..base + 256);
        assert_eq!(arena.region_range(CodeRegion::Near), base + 256..base + 256 + 4096);
        assert_eq!(arena.region_of(base + 256), Some(CodeRegion::Near));
        assert_eq!(arena.region_of(base + 256 + 4096), Some(CodeRegion::Far));
        assert_eq!(arena.region_of(base), None);
        assert_eq!(arena.largest_free(CodeRegion::Far).map(|r| r.len()), Some(1024));
    }

    #[test]
    fn test_patch_leaves_arena_executable() {
        let backend = create_backend(HostArch::native());
        let mut arena = CodeArena::new(&small_config()).unwrap();
        assert!(!arena.is_executable());
        let near = arena.region_range(CodeRegion::Near);
        arena
            .patch(backend.as_ref(), |code| code.write(near.start, &[1, 2, 3, 4]))
            .unwrap();
        assert!(arena.is_executable());
        assert_eq!(arena.read(near.start, 4), Some(&[1u8, 2, 3, 4][..]));

        // A second patch flips back to writable and keeps earlier contents.
        let seen = arena
            .patch(backend.as_ref(), |code| {
                code.write(near.start + 4, &[5]);
                code.read(near.start, 5).to_vec()
            })
            .unwrap();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_writer_pair_targets_both_regions() {
        let backend = create_backend(HostArch::native());
        let mut arena = CodeArena::new(&small_config()).unwrap();
        let near = arena.region_range(CodeRegion::Near);
        let far = arena.region_range(CodeRegion::Far);
        arena
            .patch(backend.as_ref(), |code| {
                let (mut n, mut f) = code.writer_pair(near.clone(), far.clone());
                n.put(&[0xAA; 3]);
                f.put(&[0xBB; 2]);
                assert_eq!(n.address(), near.start + 3);
                assert_eq!(f.address(), far.start + 2);
            })
            .unwrap();
        assert_eq!(arena.read(near.start, 3), Some(&[0xAA; 3][..]));
        assert_eq!(arena.read(far.start, 2), Some(&[0xBB; 2][..]));
    }

    #[test]
    fn test_trap_fill_uses_backend() {
        let backend = create_backend(HostArch::X64);
        let mut arena = CodeArena::new(&small_config()).unwrap();
        let near = arena.region_range(CodeRegion::Near);
        arena
            .patch(backend.as_ref(), |code| {
                code.fill_trap(backend.as_ref(), near.start..near.start + 16)
            })
            .unwrap();
        assert!(backend.is_trap(arena.read(near.start, 16).unwrap()));
    }

    #[test]
    fn test_deferred_frees_return_on_consume() {
        let mut arena = CodeArena::new(&small_config()).unwrap();
        let near = arena.region_range(CodeRegion::Near);
        arena.mark_used(CodeRegion::Near, near.start..near.start + 512);
        assert_eq!(arena.largest_free(CodeRegion::Near), Some(near.start + 512..near.end));

        arena.defer_free(CodeRegion::Near, near.start..near.start + 512);
        assert_eq!(arena.pending_free_count(), 1);
        assert_eq!(arena.free_ranges(CodeRegion::Near).total(), near.len() - 512);

        arena.consume_pending_frees();
        assert_eq!(arena.pending_free_count(), 0);
        assert_eq!(arena.largest_free(CodeRegion::Near), Some(near));
    }

    #[test]
    fn test_read_outside_arena() {
        let arena = CodeArena::new(&small_config()).unwrap();
        assert_eq!(arena.read(arena.base().wrapping_sub(1), 1), None);
        assert_eq!(arena.read(arena.base() + arena.bytes().len(), 1), None);
    }
}
