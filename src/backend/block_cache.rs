//! Compiled blocks, the links between them, and their destruction.
//!
//! A block is identified by its guest entry address plus the [`FeatureFlags`] it was compiled
//! under. Each exit of a block is a fixed-size link slot that either loads the target pc and
//! jumps to the dispatcher, or branches straight into the destination block once that exists.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;

use indexmap::IndexSet;
use tracing::{debug, trace};

use crate::backend::block_of_code::{CodeArena, CodeRegion, WritableCode};
use crate::backend::patch_info::{LinkData, LinkDestination, LinkSite};
use crate::backend::{create_backend, DispatcherRoutines, HostBackend};
use crate::cpu_flags::FeatureFlags;
use crate::error::{JitError, Result};
use crate::jit_config::{JitConfig, JitOptimizations};

/// Entries in the direct-mapped entry table.
pub const FAST_BLOCK_MAP_ELEMENTS: usize = 0x10000;
const FAST_BLOCK_MAP_MASK: u32 = FAST_BLOCK_MAP_ELEMENTS as u32 - 1;

/// Granularity of physical range tracking, one guest cache line.
pub const BLOCK_LINE_SIZE: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub address: u32,
    pub flags: FeatureFlags,
}

impl BlockKey {
    pub fn new(address: u32, flags: FeatureFlags) -> Self {
        Self { address, flags }
    }
}

/// A compiled block and everything needed to link, unlink and destroy it.
#[derive(Debug, Clone)]
pub struct JitBlock {
    pub key: BlockKey,
    /// Physical address of the first instruction.
    pub physical_address: u32,
    /// Entry that checks the cycle budget first. Dispatcher and plain jumps come in here.
    pub checked_entry: usize,
    /// Entry past the budget check, reached from budgeted calls.
    pub normal_entry: usize,
    pub near: Range<usize>,
    pub far: Range<usize>,
    pub exits: Vec<LinkData>,
    /// Start addresses of every physical cache line the block was compiled from.
    pub physical_lines: BTreeSet<u32>,
    pub instruction_count: u32,
}

impl JitBlock {
    pub fn destination(&self) -> LinkDestination {
        LinkDestination { checked_entry: self.checked_entry, normal_entry: self.normal_entry }
    }

    pub fn overlaps_physical_range(&self, address: u32, length: u32) -> bool {
        let start = address as u64;
        let end = start + length as u64;
        self.physical_lines
            .iter()
            .any(|&line| (line as u64) < end && line as u64 + BLOCK_LINE_SIZE as u64 > start)
    }
}

/// Owner of the code arena and every block emitted into it.
pub struct BlockCache {
    arena: CodeArena,
    backend: Box<dyn HostBackend>,
    routines: DispatcherRoutines,
    optimizations: JitOptimizations,

    blocks: Vec<Option<JitBlock>>,
    free_ids: Vec<BlockId>,
    block_map: HashMap<BlockKey, BlockId>,
    fast_block_map: Vec<Option<BlockId>>,
    /// Guest target address -> blocks with an exit to it.
    links_to: HashMap<u32, IndexSet<BlockId>>,
    /// Physical line -> blocks compiled from it.
    block_range_map: BTreeMap<u32, IndexSet<BlockId>>,
    /// Lines that had a block compiled from them since the last invalidation of that line.
    valid_lines: BTreeSet<u32>,
}

impl BlockCache {
    /// Map the arena and emit the shared routines.
    pub fn new(config: &JitConfig) -> Result<Self> {
        let mut arena = CodeArena::new(config)?;
        let backend = create_backend(config.host_arch);
        let routines_range = arena.routines_range();
        let emitted = {
            let backend = backend.as_ref();
            arena.patch(backend, |code| {
                let mut writer = code.writer(routines_range);
                let routines = backend.emit_dispatcher_routines(&mut writer);
                (!writer.has_write_failed()).then_some(routines)
            })?
        };
        let routines = emitted.ok_or(JitError::CodeSpaceExhausted { region: "routines" })?;
        debug!(enter = routines.enter, dispatcher = routines.dispatcher, "routines emitted");

        Ok(Self {
            arena,
            backend,
            routines,
            optimizations: config.optimizations,
            blocks: Vec::new(),
            free_ids: Vec::new(),
            block_map: HashMap::new(),
            fast_block_map: vec![None; FAST_BLOCK_MAP_ELEMENTS],
            links_to: HashMap::new(),
            block_range_map: BTreeMap::new(),
            valid_lines: BTreeSet::new(),
        })
    }

    pub fn backend(&self) -> &dyn HostBackend {
        self.backend.as_ref()
    }

    pub fn arena(&self) -> &CodeArena {
        &self.arena
    }

    pub fn dispatcher(&self) -> usize {
        self.routines.dispatcher
    }

    pub fn routines(&self) -> DispatcherRoutines {
        self.routines
    }

    /// Split borrow for emitting a new block: the arena to write into, the backend to encode
    /// with, and the dispatcher address.
    pub fn emit_parts(&mut self) -> (&mut CodeArena, &dyn HostBackend, usize) {
        (&mut self.arena, self.backend.as_ref(), self.routines.dispatcher)
    }

    pub fn len(&self) -> usize {
        self.block_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block_map.is_empty()
    }

    pub fn block(&self, id: BlockId) -> Option<&JitBlock> {
        self.blocks.get(id.index()).and_then(Option::as_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &JitBlock)> {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.as_ref().map(|b| (BlockId(i as u32), b)))
    }

    /// Blocks with an exit to guest address `address`.
    pub fn links_to(&self, address: u32) -> impl Iterator<Item = BlockId> + '_ {
        self.links_to.get(&address).into_iter().flatten().copied()
    }

    pub fn is_line_valid(&self, physical_address: u32) -> bool {
        self.valid_lines.contains(&(physical_address & !(BLOCK_LINE_SIZE - 1)))
    }

    fn fast_index(address: u32) -> usize {
        ((address >> 2) & FAST_BLOCK_MAP_MASK) as usize
    }

    /// Block for `address` compiled under `flags`. Refreshes the fast table on a miss there.
    pub fn find(&mut self, address: u32, flags: FeatureFlags) -> Option<BlockId> {
        let key = BlockKey::new(address, flags);
        let fast = self.optimizations.contains(JitOptimizations::FAST_BLOCK_LOOKUP);
        if fast {
            if let Some(id) = self.fast_block_map[Self::fast_index(address)] {
                if self.block(id).is_some_and(|b| b.key == key) {
                    return Some(id);
                }
            }
        }
        let id = *self.block_map.get(&key)?;
        if fast {
            self.fast_block_map[Self::fast_index(address)] = Some(id);
        }
        Some(id)
    }

    fn get(&self, key: BlockKey) -> Option<BlockId> {
        self.block_map.get(&key).copied()
    }

    fn block_ref(&self, id: BlockId) -> &JitBlock {
        self.block(id).unwrap_or_else(|| panic!("block {id:?} does not exist"))
    }

    fn block_mut(&mut self, id: BlockId) -> &mut JitBlock {
        self.blocks
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .unwrap_or_else(|| panic!("block {id:?} does not exist"))
    }

    /// Register a freshly emitted block and link it both ways.
    ///
    /// The block's exits must already hold dispatcher-form link bytes.
    pub fn finalize_block(&mut self, block: JitBlock) -> Result<BlockId> {
        assert!(
            self.get(block.key).is_none(),
            "a live block already owns {:#010x} ({:?})",
            block.key.address,
            block.key.flags
        );
        let key = block.key;
        let id = match self.free_ids.pop() {
            Some(id) => id,
            None => {
                self.blocks.push(None);
                BlockId((self.blocks.len() - 1) as u32)
            }
        };

        for exit in block.exits.iter() {
            self.links_to.entry(exit.site.exit_address).or_default().insert(id);
        }
        for &line in block.physical_lines.iter() {
            self.block_range_map.entry(line).or_default().insert(id);
            self.valid_lines.insert(line);
        }
        debug!(
            exits = block.exits.len(),
            instructions = block.instruction_count,
            "block {:#010x} at {:#x} ({} near bytes, {} far bytes)",
            key.address,
            block.checked_entry,
            block.near.len(),
            block.far.len()
        );

        self.block_map.insert(key, id);
        if self.optimizations.contains(JitOptimizations::FAST_BLOCK_LOOKUP) {
            self.fast_block_map[Self::fast_index(key.address)] = Some(id);
        }
        self.blocks[id.index()] = Some(block);

        if self.optimizations.contains(JitOptimizations::BLOCK_LINKING) {
            self.link_block(id)?;
        }
        Ok(id)
    }

    /// Rewrite one link slot. `None` sends the exit to the dispatcher.
    pub fn write_link_block(
        backend: &dyn HostBackend,
        code: &mut WritableCode<'_>,
        dispatcher: usize,
        site: &LinkSite,
        destination: Option<&LinkDestination>,
    ) {
        let bytes = backend.encode_link(site, destination, dispatcher);
        code.write(site.address, &bytes);
        trace!(
            "link {:#x} -> {:#010x}: {:?}",
            site.address,
            site.exit_address,
            backend.decode_link(site.address, &bytes)
        );
        debug_assert_eq!(
            backend.decode_link(site.address, &bytes).map(|t| t.is_dispatcher()),
            Some(destination.is_none())
        );
    }

    fn apply_link_writes(
        &mut self,
        writes: Vec<(LinkSite, Option<LinkDestination>)>,
    ) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let dispatcher = self.routines.dispatcher;
        let backend = self.backend.as_ref();
        self.arena.patch(backend, |code| {
            for (site, dest) in writes.iter() {
                Self::write_link_block(backend, code, dispatcher, site, dest.as_ref());
            }
        })
    }

    /// Point every unlinked exit of `id` at its destination block, where one exists.
    pub fn link_block_exits(&mut self, id: BlockId) -> Result<()> {
        let flags = self.block_ref(id).key.flags;
        let mut writes = Vec::new();
        let mut linked = Vec::new();
        for (i, exit) in self.block_ref(id).exits.iter().enumerate() {
            if exit.linked {
                continue;
            }
            if let Some(dest) = self.get(BlockKey::new(exit.site.exit_address, flags)) {
                writes.push((exit.site, Some(self.block_ref(dest).destination())));
                linked.push(i);
            }
        }
        self.apply_link_writes(writes)?;
        let block = self.block_mut(id);
        for i in linked {
            block.exits[i].linked = true;
        }
        Ok(())
    }

    /// Link the exits of `id`, then every block waiting on its address.
    pub fn link_block(&mut self, id: BlockId) -> Result<()> {
        self.link_block_exits(id)?;
        let key = self.block_ref(id).key;
        let sources: Vec<BlockId> = self.links_to(key.address).collect();
        for source in sources {
            if self.block_ref(source).key.flags == key.flags {
                self.link_block_exits(source)?;
            }
        }
        Ok(())
    }

    /// Collect the slot rewrites that send every linked exit into `id` back to the dispatcher.
    fn unlink_writes(&mut self, id: BlockId) -> Vec<(LinkSite, Option<LinkDestination>)> {
        let key = self.block_ref(id).key;
        let sources: Vec<BlockId> = self.links_to(key.address).collect();
        let mut writes = Vec::new();
        for source in sources {
            let block = self.block_mut(source);
            if block.key.flags != key.flags {
                continue;
            }
            for exit in block.exits.iter_mut() {
                if exit.linked && exit.site.exit_address == key.address {
                    exit.linked = false;
                    writes.push((exit.site, None));
                }
            }
        }
        writes
    }

    /// Send every exit linked into `id` back to the dispatcher.
    pub fn unlink_block(&mut self, id: BlockId) -> Result<()> {
        let writes = self.unlink_writes(id);
        self.apply_link_writes(writes)
    }

    /// Remove `id` from every index, unlink it, poison its code and queue its ranges for
    /// reclamation at the start of the next compilation.
    pub fn destroy_block(&mut self, id: BlockId) -> Result<()> {
        assert!(self.block(id).is_some(), "destroying block {id:?} twice");
        let writes = self.unlink_writes(id);
        let block = match self.blocks.get_mut(id.index()).and_then(Option::take) {
            Some(block) => block,
            None => unreachable!(),
        };
        debug!("destroying block {:#010x} at {:#x}", block.key.address, block.checked_entry);

        if self.block_map.get(&block.key) == Some(&id) {
            self.block_map.remove(&block.key);
        }
        let fast = Self::fast_index(block.key.address);
        if self.fast_block_map[fast] == Some(id) {
            self.fast_block_map[fast] = None;
        }
        for exit in block.exits.iter() {
            if let Some(set) = self.links_to.get_mut(&exit.site.exit_address) {
                set.shift_remove(&id);
                if set.is_empty() {
                    self.links_to.remove(&exit.site.exit_address);
                }
            }
        }
        for line in block.physical_lines.iter() {
            if let Some(set) = self.block_range_map.get_mut(line) {
                set.shift_remove(&id);
                if set.is_empty() {
                    self.block_range_map.remove(line);
                }
            }
        }

        let dispatcher = self.routines.dispatcher;
        let backend = self.backend.as_ref();
        let (near, far) = (block.near.clone(), block.far.clone());
        self.arena.patch(backend, |code| {
            for (site, dest) in writes.iter() {
                Self::write_link_block(backend, code, dispatcher, site, dest.as_ref());
            }
            code.fill_trap(backend, near.clone());
            if !far.is_empty() {
                code.fill_trap(backend, far.clone());
            }
        })?;
        self.arena.defer_free(CodeRegion::Near, near);
        self.arena.defer_free(CodeRegion::Far, far);
        self.free_ids.push(id);
        Ok(())
    }

    /// Destroy every block compiled from a physical line overlapping `[address, address + length)`.
    pub fn erase_physical_range(&mut self, address: u32, length: u32) -> Result<()> {
        let start = address & !(BLOCK_LINE_SIZE - 1);
        let end = address as u64 + length as u64;
        let mut doomed: IndexSet<BlockId> = IndexSet::new();
        for (_, ids) in self
            .block_range_map
            .range(start..)
            .take_while(|&(&line, _)| (line as u64) < end)
        {
            for &id in ids.iter() {
                if self.block_ref(id).overlaps_physical_range(address, length) {
                    doomed.insert(id);
                }
            }
        }
        for id in doomed {
            self.destroy_block(id)?;
        }
        Ok(())
    }

    /// Guest code in `[physical_address, physical_address + length)` may have changed.
    ///
    /// A single-line invalidation of a line no block was compiled from is dropped early.
    /// `forced` marks invalidations requested explicitly rather than caused by a code write.
    pub fn invalidate_icache(
        &mut self,
        physical_address: u32,
        length: u32,
        forced: bool,
    ) -> Result<()> {
        if length == BLOCK_LINE_SIZE {
            let line = physical_address & !(BLOCK_LINE_SIZE - 1);
            if !self.valid_lines.remove(&line) {
                return Ok(());
            }
        }
        trace!(forced, "invalidating {length} bytes at {physical_address:#010x}");
        self.erase_physical_range(physical_address, length)
    }

    pub fn invalidate_icache_line(&mut self, physical_address: u32) -> Result<()> {
        self.invalidate_icache(physical_address & !(BLOCK_LINE_SIZE - 1), BLOCK_LINE_SIZE, false)
    }

    /// Destroy every block and make the whole arena available again.
    ///
    /// Unlike [`destroy_block`](Self::destroy_block) the code ranges are reclaimed right away,
    /// so no generated code may be running or on the stack when this is called.
    pub fn clear(&mut self) -> Result<()> {
        debug!(blocks = self.len(), "clearing block cache");
        self.blocks.clear();
        self.free_ids.clear();
        self.block_map.clear();
        self.fast_block_map.iter_mut().for_each(|e| *e = None);
        self.links_to.clear();
        self.block_range_map.clear();
        self.valid_lines.clear();

        let backend = self.backend.as_ref();
        let near = self.arena.region_range(CodeRegion::Near);
        let far = self.arena.region_range(CodeRegion::Far);
        self.arena.patch(backend, |code| {
            code.fill_trap(backend, near);
            code.fill_trap(backend, far);
        })?;
        self.arena.reset_free_ranges();
        Ok(())
    }
}
