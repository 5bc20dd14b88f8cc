use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::backend::block_cache::{BlockCache, BlockId, BlockKey, JitBlock, BLOCK_LINE_SIZE};
use crate::backend::block_of_code::CodeRegion;
use crate::backend::code_writer::CodeWriter;
use crate::backend::hostloc::HostReg;
use crate::backend::jit_state::PpcState;
use crate::backend::patch_info::{LinkData, LinkKind, LinkSite};
use crate::backend::reg_alloc::{FlushMode, FprBank, FprCache, GprBank, GprCache, RegBank, RegCache};
use crate::backend::{BackendEmitter, HostArch, HostBackend};
use crate::cpu_flags::{FeatureFlags, Hid0};
use crate::error::{JitError, Result};
use crate::icache::InstructionCache;
use crate::jit_config::{JitConfig, JitOptimizations};
use crate::memory::GuestMemory;

/// Host address execution enters a block at.
pub type EntryPoint = usize;

/// Translates guest instructions into host code for one block.
///
/// Implementations read instructions through [`CompileContext::read_instruction`], emit code
/// into the near and far writers, and leave the block through [`CompileContext::write_exit`].
pub trait BlockCompiler {
    fn compile(&mut self, ctx: &mut CompileContext<'_, '_>) -> Result<()>;
}

/// Public JIT context.
///
/// Owns the code arena, the block cache and the instruction cache model. Create one per
/// emulated CPU and drive it from the CPU thread only.
pub struct Jit {
    config: JitConfig,
    blocks: BlockCache,
    icache: InstructionCache,
}

impl Jit {
    /// Validate `config`, map the code arena and emit the dispatcher routines.
    pub fn new(config: JitConfig) -> Result<Self> {
        config.validate()?;
        let blocks = BlockCache::new(&config)?;
        let icache = InstructionCache::new(config.enable_icache);
        debug!(arch = ?config.host_arch, "jit created");
        Ok(Self { config, blocks, icache })
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn block_cache(&self) -> &BlockCache {
        &self.blocks
    }

    pub fn icache(&self) -> &InstructionCache {
        &self.icache
    }

    pub fn icache_mut(&mut self) -> &mut InstructionCache {
        &mut self.icache
    }

    pub fn backend(&self) -> &dyn HostBackend {
        self.blocks.backend()
    }

    /// Host address generated code exits through when no linked destination exists.
    pub fn dispatcher(&self) -> usize {
        self.blocks.dispatcher()
    }

    /// Run generated code from `entry` until it leaves through the dispatcher.
    ///
    /// Returns the guest pc the dispatcher was reached with. It is also stored in `state.pc`.
    ///
    /// # Safety
    ///
    /// `entry` must be an entry point handed out by this `Jit` whose block has not been
    /// destroyed since, and `state` must be the state the block was compiled against.
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    pub unsafe fn execute(&self, state: &mut PpcState, entry: EntryPoint) -> u32 {
        assert_eq!(
            self.config.host_arch,
            HostArch::native(),
            "generated code targets a different host"
        );
        assert!(self.blocks.arena().is_executable(), "code arena is not executable");
        let enter = self.blocks.routines().enter;

        #[cfg(target_arch = "x86_64")]
        type EnterFn = unsafe extern "sysv64" fn(*mut PpcState, usize) -> u32;
        #[cfg(target_arch = "aarch64")]
        type EnterFn = unsafe extern "C" fn(*mut PpcState, usize) -> u32;

        // SAFETY: `enter` is the entry routine emitted into the executable arena with this
        // signature. It saves and restores every callee-saved register it touches.
        let enter: EnterFn = unsafe { std::mem::transmute::<usize, EnterFn>(enter) };
        let pc = unsafe { enter(state, entry) };
        debug!(pc = format_args!("{pc:#010x}"), downcount = state.downcount, "left generated code");
        pc
    }

    /// Fetch an instruction word the way the guest CPU would.
    pub fn read_instruction<M: GuestMemory + ?Sized>(
        &mut self,
        memory: &M,
        hid0: Hid0,
        address: u32,
    ) -> u32 {
        self.icache.read_instruction(memory, hid0, address)
    }

    /// Checked entry of the block for the current pc, if compiled.
    pub fn lookup(&mut self, state: &PpcState) -> Option<EntryPoint> {
        let id = self.blocks.find(state.pc, state.feature_flags())?;
        self.blocks.block(id).map(|b| b.checked_entry)
    }

    /// Block id for the current pc, if compiled.
    pub fn lookup_block(&mut self, state: &PpcState) -> Option<BlockId> {
        self.blocks.find(state.pc, state.feature_flags())
    }

    /// Entry for the block at `state.pc`, compiling it first if needed.
    ///
    /// Running out of code space flushes the whole cache and retries once.
    pub fn find_or_compile<M, C>(
        &mut self,
        state: &PpcState,
        memory: &M,
        compiler: &mut C,
    ) -> Result<EntryPoint>
    where
        M: GuestMemory,
        C: BlockCompiler + ?Sized,
    {
        if let Some(entry) = self.lookup(state) {
            return Ok(entry);
        }
        match self.compile_block(state, memory, compiler) {
            Err(JitError::CodeSpaceExhausted { region }) => {
                warn!(region, "code cache full, flushing");
                self.clear_cache()?;
                self.compile_block(state, memory, compiler)
            }
            result => result,
        }
    }

    fn compile_block<M, C>(
        &mut self,
        state: &PpcState,
        memory: &M,
        compiler: &mut C,
    ) -> Result<EntryPoint>
    where
        M: GuestMemory,
        C: BlockCompiler + ?Sized,
    {
        let key = BlockKey::new(state.pc, state.feature_flags());
        let physical_address =
            memory.translate_code_address(key.address).ok_or_else(|| JitError::Compile {
                address: key.address,
                reason: "instruction address does not map to memory".into(),
            })?;

        let (arena, backend, dispatcher) = self.blocks.emit_parts();
        arena.consume_pending_frees();
        let near = arena
            .largest_free(CodeRegion::Near)
            .ok_or(JitError::CodeSpaceExhausted { region: "near" })?;
        let far = arena
            .largest_free(CodeRegion::Far)
            .ok_or(JitError::CodeSpaceExhausted { region: "far" })?;

        let icache = &mut self.icache;
        let config = &self.config;
        let outline = arena.patch(backend, |code| {
            let (mut near_code, far_code) = code.writer_pair(near.clone(), far.clone());
            let checked_entry = near_code.address();
            backend.emit_checked_entry(&mut near_code, key.address, dispatcher);
            let normal_entry = near_code.address();

            let mut ctx = CompileContext {
                key,
                state,
                memory,
                icache,
                hid0: state.hid0(),
                backend,
                dispatcher,
                near: near_code,
                far: far_code,
                gprs: GprCache::new(backend.gpr_allocation_order(), config.regalloc_lookahead),
                fprs: FprCache::new(backend.fpr_allocation_order(), config.regalloc_lookahead),
                exits: Vec::new(),
                physical_lines: BTreeSet::from([physical_address & !(BLOCK_LINE_SIZE - 1)]),
                instruction_count: 0,
                checked_entry,
                normal_entry,
                call_linking: config.has_optimization(JitOptimizations::CALL_LINKING),
            };
            compiler.compile(&mut ctx)?;
            ctx.finish()
        })??;

        let block = JitBlock {
            key,
            physical_address,
            checked_entry: outline.checked_entry,
            normal_entry: outline.normal_entry,
            near: near.start..outline.near_end,
            far: far.start..outline.far_end,
            exits: outline.exits,
            physical_lines: outline.physical_lines,
            instruction_count: outline.instruction_count,
        };
        arena.mark_used(CodeRegion::Near, block.near.clone());
        arena.mark_used(CodeRegion::Far, block.far.clone());

        let entry = block.checked_entry;
        self.blocks.finalize_block(block)?;
        Ok(entry)
    }

    /// `icbi`: drop the cache set holding `address` and any block compiled from its line.
    pub fn icache_invalidate<M: GuestMemory + ?Sized>(
        &mut self,
        memory: &M,
        hid0: Hid0,
        address: u32,
    ) -> Result<()> {
        self.icache.invalidate(hid0, address);
        match memory.translate_code_address(address) {
            Some(physical) => self.blocks.invalidate_icache_line(physical),
            None => Ok(()),
        }
    }

    /// Guest code in `[address, address + length)` changed; destroy overlapping blocks.
    pub fn invalidate_icache<M: GuestMemory + ?Sized>(
        &mut self,
        memory: &M,
        address: u32,
        length: u32,
        forced: bool,
    ) -> Result<()> {
        match memory.translate_code_address(address) {
            Some(physical) => self.blocks.invalidate_icache(physical, length, forced),
            None => Ok(()),
        }
    }

    pub fn invalidate_icache_line<M: GuestMemory + ?Sized>(
        &mut self,
        memory: &M,
        address: u32,
    ) -> Result<()> {
        match memory.translate_code_address(address) {
            Some(physical) => self.blocks.invalidate_icache_line(physical),
            None => Ok(()),
        }
    }

    /// `mtspr HID0`. Setting ICFI flash-invalidates the instruction cache and throws away
    /// every compiled block. ICFI itself always reads back as zero.
    pub fn write_hid0(&mut self, state: &mut PpcState, value: u32) -> Result<()> {
        let hid0 = Hid0::from_bits_retain(value);
        if hid0.contains(Hid0::ICFI) {
            debug!("icache flash invalidate");
            self.icache.reset();
            self.clear_cache()?;
        }
        state.set_hid0(hid0.difference(Hid0::ICFI));
        Ok(())
    }

    /// Throw away every compiled block. Must not be called while generated code is running.
    pub fn clear_cache(&mut self) -> Result<()> {
        self.blocks.clear()
    }
}

/// What a finished compilation hands back to the block cache.
struct BlockOutline {
    checked_entry: usize,
    normal_entry: usize,
    near_end: usize,
    far_end: usize,
    exits: Vec<LinkData>,
    physical_lines: BTreeSet<u32>,
    instruction_count: u32,
}

/// Everything a [`BlockCompiler`] may use while emitting one block.
///
/// Register allocator state lives here and is dropped with the context, so nothing carries
/// over to the next block.
pub struct CompileContext<'a, 'c> {
    key: BlockKey,
    state: &'a PpcState,
    memory: &'a dyn GuestMemory,
    icache: &'a mut InstructionCache,
    hid0: Hid0,
    backend: &'a dyn HostBackend,
    dispatcher: usize,
    near: CodeWriter<'c>,
    far: CodeWriter<'c>,
    gprs: GprCache,
    fprs: FprCache,
    exits: Vec<LinkData>,
    physical_lines: BTreeSet<u32>,
    instruction_count: u32,
    checked_entry: usize,
    normal_entry: usize,
    call_linking: bool,
}

impl<'a, 'c> CompileContext<'a, 'c> {
    /// Guest address of the block's first instruction.
    pub fn address(&self) -> u32 {
        self.key.address
    }

    pub fn feature_flags(&self) -> FeatureFlags {
        self.key.flags
    }

    /// CPU state at the time the block is compiled.
    pub fn state(&self) -> &PpcState {
        self.state
    }

    pub fn backend(&self) -> &dyn HostBackend {
        self.backend
    }

    pub fn dispatcher(&self) -> usize {
        self.dispatcher
    }

    /// Fetch the instruction at `address` through the icache and record its line as part of
    /// the block's physical range.
    pub fn read_instruction(&mut self, address: u32) -> u32 {
        if let Some(physical) = self.memory.translate_code_address(address) {
            self.physical_lines.insert(physical & !(BLOCK_LINE_SIZE - 1));
        }
        self.icache.read_instruction(self.memory, self.hid0, address)
    }

    pub fn near(&mut self) -> &mut CodeWriter<'c> {
        &mut self.near
    }

    pub fn far(&mut self) -> &mut CodeWriter<'c> {
        &mut self.far
    }

    pub fn gprs(&mut self) -> BoundRegs<'_, 'c, GprBank> {
        BoundRegs {
            cache: &mut self.gprs,
            emitter: BackendEmitter::new(self.backend, &mut self.near),
        }
    }

    pub fn fprs(&mut self) -> BoundRegs<'_, 'c, FprBank> {
        BoundRegs {
            cache: &mut self.fprs,
            emitter: BackendEmitter::new(self.backend, &mut self.near),
        }
    }

    /// Registers each remaining instruction reads or writes, as bitmasks over guest indices.
    pub fn set_register_usage(&mut self, gpr_usage: Vec<u64>, fpr_usage: Vec<u64>) {
        self.gprs.set_register_usage(gpr_usage);
        self.fprs.set_register_usage(fpr_usage);
    }

    /// Finish the current instruction: drop register locks and advance the lookahead.
    pub fn next_instruction(&mut self) {
        self.gprs.unlock_all();
        self.fprs.unlock_all();
        self.gprs.advance();
        self.fprs.advance();
        self.instruction_count += 1;
    }

    /// Write every dirty guest register back to [`PpcState`].
    pub fn flush_registers(&mut self, mode: FlushMode) {
        let mut emitter = BackendEmitter::new(self.backend, &mut self.near);
        self.gprs.flush(&mut emitter, mode);
        self.fprs.flush(&mut emitter, mode);
    }

    pub fn checked_entry(&self) -> usize {
        self.checked_entry
    }

    /// Make the current near position the block's normal entry, reached from budgeted calls.
    pub fn mark_normal_entry(&mut self) {
        self.normal_entry = self.near.address();
    }

    /// Charge `cycles` against the timeslice. The next checked entry reached with a
    /// non-positive downcount leaves through the dispatcher.
    pub fn subtract_downcount(&mut self, cycles: u32) {
        self.backend.emit_downcount_sub(&mut self.near, cycles);
    }

    /// Emit a patchable exit to guest address `destination`.
    ///
    /// Registers must already be flushed. The slot starts out routed through the dispatcher
    /// and is linked once the block is finalized.
    pub fn write_exit(&mut self, destination: u32, kind: LinkKind) -> LinkSite {
        debug_assert!(
            !self.gprs.has_dirty() && !self.fprs.has_dirty(),
            "block exit to {destination:#010x} with dirty registers"
        );
        let kind = match kind {
            LinkKind::Call if !self.call_linking => LinkKind::Jump,
            kind => kind,
        };
        let site = LinkSite { address: self.near.address(), exit_address: destination, kind };
        let bytes = self.backend.encode_link(&site, None, self.dispatcher);
        self.near.put(&bytes);
        self.exits.push(LinkData::new(site));
        site
    }

    fn finish(self) -> Result<BlockOutline> {
        if self.near.has_write_failed() {
            return Err(JitError::CodeSpaceExhausted { region: "near" });
        }
        if self.far.has_write_failed() {
            return Err(JitError::CodeSpaceExhausted { region: "far" });
        }
        assert!(
            !self.gprs.has_dirty() && !self.fprs.has_dirty(),
            "block {:#010x} ended with dirty registers",
            self.key.address
        );
        Ok(BlockOutline {
            checked_entry: self.checked_entry,
            normal_entry: self.normal_entry,
            near_end: self.near.address(),
            far_end: self.far.address(),
            exits: self.exits,
            physical_lines: self.physical_lines,
            instruction_count: self.instruction_count,
        })
    }
}

/// A register cache paired with the near-code emitter its loads and stores go to.
pub struct BoundRegs<'x, 'c, B: RegBank> {
    cache: &'x mut RegCache<B>,
    emitter: BackendEmitter<'x, 'c>,
}

impl<B: RegBank> BoundRegs<'_, '_, B> {
    pub fn bind(&mut self, guest: usize, load: bool, make_dirty: bool) -> HostReg {
        self.cache.bind_to_register(&mut self.emitter, guest, load, make_dirty)
    }

    pub fn store(&mut self, guest: usize, mode: FlushMode) {
        self.cache.store_from_register(&mut self.emitter, guest, mode);
    }

    pub fn flush(&mut self, mode: FlushMode) {
        self.cache.flush(&mut self.emitter, mode);
    }

    pub fn lock(&mut self, guest: usize) {
        self.cache.lock(guest);
    }

    pub fn unlock(&mut self, guest: usize) {
        self.cache.unlock(guest);
    }

    pub fn lock_host(&mut self, reg: HostReg) {
        self.cache.lock_host(reg);
    }

    pub fn unlock_all(&mut self) {
        self.cache.unlock_all();
    }

    pub fn free_host_register(&self) -> Option<HostReg> {
        self.cache.get_free_host_register()
    }

    pub fn cache(&self) -> &RegCache<B> {
        self.cache
    }
}
