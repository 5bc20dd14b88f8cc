//! End-to-end block cache behaviour driven through a tiny two-opcode compiler.

use gekko_jit::backend::block_of_code::CodeRegion;
use gekko_jit::backend::patch_info::LinkTarget;
use gekko_jit::{
    BlockCompiler, CompileContext, FlatMemory, FlushMode, GuestMemory, Hid0, HostArch, Jit,
    JitConfig, JitError, JitOptimizations, LinkKind, PpcState, Result,
};
use pretty_assertions::assert_eq;
use rstest::rstest;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Understands `addi` and `b`/`bl`/`ba`. A block ends at the first branch.
struct ToyCompiler;

impl BlockCompiler for ToyCompiler {
    fn compile(&mut self, ctx: &mut CompileContext<'_, '_>) -> Result<()> {
        let mut pc = ctx.address();
        loop {
            let inst = ctx.read_instruction(pc);
            match inst >> 26 {
                14 => {
                    let rd = ((inst >> 21) & 31) as usize;
                    let ra = ((inst >> 16) & 31) as usize;
                    let mut gprs = ctx.gprs();
                    if ra != 0 {
                        gprs.bind(ra, true, false);
                        gprs.lock(ra);
                    }
                    gprs.bind(rd, rd == ra, true);
                    drop(gprs);
                    ctx.next_instruction();
                    pc = pc.wrapping_add(4);
                }
                18 => {
                    let li = (((inst & 0x03ff_fffc) << 6) as i32 >> 6) as u32;
                    let target = if inst & 2 != 0 { li } else { pc.wrapping_add(li) };
                    let kind = if inst & 1 != 0 { LinkKind::Call } else { LinkKind::Jump };
                    ctx.flush_registers(FlushMode::All);
                    ctx.next_instruction();
                    ctx.write_exit(target, kind);
                    return Ok(());
                }
                op => {
                    return Err(JitError::Compile {
                        address: pc,
                        reason: format!("unsupported opcode {op}"),
                    });
                }
            }
        }
    }
}

/// Fills the near region no matter how much of it is free.
struct Oversized;

impl BlockCompiler for Oversized {
    fn compile(&mut self, ctx: &mut CompileContext<'_, '_>) -> Result<()> {
        let fill = vec![0x90; 4096];
        ctx.near().put(&fill);
        Ok(())
    }
}

fn b(from: u32, to: u32, link: bool) -> u32 {
    (18 << 26) | (to.wrapping_sub(from) & 0x03ff_fffc) | link as u32
}

fn addi(rd: u32, ra: u32, simm: i16) -> u32 {
    (14 << 26) | (rd << 21) | (ra << 16) | simm as u16 as u32
}

fn config(arch: HostArch) -> JitConfig {
    JitConfig {
        host_arch: arch,
        near_code_size: 64 * 1024,
        far_code_size: 16 * 1024,
        ..JitConfig::default()
    }
}

fn at(pc: u32) -> PpcState {
    let mut state = PpcState::new();
    state.pc = pc;
    state
}

fn exit_target(jit: &Jit, pc: u32) -> LinkTarget {
    let cache = jit.block_cache();
    let (_, block) = cache
        .iter()
        .find(|(_, b)| b.key.address == pc)
        .unwrap_or_else(|| panic!("no block at {pc:#x}"));
    let site = block.exits[0].site;
    let bytes = cache.arena().read(site.address, jit.backend().link_size()).unwrap();
    jit.backend().decode_link(site.address, bytes).unwrap()
}

/// Two blocks that branch to each other: `0x100: addi r3, r3, 1; b 0x200` and `0x200: b 0x100`.
fn ping_pong() -> FlatMemory {
    let mut memory = FlatMemory::new(0x10000);
    memory.load_words(0x100, &[addi(3, 3, 1), b(0x104, 0x200, false)]);
    memory.load_words(0x200, &[b(0x200, 0x100, false)]);
    memory
}

#[rstest]
#[case(HostArch::X64)]
#[case(HostArch::Arm64)]
fn test_exit_links_once_destination_exists(#[case] arch: HostArch) {
    init_tracing();
    let mut jit = Jit::new(config(arch)).unwrap();
    let memory = ping_pong();

    let a = jit.find_or_compile(&at(0x100), &memory, &mut ToyCompiler).unwrap();
    assert_eq!(
        exit_target(&jit, 0x100),
        LinkTarget::Dispatcher { guest_pc: 0x200, dispatcher: jit.dispatcher() }
    );

    let b = jit.find_or_compile(&at(0x200), &memory, &mut ToyCompiler).unwrap();
    assert_eq!(exit_target(&jit, 0x100), LinkTarget::Jump { host: b, indirect: false });
    assert_eq!(exit_target(&jit, 0x200), LinkTarget::Jump { host: a, indirect: false });
}

#[test]
fn test_call_exit_checks_budget() {
    let mut jit = Jit::new(config(HostArch::X64)).unwrap();
    let mut memory = FlatMemory::new(0x10000);
    memory.load_words(0x100, &[b(0x100, 0x400, true)]);
    memory.load_words(0x400, &[b(0x400, 0x100, false)]);

    jit.find_or_compile(&at(0x100), &memory, &mut ToyCompiler).unwrap();
    let callee = jit.find_or_compile(&at(0x400), &memory, &mut ToyCompiler).unwrap();
    let id = jit.lookup_block(&at(0x400)).unwrap();
    let normal = jit.block_cache().block(id).unwrap().normal_entry;
    assert!(normal > callee);
    assert_eq!(exit_target(&jit, 0x100), LinkTarget::BudgetedCall { checked: callee, normal });
}

#[test]
fn test_call_linking_disabled_links_as_jump() {
    let config = JitConfig {
        optimizations: JitOptimizations::all() - JitOptimizations::CALL_LINKING,
        ..config(HostArch::X64)
    };
    let mut jit = Jit::new(config).unwrap();
    let mut memory = FlatMemory::new(0x10000);
    memory.load_words(0x100, &[b(0x100, 0x400, true)]);
    memory.load_words(0x400, &[b(0x400, 0x100, false)]);

    jit.find_or_compile(&at(0x100), &memory, &mut ToyCompiler).unwrap();
    let callee = jit.find_or_compile(&at(0x400), &memory, &mut ToyCompiler).unwrap();
    assert_eq!(exit_target(&jit, 0x100), LinkTarget::Jump { host: callee, indirect: false });
}

#[test]
fn test_block_linking_disabled_keeps_dispatcher_exits() {
    let config = JitConfig { optimizations: JitOptimizations::empty(), ..config(HostArch::X64) };
    let mut jit = Jit::new(config).unwrap();
    let memory = ping_pong();
    jit.find_or_compile(&at(0x100), &memory, &mut ToyCompiler).unwrap();
    jit.find_or_compile(&at(0x200), &memory, &mut ToyCompiler).unwrap();
    assert!(exit_target(&jit, 0x100).is_dispatcher());
    assert!(exit_target(&jit, 0x200).is_dispatcher());
}

#[test]
fn test_invalidation_unlinks_and_poisons() {
    let mut jit = Jit::new(config(HostArch::X64)).unwrap();
    let memory = ping_pong();
    jit.find_or_compile(&at(0x100), &memory, &mut ToyCompiler).unwrap();
    let b = jit.find_or_compile(&at(0x200), &memory, &mut ToyCompiler).unwrap();

    jit.invalidate_icache(&memory, 0x200, 4, false).unwrap();
    assert_eq!(jit.lookup(&at(0x200)), None);
    assert_eq!(
        exit_target(&jit, 0x100),
        LinkTarget::Dispatcher { guest_pc: 0x200, dispatcher: jit.dispatcher() }
    );
    let stale = jit.block_cache().arena().read(b, jit.backend().link_size()).unwrap();
    assert!(jit.backend().is_trap(stale));
    assert_eq!(jit.block_cache().arena().pending_free_count(), 1);

    // The freed range is only handed out again once the next compilation starts.
    jit.find_or_compile(&at(0x200), &memory, &mut ToyCompiler).unwrap();
    assert_eq!(jit.block_cache().arena().pending_free_count(), 0);
    assert!(!exit_target(&jit, 0x100).is_dispatcher());
}

#[test]
fn test_icbi_picks_up_modified_code() {
    let mut jit = Jit::new(config(HostArch::X64)).unwrap();
    let mut memory = ping_pong();
    let state = at(0x200);
    jit.find_or_compile(&state, &memory, &mut ToyCompiler).unwrap();

    memory.load_words(0x200, &[addi(4, 0, 7), addi(4, 4, 1), b(0x208, 0x100, false)]);
    jit.icache_invalidate(&memory, Hid0::ICE, 0x200).unwrap();
    assert_eq!(jit.lookup(&state), None);

    jit.find_or_compile(&state, &memory, &mut ToyCompiler).unwrap();
    let id = jit.lookup_block(&state).unwrap();
    assert_eq!(jit.block_cache().block(id).unwrap().instruction_count, 3);
}

#[test]
fn test_unrelated_line_invalidation_keeps_blocks() {
    let mut jit = Jit::new(config(HostArch::X64)).unwrap();
    let memory = ping_pong();
    jit.find_or_compile(&at(0x100), &memory, &mut ToyCompiler).unwrap();
    jit.icache_invalidate(&memory, Hid0::ICE, 0x800).unwrap();
    assert!(jit.lookup(&at(0x100)).is_some());
}

#[test]
fn test_block_spanning_lines_dies_with_either() {
    let mut jit = Jit::new(config(HostArch::X64)).unwrap();
    let mut memory = FlatMemory::new(0x10000);
    let words: Vec<u32> = (0..10).map(|_| addi(5, 5, 1)).chain([b(0x328, 0x100, false)]).collect();
    memory.load_words(0x300, &words);
    let state = at(0x300);
    jit.find_or_compile(&state, &memory, &mut ToyCompiler).unwrap();
    let id = jit.lookup_block(&state).unwrap();
    assert_eq!(
        jit.block_cache().block(id).unwrap().physical_lines.iter().copied().collect::<Vec<_>>(),
        vec![0x300, 0x320]
    );

    jit.invalidate_icache_line(&memory, 0x324).unwrap();
    assert_eq!(jit.lookup(&state), None);
}

#[test]
fn test_clear_cache_frees_everything() {
    let mut jit = Jit::new(config(HostArch::X64)).unwrap();
    let memory = ping_pong();
    jit.find_or_compile(&at(0x100), &memory, &mut ToyCompiler).unwrap();
    jit.find_or_compile(&at(0x200), &memory, &mut ToyCompiler).unwrap();

    jit.clear_cache().unwrap();
    assert!(jit.block_cache().is_empty());
    assert_eq!(jit.lookup(&at(0x100)), None);
    let arena = jit.block_cache().arena();
    assert_eq!(
        arena.free_ranges(CodeRegion::Near).total(),
        arena.region_range(CodeRegion::Near).len()
    );
    assert_eq!(
        arena.free_ranges(CodeRegion::Far).total(),
        arena.region_range(CodeRegion::Far).len()
    );
}

#[test]
fn test_full_cache_flushes_and_retries() {
    init_tracing();
    let config = JitConfig {
        near_code_size: JitConfig::MIN_REGION_SIZE,
        far_code_size: JitConfig::MIN_REGION_SIZE,
        ..config(HostArch::X64)
    };
    let mut jit = Jit::new(config).unwrap();
    let mut memory = FlatMemory::new(0x10000);
    let pcs: Vec<u32> = (0..8).map(|i| 0x1000 + i * 0x100).collect();
    for &pc in pcs.iter() {
        memory.write_u32(pc, b(pc, pc + 0x100, false));
    }

    for &pc in pcs.iter() {
        jit.find_or_compile(&at(pc), &memory, &mut ToyCompiler).unwrap();
    }
    let live = jit.block_cache().len();
    assert!(live > 0 && live < pcs.len(), "{live} blocks survived");
    assert_eq!(jit.lookup(&at(pcs[0])), None);
    assert!(jit.lookup(&at(pcs[pcs.len() - 1])).is_some());
}

#[test]
fn test_block_larger_than_region_reports_exhaustion() {
    let config = JitConfig {
        near_code_size: JitConfig::MIN_REGION_SIZE,
        far_code_size: JitConfig::MIN_REGION_SIZE,
        ..config(HostArch::X64)
    };
    let mut jit = Jit::new(config).unwrap();
    let memory = FlatMemory::new(0x10000);
    let err = jit.find_or_compile(&at(0x100), &memory, &mut Oversized).unwrap_err();
    assert!(matches!(err, JitError::CodeSpaceExhausted { region: "near" }));
    assert!(jit.block_cache().is_empty());
}

#[test]
fn test_unsupported_instruction_is_reported() {
    let mut jit = Jit::new(config(HostArch::X64)).unwrap();
    let mut memory = FlatMemory::new(0x10000);
    memory.load_words(0x100, &[addi(3, 0, 1), 0xffff_ffff]);
    let err = jit.find_or_compile(&at(0x100), &memory, &mut ToyCompiler).unwrap_err();
    assert!(matches!(err, JitError::Compile { address: 0x104, .. }));
}
