//! Core of a just-in-time recompiler for the Gekko/Broadway PowerPC CPU.
//!
//! The crate owns the parts of the recompiler that do not depend on any particular guest
//! instruction: the compiled-block cache with exit linking and invalidation, the code arena
//! it lives in, the host register allocator, the guest instruction cache model and the lazily
//! encoded condition register. Instruction translation plugs in through [`BlockCompiler`].

pub mod backend;
pub mod condition_register;
pub mod cpu_flags;
pub mod error;
pub mod icache;
pub mod jit;
pub mod jit_config;
pub mod memory;

pub use backend::block_cache::{BlockCache, BlockId, BlockKey, JitBlock};
pub use backend::hostloc::{HostReg, StateSlot};
pub use backend::jit_state::PpcState;
pub use backend::patch_info::LinkKind;
pub use backend::reg_alloc::{FlushMode, FprCache, GprCache};
pub use backend::{HostArch, HostBackend};
pub use condition_register::ConditionRegister;
pub use cpu_flags::{FeatureFlags, Hid0, Msr};
pub use error::{JitError, Result};
pub use icache::{IcacheSnapshot, InstructionCache};
pub use jit::{BlockCompiler, BoundRegs, CompileContext, EntryPoint, Jit};
pub use jit_config::{JitConfig, JitOptimizations};
pub use memory::{FlatMemory, GuestMemory};
