//! Guest-to-host register allocation for the duration of one block's compilation.
//!
//! Every guest register is either *free* (its value lives in its canonical slot inside
//! [`PpcState`]) or *bound* to a host register, in which case the host copy may be dirty.
//! Code emission goes through [`RegEmitter`], so the allocator itself never touches bytes.

use std::fmt;
use std::marker::PhantomData;

use crate::backend::hostloc::{HostReg, RegBankKind, StateSlot};
use crate::backend::jit_state::{PpcState, NUM_FPRS, NUM_GPRS};

/// Load/store emission the allocator needs from a backend.
pub trait RegEmitter {
    fn emit_load(&mut self, reg: HostReg, slot: StateSlot);
    fn emit_store(&mut self, reg: HostReg, slot: StateSlot);
}

/// What a register file looks like to the allocator.
pub trait RegBank {
    const KIND: RegBankKind;
    const NUM_GUEST_REGS: usize;

    /// Canonical in-memory home of guest register `index`.
    fn default_slot(index: usize) -> StateSlot;
}

#[derive(Debug)]
pub struct GprBank;

impl RegBank for GprBank {
    const KIND: RegBankKind = RegBankKind::Gpr;
    const NUM_GUEST_REGS: usize = NUM_GPRS;

    fn default_slot(index: usize) -> StateSlot {
        PpcState::gpr_slot(index)
    }
}

#[derive(Debug)]
pub struct FprBank;

impl RegBank for FprBank {
    const KIND: RegBankKind = RegBankKind::Fpr;
    const NUM_GUEST_REGS: usize = NUM_FPRS;

    fn default_slot(index: usize) -> StateSlot {
        PpcState::fpr_slot(index)
    }
}

pub type GprCache = RegCache<GprBank>;
pub type FprCache = RegCache<FprBank>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Write dirty values back but keep every binding.
    MaintainState,
    /// Write dirty values back and unbind everything.
    All,
}

#[derive(Debug, Clone, Copy)]
struct GuestRecord {
    slot: StateSlot,
    /// Index into `hosts` while the value is away from its slot.
    host: Option<usize>,
    locks: u32,
}

#[derive(Debug, Clone, Copy)]
struct HostRecord {
    reg: HostReg,
    guest: Option<usize>,
    dirty: bool,
    locks: u32,
}

impl HostRecord {
    fn is_free(&self) -> bool {
        self.guest.is_none()
    }
}

/// Register cache over one bank. Hosts are kept in allocation-priority order.
pub struct RegCache<B: RegBank> {
    guests: Vec<GuestRecord>,
    hosts: Vec<HostRecord>,
    /// Per upcoming instruction: bitmask of guest registers it touches.
    usage: Vec<u64>,
    cursor: usize,
    lookahead: usize,
    _bank: PhantomData<B>,
}

impl<B: RegBank> RegCache<B> {
    pub fn new(allocation_order: &[HostReg], lookahead: usize) -> Self {
        assert!(
            allocation_order.iter().all(|r| r.bank() == B::KIND),
            "allocation order mixes register banks"
        );
        Self {
            guests: (0..B::NUM_GUEST_REGS)
                .map(|i| GuestRecord { slot: B::default_slot(i), host: None, locks: 0 })
                .collect(),
            hosts: allocation_order
                .iter()
                .map(|&reg| HostRecord { reg, guest: None, dirty: false, locks: 0 })
                .collect(),
            usage: Vec::new(),
            cursor: 0,
            lookahead,
            _bank: PhantomData,
        }
    }

    pub fn num_host_regs(&self) -> usize {
        self.hosts.len()
    }

    /// Install per-instruction register usage for the rest of the block, starting at the
    /// current instruction.
    pub fn set_register_usage(&mut self, usage: Vec<u64>) {
        self.usage = usage;
        self.cursor = 0;
    }

    /// Move the lookahead window past the current instruction.
    pub fn advance(&mut self) {
        self.cursor = (self.cursor + 1).min(self.usage.len());
    }

    pub fn is_bound(&self, guest: usize) -> bool {
        self.guests[guest].host.is_some()
    }

    pub fn host_reg(&self, guest: usize) -> Option<HostReg> {
        self.guests[guest].host.map(|h| self.hosts[h].reg)
    }

    pub fn is_dirty(&self, guest: usize) -> bool {
        self.guests[guest].host.is_some_and(|h| self.hosts[h].dirty)
    }

    pub fn has_dirty(&self) -> bool {
        self.hosts.iter().any(|h| h.dirty)
    }

    pub fn guest_in(&self, reg: HostReg) -> Option<usize> {
        self.hosts[self.host_index(reg)].guest
    }

    pub fn bound_count(&self) -> usize {
        self.hosts.iter().filter(|h| !h.is_free()).count()
    }

    /// Make `guest` live in a host register and return it.
    ///
    /// With `load` the current value is read from its slot; without it the caller is about to
    /// overwrite the register. `make_dirty` marks the host copy as newer than memory. An already
    /// bound register only picks up the dirty flag.
    pub fn bind_to_register(
        &mut self,
        emit: &mut dyn RegEmitter,
        guest: usize,
        load: bool,
        make_dirty: bool,
    ) -> HostReg {
        if let Some(h) = self.guests[guest].host {
            self.hosts[h].dirty |= make_dirty;
            return self.hosts[h].reg;
        }

        let h = match self.free_host_index() {
            Some(h) => h,
            None => {
                let (victim, victim_guest) = self.select_spill_victim();
                tracing::trace!(victim_guest, guest, "spilling {:?}", self.hosts[victim].reg);
                self.store_from_register(emit, victim_guest, FlushMode::All);
                victim
            }
        };

        let reg = self.hosts[h].reg;
        if load {
            emit.emit_load(reg, self.guests[guest].slot);
        }
        self.hosts[h].guest = Some(guest);
        self.hosts[h].dirty = make_dirty;
        self.guests[guest].host = Some(h);
        reg
    }

    /// Write `guest` back to its slot if dirty. [`FlushMode::All`] also unbinds it.
    pub fn store_from_register(
        &mut self,
        emit: &mut dyn RegEmitter,
        guest: usize,
        mode: FlushMode,
    ) {
        let Some(h) = self.guests[guest].host else {
            return;
        };
        if self.hosts[h].dirty {
            emit.emit_store(self.hosts[h].reg, self.guests[guest].slot);
            self.hosts[h].dirty = false;
        }
        if mode == FlushMode::All {
            self.hosts[h].guest = None;
            self.guests[guest].host = None;
        }
    }

    /// Apply [`store_from_register`](Self::store_from_register) to every bound register.
    pub fn flush(&mut self, emit: &mut dyn RegEmitter, mode: FlushMode) {
        if mode == FlushMode::All {
            assert!(
                self.guests.iter().all(|g| g.locks == 0) && self.hosts.iter().all(|h| h.locks == 0),
                "flushing all registers while some are still locked"
            );
        }
        for guest in 0..self.guests.len() {
            self.store_from_register(emit, guest, mode);
        }
    }

    /// Keep `guest` from being chosen as a spill victim until unlocked.
    pub fn lock(&mut self, guest: usize) {
        self.guests[guest].locks += 1;
    }

    pub fn unlock(&mut self, guest: usize) {
        let record = &mut self.guests[guest];
        assert!(record.locks > 0, "unlocking guest register {guest} that is not locked");
        record.locks -= 1;
    }

    pub fn lock_host(&mut self, reg: HostReg) {
        let h = self.host_index(reg);
        self.hosts[h].locks += 1;
    }

    pub fn unlock_host(&mut self, reg: HostReg) {
        let h = self.host_index(reg);
        assert!(self.hosts[h].locks > 0, "unlocking {reg:?} that is not locked");
        self.hosts[h].locks -= 1;
    }

    /// Drop every lock. Called once the current instruction has been emitted.
    pub fn unlock_all(&mut self) {
        self.guests.iter_mut().for_each(|g| g.locks = 0);
        self.hosts.iter_mut().for_each(|h| h.locks = 0);
    }

    /// First unbound, unlocked host register in allocation order.
    pub fn get_free_host_register(&self) -> Option<HostReg> {
        self.free_host_index().map(|h| self.hosts[h].reg)
    }

    fn free_host_index(&self) -> Option<usize> {
        self.hosts.iter().position(|h| h.is_free() && h.locks == 0)
    }

    fn host_index(&self, reg: HostReg) -> usize {
        self.hosts
            .iter()
            .position(|h| h.reg == reg)
            .unwrap_or_else(|| panic!("{reg:?} is not allocatable in this bank"))
    }

    /// Cost of evicting the register at `h`: dirty values need a store, and values used again
    /// soon need a reload. Lower is better.
    fn spill_score(&self, h: usize) -> u32 {
        let host = &self.hosts[h];
        let mut score = if host.dirty { 2 } else { 0 };
        if let Some(guest) = host.guest {
            let mask = 1u64 << guest;
            let end = self.usage.len().min(self.cursor + self.lookahead);
            if let Some(distance) =
                self.usage[self.cursor..end].iter().position(|&u| u & mask != 0)
            {
                score += 1 + 2 * 6u32.saturating_sub((distance as u32 + 1).ilog2());
            }
        }
        score
    }

    /// Returns the host index and the guest register it currently holds.
    fn select_spill_victim(&self) -> (usize, usize) {
        let mut best: Option<(usize, usize, u32)> = None;
        for (h, host) in self.hosts.iter().enumerate() {
            let Some(guest) = host.guest else { continue };
            if host.locks > 0 || self.guests[guest].locks > 0 {
                continue;
            }
            let score = self.spill_score(h);
            if best.map_or(true, |(_, _, s)| score < s) {
                best = Some((h, guest, score));
            }
        }
        match best {
            Some((h, guest, _)) => (h, guest),
            None => panic!("All candidate registers have already been allocated"),
        }
    }
}

impl<B: RegBank> fmt::Debug for RegCache<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for host in self.hosts.iter() {
            if let Some(guest) = host.guest {
                let dirty = if host.dirty { " (dirty)" } else { "" };
                map.entry(&guest, &format_args!("{:?}{}", host.reg, dirty));
            }
        }
        map.finish()
    }
}
