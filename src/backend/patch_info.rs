/// How control leaves a block through a link site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    /// Plain branch: enters the destination through its checked entry.
    Jump,
    /// Branch-and-link: a budget check picks the normal entry while cycles remain.
    Call,
}

/// A fixed-size, patchable exit recorded while a block is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkSite {
    /// Host address of the first byte of the slot.
    pub address: usize,
    /// Guest address the exit branches to.
    pub exit_address: u32,
    pub kind: LinkKind,
}

/// Host entry points of a block a site can be linked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkDestination {
    pub checked_entry: usize,
    pub normal_entry: usize,
}

/// Outgoing exit of a compiled block and whether it currently points at its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkData {
    pub site: LinkSite,
    pub linked: bool,
}

impl LinkData {
    pub fn new(site: LinkSite) -> Self {
        Self { site, linked: false }
    }
}

/// Where the bytes of a link slot currently transfer control.
///
/// Produced by decoding a slot; used to verify patches and to walk linked code in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTarget {
    /// Loads `guest_pc` into the dispatcher register and jumps to the dispatcher.
    Dispatcher { guest_pc: u32, dispatcher: usize },
    /// Jumps to a host address, directly or through a scratch register.
    Jump { host: usize, indirect: bool },
    /// Calls `normal` while the cycle budget is positive, otherwise jumps to `checked`.
    BudgetedCall { checked: usize, normal: usize },
    /// Poisoned bytes of a destroyed block.
    Trap,
}

impl LinkTarget {
    /// Host address control reaches when the cycle budget is exhausted.
    pub fn slow_path(&self) -> Option<usize> {
        match *self {
            LinkTarget::Dispatcher { dispatcher, .. } => Some(dispatcher),
            LinkTarget::Jump { host, .. } => Some(host),
            LinkTarget::BudgetedCall { checked, .. } => Some(checked),
            LinkTarget::Trap => None,
        }
    }

    pub fn is_dispatcher(&self) -> bool {
        matches!(self, LinkTarget::Dispatcher { .. })
    }
}
