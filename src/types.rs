/// Index of a server in the cluster, in `[0, cluster_size)`.
pub type PeerIndex = usize;

/// Local index of one of a server's `cluster_size - 1` peer connections.
pub type Slot = usize;

/// Synchronization flag slot, in `[0, max_flags)`.
pub type FlagId = usize;

/// Width of every remote atomic operand in bytes.
pub const ATOMIC_WIDTH: usize = 8;

/// Which end of a link this server plays while the link is being established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Listens and accepts (links to lower-indexed peers).
    Passive,
    /// Dials (links to higher-indexed peers).
    Active,
}

impl Role {
    pub const fn name(self) -> &'static str {
        match self {
            Role::Passive => "passive",
            Role::Active => "active",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
