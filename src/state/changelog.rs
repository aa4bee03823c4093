use crate::common::{Addr, Bytes, Hash, U256};

/// One reverse operation in the journal. Each mutator appends the record
/// that undoes it; unwinding the journal back to a savepoint restores
/// every observable account field to its value at that point.
///
/// Addresses are stored by value: the journal never holds pointers into
/// the cache, so cache eviction and rollback cannot invalidate each
/// other.
#[derive(Clone, Debug)]
pub enum Change {
    /// Storage write; undone by restoring the previous value.
    Storage { addr: Addr, key: U256, prev: U256 },
    /// Whole-sub-trie replacement (storage clear); undone by re-anchoring
    /// the previous root and dropping the overlay.
    StorageRoot { addr: Addr, prev: Hash },
    /// Primary-asset delta; undone by adding the negation.
    Balance { addr: Addr, amount: U256 },
    /// Secondary-asset delta.
    Brc { addr: Addr, amount: U256 },
    /// Frozen secondary-asset delta.
    Fbrc { addr: Addr, amount: U256 },
    /// Frozen primary-asset delta.
    Fbalance { addr: Addr, amount: U256 },
    /// Nonce write; undone by restoring the previous nonce.
    Nonce { addr: Addr, prev: U256 },
    /// Account materialization; undone by erasing the cache entry.
    Create { addr: Addr },
    /// Code write; undone by restoring the previous bytes.
    Code { addr: Addr, prev: Bytes },
    /// First write to a clean empty account; undone by clearing the dirty
    /// bit and returning the address to the clean-eviction list.
    Touch { addr: Addr },
    /// Spendable voting-power delta.
    Ballot { addr: Addr, amount: U256 },
    /// Received-votes delta, keyed by the receiving account.
    Poll { addr: Addr, amount: U256 },
    /// Vote-ledger delta on the voter for one receiver.
    Vote { addr: Addr, receiver: Addr, amount: U256 },
    /// System-roster membership flip.
    SysVote { addr: Addr, member: Addr, added: bool },
}

impl Change {
    pub fn address(&self) -> &Addr {
        match self {
            Change::Storage { addr, .. } |
            Change::StorageRoot { addr, .. } |
            Change::Balance { addr, .. } |
            Change::Brc { addr, .. } |
            Change::Fbrc { addr, .. } |
            Change::Fbalance { addr, .. } |
            Change::Nonce { addr, .. } |
            Change::Create { addr } |
            Change::Code { addr, .. } |
            Change::Touch { addr } |
            Change::Ballot { addr, .. } |
            Change::Poll { addr, .. } |
            Change::Vote { addr, .. } |
            Change::SysVote { addr, .. } => addr,
        }
    }
}
