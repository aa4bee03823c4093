//! # qState: a layered, authenticated world-state database
//!
//! qState is the account database that backs transaction execution on a
//! multi-asset chain: a mutable, transactional view over a set of
//! accounts keyed by 20-byte addresses, each holding balances across
//! several asset tracks, a nonce, contract code and storage, and voting
//! records. At commit time the view serializes into a cryptographically
//! authenticated trie whose 32-byte root fingerprints the entire state.
//!
//! The crate deliberately stops at the state boundary. The execution
//! runtime, the RPC surface, the networking stack, and the block replay
//! loop are all consumers that plug in from outside (see [exec::Vm] for
//! the runtime seam); what lives here is the storage problem:
//!
//! - [state::State] gives the executor a cheap, mutable cache with
//!   single-writer semantics: reads lazily pull accounts out of the trie,
//!   writes land in memory, and a bounded list of *clean* entries is
//!   evicted at random so the cache never grows without bound while
//!   uncommitted data is never at risk.
//! - Every mutation appends its reverse operation to a journal, so any
//!   suffix of the work (typically "everything since this transaction
//!   started") can be unwound exactly ([state::State::savepoint] /
//!   [state::State::rollback]). Exceptional termination inside a runtime
//!   therefore cannot corrupt state.
//! - [trie::SecureTrie] keys the authenticated trie by keccak256 of the
//!   address, reading and writing nodes through [db::NodeOverlay], a
//!   write-buffered, copy-on-write layer over a pluggable key-value
//!   backend ([db::KeyValueDB]). Roots are a pure function of content:
//!   the same set of accounts hashes to the same root no matter the
//!   order of writes.
//! - [account::Account] is the entity itself, with its canonical
//!   10-field record layout; per-account storage lives in a sub-trie
//!   whose root is part of the record.
//!
//! A round trip looks like:
//!
//! ```notrust
//!     [runtime] --reads/writes--> [State cache] --commit--> [SecureTrie]
//!                                      |                        |
//!                                  (journal)               [NodeOverlay]
//!                                      |                        |
//!                                  rollback                 [KeyValueDB]
//! ```
//!
//! Everything in memory is deterministic by construction, from the
//! ordered vote ledgers down to the seeded eviction randomness, so a
//! replay of the same blocks produces bit-identical roots.

pub mod account;
pub mod common;
pub mod db;
pub mod error;
pub mod exec;
pub mod state;
pub mod trie;
