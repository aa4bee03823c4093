//! The single-writer, transactional view of the account universe: a
//! process-local cache over the authenticated account trie, journaled so
//! any sub-sequence of mutations can be unwound, with lazy loads, negative
//! caching, and bounded random eviction of clean entries.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

#[cfg(feature = "fatdb")] use std::collections::BTreeMap;

use log::{debug, trace, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rlp::Rlp;
use serde_json::json;

use crate::account::{Account, AccountMap};
#[cfg(feature = "fatdb")] use crate::common::U256RLP;
use crate::common::{u256_neg, Addr, Bytes, Hash, U256};
use crate::db::NodeOverlay;
use crate::error::{Error, ErrorKind, Result};
use crate::trie::{empty_trie_root, SecureTrie, SecureTrieMut};

mod changelog;
pub use changelog::Change;

/// Price, in BRC, of one ballot.
pub const BALLOT_PRICE: u64 = 1000;

/// Whether commit garbage-collects accounts that became empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitBehaviour {
    KeepEmptyAccounts,
    RemoveEmptyAccounts,
}

/// The four exchange order flavors. Placing an order moves assets from the
/// originator's normal pool into the matching frozen pool; nothing happens
/// to any counterparty until the order book (external to this crate)
/// settles a match.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderKind {
    BuyBrc,
    SellBrc,
    BuyFuel,
    SellFuel,
}

/// Construction-time knobs, so the view depends on no process-wide state.
#[derive(Clone, Debug)]
pub struct StateConfig {
    /// Nonce assigned to freshly created accounts. `None` keeps the
    /// sentinel: any operation that must auto-create fails
    /// [ErrorKind::InvalidAccountStartNonce] until
    /// [State::note_account_start_nonce] supplies a value.
    pub account_start_nonce: Option<U256>,
    /// Clean cache entries above this count are candidates for eviction.
    pub clean_cache_limit: usize,
    /// Seed for the eviction RNG; fixed so replays are deterministic.
    pub eviction_seed: [u8; 32],
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            account_start_nonce: None,
            clean_cache_limit: 1000,
            eviction_seed: [0; 32],
        }
    }
}

impl StateConfig {
    pub fn with_start_nonce(nonce: U256) -> Self {
        Self {
            account_start_nonce: Some(nonce),
            ..Default::default()
        }
    }
}

/// Mutable world-state view. Single writer: the caller serializes
/// mutation; concurrent readers belong on separate views derived from a
/// committed root.
pub struct State {
    db: NodeOverlay,
    root: Hash,
    cache: RefCell<HashMap<Addr, Account>>,
    /// Addresses of loaded-but-unmodified entries, eligible for eviction.
    clean: RefCell<Vec<Addr>>,
    /// Negative cache: addresses known to miss the trie.
    absent: RefCell<HashSet<Addr>>,
    changelog: Vec<Change>,
    /// Code sizes memoized by code hash. Content-addressed, so entries
    /// survive `set_root`.
    code_sizes: RefCell<HashMap<Hash, usize>>,
    rng: RefCell<StdRng>,
    start_nonce: Option<U256>,
    clean_limit: usize,
}

impl State {
    /// A view over an empty universe.
    pub fn new(cfg: StateConfig, db: NodeOverlay) -> Self {
        Self::from_root(cfg, db, empty_trie_root().clone())
    }

    /// A view anchored at a previously committed root.
    pub fn from_root(cfg: StateConfig, db: NodeOverlay, root: Hash) -> Self {
        Self {
            db,
            root,
            cache: RefCell::new(HashMap::new()),
            clean: RefCell::new(Vec::new()),
            absent: RefCell::new(HashSet::new()),
            changelog: Vec::new(),
            code_sizes: RefCell::new(HashMap::new()),
            rng: RefCell::new(StdRng::from_seed(cfg.eviction_seed)),
            start_nonce: cfg.account_start_nonce,
            clean_limit: cfg.clean_cache_limit,
        }
    }

    /// Empty view over a heap-backed store; the usual starting point for
    /// tests and replay tooling.
    pub fn in_memory(cfg: StateConfig) -> Self {
        Self::new(cfg, NodeOverlay::in_memory())
    }

    pub fn db(&self) -> &NodeOverlay {
        &self.db
    }

    /// Push buffered trie nodes and code blobs down to the backing store.
    pub fn flush(&mut self) -> usize {
        self.db.flush()
    }

    /// Record the domain start nonce. Recording a conflicting value twice
    /// is refused.
    pub fn note_account_start_nonce(&mut self, actual: U256) -> Result<()> {
        match self.start_nonce {
            None => {
                self.start_nonce = Some(actual);
                Ok(())
            }
            Some(v) if v == actual => Ok(()),
            Some(_) => Err(Error::new(
                ErrorKind::InvalidAccountStartNonce,
                "State::note_account_start_nonce",
            )),
        }
    }

    fn require_start_nonce(&self, interface: &'static str) -> Result<U256> {
        self.start_nonce
            .ok_or_else(|| {
                Error::new(ErrorKind::InvalidAccountStartNonce, interface)
            })
    }

    // cache plumbing

    /// Bring `addr` into the cache if it exists anywhere; returns whether
    /// it does. A trie miss is remembered in the negative cache.
    fn ensure_loaded(&self, addr: &Addr) -> bool {
        if self.cache.borrow().contains_key(addr) {
            return true
        }
        if self.absent.borrow().contains(addr) {
            return false
        }
        match SecureTrie::new(&self.db, &self.root).get(addr.as_bytes()) {
            None => {
                self.absent.borrow_mut().insert(addr.clone());
                false
            }
            Some(raw) => {
                self.evict_clean();
                let account = Account::from_rlp(&raw)
                    .expect("valid account record in state trie");
                self.cache.borrow_mut().insert(addr.clone(), account);
                self.clean.borrow_mut().push(addr.clone());
                true
            }
        }
    }

    /// Swap-remove random clean entries until the list fits the limit.
    /// Entries that turned dirty since being listed leave the list but
    /// stay cached; uncommitted data is never dropped.
    fn evict_clean(&self) {
        let mut clean = self.clean.borrow_mut();
        while clean.len() > self.clean_limit {
            let idx = self.rng.borrow_mut().gen_range(0..clean.len());
            let addr = clean.swap_remove(idx);
            let mut cache = self.cache.borrow_mut();
            if let Some(a) = cache.get(&addr) {
                if !a.is_dirty() {
                    trace!(target: "state", "evicting clean entry {}", addr);
                    cache.remove(&addr);
                }
            }
        }
    }

    fn with_account<R>(
        &self, addr: &Addr, f: impl FnOnce(&Account) -> R,
    ) -> Option<R> {
        if !self.ensure_loaded(addr) {
            return None
        }
        self.cache.borrow().get(addr).map(f)
    }

    /// Number of accounts currently cached (diagnostic).
    pub fn cached_accounts(&self) -> usize {
        self.cache.borrow().len()
    }

    // reads; a missing account uniformly reads as zero

    pub fn balance(&self, addr: &Addr) -> U256 {
        self.with_account(addr, |a| a.balance())
            .unwrap_or_else(U256::zero)
    }

    pub fn brc(&self, addr: &Addr) -> U256 {
        self.with_account(addr, |a| a.brc()).unwrap_or_else(U256::zero)
    }

    pub fn fbrc(&self, addr: &Addr) -> U256 {
        self.with_account(addr, |a| a.fbrc()).unwrap_or_else(U256::zero)
    }

    pub fn fbalance(&self, addr: &Addr) -> U256 {
        self.with_account(addr, |a| a.fbalance())
            .unwrap_or_else(U256::zero)
    }

    pub fn ballot(&self, addr: &Addr) -> U256 {
        self.with_account(addr, |a| a.ballot())
            .unwrap_or_else(U256::zero)
    }

    pub fn poll(&self, addr: &Addr) -> U256 {
        self.with_account(addr, |a| a.poll()).unwrap_or_else(U256::zero)
    }

    pub fn nonce(&self, addr: &Addr) -> U256 {
        self.with_account(addr, |a| a.nonce())
            .unwrap_or_else(|| self.start_nonce.unwrap_or_default())
    }

    /// Total ballots `addr` has spent voting.
    pub fn vote_all(&self, addr: &Addr) -> U256 {
        self.with_account(addr, |a| a.vote_all())
            .unwrap_or_else(U256::zero)
    }

    /// Ballots `voter` has delegated to `receiver`.
    pub fn vote_for(&self, voter: &Addr, receiver: &Addr) -> U256 {
        self.with_account(voter, |a| a.vote(receiver))
            .unwrap_or_else(U256::zero)
    }

    pub fn vote_ledger(
        &self, addr: &Addr,
    ) -> std::collections::BTreeMap<Addr, U256> {
        self.with_account(addr, |a| a.vote_ledger().clone())
            .unwrap_or_default()
    }

    pub fn storage(&self, addr: &Addr, key: &U256) -> U256 {
        self.with_account(addr, |a| a.storage_value(key, &self.db))
            .unwrap_or_else(U256::zero)
    }

    /// Committed storage value, ignoring uncommitted writes.
    pub fn original_storage(&self, addr: &Addr, key: &U256) -> U256 {
        self.with_account(addr, |a| a.original_storage_value(key, &self.db))
            .unwrap_or_else(U256::zero)
    }

    /// Storage root as recorded in the trie (i.e. as of the last commit).
    pub fn storage_root(&self, addr: &Addr) -> Hash {
        SecureTrie::new(&self.db, &self.root)
            .get(addr.as_bytes())
            .and_then(|raw| Rlp::new(&raw).val_at::<Hash>(2).ok())
            .unwrap_or_else(|| empty_trie_root().clone())
    }

    pub fn account_in_use(&self, addr: &Addr) -> bool {
        self.ensure_loaded(addr)
    }

    pub fn account_exists_nonempty(&self, addr: &Addr) -> bool {
        self.with_account(addr, |a| !a.is_empty()).unwrap_or(false)
    }

    pub fn address_has_code(&self, addr: &Addr) -> bool {
        self.with_account(addr, |a| {
            a.code_hash() != Hash::empty_bytes_hash()
        })
        .unwrap_or(false)
    }

    pub fn code_hash(&self, addr: &Addr) -> Hash {
        self.with_account(addr, |a| a.code_hash().clone())
            .unwrap_or_else(|| Hash::empty_bytes_hash().clone())
    }

    /// Code bytes of `addr`, resolving them from the backing store on
    /// first use.
    pub fn code(&self, addr: &Addr) -> Bytes {
        if !self.ensure_loaded(addr) {
            return Bytes::empty()
        }
        let mut cache = self.cache.borrow_mut();
        let a = cache.get_mut(addr).unwrap();
        if a.code_hash() == Hash::empty_bytes_hash() {
            return Bytes::empty()
        }
        if a.code().is_none() {
            match self.db.lookup(a.code_hash()) {
                Some(bytes) => {
                    self.code_sizes
                        .borrow_mut()
                        .insert(a.code_hash().clone(), bytes.len());
                    a.note_code(bytes.into());
                }
                None => {
                    warn!(
                        target: "state",
                        "code {} missing from store for {}",
                        a.code_hash(),
                        addr
                    );
                    return Bytes::empty()
                }
            }
        }
        a.code().cloned().unwrap_or_else(Bytes::empty)
    }

    pub fn code_size(&self, addr: &Addr) -> usize {
        if !self.ensure_loaded(addr) {
            return 0
        }
        let hash = {
            let cache = self.cache.borrow();
            let a = cache.get(addr).unwrap();
            if a.has_new_code() {
                return a.code().map(|c| c.len()).unwrap_or(0)
            }
            a.code_hash().clone()
        };
        if let Some(size) = self.code_sizes.borrow().get(&hash) {
            return *size
        }
        self.code(addr).len()
    }

    /// Human-facing JSON summary of one account.
    pub fn account_json(&self, addr: &Addr) -> Option<serde_json::Value> {
        self.with_account(addr, |a| {
            let votes: Vec<serde_json::Value> = a
                .vote_ledger()
                .iter()
                .map(|(to, n)| {
                    json!({ "address": to, "votes": format!("0x{:x}", n) })
                })
                .collect();
            json!({
                "address": addr,
                "balance": format!("0x{:x}", a.balance()),
                "fbalance": format!("0x{:x}", a.fbalance()),
                "brc": format!("0x{:x}", a.brc()),
                "fbrc": format!("0x{:x}", a.fbrc()),
                "ballot": format!("0x{:x}", a.ballot()),
                "poll": format!("0x{:x}", a.poll()),
                "nonce": format!("0x{:x}", a.nonce()),
                "vote": votes,
            })
        })
    }

    // lifecycle

    /// Install a fresh account. The caller guarantees the address is not
    /// in use.
    pub fn create_account(&mut self, addr: Addr, account: Account) {
        debug_assert!(
            !self.account_in_use(&addr),
            "account {} already exists",
            addr
        );
        self.cache.get_mut().insert(addr.clone(), account);
        self.absent.get_mut().remove(&addr);
        self.changelog.push(Change::Create { addr });
    }

    pub fn create_contract(&mut self, addr: &Addr) -> Result<()> {
        let nonce = self.require_start_nonce("State::create_contract")?;
        self.create_account(addr.clone(), Account::new(nonce, U256::zero()));
        Ok(())
    }

    /// Logical destruction; the trie entry disappears at the next commit.
    /// Killing a missing account is a no-op.
    pub fn kill(&mut self, addr: &Addr) {
        if self.ensure_loaded(addr) {
            self.cache.get_mut().get_mut(addr).unwrap().kill();
        }
    }

    // primary asset

    pub fn add_balance(&mut self, addr: &Addr, amount: &U256) -> Result<()> {
        if self.ensure_loaded(addr) {
            let mut cache = self.cache.borrow_mut();
            let a = cache.get_mut(addr).unwrap();
            // The first write to a clean empty account must be
            // revertible on its own: it makes the entry dirty, which
            // keeps it out of empty-account collection.
            if !a.is_dirty() && a.is_empty() {
                self.changelog.push(Change::Touch { addr: addr.clone() });
            }
            a.add_balance(*amount);
        } else {
            let nonce = self.require_start_nonce("State::add_balance")?;
            self.create_account(addr.clone(), Account::new(nonce, *amount));
        }
        if !amount.is_zero() {
            self.changelog.push(Change::Balance {
                addr: addr.clone(),
                amount: *amount,
            });
        }
        Ok(())
    }

    pub fn sub_balance(&mut self, addr: &Addr, amount: &U256) -> Result<()> {
        if amount.is_zero() {
            return Ok(())
        }
        if self.balance(addr) < *amount {
            return Err(Error::new(
                ErrorKind::InsufficientFunds,
                "State::sub_balance",
            ))
        }
        self.add_balance(addr, &u256_neg(amount))
    }

    pub fn set_balance(&mut self, addr: &Addr, value: &U256) -> Result<()> {
        let original = self.balance(addr);
        self.add_balance(addr, &value.overflowing_sub(original).0)
    }

    // secondary asset

    pub fn add_brc(&mut self, addr: &Addr, amount: &U256) -> Result<()> {
        if self.ensure_loaded(addr) {
            let mut cache = self.cache.borrow_mut();
            let a = cache.get_mut(addr).unwrap();
            if !a.is_dirty() && a.is_empty() {
                self.changelog.push(Change::Touch { addr: addr.clone() });
            }
            a.add_brc(*amount);
        } else {
            let nonce = self.require_start_nonce("State::add_brc")?;
            self.create_account(addr.clone(), Account::new_brc(nonce, *amount));
        }
        if !amount.is_zero() {
            self.changelog.push(Change::Brc {
                addr: addr.clone(),
                amount: *amount,
            });
        }
        Ok(())
    }

    pub fn sub_brc(&mut self, addr: &Addr, amount: &U256) -> Result<()> {
        if amount.is_zero() {
            return Ok(())
        }
        if self.brc(addr) < *amount {
            return Err(Error::new(
                ErrorKind::InsufficientFunds,
                "State::sub_brc",
            ))
        }
        self.add_brc(addr, &u256_neg(amount))
    }

    pub fn set_brc(&mut self, addr: &Addr, value: &U256) -> Result<()> {
        let original = self.brc(addr);
        self.add_brc(addr, &value.overflowing_sub(original).0)
    }

    // frozen pools; the add side never creates an account, an absent
    // target is left absent and nothing is journaled

    pub fn add_fbrc(&mut self, addr: &Addr, amount: &U256) {
        if !self.ensure_loaded(addr) {
            return
        }
        {
            let mut cache = self.cache.borrow_mut();
            let a = cache.get_mut(addr).unwrap();
            if !a.is_dirty() && a.is_empty() {
                self.changelog.push(Change::Touch { addr: addr.clone() });
            }
            a.add_fbrc(*amount);
        }
        if !amount.is_zero() {
            self.changelog.push(Change::Fbrc {
                addr: addr.clone(),
                amount: *amount,
            });
        }
    }

    pub fn sub_fbrc(&mut self, addr: &Addr, amount: &U256) -> Result<()> {
        if amount.is_zero() {
            return Ok(())
        }
        if self.fbrc(addr) < *amount {
            return Err(Error::new(
                ErrorKind::InsufficientFunds,
                "State::sub_fbrc",
            ))
        }
        self.add_fbrc(addr, &u256_neg(amount));
        Ok(())
    }

    pub fn add_fbalance(&mut self, addr: &Addr, amount: &U256) {
        if !self.ensure_loaded(addr) {
            return
        }
        {
            let mut cache = self.cache.borrow_mut();
            let a = cache.get_mut(addr).unwrap();
            if !a.is_dirty() && a.is_empty() {
                self.changelog.push(Change::Touch { addr: addr.clone() });
            }
            a.add_fbalance(*amount);
        }
        if !amount.is_zero() {
            self.changelog.push(Change::Fbalance {
                addr: addr.clone(),
                amount: *amount,
            });
        }
    }

    pub fn sub_fbalance(&mut self, addr: &Addr, amount: &U256) -> Result<()> {
        if amount.is_zero() {
            return Ok(())
        }
        if self.fbalance(addr) < *amount {
            return Err(Error::new(
                ErrorKind::InsufficientFunds,
                "State::sub_fbalance",
            ))
        }
        self.add_fbalance(addr, &u256_neg(amount));
        Ok(())
    }

    // voting power

    pub fn add_ballot(&mut self, addr: &Addr, amount: &U256) -> Result<()> {
        if self.ensure_loaded(addr) {
            let mut cache = self.cache.borrow_mut();
            let a = cache.get_mut(addr).unwrap();
            if !a.is_dirty() && a.is_empty() {
                self.changelog.push(Change::Touch { addr: addr.clone() });
            }
            a.add_ballot(*amount);
        } else {
            return Err(Error::new(
                ErrorKind::InvalidAddress,
                "State::add_ballot",
            ))
        }
        if !amount.is_zero() {
            self.changelog.push(Change::Ballot {
                addr: addr.clone(),
                amount: *amount,
            });
        }
        Ok(())
    }

    pub fn sub_ballot(&mut self, addr: &Addr, amount: &U256) -> Result<()> {
        if amount.is_zero() {
            return Ok(())
        }
        if self.ballot(addr) < *amount {
            return Err(Error::new(
                ErrorKind::InsufficientBallot,
                "State::sub_ballot",
            ))
        }
        self.add_ballot(addr, &u256_neg(amount))
    }

    pub fn add_poll(&mut self, addr: &Addr, amount: &U256) -> Result<()> {
        if self.ensure_loaded(addr) {
            let mut cache = self.cache.borrow_mut();
            let a = cache.get_mut(addr).unwrap();
            if !a.is_dirty() && a.is_empty() {
                self.changelog.push(Change::Touch { addr: addr.clone() });
            }
            a.add_poll(*amount);
        } else {
            return Err(Error::new(
                ErrorKind::InvalidAddress,
                "State::add_poll",
            ))
        }
        if !amount.is_zero() {
            self.changelog.push(Change::Poll {
                addr: addr.clone(),
                amount: *amount,
            });
        }
        Ok(())
    }

    pub fn sub_poll(&mut self, addr: &Addr, amount: &U256) -> Result<()> {
        if amount.is_zero() {
            return Ok(())
        }
        if self.poll(addr) < *amount {
            return Err(Error::new(
                ErrorKind::InsufficientPoll,
                "State::sub_poll",
            ))
        }
        self.add_poll(addr, &u256_neg(amount))
    }

    // nonce

    pub fn inc_nonce(&mut self, addr: &Addr) -> Result<()> {
        if self.ensure_loaded(addr) {
            let prev = {
                let mut cache = self.cache.borrow_mut();
                let a = cache.get_mut(addr).unwrap();
                let prev = a.nonce();
                a.inc_nonce();
                prev
            };
            self.changelog.push(Change::Nonce {
                addr: addr.clone(),
                prev,
            });
        } else {
            // happens for zero-cost transactions from fresh senders
            let start = self.require_start_nonce("State::inc_nonce")?;
            self.create_account(
                addr.clone(),
                Account::new(start.overflowing_add(U256::one()).0, U256::zero()),
            );
        }
        Ok(())
    }

    pub fn set_nonce(&mut self, addr: &Addr, new_nonce: &U256) -> Result<()> {
        if self.ensure_loaded(addr) {
            let prev = {
                let mut cache = self.cache.borrow_mut();
                let a = cache.get_mut(addr).unwrap();
                let prev = a.nonce();
                a.set_nonce(*new_nonce);
                prev
            };
            self.changelog.push(Change::Nonce {
                addr: addr.clone(),
                prev,
            });
        } else {
            // contract creation path
            self.create_account(
                addr.clone(),
                Account::new(*new_nonce, U256::zero()),
            );
        }
        Ok(())
    }

    // contract storage and code

    pub fn set_storage(
        &mut self, addr: &Addr, key: U256, value: U256,
    ) -> Result<()> {
        let prev = self.storage(addr, &key);
        if !self.ensure_loaded(addr) {
            let nonce = self.require_start_nonce("State::set_storage")?;
            self.create_account(
                addr.clone(),
                Account::new(nonce, U256::zero()),
            );
        }
        self.changelog.push(Change::Storage {
            addr: addr.clone(),
            key,
            prev,
        });
        self.cache.get_mut().get_mut(addr).unwrap().set_storage(key, value);
        Ok(())
    }

    /// Drop the whole storage sub-trie of `addr`. No-op when there is
    /// nothing to drop.
    pub fn clear_storage(&mut self, addr: &Addr) {
        if !self.ensure_loaded(addr) {
            return
        }
        let prev = self
            .cache
            .borrow()
            .get(addr)
            .unwrap()
            .storage_root()
            .clone();
        if &prev == empty_trie_root() {
            return
        }
        self.changelog.push(Change::StorageRoot {
            addr: addr.clone(),
            prev,
        });
        self.cache.get_mut().get_mut(addr).unwrap().clear_storage();
    }

    pub fn set_code(&mut self, addr: &Addr, code: Bytes) -> Result<()> {
        let prev = self.code(addr);
        if !self.ensure_loaded(addr) {
            let nonce = self.require_start_nonce("State::set_code")?;
            self.create_account(
                addr.clone(),
                Account::new(nonce, U256::zero()),
            );
        }
        self.changelog.push(Change::Code {
            addr: addr.clone(),
            prev,
        });
        self.cache.get_mut().get_mut(addr).unwrap().set_code(code);
        Ok(())
    }

    // voting

    /// Move `amount` of `voter`'s spendable ballots onto `receiver`'s
    /// poll, remembering the delegation in the voter's ledger. One atomic
    /// operation: three journal entries or none.
    pub fn add_vote(
        &mut self, voter: &Addr, receiver: &Addr, amount: &U256,
    ) -> Result<()> {
        if !self.ensure_loaded(voter) || !self.ensure_loaded(receiver) {
            return Err(Error::new(
                ErrorKind::InvalidAddress,
                "State::add_vote",
            ))
        }
        if self.ballot(voter) < *amount {
            return Err(Error::new(
                ErrorKind::InsufficientBallot,
                "State::add_vote",
            ))
        }
        {
            let mut cache = self.cache.borrow_mut();
            cache.get_mut(voter).unwrap().add_ballot(u256_neg(amount));
            cache.get_mut(receiver).unwrap().add_poll(*amount);
            cache.get_mut(voter).unwrap().add_vote(receiver, *amount);
        }
        if !amount.is_zero() {
            self.changelog.push(Change::Vote {
                addr: voter.clone(),
                receiver: receiver.clone(),
                amount: *amount,
            });
            self.changelog.push(Change::Ballot {
                addr: voter.clone(),
                amount: u256_neg(amount),
            });
            self.changelog.push(Change::Poll {
                addr: receiver.clone(),
                amount: *amount,
            });
        }
        Ok(())
    }

    /// Retract a delegation. The ledger and the voter's ballots move by
    /// the requested amount; the poll decrement is clamped to what the
    /// receiver still has, since polls can shrink out-of-band.
    pub fn sub_vote(
        &mut self, voter: &Addr, receiver: &Addr, amount: &U256,
    ) -> Result<()> {
        if !self.ensure_loaded(voter) || !self.ensure_loaded(receiver) {
            return Err(Error::new(
                ErrorKind::InvalidAddress,
                "State::sub_vote",
            ))
        }
        if self.vote_for(voter, receiver) < *amount {
            return Err(Error::new(
                ErrorKind::InsufficientVoteLog,
                "State::sub_vote",
            ))
        }
        let poll_delta = std::cmp::min(self.poll(receiver), *amount);
        {
            let mut cache = self.cache.borrow_mut();
            cache.get_mut(voter).unwrap().add_vote(receiver, u256_neg(amount));
            cache.get_mut(voter).unwrap().add_ballot(*amount);
            cache.get_mut(receiver).unwrap().add_poll(u256_neg(&poll_delta));
        }
        if !amount.is_zero() {
            self.changelog.push(Change::Vote {
                addr: voter.clone(),
                receiver: receiver.clone(),
                amount: u256_neg(amount),
            });
            self.changelog.push(Change::Ballot {
                addr: voter.clone(),
                amount: *amount,
            });
            self.changelog.push(Change::Poll {
                addr: receiver.clone(),
                amount: u256_neg(&poll_delta),
            });
        }
        Ok(())
    }

    /// Enroll `member` into the roster kept by the system account,
    /// creating the latter on first use.
    pub fn add_sys_vote_data(
        &mut self, sys_addr: &Addr, member: &Addr,
    ) -> Result<()> {
        if !self.ensure_loaded(sys_addr) {
            let nonce =
                self.require_start_nonce("State::add_sys_vote_data")?;
            self.create_account(
                sys_addr.clone(),
                Account::new(nonce, U256::zero()),
            );
        }
        if !self.ensure_loaded(member) {
            return Err(Error::new(
                ErrorKind::InvalidAddress,
                "State::add_sys_vote_data",
            ))
        }
        self.cache
            .get_mut()
            .get_mut(sys_addr)
            .unwrap()
            .manage_sys_vote(member, true);
        self.changelog.push(Change::SysVote {
            addr: sys_addr.clone(),
            member: member.clone(),
            added: true,
        });
        Ok(())
    }

    pub fn sub_sys_vote_data(
        &mut self, sys_addr: &Addr, member: &Addr,
    ) -> Result<()> {
        if !self.ensure_loaded(sys_addr) {
            return Err(Error::new(
                ErrorKind::InvalidSystemAddress,
                "State::sub_sys_vote_data",
            ))
        }
        if !self.ensure_loaded(member) {
            return Err(Error::new(
                ErrorKind::InvalidAddress,
                "State::sub_sys_vote_data",
            ))
        }
        self.cache
            .get_mut()
            .get_mut(sys_addr)
            .unwrap()
            .manage_sys_vote(member, false);
        self.changelog.push(Change::SysVote {
            addr: sys_addr.clone(),
            member: member.clone(),
            added: false,
        });
        Ok(())
    }

    /// Purchase `amount` ballots for `from`, paying BRC over to `to`.
    pub fn transfer_ballot_buy(
        &mut self, from: &Addr, to: &Addr, amount: &U256,
    ) -> Result<()> {
        let cost = amount.overflowing_mul(BALLOT_PRICE.into()).0;
        self.sub_brc(from, &cost)?;
        self.add_brc(to, &cost)?;
        self.add_ballot(from, amount)
    }

    /// Sell `amount` of `from`'s ballots back, collecting BRC from `to`.
    pub fn transfer_ballot_sell(
        &mut self, from: &Addr, to: &Addr, amount: &U256,
    ) -> Result<()> {
        let cost = amount.overflowing_mul(BALLOT_PRICE.into()).0;
        self.sub_ballot(from, amount)?;
        self.add_brc(from, &cost)?;
        self.sub_brc(to, &cost)
    }

    // exchange bookkeeping

    /// Freeze the assets backing a fresh order on its originator.
    pub fn place_order(
        &mut self, addr: &Addr, kind: OrderKind, amount: &U256, price: &U256,
    ) -> Result<()> {
        match kind {
            OrderKind::BuyBrc => {
                let cost = amount.overflowing_mul(*price).0;
                self.sub_balance(addr, &cost)?;
                self.add_fbalance(addr, &cost);
            }
            OrderKind::SellBrc => {
                self.sub_brc(addr, amount)?;
                self.add_fbrc(addr, amount);
            }
            OrderKind::BuyFuel => {
                let cost = amount.overflowing_mul(*price).0;
                self.sub_brc(addr, &cost)?;
                self.add_fbrc(addr, &cost);
            }
            OrderKind::SellFuel => {
                self.sub_balance(addr, amount)?;
                self.add_fbalance(addr, amount);
            }
        }
        Ok(())
    }

    /// Thaw a cancelled order: the frozen pool shrinks, the normal pool
    /// gets the assets back.
    pub fn cancel_order(
        &mut self, addr: &Addr, kind: OrderKind, amount: &U256, price: &U256,
    ) -> Result<()> {
        match kind {
            OrderKind::BuyBrc => {
                let cost = amount.overflowing_mul(*price).0;
                self.sub_fbalance(addr, &cost)?;
                self.add_balance(addr, &cost)?;
            }
            OrderKind::SellBrc => {
                self.sub_fbrc(addr, amount)?;
                self.add_brc(addr, amount)?;
            }
            OrderKind::BuyFuel => {
                let cost = amount.overflowing_mul(*price).0;
                self.sub_fbrc(addr, &cost)?;
                self.add_brc(addr, &cost)?;
            }
            OrderKind::SellFuel => {
                self.sub_fbalance(addr, amount)?;
                self.add_balance(addr, amount)?;
            }
        }
        Ok(())
    }

    // transactional surface

    /// Current journal length; pass it back to [State::rollback] to
    /// unwind everything recorded since.
    pub fn savepoint(&self) -> usize {
        self.changelog.len()
    }

    /// Unwind the journal down to `savepoint`, newest record first. The
    /// undo path drives the account entities directly, since going through the
    /// public mutators would journal the undos themselves.
    pub fn rollback(&mut self, savepoint: usize) {
        while self.changelog.len() > savepoint {
            let change = self.changelog.pop().unwrap();
            trace!(target: "state", "rollback {:?}", change);
            let cache = self.cache.get_mut();
            match change {
                Change::Storage { addr, key, prev } => {
                    if let Some(a) = cache.get_mut(&addr) {
                        a.set_storage(key, prev);
                    }
                }
                Change::StorageRoot { addr, prev } => {
                    if let Some(a) = cache.get_mut(&addr) {
                        a.set_storage_root(prev);
                    }
                }
                Change::Balance { addr, amount } => {
                    if let Some(a) = cache.get_mut(&addr) {
                        a.add_balance(u256_neg(&amount));
                    }
                }
                Change::Brc { addr, amount } => {
                    if let Some(a) = cache.get_mut(&addr) {
                        a.add_brc(u256_neg(&amount));
                    }
                }
                Change::Fbrc { addr, amount } => {
                    if let Some(a) = cache.get_mut(&addr) {
                        a.add_fbrc(u256_neg(&amount));
                    }
                }
                Change::Fbalance { addr, amount } => {
                    if let Some(a) = cache.get_mut(&addr) {
                        a.add_fbalance(u256_neg(&amount));
                    }
                }
                Change::Nonce { addr, prev } => {
                    if let Some(a) = cache.get_mut(&addr) {
                        a.set_nonce(prev);
                    }
                }
                Change::Create { addr } => {
                    cache.remove(&addr);
                }
                Change::Code { addr, prev } => {
                    if let Some(a) = cache.get_mut(&addr) {
                        a.revert_code(prev);
                    }
                }
                Change::Touch { addr } => {
                    if let Some(a) = cache.get_mut(&addr) {
                        a.untouch();
                    }
                    self.clean.get_mut().push(addr);
                }
                Change::Ballot { addr, amount } => {
                    if let Some(a) = cache.get_mut(&addr) {
                        a.add_ballot(u256_neg(&amount));
                    }
                }
                Change::Poll { addr, amount } => {
                    if let Some(a) = cache.get_mut(&addr) {
                        a.add_poll(u256_neg(&amount));
                    }
                }
                Change::Vote {
                    addr,
                    receiver,
                    amount,
                } => {
                    if let Some(a) = cache.get_mut(&addr) {
                        a.add_vote(&receiver, u256_neg(&amount));
                    }
                }
                Change::SysVote { addr, member, added } => {
                    if let Some(a) = cache.get_mut(&addr) {
                        a.manage_sys_vote(&member, !added);
                    }
                }
            }
        }
    }

    /// Flush every dirty cache entry into the trie and return the new
    /// root. Dead entries leave the trie; with
    /// [CommitBehaviour::RemoveEmptyAccounts], dirty-and-empty entries
    /// die first. The journal, the cache, and the clean list are gone
    /// afterwards; the resulting root depends only on the set of final
    /// account values, never on cache iteration order.
    pub fn commit(&mut self, behaviour: CommitBehaviour) -> Hash {
        if behaviour == CommitBehaviour::RemoveEmptyAccounts {
            for a in self.cache.get_mut().values_mut() {
                if a.is_dirty() && a.is_empty() {
                    a.kill();
                }
            }
        }
        let cache = std::mem::take(self.cache.get_mut());
        let mut updates: Vec<(Addr, Option<Vec<u8>>)> = Vec::new();
        for (addr, mut a) in cache {
            if !a.is_dirty() {
                continue
            }
            if !a.is_alive() {
                updates.push((addr, None));
                continue
            }
            a.commit_storage(&mut self.db);
            if a.has_new_code() {
                let code = a.code().cloned().unwrap_or_else(Bytes::empty);
                self.code_sizes
                    .borrow_mut()
                    .insert(a.code_hash().clone(), code.len());
                let stored = self.db.insert_value(&code);
                debug_assert_eq!(&stored, a.code_hash());
            }
            updates.push((addr, Some(a.rlp())));
        }
        #[cfg(feature = "fatdb")]
        for (addr, value) in &updates {
            if value.is_some() {
                self.db.note_preimage(
                    Hash::hash(addr.as_bytes()).to_fixed_bytes(),
                    addr.as_bytes(),
                );
            }
        }
        let mut root = self.root.to_fixed_bytes();
        {
            let mut trie = SecureTrieMut::new(&mut self.db, &mut root);
            for (addr, value) in &updates {
                match value {
                    Some(raw) => trie.insert(addr.as_bytes(), raw),
                    None => trie.remove(addr.as_bytes()),
                }
            }
        }
        self.root = root.into();
        self.changelog.clear();
        self.clean.get_mut().clear();
        debug!(
            target: "statedb",
            "committed {} account(s), root {}",
            updates.len(),
            self.root
        );
        self.root.clone()
    }

    /// Root fingerprinting the state as of the last commit.
    pub fn root_hash(&self) -> Hash {
        self.root.clone()
    }

    /// Re-anchor the view at another committed root, discarding every
    /// cache. Used for historical queries and reorgs.
    pub fn set_root(&mut self, root: Hash) {
        self.cache.get_mut().clear();
        self.clean.get_mut().clear();
        self.absent.get_mut().clear();
        self.root = root;
    }

    /// Drop all uncommitted account data (the reverted-transaction path).
    pub(crate) fn clear_cache(&mut self) {
        self.cache.get_mut().clear();
    }

    /// Genesis initialisation: install `accounts` wholesale and commit,
    /// keeping empty entries so the starting trie is exactly the given
    /// map.
    pub fn populate_from(&mut self, accounts: AccountMap) -> Hash {
        for (addr, mut account) in accounts {
            account.changed();
            self.cache.get_mut().insert(addr, account);
        }
        self.commit(CommitBehaviour::KeepEmptyAccounts)
    }

    // full-DB enumeration; needs the key preimages recorded by `fatdb`
    // builds

    #[cfg(feature = "fatdb")]
    pub fn addresses(&self) -> Result<HashMap<Addr, U256>> {
        let mut ret = HashMap::new();
        let cache = self.cache.borrow();
        for (addr, a) in cache.iter() {
            if a.is_alive() {
                ret.insert(addr.clone(), a.balance());
            }
        }
        SecureTrie::new(&self.db, &self.root).for_each_from(
            Hash::zero(),
            |hashed, raw| {
                if let Some(pre) = self.db.preimage(&hashed.to_fixed_bytes()) {
                    let addr = Addr::from_slice(&pre);
                    if !cache.contains_key(&addr) {
                        if let Ok(balance) =
                            Rlp::new(&raw).val_at::<U256RLP>(1)
                        {
                            ret.insert(addr, balance.0);
                        }
                    }
                }
                true
            },
        );
        Ok(ret)
    }

    #[cfg(not(feature = "fatdb"))]
    pub fn addresses(&self) -> Result<HashMap<Addr, U256>> {
        Err(Error::new(
            ErrorKind::InterfaceNotSupported,
            "State::addresses",
        ))
    }

    /// Page through accounts by hashed address, starting at `begin`.
    /// Returns the page plus the next hashed key to resume from (zero when
    /// exhausted).
    #[cfg(feature = "fatdb")]
    pub fn addresses_from(
        &self, begin: &Hash, max: usize,
    ) -> Result<(BTreeMap<Hash, Addr>, Hash)> {
        let mut found = BTreeMap::new();
        let mut next = Hash::zero().clone();
        {
            let cache = self.cache.borrow();
            SecureTrie::new(&self.db, &self.root).for_each_from(
                begin,
                |hashed, _raw| {
                    let addr = match self
                        .db
                        .preimage(&hashed.to_fixed_bytes())
                    {
                        Some(pre) => Addr::from_slice(&pre),
                        None => return true,
                    };
                    // deleted in cache but not yet committed
                    if let Some(a) = cache.get(&addr) {
                        if a.is_dirty() && !a.is_alive() {
                            return true
                        }
                    }
                    if found.len() == max {
                        next = hashed;
                        return false
                    }
                    found.insert(hashed, addr);
                    true
                },
            );
            // new and touched accounts only the cache knows about
            for (addr, a) in cache.iter() {
                let hashed = Hash::hash(addr.as_bytes());
                if a.is_dirty() && a.is_alive() && &hashed >= begin {
                    found.insert(hashed, addr.clone());
                }
            }
        }
        if found.len() > max {
            let key = found.keys().nth(max).cloned().unwrap();
            found.split_off(&key);
            next = key;
        }
        Ok((found, next))
    }

    #[cfg(not(feature = "fatdb"))]
    pub fn addresses_from(
        &self, _begin: &Hash, _max: usize,
    ) -> Result<(std::collections::BTreeMap<Hash, Addr>, Hash)> {
        Err(Error::new(
            ErrorKind::InterfaceNotSupported,
            "State::addresses_from",
        ))
    }

    /// Full storage dump of one account: committed sub-trie content with
    /// the uncommitted overlay merged on top, keyed by hashed storage key.
    #[cfg(feature = "fatdb")]
    pub fn storage_map(
        &self, addr: &Addr,
    ) -> Result<BTreeMap<Hash, (U256, U256)>> {
        let mut ret = BTreeMap::new();
        if !self.ensure_loaded(addr) {
            return Ok(ret)
        }
        let cache = self.cache.borrow();
        let a = cache.get(addr).unwrap();
        SecureTrie::new(&self.db, a.storage_root()).for_each_from(
            Hash::zero(),
            |hashed, raw| {
                if let Some(pre) = self.db.preimage(&hashed.to_fixed_bytes()) {
                    let key = U256::from_big_endian(&pre);
                    if let Ok(value) = rlp::decode::<U256RLP>(&raw) {
                        ret.insert(hashed, (key, value.0));
                    }
                }
                true
            },
        );
        for (key, value) in a.storage_overlay() {
            let mut kb = [0u8; 32];
            key.to_big_endian(&mut kb);
            let hashed = Hash::hash(&kb);
            if value.is_zero() {
                ret.remove(&hashed);
            } else {
                ret.insert(hashed, (*key, *value));
            }
        }
        Ok(ret)
    }

    #[cfg(not(feature = "fatdb"))]
    pub fn storage_map(
        &self, _addr: &Addr,
    ) -> Result<std::collections::BTreeMap<Hash, (U256, U256)>> {
        Err(Error::new(
            ErrorKind::InterfaceNotSupported,
            "State::storage_map",
        ))
    }
}
