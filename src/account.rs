use std::collections::{BTreeMap, BTreeSet, HashMap};

use rlp::{Rlp, RlpStream};

use crate::common::{Addr, Bytes, Hash, U256RLP, U256};
use crate::db::NodeOverlay;
use crate::trie::{empty_trie_root, SecureTrie, SecureTrieMut};

pub type AccountMap = HashMap<Addr, Account>;

#[inline(always)]
fn storage_key_bytes(key: &U256) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    key.to_big_endian(&mut bytes);
    bytes
}

/// One addressable record of the world state: asset balances across all
/// tracks, nonce, contract code/storage, and voting bookkeeping.
///
/// The entity itself is deliberately dumb: every mutator wraps at the
/// 256-bit boundary and only flips the dirty bit. Preconditions (no
/// underflow, account existence) and undo journaling are the state view's
/// job, so the view's rollback path can drive these same methods without
/// producing new journal entries.
#[derive(Clone, Debug)]
pub struct Account {
    nonce: U256,
    balance: U256,
    /// Root of the storage sub-trie as of the last commit (or clear).
    storage_root: Hash,
    code_hash: Hash,
    ballot: U256,
    poll: U256,
    brc: U256,
    fbrc: U256,
    fbalance: U256,
    /// Votes delegated to others; ordered so the serialized record is a
    /// pure function of content.
    vote_ledger: BTreeMap<Addr, U256>,
    /// Membership roster kept by designated system accounts. In-memory
    /// only: the on-disk record does not carry it.
    sys_votes: BTreeSet<Addr>,
    /// Resolved code bytes; `None` until someone asks for code.
    code: Option<Bytes>,
    /// Uncommitted storage writes shadowing the sub-trie; zero means
    /// "deleted".
    storage_overlay: BTreeMap<U256, U256>,
    dirty: bool,
    alive: bool,
    has_new_code: bool,
}

impl Account {
    /// Fresh account entering the cache through a write; alive and dirty.
    pub fn new(nonce: U256, balance: U256) -> Self {
        Self {
            nonce,
            balance,
            storage_root: empty_trie_root().clone(),
            code_hash: Hash::empty_bytes_hash().clone(),
            ballot: U256::zero(),
            poll: U256::zero(),
            brc: U256::zero(),
            fbrc: U256::zero(),
            fbalance: U256::zero(),
            vote_ledger: BTreeMap::new(),
            sys_votes: BTreeSet::new(),
            code: None,
            storage_overlay: BTreeMap::new(),
            dirty: true,
            alive: true,
            has_new_code: false,
        }
    }

    /// Fresh account funded on the secondary asset track.
    pub fn new_brc(nonce: U256, brc: U256) -> Self {
        let mut a = Self::new(nonce, U256::zero());
        a.brc = brc;
        a
    }

    // field reads

    pub fn nonce(&self) -> U256 {
        self.nonce
    }

    pub fn balance(&self) -> U256 {
        self.balance
    }

    pub fn ballot(&self) -> U256 {
        self.ballot
    }

    pub fn poll(&self) -> U256 {
        self.poll
    }

    pub fn brc(&self) -> U256 {
        self.brc
    }

    pub fn fbrc(&self) -> U256 {
        self.fbrc
    }

    pub fn fbalance(&self) -> U256 {
        self.fbalance
    }

    pub fn storage_root(&self) -> &Hash {
        &self.storage_root
    }

    pub fn code_hash(&self) -> &Hash {
        &self.code_hash
    }

    pub fn code(&self) -> Option<&Bytes> {
        self.code.as_ref()
    }

    pub fn vote_ledger(&self) -> &BTreeMap<Addr, U256> {
        &self.vote_ledger
    }

    pub fn sys_votes(&self) -> &BTreeSet<Addr> {
        &self.sys_votes
    }

    pub fn storage_overlay(&self) -> &BTreeMap<U256, U256> {
        &self.storage_overlay
    }

    // liveness

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn has_new_code(&self) -> bool {
        self.has_new_code
    }

    /// An account indistinguishable from one that never existed. Such
    /// entries may be garbage-collected at commit time.
    pub fn is_empty(&self) -> bool {
        self.nonce.is_zero() &&
            self.balance.is_zero() &&
            self.code_hash == *Hash::empty_bytes_hash() &&
            self.ballot.is_zero() &&
            self.poll.is_zero() &&
            self.brc.is_zero() &&
            self.fbrc.is_zero() &&
            self.fbalance.is_zero() &&
            self.vote_ledger.is_empty() &&
            self.sys_votes.is_empty()
    }

    pub(crate) fn changed(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn untouch(&mut self) {
        self.dirty = false;
    }

    /// Logical destruction: wipe the record and mark it dirty so commit
    /// removes it from the trie.
    pub fn kill(&mut self) {
        *self = Self::new(U256::zero(), U256::zero());
        self.alive = false;
    }

    // wrap-around asset arithmetic; subtraction arrives as the
    // two's-complement of the amount

    pub fn add_balance(&mut self, v: U256) {
        self.balance = self.balance.overflowing_add(v).0;
        self.changed();
    }

    pub fn add_brc(&mut self, v: U256) {
        self.brc = self.brc.overflowing_add(v).0;
        self.changed();
    }

    pub fn add_fbrc(&mut self, v: U256) {
        self.fbrc = self.fbrc.overflowing_add(v).0;
        self.changed();
    }

    pub fn add_fbalance(&mut self, v: U256) {
        self.fbalance = self.fbalance.overflowing_add(v).0;
        self.changed();
    }

    pub fn add_ballot(&mut self, v: U256) {
        self.ballot = self.ballot.overflowing_add(v).0;
        self.changed();
    }

    pub fn add_poll(&mut self, v: U256) {
        self.poll = self.poll.overflowing_add(v).0;
        self.changed();
    }

    pub fn set_nonce(&mut self, nonce: U256) {
        self.nonce = nonce;
        self.changed();
    }

    pub fn inc_nonce(&mut self) {
        self.nonce = self.nonce.overflowing_add(U256::one()).0;
        self.changed();
    }

    // voting

    pub fn vote(&self, receiver: &Addr) -> U256 {
        self.vote_ledger
            .get(receiver)
            .cloned()
            .unwrap_or_else(U256::zero)
    }

    /// Total ballots this account has spent voting.
    pub fn vote_all(&self) -> U256 {
        self.vote_ledger
            .values()
            .fold(U256::zero(), |acc, v| acc.overflowing_add(*v).0)
    }

    pub fn add_vote(&mut self, receiver: &Addr, delta: U256) {
        let next = self.vote(receiver).overflowing_add(delta).0;
        if next.is_zero() {
            self.vote_ledger.remove(receiver);
        } else {
            self.vote_ledger.insert(receiver.clone(), next);
        }
        self.changed();
    }

    pub fn manage_sys_vote(&mut self, member: &Addr, add: bool) {
        if add {
            self.sys_votes.insert(member.clone());
        } else {
            self.sys_votes.remove(member);
        }
        self.changed();
    }

    // storage

    pub fn set_storage(&mut self, key: U256, value: U256) {
        self.storage_overlay.insert(key, value);
        self.changed();
    }

    /// Drop the whole storage sub-trie along with any uncommitted writes.
    pub fn clear_storage(&mut self) {
        self.storage_overlay.clear();
        self.storage_root = empty_trie_root().clone();
        self.changed();
    }

    /// Rollback helper: re-anchor the sub-trie and discard the overlay.
    pub fn set_storage_root(&mut self, root: Hash) {
        self.storage_overlay.clear();
        self.storage_root = root;
    }

    /// Current value under `key`: the uncommitted overlay shadows the
    /// sub-trie.
    pub fn storage_value(&self, key: &U256, db: &NodeOverlay) -> U256 {
        match self.storage_overlay.get(key) {
            Some(v) => *v,
            None => self.original_storage_value(key, db),
        }
    }

    /// Committed value under `key`, bypassing the overlay.
    pub fn original_storage_value(&self, key: &U256, db: &NodeOverlay) -> U256 {
        SecureTrie::new(db, &self.storage_root)
            .get(&storage_key_bytes(key))
            .and_then(|raw| rlp::decode::<U256RLP>(&raw).ok())
            .map(|v| v.0)
            .unwrap_or_else(U256::zero)
    }

    /// Flush the overlay into the storage sub-trie: non-zero values are
    /// written, zeroes delete. Leaves the overlay empty and the root
    /// updated.
    pub fn commit_storage(&mut self, db: &mut NodeOverlay) {
        if self.storage_overlay.is_empty() {
            return
        }
        #[cfg(feature = "fatdb")]
        for key in self.storage_overlay.keys() {
            let kb = storage_key_bytes(key);
            db.note_preimage(Hash::hash(&kb).to_fixed_bytes(), &kb);
        }
        let mut root = self.storage_root.to_fixed_bytes();
        {
            let mut trie = SecureTrieMut::new(db, &mut root);
            for (key, value) in &self.storage_overlay {
                let kb = storage_key_bytes(key);
                if value.is_zero() {
                    trie.remove(&kb);
                } else {
                    trie.insert(&kb, &rlp::encode(&U256RLP(*value)));
                }
            }
        }
        self.storage_root = root.into();
        self.storage_overlay.clear();
    }

    // code

    /// Attach code bytes resolved from the backing store.
    pub fn note_code(&mut self, code: Bytes) {
        debug_assert_eq!(Hash::hash(&code), self.code_hash);
        self.code = Some(code);
    }

    pub fn set_code(&mut self, code: Bytes) {
        self.code_hash = Hash::hash(&code);
        self.code = Some(code);
        self.has_new_code = true;
        self.changed();
    }

    /// Rollback helper: restore previous code bytes and drop the
    /// fresh-code mark.
    pub fn revert_code(&mut self, code: Bytes) {
        self.code_hash = Hash::hash(&code);
        self.code = Some(code);
        self.has_new_code = false;
    }

    // canonical record

    /// Length-prefixed 10-field record; the vote ledger nests as a
    /// byte-string holding `[count, (address, amount)...]`.
    pub fn rlp(&self) -> Vec<u8> {
        let mut s = RlpStream::new_list(10);
        s.append(&U256RLP(self.nonce))
            .append(&U256RLP(self.balance))
            .append(&self.storage_root)
            .append(&self.code_hash)
            .append(&U256RLP(self.ballot))
            .append(&U256RLP(self.poll));
        let mut votes = RlpStream::new_list(self.vote_ledger.len() + 1);
        votes.append(&(self.vote_ledger.len() as u64));
        for (addr, amount) in &self.vote_ledger {
            let mut pair = RlpStream::new_list(2);
            pair.append(addr).append(&U256RLP(*amount));
            votes.append_raw(&pair.out(), 1);
        }
        s.append(&Bytes::from(votes.out().to_vec()))
            .append(&U256RLP(self.brc))
            .append(&U256RLP(self.fbrc))
            .append(&U256RLP(self.fbalance));
        s.out().to_vec()
    }

    /// Decode a record loaded from the trie; the result is clean (not
    /// dirty) and alive.
    pub fn from_rlp(raw: &[u8]) -> Result<Self, rlp::DecoderError> {
        let r = Rlp::new(raw);
        let mut a = Self::new(
            r.val_at::<U256RLP>(0)?.0,
            r.val_at::<U256RLP>(1)?.0,
        );
        a.storage_root = r.val_at::<Hash>(2)?;
        a.code_hash = r.val_at::<Hash>(3)?;
        a.ballot = r.val_at::<U256RLP>(4)?.0;
        a.poll = r.val_at::<U256RLP>(5)?.0;
        let vote_blob: Bytes = r.val_at(6)?;
        let votes = Rlp::new(&vote_blob);
        let count: u64 = votes.val_at(0)?;
        for i in 1..=count as usize {
            let pair = votes.at(i)?;
            a.vote_ledger
                .insert(pair.val_at::<Addr>(0)?, pair.val_at::<U256RLP>(1)?.0);
        }
        a.brc = r.val_at::<U256RLP>(7)?.0;
        a.fbrc = r.val_at::<U256RLP>(8)?.0;
        a.fbalance = r.val_at::<U256RLP>(9)?.0;
        a.dirty = false;
        Ok(a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::u256_neg;

    #[test]
    fn test_record_roundtrip() {
        let mut a = Account::new(3.into(), 1000.into());
        a.add_ballot(7.into());
        a.add_poll(2.into());
        a.add_brc(40.into());
        a.add_fbrc(5.into());
        a.add_fbalance(6.into());
        a.add_vote(&Addr::from(U256::from(9)), 4.into());
        a.add_vote(&Addr::from(U256::from(11)), 3.into());
        a.set_code(b"\x60\x00".as_slice().into());

        let b = Account::from_rlp(&a.rlp()).unwrap();
        assert_eq!(b.nonce(), a.nonce());
        assert_eq!(b.balance(), a.balance());
        assert_eq!(b.ballot(), a.ballot());
        assert_eq!(b.poll(), a.poll());
        assert_eq!(b.brc(), a.brc());
        assert_eq!(b.fbrc(), a.fbrc());
        assert_eq!(b.fbalance(), a.fbalance());
        assert_eq!(b.code_hash(), a.code_hash());
        assert_eq!(b.vote_ledger(), a.vote_ledger());
        assert_eq!(b.vote_all(), U256::from(7));
        assert!(!b.is_dirty());
    }

    #[test]
    fn test_record_is_content_deterministic() {
        let mut a = Account::new(1.into(), 2.into());
        a.add_vote(&Addr::from(U256::from(1)), 10.into());
        a.add_vote(&Addr::from(U256::from(2)), 20.into());
        let mut b = Account::new(1.into(), 2.into());
        b.add_vote(&Addr::from(U256::from(2)), 20.into());
        b.add_vote(&Addr::from(U256::from(1)), 10.into());
        assert_eq!(a.rlp(), b.rlp());
    }

    #[test]
    fn test_empty_accounts() {
        let a = Account::new(0.into(), 0.into());
        assert!(a.is_empty());
        let mut b = Account::new(0.into(), 0.into());
        b.add_brc(1.into());
        assert!(!b.is_empty());
        let c = Account::new(1.into(), 0.into());
        assert!(!c.is_empty());
    }

    #[test]
    fn test_wrapping_sub() {
        let mut a = Account::new(0.into(), 100.into());
        a.add_balance(u256_neg(&30.into()));
        assert_eq!(a.balance(), U256::from(70));
    }

    #[test]
    fn test_vote_entry_drops_at_zero() {
        let r = Addr::from(U256::from(5));
        let mut a = Account::new(0.into(), 0.into());
        a.add_vote(&r, 4.into());
        assert_eq!(a.vote(&r), U256::from(4));
        a.add_vote(&r, u256_neg(&4.into()));
        assert_eq!(a.vote(&r), U256::zero());
        assert!(a.vote_ledger().is_empty());
    }

    #[test]
    fn test_storage_overlay_shadows_trie() {
        let mut db = NodeOverlay::in_memory();
        let mut a = Account::new(0.into(), 0.into());
        a.set_storage(1.into(), 11.into());
        a.set_storage(2.into(), 22.into());
        a.commit_storage(&mut db);
        assert!(a.storage_overlay().is_empty());
        assert_eq!(a.storage_value(&1.into(), &db), U256::from(11));

        a.set_storage(1.into(), 33.into());
        assert_eq!(a.storage_value(&1.into(), &db), U256::from(33));
        assert_eq!(a.original_storage_value(&1.into(), &db), U256::from(11));

        // zero means delete
        a.set_storage(2.into(), 0.into());
        a.commit_storage(&mut db);
        assert_eq!(a.storage_value(&2.into(), &db), U256::zero());
        assert_eq!(a.storage_value(&1.into(), &db), U256::from(33));
    }

    #[test]
    fn test_kill_wipes_record() {
        let mut a = Account::new(5.into(), 100.into());
        a.kill();
        assert!(!a.is_alive());
        assert!(a.is_dirty());
        assert!(a.balance().is_zero());
        assert!(a.nonce().is_zero());
    }
}
