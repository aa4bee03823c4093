use hash_db::Hasher;
use once_cell::sync::OnceCell;
use reference_trie::{ExtensionLayout, RefHasher};
use trie_db::{Trie, TrieDB, TrieDBMut, TrieIterator, TrieMut};

use crate::common::Hash;
use crate::db::NodeOverlay;

/// Root of the trie with no entries.
pub fn empty_trie_root() -> &'static Hash {
    static V: OnceCell<Hash> = OnceCell::new();
    V.get_or_init(|| RefHasher::hash(&[0u8]).into())
}

#[inline(always)]
fn hashed_key(key: &[u8]) -> [u8; 32] {
    RefHasher::hash(key)
}

/// Read-only view of an authenticated key/value map at a fixed root. The
/// logical key is hashed with keccak256 before it touches the trie, so key
/// material never shapes the node structure ("secure" trie).
pub struct SecureTrie<'db> {
    db: &'db NodeOverlay,
    root: [u8; 32],
}

impl<'db> SecureTrie<'db> {
    pub fn new(db: &'db NodeOverlay, root: &Hash) -> Self {
        Self {
            db,
            root: root.to_fixed_bytes(),
        }
    }

    pub fn root(&self) -> Hash {
        self.root.into()
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let trie = TrieDB::<ExtensionLayout>::new(self.db, &self.root).ok()?;
        trie.get(&hashed_key(key)).ok()?
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Walk entries in hashed-key order, starting from the first key not
    /// below `start`. Stops early once `f` returns false.
    pub fn for_each_from(
        &self, start: &Hash, mut f: impl FnMut(Hash, Vec<u8>) -> bool,
    ) {
        let trie = match TrieDB::<ExtensionLayout>::new(self.db, &self.root) {
            Ok(t) => t,
            Err(_) => return,
        };
        let mut iter = match trie.iter() {
            Ok(i) => i,
            Err(_) => return,
        };
        if iter.seek(start.as_bytes()).is_err() {
            return
        }
        for item in iter {
            match item {
                Ok((key, value)) => {
                    if !f(Hash::from_slice(&key), value) {
                        break
                    }
                }
                Err(_) => break,
            }
        }
    }
}

/// Mutable counterpart of [SecureTrie]. The caller owns the root buffer;
/// it holds the updated root once the wrapper is dropped.
pub struct SecureTrieMut<'a> {
    trie: TrieDBMut<'a, ExtensionLayout>,
}

impl<'a> SecureTrieMut<'a> {
    pub fn new(db: &'a mut NodeOverlay, root: &'a mut [u8; 32]) -> Self {
        let fresh = *root == [0u8; 32] ||
            *root == empty_trie_root().to_fixed_bytes();
        let trie = if fresh {
            TrieDBMut::<ExtensionLayout>::new(db, root)
        } else {
            TrieDBMut::<ExtensionLayout>::from_existing(db, root).unwrap()
        };
        Self { trie }
    }

    pub fn insert(&mut self, key: &[u8], value: &[u8]) {
        self.trie.insert(&hashed_key(key), value).unwrap();
    }

    pub fn remove(&mut self, key: &[u8]) {
        self.trie.remove(&hashed_key(key)).unwrap();
    }

    /// Finalize pending node writes and return the current root.
    pub fn root(&mut self) -> Hash {
        (*self.trie.root()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_root_is_not_zero() {
        assert_ne!(empty_trie_root(), Hash::zero());
    }

    #[test]
    fn test_insert_get_remove() {
        let mut db = NodeOverlay::in_memory();
        let mut root = empty_trie_root().to_fixed_bytes();
        {
            let mut t = SecureTrieMut::new(&mut db, &mut root);
            t.insert(b"alpha", b"1");
            t.insert(b"beta", b"2");
        }
        let r1: Hash = root.into();
        assert_ne!(&r1, empty_trie_root());

        let t = SecureTrie::new(&db, &r1);
        assert_eq!(t.get(b"alpha"), Some(b"1".to_vec()));
        assert_eq!(t.get(b"beta"), Some(b"2".to_vec()));
        assert_eq!(t.get(b"gamma"), None);
        assert!(t.contains(b"alpha"));

        {
            let mut t = SecureTrieMut::new(&mut db, &mut root);
            t.remove(b"alpha");
            t.remove(b"beta");
        }
        assert_eq!(Hash::from(root), *empty_trie_root());
    }

    #[test]
    fn test_root_independent_of_insertion_order() {
        let keys: Vec<Vec<u8>> =
            (0u32..32).map(|i| i.to_be_bytes().to_vec()).collect();

        let commit = |reversed: bool| -> Hash {
            let mut db = NodeOverlay::in_memory();
            let mut root = empty_trie_root().to_fixed_bytes();
            let order: Vec<&Vec<u8>> = if reversed {
                keys.iter().rev().collect()
            } else {
                keys.iter().collect()
            };
            {
                let mut t = SecureTrieMut::new(&mut db, &mut root);
                for k in order {
                    t.insert(k, k);
                }
            }
            root.into()
        };

        assert_eq!(commit(false), commit(true));
    }

    #[test]
    fn test_old_root_stays_readable() {
        let mut db = NodeOverlay::in_memory();
        let mut root = empty_trie_root().to_fixed_bytes();
        {
            let mut t = SecureTrieMut::new(&mut db, &mut root);
            t.insert(b"k", b"old");
        }
        let old_root: Hash = root.into();
        {
            let mut t = SecureTrieMut::new(&mut db, &mut root);
            t.insert(b"k", b"new");
        }
        // the overlay never deletes nodes, so the old version is intact
        assert_eq!(
            SecureTrie::new(&db, &old_root).get(b"k"),
            Some(b"old".to_vec())
        );
        assert_eq!(
            SecureTrie::new(&db, &root.into()).get(b"k"),
            Some(b"new".to_vec())
        );
    }
}
