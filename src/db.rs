use std::collections::hash_map::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hash_db::Hasher;
use log::{debug, trace, warn};
use parking_lot::RwLock;
use reference_trie::RefHasher;
use trie_db::DBValue;

#[cfg(feature = "rocksdb")]
use crate::error::{Error, ErrorKind, Result};

use crate::common::Hash;

/// Path element bumped whenever the on-disk record layout changes, so an
/// old store is never misread by a newer node.
pub const DATABASE_VERSION: u32 = 1;

/// What to do with a pre-existing store when opening.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WithExisting {
    Trust,
    Kill,
}

#[derive(Clone, Debug)]
enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// A group of writes applied atomically by [KeyValueDB::write].
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.ops.push(BatchOp::Put(key.to_vec(), value.to_vec()));
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.ops.push(BatchOp::Delete(key.to_vec()));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Byte-keyed, byte-valued persistent map. The engine only ever uses
/// fixed-length binary keys (node/code hashes plus a one-byte namespace
/// suffix).
pub trait KeyValueDB: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn put(&self, key: &[u8], value: &[u8]);
    fn remove(&self, key: &[u8]);
    fn write(&self, batch: WriteBatch);
}

/// Heap-backed [KeyValueDB], the default backend for tests and for fully
/// in-memory chains.
#[derive(Default)]
pub struct MemKV(RwLock<HashMap<Vec<u8>, Vec<u8>>>);

impl MemKV {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}

impl KeyValueDB for MemKV {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.read().get(key).cloned()
    }

    fn put(&self, key: &[u8], value: &[u8]) {
        self.0.write().insert(key.to_vec(), value.to_vec());
    }

    fn remove(&self, key: &[u8]) {
        self.0.write().remove(key);
    }

    fn write(&self, batch: WriteBatch) {
        let mut map = self.0.write();
        for op in batch.ops {
            match op {
                BatchOp::Put(k, v) => {
                    map.insert(k, v);
                }
                BatchOp::Delete(k) => {
                    map.remove(&k);
                }
            }
        }
    }
}

const DATA_SUFFIX: [u8; 1] = [0x1];
#[cfg(feature = "fatdb")]
const PREIMAGE_SUFFIX: [u8; 1] = [0x2];

/// Write-buffered node store between the trie and a [KeyValueDB]. Every
/// put lands in memory until [NodeOverlay::flush] pushes the batch down to
/// the backend. The store is copy-on-write: node removals are ignored, so
/// any root that was ever flushed stays readable (historical queries,
/// chain reorgs).
#[derive(Clone)]
pub struct NodeOverlay {
    backend: Arc<dyn KeyValueDB>,
    fresh: HashMap<[u8; 32], DBValue>,
    #[cfg(feature = "fatdb")]
    preimages: HashMap<[u8; 32], Vec<u8>>,
    null_node_data: DBValue,
    null_node_hash: [u8; 32],
}

impl NodeOverlay {
    pub fn new(backend: Arc<dyn KeyValueDB>) -> Self {
        let null_node_data = vec![0u8];
        Self {
            backend,
            fresh: HashMap::new(),
            #[cfg(feature = "fatdb")]
            preimages: HashMap::new(),
            null_node_hash: RefHasher::hash(&null_node_data),
            null_node_data,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemKV::new()))
    }

    pub fn backend(&self) -> &Arc<dyn KeyValueDB> {
        &self.backend
    }

    /// Number of buffered entries not yet flushed.
    pub fn pending(&self) -> usize {
        self.fresh.len()
    }

    fn data_key(hash: &[u8; 32]) -> Vec<u8> {
        let mut key = hash.to_vec();
        key.extend_from_slice(&DATA_SUFFIX);
        key
    }

    /// Content-addressed read: trie nodes and code blobs alike.
    pub fn lookup(&self, hash: &Hash) -> Option<Vec<u8>> {
        let key = hash.to_fixed_bytes();
        self.fresh
            .get(&key)
            .cloned()
            .or_else(|| self.backend.get(&Self::data_key(&key)))
    }

    /// Content-addressed put; returns the key the value landed under.
    pub fn insert_value(&mut self, value: &[u8]) -> Hash {
        let key = RefHasher::hash(value);
        self.fresh.insert(key, value.to_vec());
        key.into()
    }

    #[cfg(feature = "fatdb")]
    pub fn note_preimage(&mut self, hash: [u8; 32], key: &[u8]) {
        self.preimages.insert(hash, key.to_vec());
    }

    #[cfg(feature = "fatdb")]
    pub fn preimage(&self, hash: &[u8; 32]) -> Option<Vec<u8>> {
        if let Some(p) = self.preimages.get(hash) {
            return Some(p.clone())
        }
        let mut key = hash.to_vec();
        key.extend_from_slice(&PREIMAGE_SUFFIX);
        self.backend.get(&key)
    }

    /// Push all buffered entries down to the backend in one batch and
    /// clear the buffer. Returns how many entries went out.
    pub fn flush(&mut self) -> usize {
        let mut batch = WriteBatch::default();
        for (key, value) in self.fresh.drain() {
            batch.put(&Self::data_key(&key), &value);
        }
        #[cfg(feature = "fatdb")]
        for (hash, pre) in self.preimages.drain() {
            let mut key = hash.to_vec();
            key.extend_from_slice(&PREIMAGE_SUFFIX);
            batch.put(&key, &pre);
        }
        let n = batch.len();
        if n > 0 {
            self.backend.write(batch);
            trace!(target: "statedb", "flushed {} node(s)", n);
        }
        n
    }
}

impl hash_db::AsHashDB<RefHasher, DBValue> for NodeOverlay {
    fn as_hash_db(&self) -> &dyn hash_db::HashDB<RefHasher, DBValue> {
        self
    }
    fn as_hash_db_mut<'a>(
        &'a mut self,
    ) -> &'a mut (dyn hash_db::HashDB<RefHasher, DBValue> + 'a) {
        self
    }
}

impl hash_db::HashDB<RefHasher, DBValue> for NodeOverlay {
    fn get(
        &self, key: &[u8; 32], _prefix: (&[u8], Option<u8>),
    ) -> Option<DBValue> {
        if key == &self.null_node_hash {
            return Some(self.null_node_data.clone())
        }
        self.fresh
            .get(key)
            .cloned()
            .or_else(|| self.backend.get(&Self::data_key(key)))
    }

    fn contains(&self, key: &[u8; 32], prefix: (&[u8], Option<u8>)) -> bool {
        if key == &self.null_node_hash {
            return true
        }
        hash_db::HashDB::get(self, key, prefix).is_some()
    }

    fn emplace(
        &mut self, key: [u8; 32], _prefix: (&[u8], Option<u8>), value: DBValue,
    ) {
        if value == self.null_node_data {
            return
        }
        self.fresh.insert(key, value);
    }

    fn insert(
        &mut self, prefix: (&[u8], Option<u8>), value: &[u8],
    ) -> [u8; 32] {
        if value == self.null_node_data {
            return self.null_node_hash
        }
        let key = RefHasher::hash(value);
        hash_db::HashDB::emplace(self, key, prefix, value.into());
        key
    }

    fn remove(&mut self, _key: &[u8; 32], _prefix: (&[u8], Option<u8>)) {
        // copy-on-write store: stale nodes stay so old roots remain live
    }
}

impl hash_db::HashDBRef<RefHasher, DBValue> for NodeOverlay {
    fn get(
        &self, key: &[u8; 32], prefix: (&[u8], Option<u8>),
    ) -> Option<DBValue> {
        hash_db::HashDB::get(self, key, prefix)
    }
    fn contains(&self, key: &[u8; 32], prefix: (&[u8], Option<u8>)) -> bool {
        hash_db::HashDB::contains(self, key, prefix)
    }
}

/// `<base>/<hex(genesis[0..4])>/<DATABASE_VERSION>/state`
pub fn state_db_path(base: &Path, genesis: &Hash) -> PathBuf {
    base.join(hex::encode(&genesis.as_bytes()[..4]))
        .join(DATABASE_VERSION.to_string())
        .join("state")
}

/// Lay out (and optionally wipe) the on-disk directory structure for the
/// state store. Filesystem trouble here is deferred to the actual open,
/// which can classify it.
pub fn prepare_state_dir(
    base: &Path, genesis: &Hash, we: WithExisting,
) -> PathBuf {
    if we == WithExisting::Kill {
        debug!(target: "statedb", "killing state database");
        if let Err(e) = std::fs::remove_dir_all(base.join("state")) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(target: "statedb", "could not kill state dir: {}", e);
            }
        }
    }
    let path = state_db_path(base, genesis);
    if let Err(e) = std::fs::create_dir_all(&path) {
        warn!(target: "statedb", "could not create state dir: {}", e);
    }
    path
}

/// Durable [KeyValueDB] over RocksDB.
#[cfg(feature = "rocksdb")]
pub struct RocksKV(rocksdb::DB);

#[cfg(feature = "rocksdb")]
impl KeyValueDB for RocksKV {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.get(key).ok().flatten()
    }

    fn put(&self, key: &[u8], value: &[u8]) {
        if let Err(e) = self.0.put(key, value) {
            warn!(target: "statedb", "rocksdb put failed: {}", e);
        }
    }

    fn remove(&self, key: &[u8]) {
        if let Err(e) = self.0.delete(key) {
            warn!(target: "statedb", "rocksdb delete failed: {}", e);
        }
    }

    fn write(&self, batch: WriteBatch) {
        let mut wb = rocksdb::WriteBatch::default();
        for op in batch.ops {
            match op {
                BatchOp::Put(k, v) => wb.put(k, v),
                BatchOp::Delete(k) => wb.delete(k),
            }
        }
        if let Err(e) = self.0.write(wb) {
            warn!(target: "statedb", "rocksdb batch write failed: {}", e);
        }
    }
}

/// Open (or create) the durable state store under `base` for the chain
/// identified by `genesis`. An open failure is classified by free space
/// first: anything under 1 KiB means the disk is the problem, otherwise
/// another process holds the store.
#[cfg(feature = "rocksdb")]
pub fn open_state_db(
    base: &Path, genesis: &Hash, we: WithExisting,
) -> Result<RocksKV> {
    let path = prepare_state_dir(base, genesis, we);
    let mut opts = rocksdb::Options::default();
    opts.create_if_missing(true);
    match rocksdb::DB::open(&opts, &path) {
        Ok(db) => {
            debug!(target: "statedb", "opened state database at {:?}", path);
            Ok(RocksKV(db))
        }
        Err(e) => {
            warn!(target: "statedb", "failed to open state database: {}", e);
            let free = fs2::available_space(&path).unwrap_or(u64::MAX);
            if free < 1024 {
                Err(Error::new(
                    ErrorKind::NotEnoughAvailableSpace,
                    "open_state_db",
                ))
            } else {
                Err(Error::new(ErrorKind::DatabaseAlreadyOpen, "open_state_db"))
            }
        }
    }
}
