use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use parking_lot::{Condvar, Mutex};

use super::Mode;

const SHARDS: usize = 16;

struct Shard {
    held: Mutex<HashSet<(String, Mode)>>,
    released: Condvar,
}

/// Per URN locks without a mutex per URN.
///
/// A URN hashes onto one shard, the shard remembers which `(urn, mode)` pairs
/// are taken. The read and the write lock of a URN are independent: a writer
/// excludes other writers and a reader excludes other readers, but a reader
/// and a writer of the same URN do not exclude each other.
pub struct LockTable {
    shards: Vec<Shard>,
}

impl LockTable {
    pub fn new() -> Self {
        LockTable {
            shards: (0..SHARDS)
                .map(|_| Shard {
                    held: Mutex::new(HashSet::new()),
                    released: Condvar::new(),
                })
                .collect(),
        }
    }

    fn shard(&self, urn: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        urn.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// Blocks until the lock is free. Not reentrant.
    pub fn acquire(&self, urn: &str, mode: Mode) {
        let shard = self.shard(urn);
        let key = (urn.to_string(), mode);

        let mut held = shard.held.lock();
        while held.contains(&key) {
            shard.released.wait(&mut held);
        }
        held.insert(key);
    }

    pub fn try_acquire(&self, urn: &str, mode: Mode) -> bool {
        let shard = self.shard(urn);
        shard.held.lock().insert((urn.to_string(), mode))
    }

    pub fn release(&self, urn: &str, mode: Mode) {
        let shard = self.shard(urn);
        let mut held = shard.held.lock();
        if held.remove(&(urn.to_string(), mode)) {
            shard.released.notify_all();
        }
    }

    pub fn is_held(&self, urn: &str, mode: Mode) -> bool {
        self.shard(urn).held.lock().contains(&(urn.to_string(), mode))
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}
