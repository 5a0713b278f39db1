use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

const MIN_SHARDS: usize = 256;
const MAX_SHARDS: usize = 1 << 16;

/// 32-bit FNV-1a over the key bytes. Shared by the table and the lock stripes.
pub(crate) fn fnv32(key: &str) -> u32 {
    const PRIME32: u32 = 16777619;
    let mut hash: u32 = 2166136261;
    for b in key.bytes() {
        hash ^= b as u32;
        hash = hash.wrapping_mul(PRIME32);
    }
    hash
}

/// Round a shard count hint up to a power of two in `[256, 65536]`.
pub fn compute_capacity(hint: usize) -> usize {
    hint.clamp(MIN_SHARDS, MAX_SHARDS).next_power_of_two()
}

/// Hash map split into independently locked shards.
///
/// Return codes follow the table convention: `1` when the table changed,
/// `0` when the call was a no-op.
pub struct ConcurrentDict<V> {
    shards: Box<[RwLock<HashMap<String, V>>]>,
    count: AtomicUsize,
}

impl<V: Clone> ConcurrentDict<V> {
    pub fn new(shard_hint: usize) -> Self {
        let n = compute_capacity(shard_hint);
        let shards = (0..n).map(|_| RwLock::new(HashMap::new())).collect();
        ConcurrentDict {
            shards,
            count: AtomicUsize::new(0),
        }
    }

    fn shard(&self, key: &str) -> &RwLock<HashMap<String, V>> {
        let mask = self.shards.len() - 1;
        &self.shards[fnv32(key) as usize & mask]
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.shard(key).read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.shard(key).read().contains_key(key)
    }

    /// Run `f` against the stored value without cloning it.
    pub fn with<R>(&self, key: &str, f: impl FnOnce(Option<&V>) -> R) -> R {
        f(self.shard(key).read().get(key))
    }

    /// Run `f` against the stored value in place.
    pub fn with_mut<R>(&self, key: &str, f: impl FnOnce(Option<&mut V>) -> R) -> R {
        f(self.shard(key).write().get_mut(key))
    }

    /// Insert or replace. Returns 1 for a new key, 0 when an existing value
    /// was overwritten.
    pub fn put(&self, key: &str, val: V) -> usize {
        let mut shard = self.shard(key).write();
        if shard.insert(key.to_string(), val).is_some() {
            0
        } else {
            self.count.fetch_add(1, Ordering::Relaxed);
            1
        }
    }

    pub fn put_if_absent(&self, key: &str, val: V) -> usize {
        let mut shard = self.shard(key).write();
        if shard.contains_key(key) {
            return 0;
        }
        shard.insert(key.to_string(), val);
        self.count.fetch_add(1, Ordering::Relaxed);
        1
    }

    pub fn put_if_exists(&self, key: &str, val: V) -> usize {
        let mut shard = self.shard(key).write();
        match shard.get_mut(key) {
            Some(slot) => {
                *slot = val;
                1
            }
            None => 0,
        }
    }

    pub fn remove(&self, key: &str) -> usize {
        self.take(key).map_or(0, |_| 1)
    }

    /// Remove and return the value.
    pub fn take(&self, key: &str) -> Option<V> {
        let removed = self.shard(key).write().remove(key);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Visit every entry, one shard at a time under that shard's read lock.
    /// Stops early when `f` returns false. Not a snapshot across shards.
    pub fn for_each(&self, mut f: impl FnMut(&str, &V) -> bool) {
        for shard in self.shards.iter() {
            let shard = shard.read();
            for (k, v) in shard.iter() {
                if !f(k, v) {
                    return;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.len());
        self.for_each(|k, _| {
            keys.push(k.to_string());
            true
        });
        keys
    }

    /// Up to `limit` distinct keys, at most one per shard, starting from a
    /// random shard.
    pub fn random_distinct_keys(&self, limit: usize) -> Vec<String> {
        let n = self.shards.len();
        let mut rng = rand::thread_rng();
        let start = rng.gen_range(0..n);
        let mut picked = Vec::new();
        for i in 0..n {
            if picked.len() >= limit || picked.len() >= self.len() {
                break;
            }
            let shard = self.shards[(start + i) & (n - 1)].read();
            if shard.is_empty() {
                continue;
            }
            let skip = rng.gen_range(0..shard.len());
            if let Some(k) = shard.keys().nth(skip) {
                picked.push(k.clone());
            }
        }
        picked
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let mut shard = shard.write();
            self.count.fetch_sub(shard.len(), Ordering::Relaxed);
            shard.clear();
        }
    }
}
