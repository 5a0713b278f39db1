use super::dict::fnv32;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

const DEFAULT_STRIPES: usize = 1024;

/// Fixed array of read-write locks addressed by key hash.
///
/// Multi-key acquisition always walks stripe indices in ascending order with
/// duplicates collapsed, so callers locking overlapping key sets in any input
/// order cannot deadlock.
pub struct LockMap {
    stripes: Vec<Arc<RwLock<()>>>,
}

enum StripeGuard {
    Read { _guard: OwnedRwLockReadGuard<()> },
    Write { _guard: OwnedRwLockWriteGuard<()> },
}

/// A set of held stripes. Dropping it releases the stripes in reverse
/// acquisition order.
#[must_use = "locks are released as soon as the guard set is dropped"]
pub struct KeyGuards {
    held: Vec<StripeGuard>,
}

impl KeyGuards {
    pub fn release(self) {}

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl Drop for KeyGuards {
    fn drop(&mut self) {
        while let Some(guard) = self.held.pop() {
            drop(guard);
        }
    }
}

impl Default for LockMap {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}

impl LockMap {
    pub fn new(size: usize) -> Self {
        let size = size.max(1).next_power_of_two();
        LockMap {
            stripes: (0..size).map(|_| Arc::new(RwLock::new(()))).collect(),
        }
    }

    pub fn stripe_index(&self, key: &str) -> usize {
        fnv32(key) as usize & (self.stripes.len() - 1)
    }

    pub async fn lock(&self, key: &str) -> KeyGuards {
        self.rw_locks(&[key], &[] as &[&str]).await
    }

    pub async fn rlock(&self, key: &str) -> KeyGuards {
        self.rw_locks(&[] as &[&str], &[key]).await
    }

    pub async fn locks<S: AsRef<str>>(&self, keys: &[S]) -> KeyGuards {
        self.rw_locks(keys, &[] as &[&str]).await
    }

    pub async fn rlocks<S: AsRef<str>>(&self, keys: &[S]) -> KeyGuards {
        self.rw_locks(&[] as &[&str], keys).await
    }

    /// Lock `write` keys exclusively and `read` keys shared. A stripe that
    /// appears in both sets is taken once, exclusively.
    pub async fn rw_locks<W: AsRef<str>, R: AsRef<str>>(&self, write: &[W], read: &[R]) -> KeyGuards {
        let order = self.ordered(write, read);
        let mut held = Vec::with_capacity(order.len());
        for (index, exclusive) in order {
            let stripe = self.stripes[index].clone();
            held.push(if exclusive {
                StripeGuard::Write {
                    _guard: stripe.write_owned().await,
                }
            } else {
                StripeGuard::Read {
                    _guard: stripe.read_owned().await,
                }
            });
        }
        KeyGuards { held }
    }

    /// Sorted, deduplicated `(stripe, exclusive)` pairs.
    fn ordered<W: AsRef<str>, R: AsRef<str>>(&self, write: &[W], read: &[R]) -> Vec<(usize, bool)> {
        let mut order: Vec<(usize, bool)> = write
            .iter()
            .map(|k| (self.stripe_index(k.as_ref()), true))
            .chain(read.iter().map(|k| (self.stripe_index(k.as_ref()), false)))
            .collect();
        // exclusive entries sort first within an index so dedup keeps them
        order.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        order.dedup_by_key(|entry| entry.0);
        order
    }
}
