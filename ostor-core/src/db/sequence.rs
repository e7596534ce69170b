//! 按 scope 单调递增的序号，以区间为单位从引擎租用。
//!
//! 每个 scope 的持久化状态是存放在租约 key 上的一个 u64：尚未有人可能发出过
//! 的第一个序号。存活的 [`Sequence`] 在内存中持有 `next..leased_until` 区间，
//! 用完之后才会访问引擎。

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use super::{DbError, Result, Store};
use crate::keys;

const BUCKET_COUNT: usize = 16;
const BUCKET_CAPACITY: NonZeroUsize = match NonZeroUsize::new(64) {
    Some(n) => n,
    None => unreachable!(),
};
const BAND_SIZE: u64 = 512;

struct Sequence {
    lease_key: Vec<u8>,
    next: u64,
    leased_until: u64,
}

impl Sequence {
    fn acquire(store: &Store, scope: &[u8]) -> Result<Self> {
        let mut seq = Sequence {
            lease_key: keys::sequence_lease_key(scope),
            next: 0,
            leased_until: 0,
        };
        seq.renew(store)?;
        Ok(seq)
    }

    fn next(&mut self, store: &Store) -> Result<u64> {
        if self.next >= self.leased_until {
            self.renew(store)?;
        }
        let index = self.next;
        self.next += 1;
        Ok(index)
    }

    /// 从持久化租约当前位置起租用下一个区间。
    fn renew(&mut self, store: &Store) -> Result<()> {
        let mut start = 0;
        store.update(&self.lease_key, |old| {
            start = match old {
                Some(raw) => decode_lease(&self.lease_key, raw)?,
                None => 0,
            };
            Ok((start + BAND_SIZE).to_le_bytes().to_vec())
        })?;
        self.next = start;
        self.leased_until = start + BAND_SIZE;
        Ok(())
    }

    /// 归还区间中未用的尾部，除非已有其他人租用到更后面。
    fn release(self, store: &Store) -> Result<()> {
        store.update(&self.lease_key, |old| {
            let current = match old {
                Some(raw) => decode_lease(&self.lease_key, raw)?,
                None => 0,
            };
            let value = if current == self.leased_until {
                self.next
            } else {
                current
            };
            Ok(value.to_le_bytes().to_vec())
        })
    }
}

fn decode_lease(key: &[u8], raw: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| DbError::InvalidLease(String::from_utf8_lossy(key).into_owned()))?;
    Ok(u64::from_le_bytes(bytes))
}

pub(super) struct SequenceCache {
    store: Arc<Store>,
    buckets: Vec<Mutex<LruCache<Vec<u8>, Sequence>>>,
}

impl SequenceCache {
    pub(super) fn new(store: Arc<Store>) -> Self {
        let buckets = (0..BUCKET_COUNT)
            .map(|_| Mutex::new(LruCache::new(BUCKET_CAPACITY)))
            .collect();
        Self { store, buckets }
    }

    fn bucket(&self, scope: &[u8]) -> &Mutex<LruCache<Vec<u8>, Sequence>> {
        let index = crc32fast::hash(scope) as usize % BUCKET_COUNT;
        &self.buckets[index]
    }

    pub(super) fn next(&self, scope: &[u8]) -> Result<u64> {
        let mut lru = self
            .bucket(scope)
            .lock()
            .expect("sequence bucket poisoned");
        if let Some(seq) = lru.get_mut(scope) {
            return seq.next(&self.store);
        }

        let mut seq = Sequence::acquire(&self.store, scope)?;
        let index = seq.next(&self.store)?;
        if let Some((evicted_scope, evicted)) = lru.push(scope.to_vec(), seq) {
            if let Err(e) = evicted.release(&self.store) {
                tracing::warn!(
                    scope = %String::from_utf8_lossy(&evicted_scope),
                    error = %e,
                    "failed to release evicted sequence"
                );
            }
        }
        Ok(index)
    }

    /// 归还所有缓存的区间。
    pub(super) fn purge(&self) {
        for bucket in &self.buckets {
            let mut lru = bucket.lock().expect("sequence bucket poisoned");
            while let Some((scope, seq)) = lru.pop_lru() {
                if let Err(e) = seq.release(&self.store) {
                    tracing::warn!(
                        scope = %String::from_utf8_lossy(&scope),
                        error = %e,
                        "failed to release sequence"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use crate::db::open_temp;
    use crate::keys;

    use super::BAND_SIZE;

    fn lease_of(db: &crate::db::Engine, scope: &[u8]) -> u64 {
        let raw = db.get(&keys::sequence_lease_key(scope)).unwrap();
        u64::from_le_bytes(raw.try_into().unwrap())
    }

    #[test]
    fn band_is_leased_up_front() {
        let (_dir, db) = open_temp();
        assert_eq!(db.sequences.next(b"s").unwrap(), 0);
        assert_eq!(db.sequences.next(b"s").unwrap(), 1);
        assert_eq!(lease_of(&db, b"s"), BAND_SIZE);
    }

    #[test]
    fn exhausted_band_is_renewed() {
        let (_dir, db) = open_temp();
        for expected in 0..BAND_SIZE + 3 {
            assert_eq!(db.sequences.next(b"s").unwrap(), expected);
        }
        assert_eq!(lease_of(&db, b"s"), 2 * BAND_SIZE);
    }

    #[test]
    fn purge_returns_unused_tail() {
        let (_dir, db) = open_temp();
        for _ in 0..10 {
            db.sequences.next(b"s").unwrap();
        }
        db.sequences.purge();
        assert_eq!(lease_of(&db, b"s"), 10);
        assert_eq!(db.sequences.next(b"s").unwrap(), 10);
    }

    #[test]
    fn release_keeps_lease_taken_by_someone_else() {
        let (_dir, db) = open_temp();
        db.sequences.next(b"s").unwrap();
        // 其他持有者已把租约推到本区间之后
        db.set(&keys::sequence_lease_key(b"s"), &5000u64.to_le_bytes())
            .unwrap();
        db.sequences.purge();
        assert_eq!(lease_of(&db, b"s"), 5000);
    }

    #[test]
    fn eviction_releases_band() {
        let (_dir, db) = open_temp();
        // 让同一个桶远超其容量
        let mut scopes = Vec::new();
        let mut i = 0u32;
        while scopes.len() < 70 {
            let scope = format!("scope-{i}").into_bytes();
            if crc32fast::hash(&scope) as usize % super::BUCKET_COUNT == 0 {
                scopes.push(scope);
            }
            i += 1;
        }
        for scope in &scopes {
            assert_eq!(db.sequences.next(scope).unwrap(), 0);
        }
        // 最旧的 scope 被淘汰，各自归还了 511 个序号
        assert_eq!(lease_of(&db, &scopes[0]), 1);
        assert_eq!(lease_of(&db, &scopes[69]), BAND_SIZE);
        assert_eq!(db.sequences.next(&scopes[0]).unwrap(), 1);
    }

    #[test]
    fn concurrent_allocation_is_unique() {
        const SCOPES: usize = 128;
        const WORKERS: usize = 256;
        const PER_WORKER: usize = 128;

        let (_dir, db) = open_temp();
        let db = Arc::new(db);

        let handles: Vec<_> = (0..WORKERS)
            .map(|w| {
                let db = db.clone();
                thread::spawn(move || {
                    let mut out = Vec::with_capacity(PER_WORKER);
                    for n in 0..PER_WORKER {
                        let scope = format!("scope{}:", (w + n) % SCOPES);
                        let key = db.set_scoped(scope.as_bytes(), b"v").unwrap();
                        assert!(key.starts_with(scope.as_bytes()));
                        out.push(key);
                    }
                    out
                })
            })
            .collect();

        let mut all = HashSet::new();
        for h in handles {
            for key in h.join().unwrap() {
                assert!(all.insert(key), "duplicate scoped key");
            }
        }
        assert_eq!(all.len(), WORKERS * PER_WORKER);

        for s in 0..SCOPES {
            let scope = format!("scope{s}:");
            let per_scope = all
                .iter()
                .filter(|k| k.len() == scope.len() + 8 && k.starts_with(scope.as_bytes()))
                .count();
            assert_eq!(per_scope, WORKERS * PER_WORKER / SCOPES);
        }
    }
}
