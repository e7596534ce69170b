use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

/// 缓存的 token 数量，有效与无效的都算在内。
pub const CACHE_SIZE: NonZeroUsize = match NonZeroUsize::new(4096) {
    Some(n) => n,
    None => unreachable!(),
};

/// 被拒绝的 token 在不重新校验的情况下保持拒绝状态的时长。
pub const NEGATIVE_TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
enum Entry {
    Valid { scopes: Arc<[String]>, exp: i64 },
    Invalid { until: i64 },
}

/// 缓存查询结果。
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Lookup {
    Miss,
    Valid(Arc<[String]>),
    Rejected,
}

pub(crate) struct TokenCache {
    entries: Mutex<LruCache<String, Entry>>,
}

impl TokenCache {
    pub(crate) fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// 过期条目会被移除并按未命中处理。
    pub(crate) fn get(&self, token: &str, now: i64) -> Lookup {
        let mut entries = self.entries.lock().expect("token cache poisoned");
        let lookup = match entries.get(token) {
            None => return Lookup::Miss,
            Some(Entry::Valid { scopes, exp }) if *exp > now => Lookup::Valid(scopes.clone()),
            Some(Entry::Invalid { until }) if *until > now => Lookup::Rejected,
            Some(_) => Lookup::Miss,
        };
        if lookup == Lookup::Miss {
            entries.pop(token);
        }
        lookup
    }

    pub(crate) fn insert_valid(&self, token: &str, scopes: Arc<[String]>, exp: i64) {
        let mut entries = self.entries.lock().expect("token cache poisoned");
        entries.put(token.to_string(), Entry::Valid { scopes, exp });
    }

    pub(crate) fn insert_invalid(&self, token: &str, now: i64) {
        let mut entries = self.entries.lock().expect("token cache poisoned");
        entries.put(
            token.to_string(),
            Entry::Invalid {
                until: now + NEGATIVE_TTL_SECS,
            },
        );
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().expect("token cache poisoned").len()
    }
}
