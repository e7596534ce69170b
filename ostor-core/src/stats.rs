//! 按 namespace 统计的请求速率，滑动窗口为一小时。

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60 * 60);
const BUCKETS: usize = 60;

/// 按固定时间槽计数，最近 [`BUCKETS`] 个槽之和即窗口内的速率。
#[derive(Debug)]
pub struct RateCounter {
    inner: Mutex<RateWindow>,
}

#[derive(Debug)]
struct RateWindow {
    started: Instant,
    slots: [u64; BUCKETS],
    /// 最近一次计数所在的绝对槽号。
    head: u64,
}

impl RateWindow {
    fn slot_width() -> Duration {
        WINDOW / BUCKETS as u32
    }

    fn slot_at(&self, now: Instant) -> u64 {
        (now.duration_since(self.started).as_nanos() / Self::slot_width().as_nanos()) as u64
    }

    /// 清零 `head` 与 `slot` 之间已移出窗口的槽。
    fn advance(&mut self, slot: u64) {
        if slot <= self.head {
            return;
        }
        let stale = (slot - self.head).min(BUCKETS as u64);
        for s in 1..=stale {
            self.slots[((self.head + s) % BUCKETS as u64) as usize] = 0;
        }
        self.head = slot;
    }
}

impl Default for RateCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateCounter {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    fn starting_at(started: Instant) -> Self {
        Self {
            inner: Mutex::new(RateWindow {
                started,
                slots: [0; BUCKETS],
                head: 0,
            }),
        }
    }

    pub fn increment(&self) {
        self.increment_at(Instant::now());
    }

    fn increment_at(&self, now: Instant) {
        let mut w = self.inner.lock().expect("rate counter poisoned");
        let slot = w.slot_at(now);
        w.advance(slot);
        w.slots[(slot % BUCKETS as u64) as usize] += 1;
    }

    /// 最近一小时内的计数。
    pub fn rate(&self) -> u64 {
        self.rate_at(Instant::now())
    }

    fn rate_at(&self, now: Instant) -> u64 {
        let mut w = self.inner.lock().expect("rate counter poisoned");
        let slot = w.slot_at(now);
        w.advance(slot);
        w.slots.iter().sum()
    }
}

/// 已出现过的每个 label 的读写计数器。
#[derive(Debug, Default)]
pub struct NamespaceStats {
    labels: RwLock<HashMap<String, (RateCounter, RateCounter)>>,
}

impl NamespaceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_read(&self, label: &str) {
        self.with_counters(label, |(read, _)| read.increment());
    }

    pub fn increment_write(&self, label: &str) {
        self.with_counters(label, |(_, write)| write.increment());
    }

    /// `(reads_per_hour, writes_per_hour)`，未知 label 返回零。
    pub fn rate(&self, label: &str) -> (u64, u64) {
        let labels = self.labels.read().expect("namespace stats poisoned");
        labels
            .get(label)
            .map(|(read, write)| (read.rate(), write.rate()))
            .unwrap_or((0, 0))
    }

    fn with_counters(&self, label: &str, f: impl FnOnce(&(RateCounter, RateCounter))) {
        {
            let labels = self.labels.read().expect("namespace stats poisoned");
            if let Some(counters) = labels.get(label) {
                f(counters);
                return;
            }
        }
        let mut labels = self.labels.write().expect("namespace stats poisoned");
        let counters = labels.entry(label.to_string()).or_default();
        f(counters);
    }
}
