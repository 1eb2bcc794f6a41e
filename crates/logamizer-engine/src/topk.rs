use std::collections::HashMap;

use logamizer_core::TopEntry;

/// Exact bounded top-K counter.
///
/// Keeps an exact map of up to `4 * k` keys. When a new key arrives at
/// capacity, the entry with the smallest `(count, key)` is evicted and the
/// new key starts at 1. Counts of retained keys are never decreased, so the
/// reported counts are exact for every key that survives to the end.
#[derive(Debug, Clone)]
pub struct TopK {
    counts: HashMap<String, u64>,
    k: usize,
    max_keys: usize,
}

impl TopK {
    pub const SLOT_FACTOR: usize = 4;

    pub fn new(k: usize) -> Self {
        Self {
            counts: HashMap::new(),
            k,
            max_keys: k * Self::SLOT_FACTOR,
        }
    }

    pub fn observe(&mut self, key: &str) {
        self.observe_n(key, 1);
    }

    pub fn observe_n(&mut self, key: &str, n: u64) {
        if let Some(count) = self.counts.get_mut(key) {
            *count += n;
            return;
        }
        if self.counts.len() >= self.max_keys {
            self.evict_smallest();
        }
        self.counts.insert(key.to_string(), n);
    }

    fn evict_smallest(&mut self) {
        let victim = self
            .counts
            .iter()
            .min_by(|(ka, ca), (kb, cb)| ca.cmp(cb).then_with(|| ka.cmp(kb)))
            .map(|(k, _)| k.clone());
        if let Some(key) = victim {
            self.counts.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// The top K entries, count descending with lexicographic tie-break.
    pub fn top(&self) -> Vec<TopEntry> {
        let mut entries: Vec<TopEntry> = self
            .counts
            .iter()
            .map(|(k, c)| TopEntry::new(k.clone(), *c))
            .collect();
        sort_entries(&mut entries);
        entries.truncate(self.k);
        entries
    }
}

fn sort_entries(entries: &mut [TopEntry]) {
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
}

/// Deterministic merge of two top-K summaries: counts are summed per key and
/// the K largest survive, lexicographic tie-break. Used on aggregate flush.
pub fn merge_top_entries(a: &[TopEntry], b: &[TopEntry], k: usize) -> Vec<TopEntry> {
    let mut merged: HashMap<&str, u64> = HashMap::new();
    for entry in a.iter().chain(b.iter()) {
        *merged.entry(entry.key.as_str()).or_default() += entry.count;
    }
    let mut entries: Vec<TopEntry> = merged
        .into_iter()
        .map(|(key, count)| TopEntry::new(key, count))
        .collect();
    sort_entries(&mut entries);
    entries.truncate(k);
    entries
}
