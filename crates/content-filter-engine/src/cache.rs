//! 匹配结果缓存
//!
//! 按 (过滤器 ID, 过滤器版本, 条目 ID) 缓存判定结果。
//! 过滤器保存时版本递增，旧条目自然失效；条件或父过滤器变更时，
//! 由依赖索引给出受影响的过滤器集合，定向清除。
//!
//! 每次失效都会推进代数。判定开始前取得的代数若已过期，
//! 写入会被丢弃，失效前读到旧定义的判定因此不会在失效后落入缓存。

use dashmap::DashMap;
use filter_shared::config::CacheConfig;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    filter_id: String,
    revision: u64,
    item_id: String,
}

/// 缓存统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// 匹配结果缓存
#[derive(Clone)]
pub struct MatchCache {
    entries: Arc<DashMap<CacheKey, bool>>,
    max_entries: usize,
    enabled: bool,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    generation: Arc<AtomicU64>,
    // 写入持读锁，失效持写锁，代数检查与插入之间不会插入一次失效
    gate: Arc<RwLock<()>>,
}

impl MatchCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            max_entries: config.max_entries,
            enabled: config.enabled,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            generation: Arc::new(AtomicU64::new(0)),
            gate: Arc::new(RwLock::new(())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 当前代数；判定开始前取得，写入时原样传回
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn key(filter_id: &str, revision: u64, item_id: &str) -> CacheKey {
        CacheKey {
            filter_id: filter_id.to_string(),
            revision,
            item_id: item_id.to_string(),
        }
    }

    /// 查询缓存
    pub fn get(&self, filter_id: &str, revision: u64, item_id: &str) -> Option<bool> {
        if !self.enabled {
            return None;
        }

        match self.entries.get(&Self::key(filter_id, revision, item_id)) {
            Some(hit) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("content_filter_cache_hits_total").increment(1);
                Some(*hit.value())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("content_filter_cache_misses_total").increment(1);
                None
            }
        }
    }

    /// 写入缓存；`generation` 已过期时丢弃，达到容量上限时整体清空
    pub fn put(&self, filter_id: &str, revision: u64, item_id: &str, matched: bool, generation: u64) {
        if !self.enabled || self.max_entries == 0 {
            return;
        }

        let _gate = self.gate.read();
        if generation != self.generation() {
            debug!(filter_id, item_id, "判定期间缓存已失效，丢弃结果");
            return;
        }

        if self.entries.len() >= self.max_entries {
            debug!(max_entries = self.max_entries, "匹配缓存已满，清空");
            self.entries.clear();
        }

        self.entries
            .insert(Self::key(filter_id, revision, item_id), matched);
    }

    /// 清除指定过滤器的所有缓存结果
    pub fn invalidate_filters(&self, filter_ids: &BTreeSet<String>) {
        if filter_ids.is_empty() {
            return;
        }

        let _gate = self.gate.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        let before = self.entries.len();
        self.entries.retain(|key, _| !filter_ids.contains(&key.filter_id));
        metrics::counter!("content_filter_cache_invalidations_total").increment(1);
        debug!(
            filters = filter_ids.len(),
            removed = before.saturating_sub(self.entries.len()),
            "匹配缓存已定向失效"
        );
    }

    pub fn clear(&self) {
        let _gate = self.gate.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Default for MatchCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_put() {
        let cache = MatchCache::default();
        assert_eq!(cache.get("f1", 1, "item-1"), None);

        cache.put("f1", 1, "item-1", true, 0);
        assert_eq!(cache.get("f1", 1, "item-1"), Some(true));

        // 版本变化后旧结果不可见
        assert_eq!(cache.get("f1", 2, "item-1"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn test_invalidate_filters() {
        let cache = MatchCache::default();
        cache.put("f1", 1, "a", true, 0);
        cache.put("f2", 1, "a", false, 0);
        cache.put("f3", 1, "a", true, 0);

        cache.invalidate_filters(&BTreeSet::from(["f1".to_string(), "f3".to_string()]));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("f2", 1, "a"), Some(false));
    }

    #[test]
    fn test_stale_generation_is_dropped() {
        let cache = MatchCache::default();
        let before = cache.generation();

        // 判定进行中，依赖的条件被改写并触发失效
        cache.invalidate_filters(&BTreeSet::from(["f1".to_string()]));
        cache.put("f1", 1, "a", true, before);
        assert_eq!(cache.get("f1", 1, "a"), None);

        cache.put("f1", 1, "a", false, cache.generation());
        assert_eq!(cache.get("f1", 1, "a"), Some(false));

        let before = cache.generation();
        cache.clear();
        cache.put("f2", 1, "a", true, before);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_bound() {
        let cache = MatchCache::new(&CacheConfig {
            enabled: true,
            max_entries: 2,
        });
        cache.put("f", 1, "a", true, 0);
        cache.put("f", 1, "b", true, 0);
        cache.put("f", 1, "c", true, 0);

        assert!(cache.len() <= 2);
        assert_eq!(cache.get("f", 1, "c"), Some(true));
    }

    #[test]
    fn test_disabled_cache() {
        let cache = MatchCache::new(&CacheConfig {
            enabled: false,
            max_entries: 10,
        });
        cache.put("f", 1, "a", true, 0);
        assert!(cache.is_empty());
        assert_eq!(cache.get("f", 1, "a"), None);
    }
}
