//! 有界LRU缓存：体数据缓存与编码切片缓存共用

use crate::mpr::Plane;
use crate::projection::ProjectionMode;
use crate::windowing::Window;
use bytes::Bytes;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// 缓存命中统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Entry<V> {
    value: V,
    tick: u64,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// 访问序号 -> 键，最小者为最久未访问
    order: BTreeMap<u64, K>,
    tick: u64,
}

impl<K: Eq + Hash + Clone, V> Inner<K, V> {
    fn touch(&mut self, key: &K) -> Option<&V> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        self.order.insert(tick, key.clone());
        Some(&entry.value)
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        Some(entry.value)
    }
}

/// 严格LRU：容量溢出时淘汰最久未访问的条目
pub struct LruCache<K, V> {
    capacity: usize,
    inner: Mutex<Inner<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    /// 容量至少为1
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                tick: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match inner.touch(key) {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// 插入或替换；返回被淘汰的键
    pub fn insert(&self, key: K, value: V) -> Option<K> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.remove(&key);

        let mut evicted = None;
        if inner.entries.len() >= self.capacity {
            if let Some((_, oldest)) = inner.order.pop_first() {
                inner.entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                evicted = Some(oldest);
            }
        }

        inner.tick += 1;
        let tick = inner.tick;
        inner.order.insert(tick, key.clone());
        inner.entries.insert(key, Entry { value, tick });
        evicted
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).remove(key)
    }

    /// 只保留满足条件的条目，返回移除的数量
    pub fn retain(&self, mut keep: impl FnMut(&K) -> bool) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let doomed: Vec<K> = inner.entries.keys().filter(|k| !keep(k)).cloned().collect();
        for key in &doomed {
            inner.remove(key);
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// 切片图像的来源视图
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SliceView {
    Mpr(Plane),
    Projection(Plane, ProjectionMode),
}

/// 切片缓存键：(系列, 视图, 序号, 窗, 反相)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SliceKey {
    pub series_uid: String,
    pub view: SliceView,
    pub index: usize,
    window: (u32, u32),
    pub invert: bool,
}

impl SliceKey {
    pub fn new(series_uid: &str, view: SliceView, index: usize, window: Window, invert: bool) -> Self {
        Self {
            series_uid: series_uid.to_string(),
            view,
            index,
            window: window.key_bits(),
            invert,
        }
    }
}

/// 编码后的二维图像
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncodedImage {
    #[serde(skip)]
    pub bytes: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: &'static str,
}

impl EncodedImage {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_bound_and_strict_lru_eviction() {
        let cache = LruCache::new(3);
        for i in 0..3 {
            assert_eq!(cache.insert(i, i * 10), None);
        }
        // 访问0之后，1成为最久未访问
        assert_eq!(cache.get(&0), Some(0));
        assert_eq!(cache.insert(3, 30), Some(1));
        assert_eq!(cache.insert(4, 40), Some(2));

        for i in 5..50 {
            cache.insert(i, i);
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&49), Some(49));
    }

    #[test]
    fn test_replacing_key_does_not_evict() {
        let cache = LruCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.insert("a", 3), None);
        assert_eq!(cache.get(&"a"), Some(3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_retain_and_stats() {
        let cache = LruCache::new(4);
        cache.insert(("s1".to_string(), 0), 0);
        cache.insert(("s1".to_string(), 1), 1);
        cache.insert(("s2".to_string(), 0), 2);

        assert_eq!(cache.retain(|(series, _)| series != "s1"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&("s2".to_string(), 0)).is_some());
        assert!(cache.get(&("s1".to_string(), 0)).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.capacity, 4);
    }

    #[test]
    fn test_slice_key_distinguishes_window_and_inversion() {
        let view = SliceView::Mpr(Plane::Axial);
        let a = SliceKey::new("1.2.3", view, 5, Window::new(400.0, 40.0), false);
        let b = SliceKey::new("1.2.3", view, 5, Window::new(400.0, 40.0), true);
        let c = SliceKey::new("1.2.3", view, 5, Window::new(2000.0, 500.0), false);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, SliceKey::new("1.2.3", view, 5, Window::new(400.0, 40.0), false));
    }
}
