// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;

/// 缓存下来的一次完整响应
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

#[derive(Clone)]
struct CacheEntry {
    response: CachedResponse,
    expires_at: Instant,
}

/// 以请求 URI 为键的 LRU 响应缓存，每个条目带有自己的过期时间
pub struct ResponseCache {
    cache: LruCache<String, CacheEntry>,
}

impl ResponseCache {
    /// 容量为 0 时按 1 处理
    pub fn from_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
        }
    }

    // 放入，`ttl` 之后失效
    pub fn push(&mut self, key: &str, response: CachedResponse, ttl: Duration) {
        self.push_at(key, response, Instant::now() + ttl);
    }

    fn push_at(&mut self, key: &str, response: CachedResponse, expires_at: Instant) {
        let entry = CacheEntry {
            response,
            expires_at,
        };
        self.cache.put(key.to_string(), entry);
    }

    // 查询有效缓存，过期条目顺便移除
    pub fn find(&mut self, key: &str) -> Option<CachedResponse> {
        self.find_at(key, Instant::now())
    }

    fn find_at(&mut self, key: &str, now: Instant) -> Option<CachedResponse> {
        let expired = match self.cache.get(key) {
            Some(entry) => now > entry.expires_at,
            None => return None,
        };
        if expired {
            self.cache.pop(key);
            return None;
        }
        self.cache.get(key).map(|entry| entry.response.clone())
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    fn entry(body: &'static str) -> CachedResponse {
        CachedResponse {
            status: "200 OK".to_string(),
            headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
            body: Bytes::from(body),
        }
    }

    #[test]
    fn test_cache_creation() {
        let cache = ResponseCache::from_capacity(10);
        assert_eq!(cache.capacity(), 10);
        assert!(cache.is_empty());
        assert_eq!(ResponseCache::from_capacity(0).capacity(), 1);
    }

    #[test]
    fn test_cache_push_and_find() {
        let mut cache = ResponseCache::from_capacity(3);
        cache.push("/a?x=1", entry("one"), MINUTE);
        assert_eq!(cache.find("/a?x=1"), Some(entry("one")));
        assert_eq!(cache.find("/a?x=2"), None);
    }

    #[test]
    fn test_cache_expiry() {
        let mut cache = ResponseCache::from_capacity(3);
        let start = Instant::now();
        cache.push_at("/a", entry("old"), start + Duration::from_secs(10));

        assert!(cache.find_at("/a", start + Duration::from_secs(5)).is_some());
        assert!(cache.find_at("/a", start + Duration::from_secs(11)).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_cache_lru_eviction() {
        let mut cache = ResponseCache::from_capacity(2);
        cache.push("/1", entry("content1"), MINUTE);
        cache.push("/2", entry("content2"), MINUTE);

        cache.find("/1");
        cache.push("/3", entry("content3"), MINUTE);
        assert_eq!(cache.len(), 2);

        assert!(cache.find("/2").is_none());
        assert!(cache.find("/1").is_some());
        assert!(cache.find("/3").is_some());
    }

    #[test]
    fn test_cache_update_existing() {
        let mut cache = ResponseCache::from_capacity(3);
        cache.push("/1", entry("old content"), MINUTE);
        cache.push("/1", entry("new content"), MINUTE);
        assert_eq!(cache.find("/1").unwrap().body, Bytes::from("new content"));
        assert_eq!(cache.len(), 1);
    }
}
