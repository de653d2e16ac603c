//! History store port and its in-memory implementation.
//!
//! The durable store is external (Redis in production); the core only
//! needs this small key/list API. The in-memory implementation backs the
//! tests and single-process deployments — its mutexes also serialize
//! same-address writers, which keeps list trimming and TTL consistent.

use crate::errors::HistoryError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn list_push_front(&self, key: &str, record: String) -> Result<(), HistoryError>;

    /// Keep only `start..=end` of the list.
    async fn list_trim(&self, key: &str, start: usize, end: usize) -> Result<(), HistoryError>;

    /// Inclusive range read; out-of-bounds indices clamp.
    async fn list_range(&self, key: &str, start: usize, end: usize) -> Result<Vec<String>, HistoryError>;

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), HistoryError>;

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, HistoryError>;
}

#[derive(Default)]
pub struct InMemoryHistory {
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    kv: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistory {
    async fn list_push_front(&self, key: &str, record: String) -> Result<(), HistoryError> {
        let mut lists = self.lists.lock().map_err(|_| HistoryError::Unavailable)?;
        lists.entry(key.to_string()).or_default().push_front(record);
        Ok(())
    }

    async fn list_trim(&self, key: &str, start: usize, end: usize) -> Result<(), HistoryError> {
        let mut lists = self.lists.lock().map_err(|_| HistoryError::Unavailable)?;
        if let Some(list) = lists.get_mut(key) {
            let kept: VecDeque<String> = list
                .iter()
                .enumerate()
                .filter(|(i, _)| *i >= start && *i <= end)
                .map(|(_, v)| v.clone())
                .collect();
            *list = kept;
        }
        Ok(())
    }

    async fn list_range(&self, key: &str, start: usize, end: usize) -> Result<Vec<String>, HistoryError> {
        let lists = self.lists.lock().map_err(|_| HistoryError::Unavailable)?;
        Ok(lists
            .get(key)
            .map(|list| {
                list.iter()
                    .enumerate()
                    .filter(|(i, _)| *i >= start && *i <= end)
                    .map(|(_, v)| v.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), HistoryError> {
        let mut kv = self.kv.lock().map_err(|_| HistoryError::Unavailable)?;
        kv.insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, HistoryError> {
        let now = Instant::now();
        let mut kv = self.kv.lock().map_err(|_| HistoryError::Unavailable)?;
        kv.retain(|_, (_, expires)| *expires > now);
        let mut from_kv: Vec<String> = kv.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
        let lists = self.lists.lock().map_err(|_| HistoryError::Unavailable)?;
        from_kv.extend(lists.keys().filter(|k| k.starts_with(prefix)).cloned());
        from_kv.sort();
        from_kv.dedup();
        Ok(from_kv)
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_front_orders_newest_first() {
        let store = InMemoryHistory::new();
        store.list_push_front("history:0xabc", "first".into()).await.unwrap();
        store.list_push_front("history:0xabc", "second".into()).await.unwrap();
        let range = store.list_range("history:0xabc", 0, 10).await.unwrap();
        assert_eq!(range, vec!["second".to_string(), "first".to_string()]);
    }

    #[tokio::test]
    async fn test_trim_caps_the_list() {
        let store = InMemoryHistory::new();
        for i in 0..8 {
            store.list_push_front("k", format!("r{i}")).await.unwrap();
        }
        store.list_trim("k", 0, 4).await.unwrap();
        let range = store.list_range("k", 0, 100).await.unwrap();
        assert_eq!(range.len(), 5);
        assert_eq!(range[0], "r7");
    }

    #[tokio::test]
    async fn test_range_on_missing_key_is_empty() {
        let store = InMemoryHistory::new();
        assert!(store.list_range("nope", 0, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_kv_entries_disappear_from_keys() {
        let store = InMemoryHistory::new();
        store.set_with_ttl("scan:0xabc:1", "{}".into(), Duration::from_millis(1)).await.unwrap();
        store.set_with_ttl("scan:0xabc:2", "{}".into(), Duration::from_secs(3600)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let keys = store.keys("scan:0xabc:").await.unwrap();
        assert_eq!(keys, vec!["scan:0xabc:2".to_string()]);
    }

    #[tokio::test]
    async fn test_keys_sees_list_keys_too() {
        let store = InMemoryHistory::new();
        store.list_push_front("history:0xdef", "{}".into()).await.unwrap();
        let keys = store.keys("history:").await.unwrap();
        assert_eq!(keys, vec!["history:0xdef".to_string()]);
    }
}
