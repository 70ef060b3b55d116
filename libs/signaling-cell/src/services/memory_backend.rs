use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::StoreError;
use crate::services::store::StateBackend;

#[derive(Debug, Clone)]
enum MemoryValue {
    Text(String),
    Counter(u64),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: MemoryValue,
    expires_at: Instant,
}

impl MemoryEntry {
    fn new(value: MemoryValue, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-process tier with Redis-like TTL semantics. Expired keys are dropped
/// lazily on access and in bulk by `purge_expired`.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        let purged = before - entries.len();
        if purged > 0 {
            debug!("Purged {} expired in-process key(s)", purged);
        }
        purged
    }

    pub async fn len(&self) -> usize {
        let entries = self.entries.lock().await;
        entries.values().filter(|entry| !entry.is_expired()).count()
    }
}

fn live<'a>(entries: &'a mut HashMap<String, MemoryEntry>, key: &str) -> Option<&'a mut MemoryEntry> {
    if entries.get(key).is_some_and(MemoryEntry::is_expired) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

#[async_trait]
impl StateBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), MemoryEntry::new(MemoryValue::Text(value), ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key) {
            None => Ok(None),
            Some(MemoryEntry { value: MemoryValue::Text(text), .. }) => Ok(Some(text.clone())),
            Some(MemoryEntry { value: MemoryValue::Counter(count), .. }) => Ok(Some(count.to_string())),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key) {
            Some(MemoryEntry { value: MemoryValue::Counter(count), .. }) => {
                *count += 1;
                Ok(*count)
            }
            Some(_) => Err(StoreError::WrongType(key.to_string())),
            None => {
                entries.insert(key.to_string(), MemoryEntry::new(MemoryValue::Counter(1), ttl));
                Ok(1)
            }
        }
    }

    async fn append_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key) {
            Some(entry) => match &mut entry.value {
                MemoryValue::List(items) => {
                    items.push(value);
                    entry.expires_at = Instant::now() + ttl;
                    Ok(())
                }
                _ => Err(StoreError::WrongType(key.to_string())),
            },
            None => {
                entries.insert(key.to_string(), MemoryEntry::new(MemoryValue::List(vec![value]), ttl));
                Ok(())
            }
        }
    }

    async fn list(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut entries = self.entries.lock().await;
        match live(&mut entries, key) {
            None => Ok(Vec::new()),
            Some(MemoryEntry { value: MemoryValue::List(items), .. }) => Ok(items.clone()),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_counter_expires_with_window() {
        let backend = MemoryBackend::new();
        let window = Duration::from_secs(10);

        assert_eq!(backend.increment_with_ttl("k", window).await.unwrap(), 1);
        assert_eq!(backend.increment_with_ttl("k", window).await.unwrap(), 2);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(backend.increment_with_ttl("k", window).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_refreshes_ttl() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(10);

        backend.append_with_ttl("list", "a".to_string(), ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        backend.append_with_ttl("list", "b".to_string(), ttl).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;

        assert_eq!(backend.list("list").await.unwrap(), vec!["a", "b"]);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(backend.list("list").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let backend = MemoryBackend::new();
        backend.set_with_ttl("short", "1".to_string(), Duration::from_secs(1)).await.unwrap();
        backend.set_with_ttl("long", "2".to_string(), Duration::from_secs(100)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(backend.purge_expired().await, 1);
        assert_eq!(backend.len().await, 1);
        assert_eq!(backend.get("long").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_wrong_type_is_reported() {
        let backend = MemoryBackend::new();
        backend.set_with_ttl("k", "text".to_string(), Duration::from_secs(60)).await.unwrap();

        assert!(matches!(
            backend.append_with_ttl("k", "x".to_string(), Duration::from_secs(60)).await,
            Err(StoreError::WrongType(_))
        ));
    }
}
