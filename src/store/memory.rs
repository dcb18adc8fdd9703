//! In-memory [`Store`] implementation.
//!
//! `MemoryStore` keeps every data structure behind a single lock, so each
//! trait call is atomic with respect to every other call, which is the same
//! guarantee a single Redis instance gives. It is used by the test suite and
//! by single-process deployments that do not need durability.
//!
//! # Examples
//!
//! ```rust
//! use workhorse::store::{MemoryStore, Store};
//!
//! # #[tokio::main]
//! # async fn main() -> workhorse::Result<()> {
//! let store = MemoryStore::new();
//! store.list_push_back("q", "a").await?;
//! store.list_push_back("q", "b").await?;
//! assert_eq!(store.list_pop_front("q").await?, Some("a".to_string()));
//!
//! // Simulate the backend going away.
//! store.set_available(false);
//! assert!(store.list_len("q").await.is_err());
//! # Ok(())
//! # }
//! ```

use super::Store;
use crate::{Result, WorkhorseError};
use async_trait::async_trait;
use std::{
    cmp::Ordering,
    collections::{BTreeSet, HashMap, VecDeque},
    sync::atomic::{AtomicBool, Ordering as AtomicOrdering},
    time::Duration,
};
use tokio::sync::{Notify, RwLock};

/// Sorted-set score with a total order, so it can key a `BTreeSet`.
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, f64>,
    ordered: BTreeSet<(Score, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: f64) {
        if let Some(previous) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(Score(previous), member.to_string()));
        }
        self.ordered.insert((Score(score), member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(Score(score), member.to_string()));
                true
            }
            None => false,
        }
    }

    fn up_to(&self, max_score: f64) -> Vec<(String, f64)> {
        self.ordered
            .iter()
            .take_while(|(score, _)| score.0 <= max_score)
            .map(|(score, member)| (member.clone(), score.0))
            .collect()
    }

    fn len(&self) -> usize {
        self.scores.len()
    }
}

#[derive(Debug, Default)]
struct MemoryData {
    strings: HashMap<String, String>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, BTreeSet<String>>,
    sorted_sets: HashMap<String, SortedSet>,
}

impl MemoryData {
    fn ensure_free(&self, key: &str, kind: Kind) -> Result<()> {
        let occupied = match kind {
            Kind::String => {
                self.lists.contains_key(key)
                    || self.sets.contains_key(key)
                    || self.sorted_sets.contains_key(key)
            }
            Kind::List => {
                self.strings.contains_key(key)
                    || self.sets.contains_key(key)
                    || self.sorted_sets.contains_key(key)
            }
            Kind::Set => {
                self.strings.contains_key(key)
                    || self.lists.contains_key(key)
                    || self.sorted_sets.contains_key(key)
            }
            Kind::SortedSet => {
                self.strings.contains_key(key)
                    || self.lists.contains_key(key)
                    || self.sets.contains_key(key)
            }
        };
        if occupied {
            return Err(WorkhorseError::Store {
                message: format!("key {} holds a value of another type", key),
            });
        }
        Ok(())
    }

    fn pop_list(&mut self, key: &str) -> Option<String> {
        let list = self.lists.get_mut(key)?;
        let value = list.pop_front();
        if list.is_empty() {
            self.lists.remove(key);
        }
        value
    }
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    String,
    List,
    Set,
    SortedSet,
}

/// Thread-safe in-memory store with Redis-like semantics.
#[derive(Debug)]
pub struct MemoryStore {
    data: RwLock<MemoryData>,
    pushed: Notify,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(MemoryData::default()),
            pushed: Notify::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Toggles a simulated outage. While unavailable every operation fails
    /// with `StoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, AtomicOrdering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(AtomicOrdering::SeqCst)
    }

    /// Number of keys of any type. Mostly useful in tests to check that
    /// records were reclaimed.
    pub async fn key_count(&self) -> usize {
        let data = self.data.read().await;
        data.strings.len() + data.lists.len() + data.sets.len() + data.sorted_sets.len()
    }

    /// Whether `key` exists with any type.
    pub async fn contains_key(&self, key: &str) -> bool {
        let data = self.data.read().await;
        data.strings.contains_key(key)
            || data.lists.contains_key(key)
            || data.sets.contains_key(key)
            || data.sorted_sets.contains_key(key)
    }

    fn check_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(WorkhorseError::StoreUnavailable {
                message: "memory store is marked unavailable".to_string(),
            })
        }
    }

    async fn try_pop_any(&self, keys: &[String]) -> Result<Option<(String, String)>> {
        self.check_available()?;
        let mut data = self.data.write().await;
        for key in keys {
            if let Some(value) = data.pop_list(key) {
                return Ok(Some((key.clone(), value)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        let data = self.data.read().await;
        data.ensure_free(key, Kind::String)?;
        Ok(data.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check_available()?;
        let mut data = self.data.write().await;
        data.ensure_free(key, Kind::String)?;
        data.strings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        self.check_available()?;
        let mut data = self.data.write().await;
        data.ensure_free(key, Kind::String)?;
        if data.strings.contains_key(key) {
            return Ok(false);
        }
        data.strings.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        let mut data = self.data.write().await;
        let removed = data.strings.remove(key).is_some()
            | data.lists.remove(key).is_some()
            | data.sets.remove(key).is_some()
            | data.sorted_sets.remove(key).is_some();
        Ok(removed)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        self.check_available()?;
        let mut data = self.data.write().await;
        data.ensure_free(key, Kind::String)?;
        let current = match data.strings.get(key) {
            Some(raw) => raw.parse::<i64>().map_err(|_| WorkhorseError::Store {
                message: format!("value at {} is not an integer", key),
            })?,
            None => 0,
        };
        let next = current + delta;
        data.strings.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    async fn list_push_back(&self, key: &str, value: &str) -> Result<u64> {
        self.check_available()?;
        let len = {
            let mut data = self.data.write().await;
            data.ensure_free(key, Kind::List)?;
            let list = data.lists.entry(key.to_string()).or_default();
            list.push_back(value.to_string());
            list.len() as u64
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn list_push_front(&self, key: &str, value: &str) -> Result<u64> {
        self.check_available()?;
        let len = {
            let mut data = self.data.write().await;
            data.ensure_free(key, Kind::List)?;
            let list = data.lists.entry(key.to_string()).or_default();
            list.push_front(value.to_string());
            list.len() as u64
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        let mut data = self.data.write().await;
        data.ensure_free(key, Kind::List)?;
        Ok(data.pop_list(key))
    }

    async fn list_pop_front_blocking(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a push between the check
            // and the wait is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(hit) = self.try_pop_any(keys).await? {
                return Ok(Some(hit));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop_any(keys).await;
            }
        }
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<u64> {
        self.check_available()?;
        let mut data = self.data.write().await;
        data.ensure_free(key, Kind::List)?;
        let Some(list) = data.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|item| item != value);
        let removed = (before - list.len()) as u64;
        if list.is_empty() {
            data.lists.remove(key);
        }
        Ok(removed)
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        self.check_available()?;
        let data = self.data.read().await;
        data.ensure_free(key, Kind::List)?;
        Ok(data.lists.get(key).map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>> {
        self.check_available()?;
        let data = self.data.read().await;
        data.ensure_free(key, Kind::List)?;
        Ok(data
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn sorted_set_add(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.check_available()?;
        let mut data = self.data.write().await;
        data.ensure_free(key, Kind::SortedSet)?;
        data.sorted_sets
            .entry(key.to_string())
            .or_default()
            .insert(member, score);
        Ok(())
    }

    async fn sorted_set_remove(&self, key: &str, member: &str) -> Result<bool> {
        self.check_available()?;
        let mut data = self.data.write().await;
        data.ensure_free(key, Kind::SortedSet)?;
        let Some(set) = data.sorted_sets.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(member);
        if set.len() == 0 {
            data.sorted_sets.remove(key);
        }
        Ok(removed)
    }

    async fn sorted_set_len(&self, key: &str) -> Result<u64> {
        self.check_available()?;
        let data = self.data.read().await;
        data.ensure_free(key, Kind::SortedSet)?;
        Ok(data.sorted_sets.get(key).map(|s| s.len() as u64).unwrap_or(0))
    }

    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        max_score: f64,
    ) -> Result<Vec<(String, f64)>> {
        self.check_available()?;
        let data = self.data.read().await;
        data.ensure_free(key, Kind::SortedSet)?;
        Ok(data
            .sorted_sets
            .get(key)
            .map(|s| s.up_to(max_score))
            .unwrap_or_default())
    }

    async fn sorted_set_pop_before(
        &self,
        key: &str,
        max_score: f64,
    ) -> Result<Vec<(String, f64)>> {
        self.check_available()?;
        let mut data = self.data.write().await;
        data.ensure_free(key, Kind::SortedSet)?;
        let Some(set) = data.sorted_sets.get_mut(key) else {
            return Ok(Vec::new());
        };
        let due = set.up_to(max_score);
        for (member, _) in &due {
            set.remove(member);
        }
        if set.len() == 0 {
            data.sorted_sets.remove(key);
        }
        Ok(due)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        self.check_available()?;
        let mut data = self.data.write().await;
        data.ensure_free(key, Kind::Set)?;
        Ok(data
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        self.check_available()?;
        let mut data = self.data.write().await;
        data.ensure_free(key, Kind::Set)?;
        let Some(set) = data.sets.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(member);
        if set.is_empty() {
            data.sets.remove(key);
        }
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        self.check_available()?;
        let data = self.data.read().await;
        data.ensure_free(key, Kind::Set)?;
        Ok(data
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_len(&self, key: &str) -> Result<u64> {
        self.check_available()?;
        let data = self.data.read().await;
        data.ensure_free(key, Kind::Set)?;
        Ok(data.sets.get(key).map(|s| s.len() as u64).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_strings_and_counters() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_if_absent("k", "v1").await.unwrap());
        assert!(!store.set_if_absent("k", "v2").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("v1".to_string()));

        assert_eq!(store.incr_by("n", 3).await.unwrap(), 3);
        assert_eq!(store.incr_by("n", -1).await.unwrap(), 2);
        assert!(store.incr_by("k", 1).await.is_err());

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_order_and_removal() {
        let store = MemoryStore::new();
        store.list_push_back("q", "a").await.unwrap();
        store.list_push_back("q", "b").await.unwrap();
        store.list_push_front("q", "urgent").await.unwrap();
        store.list_push_back("q", "a").await.unwrap();

        assert_eq!(
            store.list_range("q").await.unwrap(),
            vec!["urgent", "a", "b", "a"]
        );
        assert_eq!(store.list_remove("q", "a").await.unwrap(), 2);
        assert_eq!(store.list_remove("q", "a").await.unwrap(), 0);
        assert_eq!(store.list_pop_front("q").await.unwrap(), Some("urgent".to_string()));
        assert_eq!(store.list_pop_front("q").await.unwrap(), Some("b".to_string()));
        assert_eq!(store.list_pop_front("q").await.unwrap(), None);
        assert!(!store.contains_key("q").await);
    }

    #[tokio::test]
    async fn test_wrong_type_is_rejected() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();
        let err = store.list_push_back("k", "x").await.unwrap_err();
        assert!(matches!(err, WorkhorseError::Store { .. }));
    }

    #[tokio::test]
    async fn test_blocking_pop_prefers_first_key() {
        let store = MemoryStore::new();
        store.list_push_back("low", "l1").await.unwrap();
        store.list_push_back("high", "h1").await.unwrap();

        let keys = vec!["high".to_string(), "low".to_string()];
        let hit = store
            .list_pop_front_blocking(&keys, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(hit, Some(("high".to_string(), "h1".to_string())));
    }

    #[tokio::test]
    async fn test_blocking_pop_wakes_on_push() {
        let store = Arc::new(MemoryStore::new());
        let keys = vec!["q".to_string()];

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .list_pop_front_blocking(&keys, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.list_push_back("q", "job-1").await.unwrap();

        let hit = waiter.await.unwrap().unwrap();
        assert_eq!(hit, Some(("q".to_string(), "job-1".to_string())));
    }

    #[tokio::test]
    async fn test_blocking_pop_times_out() {
        let store = MemoryStore::new();
        let keys = vec!["empty".to_string()];
        let hit = store
            .list_pop_front_blocking(&keys, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(hit, None);
    }

    #[tokio::test]
    async fn test_sorted_set_ordering_and_ties() {
        let store = MemoryStore::new();
        store.sorted_set_add("z", "b", 10.0).await.unwrap();
        store.sorted_set_add("z", "a", 10.0).await.unwrap();
        store.sorted_set_add("z", "c", 5.0).await.unwrap();
        store.sorted_set_add("z", "late", 100.0).await.unwrap();

        let due = store.sorted_set_range_by_score("z", 10.0).await.unwrap();
        let members: Vec<_> = due.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(members, vec!["c", "a", "b"]);

        // Re-adding an existing member moves it.
        store.sorted_set_add("z", "c", 50.0).await.unwrap();
        assert_eq!(store.sorted_set_len("z").await.unwrap(), 4);
        let due = store.sorted_set_range_by_score("z", 10.0).await.unwrap();
        assert_eq!(due.len(), 2);
    }

    #[tokio::test]
    async fn test_pop_before_claims_once() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..50 {
            store
                .sorted_set_add("z", &format!("m{}", i), i as f64)
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.sorted_set_pop_before("z", 100.0).await.unwrap()
            }));
        }

        let mut claimed = Vec::new();
        for handle in handles {
            claimed.extend(handle.await.unwrap());
        }
        assert_eq!(claimed.len(), 50);
        assert_eq!(store.sorted_set_len("z").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_set_remove_reports_winner() {
        let store = MemoryStore::new();
        assert!(store.set_add("s", "x").await.unwrap());
        assert!(!store.set_add("s", "x").await.unwrap());
        assert_eq!(store.set_len("s").await.unwrap(), 1);
        assert!(store.set_remove("s", "x").await.unwrap());
        assert!(!store.set_remove("s", "x").await.unwrap());
        assert!(store.set_members("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outage_switch() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();
        store.set_available(false);
        assert!(matches!(
            store.get("k").await,
            Err(WorkhorseError::StoreUnavailable { .. })
        ));
        store.set_available(true);
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
    }
}
