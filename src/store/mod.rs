//! Keyed storage backends.
//!
//! Every piece of shared state (job records, ready lists, the scheduled
//! sorted set, dependency counters, leases) lives behind the [`Store`] trait.
//! The trait mirrors the subset of Redis data structures the queue needs:
//! strings, integer counters, lists, sets and sorted sets. All cross-process
//! coordination is expressed as a single atomic call on this trait, so the
//! backends only have to make each individual operation atomic.
//!
//! Two backends ship with the crate: [`MemoryStore`] for tests and single
//! process deployments, and `RedisStore` behind the `redis` feature.

use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryStore;

#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Atomic keyed storage operations.
///
/// Backends must not retry internally. An unreachable backend surfaces as
/// [`WorkhorseError::StoreUnavailable`](crate::WorkhorseError::StoreUnavailable)
/// and the calling loop decides whether to try again.
#[async_trait]
pub trait Store: Send + Sync {
    // Strings and counters
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Writes `value` only when `key` does not exist. Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool>;
    /// Deletes `key` of any type. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;
    /// Adds `delta` to the integer at `key` (missing keys count as 0) and returns the new value.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;

    // Lists
    async fn list_push_back(&self, key: &str, value: &str) -> Result<u64>;
    async fn list_push_front(&self, key: &str, value: &str) -> Result<u64>;
    async fn list_pop_front(&self, key: &str) -> Result<Option<String>>;
    /// Pops from the first non-empty list among `keys`, in the given order,
    /// waiting up to `timeout` for one to receive a value.
    ///
    /// Returns the key that was popped from alongside the value.
    async fn list_pop_front_blocking(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>>;
    /// Removes every occurrence of `value`. Returns the number removed.
    async fn list_remove(&self, key: &str, value: &str) -> Result<u64>;
    async fn list_len(&self, key: &str) -> Result<u64>;
    async fn list_range(&self, key: &str) -> Result<Vec<String>>;

    // Sorted sets
    async fn sorted_set_add(&self, key: &str, member: &str, score: f64) -> Result<()>;
    async fn sorted_set_remove(&self, key: &str, member: &str) -> Result<bool>;
    async fn sorted_set_len(&self, key: &str) -> Result<u64>;
    /// Members with a score at or below `max_score`, ascending by score and
    /// then by member. Does not modify the set.
    async fn sorted_set_range_by_score(&self, key: &str, max_score: f64)
    -> Result<Vec<(String, f64)>>;
    /// Atomically claims and removes the members scored at or below
    /// `max_score`. Under concurrent callers each member is returned to
    /// exactly one of them.
    async fn sorted_set_pop_before(&self, key: &str, max_score: f64)
    -> Result<Vec<(String, f64)>>;

    // Sets
    async fn set_add(&self, key: &str, member: &str) -> Result<bool>;
    /// Returns true only for the caller that actually removed the member.
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;
    async fn set_len(&self, key: &str) -> Result<u64>;
}

/// Key layout for everything the queue persists.
///
/// All keys share a prefix (`workhorse:` by default) so several independent
/// deployments can share one Redis database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    prefix: String,
}

impl Default for Keys {
    fn default() -> Self {
        Self::new("workhorse")
    }
}

impl Keys {
    pub fn new(prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches(':');
        Self {
            prefix: format!("{}:", prefix),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn job(&self, job_id: &str) -> String {
        format!("{}job:{}", self.prefix, job_id)
    }

    pub fn queue(&self, queue_name: &str) -> String {
        format!("{}queue:{}", self.prefix, queue_name)
    }

    /// Maps a ready-list key back to its queue name.
    pub fn queue_name_from_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.prefix)?.strip_prefix("queue:")
    }

    /// Set of every queue name that has ever received a job.
    pub fn queues(&self) -> String {
        format!("{}queues", self.prefix)
    }

    /// Sorted set of scheduled entries scored by activation time.
    pub fn scheduled(&self) -> String {
        format!("{}scheduled", self.prefix)
    }

    pub fn schedule_entry(&self, job_id: &str) -> String {
        format!("{}schedule:{}", self.prefix, job_id)
    }

    pub fn schedule_sequence(&self) -> String {
        format!("{}schedule:seq", self.prefix)
    }

    /// Outstanding dependencies of a deferred job.
    pub fn dependencies(&self, job_id: &str) -> String {
        format!("{}deps:{}", self.prefix, job_id)
    }

    pub fn pending_dependencies(&self, job_id: &str) -> String {
        format!("{}deps:{}:pending", self.prefix, job_id)
    }

    /// Deferred jobs waiting on `job_id`.
    pub fn dependents(&self, job_id: &str) -> String {
        format!("{}dependents:{}", self.prefix, job_id)
    }

    pub fn leases(&self) -> String {
        format!("{}leases", self.prefix)
    }

    pub fn lease(&self, job_id: &str) -> String {
        format!("{}lease:{}", self.prefix, job_id)
    }

    pub fn failed(&self) -> String {
        format!("{}failed", self.prefix)
    }

    /// Terminal job records scored by when they may be reclaimed.
    pub fn expiring(&self) -> String {
        format!("{}expiring", self.prefix)
    }

    /// Queued jobs scored by when their queue TTL runs out.
    pub fn ttl(&self) -> String {
        format!("{}ttl", self.prefix)
    }

    pub fn exception_handlers(&self) -> String {
        format!("{}exception-handlers", self.prefix)
    }

    /// Present while workers are suspended.
    pub fn suspended(&self) -> String {
        format!("{}suspended", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let keys = Keys::default();
        assert_eq!(keys.job("abc"), "workhorse:job:abc");
        assert_eq!(keys.queue("default"), "workhorse:queue:default");
        assert_eq!(keys.scheduled(), "workhorse:scheduled");
        assert_eq!(keys.pending_dependencies("j1"), "workhorse:deps:j1:pending");
        assert_eq!(keys.dependents("j1"), "workhorse:dependents:j1");
        assert_eq!(keys.exception_handlers(), "workhorse:exception-handlers");
        assert_eq!(keys.suspended(), "workhorse:suspended");
    }

    #[test]
    fn test_custom_prefix_is_normalized() {
        assert_eq!(Keys::new("app:").queue("high"), "app:queue:high");
        assert_eq!(Keys::new("app").queue("high"), "app:queue:high");
    }

    #[test]
    fn test_queue_name_from_key() {
        let keys = Keys::new("app");
        assert_eq!(keys.queue_name_from_key("app:queue:low"), Some("low"));
        assert_eq!(keys.queue_name_from_key("other:queue:low"), None);
        assert_eq!(keys.queue_name_from_key("app:job:low"), None);
    }
}
