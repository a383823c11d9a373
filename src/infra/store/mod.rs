//! Shared store backends.
//!
//! Every cross-node interaction (queues, locks, pub/sub, job stats) goes through
//! the [`Store`] trait. The in-memory backend serves tests and single-node
//! deployments; the Redis backend (cargo feature `redis`) serves clusters.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::core::error::Result;

pub use memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Sorted-set member with its score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredMember {
    /// Member payload.
    pub member: String,
    /// Member score.
    pub score: i64,
}

/// Score window and paging of a sorted-set range query.
///
/// `i64::MIN` and `i64::MAX` stand for negative and positive infinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreRange {
    /// Inclusive lower bound.
    pub min: i64,
    /// Inclusive upper bound.
    pub max: i64,
    /// Highest score first.
    pub rev: bool,
    /// Members to skip.
    pub offset: usize,
    /// Maximum members to return.
    pub limit: Option<usize>,
}

impl ScoreRange {
    /// Whole set, lowest score first.
    #[must_use]
    pub const fn all() -> Self {
        Self::between(i64::MIN, i64::MAX)
    }

    /// Members with `min <= score <= max`.
    #[must_use]
    pub const fn between(min: i64, max: i64) -> Self {
        Self {
            min,
            max,
            rev: false,
            offset: 0,
            limit: None,
        }
    }

    /// Return highest scores first.
    #[must_use]
    pub const fn rev(mut self) -> Self {
        self.rev = true;
        self
    }

    /// Skip `offset` members and return at most `limit`.
    #[must_use]
    pub const fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }
}

/// One write inside an [`Store::atomic`] transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// Add or re-score a sorted-set member.
    ZAdd {
        /// Sorted set key.
        key: String,
        /// Score.
        score: i64,
        /// Member.
        member: String,
    },
    /// Add a sorted-set member unless it is already present.
    ZAddNx {
        /// Sorted set key.
        key: String,
        /// Score.
        score: i64,
        /// Member.
        member: String,
    },
    /// Remove a sorted-set member.
    ZRem {
        /// Sorted set key.
        key: String,
        /// Member.
        member: String,
    },
    /// Remove sorted-set members inside a score window.
    ZRemRangeByScore {
        /// Sorted set key.
        key: String,
        /// Inclusive lower bound.
        min: i64,
        /// Inclusive upper bound.
        max: i64,
    },
    /// Publish a message.
    Publish {
        /// Channel name.
        channel: String,
        /// Payload.
        message: String,
    },
    /// Write hash fields.
    HSet {
        /// Hash key.
        key: String,
        /// Field/value pairs.
        fields: Vec<(String, String)>,
    },
    /// Delete a key.
    Del {
        /// Key.
        key: String,
    },
    /// Set a key's time to live.
    Expire {
        /// Key.
        key: String,
        /// Time to live.
        ttl: Duration,
    },
}

/// Stream of messages received on a pub/sub channel.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<String>,
    forwarder: Option<AbortHandle>,
}

impl Subscription {
    /// Wrap a receiver fed by the backend.
    #[must_use]
    pub const fn new(rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self { rx, forwarder: None }
    }

    /// Wrap a receiver fed by a background forwarding task; the task is aborted
    /// when the subscription is dropped.
    #[must_use]
    pub const fn with_forwarder(rx: mpsc::UnboundedReceiver<String>, forwarder: AbortHandle) -> Self {
        Self {
            rx,
            forwarder: Some(forwarder),
        }
    }

    /// Next message, or `None` once the backend closed the channel.
    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
    }
}

/// Primitive operations of the shared key-value store.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Check connectivity.
    async fn ping(&self) -> Result<()>;

    /// Read a string value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a string value with an optional time to live.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Write a string value only if the key does not exist. Returns whether
    /// the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete a key. Returns whether it existed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Delete a string key only while it still holds `expected`.
    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool>;

    /// Set the time to live of an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Write hash fields.
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    /// Read one hash field.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Read a whole hash; empty when the key does not exist.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Write hash fields only if `guard_field` currently equals `expected`.
    async fn hset_if(
        &self,
        key: &str,
        guard_field: &str,
        expected: &str,
        fields: &[(String, String)],
    ) -> Result<bool>;

    /// Add or re-score a sorted-set member.
    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<()>;

    /// Remove a sorted-set member. Returns whether it existed.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    /// Score of a sorted-set member.
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>>;

    /// Members inside a score window.
    async fn zrange_by_score(&self, key: &str, range: ScoreRange) -> Result<Vec<ScoredMember>>;

    /// Number of members with `min <= score <= max`.
    async fn zcount(&self, key: &str, min: i64, max: i64) -> Result<usize>;

    /// Remove members with `min <= score <= max`; returns how many.
    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> Result<usize>;

    /// Remove and return the lowest-scored member.
    async fn zpop_min(&self, key: &str) -> Result<Option<ScoredMember>>;

    /// Move `member` from `src` to `dst` with a new score, atomically. Returns
    /// false when `member` was not in `src`.
    async fn zmove(&self, src: &str, dst: &str, member: &str, score: i64) -> Result<bool>;

    /// Publish a message on a channel.
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;

    /// Subscribe to a channel.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Apply several writes as one transaction.
    async fn atomic(&self, ops: Vec<StoreOp>) -> Result<()>;
}

/// Shared handle to a store backend.
pub type SharedStore = Arc<dyn Store>;
