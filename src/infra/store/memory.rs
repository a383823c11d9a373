//! In-memory store with string, hash and sorted-set values, key expiry and
//! in-process pub/sub.
//!
//! All state sits behind one `parking_lot::Mutex`, so every operation (and
//! every [`Store::atomic`] batch) is linearizable within the process.

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{ScoreRange, ScoredMember, Store, StoreOp, Subscription};
use crate::core::error::{JobServiceError, Result};

/// Sorted set ordered by `(score, member)`.
#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, score: i64, member: &str) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(old, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn in_window(&self, min: i64, max: i64) -> impl DoubleEndedIterator<Item = &(i64, String)> {
        let upper = if max == i64::MAX {
            Bound::Unbounded
        } else {
            Bound::Excluded((max + 1, String::new()))
        };
        (min <= max)
            .then(|| self.ordered.range((Bound::Included((min, String::new())), upper)))
            .into_iter()
            .flatten()
    }

    fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

#[derive(Debug)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    ZSet(SortedSet),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    const fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<String>>>,
}

fn wrong_type(key: &str) -> JobServiceError {
    JobServiceError::Backend(format!(
        "WRONGTYPE operation against key '{key}' holding the wrong kind of value"
    ))
}

impl State {
    /// Drop `key` if its time to live has passed.
    fn purge(&mut self, key: &str) {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.expired(now)) {
            self.entries.remove(key);
        }
    }

    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        self.purge(key);
        self.entries.get_mut(key)
    }

    fn zset(&mut self, key: &str) -> Result<Option<&mut SortedSet>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::ZSet(z),
                ..
            }) => Ok(Some(z)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn zset_or_create(&mut self, key: &str) -> Result<&mut SortedSet> {
        self.purge(key);
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::ZSet(SortedSet::default())));
        match &mut entry.value {
            Value::ZSet(z) => Ok(z),
            _ => Err(wrong_type(key)),
        }
    }

    fn hash(&mut self, key: &str) -> Result<Option<&mut HashMap<String, String>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(Some(h)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hash_or_create(&mut self, key: &str) -> Result<&mut HashMap<String, String>> {
        self.purge(key);
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
        match &mut entry.value {
            Value::Hash(h) => Ok(h),
            _ => Err(wrong_type(key)),
        }
    }

    fn string(&mut self, key: &str) -> Result<Option<&String>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(&*s)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    /// Remove a sorted set once its last member is gone.
    fn drop_if_empty(&mut self, key: &str) {
        if matches!(self.entries.get(key), Some(Entry { value: Value::ZSet(z), .. }) if z.is_empty())
        {
            self.entries.remove(key);
        }
    }

    fn zadd(&mut self, key: &str, score: i64, member: &str) -> Result<()> {
        self.zset_or_create(key)?.insert(score, member);
        Ok(())
    }

    fn zadd_nx(&mut self, key: &str, score: i64, member: &str) -> Result<()> {
        let z = self.zset_or_create(key)?;
        if !z.scores.contains_key(member) {
            z.insert(score, member);
        }
        Ok(())
    }

    fn zrem(&mut self, key: &str, member: &str) -> Result<bool> {
        let removed = self.zset(key)?.is_some_and(|z| z.remove(member));
        self.drop_if_empty(key);
        Ok(removed)
    }

    fn zrem_range(&mut self, key: &str, min: i64, max: i64) -> Result<usize> {
        let Some(z) = self.zset(key)? else {
            return Ok(0);
        };
        let doomed: Vec<String> = z.in_window(min, max).map(|(_, m)| m.clone()).collect();
        for member in &doomed {
            z.remove(member);
        }
        self.drop_if_empty(key);
        Ok(doomed.len())
    }

    fn hset(&mut self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let hash = self.hash_or_create(key)?;
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        self.live(key).is_some_and(|entry| {
            entry.expires_at = Some(Instant::now() + ttl);
            true
        })
    }

    fn publish(&mut self, channel: &str, message: &str) {
        if let Some(senders) = self.subscribers.get_mut(channel) {
            senders.retain(|tx| tx.send(message.to_string()).is_ok());
        }
    }

    fn apply(&mut self, op: StoreOp) -> Result<()> {
        match op {
            StoreOp::ZAdd { key, score, member } => self.zadd(&key, score, &member),
            StoreOp::ZAddNx { key, score, member } => self.zadd_nx(&key, score, &member),
            StoreOp::ZRem { key, member } => self.zrem(&key, &member).map(|_| ()),
            StoreOp::ZRemRangeByScore { key, min, max } => {
                self.zrem_range(&key, min, max).map(|_| ())
            }
            StoreOp::Publish { channel, message } => {
                self.publish(&channel, &message);
                Ok(())
            }
            StoreOp::HSet { key, fields } => self.hset(&key, &fields),
            StoreOp::Del { key } => {
                self.entries.remove(&key);
                Ok(())
            }
            StoreOp::Expire { key, ttl } => {
                self.expire(&key, ttl);
                Ok(())
            }
        }
    }
}

/// Single-process [`Store`] implementation.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| !e.expired(now))
            .count()
    }

    /// True when no live key exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state.lock().string(key)?.cloned())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut entry = Entry::new(Value::Str(value.to_string()));
        entry.expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.state.lock().entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock();
        if state.live(key).is_some() {
            return Ok(false);
        }
        let mut entry = Entry::new(Value::Str(value.to_string()));
        entry.expires_at = Some(Instant::now() + ttl);
        state.entries.insert(key.to_string(), entry);
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let existed = state.live(key).is_some();
        state.entries.remove(key);
        Ok(existed)
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool> {
        let mut state = self.state.lock();
        if state.string(key)?.is_some_and(|v| v == expected) {
            state.entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        Ok(self.state.lock().expire(key, ttl))
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        self.state.lock().hset(key, fields)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .state
            .lock()
            .hash(key)?
            .and_then(|h| h.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.state.lock().hash(key)?.cloned().unwrap_or_default())
    }

    async fn hset_if(
        &self,
        key: &str,
        guard_field: &str,
        expected: &str,
        fields: &[(String, String)],
    ) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(hash) = state.hash(key)? else {
            return Ok(false);
        };
        if hash.get(guard_field).map(String::as_str) != Some(expected) {
            return Ok(false);
        }
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(true)
    }

    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<()> {
        self.state.lock().zadd(key, score, member)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        self.state.lock().zrem(key, member)
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<i64>> {
        Ok(self
            .state
            .lock()
            .zset(key)?
            .and_then(|z| z.scores.get(member).copied()))
    }

    async fn zrange_by_score(&self, key: &str, range: ScoreRange) -> Result<Vec<ScoredMember>> {
        let mut state = self.state.lock();
        let Some(z) = state.zset(key)? else {
            return Ok(Vec::new());
        };
        let to_member = |(score, member): &(i64, String)| ScoredMember {
            member: member.clone(),
            score: *score,
        };
        let limit = range.limit.unwrap_or(usize::MAX);
        let window = z.in_window(range.min, range.max);
        let out = if range.rev {
            window.rev().skip(range.offset).take(limit).map(to_member).collect()
        } else {
            window.skip(range.offset).take(limit).map(to_member).collect()
        };
        Ok(out)
    }

    async fn zcount(&self, key: &str, min: i64, max: i64) -> Result<usize> {
        Ok(self
            .state
            .lock()
            .zset(key)?
            .map_or(0, |z| z.in_window(min, max).count()))
    }

    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> Result<usize> {
        self.state.lock().zrem_range(key, min, max)
    }

    async fn zpop_min(&self, key: &str) -> Result<Option<ScoredMember>> {
        let mut state = self.state.lock();
        let popped = state.zset(key)?.and_then(|z| {
            let (score, member) = z.ordered.first().cloned()?;
            z.remove(&member);
            Some(ScoredMember { member, score })
        });
        state.drop_if_empty(key);
        Ok(popped)
    }

    async fn zmove(&self, src: &str, dst: &str, member: &str, score: i64) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.zrem(src, member)? {
            return Ok(false);
        }
        state.zadd(dst, score, member)?;
        Ok(true)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        self.state.lock().publish(channel, message);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }

    async fn atomic(&self, ops: Vec<StoreOp>) -> Result<()> {
        let mut state = self.state.lock();
        for op in ops {
            state.apply(op)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(items: &[ScoredMember]) -> Vec<&str> {
        items.iter().map(|m| m.member.as_str()).collect()
    }

    #[tokio::test]
    async fn test_sorted_set_ordering_and_ranges() {
        let store = InMemoryStore::new();
        store.zadd("z", 3, "c").await.unwrap();
        store.zadd("z", 1, "a").await.unwrap();
        store.zadd("z", 2, "b").await.unwrap();
        store.zadd("z", 5, "a").await.unwrap();

        let all = store.zrange_by_score("z", ScoreRange::all()).await.unwrap();
        assert_eq!(members(&all), vec!["b", "c", "a"]);

        let rev = store
            .zrange_by_score("z", ScoreRange::all().rev().page(1, 1))
            .await
            .unwrap();
        assert_eq!(members(&rev), vec!["c"]);

        assert_eq!(store.zcount("z", 2, 3).await.unwrap(), 2);
        assert_eq!(store.zscore("z", "a").await.unwrap(), Some(5));

        let popped = store.zpop_min("z").await.unwrap().unwrap();
        assert_eq!(popped.member, "b");
        assert_eq!(store.zrem_range_by_score("z", i64::MIN, 4).await.unwrap(), 1);
        assert!(store.zrem("z", "a").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_set_nx_and_owner_delete() {
        let store = InMemoryStore::new();
        assert!(store.set_nx("lock", "n1", Duration::from_secs(30)).await.unwrap());
        assert!(!store.set_nx("lock", "n2", Duration::from_secs(30)).await.unwrap());
        assert!(!store.del_if_eq("lock", "n2").await.unwrap());
        assert!(store.del_if_eq("lock", "n1").await.unwrap());
        assert!(store.get("lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = InMemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hset_if_guard() {
        let store = InMemoryStore::new();
        assert!(!store
            .hset_if("h", "status", "Pending", &[("status".into(), "Running".into())])
            .await
            .unwrap());
        store
            .hset("h", &[("status".into(), "Pending".into())])
            .await
            .unwrap();
        assert!(store
            .hset_if("h", "status", "Pending", &[("status".into(), "Running".into())])
            .await
            .unwrap());
        assert!(!store
            .hset_if("h", "status", "Pending", &[("status".into(), "Error".into())])
            .await
            .unwrap());
        assert_eq!(
            store.hget("h", "status").await.unwrap().as_deref(),
            Some("Running")
        );
    }

    #[tokio::test]
    async fn test_wrong_type_is_backend_error() {
        let store = InMemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        let err = store.zadd("k", 1, "m").await.unwrap_err();
        assert!(matches!(err, JobServiceError::Backend(_)));
    }

    #[tokio::test]
    async fn test_atomic_publishes_to_subscribers() {
        let store = InMemoryStore::new();
        let mut sub = store.subscribe("events").await.unwrap();
        store
            .atomic(vec![
                StoreOp::ZAdd {
                    key: "policies".into(),
                    score: 7,
                    member: "p".into(),
                },
                StoreOp::Publish {
                    channel: "events".into(),
                    message: "hello".into(),
                },
            ])
            .await
            .unwrap();
        assert_eq!(sub.next().await.as_deref(), Some("hello"));
        assert_eq!(store.zscore("policies", "p").await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_atomic_zadd_nx_keeps_existing_score() {
        let store = InMemoryStore::new();
        store.zadd("executions", -1, "p@60").await.unwrap();
        let add = |member: &str, score| StoreOp::ZAddNx {
            key: "executions".into(),
            score,
            member: member.into(),
        };
        store
            .atomic(vec![add("p@60", 60), add("p@120", 120)])
            .await
            .unwrap();
        assert_eq!(store.zscore("executions", "p@60").await.unwrap(), Some(-1));
        assert_eq!(store.zscore("executions", "p@120").await.unwrap(), Some(120));
    }

    #[tokio::test]
    async fn test_zmove_requires_source_member() {
        let store = InMemoryStore::new();
        assert!(!store.zmove("a", "b", "m", 1).await.unwrap());
        store.zadd("a", 0, "m").await.unwrap();
        assert!(store.zmove("a", "b", "m", 9).await.unwrap());
        assert_eq!(store.zscore("b", "m").await.unwrap(), Some(9));
        assert_eq!(store.zscore("a", "m").await.unwrap(), None);
    }
}
