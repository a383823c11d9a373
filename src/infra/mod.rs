//! Shared-store adapters and the queues built on them.

pub mod keys;
pub mod store;
pub mod work_queue;

pub use keys::Keys;
pub use store::{InMemoryStore, ScoreRange, ScoredMember, SharedStore, Store, StoreOp, Subscription};
pub use work_queue::{ClaimedRecord, JobRecord, WorkQueue};
