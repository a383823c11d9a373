//! Periodic (cron) jobs: policies, the per-node policy cache, the enqueuer
//! that materializes executions and the scheduler facade.

pub mod enqueuer;
pub mod policy;
pub mod policy_store;
pub mod scheduler;

pub use enqueuer::{Enqueuer, RoundReport};
pub use policy::{parse_cron, Policy, PolicyEvent, PolicyMessage};
pub use policy_store::PolicyStore;
pub use scheduler::PeriodicScheduler;
