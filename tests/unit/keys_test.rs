//! Tests for the shared-store key layout

use prometheus_jobservice::infra::Keys;

#[test]
fn test_queue_keys() {
    let keys = Keys::new("harbor");
    assert_eq!(keys.scheduled(), "harbor:scheduled");
    assert_eq!(keys.jobs(), "harbor:jobs");
    assert_eq!(keys.retry(), "harbor:retry");
    assert_eq!(keys.dead(), "harbor:dead");
    assert_eq!(keys.in_progress("n1"), "harbor:jobs:n1:inprogress");
}

#[test]
fn test_periodic_keys() {
    let keys = Keys::new("harbor");
    assert_eq!(keys.last_periodic_enqueue(), "harbor:last_periodic_enqueue_h");
    assert_eq!(keys.periodic_policies(), "harbor:period:policies");
    assert_eq!(
        keys.policy_notifications(),
        "harbor:period:policies:notifications"
    );
    assert_eq!(keys.periodic_lock(), "harbor:period:lock");
    assert_eq!(keys.executions("p1"), "harbor:executions:p1");
}

#[test]
fn test_job_keys() {
    let keys = Keys::new("harbor");
    assert_eq!(keys.job_stats("abc"), "harbor:job_stats:abc");
    assert_eq!(keys.job_index(), "harbor:job_index");
    assert_eq!(keys.unique_job("scan", "d1g"), "harbor:unique:scan:d1g");
    assert_eq!(keys.hook_events(), "harbor:hook_events");
    assert_eq!(keys.status_change_events(), "harbor:status_change_events");
    assert_eq!(keys.worker_pools(), "harbor:worker_pools");
    assert_eq!(keys.worker_pool("n1"), "harbor:worker_pools:n1");
}

#[test]
fn test_trailing_separator_is_trimmed() {
    let keys = Keys::new("harbor::");
    assert_eq!(keys.namespace(), "harbor");
    assert_eq!(keys.jobs(), "harbor:jobs");
}
