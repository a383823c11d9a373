//! Tests for shared utilities

use std::time::Duration;

use prometheus_jobservice::util::{
    new_job_id, new_node_id, ref_link, validate_url, Clock, ManualClock,
};

#[test]
fn test_job_ids_are_opaque_hex() {
    let a = new_job_id();
    let b = new_job_id();
    assert_eq!(a.len(), 32);
    assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(a, b);
}

#[test]
fn test_node_ids_are_distinct() {
    assert_ne!(new_node_id(), new_node_id());
}

#[test]
fn test_validate_url() {
    assert!(validate_url("http://hooks.local:8080/x").is_ok());
    assert!(validate_url("hooks.local/x").is_err());
}

#[test]
fn test_ref_link() {
    assert_eq!(ref_link("abc"), "/api/v1/jobs/abc");
}

#[test]
fn test_manual_clock_millis_follow_seconds() {
    let clock = ManualClock::at_unix(1_704_067_200);
    clock.advance(Duration::from_secs(60));
    assert_eq!(clock.unix(), 1_704_067_260);
    assert_eq!(clock.unix_millis(), 1_704_067_260_000);
}

#[test]
fn test_init_tracing_is_idempotent() {
    prometheus_jobservice::util::init_tracing();
    prometheus_jobservice::util::init_tracing();
    prometheus_jobservice::util::init_tracing_json();
    tracing::info!(target: "util_test", "tracing initialized");
}
