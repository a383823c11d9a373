//! Tests for configuration validation

use prometheus_jobservice::config::{
    HookConfig, JobServiceConfig, LifecycleConfig, PeriodicConfig, WorkerPoolConfig,
};

#[test]
fn test_default_config_is_valid() {
    let cfg = JobServiceConfig::default();
    assert!(cfg.validate().is_ok());
    assert!(cfg.redis_url.is_none());
}

#[test]
fn test_default_intervals() {
    let periodic = PeriodicConfig::default();
    assert_eq!(periodic.enqueue_interval().as_secs(), 120);
    assert_eq!(periodic.horizon().as_secs(), 240);
    assert_eq!(periodic.lock_ttl().as_secs(), 30);

    let hook = HookConfig::default();
    assert_eq!(hook.max_handlers, 5);
    assert_eq!(hook.channel_capacity, 1024);
    assert_eq!(hook.http_timeout().as_secs(), 15);
    assert_eq!(hook.max_event_age().as_secs(), 180 * 24 * 60 * 60);

    let lifecycle = LifecycleConfig::default();
    assert_eq!(lifecycle.short_interval().as_secs(), 5);
    assert_eq!(lifecycle.long_interval().as_secs(), 300);

    assert_eq!(WorkerPoolConfig::default().dead_time_secs, 10);
}

#[test]
fn test_worker_pool_config_invalid_worker_count() {
    let invalid = WorkerPoolConfig::new().with_worker_count(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_worker_pool_config_invalid_queue_depth() {
    let invalid = WorkerPoolConfig::new().with_max_queue_depth(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_worker_pool_config_dead_time_must_exceed_heartbeat() {
    let invalid = WorkerPoolConfig {
        heartbeat_interval_secs: 10,
        dead_time_secs: 10,
        ..WorkerPoolConfig::default()
    };
    let err = invalid.validate().unwrap_err();
    assert!(err.contains("dead_time_secs"));
}

#[test]
fn test_periodic_config_horizon_shorter_than_interval() {
    let invalid = PeriodicConfig {
        enqueue_interval_secs: 120,
        horizon_secs: 60,
        ..PeriodicConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_hook_config_invalid_handlers() {
    let invalid = HookConfig {
        max_handlers: 0,
        ..HookConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_service_config_rejects_blank_namespace() {
    let cfg = JobServiceConfig {
        namespace: "  ".into(),
        ..JobServiceConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_service_config_rejects_non_redis_url() {
    let cfg = JobServiceConfig {
        redis_url: Some("http://localhost:6379".into()),
        ..JobServiceConfig::default()
    };
    let err = cfg.validate().unwrap_err();
    assert!(err.contains("redis://"));
}

#[test]
fn test_nested_errors_name_their_section() {
    let cfg = JobServiceConfig {
        worker_pool: WorkerPoolConfig::new().with_worker_count(0),
        ..JobServiceConfig::default()
    };
    let err = cfg.validate().unwrap_err();
    assert!(err.starts_with("worker_pool invalid"));
}

#[test]
fn test_from_json_str_partial_document() {
    let json = r#"{
        "namespace": "harbor",
        "worker_pool": { "worker_count": 3 },
        "periodic": { "horizon_secs": 600 }
    }"#;
    let cfg = JobServiceConfig::from_json_str(json).unwrap();
    assert_eq!(cfg.namespace, "harbor");
    assert_eq!(cfg.worker_pool.worker_count, 3);
    assert_eq!(cfg.worker_pool.max_queue_depth, WorkerPoolConfig::default().max_queue_depth);
    assert_eq!(cfg.periodic.horizon().as_secs(), 600);
}

#[test]
fn test_from_json_str_invalid() {
    assert!(JobServiceConfig::from_json_str("{ not json").is_err());
    let err = JobServiceConfig::from_json_str(r#"{"worker_pool": {"worker_count": 0}}"#).unwrap_err();
    assert!(err.contains("worker_count"));
}
