//! Tests for job and policy data models

use std::collections::BTreeMap;

use prometheus_jobservice::core::{
    periodic_execution_id, JobKind, JobStats, ParamValue, Parameters, Status,
};
use prometheus_jobservice::period::{Policy, PolicyEvent, PolicyMessage};

fn params() -> Parameters {
    let mut nested = BTreeMap::new();
    nested.insert("tag".to_string(), ParamValue::from("latest"));
    let mut params = Parameters::new();
    params.insert("repo".into(), "library/x".into());
    params.insert("retries".into(), 3_i64.into());
    params.insert("force".into(), true.into());
    params.insert("filter".into(), ParamValue::Map(nested));
    params
}

#[test]
fn test_param_values_from_json() {
    let parsed: Parameters =
        serde_json::from_str(r#"{"a": 1, "b": 1.5, "c": "x", "d": [true, null], "e": {"f": 2}}"#)
            .unwrap();
    assert_eq!(parsed["a"], ParamValue::Int(1));
    assert_eq!(parsed["b"], ParamValue::Float(1.5));
    assert_eq!(parsed["c"].as_str(), Some("x"));
    assert_eq!(
        parsed["d"],
        ParamValue::List(vec![ParamValue::Bool(true), ParamValue::Null])
    );
    assert!(matches!(parsed["e"], ParamValue::Map(_)));
}

#[test]
fn test_numeric_strings_read_as_integers() {
    assert_eq!(ParamValue::from("1704067200").as_i64(), Some(1_704_067_200));
    assert_eq!(ParamValue::from("soon").as_i64(), None);
}

#[test]
fn test_policy_survives_encoding() {
    let policy = Policy {
        id: "p1".into(),
        job_name: "scan-image".into(),
        cron_spec: "*/5 * * * *".into(),
        job_params: params(),
        web_hook_url: "http://hooks.local/p1".into(),
    };
    let decoded = Policy::decode(&policy.encode().unwrap()).unwrap();
    assert_eq!(decoded, policy);
    assert!(decoded.validate().is_ok());
}

#[test]
fn test_policy_message_wire_format() {
    let msg: PolicyMessage = serde_json::from_str(
        r#"{"event": "UnSchedule", "data": {"id": "p1", "job_name": "gc", "cron_spec": "@daily"}}"#,
    )
    .unwrap();
    assert_eq!(msg.event, PolicyEvent::UnSchedule);
    let data = msg.data.unwrap();
    assert!(data.job_params.is_empty());
    assert!(data.web_hook_url.is_empty());
}

#[test]
fn test_stats_survive_hash_fields() {
    let stats = JobStats {
        job_id: periodic_execution_id("p1", 1_704_067_260),
        status: Status::Running,
        job_name: "scan-image".into(),
        job_kind: JobKind::Scheduled,
        is_unique: true,
        ref_link: "/api/v1/jobs/p1@1704067260".into(),
        cron_spec: "* * * * *".into(),
        enqueue_time: 1_704_067_200,
        update_time: 1_704_067_261,
        run_at: 1_704_067_260,
        check_in: "half way".into(),
        check_in_at: 1_704_067_262,
        die_at: 0,
        web_hook_url: "http://hooks.local/x".into(),
        upstream_job_id: "p1".into(),
        numeric_policy_id: 1_704_000_000,
        parameters: params(),
        revision: 2,
    };
    let fields = stats.to_fields().unwrap().into_iter().collect();
    let decoded = JobStats::from_fields(&fields).unwrap();
    assert_eq!(decoded, stats);
    assert!(decoded.is_periodic_execution());
}

#[test]
fn test_scheduled_stats_need_run_at() {
    let stats = JobStats {
        job_id: "j1".into(),
        job_name: "scan-image".into(),
        job_kind: JobKind::Scheduled,
        ..JobStats::default()
    };
    assert!(stats.validate().is_err());
}
