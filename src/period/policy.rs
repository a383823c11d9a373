//! Periodic job policies and the change notifications shared between nodes.

use std::str::FromStr;

use cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::core::error::{JobServiceError, Result};
use crate::core::models::Parameters;
use crate::util::validate_url;

/// Parse a cron spec.
///
/// Five-field specs use the classic `minute hour day month weekday` layout;
/// six and seven-field specs carry a leading seconds field (and a trailing
/// year). `@hourly`-style descriptors are accepted as well.
///
/// # Errors
///
/// Returns `BadRequest` for specs that do not parse.
pub fn parse_cron(spec: &str) -> Result<Schedule> {
    let spec = spec.trim();
    let normalized = if spec.split_whitespace().count() == 5 {
        format!("0 {spec}")
    } else {
        spec.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| JobServiceError::bad_request(format!("invalid cron spec '{spec}': {e}")))
}

/// Template of a periodic job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Policy ID, equal to the job ID of the periodic job.
    pub id: String,
    /// Registered job name of the executions.
    pub job_name: String,
    /// Cron spec driving the executions.
    pub cron_spec: String,
    /// Parameters copied into every execution.
    #[serde(default, skip_serializing_if = "Parameters::is_empty")]
    pub job_params: Parameters,
    /// Web hook receiving status changes of the executions.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub web_hook_url: String,
}

impl Policy {
    /// Check the policy before it is stored.
    ///
    /// # Errors
    ///
    /// `BadRequest` for a missing ID or job name, a bad hook URL or an
    /// unparseable cron spec.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(JobServiceError::bad_request(
                "missing ID in the periodic job policy object",
            ));
        }
        if self.job_name.trim().is_empty() {
            return Err(JobServiceError::bad_request(
                "missing job name in the periodic job policy object",
            ));
        }
        if !self.web_hook_url.is_empty() {
            validate_url(&self.web_hook_url)?;
        }
        parse_cron(&self.cron_spec).map(|_| ())
    }

    /// Parsed cron schedule.
    ///
    /// # Errors
    ///
    /// `BadRequest` for an unparseable cron spec.
    pub fn schedule(&self) -> Result<Schedule> {
        parse_cron(&self.cron_spec)
    }

    /// Serialize to the stored member format.
    ///
    /// # Errors
    ///
    /// Fails only if the parameters cannot be serialized.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a stored member.
    ///
    /// # Errors
    ///
    /// `Serialization` for malformed members.
    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Kind of policy change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyEvent {
    /// A policy was added.
    Schedule,
    /// A policy was removed.
    UnSchedule,
}

/// Policy change published to every node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyMessage {
    /// What happened.
    pub event: PolicyEvent,
    /// The policy concerned.
    pub data: Option<Policy>,
}

impl PolicyMessage {
    /// Notification for a newly scheduled policy.
    #[must_use]
    pub const fn schedule(policy: Policy) -> Self {
        Self {
            event: PolicyEvent::Schedule,
            data: Some(policy),
        }
    }

    /// Notification for a removed policy.
    #[must_use]
    pub const fn unschedule(policy: Policy) -> Self {
        Self {
            event: PolicyEvent::UnSchedule,
            data: Some(policy),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Timelike, Utc};

    use super::*;
    use crate::core::models::ParamValue;

    fn policy() -> Policy {
        let mut job_params = Parameters::new();
        job_params.insert("repo".into(), ParamValue::from("library/x"));
        Policy {
            id: "p1".into(),
            job_name: "gc".into(),
            cron_spec: "*/5 * * * *".into(),
            job_params,
            web_hook_url: "http://hooks.local/cb".into(),
        }
    }

    #[test]
    fn test_five_field_spec_fires_on_minutes() {
        let schedule = parse_cron("*/5 * * * *").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 1, 0).unwrap();
        let next = schedule.after(&start).next().unwrap();
        assert_eq!((next.minute(), next.second()), (5, 0));
    }

    #[test]
    fn test_six_field_spec_keeps_seconds() {
        let schedule = parse_cron("30 * * * * *").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(schedule.after(&start).next().unwrap().second(), 30);
    }

    #[test]
    fn test_validate() {
        policy().validate().unwrap();

        let mut p = policy();
        p.id = " ".into();
        assert!(p.validate().is_err());

        let mut p = policy();
        p.cron_spec = "every day".into();
        assert!(matches!(p.validate(), Err(JobServiceError::BadRequest(_))));

        let mut p = policy();
        p.web_hook_url = "not a url".into();
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_policy_and_message_json() {
        let p = policy();
        assert_eq!(Policy::decode(&p.encode().unwrap()).unwrap(), p);

        let raw = serde_json::to_string(&PolicyMessage::unschedule(p)).unwrap();
        assert!(raw.contains(r#""event":"UnSchedule""#));
        let bare: Policy =
            serde_json::from_str(r#"{"id":"a","job_name":"b","cron_spec":"* * * * *"}"#).unwrap();
        assert!(bare.job_params.is_empty());
        assert!(!serde_json::to_string(&bare).unwrap().contains("web_hook_url"));
    }
}
