//! Job data model: kinds, parameters, stats and status-change payloads.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{JobServiceError, Result};
use super::status::Status;

/// Kind of job submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum JobKind {
    /// Run as soon as a worker is free.
    #[default]
    Generic,
    /// Run once after a delay.
    Scheduled,
    /// Run on a cron schedule (the stats describe the policy).
    Periodic,
}

impl JobKind {
    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Generic => "Generic",
            Self::Scheduled => "Scheduled",
            Self::Periodic => "Periodic",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = JobServiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Generic" => Ok(Self::Generic),
            "Scheduled" => Ok(Self::Scheduled),
            "Periodic" => Ok(Self::Periodic),
            other => Err(JobServiceError::bad_request(format!(
                "job kind '{other}' is not supported, only support 'Generic','Scheduled','Periodic'"
            ))),
        }
    }
}

/// Tagged value of a job parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// JSON null.
    Null,
    /// Boolean flag.
    Bool(bool),
    /// Integral number.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Text.
    String(String),
    /// Ordered list of values.
    List(Vec<ParamValue>),
    /// Nested map.
    Map(BTreeMap<String, ParamValue>),
}

impl ParamValue {
    /// Borrow the value as text if it is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integral value, accepting numeric strings.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

/// Parameters for job execution.
pub type Parameters = BTreeMap<String, ParamValue>;

/// Parameter carrying the fire epoch of a periodic execution.
pub const PERIODIC_EXECUTION_MARK: &str = "_job_kind_periodic_";

/// Tracking ID of a periodic execution: `policyID@epoch`.
#[must_use]
pub fn periodic_execution_id(policy_id: &str, epoch: i64) -> String {
    format!("{policy_id}@{epoch}")
}

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// Tracked state of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobStats {
    /// Unique, opaque job identifier.
    #[serde(rename = "id")]
    pub job_id: String,
    /// Current status.
    pub status: Status,
    /// Registered job name.
    #[serde(rename = "name")]
    pub job_name: String,
    /// Submission kind.
    #[serde(rename = "kind")]
    pub job_kind: JobKind,
    /// Whether duplicate submissions are rejected.
    #[serde(rename = "unique")]
    pub is_unique: bool,
    /// API link of the job.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ref_link: String,
    /// Cron spec (periodic policies and their executions).
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cron_spec: String,
    /// Unix seconds of submission.
    pub enqueue_time: i64,
    /// Unix seconds of the last write.
    pub update_time: i64,
    /// Unix seconds the job should run at (scheduled jobs).
    #[serde(skip_serializing_if = "is_zero")]
    pub run_at: i64,
    /// Last progress message reported by the job.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub check_in: String,
    /// Unix seconds of the last check-in.
    #[serde(skip_serializing_if = "is_zero")]
    pub check_in_at: i64,
    /// Unix seconds the job reached a failure status.
    #[serde(skip_serializing_if = "is_zero")]
    pub die_at: i64,
    /// Status hook endpoint.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub web_hook_url: String,
    /// Owning policy of a periodic execution.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub upstream_job_id: String,
    /// Numeric ID (creation epoch) of a periodic policy.
    #[serde(rename = "numeric_policy_id", skip_serializing_if = "is_zero")]
    pub numeric_policy_id: i64,
    /// Job parameters.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: Parameters,
    /// Retry attempt counter.
    #[serde(skip_serializing_if = "is_zero")]
    pub revision: i64,
}

impl Default for JobStats {
    fn default() -> Self {
        Self {
            job_id: String::new(),
            status: Status::Pending,
            job_name: String::new(),
            job_kind: JobKind::Generic,
            is_unique: false,
            ref_link: String::new(),
            cron_spec: String::new(),
            enqueue_time: 0,
            update_time: 0,
            run_at: 0,
            check_in: String::new(),
            check_in_at: 0,
            die_at: 0,
            web_hook_url: String::new(),
            upstream_job_id: String::new(),
            numeric_policy_id: 0,
            parameters: Parameters::new(),
            revision: 0,
        }
    }
}

impl JobStats {
    /// Check the fields required before the stats can be tracked.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` naming the first missing field.
    pub fn validate(&self) -> Result<()> {
        if self.job_id.trim().is_empty() {
            return Err(JobServiceError::bad_request("missing job ID in job stats"));
        }
        if self.job_name.trim().is_empty() {
            return Err(JobServiceError::bad_request("missing job name in job stats"));
        }
        if self.job_kind == JobKind::Periodic && self.cron_spec.trim().is_empty() {
            return Err(JobServiceError::bad_request("missing cron spec for periodic job"));
        }
        if self.job_kind == JobKind::Scheduled && self.run_at == 0 {
            return Err(JobServiceError::bad_request(
                "enqueue timestamp missing for scheduled job",
            ));
        }
        Ok(())
    }

    /// True for a materialized execution of a periodic policy.
    #[must_use]
    pub fn is_periodic_execution(&self) -> bool {
        !self.upstream_job_id.is_empty()
    }

    /// Flatten into hash fields for the shared store.
    ///
    /// # Errors
    ///
    /// Fails only if the parameters cannot be serialized.
    pub fn to_fields(&self) -> Result<Vec<(String, String)>> {
        let params = serde_json::to_string(&self.parameters)?;
        Ok(vec![
            ("id".into(), self.job_id.clone()),
            ("name".into(), self.job_name.clone()),
            ("kind".into(), self.job_kind.to_string()),
            ("unique".into(), self.is_unique.to_string()),
            ("status".into(), self.status.to_string()),
            ("ref_link".into(), self.ref_link.clone()),
            ("cron_spec".into(), self.cron_spec.clone()),
            ("enqueue_time".into(), self.enqueue_time.to_string()),
            ("update_time".into(), self.update_time.to_string()),
            ("run_at".into(), self.run_at.to_string()),
            ("check_in".into(), self.check_in.clone()),
            ("check_in_at".into(), self.check_in_at.to_string()),
            ("die_at".into(), self.die_at.to_string()),
            ("web_hook_url".into(), self.web_hook_url.clone()),
            ("upstream_job_id".into(), self.upstream_job_id.clone()),
            ("numeric_policy_id".into(), self.numeric_policy_id.to_string()),
            ("parameters".into(), params),
            ("revision".into(), self.revision.to_string()),
        ])
    }

    /// Rebuild stats from hash fields.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an empty hash and `Internal` for malformed fields.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self> {
        if fields.is_empty() {
            return Err(JobServiceError::NotFound("job stats".into()));
        }
        let text = |name: &str| fields.get(name).cloned().unwrap_or_default();
        let number = |name: &str| -> Result<i64> {
            match fields.get(name).map(String::as_str) {
                None | Some("") => Ok(0),
                Some(raw) => raw.parse().map_err(|_| {
                    JobServiceError::Internal(format!("malformed field {name}: {raw}"))
                }),
            }
        };
        let status = text("status")
            .parse::<Status>()
            .map_err(|e| JobServiceError::Internal(e.to_string()))?;
        let job_kind = text("kind")
            .parse::<JobKind>()
            .map_err(|e| JobServiceError::Internal(e.to_string()))?;
        let parameters = match fields.get("parameters").map(String::as_str) {
            None | Some("") => Parameters::new(),
            Some(raw) => serde_json::from_str(raw)?,
        };

        Ok(Self {
            job_id: text("id"),
            status,
            job_name: text("name"),
            job_kind,
            is_unique: text("unique") == "true",
            ref_link: text("ref_link"),
            cron_spec: text("cron_spec"),
            enqueue_time: number("enqueue_time")?,
            update_time: number("update_time")?,
            run_at: number("run_at")?,
            check_in: text("check_in"),
            check_in_at: number("check_in_at")?,
            die_at: number("die_at")?,
            web_hook_url: text("web_hook_url"),
            upstream_job_id: text("upstream_job_id"),
            numeric_policy_id: number("numeric_policy_id")?,
            parameters,
            revision: number("revision")?,
        })
    }
}

/// Status change reported through a web hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    /// Job the change belongs to.
    pub job_id: String,
    /// New status.
    pub status: Status,
    /// Check-in message, if the change is a check-in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_in: Option<String>,
    /// Snapshot of the job stats at the time of the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JobStats>,
}

/// Entry of the dead-status retry queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleStatusChange {
    /// Job the change belongs to.
    pub job_id: String,
    /// Status that could not be applied.
    pub target_status: Status,
    /// Revision of the job when the change was produced.
    #[serde(default)]
    pub revision: i64,
}
