use std::fmt::{self, Display};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Unique, time-ordered identifier of a scheduled job.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a registered job type, e.g. `anidb.get_file`.
#[derive(
    Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobKind(String);

impl JobKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobKind {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobKind {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Dispatch priority. Higher values are selected first.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const LOW: Priority = Priority(-10);
    pub const NORMAL: Priority = Priority(0);
    pub const HIGH: Priority = Priority(10);

    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> i32 {
        self.0
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job as reported by [`crate::Scheduler::status`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its eligible time or for a blocking precondition.
    Pending,
    /// Ready to be claimed by a worker.
    Eligible,
    /// Claimed by a worker and executing.
    Dispatched,
    Succeeded,
    FailedTerminal,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::FailedTerminal | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Eligible => "eligible",
            JobState::Dispatched => "dispatched",
            JobState::Succeeded => "succeeded",
            JobState::FailedTerminal => "failed_terminal",
            JobState::Cancelled => "cancelled",
        }
    }
}

/// One component of a job identity key.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct KeyField {
    pub name: String,
    pub value: String,
    /// Explicit position. Indexed fields sort ahead of unindexed ones.
    pub index: Option<u32>,
}

impl KeyField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            index: None,
        }
    }

    pub fn with_index(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }
}

/// Builds the canonical identity string `kind[name=value,...]`.
///
/// Fields with an explicit index come first, ordered by index; the rest keep
/// their declaration order. The result only depends on names and values, so
/// the same logical input always produces the same key across restarts.
/// Separator characters inside names and values are backslash-escaped, so
/// distinct field lists never render to the same key.
pub fn job_key(kind: &JobKind, fields: &[KeyField]) -> String {
    let mut ordered: Vec<(usize, &KeyField)> = fields.iter().enumerate().collect();
    ordered.sort_by_key(|(position, field)| match field.index {
        Some(index) => (0u8, index, *position),
        None => (1u8, 0, *position),
    });

    let rendered = ordered
        .iter()
        .map(|(_, field)| {
            format!(
                "{}={}",
                escape_key_part(&field.name),
                escape_key_part(&field.value)
            )
        })
        .collect::<Vec<_>>()
        .join(",");

    format!("{kind}[{rendered}]")
}

fn escape_key_part(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for ch in part.chars() {
        if matches!(ch, '\\' | ',' | '=' | '[' | ']') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Named input fields of a job, stored as a JSON object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobInput(Map<String, Value>);

impl JobInput {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// Serializes a struct into input fields. Fails unless it is a JSON object.
    pub fn from_serializable<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        match serde_json::to_value(value)? {
            Value::Object(map) => Ok(Self(map)),
            other => Err(serde::de::Error::custom(format!(
                "job input must be an object, got {other}"
            ))),
        }
    }

    /// Deserializes the input fields into a typed struct.
    pub fn parse<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(Value::Object(self.0.clone()))
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.0.get(name).and_then(Value::as_u64)
    }

    /// Renders a field the way it appears inside a job key. Strings are
    /// used verbatim, other values use their JSON text. `null` and missing
    /// fields render as `None`.
    pub fn render_field(&self, name: &str) -> Option<String> {
        match self.0.get(name)? {
            Value::Null => None,
            Value::String(value) => Some(value.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for JobInput {
    fn from(value: Map<String, Value>) -> Self {
        Self(value)
    }
}

/// Result returned by a job executor.
#[derive(Clone, Debug, PartialEq)]
pub enum JobOutcome {
    Success,
    /// Failed but may succeed later. Consumes one attempt.
    Retry {
        reason: String,
        /// Minimum delay before the next attempt. Never shortens the backoff.
        retry_in: Option<Duration>,
    },
    /// Failed in a way retrying cannot fix.
    Fail { reason: String },
    /// Could not run right now (ban, overload). Does not consume an attempt.
    Deferred { reason: String, retry_in: Duration },
    /// Observed a cancellation request and stopped.
    Cancelled,
}

impl JobOutcome {
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry {
            reason: reason.into(),
            retry_in: None,
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self::Fail {
            reason: reason.into(),
        }
    }

    pub fn deferred(reason: impl Into<String>, retry_in: Duration) -> Self {
        Self::Deferred {
            reason: reason.into(),
            retry_in,
        }
    }

    /// Short label used for spans and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Success => "success",
            JobOutcome::Retry { .. } => "retry",
            JobOutcome::Fail { .. } => "fail",
            JobOutcome::Deferred { .. } => "deferred",
            JobOutcome::Cancelled => "cancelled",
        }
    }
}

/// What happened to a submission.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SubmitOutcome {
    /// A new entry was stored.
    Created(JobId),
    /// An identical job was already waiting; its priority was raised if needed.
    Merged(JobId),
    /// An identical job is already executing.
    Duplicate(JobId),
    /// An identical job succeeded recently.
    AlreadySucceeded(JobId),
}

impl SubmitOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            SubmitOutcome::Created(id)
            | SubmitOutcome::Merged(id)
            | SubmitOutcome::Duplicate(id)
            | SubmitOutcome::AlreadySucceeded(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, SubmitOutcome::Created(_))
    }
}

/// A job submission with optional scheduling hints.
#[derive(Clone, Debug)]
pub struct Submission {
    pub kind: JobKind,
    pub input: JobInput,
    pub priority: Priority,
    /// Earliest time the job may run.
    pub not_before: Option<DateTime<Utc>>,
}

impl Submission {
    pub fn new(kind: impl Into<JobKind>, input: JobInput) -> Self {
        Self {
            kind: kind.into(),
            input,
            priority: Priority::NORMAL,
            not_before: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }
}

/// Point-in-time view of a job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobId,
    pub kind: JobKind,
    pub identity_key: String,
    pub state: JobState,
    pub priority: Priority,
    pub attempts: u32,
    pub eligible_at: Option<DateTime<Utc>>,
    pub last_failure: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_key_uses_declaration_order_without_indexes() {
        let kind = JobKind::new("GetFile");
        let fields = [KeyField::new("hash", "abc"), KeyField::new("size", "123")];

        assert_eq!(job_key(&kind, &fields), "GetFile[hash=abc,size=123]");
    }

    #[test]
    fn job_key_puts_indexed_fields_first() {
        let kind = JobKind::new("GetFile");
        let fields = [
            KeyField::new("size", "123"),
            KeyField::new("hash", "abc").with_index(0),
            KeyField::new("name", "x"),
        ];

        assert_eq!(job_key(&kind, &fields), "GetFile[hash=abc,size=123,name=x]");
    }

    #[test]
    fn job_key_escapes_separators_in_values() {
        let kind = JobKind::new("pair");
        let first = vec![KeyField::new("a", "1,b=2"), KeyField::new("b", "3")];
        let second = vec![KeyField::new("a", "1"), KeyField::new("b", "2,b=3")];

        assert_ne!(job_key(&kind, &first), job_key(&kind, &second));
        assert_eq!(job_key(&kind, &first), r"pair[a=1\,b\=2,b=3]");
        assert_eq!(
            job_key(&kind, &[KeyField::new("a", r"x]\")]),
            r"pair[a=x\]\\]"
        );
    }

    #[test]
    fn job_key_for_kind_without_fields() {
        assert_eq!(job_key(&JobKind::new("Sync"), &[]), "Sync[]");
    }

    #[test]
    fn render_field_handles_scalars() {
        let input = JobInput::new()
            .with("hash", "abc")
            .with("size", 123u64)
            .with("force", true)
            .with("missing", Value::Null);

        assert_eq!(input.render_field("hash").as_deref(), Some("abc"));
        assert_eq!(input.render_field("size").as_deref(), Some("123"));
        assert_eq!(input.render_field("force").as_deref(), Some("true"));
        assert_eq!(input.render_field("missing"), None);
        assert_eq!(input.render_field("absent"), None);
    }

    #[test]
    fn input_round_trips_through_typed_struct() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct FileRef {
            hash: String,
            size: u64,
        }

        let typed = FileRef {
            hash: "abc".into(),
            size: 42,
        };
        let input = JobInput::from_serializable(&typed).unwrap();
        assert_eq!(input.get("size"), Some(&json!(42)));
        assert_eq!(input.parse::<FileRef>().unwrap(), typed);
    }

    #[test]
    fn scalar_cannot_become_input() {
        assert!(JobInput::from_serializable(&5u32).is_err());
    }

    #[test]
    fn priority_orders_higher_first_when_reversed() {
        let mut priorities = vec![Priority::new(1), Priority::new(3), Priority::new(2)];
        priorities.sort_by(|a, b| b.cmp(a));
        assert_eq!(
            priorities,
            vec![Priority::new(3), Priority::new(2), Priority::new(1)]
        );
    }
}
