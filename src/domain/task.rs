//! Remote task model: families, identifiers, the status taxonomy and the
//! result wire formats exchanged with the compute service.

use std::fmt;
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};

/// Remote operation kinds understood by the compute service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskFamily {
    /// Compact batch of 16-bit weights in, `{min, max, avg}` triple out.
    WeightStats,
    /// Compact batch of sleep-stage triples in, one 8-bit score out.
    SleepQuality,
    /// Opaque profile in, opaque targeting result out.
    AdTargeting,
}

/// How a family's result body is shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// The body is one raw ciphertext.
    Single,
    /// The body is a JSON object with `min`, `max` and `avg` base64 ciphertexts.
    Stats,
}

impl TaskFamily {
    pub const ALL: [TaskFamily; 3] = [Self::WeightStats, Self::SleepQuality, Self::AdTargeting];

    /// Name used on the wire (`task_name`).
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::WeightStats => "weight_stats",
            Self::SleepQuality => "sleep_quality",
            Self::AdTargeting => "ad_targeting",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }

    /// Default delay between two status polls.
    #[must_use]
    pub const fn poll_interval(self) -> Duration {
        match self {
            Self::SleepQuality => Duration::from_secs(5),
            Self::WeightStats | Self::AdTargeting => Duration::from_secs(2),
        }
    }

    #[must_use]
    pub const fn result_shape(self) -> ResultShape {
        match self {
            Self::WeightStats => ResultShape::Stats,
            Self::SleepQuality | Self::AdTargeting => ResultShape::Single,
        }
    }
}

impl fmt::Display for TaskFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Server-issued identifier of an uploaded compute key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(pub String);

/// Server-issued identifier of a started task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw status strings reported by the compute service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Started,
    Reserved,
    Pending,
    Failure,
    Revoked,
    Unknown,
    Error,
    Success,
    Completed,
    /// Any string outside the closed set above.
    Unrecognized(String),
}

/// Policy bucket a status falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// Still running: poll again later.
    Wait,
    /// Fatal for this task ID: a new task must be started.
    Restart,
    /// Result fetch will succeed.
    Done,
}

impl TaskStatus {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        // Exact match only: a near miss such as "SUCCESS" must not become Done.
        match raw {
            "queued" => Self::Queued,
            "started" => Self::Started,
            "reserved" => Self::Reserved,
            "pending" => Self::Pending,
            "failure" => Self::Failure,
            "revoked" => Self::Revoked,
            "unknown" => Self::Unknown,
            "error" => Self::Error,
            "success" => Self::Success,
            "completed" => Self::Completed,
            _ => Self::Unrecognized(raw.to_string()),
        }
    }

    /// Closed mapping onto the three policy buckets.
    ///
    /// Unrecognized strings land in `Restart`, never in `Done`.
    #[must_use]
    pub fn class(&self) -> StatusClass {
        match self {
            Self::Queued | Self::Started | Self::Reserved => StatusClass::Wait,
            Self::Pending
            | Self::Failure
            | Self::Revoked
            | Self::Unknown
            | Self::Error
            | Self::Unrecognized(_) => StatusClass::Restart,
            Self::Success | Self::Completed => StatusClass::Done,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Reserved => "reserved",
            Self::Pending => "pending",
            Self::Failure => "failure",
            Self::Revoked => "revoked",
            Self::Unknown => "unknown",
            Self::Error => "error",
            Self::Success => "success",
            Self::Completed => "completed",
            Self::Unrecognized(raw) => raw,
        };
        f.write_str(s)
    }
}

/// How a body without a recognizable `status` field is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingStatusPolicy {
    /// Treat the body as a finished result (the deployed service streams
    /// single-ciphertext results without any status field).
    #[default]
    AssumeDone,
    /// Treat the body as a failed task.
    Restart,
}

impl MissingStatusPolicy {
    #[must_use]
    pub const fn class(self) -> StatusClass {
        match self {
            Self::AssumeDone => StatusClass::Done,
            Self::Restart => StatusClass::Restart,
        }
    }
}

/// Parsed `get_task_status` response.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
}

impl StatusReport {
    #[must_use]
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: Some(status.into()),
            details: None,
        }
    }

    #[must_use]
    pub fn parsed_status(&self) -> Option<TaskStatus> {
        self.status.as_deref().map(TaskStatus::parse)
    }

    #[must_use]
    pub fn class(&self, policy: MissingStatusPolicy) -> StatusClass {
        self.parsed_status()
            .map_or(policy.class(), |status| status.class())
    }
}

/// Look for a `status` field in an arbitrary response body.
///
/// Result bodies are either raw ciphertext bytes or JSON objects, so a body
/// that is not JSON, or JSON without a string `status`, yields `None`.
#[must_use]
pub fn body_status(body: &[u8]) -> Option<TaskStatus> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value
        .get("status")
        .and_then(serde_json::Value::as_str)
        .map(TaskStatus::parse)
}

/// Classify a result body, applying `policy` when no status is present.
#[must_use]
pub fn classify_body(body: &[u8], policy: MissingStatusPolicy) -> StatusClass {
    body_status(body).map_or(policy.class(), |status| status.class())
}

/// Wire form of a statistics result: three base64 ciphertexts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub min: String,
    pub max: String,
    pub avg: String,
}

/// Interpreted task result, still encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutput {
    Single(Vec<u8>),
    Stats {
        min: Vec<u8>,
        max: Vec<u8>,
        avg: Vec<u8>,
    },
}

impl TaskOutput {
    /// Interpret an opaque result body according to `shape`.
    ///
    /// # Errors
    /// Returns a description of the problem when a stats body is not the
    /// expected JSON object or carries invalid base64.
    pub fn parse(shape: ResultShape, body: Vec<u8>) -> Result<Self, String> {
        match shape {
            ResultShape::Single => Ok(Self::Single(body)),
            ResultShape::Stats => {
                let wire: StatsWire = serde_json::from_slice(&body)
                    .map_err(|e| format!("invalid stats body: {e}"))?;
                let decode = |field: &str, value: &str| {
                    base64::engine::general_purpose::STANDARD
                        .decode(value)
                        .map_err(|e| format!("invalid base64 in `{field}`: {e}"))
                };
                Ok(Self::Stats {
                    min: decode("min", &wire.min)?,
                    max: decode("max", &wire.max)?,
                    avg: decode("avg", &wire.avg)?,
                })
            }
        }
    }

    /// Encode as the wire body the compute service returns.
    ///
    /// # Errors
    /// Returns an error if JSON encoding fails.
    pub fn to_body(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Self::Single(bytes) => Ok(bytes.clone()),
            Self::Stats { min, max, avg } => {
                let b64 = base64::engine::general_purpose::STANDARD;
                serde_json::to_vec(&StatsWire {
                    status: Some("success".to_string()),
                    min: b64.encode(min),
                    max: b64.encode(max),
                    avg: b64.encode(avg),
                })
            }
        }
    }
}
