//! Wire models shared with the control plane and the job queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Retention applied when a report does not declare a usable period.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Treats an explicit JSON `null` the same as a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Retry settings carried on the job. Accepted and passed through; an
/// external requeue layer owns enacting them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default, deserialize_with = "null_as_default")]
    pub max_attempts: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub backoff_strategy: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub max_backoff_hours: u32,
}

/// One execution request popped from the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default, deserialize_with = "null_as_default")]
    pub job_id: String,
    pub execution_id: String,
    pub report_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub task_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub priority: String,
    /// Zero means "use the engine default".
    #[serde(default, deserialize_with = "null_as_default")]
    pub timeout_seconds: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub retry_policy: RetryPolicy,
    /// Overrides the report's stored SQL when non-empty.
    #[serde(default)]
    pub sql_definition: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub bindings: Vec<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub notification_emails: Vec<String>,
}

impl Job {
    /// Parse a queue payload.
    pub fn from_payload(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }

    /// The SQL override, if one was supplied.
    pub fn sql_override(&self) -> Option<&str> {
        self.sql_definition
            .as_deref()
            .filter(|sql| !sql.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportType {
    Sql,
    Visual,
    Service,
    #[serde(other)]
    Other,
}

impl Default for ReportType {
    fn default() -> Self {
        Self::Other
    }
}

/// Database descriptor attached to a report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    /// Engine type: `mysql`, `postgres`, `oracle` or `mssql`.
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub kind: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub connection_config: Map<String, Value>,
}

/// Mail or file-transfer server descriptor. Shares the data source shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteServer {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub kind: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub connection_config: Map<String, Value>,
}

impl RemoteServer {
    pub fn is_configured(&self) -> bool {
        !self.id.is_empty()
    }
}

/// Per-column projection and formatting control.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportField {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub source_field: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub alias: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_visible: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub order_position: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub data_type: String,
    /// Display format token such as `YYYY-MM-DD`.
    #[serde(default, deserialize_with = "null_as_default")]
    pub format: String,
}

/// Report definition fetched from the control plane for each job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub report_type: ReportType,
    #[serde(default, deserialize_with = "null_as_default")]
    pub sql_definition: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub data_source: DataSource,
    #[serde(default)]
    pub email_server: Option<RemoteServer>,
    #[serde(default)]
    pub ftp_server: Option<RemoteServer>,
    #[serde(default)]
    pub retention_period: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub fields: Vec<ReportField>,
}

impl Report {
    /// How long a delivered artifact stays valid.
    pub fn retention(&self) -> Duration {
        self.retention_period
            .as_deref()
            .and_then(parse_retention)
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_RETENTION)
    }

    /// The FTP server descriptor, when one is attached.
    pub fn ftp_target(&self) -> Option<&RemoteServer> {
        self.ftp_server.as_ref().filter(|s| s.is_configured())
    }
}

/// Parse duration strings like `24h`, `1h30m`, `45s`, `500ms` or `7d`.
fn parse_retention(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let amount: f64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "d" => 86400.0,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total += Duration::try_from_secs_f64(amount * seconds_per_unit).ok()?;
    }
    Some(total)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Status transition posted to the control plane. Unset fields are omitted
/// from the request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionUpdate {
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_path: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_log: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub otp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl ExecutionUpdate {
    pub fn processing(started_at: DateTime<Utc>) -> Self {
        Self {
            status: ExecutionStatus::Processing,
            started_at: Some(started_at),
            finished_at: None,
            output_path: String::new(),
            file_size: 0,
            error_log: String::new(),
            otp: String::new(),
            expires_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != ExecutionStatus::Processing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_from_wire_payload() {
        let payload = json!({
            "job_id": "b2c1",
            "execution_id": "exec-1",
            "report_id": "rep-1",
            "task_type": "execute",
            "priority": "high",
            "timeout_seconds": 60,
            "retry_policy": {"max_attempts": 3, "backoff_strategy": "exponential", "max_backoff_hours": 24},
            "sql_definition": "SELECT * FROM t WHERE id = ?",
            "bindings": [42, "abc", null, true],
            "notification_emails": ["ops@example.com"]
        })
        .to_string();

        let job = Job::from_payload(&payload).unwrap();
        assert_eq!(job.execution_id, "exec-1");
        assert_eq!(job.timeout_seconds, 60);
        assert_eq!(job.retry_policy.max_attempts, 3);
        assert_eq!(job.bindings.len(), 4);
        assert_eq!(job.sql_override(), Some("SELECT * FROM t WHERE id = ?"));
    }

    #[test]
    fn test_job_tolerates_missing_and_null_fields() {
        let job = Job::from_payload(
            r#"{"execution_id":"e","report_id":"r","bindings":null,"sql_definition":"  "}"#,
        )
        .unwrap();
        assert_eq!(job.timeout_seconds, 0);
        assert!(job.bindings.is_empty());
        assert_eq!(job.sql_override(), None);
    }

    #[test]
    fn test_report_type_defaults() {
        let report: Report = serde_json::from_value(json!({
            "id": "r1",
            "name": "Sales",
            "type": "dashboard",
            "data_source": {"type": "postgres", "connection_config": {"host": "db"}},
            "ftp_server": null,
            "fields": [{"source_field": "id", "is_visible": true, "alias": null}]
        }))
        .unwrap();
        assert_eq!(report.report_type, ReportType::Other);
        assert_eq!(report.data_source.kind, "postgres");
        assert!(report.ftp_target().is_none());
        assert_eq!(report.fields[0].alias, "");
    }

    #[test]
    fn test_retention_parsing() {
        assert_eq!(parse_retention("24h"), Some(Duration::from_secs(86400)));
        assert_eq!(parse_retention("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_retention("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_retention("7d"), Some(Duration::from_secs(7 * 86400)));
        assert_eq!(parse_retention("forever"), None);
        assert_eq!(parse_retention("12"), None);

        let mut report = Report::default();
        assert_eq!(report.retention(), DEFAULT_RETENTION);
        report.retention_period = Some("0s".into());
        assert_eq!(report.retention(), DEFAULT_RETENTION);
        report.retention_period = Some("48h".into());
        assert_eq!(report.retention(), Duration::from_secs(2 * 86400));
    }

    #[test]
    fn test_update_omits_empty_fields() {
        let started = Utc::now();
        let body = serde_json::to_value(ExecutionUpdate::processing(started)).unwrap();
        let object = body.as_object().unwrap();
        assert_eq!(object["status"], "processing");
        assert!(object.contains_key("started_at"));
        for absent in ["finished_at", "output_path", "file_size", "error_log", "otp", "expires_at"] {
            assert!(!object.contains_key(absent), "{absent} should be omitted");
        }
    }
}
