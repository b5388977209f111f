use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::UserId;

/// Exit code recorded when no real exit code could be obtained from the container.
pub const EXIT_CODE_UNAVAILABLE: i64 = -1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Success | ExecutionStatus::Failed)
    }

    /// Terminal status for a finished container: only an exact zero is a success.
    pub fn from_exit_code(exit_code: i64) -> Self {
        if exit_code == 0 {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
        }
    }
}

/// One run attempt of an executable.
///
/// `exit_code` and `finished_at` are set together by [`Execution::finish`] and
/// never otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub executable_id: String,
    pub user_id: UserId,
    pub status: ExecutionStatus,
    pub exit_code: Option<i64>,
    #[serde(with = "timestamp")]
    pub started_at: DateTime<Utc>,
    #[serde(default, with = "timestamp::optional")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn pending(id: String, executable_id: String, user_id: UserId) -> Self {
        Self {
            id,
            executable_id,
            user_id,
            status: ExecutionStatus::Pending,
            exit_code: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// `pending -> running`, stamping the start time. No-op from any other state.
    pub fn mark_running(&mut self, at: DateTime<Utc>) {
        if self.status == ExecutionStatus::Pending {
            self.status = ExecutionStatus::Running;
            self.started_at = at;
        }
    }

    /// Move to the terminal state derived from `exit_code`.
    ///
    /// Returns `false` and leaves the record untouched if it is already terminal.
    pub fn finish(&mut self, exit_code: i64, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = ExecutionStatus::from_exit_code(exit_code);
        self.exit_code = Some(exit_code);
        self.finished_at = Some(at);
        true
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: String,
    pub execution_id: String,
    pub stream: LogStream,
    pub content: String,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(execution_id: &str, stream: LogStream, content: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            stream,
            content,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionCreatedResponse {
    pub execution_id: String,
    pub status: ExecutionStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub stream: LogStream,
    pub content: String,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl From<LogEntry> for LogLine {
    fn from(entry: LogEntry) -> Self {
        Self {
            stream: entry.stream,
            content: entry.content,
            created_at: entry.created_at,
        }
    }
}

/// RFC 3339 text for timestamps on the wire and in the snapshot file.
pub(crate) mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    fn parse<E: serde::de::Error>(text: &str) -> Result<DateTime<Utc>, E> {
        DateTime::parse_from_rfc3339(text)
            .map(|at| at.with_timezone(&Utc))
            .map_err(|err| E::custom(format!("invalid timestamp '{}': {}", text, err)))
    }

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&at.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse(&text)
    }

    /// Same encoding; `None` is `null`.
    pub mod optional {
        use super::*;

        pub fn serialize<S: Serializer>(
            at: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match at {
                Some(at) => serializer.collect_str(&at.to_rfc3339()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(text) => parse(&text).map(Some),
                None => Ok(None),
            }
        }
    }
}
