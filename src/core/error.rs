use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    PipelineNotFound,
    PipelineAlreadyExists,
    PackageNotFound,
    EnvNotFound,
    EnvAlreadyExists,
    NodeNotFound,
    HostfileNotFound,
    GraphNotFound,

    StateInvalid,
    HostUnreachable,
    OpPartialFailure,
    RecordParseError,

    ValidationInvalidArgument,

    InternalIoError,
    InternalUnexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::PipelineNotFound => "pipeline.not_found",
            ErrorCode::PipelineAlreadyExists => "pipeline.already_exists",
            ErrorCode::PackageNotFound => "package.not_found",
            ErrorCode::EnvNotFound => "env.not_found",
            ErrorCode::EnvAlreadyExists => "env.already_exists",
            ErrorCode::NodeNotFound => "node.not_found",
            ErrorCode::HostfileNotFound => "hostfile.not_found",
            ErrorCode::GraphNotFound => "graph.not_found",

            ErrorCode::StateInvalid => "state.invalid",
            ErrorCode::HostUnreachable => "host.unreachable",
            ErrorCode::OpPartialFailure => "op.partial_failure",
            ErrorCode::RecordParseError => "record.parse_error",

            ErrorCode::ValidationInvalidArgument => "validation.invalid_argument",

            ErrorCode::InternalIoError => "internal.io_error",
            ErrorCode::InternalUnexpected => "internal.unexpected",
        }
    }

    /// Structural errors abort an operation outright; everything else is
    /// aggregated into per-host result tables.
    pub fn is_structural(&self) -> bool {
        !matches!(
            self,
            ErrorCode::HostUnreachable | ErrorCode::OpPartialFailure
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotFoundDetails {
    pub id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidArgumentDetails {
    pub field: String,
    pub problem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tried: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidStateDetails {
    pub entity: String,
    pub current: String,
    pub operation: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreachableDetails {
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub hints: Vec<Hint>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            hints: Vec::new(),
        }
    }

    pub fn with_hint(mut self, message: impl Into<String>) -> Self {
        self.hints.push(Hint {
            message: message.into(),
        });
        self
    }

    fn not_found(code: ErrorCode, message: &str, id: impl Into<String>) -> Self {
        let details = serde_json::to_value(NotFoundDetails { id: id.into() })
            .unwrap_or_else(|_| Value::Object(serde_json::Map::new()));
        Self::new(code, message, details)
    }

    pub fn pipeline_not_found(id: impl Into<String>) -> Self {
        Self::not_found(ErrorCode::PipelineNotFound, "Pipeline not found", id)
            .with_hint("Run 'convoy ppl list' to see available pipelines")
    }

    pub fn pipeline_already_exists(id: impl Into<String>) -> Self {
        let id = id.into();
        let details = serde_json::to_value(NotFoundDetails { id: id.clone() })
            .unwrap_or_else(|_| Value::Object(serde_json::Map::new()));
        Self::new(
            ErrorCode::PipelineAlreadyExists,
            format!("Pipeline '{}' already exists", id),
            details,
        )
    }

    pub fn package_not_found(id: impl Into<String>) -> Self {
        Self::not_found(ErrorCode::PackageNotFound, "Package not found", id)
    }

    pub fn env_not_found(id: impl Into<String>) -> Self {
        Self::not_found(ErrorCode::EnvNotFound, "Environment not found", id)
            .with_hint("Run 'convoy env list' to see available environments")
    }

    pub fn module_not_found(id: impl Into<String>) -> Self {
        Self::not_found(ErrorCode::EnvNotFound, "Module not found", id)
            .with_hint("Module files live under the 'modules' config directory")
    }

    pub fn env_already_exists(id: impl Into<String>) -> Self {
        let id = id.into();
        let details = serde_json::to_value(NotFoundDetails { id: id.clone() })
            .unwrap_or_else(|_| Value::Object(serde_json::Map::new()));
        Self::new(
            ErrorCode::EnvAlreadyExists,
            format!("Environment '{}' already exists", id),
            details,
        )
        .with_hint("Pass --overwrite to replace it")
    }

    pub fn node_not_found(hostname: impl Into<String>) -> Self {
        Self::not_found(ErrorCode::NodeNotFound, "Node not found in graph", hostname)
    }

    pub fn hostfile_not_found(path: impl Into<String>) -> Self {
        Self::not_found(ErrorCode::HostfileNotFound, "Hostfile not found", path)
    }

    pub fn graph_not_found(path: impl Into<String>) -> Self {
        Self::not_found(ErrorCode::GraphNotFound, "Resource graph not found", path)
            .with_hint("Run 'convoy rg build' to discover the cluster")
    }

    pub fn invalid_state(
        entity: impl Into<String>,
        current: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        let details = InvalidStateDetails {
            entity: entity.into(),
            current: current.into(),
            operation: operation.into(),
        };
        let message = format!(
            "Operation '{}' is not legal while '{}' is {}",
            details.operation, details.entity, details.current
        );
        let details = serde_json::to_value(details)
            .unwrap_or_else(|_| Value::Object(serde_json::Map::new()));
        Self::new(ErrorCode::StateInvalid, message, details)
    }

    pub fn unreachable(host: impl Into<String>, stderr: Option<String>) -> Self {
        let host = host.into();
        let details = serde_json::to_value(UnreachableDetails {
            host: host.clone(),
            stderr,
        })
        .unwrap_or_else(|_| Value::Object(serde_json::Map::new()));
        Self::new(
            ErrorCode::HostUnreachable,
            format!("Host '{}' did not respond", host),
            details,
        )
    }

    pub fn partial_failure(failed: usize, total: usize) -> Self {
        Self::new(
            ErrorCode::OpPartialFailure,
            format!("{} of {} operations failed", failed, total),
            serde_json::json!({ "failed": failed, "total": total }),
        )
    }

    pub fn parse_error(path: impl Into<String>, problem: impl Into<String>) -> Self {
        let path = path.into();
        let problem = problem.into();
        Self::new(
            ErrorCode::RecordParseError,
            format!("Malformed record at {}: {}", path, problem),
            serde_json::json!({ "path": path, "problem": problem }),
        )
    }

    pub fn validation_invalid_argument(
        field: impl Into<String>,
        problem: impl Into<String>,
        id: Option<String>,
        tried: Option<Vec<String>>,
    ) -> Self {
        let details = serde_json::to_value(InvalidArgumentDetails {
            field: field.into(),
            problem: problem.into(),
            id,
            tried,
        })
        .unwrap_or_else(|_| Value::Object(serde_json::Map::new()));

        Self::new(
            ErrorCode::ValidationInvalidArgument,
            "Invalid argument",
            details,
        )
    }

    pub fn internal_io(error: impl Into<String>, context: Option<String>) -> Self {
        Self::new(
            ErrorCode::InternalIoError,
            "I/O error",
            serde_json::json!({ "error": error.into(), "context": context }),
        )
    }

    pub fn internal_unexpected(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InternalUnexpected,
            message,
            Value::Object(serde_json::Map::new()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_render_stable_strings() {
        assert_eq!(ErrorCode::PipelineNotFound.as_str(), "pipeline.not_found");
        assert_eq!(ErrorCode::StateInvalid.as_str(), "state.invalid");
        assert_eq!(ErrorCode::OpPartialFailure.as_str(), "op.partial_failure");
    }

    #[test]
    fn invalid_state_message_names_operation_and_state() {
        let err = Error::invalid_state("pkgA", "running", "clean");
        assert_eq!(err.code, ErrorCode::StateInvalid);
        assert!(err.message.contains("clean"));
        assert!(err.message.contains("running"));
    }

    #[test]
    fn partial_failure_is_not_structural() {
        assert!(!ErrorCode::OpPartialFailure.is_structural());
        assert!(!ErrorCode::HostUnreachable.is_structural());
        assert!(ErrorCode::PipelineNotFound.is_structural());
        assert!(ErrorCode::RecordParseError.is_structural());
    }
}
