use crate::{cron::CronError, job::JobStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkhorseError {
    #[error("Store unavailable: {message}")]
    StoreUnavailable { message: String },

    #[error("Store error: {message}")]
    Store { message: String },

    #[error("Queue {queue} unavailable: {message}")]
    QueueUnavailable { queue: String, message: String },

    #[error("Job id already exists: {id}")]
    DuplicateJobId { id: String },

    #[error("Job not found: {id}")]
    NotFound { id: String },

    #[error("Invalid interval: {message}")]
    InvalidInterval { message: String },

    #[error("Invalid job options: {message}")]
    InvalidOptions { message: String },

    #[error("No handler registered for function: {name}")]
    UnknownFunction { name: String },

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Cron error: {0}")]
    Cron(#[from] CronError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Worker error: {message}")]
    Worker { message: String },

    #[error("Metrics error: {message}")]
    Metrics { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl WorkhorseError {
    /// True when the error came from the backing store being unreachable,
    /// which loops treat as transient and retry on their next iteration.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            WorkhorseError::StoreUnavailable { .. } | WorkhorseError::QueueUnavailable { .. }
        )
    }
}

impl From<toml::de::Error> for WorkhorseError {
    fn from(err: toml::de::Error) -> Self {
        WorkhorseError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for WorkhorseError {
    fn from(err: toml::ser::Error) -> Self {
        WorkhorseError::Config(format!("TOML serialization error: {}", err))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for WorkhorseError {
    fn from(err: redis::RedisError) -> Self {
        if err.kind() == redis::ErrorKind::TypeError
            || err.kind() == redis::ErrorKind::ResponseError
        {
            WorkhorseError::Store {
                message: err.to_string(),
            }
        } else {
            WorkhorseError::StoreUnavailable {
                message: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let not_found = WorkhorseError::NotFound {
            id: "abc123".to_string(),
        };
        assert_eq!(not_found.to_string(), "Job not found: abc123");

        let duplicate = WorkhorseError::DuplicateJobId {
            id: "cron-nightly".to_string(),
        };
        assert_eq!(duplicate.to_string(), "Job id already exists: cron-nightly");

        let transition = WorkhorseError::InvalidTransition {
            id: "j1".to_string(),
            from: JobStatus::Finished,
            to: JobStatus::Queued,
        };
        assert_eq!(
            transition.to_string(),
            "Job j1 cannot move from finished to queued"
        );
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json");
        assert!(json_error.is_err());

        let error: WorkhorseError = json_error.unwrap_err().into();
        assert!(matches!(error, WorkhorseError::Serialization(_)));
    }

    #[test]
    fn test_unavailable_classification() {
        let store = WorkhorseError::StoreUnavailable {
            message: "connection refused".to_string(),
        };
        assert!(store.is_unavailable());

        let queue = WorkhorseError::QueueUnavailable {
            queue: "default".to_string(),
            message: "connection refused".to_string(),
        };
        assert!(queue.is_unavailable());

        let config = WorkhorseError::Config("bad".to_string());
        assert!(!config.is_unavailable());
    }

    #[test]
    fn test_error_from_toml() {
        let toml_error = toml::from_str::<toml::Value>("key = ").unwrap_err();
        let error: WorkhorseError = toml_error.into();
        assert!(matches!(error, WorkhorseError::Config(msg) if msg.contains("TOML")));
    }
}
