use thiserror::Error;

/// Unified error type for the task guard, logger, reset workflow and stores
#[derive(Debug, Error)]
pub enum GuardError {
    /// Another conflicting task is active for the same project
    #[error("Project {project_id} is locked by task {holder}")]
    Lock { project_id: String, holder: String },

    /// Task or project record is absent
    #[error("Unknown {entity}: {id}")]
    NotFound { entity: String, id: String },

    /// Failure raised by an external collaborator (reset command, job body)
    #[error("Execution failed in {component}: {message}")]
    Execution {
        component: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A lifecycle hook returned an error
    #[error("Hook {event} failed: {message}")]
    Hook { event: String, message: String },

    /// Database/persistence errors
    #[error("Database operation failed: {operation}")]
    Database {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// The task exists but its log file cannot be read
    #[error("no log found {path}")]
    LogNotFound { path: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl GuardError {
    pub fn lock<P: Into<String>, H: Into<String>>(project_id: P, holder: H) -> Self {
        Self::Lock {
            project_id: project_id.into(),
            holder: holder.into(),
        }
    }

    pub fn not_found<E: Into<String>, I: Into<String>>(entity: E, id: I) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Create an execution error without an underlying source
    pub fn execution<C: Into<String>, M: Into<String>>(component: C, message: M) -> Self {
        Self::Execution {
            component: component.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Wrap a collaborator failure, keeping the original error as source
    pub fn execution_from_anyhow<C: Into<String>>(component: C, err: anyhow::Error) -> Self {
        Self::Execution {
            component: component.into(),
            message: format!("{:#}", err),
            source: Some(err.into()),
        }
    }

    pub fn hook<E: Into<String>, M: Into<String>>(event: E, message: M) -> Self {
        Self::Hook {
            event: event.into(),
            message: message.into(),
        }
    }

    pub fn database<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        operation: S,
        source: E,
    ) -> Self {
        Self::Database {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn log_not_found<S: Into<String>>(path: S) -> Self {
        Self::LogNotFound { path: path.into() }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Lock contention, as opposed to every other failure
    pub fn is_lock(&self) -> bool {
        matches!(self, Self::Lock { .. })
    }

    /// Whether the job queue may retry the operation that produced this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Execution { .. } | Self::Database { .. } | Self::Io { .. } => true,
            Self::Hook { .. } => true,
            Self::Lock { .. } | Self::NotFound { .. } | Self::LogNotFound { .. } => false,
            Self::Configuration { .. } | Self::Serialization { .. } => false,
            Self::Internal { .. } => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Lock { .. } => "lock",
            Self::NotFound { .. } => "not_found",
            Self::Execution { .. } => "execution",
            Self::Hook { .. } => "hook",
            Self::Database { .. } => "database",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::Configuration { .. } => "configuration",
            Self::LogNotFound { .. } => "log_not_found",
            Self::Internal { .. } => "internal",
        }
    }

    /// Status code an HTTP layer should answer with
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound { .. } | Self::LogNotFound { .. } => 404,
            Self::Configuration { .. } => 400,
            Self::Lock { .. } => 409,
            _ => 500,
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, GuardError>;

impl From<std::io::Error> for GuardError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for GuardError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for GuardError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<bincode::Error> for GuardError {
    fn from(err: bincode::Error) -> Self {
        Self::serialization("bincode", err)
    }
}

impl From<sled::Error> for GuardError {
    fn from(err: sled::Error) -> Self {
        Self::database("sled_operation", err)
    }
}

impl From<anyhow::Error> for GuardError {
    fn from(err: anyhow::Error) -> Self {
        Self::execution_from_anyhow("anyhow", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_distinguishable() {
        let err = GuardError::lock("p1", "t1");
        assert!(err.is_lock());
        assert!(!err.is_recoverable());
        assert_eq!(err.category(), "lock");
        assert!(err.to_string().contains("t1"));

        let exec = GuardError::execution("reset", "boom");
        assert!(!exec.is_lock());
        assert!(exec.is_recoverable());
    }

    #[test]
    fn test_http_status() {
        assert_eq!(GuardError::not_found("task", "1").http_status(), 404);
        assert_eq!(GuardError::log_not_found("/tmp/x.log").http_status(), 404);
        assert_eq!(GuardError::configuration("bad").http_status(), 400);
        assert_eq!(GuardError::internal("oops").http_status(), 500);
    }

    #[test]
    fn test_anyhow_source_is_kept() {
        use std::error::Error as _;

        let err = GuardError::execution_from_anyhow("reset", anyhow::anyhow!("disk full"));
        assert!(err.to_string().contains("disk full"));
        assert!(err.source().is_some());
    }
}
