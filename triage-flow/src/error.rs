use thiserror::Error;

/// Errors raised while executing a task graph
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Task execution failed: {0}")]
    TaskExecutionFailed(String),

    #[error("Context error: {0}")]
    ContextError(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Graph has no start task")]
    NoStartTask,

    #[error("Graph execution exceeded {0} steps")]
    StepLimitExceeded(usize),

    #[error("Graph execution cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, GraphError>;
