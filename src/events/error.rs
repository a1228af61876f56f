//! Event engine error types
//!
//! Defines all errors that can surface from the queue registry and the
//! engine task.

use thiserror::Error;

/// Errors that can occur in the event engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The queue id does not exist (never allocated, or already collected)
    #[error("Bad event queue id: {0}")]
    QueueNotFound(String),

    /// The caller does not own the queue
    #[error("User {user_id} is not authorized for queue {queue_id}")]
    Unauthorized { user_id: u64, queue_id: String },

    /// A fetch without a queue id must also ask for a non-blocking answer
    #[error("Missing 'queue_id' argument")]
    MissingQueueId,

    /// The client acknowledged an id older than something already pruned
    #[error("An event newer than {0} has already been pruned!")]
    AlreadyPruned(i64),

    /// The client acknowledged an id that was never in the queue
    #[error("Event {0} was not in this queue")]
    EventNotInQueue(i64),

    /// A producer notice did not have the expected shape
    #[error("Invalid notice: {0}")]
    InvalidNotice(String),

    /// The snapshot could not be written
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The engine task has stopped and no longer accepts commands
    #[error("Event engine is shut down")]
    Shutdown,
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::QueueNotFound("1700000000:4".to_string());
        assert_eq!(err.to_string(), "Bad event queue id: 1700000000:4");

        let err = EngineError::Unauthorized {
            user_id: 7,
            queue_id: "1:1".to_string(),
        };
        assert_eq!(err.to_string(), "User 7 is not authorized for queue 1:1");

        assert_eq!(
            EngineError::AlreadyPruned(-1).to_string(),
            "An event newer than -1 has already been pruned!"
        );
    }
}
