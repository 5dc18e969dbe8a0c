use eventrail_broker::BrokerError;
use thiserror::Error;

/// Errors that can occur when talking to Redis.
#[derive(Debug, Error)]
pub enum Error {
    /// Error returned by the Redis client or server.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The server answered with a shape this client does not understand.
    #[error("unexpected reply to {command}: {reason}")]
    UnexpectedReply {
        /// The command that was sent.
        command: &'static str,
        /// What was wrong with the reply.
        reason: String,
    },
}

impl Error {
    /// Check if this error is potentially recoverable by retrying on a later poll.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            Self::UnexpectedReply { .. } => false,
        }
    }
}

impl BrokerError for Error {
    fn is_group_exists(&self) -> bool {
        matches!(self, Self::Redis(e) if e.code() == Some("BUSYGROUP"))
    }
}
