use std::error::Error;
use std::fmt::{Debug, Write};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::event::{DeadLetterEntry, StreamEntry};

/// Marker trait for handler errors.
pub trait HandlerError: Error + Send + Sync + 'static {}

/// Processes entries of an origin stream.
///
/// Returning an error leaves the entry pending; it is retried once it has been
/// idle long enough to be reclaimed. Handlers must be idempotent.
#[async_trait]
pub trait EventHandler
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the handler.
    type Error: HandlerError;

    /// Handles one entry.
    async fn handle(&self, entry: StreamEntry) -> Result<(), Self::Error>;
}

/// Processes entries of the dead-letter stream (reprocessing or notification).
#[async_trait]
pub trait DeadLetterHandler
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the handler.
    type Error: HandlerError;

    /// Handles one dead letter.
    async fn handle(&self, entry: DeadLetterEntry) -> Result<(), Self::Error>;
}

/// Renders an error with its whole source chain.
pub(crate) fn describe(error: &(dyn Error + 'static)) -> String {
    let mut description = error.to_string();
    let mut source = error.source();

    while let Some(cause) = source {
        let _ = write!(description, ": {cause}");
        source = cause.source();
    }

    description
}

/// Runs a handler future, bounded by `timeout` when set.
pub(crate) async fn dispatch<F, E>(timeout: Option<Duration>, work: F) -> Result<(), String>
where
    F: Future<Output = Result<(), E>> + Send,
    E: HandlerError,
{
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => return Err(format!("handler timed out after {limit:?}")),
        },
        None => work.await,
    };

    result.map_err(|e| describe(&e))
}

#[cfg(test)]
mod tests {
    use super::*;

    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("connection refused")]
    struct Io;

    #[derive(Debug, Error)]
    #[error("could not charge card")]
    struct Charge(#[source] Io);

    impl HandlerError for Charge {}

    #[test]
    fn test_describe_walks_sources() {
        assert_eq!(
            describe(&Charge(Io)),
            "could not charge card: connection refused"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_times_out() {
        let result = dispatch(Some(Duration::from_secs(1)), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), Charge>(())
        })
        .await;

        assert_eq!(result, Err("handler timed out after 1s".to_string()));
    }

    #[tokio::test]
    async fn test_dispatch_reports_error() {
        let result = dispatch(None, async { Err::<(), _>(Charge(Io)) }).await;

        assert_eq!(
            result,
            Err("could not charge card: connection refused".to_string())
        );
    }
}
