use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::condition::DefinitionError;

/// Failure talking to a signal, rule or narrative store. Every variant is
/// transient: the caller may retry the whole run.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid playbook definition: {0}")]
    Validation(#[from] DefinitionError),

    #[error("transient store failure: {0}")]
    TransientStore(#[from] StoreError),

    #[error("narrative {0} not found")]
    NotFound(Uuid),

    #[error("unsupported export format `{0}`, use `markdown` or `json`")]
    UnsupportedFormat(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransientStore(_))
    }
}

/// Runs a store call under a deadline.
pub async fn bounded<T, F>(
    operation: &'static str,
    after: Duration,
    call: F,
) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(after, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout { operation, after }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounded_calls_surface_timeouts() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, StoreError>(1)
        };
        let err = bounded("list_signals", Duration::from_millis(10), slow)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Timeout { operation: "list_signals", .. }));
        assert!(EngineError::from(err).is_retryable());
    }

    #[tokio::test]
    async fn bounded_calls_pass_results_through() {
        let ready = async { Ok::<_, StoreError>(7) };
        let value = bounded("list_rules", Duration::from_secs(1), ready).await.unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn only_store_failures_are_retryable() {
        assert!(!EngineError::NotFound(Uuid::nil()).is_retryable());
        assert!(!EngineError::UnsupportedFormat("pdf".into()).is_retryable());
        assert!(EngineError::TransientStore(StoreError::Unavailable("down".into())).is_retryable());
    }
}
