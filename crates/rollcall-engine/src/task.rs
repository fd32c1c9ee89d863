use crate::error::EngineError;
use std::time::Duration;

/// Run blocking work on the Tokio blocking pool, bounded by `limit`.
///
/// On timeout the work is abandoned, not cancelled: it keeps its thread
/// until it returns and its result is dropped.
pub(crate) async fn run_blocking<T, F>(
    what: &'static str,
    limit: Duration,
    f: F,
) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
{
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(EngineError::TaskFailed(format!("{what}: {join}"))),
        Err(_) => Err(EngineError::Timeout { what, limit }),
    }
}

/// Run short blocking storage work without a deadline.
pub(crate) async fn run_storage<T, F>(what: &'static str, f: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|join| EngineError::TaskFailed(format!("{what}: {join}")))?
}
