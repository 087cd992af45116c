use std::future::Future;
use std::time::Duration;

use rpl_core::PipelineError;

/// Treat a step as one atomic blocking unit with a bounded duration.
/// Exceeding the limit is a failure of the step.
pub async fn within<T, F>(step: &str, limit: Duration, fut: F) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, PipelineError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(PipelineError::Timeout {
            step: step.to_string(),
            secs: limit.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passes_through_results() {
        let ok = within("build", Duration::from_secs(1), async { Ok::<_, PipelineError>(7) }).await;
        assert_eq!(ok, Ok(7));
        let err = within("build", Duration::from_secs(1), async {
            Err::<(), _>(PipelineError::Build("javac".into()))
        })
        .await;
        assert_eq!(err, Err(PipelineError::Build("javac".into())));
    }

    #[tokio::test]
    async fn elapsed_becomes_timeout_error() {
        let res = within("scan", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, PipelineError>(())
        })
        .await;
        assert!(matches!(res, Err(PipelineError::Timeout { ref step, .. }) if step == "scan"));
    }
}
