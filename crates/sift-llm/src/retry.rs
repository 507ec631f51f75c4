//! Bounded retry with doubling delays, shared by the HTTP transport and
//! batch embedding.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::error::LlmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first (default: 3).
    pub attempts: u32,
    /// Delay before the second attempt; doubles after each failure (default: 500ms).
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failures`-th failed attempt (1-based).
    #[must_use]
    pub fn delay(&self, failures: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << failures.saturating_sub(1).min(16))
    }

    /// Drive `op` until it settles or the attempts run out.
    ///
    /// A [`Step::Retry`] carrying a wait overrides the computed delay.
    ///
    /// # Errors
    ///
    /// Returns the error of a [`Step::Fail`], or of the last retryable
    /// failure once every attempt is spent.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Step<T, E>>,
    {
        let mut failures = 0;
        loop {
            let (error, wait) = match op().await {
                Step::Done(value) => return Ok(value),
                Step::Fail(error) => return Err(error),
                Step::Retry { error, wait } => (error, wait),
            };
            failures += 1;
            if failures >= self.attempts.max(1) {
                return Err(error);
            }
            let delay = wait.unwrap_or_else(|| self.delay(failures));
            tracing::debug!(
                label,
                attempt = failures,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Result of one attempt under [`RetryPolicy::run`].
#[derive(Debug)]
pub enum Step<T, E> {
    Done(T),
    /// Give up immediately.
    Fail(E),
    Retry {
        error: E,
        /// Server-requested wait, if any.
        wait: Option<Duration>,
    },
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    let secs = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()?;
    Some(Duration::from_secs(secs))
}

/// Send a request under `policy`, retrying 429 responses only.
///
/// Any other response, successful or not, is handed back to the caller.
pub(crate) async fn send_with_retry<F, Fut>(
    policy: &RetryPolicy,
    provider: &str,
    mut send: F,
) -> Result<reqwest::Response, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    policy
        .run(provider, || {
            let sent = send();
            async move {
                match sent.await {
                    Err(e) => Step::Fail(LlmError::Http(e)),
                    Ok(response) if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                        tracing::warn!(provider, "rate limited");
                        Step::Retry {
                            wait: retry_after(&response),
                            error: LlmError::RateLimited,
                        }
                    }
                    Ok(response) => Step::Done(response),
                }
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn delay_doubles() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
    }

    #[test]
    fn huge_failure_counts_saturate() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(u32::MAX), policy.delay(17));
    }

    #[tokio::test]
    async fn stops_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = quick(3)
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Step::Retry {
                        error: "busy".to_owned(),
                        wait: None,
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap_err(), "busy");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fail_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = quick(5)
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Step::Fail("fatal") }
            })
            .await;
        assert_eq!(result.unwrap_err(), "fatal");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_attempts_still_tries_once() {
        let result: Result<u8, &str> = quick(0).run("test", || async { Step::Done(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    async fn get(attempts: u32, url: &str) -> Result<reqwest::Response, LlmError> {
        let client = reqwest::Client::new();
        send_with_retry(&quick(attempts), "test", || client.get(url).send()).await
    }

    #[tokio::test]
    async fn rate_limit_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let response = get(3, &format!("{}/flaky", server.uri())).await.unwrap();
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn persistent_rate_limit_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let result = get(3, &format!("{}/busy", server.uri())).await;
        assert!(
            matches!(result, Err(LlmError::RateLimited)),
            "expected RateLimited, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn server_errors_pass_through_untouched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let response = get(3, &format!("{}/boom", server.uri())).await.unwrap();
        assert_eq!(response.status(), 500);
    }
}
