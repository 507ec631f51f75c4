//! Shared HTTP client construction.

use std::time::Duration;

use crate::error::LlmError;

/// Build an HTTP client whose per-request timeout is `timeout`.
///
/// Config: 10s connect timeout, rustls TLS, `sift/{version}` user-agent,
/// redirect limit 10.
///
/// # Errors
///
/// Returns `LlmError::Http` if the TLS backend cannot be initialized.
pub fn client_with_timeout(timeout: Duration) -> Result<reqwest::Client, LlmError> {
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10).min(timeout))
        .timeout(timeout)
        .user_agent(concat!("sift/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()?;
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_client_with_short_timeout() {
        assert!(client_with_timeout(Duration::from_secs(1)).is_ok());
    }
}
