// Blocking HTTP plumbing shared by the Ollama and Pinecone clients


use anyhow::Result;
use std::time::Duration;
use tracing::{debug, error, warn};

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const EXPONENTIAL_BACKOFF_BASE: u32 = 2;

/// Build a `ureq` agent with a global timeout
#[inline]
pub fn agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .build()
        .into()
}

/// Build a `ureq` agent for responses read incrementally. Connecting and receiving the
/// response head are bounded by `timeout`; reading the body is not, so a long stream is
/// never cut while data keeps arriving.
#[inline]
pub fn streaming_agent(timeout: Duration) -> ureq::Agent {
    ureq::Agent::config_builder()
        .timeout_connect(Some(timeout))
        .timeout_recv_response(Some(timeout))
        .build()
        .into()
}

/// Retry schedule for idempotent requests: server and transport errors are retried with
/// exponential backoff, client errors fail immediately
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub retry_timeouts: bool,
}

impl Default for RetryPolicy {
    #[inline]
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            base_delay: Duration::from_secs(1),
            retry_timeouts: true,
        }
    }
}

impl RetryPolicy {
    #[inline]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    #[inline]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Whether a timed-out request is sent again. Requests whose cost grows with the
    /// work the server does (a long chat turn) should not be.
    #[inline]
    pub fn with_timeout_retries(mut self, retry_timeouts: bool) -> Self {
        self.retry_timeouts = retry_timeouts;
        self
    }

    /// Run `request_fn` until it succeeds, a non-retryable error occurs or the attempts
    /// are exhausted. `target` only labels log lines.
    #[inline]
    pub fn run<T, F>(&self, target: &str, mut request_fn: F) -> Result<T>
    where
        F: FnMut() -> Result<T, ureq::Error>,
    {
        let mut last_error = None;

        for attempt in 1..=self.attempts {
            debug!("HTTP request attempt {}/{} to {}", attempt, self.attempts, target);

            match request_fn() {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !self.should_retry(&error) {
                        warn!("Non-retryable error from {}: {}", target, error);
                        return Err(describe(error));
                    }

                    warn!(
                        "Request to {} failed: {}, attempt {}/{}",
                        target, error, attempt, self.attempts
                    );
                    last_error = Some(describe(error));

                    if attempt < self.attempts {
                        let delay = self.base_delay * EXPONENTIAL_BACKOFF_BASE.pow(attempt - 1);
                        debug!("Waiting {:?} before retry", delay);
                        std::thread::sleep(delay);
                    }
                }
            }
        }

        error!("All retry attempts failed for request to {}", target);
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Request failed after retries")))
    }

    fn should_retry(&self, error: &ureq::Error) -> bool {
        match error {
            ureq::Error::Timeout(_) => self.retry_timeouts,
            other => is_retryable(other),
        }
    }
}

/// Server errors and transport failures are worth another attempt
#[inline]
pub fn is_retryable(error: &ureq::Error) -> bool {
    match error {
        ureq::Error::StatusCode(status) => *status >= 500,
        ureq::Error::ConnectionFailed
        | ureq::Error::HostNotFound
        | ureq::Error::Timeout(_)
        | ureq::Error::Io(_) => true,
        _ => false,
    }
}

fn describe(error: ureq::Error) -> anyhow::Error {
    match error {
        ureq::Error::StatusCode(status) if status < 500 => {
            anyhow::anyhow!("Client error: HTTP {}", status)
        }
        ureq::Error::StatusCode(status) => anyhow::anyhow!("Server error: HTTP {}", status),
        other => anyhow::anyhow!("Request error: {}", other),
    }
}
