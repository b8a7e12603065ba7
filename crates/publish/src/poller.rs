//! Completion poller for asynchronous server-side processing.
//!
//! State machine: `Uploaded -> Waiting -> {Complete, Error}`. Rounds are
//! spaced by [`Backoff`]; the whole wait is bounded by a timeout scaled to
//! the payload size.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::cancel::cancellable;
use crate::config::PollConfig;
use crate::error::PublishError;

/// Next action of a [`Backoff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    /// Sleep this long, then poll again.
    Wait(Duration),
    /// The total timeout elapsed.
    Expired,
}

/// Exponential delay schedule with a total deadline.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: PollConfig,
    delay: Duration,
    timeout: Duration,
    deadline: Instant,
}

impl Backoff {
    pub fn new(config: &PollConfig, payload_size: u64, now: Instant) -> Self {
        let timeout = config.total_timeout(payload_size);
        Self {
            config: config.clone(),
            delay: config.initial_delay(),
            timeout,
            deadline: now + timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Advances the schedule. The last wait is shortened to end exactly at
    /// the deadline.
    pub fn next(&mut self, now: Instant) -> BackoffStep {
        if now >= self.deadline {
            return BackoffStep::Expired;
        }
        let wait = self.delay.min(self.deadline - now);
        self.delay = self.config.next_delay(self.delay);
        BackoffStep::Wait(wait)
    }
}

/// Polls a check until it reports completion.
pub struct CompletionPoller<'a> {
    config: &'a PollConfig,
    cancel: &'a CancellationToken,
}

impl<'a> CompletionPoller<'a> {
    pub fn new(config: &'a PollConfig, cancel: &'a CancellationToken) -> Self {
        Self { config, cancel }
    }

    /// Calls `check` until it yields `Some`.
    ///
    /// The first check runs immediately. 400-class transport errors are
    /// retried until the timeout; any other error ends the wait.
    pub async fn wait<T, F, Fut>(
        &self,
        what: &str,
        payload_size: u64,
        mut check: F,
    ) -> Result<T, PublishError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, PublishError>>,
    {
        let mut backoff = Backoff::new(self.config, payload_size, Instant::now());
        let mut round = 0u32;

        loop {
            round += 1;
            match cancellable(self.cancel, check()).await {
                Ok(Some(value)) => {
                    debug!(what, round, "processing complete");
                    return Ok(value);
                }
                Ok(None) => trace!(what, round, "still processing"),
                Err(PublishError::Transport(e)) if e.is_client_error() => {
                    warn!(what, round, error = %e, "poll rejected, retrying");
                }
                Err(e) => return Err(e),
            }

            let BackoffStep::Wait(delay) = backoff.next(Instant::now()) else {
                return Err(PublishError::UploadTimeout {
                    what: what.to_string(),
                    waited: backoff.timeout(),
                });
            };
            cancellable(self.cancel, async {
                tokio::time::sleep(delay).await;
                Ok::<_, PublishError>(())
            })
            .await?;
        }
    }
}
