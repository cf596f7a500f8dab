use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::BackoffConfig;

/// Exponential backoff between push attempts for one batch.
///
/// Delays start at `min_period` and double up to `max_period`. Waiting is cut
/// short when the token is cancelled, after which the backoff is no longer
/// ongoing.
pub struct Backoff {
    config: BackoffConfig,
    num_retries: usize,
    next_delay: Duration,
    cancel: CancellationToken,
}

impl Backoff {
    pub fn new(config: BackoffConfig, cancel: CancellationToken) -> Self {
        Self {
            config,
            num_retries: 0,
            next_delay: config.min_period,
            cancel,
        }
    }

    /// Whether another attempt is allowed.
    pub fn ongoing(&self) -> bool {
        !self.cancel.is_cancelled()
            && (self.config.max_retries == 0 || self.num_retries < self.config.max_retries)
    }

    pub fn num_retries(&self) -> usize {
        self.num_retries
    }

    /// Delay the next [`Backoff::wait`] will use, counting it as a retry.
    pub fn next_delay(&mut self) -> Duration {
        self.num_retries += 1;
        let delay = self.next_delay.min(self.config.max_period);
        self.next_delay = (self.next_delay * 2).min(self.config.max_period);
        delay
    }

    /// Sleeps for the next delay unless retries are exhausted or cancelled.
    pub async fn wait(&mut self) {
        let delay = self.next_delay();
        if !self.ongoing() {
            return;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
