//! Timeouts and bounded retry for external calls
//!
//! Every relay and engine call goes through [`timeout::with_timeout`]; signaling
//! reconnection goes through [`reconnect::ReconnectPolicy`], which builds on the
//! `backon` exponential backoff.

pub mod timeout {
    //! Timeout wrapper for external calls

    use std::future::Future;
    use std::time::Duration;

    use crate::error::{Error, Result};

    /// Await `fut` for at most `limit`, mapping expiry to [`Error::Timeout`]
    pub async fn with_timeout<T, E, F>(limit: Duration, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: Into<Error>,
    {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(Error::Timeout {
                operation: operation.to_string(),
            }),
        }
    }
}

pub mod reconnect {
    //! Bounded reconnection policy

    use std::future::Future;
    use std::time::Duration;

    use backon::{BackoffBuilder, ExponentialBuilder};
    use tracing::{debug, warn};

    use crate::config::ReconnectConfig;
    use crate::error::{Error, Result};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ReconnectPolicy {
        pub min_delay: Duration,
        pub max_delay: Duration,
        pub max_attempts: usize,
        pub window: Duration,
    }

    impl Default for ReconnectPolicy {
        fn default() -> Self {
            Self::from_config(&ReconnectConfig::default())
        }
    }

    impl ReconnectPolicy {
        #[must_use]
        pub const fn from_config(config: &ReconnectConfig) -> Self {
            Self {
                min_delay: Duration::from_millis(config.min_delay_ms),
                max_delay: Duration::from_millis(config.max_delay_ms),
                max_attempts: config.max_attempts,
                window: Duration::from_secs(config.window_seconds),
            }
        }

        /// Delay before each attempt; the first attempt is immediate
        fn delays(&self) -> impl Iterator<Item = Duration> {
            let backoff = ExponentialBuilder::default()
                .with_min_delay(self.min_delay)
                .with_max_delay(self.max_delay)
                .with_max_times(self.max_attempts)
                .with_jitter()
                .build();
            std::iter::once(Duration::ZERO).chain(backoff)
        }

        /// Run `attempt` until it succeeds, fails unrecoverably, runs out of
        /// attempts, or the window closes.
        pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T>
        where
            F: FnMut(usize) -> Fut,
            Fut: Future<Output = Result<T>>,
        {
            let attempts = async {
                let mut last_err = None;
                for (n, delay) in self.delays().enumerate() {
                    if delay > Duration::ZERO {
                        debug!(operation, attempt = n + 1, delay_ms = delay.as_millis() as u64, "Backing off");
                        tokio::time::sleep(delay).await;
                    }

                    match attempt(n + 1).await {
                        Ok(value) => return Ok(value),
                        Err(e) if e.is_recoverable() => {
                            warn!(operation, attempt = n + 1, error = %e, "Attempt failed, will retry");
                            last_err = Some(e);
                        }
                        Err(e) => return Err(e),
                    }
                }

                Err(Error::Transport(format!(
                    "{operation}: retries exhausted ({})",
                    last_err.map_or_else(|| "no attempt made".to_string(), |e| e.to_string())
                )))
            };

            tokio::time::timeout(self.window, attempts)
                .await
                .unwrap_or_else(|_| {
                    Err(Error::Transport(format!(
                        "{operation}: not completed within {}s",
                        self.window.as_secs()
                    )))
                })
        }
    }
}
