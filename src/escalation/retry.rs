use std::time::Duration;

use tracing::warn;

use crate::settings::AiConfig;

/// Why one attempt failed; decides how long to wait before the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    /// Timeout, connection failure or non-2xx status.
    Http(String),
    /// Anything else, e.g. an undecodable body.
    Other(String),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http(msg) => write!(f, "http: {msg}"),
            Self::Other(msg) => write!(f, "{msg}"),
        }
    }
}

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub http_delay: Duration,
    pub other_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&AiConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &AiConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            http_delay: Duration::from_secs(config.http_retry_delay_secs),
            other_delay: Duration::from_secs(config.other_retry_delay_secs),
        }
    }

    pub fn delay_for(&self, err: &AttemptError) -> Duration {
        match err {
            AttemptError::Http(_) => self.http_delay,
            AttemptError::Other(_) => self.other_delay,
        }
    }

    /// Run `op` until it succeeds or the attempts are used up. `op` receives
    /// the 1-based attempt number. No sleep follows the final failure.
    pub fn run<T, F>(&self, sleeper: &dyn Sleeper, operation: &str, mut op: F) -> Result<T, AttemptError>
    where
        F: FnMut(u32) -> Result<T, AttemptError>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= self.max_attempts => {
                    warn!(operation, attempt, error = %err, "giving up");
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.delay_for(&err);
                    warn!(operation, attempt, error = %err, delay_secs = delay.as_secs(), "attempt failed, retrying");
                    sleeper.sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct RecordingSleeper {
        pub slept: Mutex<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }
}
