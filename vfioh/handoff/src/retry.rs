use std::fmt::Display;
use std::time::Duration;

use crate::clock::Clock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, the first one included.
    pub max_attempts: u32,
    pub backoff: Duration,
}

/// The error that ended a retried operation and how many attempts were made.
#[derive(Debug, PartialEq, Eq)]
pub struct RetryError<E> {
    pub error: E,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> RetryPolicy {
        RetryPolicy { max_attempts: max_attempts.max(1), backoff }
    }

    pub fn once() -> RetryPolicy {
        RetryPolicy::new(1, Duration::ZERO)
    }

    /// Runs `op` until it succeeds, fails with an error `is_transient` rejects,
    /// or the attempt bound is reached. Sleeps `backoff` between attempts.
    pub fn run<T, E, F, P>(&self, clock: &dyn Clock, mut op: F, is_transient: P)
                           -> Result<T, RetryError<E>>
        where F: FnMut() -> Result<T, E>, P: Fn(&E) -> bool, E: Display
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if !is_transient(&error) || attempt >= self.max_attempts {
                        return Err(RetryError { error, attempts: attempt });
                    }
                    warn!("{} (attempt {}/{}), retrying in {:?}", error, attempt, self.max_attempts,
                          self.backoff);
                    clock.sleep(self.backoff);
                    attempt += 1;
                }
            }
        }
    }
}
