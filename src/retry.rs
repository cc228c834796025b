//! Bounded retry loops.

/// Result of one attempt
pub(crate) enum Attempt<T, Err> {
    Done(T),
    Retry(Err),
}

/// Run `f` until it completes, at most `limit` times (at least once).
///
/// Hard errors from `f` return immediately, the last retryable error is
/// returned once the limit is reached. `f` receives the 1-based attempt number.
pub(crate) fn bounded<T, Err, F>(limit: u32, mut f: F) -> Result<T, Err>
where
    F: FnMut(u32) -> Result<Attempt<T, Err>, Err>,
{
    let mut attempt = 1;

    loop {
        match f(attempt)? {
            Attempt::Done(v) => return Ok(v),
            Attempt::Retry(e) if attempt >= limit => return Err(e),
            Attempt::Retry(_) => {
                attempt += 1;
            }
        }
    }
}

/// Exponential backoff for attempt `n` (1-based), capped at one second
pub(crate) fn backoff_ms(base_ms: u32, attempt: u32) -> u32 {
    let shift = attempt.saturating_sub(1).min(16);
    base_ms.saturating_mul(1 << shift).min(1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn succeeds_on_last_attempt() {
        let r: Result<u32, &str> = bounded(3, |n| {
            if n < 3 {
                Ok(Attempt::Retry("again"))
            } else {
                Ok(Attempt::Done(n))
            }
        });
        assert_eq!(r, Ok(3));
    }

    #[test]
    fn gives_up_after_limit() {
        let mut calls = 0;
        let r: Result<(), u32> = bounded(4, |n| {
            calls += 1;
            Ok(Attempt::Retry(n))
        });
        assert_eq!(r, Err(4));
        assert_eq!(calls, 4);
    }

    #[test]
    fn hard_errors_stop_immediately() {
        let mut calls = 0;
        let r: Result<(), &str> = bounded(5, |_| {
            calls += 1;
            Err("fatal")
        });
        assert_eq!(r, Err("fatal"));
        assert_eq!(calls, 1);
    }

    #[test]
    fn zero_limit_still_runs_once() {
        let r: Result<(), &str> = bounded(0, |_| Ok(Attempt::Retry("no")));
        assert_eq!(r, Err("no"));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_ms(10, 1), 10);
        assert_eq!(backoff_ms(10, 3), 40);
        assert_eq!(backoff_ms(10, 30), 1000);
    }
}
