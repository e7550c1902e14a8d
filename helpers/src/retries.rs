use std::time::Duration;

/// Calculate the wait time for a connect retry attempt.
/// This uses plain exponential backoff doubling from `base_delay`,
/// so attempt 0 waits `base_delay`, attempt 1 waits twice that, and so on.
pub fn connect_retry_delay(base_delay: Duration, retry_attempt: u32) -> Duration {
    base_delay * 2u32.saturating_pow(retry_attempt)
}

/// Produce the full backoff schedule for `attempts` connect retries.
pub fn connect_retry_schedule(base_delay: Duration, attempts: u32) -> Vec<Duration> {
    (0..attempts)
        .map(|attempt| connect_retry_delay(base_delay, attempt))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test_log::test]
    fn test_connect_retry_schedule_doubles_from_base() {
        let schedule = connect_retry_schedule(Duration::from_millis(100), 5);
        assert_eq!(
            schedule,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(1600),
            ]
        );
    }
}
