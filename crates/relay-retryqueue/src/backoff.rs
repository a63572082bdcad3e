/// Base delay for the first retry, in seconds.
pub const BASE_SECS: u64 = 30;

/// Exponential backoff delay for a row that has just made its `attempts`-th
/// attempt: `base * 2^(attempts - 1)`. `attempts` is expected to be >= 1.
pub fn backoff_secs(attempts: u32) -> u64 {
    BASE_SECS.saturating_mul(1u64 << attempts.saturating_sub(1).min(32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_waits_the_base_delay() {
        assert_eq!(backoff_secs(1), 30);
    }

    #[test]
    fn delay_doubles_each_attempt() {
        assert_eq!(backoff_secs(2), 60);
        assert_eq!(backoff_secs(3), 120);
        assert_eq!(backoff_secs(4), 240);
    }
}
