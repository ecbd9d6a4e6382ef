use chrono::Duration;

/// Longest duration accepted from configuration, keeps timestamp arithmetic in range.
const MAX_CONFIGURED_SECONDS: i64 = 10 * 365 * 24 * 60 * 60;

/// Convert configured seconds to a chrono duration, saturating at ten years.
pub fn seconds(secs: u64) -> Duration {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX).min(MAX_CONFIGURED_SECONDS);
    Duration::seconds(secs)
}

pub fn milliseconds(millis: u64) -> std::time::Duration {
    std::time::Duration::from_millis(millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_saturates() {
        assert_eq!(seconds(60), Duration::seconds(60));
        assert_eq!(seconds(u64::MAX), Duration::seconds(MAX_CONFIGURED_SECONDS));
    }
}
