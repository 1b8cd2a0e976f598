// ── Backoff calculation ──
//
// Shared by the broker reconnect loop and the engine's retry policy.

use std::time::Duration;

/// Exponential backoff configuration for reconnection loops.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

/// `min(initial * 2^attempt, max)`, without jitter.
pub fn exponential_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
    initial.saturating_mul(factor).min(max)
}

/// Exponential backoff with jitter.
///
/// Jitter is +-25%, seeded from the attempt number so a single bridge
/// reconnecting repeatedly does not hammer the broker on a fixed beat.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let capped = exponential_delay(attempt, config.initial_delay, config.max_delay);
    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    Duration::from_secs_f64((capped.as_secs_f64() * jitter_factor).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_reconnect_config() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!(config.max_retries.is_none());
    }

    #[test]
    fn exponential_delay_doubles_then_caps() {
        let initial = Duration::from_secs(2);
        let max = Duration::from_secs(30);
        assert_eq!(exponential_delay(0, initial, max), Duration::from_secs(2));
        assert_eq!(exponential_delay(1, initial, max), Duration::from_secs(4));
        assert_eq!(exponential_delay(3, initial, max), Duration::from_secs(16));
        assert_eq!(exponential_delay(4, initial, max), max);
        assert_eq!(exponential_delay(40, initial, max), max);
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_retries: None,
        };

        let d10 = calculate_backoff(10, &config);
        assert!(
            d10 <= Duration::from_millis(12_500),
            "delay at attempt 10 ({d10:?}) should be capped near max_delay"
        );
    }
}
