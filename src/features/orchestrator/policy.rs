//! Retry, budget and cancellation policy for orchestration runs.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::{BackoffStrategy, Config};

/// Upper bound for exponential backoff
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Delay before retrying the same model after a transient failure
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffPolicy {
    Fixed(Duration),
    Exponential { base: Duration, max: Duration },
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (1-based) on one model
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed(delay) => delay,
            BackoffPolicy::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(retry.saturating_sub(1));
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorPolicy {
    /// Transient failures tolerated on one model before switching
    pub max_retries: u32,
    /// Generation calls allowed across the whole run
    pub max_total_attempts: u32,
    pub backoff: BackoffPolicy,
    pub staging_directory: PathBuf,
    pub save_failed_generations: bool,
    pub failed_output_directory: PathBuf,
}

impl OrchestratorPolicy {
    pub fn from_config(config: &Config) -> Self {
        let backoff = match config.retry_backoff {
            BackoffStrategy::Fixed => BackoffPolicy::Fixed(config.retry_delay()),
            BackoffStrategy::Exponential => BackoffPolicy::Exponential {
                base: config.retry_delay(),
                max: MAX_BACKOFF,
            },
        };

        Self {
            max_retries: config.max_retries,
            max_total_attempts: config.max_total_attempts,
            backoff,
            staging_directory: config.staging_directory.clone(),
            save_failed_generations: config.save_failed_generations,
            failed_output_directory: config.failed_output_directory.clone(),
        }
    }
}

/// Shared cancellation flag, honoured between attempts
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag so the next run can proceed
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff_is_flat() {
        let policy = BackoffPolicy::Fixed(Duration::from_secs(5));
        assert_eq!(policy.delay(1), Duration::from_secs(5));
        assert_eq!(policy.delay(4), Duration::from_secs(5));
    }

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::Exponential {
            base: Duration::from_secs(2),
            max: Duration::from_secs(10),
        };
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(4), Duration::from_secs(10));
        assert_eq!(policy.delay(40), Duration::from_secs(10));
    }

    #[test]
    fn test_policy_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::core::config::test_config(dir.path());
        config.retry_delay_seconds = 3;
        config.retry_backoff = BackoffStrategy::Exponential;

        let policy = OrchestratorPolicy::from_config(&config);
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.max_total_attempts, 6);
        assert_eq!(policy.backoff.delay(2), Duration::from_secs(6));
    }

    #[test]
    fn test_cancel_handle_is_shared() {
        let handle = CancelHandle::new();
        let clone = handle.clone();
        clone.cancel();
        assert!(handle.is_cancelled());
        handle.reset();
        assert!(!clone.is_cancelled());
    }
}
