//! Retry policy: backoff for queue calls and encode failure classification
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use cinecore_config::EncodingConfig;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff for calls to the task queue and event bus
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,
    /// Cap for exponential backoff in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff (e.g., 2.0 for doubling)
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, initial_delay_ms: u64, max_delay_ms: u64, multiplier: f64) -> Self {
        Self {
            max_retries,
            initial_delay_ms,
            max_delay_ms,
            multiplier,
        }
    }

    /// No retries at all
    pub fn none() -> Self {
        Self::new(0, 0, 0, 1.0)
    }

    /// Get delay for a specific retry attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        // initial_delay * (multiplier ^ (attempt - 1))
        let delay_ms = (self.initial_delay_ms as f64) * self.multiplier.powi((attempt - 1) as i32);
        let delay_ms = delay_ms.min(self.max_delay_ms as f64) as u64;

        Duration::from_millis(delay_ms)
    }
}

/// Retry an async operation with exponential backoff. Errors for which
/// `retryable` returns false are returned at once.
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    config: &RetryConfig,
    operation: &str,
    retryable: R,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(operation = operation, attempt = attempt, "Succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if attempt < config.max_retries && retryable(&e) => {
                attempt += 1;
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    operation = operation,
                    attempt = attempt,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying with exponential backoff"
                );
                sleep(delay).await;
            }
            Err(e) => {
                warn!(
                    operation = operation,
                    attempts = attempt + 1,
                    error = %e,
                    "Operation failed, giving up"
                );
                return Err(e);
            }
        }
    }
}

/// Check if a transport error is worth another attempt
pub fn is_retryable_transport_error(message: &str) -> bool {
    let error_str = message.to_lowercase();

    if error_str.contains("invalid")
        || error_str.contains("malformed")
        || error_str.contains("serialization")
        || error_str.contains("not found")
    {
        return false;
    }

    error_str.contains("timeout")
        || error_str.contains("timed out")
        || error_str.contains("connection")
        || error_str.contains("disconnected")
        || error_str.contains("unavailable")
        || error_str.contains("no responders")
        || error_str.contains("broken pipe")
        || error_str.contains("publish")
}

/// Splits encoder failures into permanent and transient by matching known
/// signatures in the captured output.
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    signatures: Vec<String>,
}

impl FailureClassifier {
    pub fn new<I, S>(signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            signatures: signatures
                .into_iter()
                .map(|s| s.as_ref().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &EncodingConfig) -> Self {
        Self::new(&config.permanent_errors)
    }

    /// Case-insensitive substring match against any signature
    pub fn is_permanent(&self, output: &str) -> bool {
        let output = output.to_lowercase();
        self.signatures.iter().any(|sig| output.contains(sig.as_str()))
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue after this delay
    Retry(Duration),
    GiveUp,
}

/// Task-level retry rule for encodes
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub countdown: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &EncodingConfig) -> Self {
        Self {
            countdown: Duration::from_secs(config.retry_countdown_secs),
        }
    }

    pub fn decide(&self, permanent: bool, retries_remaining: u32) -> RetryDecision {
        if permanent || retries_remaining == 0 {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry(self.countdown)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_delays() {
        let config = RetryConfig::new(3, 1000, 60_000, 2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn test_retry_config_max_delay() {
        let config = RetryConfig::new(5, 1000, 10_000, 2.0);
        assert!(config.delay_for_attempt(10) <= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_retries() {
        let config = RetryConfig::new(3, 0, 10, 2.0);
        let mut attempts = 0;

        let result = retry_with_backoff(&config, "enqueue", |_: &String| true, || {
            attempts += 1;
            let current = attempts;
            async move {
                if current < 3 {
                    Err::<i32, String>("connection reset".to_string())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_fails_after_max_retries() {
        let config = RetryConfig::new(2, 0, 10, 2.0);
        let mut attempts = 0;

        let result = retry_with_backoff(&config, "enqueue", |_: &String| true, || {
            attempts += 1;
            async { Err::<i32, String>("persistent error".to_string()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 3); // initial + 2 retries
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_at_once() {
        let config = RetryConfig::new(5, 0, 10, 2.0);
        let mut attempts = 0;

        let result = retry_with_backoff(
            &config,
            "publish",
            |e: &String| is_retryable_transport_error(e),
            || {
                attempts += 1;
                async { Err::<(), String>("invalid subject".to_string()) }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_is_retryable_transport_error() {
        assert!(is_retryable_transport_error("Connection error: timed out"));
        assert!(is_retryable_transport_error("Publish error: no responders"));
        assert!(!is_retryable_transport_error("Serialization error: expected value"));
        assert!(!is_retryable_transport_error("invalid task"));
    }

    #[test]
    fn test_permanent_signatures() {
        let classifier = FailureClassifier::from_config(&EncodingConfig::default());
        assert!(classifier.is_permanent(
            "[mov,mp4] moov atom not found\nx.mp4: Invalid data found when processing input"
        ));
        assert!(classifier.is_permanent("OUTPUT FILE IS EMPTY, NOTHING WAS ENCODED"));
        assert!(!classifier.is_permanent("Conversion failed!"));
    }

    #[test]
    fn test_retry_policy() {
        let policy = RetryPolicy {
            countdown: Duration::from_secs(5),
        };
        assert_eq!(policy.decide(false, 1), RetryDecision::Retry(Duration::from_secs(5)));
        assert_eq!(policy.decide(true, 1), RetryDecision::GiveUp);
        assert_eq!(policy.decide(false, 0), RetryDecision::GiveUp);
    }
}
