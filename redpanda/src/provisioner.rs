//! Startup topic provisioning with bounded retry.
//!
//! The pipeline's topic must exist before the producer or consumer begin
//! normal operation. [`TopicProvisioner::ensure_topic`] creates it
//! idempotently, retrying at a fixed interval while the broker is still
//! unreachable (typical during container orchestration startup) and
//! giving up after a fixed attempt count.
//!
//! A topic that already exists is success, not failure. Exhausting the
//! retry bound is reported to the caller; whether that is fatal is the
//! process boundary's decision (the edge treats it as fatal at startup,
//! the worker logs and continues).

use catalog_core::config::{PipelineConfig, ProvisioningPolicy};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Errors from topic provisioning.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// The broker stayed unreachable for the whole retry budget.
    #[error("broker unreachable after {attempts} attempts: {reason}")]
    Exhausted {
        /// Attempts made before giving up.
        attempts: u32,
        /// The last connection failure.
        reason: String,
    },
}

/// Idempotently ensures the command topic exists before startup proceeds.
pub struct TopicProvisioner {
    brokers: String,
    partitions: i32,
    replication_factor: i32,
    policy: ProvisioningPolicy,
}

impl TopicProvisioner {
    /// Create a provisioner from pipeline configuration.
    #[must_use]
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            brokers: config.brokers.clone(),
            partitions: config.partitions,
            replication_factor: config.replication_factor,
            policy: config.provisioning,
        }
    }

    /// Ensure `topic` exists, retrying connection failures up to the
    /// configured bound.
    ///
    /// A per-topic "already exists" result is success. Any other creation
    /// failure reported by the broker is logged and treated as non-fatal:
    /// the broker answered, so startup proceeds.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Exhausted`] if the broker could not be
    /// reached within the attempt budget.
    pub async fn ensure_topic(&self, topic: &str) -> Result<(), ProvisionError> {
        let attempts = provision_with_retry(self.policy, |attempt| {
            let topic = topic.to_string();
            async move { self.try_create(&topic, attempt).await }
        })
        .await?;

        tracing::info!(topic = %topic, attempts, "Topic provisioning complete");
        Ok(())
    }

    /// One provisioning attempt against the broker.
    ///
    /// Returns `Err` only for transport-level failures, which are the
    /// retryable class.
    async fn try_create(&self, topic: &str, attempt: u32) -> Result<(), String> {
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .create()
            .map_err(|e| format!("failed to create admin client: {e}"))?;

        let new_topic = NewTopic::new(
            topic,
            self.partitions,
            TopicReplication::Fixed(self.replication_factor),
        );
        let options = AdminOptions::new()
            .operation_timeout(Some(Timeout::After(Duration::from_secs(5))))
            .request_timeout(Some(Timeout::After(Duration::from_secs(5))));

        let results = admin
            .create_topics([&new_topic], &options)
            .await
            .map_err(|e| format!("broker connection failed: {e}"))?;

        for result in results {
            match result {
                Ok(name) => {
                    tracing::info!(topic = %name, attempt, "Topic created");
                }
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    tracing::info!(topic = %name, attempt, "Topic already exists");
                }
                Err((name, code)) => {
                    // The broker answered; a creation rejection is not a
                    // connectivity problem and must not block startup.
                    tracing::warn!(
                        topic = %name,
                        error = %code,
                        attempt,
                        "Topic creation rejected, proceeding"
                    );
                }
            }
        }

        Ok(())
    }
}

/// Run `attempt` until it succeeds or the policy's attempt budget is
/// spent, sleeping the fixed interval between attempts.
///
/// Returns the number of attempts used on success.
async fn provision_with_retry<F, Fut>(
    policy: ProvisioningPolicy,
    mut attempt: F,
) -> Result<u32, ProvisionError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<(), String>>,
{
    let mut last_error = String::new();

    for n in 1..=policy.max_attempts {
        match attempt(n).await {
            Ok(()) => return Ok(n),
            Err(reason) => {
                tracing::warn!(
                    attempt = n,
                    max_attempts = policy.max_attempts,
                    error = %reason,
                    "Broker connection failed during provisioning"
                );
                last_error = reason;
                if n < policy.max_attempts {
                    sleep(policy.retry_interval).await;
                }
            }
        }
    }

    tracing::error!(
        attempts = policy.max_attempts,
        error = %last_error,
        "Topic provisioning exhausted retries"
    );
    Err(ProvisionError::Exhausted {
        attempts: policy.max_attempts,
        reason: last_error,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> ProvisioningPolicy {
        ProvisioningPolicy {
            max_attempts,
            retry_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let attempts = provision_with_retry(fast_policy(5), |_| {
            let c = Arc::clone(&calls_clone);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_when_broker_comes_up_within_bound() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let attempts = provision_with_retry(fast_policy(5), |_| {
            let c = Arc::clone(&calls_clone);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("connection refused".to_string())
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn reports_exhaustion_after_exactly_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = provision_with_retry(fast_policy(3), |_| {
            let c = Arc::clone(&calls_clone);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("connection refused".to_string())
            }
        })
        .await;

        match result {
            Err(ProvisionError::Exhausted { attempts, reason }) => {
                assert_eq!(attempts, 3);
                assert_eq!(reason, "connection refused");
            }
            Ok(_) => panic!("expected exhaustion"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_are_spaced_by_the_configured_interval() {
        let policy = ProvisioningPolicy {
            max_attempts: 3,
            retry_interval: Duration::from_millis(20),
        };
        let start = tokio::time::Instant::now();

        let _ = provision_with_retry(policy, |_| async {
            Err::<(), _>("down".to_string())
        })
        .await;

        // Two sleeps between three attempts; no sleep after the last.
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
