use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flowsmith_core::config::{RetryConfig, SchedulerConfig};
use flowsmith_core::error::AgentError;
use flowsmith_core::traits::AgentHandler;
use flowsmith_core::types::{AgentConfig, AgentContext, AgentOutput, LogLevel};

use crate::ledger::RunLedger;

/// Exhausted or permanently failed invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub attempts: u32,
    pub last_error: AgentError,
}

/// How a retried invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Succeeded { output: AgentOutput, attempts: u32 },
    Failed(Failure),
    /// The run was cancelled between attempts.
    Cancelled { attempts: u32 },
}

/// Bounded retry / error-correction loop around one agent invocation.
///
/// Transient errors are retried up to `max_attempts` total attempts, each
/// retry carrying a corrective instruction describing the previous failure.
/// Permanent errors stop immediately. Every attempt is recorded in the ledger.
pub struct RetryCoordinator {
    max_attempts: u32,
    attempt_timeout: Option<Duration>,
    backoff: RetryConfig,
}

impl RetryCoordinator {
    pub fn new(max_attempts: u32, attempt_timeout: Option<Duration>, backoff: RetryConfig) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempt_timeout,
            backoff,
        }
    }

    /// Build from engine config. A timeout of 0 seconds means unbounded.
    pub fn from_config(config: &SchedulerConfig) -> Self {
        let timeout = (config.attempt_timeout_secs > 0).then(|| config.attempt_timeout());
        Self::new(config.max_attempts, timeout, config.retry.clone())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn run_with_retry(
        &self,
        handler: &dyn AgentHandler,
        mut context: AgentContext,
        config: &AgentConfig,
        ledger: &RunLedger,
        cancel: &CancellationToken,
    ) -> RetryOutcome {
        let node_id = context.node_id.clone();
        let node = Some(node_id.as_str());

        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return RetryOutcome::Cancelled {
                    attempts: attempt - 1,
                };
            }

            context.attempt = attempt;
            debug!(node_id = %node_id, agent = handler.id(), attempt, "Invoking agent");

            let result = match self.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, handler.invoke(context.clone(), config.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(AgentError::Transient(format!(
                        "timed out after {}s",
                        limit.as_secs_f64()
                    ))),
                },
                None => handler.invoke(context.clone(), config.clone()).await,
            };

            let error = match result {
                Ok(output) => {
                    ledger.append_log(
                        node,
                        LogLevel::Info,
                        format!("attempt {} succeeded", attempt),
                        Some(attempt),
                    );
                    info!(node_id = %node_id, attempt, "Agent attempt succeeded");
                    return RetryOutcome::Succeeded {
                        output,
                        attempts: attempt,
                    };
                }
                Err(e) => e,
            };

            if !error.is_transient() {
                ledger.append_log(
                    node,
                    LogLevel::Error,
                    format!("attempt {} failed permanently: {}", attempt, error.reason()),
                    Some(attempt),
                );
                warn!(node_id = %node_id, attempt, error = %error, "Permanent agent error, not retrying");
                return RetryOutcome::Failed(Failure {
                    attempts: attempt,
                    last_error: error,
                });
            }

            if attempt >= self.max_attempts {
                ledger.append_log(
                    node,
                    LogLevel::Error,
                    format!(
                        "attempt {} failed: {}; giving up after {} attempts",
                        attempt,
                        error.reason(),
                        attempt
                    ),
                    Some(attempt),
                );
                warn!(node_id = %node_id, attempts = attempt, error = %error, "Agent retries exhausted");
                return RetryOutcome::Failed(Failure {
                    attempts: attempt,
                    last_error: error,
                });
            }

            ledger.append_log(
                node,
                LogLevel::Warn,
                format!("attempt {} failed: {}", attempt, error.reason()),
                Some(attempt),
            );
            context.corrections.push(correction(attempt, &error));

            let backoff = calculate_backoff(attempt - 1, &self.backoff);
            warn!(
                node_id = %node_id,
                attempt,
                max_attempts = self.max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Retrying agent invocation"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return RetryOutcome::Cancelled { attempts: attempt };
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

/// Corrective instruction appended to the context for the next attempt.
fn correction(attempt: u32, error: &AgentError) -> String {
    format!(
        "The previous attempt ({}) produced an invalid result: {}. Fix the problem and respond again.",
        attempt,
        error.reason()
    )
}

fn calculate_backoff(retry: u32, config: &RetryConfig) -> Duration {
    if config.initial_backoff_ms == 0 {
        return Duration::ZERO;
    }
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(retry))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use futures::future::BoxFuture;

    use flowsmith_core::event::EventBus;
    use flowsmith_core::types::{AgentResult, RunId, RunState};

    /// Fails transiently until `succeed_on`, recording the corrections it sees.
    struct Flaky {
        calls: AtomicU32,
        succeed_on: u32,
        seen_corrections: Mutex<Vec<usize>>,
    }

    impl AgentHandler for Flaky {
        fn id(&self) -> &str {
            "flaky"
        }

        fn invoke(&self, context: AgentContext, _config: AgentConfig) -> BoxFuture<'_, AgentResult> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                self.seen_corrections
                    .lock()
                    .unwrap()
                    .push(context.corrections.len());
                if n >= self.succeed_on {
                    Ok(AgentOutput::text("ok"))
                } else {
                    Err(AgentError::Transient("malformed output".into()))
                }
            })
        }
    }

    struct Broken;

    impl AgentHandler for Broken {
        fn id(&self) -> &str {
            "broken"
        }

        fn invoke(&self, _context: AgentContext, _config: AgentConfig) -> BoxFuture<'_, AgentResult> {
            Box::pin(async { Err(AgentError::Permanent("missing credentials".into())) })
        }
    }

    struct Hangs;

    impl AgentHandler for Hangs {
        fn id(&self) -> &str {
            "hangs"
        }

        fn invoke(&self, _context: AgentContext, _config: AgentConfig) -> BoxFuture<'_, AgentResult> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(AgentOutput::default())
            })
        }
    }

    fn ledger() -> RunLedger {
        RunLedger::new(
            RunState::new(RunId::from_string("r"), "g", vec!["n".to_string()], "task"),
            Arc::new(EventBus::default()),
        )
    }

    fn context() -> AgentContext {
        AgentContext::new(RunId::from_string("r"), "n", "task")
    }

    fn coordinator(max: u32) -> RetryCoordinator {
        RetryCoordinator::new(max, None, RetryConfig::immediate())
    }

    #[tokio::test]
    async fn test_succeeds_after_corrections() {
        let agent = Flaky {
            calls: AtomicU32::new(0),
            succeed_on: 3,
            seen_corrections: Mutex::new(vec![]),
        };
        let l = ledger();
        let outcome = coordinator(3)
            .run_with_retry(&agent, context(), &AgentConfig::default(), &l, &CancellationToken::new())
            .await;
        assert!(matches!(outcome, RetryOutcome::Succeeded { attempts: 3, .. }));
        assert_eq!(*agent.seen_corrections.lock().unwrap(), vec![0, 1, 2]);

        let levels: Vec<_> = l.snapshot().log.iter().map(|e| e.level).collect();
        assert_eq!(levels, vec![LogLevel::Warn, LogLevel::Warn, LogLevel::Info]);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let agent = Flaky {
            calls: AtomicU32::new(0),
            succeed_on: u32::MAX,
            seen_corrections: Mutex::new(vec![]),
        };
        let l = ledger();
        let outcome = coordinator(3)
            .run_with_retry(&agent, context(), &AgentConfig::default(), &l, &CancellationToken::new())
            .await;
        match outcome {
            RetryOutcome::Failed(f) => {
                assert_eq!(f.attempts, 3);
                assert_eq!(f.last_error, AgentError::Transient("malformed output".into()));
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert_eq!(agent.calls.load(Ordering::SeqCst), 3);
        let snap = l.snapshot();
        let attempts: Vec<_> = snap.log.iter().filter_map(|e| e.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert_eq!(snap.log.last().unwrap().level, LogLevel::Error);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let agent = Flaky {
            calls: AtomicU32::new(0),
            succeed_on: u32::MAX,
            seen_corrections: Mutex::new(vec![]),
        };
        let coordinator = coordinator(0);
        assert_eq!(coordinator.max_attempts(), 1);
        let outcome = coordinator
            .run_with_retry(&agent, context(), &AgentConfig::default(), &ledger(), &CancellationToken::new())
            .await;
        assert!(matches!(outcome, RetryOutcome::Failed(Failure { attempts: 1, .. })));
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let l = ledger();
        let outcome = coordinator(3)
            .run_with_retry(&Broken, context(), &AgentConfig::default(), &l, &CancellationToken::new())
            .await;
        assert!(matches!(
            outcome,
            RetryOutcome::Failed(Failure { attempts: 1, last_error: AgentError::Permanent(_) })
        ));
        assert_eq!(l.snapshot().log.len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient() {
        let l = ledger();
        let coordinator =
            RetryCoordinator::new(2, Some(Duration::from_millis(10)), RetryConfig::immediate());
        let outcome = coordinator
            .run_with_retry(&Hangs, context(), &AgentConfig::default(), &l, &CancellationToken::new())
            .await;
        match outcome {
            RetryOutcome::Failed(f) => {
                assert_eq!(f.attempts, 2);
                assert!(f.last_error.is_transient());
                assert!(f.last_error.reason().contains("timed out"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let agent = Flaky {
            calls: AtomicU32::new(0),
            succeed_on: 1,
            seen_corrections: Mutex::new(vec![]),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = coordinator(3)
            .run_with_retry(&agent, context(), &AgentConfig::default(), &ledger(), &cancel)
            .await;
        assert_eq!(outcome, RetryOutcome::Cancelled { attempts: 0 });
        assert_eq!(agent.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_backoff_bounds() {
        let config = RetryConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
        };
        let first = calculate_backoff(0, &config).as_millis();
        assert!((80..=120).contains(&first));
        let capped = calculate_backoff(10, &config).as_millis();
        assert!((800..=1200).contains(&capped));
        assert_eq!(calculate_backoff(3, &RetryConfig::immediate()), Duration::ZERO);
    }
}
