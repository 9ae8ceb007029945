//! Resilient model invocation. Every model call in the pipeline goes
//! through [`invoke_with_fallback`], which retries transient failures with
//! exponential backoff and hops to the next model in the chain when a
//! provider rate-limits us.

use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::{info, warn};

use ai_client::error::{classify_error, AiErrorKind};

/// Retry budget shared across one logical invocation. The budget does NOT
/// reset when we fall back to another model after an error backoff, but a
/// rate-limit hop moves to the next model without spending a retry.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_secs(20),
        }
    }
}

/// Run `attempt` against each model in `models` starting at `start_index`,
/// classifying failures:
///
/// - fatal errors abort immediately,
/// - rate limits hop to the next model in the chain (same retry budget),
/// - anything else backs off and retries the current model.
///
/// The backoff delay grows per retry: x4 after a rate limit (when no
/// further model is available to hop to), x2 otherwise.
pub async fn invoke_with_fallback<'a, T, F, Fut>(
    context: &str,
    models: &'a [&'a str],
    policy: RetryPolicy,
    start_index: usize,
    attempt: F,
) -> Result<T>
where
    F: Fn(&'a str) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if models.is_empty() || start_index >= models.len() {
        return Err(anyhow!("no model available for {context}"));
    }

    let mut index = start_index;
    let mut retries_left = policy.max_retries;
    let mut delay = policy.base_delay;

    loop {
        let model = models[index];
        match attempt(model).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let kind = classify_error(&err);
                match kind {
                    AiErrorKind::Fatal => {
                        return Err(err.context(format!("{context} failed on {model}")));
                    }
                    AiErrorKind::RateLimited if index + 1 < models.len() => {
                        info!(context, from = model, to = models[index + 1], "rate limited, falling back to next model");
                        index += 1;
                        continue;
                    }
                    AiErrorKind::RateLimited | AiErrorKind::Transient => {
                        if retries_left == 0 {
                            return Err(err.context(format!(
                                "{context} exhausted {} retries on {model}",
                                policy.max_retries
                            )));
                        }
                        retries_left -= 1;
                        warn!(
                            context,
                            model,
                            retries_left,
                            delay_s = delay.as_secs(),
                            error = %err,
                            "model call failed, retrying after backoff"
                        );
                        tokio::time::sleep(delay).await;
                        delay *= if kind == AiErrorKind::RateLimited { 4 } else { 2 };
                    }
                }
            }
        }
    }
}
