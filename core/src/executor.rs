//! Retrying executor for single remote calls
//!
//! Every outbound call of the engine goes through [`RequestExecutor::execute`]:
//! the call is bounded by a timeout, classified, retried with exponential
//! backoff when the fault is transient, and observed into the metrics sink.
//! The caller never sees a raw fault; it gets the value or a [`CallFailure`].

use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::context::RunContext;
use crate::error::ErrorKind;
use crate::metrics::{names, MetricsSink};
use crate::rate_limiter::RequestRateLimiter;
use crate::retry::{retry_with_backoff, Attempt, RetryError, RetryPolicy};
use crate::traits::ServiceError;

/// HTTP-style verb, used for metric labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Read
    Get,
    /// Create / trigger
    Post,
    /// Replace
    Put,
}

impl Method {
    /// Upper-case verb
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description of one logical call: what it is and how hard to try
#[derive(Debug, Clone)]
pub struct RequestSpec {
    method: Method,
    label: Cow<'static, str>,
    timeout: Option<Duration>,
    policy: Option<RetryPolicy>,
    max_attempts: Option<u32>,
    base_delay: Option<Duration>,
}

impl RequestSpec {
    /// Call with executor defaults
    pub fn new(method: Method, label: impl Into<Cow<'static, str>>) -> Self {
        Self {
            method,
            label: label.into(),
            timeout: None,
            policy: None,
            max_attempts: None,
            base_delay: None,
        }
    }

    /// GET call
    pub fn get(label: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Method::Get, label)
    }

    /// POST call
    pub fn post(label: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Method::Post, label)
    }

    /// PUT call
    pub fn put(label: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Method::Put, label)
    }

    /// Per-attempt timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replace the whole retry policy
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Override the attempt budget
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Override the backoff unit
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    /// Metric/log label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Verb
    pub fn method(&self) -> Method {
        self.method
    }
}

/// Why a call produced no value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallFailure {
    /// Non-retryable fault (4xx, authentication, malformed body)
    #[error("{label} rejected: {error}")]
    Rejected {
        /// Call label
        label: String,
        /// The fault
        error: ServiceError,
    },

    /// Retryable faults on every attempt
    #[error("{label} failed after {attempts} attempts: {error}")]
    Exhausted {
        /// Call label
        label: String,
        /// Attempts made
        attempts: u32,
        /// Last fault
        error: ServiceError,
    },

    /// The run stopped before the call could finish
    #[error("{label} abandoned: run is stopping")]
    Stopped {
        /// Call label
        label: String,
    },
}

impl CallFailure {
    /// Classification for iteration records
    pub fn kind(&self) -> ErrorKind {
        match self {
            CallFailure::Rejected { error, .. } | CallFailure::Exhausted { error, .. } => {
                error.to_error_kind()
            }
            CallFailure::Stopped { .. } => ErrorKind::Shutdown,
        }
    }

    /// Underlying fault, if the call reached the service
    pub fn service_error(&self) -> Option<&ServiceError> {
        match self {
            CallFailure::Rejected { error, .. } | CallFailure::Exhausted { error, .. } => {
                Some(error)
            }
            CallFailure::Stopped { .. } => None,
        }
    }

    /// Whether the failure is due to the run stopping
    pub fn is_stopped(&self) -> bool {
        matches!(self, CallFailure::Stopped { .. })
    }
}

#[derive(Debug)]
enum AttemptError {
    Service(ServiceError),
    Stopped,
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Service(e) => e.fmt(f),
            AttemptError::Stopped => f.write_str("run is stopping"),
        }
    }
}

/// Retrying executor bound to one run
#[derive(Clone)]
pub struct RequestExecutor {
    policy: RetryPolicy,
    default_timeout: Duration,
    metrics: Arc<dyn MetricsSink>,
    rate_limiter: Arc<RequestRateLimiter>,
    stop: CancellationToken,
}

impl RequestExecutor {
    /// Create an executor
    pub fn new(
        policy: RetryPolicy,
        default_timeout: Duration,
        metrics: Arc<dyn MetricsSink>,
        rate_limiter: Arc<RequestRateLimiter>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            policy,
            default_timeout,
            metrics,
            rate_limiter,
            stop,
        }
    }

    /// Executor sharing the run's metrics, rate limit and stop signal
    pub fn for_run(ctx: &RunContext, policy: RetryPolicy, default_timeout: Duration) -> Self {
        Self::new(
            policy,
            default_timeout,
            Arc::clone(&ctx.metrics),
            Arc::clone(&ctx.rate_limiter),
            ctx.stop_token(),
        )
    }

    /// Default policy
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `action` until it succeeds, is rejected, or the budget is spent
    pub async fn execute<T, F, Fut>(&self, request: &RequestSpec, action: F) -> Result<T, CallFailure>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let policy = self.resolve_policy(request);
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let action = &action;
        let this = self;

        let outcome = retry_with_backoff(&policy, request.label(), &self.stop, move |_| async move {
            if !this.rate_limiter.acquire(&this.stop).await {
                return Attempt::Fail(AttemptError::Stopped);
            }

            let started = Instant::now();
            let result = match tokio::time::timeout(timeout, action()).await {
                Ok(result) => result,
                Err(_) => Err(ServiceError::Timeout(timeout)),
            };
            let status = match &result {
                Ok(_) => "success".to_string(),
                Err(e) => e.status_label(),
            };
            this.observe(request, status, started.elapsed());

            match result {
                Ok(value) => Attempt::Done(value),
                Err(e) if e.is_retryable() => Attempt::Retry(AttemptError::Service(e)),
                Err(e) => Attempt::Fail(AttemptError::Service(e)),
            }
        })
        .await;

        let label = request.label().to_string();
        match outcome {
            Ok(value) => Ok(value),
            Err(RetryError::Rejected {
                error: AttemptError::Service(error),
                ..
            }) => {
                tracing::warn!(label = %label, error = %error, "Request rejected");
                Err(CallFailure::Rejected { label, error })
            }
            Err(RetryError::Exhausted {
                error: AttemptError::Service(error),
                attempts,
            }) => {
                tracing::error!(label = %label, attempts, error = %error, "All attempts failed");
                Err(CallFailure::Exhausted {
                    label,
                    attempts,
                    error,
                })
            }
            Err(_) => {
                tracing::debug!(label = %label, "Request abandoned, run is stopping");
                Err(CallFailure::Stopped { label })
            }
        }
    }

    fn resolve_policy(&self, request: &RequestSpec) -> RetryPolicy {
        let mut policy = request.policy.unwrap_or(self.policy);
        if let Some(attempts) = request.max_attempts {
            policy.max_attempts = attempts;
        }
        if let Some(delay) = request.base_delay {
            policy.base_delay = delay;
        }
        policy
    }

    fn observe(&self, request: &RequestSpec, status: String, elapsed: Duration) {
        let method = request.method().as_str().to_string();
        let endpoint = request.label().to_string();
        self.metrics.increment_counter(
            names::REQUESTS_TOTAL,
            &[
                ("method", method.clone()),
                ("endpoint", endpoint.clone()),
                ("status", status),
            ],
        );
        self.metrics.observe(
            names::REQUEST_DURATION,
            &[("method", method), ("endpoint", endpoint)],
            elapsed,
        );
    }
}

impl fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("policy", &self.policy)
            .field("default_timeout", &self.default_timeout)
            .field("rate_limiter", &self.rate_limiter)
            .finish()
    }
}
