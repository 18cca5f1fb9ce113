//! Container runtime seam.
//!
//! The orchestrator only ever talks to a [`ContainerRuntime`]; the Docker
//! Engine backend lives in [`docker`]. Every call is bounded by
//! [`with_retry`], which applies a per-attempt timeout and retries transient
//! failures with exponential backoff.

pub mod docker;

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

/// Label present on every container this service creates.
pub const LABEL_MANAGED: &str = "labgate.managed";
pub const LABEL_OWNER: &str = "labgate.owner";
pub const LABEL_CLASSROOM: &str = "labgate.classroom";
pub const LABEL_IMAGE: &str = "labgate.image";

/// Description of a container to create and start.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name; doubles as the lab instance handle.
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub memory_mb: Option<u64>,
}

/// Runtime-reported container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Unknown,
}

impl ContainerState {
    pub fn parse(state: &str) -> Self {
        match state {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "exited" | "removing" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }
}

/// A container as observed in the runtime.
#[derive(Debug, Clone)]
pub struct RuntimeContainer {
    pub name: String,
    pub state: ContainerState,
    pub labels: HashMap<String, String>,
    /// `host:port` of the published GNS3 console, when known.
    pub endpoint: Option<String>,
}

impl RuntimeContainer {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Which managed containers a `list` call should return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListFilter {
    Owner(String),
    Classroom(String),
    All,
}

impl ListFilter {
    pub fn matches(&self, owner: &str, classroom: &str) -> bool {
        match self {
            Self::Owner(o) => o == owner,
            Self::Classroom(c) => c == classroom,
            Self::All => true,
        }
    }

    /// Label selectors understood by the runtime's list filter.
    pub fn label_selectors(&self) -> Vec<String> {
        let mut selectors = vec![format!("{LABEL_MANAGED}=true")];
        match self {
            Self::Owner(o) => selectors.push(format!("{LABEL_OWNER}={o}")),
            Self::Classroom(c) => selectors.push(format!("{LABEL_CLASSROOM}={c}")),
            Self::All => {}
        }
        selectors
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    /// Connection refused, timeout, daemon-side 5xx.
    #[error("transient runtime failure: {0}")]
    Transient(String),

    #[error("container {0}")]
    NotFound(String),

    #[error("invalid container spec: {0}")]
    InvalidSpec(String),

    #[error("runtime quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("runtime error: {0}")]
    Other(String),
}

impl RuntimeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Container runtime operations used by the orchestrator.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container. Creating a name that already exists
    /// must start and return the existing container.
    async fn create(&self, spec: &ContainerSpec) -> Result<RuntimeContainer, RuntimeError>;

    async fn list(&self, filter: &ListFilter) -> Result<Vec<RuntimeContainer>, RuntimeError>;

    /// Stop a container. Stopping an already-stopped container succeeds.
    async fn stop(&self, name: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, name: &str) -> Result<(), RuntimeError>;
}

/// Bounded retry for runtime calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            call_timeout: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `call` until it succeeds, fails non-transiently, or the attempt budget
/// runs out. Each attempt is bounded by `policy.call_timeout`.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, RuntimeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RuntimeError>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        let outcome = match tokio::time::timeout(policy.call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Transient(format!(
                "{operation} timed out after {:?}",
                policy.call_timeout
            ))),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                let delay = policy.backoff(attempt);
                warn!(operation, attempt, ?delay, error = %err, "Runtime call failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                debug!(operation, attempt, error = %err, "Runtime call failed");
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            call_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(), "create", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(RuntimeError::Transient("connection refused".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(), "list", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RuntimeError::Transient("daemon restarting".into()))
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_failures_surface_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(), "create", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RuntimeError::InvalidSpec("no such image".into()))
        })
        .await;
        assert!(matches!(result, Err(RuntimeError::InvalidSpec(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_calls_time_out_as_transient() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_policy(), "stop", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<Result<(), RuntimeError>>().await
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = fast_policy();
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(5), Duration::from_millis(40));
    }

    #[test]
    fn filters_select_by_labels() {
        let owner = ListFilter::Owner("alice".into());
        assert!(owner.matches("alice", "CS101"));
        assert!(!owner.matches("bob", "CS101"));
        assert_eq!(
            owner.label_selectors(),
            vec!["labgate.managed=true".to_string(), "labgate.owner=alice".to_string()]
        );
    }
}
