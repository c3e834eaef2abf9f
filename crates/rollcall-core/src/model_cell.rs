//! Lazily initialized, process-wide model handle.
//!
//! The first caller runs the loader; callers arriving while it is in
//! flight wait for that same attempt instead of starting another. A load
//! that exhausts its attempts leaves the cell empty so a later request
//! can try again.

use crate::detector::DetectorError;
use std::future::Future;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Bounded-retry policy for model initialization.
#[derive(Debug, Clone, Copy)]
pub struct InitPolicy {
    pub max_attempts: u32,
    /// Upper bound on a single load attempt.
    pub attempt_timeout: Duration,
    /// Sleep before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for InitPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(30),
            backoff: Duration::from_millis(250),
        }
    }
}

pub struct ModelCell<T> {
    label: &'static str,
    policy: InitPolicy,
    cell: OnceCell<T>,
}

impl<T> ModelCell<T> {
    pub fn new(label: &'static str, policy: InitPolicy) -> Self {
        Self {
            label,
            policy,
            cell: OnceCell::new(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    /// Return the loaded value, running `load` (with retries) if needed.
    pub async fn get_or_load<F, Fut>(&self, load: F) -> Result<&T, DetectorError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, DetectorError>>,
    {
        self.cell
            .get_or_try_init(|| async {
                let attempts = self.policy.max_attempts.max(1);
                let mut reason = String::new();

                for attempt in 1..=attempts {
                    match tokio::time::timeout(self.policy.attempt_timeout, load()).await {
                        Ok(Ok(value)) => {
                            tracing::info!(model = self.label, attempt, "model initialized");
                            return Ok(value);
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(model = self.label, attempt, error = %e, "model initialization failed");
                            reason = e.to_string();
                        }
                        Err(_) => {
                            tracing::warn!(
                                model = self.label,
                                attempt,
                                timeout = ?self.policy.attempt_timeout,
                                "model initialization timed out"
                            );
                            reason = format!("timed out after {:?}", self.policy.attempt_timeout);
                        }
                    }

                    if attempt < attempts {
                        tokio::time::sleep(self.policy.backoff * attempt).await;
                    }
                }

                tracing::error!(model = self.label, attempts, %reason, "model unavailable");
                Err(DetectorError::ModelUnavailable { attempts, reason })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32, attempt_timeout_ms: u64) -> InitPolicy {
        InitPolicy {
            max_attempts,
            attempt_timeout: Duration::from_millis(attempt_timeout_ms),
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_load() {
        let cell = ModelCell::new("test", policy(3, 1_000));
        let calls = Arc::new(AtomicUsize::new(0));

        let load = || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, DetectorError>(42u32)
            }
        };

        let (a, b) = tokio::join!(cell.get_or_load(load), cell.get_or_load(load));
        assert_eq!(*a.unwrap(), 42);
        assert_eq!(*b.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cell.is_loaded());

        // Already loaded: the loader is not consulted again.
        cell.get_or_load(load).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let cell = ModelCell::new("test", policy(3, 1_000));
        let calls = Arc::new(AtomicUsize::new(0));

        let value = cell
            .get_or_load(|| {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(DetectorError::ModelNotFound(format!("attempt {n}")))
                    } else {
                        Ok("loaded")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(*value, "loaded");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_and_allows_later_retry() {
        let cell: ModelCell<()> = ModelCell::new("test", policy(3, 1_000));
        let calls = Arc::new(AtomicUsize::new(0));
        let load = || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(DetectorError::ModelNotFound("/nowhere/det.onnx".into()))
            }
        };

        let err = cell.get_or_load(load).await.unwrap_err();
        assert!(matches!(err, DetectorError::ModelUnavailable { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!cell.is_loaded());

        let _ = cell.get_or_load(load).await;
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_slow_load_times_out() {
        let cell = ModelCell::new("test", policy(2, 20));
        let err = cell
            .get_or_load(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, DetectorError>(())
            })
            .await
            .unwrap_err();

        match err {
            DetectorError::ModelUnavailable { attempts, reason } => {
                assert_eq!(attempts, 2);
                assert!(reason.contains("timed out"), "{reason}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let cell = ModelCell::new("test", policy(0, 1_000));
        let value = cell.get_or_load(|| async { Ok::<_, DetectorError>(7) }).await.unwrap();
        assert_eq!(*value, 7);
    }
}
