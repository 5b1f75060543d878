//! Bounded polling loops with cooperative cancellation.

use std::{future::Future, time::Instant};

use tokio::sync::watch;

use crate::{DeployError, config::PollPolicy};

/// Receiving side of a cancellation request.
///
/// Cheap to clone. A signal whose [`CancelHandle`] was dropped never fires.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Sending side of a cancellation request.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl CancelSignal {
    /// Create a linked handle/signal pair.
    pub fn new() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx })
    }

    /// A signal that is never cancelled.
    pub fn never() -> Self {
        let (_, signal) = Self::new();
        signal
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// What a single poll observed.
pub enum PollStatus<T> {
    Ready(T),
    NotYet,
}

/// Why a polling loop stopped without a result.
#[derive(Debug)]
pub enum PollError {
    /// Deadline or attempt budget exhausted. Carries the last transient error, if any.
    Exhausted(Option<DeployError>),
    Cancelled,
    /// A non-retryable error returned by the check.
    Fatal(DeployError),
}

/// Call `check` every `policy.interval()` until it reports [`PollStatus::Ready`].
///
/// Retryable errors from `check` count as "not yet". The loop stops on the deadline, on the
/// optional attempt ceiling, or as soon as `cancel` fires, even in the middle of a sleep.
pub async fn poll_until<T, F, Fut>(
    name: &str,
    policy: &PollPolicy,
    cancel: &CancelSignal,
    mut check: F,
) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollStatus<T>, DeployError>>,
{
    let start = Instant::now();
    let mut attempts = 0u32;
    let mut last_error = None;

    loop {
        if cancel.is_cancelled() {
            tracing::info!(what = %name, "Polling cancelled");
            return Err(PollError::Cancelled);
        }

        attempts += 1;
        match check().await {
            Ok(PollStatus::Ready(value)) => return Ok(value),
            Ok(PollStatus::NotYet) => {
                tracing::trace!(what = %name, attempts, "Not ready yet, polling again...");
            }
            Err(e) if e.is_retryable() => {
                tracing::debug!(what = %name, attempts, error = %e, "Transient error while polling");
                last_error = Some(e);
            }
            Err(e) => return Err(PollError::Fatal(e)),
        }

        let out_of_attempts = policy.max_attempts.is_some_and(|max| attempts >= max);
        if out_of_attempts || start.elapsed() + policy.interval() > policy.timeout() {
            tracing::warn!(what = %name, attempts, elapsed = ?start.elapsed(), "Polling budget exhausted");
            return Err(PollError::Exhausted(last_error));
        }

        tokio::select! {
            _ = tokio::time::sleep(policy.interval()) => {}
            _ = cancel.cancelled() => {
                tracing::info!(what = %name, "Polling cancelled");
                return Err(PollError::Cancelled);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
        time::Duration,
    };

    use super::*;

    fn fast_policy() -> PollPolicy {
        PollPolicy {
            interval_ms: 5,
            timeout_secs: 5,
            max_attempts: Some(10),
        }
    }

    #[tokio::test]
    async fn test_ready_after_a_few_polls() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = poll_until("test", &fast_policy(), &CancelSignal::never(), || {
            let calls = calls.clone();
            async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(DeployError::Transport("reset".into())),
                    1 => Ok(PollStatus::NotYet),
                    _ => Ok(PollStatus::Ready(42)),
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_ceiling() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<(), _> = poll_until("test", &fast_policy(), &CancelSignal::never(), || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(PollStatus::NotYet)
            }
        })
        .await;

        assert!(matches!(result, Err(PollError::Exhausted(None))));
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_immediately() {
        let result: Result<(), _> = poll_until("test", &fast_policy(), &CancelSignal::never(), || async {
            Err(DeployError::VerificationMismatch("nope".into()))
        })
        .await;

        assert!(matches!(
            result,
            Err(PollError::Fatal(DeployError::VerificationMismatch(_)))
        ));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_sleep() {
        let policy = PollPolicy {
            interval_ms: 60_000,
            timeout_secs: 600,
            max_attempts: None,
        };
        let (handle, signal) = CancelSignal::new();

        let task = tokio::spawn(async move {
            poll_until::<(), _, _>("test", &policy, &signal, || async { Ok(PollStatus::NotYet) })
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("cancellation should be prompt")
            .unwrap();
        assert!(matches!(result, Err(PollError::Cancelled)));
    }

    #[tokio::test]
    async fn test_dropped_handle_never_cancels() {
        let signal = CancelSignal::never();
        assert!(!signal.is_cancelled());
        let fired = tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(fired.is_err());
    }
}
