use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Cooperative shutdown signal shared between the supervisor workers and the
/// process entry point. Cloning hands out another handle to the same flag;
/// `cancel` is callable from any thread, including the signal handler.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    shared: Arc<SharedState>,
}

#[derive(Debug, Default)]
struct SharedState {
    closing: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> ShutdownSignal {
        ShutdownSignal {
            shared: Arc::new(SharedState {
                closing: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Flip the flag and wake every waiter.
    pub fn cancel(&self) {
        self.shared.closing.store(true, Ordering::Relaxed);
        self.shared.notify.notify_waiters();
    }

    pub fn cancelled(&self) -> bool {
        self.shared.closing.load(Ordering::Relaxed)
    }

    /// Await cancellation.
    pub async fn wait(&self) -> bool {
        if self.cancelled() {
            return true;
        }

        self.shared.notify.notified().await;

        self.cancelled()
    }
}

impl Clone for ShutdownSignal {
    fn clone(&self) -> ShutdownSignal {
        ShutdownSignal {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_sticky() {
        let sos = ShutdownSignal::new();
        assert!(!sos.cancelled());

        let clone = sos.clone();
        sos.cancel();
        assert!(clone.cancelled());
    }

    #[tokio::test]
    async fn test_async_wait_wakes() {
        let sos = ShutdownSignal::new();
        let waiter = sos.clone();

        let handle = tokio::spawn(async move { waiter.wait().await });

        sos.cancel();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_after_cancel_returns_immediately() {
        let sos = ShutdownSignal::new();
        sos.cancel();
        assert!(sos.wait().await);
    }
}
