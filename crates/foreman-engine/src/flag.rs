//! A one-shot async shutdown flag shared by every background loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

struct Shared {
    raised: AtomicBool,
    notify: Notify,
}

/// A clonable flag that can be raised exactly once and awaited from any
/// number of tasks.
#[derive(Clone)]
pub struct ShutdownFlag(Arc<Shared>);

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self(Arc::new(Shared {
            raised: AtomicBool::new(false),
            notify: Notify::new(),
        }))
    }

    pub fn raise(&self) {
        self.0.raised.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
    }

    pub fn is_raised(&self) -> bool {
        self.0.raised.load(Ordering::Acquire)
    }

    /// Wait until the flag is raised. Returns immediately if it already is.
    pub async fn wait(&self) {
        while !self.is_raised() {
            let notified = self.0.notify.notified();

            // Re-check after registering the waiter so a raise between the
            // loop condition and `notified()` cannot be missed.
            if self.is_raised() {
                return;
            }

            notified.await;
        }
    }
}

/// Raises the flag when dropped, so that one loop exiting (for whatever
/// reason) takes its siblings down with it.
pub struct ShutdownGuard<'a>(&'a ShutdownFlag);

impl<'a> ShutdownGuard<'a> {
    pub fn new(flag: &'a ShutdownFlag) -> Self {
        Self(flag)
    }
}

impl Drop for ShutdownGuard<'_> {
    fn drop(&mut self) {
        if !self.0.is_raised() {
            tracing::warn!("background loop exited without the shutdown flag being raised");
        }

        self.0.raise();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_once_raised() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_raised());

        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.wait().await })
        };

        flag.raise();
        waiter.await.unwrap();
        assert!(flag.is_raised());

        // Waiting on an already raised flag completes immediately.
        flag.wait().await;
    }

    #[tokio::test]
    async fn guard_raises_on_drop() {
        let flag = ShutdownFlag::new();
        {
            let _guard = ShutdownGuard::new(&flag);
        }
        assert!(flag.is_raised());
    }
}
