//! The emergency shutdown controller.
//!
//! Subsystems register callbacks at assembly time; a critical alarm (or an
//! authorized API request) triggers an ordered stop: the system status row
//! is flipped first so dashboards see it, then every callback runs in
//! registration order under a deadline, then the process-wide shutdown
//! flag is raised so background loops drain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use foreman_core::alarm::{AlarmEvent, AlarmSeverity, AlarmType};
use futures_util::future::BoxFuture;

use crate::flag::ShutdownFlag;
use crate::store::{alarms, audit, status, Store};

type Callback = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

const CALLBACK_DEADLINE: Duration = Duration::from_secs(10);

pub struct ShutdownController {
    store: Store,
    flag: ShutdownFlag,
    in_progress: AtomicBool,
    callbacks: parking_lot::Mutex<Vec<(String, Callback)>>,
}

impl ShutdownController {
    pub fn new(store: Store, flag: ShutdownFlag) -> Self {
        Self {
            store,
            flag,
            in_progress: AtomicBool::new(false),
            callbacks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn flag(&self) -> &ShutdownFlag {
        &self.flag
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Register a callback to run during shutdown. Callbacks run in
    /// registration order.
    pub fn on_shutdown<F, Fut>(&self, name: impl Into<String>, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();

        if self.is_in_progress() {
            tracing::warn!(callback = %name, "callback registered after shutdown started; it will not run");
        }

        self.callbacks
            .lock()
            .push((name, Box::new(move || Box::pin(callback()))));
    }

    /// Drive the emergency shutdown. Re-entrant calls log and return.
    pub async fn trigger(&self, reason: &str) {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("shutdown already in progress, ignoring trigger: {reason}");
            return;
        }

        tracing::error!("emergency shutdown triggered: {reason}");

        if let Err(e) = status::mark_shutdown(self.store.pool(), reason).await {
            tracing::error!("failed to record shutdown in system status: {e}");
        }

        let _ = audit::record(
            self.store.pool(),
            "emergency_shutdown",
            Some("system"),
            None,
            "shutdown",
            Some(reason),
            None,
        )
        .await;

        let callbacks = std::mem::take(&mut *self.callbacks.lock());

        for (name, callback) in &callbacks {
            tracing::info!(callback = %name, "running shutdown callback");

            match tokio::time::timeout(CALLBACK_DEADLINE, callback()).await {
                Ok(Ok(())) => (),
                Ok(Err(e)) => tracing::error!(callback = %name, "shutdown callback failed: {e:#}"),
                Err(_) => tracing::error!(
                    callback = %name,
                    "shutdown callback exceeded its {}s deadline",
                    CALLBACK_DEADLINE.as_secs()
                ),
            }
        }

        let event = AlarmEvent::new(
            AlarmType::SystemShutdown,
            AlarmSeverity::Info,
            "Emergency System Shutdown",
            format!("Emergency shutdown completed: {reason}"),
        )
        .for_component("shutdown_controller");

        if let Err(e) = alarms::insert(self.store.pool(), &event).await {
            tracing::error!("failed to record the shutdown alarm: {e}");
        }

        self.flag.raise();

        tracing::info!("emergency shutdown sequence complete");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use foreman_core::DatabaseConfig;

    use super::*;

    // A store whose pool points at nothing; status/alarm writes fail and
    // are logged, which is exactly the degraded path the controller has to
    // survive.
    fn unreachable_store() -> Store {
        let config = DatabaseConfig {
            url: "postgresql://127.0.0.1:1/unreachable".to_owned(),
            pool_size: 1,
            max_overflow: 0,
            pool_timeout: Duration::from_millis(200),
            pool_recycle: Duration::from_secs(60),
        };

        Store::connect_lazy(&config).expect("lazy pool creation is infallible")
    }

    #[tokio::test]
    async fn callbacks_run_in_registration_order() {
        let controller = ShutdownController::new(unreachable_store(), ShutdownFlag::new());
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for name in ["api", "monitor", "store"] {
            let order = order.clone();
            controller.on_shutdown(name, move || {
                let order = order.clone();
                async move {
                    order.lock().push(name);
                    Ok(())
                }
            });
        }

        controller.trigger("test shutdown").await;

        assert_eq!(*order.lock(), vec!["api", "monitor", "store"]);
        assert!(controller.flag().is_raised());
        assert!(controller.is_in_progress());
    }

    #[tokio::test]
    async fn a_failing_callback_does_not_abort_the_sequence() {
        let controller = ShutdownController::new(unreachable_store(), ShutdownFlag::new());
        let ran = Arc::new(AtomicBool::new(false));

        controller.on_shutdown("boom", || async { anyhow::bail!("refused") });
        {
            let ran = ran.clone();
            controller.on_shutdown("after", move || {
                let ran = ran.clone();
                async move {
                    ran.store(true, Ordering::Release);
                    Ok(())
                }
            });
        }

        controller.trigger("test").await;
        assert!(ran.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn re_entry_is_ignored() {
        let controller = ShutdownController::new(unreachable_store(), ShutdownFlag::new());
        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));

        {
            let count = count.clone();
            controller.on_shutdown("counter", move || {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::AcqRel);
                    Ok(())
                }
            });
        }

        controller.trigger("first").await;
        controller.trigger("second").await;

        assert_eq!(count.load(Ordering::Acquire), 1);
    }
}
