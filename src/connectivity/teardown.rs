//! Last-resort cleanup when the host process goes away
//!
//! The primary cleanup path is the application calling
//! [`ProcessTeardownGuard::teardown`] when it stops traversal. The guard
//! also hooks the interrupt signal and, as a final fallback, tries to
//! release session mappings from `Drop`. None of these paths can fail.

use super::device::{NatDevice, RenewalScheduler};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Stops renewal and releases session mappings exactly once
pub struct ProcessTeardownGuard<D: NatDevice + ?Sized + 'static> {
    device: Arc<D>,
    scheduler: Arc<Mutex<Option<RenewalScheduler>>>,
    done: Arc<AtomicBool>,
}

impl<D: NatDevice + ?Sized + 'static> ProcessTeardownGuard<D> {
    pub fn new(device: Arc<D>, scheduler: Option<RenewalScheduler>) -> Self {
        Self {
            device,
            scheduler: Arc::new(Mutex::new(scheduler)),
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Stop renewals and release session mappings. Failures are logged.
    pub async fn teardown(&self) {
        run_teardown(&self.device, &self.scheduler, &self.done).await;
    }

    /// Run the teardown when the process receives Ctrl-C
    pub fn watch_ctrl_c(&self) -> JoinHandle<()> {
        let device = self.device.clone();
        let scheduler = self.scheduler.clone();
        let done = self.done.clone();

        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    debug!("Interrupt received, releasing session mappings");
                    run_teardown(&device, &scheduler, &done).await;
                }
                Err(e) => warn!("Cannot listen for interrupt signal: {}", e),
            }
        })
    }
}

async fn run_teardown<D: NatDevice + ?Sized>(
    device: &Arc<D>,
    scheduler: &Mutex<Option<RenewalScheduler>>,
    done: &AtomicBool,
) {
    if done.swap(true, Ordering::SeqCst) {
        return;
    }

    if let Some(mut scheduler) = scheduler.lock().await.take() {
        scheduler.stop();
    }

    let report = device.release_session_mappings().await;
    if report.is_complete() {
        device.logger().info(&format!(
            "Teardown released {} session mapping(s)",
            report.released.len()
        ));
    } else {
        device.logger().warn(&format!(
            "Teardown released {} session mapping(s), {} could not be released",
            report.released.len(),
            report.failed.len()
        ));
    }
}

impl<D: NatDevice + ?Sized + 'static> Drop for ProcessTeardownGuard<D> {
    fn drop(&mut self) {
        if self.is_done() {
            return;
        }

        if let Ok(mut guard) = self.scheduler.try_lock() {
            if let Some(mut scheduler) = guard.take() {
                scheduler.stop();
            }
        }

        // Only possible while a runtime is still alive; otherwise the
        // gateway lease is left to expire.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let device = self.device.clone();
                let scheduler = self.scheduler.clone();
                let done = self.done.clone();
                handle.spawn(async move {
                    run_teardown(&device, &scheduler, &done).await;
                });
            }
            Err(_) => {
                self.device
                    .logger()
                    .warn("No runtime available at teardown, session mappings left to expire");
            }
        }
    }
}
