//! Process supervision: singleton lock, cancel propagation, admission
//! gating, archive-secret delivery, advisory snapshots.

mod lock;
mod snapshot;

pub use lock::{LockError, SingletonLock, EXIT_ALREADY_RUNNING};
pub use snapshot::{
    summarize, PipelineSnapshot, QuarantineEntry, QuarantineIndex, StageSnapshot,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Global admission predicate the download worker consults between tasks
/// (never mid-task; in-flight downloads run to natural completion).
pub struct AdmissionGate {
    open: AtomicBool,
    notify: Notify,
}

impl AdmissionGate {
    pub fn new(open: bool) -> Self {
        Self {
            open: AtomicBool::new(open),
            notify: Notify::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    pub fn set_open(&self, open: bool) {
        let was = self.open.swap(open, Ordering::Relaxed);
        if was != open {
            tracing::info!(open, "admission gate changed");
            self.notify.notify_waiters();
        }
    }

    /// Wait until the gate opens or `cancel` fires.
    pub async fn wait_open(&self, cancel: &Arc<AtomicBool>) {
        while !self.is_open() && !cancel.load(Ordering::Relaxed) {
            let notified = self.notify.notified();
            if self.is_open() || cancel.load(Ordering::Relaxed) {
                break;
            }
            notified.await;
        }
    }

    /// Used by shutdown to unblock waiters.
    pub fn poke(&self) {
        self.notify.notify_waiters();
    }
}

/// Shared supervision handles for workers.
pub struct Supervisor {
    cancel: Arc<AtomicBool>,
    pub admission: AdmissionGate,
    /// Upload stage paused until the adapter re-authenticates.
    auth_paused: AtomicBool,
    secrets: Mutex<HashMap<String, String>>,
    secret_notify: Notify,
}

impl Supervisor {
    pub fn new(admission_open: bool) -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            admission: AdmissionGate::new(admission_open),
            auth_paused: AtomicBool::new(false),
            secrets: Mutex::new(HashMap::new()),
            secret_notify: Notify::new(),
        }
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Signal every worker to stop after its current suspension point.
    pub fn request_shutdown(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.admission.poke();
        self.secret_notify.notify_waiters();
    }

    pub fn auth_paused(&self) -> bool {
        self.auth_paused.load(Ordering::Relaxed)
    }

    pub fn set_auth_paused(&self, paused: bool) {
        let was = self.auth_paused.swap(paused, Ordering::Relaxed);
        if was != paused {
            tracing::warn!(paused, "upload auth pause changed");
        }
    }

    /// Deliver the secret for an archive blocked awaiting one.
    pub fn store_secret(&self, archive_name: &str, secret: &str) {
        self.secrets
            .lock()
            .unwrap()
            .insert(archive_name.to_string(), secret.to_string());
        self.secret_notify.notify_waiters();
    }

    pub fn secret_for(&self, archive_name: &str) -> Option<String> {
        self.secrets.lock().unwrap().get(archive_name).cloned()
    }

    /// Forget a secret the archive rejected so the next wait blocks for a
    /// fresh one.
    pub fn clear_secret(&self, archive_name: &str) {
        self.secrets.lock().unwrap().remove(archive_name);
    }

    /// Block until a secret for `archive_name` arrives or shutdown. Only
    /// the sequential process worker calls this, so at most one archive
    /// waits at a time.
    pub async fn wait_secret(&self, archive_name: &str) -> Option<String> {
        loop {
            if let Some(secret) = self.secret_for(archive_name) {
                return Some(secret);
            }
            if self.is_shutdown() {
                return None;
            }
            let notified = self.secret_notify.notified();
            if let Some(secret) = self.secret_for(archive_name) {
                return Some(secret);
            }
            if self.is_shutdown() {
                return None;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn gate_blocks_until_opened() {
        let sup = Arc::new(Supervisor::new(false));
        let cancel = sup.cancel_flag();

        let waiter = {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move {
                sup.admission.wait_open(&cancel).await;
                true
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        sup.admission.set_open(true);
        assert!(tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap());
    }

    #[tokio::test]
    async fn shutdown_unblocks_gate_waiters() {
        let sup = Arc::new(Supervisor::new(false));
        let cancel = sup.cancel_flag();
        let waiter = {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move { sup.admission.wait_open(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        sup.request_shutdown();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn secret_delivery_wakes_waiter() {
        let sup = Arc::new(Supervisor::new(true));
        let waiter = {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move { sup.wait_secret("A.zip").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        sup.store_secret("A.zip", "hunter2");
        let secret = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(secret.as_deref(), Some("hunter2"));
    }
}
