//! Lockout notifications.
//!
//! Notifications are fire-and-forget from the caller's point of view: the
//! engine hands them to a [`NotificationDispatcher`], which runs each one on a
//! tracked background task with a fresh context. A caller cancelling its
//! request therefore never cancels an alert that was just issued. Failures are
//! logged and dropped.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinSet;

use crate::RequestContext;

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("Notification delivery failed: {0}")]
    Delivery(String),

    #[error("Notification timed out")]
    Timeout,
}

/// Delivers lockout alerts (mail, chat, paging, ...).
///
/// Called at most once per lockout creation.
#[async_trait]
pub trait LockoutNotifier: Send + Sync + 'static {
    async fn send_lockout_notification(
        &self,
        ctx: &RequestContext,
        identifier: &str,
        unlock_at: DateTime<Utc>,
    ) -> Result<(), NotifierError>;
}

/// Runs notifier calls on supervised background tasks.
pub struct NotificationDispatcher {
    notifier: Arc<dyn LockoutNotifier>,
    timeout: Duration,
    tasks: Mutex<JoinSet<()>>,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn LockoutNotifier>, timeout: Duration) -> Self {
        Self {
            notifier,
            timeout,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Spawn delivery of one lockout alert without waiting for it.
    pub fn dispatch(&self, identifier: &str, unlock_at: DateTime<Utc>) {
        let notifier = Arc::clone(&self.notifier);
        let identifier = identifier.to_string();
        let timeout = self.timeout;

        let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Reap finished deliveries so the set stays small
        while tasks.try_join_next().is_some() {}

        tasks.spawn(async move {
            let ctx = RequestContext::background().with_timeout(timeout);
            let delivery = notifier.send_lockout_notification(&ctx, &identifier, unlock_at);
            let result = match tokio::time::timeout(timeout, delivery).await {
                Ok(result) => result,
                Err(_) => Err(NotifierError::Timeout),
            };

            match result {
                Ok(()) => {
                    tracing::debug!(identifier = %identifier, "Lockout notification delivered");
                }
                Err(e) => {
                    tracing::warn!(
                        identifier = %identifier,
                        error = %e,
                        "Failed to send lockout notification"
                    );
                }
            }
        });
    }

    /// Number of deliveries that have not been reaped yet.
    pub fn in_flight(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Wait up to `grace` for in-flight deliveries, then abort the rest.
    pub async fn drain(&self, grace: Duration) {
        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *guard)
        };
        if tasks.is_empty() {
            return;
        }

        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                pending = tasks.len(),
                "Aborting lockout notifications still running after shutdown grace period"
            );
            tasks.shutdown().await;
        }
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        // In-flight deliveries outlive the limiter unless drained
        if let Ok(tasks) = self.tasks.get_mut() {
            tasks.detach_all();
        }
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("timeout", &self.timeout)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
