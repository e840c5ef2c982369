use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::Ms;

const CHANNEL_CAPACITY: usize = 1024;

/// A reminder the notifier should deliver at `when`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reminder {
    pub booking_id: Ulid,
    pub provider_name: String,
    pub when: Ms,
    pub lead_minutes: u32,
}

#[derive(Debug, Error)]
#[error("notifier unavailable: {0}")]
pub struct NotifyError(pub String);

/// Reminder delivery lives outside this process.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn schedule_reminder(&self, reminder: Reminder) -> Result<(), NotifyError>;
}

/// Default notifier: records the request in the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn schedule_reminder(&self, reminder: Reminder) -> Result<(), NotifyError> {
        info!(
            booking = %reminder.booking_id,
            provider = %reminder.provider_name,
            when = reminder.when,
            "reminder scheduled"
        );
        Ok(())
    }
}

/// Fire-and-forget queue in front of the notifier. Commits never wait on it.
pub struct ReminderDispatcher {
    tx: mpsc::Sender<Reminder>,
}

impl ReminderDispatcher {
    pub fn spawn(notifier: Arc<dyn Notifier>) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(deliver(notifier, rx));
        Self { tx }
    }

    pub fn dispatch(&self, reminder: Reminder) {
        let booking_id = reminder.booking_id;
        if let Err(e) = self.tx.try_send(reminder) {
            metrics::counter!(crate::observability::REMINDER_FAILURES_TOTAL).increment(1);
            warn!(booking = %booking_id, "reminder dropped: {e}");
        }
    }
}

async fn deliver(notifier: Arc<dyn Notifier>, mut rx: mpsc::Receiver<Reminder>) {
    while let Some(reminder) = rx.recv().await {
        let booking_id = reminder.booking_id;
        if let Err(e) = notifier.schedule_reminder(reminder).await {
            metrics::counter!(crate::observability::REMINDER_FAILURES_TOTAL).increment(1);
            warn!(booking = %booking_id, "reminder failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording(Mutex<Vec<Reminder>>);

    #[async_trait]
    impl Notifier for Recording {
        async fn schedule_reminder(&self, reminder: Reminder) -> Result<(), NotifyError> {
            self.0.lock().unwrap().push(reminder);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Notifier for Failing {
        async fn schedule_reminder(&self, _: Reminder) -> Result<(), NotifyError> {
            Err(NotifyError("down".into()))
        }
    }

    fn reminder() -> Reminder {
        Reminder {
            booking_id: Ulid::new(),
            provider_name: "Studio".into(),
            when: 1_000,
            lead_minutes: 60,
        }
    }

    #[tokio::test]
    async fn dispatched_reminders_reach_notifier() {
        let notifier = Arc::new(Recording(Mutex::new(Vec::new())));
        let dispatcher = ReminderDispatcher::spawn(notifier.clone());
        let r = reminder();
        dispatcher.dispatch(r.clone());

        for _ in 0..50 {
            if !notifier.0.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(notifier.0.lock().unwrap().as_slice(), &[r]);
    }

    #[tokio::test]
    async fn failing_notifier_does_not_panic() {
        let dispatcher = ReminderDispatcher::spawn(Arc::new(Failing));
        dispatcher.dispatch(reminder());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        dispatcher.dispatch(reminder());
    }
}
