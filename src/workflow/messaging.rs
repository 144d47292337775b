//! Activities (to-do items assigned to a user) and chatter messages.
//!
//! Notifications never decide the outcome of a workflow operation: the
//! engine writes the new state first and only logs messaging failures.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::bail;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::model::{UserId, WorkflowId};

pub type ActivityId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    SignatureRequired,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Activity {
    pub id: ActivityId,
    pub workflow: WorkflowId,
    pub user: UserId,
    pub kind: ActivityKind,
    pub summary: String,
    pub note: String,
    pub open: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub workflow: WorkflowId,
    pub to: UserId,
    pub subject: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

pub trait Messenger: Send + Sync {
    fn create_activity(
        &self,
        workflow: WorkflowId,
        user: UserId,
        kind: ActivityKind,
        summary: &str,
        note: &str,
    ) -> anyhow::Result<ActivityId>;

    /// Closes the open activities of `workflow`, only those of `user` if
    /// given. Returns how many were closed.
    fn dismiss_activities(&self, workflow: WorkflowId, user: Option<UserId>)
        -> anyhow::Result<usize>;

    fn post_message(
        &self,
        workflow: WorkflowId,
        to: UserId,
        subject: &str,
        body: &str,
    ) -> anyhow::Result<()>;
}

#[derive(Default)]
struct Outbox {
    last_id: ActivityId,
    activities: Vec<Activity>,
    messages: Vec<Message>,
}

/// Keeps everything in memory. Can be told to fail, to check that workflow
/// state survives a broken notification channel.
#[derive(Default)]
pub struct MemoryMessenger {
    outbox: Mutex<Outbox>,
    failing: AtomicBool,
}

impl MemoryMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn open_activities(&self, workflow: WorkflowId) -> Vec<Activity> {
        self.outbox
            .lock()
            .activities
            .iter()
            .filter(|a| a.open && a.workflow == workflow)
            .cloned()
            .collect()
    }

    pub fn activities_for(&self, user: UserId) -> Vec<Activity> {
        self.outbox
            .lock()
            .activities
            .iter()
            .filter(|a| a.user == user)
            .cloned()
            .collect()
    }

    pub fn messages_for(&self, user: UserId) -> Vec<Message> {
        self.outbox
            .lock()
            .messages
            .iter()
            .filter(|m| m.to == user)
            .cloned()
            .collect()
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("messaging unavailable");
        }
        Ok(())
    }
}

impl Messenger for MemoryMessenger {
    fn create_activity(
        &self,
        workflow: WorkflowId,
        user: UserId,
        kind: ActivityKind,
        summary: &str,
        note: &str,
    ) -> anyhow::Result<ActivityId> {
        self.check()?;
        let mut outbox = self.outbox.lock();
        outbox.last_id += 1;
        let id = outbox.last_id;
        outbox.activities.push(Activity {
            id,
            workflow,
            user,
            kind,
            summary: summary.to_string(),
            note: note.to_string(),
            open: true,
        });
        Ok(id)
    }

    fn dismiss_activities(
        &self,
        workflow: WorkflowId,
        user: Option<UserId>,
    ) -> anyhow::Result<usize> {
        self.check()?;
        let mut outbox = self.outbox.lock();
        let mut closed = 0;
        for activity in outbox.activities.iter_mut().filter(|a| {
            a.open
                && a.workflow == workflow
                && a.kind == ActivityKind::SignatureRequired
                && user.map_or(true, |u| a.user == u)
        }) {
            activity.open = false;
            closed += 1;
        }
        Ok(closed)
    }

    fn post_message(
        &self,
        workflow: WorkflowId,
        to: UserId,
        subject: &str,
        body: &str,
    ) -> anyhow::Result<()> {
        self.check()?;
        self.outbox.lock().messages.push(Message {
            workflow,
            to,
            subject: subject.to_string(),
            body: body.to_string(),
            sent_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dismissal_is_scoped() {
        let messenger = MemoryMessenger::new();
        messenger
            .create_activity(1, 10, ActivityKind::SignatureRequired, "Firma requerida", "")
            .unwrap();
        messenger
            .create_activity(1, 11, ActivityKind::SignatureRequired, "Firma requerida", "")
            .unwrap();
        messenger
            .create_activity(2, 10, ActivityKind::SignatureRequired, "Firma requerida", "")
            .unwrap();

        assert_eq!(messenger.dismiss_activities(1, Some(10)).unwrap(), 1);
        assert_eq!(messenger.open_activities(1).len(), 1);
        assert_eq!(messenger.dismiss_activities(1, None).unwrap(), 1);
        assert!(messenger.open_activities(1).is_empty());
        assert_eq!(messenger.open_activities(2).len(), 1);
    }

    #[test]
    fn failure_toggle() {
        let messenger = MemoryMessenger::new();
        messenger.set_failing(true);
        assert!(messenger.post_message(1, 1, "a", "b").is_err());
        messenger.set_failing(false);
        messenger.post_message(1, 1, "a", "b").unwrap();
        assert_eq!(messenger.messages_for(1).len(), 1);
    }
}
