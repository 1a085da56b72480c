//! Handles that let contents and transports reach their session.
//!
//! A session owns a single-consumer task queue. Applications, descriptions
//! and transports only ever hold the sending half (inside a [`ContentPad`]),
//! so a notification is always queued and processed on a later tick, never
//! run inside the caller. Once the session is dropped the sends are silently
//! discarded.

use tokio::sync::mpsc::UnboundedSender;

use super::types::{ContentKey, Origin};

/// Work item processed by a session tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Task {
    /// Run one outgoing step
    Step,
    /// A content (or its transport) changed and must be re-evaluated
    ContentUpdated(ContentKey),
    /// Contents were added by the peer; tell observers
    NewContent(Vec<ContentKey>),
}

/// Per-content lookup handle into the owning session.
#[derive(Debug, Clone)]
pub struct ContentPad {
    sid: String,
    role: Origin,
    key: ContentKey,
    tasks: UnboundedSender<Task>,
}

impl ContentPad {
    pub(crate) fn new(sid: &str, role: Origin, key: ContentKey, tasks: UnboundedSender<Task>) -> Self {
        Self {
            sid: sid.to_string(),
            role,
            key,
            tasks,
        }
    }

    /// Session id
    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Local role in the session
    pub fn role(&self) -> Origin {
        self.role
    }

    /// Peer role in the session
    pub fn peer_role(&self) -> Origin {
        self.role.negate()
    }

    /// Content this pad belongs to
    pub fn key(&self) -> &ContentKey {
        &self.key
    }

    /// Ask the session to re-evaluate this content on its next tick.
    pub fn notify_updated(&self) {
        // Session gone: nothing left to notify.
        let _ = self.tasks.send(Task::ContentUpdated(self.key.clone()));
    }

    /// Check if the owning session still exists
    pub fn is_attached(&self) -> bool {
        !self.tasks.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_notify_is_queued() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let key = ContentKey::new("ft", Origin::Initiator);
        let pad = ContentPad::new("sid", Origin::Initiator, key.clone(), tx);

        pad.notify_updated();
        assert_eq!(rx.try_recv().unwrap(), Task::ContentUpdated(key));
        assert_eq!(pad.peer_role(), Origin::Responder);
    }

    #[test]
    fn test_detached_pad_is_silent() {
        let (tx, rx) = mpsc::unbounded_channel();
        let pad = ContentPad::new("sid", Origin::Responder, ContentKey::new("x", Origin::Initiator), tx);
        drop(rx);
        assert!(!pad.is_attached());
        pad.notify_updated();
    }
}
