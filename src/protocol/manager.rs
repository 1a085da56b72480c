//! Session routing for one local endpoint.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use super::message::{ErrorCondition, JingleRequest, OutgoingRequest, ProtocolError};
use super::session::{Session, SessionContext, SessionEvent};
use super::types::{Action, Origin};
use crate::error::{JingleError, Result};

/// Outgoing request addressed to a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Transmit {
    /// Peer address
    pub peer: String,
    /// Session the request belongs to
    pub sid: String,
    /// Request with its correlation id
    pub request: OutgoingRequest,
}

/// Owns every session of an endpoint, keyed by sid.
///
/// Creates a responder session for each incoming session-initiate and drops
/// finished sessions on the tick after they finish, so their final events and
/// session-terminate still reach the owner.
#[derive(Debug)]
pub struct SessionManager {
    context: SessionContext,
    sessions: BTreeMap<String, Session>,
    /// Request id -> sid, for routing responses
    pending: HashMap<String, String>,
    outbox: VecDeque<Transmit>,
    events: VecDeque<(String, SessionEvent)>,
    finished: BTreeSet<String>,
}

impl SessionManager {
    /// Create a manager
    pub fn new(context: SessionContext) -> Self {
        Self {
            context,
            sessions: BTreeMap::new(),
            pending: HashMap::new(),
            outbox: VecDeque::new(),
            events: VecDeque::new(),
            finished: BTreeSet::new(),
        }
    }

    /// Shared factories and limits
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Create an initiator session with `peer` and return its sid.
    pub fn new_session(&mut self, peer: impl Into<String>) -> String {
        let sid = uuid::Uuid::new_v4().simple().to_string();
        let peer = peer.into();
        tracing::debug!(sid = %sid, peer = %peer, "new session");
        self.sessions
            .insert(sid.clone(), Session::new(sid.clone(), Origin::Initiator, peer, &self.context));
        sid
    }

    /// Look up a session
    pub fn session(&self, sid: &str) -> Option<&Session> {
        self.sessions.get(sid)
    }

    /// Look up a session, mutable
    pub fn session_mut(&mut self, sid: &str) -> Option<&mut Session> {
        self.sessions.get_mut(sid)
    }

    /// Look up a session or fail with [`JingleError::UnknownSession`]
    pub fn require(&mut self, sid: &str) -> Result<&mut Session> {
        self.sessions
            .get_mut(sid)
            .ok_or_else(|| JingleError::UnknownSession(sid.to_string()))
    }

    /// Sids of live sessions
    pub fn sids(&self) -> impl Iterator<Item = &str> {
        self.sessions.keys().map(String::as_str)
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if there are no sessions
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Route a request from `peer`. An `Err` must be sent back as the
    /// response.
    pub fn handle_request(
        &mut self,
        peer: &str,
        request: &JingleRequest,
    ) -> std::result::Result<(), ProtocolError> {
        if let Some(session) = self.sessions.get_mut(&request.sid) {
            if session.peer() != peer {
                tracing::warn!(sid = %request.sid, peer, "request from a different peer");
                return Err(ProtocolError::with_text(ErrorCondition::UnknownSession, request.sid.clone()));
            }
            return session.handle_request(request);
        }

        if request.action != Action::SessionInitiate {
            return Err(ProtocolError::with_text(ErrorCondition::UnknownSession, request.sid.clone()));
        }
        let mut session = Session::new(request.sid.clone(), Origin::Responder, peer, &self.context);
        session.incoming_initiate(request)?;
        tracing::info!(sid = %request.sid, peer, "incoming session");
        self.sessions.insert(request.sid.clone(), session);
        Ok(())
    }

    /// Route a response. Returns false if no session waits for `id`.
    pub fn handle_response(&mut self, id: &str, result: std::result::Result<(), ProtocolError>) -> bool {
        let Some(sid) = self.pending.remove(id) else {
            return false;
        };
        self.sessions
            .get_mut(&sid)
            .is_some_and(|session| session.handle_response(id, result))
    }

    /// Tick every session and collect what they produced.
    pub fn run_pending(&mut self) {
        for sid in std::mem::take(&mut self.finished) {
            if self.sessions.remove(&sid).is_some() {
                tracing::debug!(sid = %sid, "session dropped");
            }
            self.pending.retain(|_, owner| *owner != sid);
        }

        for (sid, session) in &mut self.sessions {
            while let Some(request) = session.poll_transmit() {
                self.pending.insert(request.id.clone(), sid.clone());
                self.outbox.push_back(Transmit {
                    peer: session.peer().to_string(),
                    sid: sid.clone(),
                    request,
                });
            }
            while let Some(event) = session.poll_event() {
                self.events.push_back((sid.clone(), event));
            }
            if session.is_finished() {
                self.finished.insert(sid.clone());
            }
        }
    }

    /// Next request to deliver.
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        if self.outbox.is_empty() {
            self.run_pending();
        }
        self.outbox.pop_front()
    }

    /// Next event, tagged with its sid.
    pub fn poll_event(&mut self) -> Option<(String, SessionEvent)> {
        if self.events.is_empty() {
            self.run_pending();
        }
        self.events.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::{FileMeta, FileTransfer};
    use crate::config::Config;
    use crate::protocol::SessionState;

    fn manager() -> SessionManager {
        SessionManager::new(SessionContext::from_config(&Config::default()).unwrap())
    }

    #[test]
    fn test_unknown_sid_is_refused() {
        let mut mgr = manager();
        let err = mgr
            .handle_request("alice", &JingleRequest::new(Action::TransportInfo, "nope"))
            .unwrap_err();
        assert_eq!(err.condition, ErrorCondition::UnknownSession);
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_initiate_creates_responder_session() {
        let mut alice = manager();
        let mut bob = manager();

        let sid = alice.new_session("bob");
        let session = alice.require(&sid).unwrap();
        let app = session
            .new_content("ft", Origin::Initiator, Box::new(FileTransfer::offer(FileMeta::new("a", 3))))
            .unwrap();
        session.add_content(app).unwrap();
        session.initiate().unwrap();

        let out = alice.poll_transmit().unwrap();
        assert_eq!(out.peer, "bob");
        assert_eq!(out.request.request.action, Action::SessionInitiate);
        bob.handle_request("alice", &out.request.request).unwrap();
        assert_eq!(bob.session(&sid).unwrap().role(), Origin::Responder);

        // same sid from someone else
        let err = bob.handle_request("mallory", &out.request.request).unwrap_err();
        assert_eq!(err.condition, ErrorCondition::UnknownSession);

        assert!(alice.handle_response(&out.request.id, Ok(())));
        assert!(!alice.handle_response(&out.request.id, Ok(())));
        alice.run_pending();
        assert_eq!(alice.session(&sid).unwrap().state(), SessionState::Pending);
    }

    #[test]
    fn test_finished_session_dropped_next_tick() {
        let mut mgr = manager();
        let sid = mgr.new_session("bob");
        mgr.require(&sid)
            .unwrap()
            .terminate(crate::protocol::Reason::new(crate::protocol::Condition::Cancel));

        let (event_sid, _) = mgr.poll_event().unwrap();
        assert_eq!(event_sid, sid);
        assert!(mgr.session(&sid).is_some());
        while mgr.poll_event().is_some() {}
        mgr.run_pending();
        assert!(mgr.session(&sid).is_none());
    }
}
