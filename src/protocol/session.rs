//! Jingle session state machine.
//!
//! Owns the contents of one session and is the only component that produces
//! outgoing requests. Contents and transports report changes through their
//! [`ContentPad`]; those reports, like every other deferred piece of work, go
//! through the session's task queue and are handled by
//! [`Session::run_pending`], never inside the call that caused them.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::message::{
    ContentElement, DescriptionElement, ErrorCondition, JingleRequest, OutgoingRequest,
    ProtocolError,
};
use super::pad::{ContentPad, Task};
use super::types::{
    Action, ApplicationState, Condition, ContentKey, Origin, Reason, SessionState, TransportState,
    Update,
};
use crate::application::{Application, ApplicationRegistry, Description, FileTransferFactory};
use crate::config::{Config, SessionConfig};
use crate::error::{JingleError, Result};
use crate::transport::{IbbTransportFactory, TransportRegistry};

/// Factories and limits shared by every session of an endpoint.
#[derive(Debug, Clone)]
pub struct SessionContext {
    applications: Arc<ApplicationRegistry>,
    transports: Arc<TransportRegistry>,
    config: SessionConfig,
}

impl SessionContext {
    /// Create a context from explicit registries
    pub fn new(
        applications: ApplicationRegistry,
        transports: TransportRegistry,
        config: SessionConfig,
    ) -> Self {
        Self {
            applications: Arc::new(applications),
            transports: Arc::new(transports),
            config,
        }
    }

    /// Context with the built-in file-transfer application and IBB
    /// transport, ordered by the configured transport preference.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let applications =
            ApplicationRegistry::new().with_factory(Arc::new(FileTransferFactory::new()))?;
        let mut transports = TransportRegistry::new()
            .with_factory(Arc::new(IbbTransportFactory::new(config.ibb.clone())))?;
        transports.prioritize(&config.transports.preference);
        Ok(Self::new(applications, transports, config.session.clone()))
    }

    /// Application factories
    pub fn applications(&self) -> &ApplicationRegistry {
        &self.applications
    }

    /// Transport factories
    pub fn transports(&self) -> &TransportRegistry {
        &self.transports
    }

    /// Session limits
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

/// Things a session reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Session state changed
    StateChanged(SessionState),
    /// Initiator: session-initiate acknowledged
    Initiated,
    /// Both sides agreed on the session
    Activated,
    /// Session finished
    Terminated(Option<Reason>),
    /// The peer offered contents (session-initiate or content-add)
    NewContentReceived(Vec<ContentKey>),
    /// A content's connection is established
    ContentActive(ContentKey),
    /// A content finished and was removed from the session
    ContentFinished {
        /// Content
        key: ContentKey,
        /// Why it finished
        reason: Option<Reason>,
    },
}

/// Serializable view of one content.
#[derive(Debug, Clone, Serialize)]
pub struct ContentSnapshot {
    /// Content key
    pub key: ContentKey,
    /// Application state
    pub state: ApplicationState,
    /// Who sends data
    pub senders: Origin,
    /// Description as it would be offered
    pub description: DescriptionElement,
    /// Current transport namespace
    pub transport: Option<String>,
    /// Current transport state
    pub transport_state: Option<TransportState>,
    /// Block size of the established connection
    pub block_size: Option<usize>,
}

/// Serializable view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// Session id
    pub sid: String,
    /// Local role
    pub role: Origin,
    /// Peer address
    pub peer: String,
    /// Session state
    pub state: SessionState,
    /// Termination reason, once decided
    pub reason: Option<Reason>,
    /// Contents
    pub contents: Vec<ContentSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sent {
    /// session-terminate; the session is already finished
    Terminate,
    /// Queued session-level update
    SessionUpdate,
    /// session-initiate or session-accept
    Gate,
    /// description-info
    Info,
    /// Batched per-content update
    Batch,
}

#[derive(Debug)]
struct InFlight {
    id: String,
    action: Action,
    keys: Vec<ContentKey>,
    kind: Sent,
}

/// Update not owned by any content, e.g. a content-reject for an offer that
/// could not be parsed.
#[derive(Debug)]
struct SessionUpdate {
    action: Action,
    contents: Vec<ContentElement>,
    reason: Option<Reason>,
    info: Option<serde_json::Value>,
}

/// One Jingle session
pub struct Session {
    sid: String,
    role: Origin,
    peer: String,
    state: SessionState,
    termination_reason: Option<Reason>,
    contents: BTreeMap<ContentKey, Application>,
    /// Contents to evaluate on the next step
    dirty: BTreeSet<ContentKey>,
    /// Contents carried by our session-initiate
    offered: BTreeSet<ContentKey>,
    session_updates: VecDeque<SessionUpdate>,
    waiting_ack: Option<InFlight>,
    step_scheduled: bool,
    tasks_tx: UnboundedSender<Task>,
    tasks_rx: UnboundedReceiver<Task>,
    events: VecDeque<SessionEvent>,
    outbox: VecDeque<OutgoingRequest>,
    last_error: Option<ProtocolError>,
    context: SessionContext,
}

impl Session {
    /// Create a session
    pub fn new(
        sid: impl Into<String>,
        role: Origin,
        peer: impl Into<String>,
        context: &SessionContext,
    ) -> Self {
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();
        Self {
            sid: sid.into(),
            role,
            peer: peer.into(),
            state: SessionState::Created,
            termination_reason: None,
            contents: BTreeMap::new(),
            dirty: BTreeSet::new(),
            offered: BTreeSet::new(),
            session_updates: VecDeque::new(),
            waiting_ack: None,
            step_scheduled: false,
            tasks_tx,
            tasks_rx,
            events: VecDeque::new(),
            outbox: VecDeque::new(),
            last_error: None,
            context: context.clone(),
        }
    }

    /// Session id
    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Local role
    pub fn role(&self) -> Origin {
        self.role
    }

    /// Peer role
    pub fn peer_role(&self) -> Origin {
        self.role.negate()
    }

    /// Peer address
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Check if the session is finished
    pub fn is_finished(&self) -> bool {
        self.state == SessionState::Finished
    }

    /// Termination reason, once decided
    pub fn termination_reason(&self) -> Option<&Reason> {
        self.termination_reason.as_ref()
    }

    /// Check if a request is waiting for its response
    pub fn has_request_in_flight(&self) -> bool {
        self.waiting_ack.is_some()
    }

    /// Last error returned by [`handle_request`](Session::handle_request)
    pub fn last_error(&self) -> Option<&ProtocolError> {
        self.last_error.as_ref()
    }

    /// Take the last error
    pub fn take_last_error(&mut self) -> Option<ProtocolError> {
        self.last_error.take()
    }

    /// Look up a content
    pub fn content(&self, name: &str, creator: Origin) -> Option<&Application> {
        self.contents.get(&ContentKey::new(name, creator))
    }

    /// Look up a content by key
    pub fn content_by_key(&self, key: &ContentKey) -> Option<&Application> {
        self.contents.get(key)
    }

    /// Look up a content by key, mutable
    pub fn content_mut(&mut self, key: &ContentKey) -> Option<&mut Application> {
        self.contents.get_mut(key)
    }

    /// All contents, ordered by key
    pub fn contents(&self) -> impl Iterator<Item = &Application> {
        self.contents.values()
    }

    /// Serializable view of the session
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            sid: self.sid.clone(),
            role: self.role,
            peer: self.peer.clone(),
            state: self.state,
            reason: self.termination_reason.clone(),
            contents: self
                .contents
                .values()
                .map(|app| ContentSnapshot {
                    key: app.key().clone(),
                    state: app.state(),
                    senders: app.senders(),
                    description: app.description().to_element(),
                    transport: app.transport().map(|t| t.namespace().to_string()),
                    transport_state: app.transport().map(|t| t.state()),
                    block_size: app.block_size(),
                })
                .collect(),
        }
    }

    fn pad(&self, key: ContentKey) -> ContentPad {
        ContentPad::new(&self.sid, self.role, key, self.tasks_tx.clone())
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::debug!(sid = %self.sid, from = ?self.state, to = ?state, "session state");
            self.state = state;
            self.events.push_back(SessionEvent::StateChanged(state));
        }
    }

    fn schedule_step(&mut self) {
        if !self.step_scheduled {
            self.step_scheduled = true;
            let _ = self.tasks_tx.send(Task::Step);
        }
    }

    // ------------------------------------------------------------------
    // Local intent
    // ------------------------------------------------------------------

    /// Allocate a local content. It is not part of the session until
    /// [`add_content`](Session::add_content) is called.
    pub fn new_content(
        &self,
        name: impl Into<String>,
        senders: Origin,
        description: Box<dyn Description>,
    ) -> Result<Application> {
        let key = ContentKey::new(name, self.role);
        if !self.context.applications.contains(description.namespace()) {
            return Err(JingleError::UnknownNamespace(description.namespace().to_string()));
        }
        if self.contents.contains_key(&key) {
            return Err(JingleError::DuplicateContent(key.to_string()));
        }
        let pad = self.pad(key);
        let selector = self.context.transports.selector(pad.clone());
        Ok(Application::new_local(pad, senders, description, selector))
    }

    /// Register a content allocated by [`new_content`](Session::new_content).
    pub fn add_content(&mut self, mut app: Application) -> Result<()> {
        if self.state >= SessionState::Finishing {
            return Err(JingleError::InvalidState(format!(
                "cannot add content to session in state {:?}",
                self.state
            )));
        }
        let key = app.key().clone();
        if key.creator != self.role || app.state() != ApplicationState::Created {
            return Err(JingleError::InvalidState(format!("{key} is not a new local content")));
        }
        if self.contents.contains_key(&key) {
            return Err(JingleError::DuplicateContent(key.to_string()));
        }
        if self.contents.len() >= self.context.config.max_contents {
            return Err(JingleError::InvalidState(format!(
                "session already has {} contents",
                self.contents.len()
            )));
        }
        if self.state >= SessionState::ApprovedToSend {
            app.prepare();
        }
        self.contents.insert(key.clone(), app);
        self.dirty.insert(key);
        self.schedule_step();
        Ok(())
    }

    /// Initiator: send session-initiate once every content is ready.
    pub fn initiate(&mut self) -> Result<()> {
        if self.role != Origin::Initiator || self.state != SessionState::Created {
            return Err(JingleError::InvalidState(format!(
                "initiate() as {} in state {:?}",
                self.role, self.state
            )));
        }
        self.approve()
    }

    /// Responder: accept the offered session.
    pub fn accept(&mut self) -> Result<()> {
        if self.role != Origin::Responder || self.state != SessionState::Created {
            return Err(JingleError::InvalidState(format!(
                "accept() as {} in state {:?}",
                self.role, self.state
            )));
        }
        if self.contents.is_empty() {
            return Err(JingleError::InvalidState("nothing to accept".into()));
        }
        self.approve()
    }

    fn approve(&mut self) -> Result<()> {
        self.set_state(SessionState::ApprovedToSend);
        for app in self.contents.values_mut() {
            app.prepare();
        }
        self.dirty.extend(self.contents.keys().cloned());
        self.schedule_step();
        Ok(())
    }

    /// Accept a content the peer added to a running session.
    pub fn accept_content(&mut self, key: &ContentKey) -> Result<()> {
        let role = self.role;
        let app = self
            .contents
            .get_mut(key)
            .ok_or_else(|| JingleError::InvalidState(format!("unknown content {key}")))?;
        if key.creator == role || app.state() != ApplicationState::Pending {
            return Err(JingleError::InvalidState(format!("{key} is not waiting for acceptance")));
        }
        app.prepare();
        self.dirty.insert(key.clone());
        self.schedule_step();
        Ok(())
    }

    /// Remove (or, for an unanswered peer offer, reject) a content.
    pub fn remove_content(&mut self, key: &ContentKey, reason: Reason) -> Result<()> {
        let app = self
            .contents
            .get_mut(key)
            .ok_or_else(|| JingleError::InvalidState(format!("unknown content {key}")))?;
        app.remove(reason);
        self.dirty.insert(key.clone());
        self.schedule_step();
        Ok(())
    }

    /// Send a session-info ping.
    pub fn send_ping(&mut self) -> Result<()> {
        if !matches!(self.state, SessionState::Pending | SessionState::Active) {
            return Err(JingleError::InvalidState(format!("cannot ping in state {:?}", self.state)));
        }
        self.session_updates.push_back(SessionUpdate {
            action: Action::SessionInfo,
            contents: Vec::new(),
            reason: None,
            info: None,
        });
        self.schedule_step();
        Ok(())
    }

    /// End the session.
    ///
    /// A session the peer has not heard of finishes immediately. Otherwise
    /// session-terminate becomes the next (and last) request.
    pub fn terminate(&mut self, reason: Reason) {
        match self.state {
            SessionState::Finishing | SessionState::Finished => {},
            SessionState::Created | SessionState::ApprovedToSend
                if self.role == Origin::Initiator =>
            {
                self.finish_session(Some(reason));
            },
            SessionState::Created if self.contents.is_empty() => self.finish_session(Some(reason)),
            _ => self.begin_termination(reason),
        }
    }

    fn begin_termination(&mut self, reason: Reason) {
        if self.state >= SessionState::Finishing {
            return;
        }
        tracing::info!(sid = %self.sid, %reason, "terminating session");
        self.termination_reason = Some(reason);
        self.set_state(SessionState::Finishing);
        self.schedule_step();
    }

    fn finish_session(&mut self, reason: Option<Reason>) {
        if self.state == SessionState::Finished {
            return;
        }
        if reason.is_some() {
            self.termination_reason = reason;
        }
        let reason = self
            .termination_reason
            .get_or_insert_with(|| Reason::new(Condition::Success))
            .clone();
        for app in self.contents.values_mut() {
            app.finish_with(Some(reason.clone()));
        }
        self.dirty.clear();
        self.session_updates.clear();
        self.set_state(SessionState::Finished);
        tracing::info!(sid = %self.sid, %reason, "session terminated");
        self.events.push_back(SessionEvent::Terminated(Some(reason)));
    }

    // ------------------------------------------------------------------
    // Driving
    // ------------------------------------------------------------------

    /// Process queued tasks until the session is idle.
    pub fn run_pending(&mut self) {
        loop {
            while let Ok(task) = self.tasks_rx.try_recv() {
                match task {
                    Task::Step => {
                        self.step_scheduled = false;
                        self.reap();
                        self.step();
                    },
                    Task::ContentUpdated(key) => self.content_updated(key),
                    Task::NewContent(keys) => {
                        self.events.push_back(SessionEvent::NewContentReceived(keys));
                    },
                }
            }
            if !self.reap() {
                break;
            }
        }
    }

    /// Next request to deliver to the peer.
    pub fn poll_transmit(&mut self) -> Option<OutgoingRequest> {
        self.run_pending();
        self.outbox.pop_front()
    }

    /// Next event for the owner.
    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.run_pending();
        self.events.pop_front()
    }

    fn content_updated(&mut self, key: ContentKey) {
        let Some(app) = self.contents.get_mut(&key) else {
            return;
        };
        if app.poll_transport() && app.state() == ApplicationState::Active {
            self.events.push_back(SessionEvent::ContentActive(key.clone()));
        }
        self.dirty.insert(key);
        self.schedule_step();
    }

    /// Drop finished contents. Returns true if anything was removed.
    fn reap(&mut self) -> bool {
        if self.state >= SessionState::Finishing {
            return false;
        }
        let finished: Vec<ContentKey> = self
            .contents
            .iter()
            .filter(|(_, app)| app.state() == ApplicationState::Finished)
            .map(|(key, _)| key.clone())
            .collect();
        if finished.is_empty() {
            return false;
        }

        let mut last_reason = None;
        for key in finished {
            if let Some(app) = self.contents.remove(&key) {
                let reason = app.termination_reason().cloned();
                tracing::debug!(sid = %self.sid, content = %key, ?reason, "content finished");
                self.dirty.remove(&key);
                self.offered.remove(&key);
                last_reason = reason.clone();
                self.events.push_back(SessionEvent::ContentFinished { key, reason });
            }
        }
        if self.contents.is_empty() {
            self.terminate(last_reason.unwrap_or_else(|| Reason::new(Condition::Success)));
        }
        true
    }

    fn send(&mut self, request: JingleRequest, kind: Sent, keys: Vec<ContentKey>) {
        let id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(
            sid = %self.sid,
            id = %id,
            action = %request.action,
            contents = request.contents.len(),
            "sending request"
        );
        self.waiting_ack = Some(InFlight {
            id: id.clone(),
            action: request.action,
            keys,
            kind,
        });
        self.outbox.push_back(OutgoingRequest { id, request });
    }

    fn step(&mut self) {
        if self.waiting_ack.is_some()
            || matches!(self.state, SessionState::Created | SessionState::Finished)
        {
            return;
        }

        if self.state == SessionState::Finishing {
            let reason = self.termination_reason.clone();
            let request =
                JingleRequest::new(Action::SessionTerminate, &self.sid).with_reason(reason.clone());
            self.send(request, Sent::Terminate, Vec::new());
            self.finish_session(reason);
            return;
        }

        if let Some(update) = self.session_updates.pop_front() {
            let mut request = JingleRequest::new(update.action, &self.sid)
                .with_contents(update.contents)
                .with_reason(update.reason);
            request.info = update.info;
            self.send(request, Sent::SessionUpdate, Vec::new());
            return;
        }

        match self.state {
            SessionState::ApprovedToSend => self.step_gate(),
            SessionState::Pending | SessionState::Active => {
                if !self.step_info() {
                    self.step_batch();
                }
            },
            _ => {},
        }
    }

    /// Initial offer/answer: all contents go out together or not at all.
    fn step_gate(&mut self) {
        let role = self.role;
        let mut keys = Vec::new();
        for (key, app) in &self.contents {
            let update = app.evaluate_outgoing_update();
            if role == Origin::Initiator {
                if update.action != Action::ContentAdd {
                    return;
                }
                keys.push(key.clone());
                continue;
            }
            if key.creator == role || app.state() >= ApplicationState::Accepted {
                continue;
            }
            match update.action {
                Action::ContentAccept => keys.push(key.clone()),
                Action::ContentReject => {
                    let text = update
                        .reason
                        .and_then(|r| r.text)
                        .unwrap_or_else(|| format!("content {key} rejected"));
                    tracing::warn!(sid = %self.sid, content = %key, "content refused before session-accept");
                    self.begin_termination(Reason::with_text(Condition::GeneralError, text));
                    return;
                },
                _ => return,
            }
        }
        if keys.is_empty() {
            return;
        }

        let mut elements = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(element) = self.contents.get_mut(key).and_then(|a| a.take_outgoing_update()) {
                elements.push(element);
            }
        }
        let action = if role == Origin::Initiator {
            self.offered = keys.iter().cloned().collect();
            Action::SessionInitiate
        } else {
            Action::SessionAccept
        };
        for key in &keys {
            self.dirty.remove(key);
        }
        self.set_state(SessionState::Unacked);
        let request = JingleRequest::new(action, &self.sid).with_contents(elements);
        self.send(request, Sent::Gate, keys);
    }

    /// description-info goes out alone.
    fn step_info(&mut self) -> bool {
        let key = self
            .contents
            .iter()
            .find(|(_, app)| app.has_info_update())
            .map(|(key, _)| key.clone());
        let Some(key) = key else {
            return false;
        };
        let Some(element) = self.contents.get_mut(&key).and_then(|a| a.take_info_update()) else {
            return false;
        };
        let request = JingleRequest::new(Action::DescriptionInfo, &self.sid).with_contents(vec![element]);
        self.send(request, Sent::Info, vec![key]);
        true
    }

    /// Batch every dirty content whose update has the winning priority.
    fn step_batch(&mut self) {
        let mut ready: Vec<(ContentKey, Update)> = Vec::new();
        let dirty: Vec<ContentKey> = self.dirty.iter().cloned().collect();
        for key in dirty {
            let update = self
                .contents
                .get(&key)
                .map_or(Update::NONE, |app| app.evaluate_outgoing_update());
            if update.is_none() {
                self.dirty.remove(&key);
            } else {
                ready.push((key, update));
            }
        }
        let Some(priority) = ready.iter().map(|(_, update)| update.priority()).min() else {
            return;
        };

        let mut keys = Vec::new();
        let mut elements = Vec::new();
        let mut reason = None;
        for (key, update) in ready {
            if update.priority() != priority {
                continue;
            }
            let Some(element) = self.contents.get_mut(&key).and_then(|a| a.take_outgoing_update())
            else {
                continue;
            };
            if reason.is_none() {
                reason = update.reason;
            }
            elements.push(element);
            self.dirty.remove(&key);
            keys.push(key);
        }
        if elements.is_empty() {
            return;
        }
        let request = JingleRequest::new(priority.0, &self.sid)
            .with_contents(elements)
            .with_reason(reason);
        self.send(request, Sent::Batch, keys);
    }

    /// Deliver the response to a request taken from
    /// [`poll_transmit`](Session::poll_transmit). Returns false if `id` does
    /// not match the request in flight.
    pub fn handle_response(&mut self, id: &str, result: std::result::Result<(), ProtocolError>) -> bool {
        if self.waiting_ack.as_ref().map_or(true, |f| f.id != id) {
            tracing::debug!(sid = %self.sid, id, "response for unknown request");
            return false;
        }
        let Some(in_flight) = self.waiting_ack.take() else {
            return false;
        };
        if self.state == SessionState::Finished {
            return true;
        }

        match result {
            Ok(()) => self.on_request_acked(in_flight),
            Err(err) if err.is_tie_break() && in_flight.kind == Sent::Batch => {
                tracing::info!(sid = %self.sid, action = %in_flight.action, "tie-break, retrying");
                for key in in_flight.keys {
                    if let Some(app) = self.contents.get_mut(&key) {
                        app.on_tie_break();
                    }
                    self.dirty.insert(key);
                }
            },
            Err(err) => {
                tracing::warn!(sid = %self.sid, action = %in_flight.action, error = %err, "request failed");
                self.fail(&err);
            },
        }
        self.schedule_step();
        true
    }

    fn on_request_acked(&mut self, in_flight: InFlight) {
        match in_flight.kind {
            Sent::Terminate | Sent::SessionUpdate | Sent::Info => {},
            Sent::Gate => {
                for key in &in_flight.keys {
                    if let Some(app) = self.contents.get_mut(key) {
                        app.on_acknowledged();
                    }
                }
                if self.state == SessionState::Unacked {
                    if self.role == Origin::Initiator {
                        self.set_state(SessionState::Pending);
                        tracing::info!(sid = %self.sid, peer = %self.peer, "session initiated");
                        self.events.push_back(SessionEvent::Initiated);
                    } else {
                        self.set_state(SessionState::Active);
                        tracing::info!(sid = %self.sid, peer = %self.peer, "session active");
                        self.events.push_back(SessionEvent::Activated);
                    }
                }
                self.dirty.extend(self.contents.keys().cloned());
            },
            Sent::Batch => {
                for key in in_flight.keys {
                    if let Some(app) = self.contents.get_mut(&key) {
                        app.on_acknowledged();
                    }
                    self.dirty.insert(key);
                }
            },
        }
    }

    /// A request of ours was refused: the two views of the session diverged.
    fn fail(&mut self, err: &ProtocolError) {
        let reason = Reason::with_text(Condition::GeneralError, err.to_string());
        let peer_knows = self.role == Origin::Responder || self.state >= SessionState::Pending;
        if peer_knows {
            self.begin_termination(reason);
        } else {
            self.finish_session(Some(reason));
        }
    }

    // ------------------------------------------------------------------
    // Incoming requests
    // ------------------------------------------------------------------

    /// Apply a request from the peer. An `Err` must be answered with that
    /// error; nothing was applied in that case.
    pub fn handle_request(&mut self, request: &JingleRequest) -> std::result::Result<(), ProtocolError> {
        tracing::debug!(
            sid = %self.sid,
            action = %request.action,
            contents = request.contents.len(),
            "incoming request"
        );
        let result = self.dispatch(request);
        match &result {
            Ok(()) => self.schedule_step(),
            Err(err) => {
                tracing::warn!(sid = %self.sid, action = %request.action, error = %err, "refusing request");
                self.last_error = Some(err.clone());
            },
        }
        result
    }

    /// Responder: apply the session-initiate that created this session.
    pub fn incoming_initiate(&mut self, request: &JingleRequest) -> std::result::Result<(), ProtocolError> {
        if request.action != Action::SessionInitiate {
            return Err(ProtocolError::bad_request(format!(
                "{} is not session-initiate",
                request.action
            )));
        }
        self.handle_request(request)
    }

    fn dispatch(&mut self, request: &JingleRequest) -> std::result::Result<(), ProtocolError> {
        if request.sid != self.sid || self.state == SessionState::Finished {
            return Err(ProtocolError::with_text(ErrorCondition::UnknownSession, request.sid.clone()));
        }
        if self.state == SessionState::Finishing && request.action != Action::SessionTerminate {
            return Err(ProtocolError::unexpected("session is terminating"));
        }

        match request.action {
            Action::SessionInitiate => self.on_session_initiate(request),
            Action::SessionAccept => self.on_session_accept(request),
            Action::SessionTerminate => {
                let reason = request
                    .reason
                    .clone()
                    .unwrap_or_else(|| Reason::new(Condition::Success));
                self.finish_session(Some(reason));
                Ok(())
            },
            Action::SessionInfo => match &request.info {
                None | Some(serde_json::Value::Null) => Ok(()),
                Some(serde_json::Value::Object(map)) if map.is_empty() => Ok(()),
                Some(_) => Err(ProtocolError::new(ErrorCondition::UnsupportedInfo)),
            },
            Action::ContentAdd => self.on_content_add(request),
            Action::ContentAccept => self.on_content_accept(request),
            Action::ContentReject | Action::ContentRemove => self.on_content_remove(request),
            Action::ContentModify => self.for_each_content(request, |app, element| {
                let senders = element
                    .senders
                    .ok_or_else(|| ProtocolError::bad_request("content-modify without senders"))?;
                app.set_senders(senders);
                Ok(())
            }),
            Action::TransportInfo => {
                self.for_each_content(request, Application::incoming_transport_info)
            },
            Action::TransportReplace => self.on_transport_replace(request),
            Action::TransportAccept => {
                self.for_each_content(request, Application::incoming_transport_accept)
            },
            Action::TransportReject => {
                self.for_each_content(request, Application::incoming_transport_reject)
            },
            Action::DescriptionInfo => {
                self.for_each_content(request, Application::incoming_description_info)
            },
            Action::SecurityInfo => Err(ProtocolError::new(ErrorCondition::FeatureNotImplemented)),
            Action::NoAction => Err(ProtocolError::bad_request("no action")),
        }
    }

    fn check_known(&self, request: &JingleRequest) -> std::result::Result<(), ProtocolError> {
        if request.contents.is_empty() {
            return Err(ProtocolError::bad_request(format!("{} without content", request.action)));
        }
        for element in &request.contents {
            let key = element.key();
            if !self.contents.contains_key(&key) {
                return Err(ProtocolError::item_not_found(key.to_string()));
            }
        }
        Ok(())
    }

    fn for_each_content<F>(&mut self, request: &JingleRequest, mut apply: F) -> std::result::Result<(), ProtocolError>
    where
        F: FnMut(&mut Application, &ContentElement) -> std::result::Result<(), ProtocolError>,
    {
        self.check_known(request)?;
        for element in &request.contents {
            let key = element.key();
            if let Some(app) = self.contents.get_mut(&key) {
                apply(app, element)?;
            }
            self.dirty.insert(key);
        }
        Ok(())
    }

    /// Structural checks on a peer offer (session-initiate/content-add).
    fn check_offer(&self, element: &ContentElement) -> std::result::Result<(), ProtocolError> {
        let key = element.key();
        if key.creator != self.peer_role() {
            return Err(ProtocolError::bad_request(format!("{key}: wrong creator")));
        }
        if element.description.is_none() || element.transport.is_none() {
            return Err(ProtocolError::bad_request(format!(
                "{key}: description and transport are required"
            )));
        }
        if self.contents.contains_key(&key) {
            return Err(ProtocolError::with_text(ErrorCondition::Conflict, key.to_string()));
        }
        Ok(())
    }

    fn build_incoming(&self, element: &ContentElement) -> std::result::Result<Application, Reason> {
        let key = element.key();
        let (Some(description), Some(offer)) = (element.description.as_ref(), element.transport.as_ref())
        else {
            return Err(Reason::new(Condition::GeneralError));
        };
        let factory = self.context.applications.get(&description.namespace).ok_or_else(|| {
            Reason::with_text(Condition::UnsupportedApplications, description.namespace.clone())
        })?;
        let description = factory.incoming(&key, description)?;
        let transports = self.context.transports.get(&offer.namespace).ok_or_else(|| {
            Reason::with_text(Condition::UnsupportedTransports, offer.namespace.clone())
        })?;
        let pad = self.pad(key.clone());
        let transport = transports.new_transport(pad.clone(), key.creator, Some(offer))?;
        let selector = self.context.transports.selector(pad.clone());
        Application::new_incoming(
            pad,
            element.senders.unwrap_or(Origin::Both),
            description,
            transport,
            selector,
        )
    }

    /// Build applications for a peer offer. Unsupported contents are
    /// returned with the reason to reject them; duplicates keep the one with
    /// the better transport.
    #[allow(clippy::type_complexity)]
    fn parse_offers(
        &self,
        elements: &[ContentElement],
    ) -> std::result::Result<(BTreeMap<ContentKey, Application>, Vec<(ContentKey, Reason)>), ProtocolError> {
        if elements.is_empty() {
            return Err(ProtocolError::bad_request("offer without content"));
        }
        for element in elements {
            self.check_offer(element)?;
        }

        let mut accepted: BTreeMap<ContentKey, Application> = BTreeMap::new();
        let mut rejected = Vec::new();
        for element in elements {
            let key = element.key();
            match self.build_incoming(element) {
                Ok(app) => {
                    let better = match (accepted.get(&key), app.transport()) {
                        (Some(existing), Some(transport)) => existing.wants_better_transport(transport),
                        _ => true,
                    };
                    if better {
                        accepted.insert(key, app);
                    } else {
                        tracing::debug!(sid = %self.sid, content = %key, "duplicate content dropped");
                    }
                },
                Err(reason) => {
                    tracing::warn!(sid = %self.sid, content = %key, %reason, "unsupported content");
                    rejected.push((key, reason));
                },
            }
        }
        rejected.retain(|(key, _)| !accepted.contains_key(key));
        Ok((accepted, rejected))
    }

    fn register_incoming(&mut self, apps: BTreeMap<ContentKey, Application>) {
        if apps.is_empty() {
            return;
        }
        let keys: Vec<ContentKey> = apps.keys().cloned().collect();
        self.contents.extend(apps);
        // observers hear about new content on the next tick
        let _ = self.tasks_tx.send(Task::NewContent(keys));
    }

    fn on_session_initiate(&mut self, request: &JingleRequest) -> std::result::Result<(), ProtocolError> {
        if self.role != Origin::Responder
            || self.state != SessionState::Created
            || !self.contents.is_empty()
        {
            return Err(ProtocolError::unexpected("session already initiated"));
        }
        let (mut accepted, rejected) = self.parse_offers(&request.contents)?;
        let max = self.context.config.max_contents;
        while accepted.len() > max {
            accepted.pop_last();
        }
        if accepted.is_empty() {
            let reason = rejected
                .into_iter()
                .next()
                .map_or_else(|| Reason::new(Condition::UnsupportedApplications), |(_, r)| r);
            self.begin_termination(reason);
            return Ok(());
        }
        self.register_incoming(accepted);
        Ok(())
    }

    fn on_content_add(&mut self, request: &JingleRequest) -> std::result::Result<(), ProtocolError> {
        if self.role == Origin::Initiator && self.state < SessionState::Pending {
            return Err(ProtocolError::new(ErrorCondition::OutOfOrder));
        }
        let (mut accepted, mut rejected) = self.parse_offers(&request.contents)?;
        let room = self.context.config.max_contents.saturating_sub(self.contents.len());
        while accepted.len() > room {
            if let Some((key, _)) = accepted.pop_last() {
                rejected.push((key, Reason::with_text(Condition::Decline, "too many contents")));
            }
        }
        for (key, reason) in rejected {
            self.session_updates.push_back(SessionUpdate {
                action: Action::ContentReject,
                contents: vec![ContentElement::new(&key)],
                reason: Some(reason),
                info: None,
            });
        }
        self.register_incoming(accepted);
        Ok(())
    }

    /// Validate every accept first, then apply; a failure while applying
    /// rolls back the contents already accepted in this batch.
    fn apply_accepts(&mut self, elements: &[ContentElement]) -> std::result::Result<Vec<ContentKey>, ProtocolError> {
        if elements.is_empty() {
            return Err(ProtocolError::bad_request("accept without content"));
        }
        // nothing is applied until every element checks out
        let mut seen = BTreeSet::new();
        for element in elements {
            let key = element.key();
            let app = self
                .contents
                .get(&key)
                .ok_or_else(|| ProtocolError::item_not_found(key.to_string()))?;
            app.check_accept(element)?;
            if !seen.insert(key) {
                return Err(ProtocolError::bad_request("content answered twice"));
            }
        }

        let mut applied = Vec::new();
        for element in elements {
            let key = element.key();
            let outcome = self.contents.get_mut(&key).map(|app| app.apply_accept(element));
            match outcome {
                Some(Ok(true)) => applied.push(key),
                Some(Ok(false)) | None => {},
                Some(Err(err)) => {
                    for key in &applied {
                        if let Some(app) = self.contents.get_mut(key) {
                            app.rollback_accept();
                        }
                    }
                    return Err(err);
                },
            }
        }
        Ok(applied)
    }

    fn start_accepted(&mut self, keys: Vec<ContentKey>) {
        for key in keys {
            if let Some(app) = self.contents.get_mut(&key) {
                app.start();
            }
            self.dirty.insert(key);
        }
    }

    fn on_session_accept(&mut self, request: &JingleRequest) -> std::result::Result<(), ProtocolError> {
        if self.role != Origin::Initiator {
            return Err(ProtocolError::unexpected("session-accept sent to the responder"));
        }
        match self.state {
            SessionState::Unacked => return Err(ProtocolError::new(ErrorCondition::OutOfOrder)),
            SessionState::Pending | SessionState::Active => {},
            _ => return Err(ProtocolError::unexpected("session was not initiated")),
        }
        let applied = self.apply_accepts(&request.contents)?;
        self.start_accepted(applied);

        if self.state == SessionState::Pending {
            // offered contents the responder left out were dropped by it
            let answered: BTreeSet<ContentKey> = request.contents.iter().map(|e| e.key()).collect();
            for key in std::mem::take(&mut self.offered) {
                if answered.contains(&key) {
                    continue;
                }
                if let Some(app) = self.contents.get_mut(&key) {
                    if app.state() == ApplicationState::Pending {
                        app.finish_with(Some(Reason::new(Condition::Decline)));
                    }
                }
            }
            self.set_state(SessionState::Active);
            tracing::info!(sid = %self.sid, peer = %self.peer, "session active");
            self.events.push_back(SessionEvent::Activated);
        }
        Ok(())
    }

    fn on_content_accept(&mut self, request: &JingleRequest) -> std::result::Result<(), ProtocolError> {
        let applied = self.apply_accepts(&request.contents)?;
        self.start_accepted(applied);
        Ok(())
    }

    fn on_content_remove(&mut self, request: &JingleRequest) -> std::result::Result<(), ProtocolError> {
        self.check_known(request)?;
        if request.action == Action::ContentReject {
            if let Some(element) = request.contents.iter().find(|e| e.creator != self.role) {
                return Err(ProtocolError::unexpected(format!(
                    "{} was not offered by us",
                    element.key()
                )));
            }
        }
        let reason = request
            .reason
            .clone()
            .unwrap_or_else(|| Reason::new(Condition::Success));
        for element in &request.contents {
            let key = element.key();
            if let Some(app) = self.contents.get_mut(&key) {
                app.finish_with(Some(reason.clone()));
            }
            self.dirty.remove(&key);
        }
        Ok(())
    }

    fn on_transport_replace(&mut self, request: &JingleRequest) -> std::result::Result<(), ProtocolError> {
        self.check_known(request)?;
        if let Some(element) = request.contents.iter().find(|e| e.transport.is_none()) {
            return Err(ProtocolError::bad_request(format!(
                "{}: transport-replace without transport",
                element.key()
            )));
        }
        if self.role == Origin::Initiator {
            let conflict = request.contents.iter().find(|element| {
                self.contents
                    .get(&element.key())
                    .is_some_and(Application::has_unacked_transport_replace)
            });
            if let Some(element) = conflict {
                tracing::info!(sid = %self.sid, content = %element.key(), "transport-replace tie-break");
                return Err(ProtocolError::with_text(
                    ErrorCondition::TieBreak,
                    element.key().to_string(),
                ));
            }
        }

        let peer_role = self.peer_role();
        for element in &request.contents {
            let key = element.key();
            let Some(offer) = element.transport.as_ref() else {
                continue;
            };
            let transport = self.context.transports.get(&offer.namespace).and_then(|factory| {
                factory
                    .new_transport(self.pad(key.clone()), peer_role, Some(offer))
                    .map_err(|reason| {
                        tracing::debug!(sid = %self.sid, content = %key, %reason, "offered transport unusable");
                    })
                    .ok()
            });
            if let Some(app) = self.contents.get_mut(&key) {
                app.incoming_transport_replace(offer, transport)?;
            }
            self.dirty.insert(key);
        }
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("sid", &self.sid)
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("contents", &self.contents.values().collect::<Vec<_>>())
            .field("waiting_ack", &self.waiting_ack.as_ref().map(|f| f.action))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::{FileMeta, FileTransfer};

    fn context() -> SessionContext {
        SessionContext::from_config(&Config::default()).unwrap()
    }

    fn initiator_with_content() -> Session {
        let mut session = Session::new("s1", Origin::Initiator, "bob", &context());
        let app = session
            .new_content("ft", Origin::Initiator, Box::new(FileTransfer::offer(FileMeta::new("a", 1))))
            .unwrap();
        session.add_content(app).unwrap();
        session
    }

    #[test]
    fn test_terminate_before_anything_was_sent() {
        let mut session = initiator_with_content();
        session.terminate(Reason::new(Condition::Cancel));

        assert!(session.is_finished());
        assert!(session.poll_transmit().is_none());
        assert!(session
            .contents()
            .all(|app| app.state() == ApplicationState::Finished));
        let events: Vec<_> = std::iter::from_fn(|| session.poll_event()).collect();
        assert!(events.contains(&SessionEvent::Terminated(Some(Reason::new(Condition::Cancel)))));
    }

    #[test]
    fn test_only_one_request_in_flight() {
        let mut session = initiator_with_content();
        session.initiate().unwrap();

        let first = session.poll_transmit().unwrap();
        assert_eq!(first.request.action, Action::SessionInitiate);
        assert_eq!(session.state(), SessionState::Unacked);
        session.send_ping().unwrap_err();
        assert!(session.poll_transmit().is_none());

        assert!(!session.handle_response("other", Ok(())));
        assert!(session.handle_response(&first.id, Ok(())));
        assert_eq!(session.state(), SessionState::Pending);
        assert!(session.poll_transmit().is_none());
    }

    #[test]
    fn test_refused_initiate_finishes_without_terminate() {
        let mut session = initiator_with_content();
        session.initiate().unwrap();
        let out = session.poll_transmit().unwrap();
        session.handle_response(&out.id, Err(ProtocolError::bad_request("no")));

        assert!(session.is_finished());
        assert!(session.poll_transmit().is_none());
        assert_eq!(
            session.termination_reason().map(|r| r.condition),
            Some(Condition::GeneralError)
        );
    }

    #[test]
    fn test_request_errors() {
        let mut session = initiator_with_content();
        let wrong_sid = JingleRequest::new(Action::SessionInfo, "nope");
        let err = session.handle_request(&wrong_sid).unwrap_err();
        assert_eq!(err.condition, ErrorCondition::UnknownSession);

        let security = JingleRequest::new(Action::SecurityInfo, "s1");
        let err = session.handle_request(&security).unwrap_err();
        assert_eq!(err.condition, ErrorCondition::FeatureNotImplemented);
        assert_eq!(session.take_last_error(), Some(err));
        assert!(session.last_error().is_none());

        let unknown = JingleRequest::new(Action::TransportInfo, "s1")
            .with_contents(vec![ContentElement::new(&ContentKey::new("x", Origin::Responder))]);
        let err = session.handle_request(&unknown).unwrap_err();
        assert_eq!(err.condition, ErrorCondition::ItemNotFound);
    }

    #[test]
    fn test_content_api_checks() {
        let session = initiator_with_content();
        let dup = session.new_content("ft", Origin::Both, Box::new(FileTransfer::offer(FileMeta::new("b", 1))));
        assert!(matches!(dup, Err(JingleError::DuplicateContent(_))));

        let empty = SessionContext::new(
            ApplicationRegistry::new(),
            TransportRegistry::new(),
            SessionConfig::default(),
        );
        let bare = Session::new("s2", Origin::Initiator, "bob", &empty);
        let unknown = bare.new_content("ft", Origin::Both, Box::new(FileTransfer::offer(FileMeta::new("b", 1))));
        assert!(matches!(unknown, Err(JingleError::UnknownNamespace(_))));
    }

    #[test]
    fn test_content_without_transport_is_dropped() {
        let context = SessionContext::new(
            ApplicationRegistry::new()
                .with_factory(Arc::new(FileTransferFactory::new()))
                .unwrap(),
            TransportRegistry::new(),
            SessionConfig::default(),
        );
        let mut session = Session::new("s3", Origin::Initiator, "bob", &context);
        let app = session
            .new_content("ft", Origin::Initiator, Box::new(FileTransfer::offer(FileMeta::new("a", 1))))
            .unwrap();
        session.add_content(app).unwrap();
        session.initiate().unwrap();

        // the only content failed, so the session has nothing left to offer
        assert!(session.poll_transmit().is_none());
        assert!(session.is_finished());
    }

    #[test]
    fn test_snapshot_serializes() {
        let session = initiator_with_content();
        let json = serde_json::to_value(session.snapshot()).unwrap();
        assert_eq!(json["state"], "created");
        assert_eq!(json["contents"][0]["key"]["name"], "ft");
    }
}
