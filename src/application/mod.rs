//! Per-content application state machine.
//!
//! An [`Application`] is one negotiated content: the *what* (a pluggable
//! [`Description`], e.g. a file transfer) paired with the *how* (an owned
//! [`Transport`] picked by a [`TransportSelector`]).
//!
//! The base machine is shared by every application kind, so the rules that
//! must hold for all of them live here rather than in the plug-ins:
//!
//! - outgoing updates are computed by a side-effect free
//!   [`evaluate_outgoing_update`](Application::evaluate_outgoing_update) and
//!   committed by [`take_outgoing_update`](Application::take_outgoing_update);
//! - state only advances when the committed update is acknowledged
//!   ([`on_acknowledged`](Application::on_acknowledged)), except for removing
//!   content the peer never heard of;
//! - a finished application closes its connection and transport and never
//!   proposes anything again.
//!
//! # Transport replacement
//!
//! ```text
//!   set_transport (peer knows content)      take: transport-replace
//!   None ──────────────────────────────> InProgress ──────────────> NeedAck
//!    ^                                      ^   │                      │ ack
//!    │ transport-accept received            │   └──────────────────────┘
//!    └──────────────────────────────────────┘      (waiting for accept)
//! ```

pub mod file_transfer;

pub use file_transfer::{FileMeta, FileTransfer, FileTransferFactory, FILE_TRANSFER_NS};

use std::any::Any;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{JingleError, Result};
use crate::protocol::{
    Action, ApplicationState, Condition, ContentElement, ContentKey, ContentPad, DescriptionElement,
    ErrorCondition, Origin, PendingTransportReplace, ProtocolError, Reason, TransportElement,
    TransportState, Update,
};
use crate::transport::{Connection, Transport, TransportSelector};

/// Application-specific part of a content (the `<description/>`).
pub trait Description: Send {
    /// Application namespace
    fn namespace(&self) -> &str;

    /// Description sent in content-add/session-initiate or in the answer.
    fn to_element(&self) -> DescriptionElement;

    /// Check the peer's answer to our offer. Must not change anything; the
    /// answer may still be refused as part of a larger accept.
    fn accept_remote(&self, _element: &DescriptionElement) -> std::result::Result<(), Reason> {
        Ok(())
    }

    /// Apply a description-info payload from the peer.
    fn handle_info(&mut self, _payload: &serde_json::Value) -> std::result::Result<(), ProtocolError> {
        Err(ProtocolError::new(ErrorCondition::UnsupportedInfo))
    }

    /// Check if a description-info must be sent
    fn has_info_update(&self) -> bool {
        false
    }

    /// Take the pending description-info payload.
    fn take_info_update(&mut self) -> Option<serde_json::Value> {
        None
    }

    /// Called once the content's connection is established.
    fn on_connected(&mut self, _block_size: usize) {}

    /// Downcast support
    fn as_any(&self) -> &dyn Any;

    /// Downcast support
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Creates descriptions for one application namespace.
pub trait ApplicationFactory: Send + Sync {
    /// Application namespace
    fn namespace(&self) -> &str;

    /// Build the description for a content offered by the peer.
    fn incoming(
        &self,
        key: &ContentKey,
        element: &DescriptionElement,
    ) -> std::result::Result<Box<dyn Description>, Reason>;
}

/// Namespace → application factory lookup.
#[derive(Clone, Default)]
pub struct ApplicationRegistry {
    factories: HashMap<String, Arc<dyn ApplicationFactory>>,
}

impl ApplicationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory
    pub fn register(&mut self, factory: Arc<dyn ApplicationFactory>) -> Result<()> {
        let namespace = factory.namespace().to_string();
        if self.factories.contains_key(&namespace) {
            return Err(JingleError::DuplicateContent(format!(
                "application namespace {namespace} registered twice"
            )));
        }
        self.factories.insert(namespace, factory);
        Ok(())
    }

    /// Register a factory (builder form)
    pub fn with_factory(mut self, factory: Arc<dyn ApplicationFactory>) -> Result<Self> {
        self.register(factory)?;
        Ok(self)
    }

    /// Look up a factory by namespace
    pub fn get(&self, namespace: &str) -> Option<&Arc<dyn ApplicationFactory>> {
        self.factories.get(namespace)
    }

    /// Check if a namespace is registered
    pub fn contains(&self, namespace: &str) -> bool {
        self.factories.contains_key(namespace)
    }
}

impl fmt::Debug for ApplicationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut namespaces: Vec<_> = self.factories.keys().collect();
        namespaces.sort();
        f.debug_struct("ApplicationRegistry")
            .field("namespaces", &namespaces)
            .finish()
    }
}

/// One content of a session.
pub struct Application {
    pad: ContentPad,
    key: ContentKey,
    state: ApplicationState,
    senders: Origin,
    description: Box<dyn Description>,
    transport: Option<Box<dyn Transport>>,
    selector: Box<dyn TransportSelector>,
    connection: Option<Box<dyn Connection>>,
    pending_replace: PendingTransportReplace,
    /// The peer has seen (or created) the current transport
    transport_announced: bool,
    replace_reason: Option<Reason>,
    /// Peer replacement the selector refused; answered with transport-reject
    rejected_offer: Option<TransportElement>,
    termination_reason: Option<Reason>,
    /// Action committed by the last `take_outgoing_update`, waiting for ack
    in_flight: Option<Action>,
    /// Accept element applied last, for idempotent re-accept
    accepted_with: Option<ContentElement>,
}

impl Application {
    /// Local content, not yet prepared.
    pub(crate) fn new_local(
        pad: ContentPad,
        senders: Origin,
        description: Box<dyn Description>,
        selector: Box<dyn TransportSelector>,
    ) -> Self {
        let key = pad.key().clone();
        Self {
            pad,
            key,
            state: ApplicationState::Created,
            senders,
            description,
            transport: None,
            selector,
            connection: None,
            pending_replace: PendingTransportReplace::None,
            transport_announced: false,
            replace_reason: None,
            rejected_offer: None,
            termination_reason: None,
            in_flight: None,
            accepted_with: None,
        }
    }

    /// Content offered by the peer with its transport.
    pub(crate) fn new_incoming(
        pad: ContentPad,
        senders: Origin,
        description: Box<dyn Description>,
        transport: Box<dyn Transport>,
        mut selector: Box<dyn TransportSelector>,
    ) -> std::result::Result<Self, Reason> {
        if !selector.replace(None, transport.as_ref()) {
            return Err(Reason::with_text(
                Condition::UnsupportedTransports,
                format!("transport {} not acceptable", transport.namespace()),
            ));
        }
        let mut app = Self::new_local(pad, senders, description, selector);
        app.state = ApplicationState::Pending;
        app.transport = Some(transport);
        app.transport_announced = true;
        Ok(app)
    }

    fn role(&self) -> Origin {
        self.pad.role()
    }

    fn is_local(&self) -> bool {
        self.key.creator == self.role()
    }

    /// Content key
    pub fn key(&self) -> &ContentKey {
        &self.key
    }

    /// Content name
    pub fn name(&self) -> &str {
        &self.key.name
    }

    /// Content creator
    pub fn creator(&self) -> Origin {
        self.key.creator
    }

    /// Who sends data
    pub fn senders(&self) -> Origin {
        self.senders
    }

    /// Current state
    pub fn state(&self) -> ApplicationState {
        self.state
    }

    /// Transport swap progress
    pub fn pending_transport_replace(&self) -> PendingTransportReplace {
        self.pending_replace
    }

    /// Why the content is being removed, once decided
    pub fn termination_reason(&self) -> Option<&Reason> {
        self.termination_reason.as_ref()
    }

    /// Application namespace
    pub fn namespace(&self) -> &str {
        self.description.namespace()
    }

    /// Current transport
    pub fn transport(&self) -> Option<&dyn Transport> {
        self.transport.as_deref()
    }

    /// Current transport, mutable
    pub fn transport_mut(&mut self) -> Option<&mut (dyn Transport + 'static)> {
        self.transport.as_deref_mut()
    }

    /// Description plug-in
    pub fn description(&self) -> &dyn Description {
        self.description.as_ref()
    }

    /// Description plug-in, mutable
    pub fn description_mut(&mut self) -> &mut dyn Description {
        self.description.as_mut()
    }

    /// Description downcast to its concrete type
    pub fn description_as<T: 'static>(&self) -> Option<&T> {
        self.description.as_any().downcast_ref()
    }

    /// Description downcast to its concrete type, mutable
    pub fn description_as_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.description.as_any_mut().downcast_mut()
    }

    /// Established connection, once active
    pub fn connection_mut(&mut self) -> Option<&mut (dyn Connection + 'static)> {
        self.connection.as_deref_mut()
    }

    /// Block size of the established connection
    pub fn block_size(&self) -> Option<usize> {
        self.connection.as_deref().map(|c| c.block_size())
    }

    /// Transport selector
    pub fn selector(&self) -> &dyn TransportSelector {
        self.selector.as_ref()
    }

    /// Ask the session to re-evaluate this content, e.g. after changing the
    /// description through [`description_as_mut`](Application::description_as_mut).
    pub fn notify_updated(&self) {
        self.pad.notify_updated();
    }

    /// Make the content ready to be offered (local) or answered (peer's).
    pub fn prepare(&mut self) {
        let preparable = self.state == ApplicationState::Created
            || (self.state == ApplicationState::Pending && !self.is_local());
        if !preparable || self.termination_reason.is_some() {
            return;
        }
        if self.transport.is_none() {
            self.select_next_transport(None);
        }
        if self.transport.is_none() {
            self.remove(Reason::with_text(
                Condition::UnsupportedTransports,
                "no transport available",
            ));
            return;
        }
        self.state = ApplicationState::ApprovedToSend;
        if let Some(transport) = self.transport.as_mut() {
            transport.prepare();
        }
        self.pad.notify_updated();
    }

    /// Start the transport of an accepted content.
    pub fn start(&mut self) {
        if self.state != ApplicationState::Accepted {
            return;
        }
        self.start_transport();
    }

    fn start_transport(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            conn.close();
        }
        self.state = ApplicationState::Connecting;
        if let Some(transport) = self.transport.as_mut() {
            transport.start();
        }
        self.pad.notify_updated();
    }

    /// Decide to remove (or reject) this content.
    ///
    /// Content the peer has never seen finishes immediately.
    pub fn remove(&mut self, reason: Reason) {
        if self.state >= ApplicationState::Finishing || self.termination_reason.is_some() {
            return;
        }
        self.termination_reason = Some(reason);
        if self.is_local() && self.state <= ApplicationState::ApprovedToSend {
            self.finish();
        }
        self.pad.notify_updated();
    }

    /// Finish: close connection and transport, stop proposing updates.
    pub(crate) fn finish(&mut self) {
        if self.state == ApplicationState::Finished {
            return;
        }
        self.state = ApplicationState::Finished;
        if let Some(mut conn) = self.connection.take() {
            conn.close();
        }
        if let Some(mut transport) = self.transport.take() {
            transport.stop(self.termination_reason.clone());
        }
        self.pending_replace = PendingTransportReplace::None;
        self.in_flight = None;
        self.rejected_offer = None;
    }

    /// Whether `other` ranks better than the current transport.
    pub fn wants_better_transport(&self, other: &dyn Transport) -> bool {
        match self.transport.as_deref() {
            None => true,
            Some(current) => self.selector.compare(other, current) == Ordering::Greater,
        }
    }

    fn peer_knows_content(&self) -> bool {
        !self.is_local() || self.state >= ApplicationState::Unacked
    }

    /// Install a new transport, dropping or backing up the current one.
    ///
    /// Returns false (and changes nothing) when the selector refuses the
    /// replacement.
    pub fn set_transport(&mut self, transport: Box<dyn Transport>, reason: Option<Reason>) -> bool {
        if self.state >= ApplicationState::Finishing {
            return false;
        }
        let incoming = transport.creator() != self.role();
        if !incoming && !self.is_local() && self.state < ApplicationState::Accepted {
            // the peer's offer is answered with its own transport
            return false;
        }
        if !self.selector.replace(self.transport.as_deref(), transport.as_ref()) {
            return false;
        }

        let needs_replace = self.peer_knows_content();
        if let Some(mut old) = self.transport.take() {
            if old.creator() == self.role() && old.state() <= TransportState::Pending {
                // never acknowledged; may serve another attempt
                self.selector.backup_transport(old);
            } else {
                old.stop(reason.clone());
            }
        }
        if needs_replace {
            self.pending_replace = PendingTransportReplace::InProgress;
            self.replace_reason = reason;
        }
        self.transport_announced = incoming;
        self.transport = Some(transport);
        if self.state >= ApplicationState::ApprovedToSend {
            if let Some(transport) = self.transport.as_mut() {
                transport.prepare();
            }
        }
        self.pad.notify_updated();
        true
    }

    /// Pull the next candidate from the selector and install it.
    pub fn select_next_transport(&mut self, alike: Option<&str>) -> bool {
        let candidate = alike
            .and_then(|ns| self.selector.alike_transport(ns))
            .or_else(|| self.selector.next_transport());
        let reason = self
            .transport
            .as_deref()
            .and_then(|t| t.last_reason().cloned());

        match candidate {
            Some(transport) => self.set_transport(transport, reason),
            None => {
                if self
                    .transport
                    .as_deref()
                    .is_some_and(|t| t.state() == TransportState::Finished)
                {
                    self.transport = None;
                }
                tracing::debug!(
                    sid = self.pad.sid(),
                    content = %self.key,
                    "no more transports"
                );
                self.pad.notify_updated();
                false
            },
        }
    }

    fn removal(&self, reason: Option<Reason>) -> Update {
        let action = if !self.is_local() && self.state < ApplicationState::Accepted {
            Action::ContentReject
        } else {
            Action::ContentRemove
        };
        Update::with_reason(action, reason)
    }

    /// Next update to propose. Has no side effects.
    pub fn evaluate_outgoing_update(&self) -> Update {
        use ApplicationState as S;

        if matches!(self.state, S::Created | S::Finished)
            || self.pending_replace == PendingTransportReplace::NeedAck
        {
            return Update::NONE;
        }
        if matches!(self.state, S::Unacked | S::Finishing) {
            return Update::NONE;
        }
        if let Some(reason) = &self.termination_reason {
            return self.removal(Some(reason.clone()));
        }
        if self.rejected_offer.is_some() {
            return Update::new(Action::TransportReject);
        }

        let Some(transport) = self.transport.as_deref() else {
            if self.state == S::Pending && !self.is_local() {
                return Update::NONE;
            }
            return self.removal(Some(Reason::with_text(
                Condition::FailedTransport,
                "no transport left",
            )));
        };

        if transport.state() == TransportState::Finished {
            let failure = transport
                .last_reason()
                .cloned()
                .or_else(|| Some(Reason::new(Condition::FailedTransport)));
            if self.pending_replace == PendingTransportReplace::InProgress
                && transport.creator() != self.role()
            {
                return Update::with_reason(Action::TransportReject, failure);
            }
            if !self.is_local() && self.state < S::Accepted {
                return self.removal(failure);
            }
            if self.selector.has_more_transports() {
                return Update::with_reason(Action::TransportReplace, failure);
            }
            return self.removal(failure);
        }

        match self.state {
            S::ApprovedToSend => {
                if !transport.has_updates() {
                    Update::NONE
                } else if self.is_local() {
                    Update::new(Action::ContentAdd)
                } else {
                    Update::new(Action::ContentAccept)
                }
            },
            S::Pending if !self.is_local() => Update::NONE,
            S::Pending | S::Accepted | S::Connecting | S::Active => {
                if self.pending_replace == PendingTransportReplace::InProgress {
                    if transport.creator() != self.role() {
                        Update::new(Action::TransportAccept)
                    } else if !self.transport_announced && transport.has_updates() {
                        Update::with_reason(Action::TransportReplace, self.replace_reason.clone())
                    } else {
                        Update::NONE
                    }
                } else if transport.has_updates() {
                    Update::new(Action::TransportInfo)
                } else {
                    Update::NONE
                }
            },
            _ => Update::NONE,
        }
    }

    /// Commit the update [`evaluate_outgoing_update`] proposes and build its
    /// content element. The matching state change happens in
    /// [`on_acknowledged`].
    ///
    /// [`evaluate_outgoing_update`]: Application::evaluate_outgoing_update
    /// [`on_acknowledged`]: Application::on_acknowledged
    pub fn take_outgoing_update(&mut self) -> Option<ContentElement> {
        let update = self.evaluate_outgoing_update();
        let base = ContentElement::new(&self.key);

        let element = match update.action {
            Action::ContentAdd | Action::ContentAccept => {
                let transport = self.transport.as_mut()?.take_outgoing_update()?;
                self.transport_announced = true;
                self.state = ApplicationState::Unacked;
                base.with_senders(self.senders)
                    .with_description(self.description.to_element())
                    .with_transport(transport)
            },
            Action::ContentRemove | Action::ContentReject => {
                self.state = ApplicationState::Finishing;
                base
            },
            Action::TransportInfo => {
                let transport = self.transport.as_mut()?.take_outgoing_update()?;
                base.with_transport(transport)
            },
            Action::TransportReplace => {
                let failed = self
                    .transport
                    .as_deref()
                    .filter(|t| t.state() == TransportState::Finished)
                    .map(|t| t.namespace().to_string());
                if let Some(namespace) = failed {
                    if !self.select_next_transport(Some(&namespace)) {
                        return None;
                    }
                }
                let transport = self.transport.as_mut()?.take_outgoing_update()?;
                self.transport_announced = true;
                self.pending_replace = PendingTransportReplace::NeedAck;
                base.with_transport(transport)
            },
            Action::TransportAccept => {
                let transport = self.transport.as_mut()?;
                let namespace = transport.namespace().to_string();
                let element = transport
                    .take_outgoing_update()
                    .unwrap_or_else(|| TransportElement::new(namespace, serde_json::Value::Null));
                self.pending_replace = PendingTransportReplace::NeedAck;
                base.with_transport(element)
            },
            Action::TransportReject => match self.rejected_offer.clone() {
                Some(offer) => base.with_transport(offer),
                None => {
                    let namespace = self.transport.as_deref()?.namespace().to_string();
                    self.pending_replace = PendingTransportReplace::NeedAck;
                    base.with_transport(TransportElement::new(namespace, serde_json::Value::Null))
                },
            },
            _ => return None,
        };

        tracing::debug!(
            sid = self.pad.sid(),
            content = %self.key,
            action = %update.action,
            "outgoing update taken"
        );
        self.in_flight = Some(update.action);
        Some(element)
    }

    /// The request carrying our last taken update was acknowledged.
    pub fn on_acknowledged(&mut self) {
        let Some(action) = self.in_flight.take() else {
            return;
        };
        match action {
            Action::ContentAdd => {
                if self.state == ApplicationState::Unacked {
                    self.state = ApplicationState::Pending;
                }
            },
            Action::ContentAccept => {
                if self.state == ApplicationState::Unacked {
                    self.state = ApplicationState::Accepted;
                    self.start();
                }
            },
            Action::ContentRemove | Action::ContentReject => self.finish(),
            Action::TransportReplace => {
                if self.pending_replace == PendingTransportReplace::NeedAck {
                    self.pending_replace = PendingTransportReplace::InProgress;
                }
            },
            Action::TransportAccept => {
                if self.pending_replace == PendingTransportReplace::NeedAck {
                    self.pending_replace = PendingTransportReplace::None;
                    self.replace_reason = None;
                    if self.state >= ApplicationState::Accepted
                        && self.state < ApplicationState::Finishing
                    {
                        self.start_transport();
                    }
                }
            },
            Action::TransportReject => {
                if self.rejected_offer.take().is_none() {
                    // the peer's replacement failed before we accepted it
                    let hint = self.transport.take().map(|mut t| {
                        t.stop(None);
                        t.namespace().to_string()
                    });
                    self.pending_replace = PendingTransportReplace::None;
                    self.select_next_transport(hint.as_deref());
                }
            },
            _ => {},
        }
        self.pad.notify_updated();
    }

    /// The request carrying our last taken update lost a tie-break.
    pub fn on_tie_break(&mut self) {
        let Some(action) = self.in_flight.take() else {
            return;
        };
        if action == Action::TransportReplace
            && self.pending_replace == PendingTransportReplace::NeedAck
        {
            // peer's replacement was not applied either; offer again
            let hint = self.transport.as_deref().map(|t| t.namespace().to_string());
            if let Some(transport) = self.transport.take() {
                self.selector.backup_transport(transport);
            }
            self.pending_replace = PendingTransportReplace::InProgress;
            self.transport_announced = false;
            self.select_next_transport(hint.as_deref());
        }
        self.pad.notify_updated();
    }

    /// Check if a transport-replace from us is waiting for its acknowledgement
    pub fn has_unacked_transport_replace(&self) -> bool {
        self.in_flight == Some(Action::TransportReplace)
            && self.pending_replace == PendingTransportReplace::NeedAck
    }

    /// Validate a content-accept/session-accept element without applying it.
    pub(crate) fn check_accept(&self, element: &ContentElement) -> std::result::Result<(), ProtocolError> {
        if !self.is_local() {
            return Err(ProtocolError::unexpected(format!(
                "content {} was not offered by us",
                self.key
            )));
        }
        if self.state != ApplicationState::Pending {
            if self.state >= ApplicationState::Accepted
                && self.accepted_with.as_ref() == Some(element)
            {
                return Ok(());
            }
            return Err(ProtocolError::unexpected(format!(
                "content {} is not pending",
                self.key
            )));
        }
        let description = element
            .description
            .as_ref()
            .ok_or_else(|| ProtocolError::bad_request("accept without description"))?;
        if description.namespace != self.description.namespace() {
            return Err(ProtocolError::bad_request(format!(
                "description {} does not match offered {}",
                description.namespace,
                self.description.namespace()
            )));
        }
        self.description
            .accept_remote(description)
            .map_err(|reason| ProtocolError::with_text(ErrorCondition::NotAcceptable, reason.to_string()))?;
        let transport = element
            .transport
            .as_ref()
            .ok_or_else(|| ProtocolError::bad_request("accept without transport"))?;
        match self.transport.as_deref() {
            Some(current) if current.namespace() != transport.namespace => {
                Err(ProtocolError::bad_request(format!(
                    "transport {} does not match offered",
                    transport.namespace
                )))
            },
            Some(current) if !current.check_update(transport) => {
                Err(ProtocolError::bad_request("transport answer rejected"))
            },
            Some(_) => Ok(()),
            None => Err(ProtocolError::unexpected("no transport")),
        }
    }

    /// Apply an accept that passed [`check_accept`](Application::check_accept).
    /// Returns false for an idempotent re-accept.
    pub(crate) fn apply_accept(&mut self, element: &ContentElement) -> std::result::Result<bool, ProtocolError> {
        if self.state >= ApplicationState::Accepted && self.accepted_with.as_ref() == Some(element) {
            return Ok(false);
        }
        let Some(transport_element) = element.transport.as_ref() else {
            return Err(ProtocolError::bad_request("incomplete accept"));
        };
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| ProtocolError::unexpected("no transport"))?;
        if !transport.update(transport_element) {
            return Err(ProtocolError::bad_request("transport answer rejected"));
        }
        if let Some(senders) = element.senders {
            self.senders = senders;
        }
        self.state = ApplicationState::Accepted;
        self.accepted_with = Some(element.clone());
        Ok(true)
    }

    /// Undo an accept applied earlier in a batch that failed later on.
    pub(crate) fn rollback_accept(&mut self) {
        if self.state == ApplicationState::Accepted {
            self.state = ApplicationState::Pending;
            self.accepted_with = None;
        }
    }

    /// Apply a transport-info from the peer.
    pub(crate) fn incoming_transport_info(&mut self, element: &ContentElement) -> std::result::Result<(), ProtocolError> {
        self.accepted_with = None;
        let update = element
            .transport
            .as_ref()
            .ok_or_else(|| ProtocolError::bad_request("transport-info without transport"))?;
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| ProtocolError::unexpected("no transport"))?;
        if transport.namespace() != update.namespace {
            return Err(ProtocolError::unexpected(format!(
                "transport-info for {} while using {}",
                update.namespace,
                transport.namespace()
            )));
        }
        if !transport.update(update) {
            return Err(ProtocolError::bad_request("transport-info not applicable"));
        }
        Ok(())
    }

    /// Apply a transport-replace from the peer. A replacement the selector
    /// refuses is answered with transport-reject on the next step.
    ///
    /// `transport` is `None` when no factory could build the offered one.
    pub(crate) fn incoming_transport_replace(
        &mut self,
        offer: &TransportElement,
        transport: Option<Box<dyn Transport>>,
    ) -> std::result::Result<(), ProtocolError> {
        self.accepted_with = None;
        if self.state >= ApplicationState::Finishing {
            return Err(ProtocolError::unexpected("content is being removed"));
        }
        let installed = match transport {
            Some(transport) => self.set_transport(transport, None),
            None => false,
        };
        if !installed {
            tracing::debug!(
                sid = self.pad.sid(),
                content = %self.key,
                namespace = %offer.namespace,
                "refusing transport-replace"
            );
            self.rejected_offer = Some(offer.clone());
            self.pad.notify_updated();
        }
        Ok(())
    }

    /// Apply a transport-accept from the peer.
    pub(crate) fn incoming_transport_accept(&mut self, element: &ContentElement) -> std::result::Result<(), ProtocolError> {
        self.accepted_with = None;
        if self.pending_replace == PendingTransportReplace::None {
            return Err(ProtocolError::unexpected("no transport-replace in progress"));
        }
        let answer = element
            .transport
            .as_ref()
            .ok_or_else(|| ProtocolError::bad_request("transport-accept without transport"))?;
        let role = self.role();
        let transport = match self.transport.as_mut() {
            Some(t) if t.creator() == role && t.namespace() == answer.namespace => t,
            _ => return Err(ProtocolError::unexpected("transport-accept does not match our replace")),
        };
        if !transport.update(answer) {
            return Err(ProtocolError::bad_request("transport-accept not applicable"));
        }
        self.pending_replace = PendingTransportReplace::None;
        self.replace_reason = None;
        if self.state >= ApplicationState::Accepted && self.state < ApplicationState::Finishing {
            self.start_transport();
        }
        Ok(())
    }

    /// Apply a transport-reject from the peer and move on to the next
    /// candidate.
    pub(crate) fn incoming_transport_reject(&mut self, element: &ContentElement) -> std::result::Result<(), ProtocolError> {
        self.accepted_with = None;
        if self.pending_replace == PendingTransportReplace::None {
            return Err(ProtocolError::unexpected("no transport-replace in progress"));
        }
        let role = self.role();
        let namespace = element.transport.as_ref().map(|t| t.namespace.as_str());
        match self.transport.as_deref() {
            Some(t) if t.creator() == role && namespace.map_or(true, |ns| ns == t.namespace()) => {},
            _ => return Err(ProtocolError::unexpected("transport-reject does not match our replace")),
        }
        if let Some(mut rejected) = self.transport.take() {
            rejected.stop(Some(Reason::new(Condition::FailedTransport)));
        }
        self.transport_announced = false;
        self.select_next_transport(None);
        Ok(())
    }

    /// Apply a description-info from the peer.
    pub(crate) fn incoming_description_info(&mut self, element: &ContentElement) -> std::result::Result<(), ProtocolError> {
        self.accepted_with = None;
        let info = element
            .description
            .as_ref()
            .ok_or_else(|| ProtocolError::bad_request("description-info without description"))?;
        if info.namespace != self.description.namespace() {
            return Err(ProtocolError::bad_request("description-info namespace mismatch"));
        }
        self.description.handle_info(&info.payload)
    }

    /// Finish now, recording `reason` unless one was already decided.
    pub(crate) fn finish_with(&mut self, reason: Option<Reason>) {
        if self.termination_reason.is_none() {
            self.termination_reason = reason.or_else(|| Some(Reason::new(Condition::Success)));
        }
        self.finish();
    }

    /// Change who sends data (content-modify).
    pub(crate) fn set_senders(&mut self, senders: Origin) {
        self.accepted_with = None;
        self.senders = senders;
    }

    /// Check if a description-info is ready to go
    pub fn has_info_update(&self) -> bool {
        self.state >= ApplicationState::Pending
            && self.state < ApplicationState::Finishing
            && self.description.has_info_update()
    }

    /// Take the pending description-info as a content element.
    pub fn take_info_update(&mut self) -> Option<ContentElement> {
        if !self.has_info_update() {
            return None;
        }
        let payload = self.description.take_info_update()?;
        let namespace = self.description.namespace().to_string();
        Some(ContentElement::new(&self.key).with_description(DescriptionElement::new(namespace, payload)))
    }

    /// Sync with the transport after it reported a change.
    pub(crate) fn poll_transport(&mut self) -> bool {
        if self.state >= ApplicationState::Finishing {
            return false;
        }
        let Some(transport) = self.transport.as_mut() else {
            return false;
        };
        match transport.state() {
            TransportState::Active if self.state == ApplicationState::Connecting => {
                let Some(conn) = transport.take_connection() else {
                    return false;
                };
                let block_size = conn.block_size();
                self.connection = Some(conn);
                self.state = ApplicationState::Active;
                self.description.on_connected(block_size);
                tracing::info!(
                    sid = self.pad.sid(),
                    content = %self.key,
                    block_size,
                    "content active"
                );
                true
            },
            TransportState::Finished => {
                tracing::debug!(
                    sid = self.pad.sid(),
                    content = %self.key,
                    namespace = transport.namespace(),
                    "transport finished"
                );
                if let Some(mut conn) = self.connection.take() {
                    conn.close();
                }
                if self.state == ApplicationState::Active {
                    self.state = ApplicationState::Connecting;
                }
                true
            },
            _ => false,
        }
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("senders", &self.senders)
            .field("namespace", &self.description.namespace())
            .field("transport", &self.transport.as_deref().map(|t| t.namespace().to_string()))
            .field("pending_replace", &self.pending_replace)
            .finish()
    }
}
