//! Shared fixtures for the end-to-end tests.
//!
//! `Pair` wires an initiator and a responder session back to back over two
//! FIFO queues, the same ordering a real signalling channel gives.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use jingle::application::{ApplicationRegistry, FileMeta, FileTransfer, FileTransferFactory};
use jingle::config::{IbbConfig, SessionConfig};
use jingle::driver::Envelope;
use jingle::protocol::{
    ContentKey, ContentPad, JingleRequest, Origin, OutgoingRequest, Reason, Session, SessionContext, SessionEvent,
    TransportElement, TransportState,
};
use jingle::transport::{
    Connection, IbbTransportFactory, Transport, TransportFactory, TransportRegistry, IBB_NS,
};
use serde_json::json;

pub const ALICE: &str = "alice@example.com/desk";
pub const BOB: &str = "bob@example.com/phone";
pub const SID: &str = "sid-1";

/// Second transport kind: no parameters, optionally sends one
/// transport-info once connected.
pub const ECHO_NS: &str = "urn:test:transports:echo";

pub struct EchoFactory {
    pub info_after_start: bool,
}

impl TransportFactory for EchoFactory {
    fn namespace(&self) -> &str {
        ECHO_NS
    }

    fn new_transport(
        &self,
        pad: ContentPad,
        creator: Origin,
        offer: Option<&TransportElement>,
    ) -> Result<Box<dyn Transport>, Reason> {
        if offer.is_some_and(|o| o.namespace != ECHO_NS) {
            return Err(Reason::new(jingle::Condition::FailedTransport));
        }
        Ok(Box::new(EchoTransport {
            pad,
            creator,
            state: TransportState::Created,
            has_update: false,
            info_after_start: self.info_after_start,
            connection: None,
            last_reason: None,
        }))
    }
}

struct EchoTransport {
    pad: ContentPad,
    creator: Origin,
    state: TransportState,
    has_update: bool,
    info_after_start: bool,
    connection: Option<EchoConnection>,
    last_reason: Option<Reason>,
}

impl Transport for EchoTransport {
    fn namespace(&self) -> &str {
        ECHO_NS
    }

    fn creator(&self) -> Origin {
        self.creator
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn last_reason(&self) -> Option<&Reason> {
        self.last_reason.as_ref()
    }

    fn prepare(&mut self) {
        if self.state <= TransportState::Pending {
            self.state = TransportState::Pending;
            self.has_update = true;
            self.pad.notify_updated();
        }
    }

    fn start(&mut self) {
        if self.state >= TransportState::Connecting {
            return;
        }
        self.state = TransportState::Connecting;
        self.connection = Some(EchoConnection::default());
        self.state = TransportState::Active;
        if self.info_after_start {
            self.has_update = true;
        }
        self.pad.notify_updated();
    }

    fn check_update(&self, element: &TransportElement) -> bool {
        element.namespace == ECHO_NS
    }

    fn update(&mut self, element: &TransportElement) -> bool {
        self.check_update(element)
    }

    fn has_updates(&self) -> bool {
        self.has_update && self.state < TransportState::Finished
    }

    fn take_outgoing_update(&mut self) -> Option<TransportElement> {
        if !self.has_updates() {
            return None;
        }
        self.has_update = false;
        Some(TransportElement::new(ECHO_NS, json!({ "state": format!("{:?}", self.state) })))
    }

    fn take_connection(&mut self) -> Option<Box<dyn Connection>> {
        if self.state != TransportState::Active {
            return None;
        }
        self.connection.take().map(|c| Box::new(c) as Box<dyn Connection>)
    }

    fn stop(&mut self, reason: Option<Reason>) {
        if self.state != TransportState::Finished {
            self.last_reason = reason;
            self.state = TransportState::Finished;
        }
    }
}

#[derive(Default)]
struct EchoConnection {
    closed: bool,
    buf: VecDeque<Bytes>,
}

impl Connection for EchoConnection {
    fn block_size(&self) -> usize {
        0
    }

    fn write(&mut self, data: Bytes) -> jingle::Result<()> {
        self.buf.push_back(data);
        Ok(())
    }

    fn read(&mut self) -> Option<Bytes> {
        self.buf.pop_front()
    }

    fn is_open(&self) -> bool {
        !self.closed
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Context with file transfer, IBB and echo, in the given preference order.
pub fn context_with(preference: &[&str], echo_info: bool, session: SessionConfig) -> SessionContext {
    let applications = ApplicationRegistry::new()
        .with_factory(Arc::new(FileTransferFactory::new()))
        .unwrap();
    let mut transports = TransportRegistry::new()
        .with_factory(Arc::new(IbbTransportFactory::new(IbbConfig::default())))
        .unwrap()
        .with_factory(Arc::new(EchoFactory {
            info_after_start: echo_info,
        }))
        .unwrap();
    let preference: Vec<String> = preference.iter().map(|s| s.to_string()).collect();
    transports.prioritize(&preference);
    SessionContext::new(applications, transports, session)
}

/// IBB preferred, echo as the fallback.
pub fn context() -> SessionContext {
    context_with(&[IBB_NS, ECHO_NS], false, SessionConfig::default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Alice,
    Bob,
}

/// Initiator and responder sessions over FIFO queues.
pub struct Pair {
    pub alice: Session,
    pub bob: Session,
    to_alice: VecDeque<Envelope>,
    to_bob: VecDeque<Envelope>,
    /// Every request sent, in order
    pub log: Vec<(Side, JingleRequest)>,
    /// Error responses, in order
    pub errors: Vec<(Side, jingle::ProtocolError)>,
    /// Unanswered requests per side (alice, bob)
    pub outstanding: [usize; 2],
    /// Largest value `outstanding` ever reached
    pub max_outstanding: usize,
}

impl Pair {
    pub fn new(context: &SessionContext) -> Self {
        Self::with_contexts(context, context)
    }

    pub fn with_contexts(alice: &SessionContext, bob: &SessionContext) -> Self {
        Self {
            alice: Session::new(SID, Origin::Initiator, BOB, alice),
            bob: Session::new(SID, Origin::Responder, ALICE, bob),
            to_alice: VecDeque::new(),
            to_bob: VecDeque::new(),
            log: Vec::new(),
            errors: Vec::new(),
            outstanding: [0, 0],
            max_outstanding: 0,
        }
    }

    fn sent(&mut self, side: Side) {
        let slot = &mut self.outstanding[side as usize];
        *slot += 1;
        self.max_outstanding = self.max_outstanding.max(*slot);
    }

    pub fn session(&mut self, side: Side) -> &mut Session {
        match side {
            Side::Alice => &mut self.alice,
            Side::Bob => &mut self.bob,
        }
    }

    /// Offer a file from alice; returns the content key.
    pub fn offer_file(&mut self, name: &str, data: &[u8]) -> ContentKey {
        self.offer_meta(FileMeta::from_bytes(name, data))
    }

    /// Offer a file described by `meta` from alice.
    pub fn offer_meta(&mut self, meta: FileMeta) -> ContentKey {
        let name = meta.name.clone();
        let description = Box::new(FileTransfer::offer(meta));
        let app = self
            .alice
            .new_content(name, Origin::Initiator, description)
            .unwrap();
        let key = app.key().clone();
        self.alice.add_content(app).unwrap();
        key
    }

    /// Queue a request taken from `from` for its peer.
    pub fn forward(&mut self, from: Side, out: OutgoingRequest) {
        self.sent(from);
        self.log.push((from, out.request.clone()));
        let envelope = Envelope::Request {
            id: out.id,
            request: out.request,
        };
        match from {
            Side::Alice => self.to_bob.push_back(envelope),
            Side::Bob => self.to_alice.push_back(envelope),
        }
    }

    /// Move every produced request into the peer's queue.
    pub fn flush(&mut self) {
        while let Some(out) = self.alice.poll_transmit() {
            self.forward(Side::Alice, out);
        }
        while let Some(out) = self.bob.poll_transmit() {
            self.forward(Side::Bob, out);
        }
    }

    /// Pop the next envelope queued for `to` without delivering it.
    pub fn intercept(&mut self, to: Side) -> Option<Envelope> {
        match to {
            Side::Alice => self.to_alice.pop_front(),
            Side::Bob => self.to_bob.pop_front(),
        }
    }

    /// Deliver one envelope to `to`. Returns false if its queue was empty.
    pub fn deliver(&mut self, to: Side) -> bool {
        let Some(envelope) = self.intercept(to) else {
            return false;
        };
        self.receive(to, envelope);
        true
    }

    /// Hand an envelope to `to` as if it came off the wire.
    pub fn receive(&mut self, to: Side, envelope: Envelope) {
        match envelope {
            Envelope::Request { id, request } => {
                let result = self.session(to).handle_request(&request);
                if let Err(err) = &result {
                    self.errors.push((to, err.clone()));
                }
                let response = Envelope::Response { id, result };
                match to {
                    Side::Alice => self.to_bob.push_back(response),
                    Side::Bob => self.to_alice.push_back(response),
                }
            },
            Envelope::Response { id, result } => {
                if self.session(to).handle_response(&id, result) {
                    self.outstanding[to as usize] -= 1;
                }
            },
        }
    }

    /// Exchange until both sides are quiet.
    pub fn run(&mut self) {
        for _ in 0..1000 {
            self.flush();
            let a = self.deliver(Side::Alice);
            let b = self.deliver(Side::Bob);
            if !a && !b {
                self.flush();
                if self.to_alice.is_empty() && self.to_bob.is_empty() {
                    return;
                }
            }
        }
        panic!("sessions never settled");
    }

    pub fn events(&mut self, side: Side) -> Vec<SessionEvent> {
        std::iter::from_fn(|| self.session(side).poll_event()).collect()
    }

    /// Actions sent by `side`, in order
    pub fn actions(&self, side: Side) -> Vec<jingle::Action> {
        self.log
            .iter()
            .filter(|(s, _)| *s == side)
            .map(|(_, r)| r.action)
            .collect()
    }

    /// Offer `names` from alice and let bob accept the session.
    pub fn establish(context: &SessionContext, names: &[&str]) -> (Self, Vec<ContentKey>) {
        let mut pair = Self::new(context);
        let keys = names
            .iter()
            .map(|name| pair.offer_file(name, name.as_bytes()))
            .collect();
        pair.alice.initiate().unwrap();
        pair.run();
        pair.bob.accept().unwrap();
        pair.run();
        (pair, keys)
    }
}
