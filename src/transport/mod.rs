//! Transport abstraction for Jingle contents.
//!
//! A transport negotiates *how* bytes flow for one content. The engine only
//! talks to transports through the traits below:
//!
//! - [`Transport`]: per-content candidate negotiation sub-machine
//! - [`Connection`]: the pipe a started transport eventually yields
//! - [`TransportFactory`]: creates transports of one namespace
//! - [`TransportSelector`]: per-content policy picking and ranking transports
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │              Application                   │
//! │   owns exactly one Transport at a time     │
//! └──────────┬───────────────────┬─────────────┘
//!            │ next / alike      │ backup
//!            ▼                   ▼
//! ┌────────────────────────────────────────────┐
//! │      TransportSelector (per content)       │
//! │  preference-ordered factories + backups    │
//! └──────────┬─────────────────────────────────┘
//!            ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │   IbbTransport  │ │  (other kinds)  │
//! └─────────────────┘ └─────────────────┘
//! ```

pub mod ibb;
mod selector;

pub use ibb::{IbbConnection, IbbTransport, IbbTransportFactory, IBB_NS};
pub use selector::{PreferenceSelector, TransportSelector};

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{JingleError, Result};
use crate::protocol::{ContentPad, Origin, Reason, TransportElement, TransportState};

/// Established byte/datagram pipe produced by a started transport.
pub trait Connection: Send {
    /// Natural chunk size; 0 means stream-oriented.
    fn block_size(&self) -> usize;

    /// Queue data for the peer.
    fn write(&mut self, data: Bytes) -> Result<()>;

    /// Next chunk received from the peer, if any.
    fn read(&mut self) -> Option<Bytes>;

    /// Check if the connection is open
    fn is_open(&self) -> bool;

    /// Close the connection. Idempotent.
    fn close(&mut self);
}

/// Candidate-negotiation state machine for one content.
pub trait Transport: Send {
    /// Transport namespace
    fn namespace(&self) -> &str;

    /// Side that proposed this transport
    fn creator(&self) -> Origin;

    /// Current state
    fn state(&self) -> TransportState;

    /// Why the transport finished, if it did
    fn last_reason(&self) -> Option<&Reason>;

    /// Begin gathering local candidates/parameters.
    fn prepare(&mut self);

    /// Begin connecting or accepting connections.
    fn start(&mut self);

    /// Check if [`update`](Transport::update) would accept `element`, without
    /// changing anything.
    fn check_update(&self, element: &TransportElement) -> bool;

    /// Apply a peer update. `false` means it could not be applied and the
    /// transport is unchanged.
    fn update(&mut self, element: &TransportElement) -> bool;

    /// Check if there is something to tell the peer
    fn has_updates(&self) -> bool;

    /// Take the pending outgoing update.
    fn take_outgoing_update(&mut self) -> Option<TransportElement>;

    /// Hand over the connection once the transport is active.
    fn take_connection(&mut self) -> Option<Box<dyn Connection>>;

    /// Stop the transport; it becomes `Finished`.
    fn stop(&mut self, reason: Option<Reason>);
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("namespace", &self.namespace())
            .field("creator", &self.creator())
            .field("state", &self.state())
            .finish()
    }
}

/// Creates transports of one namespace.
pub trait TransportFactory: Send + Sync {
    /// Namespace of the transports this factory makes
    fn namespace(&self) -> &str;

    /// Create a transport.
    ///
    /// `offer` is the peer's transport element when the transport is created
    /// for a peer proposal, `None` for a locally created one.
    fn new_transport(
        &self,
        pad: ContentPad,
        creator: Origin,
        offer: Option<&TransportElement>,
    ) -> std::result::Result<Box<dyn Transport>, Reason>;
}

/// Preference-ordered set of transport factories.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    factories: Vec<Arc<dyn TransportFactory>>,
}

impl TransportRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory with the lowest preference so far.
    pub fn register(&mut self, factory: Arc<dyn TransportFactory>) -> Result<()> {
        if self.get(factory.namespace()).is_some() {
            return Err(JingleError::DuplicateContent(format!(
                "transport namespace {} registered twice",
                factory.namespace()
            )));
        }
        self.factories.push(factory);
        Ok(())
    }

    /// Register a factory (builder form)
    pub fn with_factory(mut self, factory: Arc<dyn TransportFactory>) -> Result<Self> {
        self.register(factory)?;
        Ok(self)
    }

    /// Reorder factories by the given namespace preference. Unlisted
    /// namespaces keep their relative order after the listed ones.
    pub fn prioritize(&mut self, preference: &[String]) {
        self.factories.sort_by_key(|f| {
            preference
                .iter()
                .position(|ns| ns == f.namespace())
                .unwrap_or(usize::MAX)
        });
    }

    /// Look up a factory by namespace
    pub fn get(&self, namespace: &str) -> Option<&Arc<dyn TransportFactory>> {
        self.factories.iter().find(|f| f.namespace() == namespace)
    }

    /// Factories in preference order
    pub fn factories(&self) -> &[Arc<dyn TransportFactory>] {
        &self.factories
    }

    /// Namespaces in preference order
    pub fn namespaces(&self) -> Vec<String> {
        self.factories.iter().map(|f| f.namespace().to_string()).collect()
    }

    /// Check if no factory is registered
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Build the default selector for one content
    pub fn selector(&self, pad: ContentPad) -> Box<dyn TransportSelector> {
        Box::new(PreferenceSelector::new(pad, self.factories.clone()))
    }
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("namespaces", &self.namespaces())
            .finish()
    }
}
