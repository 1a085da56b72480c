//! In-band bytestream transport.
//!
//! Negotiation is a single exchange: the creator offers a stream id and a
//! block size, the other side answers with the same stream id and a block
//! size no larger than the offered one. There are no connectivity checks, so
//! starting the transport makes it active straight away. Data itself travels
//! over the signalling channel, which is outside this crate; the
//! [`IbbConnection`] is an in-memory duplex buffer the embedder pumps.

use std::collections::VecDeque;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{Connection, Transport, TransportFactory};
use crate::config::IbbConfig;
use crate::error::{JingleError, Result};
use crate::protocol::{Condition, ContentPad, Origin, Reason, TransportElement, TransportState};

/// IBB transport namespace (XEP-0261)
pub const IBB_NS: &str = "urn:xmpp:jingle:transports:ibb:1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct IbbParams {
    sid: String,
    #[serde(rename = "block-size")]
    block_size: usize,
}

impl IbbParams {
    fn parse(element: &TransportElement) -> Option<Self> {
        if element.namespace != IBB_NS {
            return None;
        }
        let params: Self = serde_json::from_value(element.payload.clone()).ok()?;
        (params.block_size > 0 && !params.sid.is_empty()).then_some(params)
    }

    fn to_element(&self) -> TransportElement {
        TransportElement::new(
            IBB_NS,
            serde_json::to_value(self).unwrap_or(serde_json::Value::Null),
        )
    }
}

/// In-band bytestream transport
pub struct IbbTransport {
    pad: ContentPad,
    creator: Origin,
    state: TransportState,
    params: IbbParams,
    max_block_size: usize,
    has_update: bool,
    connection: Option<IbbConnection>,
    last_reason: Option<Reason>,
}

impl IbbTransport {
    fn set_state(&mut self, state: TransportState) {
        if self.state != state {
            tracing::trace!(
                sid = self.pad.sid(),
                content = %self.pad.key(),
                from = ?self.state,
                to = ?state,
                "ibb state"
            );
            self.state = state;
        }
    }

    /// Negotiated block size
    pub fn block_size(&self) -> usize {
        self.params.block_size
    }

    /// Stream id
    pub fn stream_id(&self) -> &str {
        &self.params.sid
    }

    /// Parse a peer answer: same stream id, block size within our limit.
    fn answer(&self, element: &TransportElement) -> Option<IbbParams> {
        let params = IbbParams::parse(element)?;
        let limit = self.params.block_size.min(self.max_block_size);
        (params.sid == self.params.sid && params.block_size <= limit).then_some(params)
    }

    /// Report a runtime failure (e.g. the in-band stream was closed by the
    /// server). The owning content is told on its next tick.
    pub fn fail(&mut self, reason: Reason) {
        self.stop(Some(reason));
        self.pad.notify_updated();
    }
}

impl Transport for IbbTransport {
    fn namespace(&self) -> &str {
        IBB_NS
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
        // a backed-up transport is prepared again when reused and re-offers
        if self.state <= TransportState::Pending {
            self.set_state(TransportState::Pending);
            // offer for our own transport, answer for the peer's one
            self.has_update = true;
            self.pad.notify_updated();
        }
    }

    fn start(&mut self) {
        if self.state >= TransportState::Connecting {
            return;
        }
        self.set_state(TransportState::Connecting);
        self.connection = Some(IbbConnection::new(self.params.block_size));
        self.set_state(TransportState::Active);
        tracing::debug!(
            sid = self.pad.sid(),
            content = %self.pad.key(),
            stream = %self.params.sid,
            block_size = self.params.block_size,
            "in-band bytestream active"
        );
        self.pad.notify_updated();
    }

    fn check_update(&self, element: &TransportElement) -> bool {
        self.answer(element).is_some()
    }

    fn update(&mut self, element: &TransportElement) -> bool {
        let Some(params) = self.answer(element) else {
            return false;
        };
        self.params.block_size = params.block_size;
        true
    }

    fn has_updates(&self) -> bool {
        self.has_update && self.state < TransportState::Finished
    }

    fn take_outgoing_update(&mut self) -> Option<TransportElement> {
        if !self.has_updates() {
            return None;
        }
        self.has_update = false;
        Some(self.params.to_element())
    }

    fn take_connection(&mut self) -> Option<Box<dyn Connection>> {
        if self.state != TransportState::Active {
            return None;
        }
        self.connection
            .take()
            .map(|c| Box::new(c) as Box<dyn Connection>)
    }

    fn stop(&mut self, reason: Option<Reason>) {
        if self.state == TransportState::Finished {
            return;
        }
        if let Some(conn) = self.connection.as_mut() {
            conn.close();
        }
        self.last_reason = reason;
        self.set_state(TransportState::Finished);
    }
}

/// Factory for [`IbbTransport`]
#[derive(Debug, Clone)]
pub struct IbbTransportFactory {
    config: IbbConfig,
}

impl IbbTransportFactory {
    /// Create a factory
    pub fn new(config: IbbConfig) -> Self {
        Self { config }
    }
}

impl Default for IbbTransportFactory {
    fn default() -> Self {
        Self::new(IbbConfig::default())
    }
}

impl TransportFactory for IbbTransportFactory {
    fn namespace(&self) -> &str {
        IBB_NS
    }

    fn new_transport(
        &self,
        pad: ContentPad,
        creator: Origin,
        offer: Option<&TransportElement>,
    ) -> std::result::Result<Box<dyn Transport>, Reason> {
        let params = match offer {
            Some(element) => {
                let mut params = IbbParams::parse(element).ok_or_else(|| {
                    Reason::with_text(Condition::FailedTransport, "malformed ibb offer")
                })?;
                params.block_size = params.block_size.min(self.config.max_block_size);
                params
            },
            None => IbbParams {
                sid: uuid::Uuid::new_v4().simple().to_string(),
                block_size: self.config.block_size.min(self.config.max_block_size),
            },
        };

        Ok(Box::new(IbbTransport {
            pad,
            creator,
            state: TransportState::Created,
            params,
            max_block_size: self.config.max_block_size,
            has_update: false,
            connection: None,
            last_reason: None,
        }))
    }
}

/// In-memory duplex buffer standing in for the in-band stream
#[derive(Debug)]
pub struct IbbConnection {
    block_size: usize,
    outgoing: VecDeque<Bytes>,
    incoming: VecDeque<Bytes>,
    open: bool,
}

impl IbbConnection {
    fn new(block_size: usize) -> Self {
        Self {
            block_size,
            outgoing: VecDeque::new(),
            incoming: VecDeque::new(),
            open: true,
        }
    }

    /// Blocks waiting to be sent as `<data/>` stanzas
    pub fn drain_outgoing(&mut self) -> Vec<Bytes> {
        self.outgoing.drain(..).collect()
    }

    /// Deliver a block received from the peer
    pub fn push_incoming(&mut self, data: Bytes) {
        if self.open {
            self.incoming.push_back(data);
        }
    }
}

impl Connection for IbbConnection {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn write(&mut self, mut data: Bytes) -> Result<()> {
        if !self.open {
            return Err(JingleError::InvalidState("in-band stream is closed".into()));
        }
        while data.len() > self.block_size {
            let chunk = data.split_to(self.block_size);
            self.outgoing.push_back(chunk);
        }
        if !data.is_empty() {
            self.outgoing.push_back(data);
        }
        Ok(())
    }

    fn read(&mut self) -> Option<Bytes> {
        self.incoming.pop_front()
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.open = false;
        self.outgoing.clear();
    }
}
