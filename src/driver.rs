//! Async driver for a [`SessionManager`].
//!
//! Bridges the sans-IO state machines to a request/response channel. Each
//! [`Driver`] runs as one tokio task owning one endpoint's manager: it
//! delivers outgoing requests over a [`Link`], answers the peer's requests,
//! feeds responses back and resolves requests that stay unanswered for
//! `ack_timeout_secs` with a `Timeout` error. The application side talks to
//! it through a [`DriverHandle`].
//!
//! ```rust,ignore
//! let (a, b) = jingle::driver::loopback();
//! let (alice, mut alice_handle) = Driver::new("alice", "bob", a, &config)?;
//! let (bob, mut bob_handle) = Driver::new("bob", "alice", b, &config)?;
//! tokio::spawn(alice.run());
//! tokio::spawn(bob.run());
//! let sid = alice_handle.initiate(vec![content]).await?;
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::application::Description;
use crate::config::Config;
use crate::error::{JingleError, Result};
use crate::protocol::{
    ContentKey, ErrorCondition, JingleRequest, Origin, ProtocolError, Reason, SessionContext,
    SessionEvent, SessionManager, SessionSnapshot,
};

/// Message on the signalling channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    /// Request to be answered
    Request {
        /// Correlation id
        id: String,
        /// Jingle request
        request: JingleRequest,
    },
    /// Answer to a request
    Response {
        /// Correlation id of the request
        id: String,
        /// Success or the refusal
        result: std::result::Result<(), ProtocolError>,
    },
}

/// One end of a signalling channel
#[derive(Debug)]
pub struct Link {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Link {
    /// Build a link from channel halves
    pub fn new(tx: mpsc::UnboundedSender<Envelope>, rx: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self { tx, rx }
    }
}

/// Two links connected back to back.
pub fn loopback() -> (Link, Link) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (Link::new(a_tx, a_rx), Link::new(b_tx, b_rx))
}

/// Content to offer in a new session
pub struct LocalContent {
    /// Content name
    pub name: String,
    /// Who sends data
    pub senders: Origin,
    /// Application description
    pub description: Box<dyn Description>,
}

impl LocalContent {
    /// Create a content
    pub fn new(name: impl Into<String>, senders: Origin, description: Box<dyn Description>) -> Self {
        Self {
            name: name.into(),
            senders,
            description,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T>>;

/// Local intent sent to a driver
pub enum Command {
    /// Start a session with the remote peer
    Initiate {
        /// Contents to offer
        contents: Vec<LocalContent>,
        /// New sid
        reply: Reply<String>,
    },
    /// Accept an incoming session
    Accept {
        /// Session id
        sid: String,
        /// Outcome
        reply: Reply<()>,
    },
    /// Accept a content the peer added later
    AcceptContent {
        /// Session id
        sid: String,
        /// Content
        key: ContentKey,
        /// Outcome
        reply: Reply<()>,
    },
    /// Remove or reject a content
    RemoveContent {
        /// Session id
        sid: String,
        /// Content
        key: ContentKey,
        /// Why
        reason: Reason,
        /// Outcome
        reply: Reply<()>,
    },
    /// Terminate a session
    Terminate {
        /// Session id
        sid: String,
        /// Why
        reason: Reason,
        /// Outcome
        reply: Reply<()>,
    },
    /// Read a session's state
    Snapshot {
        /// Session id
        sid: String,
        /// Snapshot
        reply: Reply<SessionSnapshot>,
    },
}

/// Session event forwarded by a driver
#[derive(Debug, Clone, PartialEq)]
pub struct DriverEvent {
    /// Session id
    pub sid: String,
    /// What happened
    pub event: SessionEvent,
}

/// Runs one endpoint.
pub struct Driver {
    local: String,
    remote: String,
    manager: SessionManager,
    link: Link,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<DriverEvent>,
    ack_timeout: Duration,
    deadlines: HashMap<String, Instant>,
}

impl Driver {
    /// Create a driver for `local` talking to `remote` over `link`.
    pub fn new(
        local: impl Into<String>,
        remote: impl Into<String>,
        link: Link,
        config: &Config,
    ) -> Result<(Self, DriverHandle)> {
        let context = SessionContext::from_config(config)?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let driver = Self {
            local: local.into(),
            remote: remote.into(),
            manager: SessionManager::new(context),
            link,
            commands: commands_rx,
            events: events_tx,
            ack_timeout: Duration::from_secs(config.session.ack_timeout_secs),
            deadlines: HashMap::new(),
        };
        let handle = DriverHandle {
            commands: commands_tx,
            events: events_rx,
        };
        Ok((driver, handle))
    }

    /// Run until the handle is dropped or the link closes.
    pub async fn run(mut self) -> Result<()> {
        tracing::debug!(local = %self.local, remote = %self.remote, "driver started");
        loop {
            self.flush()?;
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                envelope = self.link.rx.recv() => match envelope {
                    Some(envelope) => self.handle_envelope(envelope)?,
                    None => {
                        tracing::warn!(local = %self.local, "signalling link closed");
                        break;
                    },
                },
                () = tokio::time::sleep_until(deadline) => self.expire(),
            }
        }
        tracing::debug!(local = %self.local, "driver stopped");
        Ok(())
    }

    fn next_deadline(&self) -> Instant {
        self.deadlines
            .values()
            .min()
            .copied()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(24 * 60 * 60))
    }

    fn send(&self, envelope: Envelope) -> Result<()> {
        self.link
            .tx
            .send(envelope)
            .map_err(|_| JingleError::ChannelClosed(format!("{} -> {}", self.local, self.remote)))
    }

    /// Push out everything the sessions produced.
    fn flush(&mut self) -> Result<()> {
        while let Some(transmit) = self.manager.poll_transmit() {
            let id = transmit.request.id;
            self.deadlines.insert(id.clone(), Instant::now() + self.ack_timeout);
            self.send(Envelope::Request {
                id,
                request: transmit.request.request,
            })?;
        }
        while let Some((sid, event)) = self.manager.poll_event() {
            // nobody listening is fine
            let _ = self.events.send(DriverEvent { sid, event });
        }
        Ok(())
    }

    fn handle_envelope(&mut self, envelope: Envelope) -> Result<()> {
        match envelope {
            Envelope::Request { id, request } => {
                let result = self.manager.handle_request(&self.remote, &request);
                if self.send(Envelope::Response { id, result }).is_err() {
                    // the peer stopped after its last request; the link closes next
                    tracing::debug!(local = %self.local, "response not delivered");
                }
                Ok(())
            },
            Envelope::Response { id, result } => {
                if self.deadlines.remove(&id).is_none() {
                    tracing::debug!(local = %self.local, id = %id, "late response dropped");
                    return Ok(());
                }
                self.manager.handle_response(&id, result);
                Ok(())
            },
        }
    }

    fn expire(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.deadlines.remove(&id);
            tracing::warn!(local = %self.local, id = %id, "request timed out");
            self.manager
                .handle_response(&id, Err(ProtocolError::new(ErrorCondition::Timeout)));
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initiate { contents, reply } => {
                let _ = reply.send(self.initiate(contents));
            },
            Command::Accept { sid, reply } => {
                let _ = reply.send(self.manager.require(&sid).and_then(|s| s.accept()));
            },
            Command::AcceptContent { sid, key, reply } => {
                let _ = reply.send(self.manager.require(&sid).and_then(|s| s.accept_content(&key)));
            },
            Command::RemoveContent {
                sid,
                key,
                reason,
                reply,
            } => {
                let _ = reply.send(
                    self.manager
                        .require(&sid)
                        .and_then(|s| s.remove_content(&key, reason)),
                );
            },
            Command::Terminate { sid, reason, reply } => {
                let _ = reply.send(self.manager.require(&sid).map(|s| s.terminate(reason)));
            },
            Command::Snapshot { sid, reply } => {
                let _ = reply.send(self.manager.require(&sid).map(|s| s.snapshot()));
            },
        }
    }

    fn initiate(&mut self, contents: Vec<LocalContent>) -> Result<String> {
        let sid = self.manager.new_session(self.remote.clone());
        let session = self.manager.require(&sid)?;
        let result = contents
            .into_iter()
            .try_for_each(|content| {
                let app = session.new_content(content.name, content.senders, content.description)?;
                session.add_content(app)
            })
            .and_then(|()| session.initiate());
        if let Err(err) = result {
            session.terminate(Reason::with_text(
                crate::protocol::Condition::GeneralError,
                err.to_string(),
            ));
            return Err(err);
        }
        Ok(sid)
    }
}

/// Application side of a [`Driver`]
pub struct DriverHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<DriverEvent>,
}

impl DriverHandle {
    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| JingleError::ChannelClosed("driver stopped".into()))?;
        rx.await
            .map_err(|_| JingleError::ChannelClosed("driver dropped the reply".into()))?
    }

    /// Start a session offering `contents`; returns its sid.
    pub async fn initiate(&self, contents: Vec<LocalContent>) -> Result<String> {
        self.call(|reply| Command::Initiate { contents, reply }).await
    }

    /// Accept an incoming session
    pub async fn accept(&self, sid: &str) -> Result<()> {
        let sid = sid.to_string();
        self.call(|reply| Command::Accept { sid, reply }).await
    }

    /// Accept a content added by the peer
    pub async fn accept_content(&self, sid: &str, key: ContentKey) -> Result<()> {
        let sid = sid.to_string();
        self.call(|reply| Command::AcceptContent { sid, key, reply })
            .await
    }

    /// Remove or reject a content
    pub async fn remove_content(&self, sid: &str, key: ContentKey, reason: Reason) -> Result<()> {
        let sid = sid.to_string();
        self.call(|reply| Command::RemoveContent {
            sid,
            key,
            reason,
            reply,
        })
        .await
    }

    /// Terminate a session
    pub async fn terminate(&self, sid: &str, reason: Reason) -> Result<()> {
        let sid = sid.to_string();
        self.call(|reply| Command::Terminate { sid, reason, reply })
            .await
    }

    /// Snapshot of a session
    pub async fn snapshot(&self, sid: &str) -> Result<SessionSnapshot> {
        let sid = sid.to_string();
        self.call(|reply| Command::Snapshot { sid, reply }).await
    }

    /// Next event; `None` once the driver stopped.
    pub async fn next_event(&mut self) -> Option<DriverEvent> {
        self.events.recv().await
    }

    /// Wait for the first event matching `pred`, skipping the others.
    pub async fn wait_for<F>(&mut self, mut pred: F) -> Option<DriverEvent>
    where
        F: FnMut(&DriverEvent) -> bool,
    {
        while let Some(event) = self.events.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    }
}
