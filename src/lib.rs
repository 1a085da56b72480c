//! # Jingle Core - Session Negotiation Engine
//!
//! Negotiates multi-content peer sessions between two XMPP endpoints using
//! the Jingle signalling protocol (XEP-0166): what is exchanged (an
//! *application*, e.g. a file transfer), how the bytes flow (a *transport*,
//! e.g. an in-band bytestream) and the whole lifecycle of offer, accept,
//! renegotiation and termination over an asynchronous request/acknowledge
//! channel.
//!
//! ## Features
//!
//! - **Sans-IO state machines**: [`Session`], [`Application`] and the
//!   [`transport::Transport`] trait never perform I/O themselves
//! - **Serialized signalling**: one request in flight per session, one action
//!   kind per request
//! - **All-or-nothing accepts** with rollback and idempotent re-accept
//! - **Transport replacement** with tie-break detection and backup reuse
//! - **Pluggable applications and transports** through factories
//! - **Async driver**: tokio task bridging sessions to a channel, with
//!   acknowledgement timeouts
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │ SessionManager (sid -> Session)                      │
//! │  ┌────────────────────────────────────────────────┐  │
//! │  │ Session: step scheduler, task queue, in-flight │  │
//! │  │  ┌────────────────────┐ ┌────────────────────┐ │  │
//! │  │  │ Application "ft"   │ │ Application ...    │ │  │
//! │  │  │  Description       │ │                    │ │  │
//! │  │  │  Transport (owned) │ │                    │ │  │
//! │  │  │  TransportSelector │ │                    │ │  │
//! │  │  └────────────────────┘ └────────────────────┘ │  │
//! │  └────────────────────────────────────────────────┘  │
//! └───────────────┬──────────────────────▲───────────────┘
//!                 │ poll_transmit        │ handle_request / handle_response
//!                 ▼                      │
//!        request/response channel (driver::Link, or your own)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use jingle::{Config, Origin, SessionContext, SessionManager};
//! use jingle::application::{FileMeta, FileTransfer};
//!
//! let mut alice = SessionManager::new(SessionContext::from_config(&Config::default())?);
//! let sid = alice.new_session("bob@example.com/res");
//! let session = alice.require(&sid)?;
//! let content = session.new_content("ft", Origin::Initiator,
//!     Box::new(FileTransfer::offer(FileMeta::from_bytes("a.txt", b"hello"))))?;
//! session.add_content(content)?;
//! session.initiate()?;
//!
//! while let Some(transmit) = alice.poll_transmit() {
//!     // deliver transmit.request to transmit.peer, then
//!     // alice.handle_response(&transmit.request.id, result);
//! }
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Session state machine, wire model, session manager
//! - [`application`]: Per-content state machine and the file-transfer application
//! - [`transport`]: Transport traits, selector and the in-band bytestream
//! - [`driver`]: Tokio driver over an async request/response channel
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod application;
pub mod config;
pub mod driver;
pub mod error;
pub mod protocol;
pub mod transport;

// Re-exports for convenience
pub use application::{Application, Description, FileMeta, FileTransfer};
pub use config::Config;
pub use driver::{Driver, DriverEvent, DriverHandle, LocalContent};
pub use error::{JingleError, Result};
pub use protocol::{
    Action, Condition, ContentKey, JingleRequest, Origin, ProtocolError, Reason, Session,
    SessionContext, SessionEvent, SessionManager, SessionState,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
