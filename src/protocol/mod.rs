//! Jingle session negotiation.
//!
//! Implements the XEP-0166 session/content/transport negotiation as a
//! sans-IO state machine. A [`Session`] never performs I/O itself: it queues
//! outgoing requests for the embedder to deliver, is fed incoming requests and
//! responses, and reports what happened as [`SessionEvent`]s.
//!
//! # Message Flow
//!
//! ```text
//! Initiator                               Responder
//!    |                                        |
//!    |------ session-initiate (contents) --->|  offer
//!    |<----------------- ack ----------------|
//!    |                                        |
//!    |<----- session-accept (contents) ------|  answer
//!    |------------------ ack --------------->|
//!    |                                        |
//!    |<====== transport-info / -replace =====>|  one request in flight
//!    |<====== content-add / -remove =========>|  per direction at a time
//!    |                                        |
//!    |------ session-terminate (reason) ---->|
//! ```
//!
//! ## Session states
//!
//! | State            | Meaning                                         |
//! |------------------|-------------------------------------------------|
//! | `Created`        | No local intent yet                             |
//! | `ApprovedToSend` | `initiate()`/`accept()` called, contents preparing |
//! | `Unacked`        | session-initiate/session-accept in flight       |
//! | `Pending`        | Initiator waits for session-accept              |
//! | `Active`         | Both sides agreed                               |
//! | `Finishing`      | session-terminate is the next thing sent        |
//! | `Finished`       | Terminal                                        |
//!
//! ## Batching
//!
//! Every outgoing request carries exactly one [`Action`] kind and only one
//! request is in flight per session. When several contents have updates
//! ready, the smallest `(action, reason condition)` pair wins the next
//! request; the rest stay queued for later steps.
//!
//! # Usage
//!
//! ```rust,ignore
//! use jingle::protocol::{Session, SessionContext, Origin};
//! use jingle::application::{FileMeta, FileTransfer};
//!
//! let context = SessionContext::from_config(&Config::default())?;
//! let mut session = Session::new("sid-1", Origin::Initiator, "bob@example.com", &context);
//! let content = session.new_content("ft", Origin::Initiator,
//!     Box::new(FileTransfer::offer(FileMeta::new("a.txt", 5))))?;
//! session.add_content(content)?;
//! session.initiate()?;
//!
//! while let Some(out) = session.poll_transmit() {
//!     // deliver out.request, later: session.handle_response(&out.id, result)
//! }
//! ```

mod manager;
mod message;
mod pad;
mod session;
mod types;

pub use manager::{SessionManager, Transmit};
pub use message::{
    ContentElement, DescriptionElement, ErrorCondition, JingleRequest, OutgoingRequest,
    ProtocolError, TransportElement,
};
pub use pad::ContentPad;
pub(crate) use pad::Task;
pub use session::{ContentSnapshot, Session, SessionContext, SessionEvent, SessionSnapshot};
pub use types::{
    Action, ApplicationState, Condition, ContentKey, Origin, PendingTransportReplace, Reason,
    SessionState, TransportState, Update,
};
