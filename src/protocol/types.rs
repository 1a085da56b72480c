//! Value types shared by the session, application and transport machines.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which side of a session something belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Nobody
    None,
    /// The side that sent session-initiate
    Initiator,
    /// The side that received session-initiate
    Responder,
    /// Both sides
    Both,
}

impl Origin {
    /// The opposite role. `Both` and `None` are their own negation.
    pub fn negate(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
            other => other,
        }
    }

    /// Get the wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Initiator => "initiator",
            Self::Responder => "responder",
            Self::Both => "both",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Jingle protocol actions.
///
/// Declaration order is significant: when several contents have updates ready
/// in the same step, the smallest action wins the next request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// Nothing to send now
    NoAction,
    /// Accept a content-add
    ContentAccept,
    /// Add a content to a running session
    ContentAdd,
    /// Change the senders of a content
    ContentModify,
    /// Decline a content-add
    ContentReject,
    /// Remove an accepted content
    ContentRemove,
    /// Application-specific information
    DescriptionInfo,
    /// Security-layer information
    SecurityInfo,
    /// Accept session-initiate
    SessionAccept,
    /// Session-level information (ping)
    SessionInfo,
    /// Open a session
    SessionInitiate,
    /// End a session
    SessionTerminate,
    /// Accept a transport-replace
    TransportAccept,
    /// Transport candidates and other transport updates
    TransportInfo,
    /// Decline a transport-replace
    TransportReject,
    /// Propose a different transport for a content
    TransportReplace,
}

impl Action {
    /// Get the wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoAction => "no-action",
            Self::ContentAccept => "content-accept",
            Self::ContentAdd => "content-add",
            Self::ContentModify => "content-modify",
            Self::ContentReject => "content-reject",
            Self::ContentRemove => "content-remove",
            Self::DescriptionInfo => "description-info",
            Self::SecurityInfo => "security-info",
            Self::SessionAccept => "session-accept",
            Self::SessionInfo => "session-info",
            Self::SessionInitiate => "session-initiate",
            Self::SessionTerminate => "session-terminate",
            Self::TransportAccept => "transport-accept",
            Self::TransportInfo => "transport-info",
            Self::TransportReject => "transport-reject",
            Self::TransportReplace => "transport-replace",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason conditions (XEP-0166 §7.4).
///
/// Ordinal order is used as the secondary key of the batching tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Condition {
    /// The party prefers another existing session
    AlternativeSession,
    /// The party is busy
    Busy,
    /// The party cancels
    Cancel,
    /// Connectivity checks failed
    ConnectivityError,
    /// The party declines
    Decline,
    /// The session expired
    Expired,
    /// Application-level failure
    FailedApplication,
    /// Transport-level failure
    FailedTransport,
    /// Unspecified failure
    GeneralError,
    /// The party is gone
    Gone,
    /// Parameters are not acceptable
    IncompatibleParameters,
    /// Media processing failure
    MediaError,
    /// Security failure
    SecurityError,
    /// Normal completion
    Success,
    /// Timed out
    Timeout,
    /// No supported application
    UnsupportedApplications,
    /// No supported transport
    UnsupportedTransports,
}

/// Why something was terminated, rejected or replaced.
///
/// Absence of a reason is modelled as `Option<Reason>`; `None` sorts before
/// every condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reason {
    /// Condition
    pub condition: Condition,
    /// Optional human-readable text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Reason {
    /// Create a reason without text
    pub fn new(condition: Condition) -> Self {
        Self {
            condition,
            text: None,
        }
    }

    /// Create a reason with text
    pub fn with_text(condition: Condition, text: impl Into<String>) -> Self {
        Self {
            condition,
            text: Some(text.into()),
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.text {
            Some(text) => write!(f, "{:?}: {}", self.condition, text),
            None => write!(f, "{:?}", self.condition),
        }
    }
}

/// Identity of a content within one session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentKey {
    /// Content name, unique per creator
    pub name: String,
    /// Side that created the content
    pub creator: Origin,
}

impl ContentKey {
    /// Create a content key
    pub fn new(name: impl Into<String>, creator: Origin) -> Self {
        Self {
            name: name.into(),
            creator,
        }
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.creator, self.name)
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    /// Created, no local intent yet
    Created,
    /// `initiate()`/`accept()` called, waiting for contents to be ready
    ApprovedToSend,
    /// session-initiate or session-accept in flight
    Unacked,
    /// Initiator: session-initiate acknowledged, waiting for session-accept
    Pending,
    /// Both sides agreed
    Active,
    /// Termination decided, session-terminate is the next send
    Finishing,
    /// Terminal
    Finished,
}

/// Per-content application lifecycle.
///
/// Locally created content walks `Created → ApprovedToSend → Unacked →
/// Pending → Accepted → Connecting → Active`. Content offered by the peer
/// starts in `Pending` (waiting for a local decision), moves to
/// `ApprovedToSend` once accepted locally, then `Unacked → Accepted →
/// Connecting → Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplicationState {
    /// Allocated, not prepared
    Created,
    /// Prepared, offer/answer may be sent
    ApprovedToSend,
    /// content-add/content-accept in flight
    Unacked,
    /// Offered to the peer (or by the peer), no answer yet
    Pending,
    /// Both sides agreed on the content
    Accepted,
    /// Transport started
    Connecting,
    /// Connection established
    Active,
    /// content-remove/content-reject in flight
    Finishing,
    /// Terminal
    Finished,
}

/// Per-transport lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportState {
    /// Allocated
    Created,
    /// Prepared, local candidates/parameters available
    Pending,
    /// Started, establishing the connection
    Connecting,
    /// Connection is up
    Active,
    /// Closed or failed
    Finished,
}

/// Progress of a transport swap on one content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PendingTransportReplace {
    /// No swap in progress
    #[default]
    None,
    /// Our transport-replace/transport-accept/transport-reject is in flight
    NeedAck,
    /// A swap is known to both sides or must still be announced and is not
    /// settled yet
    InProgress,
}

/// An outgoing update proposed by an application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    /// Action to send
    pub action: Action,
    /// Reason attached to the action
    pub reason: Option<Reason>,
}

impl Update {
    /// Nothing to send
    pub const NONE: Self = Self {
        action: Action::NoAction,
        reason: None,
    };

    /// Create an update without a reason
    pub fn new(action: Action) -> Self {
        Self {
            action,
            reason: None,
        }
    }

    /// Create an update carrying a reason
    pub fn with_reason(action: Action, reason: Option<Reason>) -> Self {
        Self { action, reason }
    }

    /// Check if there is anything to send
    pub fn is_none(&self) -> bool {
        self.action == Action::NoAction
    }

    /// Sort key used to pick the next batched action.
    pub fn priority(&self) -> (Action, Option<Condition>) {
        (self.action, self.reason.as_ref().map(|r| r.condition))
    }
}
