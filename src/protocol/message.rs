//! Wire model for Jingle requests and their error responses.
//!
//! The exact stanza grammar is owned by the external channel; this module
//! keeps the structure the state machines need (action, sid, content
//! elements, reason) and serializes it as JSON.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{Action, ContentKey, Origin, Reason};

/// Application description carried by a content element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptionElement {
    /// Application namespace
    pub namespace: String,
    /// Application-specific payload
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl DescriptionElement {
    /// Create a description element
    pub fn new(namespace: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            namespace: namespace.into(),
            payload,
        }
    }
}

/// Transport description carried by a content element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportElement {
    /// Transport namespace
    pub namespace: String,
    /// Transport-specific payload
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TransportElement {
    /// Create a transport element
    pub fn new(namespace: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            namespace: namespace.into(),
            payload,
        }
    }
}

/// One `<content/>` of a Jingle request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentElement {
    /// Content name
    pub name: String,
    /// Content creator
    pub creator: Origin,
    /// Who sends media
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub senders: Option<Origin>,
    /// Application description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<DescriptionElement>,
    /// Transport description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportElement>,
}

impl ContentElement {
    /// Create a bare content element
    pub fn new(key: &ContentKey) -> Self {
        Self {
            name: key.name.clone(),
            creator: key.creator,
            senders: None,
            description: None,
            transport: None,
        }
    }

    /// Key identifying the content this element refers to
    pub fn key(&self) -> ContentKey {
        ContentKey::new(self.name.clone(), self.creator)
    }

    /// Set senders
    pub fn with_senders(mut self, senders: Origin) -> Self {
        self.senders = Some(senders);
        self
    }

    /// Set description
    pub fn with_description(mut self, description: DescriptionElement) -> Self {
        self.description = Some(description);
        self
    }

    /// Set transport
    pub fn with_transport(mut self, transport: TransportElement) -> Self {
        self.transport = Some(transport);
        self
    }
}

/// One Jingle request (the `<jingle/>` element of an IQ set)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JingleRequest {
    /// Action
    pub action: Action,
    /// Session id
    pub sid: String,
    /// Contents this action applies to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contents: Vec<ContentElement>,
    /// Reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    /// Session-level info payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<serde_json::Value>,
}

impl JingleRequest {
    /// Create a request without contents
    pub fn new(action: Action, sid: impl Into<String>) -> Self {
        Self {
            action,
            sid: sid.into(),
            contents: Vec::new(),
            reason: None,
            info: None,
        }
    }

    /// Set contents
    pub fn with_contents(mut self, contents: Vec<ContentElement>) -> Self {
        self.contents = contents;
        self
    }

    /// Set reason
    pub fn with_reason(mut self, reason: Option<Reason>) -> Self {
        self.reason = reason;
        self
    }

    /// Set info payload
    pub fn with_info(mut self, info: serde_json::Value) -> Self {
        self.info = Some(info);
        self
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// A request handed to the request/response channel
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingRequest {
    /// Correlation id; the response must be delivered with the same id
    pub id: String,
    /// Request body
    pub request: JingleRequest,
}

/// Error conditions returned to a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCondition {
    /// Malformed request
    BadRequest,
    /// Referenced content or session does not exist
    ItemNotFound,
    /// Request is not legal in the current state
    UnexpectedRequest,
    /// Not supported by this implementation
    FeatureNotImplemented,
    /// Well-formed but not acceptable
    NotAcceptable,
    /// Conflicts with existing state
    Conflict,
    /// No response arrived in time
    Timeout,
    /// Jingle: request arrived before its prerequisite
    OutOfOrder,
    /// Jingle: both sides attempted the same change concurrently
    TieBreak,
    /// Jingle: unknown sid
    UnknownSession,
    /// Jingle: unsupported info payload
    UnsupportedInfo,
}

impl ErrorCondition {
    /// Get the wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::ItemNotFound => "item-not-found",
            Self::UnexpectedRequest => "unexpected-request",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::NotAcceptable => "not-acceptable",
            Self::Conflict => "conflict",
            Self::Timeout => "remote-server-timeout",
            Self::OutOfOrder => "out-of-order",
            Self::TieBreak => "tie-break",
            Self::UnknownSession => "unknown-session",
            Self::UnsupportedInfo => "unsupported-info",
        }
    }
}

impl fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error response to a Jingle request
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{condition}{}", text.as_ref().map(|t| format!(": {t}")).unwrap_or_default())]
pub struct ProtocolError {
    /// Condition
    pub condition: ErrorCondition,
    /// Optional diagnostic text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ProtocolError {
    /// Create an error without text
    pub fn new(condition: ErrorCondition) -> Self {
        Self {
            condition,
            text: None,
        }
    }

    /// Create an error with text
    pub fn with_text(condition: ErrorCondition, text: impl Into<String>) -> Self {
        Self {
            condition,
            text: Some(text.into()),
        }
    }

    /// Malformed request
    pub fn bad_request(text: impl Into<String>) -> Self {
        Self::with_text(ErrorCondition::BadRequest, text)
    }

    /// Request not legal in the current state
    pub fn unexpected(text: impl Into<String>) -> Self {
        Self::with_text(ErrorCondition::UnexpectedRequest, text)
    }

    /// Referenced item does not exist
    pub fn item_not_found(text: impl Into<String>) -> Self {
        Self::with_text(ErrorCondition::ItemNotFound, text)
    }

    /// Check if this is a tie-break
    pub fn is_tie_break(&self) -> bool {
        self.condition == ErrorCondition::TieBreak
    }
}
