//! File-transfer description (XEP-0234 style).
//!
//! The offer carries the file metadata. The answer must describe the same
//! file, otherwise the content is refused with `IncompatibleParameters`.
//! Once the content is connected, the sending side announces the file
//! checksum as a description-info; the receiving side records it.

use std::any::Any;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use super::{ApplicationFactory, Description};
use crate::protocol::{
    Condition, ContentKey, DescriptionElement, ErrorCondition, ProtocolError, Reason,
};

/// File-transfer application namespace
pub const FILE_TRANSFER_NS: &str = "urn:xmpp:jingle:apps:file-transfer:5";

/// Hash algorithm name used on the wire
const HASH_ALGO: &str = "sha-256";

/// Metadata of the transferred file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// File name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// MIME type
    #[serde(default, rename = "media-type", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Last modification time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    /// Base64 SHA-256 of the content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl FileMeta {
    /// Metadata with name and size only
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            media_type: None,
            date: None,
            desc: None,
            hash: None,
        }
    }

    /// Metadata describing an in-memory file, including its hash
    pub fn from_bytes(name: impl Into<String>, data: &[u8]) -> Self {
        let mut meta = Self::new(name, data.len() as u64);
        meta.hash = Some(sha256_base64(data));
        meta.date = Some(Utc::now());
        meta
    }

    /// Set media type
    pub fn with_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    /// Set description
    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }

    /// Same file as `other`: name and size match, and hashes agree when both
    /// sides know one.
    pub fn is_compatible(&self, other: &FileMeta) -> bool {
        if self.name != other.name || self.size != other.size {
            return false;
        }
        match (&self.hash, &other.hash) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// Base64 encoded SHA-256 digest
pub fn sha256_base64(data: &[u8]) -> String {
    BASE64.encode(Sha256::digest(data))
}

#[derive(Debug, Deserialize)]
struct FilePayload {
    file: FileMeta,
}

#[derive(Debug, Deserialize)]
struct ChecksumPayload {
    checksum: Checksum,
}

#[derive(Debug, Serialize, Deserialize)]
struct Checksum {
    algo: String,
    hash: String,
}

/// File-transfer description
#[derive(Debug)]
pub struct FileTransfer {
    meta: FileMeta,
    /// We offered the file and send it
    sending: bool,
    pending_checksum: Option<String>,
    received_checksum: Option<String>,
    block_size: Option<usize>,
}

impl FileTransfer {
    /// Outgoing file offer
    pub fn offer(meta: FileMeta) -> Self {
        Self {
            meta,
            sending: true,
            pending_checksum: None,
            received_checksum: None,
            block_size: None,
        }
    }

    fn incoming(meta: FileMeta) -> Self {
        Self {
            sending: false,
            ..Self::offer(meta)
        }
    }

    /// File metadata
    pub fn meta(&self) -> &FileMeta {
        &self.meta
    }

    /// Check if this side sends the file
    pub fn is_sending(&self) -> bool {
        self.sending
    }

    /// Checksum announced by the peer
    pub fn received_checksum(&self) -> Option<&str> {
        self.received_checksum.as_deref()
    }

    /// Block size of the connection, once connected
    pub fn block_size(&self) -> Option<usize> {
        self.block_size
    }

    /// Queue a checksum announcement. The owning content must be notified
    /// (`Application::notify_updated`) for it to go out.
    pub fn set_checksum(&mut self, hash: impl Into<String>) {
        let hash = hash.into();
        self.meta.hash = Some(hash.clone());
        self.pending_checksum = Some(hash);
    }

    /// Check the received checksum against the data actually received.
    pub fn verify(&self, data: &[u8]) -> bool {
        let expected = self.received_checksum.as_ref().or(self.meta.hash.as_ref());
        expected.is_some_and(|hash| *hash == sha256_base64(data))
    }
}

impl Description for FileTransfer {
    fn namespace(&self) -> &str {
        FILE_TRANSFER_NS
    }

    fn to_element(&self) -> DescriptionElement {
        DescriptionElement::new(FILE_TRANSFER_NS, json!({ "file": self.meta }))
    }

    fn accept_remote(&self, element: &DescriptionElement) -> Result<(), Reason> {
        let payload: FilePayload = serde_json::from_value(element.payload.clone())
            .map_err(|e| Reason::with_text(Condition::IncompatibleParameters, e.to_string()))?;
        if !self.meta.is_compatible(&payload.file) {
            return Err(Reason::with_text(
                Condition::IncompatibleParameters,
                format!("answer describes {} instead of {}", payload.file.name, self.meta.name),
            ));
        }
        Ok(())
    }

    fn handle_info(&mut self, payload: &serde_json::Value) -> Result<(), ProtocolError> {
        let info: ChecksumPayload = serde_json::from_value(payload.clone())
            .map_err(|_| ProtocolError::new(ErrorCondition::UnsupportedInfo))?;
        if info.checksum.algo != HASH_ALGO {
            return Err(ProtocolError::with_text(
                ErrorCondition::UnsupportedInfo,
                format!("hash algorithm {}", info.checksum.algo),
            ));
        }
        tracing::debug!(file = %self.meta.name, "checksum received");
        self.received_checksum = Some(info.checksum.hash);
        Ok(())
    }

    fn has_info_update(&self) -> bool {
        self.pending_checksum.is_some()
    }

    fn take_info_update(&mut self) -> Option<serde_json::Value> {
        let hash = self.pending_checksum.take()?;
        Some(json!({
            "checksum": Checksum {
                algo: HASH_ALGO.to_string(),
                hash,
            }
        }))
    }

    fn on_connected(&mut self, block_size: usize) {
        self.block_size = Some(block_size);
        if self.sending && self.received_checksum.is_none() {
            self.pending_checksum = self.meta.hash.clone();
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Factory for incoming file offers
#[derive(Debug, Clone, Default)]
pub struct FileTransferFactory {
    /// Largest file accepted, if limited
    max_size: Option<u64>,
}

impl FileTransferFactory {
    /// Create a factory accepting any size
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse offers larger than `max_size`
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = Some(max_size);
        self
    }
}

impl ApplicationFactory for FileTransferFactory {
    fn namespace(&self) -> &str {
        FILE_TRANSFER_NS
    }

    fn incoming(
        &self,
        key: &ContentKey,
        element: &DescriptionElement,
    ) -> Result<Box<dyn Description>, Reason> {
        let payload: FilePayload = serde_json::from_value(element.payload.clone()).map_err(|e| {
            Reason::with_text(Condition::FailedApplication, format!("{key}: {e}"))
        })?;
        if let Some(max) = self.max_size {
            if payload.file.size > max {
                return Err(Reason::with_text(
                    Condition::IncompatibleParameters,
                    format!("{} is larger than {max} bytes", payload.file.name),
                ));
            }
        }
        Ok(Box::new(FileTransfer::incoming(payload.file)))
    }
}
