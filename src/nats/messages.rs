//! Wire messages for the archive transfer protocol
//!
//! Every message is JSON with a bus-level key naming its variant:
//! - upload stream: `start | data | finish | abort`
//! - acknowledgements: `start | finish | error`
//! - download stream: `start | data | finish`
//!
//! Binary payloads travel base64-encoded.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::storage::{ArchiveKey, ArchiveRecord};
use crate::types::{RelayError, Result};

/// The only error text that ever reaches a client acknowledgement
pub const GENERIC_UPLOAD_ERROR: &str = "Unexpected error during file upload handling";

/// Announces a new upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartChunk {
    #[serde(alias = "userId")]
    pub owner: String,
    pub archive_name: String,
    /// Protocol versions that fix the iv up front send it here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
}

/// One fragment of archive bytes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataChunk {
    #[serde(alias = "userId")]
    pub owner: String,
    pub archive_name: String,
    pub order_number: u64,
    /// Base64 payload
    pub data: String,
}

impl DataChunk {
    pub fn decode_data(&self) -> std::result::Result<Vec<u8>, base64::DecodeError> {
        base64_decode(&self.data)
    }
}

/// Closes an upload with its expected chunk count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishChunk {
    #[serde(alias = "userId")]
    pub owner: String,
    pub archive_name: String,
    pub chunk_amount: u64,
    pub checksum: String,
    pub iv: String,
}

/// Client-initiated cancellation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortChunk {
    #[serde(alias = "userId")]
    pub owner: String,
    pub archive_name: String,
}

/// Inbound upload message
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkMessage {
    Start(StartChunk),
    Data(DataChunk),
    Finish(FinishChunk),
    Abort(AbortChunk),
}

impl ChunkMessage {
    pub fn start(owner: &str, archive_name: &str, iv: Option<&str>) -> Self {
        Self::Start(StartChunk {
            owner: owner.to_string(),
            archive_name: archive_name.to_string(),
            iv: iv.map(str::to_string),
        })
    }

    pub fn data(owner: &str, archive_name: &str, order_number: u64, bytes: &[u8]) -> Self {
        Self::Data(DataChunk {
            owner: owner.to_string(),
            archive_name: archive_name.to_string(),
            order_number,
            data: base64_encode(bytes),
        })
    }

    pub fn finish(
        owner: &str,
        archive_name: &str,
        chunk_amount: u64,
        checksum: &str,
        iv: &str,
    ) -> Self {
        Self::Finish(FinishChunk {
            owner: owner.to_string(),
            archive_name: archive_name.to_string(),
            chunk_amount,
            checksum: checksum.to_string(),
            iv: iv.to_string(),
        })
    }

    pub fn abort(owner: &str, archive_name: &str) -> Self {
        Self::Abort(AbortChunk {
            owner: owner.to_string(),
            archive_name: archive_name.to_string(),
        })
    }

    /// Decode a message from its bus key and JSON payload
    pub fn decode(key: &str, payload: &[u8]) -> Result<Self> {
        let message = match key {
            "start" => Self::Start(serde_json::from_slice(payload)?),
            "data" => Self::Data(serde_json::from_slice(payload)?),
            "finish" => Self::Finish(serde_json::from_slice(payload)?),
            "abort" => Self::Abort(serde_json::from_slice(payload)?),
            other => {
                return Err(RelayError::InvalidMessage(format!(
                    "Unknown upload message key: {:?}",
                    other
                )))
            }
        };
        Ok(message)
    }

    /// Bus key and JSON payload
    pub fn encode(&self) -> Result<(&'static str, Bytes)> {
        let payload = match self {
            Self::Start(m) => serde_json::to_vec(m)?,
            Self::Data(m) => serde_json::to_vec(m)?,
            Self::Finish(m) => serde_json::to_vec(m)?,
            Self::Abort(m) => serde_json::to_vec(m)?,
        };
        Ok((self.kind(), payload.into()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::Data(_) => "data",
            Self::Finish(_) => "finish",
            Self::Abort(_) => "abort",
        }
    }

    pub fn archive_key(&self) -> ArchiveKey {
        let (owner, name) = match self {
            Self::Start(m) => (&m.owner, &m.archive_name),
            Self::Data(m) => (&m.owner, &m.archive_name),
            Self::Finish(m) => (&m.owner, &m.archive_name),
            Self::Abort(m) => (&m.owner, &m.archive_name),
        };
        ArchiveKey::new(owner.clone(), name.clone())
    }

    /// `finish` and `abort` end an upload lane
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish(_) | Self::Abort(_))
    }
}

/// Outcome reported on the acknowledgement subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    /// Upload started
    Success,
    /// Upload finished
    Ok,
    Error,
}

/// Acknowledgement sent back to the uploading client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgement {
    pub owner: String,
    pub archive_name: String,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Acknowledgement {
    fn new(key: &ArchiveKey, status: AckStatus, error_message: Option<String>) -> Self {
        Self {
            owner: key.owner.clone(),
            archive_name: key.name.clone(),
            status,
            error_message,
        }
    }

    pub fn started(key: &ArchiveKey) -> Self {
        Self::new(key, AckStatus::Success, None)
    }

    pub fn finished(key: &ArchiveKey) -> Self {
        Self::new(key, AckStatus::Ok, None)
    }

    /// Error acknowledgement; carries only the generic message
    pub fn failed(key: &ArchiveKey) -> Self {
        Self::new(key, AckStatus::Error, Some(GENERIC_UPLOAD_ERROR.to_string()))
    }

    /// Bus key for this acknowledgement
    pub fn kind(&self) -> &'static str {
        match self.status {
            AckStatus::Success => "start",
            AckStatus::Ok => "finish",
            AckStatus::Error => "error",
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(serde_json::to_vec(self)?.into())
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Opens a download with the archive's integrity fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStart {
    pub owner: String,
    pub archive_name: String,
    pub checksum: String,
    pub iv: String,
}

/// One sequential segment of archive bytes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadData {
    pub owner: String,
    pub archive_name: String,
    /// Base64 payload
    pub data: String,
}

impl DownloadData {
    pub fn decode_data(&self) -> std::result::Result<Vec<u8>, base64::DecodeError> {
        base64_decode(&self.data)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadFinish {
    pub owner: String,
    pub archive_name: String,
}

/// Outbound download message
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadFrame {
    Start(DownloadStart),
    Data(DownloadData),
    Finish(DownloadFinish),
}

impl DownloadFrame {
    /// Start frame for a finished archive record
    pub fn start(record: &ArchiveRecord) -> Self {
        Self::Start(DownloadStart {
            owner: record.owner.clone(),
            archive_name: record.name.clone(),
            checksum: record.checksum.clone().unwrap_or_default(),
            iv: record.iv.clone().unwrap_or_default(),
        })
    }

    pub fn data(key: &ArchiveKey, bytes: &[u8]) -> Self {
        Self::Data(DownloadData {
            owner: key.owner.clone(),
            archive_name: key.name.clone(),
            data: base64_encode(bytes),
        })
    }

    pub fn finish(key: &ArchiveKey) -> Self {
        Self::Finish(DownloadFinish {
            owner: key.owner.clone(),
            archive_name: key.name.clone(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::Data(_) => "data",
            Self::Finish(_) => "finish",
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let payload = match self {
            Self::Start(m) => serde_json::to_vec(m)?,
            Self::Data(m) => serde_json::to_vec(m)?,
            Self::Finish(m) => serde_json::to_vec(m)?,
        };
        Ok(payload.into())
    }

    /// Decode a frame from its bus key and JSON payload
    pub fn decode(key: &str, payload: &[u8]) -> Result<Self> {
        let frame = match key {
            "start" => Self::Start(serde_json::from_slice(payload)?),
            "data" => Self::Data(serde_json::from_slice(payload)?),
            "finish" => Self::Finish(serde_json::from_slice(payload)?),
            other => {
                return Err(RelayError::InvalidMessage(format!(
                    "Unknown download message key: {:?}",
                    other
                )))
            }
        };
        Ok(frame)
    }
}

// Base64 encoding helpers using the base64 crate
fn base64_encode(data: &[u8]) -> String {
    use base64::{engine::general_purpose::STANDARD, Engine};
    STANDARD.encode(data)
}

fn base64_decode(data: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    use base64::{engine::general_purpose::STANDARD, Engine};
    STANDARD.decode(data)
}
