//! Submissions and the record delivered to viewers.
//!
//! A [`Submission`] is created by the ingress side, owned by the ingestion
//! queue until a worker dequeues it, and discarded once published. The
//! worker turns it into a [`PhotoRecord`], which is the only thing that
//! travels through the relay and reaches viewer connections.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Opaque submission identifier.
///
/// Generated as a time-ordered UUIDv7 so ids sort roughly by arrival.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(String);

impl SubmissionId {
    /// Creates a SubmissionId from an existing string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh, time-ordered id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One media item accepted from a producer.
///
/// Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    id: SubmissionId,
    payload: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl Submission {
    /// Creates a submission with a generated id, stamped now.
    pub fn new(payload: Vec<u8>) -> Self {
        Self::with_id(SubmissionId::generate(), payload, Utc::now())
    }

    /// Creates a submission from all of its parts.
    pub fn with_id(id: SubmissionId, payload: Vec<u8>, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            payload,
            created_at,
        }
    }

    pub fn id(&self) -> &SubmissionId {
        &self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Converts the submission into the egress record, consuming it.
    pub fn into_record(self) -> PhotoRecord {
        PhotoRecord {
            image_data: STANDARD.encode(&self.payload),
            timestamp: self.created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            id: self.id.0,
        }
    }
}

/// The self-contained record every viewer receives, one per message.
///
/// Wire form: `{"image_data": <base64>, "timestamp": <ISO-8601>, "id": <string>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRecord {
    /// Base64-encoded media bytes
    pub image_data: String,

    /// Submission time, ISO-8601 / RFC 3339
    pub timestamp: String,

    /// Submission id
    pub id: String,
}

impl PhotoRecord {
    /// Serializes the record to its JSON wire form.
    pub fn to_json(&self) -> DomainResult<String> {
        serde_json::to_string(self).map_err(|e| DomainError::ParseError {
            field: "photo_record".to_string(),
            reason: e.to_string(),
        })
    }

    /// Parses a record from its JSON wire form.
    pub fn from_json(json: &str) -> DomainResult<Self> {
        serde_json::from_str(json).map_err(|e| DomainError::ParseError {
            field: "photo_record".to_string(),
            reason: e.to_string(),
        })
    }

    /// Decodes the base64 payload back to bytes.
    pub fn decode_image(&self) -> DomainResult<Vec<u8>> {
        STANDARD
            .decode(self.image_data.as_bytes())
            .map_err(|e| DomainError::ParseError {
                field: "image_data".to_string(),
                reason: e.to_string(),
            })
    }
}
