//! Wire codecs for the task message types.
//!
//! Two framings are supported: textual JSON and compact MessagePack. Both
//! carry the same serde data model and MUST decode into equal objects; the
//! controller prefers the binary framing on the wire but accepts replies in
//! either, keyed by the reply `Content-Type`.

use std::sync::Arc;

use dfq_common::{DfqError, Result};

use crate::protocol::TaskUpdateRequest;
use crate::task::{TaskInfo, TaskStatus};

/// JSON framing content type.
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// Binary (MessagePack) framing content type.
pub const CONTENT_TYPE_BINARY: &str = "application/x-msgpack";

/// One framing of the task message types.
pub trait TaskCodec: Send + Sync {
    /// Content type this codec produces and consumes.
    fn content_type(&self) -> &'static str;

    /// Encode an update request body.
    fn encode_update_request(&self, request: &TaskUpdateRequest) -> Result<Vec<u8>>;
    /// Decode a task status reply.
    fn decode_task_status(&self, body: &[u8]) -> Result<TaskStatus>;
    /// Decode a task info reply.
    fn decode_task_info(&self, body: &[u8]) -> Result<TaskInfo>;

    /// Encode a task status (worker side / test harnesses).
    fn encode_task_status(&self, status: &TaskStatus) -> Result<Vec<u8>>;
    /// Encode a task info (worker side / test harnesses).
    fn encode_task_info(&self, info: &TaskInfo) -> Result<Vec<u8>>;
    /// Decode an update request body (worker side / test harnesses).
    fn decode_update_request(&self, body: &[u8]) -> Result<TaskUpdateRequest>;
}

/// Textual JSON framing.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonTaskCodec;

impl TaskCodec for JsonTaskCodec {
    fn content_type(&self) -> &'static str {
        CONTENT_TYPE_JSON
    }

    fn encode_update_request(&self, request: &TaskUpdateRequest) -> Result<Vec<u8>> {
        serde_json::to_vec(request).map_err(|e| DfqError::Codec(format!("encode update: {e}")))
    }

    fn decode_task_status(&self, body: &[u8]) -> Result<TaskStatus> {
        serde_json::from_slice(body).map_err(|e| DfqError::Codec(format!("decode status: {e}")))
    }

    fn decode_task_info(&self, body: &[u8]) -> Result<TaskInfo> {
        serde_json::from_slice(body).map_err(|e| DfqError::Codec(format!("decode info: {e}")))
    }

    fn encode_task_status(&self, status: &TaskStatus) -> Result<Vec<u8>> {
        serde_json::to_vec(status).map_err(|e| DfqError::Codec(format!("encode status: {e}")))
    }

    fn encode_task_info(&self, info: &TaskInfo) -> Result<Vec<u8>> {
        serde_json::to_vec(info).map_err(|e| DfqError::Codec(format!("encode info: {e}")))
    }

    fn decode_update_request(&self, body: &[u8]) -> Result<TaskUpdateRequest> {
        serde_json::from_slice(body).map_err(|e| DfqError::Codec(format!("decode update: {e}")))
    }
}

/// Compact binary framing (MessagePack, string-keyed so both framings
/// describe identical structures).
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryTaskCodec;

impl TaskCodec for BinaryTaskCodec {
    fn content_type(&self) -> &'static str {
        CONTENT_TYPE_BINARY
    }

    fn encode_update_request(&self, request: &TaskUpdateRequest) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(request).map_err(|e| DfqError::Codec(format!("encode update: {e}")))
    }

    fn decode_task_status(&self, body: &[u8]) -> Result<TaskStatus> {
        rmp_serde::from_slice(body).map_err(|e| DfqError::Codec(format!("decode status: {e}")))
    }

    fn decode_task_info(&self, body: &[u8]) -> Result<TaskInfo> {
        rmp_serde::from_slice(body).map_err(|e| DfqError::Codec(format!("decode info: {e}")))
    }

    fn encode_task_status(&self, status: &TaskStatus) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(status).map_err(|e| DfqError::Codec(format!("encode status: {e}")))
    }

    fn encode_task_info(&self, info: &TaskInfo) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(info).map_err(|e| DfqError::Codec(format!("encode info: {e}")))
    }

    fn decode_update_request(&self, body: &[u8]) -> Result<TaskUpdateRequest> {
        rmp_serde::from_slice(body).map_err(|e| DfqError::Codec(format!("decode update: {e}")))
    }
}

/// Preferred/fallback codec pair with reply-side content negotiation.
#[derive(Clone)]
pub struct CodecSet {
    preferred: Arc<dyn TaskCodec>,
    fallback: Arc<dyn TaskCodec>,
}

impl CodecSet {
    /// Binary-preferred pair (the default wire configuration).
    pub fn binary_preferred() -> Self {
        Self {
            preferred: Arc::new(BinaryTaskCodec),
            fallback: Arc::new(JsonTaskCodec),
        }
    }

    /// JSON-preferred pair.
    pub fn json_preferred() -> Self {
        Self {
            preferred: Arc::new(JsonTaskCodec),
            fallback: Arc::new(BinaryTaskCodec),
        }
    }

    /// Pair selected by configuration.
    pub fn from_preference(prefer_binary: bool) -> Self {
        if prefer_binary {
            Self::binary_preferred()
        } else {
            Self::json_preferred()
        }
    }

    /// Content type sent on request bodies.
    pub fn request_content_type(&self) -> &'static str {
        self.preferred.content_type()
    }

    /// Accepted reply content types, preferred first.
    pub fn accept(&self) -> Vec<&'static str> {
        vec![
            self.preferred.content_type(),
            self.fallback.content_type(),
        ]
    }

    /// Encode an update request with the preferred framing.
    pub fn encode_update_request(&self, request: &TaskUpdateRequest) -> Result<Vec<u8>> {
        self.preferred.encode_update_request(request)
    }

    /// Decode a status reply by its content type.
    pub fn decode_task_status(&self, content_type: Option<&str>, body: &[u8]) -> Result<TaskStatus> {
        self.codec_for(content_type)?.decode_task_status(body)
    }

    /// Decode an info reply by its content type.
    pub fn decode_task_info(&self, content_type: Option<&str>, body: &[u8]) -> Result<TaskInfo> {
        self.codec_for(content_type)?.decode_task_info(body)
    }

    // A missing content type is decoded as JSON: the textual framing is the
    // protocol baseline every worker supports.
    fn codec_for(&self, content_type: Option<&str>) -> Result<&dyn TaskCodec> {
        let Some(value) = content_type else {
            return Ok(self.json_codec());
        };
        let mime = value.split(';').next().unwrap_or(value).trim();
        if mime.eq_ignore_ascii_case(self.preferred.content_type()) {
            Ok(self.preferred.as_ref())
        } else if mime.eq_ignore_ascii_case(self.fallback.content_type()) {
            Ok(self.fallback.as_ref())
        } else {
            Err(DfqError::Codec(format!(
                "unsupported reply content type: {value}"
            )))
        }
    }

    fn json_codec(&self) -> &dyn TaskCodec {
        if self.preferred.content_type() == CONTENT_TYPE_JSON {
            self.preferred.as_ref()
        } else {
            self.fallback.as_ref()
        }
    }
}

impl Default for CodecSet {
    fn default() -> Self {
        Self::binary_preferred()
    }
}
