//! Wire contracts for the inbound channel, work queue and response channel.
//!
//! All bodies are JSON; binary image payloads travel as standard base64.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("malformed JSON body: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing required field `{field}`")]
    MissingField {
        field: &'static str,
        /// Correlation id, when the payload carried one.
        request_id: Option<String>,
        filename: String,
    },
    #[error("field `{field}` must be a string")]
    InvalidField {
        field: &'static str,
        request_id: Option<String>,
        filename: String,
    },
    #[error("field `{field}` is not valid base64: {source}")]
    Base64 {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },
}

impl MessageError {
    /// The request id the malformed payload belonged to, if recoverable.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            MessageError::MissingField { request_id, .. } | MessageError::InvalidField { request_id, .. } => {
                request_id.as_deref()
            }
            _ => None,
        }
    }

    /// The filename the malformed payload carried, or `""`.
    pub fn filename(&self) -> &str {
        match self {
            MessageError::MissingField { filename, .. } | MessageError::InvalidField { filename, .. } => filename,
            _ => "",
        }
    }
}

/// Terminal classification of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    NoFace,
    Identified(String),
    Unknown,
    /// Malformed input or an unrecoverable capability failure.
    Error,
}

impl Classification {
    pub const NO_FACE: &'static str = "No-Face";
    pub const UNKNOWN: &'static str = "Unknown";
    pub const ERROR: &'static str = "Error";

    /// Value of the `result` field on the response channel.
    pub fn as_wire(&self) -> &str {
        match self {
            Classification::NoFace => Self::NO_FACE,
            Classification::Identified(label) => label,
            Classification::Unknown => Self::UNKNOWN,
            Classification::Error => Self::ERROR,
        }
    }

    /// Reserved words win over identity labels with the same spelling.
    pub fn from_wire(value: &str) -> Self {
        match value {
            Self::NO_FACE => Classification::NoFace,
            Self::UNKNOWN => Classification::Unknown,
            Self::ERROR => Classification::Error,
            label => Classification::Identified(label.to_string()),
        }
    }
}

/// Fields are read loosely so a mistyped one still leaves the others usable.
#[derive(Deserialize)]
struct RawInbound {
    request_id: Option<serde_json::Value>,
    encoded: Option<serde_json::Value>,
    filename: Option<serde_json::Value>,
}

/// Event on the inbound channel: `{request_id, encoded, filename?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundEvent {
    pub request_id: String,
    pub encoded: String,
    pub filename: String,
}

impl InboundEvent {
    /// Build an event from raw image bytes.
    pub fn new(request_id: impl Into<String>, image: &[u8], filename: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            encoded: STANDARD.encode(image),
            filename: filename.into(),
        }
    }

    /// Parse an inbound payload. A missing or null `filename` becomes `""`.
    ///
    /// Errors carry whatever `request_id` and `filename` could be read, so
    /// the caller can still answer a malformed request.
    pub fn parse(payload: &[u8]) -> Result<Self, MessageError> {
        let raw: RawInbound = serde_json::from_slice(payload)?;
        let request_id = match raw.request_id {
            Some(serde_json::Value::String(id)) if !id.is_empty() => Some(id),
            _ => None,
        };
        let (filename, filename_ok) = match raw.filename {
            None => (String::new(), true),
            Some(serde_json::Value::String(name)) => (name, true),
            Some(_) => (String::new(), false),
        };
        let Some(request_id) = request_id else {
            return Err(MessageError::MissingField {
                field: "request_id",
                request_id: None,
                filename,
            });
        };
        if !filename_ok {
            return Err(MessageError::InvalidField {
                field: "filename",
                request_id: Some(request_id),
                filename,
            });
        }
        let encoded = match raw.encoded {
            Some(serde_json::Value::String(encoded)) => encoded,
            None => {
                return Err(MessageError::MissingField {
                    field: "encoded",
                    request_id: Some(request_id),
                    filename,
                })
            }
            Some(_) => {
                return Err(MessageError::InvalidField {
                    field: "encoded",
                    request_id: Some(request_id),
                    filename,
                })
            }
        };
        Ok(Self {
            request_id,
            encoded,
            filename,
        })
    }

    pub fn image_bytes(&self) -> Result<Vec<u8>, MessageError> {
        STANDARD
            .decode(self.encoded.as_bytes())
            .map_err(|source| MessageError::Base64 { field: "encoded", source })
    }

    pub fn to_body(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Work queue body: `{request_id, face_image, filename}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub request_id: String,
    pub face_image: String,
    #[serde(default)]
    pub filename: String,
}

impl WorkItem {
    pub fn new(request_id: impl Into<String>, crop: &[u8], filename: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            face_image: STANDARD.encode(crop),
            filename: filename.into(),
        }
    }

    pub fn parse(body: &str) -> Result<Self, MessageError> {
        Ok(serde_json::from_str(body)?)
    }

    pub fn crop_bytes(&self) -> Result<Vec<u8>, MessageError> {
        STANDARD
            .decode(self.face_image.as_bytes())
            .map_err(|source| MessageError::Base64 { field: "face_image", source })
    }

    pub fn to_body(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Response channel body: `{request_id, result, filename}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub request_id: String,
    pub result: String,
    #[serde(default)]
    pub filename: String,
}

impl ResultMessage {
    pub fn new(request_id: impl Into<String>, classification: &Classification, filename: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            result: classification.as_wire().to_string(),
            filename: filename.into(),
        }
    }

    pub fn classification(&self) -> Classification {
        Classification::from_wire(&self.result)
    }

    pub fn parse(body: &str) -> Result<Self, MessageError> {
        Ok(serde_json::from_str(body)?)
    }

    pub fn to_body(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_parse_full() {
        let ev = InboundEvent::parse(br#"{"request_id":"r1","encoded":"AAEC","filename":"a.jpg"}"#).unwrap();
        assert_eq!(ev.request_id, "r1");
        assert_eq!(ev.filename, "a.jpg");
        assert_eq!(ev.image_bytes().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_inbound_filename_optional() {
        let ev = InboundEvent::parse(br#"{"request_id":"r2","encoded":""}"#).unwrap();
        assert_eq!(ev.filename, "");
        let ev = InboundEvent::parse(br#"{"request_id":"r2","encoded":"","filename":null}"#).unwrap();
        assert_eq!(ev.filename, "");
    }

    #[test]
    fn test_inbound_missing_request_id() {
        let err = InboundEvent::parse(br#"{"encoded":"AAEC"}"#).unwrap_err();
        assert!(matches!(err, MessageError::MissingField { field: "request_id", .. }));
        assert_eq!(err.request_id(), None);

        let err = InboundEvent::parse(br#"{"request_id":"","encoded":"AAEC"}"#).unwrap_err();
        assert!(matches!(err, MessageError::MissingField { field: "request_id", .. }));
    }

    #[test]
    fn test_inbound_missing_image_keeps_correlation() {
        let err = InboundEvent::parse(br#"{"request_id":"r3","filename":"x.png"}"#).unwrap_err();
        assert!(matches!(err, MessageError::MissingField { field: "encoded", .. }));
        assert_eq!(err.request_id(), Some("r3"));
        assert_eq!(err.filename(), "x.png");
    }

    #[test]
    fn test_inbound_mistyped_fields_keep_correlation() {
        let err = InboundEvent::parse(br#"{"request_id":"r6","encoded":"AAEC","filename":7}"#).unwrap_err();
        assert!(matches!(err, MessageError::InvalidField { field: "filename", .. }));
        assert_eq!(err.request_id(), Some("r6"));
        assert_eq!(err.filename(), "");

        let err = InboundEvent::parse(br#"{"request_id":"r7","encoded":[1,2],"filename":"y.png"}"#).unwrap_err();
        assert!(matches!(err, MessageError::InvalidField { field: "encoded", .. }));
        assert_eq!(err.request_id(), Some("r7"));
        assert_eq!(err.filename(), "y.png");

        let err = InboundEvent::parse(br#"{"request_id":42,"encoded":"AAEC"}"#).unwrap_err();
        assert!(matches!(err, MessageError::MissingField { field: "request_id", .. }));
        assert_eq!(err.request_id(), None);
    }

    #[test]
    fn test_inbound_not_json() {
        assert!(matches!(InboundEvent::parse(b"\xff\xfe"), Err(MessageError::Json(_))));
    }

    #[test]
    fn test_inbound_bad_base64() {
        let ev = InboundEvent::parse(br#"{"request_id":"r4","encoded":"***"}"#).unwrap();
        assert!(matches!(ev.image_bytes(), Err(MessageError::Base64 { field: "encoded", .. })));
    }

    #[test]
    fn test_work_item_wire_shape() {
        let item = WorkItem::new("r5", &[0xFF, 0xD8], "face.jpg");
        let value: serde_json::Value = serde_json::from_str(&item.to_body().unwrap()).unwrap();
        assert_eq!(value["request_id"], "r5");
        assert_eq!(value["face_image"], "/9g=");
        assert_eq!(value["filename"], "face.jpg");
        assert_eq!(WorkItem::parse(&item.to_body().unwrap()).unwrap().crop_bytes().unwrap(), vec![0xFF, 0xD8]);
    }

    #[test]
    fn test_result_wire_values() {
        let no_face = ResultMessage::new("r1", &Classification::NoFace, "");
        assert_eq!(no_face.result, "No-Face");
        let unknown = ResultMessage::new("r1", &Classification::Unknown, "");
        assert_eq!(unknown.result, "Unknown");
        let named = ResultMessage::new("r1", &Classification::Identified("alice".into()), "a.jpg");
        assert_eq!(named.result, "alice");
        assert_eq!(named.classification(), Classification::Identified("alice".into()));
    }

    #[test]
    fn test_result_filename_defaults() {
        let msg = ResultMessage::parse(r#"{"request_id":"r9","result":"Unknown"}"#).unwrap();
        assert_eq!(msg.filename, "");
        assert_eq!(msg.classification(), Classification::Unknown);
    }

    #[test]
    fn test_reserved_words_win_over_labels() {
        assert_eq!(Classification::from_wire("No-Face"), Classification::NoFace);
        assert_eq!(Classification::from_wire("Error"), Classification::Error);
        assert_eq!(Classification::from_wire("no-face"), Classification::Identified("no-face".into()));
    }
}
