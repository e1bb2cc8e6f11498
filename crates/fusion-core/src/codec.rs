//! Wire codec for publisher sockets.
//!
//! Outgoing frames are `"<header>|" + json`, where the JSON payload repeats
//! the header as `$type`:
//!
//! ```text
//! <header>|{"PublisherId":"P1","PublicationId":"U1","$type":"<header>","IsConsistent":true,"IsUpdateRequested":false}
//! ```
//!
//! Two outgoing messages share that shape and differ only in the flags:
//! *Subscribe* (`IsConsistent: true, IsUpdateRequested: false`) and
//! *RequestUpdate* (`IsConsistent: false, IsUpdateRequested: true`).
//!
//! Incoming frames carry a JSON object with `PublisherId`, `PublicationId`,
//! an optional `IsConsistent: false` (invalidation) and an optional
//! `Output.UnsafeValue` (new value). Servers may or may not prefix them with
//! a header; both forms decode. Anything that fails to parse is dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::MESSAGE_HEADER;
use crate::ids::{PublicationId, PublicationRef, PublisherId};

/// Encoder/decoder for a given frame header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameCodec {
    header: String,
}

#[derive(Serialize)]
struct OutgoingPayload<'a> {
    #[serde(rename = "PublisherId")]
    publisher_id: &'a str,
    #[serde(rename = "PublicationId")]
    publication_id: &'a str,
    #[serde(rename = "$type")]
    message_type: &'a str,
    #[serde(rename = "IsConsistent")]
    is_consistent: bool,
    #[serde(rename = "IsUpdateRequested")]
    is_update_requested: bool,
}

impl FrameCodec {
    /// Codec with a custom header string.
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }

    /// The header this codec writes.
    #[must_use]
    pub fn header(&self) -> &str {
        &self.header
    }

    /// Encode a *Subscribe* frame, sent once per publication per connection.
    #[must_use]
    pub fn encode_subscribe(&self, publication: &PublicationRef) -> String {
        self.encode(publication, true, false)
    }

    /// Encode a *RequestUpdate* frame asking the server to push a fresh value.
    #[must_use]
    pub fn encode_request_update(&self, publication: &PublicationRef) -> String {
        self.encode(publication, false, true)
    }

    fn encode(
        &self,
        publication: &PublicationRef,
        is_consistent: bool,
        is_update_requested: bool,
    ) -> String {
        let payload = OutgoingPayload {
            publisher_id: publication.publisher_id.as_str(),
            publication_id: publication.publication_id.as_str(),
            message_type: &self.header,
            is_consistent,
            is_update_requested,
        };
        // Only strings and bools: serialization cannot fail.
        let json = serde_json::to_string(&payload).unwrap_or_default();
        format!("{}|{json}", self.header)
    }

    /// Decode an incoming text frame.
    ///
    /// Returns `None` for anything that is not a JSON object carrying both
    /// correlation IDs.
    #[must_use]
    pub fn decode(text: &str) -> Option<IncomingFrame> {
        let trimmed = text.trim_start();
        let json = if trimmed.starts_with('{') {
            trimmed
        } else {
            trimmed.split_once('|')?.1
        };
        serde_json::from_str(json).ok()
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MESSAGE_HEADER)
    }
}

/// A decoded invalidation or update frame.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct IncomingFrame {
    /// Publisher the frame belongs to.
    #[serde(rename = "PublisherId")]
    pub publisher_id: PublisherId,
    /// Publication the frame belongs to.
    #[serde(rename = "PublicationId")]
    pub publication_id: PublicationId,
    /// `Some(false)` marks an invalidation.
    #[serde(rename = "IsConsistent", default)]
    pub is_consistent: Option<bool>,
    /// Present when the frame carries a new value.
    #[serde(rename = "Output", default)]
    pub output: Option<FrameOutput>,
}

/// The `Output` envelope of an update frame.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct FrameOutput {
    /// The new value.
    #[serde(rename = "UnsafeValue", default)]
    pub unsafe_value: Value,
}

impl IncomingFrame {
    /// The server signalled that the previously delivered value is stale.
    #[must_use]
    pub fn is_invalidation(&self) -> bool {
        self.is_consistent == Some(false)
    }

    /// The new value, if this frame carries one.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.output.as_ref().map(|o| &o.unsafe_value)
    }

    /// Routing key of this frame.
    #[must_use]
    pub fn publication_ref(&self) -> PublicationRef {
        PublicationRef {
            publisher_id: self.publisher_id.clone(),
            publication_id: self.publication_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_frame_matches_wire_format() {
        let codec = FrameCodec::new("SubscribeHeader");
        let frame = codec.encode_subscribe(&PublicationRef::new("P1", "U1"));
        assert_eq!(
            frame,
            r#"SubscribeHeader|{"PublisherId":"P1","PublicationId":"U1","$type":"SubscribeHeader","IsConsistent":true,"IsUpdateRequested":false}"#
        );
    }

    #[test]
    fn request_update_flags() {
        let codec = FrameCodec::default();
        let frame = codec.encode_request_update(&PublicationRef::new("P1", "U1"));
        let (header, json) = frame.split_once('|').unwrap();
        assert_eq!(header, MESSAGE_HEADER);
        let payload: Value = serde_json::from_str(json).unwrap();
        assert_eq!(payload["IsConsistent"], false);
        assert_eq!(payload["IsUpdateRequested"], true);
        assert_eq!(payload["$type"], MESSAGE_HEADER);
    }

    #[test]
    fn decode_invalidation() {
        let frame =
            FrameCodec::decode(r#"{"PublisherId":"P1","PublicationId":"U1","IsConsistent":false}"#)
                .unwrap();
        assert!(frame.is_invalidation());
        assert!(frame.value().is_none());
        assert_eq!(frame.publication_ref(), PublicationRef::new("P1", "U1"));
    }

    #[test]
    fn decode_update_with_value() {
        let frame = FrameCodec::decode(
            r#"{"PublisherId":"P1","PublicationId":"U1","IsConsistent":true,"Output":{"UnsafeValue":{"id":1}}}"#,
        )
        .unwrap();
        assert!(!frame.is_invalidation());
        assert_eq!(frame.value(), Some(&serde_json::json!({"id": 1})));
    }

    #[test]
    fn decode_header_prefixed_frame() {
        let text = format!(
            r#"{MESSAGE_HEADER}|{{"PublisherId":"P1","PublicationId":"U1","IsConsistent":false}}"#
        );
        let frame = FrameCodec::decode(&text).unwrap();
        assert!(frame.is_invalidation());
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let frame = FrameCodec::decode(
            r#"{"$type":"x","PublisherId":"P1","PublicationId":"U1","Extra":[1,2]}"#,
        )
        .unwrap();
        assert_eq!(frame.is_consistent, None);
    }

    #[test]
    fn decode_drops_garbage() {
        assert!(FrameCodec::decode("not json").is_none());
        assert!(FrameCodec::decode("{").is_none());
        assert!(FrameCodec::decode(r#"{"PublisherId":"P1"}"#).is_none());
        assert!(FrameCodec::decode("").is_none());
    }
}
