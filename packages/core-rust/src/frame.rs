//! Frames exchanged between a TCP broker client and the broker hub.
//!
//! Frames are internally tagged by `type` and encoded as named `MsgPack`
//! maps via `rmp_serde::to_vec_named()`. Transport framing (length prefix)
//! is the transport's concern; these helpers only handle one frame body.

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// One broker protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BrokerFrame {
    /// Client -> hub: start receiving events published on `topic`.
    #[serde(rename = "SUBSCRIBE")]
    Subscribe { topic: String },

    /// Hub -> client: the subscription on `topic` is registered. Events
    /// published after this frame is sent reach the subscriber.
    #[serde(rename = "SUBSCRIBED")]
    Subscribed { topic: String },

    /// Client -> hub: stop receiving events published on `topic`.
    #[serde(rename = "UNSUBSCRIBE")]
    Unsubscribe { topic: String },

    /// Client -> hub: fan `event` out to every current subscriber of `topic`.
    #[serde(rename = "PUBLISH")]
    Publish { topic: String, event: Event },

    /// Hub -> client: an event published on a topic this connection subscribed to.
    #[serde(rename = "DELIVER")]
    Deliver { topic: String, event: Event },
}

impl BrokerFrame {
    /// Short name of the frame variant, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "SUBSCRIBE",
            Self::Subscribed { .. } => "SUBSCRIBED",
            Self::Unsubscribe { .. } => "UNSUBSCRIBE",
            Self::Publish { .. } => "PUBLISH",
            Self::Deliver { .. } => "DELIVER",
        }
    }
}

/// Errors from encoding or decoding a frame body.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("failed to encode broker frame: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode broker frame: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encodes a frame body as a named `MsgPack` map.
///
/// # Errors
///
/// Returns `FrameError::Encode` if the frame cannot be serialized.
pub fn encode_frame(frame: &BrokerFrame) -> Result<Vec<u8>, FrameError> {
    Ok(rmp_serde::to_vec_named(frame)?)
}

/// Decodes one frame body.
///
/// # Errors
///
/// Returns `FrameError::Decode` if the bytes are not a valid frame.
pub fn decode_frame(bytes: &[u8]) -> Result<BrokerFrame, FrameError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_message() -> Event {
        Event::new("message")
            .with_field("author", "a")
            .with_field("msg", "hi")
    }

    #[test]
    fn publish_frame_survives_encoding() {
        let frame = BrokerFrame::Publish {
            topic: "chat".into(),
            event: chat_message(),
        };

        let bytes = encode_frame(&frame).expect("encode");
        let decoded = decode_frame(&bytes).expect("decode");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn delivered_payload_keeps_field_order() {
        let frame = BrokerFrame::Deliver {
            topic: "chat".into(),
            event: chat_message(),
        };

        let decoded = decode_frame(&encode_frame(&frame).unwrap()).unwrap();
        let BrokerFrame::Deliver { event, .. } = decoded else {
            panic!("expected DELIVER frame");
        };
        let keys: Vec<&str> = event.data.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["author", "msg"]);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = decode_frame(&[0xC1, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, FrameError::Decode(_)));
    }

    #[test]
    fn kind_names_match_wire_tags() {
        let frame = BrokerFrame::Subscribe {
            topic: "chat".into(),
        };
        assert_eq!(frame.kind(), "SUBSCRIBE");
        assert_eq!(
            BrokerFrame::Unsubscribe {
                topic: "chat".into()
            }
            .kind(),
            "UNSUBSCRIBE"
        );
    }
}
