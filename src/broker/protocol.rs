//! Broker wire protocol types and encoding.
//!
//! Wire format:
//!
//! ```text
//! [u32 LE: payload_len + 1] [u8: frame_type] [payload_bytes]
//! ```
//!
//! Frame types:
//! - `0x01` `ClientControl` — JSON-encoded [`ClientMessage`] (client → broker)
//! - `0x02` `BrokerControl` — JSON-encoded [`BrokerReply`] (broker → client)
//! - `0x03` `Message`       — `[u8: topic_len][topic][payload]` (broker → client)
//!
//! ## Session lifecycle
//!
//! 1. Client connects and sends [`ClientMessage::Login`]; the broker answers
//!    [`BrokerReply::LoginOk`] or [`BrokerReply::Error`].
//! 2. Each [`ClientMessage::Subscribe`] / [`ClientMessage::Unsubscribe`] is
//!    confirmed with [`BrokerReply::Ack`] (or an error frame) before the next
//!    control request is issued — the adapter serialises them on one mutex.
//! 3. Published messages arrive as `Message` frames; per-topic order on the
//!    stream is delivery order.
//!
//! Topics are at most 250 bytes, so the topic length fits the `u8` prefix.

// Rust guideline compliant 2026-02

use anyhow::{anyhow, bail, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::work::MAX_TOPIC_LEN;

/// Maximum frame payload size (16 MB).
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

// ─── Frame type constants ──────────────────────────────────────────────────

/// Frame type byte constants for the broker wire protocol.
pub mod frame_type {
    /// JSON-encoded [`super::ClientMessage`] (client → broker).
    pub const CLIENT_CONTROL: u8 = 0x01;
    /// JSON-encoded [`super::BrokerReply`] (broker → client).
    pub const BROKER_CONTROL: u8 = 0x02;
    /// Published message: `[u8 topic_len][topic][payload]` (broker → client).
    pub const MESSAGE: u8 = 0x03;
}

// ─── Control message enums ─────────────────────────────────────────────────

/// Messages sent from client to broker in `ClientControl` frames (JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Authenticate the session. Must be the first frame on the connection.
    Login {
        /// Message VPN to attach to.
        vpn: String,
        /// Account user name.
        username: String,
        /// Account password.
        password: String,
    },

    /// Request delivery of messages published on `topic`.
    ///
    /// Broker confirms with [`BrokerReply::Ack`].
    Subscribe {
        /// Topic to subscribe to.
        topic: String,
    },

    /// Revoke a previous subscription.
    ///
    /// Broker confirms with [`BrokerReply::Ack`].
    Unsubscribe {
        /// Topic to unsubscribe from.
        topic: String,
    },
}

/// Messages sent from broker to client in `BrokerControl` frames (JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BrokerReply {
    /// Login accepted; the session is live.
    LoginOk,

    /// Generic acknowledgment (Subscribe, Unsubscribe).
    Ack,

    /// A client-requested operation failed.
    Error {
        /// Human-readable error description.
        message: String,
    },
}

// ─── Frame encoding helpers ────────────────────────────────────────────────

/// Encode a client → broker control message into a wire frame.
pub fn encode_client_control(msg: &ClientMessage) -> Vec<u8> {
    let payload = serde_json::to_vec(msg).expect("control message serialization cannot fail");
    encode_raw(frame_type::CLIENT_CONTROL, &payload)
}

/// Encode a broker → client control reply into a wire frame.
pub fn encode_broker_reply(msg: &BrokerReply) -> Vec<u8> {
    let payload = serde_json::to_vec(msg).expect("control message serialization cannot fail");
    encode_raw(frame_type::BROKER_CONTROL, &payload)
}

/// Encode a published message frame: `[u8 topic_len][topic][payload]`.
///
/// # Errors
///
/// Returns an error if `topic` exceeds [`MAX_TOPIC_LEN`] bytes.
pub fn encode_message(topic: &str, payload: &[u8]) -> Result<Vec<u8>> {
    let topic_bytes = topic.as_bytes();
    if topic_bytes.len() > MAX_TOPIC_LEN {
        bail!(
            "topic is {} bytes, maximum is {MAX_TOPIC_LEN}",
            topic_bytes.len()
        );
    }
    let mut body = Vec::with_capacity(1 + topic_bytes.len() + payload.len());
    body.push(topic_bytes.len() as u8);
    body.extend_from_slice(topic_bytes);
    body.extend_from_slice(payload);
    Ok(encode_raw(frame_type::MESSAGE, &body))
}

fn encode_raw(ft: u8, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 1) as u32; // +1 for the type byte
    let mut buf = Vec::with_capacity(4 + 1 + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.push(ft);
    buf.extend_from_slice(payload);
    buf
}

// ─── Frame decoder ─────────────────────────────────────────────────────────

/// A decoded broker protocol frame.
#[derive(Debug)]
pub enum Frame {
    /// JSON-encoded [`ClientMessage`].
    ClientControl(ClientMessage),
    /// JSON-encoded [`BrokerReply`].
    BrokerControl(BrokerReply),
    /// A published message.
    Message {
        /// Destination topic.
        topic: String,
        /// Binary payload.
        payload: Bytes,
    },
}

/// Incremental frame decoder — byte accumulation over a stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a new decoder with an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed bytes and extract all complete frames.
    ///
    /// Incomplete data is retained for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error on a zero-length or oversized frame, an unknown frame
    /// type, or a malformed payload. The stream is unusable afterwards.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < 4 {
                break;
            }
            let length = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            if length == 0 {
                bail!("broker frame: zero length");
            }
            if length > MAX_FRAME_SIZE {
                bail!("broker frame too large: {length} bytes");
            }
            let total = 4 + length as usize;
            if self.buf.len() < total {
                break;
            }

            let ft = self.buf[4];
            let payload = &self.buf[5..total];
            let frame = decode_frame(ft, payload)?;
            frames.push(frame);
            self.buf.drain(..total);
        }

        Ok(frames)
    }
}

fn decode_frame(ft: u8, payload: &[u8]) -> Result<Frame> {
    match ft {
        frame_type::CLIENT_CONTROL => {
            let msg: ClientMessage = serde_json::from_slice(payload)
                .map_err(|e| anyhow!("invalid ClientControl JSON: {e}"))?;
            Ok(Frame::ClientControl(msg))
        }
        frame_type::BROKER_CONTROL => {
            let msg: BrokerReply = serde_json::from_slice(payload)
                .map_err(|e| anyhow!("invalid BrokerControl JSON: {e}"))?;
            Ok(Frame::BrokerControl(msg))
        }
        frame_type::MESSAGE => {
            if payload.is_empty() {
                bail!("Message frame is empty");
            }
            let topic_len = payload[0] as usize;
            if payload.len() < 1 + topic_len {
                bail!(
                    "Message frame too short: {} bytes, topic_len {topic_len}",
                    payload.len()
                );
            }
            let topic = std::str::from_utf8(&payload[1..1 + topic_len])
                .map_err(|e| anyhow!("Message topic is not UTF-8: {e}"))?
                .to_owned();
            Ok(Frame::Message {
                topic,
                payload: Bytes::copy_from_slice(&payload[1 + topic_len..]),
            })
        }
        _ => bail!("unknown broker frame type: 0x{ft:02x}"),
    }
}

// ─── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_round_trip() {
        let msg = ClientMessage::Login {
            vpn: "default".into(),
            username: "monitor".into(),
            password: "secret".into(),
        };
        let encoded = encode_client_control(&msg);
        let frames = FrameDecoder::new().feed(&encoded).unwrap();
        assert_eq!(frames.len(), 1);
        if let Frame::ClientControl(ClientMessage::Login { vpn, username, .. }) = &frames[0] {
            assert_eq!(vpn, "default");
            assert_eq!(username, "monitor");
        } else {
            panic!("expected ClientControl(Login)");
        }
    }

    #[test]
    fn subscribe_round_trip() {
        let encoded = encode_client_control(&ClientMessage::Subscribe {
            topic: "metrics/temp".into(),
        });
        let frames = FrameDecoder::new().feed(&encoded).unwrap();
        assert_eq!(frames.len(), 1);
        if let Frame::ClientControl(ClientMessage::Subscribe { topic }) = &frames[0] {
            assert_eq!(topic, "metrics/temp");
        } else {
            panic!("expected ClientControl(Subscribe)");
        }
    }

    #[test]
    fn unsubscribe_round_trip() {
        let encoded = encode_client_control(&ClientMessage::Unsubscribe {
            topic: "metrics/temp".into(),
        });
        let frames = FrameDecoder::new().feed(&encoded).unwrap();
        assert!(matches!(
            &frames[0],
            Frame::ClientControl(ClientMessage::Unsubscribe { .. })
        ));
    }

    #[test]
    fn broker_replies_round_trip() {
        for reply in [
            BrokerReply::LoginOk,
            BrokerReply::Ack,
            BrokerReply::Error {
                message: "no such vpn".into(),
            },
        ] {
            let encoded = encode_broker_reply(&reply);
            let frames = FrameDecoder::new().feed(&encoded).unwrap();
            assert_eq!(frames.len(), 1);
            assert!(matches!(&frames[0], Frame::BrokerControl(_)));
        }
    }

    #[test]
    fn message_round_trip() {
        let encoded = encode_message("metrics/temp", b"42").unwrap();
        let frames = FrameDecoder::new().feed(&encoded).unwrap();
        assert_eq!(frames.len(), 1);
        if let Frame::Message { topic, payload } = &frames[0] {
            assert_eq!(topic, "metrics/temp");
            assert_eq!(payload.as_ref(), b"42");
        } else {
            panic!("expected Message");
        }
    }

    #[test]
    fn message_empty_payload_round_trip() {
        let encoded = encode_message("t", b"").unwrap();
        let frames = FrameDecoder::new().feed(&encoded).unwrap();
        if let Frame::Message { topic, payload } = &frames[0] {
            assert_eq!(topic, "t");
            assert!(payload.is_empty());
        } else {
            panic!("expected Message");
        }
    }

    #[test]
    fn message_binary_payload_survives() {
        let data = [0x00u8, 0xff, 0x13, 0x37, 0x00];
        let encoded = encode_message("bin", &data).unwrap();
        let frames = FrameDecoder::new().feed(&encoded).unwrap();
        if let Frame::Message { payload, .. } = &frames[0] {
            assert_eq!(payload.as_ref(), &data);
        } else {
            panic!("expected Message");
        }
    }

    #[test]
    fn encode_message_rejects_oversized_topic() {
        let topic = "t".repeat(MAX_TOPIC_LEN + 1);
        assert!(encode_message(&topic, b"x").is_err());
    }

    #[test]
    fn partial_reassembly() {
        let encoded = encode_message("t", b"data").unwrap();
        let mid = encoded.len() / 2;
        let mut dec = FrameDecoder::new();
        assert!(dec.feed(&encoded[..mid]).unwrap().is_empty());
        let frames = dec.feed(&encoded[mid..]).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn byte_at_a_time_reassembly() {
        let encoded = encode_client_control(&ClientMessage::Subscribe { topic: "x".into() });
        let mut dec = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in &encoded {
            let mut batch = dec.feed(&[*byte]).unwrap();
            frames.append(&mut batch);
        }
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn multiple_frames_in_single_feed() {
        let mut combined = encode_broker_reply(&BrokerReply::LoginOk);
        combined.extend_from_slice(&encode_broker_reply(&BrokerReply::Ack));
        combined.extend_from_slice(&encode_message("t", b"p").unwrap());

        let frames = FrameDecoder::new().feed(&combined).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(matches!(
            &frames[0],
            Frame::BrokerControl(BrokerReply::LoginOk)
        ));
        assert!(matches!(&frames[1], Frame::BrokerControl(BrokerReply::Ack)));
        assert!(matches!(&frames[2], Frame::Message { .. }));
    }

    #[test]
    fn decoder_rejects_zero_length_frame() {
        let bad = [0u8, 0, 0, 0, frame_type::MESSAGE];
        assert!(FrameDecoder::new().feed(&bad).is_err());
    }

    #[test]
    fn decoder_rejects_oversized_frame() {
        let length: u32 = MAX_FRAME_SIZE + 1;
        let mut bad = Vec::new();
        bad.extend_from_slice(&length.to_le_bytes());
        bad.push(frame_type::MESSAGE);
        assert!(FrameDecoder::new().feed(&bad).is_err());
    }

    #[test]
    fn decoder_rejects_unknown_frame_type() {
        let payload = b"{}";
        let length = (payload.len() + 1) as u32;
        let mut frame = Vec::new();
        frame.extend_from_slice(&length.to_le_bytes());
        frame.push(0xFF);
        frame.extend_from_slice(payload);
        assert!(FrameDecoder::new().feed(&frame).is_err());
    }

    #[test]
    fn decoder_rejects_truncated_message_frame() {
        // topic_len says 5 but only 2 topic bytes follow.
        let payload = [5u8, b'a', b'b'];
        let length = (payload.len() + 1) as u32;
        let mut frame = Vec::new();
        frame.extend_from_slice(&length.to_le_bytes());
        frame.push(frame_type::MESSAGE);
        frame.extend_from_slice(&payload);
        assert!(FrameDecoder::new().feed(&frame).is_err());
    }
}
