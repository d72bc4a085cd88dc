//! Integer-tagged message types.
//!
//! WebSocket messages carry a type tag (RFC 6455 opcode) and an opaque
//! payload. [`MessageType`] is the tag; [`MessageType::message`] pairs a tag
//! with raw bytes to build a tungstenite [`Message`].

// ============================================================================
// Imports
// ============================================================================

use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::error::{Error, Result};

// ============================================================================
// MessageType
// ============================================================================

/// Message type tag.
///
/// Discriminants are the RFC 6455 opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// UTF-8 text data message.
    Text = 1,
    /// Binary data message.
    Binary = 2,
    /// Close control message.
    Close = 8,
    /// Ping control message.
    Ping = 9,
    /// Pong control message.
    Pong = 10,
}

impl MessageType {
    /// Returns the type tag of a message.
    ///
    /// Returns `None` for raw frames, which only exist on the write path.
    #[must_use]
    pub fn of(message: &Message) -> Option<Self> {
        match message {
            Message::Text(_) => Some(Self::Text),
            Message::Binary(_) => Some(Self::Binary),
            Message::Close(_) => Some(Self::Close),
            Message::Ping(_) => Some(Self::Ping),
            Message::Pong(_) => Some(Self::Pong),
            Message::Frame(_) => None,
        }
    }

    /// Returns `true` for close, ping and pong.
    #[inline]
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Builds a message of this type from a raw payload.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if a text payload is not UTF-8
    /// - [`Error::InvalidArgument`] if a close payload is malformed
    pub fn message(self, payload: Vec<u8>) -> Result<Message> {
        match self {
            Self::Text => {
                let text = String::from_utf8(payload)
                    .map_err(|_| Error::invalid_argument("text payload is not valid UTF-8"))?;
                Ok(Message::Text(text.into()))
            }
            Self::Binary => Ok(Message::Binary(payload.into())),
            Self::Ping => Ok(Message::Ping(payload.into())),
            Self::Pong => Ok(Message::Pong(payload.into())),
            Self::Close => close_message(payload),
        }
    }
}

/// Parses a close payload: empty, or a 2-byte status code and UTF-8 reason.
fn close_message(payload: Vec<u8>) -> Result<Message> {
    match payload.as_slice() {
        [] => Ok(Message::Close(None)),
        [_] => Err(Error::invalid_argument(
            "close payload must be empty or at least 2 bytes",
        )),
        [hi, lo, reason @ ..] => {
            let code = CloseCode::from(u16::from_be_bytes([*hi, *lo]));
            let reason = String::from_utf8(reason.to_vec())
                .map_err(|_| Error::invalid_argument("close reason is not valid UTF-8"))?;
            Ok(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<MessageType> for u8 {
    #[inline]
    fn from(kind: MessageType) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(Self::Text),
            2 => Ok(Self::Binary),
            8 => Ok(Self::Close),
            9 => Ok(Self::Ping),
            10 => Ok(Self::Pong),
            other => Err(Error::invalid_argument(format!(
                "unknown message type: {other}"
            ))),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_match_opcodes() {
        assert_eq!(u8::from(MessageType::Text), 1);
        assert_eq!(u8::from(MessageType::Binary), 2);
        assert_eq!(u8::from(MessageType::Close), 8);
        assert_eq!(u8::from(MessageType::Ping), 9);
        assert_eq!(u8::from(MessageType::Pong), 10);
    }

    #[test]
    fn test_try_from_unknown_tag() {
        let err = MessageType::try_from(3).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_text_message() {
        let message = MessageType::Text.message(b"hello".to_vec()).unwrap();
        assert_eq!(message, Message::Text("hello".into()));
        assert_eq!(MessageType::of(&message), Some(MessageType::Text));
    }

    #[test]
    fn test_text_rejects_invalid_utf8() {
        let err = MessageType::Text.message(vec![0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_binary_message() {
        let message = MessageType::Binary.message(vec![0, 1, 2]).unwrap();
        assert_eq!(message.into_data().as_ref(), &[0, 1, 2]);
    }

    #[test]
    fn test_close_without_payload() {
        let message = MessageType::Close.message(Vec::new()).unwrap();
        assert_eq!(message, Message::Close(None));
    }

    #[test]
    fn test_close_with_code_and_reason() {
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");

        let message = MessageType::Close.message(payload).unwrap();
        match message {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Normal);
                assert_eq!(frame.reason.as_str(), "bye");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_close_rejects_single_byte() {
        assert!(MessageType::Close.message(vec![3]).is_err());
    }

    #[test]
    fn test_is_control() {
        assert!(MessageType::Ping.is_control());
        assert!(MessageType::Close.is_control());
        assert!(!MessageType::Text.is_control());
        assert!(!MessageType::Binary.is_control());
    }
}
