//! Decoding server frames into recognition results.
//!
//! A full response decompresses to `{"result": {"text": "..."}}`. Acks
//! carry nothing actionable. Error responses abuse the sequence field for
//! the numeric error code and put the human-readable message in the
//! payload.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::protocol::{DecodeError, Frame, MessageType};

/// One recognized utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionResult {
    pub text: String,
    pub received_at: DateTime<Utc>,
}

/// What a decoded server frame amounts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerReply {
    /// Non-empty recognition text.
    Recognized(RecognitionResult),
    /// Acknowledgement; logged only.
    Ack,
    /// Server-reported error: surfaced verbatim, never as a command.
    ServerError { code: i32, message: String },
    /// Decodable frame with nothing actionable (empty text, missing
    /// result field, or a client-side message type echoed back).
    Nothing,
}

#[derive(Deserialize)]
struct ResponsePayload {
    result: Option<ResponseResult>,
}

#[derive(Deserialize)]
struct ResponseResult {
    text: Option<String>,
}

/// Interpret one decoded frame.
///
/// Malformed payloads surface as [`DecodeError::PayloadDecode`]; the
/// receive loop logs and drops them without dying.
pub fn interpret_frame(frame: &Frame) -> Result<ServerReply, DecodeError> {
    match frame.message_type {
        MessageType::FullServerResponse => {
            let payload = frame.decompressed_payload()?;
            let parsed: ResponsePayload = serde_json::from_slice(&payload)
                .map_err(|e| DecodeError::PayloadDecode(format!("json: {e}")))?;

            if frame.sequence < 0 {
                debug!("Server marked the stream finished");
            }

            let text = parsed
                .result
                .and_then(|r| r.text)
                .map(|t| t.trim().to_string())
                .unwrap_or_default();
            if text.is_empty() {
                return Ok(ServerReply::Nothing);
            }
            Ok(ServerReply::Recognized(RecognitionResult {
                text,
                received_at: Utc::now(),
            }))
        }

        MessageType::ServerAck => {
            debug!(sequence = frame.sequence, "Server ack");
            Ok(ServerReply::Ack)
        }

        MessageType::ServerErrorResponse => {
            let code = frame.sequence;
            let payload = frame.decompressed_payload().unwrap_or_default();
            let message = if payload.is_empty() {
                format!("error code {code}")
            } else {
                String::from_utf8_lossy(&payload).into_owned()
            };
            Ok(ServerReply::ServerError { code, message })
        }

        // Client-side message types have no business arriving here.
        other => {
            warn!(?other, "Unexpected message type from server, dropping");
            Ok(ServerReply::Nothing)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CompressionMethod, Serialization, FLAG_POS_SEQUENCE};

    fn response_frame(body: &[u8]) -> Frame {
        Frame {
            message_type: MessageType::FullServerResponse,
            flags: FLAG_POS_SEQUENCE,
            serialization: Serialization::Json,
            compression: CompressionMethod::None,
            sequence: 3,
            payload: body.to_vec(),
        }
    }

    #[test]
    fn recognized_text_is_extracted_and_trimmed() {
        let frame = response_frame(r#"{"result":{"text":"  向右 "}}"#.as_bytes());
        match interpret_frame(&frame).unwrap() {
            ServerReply::Recognized(r) => assert_eq!(r.text, "向右"),
            other => panic!("expected Recognized, got {other:?}"),
        }
    }

    #[test]
    fn gzip_compressed_response_decodes() {
        // Build via the client constructor to get real gzip bytes, then
        // rewrite the type to a server response.
        let mut frame = Frame::full_client_request(3, br#"{"result":{"text":"up"}}"#);
        frame.message_type = MessageType::FullServerResponse;
        match interpret_frame(&frame).unwrap() {
            ServerReply::Recognized(r) => assert_eq!(r.text, "up"),
            other => panic!("expected Recognized, got {other:?}"),
        }
    }

    #[test]
    fn empty_or_missing_text_is_nothing() {
        for body in [
            br#"{"result":{"text":""}}"#.as_slice(),
            br#"{"result":{}}"#.as_slice(),
            br#"{}"#.as_slice(),
            br#"{"result":null}"#.as_slice(),
        ] {
            assert_eq!(interpret_frame(&response_frame(body)).unwrap(), ServerReply::Nothing);
        }
    }

    #[test]
    fn malformed_json_is_a_payload_decode_error() {
        let frame = response_frame(b"{{nope");
        assert!(matches!(
            interpret_frame(&frame),
            Err(DecodeError::PayloadDecode(_))
        ));
    }

    #[test]
    fn ack_is_logged_only() {
        let frame = Frame {
            message_type: MessageType::ServerAck,
            flags: FLAG_POS_SEQUENCE,
            serialization: Serialization::Json,
            compression: CompressionMethod::None,
            sequence: 1,
            payload: Vec::new(),
        };
        assert_eq!(interpret_frame(&frame).unwrap(), ServerReply::Ack);
    }

    #[test]
    fn error_frame_carries_code_in_sequence_field() {
        let frame = Frame {
            message_type: MessageType::ServerErrorResponse,
            flags: FLAG_POS_SEQUENCE,
            serialization: Serialization::Json,
            compression: CompressionMethod::None,
            sequence: 45000001,
            payload: b"invalid token".to_vec(),
        };
        match interpret_frame(&frame).unwrap() {
            ServerReply::ServerError { code, message } => {
                assert_eq!(code, 45000001);
                assert_eq!(message, "invalid token");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[test]
    fn error_frame_with_empty_payload_falls_back_to_the_code() {
        let frame = Frame {
            message_type: MessageType::ServerErrorResponse,
            flags: FLAG_POS_SEQUENCE,
            serialization: Serialization::Json,
            compression: CompressionMethod::None,
            sequence: 429,
            payload: Vec::new(),
        };
        match interpret_frame(&frame).unwrap() {
            ServerReply::ServerError { code, message } => {
                assert_eq!(code, 429);
                assert!(message.contains("429"));
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }
}
