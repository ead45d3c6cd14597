//! Binary frame codec for the streaming recognition protocol.
//!
//! Every unit exchanged over the persistent connection is a 4-byte header,
//! a 4-byte big-endian sequence field, a 4-byte big-endian payload length,
//! and `payload length` bytes of payload. Payloads are gzip-compressed
//! JSON (or raw PCM) when the header's compression nibble says so.
//!
//! Encoding and decoding are pure functions over byte slices; no state
//! lives here.

use std::io::{Read, Write};

use byteorder::{BigEndian, ByteOrder};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol version carried in the high nibble of header byte 0.
pub const PROTOCOL_VERSION: u8 = 0b0001;

/// Header size in 4-byte words, carried in the low nibble of byte 0.
pub const HEADER_SIZE: u8 = 0b0001;

/// Minimum wire size: header (4) + sequence (4) + payload length (4).
pub const MIN_FRAME_LEN: usize = 12;

/// Flag nibble: a positive sequence field is present.
pub const FLAG_POS_SEQUENCE: u8 = 0b0001;

/// Flag nibble: sequence present and this is the final packet of the
/// stream (the sequence value is negative).
pub const FLAG_NEG_WITH_SEQUENCE: u8 = 0b0011;

// ---------------------------------------------------------------------------
// Header field enums
// ---------------------------------------------------------------------------

/// Message type, high nibble of header byte 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Handshake request carrying audio format and recognition options.
    FullClientRequest = 0b0001,
    /// One chunk of audio samples from the client.
    AudioOnlyRequest = 0b0010,
    /// Recognition result from the server.
    FullServerResponse = 0b1001,
    /// Server acknowledgement, no actionable payload.
    ServerAck = 0b1011,
    /// Server error; the sequence field holds the numeric error code.
    ServerErrorResponse = 0b1111,
}

impl MessageType {
    fn from_nibble(v: u8) -> Option<Self> {
        match v {
            0b0001 => Some(Self::FullClientRequest),
            0b0010 => Some(Self::AudioOnlyRequest),
            0b1001 => Some(Self::FullServerResponse),
            0b1011 => Some(Self::ServerAck),
            0b1111 => Some(Self::ServerErrorResponse),
            _ => None,
        }
    }
}

/// Payload serialization method, high nibble of header byte 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Serialization {
    None = 0b0000,
    Json = 0b0001,
}

impl Serialization {
    fn from_nibble(v: u8) -> Self {
        if v == 0b0001 {
            Self::Json
        } else {
            Self::None
        }
    }
}

/// Payload compression method, low nibble of header byte 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionMethod {
    None = 0b0000,
    Gzip = 0b0001,
}

impl CompressionMethod {
    fn from_nibble(v: u8) -> Self {
        if v == 0b0001 {
            Self::Gzip
        } else {
            Self::None
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Frame decode failures. These are recovered locally by dropping the
/// offending frame; they never crash the receive loop.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame too short: {0} bytes, need at least {MIN_FRAME_LEN}")]
    MalformedHeader(usize),
    #[error("truncated payload: declared {declared} bytes, {available} available")]
    TruncatedPayload { declared: usize, available: usize },
    #[error("unknown message type {0:#06b}")]
    UnknownMessageType(u8),
    #[error("payload decode failed: {0}")]
    PayloadDecode(String),
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One binary unit on the wire.
///
/// `payload` holds the bytes exactly as transmitted — already compressed
/// when `compression` is [`CompressionMethod::Gzip`]. The constructors
/// compress; [`Frame::decompressed_payload`] undoes it on the way in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub flags: u8,
    pub serialization: Serialization,
    pub compression: CompressionMethod,
    pub sequence: i32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build the handshake frame. The JSON body is gzip-compressed and the
    /// sequence field is present and positive.
    pub fn full_client_request(sequence: i32, json: &[u8]) -> Self {
        Self {
            message_type: MessageType::FullClientRequest,
            flags: FLAG_POS_SEQUENCE,
            serialization: Serialization::Json,
            compression: CompressionMethod::Gzip,
            sequence,
            payload: gzip_compress(json),
        }
    }

    /// Build an audio chunk frame. `last` marks the terminal packet of the
    /// stream, in which case `sequence` must already be negative.
    pub fn audio_only(sequence: i32, audio: &[u8], last: bool) -> Self {
        Self {
            message_type: MessageType::AudioOnlyRequest,
            flags: if last {
                FLAG_NEG_WITH_SEQUENCE
            } else {
                FLAG_POS_SEQUENCE
            },
            serialization: Serialization::Json,
            compression: CompressionMethod::Gzip,
            sequence,
            payload: gzip_compress(audio),
        }
    }

    /// Whether the flags mark this as the final packet of the stream.
    pub fn is_last(&self) -> bool {
        self.flags == FLAG_NEG_WITH_SEQUENCE
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_FRAME_LEN + self.payload.len());
        out.push((PROTOCOL_VERSION << 4) | HEADER_SIZE);
        out.push(((self.message_type as u8) << 4) | (self.flags & 0x0F));
        out.push(((self.serialization as u8) << 4) | (self.compression as u8));
        out.push(0x00);

        let mut buf = [0u8; 4];
        BigEndian::write_i32(&mut buf, self.sequence);
        out.extend_from_slice(&buf);
        BigEndian::write_u32(&mut buf, self.payload.len() as u32);
        out.extend_from_slice(&buf);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse wire bytes into a frame.
    ///
    /// Fails with [`DecodeError::MalformedHeader`] when fewer than the
    /// header + sequence + length bytes are present, and with
    /// [`DecodeError::TruncatedPayload`] when the declared payload length
    /// exceeds the bytes available.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < MIN_FRAME_LEN {
            return Err(DecodeError::MalformedHeader(bytes.len()));
        }

        let message_type = MessageType::from_nibble((bytes[1] >> 4) & 0x0F)
            .ok_or(DecodeError::UnknownMessageType((bytes[1] >> 4) & 0x0F))?;
        let flags = bytes[1] & 0x0F;
        let serialization = Serialization::from_nibble((bytes[2] >> 4) & 0x0F);
        let compression = CompressionMethod::from_nibble(bytes[2] & 0x0F);

        let sequence = BigEndian::read_i32(&bytes[4..8]);
        let declared = BigEndian::read_u32(&bytes[8..12]) as usize;
        let available = bytes.len() - MIN_FRAME_LEN;
        if available < declared {
            return Err(DecodeError::TruncatedPayload {
                declared,
                available,
            });
        }

        Ok(Self {
            message_type,
            flags,
            serialization,
            compression,
            sequence,
            payload: bytes[MIN_FRAME_LEN..MIN_FRAME_LEN + declared].to_vec(),
        })
    }

    /// Payload bytes with compression undone.
    ///
    /// Branches on the compression nibble actually read from the header
    /// rather than assuming gzip.
    pub fn decompressed_payload(&self) -> Result<Vec<u8>, DecodeError> {
        match self.compression {
            CompressionMethod::None => Ok(self.payload.clone()),
            CompressionMethod::Gzip => {
                let mut out = Vec::new();
                GzDecoder::new(self.payload.as_slice())
                    .read_to_end(&mut out)
                    .map_err(|e| DecodeError::PayloadDecode(format!("gzip: {e}")))?;
                Ok(out)
            }
        }
    }
}

fn gzip_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
    // Writing to a Vec cannot fail.
    encoder.write_all(data).expect("gzip write to Vec");
    encoder.finish().expect("gzip finish to Vec")
}

// ---------------------------------------------------------------------------
// Handshake payload
// ---------------------------------------------------------------------------

/// JSON body of the full client request, sent exactly once per connection
/// before any audio frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub user: UserMeta,
    pub audio: AudioFormat,
    pub request: RecognitionOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMeta {
    pub uid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioFormat {
    pub format: String,
    pub sample_rate: u32,
    pub bits: u16,
    pub channel: u16,
    pub codec: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionOptions {
    pub model_name: String,
    pub enable_punc: bool,
}

impl HandshakeRequest {
    pub fn new(uid: &str, sample_rate: u32, channels: u16) -> Self {
        Self {
            user: UserMeta {
                uid: uid.to_string(),
            },
            audio: AudioFormat {
                format: "pcm".to_string(),
                sample_rate,
                bits: 16,
                channel: channels,
                codec: "raw".to_string(),
            },
            request: RecognitionOptions {
                model_name: "bigmodel".to_string(),
                enable_punc: true,
            },
        }
    }

    /// Wrap this request in its wire frame with the given sequence number.
    pub fn into_frame(self, sequence: i32) -> anyhow::Result<Frame> {
        let json = serde_json::to_vec(&self)?;
        Ok(Frame::full_client_request(sequence, &json))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::full_client_request(1, br#"{"user":{"uid":"u"}}"#),
            Frame::audio_only(2, &[0u8, 1, 2, 3, 254, 255], false),
            Frame::audio_only(-7, &[9u8; 32], true),
            Frame {
                message_type: MessageType::FullServerResponse,
                flags: FLAG_POS_SEQUENCE,
                serialization: Serialization::Json,
                compression: CompressionMethod::None,
                sequence: 42,
                payload: br#"{"result":{"text":"hi"}}"#.to_vec(),
            },
            Frame {
                message_type: MessageType::ServerAck,
                flags: FLAG_POS_SEQUENCE,
                serialization: Serialization::Json,
                compression: CompressionMethod::None,
                sequence: 1,
                payload: Vec::new(),
            },
            Frame {
                message_type: MessageType::ServerErrorResponse,
                flags: FLAG_POS_SEQUENCE,
                serialization: Serialization::Json,
                compression: CompressionMethod::None,
                sequence: 45000001,
                payload: b"quota exceeded".to_vec(),
            },
        ]
    }

    #[test]
    fn round_trip_all_message_types() {
        for frame in sample_frames() {
            let decoded = Frame::decode(&frame.encode()).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn negative_sequence_survives_round_trip() {
        let frame = Frame::audio_only(-123456, b"tail", true);
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.sequence, -123456);
        assert!(decoded.is_last());
    }

    #[test]
    fn truncation_never_panics_and_always_errors() {
        for frame in sample_frames() {
            let bytes = frame.encode();
            for cut in 0..bytes.len() {
                let err = Frame::decode(&bytes[..cut]);
                assert!(
                    err.is_err(),
                    "decode of {cut}/{} bytes should fail",
                    bytes.len()
                );
            }
        }
    }

    #[test]
    fn truncated_payload_is_distinguished_from_short_header() {
        let bytes = Frame::audio_only(3, &[1u8; 100], false).encode();
        assert!(matches!(
            Frame::decode(&bytes[..8]),
            Err(DecodeError::MalformedHeader(8))
        ));
        assert!(matches!(
            Frame::decode(&bytes[..bytes.len() - 1]),
            Err(DecodeError::TruncatedPayload { .. })
        ));
    }

    #[test]
    fn header_bytes_are_bit_exact() {
        let frame = Frame::audio_only(5, b"pcm", false);
        let bytes = frame.encode();
        assert_eq!(bytes[0], 0x11); // version 1, header size 1
        assert_eq!(bytes[1], 0x21); // audio-only, positive sequence
        assert_eq!(bytes[2], 0x11); // JSON serialization, gzip compression
        assert_eq!(bytes[3], 0x00);
        assert_eq!(&bytes[4..8], &5i32.to_be_bytes());

        let last = Frame::audio_only(-6, b"pcm", true).encode();
        assert_eq!(last[1], 0x23); // audio-only, negative + final flags
        assert_eq!(&last[4..8], &(-6i32).to_be_bytes());
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let mut bytes = Frame::audio_only(1, b"x", false).encode();
        bytes[1] = (0b0111 << 4) | FLAG_POS_SEQUENCE;
        assert!(matches!(
            Frame::decode(&bytes),
            Err(DecodeError::UnknownMessageType(0b0111))
        ));
    }

    #[test]
    fn decode_honors_compression_bit() {
        // An uncompressed server response must come back verbatim.
        let plain = Frame {
            message_type: MessageType::FullServerResponse,
            flags: FLAG_POS_SEQUENCE,
            serialization: Serialization::Json,
            compression: CompressionMethod::None,
            sequence: 1,
            payload: br#"{"result":{"text":"ok"}}"#.to_vec(),
        };
        let decoded = Frame::decode(&plain.encode()).unwrap();
        assert_eq!(decoded.compression, CompressionMethod::None);
        assert_eq!(
            decoded.decompressed_payload().unwrap(),
            plain.payload
        );

        // A gzip frame must decompress to the original body.
        let body = r#"{"result":{"text":"向右"}}"#.as_bytes();
        let packed = Frame::full_client_request(1, body);
        assert_eq!(packed.decompressed_payload().unwrap(), body.to_vec());
    }

    #[test]
    fn corrupt_gzip_payload_is_a_payload_decode_error() {
        let mut frame = Frame::audio_only(2, b"audio", false);
        frame.payload = vec![0xDE, 0xAD, 0xBE, 0xEF];
        assert!(matches!(
            frame.decompressed_payload(),
            Err(DecodeError::PayloadDecode(_))
        ));
    }

    #[test]
    fn handshake_request_serializes_expected_shape() {
        let hs = HandshakeRequest::new("station-1", 16000, 1);
        let json = serde_json::to_value(&hs).unwrap();
        assert_eq!(json["user"]["uid"], "station-1");
        assert_eq!(json["audio"]["format"], "pcm");
        assert_eq!(json["audio"]["sample_rate"], 16000);
        assert_eq!(json["audio"]["bits"], 16);
        assert_eq!(json["audio"]["channel"], 1);
        assert_eq!(json["audio"]["codec"], "raw");
        assert_eq!(json["request"]["model_name"], "bigmodel");
        assert_eq!(json["request"]["enable_punc"], true);

        let frame = hs.into_frame(1).unwrap();
        assert_eq!(frame.message_type, MessageType::FullClientRequest);
        assert_eq!(frame.sequence, 1);
        assert_eq!(frame.compression, CompressionMethod::Gzip);
    }
}
