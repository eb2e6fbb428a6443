//! Length prefixed framing over the serialized message set.
//!
//! A frame is a 4-byte big-endian length followed by an encoded
//! [`Message`](crate::messages::Message). The length cap is enforced before
//! any payload allocation on the read side.

use crate::messages::Message;
use prost::Message as ProstMessage;
use std::error::Error;
use std::fmt::{Display, Formatter};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on the encoded message size.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;
/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;
/// Headroom the replication batcher leaves under the frame cap.
pub const BATCH_SAFETY_MARGIN: usize = 32;

#[derive(Debug)]
pub enum CodecError {
    FrameTooLarge,
    UnexpectedEof,
    Malformed,
    Io(std::io::Error),
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FrameTooLarge => write!(f, "frame exceeds limits"),
            Self::UnexpectedEof => write!(f, "unexpected end of frame"),
            Self::Malformed => write!(f, "malformed message"),
            Self::Io(err) => write!(f, "frame io failure: {}", err),
        }
    }
}

impl Error for CodecError {}

impl From<std::io::Error> for CodecError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Serializes a message into a length prefixed frame.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, CodecError> {
    let body_len = message.encoded_len();
    if body_len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge);
    }
    let mut encoded = Vec::with_capacity(LENGTH_PREFIX_LEN + body_len);
    encoded.extend_from_slice(&(body_len as u32).to_be_bytes());
    message
        .encode(&mut encoded)
        .map_err(|_| CodecError::Malformed)?;
    Ok(encoded)
}

/// Attempts to decode one frame from a contiguous buffer. Returns `None`
/// when the buffer does not yet hold a complete frame.
pub fn decode_frame(buffer: &[u8]) -> Result<Option<(Message, usize)>, CodecError> {
    if buffer.len() < LENGTH_PREFIX_LEN {
        return Ok(None);
    }
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    prefix.copy_from_slice(&buffer[..LENGTH_PREFIX_LEN]);
    let body_len = u32::from_be_bytes(prefix) as usize;
    if body_len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge);
    }
    let total = LENGTH_PREFIX_LEN + body_len;
    if buffer.len() < total {
        return Ok(None);
    }
    let message = Message::decode(&buffer[LENGTH_PREFIX_LEN..total])
        .map_err(|_| CodecError::Malformed)?;
    Ok(Some((message, total)))
}

/// Reads one framed message from the stream. The cap is checked before the
/// payload buffer is allocated.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    reader.read_exact(&mut prefix).await?;
    let body_len = u32::from_be_bytes(prefix) as usize;
    if body_len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge);
    }
    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    Message::decode(body.as_slice()).map_err(|_| CodecError::Malformed)
}

/// Writes one framed message to the stream and flushes it.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let encoded = encode_frame(message)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{
        conversation_request, message, GpsLocation, ProfileSearchRequest, Request,
        StartConversationRequest,
    };
    use crate::PROTOCOL_VERSION;

    fn sample_message() -> Message {
        Message::conversation_request(
            7,
            conversation_request::Part::Start(StartConversationRequest {
                supported_versions: vec![PROTOCOL_VERSION.to_vec()],
                public_key: vec![0x11; 32],
                client_challenge: vec![0x22; 32],
            }),
        )
    }

    #[test]
    fn encode_decode_roundtrip_is_bit_identical() {
        let message = sample_message();
        let encoded = encode_frame(&message).unwrap();
        let (decoded, read) = decode_frame(&encoded).unwrap().unwrap();
        assert_eq!(read, encoded.len());
        assert_eq!(decoded, message);
        let reencoded = encode_frame(&decoded).unwrap();
        assert_eq!(reencoded, encoded);
    }

    #[test]
    fn decode_partial_buffer_asks_for_more() {
        let encoded = encode_frame(&sample_message()).unwrap();
        assert!(decode_frame(&encoded[..2]).unwrap().is_none());
        assert!(decode_frame(&encoded[..encoded.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn oversized_length_prefix_is_rejected_before_allocation() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
        buffer.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            decode_frame(&buffer),
            Err(CodecError::FrameTooLarge)
        ));
    }

    #[test]
    fn oversized_message_is_rejected_on_encode() {
        let message = Message::conversation_request(
            1,
            conversation_request::Part::ProfileSearch(ProfileSearchRequest {
                extra_data: "x".repeat(MAX_FRAME_LEN + 1),
                location: Some(GpsLocation {
                    latitude: 0.0,
                    longitude: 0.0,
                }),
                ..ProfileSearchRequest::default()
            }),
        );
        assert!(matches!(
            encode_frame(&message),
            Err(CodecError::FrameTooLarge)
        ));
    }

    #[tokio::test]
    async fn stream_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let message = sample_message();
        write_message(&mut client, &message).await.unwrap();
        let decoded = read_message(&mut server).await.unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn garbage_body_is_malformed() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&4u32.to_be_bytes());
        buffer.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(decode_frame(&buffer), Err(CodecError::Malformed)));
    }

    #[test]
    fn empty_request_envelope_decodes() {
        let message = Message {
            id: 1,
            body: Some(message::Body::Request(Request { kind: None })),
        };
        let encoded = encode_frame(&message).unwrap();
        let (decoded, _) = decode_frame(&encoded).unwrap().unwrap();
        assert_eq!(decoded, message);
    }
}
