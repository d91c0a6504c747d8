//! Wire protocol codec for the Manager's local-domain socket.
//!
//! Every message starts with a fixed header:
//!
//! ```text
//! [u8 version] [u8 message_type] [u16 size, native-endian]
//! ```
//!
//! `size` is the total on-wire length *including* this header. Subscribe
//! requests additionally carry a `u32 requested_size` right after the
//! header; subscribe and unsubscribe requests both carry a trailing,
//! non-NUL-terminated channel name filling out the rest of `size`.
//!
//! This is same-host IPC (the client library is built for the same target
//! as the Manager), so `size` is read and written in the platform's native
//! byte order rather than a fixed wire endianness.

use std::fmt;

/// Protocol version this Manager accepts. Any other value is a fatal
/// protocol error for the session that sent it.
pub const VERSION: u8 = 1;

/// Upper bound on any single message, request or response.
pub const MAX_MESSAGE_SIZE: usize = 1024;

/// Size in bytes of the fixed header every message starts with.
pub const HEADER_SIZE: usize = 4;

/// Recognized message type tags.
pub mod message_type {
    pub const EVENT_MODE_REQUEST: u8 = 1;
    pub const NO_EVENT_MODE_REQUEST: u8 = 2;
    pub const WRITER_SUBSCRIBE_REQUEST: u8 = 3;
    pub const READER_SUBSCRIBE_REQUEST: u8 = 4;
    pub const WRITER_UNSUBSCRIBE_REQUEST: u8 = 5;
    pub const READER_UNSUBSCRIBE_REQUEST: u8 = 6;
    pub const APPROVAL: u8 = 7;
    pub const DENIAL: u8 = 8;
    pub const CHANNEL_SUBSCRIPTION_EVENT: u8 = 9;
}

/// Fixed message-envelope prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub message_type: u8,
    pub size: u16,
}

impl Header {
    fn decode(buf: &[u8; HEADER_SIZE]) -> Header {
        Header {
            version: buf[0],
            message_type: buf[1],
            size: u16::from_ne_bytes([buf[2], buf[3]]),
        }
    }

    fn encode(self) -> [u8; HEADER_SIZE] {
        let size = self.size.to_ne_bytes();
        [self.version, self.message_type, size[0], size[1]]
    }
}

/// A decoded request from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    EventMode,
    NoEventMode,
    WriterSubscribe {
        requested_size: u32,
        channel_name: Vec<u8>,
    },
    ReaderSubscribe {
        requested_size: u32,
        channel_name: Vec<u8>,
    },
    WriterUnsubscribe {
        channel_name: Vec<u8>,
    },
    ReaderUnsubscribe {
        channel_name: Vec<u8>,
    },
}

impl Request {
    /// Whether this request is a writer-role request (subscribe or unsubscribe).
    pub fn is_writer_role(&self) -> bool {
        matches!(
            self,
            Request::WriterSubscribe { .. } | Request::WriterUnsubscribe { .. }
        )
    }
}

/// Why a buffer of bytes could not be decoded into a [`Request`].
///
/// Every variant here is, per the protocol's own rules, fatal to the
/// session that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes than a header were read.
    ShortRead,
    /// `header.version != VERSION`.
    BadVersion,
    /// `header.size != bytes_read`.
    SizeMismatch,
    /// No known request carries this `message_type`.
    UnknownMessageType,
    /// A subscribe/unsubscribe request's declared `size` is smaller than
    /// its fixed fields, i.e. the trailing name would have negative length.
    Truncated,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            DecodeError::ShortRead => "read error",
            DecodeError::BadVersion => "version error",
            DecodeError::SizeMismatch => "msg size error",
            DecodeError::UnknownMessageType => "unsupported msg",
            DecodeError::Truncated => "truncated msg",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for DecodeError {}

const SUBSCRIBE_FIXED_LEN: usize = HEADER_SIZE + 4; // header + requested_size
const UNSUBSCRIBE_FIXED_LEN: usize = HEADER_SIZE;

/// Decode exactly one message out of `buf`, where `buf` is the slice
/// actually returned by a single `read()` call (its length therefore
/// stands in for "bytes read" in the header-size check).
pub fn decode_request(buf: &[u8]) -> Result<Request, DecodeError> {
    if buf.len() < HEADER_SIZE {
        return Err(DecodeError::ShortRead);
    }
    let mut header_bytes = [0u8; HEADER_SIZE];
    header_bytes.copy_from_slice(&buf[..HEADER_SIZE]);
    let header = Header::decode(&header_bytes);

    if header.version != VERSION {
        return Err(DecodeError::BadVersion);
    }
    if header.size as usize != buf.len() {
        return Err(DecodeError::SizeMismatch);
    }

    match header.message_type {
        message_type::EVENT_MODE_REQUEST => Ok(Request::EventMode),
        message_type::NO_EVENT_MODE_REQUEST => Ok(Request::NoEventMode),
        message_type::WRITER_SUBSCRIBE_REQUEST | message_type::READER_SUBSCRIBE_REQUEST => {
            if buf.len() < SUBSCRIBE_FIXED_LEN {
                return Err(DecodeError::Truncated);
            }
            let requested_size = u32::from_ne_bytes([
                buf[4],
                buf[5],
                buf[6],
                buf[7],
            ]);
            let channel_name = buf[SUBSCRIBE_FIXED_LEN..].to_vec();
            if header.message_type == message_type::WRITER_SUBSCRIBE_REQUEST {
                Ok(Request::WriterSubscribe {
                    requested_size,
                    channel_name,
                })
            } else {
                Ok(Request::ReaderSubscribe {
                    requested_size,
                    channel_name,
                })
            }
        }
        message_type::WRITER_UNSUBSCRIBE_REQUEST | message_type::READER_UNSUBSCRIBE_REQUEST => {
            if buf.len() < UNSUBSCRIBE_FIXED_LEN {
                return Err(DecodeError::Truncated);
            }
            let channel_name = buf[UNSUBSCRIBE_FIXED_LEN..].to_vec();
            if header.message_type == message_type::WRITER_UNSUBSCRIBE_REQUEST {
                Ok(Request::WriterUnsubscribe { channel_name })
            } else {
                Ok(Request::ReaderUnsubscribe { channel_name })
            }
        }
        _ => Err(DecodeError::UnknownMessageType),
    }
}

/// Encode an `EVENT_MODE_REQUEST`.
pub fn encode_event_mode_request() -> [u8; HEADER_SIZE] {
    Header {
        version: VERSION,
        message_type: message_type::EVENT_MODE_REQUEST,
        size: HEADER_SIZE as u16,
    }
    .encode()
}

/// Encode a `NO_EVENT_MODE_REQUEST`.
pub fn encode_no_event_mode_request() -> [u8; HEADER_SIZE] {
    Header {
        version: VERSION,
        message_type: message_type::NO_EVENT_MODE_REQUEST,
        size: HEADER_SIZE as u16,
    }
    .encode()
}

fn encode_subscribe_request(message_type: u8, requested_size: u32, channel_name: &[u8]) -> Vec<u8> {
    let total_len = SUBSCRIBE_FIXED_LEN + channel_name.len();
    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(
        &Header {
            version: VERSION,
            message_type,
            size: total_len as u16,
        }
        .encode(),
    );
    buf.extend_from_slice(&requested_size.to_ne_bytes());
    buf.extend_from_slice(channel_name);
    buf
}

fn encode_unsubscribe_request(message_type: u8, channel_name: &[u8]) -> Vec<u8> {
    let total_len = UNSUBSCRIBE_FIXED_LEN + channel_name.len();
    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(
        &Header {
            version: VERSION,
            message_type,
            size: total_len as u16,
        }
        .encode(),
    );
    buf.extend_from_slice(channel_name);
    buf
}

/// Encode a `WRITER_SUBSCRIBE_REQUEST`.
pub fn encode_writer_subscribe_request(requested_size: u32, channel_name: &[u8]) -> Vec<u8> {
    encode_subscribe_request(message_type::WRITER_SUBSCRIBE_REQUEST, requested_size, channel_name)
}

/// Encode a `READER_SUBSCRIBE_REQUEST`.
pub fn encode_reader_subscribe_request(requested_size: u32, channel_name: &[u8]) -> Vec<u8> {
    encode_subscribe_request(message_type::READER_SUBSCRIBE_REQUEST, requested_size, channel_name)
}

/// Encode a `WRITER_UNSUBSCRIBE_REQUEST`.
pub fn encode_writer_unsubscribe_request(channel_name: &[u8]) -> Vec<u8> {
    encode_unsubscribe_request(message_type::WRITER_UNSUBSCRIBE_REQUEST, channel_name)
}

/// Encode a `READER_UNSUBSCRIBE_REQUEST`.
pub fn encode_reader_unsubscribe_request(channel_name: &[u8]) -> Vec<u8> {
    encode_unsubscribe_request(message_type::READER_UNSUBSCRIBE_REQUEST, channel_name)
}

/// A decoded reply or unsolicited notification from the Manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Approval,
    Denial,
    ChannelSubscriptionEvent { num_readers: u16, channel_name: Vec<u8> },
}

/// Decode exactly one Manager-to-client message out of `buf`.
pub fn decode_response(buf: &[u8]) -> Result<Response, DecodeError> {
    if buf.len() < HEADER_SIZE {
        return Err(DecodeError::ShortRead);
    }
    let mut header_bytes = [0u8; HEADER_SIZE];
    header_bytes.copy_from_slice(&buf[..HEADER_SIZE]);
    let header = Header::decode(&header_bytes);

    if header.version != VERSION {
        return Err(DecodeError::BadVersion);
    }
    if header.size as usize != buf.len() {
        return Err(DecodeError::SizeMismatch);
    }

    match header.message_type {
        message_type::APPROVAL => Ok(Response::Approval),
        message_type::DENIAL => Ok(Response::Denial),
        message_type::CHANNEL_SUBSCRIPTION_EVENT => {
            if buf.len() < HEADER_SIZE + 2 {
                return Err(DecodeError::Truncated);
            }
            let num_readers = u16::from_ne_bytes([buf[4], buf[5]]);
            let channel_name = buf[HEADER_SIZE + 2..].to_vec();
            Ok(Response::ChannelSubscriptionEvent {
                num_readers,
                channel_name,
            })
        }
        _ => Err(DecodeError::UnknownMessageType),
    }
}

/// Encode a fixed-size approval reply.
pub fn encode_approval() -> [u8; HEADER_SIZE] {
    Header {
        version: VERSION,
        message_type: message_type::APPROVAL,
        size: HEADER_SIZE as u16,
    }
    .encode()
}

/// Encode a fixed-size denial reply.
pub fn encode_denial() -> [u8; HEADER_SIZE] {
    Header {
        version: VERSION,
        message_type: message_type::DENIAL,
        size: HEADER_SIZE as u16,
    }
    .encode()
}

/// Encode an unsolicited reader-count notification to an event-mode writer.
///
/// Returns `None` if `channel_name` does not fit within [`MAX_MESSAGE_SIZE`].
pub fn encode_channel_subscription_event(num_readers: u16, channel_name: &[u8]) -> Option<Vec<u8>> {
    let fixed_len = HEADER_SIZE + 2; // header + num_readers
    let total_len = fixed_len + channel_name.len();
    if total_len > MAX_MESSAGE_SIZE {
        return None;
    }

    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(&Header {
        version: VERSION,
        message_type: message_type::CHANNEL_SUBSCRIPTION_EVENT,
        size: total_len as u16,
    }
    .encode());
    buf.extend_from_slice(&num_readers.to_ne_bytes());
    buf.extend_from_slice(channel_name);
    Some(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_event_mode_request() {
        let header = Header {
            version: VERSION,
            message_type: message_type::EVENT_MODE_REQUEST,
            size: HEADER_SIZE as u16,
        }
        .encode();
        assert_eq!(decode_request(&header), Ok(Request::EventMode));
    }

    #[test]
    fn decode_writer_subscribe_round_trip() {
        let name = b"trades";
        let total_len = SUBSCRIBE_FIXED_LEN + name.len();
        let mut buf = Vec::new();
        buf.extend_from_slice(&Header {
            version: VERSION,
            message_type: message_type::WRITER_SUBSCRIBE_REQUEST,
            size: total_len as u16,
        }
        .encode());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        buf.extend_from_slice(name);

        let decoded = decode_request(&buf).unwrap();
        assert_eq!(
            decoded,
            Request::WriterSubscribe {
                requested_size: 0,
                channel_name: name.to_vec(),
            }
        );
    }

    #[test]
    fn short_read_is_an_error() {
        assert_eq!(decode_request(&[1, 2]), Err(DecodeError::ShortRead));
    }

    #[test]
    fn bad_version_is_an_error() {
        let header = Header {
            version: VERSION + 1,
            message_type: message_type::EVENT_MODE_REQUEST,
            size: HEADER_SIZE as u16,
        }
        .encode();
        assert_eq!(decode_request(&header), Err(DecodeError::BadVersion));
    }

    #[test]
    fn size_mismatch_is_an_error() {
        // Header claims a 200-byte message but we only hand it 64 bytes.
        let mut buf = vec![0u8; 64];
        buf[0] = VERSION;
        buf[1] = message_type::EVENT_MODE_REQUEST;
        buf[2..4].copy_from_slice(&200u16.to_ne_bytes());
        assert_eq!(decode_request(&buf), Err(DecodeError::SizeMismatch));
    }

    #[test]
    fn unknown_message_type_is_an_error() {
        let header = Header {
            version: VERSION,
            message_type: 200,
            size: HEADER_SIZE as u16,
        }
        .encode();
        assert_eq!(decode_request(&header), Err(DecodeError::UnknownMessageType));
    }

    #[test]
    fn request_encoders_round_trip_through_decode() {
        let buf = encode_writer_subscribe_request(0, b"trades");
        assert_eq!(
            decode_request(&buf),
            Ok(Request::WriterSubscribe {
                requested_size: 0,
                channel_name: b"trades".to_vec(),
            })
        );

        let buf = encode_reader_unsubscribe_request(b"trades");
        assert_eq!(
            decode_request(&buf),
            Ok(Request::ReaderUnsubscribe {
                channel_name: b"trades".to_vec(),
            })
        );
    }

    #[test]
    fn decode_response_round_trip() {
        assert_eq!(decode_response(&encode_approval()), Ok(Response::Approval));
        assert_eq!(decode_response(&encode_denial()), Ok(Response::Denial));

        let event = encode_channel_subscription_event(2, b"x").unwrap();
        assert_eq!(
            decode_response(&event),
            Ok(Response::ChannelSubscriptionEvent {
                num_readers: 2,
                channel_name: b"x".to_vec(),
            })
        );
    }

    #[test]
    fn event_bounded_by_max_message_size() {
        let huge_name = vec![b'x'; MAX_MESSAGE_SIZE];
        assert!(encode_channel_subscription_event(3, &huge_name).is_none());

        let small_name = b"x";
        let encoded = encode_channel_subscription_event(3, small_name).unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE + 2 + 1);
    }
}
