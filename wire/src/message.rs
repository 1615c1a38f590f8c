use crate::Error;
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{Encode, EncodeSize, Error as CodecError, FixedSize, Read, ReadExt, Write};

/// The kind of a frame, stored in its first byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    Request = 0x01,
    Response = 0x02,
}

impl TryFrom<u8> for Kind {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Kind::Request),
            0x02 => Ok(Kind::Response),
            other => Err(CodecError::InvalidEnum(other)),
        }
    }
}

/// Fixed-size header shared by every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub kind: Kind,
    pub block_id: i64,
    pub offset: u64,
    pub length: u32,
}

impl Header {
    /// Encoded length of a header.
    pub const LEN: usize = 1 + 8 + 8 + 4;

    /// Number of payload bytes that follow this header on the wire.
    pub fn payload_len(&self) -> usize {
        match self.kind {
            Kind::Request => 0,
            Kind::Response => self.length as usize,
        }
    }
}

impl Write for Header {
    fn write(&self, buf: &mut impl BufMut) {
        (self.kind as u8).write(buf);
        self.block_id.write(buf);
        self.offset.write(buf);
        self.length.write(buf);
    }
}

impl FixedSize for Header {
    const SIZE: usize = Self::LEN;
}

impl Read for Header {
    /// Largest payload a response may announce.
    type Cfg = u32;

    fn read_cfg(buf: &mut impl Buf, max_payload: &u32) -> Result<Self, CodecError> {
        if buf.remaining() < Self::LEN {
            return Err(CodecError::EndOfBuffer);
        }
        let kind = Kind::try_from(u8::read(buf)?)?;
        let header = Self {
            kind,
            block_id: i64::read(buf)?,
            offset: u64::read(buf)?,
            length: u32::read(buf)?,
        };
        match kind {
            Kind::Request => {
                if header.block_id < 0 {
                    return Err(CodecError::Invalid(
                        "tiercache_wire::Header",
                        "negative block id in request",
                    ));
                }
            }
            Kind::Response => {
                if header.block_id < 0 && header.length != 0 {
                    return Err(CodecError::Invalid(
                        "tiercache_wire::Header",
                        "not found response carries a payload",
                    ));
                }
                if header.length > *max_payload {
                    return Err(CodecError::InvalidLength(header.length as usize));
                }
            }
        }
        Ok(header)
    }
}

/// A request for (a range of) a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Request {
    block_id: i64,
    offset: u64,
    length: u32,
}

impl Request {
    /// Requests an entire block.
    pub fn block(block_id: i64) -> Result<Self, Error> {
        Self::range(block_id, 0, 0)
    }

    /// Requests `length` bytes of a block starting at `offset` (`0` reads through the end).
    pub fn range(block_id: i64, offset: u64, length: u32) -> Result<Self, Error> {
        if block_id < 0 {
            return Err(Error::InvalidBlockId(block_id));
        }
        Ok(Self {
            block_id,
            offset,
            length,
        })
    }

    pub fn block_id(&self) -> i64 {
        self.block_id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u32 {
        self.length
    }
}

/// A response to a [Request].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    block_id: i64,
    offset: u64,
    payload: Bytes,
}

impl Response {
    /// Responds with the bytes of a block.
    pub fn found(block_id: i64, offset: u64, payload: Bytes) -> Result<Self, Error> {
        if block_id < 0 {
            return Err(Error::InvalidBlockId(block_id));
        }
        if u32::try_from(payload.len()).is_err() {
            return Err(Error::PayloadTooLarge {
                length: payload.len(),
                max: u32::MAX,
            });
        }
        Ok(Self {
            block_id,
            offset,
            payload,
        })
    }

    /// Responds that the block is not held by this node.
    pub fn not_found(block_id: i64) -> Result<Self, Error> {
        if block_id < 0 {
            return Err(Error::InvalidBlockId(block_id));
        }
        Ok(Self {
            block_id: !block_id,
            offset: 0,
            payload: Bytes::new(),
        })
    }

    /// Returns true if the responder held the block.
    pub fn is_found(&self) -> bool {
        self.block_id >= 0
    }

    /// The block id this response answers, whether or not it was found.
    pub fn requested(&self) -> i64 {
        if self.is_found() {
            self.block_id
        } else {
            !self.block_id
        }
    }

    /// The raw block id field as it appears on the wire.
    pub fn block_id(&self) -> i64 {
        self.block_id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

/// A single message exchanged between nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn kind(&self) -> Kind {
        match self {
            Message::Request(_) => Kind::Request,
            Message::Response(_) => Kind::Response,
        }
    }

    pub fn header(&self) -> Header {
        match self {
            Message::Request(request) => Header {
                kind: Kind::Request,
                block_id: request.block_id,
                offset: request.offset,
                length: request.length,
            },
            Message::Response(response) => Header {
                kind: Kind::Response,
                block_id: response.block_id,
                offset: response.offset,
                // Checked by the constructors
                length: response.payload.len() as u32,
            },
        }
    }

    /// Builds a message from a validated header and its payload.
    pub(crate) fn from_parts(header: Header, payload: Bytes) -> Self {
        match header.kind {
            Kind::Request => Message::Request(Request {
                block_id: header.block_id,
                offset: header.offset,
                length: header.length,
            }),
            Kind::Response => Message::Response(Response {
                block_id: header.block_id,
                offset: header.offset,
                payload,
            }),
        }
    }
}

impl Write for Message {
    fn write(&self, buf: &mut impl BufMut) {
        self.header().write(buf);
        if let Message::Response(response) = self {
            buf.put_slice(&response.payload);
        }
    }
}

impl EncodeSize for Message {
    fn encode_size(&self) -> usize {
        Header::LEN
            + match self {
                Message::Request(_) => 0,
                Message::Response(response) => response.payload.len(),
            }
    }
}

impl Read for Message {
    /// Largest payload a response may carry.
    type Cfg = u32;

    fn read_cfg(buf: &mut impl Buf, max_payload: &u32) -> Result<Self, CodecError> {
        let header = Header::read_cfg(buf, max_payload)?;
        let len = header.payload_len();
        if buf.remaining() < len {
            return Err(CodecError::EndOfBuffer);
        }
        Ok(Self::from_parts(header, buf.copy_to_bytes(len)))
    }
}

/// Encodes a request for an entire block.
pub fn encode_request(block_id: i64) -> Result<Bytes, Error> {
    Ok(Message::Request(Request::block(block_id)?).encode().freeze())
}

/// Encodes a response carrying `payload`.
pub fn encode_response(block_id: i64, offset: u64, payload: Bytes) -> Result<Bytes, Error> {
    Ok(Message::Response(Response::found(block_id, offset, payload)?).encode().freeze())
}

/// Encodes a response signaling that `block_id` is not held by the responder.
pub fn encode_response_not_found(block_id: i64) -> Result<Bytes, Error> {
    Ok(Message::Response(Response::not_found(block_id)?).encode().freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_MAX_PAYLOAD;
    use bytes::BytesMut;
    use commonware_codec::Decode;
    use test_case::test_case;

    #[test]
    fn test_request_layout() {
        let frame = encode_request(42).unwrap();
        assert_eq!(frame.len(), Header::LEN);
        assert_eq!(frame[0], Kind::Request as u8);
        assert_eq!(&frame[1..9], &42i64.to_be_bytes());
        assert_eq!(&frame[9..17], &0u64.to_be_bytes());
        assert_eq!(&frame[17..21], &0u32.to_be_bytes());
    }

    #[test]
    fn test_response_layout() {
        let frame = encode_response(7, 128, Bytes::from_static(b"hello")).unwrap();
        assert_eq!(frame.len(), Header::LEN + 5);
        assert_eq!(frame[0], Kind::Response as u8);
        assert_eq!(&frame[1..9], &7i64.to_be_bytes());
        assert_eq!(&frame[9..17], &128u64.to_be_bytes());
        assert_eq!(&frame[17..21], &5u32.to_be_bytes());
        assert_eq!(&frame[21..], b"hello");
    }

    #[test_case(0; "zero")]
    #[test_case(42; "small")]
    #[test_case(i64::MAX; "max")]
    fn test_not_found_is_negative(block_id: i64) {
        let response = Response::not_found(block_id).unwrap();
        assert!(response.block_id() < 0);
        assert!(!response.is_found());
        assert_eq!(response.requested(), block_id);
        assert!(response.payload().is_empty());

        let frame = encode_response_not_found(block_id).unwrap();
        let mut buf = &frame[..];
        let header = Header::read_cfg(&mut buf, &DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(header.block_id, !block_id);
        assert_eq!(header.length, 0);
    }

    #[test]
    fn test_negative_ids_rejected() {
        assert!(matches!(
            encode_request(-1),
            Err(Error::InvalidBlockId(-1))
        ));
        assert!(matches!(
            Response::found(-5, 0, Bytes::new()),
            Err(Error::InvalidBlockId(-5))
        ));
        assert!(matches!(
            Response::not_found(-5),
            Err(Error::InvalidBlockId(-5))
        ));
    }

    #[test]
    fn test_header_invalid_kind() {
        let mut frame = encode_request(1).unwrap().to_vec();
        frame[0] = 0x09;
        let result = Header::read_cfg(&mut &frame[..], &DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(CodecError::InvalidEnum(0x09))));
    }

    #[test]
    fn test_header_negative_request() {
        let mut buf = BytesMut::new();
        Header {
            kind: Kind::Request,
            block_id: -3,
            offset: 0,
            length: 0,
        }
        .write(&mut buf);
        let result = Header::read_cfg(&mut buf.freeze(), &DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(CodecError::Invalid(_, _))));
    }

    #[test]
    fn test_header_payload_too_large() {
        let frame = encode_response(1, 0, Bytes::from(vec![0u8; 64])).unwrap();
        let result = Header::read_cfg(&mut &frame[..], &63);
        assert!(matches!(result, Err(CodecError::InvalidLength(64))));
        assert!(Header::read_cfg(&mut &frame[..], &64).is_ok());
    }

    #[test]
    fn test_header_not_found_with_payload() {
        let mut buf = BytesMut::new();
        Header {
            kind: Kind::Response,
            block_id: !9,
            offset: 0,
            length: 4,
        }
        .write(&mut buf);
        let result = Header::read_cfg(&mut buf.freeze(), &DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(CodecError::Invalid(_, _))));
    }

    #[test]
    fn test_header_short_buffer() {
        let frame = encode_request(1).unwrap();
        let result = Header::read_cfg(&mut &frame[..Header::LEN - 1], &DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(CodecError::EndOfBuffer)));
    }

    #[test]
    fn test_request_range() {
        let request = Request::range(3, 4096, 512).unwrap();
        let header = Message::Request(request).header();
        assert_eq!(header.offset, 4096);
        assert_eq!(header.length, 512);
        assert_eq!(header.payload_len(), 0);
    }

    #[test]
    fn test_decode_message() {
        let message = Message::Response(
            Response::found(12, 64, Bytes::from_static(b"payload")).unwrap(),
        );
        let encoded = message.encode();
        assert_eq!(encoded.len(), message.encode_size());
        assert_eq!(Message::decode_cfg(encoded.clone(), &7).unwrap(), message);

        // Payload larger than allowed
        assert!(matches!(
            Message::decode_cfg(encoded.clone(), &6),
            Err(CodecError::InvalidLength(7))
        ));

        // Missing payload bytes
        assert!(matches!(
            Message::decode_cfg(&encoded[..encoded.len() - 1], &7),
            Err(CodecError::EndOfBuffer)
        ));

        // Trailing bytes after the frame
        let mut extended = encoded.to_vec();
        extended.push(0);
        assert!(matches!(
            Message::decode_cfg(&extended[..], &7),
            Err(CodecError::ExtraData(1))
        ));
    }
}
