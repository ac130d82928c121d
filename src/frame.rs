//! WebSocket frame parsing and serialization
//!
//! Stateless RFC 6455 frame codec:
//! - [`parse`] reads one frame from the front of a byte window, or reports
//!   that more bytes are needed
//! - [`encode`] writes one frame using the minimal length encoding
//!
//! Validation happens as early as the bytes allow. Reserved bits and opcodes
//! are rejected from byte 0 alone, control-frame violations from byte 1,
//! before any payload has arrived.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{CloseReason, Error, Result};
use crate::mask::{apply_mask, generate_mask};
use crate::{MAX_CONTROL_PAYLOAD, MAX_FRAME_HEADER_SIZE, MEDIUM_MESSAGE_THRESHOLD, SMALL_MESSAGE_THRESHOLD};

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from the low nibble of byte 0
    ///
    /// Returns `None` for the reserved ranges 0x3-0x7 and 0xB-0xF.
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// A complete WebSocket frame
///
/// `payload` is always held unmasked. `mask` records the key the frame
/// carried (or will carry) on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag
    pub fin: bool,
    /// Reserved bits, must be clear
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Masking key in wire order
    pub mask: Option<[u8; 4]>,
    /// Unmasked payload
    pub payload: Bytes,
}

impl Frame {
    /// Create an unmasked frame
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>, fin: bool) -> Self {
        Self {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Create a text frame
    #[inline]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, data, true)
    }

    /// Create a binary frame
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data, true)
    }

    /// Create a ping frame
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data, true)
    }

    /// Create a pong frame
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data, true)
    }

    /// Create a close frame with status code and reason
    ///
    /// The reason is truncated on a char boundary so the payload stays within
    /// the control-frame limit.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut end = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        let mut payload = BytesMut::with_capacity(2 + end);
        payload.put_u16(code);
        payload.put_slice(&reason.as_bytes()[..end]);
        Self::new(OpCode::Close, payload.freeze(), true)
    }

    /// Create an empty close frame
    #[inline]
    pub fn close_empty() -> Self {
        Self::new(OpCode::Close, Bytes::new(), true)
    }

    /// Attach a masking key
    #[inline]
    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Whether the frame is masked on the wire
    #[inline]
    pub fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Payload length
    #[inline]
    pub fn payload_len(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// Size of the encoded header for this frame
    #[inline]
    pub fn header_size(&self) -> usize {
        header_size(self.payload.len(), self.mask.is_some())
    }

    /// Decode a close payload
    ///
    /// An empty payload yields `None`. A one-byte payload, a code that may
    /// not appear on the wire, or a non-UTF-8 reason is an error.
    pub fn parse_close(&self) -> Result<Option<CloseReason>> {
        match self.payload.len() {
            0 => Ok(None),
            1 => Err(Error::Protocol("invalid close frame payload")),
            _ => {
                let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
                if !CloseReason::is_valid_code(code) {
                    return Err(Error::InvalidCloseCode(code));
                }
                let reason =
                    std::str::from_utf8(&self.payload[2..]).map_err(|_| Error::InvalidUtf8)?;
                Ok(Some(CloseReason::new(code, reason)))
            }
        }
    }
}

/// Result of a parse attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// One complete frame and the number of bytes it occupied
    Frame { frame: Frame, consumed: usize },
    /// The window holds a valid but incomplete frame prefix
    NeedMoreData,
}

/// Encoded header size for a payload length
#[inline]
pub fn header_size(payload_len: usize, masked: bool) -> usize {
    let base = if payload_len <= SMALL_MESSAGE_THRESHOLD {
        2
    } else if payload_len <= MEDIUM_MESSAGE_THRESHOLD {
        4
    } else {
        10
    };
    if masked { base + 4 } else { base }
}

/// Parse one frame from the front of `buf` with no size limit
#[inline]
pub fn parse(buf: &[u8]) -> Result<Parsed> {
    parse_with_limit(buf, usize::MAX)
}

/// Parse one frame from the front of `buf`
///
/// Frames declaring more than `max_payload` bytes fail with
/// [`Error::FrameTooLarge`] before their payload is read.
pub fn parse_with_limit(buf: &[u8], max_payload: usize) -> Result<Parsed> {
    let Some(&b0) = buf.first() else {
        return Ok(Parsed::NeedMoreData);
    };

    let fin = b0 & 0x80 != 0;
    let rsv1 = b0 & 0x40 != 0;
    let rsv2 = b0 & 0x20 != 0;
    let rsv3 = b0 & 0x10 != 0;
    if rsv1 || rsv2 || rsv3 {
        return Err(Error::Protocol("reserved bits must be 0"));
    }
    let opcode = OpCode::from_u8(b0 & 0x0F).ok_or(Error::Protocol("reserved opcode"))?;

    let Some(&b1) = buf.get(1) else {
        return Ok(Parsed::NeedMoreData);
    };
    let masked = b1 & 0x80 != 0;
    let len7 = b1 & 0x7F;

    if opcode.is_control() {
        if !fin {
            return Err(Error::Protocol("control frame must not be fragmented"));
        }
        if len7 as usize > MAX_CONTROL_PAYLOAD {
            return Err(Error::Protocol("control frame too large"));
        }
    }

    let (payload_len, mut offset) = match len7 {
        126 => {
            if buf.len() < 4 {
                return Ok(Parsed::NeedMoreData);
            }
            let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
            if len < 126 {
                return Err(Error::Protocol("payload length not minimal"));
            }
            (len, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(Parsed::NeedMoreData);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(raw);
            if len >> 63 != 0 {
                return Err(Error::Protocol("payload length MSB must be 0"));
            }
            if len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
                return Err(Error::Protocol("payload length not minimal"));
            }
            (len, 10)
        }
        n => (n as u64, 2),
    };

    let payload_len = usize::try_from(payload_len).map_err(|_| Error::FrameTooLarge)?;
    if payload_len > max_payload {
        return Err(Error::FrameTooLarge);
    }

    let mask = if masked {
        if buf.len() < offset + 4 {
            return Ok(Parsed::NeedMoreData);
        }
        // four independent bytes, wire order
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let end = offset
        .checked_add(payload_len)
        .ok_or(Error::FrameTooLarge)?;
    if buf.len() < end {
        return Ok(Parsed::NeedMoreData);
    }

    let mut payload = BytesMut::from(&buf[offset..end]);
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    Ok(Parsed::Frame {
        frame: Frame {
            fin,
            rsv1,
            rsv2,
            rsv3,
            opcode,
            mask,
            payload: payload.freeze(),
        },
        consumed: end,
    })
}

/// Encode a frame, generating a fresh masking key when `mask` is set
pub fn encode(opcode: OpCode, payload: &[u8], mask: bool, fin: bool) -> Result<Bytes> {
    let key = if mask { Some(generate_mask()) } else { None };
    let mut buf = BytesMut::with_capacity(header_size(payload.len(), mask) + payload.len());
    encode_into(&mut buf, opcode, payload, key, fin)?;
    Ok(buf.freeze())
}

/// Encode a [`Frame`] as-is, using its own masking key if it has one
pub fn encode_frame(frame: &Frame) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(frame.header_size() + frame.payload.len());
    write_frame(
        &mut buf,
        frame.opcode,
        &frame.payload,
        frame.mask,
        frame.fin,
        [frame.rsv1, frame.rsv2, frame.rsv3],
    )?;
    Ok(buf.freeze())
}

/// Append an encoded frame to `buf`
///
/// Control frames must be final and carry at most 125 bytes.
#[inline]
pub fn encode_into(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    mask: Option<[u8; 4]>,
    fin: bool,
) -> Result<()> {
    write_frame(buf, opcode, payload, mask, fin, [false; 3])
}

fn write_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    mask: Option<[u8; 4]>,
    fin: bool,
    rsv: [bool; 3],
) -> Result<()> {
    let len = payload.len();
    if opcode.is_control() {
        if len > MAX_CONTROL_PAYLOAD {
            return Err(Error::Protocol("control frame too large"));
        }
        if !fin {
            return Err(Error::Protocol("control frame must not be fragmented"));
        }
    }

    buf.reserve(MAX_FRAME_HEADER_SIZE + len);

    let mut b0 = opcode as u8;
    if fin {
        b0 |= 0x80;
    }
    if rsv[0] {
        b0 |= 0x40;
    }
    if rsv[1] {
        b0 |= 0x20;
    }
    if rsv[2] {
        b0 |= 0x10;
    }
    buf.put_u8(b0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if len <= SMALL_MESSAGE_THRESHOLD {
        buf.put_u8(mask_bit | len as u8);
    } else if len <= MEDIUM_MESSAGE_THRESHOLD {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(len as u64);
    }

    match mask {
        Some(key) => {
            buf.put_slice(&key);
            let start = buf.len();
            buf.put_slice(payload);
            apply_mask(&mut buf[start..], key);
        }
        None => buf.put_slice(payload),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn expect_frame(buf: &[u8]) -> (Frame, usize) {
        match parse(buf).unwrap() {
            Parsed::Frame { frame, consumed } => (frame, consumed),
            Parsed::NeedMoreData => panic!("expected a complete frame"),
        }
    }

    #[test]
    fn test_parse_unmasked_text() {
        let (frame, consumed) = expect_frame(&[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
        assert_eq!(consumed, 7);
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert!(!frame.is_masked());
        assert_eq!(&frame.payload[..], b"Hello");
    }

    #[test]
    fn test_parse_masked_rfc_example() {
        let buf = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let (frame, consumed) = expect_frame(&buf);
        assert_eq!(consumed, 11);
        assert_eq!(frame.mask, Some([0x37, 0xfa, 0x21, 0x3d]));
        assert_eq!(&frame.payload[..], b"Hello");
    }

    #[test]
    fn test_encode_masked_text_size() {
        let bytes = encode(OpCode::Text, b"Hi", true, true).unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(bytes[0], 0x81);
        assert_eq!(bytes[1], 0x82);
        let key = [bytes[2], bytes[3], bytes[4], bytes[5]];
        assert_eq!(bytes[6], b'H' ^ key[0]);
        assert_eq!(bytes[7], b'i' ^ key[1]);
    }

    #[test]
    fn test_encode_16bit_length() {
        let payload = vec![0x42u8; 200];
        let bytes = encode(OpCode::Binary, &payload, false, true).unwrap();
        assert_eq!(&bytes[..4], &[0x82, 0x7E, 0x00, 0xC8]);
        assert_eq!(bytes.len(), 204);
        assert_eq!(&bytes[4..], &payload[..]);
    }

    #[test]
    fn test_encode_64bit_length() {
        let payload = vec![0u8; 65536];
        let bytes = encode(OpCode::Binary, &payload, false, true).unwrap();
        assert_eq!(bytes[1], 127);
        assert_eq!(&bytes[2..10], &65536u64.to_be_bytes());
    }

    #[test]
    fn test_oversized_close_rejected_before_payload() {
        // 16-bit length form already exceeds the control limit
        assert!(matches!(
            parse(&[0x88, 0x7E, 0x00, 0x82]),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(parse(&[0x88, 0x7E]), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_encode_oversized_control_rejected() {
        let payload = [0u8; 126];
        for op in [OpCode::Close, OpCode::Ping, OpCode::Pong] {
            assert!(encode(op, &payload, false, true).is_err());
        }
        assert!(encode(OpCode::Ping, &payload[..125], false, true).is_ok());
    }

    #[test]
    fn test_fragmented_control_rejected() {
        assert!(matches!(parse(&[0x09, 0x00]), Err(Error::Protocol(_))));
        assert!(encode(OpCode::Ping, b"", false, false).is_err());
    }

    #[test]
    fn test_non_minimal_lengths_rejected() {
        let mut buf = vec![0x82, 0x7E, 0x00, 0x7D];
        buf.extend(vec![0u8; 125]);
        assert!(matches!(parse(&buf), Err(Error::Protocol(_))));

        let mut buf = vec![0x82, 0x7F];
        buf.extend(65535u64.to_be_bytes());
        assert!(matches!(parse(&buf), Err(Error::Protocol(_))));

        let mut buf = vec![0x82, 0x7F];
        buf.extend((1u64 << 63 | 70000).to_be_bytes());
        assert!(matches!(parse(&buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_reserved_bits_and_opcodes() {
        for op in [0x3u8, 0x7, 0xB, 0xF] {
            assert!(parse(&[0x80 | op]).is_err(), "opcode {op:#x}");
        }
        assert!(parse(&[0xC1, 0x00]).is_err());
        assert!(parse(&[0xA1]).is_err());
        assert!(parse(&[0x91]).is_err());
    }

    #[test]
    fn test_need_more_data() {
        assert_eq!(parse(&[]).unwrap(), Parsed::NeedMoreData);
        assert_eq!(parse(&[0x81]).unwrap(), Parsed::NeedMoreData);
        assert_eq!(parse(&[0x82, 0x7E, 0x00]).unwrap(), Parsed::NeedMoreData);
        assert_eq!(parse(&[0x81, 0x85, 0x37, 0xfa]).unwrap(), Parsed::NeedMoreData);
        assert_eq!(parse(&[0x81, 0x05, b'H', b'e']).unwrap(), Parsed::NeedMoreData);
    }

    #[test]
    fn test_parse_leaves_trailing_bytes() {
        let mut buf = encode(OpCode::Text, b"one", false, true).unwrap().to_vec();
        buf.extend_from_slice(&encode(OpCode::Text, b"two", false, true).unwrap());
        let (first, consumed) = expect_frame(&buf);
        assert_eq!(&first.payload[..], b"one");
        let (second, _) = expect_frame(&buf[consumed..]);
        assert_eq!(&second.payload[..], b"two");
    }

    #[test]
    fn test_frame_limit() {
        let bytes = encode(OpCode::Binary, &[0u8; 300], false, true).unwrap();
        assert!(matches!(
            parse_with_limit(&bytes, 256),
            Err(Error::FrameTooLarge)
        ));
    }

    #[test]
    fn test_round_trip_boundary_lengths() {
        for len in [0usize, 125, 126, 65535, 65536] {
            let frame = Frame::binary(vec![0x5Au8; len]).with_mask([1, 2, 3, 4]);
            let bytes = encode_frame(&frame).unwrap();
            assert_eq!(bytes.len(), frame.header_size() + len);
            let (parsed, consumed) = expect_frame(&bytes);
            assert_eq!(consumed, bytes.len());
            assert_eq!(parsed, frame, "length {len}");
        }
    }

    #[test]
    fn test_close_payload() {
        let frame = Frame::close(1000, "bye");
        let reason = frame.parse_close().unwrap().unwrap();
        assert_eq!(reason.code, 1000);
        assert_eq!(reason.reason, "bye");

        assert_eq!(Frame::close_empty().parse_close().unwrap(), None);
        assert!(Frame::new(OpCode::Close, vec![0x03], true).parse_close().is_err());
        assert!(matches!(
            Frame::close(1005, "").parse_close(),
            Err(Error::InvalidCloseCode(1005))
        ));
        assert!(matches!(
            Frame::new(OpCode::Close, vec![0x03, 0xE8, 0xFF], true).parse_close(),
            Err(Error::InvalidUtf8)
        ));
    }

    #[test]
    fn test_close_reason_truncated() {
        let long = "é".repeat(100);
        let frame = Frame::close(1000, &long);
        assert!(frame.payload.len() <= MAX_CONTROL_PAYLOAD);
        assert!(frame.parse_close().is_ok());
    }

    proptest! {
        #[test]
        fn parse_inverts_encode(payload in proptest::collection::vec(any::<u8>(), 0..2048), masked in any::<bool>(), fin in any::<bool>()) {
            let bytes = encode(OpCode::Binary, &payload, masked, fin).unwrap();
            match parse(&bytes).unwrap() {
                Parsed::Frame { frame, consumed } => {
                    prop_assert_eq!(consumed, bytes.len());
                    prop_assert_eq!(frame.fin, fin);
                    prop_assert_eq!(frame.is_masked(), masked);
                    prop_assert_eq!(&frame.payload[..], &payload[..]);
                }
                Parsed::NeedMoreData => prop_assert!(false, "incomplete"),
            }
        }

        #[test]
        fn truncated_frames_need_more_data(payload in proptest::collection::vec(any::<u8>(), 1..400), cut in 0usize..400) {
            let bytes = encode(OpCode::Text, &payload, true, true).unwrap();
            let cut = cut % bytes.len();
            prop_assert_eq!(parse(&bytes[..cut]).unwrap(), Parsed::NeedMoreData);
        }
    }
}
