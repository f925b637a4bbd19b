//! Wire framing for the TIC protocol.
//!
//! Every message carries a CRC-16/XMODEM checksum, is COBS encoded, and is
//! terminated by a single zero byte. COBS keeps the encoded form free of
//! zero bytes, so the terminator doubles as an unambiguous frame delimiter
//! in the receive stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc_all::Crc;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};

/// Frame delimiter written after every encoded frame.
pub const FRAME_DELIMITER: u8 = 0x00;

/// Largest accepted payload, matching the receive buffer on the device.
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024;

fn crc16_xmodem(bytes: &[u8]) -> u16 {
    const POLYNOMIAL: u16 = 0x1021;
    const WIDTH: usize = 16;
    const INITIAL: u16 = 0;
    const XOR: u16 = 0;
    const REFLECT: bool = false;
    let mut crc = Crc::<u16>::new(POLYNOMIAL, WIDTH, INITIAL, XOR, REFLECT);

    crc.update(bytes);
    crc.finish()
}

/// Encode one payload into its wire form, without the trailing delimiter.
///
/// The checksum is appended little-endian before stuffing. Empty payloads
/// encode to an empty frame; the device treats a bare delimiter as a
/// wake-up byte and ignores it.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::Encoding(format!(
            "payload of {} bytes exceeds the {} byte frame limit",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }

    let mut contents = Vec::with_capacity(payload.len() + 2);
    contents.extend_from_slice(payload);
    contents.extend_from_slice(&crc16_xmodem(payload).to_le_bytes());

    let mut encoded = vec![0u8; cobs::max_encoding_length(contents.len())];
    let n = cobs::encode(&contents, &mut encoded);
    encoded.truncate(n);
    Ok(encoded)
}

/// Decode one delimiter-stripped frame back into its payload.
pub fn decode(frame: &[u8]) -> Result<Vec<u8>> {
    if frame.is_empty() {
        return Ok(Vec::new());
    }

    let mut contents = frame.to_vec();
    let n = cobs::decode_in_place(&mut contents)
        .map_err(|_| Error::Decoding("invalid COBS stuffing".into()))?;
    contents.truncate(n);

    if contents.len() < 2 {
        return Err(Error::Decoding("frame too short".into()));
    }

    let payload_len = contents.len() - 2;
    let received = u16::from_le_bytes([contents[payload_len], contents[payload_len + 1]]);
    if crc16_xmodem(&contents[..payload_len]) != received {
        return Err(Error::Decoding("checksum mismatch".into()));
    }

    contents.truncate(payload_len);
    Ok(contents)
}

/// Frame codec for stream transports.
///
/// The decoder scans for delimiters, skips empty frames, and yields one
/// decoded payload per frame. The encoder writes the wire form followed by
/// the delimiter.
pub struct FrameCodec;

impl Encoder<Bytes> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<()> {
        let frame = encode(&payload)?;
        dst.reserve(frame.len() + 1);
        dst.put_slice(&frame);
        dst.put_u8(FRAME_DELIMITER);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        loop {
            let Some(pos) = src.iter().position(|&b| b == FRAME_DELIMITER) else {
                // An unterminated frame can never grow past the encoded
                // size of the largest payload.
                if src.len() > cobs::max_encoding_length(MAX_PAYLOAD_SIZE + 2) {
                    return Err(Error::Decoding("frame delimiter not found".into()));
                }
                return Ok(None);
            };

            let frame = src.split_to(pos);
            src.advance(1);
            if frame.is_empty() {
                continue;
            }
            return decode(&frame).map(|payload| Some(Bytes::from(payload)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn crc_check_value() {
        // CRC-16/XMODEM check value from the catalogue of parametrised CRCs
        assert_eq!(crc16_xmodem(b"123456789"), 0x31c3);
    }

    #[test_case(&[0x01, 0x00, 0x02]; "embedded zero")]
    #[test_case(b"{\"method\":\"ping\"}"; "json request")]
    #[test_case(&[0xff]; "single byte")]
    #[test_case(&[0x00; 64]; "all zeros")]
    fn round_trip(payload: &[u8]) {
        let encoded = encode(payload).unwrap();
        assert_eq!(decode(&encoded).unwrap(), payload);
    }

    #[test]
    fn encoded_frame_is_delimiter_free() {
        // 300 bytes forces more than one COBS block
        let payload: Vec<u8> = (0..300u16).map(|i| (i % 7) as u8).collect();
        let encoded = encode(&payload).unwrap();
        assert!(!encoded.contains(&FRAME_DELIMITER));
    }

    #[test]
    fn empty_payload_encodes_to_empty_frame() {
        assert!(encode(&[]).unwrap().is_empty());
        assert!(decode(&[]).unwrap().is_empty());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let payload = vec![0xaa; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(encode(&payload), Err(Error::Encoding(_))));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let mut encoded = encode(&[0x01, 0x02, 0x03]).unwrap();
        encoded.truncate(2);
        assert!(matches!(decode(&encoded), Err(Error::Decoding(_))));
    }

    #[test]
    fn short_frame_is_rejected() {
        // One stuffed byte decodes to less than a checksum's worth
        assert!(matches!(decode(&[0x02, 0x17]), Err(Error::Decoding(_))));
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut encoded = encode(&[0x01, 0x02, 0x03]).unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0x5a;
        assert!(matches!(decode(&encoded), Err(Error::Decoding(_))));
    }

    #[test]
    fn corrupted_payload_is_rejected() {
        let mut encoded = encode(b"{\"method\":\"ping\"}").unwrap();
        encoded[3] ^= 0x01;
        assert!(matches!(decode(&encoded), Err(Error::Decoding(_))));
    }

    fn wire_frame(payload: &[u8]) -> BytesMut {
        let mut codec = FrameCodec;
        let mut dst = BytesMut::new();
        codec.encode(Bytes::copy_from_slice(payload), &mut dst).unwrap();
        dst
    }

    #[test]
    fn encoder_terminates_with_single_delimiter() {
        let frame = wire_frame(&[0x01, 0x00, 0x02]);
        assert_eq!(frame.iter().filter(|&&b| b == FRAME_DELIMITER).count(), 1);
        assert_eq!(*frame.last().unwrap(), FRAME_DELIMITER);
    }

    #[test]
    fn decoder_waits_for_delimiter() {
        let mut codec = FrameCodec;
        let mut buf = wire_frame(b"abc");
        let _ = buf.split_off(buf.len() - 1);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.put_u8(FRAME_DELIMITER);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"abc"[..]);
    }

    #[test]
    fn decoder_yields_frames_in_order() {
        let mut codec = FrameCodec;
        let mut buf = wire_frame(b"first");
        buf.extend_from_slice(&wire_frame(b"second"));

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"first"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"second"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn decoder_skips_empty_frames() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&[FRAME_DELIMITER, FRAME_DELIMITER][..]);
        buf.extend_from_slice(&wire_frame(b"late"));

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"late"[..]);
    }
}
