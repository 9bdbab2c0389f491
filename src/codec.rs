//! Wire codec: `encode`/`decode` with CRC validation (`spec.md` §4.1).
//!
//! Follows the shape of the teacher crate's `frame_codec.rs` (a small
//! stateless struct exposing paired `encode`/`decode` associated functions
//! operating on `bytes::BytesMut`), adapted to S3TP's fixed-length binary
//! header instead of a CBOR payload.

#![forbid(unsafe_code)]

use crate::crc16;
use crate::error::{Error, Result};
use crate::header::{Header, HEADER_LEN};
use bytes::{Bytes, BytesMut};

pub struct WireCodec;

impl WireCodec {
    /// Encode `header` (crc field is recomputed and overwritten) and
    /// `payload` into a single on-wire frame: header || payload.
    pub fn encode(mut header: Header, payload: &[u8]) -> Result<BytesMut> {
        if payload.len() != header.pdu_length as usize {
            return Err(Error::LengthMismatch {
                declared: header.pdu_length as usize,
                actual: payload.len(),
            });
        }
        header = header.with_crc_zeroed();
        let mut crc_input = Vec::with_capacity(HEADER_LEN + payload.len());
        crc_input.extend_from_slice(&header.to_bytes());
        crc_input.extend_from_slice(payload);
        header.crc = crc16::compute(&crc_input);

        let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(payload);
        Ok(out)
    }

    /// Decode a full on-wire frame (header + payload, no extra framing) into
    /// its header and payload, validating length and CRC.
    ///
    /// Per `spec.md` §4.3 step 1: a CRC or length failure is a transient wire
    /// error — the caller drops the frame silently, it does not escalate.
    pub fn decode(bytes: &[u8]) -> Result<(Header, Bytes)> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::LengthMismatch {
                declared: HEADER_LEN,
                actual: bytes.len(),
            });
        }
        let mut header_bytes = [0u8; HEADER_LEN];
        header_bytes.copy_from_slice(&bytes[..HEADER_LEN]);
        let header = Header::from_bytes(&header_bytes);

        let payload = &bytes[HEADER_LEN..];
        if payload.len() != header.pdu_length as usize {
            return Err(Error::LengthMismatch {
                declared: header.pdu_length as usize,
                actual: payload.len(),
            });
        }

        let zeroed = header.with_crc_zeroed();
        let mut crc_input = Vec::with_capacity(HEADER_LEN + payload.len());
        crc_input.extend_from_slice(&zeroed.to_bytes());
        crc_input.extend_from_slice(payload);
        let computed = crc16::compute(&crc_input);
        if computed != header.crc {
            return Err(Error::CrcInvalid);
        }

        Ok((header, Bytes::copy_from_slice(payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Header;

    #[test]
    fn roundtrip() {
        let h = Header::new_data(1, 0, 0, 3, false, 5).unwrap();
        let frame = WireCodec::encode(h, b"hello").unwrap();
        let (got_header, got_payload) = WireCodec::decode(&frame).unwrap();
        assert_eq!(got_payload, Bytes::from_static(b"hello"));
        assert_eq!(got_header.port, 3);
        assert_eq!(got_header.global_seq, 1);
    }

    #[test]
    fn corrupted_payload_fails_crc() {
        let h = Header::new_data(1, 0, 0, 3, false, 5).unwrap();
        let mut frame = WireCodec::encode(h, b"hello").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(WireCodec::decode(&frame), Err(Error::CrcInvalid)));
    }

    #[test]
    fn length_mismatch_detected() {
        let h = Header::new_data(1, 0, 0, 3, false, 5).unwrap();
        let frame = WireCodec::encode(h, b"hello").unwrap();
        let truncated = &frame[..frame.len() - 1];
        assert!(matches!(
            WireCodec::decode(truncated),
            Err(Error::LengthMismatch { .. })
        ));
    }

    #[test]
    fn zero_length_payload_roundtrips() {
        let h = Header::new_data(9, 0, 0, 1, false, 0).unwrap();
        let frame = WireCodec::encode(h, b"").unwrap();
        let (got_header, got_payload) = WireCodec::decode(&frame).unwrap();
        assert!(got_payload.is_empty());
        assert_eq!(got_header.pdu_length, 0);
    }

    use proptest::prelude::*;
    proptest! {
        #[test]
        fn prop_roundtrip_random_payload(
            global_seq in 0u8..=255,
            sub_seq in 0u8..=255,
            port in 0u8..0x80,
            data in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let h = Header::new_data(global_seq, sub_seq, 0, port, false, data.len() as u16).unwrap();
            let frame = WireCodec::encode(h, &data).unwrap();
            let (got_header, got_payload) = WireCodec::decode(&frame).unwrap();
            prop_assert_eq!(got_header.global_seq, global_seq);
            prop_assert_eq!(got_header.sub_seq, sub_seq);
            prop_assert_eq!(got_header.port, port);
            prop_assert_eq!(got_payload.as_ref(), data.as_slice());
        }
    }
}
