//! Decoding of raw perf samples into [`PacketEvent`]s

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use xdpcap_common::{PacketMetadata, HEADER_LEN};

/// A captured packet as reported by the XDP program
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PacketEvent {
    pub cookie: u16,
    pub packet_length: u16,
    pub payload: Bytes,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("sample is {actual} bytes, shorter than the 4-byte header")]
    MissingHeader { actual: usize },

    #[error("header announces {expected} payload bytes but only {actual} follow")]
    TruncatedPayload { expected: usize, actual: usize },
}

/// Decode one raw sample.
///
/// The header is two little-endian `u16`s (cookie, packet length). Exactly
/// `packet_length` bytes are taken after it; anything beyond that is perf
/// record padding and is ignored.
pub fn decode(raw: &[u8]) -> Result<PacketEvent, DecodeError> {
    let (cookie, packet_length) = parse_header(raw)?;
    let end = HEADER_LEN + packet_length as usize;

    Ok(PacketEvent {
        cookie,
        packet_length,
        payload: Bytes::copy_from_slice(&raw[HEADER_LEN..end]),
    })
}

/// Same as [`decode`], but the payload shares the sample's allocation.
pub fn decode_bytes(raw: &Bytes) -> Result<PacketEvent, DecodeError> {
    let (cookie, packet_length) = parse_header(raw)?;
    let end = HEADER_LEN + packet_length as usize;

    Ok(PacketEvent {
        cookie,
        packet_length,
        payload: raw.slice(HEADER_LEN..end),
    })
}

/// Returns `(cookie, packet_length)` once the payload is known to be present.
fn parse_header(raw: &[u8]) -> Result<(u16, u16), DecodeError> {
    if raw.len() < HEADER_LEN {
        return Err(DecodeError::MissingHeader { actual: raw.len() });
    }
    let header = PacketMetadata::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let (cookie, packet_length) = (header.cookie, header.packet_len);

    let available = raw.len() - HEADER_LEN;
    if available < packet_length as usize {
        return Err(DecodeError::TruncatedPayload {
            expected: packet_length as usize,
            actual: available,
        });
    }
    Ok((cookie, packet_length))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_exact_sample() {
        let raw = [0x2A, 0x00, 0x03, 0x00, 0x01, 0x02, 0x03];
        let event = decode(&raw).expect("valid sample");

        assert_eq!(event.cookie, 42);
        assert_eq!(event.packet_length, 3);
        assert_eq!(event.payload.as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn test_decode_little_endian_cookie() {
        let raw = [0xAD, 0xDE, 0x00, 0x00];
        let event = decode(&raw).expect("header-only sample");

        assert_eq!(event.cookie, 0xdead);
        assert_eq!(event.packet_length, 0);
        assert!(event.payload.is_empty());
    }

    #[test]
    fn test_decode_ignores_trailing_padding() {
        let raw = [0x01, 0x00, 0x02, 0x00, 0xAA, 0xBB, 0x00, 0x00];
        let event = decode(&raw).unwrap();

        assert_eq!(event.payload.as_ref(), &[0xAA, 0xBB]);
        assert_eq!(event.payload.len(), event.packet_length as usize);
    }

    #[test]
    fn test_decode_truncated_payload() {
        // announces 0x0100 = 256 bytes, carries 2
        let raw = [0x01, 0x00, 0x00, 0x01, 0xAA, 0xBB];

        assert_eq!(
            decode(&raw),
            Err(DecodeError::TruncatedPayload {
                expected: 256,
                actual: 2
            })
        );
    }

    #[test]
    fn test_decode_every_short_prefix_fails() {
        let raw = [0x07, 0x00, 0x05, 0x00, 1, 2, 3, 4, 5];

        for cut in HEADER_LEN..raw.len() {
            let err = decode(&raw[..cut]).unwrap_err();
            assert!(
                matches!(err, DecodeError::TruncatedPayload { expected: 5, .. }),
                "prefix of {} bytes: {:?}",
                cut,
                err
            );
        }
        for cut in 0..HEADER_LEN {
            assert_eq!(
                decode(&raw[..cut]),
                Err(DecodeError::MissingHeader { actual: cut })
            );
        }
    }

    #[test]
    fn test_decode_bytes_shares_buffer() {
        let raw = Bytes::from_static(&[0x2A, 0x00, 0x03, 0x00, 0x01, 0x02, 0x03, 0xFF]);
        let event = decode_bytes(&raw).unwrap();

        assert_eq!(event, decode(&raw).unwrap());
        assert_eq!(event.payload.as_ptr(), raw[HEADER_LEN..].as_ptr());
    }
}
