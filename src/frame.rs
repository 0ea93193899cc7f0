//! JIPv4 wire frame codec.
//!
//! Both tunnels carry the same fixed header on the IPv4-facing side:
//! a version byte, a big-endian length covering everything after itself,
//! and the 16-byte IPv6 address of the target (or source, on the return
//! path) device. The IPv6 side carries only the bare payload.

use std::net::Ipv6Addr;

use thiserror::Error;

/// The only defined JIPv4 header version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Version byte + 2-byte length + 16-byte IPv6 address.
pub const HEADER_LEN: usize = 1 + 2 + 16;

/// Largest payload carried in one datagram on either side of the gateway.
pub const MAX_PAYLOAD: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated: got {0} bytes, header alone needs {HEADER_LEN}")]
    Truncated(usize),

    #[error("unsupported JIPv4 header version {0}")]
    UnsupportedVersion(u8),

    #[error("declared length {declared} does not match {actual} bytes after the length field")]
    LengthMismatch { declared: u16, actual: usize },

    #[error("declared length {0} cannot hold a 16 byte address")]
    LengthTooShort(u16),
}

/// One decoded JIPv4 frame.
///
/// An all-zero `address` means "route to the network coordinator"; the
/// tunnels substitute it via the resolver before forwarding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub address: Ipv6Addr,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(address: Ipv6Addr, payload: Vec<u8>) -> Self {
        Frame { address, payload }
    }

    pub fn is_for_coordinator(&self) -> bool {
        self.address.is_unspecified()
    }

    /// Decodes one frame from a complete buffer (one UDP datagram).
    pub fn decode(buf: &[u8]) -> Result<Frame, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::Truncated(buf.len()));
        }
        if buf[0] != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(buf[0]));
        }

        let declared = u16::from_be_bytes([buf[1], buf[2]]);
        let actual = buf.len() - 3;
        if declared as usize != actual {
            return Err(FrameError::LengthMismatch { declared, actual });
        }

        let mut octets = [0u8; 16];
        octets.copy_from_slice(&buf[3..19]);

        Ok(Frame {
            address: Ipv6Addr::from(octets),
            payload: buf[19..].to_vec(),
        })
    }

    /// Encodes the frame for the IPv4 side. Always emits version 1.
    pub fn encode(&self) -> Vec<u8> {
        let length = (16 + self.payload.len()) as u16;

        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(PROTOCOL_VERSION);
        buf.extend_from_slice(&length.to_be_bytes());
        buf.extend_from_slice(&self.address.octets());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let frame = Frame::new("fd00::1:2:3".parse().unwrap(), b"\x01\x02hello".to_vec());
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn round_trip_empty_payload() {
        let frame = Frame::new(Ipv6Addr::LOCALHOST, Vec::new());
        let encoded = frame.encode();
        assert_eq!(encoded.len(), HEADER_LEN);
        assert_eq!(Frame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn decode_request_to_coordinator() {
        // 01 00 14 <16 zero bytes> "ping"
        let mut buf = vec![0x01, 0x00, 0x14];
        buf.extend_from_slice(&[0u8; 16]);
        buf.extend_from_slice(b"ping");

        let frame = Frame::decode(&buf).unwrap();
        assert!(frame.is_for_coordinator());
        assert_eq!(frame.payload, b"ping");
    }

    #[test]
    fn encode_reply_from_device() {
        let addr: Ipv6Addr = "fd00::1".parse().unwrap();
        let encoded = Frame::new(addr, b"pong".to_vec()).encode();

        let mut expected = vec![0x01, 0x00, 0x14];
        expected.extend_from_slice(&addr.octets());
        expected.extend_from_slice(b"pong");
        assert_eq!(encoded, expected);
    }

    #[test]
    fn rejects_short_buffer() {
        assert_eq!(Frame::decode(&[]), Err(FrameError::Truncated(0)));
        assert_eq!(Frame::decode(&[1u8; 18]), Err(FrameError::Truncated(18)));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut buf = Frame::new(Ipv6Addr::LOCALHOST, b"x".to_vec()).encode();
        buf[0] = 2;
        assert_eq!(Frame::decode(&buf), Err(FrameError::UnsupportedVersion(2)));
    }

    #[test]
    fn rejects_length_beyond_available_bytes() {
        let mut buf = Frame::new(Ipv6Addr::LOCALHOST, b"abc".to_vec()).encode();
        buf[2] += 1;
        assert_eq!(
            Frame::decode(&buf),
            Err(FrameError::LengthMismatch {
                declared: 20,
                actual: 19,
            })
        );
    }

    #[test]
    fn rejects_length_shorter_than_datagram() {
        let mut buf = Frame::new(Ipv6Addr::LOCALHOST, b"abc".to_vec()).encode();
        buf[2] -= 1;
        assert!(matches!(
            Frame::decode(&buf),
            Err(FrameError::LengthMismatch { .. })
        ));
    }
}
