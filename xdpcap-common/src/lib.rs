//! Event layout shared between the XDP program (kernel) and userspace
//!
//! Every perf sample emitted by the XDP program starts with a
//! [`PacketMetadata`] header followed by the sampled packet bytes:
//!
//! ```text
//! +--------+--------+------------------------+
//! | cookie |  len   | payload (len bytes)    |
//! | u16 LE | u16 LE |                        |
//! +--------+--------+------------------------+
//! ```
//!
//! The header is written in the producer's native byte order. Userspace
//! decodes it as little-endian, which matches every target the probe is
//! built for (`bpfel`).

#![cfg_attr(not(feature = "userspace"), no_std)]

/// Metadata prepended to each packet sample
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct PacketMetadata {
    pub cookie: u16,
    pub packet_len: u16,
}

impl PacketMetadata {
    /// Read a header from its little-endian wire form
    pub const fn from_le_bytes(raw: [u8; HEADER_LEN]) -> Self {
        Self {
            cookie: u16::from_le_bytes([raw[0], raw[1]]),
            packet_len: u16::from_le_bytes([raw[2], raw[3]]),
        }
    }
}

/// Size of [`PacketMetadata`] on the wire
pub const HEADER_LEN: usize = 4;

/// Largest packet prefix the probe copies into a sample
pub const SAMPLE_SIZE: usize = 1024;

/// Cookie stamped by the reference probe
pub const DEFAULT_COOKIE: u16 = 0xdead;

/// Object names the reference probe exports
pub mod names {
    pub const PROGRAM: &str = "xdp_send_prog";
    pub const MAP: &str = "my_map";
}

const _: () = {
    assert!(
        core::mem::size_of::<PacketMetadata>() == HEADER_LEN,
        "PacketMetadata must be exactly 4 bytes"
    );
    assert!(
        core::mem::align_of::<PacketMetadata>() == 1,
        "PacketMetadata must be packed"
    );
};
