//! Packet = header + payload, plus the out-of-band channel/options metadata
//! (`spec.md` §3).

use crate::header::Header;
use bitflags::bitflags;
use bytes::Bytes;

bitflags! {
    /// Out-of-band per-packet options (not on the wire — carried alongside
    /// the packet by the tx/rx pipeline).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketOptions: u8 {
        /// Automatic-repeat-request: this packet occupies the retransmission
        /// slot until acked.
        const ARQ = 0b01;
        const CUSTOM = 0b10;
    }
}

/// A fully parsed/constructed S3TP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
    /// Virtual channel 0..=6 (7 is reserved for control dispatch).
    pub channel: u8,
    pub options: PacketOptions,
}

impl Packet {
    pub fn new(header: Header, payload: Bytes, channel: u8, options: PacketOptions) -> Self {
        Self {
            header,
            payload,
            channel,
            options,
        }
    }

    pub fn is_arq(&self) -> bool {
        self.options.contains(PacketOptions::ARQ)
    }

    pub fn global_seq(&self) -> u8 {
        self.header.global_seq
    }

    pub fn port(&self) -> u8 {
        self.header.port
    }
}
