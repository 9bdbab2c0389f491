//! Control and sync packet payload encoding (`spec.md` §3).
//!
//! These payloads are small fixed-layout structures, so — unlike the
//! teacher crate's CBOR-encoded `Frame` payloads — they are hand-packed the
//! same way the header is, matching `original_source/core/CommonTypes.h`'s
//! `S3TP_CONTROL`/`S3TP_SYNC` structs.

use crate::config::SYNC_PORT_SEQ_LEN;
use crate::error::{Error, Result};

/// Control packet payload type (`spec.md` §3, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    InitialConnect,
    Sync,
    Fin,
    Reset,
}

impl ControlType {
    fn to_byte(self) -> u8 {
        match self {
            ControlType::InitialConnect => 0x00,
            ControlType::Sync => 0x01,
            ControlType::Fin => 0x02,
            ControlType::Reset => 0x03,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            0x00 => ControlType::InitialConnect,
            0x01 => ControlType::Sync,
            0x02 => ControlType::Fin,
            0x03 => ControlType::Reset,
            other => {
                return Err(Error::protocol(format!(
                    "unknown control type byte {other:#04x}"
                )))
            }
        })
    }
}

/// Control packet payload: `{type, sync_sequence}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlPayload {
    pub control_type: ControlType,
    /// Piggyback ack flag for setup/reset handshakes. `spec.md` §4.5 refers
    /// to this informally as "ack=0/1"; carried here as the raw 16-bit
    /// `sync_sequence` field from `spec.md` §3's control-packet layout.
    pub sync_sequence: u16,
}

pub const CONTROL_PAYLOAD_LEN: usize = 3;

impl ControlPayload {
    pub fn to_bytes(self) -> [u8; CONTROL_PAYLOAD_LEN] {
        let mut out = [0u8; CONTROL_PAYLOAD_LEN];
        out[0] = self.control_type.to_byte();
        out[1..3].copy_from_slice(&self.sync_sequence.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != CONTROL_PAYLOAD_LEN {
            return Err(Error::LengthMismatch {
                declared: CONTROL_PAYLOAD_LEN,
                actual: bytes.len(),
            });
        }
        let control_type = ControlType::from_byte(bytes[0])?;
        let sync_sequence = u16::from_le_bytes([bytes[1], bytes[2]]);
        Ok(Self {
            control_type,
            sync_sequence,
        })
    }

    /// Convenience: ack flag is 0 or 1, packed in `sync_sequence`'s low bit
    /// for the setup/reset three/two-way handshakes described in `spec.md`
    /// §4.5, which only ever reference `ack ∈ {0,1}`.
    pub fn ack_bit(self) -> bool {
        self.sync_sequence & 1 != 0
    }

    pub fn with_ack_bit(control_type: ControlType, ack: bool) -> Self {
        Self {
            control_type,
            sync_sequence: if ack { 1 } else { 0 },
        }
    }

    /// FIN carries the port it closes packed alongside the ack bit: bit 0 is
    /// the ack flag, bits 1..=7 are the 7-bit port number.
    pub fn fin(port: u8, ack: bool) -> Self {
        Self {
            control_type: ControlType::Fin,
            sync_sequence: ((port as u16 & 0x7F) << 1) | (ack as u16),
        }
    }

    pub fn fin_port(self) -> u8 {
        ((self.sync_sequence >> 1) & 0x7F) as u8
    }
}

/// Sync id values (`spec.md` §3).
pub const SYNC_ID_INITIATOR: u8 = 0x00;
pub const SYNC_ID_RESPONDER: u8 = 0xFF;

/// Sync packet payload: `{sync_id, tx_global_seq, port_seq[MAX_PORTS]}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPayload {
    pub sync_id: u8,
    pub tx_global_seq: u8,
    pub port_seq: Vec<u8>,
}

impl SyncPayload {
    pub fn len_bytes() -> usize {
        2 + SYNC_PORT_SEQ_LEN
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::len_bytes());
        out.push(self.sync_id);
        out.push(self.tx_global_seq);
        let mut seq = self.port_seq.clone();
        seq.resize(SYNC_PORT_SEQ_LEN, 0);
        out.extend_from_slice(&seq);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::len_bytes() {
            return Err(Error::LengthMismatch {
                declared: Self::len_bytes(),
                actual: bytes.len(),
            });
        }
        Ok(Self {
            sync_id: bytes[0],
            tx_global_seq: bytes[1],
            port_seq: bytes[2..].to_vec(),
        })
    }
}

/// Full control-packet payload: either a handshake `{type, sync_sequence}`
/// tuple (INITIAL_CONNECT / FIN / RESET) or a full per-port `SYNC` payload.
/// `spec.md` §3 describes these as two distinct payload shapes sharing the
/// `CTRL` flag; this enum disambiguates them on the wire via the same
/// leading type byte `ControlPayload` already uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacketPayload {
    Handshake(ControlPayload),
    Sync(SyncPayload),
}

impl ControlPacketPayload {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ControlPacketPayload::Handshake(p) => p.to_bytes().to_vec(),
            ControlPacketPayload::Sync(p) => {
                let mut out = vec![ControlType::Sync.to_byte()];
                out.extend_from_slice(&p.to_bytes());
                out
            }
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::LengthMismatch {
                declared: 1,
                actual: 0,
            });
        }
        if ControlType::from_byte(bytes[0])? == ControlType::Sync {
            let sync = SyncPayload::from_bytes(&bytes[1..])?;
            Ok(ControlPacketPayload::Sync(sync))
        } else {
            let handshake = ControlPayload::from_bytes(bytes)?;
            Ok(ControlPacketPayload::Handshake(handshake))
        }
    }
}
