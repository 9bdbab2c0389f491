//! Tunable protocol constants (`spec.md` §6).

use std::time::Duration;

/// Maximum unfragmented payload length in bytes. Bounded by the header's
/// 13-bit `pdu_length` field: must never exceed 8189.
pub const LEN_S3TP_PDU_MAX: u16 = 8189;

/// Number of usable virtual channels (channel 7 is reserved).
pub const S3TP_VIRTUAL_CHANNELS: u8 = 7;

/// Reserved channel used for control-packet dispatch.
pub const DEFAULT_RESERVED_CHANNEL: u8 = 0;

/// Width of the sliding reorder window over global sequence numbers.
pub const WINDOW: u16 = 256;

/// Highest port number (7-bit field).
pub const MAX_PORTS: usize = 128;

/// Fixed-size port-sequence array carried in a sync packet, sized to
/// `MAX_PORTS` (the original's `DEFAULT_MAX_OUT_PORTS`; `spec.md` is silent
/// on the exact bound so this follows the 7-bit port field's range).
pub const SYNC_PORT_SEQ_LEN: usize = MAX_PORTS;

/// Runtime-tunable S3TP parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S3tpConfig {
    /// Max payload carried in a single unfragmented packet.
    pub len_s3tp_pdu: u16,
    /// Max application message size (may require fragmentation).
    pub max_pdu_length: u32,
    /// Max memory-based queue capacity, in bytes.
    pub max_queue_size: usize,
    /// Reorder window width.
    pub window: u16,
    /// Ack wait timeout before retransmission.
    pub ack_wait_time: Duration,
    /// Max retransmission attempts before escalating to RESET.
    pub max_retransmission_count: u8,
    /// Number of usable virtual channels.
    pub virtual_channels: u8,
}

impl S3tpConfig {
    /// Validate that the configured PDU length fits the 13-bit wire field.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.len_s3tp_pdu > LEN_S3TP_PDU_MAX {
            return Err(crate::error::Error::config(format!(
                "len_s3tp_pdu {} exceeds 13-bit field maximum {}",
                self.len_s3tp_pdu, LEN_S3TP_PDU_MAX
            )));
        }
        Ok(())
    }
}

impl Default for S3tpConfig {
    fn default() -> Self {
        Self {
            len_s3tp_pdu: LEN_S3TP_PDU_MAX,
            max_pdu_length: 1 << 20,
            max_queue_size: 1 << 20, // 1 MiB
            window: WINDOW,
            ack_wait_time: Duration::from_millis(10_000),
            max_retransmission_count: 2,
            virtual_channels: S3TP_VIRTUAL_CHANNELS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(S3tpConfig::default().validate().is_ok());
    }

    #[test]
    fn oversized_pdu_rejected() {
        let cfg = S3tpConfig {
            len_s3tp_pdu: LEN_S3TP_PDU_MAX + 1,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
