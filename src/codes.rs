//! Numeric error codes surfaced across the application boundary (`spec.md` §6).

/// Result codes returned to application-facing APIs such as
/// `Engine::send_to_link_layer`. Mirrors the C-style error codes of the
/// original implementation but as a proper enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3tpErrorCode {
    Success,
    LinkUnavailable,
    QueueFull,
    ChannelBroken,
    MaxMessageSize,
    InternalError,
    PortClosed,
}

impl S3tpErrorCode {
    pub fn is_success(self) -> bool {
        matches!(self, S3tpErrorCode::Success)
    }
}

impl std::fmt::Display for S3tpErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            S3tpErrorCode::Success => "SUCCESS",
            S3tpErrorCode::LinkUnavailable => "LINK_UNAVAILABLE",
            S3tpErrorCode::QueueFull => "QUEUE_FULL",
            S3tpErrorCode::ChannelBroken => "CHANNEL_BROKEN",
            S3tpErrorCode::MaxMessageSize => "MAX_MESSAGE_SIZE",
            S3tpErrorCode::InternalError => "INTERNAL_ERROR",
            S3tpErrorCode::PortClosed => "PORT_CLOSED",
        };
        f.write_str(s)
    }
}
