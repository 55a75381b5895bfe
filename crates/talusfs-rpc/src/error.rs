//! Error taxonomy for the RPC runtime.
//!
//! Remote failures travel as negative status codes in message headers, so
//! every error that can cross the wire has a fixed numeric mapping in
//! [`status`]. Local failures use the same code space when they are recorded
//! on a request for an interpreter or a peer to observe.

use thiserror::Error;

/// Status codes carried in the `status` field of message headers.
///
/// Negative errno-style values, matching what peers put on the wire.
pub mod status {
    /// Interrupted before completion.
    pub const EINTR: i32 = -4;
    /// Network or I/O failure.
    pub const EIO: i32 = -5;
    /// Transient failure, caller should retry.
    pub const EAGAIN: i32 = -11;
    /// Invalid argument; also the fallback for garbled error replies.
    pub const EINVAL: i32 = -22;
    /// Request torn down before it was ever sent.
    pub const EBADR: i32 = -53;
    /// Framing or protocol violation.
    pub const EPROTO: i32 = -71;
    /// Owning import failed while the request was outstanding.
    pub const ECONNABORTED: i32 = -103;
    /// Peer session is gone: evicted, or never established.
    pub const ENOTCONN: i32 = -107;
    /// Deadline passed without a reply.
    pub const ETIMEDOUT: i32 = -110;
}

/// Errors produced by the RPC runtime.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Frame did not start with the protocol magic in either byte order.
    #[error("bad message magic 0x{got:08X}")]
    BadMagic {
        /// Magic value found in the frame.
        got: u32,
    },

    /// Protocol version field failed the masked compatibility check.
    #[error("bad message version 0x{got:08X}")]
    BadVersion {
        /// Version value found in the frame.
        got: u32,
    },

    /// Frame shorter than the structure it claims to carry.
    #[error("message truncated: {len} bytes, need {need}")]
    Truncated {
        /// Bytes actually received.
        len: usize,
        /// Bytes required by the header so far decoded.
        need: usize,
    },

    /// Frame is self-inconsistent beyond simple truncation.
    #[error("malformed message: {reason}")]
    Malformed {
        /// What failed to parse.
        reason: String,
    },

    /// Peer sent a message type this side cannot accept in context.
    #[error("unexpected message type {got}")]
    BadMessageType {
        /// Raw type field from the header.
        got: u32,
    },

    /// Request deadline expired and retries were exhausted.
    #[error("request timed out")]
    Timeout,

    /// Wait abandoned by an explicit interrupt.
    #[error("request interrupted")]
    Interrupted,

    /// Send or receive failed at the network layer.
    #[error("network error")]
    Network,

    /// The owning import failed; the request was aborted with it.
    #[error("import failed")]
    ImportFailed,

    /// No usable session with the peer.
    #[error("peer not connected")]
    NotConnected,

    /// Request discarded before its first transmission.
    #[error("request aborted before send")]
    Aborted,

    /// Peer reported a status outside the canonical set.
    #[error("remote status {status}")]
    Remote {
        /// Raw status from the reply header.
        status: i32,
    },

    /// Typed message body failed to encode or decode.
    #[error("body codec error: {0}")]
    Body(String),

    /// The network driver refused an operation outright.
    #[error("driver error: {reason}")]
    Driver {
        /// Driver-supplied detail.
        reason: String,
    },
}

impl RpcError {
    /// Numeric code for embedding this error in a message header.
    pub fn to_status(&self) -> i32 {
        match self {
            RpcError::BadMagic { .. }
            | RpcError::BadVersion { .. }
            | RpcError::Truncated { .. }
            | RpcError::Malformed { .. }
            | RpcError::BadMessageType { .. }
            | RpcError::Body(_) => status::EPROTO,
            RpcError::Timeout => status::ETIMEDOUT,
            RpcError::Interrupted => status::EINTR,
            RpcError::Network | RpcError::Driver { .. } => status::EIO,
            RpcError::ImportFailed => status::ECONNABORTED,
            RpcError::NotConnected => status::ENOTCONN,
            RpcError::Aborted => status::EBADR,
            RpcError::Remote { status } => *status,
        }
    }

    /// Canonical error for a negative wire status.
    ///
    /// Codes outside the canonical set round-trip through [`RpcError::Remote`].
    pub fn from_status(code: i32) -> RpcError {
        match code {
            status::EINTR => RpcError::Interrupted,
            status::EIO => RpcError::Network,
            status::EBADR => RpcError::Aborted,
            status::EPROTO => RpcError::Malformed {
                reason: "peer reported protocol error".into(),
            },
            status::ECONNABORTED => RpcError::ImportFailed,
            status::ENOTCONN => RpcError::NotConnected,
            status::ETIMEDOUT => RpcError::Timeout,
            other => RpcError::Remote { status: other },
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_canonical() {
        for code in [
            status::EINTR,
            status::EIO,
            status::EBADR,
            status::ECONNABORTED,
            status::ENOTCONN,
            status::ETIMEDOUT,
        ] {
            let err = RpcError::from_status(code);
            assert_eq!(err.to_status(), code, "code {code} must round-trip");
        }
    }

    #[test]
    fn test_unknown_status_preserved() {
        let err = RpcError::from_status(-999);
        assert!(matches!(err, RpcError::Remote { status: -999 }));
        assert_eq!(err.to_status(), -999);
    }

    #[test]
    fn test_protocol_errors_collapse_to_eproto() {
        let err = RpcError::BadMagic { got: 0xdeadbeef };
        assert_eq!(err.to_status(), status::EPROTO);
        let err = RpcError::Truncated { len: 3, need: 56 };
        assert_eq!(err.to_status(), status::EPROTO);
    }
}
