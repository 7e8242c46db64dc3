use std::io;
use std::io::ErrorKind;
use thiserror::Error;

/// The error taxonomy of the wire transport layer. Low-level socket errors are translated into
///  this enum at the substrate / codec boundary so that callers can branch on the kind without
///  inspecting `io::Error` internals.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Not a failure: the socket cannot make progress right now, retry when it is ready again.
    #[error("operation would block")]
    WouldBlock,

    /// The peer closed or reset the connection. On a wrapped stream connection this triggers
    ///  the reconnect timer; otherwise it surfaces to the caller.
    #[error("peer reset or closed the connection")]
    PeerReset,

    /// A received header violates a protocol invariant. The message is discarded; the
    ///  connection or datagram stream is *not* torn down.
    #[error("protocol desynchronization: {0}")]
    ProtocolDesync(#[source] anyhow::Error),

    /// A send was asked to carry more than the wire format can represent. Rejected before any
    ///  bytes are written.
    #[error("message exceeds transport limits: {0}")]
    OversizedMessage(String),

    /// All other socket-layer failures.
    #[error("socket I/O failure")]
    SystemIO(#[source] io::Error),
}

impl TransportError {
    pub fn is_would_block(&self) -> bool {
        matches!(self, TransportError::WouldBlock)
    }

    pub fn is_peer_reset(&self) -> bool {
        matches!(self, TransportError::PeerReset)
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            ErrorKind::WouldBlock =>
                TransportError::WouldBlock,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionRefused
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof =>
                TransportError::PeerReset,
            _ =>
                TransportError::SystemIO(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::would_block(ErrorKind::WouldBlock, true, false)]
    #[case::reset(ErrorKind::ConnectionReset, false, true)]
    #[case::aborted(ErrorKind::ConnectionAborted, false, true)]
    #[case::refused(ErrorKind::ConnectionRefused, false, true)]
    #[case::broken_pipe(ErrorKind::BrokenPipe, false, true)]
    #[case::eof(ErrorKind::UnexpectedEof, false, true)]
    #[case::other(ErrorKind::PermissionDenied, false, false)]
    fn test_io_error_mapping(#[case] kind: ErrorKind, #[case] expect_would_block: bool, #[case] expect_peer_reset: bool) {
        let mapped: TransportError = io::Error::from(kind).into();
        assert_eq!(mapped.is_would_block(), expect_would_block);
        assert_eq!(mapped.is_peer_reset(), expect_peer_reset);
        if !expect_would_block && !expect_peer_reset {
            assert!(matches!(mapped, TransportError::SystemIO(_)));
        }
    }
}
