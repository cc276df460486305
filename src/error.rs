//! Error types for framewire.

use thiserror::Error;

/// Main error type for all framewire operations.
#[derive(Debug, Error)]
pub enum FramewireError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid frame header: unknown type, reserved flag bits, or an
    /// oversized declared payload length. Connection-fatal.
    #[error("Bad frame: {0}")]
    BadFrame(String),

    /// Malformed property block or body encoding. Connection-fatal when
    /// produced by the wire decoder.
    #[error("Bad data: {0}")]
    BadData(String),

    /// The stream closed or failed while a message was outstanding.
    #[error("Disconnected")]
    Disconnected,

    /// The transport collaborator rejected the peer. Surfaced for callers;
    /// never generated by the protocol engine itself.
    #[error("Peer not allowed")]
    PeerNotAllowed,

    /// An application handler failed while producing a response.
    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    /// The peer sent an error response with no detail.
    #[error("Unspecified peer error")]
    Unspecified,

    /// The connection is not open for sending.
    #[error("Connection is not open")]
    NotOpen,

    /// A response has already been sent for this request.
    #[error("Response already sent")]
    AlreadyResponded,

    /// The request was sent with noReply; no response slot exists.
    #[error("Request expects no reply")]
    NoReplyExpected,
}

/// Result type alias using FramewireError.
pub type Result<T> = std::result::Result<T, FramewireError>;
