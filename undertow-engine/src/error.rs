use thiserror::Error;

/// Errors local to one peer connection. None of these are fatal to the
/// torrent; the swarm controller reacts by tearing down that peer and
/// reassigning its outstanding requests.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("connection timeout")]
    Timeout,
    #[error("peer disconnected")]
    Disconnected,
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// Errors from the piece store's block bookkeeping.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("piece index {0} out of range")]
    UnknownPiece(u32),
    #[error("block {begin}+{length} out of range for piece {index}")]
    OutOfRangeBlock { index: u32, begin: u32, length: u32 },
    #[error("piece {0} already verified")]
    AlreadyVerified(u32),
}

/// Failure reported by the file-storage collaborator. This is the one
/// error class the engine cannot recover from: a verified piece that
/// cannot be persisted aborts the torrent.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage rejected piece {0}: {1}")]
    Rejected(u32, String),
}

/// Fatal, torrent-level errors surfaced to the controlling application.
#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("engine task failed: {0}")]
    Internal(String),
}
