//! Per-peer connection tasks and the channel surface they share with
//! the swarm controller.

pub mod connection;
pub mod metrics;

use std::fmt;

use bytes::Bytes;

use undertow_common::PeerId;
use undertow_wire::{Block, BlockInfo, Message};

use crate::error::PeerError;

pub use connection::ConnectionLimits;
pub use metrics::{PeerMetrics, RateEstimator, format_rate};

/// Engine-local peer identifier. Stable for the lifetime of one
/// connection; a peer that reconnects gets a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(pub usize);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// What a connection task reports up to the swarm controller.
#[derive(Debug)]
pub enum PeerEvent {
    /// Handshake completed and validated.
    Connected { pid: Pid, remote_id: PeerId },
    /// Raw bitfield payload. The swarm validates it against the piece
    /// count; the connection does not know the torrent geometry.
    BitfieldReceived { pid: Pid, raw: Bytes },
    HaveReceived { pid: Pid, piece: u32 },
    /// The remote's interest in our pieces changed.
    InterestChanged { pid: Pid, interested: bool },
    /// The remote choked or unchoked us.
    ChokeChanged { pid: Pid, choked: bool },
    BlockReceived { pid: Pid, block: Block },
    /// The remote asked for a block; whether to serve it is the swarm's
    /// decision.
    BlockRequested { pid: Pid, info: BlockInfo },
    /// One of our requests went unanswered past its deadline.
    RequestTimedOut { pid: Pid, info: BlockInfo },
    /// The connection is gone. `None` means an orderly local shutdown.
    Closed { pid: Pid, error: Option<PeerError> },
}

/// What the swarm controller tells a connection task to do.
#[derive(Debug)]
pub enum PeerCommand {
    /// Write a message as-is (choke, unchoke, interest, have, bitfield).
    Send(Message),
    /// Request blocks, arming the per-request timeout for each.
    Request(Vec<BlockInfo>),
    /// Withdraw a request after its block arrived from elsewhere.
    Cancel(BlockInfo),
    /// Upload a block, provided the remote still wants it.
    Serve(Block),
    Shutdown,
}
