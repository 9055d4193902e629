//! A BitTorrent transfer engine: peer connections, piece scheduling,
//! choke policy, and piece verification for one torrent at a time.
//!
//! The engine deliberately stops at its collaborators' doorsteps.
//! Metadata arrives as a validated [`undertow_common::TorrentInfo`],
//! peer addresses arrive over a channel from whatever discovery the
//! caller runs, verified pieces leave through [`storage::PieceStorage`],
//! and sockets come from a [`transport::Transport`]. Everything in
//! between (the wire conversation, rarest-first scheduling, endgame,
//! tit-for-tat choking, hash verification) lives here, serialized in a
//! single swarm controller task per torrent.

pub mod availability;
pub mod bitfield;
pub mod choker;
pub mod config;
pub mod error;
pub mod peer;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod store;
pub mod swarm;
pub mod transport;

pub use bitfield::Bitfield;
pub use config::EngineConfig;
pub use error::{PeerError, StorageError, StoreError, TorrentError};
pub use storage::{MemoryStorage, PieceStorage};
pub use store::BLOCK_SIZE;
pub use swarm::{Swarm, SwarmHandle, TorrentState, TransferStats};
pub use transport::{TcpTransport, Transport};
