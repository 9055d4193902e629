//! The BitTorrent peer wire protocol: the 68-byte handshake and the
//! length-prefixed steady-state message set, exposed as a closed enum
//! plus a [`tokio_util`] codec for framed sockets.

pub mod protocol;

pub use protocol::{Block, BlockInfo, Handshake, Message, PeerCodec};
