pub mod metainfo;
pub mod types;

pub use metainfo::{BLOCK_SIZE, FileEntry, TorrentInfo};
pub use types::{InfoHash, PeerId};
