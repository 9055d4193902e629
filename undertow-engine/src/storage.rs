use std::{collections::HashMap, sync::Mutex};

use bytes::Bytes;

use crate::error::StorageError;

/// File-I/O collaborator. Implementations own the on-disk layout and
/// file-handle lifecycle; the engine only ever hands over verified
/// pieces and reads back blocks for serving. Any error out of here is
/// fatal to the torrent.
pub trait PieceStorage: Send + Sync + 'static {
    /// Persist a fully verified piece.
    fn write_piece(&self, index: u32, data: &[u8]) -> Result<(), StorageError>;

    /// Read a block of a previously written piece, for serving uploads.
    fn read_block(&self, index: u32, begin: u32, length: u32) -> Result<Bytes, StorageError>;
}

/// In-memory storage, used by tests and as the trivial reference
/// implementation.
#[derive(Default)]
pub struct MemoryStorage {
    pieces: Mutex<HashMap<u32, Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn piece(&self, index: u32) -> Option<Bytes> {
        self.pieces.lock().ok()?.get(&index).cloned()
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl PieceStorage for MemoryStorage {
    fn write_piece(&self, index: u32, data: &[u8]) -> Result<(), StorageError> {
        let mut pieces = self
            .pieces
            .lock()
            .map_err(|_| StorageError::Rejected(index, "storage lock poisoned".into()))?;
        pieces.insert(index, Bytes::copy_from_slice(data));
        Ok(())
    }

    fn read_block(&self, index: u32, begin: u32, length: u32) -> Result<Bytes, StorageError> {
        let pieces = self
            .pieces
            .lock()
            .map_err(|_| StorageError::Rejected(index, "storage lock poisoned".into()))?;
        let piece = pieces.get(&index).ok_or_else(|| {
            StorageError::Rejected(index, "piece not in storage".into())
        })?;
        let begin = begin as usize;
        let end = begin + length as usize;
        if end > piece.len() {
            return Err(StorageError::Rejected(
                index,
                format!("read {begin}..{end} beyond piece of {} bytes", piece.len()),
            ));
        }
        Ok(piece.slice(begin..end))
    }
}
