//! File I/O collaborator interface.
//!
//! The swarm core never touches the disk itself. Sessions hand chunk
//! payloads to the disk collaborator over a bounded mailbox and wait for
//! the acknowledgement that the write (and the piece hash check, when
//! the write completed a piece) finished. A full mailbox suspends the
//! sending session, which in turn stops pulling from the socket, so the
//! TCP window pushes back on the remote peer. Reads serve upload
//! requests the same way.
//!
//! [`MemoryDisk`] is the in-process implementation used by tests and
//! demos; the real on-disk layout lives in its own crate.

use std::collections::HashMap;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::assigner::Chunk;
use crate::constants::DISK_QUEUE_CAPACITY;
use crate::registry::TorrentId;

#[derive(Debug, Error)]
pub enum StorageError {
    /// The disk service is gone; the engine is shutting down.
    #[error("disk service unavailable")]
    Closed,

    /// A read asked for data we don't have.
    #[error("chunk not available: torrent {torrent} piece {piece} offset {offset}")]
    NotFound {
        torrent: TorrentId,
        piece: u32,
        offset: u32,
    },

    /// The collaborator reported an I/O failure.
    #[error("io error: {0}")]
    Io(String),
}

/// One disk request, acknowledged over a oneshot.
#[derive(Debug)]
pub enum DiskCommand {
    Write {
        torrent: TorrentId,
        chunk: Chunk,
        data: Bytes,
        ack: oneshot::Sender<Result<(), StorageError>>,
    },
    Read {
        torrent: TorrentId,
        chunk: Chunk,
        ack: oneshot::Sender<Result<Bytes, StorageError>>,
    },
}

/// Cloneable sender side of the disk mailbox.
#[derive(Debug, Clone)]
pub struct DiskHandle {
    tx: mpsc::Sender<DiskCommand>,
}

impl DiskHandle {
    /// Creates the bounded mailbox; the receiver goes to whatever
    /// implements the disk service.
    pub fn channel() -> (Self, mpsc::Receiver<DiskCommand>) {
        let (tx, rx) = mpsc::channel(DISK_QUEUE_CAPACITY);
        (Self { tx }, rx)
    }

    /// Hands a chunk to the disk service and waits for durability.
    pub async fn write_chunk(
        &self,
        torrent: TorrentId,
        chunk: Chunk,
        data: Bytes,
    ) -> Result<(), StorageError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(DiskCommand::Write { torrent, chunk, data, ack })
            .await
            .map_err(|_| StorageError::Closed)?;
        done.await.map_err(|_| StorageError::Closed)?
    }

    /// Fetches chunk bytes for serving an upload request.
    pub async fn read_chunk(
        &self,
        torrent: TorrentId,
        chunk: Chunk,
    ) -> Result<Bytes, StorageError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(DiskCommand::Read { torrent, chunk, ack })
            .await
            .map_err(|_| StorageError::Closed)?;
        done.await.map_err(|_| StorageError::Closed)?
    }
}

/// Memory-backed disk service.
#[derive(Debug, Default)]
pub struct MemoryDisk {
    chunks: HashMap<(TorrentId, u32, u32), Bytes>,
}

impl MemoryDisk {
    /// Spawns the service task and returns a handle to it.
    pub fn spawn() -> DiskHandle {
        let (handle, rx) = DiskHandle::channel();
        tokio::spawn(Self::default().run(rx));
        handle
    }

    /// Spawns the service preloaded with chunk data, for seeding tests.
    pub fn spawn_with(chunks: Vec<(TorrentId, Chunk, Bytes)>) -> DiskHandle {
        let mut disk = Self::default();
        for (torrent, chunk, data) in chunks {
            disk.chunks.insert((torrent, chunk.piece, chunk.offset), data);
        }
        let (handle, rx) = DiskHandle::channel();
        tokio::spawn(disk.run(rx));
        handle
    }

    async fn run(mut self, mut rx: mpsc::Receiver<DiskCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                DiskCommand::Write { torrent, chunk, data, ack } => {
                    self.chunks.insert((torrent, chunk.piece, chunk.offset), data);
                    let _ = ack.send(Ok(()));
                }
                DiskCommand::Read { torrent, chunk, ack } => {
                    let result = self
                        .chunks
                        .get(&(torrent, chunk.piece, chunk.offset))
                        .cloned()
                        .ok_or(StorageError::NotFound {
                            torrent,
                            piece: chunk.piece,
                            offset: chunk.offset,
                        });
                    let _ = ack.send(result);
                }
            }
        }
        debug!("memory disk service stopped");
    }
}
