use super::error::StorageError;
use super::file::{file_spans, AllocationMode, FileEntry, FileSpan};
use super::PieceStore;
use crate::peer::Bitfield;
use crate::torrent::TorrentDescriptor;
use bytes::Bytes;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as TokioMutex;

const VERIFY_BATCH_SIZE: usize = 32;

fn validate_file_path(file_path: &Path) -> Result<(), StorageError> {
    for component in file_path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathTraversal(file_path.display().to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

struct FileHandle {
    file: TokioMutex<File>,
    writable: bool,
}

/// Open file handles, one per torrent file. A read-only handle is replaced
/// the first time the file is written.
struct HandleCache {
    handles: Mutex<HashMap<usize, Arc<FileHandle>>>,
}

impl HandleCache {
    fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, file_index: usize, write: bool) -> Option<Arc<FileHandle>> {
        self.handles
            .lock()
            .get(&file_index)
            .filter(|h| h.writable || !write)
            .cloned()
    }

    async fn open(
        &self,
        file_index: usize,
        path: &Path,
        write: bool,
    ) -> Result<Arc<FileHandle>, StorageError> {
        if let Some(handle) = self.cached(file_index, write) {
            return Ok(handle);
        }

        let file = if write {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
                .await?
        } else {
            File::open(path).await?
        };

        let handle = Arc::new(FileHandle {
            file: TokioMutex::new(file),
            writable: write,
        });
        self.handles.lock().insert(file_index, handle.clone());
        Ok(handle)
    }
}

/// Piece storage backed by the torrent's files under a base directory.
///
/// Pieces may straddle file boundaries; every read and write is split into
/// per-file spans.
pub struct FileStorage {
    base_path: PathBuf,
    files: Vec<FileEntry>,
    piece_length: u64,
    total_length: u64,
    piece_count: usize,
    allocation_mode: AllocationMode,
    handles: HandleCache,
}

impl FileStorage {
    pub fn new(
        base_path: impl Into<PathBuf>,
        files: Vec<FileEntry>,
        descriptor: &TorrentDescriptor,
    ) -> Result<Self, StorageError> {
        for file in &files {
            validate_file_path(&file.path)?;
        }

        let mut expected_offset = 0;
        for file in &files {
            if file.offset != expected_offset {
                return Err(StorageError::InvalidLayout(format!(
                    "{} starts at {}, expected {}",
                    file.path.display(),
                    file.offset,
                    expected_offset
                )));
            }
            expected_offset += file.length;
        }
        if expected_offset != descriptor.total_length() {
            return Err(StorageError::InvalidLayout(format!(
                "files cover {} bytes, torrent has {}",
                expected_offset,
                descriptor.total_length()
            )));
        }

        Ok(Self {
            base_path: base_path.into(),
            files,
            piece_length: descriptor.piece_length(),
            total_length: descriptor.total_length(),
            piece_count: descriptor.piece_count(),
            allocation_mode: AllocationMode::Sparse,
            handles: HandleCache::new(),
        })
    }

    /// Storage for a single-file torrent.
    pub fn single_file(
        base_path: impl Into<PathBuf>,
        name: impl Into<PathBuf>,
        descriptor: &TorrentDescriptor,
    ) -> Result<Self, StorageError> {
        let files = vec![FileEntry::new(name.into(), descriptor.total_length(), 0)];
        Self::new(base_path, files, descriptor)
    }

    pub fn with_allocation_mode(mut self, mode: AllocationMode) -> Self {
        self.allocation_mode = mode;
        self
    }

    fn piece_len(&self, piece: u32) -> Option<u64> {
        let index = piece as usize;
        if index >= self.piece_count {
            return None;
        }
        let offset = index as u64 * self.piece_length;
        Some(self.piece_length.min(self.total_length - offset))
    }

    fn block_spans(&self, piece: u32, offset: u32, length: u32) -> Result<Vec<FileSpan>, StorageError> {
        let piece_len = self.piece_len(piece).ok_or(StorageError::InvalidPieceIndex(piece))?;
        if length == 0 || offset as u64 + length as u64 > piece_len {
            return Err(StorageError::InvalidBlock {
                piece,
                offset,
                length,
            });
        }

        let start = piece as u64 * self.piece_length + offset as u64;
        Ok(file_spans(&self.files, start, length as u64))
    }

    fn file_path(&self, file: &FileEntry) -> PathBuf {
        self.base_path.join(&file.path)
    }

    /// Creates every file, and with [`AllocationMode::Full`] extends each to
    /// its final length.
    pub async fn preallocate(&self) -> Result<(), StorageError> {
        for file in &self.files {
            let path = self.file_path(file);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .await?;

            if self.allocation_mode == AllocationMode::Full {
                f.set_len(file.length).await?;
            }
        }

        Ok(())
    }

    pub async fn read_piece(&self, piece: u32) -> Result<Bytes, StorageError> {
        let length = self.piece_len(piece).ok_or(StorageError::InvalidPieceIndex(piece))?;
        self.read_spans(self.block_spans(piece, 0, length as u32)?, length as usize)
            .await
    }

    async fn read_spans(&self, spans: Vec<FileSpan>, length: usize) -> Result<Bytes, StorageError> {
        let mut data = Vec::with_capacity(length);

        for span in spans {
            let path = self.file_path(&self.files[span.file_index]);
            let handle = self.handles.open(span.file_index, &path, false).await?;
            let mut file = handle.file.lock().await;
            file.seek(SeekFrom::Start(span.file_offset)).await?;

            let start = data.len();
            data.resize(start + span.length as usize, 0);
            file.read_exact(&mut data[start..]).await?;
        }

        Ok(Bytes::from(data))
    }

    async fn write_spans(&self, spans: Vec<FileSpan>, data: &[u8]) -> Result<(), StorageError> {
        let mut data_offset = 0usize;

        for span in spans {
            let path = self.file_path(&self.files[span.file_index]);
            let handle = self.handles.open(span.file_index, &path, true).await?;
            let mut file = handle.file.lock().await;
            file.seek(SeekFrom::Start(span.file_offset)).await?;

            let chunk = &data[data_offset..data_offset + span.length as usize];
            file.write_all(chunk).await?;
            file.flush().await?;

            data_offset += span.length as usize;
        }

        Ok(())
    }

    /// Hashes every piece already on disk and returns the set that matches,
    /// for resuming a partial download. Unreadable pieces count as missing.
    pub async fn verify_all(&self, descriptor: &TorrentDescriptor) -> Result<Bitfield, StorageError> {
        let mut have = Bitfield::new(self.piece_count);
        let indices: Vec<u32> = (0..self.piece_count as u32).collect();

        for batch in indices.chunks(VERIFY_BATCH_SIZE) {
            let results = futures::future::join_all(batch.iter().map(|&piece| async move {
                let data = match self.read_piece(piece).await {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::trace!(piece, error = %e, "piece unreadable during verification");
                        return (piece, false);
                    }
                };
                let Some(expected) = descriptor.piece_hash(piece).copied() else {
                    return (piece, false);
                };
                let valid = tokio::task::spawn_blocking(move || {
                    let digest: [u8; 20] = Sha1::digest(&data).into();
                    digest == expected
                })
                .await
                .unwrap_or(false);
                (piece, valid)
            }))
            .await;

            for (piece, valid) in results {
                if valid {
                    have.set(piece as usize);
                }
            }
        }

        tracing::debug!(
            valid = have.count(),
            total = self.piece_count,
            "verified existing data"
        );
        Ok(have)
    }
}

impl PieceStore for FileStorage {
    async fn write_piece(&self, piece: u32, data: Bytes) -> Result<(), StorageError> {
        let expected = self.piece_len(piece).ok_or(StorageError::InvalidPieceIndex(piece))?;
        if data.len() as u64 != expected {
            return Err(StorageError::InvalidLength {
                piece,
                expected,
                actual: data.len(),
            });
        }

        let spans = self.block_spans(piece, 0, expected as u32)?;
        self.write_spans(spans, &data).await
    }

    async fn read_block(&self, piece: u32, offset: u32, length: u32) -> Result<Bytes, StorageError> {
        let spans = self.block_spans(piece, offset, length)?;
        self.read_spans(spans, length as usize).await
    }
}
