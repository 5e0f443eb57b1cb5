use std::ops::Range;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationMode {
    /// Files are created lazily and grow as pieces land.
    #[default]
    Sparse,
    /// Files are extended to their final length up front.
    Full,
}

/// One file of a torrent, located by its byte offset in the torrent's
/// concatenated content.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
    pub offset: u64,
}

impl FileEntry {
    pub fn new(path: PathBuf, length: u64, offset: u64) -> Self {
        Self {
            path,
            length,
            offset,
        }
    }

    /// Lays out files back to back, in order, starting at offset 0.
    pub fn sequence<I, P>(files: I) -> Vec<Self>
    where
        I: IntoIterator<Item = (P, u64)>,
        P: Into<PathBuf>,
    {
        let mut offset = 0;
        files
            .into_iter()
            .map(|(path, length)| {
                let entry = Self::new(path.into(), length, offset);
                offset += length;
                entry
            })
            .collect()
    }

    pub fn byte_range(&self) -> Range<u64> {
        self.offset..self.offset + self.length
    }
}

/// The part of one file covered by a byte range of the torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpan {
    pub file_index: usize,
    pub file_offset: u64,
    pub length: u64,
}

/// Maps the torrent byte range `[start, start + length)` onto `files`.
pub fn file_spans(files: &[FileEntry], start: u64, length: u64) -> Vec<FileSpan> {
    let mut spans = Vec::new();
    let mut remaining = length;
    let mut current = start;

    for (file_index, file) in files.iter().enumerate() {
        if remaining == 0 {
            break;
        }

        if file.byte_range().contains(&current) {
            let take = remaining.min(file.offset + file.length - current);
            spans.push(FileSpan {
                file_index,
                file_offset: current - file.offset,
                length: take,
            });
            current += take;
            remaining -= take;
        }
    }

    spans
}
