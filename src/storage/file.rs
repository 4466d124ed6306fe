use std::path::PathBuf;

/// Index of a piece within a torrent.
pub type PieceIndex = u32;

/// Index of a file within a torrent.
pub type FileIndex = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocationMode {
    #[default]
    Sparse,
    Full,
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
    pub offset: u64,
    /// Whether this is a padding file (v2/hybrid torrents). Padding files are
    /// never created on disk; reads from them return zeros.
    pub is_padding: bool,
}

#[derive(Debug, Clone)]
pub struct PieceInfo {
    pub index: PieceIndex,
    pub hash: Vec<u8>,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceFileSpan {
    pub file_index: FileIndex,
    pub file_offset: u64,
    pub length: u64,
}

impl FileEntry {
    pub fn new(path: PathBuf, length: u64, offset: u64) -> Self {
        Self {
            path,
            length,
            offset,
            is_padding: false,
        }
    }

    pub fn padding(length: u64, offset: u64) -> Self {
        Self {
            path: PathBuf::from(format!(".pad/{length}")),
            length,
            offset,
            is_padding: true,
        }
    }

    pub fn byte_range(&self) -> std::ops::Range<u64> {
        self.offset..self.offset + self.length
    }

    pub fn contains_offset(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.offset + self.length
    }
}

impl PieceInfo {
    pub fn v1(index: PieceIndex, hash: [u8; 20], offset: u64, length: u64) -> Self {
        Self {
            index,
            hash: hash.to_vec(),
            offset,
            length,
        }
    }

    pub fn v2(index: PieceIndex, hash: [u8; 32], offset: u64, length: u64) -> Self {
        Self {
            index,
            hash: hash.to_vec(),
            offset,
            length,
        }
    }

    /// A piece whose hash is not known up front. Hash jobs still compute a
    /// SHA-1 digest but cannot report a mismatch.
    pub fn unhashed(index: PieceIndex, offset: u64, length: u64) -> Self {
        Self {
            index,
            hash: Vec::new(),
            offset,
            length,
        }
    }

    pub fn byte_range(&self) -> std::ops::Range<u64> {
        self.offset..self.offset + self.length
    }

    /// Returns true if this is a v2 piece (32-byte hash).
    pub fn is_v2(&self) -> bool {
        self.hash.len() == 32
    }

    pub fn expected_hash(&self) -> Option<&[u8]> {
        if self.hash.is_empty() {
            None
        } else {
            Some(&self.hash)
        }
    }
}

/// Maps the byte range `[start, start + length)` of the torrent onto the
/// files that hold it.
pub fn file_spans(files: &[FileEntry], start: u64, length: u64) -> Vec<PieceFileSpan> {
    let mut spans = Vec::new();
    let mut remaining = length;
    let mut current_offset = start;

    for (file_idx, file) in files.iter().enumerate() {
        if remaining == 0 {
            break;
        }

        if file.contains_offset(current_offset) {
            let file_offset = current_offset - file.offset;
            let available = file.offset + file.length - current_offset;
            let take = remaining.min(available);

            spans.push(PieceFileSpan {
                file_index: file_idx,
                file_offset,
                length: take,
            });

            current_offset += take;
            remaining -= take;
        }
    }

    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spans_cross_file_boundary() {
        let files = vec![
            FileEntry::new(PathBuf::from("a"), 100, 0),
            FileEntry::new(PathBuf::from("b"), 50, 100),
            FileEntry::new(PathBuf::from("c"), 200, 150),
        ];

        let spans = file_spans(&files, 90, 80);
        assert_eq!(
            spans,
            vec![
                PieceFileSpan {
                    file_index: 0,
                    file_offset: 90,
                    length: 10
                },
                PieceFileSpan {
                    file_index: 1,
                    file_offset: 0,
                    length: 50
                },
                PieceFileSpan {
                    file_index: 2,
                    file_offset: 0,
                    length: 20
                },
            ]
        );
    }

    #[test]
    fn test_spans_skip_empty_files() {
        let files = vec![
            FileEntry::new(PathBuf::from("empty"), 0, 0),
            FileEntry::new(PathBuf::from("data"), 64, 0),
        ];

        let spans = file_spans(&files, 0, 64);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].file_index, 1);
    }
}
