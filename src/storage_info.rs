use std::{ops::Range, path::PathBuf};

use crate::{
    error::{Error, Result},
    metainfo::Metainfo,
    BlockInfo, FileIndex, PieceIndex, BLOCK_LEN,
};

/// Information about a torrent's file.
#[derive(Clone, Debug, PartialEq)]
pub struct FileInfo {
    /// The file's relative path from the download directory.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// The byte offset of the file within the torrent, when all files in
    /// torrent are viewed as a single contiguous byte array. This is always
    /// 0 for a single file torrent.
    pub torrent_offset: u64,
}

impl FileInfo {
    /// Returns a range that represents the file's first and one past the last
    /// bytes' offsets in the torrent.
    pub(crate) fn byte_range(&self) -> Range<u64> {
        self.torrent_offset..self.torrent_end_offset()
    }

    /// Returns the file's one past the last byte's offset in the torrent.
    pub(crate) fn torrent_end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }
}

/// The location of a contiguous run of piece bytes within one file.
///
/// The chunks of a piece, in order, cover the piece exactly: their lengths
/// sum to the piece's length and consecutive chunks continue where the
/// previous one ended, possibly in the next file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct PieceFileChunk {
    /// Which of the torrent's files the chunk is in.
    pub file_index: FileIndex,
    /// The byte offset of the chunk within that file.
    pub offset: u64,
    /// The chunk's length in bytes.
    pub len: u64,
}

/// Information about a torrent's storage details, such as the piece count and
/// length, download length, etc.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub last_piece_len: u32,
    /// The sum of the length of all files in the torrent.
    pub download_len: u64,
    /// The download destination directory of the torrent.
    ///
    /// In case of single file downloads, this is the directory where the file
    /// is downloaded. In case of archive downloads, this directory is the
    /// download directory joined by the torrent's name, so that a torrent
    /// with multiple top-level entries doesn't scatter its files across the
    /// download directory.
    pub download_dir: PathBuf,
    /// The paths and lengths of the torrent files, in torrent order.
    pub files: Vec<FileInfo>,
    /// Whether this is a multi-file torrent, in which case `download_dir`
    /// contains the torrent's own directory as its last component.
    pub is_archive: bool,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
        let piece_count = metainfo.info.piece_count();
        let download_len = metainfo.info.total_len();
        let piece_len = metainfo.info.piece_len as u32;
        let last_piece_len =
            download_len - piece_len as u64 * (piece_count - 1) as u64;
        let last_piece_len = last_piece_len as u32;

        // if this is an archive, download files into torrent's own dir
        let download_dir = if metainfo.info.is_archive() {
            download_dir.join(&metainfo.info.name)
        } else {
            download_dir
        };

        Self {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir,
            files: metainfo.info.files(),
            is_archive: metainfo.info.is_archive(),
        }
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index == self.piece_count - 1 {
            Ok(self.last_piece_len)
        } else if index < self.piece_count - 1 {
            Ok(self.piece_len)
        } else {
            log::debug!("piece {} is invalid for torrent: {:?}", index, self);
            Err(Error::InvalidPieceIndex(index))
        }
    }

    /// Returns the piece's first byte's offset in the torrent.
    pub fn torrent_piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }

    /// Maps the piece onto the torrent's files: the ordered list of
    /// `(file, offset in file, length)` runs that together hold the piece's
    /// bytes. Zero length files never intersect a piece and are skipped.
    pub fn piece_chunks(&self, index: PieceIndex) -> Result<Vec<PieceFileChunk>> {
        let piece_len = self.piece_len(index)? as u64;
        let piece_range =
            self.torrent_piece_offset(index)..self.torrent_piece_offset(index) + piece_len;

        let mut chunks = Vec::new();
        for (file_index, file) in self.files.iter().enumerate() {
            if file.len == 0 {
                continue;
            }
            let file_range = file.byte_range();
            if file_range.end <= piece_range.start {
                continue;
            }
            if file_range.start >= piece_range.end {
                break;
            }
            let start = piece_range.start.max(file_range.start);
            let end = piece_range.end.min(file_range.end);
            chunks.push(PieceFileChunk {
                file_index,
                offset: start - file.torrent_offset,
                len: end - start,
            });
        }

        debug_assert_eq!(chunks.iter().map(|c| c.len).sum::<u64>(), piece_len);
        Ok(chunks)
    }

    /// Returns the canonical block requests of the piece: 16 KiB blocks at
    /// 16 KiB offsets, the last one possibly shorter.
    pub fn block_requests(&self, index: PieceIndex) -> Result<Vec<BlockInfo>> {
        let piece_len = self.piece_len(index)?;
        let count = crate::block_count(piece_len);
        let mut blocks = Vec::with_capacity(count);
        for block_index in 0..count {
            blocks.push(BlockInfo {
                piece_index: index,
                offset: block_index as u32 * BLOCK_LEN,
                len: crate::block_len(piece_len, block_index),
            });
        }
        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn archive_info(file_lens: &[u64], piece_len: u32) -> StorageInfo {
        let mut offset = 0;
        let files: Vec<FileInfo> = file_lens
            .iter()
            .enumerate()
            .map(|(i, len)| {
                let file = FileInfo {
                    path: PathBuf::from(format!("{}", i)),
                    len: *len,
                    torrent_offset: offset,
                };
                offset += len;
                file
            })
            .collect();
        let download_len = offset;
        let piece_count =
            ((download_len + piece_len as u64 - 1) / piece_len as u64) as usize;
        let last_piece_len =
            (download_len - piece_len as u64 * (piece_count as u64 - 1)) as u32;
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len,
            download_len,
            download_dir: PathBuf::from("/"),
            files,
            is_archive: file_lens.len() > 1,
        }
    }

    #[test]
    fn test_piece_len() {
        let info = archive_info(&[10], 4);
        assert_eq!(info.piece_count, 3);
        assert_eq!(info.piece_len(0).unwrap(), 4);
        assert_eq!(info.piece_len(1).unwrap(), 4);
        assert_eq!(info.piece_len(2).unwrap(), 2);
        assert!(info.piece_len(3).is_err());
    }

    #[test]
    fn test_chunks_straddle_file_boundary() {
        // files [a: 5, b: 5], piece length 4, total 10, 3 pieces
        let info = archive_info(&[5, 5], 4);

        assert_eq!(
            info.piece_chunks(0).unwrap(),
            vec![PieceFileChunk {
                file_index: 0,
                offset: 0,
                len: 4
            }]
        );
        assert_eq!(
            info.piece_chunks(1).unwrap(),
            vec![
                PieceFileChunk {
                    file_index: 0,
                    offset: 4,
                    len: 1
                },
                PieceFileChunk {
                    file_index: 1,
                    offset: 0,
                    len: 3
                },
            ]
        );
        // the last piece is 2 bytes long
        assert_eq!(
            info.piece_chunks(2).unwrap(),
            vec![PieceFileChunk {
                file_index: 1,
                offset: 3,
                len: 2
            }]
        );
    }

    #[test]
    fn test_chunks_skip_empty_files() {
        let info = archive_info(&[4, 0, 6], 5);
        assert_eq!(
            info.piece_chunks(0).unwrap(),
            vec![
                PieceFileChunk {
                    file_index: 0,
                    offset: 0,
                    len: 4
                },
                PieceFileChunk {
                    file_index: 2,
                    offset: 0,
                    len: 1
                },
            ]
        );
    }

    #[test]
    fn test_chunks_cover_torrent_exactly_once() {
        // piece and file boundaries intentionally never align
        let info = archive_info(&[9, 11, 7, 9, 12, 16, 8], 16);
        let mut torrent_offset = 0;
        for index in 0..info.piece_count {
            let chunks = info.piece_chunks(index).unwrap();
            let mut piece_offset = 0;
            for chunk in &chunks {
                let file = &info.files[chunk.file_index];
                assert_eq!(
                    file.torrent_offset + chunk.offset,
                    torrent_offset + piece_offset,
                    "chunk {:?} of piece {} is out of order",
                    chunk,
                    index
                );
                assert!(chunk.offset + chunk.len <= file.len);
                piece_offset += chunk.len;
            }
            assert_eq!(piece_offset, info.piece_len(index).unwrap() as u64);
            torrent_offset += piece_offset;
        }
        assert_eq!(torrent_offset, info.download_len);
    }

    #[test]
    fn test_block_requests() {
        let info = archive_info(&[2 * BLOCK_LEN as u64 + 100], BLOCK_LEN * 2);
        // first piece: two full blocks
        let blocks = info.block_requests(0).unwrap();
        assert_eq!(blocks.len(), 2);
        for (i, block) in blocks.iter().enumerate() {
            assert_eq!(block.piece_index, 0);
            assert_eq!(block.offset, i as u32 * BLOCK_LEN);
            assert_eq!(block.len, BLOCK_LEN);
            assert_eq!(block.offset % BLOCK_LEN, 0);
        }
        // last piece: a single short block
        let blocks = info.block_requests(1).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].len, 100);
        assert!(blocks[0].offset + blocks[0].len <= info.piece_len(1).unwrap());
    }
}
