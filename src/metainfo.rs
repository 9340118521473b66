//! Parsing of `.torrent` files (bencoded metainfo).
//!
//! Only the BitTorrent v1 `info` dictionary is consumed. The info hash is
//! computed by re-encoding the parsed dictionary, so the struct must capture
//! every field it may contain.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    FileInfo, Sha1Hash,
};

#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub announce: Option<String>,
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
    pub info: Info,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let metainfo: Metainfo = serde_bencode::from_bytes(buf)?;
        metainfo.info.validate()?;
        Ok(metainfo)
    }

    /// The SHA-1 of the bencoded info dictionary, the torrent's identity.
    pub fn create_info_hash(&self) -> Result<Sha1Hash> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// The tracker URL tiers: the `announce-list` if present, otherwise
    /// a single tier containing the `announce` URL.
    pub fn announce_tiers(&self) -> Vec<Vec<String>> {
        match &self.announce_list {
            Some(tiers) if !tiers.is_empty() => tiers.clone(),
            _ => self
                .announce
                .as_ref()
                .map(|url| vec![vec![url.clone()]])
                .unwrap_or_default(),
        }
    }
}

/// The `info` dictionary of the metainfo.
///
/// Field order matters: bencoded dictionaries are sorted by key and the
/// serializer emits fields in declaration order, so they are declared sorted
/// to reproduce the original encoding for the info hash.
#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_len: u64,
    pub pieces: ByteBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub length: u64,
    pub path: Vec<String>,
}

impl Info {
    fn validate(&self) -> Result<()> {
        if self.pieces.len() % 20 != 0 {
            return Err(Error::Metainfo(
                "pieces string length is not a multiple of 20".into(),
            ));
        }
        if self.piece_len == 0 || self.piece_len > u32::MAX as u64 {
            return Err(Error::Metainfo(format!(
                "invalid piece length {}",
                self.piece_len
            )));
        }
        if self.length.is_some() == self.files.is_some() {
            return Err(Error::Metainfo(
                "expected exactly one of `length` and `files`".into(),
            ));
        }
        let total = self.total_len();
        if total == 0 {
            return Err(Error::Metainfo("torrent has no content".into()));
        }
        // the number of hashes must cover the content exactly
        let piece_count = (total + self.piece_len - 1) / self.piece_len;
        if piece_count != (self.pieces.len() / 20) as u64 {
            return Err(Error::Metainfo(format!(
                "expected {} piece hashes, found {}",
                piece_count,
                self.pieces.len() / 20
            )));
        }
        for file in self.files.iter().flatten() {
            for component in &file.path {
                if component == ".." || component.contains('/') {
                    return Err(Error::Metainfo(format!(
                        "unsafe path component {:?}",
                        component
                    )));
                }
            }
        }
        Ok(())
    }

    /// The sum of the length of all files in the torrent.
    pub fn total_len(&self) -> u64 {
        match (&self.length, &self.files) {
            (Some(len), _) => *len,
            (None, Some(files)) => files.iter().map(|f| f.length).sum(),
            (None, None) => 0,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }

    /// The expected SHA-1 hash of each piece, in piece order.
    pub fn piece_hashes(&self) -> Vec<Sha1Hash> {
        self.pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect()
    }

    /// Whether the torrent restricts peer discovery to its trackers.
    pub fn is_private(&self) -> bool {
        self.private == Some(1)
    }

    /// Whether this is a multi-file torrent.
    pub fn is_archive(&self) -> bool {
        self.files.is_some()
    }

    /// The files of the torrent with their offsets in the logical content,
    /// i.e. when all files are viewed as a single contiguous byte array.
    pub fn files(&self) -> Vec<FileInfo> {
        match &self.files {
            None => vec![FileInfo {
                path: PathBuf::from(&self.name),
                len: self.total_len(),
                torrent_offset: 0,
            }],
            Some(files) => {
                let mut offset = 0;
                files
                    .iter()
                    .map(|f| {
                        let info = FileInfo {
                            path: f.path.iter().collect(),
                            len: f.length,
                            torrent_offset: offset,
                        };
                        offset += f.length;
                        info
                    })
                    .collect()
            }
        }
    }
}
