use rand::seq::SliceRandom;
use serde_derive::{Deserialize, Serialize};
use url::Url;
use crate::{store::FileInfo, ID};

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    BencodeError(#[from] serde_bencode::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("invalid pieces length, must be divisible by 20")]
    InvalidPiecesLength,

    #[error("torrent has no length or files")]
    NoFiles,

    #[error("file(s) with size 0")]
    FileNoSize,

}

pub type Result<T> = std::result::Result<T, MetaInfoError>;

// Field order matters: the info hash is computed by re-encoding this struct,
// and bencode dictionaries keep their keys in sorted order.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {

    // Length of the file in bytes (integer).
    pub length: u64,

    // A 32-character hexadecimal string corresponding to the MD5 sum of the file.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,

    // String elements that together represent the path and filename.
    pub path: Vec<String>,

}

#[derive(Clone, Deserialize, Serialize)]
pub struct Info {

    // A list of dictionaries, one for each file.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<File>>,

    // Length of the file in bytes, only present for single-file torrents.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5sum: Option<String>,

    // File or directory name.
    pub name: String,

    // Number of bytes in each piece (integer).
    #[serde(rename = "piece length")]
    pub piece_length: u32,

    // Concatenation of all 20-byte SHA1 hash values, one per piece.
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    // If set to 1, peers may only be obtained from the trackers in this file.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private: Option<u8>,

    #[serde(default)]
    #[serde(rename = "root hash")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_hash: Option<String>,

}

impl Info {
    // Calculates the sha1 hash of the bencoded info dict, identifying the torrent on the wire.
    fn info_hash(&self) -> Result<ID> {
        use sha1::Digest;
        let mut hasher = sha1::Sha1::new();
        hasher.update(serde_bencode::to_bytes(&self)?);
        Ok(hasher.finalize().into())
    }
}

#[derive(Deserialize, Clone)]
pub struct MetaInfo {

    // The announce URL of the tracker (string).
    pub announce: String,

    // A dictionary that describes the file(s) of the torrent.
    pub info: Info,

    // sha1 hash of info dict.
    #[serde(skip)]
    pub info_hash: ID,

    // (optional) the string encoding format used to generate the pieces field (string).
    #[serde(default)]
    pub encoding: Option<String>,

    // (optional) tiered list of backup tracker URLs.
    #[serde(default)]
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,

    // (optional) the creation time of the torrent, in standard UNIX epoch format.
    #[serde(default)]
    #[serde(rename = "creation date")]
    pub creation_date: Option<i64>,

    // (optional) free-form textual comments of the author (string).
    #[serde(default)]
    pub comment: Option<String>,

    // (optional) name and version of the program used to create the .torrent (string).
    #[serde(default)]
    #[serde(rename = "created by")]
    pub created_by: Option<String>,

}

impl MetaInfo {

    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Result<MetaInfo> {

        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }
        Self::from_bytes(&std::fs::read(path)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<MetaInfo> {

        let mut metainfo: MetaInfo = serde_bencode::from_bytes(bytes)?;

        if metainfo.info.pieces.len() % 20 != 0 || metainfo.info.pieces.is_empty() {
            return Err(MetaInfoError::InvalidPiecesLength);
        }
        if metainfo.info.files.is_none() && metainfo.info.length.is_none() {
            return Err(MetaInfoError::NoFiles);
        }
        if metainfo.total_len() == 0 {
            return Err(MetaInfoError::FileNoSize);
        }

        metainfo.info_hash = metainfo.info.info_hash()?;
        tracing::debug!("metainfo created: {:#?}", metainfo);
        Ok(metainfo)
    }

    pub fn piece_hashes(&self) -> Vec<ID> {
        self.info.pieces
            .chunks_exact(20)
            // Safe as we have already checked length is a multiple of 20, in from_bytes.
            .map(|c| c.try_into().unwrap())
            .collect()
    }

    pub fn piece_len(&self) -> usize { self.info.piece_length as usize }

    pub fn num_pieces(&self) -> usize { self.info.pieces.len() / 20 }

    pub fn is_multi_file(&self) -> bool { self.info.files.is_some() }

    pub fn total_len(&self) -> u64 {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| f.length).sum()
        } else {
            self.info.length.unwrap_or(0)
        }
    }

    pub fn info_hash(&self) -> ID { self.info_hash }

    pub fn name(&self) -> &str { &self.info.name }

    // Tracker URLs in tiers of descending priority.
    // Trackers within a tier are shuffled, per convention.
    pub fn trackers(&self) -> Vec<Vec<Url>> {
        let parse = |urls: &[String]| -> Vec<Url> {
            urls.iter()
                .filter_map(|s| match Url::parse(s) {
                    Ok(url) => Some(url),
                    Err(e) => {
                        tracing::warn!("skipping invalid tracker url {}: {}", s, e);
                        None
                    },
                })
                .collect()
        };

        if let Some(announce_list) = &self.announce_list {
            announce_list
                .iter()
                .map(|tier| {
                    let mut tier = parse(tier);
                    tier.shuffle(&mut rand::thread_rng());
                    tier
                })
                .filter(|tier| !tier.is_empty())
                .collect()
        } else {
            vec![parse(std::slice::from_ref(&self.announce))]
        }
    }

    // File map: ordered entries of (relative path, length, offset into the torrent stream).
    // Single-file torrents are mapped to one entry named after the torrent.
    pub fn files(&self) -> Vec<FileInfo> {
        if let Some(files) = &self.info.files {
            let mut offset = 0;
            files.iter().map(|f| {
                let info = FileInfo {
                    path: f.path.iter().collect(),
                    length: f.length,
                    offset,
                };
                offset += f.length;
                info
            }).collect()
        } else {
            vec![FileInfo {
                path: self.info.name.clone().into(),
                length: self.info.length.unwrap_or(0),
                offset: 0,
            }]
        }
    }

    // Formatting methods.

    pub fn creation_date_fmt(&self) -> Option<String> {
        self.creation_date.map(|v| {
            chrono::NaiveDateTime::from_timestamp_opt(v, 0)
                .map(|v| v.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "invalid date".to_string())
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn size_fmt(&self) -> String {
        crate::stats::format_bytes(self.total_len())
    }
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("announce", &self.announce)
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .field("encoding", &self.encoding)
            .field("announce_list", &self.announce_list)
            .field("creation_date", &self.creation_date_fmt())
            .field("comment", &self.comment)
            .field("created_by", &self.created_by)
            .finish()
    }
}

// Dont want to print out the pieces field, so we implement Debug manually.
impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("num pieces", &(self.pieces.len() / 20))
            .field("piece_length", &self.piece_length)
            .field("md5sum", &self.md5sum)
            .field("length", &self.length)
            .field("files", &self.files)
            .field("private", &self.private)
            .field("root_hash", &self.root_hash)
            .finish()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    // A two-piece single-file torrent, bencoded by hand.
    pub fn single_file_torrent() -> MetaInfo {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"d8:announce26:http://tracker.example/ann4:infod6:lengthi32768e4:name8:test.bin12:piece lengthi16384e6:pieces40:");
        raw.extend_from_slice(&[0xaa; 20]);
        raw.extend_from_slice(&[0xbb; 20]);
        raw.extend_from_slice(b"ee");
        MetaInfo::from_bytes(&raw).unwrap()
    }

    pub fn multi_file_torrent() -> MetaInfo {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"d8:announce26:http://tracker.example/ann4:infod5:filesl");
        raw.extend_from_slice(b"d6:lengthi10000e4:pathl5:a.bineed6:lengthi10000e4:pathl3:sub5:b.bineee");
        raw.extend_from_slice(b"4:name4:test12:piece lengthi8192e6:pieces60:");
        raw.extend_from_slice(&[0u8; 60]);
        raw.extend_from_slice(b"ee");
        MetaInfo::from_bytes(&raw).unwrap()
    }

    #[test]
    fn test_single_file() {
        let metainfo = single_file_torrent();
        assert_eq!(metainfo.num_pieces(), 2);
        assert_eq!(metainfo.piece_len(), 16_384);
        assert_eq!(metainfo.total_len(), 32_768);
        assert!(!metainfo.is_multi_file());
        assert_eq!(metainfo.piece_hashes(), vec![[0xaa; 20], [0xbb; 20]]);

        let files = metainfo.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, std::path::PathBuf::from("test.bin"));
        assert_eq!(files[0].length, 32_768);
        assert_eq!(files[0].offset, 0);
    }

    #[test]
    fn test_multi_file() {
        let metainfo = multi_file_torrent();
        assert_eq!(metainfo.num_pieces(), 3);
        assert_eq!(metainfo.total_len(), 20_000);
        assert!(metainfo.is_multi_file());

        let files = metainfo.files();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, std::path::PathBuf::from("a.bin"));
        assert_eq!(files[0].offset, 0);
        assert_eq!(files[1].path, std::path::PathBuf::from("sub/b.bin"));
        assert_eq!(files[1].offset, 10_000);
        assert_eq!(files.iter().map(|f| f.length).sum::<u64>(), metainfo.total_len());
    }

    #[test]
    fn test_info_hash_matches_reencoding() {
        use sha1::Digest;
        let metainfo = single_file_torrent();
        let mut hasher = sha1::Sha1::new();
        hasher.update(serde_bencode::to_bytes(&metainfo.info).unwrap());
        let expected: ID = hasher.finalize().into();
        assert_eq!(metainfo.info_hash(), expected);
        assert_eq!(metainfo.info_hash_hex().len(), 40);
    }

    #[test]
    fn test_invalid_pieces_length() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"d8:announce26:http://tracker.example/ann4:infod6:lengthi32768e4:name8:test.bin12:piece lengthi16384e6:pieces10:");
        raw.extend_from_slice(&[0xaa; 10]);
        raw.extend_from_slice(b"ee");
        assert!(matches!(MetaInfo::from_bytes(&raw), Err(MetaInfoError::InvalidPiecesLength)));
    }

    #[test]
    fn test_trackers_from_announce_list() {
        let mut metainfo = single_file_torrent();
        metainfo.announce_list = Some(vec![
            vec!["http://a.example/ann".into(), "udp://b.example:6969".into()],
            vec!["not a url".into()],
            vec!["http://c.example/ann".into()],
        ]);
        let tiers = metainfo.trackers();
        // The invalid-only tier is dropped.
        assert_eq!(tiers.len(), 2);
        assert_eq!(tiers[0].len(), 2);
        assert_eq!(tiers[1][0].as_str(), "http://c.example/ann");
    }
}
