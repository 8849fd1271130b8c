use std::{ops::Range, path::PathBuf};
use crate::metainfo::MetaInfo;

// File information derived from the metainfo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {

    // Path of the file relative to the output directory.
    pub path: PathBuf,

    // Length of the file in bytes.
    pub length: u64,

    // Offset in bytes from start of torrent when viewed as a single stream.
    pub offset: u64,

}

impl FileInfo {
    // Byte index range within the whole torrent stream.
    pub fn byte_range(&self) -> Range<u64> {
        self.offset..(self.offset + self.length)
    }
}

// General information on torrent storage, shared read-only after construction.
#[derive(Debug, Clone)]
pub struct StoreInfo {

    // Length of torrent in bytes.
    pub total_len: u64,

    // Length of pieces in bytes.
    pub piece_len: usize,

    // Length of the last piece, in (0, piece_len].
    pub last_piece_len: usize,

    // Number of pieces in torrent.
    pub num_pieces: usize,

    // Files contained in torrent.
    pub files: Vec<FileInfo>,

    // Directory to store downloaded files.
    pub output_dir: PathBuf,

}

impl StoreInfo {

    pub fn new(metainfo: &MetaInfo, download_dir: PathBuf) -> Self {

        let total_len = metainfo.total_len();
        let num_pieces = metainfo.num_pieces();
        let piece_len = metainfo.piece_len();
        let last_piece_len = (total_len - (piece_len as u64 * (num_pieces as u64 - 1))) as usize;
        let files = metainfo.files();
        // Multi-file torrents get a sub-directory named after the torrent;
        // a single-file torrent's one entry is already named after it.
        let output_dir = if metainfo.is_multi_file() {
            download_dir.join(metainfo.name())
        } else {
            download_dir
        };

        debug_assert_eq!(files.iter().map(|f| f.length).sum::<u64>(), total_len);
        debug_assert!(last_piece_len > 0 && last_piece_len <= piece_len);

        Self {
            total_len,
            piece_len,
            last_piece_len,
            num_pieces,
            files,
            output_dir,
        }
    }

    // Returns length of piece given its index, the last piece may be short.
    pub fn piece_len(&self, idx: usize) -> usize {
        if idx == self.num_pieces - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    // Offset of the piece within the torrent stream.
    pub fn piece_offset(&self, idx: usize) -> u64 {
        idx as u64 * self.piece_len as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::tests::{multi_file_torrent, single_file_torrent};

    #[test]
    fn test_piece_len() {
        let info = StoreInfo::new(&multi_file_torrent(), "downloads".into());
        assert_eq!(info.num_pieces, 3);
        assert_eq!(info.piece_len(0), 8192);
        assert_eq!(info.piece_len(1), 8192);
        assert_eq!(info.piece_len(2), 3616);
        assert_eq!(info.piece_offset(2), 16_384);
    }

    #[test]
    fn test_file_map() {
        let info = StoreInfo::new(&multi_file_torrent(), "downloads".into());
        // Multi-file layout nests under the torrent name.
        assert_eq!(info.output_dir, PathBuf::from("downloads/test"));
        assert_eq!(info.files.iter().map(|f| f.length).sum::<u64>(), info.total_len);
        assert_eq!(info.files[1].byte_range(), 10_000..20_000);
    }

    #[test]
    fn test_single_file_layout() {
        let info = StoreInfo::new(&single_file_torrent(), "downloads".into());
        assert_eq!(info.output_dir, PathBuf::from("downloads"));
        assert_eq!(info.files[0].path, PathBuf::from("test.bin"));
        assert_eq!(info.last_piece_len, 16_384);
    }
}
