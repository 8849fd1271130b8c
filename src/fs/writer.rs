use std::{
    collections::HashMap,
    fs,
    io::{Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};
use crate::store::{FileInfo, StoreInfo};
use super::Result;

// Maps verified pieces onto the torrent's file layout. Files are created
// lazily, preallocated to their declared length, and their handles cached
// for the lifetime of the writer.
#[derive(Debug)]
pub struct Writer {

    info: StoreInfo,

    // Open file handles, keyed by path relative to the output directory.
    handles: HashMap<PathBuf, fs::File>,

}

impl Writer {

    pub fn new(info: StoreInfo) -> Result<Self> {
        // Failing to create the output directory aborts startup.
        if !info.output_dir.is_dir() {
            fs::create_dir_all(&info.output_dir)?;
            tracing::info!("created output directory: {:?}", info.output_dir);
        }
        Ok(Self {
            info,
            handles: HashMap::new(),
        })
    }

    // Write a piece across every file whose byte range intersects it.
    // Individual write failures are logged and abandoned; the piece is
    // already verified and counted, a retry would not change that.
    pub fn write_piece(&mut self, piece_idx: usize, data: &[u8]) {

        let piece_start = self.info.piece_offset(piece_idx);
        let piece_end = piece_start + data.len() as u64;

        let overlapping: Vec<FileInfo> = self.info.files
            .iter()
            .filter(|f| {
                let range = f.byte_range();
                range.start < piece_end && piece_start < range.end
            })
            .cloned()
            .collect();

        for file in overlapping {
            let overlap_start = piece_start.max(file.offset);
            let overlap_end = piece_end.min(file.offset + file.length);
            let chunk = &data[(overlap_start - piece_start) as usize..(overlap_end - piece_start) as usize];

            if let Err(e) = self.write_to_file(&file, overlap_start - file.offset, chunk) {
                tracing::error!("failed writing piece {} to {:?}: {}", piece_idx, file.path, e);
            }
        }
    }

    fn write_to_file(&mut self, file: &FileInfo, pos: u64, data: &[u8]) -> std::io::Result<()> {
        let handle = self.open_file(file)?;
        handle.seek(SeekFrom::Start(pos))?;
        handle.write_all(data)?;
        // Bound data loss on crash.
        handle.sync_data()?;
        tracing::trace!("wrote {} bytes to {:?} at offset {}", data.len(), file.path, pos);
        Ok(())
    }

    // Opens a file for random access, preallocating it to its declared
    // length the first time it is seen.
    fn open_file(&mut self, file: &FileInfo) -> std::io::Result<&mut fs::File> {
        use std::collections::hash_map::Entry;

        match self.handles.entry(file.path.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let path = self.info.output_dir.join(&file.path);
                if let Some(parent) = path.parent() {
                    if !parent.is_dir() {
                        fs::create_dir_all(parent)?;
                    }
                }
                tracing::info!("creating file: {:?}", path);
                let handle = fs::OpenOptions::new()
                    .create(true)
                    .read(true)
                    .write(true)
                    .open(&path)?;
                // Sparse extension to the declared length.
                if handle.metadata()?.len() < file.length {
                    handle.set_len(file.length)?;
                }
                Ok(entry.insert(handle))
            },
        }
    }

    // True iff every file in the map exists at its declared size.
    pub fn verify_file_integrity(&self) -> bool {
        verify_file_integrity(&self.info)
    }

    pub fn download_path(&self) -> &Path {
        &self.info.output_dir
    }

    // Flushes and releases all open file handles.
    pub fn close(&mut self) {
        for (path, handle) in self.handles.drain() {
            if let Err(e) = handle.sync_all() {
                tracing::warn!("error closing file {:?}: {}", path, e);
            }
        }
    }
}

pub fn verify_file_integrity(info: &StoreInfo) -> bool {
    info.files.iter().all(|f| {
        let path = info.output_dir.join(&f.path);
        match fs::metadata(&path) {
            Ok(meta) if meta.len() == f.length => true,
            Ok(meta) => {
                tracing::error!("file {:?} has size {}, expected {}", path, meta.len(), f.length);
                false
            },
            Err(e) => {
                tracing::error!("file {:?} missing: {}", path, e);
                false
            },
        }
    })
}
