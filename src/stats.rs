// Snapshot of download progress, handed out by the piece store.
#[derive(Debug, Default, Clone, Copy)]
pub struct DownloadStats {

    pub total_pieces: usize,

    pub completed_pieces: usize,

    pub bytes_downloaded: u64,

    pub total_bytes: u64,

    pub percent: f64,

}

pub fn format_bytes(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KiB", "MiB", "GiB"] {
        if size < 1024.0 {
            return format!("{:.1} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.1} TiB", size)
}

pub fn format_speed(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_second as u64))
}
