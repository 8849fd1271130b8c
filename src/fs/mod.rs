use tokio::{sync::mpsc, task};
use crate::{
    store::StoreInfo,
    torrent::{CommandToTorrent, TorrentTx},
};

mod writer;
#[cfg(test)]
mod tests;

pub use writer::{verify_file_integrity, Writer};

#[derive(thiserror::Error, Debug)]
pub enum DiskError {

    #[error(transparent)]
    IoError(#[from] std::io::Error),

}

pub type Result<T> = std::result::Result<T, DiskError>;
pub type DiskTx = mpsc::UnboundedSender<CommandToDisk>;
pub type DiskRx = mpsc::UnboundedReceiver<CommandToDisk>;

pub enum CommandToDisk {

    // Verified piece to be written out.
    WritePiece {
        idx: usize,
        data: Vec<u8>,
    },

    // Shutdown the disk task.
    Shutdown,

}

// The disk task owns the writer; funnelling every piece through one task
// guarantees at most one concurrent writer.
#[derive(Debug)]
struct Disk {

    writer: Writer,

    disk_rx: DiskRx,

    // Write acknowledgements for the torrent task.
    torrent_tx: TorrentTx,

}

// Set up and spawn the disk task.
// Fails if the output directory cannot be created.
pub fn spawn(info: StoreInfo, torrent_tx: TorrentTx) -> Result<(task::JoinHandle<Result<()>>, DiskTx)> {
    tracing::info!("spawning disk task");

    let (disk_tx, disk_rx) = mpsc::unbounded_channel();
    let mut disk = Disk {
        writer: Writer::new(info)?,
        disk_rx,
        torrent_tx,
    };
    let handle = tokio::task::spawn(async move { disk.run().await });
    Ok((handle, disk_tx))
}

impl Disk {

    #[tracing::instrument(name = "disk", skip_all)]
    async fn run(&mut self) -> Result<()> {
        while let Some(cmd) = self.disk_rx.recv().await {
            match cmd {

                CommandToDisk::WritePiece { idx, data } => {
                    self.writer.write_piece(idx, &data);
                    // The piece is counted complete even if a write failed;
                    // the torrent task only uses this to track progress.
                    self.torrent_tx.send(CommandToTorrent::PieceWritten { idx }).ok();
                },

                CommandToDisk::Shutdown => {
                    tracing::info!("disk shutdown");
                    self.writer.close();
                    break;
                },

            }
        }
        Ok(())
    }
}
