use std::path::PathBuf;
use crate::store::{FileInfo, StoreInfo};
use crate::torrent::CommandToTorrent;
use super::*;

fn single_file_info(dir: PathBuf) -> StoreInfo {
    StoreInfo {
        total_len: 32_768,
        piece_len: 16_384,
        last_piece_len: 16_384,
        num_pieces: 2,
        files: vec![FileInfo {
            path: "single.bin".into(),
            length: 32_768,
            offset: 0,
        }],
        output_dir: dir,
    }
}

// Two 10,000 byte files over 8,192 byte pieces; the middle piece straddles
// the file boundary.
fn multi_file_info(dir: PathBuf) -> StoreInfo {
    StoreInfo {
        total_len: 20_000,
        piece_len: 8192,
        last_piece_len: 3616,
        num_pieces: 3,
        files: vec![
            FileInfo { path: "a.bin".into(), length: 10_000, offset: 0 },
            FileInfo { path: "b.bin".into(), length: 10_000, offset: 10_000 },
        ],
        output_dir: dir,
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
}

#[test]
fn test_write_single_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let info = single_file_info(dir.path().into());
    let mut writer = Writer::new(info.clone()).unwrap();

    let piece_0 = pattern(16_384, 0);
    let piece_1 = pattern(16_384, 100);
    writer.write_piece(0, &piece_0);
    writer.write_piece(1, &piece_1);
    assert!(writer.verify_file_integrity());
    writer.close();

    let on_disk = std::fs::read(dir.path().join("single.bin")).unwrap();
    let mut expected = piece_0;
    expected.extend_from_slice(&piece_1);
    assert_eq!(on_disk, expected);
}

// Pieces delivered out of order reassemble into the exact stream, split
// across the file map at byte 10,000.
#[test]
fn test_write_multi_file_out_of_order() {
    let dir = tempfile::TempDir::new().unwrap();
    let info = multi_file_info(dir.path().into());
    let mut writer = Writer::new(info.clone()).unwrap();

    let stream = pattern(20_000, 42);
    writer.write_piece(2, &stream[16_384..]);
    writer.write_piece(0, &stream[..8192]);
    writer.write_piece(1, &stream[8192..16_384]);
    assert!(writer.verify_file_integrity());
    writer.close();

    let a = std::fs::read(dir.path().join("a.bin")).unwrap();
    let b = std::fs::read(dir.path().join("b.bin")).unwrap();
    assert_eq!(a, &stream[..10_000]);
    assert_eq!(b, &stream[10_000..]);
}

#[test]
fn test_files_preallocated_to_declared_length() {
    let dir = tempfile::TempDir::new().unwrap();
    let info = multi_file_info(dir.path().into());
    let mut writer = Writer::new(info.clone()).unwrap();

    // Writing the straddling piece touches both files; each must already be
    // at its full declared size afterwards.
    let piece_1 = pattern(8192, 7);
    writer.write_piece(1, &piece_1);

    assert_eq!(std::fs::metadata(dir.path().join("a.bin")).unwrap().len(), 10_000);
    assert_eq!(std::fs::metadata(dir.path().join("b.bin")).unwrap().len(), 10_000);
    assert!(writer.verify_file_integrity());

    // And the straddling bytes landed either side of the boundary.
    let a = std::fs::read(dir.path().join("a.bin")).unwrap();
    let b = std::fs::read(dir.path().join("b.bin")).unwrap();
    assert_eq!(&a[8192..10_000], &piece_1[..1808]);
    assert_eq!(&b[..6384], &piece_1[1808..]);
}

#[test]
fn test_verify_detects_missing_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let info = multi_file_info(dir.path().into());
    let mut writer = Writer::new(info.clone()).unwrap();

    writer.write_piece(0, &pattern(8192, 0));
    // b.bin was never touched.
    assert!(!writer.verify_file_integrity());
}

#[test]
fn test_creates_nested_directories() {
    let dir = tempfile::TempDir::new().unwrap();
    let mut info = single_file_info(dir.path().into());
    info.files[0].path = PathBuf::from("nested/deeper/single.bin");
    let mut writer = Writer::new(info).unwrap();

    writer.write_piece(0, &pattern(16_384, 0));
    assert!(dir.path().join("nested/deeper/single.bin").is_file());
}

#[tokio::test]
async fn test_disk_task_acknowledges_writes() {
    let dir = tempfile::TempDir::new().unwrap();
    let info = single_file_info(dir.path().into());
    let (torrent_tx, mut torrent_rx) = tokio::sync::mpsc::unbounded_channel();
    let (handle, disk_tx) = spawn(info, torrent_tx).unwrap();

    let piece = pattern(16_384, 3);
    disk_tx.send(CommandToDisk::WritePiece { idx: 1, data: piece.clone() }).unwrap();

    match torrent_rx.recv().await {
        Some(CommandToTorrent::PieceWritten { idx }) => assert_eq!(idx, 1),
        _ => panic!("expected write acknowledgement"),
    }

    disk_tx.send(CommandToDisk::Shutdown).unwrap();
    handle.await.unwrap().unwrap();

    let on_disk = std::fs::read(dir.path().join("single.bin")).unwrap();
    assert_eq!(&on_disk[16_384..], piece);
}
