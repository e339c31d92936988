use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
    task,
};

use crate::{
    error::{Error, Result},
    storage_info::StorageInfo,
    Bitfield, PieceIndex,
};
use error::{ReadError, WriteError};
use io::Writer;

pub(crate) mod error;
mod io;

/// Spawns the disk IO task and returns a tuple with the task join handle,
/// the disk handle used for sending commands, and the channel on which the
/// task's alerts are received.
pub(crate) fn spawn(
    storage: StorageInfo,
    piece_hashes: Vec<u8>,
) -> Result<(task::JoinHandle<Result<()>>, DiskHandle, AlertReceiver)> {
    log::info!("Spawning disk IO task");
    let (mut writer, cmd_chan, alert_port) = Writer::new(storage, piece_hashes);
    let join_handle = task::spawn(async move { writer.start().await });
    Ok((join_handle, DiskHandle(cmd_chan), alert_port))
}

/// The handle for the disk task, used to execute disk IO related commands.
///
/// The handle may be copied an arbitrary number of times. It is an
/// abstraction over the means to communicate with the disk IO task.
#[derive(Clone)]
pub(crate) struct DiskHandle(CommandSender);

impl DiskHandle {
    /// Queues an assembled piece for verification and eventual writing to
    /// disk. The result is advertised on the alert channel.
    pub fn write_piece(&self, index: PieceIndex, data: Vec<u8>) -> Result<()> {
        log::trace!("Queuing piece {} for writing", index);
        self.0
            .send(Command::WritePiece { index, data })
            .map_err(Error::from)
    }

    /// Shuts down the disk IO task, flushing the files it touched.
    pub fn shutdown(&self) -> Result<()> {
        log::trace!("Shutting down disk IO task");
        self.0.send(Command::Shutdown).map_err(Error::from)
    }
}

/// The channel for sending commands to the disk task.
type CommandSender = UnboundedSender<Command>;
/// The channel the disk task uses to listen for commands.
type CommandReceiver = UnboundedReceiver<Command>;

/// The commands that the disk task can execute.
enum Command {
    /// Request to verify and eventually write an assembled piece to disk.
    WritePiece { index: PieceIndex, data: Vec<u8> },
    /// Eventually shut down the disk task.
    Shutdown,
}

/// The channel used to alert the coordinator of disk events.
type AlertSender = UnboundedSender<Alert>;
/// The channel on which the coordinator listens for disk events.
pub(crate) type AlertReceiver = UnboundedReceiver<Alert>;

/// The alerts that the disk task sends to the coordinator.
#[derive(Debug)]
pub(crate) enum Alert {
    /// Sent exactly once, before any write command is served: the result of
    /// scanning the destination for pieces completed by an earlier run.
    ResumeScan(Result<Bitfield, ReadError>),
    /// Sent for every piece handed to the disk task: whether it verified
    /// (and was flushed), or the write failed.
    PieceWrite(Result<PieceWrite, WriteError>),
}

/// The outcome of verifying and flushing a single piece.
#[derive(Debug)]
pub(crate) struct PieceWrite {
    /// The piece's index.
    pub index: PieceIndex,
    /// Whether the piece's hash matched its expected hash. Pieces failing
    /// verification are not written.
    pub is_valid: bool,
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use sha1::{Digest, Sha1};

    use super::*;
    use crate::{
        metainfo::{File, Info, Metainfo},
        BLOCK_LEN,
    };

    /// Tests writing of a complete valid torrent's pieces, verifying that
    /// an alert for each write is returned and that the file contents match.
    #[tokio::test]
    async fn should_write_all_pieces() {
        let env = Env::new_single_file("write_all_pieces");
        let (_, disk_handle, mut alert_port) =
            spawn(env.storage.clone(), env.piece_hashes.clone()).unwrap();

        // a fresh destination has nothing to resume
        match alert_port.recv().await.unwrap() {
            Alert::ResumeScan(Ok(resumed)) => assert!(resumed.not_any()),
            alert => panic!("unexpected alert {:?}", alert),
        }

        for (index, piece) in env.pieces.iter().enumerate() {
            disk_handle.write_piece(index, piece.clone()).unwrap();
            match alert_port.recv().await.unwrap() {
                Alert::PieceWrite(Ok(write)) => {
                    assert_eq!(write.index, index);
                    assert!(write.is_valid);
                }
                alert => panic!("unexpected alert {:?}", alert),
            }
        }

        // the file is the concatenation of all pieces
        let content = fs::read(env.download_dir.join("content")).unwrap();
        let expected: Vec<u8> =
            env.pieces.iter().flatten().copied().collect();
        assert_eq!(content, expected);
    }

    /// Tests that a piece failing hash verification is reported as invalid
    /// and not written.
    #[tokio::test]
    async fn should_reject_invalid_piece() {
        let env = Env::new_single_file("reject_invalid_piece");
        let (_, disk_handle, mut alert_port) =
            spawn(env.storage.clone(), env.piece_hashes.clone()).unwrap();
        alert_port.recv().await.unwrap(); // resume scan

        let corrupted: Vec<u8> =
            env.pieces[0].iter().map(|b| b.wrapping_add(5)).collect();
        disk_handle.write_piece(0, corrupted).unwrap();

        match alert_port.recv().await.unwrap() {
            Alert::PieceWrite(Ok(write)) => {
                assert_eq!(write.index, 0);
                assert!(!write.is_valid);
            }
            alert => panic!("unexpected alert {:?}", alert),
        }

        // nothing was flushed, the destination file was never touched
        assert!(!env.download_dir.join("content").exists());
    }

    /// Tests that a piece spanning two files is split correctly: with files
    /// a (10 bytes) and b (20 bytes) and 16 byte pieces, piece 0 covers
    /// a[0..10] + b[0..6] and piece 1 covers b[6..20].
    #[tokio::test]
    async fn should_split_piece_across_files() {
        let env = Env::new_archive("split_across_files");
        let (_, disk_handle, mut alert_port) =
            spawn(env.storage.clone(), env.piece_hashes.clone()).unwrap();
        alert_port.recv().await.unwrap(); // resume scan

        for (index, piece) in env.pieces.iter().enumerate() {
            disk_handle.write_piece(index, piece.clone()).unwrap();
            match alert_port.recv().await.unwrap() {
                Alert::PieceWrite(Ok(write)) => assert!(write.is_valid),
                alert => panic!("unexpected alert {:?}", alert),
            }
        }

        let a = fs::read(env.download_dir.join("archive/a")).unwrap();
        let b = fs::read(env.download_dir.join("archive/b")).unwrap();
        assert_eq!(a.len(), 10);
        assert_eq!(b.len(), 20);
        let mut content = a;
        content.extend(b);
        let expected: Vec<u8> =
            env.pieces.iter().flatten().copied().collect();
        assert_eq!(content, expected);
    }

    /// Tests that restarting the disk task over a complete destination
    /// reports every piece as resumable, and over a partial destination only
    /// the pieces actually present.
    #[tokio::test]
    async fn should_resume_from_destination() {
        let env = Env::new_archive("resume_from_destination");

        // only write the second piece; the first file is never touched
        {
            let (_, disk_handle, mut alert_port) =
                spawn(env.storage.clone(), env.piece_hashes.clone()).unwrap();
            alert_port.recv().await.unwrap(); // resume scan
            disk_handle.write_piece(1, env.pieces[1].clone()).unwrap();
            match alert_port.recv().await.unwrap() {
                Alert::PieceWrite(Ok(write)) => assert!(write.is_valid),
                alert => panic!("unexpected alert {:?}", alert),
            }
        }

        // a new scan over the same destination finds piece 1 but not piece
        // 0, whose first file is missing
        {
            let (_, _disk_handle, mut alert_port) =
                spawn(env.storage.clone(), env.piece_hashes.clone()).unwrap();
            match alert_port.recv().await.unwrap() {
                Alert::ResumeScan(Ok(resumed)) => {
                    assert!(!resumed[0]);
                    assert!(resumed[1]);
                }
                alert => panic!("unexpected alert {:?}", alert),
            }
        }

        // complete the download and scan once more: everything resumes
        {
            let (_, disk_handle, mut alert_port) =
                spawn(env.storage.clone(), env.piece_hashes.clone()).unwrap();
            alert_port.recv().await.unwrap();
            disk_handle.write_piece(0, env.pieces[0].clone()).unwrap();
            alert_port.recv().await.unwrap();
        }
        {
            let (_, _disk_handle, mut alert_port) =
                spawn(env.storage.clone(), env.piece_hashes.clone()).unwrap();
            match alert_port.recv().await.unwrap() {
                Alert::ResumeScan(Ok(resumed)) => assert!(resumed.all()),
                alert => panic!("unexpected alert {:?}", alert),
            }
        }
    }

    /// The disk IO test environment containing information of a valid
    /// torrent.
    struct Env {
        pieces: Vec<Vec<u8>>,
        piece_hashes: Vec<u8>,
        storage: StorageInfo,
        download_dir: PathBuf,
    }

    impl Env {
        /// A single file torrent of four pieces, the last slightly shorter.
        fn new_single_file(test_name: &str) -> Self {
            let piece_len = 4 * BLOCK_LEN;
            let last_piece_len = piece_len - 935;
            let pieces: Vec<Vec<u8>> = (0u32..4)
                .map(|index| {
                    let len = if index == 3 { last_piece_len } else { piece_len };
                    (0..len).map(|b| ((b + index) % 256) as u8).collect()
                })
                .collect();
            let download_len: u64 =
                pieces.iter().map(|p| p.len() as u64).sum();

            let info = Info {
                name: "content".into(),
                pieces: make_piece_hashes(&pieces),
                piece_len,
                length: Some(download_len),
                files: None,
                private: None,
            };
            Self::from_info(test_name, info, pieces)
        }

        /// The two file archive from the storage layout tests: a (10 bytes)
        /// and b (20 bytes) with 16 byte pieces.
        fn new_archive(test_name: &str) -> Self {
            let pieces: Vec<Vec<u8>> = vec![
                (0u8..16).collect(),
                (16u8..30).collect(),
            ];
            let info = Info {
                name: "archive".into(),
                pieces: make_piece_hashes(&pieces),
                piece_len: 16,
                length: None,
                files: Some(vec![
                    File {
                        path: vec!["a".into()],
                        length: 10,
                    },
                    File {
                        path: vec!["b".into()],
                        length: 20,
                    },
                ]),
                private: None,
            };
            Self::from_info(test_name, info, pieces)
        }

        /// Tests run in parallel so environments must not clash: the unique
        /// test name is included in the destination path. Any leftovers of
        /// an earlier run are removed first.
        fn from_info(test_name: &str, info: Info, pieces: Vec<Vec<u8>>) -> Self {
            let download_dir =
                PathBuf::from(format!("/tmp/remora_disk_test_{}", test_name));
            if download_dir.exists() {
                fs::remove_dir_all(&download_dir)
                    .expect("failed to clean up previous test destination");
            }
            fs::create_dir_all(&download_dir).unwrap();

            let piece_hashes = info.pieces.clone();
            let metainfo = Metainfo {
                announce: None,
                announce_list: None,
                info,
                info_hash: [0; 20],
            };
            let storage = StorageInfo::new(&metainfo, &download_dir);

            Self {
                pieces,
                piece_hashes,
                storage,
                download_dir,
            }
        }
    }

    fn make_piece_hashes(pieces: &[Vec<u8>]) -> Vec<u8> {
        let mut hashes = Vec::with_capacity(pieces.len() * 20);
        for piece in pieces {
            hashes.extend(Sha1::digest(piece).as_slice());
        }
        hashes
    }
}
