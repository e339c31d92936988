use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::{Arc, Mutex},
};

use sha1::{Digest, Sha1};
use tokio::{sync::mpsc, task};

use super::{
    error::{ReadError, WriteError},
    Alert, AlertReceiver, AlertSender, Command, CommandReceiver,
    CommandSender, PieceWrite,
};
use crate::{
    error::Result,
    storage_info::{FileInfo, FileSlice, StorageInfo},
    Bitfield, PieceIndex, Sha1Hash,
};

/// The entity responsible for verifying assembled pieces and flushing them
/// to the destination files.
///
/// The writer owns the destination files exclusively. Hashing and file IO
/// run on the blocking thread pool so the async executor is never stalled;
/// results are communicated back to the coordinator via the alert channel.
pub(super) struct Writer {
    /// All information concerning this torrent's storage.
    storage: StorageInfo,
    /// The concatenation of all expected piece hashes.
    piece_hashes: Arc<Vec<u8>>,
    /// Handles of all files in torrent, in torrent order. Files are opened
    /// lazily, on the first write that touches them.
    files: Arc<Vec<Mutex<TorrentFile>>>,
    /// Port on which the disk IO commands are received.
    cmd_port: CommandReceiver,
    /// Channel on which the writer sends alerts to the coordinator.
    alert_chan: AlertSender,
}

impl Writer {
    pub fn new(
        storage: StorageInfo,
        piece_hashes: Vec<u8>,
    ) -> (Self, CommandSender, AlertReceiver) {
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let files = storage
            .files
            .iter()
            .map(|info| Mutex::new(TorrentFile::new(info.clone())))
            .collect();
        (
            Self {
                storage,
                piece_hashes: Arc::new(piece_hashes),
                files: Arc::new(files),
                cmd_port,
                alert_chan,
            },
            cmd_chan,
            alert_port,
        )
    }

    /// Runs the disk task until shutdown.
    ///
    /// The first thing the task does is scan the destination for pieces that
    /// are already complete from an earlier run, so that the coordinator can
    /// start with those have-bits set. Only then are write commands served.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");

        let scan_result = self.scan_destination().await;
        self.alert_chan.send(Alert::ResumeScan(scan_result))?;

        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::WritePiece { index, data } => {
                    self.write_piece(index, data).await?;
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Hashes every piece's byte range found in the destination and reports
    /// the ones that are already complete.
    async fn scan_destination(&self) -> Result<Bitfield, ReadError> {
        log::info!(
            "Scanning {:?} for complete pieces",
            self.storage.download_dir
        );
        let storage = self.storage.clone();
        let piece_hashes = Arc::clone(&self.piece_hashes);
        let resumed =
            task::spawn_blocking(move || scan_pieces(&storage, &piece_hashes))
                .await
                .expect("resume scan task panicked")?;
        log::info!(
            "Resume scan found {}/{} complete piece(s)",
            resumed.count_ones(),
            self.storage.piece_count
        );
        Ok(resumed)
    }

    /// Verifies the assembled piece against its expected hash and, if it
    /// matches, flushes its byte range to the destination files.
    ///
    /// IO failures are reported via the alert channel rather than crashing
    /// the disk task; the coordinator decides that they are fatal.
    async fn write_piece(
        &self,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<()> {
        if index >= self.storage.piece_count {
            log::error!("Piece index {} is invalid", index);
            self.alert_chan.send(Alert::PieceWrite(Err(
                WriteError::InvalidPieceIndex,
            )))?;
            return Ok(());
        }

        let mut expected_hash: Sha1Hash = [0; 20];
        expected_hash
            .copy_from_slice(&self.piece_hashes[index * 20..index * 20 + 20]);

        let storage = self.storage.clone();
        let files = Arc::clone(&self.files);

        // don't block the executor with the hashing and the sync file writes
        let write_result = task::spawn_blocking(
            move || -> Result<bool, WriteError> {
                let digest = Sha1::digest(&data);
                let is_valid = digest.as_slice() == expected_hash.as_slice();
                if is_valid {
                    log::debug!(
                        "Piece {} is valid ({} bytes), flushing to disk",
                        index,
                        data.len()
                    );
                    write_piece_to_files(&storage, &files, index, &data)?;
                } else {
                    log::warn!("Piece {} hash mismatch", index);
                }
                Ok(is_valid)
            },
        )
        .await
        .expect("disk write task panicked");

        match write_result {
            Ok(is_valid) => {
                self.alert_chan.send(Alert::PieceWrite(Ok(PieceWrite {
                    index,
                    is_valid,
                })))?;
            }
            Err(e) => {
                log::error!("Disk write error: {}", e);
                self.alert_chan.send(Alert::PieceWrite(Err(e)))?;
            }
        }

        Ok(())
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        // files are flushed on close by the OS; make the intent explicit for
        // the handles we actually opened
        for file in self.files.iter() {
            if let Ok(mut file) = file.lock() {
                if let Some(handle) = file.handle.as_mut() {
                    let _ = handle.flush();
                }
            }
        }
    }
}

/// A destination file and its lazily opened handle.
struct TorrentFile {
    info: FileInfo,
    handle: Option<File>,
}

impl TorrentFile {
    fn new(info: FileInfo) -> Self {
        Self { info, handle: None }
    }

    /// Opens the file on first touch, creating parent directories and
    /// pre-sizing it to its declared length (sparse where the platform
    /// supports it).
    fn ensure_open(&mut self, download_dir: &Path) -> io::Result<&mut File> {
        if self.handle.is_none() {
            let path = download_dir.join(&self.info.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            log::info!("Opening file {:?}", path);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            if file.metadata()?.len() < self.info.len {
                file.set_len(self.info.len)?;
            }
            self.handle = Some(file);
        }
        Ok(self.handle.as_mut().expect("file opened above"))
    }

    fn write_slice(
        &mut self,
        download_dir: &Path,
        slice: FileSlice,
        data: &[u8],
    ) -> io::Result<()> {
        debug_assert_eq!(slice.len as usize, data.len());
        let file = self.ensure_open(download_dir)?;
        file.seek(SeekFrom::Start(slice.offset))?;
        file.write_all(data)
    }
}

/// Writes the piece's payload to its byte range `[index * piece_len ..)`,
/// split across the destination files it intersects.
fn write_piece_to_files(
    storage: &StorageInfo,
    files: &[Mutex<TorrentFile>],
    index: PieceIndex,
    data: &[u8],
) -> Result<(), WriteError> {
    let mut torrent_offset = storage.piece_offset(index);
    let file_range = storage
        .files_intersecting_piece(index)
        .map_err(|_| WriteError::InvalidPieceIndex)?;

    let mut rest = data;
    for file_index in file_range {
        let mut file =
            files[file_index].lock().expect("file lock poisoned");
        let slice = file.info.get_slice(torrent_offset, rest.len() as u64);
        let (chunk, remainder) = rest.split_at(slice.len as usize);
        file.write_slice(&storage.download_dir, slice, chunk)?;
        torrent_offset += slice.len;
        rest = remainder;
    }
    debug_assert!(rest.is_empty());

    Ok(())
}

/// Reads and hashes every piece present in the destination. Missing or short
/// files simply yield unset bits; no file is created or modified.
fn scan_pieces(
    storage: &StorageInfo,
    piece_hashes: &[u8],
) -> io::Result<Bitfield> {
    let mut resumed = Bitfield::repeat(false, storage.piece_count);

    // open what exists read-only; a missing file just means its pieces are
    // not present
    let mut handles: Vec<Option<File>> = Vec::with_capacity(storage.files.len());
    for info in &storage.files {
        let path = storage.download_dir.join(&info.path);
        match File::open(&path) {
            Ok(handle) => handles.push(Some(handle)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                handles.push(None)
            }
            Err(e) => return Err(e),
        }
    }

    'pieces: for index in 0..storage.piece_count {
        let piece_len =
            storage.piece_len(index).expect("valid piece index") as usize;
        let file_range = storage
            .files_intersecting_piece(index)
            .expect("valid piece index");

        let mut buf = vec![0; piece_len];
        let mut torrent_offset = storage.piece_offset(index);
        let mut filled = 0;

        for file_index in file_range {
            let info = &storage.files[file_index];
            let slice =
                info.get_slice(torrent_offset, (piece_len - filled) as u64);
            let handle = match &mut handles[file_index] {
                Some(handle) => handle,
                None => continue 'pieces,
            };
            handle.seek(SeekFrom::Start(slice.offset))?;
            let chunk = &mut buf[filled..filled + slice.len as usize];
            if let Err(e) = handle.read_exact(chunk) {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    // the file is shorter than its declared length, so this
                    // piece cannot be complete
                    continue 'pieces;
                }
                return Err(e);
            }
            filled += slice.len as usize;
            torrent_offset += slice.len;
        }

        let expected = &piece_hashes[index * 20..index * 20 + 20];
        if Sha1::digest(&buf).as_slice() == expected {
            resumed.set(index, true);
        }
    }

    Ok(resumed)
}
