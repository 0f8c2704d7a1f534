//! File transfer sub-protocol.
//!
//! Send side: [`FileSender`] yields `SendFileCipher`, `SendFileInfo`, one `File`
//! envelope per encrypted chunk, then `SendFileEnd`. Directories travel as tar.
//!
//! Receive side: [`FileReceiver`] hands ciphertext to a blocking worker over a
//! bounded channel; the worker decrypts and writes. At most one per channel.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::archive::Archive;
use crate::cipher::{CipherContext, CipherError};
use crate::integrity::{self, RunningDigest};
use crate::protocol::{ControlMessage, Envelope, FileFormat, MsgType, Param, ProtocolError};

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024; // 256 KiB

/// Default depth of the receive worker queue.
pub const DEFAULT_SINK_CAPACITY: usize = 64;

const TAR_SUFFIX: &str = ".tar";

/// Parsed `SendFileInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub format: FileFormat,
    pub digest: Vec<u8>,
}

impl FileInfo {
    pub fn to_message(&self, session_id: &str) -> ControlMessage {
        ControlMessage::new(MsgType::SendFileInfo, session_id).with_params(vec![
            Param::from(self.name.clone()),
            Param::Int(self.size as i64),
            Param::from(self.format.as_str()),
            Param::Bytes(self.digest.clone()),
        ])
    }

    pub fn from_message(msg: &ControlMessage) -> Result<Self, TransferError> {
        let bad = || TransferError::Violation(format!("malformed file info: {msg}"));
        let [name, size, format, digest] = msg.params.as_slice() else {
            return Err(bad());
        };
        let name = name.as_str().ok_or_else(bad)?;
        validate_name(name)?;
        let size = size
            .as_int()
            .and_then(|s| u64::try_from(s).ok())
            .ok_or_else(bad)?;
        let format = format
            .as_str()
            .and_then(FileFormat::parse)
            .ok_or_else(bad)?;
        let digest = digest.as_bytes().ok_or_else(bad)?.to_vec();
        Ok(Self {
            name: name.to_string(),
            size,
            format,
            digest,
        })
    }
}

pub fn cipher_message(session_id: &str, cipher: &CipherContext) -> ControlMessage {
    ControlMessage::new(MsgType::SendFileCipher, session_id).with_params(vec![
        Param::Bytes(cipher.key().to_vec()),
        Param::Bytes(cipher.iv().to_vec()),
    ])
}

pub fn cipher_from_message(msg: &ControlMessage) -> Result<CipherContext, TransferError> {
    match msg.params.as_slice() {
        [Param::Bytes(key), Param::Bytes(iv)] => Ok(CipherContext::from_slices(key, iv)?),
        _ => Err(TransferError::Violation(format!(
            "malformed file cipher: {msg}"
        ))),
    }
}

pub fn get_file_message(session_id: &str, name: &str) -> ControlMessage {
    ControlMessage::new(MsgType::GetFile, session_id).with_params(vec![Param::from(name)])
}

/// Requested name of a `GetFile`.
pub fn requested_name(msg: &ControlMessage) -> Result<&str, TransferError> {
    msg.params
        .first()
        .and_then(Param::as_str)
        .ok_or_else(|| TransferError::Violation(format!("malformed file request: {msg}")))
}

/// A transferred name must be a single path component.
pub fn validate_name(name: &str) -> Result<(), TransferError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(TransferError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// `dir/name`, or `dir/dup-<n>/name` for the first free `n`.
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let mut candidate = dir.join(name);
    let mut index = 1u32;
    while candidate.exists() {
        candidate = dir.join(format!("dup-{index}")).join(name);
        index += 1;
    }
    candidate
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendStage {
    Cipher,
    Info,
    Chunks,
    End,
    Finished,
}

/// Pull-based generator of the envelopes for one requested path.
pub struct FileSender {
    session_id: String,
    outer: CipherContext,
    file_cipher: CipherContext,
    info: FileInfo,
    source: PathBuf,
    file: Option<tokio::fs::File>,
    /// Temporary archive to remove once sent.
    scratch: Option<PathBuf>,
    chunk_size: usize,
    stage: SendStage,
}

impl FileSender {
    /// Stat (and for directories, pack) `path`, and hash what will be sent.
    pub async fn prepare(
        path: &Path,
        session_id: &str,
        outer: &CipherContext,
        archive: Arc<dyn Archive>,
        scratch_dir: &Path,
        chunk_size: usize,
    ) -> Result<Self, TransferError> {
        let base = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransferError::InvalidName(path.display().to_string()))?
            .to_string();
        let meta = tokio::fs::metadata(path).await?;

        let (source, name, format, scratch) = if meta.is_dir() {
            tokio::fs::create_dir_all(scratch_dir).await?;
            let name = format!("{base}{TAR_SUFFIX}");
            let tar_path = unique_path(scratch_dir, &name);
            if let Some(parent) = tar_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let (src, dst) = (path.to_path_buf(), tar_path.clone());
            tokio::task::spawn_blocking(move || archive.pack(&src, &dst))
                .await
                .map_err(|_| TransferError::WorkerFailed)??;
            (tar_path.clone(), name, FileFormat::TarArchived, Some(tar_path))
        } else {
            (path.to_path_buf(), base, FileFormat::Plain, None)
        };

        let hash_path = source.clone();
        let (digest, size) = tokio::task::spawn_blocking(move || integrity::hash_file(&hash_path))
            .await
            .map_err(|_| TransferError::WorkerFailed)??;

        tracing::debug!(path = %path.display(), %name, size, format = ?format, "prepared file for sending");
        Ok(Self {
            session_id: session_id.to_string(),
            outer: outer.clone(),
            file_cipher: CipherContext::generate(),
            info: FileInfo {
                name,
                size,
                format,
                digest: digest.to_vec(),
            },
            source,
            file: None,
            scratch,
            chunk_size: if chunk_size == 0 {
                DEFAULT_CHUNK_SIZE
            } else {
                chunk_size
            },
            stage: SendStage::Cipher,
        })
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    /// Next envelope, `None` after `SendFileEnd`.
    pub async fn next_envelope(&mut self) -> Result<Option<Envelope>, TransferError> {
        match self.stage {
            SendStage::Cipher => {
                self.stage = SendStage::Info;
                let msg = cipher_message(&self.session_id, &self.file_cipher);
                Ok(Some(Envelope::encrypted(&msg, &self.outer)?))
            }
            SendStage::Info => {
                self.stage = SendStage::Chunks;
                self.file = Some(tokio::fs::File::open(&self.source).await?);
                let msg = self.info.to_message(&self.session_id);
                Ok(Some(Envelope::encrypted(&msg, &self.outer)?))
            }
            SendStage::Chunks => {
                if let Some(chunk) = self.read_chunk().await? {
                    return Ok(Some(Envelope::file(self.file_cipher.encrypt(&chunk)?)));
                }
                self.stage = SendStage::End;
                self.file = None;
                self.cleanup().await;
                let msg = ControlMessage::new(MsgType::SendFileEnd, &self.session_id);
                Ok(Some(Envelope::encrypted(&msg, &self.outer)?))
            }
            SendStage::End | SendStage::Finished => {
                self.stage = SendStage::Finished;
                Ok(None)
            }
        }
    }

    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, TransferError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(None);
        };
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(buf))
    }

    async fn cleanup(&mut self) {
        if let Some(scratch) = self.scratch.take() {
            if let Err(e) = tokio::fs::remove_file(&scratch).await {
                tracing::warn!(path = %scratch.display(), error = %e, "failed to remove temporary archive");
            }
        }
    }
}

enum SinkCommand {
    Open(PathBuf),
    Chunk(Vec<u8>),
    Finish,
}

struct SinkReport {
    written: u64,
    digest: [u8; integrity::DIGEST_LEN],
}

/// Receive-side state of the one transfer in flight.
pub struct FileReceiver {
    dest_dir: PathBuf,
    tx: mpsc::Sender<SinkCommand>,
    /// Taken once joined.
    worker: Option<JoinHandle<Result<SinkReport, TransferError>>>,
    incoming: Option<Incoming>,
}

struct Incoming {
    info: FileInfo,
    path: PathBuf,
    unpack_dir: Option<PathBuf>,
}

impl FileReceiver {
    /// Start the worker for a `SendFileCipher`. Files land under `dest_dir`.
    pub fn start(cipher: CipherContext, dest_dir: PathBuf, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::task::spawn_blocking(move || sink_worker(cipher, rx));
        Self {
            dest_dir,
            tx,
            worker: Some(worker),
            incoming: None,
        }
    }

    /// Handle `SendFileInfo`: pick the destination and open it.
    pub async fn begin(&mut self, info: FileInfo) -> Result<&Path, TransferError> {
        if self.incoming.is_some() {
            return Err(TransferError::Violation(
                "duplicate file info in one transfer".into(),
            ));
        }
        let path = unique_path(&self.dest_dir, &info.name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let unpack_dir = match info.format {
            FileFormat::TarArchived => {
                let stem = info.name.strip_suffix(TAR_SUFFIX).unwrap_or(&info.name);
                Some(unique_path(&self.dest_dir, stem))
            }
            FileFormat::Plain => None,
        };
        tracing::debug!(name = %info.name, size = info.size, path = %path.display(), "receiving file");
        self.send(SinkCommand::Open(path.clone())).await?;
        let incoming = self.incoming.insert(Incoming {
            info,
            path,
            unpack_dir,
        });
        Ok(&incoming.path)
    }

    /// Handle a `File` envelope payload.
    pub async fn chunk(&mut self, ciphertext: Vec<u8>) -> Result<(), TransferError> {
        if self.incoming.is_none() {
            return Err(TransferError::Violation(
                "file data before file info".into(),
            ));
        }
        self.send(SinkCommand::Chunk(ciphertext)).await
    }

    /// Handle `SendFileEnd`: join the worker, verify, unpack. Returns the final local path.
    pub async fn finish(mut self, archive: Arc<dyn Archive>) -> Result<PathBuf, TransferError> {
        let Some(incoming) = self.incoming.take() else {
            return Err(TransferError::Violation("file end before file info".into()));
        };
        // Worker errors surface through the join below.
        let _ = self.tx.send(SinkCommand::Finish).await;
        let report = self.join().await?;

        if report.written != incoming.info.size {
            return Err(TransferError::SizeMismatch {
                expected: incoming.info.size,
                got: report.written,
            });
        }
        if !integrity::verify(&incoming.info.digest, &report.digest) {
            return Err(TransferError::DigestMismatch(incoming.info.name));
        }

        match incoming.unpack_dir {
            Some(dir) => {
                let (tar_path, dest) = (incoming.path.clone(), dir.clone());
                tokio::task::spawn_blocking(move || archive.unpack(&tar_path, &dest))
                    .await
                    .map_err(|_| TransferError::WorkerFailed)??;
                tracing::debug!(archive = %incoming.path.display(), dir = %dir.display(), "unpacked archive");
                Ok(dir)
            }
            None => Ok(incoming.path),
        }
    }

    /// Abandon the transfer: the worker removes the partial file and is joined.
    pub async fn cancel(self) {
        let Self { tx, worker, .. } = self;
        drop(tx);
        let Some(worker) = worker else { return };
        match worker.await {
            Ok(Err(TransferError::Cancelled)) | Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "sink worker failed before cancel"),
            Err(e) => tracing::debug!(error = %e, "sink worker panicked"),
        }
    }

    async fn send(&mut self, cmd: SinkCommand) -> Result<(), TransferError> {
        if self.tx.send(cmd).await.is_ok() {
            return Ok(());
        }
        // Worker gave up; its error is the interesting one.
        match self.join().await {
            Err(e) => Err(e),
            Ok(_) => Err(TransferError::WorkerFailed),
        }
    }

    async fn join(&mut self) -> Result<SinkReport, TransferError> {
        let worker = self.worker.take().ok_or(TransferError::WorkerFailed)?;
        worker.await.map_err(|_| TransferError::WorkerFailed)?
    }
}

type SinkOutput = Option<(std::io::BufWriter<std::fs::File>, PathBuf)>;

/// Blocking side of a receive. A failed or abandoned file is removed.
fn sink_worker(
    cipher: CipherContext,
    mut rx: mpsc::Receiver<SinkCommand>,
) -> Result<SinkReport, TransferError> {
    let mut out: SinkOutput = None;
    let result = drain_sink(&cipher, &mut rx, &mut out);
    if let (Err(e), Some((writer, path))) = (&result, out.take()) {
        tracing::debug!(path = %path.display(), error = %e, "removing partial file");
        drop(writer);
        let _ = std::fs::remove_file(&path);
    }
    result
}

fn drain_sink(
    cipher: &CipherContext,
    rx: &mut mpsc::Receiver<SinkCommand>,
    out: &mut SinkOutput,
) -> Result<SinkReport, TransferError> {
    let mut digest = RunningDigest::new();
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            SinkCommand::Open(path) => {
                let file = std::fs::File::create(&path)?;
                *out = Some((std::io::BufWriter::new(file), path));
            }
            SinkCommand::Chunk(ciphertext) => {
                let (writer, _) = out
                    .as_mut()
                    .ok_or_else(|| TransferError::Violation("file data before file info".into()))?;
                let plain = cipher.decrypt(&ciphertext)?;
                writer.write_all(&plain)?;
                digest.update(&plain);
            }
            SinkCommand::Finish => {
                if let Some((writer, _)) = out.as_mut() {
                    writer.flush()?;
                }
                *out = None;
                let (digest, written) = digest.finish();
                return Ok(SinkReport { written, digest });
            }
        }
    }
    // Channel closed without Finish: teardown mid-transfer.
    Err(TransferError::Cancelled)
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("protocol violation: {0}")]
    Violation(String),
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    #[error("size mismatch: expected {expected}, got {got}")]
    SizeMismatch { expected: u64, got: u64 },
    #[error("digest mismatch for {0}")]
    DigestMismatch(String),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("transfer worker failed")]
    WorkerFailed,
}
