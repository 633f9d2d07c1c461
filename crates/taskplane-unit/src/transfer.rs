//! Multi-part file-transfer engine.
//!
//! A transfer is a slot keyed by the hub-chosen `seq`: opened by
//! `start`, filled by any number of `data` chunks, and finalised by
//! `end`, which verifies the on-disk FNV-1a against the hub's hash. All
//! I/O on one slot runs through the slot's [`SenderFifo`], so chunk
//! writes can never interleave and an abort never races a write.
//!
//! Slots live in an [`AsyncMap`]; the map's destroyer aborts any slot
//! that goes away without a clean end (folder delete, unit shutdown).

use std::cell::{Cell, RefCell};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::rc::Rc;

use taskplane_core::sync::{AsyncDestroy, AsyncMap, SenderFifo};
use taskplane_core::{ErrorKind, Fnv1a, Result};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Chunk size used to re-read a finished file for verification.
const VERIFY_CHUNK: usize = 4 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Open,
    Finished,
    Aborted,
}

/// One in-flight transfer.
pub struct TransferSlot {
    seq: u32,
    folder: String,
    path: PathBuf,
    filesize: u64,
    written: Cell<u64>,
    file: RefCell<Option<fs::File>>,
    fifo: SenderFifo,
    state: Cell<SlotState>,
}

impl TransferSlot {
    fn new(seq: u32, folder: String, path: PathBuf, filesize: u64) -> Self {
        Self {
            seq,
            folder,
            path,
            filesize,
            written: Cell::new(0),
            file: RefCell::new(None),
            fifo: SenderFifo::new(),
            state: Cell::new(SlotState::Open),
        }
    }

    /// Folder this slot writes into.
    #[must_use]
    pub fn folder(&self) -> &str {
        &self.folder
    }

    /// Bytes accepted so far.
    #[must_use]
    pub fn written_bytes(&self) -> u64 {
        self.written.get()
    }

    async fn open(&self) -> Result<()> {
        info!("opening file for transfer {}: {}", self.seq, self.path.display());
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .mode(0o600)
            .open(&self.path)
            .await
            .map_err(|err| {
                error!("open {} failed: {err}", self.path.display());
                ErrorKind::ReactorError
            })?;
        *self.file.borrow_mut() = Some(file);
        Ok(())
    }

    async fn write_chunk(&self, offset: u64, data: &[u8]) -> Result<()> {
        debug!(
            "writing {} bytes at offset {offset} for transfer {}",
            data.len(),
            self.seq
        );
        let mut slot = self.file.borrow_mut();
        let Some(file) = slot.as_mut() else {
            return Err(ErrorKind::InternalError);
        };
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        self.written.set(self.written.get() + data.len() as u64);
        Ok(())
    }

    async fn finish(&self, expected_hash: u32) -> Result<()> {
        // Take the handle out so the file closes on every exit path.
        let Some(mut file) = self.file.borrow_mut().take() else {
            return Err(ErrorKind::InternalError);
        };
        self.state.set(SlotState::Finished);

        if self.written.get() != self.filesize {
            error!(
                "transfer {} incomplete: {} of {} bytes written",
                self.seq,
                self.written.get(),
                self.filesize
            );
            return Err(ErrorKind::InputError);
        }

        file.seek(SeekFrom::Start(0)).await?;
        let mut hasher = Fnv1a::new();
        let mut buf = [0u8; VERIFY_CHUNK];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let actual = hasher.finish();
        if actual != expected_hash {
            error!(
                "transfer {} hash mismatch: expected {expected_hash:08x}, got {actual:08x}",
                self.seq
            );
            return Err(ErrorKind::InputError);
        }
        file.flush().await?;
        info!("transfer {} verified, closing {}", self.seq, self.path.display());
        Ok(())
    }

    async fn abort_inner(&self) {
        if self.state.get() != SlotState::Open {
            return;
        }
        self.state.set(SlotState::Aborted);
        info!("aborting transfer {}: {}", self.seq, self.path.display());
        drop(self.file.borrow_mut().take());
        if let Err(err) = fs::remove_file(&self.path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("unlink {} failed: {err}", self.path.display());
            }
        }
    }
}

impl AsyncDestroy for TransferSlot {
    async fn destroy(&self) {
        self.fifo.run(self.abort_inner()).await;
    }
}

/// Engine owning every transfer slot of the unit.
pub struct TransferEngine {
    workdir: PathBuf,
    slots: Rc<AsyncMap<u32, TransferSlot>>,
}

impl TransferEngine {
    /// Engine rooted at the unit's work directory.
    #[must_use]
    pub fn new(workdir: PathBuf) -> Self {
        Self {
            workdir,
            slots: Rc::new(AsyncMap::new()),
        }
    }

    /// Run the slot map's deferred-destruction driver until cancelled.
    pub fn spawn_destroyer(&self, cancel: CancellationToken) {
        let slots = self.slots.clone();
        tokio::task::spawn_local(async move { slots.run_destroyer(cancel).await });
    }

    /// Open a new transfer slot.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InputError`] on a duplicate `seq` or a file name
    /// containing a path separator; [`ErrorKind::ReactorError`] when the
    /// destination cannot be opened (the slot is rolled back).
    pub async fn start(
        &self,
        seq: u32,
        folder: &str,
        filename: &str,
        filesize: u64,
    ) -> Result<()> {
        if self.slots.contains_key(&seq) {
            error!("transfer {seq} already exists");
            return Err(ErrorKind::InputError);
        }
        if filename.is_empty() || filename.contains('/') {
            error!("bad transfer file name '{filename}'");
            return Err(ErrorKind::InputError);
        }
        let path = self.workdir.join(folder).join(filename);
        let slot = TransferSlot::new(seq, folder.to_owned(), path, filesize);
        let Some(handle) = self.slots.try_insert(seq, slot) else {
            return Err(ErrorKind::InputError);
        };
        let opened = handle.fifo.run(handle.open()).await;
        if opened.is_err() {
            // A slot that never opened must not linger and must not
            // unlink anything on destruction.
            handle.state.set(SlotState::Aborted);
            self.slots.remove(&seq);
        }
        opened
    }

    /// Write one chunk into an open slot.
    ///
    /// Chunks that would run past the declared file size are rejected
    /// before any byte is written or accounted.
    pub async fn data(&self, seq: u32, offset: u64, data: &[u8]) -> Result<()> {
        let Some(handle) = self.slots.get(&seq) else {
            error!("no active transfer {seq}");
            return Err(ErrorKind::InputError);
        };
        let end = offset.checked_add(data.len() as u64);
        if end.is_none_or(|end| end > handle.filesize) {
            error!(
                "transfer {seq}: chunk at {offset}+{} exceeds declared size {}",
                data.len(),
                handle.filesize
            );
            return Err(ErrorKind::InputError);
        }
        handle.fifo.run(handle.write_chunk(offset, data)).await
    }

    /// Verify and close a slot. The slot is removed whether or not
    /// verification succeeds.
    pub async fn end(&self, seq: u32, expected_hash: u32) -> Result<()> {
        let Some(handle) = self.slots.get(&seq) else {
            error!("no active transfer {seq}");
            return Err(ErrorKind::InputError);
        };
        let result = handle.fifo.run(handle.finish(expected_hash)).await;
        self.slots.remove(&seq);
        match &result {
            Ok(()) => info!("transfer {seq} completed successfully"),
            Err(err) => error!("finalising transfer {seq} failed: {err}"),
        }
        result
    }

    /// Abort a slot: close the file, unlink it, drop the slot.
    pub async fn abort(&self, seq: u32) {
        let Some(handle) = self.slots.get(&seq) else {
            return;
        };
        handle.fifo.run(handle.abort_inner()).await;
        self.slots.remove(&seq);
    }

    /// Folder an active slot writes into.
    #[must_use]
    pub fn folder_of(&self, seq: u32) -> Option<String> {
        self.slots.get(&seq).map(|s| s.folder().to_owned())
    }

    /// Number of active slots.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.slots.len()
    }

    /// Abort everything and drain the slot map.
    pub async fn shutdown(&self) {
        let seqs = self.slots.keys();
        info!("shutting down file transfers: {} active", seqs.len());
        for seq in seqs {
            self.abort(seq).await;
        }
        self.slots.shutdown().await;
    }
}
