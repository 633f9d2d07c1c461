//! Unit state wiring and cross-subsystem orchestration.
//!
//! `UnitState` owns the folder registry, the transfer and process
//! engines, the request task group, the reply clock, and the reply
//! scratch arena. Operations that span subsystems live here — most
//! importantly folder delete/clear, which must shut down a folder's
//! dependents before its tree is touched, and the dependent bookkeeping
//! around transfer and task lifecycles.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use taskplane_core::task::TaskSlots;
use taskplane_core::{ErrorKind, MonotonicClock, Result, ScratchArena};
use tracing::{error, info, warn};

use crate::folder::{Dependent, FolderRegistry};
use crate::fsops::{create_dir_0700, remove_tree};
use crate::process::{ProcEngine, ProgressReport};
use crate::transfer::TransferEngine;

/// Scratch capacity for staging encoded replies.
const REPLY_ARENA_CAPACITY: usize = 64 * 1024;

/// Everything one unit process owns.
pub struct UnitState {
    /// Folder registry rooted at the work directory.
    pub folders: FolderRegistry,
    /// File-transfer engine.
    pub transfers: TransferEngine,
    /// Child-process engine.
    pub procs: ProcEngine,
    /// Request-handler task group.
    pub slots: TaskSlots,
    /// Reply timestamp source.
    pub clock: MonotonicClock,
    /// Reply encode scratch.
    pub arena: RefCell<ScratchArena>,
}

impl UnitState {
    /// Fresh state rooted at `workdir`.
    #[must_use]
    pub fn new(workdir: PathBuf) -> Rc<Self> {
        Rc::new(Self {
            folders: FolderRegistry::new(workdir.clone()),
            transfers: TransferEngine::new(workdir.clone()),
            procs: ProcEngine::new(workdir),
            slots: TaskSlots::new(),
            clock: MonotonicClock::new(),
            arena: RefCell::new(ScratchArena::with_capacity(REPLY_ARENA_CAPACITY)),
        })
    }

    /// Bootstrap the work directory and start the destruction drivers.
    ///
    /// # Errors
    ///
    /// Propagates the folder scan failure; startup treats it as fatal.
    pub async fn bootstrap(&self) -> Result<()> {
        self.folders.init().await?;
        let stop = self.slots.stop_token();
        self.transfers.spawn_destroyer(stop.clone());
        self.procs.spawn_destroyer(stop);
        Ok(())
    }

    // -----------------------------------------------------------------
    // File transfers (with dependent bookkeeping)
    // -----------------------------------------------------------------

    /// Open a transfer and register it as a dependent of its folder.
    pub async fn transfer_start(
        &self,
        seq: u32,
        folder: &str,
        filename: &str,
        filesize: u64,
    ) -> Result<()> {
        self.transfers.start(seq, folder, filename, filesize).await?;
        self.folders.add_dependent(folder, Dependent::Transfer(seq));
        Ok(())
    }

    /// Write one transfer chunk.
    pub async fn transfer_data(&self, seq: u32, offset: u64, data: &[u8]) -> Result<()> {
        self.transfers.data(seq, offset, data).await
    }

    /// Finalise a transfer and unregister its dependent entry.
    pub async fn transfer_end(&self, seq: u32, expected_hash: u32) -> Result<()> {
        let folder = self.transfers.folder_of(seq);
        let result = self.transfers.end(seq, expected_hash).await;
        if let Some(folder) = folder {
            self.folders
                .remove_dependent(&folder, Dependent::Transfer(seq));
        }
        result
    }

    // -----------------------------------------------------------------
    // Tasks (with dependent bookkeeping)
    // -----------------------------------------------------------------

    /// Start a task and register it as a dependent of its folder.
    pub async fn task_start(&self, task_id: u32, folder: &str, args: &[String]) -> Result<()> {
        self.procs.start(task_id, folder, args).await?;
        self.folders.add_dependent(folder, Dependent::Task(task_id));
        Ok(())
    }

    /// Observe one task event; retiring observations release the
    /// dependent entry.
    pub async fn task_progress(&self, task_id: u32) -> Result<ProgressReport> {
        let folder = self.procs.folder_of(task_id);
        let report = self.procs.progress(task_id).await?;
        if report.finished {
            if let Some(folder) = folder {
                self.folders
                    .remove_dependent(&folder, Dependent::Task(task_id));
            }
        }
        Ok(report)
    }

    /// Cancel a task and release its dependent entry.
    pub async fn task_cancel(&self, task_id: u32) -> Result<()> {
        let folder = self.procs.folder_of(task_id);
        self.procs.cancel(task_id).await?;
        if let Some(folder) = folder {
            self.folders
                .remove_dependent(&folder, Dependent::Task(task_id));
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Folder operations
    // -----------------------------------------------------------------

    /// Delete a folder: dependents down first, then the tree, then the
    /// registry entry.
    pub async fn folder_delete(&self, name: &str) -> Result<()> {
        let Some(path) = self.folders.path_of(name) else {
            error!("folder '{name}' does not exist");
            return Err(ErrorKind::InputError);
        };
        self.shutdown_dependents(name).await;
        remove_tree(&path).await?;
        self.folders.remove(name);
        info!("deleted folder '{name}'");
        Ok(())
    }

    /// Clear a folder: dependents down, tree removed and recreated.
    pub async fn folder_clear(&self, name: &str) -> Result<()> {
        let Some(path) = self.folders.path_of(name) else {
            error!("folder '{name}' does not exist");
            return Err(ErrorKind::InputError);
        };
        self.shutdown_dependents(name).await;
        remove_tree(&path).await?;
        create_dir_0700(&path).await?;
        info!("cleared folder '{name}'");
        Ok(())
    }

    async fn shutdown_dependents(&self, name: &str) {
        for dep in self.folders.take_dependents(name) {
            match dep {
                Dependent::Transfer(seq) => {
                    info!("folder '{name}': aborting dependent transfer {seq}");
                    self.transfers.abort(seq).await;
                }
                Dependent::Task(task_id) => {
                    info!("folder '{name}': cancelling dependent task {task_id}");
                    if let Err(err) = self.procs.cancel(task_id).await {
                        warn!("cancelling task {task_id} failed: {err}");
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------

    /// Graceful teardown: request handlers, then transfers, then tasks.
    pub async fn shutdown(&self) {
        info!("shutting down unit state");
        self.slots.shutdown().await;
        self.transfers.shutdown().await;
        self.procs.shutdown().await;
        info!("unit state shut down");
    }
}
