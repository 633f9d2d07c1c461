//! Folder registry.
//!
//! Each child directory of the work directory is a folder; folders are
//! unique by name and keep a list of dependents — live transfers and
//! tasks that must be shut down before the folder's tree can be deleted
//! or cleared. The registry itself only tracks state; cross-subsystem
//! orchestration (shutting dependents down, removing trees) lives in
//! [`crate::state`].

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use taskplane_core::wire::{FOLDER_NAME_MAX, FOLDER_PATH_MAX};
use taskplane_core::{ErrorKind, Result};
use tokio::fs;
use tracing::{error, info};

use crate::fsops::create_dir_0700;

/// A resource that must be shut down before its folder goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependent {
    /// An open file-transfer slot.
    Transfer(u32),
    /// A running task.
    Task(u32),
}

#[derive(Debug)]
struct FolderEntry {
    path: PathBuf,
    deps: Vec<Dependent>,
}

/// Registry of folders under one work directory.
pub struct FolderRegistry {
    workdir: PathBuf,
    folders: RefCell<BTreeMap<String, FolderEntry>>,
}

impl FolderRegistry {
    /// Registry rooted at `workdir`; call [`init`](Self::init) before
    /// use.
    #[must_use]
    pub fn new(workdir: PathBuf) -> Self {
        Self {
            workdir,
            folders: RefCell::new(BTreeMap::new()),
        }
    }

    /// The work directory this registry is rooted at.
    #[must_use]
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Bootstrap the registry from disk.
    ///
    /// Creates the work directory (mode 0700) when missing; otherwise
    /// scans its direct children and registers every directory found.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InputError`] on an over-long or duplicate folder
    /// name, [`ErrorKind::ReactorError`] on filesystem failures.
    pub async fn init(&self) -> Result<()> {
        match fs::metadata(&self.workdir).await {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("creating workdir {}", self.workdir.display());
                return create_dir_0700(&self.workdir).await;
            }
            Err(err) => {
                error!("cannot access workdir {}: {err}", self.workdir.display());
                return Err(ErrorKind::ReactorError);
            }
            Ok(meta) if !meta.is_dir() => {
                error!("workdir {} is not a directory", self.workdir.display());
                return Err(ErrorKind::InputError);
            }
            Ok(_) => {}
        }

        let mut reader = fs::read_dir(&self.workdir).await?;
        while let Some(entry) = reader.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                error!("folder name is not valid UTF-8: {:?}", entry.file_name());
                return Err(ErrorKind::InputError);
            };
            if name.len() >= FOLDER_NAME_MAX {
                error!("folder name '{name}' is too long");
                return Err(ErrorKind::InputError);
            }
            info!("loading folder: {name}");
            let previous = self.folders.borrow_mut().insert(
                name.clone(),
                FolderEntry {
                    path: entry.path(),
                    deps: Vec::new(),
                },
            );
            if previous.is_some() {
                error!("duplicate folder name '{name}'");
                return Err(ErrorKind::InputError);
            }
        }
        Ok(())
    }

    /// Create a folder on disk and register it.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InputError`] when the name is taken or invalid,
    /// [`ErrorKind::ReactorError`] when mkdir fails.
    pub async fn create(&self, name: &str) -> Result<()> {
        if self.folders.borrow().contains_key(name) {
            error!("folder '{name}' already exists");
            return Err(ErrorKind::InputError);
        }
        validate_name(name)?;
        let path = self.workdir.join(name);
        if path.as_os_str().len() >= FOLDER_PATH_MAX {
            error!("folder path '{}' is too long", path.display());
            return Err(ErrorKind::InputError);
        }

        create_dir_0700(&path).await?;
        self.folders.borrow_mut().insert(
            name.to_owned(),
            FolderEntry {
                path: path.clone(),
                deps: Vec::new(),
            },
        );
        info!("created folder '{}'", path.display());
        Ok(())
    }

    /// Whether a folder with this name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.folders.borrow().contains_key(name)
    }

    /// On-disk path of a registered folder.
    #[must_use]
    pub fn path_of(&self, name: &str) -> Option<PathBuf> {
        self.folders.borrow().get(name).map(|f| f.path.clone())
    }

    /// Drop a folder from the registry (the tree is removed elsewhere).
    pub fn remove(&self, name: &str) -> bool {
        self.folders.borrow_mut().remove(name).is_some()
    }

    /// Register a dependent against a folder, if the folder exists.
    pub fn add_dependent(&self, name: &str, dep: Dependent) -> bool {
        let mut folders = self.folders.borrow_mut();
        let Some(entry) = folders.get_mut(name) else {
            return false;
        };
        if !entry.deps.contains(&dep) {
            entry.deps.push(dep);
        }
        true
    }

    /// Unregister a dependent.
    pub fn remove_dependent(&self, name: &str, dep: Dependent) {
        if let Some(entry) = self.folders.borrow_mut().get_mut(name) {
            entry.deps.retain(|d| *d != dep);
        }
    }

    /// Drain a folder's dependents in registration order.
    #[must_use]
    pub fn take_dependents(&self, name: &str) -> Vec<Dependent> {
        self.folders
            .borrow_mut()
            .get_mut(name)
            .map(|entry| std::mem::take(&mut entry.deps))
            .unwrap_or_default()
    }

    /// Folder names in ascending key order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.folders.borrow().keys().cloned().collect()
    }

    /// Number of registered folders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.folders.borrow().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.folders.borrow().is_empty()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        error!("folder name is empty");
        return Err(ErrorKind::InputError);
    }
    if name.contains('/') {
        error!("folder name '{name}' contains '/'");
        return Err(ErrorKind::InputError);
    }
    if name.len() >= FOLDER_NAME_MAX {
        error!("folder name '{name}' is too long");
        return Err(ErrorKind::InputError);
    }
    Ok(())
}
