//! Bounded recursive tree removal.
//!
//! Folder delete and clear remove whole directory trees. The walk is
//! iterative with an explicit stack of open directory iterators, so a
//! hostile or accidental deep nesting cannot blow the call stack: depth
//! beyond [`REMOVE_TREE_MAX_DEPTH`] aborts the operation instead.

use std::io;
use std::path::{Path, PathBuf};

use taskplane_core::{ErrorKind, Result};
use tokio::fs;
use tracing::{debug, error};

/// Maximum directory nesting a removal will traverse.
pub const REMOVE_TREE_MAX_DEPTH: usize = 32;

enum Step {
    Descend(PathBuf),
    Unlink(PathBuf),
    Ascend,
}

/// Remove `root` and everything beneath it.
///
/// A missing root is a no-op. Symlinks are unlinked, never followed.
///
/// # Errors
///
/// [`ErrorKind::ReactorError`] on any filesystem failure or when the
/// tree is deeper than [`REMOVE_TREE_MAX_DEPTH`].
pub async fn remove_tree(root: &Path) -> Result<()> {
    match fs::symlink_metadata(root).await {
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            error!("cannot stat {}: {err}", root.display());
            return Err(ErrorKind::ReactorError);
        }
        Ok(meta) if !meta.is_dir() => {
            fs::remove_file(root).await?;
            return Ok(());
        }
        Ok(_) => {}
    }

    let mut stack = vec![(root.to_path_buf(), fs::read_dir(root).await?)];
    loop {
        let step = {
            let Some((_, reader)) = stack.last_mut() else {
                break;
            };
            match reader.next_entry().await? {
                Some(entry) => {
                    let file_type = entry.file_type().await?;
                    if file_type.is_dir() {
                        Step::Descend(entry.path())
                    } else {
                        Step::Unlink(entry.path())
                    }
                }
                None => Step::Ascend,
            }
        };
        match step {
            Step::Descend(path) => {
                if stack.len() >= REMOVE_TREE_MAX_DEPTH {
                    error!(
                        "directory nesting exceeds {REMOVE_TREE_MAX_DEPTH} at {}",
                        path.display()
                    );
                    return Err(ErrorKind::ReactorError);
                }
                let reader = fs::read_dir(&path).await?;
                stack.push((path, reader));
            }
            Step::Unlink(path) => {
                debug!("unlink {}", path.display());
                fs::remove_file(&path).await?;
            }
            Step::Ascend => {
                let (dir, reader) = stack.pop().expect("stack checked non-empty");
                drop(reader);
                debug!("rmdir {}", dir.display());
                fs::remove_dir(&dir).await?;
            }
        }
    }
    Ok(())
}

/// Create a directory with mode 0700, the mode every workspace uses.
pub async fn create_dir_0700(path: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.mode(0o700);
    builder.create(path).await.map_err(|err| {
        error!("mkdir {} failed: {err}", path.display());
        ErrorKind::ReactorError
    })
}
