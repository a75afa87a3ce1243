use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use super::filename::book_extension;
use crate::error::StorageError;

/// Highest collision suffix tried before giving up.
pub const MAX_COLLISION_SUFFIX: u32 = 1000;

/// `dest` with `_n` inserted before its (possibly compound) extension;
/// `n == 0` is `dest` itself.
pub fn with_suffix(dest: &Path, n: u32) -> PathBuf {
    if n == 0 {
        return dest.to_path_buf();
    }
    let name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let ext = book_extension(dest);
    let stem = &name[..name.len() - ext.len()];
    dest.with_file_name(format!("{}_{}{}", stem, n, ext))
}

/// Whether `candidate` is `dest` or one of its collision-suffixed names.
pub fn is_variant_of(candidate: &Path, dest: &Path) -> bool {
    if candidate == dest {
        return true;
    }
    if candidate.parent() != dest.parent() {
        return false;
    }
    let (Some(name), Some(dest_name)) = (
        candidate.file_name().and_then(|n| n.to_str()),
        dest.file_name().and_then(|n| n.to_str()),
    ) else {
        return false;
    };
    let ext = book_extension(dest);
    let dest_stem = &dest_name[..dest_name.len() - ext.len()];

    name.strip_suffix(ext.as_str())
        .and_then(|rest| rest.strip_prefix(dest_stem))
        .and_then(|rest| rest.strip_prefix('_'))
        .and_then(|digits| digits.parse::<u32>().ok())
        .is_some_and(|n| (1..=MAX_COLLISION_SUFFIX).contains(&n))
}

/// Moves `source` to `dest`, or to the first free suffixed variant of it.
/// Never overwrites an existing file. On failure the source is left where
/// it was and any directories created for the move are removed again.
pub fn move_into_place(source: &Path, dest: &Path) -> Result<PathBuf, StorageError> {
    let parent = dest.parent().unwrap_or(Path::new("."));
    let created = ensure_dirs(parent)?;

    let result = reserve(dest).and_then(|target| match transfer(source, &target) {
        Ok(()) => Ok(target),
        Err(e) => {
            let _ = std::fs::remove_file(&target);
            Err(e)
        }
    });

    if result.is_err() {
        remove_created_dirs(&created);
    }
    result
}

/// Creates missing ancestors of `dir`, returning those it created,
/// outermost first.
fn ensure_dirs(dir: &Path) -> Result<Vec<PathBuf>, StorageError> {
    let missing: Vec<PathBuf> = dir
        .ancestors()
        .take_while(|p| !p.as_os_str().is_empty() && !p.exists())
        .map(Path::to_path_buf)
        .collect();

    let mut created = Vec::new();
    for path in missing.into_iter().rev() {
        match std::fs::create_dir(&path) {
            Ok(()) => created.push(path),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => {
                remove_created_dirs(&created);
                return Err(StorageError::CreateDirectory { path, source: e });
            }
        }
    }
    Ok(created)
}

fn remove_created_dirs(created: &[PathBuf]) {
    for dir in created.iter().rev() {
        if let Err(e) = std::fs::remove_dir(dir) {
            debug!("Leaving directory {}: {}", dir.display(), e);
        }
    }
}

/// Claims the first free name with an exclusive create, so two concurrent
/// moves never pick the same destination.
fn reserve(dest: &Path) -> Result<PathBuf, StorageError> {
    for n in 0..=MAX_COLLISION_SUFFIX {
        let candidate = with_suffix(dest, n);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(StorageError::WriteFile {
                    path: candidate,
                    source: e,
                })
            }
        }
    }
    Err(StorageError::FileExists(dest.to_path_buf()))
}

/// Replaces the reserved placeholder at `target` with `source`. Rename is
/// tried first; across filesystems the file is copied to a hidden sibling
/// and renamed into place before the source is removed.
fn transfer(source: &Path, target: &Path) -> Result<(), StorageError> {
    let move_err = |e: std::io::Error| StorageError::MoveFile {
        from: source.to_path_buf(),
        to: target.to_path_buf(),
        source: e,
    };

    let rename_err = match std::fs::rename(source, target) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    if !source.exists() {
        return Err(move_err(rename_err));
    }
    debug!(
        "Rename {} -> {} failed ({}), copying instead",
        source.display(),
        target.display(),
        rename_err
    );

    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("book");
    let partial = target.with_file_name(format!(".{}.partial", name));

    let copied = std::fs::copy(source, &partial)
        .and_then(|_| std::fs::rename(&partial, target));
    if let Err(e) = copied {
        let _ = std::fs::remove_file(&partial);
        return Err(move_err(e));
    }

    if let Err(e) = std::fs::remove_file(source) {
        warn!(
            "Copied {} but could not remove it, undoing the copy",
            source.display()
        );
        let _ = std::fs::remove_file(target);
        return Err(move_err(e));
    }
    Ok(())
}
