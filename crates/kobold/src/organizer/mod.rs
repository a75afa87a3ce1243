//! Library organization: renders a job's destination from the template and
//! moves the file (and its converted companion) there.

pub mod filename;
pub mod mover;
pub mod template;

use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use thiserror::Error;

use crate::error::StorageError;
use crate::jobs::{content_hash, Job};
use crate::pipeline::PipelineWarning;
use crate::watcher::filter::CONVERTED_SUFFIX;

pub use mover::{is_variant_of, move_into_place, with_suffix, MAX_COLLISION_SUFFIX};
pub use template::{Field, PathTemplate};

#[derive(Error, Debug)]
pub enum OrganizeError {
    #[error("source file '{0}' no longer exists")]
    SourceMissing(PathBuf),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Organized {
    pub path: PathBuf,
    pub kepub_path: Option<PathBuf>,
    pub warnings: Vec<PipelineWarning>,
    /// The library already held identical content at `path`; the job's own
    /// copy was deleted instead of being moved.
    pub duplicate: bool,
}

impl Organized {
    fn unchanged(path: PathBuf, job: &Job) -> Self {
        Self {
            path,
            kepub_path: job.kepub_path.clone(),
            warnings: Vec::new(),
            duplicate: false,
        }
    }
}

pub struct Organizer {
    library_root: PathBuf,
    template: PathTemplate,
}

impl Organizer {
    pub fn new(library_root: impl Into<PathBuf>, template: PathTemplate) -> Self {
        Self {
            library_root: library_root.into(),
            template,
        }
    }

    pub fn library_root(&self) -> &Path {
        &self.library_root
    }

    /// Absolute destination for the job, before collision handling.
    pub fn destination(&self, job: &Job) -> PathBuf {
        let meta = job.metadata.clone().unwrap_or_default();
        self.library_root
            .join(self.template.render(&meta, &job.source_path))
    }

    pub fn organize(&self, job: &Job) -> Result<Organized, OrganizeError> {
        let source = &job.source_path;
        let dest = self.destination(job);

        if !source.exists() {
            // A previous run may have moved the file and crashed before
            // committing; the destination holding the job's content is then
            // the job's file.
            return match identical_variant(&dest, &job.content_hash) {
                Some(path) => {
                    info!(
                        "Source of job {} already moved to {}, adopting it",
                        job.id,
                        path.display()
                    );
                    Ok(Organized::unchanged(path, job))
                }
                None => Err(OrganizeError::SourceMissing(source.clone())),
            };
        }

        if already_in_place(source, &dest) {
            debug!("{} is already organized", source.display());
            return Ok(Organized::unchanged(source.clone(), job));
        }

        if let Some(existing) = identical_variant(&dest, &job.content_hash) {
            return self.drop_duplicate(job, existing);
        }

        let path = move_into_place(source, &dest)?;
        info!("Organized {} -> {}", source.display(), path.display());

        let mut warnings = Vec::new();
        let kepub_path = match job.kepub_path.as_deref().filter(|k| k.exists()) {
            Some(kepub) => match move_companion(kepub, &path) {
                Ok(moved) => Some(moved),
                Err(e) => {
                    warn!("Could not move companion {}: {}", kepub.display(), e);
                    warnings.push(PipelineWarning::CompanionMoveFailed {
                        path: kepub.to_path_buf(),
                        error: e.to_string(),
                    });
                    Some(kepub.to_path_buf())
                }
            },
            None => job.kepub_path.clone(),
        };

        Ok(Organized {
            path,
            kepub_path,
            warnings,
            duplicate: false,
        })
    }

    /// The library already has this exact book: delete the incoming copy
    /// and its companion rather than filing a second one.
    fn drop_duplicate(&self, job: &Job, existing: PathBuf) -> Result<Organized, OrganizeError> {
        let source = &job.source_path;
        std::fs::remove_file(source).map_err(|e| StorageError::RemoveFile {
            path: source.clone(),
            source: e,
        })?;
        info!(
            "{} duplicates {}, deleted the redundant copy",
            source.display(),
            existing.display()
        );

        let mut warnings = Vec::new();
        if let Some(kepub) = job.kepub_path.as_deref().filter(|k| k.exists()) {
            if let Err(e) = std::fs::remove_file(kepub) {
                warn!("Could not remove duplicate companion {}: {}", kepub.display(), e);
                warnings.push(PipelineWarning::CompanionMoveFailed {
                    path: kepub.to_path_buf(),
                    error: e.to_string(),
                });
            }
        }

        Ok(Organized {
            path: existing,
            kepub_path: None,
            warnings,
            duplicate: true,
        })
    }
}

/// `dest` or the first of its suffixed names that holds content `hash`.
fn identical_variant(dest: &Path, hash: &str) -> Option<PathBuf> {
    (0..=MAX_COLLISION_SUFFIX)
        .map(|n| with_suffix(dest, n))
        .take_while(|candidate| candidate.exists())
        .find(|candidate| content_hash(candidate).is_ok_and(|h| h == hash))
}

fn already_in_place(source: &Path, dest: &Path) -> bool {
    if is_variant_of(source, dest) {
        return true;
    }
    match (source.canonicalize(), dest.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// The companion keeps the organized file's stem so the pair stays together.
fn move_companion(kepub: &Path, organized: &Path) -> Result<PathBuf, StorageError> {
    let stem = filename::book_extension(organized);
    let name = organized
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n[..n.len() - stem.len()].to_string())
        .unwrap_or_else(|| "book".to_string());
    let dest = organized.with_file_name(format!("{}{}", name, CONVERTED_SUFFIX));
    move_into_place(kepub, &dest)
}
