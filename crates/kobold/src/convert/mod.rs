//! EPUB to KEPUB conversion through an external converter binary.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use thiserror::Error;

use crate::metadata::file_stem;
use crate::watcher::filter::CONVERTED_SUFFIX;

const WAIT_STEP: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("failed to run '{binary}': {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("converter exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("converter did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("converter produced no output at '{0}'")]
    MissingOutput(PathBuf),

    #[error("converter output '{path}' is invalid: {reason}")]
    InvalidOutput { path: PathBuf, reason: String },

    #[error("I/O error during conversion: {0}")]
    Io(#[from] std::io::Error),
}

pub trait Converter: Send + Sync {
    /// Converts `source` and returns the path of the converted file. The
    /// source itself is never modified.
    fn convert(&self, source: &Path) -> Result<PathBuf, ConvertError>;
}

/// Runs `kepubify -o <dir> <file>`, which writes `<stem>.kepub.epub` next
/// to the source.
pub struct KepubifyConverter {
    binary: PathBuf,
    timeout: Duration,
}

impl KepubifyConverter {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

impl Converter for KepubifyConverter {
    fn convert(&self, source: &Path) -> Result<PathBuf, ConvertError> {
        let out_dir = source.parent().unwrap_or(Path::new("."));
        let expected = converted_path(source);

        let mut child = Command::new(&self.binary)
            .arg("-o")
            .arg(out_dir)
            .arg(source)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ConvertError::Spawn {
                binary: self.binary.clone(),
                source: e,
            })?;

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                warn!(
                    "Converter exceeded {:?} on {}, killing it",
                    self.timeout,
                    source.display()
                );
                let _ = child.kill();
                let _ = child.wait();
                let _ = std::fs::remove_file(&expected);
                return Err(ConvertError::TimedOut(self.timeout));
            }
            thread::sleep(WAIT_STEP);
        };

        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            return Err(ConvertError::Failed {
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        debug!("Converted {} -> {}", source.display(), expected.display());
        Ok(expected)
    }
}

/// Where the converter writes its output for `source`.
pub fn converted_path(source: &Path) -> PathBuf {
    let stem = file_stem(source).unwrap_or_else(|| "book".to_string());
    source.with_file_name(format!("{}{}", stem, CONVERTED_SUFFIX))
}

/// Whether the source format goes through conversion at all. Only plain
/// EPUBs do; KEPUBs and PDFs are already in their final format.
pub fn needs_conversion(source: &Path) -> bool {
    let Some(name) = source.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".epub") && !lower.ends_with(CONVERTED_SUFFIX)
}

/// Checks converter output before anything destructive happens: it must
/// exist, be non-empty and start with the ZIP signature.
pub fn verify_conversion(path: &Path) -> Result<(), ConvertError> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConvertError::MissingOutput(path.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };

    let mut magic = [0u8; 2];
    let read = file.read(&mut magic)?;
    if read == 0 {
        return Err(ConvertError::InvalidOutput {
            path: path.to_path_buf(),
            reason: "file is empty".to_string(),
        });
    }
    if read < 2 || &magic != b"PK" {
        return Err(ConvertError::InvalidOutput {
            path: path.to_path_buf(),
            reason: "missing ZIP signature".to_string(),
        });
    }
    Ok(())
}
