//! File staging: validate and materialise the input, finalize the output.
//!
//! Every pipeline invocation owns one [`ScopedWorkspace`] (a `TempDir`), so
//! concurrent invocations never share intermediate files. The finalized
//! artifact is moved out with [`ScopedWorkspace::finalize`] *before*
//! [`cleanup`] consumes the workspace; because `cleanup` takes the workspace
//! by value, the move can never race the recursive delete.

use crate::error::DocConvError;
use crate::output::{bytes_to_mb, InputDiagnostics};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Staged input artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDescriptor {
    pub filename: String,
    pub size: u64,
    /// Lowercase extension without the dot; empty when absent. Used for
    /// routing only, never for content-type decisions.
    pub extension: String,
    /// Location inside the scoped workspace; empty until materialised.
    pub path: PathBuf,
}

impl InputDescriptor {
    /// File stem used to name fragments and outputs.
    pub fn stem(&self) -> String {
        Path::new(&self.filename)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "document".to_string())
    }

    pub fn diagnostics(&self) -> InputDiagnostics {
        InputDiagnostics {
            filename: self.filename.clone(),
            file_size: self.size,
            size_mb: bytes_to_mb(self.size),
            extension: self.extension.clone(),
        }
    }
}

/// Where the input bytes come from.
#[derive(Debug, Clone)]
pub enum InputSource {
    /// Raw bytes already in memory.
    Bytes(Vec<u8>),
    /// A file already on disk; it is copied into the workspace.
    Path(PathBuf),
}

/// Validate name and size and derive the extension.
///
/// Fails with `InvalidInput` if `size` is zero or exceeds `max_size`.
pub fn stage(name: &str, size: u64, max_size: u64) -> Result<InputDescriptor, DocConvError> {
    let filename = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty() && n != "..")
        .ok_or_else(|| DocConvError::invalid_input(format!("'{name}' is not a valid file name")))?;

    if size == 0 {
        return Err(DocConvError::invalid_input("Input file is empty"));
    }
    if size > max_size {
        return Err(DocConvError::invalid_input(format!(
            "Input file too large: {}MB (max {}MB)",
            bytes_to_mb(size),
            bytes_to_mb(max_size)
        )));
    }

    let extension = Path::new(&filename)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    Ok(InputDescriptor {
        filename,
        size,
        extension,
        path: PathBuf::new(),
    })
}

/// Working directory exclusively owned by one pipeline invocation.
#[derive(Debug)]
pub struct ScopedWorkspace {
    dir: TempDir,
}

impl ScopedWorkspace {
    /// Create a fresh scoped directory under `root` (or the system temp dir).
    pub fn create(root: Option<&Path>) -> Result<Self, DocConvError> {
        let builder_result = match root {
            Some(root) => {
                std::fs::create_dir_all(root).map_err(|e| DocConvError::OutputWriteFailed {
                    path: root.to_path_buf(),
                    source: e,
                })?;
                tempfile::Builder::new().prefix("docconv-").tempdir_in(root)
            }
            None => tempfile::Builder::new().prefix("docconv-").tempdir(),
        };
        let dir = builder_result
            .map_err(|e| DocConvError::Internal(format!("Failed to create working directory: {e}")))?;
        info!("Created working directory: {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write the input into the workspace and record its staged path.
    pub async fn materialize(
        &self,
        descriptor: &mut InputDescriptor,
        source: &InputSource,
    ) -> Result<(), DocConvError> {
        let target = self.dir.path().join(&descriptor.filename);
        let write_err = |e: std::io::Error| DocConvError::OutputWriteFailed {
            path: target.clone(),
            source: e,
        };
        match source {
            InputSource::Bytes(bytes) => tokio::fs::write(&target, bytes).await.map_err(write_err)?,
            InputSource::Path(src) => {
                tokio::fs::copy(src, &target).await.map_err(write_err)?;
            }
        }
        debug!("Staged input at {}", target.display());
        descriptor.path = target;
        Ok(())
    }

    /// Move `temp_output` into `output_dir` under a collision-free name.
    ///
    /// The name is `<stem>_<8 hex chars>.<ext>` derived from `desired_name`.
    /// Falls back to copy + remove when a rename crosses file systems.
    pub async fn finalize(
        &self,
        temp_output: &Path,
        desired_name: &str,
        output_dir: &Path,
    ) -> Result<PathBuf, DocConvError> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| DocConvError::OutputWriteFailed {
                path: output_dir.to_path_buf(),
                source: e,
            })?;

        let permanent = output_dir.join(unique_name(desired_name));
        if let Err(rename_err) = tokio::fs::rename(temp_output, &permanent).await {
            debug!("rename failed ({rename_err}), copying across file systems");
            tokio::fs::copy(temp_output, &permanent)
                .await
                .map_err(|e| DocConvError::OutputWriteFailed {
                    path: permanent.clone(),
                    source: e,
                })?;
            if let Err(e) = tokio::fs::remove_file(temp_output).await {
                warn!("Could not remove {} after copy: {e}", temp_output.display());
            }
        }
        info!("Moved output file to permanent location: {}", permanent.display());
        Ok(permanent)
    }
}

fn unique_name(desired_name: &str) -> String {
    let path = Path::new(desired_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
    match path.extension() {
        Some(ext) => format!("{stem}_{suffix}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{suffix}"),
    }
}

/// Recursively remove the scoped workspace. Best-effort: failures are logged.
pub fn cleanup(workspace: ScopedWorkspace) {
    let path = workspace.path().to_path_buf();
    match workspace.dir.close() {
        Ok(()) => info!("Cleaned up working directory: {}", path.display()),
        Err(e) => warn!("Failed to clean up working directory {}: {e}", path.display()),
    }
}
