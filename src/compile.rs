use std::path::{Path, PathBuf};
use std::process::Stdio;

use tempfile::TempDir;

use crate::error::FcosError;

/// Name of the compiled Ignition file inside the scratch directory.
pub const IGNITION_FILE: &str = "ign.json";

const SCRATCH_PREFIX: &str = "fcosctl-";

/// Turns a Butane document into an Ignition file.
///
/// Implementations return [`FcosError::Compilation`] carrying the tool's own
/// diagnostics when the document is rejected, and [`FcosError::Spawn`] when
/// the tool cannot be started at all.
#[allow(async_fn_in_trait)] // trait is internal-only
pub trait Transpiler {
    async fn transpile(&self, source: &Path, output: &Path) -> Result<(), FcosError>;
}

/// Runs `butane` (or the older `fcct`, which takes the same flags) in
/// strict mode.
pub struct Butane {
    binary: String,
}

impl Butane {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Transpiler for Butane {
    async fn transpile(&self, source: &Path, output: &Path) -> Result<(), FcosError> {
        tracing::debug!(binary = %self.binary, source = %source.display(), "compiling config");
        let result = tokio::process::Command::new(&self.binary)
            .args(["-d", ".", "--strict", "--output"])
            .arg(output)
            .arg(source)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| FcosError::Spawn {
                command: self.binary.clone(),
                source,
            })?;

        if !result.status.success() {
            return Err(FcosError::Compilation {
                details: String::from_utf8_lossy(&result.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

/// A compiled Ignition file living in its own scratch directory.
///
/// The scratch directory is removed by [`CompiledConfig::release`] or, at the
/// latest, when the value is dropped.
#[derive(Debug)]
pub struct CompiledConfig {
    path: PathBuf,
    scratch: Option<TempDir>,
}

impl CompiledConfig {
    /// Path of the Ignition file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scratch directory holding the Ignition file, until released.
    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.as_ref().map(TempDir::path)
    }

    /// Remove the scratch directory. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(scratch) = self.scratch.take() {
            let dir = scratch.path().to_path_buf();
            // Best effort: a leftover temp dir is not worth failing the session.
            match scratch.close() {
                Ok(()) => tracing::debug!(dir = %dir.display(), "released scratch directory"),
                Err(e) => tracing::debug!(dir = %dir.display(), "failed to remove scratch directory: {e}"),
            }
        }
    }
}

impl Drop for CompiledConfig {
    fn drop(&mut self) {
        self.release();
    }
}

/// Compile `source` into a fresh scratch directory.
///
/// On failure the scratch directory has already been removed.
pub async fn compile<T: Transpiler>(
    source: &Path,
    transpiler: &T,
) -> Result<CompiledConfig, FcosError> {
    let scratch = tempfile::Builder::new()
        .prefix(SCRATCH_PREFIX)
        .tempdir()
        .map_err(|source| FcosError::ScratchDir { source })?;

    let mut compiled = CompiledConfig {
        path: scratch.path().join(IGNITION_FILE),
        scratch: Some(scratch),
    };

    if let Err(e) = transpiler.transpile(source, &compiled.path).await {
        compiled.release();
        return Err(e);
    }

    tracing::info!(path = %compiled.path.display(), "config compiled");
    Ok(compiled)
}
