use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;

use crate::error::FcosError;
use crate::paths;

/// Every cached image is named `IMAGE_PREFIX + <version> + IMAGE_SUFFIX`,
/// matching what `coreos-installer download` writes.
pub const IMAGE_PREFIX: &str = "fedora-coreos-";
pub const IMAGE_SUFFIX: &str = "-qemu.x86_64.qcow2";

/// Release stream an image is downloaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stable,
    Testing,
    Next,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Stable => "stable",
            Stream::Testing => "testing",
            Stream::Next => "next",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stream {
    type Err = FcosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stable" => Ok(Stream::Stable),
            "testing" => Ok(Stream::Testing),
            "next" => Ok(Stream::Next),
            other => Err(FcosError::InvalidStream {
                stream: other.to_string(),
            }),
        }
    }
}

/// Cache filename for a version.
pub fn image_filename(version: &str) -> String {
    format!("{IMAGE_PREFIX}{version}{IMAGE_SUFFIX}")
}

/// Extract the version from a cache filename, if it follows the convention.
pub fn version_from_filename(name: &str) -> Option<&str> {
    name.strip_prefix(IMAGE_PREFIX)?.strip_suffix(IMAGE_SUFFIX)
}

/// Reject version tokens that cannot name exactly one cache file.
pub fn validate_version(version: &str) -> Result<(), FcosError> {
    let reason = if version.is_empty() {
        "version must not be empty"
    } else if version.contains('/') {
        "version must not contain '/'"
    } else if version.contains(IMAGE_PREFIX) || version.contains(IMAGE_SUFFIX) {
        "pass the bare version, not the image filename"
    } else {
        return Ok(());
    };
    Err(FcosError::InvalidVersion {
        version: version.to_string(),
        reason: reason.into(),
    })
}

/// Fetches an image for a stream into a directory.
#[allow(async_fn_in_trait)] // trait is internal-only
pub trait Downloader {
    async fn download(&self, stream: Stream, dir: &Path) -> Result<(), FcosError>;
}

/// Downloads via `coreos-installer download`, streaming its output through.
pub struct CoreosInstaller {
    binary: String,
}

impl CoreosInstaller {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Downloader for CoreosInstaller {
    async fn download(&self, stream: Stream, dir: &Path) -> Result<(), FcosError> {
        tracing::debug!(binary = %self.binary, %stream, dir = %dir.display(), "running download");
        let status = tokio::process::Command::new(&self.binary)
            .args(["download", "-s", stream.as_str()])
            .args(["-p", "qemu", "-f", "qcow2.xz", "--decompress", "-C"])
            .arg(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|source| FcosError::Spawn {
                command: self.binary.clone(),
                source,
            })?;

        // The installer reports its own failures on stderr.
        if !status.success() {
            tracing::warn!(%status, "{} exited unsuccessfully", self.binary);
        }
        Ok(())
    }
}

/// Directory of cached images. The filesystem is the only source of truth;
/// nothing is remembered between calls.
#[derive(Debug, Clone)]
pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    /// Store rooted at the user's image cache directory.
    pub fn open() -> Result<Self, FcosError> {
        Ok(Self::new(paths::image_dir()?))
    }

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path an image of `version` would have. Does not check that it exists.
    pub fn image_path(&self, version: &str) -> PathBuf {
        self.dir.join(image_filename(version))
    }

    /// Versions of all cached images, in directory enumeration order.
    pub fn list_versions(&self) -> Result<Vec<String>, FcosError> {
        let unreadable = |source| FcosError::DirectoryUnreadable {
            path: self.dir.clone(),
            source,
        };

        let mut versions = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(unreadable)? {
            let entry = entry.map_err(unreadable)?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            // Only versions that `delete` and `run --version` accept.
            match version_from_filename(name) {
                Some(version) if validate_version(version).is_ok() => {
                    versions.push(version.to_string())
                }
                _ => {}
            }
        }

        tracing::debug!(dir = %self.dir.display(), count = versions.len(), "listed images");
        Ok(versions)
    }

    /// Download the latest image of `stream` into the cache directory.
    ///
    /// Stream names are validated when parsed into a [`Stream`], so nothing
    /// reaches the downloader unchecked. Whether the download actually
    /// produced an image is left to the downloader's own output.
    pub async fn pull<D: Downloader>(&self, stream: Stream, downloader: &D) -> Result<(), FcosError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| FcosError::Io {
            context: format!("creating image directory {}", self.dir.display()),
            source: e,
        })?;

        tracing::info!(%stream, dir = %self.dir.display(), "pulling image");
        downloader.download(stream, &self.dir).await
    }

    /// Delete the cached image for exactly `version`.
    pub fn delete(&self, version: &str) -> Result<PathBuf, FcosError> {
        validate_version(version)?;
        let path = self.image_path(version);

        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(path = %path.display(), "deleted image");
                Ok(path)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FcosError::ImageNotFound {
                version: version.to_string(),
                path,
            }),
            Err(source) => Err(FcosError::ImageDelete { path, source }),
        }
    }
}
