use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum FcosError {
    #[error("could not determine the home directory")]
    #[diagnostic(code(fcosctl::home))]
    HomeDirectoryUnavailable,

    #[error("failed to read image directory {}", .path.display())]
    #[diagnostic(
        code(fcosctl::image_dir),
        help("pull an image first with `fcosctl image pull`")
    )]
    DirectoryUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stream must be one of stable, testing or next; received '{stream}'")]
    #[diagnostic(code(fcosctl::stream))]
    InvalidStream { stream: String },

    #[error("invalid image version '{version}': {reason}")]
    #[diagnostic(code(fcosctl::version))]
    InvalidVersion { version: String, reason: String },

    #[error("image version {version} not found at {}", .path.display())]
    #[diagnostic(code(fcosctl::image_missing), help("run `fcosctl image list` to see cached versions"))]
    ImageNotFound { version: String, path: PathBuf },

    #[error("failed to delete image {}", .path.display())]
    #[diagnostic(code(fcosctl::image_delete))]
    ImageDelete {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config {} does not exist", .path.display())]
    #[diagnostic(code(fcosctl::config_missing))]
    ConfigMissing { path: PathBuf },

    #[error("failed to compile config:\n{details}")]
    #[diagnostic(code(fcosctl::compile))]
    Compilation { details: String },

    #[error("no images available to run")]
    #[diagnostic(code(fcosctl::no_images))]
    NoImagesAvailable,

    #[error("failed to start {command}")]
    #[diagnostic(code(fcosctl::spawn))]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create scratch directory")]
    #[diagnostic(code(fcosctl::scratch))]
    ScratchDir {
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load settings from {path}")]
    #[diagnostic(code(fcosctl::settings))]
    SettingsLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings from {path}: {message}")]
    #[diagnostic(code(fcosctl::settings))]
    SettingsParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl FcosError {
    /// Faults that break an invariant the tool relies on, rather than
    /// something the user can correct. These abort the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FcosError::Spawn { .. } | FcosError::ScratchDir { .. } | FcosError::NoImagesAvailable
        )
    }
}
