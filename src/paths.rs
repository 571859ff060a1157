use std::path::{Path, PathBuf};

use crate::error::FcosError;

/// Image cache directory relative to the home directory.
const IMAGE_DIR: &str = ".local/share/libvirt/images";

/// Image cache directory: `~/.local/share/libvirt/images/`
pub fn image_dir() -> Result<PathBuf, FcosError> {
    dirs::home_dir()
        .map(|home| image_dir_in(&home))
        .ok_or(FcosError::HomeDirectoryUnavailable)
}

/// Image cache directory under an explicit home directory.
pub fn image_dir_in(home: &Path) -> PathBuf {
    home.join(IMAGE_DIR)
}

/// Default settings file: `~/.config/fcosctl/settings.toml`
pub fn settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("fcosctl").join("settings.toml"))
}
