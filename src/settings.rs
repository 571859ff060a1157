use std::path::Path;

use facet::Facet;

use crate::error::FcosError;
use crate::paths;

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct Settings {
    #[facet(default)]
    pub hypervisor: HypervisorSettings,
    #[facet(default)]
    pub transpiler: TranspilerSettings,
    #[facet(default)]
    pub installer: InstallerSettings,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct HypervisorSettings {
    #[facet(default = "qemu-kvm")]
    pub binary: String,
    #[facet(default = 2048)]
    pub memory_mb: u64,
    #[facet(default = "host")]
    pub cpu: String,
}

impl Default for HypervisorSettings {
    fn default() -> Self {
        Self {
            binary: "qemu-kvm".into(),
            memory_mb: 2048,
            cpu: "host".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct TranspilerSettings {
    #[facet(default = "butane")]
    pub binary: String,
}

impl Default for TranspilerSettings {
    fn default() -> Self {
        Self {
            binary: "butane".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct InstallerSettings {
    #[facet(default = "coreos-installer")]
    pub binary: String,
}

impl Default for InstallerSettings {
    fn default() -> Self {
        Self {
            binary: "coreos-installer".into(),
        }
    }
}

/// Load settings from an explicit path, or from the default location.
///
/// A missing file at the default location is not an error; the built-in
/// defaults are used instead. An explicitly requested file must exist.
pub fn load_settings(explicit: Option<&Path>) -> Result<Settings, FcosError> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => match paths::settings_path() {
            Some(p) if p.exists() => p,
            _ => {
                tracing::debug!("no settings file, using defaults");
                return Ok(Settings::default());
            }
        },
    };

    let contents = std::fs::read_to_string(&path).map_err(|source| FcosError::SettingsLoad {
        path: path.display().to_string(),
        source,
    })?;

    let settings = parse_settings(&contents, &path.display().to_string())?;
    tracing::debug!(path = %path.display(), "loaded settings");
    Ok(settings)
}

pub fn parse_settings(contents: &str, origin: &str) -> Result<Settings, FcosError> {
    let settings: Settings =
        facet_toml::from_str(contents).map_err(|e| FcosError::SettingsParse {
            path: origin.to_string(),
            message: e.to_string(),
        })?;
    validate_settings(&settings)?;
    Ok(settings)
}

fn validate_settings(settings: &Settings) -> Result<(), FcosError> {
    if settings.hypervisor.memory_mb == 0 {
        return Err(FcosError::Validation {
            message: "hypervisor.memory_mb must be greater than 0".into(),
        });
    }
    for (key, value) in [
        ("hypervisor.binary", &settings.hypervisor.binary),
        ("hypervisor.cpu", &settings.hypervisor.cpu),
        ("transpiler.binary", &settings.transpiler.binary),
        ("installer.binary", &settings.installer.binary),
    ] {
        if value.trim().is_empty() {
            return Err(FcosError::Validation {
                message: format!("{key} must not be empty"),
            });
        }
    }
    Ok(())
}
