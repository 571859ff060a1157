//! One ephemeral VM run: validate the config, compile it, resolve the image,
//! boot it with QEMU, and clean up the compiled config afterwards.
//!
//! Steps run strictly in order and nothing is retried. The VM boots with
//! `-snapshot`, so the cached image is never written to.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::compile::{self, Transpiler};
use crate::error::FcosError;
use crate::image::{self, ImageStore};
use crate::settings::HypervisorSettings;

/// Version token that selects the newest cached image.
pub const LATEST: &str = "latest";

/// Which cached image a session boots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionRequest {
    Latest,
    Exact(String),
}

impl From<&str> for VersionRequest {
    fn from(token: &str) -> Self {
        if token == LATEST {
            VersionRequest::Latest
        } else {
            VersionRequest::Exact(token.to_string())
        }
    }
}

/// How the VM process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmExit {
    Success,
    /// Non-zero exit; `None` when killed by a signal.
    Failed(Option<i32>),
    /// The user interrupted the session and the VM was killed.
    Interrupted,
}

/// Boots an image with a compiled Ignition file attached.
#[allow(async_fn_in_trait)] // trait is internal-only
pub trait Hypervisor {
    async fn launch(&self, image: &Path, ignition: &Path) -> Result<VmExit, FcosError>;
}

/// `qemu-kvm` with the guest console on the invoking terminal.
pub struct Qemu {
    binary: String,
    memory_mb: u64,
    cpu: String,
}

impl Qemu {
    pub fn new(settings: &HypervisorSettings) -> Self {
        Self {
            binary: settings.binary.clone(),
            memory_mb: settings.memory_mb,
            cpu: settings.cpu.clone(),
        }
    }

    pub fn args(&self, image: &Path, ignition: &Path) -> Vec<OsString> {
        let mut drive = OsString::from("if=virtio,file=");
        drive.push(image);
        let mut fw_cfg = OsString::from("name=opt/com.coreos/config,file=");
        fw_cfg.push(ignition);

        vec![
            "-m".into(),
            self.memory_mb.to_string().into(),
            "-cpu".into(),
            self.cpu.clone().into(),
            "-nographic".into(),
            "-snapshot".into(),
            "-drive".into(),
            drive,
            "-fw_cfg".into(),
            fw_cfg,
        ]
    }

    /// Wait for the VM to exit, killing it if `interrupt` completes first.
    async fn supervise(
        &self,
        mut child: tokio::process::Child,
        interrupt: impl Future<Output = ()>,
    ) -> Result<VmExit, FcosError> {
        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| FcosError::Io {
                    context: format!("waiting for {}", self.binary),
                    source: e,
                })?;
                if status.success() {
                    Ok(VmExit::Success)
                } else {
                    tracing::warn!("{} exited with {status}", self.binary);
                    Ok(VmExit::Failed(status.code()))
                }
            }
            _ = interrupt => {
                if let Err(e) = child.kill().await {
                    tracing::debug!("failed to kill {}: {e}", self.binary);
                }
                Ok(VmExit::Interrupted)
            }
        }
    }
}

impl Hypervisor for Qemu {
    async fn launch(&self, image: &Path, ignition: &Path) -> Result<VmExit, FcosError> {
        tracing::debug!(binary = %self.binary, image = %image.display(), "launching VM");
        let child = tokio::process::Command::new(&self.binary)
            .args(self.args(image, ignition))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| FcosError::Spawn {
                command: self.binary.clone(),
                source,
            })?;

        self.supervise(child, async {
            // Without a signal handler the VM simply runs until it exits.
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}

/// Progress notifications emitted while a session runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Compiling,
    Compiled,
    Launching { version: String },
}

pub trait SessionObserver {
    fn on_event(&mut self, event: SessionEvent);
}

impl SessionObserver for () {
    fn on_event(&mut self, _event: SessionEvent) {}
}

/// Outcome of a session that got as far as launching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub version: String,
    pub image: PathBuf,
    pub exit: VmExit,
}

pub struct Session<'a, T, H> {
    store: &'a ImageStore,
    transpiler: &'a T,
    hypervisor: &'a H,
}

impl<'a, T: Transpiler, H: Hypervisor> Session<'a, T, H> {
    pub fn new(store: &'a ImageStore, transpiler: &'a T, hypervisor: &'a H) -> Self {
        Self {
            store,
            transpiler,
            hypervisor,
        }
    }

    pub async fn run<O: SessionObserver>(
        &self,
        config: &Path,
        version: &VersionRequest,
        observer: &mut O,
    ) -> Result<SessionReport, FcosError> {
        // 1. Validate
        validate_config_path(config)?;
        if let VersionRequest::Exact(v) = version {
            image::validate_version(v)?;
        }

        // 2. Compile. From here on the scratch directory is released when
        //    `compiled` goes out of scope, whichever way this returns.
        observer.on_event(SessionEvent::Compiling);
        let mut compiled = compile::compile(config, self.transpiler).await?;
        observer.on_event(SessionEvent::Compiled);

        // 3. Resolve
        let version = resolve_version(self.store, version)?;
        let image = self.store.image_path(&version);
        tracing::info!(%version, image = %image.display(), "resolved image");

        // 4. Launch
        observer.on_event(SessionEvent::Launching {
            version: version.clone(),
        });
        let exit = self.hypervisor.launch(&image, compiled.path()).await;

        // 5. Release
        compiled.release();

        Ok(SessionReport {
            version,
            image,
            exit: exit?,
        })
    }
}

fn validate_config_path(config: &Path) -> Result<(), FcosError> {
    match std::fs::metadata(config) {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) => Err(FcosError::Validation {
            message: format!("config {} is not a file", config.display()),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FcosError::ConfigMissing {
            path: config.to_path_buf(),
        }),
        Err(e) => Err(FcosError::Io {
            context: format!("reading config {}", config.display()),
            source: e,
        }),
    }
}

/// Turn a version request into a concrete version string.
///
/// An exact version is returned as-is; whether the image exists is only
/// discovered when the hypervisor tries to open it.
pub fn resolve_version(store: &ImageStore, request: &VersionRequest) -> Result<String, FcosError> {
    match request {
        VersionRequest::Exact(v) => Ok(v.clone()),
        VersionRequest::Latest => {
            select_latest(store.list_versions()?).ok_or(FcosError::NoImagesAvailable)
        }
    }
}

/// Newest version by plain string ordering.
///
/// This is not version-aware: "9" sorts after "36.20220601.1.0".
pub fn select_latest(versions: Vec<String>) -> Option<String> {
    versions.into_iter().max()
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;

    struct FakeTranspiler {
        calls: Cell<usize>,
        fail: bool,
        output: RefCell<Option<PathBuf>>,
    }

    impl FakeTranspiler {
        fn new() -> Self {
            Self {
                calls: Cell::new(0),
                fail: false,
                output: RefCell::new(None),
            }
        }

        fn failing() -> Self {
            Self {
                calls: Cell::new(0),
                fail: true,
                output: RefCell::new(None),
            }
        }
    }

    impl Transpiler for FakeTranspiler {
        async fn transpile(&self, _source: &Path, output: &Path) -> Result<(), FcosError> {
            self.calls.set(self.calls.get() + 1);
            *self.output.borrow_mut() = Some(output.to_path_buf());
            if self.fail {
                return Err(FcosError::Compilation {
                    details: "error at line 3".into(),
                });
            }
            std::fs::write(output, "{}").unwrap();
            Ok(())
        }
    }

    #[derive(Clone, Copy)]
    enum Outcome {
        Exit(VmExit),
        SpawnFails,
    }

    /// Records what it was asked to boot and whether the Ignition file was
    /// present at that moment.
    struct FakeHypervisor {
        outcome: Outcome,
        launches: RefCell<Vec<(PathBuf, PathBuf, bool)>>,
    }

    impl FakeHypervisor {
        fn new(outcome: Outcome) -> Self {
            Self {
                outcome,
                launches: RefCell::new(Vec::new()),
            }
        }

        fn ignition_dir(&self) -> PathBuf {
            let launches = self.launches.borrow();
            launches[0].1.parent().unwrap().to_path_buf()
        }
    }

    impl Hypervisor for FakeHypervisor {
        async fn launch(&self, image: &Path, ignition: &Path) -> Result<VmExit, FcosError> {
            self.launches.borrow_mut().push((
                image.to_path_buf(),
                ignition.to_path_buf(),
                ignition.is_file(),
            ));
            match self.outcome {
                Outcome::Exit(exit) => Ok(exit),
                Outcome::SpawnFails => Err(FcosError::Spawn {
                    command: "qemu-kvm".into(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
                }),
            }
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Vec<SessionEvent>,
    }

    impl SessionObserver for RecordingObserver {
        fn on_event(&mut self, event: SessionEvent) {
            self.events.push(event);
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: ImageStore,
        config: PathBuf,
    }

    fn fixture(versions: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        std::fs::create_dir(&images).unwrap();
        for v in versions {
            std::fs::write(images.join(image::image_filename(v)), b"").unwrap();
        }
        let config = dir.path().join("config.bu");
        std::fs::write(&config, "variant: fcos\nversion: 1.4.0\n").unwrap();
        Fixture {
            store: ImageStore::new(images),
            config,
            _dir: dir,
        }
    }

    #[test]
    fn version_request_from_token() {
        assert_eq!(VersionRequest::from("latest"), VersionRequest::Latest);
        assert_eq!(
            VersionRequest::from("36.20220601.1.0"),
            VersionRequest::Exact("36.20220601.1.0".into())
        );
    }

    #[test]
    fn latest_is_lexicographic_not_numeric() {
        let versions = vec![
            "35.20220131.3.0".to_string(),
            "36.20220601.1.0".to_string(),
            "9".to_string(),
        ];
        assert_eq!(select_latest(versions), Some("9".to_string()));
    }

    #[test]
    fn latest_of_nothing_is_none() {
        assert_eq!(select_latest(Vec::new()), None);
    }

    #[test]
    fn resolve_latest_from_store() {
        let fx = fixture(&["35.20220131.3.0", "36.20220601.1.0", "9"]);
        let version = resolve_version(&fx.store, &VersionRequest::Latest).unwrap();
        assert_eq!(version, "9");
    }

    #[test]
    fn resolve_latest_in_empty_store_fails() {
        let fx = fixture(&[]);
        let err = resolve_version(&fx.store, &VersionRequest::Latest).unwrap_err();
        assert!(matches!(err, FcosError::NoImagesAvailable));
        assert!(err.is_fatal());
    }

    #[test]
    fn resolve_exact_does_not_check_existence() {
        let fx = fixture(&[]);
        let version =
            resolve_version(&fx.store, &VersionRequest::Exact("37.1".into())).unwrap();
        assert_eq!(version, "37.1");
    }

    #[test]
    fn qemu_args_wire_in_image_and_ignition() {
        let qemu = Qemu::new(&HypervisorSettings::default());
        let args = qemu.args(Path::new("/img/a.qcow2"), Path::new("/tmp/x/ign.json"));
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "-m",
                "2048",
                "-cpu",
                "host",
                "-nographic",
                "-snapshot",
                "-drive",
                "if=virtio,file=/img/a.qcow2",
                "-fw_cfg",
                "name=opt/com.coreos/config,file=/tmp/x/ign.json",
            ]
        );
    }

    #[tokio::test]
    async fn run_boots_latest_image_and_releases_scratch() {
        let fx = fixture(&["35.20220131.3.0", "36.20220601.1.0"]);
        let transpiler = FakeTranspiler::new();
        let hypervisor = FakeHypervisor::new(Outcome::Exit(VmExit::Success));
        let mut observer = RecordingObserver::default();

        let report = Session::new(&fx.store, &transpiler, &hypervisor)
            .run(&fx.config, &VersionRequest::Latest, &mut observer)
            .await
            .unwrap();

        assert_eq!(report.version, "36.20220601.1.0");
        assert_eq!(report.exit, VmExit::Success);
        assert_eq!(report.image, fx.store.image_path("36.20220601.1.0"));

        let launches = hypervisor.launches.borrow();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].0, report.image);
        assert!(launches[0].2, "ignition file must exist during launch");
        drop(launches);
        assert!(!hypervisor.ignition_dir().exists());

        assert_eq!(
            observer.events,
            vec![
                SessionEvent::Compiling,
                SessionEvent::Compiled,
                SessionEvent::Launching {
                    version: "36.20220601.1.0".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn run_exact_version_is_used_literally() {
        let fx = fixture(&["35"]);
        let transpiler = FakeTranspiler::new();
        let hypervisor = FakeHypervisor::new(Outcome::Exit(VmExit::Failed(Some(1))));

        let report = Session::new(&fx.store, &transpiler, &hypervisor)
            .run(&fx.config, &VersionRequest::Exact("99".into()), &mut ())
            .await
            .unwrap();

        assert_eq!(report.version, "99");
        assert_eq!(report.exit, VmExit::Failed(Some(1)));
        assert!(!hypervisor.ignition_dir().exists());
    }

    #[tokio::test]
    async fn run_releases_scratch_when_launch_errors() {
        let fx = fixture(&["35"]);
        let transpiler = FakeTranspiler::new();
        let hypervisor = FakeHypervisor::new(Outcome::SpawnFails);

        let err = Session::new(&fx.store, &transpiler, &hypervisor)
            .run(&fx.config, &VersionRequest::Latest, &mut ())
            .await
            .unwrap_err();

        assert!(matches!(err, FcosError::Spawn { .. }));
        assert!(hypervisor.launches.borrow()[0].2);
        assert!(!hypervisor.ignition_dir().exists());
    }

    #[tokio::test]
    async fn run_missing_config_never_compiles() {
        let fx = fixture(&["35"]);
        let transpiler = FakeTranspiler::new();
        let hypervisor = FakeHypervisor::new(Outcome::Exit(VmExit::Success));
        let missing = fx.config.with_file_name("missing.bu");

        let err = Session::new(&fx.store, &transpiler, &hypervisor)
            .run(&missing, &VersionRequest::Latest, &mut ())
            .await
            .unwrap_err();

        assert!(matches!(err, FcosError::ConfigMissing { .. }));
        assert!(!err.is_fatal());
        assert_eq!(transpiler.calls.get(), 0);
        assert!(hypervisor.launches.borrow().is_empty());
    }

    #[tokio::test]
    async fn run_directory_as_config_is_rejected() {
        let fx = fixture(&["35"]);
        let transpiler = FakeTranspiler::new();
        let hypervisor = FakeHypervisor::new(Outcome::Exit(VmExit::Success));

        let err = Session::new(&fx.store, &transpiler, &hypervisor)
            .run(fx.store.dir(), &VersionRequest::Latest, &mut ())
            .await
            .unwrap_err();

        assert!(matches!(err, FcosError::Validation { .. }));
        assert_eq!(transpiler.calls.get(), 0);
    }

    #[tokio::test]
    async fn run_compile_failure_stops_before_launch() {
        let fx = fixture(&["35"]);
        let transpiler = FakeTranspiler::failing();
        let hypervisor = FakeHypervisor::new(Outcome::Exit(VmExit::Success));

        let err = Session::new(&fx.store, &transpiler, &hypervisor)
            .run(&fx.config, &VersionRequest::Latest, &mut ())
            .await
            .unwrap_err();

        assert!(matches!(err, FcosError::Compilation { .. }));
        assert!(!err.is_fatal());
        assert!(hypervisor.launches.borrow().is_empty());
    }

    #[tokio::test]
    async fn run_empty_cache_fails_before_launch() {
        let fx = fixture(&[]);
        let transpiler = FakeTranspiler::new();
        let hypervisor = FakeHypervisor::new(Outcome::Exit(VmExit::Success));

        let err = Session::new(&fx.store, &transpiler, &hypervisor)
            .run(&fx.config, &VersionRequest::Latest, &mut ())
            .await
            .unwrap_err();

        assert!(matches!(err, FcosError::NoImagesAvailable));
        assert_eq!(transpiler.calls.get(), 1);
        assert!(hypervisor.launches.borrow().is_empty());

        let output = transpiler.output.borrow().clone().unwrap();
        assert!(!output.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn run_rejects_malformed_exact_version_before_compiling() {
        let fx = fixture(&["35"]);
        let transpiler = FakeTranspiler::new();
        let hypervisor = FakeHypervisor::new(Outcome::Exit(VmExit::Success));

        let err = Session::new(&fx.store, &transpiler, &hypervisor)
            .run(&fx.config, &VersionRequest::Exact("../35".into()), &mut ())
            .await
            .unwrap_err();

        assert!(matches!(err, FcosError::InvalidVersion { .. }));
        assert_eq!(transpiler.calls.get(), 0);
    }

    #[cfg(unix)]
    fn spawn(program: &str, args: &[&str]) -> tokio::process::Child {
        tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn supervise_kills_vm_on_interrupt() {
        let qemu = Qemu::new(&HypervisorSettings::default());
        let child = spawn("sleep", &["30"]);
        let started = std::time::Instant::now();

        let exit = qemu.supervise(child, std::future::ready(())).await.unwrap();
        assert_eq!(exit, VmExit::Interrupted);
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn supervise_reports_exit_status() {
        let qemu = Qemu::new(&HypervisorSettings::default());

        let ok = qemu
            .supervise(spawn("sh", &["-c", "exit 0"]), std::future::pending())
            .await
            .unwrap();
        assert_eq!(ok, VmExit::Success);

        let failed = qemu
            .supervise(spawn("sh", &["-c", "exit 4"]), std::future::pending())
            .await
            .unwrap();
        assert_eq!(failed, VmExit::Failed(Some(4)));
    }
}
