//! Command handlers. These are the only place that talks to the user; the
//! components they drive return errors and never print.

use std::path::Path;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

use crate::cli::{Cli, Command, ImageCommand};
use crate::compile::Butane;
use crate::error::FcosError;
use crate::image::{CoreosInstaller, ImageStore, Stream};
use crate::output::Printer;
use crate::session::{Qemu, Session, SessionEvent, SessionObserver, VersionRequest, VmExit};
use crate::settings::{self, Settings};

pub async fn dispatch(cli: Cli, printer: &Printer) -> Result<(), FcosError> {
    match cli.command {
        Command::Image { action } => match action {
            ImageCommand::List => image_list(printer),
            ImageCommand::Pull { stream } => {
                let settings = settings::load_settings(cli.settings.as_deref())?;
                image_pull(printer, &settings, &stream).await
            }
            ImageCommand::Delete { version } => image_delete(printer, &version),
        },
        Command::Run { config, version } => {
            let settings = settings::load_settings(cli.settings.as_deref())?;
            run(printer, &settings, &config, &version).await
        }
    }
}

pub fn image_list(printer: &Printer) -> Result<(), FcosError> {
    let store = ImageStore::open()?;
    let versions = store.list_versions()?;
    if versions.is_empty() {
        printer.info("No cached images.");
        return Ok(());
    }
    for version in &versions {
        printer.bullet(version);
    }
    Ok(())
}

pub async fn image_pull(printer: &Printer, settings: &Settings, stream: &str) -> Result<(), FcosError> {
    let stream: Stream = stream.parse()?;
    let store = ImageStore::open()?;
    let installer = CoreosInstaller::new(&settings.installer.binary);

    printer.info(format_args!("Pulling latest image from stream {stream}"));
    store.pull(stream, &installer).await
}

pub fn image_delete(printer: &Printer, version: &str) -> Result<(), FcosError> {
    let store = ImageStore::open()?;
    store.delete(version)?;
    printer.info(format_args!("\u{2705} Version {version} deleted"));
    Ok(())
}

pub async fn run(
    printer: &Printer,
    settings: &Settings,
    config: &Path,
    version: &str,
) -> Result<(), FcosError> {
    let store = ImageStore::open()?;
    let transpiler = Butane::new(&settings.transpiler.binary);
    let hypervisor = Qemu::new(&settings.hypervisor);
    let mut observer = TerminalObserver::new(printer);

    let report = Session::new(&store, &transpiler, &hypervisor)
        .run(config, &VersionRequest::from(version), &mut observer)
        .await?;

    match report.exit {
        VmExit::Success => {}
        VmExit::Failed(Some(code)) => {
            printer.warn(format_args!("VM {} exited with status {code}", report.version))
        }
        VmExit::Failed(None) => {
            printer.warn(format_args!("VM {} was terminated by a signal", report.version))
        }
        VmExit::Interrupted => printer.warn("Interrupted; VM stopped."),
    }
    Ok(())
}

/// Renders session progress: a spinner while compiling, then a launch line.
struct TerminalObserver<'a> {
    printer: &'a Printer,
    spinner: Option<ProgressBar>,
}

impl<'a> TerminalObserver<'a> {
    fn new(printer: &'a Printer) -> Self {
        Self {
            printer,
            spinner: None,
        }
    }

    fn clear_spinner(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
    }
}

impl SessionObserver for TerminalObserver<'_> {
    fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Compiling => {
                self.printer.info("\u{2692}\u{fe0f}  Compiling config...");
                let spinner = ProgressBar::new_spinner();
                if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
                    spinner.set_style(style);
                }
                spinner.set_message("running transpiler");
                spinner.enable_steady_tick(Duration::from_millis(100));
                self.spinner = Some(spinner);
            }
            SessionEvent::Compiled => self.clear_spinner(),
            SessionEvent::Launching { version } => {
                self.clear_spinner();
                self.printer
                    .info(format_args!("\u{1f680} Launching image {version}!"));
            }
        }
    }
}

impl Drop for TerminalObserver<'_> {
    fn drop(&mut self) {
        self.clear_spinner();
    }
}
