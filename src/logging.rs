use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Default directive: only warnings, so normal runs stay quiet while the VM
/// owns the terminal.
const DEFAULT_DIRECTIVE: &str = "fcosctl=warn";
const VERBOSE_DIRECTIVE: &str = "fcosctl=debug";

/// Install the stderr tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `--verbose` selects debug output.
pub fn init(verbose: bool) {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = EnvFilter::new(directives(verbose, rust_log.as_deref()));

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter);

    tracing_subscriber::registry().with(terminal_layer).init();
}

fn directives(verbose: bool, rust_log: Option<&str>) -> String {
    match rust_log {
        Some(env) if !env.trim().is_empty() => env.to_string(),
        _ if verbose => VERBOSE_DIRECTIVE.to_string(),
        _ => DEFAULT_DIRECTIVE.to_string(),
    }
}
