use clap::Parser;

use fcosctl::cli::Cli;
use fcosctl::commands;
use fcosctl::logging;
use fcosctl::output::Printer;

#[tokio::main(flavor = "current_thread")]
async fn main() -> miette::Result<()> {
    // Usage errors are user errors: exit 1, not clap's default 2.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    logging::init(cli.verbose);
    let printer = Printer::detect();

    match commands::dispatch(cli, &printer).await {
        Ok(()) => Ok(()),
        // Broken invariants abort instead of taking the exit-1 path.
        Err(e) if e.is_fatal() => panic!("{:?}", miette::Report::new(e)),
        Err(e) => Err(e.into()),
    }
}
