use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = recapctl::Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = recapctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
